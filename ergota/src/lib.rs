//! # ergota
//!
//! Over-the-air firmware update engine for BLE rowing ergometer monitors.
//!
//! This crate implements the host side of the OTA protocol spoken over a
//! characteristic pair (one write path, one notify path):
//!
//! - Frame encoding and decoding for Begin, Package, End and Abort
//! - Window planning from the negotiated `attr` and `buffer` parameters
//! - Request/response correlation with timeouts
//! - MD5 integrity digest
//! - Cooperative cancellation and device-side abort
//! - A simulated peripheral for tests and dry runs
//!
//! The engine is transport-agnostic: plug any BLE stack in by implementing
//! [`FrameSink`] and [`FrameSource`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use ergota::sim::{SimConfig, SimulatedDevice};
//! use ergota::{FirmwareImage, OtaEngine, UpdateOutcome};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = FirmwareImage::from_file("firmware.bin")?;
//!
//!     let device = Arc::new(SimulatedDevice::new(SimConfig::default()));
//!     let engine = Arc::new(OtaEngine::new(Arc::clone(&device), Arc::clone(&device)));
//!
//!     let mut progress = engine.subscribe_progress();
//!     tokio::spawn(async move {
//!         while progress.changed().await.is_ok() {
//!             println!("{} bytes sent", *progress.borrow_and_update());
//!         }
//!     });
//!
//!     match engine.perform_update(image.as_bytes()).await {
//!         Ok(UpdateOutcome::Completed) => println!("Update installed"),
//!         Ok(UpdateOutcome::Cancelled) => println!("Update cancelled"),
//!         Err(ergota::Error::Ota(e)) => println!("Update failed: {}", e.user_message()),
//!         Err(e) => return Err(e.into()),
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cancel;
pub mod config;
pub mod correlator;
pub mod engine;
pub mod error;
pub mod image;
pub mod plan;
pub mod protocol;
pub mod sim;
pub mod transport;

pub use cancel::CancelToken;
pub use config::OtaConfig;
pub use engine::{OtaEngine, SessionState, UpdateOutcome};
pub use error::{Error, ErrorDetail, ErrorKind, OtaError, Result};
pub use image::FirmwareImage;
pub use plan::{TransferPlan, Window};
pub use protocol::{ImageDigest, RequestOpcode, ResponseCode};
pub use transport::{FrameSink, FrameSource, TransportError};
