//! Transport abstraction for the OTA characteristic pair.
//!
//! The engine talks to the device through two handles:
//!
//! ```text
//!            write (no response)
//! +--------+ ------------------> +-----------+
//! | engine |                     |  device   |
//! +--------+ <------------------ +-----------+
//!            notifications
//! ```
//!
//! - [`FrameSink`]: the send characteristic, fire-and-forget writes.
//! - [`FrameSource`]: the response characteristic, fanned out to subscribers.
//!
//! How the handles were obtained (scanning, pairing, reconnecting) is up to the
//! embedding application.

use std::future::Future;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Error raised by a transport handle.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The link to the device is gone.
    #[error("Device disconnected")]
    Disconnected,

    /// A write was refused by the stack.
    #[error("Write failed: {0}")]
    Write(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Send endpoint: writes frames to the device.
pub trait FrameSink: Send + Sync {
    /// Write one frame without waiting for a device response.
    fn write(&self, frame: &[u8]) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Response endpoint: notification frames coming from the device.
pub trait FrameSource: Send + Sync {
    /// Enable notifications on the response characteristic.
    fn start_notifications(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Disable notifications on the response characteristic.
    fn stop_notifications(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Subscribe to notification frames.
    ///
    /// The receiver only observes frames published after this call.
    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>>;
}

impl<T: FrameSink> FrameSink for Arc<T> {
    fn write(&self, frame: &[u8]) -> impl Future<Output = Result<(), TransportError>> + Send {
        (**self).write(frame)
    }
}

impl<T: FrameSource> FrameSource for Arc<T> {
    fn start_notifications(&self) -> impl Future<Output = Result<(), TransportError>> + Send {
        (**self).start_notifications()
    }

    fn stop_notifications(&self) -> impl Future<Output = Result<(), TransportError>> + Send {
        (**self).stop_notifications()
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        (**self).subscribe()
    }
}
