//! Request/response correlation over the notification stream.
//!
//! The protocol is strictly request-then-wait, so every exchange needs exactly
//! one answer. [`arm`] subscribes to the response endpoint *before* the request
//! is written; [`PendingResponse::wait`] consumes the subscription and yields
//! the first frame or [`Notification::TimedOut`].
//!
//! A subscription belongs to one exchange: it is consumed by `wait` and a new
//! one is armed for the next request, so a frame meant for an earlier exchange
//! cannot resolve a later one.

use crate::protocol::ResponseCode;
use crate::protocol::frame::decode_single_byte_response;
use crate::transport::FrameSource;
use log::{trace, warn};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

/// Timeout for Begin, window and End exchanges.
pub const TRANSFER_TIMEOUT: Duration = Duration::from_millis(6000);

/// Timeout for the Abort exchange.
pub const ABORT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Outcome of waiting for one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A frame arrived.
    Frame(Vec<u8>),
    /// Nothing arrived in time.
    TimedOut,
}

impl Notification {
    /// Response code of a single-byte answer.
    ///
    /// A timeout, and an empty frame, both read as [`ResponseCode::TimeOut`]
    /// so callers treat silence like any other device failure.
    pub fn response_code(&self) -> ResponseCode {
        match self {
            Self::Frame(frame) => decode_single_byte_response(frame).unwrap_or(ResponseCode::TimeOut),
            Self::TimedOut => ResponseCode::TimeOut,
        }
    }
}

/// A subscription waiting for the answer to one request.
#[derive(Debug)]
pub struct PendingResponse {
    rx: broadcast::Receiver<Vec<u8>>,
}

/// Subscribe for the answer to the next request.
pub fn arm<S: FrameSource>(source: &S) -> PendingResponse {
    PendingResponse {
        rx: source.subscribe(),
    }
}

impl PendingResponse {
    /// Wait for the first frame, or until `timeout` expires.
    pub async fn wait(mut self, timeout: Duration) -> Notification {
        let received = tokio::time::timeout(timeout, async {
            loop {
                match self.rx.recv().await {
                    Ok(frame) => return Some(frame),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Response stream lagged, {skipped} frames dropped");
                    },
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .await;

        match received {
            Ok(Some(frame)) => {
                trace!("Received response: {frame:02X?}");
                Notification::Frame(frame)
            },
            Ok(None) => {
                warn!("Response stream closed while waiting");
                Notification::TimedOut
            },
            Err(_) => {
                warn!("No response within {} ms", timeout.as_millis());
                Notification::TimedOut
            },
        }
    }
}
