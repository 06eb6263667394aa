//! Engine configuration.

use crate::correlator::{ABORT_TIMEOUT, TRANSFER_TIMEOUT};
use std::time::Duration;

/// Timeouts used by the OTA engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OtaConfig {
    /// Wait for the Begin, window and End answers.
    pub transfer_timeout: Duration,
    /// Wait for the Abort answer.
    pub abort_timeout: Duration,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            transfer_timeout: TRANSFER_TIMEOUT,
            abort_timeout: ABORT_TIMEOUT,
        }
    }
}

impl OtaConfig {
    /// Set the transfer timeout.
    #[must_use]
    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    /// Set the abort timeout.
    #[must_use]
    pub fn with_abort_timeout(mut self, timeout: Duration) -> Self {
        self.abort_timeout = timeout;
        self
    }
}
