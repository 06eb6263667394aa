//! OTA session orchestration.
//!
//! [`OtaEngine`] drives one update over a [`FrameSink`] / [`FrameSource`]
//! pair:
//!
//! ```text
//! Idle -> Begun -> Transferring -> Ending -> Completed
//!   \        \            \           \
//!    +--------+------------+-----------+---> Errored
//!
//! (any) --abort_update--> Aborting -> Aborted
//! ```
//!
//! 1. **Begin**: announce the image size, receive `attr` and `buffer`.
//! 2. **Transfer**: send the image window by window. Every window except the
//!    last is acknowledged by the device.
//! 3. **End**: send the MD5 digest; the device verifies and installs.
//!
//! `abort_update` can be called from another task at any time. It cancels the
//! running transfer (which then returns [`UpdateOutcome::Cancelled`]), waits
//! for it to collect any answer still owed by the device, and sends an Abort
//! frame.
//!
//! ## Example
//!
//! ```rust,no_run
//! use ergota::sim::{SimConfig, SimulatedDevice};
//! use ergota::{OtaEngine, UpdateOutcome};
//! use std::sync::Arc;
//!
//! # async fn run() -> ergota::Result<()> {
//! let device = Arc::new(SimulatedDevice::new(SimConfig::default()));
//! let engine = OtaEngine::new(Arc::clone(&device), Arc::clone(&device));
//!
//! let firmware = std::fs::read("firmware.bin")?;
//! match engine.perform_update(&firmware).await? {
//!     UpdateOutcome::Completed => println!("installed {} bytes", engine.progress()),
//!     UpdateOutcome::Cancelled => println!("cancelled"),
//! }
//! # Ok(())
//! # }
//! ```

use crate::cancel::CancelToken;
use crate::config::OtaConfig;
use crate::correlator::{self, Notification};
use crate::error::{Error, ErrorDetail, ErrorKind, OtaError, Result};
use crate::plan::TransferPlan;
use crate::protocol::frame::{self, BeginResponse};
use crate::protocol::{RequestOpcode, ResponseCode, digest_hex, image_digest};
use crate::transport::{FrameSink, FrameSource, TransportError};
use log::{debug, info, trace, warn};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;

/// Phase of the current or most recent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    /// No session has run yet, or a new one is starting.
    #[default]
    Idle,
    /// The device accepted Begin.
    Begun,
    /// Packages are being sent.
    Transferring,
    /// The digest was sent, waiting for install.
    Ending,
    /// The device installed the image.
    Completed,
    /// A phase failed.
    Errored,
    /// An abort is in flight.
    Aborting,
    /// The device confirmed the abort.
    Aborted,
}

impl SessionState {
    /// Whether no further transition happens without a new call.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Errored | Self::Aborted)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Begun => "begun",
            Self::Transferring => "transferring",
            Self::Ending => "ending",
            Self::Completed => "completed",
            Self::Errored => "errored",
            Self::Aborting => "aborting",
            Self::Aborted => "aborted",
        })
    }
}

/// How a successful `perform_update` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum UpdateOutcome {
    /// The device verified and installed the image.
    Completed,
    /// The transfer was cancelled by `abort_update`.
    Cancelled,
}

/// OTA protocol engine.
///
/// Generic over the two transport handles. The engine is `Sync`; share it
/// behind an `Arc` to call [`abort_update`](Self::abort_update) while
/// [`perform_update`](Self::perform_update) runs on another task.
///
/// Only one update and one abort may run at a time; overlapping calls fail
/// with [`Error::SessionBusy`] without touching the device. An update cannot
/// start while an abort is in flight.
pub struct OtaEngine<S, R> {
    sink: S,
    source: R,
    config: OtaConfig,
    progress: watch::Sender<usize>,
    state: watch::Sender<SessionState>,
    slots: watch::Sender<Slots>,
    listeners: AtomicUsize,
    switching: tokio::sync::Mutex<()>,
}

/// Update and abort claims, changed together under the channel lock.
#[derive(Debug, Default)]
struct Slots {
    session: Option<CancelToken>,
    aborting: bool,
}

impl<S: FrameSink, R: FrameSource> OtaEngine<S, R> {
    /// Create an engine over a send and a response endpoint.
    pub fn new(sink: S, source: R) -> Self {
        Self {
            sink,
            source,
            config: OtaConfig::default(),
            progress: watch::channel(0).0,
            state: watch::channel(SessionState::Idle).0,
            slots: watch::channel(Slots::default()).0,
            listeners: AtomicUsize::new(0),
            switching: tokio::sync::Mutex::new(()),
        }
    }

    /// Replace the configuration.
    #[must_use]
    pub fn with_config(mut self, config: OtaConfig) -> Self {
        self.config = config;
        self
    }

    /// Current configuration.
    pub fn config(&self) -> &OtaConfig {
        &self.config
    }

    /// Get a reference to the send endpoint.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Get a reference to the response endpoint.
    pub fn source(&self) -> &R {
        &self.source
    }

    /// Bytes handed to the transport so far.
    ///
    /// Advances after each window is written, before the device acknowledges
    /// it, so the value tracks what was sent rather than what was confirmed.
    pub fn progress(&self) -> usize {
        *self.progress.borrow()
    }

    /// Watch progress changes.
    pub fn subscribe_progress(&self) -> watch::Receiver<usize> {
        self.progress.subscribe()
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch session state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Whether an update is running.
    pub fn is_updating(&self) -> bool {
        self.slots.borrow().session.is_some()
    }

    /// Push `firmware` to the device.
    ///
    /// Resolves with [`UpdateOutcome::Completed`] once the device installed
    /// the image, or [`UpdateOutcome::Cancelled`] if `abort_update` stopped the
    /// transfer. Device rejections and transport failures are reported as
    /// [`Error::Ota`] with the kind of the phase they happened in.
    pub async fn perform_update(&self, firmware: &[u8]) -> Result<UpdateOutcome> {
        let size = u32::try_from(firmware.len()).map_err(|_| {
            Error::InvalidFirmware(format!(
                "{} bytes does not fit the 32-bit size field",
                firmware.len()
            ))
        })?;

        let mut session = self.claim_session()?;
        let token = session.token.clone();

        self.progress.send_replace(0);
        self.set_state(SessionState::Idle);
        info!("Starting OTA update ({size} bytes)");

        let lease = match self.acquire_notifications().await {
            Ok(lease) => lease,
            Err(e) => {
                warn!("Could not enable notifications: {e}");
                self.advance(&token, SessionState::Errored);
                session.finished = true;
                return Err(OtaError::unknown(ErrorKind::Begin).into());
            },
        };

        let result = match self.run_update(firmware, size, &token).await {
            Err(err) if token.is_cancelled() => {
                debug!("Ignoring {err} after cancellation");
                Ok(UpdateOutcome::Cancelled)
            },
            other => other,
        };

        self.release_notifications(lease).await;

        match &result {
            Ok(UpdateOutcome::Completed) => {
                self.progress.send_replace(firmware.len());
                self.set_state(SessionState::Completed);
                info!("OTA update complete");
            },
            Ok(UpdateOutcome::Cancelled) => {
                info!("OTA update cancelled");
            },
            Err(err) => {
                warn!("OTA update failed: {err}");
                self.advance(&token, SessionState::Errored);
            },
        }

        session.finished = true;
        result.map_err(Error::from)
    }

    /// Abort the update.
    ///
    /// Cancels the running transfer, if any, so no further packages go out,
    /// and lets it collect the answer it is waiting for. Then sends Abort and
    /// waits for the device. On success progress drops to 0.
    ///
    /// If the device installs the image before the transfer notices the
    /// cancellation, the update stands and no Abort is sent.
    pub async fn abort_update(&self) -> Result<()> {
        let (_abort, active) = self.claim_abort()?;

        if let Some(token) = active {
            info!("Cancelling transfer in progress");
            token.cancel();
            self.set_state(SessionState::Aborting);
            self.session_released().await;

            if self.state() == SessionState::Completed {
                info!("Update was installed before the abort took effect");
                return Ok(());
            }
        } else {
            self.set_state(SessionState::Aborting);
        }

        let result = self.send_abort().await;

        match &result {
            Ok(()) => {
                self.progress.send_replace(0);
                self.set_state(SessionState::Aborted);
                info!("OTA update aborted");
            },
            Err(err) => {
                warn!("Abort failed: {err}");
                self.set_state(SessionState::Errored);
            },
        }

        result.map_err(Error::from)
    }

    /// Begin, transfer and End.
    async fn run_update(
        &self,
        firmware: &[u8],
        size: u32,
        token: &CancelToken,
    ) -> std::result::Result<UpdateOutcome, OtaError> {
        let negotiated = self.begin(size).await?;
        if token.is_cancelled() {
            return Ok(UpdateOutcome::Cancelled);
        }
        self.advance(token, SessionState::Begun);

        let plan = TransferPlan::new(firmware.len(), negotiated.attr, negotiated.buffer)
            .ok_or_else(|| {
                warn!("Device granted a zero package size");
                OtaError::new(ErrorKind::Begin, ErrorDetail::Malformed)
            })?;

        info!(
            "Device accepted update: attr={} buffer={} ({} packages in {} windows)",
            negotiated.attr,
            negotiated.buffer,
            plan.package_count(),
            plan.window_count()
        );
        self.advance(token, SessionState::Transferring);

        for window in plan.windows() {
            // Arm before the first write so a fast acknowledgment is not lost.
            let pending = (!window.is_last()).then(|| correlator::arm(&self.source));

            for package in window.packages(firmware) {
                if token.is_cancelled() {
                    return Ok(UpdateOutcome::Cancelled);
                }
                self.write(&frame::encode_package(package), ErrorKind::Package)
                    .await?;
            }

            let sent = window.bytes.end;
            self.progress.send_if_modified(|progress| {
                if token.is_cancelled() {
                    return false;
                }
                *progress = sent;
                true
            });
            debug!(
                "Window {} sent: {} packages, {sent}/{} bytes",
                window.index,
                window.package_count(),
                firmware.len()
            );

            // A full window is always acknowledged, so collect the answer even
            // when cancelled. Otherwise the Abort exchange would read it.
            if let Some(pending) = pending {
                let code = pending
                    .wait(self.config.transfer_timeout)
                    .await
                    .response_code();
                if !code.is_ok() {
                    warn!("Window {} rejected: {code}", window.index);
                    return Err(OtaError::response(ErrorKind::Package, code));
                }
                trace!("Window {} acknowledged", window.index);
            }
            if token.is_cancelled() {
                return Ok(UpdateOutcome::Cancelled);
            }
        }

        self.advance(token, SessionState::Ending);

        let digest = image_digest(firmware);
        debug!("Sending End with digest {}", digest_hex(&digest));
        let code = self
            .exchange(
                &frame::encode_end(&digest),
                self.config.transfer_timeout,
                ErrorKind::Install,
            )
            .await?
            .response_code();

        // An installed image stands even if an abort arrived meanwhile.
        if !code.is_ok() {
            warn!("Install rejected: {code}");
            return Err(OtaError::response(ErrorKind::Install, code));
        }

        Ok(UpdateOutcome::Completed)
    }

    /// Announce the image and read back the transfer parameters.
    async fn begin(&self, size: u32) -> std::result::Result<BeginResponse, OtaError> {
        let notification = self
            .exchange(
                &frame::encode_begin(size),
                self.config.transfer_timeout,
                ErrorKind::Begin,
            )
            .await?;

        match notification {
            Notification::Frame(bytes) => frame::decode_begin_response(&bytes),
            Notification::TimedOut => Err(OtaError::response(
                ErrorKind::Begin,
                ResponseCode::TimeOut,
            )),
        }
    }

    /// Send Abort and check the answer.
    async fn send_abort(&self) -> std::result::Result<(), OtaError> {
        let lease = self.acquire_notifications().await.map_err(|e| {
            warn!("Could not enable notifications: {e}");
            OtaError::unknown(ErrorKind::Abort)
        })?;

        let result = self
            .exchange(
                &frame::encode_abort(),
                self.config.abort_timeout,
                ErrorKind::Abort,
            )
            .await;
        self.release_notifications(lease).await;

        let code = result?.response_code();
        if code.is_ok() {
            Ok(())
        } else {
            Err(OtaError::response(ErrorKind::Abort, code))
        }
    }

    /// Write `request` and wait for the answer.
    async fn exchange(
        &self,
        request: &[u8],
        timeout: Duration,
        kind: ErrorKind,
    ) -> std::result::Result<Notification, OtaError> {
        let pending = correlator::arm(&self.source);
        self.write(request, kind).await?;
        Ok(pending.wait(timeout).await)
    }

    /// Write one frame, classifying transport failures under `kind`.
    async fn write(&self, frame: &[u8], kind: ErrorKind) -> std::result::Result<(), OtaError> {
        trace!(
            "Writing {:?} frame ({} bytes)",
            frame.first().copied().and_then(RequestOpcode::from_byte),
            frame.len()
        );

        self.sink.write(frame).await.map_err(|e| {
            warn!("Transport failure during {kind}: {e}");
            OtaError::unknown(kind)
        })
    }

    /// Enable notifications for the first concurrent user.
    async fn acquire_notifications(
        &self,
    ) -> std::result::Result<NotificationLease<'_>, TransportError> {
        let _switching = self.switching.lock().await;
        if self.listeners.load(Ordering::Acquire) == 0 {
            self.source.start_notifications().await?;
            debug!("Notifications enabled");
        }
        self.listeners.fetch_add(1, Ordering::AcqRel);
        Ok(NotificationLease(&self.listeners))
    }

    /// Give the lease back and disable notifications once the last user is done.
    async fn release_notifications(&self, lease: NotificationLease<'_>) {
        let _switching = self.switching.lock().await;
        drop(lease);
        if self.listeners.load(Ordering::Acquire) == 0 {
            match self.source.stop_notifications().await {
                Ok(()) => debug!("Notifications disabled"),
                Err(e) => warn!("Could not disable notifications: {e}"),
            }
        }
    }

    fn claim_session(&self) -> Result<ActiveSession<'_>> {
        let token = CancelToken::new();
        let mut busy = None;
        self.slots.send_if_modified(|slots| {
            if slots.aborting {
                busy = Some("abort");
            } else if slots.session.is_some() {
                busy = Some("update");
            } else {
                slots.session = Some(token.clone());
            }
            busy.is_none()
        });
        if let Some(running) = busy {
            return Err(Error::SessionBusy(running));
        }

        Ok(ActiveSession {
            slots: &self.slots,
            state: &self.state,
            token,
            finished: false,
        })
    }

    /// Claim the abort slot and take the running session's token, if any.
    fn claim_abort(&self) -> Result<(AbortInFlight<'_>, Option<CancelToken>)> {
        let mut claimed = None;
        self.slots.send_if_modified(|slots| {
            if slots.aborting {
                return false;
            }
            slots.aborting = true;
            claimed = Some(slots.session.clone());
            true
        });

        let active = claimed.ok_or(Error::SessionBusy("abort"))?;
        Ok((AbortInFlight(&self.slots), active))
    }

    /// Wait until the running update has given up its slot.
    async fn session_released(&self) {
        let mut slots = self.slots.subscribe();
        if slots.wait_for(|slots| slots.session.is_none()).await.is_err() {
            debug!("Session slot closed");
        }
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Session state: {previous} -> {state}");
        }
    }

    /// Move the session forward unless it was cancelled meanwhile.
    fn advance(&self, token: &CancelToken, state: SessionState) {
        advance_state(&self.state, token, state);
    }
}

fn advance_state(state: &watch::Sender<SessionState>, token: &CancelToken, next: SessionState) {
    state.send_if_modified(|current| {
        if token.is_cancelled() || *current == next {
            return false;
        }
        debug!("Session state: {current} -> {next}");
        *current = next;
        true
    });
}

/// Claim on the engine's update slot, released on drop.
///
/// A session dropped before `finished` is set was abandoned mid-flight and
/// ends as `Errored`.
struct ActiveSession<'a> {
    slots: &'a watch::Sender<Slots>,
    state: &'a watch::Sender<SessionState>,
    token: CancelToken,
    finished: bool,
}

impl Drop for ActiveSession<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!("OTA update dropped before it finished");
            advance_state(self.state, &self.token, SessionState::Errored);
        }
        self.slots.send_modify(|slots| slots.session = None);
    }
}

/// Claim on the engine's abort slot, released on drop.
struct AbortInFlight<'a>(&'a watch::Sender<Slots>);

impl Drop for AbortInFlight<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|slots| slots.aborting = false);
    }
}

/// One user of the notification stream.
///
/// Dropping a lease without `release_notifications` only gives
/// the count back; notifications then stay on until the next user releases.
struct NotificationLease<'a>(&'a AtomicUsize);

impl Drop for NotificationLease<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
