//! In-process simulated OTA peripheral.
//!
//! [`SimulatedDevice`] implements both transport traits and answers frames the
//! way the ergometer firmware does: it negotiates `attr`/`buffer` on Begin,
//! acknowledges every full window except the last, and verifies the MD5
//! digest on End. Faults can be injected to rehearse error paths.
//!
//! Every frame written is recorded and can be inspected afterwards.

use crate::protocol::frame::{self, BEGIN_REQUEST_LEN};
use crate::protocol::{DIGEST_LEN, RequestOpcode, ResponseCode, image_digest};
use crate::transport::{FrameSink, FrameSource, TransportError};
use log::{debug, trace};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

/// Default package size, a 512-byte ATT MTU minus the 3-byte header.
pub const DEFAULT_ATTR: u32 = 509;

/// Default receive buffer, 16 packages.
pub const DEFAULT_BUFFER: u32 = DEFAULT_ATTR * 16;

/// Default largest image accepted, the size of one OTA partition.
pub const DEFAULT_MAX_IMAGE_SIZE: u32 = 0x1E_0000;

const NOTIFY_CAPACITY: usize = 64;

/// Injected misbehavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Answer Begin with NotOk.
    RejectBegin,
    /// Answer Begin with a bare status byte.
    MalformedBegin,
    /// Never answer Begin.
    SilentBegin,
    /// Answer the nth window acknowledgment (0-based, device lifetime) with NotOk.
    RejectWindow(usize),
    /// Withhold the nth window acknowledgment.
    SilentWindow(usize),
    /// Fail digest verification on End.
    CorruptChecksum,
    /// Fail flash write on End.
    StorageError,
    /// Answer Abort with NotOk.
    RejectAbort,
    /// Never answer Abort.
    SilentAbort,
    /// Fail every write once this many frames were received.
    Disconnect(usize),
}

/// Simulated device settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimConfig {
    /// Package size granted on Begin.
    pub attr: u32,
    /// Receive buffer granted on Begin.
    pub buffer: u32,
    /// Largest image accepted on Begin.
    pub max_image_size: u32,
    /// Delay before each notification is published.
    pub reply_delay: Duration,
    /// Injected fault, if any.
    pub fault: Option<Fault>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            attr: DEFAULT_ATTR,
            buffer: DEFAULT_BUFFER,
            max_image_size: DEFAULT_MAX_IMAGE_SIZE,
            reply_delay: Duration::ZERO,
            fault: None,
        }
    }
}

impl SimConfig {
    fn packages_per_window(&self) -> usize {
        self.buffer
            .checked_div(self.attr)
            .map_or(1, |ppw| ppw.max(1) as usize)
    }
}

/// An image being received.
#[derive(Debug)]
struct Reception {
    expected: usize,
    data: Vec<u8>,
    since_ack: usize,
}

#[derive(Debug, Default)]
struct DeviceState {
    frames: Vec<Vec<u8>>,
    reception: Option<Reception>,
    installed: Option<Vec<u8>>,
    window_acks: usize,
}

/// Simulated OTA peripheral.
///
/// Share it behind an `Arc` and hand one clone to the engine as sink and one
/// as source.
#[derive(Debug)]
pub struct SimulatedDevice {
    config: SimConfig,
    tx: broadcast::Sender<Vec<u8>>,
    notifying: Arc<AtomicBool>,
    state: Mutex<DeviceState>,
}

impl SimulatedDevice {
    /// Create a device with the given settings.
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            tx: broadcast::channel(NOTIFY_CAPACITY).0,
            notifying: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(DeviceState::default()),
        }
    }

    /// Device settings.
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Every frame received, in order.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.lock().frames.clone()
    }

    /// Number of frames received with the given opcode.
    pub fn count(&self, opcode: RequestOpcode) -> usize {
        let opcode = u8::from(opcode);
        self.lock()
            .frames
            .iter()
            .filter(|frame| frame.first() == Some(&opcode))
            .count()
    }

    /// Number of window acknowledgments sent or withheld so far.
    pub fn window_acks(&self) -> usize {
        self.lock().window_acks
    }

    /// Bytes received in the current session.
    pub fn received_bytes(&self) -> usize {
        self.lock().reception.as_ref().map_or(0, |rx| rx.data.len())
    }

    /// Whether a session is open on the device.
    pub fn is_receiving(&self) -> bool {
        self.lock().reception.is_some()
    }

    /// The last image that passed verification.
    pub fn installed_image(&self) -> Option<Vec<u8>> {
        self.lock().installed.clone()
    }

    /// Whether notifications are enabled.
    pub fn is_notifying(&self) -> bool {
        self.notifying.load(Ordering::Acquire)
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self, state: &mut DeviceState, frame: &[u8]) -> Option<Vec<u8>> {
        let Some((&opcode, payload)) = frame.split_first() else {
            return Some(status(ResponseCode::IncorrectFormat));
        };

        match RequestOpcode::from_byte(opcode) {
            Some(RequestOpcode::Begin) => self.on_begin(state, frame),
            Some(RequestOpcode::Package) => self.on_package(state, payload),
            Some(RequestOpcode::End) => self.on_end(state, payload),
            Some(RequestOpcode::Abort) => self.on_abort(state),
            None => {
                debug!("Simulator: unknown opcode 0x{opcode:02X}");
                Some(status(ResponseCode::IncorrectFormat))
            },
        }
    }

    fn on_begin(&self, state: &mut DeviceState, frame: &[u8]) -> Option<Vec<u8>> {
        match self.config.fault {
            Some(Fault::RejectBegin) => return Some(begin_status(ResponseCode::NotOk)),
            Some(Fault::MalformedBegin) => return Some(status(ResponseCode::Ok)),
            Some(Fault::SilentBegin) => return None,
            _ => {},
        }

        if frame.len() != BEGIN_REQUEST_LEN {
            return Some(begin_status(ResponseCode::IncorrectFormat));
        }
        let size = frame::decode_begin_size(frame).unwrap_or(0);
        if size == 0 || size > self.config.max_image_size {
            debug!("Simulator: rejecting image of {size} bytes");
            return Some(begin_status(ResponseCode::IncorrectFirmwareSize));
        }

        debug!("Simulator: receiving {size} bytes");
        state.reception = Some(Reception {
            expected: size as usize,
            data: Vec::with_capacity(size as usize),
            since_ack: 0,
        });
        Some(frame::encode_begin_response(
            ResponseCode::Ok,
            self.config.attr,
            self.config.buffer,
        ))
    }

    fn on_package(&self, state: &mut DeviceState, payload: &[u8]) -> Option<Vec<u8>> {
        let Some(rx) = state.reception.as_mut() else {
            return Some(status(ResponseCode::NotOk));
        };

        if payload.is_empty() || payload.len() > self.config.attr as usize {
            state.reception = None;
            return Some(status(ResponseCode::IncorrectFormat));
        }
        if rx.data.len() + payload.len() > rx.expected {
            state.reception = None;
            return Some(status(ResponseCode::IncorrectFirmwareSize));
        }

        rx.data.extend_from_slice(payload);
        rx.since_ack += 1;

        // The final window is answered by End, not by an acknowledgment.
        if rx.data.len() == rx.expected || rx.since_ack < self.config.packages_per_window() {
            return None;
        }
        rx.since_ack = 0;

        let window = state.window_acks;
        state.window_acks += 1;
        trace!("Simulator: window {window} complete");

        match self.config.fault {
            Some(Fault::RejectWindow(n)) if n == window => Some(status(ResponseCode::NotOk)),
            Some(Fault::SilentWindow(n)) if n == window => None,
            _ => Some(status(ResponseCode::Ok)),
        }
    }

    fn on_end(&self, state: &mut DeviceState, payload: &[u8]) -> Option<Vec<u8>> {
        let Some(rx) = state.reception.take() else {
            return Some(status(ResponseCode::NotOk));
        };

        if payload.len() != DIGEST_LEN {
            return Some(status(ResponseCode::IncorrectFormat));
        }
        if rx.data.len() != rx.expected {
            return Some(status(ResponseCode::IncorrectFirmwareSize));
        }

        match self.config.fault {
            Some(Fault::CorruptChecksum) => return Some(status(ResponseCode::ChecksumError)),
            Some(Fault::StorageError) => return Some(status(ResponseCode::InternalStorageError)),
            _ => {},
        }
        if image_digest(&rx.data)[..] != payload[..] {
            debug!("Simulator: digest mismatch");
            return Some(status(ResponseCode::ChecksumError));
        }

        debug!("Simulator: installed {} bytes", rx.data.len());
        state.installed = Some(rx.data);
        Some(status(ResponseCode::Ok))
    }

    fn on_abort(&self, state: &mut DeviceState) -> Option<Vec<u8>> {
        match self.config.fault {
            Some(Fault::RejectAbort) => Some(status(ResponseCode::NotOk)),
            Some(Fault::SilentAbort) => None,
            _ => {
                if state.reception.take().is_some() {
                    debug!("Simulator: session aborted");
                }
                Some(status(ResponseCode::Ok))
            },
        }
    }

    fn notify(&self, response: Vec<u8>) {
        if self.config.reply_delay.is_zero() {
            publish(&self.tx, &self.notifying, response);
            return;
        }

        let tx = self.tx.clone();
        let notifying = Arc::clone(&self.notifying);
        let delay = self.config.reply_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            publish(&tx, &notifying, response);
        });
    }
}

impl FrameSink for SimulatedDevice {
    async fn write(&self, frame: &[u8]) -> Result<(), TransportError> {
        let response = {
            let mut state = self.lock();
            if let Some(Fault::Disconnect(after)) = self.config.fault {
                if state.frames.len() >= after {
                    return Err(TransportError::Disconnected);
                }
            }
            state.frames.push(frame.to_vec());
            self.handle(&mut state, frame)
        };

        if let Some(response) = response {
            self.notify(response);
        }
        Ok(())
    }
}

impl FrameSource for SimulatedDevice {
    async fn start_notifications(&self) -> Result<(), TransportError> {
        self.notifying.store(true, Ordering::Release);
        Ok(())
    }

    async fn stop_notifications(&self) -> Result<(), TransportError> {
        self.notifying.store(false, Ordering::Release);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.tx.subscribe()
    }
}

fn publish(tx: &broadcast::Sender<Vec<u8>>, notifying: &AtomicBool, response: Vec<u8>) {
    if !notifying.load(Ordering::Acquire) {
        trace!("Simulator: notifications off, dropping {response:02X?}");
        return;
    }
    // No receiver means nobody is waiting; the frame is lost like on air.
    let _ = tx.send(response);
}

fn status(code: ResponseCode) -> Vec<u8> {
    vec![code.as_byte()]
}

fn begin_status(code: ResponseCode) -> Vec<u8> {
    frame::encode_begin_response(code, 0, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(config: SimConfig) -> SimulatedDevice {
        let device = SimulatedDevice::new(config);
        device.notifying.store(true, Ordering::Release);
        device
    }

    async fn send(device: &SimulatedDevice, frame: &[u8]) -> Option<Vec<u8>> {
        let mut rx = device.subscribe();
        device.write(frame).await.unwrap();
        rx.try_recv().ok()
    }

    #[tokio::test]
    async fn test_begin_grants_parameters() {
        let device = device(SimConfig {
            attr: 20,
            buffer: 100,
            ..SimConfig::default()
        });

        let response = send(&device, &frame::encode_begin(64)).await.unwrap();
        let begin = frame::decode_begin_response(&response).unwrap();
        assert_eq!((begin.attr, begin.buffer), (20, 100));
        assert!(device.is_receiving());
    }

    #[tokio::test]
    async fn test_begin_rejects_bad_sizes() {
        let device = device(SimConfig {
            max_image_size: 100,
            ..SimConfig::default()
        });

        for size in [0, 101] {
            let response = send(&device, &frame::encode_begin(size)).await.unwrap();
            assert_eq!(response.len(), frame::BEGIN_RESPONSE_LEN);
            assert_eq!(response[0], ResponseCode::IncorrectFirmwareSize.as_byte());
        }
        assert!(!device.is_receiving());
    }

    #[tokio::test]
    async fn test_acknowledges_full_windows_only() {
        let device = device(SimConfig {
            attr: 4,
            buffer: 8,
            ..SimConfig::default()
        });
        send(&device, &frame::encode_begin(10)).await.unwrap();

        assert_eq!(send(&device, &frame::encode_package(&[1; 4])).await, None);
        assert_eq!(
            send(&device, &frame::encode_package(&[2; 4])).await,
            Some(vec![0x00])
        );
        // Last window: no acknowledgment.
        assert_eq!(send(&device, &frame::encode_package(&[3; 2])).await, None);
        assert_eq!(device.received_bytes(), 10);
        assert_eq!(device.window_acks(), 1);
    }

    #[tokio::test]
    async fn test_oversized_package_is_rejected() {
        let device = device(SimConfig {
            attr: 4,
            ..SimConfig::default()
        });
        send(&device, &frame::encode_begin(10)).await.unwrap();

        let response = send(&device, &frame::encode_package(&[0; 5])).await;
        assert_eq!(response, Some(vec![ResponseCode::IncorrectFormat.as_byte()]));
        assert!(!device.is_receiving());
    }

    #[tokio::test]
    async fn test_end_verifies_digest() {
        let device = device(SimConfig::default());
        let image = b"rowing monitor firmware".to_vec();

        send(&device, &frame::encode_begin(image.len() as u32)).await.unwrap();
        send(&device, &frame::encode_package(&image)).await;

        let wrong = image_digest(b"something else");
        let response = send(&device, &frame::encode_end(&wrong)).await;
        assert_eq!(response, Some(vec![ResponseCode::ChecksumError.as_byte()]));
        assert_eq!(device.installed_image(), None);

        send(&device, &frame::encode_begin(image.len() as u32)).await.unwrap();
        send(&device, &frame::encode_package(&image)).await;
        let response = send(&device, &frame::encode_end(&image_digest(&image))).await;
        assert_eq!(response, Some(vec![0x00]));
        assert_eq!(device.installed_image(), Some(image));
    }

    #[tokio::test]
    async fn test_end_before_all_bytes_is_size_error() {
        let device = device(SimConfig::default());
        send(&device, &frame::encode_begin(10)).await.unwrap();
        send(&device, &frame::encode_package(&[0; 5])).await;

        let response = send(&device, &frame::encode_end(&[0; DIGEST_LEN])).await;
        assert_eq!(
            response,
            Some(vec![ResponseCode::IncorrectFirmwareSize.as_byte()])
        );
    }

    #[tokio::test]
    async fn test_abort_discards_reception() {
        let device = device(SimConfig::default());
        send(&device, &frame::encode_begin(10)).await.unwrap();

        let response = send(&device, &frame::encode_abort()).await;
        assert_eq!(response, Some(vec![0x00]));
        assert!(!device.is_receiving());
    }

    #[tokio::test]
    async fn test_unknown_opcode() {
        let device = device(SimConfig::default());
        let response = send(&device, &[0x7F, 0x01]).await;
        assert_eq!(response, Some(vec![ResponseCode::IncorrectFormat.as_byte()]));
    }

    #[tokio::test]
    async fn test_silent_when_notifications_off() {
        let device = SimulatedDevice::new(SimConfig::default());
        assert_eq!(send(&device, &frame::encode_begin(10)).await, None);
        // The frame was still processed.
        assert!(device.is_receiving());
    }

    #[tokio::test]
    async fn test_disconnect_fault() {
        let device = device(SimConfig {
            fault: Some(Fault::Disconnect(1)),
            ..SimConfig::default()
        });
        device.write(&frame::encode_begin(10)).await.unwrap();

        let err = device.write(&frame::encode_abort()).await.unwrap_err();
        assert!(matches!(err, TransportError::Disconnected));
        assert_eq!(device.frames().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_delay() {
        let device = device(SimConfig {
            reply_delay: Duration::from_millis(250),
            ..SimConfig::default()
        });
        let mut rx = device.subscribe();
        device.write(&frame::encode_abort()).await.unwrap();
        assert!(rx.try_recv().is_err());

        let started = tokio::time::Instant::now();
        assert_eq!(rx.recv().await.unwrap(), vec![0x00]);
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[test]
    fn test_packages_per_window() {
        let config = |attr, buffer| SimConfig {
            attr,
            buffer,
            ..SimConfig::default()
        };
        assert_eq!(config(15, 100).packages_per_window(), 6);
        assert_eq!(config(100, 15).packages_per_window(), 1);
        assert_eq!(config(0, 15).packages_per_window(), 1);
    }
}
