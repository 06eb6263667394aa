//! OTA frame codec.
//!
//! Pure byte encoding and decoding, no I/O. All integers are little-endian.
//!
//! ## Requests
//!
//! ```text
//! Begin    +--------+-----------------+
//!          | 0x00   | image size (u32)|          5 bytes
//!          +--------+-----------------+
//! Package  +--------+-----------------+
//!          | 0x01   | payload         |          1 + 1..=attr bytes
//!          +--------+-----------------+
//! End      +--------+-----------------+
//!          | 0x02   | MD5 digest (16) |          17 bytes
//!          +--------+-----------------+
//! Abort    +--------+
//!          | 0x03   |                            1 byte
//!          +--------+
//! ```
//!
//! ## Responses
//!
//! ```text
//! Begin    +--------+------------+--------------+
//!          | code   | attr (u32) | buffer (u32) |  9 bytes
//!          +--------+------------+--------------+
//! others   +--------+
//!          | code   |                            1 byte
//!          +--------+
//! ```

use crate::error::{ErrorDetail, ErrorKind, OtaError};
use crate::protocol::digest::{DIGEST_LEN, ImageDigest};
use crate::protocol::opcode::{RequestOpcode, ResponseCode};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

/// Length of a Begin request.
pub const BEGIN_REQUEST_LEN: usize = 5;

/// Length of a Begin response.
pub const BEGIN_RESPONSE_LEN: usize = 9;

/// Length of an End request.
pub const END_REQUEST_LEN: usize = 1 + DIGEST_LEN;

/// Transfer parameters granted by the device in its Begin response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeginResponse {
    /// Maximum payload bytes per Package frame.
    pub attr: u32,
    /// Bytes the device buffers before it acknowledges.
    pub buffer: u32,
}

/// Encode a Begin request announcing an image of `size` bytes.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn encode_begin(size: u32) -> Vec<u8> {
    let mut frame = Vec::with_capacity(BEGIN_REQUEST_LEN);
    frame.push(RequestOpcode::Begin.into());
    frame.write_u32::<LittleEndian>(size).unwrap();
    frame
}

/// Read the image size back out of a Begin request.
pub fn decode_begin_size(frame: &[u8]) -> Option<u32> {
    if frame.len() != BEGIN_REQUEST_LEN || frame[0] != u8::from(RequestOpcode::Begin) {
        return None;
    }
    Some(LittleEndian::read_u32(&frame[1..5]))
}

/// Decode the device answer to Begin.
///
/// The answer is valid only if it is exactly 9 bytes long and starts with
/// `Ok`. The length is checked first, so a short answer is `malformed` even
/// when its first byte carries a failure code.
pub fn decode_begin_response(frame: &[u8]) -> Result<BeginResponse, OtaError> {
    if frame.len() != BEGIN_RESPONSE_LEN {
        return Err(OtaError::new(ErrorKind::Begin, ErrorDetail::Malformed));
    }

    let code = ResponseCode::from(frame[0]);
    if !code.is_ok() {
        return Err(OtaError::response(ErrorKind::Begin, code));
    }

    Ok(BeginResponse {
        attr: LittleEndian::read_u32(&frame[1..5]),
        buffer: LittleEndian::read_u32(&frame[5..9]),
    })
}

/// Encode a Begin response. Used by device-side code such as the simulator.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn encode_begin_response(code: ResponseCode, attr: u32, buffer: u32) -> Vec<u8> {
    let mut frame = Vec::with_capacity(BEGIN_RESPONSE_LEN);
    frame.push(code.as_byte());
    frame.write_u32::<LittleEndian>(attr).unwrap();
    frame.write_u32::<LittleEndian>(buffer).unwrap();
    frame
}

/// Encode a Package request carrying `chunk`.
///
/// The caller keeps `chunk` within the negotiated attribute size.
pub fn encode_package(chunk: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + chunk.len());
    frame.push(RequestOpcode::Package.into());
    frame.extend_from_slice(chunk);
    frame
}

/// Encode an End request carrying the image digest.
pub fn encode_end(digest: &ImageDigest) -> Vec<u8> {
    let mut frame = Vec::with_capacity(END_REQUEST_LEN);
    frame.push(RequestOpcode::End.into());
    frame.extend_from_slice(digest);
    frame
}

/// Encode an Abort request.
pub fn encode_abort() -> Vec<u8> {
    vec![RequestOpcode::Abort.into()]
}

/// Decode a one-byte answer (window ack, End, Abort).
///
/// Returns `None` for an empty frame; the caller applies its own fallback.
pub fn decode_single_byte_response(frame: &[u8]) -> Option<ResponseCode> {
    frame.first().copied().map(ResponseCode::from)
}
