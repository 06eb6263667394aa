//! Request opcodes and response codes of the OTA service.
//!
//! Every frame written to the OTA control characteristic starts with a
//! [`RequestOpcode`]; every notification the device sends back starts with a
//! [`ResponseCode`].

use std::fmt;

/// Opcodes of frames sent to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestOpcode {
    /// Announce an update and the image size (0x00).
    Begin = 0x00,
    /// A slice of the firmware image (0x01).
    Package = 0x01,
    /// Finish the update and hand over the image digest (0x02).
    End = 0x02,
    /// Drop the update in progress (0x03).
    Abort = 0x03,
}

impl RequestOpcode {
    /// Decode a request opcode byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Begin),
            0x01 => Some(Self::Package),
            0x02 => Some(Self::End),
            0x03 => Some(Self::Abort),
            _ => None,
        }
    }
}

impl From<RequestOpcode> for u8 {
    fn from(opcode: RequestOpcode) -> Self {
        opcode as u8
    }
}

/// Response codes reported by the device.
///
/// Anything other than [`ResponseCode::Ok`] is a failure. Codes this crate does
/// not know are kept in [`ResponseCode::Unknown`] so nothing is lost when the
/// firmware grows new ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    /// Request accepted (0x00).
    Ok,
    /// Generic rejection (0x01).
    NotOk,
    /// Frame layout not understood (0x02).
    IncorrectFormat,
    /// Announced or received size does not fit (0x03).
    IncorrectFirmwareSize,
    /// Image digest mismatch (0x04).
    ChecksumError,
    /// Flash write failed on the device (0x05).
    InternalStorageError,
    /// No answer in time (0x06). Also produced locally when a wait expires.
    TimeOut,
    /// A code outside the known set.
    Unknown(u8),
}

impl ResponseCode {
    /// Wire value of this code.
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Ok => 0x00,
            Self::NotOk => 0x01,
            Self::IncorrectFormat => 0x02,
            Self::IncorrectFirmwareSize => 0x03,
            Self::ChecksumError => 0x04,
            Self::InternalStorageError => 0x05,
            Self::TimeOut => 0x06,
            Self::Unknown(code) => code,
        }
    }

    /// Whether this code reports success.
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }

    /// Protocol name of the code, as used in error details.
    pub fn name(self) -> &'static str {
        match self {
            Self::Ok => "Ok",
            Self::NotOk => "NotOk",
            Self::IncorrectFormat => "IncorrectFormat",
            Self::IncorrectFirmwareSize => "IncorrectFirmwareSize",
            Self::ChecksumError => "ChecksumError",
            Self::InternalStorageError => "InternalStorageError",
            Self::TimeOut => "TimeOut",
            Self::Unknown(_) => "unknown",
        }
    }
}

impl From<u8> for ResponseCode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Ok,
            0x01 => Self::NotOk,
            0x02 => Self::IncorrectFormat,
            0x03 => Self::IncorrectFirmwareSize,
            0x04 => Self::ChecksumError,
            0x05 => Self::InternalStorageError,
            0x06 => Self::TimeOut,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "unknown (0x{code:02X})"),
            known => f.write_str(known.name()),
        }
    }
}
