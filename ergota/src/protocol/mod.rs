//! OTA wire protocol: opcodes, frame codec and image digest.

pub mod digest;
pub mod frame;
pub mod opcode;

// Re-export common types
pub use digest::{DIGEST_LEN, ImageDigest, digest_hex, image_digest};
pub use frame::BeginResponse;
pub use opcode::{RequestOpcode, ResponseCode};
