//! Image digest carried by the End frame.
//!
//! The device recomputes an MD5 over everything it received and compares it
//! with this value before installing. It is an integrity check against
//! truncated or corrupted transfers, not a signature.

use md5::{Digest, Md5};

/// Length of the digest in bytes.
pub const DIGEST_LEN: usize = 16;

/// 128-bit image digest.
pub type ImageDigest = [u8; DIGEST_LEN];

/// Compute the digest of a whole firmware image.
pub fn image_digest(data: &[u8]) -> ImageDigest {
    Md5::digest(data).into()
}

/// Lowercase hex form of a digest.
pub fn digest_hex(digest: &ImageDigest) -> String {
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_empty() {
        assert_eq!(
            digest_hex(&image_digest(&[])),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
    }

    #[test]
    fn test_digest_known_value() {
        assert_eq!(
            digest_hex(&image_digest(b"The quick brown fox jumps over the lazy dog")),
            "9e107d9d372bb6826bd81d3542a419d6"
        );
    }

    #[test]
    fn test_digest_changes_with_content() {
        let a = image_digest(&[0x00; 64]);
        let mut data = [0x00; 64];
        data[63] = 0x01;
        assert_ne!(a, image_digest(&data));
    }
}
