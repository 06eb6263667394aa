//! Firmware image loading.

use crate::error::{Error, Result};
use crate::plan::TransferPlan;
use crate::protocol::{ImageDigest, digest_hex, image_digest};
use log::debug;
use std::path::Path;

/// A firmware image ready to be sent.
///
/// The image is non-empty and its size fits the 32-bit Begin field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Vec<u8>,
    size: u32,
    digest: ImageDigest,
}

impl FirmwareImage {
    /// Wrap raw image bytes.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::InvalidFirmware("image is empty".to_string()));
        }
        let size = u32::try_from(data.len()).map_err(|_| {
            Error::InvalidFirmware(format!(
                "{} bytes does not fit the 32-bit size field",
                data.len()
            ))
        })?;

        let digest = image_digest(&data);
        Ok(Self { data, size, digest })
    }

    /// Read an image from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        debug!("Loaded {} bytes from {}", data.len(), path.display());
        Self::from_bytes(data)
    }

    /// Image bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consume the image and return its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Image size as announced in Begin.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// MD5 digest sent in End.
    pub fn digest(&self) -> &ImageDigest {
        &self.digest
    }

    /// Digest as lowercase hex.
    pub fn digest_hex(&self) -> String {
        digest_hex(&self.digest)
    }

    /// Plan the transfer for the given device parameters.
    pub fn plan(&self, attr: u32, buffer: u32) -> Option<TransferPlan> {
        TransferPlan::new(self.data.len(), attr, buffer)
    }
}

impl AsRef<[u8]> for FirmwareImage {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}
