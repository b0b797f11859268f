//! Firmware image source

use std::path::{Path, PathBuf};

use ecuflash_proto::{crc32, CRC_SEED};
use thiserror::Error;
use tracing::debug;

/// Errors loading a firmware image
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Failed to read image {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Image {0} is empty")]
    Empty(String),

    /// Length must fit the 32-bit size fields of RequestDownload
    #[error("Image is {len} bytes, larger than the 4 GiB addressable by the download request")]
    TooLarge { len: usize },
}

/// Whole firmware image held in memory, with its CRC-32
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    data: Vec<u8>,
    crc: u32,
}

impl FirmwareImage {
    /// Read the whole file at `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ImageError> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|source| ImageError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if data.is_empty() {
            return Err(ImageError::Empty(path.display().to_string()));
        }
        let image = Self::from_bytes(data)?;
        debug!(
            path = %path.display(),
            len = image.len(),
            crc = format!("0x{:08X}", image.crc()),
            "Firmware image loaded"
        );
        Ok(image)
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Self, ImageError> {
        if data.is_empty() {
            return Err(ImageError::Empty("<memory>".into()));
        }
        if u32::try_from(data.len()).is_err() {
            return Err(ImageError::TooLarge { len: data.len() });
        }
        let crc = crc32(CRC_SEED, &data);
        Ok(Self { data, crc })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Always false; empty images are rejected on construction
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Length as carried in the 32-bit request fields
    pub fn len_u32(&self) -> u32 {
        // bounded by from_bytes
        self.data.len() as u32
    }

    /// CRC-32/MPEG-2 of the whole image
    pub fn crc(&self) -> u32 {
        self.crc
    }
}
