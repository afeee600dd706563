//! Object image format: a big-endian origin word followed by big-endian payload words.

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::memory::MEMORY_SIZE;
use crate::{CoreError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub origin: u16,
    pub words: Vec<u16>,
}

impl Image {
    pub fn new(origin: u16, words: Vec<u16>) -> Self {
        Self { origin, words }
    }

    /// Parse an image from raw file bytes. A trailing odd byte is ignored.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (origin, payload) = match bytes {
            [hi, lo, rest @ ..] => (u16::from_be_bytes([*hi, *lo]), rest),
            _ => return Err(CoreError::ImageTooShort { len: bytes.len() }),
        };
        if payload.len() % 2 != 0 {
            debug!(origin, "ignoring trailing odd byte in image");
        }
        let words = payload
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        Ok(Self { origin, words })
    }

    pub fn read(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|source| CoreError::ImageLoad {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_bytes(&bytes)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 * (self.words.len() + 1));
        out.extend_from_slice(&self.origin.to_be_bytes());
        for word in &self.words {
            out.extend_from_slice(&word.to_be_bytes());
        }
        out
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_bytes())?;
        Ok(())
    }

    /// Number of words that fit between the origin and the top of memory.
    pub fn capacity(&self) -> usize {
        MEMORY_SIZE - usize::from(self.origin)
    }
}
