//! Audio Sources
//!
//! Provide the raw bytes a session streams to the server. The bytes are sent as-is;
//! no decoding or resampling happens here.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// A finite byte sequence to stream
pub trait AudioSource {
    fn as_bytes(&self) -> &[u8];

    fn len(&self) -> usize {
        self.as_bytes().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AudioSource for Vec<u8> {
    fn as_bytes(&self) -> &[u8] {
        self
    }
}

impl AudioSource for [u8] {
    fn as_bytes(&self) -> &[u8] {
        self
    }
}

/// Raw audio read fully from a file on disk
pub struct FileAudioSource {
    path: PathBuf,
    data: Vec<u8>,
}

impl FileAudioSource {
    /// Read the whole file into memory
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!("Opening audio file: {}", path.display());

        let data = std::fs::read(path)
            .with_context(|| format!("Failed to read audio file {}", path.display()))?;

        tracing::info!("Audio file loaded: {} bytes", data.len());
        Ok(Self {
            path: path.to_path_buf(),
            data,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AudioSource for FileAudioSource {
    fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}
