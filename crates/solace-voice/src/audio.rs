//! File-backed storage for uploaded and synthesized audio.

use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Maximum size of a single stored clip (10 MiB).
pub const MAX_AUDIO_BYTES: usize = 10 * 1024 * 1024;

/// Stores audio clips under one directory and hands out opaque references
/// of the form `<uuid>.<ext>`.
#[derive(Debug, Clone)]
pub struct AudioStore {
    root: PathBuf,
}

impl AudioStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes a clip and returns its reference.
    pub async fn put(&self, audio: &[u8], ext: &str) -> std::io::Result<String> {
        if audio.len() > MAX_AUDIO_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "audio exceeds maximum size: {} bytes (limit: {} bytes)",
                    audio.len(),
                    MAX_AUDIO_BYTES
                ),
            ));
        }
        let ext = if !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()) {
            ext
        } else {
            "bin"
        };
        tokio::fs::create_dir_all(&self.root).await?;
        let audio_ref = format!("{}.{}", Uuid::new_v4(), ext);
        tokio::fs::write(self.root.join(&audio_ref), audio).await?;
        Ok(audio_ref)
    }

    /// Reads a clip back. References that could escape the store directory
    /// are refused.
    pub async fn get(&self, audio_ref: &str) -> std::io::Result<Vec<u8>> {
        let path = self.resolve(audio_ref)?;
        tokio::fs::read(path).await
    }

    fn resolve(&self, audio_ref: &str) -> std::io::Result<PathBuf> {
        let valid = !audio_ref.is_empty()
            && !audio_ref.starts_with('.')
            && audio_ref
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
        if !valid {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid audio reference: {}", audio_ref),
            ));
        }
        Ok(self.root.join(audio_ref))
    }
}
