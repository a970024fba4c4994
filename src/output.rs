//! Single-owner storage for synthesized speech.
//!
//! At most one artifact exists at a time: storing new audio removes the
//! previous file before the new one is written.

use crate::error::Result;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug)]
pub struct AudioStore {
    dir: PathBuf,
    current: Option<PathBuf>,
    counter: u64,
}

impl AudioStore {
    /// Store artifacts under `dir` (created on first use).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            current: None,
            counter: 0,
        }
    }

    /// Store artifacts in the system temp directory.
    pub fn in_temp_dir() -> Self {
        Self::new(std::env::temp_dir())
    }

    /// Replace the current artifact with `wav`. Returns the new file's path.
    pub fn store(&mut self, wav: &[u8]) -> Result<PathBuf> {
        self.release();

        fs::create_dir_all(&self.dir)?;
        self.counter += 1;
        let path = self.dir.join(format!(
            "modelhost-speech-{}-{}.wav",
            std::process::id(),
            self.counter
        ));
        fs::write(&path, wav)?;
        debug!(path = %path.display(), bytes = wav.len(), "stored synthesized audio");

        self.current = Some(path.clone());
        Ok(path)
    }

    /// Path of the current artifact, if any.
    pub fn current(&self) -> Option<&Path> {
        self.current.as_deref()
    }

    /// Remove the current artifact.
    pub fn release(&mut self) {
        let Some(path) = self.current.take() else {
            return;
        };
        match fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "released synthesized audio"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "cannot remove synthesized audio"),
        }
    }
}

impl Drop for AudioStore {
    fn drop(&mut self) {
        self.release();
    }
}
