//! Cursor persistence between runs.

use std::io::Write;
use std::path::{Path, PathBuf};

use miette::Result;
use tempfile::NamedTempFile;
use tracing::debug;

/// File holding the last processed sequence number as decimal text.
#[derive(Debug, Clone)]
pub struct CursorFile {
    path: PathBuf,
}

impl CursorFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<data dir>/skystream/cursor`, falling back to the working directory.
    pub fn default_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("skystream")
            .join("cursor")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored cursor, or None when no cursor has been saved yet.
    pub fn load(&self) -> Result<Option<i64>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(miette::miette!(
                    "failed to read cursor file {}: {}",
                    self.path.display(),
                    e
                ));
            }
        };

        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }

        text.parse::<i64>().map(Some).map_err(|e| {
            miette::miette!(
                "cursor file {} does not hold a sequence number: {}",
                self.path.display(),
                e
            )
        })
    }

    /// Replace the stored cursor atomically.
    pub fn store(&self, cursor: i64) -> Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)
            .map_err(|e| miette::miette!("failed to create {}: {}", dir.display(), e))?;

        let mut tmp = NamedTempFile::new_in(&dir)
            .map_err(|e| miette::miette!("failed to create temp cursor file: {}", e))?;
        writeln!(tmp, "{}", cursor)
            .map_err(|e| miette::miette!("failed to write cursor: {}", e))?;
        tmp.persist(&self.path).map_err(|e| {
            miette::miette!("failed to save cursor file {}: {}", self.path.display(), e)
        })?;

        debug!(cursor, path = %self.path.display(), "cursor saved");
        Ok(())
    }
}
