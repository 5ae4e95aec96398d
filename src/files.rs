use anyhow::Context;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{ReplicatorError, ReplicatorResult};

/// Name of the run index inside the working directory.
pub const INDEX_FILENAME: &str = "config.json";

/// Destination for per-window documents and the run index.
///
/// Writes are write-once: a second write under a name already present in the
/// run fails instead of replacing the earlier file.
pub trait FileSink {
    fn write_file(&self, name: &str, bytes: &[u8]) -> ReplicatorResult<PathBuf>;
}

/// Flat directory sink. Each file is staged in a temp file next to its final
/// name and persisted without clobbering, so a failed write leaves nothing behind.
#[derive(Debug, Clone)]
pub struct DirSink {
    dir: PathBuf,
}

impl DirSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl FileSink for DirSink {
    fn write_file(&self, name: &str, bytes: &[u8]) -> ReplicatorResult<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\', '\0']) || name == "." || name == ".." {
            return Err(ReplicatorError::config(format!(
                "output name `{name}` must be a plain file name"
            )));
        }
        let path = self.dir.join(name);
        let sink_err = |source: std::io::Error| ReplicatorError::SinkWrite {
            path: path.clone(),
            source,
        };

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(sink_err)?;
        tmp.write_all(bytes).map_err(sink_err)?;
        tmp.flush().map_err(sink_err)?;
        tmp.persist_noclobber(&path)
            .map_err(|err| sink_err(err.error))?;
        Ok(path)
    }
}

/// Per-run working directory, removed on drop unless [`WorkDir::keep`] was called.
#[derive(Debug)]
pub struct WorkDir {
    path: PathBuf,
    keep: bool,
}

impl WorkDir {
    /// Creates `path`; an existing directory is an error so runs never mix.
    pub fn create(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::create_dir(&path)
            .with_context(|| format!("failed to create working dir {}", path.display()))?;
        tracing::debug!(path = %path.display(), "created working dir");
        Ok(Self { path, keep: false })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sink(&self) -> DirSink {
        DirSink::new(&self.path)
    }

    pub fn keep(&mut self) {
        self.keep = true;
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if self.keep {
            tracing::info!(path = %self.path.display(), "keeping working dir");
            return;
        }
        if let Err(err) = std::fs::remove_dir_all(&self.path) {
            tracing::warn!(error = %err, path = %self.path.display(), "failed to remove working dir");
        }
    }
}
