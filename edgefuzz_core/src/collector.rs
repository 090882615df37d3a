use crate::store::round_log_path;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Capture I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::Io(err.to_string())
    }
}

/// Reference to a finalized raw log for one round.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LogArtifact {
    pub path: PathBuf,
    pub bytes: u64,
    pub started_at_ms: u64,
    pub ended_at_ms: u64,
}

/// An open capture window. Consumed by [`LogCollector::end_capture`].
#[derive(Debug)]
pub struct CaptureHandle {
    path: PathBuf,
    writer: BufWriter<File>,
    bytes: u64,
    started_at_ms: u64,
}

impl CaptureHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

/// Accumulates raw device output into per-round log files.
///
/// The collector never parses what it writes. Chunks land in the file in the
/// order they were appended and are flushed immediately, so a process that
/// dies mid-round still leaves everything received so far on disk.
#[derive(Debug, Clone)]
pub struct LogCollector {
    root: PathBuf,
}

impl LogCollector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Opens a fresh capture for `(api, function, round)`, truncating any
    /// artifact left behind by an earlier, unfinished attempt at the same round.
    pub fn begin_capture(
        &self,
        api: &str,
        function: &str,
        round: u32,
    ) -> Result<CaptureHandle, CaptureError> {
        let path = round_log_path(&self.root, api, function, round);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                CaptureError::Io(format!("Failed to create log directory {:?}: {}", parent, e))
            })?;
        }
        let file = File::create(&path).map_err(|e| {
            CaptureError::Io(format!("Failed to create log file {:?}: {}", path, e))
        })?;
        tracing::debug!(path = %path.display(), "Capture started");
        Ok(CaptureHandle {
            path,
            writer: BufWriter::new(file),
            bytes: 0,
            started_at_ms: now_ms(),
        })
    }

    pub fn append_raw(&self, handle: &mut CaptureHandle, chunk: &[u8]) -> Result<(), CaptureError> {
        handle.writer.write_all(chunk)?;
        handle.writer.flush()?;
        handle.bytes += chunk.len() as u64;
        Ok(())
    }

    /// Finalizes the capture. Partial captures are finalized the same way as
    /// complete ones.
    pub fn end_capture(&self, mut handle: CaptureHandle) -> Result<LogArtifact, CaptureError> {
        handle.writer.flush()?;
        handle.writer.get_ref().sync_all()?;
        let artifact = LogArtifact {
            path: handle.path,
            bytes: handle.bytes,
            started_at_ms: handle.started_at_ms,
            ended_at_ms: now_ms(),
        };
        tracing::debug!(
            path = %artifact.path.display(),
            bytes = artifact.bytes,
            "Capture finalized"
        );
        Ok(artifact)
    }

    /// Reads an artifact back as text. Invalid UTF-8 from the device is replaced
    /// rather than rejected.
    pub fn read_artifact(artifact: &LogArtifact) -> Result<String, CaptureError> {
        let raw = fs::read(&artifact.path).map_err(|e| {
            CaptureError::Io(format!("Failed to read log {:?}: {}", artifact.path, e))
        })?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
