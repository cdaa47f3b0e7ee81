//! Persistence of execution records.
//!
//! The dispatcher hands every finished execution to an [`ExecutionSink`]
//! on a detached task. Sink failures are logged and never reach the caller.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::Result;
use crate::types::ExecutionRecord;

/// Destination for execution records.
#[async_trait]
pub trait ExecutionSink: Send + Sync {
    async fn record(&self, record: ExecutionRecord) -> Result<()>;
}

/// Sink that discards every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

#[async_trait]
impl ExecutionSink for NoopSink {
    async fn record(&self, _record: ExecutionRecord) -> Result<()> {
        Ok(())
    }
}

/// Appends one JSON object per line to a file.
///
/// The file and its parent directory are created on first write. Writes
/// from concurrent executions are serialised so lines never interleave.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ExecutionSink for JsonlSink {
    async fn record(&self, record: ExecutionRecord) -> Result<()> {
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
