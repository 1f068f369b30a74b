//! JSON lines file sink.

use super::{Payload, Sink, SinkContext};
use crate::error::SinkError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

/// Appends one JSON object per line to the file named by the `path` property.
#[derive(Debug, Default)]
pub struct FileSink {
  path: PathBuf,
  file: Mutex<Option<File>>,
}

impl FileSink {
  /// An unconfigured sink.
  pub fn new() -> Self {
    Self::default()
  }
}

fn io_error(path: &Path, e: std::io::Error) -> SinkError {
  SinkError::Delivery(format!("{}: {}", path.display(), e))
}

#[async_trait]
impl Sink for FileSink {
  fn configure(&mut self, props: &serde_json::Value) -> Result<(), SinkError> {
    let path = props
      .get("path")
      .and_then(|p| p.as_str())
      .filter(|p| !p.is_empty())
      .ok_or_else(|| SinkError::Config("path is required".to_string()))?;
    self.path = PathBuf::from(path);
    Ok(())
  }

  async fn open(&self, ctx: &SinkContext) -> Result<(), SinkError> {
    let file = OpenOptions::new()
      .create(true)
      .append(true)
      .open(&self.path)
      .await
      .map_err(|e| io_error(&self.path, e))?;
    *self.file.lock().await = Some(file);
    debug!(op = %ctx.op_id, path = %self.path.display(), "file sink opened");
    Ok(())
  }

  async fn collect(&self, _ctx: &SinkContext, payload: &Payload) -> Result<(), SinkError> {
    let mut guard = self.file.lock().await;
    let file = guard
      .as_mut()
      .ok_or_else(|| SinkError::Delivery(format!("{} is not open", self.path.display())))?;
    let mut buf = String::new();
    for record in payload {
      buf.push_str(&record.to_json().to_string());
      buf.push('\n');
    }
    file
      .write_all(buf.as_bytes())
      .await
      .map_err(|e| io_error(&self.path, e))?;
    file.flush().await.map_err(|e| io_error(&self.path, e))
  }

  async fn close(&self, _ctx: &SinkContext) -> Result<(), SinkError> {
    if let Some(mut file) = self.file.lock().await.take() {
      file.flush().await.map_err(|e| io_error(&self.path, e))?;
    }
    Ok(())
  }
}
