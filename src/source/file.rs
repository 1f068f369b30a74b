//! JSON file source.

use super::{Source, SourceContext, SourceProps, SourceTuple, millis_prop};
use crate::error::SourceError;
use crate::value::Message;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Reads a JSON array of objects from a file.
///
/// The datasource is the file name, resolved against the `path` property when it is
/// set. Without `interval` the file is read once and the stream ends; with `interval`
/// the whole file is produced again every `interval` milliseconds until cancelled.
#[derive(Debug, Default)]
pub struct FileSource {
  file: PathBuf,
  interval: Option<Duration>,
}

impl FileSource {
  /// An unconfigured source.
  pub fn new() -> Self {
    Self::default()
  }

  async fn read(&self) -> Result<Vec<Message>, SourceError> {
    let text = tokio::fs::read_to_string(&self.file).await.map_err(|e| {
      SourceError::Connection(format!("cannot read {}: {}", self.file.display(), e))
    })?;
    let items: Vec<serde_json::Value> = serde_json::from_str(&text).map_err(|e| {
      SourceError::Connection(format!("invalid json in {}: {}", self.file.display(), e))
    })?;
    let mut records = Vec::with_capacity(items.len());
    for item in items {
      match Message::from_json(item) {
        Some(m) => records.push(m),
        None => warn!(file = %self.file.display(), "skipping non-object record"),
      }
    }
    Ok(records)
  }
}

#[async_trait]
impl Source for FileSource {
  fn configure(&mut self, datasource: &str, props: &SourceProps) -> Result<(), SourceError> {
    if datasource.is_empty() {
      return Err(SourceError::Config("file name is required".to_string()));
    }
    self.file = match props.get("path").and_then(|p| p.as_str()) {
      Some(dir) => PathBuf::from(dir).join(datasource),
      None => PathBuf::from(datasource),
    };
    self.interval = millis_prop(props, "interval")?
      .filter(|ms| *ms > 0)
      .map(Duration::from_millis);
    Ok(())
  }

  async fn open(
    &self,
    ctx: SourceContext,
    consumer: mpsc::Sender<SourceTuple>,
    errors: mpsc::Sender<SourceError>,
  ) {
    loop {
      let records = match self.read().await {
        Ok(r) => r,
        Err(e) => {
          let _ = errors.send(e).await;
          return;
        }
      };
      debug!(key = %ctx.key, records = records.len(), "file loaded");
      for record in records {
        tokio::select! {
          _ = ctx.cancel.cancelled() => return,
          sent = consumer.send(SourceTuple::new(record)) => {
            if sent.is_err() {
              return;
            }
          }
        }
      }
      let Some(interval) = self.interval else {
        return;
      };
      tokio::select! {
        _ = ctx.cancel.cancelled() => return,
        _ = tokio::time::sleep(interval) => {}
      }
    }
  }

  async fn close(&self) -> Result<(), SourceError> {
    Ok(())
  }
}
