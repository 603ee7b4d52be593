//! Usage/cost collection for model invocations.
//!
//! Every model call reports token usage to a [`UsageCollector`]. Collectors
//! are best-effort: callers log and discard their errors.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Errors raised while recording usage.
#[derive(Debug, thiserror::Error)]
pub enum UsageError {
    /// The sink could not be written
    #[error("Usage sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The record could not be serialized
    #[error("Usage record serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The collector refused the record
    #[error("Usage collector rejected record: {0}")]
    Rejected(String),
}

/// A single usage record for one model invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// When the usage was recorded
    pub recorded_at: DateTime<Utc>,
    /// Provider (e.g. "openai", "ollama", "mock")
    pub provider: String,
    /// Model identifier
    pub model: String,
    /// Input units (prompt tokens)
    pub input_units: u32,
    /// Output units (completion tokens)
    pub output_units: u32,
    /// Tenant the call was made for
    pub tenant_id: String,
    /// Learner the call was made for, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learner_id: Option<String>,
}

impl UsageRecord {
    /// Create a new usage record.
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        input_units: u32,
        output_units: u32,
        tenant_id: impl Into<String>,
    ) -> Self {
        Self {
            recorded_at: Utc::now(),
            provider: provider.into(),
            model: model.into(),
            input_units,
            output_units,
            tenant_id: tenant_id.into(),
            learner_id: None,
        }
    }

    /// Attribute the usage to a learner.
    pub fn with_learner(mut self, learner_id: impl Into<String>) -> Self {
        self.learner_id = Some(learner_id.into());
        self
    }

    /// Convert to JSONL line
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Sink for usage records.
#[async_trait]
pub trait UsageCollector: Send + Sync {
    /// Record one usage event.
    async fn record(&self, record: UsageRecord) -> Result<(), UsageError>;
}

/// Collector that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageCollector;

#[async_trait]
impl UsageCollector for NoopUsageCollector {
    async fn record(&self, _record: UsageRecord) -> Result<(), UsageError> {
        Ok(())
    }
}

/// Collector that keeps records in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryUsageCollector {
    records: Arc<Mutex<Vec<UsageRecord>>>,
}

impl MemoryUsageCollector {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub async fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl UsageCollector for MemoryUsageCollector {
    async fn record(&self, record: UsageRecord) -> Result<(), UsageError> {
        self.records.lock().await.push(record);
        Ok(())
    }
}

/// Usage logger that appends records to a JSONL file.
#[derive(Clone)]
pub struct JsonlUsageLogger {
    inner: Arc<Mutex<JsonlInner>>,
}

struct JsonlInner {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl JsonlUsageLogger {
    /// Open (or create) the log file in append mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, UsageError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        info!("Usage logging initialized to {}", path.display());

        Ok(Self {
            inner: Arc::new(Mutex::new(JsonlInner {
                writer: BufWriter::new(file),
                path,
            })),
        })
    }

    /// Path of the log file.
    pub async fn path(&self) -> PathBuf {
        self.inner.lock().await.path.clone()
    }
}

#[async_trait]
impl UsageCollector for JsonlUsageLogger {
    async fn record(&self, record: UsageRecord) -> Result<(), UsageError> {
        let line = record.to_jsonl()?;
        let mut inner = self.inner.lock().await;
        writeln!(inner.writer, "{}", line)?;
        inner.writer.flush()?;
        Ok(())
    }
}
