//! Background job submission and outcome auditing.
//!
//! [`JobSubmitter::submit`] hands a fully bound unit of work to a bounded
//! pool and returns at once. Whatever the work returns, including an error
//! or a panic, is reported to an [`AuditSink`] and never reaches the caller.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io::{BufWriter, Write};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AuditConfig;
use crate::error::{ErrorContext, Result};

/// Final state of a background job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Succeeded,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One line of the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub job_id: Uuid,
    /// Module name or playbook path
    pub unit: String,
    pub status: JobStatus,
    /// Result summary on success, error text on failure
    pub message: String,
    pub finished_at: DateTime<Utc>,
}

/// Destination for background job outcomes.
pub trait AuditSink: Send + Sync + fmt::Debug {
    fn record(&self, record: &AuditRecord);
}

/// Reports outcomes through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: &AuditRecord) {
        match record.status {
            JobStatus::Succeeded => info!(
                job_id = %record.job_id,
                unit = %record.unit,
                summary = %record.message,
                "Background job succeeded"
            ),
            JobStatus::Failed => error!(
                job_id = %record.job_id,
                unit = %record.unit,
                error = %record.message,
                "Background job failed"
            ),
        }
    }
}

/// Appends one JSON object per line to a file.
#[derive(Debug)]
pub struct JsonFileAuditSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonFileAuditSink {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating audit directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening audit file {}", path.display()))?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonFileAuditSink {
    fn record(&self, record: &AuditRecord) {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to serialize audit record");
                return;
            }
        };
        let mut writer = self.writer.lock();
        if let Err(e) = writeln!(writer, "{}", line).and_then(|_| writer.flush()) {
            warn!(path = %self.path.display(), error = %e, "Failed to write audit record");
        }
    }
}

/// Forwards each record to several sinks.
#[derive(Debug, Default)]
pub struct AuditSinks {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl AuditSinks {
    /// Tracing always, plus the JSON-lines file when configured.
    pub fn from_config(config: &AuditConfig) -> Result<Self> {
        let mut sinks: Vec<Arc<dyn AuditSink>> = vec![Arc::new(TracingAuditSink)];
        if let Some(path) = &config.file {
            sinks.push(Arc::new(JsonFileAuditSink::open(path)?));
        }
        Ok(Self { sinks })
    }
}

impl AuditSink for AuditSinks {
    fn record(&self, record: &AuditRecord) {
        for sink in &self.sinks {
            sink.record(record);
        }
    }
}

/// Handle to a submitted job.
///
/// Dropping it does not cancel the job. It exists so callers that care
/// (tests, graceful shutdown) can wait for completion.
#[derive(Debug)]
pub struct JobTicket {
    pub id: Uuid,
    handle: JoinHandle<()>,
}

impl JobTicket {
    /// Wait until the job has finished and been audited.
    pub async fn wait(self) {
        if let Err(e) = self.handle.await {
            warn!(job_id = %self.id, error = %e, "Background job task ended abnormally");
        }
    }
}

/// Runs jobs on a bounded pool, fire-and-forget.
#[derive(Debug, Clone)]
pub struct JobSubmitter {
    permits: Arc<Semaphore>,
    audit: Arc<dyn AuditSink>,
}

impl JobSubmitter {
    /// At most `pool_size` jobs run at once; later jobs queue.
    pub fn new(pool_size: usize, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(pool_size.max(1))),
            audit,
        }
    }

    /// Queue `work` and return immediately.
    pub fn submit<F, T>(&self, unit: impl Into<String>, work: F) -> JobTicket
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        let id = Uuid::new_v4();
        let unit = unit.into();
        let permits = Arc::clone(&self.permits);
        let audit = Arc::clone(&self.audit);
        debug!(job_id = %id, unit = %unit, "Submitting background job");

        let handle = tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    audit.record(&AuditRecord::new(id, unit, JobStatus::Failed, e.to_string()));
                    return;
                }
            };

            let (status, message) = match AssertUnwindSafe(work).catch_unwind().await {
                Ok(Ok(value)) => (JobStatus::Succeeded, summarize(&value)),
                Ok(Err(e)) => (JobStatus::Failed, e.to_string()),
                Err(panic) => (JobStatus::Failed, panic_message(panic.as_ref())),
            };
            audit.record(&AuditRecord::new(id, unit, status, message));
        });

        JobTicket { id, handle }
    }
}

impl AuditRecord {
    fn new(job_id: Uuid, unit: String, status: JobStatus, message: String) -> Self {
        Self {
            job_id,
            unit,
            status,
            message,
            finished_at: Utc::now(),
        }
    }
}

fn summarize<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| format!("<unserializable result: {}>", e))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("job panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("job panicked: {}", s)
    } else {
        "job panicked".to_string()
    }
}
