//! Request orchestration.
//!
//! [`Orchestrator`] turns a validated request into a job: it materializes
//! the credential, builds the job inventory, picks the engine, and either
//! runs it inline or hands it to the [`JobSubmitter`]. The key file and
//! transient inventory belong to the job and are removed when it ends,
//! whichever way it ends.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::config::Config;
use crate::credential::{CredentialStore, KeyFileHandle, ScopedFile};
use crate::error::{Error, ErrorContext, Result};
use crate::executor::{
    AdHocRunner, Credentials, ExecutionBackend, ExecutionUnit, ExecutorConfig, ModuleCall, PlaybookRunner,
};
use crate::inventory::{JobInventory, ALL_GROUP};
use crate::jobs::{AuditSink, JobSubmitter, JobTicket};

// ============================================================================
// Requests
// ============================================================================

/// Target and connection fields shared by every job request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JobTarget {
    pub hosts: Vec<String>,
    #[serde(default)]
    pub remote_user: Option<String>,
    #[serde(default)]
    pub remote_pass: Option<String>,
    /// Accepted as a number or a numeric string
    #[serde(default, deserialize_with = "deserialize_port")]
    pub remote_port: Option<u16>,
    /// Raw private key text
    #[serde(default, rename = "private_keyfile")]
    pub private_key: Option<String>,
    #[serde(default)]
    pub forks: Option<usize>,
    #[serde(default = "default_sync")]
    pub sync: bool,
}

impl Default for JobTarget {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            remote_user: None,
            remote_pass: None,
            remote_port: None,
            private_key: None,
            forks: None,
            sync: true,
        }
    }
}

impl JobTarget {
    fn has_credential(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
        present(&self.private_key) || present(&self.remote_pass)
    }
}

fn default_sync() -> bool {
    true
}

fn deserialize_port<'de, D>(deserializer: D) -> std::result::Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Option::<Port>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Port::Number(port)) => Ok(Some(port)),
        Some(Port::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(Port::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid remote_port: {}", text))),
    }
}

/// `POST /api/v1/run`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RunRequest {
    #[serde(flatten)]
    pub target: JobTarget,
    pub module: String,
    #[serde(default)]
    pub args: Option<String>,
}

/// `POST /api/v1/play`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PlayRequest {
    #[serde(flatten)]
    pub target: JobTarget,
    pub path: PathBuf,
}

/// `POST /api/v1/transform`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TransferRequest {
    #[serde(flatten)]
    pub target: JobTarget,
    /// Server-local source file
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Inline file content, staged before the copy
    #[serde(default)]
    pub data: Option<String>,
    pub target_path: String,
}

/// `POST /api/v1/ping`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PingRequest {
    #[serde(flatten)]
    pub target: JobTarget,
}

// ============================================================================
// Replies
// ============================================================================

/// What a submitted request produced.
#[derive(Debug)]
pub enum JobReply {
    /// Synchronous run finished; the engine result as JSON.
    Completed(Value),
    /// Job queued in the background.
    Accepted(JobTicket),
}

impl JobReply {
    /// Response `msg` payload: the result, or `"ok"` for accepted jobs.
    pub fn into_message(self) -> Value {
        match self {
            JobReply::Completed(value) => value,
            JobReply::Accepted(_) => Value::String("ok".to_string()),
        }
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Everything a job owns once its request has been accepted.
#[derive(Debug)]
struct PreparedJob {
    inventory: JobInventory,
    credentials: Credentials,
    key: KeyFileHandle,
    forks: usize,
}

/// Entry point for ad-hoc, playbook, transfer and ping jobs.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    store: CredentialStore,
    inventory_dir: PathBuf,
    adhoc: AdHocRunner,
    playbook: PlaybookRunner,
    submitter: JobSubmitter,
    default_forks: usize,
    default_port: u16,
}

impl Orchestrator {
    pub fn new(config: &Config, backend: Arc<dyn ExecutionBackend>, audit: Arc<dyn AuditSink>) -> Self {
        let executor = Arc::new(ExecutorConfig::from_config(&config.execution, Some(&config.server)));
        Self {
            store: CredentialStore::from_config(&config.server),
            inventory_dir: config.server.inventory_dir(),
            adhoc: AdHocRunner::new(Arc::clone(&backend), Arc::clone(&executor)),
            playbook: PlaybookRunner::new(backend, Arc::clone(&executor)),
            submitter: JobSubmitter::new(config.server.worker_pool_size, audit),
            default_forks: executor.forks,
            default_port: config.execution.remote_port,
        }
    }

    /// Orchestrator over the SSH backend with the configured audit sinks.
    #[cfg(feature = "russh")]
    pub fn from_config(config: &Config) -> Result<Self> {
        let backend = Arc::new(crate::executor::ssh::SshBackend::new(config.execution.host_key_checking));
        let audit = Arc::new(crate::jobs::AuditSinks::from_config(&config.audit)?);
        Ok(Self::new(config, backend, audit))
    }

    /// Create the key, upload and transient inventory directories.
    pub fn ensure_data_dirs(&self) -> Result<()> {
        self.store.ensure_dirs()?;
        std::fs::create_dir_all(&self.inventory_dir)
            .with_context(|| format!("creating inventory directory {}", self.inventory_dir.display()))?;
        Ok(())
    }

    /// Run one module on every requested host.
    #[instrument(skip(self, request), fields(module = %request.module, sync = request.target.sync))]
    pub async fn run(&self, request: RunRequest) -> Result<JobReply> {
        let RunRequest { target, module, args } = request;
        require_credential(&target)?;
        let unit = ExecutionUnit::ad_hoc(module.as_str(), args.as_deref().unwrap_or_default());
        unit.validate()?;

        let sync = target.sync;
        let job = self.prepare(target)?;
        let runner = self.adhoc.clone();
        let call = ModuleCall::new(module, args.unwrap_or_default());

        self.execute(sync, unit.label(), async move {
            let PreparedJob {
                inventory,
                credentials,
                key,
                forks,
            } = job;
            let result = runner.run(call, &inventory, ALL_GROUP, &credentials, forks).await;
            drop(key);
            result
        })
        .await
    }

    /// Run a playbook against the requested hosts.
    #[instrument(skip(self, request), fields(playbook = %request.path.display(), sync = request.target.sync))]
    pub async fn play(&self, request: PlayRequest) -> Result<JobReply> {
        let PlayRequest { target, path } = request;
        require_credential(&target)?;
        let unit = ExecutionUnit::playbook(path.clone());
        unit.validate()?;

        let sync = target.sync;
        let job = self.prepare(target)?;
        let runner = self.playbook.clone();

        self.execute(sync, unit.label(), async move {
            let PreparedJob {
                inventory,
                credentials,
                key,
                forks,
            } = job;
            let result = runner.run(&path, &inventory, &credentials, forks).await;
            drop(key);
            result
        })
        .await
    }

    /// Copy a file to the requested hosts, creating the parent directory first.
    #[instrument(skip(self, request), fields(target_path = %request.target_path, sync = request.target.sync))]
    pub async fn transfer(&self, request: TransferRequest) -> Result<JobReply> {
        let TransferRequest {
            target,
            path,
            data,
            target_path,
        } = request;
        require_credential(&target)?;
        if target_path.trim().is_empty() {
            return Err(Error::InvalidRequest("target_path must not be empty".into()));
        }

        let staged = match (data, path) {
            (Some(data), _) => TransferSource::Staged(self.store.stage_upload(data.as_bytes())?),
            (None, Some(path)) => {
                if !path.is_file() {
                    return Err(Error::InvalidRequest(format!("source file not found: {}", path.display())));
                }
                TransferSource::Local(path)
            }
            (None, None) => return Err(Error::InvalidRequest("either path or data is required".into())),
        };
        let source = staged
            .path()
            .map(Path::to_path_buf)
            .ok_or_else(|| Error::Internal("transfer source missing".into()))?;

        let mkdir = ModuleCall::new("shell", format!("mkdir -p {}", shell_words::quote(&remote_parent(&target_path))));
        let copy = ModuleCall::new(
            "copy",
            format!(
                "src={} dest={}",
                shell_words::quote(&source.to_string_lossy()),
                shell_words::quote(&target_path)
            ),
        );

        let sync = target.sync;
        let job = self.prepare(target)?;
        let runner = self.adhoc.clone();

        self.execute(sync, "copy".to_string(), async move {
            let PreparedJob {
                inventory,
                credentials,
                key,
                forks,
            } = job;
            let prepared = runner.run(mkdir, &inventory, ALL_GROUP, &credentials, forks).await;
            let result = match prepared {
                Ok(_) => runner.run(copy, &inventory, ALL_GROUP, &credentials, forks).await,
                Err(e) => Err(e),
            };
            drop(staged);
            drop(key);
            result
        })
        .await
    }

    /// Check that the requested hosts answer. A credential is optional.
    #[instrument(skip(self, request), fields(sync = request.target.sync))]
    pub async fn ping(&self, request: PingRequest) -> Result<JobReply> {
        let PingRequest { target } = request;
        let sync = target.sync;
        let job = self.prepare(target)?;
        let runner = self.adhoc.clone();

        self.execute(sync, "ping".to_string(), async move {
            let PreparedJob {
                inventory,
                credentials,
                key,
                forks,
            } = job;
            let result = runner
                .run(ModuleCall::new("ping", ""), &inventory, ALL_GROUP, &credentials, forks)
                .await;
            drop(key);
            result
        })
        .await
    }

    fn prepare(&self, target: JobTarget) -> Result<PreparedJob> {
        let inventory = JobInventory::build(&target.hosts, target.remote_user.as_deref(), target.remote_pass.as_deref())?;
        let key = self.store.materialize(target.private_key.as_deref())?;
        let credentials = Credentials {
            remote_user: target.remote_user,
            remote_port: target.remote_port.unwrap_or(self.default_port),
            private_key_file: key.path().map(Path::to_path_buf),
        };
        let forks = target.forks.filter(|f| *f > 0).unwrap_or(self.default_forks);
        debug!(hosts = inventory.len(), forks = forks, key = !key.is_empty(), "Prepared job");
        Ok(PreparedJob {
            inventory,
            credentials,
            key,
            forks,
        })
    }

    async fn execute<F, T>(&self, sync: bool, unit: String, work: F) -> Result<JobReply>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        if sync {
            // Spawned so that a dropped request cannot stop the job halfway.
            let value = tokio::spawn(work)
                .await
                .map_err(|e| Error::Execution(format!("job task ended abnormally: {}", e)))??;
            Ok(JobReply::Completed(serde_json::to_value(value)?))
        } else {
            let ticket = self.submitter.submit(unit, work);
            info!(job_id = %ticket.id, "Job accepted for background execution");
            Ok(JobReply::Accepted(ticket))
        }
    }
}

/// File copied by a transfer job.
#[derive(Debug)]
enum TransferSource {
    /// Inline data written by the credential store, removed with the job
    Staged(ScopedFile),
    Local(PathBuf),
}

impl TransferSource {
    fn path(&self) -> Option<&Path> {
        match self {
            TransferSource::Staged(file) => file.path(),
            TransferSource::Local(path) => Some(path),
        }
    }
}

fn require_credential(target: &JobTarget) -> Result<()> {
    if target.has_credential() {
        Ok(())
    } else {
        Err(Error::MissingCredential)
    }
}

/// Parent directory of a remote path, `/` for top-level paths.
fn remote_parent(target_path: &str) -> String {
    match Path::new(target_path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_string_lossy().into_owned(),
        Some(_) => ".".to_string(),
        None => "/".to_string(),
    }
}
