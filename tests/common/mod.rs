//! Shared test utilities for the Runway test suite.
//!
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;

use runway::config::Config;
use runway::executor::{ExecutionBackend, HostOutcome, HostTarget, ModuleCall};
use runway::jobs::{AuditRecord, AuditSink};
use runway::service::Orchestrator;

// ============================================================================
// Scripted backend
// ============================================================================

/// What the backend does for one host.
#[derive(Debug, Clone)]
pub enum Script {
    Ok,
    Fail(String),
    Unreachable(String),
}

/// Backend whose per-host behavior is set up front.
///
/// Unscripted hosts succeed. Every call is recorded together with whether
/// the key file existed while it ran.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    scripts: Mutex<HashMap<String, Script>>,
    delay: Mutex<Option<Duration>>,
    pub calls: Mutex<Vec<RecordedCall>>,
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub host: String,
    pub module: String,
    pub args: String,
    pub key_file: Option<PathBuf>,
    pub key_existed: bool,
    pub user: Option<String>,
    pub port: u16,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, host: &str, script: Script) {
        self.scripts.lock().insert(host.to_string(), script);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn modules(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.module.clone()).collect()
    }
}

#[async_trait]
impl ExecutionBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn run_module(&self, target: &HostTarget, call: &ModuleCall) -> HostOutcome {
        self.calls.lock().push(RecordedCall {
            host: target.host.clone(),
            module: call.name.clone(),
            args: call.args.clone(),
            key_file: target.private_key_file.clone(),
            key_existed: target.private_key_file.as_deref().is_some_and(Path::exists),
            user: target.user.clone(),
            port: target.port,
        });

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let script = self.scripts.lock().get(&target.host).cloned().unwrap_or(Script::Ok);
        match script {
            Script::Ok => HostOutcome::ok(json!({
                "changed": true,
                "module": call.name,
                "args": call.args,
                "ansible_facts": {"os": "linux"},
            })),
            Script::Fail(msg) => HostOutcome::failed_msg(msg),
            Script::Unreachable(msg) => HostOutcome::unreachable(msg),
        }
    }
}

// ============================================================================
// Audit capture
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryAudit {
    pub records: Mutex<Vec<AuditRecord>>,
}

impl AuditSink for MemoryAudit {
    fn record(&self, record: &AuditRecord) {
        self.records.lock().push(record.clone());
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// An orchestrator rooted in its own temporary data directory.
pub struct TestService {
    pub dir: TempDir,
    pub config: Config,
    pub backend: Arc<ScriptedBackend>,
    pub audit: Arc<MemoryAudit>,
    pub orchestrator: Orchestrator,
}

impl TestService {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.server.data_path = dir.path().to_path_buf();
        let backend = ScriptedBackend::new();
        let audit = Arc::new(MemoryAudit::default());
        let orchestrator = Orchestrator::new(&config, backend.clone(), audit.clone());
        orchestrator.ensure_data_dirs().unwrap();
        Self {
            dir,
            config,
            backend,
            audit,
            orchestrator,
        }
    }

    pub fn keyfile_dir(&self) -> PathBuf {
        self.config.server.keyfile_dir()
    }

    pub fn inventory_dir(&self) -> PathBuf {
        self.config.server.inventory_dir()
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.config.server.upload_dir()
    }

    /// Write a playbook into the data directory.
    pub fn playbook(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }
}

/// Number of entries in `dir`, zero when it does not exist.
pub fn count_files(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}
