//! Execution engines for Runway.
//!
//! A job runs either one module against a set of hosts ([`adhoc`]) or a
//! multi-play playbook ([`playbook`]). Both dispatch per-host work to an
//! [`ExecutionBackend`] with at most `forks` hosts in flight.

pub mod adhoc;
pub mod backend;
pub mod events;
pub mod playbook;
#[cfg(feature = "russh")]
pub mod ssh;

pub use adhoc::{AdHocResult, AdHocRunner};
pub use backend::{ExecutionBackend, HostOutcome, HostTarget};
pub use events::{PlaybookEvent, PlaybookOutput, PlaybookReducer, PlaybookResult};
pub use playbook::PlaybookRunner;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::config::{ExecutionConfig, ServerConfig};
use crate::error::{Error, Result};
use crate::inventory::JobInventory;

/// Modules that refuse to run with empty arguments.
pub const MODULES_REQUIRING_ARGS: &[&str] = &[
    "command",
    "win_command",
    "shell",
    "win_shell",
    "raw",
    "script",
];

/// Payload key holding gathered host facts, stripped from ok results.
pub const FACTS_KEY: &str = "ansible_facts";

/// Per-host outcome classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Ok,
    Failed,
    Unreachable,
    Skipped,
}

impl OutcomeKind {
    /// Failed and unreachable hosts take no further part in a play.
    pub fn removes_host(self) -> bool {
        matches!(self, OutcomeKind::Failed | OutcomeKind::Unreachable)
    }
}

/// One module invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleCall {
    pub name: String,
    pub args: String,
}

impl ModuleCall {
    pub fn new(name: impl Into<String>, args: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            args: args.into(),
        }
    }

    /// Reject empty arguments for modules that need them.
    pub fn validate(&self) -> Result<()> {
        if MODULES_REQUIRING_ARGS.contains(&self.name.as_str()) && self.args.trim().is_empty() {
            return Err(Error::missing_module_args(&self.name));
        }
        Ok(())
    }
}

/// Unit of work carried by a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionUnit {
    AdHoc { module_name: String, module_args: String },
    Playbook { path: PathBuf },
}

impl ExecutionUnit {
    pub fn ad_hoc(module_name: impl Into<String>, module_args: impl Into<String>) -> Self {
        ExecutionUnit::AdHoc {
            module_name: module_name.into(),
            module_args: module_args.into(),
        }
    }

    pub fn playbook(path: impl Into<PathBuf>) -> Self {
        ExecutionUnit::Playbook { path: path.into() }
    }

    /// Checks that must pass before any host is contacted.
    pub fn validate(&self) -> Result<()> {
        match self {
            ExecutionUnit::AdHoc {
                module_name,
                module_args,
            } => ModuleCall::new(module_name.as_str(), module_args.as_str()).validate(),
            ExecutionUnit::Playbook { path } => check_playbook_path(path),
        }
    }

    pub fn label(&self) -> String {
        match self {
            ExecutionUnit::AdHoc { module_name, .. } => module_name.clone(),
            ExecutionUnit::Playbook { path } => path.display().to_string(),
        }
    }
}

pub(crate) fn check_playbook_path(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() || !path.exists() {
        return Err(Error::PlaybookNotFound(path.to_path_buf()));
    }
    Ok(())
}

/// Connection details for one job that are not part of its inventory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Login user when the inventory carries none
    pub remote_user: Option<String>,
    /// SSH port
    pub remote_port: u16,
    /// Materialized private key
    pub private_key_file: Option<PathBuf>,
}

/// Engine configuration, fixed at construction.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Default forks when a request does not set any
    pub forks: usize,
    /// Transport connect timeout
    pub timeout: Duration,
    /// Verify server host keys
    pub host_key_checking: bool,
    /// Write `<playbook>.retry` files listing failed hosts
    pub retry_files_enabled: bool,
    /// Playbook privilege escalation default
    pub r#become: bool,
    /// Playbook become user default
    pub become_user: String,
    /// Prefix for `shell` module arguments
    pub shell_profile_prefix: String,
    /// Where transient inventory files are written; `None` keeps them in memory
    pub inventory_dir: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from_config(&ExecutionConfig::default(), None)
    }
}

impl ExecutorConfig {
    pub fn from_config(execution: &ExecutionConfig, server: Option<&ServerConfig>) -> Self {
        Self {
            forks: execution.forks.max(1),
            timeout: Duration::from_secs(execution.timeout),
            host_key_checking: execution.host_key_checking,
            retry_files_enabled: execution.retry_files_enabled,
            r#become: execution.r#become,
            become_user: execution.become_user.clone(),
            shell_profile_prefix: execution.shell_profile_prefix.clone(),
            inventory_dir: server.map(ServerConfig::inventory_dir),
        }
    }

    pub fn with_inventory_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.inventory_dir = Some(dir.into());
        self
    }

    /// Connection target for `host` combining inventory and job credentials.
    pub fn target_for(
        &self,
        host: &str,
        inventory: &JobInventory,
        credentials: &Credentials,
        become_user: Option<String>,
    ) -> HostTarget {
        let defaults = inventory.defaults();
        HostTarget {
            host: host.to_string(),
            port: credentials.remote_port,
            user: defaults
                .user
                .clone()
                .or_else(|| credentials.remote_user.clone()),
            password: defaults.password.clone(),
            private_key_file: credentials.private_key_file.clone(),
            become_user,
            timeout: self.timeout,
        }
    }
}

/// Remove gathered facts from a result payload.
pub fn strip_facts(payload: &mut serde_json::Value) {
    if let Some(map) = payload.as_object_mut() {
        map.remove(FACTS_KEY);
    }
}

/// Run `work` for every host with at most `forks` in flight.
///
/// Results come back in completion order.
pub(crate) async fn dispatch<F, Fut, T>(hosts: &[String], forks: usize, work: F) -> Result<Vec<(String, T)>>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(forks.max(1)));
    let results = Arc::new(Mutex::new(Vec::with_capacity(hosts.len())));
    let work = Arc::new(work);

    let handles: Vec<_> = hosts
        .iter()
        .map(|host| {
            let host = host.clone();
            let semaphore = Arc::clone(&semaphore);
            let results = Arc::clone(&results);
            let work = Arc::clone(&work);

            tokio::spawn(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|e| Error::Internal(e.to_string()))?;
                let outcome = work(host.clone()).await;
                results.lock().push((host, outcome));
                Ok::<(), Error>(())
            })
        })
        .collect();

    for joined in join_all(handles).await {
        joined.map_err(|e| Error::Execution(format!("host task aborted: {}", e)))??;
    }

    let results = Arc::try_unwrap(results)
        .map_err(|_| Error::Internal("host results still shared".into()))?
        .into_inner();
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_module_requires_args() {
        assert!(ModuleCall::new("command", "").validate().is_err());
        assert!(ModuleCall::new("shell", "   ").validate().is_err());
        assert!(ModuleCall::new("command", "uptime").validate().is_ok());
        assert!(ModuleCall::new("ping", "").validate().is_ok());
    }

    #[test]
    fn test_unit_validation() {
        let err = ExecutionUnit::ad_hoc("raw", "").validate().unwrap_err();
        assert_eq!(err.to_string(), "No argument passed to 'raw' module.");

        let err = ExecutionUnit::playbook("/no/such/site.yml")
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::PlaybookNotFound(_)));

        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(ExecutionUnit::playbook(file.path()).validate().is_ok());
    }

    #[test]
    fn test_strip_facts() {
        let mut payload = serde_json::json!({"ping": "pong", "ansible_facts": {"os": "linux"}});
        strip_facts(&mut payload);
        assert_eq!(payload, serde_json::json!({"ping": "pong"}));
    }

    #[test]
    fn test_target_prefers_inventory_user() {
        let config = ExecutorConfig::default();
        let creds = Credentials {
            remote_user: Some("deploy".into()),
            remote_port: 2222,
            private_key_file: None,
        };

        let inv = JobInventory::build(["h1"], Some("admin"), Some("pw")).unwrap();
        let target = config.target_for("h1", &inv, &creds, None);
        assert_eq!(target.user.as_deref(), Some("admin"));
        assert_eq!(target.password.as_deref(), Some("pw"));
        assert_eq!(target.port, 2222);

        let inv = JobInventory::build(["h1"], Some("admin"), None).unwrap();
        let target = config.target_for("h1", &inv, &creds, None);
        assert_eq!(target.user.as_deref(), Some("deploy"));
        assert!(target.password.is_none());
    }

    #[tokio::test]
    async fn test_dispatch_respects_forks() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let hosts: Vec<String> = (0..8).map(|i| format!("h{}", i)).collect();

        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
        let results = dispatch(&hosts, 3, move |host| {
            let (active, peak) = (Arc::clone(&a), Arc::clone(&p));
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                host.len()
            }
        })
        .await
        .unwrap();

        assert_eq!(results.len(), 8);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }
}
