//! Ad-hoc execution: one module, many hosts.

use std::sync::Arc;

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument};

use super::backend::{ExecutionBackend, HostOutcome};
use super::{dispatch, strip_facts, Credentials, ExecutorConfig, ModuleCall, OutcomeKind};
use crate::error::{Error, Result};
use crate::inventory::JobInventory;

/// Per-host payloads split into four disjoint buckets.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AdHocResult {
    pub contacted: IndexMap<String, Value>,
    pub failed: IndexMap<String, Value>,
    pub unreachable: IndexMap<String, Value>,
    pub skipped: IndexMap<String, Value>,
}

impl AdHocResult {
    /// File `outcome` under `host`, moving the host out of any earlier bucket.
    pub fn record(&mut self, host: impl Into<String>, outcome: HostOutcome) {
        let host = host.into();
        for bucket in [
            &mut self.contacted,
            &mut self.failed,
            &mut self.unreachable,
            &mut self.skipped,
        ] {
            bucket.shift_remove(&host);
        }

        let HostOutcome { kind, mut payload } = outcome;
        let bucket = match kind {
            OutcomeKind::Ok => {
                strip_facts(&mut payload);
                &mut self.contacted
            }
            OutcomeKind::Failed => &mut self.failed,
            OutcomeKind::Unreachable => &mut self.unreachable,
            OutcomeKind::Skipped => &mut self.skipped,
        };
        bucket.insert(host, payload);
    }

    /// Which bucket holds `host`, if any.
    pub fn bucket_of(&self, host: &str) -> Option<OutcomeKind> {
        if self.contacted.contains_key(host) {
            Some(OutcomeKind::Ok)
        } else if self.failed.contains_key(host) {
            Some(OutcomeKind::Failed)
        } else if self.unreachable.contains_key(host) {
            Some(OutcomeKind::Unreachable)
        } else if self.skipped.contains_key(host) {
            Some(OutcomeKind::Skipped)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.contacted.len() + self.failed.len() + self.unreachable.len() + self.skipped.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Runs a single module across a host pattern.
#[derive(Debug, Clone)]
pub struct AdHocRunner {
    backend: Arc<dyn ExecutionBackend>,
    config: Arc<ExecutorConfig>,
}

impl AdHocRunner {
    pub fn new(backend: Arc<dyn ExecutionBackend>, config: Arc<ExecutorConfig>) -> Self {
        Self { backend, config }
    }

    /// Run `call` on every host of `inventory` matching `pattern`.
    ///
    /// The inventory is written to a transient file for the duration of
    /// the run and removed on every exit path.
    #[instrument(skip(self, call, inventory, credentials), fields(module = %call.name, pattern = %pattern))]
    pub async fn run(
        &self,
        call: ModuleCall,
        inventory: &JobInventory,
        pattern: &str,
        credentials: &Credentials,
        forks: usize,
    ) -> Result<AdHocResult> {
        call.validate()?;
        let call = self.apply_shell_profile(call);

        if inventory.is_empty() {
            return Err(Error::EmptyInventory);
        }
        let hosts = inventory.resolve(pattern)?;
        if hosts.is_empty() {
            return Err(Error::NoMatchingHosts(pattern.to_string()));
        }

        let _transient = match &self.config.inventory_dir {
            Some(dir) => Some(inventory.write_transient(dir)?),
            None => None,
        };

        debug!(hosts = hosts.len(), forks = forks, backend = self.backend.name(), "Dispatching ad-hoc module");

        let call = Arc::new(call);
        let backend = Arc::clone(&self.backend);
        let targets: Arc<IndexMap<String, _>> = Arc::new(
            hosts
                .iter()
                .map(|h| (h.clone(), self.config.target_for(h, inventory, credentials, None)))
                .collect(),
        );

        let outcomes = dispatch(&hosts, forks, move |host| {
            let backend = Arc::clone(&backend);
            let call = Arc::clone(&call);
            let targets = Arc::clone(&targets);
            async move {
                match targets.get(&host) {
                    Some(target) => backend.run_module(target, &call).await,
                    None => HostOutcome::failed_msg("host missing from job targets"),
                }
            }
        })
        .await?;

        let mut result = AdHocResult::default();
        for (host, outcome) in outcomes {
            result.record(host, outcome);
        }

        info!(
            ok = result.contacted.len(),
            failed = result.failed.len(),
            unreachable = result.unreachable.len(),
            skipped = result.skipped.len(),
            "Ad-hoc run finished"
        );
        Ok(result)
    }

    fn apply_shell_profile(&self, mut call: ModuleCall) -> ModuleCall {
        if call.name == "shell" && !self.config.shell_profile_prefix.is_empty() {
            call.args = format!("{}{}", self.config.shell_profile_prefix, call.args);
        }
        call
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::HostTarget;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Debug, Default)]
    struct RecordingBackend {
        calls: Mutex<Vec<(String, ModuleCall)>>,
    }

    #[async_trait]
    impl ExecutionBackend for RecordingBackend {
        fn name(&self) -> &str {
            "recording"
        }

        async fn run_module(&self, target: &HostTarget, call: &ModuleCall) -> HostOutcome {
            self.calls.lock().push((target.host.clone(), call.clone()));
            if target.host.starts_with("down") {
                HostOutcome::unreachable("no route to host")
            } else {
                HostOutcome::ok(json!({"changed": true, "ansible_facts": {"x": 1}}))
            }
        }
    }

    fn runner(backend: Arc<RecordingBackend>) -> AdHocRunner {
        AdHocRunner::new(backend, Arc::new(ExecutorConfig::default()))
    }

    #[test]
    fn test_record_keeps_buckets_disjoint() {
        let mut result = AdHocResult::default();
        result.record("h1", HostOutcome::failed_msg("boom"));
        result.record("h1", HostOutcome::ok(json!({})));
        assert_eq!(result.len(), 1);
        assert_eq!(result.bucket_of("h1"), Some(OutcomeKind::Ok));
    }

    #[tokio::test]
    async fn test_shell_gets_profile_prefix() {
        let backend = Arc::new(RecordingBackend::default());
        let inv = JobInventory::build(["h1"], None, None).unwrap();

        runner(Arc::clone(&backend))
            .run(ModuleCall::new("shell", "ls"), &inv, "all", &Credentials::default(), 5)
            .await
            .unwrap();

        let calls = backend.calls.lock();
        assert_eq!(calls[0].1.args, "source ~/.bash_profile;ls");
    }

    #[tokio::test]
    async fn test_missing_args_contacts_nobody() {
        let backend = Arc::new(RecordingBackend::default());
        let inv = JobInventory::build(["h1"], None, None).unwrap();

        let err = runner(Arc::clone(&backend))
            .run(ModuleCall::new("command", ""), &inv, "all", &Credentials::default(), 5)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::MissingModuleArgs { .. }));
        assert!(backend.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unmatched_pattern() {
        let backend = Arc::new(RecordingBackend::default());
        let inv = JobInventory::build(["h1"], None, None).unwrap();

        let err = runner(backend)
            .run(ModuleCall::new("ping", ""), &inv, "dbservers", &Credentials::default(), 5)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "pattern: dbservers does not match any hosts.");
    }

    #[tokio::test]
    async fn test_buckets_and_fact_stripping() {
        let backend = Arc::new(RecordingBackend::default());
        let inv = JobInventory::build(["up1", "down1", "up2"], None, None).unwrap();

        let result = runner(backend)
            .run(ModuleCall::new("ping", ""), &inv, "all", &Credentials::default(), 2)
            .await
            .unwrap();

        assert_eq!(result.contacted.len(), 2);
        assert_eq!(result.unreachable.len(), 1);
        assert!(result.unreachable.contains_key("down1"));
        assert!(result.contacted["up1"].get("ansible_facts").is_none());
    }
}
