//! Seam between the engines and whatever actually runs modules on hosts.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use super::{ModuleCall, OutcomeKind};

/// Everything a backend needs to reach one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTarget {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub private_key_file: Option<PathBuf>,
    /// Run the module as this user when set
    pub become_user: Option<String>,
    pub timeout: Duration,
}

impl HostTarget {
    /// Target with default port and timeout, mostly useful in tests.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: None,
            password: None,
            private_key_file: None,
            become_user: None,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Result of one module run on one host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostOutcome {
    pub kind: OutcomeKind,
    pub payload: Value,
}

impl HostOutcome {
    pub fn ok(payload: Value) -> Self {
        Self {
            kind: OutcomeKind::Ok,
            payload,
        }
    }

    /// Failure with the module payload; `failed: true` is added.
    pub fn failed(mut payload: Value) -> Self {
        if let Some(map) = payload.as_object_mut() {
            map.insert("failed".into(), Value::Bool(true));
        }
        Self {
            kind: OutcomeKind::Failed,
            payload,
        }
    }

    pub fn failed_msg(msg: impl fmt::Display) -> Self {
        Self::failed(json!({ "changed": false, "msg": msg.to_string() }))
    }

    pub fn unreachable(msg: impl fmt::Display) -> Self {
        Self {
            kind: OutcomeKind::Unreachable,
            payload: json!({ "changed": false, "unreachable": true, "msg": msg.to_string() }),
        }
    }

    pub fn skipped(reason: impl fmt::Display) -> Self {
        Self {
            kind: OutcomeKind::Skipped,
            payload: json!({ "changed": false, "skipped": true, "skip_reason": reason.to_string() }),
        }
    }

    /// True for ok outcomes that report `changed: true`.
    pub fn is_changed(&self) -> bool {
        self.kind == OutcomeKind::Ok && self.payload.get("changed").and_then(Value::as_bool) == Some(true)
    }
}

/// Runs modules on remote hosts.
///
/// Implementations never fail as a whole: transport and module errors are
/// expressed as `failed` or `unreachable` outcomes.
#[async_trait]
pub trait ExecutionBackend: Send + Sync + fmt::Debug {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Run one module on one host.
    async fn run_module(&self, target: &HostTarget, call: &ModuleCall) -> HostOutcome;
}
