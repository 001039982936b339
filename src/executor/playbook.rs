//! Playbook loading and execution.
//!
//! A playbook is a YAML list of plays. Each play names a host pattern and
//! a list of tasks; each task names exactly one module and its argument
//! string, optionally looping over `loop`/`with_items`:
//!
//! ```yaml
//! - name: deploy
//!   hosts: web
//!   become: yes
//!   tasks:
//!     - name: create dirs
//!       command: "mkdir -p /srv/{{ item }}"
//!       loop: [logs, data]
//!     - copy: src=/tmp/app.conf dest=/srv/app.conf
//! ```
//!
//! Plays and tasks run strictly in order; hosts within a task run in
//! parallel up to `forks`. A host that fails or becomes unreachable is
//! dropped from the remaining tasks of its play.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{json, Value};
use serde_yaml::{Mapping, Value as YamlValue};
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use super::backend::{ExecutionBackend, HostOutcome, HostTarget};
use super::events::{HostStats, PlaybookEvent, PlaybookOutput, PlaybookReducer};
use super::{check_playbook_path, dispatch, Credentials, ExecutorConfig, ModuleCall, OutcomeKind};
use crate::error::{Error, Result};
use crate::inventory::{JobInventory, ALL_GROUP};

/// Task keys that are not module names.
const TASK_KEYWORDS: &[&str] = &[
    "name",
    "loop",
    "with_items",
    "when",
    "ignore_errors",
    "register",
    "tags",
];

// ============================================================================
// Playbook Model
// ============================================================================

/// A parsed playbook.
#[derive(Debug, Clone, PartialEq)]
pub struct Playbook {
    pub path: PathBuf,
    pub plays: Vec<Play>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Play {
    pub name: String,
    pub hosts: String,
    pub r#become: Option<bool>,
    pub become_user: Option<String>,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub name: String,
    pub call: ModuleCall,
    /// Loop items, `None` for a plain task
    pub items: Option<Vec<String>>,
    /// Literal condition; `Some(false)` skips the task
    pub when: Option<bool>,
    pub ignore_errors: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HostsField {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct RawPlay {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    hosts: Option<HostsField>,
    #[serde(default)]
    r#become: Option<YamlValue>,
    #[serde(default)]
    become_user: Option<String>,
    #[serde(default)]
    tasks: Vec<Mapping>,
}

impl Playbook {
    /// Load and validate a playbook file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        check_playbook_path(path)?;
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content, path)
    }

    /// Parse playbook YAML; `path` is used for error messages.
    pub fn parse(content: &str, path: &Path) -> Result<Self> {
        let raw: Vec<RawPlay> =
            serde_yaml::from_str(content).map_err(|e| Error::playbook_parse(path, e.to_string()))?;

        let plays = raw
            .into_iter()
            .map(|play| Play::from_raw(play, path))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            path: path.to_path_buf(),
            plays,
        })
    }
}

impl Play {
    fn from_raw(raw: RawPlay, path: &Path) -> Result<Self> {
        let hosts = match raw.hosts {
            Some(HostsField::One(h)) => h,
            Some(HostsField::Many(list)) => list.join(","),
            None => ALL_GROUP.to_string(),
        };
        let r#become = raw
            .r#become
            .as_ref()
            .map(|v| yaml_bool(v).ok_or_else(|| Error::playbook_parse(path, "'become' must be a boolean")))
            .transpose()?;
        let tasks = raw
            .tasks
            .iter()
            .map(|t| Task::from_mapping(t, path))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            name: raw.name.unwrap_or_else(|| hosts.clone()),
            hosts,
            r#become,
            become_user: raw.become_user,
            tasks,
        })
    }
}

impl Task {
    fn from_mapping(map: &Mapping, path: &Path) -> Result<Self> {
        let mut name = None;
        let mut items = None;
        let mut when = None;
        let mut ignore_errors = false;
        let mut modules = Vec::new();

        for (key, value) in map {
            let key = key
                .as_str()
                .ok_or_else(|| Error::playbook_parse(path, "task keys must be strings"))?;
            match key {
                "name" => name = scalar_to_string(value),
                "loop" | "with_items" => {
                    let seq = value.as_sequence().ok_or_else(|| {
                        Error::playbook_parse(path, format!("'{}' must be a list", key))
                    })?;
                    items = Some(seq.iter().filter_map(scalar_to_string).collect());
                }
                "when" => {
                    when = Some(yaml_bool(value).ok_or_else(|| {
                        Error::playbook_parse(path, "'when' only supports literal booleans")
                    })?)
                }
                "ignore_errors" => ignore_errors = yaml_bool(value).unwrap_or(false),
                k if TASK_KEYWORDS.contains(&k) => {}
                module => modules.push((module.to_string(), module_args(value))),
            }
        }

        let (module, args) = match modules.len() {
            1 => modules.remove(0),
            0 => return Err(Error::playbook_parse(path, "task has no module")),
            _ => {
                let names: Vec<_> = modules.iter().map(|(m, _)| m.as_str()).collect();
                return Err(Error::playbook_parse(
                    path,
                    format!("task names more than one module: {}", names.join(", ")),
                ));
            }
        };

        let call = ModuleCall::new(module, args);
        call.validate()?;

        Ok(Self {
            name: name.unwrap_or_else(|| call.name.clone()),
            call,
            items,
            when,
            ignore_errors,
        })
    }
}

fn scalar_to_string(value: &YamlValue) -> Option<String> {
    match value {
        YamlValue::String(s) => Some(s.clone()),
        YamlValue::Bool(b) => Some(b.to_string()),
        YamlValue::Number(n) => Some(n.to_string()),
        YamlValue::Null => Some(String::new()),
        _ => None,
    }
}

fn yaml_bool(value: &YamlValue) -> Option<bool> {
    match value {
        YamlValue::Bool(b) => Some(*b),
        YamlValue::String(s) => match s.to_lowercase().as_str() {
            "yes" | "true" | "on" | "1" => Some(true),
            "no" | "false" | "off" | "0" => Some(false),
            _ => None,
        },
        YamlValue::Number(n) => n.as_i64().map(|n| n != 0),
        _ => None,
    }
}

/// Module arguments as a single string; mappings become `k=v` pairs.
fn module_args(value: &YamlValue) -> String {
    match value {
        YamlValue::Mapping(map) => map
            .iter()
            .filter_map(|(k, v)| {
                let key = k.as_str()?;
                let val = scalar_to_string(v)?;
                Some(format!("{}={}", key, shell_words::quote(&val)))
            })
            .collect::<Vec<_>>()
            .join(" "),
        other => scalar_to_string(other).unwrap_or_default(),
    }
}

fn substitute_item(args: &str, item: &str) -> String {
    args.replace("{{ item }}", item).replace("{{item}}", item)
}

// ============================================================================
// Runner
// ============================================================================

/// Outcome of one task on one host, with loop items if any.
#[derive(Debug)]
struct TaskRun {
    items: Vec<Value>,
    outcome: HostOutcome,
}

/// Runs playbooks against a job inventory.
#[derive(Debug, Clone)]
pub struct PlaybookRunner {
    backend: Arc<dyn ExecutionBackend>,
    config: Arc<ExecutorConfig>,
}

impl PlaybookRunner {
    pub fn new(backend: Arc<dyn ExecutionBackend>, config: Arc<ExecutorConfig>) -> Self {
        Self { backend, config }
    }

    /// Run the playbook at `path` and return its result tree.
    #[instrument(skip(self, inventory, credentials), fields(playbook = %path.display()))]
    pub async fn run(
        &self,
        path: &Path,
        inventory: &JobInventory,
        credentials: &Credentials,
        forks: usize,
    ) -> Result<PlaybookOutput> {
        check_playbook_path(path)?;
        if inventory.is_empty() {
            return Err(Error::EmptyInventory);
        }
        let playbook = Playbook::from_file(path)?;

        let _transient = match &self.config.inventory_dir {
            Some(dir) => Some(inventory.write_transient(dir)?),
            None => None,
        };

        let mut reducer = PlaybookReducer::new();
        let mut stats: BTreeMap<String, HostStats> = BTreeMap::new();

        for play in &playbook.plays {
            self.run_play(play, inventory, credentials, forks, &mut reducer, &mut stats)
                .await?;
        }

        if self.config.retry_files_enabled {
            write_retry_file(path, &stats);
        }

        info!(plays = playbook.plays.len(), hosts = stats.len(), "Playbook finished");
        emit(&mut reducer, PlaybookEvent::Stats { summary: stats });
        Ok(reducer.finish())
    }

    async fn run_play(
        &self,
        play: &Play,
        inventory: &JobInventory,
        credentials: &Credentials,
        forks: usize,
        reducer: &mut PlaybookReducer,
        stats: &mut BTreeMap<String, HostStats>,
    ) -> Result<()> {
        emit(
            reducer,
            PlaybookEvent::PlayStarted {
                name: play.name.clone(),
                id: Uuid::new_v4().to_string(),
            },
        );

        let mut active = inventory.resolve(&play.hosts)?;
        if active.is_empty() {
            warn!(play = %play.name, pattern = %play.hosts, "Play matched no hosts");
            emit(reducer, PlaybookEvent::NoHostsMatched);
            return Ok(());
        }

        let become_user = if play.r#become.unwrap_or(self.config.r#become) {
            Some(
                play.become_user
                    .clone()
                    .unwrap_or_else(|| self.config.become_user.clone()),
            )
        } else {
            None
        };

        let targets: Arc<IndexMap<String, HostTarget>> = Arc::new(
            active
                .iter()
                .map(|h| {
                    let target = self
                        .config
                        .target_for(h, inventory, credentials, become_user.clone());
                    (h.clone(), target)
                })
                .collect(),
        );

        for task in &play.tasks {
            if active.is_empty() {
                debug!(play = %play.name, "No hosts remaining");
                break;
            }
            emit(reducer, PlaybookEvent::TaskStarted { name: task.name.clone() });

            let runs: Vec<(String, TaskRun)> = if task.when == Some(false) {
                active
                    .iter()
                    .map(|h| {
                        let run = TaskRun {
                            items: Vec::new(),
                            outcome: HostOutcome::skipped("Conditional result was False"),
                        };
                        (h.clone(), run)
                    })
                    .collect()
            } else {
                let backend = Arc::clone(&self.backend);
                let targets = Arc::clone(&targets);
                let task = Arc::new(task.clone());
                dispatch(&active, forks, move |host| {
                    let backend = Arc::clone(&backend);
                    let targets = Arc::clone(&targets);
                    let task = Arc::clone(&task);
                    async move {
                        match targets.get(&host) {
                            Some(target) => run_on_host(backend.as_ref(), target, &task).await,
                            None => TaskRun {
                                items: Vec::new(),
                                outcome: HostOutcome::failed_msg("host missing from play targets"),
                            },
                        }
                    }
                })
                .await?
            };

            for (host, run) in runs {
                let TaskRun { items, outcome } = run;
                stats
                    .entry(host.clone())
                    .or_default()
                    .record(outcome.kind, outcome.is_changed());
                if outcome.kind.removes_host() && !task.ignore_errors {
                    active.retain(|h| h != &host);
                }
                for payload in items {
                    emit(
                        reducer,
                        PlaybookEvent::ItemOutcome {
                            host: host.clone(),
                            payload,
                        },
                    );
                }
                emit(
                    reducer,
                    PlaybookEvent::HostOutcome {
                        kind: outcome.kind,
                        host,
                        payload: outcome.payload,
                        looped: task.items.is_some(),
                    },
                );
            }
        }

        Ok(())
    }
}

fn emit(reducer: &mut PlaybookReducer, event: PlaybookEvent) {
    trace!(event = ?event, "Playbook event");
    reducer.apply(event);
}

async fn run_on_host(backend: &dyn ExecutionBackend, target: &HostTarget, task: &Task) -> TaskRun {
    let Some(items) = &task.items else {
        return TaskRun {
            items: Vec::new(),
            outcome: backend.run_module(target, &task.call).await,
        };
    };

    let mut results = Vec::with_capacity(items.len());
    let mut changed = false;
    let mut failed = false;

    for item in items {
        let call = ModuleCall {
            name: task.call.name.clone(),
            args: substitute_item(&task.call.args, item),
        };
        let outcome = backend.run_module(target, &call).await;
        if outcome.kind == OutcomeKind::Unreachable {
            return TaskRun {
                items: results,
                outcome,
            };
        }

        changed |= outcome.is_changed();
        failed |= outcome.kind == OutcomeKind::Failed;
        let mut payload = outcome.payload;
        if let Some(map) = payload.as_object_mut() {
            map.insert("item".into(), Value::String(item.clone()));
        }
        results.push(payload);
    }

    // `results` is filled from the item events when the outcome is folded.
    let outcome = if failed {
        HostOutcome::failed(json!({
            "changed": changed,
            "msg": "One or more items failed",
            "results": [],
        }))
    } else {
        HostOutcome::ok(json!({
            "changed": changed,
            "msg": "All items completed",
            "results": [],
        }))
    };

    TaskRun {
        items: results,
        outcome,
    }
}

fn write_retry_file(path: &Path, stats: &BTreeMap<String, HostStats>) {
    let failed: Vec<&str> = stats
        .iter()
        .filter(|(_, s)| s.failed > 0 || s.unreachable > 0)
        .map(|(h, _)| h.as_str())
        .collect();
    if failed.is_empty() {
        return;
    }

    let retry_path = path.with_extension("retry");
    let mut content = failed.join("\n");
    content.push('\n');
    match std::fs::write(&retry_path, content) {
        Ok(()) => info!(path = %retry_path.display(), hosts = failed.len(), "Wrote retry file"),
        Err(e) => warn!(path = %retry_path.display(), error = %e, "Failed to write retry file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(yaml: &str) -> Result<Playbook> {
        Playbook::parse(yaml, Path::new("site.yml"))
    }

    #[test]
    fn test_parse_plays_and_tasks() {
        let playbook = parse(
            r#"
- name: first
  hosts: web
  become: "no"
  tasks:
    - name: uptime
      command: uptime
    - shell: echo {{ item }}
      loop: [a, b]
- hosts: [db1, db2]
  tasks:
    - copy:
        src: /tmp/a b.conf
        dest: /etc/a.conf
"#,
        )
        .unwrap();

        assert_eq!(playbook.plays.len(), 2);
        let first = &playbook.plays[0];
        assert_eq!(first.hosts, "web");
        assert_eq!(first.r#become, Some(false));
        assert_eq!(first.tasks[0].call, ModuleCall::new("command", "uptime"));
        assert_eq!(first.tasks[1].name, "shell");
        assert_eq!(
            first.tasks[1].items,
            Some(vec!["a".to_string(), "b".to_string()])
        );

        let second = &playbook.plays[1];
        assert_eq!(second.name, "db1,db2");
        assert_eq!(
            second.tasks[0].call.args,
            "src='/tmp/a b.conf' dest=/etc/a.conf"
        );
    }

    #[test]
    fn test_task_needs_exactly_one_module() {
        let err = parse("- hosts: all\n  tasks:\n    - name: nothing\n").unwrap_err();
        assert!(matches!(err, Error::PlaybookParse { .. }));

        let err = parse("- hosts: all\n  tasks:\n    - command: ls\n      shell: ls\n").unwrap_err();
        assert!(err.to_string().contains("more than one module"));
    }

    #[test]
    fn test_task_module_args_validated() {
        let err = parse("- hosts: all\n  tasks:\n    - command: \"\"\n").unwrap_err();
        assert!(matches!(err, Error::MissingModuleArgs { .. }));
    }

    #[test]
    fn test_invalid_yaml() {
        let err = parse("not: [a list").unwrap_err();
        assert!(matches!(err, Error::PlaybookParse { .. }));
    }

    #[test]
    fn test_substitute_item() {
        assert_eq!(substitute_item("mkdir {{ item }} {{item}}", "x"), "mkdir x x");
    }

    #[test]
    fn test_missing_playbook_file() {
        let err = Playbook::from_file("/no/such/playbook.yml").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Not Found the playbook file: /no/such/playbook.yml."
        );
    }

    #[test]
    fn test_retry_file_lists_failed_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let playbook = dir.path().join("site.yml");
        let mut stats = BTreeMap::new();
        stats.insert("ok1".to_string(), HostStats { ok: 1, ..HostStats::default() });
        stats.insert("bad1".to_string(), HostStats { failed: 1, ..HostStats::default() });
        stats.insert("gone1".to_string(), HostStats { unreachable: 1, ..HostStats::default() });

        write_retry_file(&playbook, &stats);
        let content = std::fs::read_to_string(dir.path().join("site.retry")).unwrap();
        assert_eq!(content, "bad1\ngone1\n");
    }
}
