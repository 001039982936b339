//! Playbook events and the fold that turns them into a result tree.
//!
//! The playbook runner emits a flat stream of [`PlaybookEvent`]s in
//! execution order. [`PlaybookReducer`] consumes them one at a time and
//! builds the `plays -> tasks -> hosts` structure. It keeps no reference
//! to the runner, so the same event sequence always yields the same
//! output.

use std::collections::{BTreeMap, HashMap};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::{strip_facts, OutcomeKind};

/// Output text when a play matched no hosts.
pub const NO_HOSTS_MATCHED: &str = "skipping: No match hosts.";

/// One step of a playbook run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum PlaybookEvent {
    PlayStarted {
        name: String,
        id: String,
    },
    TaskStarted {
        name: String,
    },
    /// Result for a single loop item on one host.
    ItemOutcome {
        host: String,
        payload: Value,
    },
    /// Final result for a host on the current task.
    HostOutcome {
        kind: OutcomeKind,
        host: String,
        payload: Value,
        looped: bool,
    },
    NoHostsMatched,
    Stats {
        summary: BTreeMap<String, HostStats>,
    },
}

/// Per-host counters across the whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostStats {
    pub ok: u32,
    pub changed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub unreachable: u32,
}

impl HostStats {
    pub fn record(&mut self, kind: OutcomeKind, changed: bool) {
        match kind {
            OutcomeKind::Ok => {
                self.ok += 1;
                if changed {
                    self.changed += 1;
                }
            }
            OutcomeKind::Failed => self.failed += 1,
            OutcomeKind::Unreachable => self.unreachable += 1,
            OutcomeKind::Skipped => self.skipped += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlayInfo {
    pub name: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlayRecord {
    pub play: PlayInfo,
    pub tasks: Vec<TaskRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskInfo {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRecord {
    pub task: TaskInfo,
    pub hosts: IndexMap<String, Value>,
}

/// Complete result tree of a playbook run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlaybookResult {
    pub plays: Vec<PlayRecord>,
    pub stats: BTreeMap<String, HostStats>,
}

/// What a playbook run reports back.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PlaybookOutput {
    Completed(PlaybookResult),
    /// A play matched no hosts; the run reports only this message.
    Skipped(String),
}

impl PlaybookOutput {
    pub fn result(&self) -> Option<&PlaybookResult> {
        match self {
            PlaybookOutput::Completed(result) => Some(result),
            PlaybookOutput::Skipped(_) => None,
        }
    }
}

/// Folds [`PlaybookEvent`]s into a [`PlaybookOutput`].
#[derive(Debug, Default)]
pub struct PlaybookReducer {
    plays: Vec<PlayRecord>,
    item_results: HashMap<String, Vec<Value>>,
    stats: BTreeMap<String, HostStats>,
    no_hosts_matched: bool,
}

impl PlaybookReducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: PlaybookEvent) {
        match event {
            PlaybookEvent::PlayStarted { name, id } => self.plays.push(PlayRecord {
                play: PlayInfo { name, id },
                tasks: Vec::new(),
            }),
            PlaybookEvent::TaskStarted { name } => match self.plays.last_mut() {
                Some(play) => play.tasks.push(TaskRecord {
                    task: TaskInfo { name },
                    hosts: IndexMap::new(),
                }),
                None => warn!(task = %name, "Task started outside of a play, ignoring"),
            },
            PlaybookEvent::ItemOutcome { host, payload } => {
                self.item_results.entry(host).or_default().push(payload);
            }
            PlaybookEvent::HostOutcome {
                kind,
                host,
                mut payload,
                looped,
            } => {
                if kind == OutcomeKind::Ok {
                    strip_facts(&mut payload);
                }
                if looped {
                    // Buffered items replace the placeholder list.
                    if let Some(items) = self.item_results.remove(&host) {
                        if let Some(map) = payload.as_object_mut() {
                            if map.contains_key("results") {
                                map.insert("results".into(), Value::Array(items));
                            }
                        }
                    }
                }
                match self.plays.last_mut().and_then(|p| p.tasks.last_mut()) {
                    Some(task) => {
                        task.hosts.insert(host, payload);
                    }
                    None => warn!(host = %host, "Host outcome outside of a task, ignoring"),
                }
            }
            PlaybookEvent::NoHostsMatched => self.no_hosts_matched = true,
            PlaybookEvent::Stats { summary } => self.stats = summary,
        }
    }

    pub fn finish(self) -> PlaybookOutput {
        if self.no_hosts_matched {
            return PlaybookOutput::Skipped(NO_HOSTS_MATCHED.to_string());
        }
        PlaybookOutput::Completed(PlaybookResult {
            plays: self.plays,
            stats: self.stats,
        })
    }
}

/// Fold a whole event sequence.
pub fn fold(events: impl IntoIterator<Item = PlaybookEvent>) -> PlaybookOutput {
    let mut reducer = PlaybookReducer::new();
    for event in events {
        reducer.apply(event);
    }
    reducer.finish()
}
