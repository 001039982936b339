//! Inventory management for Runway.
//!
//! Two kinds of inventory live here:
//! - [`JobInventory`]: an in-memory host set owned by exactly one job,
//!   serialized to a transient file only while that job runs
//! - [`cache::DynamicInventory`]: the process-wide group index pulled
//!   from the directory service and cached on disk

pub mod access;
pub mod cache;
pub mod directory;

pub use access::check_access;
pub use cache::DynamicInventory;
pub use directory::{DirectoryClient, HttpDirectoryClient};

use crate::credential::{write_secret, ScopedFile};
use crate::error::{Error, Result};
use indexmap::{IndexMap, IndexSet};
use regex::Regex;
use serde::Serialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// Name of the synthetic group holding every host.
pub const ALL_GROUP: &str = "all";

/// Connection defaults applied to every host of the synthetic group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionDefaults {
    /// Transport name, set when a password is supplied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
    /// Remote login user
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Remote login password
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ConnectionDefaults {
    pub fn is_empty(&self) -> bool {
        self.connection.is_none() && self.user.is_none() && self.password.is_none()
    }
}

/// Host set owned by a single job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInventory {
    hosts: IndexSet<String>,
    groups: IndexMap<String, IndexSet<String>>,
    defaults: ConnectionDefaults,
}

impl JobInventory {
    /// Build an inventory from a host list, keeping first-seen order.
    ///
    /// A password switches the synthetic group to ssh/user/pass defaults;
    /// without one the caller has to supply a key at execution time.
    pub fn build<I, S>(hosts: I, remote_user: Option<&str>, remote_pass: Option<&str>) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let hosts: IndexSet<String> = hosts
            .into_iter()
            .map(|h| h.as_ref().trim().to_string())
            .filter(|h| !h.is_empty())
            .collect();

        if hosts.is_empty() {
            return Err(Error::EmptyInventory);
        }

        let defaults = match remote_pass.filter(|p| !p.is_empty()) {
            Some(pass) => ConnectionDefaults {
                connection: Some("ssh".to_string()),
                user: remote_user.map(str::to_string),
                password: Some(pass.to_string()),
            },
            None => ConnectionDefaults::default(),
        };

        debug!(hosts = hosts.len(), password = defaults.password.is_some(), "Built job inventory");

        Ok(Self {
            hosts,
            groups: IndexMap::new(),
            defaults,
        })
    }

    /// Register a named group. Members not already in the inventory are added.
    pub fn add_group<I, S>(&mut self, name: impl Into<String>, members: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let group = self.groups.entry(name.into()).or_default();
        for member in members {
            let member = member.as_ref().to_string();
            self.hosts.insert(member.clone());
            group.insert(member);
        }
    }

    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.hosts.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn defaults(&self) -> &ConnectionDefaults {
        &self.defaults
    }

    /// Resolve a host pattern to host names in inventory order.
    ///
    /// Supported forms: `all` or `*`, a group or host name, `~regex`,
    /// globs with `*`/`?`, and `,`/`:` separated lists where a leading `!`
    /// excludes and `&` intersects.
    pub fn resolve(&self, pattern: &str) -> Result<Vec<String>> {
        if self.hosts.is_empty() {
            return Err(Error::EmptyInventory);
        }

        let mut selected: IndexSet<&str> = IndexSet::new();
        let mut first = true;

        for part in pattern.split([',', ':']).map(str::trim).filter(|p| !p.is_empty()) {
            if let Some(rest) = part.strip_prefix('!') {
                let excluded = self.match_term(rest)?;
                selected.retain(|h| !excluded.contains(h));
            } else if let Some(rest) = part.strip_prefix('&') {
                let other = self.match_term(rest)?;
                selected.retain(|h| other.contains(h));
            } else {
                selected.extend(self.match_term(part)?);
            }
            first = false;
        }

        if first {
            return Ok(Vec::new());
        }

        // Inventory order, not pattern order
        Ok(self
            .hosts
            .iter()
            .filter(|h| selected.contains(h.as_str()))
            .cloned()
            .collect())
    }

    fn match_term(&self, term: &str) -> Result<IndexSet<&str>> {
        if term == ALL_GROUP || term == "*" {
            return Ok(self.hosts().collect());
        }

        if let Some(expr) = term.strip_prefix('~') {
            let regex = Regex::new(expr)
                .map_err(|e| Error::InvalidRequest(format!("invalid host pattern '{}': {}", term, e)))?;
            return Ok(self.hosts().filter(|h| regex.is_match(h)).collect());
        }

        if term.contains('*') || term.contains('?') {
            let regex = Regex::new(&glob_to_regex(term))
                .map_err(|e| Error::InvalidRequest(format!("invalid host pattern '{}': {}", term, e)))?;
            return Ok(self.hosts().filter(|h| regex.is_match(h)).collect());
        }

        if let Some(members) = self.groups.get(term) {
            return Ok(members.iter().map(String::as_str).collect());
        }

        Ok(self.hosts().filter(|h| *h == term).collect())
    }

    /// Render as an INI inventory document.
    pub fn to_ini(&self) -> String {
        let mut out = format!("[{}]\n", ALL_GROUP);
        for host in &self.hosts {
            out.push_str(host);
            out.push('\n');
        }

        for (name, members) in &self.groups {
            let _ = write!(out, "\n[{}]\n", name);
            for host in members {
                out.push_str(host);
                out.push('\n');
            }
        }

        if !self.defaults.is_empty() {
            let _ = write!(out, "\n[{}:vars]\n", ALL_GROUP);
            if let Some(connection) = &self.defaults.connection {
                let _ = writeln!(out, "connection={}", connection);
            }
            if let Some(user) = &self.defaults.user {
                let _ = writeln!(out, "user={}", user);
            }
            if let Some(password) = &self.defaults.password {
                let _ = writeln!(out, "password={}", password);
            }
        }

        out
    }

    /// Serialize to a uniquely named file under `dir`.
    ///
    /// The returned guard deletes the file when the job is done with it.
    pub fn write_transient(&self, dir: &Path) -> Result<TransientInventory> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("tmp_host_{}", Uuid::new_v4().simple()));
        let file = ScopedFile::new(path.clone());
        write_secret(&path, self.to_ini().as_bytes())?;
        debug!(path = %path.display(), "Wrote transient inventory");
        Ok(TransientInventory { file })
    }
}

/// On-disk copy of a [`JobInventory`], removed on drop.
#[derive(Debug)]
pub struct TransientInventory {
    file: ScopedFile,
}

impl TransientInventory {
    pub fn path(&self) -> Option<&Path> {
        self.file.path()
    }

    pub fn path_buf(&self) -> Option<PathBuf> {
        self.file.path().map(Path::to_path_buf)
    }

    /// Delete the file now instead of at drop.
    pub fn release(mut self) {
        self.file.release();
    }
}

/// Convert a glob pattern to an anchored regex.
fn glob_to_regex(pattern: &str) -> String {
    let mut regex = String::from("^");

    for ch in pattern.chars() {
        match ch {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            '[' | ']' | '(' | ')' | '{' | '}' | '.' | '+' | '^' | '$' | '|' | '\\' => {
                regex.push('\\');
                regex.push(ch);
            }
            _ => regex.push(ch),
        }
    }

    regex.push('$');
    regex
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_build_dedups_in_first_seen_order() {
        let inv = JobInventory::build(["h2", "h1", "h2", "h3", "h1"], None, None).unwrap();
        assert_eq!(inv.hosts().collect::<Vec<_>>(), vec!["h2", "h1", "h3"]);
    }

    #[test]
    fn test_build_empty_fails() {
        let err = JobInventory::build(Vec::<String>::new(), None, None).unwrap_err();
        assert!(matches!(err, Error::EmptyInventory));
        let err = JobInventory::build(["", "  "], None, None).unwrap_err();
        assert!(matches!(err, Error::EmptyInventory));
    }

    #[test]
    fn test_password_sets_defaults() {
        let inv = JobInventory::build(["h1"], Some("deploy"), Some("s3cret")).unwrap();
        assert_eq!(inv.defaults().connection.as_deref(), Some("ssh"));
        assert_eq!(inv.defaults().user.as_deref(), Some("deploy"));
        assert_eq!(inv.defaults().password.as_deref(), Some("s3cret"));

        let inv = JobInventory::build(["h1"], Some("deploy"), None).unwrap();
        assert!(inv.defaults().is_empty());
    }

    #[test]
    fn test_resolve_patterns() {
        let mut inv = JobInventory::build(["web1", "web2", "db1"], None, None).unwrap();
        inv.add_group("db", ["db1"]);

        assert_eq!(inv.resolve("all").unwrap(), vec!["web1", "web2", "db1"]);
        assert_eq!(inv.resolve("db").unwrap(), vec!["db1"]);
        assert_eq!(inv.resolve("web*").unwrap(), vec!["web1", "web2"]);
        assert_eq!(inv.resolve("~^web[2-9]$").unwrap(), vec!["web2"]);
        assert_eq!(inv.resolve("db1,web1").unwrap(), vec!["web1", "db1"]);
        assert_eq!(inv.resolve("all:!db").unwrap(), vec!["web1", "web2"]);
        assert_eq!(inv.resolve("web*:&web2").unwrap(), vec!["web2"]);
        assert!(inv.resolve("nothing").unwrap().is_empty());
        assert!(inv.resolve("").unwrap().is_empty());
    }

    #[test]
    fn test_invalid_regex_pattern() {
        let inv = JobInventory::build(["h1"], None, None).unwrap();
        assert!(matches!(
            inv.resolve("~(").unwrap_err(),
            Error::InvalidRequest(_)
        ));
    }

    #[test]
    fn test_ini_rendering() {
        let inv = JobInventory::build(["h1", "h2"], Some("ops"), Some("pw")).unwrap();
        assert_eq!(
            inv.to_ini(),
            "[all]\nh1\nh2\n\n[all:vars]\nconnection=ssh\nuser=ops\npassword=pw\n"
        );

        let inv = JobInventory::build(["h1"], None, None).unwrap();
        assert_eq!(inv.to_ini(), "[all]\nh1\n");
    }

    #[test]
    fn test_transient_file_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let inv = JobInventory::build(["h1"], None, None).unwrap();

        let path = {
            let transient = inv.write_transient(dir.path()).unwrap();
            let path = transient.path_buf().unwrap();
            assert!(path.exists());
            assert!(path
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("tmp_host_"));
            path
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_transient_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let inv = JobInventory::build(["h1"], Some("ops"), Some("s3cret")).unwrap();
        let transient = inv.write_transient(dir.path()).unwrap();
        let path = transient.path().unwrap();

        let mode = std::fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode & 0o077, 0);
        assert!(std::fs::read_to_string(path).unwrap().contains("password=s3cret"));
    }

    #[test]
    fn test_concurrent_jobs_get_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let inv = JobInventory::build(["h1"], None, None).unwrap();
        let a = inv.write_transient(dir.path()).unwrap();
        let b = inv.write_transient(dir.path()).unwrap();
        assert_ne!(a.path(), b.path());
        a.release();
        assert!(b.path().unwrap().exists());
    }
}
