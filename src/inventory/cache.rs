//! Dynamic inventory cache
//!
//! Pulls host membership and tags from the directory service and keeps two
//! JSON documents on disk:
//! - the group index (`group -> [host]`, including `all`)
//! - the detail cache (`host -> {ip, tags}`)
//!
//! The pair is valid while the index file is younger than the configured
//! max age and the detail file exists. Both files are replaced through a
//! temp file and rename, so readers never see a half-written document.
//!
//! # Example
//!
//! ```rust,ignore
//! use runway::inventory::cache::{CacheSettings, DynamicInventory};
//!
//! let inventory = DynamicInventory::from_config(&config.directory)?;
//! let groups = inventory.list().await?;
//! let record = inventory.host("10.222.16.1").await?;
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use indexmap::IndexSet;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument, warn};

use super::directory::{DirectoryClient, HttpDirectoryClient};
use super::ALL_GROUP;
use crate::config::DirectoryConfig;
use crate::error::{Error, Result};

/// File name of the group index document.
pub const INDEX_FILE: &str = ".runway.index";

/// File name of the detail cache document.
pub const CACHE_FILE: &str = ".runway.cache";

/// Group name to member hosts.
pub type GroupIndex = BTreeMap<String, Vec<String>>;

/// Host name to detail record.
pub type DetailCache = BTreeMap<String, HostRecord>;

/// Per-host detail entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    /// Addresses the host is reachable at
    pub ip: Vec<String>,
    /// Raw comma-separated tag string
    pub tags: String,
}

/// Settings for [`DynamicInventory`]
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Directory holding both documents
    pub cache_dir: PathBuf,
    /// Freshness window for the index
    pub max_age: Duration,
    /// Source groups to pull from the directory service
    pub groups: Vec<String>,
    /// Hosts per tag request
    pub page_size: usize,
}

impl CacheSettings {
    pub fn from_config(config: &DirectoryConfig) -> Self {
        Self {
            cache_dir: config.cache_path.clone(),
            max_age: Duration::from_secs(config.cache_max_age),
            groups: config.groups.clone(),
            page_size: config.page_size.max(1),
        }
    }
}

/// Both documents produced by one refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub groups: GroupIndex,
    pub details: DetailCache,
}

/// Group index backed by the directory service and a file cache.
#[derive(Debug, Clone)]
pub struct DynamicInventory {
    client: Arc<dyn DirectoryClient>,
    settings: CacheSettings,
}

impl DynamicInventory {
    pub fn new(client: Arc<dyn DirectoryClient>, settings: CacheSettings) -> Self {
        Self { client, settings }
    }

    /// Build with an HTTP client from configuration.
    pub fn from_config(config: &DirectoryConfig) -> Result<Self> {
        let client = HttpDirectoryClient::from_config(config)?;
        Ok(Self::new(Arc::new(client), CacheSettings::from_config(config)))
    }

    pub fn index_path(&self) -> PathBuf {
        self.settings.cache_dir.join(INDEX_FILE)
    }

    pub fn cache_path(&self) -> PathBuf {
        self.settings.cache_dir.join(CACHE_FILE)
    }

    /// True when the index is fresh and the detail cache exists.
    pub fn is_valid(&self) -> bool {
        let index_age = fs::metadata(self.index_path())
            .and_then(|m| m.modified())
            .map(|modified| {
                SystemTime::now()
                    .duration_since(modified)
                    .unwrap_or(Duration::ZERO)
            });

        match index_age {
            Ok(age) => age < self.settings.max_age && self.cache_path().exists(),
            Err(_) => false,
        }
    }

    /// Serve a host record, or the whole group index when `host` is `None`.
    ///
    /// An unknown host yields an empty JSON object.
    pub async fn query(&self, host: Option<&str>) -> Result<serde_json::Value> {
        match host {
            Some(name) => match self.host(name).await? {
                Some(record) => Ok(serde_json::to_value(record)?),
                None => Ok(serde_json::json!({})),
            },
            None => Ok(serde_json::to_value(self.list().await?)?),
        }
    }

    /// Group index, refreshing first if the cache is stale.
    pub async fn list(&self) -> Result<GroupIndex> {
        if self.is_valid() {
            debug!(path = %self.index_path().display(), "Serving group index from cache");
            return read_json(&self.index_path());
        }
        Ok(self.refresh().await?.groups)
    }

    /// Detail record for one host.
    ///
    /// At most one refresh happens per call: either because the cache was
    /// stale, or because a valid cache did not know the host.
    pub async fn host(&self, name: &str) -> Result<Option<HostRecord>> {
        if self.is_valid() {
            let mut cached: DetailCache = read_json(&self.cache_path())?;
            if let Some(record) = cached.remove(name) {
                return Ok(Some(record));
            }
            debug!(host = %name, "Host missing from valid cache, refreshing");
        }

        let mut details = self.refresh().await?.details;
        Ok(details.remove(name))
    }

    /// Pull everything from the directory service and persist it.
    ///
    /// Any fetch error aborts before anything is written, leaving the
    /// previous documents in place.
    #[instrument(skip(self), fields(groups = self.settings.groups.len()))]
    pub async fn refresh(&self) -> Result<Snapshot> {
        let mut index = IndexedGroups::default();

        for group in &self.settings.groups {
            let hosts = self.client.group_hosts(group).await?;
            debug!(group = %group, count = hosts.len(), "Fetched group members");
            for host in hosts {
                index.push(ALL_GROUP, &host);
            }
        }

        let all: Vec<String> = index.members(ALL_GROUP);
        let mut details = DetailCache::new();

        for batch in all.chunks(self.settings.page_size) {
            let tags = self.client.host_tags(batch).await?;
            let matched = batch.iter().filter(|h| tags.contains_key(h.as_str())).count();
            if matched != batch.len() || tags.len() != batch.len() {
                warn!(
                    requested = batch.len(),
                    returned = tags.len(),
                    matched = matched,
                    "Tag response does not match the requested hosts, some hosts may be lost"
                );
            }

            for host in batch {
                let Some(tag_string) = tags.get(host) else {
                    continue;
                };
                details.insert(
                    host.clone(),
                    HostRecord {
                        ip: vec![host.clone()],
                        tags: tag_string.clone(),
                    },
                );
                for tag in tag_string.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                    index.push(tag, host);
                }
            }
        }

        let snapshot = Snapshot {
            groups: index.into_index(),
            details,
        };
        self.persist(&snapshot)?;

        info!(
            groups = snapshot.groups.len(),
            hosts = snapshot.details.len(),
            "Refreshed dynamic inventory"
        );
        Ok(snapshot)
    }

    fn persist(&self, snapshot: &Snapshot) -> Result<()> {
        let dir = &self.settings.cache_dir;
        if !dir.exists() {
            fs::create_dir_all(dir)?;
            fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
        }

        // Index last: its mtime marks the pair as fresh.
        write_atomic(&self.cache_path(), &serde_json::to_vec_pretty(&snapshot.details)?)?;
        write_atomic(&self.index_path(), &serde_json::to_vec_pretty(&snapshot.groups)?)?;
        Ok(())
    }
}

/// Group lists that ignore repeated members.
#[derive(Debug, Default)]
struct IndexedGroups {
    groups: BTreeMap<String, IndexSet<String>>,
}

impl IndexedGroups {
    fn push(&mut self, group: &str, host: &str) {
        self.groups
            .entry(group.to_string())
            .or_default()
            .insert(host.to_string());
    }

    fn members(&self, group: &str) -> Vec<String> {
        self.groups
            .get(group)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn into_index(self) -> GroupIndex {
        self.groups
            .into_iter()
            .map(|(name, hosts)| (name, hosts.into_iter().collect()))
            .collect()
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Internal(format!("no parent directory for {}", path.display())))?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read(path)?;
    Ok(serde_json::from_slice(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct FakeDirectory {
        hosts: BTreeMap<String, Vec<String>>,
        tags: BTreeMap<String, String>,
        host_calls: AtomicUsize,
        tag_calls: AtomicUsize,
        fail_tags: bool,
        /// Tags for hosts nobody asked about, added to every response
        unrequested: BTreeMap<String, String>,
    }

    #[async_trait]
    impl DirectoryClient for FakeDirectory {
        async fn group_hosts(&self, group: &str) -> Result<Vec<String>> {
            self.host_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.hosts.get(group).cloned().unwrap_or_default())
        }

        async fn host_tags(&self, hosts: &[String]) -> Result<BTreeMap<String, String>> {
            self.tag_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_tags {
                return Err(Error::directory_query("backend down"));
            }
            let mut tags: BTreeMap<String, String> = hosts
                .iter()
                .filter_map(|h| self.tags.get(h).map(|t| (h.clone(), t.clone())))
                .collect();
            tags.extend(self.unrequested.clone());
            Ok(tags)
        }
    }

    fn sample_directory() -> FakeDirectory {
        let mut dir = FakeDirectory::default();
        dir.hosts.insert(
            "hadoop".into(),
            vec!["10.222.16.1".into(), "10.222.16.15".into()],
        );
        dir.hosts
            .insert("web".into(), vec!["10.222.16.15".into(), "10.0.0.9".into()]);
        dir.tags.insert(
            "10.222.16.1".into(),
            "cluster,hadoop,cluster_hadoop_hdfs_nn".into(),
        );
        dir.tags.insert(
            "10.222.16.15".into(),
            "cluster,hadoopm,cluster_hadoop_hdfs_dn".into(),
        );
        dir
    }

    fn inventory(
        dir: &tempfile::TempDir,
        client: Arc<FakeDirectory>,
        max_age: Duration,
        page_size: usize,
    ) -> DynamicInventory {
        DynamicInventory::new(
            client,
            CacheSettings {
                cache_dir: dir.path().join("cache"),
                max_age,
                groups: vec!["hadoop".into(), "web".into()],
                page_size,
            },
        )
    }

    #[tokio::test]
    async fn test_refresh_builds_groups_and_details() {
        let tmp = tempfile::tempdir().unwrap();
        let client = Arc::new(sample_directory());
        let inv = inventory(&tmp, client.clone(), Duration::from_secs(3600), 200);

        let snapshot = inv.refresh().await.unwrap();

        assert_eq!(
            snapshot.groups["all"],
            vec!["10.222.16.1", "10.222.16.15", "10.0.0.9"]
        );
        assert_eq!(snapshot.groups["cluster"], vec!["10.222.16.1", "10.222.16.15"]);
        assert_eq!(snapshot.groups["hadoopm"], vec!["10.222.16.15"]);
        assert_eq!(
            snapshot.details["10.222.16.1"],
            HostRecord {
                ip: vec!["10.222.16.1".into()],
                tags: "cluster,hadoop,cluster_hadoop_hdfs_nn".into(),
            }
        );
        // partial tag response: untagged host gets no detail record
        assert!(!snapshot.details.contains_key("10.0.0.9"));
        assert!(inv.is_valid());
        let mode = fs::metadata(tmp.path().join("cache")).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
    }

    #[tokio::test]
    async fn test_unrequested_hosts_in_tag_response_are_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let mut dir = sample_directory();
        // same count as requested, but 10.0.0.9 is missing and 10.9.9.9 was never asked for
        dir.unrequested
            .insert("10.9.9.9".into(), "cluster,rogue".into());
        let inv = inventory(&tmp, Arc::new(dir), Duration::from_secs(3600), 200);

        let snapshot = inv.refresh().await.unwrap();

        assert!(!snapshot.details.contains_key("10.0.0.9"));
        assert!(!snapshot.details.contains_key("10.9.9.9"));
        assert!(!snapshot.groups.contains_key("rogue"));
        assert_eq!(snapshot.groups["cluster"], vec!["10.222.16.1", "10.222.16.15"]);
    }

    #[tokio::test]
    async fn test_refresh_pages_tag_requests() {
        let tmp = tempfile::tempdir().unwrap();
        let client = Arc::new(sample_directory());
        let inv = inventory(&tmp, client.clone(), Duration::from_secs(3600), 2);

        inv.refresh().await.unwrap();
        assert_eq!(client.host_calls.load(Ordering::SeqCst), 2);
        assert_eq!(client.tag_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_valid_cache_skips_fetch() {
        let tmp = tempfile::tempdir().unwrap();
        let client = Arc::new(sample_directory());
        let inv = inventory(&tmp, client.clone(), Duration::from_secs(3600), 200);
        inv.refresh().await.unwrap();
        let calls = client.host_calls.load(Ordering::SeqCst);

        let groups = inv.list().await.unwrap();
        assert!(groups.contains_key("hadoop"));
        let record = inv.host("10.222.16.15").await.unwrap();
        assert!(record.is_some());
        assert_eq!(client.host_calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn test_stale_cache_refreshes_once() {
        let tmp = tempfile::tempdir().unwrap();
        let client = Arc::new(sample_directory());
        let inv = inventory(&tmp, client.clone(), Duration::ZERO, 200);

        assert!(!inv.is_valid());
        inv.list().await.unwrap();
        assert_eq!(client.host_calls.load(Ordering::SeqCst), 2);

        inv.host("10.222.16.1").await.unwrap();
        assert_eq!(client.host_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_unknown_host_refreshes_once_then_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let client = Arc::new(sample_directory());
        let inv = inventory(&tmp, client.clone(), Duration::from_secs(3600), 200);
        inv.refresh().await.unwrap();
        let before = client.host_calls.load(Ordering::SeqCst);

        let value = inv.query(Some("192.168.1.1")).await.unwrap();
        assert_eq!(value, serde_json::json!({}));
        assert_eq!(client.host_calls.load(Ordering::SeqCst), before + 2);
    }

    #[tokio::test]
    async fn test_missing_detail_file_invalidates() {
        let tmp = tempfile::tempdir().unwrap();
        let client = Arc::new(sample_directory());
        let inv = inventory(&tmp, client, Duration::from_secs(3600), 200);
        inv.refresh().await.unwrap();

        fs::remove_file(inv.cache_path()).unwrap();
        assert!(!inv.is_valid());
    }

    #[tokio::test]
    async fn test_refresh_is_byte_identical() {
        let tmp = tempfile::tempdir().unwrap();
        let client = Arc::new(sample_directory());
        let inv = inventory(&tmp, client, Duration::from_secs(3600), 200);

        inv.refresh().await.unwrap();
        let index = fs::read(inv.index_path()).unwrap();
        let cache = fs::read(inv.cache_path()).unwrap();

        inv.refresh().await.unwrap();
        assert_eq!(fs::read(inv.index_path()).unwrap(), index);
        assert_eq!(fs::read(inv.cache_path()).unwrap(), cache);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_last_good_state() {
        let tmp = tempfile::tempdir().unwrap();
        let good = Arc::new(sample_directory());
        let inv = inventory(&tmp, good, Duration::from_secs(3600), 200);
        inv.refresh().await.unwrap();
        let index = fs::read(inv.index_path()).unwrap();

        let mut broken = sample_directory();
        broken.fail_tags = true;
        let inv = inventory(&tmp, Arc::new(broken), Duration::from_secs(3600), 200);
        assert!(inv.refresh().await.is_err());
        assert_eq!(fs::read(inv.index_path()).unwrap(), index);
    }
}
