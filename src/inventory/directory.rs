//! Client for the external host directory service.
//!
//! The service exposes two JSON endpoints: one listing the hosts of a
//! source group, one returning comma-separated tag strings for a batch of
//! hosts. Both take the access token as a query parameter.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, error};

use crate::config::DirectoryConfig;
use crate::error::{Error, ErrorContext, Result};

/// Source of host membership and tag data.
#[async_trait]
pub trait DirectoryClient: Send + Sync + fmt::Debug {
    /// All hosts belonging to one source group.
    async fn group_hosts(&self, group: &str) -> Result<Vec<String>>;

    /// Raw tag strings keyed by host for one batch of hosts.
    async fn host_tags(&self, hosts: &[String]) -> Result<BTreeMap<String, String>>;
}

#[derive(Debug, Deserialize)]
struct HostListResponse {
    #[serde(default)]
    hosts: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TagResponse {
    #[serde(default)]
    succ: i64,
    #[serde(default)]
    tag_list: BTreeMap<String, String>,
    #[serde(default)]
    err_note: Option<String>,
}

/// [`DirectoryClient`] backed by reqwest.
#[derive(Debug, Clone)]
pub struct HttpDirectoryClient {
    client: Client,
    host_list_url: String,
    host_tags_url: String,
    token: String,
}

impl HttpDirectoryClient {
    /// Creates a client for the given endpoints.
    pub fn new(
        host_list_url: impl Into<String>,
        host_tags_url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            host_list_url: host_list_url.into(),
            host_tags_url: host_tags_url.into(),
            token: token.into(),
        })
    }

    pub fn from_config(config: &DirectoryConfig) -> Result<Self> {
        if config.host_list_url.is_empty() || config.host_tags_url.is_empty() {
            return Err(Error::Config(
                "directory.host_list_url and directory.host_tags_url must be set".to_string(),
            ));
        }
        Self::new(
            &config.host_list_url,
            &config.host_tags_url,
            &config.token,
            Duration::from_secs(config.request_timeout),
        )
    }
}

#[async_trait]
impl DirectoryClient for HttpDirectoryClient {
    async fn group_hosts(&self, group: &str) -> Result<Vec<String>> {
        debug!(group = %group, url = %self.host_list_url, "Fetching group hosts");

        let response = self
            .client
            .get(&self.host_list_url)
            .query(&[("token", self.token.as_str()), ("tag", group)])
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            error!(group = %group, status = %status, "Directory service rejected host list query");
            return Err(Error::DirectoryResponse {
                url: self.host_list_url.clone(),
                status: status.as_u16(),
                body,
            });
        }

        let parsed: HostListResponse = response.json().await?;
        Ok(parsed.hosts)
    }

    async fn host_tags(&self, hosts: &[String]) -> Result<BTreeMap<String, String>> {
        let joined = hosts.join("_");
        debug!(count = hosts.len(), url = %self.host_tags_url, "Fetching host tags");

        let response = self
            .client
            .get(&self.host_tags_url)
            .query(&[("token", self.token.as_str()), ("hosts", joined.as_str())])
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::NOT_MODIFIED {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, "Directory service rejected tag query");
            return Err(Error::DirectoryResponse {
                url: self.host_tags_url.clone(),
                status: status.as_u16(),
                body,
            });
        }

        let parsed: TagResponse = response.json().await?;
        if parsed.succ != 0 || parsed.tag_list.is_empty() {
            return Err(Error::directory_query(
                parsed
                    .err_note
                    .unwrap_or_else(|| format!("succ={} with {} tags", parsed.succ, parsed.tag_list.len())),
            ));
        }

        Ok(parsed.tag_list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> HttpDirectoryClient {
        HttpDirectoryClient::new(
            format!("{}/hosts", server.uri()),
            format!("{}/tags", server.uri()),
            "t0k3n",
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_group_hosts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/hosts"))
            .and(query_param("token", "t0k3n"))
            .and(query_param("tag", "hadoop"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"hosts": ["10.222.16.1", "10.222.16.15"]})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let hosts = client.group_hosts("hadoop").await.unwrap();
        assert_eq!(hosts, vec!["10.222.16.1", "10.222.16.15"]);
    }

    #[tokio::test]
    async fn test_group_hosts_non_200_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/hosts"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        match client.group_hosts("hadoop").await.unwrap_err() {
            Error::DirectoryResponse { status, body, .. } => {
                assert_eq!(status, 503);
                assert_eq!(body, "maintenance");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_host_tags_joins_batch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tags"))
            .and(query_param("hosts", "10.222.16.1_10.222.16.15"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "succ": 0,
                "tag_list": {
                    "10.222.16.1": "cluster,hadoop,cluster_hadoop_hdfs_nn",
                    "10.222.16.15": "cluster,hadoopm,cluster_hadoop_hdfs_dn"
                }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let tags = client
            .host_tags(&["10.222.16.1".to_string(), "10.222.16.15".to_string()])
            .await
            .unwrap();
        assert_eq!(tags["10.222.16.1"], "cluster,hadoop,cluster_hadoop_hdfs_nn");
        assert_eq!(tags.len(), 2);
    }

    #[tokio::test]
    async fn test_host_tags_query_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "succ": 1,
                "tag_list": {},
                "err_note": "token expired"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client.host_tags(&["h1".to_string()]).await.unwrap_err();
        assert_eq!(err.to_string(), "Directory query failed: token expired");
    }

    #[test]
    fn test_from_config_requires_urls() {
        let err = HttpDirectoryClient::from_config(&DirectoryConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
