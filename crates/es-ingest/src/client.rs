//! Elasticsearch client wrapper
//!
//! Implements [`ClusterApi`] over the REST API: alias lookups, templates,
//! bulk submissions and the asynchronous task endpoints.

use async_trait::async_trait;
use es_sync_core::prelude::*;
use es_sync_core::{ChannelMetrics, ElasticsearchConfig};
use reqwest::{Client, Method, Response, StatusCode};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{debug, trace, warn};

use crate::retry::RetryPolicy;

/// Elasticsearch client
pub struct EsClient {
    client: Client,
    config: ElasticsearchConfig,
    retry_policy: RetryPolicy,
    metrics: ChannelMetrics,
    host_index: AtomicUsize,
}

impl EsClient {
    /// Create new ES client
    pub fn new(config: ElasticsearchConfig, retry_policy: RetryPolicy) -> Result<Self> {
        if config.hosts.is_empty() {
            return Err(SyncError::config("at least one Elasticsearch host is required"));
        }

        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SyncError::elasticsearch_with_source("Failed to create client", e))?;

        Ok(Self {
            client,
            config,
            retry_policy,
            metrics: ChannelMetrics::new("es_client"),
            host_index: AtomicUsize::new(0),
        })
    }

    /// Get the current host (round-robin for load balancing)
    fn get_host(&self) -> &str {
        let idx = self.host_index.fetch_add(1, Ordering::Relaxed) % self.config.hosts.len();
        self.config.hosts[idx].trim_end_matches('/')
    }

    /// Build request with authentication
    fn build_request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.get_host(), path);
        let mut req = self.client.request(method, &url);

        if let Some(ref api_key) = self.config.api_key {
            req = req.header("Authorization", format!("ApiKey {}", api_key));
        } else if let (Some(ref user), Some(ref pass)) =
            (&self.config.username, &self.config.password)
        {
            req = req.basic_auth(user, Some(pass));
        }

        req.header("Content-Type", "application/json")
    }

    async fn send(&self, req: reqwest::RequestBuilder, operation: &str) -> Result<Response> {
        req.send()
            .await
            .map_err(|e| SyncError::elasticsearch_with_source(format!("{} failed", operation), e))
    }

    /// Turn a non-2xx response into an error carrying the remote diagnostic
    async fn expect_success(resp: Response, operation: &str) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(SyncError::elasticsearch(format!(
            "{} failed: {} - {}",
            operation, status, body
        )))
    }

    async fn json_body(resp: Response, operation: &str) -> Result<Value> {
        resp.json().await.map_err(|e| {
            SyncError::elasticsearch_with_source(
                format!("Failed to parse {} response", operation),
                e,
            )
        })
    }
}

#[async_trait]
impl ClusterApi for EsClient {
    async fn exists(&self, target: &str) -> Result<bool> {
        let path = format!("/{}", target);
        let resp = self
            .send(self.build_request(Method::HEAD, &path), "Existence check")
            .await?;

        match resp.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(SyncError::elasticsearch(format!(
                "Existence check for `{}` returned {}",
                target, status
            ))),
        }
    }

    async fn resolve_alias(&self, alias: &str) -> Result<Vec<String>> {
        let path = format!("/_alias/{}", alias);
        let resp = self
            .send(self.build_request(Method::GET, &path), "Alias lookup")
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let resp = Self::expect_success(resp, "Alias lookup").await?;
        let body = Self::json_body(resp, "alias lookup").await?;

        let mut indices: Vec<String> = body
            .as_object()
            .map(|o| o.keys().cloned().collect())
            .unwrap_or_default();
        indices.sort();
        trace!(alias, ?indices, "Resolved alias");
        Ok(indices)
    }

    async fn create_index(&self, index: &str) -> Result<bool> {
        let path = format!("/{}", index);
        let resp = self
            .send(self.build_request(Method::PUT, &path), "Create index")
            .await?;

        if resp.status() == StatusCode::BAD_REQUEST {
            let body = resp.text().await.unwrap_or_default();
            if body.contains("resource_already_exists_exception") {
                debug!(index, "Index already exists");
                return Ok(false);
            }
            return Err(SyncError::elasticsearch(format!(
                "Create index `{}` failed: {}",
                index, body
            )));
        }
        Self::expect_success(resp, "Create index").await?;
        debug!(index, "Created index");
        Ok(true)
    }

    async fn refresh(&self, target: &str) -> Result<bool> {
        let path = format!("/{}/_refresh", target);
        let resp = self
            .send(self.build_request(Method::POST, &path), "Refresh")
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            warn!(target, "Refresh target does not exist");
            return Ok(false);
        }
        Self::expect_success(resp, "Refresh").await?;
        Ok(true)
    }

    async fn update_aliases(&self, actions: Vec<Value>) -> Result<bool> {
        let body = json!({ "actions": actions });
        let resp = self
            .send(
                self.build_request(Method::POST, "/_aliases").json(&body),
                "Alias update",
            )
            .await?;
        let resp = Self::expect_success(resp, "Alias update").await?;
        let body = Self::json_body(resp, "alias update").await?;
        Ok(body["acknowledged"].as_bool().unwrap_or(false))
    }

    async fn get_index_template(&self, name: &str) -> Result<Option<Value>> {
        let path = format!("/_index_template/{}", name);
        let resp = self
            .send(self.build_request(Method::GET, &path), "Template lookup")
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = Self::expect_success(resp, "Template lookup").await?;
        let body = Self::json_body(resp, "template lookup").await?;

        Ok(body["index_templates"]
            .as_array()
            .and_then(|templates| {
                templates
                    .iter()
                    .find(|t| t["name"].as_str() == Some(name))
                    .or_else(|| templates.first())
            })
            .map(|t| t["index_template"].clone()))
    }

    async fn put_index_template(&self, name: &str, body: &Value) -> Result<()> {
        let path = format!("/_index_template/{}", name);
        let resp = self
            .send(
                self.build_request(Method::PUT, &path).json(body),
                "Template registration",
            )
            .await?;
        Self::expect_success(resp, "Template registration").await?;
        debug!(template = name, "Registered index template");
        Ok(())
    }

    async fn bulk(&self, body: String) -> Result<BulkResponse> {
        if body.is_empty() {
            return Ok(BulkResponse::default());
        }

        let start = Instant::now();
        let mut attempts = 0;
        let response = loop {
            attempts += 1;

            let resp = self
                .build_request(Method::POST, "/_bulk")
                .header("Content-Type", "application/x-ndjson")
                .body(body.clone())
                .send()
                .await;

            match resp {
                Ok(r) if r.status().is_success() => {
                    self.metrics.record_bulk_request("success");
                    break Self::json_body(r, "bulk").await.and_then(|v| {
                        serde_json::from_value::<BulkResponse>(v).map_err(SyncError::from)
                    })?;
                }
                Ok(r) => {
                    let status = r.status();
                    self.metrics.record_bulk_request(status.as_str());
                    if RetryPolicy::is_retryable_status(status)
                        && self.retry_policy.should_retry(attempts)
                    {
                        warn!(%status, attempts, "Bulk request rejected, retrying");
                        self.metrics.record_retry();
                        tokio::time::sleep(self.retry_policy.delay(attempts)).await;
                        continue;
                    }
                    let text = r.text().await.unwrap_or_default();
                    return Err(SyncError::elasticsearch(format!(
                        "Bulk failed: {} - {}",
                        status, text
                    )));
                }
                Err(e) => {
                    self.metrics.record_bulk_request("transport_error");
                    if self.retry_policy.should_retry(attempts) {
                        warn!(error = %e, attempts, "Bulk request failed, retrying");
                        self.metrics.record_retry();
                        tokio::time::sleep(self.retry_policy.delay(attempts)).await;
                        continue;
                    }
                    return Err(SyncError::elasticsearch_with_source("Bulk request failed", e));
                }
            }
        };

        self.metrics.record_bulk_latency(start.elapsed());
        debug!(
            took = response.took,
            errors = response.errors,
            items = response.items.len(),
            attempts,
            "Bulk operation completed"
        );
        Ok(response)
    }

    async fn start_reindex(&self, body: &Value) -> Result<Value> {
        let resp = self
            .send(
                self.build_request(Method::POST, "/_reindex?wait_for_completion=false")
                    .json(body),
                "Reindex",
            )
            .await?;
        let resp = Self::expect_success(resp, "Reindex").await?;
        Self::json_body(resp, "reindex").await
    }

    async fn start_delete_by_query(&self, target: &str, body: &Value) -> Result<Value> {
        let path = format!("/{}/_delete_by_query?wait_for_completion=false", target);
        let resp = self
            .send(
                self.build_request(Method::POST, &path).json(body),
                "Delete by query",
            )
            .await?;
        let resp = Self::expect_success(resp, "Delete by query").await?;
        Self::json_body(resp, "delete by query").await
    }

    async fn task_status(&self, task_id: &str) -> Result<Value> {
        let path = format!("/_tasks/{}", task_id);
        let resp = self
            .send(self.build_request(Method::GET, &path), "Task status")
            .await?;
        let resp = Self::expect_success(resp, "Task status").await?;
        Self::json_body(resp, "task status").await
    }
}
