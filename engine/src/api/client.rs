//! HTTP client for a peer agent's control plane

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use serde_json::Value;
use tokio::time::timeout;

use super::ControlPlane;
use crate::error::{ApiError, ConfigError, Result};

#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    client: Client,
    base_url: String,
    base: Url,
    timeout: Duration,
}

impl ControlPlaneClient {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/');
        let base = Url::parse(base_url)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| ConfigError::InvalidValue { field: "control plane URL".to_string(), value: base_url.to_string() })?;

        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ApiError::Unreachable { uri: base_url.to_string(), reason: e.to_string() })?;

        Ok(Self {
            client,
            base_url: base_url.to_string(),
            base,
            timeout: request_timeout,
        })
    }

    /// Client for the agent at `host:port`
    pub fn for_host(host: &str, port: u16, request_timeout: Duration) -> Result<Self> {
        Self::new(&format!("http://{}:{}", host, port), request_timeout)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// URL for a route whose last segment is caller-supplied, percent-encoded
    fn resource_url(&self, route: &[&str], name: &str) -> String {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(route).push(name);
        }
        url.to_string()
    }

    async fn request_with_timeout<T>(&self, uri: &str, future: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        timeout(self.timeout, future).await.map_err(|_| ApiError::Unreachable {
            uri: uri.to_string(),
            reason: format!("no response within {:?}", self.timeout),
        })?
    }

    async fn error_for(&self, uri: &str, response: Response) -> ApiError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        ApiError::Status { uri: uri.to_string(), status, body }
    }

    async fn handle_response(&self, uri: &str, response: Response) -> Result<()> {
        if response.status().is_success() {
            Ok(())
        } else {
            Err(self.error_for(uri, response).await.into())
        }
    }
}

#[async_trait]
impl ControlPlane for ControlPlaneClient {
    fn endpoint(&self) -> String {
        self.base_url.clone()
    }

    async fn heartbeat(&self) -> Result<()> {
        let uri = self.url("/heartbeat");
        self.request_with_timeout(&uri, async {
            let response = self.client.get(&uri).send().await.map_err(ApiError::from)?;
            self.handle_response(&uri, response).await
        })
        .await
    }

    async fn is_server_online(&self) -> Result<bool> {
        let uri = self.url("/status/online");
        self.request_with_timeout(&uri, async {
            let response = self.client.get(&uri).send().await.map_err(ApiError::from)?;
            Ok(response.status().is_success())
        })
        .await
    }

    async fn get_state(&self, name: &str) -> Result<Option<Value>> {
        let uri = self.resource_url(&["state"], name);
        self.request_with_timeout(&uri, async {
            let response = self.client.get(&uri).send().await.map_err(ApiError::from)?;
            match response.status() {
                StatusCode::NOT_FOUND => Ok(None),
                status if status.is_success() => {
                    let document = response.json::<Value>().await.map_err(ApiError::from)?;
                    Ok(Some(document))
                }
                _ => Err(self.error_for(&uri, response).await.into()),
            }
        })
        .await
    }

    async fn update_state(&self, name: &str, document: &Value) -> Result<()> {
        let uri = self.resource_url(&["state"], name);
        self.request_with_timeout(&uri, async {
            let response = self.client.put(&uri).json(document).send().await.map_err(ApiError::from)?;
            self.handle_response(&uri, response).await
        })
        .await
    }

    async fn delete_state(&self, name: &str) -> Result<()> {
        let uri = self.resource_url(&["state"], name);
        self.request_with_timeout(&uri, async {
            let response = self.client.delete(&uri).send().await.map_err(ApiError::from)?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(());
            }
            self.handle_response(&uri, response).await
        })
        .await
    }

    async fn register_exit_notification(&self, instance: &str) -> Result<()> {
        let uri = self.resource_url(&["notifications", "exit"], instance);
        self.request_with_timeout(&uri, async {
            let response = self.client.put(&uri).send().await.map_err(ApiError::from)?;
            self.handle_response(&uri, response).await
        })
        .await
    }

    async fn notify_exit(&self, instance: &str) -> Result<()> {
        let uri = self.resource_url(&["notifications", "exit"], instance);
        self.request_with_timeout(&uri, async {
            let response = self.client.delete(&uri).send().await.map_err(ApiError::from)?;
            self.handle_response(&uri, response).await
        })
        .await
    }
}
