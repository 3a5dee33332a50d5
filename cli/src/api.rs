use crate::error::{CliError, Result};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::time::timeout;

/// HTTP client for one agent's control plane
#[derive(Clone)]
pub struct AgentClient {
    client: Client,
    base_url: String,
    timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub agent_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Liveness plus readiness of one agent
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub url: String,
    pub agent_id: String,
    pub heartbeat: chrono::DateTime<chrono::Utc>,
    pub online: bool,
}

impl AgentClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder().build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(30),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn request_with_timeout<T>(&self, future: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        timeout(self.timeout, future).await.map_err(|_| CliError::Timeout)?
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Response> {
        request.send().await.map_err(|e| {
            if e.is_connect() {
                CliError::ServiceUnavailable { url: self.base_url.clone() }
            } else if e.is_timeout() {
                CliError::Timeout
            } else {
                CliError::Http(e)
            }
        })
    }

    async fn error_for(response: Response) -> CliError {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        let message = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|body| body.get("error").and_then(Value::as_str).map(String::from))
            .unwrap_or_else(|| format!("HTTP {}: {}", status, text));
        CliError::Api { message }
    }

    pub async fn heartbeat(&self) -> Result<Heartbeat> {
        self.request_with_timeout(async {
            let response = self.send(self.client.get(self.url("/heartbeat"))).await?;
            if !response.status().is_success() {
                return Err(Self::error_for(response).await);
            }
            Ok(response.json::<Heartbeat>().await?)
        })
        .await
    }

    /// Readiness: `false` on 503, errors on anything else unexpected
    pub async fn online(&self) -> Result<bool> {
        self.request_with_timeout(async {
            let response = self.send(self.client.get(self.url("/status/online"))).await?;
            match response.status() {
                status if status.is_success() => Ok(true),
                StatusCode::SERVICE_UNAVAILABLE => Ok(false),
                _ => Err(Self::error_for(response).await),
            }
        })
        .await
    }

    pub async fn status(&self) -> Result<AgentStatus> {
        let heartbeat = self.heartbeat().await?;
        let online = self.online().await?;

        Ok(AgentStatus {
            url: self.base_url.clone(),
            agent_id: heartbeat.agent_id,
            heartbeat: heartbeat.timestamp,
            online,
        })
    }

    pub async fn get_state(&self, name: &str) -> Result<Value> {
        self.request_with_timeout(async {
            let response = self.send(self.client.get(self.url(&format!("/state/{}", name)))).await?;
            match response.status() {
                StatusCode::NOT_FOUND => Err(CliError::StateNotFound { name: name.to_string() }),
                status if status.is_success() => Ok(response.json::<Value>().await?),
                _ => Err(Self::error_for(response).await),
            }
        })
        .await
    }

    pub async fn put_state(&self, name: &str, document: &Value) -> Result<Value> {
        self.request_with_timeout(async {
            let response = self
                .send(self.client.put(self.url(&format!("/state/{}", name))).json(document))
                .await?;
            if !response.status().is_success() {
                return Err(Self::error_for(response).await);
            }
            Ok(response.json::<Value>().await?)
        })
        .await
    }

    pub async fn delete_state(&self, name: &str) -> Result<()> {
        self.request_with_timeout(async {
            let response = self.send(self.client.delete(self.url(&format!("/state/{}", name)))).await?;
            if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
                Ok(())
            } else {
                Err(Self::error_for(response).await)
            }
        })
        .await
    }

    pub async fn register_exit(&self, instance: &str) -> Result<()> {
        self.request_with_timeout(async {
            let response = self
                .send(self.client.put(self.url(&format!("/notifications/exit/{}", instance))))
                .await?;
            if response.status().is_success() {
                Ok(())
            } else {
                Err(Self::error_for(response).await)
            }
        })
        .await
    }

    pub async fn notify_exit(&self, instance: &str) -> Result<()> {
        self.request_with_timeout(async {
            let response = self
                .send(self.client.delete(self.url(&format!("/notifications/exit/{}", instance))))
                .await?;
            if response.status().is_success() {
                Ok(())
            } else {
                Err(Self::error_for(response).await)
            }
        })
        .await
    }
}
