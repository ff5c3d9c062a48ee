use anyhow::{Context, Result};
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// JSON client for a running `fleet-control` daemon.
#[derive(Clone)]
pub struct Client {
    base_url: Url,
    http: reqwest::Client,
    user_agent: String,
}

impl Client {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url).context("Invalid server URL")?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            base_url,
            http,
            user_agent: format!("fleetctl/{}", env!("CARGO_PKG_VERSION")),
        })
    }

    pub fn build_url(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).with_context(|| {
            format!(
                "Failed to join base_url={} with path={}",
                self.base_url, path
            )
        })
    }

    pub async fn send_json_bytes(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Vec<u8>> {
        let url = self.build_url(path)?;
        let req_id = Uuid::new_v4().to_string();

        let mut req = self
            .http
            .request(method.clone(), url.clone())
            .header("user-agent", &self.user_agent)
            .header("x-request-id", &req_id);
        if let Some(b) = &body {
            req = req.json(b);
        }

        debug!("HTTP {} {} request_id={}", method, url, req_id);
        let resp = req.send().await.context("Request failed")?;
        let status = resp.status();
        let bytes = resp.bytes().await.unwrap_or_default().to_vec();

        if !status.is_success() {
            anyhow::bail!(
                "HTTP {} {} failed: status={} body={}",
                method,
                url,
                status.as_u16(),
                String::from_utf8_lossy(&bytes)
            );
        }
        Ok(bytes)
    }

    pub async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        let bytes = self.send_json_bytes(method.clone(), path, body).await?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("Unexpected response from {} {}", method, path))
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send_json(Method::GET, path, None).await
    }
}
