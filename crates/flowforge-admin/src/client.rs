use anyhow::{anyhow, bail, Context};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;

/// Thin client for the FlowForge HTTP API
pub struct ApiClient {
    base: String,
    http: Client,
}

impl ApiClient {
    pub fn new(base: &str) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("building HTTP client")?;
        Ok(ApiClient {
            base: base.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub async fn submit(&self, payload: Value) -> anyhow::Result<Value> {
        let response = self
            .http
            .post(self.url("/tasks"))
            .json(&serde_json::json!({ "payload": payload }))
            .send()
            .await
            .with_context(|| format!("POST {}", self.url("/tasks")))?;
        decode(response).await
    }

    pub async fn task(&self, id: &str) -> anyhow::Result<Value> {
        let path = format!("/tasks/{}", id);
        self.get(&path, &[]).await
    }

    pub async fn list(&self, status: Option<&str>, limit: usize) -> anyhow::Result<Vec<Value>> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(status) = status {
            query.push(("status", status.to_string()));
        }
        self.get("/tasks", &query).await
    }

    pub async fn stats(&self) -> anyhow::Result<Value> {
        self.get("/stats", &[]).await
    }

    /// `Ok(())` when `/health` answers 200 with `"status": "ok"`.
    pub async fn health(&self) -> anyhow::Result<()> {
        let body: Value = self.get("/health", &[]).await?;
        match body["status"].as_str() {
            Some("ok") => Ok(()),
            other => bail!("unexpected status {:?}", other.unwrap_or("missing")),
        }
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> anyhow::Result<T> {
        let url = self.url(path);
        let response = self
            .http
            .get(&url)
            .query(query)
            .send()
            .await
            .with_context(|| format!("GET {}", url))?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> anyhow::Result<T> {
    let status = response.status();
    if status.is_success() {
        return response.json().await.context("decoding response");
    }
    let message = response
        .json::<Value>()
        .await
        .ok()
        .and_then(|body| body["error"].as_str().map(str::to_string))
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string());
    Err(match status {
        StatusCode::NOT_FOUND => anyhow!("Not found: {}", message),
        _ => anyhow!("API returned {}: {}", status.as_u16(), message),
    })
}
