//! HTTP client the CLI uses to talk to a running daemon.

use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;

use super::types::{
    AnswerRequest, AttentionItem, CreateUnitRequest, ErrorBody, StatusReport, VerdictRequest,
};
use crate::core::{UnitStatus, Verdict, WorkUnit};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct DaemonClient {
    client: Client,
    base_url: String,
}

impl DaemonClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.base_url, path)
    }

    /// Turn a non-2xx response into an error carrying the server's message.
    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|body| body.error)
            .unwrap_or(text);
        Err(Error::Daemon(format!("{status}: {message}")))
    }

    async fn json<T: DeserializeOwned>(response: Response) -> Result<T> {
        Ok(Self::check(response).await?.json().await?)
    }

    /// True when the daemon answers its health check quickly.
    pub async fn is_healthy(&self) -> bool {
        let health = self
            .client
            .get(self.url("/health"))
            .timeout(Duration::from_millis(500))
            .send()
            .await;
        matches!(health, Ok(r) if r.status().is_success())
    }

    pub async fn status(&self) -> Result<StatusReport> {
        Self::json(self.client.get(self.url("/status")).send().await?).await
    }

    pub async fn list(&self, status: Option<UnitStatus>) -> Result<Vec<WorkUnit>> {
        let path = match status {
            Some(status) => format!("/units?status={}", status.as_str()),
            None => "/units".to_string(),
        };
        Self::json(self.client.get(self.url(&path)).send().await?).await
    }

    pub async fn get(&self, id: &str) -> Result<WorkUnit> {
        Self::json(self.client.get(self.url(&format!("/units/{id}"))).send().await?).await
    }

    pub async fn create(&self, request: &CreateUnitRequest) -> Result<WorkUnit> {
        Self::json(self.client.post(self.url("/units")).json(request).send().await?).await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("/units/{id}")))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn attention(&self) -> Result<Vec<AttentionItem>> {
        Self::json(self.client.get(self.url("/attention")).send().await?).await
    }

    pub async fn answer(&self, id: &str, answer: &str) -> Result<WorkUnit> {
        let body = AnswerRequest {
            answer: answer.to_string(),
        };
        let response = self
            .client
            .post(self.url(&format!("/units/{id}/answer")))
            .json(&body)
            .send()
            .await?;
        Self::json(response).await
    }

    pub async fn verdict(&self, id: &str, verdict: Verdict) -> Result<WorkUnit> {
        let response = self
            .client
            .post(self.url(&format!("/units/{id}/verdict")))
            .json(&VerdictRequest { verdict })
            .send()
            .await?;
        Self::json(response).await
    }

    pub async fn retry(&self, id: &str) -> Result<WorkUnit> {
        let response = self
            .client
            .post(self.url(&format!("/units/{id}/retry")))
            .send()
            .await?;
        Self::json(response).await
    }
}
