//! HTTP driver: JSON calls to a browser-automation sidecar.
//!
//! The sidecar owns the real browser sessions; this client only speaks its
//! small REST surface:
//!
//! * `POST {base}/sessions/{id}/ensure`: open/check a session
//! * `POST {base}/sessions/{id}/submit`: submit one job
//! * `POST {base}/sessions/{id}/scan`: list rendered items
//! * `GET  {base}/sessions/{id}/credits`: remaining credits
//! * `POST {base}/sessions/{id}/close`: tear the session down

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::driver::{ScanItem, SessionDriver, SessionStatus, Submission, SubmitReceipt};
use crate::error::DriverError;
use crate::workers::WorkerConfig;

#[derive(Debug, Deserialize)]
struct EnsureResponse {
    authenticated: bool,
}

#[derive(Debug, Deserialize)]
struct ScanResponse {
    #[serde(default)]
    items: Vec<ScanItem>,
}

#[derive(Debug, Deserialize)]
struct CreditsResponse {
    #[serde(default)]
    remaining: Option<u32>,
}

/// Client for a single automation sidecar.
pub struct HttpDriver {
    client: reqwest::Client,
    base_url: String,
    token: Option<SecretString>,
}

impl HttpDriver {
    pub fn new(base_url: impl Into<String>, token: Option<SecretString>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, token)
    }

    /// Reuse an existing [`reqwest::Client`] (connection pooling).
    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        token: Option<SecretString>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    /// `{base}/sessions/{worker_id}/{action}`, with the id escaped as a
    /// single path segment.
    fn url(&self, worker_id: &str, action: &str) -> Result<Url, DriverError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| DriverError::Transport(format!("invalid sidecar url {}: {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|_| DriverError::Transport(format!("sidecar url {} cannot have a path", self.base_url)))?
            .pop_if_empty()
            .extend(["sessions", worker_id, action]);
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        worker_id: &str,
        action: &str,
        body: &serde_json::Value,
    ) -> Result<T, DriverError> {
        let request = self.authorize(self.client.post(self.url(worker_id, action)?).json(body));
        let response = request.send().await.map_err(transport)?;
        let response = ensure_success(worker_id, response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| DriverError::Transport(format!("decode {action} response: {e}")))
    }
}

#[async_trait]
impl SessionDriver for HttpDriver {
    async fn ensure_session(&self, worker: &WorkerConfig) -> Result<SessionStatus, DriverError> {
        let body = serde_json::json!({
            "credential_ref": worker.credential_ref,
            "label": worker.label,
        });
        match self
            .post_json::<EnsureResponse>(&worker.id, "ensure", &body)
            .await
        {
            Ok(r) if r.authenticated => Ok(SessionStatus::Authenticated),
            Ok(_) | Err(DriverError::SessionInvalid { .. }) => Ok(SessionStatus::NeedsAuthentication),
            Err(e) => Err(e),
        }
    }

    async fn submit_job(
        &self,
        worker_id: &str,
        submission: &Submission,
    ) -> Result<SubmitReceipt, DriverError> {
        let body = serde_json::to_value(submission)
            .map_err(|e| DriverError::Transport(format!("encode submission: {e}")))?;
        self.post_json(worker_id, "submit", &body).await
    }

    async fn scan_for_completion(&self, worker_id: &str) -> Result<Vec<ScanItem>, DriverError> {
        let response: ScanResponse = self
            .post_json(worker_id, "scan", &serde_json::json!({}))
            .await?;
        Ok(response.items)
    }

    async fn remaining_credits(&self, worker_id: &str) -> Result<Option<u32>, DriverError> {
        let request = self.authorize(self.client.get(self.url(worker_id, "credits")?));
        let response = request.send().await.map_err(transport)?;
        let response = ensure_success(worker_id, response).await?;
        let credits: CreditsResponse = response
            .json()
            .await
            .map_err(|e| DriverError::Transport(format!("decode credits response: {e}")))?;
        Ok(credits.remaining)
    }

    async fn close(&self, worker_id: &str) -> Result<(), DriverError> {
        let request = self.authorize(self.client.post(self.url(worker_id, "close")?));
        let response = request.send().await.map_err(transport)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        ensure_success(worker_id, response).await?;
        Ok(())
    }
}

fn transport(e: reqwest::Error) -> DriverError {
    if e.is_timeout() {
        DriverError::Unavailable(format!("sidecar timed out: {e}"))
    } else {
        DriverError::Transport(e.to_string())
    }
}

/// Map a non-2xx sidecar response onto the driver error taxonomy.
async fn ensure_success(
    worker_id: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, DriverError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    Err(classify_status(worker_id, status, body))
}

fn classify_status(worker_id: &str, status: StatusCode, body: String) -> DriverError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => DriverError::SessionInvalid {
            worker_id: worker_id.to_string(),
        },
        StatusCode::NOT_FOUND => DriverError::NoSession {
            worker_id: worker_id.to_string(),
        },
        StatusCode::TOO_MANY_REQUESTS => DriverError::Unavailable(format!("{status}: {body}")),
        s if s.is_server_error() => DriverError::Unavailable(format!("{status}: {body}")),
        _ => DriverError::Rejected(format!("{status}: {body}")),
    }
}
