//! Admin RPC client for a single node.
//!
//! Thin typed wrapper over the node's `/admin` HTTP surface. Transport
//! failures and server rejections map to distinct error variants so the
//! lifecycle layer can retry the former and abort on the latter.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::errors::LinkError;

/// Server response to a load request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Model is loaded and ready.
    Loaded { model_id: String },
    /// Model is not on disk; a confirmation token must be sent back before
    /// the node will start the download.
    DownloadRequired {
        confirmation_token: String,
        message: Option<String>,
    },
    /// Download already in flight.
    Downloading { download_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Downloading,
    Completed,
    Failed,
}

/// Snapshot of one download's progress.
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    pub status: DownloadStatus,
    pub progress_percent: f64,
    pub error: Option<String>,
}

/// Model management operations on a node. Object-safe so the lifecycle
/// layer can run against a mock in tests.
#[async_trait]
pub trait ModelControl: Send + Sync {
    async fn load_model(&self, model_id: &str) -> Result<LoadOutcome, LinkError>;

    /// Confirm a pending download using the token from `DownloadRequired`.
    /// Returns the download id to poll.
    async fn confirm_load(&self, confirmation_token: &str) -> Result<String, LinkError>;

    async fn download_progress(&self, download_id: &str) -> Result<DownloadProgress, LinkError>;

    /// Identifiers of the models currently loaded on the node.
    async fn loaded_models(&self) -> Result<Vec<String>, LinkError>;

    /// Unload a model. A model the node does not know about counts as
    /// already unloaded.
    async fn unload_model(&self, model_id: &str) -> Result<(), LinkError>;
}

/// HTTP implementation of [`ModelControl`] against one node.
pub struct NodeRpcClient {
    base_url: String,
    admin_key: Option<String>,
    client: reqwest::Client,
}

impl NodeRpcClient {
    pub fn new(host: &str, port: u16, admin_key: Option<String>) -> Self {
        Self {
            base_url: crate::probe::http_base_url(host, port),
            admin_key,
            client: reqwest::Client::new(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(key) = &self.admin_key {
            req = req.header("X-Admin-Key", key);
        }
        req
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<(u16, Value), LinkError> {
        let resp = req
            .send()
            .await
            .map_err(|e| LinkError::Transport(e.to_string()))?;
        let status = resp.status().as_u16();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        Ok((status, body))
    }
}

/// Message the server attached to a rejection, or a status-code fallback.
fn rejection_message(status: u16, body: &Value) -> String {
    body.get("detail")
        .or_else(|| body.get("error"))
        .or_else(|| body.get("message"))
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("http_{status}"))
}

#[async_trait]
impl ModelControl for NodeRpcClient {
    async fn load_model(&self, model_id: &str) -> Result<LoadOutcome, LinkError> {
        let req = self
            .request(reqwest::Method::POST, "/admin/models/load")
            .json(&json!({ "model_id": model_id }));
        let (status, body) = self.send(req).await?;

        match status {
            200 => Ok(LoadOutcome::Loaded {
                model_id: body
                    .get("model_id")
                    .and_then(Value::as_str)
                    .unwrap_or(model_id)
                    .to_string(),
            }),
            202 => parse_pending(&body),
            _ => Err(LinkError::Node(rejection_message(status, &body))),
        }
    }

    async fn confirm_load(&self, confirmation_token: &str) -> Result<String, LinkError> {
        let req = self
            .request(reqwest::Method::POST, "/admin/models/load/confirm")
            .json(&json!({ "confirmation_token": confirmation_token }));
        let (status, body) = self.send(req).await?;

        if status == 200 || status == 202 {
            body.get("download_id")
                .and_then(Value::as_str)
                .map(|s| s.to_string())
                .ok_or_else(|| {
                    LinkError::Protocol("confirm response missing download_id".into())
                })
        } else {
            Err(LinkError::Node(rejection_message(status, &body)))
        }
    }

    async fn download_progress(&self, download_id: &str) -> Result<DownloadProgress, LinkError> {
        let req = self.request(
            reqwest::Method::GET,
            &format!("/admin/models/download/{download_id}/progress"),
        );
        let (status, body) = self.send(req).await?;
        if status != 200 {
            return Err(LinkError::Node(rejection_message(status, &body)));
        }

        let status = match body.get("status").and_then(Value::as_str) {
            Some("downloading") => DownloadStatus::Downloading,
            Some("completed") => DownloadStatus::Completed,
            Some("failed") => DownloadStatus::Failed,
            other => {
                return Err(LinkError::Protocol(format!(
                    "unknown download status {other:?}"
                )))
            }
        };
        Ok(DownloadProgress {
            status,
            progress_percent: body
                .get("progress_percent")
                .and_then(Value::as_f64)
                .unwrap_or(0.0),
            error: body
                .get("error")
                .and_then(Value::as_str)
                .map(|s| s.to_string()),
        })
    }

    async fn loaded_models(&self) -> Result<Vec<String>, LinkError> {
        let req = self.request(reqwest::Method::GET, "/admin/models");
        let (status, body) = self.send(req).await?;
        if status != 200 {
            return Err(LinkError::Node(rejection_message(status, &body)));
        }
        Ok(parse_model_list(&body))
    }

    async fn unload_model(&self, model_id: &str) -> Result<(), LinkError> {
        let req = self
            .request(reqwest::Method::POST, "/admin/models/unload")
            .json(&json!({ "model_id": model_id }));
        let (status, body) = self.send(req).await?;
        match status {
            // 404 means the node never had it loaded.
            200 | 404 => Ok(()),
            _ => Err(LinkError::Node(rejection_message(status, &body))),
        }
    }
}

fn parse_pending(body: &Value) -> Result<LoadOutcome, LinkError> {
    match body.get("status").and_then(Value::as_str) {
        Some("download_required") => {
            let token = body
                .get("confirmation_token")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    LinkError::Protocol("download_required without confirmation_token".into())
                })?;
            Ok(LoadOutcome::DownloadRequired {
                confirmation_token: token.to_string(),
                message: body
                    .get("message")
                    .and_then(Value::as_str)
                    .map(|s| s.to_string()),
            })
        }
        Some("downloading") => {
            let id = body
                .get("download_id")
                .and_then(Value::as_str)
                .ok_or_else(|| LinkError::Protocol("downloading without download_id".into()))?;
            Ok(LoadOutcome::Downloading {
                download_id: id.to_string(),
            })
        }
        other => Err(LinkError::Protocol(format!(
            "unexpected pending load status {other:?}"
        ))),
    }
}

/// Accepts both list shapes the admin surface has shipped:
/// `{"models": [{"model_id": ...}]}` and `{"data": [{"id": ...}]}`.
fn parse_model_list(body: &Value) -> Vec<String> {
    #[derive(Deserialize)]
    struct AdminEntry {
        model_id: String,
    }
    #[derive(Deserialize)]
    struct OpenAiEntry {
        id: String,
    }

    if let Some(models) = body.get("models") {
        if let Ok(entries) = serde_json::from_value::<Vec<AdminEntry>>(models.clone()) {
            return entries.into_iter().map(|e| e.model_id).collect();
        }
    }
    if let Some(data) = body.get("data") {
        if let Ok(entries) = serde_json::from_value::<Vec<OpenAiEntry>>(data.clone()) {
            return entries.into_iter().map(|e| e.id).collect();
        }
    }
    Vec::new()
}
