//! Mail transport boundary: the trait the dispatch engine sends through,
//! and an HTTP JSON mail-API client as the production implementation.
use crate::config::Transport as TransportConfig;
use crate::model::RenderedLetter;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use tracing::warn;

/// Result of one delivery attempt as seen by the engine. Transport-level
/// problems are outcomes, not errors: a failed recipient never aborts the
/// surrounding run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Sent,
    Bounced(String),
    Failed(String),
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, message: &RenderedLetter, to: &str) -> Outcome;
}

#[derive(Clone)]
pub struct HttpMailTransport {
    http: Client,
    endpoint: Url,
    api_key: String,
    from_address: String,
}

impl fmt::Debug for HttpMailTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpMailTransport")
            .field("endpoint", &self.endpoint)
            .field("from_address", &self.from_address)
            .finish_non_exhaustive()
    }
}

impl HttpMailTransport {
    pub fn from_config(cfg: &TransportConfig) -> Result<Self> {
        let endpoint = Url::parse(&cfg.endpoint).context("invalid transport.endpoint URL")?;
        Ok(Self::with_endpoint(
            endpoint,
            cfg.api_key.clone(),
            cfg.from_address.clone(),
        ))
    }

    pub fn with_endpoint(endpoint: Url, api_key: String, from_address: String) -> Self {
        let http = Client::builder()
            .user_agent("letterflow/0.1")
            .build()
            .expect("reqwest client");
        Self {
            http,
            endpoint,
            api_key,
            from_address,
        }
    }

    fn message_body(&self, message: &RenderedLetter, to: &str) -> Value {
        json!({
            "from": self.from_address,
            "to": to,
            "subject": message.subject,
            "body": message.body,
        })
    }
}

#[async_trait]
impl MailTransport for HttpMailTransport {
    async fn send(&self, message: &RenderedLetter, to: &str) -> Outcome {
        let body = self.message_body(message, to);
        let res = self
            .http
            .post(self.endpoint.clone())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await;

        let res = match res {
            Ok(res) => res,
            Err(err) => return Outcome::Failed(format!("failed to reach mail API: {err}")),
        };

        let status = res.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let text = res.text().await.unwrap_or_default();
            warn!(to, "rate limited by mail API: {}", text);
            return Outcome::Failed(format!("received 429 from mail API: {text}"));
        }
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            warn!(to, %status, "mail API error: {}", text);
            return Outcome::Failed(format!("mail API error {status}: {text}"));
        }

        match res.json::<SendResponse>().await {
            Ok(payload) => parse_outcome(&payload),
            Err(err) => Outcome::Failed(format!("invalid mail API response JSON: {err}")),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    status: String,
    #[serde(default)]
    reason: Option<String>,
}

fn parse_outcome(payload: &SendResponse) -> Outcome {
    let reason = || payload.reason.clone().unwrap_or_default();
    match payload.status.as_str() {
        "sent" => Outcome::Sent,
        "bounced" => Outcome::Bounced(reason()),
        "failed" => Outcome::Failed(reason()),
        other => Outcome::Failed(format!("unknown mail API status '{other}'")),
    }
}
