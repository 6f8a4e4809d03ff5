//! Slack connector
//!
//! Posts messages through the Web API `chat.postMessage` method using a bot
//! token. The HTTP client is built on first use and reused until [`SlackService::close`].

use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::config::AppConfig;
use crate::connectors::trait_::{ErrorKind, classify_http_status, classify_transport_error};

pub const SLACK_API_BASE: &str = "https://slack.com/api";

#[derive(Debug, Error)]
pub enum SlackError {
    #[error("Slack returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Slack API error: {error}")]
    Api { error: String },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Slack bot token is not configured; set BIZTOOLS_SLACK_BOT_TOKEN")]
    MissingToken,
}

impl SlackError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SlackError::Http { status, body } => classify_http_status(*status, body, None),
            SlackError::Api { error } if error == "ratelimited" => ErrorKind::RateLimited {
                retry_after_secs: None,
            },
            SlackError::Api { error } if error == "invalid_auth" || error == "not_authed" => {
                ErrorKind::Unauthorized
            }
            SlackError::Network(err) => classify_transport_error(err),
            _ => ErrorKind::Permanent,
        }
    }
}

/// Typed `chat.postMessage` payload.
///
/// Only `channel` is required by Slack; unset fields are omitted from the
/// request body.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SlackMessage {
    pub channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_ts: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mrkdwn: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unfurl_links: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unfurl_media: Option<bool>,
}

impl SlackMessage {
    pub fn new<S: Into<String>>(channel: S) -> Self {
        Self {
            channel: channel.into(),
            ..Default::default()
        }
    }

    pub fn text<S: Into<String>>(mut self, text: S) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn block(mut self, block: Value) -> Self {
        self.blocks.push(block);
        self
    }

    pub fn attachment(mut self, attachment: Value) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Reply in the thread rooted at `ts`.
    pub fn in_thread<S: Into<String>>(mut self, ts: S) -> Self {
        self.thread_ts = Some(ts.into());
        self
    }

    pub fn mrkdwn(mut self, enabled: bool) -> Self {
        self.mrkdwn = Some(enabled);
        self
    }

    pub fn unfurl(mut self, links: bool, media: bool) -> Self {
        self.unfurl_links = Some(links);
        self.unfurl_media = Some(media);
        self
    }
}

/// Slack Web API client bound to one bot token.
pub struct SlackService {
    bot_token: String,
    api_base: String,
    client: Mutex<Option<Client>>,
}

impl SlackService {
    pub fn new<S: Into<String>>(bot_token: S) -> Self {
        Self {
            bot_token: bot_token.into(),
            api_base: SLACK_API_BASE.to_string(),
            client: Mutex::new(None),
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, SlackError> {
        let token = config
            .slack
            .bot_token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .ok_or(SlackError::MissingToken)?;
        Ok(Self::new(token).with_api_base(config.slack.api_base_url.clone()))
    }

    pub fn with_api_base<S: Into<String>>(mut self, api_base: S) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub async fn has_client(&self) -> bool {
        self.client.lock().await.is_some()
    }

    async fn http_client(&self) -> Result<Client, SlackError> {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }
        debug!("Creating Slack HTTP client");
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        *slot = Some(client.clone());
        Ok(client)
    }

    /// Post a message, returning Slack's JSON response.
    pub async fn post_message<M: Serialize + ?Sized>(&self, message: &M) -> Result<Value, SlackError> {
        let body = serde_json::to_value(message)?;
        let client = self.http_client().await?;

        let response = client
            .post(format!("{}/chat.postMessage", self.api_base))
            .bearer_auth(&self.bot_token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() != 200 {
            let body = response.text().await.unwrap_or_default();
            return Err(SlackError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let payload: Value = response.json().await?;
        if payload.get("ok").and_then(Value::as_bool) == Some(false) {
            let error = payload
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown_error")
                .to_string();
            return Err(SlackError::Api { error });
        }

        Ok(payload)
    }

    /// Post a message, logging any failure and returning `None` instead.
    pub async fn send_message<M: Serialize + ?Sized>(&self, message: &M) -> Option<Value> {
        match self.post_message(message).await {
            Ok(payload) => Some(payload),
            Err(err @ SlackError::Http { .. }) => {
                error!(error = %err, "Error while sending Slack message, error is: {}", err);
                None
            }
            Err(err) => {
                error!(error = %err, "Error while posting to Slack API, err is: {}", err);
                None
            }
        }
    }

    /// Drop the HTTP client; the next call builds a new one.
    pub async fn close(&self) {
        self.client.lock().await.take();
    }
}
