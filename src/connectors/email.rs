//! Azure Communication Services Email connector
//!
//! Sends mail through the ACS Email REST API (`api-version=2023-03-31`).
//! Requests are authenticated with the resource access key using HMAC-SHA256
//! request signing. Sending is a long-running operation: `begin_send` returns
//! an [`EmailSendPoller`] that tracks the operation until it settles.

use std::sync::Arc;
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::connectors::trait_::{
    ErrorKind, classify_http_status, classify_transport_error, retry_after_from_headers,
};
use crate::error::body_snippet;

type HmacSha256 = Hmac<Sha256>;

pub const EMAIL_API_VERSION: &str = "2023-03-31";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum EmailError {
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),
    #[error("email API returned {status}: {message}")]
    Api {
        status: u16,
        message: String,
        kind: ErrorKind,
    },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl EmailError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EmailError::Api { kind, .. } => kind.clone(),
            EmailError::Network(err) => classify_transport_error(err),
            _ => ErrorKind::Permanent,
        }
    }
}

/// Recipient or reply-to address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailAddress {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl EmailAddress {
    pub fn new<S: Into<String>>(address: S) -> Self {
        Self {
            address: address.into(),
            display_name: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailContent {
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plain_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmailRecipients {
    #[serde(default)]
    pub to: Vec<EmailAddress>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<EmailAddress>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bcc: Vec<EmailAddress>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailAttachment {
    pub name: String,
    pub content_type: String,
    pub content_in_base64: String,
}

impl EmailAttachment {
    pub fn from_bytes<S: Into<String>>(name: S, content_type: S, bytes: &[u8]) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            content_in_base64: STANDARD.encode(bytes),
        }
    }
}

/// Body of an `emails:send` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailMessage {
    pub sender_address: String,
    pub content: EmailContent,
    pub recipients: EmailRecipients,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reply_to: Vec<EmailAddress>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<EmailAttachment>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub user_engagement_tracking_disabled: bool,
}

impl EmailMessage {
    pub fn new<S: Into<String>>(sender: S, subject: S) -> Self {
        Self {
            sender_address: sender.into(),
            content: EmailContent {
                subject: subject.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn to<S: Into<String>>(mut self, address: S) -> Self {
        self.recipients.to.push(EmailAddress::new(address));
        self
    }

    pub fn cc<S: Into<String>>(mut self, address: S) -> Self {
        self.recipients.cc.push(EmailAddress::new(address));
        self
    }

    pub fn bcc<S: Into<String>>(mut self, address: S) -> Self {
        self.recipients.bcc.push(EmailAddress::new(address));
        self
    }

    pub fn plain_text<S: Into<String>>(mut self, text: S) -> Self {
        self.content.plain_text = Some(text.into());
        self
    }

    pub fn html<S: Into<String>>(mut self, html: S) -> Self {
        self.content.html = Some(html.into());
        self
    }

    pub fn attachment(mut self, attachment: EmailAttachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Every recipient address (to, cc, bcc) for logging.
    pub fn recipient_addresses(&self) -> Vec<&str> {
        self.recipients
            .to
            .iter()
            .chain(&self.recipients.cc)
            .chain(&self.recipients.bcc)
            .map(|r| r.address.as_str())
            .collect()
    }
}

/// Status of a send operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmailSendStatus {
    NotStarted,
    Running,
    Succeeded,
    Failed,
    Canceled,
    #[serde(other)]
    Unknown,
}

impl EmailSendStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EmailSendStatus::Succeeded | EmailSendStatus::Failed | EmailSendStatus::Canceled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailSendResult {
    pub id: String,
    pub status: EmailSendStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// Parsed `endpoint=...;accesskey=...` connection string.
#[derive(Clone)]
struct ConnectionString {
    endpoint: Url,
    access_key: Vec<u8>,
}

impl ConnectionString {
    fn parse(raw: &str) -> Result<Self, EmailError> {
        let mut endpoint = None;
        let mut access_key = None;

        for part in raw.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((key, value)) = part.split_once('=') else {
                return Err(EmailError::InvalidConnectionString(format!(
                    "segment '{}' is not key=value",
                    part
                )));
            };
            match key.trim().to_ascii_lowercase().as_str() {
                "endpoint" => endpoint = Some(value.trim().to_string()),
                "accesskey" => access_key = Some(value.trim().to_string()),
                _ => {}
            }
        }

        let endpoint = endpoint
            .ok_or_else(|| EmailError::InvalidConnectionString("missing endpoint".to_string()))?;
        let mut endpoint = Url::parse(&endpoint)
            .map_err(|e| EmailError::InvalidConnectionString(format!("endpoint: {}", e)))?;
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }
        let access_key = access_key
            .ok_or_else(|| EmailError::InvalidConnectionString("missing accesskey".to_string()))?;
        let access_key = STANDARD
            .decode(access_key)
            .map_err(|e| EmailError::InvalidConnectionString(format!("accesskey: {}", e)))?;

        Ok(Self {
            endpoint,
            access_key,
        })
    }

    fn host(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        match self.endpoint.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }
}

/// Signed transport shared by the service and its pollers.
struct AcsTransport {
    http_client: Client,
    connection: ConnectionString,
}

impl AcsTransport {
    fn url(&self, path: &str) -> Result<Url, EmailError> {
        let mut url = self
            .connection
            .endpoint
            .join(path)
            .map_err(|e| EmailError::InvalidConnectionString(format!("endpoint: {}", e)))?;
        url.query_pairs_mut().append_pair("api-version", EMAIL_API_VERSION);
        Ok(url)
    }

    async fn send_signed(
        &self,
        method: Method,
        url: Url,
        body: Vec<u8>,
        extra_headers: &[(&str, String)],
    ) -> Result<Response, EmailError> {
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let path_and_query = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };
        let host = self.connection.host();
        let (content_hash, authorization) = sign_request(
            &self.connection.access_key,
            method.as_str(),
            &path_and_query,
            &host,
            &date,
            &body,
        )?;

        let mut request = self
            .http_client
            .request(method, url)
            .header("x-ms-date", &date)
            .header("x-ms-content-sha256", content_hash)
            .header(reqwest::header::AUTHORIZATION, authorization);
        for (name, value) in extra_headers {
            request = request.header(*name, value);
        }
        if !body.is_empty() {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        let response = request.send().await?;
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let retry_after = retry_after_from_headers(response.headers());
        let body = response.text().await.unwrap_or_default();
        Err(EmailError::Api {
            status,
            message: acs_error_message(&body),
            kind: classify_http_status(status, &body, retry_after),
        })
    }
}

/// Compute `x-ms-content-sha256` and the `Authorization` header value.
fn sign_request(
    access_key: &[u8],
    method: &str,
    path_and_query: &str,
    host: &str,
    date: &str,
    body: &[u8],
) -> Result<(String, String), EmailError> {
    let content_hash = STANDARD.encode(Sha256::digest(body));
    let string_to_sign = format!("{}\n{}\n{};{};{}", method, path_and_query, date, host, content_hash);

    let mut mac = HmacSha256::new_from_slice(access_key)
        .map_err(|e| EmailError::InvalidConnectionString(format!("accesskey: {}", e)))?;
    mac.update(string_to_sign.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    Ok((
        content_hash,
        format!(
            "HMAC-SHA256 SignedHeaders=x-ms-date;host;x-ms-content-sha256&Signature={}",
            signature
        ),
    ))
}

fn acs_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body_snippet(body))
}

/// Handle on an in-flight send operation.
pub struct EmailSendPoller {
    transport: Arc<AcsTransport>,
    operation_id: String,
    poll_interval: Duration,
    last: EmailSendResult,
}

impl std::fmt::Debug for EmailSendPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailSendPoller")
            .field("operation_id", &self.operation_id)
            .field("status", &self.last.status)
            .finish()
    }
}

impl EmailSendPoller {
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    /// Status seen on the most recent request.
    pub fn last_status(&self) -> EmailSendStatus {
        self.last.status
    }

    pub fn is_done(&self) -> bool {
        self.last.status.is_terminal()
    }

    /// Fetch the current state of the operation.
    pub async fn status(&mut self) -> Result<EmailSendResult, EmailError> {
        let url = self
            .transport
            .url(&format!("./emails/operations/{}", self.operation_id))?;
        let response = self
            .transport
            .send_signed(Method::GET, url, Vec::new(), &[])
            .await?;
        let result: EmailSendResult = response
            .json()
            .await
            .map_err(|e| EmailError::InvalidResponse(format!("operation status: {}", e)))?;
        debug!(operation_id = %self.operation_id, status = ?result.status, "Polled email operation");
        self.last = result.clone();
        Ok(result)
    }

    /// Poll until the operation reaches `Succeeded`, `Failed` or `Canceled`.
    pub async fn wait(mut self) -> Result<EmailSendResult, EmailError> {
        while !self.is_done() {
            sleep(self.poll_interval).await;
            self.status().await?;
        }
        if self.last.status != EmailSendStatus::Succeeded {
            warn!(
                operation_id = %self.operation_id,
                status = ?self.last.status,
                error = ?self.last.error,
                "Email operation did not succeed"
            );
        }
        Ok(self.last)
    }
}

/// Azure Communication Services Email client.
pub struct EmailService {
    transport: Arc<AcsTransport>,
    poll_interval: Duration,
}

impl EmailService {
    pub fn from_connection_string(connection_string: &str) -> Result<Self, EmailError> {
        let connection = ConnectionString::parse(connection_string)?;
        let http_client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            transport: Arc::new(AcsTransport {
                http_client,
                connection,
            }),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, EmailError> {
        let raw = config.email.connection_string.as_deref().ok_or_else(|| {
            EmailError::InvalidConnectionString(
                "not configured; set BIZTOOLS_EMAIL_CONNECTION_STRING".to_string(),
            )
        })?;
        Ok(Self::from_connection_string(raw)?
            .with_poll_interval(Duration::from_millis(config.email.poll_interval_ms)))
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.transport.connection.endpoint
    }

    /// Submit a message and return a poller for the send operation.
    pub async fn begin_send(&self, message: &EmailMessage) -> Result<EmailSendPoller, EmailError> {
        let body = serde_json::to_vec(message)?;
        // The leading "./" keeps "emails:" from parsing as a URL scheme.
        let url = self.transport.url("./emails:send")?;
        let request_id = Uuid::new_v4().to_string();
        let first_sent = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();

        let response = self
            .transport
            .send_signed(
                Method::POST,
                url,
                body,
                &[
                    ("repeatability-request-id", request_id),
                    ("repeatability-first-sent", first_sent),
                ],
            )
            .await?;

        let operation_location = response
            .headers()
            .get("operation-location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let accepted: EmailSendResult = response
            .json()
            .await
            .map_err(|e| EmailError::InvalidResponse(format!("emails:send: {}", e)))?;

        info!(
            operation_id = %accepted.id,
            operation_location = operation_location.as_deref().unwrap_or_default(),
            recipients = message.recipient_addresses().len(),
            "Email accepted for delivery"
        );

        Ok(EmailSendPoller {
            transport: Arc::clone(&self.transport),
            operation_id: accepted.id.clone(),
            poll_interval: self.poll_interval,
            last: accepted,
        })
    }

    /// Submit a message, logging any failure and returning `None` instead.
    pub async fn send_email(&self, message: &EmailMessage) -> Option<EmailSendPoller> {
        match self.begin_send(message).await {
            Ok(poller) => Some(poller),
            Err(err) => {
                error!(error = %err, "Error while sending email, err is: {}", err);
                error!(
                    recipients = ?message.recipient_addresses(),
                    subject = %message.content.subject,
                    "Message is: {}",
                    serde_json::to_string(message).unwrap_or_default()
                );
                None
            }
        }
    }

    /// Nothing to release; the HTTP client is dropped with the service.
    pub async fn close(&self) {}
}
