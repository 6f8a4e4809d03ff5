//! Shared connector contract
//!
//! Defines the folder-tree interface consumed by the sharing propagator and the
//! error classification every vendor wrapper maps its failures onto.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};

/// Category of a failed vendor call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorKind {
    /// Credentials were rejected
    Unauthorized,
    /// Vendor throttled the caller, with an optional retry hint
    RateLimited {
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
    },
    /// Timeout, connection reset or 5xx; worth retrying
    Transient,
    /// Bad identity, permission denied, not found and friends
    Permanent,
}

impl ErrorKind {
    /// Whether a retry of the same call could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::RateLimited { .. })
    }

    /// Retry hint supplied by the vendor, if any.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            ErrorKind::RateLimited { retry_after_secs } => *retry_after_secs,
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Unauthorized => write!(f, "unauthorized"),
            ErrorKind::RateLimited { retry_after_secs } => {
                write!(f, "rate limited")?;
                if let Some(after) = retry_after_secs {
                    write!(f, " (retry after: {}s)", after)?;
                }
                Ok(())
            }
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Permanent => write!(f, "permanent"),
        }
    }
}

/// Classified vendor failure surfaced through [`FolderTree`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderError {
    #[serde(flatten)]
    pub kind: ErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unauthorized<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn rate_limited<S: Into<String>>(retry_after_secs: Option<u64>, message: S) -> Self {
        Self::new(ErrorKind::RateLimited { retry_after_secs }, message)
    }

    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn permanent<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}

impl std::error::Error for ProviderError {}

/// Body fragments Google APIs use for quota exhaustion on 403 responses.
const QUOTA_ERROR_PATTERNS: &[&str] = &[
    "userratelimitexceeded",
    "ratelimitexceeded",
    "quotaexceeded",
    "servicelimit",
    "daily limit",
    "billing limit",
];

/// Map an HTTP failure onto an [`ErrorKind`].
pub fn classify_http_status(status: u16, body: &str, retry_after_secs: Option<u64>) -> ErrorKind {
    match status {
        401 => ErrorKind::Unauthorized,
        429 => ErrorKind::RateLimited { retry_after_secs },
        403 => {
            let body_lower = body.to_lowercase();
            if QUOTA_ERROR_PATTERNS
                .iter()
                .any(|pattern| body_lower.contains(pattern))
            {
                ErrorKind::RateLimited { retry_after_secs }
            } else {
                ErrorKind::Permanent
            }
        }
        408 | 500..=599 => ErrorKind::Transient,
        _ => ErrorKind::Permanent,
    }
}

/// Map a transport-level failure onto an [`ErrorKind`].
pub fn classify_transport_error(err: &reqwest::Error) -> ErrorKind {
    if err.is_decode() || err.is_builder() {
        ErrorKind::Permanent
    } else {
        ErrorKind::Transient
    }
}

/// Parse a `Retry-After` header given in seconds.
pub fn retry_after_from_headers(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
}

/// Access level granted to an identity on a file or folder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    #[default]
    Commenter,
    Editor,
}

impl Role {
    /// Role name understood by the storage API.
    pub fn api_name(&self) -> &'static str {
        match self {
            Role::Viewer => "reader",
            Role::Commenter => "commenter",
            Role::Editor => "writer",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Commenter => "commenter",
            Role::Editor => "editor",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "viewer" | "reader" => Ok(Role::Viewer),
            "commenter" => Ok(Role::Commenter),
            "editor" | "writer" => Ok(Role::Editor),
            other => Err(format!(
                "unknown role '{}', expected viewer, commenter or editor",
                other
            )),
        }
    }
}

/// Whether a node in the folder tree can hold children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Folder,
    File,
}

/// One child entry returned by a listing call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildRecord {
    pub id: String,
    pub name: Option<String>,
    pub kind: NodeKind,
}

impl ChildRecord {
    pub fn folder<S: Into<String>>(id: S) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind: NodeKind::Folder,
        }
    }

    pub fn file<S: Into<String>>(id: S) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind: NodeKind::File,
        }
    }
}

/// A page of children plus the cursor for the next page (`None` at the end).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildPage {
    pub children: Vec<ChildRecord>,
    pub next_page_token: Option<String>,
}

/// Storage-service operations needed to walk a folder tree and grant access.
#[async_trait]
pub trait FolderTree: Send + Sync {
    /// List one page of the immediate children of `folder_id`.
    async fn list_children(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
    ) -> Result<ChildPage, ProviderError>;

    /// Grant `role` on `target_id` to `email`, returning the permission id.
    async fn create_permission(
        &self,
        target_id: &str,
        email: &str,
        role: Role,
    ) -> Result<String, ProviderError>;

    /// Email addresses already holding a user permission on `target_id`.
    async fn list_permission_emails(&self, target_id: &str)
    -> Result<HashSet<String>, ProviderError>;
}
