//! Google Drive connector
//!
//! Thin async client over the Drive v3 REST API authenticated as a service
//! account. Covers folder lookup and creation, multipart uploads, permission
//! listing and creation, deletion, and recursive folder sharing.
//!
//! All calls pass `supportsAllDrives=true` so shared drives behave like
//! "My Drive".

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::auth::{AccessTokenSource, AuthError, ServiceAccountKey, ServiceAccountTokenSource};
use crate::config::AppConfig;
use crate::connectors::trait_::{
    ChildPage, ChildRecord, ErrorKind, FolderTree, NodeKind, ProviderError, Role,
    classify_http_status, classify_transport_error, retry_after_from_headers,
};
use crate::error::body_snippet;
use crate::sharing::{FolderPermissionPropagator, PropagationError, PropagationOptions, PropagationReport};

/// Default Google API host.
pub const GOOGLE_API_BASE: &str = "https://www.googleapis.com";

/// MIME type Drive uses to mark folders.
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// Largest page size `files.list` accepts.
const LIST_PAGE_SIZE: u32 = 1000;
const PERMISSIONS_PAGE_SIZE: u32 = 100;

/// Google Drive connector errors
#[derive(Debug, Error)]
pub enum DriveError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Drive API request failed with status {status}: {message}")]
    Api {
        status: u16,
        message: String,
        kind: ErrorKind,
    },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl DriveError {
    /// Classification used by sharing and retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DriveError::Api { kind, .. } => kind.clone(),
            DriveError::Network(err) => classify_transport_error(err),
            DriveError::Auth(AuthError::Network(_)) => ErrorKind::Transient,
            DriveError::Auth(AuthError::TokenEndpoint { status, body }) if *status >= 500 => {
                classify_http_status(*status, body, None)
            }
            DriveError::Auth(_) => ErrorKind::Unauthorized,
            DriveError::Io { .. }
            | DriveError::InvalidResponse(_)
            | DriveError::Configuration(_) => ErrorKind::Permanent,
        }
    }
}

impl From<DriveError> for ProviderError {
    fn from(err: DriveError) -> Self {
        ProviderError::new(err.kind(), err.to_string())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
}

impl DriveFile {
    fn into_child(self) -> ChildRecord {
        let kind = if self.mime_type.as_deref() == Some(FOLDER_MIME_TYPE) {
            NodeKind::Folder
        } else {
            NodeKind::File
        };
        ChildRecord {
            id: self.id,
            name: self.name,
            kind,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileListResponse {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

/// One entry of `permissions.list`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DrivePermission {
    pub id: String,
    #[serde(default)]
    pub email_address: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(rename = "type", default)]
    pub permission_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PermissionListResponse {
    #[serde(default)]
    permissions: Vec<DrivePermission>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Google Drive v3 client
#[derive(Clone)]
pub struct DriveClient {
    http_client: Client,
    api_base: String,
    tokens: Arc<dyn AccessTokenSource>,
    share_options: PropagationOptions,
}

impl DriveClient {
    fn build_http_client() -> Result<Client, DriveError> {
        Ok(Client::builder().timeout(Duration::from_secs(60)).build()?)
    }

    /// Create a client that authenticates through `tokens`.
    pub fn new(tokens: Arc<dyn AccessTokenSource>) -> Result<Self, DriveError> {
        Ok(Self {
            http_client: Self::build_http_client()?,
            api_base: GOOGLE_API_BASE.to_string(),
            tokens,
            share_options: PropagationOptions::default(),
        })
    }

    /// Create a client from a service account key file.
    pub fn from_service_account_file(
        path: impl AsRef<Path>,
        scopes: Vec<String>,
    ) -> Result<Self, DriveError> {
        let key = ServiceAccountKey::from_file(path)?;
        Self::new(Arc::new(ServiceAccountTokenSource::new(key, scopes)))
    }

    /// Create a client from application configuration.
    pub fn from_config(config: &AppConfig) -> Result<Self, DriveError> {
        let path = config.google.service_account_file.as_ref().ok_or_else(|| {
            DriveError::Configuration(
                "service account file is not set; set BIZTOOLS_SERVICE_ACCOUNT_FILE".to_string(),
            )
        })?;
        Ok(
            Self::from_service_account_file(path, config.google.scopes.clone())?
                .with_api_base(config.google.api_base.clone())
                .with_share_options(PropagationOptions::from_config(config)),
        )
    }

    /// Point the client at another API host (mock servers in tests).
    pub fn with_api_base<S: Into<String>>(mut self, api_base: S) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_share_options(mut self, options: PropagationOptions) -> Self {
        self.share_options = options;
        self
    }

    fn files_url(&self) -> String {
        format!("{}/drive/v3/files", self.api_base)
    }

    fn file_url(&self, file_id: &str) -> String {
        format!("{}/drive/v3/files/{}", self.api_base, file_id)
    }

    fn permissions_url(&self, file_id: &str) -> String {
        format!("{}/drive/v3/files/{}/permissions", self.api_base, file_id)
    }

    fn upload_url(&self) -> String {
        format!("{}/upload/drive/v3/files", self.api_base)
    }

    /// Attach a bearer token, send, and turn non-2xx responses into [`DriveError::Api`].
    async fn send(&self, request: RequestBuilder) -> Result<Response, DriveError> {
        let token = self.tokens.access_token().await?;
        let response = request.bearer_auth(token).send().await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = retry_after_from_headers(response.headers());
        let body = response.text().await.unwrap_or_default();
        let kind = classify_http_status(status.as_u16(), &body, retry_after);
        Err(DriveError::Api {
            status: status.as_u16(),
            message: google_error_message(&body),
            kind,
        })
    }

    /// Id of the first folder named `folder_name`, if any.
    pub async fn get_folder_id(&self, folder_name: &str) -> Result<Option<String>, DriveError> {
        let query = format!(
            "name = '{}' and mimeType = '{}' and trashed = false",
            escape_query_value(folder_name),
            FOLDER_MIME_TYPE
        );
        let response = self
            .send(self.http_client.get(self.files_url()).query(&[
                ("q", query.as_str()),
                ("pageSize", "10"),
                ("fields", "files(id, name)"),
                ("supportsAllDrives", "true"),
                ("includeItemsFromAllDrives", "true"),
            ]))
            .await?;

        let listing: FileListResponse = response
            .json()
            .await
            .map_err(|e| DriveError::InvalidResponse(format!("files.list: {}", e)))?;
        Ok(listing.files.into_iter().next().map(|f| f.id))
    }

    /// Create a folder, optionally inside `parent_folder_id`, returning its id.
    pub async fn create_folder(
        &self,
        folder_name: &str,
        parent_folder_id: Option<&str>,
    ) -> Result<String, DriveError> {
        let mut metadata = json!({
            "name": folder_name,
            "mimeType": FOLDER_MIME_TYPE,
        });
        if let Some(parent) = parent_folder_id {
            metadata["parents"] = json!([parent]);
        }

        let response = self
            .send(
                self.http_client
                    .post(self.files_url())
                    .query(&[("fields", "id"), ("supportsAllDrives", "true")])
                    .json(&metadata),
            )
            .await?;

        let created: IdResponse = response
            .json()
            .await
            .map_err(|e| DriveError::InvalidResponse(format!("files.create: {}", e)))?;
        info!(folder_name, folder_id = %created.id, "Folder {} created with ID: {}", folder_name, created.id);
        Ok(created.id)
    }

    /// Upload a local file into `folder_id` using a multipart upload.
    pub async fn upload_file(
        &self,
        file_path: impl AsRef<Path>,
        folder_id: &str,
        mime_type: &str,
    ) -> Result<String, DriveError> {
        let file_path = file_path.as_ref();
        let file_name = file_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                DriveError::Configuration(format!("{} has no file name", file_path.display()))
            })?
            .to_string();
        let contents = tokio::fs::read(file_path).await.map_err(|source| DriveError::Io {
            path: file_path.to_path_buf(),
            source,
        })?;

        let metadata = json!({ "name": file_name, "parents": [folder_id] });
        let boundary = format!("biztools-{}", Uuid::new_v4().simple());
        let body = multipart_related_body(&boundary, &metadata, mime_type, &contents);

        let response = self
            .send(
                self.http_client
                    .post(self.upload_url())
                    .query(&[
                        ("uploadType", "multipart"),
                        ("fields", "id"),
                        ("supportsAllDrives", "true"),
                    ])
                    .header(
                        reqwest::header::CONTENT_TYPE,
                        format!("multipart/related; boundary={}", boundary),
                    )
                    .body(body),
            )
            .await?;

        let uploaded: IdResponse = response
            .json()
            .await
            .map_err(|e| DriveError::InvalidResponse(format!("files.create upload: {}", e)))?;
        info!(file_name = %file_name, file_id = %uploaded.id, "File uploaded with ID {}", uploaded.id);
        Ok(uploaded.id)
    }

    /// Every permission on `file_id`, following pagination.
    pub async fn list_permissions(&self, file_id: &str) -> Result<Vec<DrivePermission>, DriveError> {
        let mut permissions = Vec::new();
        let mut page_token: Option<String> = None;
        let page_size = PERMISSIONS_PAGE_SIZE.to_string();

        loop {
            let mut params = vec![
                ("fields", "nextPageToken, permissions(id, emailAddress, role, type)"),
                ("supportsAllDrives", "true"),
                ("pageSize", page_size.as_str()),
            ];
            if let Some(token) = page_token.as_deref() {
                params.push(("pageToken", token));
            }

            let response = self
                .send(self.http_client.get(self.permissions_url(file_id)).query(&params))
                .await?;
            let page: PermissionListResponse = response
                .json()
                .await
                .map_err(|e| DriveError::InvalidResponse(format!("permissions.list: {}", e)))?;
            permissions.extend(page.permissions);

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => return Ok(permissions),
            }
        }
    }

    /// Email addresses holding a `user` permission on `folder_id`.
    pub async fn get_folder_permissions(&self, folder_id: &str) -> Result<HashSet<String>, DriveError> {
        match self.list_permissions(folder_id).await {
            Ok(permissions) => Ok(permissions
                .into_iter()
                .filter(|p| p.permission_type.as_deref() == Some("user"))
                .filter_map(|p| p.email_address)
                .collect()),
            Err(err) => {
                error!(folder_id, error = %err, "Error checking folder sharing for {}", folder_id);
                Err(err)
            }
        }
    }

    /// Permanently delete a folder (bypasses the trash).
    pub async fn delete_folder(&self, folder_id: &str) -> Result<(), DriveError> {
        self.send(
            self.http_client
                .delete(self.file_url(folder_id))
                .query(&[("supportsAllDrives", "true")]),
        )
        .await?;
        info!(folder_id, "Permanently deleted folder with id {}", folder_id);
        Ok(())
    }

    /// One page of the non-trashed children of `folder_id`.
    pub async fn list_folder_children(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
    ) -> Result<ChildPage, DriveError> {
        let query = format!("'{}' in parents and trashed = false", escape_query_value(folder_id));
        let page_size = LIST_PAGE_SIZE.to_string();
        let mut params = vec![
            ("q", query.as_str()),
            ("fields", "nextPageToken, files(id, name, mimeType)"),
            ("pageSize", page_size.as_str()),
            ("supportsAllDrives", "true"),
            ("includeItemsFromAllDrives", "true"),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token));
        }

        let response = self
            .send(self.http_client.get(self.files_url()).query(&params))
            .await?;
        let listing: FileListResponse = response
            .json()
            .await
            .map_err(|e| DriveError::InvalidResponse(format!("files.list: {}", e)))?;

        debug!(folder_id, count = listing.files.len(), "Listed Drive children page");
        Ok(ChildPage {
            children: listing.files.into_iter().map(DriveFile::into_child).collect(),
            next_page_token: listing.next_page_token,
        })
    }

    /// Grant `role` on `file_id` to the user `email`, returning the permission id.
    pub async fn add_permission(
        &self,
        file_id: &str,
        email: &str,
        role: Role,
    ) -> Result<String, DriveError> {
        let permission = json!({
            "type": "user",
            "role": role.api_name(),
            "emailAddress": email,
        });

        let response = self
            .send(
                self.http_client
                    .post(self.permissions_url(file_id))
                    .query(&[
                        ("fields", "id"),
                        ("supportsAllDrives", "true"),
                        ("moveToNewOwnersRoot", "false"),
                    ])
                    .json(&permission),
            )
            .await?;

        let created: IdResponse = response
            .json()
            .await
            .map_err(|e| DriveError::InvalidResponse(format!("permissions.create: {}", e)))?;
        Ok(created.id)
    }

    /// Share `folder_id` and everything below it with `email_addresses`.
    pub async fn share_folder_recursively<S: AsRef<str>>(
        &self,
        folder_id: &str,
        email_addresses: &[S],
        role: Role,
    ) -> Result<PropagationReport, PropagationError> {
        FolderPermissionPropagator::new(self)
            .with_options(self.share_options.clone())
            .share_folder_recursively(folder_id, email_addresses, role)
            .await
    }
}

#[async_trait]
impl FolderTree for DriveClient {
    async fn list_children(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
    ) -> Result<ChildPage, ProviderError> {
        Ok(self.list_folder_children(folder_id, page_token).await?)
    }

    async fn create_permission(
        &self,
        target_id: &str,
        email: &str,
        role: Role,
    ) -> Result<String, ProviderError> {
        Ok(self.add_permission(target_id, email, role).await?)
    }

    async fn list_permission_emails(
        &self,
        target_id: &str,
    ) -> Result<HashSet<String>, ProviderError> {
        Ok(self.get_folder_permissions(target_id).await?)
    }
}

/// Escape a literal for use inside single quotes in a Drive `q` expression.
fn escape_query_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Pull `error.message` out of a Google error body, falling back to the raw body.
fn google_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body_snippet(body))
}

fn multipart_related_body(
    boundary: &str,
    metadata: &serde_json::Value,
    mime_type: &str,
    contents: &[u8],
) -> Vec<u8> {
    let mut body = Vec::with_capacity(contents.len() + 512);
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n--{boundary}\r\nContent-Type: {mime_type}\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(contents);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    body
}
