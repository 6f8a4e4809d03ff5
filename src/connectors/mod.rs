//! Connectors module
//!
//! Async clients for the third-party services this crate wraps:
//! - `google_drive`: Drive v3 file storage, including recursive sharing
//! - `email`: Azure Communication Services Email
//! - `slack`: Slack `chat.postMessage`
//!
//! `trait_` holds the shared error classification and the `FolderTree`
//! abstraction the sharing walk runs against.

pub mod email;
pub mod google_drive;
pub mod slack;
pub mod trait_;

pub use email::{EmailError, EmailMessage, EmailSendPoller, EmailService};
pub use google_drive::{DriveClient, DriveError};
pub use slack::{SlackError, SlackMessage, SlackService};
pub use trait_::{
    ChildPage, ChildRecord, ErrorKind, FolderTree, NodeKind, ProviderError, Role,
    classify_http_status, classify_transport_error, retry_after_from_headers,
};
