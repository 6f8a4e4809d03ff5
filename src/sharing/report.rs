//! Per-node outcomes accumulated while sharing a folder tree.

use serde::Serialize;
use thiserror::Error;

use crate::connectors::{NodeKind, ProviderError, Role};

/// What happened to one (target, identity) grant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GrantStatus {
    Granted { permission_id: String },
    /// Identity already held a permission and `skip_existing` was enabled
    AlreadyShared,
    Failed { error: ProviderError },
}

/// Result of granting one identity on one node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GrantOutcome {
    pub target_id: String,
    pub kind: NodeKind,
    pub identity: String,
    pub depth: usize,
    /// Number of create calls issued (0 when skipped)
    pub attempts: u32,
    #[serde(flatten)]
    pub status: GrantStatus,
}

impl GrantOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self.status, GrantStatus::Failed { .. })
    }

    pub fn error(&self) -> Option<&ProviderError> {
        match &self.status {
            GrantStatus::Failed { error } => Some(error),
            _ => None,
        }
    }
}

/// Which lookup failed for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingTarget {
    /// Child listing; the subtree below the folder was not visited
    Children,
    /// Existing-permission lookup; grants went ahead unfiltered
    Permissions,
}

/// A failed listing call for one node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListingError {
    pub node_id: String,
    pub depth: usize,
    pub target: ListingTarget,
    /// Pages successfully fetched before the failure
    pub pages_fetched: usize,
    pub error: ProviderError,
}

/// Accumulated outcome of one `share_folder_recursively` invocation, in
/// traversal order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropagationReport {
    pub root_id: String,
    pub role: Role,
    pub identities: Vec<String>,
    pub grants: Vec<GrantOutcome>,
    pub listing_errors: Vec<ListingError>,
    pub nodes_visited: usize,
    pub folders_listed: usize,
    pub listing_calls: usize,
}

impl PropagationReport {
    pub fn new(root_id: &str, role: Role, identities: Vec<String>) -> Self {
        Self {
            root_id: root_id.to_string(),
            role,
            identities,
            grants: Vec::new(),
            listing_errors: Vec::new(),
            nodes_visited: 0,
            folders_listed: 0,
            listing_calls: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.listing_errors.is_empty() && !self.grants.iter().any(GrantOutcome::is_failure)
    }

    pub fn failed_grants(&self) -> impl Iterator<Item = &GrantOutcome> {
        self.grants.iter().filter(|g| g.is_failure())
    }

    pub fn granted_count(&self) -> usize {
        self.grants
            .iter()
            .filter(|g| matches!(g.status, GrantStatus::Granted { .. }))
            .count()
    }

    pub fn skipped_count(&self) -> usize {
        self.grants
            .iter()
            .filter(|g| matches!(g.status, GrantStatus::AlreadyShared))
            .count()
    }

    pub fn failed_grant_count(&self) -> usize {
        self.failed_grants().count()
    }

    /// Grants for a single node, in identity order.
    pub fn grants_for<'a>(&'a self, target_id: &'a str) -> impl Iterator<Item = &'a GrantOutcome> {
        self.grants.iter().filter(move |g| g.target_id == target_id)
    }

    /// Permission ids keyed by identity for one node; failed grants map to `None`.
    pub fn permission_ids_for(&self, target_id: &str) -> Vec<(String, Option<String>)> {
        self.grants_for(target_id)
            .filter(|g| !matches!(g.status, GrantStatus::AlreadyShared))
            .map(|g| {
                let id = match &g.status {
                    GrantStatus::Granted { permission_id } => Some(permission_id.clone()),
                    _ => None,
                };
                (g.identity.clone(), id)
            })
            .collect()
    }
}

/// Failure of a sharing run.
#[derive(Debug, Error)]
pub enum PropagationError {
    #[error("root folder id must not be empty")]
    EmptyRoot,
    #[error(
        "sharing {root_id} finished with {failed_grants} failed grants and {failed_listings} failed listings"
    )]
    Incomplete {
        root_id: String,
        failed_grants: usize,
        failed_listings: usize,
        report: Box<PropagationReport>,
    },
}

impl PropagationError {
    pub(crate) fn incomplete(report: PropagationReport) -> Self {
        Self::Incomplete {
            root_id: report.root_id.clone(),
            failed_grants: report.failed_grant_count(),
            failed_listings: report.listing_errors.len(),
            report: Box::new(report),
        }
    }

    /// The partial report, when the walk ran at all.
    pub fn report(&self) -> Option<&PropagationReport> {
        match self {
            PropagationError::EmptyRoot => None,
            PropagationError::Incomplete { report, .. } => Some(report),
        }
    }

    pub fn into_report(self) -> Option<PropagationReport> {
        match self {
            PropagationError::EmptyRoot => None,
            PropagationError::Incomplete { report, .. } => Some(*report),
        }
    }
}
