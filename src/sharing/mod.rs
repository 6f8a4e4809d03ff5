//! Recursive folder sharing
//!
//! Walks a folder tree depth-first (pre-order) with an explicit worklist and
//! grants a role to every identity on every node. Grants are best-effort: one
//! failing grant never stops the others, and a failed child listing only prunes
//! the subtree of that folder. Every outcome lands in a [`PropagationReport`].

mod report;
#[cfg(test)]
mod tests;

pub use report::{
    GrantOutcome, GrantStatus, ListingError, ListingTarget, PropagationError, PropagationReport,
};

use std::collections::HashSet;
use std::time::Duration;

use rand::{Rng, thread_rng};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use crate::config::AppConfig;
use crate::connectors::{ChildRecord, FolderTree, NodeKind, ProviderError, Role};

/// A node of the tree as seen during one traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderNode {
    pub id: String,
    pub kind: NodeKind,
    pub depth: usize,
}

impl FolderNode {
    fn root(id: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: NodeKind::Folder,
            depth: 0,
        }
    }

    fn child(record: ChildRecord, depth: usize) -> Self {
        Self {
            id: record.id,
            kind: record.kind,
            depth,
        }
    }
}

/// Binding of an identity to a role on a single node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionGrant {
    pub identity: String,
    pub role: Role,
    pub scope: String,
}

/// Backoff used between grant attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Ceiling for a vendor `Retry-After` hint
    pub max_retry_after: Duration,
    /// Random extra delay as a fraction of the computed backoff (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            max_retry_after: Duration::from_secs(300),
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt: `base * 2^attempts_completed`, capped at
    /// `max`, raised to the vendor's retry hint (itself capped at
    /// `max_retry_after`), plus jitter.
    pub fn backoff(&self, attempts_completed: u32, retry_after_secs: Option<u64>) -> Duration {
        let base = self.base.as_secs_f64();
        let max = self.max.as_secs_f64();
        let exponent = attempts_completed.min(63) as i32;
        let mut backoff = (base * 2_f64.powi(exponent)).min(max);

        if let Some(retry_after) = retry_after_secs {
            let hint = Duration::from_secs(retry_after).min(self.max_retry_after);
            backoff = backoff.max(hint.as_secs_f64());
        }

        let jitter_span = self.jitter_factor.clamp(0.0, 1.0) * backoff;
        let jitter = if jitter_span > 0.0 {
            thread_rng().gen_range(0.0..jitter_span)
        } else {
            0.0
        };

        Duration::try_from_secs_f64(backoff + jitter)
            .unwrap_or_else(|_| self.max.max(self.max_retry_after))
    }
}

/// Policy knobs for a sharing run.
#[derive(Debug, Clone, PartialEq)]
pub struct PropagationOptions {
    /// Create calls per (node, identity); 1 disables retry
    pub grant_attempts: u32,
    pub retry: RetryPolicy,
    /// Look up existing permissions first and skip identities already present
    pub skip_existing: bool,
}

impl Default for PropagationOptions {
    fn default() -> Self {
        Self {
            grant_attempts: 1,
            retry: RetryPolicy::default(),
            skip_existing: false,
        }
    }
}

impl PropagationOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            grant_attempts: config.share.grant_attempts.max(1),
            retry: RetryPolicy {
                base: Duration::from_millis(config.share.retry_base_ms),
                max: Duration::from_millis(config.share.retry_max_ms),
                max_retry_after: Duration::from_millis(config.share.retry_after_cap_ms),
                jitter_factor: config.share.retry_jitter_factor,
            },
            skip_existing: config.share.skip_existing,
        }
    }
}

/// Applies a permission grant to every node below (and including) a root folder.
pub struct FolderPermissionPropagator<'a, T: FolderTree + ?Sized> {
    tree: &'a T,
    options: PropagationOptions,
}

impl<'a, T: FolderTree + ?Sized> FolderPermissionPropagator<'a, T> {
    pub fn new(tree: &'a T) -> Self {
        Self {
            tree,
            options: PropagationOptions::default(),
        }
    }

    pub fn with_options(mut self, options: PropagationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &PropagationOptions {
        &self.options
    }

    /// Share `root_id` and everything below it with `identities` at `role`.
    ///
    /// Each node is granted before its children are listed, so a folder whose
    /// listing fails still receives its own grants. Returns the full report on
    /// success; any failed grant or listing turns the result into
    /// [`PropagationError::Incomplete`], which still carries the report.
    #[instrument(skip(self, identities), fields(identities = identities.len()))]
    pub async fn share_folder_recursively<S: AsRef<str>>(
        &self,
        root_id: &str,
        identities: &[S],
        role: Role,
    ) -> Result<PropagationReport, PropagationError> {
        let root_id = root_id.trim();
        if root_id.is_empty() {
            return Err(PropagationError::EmptyRoot);
        }

        let identities = normalize_identities(identities);
        if identities.is_empty() {
            debug!(root_id, "No identities supplied; walking tree without granting");
        }

        let mut report = PropagationReport::new(root_id, role, identities.clone());
        let mut pending = vec![FolderNode::root(root_id)];

        while let Some(node) = pending.pop() {
            report.nodes_visited += 1;
            self.grant_node(&node, &identities, role, &mut report).await;

            if node.kind != NodeKind::Folder {
                continue;
            }

            match self.list_all_children(&node, &mut report).await {
                Ok(children) => {
                    report.folders_listed += 1;
                    debug!(
                        folder_id = %node.id,
                        depth = node.depth,
                        children = children.len(),
                        "Listed folder children"
                    );
                    // Reversed so the stack pops children in listing order.
                    pending.extend(
                        children
                            .into_iter()
                            .rev()
                            .map(|child| FolderNode::child(child, node.depth + 1)),
                    );
                }
                Err(listing_error) => {
                    error!(
                        folder_id = %listing_error.node_id,
                        depth = listing_error.depth,
                        pages_fetched = listing_error.pages_fetched,
                        error = %listing_error.error,
                        "Failed to list folder children; skipping subtree"
                    );
                    report.listing_errors.push(listing_error);
                }
            }
        }

        info!(
            root_id,
            role = %role,
            nodes = report.nodes_visited,
            granted = report.granted_count(),
            skipped = report.skipped_count(),
            failed_grants = report.failed_grant_count(),
            failed_listings = report.listing_errors.len(),
            "Folder sharing finished"
        );

        if report.is_success() {
            Ok(report)
        } else {
            Err(PropagationError::incomplete(report))
        }
    }

    /// Follow pagination to the end; a partial listing is discarded.
    async fn list_all_children(
        &self,
        node: &FolderNode,
        report: &mut PropagationReport,
    ) -> Result<Vec<ChildRecord>, ListingError> {
        let mut children = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages_fetched = 0;

        loop {
            report.listing_calls += 1;
            let page = self
                .tree
                .list_children(&node.id, page_token.as_deref())
                .await
                .map_err(|error| ListingError {
                    node_id: node.id.clone(),
                    depth: node.depth,
                    target: ListingTarget::Children,
                    pages_fetched,
                    error,
                })?;
            pages_fetched += 1;
            children.extend(page.children);

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => return Ok(children),
            }
        }
    }

    async fn grant_node(
        &self,
        node: &FolderNode,
        identities: &[String],
        role: Role,
        report: &mut PropagationReport,
    ) {
        if identities.is_empty() {
            return;
        }

        let existing = if self.options.skip_existing {
            match self.tree.list_permission_emails(&node.id).await {
                Ok(emails) => emails
                    .into_iter()
                    .map(|e| e.to_lowercase())
                    .collect::<HashSet<_>>(),
                Err(error) => {
                    warn!(
                        node_id = %node.id,
                        error = %error,
                        "Failed to look up existing permissions; granting all identities"
                    );
                    report.listing_errors.push(ListingError {
                        node_id: node.id.clone(),
                        depth: node.depth,
                        target: ListingTarget::Permissions,
                        pages_fetched: 0,
                        error,
                    });
                    HashSet::new()
                }
            }
        } else {
            HashSet::new()
        };

        for identity in identities {
            let grant = PermissionGrant {
                identity: identity.clone(),
                role,
                scope: node.id.clone(),
            };

            if existing.contains(&identity.to_lowercase()) {
                debug!(node_id = %node.id, identity = %identity, "Identity already has access");
                report.grants.push(GrantOutcome {
                    target_id: grant.scope,
                    kind: node.kind,
                    identity: grant.identity,
                    depth: node.depth,
                    attempts: 0,
                    status: GrantStatus::AlreadyShared,
                });
                continue;
            }

            let (attempts, result) = self.apply_grant(&grant).await;
            let status = match result {
                Ok(permission_id) => {
                    info!(
                        node_id = %grant.scope,
                        identity = %grant.identity,
                        permission_id = %permission_id,
                        "Shared {} with {}",
                        grant.scope,
                        grant.identity
                    );
                    GrantStatus::Granted { permission_id }
                }
                Err(error) => {
                    error!(
                        node_id = %grant.scope,
                        identity = %grant.identity,
                        attempts,
                        error = %error,
                        "Failed to share {} with {}",
                        grant.scope,
                        grant.identity
                    );
                    GrantStatus::Failed { error }
                }
            };

            report.grants.push(GrantOutcome {
                target_id: grant.scope,
                kind: node.kind,
                identity: grant.identity,
                depth: node.depth,
                attempts,
                status,
            });
        }
    }

    /// Issue the create call, retrying retryable failures up to `grant_attempts`.
    async fn apply_grant(&self, grant: &PermissionGrant) -> (u32, Result<String, ProviderError>) {
        let max_attempts = self.options.grant_attempts.max(1);
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self
                .tree
                .create_permission(&grant.scope, &grant.identity, grant.role)
                .await
            {
                Ok(permission_id) => return (attempts, Ok(permission_id)),
                Err(err) if err.is_retryable() && attempts < max_attempts => {
                    let delay = self
                        .options
                        .retry
                        .backoff(attempts - 1, err.kind.retry_after_secs());
                    warn!(
                        node_id = %grant.scope,
                        identity = %grant.identity,
                        attempt = attempts,
                        error = %err,
                        "Grant failed, retrying in {:?}",
                        delay
                    );
                    sleep(delay).await;
                }
                Err(err) => return (attempts, Err(err)),
            }
        }
    }
}

/// Trim, drop blanks and de-duplicate (case-insensitively) keeping first occurrence.
fn normalize_identities<S: AsRef<str>>(identities: &[S]) -> Vec<String> {
    let mut seen = HashSet::new();
    identities
        .iter()
        .map(|s| s.as_ref().trim())
        .filter(|s| !s.is_empty())
        .filter(|s| seen.insert(s.to_lowercase()))
        .map(str::to_string)
        .collect()
}
