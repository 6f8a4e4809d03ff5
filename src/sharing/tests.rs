use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::*;
use crate::connectors::{ChildPage, ChildRecord, ErrorKind, FolderTree, ProviderError, Role};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    List { folder: String, page: usize },
    Grant { target: String, identity: String },
    Permissions { target: String },
}

/// In-memory folder tree recording every call in order.
#[derive(Default)]
struct FakeTree {
    pages: HashMap<String, Vec<Vec<ChildRecord>>>,
    failing_pages: HashSet<(String, usize)>,
    grant_failures: Mutex<HashMap<(String, String), VecDeque<ProviderError>>>,
    existing: HashMap<String, HashSet<String>>,
    failing_permission_lookups: HashSet<String>,
    calls: Mutex<Vec<Call>>,
}

impl FakeTree {
    fn folder(mut self, id: &str, children: Vec<ChildRecord>) -> Self {
        self.pages.insert(id.to_string(), vec![children]);
        self
    }

    fn paged_folder(mut self, id: &str, pages: Vec<Vec<ChildRecord>>) -> Self {
        self.pages.insert(id.to_string(), pages);
        self
    }

    fn fail_listing(mut self, id: &str, page: usize) -> Self {
        self.failing_pages.insert((id.to_string(), page));
        self
    }

    fn fail_grant(self, target: &str, identity: &str, errors: Vec<ProviderError>) -> Self {
        self.grant_failures
            .lock()
            .unwrap()
            .insert((target.to_string(), identity.to_string()), errors.into());
        self
    }

    fn existing(mut self, target: &str, emails: &[&str]) -> Self {
        self.existing.insert(
            target.to_string(),
            emails.iter().map(|e| e.to_string()).collect(),
        );
        self
    }

    fn fail_permission_lookup(mut self, target: &str) -> Self {
        self.failing_permission_lookups.insert(target.to_string());
        self
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn grant_targets(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Grant { target, .. } => Some(target),
                _ => None,
            })
            .collect()
    }

    fn grant_calls(&self) -> usize {
        self.grant_targets().len()
    }

    fn listing_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::List { .. }))
            .count()
    }
}

#[async_trait]
impl FolderTree for FakeTree {
    async fn list_children(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
    ) -> Result<ChildPage, ProviderError> {
        let page = page_token.and_then(|t| t.parse::<usize>().ok()).unwrap_or(0);
        self.calls.lock().unwrap().push(Call::List {
            folder: folder_id.to_string(),
            page,
        });

        if self.failing_pages.contains(&(folder_id.to_string(), page)) {
            return Err(ProviderError::transient(format!("listing {} failed", folder_id)));
        }

        let Some(pages) = self.pages.get(folder_id) else {
            return Ok(ChildPage::default());
        };
        let children = pages.get(page).cloned().unwrap_or_default();
        let next_page_token = if page + 1 < pages.len() {
            Some((page + 1).to_string())
        } else {
            None
        };
        Ok(ChildPage {
            children,
            next_page_token,
        })
    }

    async fn create_permission(
        &self,
        target_id: &str,
        email: &str,
        _role: Role,
    ) -> Result<String, ProviderError> {
        self.calls.lock().unwrap().push(Call::Grant {
            target: target_id.to_string(),
            identity: email.to_string(),
        });

        let mut failures = self.grant_failures.lock().unwrap();
        if let Some(queue) = failures.get_mut(&(target_id.to_string(), email.to_string())) {
            if let Some(err) = queue.pop_front() {
                return Err(err);
            }
        }
        Ok(format!("perm-{}-{}", target_id, email))
    }

    async fn list_permission_emails(
        &self,
        target_id: &str,
    ) -> Result<HashSet<String>, ProviderError> {
        self.calls.lock().unwrap().push(Call::Permissions {
            target: target_id.to_string(),
        });
        if self.failing_permission_lookups.contains(target_id) {
            return Err(ProviderError::permanent("permission lookup denied"));
        }
        Ok(self.existing.get(target_id).cloned().unwrap_or_default())
    }
}

/// root
/// ├── f1/
/// │   ├── b
/// │   └── f2/
/// └── a
fn sample_tree() -> FakeTree {
    FakeTree::default()
        .folder(
            "root",
            vec![ChildRecord::folder("f1"), ChildRecord::file("a")],
        )
        .folder(
            "f1",
            vec![ChildRecord::file("b"), ChildRecord::folder("f2")],
        )
        .folder("f2", vec![])
}

fn no_wait_options(grant_attempts: u32) -> PropagationOptions {
    PropagationOptions {
        grant_attempts,
        retry: RetryPolicy {
            base: Duration::ZERO,
            max: Duration::ZERO,
            max_retry_after: Duration::ZERO,
            jitter_factor: 0.0,
        },
        skip_existing: false,
    }
}

const ALICE: &str = "alice@example.com";
const BOB: &str = "bob@example.com";

#[tokio::test]
async fn test_grants_every_node_for_every_identity() {
    let tree = sample_tree();
    let report = FolderPermissionPropagator::new(&tree)
        .share_folder_recursively("root", &[ALICE, BOB], Role::Commenter)
        .await
        .expect("sharing should succeed");

    assert_eq!(tree.grant_calls(), 5 * 2);
    assert_eq!(report.granted_count(), 10);
    assert_eq!(report.nodes_visited, 5);
    assert_eq!(report.folders_listed, 3);
    assert!(report.is_success());
    assert_eq!(
        report.permission_ids_for("b"),
        vec![
            (ALICE.to_string(), Some(format!("perm-b-{}", ALICE))),
            (BOB.to_string(), Some(format!("perm-b-{}", BOB))),
        ]
    );
}

#[tokio::test]
async fn test_traversal_is_pre_order_in_listing_order() {
    let tree = sample_tree();
    FolderPermissionPropagator::new(&tree)
        .share_folder_recursively("root", &[ALICE], Role::Viewer)
        .await
        .unwrap();

    assert_eq!(tree.grant_targets(), vec!["root", "f1", "b", "f2", "a"]);
}

#[tokio::test]
async fn test_parent_granted_before_descendants() {
    let tree = sample_tree();
    FolderPermissionPropagator::new(&tree)
        .share_folder_recursively("root", &[ALICE, BOB], Role::Editor)
        .await
        .unwrap();

    let targets = tree.grant_targets();
    let last_grant = |id: &str| targets.iter().rposition(|t| t == id).unwrap();
    let first_grant = |id: &str| targets.iter().position(|t| t == id).unwrap();

    for (ancestor, descendant) in [
        ("root", "f1"),
        ("root", "a"),
        ("root", "b"),
        ("root", "f2"),
        ("f1", "b"),
        ("f1", "f2"),
    ] {
        assert!(
            last_grant(ancestor) < first_grant(descendant),
            "{} must be granted before {}",
            ancestor,
            descendant
        );
    }
}

#[tokio::test]
async fn test_listing_failure_prunes_only_that_subtree() {
    let tree = FakeTree::default()
        .folder(
            "root",
            vec![ChildRecord::folder("c"), ChildRecord::folder("s")],
        )
        .folder("c", vec![ChildRecord::file("c-child")])
        .folder("s", vec![ChildRecord::file("s-child")])
        .fail_listing("c", 0);

    let err = FolderPermissionPropagator::new(&tree)
        .share_folder_recursively("root", &[ALICE], Role::Commenter)
        .await
        .expect_err("a failed listing must fail the run");

    assert_eq!(tree.grant_targets(), vec!["root", "c", "s", "s-child"]);

    let report = err.report().expect("report is attached");
    assert_eq!(report.listing_errors.len(), 1);
    let listing = &report.listing_errors[0];
    assert_eq!(listing.node_id, "c");
    assert_eq!(listing.depth, 1);
    assert_eq!(listing.target, ListingTarget::Children);
    assert_eq!(report.failed_grant_count(), 0);
    assert!(matches!(
        err,
        PropagationError::Incomplete {
            failed_grants: 0,
            failed_listings: 1,
            ..
        }
    ));
}

#[tokio::test]
async fn test_root_listing_failure_still_grants_root() {
    let tree = FakeTree::default()
        .folder("root", vec![ChildRecord::file("x")])
        .fail_listing("root", 0);

    let err = FolderPermissionPropagator::new(&tree)
        .share_folder_recursively("root", &[ALICE, BOB], Role::Viewer)
        .await
        .unwrap_err();

    assert_eq!(tree.grant_targets(), vec!["root", "root"]);
    assert_eq!(err.report().unwrap().listing_errors.len(), 1);
}

#[tokio::test]
async fn test_grant_failure_does_not_stop_other_grants() {
    let tree = sample_tree().fail_grant(
        "f1",
        ALICE,
        vec![ProviderError::permanent("invalid sharing request")],
    );

    let err = FolderPermissionPropagator::new(&tree)
        .share_folder_recursively("root", &[ALICE, BOB], Role::Commenter)
        .await
        .unwrap_err();

    assert_eq!(tree.grant_calls(), 10);
    let report = err.into_report().unwrap();
    assert_eq!(report.granted_count(), 9);

    let failed: Vec<_> = report.failed_grants().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].target_id, "f1");
    assert_eq!(failed[0].identity, ALICE);
    assert_eq!(failed[0].attempts, 1);
    assert_eq!(failed[0].error().unwrap().kind, ErrorKind::Permanent);

    assert_eq!(
        report.permission_ids_for("f1"),
        vec![
            (ALICE.to_string(), None),
            (BOB.to_string(), Some(format!("perm-f1-{}", BOB))),
        ]
    );
}

#[tokio::test]
async fn test_empty_root_grants_root_only() {
    let tree = FakeTree::default();
    let report = FolderPermissionPropagator::new(&tree)
        .share_folder_recursively("root", &[ALICE, BOB, "carol@example.com"], Role::Viewer)
        .await
        .unwrap();

    assert_eq!(tree.grant_calls(), 3);
    assert_eq!(tree.listing_calls(), 1);
    assert_eq!(report.nodes_visited, 1);
}

#[tokio::test]
async fn test_empty_identities_walk_without_granting() {
    let tree = sample_tree();
    let identities: [&str; 0] = [];
    let report = FolderPermissionPropagator::new(&tree)
        .share_folder_recursively("root", &identities, Role::Viewer)
        .await
        .unwrap();

    assert_eq!(tree.grant_calls(), 0);
    assert_eq!(tree.listing_calls(), 3);
    assert_eq!(report.nodes_visited, 5);
    assert!(report.grants.is_empty());
}

#[tokio::test]
async fn test_follows_pagination_before_descending() {
    let tree = FakeTree::default()
        .paged_folder(
            "root",
            vec![
                vec![ChildRecord::file("p1-a"), ChildRecord::folder("p1-f")],
                vec![ChildRecord::file("p2-a")],
            ],
        )
        .folder("p1-f", vec![ChildRecord::file("deep")]);

    let report = FolderPermissionPropagator::new(&tree)
        .share_folder_recursively("root", &[ALICE], Role::Viewer)
        .await
        .unwrap();

    let calls = tree.calls();
    assert_eq!(
        calls[1..3],
        [
            Call::List {
                folder: "root".to_string(),
                page: 0
            },
            Call::List {
                folder: "root".to_string(),
                page: 1
            },
        ]
    );
    assert_eq!(
        tree.grant_targets(),
        vec!["root", "p1-a", "p1-f", "deep", "p2-a"]
    );
    assert_eq!(report.listing_calls, 3);
}

#[tokio::test]
async fn test_partial_pagination_failure_discards_partial_listing() {
    let tree = FakeTree::default()
        .paged_folder(
            "root",
            vec![vec![ChildRecord::file("first")], vec![ChildRecord::file("second")]],
        )
        .fail_listing("root", 1);

    let err = FolderPermissionPropagator::new(&tree)
        .share_folder_recursively("root", &[ALICE], Role::Viewer)
        .await
        .unwrap_err();

    assert_eq!(tree.grant_targets(), vec!["root"]);
    let report = err.report().unwrap();
    assert_eq!(report.listing_errors[0].pages_fetched, 1);
}

#[tokio::test]
async fn test_no_retry_by_default() {
    let tree = FakeTree::default().fail_grant(
        "root",
        ALICE,
        vec![ProviderError::transient("timeout")],
    );

    let err = FolderPermissionPropagator::new(&tree)
        .share_folder_recursively("root", &[ALICE], Role::Viewer)
        .await
        .unwrap_err();

    assert_eq!(tree.grant_calls(), 1);
    assert_eq!(err.report().unwrap().failed_grant_count(), 1);
}

#[tokio::test]
async fn test_retries_transient_failures_when_enabled() {
    let tree = FakeTree::default().fail_grant(
        "root",
        ALICE,
        vec![
            ProviderError::transient("timeout"),
            ProviderError::rate_limited(None, "slow down"),
        ],
    );

    let report = FolderPermissionPropagator::new(&tree)
        .with_options(no_wait_options(3))
        .share_folder_recursively("root", &[ALICE], Role::Viewer)
        .await
        .expect("third attempt succeeds");

    assert_eq!(tree.grant_calls(), 3);
    assert_eq!(report.grants[0].attempts, 3);
    assert_eq!(report.granted_count(), 1);
}

#[tokio::test]
async fn test_permanent_failures_are_not_retried() {
    let tree = FakeTree::default().fail_grant(
        "root",
        ALICE,
        vec![ProviderError::permanent("bad identity")],
    );

    let err = FolderPermissionPropagator::new(&tree)
        .with_options(no_wait_options(5))
        .share_folder_recursively("root", &[ALICE], Role::Viewer)
        .await
        .unwrap_err();

    assert_eq!(tree.grant_calls(), 1);
    assert_eq!(err.report().unwrap().grants[0].attempts, 1);
}

#[tokio::test]
async fn test_skip_existing_permissions() {
    let tree = sample_tree().existing("root", &["Alice@Example.com"]);
    let options = PropagationOptions {
        skip_existing: true,
        ..no_wait_options(1)
    };

    let report = FolderPermissionPropagator::new(&tree)
        .with_options(options)
        .share_folder_recursively("root", &[ALICE, BOB], Role::Commenter)
        .await
        .unwrap();

    assert_eq!(tree.grant_calls(), 9);
    assert_eq!(report.skipped_count(), 1);
    let root_grants: Vec<_> = report.grants_for("root").collect();
    assert_eq!(root_grants[0].status, GrantStatus::AlreadyShared);
    assert_eq!(root_grants[0].attempts, 0);
    assert_eq!(report.permission_ids_for("root").len(), 1);
}

#[tokio::test]
async fn test_failed_permission_lookup_grants_unfiltered() {
    let tree = FakeTree::default()
        .existing("root", &[ALICE])
        .fail_permission_lookup("root");
    let options = PropagationOptions {
        skip_existing: true,
        ..no_wait_options(1)
    };

    let err = FolderPermissionPropagator::new(&tree)
        .with_options(options)
        .share_folder_recursively("root", &[ALICE], Role::Viewer)
        .await
        .unwrap_err();

    assert_eq!(tree.grant_calls(), 1);
    let report = err.report().unwrap();
    assert_eq!(report.granted_count(), 1);
    assert_eq!(report.listing_errors[0].target, ListingTarget::Permissions);
}

#[tokio::test]
async fn test_empty_root_id_is_rejected() {
    let tree = FakeTree::default();
    let err = FolderPermissionPropagator::new(&tree)
        .share_folder_recursively("  ", &[ALICE], Role::Viewer)
        .await
        .unwrap_err();

    assert!(matches!(err, PropagationError::EmptyRoot));
    assert!(tree.calls().is_empty());
}

#[tokio::test]
async fn test_duplicate_identities_are_granted_once() {
    let tree = FakeTree::default();
    let report = FolderPermissionPropagator::new(&tree)
        .share_folder_recursively(
            "root",
            &[ALICE, " alice@example.com ", "ALICE@example.com", "", BOB],
            Role::Viewer,
        )
        .await
        .unwrap();

    assert_eq!(tree.grant_calls(), 2);
    assert_eq!(report.identities, vec![ALICE.to_string(), BOB.to_string()]);
}

#[test]
fn test_backoff_grows_and_caps() {
    let policy = RetryPolicy {
        base: Duration::from_secs(1),
        max: Duration::from_secs(10),
        max_retry_after: Duration::from_secs(60),
        jitter_factor: 0.0,
    };
    assert_eq!(policy.backoff(0, None), Duration::from_secs(1));
    assert_eq!(policy.backoff(3, None), Duration::from_secs(8));
    assert_eq!(policy.backoff(5, None), Duration::from_secs(10));
    assert_eq!(policy.backoff(0, Some(20)), Duration::from_secs(20));
}

#[test]
fn test_backoff_jitter_is_bounded() {
    let policy = RetryPolicy {
        base: Duration::from_secs(2),
        max: Duration::from_secs(60),
        max_retry_after: Duration::from_secs(60),
        jitter_factor: 0.5,
    };
    for _ in 0..50 {
        let delay = policy.backoff(1, None);
        assert!(delay >= Duration::from_secs(4));
        assert!(delay < Duration::from_secs(6));
    }
}

#[test]
fn test_retry_after_hint_is_capped() {
    let policy = RetryPolicy {
        base: Duration::from_secs(1),
        max: Duration::from_secs(10),
        max_retry_after: Duration::from_secs(60),
        jitter_factor: 0.0,
    };
    assert_eq!(policy.backoff(0, Some(86_400)), Duration::from_secs(60));
    assert_eq!(policy.backoff(0, Some(u64::MAX)), Duration::from_secs(60));
    assert_eq!(policy.backoff(u32::MAX, None), Duration::from_secs(10));

    let jittered = RetryPolicy {
        jitter_factor: 1.0,
        ..RetryPolicy::default()
    };
    let delay = jittered.backoff(0, Some(u64::MAX));
    assert!(delay >= Duration::from_secs(300));
    assert!(delay < Duration::from_secs(600));
}

fn hint_options(max_retry_after: Duration) -> PropagationOptions {
    PropagationOptions {
        grant_attempts: 2,
        retry: RetryPolicy {
            base: Duration::ZERO,
            max: Duration::ZERO,
            max_retry_after,
            jitter_factor: 0.0,
        },
        skip_existing: false,
    }
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_grant_waits_for_retry_after() {
    let tree = FakeTree::default().fail_grant(
        "root",
        ALICE,
        vec![ProviderError::rate_limited(Some(7), "User rate limit exceeded")],
    );

    let started = tokio::time::Instant::now();
    let report = FolderPermissionPropagator::new(&tree)
        .with_options(hint_options(Duration::from_secs(60)))
        .share_folder_recursively("root", &[ALICE], Role::Viewer)
        .await
        .expect("second attempt succeeds");
    let waited = started.elapsed();

    assert_eq!(report.grants[0].attempts, 2);
    assert!(waited >= Duration::from_secs(7), "waited {:?}", waited);
    assert!(waited < Duration::from_secs(8), "waited {:?}", waited);
}

#[tokio::test(start_paused = true)]
async fn test_huge_retry_after_waits_only_up_to_cap() {
    let tree = FakeTree::default().fail_grant(
        "root",
        ALICE,
        vec![ProviderError::rate_limited(Some(u64::MAX), "quota exceeded")],
    );

    let started = tokio::time::Instant::now();
    let report = FolderPermissionPropagator::new(&tree)
        .with_options(hint_options(Duration::from_secs(5)))
        .share_folder_recursively("root", &[ALICE], Role::Viewer)
        .await
        .expect("second attempt succeeds");
    let waited = started.elapsed();

    assert_eq!(tree.grant_calls(), 2);
    assert_eq!(report.granted_count(), 1);
    assert!(waited >= Duration::from_secs(5), "waited {:?}", waited);
    assert!(waited < Duration::from_secs(6), "waited {:?}", waited);
}
