//! Workload matching
//!
//! Selects pods by name and resolves them to the controllers that own them.
//! Resolution is one hop by default: only owner references that name a
//! Deployment or StatefulSet directly are used. Pods owned through a
//! ReplicaSet are skipped unless `follow_replica_sets` is enabled.

use std::collections::HashSet;

use crate::cluster::{ClusterClient, ClusterError, ControllerTarget, OwnerKind, PodRecord, Scope};
use crate::observability::BatchLogger;

/// Name fragment used when none is configured
pub const DEFAULT_NAME_FRAGMENT: &str = "database";

/// Case-sensitive substring test against pod names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamePredicate {
    fragment: String,
}

impl NamePredicate {
    pub fn new(fragment: impl Into<String>) -> Self {
        Self {
            fragment: fragment.into(),
        }
    }

    pub fn fragment(&self) -> &str {
        &self.fragment
    }

    pub fn matches(&self, pod_name: &str) -> bool {
        pod_name.contains(&self.fragment)
    }
}

impl Default for NamePredicate {
    fn default() -> Self {
        Self::new(DEFAULT_NAME_FRAGMENT)
    }
}

#[derive(Debug, Clone)]
pub struct MatchOptions {
    pub predicate: NamePredicate,
    /// Emit each controller at most once, keeping first-seen order
    pub dedupe: bool,
    /// Resolve ReplicaSet owners to their Deployment
    pub follow_replica_sets: bool,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            predicate: NamePredicate::default(),
            dedupe: true,
            follow_replica_sets: false,
        }
    }
}

/// A ReplicaSet owner seen on a matching pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndirectOwner {
    pub pod: String,
    pub namespace: String,
    pub replica_set: String,
}

/// One-hop selection result
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub targets: Vec<ControllerTarget>,
    pub indirect: Vec<IndirectOwner>,
}

/// Select controller targets from a pod inventory without touching the cluster.
///
/// Every owner reference of every matching pod is visited in order.
/// ReplicaSet owners are collected in `indirect` for the caller to resolve or
/// report; other kinds are ignored.
pub fn select_targets(pods: &[PodRecord], options: &MatchOptions) -> Selection {
    let mut selection = Selection::default();
    let mut seen = HashSet::new();

    for pod in pods.iter().filter(|p| options.predicate.matches(&p.name)) {
        for owner in &pod.owners {
            match &owner.kind {
                OwnerKind::Controller(kind) => {
                    let target = ControllerTarget::new(*kind, &pod.namespace, &owner.name);
                    push_target(&mut selection.targets, &mut seen, target, options.dedupe);
                }
                OwnerKind::ReplicaSet => selection.indirect.push(IndirectOwner {
                    pod: pod.name.clone(),
                    namespace: pod.namespace.clone(),
                    replica_set: owner.name.clone(),
                }),
                OwnerKind::Other(_) => {}
            }
        }
    }

    selection
}

fn push_target(
    targets: &mut Vec<ControllerTarget>,
    seen: &mut HashSet<ControllerTarget>,
    target: ControllerTarget,
    dedupe: bool,
) {
    if dedupe && !seen.insert(target.clone()) {
        return;
    }
    targets.push(target);
}

/// List pods in `scope` and resolve the controllers to restart.
///
/// A listing failure aborts the whole run. ReplicaSet lookup failures in
/// multi-hop mode only skip the affected owner.
pub async fn resolve_targets(
    cluster: &dyn ClusterClient,
    scope: &Scope,
    options: &MatchOptions,
    logger: &BatchLogger,
) -> Result<Vec<ControllerTarget>, ClusterError> {
    let pods = cluster.list_pods(scope).await?;
    logger.log_listing(scope, pods.len());

    let selection = select_targets(&pods, options);

    if !options.follow_replica_sets {
        for owner in &selection.indirect {
            logger.log_indirect_owner_skipped(owner);
        }
        return Ok(selection.targets);
    }

    let mut targets = selection.targets;
    let mut seen: HashSet<ControllerTarget> = targets.iter().cloned().collect();

    for owner in &selection.indirect {
        let owners = match cluster
            .replica_set_owners(&owner.namespace, &owner.replica_set)
            .await
        {
            Ok(owners) => owners,
            Err(e) => {
                logger.log_replica_set_lookup_failed(owner, &e);
                continue;
            }
        };

        for parent in owners {
            if let OwnerKind::Controller(kind) = parent.kind {
                let target = ControllerTarget::new(kind, &owner.namespace, parent.name);
                push_target(&mut targets, &mut seen, target, options.dedupe);
            }
        }
    }

    Ok(targets)
}
