//! Structured logging for restart batches
//!
//! Every significant step of a run is emitted as a `tracing` event with an
//! `event` field so JSON output can be filtered by machine.

use tracing::{debug, info, warn};

use crate::cluster::{ClusterError, ControllerTarget, Scope};
use crate::matcher::IndirectOwner;
use crate::restart::RestartError;

/// Structured logger for batch events
#[derive(Debug, Clone, Default)]
pub struct BatchLogger {
    run_id: String,
}

impl BatchLogger {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
        }
    }

    pub fn log_listing(&self, scope: &Scope, pod_count: usize) {
        info!(
            event = "pods_listed",
            run_id = %self.run_id,
            scope = %scope,
            pod_count = pod_count,
            "Listed pods"
        );
    }

    /// A matching pod is owned through a ReplicaSet and one-hop resolution left it unresolved
    pub fn log_indirect_owner_skipped(&self, owner: &IndirectOwner) {
        warn!(
            event = "indirect_owner_skipped",
            run_id = %self.run_id,
            namespace = %owner.namespace,
            pod = %owner.pod,
            replica_set = %owner.replica_set,
            "Pod is owned by a ReplicaSet; not following to its Deployment"
        );
    }

    pub fn log_replica_set_lookup_failed(&self, owner: &IndirectOwner, error: &ClusterError) {
        warn!(
            event = "replica_set_lookup_failed",
            run_id = %self.run_id,
            namespace = %owner.namespace,
            pod = %owner.pod,
            replica_set = %owner.replica_set,
            error = %error,
            "Could not resolve ReplicaSet owner"
        );
    }

    pub fn log_targets_resolved(&self, targets: &[ControllerTarget]) {
        if targets.is_empty() {
            info!(event = "no_targets", run_id = %self.run_id, "No matching controllers");
            return;
        }

        for target in targets {
            debug!(
                event = "target_selected",
                run_id = %self.run_id,
                kind = %target.kind,
                namespace = %target.namespace,
                controller = %target.name,
                "Selected controller for restart"
            );
        }
    }

    /// `stale_version` is the resource version the rejected write was based on
    pub fn log_conflict_retry(&self, target: &ControllerTarget, attempt: u32, stale_version: Option<&str>) {
        warn!(
            event = "update_conflict",
            run_id = %self.run_id,
            kind = %target.kind,
            namespace = %target.namespace,
            controller = %target.name,
            attempt = attempt,
            stale_version = stale_version.unwrap_or(""),
            "Controller changed during restart; refetching"
        );
    }

    pub fn log_restarted(&self, target: &ControllerTarget, marker: &str) {
        info!(
            event = "controller_restarted",
            run_id = %self.run_id,
            kind = %target.kind,
            namespace = %target.namespace,
            controller = %target.name,
            restarted_at = %marker,
            "Restart triggered"
        );
    }

    pub fn log_restart_failed(&self, target: &ControllerTarget, error: &RestartError) {
        info!(
            event = "controller_restart_failed",
            run_id = %self.run_id,
            kind = %target.kind,
            namespace = %target.namespace,
            controller = %target.name,
            error = %error,
            "Restart failed"
        );
    }
}
