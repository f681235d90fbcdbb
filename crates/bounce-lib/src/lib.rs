//! Rolling restarts for data-serving workloads
//!
//! This crate provides:
//! - Cluster access behind the `ClusterClient` trait
//! - Pod-to-controller matching by pod name
//! - Restart triggering through the pod template `restartedAt` annotation
//! - Per-controller outcome reporting
//!
//! [`run`] wires these into a single batch: list, match, restart each target,
//! report each outcome. Only the listing step can fail the batch as a whole.

pub mod cluster;
pub mod matcher;
pub mod observability;
pub mod report;
pub mod restart;


use futures::stream::{self, StreamExt};

pub use cluster::{
    ClusterClient, ClusterError, Controller, ControllerKind, ControllerTarget, KubeCluster,
    OwnerKind, OwnerRef, PodRecord, Scope, WritePrecondition,
};
pub use matcher::{MatchOptions, NamePredicate, DEFAULT_NAME_FRAGMENT};
pub use observability::BatchLogger;
pub use report::{BatchReport, ConsoleReporter, Outcome, OutcomeSink};
pub use restart::{RestartError, RestartOptions, WriteMode, RESTARTED_AT_ANNOTATION};

/// Options for a whole batch
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub matching: MatchOptions,
    pub restart: RestartOptions,
    /// Restarts in flight at once; 1 runs them strictly one after another
    pub concurrency: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            matching: MatchOptions::default(),
            restart: RestartOptions::default(),
            concurrency: 1,
        }
    }
}

/// Restart every controller owning a matching pod in `scope`.
///
/// Outcomes reach `sink` in target order even when restarts run concurrently.
/// Per-target failures are reported and counted; only a failed pod listing
/// returns `Err`.
pub async fn run(
    cluster: &dyn ClusterClient,
    scope: &Scope,
    options: &RunOptions,
    sink: &mut dyn OutcomeSink,
    logger: &BatchLogger,
) -> Result<BatchReport, ClusterError> {
    let targets = matcher::resolve_targets(cluster, scope, &options.matching, logger).await?;
    logger.log_targets_resolved(&targets);

    let restart_options = &options.restart;
    let mut outcomes = stream::iter(targets)
        .map(move |target| async move {
            let result = restart::restart_controller(cluster, &target, restart_options, logger).await;
            Outcome { target, result }
        })
        .buffered(options.concurrency.max(1));

    let mut report = BatchReport::default();
    while let Some(outcome) = outcomes.next().await {
        match &outcome.result {
            Ok(marker) => logger.log_restarted(&outcome.target, marker),
            Err(e) => logger.log_restart_failed(&outcome.target, e),
        }
        report.add(&outcome);
        sink.record(&outcome);
    }

    Ok(report)
}
