//! Rolling restart trigger
//!
//! A restart is requested the same way `kubectl rollout restart` does it: by
//! stamping the pod template with a `restartedAt` annotation. The controller
//! sees a changed template and replaces its pods.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use thiserror::Error;

use crate::cluster::{ClusterClient, ClusterError, Controller, ControllerTarget, WritePrecondition};
use crate::observability::BatchLogger;

/// Pod template annotation watched by the workload controllers
pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 3;

/// How far ahead of the local clock a previous marker may be and still be stepped past
const MAX_MARKER_SKEW_SECS: i64 = 300;

#[derive(Debug, Error)]
pub enum RestartError {
    #[error("{0}")]
    NotFound(ClusterError),

    #[error("fetch failed: {0}")]
    Fetch(ClusterError),

    #[error("update failed: {0}")]
    Write(ClusterError),

    #[error("update still conflicting after {attempts} attempts: {source}")]
    ConflictRetriesExhausted { attempts: u32, source: ClusterError },

    #[error("controller has no spec, cannot set pod template annotation")]
    MissingTemplate,
}

impl RestartError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RestartError::NotFound(_))
    }
}

/// Concurrency guard used when writing the controller back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Replace without a resource version; concurrent edits may be overwritten
    #[default]
    Unconditional,
    /// Send the fetched resource version and refetch on conflict
    Optimistic,
}

#[derive(Debug, Clone, Copy)]
pub struct RestartOptions {
    pub write_mode: WriteMode,
    /// Refetch attempts after a conflict, optimistic mode only
    pub max_conflict_retries: u32,
}

impl Default for RestartOptions {
    fn default() -> Self {
        Self {
            write_mode: WriteMode::default(),
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
        }
    }
}

impl RestartOptions {
    fn precondition(&self) -> WritePrecondition {
        match self.write_mode {
            WriteMode::Unconditional => WritePrecondition::None,
            WriteMode::Optimistic => WritePrecondition::ResourceVersion,
        }
    }
}

/// Marker value for a restart at `now`.
///
/// Values are RFC 3339 UTC with nanoseconds. If the previous marker is not
/// older than `now` the result is one nanosecond past it, so consecutive
/// restarts always change the template. A previous marker more than
/// five minutes ahead of `now` is treated as bogus and `now` is used.
pub fn next_marker_value(previous: Option<&str>, now: DateTime<Utc>) -> String {
    let previous = previous
        .and_then(|p| DateTime::parse_from_rfc3339(p).ok())
        .map(|p| p.with_timezone(&Utc));

    let at = match previous {
        Some(prev) if prev >= now && prev - now <= Duration::seconds(MAX_MARKER_SKEW_SECS) => {
            prev + Duration::nanoseconds(1)
        }
        _ => now,
    };

    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Stamp the restart marker onto the controller's pod template.
///
/// Only the marker annotation changes (the annotation map is created if
/// missing). Returns the written value, or `None` if the controller has no spec.
pub fn apply_marker(controller: &mut Controller, now: DateTime<Utc>) -> Option<String> {
    let value = next_marker_value(controller.template_annotation(RESTARTED_AT_ANNOTATION), now);
    controller
        .template_annotations_mut()?
        .insert(RESTARTED_AT_ANNOTATION.to_string(), value.clone());
    Some(value)
}

/// Fetch, stamp and write back one controller. Returns the marker written.
pub async fn restart_controller(
    cluster: &dyn ClusterClient,
    target: &ControllerTarget,
    options: &RestartOptions,
    logger: &BatchLogger,
) -> Result<String, RestartError> {
    let precondition = options.precondition();
    let mut attempt: u32 = 0;

    loop {
        let mut controller = cluster.get_controller(target).await.map_err(|e| {
            if e.is_not_found() {
                RestartError::NotFound(e)
            } else {
                RestartError::Fetch(e)
            }
        })?;

        let marker = apply_marker(&mut controller, Utc::now()).ok_or(RestartError::MissingTemplate)?;

        match cluster.update_controller(target, &controller, precondition).await {
            Ok(()) => return Ok(marker),
            Err(e) if e.is_not_found() => return Err(RestartError::NotFound(e)),
            Err(e) if e.is_conflict() && options.write_mode == WriteMode::Optimistic => {
                if attempt >= options.max_conflict_retries {
                    return Err(RestartError::ConflictRetriesExhausted {
                        attempts: attempt + 1,
                        source: e,
                    });
                }
                attempt += 1;
                logger.log_conflict_retry(target, attempt, controller.resource_version());
            }
            Err(e) => return Err(RestartError::Write(e)),
        }
    }
}
