// src/callbacks.rs

//! Engine callback protocol
//!
//! The policy layer observes every phase through [`EngineCallbacks`] and
//! steers the engine by returning small decision values. Notification order:
//!
//! ```text
//! detect_begin -> detect_related_bundle* -> detect_update* -> detect_package_complete* -> detect_complete
//! plan_begin -> (plan_package_begin -> plan_msi_feature* -> plan_package_complete)* -> plan_complete
//! apply_begin
//!   cache_begin -> (cache_package_begin -> cache_acquire_progress* -> cache_package_complete)* -> cache_complete
//!   execute_begin -> (execute_package_begin -> [elevate_begin -> elevate_complete]?
//!                     -> execute_progress* -> execute_files_in_use* -> execute_package_complete)*
//!   execute_complete
//!   rollback_package_complete*
//! apply_complete
//! ```
//!
//! Elevation is requested at most once, just before the first per-machine
//! package executes. Rollback runs after `execute_complete`, newest action
//! first.
//!
//! Every method has a default, so implementors override only what they need.
//! The engine calls each method exactly once per occurrence and waits for it
//! to return. Implementations may read the session's variable store from
//! inside a callback; the engine holds no store locks while calling out.

use crate::apply::ExecutionResult;
use crate::backend::RestartState;
use crate::bundle::{Action, BundleAction, FeatureState, PackageState, RelatedBundle, RequestState};
use crate::detect::UpdateCandidate;
use crate::plan::PlanEntry;
use tracing::{debug, info, warn};

/// Answer to a phase-level begin or progress event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Control {
    #[default]
    Continue,
    Cancel,
}

/// Answer to a per-package begin event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PackageDecision {
    /// Leave the package out of this phase
    pub skip: bool,
    /// Replace the engine's default requested state (planning only)
    pub override_state: Option<RequestState>,
}

impl PackageDecision {
    pub fn skip() -> Self {
        Self {
            skip: true,
            override_state: None,
        }
    }

    pub fn request(state: RequestState) -> Self {
        Self {
            skip: false,
            override_state: Some(state),
        }
    }
}

/// Answer to a files-in-use report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilesInUseDecision {
    Retry,
    #[default]
    Abort,
}

/// Answer to a failed payload acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheDecision {
    /// Run the whole source chain again
    Retry,
    #[default]
    Accept,
}

/// Policy layer interface
///
/// `Send + Sync` because cache and detection workers run on a pool and the
/// policy layer may live on another thread.
#[allow(unused_variables)]
pub trait EngineCallbacks: Send + Sync {
    fn on_detect_begin(&self, bundle: &str, package_count: usize) -> Control {
        Control::Continue
    }

    fn on_detect_related_bundle(&self, related: &RelatedBundle) {}

    fn on_detect_update(&self, candidate: &UpdateCandidate) {}

    fn on_detect_package_complete(&self, package_id: &str, status: i32, state: Option<PackageState>) {}

    fn on_detect_complete(&self, status: i32) {}

    fn on_plan_begin(&self, action: BundleAction, package_count: usize) -> Control {
        Control::Continue
    }

    /// Return an override to change the requested state, or skip to leave
    /// the package untouched
    fn on_plan_package_begin(&self, package_id: &str, default: RequestState) -> PackageDecision {
        PackageDecision::default()
    }

    /// Return `Some` to change the requested state of an MSI feature
    fn on_plan_msi_feature(
        &self,
        package_id: &str,
        feature_id: &str,
        default: FeatureState,
    ) -> Option<FeatureState> {
        None
    }

    fn on_plan_package_complete(&self, entry: &PlanEntry) {}

    fn on_plan_complete(&self, status: i32) {}

    fn on_apply_begin(&self, action_count: usize) -> Control {
        Control::Continue
    }

    /// Called once, before the first per-machine action
    fn on_elevate_begin(&self) -> Control {
        Control::Continue
    }

    fn on_elevate_complete(&self, status: i32) {}

    fn on_cache_begin(&self, package_count: usize) -> Control {
        Control::Continue
    }

    fn on_cache_package_begin(&self, package_id: &str, payload_count: usize, total_size: u64) -> PackageDecision {
        PackageDecision::default()
    }

    /// Progress of one payload transfer; may run on a cache worker thread
    fn on_cache_acquire_progress(
        &self,
        package_id: &str,
        payload_id: &str,
        bytes: u64,
        total: u64,
        overall_percent: u8,
    ) -> Control {
        Control::Continue
    }

    /// `attempt` counts policy-requested retries already made for this package
    fn on_cache_package_complete(&self, package_id: &str, status: i32, attempt: u32) -> CacheDecision {
        CacheDecision::Accept
    }

    fn on_cache_complete(&self, status: i32) {}

    fn on_execute_begin(&self, action_count: usize) -> Control {
        Control::Continue
    }

    fn on_execute_package_begin(&self, package_id: &str, action: Action) -> PackageDecision {
        PackageDecision::default()
    }

    fn on_execute_progress(&self, package_id: &str, package_percent: u8, overall_percent: u8) -> Control {
        Control::Continue
    }

    /// `retries` is how many times this package has already been retried
    fn on_execute_files_in_use(&self, package_id: &str, files: &[String], retries: u32) -> FilesInUseDecision {
        FilesInUseDecision::Abort
    }

    fn on_execute_package_complete(&self, package_id: &str, result: &ExecutionResult, restart: RestartState) {}

    fn on_rollback_package_complete(&self, package_id: &str, status: i32) {}

    fn on_execute_complete(&self, status: i32) {}

    fn on_apply_complete(&self, status: i32, restart: RestartState) {}
}

/// Accepts every default
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallbacks;

impl EngineCallbacks for NoopCallbacks {}

/// Logs every notification and accepts every default
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingCallbacks;

impl EngineCallbacks for LoggingCallbacks {
    fn on_detect_begin(&self, bundle: &str, package_count: usize) -> Control {
        info!("Detecting {} ({} packages)", bundle, package_count);
        Control::Continue
    }

    fn on_detect_related_bundle(&self, related: &RelatedBundle) {
        info!(
            "Related bundle {} v{} ({})",
            related.bundle_id, related.version, related.relation
        );
    }

    fn on_detect_update(&self, candidate: &UpdateCandidate) {
        debug!("Update candidate v{} at {}", candidate.version, candidate.location);
    }

    fn on_detect_package_complete(&self, package_id: &str, status: i32, state: Option<PackageState>) {
        match state {
            Some(state) => debug!("Detected {}: {}", package_id, state),
            None => warn!("Detection of {} failed (0x{:08x})", package_id, status),
        }
    }

    fn on_detect_complete(&self, status: i32) {
        info!("Detection complete (0x{:08x})", status);
    }

    fn on_plan_begin(&self, action: BundleAction, package_count: usize) -> Control {
        info!("Planning {} for {} packages", action, package_count);
        Control::Continue
    }

    fn on_plan_package_complete(&self, entry: &PlanEntry) {
        debug!(
            "Planned {}: {} (requested {}, boundary {})",
            entry.package_id, entry.action, entry.requested, entry.boundary
        );
    }

    fn on_plan_complete(&self, status: i32) {
        info!("Planning complete (0x{:08x})", status);
    }

    fn on_apply_begin(&self, action_count: usize) -> Control {
        info!("Applying {} actions", action_count);
        Control::Continue
    }

    fn on_elevate_complete(&self, status: i32) {
        info!("Elevation finished (0x{:08x})", status);
    }

    fn on_cache_package_complete(&self, package_id: &str, status: i32, _attempt: u32) -> CacheDecision {
        if status == crate::error::STATUS_SUCCESS {
            debug!("Cached {}", package_id);
        } else {
            warn!("Caching {} failed (0x{:08x})", package_id, status);
        }
        CacheDecision::Accept
    }

    fn on_execute_package_begin(&self, package_id: &str, action: Action) -> PackageDecision {
        info!("{} {}", action, package_id);
        PackageDecision::default()
    }

    fn on_execute_files_in_use(&self, package_id: &str, files: &[String], _retries: u32) -> FilesInUseDecision {
        warn!("Files in use by {}: {}", package_id, files.join(", "));
        FilesInUseDecision::Abort
    }

    fn on_execute_package_complete(&self, package_id: &str, result: &ExecutionResult, restart: RestartState) {
        info!(
            "{} finished: {} (0x{:08x}, restart {})",
            package_id, result.status, result.code, restart
        );
    }

    fn on_rollback_package_complete(&self, package_id: &str, status: i32) {
        if status != crate::error::STATUS_SUCCESS {
            warn!("Rollback of {} failed (0x{:08x})", package_id, status);
        }
    }

    fn on_apply_complete(&self, status: i32, restart: RestartState) {
        info!("Apply complete (0x{:08x}, restart {})", status, restart);
    }
}
