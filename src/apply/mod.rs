// src/apply/mod.rs

//! Apply phase
//!
//! Runs a [`Plan`] in two stages:
//!
//! 1. **Cache**: payloads for every executable entry are acquired on a
//!    bounded worker pool and verified against their declared hashes.
//! 2. **Execute**: entries run one at a time in plan order. Files-in-use
//!    reports go to the policy layer, which chooses to retry or abort.
//!
//! The first unrecoverable failure rolls back every completed action whose
//! boundary index is at or below the failing entry's, newest first.
//! Rollback failures are logged and collected, never retried.
//!
//! ```text
//! Idle -> Caching -> Executing -> Applied
//!                        |
//!                        +-> RollingBack -> Failed | Canceled
//! ```

mod cache;
mod execute;
mod rollback;
mod sources;

pub use sources::{
    default_sources, AcquireRequest, CacheSource, DownloadSource, LocalSource, PayloadSource,
};

use crate::backend::{BackendRegistry, RestartState};
use crate::bundle::{Action, Bundle, FacadeTable};
use crate::callbacks::{Control, EngineCallbacks};
use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::error::{Error, Result, STATUS_SUCCESS};
use crate::plan::Plan;
use crate::variables::VariableStore;
use cache::CacheStage;
use chrono::{DateTime, Utc};
use execute::ExecuteStage;
use rollback::Rollback;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use strum_macros::Display;
use tracing::{debug, error, info, warn};

/// Apply engine state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ApplyState {
    #[default]
    Idle,
    Caching,
    Executing,
    RollingBack,
    Applied,
    Failed,
    Canceled,
}

impl ApplyState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Applied | Self::Failed | Self::Canceled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ExecutionStatus {
    Success,
    Failed,
    /// Stopped by cooperative cancellation, not by a fault
    Canceled,
}

/// Result of executing one package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub code: i32,
    /// Files-in-use retries made before this result
    pub retries: u32,
}

impl ExecutionResult {
    pub fn success(retries: u32) -> Self {
        Self {
            status: ExecutionStatus::Success,
            code: STATUS_SUCCESS,
            retries,
        }
    }

    pub fn failed(error: &Error, retries: u32) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            code: error.code(),
            retries,
        }
    }

    pub fn canceled(retries: u32) -> Self {
        Self {
            status: ExecutionStatus::Canceled,
            code: Error::Cancelled(String::new()).code(),
            retries,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageResult {
    pub package_id: String,
    pub action: Action,
    #[serde(flatten)]
    pub result: ExecutionResult,
}

/// Everything an apply run did
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyOutcome {
    pub state: ApplyState,
    pub status: i32,
    #[serde(default)]
    pub error: Option<String>,
    /// Packages that reached execution, in execution order
    pub results: Vec<PackageResult>,
    /// Packages compensated by rollback, in rollback order
    pub rolled_back: Vec<String>,
    pub rollback_warnings: Vec<String>,
    /// Packages the policy layer skipped during cache or execute
    pub skipped: Vec<String>,
    pub restart: RestartState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ApplyOutcome {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            state: ApplyState::Idle,
            status: STATUS_SUCCESS,
            error: None,
            results: Vec::new(),
            rolled_back: Vec::new(),
            rollback_warnings: Vec::new(),
            skipped: Vec::new(),
            restart: RestartState::None,
            started_at: now,
            finished_at: now,
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == ApplyState::Applied
    }

    pub fn result(&self, package_id: &str) -> Option<&ExecutionResult> {
        self.results
            .iter()
            .find(|r| r.package_id == package_id)
            .map(|r| &r.result)
    }

    /// Packages whose action succeeded, in execution order
    pub fn succeeded(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| r.result.status == ExecutionStatus::Success)
            .map(|r| r.package_id.as_str())
            .collect()
    }

    fn fail(&mut self, state: ApplyState, error: &Error) {
        self.state = state;
        self.status = error.code();
        self.error = Some(error.to_string());
    }
}

/// Acquires elevated privileges for per-machine actions
pub trait Elevator: Send + Sync {
    fn elevate(&self) -> Result<()>;
}

/// For processes that already hold the privileges they need
#[derive(Debug, Default, Clone, Copy)]
pub struct AlreadyElevated;

impl Elevator for AlreadyElevated {
    fn elevate(&self) -> Result<()> {
        Ok(())
    }
}

/// Refuses every elevation request
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyElevation;

impl Elevator for DenyElevation {
    fn elevate(&self) -> Result<()> {
        Err(Error::ElevationDenied("elevation is not available".to_string()))
    }
}

/// What happens to the run when elevation is denied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ElevationPolicy {
    /// The first denied per-machine action fails the run and rolls back
    #[default]
    Abort,
    /// Per-machine actions fail individually; per-user actions still run
    ContinuePerUser,
}

/// Runs plans
pub struct ApplyEngine<'a> {
    backends: &'a BackendRegistry,
    callbacks: &'a dyn EngineCallbacks,
    sources: &'a [Arc<dyn PayloadSource>],
    elevator: &'a dyn Elevator,
    config: &'a EngineConfig,
    cancel: &'a CancelToken,
    elevation_policy: ElevationPolicy,
    state: Mutex<ApplyState>,
}

impl<'a> ApplyEngine<'a> {
    pub fn new(
        backends: &'a BackendRegistry,
        callbacks: &'a dyn EngineCallbacks,
        sources: &'a [Arc<dyn PayloadSource>],
        elevator: &'a dyn Elevator,
        config: &'a EngineConfig,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            backends,
            callbacks,
            sources,
            elevator,
            config,
            cancel,
            elevation_policy: ElevationPolicy::default(),
            state: Mutex::new(ApplyState::Idle),
        }
    }

    pub fn with_elevation_policy(mut self, policy: ElevationPolicy) -> Self {
        self.elevation_policy = policy;
        self
    }

    pub fn state(&self) -> ApplyState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, outcome: &mut ApplyOutcome, next: ApplyState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        debug!("Apply state: {} -> {}", *state, next);
        *state = next;
        outcome.state = next;
    }

    /// Cache then execute `plan`
    ///
    /// Failures are reported in the outcome; `on_apply_complete` is always
    /// emitted with its status.
    pub fn apply(
        &self,
        bundle: &Bundle,
        facades: &FacadeTable,
        variables: &VariableStore,
        plan: &Plan,
    ) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::new();
        self.run(bundle, facades, variables, plan, &mut outcome);
        outcome.finished_at = Utc::now();

        match outcome.state {
            ApplyState::Applied => info!(
                "Applied {} of {} ({} actions)",
                plan.action, bundle.name, outcome.results.len()
            ),
            ApplyState::Canceled => warn!("Apply of {} canceled", bundle.name),
            _ => error!(
                "Apply of {} failed: {}",
                bundle.name,
                outcome.error.as_deref().unwrap_or("unknown error")
            ),
        }
        self.callbacks.on_apply_complete(outcome.status, outcome.restart);
        outcome
    }

    fn run(
        &self,
        bundle: &Bundle,
        facades: &FacadeTable,
        variables: &VariableStore,
        plan: &Plan,
        outcome: &mut ApplyOutcome,
    ) {
        let action_count = plan.action_count();
        info!("Applying {} ({} actions)", plan.action, action_count);

        if self.callbacks.on_apply_begin(action_count) == Control::Cancel {
            let e = Error::Cancelled("apply".to_string());
            outcome.fail(ApplyState::Canceled, &e);
            return;
        }

        self.transition(outcome, ApplyState::Caching);
        let cache = CacheStage {
            callbacks: self.callbacks,
            sources: self.sources,
            cache_root: &self.config.cache_root,
            workers: self.config.cache_workers.max(1),
            attempts: self.config.acquire_attempts.max(1),
            cancel: self.cancel,
        };
        let cached = match cache.run(bundle, facades, plan) {
            Ok(report) => report,
            Err(e) => {
                let state = if e.is_cancelled() {
                    ApplyState::Canceled
                } else {
                    ApplyState::Failed
                };
                self.transition(outcome, state);
                outcome.fail(state, &e);
                return;
            }
        };
        outcome.skipped.extend(cached.skipped.iter().cloned());

        if cached.cancelled {
            self.transition(outcome, ApplyState::Canceled);
            outcome.fail(ApplyState::Canceled, &Error::Cancelled("cache".to_string()));
            return;
        }
        if let Some((package, e)) = cached.failures.first() {
            warn!("Caching failed for {}; nothing was executed", package);
            self.transition(outcome, ApplyState::Failed);
            outcome.fail(ApplyState::Failed, e);
            return;
        }

        self.transition(outcome, ApplyState::Executing);
        let excluded: HashSet<&str> = cached.skipped.iter().map(String::as_str).collect();
        let stage = ExecuteStage {
            backends: self.backends,
            callbacks: self.callbacks,
            elevator: self.elevator,
            elevation_policy: self.elevation_policy,
            cache_root: &self.config.cache_root,
            retry_ceiling: self.config.files_in_use_retry_ceiling,
            cancel: self.cancel,
        };
        let executed = stage.run(bundle, facades, variables, plan, &excluded);

        outcome.results = executed.results;
        outcome.skipped.extend(executed.skipped);
        outcome.restart = executed.restart;

        // Cancellation unwinds everything that completed
        let unwind_to = match (&executed.failure, executed.cancelled) {
            (Some((boundary, _)), _) => Some(*boundary),
            (None, true) => Some(usize::MAX),
            (None, false) => None,
        };

        if let Some(boundary) = unwind_to
            && !executed.completed.is_empty()
        {
            self.transition(outcome, ApplyState::RollingBack);
            let rollback = Rollback {
                backends: self.backends,
                callbacks: self.callbacks,
                cache_root: &self.config.cache_root,
            };
            let report = rollback.run(bundle, facades, variables, &executed.completed, boundary);
            outcome.rolled_back = report.rolled_back;
            outcome.rollback_warnings = report.warnings;
        }

        match (executed.failure, executed.cancelled) {
            (Some((_, e)), _) => {
                self.transition(outcome, ApplyState::Failed);
                outcome.fail(ApplyState::Failed, &e);
            }
            (None, true) => {
                self.transition(outcome, ApplyState::Canceled);
                outcome.fail(ApplyState::Canceled, &Error::Cancelled("execute".to_string()));
            }
            (None, false) if !executed.denied.is_empty() => {
                let e = Error::ElevationDenied(executed.denied.join(", "));
                self.transition(outcome, ApplyState::Failed);
                outcome.fail(ApplyState::Failed, &e);
            }
            (None, false) => {
                self.transition(outcome, ApplyState::Applied);
                outcome.status = STATUS_SUCCESS;
            }
        }
    }
}

/// Convenience for callers that only need the status code of a result
pub fn status_of<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => STATUS_SUCCESS,
        Err(e) => e.code(),
    }
}
