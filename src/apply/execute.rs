// src/apply/execute.rs

//! Execute stage
//!
//! Entries run strictly one after another in plan order. Cancellation is
//! observed between packages and before each files-in-use retry; a package
//! that has started is never interrupted.

use super::{ElevationPolicy, Elevator, ExecutionResult, PackageResult};
use crate::backend::{BackendRegistry, ExecuteOutcome, ExecuteRequest, RestartState};
use crate::bundle::{Bundle, FacadeTable};
use crate::callbacks::{Control, EngineCallbacks, FilesInUseDecision};
use crate::cancel::CancelToken;
use crate::error::{Error, Result, STATUS_SUCCESS};
use crate::plan::{Plan, PlanEntry};
use crate::progress::{ProgressSink, WeightedProgress};
use crate::variables::{builtin, VariableStore};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

/// An action that ran to completion and can be compensated
pub(super) struct CompletedAction<'p> {
    pub entry: &'p PlanEntry,
}

#[derive(Default)]
pub(super) struct ExecuteReport<'p> {
    pub results: Vec<PackageResult>,
    pub completed: Vec<CompletedAction<'p>>,
    pub skipped: Vec<String>,
    pub restart: RestartState,
    /// Boundary index of the failing entry and its error
    pub failure: Option<(usize, Error)>,
    pub cancelled: bool,
    /// Per-machine packages refused under `ElevationPolicy::ContinuePerUser`
    pub denied: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Elevation {
    NotRequested,
    Granted,
    Denied,
}

pub(super) struct ExecuteStage<'a> {
    pub backends: &'a BackendRegistry,
    pub callbacks: &'a dyn EngineCallbacks,
    pub elevator: &'a dyn Elevator,
    pub elevation_policy: ElevationPolicy,
    pub cache_root: &'a Path,
    pub retry_ceiling: Option<u32>,
    pub cancel: &'a CancelToken,
}

/// Folds one package's progress into the overall percentage
struct PackageProgress<'a> {
    callbacks: &'a dyn EngineCallbacks,
    package_id: &'a str,
    weight: u64,
    weights: &'a WeightedProgress,
    cancel: &'a CancelToken,
}

impl ProgressSink for PackageProgress<'_> {
    fn report(&self, percent: u8) -> bool {
        let percent = percent.min(100);
        let overall = self.weights.overall(self.weight, percent);
        if self
            .callbacks
            .on_execute_progress(self.package_id, percent, overall)
            == Control::Cancel
        {
            self.cancel.cancel();
        }
        !self.cancel.is_cancelled()
    }
}

impl ExecuteStage<'_> {
    pub fn run<'p>(
        &self,
        bundle: &Bundle,
        facades: &FacadeTable,
        variables: &VariableStore,
        plan: &'p Plan,
        excluded: &HashSet<&str>,
    ) -> ExecuteReport<'p> {
        let entries: Vec<&PlanEntry> = plan
            .executable()
            .filter(|e| !excluded.contains(e.package_id.as_str()))
            .collect();

        let mut report = ExecuteReport::default();

        if self.callbacks.on_execute_begin(entries.len()) == Control::Cancel {
            self.cancel.cancel();
            report.cancelled = true;
            self.callbacks
                .on_execute_complete(Error::Cancelled("execute".to_string()).code());
            return report;
        }

        let weights = WeightedProgress::new(entries.iter().map(|e| e.weight).sum());
        let mut elevation = Elevation::NotRequested;

        for entry in entries {
            let id = entry.package_id.as_str();

            if self.cancel.is_cancelled() {
                info!("Cancellation requested; not starting {}", id);
                report.cancelled = true;
                break;
            }

            let decision = self.callbacks.on_execute_package_begin(id, entry.action);
            if decision.skip {
                info!("Policy skipped {} of {}", entry.action, id);
                report.skipped.push(id.to_string());
                weights.complete(entry.weight);
                continue;
            }

            if entry.per_machine && !self.ensure_elevated(&mut elevation, variables) {
                let e = Error::ElevationDenied(id.to_string());
                let result = ExecutionResult::failed(&e, 0);
                self.callbacks
                    .on_execute_package_complete(id, &result, RestartState::None);
                report.results.push(PackageResult {
                    package_id: id.to_string(),
                    action: entry.action,
                    result,
                });

                match self.elevation_policy {
                    ElevationPolicy::Abort => {
                        report.failure = Some((entry.boundary, e));
                        break;
                    }
                    ElevationPolicy::ContinuePerUser => {
                        warn!("{}; continuing with per-user packages", e);
                        report.denied.push(id.to_string());
                        weights.complete(entry.weight);
                        continue;
                    }
                }
            }

            let (result, retries) = self.execute_package(bundle, facades, variables, entry, &weights);
            match result {
                Ok(restart) => {
                    let result = ExecutionResult::success(retries);
                    self.callbacks.on_execute_package_complete(id, &result, restart);
                    let overall = weights.complete(entry.weight);
                    debug!("{} done ({}% overall)", id, overall);

                    report.restart = report.restart.max(restart);
                    report.results.push(PackageResult {
                        package_id: id.to_string(),
                        action: entry.action,
                        result,
                    });
                    report.completed.push(CompletedAction { entry });
                }
                Err(e) => {
                    let result = if e.is_cancelled() {
                        ExecutionResult::canceled(retries)
                    } else {
                        ExecutionResult::failed(&e, retries)
                    };
                    self.callbacks
                        .on_execute_package_complete(id, &result, RestartState::None);
                    report.results.push(PackageResult {
                        package_id: id.to_string(),
                        action: entry.action,
                        result,
                    });

                    if e.is_cancelled() {
                        info!("{} stopped by cancellation", id);
                        report.cancelled = true;
                    } else {
                        warn!("{} of {} failed: {}", entry.action, id, e);
                        report.failure = Some((entry.boundary, e));
                    }
                    break;
                }
            }
        }

        let status = match (&report.failure, report.cancelled) {
            (Some((_, e)), _) => e.code(),
            (None, true) => Error::Cancelled("execute".to_string()).code(),
            (None, false) => STATUS_SUCCESS,
        };
        self.callbacks.on_execute_complete(status);
        report
    }

    /// Request elevation the first time a per-machine entry needs it
    fn ensure_elevated(&self, elevation: &mut Elevation, variables: &VariableStore) -> bool {
        if *elevation == Elevation::NotRequested {
            let result = if self.callbacks.on_elevate_begin() == Control::Cancel {
                Err(Error::ElevationDenied("declined by policy".to_string()))
            } else {
                self.elevator.elevate()
            };

            *elevation = match &result {
                Ok(()) => {
                    info!("Elevation granted");
                    variables.set_builtin(builtin::PRIVILEGED, 1);
                    Elevation::Granted
                }
                Err(e) => {
                    warn!("Elevation failed: {}", e);
                    Elevation::Denied
                }
            };
            self.callbacks.on_elevate_complete(super::status_of(&result));
        }
        *elevation == Elevation::Granted
    }

    /// Run one entry, looping on files-in-use while the policy asks to retry
    ///
    /// Returns the outcome and the number of retries made.
    fn execute_package(
        &self,
        bundle: &Bundle,
        facades: &FacadeTable,
        variables: &VariableStore,
        entry: &PlanEntry,
        weights: &WeightedProgress,
    ) -> (Result<RestartState>, u32) {
        let id = entry.package_id.as_str();
        let package = match bundle.package(id) {
            Some(p) => p,
            None => {
                return (
                    Err(Error::ConfigError(format!("planned package '{id}' is not in the bundle"))),
                    0,
                );
            }
        };
        let (facade, backend) = match facades
            .require(package)
            .and_then(|f| Ok((f, self.backends.require(package)?)))
        {
            Ok(found) => found,
            Err(e) => return (Err(e), 0),
        };

        let cache_dir = self.cache_root.join(package.cache_id());
        let request = ExecuteRequest {
            package,
            facade,
            action: entry.action,
            per_machine: entry.per_machine,
            cache_dir: &cache_dir,
            variables,
            features: &entry.features,
        };
        let sink = PackageProgress {
            callbacks: self.callbacks,
            package_id: id,
            weight: entry.weight,
            weights,
            cancel: self.cancel,
        };

        let mut retries = 0;
        loop {
            let files = match backend.execute(&request, &sink) {
                Ok(ExecuteOutcome::Success { restart }) => return (Ok(restart), retries),
                Ok(ExecuteOutcome::FilesInUse { files }) => files,
                Err(e) => return (Err(e), retries),
            };

            let decision = self.callbacks.on_execute_files_in_use(id, &files, retries);
            let within_ceiling = self.retry_ceiling.is_none_or(|ceiling| retries < ceiling);
            let in_use = Error::FilesInUse {
                package: id.to_string(),
                files,
            };

            match decision {
                FilesInUseDecision::Retry if within_ceiling => {
                    if let Err(e) = self.cancel.check("execute") {
                        return (Err(e), retries);
                    }
                    retries += 1;
                    info!("Retrying {} after files in use (retry {})", id, retries);
                }
                FilesInUseDecision::Retry => {
                    warn!("{}: retry ceiling of {} reached", in_use, retries);
                    return (Err(in_use), retries);
                }
                FilesInUseDecision::Abort => return (Err(in_use), retries),
            }
        }
    }
}
