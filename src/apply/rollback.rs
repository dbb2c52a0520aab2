// src/apply/rollback.rs

//! Best-effort compensation of completed actions

use super::execute::CompletedAction;
use crate::backend::{BackendRegistry, ExecuteRequest};
use crate::bundle::{Bundle, FacadeTable};
use crate::callbacks::EngineCallbacks;
use crate::error::{Error, Result, STATUS_SUCCESS};
use crate::plan::PlanEntry;
use crate::progress::SilentProgress;
use crate::variables::VariableStore;
use std::path::Path;
use tracing::{info, warn};

pub(super) struct Rollback<'a> {
    pub backends: &'a BackendRegistry,
    pub callbacks: &'a dyn EngineCallbacks,
    pub cache_root: &'a Path,
}

#[derive(Debug, Default)]
pub(super) struct RollbackReport {
    pub rolled_back: Vec<String>,
    pub warnings: Vec<String>,
}

impl Rollback<'_> {
    /// Compensate every completed action with a boundary index at or below
    /// `boundary`, newest first
    ///
    /// Ignores cancellation: once started, the unwind always finishes.
    pub fn run(
        &self,
        bundle: &Bundle,
        facades: &FacadeTable,
        variables: &VariableStore,
        completed: &[CompletedAction<'_>],
        boundary: usize,
    ) -> RollbackReport {
        let mut report = RollbackReport::default();

        for action in completed.iter().rev().filter(|a| a.entry.boundary <= boundary) {
            let entry = action.entry;
            let result = self.compensate(bundle, facades, variables, entry);

            let status = match &result {
                Ok(()) => STATUS_SUCCESS,
                Err(e) => e.code(),
            };
            self.callbacks
                .on_rollback_package_complete(&entry.package_id, status);

            match result {
                Ok(()) => {
                    info!("Rolled back {} of {}", entry.action, entry.package_id);
                    report.rolled_back.push(entry.package_id.clone());
                }
                Err(e) => {
                    warn!("Rollback of {} failed: {}", entry.package_id, e);
                    report.warnings.push(format!("{}: {}", entry.package_id, e));
                }
            }
        }
        report
    }

    fn compensate(
        &self,
        bundle: &Bundle,
        facades: &FacadeTable,
        variables: &VariableStore,
        entry: &PlanEntry,
    ) -> Result<()> {
        let package = bundle.package(&entry.package_id).ok_or_else(|| {
            Error::ConfigError(format!("package '{}' is not in the bundle", entry.package_id))
        })?;
        let facade = facades.require(package)?;
        let backend = self.backends.require(package)?;
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
        backend.rollback(&request, &SilentProgress::new())
    }
}
