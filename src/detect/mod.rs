// src/detect/mod.rs

//! Detection phase
//!
//! Determines the bundle's registration, synthesizes packages for related
//! bundles, and queries every declared package's installed state on a
//! bounded worker pool. Package failures are isolated: they are recorded in
//! the report and never stop sibling detection. Only non-recoverable
//! failures (fatal `DetectionFailure`, unknown package type) or cancellation
//! fail the phase.
//!
//! Workers only read shared state. Their results are written back to the
//! packages by the calling thread, one record per package.

mod registration;
mod update;

pub use registration::{classify, InMemoryRegistrations, InstalledBundle, RegistrationStore};
pub use update::{select_update, FeedUpdateSource, StaticUpdateSource, UpdateCandidate, UpdateSource};

use crate::backend::{BackendRegistry, DetectRequest, DetectedState};
use crate::bundle::{Action, Bundle, FacadeTable, Package, PackageState};
use crate::callbacks::{Control, EngineCallbacks};
use crate::cancel::CancelToken;
use crate::error::{Error, Result, STATUS_SUCCESS};
use crate::variables::{builtin, VariableStore};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;
use strum_macros::Display;
use tracing::{debug, info, warn};

/// Detector state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum DetectState {
    Idle,
    Detecting,
    Detected,
    DetectFailed,
}

/// Detection knobs chosen per run
#[derive(Debug, Clone, Copy, Default)]
pub struct DetectOptions {
    pub check_updates: bool,
}

/// Outcome for one package
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageDetection {
    pub package_id: String,
    pub state: Option<PackageState>,
    pub cached: bool,
    pub status: i32,
    pub error: Option<String>,
}

/// Everything detection learned
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionReport {
    pub status: i32,
    pub bundle_installed: bool,
    pub packages: Vec<PackageDetection>,
    pub related: Vec<crate::bundle::RelatedBundle>,
    /// `None` means no update is available (or no check was made)
    pub update: Option<UpdateCandidate>,
    /// Update source failures are informational and never fail detection
    pub update_error: Option<String>,
}

impl DetectionReport {
    /// Packages whose detection failed
    pub fn failures(&self) -> impl Iterator<Item = &PackageDetection> {
        self.packages.iter().filter(|p| p.error.is_some())
    }
}

/// Runs the detection phase
pub struct Detector<'a> {
    backends: &'a BackendRegistry,
    callbacks: &'a dyn EngineCallbacks,
    registrations: Option<&'a dyn RegistrationStore>,
    updates: Option<&'a dyn UpdateSource>,
    workers: usize,
    cache_root: &'a Path,
    cancel: &'a CancelToken,
}

impl<'a> Detector<'a> {
    pub fn new(
        backends: &'a BackendRegistry,
        callbacks: &'a dyn EngineCallbacks,
        workers: usize,
        cache_root: &'a Path,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            backends,
            callbacks,
            registrations: None,
            updates: None,
            workers: workers.max(1),
            cache_root,
            cancel,
        }
    }

    pub fn with_registrations(mut self, store: &'a dyn RegistrationStore) -> Self {
        self.registrations = Some(store);
        self
    }

    pub fn with_updates(mut self, source: &'a dyn UpdateSource) -> Self {
        self.updates = Some(source);
        self
    }

    /// Detect the bundle, its related bundles, and every package
    ///
    /// Always emits `on_detect_complete` with the final status.
    pub fn detect(
        &self,
        bundle: &mut Bundle,
        facades: &mut FacadeTable,
        variables: &VariableStore,
        options: DetectOptions,
    ) -> Result<DetectionReport> {
        let result = self.run(bundle, facades, variables, options);
        let status = match &result {
            Ok(report) => report.status,
            Err(e) => e.code(),
        };
        self.callbacks.on_detect_complete(status);
        result
    }

    fn run(
        &self,
        bundle: &mut Bundle,
        facades: &mut FacadeTable,
        variables: &VariableStore,
        options: DetectOptions,
    ) -> Result<DetectionReport> {
        info!("Detecting bundle {} v{}", bundle.name, bundle.version);

        if self.callbacks.on_detect_begin(&bundle.name, bundle.packages.len()) == Control::Cancel {
            return Err(Error::Cancelled("detect".to_string()));
        }

        let related = self.detect_registrations(bundle, facades)?;
        variables.set_builtin(builtin::BUNDLE_INSTALLED, i64::from(bundle.installed));

        let packages = self.detect_packages(bundle, facades, variables)?;

        let (update, update_error) = if options.check_updates {
            self.detect_update(bundle)
        } else {
            (None, None)
        };

        Ok(DetectionReport {
            status: STATUS_SUCCESS,
            bundle_installed: bundle.installed,
            packages,
            related,
            update,
            update_error,
        })
    }

    /// Registration lookup and related-bundle synthesis
    fn detect_registrations(
        &self,
        bundle: &mut Bundle,
        facades: &mut FacadeTable,
    ) -> Result<Vec<crate::bundle::RelatedBundle>> {
        // A fresh detection replaces anything synthesized earlier
        for stale in bundle.related_packages().map(|p| p.id.clone()).collect::<Vec<_>>() {
            facades.remove(&stale);
        }
        bundle.packages.retain(|p| p.related.is_none());

        let Some(store) = self.registrations else {
            bundle.installed = false;
            return Ok(Vec::new());
        };

        let corrupt = |e: Error| Error::DetectionFailure {
            package: bundle.name.clone(),
            reason: format!("cannot read bundle registrations: {}", e),
            fatal: true,
        };
        let installed_bundles = store.installed_bundles().map_err(corrupt)?;
        let installed = store.is_registered(bundle).map_err(corrupt)?;
        bundle.installed = installed;

        let mut related = Vec::new();
        for installed in &installed_bundles {
            let Some(rel) = classify(bundle, installed) else {
                continue;
            };
            if bundle.package(&rel.bundle_id).is_some() {
                warn!(
                    "Related bundle {} collides with a package id; ignoring it",
                    rel.bundle_id
                );
                continue;
            }
            info!("Found related bundle {} v{} ({})", rel.bundle_id, rel.version, rel.relation);
            self.callbacks.on_detect_related_bundle(&rel);

            let package = Package::from_related(rel.clone());
            facades.insert(&package)?;
            bundle.packages.push(package);
            related.push(rel);
        }
        Ok(related)
    }

    fn detect_packages(
        &self,
        bundle: &mut Bundle,
        facades: &FacadeTable,
        variables: &VariableStore,
    ) -> Result<Vec<PackageDetection>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| Error::ConfigError(format!("cannot start detection pool: {e}")))?;

        let packages = &bundle.packages;
        let outcomes: Vec<(usize, Result<DetectedState>, bool)> = pool.install(|| {
            packages
                .par_iter()
                .enumerate()
                .filter(|(_, p)| p.related.is_none())
                .map(|(index, package)| {
                    let detected = self.detect_package(package, facades, variables);
                    let cached = self.is_cached(package, facades);
                    (index, detected, cached)
                })
                .collect()
        });

        let mut report = Vec::with_capacity(outcomes.len());
        let mut fatal = None;
        let mut cancelled = false;

        for (index, detected, cached) in outcomes {
            let package = &mut bundle.packages[index];
            package.cached = cached;

            let entry = match detected {
                Ok(found) => {
                    debug!("{} is {}", package.id, found.state);
                    package.current_state = Some(found.state);
                    package.feature_states = found.features;
                    PackageDetection {
                        package_id: package.id.clone(),
                        state: Some(found.state),
                        cached,
                        status: STATUS_SUCCESS,
                        error: None,
                    }
                }
                Err(e) => {
                    package.current_state = None;
                    let entry = PackageDetection {
                        package_id: package.id.clone(),
                        state: None,
                        cached,
                        status: e.code(),
                        error: Some(e.to_string()),
                    };
                    match e {
                        Error::Cancelled(_) => cancelled = true,
                        Error::DetectionFailure { fatal: true, .. } | Error::UnknownPackageType { .. } => {
                            warn!("Fatal detection failure: {}", e);
                            fatal.get_or_insert(e);
                        }
                        e => warn!("{}", e),
                    }
                    entry
                }
            };

            self.callbacks
                .on_detect_package_complete(&entry.package_id, entry.status, entry.state);
            report.push(entry);
        }

        if let Some(e) = fatal {
            return Err(e);
        }
        if cancelled || self.cancel.is_cancelled() {
            return Err(Error::Cancelled("detect".to_string()));
        }
        Ok(report)
    }

    /// Runs on a pool worker; reads only
    fn detect_package(
        &self,
        package: &Package,
        facades: &FacadeTable,
        variables: &VariableStore,
    ) -> Result<DetectedState> {
        self.cancel.check("detect")?;
        let facade = facades.require(package)?;

        if let Some(condition) = facade.detect_condition() {
            let present = variables
                .evaluate(condition)
                .map_err(|e| Error::DetectionFailure {
                    package: package.id.clone(),
                    reason: e.to_string(),
                    fatal: false,
                })?;
            let state = if present {
                PackageState::Present
            } else {
                PackageState::Absent
            };
            return Ok(DetectedState::new(state));
        }

        let backend = self.backends.require(package)?;
        let request = DetectRequest {
            package,
            facade,
            variables,
        };
        backend.detect(&request).map_err(|e| match e {
            e @ (Error::DetectionFailure { .. } | Error::Cancelled(_)) => e,
            other => Error::DetectionFailure {
                package: package.id.clone(),
                reason: other.to_string(),
                fatal: false,
            },
        })
    }

    /// Whether every install payload already sits in the package cache
    fn is_cached(&self, package: &Package, facades: &FacadeTable) -> bool {
        let Some(facade) = facades.get(&package.id) else {
            return false;
        };
        let dir = self.cache_root.join(package.cache_id());
        facade
            .required_payloads(package, Action::Install)
            .iter()
            .all(|p| dir.join(&p.file_name).is_file())
    }

    fn detect_update(&self, bundle: &Bundle) -> (Option<UpdateCandidate>, Option<String>) {
        let (Some(source), Some(location)) = (self.updates, bundle.update_feed.as_deref()) else {
            debug!("No update source configured");
            return (None, None);
        };

        let candidates = match source.candidates(location) {
            Ok(c) => c,
            Err(e) => {
                warn!("Update check failed: {}", e);
                return (None, Some(e.to_string()));
            }
        };

        for candidate in &candidates {
            self.callbacks.on_detect_update(candidate);
        }

        match select_update(&bundle.version, &candidates) {
            Some(chosen) => {
                info!("Update available: v{} at {}", chosen.version, chosen.location);
                (Some(chosen.clone()), None)
            }
            None => {
                info!("No update available");
                (None, None)
            }
        }
    }
}
