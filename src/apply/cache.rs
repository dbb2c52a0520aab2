// src/apply/cache.rs

//! Cache stage
//!
//! Each executable entry's required payloads are acquired into
//! `<cache_root>/<cache_id>/`. Packages are spread over a bounded rayon pool;
//! payloads within a package are acquired in order. Each payload walks the
//! source chain up to `attempts` times; a file that fails hash verification
//! is deleted and the next source is tried.
//!
//! Cancellation is observed before a package starts and between payloads.
//! A transfer already under way always runs to completion.

use super::sources::{AcquireRequest, PayloadSource};
use super::status_of;
use crate::bundle::{Bundle, FacadeTable, Package, Payload};
use crate::callbacks::{CacheDecision, Control, EngineCallbacks};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::hash::verify_file;
use crate::plan::Plan;
use crate::progress::WeightedProgress;
use rayon::prelude::*;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub(super) struct CacheStage<'a> {
    pub callbacks: &'a dyn EngineCallbacks,
    pub sources: &'a [Arc<dyn PayloadSource>],
    pub cache_root: &'a Path,
    pub workers: usize,
    pub attempts: u32,
    pub cancel: &'a CancelToken,
}

#[derive(Debug, Default)]
pub(super) struct CacheReport {
    pub cached: Vec<String>,
    /// Skipped by policy; these are not executed either
    pub skipped: Vec<String>,
    pub failures: Vec<(String, Error)>,
    pub cancelled: bool,
}

enum PackageOutcome {
    Cached,
    Skipped,
    NotStarted,
    Failed(Error),
}

struct Work<'p> {
    package: &'p Package,
    payloads: &'p [Payload],
}

impl CacheStage<'_> {
    pub fn run(&self, bundle: &Bundle, facades: &FacadeTable, plan: &Plan) -> Result<CacheReport> {
        let mut work = Vec::new();
        for entry in plan.executable() {
            let package = bundle.package(&entry.package_id).ok_or_else(|| {
                Error::ConfigError(format!("planned package '{}' is not in the bundle", entry.package_id))
            })?;
            let payloads = facades.require(package)?.required_payloads(package, entry.action);
            if !payloads.is_empty() {
                work.push(Work { package, payloads });
            }
        }

        let result = self.acquire_all(bundle, &work);
        let status = match &result {
            Ok(report) if report.cancelled => Error::Cancelled("cache".to_string()).code(),
            Ok(report) => report
                .failures
                .first()
                .map(|(_, e)| e.code())
                .unwrap_or_default(),
            Err(e) => e.code(),
        };
        self.callbacks.on_cache_complete(status);
        result
    }

    fn acquire_all(&self, bundle: &Bundle, work: &[Work<'_>]) -> Result<CacheReport> {
        if self.callbacks.on_cache_begin(work.len()) == Control::Cancel {
            self.cancel.cancel();
            return Err(Error::Cancelled("cache".to_string()));
        }
        if work.is_empty() {
            return Ok(CacheReport::default());
        }

        let total: u64 = work
            .iter()
            .flat_map(|w| w.payloads)
            .map(|p| p.size.max(1))
            .sum();
        let weights = WeightedProgress::new(total);
        let layout_dir = bundle.layout_dir.as_deref();

        info!(
            "Caching {} packages with {} workers",
            work.len(),
            self.workers.min(work.len())
        );
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
            .map_err(|e| Error::ConfigError(format!("cannot start cache pool: {e}")))?;

        let outcomes: Vec<(String, PackageOutcome)> = pool.install(|| {
            work.par_iter()
                .map(|w| {
                    let outcome = self.cache_package(w, layout_dir, &weights);
                    (w.package.id.clone(), outcome)
                })
                .collect()
        });

        let mut report = CacheReport::default();
        for (id, outcome) in outcomes {
            match outcome {
                PackageOutcome::Cached => report.cached.push(id),
                PackageOutcome::Skipped => report.skipped.push(id),
                PackageOutcome::NotStarted => report.cancelled = true,
                PackageOutcome::Failed(e) if e.is_cancelled() => report.cancelled = true,
                PackageOutcome::Failed(e) => report.failures.push((id, e)),
            }
        }
        if self.cancel.is_cancelled() {
            report.cancelled = true;
        }
        Ok(report)
    }

    /// Runs on a pool worker
    fn cache_package(
        &self,
        work: &Work<'_>,
        layout_dir: Option<&Path>,
        weights: &WeightedProgress,
    ) -> PackageOutcome {
        let package = work.package;
        if self.cancel.is_cancelled() {
            debug!("Not starting {}: cancelled", package.id);
            return PackageOutcome::NotStarted;
        }

        let total_size = work.payloads.iter().map(|p| p.size).sum();
        let decision = self
            .callbacks
            .on_cache_package_begin(&package.id, work.payloads.len(), total_size);
        if decision.skip {
            info!("Policy skipped caching {}", package.id);
            return PackageOutcome::Skipped;
        }

        let dir = self.cache_root.join(package.cache_id());
        let mut retries = 0;
        loop {
            let result = self.acquire_payloads(package, work.payloads, &dir, layout_dir, weights);
            let decision = self
                .callbacks
                .on_cache_package_complete(&package.id, status_of(&result), retries);

            match result {
                Ok(()) => return PackageOutcome::Cached,
                Err(e) if e.is_cancelled() => return PackageOutcome::Failed(e),
                Err(e) => {
                    let may_retry = retries + 1 < self.attempts && !self.cancel.is_cancelled();
                    if decision == CacheDecision::Retry && may_retry {
                        retries += 1;
                        info!("Retrying cache of {} (retry {})", package.id, retries);
                        continue;
                    }
                    warn!("Caching {} failed: {}", package.id, e);
                    return PackageOutcome::Failed(e);
                }
            }
        }
    }

    fn acquire_payloads(
        &self,
        package: &Package,
        payloads: &[Payload],
        dir: &Path,
        layout_dir: Option<&Path>,
        weights: &WeightedProgress,
    ) -> Result<()> {
        for payload in payloads {
            self.cancel.check("cache")?;
            self.acquire_payload(package, payload, dir, layout_dir, weights)?;
        }
        Ok(())
    }

    fn acquire_payload(
        &self,
        package: &Package,
        payload: &Payload,
        dir: &Path,
        layout_dir: Option<&Path>,
        weights: &WeightedProgress,
    ) -> Result<()> {
        let destination = dir.join(&payload.file_name);
        let weight = payload.size.max(1);
        let progress = |bytes: u64, total: u64| {
            let percent = if total == 0 {
                100
            } else {
                (bytes.min(total) * 100 / total) as u8
            };
            let overall = weights.overall(weight, percent);
            let control = self.callbacks.on_cache_acquire_progress(
                &package.id,
                &payload.id,
                bytes,
                total,
                overall,
            );
            if control == Control::Cancel {
                self.cancel.cancel();
            }
        };

        let mut last_error = None;
        for pass in 1..=self.attempts {
            if pass > 1 {
                self.cancel.check("cache")?;
                debug!("Pass {} over sources for {}", pass, payload.id);
            }

            for source in self.sources {
                let request = AcquireRequest {
                    package_id: &package.id,
                    payload,
                    layout_dir,
                    destination: &destination,
                };
                match source.acquire(&request, &progress) {
                    Ok(false) => continue,
                    Ok(true) => match verify(payload, &destination) {
                        Ok(()) => {
                            debug!("{} acquired from {}", payload.id, source.name());
                            weights.complete(weight);
                            return Ok(());
                        }
                        Err(e) => {
                            warn!("Discarding {} from {}: {}", payload.id, source.name(), e);
                            // The next source must never see a rejected file
                            if let Err(remove) = fs::remove_file(&destination)
                                && remove.kind() != ErrorKind::NotFound
                            {
                                warn!("Cannot remove rejected {}: {}", destination.display(), remove);
                                return Err(Error::CacheAcquisitionFailure {
                                    package: package.id.clone(),
                                    payload: payload.id.clone(),
                                    reason: format!(
                                        "{e}; cannot remove rejected file {}: {remove}",
                                        destination.display()
                                    ),
                                });
                            }
                            last_error = Some(e);
                        }
                    },
                    Err(e) => {
                        warn!("{} source failed for {}: {}", source.name(), payload.id, e);
                        last_error = Some(e);
                    }
                }
            }
        }

        Err(Error::CacheAcquisitionFailure {
            package: package.id.clone(),
            payload: payload.id.clone(),
            reason: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no source has this payload".to_string()),
        })
    }
}

fn verify(payload: &Payload, path: &Path) -> Result<()> {
    match &payload.hash {
        Some(expected) => verify_file(path, expected),
        None => Ok(()),
    }
}
