// src/backend/mod.rs

//! Technology backends
//!
//! A backend carries out detect, execute, and rollback for one package type.
//! Backends are registered per [`PackageType`] in a [`BackendRegistry`]; the
//! engine never assumes success and checks every returned `Result`.

mod command;

pub use command::CommandBackend;

use crate::bundle::{Action, Facade, FeatureState, Package, PackageState, PackageType};
use crate::error::{Error, Result};
use crate::progress::ProgressSink;
use crate::variables::VariableStore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use strum_macros::Display;

/// Restart requirement reported by an action; the strongest one wins
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum RestartState {
    #[default]
    None,
    Required,
    Initiated,
}

/// What a backend found on the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedState {
    pub state: PackageState,
    /// MSI feature states; empty for other technologies
    pub features: BTreeMap<String, FeatureState>,
}

impl DetectedState {
    pub fn new(state: PackageState) -> Self {
        Self {
            state,
            features: BTreeMap::new(),
        }
    }
}

/// Input to backend detection
pub struct DetectRequest<'a> {
    pub package: &'a Package,
    pub facade: &'a Facade,
    pub variables: &'a VariableStore,
}

/// Input to execute and rollback
pub struct ExecuteRequest<'a> {
    pub package: &'a Package,
    pub facade: &'a Facade,
    pub action: Action,
    pub per_machine: bool,
    /// Directory holding this package's verified payloads
    pub cache_dir: &'a Path,
    pub variables: &'a VariableStore,
    /// Requested MSI feature states for Modify
    pub features: &'a BTreeMap<String, FeatureState>,
}

/// Result of a completed execute call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteOutcome {
    Success { restart: RestartState },
    /// Recoverable: target files are locked by other processes
    FilesInUse { files: Vec<String> },
}

/// Install mechanics for one technology
pub trait PackageBackend: Send + Sync {
    /// Query the package's installed state
    fn detect(&self, request: &DetectRequest<'_>) -> Result<DetectedState>;

    /// Carry out `request.action`
    ///
    /// Unrecoverable failures are `Err(Error::ExecuteFailure { .. })`.
    fn execute(&self, request: &ExecuteRequest<'_>, progress: &dyn ProgressSink)
    -> Result<ExecuteOutcome>;

    /// Compensate a previously completed `request.action`
    fn rollback(&self, request: &ExecuteRequest<'_>, progress: &dyn ProgressSink) -> Result<()>;
}

/// Backends keyed by package type
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<PackageType, Arc<dyn PackageBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, package_type: PackageType, backend: Arc<dyn PackageBackend>) {
        self.backends.insert(package_type, backend);
    }

    /// Builder-style registration
    pub fn with(mut self, package_type: PackageType, backend: Arc<dyn PackageBackend>) -> Self {
        self.register(package_type, backend);
        self
    }

    pub fn get(&self, package_type: PackageType) -> Option<&Arc<dyn PackageBackend>> {
        self.backends.get(&package_type)
    }

    /// Backend for a package, or `UnknownPackageType` if none is registered
    pub fn require(&self, package: &Package) -> Result<&Arc<dyn PackageBackend>> {
        self.get(package.package_type()?)
            .ok_or_else(|| Error::UnknownPackageType {
                package: package.id.clone(),
                package_type: package.kind.clone(),
            })
    }

    pub fn supports(&self, package_type: PackageType) -> bool {
        self.backends.contains_key(&package_type)
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<String> = self.backends.keys().map(|t| t.to_string()).collect();
        types.sort();
        f.debug_struct("BackendRegistry").field("types", &types).finish()
    }
}
