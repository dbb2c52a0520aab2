// src/bundle/mod.rs

//! Bundle and package model
//!
//! A [`Bundle`] owns its packages exclusively. Each package names its
//! technology through `type`; the technology-specific behaviour lives in a
//! [`Facade`] held in a [`FacadeTable`] keyed by package id, so the engine's
//! core loop never touches type-specific fields.
//!
//! Manifest encoding is the loader's business. The model derives serde so a
//! loader can hand it over in any format; [`Bundle::load`] reads TOML for the
//! command-line front end.

mod facade;

pub use facade::{
    create_facade, ExeFields, ExitBehavior, ExitCodeRule, Facade, FacadeTable, FeatureState,
    MsiFeature, MsiFields, MspFields, MsuFields,
};

use crate::error::{Error, Result};
use crate::hash::PayloadHash;
use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use strum_macros::{Display, EnumString};

/// Installer technology of a package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum PackageType {
    Exe,
    Msi,
    Msp,
    Msu,
    RelatedBundle,
}

/// Detected state of a package on the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum PackageState {
    Absent,
    Present,
    /// Installed, but superseded by a newer version already on the machine
    Obsolete,
}

/// State the planner is asked to reach for a package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum RequestState {
    /// Leave the package as it is
    None,
    Absent,
    Present,
    Repair,
}

/// Per-package action in a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Action {
    None,
    Install,
    Uninstall,
    Repair,
    Modify,
}

impl Action {
    /// Whether this action moves toward installation (ordered forward)
    pub fn is_install_direction(&self) -> bool {
        matches!(self, Self::Install | Self::Repair | Self::Modify)
    }
}

/// Bundle-level action requested by the user or policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum BundleAction {
    Install,
    Uninstall,
    Repair,
    Modify,
}

impl BundleAction {
    /// Default package request for this bundle action
    pub fn default_request(&self) -> RequestState {
        match self {
            Self::Install | Self::Modify => RequestState::Present,
            Self::Uninstall => RequestState::Absent,
            Self::Repair => RequestState::Repair,
        }
    }
}

/// Relationship between this bundle and another installed bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum RelationType {
    /// Older version of this bundle, removed after install
    Upgrade,
    /// Newer version of this bundle already installed
    Downgrade,
    Addon,
    Patch,
}

/// Another installed bundle, discovered by detection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedBundle {
    pub bundle_id: String,
    pub version: Version,
    pub relation: RelationType,
    #[serde(default)]
    pub per_machine: bool,
}

/// A file a package needs on disk before it can execute
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    pub id: String,
    /// Path relative to the bundle layout directory and the cache entry
    pub file_name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub hash: Option<PayloadHash>,
    #[serde(default)]
    pub download_url: Option<String>,
}

/// Variable declared by the bundle and seeded at session start
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDecl {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: crate::variables::Namespace,
    pub value: String,
}

fn default_namespace() -> crate::variables::Namespace {
    crate::variables::Namespace::String
}

/// An installable unit of one technology
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    pub id: String,

    /// Technology tag; resolved to a facade before any phase runs
    #[serde(rename = "type")]
    pub kind: String,

    /// Packages that must be installed before this one
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Contiguous packages sharing a boundary id roll back together
    #[serde(default)]
    pub rollback_boundary: Option<String>,

    /// Overrides the bundle's scope when set
    #[serde(default)]
    pub per_machine: Option<bool>,

    /// Never removed by a bundle uninstall
    #[serde(default)]
    pub permanent: bool,

    #[serde(default)]
    pub install_condition: Option<String>,

    /// Cache directory name; defaults to the package id
    #[serde(default)]
    pub cache_id: Option<String>,

    /// Relative execution cost; falls back to total payload size
    #[serde(default)]
    pub install_size: Option<u64>,

    #[serde(default)]
    pub payloads: Vec<Payload>,

    #[serde(default)]
    pub exe: Option<ExeFields>,
    #[serde(default)]
    pub msi: Option<MsiFields>,
    #[serde(default)]
    pub msp: Option<MspFields>,
    #[serde(default)]
    pub msu: Option<MsuFields>,

    /// Set only on packages synthesized from related bundles
    #[serde(skip)]
    pub related: Option<RelatedBundle>,

    /// Meaningful only after detection
    #[serde(skip)]
    pub current_state: Option<PackageState>,

    /// Whether every payload was found in the package cache during detection
    #[serde(skip)]
    pub cached: bool,

    /// Detected MSI feature states
    #[serde(skip)]
    pub feature_states: BTreeMap<String, FeatureState>,

    /// Meaningful only after planning
    #[serde(skip)]
    pub requested_state: Option<RequestState>,
}

impl Package {
    /// Create a package with no type-specific section
    pub fn new(id: impl Into<String>, kind: PackageType) -> Self {
        Self {
            id: id.into(),
            kind: kind.to_string(),
            depends_on: Vec::new(),
            rollback_boundary: None,
            per_machine: None,
            permanent: false,
            install_condition: None,
            cache_id: None,
            install_size: None,
            payloads: Vec::new(),
            exe: None,
            msi: None,
            msp: None,
            msu: None,
            related: None,
            current_state: None,
            cached: false,
            feature_states: BTreeMap::new(),
            requested_state: None,
        }
    }

    /// Synthesize a package standing in for another installed bundle
    pub fn from_related(related: RelatedBundle) -> Self {
        let mut package = Self::new(related.bundle_id.clone(), PackageType::RelatedBundle);
        package.per_machine = Some(related.per_machine);
        package.current_state = Some(PackageState::Present);
        package.related = Some(related);
        package
    }

    /// Parse the technology tag
    pub fn package_type(&self) -> Result<PackageType> {
        self.kind
            .parse::<PackageType>()
            .map_err(|_| Error::UnknownPackageType {
                package: self.id.clone(),
                package_type: self.kind.clone(),
            })
    }

    pub fn cache_id(&self) -> &str {
        self.cache_id.as_deref().unwrap_or(&self.id)
    }

    /// Execution weight used for overall progress
    pub fn weight(&self) -> u64 {
        self.install_size
            .unwrap_or_else(|| self.payloads.iter().map(|p| p.size).sum())
            .max(1)
    }
}

/// Root entity: the unit of detect, plan, and apply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    pub name: String,
    pub version: Version,

    /// Stable identity shared by every version of this bundle
    #[serde(default)]
    pub upgrade_code: Option<String>,

    #[serde(default)]
    pub per_machine: bool,

    /// Variable that receives the log file path, if any
    #[serde(default)]
    pub log_variable: Option<String>,

    /// Location handed to the update source when checking for updates
    #[serde(default)]
    pub update_feed: Option<String>,

    /// Directory holding payloads shipped alongside the bundle
    #[serde(default)]
    pub layout_dir: Option<PathBuf>,

    #[serde(default)]
    pub variables: Vec<VariableDecl>,

    #[serde(default, rename = "package")]
    pub packages: Vec<Package>,

    /// Whether this bundle is registered as installed; set by detection
    #[serde(skip)]
    pub installed: bool,

    /// Set by planning
    #[serde(skip)]
    pub requested_action: Option<BundleAction>,
}

impl Bundle {
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
            upgrade_code: None,
            per_machine: false,
            log_variable: None,
            update_feed: None,
            layout_dir: None,
            variables: Vec::new(),
            packages: Vec::new(),
            installed: false,
            requested_action: None,
        }
    }

    /// Load a TOML bundle description
    ///
    /// A relative `layout_dir` resolves against the file's directory; when
    /// absent, the file's directory is the layout.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut bundle: Bundle = toml::from_str(&content)?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        bundle.layout_dir = Some(match bundle.layout_dir.take() {
            Some(dir) if dir.is_relative() => base.join(dir),
            Some(dir) => dir,
            None => base.to_path_buf(),
        });

        bundle.validate()?;
        Ok(bundle)
    }

    /// Structural checks: unique ids and known dependencies
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for package in &self.packages {
            if !seen.insert(package.id.as_str()) {
                return Err(Error::ConfigError(format!(
                    "duplicate package id '{}'",
                    package.id
                )));
            }
        }

        for package in &self.packages {
            for dep in &package.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(Error::UnknownDependency {
                        package: package.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn package(&self, id: &str) -> Option<&Package> {
        self.packages.iter().find(|p| p.id == id)
    }

    pub fn package_mut(&mut self, id: &str) -> Option<&mut Package> {
        self.packages.iter_mut().find(|p| p.id == id)
    }

    /// Effective scope of a package
    pub fn is_per_machine(&self, package: &Package) -> bool {
        package.per_machine.unwrap_or(self.per_machine)
    }

    /// Packages declared by the manifest, excluding synthesized related bundles
    pub fn declared_packages(&self) -> impl Iterator<Item = &Package> {
        self.packages.iter().filter(|p| p.related.is_none())
    }

    /// Packages synthesized from related bundles
    pub fn related_packages(&self) -> impl Iterator<Item = &Package> {
        self.packages.iter().filter(|p| p.related.is_some())
    }
}
