// src/detect/registration.rs

//! Installed-bundle registrations
//!
//! The durable record of installed bundles belongs to the machine, not to
//! the engine. A [`RegistrationStore`] lists what is registered; detection
//! classifies each entry against the running bundle.

use crate::bundle::{Bundle, RelatedBundle, RelationType};
use crate::error::Result;
use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A bundle registered on the machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledBundle {
    pub bundle_id: String,
    pub version: Version,
    #[serde(default)]
    pub upgrade_code: Option<String>,
    /// Upgrade codes of bundles this one extends
    #[serde(default)]
    pub addon_of: Vec<String>,
    /// Upgrade codes of bundles this one patches
    #[serde(default)]
    pub patch_of: Vec<String>,
    #[serde(default)]
    pub per_machine: bool,
}

/// Source of installed-bundle registrations
pub trait RegistrationStore: Send + Sync {
    fn installed_bundles(&self) -> Result<Vec<InstalledBundle>>;

    /// Whether this exact bundle (upgrade code and version) is registered
    fn is_registered(&self, bundle: &Bundle) -> Result<bool> {
        let Some(code) = bundle.upgrade_code.as_deref() else {
            return Ok(false);
        };
        Ok(self.installed_bundles()?.iter().any(|installed| {
            installed.upgrade_code.as_deref() == Some(code) && installed.version == bundle.version
        }))
    }
}

/// Registrations held in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryRegistrations {
    bundles: Vec<InstalledBundle>,
}

impl InMemoryRegistrations {
    pub fn new(bundles: Vec<InstalledBundle>) -> Self {
        Self { bundles }
    }
}

impl RegistrationStore for InMemoryRegistrations {
    fn installed_bundles(&self) -> Result<Vec<InstalledBundle>> {
        Ok(self.bundles.clone())
    }
}

/// How an installed bundle relates to the running one, if at all
///
/// Same upgrade code: older is an upgrade target, newer a downgrade, equal
/// is this bundle itself. Otherwise an installed addon or patch that names
/// our upgrade code is related.
pub fn classify(bundle: &Bundle, installed: &InstalledBundle) -> Option<RelatedBundle> {
    let code = bundle.upgrade_code.as_deref()?;

    let relation = if installed.upgrade_code.as_deref() == Some(code) {
        match installed.version.cmp(&bundle.version) {
            Ordering::Less => RelationType::Upgrade,
            Ordering::Greater => RelationType::Downgrade,
            Ordering::Equal => return None,
        }
    } else if installed.addon_of.iter().any(|c| c == code) {
        RelationType::Addon
    } else if installed.patch_of.iter().any(|c| c == code) {
        RelationType::Patch
    } else {
        return None;
    };

    Some(RelatedBundle {
        bundle_id: installed.bundle_id.clone(),
        version: installed.version.clone(),
        relation,
        per_machine: installed.per_machine,
    })
}
