// src/bundle/facade.rs

//! Technology facades
//!
//! A closed sum type over the supported technologies. Facades carry the
//! static, type-specific description of a package; the actual install
//! mechanics belong to the backend registered for the package type.

use super::{Action, Bundle, Package, PackageType, Payload, RelatedBundle};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use strum_macros::Display;

/// How an executable's exit code is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ExitBehavior {
    Success,
    Error,
    RestartRequired,
    FilesInUse,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitCodeRule {
    pub code: i32,
    pub behavior: ExitBehavior,
}

/// Executable package
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExeFields {
    /// Formatted against the variable store before execution
    #[serde(default)]
    pub install_arguments: String,
    #[serde(default)]
    pub uninstall_arguments: Option<String>,
    #[serde(default)]
    pub repair_arguments: Option<String>,
    /// Evaluated during detection; Present when true
    #[serde(default)]
    pub detect_condition: Option<String>,
    #[serde(default)]
    pub exit_codes: Vec<ExitCodeRule>,
}

impl ExeFields {
    /// Interpret a process exit code
    ///
    /// Explicit rules win; otherwise 0 is success, 3010 asks for a restart,
    /// and anything else is an error.
    pub fn exit_behavior(&self, code: i32) -> ExitBehavior {
        if let Some(rule) = self.exit_codes.iter().find(|r| r.code == code) {
            return rule.behavior;
        }
        match code {
            0 => ExitBehavior::Success,
            3010 => ExitBehavior::RestartRequired,
            _ => ExitBehavior::Error,
        }
    }

    /// Argument template for an action
    pub fn arguments_for(&self, action: Action) -> Option<&str> {
        match action {
            Action::Install => Some(&self.install_arguments),
            Action::Uninstall => self.uninstall_arguments.as_deref(),
            Action::Repair => self.repair_arguments.as_deref(),
            Action::Modify | Action::None => None,
        }
    }
}

/// Installed state of an MSI feature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum FeatureState {
    Absent,
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsiFeature {
    pub id: String,
    /// State requested when the policy layer does not choose
    #[serde(default = "default_feature_state")]
    pub default_state: FeatureState,
}

fn default_feature_state() -> FeatureState {
    FeatureState::Local
}

/// Database-driven installer package
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MsiFields {
    pub product_code: String,
    #[serde(default)]
    pub features: Vec<MsiFeature>,
    /// Property templates passed on the installer command line
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Patch package
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MspFields {
    pub patch_code: String,
    #[serde(default)]
    pub target_product_codes: Vec<String>,
}

/// OS update package
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MsuFields {
    pub kb: String,
    #[serde(default)]
    pub detect_condition: Option<String>,
}

/// Type-specific behaviour description bound to one package
#[derive(Debug, Clone)]
pub enum Facade {
    Exe(ExeFields),
    Msi(MsiFields),
    Msp(MspFields),
    Msu(MsuFields),
    RelatedBundle(RelatedBundle),
}

impl Facade {
    pub fn package_type(&self) -> PackageType {
        match self {
            Self::Exe(_) => PackageType::Exe,
            Self::Msi(_) => PackageType::Msi,
            Self::Msp(_) => PackageType::Msp,
            Self::Msu(_) => PackageType::Msu,
            Self::RelatedBundle(_) => PackageType::RelatedBundle,
        }
    }

    /// Whether the technology can carry out `action`
    pub fn supports(&self, action: Action) -> bool {
        match (self, action) {
            (_, Action::None) => true,
            (Self::Exe(exe), action) => exe.arguments_for(action).is_some(),
            (Self::Msi(_), _) => true,
            (Self::Msp(_), Action::Modify) => false,
            (Self::Msp(_), _) => true,
            (Self::Msu(_), Action::Install | Action::Uninstall) => true,
            (Self::Msu(_), _) => false,
            (Self::RelatedBundle(_), Action::Uninstall | Action::Repair) => true,
            (Self::RelatedBundle(_), _) => false,
        }
    }

    /// Payloads that must be cached before `action` can run
    ///
    /// Executables run their own payload to uninstall; other removals and
    /// related-bundle actions work from what is already on the machine.
    pub fn required_payloads<'a>(&self, package: &'a Package, action: Action) -> &'a [Payload] {
        match (self, action) {
            (Self::RelatedBundle(_), _) => &[],
            (_, Action::Install | Action::Repair | Action::Modify) => &package.payloads,
            (Self::Exe(_), Action::Uninstall) => &package.payloads,
            (_, Action::Uninstall | Action::None) => &[],
        }
    }

    /// Condition that replaces backend detection, if any
    pub fn detect_condition(&self) -> Option<&str> {
        match self {
            Self::Exe(exe) => exe.detect_condition.as_deref(),
            Self::Msu(msu) => msu.detect_condition.as_deref(),
            _ => None,
        }
    }

    /// MSI features, empty for every other technology
    pub fn features(&self) -> &[MsiFeature] {
        match self {
            Self::Msi(msi) => &msi.features,
            _ => &[],
        }
    }
}

/// Build the facade for a package, dispatching purely on its type tag
pub fn create_facade(package: &Package) -> Result<Facade> {
    let missing = |section: &str| {
        Error::ConfigError(format!(
            "package '{}' of type {} has no [{}] section",
            package.id, package.kind, section
        ))
    };

    Ok(match package.package_type()? {
        PackageType::Exe => Facade::Exe(package.exe.clone().unwrap_or_default()),
        PackageType::Msi => Facade::Msi(package.msi.clone().ok_or_else(|| missing("msi"))?),
        PackageType::Msp => Facade::Msp(package.msp.clone().ok_or_else(|| missing("msp"))?),
        PackageType::Msu => Facade::Msu(package.msu.clone().ok_or_else(|| missing("msu"))?),
        PackageType::RelatedBundle => Facade::RelatedBundle(
            package
                .related
                .clone()
                .ok_or_else(|| missing("related bundle"))?,
        ),
    })
}

/// Facades keyed by package id
#[derive(Debug, Clone, Default)]
pub struct FacadeTable {
    facades: HashMap<String, Facade>,
}

impl FacadeTable {
    /// Create facades for every package in the bundle
    pub fn build(bundle: &Bundle) -> Result<Self> {
        let mut facades = HashMap::with_capacity(bundle.packages.len());
        for package in &bundle.packages {
            facades.insert(package.id.clone(), create_facade(package)?);
        }
        Ok(Self { facades })
    }

    pub fn get(&self, id: &str) -> Option<&Facade> {
        self.facades.get(id)
    }

    /// Look up a facade, failing with `UnknownPackageType` when absent
    pub fn require(&self, package: &Package) -> Result<&Facade> {
        self.facades
            .get(&package.id)
            .ok_or_else(|| Error::UnknownPackageType {
                package: package.id.clone(),
                package_type: package.kind.clone(),
            })
    }

    /// Register the facade for a package synthesized after the table was built
    pub fn insert(&mut self, package: &Package) -> Result<()> {
        let facade = create_facade(package)?;
        self.facades.insert(package.id.clone(), facade);
        Ok(())
    }

    pub fn remove(&mut self, id: &str) {
        self.facades.remove(id);
    }

    pub fn len(&self) -> usize {
        self.facades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facades.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::RelationType;
    use crate::version::Version;

    fn exe(install: &str, uninstall: Option<&str>) -> ExeFields {
        ExeFields {
            install_arguments: install.into(),
            uninstall_arguments: uninstall.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn test_exit_code_defaults_and_rules() {
        let mut fields = exe("/i", None);
        assert_eq!(fields.exit_behavior(0), ExitBehavior::Success);
        assert_eq!(fields.exit_behavior(3010), ExitBehavior::RestartRequired);
        assert_eq!(fields.exit_behavior(1), ExitBehavior::Error);

        fields.exit_codes.push(ExitCodeRule {
            code: 5,
            behavior: ExitBehavior::FilesInUse,
        });
        fields.exit_codes.push(ExitCodeRule {
            code: 1,
            behavior: ExitBehavior::Success,
        });
        assert_eq!(fields.exit_behavior(5), ExitBehavior::FilesInUse);
        assert_eq!(fields.exit_behavior(1), ExitBehavior::Success);
    }

    #[test]
    fn test_supported_actions() {
        let installer_only = Facade::Exe(exe("/i", None));
        assert!(installer_only.supports(Action::Install));
        assert!(!installer_only.supports(Action::Uninstall));
        assert!(!installer_only.supports(Action::Modify));

        let msi = Facade::Msi(MsiFields::default());
        assert!(msi.supports(Action::Modify));

        let msu = Facade::Msu(MsuFields::default());
        assert!(!msu.supports(Action::Repair));
        assert!(msu.supports(Action::Uninstall));
    }

    #[test]
    fn test_create_facade_dispatch() {
        let mut package = Package::new("p", PackageType::Msi);
        assert!(matches!(create_facade(&package), Err(Error::ConfigError(_))));

        package.msi = Some(MsiFields {
            product_code: "{P}".into(),
            ..Default::default()
        });
        assert_eq!(create_facade(&package).unwrap().package_type(), PackageType::Msi);

        package.kind = "unknown".into();
        assert!(matches!(
            create_facade(&package),
            Err(Error::UnknownPackageType { .. })
        ));
    }

    #[test]
    fn test_related_bundle_needs_no_payloads() {
        let related = RelatedBundle {
            bundle_id: "old".into(),
            version: Version::parse("1.0").unwrap(),
            relation: RelationType::Upgrade,
            per_machine: false,
        };
        let mut package = Package::from_related(related);
        package.payloads.push(Payload {
            id: "x".into(),
            file_name: "x".into(),
            size: 1,
            hash: None,
            download_url: None,
        });
        let facade = create_facade(&package).unwrap();
        assert!(facade.required_payloads(&package, Action::Uninstall).is_empty());
        assert!(facade.supports(Action::Uninstall));
        assert!(!facade.supports(Action::Install));
    }

    #[test]
    fn test_table_require() {
        let mut bundle = Bundle::new("b", Version::new(vec![1]));
        bundle.packages.push(Package::new("a", PackageType::Exe));
        let table = FacadeTable::build(&bundle).unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.require(&bundle.packages[0]).is_ok());

        let stranger = Package::new("b", PackageType::Exe);
        assert!(matches!(
            table.require(&stranger),
            Err(Error::UnknownPackageType { .. })
        ));
    }
}
