// src/plan/mod.rs

//! Planning phase
//!
//! Turns a bundle action plus overrides into an ordered [`Plan`]:
//!
//! 1. Each package gets a default requested state from the bundle action,
//!    adjusted for install conditions and permanence, then replaced by an
//!    explicit override or the policy layer's answer.
//! 2. The action is the transition from the detected state to the requested
//!    state. No-op transitions yield `Action::None`; those entries stay in
//!    the plan for reporting but are never cached or executed.
//! 3. Removals come first in reverse dependency order, then installs in
//!    forward dependency order. Addon and patch bundles are removed before
//!    anything else; superseded (upgrade) bundles are removed last.
//! 4. Contiguous executed entries sharing a declared boundary id form one
//!    rollback boundary.
//!
//! Any invalid request fails the whole plan before apply can start.

mod graph;

pub use graph::DependencyGraph;

use crate::backend::BackendRegistry;
use crate::bundle::{
    Action, Bundle, BundleAction, Facade, FacadeTable, FeatureState, Package, PackageState,
    PackageType, RelationType, RequestState,
};
use crate::callbacks::{Control, EngineCallbacks};
use crate::error::{Error, Result, STATUS_SUCCESS};
use crate::variables::{builtin, VariableStore};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

/// Explicit per-package and per-feature states supplied before planning
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanOverrides {
    #[serde(default)]
    pub packages: HashMap<String, RequestState>,
    /// package id -> feature id -> state
    #[serde(default)]
    pub features: HashMap<String, BTreeMap<String, FeatureState>>,
}

impl PlanOverrides {
    pub fn package(mut self, id: impl Into<String>, state: RequestState) -> Self {
        self.packages.insert(id.into(), state);
        self
    }

    pub fn feature(
        mut self,
        package: impl Into<String>,
        feature: impl Into<String>,
        state: FeatureState,
    ) -> Self {
        self.features
            .entry(package.into())
            .or_default()
            .insert(feature.into(), state);
        self
    }
}

/// One package's planned action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub package_id: String,
    pub package_type: PackageType,
    pub action: Action,
    pub requested: RequestState,
    pub current: Option<PackageState>,
    /// Rollback boundary index; grows along the plan
    pub boundary: usize,
    pub boundary_id: Option<String>,
    pub per_machine: bool,
    /// Relative execution cost
    pub weight: u64,
    /// Requested MSI feature states
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub features: BTreeMap<String, FeatureState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<RelationType>,
}

impl PlanEntry {
    pub fn is_executable(&self) -> bool {
        self.action != Action::None
    }
}

/// Ordered per-package actions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub action: BundleAction,
    pub entries: Vec<PlanEntry>,
}

impl Plan {
    /// Entries that will be cached and executed, in plan order
    pub fn executable(&self) -> impl Iterator<Item = &PlanEntry> {
        self.entries.iter().filter(|e| e.is_executable())
    }

    pub fn action_count(&self) -> usize {
        self.executable().count()
    }

    pub fn entry(&self, package_id: &str) -> Option<&PlanEntry> {
        self.entries.iter().find(|e| e.package_id == package_id)
    }

    /// Package ids of executable entries in execution order
    pub fn execution_order(&self) -> Vec<&str> {
        self.executable().map(|e| e.package_id.as_str()).collect()
    }

    pub fn requires_elevation(&self) -> bool {
        self.executable().any(|e| e.per_machine)
    }

    pub fn total_weight(&self) -> u64 {
        self.executable().map(|e| e.weight).sum()
    }
}

/// Where an entry lands in the final ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Segment {
    RelatedRemoval,
    Removal,
    Install,
    RelatedAfter,
}

/// Builds plans
pub struct Planner<'a> {
    backends: &'a BackendRegistry,
    callbacks: &'a dyn EngineCallbacks,
}

impl<'a> Planner<'a> {
    pub fn new(backends: &'a BackendRegistry, callbacks: &'a dyn EngineCallbacks) -> Self {
        Self {
            backends,
            callbacks,
        }
    }

    /// Plan `action` for a detected bundle
    ///
    /// Always emits `on_plan_complete` with the final status.
    pub fn plan(
        &self,
        bundle: &mut Bundle,
        facades: &FacadeTable,
        variables: &VariableStore,
        action: BundleAction,
        overrides: &PlanOverrides,
    ) -> Result<Plan> {
        let result = self.run(bundle, facades, variables, action, overrides);
        let status = match &result {
            Ok(_) => STATUS_SUCCESS,
            Err(e) => e.code(),
        };
        self.callbacks.on_plan_complete(status);
        result
    }

    fn run(
        &self,
        bundle: &mut Bundle,
        facades: &FacadeTable,
        variables: &VariableStore,
        action: BundleAction,
        overrides: &PlanOverrides,
    ) -> Result<Plan> {
        info!("Planning {} of {} v{}", action, bundle.name, bundle.version);

        if self.callbacks.on_plan_begin(action, bundle.packages.len()) == Control::Cancel {
            return Err(Error::Cancelled("plan".to_string()));
        }

        let graph = DependencyGraph::build(bundle.declared_packages())?;
        let install_order = graph.install_order()?;

        let mut planned: Vec<(Segment, PlanEntry)> = Vec::with_capacity(bundle.packages.len());

        for id in &install_order {
            let package = bundle
                .package(id)
                .ok_or_else(|| Error::ConfigError(format!("package '{id}' vanished during planning")))?;
            let entry = self.plan_declared(bundle, package, facades, variables, action, overrides)?;
            let segment = if entry.action == Action::Uninstall
                || (entry.action == Action::None && action == BundleAction::Uninstall)
            {
                Segment::Removal
            } else {
                Segment::Install
            };
            planned.push((segment, entry));
        }

        for package in bundle.related_packages() {
            planned.push(self.plan_related(bundle, package, facades, action, overrides)?);
        }

        let entries = order_entries(planned);
        let entries = assign_boundaries(entries);

        for entry in &entries {
            if let Some(package) = bundle.package_mut(&entry.package_id) {
                package.requested_state = Some(entry.requested);
            }
            self.callbacks.on_plan_package_complete(entry);
        }

        bundle.requested_action = Some(action);
        variables.set_builtin(builtin::BUNDLE_ACTION, action.to_string());

        let plan = Plan { action, entries };
        info!(
            "Planned {} actions ({} entries)",
            plan.action_count(),
            plan.entries.len()
        );
        Ok(plan)
    }

    fn plan_declared(
        &self,
        bundle: &Bundle,
        package: &Package,
        facades: &FacadeTable,
        variables: &VariableStore,
        action: BundleAction,
        overrides: &PlanOverrides,
    ) -> Result<PlanEntry> {
        let facade = facades.require(package)?;

        let mut default = action.default_request();
        if package.permanent && default == RequestState::Absent {
            default = RequestState::None;
        }
        if default != RequestState::Absent
            && let Some(condition) = &package.install_condition
            && !variables.evaluate(condition)?
        {
            debug!("Install condition of {} is false", package.id);
            default = RequestState::Absent;
        }

        let (requested, explicit) = self.resolve_request(package, default, overrides);

        if package.permanent && explicit && requested == RequestState::Absent {
            return Err(Error::InvalidRequestedState {
                package: package.id.clone(),
                reason: "permanent packages cannot be removed".to_string(),
            });
        }

        let current = package.current_state;
        if current.is_none() && requested != RequestState::None {
            warn!("{} was not detected; treating it as absent", package.id);
        }

        let features = self.plan_features(package, facade, requested, overrides);
        let features_changed = features
            .iter()
            .any(|(id, state)| package.feature_states.get(id).is_some_and(|cur| cur != state));

        let mut planned = transition(current.unwrap_or(PackageState::Absent), requested, features_changed);

        if !facade.supports(planned) {
            if explicit {
                return Err(Error::InvalidRequestedState {
                    package: package.id.clone(),
                    reason: format!("{} packages cannot {}", facade.package_type(), planned),
                });
            }
            warn!(
                "{} does not support {}; leaving it unchanged",
                package.id, planned
            );
            planned = Action::None;
        }

        if planned != Action::None {
            self.backends.require(package)?;
        }

        Ok(PlanEntry {
            package_id: package.id.clone(),
            package_type: facade.package_type(),
            action: planned,
            requested,
            current,
            boundary: 0,
            boundary_id: package.rollback_boundary.clone(),
            per_machine: bundle.is_per_machine(package),
            weight: package.weight(),
            features,
            relation: None,
        })
    }

    fn plan_related(
        &self,
        bundle: &Bundle,
        package: &Package,
        facades: &FacadeTable,
        action: BundleAction,
        overrides: &PlanOverrides,
    ) -> Result<(Segment, PlanEntry)> {
        let facade = facades.require(package)?;
        let Facade::RelatedBundle(related) = facade else {
            return Err(Error::UnknownPackageType {
                package: package.id.clone(),
                package_type: package.kind.clone(),
            });
        };

        let (default, segment) = match (related.relation, action) {
            (RelationType::Upgrade, BundleAction::Uninstall) => (RequestState::None, Segment::RelatedAfter),
            (RelationType::Upgrade, _) => (RequestState::Absent, Segment::RelatedAfter),
            (RelationType::Addon | RelationType::Patch, BundleAction::Uninstall) => {
                (RequestState::Absent, Segment::RelatedRemoval)
            }
            (RelationType::Addon | RelationType::Patch, BundleAction::Repair) => {
                (RequestState::Repair, Segment::RelatedAfter)
            }
            (RelationType::Addon | RelationType::Patch, _) => (RequestState::None, Segment::RelatedAfter),
            (RelationType::Downgrade, _) => {
                warn!(
                    "A newer version ({}) of this bundle is installed; leaving it in place",
                    related.version
                );
                (RequestState::None, Segment::RelatedAfter)
            }
        };

        let (requested, explicit) = self.resolve_request(package, default, overrides);
        let current = package.current_state.unwrap_or(PackageState::Present);
        let mut planned = transition(current, requested, false);

        if !facade.supports(planned) {
            if explicit {
                return Err(Error::InvalidRequestedState {
                    package: package.id.clone(),
                    reason: format!("related bundles cannot {}", planned),
                });
            }
            planned = Action::None;
        }

        if planned != Action::None {
            self.backends.require(package)?;
        }

        let segment = if planned == Action::Uninstall && segment != Segment::RelatedAfter {
            Segment::RelatedRemoval
        } else {
            segment
        };

        Ok((
            segment,
            PlanEntry {
                package_id: package.id.clone(),
                package_type: PackageType::RelatedBundle,
                action: planned,
                requested,
                current: Some(current),
                boundary: 0,
                boundary_id: None,
                per_machine: bundle.is_per_machine(package),
                weight: package.weight(),
                features: BTreeMap::new(),
                relation: Some(related.relation),
            },
        ))
    }

    /// Apply explicit overrides, then ask the policy layer
    ///
    /// Returns the requested state and whether it was chosen explicitly.
    fn resolve_request(
        &self,
        package: &Package,
        default: RequestState,
        overrides: &PlanOverrides,
    ) -> (RequestState, bool) {
        let (mut requested, mut explicit) = match overrides.packages.get(&package.id) {
            Some(state) => (*state, true),
            None => (default, false),
        };

        let decision = self.callbacks.on_plan_package_begin(&package.id, requested);
        if decision.skip {
            debug!("Policy skipped {}", package.id);
            return (RequestState::None, explicit);
        }
        if let Some(state) = decision.override_state {
            debug!("Policy requested {} for {}", state, package.id);
            requested = state;
            explicit = true;
        }
        (requested, explicit)
    }

    /// Requested MSI feature states
    fn plan_features(
        &self,
        package: &Package,
        facade: &Facade,
        requested: RequestState,
        overrides: &PlanOverrides,
    ) -> BTreeMap<String, FeatureState> {
        let mut features = BTreeMap::new();
        if !matches!(requested, RequestState::Present | RequestState::Repair) {
            return features;
        }

        let explicit = overrides.features.get(&package.id);
        for feature in facade.features() {
            let default = explicit
                .and_then(|f| f.get(&feature.id))
                .or_else(|| package.feature_states.get(&feature.id))
                .copied()
                .unwrap_or(feature.default_state);
            let state = self
                .callbacks
                .on_plan_msi_feature(&package.id, &feature.id, default)
                .unwrap_or(default);
            features.insert(feature.id.clone(), state);
        }
        features
    }
}

/// Action needed to move from `current` to `requested`
pub fn transition(current: PackageState, requested: RequestState, features_changed: bool) -> Action {
    use PackageState as S;
    use RequestState as R;

    match (current, requested) {
        (_, R::None) => Action::None,
        (S::Absent, R::Present | R::Repair) => Action::Install,
        (S::Present, R::Present) if features_changed => Action::Modify,
        (S::Present, R::Present) => Action::None,
        (S::Present, R::Repair) => Action::Repair,
        (S::Present, R::Absent) => Action::Uninstall,
        // A newer version on the machine owns obsolete packages
        (S::Obsolete, _) => Action::None,
        (S::Absent, R::Absent) => Action::None,
    }
}

fn order_entries(planned: Vec<(Segment, PlanEntry)>) -> Vec<PlanEntry> {
    let mut related_removal = Vec::new();
    let mut removal = Vec::new();
    let mut install = Vec::new();
    let mut after = Vec::new();

    for (segment, entry) in planned {
        match segment {
            Segment::RelatedRemoval => related_removal.push(entry),
            Segment::Removal => removal.push(entry),
            Segment::Install => install.push(entry),
            Segment::RelatedAfter => after.push(entry),
        }
    }

    // Planned in install order; removals run the other way
    removal.reverse();

    related_removal
        .into_iter()
        .chain(removal)
        .chain(install)
        .chain(after)
        .collect()
}

fn assign_boundaries(mut entries: Vec<PlanEntry>) -> Vec<PlanEntry> {
    let mut index = 0;
    let mut current: Option<Option<String>> = None;

    for entry in &mut entries {
        if entry.is_executable() {
            match &current {
                Some(id) if *id == entry.boundary_id => {}
                Some(_) => {
                    index += 1;
                    current = Some(entry.boundary_id.clone());
                }
                None => current = Some(entry.boundary_id.clone()),
            }
        }
        entry.boundary = index;
    }
    entries
}
