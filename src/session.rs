// src/session.rs

//! Sessions
//!
//! An [`Engine`] holds the services a run needs (backends, policy callbacks,
//! registration store, update source, payload sources, elevator) and the
//! configuration. A [`Session`] is one install run over one bundle: it owns
//! the variable store, the bundle with its facades, and the current plan.
//! Phases are called on the engine with the session they act on, and each
//! checks the session is in the right phase first.

use crate::apply::{
    default_sources, AlreadyElevated, ApplyEngine, ApplyOutcome, ApplyState, ElevationPolicy,
    Elevator, PayloadSource,
};
use crate::backend::BackendRegistry;
use crate::bundle::{Bundle, BundleAction, FacadeTable};
use crate::callbacks::{EngineCallbacks, NoopCallbacks};
use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::detect::{DetectOptions, DetectState, DetectionReport, Detector, RegistrationStore, UpdateSource};
use crate::error::{Error, Result};
use crate::plan::{Plan, PlanOverrides, Planner};
use crate::variables::{builtin, Value, VariableStore};
use chrono::Utc;
use fs2::FileExt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// File name of the apply lock inside the cache root
const LOCK_FILE: &str = "corral.lock";

/// One install run over one bundle
#[derive(Debug)]
pub struct Session {
    id: String,
    variables: Arc<VariableStore>,
    bundle: Bundle,
    facades: FacadeTable,
    plan: Option<Plan>,
    detect_state: DetectState,
    apply_state: ApplyState,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Shared handle to the variable store; the policy layer may read and
    /// write user variables through it at any time
    pub fn variables(&self) -> &Arc<VariableStore> {
        &self.variables
    }

    pub fn bundle(&self) -> &Bundle {
        &self.bundle
    }

    pub fn facades(&self) -> &FacadeTable {
        &self.facades
    }

    pub fn plan(&self) -> Option<&Plan> {
        self.plan.as_ref()
    }

    pub fn detect_state(&self) -> DetectState {
        self.detect_state
    }

    pub fn apply_state(&self) -> ApplyState {
        self.apply_state
    }

    fn invalid_phase(&self, operation: &str) -> Error {
        let phase = if self.apply_state != ApplyState::Idle {
            format!("apply {}", self.apply_state)
        } else {
            self.detect_state.to_string()
        };
        Error::InvalidPhase {
            operation: operation.to_string(),
            phase,
        }
    }
}

/// Exclusive lock held for the duration of an apply
#[derive(Debug)]
pub struct SessionLock {
    file: File,
    path: PathBuf,
}

impl SessionLock {
    /// Take the lock in `dir`, retrying with exponential backoff
    ///
    /// Waits 100ms, 200ms, 400ms, ... between attempts.
    pub fn acquire(dir: &Path, attempts: u32) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE);
        let file = File::create(&path)?;

        let attempts = attempts.max(1);
        let mut last_error = None;
        for attempt in 0..attempts {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!("Acquired {}", path.display());
                    return Ok(Self { file, path });
                }
                Err(e) => {
                    last_error = Some(e);
                    if attempt + 1 < attempts {
                        std::thread::sleep(Duration::from_millis(100 * (1 << attempt.min(10))));
                    }
                }
            }
        }

        Err(Error::LockError(format!(
            "failed to lock {} after {} attempts; another session may be applying: {}",
            path.display(),
            attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to release {}: {}", self.path.display(), e);
        }
    }
}

/// Services and configuration shared by sessions
pub struct Engine {
    config: EngineConfig,
    backends: BackendRegistry,
    callbacks: Arc<dyn EngineCallbacks>,
    registrations: Option<Arc<dyn RegistrationStore>>,
    updates: Option<Arc<dyn UpdateSource>>,
    sources: Vec<Arc<dyn PayloadSource>>,
    elevator: Arc<dyn Elevator>,
    elevation_policy: ElevationPolicy,
    cancel: CancelToken,
}

impl Engine {
    /// Engine with the default payload sources and no policy layer
    pub fn new(config: EngineConfig, backends: BackendRegistry) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            backends,
            callbacks: Arc::new(NoopCallbacks),
            registrations: None,
            updates: None,
            sources: default_sources()?,
            elevator: Arc::new(AlreadyElevated),
            elevation_policy: ElevationPolicy::default(),
            cancel: CancelToken::new(),
        })
    }

    pub fn with_callbacks(mut self, callbacks: Arc<dyn EngineCallbacks>) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn with_registrations(mut self, store: Arc<dyn RegistrationStore>) -> Self {
        self.registrations = Some(store);
        self
    }

    pub fn with_update_source(mut self, source: Arc<dyn UpdateSource>) -> Self {
        self.updates = Some(source);
        self
    }

    /// Replace the payload source chain
    pub fn with_sources(mut self, sources: Vec<Arc<dyn PayloadSource>>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_elevator(mut self, elevator: Arc<dyn Elevator>) -> Self {
        self.elevator = elevator;
        self
    }

    pub fn with_elevation_policy(mut self, policy: ElevationPolicy) -> Self {
        self.elevation_policy = policy;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Handle for requesting cooperative cancellation from another thread
    ///
    /// A request stays pending until the next detect or apply observes it;
    /// each of those phases clears the flag when it finishes.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Start a session: validate the bundle, build facades, seed variables
    ///
    /// Unknown package types fail here, before any phase runs.
    pub fn open(&self, bundle: Bundle) -> Result<Session> {
        bundle.validate()?;
        let facades = FacadeTable::build(&bundle)?;

        for package in bundle.declared_packages() {
            let facade = facades.require(package)?;
            if !self.backends.supports(facade.package_type()) {
                warn!(
                    "No backend registered for {} packages; {} can only be detected by condition",
                    facade.package_type(),
                    package.id
                );
            }
        }

        let id = Uuid::new_v4().to_string();
        let variables = Arc::new(VariableStore::new());
        self.seed_variables(&variables, &bundle, &id)?;

        info!(
            "Opened session {} for {} v{} ({} packages)",
            id,
            bundle.name,
            bundle.version,
            bundle.packages.len()
        );

        Ok(Session {
            id,
            variables,
            bundle,
            facades,
            plan: None,
            detect_state: DetectState::Idle,
            apply_state: ApplyState::Idle,
        })
    }

    fn seed_variables(&self, variables: &VariableStore, bundle: &Bundle, session_id: &str) -> Result<()> {
        let processors = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        variables.set_builtin(builtin::BUNDLE_NAME, bundle.name.as_str());
        variables.set_builtin(builtin::BUNDLE_VERSION, bundle.version.clone());
        variables.set_builtin(builtin::BUNDLE_PER_MACHINE, i64::from(bundle.per_machine));
        variables.set_builtin(builtin::BUNDLE_INSTALLED, 0);
        variables.set_builtin(builtin::PRIVILEGED, 0);
        variables.set_builtin(builtin::SESSION_ID, session_id);
        variables.set_builtin(builtin::PROCESSOR_COUNT, processors as i64);
        variables.set_builtin(
            builtin::CACHE_ROOT,
            self.config.cache_root.display().to_string(),
        );

        for decl in &bundle.variables {
            let value = Value::parse(decl.namespace, &decl.value)?;
            variables.set(decl.namespace, &decl.name, value)?;
        }

        if let Some(name) = &bundle.log_variable {
            let file = format!(
                "{}_{}.log",
                bundle.name.replace(char::is_whitespace, "_"),
                Utc::now().format("%Y%m%d%H%M%S")
            );
            let path = std::env::temp_dir().join(file);
            variables.set(
                crate::variables::Namespace::String,
                name,
                path.display().to_string(),
            )?;
        }
        Ok(())
    }

    /// Detect the session's bundle
    pub fn detect(&self, session: &mut Session, options: DetectOptions) -> Result<DetectionReport> {
        if session.detect_state == DetectState::Detecting
            || !(session.apply_state == ApplyState::Idle || session.apply_state.is_terminal())
        {
            return Err(session.invalid_phase("detect"));
        }

        session.plan = None;
        session.apply_state = ApplyState::Idle;
        session.detect_state = DetectState::Detecting;

        let mut detector = Detector::new(
            &self.backends,
            self.callbacks.as_ref(),
            self.config.detect_workers,
            &self.config.cache_root,
            &self.cancel,
        );
        if let Some(store) = &self.registrations {
            detector = detector.with_registrations(store.as_ref());
        }
        if let Some(source) = &self.updates {
            detector = detector.with_updates(source.as_ref());
        }

        let result = detector.detect(
            &mut session.bundle,
            &mut session.facades,
            &session.variables,
            options,
        );
        self.cancel.reset();
        session.detect_state = if result.is_ok() {
            DetectState::Detected
        } else {
            DetectState::DetectFailed
        };
        result
    }

    /// Plan `action` for a detected session
    pub fn plan(&self, session: &mut Session, action: BundleAction, overrides: &PlanOverrides) -> Result<Plan> {
        if session.detect_state != DetectState::Detected
            || !(session.apply_state == ApplyState::Idle || session.apply_state.is_terminal())
        {
            return Err(session.invalid_phase("plan"));
        }

        session.plan = None;
        session.apply_state = ApplyState::Idle;

        let planner = Planner::new(&self.backends, self.callbacks.as_ref());
        let plan = planner.plan(
            &mut session.bundle,
            &session.facades,
            &session.variables,
            action,
            overrides,
        )?;
        session.plan = Some(plan.clone());
        Ok(plan)
    }

    /// Apply the session's plan
    ///
    /// `Err` means apply never started (wrong phase or the session lock is
    /// held elsewhere). Failures during apply are reported in the outcome.
    pub fn apply(&self, session: &mut Session) -> Result<ApplyOutcome> {
        if session.apply_state != ApplyState::Idle {
            return Err(session.invalid_phase("apply"));
        }
        let Some(plan) = session.plan.as_ref() else {
            return Err(session.invalid_phase("apply"));
        };

        let _lock = SessionLock::acquire(&self.config.cache_root, self.config.lock_retries)?;

        let engine = ApplyEngine::new(
            &self.backends,
            self.callbacks.as_ref(),
            &self.sources,
            self.elevator.as_ref(),
            &self.config,
            &self.cancel,
        )
        .with_elevation_policy(self.elevation_policy);

        let outcome = engine.apply(&session.bundle, &session.facades, &session.variables, plan);
        self.cancel.reset();
        session.apply_state = outcome.state;
        Ok(outcome)
    }

    /// Detect, plan, and apply in one call
    pub fn run(
        &self,
        session: &mut Session,
        action: BundleAction,
        overrides: &PlanOverrides,
        options: DetectOptions,
    ) -> Result<ApplyOutcome> {
        self.detect(session, options)?;
        self.plan(session, action, overrides)?;
        self.apply(session)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("backends", &self.backends)
            .field("sources", &self.sources.iter().map(|s| s.name()).collect::<Vec<_>>())
            .field("elevation_policy", &self.elevation_policy)
            .finish_non_exhaustive()
    }
}
