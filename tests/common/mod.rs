// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.
//!
//! Not every test binary uses every helper.
#![allow(dead_code)]

use corral::apply::{AcquireRequest, PayloadSource};
use corral::backend::{DetectRequest, DetectedState, ExecuteOutcome, ExecuteRequest};
use corral::bundle::{ExeFields, Payload};
use corral::callbacks::{Control, FilesInUseDecision, PackageDecision};
use corral::plan::PlanEntry;
use corral::progress::ProgressSink;
use corral::{
    Action, BackendRegistry, Bundle, CancelToken, Engine, EngineCallbacks, EngineConfig, Error,
    ExecutionResult, Package, PackageBackend, PackageState, PackageType, RequestState,
    RestartState, Result, Version,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Scripted response to one execute call
#[derive(Debug, Clone)]
pub enum Step {
    Succeed,
    Restart(RestartState),
    FilesInUse,
    Fail(i32),
}

/// Call recorded by [`FakeBackend`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Execute(String, Action),
    Rollback(String, Action),
}

/// In-memory backend with scripted behaviour
///
/// Detection reports the stored state (Absent when unknown). A successful
/// install moves the package to Present and an uninstall to Absent, so a
/// second detection sees the result of the first apply.
#[derive(Default)]
pub struct FakeBackend {
    states: Mutex<HashMap<String, PackageState>>,
    detect_failures: HashSet<String>,
    rollback_failures: HashSet<String>,
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<Call>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(self, id: &str, state: PackageState) -> Self {
        self.states.lock().unwrap().insert(id.to_string(), state);
        self
    }

    pub fn failing_detect(mut self, id: &str) -> Self {
        self.detect_failures.insert(id.to_string());
        self
    }

    pub fn failing_rollback(mut self, id: &str) -> Self {
        self.rollback_failures.insert(id.to_string());
        self
    }

    /// Responses for successive execute calls; once drained, execute succeeds
    pub fn script(self, id: &str, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(id.to_string(), steps.into());
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Execute calls in order, retries included
    pub fn executed(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Execute(id, _) => Some(id),
                Call::Rollback(..) => None,
            })
            .collect()
    }

    pub fn rolled_back(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Rollback(id, _) => Some(id),
                Call::Execute(..) => None,
            })
            .collect()
    }

    pub fn execute_count(&self, id: &str) -> usize {
        self.executed().iter().filter(|e| *e == id).count()
    }

    pub fn state(&self, id: &str) -> PackageState {
        self.states
            .lock()
            .unwrap()
            .get(id)
            .copied()
            .unwrap_or(PackageState::Absent)
    }

    fn settle(&self, id: &str, action: Action) {
        let state = match action {
            Action::Install | Action::Repair | Action::Modify => PackageState::Present,
            Action::Uninstall => PackageState::Absent,
            Action::None => return,
        };
        self.states.lock().unwrap().insert(id.to_string(), state);
    }
}

impl PackageBackend for FakeBackend {
    fn detect(&self, request: &DetectRequest<'_>) -> Result<DetectedState> {
        let id = &request.package.id;
        if self.detect_failures.contains(id) {
            return Err(Error::DetectionFailure {
                package: id.clone(),
                reason: "scripted failure".into(),
                fatal: false,
            });
        }
        Ok(DetectedState::new(self.state(id)))
    }

    fn execute(&self, request: &ExecuteRequest<'_>, progress: &dyn ProgressSink) -> Result<ExecuteOutcome> {
        let id = request.package.id.clone();
        self.calls
            .lock()
            .unwrap()
            .push(Call::Execute(id.clone(), request.action));

        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Succeed);

        progress.report(50);
        match step {
            Step::Succeed => {
                progress.report(100);
                self.settle(&id, request.action);
                Ok(ExecuteOutcome::Success {
                    restart: RestartState::None,
                })
            }
            Step::Restart(restart) => {
                self.settle(&id, request.action);
                Ok(ExecuteOutcome::Success { restart })
            }
            Step::FilesInUse => Ok(ExecuteOutcome::FilesInUse {
                files: vec![format!("/opt/{id}/lib.so")],
            }),
            Step::Fail(code) => Err(Error::ExecuteFailure {
                package: id,
                code,
                reason: "scripted failure".into(),
            }),
        }
    }

    fn rollback(&self, request: &ExecuteRequest<'_>, _progress: &dyn ProgressSink) -> Result<()> {
        let id = request.package.id.clone();
        self.calls
            .lock()
            .unwrap()
            .push(Call::Rollback(id.clone(), request.action));

        if self.rollback_failures.contains(&id) {
            return Err(Error::ExecuteFailure {
                package: id,
                code: 1603,
                reason: "scripted rollback failure".into(),
            });
        }
        let undo = match request.action {
            Action::Uninstall => Action::Install,
            _ => Action::Uninstall,
        };
        self.settle(&id, undo);
        Ok(())
    }
}

/// Policy layer that records events and answers from a script
#[derive(Default)]
pub struct RecordingCallbacks {
    events: Mutex<Vec<String>>,
    files_in_use_answers: Mutex<VecDeque<FilesInUseDecision>>,
    plan_decisions: HashMap<String, PackageDecision>,
    execute_skips: HashSet<String>,
}

impl RecordingCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers for successive files-in-use reports; Abort once drained
    pub fn answer_files_in_use(self, answers: Vec<FilesInUseDecision>) -> Self {
        *self.files_in_use_answers.lock().unwrap() = answers.into();
        self
    }

    pub fn plan_decision(mut self, id: &str, decision: PackageDecision) -> Self {
        self.plan_decisions.insert(id.to_string(), decision);
        self
    }

    pub fn skip_execute(mut self, id: &str) -> Self {
        self.execute_skips.insert(id.to_string());
        self
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events().iter().filter(|e| e.starts_with(prefix)).count()
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl EngineCallbacks for RecordingCallbacks {
    fn on_detect_package_complete(&self, package_id: &str, status: i32, _state: Option<PackageState>) {
        self.record(format!("detect-package:{package_id}:{status}"));
    }

    fn on_detect_complete(&self, status: i32) {
        self.record(format!("detect-complete:{status}"));
    }

    fn on_plan_package_begin(&self, package_id: &str, _default: RequestState) -> PackageDecision {
        self.plan_decisions
            .get(package_id)
            .copied()
            .unwrap_or_default()
    }

    fn on_plan_package_complete(&self, entry: &PlanEntry) {
        self.record(format!("plan-package:{}:{}", entry.package_id, entry.action));
    }

    fn on_plan_complete(&self, status: i32) {
        self.record(format!("plan-complete:{status}"));
    }

    fn on_apply_begin(&self, _action_count: usize) -> Control {
        self.record("apply-begin".to_string());
        Control::Continue
    }

    fn on_elevate_begin(&self) -> Control {
        self.record("elevate-begin".to_string());
        Control::Continue
    }

    fn on_elevate_complete(&self, status: i32) {
        self.record(format!("elevate-complete:{status}"));
    }

    fn on_cache_begin(&self, _package_count: usize) -> Control {
        self.record("cache-begin".to_string());
        Control::Continue
    }

    fn on_cache_package_begin(&self, package_id: &str, _payload_count: usize, _total_size: u64) -> PackageDecision {
        self.record(format!("cache-package:{package_id}"));
        PackageDecision::default()
    }

    fn on_cache_complete(&self, status: i32) {
        self.record(format!("cache-complete:{status}"));
    }

    fn on_execute_begin(&self, _action_count: usize) -> Control {
        self.record("execute-started".to_string());
        Control::Continue
    }

    fn on_execute_package_begin(&self, package_id: &str, _action: Action) -> PackageDecision {
        self.record(format!("execute-begin:{package_id}"));
        if self.execute_skips.contains(package_id) {
            PackageDecision::skip()
        } else {
            PackageDecision::default()
        }
    }

    fn on_execute_files_in_use(&self, package_id: &str, _files: &[String], retries: u32) -> FilesInUseDecision {
        self.record(format!("files-in-use:{package_id}:{retries}"));
        self.files_in_use_answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(FilesInUseDecision::Abort)
    }

    fn on_execute_package_complete(&self, package_id: &str, result: &ExecutionResult, _restart: RestartState) {
        self.record(format!("execute-complete:{package_id}:{}", result.status));
    }

    fn on_execute_complete(&self, status: i32) {
        self.record(format!("execute-finished:{status}"));
    }

    fn on_rollback_package_complete(&self, package_id: &str, status: i32) {
        self.record(format!("rollback:{package_id}:{status}"));
    }

    fn on_apply_complete(&self, status: i32, _restart: RestartState) {
        self.record(format!("apply-complete:{status}"));
    }
}

/// Payloads served from memory
///
/// With a cancel token attached, the first acquisition requests
/// cancellation and then finishes its transfer.
#[derive(Default)]
pub struct MemorySource {
    payloads: HashMap<String, Vec<u8>>,
    cancel_on_acquire: Option<CancelToken>,
    acquired: Mutex<Vec<String>>,
    attempts: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_payload(mut self, payload_id: &str, data: &[u8]) -> Self {
        self.payloads.insert(payload_id.to_string(), data.to_vec());
        self
    }

    pub fn cancel_on_acquire(mut self, token: CancelToken) -> Self {
        self.cancel_on_acquire = Some(token);
        self
    }

    /// Payload ids written, in order
    pub fn acquired(&self) -> Vec<String> {
        self.acquired.lock().unwrap().clone()
    }

    /// Every acquire call, including misses
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl PayloadSource for MemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    fn acquire(&self, request: &AcquireRequest<'_>, progress: &dyn Fn(u64, u64)) -> Result<bool> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let Some(data) = self.payloads.get(&request.payload.id) else {
            return Ok(false);
        };

        if let Some(token) = &self.cancel_on_acquire {
            token.cancel();
        }

        if let Some(parent) = request.destination.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(request.destination, data)?;
        let len = data.len() as u64;
        progress(len, len);

        self.acquired
            .lock()
            .unwrap()
            .push(request.payload.id.clone());
        Ok(true)
    }
}

/// Exe package supporting install, uninstall and repair
pub fn exe(id: &str) -> Package {
    let mut package = Package::new(id, PackageType::Exe);
    package.exe = Some(ExeFields {
        install_arguments: "/install".into(),
        uninstall_arguments: Some("/uninstall".into()),
        repair_arguments: Some("/repair".into()),
        ..Default::default()
    });
    package
}

pub fn depends(mut package: Package, on: &[&str]) -> Package {
    package.depends_on = on.iter().map(|s| s.to_string()).collect();
    package
}

pub fn boundary(mut package: Package, id: &str) -> Package {
    package.rollback_boundary = Some(id.to_string());
    package
}

pub fn payload(id: &str, size: u64) -> Payload {
    Payload {
        id: id.to_string(),
        file_name: format!("{id}.bin"),
        size,
        hash: None,
        download_url: None,
    }
}

pub fn with_payload(mut package: Package, payload: Payload) -> Package {
    package.payloads.push(payload);
    package
}

pub fn bundle(packages: Vec<Package>) -> Bundle {
    let mut bundle = Bundle::new("Suite", Version::parse("2.0.0").unwrap());
    bundle.upgrade_code = Some("suite".into());
    bundle.packages = packages;
    bundle
}

/// Engine configuration rooted in a temporary cache directory
pub fn config(cache: &TempDir) -> EngineConfig {
    EngineConfig {
        detect_workers: 2,
        cache_workers: 2,
        acquire_attempts: 2,
        lock_retries: 1,
        ..EngineConfig::default()
    }
    .with_cache_root(cache.path())
}

/// Engine with the fake backend for exe and related-bundle packages and
/// no payload sources
pub fn engine(
    cache: &TempDir,
    backend: &Arc<FakeBackend>,
    callbacks: &Arc<RecordingCallbacks>,
) -> Engine {
    let shared: Arc<dyn PackageBackend> = backend.clone();
    let backends = BackendRegistry::new()
        .with(PackageType::Exe, shared.clone())
        .with(PackageType::RelatedBundle, shared);
    Engine::new(config(cache), backends)
        .unwrap()
        .with_callbacks(callbacks.clone())
        .with_sources(Vec::new())
}
