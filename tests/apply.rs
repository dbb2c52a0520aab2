// tests/apply.rs

//! Apply: caching, execution, files-in-use retries, elevation, and rollback.

mod common;

use common::{
    boundary, bundle, config, engine, exe, payload, with_payload, FakeBackend, MemorySource,
    RecordingCallbacks, Step,
};
use corral::apply::{AcquireRequest, DenyElevation, ExecutionStatus};
use corral::callbacks::FilesInUseDecision;
use corral::hash::{hash_bytes, HashAlgorithm};
use corral::plan::PlanOverrides;
use corral::{
    Action, ApplyState, BackendRegistry, BundleAction, CancelToken, DetectOptions, Engine,
    EngineCallbacks, EngineConfig, ElevationPolicy, Error, ExecutionResult, PackageBackend,
    PackageState, PackageType, PayloadSource, RestartState, Session,
};
use std::sync::Arc;

fn planned(engine: &Engine, session: &mut Session, action: BundleAction) {
    engine.detect(session, DetectOptions::default()).unwrap();
    engine.plan(session, action, &PlanOverrides::default()).unwrap();
}

#[test]
fn test_apply_caches_then_executes_in_plan_order() {
    let cache = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::new());
    let callbacks = Arc::new(RecordingCallbacks::new());
    let source = Arc::new(
        MemorySource::new()
            .with_payload("runtime-setup", b"runtime bytes")
            .with_payload("app-setup", b"app bytes"),
    );
    let engine = engine(&cache, &backend, &callbacks).with_sources(vec![source.clone()]);

    let packages = vec![
        common::depends(with_payload(exe("app"), payload("app-setup", 9)), &["runtime"]),
        with_payload(exe("runtime"), payload("runtime-setup", 13)),
    ];
    let mut session = engine.open(bundle(packages)).unwrap();
    planned(&engine, &mut session, BundleAction::Install);
    let outcome = engine.apply(&mut session).unwrap();

    assert!(outcome.is_success(), "{:?}", outcome.error);
    assert_eq!(outcome.state, ApplyState::Applied);
    assert_eq!(session.apply_state(), ApplyState::Applied);
    assert_eq!(backend.executed(), vec!["runtime", "app"]);
    assert_eq!(outcome.succeeded(), vec!["runtime", "app"]);
    assert!(outcome.rolled_back.is_empty());

    let cached = cache.path().join("runtime").join("runtime-setup.bin");
    assert_eq!(std::fs::read(cached).unwrap(), b"runtime bytes");
    assert_eq!(source.acquired().len(), 2);

    // Cache events all precede execution
    let events = callbacks.events();
    let last_cache = events.iter().rposition(|e| e.starts_with("cache-")).unwrap();
    let first_execute = events.iter().position(|e| e.starts_with("execute-")).unwrap();
    assert!(last_cache < first_execute);
    assert_eq!(events.last().unwrap(), "apply-complete:0");
}

#[test]
fn test_unchanged_packages_are_not_cached_or_executed() {
    let cache = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::new().with_state("runtime", PackageState::Present));
    let callbacks = Arc::new(RecordingCallbacks::new());
    let source = Arc::new(
        MemorySource::new()
            .with_payload("runtime-setup", b"runtime")
            .with_payload("app-setup", b"app"),
    );
    let engine = engine(&cache, &backend, &callbacks).with_sources(vec![source.clone()]);

    let packages = vec![
        with_payload(exe("runtime"), payload("runtime-setup", 7)),
        with_payload(exe("app"), payload("app-setup", 3)),
    ];
    let mut session = engine.open(bundle(packages)).unwrap();
    planned(&engine, &mut session, BundleAction::Install);
    let outcome = engine.apply(&mut session).unwrap();

    assert!(outcome.is_success());
    assert_eq!(backend.executed(), vec!["app"]);
    assert_eq!(source.acquired(), vec!["app-setup"]);
    assert!(outcome.result("runtime").is_none());
}

#[test]
fn test_failure_rolls_back_completed_actions_in_reverse() {
    let cache = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::new().script("d", vec![Step::Fail(1603)]));
    let callbacks = Arc::new(RecordingCallbacks::new());
    let engine = engine(&cache, &backend, &callbacks);

    let packages = vec![
        boundary(exe("a"), "core"),
        boundary(exe("b"), "core"),
        boundary(exe("c"), "extras"),
        boundary(exe("d"), "extras"),
        exe("e"),
    ];
    let mut session = engine.open(bundle(packages)).unwrap();
    planned(&engine, &mut session, BundleAction::Install);
    let outcome = engine.apply(&mut session).unwrap();

    assert_eq!(outcome.state, ApplyState::Failed);
    assert_eq!(outcome.status, 1603);
    assert_eq!(backend.executed(), vec!["a", "b", "c", "d"]);
    assert_eq!(backend.rolled_back(), vec!["c", "b", "a"]);
    assert_eq!(outcome.rolled_back, vec!["c", "b", "a"]);
    assert_eq!(outcome.result("d").unwrap().status, ExecutionStatus::Failed);
    assert_eq!(backend.state("a"), PackageState::Absent);
    assert_eq!(callbacks.count("rollback:"), 3);
}

#[test]
fn test_rollback_failure_is_a_warning() {
    let cache = tempfile::tempdir().unwrap();
    let backend = Arc::new(
        FakeBackend::new()
            .script("c", vec![Step::Fail(1)])
            .failing_rollback("b"),
    );
    let callbacks = Arc::new(RecordingCallbacks::new());
    let engine = engine(&cache, &backend, &callbacks);

    let mut session = engine
        .open(bundle(vec![exe("a"), exe("b"), exe("c")]))
        .unwrap();
    planned(&engine, &mut session, BundleAction::Install);
    let outcome = engine.apply(&mut session).unwrap();

    assert_eq!(outcome.state, ApplyState::Failed);
    // The unwind continues past the failed compensation
    assert_eq!(backend.rolled_back(), vec!["b", "a"]);
    assert_eq!(outcome.rolled_back, vec!["a"]);
    assert_eq!(outcome.rollback_warnings.len(), 1);
    assert!(outcome.rollback_warnings[0].starts_with("b:"));
}

#[test]
fn test_files_in_use_retries_then_abort() {
    let cache = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::new().script(
        "app",
        vec![Step::FilesInUse, Step::FilesInUse, Step::FilesInUse],
    ));
    let callbacks = Arc::new(RecordingCallbacks::new().answer_files_in_use(vec![
        FilesInUseDecision::Retry,
        FilesInUseDecision::Retry,
        FilesInUseDecision::Abort,
    ]));
    let engine = engine(&cache, &backend, &callbacks);

    let mut session = engine
        .open(bundle(vec![exe("runtime"), exe("app")]))
        .unwrap();
    planned(&engine, &mut session, BundleAction::Install);
    let outcome = engine.apply(&mut session).unwrap();

    // One initial run plus exactly two re-executions
    assert_eq!(backend.execute_count("app"), 3);
    assert_eq!(outcome.result("app").unwrap().retries, 2);
    assert_eq!(
        callbacks.events().iter().filter(|e| e.starts_with("files-in-use:app")).cloned().collect::<Vec<_>>(),
        vec!["files-in-use:app:0", "files-in-use:app:1", "files-in-use:app:2"]
    );
    assert_eq!(outcome.state, ApplyState::Failed);
    let in_use = Error::FilesInUse {
        package: "app".into(),
        files: Vec::new(),
    };
    assert_eq!(outcome.status, in_use.code());
    assert_eq!(backend.rolled_back(), vec!["runtime"]);
}

#[test]
fn test_files_in_use_abort_means_no_retry() {
    let cache = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::new().script("app", vec![Step::FilesInUse]));
    let callbacks = Arc::new(RecordingCallbacks::new());
    let engine = engine(&cache, &backend, &callbacks);

    let mut session = engine.open(bundle(vec![exe("app")])).unwrap();
    planned(&engine, &mut session, BundleAction::Install);
    let outcome = engine.apply(&mut session).unwrap();

    assert_eq!(backend.execute_count("app"), 1);
    assert_eq!(outcome.result("app").unwrap().retries, 0);
    assert_eq!(outcome.state, ApplyState::Failed);
    // Nothing completed, so nothing to roll back
    assert!(backend.rolled_back().is_empty());
}

#[test]
fn test_files_in_use_retry_ceiling() {
    let cache = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::new().script("app", vec![Step::FilesInUse; 5]));
    let callbacks = Arc::new(
        RecordingCallbacks::new().answer_files_in_use(vec![FilesInUseDecision::Retry; 5]),
    );
    let shared: Arc<dyn PackageBackend> = backend.clone();
    let config = EngineConfig {
        files_in_use_retry_ceiling: Some(1),
        ..config(&cache)
    };
    let engine = Engine::new(config, BackendRegistry::new().with(PackageType::Exe, shared))
        .unwrap()
        .with_callbacks(callbacks.clone())
        .with_sources(Vec::new());

    let mut session = engine.open(bundle(vec![exe("app")])).unwrap();
    planned(&engine, &mut session, BundleAction::Install);
    let outcome = engine.apply(&mut session).unwrap();

    assert_eq!(backend.execute_count("app"), 2);
    assert_eq!(outcome.state, ApplyState::Failed);
}

#[test]
fn test_cache_failure_stops_before_execution() {
    let cache = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::new());
    let callbacks = Arc::new(RecordingCallbacks::new());
    let source = Arc::new(MemorySource::new().with_payload("runtime-setup", b"runtime"));
    let engine = engine(&cache, &backend, &callbacks).with_sources(vec![source.clone()]);

    let packages = vec![
        with_payload(exe("runtime"), payload("runtime-setup", 7)),
        with_payload(exe("app"), payload("missing", 3)),
    ];
    let mut session = engine.open(bundle(packages)).unwrap();
    planned(&engine, &mut session, BundleAction::Install);
    let outcome = engine.apply(&mut session).unwrap();

    assert_eq!(outcome.state, ApplyState::Failed);
    assert!(backend.executed().is_empty());
    assert!(outcome.error.unwrap().contains("missing"));
    assert_eq!(callbacks.count("execute-"), 0);
}

#[test]
fn test_cache_cancel_lets_in_flight_acquisition_finish() {
    let cache = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::new());
    let callbacks = Arc::new(RecordingCallbacks::new());
    let shared: Arc<dyn PackageBackend> = backend.clone();
    let config = EngineConfig {
        cache_workers: 1,
        ..config(&cache)
    };
    let engine = Engine::new(config, BackendRegistry::new().with(PackageType::Exe, shared))
        .unwrap()
        .with_callbacks(callbacks.clone());

    let source = Arc::new(
        MemorySource::new()
            .with_payload("a-setup", b"a")
            .with_payload("b-setup", b"b")
            .with_payload("c-setup", b"c")
            .cancel_on_acquire(engine.cancel_token()),
    );
    let engine = engine.with_sources(vec![source.clone()]);

    let packages = vec![
        with_payload(exe("a"), payload("a-setup", 1)),
        with_payload(exe("b"), payload("b-setup", 1)),
        with_payload(exe("c"), payload("c-setup", 1)),
    ];
    let mut session = engine.open(bundle(packages)).unwrap();
    planned(&engine, &mut session, BundleAction::Install);
    let outcome = engine.apply(&mut session).unwrap();

    assert_eq!(outcome.state, ApplyState::Canceled);
    // The acquisition that requested cancellation still completed
    let acquired = source.acquired();
    assert_eq!(acquired.len(), 1);
    assert_eq!(source.attempts(), 1);
    let package = acquired[0].trim_end_matches("-setup");
    assert!(cache
        .path()
        .join(package)
        .join(format!("{}.bin", acquired[0]))
        .is_file());
    assert!(backend.executed().is_empty());
}

/// Cancels the run once the first package finishes executing
struct CancelAfterFirst {
    token: CancelToken,
}

impl EngineCallbacks for CancelAfterFirst {
    fn on_execute_package_complete(&self, _package_id: &str, _result: &ExecutionResult, _restart: RestartState) {
        self.token.cancel();
    }
}

#[test]
fn test_cancel_during_execute_unwinds_everything() {
    let cache = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::new());
    let callbacks = Arc::new(RecordingCallbacks::new());
    let engine = engine(&cache, &backend, &callbacks);
    let token = engine.cancel_token();
    let engine = engine.with_callbacks(Arc::new(CancelAfterFirst { token }));

    let packages = vec![boundary(exe("a"), "one"), boundary(exe("b"), "two")];
    let mut session = engine.open(bundle(packages)).unwrap();
    planned(&engine, &mut session, BundleAction::Install);
    let outcome = engine.apply(&mut session).unwrap();

    assert_eq!(outcome.state, ApplyState::Canceled);
    assert_eq!(backend.executed(), vec!["a"]);
    assert_eq!(outcome.rolled_back, vec!["a"]);
}

#[test]
fn test_policy_skip_during_execute() {
    let cache = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::new());
    let callbacks = Arc::new(RecordingCallbacks::new().skip_execute("docs"));
    let engine = engine(&cache, &backend, &callbacks);

    let mut session = engine
        .open(bundle(vec![exe("app"), exe("docs")]))
        .unwrap();
    planned(&engine, &mut session, BundleAction::Install);
    let outcome = engine.apply(&mut session).unwrap();

    assert!(outcome.is_success());
    assert_eq!(backend.executed(), vec!["app"]);
    assert_eq!(outcome.skipped, vec!["docs"]);
}

#[test]
fn test_restart_requirement_aggregates() {
    let cache = tempfile::tempdir().unwrap();
    let backend = Arc::new(
        FakeBackend::new()
            .script("driver", vec![Step::Restart(RestartState::Required)])
            .script("app", vec![Step::Restart(RestartState::None)]),
    );
    let callbacks = Arc::new(RecordingCallbacks::new());
    let engine = engine(&cache, &backend, &callbacks);

    let mut session = engine
        .open(bundle(vec![exe("driver"), exe("app")]))
        .unwrap();
    planned(&engine, &mut session, BundleAction::Install);
    let outcome = engine.apply(&mut session).unwrap();

    assert!(outcome.is_success());
    assert_eq!(outcome.restart, RestartState::Required);
}

#[test]
fn test_elevation_denied_aborts_per_machine_run() {
    let cache = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::new());
    let callbacks = Arc::new(RecordingCallbacks::new());
    let engine = engine(&cache, &backend, &callbacks).with_elevator(Arc::new(DenyElevation));

    let mut user_tool = exe("user-tool");
    user_tool.per_machine = Some(false);
    let mut manifest = bundle(vec![user_tool, exe("service")]);
    manifest.per_machine = true;

    let mut session = engine.open(manifest).unwrap();
    planned(&engine, &mut session, BundleAction::Install);
    let outcome = engine.apply(&mut session).unwrap();

    assert_eq!(outcome.state, ApplyState::Failed);
    assert_eq!(backend.executed(), vec!["user-tool"]);
    assert_eq!(backend.rolled_back(), vec!["user-tool"]);
    assert_eq!(
        outcome.result("service").unwrap().code,
        Error::ElevationDenied(String::new()).code()
    );
}

#[test]
fn test_elevation_denied_continues_per_user() {
    let cache = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::new());
    let callbacks = Arc::new(RecordingCallbacks::new());
    let engine = engine(&cache, &backend, &callbacks)
        .with_elevator(Arc::new(DenyElevation))
        .with_elevation_policy(ElevationPolicy::ContinuePerUser);

    let mut user_tool = exe("user-tool");
    user_tool.per_machine = Some(false);
    let mut manifest = bundle(vec![exe("service"), user_tool]);
    manifest.per_machine = true;

    let mut session = engine.open(manifest).unwrap();
    planned(&engine, &mut session, BundleAction::Install);
    let outcome = engine.apply(&mut session).unwrap();

    assert_eq!(outcome.state, ApplyState::Failed);
    assert_eq!(backend.executed(), vec!["user-tool"]);
    assert!(backend.rolled_back().is_empty());
    assert_eq!(outcome.succeeded(), vec!["user-tool"]);
}

#[test]
fn test_uninstall_action_reaches_backend() {
    let cache = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::new().with_state("app", PackageState::Present));
    let callbacks = Arc::new(RecordingCallbacks::new());
    let engine = engine(&cache, &backend, &callbacks);

    let mut session = engine.open(bundle(vec![exe("app")])).unwrap();
    planned(&engine, &mut session, BundleAction::Uninstall);
    let outcome = engine.apply(&mut session).unwrap();

    assert!(outcome.is_success());
    assert_eq!(
        backend.calls(),
        vec![common::Call::Execute("app".into(), Action::Uninstall)]
    );
    assert_eq!(backend.state("app"), PackageState::Absent);
}

#[test]
fn test_notification_order_for_failing_elevated_apply() {
    let cache = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::new().script("broken", vec![Step::Fail(1603)]));
    let callbacks = Arc::new(RecordingCallbacks::new());
    let engine = engine(&cache, &backend, &callbacks);

    let mut user_tool = exe("user-tool");
    user_tool.per_machine = Some(false);
    let mut manifest = bundle(vec![user_tool, exe("service"), exe("broken")]);
    manifest.per_machine = true;

    let mut session = engine.open(manifest).unwrap();
    planned(&engine, &mut session, BundleAction::Install);
    let outcome = engine.apply(&mut session).unwrap();
    assert_eq!(outcome.state, ApplyState::Failed);

    let events = callbacks.events();
    let start = events.iter().position(|e| e == "apply-begin").unwrap();
    assert_eq!(
        events[start..].to_vec(),
        vec![
            "apply-begin",
            "cache-begin",
            "cache-complete:0",
            "execute-started",
            "execute-begin:user-tool",
            "execute-complete:user-tool:success",
            "execute-begin:service",
            "elevate-begin",
            "elevate-complete:0",
            "execute-complete:service:success",
            "execute-begin:broken",
            "execute-complete:broken:failed",
            "execute-finished:1603",
            "rollback:service:0",
            "rollback:user-tool:0",
            "apply-complete:1603",
        ]
    );
}

/// Requests cancellation from the files-in-use prompt, then asks to retry
struct CancelOnFilesInUse {
    token: CancelToken,
}

impl EngineCallbacks for CancelOnFilesInUse {
    fn on_execute_files_in_use(&self, _package_id: &str, _files: &[String], _retries: u32) -> FilesInUseDecision {
        self.token.cancel();
        FilesInUseDecision::Retry
    }
}

#[test]
fn test_cancel_before_retry_records_canceled_result() {
    let cache = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::new().script("app", vec![Step::FilesInUse]));
    let callbacks = Arc::new(RecordingCallbacks::new());
    let engine = engine(&cache, &backend, &callbacks);
    let token = engine.cancel_token();
    let engine = engine.with_callbacks(Arc::new(CancelOnFilesInUse { token }));

    let mut session = engine
        .open(bundle(vec![exe("runtime"), exe("app")]))
        .unwrap();
    planned(&engine, &mut session, BundleAction::Install);
    let outcome = engine.apply(&mut session).unwrap();

    assert_eq!(outcome.state, ApplyState::Canceled);
    assert_eq!(backend.executed(), vec!["runtime", "app"]);
    assert_eq!(
        outcome.result("app"),
        Some(&ExecutionResult {
            status: ExecutionStatus::Canceled,
            code: Error::Cancelled(String::new()).code(),
            retries: 0,
        })
    );
    assert_eq!(outcome.result("runtime").unwrap().status, ExecutionStatus::Success);
    assert_eq!(outcome.rolled_back, vec!["runtime"]);
}

#[test]
fn test_cancel_requested_before_apply_is_honoured() {
    let cache = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::new());
    let callbacks = Arc::new(RecordingCallbacks::new());
    let engine = engine(&cache, &backend, &callbacks);

    let mut session = engine.open(bundle(vec![exe("app")])).unwrap();
    planned(&engine, &mut session, BundleAction::Install);
    engine.cancel_token().cancel();
    let outcome = engine.apply(&mut session).unwrap();

    assert_eq!(outcome.state, ApplyState::Canceled);
    assert!(backend.executed().is_empty());
    assert!(outcome.results.is_empty());

    // The request was consumed; the next run goes ahead
    assert!(!engine.cancel_token().is_cancelled());
    planned(&engine, &mut session, BundleAction::Install);
    assert!(engine.apply(&mut session).unwrap().is_success());
    assert_eq!(backend.executed(), vec!["app"]);
}

/// Leaves a directory where the payload file should be
struct DirectorySource;

impl PayloadSource for DirectorySource {
    fn name(&self) -> &str {
        "directory"
    }

    fn acquire(&self, request: &AcquireRequest<'_>, _progress: &dyn Fn(u64, u64)) -> corral::Result<bool> {
        std::fs::create_dir_all(request.destination)?;
        Ok(true)
    }
}

#[test]
fn test_unremovable_rejected_payload_stops_source_chain() {
    let cache = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::new());
    let callbacks = Arc::new(RecordingCallbacks::new());
    let fallback = Arc::new(MemorySource::new().with_payload("setup", b"setup"));
    let sources: Vec<Arc<dyn PayloadSource>> = vec![Arc::new(DirectorySource), fallback.clone()];
    let engine = engine(&cache, &backend, &callbacks).with_sources(sources);

    let mut setup = payload("setup", 5);
    setup.hash = Some(hash_bytes(HashAlgorithm::Sha256, b"setup"));
    let mut session = engine
        .open(bundle(vec![with_payload(exe("app"), setup)]))
        .unwrap();
    planned(&engine, &mut session, BundleAction::Install);
    let outcome = engine.apply(&mut session).unwrap();

    assert_eq!(outcome.state, ApplyState::Failed);
    assert!(outcome.error.unwrap().contains("cannot remove rejected file"));
    assert_eq!(fallback.attempts(), 0);
    assert!(backend.executed().is_empty());
}
