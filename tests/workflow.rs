// tests/workflow.rs

//! Whole-session workflows: variables, manifest loading, install then
//! uninstall, and phase and lock discipline.

mod common;

use common::{bundle, config, exe, FakeBackend, RecordingCallbacks};
use corral::hash::{hash_bytes, HashAlgorithm};
use corral::plan::PlanOverrides;
use corral::session::SessionLock;
use corral::variables::{builtin, SecretString};
use corral::{
    ApplyState, BackendRegistry, Bundle, BundleAction, DetectOptions, Engine, Error, Namespace,
    PackageBackend, PackageState, PackageType, Value, VariableStore, Version,
};
use std::fs;
use std::sync::Arc;

#[test]
fn test_variables_round_trip_in_every_namespace() {
    let store = VariableStore::new();
    let values = [
        ("Folder", Namespace::String, Value::from("C:/Suite")),
        ("Answer", Namespace::Numeric, Value::from(42)),
        ("Target", Namespace::Version, Value::from(Version::parse("1.2.3.4").unwrap())),
        ("Password", Namespace::SecureString, Value::SecureString(SecretString::new("hunter2"))),
    ];

    for (name, namespace, value) in values {
        store.set(namespace, name, value.clone()).unwrap();
        assert_eq!(store.get(namespace, name).unwrap(), value);
    }

    // Overwrites replace the previous value
    store.set(Namespace::Numeric, "Answer", 7).unwrap();
    assert_eq!(store.get_numeric("Answer").unwrap(), 7);

    // Reading through the wrong namespace is a type mismatch
    assert!(matches!(
        store.get(Namespace::Numeric, "Folder"),
        Err(Error::TypeMismatch { .. })
    ));
    assert!(matches!(
        store.get(Namespace::String, "Missing"),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn test_builtins_are_immutable() {
    let cache = tempfile::tempdir().unwrap();
    let backend: Arc<dyn PackageBackend> = Arc::new(FakeBackend::new());
    let engine = Engine::new(config(&cache), BackendRegistry::new().with(PackageType::Exe, backend)).unwrap();
    let session = engine.open(bundle(vec![exe("app")])).unwrap();
    let variables = session.variables();

    assert_eq!(variables.get_string(builtin::BUNDLE_NAME).unwrap(), "Suite");
    for name in [builtin::BUNDLE_NAME, builtin::SESSION_ID, builtin::CACHE_ROOT] {
        let err = variables.set(Namespace::String, name, "hijack").unwrap_err();
        assert!(matches!(err, Error::Immutable(_)), "{name}: {err}");
    }
    let err = variables
        .set(Namespace::Numeric, builtin::PRIVILEGED, 1)
        .unwrap_err();
    assert!(matches!(err, Error::Immutable(_)));
    assert_eq!(variables.get_numeric(builtin::PRIVILEGED).unwrap(), 0);
}

#[test]
fn test_format_tokens() {
    let store = VariableStore::new();
    assert!(matches!(store.format("[Foo]"), Err(Error::FormatError { .. })));

    store.set(Namespace::String, "Foo", "bar").unwrap();
    assert_eq!(store.format("[Foo]").unwrap(), "bar");
    assert_eq!(store.format("/dir=[Foo] [\\[]x[\\]]").unwrap(), "/dir=bar [x]");
}

const MANIFEST: &str = r#"
name = "Suite"
version = "2.0.0"
upgrade_code = "suite"

[[variables]]
name = "InstallFolder"
value = "/opt/suite"

[[package]]
id = "runtime"
type = "exe"
[package.exe]
install_arguments = "/quiet"
uninstall_arguments = "/uninstall"

[[package.payloads]]
id = "runtime-setup"
file_name = "runtime.bin"
size = 7
hash = "HASH"

[[package]]
id = "app"
type = "exe"
depends_on = ["runtime"]
[package.exe]
install_arguments = "/dir=[InstallFolder]"
uninstall_arguments = "/uninstall"
"#;

#[test]
fn test_install_then_uninstall_from_manifest() {
    let layout = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();

    let payload = b"runtime";
    let hash = hash_bytes(HashAlgorithm::Sha256, payload).to_prefixed_string();
    fs::write(layout.path().join("runtime.bin"), payload).unwrap();
    let manifest = layout.path().join("suite.toml");
    fs::write(&manifest, MANIFEST.replace("HASH", &hash)).unwrap();

    let backend = Arc::new(FakeBackend::new());
    let shared: Arc<dyn PackageBackend> = backend.clone();
    let callbacks = Arc::new(RecordingCallbacks::new());
    // Default source chain: the payload comes from the layout directory
    let engine = Engine::new(config(&cache), BackendRegistry::new().with(PackageType::Exe, shared))
        .unwrap()
        .with_callbacks(callbacks.clone());

    let loaded = Bundle::load(&manifest).unwrap();
    assert_eq!(loaded.layout_dir.as_deref(), Some(layout.path()));
    let mut session = engine.open(loaded).unwrap();
    assert_eq!(
        session.variables().get_string("InstallFolder").unwrap(),
        "/opt/suite"
    );

    let outcome = engine
        .run(&mut session, BundleAction::Install, &PlanOverrides::default(), DetectOptions::default())
        .unwrap();
    assert!(outcome.is_success(), "{:?}", outcome.error);
    assert_eq!(backend.executed(), vec!["runtime", "app"]);
    assert_eq!(
        fs::read(cache.path().join("runtime").join("runtime.bin")).unwrap(),
        payload
    );

    // A fresh detection sees the installed packages and the cached payload
    let report = engine.detect(&mut session, DetectOptions::default()).unwrap();
    assert!(report
        .packages
        .iter()
        .all(|p| p.state == Some(PackageState::Present)));
    assert!(report.packages.iter().find(|p| p.package_id == "runtime").unwrap().cached);

    let plan = engine
        .plan(&mut session, BundleAction::Uninstall, &PlanOverrides::default())
        .unwrap();
    assert_eq!(plan.execution_order(), vec!["app", "runtime"]);
    let outcome = engine.apply(&mut session).unwrap();
    assert!(outcome.is_success(), "{:?}", outcome.error);
    assert_eq!(backend.state("app"), PackageState::Absent);
    assert_eq!(backend.state("runtime"), PackageState::Absent);
}

#[test]
fn test_corrupt_layout_payload_is_rejected() {
    let layout = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();

    let hash = hash_bytes(HashAlgorithm::Sha256, b"runtime").to_prefixed_string();
    fs::write(layout.path().join("runtime.bin"), b"tampered").unwrap();
    let manifest = layout.path().join("suite.toml");
    fs::write(&manifest, MANIFEST.replace("HASH", &hash)).unwrap();

    let backend = Arc::new(FakeBackend::new());
    let shared: Arc<dyn PackageBackend> = backend.clone();
    let engine = Engine::new(config(&cache), BackendRegistry::new().with(PackageType::Exe, shared)).unwrap();

    let mut session = engine.open(Bundle::load(&manifest).unwrap()).unwrap();
    let outcome = engine
        .run(&mut session, BundleAction::Install, &PlanOverrides::default(), DetectOptions::default())
        .unwrap();

    assert_eq!(outcome.state, ApplyState::Failed);
    assert!(backend.executed().is_empty());
    assert!(!cache.path().join("runtime").join("runtime.bin").exists());
}

#[test]
fn test_phase_order_is_enforced() {
    let cache = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::new());
    let callbacks = Arc::new(RecordingCallbacks::new());
    let engine = common::engine(&cache, &backend, &callbacks);

    let mut session = engine.open(bundle(vec![exe("app")])).unwrap();
    assert!(matches!(
        engine.apply(&mut session),
        Err(Error::InvalidPhase { .. })
    ));

    engine.detect(&mut session, DetectOptions::default()).unwrap();
    engine
        .plan(&mut session, BundleAction::Install, &PlanOverrides::default())
        .unwrap();
    engine.apply(&mut session).unwrap();

    // A finished apply needs a new detect and plan before the next one
    assert!(matches!(
        engine.apply(&mut session),
        Err(Error::InvalidPhase { .. })
    ));
    engine.detect(&mut session, DetectOptions::default()).unwrap();
    assert!(session.plan().is_none());
    assert_eq!(session.apply_state(), ApplyState::Idle);
}

#[test]
fn test_apply_waits_for_session_lock() {
    let cache = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::new());
    let callbacks = Arc::new(RecordingCallbacks::new());
    let engine = common::engine(&cache, &backend, &callbacks);

    let mut session = engine.open(bundle(vec![exe("app")])).unwrap();
    engine.detect(&mut session, DetectOptions::default()).unwrap();
    engine
        .plan(&mut session, BundleAction::Install, &PlanOverrides::default())
        .unwrap();

    let held = SessionLock::acquire(cache.path(), 1).unwrap();
    assert!(matches!(
        engine.apply(&mut session),
        Err(Error::LockError(_))
    ));
    assert!(backend.executed().is_empty());

    drop(held);
    let outcome = engine.apply(&mut session).unwrap();
    assert!(outcome.is_success());
}
