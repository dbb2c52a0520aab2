// src/commands/mod.rs
//! Command handlers for the corral CLI

mod console;

pub use console::ConsoleCallbacks;

use crate::cli::{PlanArgs, SessionArgs};
use anyhow::{bail, Context, Result};
use corral::bundle::FeatureState;
use corral::detect::{DetectOptions, FeedUpdateSource};
use corral::plan::{Plan, PlanOverrides};
use corral::{
    BackendRegistry, Bundle, BundleAction, CommandBackend, Engine, EngineConfig, LoggingCallbacks,
    Namespace, PackageType, RequestState, Session, VariableStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Split `NAME=VALUE`
fn parse_assignment(text: &str) -> Result<(&str, &str)> {
    match text.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => Ok((name.trim(), value)),
        _ => bail!("expected NAME=VALUE, got '{}'", text),
    }
}

fn set_variables(store: &VariableStore, assignments: &[String]) -> Result<()> {
    for assignment in assignments {
        let (name, value) = parse_assignment(assignment)?;
        store
            .set(Namespace::String, name, value)
            .with_context(|| format!("cannot set {}", name))?;
    }
    Ok(())
}

fn load_config(args: &SessionArgs) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(root) = &args.cache_root {
        config = config.with_cache_root(root);
    }
    Ok(config)
}

fn backends(config: &EngineConfig, launcher: Option<&PathBuf>) -> BackendRegistry {
    let mut exe = CommandBackend::new(config.execute_timeout());
    if let Some(launcher) = launcher {
        exe = exe.with_launcher(launcher);
    }
    BackendRegistry::new().with(PackageType::Exe, Arc::new(exe))
}

fn open_session(engine: &Engine, args: &SessionArgs) -> Result<Session> {
    let bundle = Bundle::load(&args.bundle)
        .with_context(|| format!("failed to load bundle {}", args.bundle.display()))?;
    let session = engine.open(bundle)?;
    set_variables(session.variables(), &args.variables)?;
    Ok(session)
}

fn parse_overrides(plan: &PlanArgs) -> Result<(BundleAction, PlanOverrides)> {
    let action: BundleAction = plan
        .action
        .parse()
        .map_err(|_| anyhow::anyhow!("unknown action '{}'", plan.action))?;

    let mut overrides = PlanOverrides::default();
    for request in &plan.requests {
        let (package, state) = parse_assignment(request)?;
        let state: RequestState = state
            .parse()
            .map_err(|_| anyhow::anyhow!("unknown request state '{}'", state))?;
        overrides = overrides.package(package, state);
    }
    for feature in &plan.features {
        let (target, state) = parse_assignment(feature)?;
        let Some((package, feature)) = target.split_once(':') else {
            bail!("expected PACKAGE:FEATURE=STATE, got '{}'", feature);
        };
        let state = match state.to_ascii_lowercase().as_str() {
            "local" => FeatureState::Local,
            "absent" => FeatureState::Absent,
            other => bail!("unknown feature state '{}'", other),
        };
        overrides = overrides.feature(package, feature, state);
    }
    Ok((action, overrides))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_plan(plan: &Plan) {
    println!("Plan: {} ({} actions)", plan.action, plan.action_count());
    for entry in &plan.entries {
        let current = entry
            .current
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        println!(
            "  [{}] {:<24} {:<10} {:<9} -> {:<8} {}",
            entry.boundary,
            entry.package_id,
            entry.action,
            current,
            entry.requested,
            if entry.per_machine { "per-machine" } else { "per-user" }
        );
    }
}

/// `corral detect`
pub fn cmd_detect(args: &SessionArgs, check_updates: bool) -> Result<()> {
    let config = load_config(args)?;
    let mut engine = Engine::new(config.clone(), backends(&config, None))?
        .with_callbacks(Arc::new(LoggingCallbacks));
    if check_updates {
        engine = engine.with_update_source(Arc::new(FeedUpdateSource::new()?));
    }

    let mut session = open_session(&engine, args)?;
    let report = engine.detect(&mut session, DetectOptions { check_updates })?;

    if args.json {
        return print_json(&report);
    }

    let bundle = session.bundle();
    println!(
        "{} v{}: {}",
        bundle.name,
        bundle.version,
        if report.bundle_installed { "installed" } else { "not installed" }
    );
    for package in &report.packages {
        match (&package.state, &package.error) {
            (Some(state), _) => println!(
                "  {:<24} {:<8}{}",
                package.package_id,
                state,
                if package.cached { " (cached)" } else { "" }
            ),
            (None, Some(error)) => println!("  {:<24} failed: {}", package.package_id, error),
            (None, None) => println!("  {:<24} unknown", package.package_id),
        }
    }
    for related in &report.related {
        println!(
            "  related: {} v{} ({})",
            related.bundle_id, related.version, related.relation
        );
    }
    if check_updates {
        match (&report.update, &report.update_error) {
            (Some(update), _) => println!("Update available: v{} at {}", update.version, update.location),
            (None, Some(error)) => println!("Update check failed: {}", error),
            (None, None) => println!("No update available"),
        }
    }
    Ok(())
}

/// `corral plan`
pub fn cmd_plan(args: &SessionArgs, plan_args: &PlanArgs) -> Result<()> {
    let config = load_config(args)?;
    let engine = Engine::new(config.clone(), backends(&config, None))?
        .with_callbacks(Arc::new(LoggingCallbacks));
    let (action, overrides) = parse_overrides(plan_args)?;

    let mut session = open_session(&engine, args)?;
    engine.detect(&mut session, DetectOptions::default())?;
    let plan = engine.plan(&mut session, action, &overrides)?;

    if args.json {
        return print_json(&plan);
    }
    print_plan(&plan);
    Ok(())
}

/// `corral apply`
pub fn cmd_apply(
    args: &SessionArgs,
    plan_args: &PlanArgs,
    launcher: Option<&PathBuf>,
    files_in_use_retries: u32,
    show_progress: bool,
) -> Result<()> {
    let config = load_config(args)?;
    let console = Arc::new(ConsoleCallbacks::new(
        files_in_use_retries,
        show_progress && !args.json,
    ));
    let engine = Engine::new(config.clone(), backends(&config, launcher))?.with_callbacks(console);
    let (action, overrides) = parse_overrides(plan_args)?;

    let mut session = open_session(&engine, args)?;
    let outcome = engine.run(&mut session, action, &overrides, DetectOptions::default())?;

    if args.json {
        print_json(&outcome)?;
    } else {
        println!(
            "{} {}: {} (0x{:08x}), restart {}",
            action,
            session.bundle().name,
            outcome.state,
            outcome.status,
            outcome.restart
        );
        for warning in &outcome.rollback_warnings {
            println!("  warning: {}", warning);
        }
    }

    if !outcome.is_success() {
        bail!(
            "{}",
            outcome
                .error
                .unwrap_or_else(|| format!("apply ended {}", outcome.state))
        );
    }
    info!("Session {} finished", session.id());
    Ok(())
}

/// `corral eval`
pub fn cmd_eval(condition: &str, assignments: &[String]) -> Result<()> {
    let store = VariableStore::new();
    set_variables(&store, assignments)?;
    let result = store.evaluate(condition)?;
    println!("{}", result);
    Ok(())
}

/// `corral format`
pub fn cmd_format(template: &str, assignments: &[String]) -> Result<()> {
    let store = VariableStore::new();
    set_variables(&store, assignments)?;
    println!("{}", store.format(template)?);
    Ok(())
}
