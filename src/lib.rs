// src/lib.rs

//! Corral bundle engine
//!
//! Orchestrates installation bundles: a set of packages of different
//! installer technologies installed, repaired, modified, or removed as one
//! unit.
//!
//! # Architecture
//!
//! - Detect: installed state of the bundle, related bundles, and every package
//! - Plan: per-package actions in dependency order, grouped into rollback boundaries
//! - Apply: cache payloads concurrently, execute actions sequentially, roll back on failure
//! - A policy layer observes and steers every phase through [`EngineCallbacks`]
//! - Technology mechanics live in pluggable [`PackageBackend`]s

pub mod apply;
pub mod backend;
pub mod bundle;
pub mod callbacks;
pub mod cancel;
pub mod config;
pub mod detect;
mod error;
pub mod hash;
pub mod plan;
pub mod progress;
pub mod session;
pub mod variables;
pub mod version;

pub use apply::{ApplyOutcome, ApplyState, ElevationPolicy, Elevator, ExecutionResult, PayloadSource};
pub use backend::{BackendRegistry, CommandBackend, PackageBackend, RestartState};
pub use bundle::{Action, Bundle, BundleAction, Facade, Package, PackageState, PackageType, RequestState};
pub use callbacks::{EngineCallbacks, LoggingCallbacks, NoopCallbacks};
pub use cancel::CancelToken;
pub use config::EngineConfig;
pub use detect::{DetectOptions, DetectionReport};
pub use error::{Error, Result, STATUS_SUCCESS};
pub use plan::{Plan, PlanEntry, PlanOverrides};
pub use session::{Engine, Session};
pub use variables::{Namespace, Value, VariableStore};
pub use version::Version;
