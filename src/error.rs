// src/error.rs

//! Crate-wide error type
//!
//! Every failure the engine can surface is a variant here. Each variant maps to
//! a stable status code (see [`Error::code`]) that is reported through the
//! callback protocol and recorded in execution results.

use thiserror::Error;

use crate::variables::Namespace;

/// Result type used throughout corral
pub type Result<T> = std::result::Result<T, Error>;

/// Status code reported for a successful phase or package
pub const STATUS_SUCCESS: i32 = 0;

/// Errors produced by the engine
#[derive(Error, Debug)]
pub enum Error {
    /// Variable lookup failed
    #[error("variable '{0}' not found")]
    NotFound(String),

    /// Variable exists but in a different namespace, or value type does not
    /// match the namespace it is written to
    #[error("variable '{name}' is {actual}, not {expected}")]
    TypeMismatch {
        name: String,
        expected: Namespace,
        actual: Namespace,
    },

    /// Attempt to overwrite a built-in variable from outside the engine
    #[error("variable '{0}' is built-in and cannot be changed")]
    Immutable(String),

    /// Template formatting failed (unresolved token or malformed bracket)
    #[error("cannot format '{template}': {reason}")]
    FormatError { template: String, reason: String },

    /// Malformed condition expression
    #[error("condition syntax error at offset {position} in '{condition}': {message}")]
    ConditionSyntax {
        condition: String,
        position: usize,
        message: String,
    },

    /// Package type has no facade or backend
    #[error("unknown or unsupported package type for '{package}': {package_type}")]
    UnknownPackageType {
        package: String,
        package_type: String,
    },

    /// Requested state cannot be honoured for this package
    #[error("invalid requested state for '{package}': {reason}")]
    InvalidRequestedState { package: String, reason: String },

    /// Per-package detection failed
    #[error("detection of '{package}' failed: {reason}")]
    DetectionFailure {
        package: String,
        reason: String,
        /// Non-recoverable failures (e.g. corrupted local state) fail the phase
        fatal: bool,
    },

    /// Payload could not be acquired from any source
    #[error("cannot acquire payload '{payload}' for '{package}': {reason}")]
    CacheAcquisitionFailure {
        package: String,
        payload: String,
        reason: String,
    },

    /// Target files are in use by other processes
    #[error("files in use while executing '{package}': {}", .files.join(", "))]
    FilesInUse { package: String, files: Vec<String> },

    /// Package execution failed
    #[error("execution of '{package}' failed with code {code}: {reason}")]
    ExecuteFailure {
        package: String,
        code: i32,
        reason: String,
    },

    /// Elevation was refused for a per-machine action
    #[error("elevation denied for '{0}'")]
    ElevationDenied(String),

    /// Cooperative cancellation was honoured
    #[error("operation cancelled during {0}")]
    Cancelled(String),

    /// Operation requested in the wrong session phase
    #[error("cannot {operation} while session is {phase}")]
    InvalidPhase { operation: String, phase: String },

    /// Dependency declarations form a cycle
    #[error("circular package dependency: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    /// A package depends on an id that is not part of the bundle
    #[error("package '{package}' depends on unknown package '{dependency}'")]
    UnknownDependency { package: String, dependency: String },

    /// Version string could not be parsed
    #[error("invalid version '{0}'")]
    InvalidVersion(String),

    /// Payload content does not match its declared hash
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// Network transfer failed
    #[error("download error: {0}")]
    DownloadError(String),

    /// Configuration is invalid
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Session lock could not be acquired
    #[error("lock error: {0}")]
    LockError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Stable hresult-like status code for this error
    pub fn code(&self) -> i32 {
        match self {
            Self::NotFound(_) => 0x8007_0490_u32 as i32,
            Self::TypeMismatch { .. } => 0x8002_0005_u32 as i32,
            Self::Immutable(_) => 0x8007_0005_u32 as i32,
            Self::FormatError { .. } => 0x8007_000D_u32 as i32,
            Self::ConditionSyntax { .. } => 0x8007_000D_u32 as i32,
            Self::UnknownPackageType { .. } => 0x8007_0032_u32 as i32,
            Self::InvalidRequestedState { .. } => 0x8007_0057_u32 as i32,
            Self::DetectionFailure { .. } => 0x8007_054F_u32 as i32,
            Self::CacheAcquisitionFailure { .. } => 0x8007_0002_u32 as i32,
            Self::FilesInUse { .. } => 0x8007_0020_u32 as i32,
            Self::ExecuteFailure { code, .. } => *code,
            Self::ElevationDenied(_) => 0x8007_02E4_u32 as i32,
            Self::Cancelled(_) => 0x8007_04C7_u32 as i32,
            Self::InvalidPhase { .. } => 0x8007_139F_u32 as i32,
            Self::DependencyCycle(_) | Self::UnknownDependency { .. } => 0x8007_065B_u32 as i32,
            Self::InvalidVersion(_) => 0x8007_000D_u32 as i32,
            Self::ChecksumMismatch { .. } => 0x8009_6004_u32 as i32,
            Self::DownloadError(_) => 0x8007_2EFD_u32 as i32,
            Self::ConfigError(_) | Self::Toml(_) | Self::Json(_) => 0x8007_000D_u32 as i32,
            Self::LockError(_) => 0x8007_0021_u32 as i32,
            Self::Io(_) => 0x8007_001F_u32 as i32,
        }
    }

    /// Whether this failure may be retried under policy control
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::FilesInUse { .. } | Self::CacheAcquisitionFailure { .. }
        )
    }

    /// Whether this is a cooperative cancellation rather than a fault
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}
