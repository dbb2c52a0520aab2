// src/variables/mod.rs

//! Typed variable store
//!
//! Variables live in four namespaces (string, numeric, version, secure
//! string). Built-in variables are created by the engine at session start
//! and cannot be changed from outside; everything else may be set by
//! detection, the policy layer, or command-line input.
//!
//! Each namespace is guarded by its own `RwLock`, so writes are serialized
//! per namespace while detection workers read concurrently. Formatting and
//! condition evaluation take a [`Snapshot`] holding read guards on every
//! namespace, so a single evaluation never observes a half-applied update.

mod condition;
mod format;
mod value;

pub use condition::{CompareOp, Condition};
pub use value::{Namespace, REDACTED, SecretString, Value};

use crate::error::{Error, Result};
use crate::version::Version;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard};
use tracing::debug;

/// Names of the variables the engine owns
pub mod builtin {
    pub const BUNDLE_NAME: &str = "BundleName";
    pub const BUNDLE_VERSION: &str = "BundleVersion";
    pub const BUNDLE_PER_MACHINE: &str = "BundlePerMachine";
    pub const BUNDLE_INSTALLED: &str = "BundleInstalled";
    pub const BUNDLE_ACTION: &str = "BundleAction";
    pub const PRIVILEGED: &str = "Privileged";
    pub const SESSION_ID: &str = "SessionId";
    pub const PROCESSOR_COUNT: &str = "ProcessorCount";
    pub const CACHE_ROOT: &str = "CacheRoot";
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    builtin: bool,
}

type Table = HashMap<String, Entry>;

/// Shared, thread-safe variable store
#[derive(Debug, Default)]
pub struct VariableStore {
    tables: [RwLock<Table>; 4],
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self, namespace: Namespace) -> RwLockReadGuard<'_, Table> {
        self.tables[namespace.index()]
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a variable from a specific namespace
    ///
    /// Fails with `TypeMismatch` when the name only exists in another
    /// namespace, and with `NotFound` when it exists nowhere.
    pub fn get(&self, namespace: Namespace, name: &str) -> Result<Value> {
        if let Some(entry) = self.read(namespace).get(name) {
            return Ok(entry.value.clone());
        }

        for other in Namespace::SEARCH_ORDER {
            if other != namespace && self.read(other).contains_key(name) {
                return Err(Error::TypeMismatch {
                    name: name.to_string(),
                    expected: namespace,
                    actual: other,
                });
            }
        }

        Err(Error::NotFound(name.to_string()))
    }

    pub fn get_string(&self, name: &str) -> Result<String> {
        match self.get(Namespace::String, name)? {
            Value::String(s) => Ok(s),
            other => Err(mismatch(name, Namespace::String, &other)),
        }
    }

    pub fn get_numeric(&self, name: &str) -> Result<i64> {
        match self.get(Namespace::Numeric, name)? {
            Value::Numeric(n) => Ok(n),
            other => Err(mismatch(name, Namespace::Numeric, &other)),
        }
    }

    pub fn get_version(&self, name: &str) -> Result<Version> {
        match self.get(Namespace::Version, name)? {
            Value::Version(v) => Ok(v),
            other => Err(mismatch(name, Namespace::Version, &other)),
        }
    }

    pub fn get_secure(&self, name: &str) -> Result<SecretString> {
        match self.get(Namespace::SecureString, name)? {
            Value::SecureString(s) => Ok(s),
            other => Err(mismatch(name, Namespace::SecureString, &other)),
        }
    }

    /// Set a user variable, overwriting any previous value
    pub fn set(&self, namespace: Namespace, name: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        if value.namespace() != namespace {
            return Err(mismatch(name, namespace, &value));
        }
        if self.is_builtin(name) {
            return Err(Error::Immutable(name.to_string()));
        }
        self.write_entry(namespace, name, value, false);
        Ok(())
    }

    /// Set a built-in variable. Only the engine writes built-ins.
    pub(crate) fn set_builtin(&self, name: &str, value: impl Into<Value>) {
        let value = value.into();
        let namespace = value.namespace();
        self.write_entry(namespace, name, value, true);
    }

    fn write_entry(&self, namespace: Namespace, name: &str, value: Value, builtin: bool) {
        debug!("set {} variable {} = {}", namespace, name, value);
        let mut table = self.tables[namespace.index()]
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        table.insert(name.to_string(), Entry { value, builtin });
    }

    /// Whether a variable exists in the namespace. Never fails.
    pub fn contains(&self, namespace: Namespace, name: &str) -> bool {
        self.read(namespace).contains_key(name)
    }

    /// Whether the name is a built-in in any namespace
    pub fn is_builtin(&self, name: &str) -> bool {
        Namespace::SEARCH_ORDER
            .iter()
            .any(|ns| self.read(*ns).get(name).is_some_and(|e| e.builtin))
    }

    /// Sorted variable names within a namespace
    pub fn names(&self, namespace: Namespace) -> Vec<String> {
        let mut names: Vec<String> = self.read(namespace).keys().cloned().collect();
        names.sort();
        names
    }

    /// Consistent read view across all namespaces
    pub fn snapshot(&self) -> Snapshot<'_> {
        Snapshot {
            tables: [
                self.read(Namespace::String),
                self.read(Namespace::Numeric),
                self.read(Namespace::Version),
                self.read(Namespace::SecureString),
            ],
        }
    }

    /// Substitute `[Name]` tokens in a template
    pub fn format(&self, template: &str) -> Result<String> {
        format::format_template(template, &self.snapshot(), false)
    }

    /// Like [`format`](Self::format) but secure values render as the mask,
    /// suitable for logs
    pub fn format_obscured(&self, template: &str) -> Result<String> {
        format::format_template(template, &self.snapshot(), true)
    }

    /// Parse and evaluate a condition expression
    pub fn evaluate(&self, condition: &str) -> Result<bool> {
        let parsed = Condition::parse(condition)?;
        Ok(parsed.evaluate(&self.snapshot()))
    }
}

fn mismatch(name: &str, expected: Namespace, value: &Value) -> Error {
    Error::TypeMismatch {
        name: name.to_string(),
        expected,
        actual: value.namespace(),
    }
}

/// Read guards over every namespace, taken in a fixed order
pub struct Snapshot<'a> {
    tables: [RwLockReadGuard<'a, Table>; 4],
}

impl Snapshot<'_> {
    /// Resolve a name in namespace search order
    pub fn lookup(&self, name: &str) -> Option<&Value> {
        Namespace::SEARCH_ORDER
            .iter()
            .find_map(|ns| self.tables[ns.index()].get(name))
            .map(|e| &e.value)
    }
}
