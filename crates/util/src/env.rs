//! Layered environment scopes.
//!
//! Variable lookup during a run goes through a chain of scopes. Each scope
//! answers from its own overlay first and delegates to its parent otherwise:
//!
//! - [`OsEnv`] is the read-only root backed by the process environment.
//! - [`ScopedEnv`] holds a local overlay and an optional parent; writes land in
//!   the overlay only.
//! - [`WriteThroughEnv`] reads like a [`ScopedEnv`] but routes every write to a
//!   designated ancestor, so a step can publish a value that later steps and
//!   jobs sharing that ancestor can see.
//!
//! Scopes are shared through [`SharedEnv`] because several children commonly
//! delegate to the same parent.

use std::env;
use std::sync::Arc;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::{Captures, Regex};
use thiserror::Error;
use tracing::debug;

/// Shared handle to any environment scope.
pub type SharedEnv = Arc<dyn Env>;

/// Matches `${NAME}` and `$NAME`. `${{` never matches because `{` cannot start a name.
static VARIABLE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))").expect("variable pattern is valid"));

/// Errors raised by environment scopes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvError {
    /// Attempted to write into a read-only scope.
    #[error("cannot set '{key}': environment scope is read-only")]
    ReadOnly { key: String },
}

/// Capability set shared by every environment scope.
pub trait Env: Send + Sync {
    /// Look up a variable, delegating to ancestors when absent locally.
    fn get(&self, key: &str) -> Option<String>;

    /// Store a variable in the scope this implementation writes to.
    fn set(&self, key: &str, value: &str) -> Result<(), EnvError>;

    /// Flattened view of every visible variable; nearer scopes win.
    fn get_all(&self) -> IndexMap<String, String>;

    fn set_all(&self, values: &IndexMap<String, String>) -> Result<(), EnvError> {
        for (key, value) in values {
            self.set(key, value)?;
        }
        Ok(())
    }

    fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Substitute `${NAME}` / `$NAME` references using [`Env::get`].
    ///
    /// Unknown names expand to the empty string, matching shell behaviour.
    fn expand(&self, input: &str) -> String {
        expand_variables(input, |key| self.get(key))
    }
}

/// Substitute `${NAME}` / `$NAME` references in `input` using `lookup`.
pub fn expand_variables(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    if !input.contains('$') {
        return input.to_string();
    }
    VARIABLE_PATTERN
        .replace_all(input, |captures: &Captures| {
            let name = captures.get(1).or_else(|| captures.get(2)).map(|m| m.as_str()).unwrap_or_default();
            lookup(name).unwrap_or_default()
        })
        .into_owned()
}

/// Read-only root scope over the process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsEnv;

impl OsEnv {
    pub fn shared() -> SharedEnv {
        Arc::new(OsEnv)
    }
}

impl Env for OsEnv {
    fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn set(&self, key: &str, _value: &str) -> Result<(), EnvError> {
        Err(EnvError::ReadOnly { key: key.to_string() })
    }

    fn get_all(&self) -> IndexMap<String, String> {
        env::vars_os()
            .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
            .collect()
    }
}

/// Read/write scope with a local overlay and an optional parent.
pub struct ScopedEnv {
    values: RwLock<IndexMap<String, String>>,
    parent: Option<SharedEnv>,
}

impl ScopedEnv {
    pub fn new(parent: SharedEnv) -> Self {
        Self::with_values(IndexMap::new(), Some(parent))
    }

    /// A scope with no parent, such as the caller-supplied argument scope.
    pub fn detached(values: IndexMap<String, String>) -> Self {
        Self::with_values(values, None)
    }

    pub fn with_values(values: IndexMap<String, String>, parent: Option<SharedEnv>) -> Self {
        Self {
            values: RwLock::new(values),
            parent,
        }
    }

    pub fn into_shared(self) -> SharedEnv {
        Arc::new(self)
    }
}

impl Env for ScopedEnv {
    fn get(&self, key: &str) -> Option<String> {
        if let Some(value) = self.values.read().get(key) {
            return Some(value.clone());
        }
        self.parent.as_ref().and_then(|parent| parent.get(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), EnvError> {
        self.values.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get_all(&self) -> IndexMap<String, String> {
        let mut merged = self.parent.as_ref().map(|parent| parent.get_all()).unwrap_or_default();
        for (key, value) in self.values.read().iter() {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }
}

/// Scope that reads through `read_scope` but writes into `write_target`.
///
/// `write_target` is expected to be an ancestor of `read_scope`, which makes a
/// published value visible on the next read unless the local overlay shadows it.
pub struct WriteThroughEnv {
    read_scope: ScopedEnv,
    write_target: SharedEnv,
}

impl WriteThroughEnv {
    pub fn new(values: IndexMap<String, String>, parent: SharedEnv, write_target: SharedEnv) -> Self {
        Self {
            read_scope: ScopedEnv::with_values(values, Some(parent)),
            write_target,
        }
    }

    pub fn into_shared(self) -> SharedEnv {
        Arc::new(self)
    }
}

impl Env for WriteThroughEnv {
    fn get(&self, key: &str) -> Option<String> {
        self.read_scope.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), EnvError> {
        debug!(key = %key, "publishing variable to ancestor scope");
        self.write_target.set(key, value)
    }

    fn get_all(&self) -> IndexMap<String, String> {
        self.read_scope.get_all()
    }
}
