//! Plugin references, the plugin capability trait and resolution.
//!
//! A step's `uses` value names one of three kinds of plugin:
//!
//! - a built-in registered in the [`PluginRegistry`],
//! - a local directory (`./deploy`, `/opt/plugins/notify`, `~/plugins/x`),
//! - a remote `name@version` fetched into the cache by the [`PluginManager`].
//!
//! Local and remote plugins are directories holding a `main.lua` entry script
//! and a `manifest.yml` describing the arguments they accept; both run through
//! [`ScriptPlugin`].

mod git;
mod manager;
mod registry;
mod script_plugin;

use std::path::PathBuf;

use anyhow::Result;
use stepline_util::{SharedEnv, expand_tilde};
use thiserror::Error;

use crate::runnable::{RunnableContext, RunnableResult};

pub use git::GitOps;
pub use manager::{MAIN_FILE, MANIFEST_FILE, PluginManager, PluginMetadata, PluginSource};
pub use registry::{PluginFactory, PluginRegistry};
pub use script_plugin::ScriptPlugin;

/// Version recorded for plugins resolved from a local directory.
pub const LOCAL_VERSION: &str = "local";

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin '{name}': version is not specified")]
    VersionNotSpecified { name: String },
    #[error("invalid plugin reference '{value}': {message}")]
    InvalidReference { value: String, message: String },
    #[error("plugin '{name}' is not supported")]
    NotRegistered { name: String },
    #[error("plugin path {} is not a directory", path.display())]
    NotADirectory { path: PathBuf },
    #[error("plugin '{name}' is missing {file} in {}", path.display())]
    MissingFile { name: String, file: &'static str, path: PathBuf },
    #[error("cannot fetch plugin '{name}': no plugin repository is configured")]
    RepositoryNotConfigured { name: String },
    #[error("invalid plugin repository URL '{url}': {message}")]
    InvalidRepository { url: String, message: String },
    #[error("failed to fetch plugin '{name}@{version}': {message}")]
    Git { name: String, version: String, message: String },
    #[error("failed to lock {}: {source}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid plugin manifest {}: {message}", path.display())]
    Manifest { path: PathBuf, message: String },
}

/// Parsed form of a step's `uses` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginRef {
    Builtin { name: String },
    Local { name: String, path: PathBuf },
    Remote { name: String, version: String },
}

impl PluginRef {
    pub fn parse(value: &str) -> Result<Self, PluginError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(PluginError::InvalidReference {
                value: value.to_string(),
                message: "empty plugin reference".to_string(),
            });
        }

        if ["./", "../", "/", "~"].iter().any(|prefix| value.starts_with(prefix)) {
            let path = expand_tilde(value);
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .ok_or_else(|| PluginError::InvalidReference {
                    value: value.to_string(),
                    message: "local plugin path has no final component".to_string(),
                })?;
            return Ok(PluginRef::Local { name, path });
        }

        if let Some((name, version)) = value.split_once('@') {
            let name = name.trim();
            if name.is_empty() {
                return Err(PluginError::InvalidReference {
                    value: value.to_string(),
                    message: "missing plugin name".to_string(),
                });
            }
            let version = version.trim();
            if version.is_empty() {
                return Err(PluginError::VersionNotSpecified { name: name.to_string() });
            }
            return Ok(PluginRef::Remote {
                name: name.to_string(),
                version: version.to_string(),
            });
        }

        Ok(PluginRef::Builtin { name: value.to_string() })
    }

    pub fn name(&self) -> &str {
        match self {
            PluginRef::Builtin { name } | PluginRef::Local { name, .. } | PluginRef::Remote { name, .. } => name,
        }
    }
}

/// Step logic provided by a plugin.
///
/// The lifecycle mirrors the one of a step: `resolve` locates the code,
/// `compile` prepares it, `preflight_check` validates configuration against
/// the environment and `run` executes it.
pub trait Plugin: Send {
    fn name(&self) -> &str;

    fn resolve(&mut self, ctx: &mut RunnableContext) -> Result<()>;

    fn compile(&mut self, ctx: &mut RunnableContext) -> Result<()>;

    /// True while the plugin still has to be resolved or compiled.
    fn needs_compile(&self) -> bool;

    fn preflight_check(&self, env: &SharedEnv, args: &SharedEnv, ctx: &mut RunnableContext) -> Result<()>;

    fn run(&mut self, env: &SharedEnv, ctx: &mut RunnableContext) -> RunnableResult;
}
