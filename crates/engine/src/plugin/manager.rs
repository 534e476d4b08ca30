//! Versioned plugin resolution with a content-addressed checkout cache.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use stepline_types::PluginManifest;
use stepline_util::{FileLock, redact_sensitive};
use tracing::{debug, info};
use url::Url;

use super::{GitOps, PluginError};
use crate::config::EngineConfig;

pub const MAIN_FILE: &str = "main.lua";
pub const MANIFEST_FILE: &str = "manifest.yml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginSource {
    /// Directory supplied by the workflow author.
    Local,
    /// Checkout fetched into the cache; `lock_path` serializes fetches of the
    /// same `name@version` across processes.
    Remote { lock_path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginMetadata {
    pub name: String,
    pub version: String,
    pub path: PathBuf,
    pub main_path: PathBuf,
    pub manifest_path: PathBuf,
    pub source: PluginSource,
}

impl PluginMetadata {
    fn new(name: &str, version: &str, path: PathBuf, source: PluginSource) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            main_path: path.join(MAIN_FILE),
            manifest_path: path.join(MANIFEST_FILE),
            path,
            source,
        }
    }

    fn validate(&self) -> Result<(), PluginError> {
        for (file, path) in [(MAIN_FILE, &self.main_path), (MANIFEST_FILE, &self.manifest_path)] {
            if !path.is_file() {
                return Err(PluginError::MissingFile {
                    name: self.name.clone(),
                    file,
                    path: self.path.clone(),
                });
            }
        }
        Ok(())
    }

    /// Read and parse the plugin's `manifest.yml`.
    pub fn manifest(&self) -> Result<PluginManifest, PluginError> {
        let content = fs::read_to_string(&self.manifest_path).map_err(|source| PluginError::Io {
            path: self.manifest_path.clone(),
            source,
        })?;
        PluginManifest::from_yaml(&content).map_err(|error| PluginError::Manifest {
            path: self.manifest_path.clone(),
            message: error.to_string(),
        })
    }
}

/// Resolves plugins and memoizes them for the lifetime of the manager.
///
/// Remote plugins are keyed by `name@version`, local plugins by
/// `name@<canonical path>` so two directories sharing a final component stay
/// distinct.
#[derive(Debug)]
pub struct PluginManager {
    checkout_root: PathBuf,
    lock_root: PathBuf,
    repository: Option<String>,
    plugins: HashMap<String, Arc<PluginMetadata>>,
}

impl PluginManager {
    pub fn new(cache_dir: impl Into<PathBuf>, repository: Option<String>) -> Self {
        let config = EngineConfig {
            plugin_repository: repository,
            ..EngineConfig::default().with_cache_dir(cache_dir)
        };
        Self::from_config(&config)
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            checkout_root: config.plugin_cache_dir(),
            lock_root: config.lock_dir(),
            repository: config.plugin_repository.clone(),
            plugins: HashMap::new(),
        }
    }

    /// Resolve `name@version`, from `local_path` when given and from the
    /// plugin repository otherwise. Repeated calls return the cached entry.
    pub fn load_plugin(
        &mut self,
        name: &str,
        version: &str,
        token: Option<&str>,
        local_path: Option<&Path>,
    ) -> Result<Arc<PluginMetadata>, PluginError> {
        if version.trim().is_empty() {
            return Err(PluginError::VersionNotSpecified { name: name.to_string() });
        }
        let key = cache_key(name, version, local_path);
        if let Some(existing) = self.plugins.get(&key) {
            debug!(plugin = %key, "plugin cache hit");
            return Ok(Arc::clone(existing));
        }

        let metadata = match local_path {
            Some(path) => resolve_local(name, version, path)?,
            None => self.fetch_remote(name, version, token)?,
        };
        info!(plugin = %key, path = %metadata.path.display(), "plugin resolved");
        let metadata = Arc::new(metadata);
        self.plugins.insert(key, Arc::clone(&metadata));
        Ok(metadata)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Deterministic checkout directory for `name@version`.
    pub fn checkout_dir(&self, name: &str, version: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(format!("{name}@{version}").as_bytes()));
        self.checkout_root.join(format!("{}-{}", sanitize(name), &digest[..16]))
    }

    pub fn lock_path(&self, name: &str, version: &str) -> PathBuf {
        self.lock_root.join(format!("{}@{}.lock", sanitize(name), sanitize(version)))
    }

    fn fetch_remote(&self, name: &str, version: &str, token: Option<&str>) -> Result<PluginMetadata, PluginError> {
        let repository = self
            .repository
            .as_deref()
            .ok_or_else(|| PluginError::RepositoryNotConfigured { name: name.to_string() })?;
        let url = remote_url(repository, name, token)?;
        let checkout = self.checkout_dir(name, version);
        let lock_path = self.lock_path(name, version);

        let _lock = FileLock::acquire(&lock_path).map_err(|source| PluginError::Lock {
            path: lock_path.clone(),
            source,
        })?;

        if GitOps::is_clean_checkout(&checkout) {
            debug!(plugin = name, version, path = %checkout.display(), "reusing cached checkout");
        } else {
            if checkout.exists() {
                debug!(path = %checkout.display(), "removing stale checkout");
                fs::remove_dir_all(&checkout).map_err(|source| PluginError::Io {
                    path: checkout.clone(),
                    source,
                })?;
            }
            info!(plugin = name, version, url = %redact_sensitive(url.as_str()), "cloning plugin");
            GitOps::clone(url.as_str(), &checkout, version).map_err(|message| PluginError::Git {
                name: name.to_string(),
                version: version.to_string(),
                message: redact_sensitive(&message),
            })?;
        }

        let metadata = PluginMetadata::new(name, version, checkout, PluginSource::Remote { lock_path });
        metadata.validate()?;
        Ok(metadata)
    }
}

fn cache_key(name: &str, version: &str, local_path: Option<&Path>) -> String {
    match local_path {
        Some(path) => {
            let path = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
            format!("{name}@{}", path.display())
        }
        None => format!("{name}@{version}"),
    }
}

fn resolve_local(name: &str, version: &str, path: &Path) -> Result<PluginMetadata, PluginError> {
    if !path.is_dir() {
        return Err(PluginError::NotADirectory { path: path.to_path_buf() });
    }
    let metadata = PluginMetadata::new(name, version, path.to_path_buf(), PluginSource::Local);
    metadata.validate()?;
    Ok(metadata)
}

fn remote_url(repository: &str, name: &str, token: Option<&str>) -> Result<Url, PluginError> {
    let raw = format!("{}/{}", repository.trim_end_matches('/'), name);
    let mut url = Url::parse(&raw).map_err(|error| PluginError::InvalidRepository {
        url: redact_sensitive(&raw),
        message: error.to_string(),
    })?;
    if let Some(token) = token.filter(|token| !token.is_empty()) {
        url.set_username(token).map_err(|_| PluginError::InvalidRepository {
            url: redact_sensitive(&raw),
            message: "repository URL cannot carry credentials".to_string(),
        })?;
    }
    Ok(url)
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect()
}
