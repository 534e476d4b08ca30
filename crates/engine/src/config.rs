//! Engine configuration resolved from the process environment.

use std::env;
use std::path::PathBuf;

pub use stepline_util::CACHE_DIR_ENV;
use stepline_util::{default_cache_dir, expand_tilde};

pub const PLUGIN_REPOSITORY_ENV: &str = "STEPLINE_PLUGIN_REPOSITORY";
pub const PLUGIN_TOKEN_ENV: &str = "STEPLINE_PLUGIN_TOKEN";
pub const PRIVATE_KEY_ENV: &str = "STEPLINE_PRIVATE_KEY";

/// Settings shared by every phase of a workflow run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Root of the plugin cache and its lock files.
    pub cache_dir: PathBuf,
    /// Base URL remote plugins are cloned from (`<repository>/<name>`).
    pub plugin_repository: Option<String>,
    /// Access token embedded into remote plugin URLs.
    pub plugin_token: Option<String>,
    /// Private key required by workflows that declare `checks.private-key`.
    pub private_key: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            plugin_repository: None,
            plugin_token: None,
            private_key: None,
        }
    }
}

impl EngineConfig {
    /// Build the configuration from `STEPLINE_*` environment variables.
    ///
    /// Empty values are treated as unset.
    pub fn from_env() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            plugin_repository: non_empty_var(PLUGIN_REPOSITORY_ENV),
            plugin_token: non_empty_var(PLUGIN_TOKEN_ENV),
            private_key: non_empty_var(PRIVATE_KEY_ENV).map(|path| expand_tilde(&path)),
        }
    }

    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = cache_dir.into();
        self
    }

    pub fn plugin_cache_dir(&self) -> PathBuf {
        self.cache_dir.join("plugins")
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.cache_dir.join("locks")
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_env_reads_every_setting() {
        temp_env::with_vars(
            [
                (CACHE_DIR_ENV, Some("/tmp/stepline-cache")),
                (PLUGIN_REPOSITORY_ENV, Some("https://git.example.com/plugins")),
                (PLUGIN_TOKEN_ENV, Some("secret")),
                (PRIVATE_KEY_ENV, Some("/keys/id")),
            ],
            || {
                let config = EngineConfig::from_env();
                assert_eq!(config.cache_dir, PathBuf::from("/tmp/stepline-cache"));
                assert_eq!(config.plugin_repository.as_deref(), Some("https://git.example.com/plugins"));
                assert_eq!(config.plugin_token.as_deref(), Some("secret"));
                assert_eq!(config.private_key, Some(PathBuf::from("/keys/id")));
                assert_eq!(config.plugin_cache_dir(), PathBuf::from("/tmp/stepline-cache/plugins"));
                assert_eq!(config.lock_dir(), PathBuf::from("/tmp/stepline-cache/locks"));
            },
        );
    }

    #[test]
    fn blank_values_are_unset() {
        temp_env::with_vars(
            [
                (PLUGIN_REPOSITORY_ENV, Some("  ")),
                (PLUGIN_TOKEN_ENV, None::<&str>),
                (PRIVATE_KEY_ENV, Some("")),
            ],
            || {
                let config = EngineConfig::from_env();
                assert!(config.plugin_repository.is_none());
                assert!(config.plugin_token.is_none());
                assert!(config.private_key.is_none());
            },
        );
    }
}
