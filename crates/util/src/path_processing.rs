use std::env;
use std::path::PathBuf;

use dirs_next::{cache_dir, home_dir};

/// Environment variable overriding the plugin/cache root.
pub const CACHE_DIR_ENV: &str = "STEPLINE_CACHE_DIR";

/// Expand a leading `~` to the current user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    let p = path.trim();
    if p == "~" {
        return home_dir().unwrap_or_else(|| PathBuf::from("~"));
    }
    if let Some(rest) = p.strip_prefix("~/") {
        return home_dir().unwrap_or_else(|| PathBuf::from("~")).join(rest);
    }
    if let Some(rest) = p.strip_prefix("~\\") {
        // Windows-style
        return home_dir().unwrap_or_else(|| PathBuf::from("~")).join(rest);
    }
    PathBuf::from(p)
}

/// Root directory for cached plugin checkouts and lock files.
///
/// Honors [`CACHE_DIR_ENV`] when set to a non-blank value, otherwise uses the
/// platform cache directory.
pub fn default_cache_dir() -> PathBuf {
    if let Ok(path) = env::var(CACHE_DIR_ENV) {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return expand_tilde(trimmed);
        }
    }

    cache_dir()
        .map(|dir| dir.join("stepline"))
        .unwrap_or_else(|| PathBuf::from(".stepline-cache"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tilde_prefix_is_expanded() {
        let home = home_dir().expect("home directory");
        assert_eq!(expand_tilde("~"), home);
        assert_eq!(expand_tilde("~/keys/id_rsa"), home.join("keys/id_rsa"));
        assert_eq!(expand_tilde(" /abs/path "), PathBuf::from("/abs/path"));
    }

    #[test]
    fn cache_dir_honors_env_override() {
        temp_env::with_var(CACHE_DIR_ENV, Some("/var/cache/stepline-test"), || {
            assert_eq!(default_cache_dir(), PathBuf::from("/var/cache/stepline-test"));
        });
        temp_env::with_var(CACHE_DIR_ENV, Some("   "), || {
            assert!(default_cache_dir().ends_with("stepline") || default_cache_dir().ends_with(".stepline-cache"));
        });
    }
}
