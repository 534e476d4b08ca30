pub mod env;
pub mod env_file;
pub mod file_lock;
pub mod path_processing;

pub use env::{Env, EnvError, OsEnv, ScopedEnv, SharedEnv, WriteThroughEnv, expand_variables};
pub use env_file::{EnvFileError, load_env_file, load_env_files, parse_env_content};
pub use file_lock::FileLock;
pub use path_processing::{CACHE_DIR_ENV, default_cache_dir, expand_tilde};

use once_cell::sync::Lazy;
use regex::Regex;

static SENSITIVE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)(authorization: )([\w\-\.=:/+]+)",
        r"(?i)([A-Z0-9_]*?(KEY|TOKEN|SECRET|PASSWORD)=)([^\s]+)",
        r"(://)([^/@\s]+)@",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

/// Redacts values that look like secrets in a string.
///
/// Covers authorization headers, `*_TOKEN=`-style assignments and credentials
/// embedded in URLs (`https://token@host/...`).
pub fn redact_sensitive(input: &str) -> String {
    let mut redacted = input.to_string();
    for regex in SENSITIVE_PATTERNS.iter() {
        redacted = regex
            .replace_all(&redacted, |caps: &regex::Captures| {
                let prefix = caps.get(1).map(|m| m.as_str()).unwrap_or("");
                if prefix == "://" {
                    format!("{prefix}<redacted>@")
                } else {
                    format!("{prefix}<redacted>")
                }
            })
            .to_string();
    }
    redacted
}
