//! Line-oriented `KEY=VALUE` environment files.
//!
//! Blank lines and lines starting with `#` or `//` are comments. Keys and
//! values are trimmed. When several files are merged, later files win and a
//! warning is logged for every overridden key.

use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use thiserror::Error;
use tracing::warn;

/// Errors raised while reading environment files.
#[derive(Debug, Error)]
pub enum EnvFileError {
    #[error("failed to read env file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: expected KEY=VALUE")]
    MalformedLine { path: PathBuf, line: usize },
    #[error("{path}:{line}: empty variable name")]
    EmptyKey { path: PathBuf, line: usize },
}

/// Parse the content of one env file. `path` is only used in error messages.
pub fn parse_env_content(path: &Path, content: &str) -> Result<IndexMap<String, String>, EnvFileError> {
    let mut values = IndexMap::new();
    for (index, raw_line) in content.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(EnvFileError::MalformedLine {
                path: path.to_path_buf(),
                line: index + 1,
            });
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(EnvFileError::EmptyKey {
                path: path.to_path_buf(),
                line: index + 1,
            });
        }
        values.insert(key.to_string(), value.trim().to_string());
    }
    Ok(values)
}

/// Read and parse a single env file.
pub fn load_env_file(path: &Path) -> Result<IndexMap<String, String>, EnvFileError> {
    let content = fs::read_to_string(path).map_err(|source| EnvFileError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_env_content(path, &content)
}

/// Read every file in order and merge them; later files override earlier ones.
pub fn load_env_files<P: AsRef<Path>>(paths: &[P]) -> Result<IndexMap<String, String>, EnvFileError> {
    let mut merged: IndexMap<String, String> = IndexMap::new();
    for path in paths {
        let path = path.as_ref();
        for (key, value) in load_env_file(path)? {
            if merged.contains_key(&key) {
                warn!(key = %key, file = %path.display(), "env file overrides a previously defined variable");
            }
            merged.insert(key, value);
        }
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn comments_and_whitespace_are_ignored() {
        let content = "# comment\n\n// another comment\n  NAME = api  \nURL=http://host/a=b\nEMPTY=\n";
        let values = parse_env_content(Path::new("test.env"), content).unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(values["NAME"], "api");
        assert_eq!(values["URL"], "http://host/a=b");
        assert_eq!(values["EMPTY"], "");
    }

    #[test]
    fn malformed_line_reports_position() {
        let error = parse_env_content(Path::new("bad.env"), "A=1\nnot a pair\n").unwrap_err();
        assert_eq!(error.to_string(), "bad.env:2: expected KEY=VALUE");

        let error = parse_env_content(Path::new("bad.env"), " =value\n").unwrap_err();
        assert!(matches!(error, EnvFileError::EmptyKey { line: 1, .. }));
    }

    #[test]
    fn later_files_win() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("first.env");
        let second = dir.path().join("second.env");
        fs::write(&first, "A=1\nB=1\n").unwrap();
        fs::write(&second, "B=2\nC=2\n").unwrap();

        let merged = load_env_files(&[&first, &second]).unwrap();
        assert_eq!(merged["A"], "1");
        assert_eq!(merged["B"], "2");
        assert_eq!(merged["C"], "2");
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempdir().unwrap();
        let error = load_env_files(&[dir.path().join("absent.env")]).unwrap_err();
        assert!(matches!(error, EnvFileError::Io { .. }));
    }
}
