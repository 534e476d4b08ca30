//! Reading workflow documents from disk.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use stepline_types::WorkflowDefinition;
use stepline_util::load_env_files;
use tracing::debug;

/// Parse a workflow document from YAML text. `env-files` are left unresolved.
pub fn parse_workflow(content: &str) -> Result<WorkflowDefinition> {
    serde_yaml::from_str(content).context("invalid workflow document")
}

/// Load a workflow file and merge its `env-files` underneath the inline `env`.
///
/// Relative env-file paths are resolved against the workflow file's directory.
pub fn load_workflow_file(file_path: impl AsRef<Path>) -> Result<WorkflowDefinition> {
    let file_path = file_path.as_ref();
    let content = fs::read_to_string(file_path).with_context(|| format!("failed to read workflow file: {}", file_path.display()))?;
    let mut definition = parse_workflow(&content).with_context(|| format!("failed to parse {}", file_path.display()))?;

    if !definition.env_files.is_empty() {
        let base = file_path.parent().unwrap_or_else(|| Path::new("."));
        let files: Vec<PathBuf> = definition
            .env_files
            .iter()
            .map(|file| if file.is_absolute() { file.clone() } else { base.join(file) })
            .collect();
        debug!(files = files.len(), "loading env files");
        let mut merged = load_env_files(&files)?;
        for (key, value) in definition.env.drain(..) {
            merged.insert(key, value);
        }
        definition.env = merged;
    }

    Ok(definition)
}
