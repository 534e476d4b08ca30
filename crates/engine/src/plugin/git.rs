use std::fs;
use std::path::Path;
use std::process::Command;

use tracing::debug;

/// Git operations used to fetch remote plugins.
///
/// Uses the system `git` command so credential helpers and SSH keys keep
/// working.
pub struct GitOps;

impl GitOps {
    /// Shallow-clone `git_ref` (a tag or branch) of `url` into `dest`.
    pub fn clone(url: &str, dest: &Path, git_ref: &str) -> Result<(), String> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| format!("failed to create directory: {e}"))?;
        }

        let output = Command::new("git")
            .args(["clone", "--quiet", "--depth", "1", "--branch", git_ref, "--single-branch", url])
            .arg(dest)
            .output()
            .map_err(|e| format!("failed to execute git clone: {e}"))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!("git clone failed: {}", stderr.trim()))
        }
    }

    /// True when `repo_dir` is a git checkout without local modifications.
    pub fn is_clean_checkout(repo_dir: &Path) -> bool {
        if !repo_dir.join(".git").exists() {
            return false;
        }
        match Command::new("git").args(["status", "--porcelain"]).current_dir(repo_dir).output() {
            Ok(output) if output.status.success() => output.stdout.iter().all(u8::is_ascii_whitespace),
            Ok(output) => {
                debug!(
                    repo = %repo_dir.display(),
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "git status failed"
                );
                false
            }
            Err(error) => {
                debug!(repo = %repo_dir.display(), error = %error, "failed to execute git status");
                false
            }
        }
    }

    /// Check if git is available on the system.
    pub fn is_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}
