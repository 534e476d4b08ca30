//! The four-phase lifecycle shared by workflows, jobs, steps and runners.
//!
//! 1. [`Runnable::precheck`]: structural validation without environment access.
//! 2. [`Runnable::compile`]: prepare executable forms; gates [`Runnable::can_run`].
//! 3. [`Runnable::preflight_check`]: validation against the resolved environment.
//! 4. [`Runnable::run`]: execution, recorded in the context's status tree.

mod context;
mod job;
mod runner;
mod step;
mod workflow;

use anyhow::Result;
use stepline_util::SharedEnv;

pub use context::RunnableContext;
pub use job::Job;
pub use runner::{BashRunner, PluginRunner, Runner, ScriptRunner};
pub use step::{Step, StepOutcome};
pub use workflow::Workflow;

pub trait Runnable {
    fn precheck(&self) -> Result<()>;

    fn compile(&mut self, ctx: &mut RunnableContext) -> Result<()>;

    fn can_run(&self) -> bool;

    fn preflight_check(&self, parent_env: &SharedEnv, args: &SharedEnv, ctx: &mut RunnableContext) -> Result<()>;

    fn run(&mut self, parent_env: &SharedEnv, ctx: &mut RunnableContext) -> RunnableResult;
}

/// Outcome of a [`Runnable::run`] call.
#[derive(Debug, Default)]
pub struct RunnableResult {
    pub err: Option<anyhow::Error>,
    /// `0` on success; [`crate::AGGREGATE_FAILURE_CODE`] for joined failures.
    pub return_code: i32,
    /// Captured output when the context asked for it.
    pub output: String,
}

impl RunnableResult {
    pub fn success(output: String) -> Self {
        Self {
            err: None,
            return_code: 0,
            output,
        }
    }

    /// A failed result. A zero `return_code` is replaced by `1`.
    pub fn failure(err: anyhow::Error, return_code: i32) -> Self {
        Self {
            err: Some(err),
            return_code: if return_code == 0 { 1 } else { return_code },
            output: String::new(),
        }
    }

    pub fn with_output(mut self, output: String) -> Self {
        self.output = output;
        self
    }

    pub fn is_success(&self) -> bool {
        self.return_code == 0 && self.err.is_none()
    }

    /// Display form of the error, including its context chain.
    pub fn error_message(&self) -> Option<String> {
        self.err.as_ref().map(|error| format!("{error:#}"))
    }
}

/// Result of the last compile attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompileState {
    #[default]
    Unattempted,
    Failed,
    Succeeded,
}

impl CompileState {
    fn record<T>(&mut self, outcome: &Result<T>) {
        *self = if outcome.is_ok() { CompileState::Succeeded } else { CompileState::Failed };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn failure_never_reports_success_code() {
        let result = RunnableResult::failure(anyhow!("broken"), 0);
        assert_eq!(result.return_code, 1);
        assert!(!result.is_success());
        assert_eq!(result.error_message().as_deref(), Some("broken"));
        assert!(RunnableResult::success("out".into()).is_success());
    }

    #[test]
    fn compile_state_tracks_last_attempt() {
        let mut state = CompileState::default();
        assert_eq!(state, CompileState::Unattempted);
        state.record(&Err::<(), _>(anyhow!("bad")));
        assert_eq!(state, CompileState::Failed);
        state.record(&Ok(()));
        assert_eq!(state, CompileState::Succeeded);
    }
}
