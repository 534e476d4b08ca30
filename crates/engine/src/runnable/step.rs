use std::sync::Arc;

use anyhow::{Result, anyhow};
use indexmap::IndexMap;
use stepline_types::{ControlExpression, StepDefinition};
use stepline_util::{ScopedEnv, SharedEnv, WriteThroughEnv};
use tracing::{info, warn};

use super::{Runnable, RunnableContext, RunnableResult, Runner};
use crate::error::AGGREGATE_FAILURE_CODE;
use crate::plugin::PluginRegistry;
use crate::status::{RunnableType, StatusId};
use crate::template::{evaluate_control, interpolate_map};

/// What happened to a step inside a job.
#[derive(Debug)]
pub struct StepOutcome {
    pub result: RunnableResult,
    /// The step failed but `continue-on-error` evaluated to true.
    pub tolerated: bool,
}

impl StepOutcome {
    /// True when the failure counts against the job.
    pub fn is_failure(&self) -> bool {
        !self.result.is_success() && !self.tolerated
    }
}

pub struct Step {
    name: String,
    status_key: String,
    env: IndexMap<String, String>,
    condition: Option<ControlExpression>,
    continue_on_error: Option<ControlExpression>,
    runner: Result<Runner, String>,
}

impl Step {
    pub fn new(definition: &StepDefinition, registry: &PluginRegistry) -> Self {
        let status_key = definition
            .id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| definition.name.trim().to_string());
        Self {
            name: definition.display_name().to_string(),
            status_key,
            env: definition.env.clone(),
            condition: definition.r#if.clone(),
            continue_on_error: definition.continue_on_error.clone(),
            runner: Runner::from_definition(definition, registry),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the step under the current job.
    ///
    /// `Err` means an `if` or `continue-on-error` expression could not be
    /// evaluated; the caller aborts the job.
    pub fn execute(&mut self, parent_env: &SharedEnv, ctx: &mut RunnableContext) -> Result<StepOutcome> {
        let job_status = ctx
            .job_status
            .ok_or_else(|| anyhow!("step '{}' executed outside of a job", self.name))?;
        let status = ctx.status.add_child(job_status, &self.status_key, RunnableType::Step);

        if let Some(condition) = &self.condition {
            let variables = ctx.variables();
            match evaluate_control(condition, &mut ctx.scripts, parent_env, &variables) {
                Ok(true) => {}
                Ok(false) => {
                    info!(step = %self.name, "condition is false, skipping step");
                    ctx.status.skipped(status);
                    return Ok(StepOutcome {
                        result: RunnableResult::success(String::new()),
                        tolerated: false,
                    });
                }
                Err(error) => {
                    let error = error.context(format!("step '{}': invalid if", self.name));
                    return Err(self.abort(ctx, status, None, error));
                }
            }
        }

        ctx.status.start(status);
        info!(step = %self.name, "step started");
        let (env, mut result) = self.run_in_scope(parent_env, ctx);
        if let Some(error) = result.err.take() {
            result.err = Some(error.context(format!("step '{}'", self.name)));
        }

        let mut tolerated = false;
        if !result.is_success() {
            if let Some(expression) = &self.continue_on_error {
                let variables = ctx.variables();
                match evaluate_control(expression, &mut ctx.scripts, &env, &variables) {
                    Ok(flag) => tolerated = flag,
                    Err(error) => {
                        let error = error.context(format!("step '{}': invalid continue-on-error", self.name));
                        return Err(self.abort(ctx, status, result.error_message(), error));
                    }
                }
            }
            ctx.status.set_continue_on_err(status, tolerated);
            if tolerated {
                warn!(step = %self.name, code = result.return_code, "step failed, continuing on error");
            } else {
                warn!(step = %self.name, code = result.return_code, "step failed");
            }
        } else {
            info!(step = %self.name, "step passed");
        }

        ctx.status.finish(status, result.error_message());
        Ok(StepOutcome {
            result,
            tolerated,
        })
    }

    // The step scope publishes `Set` calls to the workflow scope so later
    // steps and jobs observe them.
    fn run_in_scope(&mut self, parent_env: &SharedEnv, ctx: &mut RunnableContext) -> (SharedEnv, RunnableResult) {
        let variables = ctx.variables();
        let values = match interpolate_map(&self.env, &mut ctx.scripts, parent_env, &variables) {
            Ok(values) => values,
            Err(error) => return (Arc::clone(parent_env), RunnableResult::failure(error, 1)),
        };
        let write_target = ctx.shared_env.clone().unwrap_or_else(|| Arc::clone(parent_env));
        let env = WriteThroughEnv::new(values, Arc::clone(parent_env), write_target).into_shared();

        let result = match &mut self.runner {
            Ok(runner) if runner.can_run() => runner.run(&env, ctx),
            Ok(_) => RunnableResult::failure(anyhow!("step has not been compiled"), 1),
            Err(message) => RunnableResult::failure(anyhow!(message.clone()), 1),
        };
        (env, result)
    }

    fn abort(
        &self,
        ctx: &mut RunnableContext,
        status: StatusId,
        step_error: Option<String>,
        error: anyhow::Error,
    ) -> anyhow::Error {
        let message = format!("{error:#}");
        warn!(step = %self.name, error = %message, "control expression failed");
        ctx.status.finish(status, step_error.into_iter().chain([message]));
        error
    }

    fn preflight_env(&self, parent_env: &SharedEnv) -> SharedEnv {
        ScopedEnv::with_values(self.env.clone(), Some(Arc::clone(parent_env))).into_shared()
    }
}

impl Runnable for Step {
    fn precheck(&self) -> Result<()> {
        match &self.runner {
            Ok(runner) => runner
                .precheck()
                .map_err(|error| error.context(format!("step '{}'", self.name))),
            Err(message) => Err(anyhow!(message.clone())),
        }
    }

    fn compile(&mut self, ctx: &mut RunnableContext) -> Result<()> {
        match &mut self.runner {
            Ok(runner) => runner
                .compile(ctx)
                .map_err(|error| error.context(format!("step '{}': compile failed", self.name))),
            Err(message) => Err(anyhow!(message.clone())),
        }
    }

    fn can_run(&self) -> bool {
        matches!(&self.runner, Ok(runner) if runner.can_run())
    }

    fn preflight_check(&self, parent_env: &SharedEnv, args: &SharedEnv, ctx: &mut RunnableContext) -> Result<()> {
        match &self.runner {
            Ok(runner) => runner
                .preflight_check(&self.preflight_env(parent_env), args, ctx)
                .map_err(|error| error.context(format!("step '{}'", self.name))),
            Err(message) => Err(anyhow!(message.clone())),
        }
    }

    fn run(&mut self, parent_env: &SharedEnv, ctx: &mut RunnableContext) -> RunnableResult {
        match self.execute(parent_env, ctx) {
            Ok(outcome) => outcome.result,
            Err(error) => RunnableResult::failure(error, AGGREGATE_FAILURE_CODE),
        }
    }
}
