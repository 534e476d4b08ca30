use std::sync::Arc;

use anyhow::{Result, anyhow};
use indexmap::IndexMap;
use stepline_types::JobDefinition;
use stepline_util::{ScopedEnv, SharedEnv};
use tracing::{info, warn};

use super::{Runnable, RunnableContext, RunnableResult, Step};
use crate::error::{AGGREGATE_FAILURE_CODE, into_result, join_errors};
use crate::plugin::PluginRegistry;
use crate::status::RunnableType;
use crate::template::interpolate_map;

/// An ordered list of steps sharing a job-local environment.
///
/// Steps always run to the end of the list: a failing step is recorded and
/// the walk continues. Only a failure to evaluate `if` or
/// `continue-on-error` stops the job early.
pub struct Job {
    name: String,
    env: IndexMap<String, String>,
    steps: Vec<Step>,
}

impl Job {
    pub fn new(name: &str, definition: &JobDefinition, registry: &PluginRegistry) -> Self {
        Self {
            name: name.to_string(),
            env: definition.env.clone(),
            steps: definition.steps.iter().map(|step| Step::new(step, registry)).collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn run_steps(&mut self, env: &SharedEnv, ctx: &mut RunnableContext) -> (Vec<anyhow::Error>, String) {
        let mut errors = Vec::new();
        let mut output = String::new();
        for step in &mut self.steps {
            match step.execute(env, ctx) {
                Ok(outcome) => {
                    append_output(&mut output, &outcome.result.output);
                    if outcome.is_failure() {
                        let code = outcome.result.return_code;
                        errors.push(
                            outcome
                                .result
                                .err
                                .unwrap_or_else(|| anyhow!("step '{}' failed with code {code}", step.name())),
                        );
                    }
                }
                Err(error) => {
                    warn!(job = %self.name, step = %step.name(), "aborting job");
                    errors.push(error);
                    break;
                }
            }
        }
        (errors, output)
    }
}

impl Runnable for Job {
    fn precheck(&self) -> Result<()> {
        let errors = self
            .steps
            .iter()
            .filter_map(|step| step.precheck().err())
            .map(|error| error.context(format!("job '{}'", self.name)))
            .collect();
        into_result(errors)
    }

    fn compile(&mut self, ctx: &mut RunnableContext) -> Result<()> {
        let mut errors = Vec::new();
        for step in &mut self.steps {
            if let Err(error) = step.compile(ctx) {
                errors.push(error.context(format!("job '{}'", self.name)));
            }
        }
        into_result(errors)
    }

    fn can_run(&self) -> bool {
        self.steps.iter().all(Step::can_run)
    }

    fn preflight_check(&self, parent_env: &SharedEnv, args: &SharedEnv, ctx: &mut RunnableContext) -> Result<()> {
        let env = ScopedEnv::with_values(self.env.clone(), Some(Arc::clone(parent_env))).into_shared();
        let mut errors = Vec::new();
        for step in &self.steps {
            if let Err(error) = step.preflight_check(&env, args, ctx) {
                errors.push(error.context(format!("job '{}'", self.name)));
            }
        }
        into_result(errors)
    }

    fn run(&mut self, parent_env: &SharedEnv, ctx: &mut RunnableContext) -> RunnableResult {
        let Some(workflow_status) = ctx.workflow_status else {
            return RunnableResult::failure(anyhow!("job '{}' executed outside of a workflow", self.name), 1);
        };
        let status = ctx.status.add_child(workflow_status, &self.name, RunnableType::Job);
        ctx.job_status = Some(status);
        ctx.status.start(status);
        info!(job = %self.name, steps = self.steps.len(), "job started");

        let variables = ctx.variables();
        let (errors, output) = match interpolate_map(&self.env, &mut ctx.scripts, parent_env, &variables) {
            Ok(values) => {
                let env = ScopedEnv::with_values(values, Some(Arc::clone(parent_env))).into_shared();
                self.run_steps(&env, ctx)
            }
            Err(error) => (vec![error.context(format!("job '{}': invalid env", self.name))], String::new()),
        };

        ctx.status.finish(status, errors.iter().map(|error| format!("{error:#}")));
        ctx.job_status = None;

        match join_errors(errors) {
            None => {
                info!(job = %self.name, "job passed");
                RunnableResult::success(output)
            }
            Some(error) => {
                warn!(job = %self.name, "job failed");
                RunnableResult::failure(error, AGGREGATE_FAILURE_CODE).with_output(output)
            }
        }
    }
}

fn append_output(output: &mut String, chunk: &str) {
    if chunk.is_empty() {
        return;
    }
    output.push_str(chunk);
    if !chunk.ends_with('\n') {
        output.push('\n');
    }
}
