use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use indexmap::IndexMap;
use regex::Regex;
use stepline_types::{ChecksDefinition, WorkflowDefinition, validate_pattern};
use stepline_util::{Env, OsEnv, ScopedEnv, SharedEnv, expand_variables};
use tracing::{info, warn};

use super::{Job, Runnable, RunnableContext, RunnableResult};
use crate::error::into_result;
use crate::plugin::PluginRegistry;
use crate::status::RunnableType;
use crate::template::interpolate_map;

/// Root of the runnable tree.
///
/// Jobs run in declaration order and the first failing job ends the run.
pub struct Workflow {
    name: String,
    version: String,
    working_dir: Option<PathBuf>,
    env: IndexMap<String, String>,
    checks: ChecksDefinition,
    jobs: Vec<Job>,
}

impl Workflow {
    /// Build the runnable tree. `${VAR}` references in the workflow env are
    /// expanded here against earlier entries and the process environment.
    pub fn new(definition: &WorkflowDefinition, registry: &PluginRegistry) -> Self {
        let os = OsEnv::shared();
        let mut env: IndexMap<String, String> = IndexMap::new();
        for (key, value) in &definition.env {
            let expanded = expand_variables(value, |name| env.get(name).cloned().or_else(|| os.get(name)));
            env.insert(key.clone(), expanded);
        }

        Self {
            name: definition.name.clone(),
            version: definition.version.clone(),
            working_dir: definition.working_dir.clone(),
            env,
            checks: definition.checks.clone(),
            jobs: definition
                .jobs
                .iter()
                .map(|(name, job)| Job::new(name, job, registry))
                .collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Precheck, compile and preflight in order, stopping at the first phase
    /// that fails.
    pub fn prepare(&mut self, parent_env: &SharedEnv, ctx: &mut RunnableContext) -> Result<()> {
        self.precheck().context("workflow precheck failed")?;
        self.compile(ctx).context("workflow compile failed")?;
        if !self.can_run() {
            bail!("workflow '{}' is not ready to run", self.name);
        }
        let args = Arc::clone(&ctx.args);
        self.preflight_check(parent_env, &args, ctx)
            .context("workflow preflight check failed")
    }

    /// Full lifecycle: [`Workflow::prepare`] followed by [`Runnable::run`].
    pub fn execute(&mut self, parent_env: &SharedEnv, ctx: &mut RunnableContext) -> RunnableResult {
        if let Err(error) = self.prepare(parent_env, ctx) {
            return RunnableResult::failure(error, 1);
        }
        self.run(parent_env, ctx)
    }

    fn scope(&self, parent_env: &SharedEnv) -> SharedEnv {
        ScopedEnv::with_values(self.env.clone(), Some(Arc::clone(parent_env))).into_shared()
    }

    fn check_requirements(&self, env: &SharedEnv, args: &SharedEnv, ctx: &RunnableContext) -> Vec<anyhow::Error> {
        let mut errors = Vec::new();
        for arg in &self.checks.args {
            match args.get(&arg.name) {
                None => errors.push(anyhow!("required argument '{}' is not provided", arg.name)),
                Some(value) => {
                    if let Err(message) = validate_pattern(&format!("argument '{}'", arg.name), &value, arg.pattern.as_deref()) {
                        errors.push(anyhow!(message));
                    }
                }
            }
        }
        for item in &self.checks.envs {
            match env.get(&item.name) {
                None => errors.push(anyhow!("required environment variable '{}' is not set", item.name)),
                Some(value) => {
                    if let Err(message) =
                        validate_pattern(&format!("environment variable '{}'", item.name), &value, item.pattern.as_deref())
                    {
                        errors.push(anyhow!(message));
                    }
                }
            }
        }
        if self.checks.private_key {
            match &ctx.config.private_key {
                None => errors.push(anyhow!("private key is required but not configured")),
                Some(path) if !path.is_file() => {
                    errors.push(anyhow!("private key {} does not exist", path.display()));
                }
                Some(_) => {}
            }
        }
        errors
    }
}

impl Runnable for Workflow {
    fn precheck(&self) -> Result<()> {
        let mut errors: Vec<anyhow::Error> = Vec::new();
        for item in self.checks.args.iter().chain(&self.checks.envs) {
            if let Some(pattern) = item.pattern.as_deref().filter(|pattern| !pattern.is_empty())
                && let Err(error) = Regex::new(pattern)
            {
                errors.push(anyhow!("check '{}' has an invalid pattern '{pattern}': {error}", item.name));
            }
        }
        errors.extend(self.jobs.iter().filter_map(|job| job.precheck().err()));
        into_result(errors)
    }

    fn compile(&mut self, ctx: &mut RunnableContext) -> Result<()> {
        let mut errors = Vec::new();
        for job in &mut self.jobs {
            if let Err(error) = job.compile(ctx) {
                errors.push(error);
            }
        }
        into_result(errors)
    }

    fn can_run(&self) -> bool {
        self.jobs.iter().all(Job::can_run)
    }

    fn preflight_check(&self, parent_env: &SharedEnv, args: &SharedEnv, ctx: &mut RunnableContext) -> Result<()> {
        let env = self.scope(parent_env);
        let mut errors = self.check_requirements(&env, args, ctx);
        for job in &self.jobs {
            if let Err(error) = job.preflight_check(&env, args, ctx) {
                errors.push(error);
            }
        }
        into_result(errors)
    }

    fn run(&mut self, parent_env: &SharedEnv, ctx: &mut RunnableContext) -> RunnableResult {
        let status = ctx.status.add_root(&self.name, RunnableType::Workflow);
        ctx.workflow_status = Some(status);
        ctx.status.start(status);
        info!(workflow = %self.name, version = %self.version, jobs = self.jobs.len(), "workflow started");

        let variables = ctx.args_variables();
        let values = match interpolate_map(&self.env, &mut ctx.scripts, parent_env, &variables) {
            Ok(values) => values,
            Err(error) => return fail(ctx, status, error.context("invalid workflow env")),
        };
        let env = ScopedEnv::with_values(values, Some(Arc::clone(parent_env))).into_shared();
        ctx.shared_env = Some(Arc::clone(&env));

        if let Some(dir) = &self.working_dir
            && let Err(error) = change_working_dir(dir)
        {
            return fail(ctx, status, error);
        }

        let mut output = String::new();
        for job in &mut self.jobs {
            let result = job.run(&env, ctx);
            output.push_str(&result.output);
            if !result.is_success() {
                warn!(workflow = %self.name, job = %job.name(), code = result.return_code, "workflow stopped at failing job");
                let message = result
                    .error_message()
                    .unwrap_or_else(|| format!("job '{}' failed", job.name()));
                ctx.status.finish(status, [message]);
                return RunnableResult {
                    output,
                    ..result
                };
            }
        }

        ctx.status.finish(status, Vec::<String>::new());
        info!(workflow = %self.name, "workflow passed");
        RunnableResult::success(output)
    }
}

fn fail(ctx: &mut RunnableContext, status: crate::status::StatusId, error: anyhow::Error) -> RunnableResult {
    ctx.status.finish(status, [format!("{error:#}")]);
    RunnableResult::failure(error, 1)
}

fn change_working_dir(dir: &Path) -> Result<()> {
    let metadata = dir
        .metadata()
        .with_context(|| format!("working directory {} does not exist", dir.display()))?;
    if !metadata.is_dir() {
        bail!("working directory {} is not a directory", dir.display());
    }
    env::set_current_dir(dir).with_context(|| format!("failed to change directory to {}", dir.display()))?;
    info!(dir = %dir.display(), "changed working directory");
    Ok(())
}
