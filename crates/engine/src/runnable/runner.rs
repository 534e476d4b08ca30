//! Step executors: shell commands, inline scripts and plugins.

use std::process::{Command, Stdio};

use anyhow::{Context, Result, anyhow, bail};
use indexmap::IndexMap;
use stepline_types::StepDefinition;
use stepline_util::{Env, SharedEnv};
use tracing::debug;

use super::{CompileState, Runnable, RunnableContext, RunnableResult};
use crate::plugin::{Plugin, PluginRef, PluginRegistry, ScriptPlugin};
use crate::template::{self, TokenKind, scan_tokens};

const SHELL: &str = "bash";
const SYNTAX_PLACEHOLDER: &str = "__stepline_expr__";

/// The executor chosen for a step. Exactly one of `script`, `run` and `uses`
/// selects the variant.
pub enum Runner {
    Bash(BashRunner),
    Script(ScriptRunner),
    Plugin(PluginRunner),
}

impl Runner {
    pub fn from_definition(definition: &StepDefinition, registry: &PluginRegistry) -> Result<Self, String> {
        let name = definition.display_name();
        let non_empty = |value: &Option<String>| value.clone().filter(|value| !value.trim().is_empty());

        match (non_empty(&definition.script), non_empty(&definition.run), non_empty(&definition.uses)) {
            (Some(script), None, None) => Ok(Runner::Script(ScriptRunner::new(script))),
            (None, Some(command), None) => Ok(Runner::Bash(BashRunner::new(command))),
            (None, None, Some(uses)) => {
                let reference = PluginRef::parse(&uses).map_err(|error| format!("step '{name}': {error}"))?;
                PluginRunner::new(reference, definition.with.clone(), registry)
                    .map(Runner::Plugin)
                    .map_err(|error| format!("step '{name}': {error}"))
            }
            (None, None, None) => Err(format!("step '{name}': no script/run/uses specified")),
            _ => Err(format!("step '{name}': multiple of script/run/uses specified")),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Runner::Bash(_) => "bash",
            Runner::Script(_) => "script",
            Runner::Plugin(_) => "plugin",
        }
    }

    fn inner(&self) -> &dyn Runnable {
        match self {
            Runner::Bash(runner) => runner,
            Runner::Script(runner) => runner,
            Runner::Plugin(runner) => runner,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Runnable {
        match self {
            Runner::Bash(runner) => runner,
            Runner::Script(runner) => runner,
            Runner::Plugin(runner) => runner,
        }
    }
}

impl Runnable for Runner {
    fn precheck(&self) -> Result<()> {
        self.inner().precheck()
    }

    fn compile(&mut self, ctx: &mut RunnableContext) -> Result<()> {
        self.inner_mut().compile(ctx)
    }

    fn can_run(&self) -> bool {
        self.inner().can_run()
    }

    fn preflight_check(&self, parent_env: &SharedEnv, args: &SharedEnv, ctx: &mut RunnableContext) -> Result<()> {
        self.inner().preflight_check(parent_env, args, ctx)
    }

    fn run(&mut self, parent_env: &SharedEnv, ctx: &mut RunnableContext) -> RunnableResult {
        self.inner_mut().run(parent_env, ctx)
    }
}

/// Runs `run:` text with `bash -c` after template interpolation.
pub struct BashRunner {
    command: String,
    state: CompileState,
}

impl BashRunner {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            state: CompileState::Unattempted,
        }
    }

    fn check_syntax(&self) -> Result<()> {
        let tokens = scan_tokens(&self.command)?;
        let script: String = tokens
            .iter()
            .map(|token| match token.kind {
                TokenKind::RawString => token.value.as_str(),
                TokenKind::VarString => SYNTAX_PLACEHOLDER,
            })
            .collect();

        let output = Command::new(SHELL)
            .args(["-n", "-c", script.as_str()])
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("failed to execute {SHELL}"))?;
        if !output.status.success() {
            bail!("shell syntax error: {}", String::from_utf8_lossy(&output.stderr).trim());
        }
        Ok(())
    }

    fn execute(&self, env: &SharedEnv, ctx: &mut RunnableContext) -> Result<RunnableResult> {
        let variables = ctx.variables();
        let command = template::interpolate(&self.command, &mut ctx.scripts, env, &variables)?;
        debug!(command = %command, "running shell command");

        let mut process = Command::new(SHELL);
        process
            .arg("-c")
            .arg(&command)
            .env_clear()
            .envs(env.get_all())
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .stdout(if ctx.need_output { Stdio::piped() } else { Stdio::inherit() });
        let output = process.output().with_context(|| format!("failed to execute {SHELL}"))?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();

        Ok(match output.status.code() {
            Some(0) => RunnableResult::success(stdout),
            Some(code) => RunnableResult::failure(anyhow!("command exited with status {code}"), code).with_output(stdout),
            None => RunnableResult::failure(anyhow!("command was terminated by a signal"), 1).with_output(stdout),
        })
    }
}

impl Runnable for BashRunner {
    fn precheck(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            bail!("empty shell command");
        }
        Ok(())
    }

    fn compile(&mut self, _ctx: &mut RunnableContext) -> Result<()> {
        let outcome = self.check_syntax();
        self.state.record(&outcome);
        outcome
    }

    fn can_run(&self) -> bool {
        self.state == CompileState::Succeeded
    }

    fn preflight_check(&self, _parent_env: &SharedEnv, _args: &SharedEnv, _ctx: &mut RunnableContext) -> Result<()> {
        Ok(())
    }

    fn run(&mut self, parent_env: &SharedEnv, ctx: &mut RunnableContext) -> RunnableResult {
        self.execute(parent_env, ctx)
            .unwrap_or_else(|error| RunnableResult::failure(error, 1))
    }
}

/// Evaluates `script:` text in the shared script context.
pub struct ScriptRunner {
    script: String,
    state: CompileState,
}

impl ScriptRunner {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            state: CompileState::Unattempted,
        }
    }
}

impl Runnable for ScriptRunner {
    fn precheck(&self) -> Result<()> {
        if self.script.trim().is_empty() {
            bail!("empty script");
        }
        Ok(())
    }

    fn compile(&mut self, ctx: &mut RunnableContext) -> Result<()> {
        let outcome = ctx.scripts.compile(&self.script).map_err(anyhow::Error::from);
        self.state.record(&outcome);
        outcome
    }

    fn can_run(&self) -> bool {
        self.state == CompileState::Succeeded
    }

    fn preflight_check(&self, _parent_env: &SharedEnv, _args: &SharedEnv, _ctx: &mut RunnableContext) -> Result<()> {
        Ok(())
    }

    fn run(&mut self, parent_env: &SharedEnv, ctx: &mut RunnableContext) -> RunnableResult {
        let variables = ctx.variables();
        match ctx.scripts.run(parent_env, &self.script, &variables) {
            Ok(output) => RunnableResult::success(output),
            Err(error) => {
                let code = error.exit_code();
                RunnableResult::failure(error.into(), code)
            }
        }
    }
}

/// Delegates the lifecycle to a resolved [`Plugin`].
pub struct PluginRunner {
    plugin: Box<dyn Plugin>,
}

impl PluginRunner {
    pub fn new(reference: PluginRef, config: IndexMap<String, String>, registry: &PluginRegistry) -> Result<Self> {
        let plugin = match reference {
            PluginRef::Builtin { name } => registry
                .create(&name, &config)
                .ok_or_else(|| anyhow!("plugin '{name}' is not supported"))?,
            reference @ (PluginRef::Local { .. } | PluginRef::Remote { .. }) => Box::new(ScriptPlugin::new(reference, config)),
        };
        Ok(Self { plugin })
    }
}

impl Runnable for PluginRunner {
    fn precheck(&self) -> Result<()> {
        Ok(())
    }

    fn compile(&mut self, ctx: &mut RunnableContext) -> Result<()> {
        self.plugin.resolve(ctx)?;
        self.plugin.compile(ctx)
    }

    fn can_run(&self) -> bool {
        !self.plugin.needs_compile()
    }

    fn preflight_check(&self, parent_env: &SharedEnv, args: &SharedEnv, ctx: &mut RunnableContext) -> Result<()> {
        self.plugin.preflight_check(parent_env, args, ctx)
    }

    fn run(&mut self, parent_env: &SharedEnv, ctx: &mut RunnableContext) -> RunnableResult {
        self.plugin.run(parent_env, ctx)
    }
}
