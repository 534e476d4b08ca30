use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use indexmap::IndexMap;
use stepline_engine::{
    EngineConfig, OsEnv, PluginRegistry, RunnableContext, RunnableResult, Status, StatusId, StatusTree, Workflow,
    load_workflow_file,
};
use tracing::{debug, error};

#[derive(Debug, Parser)]
#[command(name = "stepline", version, about = "Run declarative shell, script and plugin workflows")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate, prepare and run a workflow
    Run {
        #[command(flatten)]
        target: WorkflowArgs,
        /// Capture step output and print it when the run ends
        #[arg(long)]
        capture_output: bool,
    },
    /// Validate and preflight a workflow without running it
    Check {
        #[command(flatten)]
        target: WorkflowArgs,
    },
}

#[derive(Debug, Args)]
struct WorkflowArgs {
    /// Path to the workflow YAML document
    workflow: PathBuf,
    /// Workflow argument, repeatable
    #[arg(long = "arg", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    args: Vec<(String, String)>,
    /// Private key required by `checks.private-key`
    #[arg(long, value_name = "PATH")]
    private_key: Option<PathBuf>,
    /// Base URL remote plugins are cloned from
    #[arg(long, value_name = "URL")]
    plugin_repository: Option<String>,
    /// Access token for the plugin repository
    #[arg(long, value_name = "TOKEN")]
    plugin_token: Option<String>,
    /// Plugin cache directory
    #[arg(long, value_name = "PATH")]
    cache_dir: Option<PathBuf>,
}

impl WorkflowArgs {
    fn config(&self) -> EngineConfig {
        let mut config = EngineConfig::from_env();
        if let Some(path) = &self.private_key {
            config.private_key = Some(path.clone());
        }
        if let Some(repository) = &self.plugin_repository {
            config.plugin_repository = Some(repository.clone());
        }
        if let Some(token) = &self.plugin_token {
            config.plugin_token = Some(token.clone());
        }
        if let Some(dir) = &self.cache_dir {
            config.cache_dir = dir.clone();
        }
        config
    }

    fn prepare(&self, capture_output: bool) -> Result<(Workflow, RunnableContext)> {
        let definition = load_workflow_file(&self.workflow)?;
        let args: IndexMap<String, String> = self.args.iter().cloned().collect();
        let ctx = RunnableContext::new(self.config(), args)?.with_output(capture_output);
        debug!(workflow = %definition.name, path = %self.workflow.display(), "workflow loaded");
        Ok((Workflow::new(&definition, &PluginRegistry::new()), ctx))
    }
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Run { target, capture_output } => match run(&target, capture_output) {
            Ok(code) => code,
            Err(err) => report(err),
        },
        Command::Check { target } => match check(&target) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => report(err),
        },
    }
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run(target: &WorkflowArgs, capture_output: bool) -> Result<ExitCode> {
    let (mut workflow, mut ctx) = target.prepare(capture_output)?;
    let result = workflow.execute(&OsEnv::shared(), &mut ctx);

    if capture_output && !result.output.is_empty() {
        print!("{}", result.output);
    }
    if let Some(root) = ctx.workflow_status {
        eprint!("{}", render_summary(&ctx.status, root));
    }
    Ok(exit_code(&result))
}

fn check(target: &WorkflowArgs) -> Result<()> {
    let (mut workflow, mut ctx) = target.prepare(false)?;
    workflow.prepare(&OsEnv::shared(), &mut ctx)?;
    eprintln!("workflow '{}' is ready to run", workflow.name());
    Ok(())
}

fn report(err: anyhow::Error) -> ExitCode {
    error!("{err:#}");
    eprintln!("error: {err:#}");
    ExitCode::FAILURE
}

fn exit_code(result: &RunnableResult) -> ExitCode {
    if let Some(message) = result.error_message() {
        eprintln!("error: {message}");
    }
    match result.return_code {
        0 if result.err.is_none() => ExitCode::SUCCESS,
        0 => ExitCode::FAILURE,
        code => ExitCode::from(u8::try_from(code).unwrap_or(1)),
    }
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("invalid KEY=VALUE: empty key in '{raw}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Indented status summary of a finished run.
fn render_summary(tree: &StatusTree, root: StatusId) -> String {
    let mut out = String::new();
    render_node(tree, root, 0, &mut out);
    out
}

fn render_node(tree: &StatusTree, id: StatusId, depth: usize, out: &mut String) {
    let node = tree.node(id);
    let mut line = format!("{:indent$}{} {}: {}", "", node.kind().as_str(), node.name(), node.status(), indent = depth * 2);
    if node.status() == Status::Fail && node.continue_on_err() {
        line.push_str(" (continued)");
    }
    let _ = writeln!(out, "{line}");
    for child in node.children() {
        render_node(tree, *child, depth + 1, out);
    }
}
