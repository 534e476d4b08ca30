use std::fs;
use std::path::Path;
use std::process::Command;

use indexmap::IndexMap;
use stepline_engine::plugin::GitOps;
use stepline_engine::{
    EngineConfig, OsEnv, PluginManager, PluginRegistry, RunnableContext, RunnableResult, Status, StatusId, Workflow,
    parse_workflow,
};
use tempfile::TempDir;

struct Harness {
    cache: TempDir,
}

impl Harness {
    fn new() -> Self {
        Self {
            cache: tempfile::tempdir().unwrap(),
        }
    }

    fn context(&self, args: &[(&str, &str)]) -> RunnableContext {
        let config = EngineConfig::default().with_cache_dir(self.cache.path());
        let args: IndexMap<String, String> = args.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        RunnableContext::new(config, args).unwrap().with_output(true)
    }

    fn run(&self, yaml: &str, args: &[(&str, &str)]) -> (RunnableResult, RunnableContext) {
        let definition = parse_workflow(yaml).unwrap();
        let mut ctx = self.context(args);
        let mut workflow = Workflow::new(&definition, &PluginRegistry::new());
        let result = workflow.execute(&OsEnv::shared(), &mut ctx);
        (result, ctx)
    }
}

fn job(ctx: &RunnableContext, name: &str) -> StatusId {
    let root = ctx.workflow_status.expect("workflow status");
    ctx.status.get_child(root, name).expect("job status")
}

#[test]
fn failing_job_stops_the_workflow() {
    let harness = Harness::new();
    let (result, ctx) = harness.run(
        r#"
name: two-jobs
jobs:
  first:
    steps:
      - name: succeed
        run: exit 0
  second:
    steps:
      - name: fail
        run: exit 1
  third:
    steps:
      - name: never
        run: echo never
"#,
        &[],
    );

    assert_ne!(result.return_code, 0);
    assert!(result.error_message().unwrap().contains("command exited with status 1"));

    let root = ctx.workflow_status.unwrap();
    assert_eq!(ctx.status.status(job(&ctx, "first")), Status::Pass);
    assert_eq!(ctx.status.future_status(job(&ctx, "first")), Status::Pass);
    assert_eq!(ctx.status.status(job(&ctx, "second")), Status::Fail);
    assert_eq!(ctx.status.future_status(job(&ctx, "second")), Status::Fail);
    assert!(ctx.status.get_child(root, "third").is_none());
    assert_eq!(ctx.status.status(root), Status::Fail);
    assert_eq!(ctx.status.future_status(root), Status::Fail);
}

#[test]
fn steps_keep_running_after_a_failure() {
    let harness = Harness::new();
    let (result, ctx) = harness.run(
        r#"
name: keep-going
jobs:
  build:
    steps:
      - name: broken
        run: exit 2
      - name: still runs
        run: echo after
"#,
        &[],
    );

    assert_eq!(result.return_code, stepline_engine::AGGREGATE_FAILURE_CODE);
    assert_eq!(result.output, "after\n");
    let build = job(&ctx, "build");
    assert_eq!(ctx.status.status(build), Status::Fail);
    let second = ctx.status.get_child(build, "still runs").unwrap();
    assert_eq!(ctx.status.status(second), Status::Pass);
}

#[test]
fn continue_on_error_and_conditions_shape_the_job() {
    let harness = Harness::new();
    let (result, ctx) = harness.run(
        r#"
name: gates
jobs:
  build:
    steps:
      - name: flaky
        id: flaky
        run: exit 4
        continue-on-error: "${{ args.strict ~= 'yes' }}"
      - name: recover
        if: "${{ job.by_name.flaky.status == 'fail' }}"
        script: "'recovered'"
      - name: deploy
        if: "${{ args.deploy == 'yes' }}"
        run: echo deploying
      - name: disabled
        if: false
        run: echo disabled
"#,
        &[("strict", "no"), ("deploy", "no")],
    );

    assert!(result.is_success(), "{:?}", result.error_message());
    assert_eq!(result.output, "recovered\n");

    let build = job(&ctx, "build");
    let flaky = ctx.status.get_child(build, "flaky").unwrap();
    assert_eq!(ctx.status.status(flaky), Status::Fail);
    assert!(ctx.status.node(flaky).continue_on_err());
    assert_eq!(ctx.status.future_status(flaky), Status::Pass);
    assert_eq!(ctx.status.status(ctx.status.get_child(build, "deploy").unwrap()), Status::Skipped);
    assert_eq!(ctx.status.status(ctx.status.get_child(build, "disabled").unwrap()), Status::Skipped);
    assert_eq!(ctx.status.status(build), Status::Pass);
    assert_eq!(ctx.status.future_status(ctx.workflow_status.unwrap()), Status::Pass);
}

#[test]
fn control_expression_failure_aborts_the_job() {
    let harness = Harness::new();
    let (result, ctx) = harness.run(
        r#"
name: guarded
jobs:
  guarded:
    steps:
      - name: broken gate
        if: "${{ missing_value }}"
        run: echo never
      - name: after
        run: echo after
"#,
        &[],
    );

    assert_eq!(result.return_code, stepline_engine::AGGREGATE_FAILURE_CODE);
    assert_eq!(result.output, "");
    let guarded = job(&ctx, "guarded");
    assert_eq!(ctx.status.status(guarded), Status::Fail);
    assert!(ctx.status.get_child(guarded, "after").is_none());
    assert!(ctx.status.reason(guarded).contains("no output"), "{}", ctx.status.reason(guarded));
}

#[test]
fn continue_on_error_evaluation_failure_aborts_the_job() {
    let harness = Harness::new();
    let (result, ctx) = harness.run(
        r#"
name: tolerant
jobs:
  tolerant:
    steps:
      - name: a
        run: exit 1
        continue-on-error: "${{ nope }}"
      - name: after
        run: echo after
"#,
        &[],
    );

    assert_eq!(result.return_code, stepline_engine::AGGREGATE_FAILURE_CODE);
    assert_eq!(result.output, "");
    let tolerant = job(&ctx, "tolerant");
    assert_eq!(ctx.status.status(tolerant), Status::Fail);
    assert!(ctx.status.get_child(tolerant, "after").is_none());
    let reason = ctx.status.reason(tolerant);
    assert!(reason.contains("step 'a': invalid continue-on-error"), "{reason}");
}

#[test]
fn write_through_env_reaches_later_jobs() {
    let harness = Harness::new();
    let (result, _ctx) = harness.run(
        r#"
name: publish
env:
  CHANNEL: "${{ 'rel-' .. args.version }}"
jobs:
  produce:
    steps:
      - name: record
        script: "env.set('ARTIFACT', 'pkg-' .. args.version .. '.tgz')"
  consume:
    env:
      SUFFIX: done
    steps:
      - name: show
        run: echo "$ARTIFACT $SUFFIX $CHANNEL"
"#,
        &[("version", "1.2")],
    );

    assert!(result.is_success(), "{:?}", result.error_message());
    assert_eq!(result.output, "pkg-1.2.tgz done rel-1.2\n");
}

#[test]
fn status_snapshots_index_from_one() {
    let harness = Harness::new();
    let (result, _ctx) = harness.run(
        r#"
name: indexed
jobs:
  build:
    steps:
      - name: compile
        run: "true"
  report:
    steps:
      - name: first
        run: "true"
      - name: summary
        run: echo "${{ workflow.jobs[1].name }}/${{ workflow.jobs[1].status }} ${{ job.steps[1].name }} ${{ workflow.jobs[0] == nil }}"
"#,
        &[],
    );

    assert!(result.is_success(), "{:?}", result.error_message());
    assert_eq!(result.output, "build/pass first true\n");
}

#[test]
fn structural_errors_are_reported_together() {
    let harness = Harness::new();
    let definition = parse_workflow(
        r#"
name: broken
jobs:
  bad:
    steps:
      - name: both
        run: "true"
        script: "1"
      - name: neither
      - name: unknown plugin
        uses: notify
"#,
    )
    .unwrap();
    let mut ctx = harness.context(&[]);
    let mut workflow = Workflow::new(&definition, &PluginRegistry::new());
    let error = workflow.prepare(&OsEnv::shared(), &mut ctx).unwrap_err();
    let message = format!("{error:#}");

    assert!(message.contains("step 'both': multiple of script/run/uses specified"), "{message}");
    assert!(message.contains("step 'neither': no script/run/uses specified"), "{message}");
    assert!(message.contains("plugin 'notify' is not supported"), "{message}");
}

#[test]
fn preflight_reports_every_unmet_requirement() {
    let harness = Harness::new();
    let (result, ctx) = harness.run(
        r#"
name: guarded
checks:
  private-key: true
  args:
    - name: version
      pattern: '^v\d+\.\d+$'
    - name: channel
  envs:
    - name: DEPLOY_REGION
      pattern: '^(eu|us)$'
env:
  DEPLOY_REGION: mars
jobs:
  noop:
    steps:
      - name: noop
        run: "true"
"#,
        &[("version", "1.0")],
    );

    let message = result.error_message().unwrap();
    assert!(message.contains("argument 'version' does not match the pattern"), "{message}");
    assert!(message.contains("required argument 'channel' is not provided"), "{message}");
    assert!(message.contains("environment variable 'DEPLOY_REGION' does not match the pattern"), "{message}");
    assert!(message.contains("private key is required but not configured"), "{message}");
    assert!(ctx.workflow_status.is_none());
}

#[test]
fn missing_working_dir_fails_the_run() {
    let harness = Harness::new();
    let missing = harness.cache.path().join("absent");
    let (result, ctx) = harness.run(
        &format!(
            "name: wd\nworking-dir: {}\njobs:\n  a:\n    steps:\n      - name: s\n        run: \"true\"\n",
            missing.display()
        ),
        &[],
    );
    assert!(result.error_message().unwrap().contains("does not exist"));
    assert_eq!(ctx.status.status(ctx.workflow_status.unwrap()), Status::Fail);
}

fn write_deploy_plugin(dir: &Path) {
    fs::create_dir_all(dir).unwrap();
    fs::write(
        dir.join("main.lua"),
        "env.set('DEPLOYED_TO', config.target)\nreturn plugin.name .. ' deployed ' .. config.target .. ' for ' .. args.version\n",
    )
    .unwrap();
    fs::write(
        dir.join("manifest.yml"),
        r#"
metadata:
  name: deploy
  version: 1.0.0
  description: test deploy plugin
runtime:
  args:
    - name: target
      pattern: '^(staging|prod)$'
      required: true
"#,
    )
    .unwrap();
}

#[test]
fn local_plugin_runs_with_config_and_publishes_env() {
    let harness = Harness::new();
    let plugins = tempfile::tempdir().unwrap();
    let plugin_dir = plugins.path().join("deploy");
    write_deploy_plugin(&plugin_dir);

    let (result, _ctx) = harness.run(
        &format!(
            r#"
name: ship
jobs:
  ship:
    steps:
      - name: deploy
        uses: {}
        with:
          target: "${{{{ args.target }}}}"
      - name: report
        run: echo "deployed=$DEPLOYED_TO"
"#,
            plugin_dir.display()
        ),
        &[("target", "prod"), ("version", "1.2")],
    );

    assert!(result.is_success(), "{:?}", result.error_message());
    assert_eq!(result.output, "deploy deployed prod for 1.2\ndeployed=prod\n");
}

#[test]
fn local_plugins_with_the_same_directory_name_run_their_own_code() {
    let harness = Harness::new();
    let plugins = tempfile::tempdir().unwrap();
    let mut dirs = Vec::new();
    for team in ["ci", "ops"] {
        let dir = plugins.path().join(team).join("deploy");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("main.lua"), format!("return 'from-{team}'\n")).unwrap();
        fs::write(dir.join("manifest.yml"), "metadata:\n  name: deploy\n").unwrap();
        dirs.push(dir);
    }

    let (result, ctx) = harness.run(
        &format!(
            "name: teams\njobs:\n  ship:\n    steps:\n      - name: ci\n        uses: {}\n      - name: ops\n        uses: {}\n",
            dirs[0].display(),
            dirs[1].display()
        ),
        &[],
    );

    assert!(result.is_success(), "{:?}", result.error_message());
    assert_eq!(result.output, "from-ci\nfrom-ops\n");
    assert_eq!(ctx.plugins.len(), 2);
}

#[test]
fn local_plugin_preflight_checks_manifest_args() {
    let harness = Harness::new();
    let plugins = tempfile::tempdir().unwrap();
    let plugin_dir = plugins.path().join("deploy");
    write_deploy_plugin(&plugin_dir);

    let yaml = |with: &str| {
        format!(
            "name: ship\njobs:\n  ship:\n    steps:\n      - name: deploy\n        uses: {}\n{with}",
            plugin_dir.display()
        )
    };

    let (result, _) = harness.run(&yaml(""), &[]);
    assert!(result.error_message().unwrap().contains("required argument 'target' is not set"));

    let (result, _) = harness.run(&yaml("        with:\n          target: moon\n"), &[]);
    assert!(
        result
            .error_message()
            .unwrap()
            .contains("plugin 'deploy' argument 'target' does not match the pattern")
    );
}

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(["-c", "user.name=stepline", "-c", "user.email=stepline@example.com"])
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(status.status.success(), "git {args:?}: {}", String::from_utf8_lossy(&status.stderr));
}

#[test]
fn remote_plugin_is_cloned_once_and_cached() {
    if !GitOps::is_available() {
        eprintln!("git is not available, skipping");
        return;
    }
    let repos = tempfile::tempdir().unwrap();
    let repo = repos.path().join("deploy");
    write_deploy_plugin(&repo);
    git(&repo, &["init", "--quiet"]);
    git(&repo, &["add", "."]);
    git(&repo, &["commit", "--quiet", "-m", "initial"]);
    git(&repo, &["tag", "v1"]);

    let cache = tempfile::tempdir().unwrap();
    let repository = format!("file://{}", repos.path().display());
    let mut manager = PluginManager::new(cache.path(), Some(repository.clone()));
    let first = manager.load_plugin("deploy", "v1", None, None).unwrap();
    let second = manager.load_plugin("deploy", "v1", None, None).unwrap();
    assert!(std::sync::Arc::ptr_eq(&first, &second));
    assert!(first.main_path.is_file());
    assert_eq!(first.path, manager.checkout_dir("deploy", "v1"));

    // A fresh manager reuses the clean checkout on disk.
    let mut fresh = PluginManager::new(cache.path(), Some(repository));
    let reused = fresh.load_plugin("deploy", "v1", None, None).unwrap();
    assert_eq!(reused.path, first.path);
    assert_eq!(reused.manifest().unwrap().metadata.name, "deploy");

    let error = fresh.load_plugin("deploy", "v9", None, None).unwrap_err();
    assert!(error.to_string().contains("failed to fetch plugin 'deploy@v9'"), "{error}");
}
