use anyhow::Result;
use indexmap::IndexMap;
use serde_json::Value;
use stepline_util::{Env, ScopedEnv, SharedEnv};

use crate::config::EngineConfig;
use crate::plugin::PluginManager;
use crate::script::{ScriptContext, Variables};
use crate::status::{StatusId, StatusTree};

/// Per-run state threaded through every lifecycle call.
pub struct RunnableContext {
    /// Capture command output instead of streaming it.
    pub need_output: bool,
    /// Caller-supplied arguments, exposed to templates as `args`.
    pub args: SharedEnv,
    pub scripts: ScriptContext,
    pub plugins: PluginManager,
    pub config: EngineConfig,
    pub status: StatusTree,
    pub workflow_status: Option<StatusId>,
    pub job_status: Option<StatusId>,
    /// Workflow-level scope that write-through step scopes publish into.
    pub shared_env: Option<SharedEnv>,
}

impl RunnableContext {
    pub fn new(config: EngineConfig, args: IndexMap<String, String>) -> Result<Self> {
        Ok(Self {
            need_output: false,
            args: ScopedEnv::detached(args).into_shared(),
            scripts: ScriptContext::new()?,
            plugins: PluginManager::from_config(&config),
            config,
            status: StatusTree::new(),
            workflow_status: None,
            job_status: None,
            shared_env: None,
        })
    }

    pub fn with_output(mut self, need_output: bool) -> Self {
        self.need_output = need_output;
        self
    }

    /// `{args}` only; used before any job exists.
    pub fn args_variables(&self) -> Variables {
        let args: serde_json::Map<String, Value> = self
            .args
            .get_all()
            .into_iter()
            .map(|(key, value)| (key, Value::String(value)))
            .collect();
        let mut variables = Variables::new();
        variables.insert("args".to_string(), Value::Object(args));
        variables
    }

    /// `{args, job, workflow}` as seen by template expressions.
    pub fn variables(&self) -> Variables {
        let mut variables = self.args_variables();
        if let Some(job) = self.job_status {
            variables.insert("job".to_string(), self.status.snapshot(job));
        }
        if let Some(workflow) = self.workflow_status {
            variables.insert("workflow".to_string(), self.status.snapshot(workflow));
        }
        variables
    }
}
