use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use indexmap::IndexMap;
use serde_json::json;
use stepline_types::{PluginManifest, validate_pattern};
use stepline_util::{Env, SharedEnv};
use tracing::info;

use super::{LOCAL_VERSION, Plugin, PluginMetadata, PluginRef};
use crate::error::into_result;
use crate::runnable::{RunnableContext, RunnableResult};
use crate::template::{contains_template, interpolate_map};

/// Plugin backed by a `main.lua` / `manifest.yml` directory.
///
/// The entry script runs with two extra bindings: `config`, the interpolated
/// `with` map, and `plugin`, holding `name`, `version` and `path`.
pub struct ScriptPlugin {
    reference: PluginRef,
    config: IndexMap<String, String>,
    metadata: Option<Arc<PluginMetadata>>,
    manifest: Option<PluginManifest>,
    script_key: Option<String>,
}

impl ScriptPlugin {
    pub fn new(reference: PluginRef, config: IndexMap<String, String>) -> Self {
        Self {
            reference,
            config,
            metadata: None,
            manifest: None,
            script_key: None,
        }
    }

    fn execute(&self, env: &SharedEnv, ctx: &mut RunnableContext) -> Result<String> {
        let (Some(metadata), Some(manifest), Some(key)) = (&self.metadata, &self.manifest, &self.script_key) else {
            bail!("plugin '{}' has not been compiled", self.name());
        };

        let variables = ctx.variables();
        let config = interpolate_map(&self.config, &mut ctx.scripts, env, &variables)
            .with_context(|| format!("plugin '{}': invalid configuration", self.name()))?;
        for arg in &manifest.runtime.args {
            if let Some(value) = config.get(&arg.name) {
                validate_pattern(&self.argument_subject(&arg.name), value, arg.pattern.as_deref()).map_err(|message| anyhow!(message))?;
            }
        }

        let mut bindings = serde_json::Map::new();
        bindings.insert("config".to_string(), json!(config));
        bindings.insert(
            "plugin".to_string(),
            json!({
                "name": metadata.name,
                "version": metadata.version,
                "path": metadata.path.display().to_string(),
            }),
        );

        info!(plugin = %metadata.name, version = %metadata.version, "running plugin");
        let output = ctx.scripts.run_compiled(env, key, &variables, &bindings)?;
        Ok(output)
    }

    fn argument_subject(&self, name: &str) -> String {
        format!("plugin '{}' argument '{name}'", self.name())
    }
}

impl Plugin for ScriptPlugin {
    fn name(&self) -> &str {
        self.reference.name()
    }

    fn resolve(&mut self, ctx: &mut RunnableContext) -> Result<()> {
        if self.metadata.is_some() {
            return Ok(());
        }
        let metadata = match &self.reference {
            PluginRef::Local { name, path } => ctx.plugins.load_plugin(name, LOCAL_VERSION, None, Some(path.as_path()))?,
            PluginRef::Remote { name, version } => {
                let token = ctx.config.plugin_token.clone();
                ctx.plugins.load_plugin(name, version, token.as_deref(), None)?
            }
            PluginRef::Builtin { name } => bail!("plugin '{name}' is not a script plugin"),
        };
        self.manifest = Some(metadata.manifest()?);
        self.metadata = Some(metadata);
        Ok(())
    }

    fn compile(&mut self, ctx: &mut RunnableContext) -> Result<()> {
        self.resolve(ctx)?;
        let Some(metadata) = &self.metadata else {
            bail!("plugin '{}' could not be resolved", self.name());
        };
        let key = ctx
            .scripts
            .compile_file(&metadata.main_path)
            .with_context(|| format!("plugin '{}': failed to compile {}", metadata.name, metadata.main_path.display()))?;
        self.script_key = Some(key);
        Ok(())
    }

    fn needs_compile(&self) -> bool {
        self.script_key.is_none()
    }

    fn preflight_check(&self, env: &SharedEnv, _args: &SharedEnv, _ctx: &mut RunnableContext) -> Result<()> {
        let manifest = self
            .manifest
            .as_ref()
            .ok_or_else(|| anyhow!("plugin '{}' has not been resolved", self.name()))?;

        let mut errors = Vec::new();
        for arg in &manifest.runtime.args {
            let value = self.config.get(&arg.name).cloned().or_else(|| env.get(&arg.name));
            match value {
                None if arg.required => {
                    errors.push(anyhow!("plugin '{}': required argument '{}' is not set", self.name(), arg.name));
                }
                None => {}
                // Templated values are only known at run time.
                Some(value) if contains_template(&value) => {}
                Some(value) => {
                    if let Err(message) = validate_pattern(&self.argument_subject(&arg.name), &value, arg.pattern.as_deref()) {
                        errors.push(anyhow!(message));
                    }
                }
            }
        }
        into_result(errors)
    }

    fn run(&mut self, env: &SharedEnv, ctx: &mut RunnableContext) -> RunnableResult {
        match self.execute(env, ctx) {
            Ok(output) => RunnableResult::success(output),
            Err(error) => RunnableResult::failure(error, 1),
        }
    }
}
