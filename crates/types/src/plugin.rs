//! Plugin manifest (`manifest.yml`) schema.

use serde::Deserialize;

/// Parsed plugin manifest.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct PluginManifest {
    #[serde(default)]
    pub metadata: PluginManifestMetadata,
    #[serde(default)]
    pub runtime: PluginRuntime,
}

/// Descriptive plugin metadata.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct PluginManifestMetadata {
    /// Workflow document version the plugin targets.
    #[serde(default)]
    pub workflow_version: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Runtime requirements of the plugin.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct PluginRuntime {
    #[serde(default)]
    pub args: Vec<PluginArgSpec>,
}

/// One configuration argument the plugin reads from its `with` map.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct PluginArgSpec {
    pub name: String,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub required: bool,
}

impl PluginManifest {
    /// Parse a manifest from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    /// Arguments that must be present before the plugin may run.
    pub fn required_args(&self) -> impl Iterator<Item = &PluginArgSpec> {
        self.runtime.args.iter().filter(|arg| arg.required)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_parses_runtime_arguments() {
        let manifest = PluginManifest::from_yaml(
            r#"
metadata:
  workflow_version: "1"
  version: v2.0.1
  name: uploader
  description: Uploads build output
runtime:
  args:
    - name: bucket
      pattern: "^[a-z-]+$"
      required: true
    - name: prefix
"#,
        )
        .expect("parse manifest");

        assert_eq!(manifest.metadata.name, "uploader");
        assert_eq!(manifest.runtime.args.len(), 2);
        let required: Vec<&str> = manifest.required_args().map(|arg| arg.name.as_str()).collect();
        assert_eq!(required, vec!["bucket"]);
        assert!(!manifest.runtime.args[1].required);
    }

    #[test]
    fn empty_manifest_uses_defaults() {
        let manifest = PluginManifest::from_yaml("{}").expect("parse manifest");
        assert!(manifest.runtime.args.is_empty());
        assert_eq!(manifest.metadata, PluginManifestMetadata::default());
    }
}
