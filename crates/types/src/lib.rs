//! Shared document model for stepline workflows and plugins.
//!
//! These types describe what an author writes (workflow YAML, plugin
//! manifests). They carry no behaviour beyond deserialization and small
//! validation helpers; the engine crate turns them into runnable objects.

pub mod plugin;
pub mod workflow;

pub use plugin::{PluginArgSpec, PluginManifest, PluginManifestMetadata, PluginRuntime};
pub use workflow::validation::validate_pattern;
pub use workflow::{CheckItem, ChecksDefinition, ControlExpression, JobDefinition, StepDefinition, WorkflowDefinition};

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer};
use serde_yaml::Value as YamlValue;

/// Renders a YAML scalar as the string an author would expect to see.
///
/// Strings are returned verbatim, numbers and booleans use their canonical
/// text form, and `null` becomes the empty string. Sequences and mappings are
/// rejected because the environment and `with` maps are flat.
pub fn scalar_to_string(value: &YamlValue) -> Result<String, String> {
    match value {
        YamlValue::String(text) => Ok(text.clone()),
        YamlValue::Bool(flag) => Ok(flag.to_string()),
        YamlValue::Number(number) => Ok(number.to_string()),
        YamlValue::Null => Ok(String::new()),
        YamlValue::Tagged(tagged) => scalar_to_string(&tagged.value),
        YamlValue::Sequence(_) | YamlValue::Mapping(_) => Err("expected a scalar value, found a sequence or mapping".to_string()),
    }
}

/// Deserializes a mapping of scalars into an ordered string map.
pub fn deserialize_string_map<'de, D>(deserializer: D) -> Result<IndexMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<IndexMap<String, YamlValue>>::deserialize(deserializer)?.unwrap_or_default();
    raw.into_iter()
        .map(|(key, value)| {
            scalar_to_string(&value)
                .map(|text| (key.clone(), text))
                .map_err(|error| serde::de::Error::custom(format!("key '{key}': {error}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Holder {
        #[serde(default, deserialize_with = "deserialize_string_map")]
        values: IndexMap<String, String>,
    }

    #[test]
    fn scalars_are_rendered_as_strings() {
        let holder: Holder = serde_yaml::from_str("values:\n  PORT: 8080\n  DEBUG: true\n  NAME: api\n  EMPTY:\n").unwrap();
        assert_eq!(holder.values["PORT"], "8080");
        assert_eq!(holder.values["DEBUG"], "true");
        assert_eq!(holder.values["NAME"], "api");
        assert_eq!(holder.values["EMPTY"], "");
        let keys: Vec<&str> = holder.values.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["PORT", "DEBUG", "NAME", "EMPTY"]);
    }

    #[test]
    fn nested_values_are_rejected() {
        let result = serde_yaml::from_str::<Holder>("values:\n  LIST: [1, 2]\n");
        let error = result.err().expect("sequence must be rejected").to_string();
        assert!(error.contains("LIST"), "unexpected error: {error}");
    }
}
