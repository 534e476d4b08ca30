use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use super::Plugin;

/// Builds a plugin instance from a step's raw `with` map.
pub type PluginFactory = Arc<dyn Fn(&IndexMap<String, String>) -> Box<dyn Plugin> + Send + Sync>;

/// Built-in plugins available to `uses: <name>` steps.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: IndexMap<String, PluginFactory>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&IndexMap<String, String>) -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn create(&self, name: &str, config: &IndexMap<String, String>) -> Option<Box<dyn Plugin>> {
        self.factories.get(name).map(|factory| factory(config))
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
