//! Analysis plugin capability interface and registry
//!
//! Anything implementing [`AnalysisPlugin`] can be scheduled. Plugins are
//! collected into a [`PluginRegistry`] once at startup; the analysis scheduler
//! only ever sees the registry.

use crate::config::AnalysisConfig;
use crate::error::ConfigError;
use crate::objects::mime::MimeFilter;
use crate::objects::{AnalysisEntry, FileObject};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub mod builtin;
pub mod runner;

pub use runner::{AnalysisTask, PluginOutcome, PluginRunner, RunnerSettings};

/// Declared properties of a plugin
#[derive(Debug, Clone, Serialize)]
pub struct PluginMetadata {
    pub name: &'static str,
    pub description: &'static str,
    pub version: &'static str,
    pub dependencies: Vec<&'static str>,
    /// When non-empty only these mime types are analyzed
    pub mime_whitelist: Vec<&'static str>,
    pub mime_blacklist: Vec<&'static str>,
    pub timeout: Duration,
    pub process_count: usize,
}

/// What a plugin gets to see of an object
#[derive(Debug, Clone)]
pub struct AnalysisTarget {
    pub uid: String,
    pub path: PathBuf,
    pub mime: String,
    pub size: u64,
    /// Results of the plugin's declared dependencies, keyed by plugin name
    pub dependencies: BTreeMap<String, Value>,
}

impl AnalysisTarget {
    pub fn for_object(object: &FileObject, dependencies: &[&str]) -> Self {
        let dependencies = dependencies
            .iter()
            .filter_map(|name| {
                object
                    .processed_analysis
                    .get(*name)
                    .map(|entry| (name.to_string(), entry.result.clone()))
            })
            .collect();
        Self {
            uid: object.uid.clone(),
            path: object.file_path.clone(),
            mime: object.mime.clone(),
            size: object.size,
            dependencies,
        }
    }

    pub fn open(&self) -> io::Result<File> {
        File::open(&self.path)
    }

    pub fn read(&self) -> io::Result<Vec<u8>> {
        fs::read(&self.path)
    }
}

pub trait AnalysisPlugin: Send + Sync + 'static {
    fn metadata(&self) -> &PluginMetadata;

    fn analyze(&self, target: &AnalysisTarget) -> anyhow::Result<Value>;

    fn summarize(&self, result: &Value) -> String;
}

/// Run a plugin and wrap its output in an analysis entry
pub fn get_analysis(plugin: &dyn AnalysisPlugin, target: &AnalysisTarget) -> anyhow::Result<AnalysisEntry> {
    let result = plugin.analyze(target)?;
    let summary = plugin.summarize(&result);
    Ok(AnalysisEntry::new(plugin.metadata().version, result, summary))
}

/// A plugin with config overrides applied and its mime filters compiled
pub struct RegisteredPlugin {
    plugin: Arc<dyn AnalysisPlugin>,
    whitelist: MimeFilter,
    blacklist: MimeFilter,
    timeout: Duration,
    process_count: usize,
}

impl RegisteredPlugin {
    pub fn new(plugin: Arc<dyn AnalysisPlugin>) -> Result<Self, ConfigError> {
        let meta = plugin.metadata();
        Ok(Self {
            whitelist: MimeFilter::new(&meta.mime_whitelist)?,
            blacklist: MimeFilter::new(&meta.mime_blacklist)?,
            timeout: meta.timeout,
            process_count: meta.process_count.max(1),
            plugin,
        })
    }

    pub fn name(&self) -> &'static str {
        self.plugin.metadata().name
    }

    pub fn version(&self) -> &'static str {
        self.plugin.metadata().version
    }

    pub fn metadata(&self) -> &PluginMetadata {
        self.plugin.metadata()
    }

    pub fn dependencies(&self) -> &[&'static str] {
        &self.plugin.metadata().dependencies
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn process_count(&self) -> usize {
        self.process_count
    }

    pub fn plugin(&self) -> &dyn AnalysisPlugin {
        self.plugin.as_ref()
    }

    pub fn accepts_mime(&self, mime: &str) -> bool {
        if !self.whitelist.is_empty() && !self.whitelist.is_match(mime) {
            return false;
        }
        !self.blacklist.is_match(mime)
    }
}

/// All plugins known to a pipeline, keyed by name
#[derive(Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<&'static str, Arc<RegisteredPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in plugin
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for plugin in builtin::all() {
            // built-in names are unique and their patterns are static
            if let Err(e) = registry.register(plugin) {
                tracing::error!(error = %e, "failed to register built-in plugin");
            }
        }
        registry
    }

    pub fn register(&mut self, plugin: Arc<dyn AnalysisPlugin>) -> Result<(), ConfigError> {
        let name = plugin.metadata().name;
        if self.plugins.contains_key(name) {
            return Err(ConfigError::invalid("plugins", format!("plugin {name} registered twice")));
        }
        self.plugins.insert(name, Arc::new(RegisteredPlugin::new(plugin)?));
        Ok(())
    }

    /// Apply per-plugin overrides and drop disabled plugins
    pub fn configure(mut self, config: &AnalysisConfig) -> Result<Self, ConfigError> {
        for (name, overrides) in &config.plugins {
            let Some(registered) = self.plugins.get(name.as_str()) else {
                tracing::warn!(plugin = %name, "configuration for unknown plugin ignored");
                continue;
            };
            if !overrides.enabled {
                self.plugins.remove(name.as_str());
                continue;
            }
            let mut updated = RegisteredPlugin::new(Arc::clone(&registered.plugin))?;
            if let Some(count) = overrides.process_count {
                updated.process_count = count.max(1);
            }
            if let Some(ms) = overrides.timeout_ms {
                updated.timeout = Duration::from_millis(ms);
            }
            self.plugins.insert(updated.name(), Arc::new(updated));
        }

        for name in &config.default_plugins {
            if !self.plugins.contains_key(name.as_str()) {
                return Err(ConfigError::UnknownPlugin(name.clone()));
            }
        }
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<RegisteredPlugin>> {
        self.plugins.get(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.plugins.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<RegisteredPlugin>> {
        self.plugins.values()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Declared dependencies that no registered plugin provides, as (plugin, dependency)
    pub fn missing_dependencies(&self) -> Vec<(&'static str, &'static str)> {
        self.plugins
            .values()
            .flat_map(|p| {
                p.dependencies()
                    .iter()
                    .filter(|dep| !self.plugins.contains_key(*dep))
                    .map(move |dep| (p.name(), *dep))
            })
            .collect()
    }

    /// Close `selected` over declared dependencies
    ///
    /// An empty selection means every registered plugin. Unknown names are ignored.
    pub fn with_dependencies(&self, selected: &[String]) -> BTreeSet<&'static str> {
        let mut stack: Vec<&str> = if selected.is_empty() {
            self.names()
        } else {
            selected.iter().map(String::as_str).collect()
        };
        let mut closed = BTreeSet::new();
        while let Some(name) = stack.pop() {
            let Some(plugin) = self.plugins.get(name) else {
                continue;
            };
            if closed.insert(plugin.name()) {
                stack.extend(plugin.dependencies().iter().copied());
            }
        }
        closed
    }
}


#[cfg(test)]
mod tests {
    use super::testing::TestPlugin;
    use super::*;
    use crate::config::PluginOverride;

    #[test]
    fn test_builtin_registry() {
        let registry = PluginRegistry::builtin();
        let names = registry.names();
        for expected in ["entropy", "file_hashes", "file_type", "printable_strings"] {
            assert!(names.contains(&expected), "missing {expected}");
        }
        assert!(registry.missing_dependencies().is_empty());
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = PluginRegistry::new();
        registry.register(TestPlugin::new("dup").arc()).unwrap();
        assert!(registry.register(TestPlugin::new("dup").arc()).is_err());
    }

    #[test]
    fn test_mime_eligibility() {
        let plugin = RegisteredPlugin::new(TestPlugin::new("text_only").whitelist(&["text/*"]).arc()).unwrap();
        assert!(plugin.accepts_mime("text/plain"));
        assert!(!plugin.accepts_mime("application/zip"));

        let mut meta_plugin = TestPlugin::new("no_zip");
        meta_plugin.meta.mime_blacklist = vec!["application/zip"];
        let plugin = RegisteredPlugin::new(meta_plugin.arc()).unwrap();
        assert!(plugin.accepts_mime("text/plain"));
        assert!(!plugin.accepts_mime("application/zip"));
    }

    #[test]
    fn test_configure_overrides() {
        let mut config = AnalysisConfig::default();
        config.plugins.insert(
            "a".into(),
            PluginOverride {
                process_count: Some(3),
                timeout_ms: Some(250),
                enabled: true,
            },
        );
        config.plugins.insert(
            "b".into(),
            PluginOverride {
                enabled: false,
                ..Default::default()
            },
        );

        let mut registry = PluginRegistry::new();
        registry.register(TestPlugin::new("a").arc()).unwrap();
        registry.register(TestPlugin::new("b").arc()).unwrap();
        let registry = registry.configure(&config).unwrap();

        assert_eq!(registry.names(), vec!["a"]);
        let a = registry.get("a").unwrap();
        assert_eq!(a.process_count(), 3);
        assert_eq!(a.timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_configure_rejects_unknown_default_plugin() {
        let config = AnalysisConfig {
            default_plugins: vec!["nope".into()],
            ..Default::default()
        };
        let result = PluginRegistry::new().configure(&config);
        assert!(matches!(result, Err(ConfigError::UnknownPlugin(_))));
    }

    #[test]
    fn test_dependency_closure() {
        let mut registry = PluginRegistry::new();
        registry.register(TestPlugin::new("base").arc()).unwrap();
        registry.register(TestPlugin::new("middle").depends_on(&["base"]).arc()).unwrap();
        registry.register(TestPlugin::new("top").depends_on(&["middle"]).arc()).unwrap();
        registry.register(TestPlugin::new("other").arc()).unwrap();

        let closed = registry.with_dependencies(&["top".to_string()]);
        assert_eq!(closed.into_iter().collect::<Vec<_>>(), vec!["base", "middle", "top"]);
        assert_eq!(registry.with_dependencies(&[]).len(), 4);
    }

    #[test]
    fn test_missing_dependencies_reported() {
        let mut registry = PluginRegistry::new();
        registry.register(TestPlugin::new("orphan").depends_on(&["ghost"]).arc()).unwrap();
        assert_eq!(registry.missing_dependencies(), vec![("orphan", "ghost")]);
    }

    #[test]
    fn test_get_analysis_builds_entry() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("f");
        fs::write(&path, b"abc").unwrap();
        let object = FileObject::from_path(&path).unwrap();
        let target = AnalysisTarget::for_object(&object, &[]);

        let plugin = TestPlugin::new("t");
        let entry = get_analysis(&plugin, &target).unwrap();
        assert_eq!(entry.plugin_version, "0.0.1");
        assert_eq!(entry.summary, "t done");
        assert_eq!(entry.result["size"], 3);
    }
}
