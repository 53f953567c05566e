// cmh-common/src/registry.rs
// Index of available module definitions, loaded from modules.json sources.

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use semver::Version;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{CmhError, Result};
use crate::model::ModuleDescriptor;

/// Where module definitions come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrySource {
    File(PathBuf),
    /// An in-memory document, named for diagnostics.
    Inline { name: String, content: String },
}

impl RegistrySource {
    pub fn inline(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Inline {
            name: name.into(),
            content: content.into(),
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::File(path) => path.display().to_string(),
            Self::Inline { name, .. } => name.clone(),
        }
    }

    fn read(&self) -> Result<String> {
        match self {
            Self::File(path) => fs::read_to_string(path).map_err(|e| CmhError::RegistryLoad {
                origin: self.label(),
                entry: None,
                message: format!("cannot read file: {e}"),
            }),
            Self::Inline { content, .. } => Ok(content.clone()),
        }
    }
}

/// Immutable snapshot of every loaded module definition.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<String, Arc<ModuleDescriptor>>,
    categories: BTreeMap<String, String>,
    skipped: Vec<CmhError>,
}

impl ModuleRegistry {
    /// Loads all sources in order. The earliest source wins when two define
    /// the same module. Malformed entries are skipped and recorded; a source
    /// that is malformed as a whole aborts the load.
    pub fn load(sources: &[RegistrySource]) -> Result<Self> {
        let mut registry = Self::default();
        for source in sources {
            registry.load_source(source)?;
        }
        debug!(
            "Registry loaded {} modules from {} sources ({} entries skipped).",
            registry.modules.len(),
            sources.len(),
            registry.skipped.len()
        );
        Ok(registry)
    }

    /// Builds a registry straight from descriptors; later duplicates are skipped.
    pub fn from_descriptors(descriptors: impl IntoIterator<Item = ModuleDescriptor>) -> Self {
        let mut registry = Self::default();
        for descriptor in descriptors {
            registry.insert("<memory>", descriptor);
        }
        registry
    }

    fn insert(&mut self, origin: &str, descriptor: ModuleDescriptor) {
        match self.modules.entry(descriptor.name.clone()) {
            btree_map::Entry::Vacant(slot) => {
                slot.insert(Arc::new(descriptor));
            }
            btree_map::Entry::Occupied(_) => {
                warn!(
                    "Module '{}' from {} is already defined by an earlier source; skipping.",
                    descriptor.name, origin
                );
                self.skipped.push(CmhError::RegistryLoad {
                    origin: origin.to_string(),
                    entry: Some(descriptor.name),
                    message: "duplicate module name".to_string(),
                });
            }
        }
    }

    fn load_source(&mut self, source: &RegistrySource) -> Result<()> {
        let origin = source.label();
        debug!("Loading module definitions from {}", origin);
        let raw = source.read()?;

        let document: Value = serde_json::from_str(&raw).map_err(|e| CmhError::RegistryLoad {
            origin: origin.clone(),
            entry: None,
            message: format!("invalid JSON: {e}"),
        })?;
        let Some(Value::Array(entries)) = document.get("modules") else {
            return Err(CmhError::RegistryLoad {
                origin,
                entry: None,
                message: "missing 'modules' array".to_string(),
            });
        };

        if let Some(Value::Object(categories)) = document.get("categories") {
            for (id, title) in categories {
                if let Some(title) = title.as_str() {
                    self.categories
                        .entry(id.clone())
                        .or_insert_with(|| title.to_string());
                }
            }
        }

        for (index, entry) in entries.iter().enumerate() {
            let label = entry
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("#{index}"));
            match ModuleDescriptor::from_entry(entry.clone()) {
                Ok(descriptor) => self.insert(&origin, descriptor),
                Err(message) => {
                    warn!("Skipping module entry {} in {}: {}", label, origin, message);
                    self.skipped.push(CmhError::RegistryLoad {
                        origin: origin.clone(),
                        entry: Some(label),
                        message,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn find(&self, name: &str) -> Result<Arc<ModuleDescriptor>> {
        self.modules
            .get(name)
            .cloned()
            .ok_or_else(|| CmhError::ModuleNotFound {
                name: name.to_string(),
                requesters: Vec::new(),
            })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ModuleDescriptor>> {
        self.modules.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Available versions, highest first.
    pub fn list_versions(&self, name: &str) -> Result<&[Version]> {
        self.modules
            .get(name)
            .map(|m| m.versions.as_slice())
            .ok_or_else(|| CmhError::ModuleNotFound {
                name: name.to_string(),
                requesters: Vec::new(),
            })
    }

    /// Lazily yields modules whose name, description or tags contain
    /// `pattern`, ignoring case. An empty pattern matches everything.
    pub fn search(&self, pattern: &str) -> ModuleSearch<'_> {
        ModuleSearch {
            inner: self.modules.values(),
            needle: pattern.to_lowercase(),
            category: None,
        }
    }

    pub fn search_in_category(&self, pattern: &str, category: &str) -> ModuleSearch<'_> {
        ModuleSearch {
            inner: self.modules.values(),
            needle: pattern.to_lowercase(),
            category: Some(category.to_string()),
        }
    }

    pub fn modules_in_category<'a>(
        &'a self,
        category: &'a str,
    ) -> impl Iterator<Item = &'a Arc<ModuleDescriptor>> + 'a {
        self.modules
            .values()
            .filter(move |m| m.category.as_deref() == Some(category))
    }

    pub fn category_title(&self, id: &str) -> Option<&str> {
        self.categories.get(id).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ModuleDescriptor>> {
        self.modules.values()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Entries rejected while loading, as `RegistryLoad` errors.
    pub fn skipped(&self) -> &[CmhError] {
        &self.skipped
    }
}

pub struct ModuleSearch<'a> {
    inner: btree_map::Values<'a, String, Arc<ModuleDescriptor>>,
    needle: String,
    category: Option<String>,
}

impl<'a> Iterator for ModuleSearch<'a> {
    type Item = &'a Arc<ModuleDescriptor>;

    fn next(&mut self) -> Option<Self::Item> {
        let needle = &self.needle;
        let category = self.category.as_deref();
        self.inner.by_ref().find(|m| {
            category.is_none_or(|c| m.category.as_deref() == Some(c)) && m.matches(needle)
        })
    }
}

/// Explicit registry context handed to resolution callers. Holds the
/// sources and the current snapshot; `refresh` swaps in a freshly loaded one.
#[derive(Debug)]
pub struct RegistryContext {
    sources: Vec<RegistrySource>,
    current: RwLock<Arc<ModuleRegistry>>,
}

impl RegistryContext {
    pub fn load(sources: Vec<RegistrySource>) -> Result<Self> {
        let registry = ModuleRegistry::load(&sources)?;
        Ok(Self {
            sources,
            current: RwLock::new(Arc::new(registry)),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let sources = config
            .registry_paths
            .iter()
            .cloned()
            .map(RegistrySource::File)
            .collect();
        Self::load(sources)
    }

    pub fn snapshot(&self) -> Arc<ModuleRegistry> {
        Arc::clone(&self.current.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Reloads every source. On failure the previous snapshot stays active.
    pub fn refresh(&self) -> Result<Arc<ModuleRegistry>> {
        let fresh = Arc::new(ModuleRegistry::load(&self.sources)?);
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::clone(&fresh);
        debug!("Registry refreshed: {} modules.", fresh.len());
        Ok(fresh)
    }

    pub fn sources(&self) -> &[RegistrySource] {
        &self.sources
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDEX: &str = r#"{
        "categories": {"testing": "Testing & Analysis", "build": "Build Helpers"},
        "modules": [
            {"name": "sanitizers", "category": "testing", "description": "Address and UB sanitizers",
             "tags": ["asan"], "versions": ["1.0", "1.2", "1.5"]},
            {"name": "coverage", "category": "testing", "description": "gcov/lcov reports", "version": "2.0"},
            {"name": "ccache", "category": "build", "tags": ["compiler-cache"], "version": "4.2"},
            {"name": "", "version": "1.0"},
            {"name": "broken", "versions": ["not-a-version"]},
            "garbage"
        ]
    }"#;

    fn registry() -> ModuleRegistry {
        ModuleRegistry::load(&[RegistrySource::inline("index", INDEX)]).unwrap()
    }

    #[test]
    fn malformed_entries_are_skipped_not_fatal() {
        let registry = registry();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.skipped().len(), 3);
        assert!(registry
            .skipped()
            .iter()
            .all(|e| matches!(e, CmhError::RegistryLoad { entry: Some(_), .. })));
    }

    #[test]
    fn malformed_source_fails_the_load() {
        let err = ModuleRegistry::load(&[RegistrySource::inline("bad", "{ not json")]).unwrap_err();
        assert!(matches!(err, CmhError::RegistryLoad { entry: None, .. }));

        let err = ModuleRegistry::load(&[RegistrySource::inline("empty", "{}")]).unwrap_err();
        assert!(err.to_string().contains("missing 'modules' array"));
    }

    #[test]
    fn find_and_list_versions() {
        let registry = registry();
        assert_eq!(registry.find("coverage").unwrap().name, "coverage");
        assert!(matches!(
            registry.find("nope"),
            Err(CmhError::ModuleNotFound { .. })
        ));

        let versions = registry.list_versions("sanitizers").unwrap();
        let rendered: Vec<String> = versions.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["1.5.0", "1.2.0", "1.0.0"]);
        // Restartable: the slice can be walked again.
        assert_eq!(versions.iter().count(), 3);
    }

    #[test]
    fn search_is_lazy_and_case_insensitive() {
        let registry = registry();
        let names: Vec<&str> = registry.search("ASAN").map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["sanitizers"]);

        let testing: Vec<&str> = registry
            .search_in_category("", "testing")
            .map(|m| m.name.as_str())
            .collect();
        assert_eq!(testing, vec!["coverage", "sanitizers"]);

        let mut lazy = registry.search("");
        assert!(lazy.next().is_some());
        assert_eq!(registry.category_title("build"), Some("Build Helpers"));
    }

    #[test]
    fn earliest_source_wins_on_duplicates() {
        let first = RegistrySource::inline("first", r#"{"modules": [{"name": "fmt", "version": "9.0"}]}"#);
        let second = RegistrySource::inline("second", r#"{"modules": [{"name": "fmt", "version": "10.0"}]}"#);
        let registry = ModuleRegistry::load(&[first, second]).unwrap();
        assert_eq!(registry.list_versions("fmt").unwrap()[0], Version::new(9, 0, 0));
        assert_eq!(registry.skipped().len(), 1);
    }

    #[test]
    fn context_refresh_picks_up_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modules.json");
        fs::write(&path, r#"{"modules": [{"name": "fmt", "version": "9.0"}]}"#).unwrap();

        let context = RegistryContext::load(vec![RegistrySource::File(path.clone())]).unwrap();
        let before = context.snapshot();
        assert!(!before.contains("spdlog"));

        fs::write(
            &path,
            r#"{"modules": [{"name": "fmt", "version": "9.0"}, {"name": "spdlog", "version": "1.12"}]}"#,
        )
        .unwrap();
        context.refresh().unwrap();
        assert!(context.snapshot().contains("spdlog"));
        // Old snapshots are unaffected.
        assert!(!before.contains("spdlog"));

        fs::write(&path, "garbage").unwrap();
        assert!(context.refresh().is_err());
        assert!(context.snapshot().contains("spdlog"));
    }
}
