//! Process-wide cache of deployed case definitions.
//!
//! Definitions are immutable once validated, so the cache hands out
//! `Arc`s. Redeploying an id replaces the cached entry; `invalidate` drops
//! it so the next lookup goes back to the [`DefinitionSource`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use arbor_core::CaseDefinition;

use crate::error::EngineError;

/// Backing store consulted on a cache miss.
pub trait DefinitionSource: Send + Sync {
    fn load(&self, definition_id: &str) -> Option<CaseDefinition>;

    /// The highest version deployed under `key`.
    fn load_latest(&self, key: &str) -> Option<CaseDefinition>;
}

#[derive(Default)]
struct Entries {
    by_id: HashMap<String, Arc<CaseDefinition>>,
    /// key → version → id
    by_key: HashMap<String, BTreeMap<u32, String>>,
}

impl Entries {
    fn put(&mut self, definition: Arc<CaseDefinition>) {
        self.by_key
            .entry(definition.key().to_string())
            .or_default()
            .insert(definition.version(), definition.id().to_string());
        self.by_id.insert(definition.id().to_string(), definition);
    }

    fn remove(&mut self, definition_id: &str) -> bool {
        let Some(definition) = self.by_id.remove(definition_id) else {
            return false;
        };
        if let Some(versions) = self.by_key.get_mut(definition.key()) {
            versions.retain(|_, id| id != definition_id);
            if versions.is_empty() {
                self.by_key.remove(definition.key());
            }
        }
        true
    }

    fn latest(&self, key: &str) -> Option<Arc<CaseDefinition>> {
        self.by_key
            .get(key)
            .and_then(|versions| versions.values().next_back())
            .and_then(|id| self.by_id.get(id))
            .cloned()
    }
}

#[derive(Default)]
pub struct DefinitionCache {
    entries: RwLock<Entries>,
    source: Option<Arc<dyn DefinitionSource>>,
}

impl DefinitionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(source: Arc<dyn DefinitionSource>) -> Self {
        DefinitionCache {
            entries: RwLock::default(),
            source: Some(source),
        }
    }

    /// Cache a validated definition, replacing any entry with the same id.
    pub fn deploy(&self, definition: CaseDefinition) -> Result<Arc<CaseDefinition>, EngineError> {
        let definition = Arc::new(definition);
        let mut entries = self.write()?;
        let replaced = entries.remove(definition.id());
        entries.put(definition.clone());
        tracing::info!(
            definition_id = %definition.id(),
            key = %definition.key(),
            version = definition.version(),
            replaced,
            "case definition deployed"
        );
        Ok(definition)
    }

    pub fn get(&self, definition_id: &str) -> Result<Arc<CaseDefinition>, EngineError> {
        if let Some(found) = self.read()?.by_id.get(definition_id).cloned() {
            return Ok(found);
        }
        let loaded = self
            .source
            .as_ref()
            .and_then(|source| source.load(definition_id))
            .ok_or_else(|| EngineError::not_found("case definition", definition_id))?;
        self.cache(loaded)
    }

    pub fn latest_by_key(&self, key: &str) -> Result<Arc<CaseDefinition>, EngineError> {
        if let Some(found) = self.read()?.latest(key) {
            return Ok(found);
        }
        let loaded = self
            .source
            .as_ref()
            .and_then(|source| source.load_latest(key))
            .ok_or_else(|| EngineError::not_found("case definition key", key))?;
        self.cache(loaded)
    }

    /// Drop a cached definition. Returns whether it was cached.
    pub fn invalidate(&self, definition_id: &str) -> Result<bool, EngineError> {
        let removed = self.write()?.remove(definition_id);
        if removed {
            tracing::debug!(definition_id, "case definition invalidated");
        }
        Ok(removed)
    }

    pub fn invalidate_all(&self) -> Result<(), EngineError> {
        *self.write()? = Entries::default();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.by_id.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cache(&self, definition: CaseDefinition) -> Result<Arc<CaseDefinition>, EngineError> {
        let definition = Arc::new(definition);
        self.write()?.put(definition.clone());
        Ok(definition)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Entries>, EngineError> {
        self.entries
            .read()
            .map_err(|e| EngineError::Storage(arbor_storage::StorageError::Backend(e.to_string())))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Entries>, EngineError> {
        self.entries
            .write()
            .map_err(|e| EngineError::Storage(arbor_storage::StorageError::Backend(e.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn definition(id: &str, key: &str, version: u32) -> CaseDefinition {
        CaseDefinition::from_json(&format!(
            r#"{{"id": "{id}", "key": "{key}", "version": {version},
                "plan_model": {{"id": "plan", "type": "case_plan_model"}}}}"#
        ))
        .unwrap()
    }

    struct CountingSource {
        loads: AtomicUsize,
    }

    impl DefinitionSource for CountingSource {
        fn load(&self, definition_id: &str) -> Option<CaseDefinition> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            (definition_id == "claim:1").then(|| definition("claim:1", "claim", 1))
        }

        fn load_latest(&self, key: &str) -> Option<CaseDefinition> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            (key == "claim").then(|| definition("claim:1", "claim", 1))
        }
    }

    #[test]
    fn latest_by_key_picks_highest_version() {
        let cache = DefinitionCache::new();
        cache.deploy(definition("loan:2", "loan", 2)).unwrap();
        cache.deploy(definition("loan:1", "loan", 1)).unwrap();
        assert_eq!(cache.latest_by_key("loan").unwrap().id(), "loan:2");
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn invalidate_drops_entry_and_key_index() {
        let cache = DefinitionCache::new();
        cache.deploy(definition("loan:1", "loan", 1)).unwrap();
        assert!(cache.invalidate("loan:1").unwrap());
        assert!(!cache.invalidate("loan:1").unwrap());
        assert!(matches!(
            cache.latest_by_key("loan"),
            Err(EngineError::NotFound { .. })
        ));
        assert!(cache.is_empty());

        cache.deploy(definition("loan:1", "loan", 1)).unwrap();
        cache.deploy(definition("car:1", "car", 1)).unwrap();
        cache.invalidate_all().unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn miss_loads_from_source_once() {
        let source = Arc::new(CountingSource {
            loads: AtomicUsize::new(0),
        });
        let cache = DefinitionCache::with_source(source.clone());
        cache.get("claim:1").unwrap();
        cache.get("claim:1").unwrap();
        cache.latest_by_key("claim").unwrap();
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
        assert!(cache.get("claim:9").is_err());
    }
}
