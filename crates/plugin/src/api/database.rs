//! Namespaced document collections for plugins.
//!
//! Collections live in the node's document store under a
//! `{plugin_id}_{collection}` namespace; a plugin only reaches the
//! collections its metadata declared.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::errors::PluginApiError;

/// Shared collection storage seam. The production implementation fronts
/// the external document database; this in-memory form backs tests and
/// ephemeral nodes.
#[derive(Debug, Default)]
pub struct CollectionStore {
    collections: RwLock<HashMap<String, Vec<Value>>>,
}

impl CollectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, collection: &str, doc: Value) {
        self.collections
            .write()
            .entry(collection.to_string())
            .or_default()
            .push(doc);
    }

    fn all(&self, collection: &str) -> Vec<Value> {
        self.collections
            .read()
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    fn clear(&self, collection: &str) {
        self.collections.write().remove(collection);
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.collections.read().keys().cloned().collect()
    }
}

/// Per-plugin database facade.
#[derive(Debug)]
pub struct PluginDatabaseApi {
    plugin_id: String,
    permitted: Vec<String>,
    store: Arc<CollectionStore>,
}

impl PluginDatabaseApi {
    pub fn new(plugin_id: String, permitted: Vec<String>, store: Arc<CollectionStore>) -> Self {
        Self {
            plugin_id,
            permitted,
            store,
        }
    }

    /// Resolves an un-namespaced collection name, enforcing the permitted
    /// list, and returns the physical namespaced name.
    fn resolve(&self, collection: &str) -> Result<String, PluginApiError> {
        if !self.permitted.iter().any(|c| c == collection) {
            return Err(PluginApiError::CollectionNotPermitted(
                collection.to_string(),
            ));
        }
        Ok(format!("{}_{}", self.plugin_id, collection))
    }

    pub fn insert(&self, collection: &str, doc: Value) -> Result<(), PluginApiError> {
        let name = self.resolve(collection)?;
        self.store.insert(&name, doc);
        Ok(())
    }

    pub fn find_all(&self, collection: &str) -> Result<Vec<Value>, PluginApiError> {
        let name = self.resolve(collection)?;
        Ok(self.store.all(&name))
    }

    pub fn clear(&self, collection: &str) -> Result<(), PluginApiError> {
        let name = self.resolve(collection)?;
        self.store.clear(&name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn make_api(plugin: &str, permitted: &[&str], store: Arc<CollectionStore>) -> PluginDatabaseApi {
        PluginDatabaseApi::new(
            plugin.to_string(),
            permitted.iter().map(|s| s.to_string()).collect(),
            store,
        )
    }

    #[test]
    fn test_collections_namespaced_per_plugin() {
        let store = Arc::new(CollectionStore::new());
        let alpha = make_api("alpha", &["events"], store.clone());
        let beta = make_api("beta", &["events"], store.clone());

        alpha.insert("events", json!({"n": 1})).unwrap();
        beta.insert("events", json!({"n": 2})).unwrap();

        assert_eq!(alpha.find_all("events").unwrap(), vec![json!({"n": 1})]);
        assert_eq!(beta.find_all("events").unwrap(), vec![json!({"n": 2})]);

        let mut names = store.collection_names();
        names.sort();
        assert_eq!(names, vec!["alpha_events", "beta_events"]);
    }

    #[test]
    fn test_unpermitted_collection_rejected() {
        let store = Arc::new(CollectionStore::new());
        let api = make_api("alpha", &["events"], store);

        let err = api.insert("secrets", json!({})).unwrap_err();
        assert_eq!(err, PluginApiError::CollectionNotPermitted("secrets".into()));
        assert!(api.find_all("secrets").is_err());
    }

    #[test]
    fn test_clear_scoped_to_own_namespace() {
        let store = Arc::new(CollectionStore::new());
        let alpha = make_api("alpha", &["events"], store.clone());
        let beta = make_api("beta", &["events"], store);

        alpha.insert("events", json!({"n": 1})).unwrap();
        beta.insert("events", json!({"n": 2})).unwrap();
        alpha.clear("events").unwrap();

        assert!(alpha.find_all("events").unwrap().is_empty());
        assert_eq!(beta.find_all("events").unwrap().len(), 1);
    }
}
