//! Plugin records and dependency resolution.
//!
//! The dependency graph lives as adjacency lists keyed by plugin id:
//! forward edges (`dependencies`) and reverse edges (`dependents`), so
//! reload and unload can walk either direction without object cycles.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    path::PathBuf,
};

use crate::{
    errors::PluginError, format::PluginFile, metadata::PluginMetadata, state::PluginState,
};

/// Everything the manager tracks about one plugin.
#[derive(Clone, Debug)]
pub struct PluginRecord {
    /// Plugin id; equals the metadata name.
    pub id: String,
    pub file_path: PathBuf,
    pub metadata: PluginMetadata,
    pub file: PluginFile,
    pub state: PluginState,
    pub load_order: Option<usize>,
    pub error_info: Option<String>,
    pub loaded_at: Option<u64>,
    pub enabled_at: Option<u64>,
}

impl PluginRecord {
    pub fn new(file_path: PathBuf, metadata: PluginMetadata, file: PluginFile) -> Self {
        Self {
            id: metadata.name.clone(),
            file_path,
            metadata,
            file,
            state: PluginState::Discovered,
            load_order: None,
            error_info: None,
            loaded_at: None,
            enabled_at: None,
        }
    }
}

/// Registry of plugins plus both directions of the dependency graph.
#[derive(Default, Debug)]
pub struct PluginRegistry {
    plugins: HashMap<String, PluginRecord>,
    dependencies: HashMap<String, Vec<String>>,
    dependents: HashMap<String, Vec<String>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, record: PluginRecord) {
        let id = record.id.clone();
        let deps: Vec<String> = record.metadata.dependencies().map(|(d, _)| d.clone()).collect();

        // Replace any previous edges for this id.
        self.unlink(&id);
        for dep in &deps {
            self.dependents.entry(dep.clone()).or_default().push(id.clone());
        }
        self.dependencies.insert(id.clone(), deps);
        self.plugins.insert(id, record);
    }

    pub fn remove(&mut self, id: &str) -> Option<PluginRecord> {
        self.unlink(id);
        self.dependencies.remove(id);
        self.plugins.remove(id)
    }

    fn unlink(&mut self, id: &str) {
        if let Some(deps) = self.dependencies.get(id) {
            for dep in deps {
                if let Some(dependents) = self.dependents.get_mut(dep) {
                    dependents.retain(|d| d != id);
                }
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&PluginRecord> {
        self.plugins.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut PluginRecord> {
        self.plugins.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.plugins.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.plugins.keys()
    }

    pub fn records(&self) -> impl Iterator<Item = &PluginRecord> {
        self.plugins.values()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Applies a state transition, rejecting edges not on the graph.
    pub fn transition(&mut self, id: &str, to: PluginState) -> Result<(), PluginError> {
        let record = self
            .plugins
            .get_mut(id)
            .ok_or_else(|| PluginError::UnknownPlugin(id.to_string()))?;
        if !PluginState::can_transition(record.state, to) {
            return Err(PluginError::InvalidTransition {
                plugin: id.to_string(),
                from: record.state,
                to,
            });
        }
        record.state = to;
        Ok(())
    }

    /// Direct dependents of a plugin.
    pub fn dependents_of(&self, id: &str) -> Vec<String> {
        self.dependents.get(id).cloned().unwrap_or_default()
    }

    /// Dependents closure in dependency order (closest first).
    pub fn transitive_dependents(&self, id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut queue: Vec<String> = self.dependents_of(id);
        while let Some(next) = queue.pop() {
            if out.contains(&next) {
                continue;
            }
            queue.extend(self.dependents_of(&next));
            out.push(next);
        }
        out
    }

    /// Validates the dependency graph and returns the load order:
    /// dependencies before dependents, ties broken by `loadPriority`
    /// (lower first) then by name.
    pub fn resolve_dependencies(&self) -> Result<Vec<String>, PluginError> {
        // Missing deps and version ranges first, so those errors are
        // reported over the cycle error.
        for record in self.plugins.values() {
            for (dep, req) in record.metadata.dependencies() {
                let installed = self.plugins.get(dep).ok_or_else(|| {
                    PluginError::MissingDependency {
                        plugin: record.id.clone(),
                        dependency: dep.clone(),
                    }
                })?;
                if !req.matches(&installed.metadata.version) {
                    return Err(PluginError::DependencyVersionMismatch {
                        plugin: record.id.clone(),
                        dependency: dep.clone(),
                        installed: installed.metadata.version.to_string(),
                        required: req.to_string(),
                    });
                }
            }
        }

        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        for record in self.plugins.values() {
            in_degree.insert(&record.id, record.metadata.dependencies().count());
        }

        // Min-heap on (priority, name).
        let mut ready: BinaryHeap<Reverse<(i32, &str)>> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| Reverse((self.plugins[*id].metadata.load_priority(), *id)))
            .collect();

        let mut order = Vec::with_capacity(self.plugins.len());
        while let Some(Reverse((_, id))) = ready.pop() {
            order.push(id.to_string());
            for dependent in self.dependents_of(id) {
                let degree = in_degree
                    .get_mut(dependent.as_str())
                    .expect("dependent is registered");
                *degree -= 1;
                if *degree == 0 {
                    let record = &self.plugins[&dependent];
                    let entry: &str = &record.id;
                    ready.push(Reverse((record.metadata.load_priority(), entry)));
                }
            }
        }

        if order.len() != self.plugins.len() {
            let stuck = in_degree
                .iter()
                .find(|(id, degree)| **degree > 0 && !order.iter().any(|o| o == *id))
                .map(|(id, _)| id.to_string())
                .unwrap_or_default();
            return Err(PluginError::CircularDependency(stuck));
        }

        Ok(order)
    }

    /// Unload order: the exact reverse of the load order.
    pub fn unload_order(&self) -> Result<Vec<String>, PluginError> {
        let mut order = self.resolve_dependencies()?;
        order.reverse();
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as StdHashMap;

    use crate::{
        format::{build_plugin_file, MlDsaLevel},
        metadata::{test_utils::make_metadata, PluginLifecycle},
    };

    use super::*;

    fn make_record(name: &str, version: &str, deps: &[(&str, &str)], priority: i32) -> PluginRecord {
        let mut metadata = make_metadata(name, version);
        if !deps.is_empty() {
            let map: StdHashMap<String, semver::VersionReq> = deps
                .iter()
                .map(|(d, req)| (d.to_string(), req.parse().unwrap()))
                .collect();
            metadata.dependencies = Some(map);
        }
        metadata.lifecycle = Some(PluginLifecycle {
            load_priority: priority,
        });

        let file = build_plugin_file(
            MlDsaLevel::Level2,
            vec![0; MlDsaLevel::Level2.public_key_len()],
            vec![0; MlDsaLevel::Level2.signature_len()],
            "{}".into(),
            vec![],
            vec![],
        );
        PluginRecord::new(format!("{name}.opnet").into(), metadata, file)
    }

    #[test]
    fn test_topological_order_with_priorities() {
        let mut registry = PluginRegistry::new();
        registry.register(make_record("lib", "1.0.0", &[], 0));
        registry.register(make_record("app", "1.0.0", &[("lib", "^1.0")], -10));
        registry.register(make_record("tool", "1.0.0", &[], -5));

        let order = registry.resolve_dependencies().unwrap();
        // tool (priority -5) precedes lib (0); app always after lib.
        assert_eq!(order, vec!["tool", "lib", "app"]);

        let unload = registry.unload_order().unwrap();
        assert_eq!(unload, vec!["app", "lib", "tool"]);
    }

    #[test]
    fn test_missing_dependency_rejected() {
        let mut registry = PluginRegistry::new();
        registry.register(make_record("app", "1.0.0", &[("ghost", "^1.0")], 0));

        assert!(matches!(
            registry.resolve_dependencies(),
            Err(PluginError::MissingDependency { .. })
        ));
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut registry = PluginRegistry::new();
        registry.register(make_record("lib", "2.0.0", &[], 0));
        registry.register(make_record("app", "1.0.0", &[("lib", "^1.0")], 0));

        assert!(matches!(
            registry.resolve_dependencies(),
            Err(PluginError::DependencyVersionMismatch { .. })
        ));
    }

    #[test]
    fn test_cycle_rejected() {
        let mut registry = PluginRegistry::new();
        registry.register(make_record("a", "1.0.0", &[("b", "^1.0")], 0));
        registry.register(make_record("b", "1.0.0", &[("a", "^1.0")], 0));

        assert!(matches!(
            registry.resolve_dependencies(),
            Err(PluginError::CircularDependency(_))
        ));
    }

    #[test]
    fn test_transitive_dependents() {
        let mut registry = PluginRegistry::new();
        registry.register(make_record("base", "1.0.0", &[], 0));
        registry.register(make_record("mid", "1.0.0", &[("base", "^1.0")], 0));
        registry.register(make_record("top", "1.0.0", &[("mid", "^1.0")], 0));

        let mut dependents = registry.transitive_dependents("base");
        dependents.sort();
        assert_eq!(dependents, vec!["mid", "top"]);
    }

    #[test]
    fn test_transition_enforcement() {
        let mut registry = PluginRegistry::new();
        registry.register(make_record("p", "1.0.0", &[], 0));

        registry.transition("p", PluginState::Validated).unwrap();
        let err = registry.transition("p", PluginState::Enabled).unwrap_err();
        assert!(matches!(err, PluginError::InvalidTransition { .. }));
        assert_eq!(registry.get("p").unwrap().state, PluginState::Validated);
    }

    #[test]
    fn test_reregister_replaces_edges() {
        let mut registry = PluginRegistry::new();
        registry.register(make_record("lib", "1.0.0", &[], 0));
        registry.register(make_record("app", "1.0.0", &[("lib", "^1.0")], 0));
        assert_eq!(registry.dependents_of("lib"), vec!["app"]);

        // New version of app drops the dependency.
        registry.register(make_record("app", "1.1.0", &[], 0));
        assert!(registry.dependents_of("lib").is_empty());
    }
}
