/// Named clusters owned by the controller
use crate::core::Cluster;
use crate::error::{PorteroError, PorteroResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct Registry {
    clusters: DashMap<String, Arc<Cluster>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, cluster: Arc<Cluster>) -> PorteroResult<()> {
        match self.clusters.entry(cluster.name().to_string()) {
            Entry::Occupied(entry) => Err(PorteroError::cluster_already_exists(entry.key())),
            Entry::Vacant(entry) => {
                entry.insert(cluster);
                Ok(())
            }
        }
    }

    pub fn unregister(&self, name: &str) -> PorteroResult<Arc<Cluster>> {
        self.clusters
            .remove(name)
            .map(|(_, cluster)| cluster)
            .ok_or_else(|| PorteroError::cluster_not_found(name))
    }

    pub fn get(&self, name: &str) -> Option<Arc<Cluster>> {
        self.clusters.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn clusters(&self) -> Vec<Arc<Cluster>> {
        self.clusters
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Registered cluster names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clusters.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ClusterSettings;
    use crate::event::EventBus;

    #[test]
    fn test_register_and_lookup() {
        let registry = Registry::new();
        let bus = EventBus::new();
        registry
            .register(Cluster::new("web", ClusterSettings::default(), bus.clone()))
            .unwrap();
        registry
            .register(Cluster::new("api", ClusterSettings::default(), bus.clone()))
            .unwrap();

        assert_eq!(registry.names(), vec!["api", "web"]);
        assert_eq!(registry.get("web").unwrap().name(), "web");
        assert!(registry.get("db").is_none());

        let err = registry
            .register(Cluster::new("web", ClusterSettings::default(), bus))
            .unwrap_err();
        assert!(matches!(err, PorteroError::ClusterAlreadyExists { .. }));
    }

    #[test]
    fn test_unregister() {
        let registry = Registry::new();
        registry
            .register(Cluster::new("web", ClusterSettings::default(), EventBus::new()))
            .unwrap();

        assert_eq!(registry.unregister("web").unwrap().name(), "web");
        assert!(registry.is_empty());
        assert!(matches!(
            registry.unregister("web"),
            Err(PorteroError::ClusterNotFound { .. })
        ));
    }
}
