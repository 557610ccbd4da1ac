//! Sources of route and cluster configuration.
//!
//! A provider hands out immutable snapshots. Each snapshot carries a change
//! token that fires once, when the provider has a newer snapshot.

use arc_swap::ArcSwap;
use common::{Error, Result};
use model::{ClusterConfig, RouteConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Routes and clusters published by a provider at one point in time
#[derive(Debug, Clone, Default)]
pub struct ProxyConfigSnapshot {
    pub routes: Vec<RouteConfig>,
    pub clusters: Vec<ClusterConfig>,

    /// Fires when this snapshot is superseded
    pub change_token: CancellationToken,
}

impl ProxyConfigSnapshot {
    pub fn new(routes: Vec<RouteConfig>, clusters: Vec<ClusterConfig>) -> Self {
        Self {
            routes,
            clusters,
            change_token: CancellationToken::new(),
        }
    }
}

/// Supplies configuration snapshots to the manager
pub trait ProxyConfigProvider: Send + Sync {
    /// Name used in logs and error messages
    fn name(&self) -> &str;

    /// Current snapshot
    fn get_config(&self) -> Result<Arc<ProxyConfigSnapshot>>;
}

/// Provider whose snapshot is replaced programmatically.
pub struct InMemoryConfigProvider {
    name: String,
    snapshot: ArcSwap<ProxyConfigSnapshot>,
}

impl InMemoryConfigProvider {
    pub fn new(name: impl Into<String>, routes: Vec<RouteConfig>, clusters: Vec<ClusterConfig>) -> Self {
        Self {
            name: name.into(),
            snapshot: ArcSwap::from_pointee(ProxyConfigSnapshot::new(routes, clusters)),
        }
    }

    /// Publish a new snapshot and fire the previous snapshot's token.
    pub fn update(&self, routes: Vec<RouteConfig>, clusters: Vec<ClusterConfig>) {
        let previous = self
            .snapshot
            .swap(Arc::new(ProxyConfigSnapshot::new(routes, clusters)));
        previous.change_token.cancel();
    }
}

impl ProxyConfigProvider for InMemoryConfigProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_config(&self) -> Result<Arc<ProxyConfigSnapshot>> {
        Ok(self.snapshot.load_full())
    }
}

/// On-disk layout of a route/cluster file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfigFile {
    #[serde(default)]
    pub routes: Vec<RouteConfig>,

    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

impl ProxyConfigFile {
    pub fn from_yaml(contents: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }
}

/// Provider backed by a YAML file. [`reload`](Self::reload) re-reads it.
#[derive(Debug)]
pub struct FileConfigProvider {
    path: PathBuf,
    name: String,
    snapshot: ArcSwap<ProxyConfigSnapshot>,
}

impl FileConfigProvider {
    /// Load `path`. Fails if the file cannot be read or parsed.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = Self::read(&path)?;
        info!(
            path = %path.display(),
            routes = file.routes.len(),
            clusters = file.clusters.len(),
            "Loaded proxy configuration file"
        );

        Ok(Self {
            name: format!("file:{}", path.display()),
            snapshot: ArcSwap::from_pointee(ProxyConfigSnapshot::new(file.routes, file.clusters)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file and, on success, publish it and fire the old token.
    ///
    /// A file that fails to load leaves the current snapshot in place.
    pub fn reload(&self) -> Result<()> {
        let file = match Self::read(&self.path) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to reload proxy configuration file");
                return Err(e);
            }
        };

        info!(
            path = %self.path.display(),
            routes = file.routes.len(),
            clusters = file.clusters.len(),
            "Reloaded proxy configuration file"
        );
        let previous = self
            .snapshot
            .swap(Arc::new(ProxyConfigSnapshot::new(file.routes, file.clusters)));
        previous.change_token.cancel();
        Ok(())
    }

    fn read(path: &Path) -> Result<ProxyConfigFile> {
        let contents = std::fs::read_to_string(path)?;
        ProxyConfigFile::from_yaml(&contents)
            .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))
    }
}

impl ProxyConfigProvider for FileConfigProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_config(&self) -> Result<Arc<ProxyConfigSnapshot>> {
        Ok(self.snapshot.load_full())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_update_fires_previous_token() {
        let provider = InMemoryConfigProvider::new("memory", Vec::new(), Vec::new());
        let first = provider.get_config().unwrap();
        assert!(!first.change_token.is_cancelled());

        provider.update(
            Vec::new(),
            vec![ClusterConfig {
                cluster_id: "c1".to_string(),
                ..Default::default()
            }],
        );

        assert!(first.change_token.is_cancelled());
        let second = provider.get_config().unwrap();
        assert!(!second.change_token.is_cancelled());
        assert_eq!(second.clusters.len(), 1);
    }

    #[test]
    fn test_file_layout_parsing() {
        let yaml = r#"
routes:
  - route_id: api
    cluster_id: backend
    match:
      path: /api/{**rest}
clusters:
  - cluster_id: backend
    destinations:
      d1:
        address: http://10.0.0.1:8080/
"#;
        let file = ProxyConfigFile::from_yaml(yaml).unwrap();
        assert_eq!(file.routes[0].route_id, "api");
        assert_eq!(file.routes[0].matcher.path.as_deref(), Some("/api/{**rest}"));
        assert_eq!(file.clusters[0].destinations["d1"].address, "http://10.0.0.1:8080/");

        assert!(ProxyConfigFile::from_yaml("routes: {").is_err());
    }
}
