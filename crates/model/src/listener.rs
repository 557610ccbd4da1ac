//! Cluster change notifications.

use crate::cluster::ClusterState;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::error;

/// Observer of cluster lifecycle changes.
///
/// Called synchronously during reconciliation, after the cluster state has
/// been updated. Implementations must not block.
pub trait ClusterChangeListener: Send + Sync {
    fn on_cluster_added(&self, cluster: &Arc<ClusterState>);

    fn on_cluster_changed(&self, cluster: &Arc<ClusterState>);

    fn on_cluster_removed(&self, cluster: &Arc<ClusterState>);
}

/// Kind of cluster change delivered to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterChange {
    Added,
    Changed,
    Removed,
}

/// Deliver `change` to every listener, isolating panics.
pub fn notify_listeners(
    listeners: &[Arc<dyn ClusterChangeListener>],
    cluster: &Arc<ClusterState>,
    change: ClusterChange,
) {
    for listener in listeners {
        let result = catch_unwind(AssertUnwindSafe(|| match change {
            ClusterChange::Added => listener.on_cluster_added(cluster),
            ClusterChange::Changed => listener.on_cluster_changed(cluster),
            ClusterChange::Removed => listener.on_cluster_removed(cluster),
        }));

        if result.is_err() {
            error!(
                cluster_id = %cluster.cluster_id(),
                change = ?change,
                "Cluster change listener panicked"
            );
        }
    }
}
