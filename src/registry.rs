//! In-memory registry of controller-spawned instances

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tokio::sync::RwLock;

/// A llama-server subprocess this controller spawned.
///
/// The pid is the sole handle: the spawn is detached, so no in-process
/// child object is kept for lifecycle decisions. At most one entry exists
/// per pid, and the OS only reuses a pid after the entry is removed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagedInstance {
    pub pid: u32,
    pub model_path: PathBuf,
    pub port: u16,
    pub host: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// Registry mapping pid to launch parameters for managed instances.
///
/// Owned by the lifecycle manager and injected as shared state; mutation
/// ordering is the manager's responsibility.
#[derive(Default)]
pub struct InstanceRegistry {
    instances: RwLock<HashMap<u32, ManagedInstance>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instance under its pid, replacing any stale entry.
    pub async fn insert(&self, instance: ManagedInstance) {
        let mut instances = self.instances.write().await;
        if let Some(previous) = instances.insert(instance.pid, instance) {
            tracing::warn!(
                pid = previous.pid,
                port = previous.port,
                "Replaced stale registry entry for reused pid"
            );
        }
    }

    pub async fn get(&self, pid: u32) -> Option<ManagedInstance> {
        self.instances.read().await.get(&pid).cloned()
    }

    pub async fn contains(&self, pid: u32) -> bool {
        self.instances.read().await.contains_key(&pid)
    }

    /// Remove and return the entry for a pid, if tracked.
    pub async fn remove(&self, pid: u32) -> Option<ManagedInstance> {
        self.instances.write().await.remove(&pid)
    }

    pub async fn values(&self) -> Vec<ManagedInstance> {
        self.instances.read().await.values().cloned().collect()
    }

    /// Snapshot of tracked pids, used to exclude managed instances from
    /// process-table discovery.
    pub async fn pids(&self) -> HashSet<u32> {
        self.instances.read().await.keys().copied().collect()
    }

    /// Whether any tracked instance already claims this port.
    pub async fn port_in_use(&self, port: u16) -> bool {
        self.instances
            .read()
            .await
            .values()
            .any(|i| i.port == port)
    }

    /// Drop every entry, returning the instances that were tracked.
    pub async fn clear(&self) -> Vec<ManagedInstance> {
        self.instances.write().await.drain().map(|(_, i)| i).collect()
    }

    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.instances.read().await.is_empty()
    }
}
