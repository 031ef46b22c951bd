//! Instance registry: the durable record of every managed instance.
//!
//! Rows live in an [`InstanceStore`]; this module adds the status state
//! machine and the per-name locks that serialise mutations of one instance.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::db::{InstanceStore, MemoryStore};
use crate::error::{ManagerError, Result};

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Engine container exists, start not yet confirmed.
    Creating,
    Running,
    Stopped,
    /// Engine resource and data are gone. The name is free again.
    Removed,
    /// An engine call failed. Only removal leaves this state.
    Error,
}

impl InstanceStatus {
    /// Check if this status allows moving to `target`.
    pub fn can_transition_to(&self, target: InstanceStatus) -> bool {
        use InstanceStatus::*;

        matches!(
            (self, target),
            (Creating, Running) | (Creating, Error) | (Creating, Removed) |
            (Running, Stopped) | (Running, Running) | (Running, Removed) | (Running, Error) |
            (Stopped, Running) | (Stopped, Stopped) | (Stopped, Removed) | (Stopped, Error) |
            (Error, Removed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Removed)
    }

    /// Active instances hold their name, port and data directory.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Removed => "removed",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "creating" => Ok(Self::Creating),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "removed" => Ok(Self::Removed),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown instance status '{}'", other)),
        }
    }
}

/// A managed game-server workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Engine-assigned container id.
    pub id: String,
    pub name: String,
    pub version: String,
    pub host_port: u16,
    pub status: InstanceStatus,
    /// Host directory bound into the container.
    pub data_path: PathBuf,
    pub created_at: DateTime<Utc>,
    /// Engine resource is gone but the data directory still has to be deleted.
    pub cleanup_pending: bool,
}

impl Instance {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

type NameLocks = Arc<std::sync::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// Held lock on one instance name.
///
/// Dropping it releases the lock and forgets the name's entry once no other
/// task holds or waits on it.
pub struct NameGuard {
    name: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: NameLocks,
}

impl Drop for NameGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks
            .get(&self.name)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.name);
        }
    }
}

/// Keyed instance store plus per-name mutual exclusion.
pub struct Registry {
    store: Arc<dyn InstanceStore>,
    locks: NameLocks,
}

impl Registry {
    pub fn new(store: Arc<dyn InstanceStore>) -> Self {
        Self {
            store,
            locks: Arc::new(std::sync::Mutex::new(HashMap::new())),
        }
    }

    /// Registry over a fresh in-memory store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Acquire the lock for an instance name.
    ///
    /// Hold the guard for the whole operation, engine round-trips included.
    pub async fn lock(&self, name: &str) -> NameGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(name.to_string()).or_default())
        };
        NameGuard {
            name: name.to_string(),
            guard: Some(lock.lock_owned().await),
            locks: Arc::clone(&self.locks),
        }
    }

    #[cfg(test)]
    fn lock_entries(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Persist a new row.
    pub async fn insert(&self, instance: &Instance) -> Result<()> {
        self.store.upsert_instance(instance).await?;
        tracing::debug!(
            instance = %instance.name,
            container_id = %instance.id,
            status = %instance.status,
            "Registry row written"
        );
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Instance>> {
        Ok(self.store.get_instance(id).await?)
    }

    /// Look up by engine id, falling back to the active instance with that name.
    pub async fn resolve(&self, id_or_name: &str) -> Result<Option<Instance>> {
        if let Some(instance) = self.store.get_instance(id_or_name).await? {
            return Ok(Some(instance));
        }
        Ok(self.store.find_active_by_name(id_or_name).await?)
    }

    pub async fn find_active_by_name(&self, name: &str) -> Result<Option<Instance>> {
        Ok(self.store.find_active_by_name(name).await?)
    }

    /// All rows, removed ones included, newest first.
    pub async fn list(&self) -> Result<Vec<Instance>> {
        Ok(self.store.list_instances().await?)
    }

    pub async fn list_active(&self) -> Result<Vec<Instance>> {
        let mut all = self.list().await?;
        all.retain(Instance::is_active);
        Ok(all)
    }

    /// Host ports held by active instances, stopped ones included.
    pub async fn active_ports(&self) -> Result<HashSet<u16>> {
        Ok(self
            .list_active()
            .await?
            .into_iter()
            .map(|i| i.host_port)
            .collect())
    }

    /// Move an instance to `to`, persisting the change.
    pub async fn transition(&self, instance: &mut Instance, to: InstanceStatus) -> Result<()> {
        if !instance.status.can_transition_to(to) {
            return Err(ManagerError::InvalidTransition {
                instance: instance.name.clone(),
                from: instance.status.to_string(),
                to: to.to_string(),
            });
        }
        self.persist_status(instance, to, instance.cleanup_pending)
            .await
    }

    /// Record that the engine resource is gone and only data cleanup remains.
    pub async fn mark_cleanup_pending(&self, instance: &mut Instance) -> Result<()> {
        let status = if instance.status == InstanceStatus::Running {
            InstanceStatus::Stopped
        } else {
            instance.status
        };
        self.persist_status(instance, status, true).await
    }

    /// Final step of removal.
    pub async fn mark_removed(&self, instance: &mut Instance) -> Result<()> {
        if !instance.status.can_transition_to(InstanceStatus::Removed) {
            return Err(ManagerError::InvalidTransition {
                instance: instance.name.clone(),
                from: instance.status.to_string(),
                to: InstanceStatus::Removed.to_string(),
            });
        }
        self.persist_status(instance, InstanceStatus::Removed, false)
            .await
    }

    async fn persist_status(
        &self,
        instance: &mut Instance,
        status: InstanceStatus,
        cleanup_pending: bool,
    ) -> Result<()> {
        let updated = self
            .store
            .update_status(&instance.id, status, cleanup_pending)
            .await?;
        if !updated {
            return Err(ManagerError::instance_not_found(&instance.id));
        }
        tracing::debug!(
            instance = %instance.name,
            from = %instance.status,
            to = %status,
            cleanup_pending,
            "Instance status changed"
        );
        instance.status = status;
        instance.cleanup_pending = cleanup_pending;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    fn instance(id: &str, name: &str, port: u16, status: InstanceStatus) -> Instance {
        Instance {
            id: id.to_string(),
            name: name.to_string(),
            version: "1.20".to_string(),
            host_port: port,
            status,
            data_path: PathBuf::from("/srv/data").join(name),
            created_at: Utc::now(),
            cleanup_pending: false,
        }
    }

    #[test]
    fn test_status_transitions() {
        use InstanceStatus::*;

        assert!(Creating.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Running));
        assert!(Stopped.can_transition_to(Removed));
        assert!(Error.can_transition_to(Removed));

        assert!(!Running.can_transition_to(Creating));
        assert!(!Stopped.can_transition_to(Creating));
        assert!(!Error.can_transition_to(Running));
        assert!(!Removed.can_transition_to(Running));
        assert!(!Removed.can_transition_to(Removed));
    }

    #[test]
    fn test_status_parse_display() {
        for status in [
            InstanceStatus::Creating,
            InstanceStatus::Running,
            InstanceStatus::Stopped,
            InstanceStatus::Removed,
            InstanceStatus::Error,
        ] {
            assert_eq!(status.to_string().parse::<InstanceStatus>(), Ok(status));
        }
        assert!("paused".parse::<InstanceStatus>().is_err());
    }

    #[tokio::test]
    async fn test_resolve_by_id_or_name() {
        let registry = Registry::in_memory();
        registry
            .insert(&instance("c1", "alpha", 25565, InstanceStatus::Running))
            .await
            .unwrap();

        assert_eq!(registry.resolve("c1").await.unwrap().unwrap().name, "alpha");
        assert_eq!(registry.resolve("alpha").await.unwrap().unwrap().id, "c1");
        assert!(registry.resolve("beta").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_removed_instances_free_name_and_port() {
        let registry = Registry::in_memory();
        let mut alpha = instance("c1", "alpha", 25565, InstanceStatus::Stopped);
        registry.insert(&alpha).await.unwrap();
        assert!(registry.active_ports().await.unwrap().contains(&25565));

        registry.mark_removed(&mut alpha).await.unwrap();
        assert!(registry.find_active_by_name("alpha").await.unwrap().is_none());
        assert!(registry.active_ports().await.unwrap().is_empty());
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_transition_rejected() {
        let registry = Registry::in_memory();
        let mut failed = instance("c1", "alpha", 25565, InstanceStatus::Error);
        registry.insert(&failed).await.unwrap();

        let err = registry
            .transition(&mut failed, InstanceStatus::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::InvalidTransition { .. }));
        assert_eq!(failed.status, InstanceStatus::Error);
    }

    #[tokio::test]
    async fn test_cleanup_pending_trail() {
        let registry = Registry::in_memory();
        let mut alpha = instance("c1", "alpha", 25565, InstanceStatus::Running);
        registry.insert(&alpha).await.unwrap();

        registry.mark_cleanup_pending(&mut alpha).await.unwrap();
        let row = registry.get("c1").await.unwrap().unwrap();
        assert_eq!(row.status, InstanceStatus::Stopped);
        assert!(row.cleanup_pending);
        assert!(row.is_active());
    }

    #[tokio::test]
    async fn test_name_lock_serialises() {
        let registry = Arc::new(Registry::in_memory());
        let guard = registry.lock("alpha").await;

        let contender = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                let _guard = registry.lock("alpha").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        // Other names are independent.
        let _beta = registry.lock("beta").await;

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn test_name_locks_are_forgotten_when_released() {
        let registry = Arc::new(Registry::in_memory());
        for i in 0..50 {
            let _guard = registry.lock(&format!("server-{}", i)).await;
        }
        assert_eq!(registry.lock_entries(), 0);

        let guard = registry.lock("alpha").await;
        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                let _guard = registry.lock("alpha").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The waiter still needs the entry after the first holder leaves.
        drop(guard);
        assert_eq!(registry.lock_entries(), 1);
        waiter.await.unwrap();
        assert_eq!(registry.lock_entries(), 0);
    }
}
