//! Instance lifecycle: create, start, stop, restart, remove.
//!
//! Every mutating operation takes the registry's per-name lock for its full
//! duration, engine round-trips included. Engine failures are mapped into
//! [`ManagerError`] with the instance and operation attached and are never
//! retried here, except a host-port conflict during create, which triggers
//! a fresh allocation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, LazyLock};

use chrono::Utc;
use regex::Regex;
use serde::Serialize;

use crate::config::InstanceConfig;
use crate::engine::{
    BindMount, ContainerEngine, ContainerSpec, ContainerState, ContainerSummary, MANAGED_LABEL,
    PortMapping,
};
use crate::error::{EngineError, ManagerError, Result};
use crate::ports::PortAllocator;
use crate::registry::{Instance, InstanceStatus, NameGuard, Registry};

/// How many times create re-allocates after the engine reports a port conflict.
const CREATE_PORT_RETRIES: u32 = 3;

static NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]{0,62}$").expect("static name pattern is valid")
});

static ENV_KEY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z_][A-Z0-9_]*$").expect("static env key pattern is valid"));

/// Instance record plus what the engine currently reports for it.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceReport {
    pub instance: Instance,
    /// `None` when the engine no longer knows the container.
    pub engine_state: Option<ContainerState>,
    pub bind_mounts: Vec<BindMount>,
}

/// Point-in-time resource usage of one instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStats {
    pub id: String,
    pub name: String,
    pub memory_usage_bytes: u64,
    pub cpu_usage_units: u64,
}

impl InstanceStats {
    pub fn memory_usage_mb(&self) -> f64 {
        self.memory_usage_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// Map an engine error into the caller-facing kind.
pub(crate) fn engine_error(
    operation: &'static str,
    instance: &str,
    err: EngineError,
) -> ManagerError {
    match err {
        EngineError::NotFound { .. } => ManagerError::instance_not_found(instance),
        EngineError::NameConflict { name } => ManagerError::DuplicateName { name },
        other => ManagerError::EngineUnavailable {
            operation,
            instance: instance.to_string(),
            reason: other.to_string(),
        },
    }
}

/// Orchestrates instances across the engine, the registry and the host filesystem.
pub struct LifecycleManager {
    config: InstanceConfig,
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<Registry>,
    ports: PortAllocator,
}

impl LifecycleManager {
    pub fn new(
        config: InstanceConfig,
        engine: Arc<dyn ContainerEngine>,
        registry: Arc<Registry>,
    ) -> Self {
        let ports = PortAllocator::new(
            Arc::clone(&engine),
            Arc::clone(&registry),
            config.port_range(),
            config.port_max_attempts,
        );
        Self {
            config,
            engine,
            registry,
            ports,
        }
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<dyn ContainerEngine> {
        &self.engine
    }

    /// Create and start a new instance.
    ///
    /// The registry row is written at `creating` as soon as the engine
    /// assigns an id, and moves to `running` only once start succeeds. A
    /// start failure leaves the row at `error` and the container in place
    /// for explicit removal.
    pub async fn create(
        &self,
        name: &str,
        version: Option<&str>,
        env: &HashMap<String, String>,
    ) -> Result<Instance> {
        validate_name(name)?;
        let version = version
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(&self.config.default_version)
            .to_string();
        let env = self.build_env(&version, env)?;

        let _guard = self.registry.lock(name).await;

        if self.registry.find_active_by_name(name).await?.is_some() {
            return Err(ManagerError::DuplicateName {
                name: name.to_string(),
            });
        }

        let data_path = self.config.data_path(name);
        // Ports the engine rejected during this call. Registry and engine
        // state are re-read by the allocator on every attempt.
        let mut excluded: HashSet<u16> = HashSet::new();

        for attempt in 1..=CREATE_PORT_RETRIES {
            let lease = self.ports.allocate(self.config.service_port, &excluded).await?;
            let host_port = lease.port();
            tokio::fs::create_dir_all(&data_path)
                .await
                .map_err(|e| ManagerError::InvalidConfig {
                    key: "HELIX_DATA_DIR".to_string(),
                    reason: format!("cannot create {}: {}", data_path.display(), e),
                })?;
            let spec = self.build_spec(name, &env, host_port, &data_path);

            let id = match self.engine.create_container(&spec).await {
                Ok(id) => id,
                Err(EngineError::PortConflict { .. }) => {
                    tracing::warn!(instance = %name, port = host_port, attempt, "Port rejected at create, re-allocating");
                    excluded.insert(host_port);
                    continue;
                }
                Err(e) => {
                    tracing::error!(instance = %name, "Engine create failed: {}", e);
                    return Err(engine_error("create", name, e));
                }
            };

            let mut instance = Instance {
                id: id.clone(),
                name: name.to_string(),
                version: version.clone(),
                host_port,
                status: InstanceStatus::Creating,
                data_path: data_path.clone(),
                created_at: Utc::now(),
                cleanup_pending: false,
            };
            self.registry.insert(&instance).await?;

            match self.engine.start_container(&id).await {
                Ok(()) => {
                    self.registry
                        .transition(&mut instance, InstanceStatus::Running)
                        .await?;
                    tracing::info!(
                        instance = %name,
                        container_id = %id,
                        port = host_port,
                        version = %version,
                        "Instance created"
                    );
                    return Ok(instance);
                }
                Err(EngineError::PortConflict { .. }) => {
                    tracing::warn!(instance = %name, port = host_port, attempt, "Port rejected at start, re-allocating");
                    excluded.insert(host_port);
                    match self.engine.remove_container(&id, true).await {
                        Ok(()) | Err(EngineError::NotFound { .. }) => {
                            self.registry.mark_removed(&mut instance).await?;
                        }
                        Err(e) => {
                            self.registry
                                .transition(&mut instance, InstanceStatus::Error)
                                .await?;
                            return Err(engine_error("remove", name, e));
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(
                        instance = %name,
                        container_id = %id,
                        "Start after create failed, leaving instance in error: {}",
                        e
                    );
                    self.registry
                        .transition(&mut instance, InstanceStatus::Error)
                        .await?;
                    return Err(engine_error("start", name, e));
                }
            }
        }

        Err(ManagerError::AllocationExhausted {
            attempts: CREATE_PORT_RETRIES,
        })
    }

    pub async fn start(&self, id: &str) -> Result<Instance> {
        let (_guard, mut instance) = self.lock_instance(id).await?;
        self.start_locked(&mut instance).await?;
        Ok(instance)
    }

    /// Stopping an already-stopped instance succeeds.
    pub async fn stop(&self, id: &str) -> Result<Instance> {
        let (_guard, mut instance) = self.lock_instance(id).await?;
        self.stop_locked(&mut instance).await?;
        Ok(instance)
    }

    pub async fn restart(&self, id: &str) -> Result<Instance> {
        let (_guard, mut instance) = self.lock_instance(id).await?;
        ensure_can(&instance, InstanceStatus::Running)?;
        match self.engine.restart_container(&instance.id).await {
            Ok(()) => {
                self.registry
                    .transition(&mut instance, InstanceStatus::Running)
                    .await?;
                tracing::info!(instance = %instance.name, "Instance restarted");
                Ok(instance)
            }
            Err(e) => Err(self.engine_failure("restart", &instance, e)),
        }
    }

    /// Stop, remove the engine container, delete the data directory, then
    /// mark the row removed.
    ///
    /// The row stays (flagged `cleanup_pending`) until the data directory is
    /// gone, so a failed or interrupted removal can be retried.
    pub async fn remove(&self, id: &str) -> Result<Instance> {
        let (_guard, mut instance) = self.lock_instance(id).await?;
        let name = instance.name.clone();

        if !instance.cleanup_pending {
            if instance.status == InstanceStatus::Running {
                match self.engine.stop_container(&instance.id).await {
                    Ok(()) => {
                        self.registry
                            .transition(&mut instance, InstanceStatus::Stopped)
                            .await?;
                    }
                    Err(EngineError::NotFound { .. }) => {}
                    Err(e) => return Err(engine_error("stop", &name, e)),
                }
            }
            match self.engine.remove_container(&instance.id, true).await {
                Ok(()) => {}
                Err(EngineError::NotFound { .. }) => {
                    tracing::debug!(instance = %name, "Container already gone at engine");
                }
                Err(e) => return Err(engine_error("remove", &name, e)),
            }
            self.registry.mark_cleanup_pending(&mut instance).await?;
        }

        let path = instance.data_path.clone();
        if self.config.owns_data_path(&path) {
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(instance = %name, "Could not delete {}: {}", path.display(), e);
                    return Err(ManagerError::RemovalIncomplete {
                        instance: name,
                        path,
                        reason: e.to_string(),
                    });
                }
            }
        } else {
            tracing::warn!(
                instance = %name,
                "Data path {} is outside {}, leaving it in place",
                path.display(),
                self.config.data_root.display()
            );
        }

        self.registry.mark_removed(&mut instance).await?;
        tracing::info!(instance = %name, container_id = %instance.id, "Instance removed");
        Ok(instance)
    }

    /// Active instances, newest first.
    pub async fn list(&self) -> Result<Vec<Instance>> {
        self.registry.list_active().await
    }

    /// Every instance ever recorded, removed ones included.
    pub async fn list_all(&self) -> Result<Vec<Instance>> {
        self.registry.list().await
    }

    /// Inspect the engine and fold running/stopped drift back into the registry.
    pub async fn status(&self, id: &str) -> Result<InstanceReport> {
        let instance = self
            .registry
            .resolve(id)
            .await?
            .ok_or_else(|| ManagerError::instance_not_found(id))?;
        if !instance.is_active() {
            return Ok(InstanceReport {
                instance,
                engine_state: None,
                bind_mounts: Vec::new(),
            });
        }

        let (_guard, mut instance) = self.lock_instance(&instance.id).await?;
        match self.engine.inspect_container(&instance.id).await {
            Ok(details) => {
                let drifted_to = match (instance.status, details.state.is_running()) {
                    (InstanceStatus::Running, false) => Some(InstanceStatus::Stopped),
                    (InstanceStatus::Stopped, true) => Some(InstanceStatus::Running),
                    _ => None,
                };
                if let Some(to) = drifted_to {
                    tracing::info!(
                        instance = %instance.name,
                        engine_state = %details.state,
                        "Reconciling registry with engine"
                    );
                    self.registry.transition(&mut instance, to).await?;
                }
                Ok(InstanceReport {
                    instance,
                    engine_state: Some(details.state),
                    bind_mounts: details.bind_mounts,
                })
            }
            Err(EngineError::NotFound { .. }) => {
                if !instance.cleanup_pending && instance.status != InstanceStatus::Error {
                    tracing::warn!(instance = %instance.name, "Container missing at engine");
                    self.registry
                        .transition(&mut instance, InstanceStatus::Error)
                        .await?;
                }
                Ok(InstanceReport {
                    instance,
                    engine_state: None,
                    bind_mounts: Vec::new(),
                })
            }
            Err(e) => Err(engine_error("inspect", &instance.name, e)),
        }
    }

    pub async fn stats(&self, id: &str) -> Result<InstanceStats> {
        let instance = self.resolve_active(id).await?;
        let stats = self
            .engine
            .stats(&instance.id)
            .await
            .map_err(|e| engine_error("stats", &instance.name, e))?;
        Ok(InstanceStats {
            id: instance.id,
            name: instance.name,
            memory_usage_bytes: stats.memory_usage_bytes,
            cpu_usage_units: stats.cpu_usage_units,
        })
    }

    /// Everything the engine reports, managed or not.
    pub async fn list_engine_containers(&self) -> Result<Vec<ContainerSummary>> {
        self.engine
            .list_containers(true)
            .await
            .map_err(|e| engine_error("list", "*", e))
    }

    /// Resolve an id or name to an active row, take its name lock, and
    /// re-read the row under the lock.
    pub(crate) async fn lock_instance(
        &self,
        id: &str,
    ) -> Result<(NameGuard, Instance)> {
        let found = self.resolve_active(id).await?;
        let guard = self.registry.lock(&found.name).await;
        match self.registry.get(&found.id).await? {
            Some(instance) if instance.is_active() => Ok((guard, instance)),
            _ => Err(ManagerError::instance_not_found(id)),
        }
    }

    /// Start primitive. Caller holds the name lock.
    pub(crate) async fn start_locked(&self, instance: &mut Instance) -> Result<()> {
        ensure_can(instance, InstanceStatus::Running)?;
        match self.engine.start_container(&instance.id).await {
            Ok(()) => {
                self.registry
                    .transition(instance, InstanceStatus::Running)
                    .await?;
                tracing::info!(instance = %instance.name, "Instance started");
                Ok(())
            }
            Err(e) => Err(self.engine_failure("start", instance, e)),
        }
    }

    /// Stop primitive. Caller holds the name lock.
    pub(crate) async fn stop_locked(&self, instance: &mut Instance) -> Result<()> {
        ensure_can(instance, InstanceStatus::Stopped)?;
        match self.engine.stop_container(&instance.id).await {
            Ok(()) => {
                self.registry
                    .transition(instance, InstanceStatus::Stopped)
                    .await?;
                tracing::info!(instance = %instance.name, "Instance stopped");
                Ok(())
            }
            Err(e) => Err(self.engine_failure("stop", instance, e)),
        }
    }

    async fn resolve_active(&self, id: &str) -> Result<Instance> {
        match self.registry.resolve(id).await? {
            Some(instance) if instance.is_active() => Ok(instance),
            _ => Err(ManagerError::instance_not_found(id)),
        }
    }

    /// Log and map an engine failure. The registry status is left as it
    /// was; `status` is where a vanished container is recorded as `error`.
    fn engine_failure(
        &self,
        operation: &'static str,
        instance: &Instance,
        err: EngineError,
    ) -> ManagerError {
        tracing::warn!(
            instance = %instance.name,
            container_id = %instance.id,
            operation,
            "Engine call failed: {}",
            err
        );
        engine_error(operation, &instance.name, err)
    }

    fn build_env(
        &self,
        version: &str,
        env: &HashMap<String, String>,
    ) -> Result<Vec<(String, String)>> {
        for key in env.keys() {
            if !ENV_KEY_PATTERN.is_match(key) {
                return Err(ManagerError::InvalidConfig {
                    key: key.clone(),
                    reason: "environment keys must be upper-case letters, digits and underscores"
                        .to_string(),
                });
            }
        }
        if let Some(memory) = env.get("MEMORY")
            && !self.config.memory_pattern.is_match(memory)
        {
            return Err(ManagerError::InvalidConfig {
                key: "MEMORY".to_string(),
                reason: format!(
                    "'{}' does not match {}",
                    memory,
                    self.config.memory_pattern.as_str()
                ),
            });
        }

        let mut merged: BTreeMap<String, String> = BTreeMap::new();
        merged.insert("MEMORY".to_string(), self.config.default_memory.clone());
        merged.insert("TYPE".to_string(), "VANILLA".to_string());
        for (key, value) in env {
            merged.insert(key.clone(), value.clone());
        }
        merged.insert("EULA".to_string(), "TRUE".to_string());
        merged.insert("VERSION".to_string(), version.to_string());
        Ok(merged.into_iter().collect())
    }

    fn build_spec(
        &self,
        name: &str,
        env: &[(String, String)],
        host_port: u16,
        data_path: &std::path::Path,
    ) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: self.config.image.clone(),
            env: env.to_vec(),
            ports: vec![PortMapping {
                host_port,
                container_port: self.config.service_port,
            }],
            binds: vec![BindMount {
                host_path: data_path.to_string_lossy().to_string(),
                container_path: self.config.container_data_path.clone(),
                read_only: false,
            }],
            labels: HashMap::from([(MANAGED_LABEL.to_string(), "true".to_string())]),
        }
    }
}

/// Instance names double as engine container names and data directory names.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if NAME_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(ManagerError::InvalidConfig {
            key: "name".to_string(),
            reason: format!(
                "'{}' must start with a letter or digit and contain only letters, digits, '_', '.' or '-' (max 63)",
                name
            ),
        })
    }
}

fn ensure_can(instance: &Instance, to: InstanceStatus) -> Result<()> {
    if instance.cleanup_pending {
        return Err(ManagerError::InvalidTransition {
            instance: instance.name.clone(),
            from: "cleanup pending".to_string(),
            to: to.to_string(),
        });
    }
    if !instance.status.can_transition_to(to) {
        return Err(ManagerError::InvalidTransition {
            instance: instance.name.clone(),
            from: instance.status.to_string(),
            to: to.to_string(),
        });
    }
    Ok(())
}
