//! Test doubles and a wired-up harness.
//!
//! Provides:
//! - [`FakeEngine`]: an in-memory `ContainerEngine` with failure injection
//! - [`CallGate`]: parks one engine call until the test releases it
//! - [`TestHarness`]: lifecycle, backup and log components over a `FakeEngine`
//!
//! # Usage
//!
//! ```rust,no_run
//! use helix::testing::TestHarness;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let dir = tempfile::tempdir().unwrap();
//!     let harness = TestHarness::new(dir.path());
//!     // harness.lifecycle, harness.backups, harness.engine, ...
//! }
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::backup::BackupEngine;
use crate::config::InstanceConfig;
use crate::engine::{
    ContainerDetails, ContainerEngine, ContainerSpec, ContainerState, ContainerStats,
    ContainerSummary, EngineOp, EngineResult,
};
use crate::error::EngineError;
use crate::lifecycle::LifecycleManager;
use crate::logs::LogReader;
use crate::registry::Registry;

struct FakeContainer {
    id: String,
    spec: ContainerSpec,
    state: ContainerState,
    logs: Vec<(DateTime<Utc>, String)>,
    stats: ContainerStats,
}

#[derive(Default)]
struct FakeState {
    containers: Vec<FakeContainer>,
    next_id: u64,
    external_ports: HashSet<u16>,
    failures: HashMap<EngineOp, VecDeque<EngineError>>,
    gates: HashMap<EngineOp, VecDeque<Arc<CallGate>>>,
    unavailable: bool,
    calls: HashMap<EngineOp, usize>,
}

impl FakeState {
    fn find(&self, id: &str) -> EngineResult<&FakeContainer> {
        self.containers
            .iter()
            .find(|c| c.id == id || c.spec.name == id)
            .ok_or_else(|| EngineError::NotFound { id: id.to_string() })
    }

    fn find_mut(&mut self, id: &str) -> EngineResult<&mut FakeContainer> {
        self.containers
            .iter_mut()
            .find(|c| c.id == id || c.spec.name == id)
            .ok_or_else(|| EngineError::NotFound { id: id.to_string() })
    }

    /// Host ports published by running containers plus externally bound ones.
    fn bound_ports(&self) -> HashSet<u16> {
        let mut ports = self.external_ports.clone();
        for c in self.containers.iter().filter(|c| c.state.is_running()) {
            ports.extend(c.spec.ports.iter().map(|p| p.host_port));
        }
        ports
    }

    fn check_ports_free(&self, id: &str) -> EngineResult<()> {
        let container = self.find(id)?;
        let mut taken = self.external_ports.clone();
        for other in self
            .containers
            .iter()
            .filter(|c| c.id != container.id && c.state.is_running())
        {
            taken.extend(other.spec.ports.iter().map(|p| p.host_port));
        }
        match container
            .spec
            .ports
            .iter()
            .find(|p| taken.contains(&p.host_port))
        {
            Some(p) => Err(EngineError::PortConflict { port: p.host_port }),
            None => Ok(()),
        }
    }
}

/// Holds one engine call at its entry point.
///
/// The call parks before it touches any fake state, so whatever it reads
/// afterwards reflects changes made while it was held.
#[derive(Default)]
pub struct CallGate {
    reached: Notify,
    release: Notify,
}

impl CallGate {
    /// Wait until the gated call has arrived.
    pub async fn reached(&self) {
        self.reached.notified().await;
    }

    /// Let the gated call continue.
    pub fn release(&self) {
        self.release.notify_one();
    }
}

/// In-memory container engine.
///
/// Mirrors the engine behaviours the lifecycle depends on: names are unique,
/// stopped containers publish no ports, start fails with `PortConflict` when
/// a host port is taken, and start/stop are idempotent.
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<FakeState>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next call of `op` with `err`. Queued failures fire in order.
    pub fn fail_next(&self, op: EngineOp, err: EngineError) {
        self.state().failures.entry(op).or_default().push_back(err);
    }

    /// Park the next call of `op` until the returned gate is released.
    pub fn gate_next(&self, op: EngineOp) -> Arc<CallGate> {
        let gate = Arc::new(CallGate::default());
        self.state()
            .gates
            .entry(op)
            .or_default()
            .push_back(Arc::clone(&gate));
        gate
    }

    /// While set, every call fails with `EngineError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Number of calls made for `op`, failed ones included.
    pub fn calls(&self, op: EngineOp) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.state().calls.values().sum()
    }

    /// Mark a host port as bound by something outside the engine's view.
    pub fn bind_external_port(&self, port: u16) {
        self.state().external_ports.insert(port);
    }

    /// Append a console line to a container's log.
    pub fn push_log(&self, id: &str, line: &str) {
        let mut state = self.state();
        if let Ok(container) = state.find_mut(id) {
            container.logs.push((Utc::now(), line.to_string()));
        }
    }

    pub fn set_stats(&self, id: &str, stats: ContainerStats) {
        let mut state = self.state();
        if let Ok(container) = state.find_mut(id) {
            container.stats = stats;
        }
    }

    /// Change a container's state behind the manager's back.
    pub fn set_container_state(&self, id: &str, new_state: ContainerState) {
        let mut state = self.state();
        if let Ok(container) = state.find_mut(id) {
            container.state = new_state;
        }
    }

    /// Delete a container behind the manager's back.
    pub fn forget_container(&self, id: &str) {
        self.state()
            .containers
            .retain(|c| c.id != id && c.spec.name != id);
    }

    pub fn container_state(&self, id: &str) -> Option<ContainerState> {
        self.state().find(id).ok().map(|c| c.state)
    }

    pub fn container_spec(&self, id: &str) -> Option<ContainerSpec> {
        self.state().find(id).ok().map(|c| c.spec.clone())
    }

    pub fn container_count(&self) -> usize {
        self.state().containers.len()
    }

    /// Record the call and return any injected failure.
    async fn enter(&self, op: EngineOp) -> EngineResult<()> {
        // Give concurrent callers a chance to interleave, like a real socket round-trip.
        tokio::task::yield_now().await;

        let gate = self.state().gates.get_mut(&op).and_then(VecDeque::pop_front);
        if let Some(gate) = gate {
            gate.reached.notify_one();
            gate.release.notified().await;
        }

        let mut state = self.state();
        *state.calls.entry(op).or_default() += 1;
        if state.unavailable {
            return Err(EngineError::Unavailable {
                reason: format!("{}: engine offline", op.as_str()),
            });
        }
        if let Some(err) = state.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(())
    }
}

/// Docker's multiplexed stream header: stream type, three zero bytes, big-endian length.
fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 8);
    out.extend_from_slice(&[1, 0, 0, 0]);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String> {
        self.enter(EngineOp::Create).await?;
        let mut state = self.state();
        if state.containers.iter().any(|c| c.spec.name == spec.name) {
            return Err(EngineError::NameConflict {
                name: spec.name.clone(),
            });
        }
        state.next_id += 1;
        let id = format!("{:064x}", state.next_id);
        state.containers.push(FakeContainer {
            id: id.clone(),
            spec: spec.clone(),
            state: ContainerState::Created,
            logs: Vec::new(),
            stats: ContainerStats {
                memory_usage_bytes: 0,
                cpu_usage_units: 0,
            },
        });
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        self.enter(EngineOp::Start).await?;
        let mut state = self.state();
        if state.find(id)?.state.is_running() {
            return Ok(());
        }
        state.check_ports_free(id)?;
        state.find_mut(id)?.state = ContainerState::Running;
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> EngineResult<()> {
        self.enter(EngineOp::Stop).await?;
        let mut state = self.state();
        let container = state.find_mut(id)?;
        if container.state.is_running() {
            container.state = ContainerState::Exited;
        }
        Ok(())
    }

    async fn restart_container(&self, id: &str) -> EngineResult<()> {
        self.enter(EngineOp::Restart).await?;
        let mut state = self.state();
        state.find_mut(id)?.state = ContainerState::Exited;
        state.check_ports_free(id)?;
        state.find_mut(id)?.state = ContainerState::Running;
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> EngineResult<()> {
        self.enter(EngineOp::Remove).await?;
        let mut state = self.state();
        let container = state.find(id)?;
        if container.state.is_running() && !force {
            return Err(EngineError::Unavailable {
                reason: format!("cannot remove running container {}", id),
            });
        }
        let real_id = container.id.clone();
        state.containers.retain(|c| c.id != real_id);
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> EngineResult<ContainerDetails> {
        self.enter(EngineOp::Inspect).await?;
        let state = self.state();
        let container = state.find(id)?;
        Ok(ContainerDetails {
            id: container.id.clone(),
            state: container.state,
            bind_mounts: container.spec.binds.clone(),
        })
    }

    async fn list_containers(&self, all: bool) -> EngineResult<Vec<ContainerSummary>> {
        self.enter(EngineOp::List).await?;
        let state = self.state();
        Ok(state
            .containers
            .iter()
            .filter(|c| all || c.state.is_running())
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                name: c.spec.name.clone(),
                ports: if c.state.is_running() {
                    c.spec.ports.iter().map(|p| p.host_port).collect()
                } else {
                    Vec::new()
                },
                image: c.spec.image.clone(),
                state: c.state,
            })
            .collect())
    }

    async fn stream_logs(&self, id: &str, tail: usize, timestamps: bool) -> EngineResult<Vec<u8>> {
        self.enter(EngineOp::Logs).await?;
        let state = self.state();
        let container = state.find(id)?;
        let skip = container.logs.len().saturating_sub(tail);
        let mut out = Vec::new();
        for (at, line) in container.logs.iter().skip(skip) {
            let record = if timestamps {
                format!(
                    "{} {}\n",
                    at.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
                    line
                )
            } else {
                format!("{}\n", line)
            };
            out.extend(frame(record.as_bytes()));
        }
        Ok(out)
    }

    async fn stats(&self, id: &str) -> EngineResult<ContainerStats> {
        self.enter(EngineOp::Stats).await?;
        Ok(self.state().find(id)?.stats)
    }

    async fn bound_ports(&self) -> EngineResult<Vec<u16>> {
        self.enter(EngineOp::List).await?;
        Ok(self.state().bound_ports().into_iter().collect())
    }
}

/// Lifecycle, backup and log components wired over one [`FakeEngine`].
pub struct TestHarness {
    pub config: InstanceConfig,
    pub engine: Arc<FakeEngine>,
    pub registry: Arc<Registry>,
    pub lifecycle: Arc<LifecycleManager>,
    pub backups: BackupEngine,
    pub logs: LogReader,
}

impl TestHarness {
    /// Build a harness whose data and backup roots live under `root`.
    pub fn new(root: &Path) -> Self {
        Self::with_config(InstanceConfig::rooted_at(root))
    }

    pub fn with_config(config: InstanceConfig) -> Self {
        let engine = Arc::new(FakeEngine::new());
        let registry = Arc::new(Registry::in_memory());
        let lifecycle = Arc::new(LifecycleManager::new(
            config.clone(),
            Arc::clone(&engine) as Arc<dyn ContainerEngine>,
            Arc::clone(&registry),
        ));
        let backups = BackupEngine::new(Arc::clone(&lifecycle));
        let logs = LogReader::new(
            Arc::clone(&engine) as Arc<dyn ContainerEngine>,
            Arc::clone(&registry),
        );
        Self {
            config,
            engine,
            registry,
            lifecycle,
            backups,
            logs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::engine::PortMapping;

    fn spec(name: &str, port: u16) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: "img".to_string(),
            env: Vec::new(),
            ports: vec![PortMapping {
                host_port: port,
                container_port: 25565,
            }],
            binds: Vec::new(),
            labels: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_start_detects_port_conflict() {
        let engine = FakeEngine::new();
        let a = engine.create_container(&spec("a", 25565)).await.unwrap();
        let b = engine.create_container(&spec("b", 25565)).await.unwrap();
        engine.start_container(&a).await.unwrap();

        let err = engine.start_container(&b).await.unwrap_err();
        assert_eq!(err, EngineError::PortConflict { port: 25565 });

        engine.stop_container(&a).await.unwrap();
        engine.start_container(&b).await.unwrap();
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let engine = FakeEngine::new();
        let id = engine.create_container(&spec("a", 25565)).await.unwrap();
        engine.fail_next(
            EngineOp::Start,
            EngineError::Unavailable {
                reason: "boom".to_string(),
            },
        );

        assert!(engine.start_container(&id).await.is_err());
        engine.start_container(&id).await.unwrap();
        assert_eq!(engine.calls(EngineOp::Start), 2);
    }

    #[tokio::test]
    async fn test_stopped_containers_publish_no_ports() {
        let engine = FakeEngine::new();
        let id = engine.create_container(&spec("a", 25565)).await.unwrap();
        assert!(engine.bound_ports().await.unwrap().is_empty());

        engine.start_container(&id).await.unwrap();
        assert_eq!(engine.bound_ports().await.unwrap(), vec![25565]);
    }

    #[tokio::test]
    async fn test_gated_call_sees_changes_made_while_held() {
        let engine = Arc::new(FakeEngine::new());
        let gate = engine.gate_next(EngineOp::List);

        let pending = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.bound_ports().await })
        };
        gate.reached().await;
        assert!(!pending.is_finished());

        engine.bind_external_port(30000);
        gate.release();
        assert_eq!(pending.await.unwrap().unwrap(), vec![30000]);
        assert_eq!(engine.calls(EngineOp::List), 1);
    }
}
