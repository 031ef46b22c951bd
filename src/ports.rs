//! Host port allocation.
//!
//! The allocator is the single authority for ports handed to new
//! instances. Allocations are serialised, and each candidate is checked
//! against reservations, the registry's active ports and the engine's
//! bound ports before it is reserved. The reservation lives until the
//! caller drops its [`PortLease`], by which time the instance row covers it.

use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};

use rand::Rng;

use crate::engine::ContainerEngine;
use crate::error::{ManagerError, Result};
use crate::registry::Registry;

type Reservations = Arc<Mutex<HashSet<u16>>>;

/// A reserved host port. Dropping it releases the reservation.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    reserved: Reservations,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        reserved.remove(&self.port);
    }
}

/// Bounded-retry port allocator.
pub struct PortAllocator {
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<Registry>,
    range: RangeInclusive<u16>,
    max_attempts: u32,
    reserved: Reservations,
    serial: tokio::sync::Mutex<()>,
}

impl PortAllocator {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        registry: Arc<Registry>,
        range: RangeInclusive<u16>,
        max_attempts: u32,
    ) -> Self {
        Self {
            engine,
            registry,
            range,
            max_attempts,
            reserved: Arc::new(Mutex::new(HashSet::new())),
            serial: tokio::sync::Mutex::new(()),
        }
    }

    /// Pick a port: `preferred` if it is free, otherwise a uniform draw from
    /// the ephemeral range.
    ///
    /// A port is free when it is not in `excluded`, not reserved by an
    /// outstanding lease, not held by an active registry row, and not
    /// published by any engine container. Both sets are re-read for every
    /// candidate. Gives up with `AllocationExhausted` after `max_attempts`
    /// draws.
    pub async fn allocate(&self, preferred: u16, excluded: &HashSet<u16>) -> Result<PortLease> {
        let _serial = self.serial.lock().await;

        if let Some(lease) = self.try_candidate(preferred, excluded).await? {
            tracing::debug!(port = preferred, "Allocated preferred port");
            return Ok(lease);
        }

        for attempt in 1..=self.max_attempts {
            let candidate = rand::thread_rng().gen_range(self.range.clone());
            if let Some(lease) = self.try_candidate(candidate, excluded).await? {
                tracing::debug!(port = candidate, attempt, "Allocated ephemeral port");
                return Ok(lease);
            }
            tracing::trace!(port = candidate, attempt, "Port taken, drawing again");
        }

        tracing::warn!(
            attempts = self.max_attempts,
            "No free host port in {}..={}",
            self.range.start(),
            self.range.end()
        );
        Err(ManagerError::AllocationExhausted {
            attempts: self.max_attempts,
        })
    }

    /// Whether a port is currently held by an outstanding lease.
    pub fn is_reserved(&self, port: u16) -> bool {
        let reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        reserved.contains(&port)
    }

    /// Caller holds `serial`.
    ///
    /// Reservations are checked before the registry: a lease is dropped only
    /// after its row is written, so a port missing from the reservation set
    /// is either free or already visible as an active row.
    async fn try_candidate(&self, port: u16, excluded: &HashSet<u16>) -> Result<Option<PortLease>> {
        if excluded.contains(&port) || self.is_reserved(port) {
            return Ok(None);
        }
        if self.registry.active_ports().await?.contains(&port) {
            return Ok(None);
        }
        if self.bound_ports().await?.contains(&port) {
            return Ok(None);
        }

        let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        if !reserved.insert(port) {
            return Ok(None);
        }
        Ok(Some(PortLease {
            port,
            reserved: Arc::clone(&self.reserved),
        }))
    }

    async fn bound_ports(&self) -> Result<HashSet<u16>> {
        let ports = self
            .engine
            .bound_ports()
            .await
            .map_err(|e| ManagerError::EngineUnavailable {
                operation: "list",
                instance: "*".to_string(),
                reason: e.to_string(),
            })?;
        Ok(ports.into_iter().collect())
    }
}
