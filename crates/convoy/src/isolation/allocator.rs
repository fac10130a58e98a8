//! Slot allocator.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::container::{Container, ContainerConfig, ContainerRuntimeApi};

use super::error::{IsolationError, IsolationResult};
use super::pool::{AddressPool, Lease};
use super::slot::{self, IsolationSlot, SLOT_FILE, SlotRecord, validate_user_id};
use super::{
    IsolationConfig, IsolationMode, LABEL_ADDRESS, LABEL_MANAGED, LABEL_PORT, LABEL_USER,
};

/// Outcome of reconciling in-memory slots against what is actually running.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    /// Tenants whose slot was recovered.
    pub recovered: Vec<String>,
    /// Recovered containers that had to be started again.
    pub restarted: Vec<String>,
    /// Runtimes that could not be adopted (bad labels, duplicate address).
    pub conflicts: Vec<String>,
}

struct AllocatorState {
    pool: AddressPool,
    slots: HashMap<String, IsolationSlot>,
}

/// Assigns tenants to isolation slots.
///
/// Slot bookkeeping sits behind one async mutex that is only held for map and
/// pool updates, never across runtime calls. Provisioning and teardown of one
/// tenant are serialized by that tenant's own lock, so a slow container
/// runtime for one tenant never blocks lookups or bindings of another.
/// Lock order: tenant lock, then state.
pub struct IsolationAllocator {
    config: IsolationConfig,
    root: PathBuf,
    runtime: Option<Arc<dyn ContainerRuntimeApi>>,
    capacity: usize,
    state: Mutex<AllocatorState>,
    tenant_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl IsolationAllocator {
    /// `root` holds `users/{user_id}/{data,state}`. A runtime is required in
    /// container mode and ignored in local mode.
    pub fn new(
        config: IsolationConfig,
        root: impl Into<PathBuf>,
        runtime: Option<Arc<dyn ContainerRuntimeApi>>,
    ) -> IsolationResult<Self> {
        let runtime = match config.mode {
            IsolationMode::Container => Some(runtime.ok_or_else(|| {
                IsolationError::InvalidConfig(
                    "container isolation requires a container runtime".to_string(),
                )
            })?),
            IsolationMode::Local => None,
        };

        let pool = AddressPool::new(config.address_range()?)?;
        Ok(Self {
            capacity: pool.capacity(),
            config,
            root: root.into(),
            runtime,
            state: Mutex::new(AllocatorState {
                pool,
                slots: HashMap::new(),
            }),
            tenant_locks: DashMap::new(),
        })
    }

    fn tenant_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.tenant_locks
            .entry(user_id.to_string())
            .or_default()
            .clone()
    }

    pub fn mode(&self) -> IsolationMode {
        self.config.mode
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Return the tenant's slot, creating it on first use.
    pub async fn allocate(&self, user_id: &str) -> IsolationResult<IsolationSlot> {
        validate_user_id(user_id)?;
        let tenant = self.tenant_lock(user_id);
        let _tenant = tenant.lock().await;

        // The address is reserved in the pool but the slot is only published
        // once its runtime exists.
        let lease = {
            let mut state = self.state.lock().await;
            if let Some(existing) = state.slots.get(user_id) {
                debug!("Reusing slot {} for user {}", existing.address, user_id);
                return Ok(existing.clone());
            }
            state
                .pool
                .acquire()
                .ok_or(IsolationError::AllocationExhausted {
                    capacity: self.capacity,
                })?
        };

        let provisioned = self.provision(user_id, lease).await;
        let mut state = self.state.lock().await;
        match provisioned {
            Ok(slot) => {
                info!(
                    "Allocated slot {}:{} for user {} ({} of {} in use)",
                    slot.address,
                    slot.port,
                    user_id,
                    state.pool.in_use(),
                    self.capacity
                );
                state.slots.insert(user_id.to_string(), slot.clone());
                Ok(slot)
            }
            Err(e) => {
                state.pool.free(lease.address);
                warn!("Failed to provision slot for user {}: {}", user_id, e);
                Err(e)
            }
        }
    }

    /// Create directories, the slot record and (in container mode) the container.
    async fn provision(&self, user_id: &str, lease: Lease) -> IsolationResult<IsolationSlot> {
        let (data_dir, state_dir) = slot::tenant_dirs(&self.root, user_id);
        tokio::fs::create_dir_all(&data_dir).await?;
        tokio::fs::create_dir_all(&state_dir).await?;

        let slot = IsolationSlot {
            user_id: user_id.to_string(),
            address: lease.address,
            port: lease.port,
            data_dir,
            state_dir,
            container_name: self
                .runtime
                .as_ref()
                .map(|_| self.config.container_name(user_id)),
            bound_sessions: Default::default(),
            allocated_at: Utc::now(),
        };

        if let (Some(runtime), Some(name)) = (&self.runtime, &slot.container_name) {
            // A container with our name that reconciliation did not adopt holds
            // a stale address; replace it.
            if runtime.container_state_status(name).await?.is_some() {
                warn!("Removing stale container {} before provisioning", name);
                runtime.remove_container(name, true).await?;
            }
            let config = self.container_config(&slot).await?;
            let id = runtime.create_container(&config).await?;
            debug!("Created container {} ({}) for user {}", name, id, user_id);
        }

        write_slot_record(&slot).await?;
        Ok(slot)
    }

    async fn container_config(&self, slot: &IsolationSlot) -> IsolationResult<ContainerConfig> {
        let data_dir = tokio::fs::canonicalize(&slot.data_dir).await?;
        let state_dir = tokio::fs::canonicalize(&slot.state_dir).await?;
        let address = slot.address.to_string();

        let mut config = ContainerConfig::new(self.config.image.clone())
            .name(self.config.container_name(&slot.user_id))
            .port(slot.port, self.config.container_port)
            .volume(data_dir.display().to_string(), "/data")
            .volume(state_dir.display().to_string(), "/state")
            .env("CONVOY_USER_ID", slot.user_id.clone())
            .env("CONVOY_PORT", self.config.container_port.to_string())
            .label(LABEL_MANAGED, "true")
            .label(LABEL_USER, slot.user_id.clone())
            .label(LABEL_ADDRESS, address.clone())
            .label(LABEL_PORT, slot.port.to_string());

        if let Some(ref network) = self.config.network {
            config = config.network(network.clone()).ip(address);
        }

        Ok(config)
    }

    /// Tear down the tenant's runtime and return its address to the pool.
    ///
    /// Data directories are left in place; see [`purge_data`](Self::purge_data).
    pub async fn release(&self, user_id: &str) -> IsolationResult<Option<IsolationSlot>> {
        let tenant = self.tenant_lock(user_id);
        let _tenant = tenant.lock().await;

        let Some(slot) = self.get(user_id).await else {
            return Ok(None);
        };

        if slot.is_bound() {
            warn!(
                "Releasing slot for user {} with bound sessions {:?}",
                user_id, slot.bound_sessions
            );
        }

        if let (Some(runtime), Some(name)) = (&self.runtime, &slot.container_name)
            && runtime.container_state_status(name).await?.is_some()
        {
            if let Err(e) = runtime
                .stop_container(name, Some(self.config.stop_timeout_secs))
                .await
            {
                debug!("Stop of {} failed, forcing removal: {}", name, e);
            }
            runtime.remove_container(name, true).await?;
        }

        // Any runtime error above returns early: the address stays reserved
        // until the container is known to be gone.
        {
            let mut state = self.state.lock().await;
            state.slots.remove(user_id);
            state.pool.free(slot.address);
        }

        if let Err(e) = tokio::fs::remove_file(slot.state_dir.join(SLOT_FILE)).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("Failed to remove slot record for user {}: {}", user_id, e);
        }

        info!("Released slot {} for user {}", slot.address, user_id);
        Ok(Some(slot))
    }

    /// Delete the tenant directory. Refuses while a slot is still allocated.
    pub async fn purge_data(&self, user_id: &str) -> IsolationResult<bool> {
        validate_user_id(user_id)?;
        let tenant = self.tenant_lock(user_id);
        let _tenant = tenant.lock().await;
        if self.state.lock().await.slots.contains_key(user_id) {
            return Err(IsolationError::SlotInUse(user_id.to_string()));
        }

        let dir = slot::tenant_dir(&self.root, user_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!("Purged data for user {}", user_id);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Liveness of the tenant's runtime. A failed probe never releases the slot.
    pub async fn is_healthy(&self, user_id: &str) -> bool {
        let Some(slot) = self.get(user_id).await else {
            return false;
        };

        match (&self.runtime, &slot.container_name) {
            (Some(runtime), Some(name)) => match runtime.container_state_status(name).await {
                Ok(status) => status.as_deref() == Some("running"),
                Err(e) => {
                    warn!("Health probe for {} failed: {}", name, e);
                    false
                }
            },
            _ => tokio::fs::try_exists(&slot.data_dir).await.unwrap_or(false),
        }
    }

    /// Make sure the slot's runtime is up, restarting or recreating it.
    pub async fn ensure_running(&self, user_id: &str) -> IsolationResult<IsolationSlot> {
        let tenant = self.tenant_lock(user_id);
        let _tenant = tenant.lock().await;
        let slot = self
            .get(user_id)
            .await
            .ok_or_else(|| IsolationError::SlotNotFound(user_id.to_string()))?;

        tokio::fs::create_dir_all(&slot.data_dir).await?;
        tokio::fs::create_dir_all(&slot.state_dir).await?;

        if let (Some(runtime), Some(name)) = (&self.runtime, &slot.container_name) {
            match runtime.container_state_status(name).await?.as_deref() {
                Some("running") => {}
                Some(status) => {
                    info!("Starting container {} (was {})", name, status);
                    runtime.start_container(name).await?;
                }
                None => {
                    info!("Recreating missing container {} for user {}", name, user_id);
                    let config = self.container_config(&slot).await?;
                    runtime.create_container(&config).await?;
                }
            }
        }

        Ok(slot)
    }

    pub async fn get(&self, user_id: &str) -> Option<IsolationSlot> {
        self.state.lock().await.slots.get(user_id).cloned()
    }

    /// All live slots, ordered by address.
    pub async fn list_all(&self) -> Vec<IsolationSlot> {
        let mut slots: Vec<_> = self.state.lock().await.slots.values().cloned().collect();
        slots.sort_by_key(|s| s.address);
        slots
    }

    /// Record that a session runs on the tenant's slot.
    pub async fn bind(&self, user_id: &str, session_id: &str) -> IsolationResult<()> {
        let mut state = self.state.lock().await;
        let slot = state
            .slots
            .get_mut(user_id)
            .ok_or_else(|| IsolationError::SlotNotFound(user_id.to_string()))?;
        slot.bound_sessions.insert(session_id.to_string());
        Ok(())
    }

    /// Drop a session binding. The slot itself stays allocated.
    pub async fn unbind(&self, user_id: &str, session_id: &str) -> bool {
        let mut state = self.state.lock().await;
        state
            .slots
            .get_mut(user_id)
            .is_some_and(|slot| slot.bound_sessions.remove(session_id))
    }

    /// Rebuild slot bookkeeping from live runtimes (container mode) or slot
    /// records on disk (local mode). Slots already known are left alone.
    pub async fn reconcile(&self) -> IsolationResult<ReconcileReport> {
        match &self.runtime {
            Some(runtime) => {
                let containers = runtime.list_containers(true).await?;
                self.reconcile_containers(runtime.as_ref(), containers).await
            }
            None => self.reconcile_records().await,
        }
    }

    async fn reconcile_containers(
        &self,
        runtime: &dyn ContainerRuntimeApi,
        containers: Vec<Container>,
    ) -> IsolationResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let mut state = self.state.lock().await;

        for container in containers {
            if container.label(LABEL_MANAGED) != Some("true") {
                continue;
            }
            let name = container.primary_name().to_string();

            let Some(user_id) = container
                .label(LABEL_USER)
                .filter(|u| validate_user_id(u).is_ok())
            else {
                warn!("Container {} has no usable user label", name);
                report.conflicts.push(name);
                continue;
            };

            if state.slots.contains_key(user_id) {
                continue;
            }

            let address = container
                .label(LABEL_ADDRESS)
                .and_then(|a| a.parse::<Ipv4Addr>().ok());
            let Some(lease) = address.and_then(|a| state.pool.reserve(a)) else {
                warn!(
                    "Container {} address {:?} is outside the pool or already claimed",
                    name, address
                );
                report.conflicts.push(name);
                continue;
            };

            if container.label(LABEL_PORT).and_then(|p| p.parse().ok()) != Some(lease.port) {
                warn!(
                    "Container {} port label disagrees with derived port {}",
                    name, lease.port
                );
            }

            if !container.state.is_running() {
                match runtime.start_container(&name).await {
                    Ok(()) => report.restarted.push(user_id.to_string()),
                    Err(e) => warn!("Failed to restart container {}: {}", name, e),
                }
            }

            let (data_dir, state_dir) = slot::tenant_dirs(&self.root, user_id);
            let slot = IsolationSlot {
                user_id: user_id.to_string(),
                address: lease.address,
                port: lease.port,
                data_dir,
                state_dir,
                container_name: Some(name),
                bound_sessions: Default::default(),
                allocated_at: Utc::now(),
            };
            info!("Recovered slot {} for user {}", slot.address, user_id);
            report.recovered.push(user_id.to_string());
            state.slots.insert(user_id.to_string(), slot);
        }

        Ok(report)
    }

    async fn reconcile_records(&self) -> IsolationResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let users_dir = self.root.join("users");
        let mut entries = match tokio::fs::read_dir(&users_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(e.into()),
        };

        let mut state = self.state.lock().await;
        while let Some(entry) = entries.next_entry().await? {
            let user_id = entry.file_name().to_string_lossy().to_string();
            if validate_user_id(&user_id).is_err() || state.slots.contains_key(&user_id) {
                continue;
            }

            let (data_dir, state_dir) = slot::tenant_dirs(&self.root, &user_id);
            let record_path = state_dir.join(SLOT_FILE);
            let record: SlotRecord = match tokio::fs::read(&record_path).await {
                Ok(bytes) => match serde_json::from_slice(&bytes) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!("Unreadable slot record {}: {}", record_path.display(), e);
                        report.conflicts.push(user_id);
                        continue;
                    }
                },
                // Purged or never allocated.
                Err(_) => continue,
            };

            if record.user_id != user_id {
                report.conflicts.push(user_id);
                continue;
            }

            let Some(lease) = state.pool.reserve(record.address) else {
                warn!(
                    "Slot record for user {} claims unavailable address {}",
                    user_id, record.address
                );
                report.conflicts.push(user_id);
                continue;
            };

            state.slots.insert(
                user_id.clone(),
                IsolationSlot {
                    user_id: user_id.clone(),
                    address: lease.address,
                    port: lease.port,
                    data_dir,
                    state_dir,
                    container_name: None,
                    bound_sessions: Default::default(),
                    allocated_at: record.allocated_at,
                },
            );
            report.recovered.push(user_id);
        }

        Ok(report)
    }
}

async fn write_slot_record(slot: &IsolationSlot) -> IsolationResult<()> {
    let bytes = serde_json::to_vec_pretty(&SlotRecord::from(slot)).map_err(std::io::Error::from)?;
    tokio::fs::write(slot.state_dir.join(SLOT_FILE), bytes).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> IsolationConfig {
        IsolationConfig {
            mode: IsolationMode::Local,
            block_start: 0,
            block_end: 0,
            host_start: 2,
            host_end: 4,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn allocate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = IsolationAllocator::new(local_config(), dir.path(), None).unwrap();

        let first = allocator.allocate("u1").await.unwrap();
        let second = allocator.allocate("u1").await.unwrap();
        assert_eq!(first, second);
        assert!(first.data_dir.is_dir());
        assert!(first.state_dir.join(SLOT_FILE).is_file());

        let other = allocator.allocate("u2").await.unwrap();
        assert_ne!(first.address, other.address);
        assert_ne!(first.port, other.port);
    }

    #[tokio::test]
    async fn exhaustion_is_reported_and_recoverable() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = IsolationAllocator::new(local_config(), dir.path(), None).unwrap();
        for user in ["a", "b", "c"] {
            allocator.allocate(user).await.unwrap();
        }

        let err = allocator.allocate("d").await.unwrap_err();
        assert!(matches!(err, IsolationError::AllocationExhausted { capacity: 3 }));
        assert_eq!(allocator.list_all().await.len(), 3);

        allocator.release("b").await.unwrap();
        assert!(allocator.allocate("d").await.is_ok());
    }

    #[tokio::test]
    async fn release_keeps_data_until_purged() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = IsolationAllocator::new(local_config(), dir.path(), None).unwrap();
        let slot = allocator.allocate("u1").await.unwrap();
        tokio::fs::write(slot.data_dir.join("session.db"), b"x")
            .await
            .unwrap();

        assert!(allocator.purge_data("u1").await.is_err());
        allocator.release("u1").await.unwrap();
        assert!(slot.data_dir.join("session.db").is_file());
        assert!(!allocator.is_healthy("u1").await);

        assert!(allocator.purge_data("u1").await.unwrap());
        assert!(!slot.data_dir.exists());
    }

    #[tokio::test]
    async fn bindings_do_not_release() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = IsolationAllocator::new(local_config(), dir.path(), None).unwrap();
        allocator.allocate("u1").await.unwrap();
        allocator.bind("u1", "s1").await.unwrap();
        assert!(allocator.get("u1").await.unwrap().is_bound());

        assert!(allocator.unbind("u1", "s1").await);
        assert!(!allocator.unbind("u1", "s1").await);
        assert!(allocator.get("u1").await.is_some());
        assert!(allocator.bind("nobody", "s2").await.is_err());
    }

    #[tokio::test]
    async fn local_reconcile_recovers_records() {
        let dir = tempfile::tempdir().unwrap();
        let original = {
            let allocator = IsolationAllocator::new(local_config(), dir.path(), None).unwrap();
            allocator.allocate("u1").await.unwrap()
        };

        let allocator = IsolationAllocator::new(local_config(), dir.path(), None).unwrap();
        let report = allocator.reconcile().await.unwrap();
        assert_eq!(report.recovered, vec!["u1".to_string()]);

        let recovered = allocator.get("u1").await.unwrap();
        assert_eq!(recovered.address, original.address);
        assert_eq!(recovered.port, original.port);

        let fresh = allocator.allocate("u2").await.unwrap();
        assert_ne!(fresh.address, original.address);
    }

    #[test]
    fn container_mode_requires_runtime() {
        let config = IsolationConfig::default();
        assert!(matches!(
            IsolationAllocator::new(config, "/tmp/convoy", None),
            Err(IsolationError::InvalidConfig(_))
        ));
    }
}
