use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use berth_instance::{Instance, InstanceStatus};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::ports::PortAllocator;

struct Inner {
    instances: HashMap<String, Instance>,
    /// Secondary port -> instance id index, kept in lockstep with the map.
    ports: HashMap<u16, String>,
    allocator: PortAllocator,
}

/// Authoritative in-memory registry of instances plus its durable snapshot.
///
/// All operations are synchronous; reads share a lock, writes are exclusive,
/// and every mutation snapshots the whole registry to disk (write-then-rename)
/// before returning.
pub struct InstanceStore {
    path: PathBuf,
    inner: RwLock<Inner>,
}

/// One metrics-loop observation for a running instance.
pub enum MetricsUpdate {
    Sample {
        uptime_seconds: f64,
        cpu_percent: f64,
        memory_mb: f64,
        at: DateTime<Utc>,
    },
    /// The pid could not be probed; the child is gone.
    Dead,
}

impl InstanceStore {
    /// Load the registry from `path`. A missing file is an empty registry; a
    /// corrupt file is logged and treated as empty rather than blocking boot.
    pub fn open(path: PathBuf, port_start: u16, port_end: u16) -> Self {
        let instances = match fs::read(&path) {
            Ok(raw) => match serde_json::from_slice::<HashMap<String, Instance>>(&raw) {
                Ok(map) => map,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to parse servers file; starting empty");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read servers file; starting empty");
                HashMap::new()
            }
        };

        for inst in instances.values() {
            if inst.is_running()
                && let Some(pid) = inst.pid
            {
                tracing::info!(id = %inst.id, name = %inst.name, pid, "found existing running server");
            }
        }

        let mut inner = Inner {
            instances,
            ports: HashMap::new(),
            allocator: PortAllocator::new(port_start, port_end),
        };
        rebuild_indexes(&mut inner);
        Self {
            path,
            inner: RwLock::new(inner),
        }
    }

    pub fn list(&self) -> Vec<Instance> {
        self.inner.read().instances.values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Result<Instance> {
        self.inner
            .read()
            .instances
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("server not found: {id}")))
    }

    pub fn get_by_port(&self, port: u16) -> Result<Instance> {
        let inner = self.inner.read();
        let id = inner
            .ports
            .get(&port)
            .ok_or_else(|| Error::NotFound(format!("no server found on port {port}")))?;
        inner
            .instances
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no server found on port {port}")))
    }

    /// Reserve a fresh port for `id`. The reservation lives in the port index
    /// only; it becomes durable when the instance is inserted.
    pub fn allocate_port(&self, id: &str) -> Result<u16> {
        let mut guard = self.inner.write();
        let Inner {
            ports, allocator, ..
        } = &mut *guard;
        let port = allocator.allocate(ports)?;
        ports.insert(port, id.to_string());
        Ok(port)
    }

    /// Drop a reservation that never became an instance (create rollback).
    pub fn release_port(&self, port: u16, id: &str) {
        let mut inner = self.inner.write();
        if inner.ports.get(&port).is_some_and(|owner| owner == id) {
            inner.ports.remove(&port);
        }
    }

    pub fn insert(&self, instance: Instance) -> Result<Instance> {
        let mut inner = self.inner.write();
        if inner.instances.contains_key(&instance.id) {
            return Err(Error::Conflict(format!(
                "instance id already exists: {}",
                instance.id
            )));
        }
        if inner
            .ports
            .get(&instance.port)
            .is_some_and(|owner| owner != &instance.id)
        {
            return Err(Error::Conflict(format!(
                "port already assigned: {}",
                instance.port
            )));
        }

        inner.ports.insert(instance.port, instance.id.clone());
        inner.instances.insert(instance.id.clone(), instance.clone());
        self.snapshot_locked(&inner);
        Ok(instance)
    }

    /// Apply `mutator` under exclusive access, snapshot, and return the
    /// updated record.
    pub fn update(&self, id: &str, mutator: impl FnOnce(&mut Instance)) -> Result<Instance> {
        let mut inner = self.inner.write();
        let inst = inner
            .instances
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("server not found: {id}")))?;
        mutator(inst);
        let updated = inst.clone();
        self.snapshot_locked(&inner);
        Ok(updated)
    }

    /// Drop the instance and release its port index slot.
    pub fn remove(&self, id: &str) -> Result<Instance> {
        let mut inner = self.inner.write();
        let inst = inner
            .instances
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("server not found: {id}")))?;
        if inner.ports.get(&inst.port).is_some_and(|owner| owner == id) {
            inner.ports.remove(&inst.port);
        }
        self.snapshot_locked(&inner);
        Ok(inst)
    }

    /// Collect every running child pid under exclusive access (process-wide
    /// shutdown).
    pub fn drain_running_pids(&self) -> Vec<(String, u32)> {
        let inner = self.inner.write();
        inner
            .instances
            .values()
            .filter(|i| i.is_running())
            .filter_map(|i| i.pid.map(|pid| (i.id.clone(), pid)))
            .collect()
    }

    /// One metrics tick: apply the collected samples, reconcile against the
    /// durable snapshot (tolerating out-of-band edits) while preserving
    /// in-memory samples for still-running instances, then snapshot.
    pub fn metrics_pass(&self, updates: Vec<(String, MetricsUpdate)>) {
        let mut inner = self.inner.write();

        for (id, update) in updates {
            let Some(inst) = inner.instances.get_mut(&id) else {
                continue;
            };
            if !inst.is_running() || inst.pid.is_none() {
                continue;
            }
            match update {
                MetricsUpdate::Sample {
                    uptime_seconds,
                    cpu_percent,
                    memory_mb,
                    at,
                } => {
                    inst.uptime_seconds = Some(uptime_seconds);
                    inst.cpu_percent = Some(cpu_percent);
                    inst.memory_mb = Some(memory_mb);
                    inst.last_update = Some(at);
                }
                MetricsUpdate::Dead => {
                    inst.status = InstanceStatus::Stopped;
                    inst.clear_runtime();
                }
            }
        }

        // The filesystem is a second source of truth: fold in whatever the
        // snapshot currently says, keeping our in-process samples for
        // instances that are still running. Unreadable snapshots skip the
        // reconcile, never the tick.
        if let Ok(raw) = fs::read(&self.path)
            && let Ok(mut fresh) = serde_json::from_slice::<HashMap<String, Instance>>(&raw)
        {
            for (id, inst) in fresh.iter_mut() {
                if inst.is_running()
                    && inst.pid.is_some()
                    && let Some(old) = inner.instances.get(id)
                {
                    inst.uptime_seconds = old.uptime_seconds;
                    inst.cpu_percent = old.cpu_percent;
                    inst.memory_mb = old.memory_mb;
                    inst.last_update = old.last_update;
                }
            }
            inner.instances = fresh;
            rebuild_indexes(&mut inner);
        }

        self.snapshot_locked(&inner);
    }

    /// Total-file rewrite via a temp file and rename, so concurrent readers
    /// of the durable file never observe a truncated record. Failures are
    /// logged; the in-memory registry remains authoritative.
    fn snapshot_locked(&self, inner: &Inner) {
        let data = match serde_json::to_vec_pretty(&inner.instances) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize servers file");
                return;
            }
        };
        let tmp = self.path.with_extension("json.tmp");
        let res = fs::write(&tmp, &data).and_then(|_| fs::rename(&tmp, &self.path));
        if let Err(e) = res {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to persist servers file");
        }
    }
}

fn rebuild_indexes(inner: &mut Inner) {
    inner.ports = inner
        .instances
        .iter()
        .map(|(id, inst)| (inst.port, id.clone()))
        .collect();
    let ports: Vec<u16> = inner.ports.keys().copied().collect();
    inner.allocator.reset_floor(ports.iter());
}
