//! Per-core and per-cluster run-control state
//!
//! The registry is the single owner of core truth for a session. It is
//! internally synchronized so coordinators can read and update it through a
//! shared reference; no lock is held across a transport round trip.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info};

use crate::cti::ChannelController;
use crate::domain::{Cluster, ClusterId, Core, CoreId, CoreStatus, RunState};
use crate::error::{Result, RunControlError};

#[derive(Debug, Default)]
struct RegistryInner {
    cores: HashMap<CoreId, Core>,
    /// Core ids in registration order
    order: Vec<CoreId>,
    clusters: HashMap<ClusterId, Cluster>,
}

/// Holds every core and cluster known to the session
#[derive(Debug, Default)]
pub struct CoreRegistry {
    inner: RwLock<RegistryInner>,
}

impl CoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&RegistryInner) -> T) -> T {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&inner)
    }

    fn write<T>(&self, f: impl FnOnce(&mut RegistryInner) -> T) -> T {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut inner)
    }

    fn with_core<T>(&self, id: &str, f: impl FnOnce(&mut Core) -> T) -> Result<T> {
        self.write(|inner| {
            inner
                .cores
                .get_mut(id)
                .map(f)
                .ok_or_else(|| RunControlError::UnknownCore(id.to_string()))
        })
    }

    /// Add a core; it starts unexamined in state Unknown
    pub fn register_core(&self, id: impl Into<CoreId>) -> Result<()> {
        let id = id.into();
        debug!(core = %id, "CoreRegistry::register_core: called");
        self.write(|inner| {
            if inner.cores.contains_key(&id) {
                return Err(RunControlError::Config(format!("core {} registered twice", id)));
            }
            inner.order.push(id.clone());
            inner.cores.insert(id.clone(), Core::new(id));
            Ok(())
        })
    }

    /// Add a cluster, claiming each member
    ///
    /// Fails if a member is unknown or already belongs to another cluster.
    pub fn register_cluster(&self, cluster: Cluster) -> Result<()> {
        debug!(cluster = %cluster.id, members = ?cluster.members, "CoreRegistry::register_cluster: called");
        if cluster.members.is_empty() {
            return Err(RunControlError::Config(format!("cluster {} has no members", cluster.id)));
        }
        cluster.channels.validate().map_err(|e| RunControlError::Config(format!("cluster {}: {}", cluster.id, e)))?;

        self.write(|inner| {
            if inner.clusters.contains_key(&cluster.id) {
                return Err(RunControlError::Config(format!("cluster {} registered twice", cluster.id)));
            }
            for member in &cluster.members {
                match inner.cores.get(member) {
                    None => return Err(RunControlError::UnknownCore(member.clone())),
                    Some(core) => {
                        if let Some(other) = &core.cluster {
                            return Err(RunControlError::Config(format!(
                                "core {} already belongs to cluster {}",
                                member, other
                            )));
                        }
                    }
                }
            }
            for member in &cluster.members {
                if let Some(core) = inner.cores.get_mut(member) {
                    core.cluster = Some(cluster.id.clone());
                }
            }
            inner.clusters.insert(cluster.id.clone(), cluster);
            Ok(())
        })
    }

    /// Record a successful examination
    pub fn mark_examined(&self, id: &str, state: RunState) -> Result<()> {
        info!(core = %id, %state, "Core examined");
        self.with_core(id, |core| {
            core.examined = true;
            core.run_state = state;
        })
    }

    /// Record a failed examination
    pub fn mark_unavailable(&self, id: &str) -> Result<()> {
        self.with_core(id, |core| {
            core.examined = false;
            core.run_state = RunState::Unavailable;
        })
    }

    /// Establish the channel binding of an examined core
    ///
    /// The controller must drive this core's CTI.
    pub fn bind_channel(&self, id: &str, controller: Arc<ChannelController>) -> Result<()> {
        debug!(core = %id, cti = %controller.binding().name, "CoreRegistry::bind_channel: called");
        if controller.core() != id {
            return Err(RunControlError::Config(format!(
                "CTI {} belongs to core {}, not {}",
                controller.binding().name,
                controller.core(),
                id
            )));
        }
        self.with_core(id, |core| core.channel = Some(controller))
    }

    pub fn set_state(&self, id: &str, state: RunState) -> Result<()> {
        self.with_core(id, |core| {
            if core.run_state != state {
                debug!(core = %id, from = %core.run_state, to = %state, "CoreRegistry::set_state: transition");
            }
            core.run_state = state;
        })
    }

    pub fn set_stop_reported(&self, id: &str, reported: bool) -> Result<()> {
        self.with_core(id, |core| core.stop_reported = reported)
    }

    pub fn set_last_stop_primary(&self, cluster: &str, primary: &str) -> Result<()> {
        self.write(|inner| {
            inner
                .clusters
                .get_mut(cluster)
                .map(|c| c.last_stop_primary = Some(primary.to_string()))
                .ok_or_else(|| RunControlError::UnknownCluster(cluster.to_string()))
        })
    }

    /// Snapshot of one core
    pub fn core(&self, id: &str) -> Option<Core> {
        self.read(|inner| inner.cores.get(id).cloned())
    }

    pub fn state(&self, id: &str) -> Option<RunState> {
        self.read(|inner| inner.cores.get(id).map(|c| c.run_state))
    }

    /// Snapshot of one cluster
    pub fn cluster(&self, id: &str) -> Option<Cluster> {
        self.read(|inner| inner.clusters.get(id).cloned())
    }

    /// Cluster a core belongs to, if any
    pub fn cluster_of(&self, core: &str) -> Option<ClusterId> {
        self.read(|inner| inner.cores.get(core).and_then(|c| c.cluster.clone()))
    }

    /// Member snapshots of a cluster, in member order
    pub fn members(&self, cluster: &str) -> Result<Vec<Core>> {
        self.read(|inner| {
            let cluster = inner
                .clusters
                .get(cluster)
                .ok_or_else(|| RunControlError::UnknownCluster(cluster.to_string()))?;
            Ok(cluster
                .members
                .iter()
                .filter_map(|m| inner.cores.get(m).cloned())
                .collect())
        })
    }

    /// All core ids in registration order
    pub fn core_ids(&self) -> Vec<CoreId> {
        self.read(|inner| inner.order.clone())
    }

    /// All cluster ids, sorted
    pub fn cluster_ids(&self) -> Vec<ClusterId> {
        let mut ids: Vec<ClusterId> = self.read(|inner| inner.clusters.keys().cloned().collect());
        ids.sort();
        ids
    }

    /// Status query answered to the debug host
    pub fn status(&self, id: &str) -> Result<CoreStatus> {
        self.read(|inner| {
            let core = inner
                .cores
                .get(id)
                .ok_or_else(|| RunControlError::UnknownCore(id.to_string()))?;
            let is_primary = core
                .cluster
                .as_ref()
                .and_then(|c| inner.clusters.get(c))
                .and_then(|c| c.last_stop_primary.as_ref())
                .is_some_and(|p| p == id);
            Ok(CoreStatus {
                core: core.id.clone(),
                run_state: core.run_state,
                examined: core.examined,
                cluster: core.cluster.clone(),
                is_primary,
            })
        })
    }
}
