//! Replica descriptors and the passive health policy.
//!
//! Every replica starts healthy. Each failed replication attempt bumps a
//! consecutive-failure counter; at `max_failures` the replica flips unhealthy
//! and is skipped by the replicator until an operator calls
//! [`ReplicaSet::reset_health`] or the master restarts. A success resets the
//! counter and restores health.

use parking_lot::Mutex;
use std::time::SystemTime;
use tracing::{info, warn};

/// Health and address state for one replica, as seen by the master.
#[derive(Debug, Clone)]
pub struct ReplicaNode {
    /// replica address in `host:port` form
    pub addr: String,
    /// whether the replicator currently contacts this replica
    pub healthy: bool,
    /// failures since the last success
    pub consecutive_failures: u32,
    /// wall-clock time of the last acknowledged replication
    pub last_success: Option<SystemTime>,
    /// wall-clock time of the last failed attempt
    pub last_failure: Option<SystemTime>,
}

impl ReplicaNode {
    fn new(addr: String) -> Self {
        ReplicaNode {
            addr,
            healthy: true,
            consecutive_failures: 0,
            last_success: None,
            last_failure: None,
        }
    }
}

/// The set of replicas a master forwards mutations to.
///
/// Health state is mutated only through [`mark_success`] / [`mark_failure`];
/// an internal lock makes those safe to call from any replication worker.
///
/// [`mark_success`]: #method.mark_success
/// [`mark_failure`]: #method.mark_failure
#[derive(Debug)]
pub struct ReplicaSet {
    replicas: Mutex<Vec<ReplicaNode>>,
    max_failures: u32,
}

impl ReplicaSet {
    /// build a set from `host:port` addresses, all initially healthy
    pub fn new<I, S>(addrs: I, max_failures: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ReplicaSet {
            replicas: Mutex::new(addrs.into_iter().map(|a| ReplicaNode::new(a.into())).collect()),
            max_failures,
        }
    }

    /// addresses of every replica currently marked healthy
    pub fn healthy_addrs(&self) -> Vec<String> {
        self.replicas
            .lock()
            .iter()
            .filter(|replica| replica.healthy)
            .map(|replica| replica.addr.clone())
            .collect()
    }

    /// record an acknowledged replication to `addr`
    pub fn mark_success(&self, addr: &str) {
        let mut replicas = self.replicas.lock();
        if let Some(replica) = replicas.iter_mut().find(|replica| replica.addr == addr) {
            replica.last_success = Some(SystemTime::now());
            replica.consecutive_failures = 0;
            if !replica.healthy {
                replica.healthy = true;
                info!(addr, "replica is healthy again");
            }
        }
    }

    /// record a failed replication attempt to `addr`
    pub fn mark_failure(&self, addr: &str) {
        let mut replicas = self.replicas.lock();
        if let Some(replica) = replicas.iter_mut().find(|replica| replica.addr == addr) {
            replica.last_failure = Some(SystemTime::now());
            replica.consecutive_failures += 1;
            if replica.consecutive_failures >= self.max_failures && replica.healthy {
                replica.healthy = false;
                warn!(
                    addr,
                    failures = replica.consecutive_failures,
                    "replica marked unhealthy"
                );
            }
        }
    }

    /// operator-driven reset: mark every replica healthy with a clean counter
    pub fn reset_health(&self) {
        let mut replicas = self.replicas.lock();
        for replica in replicas.iter_mut() {
            replica.healthy = true;
            replica.consecutive_failures = 0;
        }
        info!("replica health reset");
    }

    /// snapshot of every replica's descriptor
    pub fn status(&self) -> Vec<ReplicaNode> {
        self.replicas.lock().clone()
    }

    /// number of configured replicas
    pub fn len(&self) -> usize {
        self.replicas.lock().len()
    }

    /// whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.replicas.lock().is_empty()
    }
}
