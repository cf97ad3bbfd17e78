//! The administrative surface of a single bookie, as seen by the autoscaler.
//!
//! Everything the decision algorithm and the decommission protocol know about a
//! bookie goes through [`AdminPort`]. How the answers are obtained (and how the
//! raw responses are parsed) stays behind the implementation.

use crate::errors::*;
use async_trait::async_trait;
use std::fmt;

/// Bookie identifier, also a resolvable DNS name:
/// `<pod-hostname>.<headless-service>.<namespace>.svc.<cluster-domain>:<port>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(
        hostname: &str,
        service: &str,
        namespace: &str,
        cluster_domain: &str,
        port: u16,
    ) -> Self {
        NodeId(format!(
            "{}.{}.{}.svc.{}:{}",
            hostname, service, namespace, cluster_domain, port
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: NodeId,
    /// Pod running the bookie.
    pub pod: String,
}

impl NodeInfo {
    /// StatefulSet ordinal parsed from the pod name, if it has one.
    pub fn ordinal(&self) -> Option<u32> {
        self.pod.rsplit('-').next().and_then(|s| s.parse().ok())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DiskUsage {
    pub used_bytes: u64,
    pub max_bytes: u64,
}

impl DiskUsage {
    /// `None` when the disk reports no capacity.
    pub fn ratio(&self) -> Option<f64> {
        if self.max_bytes == 0 {
            None
        } else {
            Some(self.used_bytes as f64 / self.max_bytes as f64)
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct NodeStats {
    pub writable: bool,
    pub disk_usages: Vec<DiskUsage>,
}

impl NodeStats {
    /// Every disk is at or above `hwm`. A node without measurable disks is never at risk.
    pub fn is_at_risk(&self, hwm: f64) -> bool {
        !self.disk_usages.is_empty()
            && self
                .disk_usages
                .iter()
                .all(|d| d.ratio().map_or(false, |r| r >= hwm))
    }

    /// Every disk is below `lwm`. A node without measurable disks never qualifies.
    pub fn is_below(&self, lwm: f64) -> bool {
        !self.disk_usages.is_empty()
            && self
                .disk_usages
                .iter()
                .all(|d| d.ratio().map_or(false, |r| r < lwm))
    }
}

#[async_trait]
pub trait AdminPort: Send + Sync {
    /// Bookies of the group ordered by StatefulSet ordinal.
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>>;

    async fn get_stats(&self, node: &NodeInfo) -> Result<NodeStats>;

    /// Idempotent.
    async fn set_read_only(&self, node: &NodeInfo, read_only: bool) -> Result<()>;

    /// Re-replicates the node's ledgers elsewhere; with `delete_cookie` the
    /// node's cookie is removed from metadata once recovery succeeded.
    async fn recover_and_maybe_delete_cookie(
        &self,
        node: &NodeInfo,
        delete_cookie: bool,
    ) -> Result<()>;

    async fn owns_ledgers(&self, node: &NodeInfo) -> Result<bool>;

    /// Cluster wide, not node scoped.
    async fn has_no_under_replicated_data(&self) -> Result<bool>;

    async fn trigger_audit(&self) -> Result<()>;

    /// Moves the cookie on the node's own disk out of the way. Best effort.
    async fn delete_cookie_on_disk(&self, node: &NodeInfo) -> Result<()>;
}
