//! [`AdminPort`] over the bookie's own tooling, reached by exec into its container.
//!
//! Fast reads and the read-only toggle go to the bookie HTTP admin API on
//! localhost; recovery and ledger listing shell out to the bookkeeper CLI.
//! Responses are matched against the fixed strings below, which must stay
//! exactly as the bookies print them.

use crate::admin::{AdminPort, DiskUsage, NodeId, NodeInfo, NodeStats};
use crate::config::{BookieConfig, OperatorConfig};
use crate::errors::*;
use crate::exec::PodRunner;
use async_trait::async_trait;
use log::{debug, info, warn};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

pub const STATE_PATH: &str = "/api/v1/bookie/state";
pub const INFO_PATH: &str = "/api/v1/bookie/info";
pub const READ_ONLY_PATH: &str = "/api/v1/bookie/state/readonly";
pub const UNDER_REPLICATED_PATH: &str = "/api/v1/autorecovery/list_under_replicated_ledger/";
pub const TRIGGER_AUDIT_PATH: &str = "/api/v1/autorecovery/trigger_audit";

pub const NO_UNDER_REPLICATED: &str = "No under replicated ledgers found";
pub const RECOVER_OK: &str = "Recover bookie operation completed with rc: OK: No problem";
pub const COOKIE_DELETED: &str = "cookie is deleted";
pub const NO_COOKIE: &str = "No cookie to remove";
pub const LEDGER_MARKER: &str = "ledgerID: ";
/// Output that makes a ledger listing untrustworthy. Treated as "still owns ledgers".
pub const LEDGER_ERROR_MARKERS: [&str; 3] = ["Exception", "ERROR", "Unable to"];

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct BookieState {
    running: bool,
    read_only: bool,
    shutting_down: bool,
    #[allow(dead_code)]
    available_for_high_priority_writes: bool,
}

impl BookieState {
    fn writable(&self) -> bool {
        self.running && !self.read_only && !self.shutting_down
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct BookieInfo {
    free_space: i64,
    total_space: i64,
}

impl BookieInfo {
    fn disk_usage(&self) -> DiskUsage {
        let total = self.total_space.max(0) as u64;
        let free = self.free_space.max(0) as u64;
        DiskUsage {
            used_bytes: total.saturating_sub(free),
            max_bytes: total,
        }
    }
}

/// Identity and addressing of one bookie group.
#[derive(Clone, Debug)]
pub struct BookieGroup {
    pub namespace: String,
    pub service: String,
    pub selector: String,
    pub cluster_domain: String,
}

pub struct BookieAdmin {
    runner: Arc<dyn PodRunner>,
    group: BookieGroup,
    bookie: BookieConfig,
    exec_timeout: Duration,
    maintenance_timeout: Duration,
}

impl BookieAdmin {
    pub fn new(runner: Arc<dyn PodRunner>, group: BookieGroup, config: &OperatorConfig) -> Self {
        BookieAdmin {
            runner,
            group,
            bookie: config.bookie.clone(),
            exec_timeout: config.exec_timeout,
            maintenance_timeout: config.maintenance_timeout,
        }
    }

    fn curl(&self, method: &str, path: &str, body: Option<&str>) -> String {
        let url = format!("localhost:{}{}", self.bookie.admin_port, path);
        match body {
            Some(body) => format!(
                "curl -s -X {} -H 'Content-Type: application/json' -d '{}' {}",
                method, body, url
            ),
            None => format!("curl -s -X {} {}", method, url),
        }
    }

    fn shell(&self, args: &str) -> String {
        format!("{} shell {}", self.bookie.shell, args)
    }

    fn parse<'a, T: Deserialize<'a>>(node: &NodeInfo, raw: &'a str) -> Result<T> {
        serde_json::from_str(raw.trim()).map_err(|e| {
            ErrorKind::UnexpectedResponse(node.id.to_string(), format!("{}: {}", e, raw)).into()
        })
    }

    /// Any bookie serves the cluster wide autorecovery endpoints.
    async fn any_pod(&self) -> Result<String> {
        self.list_nodes()
            .await?
            .into_iter()
            .next()
            .map(|n| n.pod)
            .ok_or_else(|| format!("no bookie pods match {}", self.group.selector).into())
    }
}

#[async_trait]
impl AdminPort for BookieAdmin {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        let mut nodes: Vec<NodeInfo> = self
            .runner
            .list_pods(&self.group.selector)
            .await?
            .into_iter()
            .map(|pod| NodeInfo {
                id: NodeId::new(
                    &pod,
                    &self.group.service,
                    &self.group.namespace,
                    &self.group.cluster_domain,
                    self.bookie.bookie_port,
                ),
                pod,
            })
            .collect();
        nodes.sort_by(|a, b| (a.ordinal(), &a.pod).cmp(&(b.ordinal(), &b.pod)));
        Ok(nodes)
    }

    async fn get_stats(&self, node: &NodeInfo) -> Result<NodeStats> {
        let raw = self
            .runner
            .exec(&node.pod, &self.curl("GET", STATE_PATH, None), self.exec_timeout)
            .await?;
        let state: BookieState = Self::parse(node, &raw)?;

        let raw = self
            .runner
            .exec(&node.pod, &self.curl("GET", INFO_PATH, None), self.exec_timeout)
            .await?;
        let info: BookieInfo = Self::parse(node, &raw)?;

        Ok(NodeStats {
            writable: state.writable(),
            disk_usages: vec![info.disk_usage()],
        })
    }

    async fn set_read_only(&self, node: &NodeInfo, read_only: bool) -> Result<()> {
        let body = format!("{{\"readOnly\":{}}}", read_only);
        let out = self
            .runner
            .exec(
                &node.pod,
                &self.curl("PUT", READ_ONLY_PATH, Some(&body)),
                self.exec_timeout,
            )
            .await?;
        debug!("set readOnly={} on {}: {}", read_only, node.id, out.trim());
        Ok(())
    }

    async fn recover_and_maybe_delete_cookie(
        &self,
        node: &NodeInfo,
        delete_cookie: bool,
    ) -> Result<()> {
        let args = if delete_cookie {
            format!("recover -f -d {}", node.id)
        } else {
            format!("recover -f {}", node.id)
        };
        let out = self
            .runner
            .exec(&node.pod, &self.shell(&args), self.exec_timeout)
            .await?;

        let ok = if delete_cookie {
            out.contains(COOKIE_DELETED) || out.contains(NO_COOKIE)
        } else {
            out.contains(RECOVER_OK)
        };
        if !ok {
            bail!(ErrorKind::RecoveryFailed(node.id.to_string(), out));
        }
        info!("recovered {} (delete cookie: {})", node.id, delete_cookie);
        Ok(())
    }

    async fn owns_ledgers(&self, node: &NodeInfo) -> Result<bool> {
        let out = self
            .runner
            .exec(
                &node.pod,
                &self.shell(&format!("listledgers -meta -bookieid {}", node.id)),
                self.maintenance_timeout,
            )
            .await?;

        if out.contains(LEDGER_MARKER) {
            return Ok(true);
        }
        if LEDGER_ERROR_MARKERS.iter().any(|m| out.contains(m)) {
            warn!("ledger listing for {} reported errors, assuming it still owns ledgers", node.id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn has_no_under_replicated_data(&self) -> Result<bool> {
        let pod = self.any_pod().await?;
        let out = self
            .runner
            .exec(
                &pod,
                &self.curl("GET", UNDER_REPLICATED_PATH, None),
                self.maintenance_timeout,
            )
            .await?;
        Ok(out.contains(NO_UNDER_REPLICATED))
    }

    async fn trigger_audit(&self) -> Result<()> {
        let pod = self.any_pod().await?;
        self.runner
            .exec(
                &pod,
                &self.curl("PUT", TRIGGER_AUDIT_PATH, None),
                self.maintenance_timeout,
            )
            .await?;
        Ok(())
    }

    async fn delete_cookie_on_disk(&self, node: &NodeInfo) -> Result<()> {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        let cookie = format!("{}/current/VERSION", self.bookie.journal_dir);
        let script = format!("mv {} {}.bak-{}", cookie, cookie, suffix);

        match self.runner.exec(&node.pod, &script, self.exec_timeout).await {
            Ok(out) => debug!("moved cookie on {}: {}", node.id, out.trim()),
            Err(e) => warn!("failed to move cookie on {}: {}", node.id, e),
        }
        Ok(())
    }
}
