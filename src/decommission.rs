//! Safe removal of bookies from the fleet.
//!
//! Victims go through quarantine (read-only), a settle pause, ledger recovery,
//! a cluster wide under-replication check and finally cookie deletion. Whoever
//! does not make it through cookie deletion is put back into service.
//!
//! A failure while quarantining aborts the whole run before the rollback step,
//! so bookies already switched to read-only stay that way until an operator
//! (or a later decommission of the same bookies) intervenes.

use crate::admin::{AdminPort, NodeInfo};
use crate::errors::*;
use log::{error, info, warn};
use std::time::Duration;

pub struct Decommission<'a> {
    admin: &'a dyn AdminPort,
    settle: Duration,
}

impl<'a> Decommission<'a> {
    pub fn new(admin: &'a dyn AdminPort, settle: Duration) -> Self {
        Decommission { admin, settle }
    }

    /// Returns how many victims, taken from the front of `victims`, are gone for good.
    pub async fn run(&self, victims: &[NodeInfo]) -> Result<usize> {
        let mut quarantined: Vec<&NodeInfo> = Vec::with_capacity(victims.len());
        for v in victims {
            self.admin
                .set_read_only(v, true)
                .await
                .chain_err(|| format!("failed to quarantine {}", v.id))?;
            quarantined.push(v);
        }
        info!("quarantined {} bookies", quarantined.len());

        tokio::time::sleep(self.settle).await;

        let mut decommissioned = 0;
        if self.recover_all(victims).await && self.cluster_is_clean().await {
            for v in victims {
                if !self.delete_cookie(v).await {
                    break;
                }
                quarantined.retain(|q| q.id != v.id);
                decommissioned += 1;
            }
        }

        for v in quarantined {
            if let Err(e) = self.admin.set_read_only(v, false).await {
                error!("failed to return {} to service: {}", v.id, e);
            } else {
                info!("returned {} to service", v.id);
            }
        }

        Ok(decommissioned)
    }

    /// Stops at the first victim that fails.
    async fn recover_all(&self, victims: &[NodeInfo]) -> bool {
        for v in victims {
            if let Err(e) = self.admin.recover_and_maybe_delete_cookie(v, false).await {
                warn!("recovery of {} failed: {}", v.id, e);
                return false;
            }
            match self.admin.owns_ledgers(v).await {
                Ok(false) => {}
                Ok(true) => {
                    warn!("{} still owns ledgers after recovery", v.id);
                    return false;
                }
                Err(e) => {
                    warn!("failed to list ledgers of {}: {}", v.id, e);
                    return false;
                }
            }
        }
        true
    }

    async fn cluster_is_clean(&self) -> bool {
        match self.admin.has_no_under_replicated_data().await {
            Ok(true) => true,
            Ok(false) => {
                warn!("cluster has under-replicated ledgers, keeping cookies");
                false
            }
            Err(e) => {
                warn!("under-replication check failed: {}", e);
                false
            }
        }
    }

    /// The ownership check right before deletion guards against data loss.
    async fn delete_cookie(&self, v: &NodeInfo) -> bool {
        match self.admin.owns_ledgers(v).await {
            Ok(false) => {}
            Ok(true) => {
                warn!("{} owns ledgers again, not deleting its cookie", v.id);
                return false;
            }
            Err(e) => {
                warn!("failed to list ledgers of {}: {}", v.id, e);
                return false;
            }
        }
        if let Err(e) = self.admin.recover_and_maybe_delete_cookie(v, true).await {
            warn!("cookie deletion for {} failed: {}", v.id, e);
            return false;
        }
        if let Err(e) = self.admin.delete_cookie_on_disk(v).await {
            warn!("failed to remove cookie on disk of {}: {}", v.id, e);
        }
        info!("decommissioned {}", v.id);
        true
    }
}
