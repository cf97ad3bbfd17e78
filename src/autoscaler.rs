use crate::admin::{AdminPort, NodeInfo, NodeStats};
use crate::cluster::FleetControl;
use crate::decommission::Decommission;
use crate::errors::*;
use crate::scheduler::PeriodicTask;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Clone, Debug, PartialEq)]
pub struct AutoscaleParams {
    pub enabled: bool,
    pub period: Duration,
    pub disk_usage_hwm: f64,
    pub disk_usage_lwm: f64,
    pub min_writable: i32,
    pub scale_up_by: i32,
    pub scale_down_by: i32,
    pub scale_up_max_limit: i32,
    pub stabilization_window: Duration,
}

impl Default for AutoscaleParams {
    fn default() -> Self {
        AutoscaleParams {
            enabled: false,
            period: Duration::from_millis(10_000),
            disk_usage_hwm: 0.92,
            disk_usage_lwm: 0.75,
            min_writable: 3,
            scale_up_by: 1,
            scale_down_by: 1,
            scale_up_max_limit: 30,
            stabilization_window: Duration::from_millis(300_000),
        }
    }
}

impl AutoscaleParams {
    pub fn validate(&self) -> Result<()> {
        if self.scale_up_max_limit < self.min_writable {
            bail!(ErrorKind::FatalConfig(format!(
                "scaleUpMaxLimit ({}) must be >= minWritableBookies ({})",
                self.scale_up_max_limit, self.min_writable
            )));
        }
        Ok(())
    }

    /// Target replica count for a signed change, kept within `[min_writable, scale_up_max_limit]`.
    pub fn clamp_target(&self, current: i32, change: i32) -> i32 {
        current
            .saturating_add(change)
            .max(self.min_writable)
            .min(self.scale_up_max_limit)
    }
}

/// One snapshot of the fleet.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FleetStats {
    pub writable: i32,
    pub at_risk_writable: i32,
    pub read_only: i32,
    /// Every writable bookie has all disks below the low-water mark.
    pub writable_below_lwm: bool,
}

impl FleetStats {
    pub fn collect<'a>(stats: impl IntoIterator<Item = &'a NodeStats>, params: &AutoscaleParams) -> Self {
        let mut fleet = FleetStats {
            writable_below_lwm: true,
            ..Default::default()
        };
        for s in stats {
            if s.writable {
                fleet.writable += 1;
                if s.is_at_risk(params.disk_usage_hwm) {
                    fleet.at_risk_writable += 1;
                }
                fleet.writable_below_lwm &= s.is_below(params.disk_usage_lwm);
            } else {
                fleet.read_only += 1;
            }
        }
        fleet
    }
}

/// Scale-up part of the decision: a deficit of writable bookies always wins,
/// otherwise at-risk bookies earn a safety margin.
pub fn scale_up_change(fleet: &FleetStats, params: &AutoscaleParams) -> i32 {
    let mut change = 0;
    if fleet.writable < params.min_writable {
        change += params.min_writable - fleet.writable;
    } else if fleet.at_risk_writable > 0
        && (fleet.writable - fleet.at_risk_writable) < (params.min_writable - change)
    {
        change += params.scale_up_by;
    }
    change
}

/// How many bookies may go if the disks allow it.
pub fn scale_down_change(fleet: &FleetStats, params: &AutoscaleParams) -> i32 {
    -params.scale_down_by.min(fleet.writable - params.min_writable)
}

pub struct AutoscalerTask {
    name: String,
    params: watch::Receiver<AutoscaleParams>,
    admin: Arc<dyn AdminPort>,
    fleet: Arc<dyn FleetControl>,
    settle: Duration,
    /// Last (current, target) pair that could not move because of the limits.
    clamped: Option<(i32, i32)>,
}

impl AutoscalerTask {
    pub fn new(
        name: String,
        params: watch::Receiver<AutoscaleParams>,
        admin: Arc<dyn AdminPort>,
        fleet: Arc<dyn FleetControl>,
        settle: Duration,
    ) -> Self {
        AutoscalerTask {
            name,
            params,
            admin,
            fleet,
            settle,
            clamped: None,
        }
    }

    async fn collect(&self, params: &AutoscaleParams) -> Result<FleetStats> {
        let nodes = self.admin.list_nodes().await?;
        let mut stats = Vec::with_capacity(nodes.len());
        for n in &nodes {
            stats.push(self.admin.get_stats(n).await?);
        }
        Ok(FleetStats::collect(&stats, params))
    }

    /// Signed replica change, 0 when nothing should happen.
    async fn decide(&self, fleet: &FleetStats, params: &AutoscaleParams) -> Result<i32> {
        let up = scale_up_change(fleet, params);
        if up != 0 {
            info!(
                "{}: scale up by {} (writable: {}, at risk: {}, read-only: {})",
                self.name, up, fleet.writable, fleet.at_risk_writable, fleet.read_only
            );
            return Ok(up);
        }
        if fleet.writable <= params.min_writable {
            debug!("{}: stable with {} writable bookies", self.name, fleet.writable);
            return Ok(0);
        }
        if !fleet.writable_below_lwm {
            debug!("{}: disk usage too high to scale down", self.name);
            return Ok(0);
        }
        if !self.admin.has_no_under_replicated_data().await? {
            info!("{}: under-replicated ledgers present, not scaling down", self.name);
            return Ok(0);
        }
        let down = scale_down_change(fleet, params);
        info!(
            "{}: scale down by {} (writable: {})",
            self.name, -down, fleet.writable
        );
        Ok(down)
    }

    /// Highest ordinals first.
    fn victims(mut nodes: Vec<NodeInfo>, count: usize) -> Vec<NodeInfo> {
        nodes.sort_by(|a, b| (b.ordinal(), &b.pod).cmp(&(a.ordinal(), &a.pod)));
        nodes.truncate(count);
        nodes
    }

    pub async fn run_cycle(&mut self) -> Result<()> {
        let params = self.params.borrow().clone();
        params.validate()?;

        let current = match self.fleet.current_replicas().await? {
            Some(r) => r,
            None => {
                info!("{}: resource is gone, skipping", self.name);
                return Ok(());
            }
        };

        if !self
            .fleet
            .is_ready_to_scale(params.stabilization_window, current)
            .await?
        {
            debug!("{}: fleet not stable at {} replicas, skipping", self.name, current);
            return Ok(());
        }

        let fleet = self.collect(&params).await?;
        let change = self.decide(&fleet, &params).await?;
        if change == 0 {
            return Ok(());
        }

        let target = params.clamp_target(current, change);
        if target == current {
            if self.clamped != Some((current, target)) {
                warn!(
                    "{}: wanted {:+} replicas but limits keep it at {}",
                    self.name, change, current
                );
                self.clamped = Some((current, target));
            }
            return Ok(());
        }
        self.clamped = None;

        let replicas = if target < current {
            let victims = Self::victims(self.admin.list_nodes().await?, (current - target) as usize);
            let removed = Decommission::new(self.admin.as_ref(), self.settle)
                .run(&victims)
                .await?;
            if removed > 0 {
                if let Err(e) = self.admin.trigger_audit().await {
                    warn!("{}: failed to trigger audit: {}", self.name, e);
                }
            }
            info!(
                "{}: decommissioned {} of {} bookies",
                self.name,
                removed,
                victims.len()
            );
            current - removed as i32
        } else {
            target
        };

        if replicas != current {
            info!("{}: scaling from {} to {} replicas", self.name, current, replicas);
            self.fleet.set_replicas(replicas).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PeriodicTask for AutoscalerTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&mut self) -> Result<()> {
        self.run_cycle().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::fake::{Call, FakeAdmin};
    use crate::cluster::fake::FakeFleet;
    use proptest::prelude::*;

    fn params() -> AutoscaleParams {
        AutoscaleParams {
            enabled: true,
            ..Default::default()
        }
    }

    fn fleet_stats(writable: i32, at_risk: i32) -> FleetStats {
        FleetStats {
            writable,
            at_risk_writable: at_risk,
            read_only: 0,
            writable_below_lwm: false,
        }
    }

    fn pods(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("pulsar-bookkeeper-{}", i)).collect()
    }

    fn new_task(
        admin: Arc<FakeAdmin>,
        fleet: Arc<FakeFleet>,
        params: AutoscaleParams,
    ) -> (watch::Sender<AutoscaleParams>, AutoscalerTask) {
        let (tx, rx) = watch::channel(params);
        let task = AutoscalerTask::new("ns/pulsar/bookkeeper".into(), rx, admin, fleet, Duration::ZERO);
        (tx, task)
    }

    fn admin_with_usage(ratios: &[f64]) -> Arc<FakeAdmin> {
        let names = pods(ratios.len());
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let admin = FakeAdmin::with_pods(&refs);
        for (pod, r) in refs.iter().zip(ratios) {
            admin.set_usage(pod, true, *r);
        }
        Arc::new(admin)
    }

    #[test]
    fn deficit_wins() {
        let p = AutoscaleParams {
            min_writable: 3,
            scale_up_by: 1,
            ..params()
        };
        assert_eq!(scale_up_change(&fleet_stats(2, 0), &p), 1);
        assert_eq!(scale_up_change(&fleet_stats(0, 0), &p), 3);
        // deficit is computed as the gap, not scale_up_by, even with at-risk nodes
        assert_eq!(scale_up_change(&fleet_stats(1, 1), &p), 2);
        assert_eq!(p.clamp_target(2, 1), 3);
    }

    #[test]
    fn at_risk_margin() {
        let p = AutoscaleParams {
            min_writable: 3,
            scale_up_by: 1,
            ..params()
        };
        assert_eq!(scale_up_change(&fleet_stats(3, 1), &p), 1);
        assert_eq!(p.clamp_target(3, 1), 4);
        // enough healthy writable bookies left
        assert_eq!(scale_up_change(&fleet_stats(5, 1), &p), 0);
    }

    #[test]
    fn scale_down_amount() {
        let p = AutoscaleParams {
            min_writable: 3,
            scale_down_by: 1,
            ..params()
        };
        assert_eq!(scale_down_change(&fleet_stats(5, 0), &p), -1);
        let p = AutoscaleParams {
            scale_down_by: 5,
            ..p
        };
        assert_eq!(scale_down_change(&fleet_stats(5, 0), &p), -2);
    }

    #[test]
    fn invalid_limits_are_fatal() {
        let p = AutoscaleParams {
            min_writable: 5,
            scale_up_max_limit: 4,
            ..params()
        };
        let err = p.validate().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::FatalConfig(_)));
    }

    proptest! {
        #[test]
        fn target_stays_within_limits(
            min in 0i32..50,
            extra in 0i32..50,
            current in 0i32..200,
            change in -100i32..100,
        ) {
            let p = AutoscaleParams {
                min_writable: min,
                scale_up_max_limit: min + extra,
                ..params()
            };
            prop_assert!(p.validate().is_ok());
            let target = p.clamp_target(current, change);
            prop_assert!(target >= p.min_writable);
            prop_assert!(target <= p.scale_up_max_limit);
        }
    }

    #[tokio::test]
    async fn scenario_deficit_grows_to_min() {
        let admin = admin_with_usage(&[0.5, 0.5]);
        let fleet = Arc::new(FakeFleet::new(2));
        let (_tx, mut task) = new_task(admin, fleet.clone(), params());

        task.run_cycle().await.unwrap();
        assert_eq!(fleet.patches(), vec![3]);
    }

    #[tokio::test]
    async fn read_only_bookies_count_as_deficit() {
        let admin = admin_with_usage(&[0.5, 0.5, 0.5]);
        admin.set_usage("pulsar-bookkeeper-2", false, 0.5);
        let fleet = Arc::new(FakeFleet::new(3));
        let (_tx, mut task) = new_task(admin, fleet.clone(), params());

        task.run_cycle().await.unwrap();
        assert_eq!(fleet.patches(), vec![4]);
    }

    #[tokio::test]
    async fn scenario_at_risk_adds_margin() {
        let admin = admin_with_usage(&[0.95, 0.5, 0.5]);
        let fleet = Arc::new(FakeFleet::new(3));
        let (_tx, mut task) = new_task(admin, fleet.clone(), params());

        task.run_cycle().await.unwrap();
        assert_eq!(fleet.patches(), vec![4]);
    }

    #[tokio::test]
    async fn scenario_scale_down_permitted() {
        let admin = admin_with_usage(&[0.3; 5]);
        let fleet = Arc::new(FakeFleet::new(5));
        let (_tx, mut task) = new_task(admin.clone(), fleet.clone(), params());

        task.run_cycle().await.unwrap();
        assert_eq!(fleet.patches(), vec![4]);
        assert_eq!(
            admin.state.lock().unwrap().cookies_deleted,
            vec!["pulsar-bookkeeper-4".to_string()]
        );
        assert_eq!(admin.calls().last(), Some(&Call::TriggerAudit));
    }

    #[tokio::test]
    async fn scenario_scale_down_blocked_by_disk() {
        let admin = admin_with_usage(&[0.3, 0.3, 0.8, 0.3, 0.3]);
        let fleet = Arc::new(FakeFleet::new(5));
        let (_tx, mut task) = new_task(admin.clone(), fleet.clone(), params());

        task.run_cycle().await.unwrap();
        assert!(fleet.patches().is_empty());
        assert!(admin.calls().is_empty());
    }

    #[tokio::test]
    async fn scale_down_blocked_by_under_replication() {
        let admin = admin_with_usage(&[0.3; 5]);
        admin.state.lock().unwrap().under_replicated = true;
        let fleet = Arc::new(FakeFleet::new(5));
        let (_tx, mut task) = new_task(admin.clone(), fleet.clone(), params());

        task.run_cycle().await.unwrap();
        assert!(fleet.patches().is_empty());
        assert_eq!(admin.calls(), vec![Call::UnderReplicatedCheck]);
    }

    #[tokio::test]
    async fn partial_decommission_shrinks_by_removed_count() {
        let admin = admin_with_usage(&[0.1; 6]);
        // bk-4 passes recovery but owns ledgers again at the re-check
        admin
            .state
            .lock()
            .unwrap()
            .ledgers_after_checks
            .insert("pulsar-bookkeeper-4".into(), 1);
        let fleet = Arc::new(FakeFleet::new(6));
        let p = AutoscaleParams {
            scale_down_by: 2,
            ..params()
        };
        let (_tx, mut task) = new_task(admin.clone(), fleet.clone(), p);

        task.run_cycle().await.unwrap();
        assert_eq!(fleet.patches(), vec![5]);

        let state = admin.state.lock().unwrap();
        assert_eq!(state.cookies_deleted, vec!["pulsar-bookkeeper-5".to_string()]);
        assert!(!state.read_only.contains("pulsar-bookkeeper-4"));
    }

    #[tokio::test]
    async fn failed_decommission_leaves_replicas_alone() {
        let admin = admin_with_usage(&[0.1; 5]);
        admin
            .state
            .lock()
            .unwrap()
            .fail_recover
            .insert("pulsar-bookkeeper-4".into());
        let fleet = Arc::new(FakeFleet::new(5));
        let (_tx, mut task) = new_task(admin.clone(), fleet.clone(), params());

        task.run_cycle().await.unwrap();
        assert!(fleet.patches().is_empty());
        assert!(!admin.calls().contains(&Call::TriggerAudit));
        assert!(admin.state.lock().unwrap().read_only.is_empty());
    }

    #[tokio::test]
    async fn fatal_config_never_touches_resource() {
        let admin = admin_with_usage(&[0.5; 2]);
        let fleet = Arc::new(FakeFleet::new(2));
        let p = AutoscaleParams {
            min_writable: 3,
            scale_up_max_limit: 2,
            ..params()
        };
        let (_tx, mut task) = new_task(admin.clone(), fleet.clone(), p);

        for _ in 0..3 {
            let err = task.run_cycle().await.unwrap_err();
            assert!(matches!(err.kind(), ErrorKind::FatalConfig(_)));
        }
        assert!(fleet.patches().is_empty());
        assert!(admin.calls().is_empty());
    }

    #[tokio::test]
    async fn live_param_edit_is_picked_up_next_cycle() {
        let admin = admin_with_usage(&[0.5; 3]);
        let fleet = Arc::new(FakeFleet::new(3));
        let (tx, mut task) = new_task(admin, fleet.clone(), params());

        task.run_cycle().await.unwrap();
        assert!(fleet.patches().is_empty());

        tx.send_replace(AutoscaleParams {
            min_writable: 4,
            ..params()
        });
        task.run_cycle().await.unwrap();
        assert_eq!(fleet.patches(), vec![4]);
    }

    #[tokio::test]
    async fn skips_when_resource_gone_or_unstable() {
        let admin = admin_with_usage(&[0.5; 2]);
        let fleet = Arc::new(FakeFleet::new(2));
        *fleet.replicas.lock().unwrap() = None;
        let (_tx, mut task) = new_task(admin.clone(), fleet.clone(), params());
        task.run_cycle().await.unwrap();

        let mut unstable = FakeFleet::new(2);
        unstable.ready = false;
        let unstable = Arc::new(unstable);
        let (_tx, mut task) = new_task(admin.clone(), unstable.clone(), params());
        task.run_cycle().await.unwrap();

        assert!(fleet.patches().is_empty());
        assert!(unstable.patches().is_empty());
        assert!(admin.calls().is_empty());
    }

    #[tokio::test]
    async fn clamped_at_max_limit_does_nothing() {
        let admin = admin_with_usage(&[0.95, 0.95, 0.95]);
        let fleet = Arc::new(FakeFleet::new(3));
        let p = AutoscaleParams {
            scale_up_max_limit: 3,
            ..params()
        };
        let (_tx, mut task) = new_task(admin, fleet.clone(), p);

        task.run_cycle().await.unwrap();
        task.run_cycle().await.unwrap();
        assert!(fleet.patches().is_empty());
        assert_eq!(task.clamped, Some((3, 3)));
    }
}
