//! Periodic autoscaler tasks, one per node group.
//!
//! [`TaskRegistry`] owns the live tasks. Runs are fixed-delay: the next run is
//! scheduled `period` after the previous one finished, so a slow run pushes the
//! next one out and two runs of the same task never overlap. Cancellation only
//! prevents future runs; a run in progress completes.
//!
//! [`AutoscalerDaemon`] watches the `BookKeeper` resources of one namespace and
//! keeps the registry in line with their autoscaler settings.

use crate::autoscaler::{AutoscaleParams, AutoscalerTask};
use crate::bookie::{BookieAdmin, BookieGroup};
use crate::cluster::KubeFleet;
use crate::config::OperatorConfig;
use crate::crd::{BookKeeper, NodeGroup};
use crate::errors::*;
use crate::exec::KubePodRunner;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use kube::api::Api;
use kube::{Client, ResourceExt};
use kube_runtime::watcher::{self, watcher, Event};
use kube_runtime::WatchStreamExt;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[async_trait]
pub trait PeriodicTask: Send {
    fn name(&self) -> &str;

    async fn run(&mut self) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey {
    pub namespace: String,
    /// Name of the BookKeeper resource.
    pub resource: String,
    pub set: String,
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.resource, self.set)
    }
}

struct Scheduled {
    period: Duration,
    params: watch::Sender<AutoscaleParams>,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Scheduled {
    fn cancel(self) -> JoinHandle<()> {
        let _ = self.cancel.send(true);
        self.handle
    }
}

#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<GroupKey, Scheduled>,
    shutting_down: bool,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn contains(&self, key: &GroupKey) -> bool {
        self.tasks.contains_key(key)
    }

    /// Brings the task for `key` in line with `params`.
    ///
    /// Disabled params cancel the task. A new period (or a task that is no
    /// longer running) replaces it with one built by `make`. Any other change
    /// is handed to the running task for its next run.
    pub fn upsert<F>(&mut self, key: GroupKey, params: AutoscaleParams, make: F) -> Result<()>
    where
        F: FnOnce(watch::Receiver<AutoscaleParams>) -> Box<dyn PeriodicTask>,
    {
        if self.shutting_down {
            bail!(ErrorKind::ShuttingDown);
        }
        if !params.enabled {
            if self.cancel(&key) {
                info!("autoscaling disabled for {}", key);
            }
            return Ok(());
        }
        if params.period.is_zero() {
            self.cancel(&key);
            bail!(ErrorKind::FatalConfig(format!("{}: periodMs must be positive", key)));
        }

        if let Some(s) = self.tasks.get(&key) {
            if s.period == params.period && !s.handle.is_finished() {
                s.params.send_if_modified(|current| {
                    if *current != params {
                        *current = params;
                        true
                    } else {
                        false
                    }
                });
                return Ok(());
            }
        }

        self.cancel(&key);
        let period = params.period;
        let (params_tx, params_rx) = watch::channel(params);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = make(params_rx);
        info!("scheduling {} every {:?}", key, period);
        let handle = tokio::spawn(drive(task, period, cancel_rx));
        self.tasks.insert(
            key,
            Scheduled {
                period,
                params: params_tx,
                cancel: cancel_tx,
                handle,
            },
        );
        Ok(())
    }

    /// Returns whether a task was scheduled for `key`.
    pub fn cancel(&mut self, key: &GroupKey) -> bool {
        match self.tasks.remove(key) {
            Some(s) => {
                debug!("cancelling {}", key);
                s.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every task whose key does not satisfy `keep`.
    pub fn retain<F: Fn(&GroupKey) -> bool>(&mut self, keep: F) {
        let gone: Vec<GroupKey> = self.tasks.keys().filter(|k| !keep(k)).cloned().collect();
        for key in gone {
            self.cancel(&key);
        }
    }

    /// Refuses further scheduling, cancels everything and waits for in-flight runs.
    pub async fn shutdown(&mut self) {
        self.shutting_down = true;
        let handles: Vec<_> = self.tasks.drain().map(|(_, s)| s.cancel()).collect();
        for res in futures::future::join_all(handles).await {
            if let Err(e) = res {
                warn!("autoscaler task ended abnormally: {}", e);
            }
        }
    }
}

async fn drive(mut task: Box<dyn PeriodicTask>, period: Duration, mut cancel: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = cancel.changed() => break,
        }

        let res = task.run().await;
        match CycleOutcome::of(&res) {
            CycleOutcome::Ok => {}
            CycleOutcome::ShuttingDown => debug!("{}: scheduler shutting down", task.name()),
            CycleOutcome::FatalConfig => {
                if let Err(e) = res {
                    error!("{}: {}", task.name(), e);
                }
            }
            CycleOutcome::TransientFailure => {
                if let Err(e) = res {
                    warn!("{}: run failed, retrying next period: {}", task.name(), e);
                }
            }
        }
    }
    debug!("{} stopped", task.name());
}

/// Everything a task for one node group is built from.
#[derive(Clone, Debug)]
pub struct GroupTarget {
    pub key: GroupKey,
    pub group: NodeGroup,
    pub cluster_domain: String,
}

pub type TaskFactory =
    Box<dyn Fn(GroupTarget, watch::Receiver<AutoscaleParams>) -> Box<dyn PeriodicTask> + Send + Sync>;

/// Turns `BookKeeper` watch events into registry changes for one namespace.
pub struct Reconciler {
    namespace: String,
    cluster_domain: String,
    registry: TaskRegistry,
    make: TaskFactory,
}

impl Reconciler {
    pub fn new(namespace: &str, cluster_domain: &str, make: TaskFactory) -> Self {
        Reconciler {
            namespace: namespace.to_string(),
            cluster_domain: cluster_domain.to_string(),
            registry: TaskRegistry::new(),
            make,
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn handle(&mut self, event: Event<BookKeeper>) {
        match event {
            Event::Applied(bk) => self.apply(&bk),
            Event::Deleted(bk) => {
                let name = bk.name_any();
                self.registry.retain(|k| k.resource != name);
            }
            Event::Restarted(all) => {
                let names: Vec<String> = all.iter().map(|bk| bk.name_any()).collect();
                self.registry.retain(|k| names.contains(&k.resource));
                for bk in &all {
                    self.apply(bk);
                }
            }
        }
    }

    fn apply(&mut self, bk: &BookKeeper) {
        let name = bk.name_any();
        let groups = bk.node_groups();
        let sets: Vec<String> = groups.iter().map(|g| g.set.clone()).collect();
        self.registry
            .retain(|k| k.resource != name || sets.contains(&k.set));

        let cluster_domain = bk.cluster_domain().unwrap_or(&self.cluster_domain).to_string();

        for group in groups {
            let key = GroupKey {
                namespace: self.namespace.clone(),
                resource: name.clone(),
                set: group.set.clone(),
            };
            let params = group.params.clone();
            let target = GroupTarget {
                key: key.clone(),
                group,
                cluster_domain: cluster_domain.clone(),
            };
            let make = &self.make;

            let res = self
                .registry
                .upsert(key.clone(), params, move |rx| make(target, rx));
            match CycleOutcome::of(&res) {
                CycleOutcome::Ok => {}
                CycleOutcome::ShuttingDown => debug!("not scheduling {}: shutting down", key),
                CycleOutcome::FatalConfig | CycleOutcome::TransientFailure => {
                    if let Err(e) = res {
                        error!("failed to schedule {}: {}", key, e);
                    }
                }
            }
        }
    }

    pub async fn shutdown(&mut self) {
        self.registry.shutdown().await;
    }
}

/// Keeps one autoscaler task per enabled node group of one namespace.
pub struct AutoscalerDaemon {
    client: Client,
    namespace: String,
    reconciler: Reconciler,
}

impl AutoscalerDaemon {
    pub fn new(client: Client, namespace: &str, config: Arc<OperatorConfig>) -> Self {
        let make: TaskFactory = {
            let client = client.clone();
            let config = config.clone();
            Box::new(move |target, params| {
                Box::new(build_task(client.clone(), &config, target, params)) as Box<dyn PeriodicTask>
            })
        };
        AutoscalerDaemon {
            client,
            namespace: namespace.to_string(),
            reconciler: Reconciler::new(namespace, &config.cluster_domain, make),
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("watching BookKeeper resources in {}", self.namespace);
        let api: Api<BookKeeper> = Api::namespaced(self.client.clone(), &self.namespace);
        let mut events = watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();

        loop {
            tokio::select! {
                ev = events.try_next() => match ev {
                    Ok(Some(ev)) => self.reconciler.handle(ev),
                    Ok(None) => break,
                    Err(e) => warn!("watch on {} failed: {}", self.namespace, e),
                },
                _ = shutdown.changed() => break,
            }
        }

        info!("stopping autoscalers in {}", self.namespace);
        self.reconciler.shutdown().await;
    }
}

fn build_task(
    client: Client,
    config: &OperatorConfig,
    target: GroupTarget,
    params: watch::Receiver<AutoscaleParams>,
) -> AutoscalerTask {
    let namespace = target.key.namespace.as_str();
    let runner = Arc::new(KubePodRunner::new(
        client.clone(),
        namespace,
        &config.bookie.container,
    ));
    let admin = BookieAdmin::new(
        runner,
        BookieGroup {
            namespace: namespace.to_string(),
            service: target.group.resource_name(),
            selector: target.group.selector(),
            cluster_domain: target.cluster_domain.clone(),
        },
        config,
    );
    let fleet = KubeFleet::new(client, namespace, &target.key.resource, target.group);
    AutoscalerTask::new(
        target.key.to_string(),
        params,
        Arc::new(admin),
        Arc::new(fleet),
        config.decommission_settle,
    )
}
