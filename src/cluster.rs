use crate::crd::{BookKeeper, NodeGroup};
use crate::errors::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetStatus};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Client;
use log::debug;
use std::time::Duration;

/// The live state a node group's autoscaler reads and writes.
#[async_trait]
pub trait FleetControl: Send + Sync {
    /// Replica count of the group as currently declared, `None` if the
    /// resource or the group is gone.
    async fn current_replicas(&self) -> Result<Option<i32>>;

    /// The group's pods have all been ready at `expected` replicas for at least `window`.
    async fn is_ready_to_scale(&self, window: Duration, expected: i32) -> Result<bool>;

    async fn set_replicas(&self, replicas: i32) -> Result<()>;
}

// stabilized indicates whether the underlying statefulset is ready and up to date.
fn stabilized(status: &StatefulSetStatus, expected: i32) -> bool {
    status.replicas == expected
        && [
            status.current_replicas,
            status.ready_replicas,
            status.updated_replicas,
        ]
        .iter()
        .all(|x| match *x {
            Some(x) => x == status.replicas,
            _ => false,
        })
}

/// When the pod last turned Ready, if it is Ready now.
fn ready_since(pod: &Pod) -> Option<DateTime<Utc>> {
    pod.status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == "Ready" && c.status == "True")
        .and_then(|c| c.last_transition_time.as_ref())
        .map(|t| t.0)
}

pub fn ready_to_scale(
    sts: &StatefulSet,
    pods: &[Pod],
    window: Duration,
    expected: i32,
    now: DateTime<Utc>,
) -> bool {
    let declared = sts.spec.as_ref().and_then(|s| s.replicas);
    if declared != Some(expected) {
        return false;
    }
    if !sts.status.as_ref().map_or(false, |s| stabilized(s, expected)) {
        return false;
    }
    if pods.len() != expected as usize {
        return false;
    }
    let window = match chrono::Duration::from_std(window) {
        Ok(w) => w,
        Err(_) => return false,
    };
    pods.iter()
        .all(|p| {
            ready_since(p)
                .and_then(|t| t.checked_add_signed(window))
                .map_or(false, |end| end <= now)
        })
}

pub struct KubeFleet {
    client: Client,
    namespace: String,
    /// Name of the BookKeeper resource.
    name: String,
    group: NodeGroup,
}

impl KubeFleet {
    pub fn new(client: Client, namespace: &str, name: &str, group: NodeGroup) -> Self {
        KubeFleet {
            client,
            namespace: namespace.to_string(),
            name: name.to_string(),
            group,
        }
    }

    fn clusters(&self) -> Api<BookKeeper> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait]
impl FleetControl for KubeFleet {
    async fn current_replicas(&self) -> Result<Option<i32>> {
        let bk = match self.clusters().get_opt(&self.name).await? {
            Some(bk) => bk,
            None => return Ok(None),
        };
        Ok(bk.node_group(&self.group.set).map(|g| g.replicas))
    }

    async fn is_ready_to_scale(&self, window: Duration, expected: i32) -> Result<bool> {
        let statefulsets: Api<StatefulSet> = Api::namespaced(self.client.clone(), &self.namespace);
        let sts = match statefulsets.get_opt(&self.group.resource_name()).await? {
            Some(sts) => sts,
            None => return Ok(false),
        };

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let lp = ListParams::default().labels(&self.group.selector());
        let pods = pods.list(&lp).await?.items;

        Ok(ready_to_scale(&sts, &pods, window, expected, Utc::now()))
    }

    async fn set_replicas(&self, replicas: i32) -> Result<()> {
        let patch = self.group.replicas_patch(replicas);
        debug!("patching {}/{}: {}", self.namespace, self.name, patch);
        self.clusters()
            .patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    pub struct FakeFleet {
        pub replicas: Mutex<Option<i32>>,
        pub ready: bool,
        pub patches: Mutex<Vec<i32>>,
    }

    impl FakeFleet {
        pub fn new(replicas: i32) -> Self {
            FakeFleet {
                replicas: Mutex::new(Some(replicas)),
                ready: true,
                patches: Mutex::new(vec![]),
            }
        }

        pub fn patches(&self) -> Vec<i32> {
            self.patches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FleetControl for FakeFleet {
        async fn current_replicas(&self) -> Result<Option<i32>> {
            Ok(*self.replicas.lock().unwrap())
        }

        async fn is_ready_to_scale(&self, _window: Duration, _expected: i32) -> Result<bool> {
            Ok(self.ready)
        }

        async fn set_replicas(&self, replicas: i32) -> Result<()> {
            self.patches.lock().unwrap().push(replicas);
            *self.replicas.lock().unwrap() = Some(replicas);
            Ok(())
        }
    }
}
