use crate::{config::OperatorConfig, crd::BookKeeper, errors::*, scheduler::AutoscalerDaemon};
use futures::{future::BoxFuture, FutureExt};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{api::Api, client::Client, CustomResourceExt};
use log::info;
use std::sync::Arc;
use tokio::sync::watch;

/// Owns one autoscaler daemon per watched namespace.
pub struct Manager {
    shutdown: watch::Sender<bool>,
}

impl Manager {
    /// Lifecycle initialization interface for app
    ///
    /// This returns a `Manager` that drives the daemons + a future to be awaited.
    /// The future completes once every daemon stopped its tasks after `shutdown`.
    pub async fn new(
        client: Client,
        config: OperatorConfig,
    ) -> Result<(Self, BoxFuture<'static, ()>)> {
        let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
        let crd_name = BookKeeper::crd_name();
        crds.get(crd_name)
            .await
            .chain_err(|| format!("install the {} crd first", crd_name))?;

        let (shutdown, rx) = watch::channel(false);
        let config = Arc::new(config);
        let daemons: Vec<_> = config
            .namespaces
            .iter()
            .map(|ns| AutoscalerDaemon::new(client.clone(), ns, config.clone()).run(rx.clone()))
            .collect();
        info!("starting autoscalers for {:?}", config.namespaces);

        let drainer = futures::future::join_all(daemons).map(|_| ()).boxed();
        Ok((Manager { shutdown }, drainer))
    }

    /// Stops scheduling; in-flight runs are allowed to finish.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}
