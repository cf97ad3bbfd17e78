use bookie_autoscaler::{config::load_config, crd::BookKeeper, errors::*, manager::Manager};
use env_logger::Env;
use kube::{Client, CustomResourceExt};
use log::{error, info};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    if let Err(e) = libmain().await {
        error!("{}", e);
        for cause in e.iter().skip(1) {
            error!("caused by: {}", cause);
        }
        std::process::exit(1);
    }
}

async fn libmain() -> Result<()> {
    // `crd` prints the resource definition to install before starting the operator.
    if std::env::args().nth(1).as_deref() == Some("crd") {
        print!("{}", serde_yaml::to_string(&BookKeeper::crd())?);
        return Ok(());
    }

    let config = load_config()?;

    // Read the environment to find config for kube client.
    // Note that this tries an in-cluster configuration first,
    // then falls back on a kubeconfig file.
    let client = Client::try_default().await?;

    let (manager, drainer) = Manager::new(client, config).await?;
    let drainer = tokio::spawn(drainer);

    tokio::signal::ctrl_c().await?;
    info!("shutting down, waiting for running autoscalers");
    manager.shutdown();
    drainer
        .await
        .map_err(|e| Error::from(format!("autoscalers ended abnormally: {}", e)))?;
    Ok(())
}
