use crate::errors::*;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams, ListParams};
use kube::{Client, ResourceExt};
use log::trace;
use std::time::Duration;
use tokio::io::AsyncReadExt;

/// Runs shell snippets inside bookie containers.
#[async_trait]
pub trait PodRunner: Send + Sync {
    /// Names of the pods matching `selector`.
    async fn list_pods(&self, selector: &str) -> Result<Vec<String>>;

    /// Runs `script` with `sh -c` and returns stdout and stderr interleaved.
    async fn exec(&self, pod: &str, script: &str, timeout: Duration) -> Result<String>;
}

pub struct KubePodRunner {
    pods: Api<Pod>,
    container: String,
}

impl KubePodRunner {
    pub fn new(client: Client, namespace: &str, container: &str) -> Self {
        KubePodRunner {
            pods: Api::namespaced(client, namespace),
            container: container.to_string(),
        }
    }

    async fn run(&self, pod: &str, script: &str) -> Result<String> {
        let ap = AttachParams::default()
            .container(self.container.clone())
            .stderr(false);
        let command = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("{} 2>&1", script),
        ];
        let mut process = self.pods.exec(pod, command, &ap).await?;
        let status = process.take_status();

        let mut output = String::new();
        if let Some(mut stdout) = process.stdout() {
            stdout.read_to_string(&mut output).await?;
        }
        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        process
            .join()
            .await
            .map_err(|e| ErrorKind::ExecFailed(pod.to_string(), e.to_string()))?;
        check_status(pod, status, output)
    }
}

/// Fails on any exit status other than `Success`. A missing status keeps the output.
fn check_status(pod: &str, status: Option<Status>, output: String) -> Result<String> {
    match status {
        Some(s) if s.status.as_deref() != Some("Success") => {
            let reason = s
                .message
                .or(s.reason)
                .unwrap_or_else(|| "command exited with a failure status".to_string());
            bail!(ErrorKind::ExecFailed(
                pod.to_string(),
                format!("{}: {}", reason, output.trim())
            ))
        }
        _ => Ok(output),
    }
}

#[async_trait]
impl PodRunner for KubePodRunner {
    async fn list_pods(&self, selector: &str) -> Result<Vec<String>> {
        let lp = ListParams::default().labels(selector);
        Ok(self
            .pods
            .list(&lp)
            .await?
            .iter()
            .map(|p| p.name_any())
            .collect())
    }

    async fn exec(&self, pod: &str, script: &str, timeout: Duration) -> Result<String> {
        trace!("exec in {}: {}", pod, script);
        match tokio::time::timeout(timeout, self.run(pod, script)).await {
            Ok(res) => res,
            Err(_) => bail!(ErrorKind::ExecTimeout(pod.to_string(), timeout)),
        }
    }
}
