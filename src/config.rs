use crate::errors::*;
use log::info;
use serde::Deserialize;
use std::env;
use std::fs::File;
use std::io::BufReader;
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "BOOKIE_AUTOSCALER_CONFIG";
pub const WATCH_NAMESPACE_ENV: &str = "WATCH_NAMESPACE";

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct OperatorConfig {
    /// Namespaces with one scheduler daemon each.
    pub namespaces: Vec<String>,
    /// Used in bookie ids unless the resource sets its own.
    pub cluster_domain: String,
    /// Upper bound for any command executed in a bookie container.
    #[serde(with = "humantime_serde")]
    pub exec_timeout: Duration,
    /// Bound for ledger listing and audit triggers.
    #[serde(with = "humantime_serde")]
    pub maintenance_timeout: Duration,
    /// Grace period between quarantining victims and recovering them.
    #[serde(with = "humantime_serde")]
    pub decommission_settle: Duration,
    pub bookie: BookieConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct BookieConfig {
    pub container: String,
    pub admin_port: u16,
    pub bookie_port: u16,
    /// The bookkeeper CLI inside the container.
    pub shell: String,
    pub journal_dir: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        OperatorConfig {
            namespaces: vec!["default".to_string()],
            cluster_domain: "cluster.local".to_string(),
            exec_timeout: Duration::from_secs(120),
            maintenance_timeout: Duration::from_secs(60),
            decommission_settle: Duration::from_secs(5),
            bookie: BookieConfig::default(),
        }
    }
}

impl Default for BookieConfig {
    fn default() -> Self {
        BookieConfig {
            container: "bookkeeper".to_string(),
            admin_port: 8000,
            bookie_port: 3181,
            shell: "bookkeeper".to_string(),
            journal_dir: "/pulsar/data/bookkeeper/journal".to_string(),
        }
    }
}

impl OperatorConfig {
    pub fn from_yaml(s: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(s)?)
    }

    fn with_namespace_override(mut self, raw: Option<String>) -> Self {
        if let Some(raw) = raw {
            let namespaces: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if !namespaces.is_empty() {
                self.namespaces = namespaces;
            }
        }
        self
    }
}

/// Reads the file named by `BOOKIE_AUTOSCALER_CONFIG`, falling back to defaults.
pub fn load_config() -> Result<OperatorConfig> {
    let config = match env::var(CONFIG_PATH_ENV) {
        Ok(path) => {
            let file = File::open(&path)
                .chain_err(|| format!("failed to open config file {}", path))?;
            serde_yaml::from_reader::<_, OperatorConfig>(BufReader::new(file))?
        }
        Err(_) => {
            info!("{} not set, using default configuration", CONFIG_PATH_ENV);
            OperatorConfig::default()
        }
    };

    Ok(config.with_namespace_override(env::var(WATCH_NAMESPACE_ENV).ok()))
}
