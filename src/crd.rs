use crate::autoscaler::AutoscaleParams;
use kube_derive::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;

/// Name of the node group used when the resource declares no sets.
pub const DEFAULT_SET: &str = "bookkeeper";
pub const DEFAULT_REPLICAS: i32 = 3;

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Default)]
#[kube(
    group = "kaap.oss.datastax.com",
    version = "v1alpha1",
    kind = "BookKeeper",
    shortname = "bk",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BookKeeperSpec {
    pub global: GlobalSpec,
    #[serde(default)]
    pub bookkeeper: BookieFleetSpec,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSpec {
    /// Cluster name, the prefix of every bookie resource.
    pub name: String,
    pub cluster_domain: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BookieFleetSpec {
    pub replicas: Option<i32>,
    pub autoscaler: Option<AutoscalerSpec>,
    /// Independently scaled bookie sets. Empty means a single default set.
    pub sets: Option<BTreeMap<String, BookieSetSpec>>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BookieSetSpec {
    pub replicas: Option<i32>,
    pub autoscaler: Option<AutoscalerSpec>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalerSpec {
    pub enabled: Option<bool>,
    pub period_ms: Option<u64>,
    pub disk_usage_tolerance_hwm: Option<f64>,
    pub disk_usage_tolerance_lwm: Option<f64>,
    pub min_writable_bookies: Option<i32>,
    pub scale_up_by: Option<i32>,
    pub scale_down_by: Option<i32>,
    pub scale_up_max_limit: Option<i32>,
    pub stabilization_window_ms: Option<u64>,
}

impl AutoscalerSpec {
    /// Fields set on `self` win, the rest come from `fallback`.
    pub fn merged_over(&self, fallback: &AutoscalerSpec) -> AutoscalerSpec {
        AutoscalerSpec {
            enabled: self.enabled.or(fallback.enabled),
            period_ms: self.period_ms.or(fallback.period_ms),
            disk_usage_tolerance_hwm: self
                .disk_usage_tolerance_hwm
                .or(fallback.disk_usage_tolerance_hwm),
            disk_usage_tolerance_lwm: self
                .disk_usage_tolerance_lwm
                .or(fallback.disk_usage_tolerance_lwm),
            min_writable_bookies: self.min_writable_bookies.or(fallback.min_writable_bookies),
            scale_up_by: self.scale_up_by.or(fallback.scale_up_by),
            scale_down_by: self.scale_down_by.or(fallback.scale_down_by),
            scale_up_max_limit: self.scale_up_max_limit.or(fallback.scale_up_max_limit),
            stabilization_window_ms: self
                .stabilization_window_ms
                .or(fallback.stabilization_window_ms),
        }
    }

    pub fn params(&self) -> AutoscaleParams {
        let d = AutoscaleParams::default();
        AutoscaleParams {
            enabled: self.enabled.unwrap_or(d.enabled),
            period: self.period_ms.map(Duration::from_millis).unwrap_or(d.period),
            disk_usage_hwm: self.disk_usage_tolerance_hwm.unwrap_or(d.disk_usage_hwm),
            disk_usage_lwm: self.disk_usage_tolerance_lwm.unwrap_or(d.disk_usage_lwm),
            min_writable: self.min_writable_bookies.unwrap_or(d.min_writable),
            scale_up_by: self.scale_up_by.unwrap_or(d.scale_up_by),
            scale_down_by: self.scale_down_by.unwrap_or(d.scale_down_by),
            scale_up_max_limit: self.scale_up_max_limit.unwrap_or(d.scale_up_max_limit),
            stabilization_window: self
                .stabilization_window_ms
                .map(Duration::from_millis)
                .unwrap_or(d.stabilization_window),
        }
    }
}

/// A subset of the fleet sharing one replica field and one set of autoscaler params.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeGroup {
    pub cluster: String,
    pub set: String,
    pub replicas: i32,
    pub params: AutoscaleParams,
}

impl NodeGroup {
    fn is_default(&self) -> bool {
        self.set == DEFAULT_SET
    }

    /// Name of both the StatefulSet and its headless service.
    pub fn resource_name(&self) -> String {
        if self.is_default() {
            format!("{}-bookkeeper", self.cluster)
        } else {
            format!("{}-bookkeeper-{}", self.cluster, self.set)
        }
    }

    pub fn selector(&self) -> String {
        format!(
            "cluster={},component=bookkeeper,resource-set={}",
            self.cluster, self.set
        )
    }

    /// Merge patch that sets only this group's replica field.
    pub fn replicas_patch(&self, replicas: i32) -> serde_json::Value {
        if self.is_default() {
            json!({ "spec": { "bookkeeper": { "replicas": replicas } } })
        } else {
            json!({ "spec": { "bookkeeper": { "sets": { self.set.as_str(): { "replicas": replicas } } } } })
        }
    }
}

impl BookKeeper {
    pub fn cluster_domain(&self) -> Option<&str> {
        self.spec.global.cluster_domain.as_deref()
    }

    pub fn node_groups(&self) -> Vec<NodeGroup> {
        let fleet = &self.spec.bookkeeper;
        let fleet_autoscaler = fleet.autoscaler.clone().unwrap_or_default();
        let fleet_replicas = fleet.replicas.unwrap_or(DEFAULT_REPLICAS);
        let cluster = self.spec.global.name.clone();

        match &fleet.sets {
            Some(sets) if !sets.is_empty() => sets
                .iter()
                .map(|(name, set)| NodeGroup {
                    cluster: cluster.clone(),
                    set: name.clone(),
                    replicas: set.replicas.unwrap_or(fleet_replicas),
                    params: set
                        .autoscaler
                        .as_ref()
                        .map(|a| a.merged_over(&fleet_autoscaler))
                        .unwrap_or_else(|| fleet_autoscaler.clone())
                        .params(),
                })
                .collect(),
            _ => vec![NodeGroup {
                cluster,
                set: DEFAULT_SET.to_string(),
                replicas: fleet_replicas,
                params: fleet_autoscaler.params(),
            }],
        }
    }

    pub fn node_group(&self, set: &str) -> Option<NodeGroup> {
        self.node_groups().into_iter().find(|g| g.set == set)
    }
}
