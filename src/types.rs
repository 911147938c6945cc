//! Core domain types shared across SM components, plus conversions from the
//! wire representation.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::proto;

/// Unique identity of a service instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceIdent {
    pub service_id: String,
    pub subject_id: String,
    pub instance: u64,
}

impl InstanceIdent {
    pub fn new(service_id: &str, subject_id: &str, instance: u64) -> Self {
        Self {
            service_id: service_id.to_string(),
            subject_id: subject_id.to_string(),
            instance,
        }
    }

    /// Flat instance ID used for unit names, netns names and storage dirs.
    pub fn instance_id(&self) -> String {
        format!("{}_{}_{}", self.service_id, self.subject_id, self.instance)
    }
}

impl fmt::Display for InstanceIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.service_id, self.subject_id, self.instance)
    }
}

/// Run state of an instance as reported upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Active,
    Failed,
    Stopped,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Active => "active",
            RunState::Failed => "failed",
            RunState::Stopped => "stopped",
        }
    }
}

impl From<&str> for RunState {
    fn from(s: &str) -> Self {
        match s {
            "active" => RunState::Active,
            "stopped" => RunState::Stopped,
            _ => RunState::Failed,
        }
    }
}

/// Firewall rule attached to an instance lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub src_ip: String,
    pub dst_ip: String,
    pub dst_port: String,
    pub proto: String,
}

/// Network parameters requested for an instance.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetworkParameters {
    pub network_id: String,
    pub subnet: String,
    pub ip: String,
    pub vlan_id: u64,
    pub dns_servers: Vec<String>,
    pub firewall_rules: Vec<FirewallRule>,
    pub download_limit: u64,
    pub upload_limit: u64,
}

/// Unit start/restart policy parameters. Unset fields fall back to runner
/// defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunParameters {
    pub start_interval: Option<Duration>,
    pub start_burst: Option<u64>,
    pub restart_interval: Option<Duration>,
}

/// Instance restart policy on quota breach.
pub const RESTART_POLICY_ON_QUOTA: &str = "onQuota";

/// Desired state of one instance, as received from the CM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub ident: InstanceIdent,
    pub uid: u32,
    pub priority: u64,
    pub storage_path: String,
    pub state_path: String,
    pub network_parameters: NetworkParameters,
    pub run_parameters: RunParameters,
    pub restart_policy: String,
}

/// Desired service revision, as received from the CM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub service_id: String,
    pub provider_id: String,
    pub version: String,
    pub gid: u32,
    pub url: String,
    pub sha256: String,
    pub size: u64,
}

/// Desired layer, as received from the CM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerInfo {
    pub layer_id: String,
    pub digest: String,
    pub version: String,
    pub url: String,
    pub sha256: String,
    pub size: u64,
}

/// Full desired state delivered by one RunInstances message.
#[derive(Debug, Clone, Default)]
pub struct DesiredState {
    pub services: Vec<ServiceInfo>,
    pub layers: Vec<LayerInfo>,
    pub instances: Vec<InstanceInfo>,
    pub force_restart: bool,
}

/// Per-instance status reported to the CM.
#[derive(Debug, Clone)]
pub struct InstanceStatus {
    pub ident: InstanceIdent,
    pub service_version: String,
    pub run_state: RunState,
    pub error: Option<crate::proto::ErrorInfo>,
}

/// Run status update from the runner for one unit.
#[derive(Debug, Clone)]
pub struct RunStatus {
    pub instance_id: String,
    pub state: RunState,
    pub exit_code: Option<i32>,
}

/// Filter matching a subset of instances. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceFilter {
    pub service_id: Option<String>,
    pub subject_id: Option<String>,
    pub instance: Option<u64>,
}

impl InstanceFilter {
    pub fn matches(&self, ident: &InstanceIdent) -> bool {
        self.service_id
            .as_ref()
            .is_none_or(|id| *id == ident.service_id)
            && self
                .subject_id
                .as_ref()
                .is_none_or(|id| *id == ident.subject_id)
            && self.instance.is_none_or(|idx| idx == ident.instance)
    }
}

/// Environment variable override with optional expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVarInfo {
    pub name: String,
    pub value: String,
    pub ttl: Option<DateTime<Utc>>,
}

/// Alert status used by quota alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertStatus {
    Raise,
    Continue,
    Fall,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Raise => "raise",
            AlertStatus::Continue => "continue",
            AlertStatus::Fall => "fall",
        }
    }
}

/// Alert variants streamed to the CM.
#[derive(Debug, Clone)]
pub enum Alert {
    System {
        message: String,
    },
    Core {
        core_component: String,
        message: String,
    },
    SystemQuota {
        parameter: String,
        value: u64,
        status: AlertStatus,
    },
    InstanceQuota {
        ident: InstanceIdent,
        parameter: String,
        value: u64,
        status: AlertStatus,
    },
    ServiceInstance {
        ident: InstanceIdent,
        service_version: String,
        message: String,
    },
    ResourceValidate {
        name: String,
        errors: Vec<String>,
    },
    Download {
        url: String,
        message: String,
    },
    DeviceAllocate {
        ident: InstanceIdent,
        device: String,
        message: String,
    },
}

impl Alert {
    pub fn tag(&self) -> &'static str {
        match self {
            Alert::System { .. } => "systemAlert",
            Alert::Core { .. } => "coreAlert",
            Alert::SystemQuota { .. } => "systemQuotaAlert",
            Alert::InstanceQuota { .. } => "instanceQuotaAlert",
            Alert::ServiceInstance { .. } => "serviceInstanceAlert",
            Alert::ResourceValidate { .. } => "resourceValidateAlert",
            Alert::Download { .. } => "downloadAlert",
            Alert::DeviceAllocate { .. } => "deviceAllocateAlert",
        }
    }
}

/// One monitoring sample for the node or an instance.
#[derive(Debug, Clone, Default)]
pub struct MonitoringData {
    pub cpu: f64,
    pub ram: u64,
    pub partitions: Vec<PartitionUsage>,
    pub download: u64,
    pub upload: u64,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct PartitionUsage {
    pub name: String,
    pub used_size: u64,
}

/// Aggregated node + per-instance monitoring sample.
#[derive(Debug, Clone, Default)]
pub struct NodeMonitoringData {
    pub node: MonitoringData,
    pub instances: Vec<(InstanceIdent, MonitoringData)>,
}

// Wire conversions.

impl From<proto::InstanceIdent> for InstanceIdent {
    fn from(v: proto::InstanceIdent) -> Self {
        Self {
            service_id: v.service_id,
            subject_id: v.subject_id,
            instance: v.instance,
        }
    }
}

impl From<&InstanceIdent> for proto::InstanceIdent {
    fn from(v: &InstanceIdent) -> Self {
        Self {
            service_id: v.service_id.clone(),
            subject_id: v.subject_id.clone(),
            instance: v.instance,
        }
    }
}

impl From<proto::InstanceFilter> for InstanceFilter {
    fn from(v: proto::InstanceFilter) -> Self {
        Self {
            service_id: v.service_id,
            subject_id: v.subject_id,
            instance: v.instance.map(|i| i as u64),
        }
    }
}

impl From<proto::NetworkParameters> for NetworkParameters {
    fn from(v: proto::NetworkParameters) -> Self {
        Self {
            network_id: v.network_id,
            subnet: v.subnet,
            ip: v.ip,
            vlan_id: v.vlan_id,
            dns_servers: v.dns_servers,
            firewall_rules: v
                .firewall_rules
                .into_iter()
                .map(|r| FirewallRule {
                    src_ip: r.src_ip,
                    dst_ip: r.dst_ip,
                    dst_port: r.dst_port,
                    proto: r.proto,
                })
                .collect(),
            download_limit: v.download_limit,
            upload_limit: v.upload_limit,
        }
    }
}

impl From<proto::RunParameters> for RunParameters {
    fn from(v: proto::RunParameters) -> Self {
        Self {
            start_interval: v
                .start_interval_sec
                .map(|s| Duration::from_secs(s.max(0) as u64)),
            start_burst: v.start_burst.map(|b| b.max(0) as u64),
            restart_interval: v
                .restart_interval_sec
                .map(|s| Duration::from_secs(s.max(0) as u64)),
        }
    }
}

impl From<proto::RunInstances> for DesiredState {
    fn from(v: proto::RunInstances) -> Self {
        Self {
            services: v
                .services
                .into_iter()
                .map(|s| ServiceInfo {
                    service_id: s.service_id,
                    provider_id: s.provider_id,
                    version: s.version,
                    gid: s.gid,
                    url: s.url,
                    sha256: s.sha256,
                    size: s.size,
                })
                .collect(),
            layers: v
                .layers
                .into_iter()
                .map(|l| LayerInfo {
                    layer_id: l.layer_id,
                    digest: l.digest,
                    version: l.version,
                    url: l.url,
                    sha256: l.sha256,
                    size: l.size,
                })
                .collect(),
            instances: v
                .instances
                .into_iter()
                .map(|i| InstanceInfo {
                    ident: i.instance.map(Into::into).unwrap_or_else(|| {
                        InstanceIdent::new("", "", 0)
                    }),
                    uid: i.uid,
                    priority: i.priority,
                    storage_path: i.storage_path,
                    state_path: i.state_path,
                    network_parameters: i
                        .network_parameters
                        .map(Into::into)
                        .unwrap_or_default(),
                    run_parameters: i.run_parameters.map(Into::into).unwrap_or_default(),
                    restart_policy: i.restart_policy,
                })
                .collect(),
            force_restart: v.force_restart,
        }
    }
}

impl From<&InstanceStatus> for proto::InstanceStatus {
    fn from(v: &InstanceStatus) -> Self {
        Self {
            instance: Some((&v.ident).into()),
            service_version: v.service_version.clone(),
            run_state: v.run_state.as_str().to_string(),
            error_info: v.error.clone(),
        }
    }
}

fn timestamp(t: DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: t.timestamp(),
        nanos: t.timestamp_subsec_nanos() as i32,
    }
}

impl From<&MonitoringData> for proto::MonitoringData {
    fn from(v: &MonitoringData) -> Self {
        Self {
            cpu: v.cpu,
            ram: v.ram,
            partitions: v
                .partitions
                .iter()
                .map(|p| proto::PartitionUsage {
                    name: p.name.clone(),
                    used_size: p.used_size,
                })
                .collect(),
            download: v.download,
            upload: v.upload,
            timestamp: v.timestamp.map(timestamp),
        }
    }
}

impl From<&NodeMonitoringData> for proto::NodeMonitoringData {
    fn from(v: &NodeMonitoringData) -> Self {
        Self {
            node_monitoring: Some((&v.node).into()),
            instances_monitoring: v
                .instances
                .iter()
                .map(|(ident, data)| proto::InstanceMonitoringData {
                    instance: Some(ident.into()),
                    monitoring_data: Some(data.into()),
                })
                .collect(),
        }
    }
}

impl From<&Alert> for proto::AlertItem {
    fn from(v: &Alert) -> Self {
        use proto::alert_item::AlertItem as Item;

        let item = match v {
            Alert::System { message } => Item::SystemAlert(proto::SystemAlert {
                message: message.clone(),
            }),
            Alert::Core {
                core_component,
                message,
            } => Item::CoreAlert(proto::CoreAlert {
                core_component: core_component.clone(),
                message: message.clone(),
            }),
            Alert::SystemQuota {
                parameter,
                value,
                status,
            } => Item::SystemQuotaAlert(proto::SystemQuotaAlert {
                parameter: parameter.clone(),
                value: *value,
                status: status.as_str().to_string(),
            }),
            Alert::InstanceQuota {
                ident,
                parameter,
                value,
                status,
            } => Item::InstanceQuotaAlert(proto::InstanceQuotaAlert {
                instance: Some(ident.into()),
                parameter: parameter.clone(),
                value: *value,
                status: status.as_str().to_string(),
            }),
            Alert::ServiceInstance {
                ident,
                service_version,
                message,
            } => Item::ServiceInstanceAlert(proto::ServiceInstanceAlert {
                instance: Some(ident.into()),
                service_version: service_version.clone(),
                message: message.clone(),
            }),
            Alert::ResourceValidate { name, errors } => {
                Item::ResourceValidateAlert(proto::ResourceValidateAlert {
                    name: name.clone(),
                    errors: errors
                        .iter()
                        .map(|msg| proto::ErrorInfo {
                            aos_code: crate::error::ErrorCode::Validation as i32,
                            exit_code: 0,
                            message: msg.clone(),
                        })
                        .collect(),
                })
            }
            Alert::Download { url, message } => Item::DownloadAlert(proto::DownloadAlert {
                url: url.clone(),
                message: message.clone(),
            }),
            Alert::DeviceAllocate {
                ident,
                device,
                message,
            } => Item::DeviceAllocateAlert(proto::DeviceAllocateAlert {
                instance: Some(ident.into()),
                device: device.clone(),
                message: message.clone(),
            }),
        };

        proto::AlertItem {
            timestamp: Some(timestamp(Utc::now())),
            tag: v.tag().to_string(),
            alert_item: Some(item),
        }
    }
}

/// Env var overrides applied to matched instances, keyed by filter.
pub type EnvVarOverrides = HashMap<InstanceFilter, Vec<EnvVarInfo>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_format() {
        let ident = InstanceIdent::new("svc", "sub", 2);
        assert_eq!(ident.instance_id(), "svc_sub_2");
    }

    #[test]
    fn filter_matches() {
        let ident = InstanceIdent::new("svc", "sub", 0);

        assert!(InstanceFilter::default().matches(&ident));
        assert!(InstanceFilter {
            service_id: Some("svc".into()),
            ..Default::default()
        }
        .matches(&ident));
        assert!(!InstanceFilter {
            service_id: Some("other".into()),
            ..Default::default()
        }
        .matches(&ident));
        assert!(!InstanceFilter {
            service_id: Some("svc".into()),
            instance: Some(1),
            ..Default::default()
        }
        .matches(&ident));
    }
}
