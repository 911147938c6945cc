//! Node resource profile: host devices, resource groups and quota rules.
//!
//! The profile is read from the node config file (JSON, per node type) and
//! consumed by the launcher (devices, mounts, env) and the resource monitor
//! (quotas, alert rules).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceInfo {
    pub name: String,
    pub host_devices: Vec<String>,
    pub groups: Vec<String>,
    /// Zero means unlimited concurrent holders.
    pub shared_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MountInfo {
    pub source: String,
    pub destination: String,
    #[serde(rename = "type")]
    pub mount_type: String,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceInfo {
    pub name: String,
    pub groups: Vec<String>,
    pub mounts: Vec<MountInfo>,
    pub env: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlertRule {
    pub min_threshold: f64,
    pub max_threshold: f64,
    /// Seconds the average must stay below the min threshold before the
    /// alert falls.
    pub min_timeout: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlertRules {
    pub cpu: Option<AlertRule>,
    pub ram: Option<AlertRule>,
    pub download: Option<AlertRule>,
    pub upload: Option<AlertRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuotaConfig {
    pub cpu_percent: Option<f64>,
    pub ram: Option<u64>,
    pub storage: Option<u64>,
    pub download_speed: Option<u64>,
    pub upload_speed: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeConfig {
    pub node_type: String,
    pub version: String,
    pub devices: Vec<DeviceInfo>,
    pub resources: Vec<ResourceInfo>,
    pub quotas: QuotaConfig,
    pub alert_rules: AlertRules,
}

#[derive(Debug)]
pub struct ResourceManager {
    node_config: NodeConfig,
    // device name -> instance ids currently holding it
    allocations: Mutex<HashMap<String, Vec<String>>>,
}

impl ResourceManager {
    /// Builds a manager directly from a profile; used when the node config
    /// file is rejected and the node falls back to an empty profile.
    pub fn from_config(node_config: NodeConfig) -> Self {
        Self {
            node_config,
            allocations: Mutex::new(HashMap::new()),
        }
    }

    /// Loads and validates the node config. A missing file yields an empty
    /// profile.
    pub async fn new(node_config_file: &Path, node_type: &str) -> Result<Self> {
        let node_config = match tokio::fs::read_to_string(node_config_file).await {
            Ok(text) => {
                let config: NodeConfig = serde_json::from_str(&text)
                    .map_err(|err| Error::Validation(format!("invalid node config: {err}")))?;

                validate_node_config(&config)?;

                if !config.node_type.is_empty() && config.node_type != node_type {
                    warn!(
                        expected = node_type,
                        actual = %config.node_type,
                        "node config is for a different node type"
                    );
                }

                config
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(file = %node_config_file.display(), "no node config, using empty profile");

                NodeConfig::default()
            }
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            node_config,
            allocations: Mutex::new(HashMap::new()),
        })
    }

    pub fn node_config(&self) -> &NodeConfig {
        &self.node_config
    }

    pub fn version(&self) -> &str {
        &self.node_config.version
    }

    pub fn alert_rules(&self) -> &AlertRules {
        &self.node_config.alert_rules
    }

    pub fn quotas(&self) -> &QuotaConfig {
        &self.node_config.quotas
    }

    /// Resolves a device name to its profile entry.
    pub fn get_device_info(&self, name: &str) -> Result<&DeviceInfo> {
        self.node_config
            .devices
            .iter()
            .find(|device| device.name == name)
            .ok_or_else(|| Error::NotFound(format!("device {name}")))
    }

    /// Resolves a resource group name to its profile entry.
    pub fn get_resource_info(&self, name: &str) -> Result<&ResourceInfo> {
        self.node_config
            .resources
            .iter()
            .find(|resource| resource.name == name)
            .ok_or_else(|| Error::NotFound(format!("resource {name}")))
    }

    /// Claims a device for an instance, enforcing the shared count.
    pub async fn allocate_device(&self, name: &str, instance_id: &str) -> Result<()> {
        let device = self.get_device_info(name)?;
        let mut allocations = self.allocations.lock().await;
        let holders = allocations.entry(name.to_string()).or_default();

        if holders.iter().any(|holder| holder == instance_id) {
            return Ok(());
        }

        if device.shared_count != 0 && holders.len() as u32 >= device.shared_count {
            return Err(Error::Failed(format!(
                "device {name} shared count {} exhausted",
                device.shared_count
            )));
        }

        holders.push(instance_id.to_string());

        Ok(())
    }

    /// Releases all devices held by an instance. Idempotent.
    pub async fn release_devices(&self, instance_id: &str) {
        let mut allocations = self.allocations.lock().await;

        for holders in allocations.values_mut() {
            holders.retain(|holder| holder != instance_id);
        }
    }
}

fn validate_node_config(config: &NodeConfig) -> Result<()> {
    let mut errors = Vec::new();

    let mut seen = std::collections::HashSet::new();
    for device in &config.devices {
        if !seen.insert(&device.name) {
            errors.push(format!("duplicate device {}", device.name));
        }

        if device.host_devices.is_empty() {
            errors.push(format!("device {} has no host devices", device.name));
        }
    }

    for rule in [
        ("cpu", &config.alert_rules.cpu),
        ("ram", &config.alert_rules.ram),
        ("download", &config.alert_rules.download),
        ("upload", &config.alert_rules.upload),
    ] {
        if let (name, Some(rule)) = rule {
            if rule.min_threshold > rule.max_threshold {
                errors.push(format!(
                    "{name} alert rule: min threshold {} above max {}",
                    rule.min_threshold, rule.max_threshold
                ));
            }
        }
    }

    if !errors.is_empty() {
        return Err(Error::Validation(errors.join("; ")));
    }

    Ok(())
}

/// Returns the alert fall timeout for a rule, defaulting to one poll.
pub fn rule_timeout(rule: &AlertRule) -> Duration {
    Duration::from_secs(rule.min_timeout)
}

/// Writes a node config file; used by tests and provisioning tooling.
pub async fn write_node_config(path: &PathBuf, config: &NodeConfig) -> Result<()> {
    tokio::fs::write(path, serde_json::to_string_pretty(config)?).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NodeConfig {
        NodeConfig {
            node_type: "main".to_string(),
            version: "1.0.0".to_string(),
            devices: vec![DeviceInfo {
                name: "camera".to_string(),
                host_devices: vec!["/dev/video0".to_string()],
                groups: vec!["video".to_string()],
                shared_count: 1,
            }],
            resources: vec![ResourceInfo {
                name: "render".to_string(),
                groups: vec!["render".to_string()],
                ..Default::default()
            }],
            quotas: QuotaConfig {
                ram: Some(1024 * 1024),
                ..Default::default()
            },
            alert_rules: AlertRules {
                ram: Some(AlertRule {
                    min_threshold: 80.0,
                    max_threshold: 90.0,
                    min_timeout: 0,
                }),
                ..Default::default()
            },
        }
    }

    async fn manager_with(config: &NodeConfig) -> ResourceManager {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aos_node.cfg");

        write_node_config(&path, config).await.unwrap();

        ResourceManager::new(&path, "main").await.unwrap()
    }

    #[tokio::test]
    async fn loads_profile_and_resolves_names() {
        let manager = manager_with(&sample()).await;

        assert_eq!(manager.version(), "1.0.0");
        assert_eq!(
            manager.get_device_info("camera").unwrap().host_devices,
            vec!["/dev/video0"]
        );
        assert!(manager.get_device_info("missing").is_err());
        assert!(manager.get_resource_info("render").is_ok());
    }

    #[tokio::test]
    async fn missing_file_gives_empty_profile() {
        let manager = ResourceManager::new(Path::new("/nonexistent/aos_node.cfg"), "main")
            .await
            .unwrap();

        assert!(manager.node_config().devices.is_empty());
    }

    #[tokio::test]
    async fn invalid_alert_rule_fails_validation() {
        let mut config = sample();
        config.alert_rules.ram = Some(AlertRule {
            min_threshold: 95.0,
            max_threshold: 90.0,
            min_timeout: 0,
        });

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aos_node.cfg");
        write_node_config(&path, &config).await.unwrap();

        let err = ResourceManager::new(&path, "main").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn shared_count_enforced() {
        let manager = manager_with(&sample()).await;

        manager.allocate_device("camera", "inst0").await.unwrap();
        // Same holder again is fine.
        manager.allocate_device("camera", "inst0").await.unwrap();

        let err = manager.allocate_device("camera", "inst1").await.unwrap_err();
        assert!(matches!(err, Error::Failed(_)));

        manager.release_devices("inst0").await;
        manager.allocate_device("camera", "inst1").await.unwrap();
    }
}
