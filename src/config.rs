//! SM configuration file parsing.
//!
//! The config is JSON with case-insensitive keys. Durations are given as
//! strings like `"35s"`, `"10m"` or `"30d"`. Missing paths default to
//! subdirectories of `workingDir`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

const DEFAULT_SERVICE_TTL: Duration = Duration::from_secs(30 * 24 * 3600);
const DEFAULT_LAYER_TTL: Duration = Duration::from_secs(30 * 24 * 3600);
const DEFAULT_REMOVE_OUTDATED_PERIOD: Duration = Duration::from_secs(24 * 3600);
const DEFAULT_CM_RECONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MONITORING_POLL_PERIOD: Duration = Duration::from_secs(35);
const DEFAULT_MONITORING_AVERAGE_WINDOW: Duration = Duration::from_secs(35);
const DEFAULT_LOG_PART_SIZE: u64 = 64 * 1024;
const DEFAULT_LOG_PART_COUNT: u64 = 80;
const DEFAULT_SERVICE_ALERT_PRIORITY: i32 = 4;
const DEFAULT_SYSTEM_ALERT_PRIORITY: i32 = 3;
const MAX_ALERT_PRIORITY: i32 = 7;

/// Serde adapter for humantime duration strings.
mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(d)?;

        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub ip: String,
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LauncherConfig {
    #[serde(rename = "hostbinds", default)]
    pub host_binds: Vec<String>,

    #[serde(rename = "hosts", default)]
    pub hosts: Vec<Host>,

    #[serde(rename = "storagedir", default)]
    pub storage_dir: PathBuf,

    #[serde(rename = "statedir", default)]
    pub state_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmClientConfig {
    #[serde(rename = "cmserverurl", default)]
    pub cm_server_url: String,

    #[serde(
        rename = "cmreconnecttimeout",
        with = "duration_str",
        default = "default_cm_reconnect_timeout"
    )]
    pub cm_reconnect_timeout: Duration,
}

impl Default for SmClientConfig {
    fn default() -> Self {
        Self {
            cm_server_url: String::new(),
            cm_reconnect_timeout: DEFAULT_CM_RECONNECT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(
        rename = "pollperiod",
        with = "duration_str",
        default = "default_poll_period"
    )]
    pub poll_period: Duration,

    #[serde(
        rename = "averagewindow",
        with = "duration_str",
        default = "default_average_window"
    )]
    pub average_window: Duration,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            poll_period: DEFAULT_MONITORING_POLL_PERIOD,
            average_window: DEFAULT_MONITORING_AVERAGE_WINDOW,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(rename = "maxpartsize", default = "default_log_part_size")]
    pub max_part_size: u64,

    #[serde(rename = "maxpartcount", default = "default_log_part_count")]
    pub max_part_count: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            max_part_size: DEFAULT_LOG_PART_SIZE,
            max_part_count: DEFAULT_LOG_PART_COUNT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalAlertsConfig {
    #[serde(rename = "filter", default)]
    pub filter: Vec<String>,

    #[serde(
        rename = "servicealertpriority",
        default = "default_service_alert_priority"
    )]
    pub service_alert_priority: i32,

    #[serde(
        rename = "systemalertpriority",
        default = "default_system_alert_priority"
    )]
    pub system_alert_priority: i32,
}

impl Default for JournalAlertsConfig {
    fn default() -> Self {
        Self {
            filter: Vec::new(),
            service_alert_priority: DEFAULT_SERVICE_ALERT_PRIORITY,
            system_alert_priority: DEFAULT_SYSTEM_ALERT_PRIORITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationConfig {
    #[serde(rename = "migrationpath", default = "default_migration_path")]
    pub migration_path: PathBuf,

    #[serde(rename = "mergedmigrationpath", default)]
    pub merged_migration_path: PathBuf,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            migration_path: default_migration_path(),
            merged_migration_path: PathBuf::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "workingdir")]
    pub working_dir: PathBuf,

    #[serde(rename = "iampublicserverurl", default)]
    pub iam_public_server_url: String,

    #[serde(rename = "iamprotectedserverurl", default)]
    pub iam_protected_server_url: String,

    #[serde(rename = "certstorage", default = "default_cert_storage")]
    pub cert_storage: PathBuf,

    #[serde(rename = "cacert", default)]
    pub ca_cert: PathBuf,

    #[serde(rename = "servicespartlimit", default)]
    pub services_part_limit: u32,

    #[serde(rename = "layerspartlimit", default)]
    pub layers_part_limit: u32,

    #[serde(rename = "nodeconfigfile", default)]
    pub node_config_file: PathBuf,

    #[serde(rename = "servicesdir", default)]
    pub services_dir: PathBuf,

    #[serde(rename = "layersdir", default)]
    pub layers_dir: PathBuf,

    #[serde(rename = "downloaddir", default)]
    pub download_dir: PathBuf,

    #[serde(
        rename = "servicettl",
        with = "duration_str",
        default = "default_service_ttl"
    )]
    pub service_ttl: Duration,

    #[serde(
        rename = "layerttl",
        with = "duration_str",
        default = "default_layer_ttl"
    )]
    pub layer_ttl: Duration,

    #[serde(
        rename = "removeoutdatedperiod",
        with = "duration_str",
        default = "default_remove_outdated_period"
    )]
    pub remove_outdated_period: Duration,

    #[serde(rename = "launcher", default)]
    pub launcher: LauncherConfig,

    #[serde(rename = "smclient", default)]
    pub sm_client: SmClientConfig,

    #[serde(rename = "monitoring", default)]
    pub monitoring: MonitoringConfig,

    #[serde(rename = "logging", default)]
    pub logging: LoggingConfig,

    #[serde(rename = "journalalerts", default)]
    pub journal_alerts: JournalAlertsConfig,

    #[serde(rename = "migration", default)]
    pub migration: MigrationConfig,
}

fn default_cert_storage() -> PathBuf {
    PathBuf::from("/var/aos/crypt/sm/")
}

fn default_migration_path() -> PathBuf {
    PathBuf::from("/usr/share/aos/servicemanager/migration")
}

fn default_cm_reconnect_timeout() -> Duration {
    DEFAULT_CM_RECONNECT_TIMEOUT
}

fn default_poll_period() -> Duration {
    DEFAULT_MONITORING_POLL_PERIOD
}

fn default_average_window() -> Duration {
    DEFAULT_MONITORING_AVERAGE_WINDOW
}

fn default_log_part_size() -> u64 {
    DEFAULT_LOG_PART_SIZE
}

fn default_log_part_count() -> u64 {
    DEFAULT_LOG_PART_COUNT
}

fn default_service_alert_priority() -> i32 {
    DEFAULT_SERVICE_ALERT_PRIORITY
}

fn default_system_alert_priority() -> i32 {
    DEFAULT_SYSTEM_ALERT_PRIORITY
}

fn default_service_ttl() -> Duration {
    DEFAULT_SERVICE_TTL
}

fn default_layer_ttl() -> Duration {
    DEFAULT_LAYER_TTL
}

fn default_remove_outdated_period() -> Duration {
    DEFAULT_REMOVE_OUTDATED_PERIOD
}

/// Lowercase all object keys recursively so lookups are case-insensitive.
fn lowercase_keys(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.into_iter()
                .map(|(k, v)| (k.to_lowercase(), lowercase_keys(v)))
                .collect(),
        ),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(lowercase_keys).collect())
        }
        other => other,
    }
}

fn clamp_priority(value: i32, default: i32, name: &str) -> i32 {
    if !(0..=MAX_ALERT_PRIORITY).contains(&value) {
        warn!(value, default, "{name} out of range, using default");

        return default;
    }

    value
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await.map_err(|err| {
            Error::Failed(format!("can't read config {}: {err}", path.display()))
        })?;

        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let mut config: Config = serde_json::from_value(lowercase_keys(value))?;

        if config.working_dir.as_os_str().is_empty() {
            return Err(Error::InvalidArgument("workingDir is required".into()));
        }

        config.apply_defaults();

        Ok(config)
    }

    fn apply_defaults(&mut self) {
        let wd = self.working_dir.clone();
        let default_path = |current: &mut PathBuf, name: &str| {
            if current.as_os_str().is_empty() {
                *current = wd.join(name);
            }
        };

        default_path(&mut self.node_config_file, "aos_node.cfg");
        default_path(&mut self.services_dir, "services");
        default_path(&mut self.layers_dir, "layers");
        default_path(&mut self.download_dir, "downloads");
        default_path(&mut self.launcher.storage_dir, "storages");
        default_path(&mut self.launcher.state_dir, "states");
        default_path(&mut self.migration.merged_migration_path, "mergedMigration");

        self.journal_alerts.service_alert_priority = clamp_priority(
            self.journal_alerts.service_alert_priority,
            DEFAULT_SERVICE_ALERT_PRIORITY,
            "serviceAlertPriority",
        );
        self.journal_alerts.system_alert_priority = clamp_priority(
            self.journal_alerts.system_alert_priority,
            DEFAULT_SYSTEM_ALERT_PRIORITY,
            "systemAlertPriority",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        Config::parse(r#"{"workingDir": "/var/aos/sm"}"#).unwrap()
    }

    #[test]
    fn defaults_applied() {
        let config = minimal();

        assert_eq!(config.services_dir, PathBuf::from("/var/aos/sm/services"));
        assert_eq!(config.layers_dir, PathBuf::from("/var/aos/sm/layers"));
        assert_eq!(config.download_dir, PathBuf::from("/var/aos/sm/downloads"));
        assert_eq!(
            config.node_config_file,
            PathBuf::from("/var/aos/sm/aos_node.cfg")
        );
        assert_eq!(config.cert_storage, PathBuf::from("/var/aos/crypt/sm/"));
        assert_eq!(config.service_ttl, Duration::from_secs(30 * 24 * 3600));
        assert_eq!(
            config.sm_client.cm_reconnect_timeout,
            Duration::from_secs(10)
        );
        assert_eq!(config.monitoring.poll_period, Duration::from_secs(35));
        assert_eq!(config.logging.max_part_count, 80);
        assert_eq!(config.journal_alerts.service_alert_priority, 4);
        assert_eq!(config.journal_alerts.system_alert_priority, 3);
    }

    #[test]
    fn case_insensitive_keys() {
        let config = Config::parse(
            r#"{"WORKINGDIR": "/wd", "ServiceTTL": "10m", "SMClient": {"CMServerURL": "cm:8089"}}"#,
        )
        .unwrap();

        assert_eq!(config.working_dir, PathBuf::from("/wd"));
        assert_eq!(config.service_ttl, Duration::from_secs(600));
        assert_eq!(config.sm_client.cm_server_url, "cm:8089");
    }

    #[test]
    fn missing_working_dir_fails() {
        assert!(Config::parse("{}").is_err());
        assert!(Config::parse(r#"{"workingDir": ""}"#).is_err());
    }

    #[test]
    fn alert_priority_clamped_to_default() {
        for (input, expected) in [(8, 4), (-1, 4), (0, 0), (7, 7)] {
            let config = Config::parse(&format!(
                r#"{{"workingDir": "/wd", "journalAlerts": {{"serviceAlertPriority": {input}}}}}"#
            ))
            .unwrap();

            assert_eq!(config.journal_alerts.service_alert_priority, expected);
        }

        let config = Config::parse(
            r#"{"workingDir": "/wd", "journalAlerts": {"systemAlertPriority": 9}}"#,
        )
        .unwrap();

        assert_eq!(config.journal_alerts.system_alert_priority, 3);
    }

    #[test]
    fn duration_strings() {
        let config = Config::parse(
            r#"{"workingDir": "/wd", "serviceTTL": "30d", "layerTTL": "12h",
                "monitoring": {"pollPeriod": "35s", "averageWindow": "2m"}}"#,
        )
        .unwrap();

        assert_eq!(config.service_ttl, Duration::from_secs(30 * 24 * 3600));
        assert_eq!(config.layer_ttl, Duration::from_secs(12 * 3600));
        assert_eq!(config.monitoring.average_window, Duration::from_secs(120));
    }

    #[test]
    fn round_trip() {
        let config = Config::parse(
            r#"{"workingDir": "/wd", "servicesPartLimit": 30, "layersPartLimit": 40,
                "serviceTTL": "10m",
                "launcher": {"hostBinds": ["bin", "lib"], "hosts": [{"ip": "10.0.0.1", "hostname": "cm"}]},
                "smclient": {"cmServerURL": "cm:8089", "cmReconnectTimeout": "15s"}}"#,
        )
        .unwrap();

        let serialized = serde_json::to_string(&config).unwrap();
        let reparsed = Config::parse(&serialized).unwrap();

        assert_eq!(config, reparsed);
    }
}
