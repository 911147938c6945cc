//! Periodic resource sampling and quota alerting.
//!
//! Every poll period the monitor samples node CPU/RAM/disk and per-instance
//! usage, applies a moving average over the configured window and runs the
//! quota state machine: `no-alert → raise` on crossing the high threshold,
//! `raise → continue` while it stays high, `→ fall` on the first sample
//! back under the hysteresis threshold. Raw samples are forwarded to the
//! CM; quota breaches additionally feed the launcher restart policy.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error};

use crate::error::Result;
use crate::network::trafficmonitor::TrafficMonitor;
use crate::resourcemanager::{AlertRule, AlertRules, QuotaConfig};
use crate::smclient::Outbound;
use crate::types::{
    Alert, AlertStatus, InstanceIdent, MonitoringData, NodeMonitoringData, PartitionUsage,
};

/// Raw usage source. The production provider reads sysinfo and cgroups;
/// tests inject samples.
#[async_trait]
pub trait ResourceUsageProvider: Send + Sync {
    async fn node_usage(&self) -> Result<MonitoringData>;
    async fn instance_usage(&self, instance_id: &str) -> Result<MonitoringData>;
}

/// sysinfo + cgroup v2 backed usage provider.
pub struct SystemUsageProvider {
    partitions: Vec<PathBuf>,
    system: std::sync::Mutex<sysinfo::System>,
}

impl SystemUsageProvider {
    pub fn new(partitions: Vec<PathBuf>) -> Self {
        Self {
            partitions,
            system: std::sync::Mutex::new(sysinfo::System::new()),
        }
    }

    fn partition_usage(path: &PathBuf) -> Option<PartitionUsage> {
        let stat = nix::sys::statvfs::statvfs(path).ok()?;
        let used =
            (stat.blocks() as u64 - stat.blocks_available() as u64) * stat.fragment_size() as u64;

        Some(PartitionUsage {
            name: path.display().to_string(),
            used_size: used,
        })
    }
}

#[async_trait]
impl ResourceUsageProvider for SystemUsageProvider {
    async fn node_usage(&self) -> Result<MonitoringData> {
        let (cpu, ram) = {
            let mut system = self.system.lock().unwrap();

            system.refresh_cpu_usage();
            system.refresh_memory();

            (system.global_cpu_usage() as f64, system.used_memory())
        };

        let partitions = self
            .partitions
            .iter()
            .filter_map(Self::partition_usage)
            .collect();

        Ok(MonitoringData {
            cpu,
            ram,
            partitions,
            download: 0,
            upload: 0,
            timestamp: Some(Utc::now()),
        })
    }

    async fn instance_usage(&self, instance_id: &str) -> Result<MonitoringData> {
        let cgroup = PathBuf::from(format!(
            "/sys/fs/cgroup/system.slice/aos-service@{instance_id}.service"
        ));

        let ram = tokio::fs::read_to_string(cgroup.join("memory.current"))
            .await
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0);

        // usage_usec from cpu.stat; converted to percent by the average
        // window on the caller side is overkill here, report raw share.
        let cpu = tokio::fs::read_to_string(cgroup.join("cpu.stat"))
            .await
            .ok()
            .and_then(|s| {
                s.lines()
                    .find_map(|line| line.strip_prefix("usage_usec "))
                    .and_then(|v| v.trim().parse::<f64>().ok())
            })
            .unwrap_or(0.0);

        Ok(MonitoringData {
            cpu,
            ram,
            partitions: Vec::new(),
            download: 0,
            upload: 0,
            timestamp: Some(Utc::now()),
        })
    }
}

struct MovingAverage {
    window: usize,
    samples: VecDeque<f64>,
}

impl MovingAverage {
    fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            samples: VecDeque::new(),
        }
    }

    fn push(&mut self, value: f64) -> f64 {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }

        self.samples.push_back(value);

        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }
}

#[derive(Clone, Copy, PartialEq)]
enum QuotaState {
    Idle,
    Raised,
}

struct QuotaCheck {
    parameter: &'static str,
    high: f64,
    low: f64,
    average: MovingAverage,
    state: QuotaState,
}

impl QuotaCheck {
    fn new(parameter: &'static str, high: f64, low: f64, window: usize) -> Self {
        Self {
            parameter,
            high,
            low,
            average: MovingAverage::new(window),
            state: QuotaState::Idle,
        }
    }

    fn from_rule(parameter: &'static str, rule: &AlertRule, window: usize) -> Self {
        Self::new(parameter, rule.max_threshold, rule.min_threshold, window)
    }

    /// Feeds one sample; returns the transition to report, if any.
    fn process(&mut self, value: f64) -> Option<(AlertStatus, u64)> {
        let avg = self.average.push(value);

        match self.state {
            QuotaState::Idle if avg >= self.high => {
                self.state = QuotaState::Raised;

                Some((AlertStatus::Raise, avg as u64))
            }
            QuotaState::Raised if avg < self.low => {
                self.state = QuotaState::Idle;

                Some((AlertStatus::Fall, avg as u64))
            }
            QuotaState::Raised => Some((AlertStatus::Continue, avg as u64)),
            QuotaState::Idle => None,
        }
    }
}

struct InstanceMonitor {
    ident: InstanceIdent,
    checks: Vec<QuotaCheck>,
}

/// Quota breach notification consumed by the launcher.
#[derive(Debug, Clone)]
pub struct QuotaEvent {
    pub ident: InstanceIdent,
    pub parameter: String,
    pub status: AlertStatus,
}

pub struct ResourceMonitor {
    poll_period: Duration,
    window: usize,
    provider: Arc<dyn ResourceUsageProvider>,
    traffic: Arc<TrafficMonitor>,
    quotas: QuotaConfig,
    outbound: Outbound,
    quota_tx: mpsc::UnboundedSender<QuotaEvent>,
    node_checks: Mutex<Vec<QuotaCheck>>,
    instances: Mutex<HashMap<String, InstanceMonitor>>,
    shutdown: watch::Sender<bool>,
}

impl ResourceMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        poll_period: Duration,
        average_window: Duration,
        provider: Arc<dyn ResourceUsageProvider>,
        traffic: Arc<TrafficMonitor>,
        alert_rules: AlertRules,
        quotas: QuotaConfig,
        outbound: Outbound,
        quota_tx: mpsc::UnboundedSender<QuotaEvent>,
    ) -> Self {
        let window =
            (average_window.as_secs() / poll_period.as_secs().max(1)).max(1) as usize;

        let mut node_checks = Vec::new();

        for (parameter, rule) in [
            ("cpu", &alert_rules.cpu),
            ("ram", &alert_rules.ram),
            ("download", &alert_rules.download),
            ("upload", &alert_rules.upload),
        ] {
            if let Some(rule) = rule {
                node_checks.push(QuotaCheck::from_rule(parameter, rule, window));
            }
        }

        Self {
            poll_period,
            window,
            provider,
            traffic,
            quotas,
            outbound,
            quota_tx,
            node_checks: Mutex::new(node_checks),
            instances: Mutex::new(HashMap::new()),
            shutdown: watch::channel(false).0,
        }
    }

    pub fn start(self: &Arc<Self>) {
        let monitor = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(monitor.poll_period);
            tick.tick().await;

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(err) = monitor.poll_once().await {
                            error!(%err, "monitoring poll failed");
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Registers a started instance for sampling. Instance quota checks use
    /// the node profile quota as the high threshold with a 90% hysteresis.
    pub async fn start_instance_monitoring(&self, ident: InstanceIdent) {
        let mut checks = Vec::new();

        if let Some(ram) = self.quotas.ram {
            checks.push(QuotaCheck::new(
                "ram",
                ram as f64,
                ram as f64 * 0.9,
                self.window,
            ));
        }

        if let Some(cpu) = self.quotas.cpu_percent {
            checks.push(QuotaCheck::new("cpu", cpu, cpu * 0.9, self.window));
        }

        self.instances.lock().await.insert(
            ident.instance_id(),
            InstanceMonitor { ident, checks },
        );
    }

    pub async fn stop_instance_monitoring(&self, ident: &InstanceIdent) {
        self.instances.lock().await.remove(&ident.instance_id());
    }

    /// Snapshot for a CM GetSystemNodeMonitoring request.
    pub async fn node_monitoring(&self) -> Result<NodeMonitoringData> {
        self.collect().await
    }

    async fn collect(&self) -> Result<NodeMonitoringData> {
        let mut node = self.provider.node_usage().await?;

        let (download, upload) = self.traffic.system_traffic().await;
        node.download = download;
        node.upload = upload;
        node.timestamp.get_or_insert_with(Utc::now);

        let mut instances = Vec::new();

        for (instance_id, monitor) in self.instances.lock().await.iter() {
            let mut usage = self.provider.instance_usage(instance_id).await?;

            let (download, upload) = self.traffic.instance_traffic(instance_id).await;
            usage.download = download;
            usage.upload = upload;
            usage.timestamp.get_or_insert_with(Utc::now);

            instances.push((monitor.ident.clone(), usage));
        }

        Ok(NodeMonitoringData { node, instances })
    }

    /// One sampling round: collect, run quota checks, forward the sample.
    pub async fn poll_once(&self) -> Result<()> {
        let data = self.collect().await?;

        {
            let mut checks = self.node_checks.lock().await;

            for check in checks.iter_mut() {
                let value = match check.parameter {
                    "cpu" => data.node.cpu,
                    "ram" => data.node.ram as f64,
                    "download" => data.node.download as f64,
                    "upload" => data.node.upload as f64,
                    _ => continue,
                };

                if let Some((status, value)) = check.process(value) {
                    debug!(parameter = check.parameter, status = status.as_str(), "system quota alert");

                    self.outbound
                        .send_alert(Alert::SystemQuota {
                            parameter: check.parameter.to_string(),
                            value,
                            status,
                        })
                        .await;
                }
            }
        }

        {
            let mut instances = self.instances.lock().await;

            for (_, monitor) in instances.iter_mut() {
                let Some((_, usage)) = data
                    .instances
                    .iter()
                    .find(|(ident, _)| *ident == monitor.ident)
                else {
                    continue;
                };

                for check in monitor.checks.iter_mut() {
                    let value = match check.parameter {
                        "cpu" => usage.cpu,
                        "ram" => usage.ram as f64,
                        _ => continue,
                    };

                    if let Some((status, value)) = check.process(value) {
                        self.outbound
                            .send_alert(Alert::InstanceQuota {
                                ident: monitor.ident.clone(),
                                parameter: check.parameter.to_string(),
                                value,
                                status,
                            })
                            .await;

                        let _ = self.quota_tx.send(QuotaEvent {
                            ident: monitor.ident.clone(),
                            parameter: check.parameter.to_string(),
                            status,
                        });
                    }
                }
            }
        }

        self.outbound.send_monitoring(data);

        Ok(())
    }
}
