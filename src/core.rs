//! Composition root: wires every component with its production adapters
//! and owns the shutdown sequence.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::allocator::SpaceAllocator;
use crate::config::Config;
use crate::downloader::HttpDownloader;
use crate::error::{Error, Result};
use crate::journal::JournalCtl;
use crate::journalalerts::{JournalAlerts, JOURNAL_POLL_PERIOD};
use crate::launcher::{Launcher, LauncherConfig};
use crate::layermanager::{LayerItemRemover, LayerManager, LayerManagerConfig};
use crate::logprovider::LogProvider;
use crate::monitoring::{ResourceMonitor, SystemUsageProvider};
use crate::network::trafficmonitor::{IptablesCmd, TrafficMonitor};
use crate::network::{CniCmd, IpNetns, NetworkManager};
use crate::resourcemanager::{NodeConfig, ResourceManager};
use crate::runner::{Runner, STATUS_POLL_PERIOD};
use crate::servicemanager::{ServiceItemRemover, ServiceManager, ServiceManagerConfig};
use crate::smclient::{outbound_channel, SmClient};
use crate::storage::Store;
use crate::systemd::SystemctlConn;
use crate::types::Alert;

const SYSTEMD_DROP_INS_DIR: &str = "/run/systemd/system";
const CNI_PLUGIN_DIR: &str = "/opt/cni/bin";
const CNI_BRIDGE: &str = "aos0";

pub struct AosCore {
    service_manager: Arc<ServiceManager>,
    layer_manager: Arc<LayerManager>,
    traffic: Arc<TrafficMonitor>,
    runner: Arc<Runner>,
    monitor: Arc<ResourceMonitor>,
    launcher: Arc<Launcher>,
    journal_alerts: Arc<JournalAlerts>,
    sm_client: SmClient,
    shutdown: watch::Sender<bool>,
}

impl AosCore {
    /// Wires all collaborators and starts the background tasks. Failures
    /// here are initialisation failures (process exit code 1).
    pub async fn new(config: Config) -> Result<Self> {
        info!(working_dir = %config.working_dir.display(), "initializing SM core");

        tokio::fs::create_dir_all(&config.working_dir).await?;
        tokio::fs::create_dir_all(&config.services_dir).await?;
        tokio::fs::create_dir_all(&config.layers_dir).await?;
        tokio::fs::create_dir_all(&config.download_dir).await?;

        let store = Arc::new(Store::new(&config.working_dir).await?);

        let node_type = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();

        let (outbound, receivers) = outbound_channel();

        let (resource_manager, node_config_error) =
            match ResourceManager::new(&config.node_config_file, &node_type).await {
                Ok(manager) => (manager, None),
                Err(err @ Error::Validation(_)) => {
                    warn!(%err, "node config rejected, using empty profile");

                    (ResourceManager::from_config(NodeConfig::default()), Some(err))
                }
                Err(err) => return Err(err),
            };
        let resource_manager = Arc::new(resource_manager);

        if let Some(err) = &node_config_error {
            outbound
                .send_alert(Alert::ResourceValidate {
                    name: config.node_config_file.display().to_string(),
                    errors: vec![err.to_string()],
                })
                .await;
        }

        let downloader = Arc::new(HttpDownloader::new()?);

        let services_allocator = Arc::new(SpaceAllocator::with_part_limit(
            "services",
            &config.services_dir,
            config.services_part_limit,
            Arc::new(ServiceItemRemover::new(Arc::clone(&store))),
        )?);
        let layers_allocator = Arc::new(SpaceAllocator::with_part_limit(
            "layers",
            &config.layers_dir,
            config.layers_part_limit,
            Arc::new(LayerItemRemover::new(Arc::clone(&store))),
        )?);
        let download_allocator = Arc::new(SpaceAllocator::with_part_limit(
            "downloads",
            &config.download_dir,
            0,
            Arc::new(crate::allocator::NullRemover),
        )?);

        let service_manager = Arc::new(ServiceManager::new(
            ServiceManagerConfig {
                services_dir: config.services_dir.clone(),
                download_dir: config.download_dir.clone(),
                ttl: config.service_ttl,
                remove_outdated_period: config.remove_outdated_period,
            },
            Arc::clone(&store),
            downloader.clone(),
            services_allocator,
            Arc::clone(&download_allocator),
        ));
        service_manager.start().await?;

        let layer_manager = Arc::new(LayerManager::new(
            LayerManagerConfig {
                layers_dir: config.layers_dir.clone(),
                download_dir: config.download_dir.clone(),
                ttl: config.layer_ttl,
                remove_outdated_period: config.remove_outdated_period,
            },
            Arc::clone(&store),
            downloader,
            layers_allocator,
            download_allocator,
        ));
        layer_manager.start().await?;

        let traffic = Arc::new(TrafficMonitor::new(
            Arc::clone(&store),
            Arc::new(IptablesCmd),
            config.monitoring.poll_period,
        ));
        traffic.start().await?;

        let network = Arc::new(NetworkManager::new(
            Arc::clone(&store),
            Arc::new(CniCmd::new(CNI_PLUGIN_DIR.into(), CNI_BRIDGE.to_string())),
            Arc::new(IpNetns),
            Arc::clone(&traffic),
            &config.working_dir,
        ));

        let (quota_tx, quota_rx) = mpsc::unbounded_channel();

        let monitor = Arc::new(ResourceMonitor::new(
            config.monitoring.poll_period,
            config.monitoring.average_window,
            Arc::new(SystemUsageProvider::new(vec![
                config.services_dir.clone(),
                config.layers_dir.clone(),
                config.launcher.storage_dir.clone(),
            ])),
            Arc::clone(&traffic),
            resource_manager.alert_rules().clone(),
            resource_manager.quotas().clone(),
            outbound.clone(),
            quota_tx,
        ));
        monitor.start();

        let (run_status_tx, run_status_rx) = mpsc::unbounded_channel();

        let runner = Runner::new(
            Arc::new(SystemctlConn),
            SYSTEMD_DROP_INS_DIR.into(),
            STATUS_POLL_PERIOD,
            run_status_tx,
        );
        runner.start();

        let launcher = Launcher::new(
            LauncherConfig {
                work_dir: config.working_dir.clone(),
                storage_dir: config.launcher.storage_dir.clone(),
                state_dir: config.launcher.state_dir.clone(),
                host_binds: config.launcher.host_binds.clone(),
                hosts: config.launcher.hosts.clone(),
            },
            Arc::clone(&store),
            Arc::clone(&service_manager),
            Arc::clone(&layer_manager),
            Arc::clone(&resource_manager),
            Arc::clone(&network),
            Arc::clone(&runner),
            Arc::clone(&monitor),
            outbound.clone(),
        );
        launcher.start(run_status_rx, quota_rx);

        let journal = Arc::new(JournalCtl);

        let log_provider = Arc::new(LogProvider::start(
            config.logging.clone(),
            Arc::clone(&store),
            journal.clone(),
            outbound.clone(),
        ));

        let journal_alerts = Arc::new(JournalAlerts::new(
            config.journal_alerts.clone(),
            Arc::clone(&store),
            journal,
            outbound.clone(),
            JOURNAL_POLL_PERIOD,
        ));
        journal_alerts.start().await?;

        let sm_client = SmClient::new(
            config.sm_client.clone(),
            Arc::clone(&launcher),
            network,
            log_provider,
            Arc::clone(&monitor),
            resource_manager.version().to_string(),
            outbound,
            receivers,
        );

        Ok(Self {
            service_manager,
            layer_manager,
            traffic,
            runner,
            monitor,
            launcher,
            journal_alerts,
            sm_client,
            shutdown: watch::channel(false).0,
        })
    }

    /// Serves the CM connection until shutdown is requested.
    pub async fn run(&self) {
        self.sm_client.run(self.shutdown.subscribe()).await;
    }

    /// Stops components in reverse start order.
    pub async fn shutdown(&self) {
        info!("shutting down SM core");

        let _ = self.shutdown.send(true);

        if let Err(err) = self.journal_alerts.stop().await {
            error!(%err, "journal alerts stop failed");
        }

        self.launcher.stop();
        self.runner.stop();
        self.monitor.stop();

        if let Err(err) = self.traffic.stop().await {
            error!(%err, "traffic monitor stop failed");
        }

        self.layer_manager.stop();
        self.service_manager.stop();
    }
}

/// Default config file location when none is given on the command line.
pub fn default_config_file() -> &'static Path {
    Path::new("/etc/aos/aos_servicemanager.cfg")
}
