//! End-to-end reconcile tests over in-memory collaborators.
//!
//! A full launcher stack is wired with a mock supervisor, CNI, netns and
//! iptables; the service archive is served from a local file. The tests
//! drive desired-state updates the way the CM does and observe the
//! upstream status batches.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;

use aos_sm::allocator::{ItemRemover, NullRemover, SpaceAllocator};
use aos_sm::config::Host;
use aos_sm::downloader::Downloader;
use aos_sm::error::{Error, Result};
use aos_sm::image;
use aos_sm::launcher::{Launcher, LauncherConfig};
use aos_sm::layermanager::{LayerManager, LayerManagerConfig};
use aos_sm::monitoring::{ResourceMonitor, ResourceUsageProvider};
use aos_sm::network::trafficmonitor::{Iptables, TrafficMonitor};
use aos_sm::network::{Cni, CniParams, NetnsManager, NetworkManager};
use aos_sm::resourcemanager::{NodeConfig, ResourceManager};
use aos_sm::runner::{Runner, SystemdConn, UnitState, UnitStatus};
use aos_sm::servicemanager::{ServiceManager, ServiceManagerConfig};
use aos_sm::smclient::{outbound_channel, OutboundReceivers, OutgoingMessage};
use aos_sm::storage::{ItemState, Store};
use aos_sm::types::{
    DesiredState, InstanceIdent, InstanceInfo, MonitoringData, NetworkParameters, RunParameters,
    ServiceInfo,
};

// === Mock collaborators ===

struct FileDownloader;

#[async_trait]
impl Downloader for FileDownloader {
    async fn download(&self, url: &str, dst: &Path) -> Result<()> {
        tokio::fs::copy(url, dst).await?;

        Ok(())
    }
}

#[derive(Default)]
struct MockSystemd {
    units: StdMutex<HashMap<String, UnitStatus>>,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
}

#[async_trait]
impl SystemdConn for MockSystemd {
    async fn start_unit(&self, name: &str, _mode: &str, _timeout: Duration) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);

        self.units.lock().unwrap().insert(
            name.to_string(),
            UnitStatus {
                name: name.to_string(),
                active_state: UnitState::Active,
                exit_code: None,
            },
        );

        Ok(())
    }

    async fn stop_unit(&self, name: &str, _mode: &str, _timeout: Duration) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);

        if self.units.lock().unwrap().remove(name).is_none() {
            return Err(Error::NotFound(name.to_string()));
        }

        Ok(())
    }

    async fn reset_failed_unit(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn list_units(&self) -> Result<Vec<UnitStatus>> {
        Ok(self.units.lock().unwrap().values().cloned().collect())
    }

    async fn get_unit_status(&self, name: &str) -> Result<UnitStatus> {
        self.units
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }
}

#[derive(Default)]
struct MockCni {
    attached: StdMutex<Vec<String>>,
}

#[async_trait]
impl Cni for MockCni {
    async fn add_network(&self, params: &CniParams) -> Result<()> {
        self.attached.lock().unwrap().push(params.instance_id.clone());

        Ok(())
    }

    async fn delete_network(&self, params: &CniParams) -> Result<()> {
        self.attached
            .lock()
            .unwrap()
            .retain(|id| id != &params.instance_id);

        Ok(())
    }
}

struct MockNetns;

#[async_trait]
impl NetnsManager for MockNetns {
    async fn create(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _name: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct MockIptables {
    chains: StdMutex<HashMap<String, u64>>,
}

#[async_trait]
impl Iptables for MockIptables {
    async fn create_chain(&self, chain: &str) -> Result<()> {
        self.chains.lock().unwrap().entry(chain.to_string()).or_insert(0);

        Ok(())
    }

    async fn delete_chain(&self, chain: &str) -> Result<()> {
        self.chains.lock().unwrap().remove(chain);

        Ok(())
    }

    async fn insert_jump(
        &self,
        _parent: &str,
        _chain: &str,
        _ip: Option<&str>,
        _incoming: bool,
    ) -> Result<()> {
        Ok(())
    }

    async fn remove_jump(
        &self,
        _parent: &str,
        _chain: &str,
        _ip: Option<&str>,
        _incoming: bool,
    ) -> Result<()> {
        Ok(())
    }

    async fn set_drop(&self, _chain: &str, _enabled: bool) -> Result<()> {
        Ok(())
    }

    async fn chain_bytes(&self, chain: &str) -> Result<u64> {
        Ok(*self.chains.lock().unwrap().get(chain).unwrap_or(&0))
    }

    async fn list_chains(&self) -> Result<Vec<String>> {
        Ok(self.chains.lock().unwrap().keys().cloned().collect())
    }
}

struct ZeroUsage;

#[async_trait]
impl ResourceUsageProvider for ZeroUsage {
    async fn node_usage(&self) -> Result<MonitoringData> {
        Ok(MonitoringData::default())
    }

    async fn instance_usage(&self, _instance_id: &str) -> Result<MonitoringData> {
        Ok(MonitoringData::default())
    }
}

struct NoopRemover;

#[async_trait]
impl ItemRemover for NoopRemover {
    async fn remove_item(&self, _id: &str) -> Result<()> {
        Ok(())
    }
}

// === Fixture ===

struct Harness {
    launcher: Arc<Launcher>,
    receivers: OutboundReceivers,
    systemd: Arc<MockSystemd>,
    cni: Arc<MockCni>,
    store: Arc<Store>,
    services_dir: PathBuf,
    _dir: tempfile::TempDir,
}

/// Builds a gzipped service archive with a manifest and an image config.
async fn make_service_archive(dir: &Path, name: &str) -> (PathBuf, String, u64) {
    let manifest = br#"{"schemaVersion": 2, "config": {"digest": "sha256:cfg", "size": 3}}"#;
    let config = br#"{"entrypoint": ["/usr/bin/service"], "env": ["MODE=edge"]}"#;
    let archive_path = dir.join(format!("{name}.tar.gz"));

    let file = std::fs::File::create(&archive_path).unwrap();
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for (file_name, content) in [
        ("manifest.json", manifest.as_slice()),
        ("config.json", config.as_slice()),
        ("rootfs/etc/version", name.as_bytes()),
    ] {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, file_name, content).unwrap();
    }

    builder.into_inner().unwrap().finish().unwrap();

    let sha256 = image::sha256_file(&archive_path).await.unwrap();
    let size = tokio::fs::metadata(&archive_path).await.unwrap().len();

    (archive_path, sha256, size)
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();

    let store = Arc::new(Store::new_in_memory().await.unwrap());
    let (outbound, receivers) = outbound_channel();

    let downloader = Arc::new(FileDownloader);

    let service_manager = Arc::new(ServiceManager::new(
        ServiceManagerConfig {
            services_dir: root.join("services"),
            download_dir: root.join("downloads"),
            ttl: Duration::from_secs(3600),
            remove_outdated_period: Duration::from_secs(3600),
        },
        Arc::clone(&store),
        downloader.clone(),
        Arc::new(SpaceAllocator::new("services", u64::MAX, Arc::new(NoopRemover))),
        Arc::new(SpaceAllocator::new("downloads", u64::MAX, Arc::new(NullRemover))),
    ));
    service_manager.start().await.unwrap();

    let layer_manager = Arc::new(LayerManager::new(
        LayerManagerConfig {
            layers_dir: root.join("layers"),
            download_dir: root.join("downloads"),
            ttl: Duration::from_secs(3600),
            remove_outdated_period: Duration::from_secs(3600),
        },
        Arc::clone(&store),
        downloader,
        Arc::new(SpaceAllocator::new("layers", u64::MAX, Arc::new(NoopRemover))),
        Arc::new(SpaceAllocator::new("downloads", u64::MAX, Arc::new(NullRemover))),
    ));
    layer_manager.start().await.unwrap();

    let traffic = Arc::new(TrafficMonitor::new(
        Arc::clone(&store),
        Arc::new(MockIptables::default()),
        Duration::from_secs(3600),
    ));
    traffic.start().await.unwrap();

    let cni = Arc::new(MockCni::default());

    let network = Arc::new(NetworkManager::new(
        Arc::clone(&store),
        cni.clone(),
        Arc::new(MockNetns),
        Arc::clone(&traffic),
        root,
    ));

    let (quota_tx, quota_rx) = tokio::sync::mpsc::unbounded_channel();

    let monitor = Arc::new(ResourceMonitor::new(
        Duration::from_secs(3600),
        Duration::from_secs(3600),
        Arc::new(ZeroUsage),
        traffic,
        Default::default(),
        Default::default(),
        outbound.clone(),
        quota_tx,
    ));

    let systemd = Arc::new(MockSystemd::default());
    let (run_status_tx, run_status_rx) = tokio::sync::mpsc::unbounded_channel();

    let runner = Runner::new(
        systemd.clone(),
        root.join("dropins"),
        Duration::from_millis(20),
        run_status_tx,
    );
    runner.start();

    let launcher = Launcher::new(
        LauncherConfig {
            work_dir: root.to_path_buf(),
            storage_dir: root.join("storages"),
            state_dir: root.join("states"),
            host_binds: vec!["bin".to_string(), "lib".to_string(), "usr".to_string()],
            hosts: vec![Host {
                ip: "10.0.0.100".to_string(),
                hostname: "cm".to_string(),
            }],
        },
        Arc::clone(&store),
        service_manager,
        layer_manager,
        Arc::new(ResourceManager::from_config(NodeConfig::default())),
        network,
        runner,
        monitor,
        outbound,
    );
    launcher.start(run_status_rx, quota_rx);

    Harness {
        launcher,
        receivers,
        systemd,
        cni,
        store,
        services_dir: root.join("services"),
        _dir: dir,
    }
}

fn desired_state(archive: &Path, sha256: &str, size: u64, version: &str) -> DesiredState {
    DesiredState {
        services: vec![ServiceInfo {
            service_id: "svc".to_string(),
            provider_id: "provider".to_string(),
            version: version.to_string(),
            gid: 0,
            url: archive.display().to_string(),
            sha256: sha256.to_string(),
            size,
        }],
        layers: vec![],
        instances: vec![InstanceInfo {
            ident: InstanceIdent::new("svc", "sub", 0),
            uid: 0,
            priority: 100,
            storage_path: String::new(),
            state_path: String::new(),
            network_parameters: NetworkParameters {
                network_id: "net0".to_string(),
                subnet: "10.0.0.0/24".to_string(),
                ..Default::default()
            },
            run_parameters: RunParameters {
                start_interval: Some(Duration::from_millis(50)),
                start_burst: Some(3),
                restart_interval: Some(Duration::from_millis(10)),
            },
            restart_policy: String::new(),
        }],
        force_restart: false,
    }
}

/// Waits for the next RunInstancesStatus batch.
async fn next_run_status(receivers: &mut OutboundReceivers) -> Vec<aos_sm::proto::InstanceStatus> {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), receivers.messages.recv())
            .await
            .expect("no status batch emitted")
            .expect("outbound closed");

        if let OutgoingMessage::RunInstancesStatus(statuses) = message {
            return statuses.iter().map(Into::into).collect();
        }
    }
}

// === Scenarios ===

#[tokio::test]
async fn cold_start_brings_instance_up() {
    if !nix::unistd::Uid::effective().is_root() {
        eprintln!("Skipping test: requires root privileges");
        return;
    }

    let mut harness = harness().await;
    let (archive, sha256, size) = make_service_archive(harness._dir.path(), "v1").await;

    harness
        .launcher
        .run_instances(desired_state(&archive, &sha256, size, "1.0"))
        .await;

    let statuses = next_run_status(&mut harness.receivers).await;

    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].run_state, "active");
    assert_eq!(statuses[0].service_version, "1.0");

    // Service installed content-addressed under the services dir.
    let service = harness
        .store
        .get_service("svc", "1.0")
        .await
        .unwrap()
        .unwrap();
    assert!(service.local_path.starts_with(harness.services_dir.to_str().unwrap()));
    assert!(Path::new(&service.local_path).join("manifest.json").exists());

    // First free address after the gateway.
    let lease = harness
        .store
        .get_network_lease("net0", "svc_sub_0")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lease.ip, "10.0.0.2");
    assert_eq!(*harness.cni.attached.lock().unwrap(), vec!["svc_sub_0".to_string()]);

    // Exactly one unit, named after the instance.
    let units = harness.systemd.units.lock().unwrap();
    assert!(units.contains_key("aos-service@svc_sub_0.service"));
    assert_eq!(units.len(), 1);
}

#[tokio::test]
async fn same_desired_state_is_a_no_op() {
    if !nix::unistd::Uid::effective().is_root() {
        eprintln!("Skipping test: requires root privileges");
        return;
    }

    let mut harness = harness().await;
    let (archive, sha256, size) = make_service_archive(harness._dir.path(), "v1").await;
    let desired = desired_state(&archive, &sha256, size, "1.0");

    harness.launcher.run_instances(desired.clone()).await;
    let first = next_run_status(&mut harness.receivers).await;

    let starts_after_first = harness.systemd.start_calls.load(Ordering::SeqCst);

    harness.launcher.run_instances(desired).await;
    let second = next_run_status(&mut harness.receivers).await;

    assert_eq!(harness.systemd.start_calls.load(Ordering::SeqCst), starts_after_first);
    assert_eq!(harness.systemd.stop_calls.load(Ordering::SeqCst), 0);

    assert_eq!(first.len(), second.len());
    assert_eq!(second[0].run_state, "active");
}

#[tokio::test]
async fn rolling_update_replaces_version() {
    if !nix::unistd::Uid::effective().is_root() {
        eprintln!("Skipping test: requires root privileges");
        return;
    }

    let mut harness = harness().await;
    let (archive_v1, sha_v1, size_v1) = make_service_archive(harness._dir.path(), "v1").await;
    let (archive_v2, sha_v2, size_v2) = make_service_archive(harness._dir.path(), "v2").await;

    harness
        .launcher
        .run_instances(desired_state(&archive_v1, &sha_v1, size_v1, "1.0"))
        .await;
    next_run_status(&mut harness.receivers).await;

    harness
        .launcher
        .run_instances(desired_state(&archive_v2, &sha_v2, size_v2, "2.0"))
        .await;
    let statuses = next_run_status(&mut harness.receivers).await;

    assert_eq!(statuses[0].service_version, "2.0");
    assert_eq!(statuses[0].run_state, "active");

    assert!(harness.systemd.stop_calls.load(Ordering::SeqCst) >= 1);

    // The old revision is retained as cached, evictable after its TTL.
    let old = harness
        .store
        .get_service("svc", "1.0")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(old.state, ItemState::Cached);

    let new = harness
        .store
        .get_service("svc", "2.0")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(new.state, ItemState::Active);
}

#[tokio::test]
async fn empty_desired_state_stops_and_removes() {
    if !nix::unistd::Uid::effective().is_root() {
        eprintln!("Skipping test: requires root privileges");
        return;
    }

    let mut harness = harness().await;
    let (archive, sha256, size) = make_service_archive(harness._dir.path(), "v1").await;

    harness
        .launcher
        .run_instances(desired_state(&archive, &sha256, size, "1.0"))
        .await;
    next_run_status(&mut harness.receivers).await;

    harness.launcher.run_instances(DesiredState::default()).await;
    let statuses = next_run_status(&mut harness.receivers).await;

    assert!(statuses.is_empty());
    assert!(harness.launcher.running_instances().await.is_empty());
    assert!(harness.store.get_all_instances().await.unwrap().is_empty());
    assert!(harness.systemd.units.lock().unwrap().is_empty());
    assert!(harness.cni.attached.lock().unwrap().is_empty());
}

#[tokio::test]
async fn install_failure_reports_failed_instance() {
    let mut harness = harness().await;
    let (archive, _sha256, size) = make_service_archive(harness._dir.path(), "v1").await;

    // Wrong digest: install must fail validation and the instance reports
    // failed without aborting the batch.
    harness
        .launcher
        .run_instances(desired_state(&archive, "deadbeef", size, "1.0"))
        .await;

    let statuses = next_run_status(&mut harness.receivers).await;

    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].run_state, "failed");

    let error = statuses[0].error_info.as_ref().unwrap();
    assert!(!error.message.is_empty());

    assert!(harness.systemd.units.lock().unwrap().is_empty());
}
