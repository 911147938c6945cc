//! Per-instance networking: namespace lifecycle, IP allocation, CNI
//! attachment, DNS files and traffic accounting.

pub mod trafficmonitor;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::storage::{NetworkLease, Store};
use crate::types::NetworkParameters;

use trafficmonitor::TrafficMonitor;

const NETNS_PREFIX: &str = "aos-";
const DEFAULT_SUBNET: &str = "10.0.0.0/24";

/// Namespace path used in the OCI spec network namespace entry.
pub fn netns_path(instance_id: &str) -> String {
    format!("/run/netns/{NETNS_PREFIX}{instance_id}")
}

fn netns_name(instance_id: &str) -> String {
    format!("{NETNS_PREFIX}{instance_id}")
}

/// Parameters handed to the CNI plugin runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CniParams {
    pub network_id: String,
    pub instance_id: String,
    pub netns_path: String,
    pub ip: String,
    pub subnet: String,
    pub vlan_id: u64,
    pub dns_servers: Vec<String>,
    pub firewall_rules: Vec<crate::types::FirewallRule>,
}

/// Container network plugin runner interface.
#[async_trait]
pub trait Cni: Send + Sync {
    async fn add_network(&self, params: &CniParams) -> Result<()>;
    async fn delete_network(&self, params: &CniParams) -> Result<()>;
}

/// Network namespace lifecycle interface.
#[async_trait]
pub trait NetnsManager: Send + Sync {
    async fn create(&self, name: &str) -> Result<()>;
    async fn delete(&self, name: &str) -> Result<()>;
}

/// Production CNI adapter invoking the bridge plugin with a host-local
/// IPAM config derived from the lease.
pub struct CniCmd {
    plugin_dir: PathBuf,
    bridge: String,
}

impl CniCmd {
    pub fn new(plugin_dir: PathBuf, bridge: String) -> Self {
        Self { plugin_dir, bridge }
    }

    async fn invoke(&self, command: &str, params: &CniParams) -> Result<()> {
        let netconf = serde_json::json!({
            "cniVersion": "0.4.0",
            "name": params.network_id,
            "type": "bridge",
            "bridge": self.bridge,
            "isGateway": true,
            "ipMasq": true,
            "ipam": {
                "type": "host-local",
                "subnet": params.subnet,
                "rangeStart": params.ip,
                "rangeEnd": params.ip,
            },
        });

        let mut child = Command::new(self.plugin_dir.join("bridge"))
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", &params.instance_id)
            .env("CNI_NETNS", &params.netns_path)
            .env("CNI_IFNAME", "eth0")
            .env("CNI_PATH", &self.plugin_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()?;

        if let Some(stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;

            let mut stdin = stdin;
            stdin.write_all(netconf.to_string().as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;

        if !output.status.success() {
            return Err(Error::Failed(format!(
                "cni {command} for {}: {}",
                params.instance_id,
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl Cni for CniCmd {
    async fn add_network(&self, params: &CniParams) -> Result<()> {
        self.invoke("ADD", params).await
    }

    async fn delete_network(&self, params: &CniParams) -> Result<()> {
        self.invoke("DEL", params).await
    }
}

/// Production namespace manager shelling out to `ip netns`.
pub struct IpNetns;

#[async_trait]
impl NetnsManager for IpNetns {
    async fn create(&self, name: &str) -> Result<()> {
        let output = Command::new("ip")
            .args(["netns", "add", name])
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);

            // Already present from a previous run is fine.
            if !stderr.contains("File exists") {
                return Err(Error::Failed(format!("ip netns add {name}: {stderr}")));
            }
        }

        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let output = Command::new("ip")
            .args(["netns", "delete", name])
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);

            if !stderr.contains("No such file") {
                return Err(Error::Failed(format!("ip netns delete {name}: {stderr}")));
            }
        }

        Ok(())
    }
}

pub struct NetworkManager {
    store: Arc<Store>,
    cni: Arc<dyn Cni>,
    netns: Arc<dyn NetnsManager>,
    traffic: Arc<TrafficMonitor>,
    network_dir: PathBuf,
    // network_id -> provider subnet, updated by the CM
    networks: Mutex<HashMap<String, NetworkParameters>>,
}

impl NetworkManager {
    pub fn new(
        store: Arc<Store>,
        cni: Arc<dyn Cni>,
        netns: Arc<dyn NetnsManager>,
        traffic: Arc<TrafficMonitor>,
        working_dir: &std::path::Path,
    ) -> Self {
        Self {
            store,
            cni,
            netns,
            traffic,
            network_dir: working_dir.join("network"),
            networks: Mutex::new(HashMap::new()),
        }
    }

    /// Applies provider network definitions pushed by the CM.
    pub async fn update_networks(&self, networks: Vec<NetworkParameters>) {
        let mut map = self.networks.lock().await;

        map.clear();

        for network in networks {
            map.insert(network.network_id.clone(), network);
        }
    }

    /// Attaches an instance: allocates an IP, creates the namespace,
    /// delegates interface setup to CNI and starts traffic accounting.
    /// Re-attaching an instance with a live lease yields the same IP.
    pub async fn add_instance(
        &self,
        instance_id: &str,
        params: &NetworkParameters,
    ) -> Result<NetworkLease> {
        if params.network_id.is_empty() {
            return Err(Error::InvalidArgument("instance has no network id".into()));
        }

        let lease = match self
            .store
            .get_network_lease(&params.network_id, instance_id)
            .await?
        {
            Some(existing) => existing,
            None => {
                let ip = self.allocate_ip(&params.network_id, params).await?;

                let lease = NetworkLease {
                    network_id: params.network_id.clone(),
                    instance_id: instance_id.to_string(),
                    ip: ip.to_string(),
                    vlan_id: params.vlan_id,
                    parameters: params.clone(),
                };

                self.store.add_network_lease(&lease).await?;

                lease
            }
        };

        info!(instance_id, network_id = %lease.network_id, ip = %lease.ip, "attaching instance network");

        self.netns.create(&netns_name(instance_id)).await?;

        let cni_params = self.cni_params(&lease);

        if let Err(err) = self.cni.add_network(&cni_params).await {
            self.netns.delete(&netns_name(instance_id)).await.ok();

            return Err(err);
        }

        self.write_dns_config(&lease).await?;

        self.traffic
            .start_instance_monitoring(
                instance_id,
                &lease.ip,
                lease.parameters.download_limit,
                lease.parameters.upload_limit,
            )
            .await?;

        Ok(lease)
    }

    /// Detaches an instance. Idempotent: missing leases, namespaces and
    /// chains are ignored.
    pub async fn remove_instance(&self, instance_id: &str, network_id: &str) -> Result<()> {
        debug!(instance_id, network_id, "detaching instance network");

        if let Err(err) = self.traffic.stop_instance_monitoring(instance_id).await {
            warn!(instance_id, %err, "traffic monitor detach failed");
        }

        if let Some(lease) = self.store.get_network_lease(network_id, instance_id).await? {
            let cni_params = self.cni_params(&lease);

            if let Err(err) = self.cni.delete_network(&cni_params).await {
                warn!(instance_id, %err, "cni delete failed");
            }

            self.store
                .remove_network_lease(network_id, instance_id)
                .await?;
        }

        self.netns.delete(&netns_name(instance_id)).await?;

        tokio::fs::remove_dir_all(self.network_dir.join(instance_id))
            .await
            .ok();

        Ok(())
    }

    pub async fn get_instance_ip(&self, instance_id: &str, network_id: &str) -> Result<String> {
        self.store
            .get_network_lease(network_id, instance_id)
            .await?
            .map(|lease| lease.ip)
            .ok_or_else(|| Error::NotFound(format!("lease for {instance_id}")))
    }

    /// Picks the first free host address in the network subnet, skipping the
    /// gateway.
    async fn allocate_ip(
        &self,
        network_id: &str,
        params: &NetworkParameters,
    ) -> Result<std::net::Ipv4Addr> {
        let subnet = self.resolve_subnet(network_id, params).await?;

        let used: std::collections::HashSet<String> = self
            .store
            .get_network_leases(network_id)
            .await?
            .into_iter()
            .map(|lease| lease.ip)
            .collect();

        let mut hosts = subnet.hosts();

        // First host is the gateway.
        let _gateway = hosts.next();

        hosts
            .find(|ip| !used.contains(&ip.to_string()))
            .ok_or_else(|| Error::Failed(format!("subnet {subnet} exhausted")))
    }

    async fn resolve_subnet(&self, network_id: &str, params: &NetworkParameters) -> Result<Ipv4Net> {
        let subnet = if !params.subnet.is_empty() {
            params.subnet.clone()
        } else if let Some(network) = self.networks.lock().await.get(network_id) {
            network.subnet.clone()
        } else {
            DEFAULT_SUBNET.to_string()
        };

        subnet
            .parse()
            .map_err(|err| Error::InvalidArgument(format!("bad subnet {subnet}: {err}")))
    }

    fn cni_params(&self, lease: &NetworkLease) -> CniParams {
        CniParams {
            network_id: lease.network_id.clone(),
            instance_id: lease.instance_id.clone(),
            netns_path: netns_path(&lease.instance_id),
            ip: lease.ip.clone(),
            subnet: lease.parameters.subnet.clone(),
            vlan_id: lease.vlan_id,
            dns_servers: lease.parameters.dns_servers.clone(),
            firewall_rules: lease.parameters.firewall_rules.clone(),
        }
    }

    async fn write_dns_config(&self, lease: &NetworkLease) -> Result<()> {
        let dir = self.network_dir.join(&lease.instance_id);

        tokio::fs::create_dir_all(&dir).await?;

        let mut resolv = String::new();

        for server in &lease.parameters.dns_servers {
            resolv.push_str(&format!("nameserver {server}\n"));
        }

        if resolv.is_empty() {
            resolv.push_str("nameserver 8.8.8.8\n");
        }

        tokio::fs::write(dir.join("resolv.conf"), resolv).await?;

        Ok(())
    }
}
