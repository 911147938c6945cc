//! Instance and system traffic accounting over iptables counters.
//!
//! Each monitored scope owns a pair of chains (in/out). Counters are
//! sampled periodically, accumulated into per-billing-period totals and
//! persisted, so the totals survive both SM restarts and iptables reloads
//! (a sampled value below the last read means the kernel counter was
//! reset, and the raw value is the delta).

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::storage::Store;

pub const SYSTEM_IN_CHAIN: &str = "AOS_SYSTEM_IN";
pub const SYSTEM_OUT_CHAIN: &str = "AOS_SYSTEM_OUT";
const CHAIN_PREFIX: &str = "AOS_";

/// iptables operations used by the traffic monitor. The monitor is the only
/// writer of the `AOS_*` chains.
#[async_trait]
pub trait Iptables: Send + Sync {
    async fn create_chain(&self, chain: &str) -> Result<()>;
    async fn delete_chain(&self, chain: &str) -> Result<()>;
    /// Inserts a jump from `parent` into `chain`, optionally filtered by
    /// address (`incoming` selects destination vs source match).
    async fn insert_jump(
        &self,
        parent: &str,
        chain: &str,
        ip: Option<&str>,
        incoming: bool,
    ) -> Result<()>;
    async fn remove_jump(
        &self,
        parent: &str,
        chain: &str,
        ip: Option<&str>,
        incoming: bool,
    ) -> Result<()>;
    async fn set_drop(&self, chain: &str, enabled: bool) -> Result<()>;
    async fn chain_bytes(&self, chain: &str) -> Result<u64>;
    async fn list_chains(&self) -> Result<Vec<String>>;
}

/// Production implementation shelling out to the iptables binary.
pub struct IptablesCmd;

impl IptablesCmd {
    async fn run(args: &[&str]) -> Result<std::process::Output> {
        let output = tokio::process::Command::new("iptables")
            .args(args)
            .output()
            .await?;

        Ok(output)
    }

    fn match_args<'a>(ip: Option<&'a str>, incoming: bool) -> Vec<&'a str> {
        match ip {
            Some(ip) if incoming => vec!["-d", ip],
            Some(ip) => vec!["-s", ip],
            None => vec![],
        }
    }
}

#[async_trait]
impl Iptables for IptablesCmd {
    async fn create_chain(&self, chain: &str) -> Result<()> {
        Self::run(&["-N", chain]).await?;

        Ok(())
    }

    async fn delete_chain(&self, chain: &str) -> Result<()> {
        Self::run(&["-F", chain]).await?;
        Self::run(&["-X", chain]).await?;

        Ok(())
    }

    async fn insert_jump(
        &self,
        parent: &str,
        chain: &str,
        ip: Option<&str>,
        incoming: bool,
    ) -> Result<()> {
        let mut args = vec!["-I", parent];
        args.extend(Self::match_args(ip, incoming));
        args.extend(["-j", chain]);

        Self::run(&args).await?;

        Ok(())
    }

    async fn remove_jump(
        &self,
        parent: &str,
        chain: &str,
        ip: Option<&str>,
        incoming: bool,
    ) -> Result<()> {
        let mut args = vec!["-D", parent];
        args.extend(Self::match_args(ip, incoming));
        args.extend(["-j", chain]);

        Self::run(&args).await?;

        Ok(())
    }

    async fn set_drop(&self, chain: &str, enabled: bool) -> Result<()> {
        let op = if enabled { "-A" } else { "-D" };

        Self::run(&[op, chain, "-j", "DROP"]).await?;

        Ok(())
    }

    async fn chain_bytes(&self, chain: &str) -> Result<u64> {
        let output = Self::run(&["-nvx", "-L", chain]).await?;
        let text = String::from_utf8_lossy(&output.stdout);

        // Sum the byte column of all rules in the chain.
        let mut total = 0u64;

        for line in text.lines().skip(2) {
            if let Some(bytes) = line.split_whitespace().nth(1) {
                total += bytes.parse::<u64>().unwrap_or(0);
            }
        }

        Ok(total)
    }

    async fn list_chains(&self) -> Result<Vec<String>> {
        let output = Self::run(&["-S"]).await?;
        let text = String::from_utf8_lossy(&output.stdout);

        Ok(text
            .lines()
            .filter_map(|line| line.strip_prefix("-N "))
            .map(str::to_string)
            .collect())
    }
}

struct TrafficChain {
    parent: String,
    ip: Option<String>,
    incoming: bool,
    limit: u64,
    period: String,
    last_value: u64,
    total: u64,
    limited: bool,
}

pub struct TrafficMonitor {
    store: Arc<Store>,
    iptables: Arc<dyn Iptables>,
    update_period: Duration,
    chains: Mutex<HashMap<String, TrafficChain>>,
    shutdown: watch::Sender<bool>,
}

fn current_period() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

fn instance_chain_names(instance_id: &str) -> (String, String) {
    let mut hasher = DefaultHasher::new();
    instance_id.hash(&mut hasher);
    let base = format!("{:x}", hasher.finish());

    (
        format!("{CHAIN_PREFIX}{base}_IN"),
        format!("{CHAIN_PREFIX}{base}_OUT"),
    )
}

impl TrafficMonitor {
    pub fn new(store: Arc<Store>, iptables: Arc<dyn Iptables>, update_period: Duration) -> Self {
        Self {
            store,
            iptables,
            update_period,
            chains: Mutex::new(HashMap::new()),
            shutdown: watch::channel(false).0,
        }
    }

    /// Clears stale chains, installs the system chains and starts the
    /// sampling task.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        info!("starting traffic monitor");

        self.delete_all_chains().await;

        self.create_chain(SYSTEM_IN_CHAIN, "INPUT", None, true, 0)
            .await?;
        self.create_chain(SYSTEM_OUT_CHAIN, "OUTPUT", None, false, 0)
            .await?;

        let monitor = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(monitor.update_period);
            tick.tick().await;

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(err) = monitor.update_traffic().await {
                            error!(%err, "traffic update failed");
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });

        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let _ = self.shutdown.send(true);

        self.persist_all().await?;
        self.delete_all_chains().await;

        Ok(())
    }

    /// Installs counting chains for one instance. A no-op when already
    /// monitored or when the instance has no address.
    pub async fn start_instance_monitoring(
        &self,
        instance_id: &str,
        ip: &str,
        download_limit: u64,
        upload_limit: u64,
    ) -> Result<()> {
        if instance_id.is_empty() || ip.is_empty() {
            return Ok(());
        }

        let (in_chain, out_chain) = instance_chain_names(instance_id);

        {
            let chains = self.chains.lock().await;

            if chains.contains_key(&in_chain) {
                return Ok(());
            }
        }

        debug!(instance_id, ip, "starting instance traffic monitoring");

        self.create_chain(&in_chain, "FORWARD", Some(ip), true, download_limit)
            .await?;
        self.create_chain(&out_chain, "FORWARD", Some(ip), false, upload_limit)
            .await?;

        Ok(())
    }

    /// Removes the instance chains; persisted totals are kept.
    pub async fn stop_instance_monitoring(&self, instance_id: &str) -> Result<()> {
        let (in_chain, out_chain) = instance_chain_names(instance_id);

        for chain in [in_chain, out_chain] {
            let Some(data) = self.chains.lock().await.remove(&chain) else {
                continue;
            };

            self.store
                .set_traffic_value(&chain, &data.period, data.total)
                .await?;

            if let Err(err) = self
                .iptables
                .remove_jump(&data.parent, &chain, data.ip.as_deref(), data.incoming)
                .await
            {
                warn!(chain, %err, "jump removal failed");
            }

            if let Err(err) = self.iptables.delete_chain(&chain).await {
                warn!(chain, %err, "chain removal failed");
            }
        }

        Ok(())
    }

    /// Current period totals (in, out) for the node.
    pub async fn system_traffic(&self) -> (u64, u64) {
        let chains = self.chains.lock().await;

        (
            chains.get(SYSTEM_IN_CHAIN).map_or(0, |c| c.total),
            chains.get(SYSTEM_OUT_CHAIN).map_or(0, |c| c.total),
        )
    }

    /// Current period totals (in, out) for an instance.
    pub async fn instance_traffic(&self, instance_id: &str) -> (u64, u64) {
        let (in_chain, out_chain) = instance_chain_names(instance_id);
        let chains = self.chains.lock().await;

        (
            chains.get(&in_chain).map_or(0, |c| c.total),
            chains.get(&out_chain).map_or(0, |c| c.total),
        )
    }

    pub async fn update_traffic(&self) -> Result<()> {
        self.update_with_period(&current_period()).await
    }

    async fn update_with_period(&self, period: &str) -> Result<()> {
        let mut chains = self.chains.lock().await;

        for (name, data) in chains.iter_mut() {
            let value = self.iptables.chain_bytes(name).await?;

            // A lower reading means the kernel counters were reset by an
            // iptables reload.
            let delta = if value >= data.last_value {
                value - data.last_value
            } else {
                value
            };

            if data.period != period {
                data.period = period.to_string();
                data.total = 0;

                if data.limited {
                    data.limited = false;
                    self.iptables.set_drop(name, false).await.ok();
                }
            }

            data.total += delta;
            data.last_value = value;

            self.store
                .set_traffic_value(name, &data.period, data.total)
                .await?;

            if data.limit > 0 && data.total >= data.limit && !data.limited {
                warn!(chain = %name, total = data.total, limit = data.limit, "traffic limit reached");

                self.iptables.set_drop(name, true).await?;
                data.limited = true;
            }
        }

        Ok(())
    }

    async fn create_chain(
        &self,
        chain: &str,
        parent: &str,
        ip: Option<&str>,
        incoming: bool,
        limit: u64,
    ) -> Result<()> {
        self.iptables.create_chain(chain).await?;
        self.iptables.insert_jump(parent, chain, ip, incoming).await?;

        let period = current_period();
        let total = self
            .store
            .get_traffic_value(chain, &period)
            .await?
            .unwrap_or(0);

        self.chains.lock().await.insert(
            chain.to_string(),
            TrafficChain {
                parent: parent.to_string(),
                ip: ip.map(str::to_string),
                incoming,
                limit,
                period,
                last_value: 0,
                total,
                limited: false,
            },
        );

        Ok(())
    }

    async fn persist_all(&self) -> Result<()> {
        let chains = self.chains.lock().await;

        for (name, data) in chains.iter() {
            self.store
                .set_traffic_value(name, &data.period, data.total)
                .await?;
        }

        Ok(())
    }

    async fn delete_all_chains(&self) {
        let existing = match self.iptables.list_chains().await {
            Ok(chains) => chains,
            Err(err) => {
                warn!(%err, "can't list chains");

                return;
            }
        };

        for chain in existing {
            if chain.starts_with(CHAIN_PREFIX) {
                self.iptables.delete_chain(&chain).await.ok();
            }
        }

        self.chains.lock().await.clear();
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    pub struct MockIptables {
        pub bytes: StdMutex<HashMap<String, u64>>,
        pub dropped: StdMutex<Vec<String>>,
    }

    impl MockIptables {
        pub fn set_bytes(&self, chain: &str, value: u64) {
            self.bytes.lock().unwrap().insert(chain.to_string(), value);
        }
    }

    #[async_trait]
    impl Iptables for MockIptables {
        async fn create_chain(&self, chain: &str) -> Result<()> {
            self.bytes.lock().unwrap().entry(chain.to_string()).or_insert(0);

            Ok(())
        }

        async fn delete_chain(&self, chain: &str) -> Result<()> {
            self.bytes.lock().unwrap().remove(chain);

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

        async fn set_drop(&self, chain: &str, enabled: bool) -> Result<()> {
            let mut dropped = self.dropped.lock().unwrap();

            if enabled {
                dropped.push(chain.to_string());
            } else {
                dropped.retain(|c| c != chain);
            }

            Ok(())
        }

        async fn chain_bytes(&self, chain: &str) -> Result<u64> {
            Ok(*self.bytes.lock().unwrap().get(chain).unwrap_or(&0))
        }

        async fn list_chains(&self) -> Result<Vec<String>> {
            Ok(self.bytes.lock().unwrap().keys().cloned().collect())
        }
    }

    async fn monitor() -> (Arc<TrafficMonitor>, Arc<MockIptables>, Arc<Store>) {
        let store = Arc::new(Store::new_in_memory().await.unwrap());
        let iptables = Arc::new(MockIptables::default());
        let monitor = Arc::new(TrafficMonitor::new(
            Arc::clone(&store),
            iptables.clone(),
            Duration::from_secs(3600),
        ));

        monitor.start().await.unwrap();

        (monitor, iptables, store)
    }

    #[tokio::test]
    async fn accumulates_system_traffic() {
        let (monitor, iptables, _store) = monitor().await;

        iptables.set_bytes(SYSTEM_IN_CHAIN, 100);
        monitor.update_traffic().await.unwrap();

        iptables.set_bytes(SYSTEM_IN_CHAIN, 250);
        monitor.update_traffic().await.unwrap();

        assert_eq!(monitor.system_traffic().await.0, 250);
    }

    #[tokio::test]
    async fn survives_counter_reset() {
        let (monitor, iptables, _store) = monitor().await;

        iptables.set_bytes(SYSTEM_IN_CHAIN, 100);
        monitor.update_traffic().await.unwrap();

        // iptables reload: counter restarts from zero.
        iptables.set_bytes(SYSTEM_IN_CHAIN, 40);
        monitor.update_traffic().await.unwrap();

        assert_eq!(monitor.system_traffic().await.0, 140);
    }

    #[tokio::test]
    async fn period_rollover_resets_totals() {
        let (monitor, iptables, store) = monitor().await;

        iptables.set_bytes(SYSTEM_IN_CHAIN, 100);
        monitor.update_with_period("2026-08-01").await.unwrap();
        assert_eq!(monitor.system_traffic().await.0, 100);

        iptables.set_bytes(SYSTEM_IN_CHAIN, 150);
        monitor.update_with_period("2026-08-02").await.unwrap();

        assert_eq!(monitor.system_traffic().await.0, 50);
        assert_eq!(
            store
                .get_traffic_value(SYSTEM_IN_CHAIN, "2026-08-01")
                .await
                .unwrap(),
            Some(100)
        );
        assert_eq!(
            store
                .get_traffic_value(SYSTEM_IN_CHAIN, "2026-08-02")
                .await
                .unwrap(),
            Some(50)
        );
    }

    #[tokio::test]
    async fn instance_monitoring_and_limits() {
        let (monitor, iptables, _store) = monitor().await;

        monitor
            .start_instance_monitoring("svc_sub_0", "10.0.0.2", 100, 0)
            .await
            .unwrap();

        let (in_chain, _) = instance_chain_names("svc_sub_0");

        iptables.set_bytes(&in_chain, 150);
        monitor.update_traffic().await.unwrap();

        assert_eq!(monitor.instance_traffic("svc_sub_0").await.0, 150);
        assert_eq!(*iptables.dropped.lock().unwrap(), vec![in_chain.clone()]);

        monitor.stop_instance_monitoring("svc_sub_0").await.unwrap();
        assert_eq!(monitor.instance_traffic("svc_sub_0").await.0, 0);
    }

    #[tokio::test]
    async fn totals_restored_after_restart() {
        let store = Arc::new(Store::new_in_memory().await.unwrap());
        let period = current_period();

        store
            .set_traffic_value(SYSTEM_IN_CHAIN, &period, 500)
            .await
            .unwrap();

        let monitor = Arc::new(TrafficMonitor::new(
            Arc::clone(&store),
            Arc::new(MockIptables::default()),
            Duration::from_secs(3600),
        ));
        monitor.start().await.unwrap();

        assert_eq!(monitor.system_traffic().await.0, 500);
    }
}
