//! Desired-state reconciler and start/stop scheduler.
//!
//! The CM streams the full desired instance set; the launcher diffs it
//! against what is running, stops leavers, installs service and layer
//! images, and starts newcomers in priority order. Only one reconcile runs
//! at a time; a desired state arriving mid-reconcile replaces the pending
//! one and is applied as soon as the current pass drains.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch, Mutex, Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::Host;
use crate::error::{Error, Result};
use crate::image;
use crate::layermanager::LayerManager;
use crate::monitoring::{QuotaEvent, ResourceMonitor};
use crate::network::NetworkManager;
use crate::proto;
use crate::resourcemanager::ResourceManager;
use crate::runner::Runner;
use crate::runtime;
use crate::servicemanager::ServiceManager;
use crate::smclient::Outbound;
use crate::storage::{InstanceEntry, Store};
use crate::types::{
    AlertStatus, Alert, DesiredState, EnvVarOverrides, InstanceIdent, InstanceInfo,
    InstanceStatus, RunState, RunStatus, RESTART_POLICY_ON_QUOTA,
};

#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub work_dir: PathBuf,
    pub storage_dir: PathBuf,
    pub state_dir: PathBuf,
    pub host_binds: Vec<String>,
    pub hosts: Vec<Host>,
}

/// Book-keeping for one running instance.
#[derive(Debug, Clone)]
struct RunningInstance {
    info: InstanceInfo,
    version: String,
    digest: String,
    layer_digests: Vec<String>,
    env: Vec<String>,
}

/// Phase plan computed from the desired/running diff.
#[derive(Debug, Default, PartialEq)]
struct ReconcilePlan {
    to_stop: Vec<InstanceIdent>,
    to_restart: Vec<InstanceIdent>,
    to_start: Vec<InstanceIdent>,
}

pub struct Launcher {
    config: LauncherConfig,
    store: Arc<Store>,
    service_manager: Arc<ServiceManager>,
    layer_manager: Arc<LayerManager>,
    resource_manager: Arc<ResourceManager>,
    network: Arc<NetworkManager>,
    runner: Arc<Runner>,
    monitor: Arc<ResourceMonitor>,
    outbound: Outbound,
    running: Mutex<HashMap<InstanceIdent, RunningInstance>>,
    pending: Mutex<Option<DesiredState>>,
    pending_notify: Notify,
    workers: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

fn worker_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .max(4)
}

/// Orders start candidates: priority descending, then identity.
fn start_order(a: &InstanceInfo, b: &InstanceInfo) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.ident.cmp(&b.ident))
}

fn compute_plan(
    desired: &HashMap<InstanceIdent, (InstanceInfo, String)>,
    running: &HashMap<InstanceIdent, RunningInstance>,
    env: &HashMap<InstanceIdent, Vec<String>>,
    force_restart: bool,
) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();

    for ident in running.keys() {
        if !desired.contains_key(ident) {
            plan.to_stop.push(ident.clone());
        }
    }

    for (ident, (info, version)) in desired {
        match running.get(ident) {
            None => plan.to_start.push(ident.clone()),
            Some(current) => {
                let env_changed = env
                    .get(ident)
                    .is_some_and(|resolved| *resolved != current.env);

                if force_restart
                    || current.version != *version
                    || current.info.network_parameters != info.network_parameters
                    || env_changed
                {
                    plan.to_restart.push(ident.clone());
                }
            }
        }
    }

    plan.to_stop.sort();
    plan.to_restart.sort();
    plan.to_start.sort();

    plan
}

impl Launcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: LauncherConfig,
        store: Arc<Store>,
        service_manager: Arc<ServiceManager>,
        layer_manager: Arc<LayerManager>,
        resource_manager: Arc<ResourceManager>,
        network: Arc<NetworkManager>,
        runner: Arc<Runner>,
        monitor: Arc<ResourceMonitor>,
        outbound: Outbound,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            service_manager,
            layer_manager,
            resource_manager,
            network,
            runner,
            monitor,
            outbound,
            running: Mutex::new(HashMap::new()),
            pending: Mutex::new(None),
            pending_notify: Notify::new(),
            workers: Arc::new(Semaphore::new(worker_pool_size())),
            shutdown: watch::channel(false).0,
        })
    }

    /// Starts the reconcile loop plus the run-status and quota listeners.
    pub fn start(
        self: &Arc<Self>,
        mut run_status_rx: mpsc::UnboundedReceiver<Vec<RunStatus>>,
        mut quota_rx: mpsc::UnboundedReceiver<QuotaEvent>,
    ) {
        let launcher = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = launcher.pending_notify.notified() => {
                        while let Some(desired) = launcher.pending.lock().await.take() {
                            launcher.reconcile(desired).await;
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });

        let launcher = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(statuses) = run_status_rx.recv().await {
                launcher.handle_run_status(statuses).await;
            }
        });

        let launcher = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = quota_rx.recv().await {
                launcher.handle_quota_event(event).await;
            }
        });
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Accepts a new desired state. Coalesces with any pending one.
    pub async fn run_instances(&self, desired: DesiredState) {
        *self.pending.lock().await = Some(desired);
        self.pending_notify.notify_one();
    }

    /// Applies env var overrides and restarts the matched running
    /// instances.
    pub async fn override_env_vars(&self, overrides: EnvVarOverrides) -> Result<()> {
        info!(filters = overrides.len(), "overriding env vars");

        self.store.set_env_var_overrides(&overrides).await?;

        let matched: Vec<(InstanceIdent, RunningInstance)> = {
            let running = self.running.lock().await;

            running
                .iter()
                .filter(|(ident, _)| overrides.keys().any(|filter| filter.matches(ident)))
                .map(|(ident, rec)| (ident.clone(), rec.clone()))
                .collect()
        };

        let mut statuses = Vec::new();

        for (ident, rec) in matched {
            self.stop_one(&ident, false).await;

            let status = self.start_one(rec.info.clone(), rec.version.clone()).await;
            statuses.push(status);
        }

        if !statuses.is_empty() {
            self.outbound.send_update_instances_status(statuses).await;
        }

        Ok(())
    }

    /// Current statuses of all persisted instances.
    pub async fn instance_statuses(&self) -> Result<Vec<InstanceStatus>> {
        Ok(self
            .store
            .get_all_instances()
            .await?
            .into_iter()
            .map(|entry| InstanceStatus {
                ident: entry.ident,
                service_version: entry.service_version,
                run_state: entry.run_state,
                error: None,
            })
            .collect())
    }

    async fn reconcile(self: &Arc<Self>, desired: DesiredState) {
        info!(
            services = desired.services.len(),
            layers = desired.layers.len(),
            instances = desired.instances.len(),
            force_restart = desired.force_restart,
            "reconciling desired state"
        );

        // Target version per instance comes from the desired service list.
        let versions: HashMap<&str, &str> = desired
            .services
            .iter()
            .map(|s| (s.service_id.as_str(), s.version.as_str()))
            .collect();

        let mut desired_map = HashMap::new();

        for info in &desired.instances {
            let version = versions
                .get(info.ident.service_id.as_str())
                .copied()
                .unwrap_or_default()
                .to_string();

            desired_map.insert(info.ident.clone(), (info.clone(), version));
        }

        let mut env_map = HashMap::new();

        for ident in desired_map.keys() {
            env_map.insert(
                ident.clone(),
                self.resolve_env(ident).await.unwrap_or_default(),
            );
        }

        let plan = {
            let running = self.running.lock().await;

            compute_plan(&desired_map, &running, &env_map, desired.force_restart)
        };

        debug!(
            stop = plan.to_stop.len(),
            restart = plan.to_restart.len(),
            start = plan.to_start.len(),
            "reconcile plan"
        );

        self.persist_desired(&desired_map).await;

        // Stop phase.
        let mut stop_set = JoinSet::new();

        for ident in plan.to_stop.iter().chain(plan.to_restart.iter()).cloned() {
            let launcher = Arc::clone(self);
            let workers = Arc::clone(&self.workers);
            let remove = !desired_map.contains_key(&ident);

            stop_set.spawn(async move {
                let _permit = workers.acquire_owned().await;

                launcher.stop_one(&ident, remove).await
            });
        }

        let stopped: Vec<InstanceStatus> = stop_set
            .join_all()
            .await
            .into_iter()
            .flatten()
            .collect();

        if !stopped.is_empty() {
            self.outbound.send_update_instances_status(stopped).await;
        }

        // Install phase. Failures are recorded per item and reported on the
        // affected instances; the batch continues.
        let failed_services = match self
            .service_manager
            .process_desired_services(&desired.services)
            .await
        {
            Ok(failed) => failed,
            Err(err) => {
                error!(%err, "service install batch failed");

                HashMap::new()
            }
        };

        if let Err(err) = self.layer_manager.process_desired_layers(&desired.layers).await {
            error!(%err, "layer install batch failed");
        }

        // Start phase: priority groups in descending order, parallel within
        // a group.
        let mut to_start: Vec<&InstanceIdent> =
            plan.to_start.iter().chain(plan.to_restart.iter()).collect();

        to_start.sort_by(|a, b| start_order(&desired_map[*a].0, &desired_map[*b].0));

        let mut statuses: Vec<InstanceStatus> = Vec::new();
        let mut index = 0;

        while index < to_start.len() {
            let priority = desired_map[to_start[index]].0.priority;
            let mut group_set = JoinSet::new();

            while index < to_start.len() && desired_map[to_start[index]].0.priority == priority {
                let (info, version) = desired_map[to_start[index]].clone();
                index += 1;

                if let Some(err) = failed_services.get(&info.ident.service_id) {
                    statuses.push(InstanceStatus {
                        ident: info.ident.clone(),
                        service_version: version,
                        run_state: RunState::Failed,
                        error: Some(proto::ErrorInfo::from(err)),
                    });

                    continue;
                }

                let launcher = Arc::clone(self);
                let workers = Arc::clone(&self.workers);

                group_set.spawn(async move {
                    let _permit = workers.acquire_owned().await;

                    launcher.start_one(info, version).await
                });
            }

            statuses.extend(group_set.join_all().await);
        }

        // Instances that were already running and untouched keep reporting
        // their current state.
        {
            let running = self.running.lock().await;

            for (ident, rec) in running.iter() {
                if !statuses.iter().any(|s| s.ident == *ident) && desired_map.contains_key(ident) {
                    statuses.push(InstanceStatus {
                        ident: ident.clone(),
                        service_version: rec.version.clone(),
                        run_state: RunState::Active,
                        error: None,
                    });
                }
            }
        }

        statuses.sort_by(|a, b| a.ident.cmp(&b.ident));

        self.outbound.send_run_instances_status(statuses).await;
    }

    async fn persist_desired(&self, desired: &HashMap<InstanceIdent, (InstanceInfo, String)>) {
        let running = self.running.lock().await;

        for (ident, (info, version)) in desired {
            let run_state = if running.contains_key(ident) {
                RunState::Active
            } else {
                RunState::Stopped
            };

            let entry = InstanceEntry {
                ident: ident.clone(),
                uid: info.uid,
                priority: info.priority,
                storage_path: self.storage_path(info),
                state_path: self.state_path(info),
                network_parameters: info.network_parameters.clone(),
                run_state,
                exit_code: None,
                service_version: version.clone(),
            };

            if let Err(err) = self.store.add_instance(&entry).await {
                error!(ident = %ident, %err, "can't persist instance");
            }
        }
    }

    fn storage_path(&self, info: &InstanceInfo) -> String {
        if info.storage_path.is_empty() {
            self.config
                .storage_dir
                .join(info.ident.instance_id())
                .display()
                .to_string()
        } else {
            info.storage_path.clone()
        }
    }

    fn state_path(&self, info: &InstanceInfo) -> String {
        if info.state_path.is_empty() {
            self.config
                .state_dir
                .join(info.ident.instance_id())
                .display()
                .to_string()
        } else {
            info.state_path.clone()
        }
    }

    /// Stops one instance and releases everything it holds. Returns the
    /// stopped status, or None when the instance was not running.
    async fn stop_one(&self, ident: &InstanceIdent, remove: bool) -> Option<InstanceStatus> {
        let rec = self.running.lock().await.remove(ident)?;
        let instance_id = ident.instance_id();

        debug!(ident = %ident, "stopping instance");

        if let Err(err) = self.runner.stop_instance(&instance_id).await {
            warn!(ident = %ident, %err, "stop failed");
        }

        self.monitor.stop_instance_monitoring(ident).await;

        if !rec.info.network_parameters.network_id.is_empty() {
            if let Err(err) = self
                .network
                .remove_instance(&instance_id, &rec.info.network_parameters.network_id)
                .await
            {
                warn!(ident = %ident, %err, "network detach failed");
            }
        }

        self.resource_manager.release_devices(&instance_id).await;

        self.service_manager.release_service(&rec.digest).await;

        for digest in &rec.layer_digests {
            self.layer_manager.release_layer(digest).await;
        }

        let runtime_dir = self.config.work_dir.join("runtime");

        if let Err(err) = runtime::remove_bundle(&runtime_dir, &instance_id).await {
            warn!(ident = %ident, %err, "bundle removal failed");
        }

        if remove {
            if let Err(err) = self.store.remove_instance(ident).await {
                warn!(ident = %ident, %err, "instance removal failed");
            }
        } else if let Err(err) = self
            .store
            .set_instance_run_state(ident, RunState::Stopped, None)
            .await
        {
            warn!(ident = %ident, %err, "run state update failed");
        }

        Some(InstanceStatus {
            ident: ident.clone(),
            service_version: rec.version,
            run_state: RunState::Stopped,
            error: None,
        })
    }

    /// Brings one instance up: bundle, network, unit. Returns its status.
    async fn start_one(&self, info: InstanceInfo, version: String) -> InstanceStatus {
        let ident = info.ident.clone();

        match self.try_start(&info, &version).await {
            Ok(()) => InstanceStatus {
                ident,
                service_version: version,
                run_state: RunState::Active,
                error: None,
            },
            Err(err) => {
                error!(ident = %ident, %err, "instance start failed");

                let _ = self
                    .store
                    .set_instance_run_state(&ident, RunState::Failed, err.exit_code())
                    .await;

                InstanceStatus {
                    ident,
                    service_version: version,
                    run_state: RunState::Failed,
                    error: Some(proto::ErrorInfo::from(&err)),
                }
            }
        }
    }

    async fn try_start(&self, info: &InstanceInfo, version: &str) -> Result<()> {
        let ident = &info.ident;
        let instance_id = ident.instance_id();

        let service = self
            .service_manager
            .get_service(&ident.service_id, version)
            .await?;

        let service_config = runtime::load_service_config(&service.local_path).await?;

        // Resolve the layer stack from the image manifest; only digests the
        // layer manager knows are overlay layers.
        let manifest = image::load_manifest(std::path::Path::new(&service.local_path)).await?;

        let mut layer_digests = Vec::new();
        let mut layer_paths = Vec::new();

        for descriptor in &manifest.layers {
            if let Ok(layer) = self.layer_manager.get_layer(&descriptor.digest).await {
                layer_digests.push(layer.digest.clone());
                layer_paths.push(layer.path.clone());
            }
        }

        for device in &service_config.devices {
            if let Err(err) = self
                .resource_manager
                .allocate_device(device, &instance_id)
                .await
            {
                self.outbound
                    .send_alert(Alert::DeviceAllocate {
                        ident: ident.clone(),
                        device: device.clone(),
                        message: err.to_string(),
                    })
                    .await;

                return Err(err);
            }
        }

        let storage_path = self.storage_path(info);
        let state_path = self.state_path(info);

        runtime::prepare_instance_dir(&storage_path, info.uid, service.gid).await?;
        runtime::prepare_instance_dir(&state_path, info.uid, service.gid).await?;

        let lease = if info.network_parameters.network_id.is_empty() {
            None
        } else {
            Some(
                self.network
                    .add_instance(&instance_id, &info.network_parameters)
                    .await?,
            )
        };

        let env = self.resolve_env(ident).await?;

        let entry = InstanceEntry {
            ident: ident.clone(),
            uid: info.uid,
            priority: info.priority,
            storage_path,
            state_path,
            network_parameters: info.network_parameters.clone(),
            run_state: RunState::Stopped,
            exit_code: None,
            service_version: version.to_string(),
        };

        let runtime_dir = self.config.work_dir.join("runtime");

        runtime::assemble_bundle(runtime::BundleParams {
            runtime_dir: &runtime_dir,
            instance: &entry,
            service: &service,
            service_config: &service_config,
            layer_paths,
            lease: lease.as_ref(),
            host_binds: &self.config.host_binds,
            hosts: &self.config.hosts,
            node_config: self.resource_manager.node_config(),
            env_overrides: env.clone(),
        })
        .await?;

        self.service_manager.retain_service(&service.digest).await;

        for digest in &layer_digests {
            self.layer_manager.retain_layer(digest).await;
        }

        let status = self
            .runner
            .start_instance(&instance_id, &info.run_parameters)
            .await;

        if status.state != RunState::Active {
            self.service_manager.release_service(&service.digest).await;

            for digest in &layer_digests {
                self.layer_manager.release_layer(digest).await;
            }

            return Err(match status.exit_code {
                Some(code) => Error::ExitCode(code),
                None => Error::Failed(format!("instance {ident} failed to start")),
            });
        }

        self.store
            .set_instance_run_state(ident, RunState::Active, None)
            .await?;

        self.monitor.start_instance_monitoring(ident.clone()).await;

        self.running.lock().await.insert(
            ident.clone(),
            RunningInstance {
                info: info.clone(),
                version: version.to_string(),
                digest: service.digest,
                layer_digests,
                env,
            },
        );

        info!(ident = %ident, version, "instance started");

        Ok(())
    }

    async fn resolve_env(&self, ident: &InstanceIdent) -> Result<Vec<String>> {
        let overrides = self.store.get_env_var_overrides().await?;
        let now = Utc::now();
        let mut env = Vec::new();

        for (filter, variables) in &overrides {
            if !filter.matches(ident) {
                continue;
            }

            for variable in variables {
                if variable.ttl.is_none_or(|ttl| ttl > now) {
                    env.push(format!("{}={}", variable.name, variable.value));
                }
            }
        }

        env.sort();

        Ok(env)
    }

    /// Applies runner aggregate updates to persisted state and forwards
    /// them upstream.
    async fn handle_run_status(&self, statuses: Vec<RunStatus>) {
        let mut updates = Vec::new();

        {
            let running = self.running.lock().await;

            for status in &statuses {
                let Some((ident, rec)) = running
                    .iter()
                    .find(|(ident, _)| ident.instance_id() == status.instance_id)
                else {
                    continue;
                };

                if let Err(err) = self
                    .store
                    .set_instance_run_state(ident, status.state, status.exit_code)
                    .await
                {
                    warn!(ident = %ident, %err, "run state update failed");
                }

                updates.push(InstanceStatus {
                    ident: ident.clone(),
                    service_version: rec.version.clone(),
                    run_state: status.state,
                    error: status.exit_code.map(|code| {
                        proto::ErrorInfo::from(&Error::ExitCode(code))
                    }),
                });
            }
        }

        if !updates.is_empty() {
            self.outbound.send_update_instances_status(updates).await;
        }
    }

    /// Quota raise on an instance with the onQuota restart policy triggers
    /// a stop/start cycle.
    async fn handle_quota_event(&self, event: QuotaEvent) {
        if event.status != AlertStatus::Raise {
            return;
        }

        let rec = {
            let running = self.running.lock().await;

            match running.get(&event.ident) {
                Some(rec) if rec.info.restart_policy == RESTART_POLICY_ON_QUOTA => rec.clone(),
                _ => return,
            }
        };

        info!(ident = %event.ident, parameter = %event.parameter, "restarting instance on quota");

        self.stop_one(&event.ident, false).await;

        let status = self.start_one(rec.info.clone(), rec.version.clone()).await;

        self.outbound
            .send_update_instances_status(vec![status])
            .await;
    }

    /// Identities of running instances, for tests and diagnostics.
    pub async fn running_instances(&self) -> HashSet<InstanceIdent> {
        self.running.lock().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NetworkParameters;

    fn info(service: &str, instance: u64, priority: u64) -> InstanceInfo {
        InstanceInfo {
            ident: InstanceIdent::new(service, "sub", instance),
            uid: 5000,
            priority,
            storage_path: String::new(),
            state_path: String::new(),
            network_parameters: NetworkParameters::default(),
            run_parameters: Default::default(),
            restart_policy: String::new(),
        }
    }

    fn running(info: &InstanceInfo, version: &str) -> RunningInstance {
        RunningInstance {
            info: info.clone(),
            version: version.to_string(),
            digest: "d".to_string(),
            layer_digests: vec![],
            env: vec![],
        }
    }

    #[test]
    fn plan_diffs_desired_against_running() {
        let keep = info("keep", 0, 0);
        let update = info("update", 0, 0);
        let gone = info("gone", 0, 0);
        let new = info("new", 0, 0);

        let desired = HashMap::from([
            (keep.ident.clone(), (keep.clone(), "1.0".to_string())),
            (update.ident.clone(), (update.clone(), "2.0".to_string())),
            (new.ident.clone(), (new.clone(), "1.0".to_string())),
        ]);

        let running_map = HashMap::from([
            (keep.ident.clone(), running(&keep, "1.0")),
            (update.ident.clone(), running(&update, "1.0")),
            (gone.ident.clone(), running(&gone, "1.0")),
        ]);

        let plan = compute_plan(&desired, &running_map, &HashMap::new(), false);

        assert_eq!(plan.to_stop, vec![gone.ident.clone()]);
        assert_eq!(plan.to_restart, vec![update.ident.clone()]);
        assert_eq!(plan.to_start, vec![new.ident.clone()]);
    }

    #[test]
    fn same_state_plan_is_empty() {
        let keep = info("keep", 0, 0);

        let desired = HashMap::from([(keep.ident.clone(), (keep.clone(), "1.0".to_string()))]);
        let running_map = HashMap::from([(keep.ident.clone(), running(&keep, "1.0"))]);

        let plan = compute_plan(&desired, &running_map, &HashMap::new(), false);

        assert_eq!(plan, ReconcilePlan::default());
    }

    #[test]
    fn force_restart_restarts_everything_running() {
        let keep = info("keep", 0, 0);

        let desired = HashMap::from([(keep.ident.clone(), (keep.clone(), "1.0".to_string()))]);
        let running_map = HashMap::from([(keep.ident.clone(), running(&keep, "1.0"))]);

        let plan = compute_plan(&desired, &running_map, &HashMap::new(), true);

        assert_eq!(plan.to_restart, vec![keep.ident.clone()]);
        assert!(plan.to_start.is_empty());
    }

    #[test]
    fn network_change_triggers_restart() {
        let mut changed = info("svc", 0, 0);

        let desired_running = running(&changed, "1.0");

        changed.network_parameters = NetworkParameters {
            network_id: "net1".to_string(),
            ..Default::default()
        };

        let desired =
            HashMap::from([(changed.ident.clone(), (changed.clone(), "1.0".to_string()))]);
        let running_map = HashMap::from([(changed.ident.clone(), desired_running)]);

        let plan = compute_plan(&desired, &running_map, &HashMap::new(), false);

        assert_eq!(plan.to_restart, vec![changed.ident.clone()]);
    }

    #[test]
    fn env_change_triggers_restart() {
        let svc = info("svc", 0, 0);

        let desired = HashMap::from([(svc.ident.clone(), (svc.clone(), "1.0".to_string()))]);
        let running_map = HashMap::from([(svc.ident.clone(), running(&svc, "1.0"))]);
        let env = HashMap::from([(svc.ident.clone(), vec!["LOG_LEVEL=debug".to_string()])]);

        let plan = compute_plan(&desired, &running_map, &env, false);

        assert_eq!(plan.to_restart, vec![svc.ident.clone()]);
    }

    #[test]
    fn start_order_is_priority_then_identity() {
        let mut instances = vec![
            info("b", 0, 10),
            info("a", 1, 100),
            info("a", 0, 100),
            info("c", 0, 10),
        ];

        instances.sort_by(start_order);

        let order: Vec<String> = instances
            .iter()
            .map(|i| format!("{}:{}", i.ident.service_id, i.ident.instance))
            .collect();

        assert_eq!(order, vec!["a:0", "a:1", "b:0", "c:0"]);
    }
}
