//! Supervision adapter running each instance as a systemd unit.
//!
//! Units are named `aos-service@<instanceID>.service`. Start/restart policy
//! goes into a drop-in fragment; a background poll task tracks unit states
//! and publishes aggregate run-status changes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::types::{RunParameters, RunState, RunStatus};

pub const UNIT_NAME_PREFIX: &str = "aos-service@";
pub const UNIT_NAME_SUFFIX: &str = ".service";
const PARAMETERS_FILE: &str = "parameters.conf";

const DEFAULT_START_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_START_BURST: u64 = 3;
const DEFAULT_RESTART_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);
const START_TIME_MULTIPLIER: u32 = 2;

pub const STATUS_POLL_PERIOD: Duration = Duration::from_secs(1);

/// Supervisor-reported state of one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Active,
    Activating,
    Deactivating,
    Inactive,
    Failed,
}

#[derive(Debug, Clone)]
pub struct UnitStatus {
    pub name: String,
    pub active_state: UnitState,
    pub exit_code: Option<i32>,
}

/// Narrow systemd manager interface. The production implementation talks
/// D-Bus; tests use an in-memory mock.
#[async_trait]
pub trait SystemdConn: Send + Sync {
    async fn start_unit(&self, name: &str, mode: &str, timeout: Duration) -> Result<()>;
    async fn stop_unit(&self, name: &str, mode: &str, timeout: Duration) -> Result<()>;
    async fn reset_failed_unit(&self, name: &str) -> Result<()>;
    async fn list_units(&self) -> Result<Vec<UnitStatus>>;
    async fn get_unit_status(&self, name: &str) -> Result<UnitStatus>;
}

fn to_run_state(state: UnitState) -> RunState {
    // Only a supervisor failure downgrades the instance; transient reload
    // states must not flap upstream.
    if state == UnitState::Failed {
        RunState::Failed
    } else {
        RunState::Active
    }
}

struct StartingUnit {
    state: UnitState,
    exit_code: Option<i32>,
    notify: Arc<Notify>,
}

#[derive(Clone, PartialEq)]
struct RunningUnit {
    run_state: RunState,
    exit_code: Option<i32>,
}

#[derive(Default)]
struct Units {
    starting: HashMap<String, StartingUnit>,
    running: HashMap<String, RunningUnit>,
    last_emitted: usize,
}

pub struct Runner {
    systemd: Arc<dyn SystemdConn>,
    drop_ins_dir: PathBuf,
    poll_period: Duration,
    units: Mutex<Units>,
    status_tx: mpsc::UnboundedSender<Vec<RunStatus>>,
    shutdown: watch::Sender<bool>,
}

impl Runner {
    pub fn new(
        systemd: Arc<dyn SystemdConn>,
        drop_ins_dir: PathBuf,
        poll_period: Duration,
        status_tx: mpsc::UnboundedSender<Vec<RunStatus>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            systemd,
            drop_ins_dir,
            poll_period,
            units: Mutex::new(Units::default()),
            status_tx,
            shutdown: watch::channel(false).0,
        })
    }

    /// Starts the unit monitoring task.
    pub fn start(self: &Arc<Self>) {
        let runner = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(runner.poll_period);
            tick.tick().await;

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(err) = runner.monitor_units().await {
                            error!(%err, "unit monitoring failed");
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

    pub fn unit_name(instance_id: &str) -> String {
        format!("{UNIT_NAME_PREFIX}{instance_id}{UNIT_NAME_SUFFIX}")
    }

    pub fn instance_id_from_unit(unit: &str) -> Option<&str> {
        unit.strip_prefix(UNIT_NAME_PREFIX)?
            .strip_suffix(UNIT_NAME_SUFFIX)
    }

    /// Starts an instance unit and waits for it to settle.
    pub async fn start_instance(&self, instance_id: &str, params: &RunParameters) -> RunStatus {
        let fixed = FixedRunParameters::from(params);
        let unit_name = Self::unit_name(instance_id);

        debug!(
            instance_id,
            start_interval = ?fixed.start_interval,
            start_burst = fixed.start_burst,
            restart_interval = ?fixed.restart_interval,
            "starting instance"
        );

        let failed = |err: Error| RunStatus {
            instance_id: instance_id.to_string(),
            state: RunState::Failed,
            exit_code: err.exit_code(),
        };

        if let Err(err) = self.write_run_parameters(&unit_name, &fixed).await {
            return failed(err);
        }

        let start_timeout = fixed.start_interval * START_TIME_MULTIPLIER;

        if let Err(err) = self
            .systemd
            .start_unit(&unit_name, "replace", start_timeout)
            .await
        {
            warn!(instance_id, %err, "start unit failed");

            return failed(err);
        }

        match self.wait_starting_unit(&unit_name, start_timeout).await {
            Ok(exit_code) => RunStatus {
                instance_id: instance_id.to_string(),
                state: RunState::Active,
                exit_code,
            },
            Err(err) => {
                warn!(instance_id, %err, "unit did not reach active state");

                failed(err)
            }
        }
    }

    /// Stops an instance unit. A unit unknown to the supervisor is not an
    /// error.
    pub async fn stop_instance(&self, instance_id: &str) -> Result<()> {
        debug!(instance_id, "stopping instance");

        let unit_name = Self::unit_name(instance_id);

        {
            let mut units = self.units.lock().await;

            units.running.remove(&unit_name);
            units.starting.remove(&unit_name);
        }

        let mut result = match self
            .systemd
            .stop_unit(&unit_name, "replace", DEFAULT_STOP_TIMEOUT)
            .await
        {
            Err(err) if !err.is_not_found() => Err(err),
            _ => Ok(()),
        };

        if let Err(err) = self.systemd.reset_failed_unit(&unit_name).await {
            if !err.is_not_found() && result.is_ok() {
                result = Err(err);
            }
        }

        if let Err(err) = self.remove_run_parameters(&unit_name).await {
            if result.is_ok() {
                result = Err(err);
            }
        }

        result
    }

    async fn wait_starting_unit(
        &self,
        unit_name: &str,
        timeout: Duration,
    ) -> Result<Option<i32>> {
        let initial = self.systemd.get_unit_status(unit_name).await?;
        let notify = Arc::new(Notify::new());

        {
            let mut units = self.units.lock().await;

            units.starting.insert(
                unit_name.to_string(),
                StartingUnit {
                    state: initial.active_state,
                    exit_code: initial.exit_code,
                    notify: Arc::clone(&notify),
                },
            );
        }

        // The monitor only notifies on a terminal failure; otherwise the
        // full window elapses to confirm the unit holds its state.
        let _ = tokio::time::timeout(timeout, notify.notified()).await;

        let mut units = self.units.lock().await;

        let unit = units
            .starting
            .remove(unit_name)
            .ok_or_else(|| Error::Failed("starting unit vanished".into()))?;

        if unit.state != UnitState::Active {
            return Err(match unit.exit_code {
                Some(code) => Error::ExitCode(code),
                None => Error::Failed(format!("unit {unit_name} failed to start")),
            });
        }

        units.running.insert(
            unit_name.to_string(),
            RunningUnit {
                run_state: RunState::Active,
                exit_code: unit.exit_code,
            },
        );

        Ok(unit.exit_code)
    }

    async fn monitor_units(&self) -> Result<()> {
        let statuses = self.systemd.list_units().await?;
        let mut units = self.units.lock().await;
        let mut changed = false;

        for status in &statuses {
            if let Some(starting) = units.starting.get_mut(&status.name) {
                starting.state = status.active_state;
                starting.exit_code = status.exit_code;

                // systemd keeps a failed unit in its final state; report it
                // without waiting out the start window.
                if status.active_state == UnitState::Failed {
                    starting.notify.notify_waiters();
                }
            }

            if let Some(running) = units.running.get_mut(&status.name) {
                let next = RunningUnit {
                    run_state: to_run_state(status.active_state),
                    exit_code: status.exit_code,
                };

                if *running != next {
                    *running = next;
                    changed = true;
                }
            }
        }

        if changed || units.running.len() != units.last_emitted {
            units.last_emitted = units.running.len();

            let statuses = units
                .running
                .iter()
                .filter_map(|(unit, data)| {
                    Self::instance_id_from_unit(unit).map(|id| RunStatus {
                        instance_id: id.to_string(),
                        state: data.run_state,
                        exit_code: data.exit_code,
                    })
                })
                .collect();

            let _ = self.status_tx.send(statuses);
        }

        Ok(())
    }

    async fn write_run_parameters(
        &self,
        unit_name: &str,
        params: &FixedRunParameters,
    ) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let content = format!(
            "[Unit]\nStartLimitIntervalSec={}s\nStartLimitBurst={}\n\n[Service]\nRestartSec={}s\n",
            params.start_interval.as_secs(),
            params.start_burst,
            params.restart_interval.as_secs(),
        );

        let dir = self.drop_ins_dir.join(format!("{unit_name}.d"));

        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755)).await?;

        let file = dir.join(PARAMETERS_FILE);

        tokio::fs::write(&file, content).await?;
        tokio::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o644)).await?;

        Ok(())
    }

    async fn remove_run_parameters(&self, unit_name: &str) -> Result<()> {
        let dir = self.drop_ins_dir.join(format!("{unit_name}.d"));

        match tokio::fs::remove_dir_all(&dir).await {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}

struct FixedRunParameters {
    start_interval: Duration,
    start_burst: u64,
    restart_interval: Duration,
}

impl From<&RunParameters> for FixedRunParameters {
    fn from(params: &RunParameters) -> Self {
        Self {
            start_interval: params.start_interval.unwrap_or(DEFAULT_START_INTERVAL),
            start_burst: params.start_burst.unwrap_or(DEFAULT_START_BURST),
            restart_interval: params.restart_interval.unwrap_or(DEFAULT_RESTART_INTERVAL),
        }
    }
}
