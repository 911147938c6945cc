//! Production systemd connection shelling out to systemctl.
//!
//! The D-Bus transport is deliberately kept out of the core; this adapter
//! implements the narrow [`SystemdConn`] interface the runner consumes.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::runner::{SystemdConn, UnitState, UnitStatus};

pub struct SystemctlConn;

fn parse_unit_state(state: &str) -> UnitState {
    match state {
        "active" => UnitState::Active,
        "activating" | "reloading" => UnitState::Activating,
        "deactivating" => UnitState::Deactivating,
        "failed" => UnitState::Failed,
        _ => UnitState::Inactive,
    }
}

async fn systemctl(args: &[&str], timeout: Duration) -> Result<std::process::Output> {
    let output = tokio::time::timeout(timeout, Command::new("systemctl").args(args).output())
        .await
        .map_err(|_| Error::Timeout(format!("systemctl {}", args.join(" "))))??;

    Ok(output)
}

fn check_output(output: &std::process::Output, context: &str) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);

    if stderr.contains("not loaded") || stderr.contains("not found") {
        return Err(Error::NotFound(context.to_string()));
    }

    Err(Error::Failed(format!("{context}: {stderr}")))
}

#[async_trait]
impl SystemdConn for SystemctlConn {
    async fn start_unit(&self, name: &str, _mode: &str, timeout: Duration) -> Result<()> {
        let output = systemctl(&["start", "--no-block", name], timeout).await?;

        check_output(&output, &format!("start {name}"))
    }

    async fn stop_unit(&self, name: &str, _mode: &str, timeout: Duration) -> Result<()> {
        let output = systemctl(&["stop", name], timeout).await?;

        check_output(&output, &format!("stop {name}"))
    }

    async fn reset_failed_unit(&self, name: &str) -> Result<()> {
        let output = systemctl(&["reset-failed", name], Duration::from_secs(10)).await?;

        check_output(&output, &format!("reset-failed {name}"))
    }

    async fn list_units(&self) -> Result<Vec<UnitStatus>> {
        let output = systemctl(
            &[
                "list-units",
                "--all",
                "--plain",
                "--no-legend",
                "--no-pager",
                "aos-service@*.service",
            ],
            Duration::from_secs(10),
        )
        .await?;

        check_output(&output, "list-units")?;

        let text = String::from_utf8_lossy(&output.stdout);
        let mut units = Vec::new();

        for line in text.lines() {
            let mut fields = line.split_whitespace();

            let (Some(name), Some(_load), Some(active)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };

            let state = parse_unit_state(active);

            let exit_code = if state == UnitState::Failed {
                self.main_exit_code(name).await
            } else {
                None
            };

            units.push(UnitStatus {
                name: name.to_string(),
                active_state: state,
                exit_code,
            });
        }

        Ok(units)
    }

    async fn get_unit_status(&self, name: &str) -> Result<UnitStatus> {
        let output = systemctl(
            &[
                "show",
                name,
                "--property=ActiveState",
                "--property=ExecMainStatus",
            ],
            Duration::from_secs(10),
        )
        .await?;

        check_output(&output, &format!("show {name}"))?;

        let text = String::from_utf8_lossy(&output.stdout);
        let mut state = UnitState::Inactive;
        let mut exit_code = None;

        for line in text.lines() {
            if let Some(value) = line.strip_prefix("ActiveState=") {
                state = parse_unit_state(value.trim());
            } else if let Some(value) = line.strip_prefix("ExecMainStatus=") {
                exit_code = value.trim().parse::<i32>().ok().filter(|code| *code != 0);
            }
        }

        Ok(UnitStatus {
            name: name.to_string(),
            active_state: state,
            exit_code,
        })
    }
}

impl SystemctlConn {
    async fn main_exit_code(&self, unit: &str) -> Option<i32> {
        let output = systemctl(
            &["show", unit, "--property=ExecMainStatus"],
            Duration::from_secs(10),
        )
        .await
        .ok()?;

        String::from_utf8_lossy(&output.stdout)
            .trim()
            .strip_prefix("ExecMainStatus=")?
            .parse::<i32>()
            .ok()
            .filter(|code| *code != 0)
    }
}
