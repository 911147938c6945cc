//! System journal access behind a narrow query interface.
//!
//! The production adapter shells out to `journalctl -o json`; tests use an
//! in-memory journal. Consumers are the log provider (bounded reads) and
//! the journal alerts pipeline (cursor-driven incremental reads).

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tokio::process::Command;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct JournalEntry {
    pub message: String,
    pub systemd_unit: String,
    pub systemd_cgroup: String,
    pub unit: String,
    pub priority: i32,
    pub realtime: Option<DateTime<Utc>>,
    pub cursor: String,
}

/// Bounded journal read request.
#[derive(Debug, Clone, Default)]
pub struct JournalQuery {
    /// Field matches (`FIELD=value`), OR-ed together.
    pub matches: Vec<String>,
    /// Only entries with priority <= this value.
    pub priority: Option<i32>,
    pub from: Option<DateTime<Utc>>,
    pub till: Option<DateTime<Utc>>,
    /// Only entries after this cursor.
    pub after_cursor: Option<String>,
    pub limit: Option<usize>,
}

#[async_trait]
pub trait Journal: Send + Sync {
    async fn read(&self, query: &JournalQuery) -> Result<Vec<JournalEntry>>;

    /// Cursor of the current journal end, used to resume from "now".
    async fn tail_cursor(&self) -> Result<String>;
}

/// journalctl-backed journal reader.
pub struct JournalCtl;

#[derive(Deserialize)]
struct RawEntry {
    #[serde(rename = "MESSAGE", default)]
    message: serde_json::Value,
    #[serde(rename = "_SYSTEMD_UNIT", default)]
    systemd_unit: String,
    #[serde(rename = "_SYSTEMD_CGROUP", default)]
    systemd_cgroup: String,
    #[serde(rename = "UNIT", default)]
    unit: String,
    #[serde(rename = "PRIORITY", default)]
    priority: String,
    #[serde(rename = "__REALTIME_TIMESTAMP", default)]
    realtime_usec: String,
    #[serde(rename = "__CURSOR", default)]
    cursor: String,
}

impl From<RawEntry> for JournalEntry {
    fn from(raw: RawEntry) -> Self {
        // MESSAGE may be a string or a byte array for non-UTF8 payloads.
        let message = match raw.message {
            serde_json::Value::String(s) => s,
            serde_json::Value::Array(bytes) => {
                let data: Vec<u8> = bytes
                    .into_iter()
                    .filter_map(|v| v.as_u64().map(|b| b as u8))
                    .collect();

                String::from_utf8_lossy(&data).into_owned()
            }
            _ => String::new(),
        };

        let realtime = raw
            .realtime_usec
            .parse::<i64>()
            .ok()
            .and_then(|usec| Utc.timestamp_micros(usec).single());

        Self {
            message,
            systemd_unit: raw.systemd_unit,
            systemd_cgroup: raw.systemd_cgroup,
            unit: raw.unit,
            priority: raw.priority.parse().unwrap_or(6),
            realtime,
            cursor: raw.cursor,
        }
    }
}

#[async_trait]
impl Journal for JournalCtl {
    async fn read(&self, query: &JournalQuery) -> Result<Vec<JournalEntry>> {
        let mut args: Vec<String> = vec!["-o".into(), "json".into(), "--no-pager".into()];

        if let Some(priority) = query.priority {
            args.push("-p".into());
            args.push(priority.to_string());
        }

        if let Some(from) = query.from {
            args.push(format!("--since=@{}", from.timestamp()));
        }

        if let Some(till) = query.till {
            args.push(format!("--until=@{}", till.timestamp()));
        }

        if let Some(cursor) = &query.after_cursor {
            args.push(format!("--after-cursor={cursor}"));
        }

        if let Some(limit) = query.limit {
            args.push("-n".into());
            args.push(limit.to_string());
        }

        for (index, field_match) in query.matches.iter().enumerate() {
            if index > 0 {
                args.push("+".into());
            }

            args.push(field_match.clone());
        }

        let output = Command::new("journalctl").args(&args).output().await?;

        if !output.status.success() {
            return Err(Error::Failed(format!(
                "journalctl failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let mut entries = Vec::new();

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            if line.is_empty() {
                continue;
            }

            let raw: RawEntry = serde_json::from_str(line)
                .map_err(|err| Error::Failed(format!("bad journal entry: {err}")))?;

            entries.push(raw.into());
        }

        Ok(entries)
    }

    async fn tail_cursor(&self) -> Result<String> {
        let output = Command::new("journalctl")
            .args(["-n", "0", "--show-cursor", "--no-pager"])
            .output()
            .await?;

        if !output.status.success() {
            return Err(Error::Failed("journalctl cursor query failed".into()));
        }

        String::from_utf8_lossy(&output.stdout)
            .lines()
            .find_map(|line| line.strip_prefix("-- cursor: "))
            .map(|cursor| cursor.trim().to_string())
            .ok_or_else(|| Error::Failed("no cursor in journalctl output".into()))
    }
}
