//! Paged retrieval of system and instance logs for the CM.
//!
//! Requests are queued to a worker task. Each request opens a bounded
//! journal query, splits the content into fixed-size parts and streams
//! them back as log data messages. The final part carries the part count;
//! an empty result or a failure is reported as a single part with the
//! corresponding status.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};
use crate::journal::{Journal, JournalQuery};
use crate::proto;
use crate::runner::Runner;
use crate::smclient::Outbound;
use crate::storage::Store;
use crate::types::InstanceFilter;

const STATUS_OK: &str = "ok";
const STATUS_EMPTY: &str = "empty";
const STATUS_ERROR: &str = "error";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    System,
    Instance,
    InstanceCrash,
}

#[derive(Debug, Clone)]
pub struct LogRequest {
    pub log_id: String,
    pub kind: LogKind,
    pub from: Option<DateTime<Utc>>,
    pub till: Option<DateTime<Utc>>,
    pub filter: InstanceFilter,
}

pub struct LogProvider {
    request_tx: mpsc::UnboundedSender<LogRequest>,
}

struct LogWorker {
    config: LoggingConfig,
    store: Arc<Store>,
    journal: Arc<dyn Journal>,
    outbound: Outbound,
}

impl LogProvider {
    /// Creates the provider and spawns its worker task.
    pub fn start(
        config: LoggingConfig,
        store: Arc<Store>,
        journal: Arc<dyn Journal>,
        outbound: Outbound,
    ) -> Self {
        let (request_tx, mut request_rx) = mpsc::unbounded_channel::<LogRequest>();

        let worker = LogWorker {
            config,
            store,
            journal,
            outbound,
        };

        tokio::spawn(async move {
            while let Some(request) = request_rx.recv().await {
                let log_id = request.log_id.clone();

                if let Err(err) = worker.process(request).await {
                    error!(log_id, %err, "log request failed");

                    worker
                        .send_status(&log_id, STATUS_ERROR, Some(&err))
                        .await;
                }
            }
        });

        Self { request_tx }
    }

    /// Enqueues a log request; the worker streams the response parts.
    pub fn request_log(&self, request: LogRequest) {
        let _ = self.request_tx.send(request);
    }
}

impl LogWorker {
    async fn process(&self, request: LogRequest) -> Result<()> {
        debug!(log_id = %request.log_id, kind = ?request.kind, "processing log request");

        let instance_ids = match request.kind {
            LogKind::System => Vec::new(),
            LogKind::Instance | LogKind::InstanceCrash => {
                let ids = self.instance_ids(&request.filter).await?;

                if ids.is_empty() {
                    debug!(log_id = %request.log_id, "no instances match log filter");

                    self.send_status(&request.log_id, STATUS_EMPTY, None).await;

                    return Ok(());
                }

                ids
            }
        };

        let entries = match request.kind {
            LogKind::InstanceCrash => self.read_crash_log(&request, &instance_ids).await?,
            _ => {
                let query = JournalQuery {
                    matches: unit_matches(&instance_ids),
                    from: request.from,
                    till: request.till,
                    ..Default::default()
                };

                self.journal.read(&query).await?
            }
        };

        let parts = self.split_parts(entries.iter().map(format_entry));

        if parts.is_empty() {
            self.send_status(&request.log_id, STATUS_EMPTY, None).await;

            return Ok(());
        }

        let parts_count = parts.len() as u64;

        for (index, content) in parts.into_iter().enumerate() {
            let last = index as u64 + 1 == parts_count;

            self.outbound
                .send_log(proto::LogData {
                    log_id: request.log_id.clone(),
                    part: index as u64 + 1,
                    parts_count: if last { parts_count } else { 0 },
                    content: content.into_bytes(),
                    status: STATUS_OK.to_string(),
                    error_info: None,
                })
                .await;
        }

        Ok(())
    }

    /// Crash log: everything the unit logged since its last start, bounded
    /// by `till` (or the journal end).
    async fn read_crash_log(
        &self,
        request: &LogRequest,
        instance_ids: &[String],
    ) -> Result<Vec<crate::journal::JournalEntry>> {
        let query = JournalQuery {
            matches: unit_matches(instance_ids),
            till: request.till,
            ..Default::default()
        };

        let entries = self.journal.read(&query).await?;

        let start = entries
            .iter()
            .rposition(|entry| entry.message.starts_with("Started"))
            .map(|pos| pos + 1)
            .unwrap_or(0);

        Ok(entries[start..].to_vec())
    }

    async fn instance_ids(&self, filter: &InstanceFilter) -> Result<Vec<String>> {
        Ok(self
            .store
            .get_all_instances()
            .await?
            .into_iter()
            .filter(|entry| filter.matches(&entry.ident))
            .map(|entry| entry.ident.instance_id())
            .collect())
    }

    fn split_parts(&self, lines: impl Iterator<Item = String>) -> Vec<String> {
        let mut parts: Vec<String> = Vec::new();
        let mut current = String::new();

        for line in lines {
            if !current.is_empty()
                && current.len() + line.len() > self.config.max_part_size as usize
            {
                parts.push(std::mem::take(&mut current));

                if parts.len() as u64 == self.config.max_part_count {
                    return parts;
                }
            }

            current.push_str(&line);
        }

        if !current.is_empty() {
            parts.push(current);
        }

        parts
    }

    async fn send_status(&self, log_id: &str, status: &str, err: Option<&Error>) {
        self.outbound
            .send_log(proto::LogData {
                log_id: log_id.to_string(),
                part: 1,
                parts_count: 1,
                content: Vec::new(),
                status: status.to_string(),
                error_info: err.map(proto::ErrorInfo::from),
            })
            .await;
    }
}

fn unit_matches(instance_ids: &[String]) -> Vec<String> {
    instance_ids
        .iter()
        .map(|id| format!("_SYSTEMD_UNIT={}", Runner::unit_name(id)))
        .collect()
}

fn format_entry(entry: &crate::journal::JournalEntry) -> String {
    let timestamp = entry
        .realtime
        .map(|t| t.to_rfc3339())
        .unwrap_or_default();

    format!("{timestamp} {}\n", entry.message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::tests::MockJournal;
    use crate::journal::JournalEntry;
    use crate::smclient::{outbound_channel, OutboundReceivers, OutgoingMessage};
    use crate::storage::InstanceEntry;
    use crate::types::{InstanceIdent, NetworkParameters, RunState};
    use std::time::Duration;

    async fn drain_logs(receivers: &mut OutboundReceivers) -> Vec<proto::LogData> {
        let mut logs = Vec::new();

        while let Ok(Some(message)) =
            tokio::time::timeout(Duration::from_millis(300), receivers.messages.recv()).await
        {
            if let OutgoingMessage::Log(log) = message {
                let done = log.parts_count > 0;

                logs.push(log);

                if done {
                    break;
                }
            }
        }

        logs
    }

    fn entry(message: &str, unit: &str) -> JournalEntry {
        JournalEntry {
            message: message.to_string(),
            systemd_unit: unit.to_string(),
            priority: 6,
            ..Default::default()
        }
    }

    async fn store_with_instance() -> Arc<Store> {
        let store = Arc::new(Store::new_in_memory().await.unwrap());

        store
            .add_instance(&InstanceEntry {
                ident: InstanceIdent::new("svc", "sub", 0),
                uid: 0,
                priority: 0,
                storage_path: String::new(),
                state_path: String::new(),
                network_parameters: NetworkParameters::default(),
                run_state: RunState::Active,
                exit_code: None,
                service_version: "1.0".to_string(),
            })
            .await
            .unwrap();

        store
    }

    #[tokio::test]
    async fn system_log_paged_with_parts_count_on_last() {
        let journal = Arc::new(MockJournal::default());

        for index in 0..20 {
            journal.push(entry(&format!("system message {index}"), "init.scope"));
        }

        let (outbound, mut receivers) = outbound_channel();
        let provider = LogProvider::start(
            LoggingConfig {
                max_part_size: 120,
                max_part_count: 80,
            },
            store_with_instance().await,
            journal,
            outbound,
        );

        provider.request_log(LogRequest {
            log_id: "log1".to_string(),
            kind: LogKind::System,
            from: None,
            till: None,
            filter: InstanceFilter::default(),
        });

        let logs = drain_logs(&mut receivers).await;

        assert!(logs.len() > 1);
        assert!(logs.iter().all(|log| log.status == "ok"));
        assert!(logs[..logs.len() - 1].iter().all(|log| log.parts_count == 0));

        let last = logs.last().unwrap();
        assert_eq!(last.parts_count, logs.len() as u64);
        assert_eq!(last.part, logs.len() as u64);
    }

    #[tokio::test]
    async fn instance_log_filters_by_unit() {
        let journal = Arc::new(MockJournal::default());

        journal.push(entry("instance says hi", "aos-service@svc_sub_0.service"));
        journal.push(entry("other unit", "sshd.service"));

        let (outbound, mut receivers) = outbound_channel();
        let provider = LogProvider::start(
            LoggingConfig::default(),
            store_with_instance().await,
            journal,
            outbound,
        );

        provider.request_log(LogRequest {
            log_id: "log2".to_string(),
            kind: LogKind::Instance,
            from: None,
            till: None,
            filter: InstanceFilter {
                service_id: Some("svc".to_string()),
                ..Default::default()
            },
        });

        let logs = drain_logs(&mut receivers).await;

        assert_eq!(logs.len(), 1);
        let content = String::from_utf8(logs[0].content.clone()).unwrap();
        assert!(content.contains("instance says hi"));
        assert!(!content.contains("other unit"));
    }

    #[tokio::test]
    async fn unmatched_filter_reports_empty() {
        let journal = Arc::new(MockJournal::default());
        let (outbound, mut receivers) = outbound_channel();
        let provider = LogProvider::start(
            LoggingConfig::default(),
            store_with_instance().await,
            journal,
            outbound,
        );

        provider.request_log(LogRequest {
            log_id: "log3".to_string(),
            kind: LogKind::Instance,
            from: None,
            till: None,
            filter: InstanceFilter {
                service_id: Some("unknown".to_string()),
                ..Default::default()
            },
        });

        let logs = drain_logs(&mut receivers).await;

        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, "empty");
        assert_eq!(logs[0].parts_count, 1);
    }

    #[tokio::test]
    async fn crash_log_starts_after_last_unit_start() {
        let journal = Arc::new(MockJournal::default());
        let unit = "aos-service@svc_sub_0.service";

        journal.push(entry("old run output", unit));
        journal.push(entry("Started Aos service.", unit));
        journal.push(entry("panic: boom", unit));

        let (outbound, mut receivers) = outbound_channel();
        let provider = LogProvider::start(
            LoggingConfig::default(),
            store_with_instance().await,
            journal,
            outbound,
        );

        provider.request_log(LogRequest {
            log_id: "log4".to_string(),
            kind: LogKind::InstanceCrash,
            from: None,
            till: None,
            filter: InstanceFilter::default(),
        });

        let logs = drain_logs(&mut receivers).await;

        let content = String::from_utf8(logs[0].content.clone()).unwrap();
        assert!(content.contains("panic: boom"));
        assert!(!content.contains("old run output"));
    }
}
