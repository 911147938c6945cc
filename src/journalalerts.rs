//! Journal-driven alert pipeline.
//!
//! Follows the system journal from the persisted cursor and classifies
//! matching entries: unit logs of `aos-service@…` instances become service
//! instance alerts, Aos core component units become core alerts, anything
//! else above the system priority becomes a system alert. Messages matching
//! a configured substring filter are discarded. The cursor is persisted on
//! clean stop; unreadable journal state clears the cursor and re-seeks to
//! the tail.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{debug, error, warn};

use crate::config::JournalAlertsConfig;
use crate::error::Result;
use crate::journal::{Journal, JournalEntry, JournalQuery};
use crate::runner::Runner;
use crate::smclient::Outbound;
use crate::storage::Store;
use crate::types::{Alert, InstanceIdent};

const CORE_COMPONENT_PREFIX: &str = "aos-";
const INIT_SCOPE: &str = "init.scope";
const MAX_RECOVERY_ATTEMPTS: u32 = 3;

pub const JOURNAL_POLL_PERIOD: Duration = Duration::from_secs(1);

pub struct JournalAlerts {
    config: JournalAlertsConfig,
    store: Arc<Store>,
    journal: Arc<dyn Journal>,
    outbound: Outbound,
    poll_period: Duration,
    cursor: Mutex<Option<String>>,
    shutdown: watch::Sender<bool>,
}

impl JournalAlerts {
    pub fn new(
        config: JournalAlertsConfig,
        store: Arc<Store>,
        journal: Arc<dyn Journal>,
        outbound: Outbound,
        poll_period: Duration,
    ) -> Self {
        Self {
            config,
            store,
            journal,
            outbound,
            poll_period,
            cursor: Mutex::new(None),
            shutdown: watch::channel(false).0,
        }
    }

    /// Loads the persisted cursor and starts following the journal.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        *self.cursor.lock().await = self.store.get_journal_cursor().await?.filter(|c| !c.is_empty());

        let alerts = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(alerts.poll_period);
            tick.tick().await;
            let mut recovery_attempts = 0u32;

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        match alerts.poll_journal().await {
                            Ok(()) => recovery_attempts = 0,
                            Err(err) => {
                                error!(%err, "journal read failed");

                                recovery_attempts += 1;

                                if recovery_attempts > MAX_RECOVERY_ATTEMPTS {
                                    error!("journal recovery attempts exhausted");

                                    return;
                                }

                                if let Err(err) = alerts.recover().await {
                                    error!(%err, "journal recovery failed");
                                }
                            }
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });

        Ok(())
    }

    /// Stops the pipeline and persists the current cursor.
    pub async fn stop(&self) -> Result<()> {
        let _ = self.shutdown.send(true);

        if let Some(cursor) = self.cursor.lock().await.as_deref() {
            self.store.set_journal_cursor(cursor).await?;
        }

        Ok(())
    }

    /// Reads and classifies everything after the current cursor.
    pub async fn poll_journal(&self) -> Result<()> {
        let after_cursor = self.cursor.lock().await.clone();

        let entries = self
            .journal
            .read(&JournalQuery {
                after_cursor,
                ..Default::default()
            })
            .await?;

        for entry in &entries {
            self.process_entry(entry).await;
        }

        if let Some(last) = entries.last() {
            *self.cursor.lock().await = Some(last.cursor.clone());
        }

        Ok(())
    }

    /// Clears the persisted cursor and re-seeks to the journal tail.
    async fn recover(&self) -> Result<()> {
        warn!("clearing journal cursor, seeking to tail");

        self.store.set_journal_cursor("").await?;

        let tail = self.journal.tail_cursor().await?;

        *self.cursor.lock().await = Some(tail);

        Ok(())
    }

    async fn process_entry(&self, entry: &JournalEntry) {
        if self
            .config
            .filter
            .iter()
            .any(|needle| !needle.is_empty() && entry.message.contains(needle))
        {
            debug!(message = %entry.message, "alert dropped by filter");

            return;
        }

        let unit = resolve_unit(entry);

        if let Some(instance_id) = Runner::instance_id_from_unit(unit) {
            if entry.priority <= self.config.service_alert_priority {
                self.send_instance_alert(instance_id, &entry.message).await;
            }

            return;
        }

        if entry.priority > self.config.system_alert_priority && entry.systemd_unit != INIT_SCOPE {
            return;
        }

        if let Some(component) = core_component(unit) {
            self.outbound
                .send_alert(Alert::Core {
                    core_component: component.to_string(),
                    message: entry.message.clone(),
                })
                .await;

            return;
        }

        self.outbound
            .send_alert(Alert::System {
                message: entry.message.clone(),
            })
            .await;
    }

    async fn send_instance_alert(&self, instance_id: &str, message: &str) {
        let Some((ident, version)) = self.instance_info(instance_id).await else {
            warn!(instance_id, "alert for unknown instance");

            return;
        };

        self.outbound
            .send_alert(Alert::ServiceInstance {
                ident,
                service_version: version,
                message: message.to_string(),
            })
            .await;
    }

    async fn instance_info(&self, instance_id: &str) -> Option<(InstanceIdent, String)> {
        let instances = self.store.get_all_instances().await.ok()?;

        instances
            .into_iter()
            .find(|entry| entry.ident.instance_id() == instance_id)
            .map(|entry| (entry.ident, entry.service_version))
    }
}

/// Unit owning an entry: the explicit unit field, or the unit segment of
/// the cgroup path.
fn resolve_unit(entry: &JournalEntry) -> &str {
    if !entry.systemd_unit.is_empty() {
        return &entry.systemd_unit;
    }

    entry
        .systemd_cgroup
        .rsplit('/')
        .find(|segment| segment.ends_with(".service"))
        .unwrap_or(&entry.systemd_cgroup)
}

/// Aos core component name for units like `aos-updatemanager.service`.
fn core_component(unit: &str) -> Option<&str> {
    let name = unit.strip_suffix(".service")?;
    let component = name.strip_prefix(CORE_COMPONENT_PREFIX)?;

    if component.contains('@') {
        return None;
    }

    Some(component)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::tests::MockJournal;
    use crate::smclient::{outbound_channel, OutboundReceivers, OutgoingMessage};
    use crate::storage::InstanceEntry;
    use crate::types::{NetworkParameters, RunState};

    fn entry(message: &str, unit: &str, priority: i32) -> JournalEntry {
        JournalEntry {
            message: message.to_string(),
            systemd_unit: unit.to_string(),
            priority,
            ..Default::default()
        }
    }

    async fn setup() -> (Arc<JournalAlerts>, Arc<MockJournal>, Arc<Store>, OutboundReceivers) {
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

        let journal = Arc::new(MockJournal::default());
        let (outbound, receivers) = outbound_channel();

        let alerts = Arc::new(JournalAlerts::new(
            JournalAlertsConfig {
                filter: vec!["ignored".to_string()],
                service_alert_priority: 4,
                system_alert_priority: 3,
            },
            Arc::clone(&store),
            journal.clone(),
            outbound,
            Duration::from_secs(3600),
        ));

        alerts.start().await.unwrap();

        (alerts, journal, store, receivers)
    }

    fn drain_alerts(receivers: &mut OutboundReceivers) -> Vec<Alert> {
        let mut alerts = Vec::new();

        while let Ok(message) = receivers.messages.try_recv() {
            if let OutgoingMessage::Alert(alert) = message {
                alerts.push(alert);
            }
        }

        alerts
    }

    #[tokio::test]
    async fn classifies_alert_kinds() {
        let (alerts, journal, _store, mut receivers) = setup().await;

        journal.push(entry("service crashed", "aos-service@svc_sub_0.service", 2));
        journal.push(entry("core hiccup", "aos-updatemanager.service", 2));
        journal.push(entry("disk trouble", "kernel.service", 2));
        journal.push(entry("too verbose", "kernel.service", 6));
        journal.push(entry("this is ignored noise", "kernel.service", 1));

        alerts.poll_journal().await.unwrap();

        let collected = drain_alerts(&mut receivers);
        assert_eq!(collected.len(), 3);

        assert!(matches!(
            &collected[0],
            Alert::ServiceInstance { ident, service_version, .. }
                if ident.service_id == "svc" && service_version == "1.0"
        ));
        assert!(matches!(
            &collected[1],
            Alert::Core { core_component, .. } if core_component == "updatemanager"
        ));
        assert!(matches!(&collected[2], Alert::System { .. }));
    }

    #[tokio::test]
    async fn resolves_unit_from_cgroup() {
        let (alerts, journal, _store, mut receivers) = setup().await;

        journal.push(JournalEntry {
            message: "oom".to_string(),
            systemd_cgroup: "/system.slice/aos-service@svc_sub_0.service".to_string(),
            priority: 2,
            ..Default::default()
        });

        alerts.poll_journal().await.unwrap();

        let collected = drain_alerts(&mut receivers);
        assert!(matches!(&collected[0], Alert::ServiceInstance { .. }));
    }

    #[tokio::test]
    async fn cursor_persisted_on_stop_and_restored() {
        let (alerts, journal, store, _receivers) = setup().await;

        journal.push(entry("first", "kernel.service", 1));
        alerts.poll_journal().await.unwrap();
        alerts.stop().await.unwrap();

        let saved = store.get_journal_cursor().await.unwrap().unwrap();
        assert_eq!(saved, "c1");

        // A new pipeline resumes after the saved cursor.
        let journal2 = Arc::new(MockJournal::default());
        journal2.push(entry("first", "kernel.service", 1));
        journal2.push(entry("second", "kernel.service", 1));

        let (outbound, mut receivers) = outbound_channel();
        let restarted = Arc::new(JournalAlerts::new(
            JournalAlertsConfig::default(),
            store,
            journal2,
            outbound,
            Duration::from_secs(3600),
        ));

        restarted.start().await.unwrap();
        restarted.poll_journal().await.unwrap();

        let collected = drain_alerts(&mut receivers);
        assert_eq!(collected.len(), 1);
        assert!(matches!(&collected[0], Alert::System { message } if message == "second"));
    }

    #[tokio::test]
    async fn read_failure_recovers_to_tail() {
        let (alerts, journal, store, mut receivers) = setup().await;

        journal.push(entry("before failure", "kernel.service", 1));
        journal.fail_next_reads(1);

        assert!(alerts.poll_journal().await.is_err());
        alerts.recover().await.unwrap();

        // Cursor was cleared in the store and re-seeked to the tail.
        assert_eq!(store.get_journal_cursor().await.unwrap().as_deref(), Some(""));

        journal.push(entry("after recovery", "kernel.service", 1));
        alerts.poll_journal().await.unwrap();

        let collected = drain_alerts(&mut receivers);
        assert_eq!(collected.len(), 1);
        assert!(matches!(&collected[0], Alert::System { message } if message == "after recovery"));
    }
}
