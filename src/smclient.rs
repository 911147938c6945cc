//! Long-lived bidirectional stream to the communication manager.
//!
//! Inbound messages are dispatched to the launcher, network manager, log
//! provider and resource monitor. Outbound traffic goes through a bounded
//! queue that is lossless for alerts, run status and logs; monitoring
//! samples coalesce to the newest one. On disconnect the client retries
//! with exponential backoff starting at the reconnect timeout, capped at
//! five times that.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Endpoint;
use tracing::{debug, error, info, warn};

use crate::config::SmClientConfig;
use crate::error::{Error, Result};
use crate::launcher::Launcher;
use crate::logprovider::{LogKind, LogProvider, LogRequest};
use crate::monitoring::ResourceMonitor;
use crate::network::NetworkManager;
use crate::proto;
use crate::proto::sm_service_client::SmServiceClient;
use crate::types::{Alert, EnvVarInfo, EnvVarOverrides, InstanceStatus, NodeMonitoringData};

const OUTBOUND_QUEUE_SIZE: usize = 64;
const STREAM_BUFFER: usize = 16;
const BACKOFF_CAP_MULTIPLIER: u32 = 5;

/// Messages queued losslessly for the CM.
#[derive(Debug)]
pub enum OutgoingMessage {
    RunInstancesStatus(Vec<InstanceStatus>),
    UpdateInstancesStatus(Vec<InstanceStatus>),
    Alert(Alert),
    Log(proto::LogData),
    NodeConfigStatus {
        version: String,
        error: Option<proto::ErrorInfo>,
    },
}

/// Producer half of the outbound queue, cloned into every component that
/// reports upstream.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::Sender<OutgoingMessage>,
    monitoring: Arc<watch::Sender<Option<proto::NodeMonitoringData>>>,
}

/// Consumer half, owned by the SM client write loop.
pub struct OutboundReceivers {
    pub messages: mpsc::Receiver<OutgoingMessage>,
    pub monitoring: watch::Receiver<Option<proto::NodeMonitoringData>>,
}

pub fn outbound_channel() -> (Outbound, OutboundReceivers) {
    let (tx, messages) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
    let (monitoring_tx, monitoring) = watch::channel(None);

    (
        Outbound {
            tx,
            monitoring: Arc::new(monitoring_tx),
        },
        OutboundReceivers {
            messages,
            monitoring,
        },
    )
}

impl Outbound {
    pub async fn send_run_instances_status(&self, statuses: Vec<InstanceStatus>) {
        let _ = self
            .tx
            .send(OutgoingMessage::RunInstancesStatus(statuses))
            .await;
    }

    pub async fn send_update_instances_status(&self, statuses: Vec<InstanceStatus>) {
        let _ = self
            .tx
            .send(OutgoingMessage::UpdateInstancesStatus(statuses))
            .await;
    }

    pub async fn send_alert(&self, alert: Alert) {
        let _ = self.tx.send(OutgoingMessage::Alert(alert)).await;
    }

    pub async fn send_log(&self, log: proto::LogData) {
        let _ = self.tx.send(OutgoingMessage::Log(log)).await;
    }

    pub async fn send_node_config_status(
        &self,
        version: String,
        error: Option<proto::ErrorInfo>,
    ) {
        let _ = self
            .tx
            .send(OutgoingMessage::NodeConfigStatus { version, error })
            .await;
    }

    /// Replaces any not-yet-sent monitoring sample with this one.
    pub fn send_monitoring(&self, data: NodeMonitoringData) {
        self.monitoring.send_replace(Some((&data).into()));
    }
}

fn to_wire(message: OutgoingMessage) -> proto::SmOutgoingMessages {
    use proto::sm_outgoing_messages::SmOutgoingMessage as Out;

    let inner = match message {
        OutgoingMessage::RunInstancesStatus(statuses) => {
            Out::RunInstancesStatus(proto::RunInstancesStatus {
                instances: statuses.iter().map(Into::into).collect(),
            })
        }
        OutgoingMessage::UpdateInstancesStatus(statuses) => {
            Out::UpdateInstancesStatus(proto::UpdateInstancesStatus {
                instances: statuses.iter().map(Into::into).collect(),
            })
        }
        OutgoingMessage::Alert(alert) => Out::Alert(proto::Alert {
            alert: Some((&alert).into()),
        }),
        OutgoingMessage::Log(log) => Out::LogData(log),
        OutgoingMessage::NodeConfigStatus { version, error } => {
            Out::NodeConfigStatus(proto::NodeConfigStatus {
                version,
                error_info: error,
            })
        }
    };

    proto::SmOutgoingMessages {
        sm_outgoing_message: Some(inner),
    }
}

fn from_timestamp(ts: &prost_types::Timestamp) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(ts.seconds, ts.nanos.max(0) as u32).single()
}

fn log_request(kind: LogKind, log_id: String, filter: Option<proto::LogFilter>) -> LogRequest {
    let filter = filter.unwrap_or_default();

    LogRequest {
        log_id,
        kind,
        from: filter.from.as_ref().and_then(from_timestamp),
        till: filter.till.as_ref().and_then(from_timestamp),
        filter: filter.instance_filter.map(Into::into).unwrap_or_default(),
    }
}

fn env_overrides(message: proto::OverrideEnvVars) -> EnvVarOverrides {
    let mut overrides = EnvVarOverrides::new();

    for entry in message.env_vars {
        let filter = entry.instance_filter.map(Into::into).unwrap_or_default();

        let variables = entry
            .variables
            .into_iter()
            .map(|v| EnvVarInfo {
                name: v.name,
                value: v.value,
                ttl: v.ttl.as_ref().and_then(from_timestamp),
            })
            .collect();

        overrides.insert(filter, variables);
    }

    overrides
}

pub struct SmClient {
    config: SmClientConfig,
    launcher: Arc<Launcher>,
    network: Arc<NetworkManager>,
    log_provider: Arc<LogProvider>,
    monitor: Arc<ResourceMonitor>,
    node_config_version: String,
    receivers: Mutex<OutboundReceivers>,
    outbound: Outbound,
}

impl SmClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SmClientConfig,
        launcher: Arc<Launcher>,
        network: Arc<NetworkManager>,
        log_provider: Arc<LogProvider>,
        monitor: Arc<ResourceMonitor>,
        node_config_version: String,
        outbound: Outbound,
        receivers: OutboundReceivers,
    ) -> Self {
        Self {
            config,
            launcher,
            network,
            log_provider,
            monitor,
            node_config_version,
            receivers: Mutex::new(receivers),
            outbound,
        }
    }

    /// Connection loop: connect, serve the stream, back off and retry.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let min_backoff = self.config.cm_reconnect_timeout;
        let max_backoff = min_backoff * BACKOFF_CAP_MULTIPLIER;
        let mut backoff = min_backoff;

        loop {
            let mut connected = false;

            tokio::select! {
                _ = shutdown.changed() => return,
                result = self.serve_stream(&mut connected) => {
                    if let Err(err) = result {
                        warn!(%err, "CM stream failed");
                    }
                }
            }

            if connected {
                backoff = min_backoff;
            }

            debug!(backoff = ?backoff, "reconnecting to CM");

            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(backoff) => {}
            }

            backoff = (backoff * 2).min(max_backoff);
        }
    }

    async fn serve_stream(&self, connected: &mut bool) -> Result<()> {
        let url = if self.config.cm_server_url.contains("://") {
            self.config.cm_server_url.clone()
        } else {
            format!("http://{}", self.config.cm_server_url)
        };

        info!(url = %url, "connecting to CM");

        let channel = Endpoint::from_shared(url)
            .map_err(|err| Error::InvalidArgument(format!("bad CM url: {err}")))?
            .connect_timeout(Duration::from_secs(10))
            .connect()
            .await?;

        let mut client = SmServiceClient::new(channel);

        let (stream_tx, stream_rx) = mpsc::channel::<proto::SmOutgoingMessages>(STREAM_BUFFER);
        let mut inbound = client
            .register_sm(ReceiverStream::new(stream_rx))
            .await?
            .into_inner();

        *connected = true;
        info!("CM stream established");

        // Admission: announce the node config version before anything else.
        stream_tx
            .send(to_wire(OutgoingMessage::NodeConfigStatus {
                version: self.node_config_version.clone(),
                error: None,
            }))
            .await
            .map_err(|_| Error::Network("stream write closed".into()))?;

        let mut receivers = self.receivers.lock().await;
        let OutboundReceivers { messages, monitoring } = &mut *receivers;

        loop {
            tokio::select! {
                biased;

                message = messages.recv() => {
                    let Some(message) = message else {
                        return Err(Error::Failed("outbound queue closed".into()));
                    };

                    stream_tx
                        .send(to_wire(message))
                        .await
                        .map_err(|_| Error::Network("stream write closed".into()))?;
                }

                changed = monitoring.changed() => {
                    if changed.is_err() {
                        return Err(Error::Failed("monitoring channel closed".into()));
                    }

                    let sample = monitoring.borrow_and_update().clone();

                    if let Some(sample) = sample {
                        stream_tx
                            .send(proto::SmOutgoingMessages {
                                sm_outgoing_message: Some(
                                    proto::sm_outgoing_messages::SmOutgoingMessage::NodeMonitoringData(sample),
                                ),
                            })
                            .await
                            .map_err(|_| Error::Network("stream write closed".into()))?;
                    }
                }

                incoming = inbound.message() => {
                    match incoming? {
                        Some(message) => self.dispatch(message).await,
                        None => return Err(Error::Network("CM closed the stream".into())),
                    }
                }
            }
        }
    }

    async fn dispatch(&self, message: proto::SmIncomingMessages) {
        use proto::sm_incoming_messages::SmIncomingMessage as In;

        let Some(message) = message.sm_incoming_message else {
            return;
        };

        match message {
            In::RunInstances(msg) => {
                self.launcher.run_instances(msg.into()).await;
            }
            In::UpdateNetworks(msg) => {
                self.network
                    .update_networks(msg.networks.into_iter().map(Into::into).collect())
                    .await;
            }
            In::OverrideEnvVars(msg) => {
                if let Err(err) = self.launcher.override_env_vars(env_overrides(msg)).await {
                    error!(%err, "env var override failed");
                }
            }
            In::SystemLogRequest(msg) => {
                self.log_provider
                    .request_log(log_request(LogKind::System, msg.log_id, msg.filter));
            }
            In::InstanceLogRequest(msg) => {
                self.log_provider
                    .request_log(log_request(LogKind::Instance, msg.log_id, msg.filter));
            }
            In::InstanceCrashLogRequest(msg) => {
                self.log_provider.request_log(log_request(
                    LogKind::InstanceCrash,
                    msg.log_id,
                    msg.filter,
                ));
            }
            In::GetNodeMonitoring(_) => match self.monitor.node_monitoring().await {
                Ok(data) => self.outbound.send_monitoring(data),
                Err(err) => error!(%err, "node monitoring request failed"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InstanceFilter, InstanceIdent, RunState};

    #[tokio::test]
    async fn lossless_queue_preserves_order_across_disconnect() {
        let (outbound, mut receivers) = outbound_channel();

        outbound
            .send_run_instances_status(vec![InstanceStatus {
                ident: InstanceIdent::new("svc", "sub", 0),
                service_version: "1.0".to_string(),
                run_state: RunState::Active,
                error: None,
            }])
            .await;
        outbound
            .send_alert(Alert::System {
                message: "one".to_string(),
            })
            .await;
        outbound
            .send_alert(Alert::System {
                message: "two".to_string(),
            })
            .await;

        // The consumer (stream loop) may come and go; the queue holds the
        // messages in order meanwhile.
        assert!(matches!(
            receivers.messages.recv().await.unwrap(),
            OutgoingMessage::RunInstancesStatus(_)
        ));
        assert!(matches!(
            receivers.messages.recv().await.unwrap(),
            OutgoingMessage::Alert(Alert::System { message }) if message == "one"
        ));
        assert!(matches!(
            receivers.messages.recv().await.unwrap(),
            OutgoingMessage::Alert(Alert::System { message }) if message == "two"
        ));
    }

    #[tokio::test]
    async fn monitoring_keeps_only_newest_sample() {
        let (outbound, mut receivers) = outbound_channel();

        let mut sample = NodeMonitoringData::default();
        sample.node.ram = 1;
        outbound.send_monitoring(sample);

        let mut sample = NodeMonitoringData::default();
        sample.node.ram = 2;
        outbound.send_monitoring(sample);

        receivers.monitoring.changed().await.unwrap();
        let received = receivers.monitoring.borrow_and_update().clone().unwrap();

        assert_eq!(received.node_monitoring.unwrap().ram, 2);
        assert!(!receivers.monitoring.has_changed().unwrap());
    }

    #[test]
    fn wire_conversion_carries_error_info() {
        let message = OutgoingMessage::RunInstancesStatus(vec![InstanceStatus {
            ident: InstanceIdent::new("svc", "sub", 0),
            service_version: "1.0".to_string(),
            run_state: RunState::Failed,
            error: Some(proto::ErrorInfo {
                aos_code: 1,
                exit_code: 2,
                message: "failed".to_string(),
            }),
        }]);

        let wire = to_wire(message);

        match wire.sm_outgoing_message.unwrap() {
            proto::sm_outgoing_messages::SmOutgoingMessage::RunInstancesStatus(status) => {
                assert_eq!(status.instances[0].run_state, "failed");
                assert_eq!(status.instances[0].error_info.as_ref().unwrap().exit_code, 2);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn env_override_conversion() {
        let message = proto::OverrideEnvVars {
            env_vars: vec![proto::OverrideEnvVar {
                instance_filter: Some(proto::InstanceFilter {
                    service_id: Some("svc".to_string()),
                    subject_id: None,
                    instance: None,
                }),
                variables: vec![proto::EnvVarInfo {
                    name: "LOG_LEVEL".to_string(),
                    value: "debug".to_string(),
                    ttl: None,
                }],
            }],
        };

        let overrides = env_overrides(message);
        let filter = InstanceFilter {
            service_id: Some("svc".to_string()),
            ..Default::default()
        };

        assert_eq!(overrides[&filter][0].name, "LOG_LEVEL");
    }
}
