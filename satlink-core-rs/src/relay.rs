//! Hub-side event relay
//!
//! Polls one satellite for its accumulated events and republishes them on the hub's
//! bus. The loop ends when the link drops or a poll goes unanswered; whether that
//! is fatal depends on the link's disconnect flag.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::HubConfig;
use crate::interfaces::{DisconnectFlag, EventSink};
use crate::rpc::{methods, ConnectionState, RpcChannel};
use crate::types::{Event, EventBatch, FaultEvent};

/// Why a relay loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    /// The satellite went away after an update or reset we asked for
    Expected,
    /// The satellite vanished; the hub cannot keep driving it
    Unexpected,
}

pub struct EventRelay {
    channel: Arc<dyn RpcChannel>,
    sink: Arc<dyn EventSink>,
    disconnect: DisconnectFlag,
    poll_timeout: Duration,
    poll_interval: Duration,
}

impl EventRelay {
    pub fn new(
        channel: Arc<dyn RpcChannel>,
        sink: Arc<dyn EventSink>,
        disconnect: DisconnectFlag,
        config: &HubConfig,
    ) -> Self {
        Self {
            channel,
            sink,
            disconnect,
            poll_timeout: config.poll_timeout,
            poll_interval: config.poll_interval,
        }
    }

    /// Poll until the link ends
    pub async fn run(&self) -> RelayExit {
        info!("Relaying satellite events");

        while self.channel.connection_state() == ConnectionState::Connected {
            let poll = self
                .channel
                .call(methods::RETRIEVE_EVENTS_AND_ERRORS, vec![]);

            match tokio::time::timeout(self.poll_timeout, poll).await {
                Err(_) => {
                    warn!("Event poll unanswered for {:?}", self.poll_timeout);
                    break;
                }
                Ok(Err(e)) => {
                    warn!("Event poll failed: {}", e);
                    break;
                }
                Ok(Ok(reply)) => self.republish(reply),
            }

            tokio::time::sleep(self.poll_interval).await;
        }

        if self.disconnect.is_expected() {
            info!("Satellite disconnected as expected");
            RelayExit::Expected
        } else {
            error!("Satellite disconnected unexpectedly");
            RelayExit::Unexpected
        }
    }

    fn republish(&self, reply: Value) {
        let batch: EventBatch = match serde_json::from_value(reply) {
            Ok(batch) => batch,
            Err(e) => {
                warn!("Malformed event batch: {}", e);
                return;
            }
        };

        for record in batch.vars {
            let tag = format!("{}/{}", record.interface, record.var);
            match Event::from_record(record) {
                Ok(Some(event)) => {
                    debug!("Relaying {}", tag);
                    self.sink.publish(event);
                }
                Ok(None) => debug!("Ignoring unknown variable {}", tag),
                Err(e) => warn!("Malformed value for {}: {}", tag, e),
            }
        }

        for fault in batch.errors {
            match fault {
                FaultEvent::Raise(fault) => self.sink.raise_fault(fault),
                FaultEvent::Clear(fault) => self.sink.clear_fault(fault),
            }
        }
    }
}
