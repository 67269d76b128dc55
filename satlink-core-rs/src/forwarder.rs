//! Hub-side command forwarders
//!
//! Proxies that implement the local command traits by issuing one call on the
//! satellite link per command. No retries happen here: a failed call is the
//! caller's error.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::interfaces::{DisconnectFlag, EnergyApi, EvseManagerApi, EventSink, SystemApi};
use crate::rpc::{methods, Params, RpcChannel};
use crate::types::*;

async fn invoke<T: DeserializeOwned>(
    channel: &dyn RpcChannel,
    method: &str,
    params: Params,
) -> Result<T> {
    let reply = channel.call(method, params).await?;
    Ok(serde_json::from_value(reply)?)
}

/// `system` commands of one satellite
pub struct RemoteSystem {
    channel: Arc<dyn RpcChannel>,
    disconnect: DisconnectFlag,
}

impl RemoteSystem {
    pub fn new(channel: Arc<dyn RpcChannel>, disconnect: DisconnectFlag) -> Self {
        Self {
            channel,
            disconnect,
        }
    }
}

#[async_trait]
impl SystemApi for RemoteSystem {
    async fn update_firmware(&self, request: FirmwareUpdateRequest) -> Result<UpdateFirmwareResponse> {
        let response: UpdateFirmwareResponse = invoke(
            self.channel.as_ref(),
            methods::SYSTEM_UPDATE_FIRMWARE,
            vec![serde_json::to_value(&request)?],
        )
        .await?;

        // an accepted update ends with the satellite rebooting
        if response == UpdateFirmwareResponse::Accepted {
            info!("Satellite accepted firmware update {}, disconnect expected", request.request_id);
            self.disconnect.expect();
        }

        Ok(response)
    }

    async fn allow_firmware_installation(&self) -> Result<()> {
        invoke(
            self.channel.as_ref(),
            methods::SYSTEM_ALLOW_FIRMWARE_INSTALLATION,
            vec![],
        )
        .await
    }

    async fn upload_logs(&self, request: UploadLogsRequest) -> Result<UploadLogsResponse> {
        invoke(
            self.channel.as_ref(),
            methods::SYSTEM_UPLOAD_LOGS,
            vec![serde_json::to_value(&request)?],
        )
        .await
    }

    async fn is_reset_allowed(&self, reset_type: ResetType) -> Result<bool> {
        invoke(
            self.channel.as_ref(),
            methods::SYSTEM_IS_RESET_ALLOWED,
            vec![serde_json::to_value(reset_type)?],
        )
        .await
    }

    async fn reset(&self, reset_type: ResetType, scheduled: bool) -> Result<()> {
        // the link may drop before the reply arrives
        self.disconnect.expect();
        info!("Resetting satellite ({}), disconnect expected", reset_type);

        invoke(
            self.channel.as_ref(),
            methods::SYSTEM_RESET,
            vec![serde_json::to_value(reset_type)?, json!(scheduled)],
        )
        .await
    }

    async fn set_system_time(&self, timestamp: String) -> Result<bool> {
        invoke(
            self.channel.as_ref(),
            methods::SYSTEM_SET_SYSTEM_TIME,
            vec![json!(timestamp)],
        )
        .await
    }

    async fn get_boot_reason(&self) -> Result<BootReason> {
        invoke(self.channel.as_ref(), methods::SYSTEM_GET_BOOT_REASON, vec![]).await
    }
}

/// `evse_manager` commands of one satellite
pub struct RemoteEvseManager {
    channel: Arc<dyn RpcChannel>,
}

impl RemoteEvseManager {
    pub fn new(channel: Arc<dyn RpcChannel>) -> Self {
        Self { channel }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Params) -> Result<T> {
        invoke(self.channel.as_ref(), method, params).await
    }
}

#[async_trait]
impl EvseManagerApi for RemoteEvseManager {
    async fn get_evse(&self) -> Result<Value> {
        self.call(methods::EVSE_GET_EVSE, vec![]).await
    }

    async fn enable_disable(&self, connector_id: i32, cmd_source: Value) -> Result<bool> {
        self.call(methods::EVSE_ENABLE_DISABLE, vec![json!(connector_id), cmd_source])
            .await
    }

    async fn authorize_response(&self, provided_token: Value, validation_result: Value) -> Result<()> {
        self.call(
            methods::EVSE_AUTHORIZE_RESPONSE,
            vec![provided_token, validation_result],
        )
        .await
    }

    async fn withdraw_authorization(&self) -> Result<()> {
        self.call(methods::EVSE_WITHDRAW_AUTHORIZATION, vec![]).await
    }

    async fn reserve(&self, reservation_id: i32) -> Result<bool> {
        self.call(methods::EVSE_RESERVE, vec![json!(reservation_id)]).await
    }

    async fn cancel_reservation(&self) -> Result<()> {
        self.call(methods::EVSE_CANCEL_RESERVATION, vec![]).await
    }

    async fn set_faulted(&self) -> Result<()> {
        self.call(methods::EVSE_SET_FAULTED, vec![]).await
    }

    async fn pause_charging(&self) -> Result<bool> {
        self.call(methods::EVSE_PAUSE_CHARGING, vec![]).await
    }

    async fn resume_charging(&self) -> Result<bool> {
        self.call(methods::EVSE_RESUME_CHARGING, vec![]).await
    }

    async fn stop_transaction(&self, request: Value) -> Result<bool> {
        self.call(methods::EVSE_STOP_TRANSACTION, vec![request]).await
    }

    async fn force_unlock(&self, connector_id: i32) -> Result<bool> {
        self.call(methods::EVSE_FORCE_UNLOCK, vec![json!(connector_id)]).await
    }

    async fn set_external_limits(&self, limits: Value) -> Result<bool> {
        self.call(methods::EVSE_SET_EXTERNAL_LIMITS, vec![limits]).await
    }

    async fn switch_three_phases_while_charging(&self, three_phases: bool) -> Result<()> {
        self.call(methods::EVSE_SWITCH_THREE_PHASES, vec![json!(three_phases)])
            .await
    }

    async fn set_get_certificate_response(&self, certificate_response: Value) -> Result<()> {
        self.call(
            methods::EVSE_SET_CERTIFICATE_RESPONSE,
            vec![certificate_response],
        )
        .await
    }

    async fn external_ready_to_start_charging(&self) -> Result<bool> {
        self.call(methods::EVSE_EXTERNAL_READY, vec![]).await
    }
}

/// `energy` commands of one satellite
pub struct RemoteEnergy {
    channel: Arc<dyn RpcChannel>,
}

impl RemoteEnergy {
    pub fn new(channel: Arc<dyn RpcChannel>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl EnergyApi for RemoteEnergy {
    async fn enforce_limits(&self, limits: Value) -> Result<()> {
        invoke(
            self.channel.as_ref(),
            methods::ENERGY_ENFORCE_LIMITS,
            vec![limits],
        )
        .await
    }
}

/// Publishes hub-side events on the satellite's bus through `push-var`.
///
/// A single sender task keeps the pushes in publish order.
pub struct RemotePush {
    tx: mpsc::UnboundedSender<EventRecord>,
}

impl RemotePush {
    pub fn spawn(channel: Arc<dyn RpcChannel>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<EventRecord>();

        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let tag = format!("{}/{}", record.interface, record.var);
                let value = match serde_json::to_value(&record) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!("Failed to encode {}: {}", tag, e);
                        continue;
                    }
                };

                match channel.call(methods::PUSH_VAR, vec![value]).await {
                    Ok(_) => debug!("Pushed {}", tag),
                    Err(e) => warn!("Failed to push {}: {}", tag, e),
                }
            }
        });

        Self { tx }
    }
}

impl EventSink for RemotePush {
    fn publish(&self, event: Event) {
        match event.to_record() {
            Ok(record) => {
                if self.tx.send(record).is_err() {
                    debug!("Push task gone, dropping event");
                }
            }
            Err(e) => warn!("Failed to encode event: {}", e),
        }
    }
}
