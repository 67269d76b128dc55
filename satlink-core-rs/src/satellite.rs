//! Satellite agent
//!
//! Lifecycle:
//! 1. `start` binds the handshake calls and listens for the hub
//! 2. `init` waits for the hub's `announce`, registers the command bindings and
//!    rendezvous with the hub's `peer-ready`
//! 3. `ready` runs the hub liveness watchdog
//!
//! Local events reach the hub through the accumulator returned by `event_sink`.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::accumulator::{EventAccumulator, PushOutcome};
use crate::config::SatelliteConfig;
use crate::error::{Error, Result, RpcError};
use crate::handshake::{AnnounceOutcome, LinkState, LinkStateMachine, ReadyOutcome};
use crate::interfaces::{
    DisconnectFlag, EnergyApi, EventSink, EvseManagerApi, Restarter, SystemApi,
};
use crate::rpc::{methods, param, Params, RpcServer};
use crate::types::*;
use crate::watchdog::{Watchdog, WatchdogExit};

/// The satellite's own charging stack
#[derive(Clone)]
pub struct LocalSubsystems {
    pub system: Arc<dyn SystemApi>,
    pub evse_manager: Arc<dyn EvseManagerApi>,
    pub energy: Arc<dyn EnergyApi>,
    /// Local bus receiving the variables pushed by the hub
    pub bus: Arc<dyn EventSink>,
}

/// Queues local events for the hub and requests a restart on overflow
pub struct AccumulatorSink {
    accumulator: Arc<EventAccumulator>,
    restarter: Arc<dyn Restarter>,
}

impl AccumulatorSink {
    fn handle(&self, outcome: PushOutcome) {
        if outcome != PushOutcome::Overflow {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let restarter = self.restarter.clone();
                runtime.spawn(async move { restarter.restart().await });
            }
            Err(_) => error!("Event overflow outside of a runtime, cannot restart"),
        }
    }
}

impl EventSink for AccumulatorSink {
    fn publish(&self, event: Event) {
        match event.to_record() {
            Ok(record) => self.handle(self.accumulator.push(record)),
            Err(e) => warn!("Failed to encode local event: {}", e),
        }
    }

    fn raise_fault(&self, fault: Fault) {
        self.handle(self.accumulator.push_fault(FaultEvent::Raise(fault)));
    }

    fn clear_fault(&self, fault: Fault) {
        self.handle(self.accumulator.push_fault(FaultEvent::Clear(fault)));
    }
}

pub struct SatelliteAgent {
    config: SatelliteConfig,
    server: RpcServer,
    link: Arc<LinkStateMachine>,
    accumulator: Arc<EventAccumulator>,
    disconnect: DisconnectFlag,
    restarter: Arc<dyn Restarter>,
    local: LocalSubsystems,
}

impl SatelliteAgent {
    pub fn new(config: SatelliteConfig, local: LocalSubsystems, restarter: Arc<dyn Restarter>) -> Self {
        let accumulator = Arc::new(EventAccumulator::new(config.accumulator_capacity));

        Self {
            config,
            server: RpcServer::new(),
            link: Arc::new(LinkStateMachine::new()),
            accumulator,
            disconnect: DisconnectFlag::new(),
            restarter,
            local,
        }
    }

    /// Sink for every event the local stack produces
    pub fn event_sink(&self) -> Arc<dyn EventSink> {
        Arc::new(AccumulatorSink {
            accumulator: self.accumulator.clone(),
            restarter: self.restarter.clone(),
        })
    }

    pub fn link_state(&self) -> LinkState {
        self.link.state()
    }

    pub fn disconnect_flag(&self) -> DisconnectFlag {
        self.disconnect.clone()
    }

    /// Bind the handshake calls and listen; returns the bound address
    pub async fn start(&self) -> Result<SocketAddr> {
        self.bind_handshake();
        let addr = self
            .server
            .listen(&format!("0.0.0.0:{}", self.config.port))
            .await?;
        Ok(addr)
    }

    /// Complete the handshake with the hub
    pub async fn init(&self) -> Result<()> {
        info!("Waiting for the hub to announce itself...");
        self.link.wait_announced().await?;

        self.bind_commands();
        self.link.self_ready()?;
        info!("Command bindings registered, waiting for the hub");

        self.link.wait_active().await?;
        info!("Link to hub active");
        Ok(())
    }

    /// Watch hub liveness until the link ends
    pub async fn ready(&self) -> WatchdogExit {
        Watchdog::new(
            self.accumulator.clone(),
            self.disconnect.clone(),
            self.restarter.clone(),
            self.config.watchdog_timeout,
        )
        .run()
        .await
    }

    pub fn stop(&self) {
        self.server.stop();
    }

    fn bind_handshake(&self) {
        let link = self.link.clone();
        let restarter = self.restarter.clone();
        let grace = self.config.restart_grace;
        self.server.bind(methods::ANNOUNCE, move |_, ctl| {
            let link = link.clone();
            let restarter = restarter.clone();
            async move {
                let outcome = link.announce();
                match outcome {
                    AnnounceOutcome::Fresh => info!("Hub announced itself"),
                    AnnounceOutcome::Desync => {
                        warn!("Hub announced itself again, it lost its state; restarting");
                        ctl.post_exit();
                        ctl.stop_server();
                        schedule_restart(restarter, grace);
                    }
                    AnnounceOutcome::AlreadyTornDown => debug!("Announce during teardown"),
                }
                Ok(json!(outcome.seen_before()))
            }
        });

        let link = self.link.clone();
        self.server.bind(methods::PEER_READY, move |_, _| {
            let link = link.clone();
            async move {
                match link.peer_ready() {
                    ReadyOutcome::Accepted => {
                        link.wait_self_ready()
                            .await
                            .map_err(|e| RpcError::Remote(e.to_string()))?;
                    }
                    ReadyOutcome::Duplicate => warn!("Hub signaled ready twice, ignoring"),
                    ReadyOutcome::NotAnnounced => {
                        warn!("Hub signaled ready before announcing itself, ignoring")
                    }
                    ReadyOutcome::TornDown => debug!("Ready during teardown"),
                }
                Ok(Value::Null)
            }
        });

        let link = self.link.clone();
        let restarter = self.restarter.clone();
        let disconnect = self.disconnect.clone();
        let grace = self.config.restart_grace;
        self.server.bind(methods::GRACEFUL_EXIT, move |_, ctl| {
            let link = link.clone();
            let restarter = restarter.clone();
            let disconnect = disconnect.clone();
            async move {
                info!("Hub requested a graceful exit");
                disconnect.expect();
                ctl.post_exit();
                ctl.stop_server();
                if link.teardown() {
                    schedule_restart(restarter, grace);
                }
                Ok(Value::Null)
            }
        });
    }

    fn bind_commands(&self) {
        let accumulator = self.accumulator.clone();
        self.server.bind(methods::RETRIEVE_EVENTS, move |_, _| {
            let vars = accumulator.drain_vars();
            async move { Ok(serde_json::to_value(vars)?) }
        });

        let accumulator = self.accumulator.clone();
        self.server.bind(methods::RETRIEVE_EVENTS_AND_ERRORS, move |_, _| {
            let batch = accumulator.drain();
            async move { Ok(serde_json::to_value(batch)?) }
        });

        let bus = self.local.bus.clone();
        self.server.bind(methods::PUSH_VAR, move |params, _| {
            let bus = bus.clone();
            async move {
                let record: EventRecord = param(&params, 0)?;
                let tag = format!("{}/{}", record.interface, record.var);
                match Event::from_record(record) {
                    Ok(Some(event)) => bus.publish(event),
                    Ok(None) => debug!("Ignoring pushed variable {}", tag),
                    Err(e) => return Err(RpcError::InvalidParams(format!("{}: {}", tag, e))),
                }
                Ok(Value::Null)
            }
        });

        self.bind_energy();
        self.bind_evse_manager();
        self.bind_system();
    }

    fn bind_local<F, Fut, T>(&self, name: &str, handler: F)
    where
        F: Fn(LocalSubsystems, Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Serialize,
    {
        let local = self.local.clone();
        self.server.bind(name, move |params, _| {
            let call = handler(local.clone(), params);
            async move { reply(call.await) }
        });
    }

    fn bind_energy(&self) {
        self.bind_local(methods::ENERGY_ENFORCE_LIMITS, |local, params| async move {
            local.energy.enforce_limits(param(&params, 0)?).await
        });
    }

    fn bind_evse_manager(&self) {
        self.bind_local(methods::EVSE_GET_EVSE, |local, _| async move {
            local.evse_manager.get_evse().await
        });
        self.bind_local(methods::EVSE_ENABLE_DISABLE, |local, params| async move {
            local
                .evse_manager
                .enable_disable(param(&params, 0)?, param(&params, 1)?)
                .await
        });
        self.bind_local(methods::EVSE_AUTHORIZE_RESPONSE, |local, params| async move {
            local
                .evse_manager
                .authorize_response(param(&params, 0)?, param(&params, 1)?)
                .await
        });
        self.bind_local(methods::EVSE_WITHDRAW_AUTHORIZATION, |local, _| async move {
            local.evse_manager.withdraw_authorization().await
        });
        self.bind_local(methods::EVSE_RESERVE, |local, params| async move {
            local.evse_manager.reserve(param(&params, 0)?).await
        });
        self.bind_local(methods::EVSE_CANCEL_RESERVATION, |local, _| async move {
            local.evse_manager.cancel_reservation().await
        });
        self.bind_local(methods::EVSE_SET_FAULTED, |local, _| async move {
            local.evse_manager.set_faulted().await
        });
        self.bind_local(methods::EVSE_PAUSE_CHARGING, |local, _| async move {
            local.evse_manager.pause_charging().await
        });
        self.bind_local(methods::EVSE_RESUME_CHARGING, |local, _| async move {
            local.evse_manager.resume_charging().await
        });
        self.bind_local(methods::EVSE_STOP_TRANSACTION, |local, params| async move {
            local.evse_manager.stop_transaction(param(&params, 0)?).await
        });
        self.bind_local(methods::EVSE_FORCE_UNLOCK, |local, params| async move {
            local.evse_manager.force_unlock(param(&params, 0)?).await
        });
        self.bind_local(methods::EVSE_SET_EXTERNAL_LIMITS, |local, params| async move {
            local.evse_manager.set_external_limits(param(&params, 0)?).await
        });
        self.bind_local(methods::EVSE_SWITCH_THREE_PHASES, |local, params| async move {
            local
                .evse_manager
                .switch_three_phases_while_charging(param(&params, 0)?)
                .await
        });
        self.bind_local(methods::EVSE_SET_CERTIFICATE_RESPONSE, |local, params| async move {
            local
                .evse_manager
                .set_get_certificate_response(param(&params, 0)?)
                .await
        });
        self.bind_local(methods::EVSE_EXTERNAL_READY, |local, _| async move {
            local.evse_manager.external_ready_to_start_charging().await
        });
    }

    fn bind_system(&self) {
        let disconnect = self.disconnect.clone();
        self.bind_local(methods::SYSTEM_UPDATE_FIRMWARE, move |local, params| {
            let disconnect = disconnect.clone();
            async move {
                let request: FirmwareUpdateRequest = param(&params, 0)?;
                let response = local.system.update_firmware(request).await?;
                if response == UpdateFirmwareResponse::Accepted {
                    disconnect.expect();
                }
                Ok(response)
            }
        });
        self.bind_local(methods::SYSTEM_ALLOW_FIRMWARE_INSTALLATION, |local, _| async move {
            local.system.allow_firmware_installation().await
        });
        self.bind_local(methods::SYSTEM_UPLOAD_LOGS, |local, params| async move {
            local.system.upload_logs(param(&params, 0)?).await
        });
        self.bind_local(methods::SYSTEM_IS_RESET_ALLOWED, |local, params| async move {
            local.system.is_reset_allowed(param(&params, 0)?).await
        });

        let disconnect = self.disconnect.clone();
        self.bind_local(methods::SYSTEM_RESET, move |local, params| {
            let disconnect = disconnect.clone();
            async move {
                let reset_type: ResetType = param(&params, 0)?;
                let scheduled: bool = param(&params, 1)?;
                disconnect.expect();
                local.system.reset(reset_type, scheduled).await
            }
        });
        self.bind_local(methods::SYSTEM_SET_SYSTEM_TIME, |local, params| async move {
            local.system.set_system_time(param(&params, 0)?).await
        });
        self.bind_local(methods::SYSTEM_GET_BOOT_REASON, |local, _| async move {
            local.system.get_boot_reason().await
        });
    }
}

fn reply<T: Serialize>(result: Result<T>) -> std::result::Result<Value, RpcError> {
    match result {
        Ok(value) => Ok(serde_json::to_value(value)?),
        Err(Error::Rpc(e)) => Err(e),
        Err(e) => Err(RpcError::Remote(e.to_string())),
    }
}

fn schedule_restart(restarter: Arc<dyn Restarter>, grace: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        restarter.restart().await;
    });
}
