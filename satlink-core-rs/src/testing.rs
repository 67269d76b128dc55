//! In-memory doubles shared by the unit tests

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{Error, Result, RpcError};
use crate::interfaces::{EnergyApi, EventSink, EvseManagerApi, Restarter, SystemApi};
use crate::rpc::{ConnectionState, Connector, Params, RpcChannel};
use crate::types::*;

pub(crate) enum Reply {
    Result(std::result::Result<Value, RpcError>),
    Hang,
    Disconnect,
}

/// Scripted `RpcChannel`: queued replies per method, `Null` otherwise
#[derive(Default)]
pub(crate) struct MockChannel {
    calls: Mutex<Vec<(String, Params)>>,
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    defaults: Mutex<HashMap<String, Value>>,
    timeout: Mutex<Option<Duration>>,
    local_addr: Mutex<Option<SocketAddr>>,
    disconnected: AtomicBool,
    closed: AtomicBool,
}

impl MockChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, method: &str, result: std::result::Result<Value, RpcError>) {
        self.push(method, Reply::Result(result));
    }

    pub fn hang(&self, method: &str) {
        self.push(method, Reply::Hang);
    }

    pub fn disconnect_on(&self, method: &str) {
        self.push(method, Reply::Disconnect);
    }

    /// Reply used once the queue of `method` is empty
    pub fn default_reply(&self, method: &str, value: Value) {
        self.defaults.lock().insert(method.to_string(), value);
    }

    fn push(&self, method: &str, reply: Reply) {
        self.replies
            .lock()
            .entry(method.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn set_local_addr(&self, addr: SocketAddr) {
        *self.local_addr.lock() = Some(addr);
    }

    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    pub fn methods(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(m, _)| m.clone()).collect()
    }

    pub fn params_of(&self, method: &str) -> Vec<Params> {
        self.calls
            .lock()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn timeout(&self) -> Option<Duration> {
        *self.timeout.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RpcChannel for MockChannel {
    async fn call(&self, method: &str, params: Params) -> std::result::Result<Value, RpcError> {
        self.calls.lock().push((method.to_string(), params));

        if self.connection_state() == ConnectionState::Disconnected {
            return Err(RpcError::Closed);
        }

        let reply = self.replies.lock().get_mut(method).and_then(|q| q.pop_front());
        let reply = async move {
            match reply {
                Some(Reply::Result(result)) => result,
                Some(Reply::Hang) => std::future::pending().await,
                Some(Reply::Disconnect) => {
                    self.disconnect();
                    Err(RpcError::Closed)
                }
                None => Ok(self
                    .defaults
                    .lock()
                    .get(method)
                    .cloned()
                    .unwrap_or(Value::Null)),
            }
        };

        let limit = self.timeout();
        match limit {
            Some(limit) => tokio::time::timeout(limit, reply)
                .await
                .unwrap_or(Err(RpcError::Timeout)),
            None => reply.await,
        }
    }

    async fn notify(&self, method: &str, params: Params) -> std::result::Result<(), RpcError> {
        self.calls.lock().push((method.to_string(), params));
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        if self.disconnected.load(Ordering::SeqCst) || self.is_closed() {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Connected
        }
    }

    fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock() = Some(timeout);
    }

    fn clear_timeout(&self) {
        *self.timeout.lock() = None;
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out scripted channels, one per connect attempt
pub(crate) struct ScriptedConnector {
    script: Mutex<VecDeque<std::result::Result<Arc<MockChannel>, RpcError>>>,
    attempts: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new(script: Vec<std::result::Result<Arc<MockChannel>, RpcError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> std::result::Result<Arc<dyn RpcChannel>, RpcError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().pop_front() {
            Some(Ok(channel)) => Ok(channel),
            Some(Err(e)) => Err(e),
            None => Err(RpcError::Connect("script exhausted".to_string())),
        }
    }
}

/// Records everything published to it
#[derive(Default)]
pub(crate) struct RecordingSink {
    events: Mutex<Vec<Event>>,
    raised: Mutex<Vec<Fault>>,
    cleared: Mutex<Vec<Fault>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn firmware_statuses(&self) -> Vec<FirmwareUpdateStatusEnum> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::FirmwareUpdateStatus(s) => Some(s.firmware_update_status),
                _ => None,
            })
            .collect()
    }

    pub fn log_statuses(&self) -> Vec<LogStatus> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::LogStatus(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    pub fn raised(&self) -> Vec<Fault> {
        self.raised.lock().clone()
    }

    pub fn cleared(&self) -> Vec<Fault> {
        self.cleared.lock().clone()
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, event: Event) {
        self.events.lock().push(event);
    }

    fn raise_fault(&self, fault: Fault) {
        self.raised.lock().push(fault);
    }

    fn clear_fault(&self, fault: Fault) {
        self.cleared.lock().push(fault);
    }
}

/// Counts restart requests
#[derive(Default)]
pub(crate) struct CountingRestarter {
    count: AtomicUsize,
}

impl CountingRestarter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Restarter for CountingRestarter {
    async fn restart(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Configurable `SystemApi` that writes every call into a shared journal
pub(crate) struct MockSystem {
    name: String,
    journal: Arc<Mutex<Vec<String>>>,
    pub firmware_response: Mutex<UpdateFirmwareResponse>,
    pub upload_response: Mutex<UploadLogsResponse>,
    pub upload_requests: Mutex<Vec<UploadLogsRequest>>,
    pub reset_allowed: AtomicBool,
    pub reset_fails: AtomicBool,
    pub time_accepted: AtomicBool,
    pub boot_reason: Mutex<BootReason>,
}

impl MockSystem {
    pub fn new(name: &str, journal: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            journal,
            firmware_response: Mutex::new(UpdateFirmwareResponse::Accepted),
            upload_response: Mutex::new(UploadLogsResponse::status(UploadLogsStatus::Accepted)),
            upload_requests: Mutex::new(Vec::new()),
            reset_allowed: AtomicBool::new(true),
            reset_fails: AtomicBool::new(false),
            time_accepted: AtomicBool::new(true),
            boot_reason: Mutex::new(BootReason::PowerUp),
        })
    }

    fn record(&self, call: &str) {
        self.journal.lock().push(format!("{}:{}", self.name, call));
    }
}

#[async_trait]
impl SystemApi for MockSystem {
    async fn update_firmware(&self, _request: FirmwareUpdateRequest) -> Result<UpdateFirmwareResponse> {
        self.record("update_firmware");
        Ok(*self.firmware_response.lock())
    }

    async fn allow_firmware_installation(&self) -> Result<()> {
        self.record("allow_firmware_installation");
        Ok(())
    }

    async fn upload_logs(&self, request: UploadLogsRequest) -> Result<UploadLogsResponse> {
        self.record("upload_logs");
        self.upload_requests.lock().push(request);
        Ok(self.upload_response.lock().clone())
    }

    async fn is_reset_allowed(&self, _reset_type: ResetType) -> Result<bool> {
        self.record("is_reset_allowed");
        Ok(self.reset_allowed.load(Ordering::SeqCst))
    }

    async fn reset(&self, _reset_type: ResetType, _scheduled: bool) -> Result<()> {
        self.record("reset");
        if self.reset_fails.load(Ordering::SeqCst) {
            return Err(Error::Subsystem("reset refused".to_string()));
        }
        Ok(())
    }

    async fn set_system_time(&self, _timestamp: String) -> Result<bool> {
        self.record("set_system_time");
        Ok(self.time_accepted.load(Ordering::SeqCst))
    }

    async fn get_boot_reason(&self) -> Result<BootReason> {
        self.record("get_boot_reason");
        Ok(*self.boot_reason.lock())
    }
}

/// `EvseManagerApi` that accepts everything and journals the calls
pub(crate) struct StubEvse {
    calls: Mutex<Vec<String>>,
}

impl StubEvse {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().push(call.to_string());
    }
}

#[async_trait]
impl EvseManagerApi for StubEvse {
    async fn get_evse(&self) -> Result<Value> {
        self.record("get_evse");
        Ok(serde_json::json!({"id": 1, "connectors": [{"id": 1}]}))
    }

    async fn enable_disable(&self, connector_id: i32, _cmd_source: Value) -> Result<bool> {
        self.record(&format!("enable_disable:{}", connector_id));
        Ok(true)
    }

    async fn authorize_response(&self, _provided_token: Value, _validation_result: Value) -> Result<()> {
        self.record("authorize_response");
        Ok(())
    }

    async fn withdraw_authorization(&self) -> Result<()> {
        self.record("withdraw_authorization");
        Ok(())
    }

    async fn reserve(&self, reservation_id: i32) -> Result<bool> {
        self.record(&format!("reserve:{}", reservation_id));
        Ok(true)
    }

    async fn cancel_reservation(&self) -> Result<()> {
        self.record("cancel_reservation");
        Ok(())
    }

    async fn set_faulted(&self) -> Result<()> {
        self.record("set_faulted");
        Ok(())
    }

    async fn pause_charging(&self) -> Result<bool> {
        self.record("pause_charging");
        Ok(true)
    }

    async fn resume_charging(&self) -> Result<bool> {
        self.record("resume_charging");
        Ok(true)
    }

    async fn stop_transaction(&self, _request: Value) -> Result<bool> {
        self.record("stop_transaction");
        Ok(true)
    }

    async fn force_unlock(&self, connector_id: i32) -> Result<bool> {
        self.record(&format!("force_unlock:{}", connector_id));
        Ok(true)
    }

    async fn set_external_limits(&self, _limits: Value) -> Result<bool> {
        self.record("set_external_limits");
        Ok(true)
    }

    async fn switch_three_phases_while_charging(&self, three_phases: bool) -> Result<()> {
        self.record(&format!("switch_three_phases:{}", three_phases));
        Ok(())
    }

    async fn set_get_certificate_response(&self, _certificate_response: Value) -> Result<()> {
        self.record("set_get_certificate_response");
        Ok(())
    }

    async fn external_ready_to_start_charging(&self) -> Result<bool> {
        self.record("external_ready_to_start_charging");
        Ok(true)
    }
}

#[derive(Default)]
pub(crate) struct StubEnergy {
    pub limits: Mutex<Vec<Value>>,
}

#[async_trait]
impl EnergyApi for StubEnergy {
    async fn enforce_limits(&self, limits: Value) -> Result<()> {
        self.limits.lock().push(limits);
        Ok(())
    }
}
