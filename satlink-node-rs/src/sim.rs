//! Simulated charging stack
//!
//! Stands in for the real system, EVSE and energy subsystems so a hub and its
//! satellites can be exercised on a workstation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{json, Value};
use tracing::{info, warn};

use satlink_core::{
    BootReason, EnergyApi, Event, EventSink, EvseManagerApi, Fault, FirmwareUpdateRequest,
    FirmwareUpdateStatus, FirmwareUpdateStatusEnum, LogStatus, LogStatusEnum, ResetType, Result,
    SystemApi, UpdateFirmwareResponse, UploadLogsRequest, UploadLogsResponse, UploadLogsStatus,
};

/// Logs every event it sees
pub struct LogBus {
    name: String,
}

impl LogBus {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl EventSink for LogBus {
    fn publish(&self, event: Event) {
        let (interface, var) = event.tags();
        info!("[{}] {}/{}: {:?}", self.name, interface, var, event);
    }

    fn raise_fault(&self, fault: Fault) {
        warn!("[{}] fault raised: {} {}", self.name, fault.fault_type, fault.message);
    }

    fn clear_fault(&self, fault: Fault) {
        info!("[{}] fault cleared: {}", self.name, fault.fault_type);
    }
}

/// Logs locally and forwards the events satellites care about over their links
pub struct HubBus {
    log: LogBus,
    satellites: Vec<Arc<dyn EventSink>>,
}

impl HubBus {
    pub fn new(satellites: Vec<Arc<dyn EventSink>>) -> Self {
        Self {
            log: LogBus::new("hub"),
            satellites,
        }
    }
}

impl EventSink for HubBus {
    fn publish(&self, event: Event) {
        let forward = matches!(
            event,
            Event::TokenValidationStatus(_) | Event::FirmwareUpdateStatus(_) | Event::LogStatus(_)
        );
        if forward {
            for satellite in &self.satellites {
                satellite.publish(event.clone());
            }
        }
        self.log.publish(event);
    }

    fn raise_fault(&self, fault: Fault) {
        self.log.raise_fault(fault);
    }

    fn clear_fault(&self, fault: Fault) {
        self.log.clear_fault(fault);
    }
}

/// Simulated `system` subsystem; status events go to the attached sink
pub struct SimSystem {
    name: String,
    sink: Mutex<Option<Arc<dyn EventSink>>>,
    step: Duration,
}

impl SimSystem {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sink: Mutex::new(None),
            step: Duration::from_secs(2),
        }
    }

    pub fn attach(&self, sink: Arc<dyn EventSink>) {
        *self.sink.lock() = Some(sink);
    }

    /// Publish `events` one step apart
    fn play(&self, events: Vec<Event>) {
        let sink = match self.sink.lock().clone() {
            Some(sink) => sink,
            None => {
                warn!("[{}] no sink attached, dropping status updates", self.name);
                return;
            }
        };

        let step = self.step;
        tokio::spawn(async move {
            for event in events {
                tokio::time::sleep(step).await;
                sink.publish(event);
            }
        });
    }
}

#[async_trait]
impl SystemApi for SimSystem {
    async fn update_firmware(&self, request: FirmwareUpdateRequest) -> Result<UpdateFirmwareResponse> {
        info!("[{}] firmware update from {}", self.name, request.location);

        let status = |s| Event::FirmwareUpdateStatus(FirmwareUpdateStatus::new(s, request.request_id));
        self.play(vec![
            status(FirmwareUpdateStatusEnum::Downloading),
            status(FirmwareUpdateStatusEnum::Downloaded),
            status(FirmwareUpdateStatusEnum::Installing),
            status(FirmwareUpdateStatusEnum::Installed),
        ]);
        Ok(UpdateFirmwareResponse::Accepted)
    }

    async fn allow_firmware_installation(&self) -> Result<()> {
        info!("[{}] firmware installation allowed", self.name);
        Ok(())
    }

    async fn upload_logs(&self, request: UploadLogsRequest) -> Result<UploadLogsResponse> {
        let request_id = request.request_id.unwrap_or(0);
        info!("[{}] uploading logs to {}", self.name, request.location);

        self.play(vec![
            Event::LogStatus(LogStatus::new(LogStatusEnum::Uploading, request_id)),
            Event::LogStatus(LogStatus::new(LogStatusEnum::Uploaded, request_id)),
        ]);
        Ok(UploadLogsResponse {
            upload_logs_status: UploadLogsStatus::Accepted,
            file_name: Some(format!("{}_{}.tar.gz", self.name, Utc::now().format("%Y%m%d%H%M%S"))),
        })
    }

    async fn is_reset_allowed(&self, _reset_type: ResetType) -> Result<bool> {
        Ok(true)
    }

    async fn reset(&self, reset_type: ResetType, scheduled: bool) -> Result<()> {
        warn!("[{}] {} reset (scheduled: {}), exiting", self.name, reset_type, scheduled);
        std::process::exit(0);
    }

    async fn set_system_time(&self, timestamp: String) -> Result<bool> {
        info!("[{}] system time set to {}", self.name, timestamp);
        Ok(true)
    }

    async fn get_boot_reason(&self) -> Result<BootReason> {
        Ok(BootReason::PowerUp)
    }
}

/// Simulated EVSE manager with one connector
pub struct SimEvse {
    name: String,
}

impl SimEvse {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn log(&self, call: &str) {
        info!("[{}] evse_manager.{}", self.name, call);
    }
}

#[async_trait]
impl EvseManagerApi for SimEvse {
    async fn get_evse(&self) -> Result<Value> {
        Ok(json!({"id": 1, "connectors": [{"id": 1, "type": "cType2"}]}))
    }

    async fn enable_disable(&self, connector_id: i32, cmd_source: Value) -> Result<bool> {
        self.log(&format!("enable_disable({}, {})", connector_id, cmd_source));
        Ok(true)
    }

    async fn authorize_response(&self, provided_token: Value, validation_result: Value) -> Result<()> {
        self.log(&format!("authorize_response({}, {})", provided_token, validation_result));
        Ok(())
    }

    async fn withdraw_authorization(&self) -> Result<()> {
        self.log("withdraw_authorization");
        Ok(())
    }

    async fn reserve(&self, reservation_id: i32) -> Result<bool> {
        self.log(&format!("reserve({})", reservation_id));
        Ok(true)
    }

    async fn cancel_reservation(&self) -> Result<()> {
        self.log("cancel_reservation");
        Ok(())
    }

    async fn set_faulted(&self) -> Result<()> {
        self.log("set_faulted");
        Ok(())
    }

    async fn pause_charging(&self) -> Result<bool> {
        self.log("pause_charging");
        Ok(true)
    }

    async fn resume_charging(&self) -> Result<bool> {
        self.log("resume_charging");
        Ok(true)
    }

    async fn stop_transaction(&self, request: Value) -> Result<bool> {
        self.log(&format!("stop_transaction({})", request));
        Ok(true)
    }

    async fn force_unlock(&self, connector_id: i32) -> Result<bool> {
        self.log(&format!("force_unlock({})", connector_id));
        Ok(true)
    }

    async fn set_external_limits(&self, limits: Value) -> Result<bool> {
        self.log(&format!("set_external_limits({})", limits));
        Ok(true)
    }

    async fn switch_three_phases_while_charging(&self, three_phases: bool) -> Result<()> {
        self.log(&format!("switch_three_phases_while_charging({})", three_phases));
        Ok(())
    }

    async fn set_get_certificate_response(&self, certificate_response: Value) -> Result<()> {
        self.log(&format!("set_get_certificate_response({})", certificate_response));
        Ok(())
    }

    async fn external_ready_to_start_charging(&self) -> Result<bool> {
        self.log("external_ready_to_start_charging");
        Ok(true)
    }
}

pub struct SimEnergy {
    name: String,
}

impl SimEnergy {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl EnergyApi for SimEnergy {
    async fn enforce_limits(&self, limits: Value) -> Result<()> {
        info!("[{}] energy.enforce_limits({})", self.name, limits);
        Ok(())
    }
}

/// Periodic telemetry and meter readings of the simulated EVSE
pub async fn run_telemetry(sink: Arc<dyn EventSink>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    let mut energy_wh = 0.0f64;

    sink.publish(Event::EvseId("DE*SAT*E0001".to_string()));
    sink.publish(Event::Ready(true));

    loop {
        ticker.tick().await;

        let (temperature, power_w) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(20.0..45.0f64), rng.gen_range(0.0..11_000.0f64))
        };
        energy_wh += power_w * period.as_secs_f64() / 3600.0;

        sink.publish(Event::Telemetry(json!({
            "evse_temperature_C": temperature,
            "relais_on": power_w > 0.0,
        })));
        sink.publish(Event::Powermeter(json!({
            "timestamp": Utc::now().to_rfc3339(),
            "energy_Wh_import": {"total": energy_wh},
            "power_W": {"total": power_w},
        })));
    }
}
