//! Command and publish endpoints of a charging subsystem
//!
//! The same traits are implemented by the local stack, by the hub-side proxies that
//! forward over the transport channel, and by the aggregator that fans out to both.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::types::*;

/// Receives every event a subsystem publishes
pub trait EventSink: Send + Sync {
    fn publish(&self, event: Event);

    fn raise_fault(&self, _fault: Fault) {}

    fn clear_fault(&self, _fault: Fault) {}
}

/// The `system` interface
#[async_trait]
pub trait SystemApi: Send + Sync {
    async fn update_firmware(&self, request: FirmwareUpdateRequest) -> Result<UpdateFirmwareResponse>;

    async fn allow_firmware_installation(&self) -> Result<()>;

    async fn upload_logs(&self, request: UploadLogsRequest) -> Result<UploadLogsResponse>;

    async fn is_reset_allowed(&self, reset_type: ResetType) -> Result<bool>;

    async fn reset(&self, reset_type: ResetType, scheduled: bool) -> Result<()>;

    async fn set_system_time(&self, timestamp: String) -> Result<bool>;

    async fn get_boot_reason(&self) -> Result<BootReason>;
}

/// The `evse_manager` interface; payloads are opaque to the link
#[async_trait]
pub trait EvseManagerApi: Send + Sync {
    async fn get_evse(&self) -> Result<Value>;

    async fn enable_disable(&self, connector_id: i32, cmd_source: Value) -> Result<bool>;

    async fn authorize_response(&self, provided_token: Value, validation_result: Value) -> Result<()>;

    async fn withdraw_authorization(&self) -> Result<()>;

    async fn reserve(&self, reservation_id: i32) -> Result<bool>;

    async fn cancel_reservation(&self) -> Result<()>;

    async fn set_faulted(&self) -> Result<()>;

    async fn pause_charging(&self) -> Result<bool>;

    async fn resume_charging(&self) -> Result<bool>;

    async fn stop_transaction(&self, request: Value) -> Result<bool>;

    async fn force_unlock(&self, connector_id: i32) -> Result<bool>;

    async fn set_external_limits(&self, limits: Value) -> Result<bool>;

    async fn switch_three_phases_while_charging(&self, three_phases: bool) -> Result<()>;

    async fn set_get_certificate_response(&self, certificate_response: Value) -> Result<()>;

    async fn external_ready_to_start_charging(&self) -> Result<bool>;
}

/// The `energy` interface
#[async_trait]
pub trait EnergyApi: Send + Sync {
    async fn enforce_limits(&self, limits: Value) -> Result<()>;
}

/// Addressing information of one hub/satellite link
pub trait SatelliteEndpoint: Send + Sync {
    /// Address of the hub as seen on this link
    fn local_endpoint_address(&self) -> Option<String>;

    fn remote_endpoint_address(&self) -> String;

    fn is_connected(&self) -> bool;
}

/// Performs the controlled restart after a fatal desynchronization
#[async_trait]
pub trait Restarter: Send + Sync {
    async fn restart(&self);
}

/// Restart through the local system's soft reset, or exit the process when there
/// is no system to reset
pub struct SystemRestarter {
    system: Option<Arc<dyn SystemApi>>,
}

impl SystemRestarter {
    pub fn new(system: Option<Arc<dyn SystemApi>>) -> Self {
        Self { system }
    }
}

#[async_trait]
impl Restarter for SystemRestarter {
    async fn restart(&self) {
        match &self.system {
            Some(system) => {
                if let Err(e) = system.reset(ResetType::Soft, false).await {
                    tracing::error!("Soft reset failed: {}, exiting instead", e);
                    std::process::exit(1);
                }
            }
            None => {
                tracing::error!("No system to reset, exiting");
                std::process::exit(1);
            }
        }
    }
}

/// Remembers whether a disconnect of the peer is about to happen on purpose
#[derive(Debug, Clone, Default)]
pub struct DisconnectFlag(Arc<AtomicBool>);

impl DisconnectFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the next disconnect as expected
    pub fn expect(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_expected(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_flag_is_shared() {
        let flag = DisconnectFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_expected());

        flag.expect();
        assert!(clone.is_expected());
    }
}
