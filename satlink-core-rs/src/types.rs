//! Core types for satlink
//!
//! Domain payloads that cross the hub/satellite boundary, the typed `Event` union and
//! its `(interface, var, value)` wire record.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Response to a firmware update request.
///
/// Declaration order is the severity order used when reducing responses from
/// several subsystems: `Accepted` sorts lowest, every rejection sorts higher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum UpdateFirmwareResponse {
    Accepted,
    Rejected,
    AcceptedCanceled,
    InvalidCertificate,
    RevokedCertificate,
}

/// Firmware update progress reported by a system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FirmwareUpdateStatusEnum {
    Downloaded,
    DownloadFailed,
    Downloading,
    DownloadScheduled,
    DownloadPaused,
    Idle,
    InstallationFailed,
    Installing,
    Installed,
    InstallRebooting,
    InstallScheduled,
    InstallVerificationFailed,
    InvalidSignature,
    SignatureVerified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareUpdateStatus {
    pub firmware_update_status: FirmwareUpdateStatusEnum,
    pub request_id: i32,
}

impl FirmwareUpdateStatus {
    pub fn new(status: FirmwareUpdateStatusEnum, request_id: i32) -> Self {
        Self {
            firmware_update_status: status,
            request_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FirmwareUpdateRequest {
    pub request_id: i32,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_interval_s: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieve_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_certificate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Log upload request as received from the backend
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UploadLogsRequest {
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_interval_s: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldest_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_timestamp: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub log_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadLogsStatus {
    Accepted,
    Rejected,
    AcceptedCanceled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadLogsResponse {
    pub upload_logs_status: UploadLogsStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

impl UploadLogsResponse {
    pub fn status(status: UploadLogsStatus) -> Self {
        Self {
            upload_logs_status: status,
            file_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogStatusEnum {
    BadMessage,
    Idle,
    NotSupportedOperation,
    PermissionDenied,
    Uploaded,
    UploadFailure,
    Uploading,
}

impl LogStatusEnum {
    /// A status after which the reporting system will not send more for this request
    pub fn is_terminal(&self) -> bool {
        !matches!(self, LogStatusEnum::Idle | LogStatusEnum::Uploading)
    }

    /// Parse a status token printed by the upload helper
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "BadMessage" => Some(LogStatusEnum::BadMessage),
            "Idle" => Some(LogStatusEnum::Idle),
            "NotSupportedOperation" => Some(LogStatusEnum::NotSupportedOperation),
            "PermissionDenied" => Some(LogStatusEnum::PermissionDenied),
            "Uploaded" => Some(LogStatusEnum::Uploaded),
            "UploadFailure" => Some(LogStatusEnum::UploadFailure),
            "Uploading" => Some(LogStatusEnum::Uploading),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStatus {
    pub log_status: LogStatusEnum,
    pub request_id: i32,
}

impl LogStatus {
    pub fn new(log_status: LogStatusEnum, request_id: i32) -> Self {
        Self {
            log_status,
            request_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetType {
    Soft,
    Hard,
    NotSpecified,
}

impl std::fmt::Display for ResetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootReason {
    ApplicationReset,
    FirmwareUpdate,
    LocalReset,
    PowerUp,
    RemoteReset,
    ScheduledReset,
    Triggered,
    Unknown,
    Watchdog,
}

/// A raised or cleared fault on the satellite
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    #[serde(rename = "type")]
    pub fault_type: String,
    #[serde(default)]
    pub sub_type: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "error", rename_all = "lowercase")]
pub enum FaultEvent {
    Raise(Fault),
    Clear(Fault),
}

/// One `(interface, var, value)` triple as it travels over the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub interface: String,
    pub var: String,
    pub value: Value,
}

/// Result of one drain of the satellite's accumulator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    #[serde(default)]
    pub vars: Vec<EventRecord>,
    #[serde(default)]
    pub errors: Vec<FaultEvent>,
}

impl EventBatch {
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty() && self.errors.is_empty()
    }
}

/// Every variable relayed between hub and satellite
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    // auth_token_provider
    ProvidedToken(Value),
    // energy
    EnergyFlowRequest(Value),
    // evse_manager
    SessionEvent(Value),
    Limits(Value),
    EvInfo(Value),
    CarManufacturer(String),
    Telemetry(Value),
    Powermeter(Value),
    PowermeterPublicKeyOcmf(String),
    EvseId(String),
    HwCapabilities(Value),
    Iso15118CertificateRequest(Value),
    EnforcedLimits(Value),
    WaitingForExternalReady(bool),
    Ready(bool),
    SelectedProtocol(String),
    // system
    FirmwareUpdateStatus(FirmwareUpdateStatus),
    LogStatus(LogStatus),
    // auth (hub -> satellite)
    TokenValidationStatus(Value),
}

impl Event {
    /// The `(interface, var)` tags of this event
    pub fn tags(&self) -> (&'static str, &'static str) {
        match self {
            Event::ProvidedToken(_) => ("auth_token_provider", "provided_token"),
            Event::EnergyFlowRequest(_) => ("energy", "energy_flow_request"),
            Event::SessionEvent(_) => ("evse_manager", "session_event"),
            Event::Limits(_) => ("evse_manager", "limits"),
            Event::EvInfo(_) => ("evse_manager", "ev_info"),
            Event::CarManufacturer(_) => ("evse_manager", "car_manufacturer"),
            Event::Telemetry(_) => ("evse_manager", "telemetry"),
            Event::Powermeter(_) => ("evse_manager", "powermeter"),
            Event::PowermeterPublicKeyOcmf(_) => ("evse_manager", "powermeter_public_key_ocmf"),
            Event::EvseId(_) => ("evse_manager", "evse_id"),
            Event::HwCapabilities(_) => ("evse_manager", "hw_capabilities"),
            Event::Iso15118CertificateRequest(_) => ("evse_manager", "iso15118_certificate_request"),
            Event::EnforcedLimits(_) => ("evse_manager", "enforced_limits"),
            Event::WaitingForExternalReady(_) => ("evse_manager", "waiting_for_external_ready"),
            Event::Ready(_) => ("evse_manager", "ready"),
            Event::SelectedProtocol(_) => ("evse_manager", "selected_protocol"),
            Event::FirmwareUpdateStatus(_) => ("system", "firmware_update_status"),
            Event::LogStatus(_) => ("system", "log_status"),
            Event::TokenValidationStatus(_) => ("auth", "token_validation_status"),
        }
    }

    /// Encode into a wire record
    pub fn to_record(&self) -> Result<EventRecord, serde_json::Error> {
        let value = match self {
            Event::ProvidedToken(v)
            | Event::EnergyFlowRequest(v)
            | Event::SessionEvent(v)
            | Event::Limits(v)
            | Event::EvInfo(v)
            | Event::Telemetry(v)
            | Event::Powermeter(v)
            | Event::HwCapabilities(v)
            | Event::Iso15118CertificateRequest(v)
            | Event::EnforcedLimits(v)
            | Event::TokenValidationStatus(v) => v.clone(),
            Event::CarManufacturer(s)
            | Event::PowermeterPublicKeyOcmf(s)
            | Event::EvseId(s)
            | Event::SelectedProtocol(s) => Value::String(s.clone()),
            Event::WaitingForExternalReady(b) | Event::Ready(b) => Value::Bool(*b),
            Event::FirmwareUpdateStatus(s) => serde_json::to_value(s)?,
            Event::LogStatus(s) => serde_json::to_value(s)?,
        };

        let (interface, var) = self.tags();
        Ok(EventRecord {
            interface: interface.to_string(),
            var: var.to_string(),
            value,
        })
    }

    /// Decode a wire record.
    ///
    /// Returns `Ok(None)` for an `(interface, var)` pair this side does not know.
    pub fn from_record(record: EventRecord) -> Result<Option<Event>, serde_json::Error> {
        let EventRecord {
            interface,
            var,
            value,
        } = record;

        let event = match (interface.as_str(), var.as_str()) {
            ("auth_token_provider", "provided_token") => Event::ProvidedToken(value),
            ("energy", "energy_flow_request") => Event::EnergyFlowRequest(value),
            ("evse_manager", "session_event") => Event::SessionEvent(value),
            ("evse_manager", "limits") => Event::Limits(value),
            ("evse_manager", "ev_info") => Event::EvInfo(value),
            ("evse_manager", "car_manufacturer") => Event::CarManufacturer(parse(value)?),
            ("evse_manager", "telemetry") => Event::Telemetry(value),
            ("evse_manager", "powermeter") => Event::Powermeter(value),
            ("evse_manager", "powermeter_public_key_ocmf") => {
                Event::PowermeterPublicKeyOcmf(parse(value)?)
            }
            ("evse_manager", "evse_id") => Event::EvseId(parse(value)?),
            ("evse_manager", "hw_capabilities") => Event::HwCapabilities(value),
            ("evse_manager", "iso15118_certificate_request") => {
                Event::Iso15118CertificateRequest(value)
            }
            ("evse_manager", "enforced_limits") => Event::EnforcedLimits(value),
            ("evse_manager", "waiting_for_external_ready") => {
                Event::WaitingForExternalReady(parse(value)?)
            }
            ("evse_manager", "ready") => Event::Ready(parse(value)?),
            ("evse_manager", "selected_protocol") => Event::SelectedProtocol(parse(value)?),
            ("system", "firmware_update_status") => Event::FirmwareUpdateStatus(parse(value)?),
            ("system", "log_status") => Event::LogStatus(parse(value)?),
            ("auth", "token_validation_status") => Event::TokenValidationStatus(value),
            _ => return Ok(None),
        };

        Ok(Some(event))
    }
}

fn parse<T: DeserializeOwned>(value: Value) -> Result<T, serde_json::Error> {
    serde_json::from_value(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_update_firmware_response_severity_order() {
        assert!(UpdateFirmwareResponse::Accepted < UpdateFirmwareResponse::Rejected);
        assert!(UpdateFirmwareResponse::Rejected < UpdateFirmwareResponse::RevokedCertificate);
    }

    #[test]
    fn test_event_record_tags() {
        let record = Event::Ready(true).to_record().unwrap();
        assert_eq!(record.interface, "evse_manager");
        assert_eq!(record.var, "ready");
        assert_eq!(record.value, json!(true));
    }

    #[test]
    fn test_decode_log_status_record() {
        let record = EventRecord {
            interface: "system".to_string(),
            var: "log_status".to_string(),
            value: json!({"log_status": "Uploaded", "request_id": 7}),
        };

        let event = Event::from_record(record).unwrap();
        assert_eq!(
            event,
            Some(Event::LogStatus(LogStatus::new(LogStatusEnum::Uploaded, 7)))
        );
    }

    #[test]
    fn test_unknown_record_is_skipped() {
        let record = EventRecord {
            interface: "evse_manager".to_string(),
            var: "no_such_var".to_string(),
            value: Value::Null,
        };
        assert_eq!(Event::from_record(record).unwrap(), None);
    }

    #[test]
    fn test_fault_event_wire_format() {
        let event = FaultEvent::Raise(Fault {
            fault_type: "evse_manager/MREC2GroundFailure".to_string(),
            sub_type: String::new(),
            message: "ground fault".to_string(),
        });

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["action"], "raise");
        assert_eq!(value["error"]["type"], "evse_manager/MREC2GroundFailure");
    }

    #[test]
    fn test_upload_request_type_field() {
        let request: UploadLogsRequest = serde_json::from_value(json!({
            "location": "ftp://backend/logs",
            "type": "DiagnosticsLog",
        }))
        .unwrap();

        assert_eq!(request.log_type.as_deref(), Some("DiagnosticsLog"));
        assert_eq!(request.request_id, None);
    }

    #[test]
    fn test_log_status_tokens() {
        assert_eq!(LogStatusEnum::from_token("Uploaded"), Some(LogStatusEnum::Uploaded));
        assert_eq!(LogStatusEnum::from_token("garbage"), None);
        assert!(LogStatusEnum::PermissionDenied.is_terminal());
        assert!(!LogStatusEnum::Uploading.is_terminal());
    }
}
