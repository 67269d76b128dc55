//! System aggregation over the local system and all satellites
//!
//! Subsystem 0 is the local system, every further index is a satellite reached
//! through its link. Commands fan out to all of them and the answers are reduced
//! to one:
//!
//! | command                     | reduction                                  |
//! |-----------------------------|--------------------------------------------|
//! | update firmware             | most severe response                       |
//! | allow firmware installation | none                                       |
//! | is reset allowed            | AND                                        |
//! | set system time             | AND                                        |
//! | boot reason                 | subsystem 0                                |
//! | reset                       | satellites first, local system last        |
//! | upload logs                 | all must accept, then one bundled transfer |
//!
//! Status events of the subsystems flow back through `AggregatingSink` and are
//! merged before they reach the hub's bus.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use regex::{Regex, RegexBuilder};
use tracing::{debug, error, info, warn};

use crate::config::AggregatorConfig;
use crate::error::{Error, Result};
use crate::interfaces::{EventSink, SatelliteEndpoint, SystemApi};
use crate::types::*;
use crate::upload::{
    logs_filename, sanitize_filename, Admission, LogUploader, UploadRegistry, UNDEFINED_LOG_TYPE,
};

/// Address the local system uploads to
const LOOPBACK: &str = "127.0.0.1";

/// One aggregated system
#[derive(Clone)]
pub struct Subsystem {
    pub system: Arc<dyn SystemApi>,
    /// Link of a satellite; `None` for the local system
    pub endpoint: Option<Arc<dyn SatelliteEndpoint>>,
}

impl Subsystem {
    pub fn local(system: Arc<dyn SystemApi>) -> Self {
        Self {
            system,
            endpoint: None,
        }
    }

    pub fn remote(system: Arc<dyn SystemApi>, endpoint: Arc<dyn SatelliteEndpoint>) -> Self {
        Self {
            system,
            endpoint: Some(endpoint),
        }
    }
}

/// How a firmware status is merged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FirmwareBucket {
    /// Only subsystem 0 is heard
    LocalOnly,
    /// Published once every subsystem reported it
    Quorum,
    /// Published on first report
    Immediate,
}

fn bucket(status: FirmwareUpdateStatusEnum) -> FirmwareBucket {
    use FirmwareUpdateStatusEnum::*;

    match status {
        DownloadScheduled | DownloadPaused | InstallRebooting | InstallScheduled
        | SignatureVerified => FirmwareBucket::LocalOnly,
        Downloaded | Idle | Installing | Installed => FirmwareBucket::Quorum,
        DownloadFailed | Downloading | InstallationFailed | InstallVerificationFailed
        | InvalidSignature => FirmwareBucket::Immediate,
    }
}

/// Statuses that end an update cycle once published: all but progress
/// reports of the download and the local-only ones
fn is_final(status: FirmwareUpdateStatusEnum) -> bool {
    status != FirmwareUpdateStatusEnum::Downloading && bucket(status) != FirmwareBucket::LocalOnly
}

/// Firmware status merge state of one update cycle
#[derive(Debug, Default)]
struct FirmwareFanIn {
    counters: HashMap<FirmwareUpdateStatusEnum, usize>,
    already_reported: HashSet<FirmwareUpdateStatusEnum>,
    final_reported: bool,
}

impl FirmwareFanIn {
    /// Statuses to publish for one report, in order
    fn on_status(
        &mut self,
        index: usize,
        status: FirmwareUpdateStatus,
        subsystems: usize,
    ) -> Vec<FirmwareUpdateStatus> {
        let kind = status.firmware_update_status;
        let mut publish = Vec::new();

        if self.final_reported {
            debug!("Update cycle already finished, dropping {:?}", kind);
            return publish;
        }

        match bucket(kind) {
            FirmwareBucket::LocalOnly => {
                if index == 0 {
                    publish.push(status);
                }
            }
            FirmwareBucket::Quorum => {
                let count = self.counters.entry(kind).or_insert(0);
                *count += 1;
                if *count == subsystems && self.already_reported.insert(kind) {
                    publish.push(status);
                }
            }
            FirmwareBucket::Immediate => {
                if !self.already_reported.insert(kind) {
                    return publish;
                }

                let downloaded = FirmwareUpdateStatusEnum::Downloaded;
                if kind == FirmwareUpdateStatusEnum::InvalidSignature
                    && self.counters.get(&downloaded).copied().unwrap_or(0) > 0
                    && self.already_reported.insert(downloaded)
                {
                    publish.push(FirmwareUpdateStatus::new(downloaded, status.request_id));
                }
                publish.push(status);
            }
        }

        // one report is published as a whole before the cycle may end
        if publish.iter().any(|s| is_final(s.firmware_update_status)) {
            self.final_reported = true;
        }
        publish
    }
}

/// One `SystemApi` over all subsystems
pub struct SystemAggregator {
    subsystems: Vec<Subsystem>,
    config: AggregatorConfig,
    sink: Arc<dyn EventSink>,
    firmware: Mutex<FirmwareFanIn>,
    uploads: Arc<UploadRegistry>,
    uploader: Arc<LogUploader>,
    my_ip: Regex,
}

impl SystemAggregator {
    /// `sink` receives the merged status events
    pub fn new(subsystems: Vec<Subsystem>, config: AggregatorConfig, sink: Arc<dyn EventSink>) -> Result<Self> {
        if subsystems.is_empty() {
            return Err(Error::Subsystem("no local system".to_string()));
        }

        let my_ip = RegexBuilder::new(r"\{my-ip\}")
            .case_insensitive(true)
            .build()
            .map_err(|e| Error::Protocol(format!("upload URL pattern: {}", e)))?;

        let uploads = Arc::new(UploadRegistry::new());
        let uploader = Arc::new(LogUploader::new(uploads.clone(), sink.clone(), &config));

        Ok(Self {
            subsystems,
            config,
            sink,
            firmware: Mutex::new(FirmwareFanIn::default()),
            uploads,
            uploader,
            my_ip,
        })
    }

    pub fn subsystem_count(&self) -> usize {
        self.subsystems.len()
    }

    pub fn uploads(&self) -> &UploadRegistry {
        &self.uploads
    }

    /// Sink for the events of subsystem `index`; status events are merged, all
    /// others are passed on to `downstream`
    pub fn subsystem_sink(self: &Arc<Self>, index: usize, downstream: Arc<dyn EventSink>) -> Arc<dyn EventSink> {
        Arc::new(AggregatingSink {
            aggregator: self.clone(),
            index,
            downstream,
        })
    }

    pub fn on_firmware_update_status(&self, index: usize, status: FirmwareUpdateStatus) {
        let publish = self
            .firmware
            .lock()
            .on_status(index, status, self.subsystems.len());

        for status in publish {
            info!("Firmware update status: {:?}", status.firmware_update_status);
            self.sink.publish(Event::FirmwareUpdateStatus(status));
        }
    }

    pub fn on_log_status(&self, index: usize, status: LogStatus) {
        self.uploads.on_log_status(index, status);
    }

    fn upload_url(&self, index: usize, subsystem: &Subsystem) -> Option<String> {
        let address = match &subsystem.endpoint {
            None => LOOPBACK.to_string(),
            Some(endpoint) => endpoint.local_endpoint_address()?,
        };

        debug!("System #{} uploads via {}", index, address);
        Some(
            self.my_ip
                .replace_all(&self.config.upload_url_template, address.as_str())
                .into_owned(),
        )
    }

    fn reject_upload(&self, request_id: i32) -> UploadLogsResponse {
        self.uploads.cancel(request_id);
        self.uploads.remove(request_id);
        UploadLogsResponse::status(UploadLogsStatus::Rejected)
    }
}

#[async_trait]
impl SystemApi for SystemAggregator {
    async fn update_firmware(&self, request: FirmwareUpdateRequest) -> Result<UpdateFirmwareResponse> {
        *self.firmware.lock() = FirmwareFanIn::default();

        let mut response = UpdateFirmwareResponse::Accepted;
        for (index, subsystem) in self.subsystems.iter().enumerate() {
            let answer = subsystem.system.update_firmware(request.clone()).await?;
            debug!("System #{} answered {:?} to firmware update", index, answer);
            response = response.max(answer);
        }

        info!("Firmware update {}: {:?}", request.request_id, response);
        Ok(response)
    }

    async fn allow_firmware_installation(&self) -> Result<()> {
        for (index, subsystem) in self.subsystems.iter().enumerate() {
            if let Err(e) = subsystem.system.allow_firmware_installation().await {
                warn!("System #{} failed to allow installation: {}", index, e);
            }
        }
        Ok(())
    }

    async fn upload_logs(&self, request: UploadLogsRequest) -> Result<UploadLogsResponse> {
        let log_type = request
            .log_type
            .clone()
            .unwrap_or_else(|| UNDEFINED_LOG_TYPE.to_string());
        info!("Log upload request of type \"{}\"", log_type);

        let filename = logs_filename(request.log_type.as_deref().unwrap_or("diagnostics"), Utc::now());
        let request_id = loop {
            let candidate = request.request_id.unwrap_or_else(rand::random::<i32>);

            match self.uploads.admit(&log_type, candidate, filename.clone()) {
                Admission::Admitted(id) => break id,
                Admission::Canceled(existing) => {
                    info!("Canceling running upload {} of type \"{}\"", existing, log_type);
                    return Ok(UploadLogsResponse::status(UploadLogsStatus::AcceptedCanceled));
                }
                Admission::IdInUse(id) if request.request_id.is_some() => {
                    warn!("Upload {} is already tracked under another type, rejecting", id);
                    return Ok(UploadLogsResponse::status(UploadLogsStatus::Rejected));
                }
                Admission::IdInUse(id) => debug!("Generated upload id {} taken, drawing again", id),
            }
        };
        info!("Handling upload as {}, providing '{}'", request_id, filename);

        // subsystems upload once to us, we retry the final transfer
        let mut forwarded = request.clone();
        forwarded.retries = Some(1);
        forwarded.retry_interval_s = None;
        forwarded.request_id = Some(request_id);

        for (index, subsystem) in self.subsystems.iter().enumerate().rev() {
            forwarded.location = match self.upload_url(index, subsystem) {
                Some(url) => url,
                None => {
                    warn!("System #{} has no reachable address, rejecting", index);
                    return Ok(self.reject_upload(request_id));
                }
            };

            info!("Requesting log upload from system #{}", index);
            let status = match subsystem.system.upload_logs(forwarded.clone()).await {
                Ok(status) => status,
                Err(e) => {
                    self.reject_upload(request_id);
                    return Err(e);
                }
            };

            if status.upload_logs_status != UploadLogsStatus::Accepted {
                info!(
                    "System #{} answered {:?}, rejecting the request",
                    index, status.upload_logs_status
                );
                return Ok(self.reject_upload(request_id));
            }

            let announced = status.file_name.unwrap_or_default();
            let incoming = sanitize_filename(&announced);
            if incoming != announced {
                warn!("System #{} announced suspicious filename '{}', filtered", index, announced);
            }
            info!("System #{} will upload '{}'", index, incoming);
            self.uploads.record_incoming(request_id, index, incoming);
        }

        info!("All systems instructed, waiting for their uploads");
        let uploader = self.uploader.clone();
        let subsystems = self.subsystems.len();
        tokio::spawn(async move {
            uploader.complete(request_id, &request, subsystems).await;
        });

        Ok(UploadLogsResponse {
            upload_logs_status: UploadLogsStatus::Accepted,
            file_name: Some(filename),
        })
    }

    async fn is_reset_allowed(&self, reset_type: ResetType) -> Result<bool> {
        let mut allowed = true;
        for subsystem in &self.subsystems {
            if !subsystem.system.is_reset_allowed(reset_type).await? {
                allowed = false;
            }
        }
        Ok(allowed)
    }

    async fn reset(&self, reset_type: ResetType, scheduled: bool) -> Result<()> {
        info!(
            "Proxying {} reset ({}scheduled)",
            reset_type,
            if scheduled { "" } else { "not " }
        );

        for (index, subsystem) in self.subsystems.iter().enumerate().skip(1) {
            info!("Passing {} reset to system #{}", reset_type, index);
            if let Err(e) = subsystem.system.reset(reset_type, scheduled).await {
                error!("Reset of system #{} failed: {}", index, e);
            }
        }

        // the local reset may end this process
        info!("Resetting local system in {:?}", self.config.reset_grace);
        tokio::time::sleep(self.config.reset_grace).await;

        self.subsystems[0].system.reset(reset_type, scheduled).await
    }

    async fn set_system_time(&self, timestamp: String) -> Result<bool> {
        let mut accepted = true;
        for subsystem in &self.subsystems {
            if !subsystem.system.set_system_time(timestamp.clone()).await? {
                accepted = false;
            }
        }
        Ok(accepted)
    }

    async fn get_boot_reason(&self) -> Result<BootReason> {
        self.subsystems[0].system.get_boot_reason().await
    }
}

/// Routes the status events of one subsystem into the aggregator
pub struct AggregatingSink {
    aggregator: Arc<SystemAggregator>,
    index: usize,
    downstream: Arc<dyn EventSink>,
}

impl EventSink for AggregatingSink {
    fn publish(&self, event: Event) {
        match event {
            Event::FirmwareUpdateStatus(status) => {
                self.aggregator.on_firmware_update_status(self.index, status)
            }
            Event::LogStatus(status) => self.aggregator.on_log_status(self.index, status),
            other => self.downstream.publish(other),
        }
    }

    fn raise_fault(&self, fault: Fault) {
        self.downstream.raise_fault(fault);
    }

    fn clear_fault(&self, fault: Fault) {
        self.downstream.clear_fault(fault);
    }
}
