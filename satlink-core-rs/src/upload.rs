//! Log upload tracking and transfer
//!
//! Every accepted upload request gets one entry, indexed by request id and by log
//! type. A second request for a type that is still in flight cancels the first.
//!
//! Once all subsystems have uploaded their part to the staging directory, an
//! external helper bundles the staged files and transfers the bundle to the final
//! location. The helper reports progress as one status token per output line.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::AggregatorConfig;
use crate::interfaces::EventSink;
use crate::types::{Event, LogStatus, LogStatusEnum, UploadLogsRequest};

/// Type key of requests that do not name a log type
pub const UNDEFINED_LOG_TYPE: &str = "{undefined}";

/// Bundle name for a log type, e.g. `diagnostics_2024-03-01T12-30-05Z.tar.gz`
pub fn logs_filename(log_type: &str, now: DateTime<Utc>) -> String {
    format!("{}_{}Z.tar.gz", log_type, now.format("%FT%H-%M-%S"))
}

/// Strip directory components from a subsystem-supplied name; `.` and `..` become empty
pub fn sanitize_filename(name: &str) -> String {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string()
}

#[derive(Debug, Clone)]
pub struct UploadEntry {
    pub request_id: i32,
    pub log_type: String,
    pub filename: String,
    pub is_running: bool,
    pub feedback_count: usize,
    /// Names announced per subsystem index, empty if none
    pub incoming_filenames: BTreeMap<usize, String>,
}

/// Result of admitting a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// New entry created under this id
    Admitted(i32),
    /// An upload of the same type was running and is now canceled
    Canceled(i32),
    /// Another upload is tracked under this id
    IdInUse(i32),
}

/// How the wait for subsystem feedback ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackWait {
    AllReported,
    Canceled,
    TimedOut,
}

#[derive(Debug, Default)]
struct Tables {
    uploads: HashMap<i32, UploadEntry>,
    by_type: HashMap<String, i32>,
}

/// Upload entries plus their type index, guarded by one lock
#[derive(Debug, Default)]
pub struct UploadRegistry {
    tables: Mutex<Tables>,
    changed: Notify,
}

impl UploadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an entry, or cancel the running upload of the same type
    pub fn admit(&self, log_type: &str, request_id: i32, filename: String) -> Admission {
        let admission = {
            let mut tables = self.tables.lock();

            let running = tables.by_type.get(log_type).copied();
            match running {
                Some(existing) if tables.uploads.contains_key(&existing) => {
                    if let Some(entry) = tables.uploads.get_mut(&existing) {
                        entry.is_running = false;
                    }
                    Admission::Canceled(existing)
                }
                _ if tables.uploads.contains_key(&request_id) => Admission::IdInUse(request_id),
                stale => {
                    if let Some(stale) = stale {
                        warn!("Dropping stale index of type \"{}\" to upload {}", log_type, stale);
                    }
                    tables.uploads.insert(
                        request_id,
                        UploadEntry {
                            request_id,
                            log_type: log_type.to_string(),
                            filename,
                            is_running: true,
                            feedback_count: 0,
                            incoming_filenames: BTreeMap::new(),
                        },
                    );
                    tables.by_type.insert(log_type.to_string(), request_id);
                    Admission::Admitted(request_id)
                }
            }
        };

        self.changed.notify_waiters();
        admission
    }

    /// Remember the file subsystem `index` announced; a failure it already
    /// reported keeps the slot empty
    pub fn record_incoming(&self, request_id: i32, index: usize, filename: String) {
        if let Some(entry) = self.tables.lock().uploads.get_mut(&request_id) {
            entry.incoming_filenames.entry(index).or_insert(filename);
        }
    }

    /// Count a subsystem's log status towards its request
    pub fn on_log_status(&self, index: usize, status: LogStatus) {
        {
            let mut tables = self.tables.lock();
            let entry = match tables.uploads.get_mut(&status.request_id) {
                Some(entry) => entry,
                None => return,
            };

            if !status.log_status.is_terminal() {
                return;
            }

            entry.feedback_count += 1;
            if status.log_status != LogStatusEnum::Uploaded {
                // nothing usable arrived from this subsystem
                entry.incoming_filenames.insert(index, String::new());
            }
            debug!(
                "System #{} reported {:?} for upload {} ({} reports)",
                index, status.log_status, status.request_id, entry.feedback_count
            );
        }

        self.changed.notify_waiters();
    }

    pub fn cancel(&self, request_id: i32) {
        if let Some(entry) = self.tables.lock().uploads.get_mut(&request_id) {
            entry.is_running = false;
        }
        self.changed.notify_waiters();
    }

    pub fn is_running(&self, request_id: i32) -> bool {
        self.tables
            .lock()
            .uploads
            .get(&request_id)
            .map(|e| e.is_running)
            .unwrap_or(false)
    }

    pub fn entry(&self, request_id: i32) -> Option<UploadEntry> {
        self.tables.lock().uploads.get(&request_id).cloned()
    }

    pub fn id_for_type(&self, log_type: &str) -> Option<i32> {
        self.tables.lock().by_type.get(log_type).copied()
    }

    pub fn len(&self) -> usize {
        self.tables.lock().uploads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop an entry, type index first
    pub fn remove(&self, request_id: i32) -> Option<UploadEntry> {
        let removed = {
            let mut tables = self.tables.lock();
            let log_type = tables.uploads.get(&request_id)?.log_type.clone();

            if tables.by_type.get(&log_type) == Some(&request_id) {
                tables.by_type.remove(&log_type);
            }
            tables.uploads.remove(&request_id)
        };

        self.changed.notify_waiters();
        removed
    }

    /// Wait until `expected` subsystems reported or the upload is canceled
    pub async fn wait_feedback(&self, request_id: i32, expected: usize, limit: Duration) -> FeedbackWait {
        let reported = self.wait_until(request_id, |entry| match entry {
            Some(entry) if entry.is_running => entry.feedback_count >= expected,
            _ => true,
        });
        let timed_out = tokio::time::timeout(limit, reported).await.is_err();

        if !self.is_running(request_id) {
            FeedbackWait::Canceled
        } else if timed_out {
            FeedbackWait::TimedOut
        } else {
            FeedbackWait::AllReported
        }
    }

    /// Resolves once the upload is no longer running
    pub async fn canceled(&self, request_id: i32) {
        self.wait_until(request_id, |entry| !entry.map(|e| e.is_running).unwrap_or(false))
            .await
    }

    async fn wait_until(&self, request_id: i32, done: impl Fn(Option<&UploadEntry>) -> bool) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if done(self.tables.lock().uploads.get(&request_id)) {
                return;
            }
            notified.await;
        }
    }
}

/// Final state of one upload workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded,
    Failed,
    Canceled,
}

/// Runs the background part of an accepted upload
pub struct LogUploader {
    registry: Arc<UploadRegistry>,
    sink: Arc<dyn EventSink>,
    helper: PathBuf,
    incoming_dir: PathBuf,
    incoming_timeout: Duration,
    default_retries: u32,
    default_retry_interval: Duration,
}

impl LogUploader {
    pub fn new(registry: Arc<UploadRegistry>, sink: Arc<dyn EventSink>, config: &AggregatorConfig) -> Self {
        Self {
            registry,
            sink,
            helper: config.upload_helper.clone(),
            incoming_dir: config.incoming_uploads_dir.clone(),
            incoming_timeout: config.incoming_upload_timeout,
            default_retries: config.default_retries,
            default_retry_interval: config.default_retry_interval,
        }
    }

    /// Wait for the subsystems, transfer the bundle, then clean up.
    ///
    /// `request` is the request as received, before it was rewritten for the
    /// subsystems.
    pub async fn complete(&self, request_id: i32, request: &UploadLogsRequest, subsystems: usize) -> UploadOutcome {
        let outcome = self.transfer(request_id, request, subsystems).await;
        self.cleanup(request_id).await;
        outcome
    }

    async fn transfer(&self, request_id: i32, request: &UploadLogsRequest, subsystems: usize) -> UploadOutcome {
        // keeps the backend from timing out while the subsystems upload
        let mut reported = LogStatus::new(LogStatusEnum::Uploading, request.request_id.unwrap_or(0));
        self.publish(reported);

        info!("Waiting for {} systems to upload...", subsystems);
        match self
            .registry
            .wait_feedback(request_id, subsystems, self.incoming_timeout)
            .await
        {
            FeedbackWait::AllReported => info!("All systems uploaded, proceeding"),
            FeedbackWait::TimedOut => warn!(
                "Not all systems uploaded within {:?}, proceeding nonetheless",
                self.incoming_timeout
            ),
            FeedbackWait::Canceled => {
                info!("Upload {} canceled", request_id);
                reported.log_status = LogStatusEnum::Idle;
                self.publish(reported);
                return UploadOutcome::Canceled;
            }
        }

        let entry = match self.registry.entry(request_id) {
            Some(entry) => entry,
            None => return UploadOutcome::Canceled,
        };

        let mut args = vec![entry.filename.clone(), request.location.clone()];
        args.extend(
            entry
                .incoming_filenames
                .values()
                .filter(|name| !name.is_empty())
                .cloned(),
        );

        let max_retries = request
            .retries
            .map(|r| r.max(0) as u32)
            .unwrap_or(self.default_retries);
        let retry_interval = request
            .retry_interval_s
            .map(|s| Duration::from_secs(s.max(0) as u64))
            .unwrap_or(self.default_retry_interval);

        let mut attempts = 0;
        while attempts <= max_retries && self.registry.is_running(request_id) {
            attempts += 1;
            debug!("Running upload helper, attempt {}", attempts);

            self.run_helper(request_id, &args, &mut reported).await;

            if !self.registry.is_running(request_id) {
                info!("Upload {} canceled while processing", request_id);
                return UploadOutcome::Canceled;
            }
            if reported.log_status == LogStatusEnum::Uploaded {
                info!("Upload {} of type \"{}\" done", request_id, entry.log_type);
                return UploadOutcome::Uploaded;
            }
            if attempts <= max_retries {
                tokio::select! {
                    _ = tokio::time::sleep(retry_interval) => {}
                    _ = self.registry.canceled(request_id) => {}
                }
            }
        }

        if self.registry.is_running(request_id) {
            warn!("Upload {} failed after {} attempts", request_id, attempts);
            UploadOutcome::Failed
        } else {
            UploadOutcome::Canceled
        }
    }

    async fn run_helper(&self, request_id: i32, args: &[String], reported: &mut LogStatus) {
        let mut child = match Command::new(&self.helper)
            .args(args)
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to start upload helper {}: {}", self.helper.display(), e);
                reported.log_status = LogStatusEnum::UploadFailure;
                self.publish(*reported);
                return;
            }
        };

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                let line = tokio::select! {
                    line = lines.next_line() => line,
                    _ = self.registry.canceled(request_id) => break,
                };

                match line {
                    Ok(Some(line)) => self.on_helper_line(line.trim(), reported),
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Failed to read upload helper output: {}", e);
                        break;
                    }
                }
            }
        }

        if !self.registry.is_running(request_id) {
            if let Err(e) = child.kill().await {
                warn!("Failed to stop upload helper: {}", e);
            }
        }
        if let Err(e) = child.wait().await {
            warn!("Upload helper did not exit cleanly: {}", e);
        }
    }

    fn on_helper_line(&self, line: &str, reported: &mut LogStatus) {
        debug!("Upload helper said: {}", line);

        match LogStatusEnum::from_token(line) {
            Some(LogStatusEnum::Uploaded) => {
                reported.log_status = LogStatusEnum::Uploaded;
                self.publish(*reported);
            }
            Some(
                LogStatusEnum::UploadFailure
                | LogStatusEnum::PermissionDenied
                | LogStatusEnum::BadMessage
                | LogStatusEnum::NotSupportedOperation,
            ) => {
                reported.log_status = LogStatusEnum::UploadFailure;
                self.publish(*reported);
            }
            _ => {}
        }
    }

    async fn cleanup(&self, request_id: i32) {
        if let Some(entry) = self.registry.entry(request_id) {
            for name in entry.incoming_filenames.values().filter(|n| !n.is_empty()) {
                let path = self.incoming_dir.join(name);
                debug!("Removing {}", path.display());
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    debug!("Could not remove {}: {}", path.display(), e);
                }
            }
        }

        if let Some(entry) = self.registry.remove(request_id) {
            info!("Upload of type \"{}\" finally processed", entry.log_type);
        }
    }

    fn publish(&self, status: LogStatus) {
        self.sink.publish(Event::LogStatus(status));
    }
}
