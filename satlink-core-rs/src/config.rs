//! Configuration for hub, satellite and aggregator
//!
//! Plain structs with defaults matching a typical charger deployment.

use std::path::PathBuf;
use std::time::Duration;

/// Default TCP port a satellite listens on
pub const DEFAULT_PORT: u16 = 7600;

/// Satellite-side configuration
#[derive(Debug, Clone)]
pub struct SatelliteConfig {
    /// Port to listen for the hub
    pub port: u16,

    /// Reset if the hub did not poll for this long
    pub watchdog_timeout: Duration,

    /// Delay before the controlled restart after a teardown
    pub restart_grace: Duration,

    /// Soft cap of the event accumulator
    pub accumulator_capacity: usize,
}

/// Hub-side configuration of one satellite link
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Satellite hostname or IP
    pub hostname: String,

    /// Satellite port
    pub port: u16,

    /// Call timeout during the handshake
    pub handshake_timeout: Duration,

    /// Delay before reconnecting after a connection error
    pub connect_backoff: Duration,

    /// Bounded wait for one drain of the satellite's events
    pub poll_timeout: Duration,

    /// Pause between two drains
    pub poll_interval: Duration,
}

/// Aggregator configuration
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Upload retries when the request does not specify any
    pub default_retries: u32,

    /// Pause between two upload attempts
    pub default_retry_interval: Duration,

    /// Where subsystems upload to, `{my-ip}` is substituted per subsystem
    pub upload_url_template: String,

    /// Staging directory of files uploaded by the subsystems
    pub incoming_uploads_dir: PathBuf,

    /// How long to wait for all subsystems to finish their upload
    pub incoming_upload_timeout: Duration,

    /// Executable that merges the staged files and transfers them
    pub upload_helper: PathBuf,

    /// Pause between the last remote reset and the local one
    pub reset_grace: Duration,
}

impl Default for SatelliteConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            watchdog_timeout: Duration::from_secs(60),
            restart_grace: Duration::from_millis(250),
            accumulator_capacity: 1000,
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            hostname: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            handshake_timeout: Duration::from_secs(5),
            connect_backoff: Duration::from_secs(1),
            poll_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(25),
        }
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            default_retries: 1,
            default_retry_interval: Duration::from_secs(60),
            upload_url_template: "ftp://{my-ip}/incoming/".to_string(),
            incoming_uploads_dir: PathBuf::from("/tmp/satlink-uploads"),
            incoming_upload_timeout: Duration::from_secs(600),
            upload_helper: PathBuf::from("/usr/libexec/satlink/logs_upload_helper.sh"),
            reset_grace: Duration::from_secs(3),
        }
    }
}

impl SatelliteConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    /// Set watchdog timeout
    pub fn with_watchdog_timeout(mut self, timeout: Duration) -> Self {
        self.watchdog_timeout = timeout;
        self
    }

    /// Set restart grace delay
    pub fn with_restart_grace(mut self, grace: Duration) -> Self {
        self.restart_grace = grace;
        self
    }

    /// Set accumulator capacity
    pub fn with_accumulator_capacity(mut self, capacity: usize) -> Self {
        self.accumulator_capacity = capacity;
        self
    }
}

impl HubConfig {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            ..Default::default()
        }
    }

    /// `host:port` of the satellite
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_connect_backoff(mut self, backoff: Duration) -> Self {
        self.connect_backoff = backoff;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl AggregatorConfig {
    pub fn with_default_retries(mut self, retries: u32, interval: Duration) -> Self {
        self.default_retries = retries;
        self.default_retry_interval = interval;
        self
    }

    pub fn with_upload_url_template(mut self, template: impl Into<String>) -> Self {
        self.upload_url_template = template.into();
        self
    }

    pub fn with_incoming_uploads(mut self, dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        self.incoming_uploads_dir = dir.into();
        self.incoming_upload_timeout = timeout;
        self
    }

    pub fn with_upload_helper(mut self, helper: impl Into<PathBuf>) -> Self {
        self.upload_helper = helper.into();
        self
    }

    pub fn with_reset_grace(mut self, grace: Duration) -> Self {
        self.reset_grace = grace;
        self
    }
}
