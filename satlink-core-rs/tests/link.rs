//! End-to-end test of one hub/satellite link over loopback TCP

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use satlink_core::{
    connect_all, AggregatorConfig, BootReason, EnergyApi, Event, EventSink, EvseManagerApi, FirmwareUpdateRequest,
    HubConfig, LinkState, LocalSubsystems, RelayExit, ResetType, Restarter, Result, SatelliteAgent,
    SatelliteConfig, SatelliteEndpoint, SatelliteLink, Subsystem, SystemAggregator, SystemApi,
    UpdateFirmwareResponse, UploadLogsRequest, UploadLogsResponse, UploadLogsStatus,
};

#[derive(Default)]
struct Journal(Mutex<Vec<String>>);

impl Journal {
    fn push(&self, call: impl Into<String>) {
        self.0.lock().push(call.into());
    }

    fn calls(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

struct Station {
    name: &'static str,
    journal: Arc<Journal>,
}

#[async_trait]
impl SystemApi for Station {
    async fn update_firmware(&self, _request: FirmwareUpdateRequest) -> Result<UpdateFirmwareResponse> {
        self.journal.push(format!("{}:update_firmware", self.name));
        Ok(UpdateFirmwareResponse::Accepted)
    }

    async fn allow_firmware_installation(&self) -> Result<()> {
        Ok(())
    }

    async fn upload_logs(&self, _request: UploadLogsRequest) -> Result<UploadLogsResponse> {
        Ok(UploadLogsResponse {
            upload_logs_status: UploadLogsStatus::Rejected,
            file_name: None,
        })
    }

    async fn is_reset_allowed(&self, _reset_type: ResetType) -> Result<bool> {
        self.journal.push(format!("{}:is_reset_allowed", self.name));
        Ok(true)
    }

    async fn reset(&self, reset_type: ResetType, _scheduled: bool) -> Result<()> {
        self.journal.push(format!("{}:reset:{}", self.name, reset_type));
        Ok(())
    }

    async fn set_system_time(&self, _timestamp: String) -> Result<bool> {
        Ok(true)
    }

    async fn get_boot_reason(&self) -> Result<BootReason> {
        Ok(BootReason::PowerUp)
    }
}

struct Evse {
    journal: Arc<Journal>,
}

#[async_trait]
impl EvseManagerApi for Evse {
    async fn get_evse(&self) -> Result<Value> {
        Ok(json!({"id": 1, "connectors": [{"id": 1}]}))
    }

    async fn enable_disable(&self, connector_id: i32, _cmd_source: Value) -> Result<bool> {
        self.journal.push(format!("enable_disable:{}", connector_id));
        Ok(true)
    }

    async fn authorize_response(&self, _provided_token: Value, _validation_result: Value) -> Result<()> {
        Ok(())
    }

    async fn withdraw_authorization(&self) -> Result<()> {
        Ok(())
    }

    async fn reserve(&self, reservation_id: i32) -> Result<bool> {
        self.journal.push(format!("reserve:{}", reservation_id));
        Ok(true)
    }

    async fn cancel_reservation(&self) -> Result<()> {
        Ok(())
    }

    async fn set_faulted(&self) -> Result<()> {
        Ok(())
    }

    async fn pause_charging(&self) -> Result<bool> {
        Ok(true)
    }

    async fn resume_charging(&self) -> Result<bool> {
        Ok(true)
    }

    async fn stop_transaction(&self, _request: Value) -> Result<bool> {
        Ok(true)
    }

    async fn force_unlock(&self, _connector_id: i32) -> Result<bool> {
        Ok(false)
    }

    async fn set_external_limits(&self, _limits: Value) -> Result<bool> {
        Ok(true)
    }

    async fn switch_three_phases_while_charging(&self, _three_phases: bool) -> Result<()> {
        Ok(())
    }

    async fn set_get_certificate_response(&self, _certificate_response: Value) -> Result<()> {
        Ok(())
    }

    async fn external_ready_to_start_charging(&self) -> Result<bool> {
        Ok(true)
    }
}

struct Energy {
    journal: Arc<Journal>,
}

#[async_trait]
impl EnergyApi for Energy {
    async fn enforce_limits(&self, limits: Value) -> Result<()> {
        self.journal.push(format!("enforce_limits:{}", limits));
        Ok(())
    }
}

#[derive(Default)]
struct Bus(Mutex<Vec<Event>>);

impl EventSink for Bus {
    fn publish(&self, event: Event) {
        self.0.lock().push(event);
    }
}

impl Bus {
    fn events(&self) -> Vec<Event> {
        self.0.lock().clone()
    }
}

#[derive(Default)]
struct Restarts(AtomicUsize);

#[async_trait]
impl Restarter for Restarts {
    async fn restart(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

struct Setup {
    agent: Arc<SatelliteAgent>,
    link: Arc<SatelliteLink>,
    journal: Arc<Journal>,
    satellite_bus: Arc<Bus>,
    restarts: Arc<Restarts>,
}

fn satellite(config: SatelliteConfig) -> (Arc<SatelliteAgent>, Arc<Journal>, Arc<Bus>, Arc<Restarts>) {
    let journal = Arc::new(Journal::default());
    let satellite_bus = Arc::new(Bus::default());
    let restarts = Arc::new(Restarts::default());

    let local = LocalSubsystems {
        system: Arc::new(Station {
            name: "satellite",
            journal: journal.clone(),
        }),
        evse_manager: Arc::new(Evse {
            journal: journal.clone(),
        }),
        energy: Arc::new(Energy {
            journal: journal.clone(),
        }),
        bus: satellite_bus.clone(),
    };
    let agent = Arc::new(SatelliteAgent::new(config, local, restarts.clone()));
    (agent, journal, satellite_bus, restarts)
}

async fn setup() -> Setup {
    let config = SatelliteConfig::new(0).with_restart_grace(Duration::from_millis(10));
    let (agent, journal, satellite_bus, restarts) = satellite(config);
    let addr = agent.start().await.unwrap();

    let init = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.init().await })
    };

    let config = HubConfig::new("127.0.0.1", addr.port()).with_poll_interval(Duration::from_millis(10));
    let link = Arc::new(SatelliteLink::connect(config).await.unwrap());
    init.await.unwrap().unwrap();

    Setup {
        agent,
        link,
        journal,
        satellite_bus,
        restarts,
    }
}

#[tokio::test]
async fn test_handshake_activates_both_sides() {
    let s = setup().await;

    assert_eq!(s.agent.link_state(), LinkState::Active);
    assert!(s.link.is_connected());
    assert_eq!(s.link.local_endpoint_address().as_deref(), Some("127.0.0.1"));
}

#[tokio::test]
async fn test_commands_and_events_cross_the_link() {
    let s = setup().await;

    let hub_bus = Arc::new(Bus::default());
    let relay = {
        let link = s.link.clone();
        let bus = hub_bus.clone();
        tokio::spawn(async move { link.relay(bus).await })
    };

    assert!(s.link.evse_manager().reserve(5).await.unwrap());
    assert_eq!(s.link.evse_manager().get_evse().await.unwrap()["id"], 1);
    s.link.energy().enforce_limits(json!({"limit_a": 16})).await.unwrap();
    assert_eq!(
        s.journal.calls(),
        vec!["reserve:5", "enforce_limits:{\"limit_a\":16}"]
    );

    let sink = s.agent.event_sink();
    sink.publish(Event::Ready(true));
    sink.publish(Event::Telemetry(json!({"temperature": 24.0})));
    assert!(eventually(|| hub_bus.events().len() == 2).await);
    assert_eq!(hub_bus.events()[0], Event::Ready(true));

    s.link
        .push_sink()
        .publish(Event::TokenValidationStatus(json!({"result": "Accepted"})));
    assert!(eventually(|| !s.satellite_bus.events().is_empty()).await);

    s.link.shutdown().await;
    assert_eq!(relay.await.unwrap(), RelayExit::Expected);
    assert!(eventually(|| s.restarts.0.load(Ordering::SeqCst) == 1).await);
}

#[tokio::test]
async fn test_aggregated_reset_reaches_satellite_first() {
    let s = setup().await;
    let hub = Arc::new(Station {
        name: "hub",
        journal: s.journal.clone(),
    });

    let subsystems = vec![
        Subsystem::local(hub),
        Subsystem::remote(s.link.system(), s.link.clone()),
    ];
    let config = AggregatorConfig::default().with_reset_grace(Duration::from_millis(10));
    let aggregator = SystemAggregator::new(subsystems, config, Arc::new(Bus::default())).unwrap();

    assert!(aggregator.is_reset_allowed(ResetType::Soft).await.unwrap());
    aggregator.reset(ResetType::Soft, false).await.unwrap();

    assert_eq!(
        s.journal.calls(),
        vec![
            "hub:is_reset_allowed",
            "satellite:is_reset_allowed",
            "satellite:reset:Soft",
            "hub:reset:Soft",
        ]
    );
    assert!(s.link.disconnect_flag().is_expected());
    assert!(s.agent.disconnect_flag().is_expected());
}

#[tokio::test]
async fn test_rejected_remote_upload_rejects_request() {
    let s = setup().await;
    let hub = Arc::new(Station {
        name: "hub",
        journal: s.journal.clone(),
    });

    let subsystems = vec![
        Subsystem::local(hub),
        Subsystem::remote(s.link.system(), s.link.clone()),
    ];
    let aggregator =
        SystemAggregator::new(subsystems, AggregatorConfig::default(), Arc::new(Bus::default())).unwrap();

    let response = aggregator
        .upload_logs(UploadLogsRequest {
            location: "ftp://backend.example/".to_string(),
            log_type: Some("DiagnosticsLog".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(response.upload_logs_status, UploadLogsStatus::Rejected);
    assert!(aggregator.uploads().is_empty());
}

#[tokio::test]
async fn test_early_satellite_is_polled_while_another_starts() {
    let watchdog = Duration::from_millis(200);
    let (early, _, _, early_restarts) = satellite(SatelliteConfig::new(0).with_watchdog_timeout(watchdog));
    let early_addr = early.start().await.unwrap();
    let early_watch = {
        let agent = early.clone();
        tokio::spawn(async move {
            agent.init().await.unwrap();
            agent.ready().await
        })
    };

    // nothing listens on the late satellite's port yet
    let late_port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let hub_config = |port| {
        HubConfig::new("127.0.0.1", port)
            .with_connect_backoff(Duration::from_millis(20))
            .with_poll_interval(Duration::from_millis(10))
    };
    let fallback = Arc::new(Bus::default());
    let connecting = {
        let fallback = fallback.clone();
        tokio::spawn(connect_all(vec![hub_config(early_addr.port()), hub_config(late_port)], fallback))
    };

    tokio::time::sleep(watchdog * 3).await;
    assert!(!connecting.is_finished());
    assert_eq!(early.link_state(), LinkState::Active);

    let (late, _, _, late_restarts) = satellite(SatelliteConfig::new(late_port).with_watchdog_timeout(watchdog));
    late.start().await.unwrap();
    let late_init = {
        let agent = late.clone();
        tokio::spawn(async move { agent.init().await })
    };

    let polled = connecting.await.unwrap().unwrap();
    late_init.await.unwrap().unwrap();
    assert_eq!(polled.len(), 2);
    assert!(polled.iter().all(|p| p.link().is_connected()));
    assert_eq!(early_restarts.0.load(Ordering::SeqCst), 0);
    assert_eq!(late_restarts.0.load(Ordering::SeqCst), 0);
    assert!(!early_watch.is_finished());

    // events relayed before routing land on the fallback, later ones on the target
    early.event_sink().publish(Event::Ready(true));
    assert!(eventually(|| fallback.events() == vec![Event::Ready(true)]).await);

    let target = Arc::new(Bus::default());
    polled[0].route_to(target.clone());
    early.event_sink().publish(Event::Ready(false));
    assert!(eventually(|| target.events() == vec![Event::Ready(false)]).await);
    assert_eq!(fallback.events().len(), 1);
}
