//! Satlink Node
//!
//! Runs either side of the hub/satellite link on top of a simulated charging stack.

mod sim;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures_util::future::{select_all, FutureExt};
use satlink_core::{
    connect_all, AggregatorConfig, EventSink, HubConfig, LocalSubsystems, RelayExit, SatelliteAgent, SatelliteConfig,
    SatelliteLink, Subsystem, SystemAggregator, SystemApi, SystemRestarter, WatchdogExit, DEFAULT_PORT,
};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use sim::{HubBus, LogBus, SimEnergy, SimEvse, SimSystem};

/// Hub/satellite node for modular charging stations
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Serve the local stack to a hub
    Satellite {
        /// TCP port to listen on
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Seconds without a hub poll before resetting
        #[arg(long, default_value = "60")]
        watchdog_timeout: u64,

        /// Seconds between simulated telemetry readings
        #[arg(long, default_value = "5")]
        telemetry_period: u64,
    },
    /// Drive one or more satellites
    Hub {
        /// Satellite to connect to, as host or host:port
        #[arg(short, long, required = true)]
        satellite: Vec<String>,

        /// Helper merging and transferring uploaded logs
        #[arg(long)]
        upload_helper: Option<PathBuf>,

        /// Directory receiving the satellites' log uploads
        #[arg(long)]
        incoming_uploads: Option<PathBuf>,

        /// Upload attempts when a request does not specify any
        #[arg(long, default_value = "1")]
        retries: u32,

        /// Seconds between upload attempts
        #[arg(long, default_value = "60")]
        retry_interval: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match args.role {
        Role::Satellite {
            port,
            watchdog_timeout,
            telemetry_period,
        } => {
            let config = SatelliteConfig::new(port).with_watchdog_timeout(Duration::from_secs(watchdog_timeout));
            run_satellite(config, Duration::from_secs(telemetry_period)).await
        }
        Role::Hub {
            satellite,
            upload_helper,
            incoming_uploads,
            retries,
            retry_interval,
        } => {
            let mut config =
                AggregatorConfig::default().with_default_retries(retries, Duration::from_secs(retry_interval));
            if let Some(helper) = upload_helper {
                config = config.with_upload_helper(helper);
            }
            if let Some(dir) = incoming_uploads {
                let timeout = config.incoming_upload_timeout;
                config = config.with_incoming_uploads(dir, timeout);
            }
            run_hub(&satellite, config).await
        }
    }
}

async fn run_satellite(config: SatelliteConfig, telemetry_period: Duration) -> Result<(), Box<dyn std::error::Error>> {
    info!("Satlink satellite starting on port {}", config.port);

    let system = Arc::new(SimSystem::new("satellite"));
    let local = LocalSubsystems {
        system: system.clone(),
        evse_manager: Arc::new(SimEvse::new("satellite")),
        energy: Arc::new(SimEnergy::new("satellite")),
        bus: Arc::new(LogBus::new("satellite")),
    };
    let restarter = Arc::new(SystemRestarter::new(Some(system.clone())));
    let agent = SatelliteAgent::new(config, local, restarter);

    let events = agent.event_sink();
    system.attach(events.clone());

    let addr = agent.start().await?;
    info!("Listening on {}", addr);

    agent.init().await?;
    tokio::spawn(sim::run_telemetry(events, telemetry_period));

    match agent.ready().await {
        WatchdogExit::Restarted => warn!("Hub stopped polling, restart requested"),
        WatchdogExit::DisconnectExpected => info!("Hub left as expected"),
    }
    agent.stop();
    Ok(())
}

fn parse_satellite(address: &str) -> Result<HubConfig, Box<dyn std::error::Error>> {
    match address.rsplit_once(':') {
        Some((host, port)) => Ok(HubConfig::new(host, port.parse()?)),
        None => Ok(HubConfig::new(address, DEFAULT_PORT)),
    }
}

async fn run_hub(satellites: &[String], config: AggregatorConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("Satlink hub starting with {} satellite(s)", satellites.len());

    let configs = satellites
        .iter()
        .map(|address| parse_satellite(address))
        .collect::<Result<Vec<_>, _>>()?;

    // satellites are polled as soon as they connect; early events are only logged
    let polled = connect_all(configs, Arc::new(LogBus::new("hub"))).await?;
    info!("All satellites connected");

    let links: Vec<Arc<SatelliteLink>> = polled.iter().map(|p| p.link().clone()).collect();
    let bus: Arc<dyn EventSink> = Arc::new(HubBus::new(links.iter().map(|link| link.push_sink()).collect()));
    let system = Arc::new(SimSystem::new("hub"));

    let mut subsystems = vec![Subsystem::local(system.clone() as Arc<dyn SystemApi>)];
    for link in &links {
        subsystems.push(Subsystem::remote(link.system(), link.clone()));
    }
    let aggregator = Arc::new(SystemAggregator::new(subsystems, config, bus.clone())?);
    system.attach(aggregator.subsystem_sink(0, bus.clone()));

    let mut relays: Vec<_> = polled
        .into_iter()
        .enumerate()
        .map(|(i, p)| {
            p.route_to(aggregator.subsystem_sink(i + 1, bus.clone()));
            async move { (i + 1, p.join().await) }.boxed()
        })
        .collect();

    // the aggregated system stands in for the backend-facing side
    let boot_reason = aggregator.get_boot_reason().await?;
    info!("Boot reason: {:?}", boot_reason);

    loop {
        tokio::select! {
            ((index, exit), _, remaining) = select_all(relays) => {
                match exit {
                    RelayExit::Expected => info!("Satellite #{} left as expected", index),
                    RelayExit::Unexpected => {
                        error!("Lost satellite #{}, terminating", index);
                        std::process::exit(1);
                    }
                }
                if remaining.is_empty() {
                    info!("No satellites left");
                    return Ok(());
                }
                relays = remaining;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                for link in &links {
                    link.shutdown().await;
                }
                return Ok(());
            }
        }
    }
}
