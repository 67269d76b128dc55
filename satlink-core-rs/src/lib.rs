//! Satlink Core Library
//!
//! Hub/satellite synchronization for modular EV charging stations.
//!
//! A hub drives one or more satellite nodes over a bidirectional JSON-RPC link.
//! Each satellite exposes its local EVSE, energy and system subsystems, buffers
//! the events they emit and hands them over when the hub polls. The hub wraps
//! every link in proxies that look like local subsystems and merges all system
//! subsystems into one aggregated system.
//!
//! ```text
//!        hub                                 satellite
//! ┌──────────────────┐    announce       ┌──────────────────┐
//! │ SatelliteLink    │──────────────────►│ SatelliteAgent   │
//! │  Remote* proxies │◄──── commands ───►│  LocalSubsystems │
//! │  EventRelay      │◄── retrieve-... ──│  EventAccumulator│
//! │ SystemAggregator │                   │  Watchdog        │
//! └──────────────────┘                   └──────────────────┘
//! ```

pub mod accumulator;
pub mod aggregator;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod handshake;
pub mod hub;
pub mod interfaces;
pub mod relay;
pub mod rpc;
pub mod satellite;
pub mod types;
pub mod upload;
pub mod watchdog;

#[cfg(test)]
mod testing;

pub use types::*;
pub use accumulator::{EventAccumulator, PushOutcome};
pub use aggregator::{AggregatingSink, Subsystem, SystemAggregator};
pub use config::{AggregatorConfig, HubConfig, SatelliteConfig, DEFAULT_PORT};
pub use error::{Error, Result, RpcError};
pub use handshake::{LinkState, LinkStateMachine};
pub use hub::{connect_all, PolledLink, RelayRoute, SatelliteLink};
pub use interfaces::{
    DisconnectFlag, EnergyApi, EventSink, EvseManagerApi, Restarter, SatelliteEndpoint, SystemApi,
    SystemRestarter,
};
pub use relay::RelayExit;
pub use rpc::{RpcClient, RpcServer};
pub use satellite::{LocalSubsystems, SatelliteAgent};
pub use watchdog::WatchdogExit;
