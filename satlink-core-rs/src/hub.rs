//! Hub side of one satellite link

use std::sync::Arc;

use futures_util::future::try_join_all;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::HubConfig;
use crate::error::Result;
use crate::forwarder::{RemoteEnergy, RemoteEvseManager, RemotePush, RemoteSystem};
use crate::handshake::establish_session;
use crate::interfaces::{DisconnectFlag, EventSink, SatelliteEndpoint};
use crate::types::{Event, Fault};
use crate::relay::{EventRelay, RelayExit};
use crate::rpc::{methods, ConnectionState, Connector, RpcChannel, TcpConnector};

/// An established session with one satellite
pub struct SatelliteLink {
    config: HubConfig,
    channel: Arc<dyn RpcChannel>,
    disconnect: DisconnectFlag,
}

impl SatelliteLink {
    /// Connect over TCP and complete the handshake
    pub async fn connect(config: HubConfig) -> Result<Self> {
        let connector = TcpConnector::new(config.address());
        Self::connect_with(&connector, config).await
    }

    pub async fn connect_with(connector: &dyn Connector, config: HubConfig) -> Result<Self> {
        let channel = establish_session(connector, &config).await?;

        Ok(Self {
            config,
            channel,
            disconnect: DisconnectFlag::new(),
        })
    }

    pub fn system(&self) -> Arc<RemoteSystem> {
        Arc::new(RemoteSystem::new(self.channel.clone(), self.disconnect.clone()))
    }

    pub fn evse_manager(&self) -> Arc<RemoteEvseManager> {
        Arc::new(RemoteEvseManager::new(self.channel.clone()))
    }

    pub fn energy(&self) -> Arc<RemoteEnergy> {
        Arc::new(RemoteEnergy::new(self.channel.clone()))
    }

    /// Sink whose events are pushed onto the satellite's bus
    pub fn push_sink(&self) -> Arc<dyn EventSink> {
        Arc::new(RemotePush::spawn(self.channel.clone()))
    }

    pub fn disconnect_flag(&self) -> DisconnectFlag {
        self.disconnect.clone()
    }

    /// Republish satellite events on `sink` until the link ends
    pub async fn relay(&self, sink: Arc<dyn EventSink>) -> RelayExit {
        EventRelay::new(self.channel.clone(), sink, self.disconnect.clone(), &self.config)
            .run()
            .await
    }

    /// Connect and start polling at once, relaying into `fallback` until
    /// the link is routed elsewhere
    pub async fn connect_polled(
        connector: &dyn Connector,
        config: HubConfig,
        fallback: Arc<dyn EventSink>,
    ) -> Result<PolledLink> {
        let link = Arc::new(Self::connect_with(connector, config).await?);
        let route = Arc::new(RelayRoute::new(fallback));

        let relay = {
            let link = link.clone();
            let sink: Arc<dyn EventSink> = route.clone();
            tokio::spawn(async move { link.relay(sink).await })
        };

        Ok(PolledLink { link, route, relay })
    }

    /// Ask the satellite to tear down and restart, then drop the link
    pub async fn shutdown(&self) {
        self.disconnect.expect();
        info!("Requesting graceful exit of satellite {}", self.config.address());

        if let Err(e) = self.channel.call(methods::GRACEFUL_EXIT, vec![]).await {
            warn!("Graceful exit of {} failed: {}", self.config.address(), e);
        }
        self.channel.close();
    }
}

impl SatelliteEndpoint for SatelliteLink {
    fn local_endpoint_address(&self) -> Option<String> {
        self.channel.local_addr().map(|addr| addr.ip().to_string())
    }

    fn remote_endpoint_address(&self) -> String {
        self.config.hostname.clone()
    }

    fn is_connected(&self) -> bool {
        self.channel.connection_state() == ConnectionState::Connected
    }
}

/// Connect to every satellite concurrently. Each one is polled as soon as
/// its own handshake completes, so no satellite waits on a slower one.
pub async fn connect_all(configs: Vec<HubConfig>, fallback: Arc<dyn EventSink>) -> Result<Vec<PolledLink>> {
    try_join_all(configs.into_iter().map(|config| {
        let fallback = fallback.clone();
        async move {
            let connector = TcpConnector::new(config.address());
            SatelliteLink::connect_polled(&connector, config, fallback).await
        }
    }))
    .await
}

/// Sink a relay starts on before the hub is assembled
pub struct RelayRoute {
    fallback: Arc<dyn EventSink>,
    target: RwLock<Option<Arc<dyn EventSink>>>,
}

impl RelayRoute {
    pub fn new(fallback: Arc<dyn EventSink>) -> Self {
        Self {
            fallback,
            target: RwLock::new(None),
        }
    }

    pub fn route_to(&self, target: Arc<dyn EventSink>) {
        *self.target.write() = Some(target);
    }

    fn current(&self) -> Arc<dyn EventSink> {
        self.target
            .read()
            .clone()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

impl EventSink for RelayRoute {
    fn publish(&self, event: Event) {
        self.current().publish(event);
    }

    fn raise_fault(&self, fault: Fault) {
        self.current().raise_fault(fault);
    }

    fn clear_fault(&self, fault: Fault) {
        self.current().clear_fault(fault);
    }
}

/// A link whose relay is already running
pub struct PolledLink {
    link: Arc<SatelliteLink>,
    route: Arc<RelayRoute>,
    relay: JoinHandle<RelayExit>,
}

impl PolledLink {
    pub fn link(&self) -> &Arc<SatelliteLink> {
        &self.link
    }

    /// Send relayed events to `target` from now on
    pub fn route_to(&self, target: Arc<dyn EventSink>) {
        self.route.route_to(target);
    }

    /// Wait for the relay to end
    pub async fn join(self) -> RelayExit {
        match self.relay.await {
            Ok(exit) => exit,
            Err(e) => {
                error!("Relay task of {} failed: {}", self.link.config.address(), e);
                RelayExit::Unexpected
            }
        }
    }
}
