//! Hub/satellite handshake
//!
//! Three-phase bring-up of a link:
//!
//! ```text
//!  hub                                satellite
//!   │ ── announce ──────────────────▶ │  Init → Announced      (reply: false)
//!   │                                 │  register command bindings
//!   │ ── peer-ready ────────────────▶ │  → PeerReady / Active
//!   │ ◀──────────── (after bindings)  │  → SelfReady / Active
//!   │ clear call timeout              │
//! ```
//!
//! A second `announce` on an announced link means the hub lost its state: the
//! satellite replies `true`, tears the link down and restarts. The hub treats a
//! `true` reply as "not fresh" and keeps reconnecting until it gets `false`.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HubConfig;
use crate::error::{Error, Result, RpcError};
use crate::rpc::{methods, Connector, RpcChannel};

/// Satellite-side state of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Waiting for the hub to announce itself
    Init,
    /// Hub announced, command bindings are being registered
    Announced,
    /// Hub is ready, our bindings are not registered yet
    PeerReady,
    /// Our bindings are registered, hub not ready yet
    SelfReady,
    /// Both sides ready, relaying
    Active,
    /// Link is being torn down for a restart
    Teardown,
}

impl LinkState {
    pub fn is_announced(&self) -> bool {
        !matches!(self, LinkState::Init | LinkState::Teardown)
    }

    pub fn is_self_ready(&self) -> bool {
        matches!(self, LinkState::SelfReady | LinkState::Active)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, LinkState::Active)
    }
}

/// Result of an `announce` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceOutcome {
    /// First announcement on this link
    Fresh,
    /// Repeated announcement, the link was just moved to teardown
    Desync,
    /// Repeated announcement while already tearing down
    AlreadyTornDown,
}

impl AnnounceOutcome {
    /// Value returned to the hub: whether we have seen it before
    pub fn seen_before(&self) -> bool {
        !matches!(self, AnnounceOutcome::Fresh)
    }
}

/// Result of a `peer-ready` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyOutcome {
    /// Readiness recorded; the call returns once our bindings are registered
    Accepted,
    /// Readiness was already recorded, ignored
    Duplicate,
    /// Hub is ready before it announced itself, ignored
    NotAnnounced,
    /// Link is being torn down
    TornDown,
}

/// Satellite-side handshake state machine
#[derive(Debug)]
pub struct LinkStateMachine {
    state: watch::Sender<LinkState>,
}

impl Default for LinkStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkStateMachine {
    pub fn new() -> Self {
        let (state, _) = watch::channel(LinkState::Init);
        Self { state }
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Handle the hub's `announce`
    pub fn announce(&self) -> AnnounceOutcome {
        let mut outcome = AnnounceOutcome::Fresh;

        self.state.send_if_modified(|state| match *state {
            LinkState::Init => {
                *state = LinkState::Announced;
                true
            }
            LinkState::Teardown => {
                outcome = AnnounceOutcome::AlreadyTornDown;
                false
            }
            _ => {
                outcome = AnnounceOutcome::Desync;
                *state = LinkState::Teardown;
                true
            }
        });

        outcome
    }

    /// Handle the hub's `peer-ready`
    pub fn peer_ready(&self) -> ReadyOutcome {
        let mut outcome = ReadyOutcome::Accepted;

        self.state.send_if_modified(|state| match *state {
            LinkState::Announced => {
                *state = LinkState::PeerReady;
                true
            }
            LinkState::SelfReady => {
                *state = LinkState::Active;
                true
            }
            LinkState::PeerReady | LinkState::Active => {
                outcome = ReadyOutcome::Duplicate;
                false
            }
            LinkState::Init => {
                outcome = ReadyOutcome::NotAnnounced;
                false
            }
            LinkState::Teardown => {
                outcome = ReadyOutcome::TornDown;
                false
            }
        });

        outcome
    }

    /// Record that our command bindings are registered
    pub fn self_ready(&self) -> Result<()> {
        let mut result = Ok(());

        self.state.send_if_modified(|state| match *state {
            LinkState::Announced => {
                *state = LinkState::SelfReady;
                true
            }
            LinkState::PeerReady => {
                *state = LinkState::Active;
                true
            }
            other => {
                result = Err(Error::Protocol(format!("cannot become ready in state {:?}", other)));
                false
            }
        });

        result
    }

    /// Move to teardown; returns `false` if already there
    pub fn teardown(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == LinkState::Teardown {
                false
            } else {
                *state = LinkState::Teardown;
                true
            }
        })
    }

    pub async fn wait_announced(&self) -> Result<()> {
        self.wait_until(|s| s.is_announced()).await
    }

    pub async fn wait_self_ready(&self) -> Result<()> {
        self.wait_until(|s| s.is_self_ready()).await
    }

    pub async fn wait_active(&self) -> Result<()> {
        self.wait_until(|s| s.is_active()).await
    }

    async fn wait_until(&self, reached: impl Fn(LinkState) -> bool) -> Result<()> {
        let mut rx = self.state.subscribe();

        loop {
            let state = *rx.borrow_and_update();
            if state == LinkState::Teardown {
                return Err(Error::Protocol("link torn down".to_string()));
            }
            if reached(state) {
                return Ok(());
            }
            if rx.changed().await.is_err() {
                return Err(Error::Protocol("link state dropped".to_string()));
            }
        }
    }
}

/// Hub side: connect until the satellite confirms a fresh session, then
/// complete the rendezvous and switch to untimed steady-state calls
pub async fn establish_session(
    connector: &dyn Connector,
    config: &HubConfig,
) -> std::result::Result<Arc<dyn RpcChannel>, RpcError> {
    info!("Connecting to satellite on {}...", config.address());

    let channel = loop {
        let channel = match connector.connect().await {
            Ok(channel) => channel,
            Err(e) => {
                debug!("Connect failed: {}", e);
                tokio::time::sleep(config.connect_backoff).await;
                continue;
            }
        };

        channel.set_timeout(config.handshake_timeout);

        debug!("Signaling 'announce'...");
        match channel.call(methods::ANNOUNCE, vec![]).await {
            Ok(reply) => match reply.as_bool() {
                Some(false) => break channel,
                Some(true) => {
                    warn!("Satellite {} has seen us before, reconnecting", config.address());
                    channel.close();
                }
                None => {
                    warn!("Unexpected 'announce' reply: {}", reply);
                    channel.close();
                    tokio::time::sleep(config.connect_backoff).await;
                }
            },
            Err(RpcError::Timeout) => {
                debug!("'announce' timed out, retrying");
                channel.close();
            }
            Err(e) if e.is_retryable_connect() => {
                debug!("'announce' failed: {}", e);
                channel.close();
                tokio::time::sleep(config.connect_backoff).await;
            }
            Err(e) => {
                warn!("'announce' rejected by satellite: {}", e);
                channel.close();
                tokio::time::sleep(config.connect_backoff).await;
            }
        }
    };

    let session = Uuid::new_v4();
    info!("Fresh session {} with satellite {}", session, config.address());

    debug!("Signaling 'peer-ready'...");
    channel.call(methods::PEER_READY, vec![]).await?;

    // steady-state calls must not time out
    channel.clear_timeout();
    info!("Session {} active", session);

    Ok(channel)
}
