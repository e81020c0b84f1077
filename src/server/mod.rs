//! Relay server.
//!
//! Serves the upgrade endpoint with axum and turns each accepted request into
//! at most one tunnel:
//! - [`gate`] - credential, upgrade and target checks
//! - [`socket`] - adapts the upgraded socket to the tunnel's message type
//! - [`RelayServer`] - listener, tracked tunnel tasks and shutdown

mod gate;
mod socket;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::error::TunnelError;
use crate::protocol::{Secret, TargetAddress};
use crate::tunnel::{Connector, TcpConnector, Tunnel, TunnelId};

use gate::Gate;
use socket::UpgradedSocket;

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen: String,
    pub connect_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Everything a request handler needs, shared read-only across requests.
struct Shared<C> {
    gate: Gate,
    connector: C,
    settings: ServerSettings,
    shutdown: CancellationToken,
    tunnels: TaskTracker,
}

pub struct RelayServer<C = TcpConnector> {
    listener: TcpListener,
    shared: Arc<Shared<C>>,
}

impl RelayServer<TcpConnector> {
    pub async fn bind(settings: ServerSettings, secret: Secret) -> Result<Self> {
        Self::bind_with(settings, secret, TcpConnector).await
    }
}

impl<C: Connector> RelayServer<C> {
    /// Bind with a custom way of opening back streams.
    pub async fn bind_with(settings: ServerSettings, secret: Secret, connector: C) -> Result<Self> {
        let listener = TcpListener::bind(&settings.listen)
            .await
            .with_context(|| format!("Failed to bind {}", settings.listen))?;

        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                gate: Gate::new(Arc::new(secret)),
                connector,
                settings,
                shutdown: CancellationToken::new(),
                tunnels: TaskTracker::new(),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read listener address")
    }

    /// Token that stops the listener and closes live tunnels when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    pub async fn run(self) -> Result<()> {
        info!("Relay listening on {}", self.local_addr()?);

        // Any path, any method: the gate and the upgrade extractor decide.
        let app = Router::new()
            .fallback(relay::<C>)
            .with_state(self.shared.clone());

        let shutdown = self.shared.shutdown.clone();
        axum::serve(
            self.listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Relay server failed")?;

        let tunnels = &self.shared.tunnels;
        tunnels.close();
        info!(active = tunnels.len(), "Waiting for open tunnels to close");
        tunnels.wait().await;
        info!("Relay stopped");
        Ok(())
    }
}

/// A request that passed the gate and whose back stream is already connected.
struct Admitted<S> {
    upgrade: WebSocketUpgrade,
    target: TargetAddress,
    back: S,
}

/// Upgrade handler. Nothing is sent to the client until the gate has passed
/// and the back stream is connected, so every failure still gets a status.
async fn relay<C: Connector>(
    State(shared): State<Arc<Shared<C>>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let mut tunnel = Tunnel::new(TunnelId::next(), shared.shutdown.clone());
    let id = tunnel.id();
    debug!(tunnel = %id, %peer, "Upgrade requested");

    let Admitted {
        upgrade,
        target,
        back,
    } = match admit(&shared, &mut tunnel, &headers, upgrade).await {
        Ok(admitted) => admitted,
        Err(e) => return reject(id, peer, e),
    };

    let tunnels = shared.tunnels.clone();
    upgrade
        .on_failed_upgrade(move |e| debug!(tunnel = %id, %peer, "Upgrade failed: {}", e))
        .on_upgrade(move |socket| {
            tunnels.track_future(async move {
                info!(tunnel = %id, %peer, %target, "Tunnel open");
                match tunnel.run(UpgradedSocket::new(socket), back).await {
                    Ok(summary) => {
                        debug!(tunnel = %id, close_code = ?summary.close_code, "Connection finished")
                    }
                    Err(e) if e.is_disconnect() => {
                        info!(tunnel = %id, %peer, "Client went away: {}", e)
                    }
                    Err(e) => error!(tunnel = %id, %peer, "Tunnel failed: {}", e),
                }
            })
        })
}

/// Run the gate, then connect. Any error closes the tunnel before relaying.
async fn admit<C: Connector>(
    shared: &Shared<C>,
    tunnel: &mut Tunnel,
    headers: &HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Admitted<C::Stream>, TunnelError> {
    tunnel.begin();

    let checked = shared.gate.admit(headers).and_then(|target| {
        let upgrade = upgrade.map_err(|rejection| TunnelError::Handshake(rejection.body_text()))?;
        Ok((target, upgrade))
    });
    let (target, upgrade) = match checked {
        Ok(checked) => checked,
        Err(e) => {
            tunnel.abandon();
            return Err(e);
        }
    };

    debug!(tunnel = %tunnel.id(), %target, "Connecting");
    let back = tunnel
        .connect(&shared.connector, &target, shared.settings.connect_timeout)
        .await?;

    Ok(Admitted {
        upgrade,
        target,
        back,
    })
}

fn reject(id: TunnelId, peer: SocketAddr, e: TunnelError) -> Response {
    let status = e.status().unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        warn!(tunnel = %id, %peer, "Rejected with {}: {}", status, e);
    } else {
        info!(tunnel = %id, %peer, "Rejected with {}: {}", status, e);
    }
    (status, [(header::CONNECTION, "close")], e.to_string()).into_response()
}
