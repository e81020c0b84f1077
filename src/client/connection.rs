use anyhow::{Context, Result};
use http::header::AUTHORIZATION;
use http::{HeaderName, HeaderValue};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::RelayError;
use crate::protocol::{TargetAddress, TARGET_HEADER};
use crate::tunnel::{Tunnel, TunnelId};

/// Forwards local TCP connections through a relay, one tunnel per connection.
pub struct TunnelClient {
    server: Url,
    token: String,
    target: TargetAddress,
    listen: String,
    shutdown: CancellationToken,
}

impl TunnelClient {
    pub fn new(server: &str, token: String, target: TargetAddress, listen: &str) -> Result<Self> {
        let server = Url::parse(server).with_context(|| format!("Invalid server URL: {}", server))?;
        match server.scheme() {
            "ws" | "wss" => {}
            other => anyhow::bail!("Server URL must use ws:// or wss://, got {}://", other),
        }
        if token.is_empty() {
            anyhow::bail!("Token must not be empty");
        }

        Ok(Self {
            server,
            token,
            target,
            listen: listen.to_string(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept local connections until shutdown, then wait for open tunnels.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.listen)
            .await
            .with_context(|| format!("Failed to bind {}", self.listen))?;
        self.serve(listener).await
    }

    async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!(
            "Forwarding {} -> {} via {}",
            listener.local_addr()?,
            self.target,
            self.server
        );

        let tracker = TaskTracker::new();
        loop {
            let (local, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        continue;
                    }
                },
            };
            if let Err(e) = local.set_nodelay(true) {
                debug!("Failed to set TCP_NODELAY: {}", e);
            }

            let forward = Forward {
                server: self.server.clone(),
                token: self.token.clone(),
                target: self.target.clone(),
                shutdown: self.shutdown.clone(),
            };
            tracker.spawn(async move {
                match forward.run(local).await {
                    Ok(()) => {}
                    Err(e) if e.downcast_ref::<RelayError>().is_some_and(RelayError::is_disconnect) => {
                        info!(%peer, "Relay went away: {:#}", e)
                    }
                    Err(e) => error!(%peer, "Tunnel failed: {:#}", e),
                }
            });
        }

        tracker.close();
        tracker.wait().await;
        Ok(())
    }
}

/// Per-connection copy of what a tunnel needs from the client.
struct Forward {
    server: Url,
    token: String,
    target: TargetAddress,
    shutdown: CancellationToken,
}

impl Forward {
    async fn run(self, local: TcpStream) -> Result<()> {
        let mut tunnel = Tunnel::new(TunnelId::next(), self.shutdown);
        tunnel.begin();

        let mut request = self.server.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&self.token).context("Token is not a valid header value")?,
        );
        headers.insert(
            HeaderName::from_static(TARGET_HEADER),
            HeaderValue::from_str(&self.target.to_string())?,
        );

        let ws = match connect_async(request).await {
            Ok((ws, _)) => ws,
            Err(WsError::Http(response)) => {
                tunnel.abandon();
                let detail = response
                    .body()
                    .as_deref()
                    .map(String::from_utf8_lossy)
                    .unwrap_or_default();
                anyhow::bail!("Relay refused tunnel: {} {}", response.status(), detail);
            }
            Err(e) => {
                tunnel.abandon();
                return Err(e).context("Failed to reach relay");
            }
        };
        info!(tunnel = %tunnel.id(), target = %self.target, "Tunnel open");

        let summary = tunnel.run(ws, local).await?;
        debug!(
            sent = summary.front_to_back,
            received = summary.back_to_front,
            "Local connection finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Secret;
    use crate::server::{RelayServer, ServerSettings};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_rejects_non_websocket_url() {
        let target = TargetAddress::new("localhost", 22);
        assert!(TunnelClient::new("http://relay", "t".into(), target.clone(), "127.0.0.1:0").is_err());
        assert!(TunnelClient::new("not a url", "t".into(), target.clone(), "127.0.0.1:0").is_err());
        assert!(TunnelClient::new("ws://relay", String::new(), target.clone(), "127.0.0.1:0").is_err());
        assert!(TunnelClient::new("wss://relay/", "t".into(), target, "127.0.0.1:0").is_ok());
    }

    #[tokio::test]
    async fn test_forwards_local_connection_end_to_end() {
        // Destination: echo server.
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = echo.accept().await.unwrap();
            let (mut read, mut write) = socket.split();
            let _ = tokio::io::copy(&mut read, &mut write).await;
        });

        let settings = ServerSettings {
            listen: "127.0.0.1:0".to_string(),
            ..ServerSettings::default()
        };
        let relay = RelayServer::bind(settings, Secret::new("tok").unwrap())
            .await
            .unwrap();
        let relay_addr = relay.local_addr().unwrap();
        tokio::spawn(relay.run());

        let client = TunnelClient::new(
            &format!("ws://{}/", relay_addr),
            "tok".to_string(),
            TargetAddress::new("127.0.0.1", echo_addr.port()),
            "127.0.0.1:0",
        )
        .unwrap();
        let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = local.local_addr().unwrap();
        tokio::spawn(async move { client.serve(local).await });

        let mut app = TcpStream::connect(local_addr).await.unwrap();
        app.write_all(b"through the relay").await.unwrap();

        let mut buf = [0u8; 17];
        tokio::time::timeout(Duration::from_secs(5), app.read_exact(&mut buf))
            .await
            .expect("echo should come back")
            .unwrap();
        assert_eq!(&buf, b"through the relay");
    }

    #[tokio::test]
    async fn test_refused_tunnel_reports_status() {
        let settings = ServerSettings {
            listen: "127.0.0.1:0".to_string(),
            ..ServerSettings::default()
        };
        let relay = RelayServer::bind(settings, Secret::new("right").unwrap())
            .await
            .unwrap();
        let relay_addr = relay.local_addr().unwrap();
        tokio::spawn(relay.run());

        let (local, _app) = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let app = TcpStream::connect(addr).await.unwrap();
            let (local, _) = listener.accept().await.unwrap();
            (local, app)
        };

        let forward = Forward {
            server: Url::parse(&format!("ws://{}/", relay_addr)).unwrap(),
            token: "wrong".to_string(),
            target: TargetAddress::new("127.0.0.1", 9),
            shutdown: CancellationToken::new(),
        };
        let err = forward.run(local).await.unwrap_err();
        assert!(err.to_string().contains("401"), "{}", err);
    }
}
