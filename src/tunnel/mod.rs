//! Tunnel lifecycle.
//!
//! A [`Tunnel`] pairs one front WebSocket stream with one back byte stream and
//! drives the two pumps in [`pump`] until either side ends:
//! - [`Connector`] - opens the back stream to a [`TargetAddress`]
//! - [`TunnelState`] - `Init -> Connecting -> Relaying -> Closed`
//! - [`TunnelSummary`] - per-direction byte counts once the tunnel closed

mod connector;
pub mod pump;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::codec::{BytesCodec, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{RelayError, TunnelError};
use crate::protocol::TargetAddress;

pub use connector::{Connector, TcpConnector};
use pump::{PumpEnd, Pumped};

/// How long the surviving pump gets to notice cancellation before it is aborted.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

static NEXT_TUNNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique tunnel identifier, used only for log correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TunnelId(pub u64);

impl TunnelId {
    pub fn next() -> Self {
        TunnelId(NEXT_TUNNEL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Init,
    Connecting,
    Relaying,
    Closed,
}

impl TunnelState {
    pub fn can_advance_to(self, next: TunnelState) -> bool {
        use TunnelState::*;
        matches!(
            (self, next),
            (Init, Connecting) | (Connecting, Relaying) | (Connecting, Closed) | (Relaying, Closed)
        )
    }
}

/// What a finished tunnel moved, and how the front stream was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelSummary {
    pub front_to_back: u64,
    pub back_to_front: u64,
    pub close_code: CloseCode,
}

pub struct Tunnel {
    id: TunnelId,
    state: TunnelState,
    shutdown: CancellationToken,
}

impl Tunnel {
    /// A new tunnel in `Init`. `shutdown` is the process-wide token; the
    /// tunnel derives its own child token from it when relaying starts.
    pub fn new(id: TunnelId, shutdown: CancellationToken) -> Self {
        Self {
            id,
            state: TunnelState::Init,
            shutdown,
        }
    }

    pub fn id(&self) -> TunnelId {
        self.id
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    fn advance(&mut self, next: TunnelState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal tunnel transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(tunnel = %self.id, from = ?self.state, to = ?next, "Tunnel state");
        self.state = next;
    }

    /// Enter `Connecting`: the request is being validated and the back stream opened.
    pub fn begin(&mut self) {
        self.advance(TunnelState::Connecting);
    }

    /// Give up before relaying (rejected request, failed connect).
    pub fn abandon(&mut self) {
        self.advance(TunnelState::Closed);
    }

    /// Open the back stream, bounded by `timeout`.
    ///
    /// On failure the tunnel is closed and the error maps to a 500.
    pub async fn connect<C: Connector>(
        &mut self,
        connector: &C,
        target: &TargetAddress,
        timeout: Duration,
    ) -> Result<C::Stream, TunnelError> {
        let connected = match tokio::time::timeout(timeout, connector.connect(target)).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connect timed out after {:?}", timeout),
            )),
        };

        connected.map_err(|source| {
            self.abandon();
            TunnelError::Connect {
                target: target.clone(),
                source,
            }
        })
    }

    /// Relay between `front` and `back` until either side ends, then close both.
    ///
    /// Errors after this point are not reported to the peer beyond the close
    /// code on the front stream.
    pub async fn run<F, B>(mut self, front: F, back: B) -> Result<TunnelSummary, RelayError>
    where
        F: Stream<Item = Result<Message, WsError>>
            + Sink<Message, Error = WsError>
            + Unpin
            + Send
            + 'static,
        B: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.advance(TunnelState::Relaying);
        let cancel = self.shutdown.child_token();

        let (mut sink, stream) = front.split();
        let (reader, writer) = tokio::io::split(back);

        let mut upstream = tokio::spawn(pump::front_to_back(
            stream,
            FramedWrite::new(writer, BytesCodec::new()),
            cancel.clone(),
        ));
        let mut downstream = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let pumped = pump::back_to_front(reader, &mut sink, cancel).await;
                (pumped, sink)
            }
        });

        // Whichever direction ends first takes the other down with it.
        let (up, down) = tokio::select! {
            up = &mut upstream => {
                cancel.cancel();
                (flatten(up), join_within(downstream, CLOSE_GRACE).await)
            }
            down = &mut downstream => {
                cancel.cancel();
                let down = down.map_err(|e| RelayError::Task(e.to_string()));
                (join_within(upstream, CLOSE_GRACE).await.and_then(|r| r), down)
            }
        };

        let (down, sink) = match down {
            Ok((pumped, sink)) => (pumped, Some(sink)),
            Err(e) => (Err(e), None),
        };

        let close_code = match (&up, &down) {
            (Err(_), _) | (_, Err(_)) => CloseCode::Error,
            _ if self.shutdown.is_cancelled() => CloseCode::Away,
            _ => CloseCode::Normal,
        };

        if let Some(mut sink) = sink {
            let frame = CloseFrame {
                code: close_code,
                reason: "".into(),
            };
            // The peer may already be gone; the close is best effort.
            let _ = sink.send(Message::Close(Some(frame))).await;
            let _ = sink.close().await;
        }
        self.advance(TunnelState::Closed);

        match (up, down) {
            (Ok(up), Ok(down)) => {
                info!(
                    tunnel = %self.id,
                    front_to_back = up.bytes,
                    back_to_front = down.bytes,
                    messages = up.chunks + down.chunks,
                    ended_by = ended_by(&up, &down),
                    "Tunnel closed"
                );
                Ok(TunnelSummary {
                    front_to_back: up.bytes,
                    back_to_front: down.bytes,
                    close_code,
                })
            }
            (Err(e), _) | (_, Err(e)) => {
                if e.is_disconnect() {
                    debug!(tunnel = %self.id, error = %e, "Tunnel closed by peer reset");
                } else {
                    warn!(tunnel = %self.id, error = %e, "Tunnel closed on relay error");
                }
                Err(e)
            }
        }
    }
}

fn flatten(
    joined: Result<Result<Pumped, RelayError>, tokio::task::JoinError>,
) -> Result<Pumped, RelayError> {
    joined.map_err(|e| RelayError::Task(e.to_string()))?
}

/// Wait for a cancelled pump to wind down, aborting it if it does not.
async fn join_within<T>(mut handle: JoinHandle<T>, grace: Duration) -> Result<T, RelayError> {
    match tokio::time::timeout(grace, &mut handle).await {
        Ok(joined) => joined.map_err(|e| RelayError::Task(e.to_string())),
        Err(_) => {
            handle.abort();
            Err(RelayError::Task("pump did not stop after cancellation".to_string()))
        }
    }
}

fn ended_by(up: &Pumped, down: &Pumped) -> &'static str {
    match (up.end, down.end) {
        (PumpEnd::Eof, _) => "front",
        (_, PumpEnd::Eof) => "back",
        _ => "shutdown",
    }
}
