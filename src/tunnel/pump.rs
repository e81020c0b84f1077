//! The two unidirectional copy loops of a tunnel.
//!
//! Each pump owns one read side and one write side, runs until its source
//! finishes, fails, or the tunnel's cancellation token fires, and never
//! buffers more than one chunk ahead of its sink.

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::RelayError;

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// How a pump stopped, when it stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    /// The source finished (TCP EOF, or a WebSocket Close frame).
    Eof,
    /// The tunnel was torn down from outside this pump.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pumped {
    pub end: PumpEnd,
    pub bytes: u64,
    pub chunks: u64,
}

impl Pumped {
    fn new() -> Self {
        Self {
            end: PumpEnd::Eof,
            bytes: 0,
            chunks: 0,
        }
    }

    fn finish(mut self, end: PumpEnd) -> Self {
        self.end = end;
        self
    }
}

/// Forward every data message from the front stream to the back sink.
///
/// Text and binary payloads are written verbatim, one sink item per message,
/// including empty ones. Control frames are left to the WebSocket layer.
pub async fn front_to_back<S, W>(
    mut front: S,
    mut back: W,
    cancel: CancellationToken,
) -> Result<Pumped, RelayError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
    W: Sink<Bytes, Error = std::io::Error> + Unpin,
{
    let mut pumped = Pumped::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(pumped.finish(PumpEnd::Cancelled)),
            next = front.next() => next,
        };

        let payload = match next {
            Some(Ok(Message::Text(text))) => Bytes::from(text.into_bytes()),
            Some(Ok(Message::Binary(data))) => Bytes::from(data),
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
            Some(Ok(Message::Close(frame))) => {
                trace!(?frame, "Front stream sent close");
                break;
            }
            Some(Err(e)) => return Err(RelayError::Front(e)),
            None => break,
        };

        let len = payload.len() as u64;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(pumped.finish(PumpEnd::Cancelled)),
            sent = back.send(payload) => sent?,
        }
        pumped.bytes += len;
        pumped.chunks += 1;
        trace!(bytes = len, "front -> back");
    }

    // Propagate the end of stream to the destination as a FIN.
    if let Err(e) = back.close().await {
        debug!("Failed to shut down back stream: {}", e);
    }
    Ok(pumped.finish(PumpEnd::Eof))
}

/// Forward every chunk read from the back stream as one binary message.
pub async fn back_to_front<R, Si>(
    mut back: R,
    front: &mut Si,
    cancel: CancellationToken,
) -> Result<Pumped, RelayError>
where
    R: AsyncRead + Unpin,
    Si: Sink<Message, Error = WsError> + Unpin,
{
    let mut pumped = Pumped::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(pumped.finish(PumpEnd::Cancelled)),
            read = back.read(&mut buf) => read?,
        };
        if n == 0 {
            return Ok(pumped.finish(PumpEnd::Eof));
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(pumped.finish(PumpEnd::Cancelled)),
            sent = front.send(Message::Binary(buf[..n].to_vec())) => sent?,
        }
        pumped.bytes += n as u64;
        pumped.chunks += 1;
        trace!(bytes = n, "back -> front");
    }
}
