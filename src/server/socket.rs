//! Presents axum's upgraded [`WebSocket`] as a tungstenite message stream, so
//! the server and the client feed the same tunnel pumps.

use std::pin::Pin;
use std::task::{Context, Poll};

use axum::extract::ws::{self, WebSocket};
use futures_util::{Sink, Stream};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

pub struct UpgradedSocket(WebSocket);

impl UpgradedSocket {
    pub fn new(socket: WebSocket) -> Self {
        Self(socket)
    }
}

impl Stream for UpgradedSocket {
    type Item = Result<Message, WsError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.0)
            .poll_next(cx)
            .map(|next| next.map(|msg| msg.map(from_socket).map_err(socket_error)))
    }
}

impl Sink<Message> for UpgradedSocket {
    type Error = WsError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.0).poll_ready(cx).map_err(socket_error)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
        match into_socket(item) {
            Some(msg) => Pin::new(&mut self.0).start_send(msg).map_err(socket_error),
            None => Ok(()),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.0).poll_flush(cx).map_err(socket_error)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.0).poll_close(cx).map_err(socket_error)
    }
}

fn from_socket(msg: ws::Message) -> Message {
    match msg {
        ws::Message::Text(text) => Message::Text(text),
        ws::Message::Binary(data) => Message::Binary(data),
        ws::Message::Ping(data) => Message::Ping(data),
        ws::Message::Pong(data) => Message::Pong(data),
        ws::Message::Close(frame) => Message::Close(frame.map(|f| CloseFrame {
            code: CloseCode::from(f.code),
            reason: f.reason,
        })),
    }
}

/// Raw frames have no counterpart on the upgraded socket and are dropped.
fn into_socket(msg: Message) -> Option<ws::Message> {
    let msg = match msg {
        Message::Text(text) => ws::Message::Text(text),
        Message::Binary(data) => ws::Message::Binary(data),
        Message::Ping(data) => ws::Message::Ping(data),
        Message::Pong(data) => ws::Message::Pong(data),
        Message::Close(frame) => ws::Message::Close(frame.map(|f| ws::CloseFrame {
            code: f.code.into(),
            reason: f.reason,
        })),
        Message::Frame(_) => return None,
    };
    Some(msg)
}

/// Recover the tungstenite error axum wrapped, so disconnects stay recognisable.
fn socket_error(e: axum::Error) -> WsError {
    match e.into_inner().downcast::<WsError>() {
        Ok(e) => *e,
        Err(other) => WsError::Io(std::io::Error::other(other)),
    }
}
