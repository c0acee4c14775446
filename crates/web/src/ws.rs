//! WebSocket adapter for the console tunnel

use crate::tunnel::{ConsoleTunnel, Frame, TunnelStats};
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tracing::info;

fn from_message(message: Message) -> Frame {
    match message {
        Message::Binary(data) => Frame::Binary(Bytes::from(data)),
        Message::Text(text) => Frame::Text(text),
        Message::Ping(data) => Frame::Ping(Bytes::from(data)),
        Message::Pong(data) => Frame::Pong(Bytes::from(data)),
        Message::Close(_) => Frame::Close,
    }
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Binary(data) => Message::Binary(data.to_vec()),
        Frame::Text(text) => Message::Text(text),
        Frame::Ping(data) => Message::Ping(data.to_vec()),
        Frame::Pong(data) => Message::Pong(data.to_vec()),
        Frame::Close => Message::Close(None),
    }
}

/// Split a WebSocket into frame halves
pub fn frames(
    socket: WebSocket,
) -> (
    impl Sink<Frame, Error = axum::Error> + Send + Unpin,
    impl Stream<Item = Result<Frame, axum::Error>> + Send + Unpin,
) {
    let (sink, stream) = socket.split();
    let sink = sink.with(|frame: Frame| future::ready(Ok::<_, axum::Error>(to_message(frame))));
    let stream = stream.map(|message| message.map(from_message));
    (sink, stream)
}

/// Serve an upgraded browser socket against an already dialled console
pub async fn serve_console(socket: WebSocket, console: TcpStream, machine: &str) -> anyhow::Result<TunnelStats> {
    info!("Console session opened for {}", machine);
    let (sink, stream) = frames(socket);
    let stats = ConsoleTunnel::bridge(console, stream, sink).await?;
    info!("Console session closed for {}", machine);
    Ok(stats)
}
