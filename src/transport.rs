//! Transport-neutral duplex framing.
//!
//! Every accepted socket is reduced to a boxed sink of [`Frame`]s and a boxed
//! stream of [`Frame`]s so the supervisor never cares whether it is talking
//! WebSocket, raw TCP lines, or an in-memory test peer.

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures::channel::mpsc;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::pin::Pin;
use tokio::net::TcpStream;
use tokio_util::codec::{AnyDelimiterCodec, Framed};

use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close,
}

impl From<Message> for Frame {
    fn from(msg: Message) -> Self {
        match msg {
            Message::Text(text) => Frame::Text(text.as_str().to_owned()),
            Message::Binary(data) => Frame::Binary(data),
            Message::Ping(data) => Frame::Ping(data),
            Message::Pong(data) => Frame::Pong(data),
            Message::Close(_) => Frame::Close,
        }
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(data) => Message::Binary(data),
            Frame::Ping(data) => Message::Ping(data),
            Frame::Pong(data) => Message::Pong(data),
            Frame::Close => Message::Close(None),
        }
    }
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

pub struct Transport {
    pub sink: FrameSink,
    pub stream: FrameStream,
    pub peer: Option<SocketAddr>,
    /// Short label for logs and metrics
    pub kind: &'static str,
    /// Whether the peer answers pings. Silent peers are only timed out when true.
    pub heartbeat: bool,
}

impl Transport {
    /// Wrap any sink/stream pair
    pub fn new<Si, St>(sink: Si, stream: St, peer: Option<SocketAddr>, kind: &'static str) -> Self
    where
        Si: Sink<Frame, Error = TransportError> + Send + 'static,
        St: Stream<Item = Result<Frame, TransportError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
            peer,
            kind,
            heartbeat: true,
        }
    }

    pub fn from_websocket(socket: WebSocket, peer: Option<SocketAddr>) -> Self {
        let (sink, stream) = socket.split();
        let sink = sink
            .sink_map_err(TransportError::from)
            .with(|frame: Frame| future::ready(Ok::<_, TransportError>(Message::from(frame))));
        let stream = stream.map(|msg| msg.map(Frame::from).map_err(TransportError::from));
        Self::new(sink, stream, peer, "websocket")
    }

    /// Newline-delimited JSON over a raw socket.
    ///
    /// Lines are read as raw bytes and surface as [`Frame::Binary`], so a line
    /// that is not UTF-8 reaches the dispatcher instead of killing the stream.
    /// Control frames have no line representation and are dropped on write.
    /// Lines longer than `max_line` end the stream with a codec error.
    pub fn from_tcp(socket: TcpStream, peer: Option<SocketAddr>, max_line: usize) -> Self {
        let codec = AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), b"\n".to_vec(), max_line);
        let (sink, stream) = Framed::new(socket, codec).split::<String>();
        let sink = sink
            .sink_map_err(TransportError::from)
            .with_flat_map(|frame: Frame| {
                let line = match frame {
                    Frame::Text(text) => Some(text),
                    Frame::Binary(data) => String::from_utf8(data.to_vec()).ok(),
                    Frame::Ping(_) | Frame::Pong(_) | Frame::Close => None,
                };
                futures::stream::iter(line.map(Ok::<_, TransportError>))
            });
        let stream = stream.map(|line| {
            line.map(|bytes| Frame::Binary(bytes))
                .map_err(TransportError::from)
        });

        let mut transport = Self::new(sink, stream, peer, "tcp");
        transport.heartbeat = false;
        transport
    }

    /// In-process transport for tests and embedding
    pub fn memory(capacity: usize) -> (Self, MemoryPeer) {
        let (out_tx, out_rx) = mpsc::channel::<Frame>(capacity);
        let (in_tx, in_rx) = mpsc::channel::<Result<Frame, TransportError>>(capacity);
        let sink = out_tx.sink_map_err(|_| TransportError::Closed);
        let transport = Self::new(sink, in_rx, None, "memory");
        let peer = MemoryPeer {
            tx: in_tx,
            rx: out_rx,
        };
        (transport, peer)
    }
}

/// Client side of [`Transport::memory`]
pub struct MemoryPeer {
    tx: mpsc::Sender<Result<Frame, TransportError>>,
    rx: mpsc::Receiver<Frame>,
}

impl MemoryPeer {
    pub async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.tx
            .send(Ok(frame))
            .await
            .map_err(|_| TransportError::Closed)
    }

    pub async fn send_text(&mut self, text: impl Into<String>) -> Result<(), TransportError> {
        self.send(Frame::Text(text.into())).await
    }

    pub async fn send_json(&mut self, value: &Value) -> Result<(), TransportError> {
        self.send_text(value.to_string()).await
    }

    /// Make the server's next read fail
    pub async fn inject_error(&mut self, err: TransportError) -> Result<(), TransportError> {
        self.tx.send(Err(err)).await.map_err(|_| TransportError::Closed)
    }

    /// End the inbound stream without a close frame
    pub fn hang_up(&mut self) {
        self.tx.close_channel();
    }

    /// Next frame written by the server; None once the server side is gone
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.next().await
    }

    /// Next text frame parsed as JSON, skipping control frames
    pub async fn recv_json(&mut self) -> Option<Value> {
        loop {
            match self.recv().await? {
                Frame::Text(text) => return serde_json::from_str(&text).ok(),
                Frame::Close => return None,
                Frame::Binary(_) | Frame::Ping(_) | Frame::Pong(_) => continue,
            }
        }
    }
}
