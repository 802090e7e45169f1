use async_trait::async_trait;
use derivative::Derivative;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};

use crate::error::{ConnectionErrorKind, Error};

/// A single message on a duplex, message-framed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// Write half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), Error>;
    async fn close(&mut self) -> Result<(), Error>;
}

/// Read half of a connection. `None` means the peer is gone.
#[async_trait]
pub trait FrameStream: Send {
    async fn recv(&mut self) -> Option<Result<Frame, Error>>;
}

/// An already upgraded duplex connection, split in halves so reads and writes run on separate tasks.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Transport {
    #[derivative(Debug = "ignore")]
    pub sink: Box<dyn FrameSink>,
    #[derivative(Debug = "ignore")]
    pub stream: Box<dyn FrameStream>,
}

impl Transport {
    pub fn new(sink: Box<dyn FrameSink>, stream: Box<dyn FrameStream>) -> Self {
        Self { sink, stream }
    }
}

struct ChannelSink {
    sender: Option<mpsc::Sender<Frame>>,
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send(&mut self, frame: Frame) -> Result<(), Error> {
        let Some(sender) = self.sender.as_ref() else {
            return Err(Error::new_connection(
                "transport is closed".to_owned(),
                ConnectionErrorKind::Closed,
            ));
        };
        sender.send(frame).await.map_err(|_| {
            Error::new_connection(
                "peer has gone away".to_owned(),
                ConnectionErrorKind::WriteFailed,
            )
        })
    }

    async fn close(&mut self) -> Result<(), Error> {
        self.sender.take();
        Ok(())
    }
}

struct ChannelStream {
    receiver: mpsc::Receiver<Frame>,
}

#[async_trait]
impl FrameStream for ChannelStream {
    async fn recv(&mut self) -> Option<Result<Frame, Error>> {
        self.receiver.recv().await.map(Ok)
    }
}

/// Two connected in-process transports. Whatever one side sends, the other receives.
pub fn memory_pair(capacity: usize) -> (Transport, Transport) {
    let (left_sender, left_receiver) = mpsc::channel(capacity);
    let (right_sender, right_receiver) = mpsc::channel(capacity);
    let left = Transport::new(
        Box::new(ChannelSink {
            sender: Some(left_sender),
        }),
        Box::new(ChannelStream {
            receiver: right_receiver,
        }),
    );
    let right = Transport::new(
        Box::new(ChannelSink {
            sender: Some(right_sender),
        }),
        Box::new(ChannelStream {
            receiver: left_receiver,
        }),
    );
    (left, right)
}

struct WebSocketSink<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S> FrameSink for WebSocketSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, frame: Frame) -> Result<(), Error> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data),
            Frame::Ping(data) => Message::Ping(data),
            Frame::Pong(data) => Message::Pong(data),
            Frame::Close => Message::Close(None),
        };
        self.sink.send(message).await.map_err(|err| {
            Error::new_connection(err.to_string(), ConnectionErrorKind::WriteFailed)
        })
    }

    async fn close(&mut self) -> Result<(), Error> {
        self.sink.close().await.map_err(|err| {
            Error::new_connection(err.to_string(), ConnectionErrorKind::WriteFailed)
        })
    }
}

struct WebSocketFrames<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> FrameStream for WebSocketFrames<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> Option<Result<Frame, Error>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(err) => {
                    return Some(Err(Error::new_connection(
                        err.to_string(),
                        ConnectionErrorKind::ReadFailed,
                    )))
                }
            };
            let frame = match message {
                Message::Text(text) => Frame::Text(text),
                Message::Binary(data) => Frame::Binary(data),
                Message::Ping(data) => Frame::Ping(data),
                Message::Pong(data) => Frame::Pong(data),
                Message::Close(_) => Frame::Close,
                // Raw frames never surface while reading.
                Message::Frame(_) => continue,
            };
            return Some(Ok(frame));
        }
    }
}

/// Adapts an upgraded WebSocket into a [`Transport`].
pub fn websocket<S>(socket: WebSocketStream<S>) -> Transport
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = socket.split();
    Transport::new(
        Box::new(WebSocketSink { sink }),
        Box::new(WebSocketFrames { stream }),
    )
}
