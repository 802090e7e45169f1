use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use derivative::Derivative;
use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        mpsc, Mutex,
    },
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{RoomConfig, SlowConsumerPolicy},
    error::{ConnectionErrorKind, Error},
    message::{Envelope, Role},
    transport::{Frame, FrameSink, FrameStream, Transport},
};

/// Upper bound on delivering the close frame to a peer.
pub const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

/// One role-tagged duplex connection, adapted into an outbound and an inbound queue.
///
/// The outbound queue is drained by a writer task and the inbound queue is filled by the reader
/// loop running inside [`ClientConnection::start`], so a slow reader never blocks a broadcaster.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct ClientConnection {
    pub id: String,
    role: Role,
    #[derivative(Debug = "ignore")]
    sink: Mutex<Box<dyn FrameSink>>,
    #[derivative(Debug = "ignore")]
    stream: Mutex<Option<Box<dyn FrameStream>>>,
    outbound_sender: broadcast::Sender<Envelope>,
    outbound_receiver: Mutex<Option<broadcast::Receiver<Envelope>>>,
    outbound_capacity: usize,
    inbound_sender: mpsc::Sender<Envelope>,
    inbound_receiver: Mutex<mpsc::Receiver<Envelope>>,
    slow_consumer_policy: SlowConsumerPolicy,
    ping_interval: Duration,
    disconnect_threshold: Duration,
    write_timeout: Duration,
    alive: AtomicBool,
    closing: AtomicBool,
    created: Instant,
    /// Milliseconds since `created` when traffic was last observed.
    last_active_ms: AtomicU64,
    closed: CancellationToken,
}

impl ClientConnection {
    pub fn new(id: String, role: Role, transport: Transport, config: &RoomConfig) -> Arc<Self> {
        let outbound_capacity = config.outbound_queue_size.max(1);
        let (outbound_sender, outbound_receiver) = broadcast::channel(outbound_capacity);
        let (inbound_sender, inbound_receiver) = mpsc::channel(config.inbound_queue_size.max(1));

        tracing::debug!("ClientConnection {} role={} is created", id, role);

        Arc::new(Self {
            id,
            role,
            sink: Mutex::new(transport.sink),
            stream: Mutex::new(Some(transport.stream)),
            outbound_sender,
            outbound_receiver: Mutex::new(Some(outbound_receiver)),
            outbound_capacity,
            inbound_sender,
            inbound_receiver: Mutex::new(inbound_receiver),
            slow_consumer_policy: config.slow_consumer_policy,
            ping_interval: config.ping_interval,
            disconnect_threshold: config.disconnect_threshold,
            write_timeout: config.write_timeout,
            alive: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            created: Instant::now(),
            last_active_ms: AtomicU64::new(0),
            closed: CancellationToken::new(),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Time since traffic was last observed on this connection.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_active_ms.load(Ordering::SeqCst));
        self.created.elapsed().saturating_sub(last)
    }

    fn touch(&self) {
        let now = self.created.elapsed().as_millis() as u64;
        self.last_active_ms.store(now, Ordering::SeqCst);
    }

    /// Runs the connection: spawns the writer and ping tasks, then blocks on the reader loop.
    /// Returning means the connection is done.
    pub async fn start(self: &Arc<Self>) {
        let Some(stream) = self.stream.lock().await.take() else {
            tracing::warn!("ClientConnection {} is already started", self.id);
            return;
        };

        let writer = Arc::clone(self);
        tokio::spawn(async move {
            writer.writer_loop().await;
        });
        let pinger = Arc::clone(self);
        tokio::spawn(async move {
            pinger.ping_loop().await;
        });

        self.read_loop(stream).await;
        self.close().await;
    }

    async fn read_loop(&self, mut stream: Box<dyn FrameStream>) {
        tracing::debug!("ClientConnection {} read loop started", self.id);
        loop {
            let frame = tokio::select! {
                _ = self.closed.cancelled() => break,
                frame = stream.recv() => frame,
            };
            let frame = match frame {
                None => break,
                Some(Err(err)) => {
                    tracing::error!("ClientConnection {} failed to read: {}", self.id, err);
                    break;
                }
                Some(Ok(frame)) => frame,
            };
            self.touch();
            let envelope = match frame {
                Frame::Text(text) => Envelope::decode(text.as_bytes()),
                Frame::Binary(data) => Envelope::decode(&data),
                Frame::Ping(data) => {
                    if let Err(err) = self.write_frame(Frame::Pong(data)).await {
                        tracing::error!("ClientConnection {} failed to pong: {}", self.id, err);
                        break;
                    }
                    continue;
                }
                Frame::Pong(_) => continue,
                Frame::Close => break,
            };
            match envelope {
                Ok(envelope) => {
                    tokio::select! {
                        _ = self.closed.cancelled() => break,
                        res = self.inbound_sender.send(envelope) => {
                            if res.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!("ClientConnection {} ignored a message: {}", self.id, err);
                }
            }
        }
        tracing::debug!("ClientConnection {} read loop finished", self.id);
    }

    async fn writer_loop(&self) {
        let Some(mut receiver) = self.outbound_receiver.lock().await.take() else {
            return;
        };
        loop {
            let envelope = tokio::select! {
                biased;
                _ = self.closed.cancelled() => break,
                envelope = receiver.recv() => envelope,
            };
            match envelope {
                Ok(envelope) => {
                    let text = match envelope.encode() {
                        Ok(text) => text,
                        Err(err) => {
                            tracing::error!("ClientConnection {} failed to encode {}: {}", self.id, envelope.kind, err);
                            continue;
                        }
                    };
                    tracing::trace!("ClientConnection {} writes {}", self.id, envelope.kind);
                    if let Err(err) = self.write_frame(Frame::Text(text)).await {
                        tracing::error!("ClientConnection {} failed to write: {}", self.id, err);
                        break;
                    }
                    self.touch();
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        "ClientConnection {} is too slow, {} oldest messages are dropped",
                        self.id,
                        skipped
                    );
                }
                Err(RecvError::Closed) => break,
            }
        }
        self.close().await;
    }

    async fn ping_loop(&self) {
        let mut interval = tokio::time::interval(self.ping_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = self.closed.cancelled() => break,
                _ = interval.tick() => {}
            }
            let idle = self.idle_for();
            if idle > self.disconnect_threshold {
                tracing::warn!(
                    "ClientConnection {} has been silent for {:?}, closing",
                    self.id,
                    idle
                );
                self.close().await;
                break;
            }
            if let Err(err) = self.write_frame(Frame::Ping(vec![])).await {
                tracing::error!("ClientConnection {} failed to ping: {}", self.id, err);
                self.close().await;
                break;
            }
        }
    }

    /// Writes one frame. Gives up when the connection closes or the write outlasts the write
    /// timeout, so a peer that stopped reading never holds the sink for good.
    async fn write_frame(&self, frame: Frame) -> Result<(), Error> {
        let write = async {
            let mut sink = self.sink.lock().await;
            sink.send(frame).await
        };
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(Error::new_connection(
                format!("client {} is closed", self.id),
                ConnectionErrorKind::Closed,
            )),
            written = tokio::time::timeout(self.write_timeout, write) => match written {
                Ok(result) => result,
                Err(_) => Err(Error::new_connection(
                    format!("write to client {} timed out after {:?}", self.id, self.write_timeout),
                    ConnectionErrorKind::WriteFailed,
                )),
            },
        }
    }

    /// Enqueues an envelope for the writer task. Never blocks.
    ///
    /// When the queue is full, the configured [`SlowConsumerPolicy`] either evicts the oldest
    /// queued envelope or closes this connection.
    pub fn send(&self, envelope: Envelope) -> Result<(), Error> {
        if !self.is_alive() {
            return Err(Error::new_connection(
                format!("client {} is closed", self.id),
                ConnectionErrorKind::Closed,
            ));
        }
        if self.slow_consumer_policy == SlowConsumerPolicy::Disconnect
            && self.outbound_sender.len() >= self.outbound_capacity
        {
            tracing::warn!("ClientConnection {} outbound queue is full, disconnecting", self.id);
            self.alive.store(false, Ordering::SeqCst);
            self.closed.cancel();
            return Err(Error::new_connection(
                format!("outbound queue of client {} is full", self.id),
                ConnectionErrorKind::QueueFull,
            ));
        }
        self.outbound_sender.send(envelope).map(|_| ()).map_err(|_| {
            Error::new_connection(
                format!("client {} writer has stopped", self.id),
                ConnectionErrorKind::Closed,
            )
        })
    }

    /// Next inbound envelope. `None` once the connection is closed and the queue is drained.
    pub async fn recv(&self) -> Option<Envelope> {
        let mut receiver = self.inbound_receiver.lock().await;
        tokio::select! {
            biased;
            envelope = receiver.recv() => envelope,
            _ = self.closed.cancelled() => None,
        }
    }

    /// Sends a close frame, marks the client not alive and closes the transport. Idempotent.
    ///
    /// Every loop is woken first. The close frame is best effort and bounded by
    /// [`CLOSE_FRAME_TIMEOUT`].
    pub async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closed.cancel();
        let goodbye = async {
            let mut sink = self.sink.lock().await;
            if let Err(err) = sink.send(Frame::Close).await {
                tracing::debug!("ClientConnection {} failed to send close frame: {}", self.id, err);
            }
            if let Err(err) = sink.close().await {
                tracing::debug!("ClientConnection {} failed to close transport: {}", self.id, err);
            }
        };
        if tokio::time::timeout(CLOSE_FRAME_TIMEOUT, goodbye).await.is_err() {
            tracing::debug!("ClientConnection {} peer is not reading, dropping the close frame", self.id);
        }
        tracing::info!("ClientConnection {} is closed", self.id);
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    #[cfg(test)]
    pub(crate) fn pending_outbound(&self) -> usize {
        self.outbound_sender.len()
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        tracing::debug!("ClientConnection {} is dropped", self.id);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::time::Duration;

    use crate::{
        message::Envelope,
        transport::{Frame, Transport},
    };

    /// Reads the next envelope the server side wrote, answering pings on the way.
    /// `None` when the server closed the connection.
    pub(crate) async fn next_envelope(remote: &mut Transport) -> Option<Envelope> {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), remote.stream.recv())
                .await
                .ok()??
                .ok()?;
            match frame {
                Frame::Text(text) => return Envelope::decode(text.as_bytes()).ok(),
                Frame::Ping(data) => {
                    let _ = remote.sink.send(Frame::Pong(data)).await;
                }
                Frame::Close => return None,
                _ => {}
            }
        }
    }

    /// Polls `check` until it holds. Panics after five seconds.
    pub(crate) async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let polled = tokio::time::timeout(Duration::from_secs(5), async {
            while !check().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(polled.is_ok(), "condition was not met in time");
    }

    pub(crate) async fn send_envelope(remote: &mut Transport, envelope: &Envelope) {
        remote
            .sink
            .send(Frame::Text(envelope.encode().unwrap()))
            .await
            .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::{testing::*, *};
    use crate::{
        message::{MessageType, Winsize},
        transport::memory_pair,
    };

    fn connection(role: Role, config: &RoomConfig) -> (Arc<ClientConnection>, Transport) {
        let (local, remote) = memory_pair(64);
        (
            ClientConnection::new("c1".to_owned(), role, local, config),
            remote,
        )
    }

    fn write(n: u16) -> Envelope {
        Envelope::new(MessageType::Winsize, &Winsize { rows: n, cols: n }).unwrap()
    }

    #[tokio::test]
    async fn malformed_frames_are_ignored() {
        let (client, mut remote) = connection(Role::Viewer, &RoomConfig::default());
        tokio::spawn({
            let client = client.clone();
            async move { client.start().await }
        });

        remote.sink.send(Frame::Text("not json".to_owned())).await.unwrap();
        send_envelope(&mut remote, &Envelope::empty(MessageType::RequestWinsize)).await;

        let received = client.recv().await.unwrap();
        assert_eq!(received.kind, MessageType::RequestWinsize);
        assert!(client.is_alive());
    }

    #[tokio::test]
    async fn outbound_is_delivered_in_order() {
        let (client, mut remote) = connection(Role::Viewer, &RoomConfig::default());
        tokio::spawn({
            let client = client.clone();
            async move { client.start().await }
        });

        for i in 0..3 {
            client.send(write(i)).unwrap();
        }
        for i in 0..3 {
            assert_eq!(next_envelope(&mut remote).await.unwrap(), write(i));
        }
    }

    #[tokio::test]
    async fn close_sends_close_frame_and_ends_recv() {
        let (client, mut remote) = connection(Role::Viewer, &RoomConfig::default());
        let handle = tokio::spawn({
            let client = client.clone();
            async move { client.start().await }
        });

        client.close().await;
        client.close().await;
        assert!(!client.is_alive());
        assert!(client.recv().await.is_none());
        assert_eq!(remote.stream.recv().await.unwrap().unwrap(), Frame::Close);
        assert!(remote.stream.recv().await.is_none());
        handle.await.unwrap();

        let err = client.send(write(1)).unwrap_err();
        assert_eq!(err.connection_kind(), Some(ConnectionErrorKind::Closed));
    }

    #[tokio::test]
    async fn peer_hang_up_closes_client() {
        let (client, remote) = connection(Role::Viewer, &RoomConfig::default());
        drop(remote);
        client.start().await;
        assert!(!client.is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_is_disconnected() {
        let config = RoomConfig::default();
        let (client, _remote) = connection(Role::Streamer, &config);
        tokio::spawn({
            let client = client.clone();
            async move { client.start().await }
        });

        tokio::time::sleep(config.disconnect_threshold + config.ping_interval * 2).await;
        assert!(!client.is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn answering_pings_keeps_peer_alive() {
        let config = RoomConfig::default();
        let (client, mut remote) = connection(Role::Streamer, &config);
        tokio::spawn({
            let client = client.clone();
            async move { client.start().await }
        });

        let deadline = Instant::now() + config.disconnect_threshold * 3;
        while Instant::now() < deadline {
            match remote.stream.recv().await {
                Some(Ok(Frame::Ping(data))) => remote.sink.send(Frame::Pong(data)).await.unwrap(),
                other => panic!("unexpected frame {:?}", other.map(|f| f.is_ok())),
            }
        }
        assert!(client.is_alive());
        assert!(client.idle_for() < config.disconnect_threshold);
    }

    #[tokio::test]
    async fn drop_oldest_keeps_newest_messages() {
        let config = RoomConfig {
            outbound_queue_size: 2,
            ..Default::default()
        };
        let (client, mut remote) = connection(Role::Viewer, &config);
        for i in 0..4 {
            client.send(write(i)).unwrap();
        }
        assert_eq!(client.pending_outbound(), 2);

        tokio::spawn({
            let client = client.clone();
            async move { client.start().await }
        });
        assert_eq!(next_envelope(&mut remote).await.unwrap(), write(2));
        assert_eq!(next_envelope(&mut remote).await.unwrap(), write(3));
        assert!(client.is_alive());
    }

    #[tokio::test]
    async fn disconnect_policy_closes_slow_consumer() {
        let config = RoomConfig {
            outbound_queue_size: 2,
            slow_consumer_policy: SlowConsumerPolicy::Disconnect,
            ..Default::default()
        };
        let (client, _remote) = connection(Role::Viewer, &config);
        client.send(write(0)).unwrap();
        client.send(write(1)).unwrap();

        let err = client.send(write(2)).unwrap_err();
        assert_eq!(err.connection_kind(), Some(ConnectionErrorKind::QueueFull));
        assert!(!client.is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_peer_is_closed_after_write_timeout() {
        let config = RoomConfig {
            write_timeout: Duration::from_secs(2),
            ping_interval: Duration::from_secs(3600),
            disconnect_threshold: Duration::from_secs(7200),
            ..Default::default()
        };
        let (local, _remote) = memory_pair(1);
        let client = ClientConnection::new("c1".to_owned(), Role::Viewer, local, &config);
        for i in 0..3 {
            client.send(write(i)).unwrap();
        }
        tokio::spawn({
            let client = client.clone();
            async move { client.start().await }
        });

        tokio::time::sleep(config.write_timeout / 2).await;
        assert!(client.is_alive());
        tokio::time::sleep(config.write_timeout).await;
        assert!(!client.is_alive());
    }

    #[tokio::test]
    async fn close_returns_while_peer_is_not_reading() {
        let (local, _remote) = memory_pair(1);
        let client = ClientConnection::new("c1".to_owned(), Role::Viewer, local, &RoomConfig::default());
        for i in 0..3 {
            client.send(write(i)).unwrap();
        }
        tokio::spawn({
            let client = client.clone();
            async move { client.start().await }
        });
        let waiting = client.as_ref();
        wait_until(|| async move { waiting.pending_outbound() <= 1 }).await;

        let closed = tokio::time::timeout(CLOSE_FRAME_TIMEOUT * 3, client.close()).await;
        assert!(closed.is_ok());
        assert!(!client.is_alive());
    }
}
