use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use derivative::Derivative;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    client::{ClientConnection, CLOSE_FRAME_TIMEOUT},
    config::Config,
    error::{AuthorizationErrorKind, ConnectionErrorKind, Error, ProtocolErrorKind, RoomErrorKind},
    message::{ClientInfo, Envelope, MessageType, Role, RoomInfo, RoomStatus},
    recorder::Recorder,
    room::{Room, RoomParams},
    store::RoomInfoStore,
    transport::{Frame, Transport},
};

/// Hub owns every room of the server and admits incoming connections into them.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Hub {
    config: Config,
    rooms: Mutex<HashMap<String, Arc<Room>>>,
    #[derivative(Debug = "ignore")]
    store: Option<Arc<dyn RoomInfoStore>>,
    #[derivative(Debug = "ignore")]
    recorder: Option<Arc<dyn Recorder>>,
}

impl Hub {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            rooms: Mutex::new(HashMap::new()),
            store: None,
            recorder: None,
        }
    }

    /// Room snapshots are saved to `store` by [`Hub::sync_store`].
    pub fn with_store(mut self, store: Arc<dyn RoomInfoStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Every room created afterwards records its traffic to `recorder`.
    pub fn with_recorder(mut self, recorder: Arc<dyn Recorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Creates a new room. A live room with the same name is an error, a stopped one is replaced.
    pub async fn create_room(
        &self,
        name: String,
        title: String,
        secret: String,
        key: Option<String>,
    ) -> Result<Arc<Room>, Error> {
        let mut rooms = self.rooms.lock().await;
        if let Some(room) = rooms.get(&name) {
            if room.status().await == RoomStatus::Streaming {
                room.verify_secret(Some(&secret))?;
                return Err(Error::new_room(
                    format!("room {} already exists", name),
                    RoomErrorKind::RoomExists,
                ));
            }
        }
        Ok(self.insert_room(&mut rooms, name, title, secret, key))
    }

    fn insert_room(
        &self,
        rooms: &mut HashMap<String, Arc<Room>>,
        name: String,
        title: String,
        secret: String,
        key: Option<String>,
    ) -> Arc<Room> {
        let room = Room::new(
            RoomParams {
                name: name.clone(),
                title,
                secret,
                key,
                recorder: self.recorder.clone(),
            },
            &self.config,
        );
        if rooms.insert(name.clone(), room.clone()).is_some() {
            tracing::info!("Room {} replaces a stopped room", name);
        }
        room
    }

    pub async fn find(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.lock().await.get(name).cloned()
    }

    /// Removes the room from the hub and stops it.
    pub async fn remove(&self, name: &str) -> Result<Arc<Room>, Error> {
        let room = self.rooms.lock().await.remove(name).ok_or_else(|| {
            Error::new_room(format!("room {} not found", name), RoomErrorKind::RoomNotFound)
        })?;
        room.stop(RoomStatus::Stopped).await;
        Ok(room)
    }

    pub async fn room_infos(&self) -> Vec<RoomInfo> {
        let rooms: Vec<Arc<Room>> = self.rooms.lock().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(rooms.len());
        for room in rooms {
            infos.push(room.prepare_room_info().await);
        }
        infos
    }

    /// Stops every streaming room whose last activity is at least `threshold` old. Returns the
    /// names of the rooms it stopped. Stopped rooms stay in the hub so their info remains visible.
    pub async fn scan_idle(&self, threshold: Duration) -> Vec<String> {
        let Ok(threshold) = chrono::Duration::from_std(threshold) else {
            return vec![];
        };
        let rooms: Vec<Arc<Room>> = self.rooms.lock().await.values().cloned().collect();
        let now = Utc::now();
        let mut stopped = vec![];
        for room in rooms {
            if room.status().await != RoomStatus::Streaming {
                continue;
            }
            if now - room.last_active_time().await >= threshold {
                tracing::info!("Room {} is idle, stopping", room.name);
                room.stop(RoomStatus::Stopped).await;
                stopped.push(room.name.clone());
            }
        }
        stopped
    }

    /// Pushes the current room snapshots to the store, if any.
    pub async fn sync_store(&self) -> Result<(), Error> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        store.save(self.room_infos().await).await
    }

    /// Runs [`Hub::scan_idle`] and [`Hub::sync_store`] every scan interval until `closed` is
    /// cancelled.
    pub async fn idle_scan_loop(&self, closed: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.room.idle_scan_interval);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = closed.cancelled() => break,
                _ = interval.tick() => {
                    let stopped = self.scan_idle(self.config.room.idle_threshold).await;
                    if !stopped.is_empty() {
                        tracing::debug!("Idle scan stopped rooms: {:?}", stopped);
                    }
                    if let Err(err) = self.sync_store().await {
                        tracing::error!("Failed to save room infos: {}", err);
                    }
                }
            }
        }
        tracing::debug!("Hub idle scan loop finished");
    }

    /// Stops and forgets every room.
    pub async fn close(&self) {
        let rooms: Vec<Arc<Room>> = {
            let mut rooms = self.rooms.lock().await;
            rooms.drain().map(|(_, room)| room).collect()
        };
        for room in rooms {
            room.stop(RoomStatus::Stopped).await;
        }
    }

    /// Serves one connection from handshake to disconnect.
    ///
    /// The first envelope must be a ClientInfo. A streamer naming an unknown room creates it.
    /// Rejected connections get an Unauthorized or Error envelope and are closed.
    pub async fn accept(&self, mut transport: Transport) -> Result<(), Error> {
        let admitted = match self.read_handshake(&mut transport).await {
            Ok(info) => self.admit(&info).await.map(|room| (info, room)),
            Err(err) => Err(err),
        };
        let (info, room) = match admitted {
            Ok(admitted) => admitted,
            Err(err) => {
                tracing::warn!("Connection rejected: {}", err);
                reject(&mut transport, &err).await;
                return Err(err);
            }
        };

        let id = Uuid::new_v4().to_string();
        let client = ClientConnection::new(id.clone(), info.role, transport, &self.config.room);
        client.send(Envelope::empty(MessageType::Authorized))?;
        tracing::info!(
            "Client {} role={} authorized for room {}",
            id,
            info.role,
            room.name
        );

        let served = match info.role {
            Role::Streamer => match room.add_streamer(client.clone()).await {
                Ok(()) => room.start().await,
                Err(err) => Err(err),
            },
            _ => room.add_client(id, client.clone()).await,
        };
        client.close().await;
        served
    }

    async fn read_handshake(&self, transport: &mut Transport) -> Result<ClientInfo, Error> {
        let timeout = self.config.room.handshake_timeout;
        match tokio::time::timeout(timeout, next_client_info(transport)).await {
            Ok(info) => info,
            Err(_) => Err(Error::new_protocol(
                format!("no ClientInfo within {:?}", timeout),
                ProtocolErrorKind::MissingHandshake,
            )),
        }
    }

    /// Resolves the room a handshake is for, creating it for a streamer when needed.
    async fn admit(&self, info: &ClientInfo) -> Result<Arc<Room>, Error> {
        let mut rooms = self.rooms.lock().await;
        let existing = rooms.get(&info.name).cloned();
        let live = match existing {
            Some(room) => {
                let status = room.status().await;
                if status == RoomStatus::Stopped && info.role != Role::Streamer {
                    return Err(Error::new_room(
                        format!("room {} is stopped", info.name),
                        RoomErrorKind::RoomStopped,
                    ));
                }
                (status == RoomStatus::Streaming).then_some(room)
            }
            None => None,
        };

        match (live, info.role) {
            (Some(room), _) => {
                room.authorize(info)?;
                Ok(room)
            }
            (None, Role::Streamer) => {
                let secret = info
                    .secret
                    .clone()
                    .filter(|secret| !secret.is_empty())
                    .ok_or_else(|| {
                        Error::new_authorization(
                            format!("room {} needs a secret", info.name),
                            AuthorizationErrorKind::InvalidSecret,
                        )
                    })?;
                Ok(self.insert_room(
                    &mut rooms,
                    info.name.clone(),
                    info.title.clone().unwrap_or_default(),
                    secret,
                    info.key.clone().filter(|key| !key.is_empty()),
                ))
            }
            (None, _) => Err(Error::new_room(
                format!("room {} not found", info.name),
                RoomErrorKind::RoomNotFound,
            )),
        }
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        tracing::debug!("Hub is dropped");
    }
}

async fn next_client_info(transport: &mut Transport) -> Result<ClientInfo, Error> {
    loop {
        let frame = match transport.stream.recv().await {
            Some(frame) => frame?,
            None => return Err(closed_before_handshake()),
        };
        let envelope = match frame {
            Frame::Text(text) => Envelope::decode(text.as_bytes())?,
            Frame::Binary(data) => Envelope::decode(&data)?,
            Frame::Ping(data) => {
                transport.sink.send(Frame::Pong(data)).await?;
                continue;
            }
            Frame::Pong(_) => continue,
            Frame::Close => return Err(closed_before_handshake()),
        };
        return match envelope.kind {
            MessageType::ClientInfo => envelope.payload(),
            kind => Err(Error::new_protocol(
                format!("expected ClientInfo, got {}", kind),
                ProtocolErrorKind::MissingHandshake,
            )),
        };
    }
}

fn closed_before_handshake() -> Error {
    Error::new_connection(
        "connection closed before handshake".to_owned(),
        ConnectionErrorKind::Closed,
    )
}

/// Tells the peer why it was turned away, then closes the transport. Gives up on a peer that
/// does not read within [`CLOSE_FRAME_TIMEOUT`].
async fn reject(transport: &mut Transport, err: &Error) {
    let envelope = match err {
        Error::AuthorizationError(_) => Envelope::new(MessageType::Unauthorized, &err.to_string()),
        Error::ConnectionError(_) => {
            let _ = transport.sink.close().await;
            return;
        }
        _ => Envelope::new(MessageType::Error, &err.to_string()),
    };
    let sink = &mut transport.sink;
    let goodbye = async {
        match envelope.and_then(|envelope| envelope.encode()) {
            Ok(text) => {
                if let Err(err) = sink.send(Frame::Text(text)).await {
                    tracing::debug!("Failed to send rejection: {}", err);
                }
            }
            Err(err) => tracing::error!("Failed to encode rejection: {}", err),
        }
        let _ = sink.send(Frame::Close).await;
    };
    if tokio::time::timeout(CLOSE_FRAME_TIMEOUT, goodbye).await.is_err() {
        tracing::debug!("Rejected peer is not reading, dropping the rejection");
    }
    let _ = transport.sink.close().await;
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;
    use crate::{
        client::testing::{next_envelope, send_envelope, wait_until},
        message::Winsize,
        transport::memory_pair,
    };

    #[derive(Default)]
    struct MemoryStore {
        saved: StdMutex<Vec<Vec<RoomInfo>>>,
    }

    #[async_trait]
    impl RoomInfoStore for MemoryStore {
        async fn save(&self, rooms: Vec<RoomInfo>) -> Result<(), Error> {
            self.saved.lock().unwrap().push(rooms);
            Ok(())
        }
    }

    fn handshake(name: &str, role: Role, secret: Option<&str>) -> Envelope {
        Envelope::new(
            MessageType::ClientInfo,
            &ClientInfo {
                name: name.to_owned(),
                role,
                secret: secret.map(str::to_owned),
                key: None,
                title: Some("my terminal".to_owned()),
            },
        )
        .unwrap()
    }

    fn connect(hub: &Arc<Hub>) -> (tokio::task::JoinHandle<Result<(), Error>>, Transport) {
        let (local, remote) = memory_pair(64);
        let hub = hub.clone();
        (tokio::spawn(async move { hub.accept(local).await }), remote)
    }

    #[tokio::test]
    async fn streamer_creates_room_and_viewer_follows() {
        let hub = Arc::new(Hub::new(Config::default()));

        let (_streamer_task, mut streamer) = connect(&hub);
        send_envelope(&mut streamer, &handshake("alice", Role::Streamer, Some("s1"))).await;
        let authorized = next_envelope(&mut streamer).await.unwrap();
        assert_eq!(authorized.kind, MessageType::Authorized);

        let room = hub.find("alice").await.unwrap();
        assert_eq!(room.title().await, "my terminal");

        let (_viewer_task, mut viewer) = connect(&hub);
        send_envelope(&mut viewer, &handshake("alice", Role::Viewer, None)).await;
        let authorized = next_envelope(&mut viewer).await.unwrap();
        assert_eq!(authorized.kind, MessageType::Authorized);
        let room_ref = room.as_ref();
        wait_until(|| async move { room_ref.client_count().await == 1 }).await;

        let winsize = Envelope::new(MessageType::Winsize, &Winsize { rows: 24, cols: 80 }).unwrap();
        send_envelope(&mut streamer, &winsize).await;
        assert_eq!(next_envelope(&mut viewer).await.unwrap(), winsize);

        send_envelope(&mut viewer, &Envelope::empty(MessageType::RequestRoomInfo)).await;
        let info: RoomInfo = next_envelope(&mut viewer).await.unwrap().payload().unwrap();
        assert_eq!(info.streamer_id, "alice");
        assert_eq!(info.n_viewers, 1);
        assert_eq!(info.acc_n_viewers, 1);
    }

    #[tokio::test]
    async fn wrong_secret_is_unauthorized() {
        let hub = Arc::new(Hub::new(Config::default()));
        hub.create_room("alice".to_owned(), "t".to_owned(), "s1".to_owned(), None)
            .await
            .unwrap();

        let (task, mut remote) = connect(&hub);
        send_envelope(&mut remote, &handshake("alice", Role::StreamerChat, Some("bad"))).await;
        let rejected = next_envelope(&mut remote).await.unwrap();
        assert_eq!(rejected.kind, MessageType::Unauthorized);
        assert!(next_envelope(&mut remote).await.is_none());

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.authorization_kind(), Some(AuthorizationErrorKind::InvalidSecret));
    }

    #[tokio::test]
    async fn first_message_must_be_client_info() {
        let hub = Arc::new(Hub::new(Config::default()));
        let (task, mut remote) = connect(&hub);
        send_envelope(&mut remote, &Envelope::empty(MessageType::RequestWinsize)).await;

        let rejected = next_envelope(&mut remote).await.unwrap();
        assert_eq!(rejected.kind, MessageType::Error);
        assert!(next_envelope(&mut remote).await.is_none());
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ProtocolError(_)));
    }

    #[tokio::test]
    async fn viewer_of_unknown_room_is_rejected() {
        let hub = Arc::new(Hub::new(Config::default()));
        let (task, mut remote) = connect(&hub);
        send_envelope(&mut remote, &handshake("nobody", Role::Viewer, None)).await;

        assert_eq!(next_envelope(&mut remote).await.unwrap().kind, MessageType::Error);
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.room_kind(), Some(RoomErrorKind::RoomNotFound));
    }

    #[tokio::test]
    async fn create_room_rules() {
        let hub = Hub::new(Config::default());
        let first = hub
            .create_room("bob".to_owned(), "t".to_owned(), "s1".to_owned(), None)
            .await
            .unwrap();

        let err = hub
            .create_room("bob".to_owned(), "t".to_owned(), "s1".to_owned(), None)
            .await
            .unwrap_err();
        assert_eq!(err.room_kind(), Some(RoomErrorKind::RoomExists));
        let err = hub
            .create_room("bob".to_owned(), "t".to_owned(), "other".to_owned(), None)
            .await
            .unwrap_err();
        assert_eq!(err.authorization_kind(), Some(AuthorizationErrorKind::InvalidSecret));

        first.stop(RoomStatus::Stopped).await;
        let second = hub
            .create_room("bob".to_owned(), "t".to_owned(), "s2".to_owned(), None)
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.status().await, RoomStatus::Streaming);

        hub.remove("bob").await.unwrap();
        assert!(hub.find("bob").await.is_none());
        assert_eq!(second.status().await, RoomStatus::Stopped);
        let err = hub.remove("bob").await.unwrap_err();
        assert_eq!(err.room_kind(), Some(RoomErrorKind::RoomNotFound));
    }

    #[tokio::test]
    async fn idle_rooms_are_stopped_and_saved() {
        let store = Arc::new(MemoryStore::default());
        let hub = Hub::new(Config::default()).with_store(store.clone());
        hub.create_room("carol".to_owned(), "t".to_owned(), "s1".to_owned(), None)
            .await
            .unwrap();

        assert!(hub.scan_idle(Duration::from_secs(3600)).await.is_empty());
        assert_eq!(hub.scan_idle(Duration::ZERO).await, vec!["carol".to_owned()]);
        assert!(hub.scan_idle(Duration::ZERO).await.is_empty());

        hub.sync_store().await.unwrap();
        let saved = store.saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0][0].status, RoomStatus::Stopped);
        assert!(saved[0][0].stopped_time.is_some());
    }
}
