use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use derivative::Derivative;
use futures_util::future::join_all;
use tokio::{sync::Mutex, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    client::ClientConnection,
    config::Config,
    error::{AuthorizationErrorKind, Error, ProtocolErrorKind, RoomErrorKind},
    message::{
        ChatBatch, ChatMessage, ClientInfo, Envelope, MessageType, Role, RoomInfo, RoomStatus,
        RoomUpdate, Winsize,
    },
    recorder::Recorder,
    replay_buffer::ReplayBuffer,
    sfu::Sfu,
};

/// Roles a room info snapshot is broadcast to after a title change.
const ALL_ROLES: [Role; 3] = [Role::Streamer, Role::StreamerChat, Role::Viewer];

/// Everything needed to open a room.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct RoomParams {
    /// Stable room key, usually the streamer's name.
    pub name: String,
    pub title: String,
    /// Streamer authentication token.
    #[derivative(Debug = "ignore")]
    pub secret: String,
    /// Viewer authentication token. A room with a key is private.
    #[derivative(Debug = "ignore")]
    pub key: Option<String>,
    #[derivative(Debug = "ignore")]
    pub recorder: Option<Arc<dyn Recorder>>,
}

#[derive(Debug)]
struct RoomState {
    title: String,
    status: RoomStatus,
    streamer: Option<Arc<ClientConnection>>,
    /// Bumped each time a streamer connection is installed.
    generation: u64,
    last_winsize: Option<Winsize>,
    started_time: DateTime<Utc>,
    last_active_time: DateTime<Utc>,
    stopped_time: Option<DateTime<Utc>>,
}

/// Session hub that wraps one streamer and multiple clients together.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Room {
    pub name: String,
    #[derivative(Debug = "ignore")]
    secret: String,
    #[derivative(Debug = "ignore")]
    key: Option<String>,
    state: Mutex<RoomState>,
    clients: Mutex<HashMap<String, Arc<ClientConnection>>>,
    messages: ReplayBuffer<Envelope>,
    chats: ReplayBuffer<ChatMessage>,
    /// Viewers ever admitted. Never decremented.
    accumulated_viewers: AtomicU64,
    sfu: Sfu,
    /// Cancelled once the room is Stopped.
    stopped: CancellationToken,
    started: Instant,
    #[derivative(Debug = "ignore")]
    recorder: Option<Arc<dyn Recorder>>,
}

impl Room {
    pub fn new(params: RoomParams, config: &Config) -> Arc<Self> {
        let now = Utc::now();
        let room = Self {
            name: params.name,
            secret: params.secret,
            key: params.key,
            state: Mutex::new(RoomState {
                title: params.title,
                status: RoomStatus::Streaming,
                streamer: None,
                generation: 0,
                last_winsize: None,
                started_time: now,
                last_active_time: now,
                stopped_time: None,
            }),
            clients: Mutex::new(HashMap::new()),
            messages: ReplayBuffer::new(config.room.message_buffer_size),
            chats: ReplayBuffer::new(config.room.chat_buffer_size),
            accumulated_viewers: AtomicU64::new(0),
            sfu: Sfu::new(config.sfu.clone()),
            stopped: CancellationToken::new(),
            started: Instant::now(),
            recorder: params.recorder,
        };

        tracing::debug!("Room {} is created", room.name);

        Arc::new(room)
    }

    pub fn is_private(&self) -> bool {
        self.key.is_some()
    }

    pub async fn status(&self) -> RoomStatus {
        self.state.lock().await.status
    }

    pub async fn title(&self) -> String {
        self.state.lock().await.title.clone()
    }

    /// Checks a handshake against this room. Streamer-side roles need the secret and viewer-side
    /// roles need the key when the room is private.
    pub fn authorize(&self, info: &ClientInfo) -> Result<(), Error> {
        if info.role.requires_secret() {
            return self.verify_secret(info.secret.as_deref());
        }
        match &self.key {
            Some(key) if info.key.as_deref() != Some(key.as_str()) => {
                Err(Error::new_authorization(
                    format!("invalid key for room {}", self.name),
                    AuthorizationErrorKind::InvalidKey,
                ))
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn verify_secret(&self, secret: Option<&str>) -> Result<(), Error> {
        if secret != Some(self.secret.as_str()) {
            return Err(Error::new_authorization(
                format!("invalid secret for room {}", self.name),
                AuthorizationErrorKind::InvalidSecret,
            ));
        }
        Ok(())
    }

    async fn ensure_streaming(&self) -> Result<(), Error> {
        if self.status().await == RoomStatus::Stopped {
            return Err(Error::new_room(
                format!("room {} is stopped", self.name),
                RoomErrorKind::RoomStopped,
            ));
        }
        Ok(())
    }

    /// Installs the streamer connection. A previous streamer is closed and the last one wins.
    ///
    /// The room stops once the installed connection closes, unless it has been replaced by then.
    pub async fn add_streamer(
        self: &Arc<Self>,
        streamer: Arc<ClientConnection>,
    ) -> Result<(), Error> {
        if streamer.role() != Role::Streamer {
            return Err(Error::new_room(
                format!("{} cannot stream to room {}", streamer.role(), self.name),
                RoomErrorKind::UnsupportedRole,
            ));
        }
        let (previous, generation) = {
            let mut state = self.state.lock().await;
            if state.status == RoomStatus::Stopped {
                return Err(Error::new_room(
                    format!("room {} is stopped", self.name),
                    RoomErrorKind::RoomStopped,
                ));
            }
            state.generation += 1;
            state.last_active_time = Utc::now();
            (state.streamer.replace(streamer.clone()), state.generation)
        };
        if let Some(previous) = previous {
            tracing::info!("Room {} replaces streamer {}", self.name, previous.id);
            previous.close().await;
        }

        let room = Arc::clone(self);
        tokio::spawn(async move {
            streamer.closed().await;
            room.streamer_closed(generation).await;
        });

        tracing::info!("Room {} has a new streamer", self.name);
        Ok(())
    }

    async fn streamer_closed(&self, generation: u64) {
        let current = self.state.lock().await.generation == generation;
        if current {
            tracing::info!("Room {} streamer has gone, stopping", self.name);
            self.stop(RoomStatus::Stopped).await;
        } else {
            tracing::debug!("Room {} ignores a replaced streamer", self.name);
        }
    }

    /// Reads the streamer connection until it closes, buffering and fanning out its messages.
    pub async fn start(self: &Arc<Self>) -> Result<(), Error> {
        let streamer = self.state.lock().await.streamer.clone().ok_or_else(|| {
            Error::new_room(
                format!("room {} has no streamer", self.name),
                RoomErrorKind::StreamerMissing,
            )
        })?;

        let connection = Arc::clone(&streamer);
        tokio::spawn(async move {
            connection.start().await;
        });

        while let Some(envelope) = streamer.recv().await {
            if let Err(err) = self.handle_streamer_message(envelope).await {
                tracing::warn!("Room {} ignored a streamer message: {}", self.name, err);
            }
        }
        tracing::debug!("Room {} streamer {} read loop finished", self.name, streamer.id);
        Ok(())
    }

    pub(crate) async fn handle_streamer_message(&self, envelope: Envelope) -> Result<(), Error> {
        match envelope.kind {
            MessageType::Write | MessageType::WriteBlock | MessageType::Winsize => {
                let winsize = match envelope.kind {
                    MessageType::Winsize => Some(envelope.payload::<Winsize>()?),
                    _ => None,
                };
                {
                    let mut state = self.state.lock().await;
                    state.last_active_time = Utc::now();
                    if winsize.is_some() {
                        state.last_winsize = winsize;
                    }
                }
                self.record(&envelope);
                self.messages.push(envelope.clone()).await;
                self.broadcast(envelope, &[Role::Viewer], &[]).await;
                Ok(())
            }
            MessageType::RoomUpdate => {
                let update = envelope.payload::<RoomUpdate>()?;
                self.update_title(update.title).await
            }
            MessageType::Close => {
                tracing::info!("Room {} streamer asked to close", self.name);
                self.stop(RoomStatus::Stopped).await;
                Ok(())
            }
            kind => Err(Error::new_protocol(
                format!("unexpected {} from streamer", kind),
                ProtocolErrorKind::UnexpectedMessage,
            )),
        }
    }

    async fn update_title(&self, title: String) -> Result<(), Error> {
        self.state.lock().await.title = title;
        let info = self.prepare_room_info().await;
        self.broadcast(Envelope::new(MessageType::RoomInfo, &info)?, &ALL_ROLES, &[])
            .await;
        Ok(())
    }

    /// Registers a client and serves it until it disconnects. The client is closed on return,
    /// including when it is rejected.
    ///
    /// Viewer and StreamerChat clients run the request loop. RTC roles are handed to the SFU and
    /// are not part of the client set.
    pub async fn add_client(
        self: &Arc<Self>,
        id: String,
        client: Arc<ClientConnection>,
    ) -> Result<(), Error> {
        let served = self.serve_client(id, client.clone()).await;
        client.close().await;
        served
    }

    async fn serve_client(
        self: &Arc<Self>,
        id: String,
        client: Arc<ClientConnection>,
    ) -> Result<(), Error> {
        self.ensure_streaming().await?;
        match client.role() {
            Role::Viewer | Role::StreamerChat => {
                self.register_client(id.clone(), client.clone()).await?;
                let connection = Arc::clone(&client);
                tokio::spawn(async move {
                    connection.start().await;
                });
                let served = self.read_and_handle_client_message(&id).await;
                self.unregister_client(&id, &client).await;
                served
            }
            Role::ProducerRtc | Role::ConsumerRtc => {
                let connection = Arc::clone(&client);
                tokio::spawn(async move {
                    connection.start().await;
                });
                // A stop racing this join closes the client, which ends add_peer.
                let stopped = self.stopped.clone();
                let connection = Arc::clone(&client);
                tokio::spawn(async move {
                    tokio::select! {
                        _ = stopped.cancelled() => connection.close().await,
                        _ = connection.closed() => {}
                    }
                });
                self.sfu.add_peer(client).await
            }
            Role::Streamer => Err(Error::new_room(
                format!("streamer {} must join room {} with add_streamer", id, self.name),
                RoomErrorKind::UnsupportedRole,
            )),
        }
    }

    /// Inserts a client into the client set without serving it.
    pub async fn register_client(
        &self,
        id: String,
        client: Arc<ClientConnection>,
    ) -> Result<(), Error> {
        let mut clients = self.clients.lock().await;
        // Checked under the clients lock so a concurrent stop cannot miss this client.
        self.ensure_streaming().await?;
        if clients.contains_key(&id) {
            return Err(Error::new_room(
                format!("client {} already exists in room {}", id, self.name),
                RoomErrorKind::DuplicateClient,
            ));
        }
        if client.role() == Role::Viewer {
            self.accumulated_viewers.fetch_add(1, Ordering::SeqCst);
        }
        tracing::info!("Room {} client {} role={} joined", self.name, id, client.role());
        clients.insert(id, client);
        Ok(())
    }

    /// Removes a client from the client set and closes it.
    pub async fn remove_client(&self, id: &str) -> Result<(), Error> {
        let removed = self.clients.lock().await.remove(id);
        match removed {
            Some(client) => {
                client.close().await;
                tracing::info!("Room {} client {} left", self.name, id);
                Ok(())
            }
            None => Err(Error::new_room(
                format!("client {} not found in room {}", id, self.name),
                RoomErrorKind::ClientNotFound,
            )),
        }
    }

    /// Removes `client` only if it is still the one registered under `id`.
    async fn unregister_client(&self, id: &str, client: &Arc<ClientConnection>) {
        let mut clients = self.clients.lock().await;
        if clients.get(id).is_some_and(|current| Arc::ptr_eq(current, client)) {
            clients.remove(id);
            tracing::info!("Room {} client {} left", self.name, id);
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }

    /// Serves requests from one registered client until its connection closes.
    pub async fn read_and_handle_client_message(&self, id: &str) -> Result<(), Error> {
        let client = self.clients.lock().await.get(id).cloned().ok_or_else(|| {
            Error::new_room(
                format!("client {} not found in room {}", id, self.name),
                RoomErrorKind::ClientNotFound,
            )
        })?;
        while let Some(envelope) = client.recv().await {
            if let Err(err) = self.handle_client_message(&client, envelope).await {
                tracing::warn!("Room {} client {}: {}", self.name, id, err);
            }
        }
        Ok(())
    }

    pub(crate) async fn handle_client_message(
        &self,
        client: &Arc<ClientConnection>,
        envelope: Envelope,
    ) -> Result<(), Error> {
        match envelope.kind {
            MessageType::RequestWinsize => {
                let winsize = self.state.lock().await.last_winsize;
                if let Some(winsize) = winsize {
                    client.send(Envelope::new(MessageType::Winsize, &winsize)?)?;
                }
                Ok(())
            }
            MessageType::RequestCacheContent => {
                for message in self.messages.snapshot().await {
                    client.send(message)?;
                }
                Ok(())
            }
            MessageType::RequestRoomInfo => {
                let info = self.prepare_room_info().await;
                client.send(Envelope::new(MessageType::RoomInfo, &info)?)
            }
            MessageType::RequestCacheChat => {
                let chats = self.chats.snapshot().await;
                if chats.is_empty() {
                    return Ok(());
                }
                client.send(Envelope::new(MessageType::Chat, &chats)?)
            }
            MessageType::Chat => {
                let messages: Vec<ChatMessage> = envelope
                    .payload::<ChatBatch>()?
                    .into_messages()
                    .into_iter()
                    .filter(|message| !message.is_blank())
                    .collect();
                if messages.is_empty() {
                    return Ok(());
                }
                for message in &messages {
                    self.chats.push(message.clone()).await;
                }
                let envelope = Envelope::new(MessageType::Chat, &messages)?;
                self.record(&envelope);
                self.broadcast(
                    envelope,
                    &[Role::Viewer, Role::StreamerChat],
                    &[client.id.as_str()],
                )
                .await;
                Ok(())
            }
            MessageType::RoomUpdate => {
                if !client.role().can_update_room() {
                    return Err(Error::new_authorization(
                        format!("{} may not update room {}", client.role(), self.name),
                        AuthorizationErrorKind::Forbidden,
                    ));
                }
                let update = envelope.payload::<RoomUpdate>()?;
                self.update_title(update.title).await
            }
            kind => Err(Error::new_protocol(
                format!("unexpected {} from client", kind),
                ProtocolErrorKind::UnexpectedMessage,
            )),
        }
    }

    /// Delivers `envelope` to every alive client whose role is in `roles` and whose id is not
    /// excluded. The streamer gets it too when `roles` contains [`Role::Streamer`]. Clients found
    /// dead are removed from the room.
    pub async fn broadcast(&self, envelope: Envelope, roles: &[Role], exclude: &[&str]) {
        let targets: Vec<(String, Arc<ClientConnection>)> = {
            let clients = self.clients.lock().await;
            clients
                .iter()
                .filter(|(id, client)| {
                    roles.contains(&client.role()) && !exclude.contains(&id.as_str())
                })
                .map(|(id, client)| (id.clone(), client.clone()))
                .collect()
        };

        let mut dead = vec![];
        for (id, client) in targets {
            if !client.is_alive() {
                dead.push((id, client));
                continue;
            }
            if let Err(err) = client.send(envelope.clone()) {
                tracing::warn!("Room {} failed to broadcast to {}: {}", self.name, id, err);
                dead.push((id, client));
            }
        }

        if roles.contains(&Role::Streamer) {
            let streamer = self.state.lock().await.streamer.clone();
            if let Some(streamer) = streamer.filter(|streamer| streamer.is_alive()) {
                if let Err(err) = streamer.send(envelope.clone()) {
                    tracing::warn!("Room {} failed to send to streamer: {}", self.name, err);
                }
            }
        }

        for (id, client) in dead {
            tracing::info!("Room {} drops dead client {}", self.name, id);
            self.unregister_client(&id, &client).await;
            client.close().await;
        }
    }

    /// Closes every client, the SFU and the streamer. A [`RoomStatus::Stopped`] status is
    /// terminal for this instance.
    ///
    /// `stop(RoomStatus::Streaming)` only evicts the current connections. The room keeps
    /// accepting a new streamer and new clients, and never leaves Stopped once there.
    pub async fn stop(&self, status: RoomStatus) {
        // Lock order is clients, then state, as in register_client.
        let (streamer, clients) = {
            let mut clients = self.clients.lock().await;
            let mut state = self.state.lock().await;
            if status == RoomStatus::Stopped && state.status != RoomStatus::Stopped {
                state.status = RoomStatus::Stopped;
                state.stopped_time = Some(Utc::now());
                self.stopped.cancel();
            }
            let clients: Vec<Arc<ClientConnection>> =
                clients.drain().map(|(_, client)| client).collect();
            // The evicted streamer's watch task must not stop the room again.
            state.generation += 1;
            (state.streamer.take(), clients)
        };

        join_all(clients.iter().map(|client| client.close())).await;
        self.sfu.close().await;
        if let Some(streamer) = streamer {
            streamer.close().await;
        }
        tracing::info!("Room {} is stopped with status {}", self.name, status);
    }

    /// Snapshot of the room, for clients and for the room store.
    pub async fn prepare_room_info(&self) -> RoomInfo {
        let n_viewers = {
            let clients = self.clients.lock().await;
            clients
                .values()
                .filter(|client| client.role() == Role::Viewer && client.is_alive())
                .count()
        };
        let last_active_time = self.last_active_time().await;
        let state = self.state.lock().await;
        RoomInfo {
            streamer_id: self.name.clone(),
            title: state.title.clone(),
            n_viewers,
            acc_n_viewers: self.accumulated_viewers.load(Ordering::SeqCst),
            started_time: state.started_time,
            last_active_time,
            stopped_time: state.stopped_time,
            status: state.status,
            private: self.is_private(),
        }
    }

    /// Last streamer activity: a buffered message, or any traffic such as a pong on its connection.
    pub async fn last_active_time(&self) -> DateTime<Utc> {
        let state = self.state.lock().await;
        let traffic = state
            .streamer
            .as_ref()
            .filter(|streamer| streamer.is_alive())
            .and_then(|streamer| chrono::Duration::from_std(streamer.idle_for()).ok())
            .map(|idle| Utc::now() - idle);
        match traffic {
            Some(traffic) if traffic > state.last_active_time => traffic,
            _ => state.last_active_time,
        }
    }

    fn record(&self, envelope: &Envelope) {
        if let Some(recorder) = &self.recorder {
            recorder.record(&self.name, envelope, self.started.elapsed());
        }
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        tracing::debug!("Room {} is dropped", self.name);
    }
}
