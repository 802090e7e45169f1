use std::{collections::HashMap, sync::Arc};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    client::ClientConnection,
    config::SfuConfig,
    error::{Error, NegotiationErrorKind, RoomErrorKind},
};

pub(crate) mod local_track;
/// Peer connection and signaling for one SFU participant.
pub mod participant;
mod sync;

use local_track::LocalTrack;
use participant::Participant;

/// Selective forwarding unit of a room. Relays media from producers to every other participant.
///
/// Participants and published tracks are owned by a single event loop task. Peer connection
/// callbacks and the convergence worker reach it only through [`SfuEvent`]s, so negotiation never
/// runs while the registries are borrowed.
#[derive(Debug)]
pub struct Sfu {
    event_sender: mpsc::UnboundedSender<SfuEvent>,
    config: Arc<SfuConfig>,
    closed: CancellationToken,
}

impl Sfu {
    pub fn new(config: SfuConfig) -> Self {
        let config = Arc::new(config);
        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        // Capacity 1 coalesces bursts of sync requests into a single pending pass.
        let (sync_sender, sync_receiver) = mpsc::channel(1);
        let closed = CancellationToken::new();

        tokio::spawn(Self::sfu_event_loop(
            event_receiver,
            sync_sender.clone(),
            closed.clone(),
        ));
        tokio::spawn(sync::sync_loop(
            event_sender.clone(),
            sync_sender,
            sync_receiver,
            config.clone(),
            closed.clone(),
        ));

        tracing::debug!("Sfu is created");

        Self {
            event_sender,
            config,
            closed,
        }
    }

    /// Runs one audio/video participant until its client goes away.
    ///
    /// The peer connection is registered before negotiating, already published tracks are
    /// attached, and the server sends the first offer. Afterwards the client's inbound queue is
    /// read for answers and candidates. The peer connection and the client are always closed on
    /// return.
    pub async fn add_peer(&self, client: Arc<ClientConnection>) -> Result<(), Error> {
        let participant =
            match Participant::new(client.clone(), &self.config, self.event_sender.clone()).await {
                Ok(participant) => participant,
                Err(err) => {
                    client.close().await;
                    return Err(err);
                }
            };

        let (reply_sender, reply_receiver) = oneshot::channel();
        self.send_event(SfuEvent::ParticipantJoined(
            participant.clone(),
            reply_sender,
        ))?;
        let joined = match reply_receiver.await {
            Ok(joined) => joined,
            Err(_) => Err(Self::closed_error()),
        };
        if let Err(err) = joined {
            participant.close().await;
            return Err(err);
        }

        let result = self.negotiate(&participant).await;
        if let Err(err) = &result {
            tracing::error!("Participant {} failed to negotiate: {}", participant.id, err);
        } else {
            participant.signaling_loop().await;
        }

        let _ = self.event_sender.send(SfuEvent::ParticipantRemoved(
            participant.id.clone(),
            participant.session.clone(),
        ));
        participant.close().await;
        result
    }

    async fn negotiate(&self, participant: &Arc<Participant>) -> Result<(), Error> {
        let snapshot = sync::snapshot(&self.event_sender).await?;
        sync::reconcile(participant, &snapshot.tracks).await?;
        let _guard = participant.negotiation.lock().await;
        if !participant.has_offered() {
            participant.send_offer().await?;
        }
        Ok(())
    }

    /// Closes every participant and drops every published track. The SFU stays usable.
    pub async fn close(&self) {
        let (reply_sender, reply_receiver) = oneshot::channel();
        if self.send_event(SfuEvent::Close(reply_sender)).is_err() {
            return;
        }
        let Ok(participants) = reply_receiver.await else {
            return;
        };
        for participant in participants {
            participant.close().await;
        }
    }

    /// IDs of the currently published tracks.
    pub async fn track_ids(&self) -> Result<Vec<String>, Error> {
        let snapshot = sync::snapshot(&self.event_sender).await?;
        Ok(snapshot.tracks.into_keys().collect())
    }

    pub async fn participant_ids(&self) -> Result<Vec<String>, Error> {
        let snapshot = sync::snapshot(&self.event_sender).await?;
        Ok(snapshot
            .participants
            .iter()
            .map(|participant| participant.id.clone())
            .collect())
    }

    fn send_event(&self, event: SfuEvent) -> Result<(), Error> {
        self.event_sender
            .send(event)
            .map_err(|_| Self::closed_error())
    }

    fn closed_error() -> Error {
        Error::new_negotiation(
            "sfu event loop has finished".to_owned(),
            NegotiationErrorKind::SfuClosed,
        )
    }

    async fn sfu_event_loop(
        mut event_receiver: mpsc::UnboundedReceiver<SfuEvent>,
        sync_sender: mpsc::Sender<()>,
        closed: CancellationToken,
    ) {
        tracing::debug!("Sfu event loop started");
        let mut participants: HashMap<String, Arc<Participant>> = HashMap::new();
        let mut tracks: HashMap<String, Arc<LocalTrack>> = HashMap::new();

        loop {
            let event = tokio::select! {
                _ = closed.cancelled() => break,
                event = event_receiver.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let changed = match event {
                SfuEvent::ParticipantJoined(participant, reply_sender) => {
                    if participants.contains_key(&participant.id) {
                        let _ = reply_sender.send(Err(Error::new_room(
                            format!("participant {} already exists", participant.id),
                            RoomErrorKind::DuplicateClient,
                        )));
                        false
                    } else {
                        tracing::info!("Participant {} joined", participant.id);
                        participants.insert(participant.id.clone(), participant);
                        let _ = reply_sender.send(Ok(()));
                        // The joining peer is reconciled by its own add_peer.
                        false
                    }
                }
                SfuEvent::ParticipantRemoved(id, session) => {
                    let current = participants
                        .get(&id)
                        .is_some_and(|participant| participant.session == session);
                    let removed = if current { participants.remove(&id) } else { None };
                    if let Some(participant) = removed {
                        // Closing waits on the peer connection, keep it off the loop.
                        tokio::spawn(async move {
                            participant.close().await;
                        });
                        tracks.retain(|_, track| {
                            if track.owner == id {
                                track.close();
                                false
                            } else {
                                true
                            }
                        });
                        tracing::info!("Participant {} left", id);
                    }
                    current
                }
                SfuEvent::TrackPublished(track) => {
                    if participants.contains_key(&track.owner) {
                        tracks.insert(track.id.clone(), track);
                        true
                    } else {
                        tracing::debug!("Track {} is published by a gone participant {}", track.id, track.owner);
                        track.close();
                        false
                    }
                }
                SfuEvent::TrackRemoved(id, owner) => {
                    let owned = tracks
                        .get(&id)
                        .is_some_and(|track| track.owner == owner);
                    if owned {
                        tracks.remove(&id);
                        tracing::info!("Track {} of {} is removed", id, owner);
                    }
                    owned
                }
                SfuEvent::Snapshot(reply_sender) => {
                    let _ = reply_sender.send(Snapshot {
                        participants: participants.values().cloned().collect(),
                        tracks: tracks.clone(),
                    });
                    false
                }
                SfuEvent::Close(reply_sender) => {
                    for (_, track) in tracks.drain() {
                        track.close();
                    }
                    let _ = reply_sender.send(participants.drain().map(|(_, p)| p).collect());
                    false
                }
            };
            if changed {
                // A full channel already holds a pending pass.
                let _ = sync_sender.try_send(());
            }
        }
        tracing::debug!("Sfu event loop finished");
    }
}

impl Drop for Sfu {
    fn drop(&mut self) {
        self.closed.cancel();
        tracing::debug!("Sfu is dropped");
    }
}

#[derive(Debug)]
pub(crate) struct Snapshot {
    pub participants: Vec<Arc<Participant>>,
    pub tracks: HashMap<String, Arc<LocalTrack>>,
}

#[derive(Debug)]
pub(crate) enum SfuEvent {
    ParticipantJoined(Arc<Participant>, oneshot::Sender<Result<(), Error>>),
    /// Participant id and session.
    ParticipantRemoved(String, String),
    TrackPublished(Arc<LocalTrack>),
    /// Track id and owner id.
    TrackRemoved(String, String),
    Snapshot(oneshot::Sender<Snapshot>),
    Close(oneshot::Sender<Vec<Arc<Participant>>>),
}

#[cfg(test)]
mod tests {
    use webrtc::{
        api::media_engine::MIME_TYPE_OPUS, rtp_transceiver::rtp_codec::RTCRtpCodecCapability,
    };

    use super::*;
    use crate::{
        client::testing::{next_envelope, wait_until},
        config::RoomConfig,
        message::{MessageType, Role, Rtc, RtcEvent},
        transport::{memory_pair, Transport},
    };

    fn offline_config() -> SfuConfig {
        SfuConfig {
            ice_servers: vec![],
            ..Default::default()
        }
    }

    fn opus_track(owner: &str, id: &str) -> Arc<LocalTrack> {
        LocalTrack::new(
            owner.to_owned(),
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            id.to_owned(),
            format!("{}-stream", owner),
            0,
            std::sync::Weak::new(),
        )
    }

    async fn sent_track_ids(participant: &Participant) -> Vec<String> {
        let mut ids = vec![];
        for sender in participant.peer_connection.get_senders().await {
            if let Some(track) = sender.track().await {
                ids.push(track.id().to_owned());
            }
        }
        ids
    }

    async fn find_participant(sfu: &Sfu, id: &str) -> Option<Arc<Participant>> {
        sync::snapshot(&sfu.event_sender)
            .await
            .ok()?
            .participants
            .into_iter()
            .find(|participant| participant.id == id)
    }

    /// Starts an RTC client and runs it as a peer until it is registered.
    async fn join(sfu: &Arc<Sfu>, id: &str, role: Role) -> (Arc<ClientConnection>, Transport) {
        let (local, remote) = memory_pair(64);
        let client = ClientConnection::new(id.to_owned(), role, local, &RoomConfig::default());
        tokio::spawn({
            let client = client.clone();
            async move { client.start().await }
        });
        tokio::spawn({
            let client = client.clone();
            let sfu = sfu.clone();
            async move { sfu.add_peer(client).await }
        });
        let sfu = sfu.as_ref();
        wait_until(|| async move { find_participant(sfu, id).await.is_some() }).await;
        (client, remote)
    }

    #[tokio::test]
    async fn new_peer_receives_offer() {
        let sfu = Arc::new(Sfu::new(offline_config()));
        let (_client, mut remote) = join(&sfu, "c1", Role::ConsumerRtc).await;

        loop {
            let envelope = next_envelope(&mut remote).await.unwrap();
            assert_eq!(envelope.kind, MessageType::Rtc);
            let rtc: Rtc = envelope.payload().unwrap();
            if rtc.event == RtcEvent::Offer {
                assert!(rtc.data.contains("\"type\":\"offer\""));
                break;
            }
            assert_eq!(rtc.event, RtcEvent::Candidate);
        }
    }

    #[tokio::test]
    async fn published_track_reaches_every_other_participant_once() {
        let sfu = Arc::new(Sfu::new(offline_config()));
        let (_producer, _producer_remote) = join(&sfu, "p1", Role::ProducerRtc).await;
        let (_consumer, _consumer_remote) = join(&sfu, "c1", Role::ConsumerRtc).await;
        let (_other, _other_remote) = join(&sfu, "c2", Role::ConsumerRtc).await;

        sfu.event_sender
            .send(SfuEvent::TrackPublished(opus_track("p1", "audio-p1")))
            .unwrap();

        for id in ["c1", "c2"] {
            let consumer = find_participant(&sfu, id).await.unwrap();
            let consumer = consumer.as_ref();
            wait_until(|| async move {
                sent_track_ids(consumer).await == vec!["audio-p1".to_owned()]
            })
            .await;
        }

        // Reconciling again changes nothing.
        let snapshot = sync::snapshot(&sfu.event_sender).await.unwrap();
        for participant in &snapshot.participants {
            assert!(!sync::reconcile(participant, &snapshot.tracks).await.unwrap());
        }
        let consumer = find_participant(&sfu, "c1").await.unwrap();
        assert_eq!(sent_track_ids(&consumer).await, vec!["audio-p1".to_owned()]);
        let producer = find_participant(&sfu, "p1").await.unwrap();
        assert!(sent_track_ids(&producer).await.is_empty());
    }

    #[tokio::test]
    async fn late_joiner_gets_published_tracks() {
        let sfu = Arc::new(Sfu::new(offline_config()));
        let (_producer, _producer_remote) = join(&sfu, "p1", Role::ProducerRtc).await;
        sfu.event_sender
            .send(SfuEvent::TrackPublished(opus_track("p1", "audio-p1")))
            .unwrap();
        let sfu_ref = sfu.as_ref();
        wait_until(|| async move { sfu_ref.track_ids().await.unwrap().len() == 1 }).await;

        let (_consumer, _consumer_remote) = join(&sfu, "c1", Role::ConsumerRtc).await;
        let consumer = find_participant(&sfu, "c1").await.unwrap();
        let consumer = consumer.as_ref();
        wait_until(|| async move { sent_track_ids(consumer).await.len() == 1 }).await;
    }

    #[tokio::test]
    async fn producer_leaving_removes_its_tracks_everywhere() {
        let sfu = Arc::new(Sfu::new(offline_config()));
        let (producer, _producer_remote) = join(&sfu, "p1", Role::ProducerRtc).await;
        let (_consumer, _consumer_remote) = join(&sfu, "c1", Role::ConsumerRtc).await;

        sfu.event_sender
            .send(SfuEvent::TrackPublished(opus_track("p1", "audio-p1")))
            .unwrap();
        let consumer = find_participant(&sfu, "c1").await.unwrap();
        let consumer = consumer.as_ref();
        wait_until(|| async move { sent_track_ids(consumer).await.len() == 1 }).await;

        producer.close().await;
        let sfu_ref = sfu.as_ref();
        wait_until(|| async move { find_participant(sfu_ref, "p1").await.is_none() }).await;
        assert!(sfu.track_ids().await.unwrap().is_empty());
        wait_until(|| async move { sent_track_ids(consumer).await.is_empty() }).await;
    }

    #[tokio::test]
    async fn track_of_unknown_owner_is_ignored() {
        let sfu = Sfu::new(offline_config());
        sfu.event_sender
            .send(SfuEvent::TrackPublished(opus_track("ghost", "audio-ghost")))
            .unwrap();
        assert!(sfu.track_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn close_tears_down_participants() {
        let sfu = Arc::new(Sfu::new(offline_config()));
        let (client, _remote) = join(&sfu, "c1", Role::ConsumerRtc).await;

        sfu.close().await;
        assert!(sfu.participant_ids().await.unwrap().is_empty());
        let client = client.as_ref();
        wait_until(|| async move { !client.is_alive() }).await;
    }

    #[tokio::test]
    async fn ended_track_is_unpublished_only_by_its_owner() {
        let sfu = Arc::new(Sfu::new(offline_config()));
        let (_producer, _producer_remote) = join(&sfu, "p1", Role::ProducerRtc).await;
        let (_consumer, _consumer_remote) = join(&sfu, "c1", Role::ConsumerRtc).await;
        sfu.event_sender
            .send(SfuEvent::TrackPublished(opus_track("p1", "audio-p1")))
            .unwrap();
        let consumer = find_participant(&sfu, "c1").await.unwrap();
        let consumer = consumer.as_ref();
        wait_until(|| async move { sent_track_ids(consumer).await.len() == 1 }).await;

        sfu.event_sender
            .send(SfuEvent::TrackRemoved("audio-p1".to_owned(), "c1".to_owned()))
            .unwrap();
        assert_eq!(sfu.track_ids().await.unwrap(), vec!["audio-p1".to_owned()]);

        // What the forwarding task reports once the publisher's inbound track ends.
        sfu.event_sender
            .send(SfuEvent::TrackRemoved("audio-p1".to_owned(), "p1".to_owned()))
            .unwrap();
        assert!(sfu.track_ids().await.unwrap().is_empty());
        wait_until(|| async move { sent_track_ids(consumer).await.is_empty() }).await;
        assert!(find_participant(&sfu, "p1").await.is_some());
    }
}
