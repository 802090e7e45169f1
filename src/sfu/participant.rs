use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use derivative::Derivative;
use enclose::enc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors, media_engine::MediaEngine,
        setting_engine::SettingEngine, APIBuilder,
    },
    ice::udp_network::{EphemeralUDP, UDPNetwork},
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_candidate_type::RTCIceCandidateType,
        ice_server::RTCIceServer,
    },
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
    rtp_transceiver::{
        rtp_codec::RTPCodecType, rtp_receiver::RTCRtpReceiver,
        rtp_transceiver_direction::RTCRtpTransceiverDirection, RTCRtpTransceiver,
        RTCRtpTransceiverInit,
    },
    track::track_remote::TrackRemote,
};

use super::{local_track::LocalTrack, SfuEvent};
use crate::{
    client::ClientConnection,
    config::SfuConfig,
    error::{ConfigErrorKind, Error, NegotiationErrorKind, ProtocolErrorKind},
    message::{Envelope, MessageType, Role, Rtc, RtcEvent},
};

/// One WebRTC peer connection, signaled through its owning client's message channel.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Participant {
    /// Same as the owning client id.
    pub id: String,
    /// Distinguishes this peer connection from any other one registered under the same id.
    pub(crate) session: String,
    role: Role,
    #[derivative(Debug = "ignore")]
    pub(crate) peer_connection: Arc<RTCPeerConnection>,
    client: Arc<ClientConnection>,
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    /// Serializes sender reconciliation and offers on this peer connection.
    pub(crate) negotiation: Mutex<()>,
    offered: AtomicBool,
}

impl Participant {
    pub(crate) async fn new(
        client: Arc<ClientConnection>,
        config: &SfuConfig,
        event_sender: mpsc::UnboundedSender<SfuEvent>,
    ) -> Result<Arc<Self>, Error> {
        let peer_connection = Self::generate_peer_connection(config).await?;

        // Always ready to accept inbound media.
        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            peer_connection
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await?;
        }

        let participant = Arc::new(Self {
            id: client.id.clone(),
            session: Uuid::new_v4().to_string(),
            role: client.role(),
            peer_connection: Arc::new(peer_connection),
            client,
            pending_candidates: Mutex::new(Vec::new()),
            negotiation: Mutex::new(()),
            offered: AtomicBool::new(false),
        });
        participant.ice_state_hooks(event_sender);

        tracing::debug!("Participant {} role={} is created", participant.id, participant.role);

        Ok(participant)
    }

    async fn generate_peer_connection(config: &SfuConfig) -> Result<RTCPeerConnection, Error> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let mut setting_engine = SettingEngine::default();
        if !config.announced_ips.is_empty() {
            setting_engine.set_nat_1to1_ips(
                config.announced_ips.iter().map(|ip| ip.to_string()).collect(),
                RTCIceCandidateType::Host,
            );
        }
        if let Some(range) = config.port_range {
            let ephemeral = EphemeralUDP::new(range.min, range.max).map_err(|err| {
                Error::new_config(
                    format!("invalid RTC port range {}-{}: {}", range.min, range.max, err),
                    ConfigErrorKind::InvalidValue,
                )
            })?;
            setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
        }

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let ice_servers = config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone(),
                credential: server.credential.clone(),
                ..Default::default()
            })
            .collect();

        let peer_connection = api
            .new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await?;
        Ok(peer_connection)
    }

    fn ice_state_hooks(&self, event_sender: mpsc::UnboundedSender<SfuEvent>) {
        let peer = self.peer_connection.clone();
        let id = self.id.clone();
        let session = self.session.clone();

        let client = self.client.clone();
        peer.on_ice_candidate(Box::new(enc!((client) move |candidate: Option<RTCIceCandidate>| {
            Box::pin(enc!((client) async move {
                let Some(candidate) = candidate else {
                    return;
                };
                let relayed = candidate
                    .to_json()
                    .map_err(Error::from)
                    .and_then(|init| Ok(serde_json::to_string(&init)?))
                    .and_then(|data| Envelope::rtc(RtcEvent::Candidate, data))
                    .and_then(|envelope| client.send(envelope));
                if let Err(err) = relayed {
                    tracing::error!("Participant {} failed to relay ICE candidate: {}", client.id, err);
                }
            }))
        })));

        peer.on_peer_connection_state_change(Box::new(enc!((event_sender, id, session) move |state: RTCPeerConnectionState| {
            tracing::debug!("Participant {} connection state changed: {}", id, state);
            Box::pin(enc!((event_sender, id, session) async move {
                match state {
                    RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Disconnected
                    | RTCPeerConnectionState::Closed => {
                        let _ = event_sender.send(SfuEvent::ParticipantRemoved(id, session));
                    }
                    _ => {}
                }
            }))
        })));

        if self.role != Role::ProducerRtc {
            return;
        }
        let publisher = Arc::downgrade(&peer);
        peer.on_track(Box::new(enc!((event_sender, id, publisher) move |remote: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
            Box::pin(enc!((event_sender, id, publisher) async move {
                tracing::info!(
                    "Track published: track_id={}, owner={}, mime_type={}",
                    remote.id(),
                    id,
                    remote.codec().capability.mime_type
                );
                let local_track = LocalTrack::from_remote(id, &remote, publisher);
                local_track.forward(remote, event_sender.clone());
                let _ = event_sender.send(SfuEvent::TrackPublished(local_track));
            }))
        })));
    }

    /// Creates an offer, applies it locally and sends it to the client.
    pub(crate) async fn send_offer(&self) -> Result<(), Error> {
        let offer = self.peer_connection.create_offer(None).await?;
        self.peer_connection.set_local_description(offer).await?;
        let Some(offer) = self.peer_connection.local_description().await else {
            return Err(Error::new_negotiation(
                format!("Participant {} has no local description", self.id),
                NegotiationErrorKind::LocalDescriptionMissing,
            ));
        };
        let data = serde_json::to_string(&offer)?;
        self.client.send(Envelope::rtc(RtcEvent::Offer, data)?)?;
        self.offered.store(true, Ordering::SeqCst);
        tracing::debug!("Participant {} sent an offer", self.id);
        Ok(())
    }

    pub(crate) fn has_offered(&self) -> bool {
        self.offered.load(Ordering::SeqCst)
    }

    /// Candidates arriving before the remote description are queued until the answer is applied.
    pub(crate) async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error> {
        if self.peer_connection.remote_description().await.is_some() {
            tracing::trace!("Participant {} adding ICE candidate {:?}", self.id, candidate);
            self.peer_connection.add_ice_candidate(candidate).await?;
        } else {
            tracing::trace!("Participant {} pending ICE candidate {:?}", self.id, candidate);
            self.pending_candidates.lock().await.push(candidate);
        }
        Ok(())
    }

    pub(crate) async fn set_answer(&self, answer: RTCSessionDescription) -> Result<(), Error> {
        self.peer_connection.set_remote_description(answer).await?;
        let pendings: Vec<_> = self.pending_candidates.lock().await.drain(..).collect();
        for candidate in pendings {
            if let Err(err) = self.peer_connection.add_ice_candidate(candidate).await {
                tracing::error!("Participant {} failed to add pending ICE candidate: {}", self.id, err);
            }
        }
        Ok(())
    }

    /// Reads the client's inbound queue until it closes. Answers and candidates are applied to
    /// the peer connection. A failed answer ends the loop.
    pub(crate) async fn signaling_loop(&self) {
        while let Some(envelope) = self.client.recv().await {
            if let Err(err) = self.handle_signal(envelope).await {
                match err {
                    Error::WebRTCError(_) | Error::NegotiationError(_) => {
                        tracing::error!("Participant {} negotiation failed: {}", self.id, err);
                        break;
                    }
                    err => tracing::warn!("Participant {} ignored a message: {}", self.id, err),
                }
            }
        }
        tracing::debug!("Participant {} signaling loop finished", self.id);
    }

    async fn handle_signal(&self, envelope: Envelope) -> Result<(), Error> {
        let rtc = match envelope.kind {
            MessageType::Rtc => envelope.payload::<Rtc>()?,
            kind => {
                return Err(Error::new_protocol(
                    format!("unexpected {} on a signaling channel", kind),
                    ProtocolErrorKind::UnexpectedMessage,
                ))
            }
        };
        match rtc.event {
            RtcEvent::Candidate => {
                let candidate: RTCIceCandidateInit = serde_json::from_str(&rtc.data)?;
                if let Err(err) = self.add_ice_candidate(candidate).await {
                    tracing::warn!("Participant {} failed to add ICE candidate: {}", self.id, err);
                }
                Ok(())
            }
            RtcEvent::Answer => {
                let answer: RTCSessionDescription = serde_json::from_str(&rtc.data)?;
                self.set_answer(answer).await
            }
            RtcEvent::Offer => Err(Error::new_protocol(
                format!("Participant {} sent an offer, the server initiates", self.id),
                ProtocolErrorKind::UnexpectedMessage,
            )),
        }
    }

    pub(crate) async fn close(&self) {
        if let Err(err) = self.peer_connection.close().await {
            tracing::error!("Participant {} failed to close peer connection: {}", self.id, err);
        }
        self.client.close().await;
    }
}

impl Drop for Participant {
    fn drop(&mut self) {
        tracing::debug!("Participant {} is dropped", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::testing::{send_envelope, wait_until},
        config::RoomConfig,
        transport::{memory_pair, Transport},
    };

    async fn participant(
        id: &str,
        role: Role,
    ) -> (
        Arc<Participant>,
        Transport,
        mpsc::UnboundedReceiver<SfuEvent>,
    ) {
        let (local, remote) = memory_pair(64);
        let client = ClientConnection::new(id.to_owned(), role, local, &RoomConfig::default());
        let config = SfuConfig {
            ice_servers: vec![],
            ..Default::default()
        };
        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        let participant = Participant::new(client, &config, event_sender).await.unwrap();
        (participant, remote, event_receiver)
    }

    /// Answers `offer` the way a browser client would.
    async fn answer_offer(offer: RTCSessionDescription) -> (RTCPeerConnection, RTCSessionDescription) {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().unwrap();
        let api = APIBuilder::new().with_media_engine(media_engine).build();
        let peer = api
            .new_peer_connection(RTCConfiguration::default())
            .await
            .unwrap();
        peer.set_remote_description(offer).await.unwrap();
        let answer = peer.create_answer(None).await.unwrap();
        peer.set_local_description(answer.clone()).await.unwrap();
        (peer, answer)
    }

    async fn local_offer(participant: &Participant) -> RTCSessionDescription {
        participant.send_offer().await.unwrap();
        assert!(participant.has_offered());
        participant.peer_connection.local_description().await.unwrap()
    }

    fn host_candidate() -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: "candidate:1 1 udp 2130706431 127.0.0.1 50000 typ host".to_owned(),
            sdp_mid: Some("0".to_owned()),
            sdp_mline_index: Some(0),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn early_candidates_wait_for_the_answer() {
        let (participant, _remote, _events) = participant("c1", Role::ConsumerRtc).await;
        let offer = local_offer(&participant).await;

        participant.add_ice_candidate(host_candidate()).await.unwrap();
        assert_eq!(participant.pending_candidates.lock().await.len(), 1);

        let (answerer, answer) = answer_offer(offer).await;
        participant.set_answer(answer).await.unwrap();
        assert!(participant.pending_candidates.lock().await.is_empty());
        assert!(participant.peer_connection.remote_description().await.is_some());

        answerer.close().await.unwrap();
        participant.close().await;
    }

    #[tokio::test]
    async fn signaling_ignores_client_offers_and_applies_answers() {
        let (participant, mut remote, _events) = participant("c1", Role::ConsumerRtc).await;
        tokio::spawn({
            let client = participant.client.clone();
            async move { client.start().await }
        });
        let signaling = tokio::spawn({
            let participant = participant.clone();
            async move { participant.signaling_loop().await }
        });
        let offer = local_offer(&participant).await;
        let (answerer, answer) = answer_offer(offer.clone()).await;

        let stray = Envelope::rtc(RtcEvent::Offer, serde_json::to_string(&offer).unwrap()).unwrap();
        send_envelope(&mut remote, &stray).await;
        let data = serde_json::to_string(&answer).unwrap();
        send_envelope(&mut remote, &Envelope::rtc(RtcEvent::Answer, data).unwrap()).await;

        let participant_ref = participant.as_ref();
        wait_until(|| async move {
            participant_ref
                .peer_connection
                .remote_description()
                .await
                .is_some()
        })
        .await;
        assert!(!signaling.is_finished());

        answerer.close().await.unwrap();
        participant.close().await;
        assert!(tokio::time::timeout(std::time::Duration::from_secs(5), signaling)
            .await
            .is_ok());
    }
}
