use std::sync::{Arc, Weak};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use webrtc::{
    peer_connection::RTCPeerConnection,
    rtcp::{
        self,
        header::{PacketType, FORMAT_PLI},
        payload_feedbacks::picture_loss_indication::PictureLossIndication,
    },
    rtp_transceiver::{rtp_codec::RTCRtpCodecCapability, rtp_sender::RTCRtpSender},
    track::{
        track_local::{track_local_static_rtp::TrackLocalStaticRTP, TrackLocal, TrackLocalWriter},
        track_remote::TrackRemote,
    },
};

use super::SfuEvent;

/// A published track, republished as a shared outbound track that every other participant sends.
#[derive(Debug)]
pub(crate) struct LocalTrack {
    /// The ID is the same as the inbound track id.
    pub id: String,
    /// Participant that published the track. It is never sent back to its owner.
    pub owner: String,
    pub track: Arc<TrackLocalStaticRTP>,
    /// SSRC of the inbound stream, the media source of keyframe requests.
    ssrc: u32,
    publisher: Weak<RTCPeerConnection>,
    closed: CancellationToken,
}

impl LocalTrack {
    pub(crate) fn new(
        owner: String,
        capability: RTCRtpCodecCapability,
        id: String,
        stream_id: String,
        ssrc: u32,
        publisher: Weak<RTCPeerConnection>,
    ) -> Arc<Self> {
        let track = Arc::new(TrackLocalStaticRTP::new(capability, id.clone(), stream_id));
        tracing::debug!("LocalTrack id={} owner={} ssrc={} is created", id, owner, ssrc);
        Arc::new(Self {
            id,
            owner,
            track,
            ssrc,
            publisher,
            closed: CancellationToken::new(),
        })
    }

    pub(crate) fn from_remote(
        owner: String,
        remote: &TrackRemote,
        publisher: Weak<RTCPeerConnection>,
    ) -> Arc<Self> {
        Self::new(
            owner,
            remote.codec().capability,
            remote.id(),
            remote.stream_id(),
            remote.ssrc(),
            publisher,
        )
    }

    pub(crate) fn outbound(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.track) as Arc<dyn TrackLocal + Send + Sync>
    }

    /// Copies RTP packets from `remote` until it hangs up, then deregisters this track.
    pub(crate) fn forward(
        self: &Arc<Self>,
        remote: Arc<TrackRemote>,
        event_sender: mpsc::UnboundedSender<SfuEvent>,
    ) {
        let local_track = Arc::clone(self);
        tokio::spawn(async move {
            local_track.rtp_event_loop(remote).await;
            let _ = event_sender.send(SfuEvent::TrackRemoved(
                local_track.id.clone(),
                local_track.owner.clone(),
            ));
        });
    }

    async fn rtp_event_loop(&self, remote: Arc<TrackRemote>) {
        tracing::debug!(
            "LocalTrack id={} owner={} RTP event loop has started, payload_type={}, mime_type={}",
            self.id,
            self.owner,
            remote.payload_type(),
            remote.codec().capability.mime_type
        );

        loop {
            tokio::select! {
                _ = self.closed.cancelled() => break,
                res = remote.read_rtp() => {
                    match res {
                        Ok((packet, _attr)) => {
                            tracing::trace!(
                                "LocalTrack id={} received RTP ssrc={} seq={}",
                                self.id,
                                packet.header.ssrc,
                                packet.header.sequence_number
                            );
                            if let Err(err) = self.track.write_rtp(&packet).await {
                                tracing::trace!("LocalTrack id={} failed to write rtp: {}", self.id, err);
                            }
                        }
                        Err(webrtc::error::Error::ErrClosedPipe) => break,
                        Err(webrtc::error::Error::Interceptor(webrtc::interceptor::Error::Srtp(
                            webrtc_srtp::Error::Util(webrtc_util::Error::ErrBufferClosed),
                        ))) => break,
                        Err(err) => {
                            tracing::error!("LocalTrack id={} failed to read rtp: {}", self.id, err);
                            break;
                        }
                    }
                }
            }
        }

        tracing::debug!("LocalTrack id={} RTP event loop has finished", self.id);
    }

    /// Reads RTCP from a subscriber's sender until it closes, and asks the publisher for a
    /// keyframe whenever the subscriber reports a lost picture.
    pub(crate) fn relay_rtcp(self: &Arc<Self>, sender: Arc<RTCRtpSender>) {
        let local_track = Arc::clone(self);
        tokio::spawn(async move {
            tracing::debug!("LocalTrack id={} RTCP event loop has started", local_track.id);
            loop {
                tokio::select! {
                    _ = local_track.closed.cancelled() => break,
                    res = sender.read_rtcp() => {
                        match res {
                            Ok((packets, _attr)) => {
                                if wants_keyframe(&packets) {
                                    local_track.request_keyframe().await;
                                }
                            }
                            Err(webrtc::error::Error::ErrClosedPipe) => break,
                            Err(err) => {
                                tracing::debug!("LocalTrack id={} stopped reading rtcp: {}", local_track.id, err);
                                break;
                            }
                        }
                    }
                }
            }
            tracing::debug!("LocalTrack id={} RTCP event loop has finished", local_track.id);
        });
    }

    /// Sends a PLI for this track to the publisher. Returns false when the publisher is gone or
    /// the write fails.
    pub(crate) async fn request_keyframe(&self) -> bool {
        let Some(publisher) = self.publisher.upgrade() else {
            return false;
        };
        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc: self.ssrc,
        };
        let packets: [Box<dyn rtcp::packet::Packet + Send + Sync>; 1] = [Box::new(pli)];
        match publisher.write_rtcp(&packets).await {
            Ok(_) => {
                tracing::trace!("LocalTrack id={} sent pli to {}", self.id, self.owner);
                true
            }
            Err(err) => {
                tracing::error!("LocalTrack id={} failed to send rtcp pli: {}", self.id, err);
                false
            }
        }
    }

    pub(crate) fn close(&self) {
        self.closed.cancel();
    }
}

fn wants_keyframe(packets: &[Box<dyn rtcp::packet::Packet + Send + Sync>]) -> bool {
    packets.iter().any(|packet| {
        let header = packet.header();
        header.packet_type == PacketType::PayloadSpecificFeedback
            && header.count == FORMAT_PLI
            && packet
                .as_any()
                .downcast_ref::<PictureLossIndication>()
                .is_some()
    })
}

impl Drop for LocalTrack {
    fn drop(&mut self) {
        tracing::debug!("LocalTrack id={} owner={} is dropped", self.id, self.owner);
    }
}

#[cfg(test)]
mod tests {
    use webrtc::{
        api::media_engine::MIME_TYPE_VP8, rtcp::receiver_report::ReceiverReport,
    };

    use super::*;

    fn vp8_track(publisher: Weak<RTCPeerConnection>) -> Arc<LocalTrack> {
        LocalTrack::new(
            "p1".to_owned(),
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            "video-p1".to_owned(),
            "stream-p1".to_owned(),
            1234,
            publisher,
        )
    }

    #[test]
    fn only_picture_loss_asks_for_keyframe() {
        let pli: Vec<Box<dyn rtcp::packet::Packet + Send + Sync>> = vec![Box::new(PictureLossIndication {
            sender_ssrc: 1,
            media_ssrc: 1234,
        })];
        let report: Vec<Box<dyn rtcp::packet::Packet + Send + Sync>> =
            vec![Box::new(ReceiverReport::default())];

        assert!(wants_keyframe(&pli));
        assert!(!wants_keyframe(&report));
        assert!(!wants_keyframe(&[]));
    }

    #[tokio::test]
    async fn keyframe_request_without_publisher_is_skipped() {
        let track = vp8_track(Weak::new());
        assert!(!track.request_keyframe().await);
    }
}
