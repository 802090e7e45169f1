use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{local_track::LocalTrack, participant::Participant, Sfu, SfuEvent, Snapshot};
use crate::{config::SfuConfig, error::Error};

pub(crate) async fn snapshot(
    event_sender: &mpsc::UnboundedSender<SfuEvent>,
) -> Result<Snapshot, Error> {
    let (reply_sender, reply_receiver) = oneshot::channel();
    event_sender
        .send(SfuEvent::Snapshot(reply_sender))
        .map_err(|_| Sfu::closed_error())?;
    reply_receiver.await.map_err(|_| Sfu::closed_error())
}

/// Runs one convergence pass per sync request. Requests arriving during a pass are coalesced
/// into the next one.
pub(crate) async fn sync_loop(
    event_sender: mpsc::UnboundedSender<SfuEvent>,
    sync_sender: mpsc::Sender<()>,
    mut sync_receiver: mpsc::Receiver<()>,
    config: Arc<SfuConfig>,
    closed: CancellationToken,
) {
    tracing::debug!("Sfu sync loop started");
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            request = sync_receiver.recv() => {
                if request.is_none() {
                    break;
                }
            }
        }
        if !sync_peers(&event_sender, &config).await {
            tracing::warn!(
                "Sfu did not converge after {} attempts, retrying in {:?}",
                config.sync_attempts,
                config.sync_cooldown
            );
            let sync_sender = sync_sender.clone();
            let cooldown = config.sync_cooldown;
            let closed = closed.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = closed.cancelled() => {}
                    _ = tokio::time::sleep(cooldown) => {
                        let _ = sync_sender.try_send(());
                    }
                }
            });
        }
    }
    tracing::debug!("Sfu sync loop finished");
}

/// Retries [`converge`] up to the configured number of attempts. Returns whether every
/// participant was reconciled.
async fn sync_peers(event_sender: &mpsc::UnboundedSender<SfuEvent>, config: &SfuConfig) -> bool {
    for attempt in 1..=config.sync_attempts {
        let snapshot = match snapshot(event_sender).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::debug!("Sfu sync stopped: {}", err);
                return true;
            }
        };
        if converge(&snapshot).await {
            return true;
        }
        tracing::debug!("Sfu sync attempt {} failed", attempt);
    }
    false
}

/// Reconciles every participant against the published tracks. Returns false when any of them failed.
pub(crate) async fn converge(snapshot: &Snapshot) -> bool {
    let mut converged = true;
    for participant in &snapshot.participants {
        if let Err(err) = reconcile(participant, &snapshot.tracks).await {
            tracing::warn!("Participant {} failed to sync tracks: {}", participant.id, err);
            converged = false;
        }
    }
    converged
}

/// Makes the participant's senders match the published tracks, excluding its own tracks.
/// Sends a fresh offer when anything changed and returns whether it did.
pub(crate) async fn reconcile(
    participant: &Participant,
    tracks: &HashMap<String, Arc<LocalTrack>>,
) -> Result<bool, Error> {
    let _guard = participant.negotiation.lock().await;
    let peer_connection = &participant.peer_connection;
    let mut changed = false;
    let mut sending = HashSet::new();

    for sender in peer_connection.get_senders().await {
        let Some(track) = sender.track().await else {
            continue;
        };
        let id = track.id().to_owned();
        let published = tracks
            .get(&id)
            .is_some_and(|track| track.owner != participant.id);
        if !published || !sending.insert(id.clone()) {
            tracing::debug!("Participant {} stops sending track {}", participant.id, id);
            peer_connection.remove_track(&sender).await?;
            changed = true;
        }
    }

    for (id, track) in tracks {
        if track.owner == participant.id || sending.contains(id) {
            continue;
        }
        tracing::debug!("Participant {} starts sending track {}", participant.id, id);
        let sender = peer_connection.add_track(track.outbound()).await?;
        track.relay_rtcp(sender);
        changed = true;
    }

    if changed {
        participant.send_offer().await?;
    }
    Ok(changed)
}
