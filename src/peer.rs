use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::channel::SignalingChannel;
use crate::envelope::{Signal, VIEWERS_TARGET};
use crate::errors::StudioError;
use crate::id_types::{ClientId, StreamKey};
use crate::metrics::STUDIO_NEGOTIATION_FAILURES_TOTAL;
use crate::rtc;

/// Which side of the stream this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Broadcaster,
    Viewer,
}

/// Negotiation state of the active peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    HaveLocalOffer,
    HaveRemoteOffer,
    Connected,
    Failed,
    Closed,
}

/// Events the manager reports upward to the session. Failures are never
/// retried here; the session decides whether to rebuild the link.
#[derive(Debug)]
pub enum PeerEvent {
    RemoteStreamAttached,
    NegotiationFailed(String),
}

/// The remote media surfaced to a viewer once tracks attach.
#[derive(Clone, Default)]
pub struct RemoteStream {
    pub tracks: Vec<Arc<TrackRemote>>,
}

struct ActiveLink {
    pc: Arc<RTCPeerConnection>,
    generation: u64,
    state_tx: watch::Sender<LinkState>,
}

impl ActiveLink {
    async fn close(&self) {
        let _ = self.state_tx.send(LinkState::Closed);
        if let Err(e) = self.pc.close().await {
            warn!(error = %e, "error closing prior peer link");
        }
    }
}

/// Owns the lifecycle of the real-time peer media connection. Exactly one
/// link is live per session; `setup()` always tears the previous one down
/// first, and callbacks registered on a replaced link are no-ops.
pub struct PeerManager {
    role: Role,
    stream_key: StreamKey,
    channel: SignalingChannel,
    stun_url: String,
    link: Mutex<Option<ActiveLink>>,
    /// Bumped on every `setup()`. Callbacks capture the value they were
    /// registered under and bail out when it is no longer current.
    generation: Arc<AtomicU64>,
    remote_stream_tx: watch::Sender<Option<RemoteStream>>,
    events_tx: mpsc::Sender<PeerEvent>,
}

impl PeerManager {
    pub fn new(
        role: Role,
        stream_key: StreamKey,
        channel: SignalingChannel,
        stun_url: impl Into<String>,
    ) -> (Arc<Self>, mpsc::Receiver<PeerEvent>) {
        let (events_tx, events_rx) = mpsc::channel(16);
        let (remote_stream_tx, _) = watch::channel(None);
        (
            Arc::new(PeerManager {
                role,
                stream_key,
                channel,
                stun_url: stun_url.into(),
                link: Mutex::new(None),
                generation: Arc::new(AtomicU64::new(0)),
                remote_stream_tx,
                events_tx,
            }),
            events_rx,
        )
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Remote media watch; `None` until a track attaches on the current link.
    pub fn remote_stream(&self) -> watch::Receiver<Option<RemoteStream>> {
        self.remote_stream_tx.subscribe()
    }

    /// Negotiation state of the current link, if one exists.
    pub async fn link_state(&self) -> Option<LinkState> {
        let link = self.link.lock().await;
        link.as_ref().map(|l| *l.state_tx.borrow())
    }

    /// Where this side addresses its candidates: a broadcaster targets the
    /// viewers broadcast group, a viewer targets the streamer.
    fn candidate_target(&self) -> String {
        match self.role {
            Role::Broadcaster => VIEWERS_TARGET.to_string(),
            Role::Viewer => self.stream_key.as_ref().to_string(),
        }
    }

    /// Builds a fresh peer link bound to the session's role, closing any
    /// prior link first. Callable repeatedly; the returned reference is not
    /// stable across calls.
    pub async fn setup(self: &Arc<Self>) -> Result<Arc<RTCPeerConnection>, StudioError> {
        let mut slot = self.link.lock().await;

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(old) = slot.take() {
            info!(generation = old.generation, "closing prior peer link before setup");
            old.close().await;
        }
        let _ = self.remote_stream_tx.send(None);

        let api = rtc::create_webrtc_api();
        let config = rtc::rtc_config(&self.stun_url);
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| StudioError::NegotiationFailed(e.to_string()))?,
        );

        let (state_tx, _) = watch::channel(LinkState::New);
        self.register_ice_candidate_handler(&pc, generation);
        self.register_state_handlers(&pc, generation, state_tx.clone());
        if self.role == Role::Viewer {
            self.register_track_handler(&pc, generation);
        }

        *slot = Some(ActiveLink {
            pc: pc.clone(),
            generation,
            state_tx,
        });
        info!(role = ?self.role, generation, "peer link ready");
        Ok(pc)
    }

    fn register_ice_candidate_handler(self: &Arc<Self>, pc: &Arc<RTCPeerConnection>, generation: u64) {
        let channel = self.channel.clone();
        let target = self.candidate_target();
        let live = self.generation.clone();

        pc.on_ice_candidate(Box::new(
            move |c: Option<webrtc::ice_transport::ice_candidate::RTCIceCandidate>| {
                let channel = channel.clone();
                let target = target.clone();
                let live = live.clone();
                Box::pin(async move {
                    if live.load(Ordering::Acquire) != generation {
                        return; // stale link
                    }
                    if let Some(candidate) = c {
                        let init = match candidate.to_json() {
                            Ok(init) => init,
                            Err(e) => {
                                error!(error = %e, "failed to serialize local ICE candidate");
                                return;
                            }
                        };
                        let json = match serde_json::to_string(&init) {
                            Ok(json) => json,
                            Err(e) => {
                                error!(error = %e, "failed to encode local ICE candidate");
                                return;
                            }
                        };
                        debug!(target = %target, "generated local ICE candidate");
                        let sender_id = channel.client_id().clone();
                        let _ = channel
                            .emit_to(
                                Signal::IceCandidate {
                                    candidate: json,
                                    recipient_id: target.clone(),
                                    sender_id,
                                },
                                target.clone(),
                            )
                            .await;
                    }
                })
            },
        ));
    }

    fn register_state_handlers(
        self: &Arc<Self>,
        pc: &Arc<RTCPeerConnection>,
        generation: u64,
        state_tx: watch::Sender<LinkState>,
    ) {
        let live = self.generation.clone();
        let events = self.events_tx.clone();
        let ice_state_tx = state_tx.clone();
        pc.on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
            let live = live.clone();
            let events = events.clone();
            let state_tx = ice_state_tx.clone();
            Box::pin(async move {
                if live.load(Ordering::Acquire) != generation {
                    return;
                }
                info!(state = %s, "ICE connection state changed");
                if matches!(
                    s,
                    RTCIceConnectionState::Failed | RTCIceConnectionState::Disconnected
                ) {
                    STUDIO_NEGOTIATION_FAILURES_TOTAL.inc();
                    let _ = state_tx.send(LinkState::Failed);
                    let _ = events
                        .send(PeerEvent::NegotiationFailed(format!("ICE state {}", s)))
                        .await;
                }
            })
        }));

        let live = self.generation.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let live = live.clone();
            let state_tx = state_tx.clone();
            Box::pin(async move {
                if live.load(Ordering::Acquire) != generation {
                    return;
                }
                info!(state = %s, "peer connection state changed");
                if s == RTCPeerConnectionState::Connected {
                    let _ = state_tx.send(LinkState::Connected);
                }
            })
        }));
    }

    fn register_track_handler(self: &Arc<Self>, pc: &Arc<RTCPeerConnection>, generation: u64) {
        let live = self.generation.clone();
        let remote_tx = self.remote_stream_tx.clone();
        let events = self.events_tx.clone();

        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let live = live.clone();
            let remote_tx = remote_tx.clone();
            let events = events.clone();
            Box::pin(async move {
                if live.load(Ordering::Acquire) != generation {
                    return; // track for a replaced link
                }
                info!(kind = %track.kind(), stream_id = %track.stream_id(), "remote track attached");
                remote_tx.send_modify(|current| {
                    current
                        .get_or_insert_with(RemoteStream::default)
                        .tracks
                        .push(track.clone());
                });
                let _ = events.send(PeerEvent::RemoteStreamAttached).await;
            })
        }));
    }

    /// Applies an inbound ICE candidate, creating a link first if none
    /// exists. Envelopes echoing our own channel id are dropped.
    pub async fn apply_remote_candidate(
        self: &Arc<Self>,
        candidate: &str,
        sender_id: &ClientId,
    ) -> Result<(), StudioError> {
        if sender_id == self.channel.client_id() {
            debug!("ignoring self-echoed ICE candidate");
            return Ok(());
        }

        if self.link.lock().await.is_none() {
            self.setup().await?;
        }
        let pc = self.current_pc().await.ok_or_else(|| {
            StudioError::NegotiationFailed("no active peer link".to_string())
        })?;

        let init: RTCIceCandidateInit = serde_json::from_str(candidate)
            .map_err(|e| StudioError::NegotiationFailed(format!("bad ICE candidate: {}", e)))?;
        if let Err(e) = pc.add_ice_candidate(init).await {
            error!(error = %e, "failed to add remote ICE candidate");
        }
        Ok(())
    }

    /// Viewer side: applies a remote offer and answers it back to its sender.
    pub async fn apply_remote_offer(
        self: &Arc<Self>,
        offer_sdp: &str,
        sender_id: &ClientId,
    ) -> Result<(), StudioError> {
        if sender_id == self.channel.client_id() {
            debug!("ignoring self-echoed offer");
            return Ok(());
        }
        if self.role != Role::Viewer {
            debug!("offer received on broadcaster side, ignoring");
            return Ok(());
        }

        if self.link.lock().await.is_none() {
            self.setup().await?;
        }
        let (pc, state_tx) = self
            .current_link()
            .await
            .ok_or_else(|| StudioError::NegotiationFailed("no active peer link".to_string()))?;

        let desc = RTCSessionDescription::offer(offer_sdp.to_string())
            .map_err(|e| StudioError::NegotiationFailed(e.to_string()))?;
        pc.set_remote_description(desc)
            .await
            .map_err(|e| StudioError::NegotiationFailed(e.to_string()))?;
        let _ = state_tx.send(LinkState::HaveRemoteOffer);

        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| StudioError::NegotiationFailed(e.to_string()))?;
        let mut gather_complete = pc.gathering_complete_promise().await;
        pc.set_local_description(answer)
            .await
            .map_err(|e| StudioError::NegotiationFailed(e.to_string()))?;
        if pc.ice_gathering_state() != RTCIceGatheringState::Complete {
            let _ = tokio::time::timeout(
                tokio::time::Duration::from_millis(1500),
                gather_complete.recv(),
            )
            .await;
        }

        let local = pc
            .local_description()
            .await
            .ok_or_else(|| StudioError::NegotiationFailed("no local description".to_string()))?;

        info!(recipient = %sender_id, "sending answer");
        self.channel
            .emit_to(
                Signal::Answer {
                    answer: local.sdp,
                    recipient_id: sender_id.as_ref().to_string(),
                    sender_id: self.channel.client_id().clone(),
                },
                sender_id.as_ref(),
            )
            .await
    }

    /// Broadcaster side: applies a viewer's answer to the current link.
    pub async fn apply_remote_answer(
        self: &Arc<Self>,
        answer_sdp: &str,
        sender_id: &ClientId,
    ) -> Result<(), StudioError> {
        if sender_id == self.channel.client_id() {
            debug!("ignoring self-echoed answer");
            return Ok(());
        }
        if self.role != Role::Broadcaster {
            debug!("answer received on viewer side, ignoring");
            return Ok(());
        }

        let pc = self.current_pc().await.ok_or_else(|| {
            StudioError::NegotiationFailed("answer with no active peer link".to_string())
        })?;
        let desc = RTCSessionDescription::answer(answer_sdp.to_string())
            .map_err(|e| StudioError::NegotiationFailed(e.to_string()))?;
        pc.set_remote_description(desc)
            .await
            .map_err(|e| StudioError::NegotiationFailed(e.to_string()))?;
        info!(sender = %sender_id, "applied viewer answer");
        Ok(())
    }

    /// Attaches an outgoing local track to the current link; must happen
    /// before `negotiate()`. Returns the sample-writable track.
    pub async fn attach_local_track(
        self: &Arc<Self>,
        track_id: &str,
        mime_type: &str,
    ) -> Result<Arc<TrackLocalStaticSample>, StudioError> {
        let pc = self.current_pc().await.ok_or_else(|| {
            StudioError::NegotiationFailed("attach_local_track before setup".to_string())
        })?;
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track_id.to_owned(),
            self.stream_key.as_ref().to_owned(),
        ));
        pc.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| StudioError::NegotiationFailed(e.to_string()))?;
        Ok(track)
    }

    /// Broadcaster side: creates and sends the offer to the viewers target.
    pub async fn negotiate(self: &Arc<Self>) -> Result<(), StudioError> {
        let (pc, state_tx) = self
            .current_link()
            .await
            .ok_or_else(|| StudioError::NegotiationFailed("negotiate before setup".to_string()))?;

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| StudioError::NegotiationFailed(e.to_string()))?;
        let mut gather_complete = pc.gathering_complete_promise().await;
        pc.set_local_description(offer)
            .await
            .map_err(|e| StudioError::NegotiationFailed(e.to_string()))?;
        let _ = state_tx.send(LinkState::HaveLocalOffer);

        if pc.ice_gathering_state() != RTCIceGatheringState::Complete {
            info!("waiting for ICE gathering");
            let _ = tokio::time::timeout(
                tokio::time::Duration::from_millis(1500),
                gather_complete.recv(),
            )
            .await;
        }

        let local = pc
            .local_description()
            .await
            .ok_or_else(|| StudioError::NegotiationFailed("no local description".to_string()))?;

        info!(sdp_length = local.sdp.len(), "sending offer to viewers");
        self.channel
            .emit_to(
                Signal::Offer {
                    offer: local.sdp,
                    sender_id: self.channel.client_id().clone(),
                },
                VIEWERS_TARGET,
            )
            .await
    }

    /// Closes the current link. Safe to call with no link.
    pub async fn close(&self) {
        let mut slot = self.link.lock().await;
        // Invalidate outstanding callbacks even if no link exists.
        self.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(link) = slot.take() {
            info!(generation = link.generation, "closing peer link");
            link.close().await;
        }
        let _ = self.remote_stream_tx.send(None);
    }

    async fn current_pc(&self) -> Option<Arc<RTCPeerConnection>> {
        self.link.lock().await.as_ref().map(|l| l.pc.clone())
    }

    async fn current_link(&self) -> Option<(Arc<RTCPeerConnection>, watch::Sender<LinkState>)> {
        self.link
            .lock()
            .await
            .as_ref()
            .map(|l| (l.pc.clone(), l.state_tx.clone()))
    }
}
