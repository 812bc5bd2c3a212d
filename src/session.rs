use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::capture::{CaptureProvider, MediaHandle, MediaPipeline};
use crate::channel::{ChannelState, Connector, SignalingChannel, Subscription};
use crate::chat::ChatRoom;
use crate::compositor::{Compositor, Corner, Surface};
use crate::config::Config;
use crate::envelope::{Envelope, Signal, Source};
use crate::errors::StudioError;
use crate::id_types::{ClientId, StreamKey, UserId};
use crate::metrics::STUDIO_ACTIVE_SESSIONS;
use crate::peer::{PeerEvent, PeerManager, RemoteStream, Role};
use crate::record::{self, EntryAction, RecordStore, RecordUpdate, StreamStatus};

/// Lifecycle of a stream session. Connectivity is orthogonal: a `Live`
/// session may flicker disconnected without leaving `Live`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Connecting,
    Live,
    Ended,
}

/// Collaborators injected into a session: transport, platform capture,
/// composition surface, and the stream-record store.
pub struct SessionDeps {
    pub config: Config,
    pub connector: Box<dyn Connector>,
    pub capture: Arc<dyn CaptureProvider>,
    pub surface: Box<dyn Surface>,
    pub record: Arc<dyn RecordStore>,
}

struct SessionInner {
    stream_key: StreamKey,
    user_id: UserId,
    role: Role,
    media_base_url: String,
    channel: SignalingChannel,
    peers: Arc<PeerManager>,
    media: Arc<MediaPipeline>,
    compositor: Option<Compositor>,
    capture: Arc<dyn CaptureProvider>,
    chat: Arc<ChatRoom>,
    record: Arc<dyn RecordStore>,
    status_tx: watch::Sender<SessionStatus>,
    connected_tx: watch::Sender<bool>,
    viewer_count_tx: watch::Sender<u64>,
    playback_url: std::sync::Mutex<Option<String>>,
    streaming_url: std::sync::Mutex<Option<String>>,
    last_error: std::sync::Mutex<Option<String>>,
    local_track: std::sync::Mutex<Option<Arc<TrackLocalStaticSample>>>,
    output: std::sync::Mutex<Option<Arc<MediaHandle>>>,
    subscriptions: std::sync::Mutex<Vec<Subscription>>,
    dispatch: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    closed: AtomicBool,
}

/// One stream session per active screen: owns the signaling channel, the
/// peer link, the media pipeline and the chat room, and drives the
/// start/join/stop transitions. Single owner; dropping it tears it down.
pub struct StreamSession {
    inner: Arc<SessionInner>,
}

impl StreamSession {
    /// Connects the signaling channel and wires every component onto it.
    pub async fn open(
        role: Role,
        stream_key: StreamKey,
        user_id: UserId,
        deps: SessionDeps,
    ) -> Result<StreamSession, StudioError> {
        let channel = SignalingChannel::new(
            ClientId::generate(),
            deps.config.signal_endpoint.clone(),
            deps.connector,
        );
        channel.connect().await?;

        let (peers, peer_events) = PeerManager::new(
            role,
            stream_key.clone(),
            channel.clone(),
            deps.config.stun_url.clone(),
        );
        let (media, media_errors) = MediaPipeline::new(stream_key.clone(), channel.clone());
        let chat = Arc::new(ChatRoom::new(
            stream_key.clone(),
            user_id.clone(),
            channel.clone(),
        ));
        let compositor = match role {
            Role::Broadcaster => Some(Compositor::new(deps.surface)),
            Role::Viewer => None,
        };

        let (status_tx, _) = watch::channel(SessionStatus::Idle);
        let (connected_tx, _) = watch::channel(channel.is_connected());
        let (viewer_count_tx, _) = watch::channel(0u64);

        let inner = Arc::new(SessionInner {
            stream_key,
            user_id,
            role,
            media_base_url: deps.config.media_base_url.clone(),
            channel: channel.clone(),
            peers,
            media,
            compositor,
            capture: deps.capture,
            chat,
            record: deps.record,
            status_tx,
            connected_tx,
            viewer_count_tx,
            playback_url: std::sync::Mutex::new(None),
            streaming_url: std::sync::Mutex::new(None),
            last_error: std::sync::Mutex::new(None),
            local_track: std::sync::Mutex::new(None),
            output: std::sync::Mutex::new(None),
            subscriptions: std::sync::Mutex::new(Vec::new()),
            dispatch: std::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        // All inbound signaling funnels through one queue so handler effects
        // apply in arrival order.
        let (events_tx, events_rx) = mpsc::channel::<Envelope>(64);
        let mut subs = Vec::new();
        for kind in [
            "ice-candidate",
            "offer",
            "answer",
            "viewer-count",
            "playback-url",
            "streaming-url",
            "chat-message",
        ] {
            let tx = events_tx.clone();
            subs.push(channel.on(kind, move |env| {
                if tx.try_send(env.clone()).is_err() {
                    warn!(kind = env.signal.kind(), "session event queue full, dropping");
                }
            }));
        }
        *inner.subscriptions.lock().unwrap() = subs;

        let task = tokio::spawn(dispatch_loop(
            Arc::downgrade(&inner),
            events_rx,
            peer_events,
            media_errors,
            channel.state(),
        ));
        *inner.dispatch.lock().unwrap() = Some(task);

        STUDIO_ACTIVE_SESSIONS.inc();
        info!(stream_key = %inner.stream_key, role = ?role, "session opened");
        Ok(StreamSession { inner })
    }

    /// Broadcaster: acquires media, announces the stream and goes `Live`.
    /// A denied camera with a working screen source still reaches `Live`;
    /// with no source at all the acquisition error is returned and the
    /// session stays out of `Live`.
    pub async fn start_stream(&self, metadata: serde_json::Value) -> Result<(), StudioError> {
        self.inner.start_stream(metadata).await
    }

    /// Viewer: announces the join and builds the peer link, then waits for
    /// the broadcaster's offer over signaling.
    pub async fn join_stream(&self) -> Result<(), StudioError> {
        self.inner.join_stream().await
    }

    /// Stops media, closes the peer link and (for a broadcaster that went
    /// live) announces the end. Idempotent.
    pub async fn stop_stream(&self) {
        self.inner.stop_stream().await
    }

    /// Starts or stops screen-share while streaming. Returns whether the
    /// screen is live afterwards.
    pub async fn toggle_screen_share(&self) -> Result<bool, StudioError> {
        self.inner.toggle_screen_share().await
    }

    pub async fn toggle_video(&self) -> Option<bool> {
        self.inner.media.toggle_video().await
    }

    pub async fn toggle_audio(&self) -> Option<bool> {
        self.inner.media.toggle_audio().await
    }

    /// Unmount-equivalent teardown: releases media, link, subscriptions and
    /// the channel. Called at most once; `Drop` falls back to it.
    pub async fn close(&self) {
        self.inner.close().await
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn current_status(&self) -> SessionStatus {
        *self.inner.status_tx.borrow()
    }

    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.inner.connected_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected_tx.borrow()
    }

    pub fn viewer_count(&self) -> u64 {
        *self.inner.viewer_count_tx.borrow()
    }

    pub fn viewer_count_watch(&self) -> watch::Receiver<u64> {
        self.inner.viewer_count_tx.subscribe()
    }

    pub fn playback_url(&self) -> Option<String> {
        self.inner.playback_url.lock().unwrap().clone()
    }

    pub fn streaming_url(&self) -> Option<String> {
        self.inner.streaming_url.lock().unwrap().clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().unwrap().clone()
    }

    /// Remote media watch (viewer side); `None` until a track attaches.
    pub fn remote_stream(&self) -> watch::Receiver<Option<RemoteStream>> {
        self.inner.peers.remote_stream()
    }

    pub fn chat(&self) -> Arc<ChatRoom> {
        self.inner.chat.clone()
    }

    pub fn compositor(&self) -> Option<&Compositor> {
        self.inner.compositor.as_ref()
    }

    /// The outgoing sample-writable track, present once a broadcast started.
    /// The embedder feeds encoded frames into it.
    pub fn local_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.inner.local_track.lock().unwrap().clone()
    }

    /// The handle the broadcaster renders locally and feeds into the peer
    /// link: composed when both sources are live, the single source
    /// otherwise.
    pub fn output_handle(&self) -> Option<Arc<MediaHandle>> {
        self.inner.output.lock().unwrap().clone()
    }

    pub fn stream_key(&self) -> &StreamKey {
        &self.inner.stream_key
    }

    /// This session's signaling channel id, as stamped on outbound envelopes.
    pub fn client_id(&self) -> &ClientId {
        self.inner.channel.client_id()
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Explicit retry hook for a dropped signaling transport.
    pub async fn reconnect(&self) -> Result<(), StudioError> {
        self.inner.channel.reconnect().await
    }

    /// Reads the stream record to decide the pre-stream affordance.
    pub async fn entry_action(&self) -> EntryAction {
        match self
            .inner
            .record
            .get_single_event(&self.inner.stream_key)
            .await
        {
            Ok(record) => record::entry_action(record.as_ref()),
            Err(e) => {
                warn!(error = %e, "failed to read stream record");
                EntryAction::Start
            }
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        // Best effort: finish teardown off-thread so dropping a live session
        // cannot leak capture handles or the peer link.
        let inner = self.inner.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { inner.close().await });
        }
    }
}

async fn dispatch_loop(
    inner: Weak<SessionInner>,
    mut events_rx: mpsc::Receiver<Envelope>,
    mut peer_events: mpsc::Receiver<PeerEvent>,
    mut media_errors: mpsc::Receiver<(Source, String)>,
    mut state_rx: watch::Receiver<ChannelState>,
) {
    loop {
        tokio::select! {
            env = events_rx.recv() => {
                let Some(env) = env else { return };
                let Some(session) = inner.upgrade() else { return };
                session.handle_signal(env).await;
            }
            ev = peer_events.recv() => {
                let Some(ev) = ev else { return };
                let Some(session) = inner.upgrade() else { return };
                session.handle_peer_event(ev).await;
            }
            err = media_errors.recv() => {
                let Some((source, msg)) = err else { return };
                let Some(session) = inner.upgrade() else { return };
                session.handle_media_error(source, msg).await;
            }
            changed = state_rx.changed() => {
                if changed.is_err() { return }
                let state = *state_rx.borrow_and_update();
                let Some(session) = inner.upgrade() else { return };
                session.handle_channel_state(state);
            }
        }
    }
}

impl SessionInner {
    fn note_error(&self, message: impl Into<String>) {
        let message = message.into();
        error!(stream_key = %self.stream_key, error = %message, "session error");
        *self.last_error.lock().unwrap() = Some(message);
    }

    async fn handle_signal(&self, envelope: Envelope) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        match envelope.signal {
            Signal::IceCandidate {
                candidate,
                sender_id,
                ..
            } => {
                if let Err(e) = self.peers.apply_remote_candidate(&candidate, &sender_id).await {
                    self.note_error(e.to_string());
                }
            }
            Signal::Offer { offer, sender_id } => {
                if let Err(e) = self.peers.apply_remote_offer(&offer, &sender_id).await {
                    self.note_error(e.to_string());
                }
            }
            Signal::Answer {
                answer, sender_id, ..
            } => {
                if let Err(e) = self.peers.apply_remote_answer(&answer, &sender_id).await {
                    self.note_error(e.to_string());
                }
            }
            Signal::ViewerCount(count) => {
                // No sequence numbers on this channel: the most recently
                // processed value wins.
                let _ = self.viewer_count_tx.send(count);
            }
            Signal::PlaybackUrl(url) => {
                *self.playback_url.lock().unwrap() = Some(url);
            }
            Signal::StreamingUrl(url) => {
                *self.streaming_url.lock().unwrap() = Some(url);
            }
            Signal::ChatMessage(payload) => {
                self.chat.receive(payload).await;
            }
            other => {
                debug!(kind = other.kind(), "ignoring client-originated signal");
            }
        }
    }

    async fn handle_peer_event(&self, event: PeerEvent) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        match event {
            PeerEvent::RemoteStreamAttached => {
                if self.role == Role::Viewer
                    && *self.status_tx.borrow() == SessionStatus::Connecting
                {
                    let _ = self.status_tx.send(SessionStatus::Live);
                }
            }
            PeerEvent::NegotiationFailed(message) => {
                // Close the failed link so a retry starts clean; the session
                // keeps its lifecycle state.
                self.note_error(message);
                self.peers.close().await;
            }
        }
    }

    async fn handle_media_error(&self, source: Source, message: String) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        // The pipeline already stopped the failed source; the other source
        // keeps going.
        self.note_error(format!("{} recorder: {}", source, message));
    }

    fn handle_channel_state(&self, state: ChannelState) {
        let connected = state == ChannelState::Connected;
        let _ = self.connected_tx.send(connected);
        if !connected && *self.status_tx.borrow() == SessionStatus::Live {
            info!(stream_key = %self.stream_key, "signaling lost while live, holding Live status");
        }
    }

    async fn start_stream(&self, metadata: serde_json::Value) -> Result<(), StudioError> {
        if self.role != Role::Broadcaster {
            warn!("start_stream on a viewer session, ignoring");
            return Ok(());
        }
        if self.stream_key.is_empty() || self.user_id.as_ref().is_empty() {
            return Err(StudioError::Unauthenticated);
        }
        if *self.status_tx.borrow() == SessionStatus::Live {
            debug!("already live");
            return Ok(());
        }
        let _ = self.status_tx.send(SessionStatus::Connecting);

        let mut first_error: Option<StudioError> = None;
        let camera: Option<Arc<MediaHandle>> = match self.capture.acquire_camera().await {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "camera unavailable");
                self.note_error(e.to_string());
                first_error = Some(e);
                None
            }
        };

        // The broadcast continues on the screen source when the camera is out.
        let screen: Option<Arc<MediaHandle>> = if camera.is_none() {
            if self.capture.supports_screen_share() {
                match self.capture.acquire_screen().await {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        warn!(error = %e, "screen unavailable");
                        self.note_error(e.to_string());
                        None
                    }
                }
            } else {
                None
            }
        } else {
            None
        };

        if camera.is_none() && screen.is_none() {
            let _ = self.status_tx.send(SessionStatus::Idle);
            return Err(first_error.unwrap_or(StudioError::PermissionDenied));
        }

        if let (Some(compositor), Some(_)) = (&self.compositor, &camera) {
            compositor.on_camera_acquired(screen.is_some());
        }
        if let Some(handle) = &camera {
            self.media.start_recording(handle.clone()).await;
        }
        if let Some(handle) = &screen {
            self.media.start_recording(handle.clone()).await;
        }
        if let Some(compositor) = &self.compositor {
            *self.output.lock().unwrap() =
                compositor.select_output(camera.as_ref(), screen.as_ref());
        }

        // Outgoing media must be attached before the offer goes out.
        self.peers.setup().await?;
        match self.peers.attach_local_track("video", "video/VP8").await {
            Ok(track) => {
                *self.local_track.lock().unwrap() = Some(track);
            }
            Err(e) => self.note_error(e.to_string()),
        }
        if let Err(e) = self.peers.negotiate().await {
            // The link can be rebuilt and renegotiated; the broadcast itself
            // is not torn down.
            self.note_error(e.to_string());
        }

        if let Err(e) = self
            .channel
            .emit(Signal::StartStream {
                stream_key: self.stream_key.clone(),
                user_id: self.user_id.clone(),
                metadata,
            })
            .await
        {
            self.note_error(e.to_string());
        }

        let url = record::playback_url(&self.media_base_url, &self.stream_key);
        match self
            .record
            .update_event(RecordUpdate {
                event_id: self.stream_key.clone(),
                status: StreamStatus::Live,
                streaming_url: url.clone(),
            })
            .await
        {
            Ok(()) => {
                *self.streaming_url.lock().unwrap() = Some(url);
            }
            Err(e) => self.note_error(format!("stream record update: {}", e)),
        }

        let _ = self.status_tx.send(SessionStatus::Live);
        info!(stream_key = %self.stream_key, "broadcast live");
        Ok(())
    }

    async fn join_stream(&self) -> Result<(), StudioError> {
        if self.role != Role::Viewer {
            warn!("join_stream on a broadcaster session, ignoring");
            return Ok(());
        }
        if self.stream_key.is_empty() {
            return Err(StudioError::Unauthenticated);
        }
        let _ = self.status_tx.send(SessionStatus::Connecting);

        self.channel
            .emit(Signal::JoinStream {
                stream_key: self.stream_key.clone(),
                user_id: self.user_id.clone(),
            })
            .await?;
        self.peers.setup().await?;
        info!(stream_key = %self.stream_key, "joined, waiting for offer");
        Ok(())
    }

    async fn stop_stream(&self) {
        let was = *self.status_tx.borrow();
        if was == SessionStatus::Ended {
            return;
        }
        info!(stream_key = %self.stream_key, "stopping stream");

        self.media.stop().await;
        self.peers.close().await;
        *self.local_track.lock().unwrap() = None;
        *self.output.lock().unwrap() = None;

        // Only a broadcast that actually went out gets announced as ended.
        let announced = was == SessionStatus::Live || was == SessionStatus::Connecting;
        if self.role == Role::Broadcaster && announced {
            if let Err(e) = self
                .channel
                .emit(Signal::EndStream {
                    stream_key: self.stream_key.clone(),
                })
                .await
            {
                debug!(error = %e, "end-stream not delivered");
            }
            let url = record::playback_url(&self.media_base_url, &self.stream_key);
            if let Err(e) = self
                .record
                .update_event(RecordUpdate {
                    event_id: self.stream_key.clone(),
                    status: StreamStatus::Ended,
                    streaming_url: url,
                })
                .await
            {
                self.note_error(format!("stream record update: {}", e));
            }
        }

        let _ = self.status_tx.send(SessionStatus::Ended);
    }

    async fn toggle_screen_share(&self) -> Result<bool, StudioError> {
        if self.role != Role::Broadcaster {
            return Ok(false);
        }
        let screen_live = if self.media.screen_active().await {
            self.media.stop_source(Source::Screen).await;
            if let Some(compositor) = &self.compositor {
                compositor.on_screen_stopped();
            }
            false
        } else {
            if !self.capture.supports_screen_share() {
                return Err(StudioError::UnsupportedPlatform);
            }
            let handle = self.capture.acquire_screen().await?;
            self.media.start_recording(handle).await;
            if let Some(compositor) = &self.compositor {
                if self.media.camera_active().await {
                    compositor.dock_camera(Corner::TopRight);
                }
            }
            true
        };

        // Source set changed: reselect what the broadcaster renders/sends.
        let camera = self.media.camera_handle().await;
        let screen = self.media.screen_handle().await;
        if let Some(compositor) = &self.compositor {
            *self.output.lock().unwrap() =
                compositor.select_output(camera.as_ref(), screen.as_ref());
        }
        Ok(screen_live)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(stream_key = %self.stream_key, "closing session");
        self.stop_stream().await;
        self.subscriptions.lock().unwrap().clear();
        if let Some(task) = self.dispatch.lock().unwrap().take() {
            task.abort();
        }
        self.channel.disconnect().await;
        STUDIO_ACTIVE_SESSIONS.dec();
    }
}
