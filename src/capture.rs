use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::channel::SignalingChannel;
use crate::envelope::{Signal, Source, StreamChunk};
use crate::errors::StudioError;
use crate::id_types::StreamKey;
use crate::metrics::{STUDIO_CHUNKS_DISCARDED_TOTAL, STUDIO_CHUNKS_EMITTED_TOTAL};

/// Chunks above this size are malformed encoder output, not media.
const MAX_CHUNK_BYTES: usize = 16 * 1024 * 1024;

/// Container produced by the platform encoder.
pub const WEBM_MIME_TYPE: &str = "video/webm;codecs=vp8,opus";

pub(crate) fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Encoder output delivered by a platform media handle on its segmentation
/// cadence.
#[derive(Debug)]
pub enum SegmentEvent {
    Data(Bytes),
    Error(String),
}

/// A live capture acquired from the platform. Track-enabled flags can be
/// flipped without renegotiation; `deactivate()` releases the capture.
pub struct MediaHandle {
    pub id: String,
    pub source: Source,
    active: AtomicBool,
    video_enabled: AtomicBool,
    audio_enabled: AtomicBool,
    segments: Mutex<Option<mpsc::Receiver<SegmentEvent>>>,
}

impl MediaHandle {
    pub fn new(source: Source, segments: mpsc::Receiver<SegmentEvent>) -> Arc<Self> {
        Arc::new(MediaHandle {
            id: uuid::Uuid::new_v4().to_string(),
            source,
            active: AtomicBool::new(true),
            video_enabled: AtomicBool::new(true),
            audio_enabled: AtomicBool::new(true),
            segments: Mutex::new(Some(segments)),
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stops the underlying tracks. Data still queued for this handle is
    /// stale and must not be relayed.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled.load(Ordering::Acquire)
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::Acquire)
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.video_enabled.store(enabled, Ordering::Release);
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        self.audio_enabled.store(enabled, Ordering::Release);
    }

    async fn take_segments(&self) -> Option<mpsc::Receiver<SegmentEvent>> {
        self.segments.lock().await.take()
    }
}

/// Platform capture capability. The core only depends on this interface;
/// targets implement it over their native camera/screen APIs.
#[async_trait]
pub trait CaptureProvider: Send + Sync {
    async fn acquire_camera(&self) -> Result<Arc<MediaHandle>, StudioError>;
    async fn acquire_screen(&self) -> Result<Arc<MediaHandle>, StudioError>;
    fn supports_screen_share(&self) -> bool;
}

/// Per-source staging area for recorded chunks. Drained atomically on every
/// flush; chunks within one flush are contiguous and sequenced from 0.
pub struct ChunkBuffer {
    source: Source,
    chunks: Vec<Bytes>,
    timestamp: u64,
    mime_type: String,
}

impl ChunkBuffer {
    pub fn new(source: Source, mime_type: impl Into<String>) -> Self {
        ChunkBuffer {
            source,
            chunks: Vec::new(),
            timestamp: epoch_ms(),
            mime_type: mime_type.into(),
        }
    }

    pub fn source(&self) -> Source {
        self.source
    }

    pub fn append(&mut self, chunk: Bytes) {
        self.chunks.push(chunk);
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Empties the buffer, returning the batch and its timestamp, and starts
    /// a fresh batch stamped now.
    pub fn drain_all(&mut self) -> (Vec<Bytes>, u64) {
        let batch = std::mem::take(&mut self.chunks);
        let timestamp = self.timestamp;
        self.timestamp = epoch_ms();
        (batch, timestamp)
    }
}

struct ActiveSource {
    handle: Arc<MediaHandle>,
    buffer: Arc<Mutex<ChunkBuffer>>,
    task: tokio::task::JoinHandle<()>,
}

/// Records acquired media into per-source chunk buffers and relays them as
/// `stream-data` envelopes. Camera and screen never share a sequence space.
pub struct MediaPipeline {
    stream_key: StreamKey,
    channel: SignalingChannel,
    camera: Mutex<Option<ActiveSource>>,
    screen: Mutex<Option<ActiveSource>>,
    errors_tx: mpsc::Sender<(Source, String)>,
}

impl MediaPipeline {
    pub fn new(
        stream_key: StreamKey,
        channel: SignalingChannel,
    ) -> (Arc<Self>, mpsc::Receiver<(Source, String)>) {
        let (errors_tx, errors_rx) = mpsc::channel(8);
        (
            Arc::new(MediaPipeline {
                stream_key,
                channel,
                camera: Mutex::new(None),
                screen: Mutex::new(None),
                errors_tx,
            }),
            errors_rx,
        )
    }

    fn slot(&self, source: Source) -> &Mutex<Option<ActiveSource>> {
        match source {
            Source::Camera => &self.camera,
            Source::Screen => &self.screen,
        }
    }

    /// Begins timed segmentation of the handle into its source's buffer.
    /// Each delivered segment drives a flush cycle.
    pub async fn start_recording(self: &Arc<Self>, handle: Arc<MediaHandle>) {
        let source = handle.source;
        let Some(mut segments) = handle.take_segments().await else {
            warn!(source = %source, "handle already recording, ignoring");
            return;
        };

        // Replace any prior recording for this source.
        self.stop_source(source).await;

        let buffer = Arc::new(Mutex::new(ChunkBuffer::new(source, WEBM_MIME_TYPE)));
        let pipeline = self.clone();
        let task_handle = handle.clone();
        let task_buffer = buffer.clone();
        let errors_tx = self.errors_tx.clone();
        let task = tokio::spawn(async move {
            info!(source = %source, handle = %task_handle.id, "recorder started");
            while let Some(event) = segments.recv().await {
                if !task_handle.is_active() {
                    debug!(source = %source, "handle deactivated, recorder exiting");
                    break;
                }
                match event {
                    SegmentEvent::Data(chunk) => {
                        if chunk.is_empty() {
                            continue;
                        }
                        task_buffer.lock().await.append(chunk);
                        // Flush cadence is driven by the segmentation callback.
                        pipeline.flush().await;
                    }
                    SegmentEvent::Error(msg) => {
                        // Fatal to this source only; the other pipeline keeps going.
                        error!(source = %source, error = %msg, "recorder error");
                        task_handle.deactivate();
                        task_buffer.lock().await.drain_all();
                        let _ = errors_tx.send((source, msg)).await;
                        break;
                    }
                }
            }
            debug!(source = %source, "recorder exiting");
        });

        *self.slot(source).lock().await = Some(ActiveSource {
            handle,
            buffer,
            task,
        });
    }

    /// Emits every buffered chunk of each live source as an ordered batch,
    /// then clears that buffer. Buffers of inactive handles are discarded
    /// without emission; with the channel down, buffers keep accumulating
    /// until the next flush after reconnect.
    pub async fn flush(&self) {
        self.flush_slot(Source::Camera).await;
        self.flush_slot(Source::Screen).await;
    }

    async fn flush_slot(&self, source: Source) {
        let Some((handle, buffer)) = self
            .slot(source)
            .lock()
            .await
            .as_ref()
            .map(|s| (s.handle.clone(), s.buffer.clone()))
        else {
            return;
        };

        let mut buf = buffer.lock().await;
        if buf.is_empty() {
            return;
        }
        if !handle.is_active() {
            let (dropped, _) = buf.drain_all();
            STUDIO_CHUNKS_DISCARDED_TOTAL
                .with_label_values(&["inactive_source"])
                .inc_by(dropped.len() as u64);
            warn!(source = %source, dropped = dropped.len(), "discarding chunks from inactive source");
            return;
        }
        if !self.channel.is_connected() {
            debug!(source = %source, buffered = buf.len(), "channel down, holding chunks");
            return;
        }

        let mime_type = buf.mime_type.clone();
        let (chunks, timestamp) = buf.drain_all();
        drop(buf);

        let chunks: Vec<Bytes> = chunks
            .into_iter()
            .filter(|c| {
                if c.len() > MAX_CHUNK_BYTES {
                    STUDIO_CHUNKS_DISCARDED_TOTAL
                        .with_label_values(&["oversized"])
                        .inc();
                    warn!(source = %source, size = c.len(), "chunk exceeds maximum allowed size, skipping");
                    false
                } else {
                    true
                }
            })
            .collect();

        let source_label = source.to_string();
        let total = chunks.len();
        for (index, chunk) in chunks.into_iter().enumerate() {
            let data = StreamChunk {
                stream_key: self.stream_key.clone(),
                chunk,
                is_camera: source == Source::Camera,
                timestamp,
                sequence: index as u64,
                mime_type: mime_type.clone(),
                is_last_chunk: index + 1 == total,
                sender_id: self.channel.client_id().clone(),
            };
            if let Err(e) = self.channel.emit(Signal::StreamData(data)).await {
                STUDIO_CHUNKS_DISCARDED_TOTAL
                    .with_label_values(&["channel_closed"])
                    .inc_by((total - index) as u64);
                warn!(source = %source, error = %e, "channel refused chunk batch");
                return;
            }
            STUDIO_CHUNKS_EMITTED_TOTAL
                .with_label_values(&[source_label.as_str()])
                .inc();
        }
    }

    /// Stops one source: recorder task ends, unflushed chunks are discarded,
    /// the handle is released. Safe when the source is not recording.
    pub async fn stop_source(&self, source: Source) {
        let taken = self.slot(source).lock().await.take();
        if let Some(active) = taken {
            info!(source = %source, handle = %active.handle.id, "stopping source");
            active.handle.deactivate();
            active.buffer.lock().await.drain_all();
            active.task.abort();
        }
    }

    /// Stops all recorders and releases all handles. Safe to call multiple
    /// times and from a torn-down session.
    pub async fn stop(&self) {
        self.stop_source(Source::Camera).await;
        self.stop_source(Source::Screen).await;
    }

    pub async fn camera_active(&self) -> bool {
        self.camera
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| s.handle.is_active())
    }

    pub async fn screen_active(&self) -> bool {
        self.screen
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| s.handle.is_active())
    }

    pub async fn camera_handle(&self) -> Option<Arc<MediaHandle>> {
        self.camera.lock().await.as_ref().map(|s| s.handle.clone())
    }

    pub async fn screen_handle(&self) -> Option<Arc<MediaHandle>> {
        self.screen.lock().await.as_ref().map(|s| s.handle.clone())
    }

    /// Flips the camera's video tracks without stopping capture or
    /// renegotiating. Returns the new state, or None without a camera.
    pub async fn toggle_video(&self) -> Option<bool> {
        let handle = self.camera_handle().await?;
        let next = !handle.video_enabled();
        handle.set_video_enabled(next);
        Some(next)
    }

    /// Flips the camera's audio tracks; same contract as `toggle_video`.
    pub async fn toggle_audio(&self) -> Option<bool> {
        let handle = self.camera_handle().await?;
        let next = !handle.audio_enabled();
        handle.set_audio_enabled(next);
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{memory_pair, MemoryConnector, TransportPair};
    use crate::envelope::Envelope;
    use crate::id_types::ClientId;

    fn test_pipeline() -> (
        Arc<MediaPipeline>,
        mpsc::Receiver<(Source, String)>,
        SignalingChannel,
        TransportPair,
    ) {
        let (client_end, server_end) = memory_pair(64);
        let channel = SignalingChannel::new(
            ClientId::from("caster"),
            "memory://test",
            Box::new(MemoryConnector::new(vec![client_end])),
        );
        let (pipeline, errors) = MediaPipeline::new(StreamKey::from("abc"), channel.clone());
        (pipeline, errors, channel, server_end)
    }

    fn handle_with_feed(source: Source) -> (Arc<MediaHandle>, mpsc::Sender<SegmentEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (MediaHandle::new(source, rx), tx)
    }

    async fn recv_chunks(server_end: &mut TransportPair, n: usize) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        for _ in 0..n {
            let frame = tokio::time::timeout(
                tokio::time::Duration::from_millis(500),
                server_end.inbound.recv(),
            )
            .await
            .expect("timed out waiting for chunk")
            .expect("transport closed");
            match Envelope::decode(&frame).unwrap().signal {
                Signal::StreamData(chunk) => out.push(chunk),
                other => panic!("unexpected signal: {:?}", other),
            }
        }
        out
    }

    #[test]
    fn test_chunk_buffer_drain_resets_batch() {
        let mut buffer = ChunkBuffer::new(Source::Camera, WEBM_MIME_TYPE);
        buffer.append(Bytes::from_static(b"a"));
        buffer.append(Bytes::from_static(b"b"));
        assert_eq!(buffer.len(), 2);

        let (batch, _ts) = buffer.drain_all();
        assert_eq!(batch.len(), 2);
        assert!(buffer.is_empty());

        let (empty, _) = buffer.drain_all();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_flush_emits_contiguous_batch_with_single_last_marker() {
        let (pipeline, _errors, channel, mut server_end) = test_pipeline();
        let (handle, feed) = handle_with_feed(Source::Camera);
        pipeline.start_recording(handle).await;

        // Channel still down: segments accumulate instead of flushing.
        for data in [&b"one"[..], b"two", b"three"] {
            feed.send(SegmentEvent::Data(Bytes::copy_from_slice(data)))
                .await
                .unwrap();
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        channel.connect().await.unwrap();
        feed.send(SegmentEvent::Data(Bytes::from_static(b"four")))
            .await
            .unwrap();

        let chunks = recv_chunks(&mut server_end, 4).await;
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.sequence, i as u64);
            assert!(chunk.is_camera);
            assert_eq!(chunk.timestamp, chunks[0].timestamp);
            assert_eq!(chunk.is_last_chunk, i == 3);
        }
    }

    #[tokio::test]
    async fn test_camera_and_screen_never_share_a_sequence_space() {
        let (pipeline, _errors, channel, mut server_end) = test_pipeline();
        let (camera, camera_feed) = handle_with_feed(Source::Camera);
        let (screen, screen_feed) = handle_with_feed(Source::Screen);
        pipeline.start_recording(camera).await;
        pipeline.start_recording(screen).await;

        // Two camera segments accumulate while the channel is down; one
        // screen segment does too.
        camera_feed
            .send(SegmentEvent::Data(Bytes::from_static(b"c0")))
            .await
            .unwrap();
        camera_feed
            .send(SegmentEvent::Data(Bytes::from_static(b"c1")))
            .await
            .unwrap();
        screen_feed
            .send(SegmentEvent::Data(Bytes::from_static(b"s0")))
            .await
            .unwrap();
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        channel.connect().await.unwrap();
        camera_feed
            .send(SegmentEvent::Data(Bytes::from_static(b"c2")))
            .await
            .unwrap();

        let chunks = recv_chunks(&mut server_end, 4).await;
        let camera_seqs: Vec<u64> = chunks
            .iter()
            .filter(|c| c.is_camera)
            .map(|c| c.sequence)
            .collect();
        let screen_seqs: Vec<u64> = chunks
            .iter()
            .filter(|c| !c.is_camera)
            .map(|c| c.sequence)
            .collect();
        // Each source sequences its own batch from 0.
        assert_eq!(camera_seqs, vec![0, 1, 2]);
        assert_eq!(screen_seqs, vec![0]);
    }

    #[tokio::test]
    async fn test_inactive_source_buffer_is_discarded_without_emission() {
        let (pipeline, _errors, channel, mut server_end) = test_pipeline();
        let (handle, feed) = handle_with_feed(Source::Camera);
        pipeline.start_recording(handle.clone()).await;

        feed.send(SegmentEvent::Data(Bytes::from_static(b"stale")))
            .await
            .unwrap();
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        handle.deactivate();
        channel.connect().await.unwrap();
        pipeline.flush().await;

        let got = tokio::time::timeout(
            tokio::time::Duration::from_millis(100),
            server_end.inbound.recv(),
        )
        .await;
        assert!(got.is_err(), "stale chunks must not be emitted");
    }

    #[tokio::test]
    async fn test_recorder_error_is_fatal_to_that_source_only() {
        let (pipeline, mut errors, _channel, _server_end) = test_pipeline();
        let (camera, camera_feed) = handle_with_feed(Source::Camera);
        let (screen, _screen_feed) = handle_with_feed(Source::Screen);
        pipeline.start_recording(camera).await;
        pipeline.start_recording(screen).await;

        camera_feed
            .send(SegmentEvent::Error("encoder died".to_string()))
            .await
            .unwrap();

        let (source, msg) = errors.recv().await.unwrap();
        assert_eq!(source, Source::Camera);
        assert_eq!(msg, "encoder died");

        assert!(!pipeline.camera_active().await);
        assert!(pipeline.screen_active().await);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_releases_handles() {
        let (pipeline, _errors, _channel, _server_end) = test_pipeline();
        let (camera, _camera_feed) = handle_with_feed(Source::Camera);
        let camera_ref = camera.clone();
        pipeline.start_recording(camera).await;

        pipeline.stop().await;
        pipeline.stop().await;

        assert!(!camera_ref.is_active());
        assert!(!pipeline.camera_active().await);
        assert!(!pipeline.screen_active().await);
    }

    #[tokio::test]
    async fn test_toggles_flip_flags_without_stopping_capture() {
        let (pipeline, _errors, _channel, _server_end) = test_pipeline();
        let (camera, _feed) = handle_with_feed(Source::Camera);
        let camera_ref = camera.clone();
        pipeline.start_recording(camera).await;

        assert_eq!(pipeline.toggle_video().await, Some(false));
        assert_eq!(pipeline.toggle_video().await, Some(true));
        assert_eq!(pipeline.toggle_audio().await, Some(false));
        assert!(camera_ref.is_active());
    }

    #[tokio::test]
    async fn test_toggles_without_camera_return_none() {
        let (pipeline, _errors, _channel, _server_end) = test_pipeline();
        assert_eq!(pipeline.toggle_video().await, None);
        assert_eq!(pipeline.toggle_audio().await, None);
    }

    #[tokio::test]
    async fn test_oversized_chunk_is_skipped() {
        let (pipeline, _errors, channel, mut server_end) = test_pipeline();
        channel.connect().await.unwrap();
        let (handle, feed) = handle_with_feed(Source::Camera);
        pipeline.start_recording(handle).await;

        feed.send(SegmentEvent::Data(Bytes::from(vec![0u8; MAX_CHUNK_BYTES + 1])))
            .await
            .unwrap();
        feed.send(SegmentEvent::Data(Bytes::from_static(b"ok")))
            .await
            .unwrap();

        let chunks = recv_chunks(&mut server_end, 1).await;
        assert_eq!(chunks[0].chunk.as_ref(), b"ok");
        assert_eq!(chunks[0].sequence, 0);
    }
}
