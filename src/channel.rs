use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::envelope::{Envelope, Signal};
use crate::errors::StudioError;
use crate::id_types::ClientId;
use crate::metrics::STUDIO_SIGNALS_TOTAL;

/// Connection lifecycle of the signaling channel, consumed by the session to
/// flip its connectivity flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connected,
    Disconnected,
}

/// Transport-level duplex of text frames. The channel owns exactly one of
/// these at a time.
pub struct TransportPair {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

/// Opens the transport-level connection. Production uses [`WsConnector`];
/// tests hand the channel a pre-wired in-memory pair.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<TransportPair, StudioError>;
}

/// WebSocket connector over tokio-tungstenite. Two pump tasks bridge the
/// socket halves to the channel's mpsc pair; either half failing closes the
/// inbound side, which the channel observes as a disconnect.
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &str) -> Result<TransportPair, StudioError> {
        let (ws, _) = tokio_tungstenite::connect_async(endpoint).await.map_err(|e| {
            warn!(endpoint = %endpoint, error = %e, "WebSocket connect failed");
            StudioError::ChannelDisconnected
        })?;
        let (mut sink, mut stream) = ws.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
        let (in_tx, in_rx) = mpsc::channel::<String>(64);

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(frame)).await {
                    warn!(error = %e, "WebSocket write failed, closing outbound pump");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {} // ping/pong/binary are transport noise here
                    Err(e) => {
                        warn!(error = %e, "WebSocket read failed");
                        break;
                    }
                }
            }
        });

        Ok(TransportPair {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Builds two linked in-memory transports: frames sent on one end arrive on
/// the other. The second end plays the signaling server in tests.
pub fn memory_pair(buffer: usize) -> (TransportPair, TransportPair) {
    let (a_tx, b_rx) = mpsc::channel(buffer);
    let (b_tx, a_rx) = mpsc::channel(buffer);
    (
        TransportPair {
            outbound: a_tx,
            inbound: a_rx,
        },
        TransportPair {
            outbound: b_tx,
            inbound: b_rx,
        },
    )
}

/// Connector that hands out pre-built transports, one per `connect` call.
pub struct MemoryConnector {
    pairs: Mutex<Vec<TransportPair>>,
    pub connects: AtomicU64,
}

impl MemoryConnector {
    pub fn new(pairs: Vec<TransportPair>) -> Self {
        MemoryConnector {
            pairs: Mutex::new(pairs),
            connects: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, _endpoint: &str) -> Result<TransportPair, StudioError> {
        self.connects.fetch_add(1, Ordering::Relaxed);
        self.pairs
            .lock()
            .await
            .pop()
            .ok_or(StudioError::ChannelDisconnected)
    }
}

type Handler = Arc<dyn Fn(&Envelope) + Send + Sync>;

struct ChannelInner {
    client_id: ClientId,
    endpoint: String,
    connector: Box<dyn Connector>,
    /// Wire name -> registered handlers. Cleared on disconnect so stale
    /// subscriptions become inert.
    handlers: DashMap<String, Vec<(u64, Handler)>>,
    next_handler_id: AtomicU64,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
    state_tx: watch::Sender<ChannelState>,
    closed: AtomicBool,
}

/// Owns the single persistent bidirectional connection to the signaling
/// server. Cheap to clone; all clones share the one connection.
///
/// Delivery order for envelopes emitted by this channel is preserved (one
/// outbound queue, one writer); cross-sender ordering is not guaranteed.
#[derive(Clone)]
pub struct SignalingChannel {
    inner: Arc<ChannelInner>,
}

/// Registration handle returned by [`SignalingChannel::on`]. The handler
/// stays live until the subscription is released (or dropped) or the channel
/// disconnects, whichever comes first.
pub struct Subscription {
    kind: String,
    id: u64,
    channel: Weak<ChannelInner>,
}

impl Subscription {
    pub fn release(&self) {
        if let Some(inner) = self.channel.upgrade() {
            if let Some(mut entry) = inner.handlers.get_mut(&self.kind) {
                entry.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl SignalingChannel {
    pub fn new(client_id: ClientId, endpoint: impl Into<String>, connector: Box<dyn Connector>) -> Self {
        let (state_tx, _) = watch::channel(ChannelState::Idle);
        SignalingChannel {
            inner: Arc::new(ChannelInner {
                client_id,
                endpoint: endpoint.into(),
                connector,
                handlers: DashMap::new(),
                next_handler_id: AtomicU64::new(0),
                outbound: Mutex::new(None),
                reader: Mutex::new(None),
                state_tx,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.inner.client_id
    }

    /// Opens the transport connection. Idempotent: calling again while
    /// connected returns without opening a duplicate socket.
    pub async fn connect(&self) -> Result<(), StudioError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StudioError::ChannelDisconnected);
        }

        let mut outbound = self.inner.outbound.lock().await;
        if let Some(tx) = outbound.as_ref() {
            if !tx.is_closed() {
                debug!(endpoint = %self.inner.endpoint, "connect() while connected, reusing channel");
                return Ok(());
            }
        }

        let pair = self.inner.connector.connect(&self.inner.endpoint).await?;
        *outbound = Some(pair.outbound);
        drop(outbound);

        let inner = Arc::downgrade(&self.inner);
        let mut inbound = pair.inbound;
        let reader = tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                let Some(inner) = inner.upgrade() else { return };
                if inner.closed.load(Ordering::Acquire) {
                    return;
                }
                dispatch(&inner, &frame);
            }
            // Transport gone: surface as a disconnect event. No auto-retry;
            // reconnection policy belongs to the session.
            if let Some(inner) = inner.upgrade() {
                if !inner.closed.load(Ordering::Acquire) {
                    warn!("signaling transport closed, raising disconnect");
                    let _ = inner.state_tx.send(ChannelState::Disconnected);
                }
            }
        });
        *self.inner.reader.lock().await = Some(reader);

        let _ = self.inner.state_tx.send(ChannelState::Connected);
        info!(endpoint = %self.inner.endpoint, client_id = %self.inner.client_id, "signaling channel connected");
        Ok(())
    }

    /// Retry hook: drops the dead transport (if any) and connects again.
    pub async fn reconnect(&self) -> Result<(), StudioError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StudioError::ChannelDisconnected);
        }
        {
            let mut outbound = self.inner.outbound.lock().await;
            *outbound = None;
        }
        if let Some(task) = self.inner.reader.lock().await.take() {
            task.abort();
        }
        self.connect().await
    }

    /// Registers a handler for a named signaling message. The returned
    /// subscription must be held; releasing or dropping it unregisters the
    /// handler.
    pub fn on<F>(&self, kind: &str, handler: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let id = self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .entry(kind.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription {
            kind: kind.to_string(),
            id,
            channel: Arc::downgrade(&self.inner),
        }
    }

    /// Emits a signal with no explicit recipient.
    pub async fn emit(&self, signal: Signal) -> Result<(), StudioError> {
        self.send_envelope(Envelope::new(self.inner.client_id.clone(), signal))
            .await
    }

    /// Emits a signal addressed to a specific recipient (a channel id or the
    /// `viewers` broadcast target).
    pub async fn emit_to(&self, signal: Signal, recipient: impl Into<String>) -> Result<(), StudioError> {
        self.send_envelope(
            Envelope::new(self.inner.client_id.clone(), signal).with_recipient(recipient),
        )
        .await
    }

    async fn send_envelope(&self, envelope: Envelope) -> Result<(), StudioError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StudioError::ChannelDisconnected);
        }
        let frame = envelope
            .encode()
            .map_err(|e| StudioError::SendFailed(e.to_string()))?;

        let tx = {
            let outbound = self.inner.outbound.lock().await;
            outbound.clone().ok_or(StudioError::ChannelDisconnected)?
        };
        tx.send(frame)
            .await
            .map_err(|_| StudioError::ChannelDisconnected)?;
        STUDIO_SIGNALS_TOTAL.with_label_values(&["sent"]).inc();
        Ok(())
    }

    /// Observable connection state for the owning session.
    pub fn state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.state_tx.borrow() == ChannelState::Connected
    }

    /// Tears the channel down. Invoked exactly once by the owning session;
    /// afterwards all registered handlers are inert and emits fail.
    pub async fn disconnect(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            warn!("disconnect() called more than once");
            return;
        }
        self.inner.handlers.clear();
        {
            let mut outbound = self.inner.outbound.lock().await;
            *outbound = None;
        }
        if let Some(task) = self.inner.reader.lock().await.take() {
            task.abort();
        }
        let _ = self.inner.state_tx.send(ChannelState::Disconnected);
        info!(client_id = %self.inner.client_id, "signaling channel disconnected");
    }
}

fn dispatch(inner: &Arc<ChannelInner>, frame: &str) {
    let envelope = match Envelope::decode(frame) {
        Ok(env) => env,
        Err(e) => {
            warn!(error = %e, "dropping undecodable signaling frame");
            return;
        }
    };
    STUDIO_SIGNALS_TOTAL.with_label_values(&["received"]).inc();

    let kind = envelope.signal.kind();
    // Snapshot the handler list so a handler may register/release without
    // deadlocking against the arena.
    let handlers: Vec<Handler> = inner
        .handlers
        .get(kind)
        .map(|entry| entry.iter().map(|(_, h)| h.clone()).collect())
        .unwrap_or_default();
    for handler in handlers {
        handler(&envelope);
    }
}
