use dashmap::DashSet;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::capture::epoch_ms;
use crate::channel::SignalingChannel;
use crate::envelope::{ChatPayload, ReplyRef, Signal};
use crate::errors::StudioError;
use crate::id_types::{StreamKey, UserId};
use crate::metrics::STUDIO_CHAT_MESSAGES_TOTAL;

/// A chat message as kept in the room's local list.
pub type ChatMessage = ChatPayload;

/// Threaded text messaging scoped to one stream key, riding the signaling
/// channel. Lifecycle is independent from the media pipeline.
pub struct ChatRoom {
    stream_key: StreamKey,
    sender: UserId,
    channel: SignalingChannel,
    messages: Mutex<Vec<ChatMessage>>,
    seen: DashSet<String>,
}

impl ChatRoom {
    pub fn new(stream_key: StreamKey, sender: UserId, channel: SignalingChannel) -> Self {
        ChatRoom {
            stream_key,
            sender,
            channel,
            messages: Mutex::new(Vec::new()),
            seen: DashSet::new(),
        }
    }

    /// Sends a message, optionally as a reply. The local list is only
    /// mutated once the channel accepts the frame; a failed send leaves
    /// local state untouched.
    pub async fn send_message(
        &self,
        content: &str,
        reply_to: Option<ReplyRef>,
    ) -> Result<ChatMessage, StudioError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(StudioError::SendFailed("empty message".to_string()));
        }
        if self.sender.as_ref().is_empty() {
            return Err(StudioError::Unauthenticated);
        }
        if let Some(reply) = &reply_to {
            // A reply target must already exist in the local message list.
            if !self.seen.contains(&reply.id) {
                return Err(StudioError::SendFailed(format!(
                    "reply target {} not found",
                    reply.id
                )));
            }
        }

        let message = ChatPayload {
            id: uuid::Uuid::new_v4().to_string(),
            stream_key: self.stream_key.clone(),
            pubkey: self.sender.clone(),
            content: content.to_string(),
            created_at: epoch_ms(),
            reply_to,
        };

        self.channel
            .emit(Signal::ChatMessage(message.clone()))
            .await?;
        STUDIO_CHAT_MESSAGES_TOTAL.with_label_values(&["sent"]).inc();

        self.seen.insert(message.id.clone());
        self.messages.lock().await.push(message.clone());
        info!(stream_key = %self.stream_key, id = %message.id, "chat message sent");
        Ok(message)
    }

    /// Appends an inbound message. Messages for another stream key are
    /// ignored; duplicate ids are deduplicated.
    pub async fn receive(&self, message: ChatPayload) {
        if message.stream_key != self.stream_key {
            debug!(
                got = %message.stream_key,
                expected = %self.stream_key,
                "dropping chat message for another stream"
            );
            return;
        }
        if !self.seen.insert(message.id.clone()) {
            debug!(id = %message.id, "duplicate chat message");
            return;
        }
        STUDIO_CHAT_MESSAGES_TOTAL
            .with_label_values(&["received"])
            .inc();
        self.messages.lock().await.push(message);
    }

    /// Messages in chronological order (oldest first). Displays wanting
    /// newest-first reverse this.
    pub async fn messages(&self) -> Vec<ChatMessage> {
        let mut list = self.messages.lock().await.clone();
        list.sort_by_key(|m| m.created_at);
        list
    }

    pub async fn len(&self) -> usize {
        self.messages.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.lock().await.is_empty()
    }
}
