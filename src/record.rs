use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::id_types::StreamKey;

/// Lifecycle value persisted on the external stream record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Live,
    Ended,
}

/// The externally stored stream record, read back before entering a studio.
#[derive(Debug, Clone)]
pub struct StreamRecord {
    pub event_id: StreamKey,
    pub status: StreamStatus,
    pub streaming_url: Option<String>,
}

/// Fields written on start/stop.
#[derive(Debug, Clone)]
pub struct RecordUpdate {
    pub event_id: StreamKey,
    pub status: StreamStatus,
    pub streaming_url: String,
}

/// The stream-record collaborator. The core only reads and writes this one
/// record; publishing anything else is out of scope.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn update_event(&self, update: RecordUpdate) -> anyhow::Result<()>;
    async fn get_single_event(&self, event_id: &StreamKey) -> anyhow::Result<Option<StreamRecord>>;
}

/// Affordance shown before entering the studio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryAction {
    /// No record yet, or the stream already ran: enter without re-announcing.
    Proceed,
    /// Announce the stream as live on the way in.
    Start,
}

pub fn entry_action(record: Option<&StreamRecord>) -> EntryAction {
    match record {
        Some(record) if record.status == StreamStatus::Ended => EntryAction::Proceed,
        _ => EntryAction::Start,
    }
}

/// The backing media server is addressed only by convention; the core never
/// speaks to it, it only constructs and persists this URL.
pub fn playback_url(base_url: &str, stream_key: &StreamKey) -> String {
    format!(
        "{}/livestream/{}/stream.m3u8",
        base_url.trim_end_matches('/'),
        stream_key
    )
}

/// In-memory record store for tests and local development.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: DashMap<StreamKey, StreamRecord>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn update_event(&self, update: RecordUpdate) -> anyhow::Result<()> {
        self.records.insert(
            update.event_id.clone(),
            StreamRecord {
                event_id: update.event_id,
                status: update.status,
                streaming_url: Some(update.streaming_url),
            },
        );
        Ok(())
    }

    async fn get_single_event(&self, event_id: &StreamKey) -> anyhow::Result<Option<StreamRecord>> {
        Ok(self.records.get(event_id).map(|r| r.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_playback_url_convention() {
        let key = StreamKey::from("abc");
        assert_eq!(
            playback_url("https://media.example.com", &key),
            "https://media.example.com/livestream/abc/stream.m3u8"
        );
        // A trailing slash must not double up.
        assert_eq!(
            playback_url("https://media.example.com/", &key),
            "https://media.example.com/livestream/abc/stream.m3u8"
        );
    }

    #[test]
    fn test_entry_action() {
        assert_eq!(entry_action(None), EntryAction::Start);

        let live = StreamRecord {
            event_id: StreamKey::from("abc"),
            status: StreamStatus::Live,
            streaming_url: None,
        };
        assert_eq!(entry_action(Some(&live)), EntryAction::Start);

        let ended = StreamRecord {
            status: StreamStatus::Ended,
            ..live
        };
        assert_eq!(entry_action(Some(&ended)), EntryAction::Proceed);
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryRecordStore::new();
        let key = StreamKey::from("abc");

        assert!(store.get_single_event(&key).await.unwrap().is_none());

        store
            .update_event(RecordUpdate {
                event_id: key.clone(),
                status: StreamStatus::Live,
                streaming_url: playback_url("https://media.test", &key),
            })
            .await
            .unwrap();

        let record = store.get_single_event(&key).await.unwrap().unwrap();
        assert_eq!(record.status, StreamStatus::Live);
        assert_eq!(
            record.streaming_url.as_deref(),
            Some("https://media.test/livestream/abc/stream.m3u8")
        );
    }
}
