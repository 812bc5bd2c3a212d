use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A strongly typed identifier for a stream.
/// Wraps an `Arc<String>` for cheap cloning. This is the durable key shared
/// with the external stream record; it never changes for the life of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamKey(pub Arc<String>);

/// A strongly typed identifier for a user (the sender identity on chat and
/// stream metadata). Wraps an `Arc<String>` for cheap cloning.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Arc<String>);

/// A strongly typed identifier for a signaling channel endpoint.
/// Assigned per connection; used to filter self-echoed envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub Arc<String>);

// Implement Display for easy logging
impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Implement conversion from String/&str
impl From<String> for StreamKey {
    fn from(s: String) -> Self {
        StreamKey(Arc::new(s))
    }
}

impl From<&str> for StreamKey {
    fn from(s: &str) -> Self {
        StreamKey(Arc::new(s.to_string()))
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        UserId(Arc::new(s))
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        UserId(Arc::new(s.to_string()))
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        ClientId(Arc::new(s))
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        ClientId(Arc::new(s.to_string()))
    }
}

// Helper for referencing the inner string
impl AsRef<str> for StreamKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for UserId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ClientId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl StreamKey {
    /// A stream key with no content cannot authorize a broadcast.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl ClientId {
    /// Generates a fresh channel id for a new connection.
    pub fn generate() -> Self {
        ClientId(Arc::new(uuid::Uuid::new_v4().to_string()))
    }
}
