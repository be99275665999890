//! Handshake configuration.

use super::payload::{Identify, IdentifyProperties, Resume};

/// Configuration for the identify/resume handshake.
#[derive(Debug, Clone)]
pub struct IdentifyOptions {
    /// authentication token
    pub token: String,
    /// shard `[index, count]` pair, unsharded when absent
    pub shard: Option<[u64; 2]>,
    /// initial presence sent with the identify payload
    pub presence: Option<serde_json::Value>,
    /// member count threshold before a guild is considered large
    pub large_threshold: u32,
    /// connection properties reported to the server
    pub properties: IdentifyProperties,
    /// session id to resume on the first connection
    pub resume_session_id: Option<String>,
    /// sequence to resume from on the first connection
    pub resume_sequence: Option<i64>,
}

impl IdentifyOptions {
    /// Create options with the given token and defaults for the rest.
    pub fn new<S: AsRef<str> + ?Sized>(token: &S) -> Self {
        Self {
            token: token.as_ref().to_string(),
            shard: None,
            presence: None,
            large_threshold: 250,
            properties: IdentifyProperties::default(),
            resume_session_id: None,
            resume_sequence: None,
        }
    }

    /// Set the shard pair.
    pub fn with_shard(mut self, index: u64, count: u64) -> Self {
        self.shard = Some([index, count]);
        self
    }

    /// Set the initial presence.
    pub fn with_presence(mut self, presence: serde_json::Value) -> Self {
        self.presence = Some(presence);
        self
    }

    /// Seed the client with a session to resume on its first connection.
    pub fn with_resume<S: AsRef<str> + ?Sized>(mut self, session_id: &S, sequence: i64) -> Self {
        self.resume_session_id = Some(session_id.as_ref().to_string());
        self.resume_sequence = Some(sequence);
        self
    }

    pub(crate) fn to_identify(&self) -> Identify {
        Identify {
            token: self.token.clone(),
            properties: self.properties.clone(),
            compress: false,
            large_threshold: self.large_threshold,
            shard: self.shard,
            presence: self.presence.clone(),
        }
    }

    pub(crate) fn to_resume(&self, session_id: String, seq: i64) -> Resume {
        Resume {
            token: self.token.clone(),
            session_id,
            seq,
        }
    }
}
