use serde::{Deserialize, Serialize};

/// Hello payload data, the first message of every connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    /// heartbeat interval in milliseconds, always positive
    pub heartbeat_interval: u64,
}

/// Connection properties sent inside an identify payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyProperties {
    /// operating system name
    pub os: String,
    /// library name reported as the browser
    pub browser: String,
    /// library name reported as the device
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

/// Identify payload data, the new-session handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identify {
    /// authentication token
    pub token: String,
    /// connection properties
    pub properties: IdentifyProperties,
    /// whether the server may compress transport frames
    pub compress: bool,
    /// member count threshold before a guild is considered large
    pub large_threshold: u32,
    /// shard `[index, count]` pair
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<[u64; 2]>,
    /// initial presence
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<serde_json::Value>,
}

/// Resume payload data, reattaching to an existing session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resume {
    /// authentication token
    pub token: String,
    /// session to reattach to
    pub session_id: String,
    /// last sequence observed before the disconnect
    pub seq: i64,
}
