//! Gateway wire payload types.

mod stream;
mod types;

pub use stream::{PayloadStreamError, PayloadStreamSink, WsConnection};
pub use types::{Hello, Identify, IdentifyProperties, Resume};

use bytes::Bytes;
use miniz_oxide::inflate::{self, TINFLStatus};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

/// Error when parse binary data as a gateway payload
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(super)), module(error), context(suffix(false)))]
pub enum DecodeError {
    /// decompress frame data failed
    #[snafu(display("decompress frame failed: {status:?}"))]
    DecompressFailed {
        /// decompress error status code
        status: TINFLStatus,
    },

    /// frame data is invalid json
    #[snafu(display("parse frame json failed: {source}"))]
    ParseJSONFailed {
        /// source error
        source: serde_json::Error,
    },

    /// payload json has no numeric op field
    #[snafu(display("payload has no numeric op field: {json}"))]
    NoOpcode {
        /// json string
        json: String,
    },

    /// payload op field is not a known opcode
    #[snafu(display("payload has unknown opcode {op}"))]
    UnknownOpcode {
        /// opcode number
        op: u64,
    },
}

/// Error for an op integer outside the known opcode table
#[derive(Debug, Snafu)]
#[snafu(
    display("unknown gateway opcode {value}"),
    module(unknown_opcode),
    context(suffix(false))
)]
pub struct UnknownOpcodeError {
    /// the rejected integer
    pub value: u8,
}

/// Gateway payload opcodes, with the reference wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Opcode {
    /// an event dispatch, server -> client
    Dispatch,
    /// heartbeat, bidirectional
    Heartbeat,
    /// new-session handshake, client -> server
    Identify,
    /// presence update, client -> server
    StatusUpdate,
    /// voice state update, client -> server
    VoiceStateUpdate,
    /// resume an existing session, client -> server
    Resume,
    /// server requests a reconnect, server -> client
    Reconnect,
    /// request guild members chunk, client -> server
    RequestGuildMembers,
    /// session is invalid, server -> client
    InvalidSession,
    /// first message of a connection, server -> client
    Hello,
    /// heartbeat acknowledgement, server -> client
    HeartbeatAck,
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> Self {
        match op {
            Opcode::Dispatch => 0,
            Opcode::Heartbeat => 1,
            Opcode::Identify => 2,
            Opcode::StatusUpdate => 3,
            Opcode::VoiceStateUpdate => 4,
            Opcode::Resume => 6,
            Opcode::Reconnect => 7,
            Opcode::RequestGuildMembers => 8,
            Opcode::InvalidSession => 9,
            Opcode::Hello => 10,
            Opcode::HeartbeatAck => 11,
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = UnknownOpcodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Dispatch),
            1 => Ok(Self::Heartbeat),
            2 => Ok(Self::Identify),
            3 => Ok(Self::StatusUpdate),
            4 => Ok(Self::VoiceStateUpdate),
            6 => Ok(Self::Resume),
            7 => Ok(Self::Reconnect),
            8 => Ok(Self::RequestGuildMembers),
            9 => Ok(Self::InvalidSession),
            10 => Ok(Self::Hello),
            11 => Ok(Self::HeartbeatAck),
            _ => unknown_opcode::UnknownOpcode { value }.fail(),
        }
    }
}

/// Gateway payload envelope.
///
/// Wire form is `{"op": <int>, "d": <any>, "s": <int|null>, "t": <string|null>}`.
/// Only [`Opcode::Dispatch`] payloads carry a sequence and an event name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayPayload {
    /// payload opcode
    pub op: Opcode,
    /// opcode-dependent body
    #[serde(default)]
    pub d: Option<serde_json::Value>,
    /// sequence number, dispatch payloads only
    #[serde(default)]
    pub s: Option<i64>,
    /// event name, dispatch payloads only
    #[serde(default)]
    pub t: Option<String>,
}

impl GatewayPayload {
    /// Decode data to a payload.
    ///
    /// The `compressed` argument controls if the data is inflated as
    /// zlib before parsing.
    pub fn decode(mut buff: Bytes, compressed: bool) -> Result<Self, DecodeError> {
        if compressed {
            buff = inflate::decompress_to_vec_zlib(&buff)
                .map_err(|e| DecodeError::DecompressFailed { status: e.status })?
                .into();
        }

        let value: serde_json::Value =
            serde_json::from_slice(&buff).context(error::ParseJSONFailed)?;

        let op = value
            .get("op")
            .and_then(serde_json::Value::as_u64)
            .with_context(|| error::NoOpcode {
                json: String::from_utf8_lossy(&buff),
            })?;

        let narrowed = u8::try_from(op).ok().context(error::UnknownOpcode { op })?;
        ensure!(Opcode::try_from(narrowed).is_ok(), error::UnknownOpcode { op });

        serde_json::from_value(value).context(error::ParseJSONFailed)
    }

    /// Encode the payload as a JSON string.
    pub fn encode(&self) -> String {
        // The envelope has string keys only, so serialization cannot fail.
        serde_json::to_string(self).unwrap()
    }

    /// Build a heartbeat payload carrying the current sequence, or null.
    pub fn heartbeat(sequence: Option<i64>) -> Self {
        Self {
            op: Opcode::Heartbeat,
            d: sequence.map(serde_json::Value::from),
            s: None,
            t: None,
        }
    }

    /// Build an identify payload.
    pub fn identify(identify: &Identify) -> Self {
        Self {
            op: Opcode::Identify,
            d: Some(serde_json::to_value(identify).unwrap()),
            s: None,
            t: None,
        }
    }

    /// Build a resume payload.
    pub fn resume(resume: &Resume) -> Self {
        Self {
            op: Opcode::Resume,
            d: Some(serde_json::to_value(resume).unwrap()),
            s: None,
            t: None,
        }
    }

    /// Build a bodyless reconnect payload.
    ///
    /// Injected into the outbound stream by
    /// [`GatewayClient::close`](crate::GatewayClient::close) to request a
    /// fresh connection.
    pub fn reconnect() -> Self {
        Self {
            op: Opcode::Reconnect,
            d: None,
            s: None,
            t: None,
        }
    }
}
