//! # Portcullis
//!
//! A persistent, self-healing client for heartbeat-driven
//! JSON-over-WebSocket gateways, speaking the Discord gateway wire
//! protocol.
//!
//! The client maintains a single logical session with the remote server
//! across arbitrarily many underlying WebSocket connections, and exposes
//! three streams to the application: decoded high-level events
//! ([`GatewayClient::dispatch`]), raw inbound payloads
//! ([`GatewayClient::receiver`]) and an outbound sink
//! ([`GatewayClient::sender`]).

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(missing_debug_implementations, missing_docs)]
#![forbid(unsafe_code)]

pub mod gateway;

pub use gateway::{
    AttemptError, Dispatch, DispatchStream, GatewayClient, GatewayPayload, GatewaySender,
    GatewayStateChange, IdentifyOptions, Opcode, PayloadStream, Ready, RetryPolicy, RunError,
};
