//! Per-opcode handling of inbound payloads.

use tokio::sync::broadcast;

use super::dispatch::{Dispatch, GatewayStateChange, Ready};
use super::heartbeat::HeartbeatTimer;
use super::options::IdentifyOptions;
use super::payload::{GatewayPayload, Hello, Opcode};
use super::retry::RetryContext;
use super::session::SessionState;

/// Everything a payload handler may touch, borrowed for the duration of
/// one call.
#[derive(Debug)]
pub(crate) struct PayloadContext<'a> {
    pub session: &'a SessionState,
    pub heartbeat: &'a HeartbeatTimer,
    pub sender: &'a broadcast::Sender<GatewayPayload>,
    pub dispatch: &'a broadcast::Sender<Dispatch>,
    pub options: &'a IdentifyOptions,
    pub retry: &'a RetryContext,
}

impl PayloadContext<'_> {
    fn enqueue(&self, payload: GatewayPayload) {
        if self.sender.send(payload).is_err() {
            log::debug!("Enqueued payload dropped, no outbound consumer");
        }
    }

    fn publish(&self, dispatch: Dispatch) {
        if self.dispatch.send(dispatch).is_err() {
            log::trace!("Dispatch event dropped, no subscribers");
        }
    }
}

/// What the connection should do after a payload was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    /// keep the connection running
    Continue,
    /// server requested a reconnect, resume state must be kept
    Reconnect,
    /// server invalidated the session
    InvalidSession {
        /// whether the session may still be resumed
        resumable: bool,
    },
}

/// Route one inbound payload to its opcode handler.
pub(crate) fn handle(payload: GatewayPayload, ctx: &PayloadContext<'_>) -> Flow {
    match payload.op {
        Opcode::Hello => on_hello(payload, ctx),
        Opcode::Heartbeat => on_heartbeat(ctx),
        Opcode::HeartbeatAck => on_heartbeat_ack(ctx),
        Opcode::Dispatch => on_dispatch(payload, ctx),
        Opcode::Reconnect => {
            log::warn!("Server requested reconnect");
            Flow::Reconnect
        }
        Opcode::InvalidSession => on_invalid_session(payload, ctx),
        _ => {
            log::trace!("Ignoring inbound {:?} payload", payload.op);
            Flow::Continue
        }
    }
}

fn on_hello(payload: GatewayPayload, ctx: &PayloadContext<'_>) -> Flow {
    let hello = payload
        .d
        .and_then(|d| serde_json::from_value::<Hello>(d).ok())
        .filter(|h| h.heartbeat_interval > 0);

    let Some(hello) = hello else {
        log::warn!("Dropping hello payload with invalid body");
        return Flow::Continue;
    };

    log::debug!("Hello received, heartbeat every {} ms", hello.heartbeat_interval);

    // the ack clock baselines at timer start, not at socket open
    ctx.session.mark_ack();
    ctx.heartbeat
        .start(std::time::Duration::from_millis(hello.heartbeat_interval));

    let session_id = ctx.session.session_id();
    let sequence = ctx.session.sequence();

    match (ctx.session.resumable(), sequence) {
        (true, Some(seq)) if !session_id.is_empty() => {
            log::info!("Resuming session {} from sequence {}", session_id, seq);
            ctx.enqueue(GatewayPayload::resume(&ctx.options.to_resume(session_id, seq)));
        }
        _ => {
            log::info!("Identifying as a new session");
            ctx.session.set_resumable(false);
            ctx.enqueue(GatewayPayload::identify(&ctx.options.to_identify()));
        }
    }

    Flow::Continue
}

fn on_heartbeat(ctx: &PayloadContext<'_>) -> Flow {
    log::trace!("Server-initiated heartbeat");
    ctx.enqueue(GatewayPayload::heartbeat(ctx.session.sequence()));
    Flow::Continue
}

fn on_heartbeat_ack(ctx: &PayloadContext<'_>) -> Flow {
    log::trace!("Heartbeat ack");
    ctx.session.mark_ack();
    Flow::Continue
}

fn on_dispatch(payload: GatewayPayload, ctx: &PayloadContext<'_>) -> Flow {
    let Some(name) = payload.t else {
        log::warn!("Dropping dispatch payload without an event name");
        return Flow::Continue;
    };
    let data = payload.d.unwrap_or(serde_json::Value::Null);

    match name.as_str() {
        "READY" => {
            let session_id = data
                .get("session_id")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string();

            log::info!("Ready, session id {}", session_id);

            ctx.session.set_session_id(session_id.clone());
            ctx.publish(Dispatch::Ready(Ready { session_id, data }));
            on_handshake_success(ctx);
        }
        "RESUMED" => {
            log::info!("Session resumed");
            ctx.publish(Dispatch::Resumed);
            on_handshake_success(ctx);
        }
        _ => {
            log::trace!("Dispatching {} event", name);
            ctx.publish(Dispatch::Event { name, data });
        }
    }

    Flow::Continue
}

/// Shared tail of the ready/resumed handlers: surface the transition,
/// then re-arm resumption and the retry counter.
fn on_handshake_success(ctx: &PayloadContext<'_>) {
    let attempts = ctx.retry.attempts();
    if attempts == 0 {
        log::info!("Connected to gateway");
        ctx.publish(Dispatch::StateChange(GatewayStateChange::Connected));
    } else {
        log::info!("Reconnected to gateway after {} attempts", attempts);
        ctx.publish(Dispatch::StateChange(GatewayStateChange::RetrySucceeded {
            attempts,
        }));
    }

    ctx.retry.reset();
    ctx.session.set_resumable(true);
}

fn on_invalid_session(payload: GatewayPayload, ctx: &PayloadContext<'_>) -> Flow {
    let resumable = payload
        .d
        .as_ref()
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);

    log::warn!("Server invalidated the session, resumable: {}", resumable);

    if !resumable {
        ctx.session.clear_resume();
    }

    Flow::InvalidSession { resumable }
}
