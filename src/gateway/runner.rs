//! One connection attempt, from established transport to teardown.

use std::fmt::Debug;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use snafu::prelude::*;
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::tungstenite as websocket;

use super::handler::{self, Flow, PayloadContext};
use super::heartbeat::HeartbeatTimer;
use super::payload::{GatewayPayload, Opcode, PayloadStreamError};

/// Close codes the server uses for unrecoverable configuration errors.
const FATAL_CLOSE_CODES: std::ops::RangeInclusive<u16> = 4010..=4014;

/// Close code for rejected authentication.
const AUTHENTICATION_FAILED_CLOSE_CODE: u16 = 4004;

/// Error that ended one connection attempt
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), module(error), context(suffix(false)))]
pub enum AttemptError {
    /// establishing the websocket connection failed
    #[snafu(display("connect to gateway failed: {source}"))]
    Connect {
        /// source error
        source: websocket::Error,
    },

    /// reading or writing the transport failed
    #[snafu(display("gateway transport failed: {source}"))]
    Transport {
        /// source error
        source: PayloadStreamError,
    },

    /// the transport stream ended without a close frame
    #[snafu(display("gateway stream ended unexpectedly"))]
    StreamEnded,

    /// remote closed the connection with a close frame
    #[snafu(display("gateway closed the connection, code {code}"))]
    Closed {
        /// close code
        code: u16,
    },

    /// heartbeat acknowledgements stopped arriving
    #[snafu(display("zombie connection, no heartbeat ack for {elapsed_ms} ms"))]
    Zombie {
        /// milliseconds since the last acknowledgement
        elapsed_ms: i64,
    },

    /// server requested a reconnect
    #[snafu(display("server requested reconnect"))]
    ServerReconnect,

    /// the caller requested a reconnect
    #[snafu(display("reconnect requested by caller"))]
    ReconnectRequested,

    /// server invalidated the session
    #[snafu(display("server invalidated the session, resumable: {resumable}"))]
    SessionInvalidated {
        /// whether the session may still be resumed
        resumable: bool,
    },
}

impl AttemptError {
    /// Check if the supervisor must give up instead of retrying.
    pub fn is_fatal(&self) -> bool {
        self.fatal_close_code().is_some()
    }

    /// The close code when this error is unrecoverable.
    pub fn fatal_close_code(&self) -> Option<u16> {
        match self {
            Self::Closed { code }
                if *code == AUTHENTICATION_FAILED_CLOSE_CODE
                    || FATAL_CLOSE_CODES.contains(code) =>
            {
                Some(*code)
            }
            _ => None,
        }
    }

    /// Check if the close code means rejected authentication.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, Self::Closed { code } if *code == AUTHENTICATION_FAILED_CLOSE_CODE)
    }

    /// Check if the resume state survives this error.
    ///
    /// When this is false the next attempt identifies fresh.
    pub fn keeps_resume(&self) -> bool {
        match self {
            Self::ReconnectRequested => false,
            Self::SessionInvalidated { resumable } => *resumable,
            _ => true,
        }
    }
}

/// Stops the heartbeat timer even when the attempt future is dropped.
struct StopTimerOnDrop<'a>(&'a HeartbeatTimer);

impl Drop for StopTimerOnDrop<'_> {
    fn drop(&mut self) {
        self.0.stop();
    }
}

/// Drives one transport attempt end to end.
#[derive(Debug)]
pub(crate) struct ConnectionRunner<S> {
    transport: S,
    outbound: broadcast::Receiver<GatewayPayload>,
    receiver: broadcast::Sender<GatewayPayload>,
    close: watch::Receiver<bool>,
}

impl<S> ConnectionRunner<S>
where
    S: Stream<Item = Result<GatewayPayload, PayloadStreamError>>
        + Sink<GatewayPayload, Error = PayloadStreamError>
        + Debug
        + Unpin,
{
    pub fn new(
        transport: S,
        outbound: broadcast::Receiver<GatewayPayload>,
        receiver: broadcast::Sender<GatewayPayload>,
        close: watch::Receiver<bool>,
    ) -> Self {
        Self {
            transport,
            outbound,
            receiver,
            close,
        }
    }

    /// Run the attempt until the connection unwinds or the caller closes.
    ///
    /// Returns `Ok(())` only for the cooperative shutdown path.
    pub async fn run(self, ctx: &PayloadContext<'_>) -> Result<(), AttemptError> {
        log::debug!("Connection attempt start");

        let Self {
            transport,
            mut outbound,
            receiver,
            mut close,
        } = self;

        let _stop_timer = StopTimerOnDrop(ctx.heartbeat);

        ctx.session.mark_ack();

        let (mut sink, mut stream) = transport.split();
        let mut ticks = ctx.heartbeat.ticks();
        let mut beats_sent: u64 = 0;

        if *close.borrow_and_update() {
            log::debug!("Close requested before the attempt started");
            let _ = sink.close().await;
            return Ok(());
        }

        let result = loop {
            tokio::select! {
                biased;

                changed = close.changed() => {
                    if changed.is_err() || *close.borrow() {
                        log::debug!("Close requested, attempt ends");
                        break Ok(());
                    }
                }

                _ = ticks.tick() => {
                    let elapsed_ms = ctx.session.millis_since_ack();
                    let period_ms = ctx
                        .heartbeat
                        .period()
                        .map_or(i64::MAX, |p| p.as_millis() as i64);

                    // only a sent heartbeat can be missing its ack
                    if beats_sent > 0 && elapsed_ms > period_ms {
                        log::warn!("Missing heartbeat ack for {} ms", elapsed_ms);
                        break error::Zombie { elapsed_ms }.fail();
                    }

                    log::trace!("Heartbeat tick, sequence {:?}", ctx.session.sequence());
                    if ctx.sender.send(GatewayPayload::heartbeat(ctx.session.sequence())).is_err() {
                        log::debug!("Heartbeat dropped, no outbound consumer");
                    }
                    beats_sent += 1;
                }

                queued = outbound.recv() => {
                    match queued {
                        Ok(payload) if payload.op == Opcode::Reconnect => {
                            log::debug!("Reconnect payload seen on the outbound stream");
                            break error::ReconnectRequested.fail();
                        }
                        Ok(payload) => {
                            log::trace!("Sending {:?} payload", payload.op);
                            if let Err(e) = sink.send(payload).await {
                                break Err(e).context(error::Transport);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            log::warn!("Outbound stream lagged, {} payloads dropped", missed);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            log::debug!("Outbound stream closed, attempt ends");
                            break Ok(());
                        }
                    }
                }

                frame = stream.next() => {
                    match frame {
                        None => break error::StreamEnded.fail(),
                        Some(Err(PayloadStreamError::Closed { code })) => {
                            log::warn!("Gateway closed the connection, code {}", code);
                            break error::Closed { code }.fail();
                        }
                        Some(Err(e)) if e.is_fatal() => break Err(e).context(error::Transport),
                        Some(Err(e)) => {
                            log::warn!("Inbound frame error happened but ignored: {}", e);
                        }
                        Some(Ok(payload)) => {
                            if let Some(seq) = payload.s {
                                ctx.session.observe_sequence(seq);
                            }

                            if receiver.send(payload.clone()).is_err() {
                                log::trace!("Raw payload dropped, no subscribers");
                            }

                            match handler::handle(payload, ctx) {
                                Flow::Continue => {}
                                Flow::Reconnect => break error::ServerReconnect.fail(),
                                Flow::InvalidSession { resumable } => {
                                    break error::SessionInvalidated { resumable }.fail();
                                }
                            }
                        }
                    }
                }
            }
        };

        ctx.heartbeat.stop();
        let _ = sink.close().await;

        log::debug!("Connection attempt ended: {:?}", result);

        result
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::task::Poll;

    use serde_json::json;
    use tokio::sync::mpsc;

    use crate::gateway::dispatch::Dispatch;
    use crate::gateway::options::IdentifyOptions;
    use crate::gateway::retry::RetryContext;
    use crate::gateway::session::SessionState;

    /// In-memory stand-in for the websocket payload stream/sink.
    #[derive(Debug)]
    struct TestTransport {
        rx: mpsc::UnboundedReceiver<Result<GatewayPayload, PayloadStreamError>>,
        tx: mpsc::UnboundedSender<GatewayPayload>,
    }

    impl Stream for TestTransport {
        type Item = Result<GatewayPayload, PayloadStreamError>;

        fn poll_next(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> Poll<Option<Self::Item>> {
            self.rx.poll_recv(cx)
        }
    }

    impl Sink<GatewayPayload> for TestTransport {
        type Error = PayloadStreamError;

        fn poll_ready(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(
            self: std::pin::Pin<&mut Self>,
            item: GatewayPayload,
        ) -> Result<(), Self::Error> {
            self.tx.send(item).map_err(|_| PayloadStreamError::Websocket {
                source: websocket::Error::ConnectionClosed,
            })
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    struct Harness {
        session: SessionState,
        heartbeat: HeartbeatTimer,
        sender: broadcast::Sender<GatewayPayload>,
        dispatch: broadcast::Sender<Dispatch>,
        _dispatch_rx: broadcast::Receiver<Dispatch>,
        options: IdentifyOptions,
        retry: RetryContext,
        close: watch::Sender<bool>,
    }

    struct Remote {
        to_client: mpsc::UnboundedSender<Result<GatewayPayload, PayloadStreamError>>,
        from_client: mpsc::UnboundedReceiver<GatewayPayload>,
    }

    impl Harness {
        fn new(options: IdentifyOptions) -> Self {
            let (sender, _) = broadcast::channel(16);
            let (dispatch, _dispatch_rx) = broadcast::channel(16);
            let (close, _) = watch::channel(false);
            Self {
                session: SessionState::new(&options),
                heartbeat: HeartbeatTimer::new(),
                sender,
                dispatch,
                _dispatch_rx,
                options,
                retry: RetryContext::new(),
                close,
            }
        }

        fn ctx(&self) -> PayloadContext<'_> {
            PayloadContext {
                session: &self.session,
                heartbeat: &self.heartbeat,
                sender: &self.sender,
                dispatch: &self.dispatch,
                options: &self.options,
                retry: &self.retry,
            }
        }

        fn runner(&self) -> (ConnectionRunner<TestTransport>, Remote) {
            let (to_client, rx) = mpsc::unbounded_channel();
            let (tx, from_client) = mpsc::unbounded_channel();
            let runner = ConnectionRunner::new(
                TestTransport { rx, tx },
                self.sender.subscribe(),
                broadcast::channel(16).0,
                self.close.subscribe(),
            );
            (runner, Remote { to_client, from_client })
        }
    }

    fn hello(interval: u64) -> GatewayPayload {
        GatewayPayload {
            op: Opcode::Hello,
            d: Some(json!({ "heartbeat_interval": interval })),
            s: None,
            t: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_zombie_detected_after_unacked_ticks() {
        let harness = Harness::new(IdentifyOptions::new("tok").with_resume("abc", 100));
        let (runner, mut remote) = harness.runner();

        remote.to_client.send(Ok(hello(100))).unwrap();

        let result = runner.run(&harness.ctx()).await;

        assert!(matches!(result, Err(AttemptError::Zombie { .. })));
        // the resume attempt and one heartbeat made it out before the cut
        let first = remote.from_client.recv().await.unwrap();
        assert_eq!(first.op, Opcode::Resume);
        let second = remote.from_client.recv().await.unwrap();
        assert_eq!(second.op, Opcode::Heartbeat);
        // resume state survives a zombie
        assert!(harness.session.resumable());
        assert_eq!(harness.heartbeat.period(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acked_heartbeats_keep_the_connection_alive() {
        let harness = Harness::new(IdentifyOptions::new("tok"));
        let (runner, mut remote) = harness.runner();

        remote.to_client.send(Ok(hello(50))).unwrap();

        let script = async {
            // identify, then three acked heartbeats, then server closes
            let identify = remote.from_client.recv().await.unwrap();
            assert_eq!(identify.op, Opcode::Identify);

            for _ in 0..3 {
                let beat = remote.from_client.recv().await.unwrap();
                assert_eq!(beat.op, Opcode::Heartbeat);
                remote
                    .to_client
                    .send(Ok(GatewayPayload {
                        op: Opcode::HeartbeatAck,
                        d: None,
                        s: None,
                        t: None,
                    }))
                    .unwrap();
            }

            remote
                .to_client
                .send(Err(PayloadStreamError::Closed { code: 1001 }))
                .unwrap();
        };

        let ctx = harness.ctx();
        let (result, ()) = tokio::join!(runner.run(&ctx), script);

        assert!(matches!(result, Err(AttemptError::Closed { code: 1001 })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_request_ends_the_attempt_cleanly() {
        let harness = Harness::new(IdentifyOptions::new("tok"));
        let (runner, remote) = harness.runner();

        remote.to_client.send(Ok(hello(50))).unwrap();

        let script = async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            harness.close.send_replace(true);
        };

        let ctx = harness.ctx();
        let (result, ()) = tokio::join!(runner.run(&ctx), script);

        assert!(result.is_ok());
        assert_eq!(harness.heartbeat.period(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_payload_on_outbound_stream_unwinds() {
        let harness = Harness::new(IdentifyOptions::new("tok"));
        let (runner, _remote) = harness.runner();

        let script = async {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            harness.sender.send(GatewayPayload::reconnect()).unwrap();
        };

        let ctx = harness.ctx();
        let (result, ()) = tokio::join!(runner.run(&ctx), script);

        assert!(matches!(result, Err(AttemptError::ReconnectRequested)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_reconnect_opcode_unwinds() {
        let harness = Harness::new(IdentifyOptions::new("tok").with_resume("abc", 9));
        let (runner, remote) = harness.runner();

        remote
            .to_client
            .send(Ok(GatewayPayload {
                op: Opcode::Reconnect,
                d: None,
                s: None,
                t: None,
            }))
            .unwrap();

        let result = runner.run(&harness.ctx()).await;

        assert!(matches!(result, Err(AttemptError::ServerReconnect)));
        assert!(harness.session.resumable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_errors_are_absorbed() {
        let harness = Harness::new(IdentifyOptions::new("tok"));
        let (runner, remote) = harness.runner();

        remote
            .to_client
            .send(Err(PayloadStreamError::UnexpectedFrame))
            .unwrap();
        remote
            .to_client
            .send(Ok(GatewayPayload {
                op: Opcode::InvalidSession,
                d: Some(json!(false)),
                s: None,
                t: None,
            }))
            .unwrap();

        let result = runner.run(&harness.ctx()).await;

        // the bad frame was skipped, the next payload still handled
        assert!(matches!(
            result,
            Err(AttemptError::SessionInvalidated { resumable: false })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_end_is_an_error() {
        let harness = Harness::new(IdentifyOptions::new("tok"));
        let (runner, remote) = harness.runner();

        drop(remote.to_client);

        let result = runner.run(&harness.ctx()).await;

        assert!(matches!(result, Err(AttemptError::StreamEnded)));
    }

    #[test]
    fn test_fatal_close_codes() {
        assert!(AttemptError::Closed { code: 4004 }.is_fatal());
        assert!(AttemptError::Closed { code: 4004 }.is_authentication_failure());
        for code in 4010..=4014 {
            assert!(AttemptError::Closed { code }.is_fatal());
            assert!(!AttemptError::Closed { code }.is_authentication_failure());
        }
        assert!(!AttemptError::Closed { code: 1000 }.is_fatal());
        assert!(!AttemptError::Closed { code: 4000 }.is_fatal());
        assert!(!AttemptError::Zombie { elapsed_ms: 1000 }.is_fatal());
    }

    #[test]
    fn test_resume_survival_classification() {
        assert!(AttemptError::Zombie { elapsed_ms: 1 }.keeps_resume());
        assert!(AttemptError::ServerReconnect.keeps_resume());
        assert!(AttemptError::StreamEnded.keeps_resume());
        assert!(!AttemptError::ReconnectRequested.keeps_resume());
        assert!(!AttemptError::SessionInvalidated { resumable: false }.keeps_resume());
        assert!(AttemptError::SessionInvalidated { resumable: true }.keeps_resume());
    }
}
