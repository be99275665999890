//! The gateway client facade and its reconnection supervisor.

use std::fmt;
use std::task::Poll;

use futures_util::{Stream, StreamExt};
use snafu::prelude::*;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_tungstenite::tungstenite as websocket;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, InvalidHeaderValue, USER_AGENT};

use super::dispatch::{Dispatch, GatewayStateChange};
use super::handler::PayloadContext;
use super::heartbeat::HeartbeatTimer;
use super::options::IdentifyOptions;
use super::payload::{GatewayPayload, PayloadStreamSink};
use super::retry::{RetryContext, RetryPolicy};
use super::runner::{AttemptError, ConnectionRunner};
use super::session::SessionState;

/// Capacity of the dispatch, receiver and sender streams. Subscribers
/// that fall further behind skip ahead to the newest items.
const STREAM_CAPACITY: usize = 64;

/// Protocol version appended to gateway urls that lack one.
const GATEWAY_VERSION: &str = "10";

/// Error when run the gateway client
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), module(error), context(suffix(false)))]
pub enum RunError {
    /// the gateway url did not parse
    #[snafu(display("invalid gateway url {url}: {source}"))]
    InvalidURL {
        /// received url
        url: String,
        /// source error
        source: url::ParseError,
    },

    /// the gateway url has a non-websocket scheme
    #[snafu(display("gateway url {url} must use the ws or wss scheme"))]
    InvalidScheme {
        /// received url
        url: String,
    },

    /// the configured user agent is not a valid header value
    #[snafu(display("configured user agent is not a valid header value"))]
    InvalidUserAgent {
        /// source error
        source: InvalidHeaderValue,
    },

    /// building the websocket upgrade request failed
    #[snafu(display("build websocket request failed: {source}"))]
    BuildRequestFailed {
        /// source error
        source: websocket::Error,
    },

    /// the server rejected the token
    #[snafu(display("gateway rejected authentication"))]
    AuthenticationFailed,

    /// the server closed with an unrecoverable configuration error
    #[snafu(display("gateway closed with fatal code {code}"))]
    FatalClose {
        /// close code
        code: u16,
    },

    /// every allowed reconnect attempt failed
    #[snafu(display("gave up after {attempts} reconnect attempts: {source}"))]
    RetriesExhausted {
        /// attempts made before giving up
        attempts: u32,
        /// the error that ended the last attempt
        source: AttemptError,
    },
}

/// A persistent, self-healing gateway client.
///
/// One instance maintains a single logical session across any number of
/// underlying websocket connections. Construct it, subscribe to
/// [`dispatch`](Self::dispatch), then drive it with [`run`](Self::run).
#[derive(Debug)]
pub struct GatewayClient {
    options: IdentifyOptions,
    policy: RetryPolicy,
    user_agent: String,
    compress: bool,
    session: SessionState,
    retry: RetryContext,
    heartbeat: HeartbeatTimer,
    dispatch_tx: broadcast::Sender<Dispatch>,
    receiver_tx: broadcast::Sender<GatewayPayload>,
    sender_tx: broadcast::Sender<GatewayPayload>,
    close_tx: watch::Sender<bool>,
}

impl GatewayClient {
    /// Create a client with the default retry policy.
    pub fn new(options: IdentifyOptions) -> Self {
        let (dispatch_tx, _) = broadcast::channel(STREAM_CAPACITY);
        let (receiver_tx, _) = broadcast::channel(STREAM_CAPACITY);
        let (sender_tx, _) = broadcast::channel(STREAM_CAPACITY);
        let (close_tx, _) = watch::channel(false);

        Self {
            session: SessionState::new(&options),
            options,
            policy: RetryPolicy::default(),
            user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string(),
            compress: false,
            retry: RetryContext::new(),
            heartbeat: HeartbeatTimer::new(),
            dispatch_tx,
            receiver_tx,
            sender_tx,
            close_tx,
        }
    }

    /// Replace the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the user agent sent on the upgrade request.
    pub fn with_user_agent<S: AsRef<str> + ?Sized>(mut self, user_agent: &S) -> Self {
        self.user_agent = user_agent.as_ref().to_string();
        self
    }

    /// Enable zlib inflation of inbound binary frames.
    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Run the reconnection supervisor against the given gateway url.
    ///
    /// The returned future is the lifetime handle of the client: it
    /// completes when the client is permanently closed, either by
    /// [`close(false)`](Self::close) (with `Ok`) or by a fatal error.
    pub async fn run(&self, url: &str) -> Result<(), RunError> {
        let url = self.normalize_url(url)?;
        let agent = HeaderValue::from_str(&self.user_agent).context(error::InvalidUserAgent)?;

        // surface an unbuildable upgrade request before the first attempt
        url.as_str()
            .into_client_request()
            .context(error::BuildRequestFailed)?;

        log::info!("Gateway supervisor start, url {}", url);

        let result = self.supervise(&url, &agent).await;

        log::info!("Disconnected from gateway");
        if self
            .dispatch_tx
            .send(Dispatch::StateChange(GatewayStateChange::Disconnected))
            .is_err()
        {
            log::trace!("Disconnected state change dropped, no subscribers");
        }

        result
    }

    async fn supervise(&self, url: &str, agent: &HeaderValue) -> Result<(), RunError> {
        let mut close_rx = self.close_tx.subscribe();

        loop {
            if *close_rx.borrow_and_update() {
                log::debug!("Close requested, supervisor exits");
                return Ok(());
            }

            let err = match self.attempt(url, agent).await {
                Ok(()) => {
                    log::debug!("Attempt closed cooperatively, supervisor exits");
                    return Ok(());
                }
                Err(e) => e,
            };

            if err.is_authentication_failure() {
                log::error!("Gateway rejected authentication");
                return error::AuthenticationFailed.fail();
            }
            if let Some(code) = err.fatal_close_code() {
                log::error!("Gateway client fatal error: {}", err);
                return error::FatalClose { code }.fail();
            }

            log::warn!("Connection attempt failed: {}", err);

            if !err.keeps_resume() {
                self.session.set_resumable(false);
            }

            let attempts = self.retry.next();
            if let Some(max) = self.policy.max_retries() {
                if attempts > max {
                    log::error!("Reached the retry limit of {}", max);
                    return Err(err).context(error::RetriesExhausted { attempts: max });
                }
            }

            let delay = self.policy.next_delay(attempts);
            log::info!("Retry attempt {} in {:?}", attempts, delay);

            let change = if attempts == 1 {
                GatewayStateChange::RetryStarted { delay }
            } else {
                // a failed resume attempt will not be retried as a resume
                self.session.set_resumable(false);
                GatewayStateChange::RetryFailed {
                    attempt: attempts - 1,
                    delay,
                }
            };
            if self.dispatch_tx.send(Dispatch::StateChange(change)).is_err() {
                log::trace!("Retry state change dropped, no subscribers");
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = close_rx.changed() => {
                    if changed.is_err() || *close_rx.borrow() {
                        log::debug!("Close requested during backoff, supervisor exits");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn attempt(&self, url: &str, agent: &HeaderValue) -> Result<(), AttemptError> {
        let mut request = url
            .into_client_request()
            .context(super::runner::error::Connect)?;
        request.headers_mut().insert(USER_AGENT, agent.clone());

        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .context(super::runner::error::Connect)?;

        let transport = PayloadStreamSink::new(ws, self.compress);
        let runner = ConnectionRunner::new(
            transport,
            self.sender_tx.subscribe(),
            self.receiver_tx.clone(),
            self.close_tx.subscribe(),
        );

        let ctx = PayloadContext {
            session: &self.session,
            heartbeat: &self.heartbeat,
            sender: &self.sender_tx,
            dispatch: &self.dispatch_tx,
            options: &self.options,
            retry: &self.retry,
        };

        runner.run(&ctx).await
    }

    fn normalize_url(&self, url: &str) -> Result<String, RunError> {
        let mut parsed = url::Url::parse(url).with_context(|_| error::InvalidURL { url })?;

        ensure!(
            parsed.scheme() == "wss" || parsed.scheme() == "ws",
            error::InvalidScheme { url }
        );

        if !parsed.query_pairs().any(|(key, _)| key == "v") {
            parsed
                .query_pairs_mut()
                .append_pair("v", GATEWAY_VERSION)
                .append_pair("encoding", "json");
        }

        Ok(parsed.into())
    }

    /// Stream of high-level [`Dispatch`] events, interleaved with
    /// synthetic [`GatewayStateChange`] items.
    ///
    /// Keeps only the latest items; a slow consumer skips ahead instead
    /// of applying backpressure.
    pub fn dispatch(&self) -> DispatchStream {
        DispatchStream {
            inner: BroadcastStream::new(self.dispatch_tx.subscribe()),
        }
    }

    /// Stream of raw inbound payloads, in network-arrival order.
    ///
    /// Same overflow behavior as [`dispatch`](Self::dispatch).
    pub fn receiver(&self) -> PayloadStream {
        PayloadStream {
            inner: BroadcastStream::new(self.receiver_tx.subscribe()),
        }
    }

    /// Sink for user-generated outbound payloads.
    ///
    /// The sink serializes writes from a single logical producer;
    /// concurrent producers must coordinate externally. Sending never
    /// blocks: payloads queued beyond the stream capacity displace the
    /// oldest queued ones.
    pub fn sender(&self) -> GatewaySender {
        GatewaySender {
            tx: self.sender_tx.clone(),
        }
    }

    /// Forward every element of a stream to the sender sink.
    pub async fn send<St>(&self, publisher: St)
    where
        St: Stream<Item = GatewayPayload>,
    {
        let sender = self.sender();
        futures_util::pin_mut!(publisher);
        while let Some(payload) = publisher.next().await {
            sender.send(payload);
        }
    }

    /// Terminate the current connection and optionally reconnect.
    ///
    /// With `reconnect` the session is abandoned, a reconnect is forced
    /// and the supervisor establishes a fresh one. Without it the client
    /// shuts down for good and the [`run`](Self::run) handle completes;
    /// calling it again is a no-op.
    pub fn close(&self, reconnect: bool) {
        if reconnect {
            log::info!("Reconnect requested");
            self.session.set_resumable(false);
            if self.sender_tx.send(GatewayPayload::reconnect()).is_err() {
                log::debug!("Reconnect request dropped, client is not running");
            }
        } else {
            log::info!("Close requested");
            self.close_tx.send_replace(true);
        }
    }

    /// Id of the current gateway session, empty before the first ready.
    pub fn session_id(&self) -> String {
        self.session.session_id()
    }

    /// Last sequence observed on the session, if any.
    pub fn sequence(&self) -> Option<i64> {
        self.session.sequence()
    }
}

/// Stream of [`Dispatch`] events, handed out by
/// [`GatewayClient::dispatch`].
pub struct DispatchStream {
    inner: BroadcastStream<Dispatch>,
}

impl fmt::Debug for DispatchStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchStream").finish_non_exhaustive()
    }
}

impl Stream for DispatchStream {
    type Item = Dispatch;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        loop {
            match self.inner.poll_next_unpin(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Ready(Some(Ok(item))) => return Poll::Ready(Some(item)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(missed)))) => {
                    log::warn!("Dispatch stream lagged, {} events skipped", missed);
                }
            }
        }
    }
}

/// Stream of raw inbound payloads, handed out by
/// [`GatewayClient::receiver`].
pub struct PayloadStream {
    inner: BroadcastStream<GatewayPayload>,
}

impl fmt::Debug for PayloadStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadStream").finish_non_exhaustive()
    }
}

impl Stream for PayloadStream {
    type Item = GatewayPayload;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        loop {
            match self.inner.poll_next_unpin(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Ready(Some(Ok(item))) => return Poll::Ready(Some(item)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(missed)))) => {
                    log::warn!("Receiver stream lagged, {} payloads skipped", missed);
                }
            }
        }
    }
}

/// Handle for producing outbound payloads, handed out by
/// [`GatewayClient::sender`].
#[derive(Debug, Clone)]
pub struct GatewaySender {
    tx: broadcast::Sender<GatewayPayload>,
}

impl GatewaySender {
    /// Queue one payload for sending.
    ///
    /// Payloads queued while no connection is up are dropped once the
    /// queue wraps around; the newest ones win.
    pub fn send(&self, payload: GatewayPayload) {
        log::trace!("Queueing outbound {:?} payload", payload.op);
        if self.tx.send(payload).is_err() {
            log::debug!("Outbound payload dropped, client is not running");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn client() -> GatewayClient {
        GatewayClient::new(IdentifyOptions::new("tok"))
    }

    #[test]
    fn test_normalize_url_appends_version_and_encoding() {
        let normalized = client().normalize_url("wss://gateway.example.com").unwrap();

        assert_eq!(
            normalized,
            "wss://gateway.example.com/?v=10&encoding=json"
        );
    }

    #[test]
    fn test_normalize_url_keeps_existing_version() {
        let normalized = client()
            .normalize_url("wss://gateway.example.com/?v=9&encoding=json")
            .unwrap();

        assert_eq!(normalized, "wss://gateway.example.com/?v=9&encoding=json");
    }

    #[test]
    fn test_normalize_url_rejects_http() {
        let err = client().normalize_url("https://gateway.example.com").unwrap_err();

        assert!(matches!(err, RunError::InvalidScheme { .. }));
    }

    #[test]
    fn test_normalize_url_rejects_garbage() {
        let err = client().normalize_url("not a url").unwrap_err();

        assert!(matches!(err, RunError::InvalidURL { .. }));
    }

    #[tokio::test]
    async fn test_invalid_user_agent_fails_fast() {
        let client = client().with_user_agent("bad\nagent");

        let err = client.run("wss://gateway.example.com").await.unwrap_err();

        assert!(matches!(err, RunError::InvalidUserAgent { .. }));
    }

    #[test]
    fn test_close_is_idempotent() {
        let client = client();

        client.close(false);
        client.close(false);

        assert!(*client.close_tx.subscribe().borrow());
    }

    #[test]
    fn test_close_reconnect_clears_resumable() {
        let client = GatewayClient::new(IdentifyOptions::new("tok").with_resume("abc", 9));
        // hold a receiver so the injected payload is observable
        let mut rx = client.sender_tx.subscribe();

        client.close(true);

        assert!(!client.session.resumable());
        let injected = rx.try_recv().unwrap();
        assert_eq!(injected.op, crate::gateway::payload::Opcode::Reconnect);
        // a plain reconnect must not shut the supervisor down
        assert!(!*client.close_tx.subscribe().borrow());
    }

    #[tokio::test]
    async fn test_send_forwards_a_stream() {
        let client = client();
        let mut rx = client.sender_tx.subscribe();

        client
            .send(futures_util::stream::iter(vec![
                GatewayPayload::heartbeat(Some(1)),
                GatewayPayload::heartbeat(Some(2)),
            ]))
            .await;

        assert_eq!(rx.try_recv().unwrap().d, Some(serde_json::json!(1)));
        assert_eq!(rx.try_recv().unwrap().d, Some(serde_json::json!(2)));
    }
}
