//! Resume bookkeeping shared across connection attempts.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::RwLock;

use tokio::time::Instant;

use super::options::IdentifyOptions;

/// Mutable session record surviving transport reconnects.
///
/// Every field is updated independently; cross-field invariants are
/// re-established at the ready/resumed and pre-identify points of the
/// connection lifecycle.
#[derive(Debug)]
pub struct SessionState {
    /// last sequence observed, negative when none was seen yet
    sequence: AtomicI64,
    /// session id from the last ready event, empty before that
    session_id: RwLock<String>,
    /// whether the next connection should attempt a resume
    resumable: AtomicBool,
    /// milliseconds since `epoch` of the last heartbeat ack
    last_ack_ms: AtomicI64,
    /// monotonic anchor for `last_ack_ms`
    epoch: Instant,
}

impl SessionState {
    pub(crate) fn new(options: &IdentifyOptions) -> Self {
        let seeded = options.resume_session_id.is_some() && options.resume_sequence.is_some();

        Self {
            sequence: AtomicI64::new(options.resume_sequence.unwrap_or(-1)),
            session_id: RwLock::new(options.resume_session_id.clone().unwrap_or_default()),
            resumable: AtomicBool::new(seeded),
            last_ack_ms: AtomicI64::new(0),
            epoch: Instant::now(),
        }
    }

    /// Last sequence observed on this session, if any.
    pub fn sequence(&self) -> Option<i64> {
        let seq = self.sequence.load(Ordering::SeqCst);
        (seq >= 0).then_some(seq)
    }

    /// Record a sequence; only values ahead of the current one stick.
    pub(crate) fn observe_sequence(&self, seq: i64) {
        self.sequence.fetch_max(seq, Ordering::SeqCst);
    }

    /// Current session id, empty until the first ready event.
    pub fn session_id(&self) -> String {
        self.session_id.read().expect("session id lock poisoned").clone()
    }

    pub(crate) fn set_session_id(&self, id: String) {
        *self.session_id.write().expect("session id lock poisoned") = id;
    }

    /// Whether the next connection will attempt a resume.
    pub fn resumable(&self) -> bool {
        self.resumable.load(Ordering::SeqCst)
    }

    pub(crate) fn set_resumable(&self, resumable: bool) {
        self.resumable.store(resumable, Ordering::SeqCst);
    }

    /// Drop all resume state; the next connection must identify fresh.
    pub(crate) fn clear_resume(&self) {
        self.resumable.store(false, Ordering::SeqCst);
        self.sequence.store(-1, Ordering::SeqCst);
        self.set_session_id(String::new());
    }

    /// Stamp the ack clock, also used as the baseline at connection start.
    pub(crate) fn mark_ack(&self) {
        let now = self.epoch.elapsed().as_millis() as i64;
        self.last_ack_ms.store(now, Ordering::SeqCst);
    }

    /// Milliseconds since the last ack (or connection start).
    pub fn millis_since_ack(&self) -> i64 {
        let now = self.epoch.elapsed().as_millis() as i64;
        now - self.last_ack_ms.load(Ordering::SeqCst)
    }
}
