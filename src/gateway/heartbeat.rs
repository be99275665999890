//! Resettable periodic tick source driving the heartbeat loop.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// A resettable periodic timer.
///
/// The timer itself is a handle; [`ticks`](HeartbeatTimer::ticks) hands
/// out the consuming side. Ticks start only after
/// [`start`](HeartbeatTimer::start) and cease immediately after
/// [`stop`](HeartbeatTimer::stop).
#[derive(Debug)]
pub struct HeartbeatTimer {
    cmd: watch::Sender<Option<Duration>>,
}

impl Default for HeartbeatTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatTimer {
    /// Create a stopped timer.
    pub fn new() -> Self {
        let (cmd, _) = watch::channel(None);
        Self { cmd }
    }

    /// Begin emitting ticks every `period`, the first after one full period.
    pub fn start(&self, period: Duration) {
        log::debug!("Heartbeat timer start, period {:?}", period);
        self.cmd.send_replace(Some(period));
    }

    /// Cease tick emission; idempotent.
    pub fn stop(&self) {
        log::debug!("Heartbeat timer stop");
        self.cmd.send_replace(None);
    }

    /// Stop then start with a new period, atomically.
    pub fn reset(&self, period: Duration) {
        log::debug!("Heartbeat timer reset, period {:?}", period);
        self.cmd.send_replace(Some(period));
    }

    /// Currently configured period, if the timer is running.
    pub fn period(&self) -> Option<Duration> {
        *self.cmd.borrow()
    }

    /// Obtain the consuming side of the timer.
    pub fn ticks(&self) -> HeartbeatTicks {
        HeartbeatTicks {
            cmd: self.cmd.subscribe(),
            deadline: None,
        }
    }
}

/// Consuming side of a [`HeartbeatTimer`].
#[derive(Debug)]
pub struct HeartbeatTicks {
    cmd: watch::Receiver<Option<Duration>>,
    deadline: Option<Instant>,
}

impl HeartbeatTicks {
    /// Resolve at the next tick.
    ///
    /// Pends forever while the timer is stopped. A start or reset while
    /// waiting pushes the next tick to at least one new period away.
    pub async fn tick(&mut self) {
        loop {
            // a start/stop/reset since the last poll invalidates the deadline
            match self.cmd.has_changed() {
                Ok(true) => self.deadline = None,
                Ok(false) => {}
                Err(_) => std::future::pending::<()>().await,
            }

            let period = *self.cmd.borrow_and_update();

            let Some(period) = period else {
                self.deadline = None;
                if self.cmd.changed().await.is_err() {
                    // timer dropped, never tick again
                    std::future::pending::<()>().await;
                }
                continue;
            };

            let deadline = *self.deadline.get_or_insert_with(|| Instant::now() + period);

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    self.deadline = Some(Instant::now() + period);
                    return;
                }
                changed = self.cmd.changed() => {
                    self.deadline = None;
                    if changed.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use tokio::time::timeout;

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_after_one_period() {
        let timer = HeartbeatTimer::new();
        let mut ticks = timer.ticks();

        timer.start(Duration::from_millis(100));

        let before = Instant::now();
        ticks.tick().await;
        assert_eq!(before.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_repeat_every_period() {
        let timer = HeartbeatTimer::new();
        let mut ticks = timer.ticks();

        timer.start(Duration::from_millis(100));

        let before = Instant::now();
        ticks.tick().await;
        ticks.tick().await;
        ticks.tick().await;
        assert_eq!(before.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_timer_never_ticks() {
        let timer = HeartbeatTimer::new();
        let mut ticks = timer.ticks();

        timer.start(Duration::from_millis(10));
        ticks.tick().await;
        timer.stop();

        let result = timeout(Duration::from_secs(60), ticks.tick()).await;
        assert!(result.is_err());
        assert_eq!(timer.period(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_pushes_next_tick_out() {
        let timer = HeartbeatTimer::new();
        let mut ticks = timer.ticks();

        timer.start(Duration::from_millis(100));

        // half a period in, reset to a longer one
        let wait = tokio::time::sleep(Duration::from_millis(50));
        tokio::pin!(wait);
        tokio::select! {
            _ = &mut wait => timer.reset(Duration::from_millis(200)),
            _ = ticks.tick() => panic!("tick before first period elapsed"),
        }

        let before = Instant::now();
        ticks.tick().await;
        assert_eq!(before.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_started_never_ticks() {
        let timer = HeartbeatTimer::new();
        let mut ticks = timer.ticks();

        let result = timeout(Duration::from_secs(60), ticks.tick()).await;
        assert!(result.is_err());
    }
}
