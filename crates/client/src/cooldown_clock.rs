//! Cooldown Clock Module
//!
//! Local one-second countdown of the connected account's voting
//! cooldown. It never talks to the network: when the count reaches
//! zero it sends an expiry signal and the synchronizer re-polls.
//!
//! ## State Machine
//!
//! ```text
//!            set(n > 0)                 tick (n > 1)
//!   ┌──────┐ ─────────▶ ┌─────────────┐ ───────┐
//!   │ Idle │            │ Counting(n) │ ◀──────┘
//!   └──────┘ ◀───────── └─────────────┘
//!      ▲      tick at 1 (fires expiry)   │ set(m > 0): Counting(m)
//!      └──────────────────────────────────┘ set(0): Idle (fires expiry)
//! ```
//!
//! `set(0)` while Idle is a no-op. Expiry fires once per countdown,
//! whether the count ticks down to zero or the chain reports zero.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

const TICK: Duration = Duration::from_secs(1);

/// Pure cooldown state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CooldownState {
    #[default]
    Idle,
    Counting(u64),
}

impl CooldownState {
    /// Apply a fresh remaining value from the chain. Returns the next
    /// state and whether a running countdown expired.
    pub fn set(self, remaining: u64) -> (CooldownState, bool) {
        match (self, remaining) {
            (CooldownState::Idle, 0) => (CooldownState::Idle, false),
            (CooldownState::Counting(_), 0) => (CooldownState::Idle, true),
            (_, n) => (CooldownState::Counting(n), false),
        }
    }

    /// Advance one second. Returns the next state and whether the
    /// cooldown expired on this tick.
    pub fn tick(self) -> (CooldownState, bool) {
        match self {
            CooldownState::Idle => (CooldownState::Idle, false),
            CooldownState::Counting(n) if n <= 1 => (CooldownState::Idle, true),
            CooldownState::Counting(n) => (CooldownState::Counting(n - 1), false),
        }
    }

    pub fn remaining(self) -> u64 {
        match self {
            CooldownState::Idle => 0,
            CooldownState::Counting(n) => n,
        }
    }
}

struct ClockState {
    state: CooldownState,
    /// Bumped on every `set`/`reset`; a ticker with an older value stops.
    generation: u64,
    ticker: Option<JoinHandle<()>>,
}

struct ClockInner {
    state: Mutex<ClockState>,
    remaining: watch::Sender<u64>,
    expired: mpsc::UnboundedSender<()>,
}

/// Tokio-driven cooldown countdown.
///
/// Cloning shares the same clock.
#[derive(Clone)]
pub struct CooldownClock {
    inner: Arc<ClockInner>,
}

impl CooldownClock {
    /// Create an idle clock and the receiver of its expiry signals.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<()>) {
        let (remaining, _) = watch::channel(0);
        let (expired, expired_rx) = mpsc::unbounded_channel();
        let clock = Self {
            inner: Arc::new(ClockInner {
                state: Mutex::new(ClockState {
                    state: CooldownState::Idle,
                    generation: 0,
                    ticker: None,
                }),
                remaining,
                expired,
            }),
        };
        (clock, expired_rx)
    }

    pub fn state(&self) -> CooldownState {
        self.inner.state.lock().state
    }

    pub fn remaining(&self) -> u64 {
        self.state().remaining()
    }

    /// Watch the remaining seconds.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.inner.remaining.subscribe()
    }

    /// Feed a remaining value read from the chain.
    ///
    /// Must be called from within a tokio runtime when `remaining > 0`.
    pub fn set(&self, remaining: u64) {
        let mut guard = self.inner.state.lock();
        let (next, expired) = guard.state.set(remaining);
        if guard.state == CooldownState::Idle && next == CooldownState::Idle {
            return;
        }
        guard.generation += 1;
        if let Some(t) = guard.ticker.take() {
            t.abort();
        }
        guard.state = next;
        self.inner.remaining.send_replace(next.remaining());

        if let CooldownState::Counting(n) = next {
            debug!("cooldown counting from {}s", n);
            let generation = guard.generation;
            let inner = Arc::clone(&self.inner);
            guard.ticker = Some(tokio::spawn(run_ticker(inner, generation)));
        }
        drop(guard);

        if expired {
            debug!("cooldown cleared by chain");
            let _ = self.inner.expired.send(());
        }
    }

    /// Back to Idle without firing expiry.
    pub fn reset(&self) {
        let mut guard = self.inner.state.lock();
        guard.generation += 1;
        if let Some(t) = guard.ticker.take() {
            t.abort();
        }
        guard.state = CooldownState::Idle;
        self.inner.remaining.send_replace(0);
    }
}

async fn run_ticker(inner: Arc<ClockInner>, generation: u64) {
    loop {
        tokio::time::sleep(TICK).await;
        let mut guard = inner.state.lock();
        if guard.generation != generation {
            return;
        }
        let (next, expired) = guard.state.tick();
        guard.state = next;
        inner.remaining.send_replace(next.remaining());
        if expired {
            guard.ticker = None;
            drop(guard);
            debug!("cooldown expired");
            let _ = inner.expired.send(());
            return;
        }
        if next == CooldownState::Idle {
            return;
        }
    }
}

impl std::fmt::Debug for CooldownClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CooldownClock")
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pure_transitions() {
        let (s, fired) = CooldownState::Idle.set(3);
        assert_eq!((s, fired), (CooldownState::Counting(3), false));
        let (s, fired) = s.tick();
        assert_eq!((s, fired), (CooldownState::Counting(2), false));
        let (s, fired) = s.tick();
        assert_eq!((s, fired), (CooldownState::Counting(1), false));
        let (s, fired) = s.tick();
        assert_eq!((s, fired), (CooldownState::Idle, true));
        assert_eq!(s.tick(), (CooldownState::Idle, false));
    }

    #[test]
    fn fresh_value_replaces() {
        assert_eq!(CooldownState::Counting(50).set(120), (CooldownState::Counting(120), false));
        assert_eq!(CooldownState::Counting(50).set(0), (CooldownState::Idle, true));
        assert_eq!(CooldownState::Idle.set(0), (CooldownState::Idle, false));
    }

    #[tokio::test(start_paused = true)]
    async fn three_ticks_then_one_expiry() {
        let (clock, mut expired) = CooldownClock::new();
        clock.set(3);
        assert_eq!(clock.remaining(), 3);

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(clock.state(), CooldownState::Idle);
        assert_eq!(expired.recv().await, Some(()));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(expired.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_never_fires() {
        let (clock, mut expired) = CooldownClock::new();
        clock.set(0);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(clock.state(), CooldownState::Idle);
        assert!(expired.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_while_counting_fires_once() {
        let (clock, mut expired) = CooldownClock::new();
        clock.set(10);
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(clock.remaining(), 8);

        clock.set(0);
        assert_eq!(clock.state(), CooldownState::Idle);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(expired.try_recv().is_ok());

        clock.set(0);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(expired.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_value_restarts_countdown() {
        let (clock, mut expired) = CooldownClock::new();
        let watch = clock.watch();
        clock.set(2);
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(*watch.borrow(), 1);

        clock.set(4);
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(clock.remaining(), 1);
        assert!(expired.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(expired.recv().await, Some(()));
        assert!(expired.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_goes_idle() {
        let (clock, mut expired) = CooldownClock::new();
        clock.set(5);
        clock.reset();
        assert_eq!(clock.remaining(), 0);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(expired.try_recv().is_err());
    }
}
