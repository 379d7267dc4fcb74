// src/governor.rs
//
// Adaptive probe concurrency.
//
// ─ Architecture ─────────────────────────────────────────────────────────────
//
//   supervisors ──acquire()──> Semaphore (limit N, 1 ≤ N ≤ preset)
//   supervisors ──record_error()──> pending counter
//
//   every 5 s the ticker:
//     pending → window ring (10 slots) → reset pending
//     pending > 5          → N -= 1   (acquire-and-forget: holders keep going)
//     pending < 5/2, N<max → N += 1   (add_permits wakes a waiter)
//     otherwise            → hold
//
// Shrinking never preempts a permit already handed out: the forgotten permit
// is taken from the pool as soon as one frees up.  The window ring is what
// the supervisors consult for the >20-errors sleep penalty.
//
// ────────────────────────────────────────────────────────────────────────────

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Per-tick error count above which the limit shrinks.
pub const ERROR_THRESHOLD: u32 = 5;
/// Ring size of per-tick error counts.
const WINDOW_SLOTS: usize = 10;
/// Controller cadence.
pub const TICK_INTERVAL: Duration = Duration::from_secs(5);
/// Window total past which supervisors take a 60 s sleep penalty.
pub const PENALTY_ERRORS: u32 = 20;

struct GovernorState {
    current: usize,
    preset: usize,
    window: VecDeque<u32>,
    pending: u32,
}

pub struct Governor {
    semaphore: Arc<Semaphore>,
    state: std::sync::Mutex<GovernorState>,
}

impl Governor {
    pub fn new(preset: usize) -> Arc<Self> {
        let preset = preset.max(1);
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(preset)),
            state: std::sync::Mutex::new(GovernorState {
                current: preset,
                preset,
                window: VecDeque::with_capacity(WINDOW_SLOTS),
                pending: 0,
            }),
        })
    }

    /// Wait for a probe slot.  The permit must be dropped before any
    /// long-running recorder supervision begins.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("governor semaphore is never closed")
    }

    /// Count one failed probe toward the current tick.
    pub fn record_error(&self) {
        self.state.lock().unwrap().pending += 1;
    }

    pub fn current_limit(&self) -> usize {
        self.state.lock().unwrap().current
    }

    pub fn preset(&self) -> usize {
        self.state.lock().unwrap().preset
    }

    /// Sum of the error window (last 10 ticks).
    pub fn window_error_total(&self) -> u32 {
        self.state.lock().unwrap().window.iter().sum()
    }

    /// Whether supervisors should stretch their next sleep.
    pub fn penalty_active(&self) -> bool {
        self.window_error_total() > PENALTY_ERRORS
    }

    /// One controller step.  Public so tests (and the ticker task) drive it.
    pub fn tick(&self) {
        let delta: i32 = {
            let mut st = self.state.lock().unwrap();
            let fresh = st.pending;
            st.pending = 0;
            st.window.push_back(fresh);
            while st.window.len() > WINDOW_SLOTS {
                st.window.pop_front();
            }
            if fresh > ERROR_THRESHOLD && st.current > 1 {
                st.current -= 1;
                info!(errors = fresh, limit = st.current, "probe error surge, shrinking concurrency");
                -1
            } else if fresh * 2 < ERROR_THRESHOLD && st.current < st.preset {
                st.current += 1;
                debug!(limit = st.current, "error rate recovered, growing concurrency");
                1
            } else {
                0
            }
        };
        match delta {
            1 => self.semaphore.add_permits(1),
            -1 => match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit.forget(),
                Err(_) => {
                    // All permits are out; retire the next one released.
                    let semaphore = self.semaphore.clone();
                    tokio::spawn(async move {
                        if let Ok(permit) = semaphore.acquire_owned().await {
                            permit.forget();
                        }
                    });
                }
            },
            _ => {}
        }
    }
}

/// Drive `tick` every 5 seconds until shutdown.
pub fn spawn_ticker(governor: Arc<Governor>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + TICK_INTERVAL;
        let mut ticker = tokio::time::interval_at(start, TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => governor.tick(),
            }
        }
    })
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn inject(governor: &Governor, errors: u32) {
        for _ in 0..errors {
            governor.record_error();
        }
    }

    #[tokio::test]
    async fn surge_then_recovery() {
        // Preset 5; 6 errors/tick for 3 ticks: 5→4→3→2, never below 1;
        // then 4 clean ticks: back to 5.
        let governor = Governor::new(5);
        for expected in [4usize, 3, 2] {
            inject(&governor, 6);
            governor.tick();
            assert_eq!(governor.current_limit(), expected);
        }
        for expected in [3usize, 4, 5, 5] {
            governor.tick();
            assert_eq!(governor.current_limit(), expected);
        }
    }

    #[tokio::test]
    async fn limit_never_below_one() {
        let governor = Governor::new(2);
        for _ in 0..5 {
            inject(&governor, 10);
            governor.tick();
        }
        assert_eq!(governor.current_limit(), 1);
    }

    #[tokio::test]
    async fn limit_never_above_preset() {
        let governor = Governor::new(3);
        for _ in 0..5 {
            governor.tick();
        }
        assert_eq!(governor.current_limit(), 3);
    }

    #[tokio::test]
    async fn moderate_rate_holds() {
        let governor = Governor::new(5);
        inject(&governor, 6);
        governor.tick();
        assert_eq!(governor.current_limit(), 4);
        // 3 errors: neither >5 nor <2.5 → hold.
        inject(&governor, 3);
        governor.tick();
        assert_eq!(governor.current_limit(), 4);
    }

    #[tokio::test]
    async fn concurrency_bound_enforced() {
        let governor = Governor::new(2);
        let _p1 = governor.acquire().await;
        let _p2 = governor.acquire().await;
        assert!(governor.semaphore.clone().try_acquire_owned().is_err());
    }

    #[tokio::test]
    async fn shrink_does_not_preempt_holders() {
        let governor = Governor::new(2);
        let p1 = governor.acquire().await;
        let p2 = governor.acquire().await;

        inject(&governor, 6);
        governor.tick();
        assert_eq!(governor.current_limit(), 1);

        // The first release is retired by the pending shrink, not re-issued.
        drop(p1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(governor.semaphore.clone().try_acquire_owned().is_err());

        // The second release is a real slot again.
        drop(p2);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(governor.semaphore.clone().try_acquire_owned().is_ok());
    }

    #[tokio::test]
    async fn window_total_and_penalty() {
        let governor = Governor::new(3);
        for _ in 0..3 {
            inject(&governor, 7);
            governor.tick();
        }
        assert_eq!(governor.window_error_total(), 21);
        assert!(governor.penalty_active());

        // The ring caps at 10 slots.
        for _ in 0..10 {
            governor.tick();
        }
        assert_eq!(governor.window_error_total(), 0);
        assert!(!governor.penalty_active());
    }
}
