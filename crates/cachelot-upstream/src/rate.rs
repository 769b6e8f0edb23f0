//! Coupled request throttles for the upstream client.
//!
//! Two gates must both open before a request is issued: a minimum
//! inter-request gap and a sliding sixty-second window quota. The arithmetic
//! runs under one mutex; callers sleep outside it.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::trace;

const WINDOW: Duration = Duration::from_secs(60);

/// Throttling parameters resolved from settings.
#[derive(Debug, Clone, Copy)]
pub struct RatePolicy {
    /// Minimum gap between any two requests.
    pub min_gap: Duration,
    /// Maximum requests within any sliding sixty-second window.
    pub max_per_minute: u32,
}

#[derive(Debug, Default)]
struct GateState {
    next_allowed: Option<Instant>,
    window: VecDeque<Instant>,
}

/// Combined rate gate. One instance guards one upstream server.
pub struct RateGate {
    policy: RatePolicy,
    state: Mutex<GateState>,
}

impl RateGate {
    /// Construct a gate for the given policy.
    #[must_use]
    pub fn new(policy: RatePolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(GateState::default()),
        }
    }

    /// Block until both gates allow a request, then record its issue time.
    /// Returns the total wait imposed.
    pub async fn acquire(&self) -> Duration {
        let started = Instant::now();
        loop {
            let now = Instant::now();
            let wait = {
                let mut state = self.lock_state();
                let wait = self.required_wait(&mut state, now);
                if wait.is_zero() {
                    state.next_allowed = Some(now + self.policy.min_gap);
                    state.window.push_back(now);
                    drop(state);
                    let waited = started.elapsed();
                    if !waited.is_zero() {
                        trace!(
                            waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                            "rate gate released"
                        );
                    }
                    return waited;
                }
                wait
            };
            sleep(wait).await;
        }
    }

    fn required_wait(&self, state: &mut GateState, now: Instant) -> Duration {
        let gap_wait = state
            .next_allowed
            .map_or(Duration::ZERO, |at| at.saturating_duration_since(now));

        while let Some(oldest) = state.window.front() {
            if now.saturating_duration_since(*oldest) >= WINDOW {
                state.window.pop_front();
            } else {
                break;
            }
        }
        let quota_wait = if state.window.len() >= self.policy.max_per_minute as usize {
            state
                .window
                .front()
                .map_or(Duration::ZERO, |oldest| {
                    (*oldest + WINDOW).saturating_duration_since(now)
                })
        } else {
            Duration::ZERO
        };

        gap_wait.max(quota_wait)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
