//! Deadline/interval convergence engine
//!
//! The external system under test reaches its expected state asynchronously,
//! so every assertion about it is phrased as "re-check until true or give up".
//! The engine here owns only the timing: predicates refresh their own observed
//! state (re-running a CLI command, issuing an HTTP GET) and must be
//! idempotent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{Error, Result};

/// Time source seam so the engine can be driven by a fake clock in tests.
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall-clock time with real thread sleeps
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Cloneable flag that aborts an in-flight poll between evaluations.
///
/// Sessions hand their token to teardown so long waits do not outlive the
/// scenario that started them.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of one evaluation of a poll step
pub enum Step<T> {
    /// Converged; stop polling and yield the value
    Done(T),
    /// Not there yet; the diagnostic is surfaced if the deadline passes
    Retry(String),
    /// Terminal failure; stop polling immediately
    Abort(Error),
}

/// Re-evaluates a step on a fixed interval until it converges or a deadline
/// elapses.
///
/// The first evaluation happens immediately, sleeps are capped at the
/// remaining budget so the final evaluation lands at the deadline, and the
/// step is therefore evaluated at least twice even when `interval >= timeout`.
pub struct Poller<C = SystemClock> {
    clock: C,
    cancel: CancelToken,
}

impl Poller<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for Poller<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> Poller<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            cancel: CancelToken::new(),
        }
    }

    /// Replace the poller's cancellation token, typically with one shared by
    /// a session's teardown.
    pub fn cancel_with(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Drive `step` until it yields [`Step::Done`], aborts, is cancelled, or
    /// `timeout` elapses. On success returns the value plus elapsed time.
    pub fn poll<T>(
        &self,
        timeout: Duration,
        interval: Duration,
        mut step: impl FnMut() -> Step<T>,
    ) -> Result<(T, Duration)> {
        let start = self.clock.now();
        let mut last = String::from("condition not yet evaluated");

        loop {
            match step() {
                Step::Done(value) => {
                    let elapsed = self.clock.now().saturating_duration_since(start);
                    debug!(?elapsed, "condition met");
                    return Ok((value, elapsed));
                }
                Step::Retry(diagnostic) => last = diagnostic,
                Step::Abort(err) => return Err(err),
            }

            if self.cancel.is_cancelled() {
                return Err(Error::PollCancelled { last });
            }

            let elapsed = self.clock.now().saturating_duration_since(start);
            if elapsed >= timeout {
                return Err(Error::PollTimeout {
                    waited: elapsed,
                    last,
                });
            }

            self.clock.sleep(interval.min(timeout - elapsed));
        }
    }

    /// Boolean-predicate form: the predicate reports convergence plus a
    /// diagnostic explaining what it last observed. Returns elapsed time on
    /// success.
    pub fn wait_for(
        &self,
        timeout: Duration,
        interval: Duration,
        mut predicate: impl FnMut() -> (bool, String),
    ) -> Result<Duration> {
        let ((), elapsed) = self.poll(timeout, interval, || {
            let (met, diagnostic) = predicate();
            if met {
                Step::Done(())
            } else {
                Step::Retry(diagnostic)
            }
        })?;
        Ok(elapsed)
    }
}

/// Convenience wrapper over [`Poller::wait_for`] with the system clock.
pub fn wait_for(
    predicate: impl FnMut() -> (bool, String),
    timeout: Duration,
    interval: Duration,
) -> Result<Duration> {
    Poller::new().wait_for(timeout, interval, predicate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Deterministic clock: `sleep` advances simulated time instantly.
    #[derive(Clone)]
    struct FakeClock {
        base: Instant,
        offset: Arc<Mutex<Duration>>,
    }

    impl FakeClock {
        fn new() -> Self {
            Self {
                base: Instant::now(),
                offset: Arc::new(Mutex::new(Duration::ZERO)),
            }
        }

        fn elapsed(&self) -> Duration {
            *self.offset.lock()
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> Instant {
            self.base + *self.offset.lock()
        }

        fn sleep(&self, duration: Duration) {
            *self.offset.lock() += duration;
        }
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn evaluates_at_least_twice_when_interval_exceeds_timeout() {
        let clock = FakeClock::new();
        let poller = Poller::with_clock(clock.clone());
        let mut evaluations = 0;

        let err = poller
            .wait_for(secs(1), secs(5), || {
                evaluations += 1;
                (false, format!("attempt {evaluations}"))
            })
            .unwrap_err();

        // Once at t=0 and once at the deadline; the sleep is capped there.
        assert_eq!(evaluations, 2);
        assert_eq!(clock.elapsed(), secs(1));
        match err {
            Error::PollTimeout { waited, last } => {
                assert_eq!(waited, secs(1));
                assert_eq!(last, "attempt 2");
            }
            other => panic!("expected PollTimeout, got {other:?}"),
        }
    }

    #[test]
    fn succeeds_one_interval_after_condition_flips() {
        // Condition flips true at t=3s; timeout 10s, interval 1s.
        let clock = FakeClock::new();
        let poller = Poller::with_clock(clock.clone());

        let probe = clock.clone();
        let elapsed = poller
            .wait_for(secs(10), secs(1), || {
                (probe.elapsed() >= secs(3), format!("at {:?}", probe.elapsed()))
            })
            .unwrap();

        assert!(elapsed >= secs(3) && elapsed < secs(4), "elapsed {elapsed:?}");
    }

    #[test]
    fn returns_within_timeout_plus_interval() {
        let clock = FakeClock::new();
        let poller = Poller::with_clock(clock.clone());

        let err = poller
            .wait_for(secs(1), Duration::from_millis(700), || {
                (false, "still waiting".into())
            })
            .unwrap_err();

        assert!(matches!(err, Error::PollTimeout { .. }));
        assert!(clock.elapsed() <= secs(1) + Duration::from_millis(700));
    }

    #[test]
    fn timeout_surfaces_most_recent_diagnostic() {
        let clock = FakeClock::new();
        let poller = Poller::with_clock(clock);
        let mut n = 0;

        let err = poller
            .wait_for(secs(3), secs(1), || {
                n += 1;
                (false, format!("saw {n} containers"))
            })
            .unwrap_err();

        match err {
            Error::PollTimeout { last, .. } => assert_eq!(last, "saw 4 containers"),
            other => panic!("expected PollTimeout, got {other:?}"),
        }
    }

    #[test]
    fn cancellation_stops_the_poll() {
        let clock = FakeClock::new();
        let poller = Poller::with_clock(clock);
        let token = poller.cancel_token();
        let mut evaluations = 0;

        let err = poller
            .wait_for(secs(60), secs(1), || {
                evaluations += 1;
                if evaluations == 2 {
                    token.cancel();
                }
                (false, format!("attempt {evaluations}"))
            })
            .unwrap_err();

        assert_eq!(evaluations, 2);
        match err {
            Error::PollCancelled { last } => assert_eq!(last, "attempt 2"),
            other => panic!("expected PollCancelled, got {other:?}"),
        }
    }

    #[test]
    fn abort_short_circuits_with_the_step_error() {
        let clock = FakeClock::new();
        let poller = Poller::with_clock(clock.clone());

        let err = poller
            .poll(secs(10), secs(1), || -> Step<()> {
                Step::Abort(Error::ProbeFailed {
                    url: "http://localhost:90".into(),
                    reason: "dns failure".into(),
                })
            })
            .unwrap_err();

        assert!(matches!(err, Error::ProbeFailed { .. }));
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[test]
    fn sleeps_are_capped_at_the_remaining_budget() {
        let clock = FakeClock::new();
        let poller = Poller::with_clock(clock.clone());
        let mut evaluations = 0;

        let _ = poller.wait_for(secs(1), Duration::from_millis(700), || {
            evaluations += 1;
            (false, String::new())
        });

        // Evaluations at t=0, t=700ms and t=1s.
        assert_eq!(evaluations, 3);
        assert_eq!(clock.elapsed(), secs(1));
    }
}
