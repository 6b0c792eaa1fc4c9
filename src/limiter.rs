//! Token-bucket admission control for metadata reads
//!
//! A scan of a large proxy cache can issue hundreds of thousands of `stat`
//! calls. The walker takes one token per entry, which bounds sustained
//! throughput to `rate` stats per second with bursts of up to `burst`.
//!
//! Each scan builds and owns its limiter. Sharing one between scans would be
//! a deliberate throttling policy, so nothing here is global.

use crate::error::{Cancelled, ConfigError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default refill rate and burst: 100k stats per second
pub const DEFAULT_STAT_RATE: f64 = 100_000.0;
pub const DEFAULT_STAT_BURST: u32 = 100_000;

/// Upper bound on a single sleep while waiting, so cancellation is noticed promptly
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Time source for the limiter
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall clock backed by `Instant` and `thread::sleep`
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

/// Cooperative cancellation signal shared between a scan and its owner.
///
/// Cloning shares the same flag. The scan only reads it.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Token bucket refilling continuously at `rate` tokens/second, capped at `burst`
#[derive(Debug)]
pub struct Limiter<C: Clock = SystemClock> {
    rate: f64,
    burst: u32,
    tokens: f64,
    last_refill: Instant,
    poll_interval: Duration,
    clock: C,
}

impl Limiter<SystemClock> {
    pub fn new(rate: f64, burst: u32) -> Result<Self, ConfigError> {
        Self::with_clock(rate, burst, SystemClock)
    }
}

impl<C: Clock> Limiter<C> {
    /// Build a limiter on an explicit clock. The bucket starts full.
    pub fn with_clock(rate: f64, burst: u32, clock: C) -> Result<Self, ConfigError> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(ConfigError::InvalidRate(rate.to_string()));
        }
        if burst == 0 {
            return Err(ConfigError::InvalidBurst);
        }

        let last_refill = clock.now();
        Ok(Self {
            rate,
            burst,
            tokens: burst as f64,
            last_refill,
            poll_interval: DEFAULT_POLL_INTERVAL,
            clock,
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_nanos(1));
        self
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Tokens currently in the bucket, after refilling for elapsed time
    pub fn available(&mut self) -> f64 {
        self.refill();
        self.tokens
    }

    /// Block until one token is available and consume it.
    ///
    /// Fails with [`Cancelled`] without consuming a token if `cancel` is
    /// signaled first, including when it was already signaled on entry.
    pub fn acquire(&mut self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        loop {
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }

            self.refill();
            if self.tokens >= 1.0 {
                self.tokens -= 1.0;
                return Ok(());
            }

            let deficit = 1.0 - self.tokens;
            let wait = Duration::try_from_secs_f64(deficit / self.rate)
                .unwrap_or(self.poll_interval)
                .clamp(Duration::from_nanos(1), self.poll_interval);
            self.clock.sleep(wait);
        }
    }

    fn refill(&mut self) {
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst as f64);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    /// Clock that only moves when something sleeps on it
    #[derive(Debug)]
    pub(crate) struct ManualClock {
        base: Instant,
        offset: Cell<Duration>,
        sleeps: RefCell<Vec<Duration>>,
    }

    impl ManualClock {
        pub(crate) fn new() -> Self {
            Self {
                base: Instant::now(),
                offset: Cell::new(Duration::ZERO),
                sleeps: RefCell::new(Vec::new()),
            }
        }

        pub(crate) fn elapsed(&self) -> Duration {
            self.offset.get()
        }

        pub(crate) fn sleep_count(&self) -> usize {
            self.sleeps.borrow().len()
        }
    }

    impl Clock for &ManualClock {
        fn now(&self) -> Instant {
            self.base + self.offset.get()
        }

        fn sleep(&self, duration: Duration) {
            self.offset.set(self.offset.get() + duration);
            self.sleeps.borrow_mut().push(duration);
        }
    }

    #[test]
    fn test_rejects_invalid_configuration() {
        assert!(matches!(Limiter::new(0.0, 10), Err(ConfigError::InvalidRate(_))));
        assert!(matches!(Limiter::new(-5.0, 10), Err(ConfigError::InvalidRate(_))));
        assert!(matches!(Limiter::new(f64::NAN, 10), Err(ConfigError::InvalidRate(_))));
        assert!(matches!(Limiter::new(10.0, 0), Err(ConfigError::InvalidBurst)));
        assert!(Limiter::new(DEFAULT_STAT_RATE, DEFAULT_STAT_BURST).is_ok());
    }

    #[test]
    fn test_burst_is_granted_without_waiting() {
        let clock = ManualClock::new();
        let mut limiter = Limiter::with_clock(10.0, 5, &clock).unwrap();
        let cancel = CancellationToken::new();

        for _ in 0..5 {
            limiter.acquire(&cancel).unwrap();
        }

        assert_eq!(clock.sleep_count(), 0);
        assert!(limiter.available() < 1.0);
    }

    #[test]
    fn test_waits_for_refill_after_burst() {
        let clock = ManualClock::new();
        let mut limiter = Limiter::with_clock(10.0, 1, &clock).unwrap();
        let cancel = CancellationToken::new();

        limiter.acquire(&cancel).unwrap();
        limiter.acquire(&cancel).unwrap();

        // One token at 10/s takes 100ms to refill
        assert!(clock.elapsed() >= Duration::from_millis(99));
        assert!(clock.elapsed() <= Duration::from_millis(101));
    }

    #[test]
    fn test_tokens_never_exceed_burst() {
        let clock = ManualClock::new();
        let mut limiter = Limiter::with_clock(1000.0, 8, &clock).unwrap();

        (&clock).sleep(Duration::from_secs(3600));
        assert_eq!(limiter.available(), 8.0);
    }

    #[test]
    fn test_average_rate_is_bounded() {
        let clock = ManualClock::new();
        let rate = 50.0;
        let burst = 10;
        let mut limiter = Limiter::with_clock(rate, burst, &clock)
            .unwrap()
            .with_poll_interval(Duration::from_secs(1));
        let cancel = CancellationToken::new();

        let total = 510u32;
        for _ in 0..total {
            limiter.acquire(&cancel).unwrap();
        }

        // Everything beyond the initial burst must be paid for at `rate`
        let min_elapsed = (total - burst) as f64 / rate;
        assert!(clock.elapsed().as_secs_f64() >= min_elapsed - 1e-6);
        assert!(clock.elapsed().as_secs_f64() <= min_elapsed + 0.01);
    }

    #[test]
    fn test_cancelled_before_acquire_consumes_nothing() {
        let clock = ManualClock::new();
        let mut limiter = Limiter::with_clock(10.0, 3, &clock).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(limiter.acquire(&cancel), Err(Cancelled));
        assert_eq!(limiter.available(), 3.0);
    }

    #[test]
    fn test_cancel_while_blocked() {
        let mut limiter = Limiter::new(0.001, 1)
            .unwrap()
            .with_poll_interval(Duration::from_millis(5));
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).unwrap();

        let remote = cancel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            remote.cancel();
        });

        let started = Instant::now();
        assert_eq!(limiter.acquire(&cancel), Err(Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_cancellation_token_is_shared_between_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());

        token.cancel();
        assert!(clone.is_cancelled());
    }
}
