use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Admission granted by a breaker for one request. Settle it with
/// [`succeed`](Self::succeed) or [`fail`](Self::fail); dropping it unsettled (a
/// cancelled request) hands a half-open trial slot back to the breaker.
#[derive(Debug)]
#[must_use = "an admission must be settled or dropped"]
pub struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Admission<'_> {
    /// True for the single trial request allowed while half-open.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.on_success();
    }

    /// Returns true when this failure opened (or re-opened) the breaker.
    pub fn fail(mut self) -> bool {
        self.settled = true;
        self.breaker.on_failure(self.trial)
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.trial_in_flight.store(false, Ordering::Release);
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

/// Per-host breaker. Counters are atomics so every worker shares one view without a lock.
#[derive(Debug)]
pub struct CircuitBreaker {
    cfg: BreakerConfig,
    epoch: Instant,
    consecutive_failures: AtomicU32,
    // Millis since `epoch` (+1) until which the breaker stays open; 0 while closed.
    open_until_ms: AtomicU64,
    trial_in_flight: AtomicBool,
    times_opened: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            epoch: Instant::now(),
            consecutive_failures: AtomicU32::new(0),
            open_until_ms: AtomicU64::new(0),
            trial_in_flight: AtomicBool::new(false),
            times_opened: AtomicU64::new(0),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64 + 1
    }

    pub fn state(&self) -> CircuitState {
        let open_until = self.open_until_ms.load(Ordering::Acquire);
        if open_until == 0 {
            CircuitState::Closed
        } else if self.now_ms() < open_until {
            CircuitState::Open
        } else {
            CircuitState::HalfOpen
        }
    }

    /// `None` means the request must short-circuit.
    pub fn try_acquire(&self) -> Option<Admission<'_>> {
        let trial = match self.state() {
            CircuitState::Closed => false,
            CircuitState::Open => return None,
            CircuitState::HalfOpen => {
                self.trial_in_flight
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .ok()?;
                true
            }
        };
        Some(Admission { breaker: self, trial, settled: false })
    }

    fn on_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.open_until_ms.store(0, Ordering::Release);
        self.trial_in_flight.store(false, Ordering::Release);
    }

    fn on_failure(&self, trial: bool) -> bool {
        let cooldown = self.cfg.cooldown.as_millis() as u64;
        if trial {
            self.open_until_ms.store(self.now_ms().saturating_add(cooldown), Ordering::Release);
            self.trial_in_flight.store(false, Ordering::Release);
            self.times_opened.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.cfg.failure_threshold.max(1) {
            self.consecutive_failures.store(0, Ordering::Release);
            self.open_until_ms.store(self.now_ms().saturating_add(cooldown), Ordering::Release);
            self.times_opened.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        false
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn times_opened(&self) -> u64 {
        self.times_opened.load(Ordering::Relaxed)
    }
}

/// Host name -> breaker.
#[derive(Debug, Clone)]
pub struct BreakerRegistry {
    cfg: BreakerConfig,
    breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self { cfg, breakers: Arc::new(DashMap::new()) }
    }

    pub fn for_host(&self, host: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.cfg)))
            .clone()
    }

    pub fn snapshot(&self) -> Vec<(String, CircuitState, u64)> {
        self.breakers
            .iter()
            .map(|e| (e.key().clone(), e.value().state(), e.value().times_opened()))
            .collect()
    }
}
