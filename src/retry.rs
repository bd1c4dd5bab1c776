// MIT License - Copyright (c) 2021 TJForc
// Bounded polling

use tokio::time::{sleep, Duration};

/// A fixed attempt ceiling with a fixed pause between attempts.
///
/// Every polling loop in the engine (registration, bearer attach, socket
/// open, send prompt, idle reads) is driven by one of these. There is no
/// backoff: the real duration of a loop is bounded by
/// `limit * (delay + per-attempt I/O)`.
///
/// ```
/// use ticket_link::retry::Attempts;
/// use std::time::Duration;
///
/// let mut attempts = Attempts::new(3, Duration::ZERO);
/// let mut tries = 0;
/// while attempts.try_next() {
///     tries += 1;
/// }
/// assert_eq!(tries, 3);
/// assert!(attempts.exhausted());
/// ```
#[derive(Debug, Clone)]
pub struct Attempts {
    limit: u32,
    used: u32,
    delay: Duration,
}

impl Attempts {
    pub fn new(limit: u32, delay: Duration) -> Self {
        Self {
            limit,
            used: 0,
            delay,
        }
    }

    /// Consume one attempt. Returns `false` once the ceiling is reached.
    pub fn try_next(&mut self) -> bool {
        if self.used >= self.limit {
            return false;
        }
        self.used += 1;
        true
    }

    /// Sleep for the fixed inter-attempt delay.
    pub async fn pause(&self) {
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn remaining(&self) -> u32 {
        self.limit - self.used
    }

    pub fn exhausted(&self) -> bool {
        self.used >= self.limit
    }
}

/// Consecutive-empty-read counter used to decide that a peer has gone quiet.
#[derive(Debug, Clone)]
pub struct IdleBudget {
    budget: u32,
    idle: u32,
}

impl IdleBudget {
    pub fn new(budget: u32) -> Self {
        Self { budget, idle: 0 }
    }

    /// Record one read. Data resets the counter, silence advances it.
    pub fn observe(&mut self, got_data: bool) {
        if got_data {
            self.idle = 0;
        } else {
            self.idle += 1;
        }
    }

    pub fn spent(&self) -> bool {
        self.idle >= self.budget
    }
}
