//! Drift-free periodic scheduling for publisher and service-caller loop ticks. Each timer
//! tracks an absolute next-fire time and advances it by exactly one period per fire, rather than
//! re-deriving it from "now + period" - so a late tick never pushes every subsequent one later.

use std::time::Duration;

pub struct PeriodicTimer {
    period_micros: u64,
    next_fire_at_micros: u64,
}

impl PeriodicTimer {
    pub fn new(period: Duration, start_at_micros: u64) -> PeriodicTimer {
        let period_micros = period.as_micros() as u64;
        PeriodicTimer {
            period_micros,
            next_fire_at_micros: start_at_micros + period_micros,
        }
    }

    /// If `now_micros` has reached the next fire time, advances it by exactly one period and
    /// returns `true`. Only ever fires once per call even if multiple periods have elapsed -
    /// callers that need to catch up call this in a loop.
    pub fn poll(&mut self, now_micros: u64) -> bool {
        if now_micros >= self.next_fire_at_micros {
            self.next_fire_at_micros += self.period_micros;
            true
        } else {
            false
        }
    }

    pub fn next_fire_at_micros(&self) -> u64 {
        self.next_fire_at_micros
    }
}
