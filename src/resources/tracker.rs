//! CPU percentage tracking from cumulative cgroup counters.

use std::time::Instant;

/// Previous cumulative counters, in microseconds.
#[derive(Clone, Copy, Debug)]
struct CpuSample {
    at: Instant,
    user: u64,
    system: u64,
    total: u64,
}

/// Converts cumulative `cpu.stat` counters into percentages between samples.
///
/// Owned by exactly one task; the first sample only primes the tracker and
/// reports zero, since cumulative counters say nothing about the current rate.
#[derive(Debug, Default)]
pub struct CpuTracker {
    previous: Option<CpuSample>,
}

/// User, system and total CPU percentages.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CpuPercent {
    pub user: f64,
    pub system: f64,
    pub total: f64,
}

impl CpuTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn percent(&mut self, user: u64, system: u64, total: u64) -> CpuPercent {
        self.percent_at(Instant::now(), user, system, total)
    }

    pub fn percent_at(&mut self, now: Instant, user: u64, system: u64, total: u64) -> CpuPercent {
        let current = CpuSample {
            at: now,
            user,
            system,
            total,
        };

        let Some(prev) = self.previous.replace(current) else {
            return CpuPercent::default();
        };

        let elapsed = now.saturating_duration_since(prev.at).as_micros();
        CpuPercent {
            user: rate(prev.user, user, elapsed),
            system: rate(prev.system, system, elapsed),
            total: rate(prev.total, total, elapsed),
        }
    }
}

fn rate(before: u64, after: u64, elapsed_usec: u128) -> f64 {
    if elapsed_usec == 0 || after <= before {
        return 0.0;
    }
    (after - before) as f64 / elapsed_usec as f64 * 100.0
}
