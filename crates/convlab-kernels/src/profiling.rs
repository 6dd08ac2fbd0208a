//! Per-operation timing for the convolution layer.
//!
//! Every layer operation runs inside an [`OpTimer`]: start is logged at
//! `trace`, completion with the elapsed wall-clock time at `debug`, both
//! under the `convlab::conv2d` target. Totals accumulate in [`OpStats`].

use convlab_common::{KernelBackend, Operation};
use std::fmt;
use std::time::{Duration, Instant};

pub const LOG_TARGET: &str = "convlab::conv2d";

/// Running timer for one operation.
#[must_use = "call finish() to record the elapsed time"]
pub struct OpTimer {
    op: Operation,
    backend: KernelBackend,
    start: Instant,
}

impl OpTimer {
    pub fn start(op: Operation, backend: KernelBackend) -> Self {
        log::trace!(target: LOG_TARGET, "{op} start backend={backend}");
        Self { op, backend, start: Instant::now() }
    }

    /// Stop the timer, log and record it.
    pub fn finish(self, stats: &mut OpStats) -> Duration {
        let elapsed = self.start.elapsed();
        log::debug!(
            target: LOG_TARGET,
            "{} end backend={} elapsed={:.3}ms",
            self.op,
            self.backend,
            elapsed.as_secs_f64() * 1e3
        );
        stats.record(self.op, elapsed);
        elapsed
    }
}

/// Call count and accumulated time of one operation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OpTiming {
    pub calls: u64,
    pub total: Duration,
}

impl OpTiming {
    pub fn mean(&self) -> Duration {
        if self.calls == 0 { Duration::ZERO } else { self.total / self.calls as u32 }
    }
}

/// Timing totals for forward, backward and update.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OpStats {
    pub forward: OpTiming,
    pub backward: OpTiming,
    pub update: OpTiming,
}

impl OpStats {
    pub fn record(&mut self, op: Operation, elapsed: Duration) {
        let slot = self.slot_mut(op);
        slot.calls += 1;
        slot.total += elapsed;
    }

    /// Add the calls and time recorded in `other`.
    pub fn merge(&mut self, other: &OpStats) {
        for op in [Operation::Forward, Operation::Backward, Operation::Update] {
            let theirs = other.get(op);
            let slot = self.slot_mut(op);
            slot.calls += theirs.calls;
            slot.total += theirs.total;
        }
    }

    fn slot_mut(&mut self, op: Operation) -> &mut OpTiming {
        match op {
            Operation::Forward => &mut self.forward,
            Operation::Backward => &mut self.backward,
            Operation::Update => &mut self.update,
        }
    }

    pub fn get(&self, op: Operation) -> OpTiming {
        match op {
            Operation::Forward => self.forward,
            Operation::Backward => self.backward,
            Operation::Update => self.update,
        }
    }
}

impl fmt::Display for OpStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rows =
            [("forward", self.forward), ("backward", self.backward), ("update", self.update)];
        for (name, t) in rows {
            writeln!(
                f,
                "{name:<9} calls={:<6} total={:.3}ms mean={:.3}ms",
                t.calls,
                t.total.as_secs_f64() * 1e3,
                t.mean().as_secs_f64() * 1e3
            )?;
        }
        Ok(())
    }
}
