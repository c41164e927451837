use crate::periodic::{Periodic, PeriodicTask};
use crate::session::BenchmarkSession;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Interval between ramp steps, and the delay before the first one.
pub const RAMP_STEP: Duration = Duration::from_secs(60);

/// Linear ramp from 1 to `target` concurrency per operation.
///
/// Each step grants `min(increment, target - current)`, so the target is
/// reached after at most `minutes` steps and never exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RampPlan {
    pub target: usize,
    pub increment_per_minute: usize,
}

impl RampPlan {
    /// Returns `None` when ramping is disabled (`minutes == 0`).
    pub fn new(target: usize, minutes: u32) -> Option<Self> {
        if minutes == 0 {
            return None;
        }
        Some(Self {
            target,
            increment_per_minute: (target / minutes as usize).max(1),
        })
    }

    pub fn next_delta(&self, current: usize) -> usize {
        self.increment_per_minute
            .min(self.target.saturating_sub(current))
    }

    /// Steps needed to climb from the starting concurrency of 1.
    pub fn minutes_to_saturate(&self) -> usize {
        let remaining = self.target.saturating_sub(1);
        remaining.div_ceil(self.increment_per_minute)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampState {
    Idle,
    Ramping,
    Saturated,
}

/// Raises the session's concurrency by one ramp step per minute.
pub struct RampScheduler {
    session: Arc<BenchmarkSession>,
    plan: RampPlan,
    state: RampState,
}

impl RampScheduler {
    /// Returns `None` when the session is configured without a ramp.
    pub fn new(session: Arc<BenchmarkSession>) -> Option<Self> {
        let benchmark = &session.config().benchmark;
        let plan = RampPlan::new(benchmark.max_concurrency, benchmark.ramp_up_minutes)?;
        Some(Self {
            session,
            plan,
            state: RampState::Idle,
        })
    }

    pub fn plan(&self) -> RampPlan {
        self.plan
    }

    pub fn state(&self) -> RampState {
        self.state
    }

    /// Starts stepping after one minute, then every minute.
    pub fn spawn(self) -> PeriodicTask {
        info!(
            "Ramping concurrency to {} by {} per minute (~{} minutes)",
            self.plan.target,
            self.plan.increment_per_minute,
            self.plan.minutes_to_saturate()
        );
        let token = self.session.shutdown_token();
        PeriodicTask::spawn(self, RAMP_STEP, RAMP_STEP, token)
    }

    /// Applies one ramp step and returns the resulting concurrency.
    pub fn step(&mut self) -> usize {
        let current = self.session.concurrency();
        let delta = self.plan.next_delta(current);
        if delta == 0 {
            if self.state != RampState::Saturated {
                info!("Concurrency saturated at {} per operation", current);
            }
            self.state = RampState::Saturated;
            return current;
        }

        let total = self.session.raise_concurrency(delta);
        self.state = if total >= self.plan.target {
            RampState::Saturated
        } else {
            RampState::Ramping
        };
        total
    }
}

impl Periodic for RampScheduler {
    fn name(&self) -> &'static str {
        "ramp scheduler"
    }

    fn tick(&mut self) -> Result<()> {
        self.step();
        Ok(())
    }
}
