//! Watchdog state machine
//!
//! Healthy -> Degraded on the first breached check, -> HealingTriggered once the
//! breach persists for the configured number of checks, -> Healthy on the next
//! clean check. While still degraded after healing, remediation is requested
//! again each time the current cooldown expires, with the cooldown growing by
//! the backoff multiplier up to its cap.

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WatchdogState {
    Healthy,
    Degraded { checks: u32 },
    HealingTriggered { level: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealingPolicy {
    pub threshold: u32,
    pub cooldown: Duration,
    pub multiplier: f64,
    pub max_cooldown: Duration,
}

#[derive(Debug)]
pub struct HealthStateMachine {
    policy: HealingPolicy,
    state: WatchdogState,
    degraded_checks: u32,
    level: u32,
    last_triggered: Option<Instant>,
}

impl HealthStateMachine {
    pub fn new(policy: HealingPolicy) -> Self {
        Self { policy, state: WatchdogState::Healthy, degraded_checks: 0, level: 0, last_triggered: None }
    }

    pub fn state(&self) -> WatchdogState {
        self.state
    }

    /// Consecutive breached checks so far
    pub fn degraded_checks(&self) -> u32 {
        self.degraded_checks
    }

    /// Cooldown in force at backoff `level`
    pub fn cooldown_for(&self, level: u32) -> Duration {
        let factor = self.policy.multiplier.max(1.0).powi(level.min(32) as i32);
        // Clamp in f64 so a large factor cannot overflow Duration
        let secs = (self.policy.cooldown.as_secs_f64() * factor).min(self.policy.max_cooldown.as_secs_f64());
        Duration::try_from_secs_f64(secs).unwrap_or(self.policy.max_cooldown)
    }

    /// Time left before remediation may be requested again
    pub fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        let last = self.last_triggered?;
        let window = self.cooldown_for(self.level);
        let elapsed = now.saturating_duration_since(last);
        (elapsed < window).then(|| window - elapsed)
    }

    /// Record one check; returns whether remediation should be requested now
    pub fn observe(&mut self, breached: bool, now: Instant) -> bool {
        if !breached {
            self.state = WatchdogState::Healthy;
            self.degraded_checks = 0;
            self.level = 0;
            return false;
        }

        self.degraded_checks += 1;
        match self.state {
            WatchdogState::HealingTriggered { .. } => self.cooldown_remaining(now).is_none(),
            _ => {
                self.state = WatchdogState::Degraded { checks: self.degraded_checks };
                self.degraded_checks >= self.policy.threshold.max(1) && self.cooldown_remaining(now).is_none()
            }
        }
    }

    /// Note that remediation was requested at `now`
    pub fn mark_triggered(&mut self, now: Instant) {
        if let WatchdogState::HealingTriggered { level } = self.state {
            self.level = level.saturating_add(1);
        }
        self.state = WatchdogState::HealingTriggered { level: self.level };
        self.last_triggered = Some(now);
    }
}
