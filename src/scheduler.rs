//! Rotation deadlines
//!
//! Two independent single-shot deadlines: the image swap (`changed +
//! waitTime`) and the catalog refresh (`fetched + 7 days`). Deadlines are
//! wall-clock times so a machine waking from sleep sees them as already
//! passed. The engine sleeps until the nearest deadline, capped at
//! [`MAX_TIMER_INTERVAL`], and re-evaluates on every wake-up.

use chrono::{DateTime, Duration as TimeDelta, Utc};
use serde::Serialize;
use std::time::Duration;
use utoipa::ToSchema;

/// Longest single sleep; longer waits are split and re-evaluated
pub const MAX_TIMER_INTERVAL: Duration = Duration::from_millis(i32::MAX as u64);

/// How long a fetched catalog stays current
pub fn refresh_period() -> TimeDelta {
    TimeDelta::days(7)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TimerKind {
    /// Show another cached image
    Swap,
    /// Download a new catalog
    Refresh,
}

/// Outcome of arming a deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arming {
    /// Deadline already passed: run the action on the next turn
    Immediate,
    /// Timer armed; fires after this delay
    Scheduled(Duration),
}

/// Swap deadline; a missing timestamp is treated as long past
pub fn swap_deadline(changed: Option<DateTime<Utc>>, wait: TimeDelta) -> Option<DateTime<Utc>> {
    changed.map(|c| c + wait)
}

/// Refresh deadline; a missing timestamp is treated as long past
pub fn refresh_deadline(fetched: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    fetched.map(|f| f + refresh_period())
}

#[derive(Debug, Default)]
pub struct RotationScheduler {
    swap: Option<DateTime<Utc>>,
    refresh: Option<DateTime<Utc>>,
}

impl RotationScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&mut self, kind: TimerKind) -> &mut Option<DateTime<Utc>> {
        match kind {
            TimerKind::Swap => &mut self.swap,
            TimerKind::Refresh => &mut self.refresh,
        }
    }

    pub fn deadline(&self, kind: TimerKind) -> Option<DateTime<Utc>> {
        match kind {
            TimerKind::Swap => self.swap,
            TimerKind::Refresh => self.refresh,
        }
    }

    /// Replace the deadline for `kind`
    ///
    /// A deadline that is missing or not in the future leaves the timer
    /// disarmed and returns [`Arming::Immediate`]; the caller runs the action.
    pub fn arm(
        &mut self,
        kind: TimerKind,
        deadline: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Arming {
        let slot = self.slot(kind);
        match deadline {
            Some(at) if at > now => {
                *slot = Some(at);
                let delay = (at - now).to_std().unwrap_or(Duration::ZERO);
                tracing::debug!("Armed {:?} timer for {} ({:?})", kind, at, delay);
                Arming::Scheduled(delay)
            }
            _ => {
                *slot = None;
                Arming::Immediate
            }
        }
    }

    pub fn disarm(&mut self, kind: TimerKind) {
        *self.slot(kind) = None;
    }

    pub fn disarm_all(&mut self) {
        self.swap = None;
        self.refresh = None;
    }

    pub fn is_idle(&self) -> bool {
        self.swap.is_none() && self.refresh.is_none()
    }

    /// Time to sleep before the next evaluation, `None` when nothing is armed
    pub fn next_wakeup(&self, now: DateTime<Utc>) -> Option<Duration> {
        [self.swap, self.refresh]
            .into_iter()
            .flatten()
            .min()
            .map(|at| {
                (at - now)
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .min(MAX_TIMER_INTERVAL)
            })
    }

    /// Disarm and return every timer whose deadline has been reached
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<TimerKind> {
        let mut due = Vec::new();
        for kind in [TimerKind::Refresh, TimerKind::Swap] {
            let slot = self.slot(kind);
            if slot.is_some_and(|at| at <= now) {
                *slot = None;
                due.push(kind);
            }
        }
        due
    }
}
