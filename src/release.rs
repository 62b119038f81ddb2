//! Periodic capacity-release rules.
//!
//! Each rule fires every `interval`, either resetting `used_capacity` to a
//! fixed value or reducing it by a fixed amount. The scheduler disables the
//! rule timers while the queue is empty so an idle scheduler does not keep
//! the process alive; this module computes the catch-up to apply when the
//! timers wake up again, and the residual delays with which to re-arm them.
//!
//! Catch-up with several reset rules is deliberately asymmetric: only the
//! reset with the latest missed firing moment is applied (its value is the
//! one that would have been observed last), while every reset rule still
//! advances its own clock. Reduce rules then only count firings after that
//! moment, since anything earlier was overwritten by the reset anyway.

use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::capacity::CapacityAccountant;
use crate::types::ReleaseRule;

#[derive(Debug)]
struct RuleState {
    rule: ReleaseRule,
    last_applied: Instant,
}

#[derive(Debug, Default)]
pub(crate) struct ReleaseDriver {
    rules: Vec<RuleState>,
}

/// How to arm the periodic timer for one rule after a wake-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RuleTimer {
    pub index: usize,
    pub first_delay: Duration,
    pub interval: Duration,
}

impl ReleaseDriver {
    pub fn new(rules: &[ReleaseRule], now: Instant) -> Self {
        let mut driver = Self::default();
        driver.set_rules(rules, now);
        driver
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Replaces the rule list, carrying over per-rule state for rules whose
    /// record is unchanged. Matching is multiset-style: each surviving old
    /// state is consumed by at most one identical new rule.
    pub fn set_rules(&mut self, new_rules: &[ReleaseRule], now: Instant) {
        let mut old = std::mem::take(&mut self.rules);
        for rule in new_rules {
            let last_applied = match old.iter().position(|s| s.rule == *rule) {
                Some(i) => old.swap_remove(i).last_applied,
                None => now,
            };
            self.rules.push(RuleState {
                rule: rule.clone(),
                last_applied,
            });
        }
    }

    /// Applies one periodic firing of the rule at `index`.
    pub fn apply_fire(&mut self, index: usize, now: Instant, acc: &mut CapacityAccountant) {
        let Some(state) = self.rules.get_mut(index) else {
            return;
        };
        match &state.rule {
            ReleaseRule::Reset { value, .. } => acc.set_used(*value),
            ReleaseRule::Reduce { value, .. } => acc.reduce(*value),
        }
        state.last_applied = now;
        debug!(index, used = acc.used_capacity(), "release rule fired");
    }

    /// Applies all firings missed since the timers were put to sleep.
    /// Returns whether `used_capacity` changed.
    pub fn catch_up(&mut self, now: Instant, acc: &mut CapacityAccountant) -> bool {
        let before = acc.used_capacity();

        // Latest-firing reset wins; the others only advance their clocks.
        let mut winner: Option<(usize, Instant)> = None;
        for (i, state) in self.rules.iter().enumerate() {
            if let ReleaseRule::Reset { interval, .. } = state.rule {
                let missed = intervals_between(state.last_applied, now, interval);
                if missed == 0 {
                    continue;
                }
                let moment = advance(state.last_applied, interval, missed);
                if winner.map_or(true, |(_, best)| moment >= best) {
                    winner = Some((i, moment));
                }
            }
        }
        let reset_moment = winner.map(|(i, moment)| {
            if let ReleaseRule::Reset { value, .. } = self.rules[i].rule {
                acc.set_used(value);
            }
            moment
        });
        for state in &mut self.rules {
            if let ReleaseRule::Reset { interval, .. } = state.rule {
                let missed = intervals_between(state.last_applied, now, interval);
                state.last_applied = advance(state.last_applied, interval, missed);
            }
        }

        for state in &mut self.rules {
            if let ReleaseRule::Reduce { value, interval } = state.rule {
                let missed = intervals_between(state.last_applied, now, interval);
                let moment = advance(state.last_applied, interval, missed);
                let floor = match reset_moment {
                    Some(reset) if reset > state.last_applied => reset,
                    _ => state.last_applied,
                };
                let firings = match moment.checked_duration_since(floor) {
                    Some(span) => intervals_between_duration(span, interval),
                    None => 0,
                };
                if firings > 0 && acc.used_capacity() > 0.0 {
                    acc.reduce(value * firings as f64);
                }
                state.last_applied = moment;
            }
        }

        let changed = acc.used_capacity() != before;
        if changed {
            debug!(
                before,
                after = acc.used_capacity(),
                "release catch-up applied"
            );
        }
        changed
    }

    /// Timer parameters for re-arming every rule after [`Self::catch_up`].
    pub fn arm_schedule(&self, now: Instant) -> Vec<RuleTimer> {
        self.rules
            .iter()
            .enumerate()
            .map(|(index, state)| {
                let interval = state.rule.interval();
                let elapsed = now.saturating_duration_since(state.last_applied);
                RuleTimer {
                    index,
                    first_delay: interval.saturating_sub(elapsed),
                    interval,
                }
            })
            .collect()
    }
}

fn intervals_between(from: Instant, to: Instant, interval: Duration) -> u64 {
    match to.checked_duration_since(from) {
        Some(span) => intervals_between_duration(span, interval),
        None => 0,
    }
}

fn intervals_between_duration(span: Duration, interval: Duration) -> u64 {
    if interval.is_zero() {
        return 0;
    }
    (span.as_nanos() / interval.as_nanos()) as u64
}

fn advance(from: Instant, interval: Duration, n: u64) -> Instant {
    let nanos = interval.as_nanos().saturating_mul(u128::from(n));
    from + Duration::from_nanos(nanos.min(u128::from(u64::MAX)) as u64)
}
