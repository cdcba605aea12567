//! Slow-host throttle bookkeeping.
//!
//! Each host's first task is timed; hosts measurably slower than the
//! fleet's fastest then wait briefly before pulling further work, so a
//! fast host is not starved by a slow one racing it to the queue.

use std::cmp;
use std::collections::BTreeMap;
use std::time::Duration;

/// First-task durations across the fleet.
#[derive(Debug, Default)]
pub struct FleetTimings {
    first: BTreeMap<String, Duration>,
    fastest: Option<Duration>,
}

/// Hosts within 10% of the fastest are not delayed at all.
const TOLERANCE_NUMERATOR: u128 = 11;
const TOLERANCE_DENOMINATOR: u128 = 10;

impl FleetTimings {
    /// Records a host's first task duration; later calls for the same host
    /// are ignored.
    pub fn record_first(&mut self, host: &str, duration: Duration) {
        if self.first.contains_key(host) {
            return;
        }
        self.first.insert(host.to_owned(), duration);
        self.fastest = Some(match self.fastest {
            Some(fastest) => cmp::min(fastest, duration),
            None => duration,
        });
    }

    /// Delay a host should observe before pulling its next task, or `None`
    /// when it has no completed task yet or is close enough to the
    /// fleet's fastest. The delay is the host's head start over the
    /// fastest, capped at one full fastest-task duration.
    #[must_use]
    pub fn delay_for(&self, host: &str) -> Option<Duration> {
        let duration = *self.first.get(host)?;
        let fastest = self.fastest?;
        if duration.as_millis() * TOLERANCE_DENOMINATOR < fastest.as_millis() * TOLERANCE_NUMERATOR
        {
            return None;
        }
        let delay = cmp::min(duration.saturating_sub(fastest), fastest);
        if delay.is_zero() { None } else { Some(delay) }
    }
}
