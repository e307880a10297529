use log::debug;

pub trait Clock {
    fn now_ms(&self) -> u64;
}

impl<T: Clock + ?Sized> Clock for &T {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }
}

/// Fixed-period trigger for the sampling cycle. It only decides *when*;
/// the caller runs the cycle to completion before polling again, so ticks
/// never overlap. Ticks missed while a cycle overran are dropped, and the
/// schedule stays on its original phase.
#[derive(Debug, Clone)]
pub struct SamplingScheduler {
    period_ms: u64,
    next_due_ms: Option<u64>,
    fired: u64,
}

impl SamplingScheduler {
    pub fn new(period_ms: u64) -> Self {
        Self {
            period_ms: period_ms.max(1),
            next_due_ms: None,
            fired: 0,
        }
    }

    /// Arm the schedule; the first tick is due one period after `now_ms`.
    pub fn start(&mut self, now_ms: u64) {
        self.next_due_ms = Some(now_ms.saturating_add(self.period_ms));
    }

    pub fn is_running(&self) -> bool {
        self.next_due_ms.is_some()
    }

    pub fn period_ms(&self) -> u64 {
        self.period_ms
    }

    pub fn next_due_ms(&self) -> Option<u64> {
        self.next_due_ms
    }

    pub fn ticks_fired(&self) -> u64 {
        self.fired
    }

    /// Returns true when a tick is due at `now_ms` and advances the schedule.
    pub fn poll(&mut self, now_ms: u64) -> bool {
        let Some(due) = self.next_due_ms else {
            return false;
        };
        if now_ms < due {
            return false;
        }

        let missed = (now_ms - due) / self.period_ms;
        if missed > 0 {
            debug!("sampling tick late by {} ms; dropping {missed} tick(s)", now_ms - due);
        }
        self.next_due_ms = Some(due.saturating_add((missed + 1).saturating_mul(self.period_ms)));
        self.fired = self.fired.saturating_add(1);
        true
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn idle_until_started() {
        let mut scheduler = SamplingScheduler::new(5_000);
        assert!(!scheduler.poll(1_000_000));
        assert!(!scheduler.is_running());
    }

    #[test]
    fn fires_once_per_period() {
        let mut scheduler = SamplingScheduler::new(5_000);
        scheduler.start(0);

        let fired: Vec<u64> = (0..=20_000)
            .step_by(50)
            .filter(|&now| scheduler.poll(now))
            .collect();

        assert_eq!(fired, vec![5_000, 10_000, 15_000, 20_000]);
        assert_eq!(scheduler.ticks_fired(), 4);
    }

    #[test]
    fn overrun_delays_next_tick_without_queueing() {
        let mut scheduler = SamplingScheduler::new(5_000);
        scheduler.start(0);

        assert!(scheduler.poll(5_000));
        // The cycle blocked until 17_300: one late tick, no burst.
        assert!(scheduler.poll(17_300));
        assert!(!scheduler.poll(17_350));
        assert_eq!(scheduler.next_due_ms(), Some(20_000));
        assert!(scheduler.poll(20_000));
        assert_eq!(scheduler.ticks_fired(), 3);
    }

    #[test]
    fn zero_period_is_clamped() {
        let scheduler = SamplingScheduler::new(0);
        assert_eq!(scheduler.period_ms(), 1);
    }
}
