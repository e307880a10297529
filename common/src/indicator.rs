//! Status LED and blocking delay primitives shared by the bootstrap and
//! update paths.

pub trait Indicator {
    fn set(&mut self, on: bool);
}

pub trait Delay {
    fn delay_ms(&mut self, ms: u64);
}

impl<T: Indicator + ?Sized> Indicator for &mut T {
    fn set(&mut self, on: bool) {
        (**self).set(on)
    }
}

impl<T: Delay + ?Sized> Delay for &mut T {
    fn delay_ms(&mut self, ms: u64) {
        (**self).delay_ms(ms)
    }
}

/// Alternating heartbeat. Each `toggle` drives the indicator to the current
/// phase and flips it, starting with "on".
#[derive(Debug, Clone, Copy)]
pub struct Heartbeat {
    phase: bool,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self { phase: true }
    }
}

impl Heartbeat {
    pub fn toggle(&mut self, indicator: &mut impl Indicator) {
        indicator.set(self.phase);
        self.phase = !self.phase;
    }
}

/// Drive `toggles` alternating levels, waiting `interval_ms` after each one.
pub fn blink(
    indicator: &mut impl Indicator,
    delay: &mut impl Delay,
    toggles: u32,
    interval_ms: u64,
) {
    let mut heartbeat = Heartbeat::default();
    for _ in 0..toggles {
        heartbeat.toggle(indicator);
        delay.delay_ms(interval_ms);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::{RecordingIndicator, VirtualDelay};

    #[test]
    fn blink_alternates_starting_high() {
        let mut indicator = RecordingIndicator::default();
        let mut delay = VirtualDelay::default();

        blink(&mut indicator, &mut delay, 4, 200);

        assert_eq!(indicator.levels, vec![true, false, true, false]);
        assert_eq!(delay.total_ms(), 800);
    }

    #[test]
    fn zero_toggles_is_a_no_op() {
        let mut indicator = RecordingIndicator::default();
        let mut delay = VirtualDelay::default();

        blink(&mut indicator, &mut delay, 0, 200);

        assert!(indicator.levels.is_empty());
        assert_eq!(delay.total_ms(), 0);
    }
}
