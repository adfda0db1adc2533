/// A free-running tick counter of a fixed bit width.
///
/// The counter wraps to zero after `2^bits - 1`. [CycleTimer::elapsed] takes the modular
/// difference of two samples, so a single wrap between the samples is harmless. More than
/// one wrap between two samples cannot be detected.
#[derive(Debug, Clone)]
pub struct CycleTimer {
    bits: u32,
    count: u64,
}

/// The value of a [CycleTimer] at one program point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerSample(u64);

impl CycleTimer {
    pub fn new(bits: u32) -> Self {
        assert!((1..=64).contains(&bits), "timer width {bits} not in 1..=64");
        CycleTimer { bits, count: 0 }
    }

    /// A timer whose counter starts at `count`; used to place a run near the wrap point.
    pub fn starting_at(bits: u32, count: u64) -> Self {
        let mut timer = CycleTimer::new(bits);
        timer.count = count & timer.mask();
        timer
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn advance(&mut self, ticks: u64) {
        self.count = self.count.wrapping_add(ticks) & self.mask();
    }

    pub fn sample(&self) -> TimerSample {
        TimerSample(self.count)
    }

    /// Ticks from `start` to `end`, modulo the counter width.
    pub fn elapsed(&self, start: TimerSample, end: TimerSample) -> u64 {
        end.0.wrapping_sub(start.0) & self.mask()
    }

    fn mask(&self) -> u64 {
        u64::MAX >> (64 - self.bits)
    }
}

impl TimerSample {
    pub fn ticks(&self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_elapsed_across_a_single_wrap() {
        let mut timer = CycleTimer::starting_at(32, u64::from(u32::MAX) - 2);
        let start = timer.sample();
        timer.advance(10);
        let end = timer.sample();
        assert_eq!(end.ticks(), 7);
        assert_eq!(timer.elapsed(start, end), 10);
    }

    #[test]
    fn test_full_width_timer() {
        let mut timer = CycleTimer::starting_at(64, u64::MAX);
        let start = timer.sample();
        timer.advance(1);
        assert_eq!(timer.elapsed(start, timer.sample()), 1);
    }

    proptest! {
        #[test]
        fn test_elapsed_recovers_advance(
            bits in 1..=64u32,
            initial in any::<u64>(),
            ticks in any::<u64>(),
        ) {
            let mut timer = CycleTimer::starting_at(bits, initial);
            let start = timer.sample();
            timer.advance(ticks);
            let mask = u64::MAX >> (64 - bits);
            prop_assert_eq!(timer.elapsed(start, timer.sample()), ticks & mask);
        }
    }
}
