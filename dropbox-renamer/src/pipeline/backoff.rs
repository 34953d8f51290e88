use std::time::Duration;

use rand::Rng;

/// Wait schedule between attempts. Step `n` is `base * 2^n`, capped at `max`;
/// with jitter the wait is drawn from the upper half of the step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    /// Wait after `failures` failed attempts. A server hint replaces the schedule.
    pub fn wait(&self, failures: u32, hint: Option<Duration>) -> Duration {
        self.wait_with_rng(failures, hint, &mut rand::thread_rng())
    }

    pub fn wait_with_rng<R: Rng + ?Sized>(
        &self,
        failures: u32,
        hint: Option<Duration>,
        rng: &mut R,
    ) -> Duration {
        if let Some(hint) = hint {
            return hint;
        }
        let step = 2u32
            .checked_pow(failures)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |step| step.min(self.max));
        if !self.jitter || step.is_zero() {
            return step;
        }
        let floor = step / 2;
        floor + rng.gen_range(Duration::ZERO..=step - floor)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30), true)
    }
}
