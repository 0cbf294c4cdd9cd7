//! Exponential backoff between failed pipeline open attempts.

use std::time::Duration;

use rand::Rng;

const INITIAL_INTERVAL: Duration = Duration::from_millis(100);
const MAX_INTERVAL: Duration = Duration::from_secs(60);
const MULTIPLIER: u32 = 2;
const RANDOMIZATION_FACTOR: f64 = 0.2;

/// Delay sequence of 100ms, 200ms, 400ms ... capped at 60s, each randomized by ±20%.
#[derive(Debug, Clone, Default)]
pub struct Backoff {
    current: Option<Duration>,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the sequence and returns the randomized delay.
    pub fn next_delay(&mut self) -> Duration {
        let mut rng = rand::thread_rng();
        self.next_delay_with(&mut rng)
    }

    fn next_delay_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let base = match self.current {
            Some(current) => current.saturating_mul(MULTIPLIER).min(MAX_INTERVAL),
            None => INITIAL_INTERVAL,
        };
        self.current = Some(base);
        randomize(base, rng)
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

fn randomize<R: Rng + ?Sized>(base: Duration, rng: &mut R) -> Duration {
    let factor = rng.gen_range((1.0 - RANDOMIZATION_FACTOR)..=(1.0 + RANDOMIZATION_FACTOR));
    base.mul_f64(factor)
}
