//! Jittered exponential backoff for retrying transient object-store and
//! document-store failures. See <https://aws.amazon.com/blogs/architecture/exponential-backoff-and-jitter/>.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub init_backoff: Duration,
    pub max_backoff: Duration,
    pub base: f64,
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(20),
            base: 2.0,
            // "6 attempts, jittered" per the retry policy.
            max_attempts: 6,
        }
    }
}

pub struct Backoff {
    init_backoff: f64,
    next_backoff_secs: f64,
    max_backoff_secs: f64,
    base: f64,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        let init_backoff = config.init_backoff.as_secs_f64();
        Self {
            init_backoff,
            next_backoff_secs: init_backoff,
            max_backoff_secs: config.max_backoff.as_secs_f64(),
            base: config.base,
        }
    }

    pub fn next(&mut self) -> Duration {
        let range = self.init_backoff..(self.next_backoff_secs * self.base).max(self.init_backoff + f64::EPSILON);
        let rand_backoff = rand::thread_rng().gen_range(range);
        let next_backoff = self.max_backoff_secs.min(rand_backoff);
        Duration::from_secs_f64(std::mem::replace(&mut self.next_backoff_secs, next_backoff))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_never_exceeds_max() {
        let config = BackoffConfig {
            init_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            base: 4.0,
            max_attempts: 10,
        };
        let mut backoff = Backoff::new(&config);

        for _ in 0..20 {
            let wait = backoff.next();
            assert!(wait >= config.init_backoff);
            assert!(wait <= config.max_backoff);
        }
    }

    #[test]
    fn backoff_grows_from_the_initial_value() {
        let config = BackoffConfig::default();
        let mut backoff = Backoff::new(&config);
        let first = backoff.next();
        assert_eq!(first, config.init_backoff);
    }
}
