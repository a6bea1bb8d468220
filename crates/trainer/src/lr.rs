use crate::error::{Result, TrainError};

/// Decay-on-stall learning-rate policy.
///
/// After every epoch the latest training cost is compared with the mean of
/// the `lookback` epochs before it. When the latest value is higher, training
/// has stalled and the rate is multiplied by `decay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LrPolicy {
    decay: f64,
    lookback: usize,
    min_rate: f64,
}

impl LrPolicy {
    pub fn new(decay: f64, lookback: usize, min_rate: f64) -> Result<Self> {
        if !(decay > 0.0 && decay <= 1.0) {
            return Err(TrainError::Configuration(format!(
                "lr_decay must be in (0, 1], got {}",
                decay
            )));
        }
        if lookback == 0 {
            return Err(TrainError::Configuration("lookback must be at least 1".to_string()));
        }
        if !(min_rate >= 0.0) {
            return Err(TrainError::Configuration(format!(
                "min_learning_rate must be non-negative, got {}",
                min_rate
            )));
        }
        Ok(Self {
            decay,
            lookback,
            min_rate,
        })
    }
}

/// Returns the learning rate for the next epoch.
///
/// `history` holds one training cost per finished epoch, oldest first. The
/// result depends only on the arguments and stays strictly positive for a
/// positive `current`.
pub fn adjust_learning_rate(current: f64, history: &[f64], policy: &LrPolicy) -> f64 {
    let n = history.len();
    if n <= policy.lookback {
        return current;
    }

    let latest = history[n - 1];
    let window = &history[n - 1 - policy.lookback..n - 1];
    let mean = window.iter().sum::<f64>() / window.len() as f64;

    if latest > mean {
        (current * policy.decay)
            .max(policy.min_rate)
            .max(f64::MIN_POSITIVE)
    } else {
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> LrPolicy {
        LrPolicy::new(0.5, 3, 0.0).unwrap()
    }

    #[test]
    fn keeps_rate_until_history_is_long_enough() {
        assert_eq!(adjust_learning_rate(1.0, &[], &policy()), 1.0);
        assert_eq!(adjust_learning_rate(1.0, &[3.0, 2.0, 9.0], &policy()), 1.0);
    }

    #[test]
    fn keeps_rate_while_improving() {
        let history = [4.0, 3.5, 3.0, 2.5];
        assert_eq!(adjust_learning_rate(1.0, &history, &policy()), 1.0);
    }

    #[test]
    fn decays_when_latest_exceeds_window_mean() {
        let history = [4.0, 2.0, 2.0, 2.0, 2.5];
        assert_eq!(adjust_learning_rate(1.0, &history, &policy()), 0.5);
    }

    #[test]
    fn only_the_recent_window_counts() {
        // The old 10.0 falls outside the three-epoch window.
        let history = [10.0, 2.0, 2.0, 2.0, 2.1];
        assert_eq!(adjust_learning_rate(0.8, &history, &policy()), 0.4);
    }

    #[test]
    fn is_pure() {
        let history = vec![1.0, 1.0, 1.0, 2.0];
        let first = adjust_learning_rate(0.3, &history, &policy());
        let second = adjust_learning_rate(0.3, &history, &policy());
        assert_eq!(first, second);
        assert_eq!(history, vec![1.0, 1.0, 1.0, 2.0]);
    }

    #[test]
    fn respects_minimum_and_stays_positive() {
        let floor = LrPolicy::new(0.1, 1, 0.05).unwrap();
        assert_eq!(adjust_learning_rate(0.1, &[1.0, 2.0], &floor), 0.05);

        let no_floor = LrPolicy::new(1e-300, 1, 0.0).unwrap();
        let rate = adjust_learning_rate(1e-300, &[1.0, 2.0], &no_floor);
        assert!(rate > 0.0);
    }

    #[test]
    fn rejects_invalid_parameters() {
        assert!(LrPolicy::new(0.0, 3, 0.0).is_err());
        assert!(LrPolicy::new(1.1, 3, 0.0).is_err());
        assert!(LrPolicy::new(0.5, 0, 0.0).is_err());
        assert!(LrPolicy::new(0.5, 3, -1.0).is_err());
        assert!(LrPolicy::new(f64::NAN, 3, 0.0).is_err());
    }
}
