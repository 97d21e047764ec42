//! Proportional-share source selection.
//!
//! Each source earns credit (its score) from accepted shares and loses it on
//! requests, failures and rejected shares. The score decays a little every
//! selection round. A source's metric compares the work it has received
//! (hashes of finished jobs plus jobs still outstanding, minus its
//! guaranteed allowance) against its score; the lowest metric is asked for
//! work next.

use tokio::time::Instant;

use crate::config::BiasConfig;

/// Scheduling state for one source. All hash quantities are in MHashes.
#[derive(Debug, Clone, Default)]
pub struct BiasState {
    pub score: f64,
    /// Work handed out, as a debit: registering a job subtracts its full
    /// nonce range and destroying it gives back whatever was left unhashed.
    pub pending_mhashes: f64,
    /// Credit for work that was fetched but turned out superseded.
    pub deferred_mhashes: f64,
    pub sequential_errors: u32,
    pub lockout_until: Option<Instant>,
}

impl BiasState {
    /// One selection round: decay the score and release deferred credit.
    pub fn decay_round(&mut self, config: &BiasConfig) {
        self.score *= config.decay;
        let release = self.deferred_mhashes * config.deferred_release;
        self.score += release;
        self.deferred_mhashes -= release;
    }

    /// Work received beyond the guaranteed allowance.
    pub fn estimate(&self, uptime_secs: f64, queue_delay_secs: f64, guaranteed_mhps: f64) -> f64 {
        -self.pending_mhashes - (uptime_secs + queue_delay_secs) * guaranteed_mhps
    }

    pub fn is_locked_out(&self, now: Instant) -> bool {
        self.lockout_until.is_some_and(|until| now < until)
    }

    /// Extend the lockout; never shortens an existing one.
    pub fn lock_out_until(&mut self, until: Instant) {
        self.lockout_until = Some(self.lockout_until.map_or(until, |t| t.max(until)));
    }

    /// Forget failures when a source (re)starts.
    pub fn reset_errors(&mut self) {
        self.sequential_errors = 0;
        self.lockout_until = None;
    }
}

/// Selection metric for a source; lower is asked first.
///
/// Sources behind schedule get their (negative) excess. Sources ahead of
/// schedule are spread by priority, and a zero priority sorts last.
pub fn metric(estimate: f64, score: f64, priority: f64) -> f64 {
    let excess = estimate - score;
    if estimate - score.max(0.0) < 0.0 {
        return excess;
    }
    if priority > 0.0 {
        (excess / priority).max(0.0)
    } else {
        f64::INFINITY
    }
}

/// Index of the lowest metric. `None` entries are not eligible; ties go to
/// the earliest entry.
pub fn select(metrics: &[Option<f64>]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (index, metric) in metrics.iter().enumerate() {
        let Some(metric) = *metric else { continue };
        match best {
            Some((_, lowest)) if metric >= lowest => {}
            _ => best = Some((index, metric)),
        }
    }
    best.map(|(index, _)| index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_decay_converges_without_sign_change() {
        let config = BiasConfig::default();
        for start in [5000.0, -5000.0] {
            let mut state = BiasState {
                score: start,
                ..Default::default()
            };
            for _ in 0..100_000 {
                state.decay_round(&config);
                assert_eq!(state.score.signum(), start.signum());
            }
            assert!(state.score.abs() < 1.0);
        }
    }

    #[test]
    fn test_deferred_credit_released_gradually() {
        let config = BiasConfig {
            decay: 1.0,
            ..Default::default()
        };
        let mut state = BiasState {
            deferred_mhashes: 100.0,
            ..Default::default()
        };
        state.decay_round(&config);
        assert!((state.score - 10.0).abs() < 1e-9);
        assert!((state.deferred_mhashes - 90.0).abs() < 1e-9);
        state.decay_round(&config);
        assert!((state.score - 19.0).abs() < 1e-9);
    }

    #[test]
    fn test_metric_ahead_of_schedule_scaled_by_priority() {
        assert_eq!(metric(100.0, 20.0, 2.0), 40.0);
        assert_eq!(metric(100.0, 20.0, 0.0), f64::INFINITY);
    }

    #[test]
    fn test_metric_behind_schedule_is_negative() {
        // Guaranteed hashrate not yet delivered.
        assert_eq!(metric(-50.0, 0.0, 1.0), -50.0);
        // Positive score larger than the work received.
        assert_eq!(metric(10.0, 30.0, 1.0), -20.0);
    }

    #[test]
    fn test_select_lowest_with_stable_ties() {
        assert_eq!(select(&[Some(3.0), Some(1.0), Some(1.0)]), Some(1));
        assert_eq!(select(&[None, Some(f64::INFINITY)]), Some(1));
        assert_eq!(select(&[None, None]), None);
        assert_eq!(select(&[]), None);
    }

    #[test]
    fn test_estimate_includes_outstanding_and_allowance() {
        let state = BiasState {
            pending_mhashes: -5000.0,
            ..Default::default()
        };
        let estimate = state.estimate(10.0, 5.0, 100.0);
        assert!((estimate - 3500.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lockout_only_extends() {
        let now = Instant::now();
        let mut state = BiasState::default();
        state.lock_out_until(now + Duration::from_secs(25));
        state.lock_out_until(now + Duration::from_secs(3));
        assert!(state.is_locked_out(now + Duration::from_secs(10)));
        assert!(!state.is_locked_out(now + Duration::from_secs(25)));

        state.reset_errors();
        assert!(!state.is_locked_out(now));
    }
}
