//! Link quality estimation
//!
//! RTT samples of one probe round are averaged per device and folded into a
//! smoothed estimate once the round closes.

use crate::route::{Metric, Rem};

/// Samples collected on one device during the current round
#[derive(Debug, Clone, Default)]
pub struct RoundSamples {
    rtt_sum_ms: f64,
    count: u32,
    up_kbps: f64,
    down_kbps: f64,
}

impl RoundSamples {
    pub fn record(&mut self, sample: &Rem) {
        self.rtt_sum_ms += sample.rtt_ms;
        self.count += 1;
        self.up_kbps = sample.up_kbps;
        self.down_kbps = sample.down_kbps;
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Average of the round, `None` if nothing was recorded
    pub fn average(&self) -> Option<Rem> {
        if self.count == 0 {
            return None;
        }
        Some(Rem::new(
            self.rtt_sum_ms / self.count as f64,
            self.up_kbps,
            self.down_kbps,
        ))
    }
}

/// Smoothed quality of one device towards a neighbour
#[derive(Debug, Clone, Default)]
pub struct LinkQuality {
    estimate: Option<Rem>,
    rounds: u32,
}

impl LinkQuality {
    /// Fold a round average into the estimate; the first one is taken as is
    pub fn update(&mut self, metric: &Metric, sample: Rem) -> Rem {
        let next = match &self.estimate {
            Some(old) => metric.fold(old, &sample),
            None => sample,
        };
        self.estimate = Some(next);
        self.rounds += 1;
        next
    }

    pub fn estimate(&self) -> Option<Rem> {
        self.estimate
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_average() {
        let mut round = RoundSamples::default();
        assert!(round.average().is_none());

        round.record(&Rem::new(10.0, 100.0, 200.0));
        round.record(&Rem::new(30.0, 100.0, 200.0));
        let avg = round.average().unwrap();
        assert_eq!(avg.rtt_ms, 20.0);
        assert_eq!(avg.up_kbps, 100.0);
        assert_eq!(round.count(), 2);
    }

    #[test]
    fn test_first_sample_taken_verbatim() {
        let metric = Metric::default();
        let mut quality = LinkQuality::default();
        let first = quality.update(&metric, Rem::new(40.0, 1000.0, 1000.0));
        assert_eq!(first.rtt_ms, 40.0);

        let second = quality.update(&metric, Rem::new(80.0, 1000.0, 1000.0));
        assert_eq!(second.rtt_ms, 60.0);
        assert_eq!(quality.rounds(), 2);
    }
}
