/// Wilder-smoothed RSI accumulator.
///
/// Plain `Copy` state so the engine can keep a committed copy for the last
/// closed period and recompute the open period from it on revisions.
#[derive(Debug, Clone, Copy)]
pub struct WilderRsi {
    period: usize,
    prev_close: Option<f64>,
    changes: usize,
    gain_sum: f64,
    loss_sum: f64,
    avg_gain: f64,
    avg_loss: f64,
}

impl WilderRsi {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            prev_close: None,
            changes: 0,
            gain_sum: 0.0,
            loss_sum: 0.0,
            avg_gain: 0.0,
            avg_loss: 0.0,
        }
    }

    /// Feed a close; returns the RSI once `period` changes have been seen.
    ///
    /// A window with neither gains nor losses has no defined RSI and yields
    /// NaN.
    pub fn update(&mut self, close: f64) -> Option<f64> {
        let Some(prev) = self.prev_close.replace(close) else {
            return None;
        };

        let change = close - prev;
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);
        let n = self.period as f64;
        self.changes += 1;

        if self.changes < self.period {
            self.gain_sum += gain;
            self.loss_sum += loss;
            return None;
        }

        if self.changes == self.period {
            self.avg_gain = (self.gain_sum + gain) / n;
            self.avg_loss = (self.loss_sum + loss) / n;
        } else {
            self.avg_gain = (self.avg_gain * (n - 1.0) + gain) / n;
            self.avg_loss = (self.avg_loss * (n - 1.0) + loss) / n;
        }

        Some(self.value())
    }

    pub fn value(&self) -> f64 {
        let total = self.avg_gain + self.avg_loss;
        if self.changes < self.period || total == 0.0 {
            return f64::NAN;
        }
        100.0 * self.avg_gain / total
    }

    pub fn is_seeded(&self) -> bool {
        self.changes >= self.period
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_after_period_changes() {
        let mut rsi = WilderRsi::new(3);
        assert_eq!(rsi.update(10.0), None);
        assert_eq!(rsi.update(11.0), None);
        assert_eq!(rsi.update(10.0), None);
        // gains 1+2, losses 1 -> 75
        let value = rsi.update(12.0).unwrap();
        assert!((value - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_all_gains_is_100() {
        let mut rsi = WilderRsi::new(2);
        rsi.update(1.0);
        rsi.update(2.0);
        assert_eq!(rsi.update(3.0), Some(100.0));
    }

    #[test]
    fn test_flat_prices_are_undefined() {
        let mut rsi = WilderRsi::new(2);
        rsi.update(5.0);
        rsi.update(5.0);
        assert!(rsi.update(5.0).unwrap().is_nan());
    }
}
