/// Average True Range with Wilder smoothing.
///
/// Until `period` true ranges are in, the value is their plain mean.
#[derive(Debug, Clone, Copy)]
pub struct WilderAtr {
    period: usize,
    prev_close: Option<f64>,
    count: usize,
    value: f64,
}

impl WilderAtr {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            prev_close: None,
            count: 0,
            value: 0.0,
        }
    }

    pub fn update(&mut self, high: f64, low: f64, close: f64) -> f64 {
        let tr = match self.prev_close {
            Some(prev) => (high - low)
                .max((high - prev).abs())
                .max((low - prev).abs()),
            None => high - low,
        };
        self.prev_close = Some(close);
        self.count += 1;

        let n = if self.count <= self.period { self.count } else { self.period } as f64;
        self.value = (self.value * (n - 1.0) + tr) / n;
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn is_seeded(&self) -> bool {
        self.count >= self.period
    }
}

/// Exponential moving average seeded with the simple mean of the first
/// `period` values.
#[derive(Debug, Clone, Copy)]
pub struct Ema {
    period: usize,
    count: usize,
    value: f64,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            count: 0,
            value: 0.0,
        }
    }

    pub fn update(&mut self, price: f64) -> f64 {
        self.count += 1;
        if self.count <= self.period {
            // running mean doubles as the SMA seed
            self.value += (price - self.value) / self.count as f64;
        } else {
            let k = 2.0 / (self.period as f64 + 1.0);
            self.value = price * k + self.value * (1.0 - k);
        }
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn is_seeded(&self) -> bool {
        self.count >= self.period
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atr_uses_previous_close_for_gaps() {
        let mut atr = WilderAtr::new(2);
        assert_eq!(atr.update(11.0, 9.0, 10.0), 2.0);
        // gap up: high 15 vs prev close 10 -> TR 5
        assert_eq!(atr.update(15.0, 14.0, 14.5), 3.5);
        // Wilder: (3.5 * 1 + 1) / 2
        assert_eq!(atr.update(15.0, 14.0, 14.5), 2.25);
    }

    #[test]
    fn test_ema_seeds_with_sma() {
        let mut ema = Ema::new(3);
        ema.update(1.0);
        ema.update(2.0);
        assert_eq!(ema.update(3.0), 2.0);
        assert!(ema.is_seeded());
        // k = 0.5
        assert_eq!(ema.update(6.0), 4.0);
    }
}
