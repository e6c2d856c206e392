use std::collections::VecDeque;

/// Fixed-capacity sliding window with an O(1) running sum.
///
/// Non-finite values are admitted but kept out of the running sum; while any
/// is inside the window, `mean`, `min` and `max` report NaN.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    values: VecDeque<f64>,
    capacity: usize,
    sum: f64,
    non_finite: usize,
    since_resync: usize,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: VecDeque::with_capacity(capacity + 1),
            capacity,
            sum: 0.0,
            non_finite: 0,
            since_resync: 0,
        }
    }

    /// Append a value, evicting the oldest when full
    pub fn push(&mut self, value: f64) -> Option<f64> {
        self.add(value);
        self.values.push_back(value);

        let evicted = if self.values.len() > self.capacity {
            self.values.pop_front()
        } else {
            None
        };
        if let Some(old) = evicted {
            self.remove(old);
        }

        self.since_resync += 1;
        if self.since_resync >= self.capacity {
            self.resync();
        }

        evicted
    }

    /// Overwrite the newest value (same-period revision)
    pub fn replace_last(&mut self, value: f64) {
        match self.values.pop_back() {
            Some(old) => {
                self.remove(old);
                self.add(value);
                self.values.push_back(value);
            }
            None => {
                self.push(value);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.values.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn last(&self) -> Option<f64> {
        self.values.back().copied()
    }

    pub fn mean(&self) -> f64 {
        if self.values.is_empty() || self.non_finite > 0 {
            return f64::NAN;
        }
        self.sum / self.values.len() as f64
    }

    pub fn min(&self) -> f64 {
        if self.values.is_empty() || self.non_finite > 0 {
            return f64::NAN;
        }
        self.values.iter().copied().fold(f64::INFINITY, f64::min)
    }

    pub fn max(&self) -> f64 {
        if self.values.is_empty() || self.non_finite > 0 {
            return f64::NAN;
        }
        self.values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.values.iter().copied()
    }

    fn add(&mut self, value: f64) {
        if value.is_finite() {
            self.sum += value;
        } else {
            self.non_finite += 1;
        }
    }

    fn remove(&mut self, value: f64) {
        if value.is_finite() {
            self.sum -= value;
        } else {
            self.non_finite -= 1;
        }
    }

    // Bounds floating-point drift of the running sum; amortised O(1).
    fn resync(&mut self) {
        self.sum = self.values.iter().filter(|v| v.is_finite()).sum();
        self.since_resync = 0;
    }
}
