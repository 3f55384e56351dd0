use std::collections::VecDeque;

/// Incremental exponential moving average seeded with the SMA of its first `period` values.
#[derive(Debug, Clone)]
pub struct Ema {
    period: usize,
    multiplier: f64,
    seed: Vec<f64>,
    value: Option<f64>,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        let period = period.max(1);
        Self {
            period,
            multiplier: 2.0 / (period as f64 + 1.0),
            seed: Vec::with_capacity(period),
            value: None,
        }
    }

    pub fn period(&self) -> usize {
        self.period
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    pub fn update(&mut self, price: f64) -> Option<f64> {
        match self.value {
            Some(ema) => {
                self.value = Some((price - ema) * self.multiplier + ema);
            }
            None => {
                self.seed.push(price);
                if self.seed.len() == self.period {
                    let sum: f64 = self.seed.iter().sum();
                    self.value = Some(sum / self.period as f64);
                    self.seed.clear();
                }
            }
        }
        self.value
    }

    pub fn reset(&mut self) {
        self.seed.clear();
        self.value = None;
    }
}

/// Fixed-length window of recent values.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    capacity: usize,
    values: VecDeque<f64>,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            values: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, value: f64) {
        self.values.push_back(value);
        while self.values.len() > self.capacity {
            self.values.pop_front();
        }
    }

    pub fn is_full(&self) -> bool {
        self.values.len() == self.capacity
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn max(&self) -> Option<f64> {
        self.values.iter().copied().reduce(f64::max)
    }

    pub fn min(&self) -> Option<f64> {
        self.values.iter().copied().reduce(f64::min)
    }

    pub fn mean(&self) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        Some(self.values.iter().sum::<f64>() / self.values.len() as f64)
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ema_seeds_with_sma() {
        let mut ema = Ema::new(3);
        assert_eq!(ema.update(1.0), None);
        assert_eq!(ema.update(2.0), None);
        assert_eq!(ema.update(3.0), Some(2.0));
        // k = 0.5
        assert_eq!(ema.update(4.0), Some(3.0));
    }

    #[test]
    fn test_rolling_window_evicts_oldest() {
        let mut window = RollingWindow::new(3);
        for v in [5.0, 1.0, 9.0, 2.0] {
            window.push(v);
        }
        assert!(window.is_full());
        assert_eq!(window.max(), Some(9.0));
        assert_eq!(window.min(), Some(1.0));
        assert_eq!(window.mean(), Some(4.0));
    }
}
