//! Rolling window extrema.
//!
//! Both indicators keep a monotonic deque of `(index, value)` pairs, so an
//! update is O(1) amortized and the current extremum is always the front.

use std::collections::VecDeque;
use trading_core::traits::{Indicator, StreamingIndicator};

#[derive(Debug, Clone)]
struct MonotonicWindow {
    period: usize,
    count: u64,
    deque: VecDeque<(u64, f64)>,
    /// Keeps values for which `keep(existing, new)` holds.
    keep: fn(f64, f64) -> bool,
}

impl MonotonicWindow {
    fn new(period: usize, keep: fn(f64, f64) -> bool) -> Self {
        assert!(period > 0, "Period must be greater than 0");
        Self {
            period,
            count: 0,
            deque: VecDeque::with_capacity(period),
            keep,
        }
    }

    fn push(&mut self, value: f64) {
        while let Some(&(_, back)) = self.deque.back() {
            if (self.keep)(back, value) {
                break;
            }
            self.deque.pop_back();
        }
        self.deque.push_back((self.count, value));
        self.count += 1;

        let oldest_kept = self.count.saturating_sub(self.period as u64);
        while let Some(&(idx, _)) = self.deque.front() {
            if idx >= oldest_kept {
                break;
            }
            self.deque.pop_front();
        }
    }

    fn front(&self) -> Option<f64> {
        self.deque.front().map(|&(_, v)| v)
    }

    fn len(&self) -> usize {
        (self.count as usize).min(self.period)
    }

    fn reset(&mut self) {
        self.count = 0;
        self.deque.clear();
    }
}

/// Rolling maximum over the last `period` values.
#[derive(Debug, Clone)]
pub struct RollingMax {
    window: MonotonicWindow,
}

impl RollingMax {
    /// Create a new rolling maximum.
    pub fn new(period: usize) -> Self {
        Self {
            window: MonotonicWindow::new(period, |existing, new| existing > new),
        }
    }

    /// Maximum of the values currently retained, even before the window is full.
    pub fn value(&self) -> Option<f64> {
        self.window.front()
    }

    /// Number of values currently retained.
    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.len() == 0
    }
}

impl StreamingIndicator for RollingMax {
    type Output = f64;

    fn update(&mut self, value: f64) -> Option<f64> {
        self.window.push(value);
        self.current()
    }

    fn current(&self) -> Option<f64> {
        if self.is_ready() {
            self.value()
        } else {
            None
        }
    }

    fn reset(&mut self) {
        self.window.reset();
    }

    fn is_ready(&self) -> bool {
        self.window.len() >= self.window.period
    }

    fn period(&self) -> usize {
        self.window.period
    }

    fn name(&self) -> &str {
        "RollingMax"
    }
}

impl Indicator for RollingMax {
    type Output = f64;

    fn calculate(&self, data: &[f64]) -> Vec<f64> {
        let mut rolling = RollingMax::new(self.window.period);
        data.iter().filter_map(|&v| rolling.update(v)).collect()
    }

    fn period(&self) -> usize {
        self.window.period
    }

    fn name(&self) -> &str {
        "RollingMax"
    }
}

/// Rolling minimum over the last `period` values.
#[derive(Debug, Clone)]
pub struct RollingMin {
    window: MonotonicWindow,
}

impl RollingMin {
    /// Create a new rolling minimum.
    pub fn new(period: usize) -> Self {
        Self {
            window: MonotonicWindow::new(period, |existing, new| existing < new),
        }
    }

    /// Minimum of the values currently retained, even before the window is full.
    pub fn value(&self) -> Option<f64> {
        self.window.front()
    }

    /// Number of values currently retained.
    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.len() == 0
    }
}

impl StreamingIndicator for RollingMin {
    type Output = f64;

    fn update(&mut self, value: f64) -> Option<f64> {
        self.window.push(value);
        self.current()
    }

    fn current(&self) -> Option<f64> {
        if self.is_ready() {
            self.value()
        } else {
            None
        }
    }

    fn reset(&mut self) {
        self.window.reset();
    }

    fn is_ready(&self) -> bool {
        self.window.len() >= self.window.period
    }

    fn period(&self) -> usize {
        self.window.period
    }

    fn name(&self) -> &str {
        "RollingMin"
    }
}

impl Indicator for RollingMin {
    type Output = f64;

    fn calculate(&self, data: &[f64]) -> Vec<f64> {
        let mut rolling = RollingMin::new(self.window.period);
        data.iter().filter_map(|&v| rolling.update(v)).collect()
    }

    fn period(&self) -> usize {
        self.window.period
    }

    fn name(&self) -> &str {
        "RollingMin"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_rolling_max_basic() {
        let mut max = RollingMax::new(3);
        assert_eq!(max.update(1.0), None);
        assert_eq!(max.update(3.0), None);
        assert_eq!(max.value(), Some(3.0));
        assert_eq!(max.update(2.0), Some(3.0));
        assert_eq!(max.update(1.0), Some(3.0));
        // 3.0 leaves the window
        assert_eq!(max.update(0.5), Some(2.0));
    }

    #[test]
    fn test_rolling_min_basic() {
        let mut min = RollingMin::new(2);
        min.update(5.0);
        assert_eq!(min.update(4.0), Some(4.0));
        assert_eq!(min.update(6.0), Some(4.0));
        assert_eq!(min.update(7.0), Some(6.0));
    }

    #[test]
    fn test_equal_values_are_kept_until_evicted() {
        let mut max = RollingMax::new(2);
        max.update(2.0);
        max.update(2.0);
        assert_eq!(max.update(1.0), Some(2.0));
        assert_eq!(max.update(1.0), Some(1.0));
    }

    #[test]
    fn test_batch_calculate() {
        let data = vec![1.0, 5.0, 2.0, 4.0, 3.0];
        assert_eq!(RollingMax::new(2).calculate(&data), vec![5.0, 5.0, 4.0, 4.0]);
        assert_eq!(RollingMin::new(3).calculate(&data), vec![1.0, 2.0, 2.0]);
    }

    #[test]
    fn test_reset() {
        let mut min = RollingMin::new(2);
        min.update(1.0);
        min.update(2.0);
        min.reset();
        assert!(min.is_empty());
        assert_eq!(min.value(), None);
    }

    proptest! {
        #[test]
        fn prop_extrema_match_naive_window(
            values in prop::collection::vec(-1_000.0f64..1_000.0, 1..200),
            period in 1usize..20,
        ) {
            let mut max = RollingMax::new(period);
            let mut min = RollingMin::new(period);
            for (i, &v) in values.iter().enumerate() {
                max.update(v);
                min.update(v);
                let start = (i + 1).saturating_sub(period);
                let window = &values[start..=i];
                let expected_max = window.iter().cloned().fold(f64::MIN, f64::max);
                let expected_min = window.iter().cloned().fold(f64::MAX, f64::min);
                prop_assert_eq!(max.value(), Some(expected_max));
                prop_assert_eq!(min.value(), Some(expected_min));
                prop_assert_eq!(max.len(), window.len());
            }
        }
    }
}
