//! Simple Moving Average (SMA) over a fixed window.
//!
//! Missing or non-finite values inside a window make that window
//! unsatisfied: the result is absent, never NaN or zero.

use super::IndicatorError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sma {
    period: usize,
    name: String,
    deviation_name: String,
}

impl Sma {
    pub fn new(period: usize) -> Result<Self, IndicatorError> {
        if period == 0 {
            return Err(IndicatorError::ZeroWindow);
        }
        Ok(Self {
            period,
            name: format!("sma_{period}"),
            deviation_name: format!("dev_{period}"),
        })
    }

    pub fn period(&self) -> usize {
        self.period
    }

    /// Stored indicator name, `sma_{period}`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stored deviation name, `dev_{period}`.
    pub fn deviation_name(&self) -> &str {
        &self.deviation_name
    }

    /// Mean of the last `period` values, or `None` when fewer are available
    /// or any of them is missing.
    pub fn window_mean(&self, values: &[Option<f64>]) -> Option<f64> {
        if values.len() < self.period {
            return None;
        }
        let window = &values[values.len() - self.period..];
        let mut sum = 0.0;
        for value in window {
            match value {
                Some(v) if v.is_finite() => sum += v,
                _ => return None,
            }
        }
        let mean = sum / self.period as f64;
        mean.is_finite().then_some(mean)
    }

    /// Mean ending at every index; `None` until the window first fills and
    /// wherever it contains a missing value.
    pub fn rolling(&self, values: &[Option<f64>]) -> Vec<Option<f64>> {
        let n = values.len();
        let mut result = vec![None; n];
        if n < self.period {
            return result;
        }

        // Running sum over valid values plus a count of invalid ones in the window.
        let valid = |v: &Option<f64>| v.filter(|x| x.is_finite());
        let mut sum = 0.0;
        let mut missing = 0usize;
        for value in &values[..self.period] {
            match valid(value) {
                Some(v) => sum += v,
                None => missing += 1,
            }
        }
        if missing == 0 {
            result[self.period - 1] = Some(sum / self.period as f64);
        }

        for i in self.period..n {
            match valid(&values[i - self.period]) {
                Some(v) => sum -= v,
                None => missing -= 1,
            }
            match valid(&values[i]) {
                Some(v) => sum += v,
                None => missing += 1,
            }
            if missing == 0 {
                // Recompute from scratch to keep drift out of long series.
                let exact: f64 = values[i + 1 - self.period..=i].iter().flatten().sum();
                sum = exact;
                result[i] = Some(exact / self.period as f64);
            }
        }

        result
    }
}

/// `(current - mean) / mean`, or `None` when the mean is zero or the
/// result would not be finite.
pub fn deviation_ratio(current: f64, mean: f64) -> Option<f64> {
    if mean == 0.0 || !mean.is_finite() || !current.is_finite() {
        return None;
    }
    let ratio = (current - mean) / mean;
    ratio.is_finite().then_some(ratio)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::{assert_approx, DEFAULT_EPSILON};

    fn some(values: &[f64]) -> Vec<Option<f64>> {
        values.iter().copied().map(Some).collect()
    }

    #[test]
    fn window_mean_uses_last_period_values() {
        let sma = Sma::new(5).unwrap();
        let values = some(&[10.0, 11.0, 12.0, 13.0, 14.0, 15.0, 16.0]);
        // mean(12,13,14,15,16) = 14.0
        assert_approx(sma.window_mean(&values).unwrap(), 14.0, DEFAULT_EPSILON);
    }

    #[test]
    fn window_mean_needs_full_window() {
        let sma = Sma::new(5).unwrap();
        assert_eq!(sma.window_mean(&some(&[1.0, 2.0, 3.0, 4.0])), None);
        assert!(sma.window_mean(&some(&[1.0, 2.0, 3.0, 4.0, 5.0])).is_some());
    }

    #[test]
    fn missing_value_in_window_is_insufficient() {
        let sma = Sma::new(3).unwrap();
        let values = vec![Some(1.0), Some(2.0), None, Some(4.0)];
        assert_eq!(sma.window_mean(&values), None);
        // The gap falls out of the window once it is old enough
        let values = vec![None, Some(2.0), Some(3.0), Some(4.0)];
        assert_approx(sma.window_mean(&values).unwrap(), 3.0, DEFAULT_EPSILON);
    }

    #[test]
    fn rolling_matches_window_mean_at_each_index() {
        let sma = Sma::new(3).unwrap();
        let values = vec![
            Some(10.0),
            Some(11.0),
            None,
            Some(13.0),
            Some(14.0),
            Some(15.0),
        ];
        let rolled = sma.rolling(&values);
        assert_eq!(rolled.len(), values.len());
        for i in 0..values.len() {
            assert_eq!(rolled[i], sma.window_mean(&values[..=i]), "index {i}");
        }
        assert_approx(rolled[5].unwrap(), 14.0, DEFAULT_EPSILON);
    }

    #[test]
    fn names_follow_window() {
        let sma = Sma::new(50).unwrap();
        assert_eq!(sma.name(), "sma_50");
        assert_eq!(sma.deviation_name(), "dev_50");
        assert!(matches!(Sma::new(0), Err(IndicatorError::ZeroWindow)));
    }

    #[test]
    fn deviation_ratio_guards_zero_mean() {
        assert_approx(deviation_ratio(11.0, 10.0).unwrap(), 0.1, DEFAULT_EPSILON);
        assert_approx(deviation_ratio(9.0, 10.0).unwrap(), -0.1, DEFAULT_EPSILON);
        assert_eq!(deviation_ratio(1.0, 0.0), None);
        assert_eq!(deviation_ratio(1.0, f64::NAN), None);
        assert_eq!(deviation_ratio(f64::INFINITY, 1.0), None);
    }
}
