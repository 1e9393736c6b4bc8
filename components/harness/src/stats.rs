//! Summary statistics over latency samples.
#![allow(clippy::float_arithmetic)]
use crate::record::serialize_millis;
use failover_concurrency::time;
use serde::{ser::SerializeStruct as _, Serialize, Serializer};

/// Fraction `num / den`, reported both as counts and as a rate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ratio {
    /// Numerator.
    pub num: usize,
    /// Denominator.
    pub den: usize,
}

impl Ratio {
    /// Constructs a ratio.
    pub fn new(num: usize, den: usize) -> Self {
        Self { num, den }
    }

    /// `num / den`, 0 for an empty denominator.
    pub fn rate(&self) -> f64 {
        if self.den == 0 {
            return 0.;
        }
        self.num as f64 / self.den as f64
    }
}

impl Serialize for Ratio {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut st = s.serialize_struct("Ratio", 3)?;
        st.serialize_field("num", &self.num)?;
        st.serialize_field("den", &self.den)?;
        st.serialize_field("rate", &self.rate())?;
        st.end()
    }
}

/// Distribution of latency samples.
///
/// Percentiles are nearest-rank on the sorted samples: the median is the
/// element at `n/2`, p95 at `floor(0.95 n)` and p99 at `floor(0.99 n)`.
/// Percentiles of a single sample are reported as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    /// Number of samples.
    pub count: usize,
    /// Smallest sample.
    #[serde(serialize_with = "serialize_millis")]
    pub min: time::Duration,
    /// Largest sample.
    #[serde(serialize_with = "serialize_millis")]
    pub max: time::Duration,
    /// Arithmetic mean.
    #[serde(serialize_with = "serialize_millis")]
    pub mean: time::Duration,
    /// Median.
    #[serde(serialize_with = "serialize_millis")]
    pub median: time::Duration,
    /// 95th percentile.
    #[serde(serialize_with = "serialize_millis")]
    pub p95: time::Duration,
    /// 99th percentile.
    #[serde(serialize_with = "serialize_millis")]
    pub p99: time::Duration,
    /// Population standard deviation.
    #[serde(serialize_with = "serialize_millis")]
    pub std_dev: time::Duration,
}

impl LatencyStats {
    /// Computes statistics of `samples`. Empty input yields all zeros.
    pub fn compute(samples: impl IntoIterator<Item = time::Duration>) -> Self {
        let mut v: Vec<_> = samples.into_iter().collect();
        if v.is_empty() {
            return Self::default();
        }
        v.sort();
        let n = v.len();
        let total: time::Duration = v.iter().sum();
        let mean = total.as_secs_f64() / n as f64;
        let variance = v
            .iter()
            .map(|d| (d.as_secs_f64() - mean).powi(2))
            .sum::<f64>()
            / n as f64;
        let (p95, p99) = if n > 1 {
            (v[(0.95 * n as f64) as usize], v[(0.99 * n as f64) as usize])
        } else {
            (time::Duration::ZERO, time::Duration::ZERO)
        };
        Self {
            count: n,
            min: v[0],
            max: v[n - 1],
            mean: time::Duration::from_secs_f64(mean),
            median: v[n / 2],
            p95,
            p99,
            std_dev: time::Duration::from_secs_f64(variance.sqrt()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> time::Duration {
        time::Duration::from_millis(n)
    }

    #[test]
    fn empty() {
        assert_eq!(LatencyStats::default(), LatencyStats::compute([]));
        assert_eq!(0., Ratio::new(0, 0).rate());
    }

    #[test]
    fn single_sample() {
        let s = LatencyStats::compute([ms(7)]);
        assert_eq!(1, s.count);
        assert_eq!(ms(7), s.min);
        assert_eq!(ms(7), s.max);
        assert_eq!(ms(7), s.median);
        assert_eq!(time::Duration::ZERO, s.p95);
        assert_eq!(time::Duration::ZERO, s.p99);
        assert_eq!(time::Duration::ZERO, s.std_dev);
    }

    #[test]
    fn percentiles_use_nearest_rank() {
        // Unsorted input: 1..=100 ms reversed.
        let s = LatencyStats::compute((1..=100).rev().map(ms));
        assert_eq!(100, s.count);
        assert_eq!(ms(1), s.min);
        assert_eq!(ms(100), s.max);
        assert_eq!(ms(51), s.median);
        assert_eq!(ms(96), s.p95);
        assert_eq!(ms(100), s.p99);
        assert!(s.mean > ms(50) && s.mean < ms(51));
    }

    #[test]
    fn two_samples() {
        let s = LatencyStats::compute([ms(10), ms(30)]);
        assert_eq!(ms(30), s.median);
        assert_eq!(ms(30), s.p95);
        assert_eq!(ms(30), s.p99);
        assert!(s.std_dev > ms(9) && s.std_dev < ms(11));
    }

    #[test]
    fn ratio() {
        assert_eq!(0.75, Ratio::new(3, 4).rate());
        assert_eq!(
            serde_json::json!({"num": 3, "den": 4, "rate": 0.75}),
            serde_json::to_value(Ratio::new(3, 4)).unwrap()
        );
    }
}
