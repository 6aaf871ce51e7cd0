//! Sample statistics over f64 series

use serde::Serialize;

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation
pub fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let avg = mean(values);
    let variance = values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Linear-interpolated percentile at position (n-1)p of the sorted values
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let pos = (sorted.len() - 1) as f64 * p.clamp(0.0, 1.0);
    let base = pos.floor() as usize;
    let rest = pos - base as f64;
    match sorted.get(base + 1) {
        Some(next) => sorted[base] + rest * (next - sorted[base]),
        None => sorted[base],
    }
}

pub fn max(values: &[f64]) -> f64 {
    values.iter().copied().reduce(f64::max).unwrap_or(0.0)
}

/// Means of `values` bucketed by `keys` at the 33rd/66th key percentiles
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Tertiles {
    pub low: Option<f64>,
    pub medium: Option<f64>,
    pub high: Option<f64>,
}

impl Tertiles {
    pub fn split(keys: &[f64], values: &[f64]) -> Self {
        let low_cut = percentile(keys, 0.33);
        let high_cut = percentile(keys, 0.66);

        let mut buckets: [Vec<f64>; 3] = Default::default();
        for (key, value) in keys.iter().zip(values) {
            let bucket = if *key <= low_cut {
                0
            } else if *key <= high_cut {
                1
            } else {
                2
            };
            buckets[bucket].push(*value);
        }

        let average = |bucket: &Vec<f64>| (!bucket.is_empty()).then(|| mean(bucket));
        Self {
            low: average(&buckets[0]),
            medium: average(&buckets[1]),
            high: average(&buckets[2]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_interpolates() {
        assert_eq!(percentile(&[1.0, 2.0, 3.0, 4.0], 0.5), 2.5);
        assert_eq!(percentile(&[5.0], 0.95), 5.0);
        assert_eq!(percentile(&[4.0, 1.0, 3.0, 2.0], 0.0), 1.0);
        assert_eq!(percentile(&[4.0, 1.0, 3.0, 2.0], 1.0), 4.0);
        assert_eq!(percentile(&[], 0.5), 0.0);
    }

    #[test]
    fn test_mean_and_population_std_dev() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_eq!(mean(&values), 5.0);
        assert_eq!(std_dev(&values), 2.0);
        assert_eq!(std_dev(&[]), 0.0);
        assert_eq!(max(&[-3.0, -1.0, -2.0]), -1.0);
        assert_eq!(max(&[]), 0.0);
    }

    #[test]
    fn test_tertiles() {
        let keys: Vec<f64> = (1..=9).map(f64::from).collect();
        let values: Vec<f64> = keys.iter().map(|k| k * 10.0).collect();
        let t = Tertiles::split(&keys, &values);
        // cuts at 3.64 and 6.28
        assert_eq!(t.low, Some(20.0));
        assert_eq!(t.medium, Some(50.0));
        assert_eq!(t.high, Some(80.0));

        let t = Tertiles::split(&[1.0, 1.0], &[3.0, 5.0]);
        assert_eq!(t.low, Some(4.0));
        assert_eq!(t.medium, None);
        assert_eq!(t.high, None);
    }
}
