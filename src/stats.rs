use std::cmp::Ordering;

pub fn mean_f64(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }

    Some(values.iter().sum::<f64>() / values.len() as f64)
}

pub fn median_f64(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }

    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));

    let mid = values.len() / 2;

    if values.len() % 2 == 0 {
        mean_f64(&values[mid - 1..=mid])
    } else {
        Some(values[mid])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_empty() {
        assert!(mean_f64(&[]).is_none());
    }

    #[test]
    fn test_mean() {
        assert!((mean_f64(&[1.0, 2.0, 3.0]).unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_median_odd() {
        let mut values = vec![9.0, 1.0, 5.0];
        assert!((median_f64(&mut values).unwrap() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_median_even() {
        let mut values = vec![4.0, 1.0, 3.0, 2.0];
        assert!((median_f64(&mut values).unwrap() - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_median_single_outlier() {
        let mut values = vec![50.0, 52.0, 4000.0];
        assert!((median_f64(&mut values).unwrap() - 52.0).abs() < 1e-9);
    }
}
