//! Shared statistics kit for detection and causal evidence.
//!
//! Everything here is plain slice math. We compute moments in Rust rather
//! than SQL because the SQLite stddev extension is often missing and the
//! detectors need both ddof flavors.

/// Arithmetic mean. Empty input yields 0.0.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation (ddof = 0).
pub fn population_std(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

/// Sample standard deviation (ddof = 1). Fewer than two values yield 0.0.
pub fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var =
        values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

/// Percentile rank of `value` within `values`, mean-of-strict-and-weak
/// flavor: 50 * (count_less + count_less_or_equal) / n.
pub fn percentile_rank(values: &[f64], value: f64) -> f64 {
    if values.is_empty() {
        return 50.0;
    }
    let less = values.iter().filter(|v| **v < value).count() as f64;
    let less_or_equal = values.iter().filter(|v| **v <= value).count() as f64;
    50.0 * (less + less_or_equal) / values.len() as f64
}

/// Pearson correlation of paired samples. None when fewer than two pairs or
/// either side is constant.
pub fn pearson(xs: &[f64], ys: &[f64]) -> Option<f64> {
    let n = xs.len().min(ys.len());
    if n < 2 {
        return None;
    }
    let (xs, ys) = (&xs[..n], &ys[..n]);
    let mx = mean(xs);
    let my = mean(ys);

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for i in 0..n {
        let dx = xs[i] - mx;
        let dy = ys[i] - my;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x == 0.0 || var_y == 0.0 {
        return None;
    }
    Some(cov / (var_x.sqrt() * var_y.sqrt()))
}

/// Welch's t statistic for independent samples with unequal variance.
/// None when either side has fewer than two values or the pooled SE is 0.
pub fn welch_t(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() < 2 || b.len() < 2 {
        return None;
    }
    let sa = sample_std(a);
    let sb = sample_std(b);
    let se = (sa * sa / a.len() as f64 + sb * sb / b.len() as f64).sqrt();
    if se == 0.0 {
        return None;
    }
    Some((mean(a) - mean(b)) / se)
}

/// Standard normal CDF via the Abramowitz-Stegun erf approximation
/// (7.1.26, |error| < 1.5e-7).
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

/// Two-sided p-value for a statistic under the normal approximation.
pub fn two_sided_p(t: f64) -> f64 {
    (2.0 * (1.0 - normal_cdf(t.abs()))).clamp(0.0, 1.0)
}

fn erf(x: f64) -> f64 {
    const A1: f64 = 0.254829592;
    const A2: f64 = -0.284496736;
    const A3: f64 = 1.421413741;
    const A4: f64 = -1.453152027;
    const A5: f64 = 1.061405429;
    const P: f64 = 0.3275911;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t + A3) * t + A2) * t + A1) * t) * (-x * x).exp();
    sign * y
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_moments() {
        let v = [85.0, 86.0, 87.0, 85.0, 86.0, 88.0, 85.0, 87.0, 86.0, 85.0];
        assert!((mean(&v) - 86.0).abs() < 1e-12);
        assert!((population_std(&v) - 1.0).abs() < 1e-12);
        // ddof=1 inflates: sqrt(10/9)
        assert!((sample_std(&v) - (10.0f64 / 9.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_percentile_rank_anchors() {
        let history: Vec<f64> = (1..=100).map(|i| i as f64).collect();
        assert!((percentile_rank(&history, 3.0) - 2.5).abs() < 1e-9);
        assert!((percentile_rank(&history, 8.0) - 7.5).abs() < 1e-9);
        assert!((percentile_rank(&history, 40.0) - 39.5).abs() < 1e-9);
        assert!((percentile_rank(&history, 100.0) - 99.5).abs() < 1e-9);
    }

    #[test]
    fn test_pearson_extremes() {
        let xs = [1.0, 2.0, 3.0, 4.0, 5.0];
        let ys: Vec<f64> = xs.iter().map(|x| 2.0 * x + 1.0).collect();
        let inv: Vec<f64> = xs.iter().map(|x| -x).collect();
        assert!((pearson(&xs, &ys).unwrap() - 1.0).abs() < 1e-9);
        assert!((pearson(&xs, &inv).unwrap() + 1.0).abs() < 1e-9);
        // Constant side has no correlation to speak of
        assert!(pearson(&xs, &[3.0, 3.0, 3.0, 3.0, 3.0]).is_none());
    }

    #[test]
    fn test_welch_separated_groups() {
        let a: Vec<f64> = (0..30).map(|i| 10.0 + (i % 3) as f64 * 0.1).collect();
        let b: Vec<f64> = (0..30).map(|i| 14.0 + (i % 3) as f64 * 0.1).collect();
        let t = welch_t(&a, &b).unwrap();
        assert!(t < -10.0, "clearly separated groups, got t={t}");
        assert!(two_sided_p(t) < 0.001);
    }

    #[test]
    fn test_welch_identical_groups() {
        let a = [5.0, 5.0, 5.0];
        assert!(welch_t(&a, &a).is_none()); // zero pooled SE
    }

    #[test]
    fn test_normal_cdf() {
        assert!((normal_cdf(0.0) - 0.5).abs() < 1e-9);
        assert!((normal_cdf(1.96) - 0.975).abs() < 1e-3);
        assert!((normal_cdf(-1.96) - 0.025).abs() < 1e-3);
        assert!((two_sided_p(1.96) - 0.05).abs() < 2e-3);
    }
}
