use statrs::distribution::{Beta, Continuous, Normal};

#[inline]
pub(crate) fn logaddexp(a: f64, b: f64) -> f64 {
    if a == b {
        return a + 2f64.ln();
    }
    let diff = a - b;
    if diff > 0. {
        a + (-diff).exp().ln_1p()
    } else if diff < 0. {
        b + diff.exp().ln_1p()
    } else {
        // diff is NAN
        diff
    }
}

/// `ln(1 + exp(x))` without overflow.
#[inline]
pub(crate) fn softplus(x: f64) -> f64 {
    if x > 0. {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

#[inline]
pub fn expit(x: f64) -> f64 {
    if x >= 0. {
        1. / (1. + (-x).exp())
    } else {
        let e = x.exp();
        e / (1. + e)
    }
}

#[inline]
pub fn logit(p: f64) -> f64 {
    (p / (1. - p)).ln()
}

/// `ln(expit(x))`
#[inline]
pub(crate) fn log_expit(x: f64) -> f64 {
    -softplus(-x)
}

/// `ln(1 - expit(x))`
#[inline]
pub(crate) fn log1m_expit(x: f64) -> f64 {
    -softplus(x)
}

/// Log probability of a Bernoulli outcome. `ln(0)` is `-inf`.
#[inline]
pub(crate) fn bernoulli_logp(success: bool, p: f64) -> f64 {
    if success {
        p.ln()
    } else {
        (-p).ln_1p()
    }
}

pub(crate) fn beta_logpdf(x: f64, a: f64, b: f64) -> f64 {
    if !(0. ..=1.).contains(&x) {
        return f64::NEG_INFINITY;
    }
    Beta::new(a, b).map_or(f64::NAN, |dist| dist.ln_pdf(x))
}

pub(crate) fn normal_logpdf(x: f64, mu: f64, sd: f64) -> f64 {
    Normal::new(mu, sd).map_or(f64::NAN, |dist| dist.ln_pdf(x))
}

/// Mean and (n - 1) variance; NaN for fewer than two values.
pub(crate) fn mean_var(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if values.len() < 2 {
        return (mean, f64::NAN);
    }
    let var = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.);
    (mean, var)
}

/// Linear interpolation quantile of an already sorted slice (R type 7).
pub(crate) fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    #[test]
    fn logaddexp_matches_direct_sum() {
        let x = 10f64;
        let y = 12f64;
        let val = logaddexp(x, y);
        assert_abs_diff_eq!(val, (x.exp() + y.exp()).ln(), epsilon = 1e-10);
    }

    #[test]
    fn beta_uniform_is_flat() {
        assert_abs_diff_eq!(beta_logpdf(0.3, 1., 1.), 0., epsilon = 1e-12);
        assert_eq!(beta_logpdf(1.3, 1., 1.), f64::NEG_INFINITY);
        // Beta(2, 2) at 0.5 has density 1.5
        assert_abs_diff_eq!(beta_logpdf(0.5, 2., 2.), 1.5f64.ln(), epsilon = 1e-10);
    }

    #[test]
    fn normal_density() {
        let standard = -0.5 * (2. * std::f64::consts::PI).ln();
        assert_abs_diff_eq!(normal_logpdf(0., 0., 1.), standard, epsilon = 1e-12);
        assert_abs_diff_eq!(
            normal_logpdf(3., 1., 2.),
            standard - 2f64.ln() - 0.5,
            epsilon = 1e-12
        );
        assert!(normal_logpdf(0., 0., -1.).is_nan());
    }

    #[test]
    fn quantiles() {
        let sorted = [1., 2., 3., 4., 5.];
        assert_abs_diff_eq!(quantile_sorted(&sorted, 0.5), 3.);
        assert_abs_diff_eq!(quantile_sorted(&sorted, 0.25), 2.);
        assert_abs_diff_eq!(quantile_sorted(&sorted, 0.1), 1.4, epsilon = 1e-12);
    }

    proptest! {
        #[test]
        fn expit_in_unit_interval(x in -800f64..800f64) {
            let p = expit(x);
            prop_assert!((0. ..=1.).contains(&p));
            prop_assert!(log_expit(x).is_finite() || x < -700.);
            prop_assert!((log_expit(x).exp() + log1m_expit(x).exp() - 1.).abs() < 1e-9);
        }

        #[test]
        fn logit_inverts_expit(p in 1e-6f64..(1. - 1e-6)) {
            prop_assert!((expit(logit(p)) - p).abs() < 1e-9);
        }
    }
}
