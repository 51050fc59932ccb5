//! Standard normal distribution helpers.

/// Complementary error function.
///
/// Chebyshev fit with fractional error below `1.2e-7` everywhere.
#[must_use]
#[allow(clippy::unreadable_literal, clippy::suboptimal_flops)]
pub fn erfc(x: f64) -> f64 {
    let z = x.abs();
    let t = 1.0 / (1.0 + 0.5 * z);
    let poly = -z * z - 1.26551223
        + t * (1.00002368
            + t * (0.37409196
                + t * (0.09678418
                    + t * (-0.18628806
                        + t * (0.27886807
                            + t * (-1.13520398
                                + t * (1.48851587 + t * (-0.82215223 + t * 0.17087277))))))));
    let ans = t * poly.exp();
    if x >= 0.0 { ans } else { 2.0 - ans }
}

/// Standard normal cumulative distribution function.
#[must_use]
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * erfc(-x / std::f64::consts::SQRT_2)
}

/// Two-sided p-value of a standard normal z-score.
#[must_use]
pub fn two_sided_p_value(z: f64) -> f64 {
    erfc(z.abs() / std::f64::consts::SQRT_2).clamp(0.0, 1.0)
}

/// Inverse of [`normal_cdf`] (Acklam's rational approximation, relative
/// error below `1.2e-9`).
///
/// Returns `-inf`/`inf` at 0 and 1 and `NaN` outside `[0, 1]`.
#[must_use]
#[allow(clippy::unreadable_literal, clippy::suboptimal_flops)]
pub fn normal_quantile(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969683028665376e+01,
        2.209460984245205e+02,
        -2.759285104469687e+02,
        1.383577518672690e+02,
        -3.066479806614716e+01,
        2.506628277459239e+00,
    ];
    const B: [f64; 5] = [
        -5.447609879822406e+01,
        1.615858368580409e+02,
        -1.556989798598866e+02,
        6.680131188771972e+01,
        -1.328068155288572e+01,
    ];
    const C: [f64; 6] = [
        -7.784894002430293e-03,
        -3.223964580411365e-01,
        -2.400758277161838e+00,
        -2.549732539343734e+00,
        4.374664141464968e+00,
        2.938163982698783e+00,
    ];
    const D: [f64; 4] = [
        7.784695709041462e-03,
        3.224671290700398e-01,
        2.445134137142996e+00,
        3.754408661907416e+00,
    ];
    const P_LOW: f64 = 0.02425;

    if !(0.0..=1.0).contains(&p) {
        return f64::NAN;
    }
    if p == 0.0 {
        return f64::NEG_INFINITY;
    }
    if (p - 1.0).abs() < f64::EPSILON {
        return f64::INFINITY;
    }

    let tail = |q: f64| {
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    };

    if p < P_LOW {
        tail((-2.0 * p.ln()).sqrt())
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        -tail((-2.0 * (1.0 - p).ln()).sqrt())
    }
}

/// A finite mixture of normal distributions.
///
/// Used for marginal posteriors obtained by integrating conditional
/// Gaussian approximations over a hyperparameter grid.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalMixture {
    /// `(weight, mean, standard deviation)`; weights sum to one.
    components: Vec<(f64, f64, f64)>,
}

impl NormalMixture {
    /// Creates a mixture, normalizing the weights. Components with
    /// non-positive weight are dropped.
    ///
    /// Returns `None` when no component has positive weight.
    #[must_use]
    pub fn new(components: impl IntoIterator<Item = (f64, f64, f64)>) -> Option<Self> {
        let components: Vec<_> = components
            .into_iter()
            .filter(|(w, _, _)| *w > 0.0 && w.is_finite())
            .collect();
        let total: f64 = components.iter().map(|(w, _, _)| w).sum();
        if components.is_empty() || total <= 0.0 {
            return None;
        }
        Some(Self {
            components: components
                .into_iter()
                .map(|(w, m, s)| (w / total, m, s.max(0.0)))
                .collect(),
        })
    }

    /// Mixture mean.
    #[must_use]
    pub fn mean(&self) -> f64 {
        self.components.iter().map(|(w, m, _)| w * m).sum()
    }

    /// Mixture standard deviation.
    #[must_use]
    pub fn std_dev(&self) -> f64 {
        let mean = self.mean();
        let second: f64 = self
            .components
            .iter()
            .map(|(w, m, s)| w * (s * s + m * m))
            .sum();
        (second - mean * mean).max(0.0).sqrt()
    }

    /// Mixture cumulative distribution function.
    #[must_use]
    pub fn cdf(&self, x: f64) -> f64 {
        self.components
            .iter()
            .map(|&(w, m, s)| {
                if s > 0.0 {
                    w * normal_cdf((x - m) / s)
                } else if x >= m {
                    w
                } else {
                    0.0
                }
            })
            .sum()
    }

    /// Quantile by bisection on [`Self::cdf`].
    #[must_use]
    pub fn quantile(&self, p: f64) -> f64 {
        let p = p.clamp(0.0, 1.0);
        let mut lo = self
            .components
            .iter()
            .map(|(_, m, s)| m - 12.0 * s)
            .fold(f64::INFINITY, f64::min);
        let mut hi = self
            .components
            .iter()
            .map(|(_, m, s)| m + 12.0 * s)
            .fold(f64::NEG_INFINITY, f64::max);

        for _ in 0..200 {
            let mid = 0.5 * (lo + hi);
            if self.cdf(mid) < p {
                lo = mid;
            } else {
                hi = mid;
            }
            if hi - lo <= 1e-12 * (1.0 + mid.abs()) {
                break;
            }
        }

        0.5 * (lo + hi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cdf_reference_points() {
        assert!((normal_cdf(0.0) - 0.5).abs() < 1e-7);
        assert!((normal_cdf(1.959_964) - 0.975).abs() < 1e-6);
        assert!((normal_cdf(-1.0) - 0.158_655_25).abs() < 1e-6);
    }

    #[test]
    fn two_sided_p_is_symmetric() {
        assert!((two_sided_p_value(1.959_964) - 0.05).abs() < 1e-6);
        assert!((two_sided_p_value(-2.5) - two_sided_p_value(2.5)).abs() < 1e-15);
        assert!((two_sided_p_value(0.0) - 1.0).abs() < 1e-7);
    }

    #[test]
    fn quantile_inverts_cdf() {
        for p in [0.001, 0.025, 0.2, 0.5, 0.8, 0.975, 0.999] {
            let x = normal_quantile(p);
            assert!(
                (normal_cdf(x) - p).abs() < 1e-6,
                "quantile({p}) = {x} does not invert"
            );
        }
        assert!((normal_quantile(0.975) - 1.959_964).abs() < 1e-5);
    }

    #[test]
    fn quantile_edges() {
        assert!(normal_quantile(0.0).is_infinite());
        assert!(normal_quantile(1.0).is_infinite());
        assert!(normal_quantile(1.5).is_nan());
    }

    #[test]
    fn single_component_mixture_matches_normal() {
        let mix = NormalMixture::new([(1.0, 2.0, 0.5)]).expect("one component");
        assert!((mix.mean() - 2.0).abs() < 1e-12);
        assert!((mix.std_dev() - 0.5).abs() < 1e-12);
        let upper = mix.quantile(0.975);
        assert!((upper - (2.0 + 0.5 * 1.959_964)).abs() < 1e-5);
    }

    #[test]
    fn mixture_weights_are_normalized() {
        let mix = NormalMixture::new([(2.0, -1.0, 1.0), (2.0, 1.0, 1.0), (0.0, 50.0, 1.0)])
            .expect("positive weights");
        assert!(mix.mean().abs() < 1e-12);
        assert!((mix.quantile(0.5)).abs() < 1e-6);
        assert!(NormalMixture::new([(0.0, 1.0, 1.0)]).is_none());
    }
}
