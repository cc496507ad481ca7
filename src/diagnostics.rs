//! Convergence diagnostics and posterior summaries.
//!
//! All functions take per-chain series already cut to a common length
//! (see [`Trace::monitored`]). Quantities that cannot be computed, such
//! as the R-hat of a parameter that never moves, are reported as NaN.

use faer::{Mat, Scale};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF, FisherSnedecor};
use tracing::warn;

use crate::{
    error::{OccupancyError, Result},
    math::{mean_var, quantile_sorted},
    model::OccupancyModel,
    trace::{monitor_names, Trace},
};

/// R-hat above this is logged as a warning.
pub const RHAT_WARNING: f64 = 1.1;

/// Potential scale reduction factor with its upper confidence bound.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Psrf {
    pub point: f64,
    pub upper: f64,
}

impl Psrf {
    const UNDEFINED: Psrf = Psrf {
        point: f64::NAN,
        upper: f64::NAN,
    };
}

fn check_shape(chains: &[Vec<f64>], min_draws: usize) -> Result<usize> {
    if chains.len() < 2 {
        return Err(OccupancyError::TooFewChains {
            min: 2,
            got: chains.len(),
        });
    }
    let n = chains.iter().map(|c| c.len()).min().unwrap_or(0);
    if n < min_draws {
        return Err(OccupancyError::TooFewDraws {
            min: min_draws,
            got: n,
        });
    }
    Ok(n)
}

fn covariance(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - mean_a) * (y - mean_b))
        .sum::<f64>()
        / (n - 1.)
}

/// Quantile of the F distribution; an infinite denominator degree of
/// freedom falls back to the scaled chi-squared limit.
fn f_quantile(p: f64, d1: f64, d2: f64) -> f64 {
    if d2.is_finite() {
        FisherSnedecor::new(d1, d2).map_or(f64::NAN, |dist| dist.inverse_cdf(p))
    } else {
        ChiSquared::new(d1).map_or(f64::NAN, |dist| dist.inverse_cdf(p) / d1)
    }
}

/// Gelman-Rubin potential scale reduction with the sampling variability
/// correction of Brooks and Gelman and a 97.5% upper bound.
///
/// Chains are trimmed from the back to the length of the shortest chain.
pub fn potential_scale_reduction(chains: &[Vec<f64>]) -> Result<Psrf> {
    let n = check_shape(chains, 2)?;
    if chains.iter().any(|c| c[..n].iter().any(|v| !v.is_finite())) {
        return Ok(Psrf::UNDEFINED);
    }
    let m = chains.len() as f64;
    let nf = n as f64;

    let (means, variances): (Vec<f64>, Vec<f64>) =
        chains.iter().map(|c| mean_var(&c[..n])).unzip();
    let w = variances.iter().sum::<f64>() / m;
    if !(w > 0.) {
        return Ok(Psrf::UNDEFINED);
    }
    let (grand_mean, var_means) = mean_var(&means);
    let b = nf * var_means;

    let (_, var_s2) = mean_var(&variances);
    let var_w = var_s2 / m;
    let var_b = 2. * b * b / (m - 1.);
    let squared_means = means.iter().map(|x| x * x).collect::<Vec<_>>();
    let cov_wb = nf / m
        * (covariance(&variances, &squared_means)
            - 2. * grand_mean * covariance(&variances, &means));

    let v = (nf - 1.) / nf * w + (1. + 1. / m) * b / nf;
    let var_v = ((nf - 1.).powi(2) * var_w
        + (1. + 1. / m).powi(2) * var_b
        + 2. * (nf - 1.) * (1. + 1. / m) * cov_wb)
        / (nf * nf);
    let df_v = 2. * v * v / var_v;
    let df_adj = if df_v.is_finite() {
        (df_v + 3.) / (df_v + 1.)
    } else {
        1.
    };

    let w_df = 2. * w * w / var_w;
    let fixed = (nf - 1.) / nf;
    let random = (1. + 1. / m) * (1. / nf) * (b / w);
    let point = (df_adj * (fixed + random)).sqrt();
    let upper = (df_adj * (fixed + f_quantile(0.975, m - 1., w_df) * random)).sqrt();
    Ok(Psrf { point, upper })
}

/// Multivariate potential scale reduction of Brooks and Gelman.
///
/// `chains` is indexed as `chain -> draw -> parameter`. Parameters that
/// are not finite everywhere or have no within-chain variance are left
/// out; NaN if nothing is left.
pub fn multivariate_psrf(chains: &[Vec<Vec<f64>>]) -> Result<f64> {
    if chains.len() < 2 {
        return Err(OccupancyError::TooFewChains {
            min: 2,
            got: chains.len(),
        });
    }
    let n = chains.iter().map(|c| c.len()).min().unwrap_or(0);
    if n < 2 {
        return Err(OccupancyError::TooFewDraws { min: 2, got: n });
    }
    let dim = chains[0].first().map_or(0, |draw| draw.len());
    let m = chains.len();

    let column = |chain: &[Vec<f64>], j: usize| {
        chain[..n].iter().map(|d| d[j]).collect::<Vec<_>>()
    };
    let keep = (0..dim)
        .filter(|&j| {
            chains.iter().all(|c| {
                let col = column(c, j);
                col.iter().all(|v| v.is_finite()) && mean_var(&col).1 > 0.
            })
        })
        .collect::<Vec<_>>();
    if keep.is_empty() {
        return Ok(f64::NAN);
    }
    let p = keep.len();

    let chain_means = chains
        .iter()
        .map(|c| {
            keep.iter()
                .map(|&j| c[..n].iter().map(|d| d[j]).sum::<f64>() / n as f64)
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();

    let mut within = Mat::from_fn(p, p, |a, b| {
        chains
            .iter()
            .zip(&chain_means)
            .map(|(chain, means)| {
                chain[..n]
                    .iter()
                    .map(|d| (d[keep[a]] - means[a]) * (d[keep[b]] - means[b]))
                    .sum::<f64>()
                    / (n as f64 - 1.)
            })
            .sum::<f64>()
    });
    within *= Scale((m as f64).recip());

    let grand = (0..p)
        .map(|a| chain_means.iter().map(|c| c[a]).sum::<f64>() / m as f64)
        .collect::<Vec<_>>();
    let between = Mat::from_fn(p, p, |a, b| {
        chain_means
            .iter()
            .map(|c| (c[a] - grand[a]) * (c[b] - grand[b]))
            .sum::<f64>()
            / (m as f64 - 1.)
    });

    let Some(lambda) = largest_generalized_eigenvalue(within, between) else {
        return Ok(f64::NAN);
    };
    let nf = n as f64;
    let mf = m as f64;
    Ok(((nf - 1.) / nf + (mf + 1.) / mf * lambda).sqrt())
}

/// Largest eigenvalue of `W^-1 B`, computed as the largest eigenvalue of
/// the symmetric `W^-1/2 B W^-1/2`.
fn largest_generalized_eigenvalue(within: Mat<f64>, between: Mat<f64>) -> Option<f64> {
    let w_eig = within.self_adjoint_eigen(faer::Side::Lower).ok()?;
    let u = w_eig.U();
    let mut inv_sqrt = w_eig.S().column_vector().to_owned();
    let largest = inv_sqrt.iter().copied().fold(0f64, f64::max);
    let tol = largest * 1e-12;
    inv_sqrt
        .iter_mut()
        .for_each(|val| *val = if *val > tol { val.sqrt().recip() } else { 0. });
    let w_inv_sqrt = u * inv_sqrt.into_diagonal() * u.transpose();

    let m = (&w_inv_sqrt) * between * (&w_inv_sqrt);
    let m_eig = m.self_adjoint_eigen(faer::Side::Lower).ok()?;
    let lambda = m_eig
        .S()
        .column_vector()
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    lambda.is_finite().then_some(lambda)
}

/// Effective sample size over all chains, with Geyer's initial monotone
/// sequence estimator of the autocorrelation time.
///
/// NaN for constant or non-finite series. At most
/// `N log10(N)` for `N` total draws.
pub fn effective_sample_size(chains: &[Vec<f64>]) -> Result<f64> {
    if chains.is_empty() {
        return Err(OccupancyError::TooFewChains { min: 1, got: 0 });
    }
    let num_draws = chains.iter().map(|c| c.len()).min().unwrap_or(0);
    if num_draws < 4 {
        return Err(OccupancyError::TooFewDraws {
            min: 4,
            got: num_draws,
        });
    }
    let chains = chains.iter().map(|c| &c[..num_draws]).collect::<Vec<_>>();
    if chains.iter().any(|c| c.iter().any(|v| !v.is_finite())) {
        return Ok(f64::NAN);
    }
    let first = chains[0][0];
    if chains
        .iter()
        .all(|c| c.iter().all(|v| (v - first).abs() < 1e-10))
    {
        return Ok(f64::NAN);
    }

    let num_chains = chains.len();
    let nf = num_draws as f64;
    let chain_mean = chains
        .iter()
        .map(|c| c.iter().sum::<f64>() / nf)
        .collect::<Vec<_>>();
    // Biased (divide by n) autocovariance, computed only for the lags the
    // truncation rule reaches.
    let acov = |c: usize, lag: usize| {
        let mean = chain_mean[c];
        let chain = chains[c];
        chain[..num_draws - lag]
            .iter()
            .zip(&chain[lag..])
            .map(|(a, b)| (a - mean) * (b - mean))
            .sum::<f64>()
            / nf
    };
    let mean_acov =
        |lag: usize| (0..num_chains).map(|c| acov(c, lag)).sum::<f64>() / num_chains as f64;

    let chain_var = (0..num_chains)
        .map(|c| acov(c, 0) * nf / (nf - 1.))
        .collect::<Vec<_>>();
    let within_var = chain_var.iter().sum::<f64>() / num_chains as f64;
    let mut var_plus = within_var * (nf - 1.) / nf;
    if num_chains > 1 {
        var_plus += mean_var(&chain_mean).1;
    }

    let mut rho_hat_s = vec![0f64; num_draws];
    let mut rho_hat_even = 1.;
    rho_hat_s[0] = rho_hat_even;
    let mut rho_hat_odd = 1. - (within_var - mean_acov(1)) / var_plus;
    rho_hat_s[1] = rho_hat_odd;

    // Geyer's initial positive sequence. The last pair of autocorrelations
    // is kept as a bias term for antithetic chains.
    let mut s = 1;
    while s < num_draws - 4 && rho_hat_even + rho_hat_odd > 0. {
        rho_hat_even = 1. - (within_var - mean_acov(s + 1)) / var_plus;
        rho_hat_odd = 1. - (within_var - mean_acov(s + 2)) / var_plus;
        if rho_hat_even + rho_hat_odd >= 0. {
            rho_hat_s[s + 1] = rho_hat_even;
            rho_hat_s[s + 2] = rho_hat_odd;
        }
        s += 2;
    }
    let max_s = s;
    if rho_hat_even > 0. {
        rho_hat_s[max_s + 1] = rho_hat_even;
    }

    // Initial monotone sequence
    let mut s = 1;
    while max_s >= 3 && s <= max_s - 3 {
        if rho_hat_s[s + 1] + rho_hat_s[s + 2] > rho_hat_s[s - 1] + rho_hat_s[s] {
            rho_hat_s[s + 1] = (rho_hat_s[s - 1] + rho_hat_s[s]) / 2.;
            rho_hat_s[s + 2] = rho_hat_s[s + 1];
        }
        s += 2;
    }

    let total = num_chains as f64 * nf;
    let tau_hat = -1. + 2. * rho_hat_s[..max_s].iter().sum::<f64>() + rho_hat_s[max_s + 1];
    Ok((total / tau_hat).min(total * total.log10()))
}

/// Posterior summary of one monitored scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSummary {
    pub name: String,
    pub mean: f64,
    pub sd: f64,
    pub q025: f64,
    pub median: f64,
    pub q975: f64,
    pub rhat: Psrf,
    pub ess: f64,
    /// Draws in which the quantity was defined.
    pub defined: usize,
    /// Draws in which the quantity was undefined.
    pub undefined: usize,
}

impl ParameterSummary {
    /// Summarize aligned per-chain series. Undefined (NaN) draws are left
    /// out of the moments and quantiles and counted; a quantity that is
    /// undefined anywhere has no R-hat or ESS.
    pub fn new(name: &str, chains: &[Vec<f64>]) -> Result<ParameterSummary> {
        let mut defined = chains
            .iter()
            .flatten()
            .copied()
            .filter(|v| !v.is_nan())
            .collect::<Vec<_>>();
        let total = chains.iter().map(|c| c.len()).sum::<usize>();
        let undefined = total - defined.len();
        defined.sort_by(f64::total_cmp);

        let (mean, var) = if defined.is_empty() {
            (f64::NAN, f64::NAN)
        } else {
            mean_var(&defined)
        };
        let (rhat, ess) = if undefined == 0 {
            (
                potential_scale_reduction(chains)?,
                effective_sample_size(chains)?,
            )
        } else {
            (Psrf::UNDEFINED, f64::NAN)
        };

        Ok(ParameterSummary {
            name: name.to_string(),
            mean,
            sd: var.sqrt(),
            q025: quantile_sorted(&defined, 0.025),
            median: quantile_sorted(&defined, 0.5),
            q975: quantile_sorted(&defined, 0.975),
            rhat,
            ess,
            defined: defined.len(),
            undefined,
        })
    }
}

/// Summaries of every monitored quantity plus the multivariate R-hat of
/// the model parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsReport {
    pub num_chains: usize,
    pub draws_per_chain: usize,
    pub summaries: Vec<ParameterSummary>,
    pub multivariate_rhat: f64,
}

impl DiagnosticsReport {
    #[tracing::instrument(skip_all, fields(kind = %model.kind(), chains = trace.num_chains()))]
    pub fn new(model: &OccupancyModel, trace: &Trace) -> Result<DiagnosticsReport> {
        let names = monitor_names(model);
        let monitored = trace.monitored();
        let draws_per_chain = trace.aligned_len();
        if monitored.len() < 2 {
            return Err(OccupancyError::TooFewChains {
                min: 2,
                got: monitored.len(),
            });
        }
        if draws_per_chain < 4 {
            return Err(OccupancyError::TooFewDraws {
                min: 4,
                got: draws_per_chain,
            });
        }

        let summaries = names
            .iter()
            .enumerate()
            .map(|(index, name)| {
                let chains = monitored
                    .iter()
                    .map(|chain| chain.iter().map(|draw| draw[index]).collect())
                    .collect::<Vec<Vec<f64>>>();
                ParameterSummary::new(name, &chains)
            })
            .collect::<Result<Vec<_>>>()?;

        for summary in &summaries {
            if summary.rhat.point > RHAT_WARNING {
                warn!(
                    name = %summary.name,
                    rhat = summary.rhat.point,
                    upper = summary.rhat.upper,
                    "chains have not converged"
                );
            }
        }

        let num_params = model.parameter_names().len();
        let params = monitored
            .iter()
            .map(|chain| {
                chain
                    .iter()
                    .map(|draw| draw[..num_params].to_vec())
                    .collect()
            })
            .collect::<Vec<Vec<Vec<f64>>>>();
        let multivariate_rhat = multivariate_psrf(&params)?;
        if multivariate_rhat > RHAT_WARNING {
            warn!(rhat = multivariate_rhat, "multivariate R-hat above threshold");
        }

        Ok(DiagnosticsReport {
            num_chains: trace.num_chains(),
            draws_per_chain,
            summaries,
            multivariate_rhat,
        })
    }

    pub fn get(&self, name: &str) -> Option<&ParameterSummary> {
        self.summaries.iter().find(|s| s.name == name)
    }

    /// Largest defined R-hat point estimate.
    pub fn max_rhat(&self) -> f64 {
        self.summaries
            .iter()
            .map(|s| s.rhat.point)
            .filter(|v| !v.is_nan())
            .fold(f64::NAN, f64::max)
    }

    /// Names of quantities whose R-hat exceeds `threshold`.
    pub fn unconverged(&self, threshold: f64) -> Vec<&str> {
        self.summaries
            .iter()
            .filter(|s| s.rhat.point > threshold)
            .map(|s| s.name.as_str())
            .collect()
    }
}
