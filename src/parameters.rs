//! Parameter updates conditional on the current latent states.
//!
//! Probability parameters with beta priors get exact conjugate draws.
//! Regression coefficients are updated one at a time with random-walk
//! Metropolis steps whose scales are tuned while the chain adapts.

use rand::Rng;
use rand_distr::{Beta, StandardNormal};

use crate::{
    data::SurveyData,
    latent::LatentStates,
    math::{log1m_expit, log_expit, normal_logpdf},
    model::{BetaPrior, CompiledDesign, OccupancyModel, Params, Process},
    proposal::{DualAverageOptions, ProposalScale},
};

/// Sufficient statistics of the latent states for the conjugate updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateCounts {
    pub initially_occupied: u64,
    pub initially_empty: u64,
    /// Occupied in `t` and still occupied in `t + 1`.
    pub survived: Vec<u64>,
    /// Occupied in `t` and empty in `t + 1`.
    pub lost: Vec<u64>,
    /// Empty in `t` and occupied in `t + 1`.
    pub colonized: Vec<u64>,
    /// Empty in `t` and still empty in `t + 1`.
    pub stayed_empty: Vec<u64>,
    /// Detections at occupied site-seasons in season `t`.
    pub detections: Vec<u64>,
    /// Non-detections at occupied site-seasons in season `t`.
    pub misses: Vec<u64>,
}

impl StateCounts {
    pub fn tally(data: &SurveyData, states: &LatentStates) -> StateCounts {
        let seasons = states.n_seasons();
        let transitions = seasons - 1;
        let mut counts = StateCounts {
            initially_occupied: 0,
            initially_empty: 0,
            survived: vec![0; transitions],
            lost: vec![0; transitions],
            colonized: vec![0; transitions],
            stayed_empty: vec![0; transitions],
            detections: vec![0; seasons],
            misses: vec![0; seasons],
        };

        for site in 0..states.n_sites() {
            if states.is_occupied(site, 0) {
                counts.initially_occupied += 1;
            } else {
                counts.initially_empty += 1;
            }
            for t in 0..transitions {
                match (states.is_occupied(site, t), states.is_occupied(site, t + 1)) {
                    (true, true) => counts.survived[t] += 1,
                    (true, false) => counts.lost[t] += 1,
                    (false, true) => counts.colonized[t] += 1,
                    (false, false) => counts.stayed_empty[t] += 1,
                }
            }
            for season in 0..seasons {
                if !states.is_occupied(site, season) {
                    continue;
                }
                for (_, y) in data.observations(site, season) {
                    if y {
                        counts.detections[season] += 1;
                    } else {
                        counts.misses[season] += 1;
                    }
                }
            }
        }
        counts
    }
}

/// Conjugate draw from `Beta(a + successes, b + failures)`.
///
/// A draw that fails or falls outside [0, 1] leaves the current value in
/// place.
fn beta_draw<R: Rng + ?Sized>(
    rng: &mut R,
    prior: BetaPrior,
    successes: u64,
    failures: u64,
    current: f64,
) -> f64 {
    let Ok(dist) = Beta::new(prior.a + successes as f64, prior.b + failures as f64) else {
        return current;
    };
    let value: f64 = rng.sample(dist);
    if (0. ..=1.).contains(&value) {
        value
    } else {
        current
    }
}

/// Per-site counts of each outcome of the survival or colonization process.
fn transition_outcomes(states: &LatentStates, site: usize, from_occupied: bool) -> (u64, u64) {
    let mut successes = 0;
    let mut failures = 0;
    for t in 0..states.n_seasons() - 1 {
        if states.is_occupied(site, t) != from_occupied {
            continue;
        }
        if states.is_occupied(site, t + 1) {
            successes += 1;
        } else {
            failures += 1;
        }
    }
    (successes, failures)
}

/// Log-likelihood of one process of the covariate model as a function of
/// its coefficients, with the latent states held fixed.
pub(crate) fn process_loglik(
    data: &SurveyData,
    design: &CompiledDesign,
    process: Process,
    beta: &[f64],
    states: &LatentStates,
) -> f64 {
    let matrix = design.matrix(process);
    let bernoulli = |success: bool, eta: f64| {
        if success {
            log_expit(eta)
        } else {
            log1m_expit(eta)
        }
    };
    let sites = states.n_sites();
    match process {
        Process::Occupancy => (0..sites)
            .map(|site| bernoulli(states.is_occupied(site, 0), matrix.linear_predictor(site, beta)))
            .sum(),
        Process::Survival | Process::Colonization => {
            let from_occupied = process == Process::Survival;
            (0..sites)
                .map(|site| {
                    let (successes, failures) = transition_outcomes(states, site, from_occupied);
                    if successes + failures == 0 {
                        return 0.;
                    }
                    let eta = matrix.linear_predictor(site, beta);
                    successes as f64 * log_expit(eta) + failures as f64 * log1m_expit(eta)
                })
                .sum()
        }
        Process::Detection => {
            let seasons = states.n_seasons();
            let replicates = data.n_replicates();
            let mut loglik = 0f64;
            for site in 0..sites {
                for season in 0..seasons {
                    if !states.is_occupied(site, season) {
                        continue;
                    }
                    for (rep, y) in data.observations(site, season) {
                        let slot = (site * seasons + season) * replicates + rep;
                        loglik += bernoulli(y, matrix.linear_predictor(slot, beta));
                    }
                }
            }
            loglik
        }
    }
}

/// Acceptance bookkeeping of one parameter sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub accepted: u64,
    pub proposed: u64,
}

/// Updates every parameter of a chain given the latent states.
#[derive(Debug, Clone)]
pub struct ParameterSampler {
    /// One proposal scale per coefficient, per process. Empty for the
    /// conjugate variants.
    scales: Vec<(Process, Vec<ProposalScale>)>,
}

impl ParameterSampler {
    pub fn new(
        model: &OccupancyModel,
        options: DualAverageOptions,
        initial_scale: f64,
        target_accept: f64,
    ) -> ParameterSampler {
        let scales = match model.design() {
            None => Vec::new(),
            Some(_) => Process::ALL
                .iter()
                .map(|&process| {
                    let scales = (0..model.coefficient_count(process))
                        .map(|_| ProposalScale::new(options, initial_scale, target_accept))
                        .collect();
                    (process, scales)
                })
                .collect(),
        };
        ParameterSampler { scales }
    }

    /// Current proposal scales, flattened in parameter order.
    pub fn proposal_scales(&self) -> Vec<f64> {
        self.scales
            .iter()
            .flat_map(|(_, scales)| scales.iter().map(|s| s.scale()))
            .collect()
    }

    /// Acceptance rates since adaptation ended, flattened in parameter order.
    pub fn acceptance_rates(&self) -> Vec<f64> {
        self.scales
            .iter()
            .flat_map(|(_, scales)| scales.iter().map(|s| s.acceptance.current()))
            .collect()
    }

    /// Stop tuning the proposal scales.
    pub fn finalize_adaptation(&mut self) {
        self.scales
            .iter_mut()
            .flat_map(|(_, scales)| scales.iter_mut())
            .for_each(|scale| scale.finalize());
    }

    pub fn sweep<R: Rng + ?Sized>(
        &mut self,
        model: &OccupancyModel,
        params: &mut Params,
        states: &LatentStates,
        rng: &mut R,
    ) -> SweepStats {
        let prior = model.priors().probability;
        match params {
            Params::Null {
                psi1,
                phi,
                gamma,
                p,
            } => {
                let counts = StateCounts::tally(model.data(), states);
                *psi1 = beta_draw(
                    rng,
                    prior,
                    counts.initially_occupied,
                    counts.initially_empty,
                    *psi1,
                );
                let total = |values: &[u64]| values.iter().sum::<u64>();
                *phi = beta_draw(rng, prior, total(&counts.survived), total(&counts.lost), *phi);
                *gamma = beta_draw(
                    rng,
                    prior,
                    total(&counts.colonized),
                    total(&counts.stayed_empty),
                    *gamma,
                );
                *p = beta_draw(
                    rng,
                    prior,
                    total(&counts.detections),
                    total(&counts.misses),
                    *p,
                );
                SweepStats::default()
            }
            Params::Dynamic {
                psi1,
                phi,
                gamma,
                p,
            } => {
                let counts = StateCounts::tally(model.data(), states);
                *psi1 = beta_draw(
                    rng,
                    prior,
                    counts.initially_occupied,
                    counts.initially_empty,
                    *psi1,
                );
                for (t, value) in phi.iter_mut().enumerate() {
                    *value = beta_draw(rng, prior, counts.survived[t], counts.lost[t], *value);
                }
                for (t, value) in gamma.iter_mut().enumerate() {
                    *value = beta_draw(
                        rng,
                        prior,
                        counts.colonized[t],
                        counts.stayed_empty[t],
                        *value,
                    );
                }
                for (t, value) in p.iter_mut().enumerate() {
                    *value = beta_draw(rng, prior, counts.detections[t], counts.misses[t], *value);
                }
                SweepStats::default()
            }
            Params::Covariate { .. } => {
                let Some(design) = model.design() else {
                    return SweepStats::default();
                };
                let sd = model.priors().coefficient_sd;
                let mut stats = SweepStats::default();
                for (process, scales) in self.scales.iter_mut() {
                    let Some(beta) = params.coefficients_mut(*process) else {
                        continue;
                    };
                    let loglik = |beta: &[f64]| {
                        process_loglik(model.data(), design, *process, beta, states)
                    };
                    let mut current = loglik(beta.as_slice());
                    for (k, scale) in scales.iter_mut().enumerate() {
                        let old = beta[k];
                        let step: f64 = rng.sample(StandardNormal);
                        let proposal = old + scale.scale() * step;

                        let mut proposed = f64::NAN;
                        let accept_prob = if proposal.is_finite() {
                            beta[k] = proposal;
                            proposed = loglik(beta.as_slice());
                            let log_ratio = proposed + normal_logpdf(proposal, 0., sd)
                                - current
                                - normal_logpdf(old, 0., sd);
                            if log_ratio.is_nan() {
                                0.
                            } else {
                                log_ratio.exp().min(1.)
                            }
                        } else {
                            0.
                        };

                        let accepted = accept_prob > 0. && rng.random::<f64>() < accept_prob;
                        if accepted {
                            current = proposed;
                        } else {
                            beta[k] = old;
                        }
                        scale.register(accept_prob);
                        scale.acceptance.add(accepted);
                        stats.proposed += 1;
                        stats.accepted += accepted as u64;
                    }
                }
                stats
            }
        }
    }
}
