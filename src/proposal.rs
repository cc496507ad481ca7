//! Random-walk proposal scales and their adaptation.
//!
//! The scale of each Metropolis proposal is tuned with dual averaging on
//! the log scale, the same scheme HMC samplers use for the step size. A
//! proposal that is accepted too rarely shrinks the scale, one that is
//! accepted too often grows it.

use serde::{Deserialize, Serialize};

/// Settings for proposal scale adaptation.
///
/// `k` controls how fast the averaged scale forgets early iterations,
/// `t0` damps the first updates and `gamma` sets how strongly the scale
/// reacts to acceptance errors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DualAverageOptions {
    pub k: f64,
    pub t0: f64,
    pub gamma: f64,
}

impl Default for DualAverageOptions {
    fn default() -> DualAverageOptions {
        DualAverageOptions {
            k: 0.75,
            t0: 10.,
            gamma: 0.05,
        }
    }
}

/// Dual averaging of a positive tuning parameter on the log scale.
#[derive(Debug, Clone)]
pub struct DualAverage {
    log_value: f64,
    log_smoothed: f64,
    /// Running mean of `target - accept_prob`.
    mean_error: f64,
    /// Point the iterates are shrunk towards.
    log_anchor: f64,
    iteration: u64,
    options: DualAverageOptions,
}

impl DualAverage {
    pub fn new(options: DualAverageOptions, initial: f64) -> DualAverage {
        DualAverage {
            log_value: initial.ln(),
            log_smoothed: initial.ln(),
            mean_error: 0.,
            log_anchor: (10. * initial).ln(),
            iteration: 1,
            options,
        }
    }

    pub fn update(&mut self, accept_prob: f64, target: f64) {
        let DualAverageOptions { k, t0, gamma } = self.options;
        let n = self.iteration as f64;
        let weight = (n + t0).recip();
        self.mean_error = (1. - weight) * self.mean_error + weight * (target - accept_prob);
        self.log_value = self.log_anchor - self.mean_error * n.sqrt() / gamma;
        let decay = n.powf(-k);
        self.log_smoothed = decay * self.log_value + (1. - decay) * self.log_smoothed;
        self.iteration += 1;
    }

    /// Value to use for the next proposal while tuning.
    pub fn value(&self) -> f64 {
        self.log_value.exp()
    }

    /// Averaged value to keep once tuning ends.
    pub fn smoothed(&self) -> f64 {
        self.log_smoothed.exp()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AcceptanceRate {
    pub accepted: u64,
    pub proposed: u64,
}

impl AcceptanceRate {
    pub fn add(&mut self, accepted: bool) {
        self.proposed += 1;
        if accepted {
            self.accepted += 1;
        }
    }

    pub fn current(&self) -> f64 {
        self.accepted as f64 / self.proposed as f64
    }

    pub fn reset(&mut self) {
        *self = AcceptanceRate::default();
    }
}

/// Proposal scale of one random-walk coordinate.
#[derive(Debug, Clone)]
pub struct ProposalScale {
    adapt: DualAverage,
    scale: f64,
    tuning: bool,
    target: f64,
    pub(crate) acceptance: AcceptanceRate,
}

impl ProposalScale {
    pub fn new(options: DualAverageOptions, initial_scale: f64, target: f64) -> ProposalScale {
        ProposalScale {
            adapt: DualAverage::new(options, initial_scale),
            scale: initial_scale,
            tuning: true,
            target,
            acceptance: AcceptanceRate::default(),
        }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn is_tuning(&self) -> bool {
        self.tuning
    }

    /// Record the outcome of one proposal made with the current scale.
    pub fn register(&mut self, accept_prob: f64) {
        let accept_prob = if accept_prob.is_nan() {
            0.
        } else {
            accept_prob.clamp(0., 1.)
        };
        if self.tuning {
            self.adapt.update(accept_prob, self.target);
            self.scale = self.adapt.value();
        }
    }

    /// Freeze the scale at its averaged value and forget the acceptance
    /// counts gathered while tuning.
    pub fn finalize(&mut self) {
        if self.tuning {
            self.scale = self.adapt.smoothed();
            self.tuning = false;
        }
        self.acceptance.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_acceptance_shrinks_scale() {
        let mut scale = ProposalScale::new(DualAverageOptions::default(), 1., 0.44);
        for _ in 0..200 {
            scale.register(0.05);
        }
        scale.finalize();
        assert!(scale.scale() < 1.);
        assert!(!scale.is_tuning());
    }

    #[test]
    fn high_acceptance_grows_scale() {
        let mut scale = ProposalScale::new(DualAverageOptions::default(), 0.1, 0.44);
        for _ in 0..200 {
            scale.register(1.);
        }
        scale.finalize();
        assert!(scale.scale() > 0.1);
    }

    #[test]
    fn frozen_scale_does_not_move() {
        let mut scale = ProposalScale::new(DualAverageOptions::default(), 0.5, 0.44);
        scale.finalize();
        let before = scale.scale();
        scale.register(0.);
        assert_eq!(scale.scale(), before);
    }

    #[test]
    fn acceptance_rate() {
        let mut rate = AcceptanceRate::default();
        rate.add(true);
        rate.add(false);
        rate.add(true);
        rate.add(true);
        assert_eq!(rate.current(), 0.75);
        rate.reset();
        assert!(rate.current().is_nan());
    }
}
