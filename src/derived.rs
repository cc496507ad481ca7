//! Deterministic functions of one snapshot.
//!
//! Nothing here draws random numbers: evaluating the same parameters and
//! latent states twice gives bit-identical output.

use serde::{Deserialize, Serialize};

use crate::{latent::LatentStates, model::Probabilities};

/// Denominators at or below this are treated as zero occupancy.
pub const MIN_OCCUPANCY: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedQuantities {
    /// Expected occupancy per season, from the initial occupancy and the
    /// transition probabilities.
    pub equilibrium: Vec<f64>,
    /// Fraction of sites occupied per season in the latent states.
    pub realized: Vec<f64>,
    /// `equilibrium[t + 1] / equilibrium[t]`.
    pub growth: Vec<Option<f64>>,
    /// Share of the sites occupied in `t + 1` that were newly colonized.
    pub turnover: Vec<Option<f64>>,
}

impl DerivedQuantities {
    pub fn compute(probs: &Probabilities, latent: &LatentStates) -> DerivedQuantities {
        let trajectories = site_trajectories(probs);
        let equilibrium = average_over_sites(&trajectories, probs.n_seasons());
        let realized = (0..latent.n_seasons())
            .map(|season| latent.occupied_fraction(season))
            .collect();
        let growth = growth_rate(&equilibrium);
        let turnover = turnover(probs, &trajectories, &equilibrium);
        DerivedQuantities {
            equilibrium,
            realized,
            growth,
            turnover,
        }
    }

    pub fn names(seasons: usize) -> Vec<String> {
        (1..=seasons)
            .map(|t| format!("psi_eq[{t}]"))
            .chain((1..=seasons).map(|t| format!("psi_fs[{t}]")))
            .chain((1..seasons).map(|t| format!("growth[{t}]")))
            .chain((1..seasons).map(|t| format!("turnover[{t}]")))
            .collect()
    }

    /// Flattened in the order of [`names`](Self::names); undefined values
    /// become NaN.
    pub fn values(&self) -> Vec<f64> {
        let undefined = |v: &Option<f64>| v.unwrap_or(f64::NAN);
        self.equilibrium
            .iter()
            .chain(&self.realized)
            .copied()
            .chain(self.growth.iter().map(undefined))
            .chain(self.turnover.iter().map(undefined))
            .collect()
    }
}

/// Per-site occupancy trajectory, row-major `(site, season)`.
fn site_trajectories(probs: &Probabilities) -> Vec<f64> {
    let seasons = probs.n_seasons();
    let mut psi = Vec::with_capacity(probs.n_sites() * seasons);
    for site in 0..probs.n_sites() {
        let mut current = probs.initial_occupancy(site);
        psi.push(current);
        for t in 0..seasons - 1 {
            current = current * probs.survival(site, t)
                + (1. - current) * probs.colonization(site, t);
            psi.push(current);
        }
    }
    psi
}

fn average_over_sites(trajectories: &[f64], seasons: usize) -> Vec<f64> {
    let sites = trajectories.len() / seasons;
    (0..seasons)
        .map(|t| {
            let total = (0..sites)
                .map(|site| trajectories[site * seasons + t])
                .sum::<f64>();
            total / sites as f64
        })
        .collect()
}

fn ratio(numerator: f64, denominator: f64) -> Option<f64> {
    if denominator.is_finite() && denominator > MIN_OCCUPANCY {
        Some(numerator / denominator)
    } else {
        None
    }
}

fn growth_rate(equilibrium: &[f64]) -> Vec<Option<f64>> {
    equilibrium
        .windows(2)
        .map(|pair| ratio(pair[1], pair[0]))
        .collect()
}

fn turnover(probs: &Probabilities, trajectories: &[f64], equilibrium: &[f64]) -> Vec<Option<f64>> {
    let seasons = probs.n_seasons();
    let sites = probs.n_sites();
    (0..seasons - 1)
        .map(|t| {
            let colonized = (0..sites)
                .map(|site| (1. - trajectories[site * seasons + t]) * probs.colonization(site, t))
                .sum::<f64>()
                / sites as f64;
            ratio(colonized, equilibrium[t + 1])
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data::{DetectionArray, SurveyData},
        latent::InitStrategy,
        model::{CovariateDesign, ModelSpec, OccupancyModel, Params, Priors},
    };
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn model(spec: ModelSpec) -> OccupancyModel {
        let mut values = vec![Some(false); 4 * 3 * 2];
        values[0] = Some(true);
        values[(1 * 3 + 2) * 2 + 1] = Some(true);
        let detections = DetectionArray::new(4, 3, 2, values).unwrap();
        let data = SurveyData::fully_surveyed(detections)
            .unwrap()
            .with_site_covariate("elevation", vec![1., 4., 2., 8.])
            .unwrap()
            .with_site_covariate("forest", vec![0.3, 0.1, 0.9, 0.5])
            .unwrap()
            .with_survey_covariate("date", (0..24).map(|i| (i % 5) as f64).collect())
            .unwrap();
        OccupancyModel::new(data, spec, Priors::default()).unwrap()
    }

    fn latent(model: &OccupancyModel) -> LatentStates {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        LatentStates::initialize(model.data(), InitStrategy::DataDriven, &mut rng)
    }

    #[test]
    fn null_trajectory_follows_recursion() {
        let model = model(ModelSpec::Null);
        let params = Params::Null {
            psi1: 0.4,
            phi: 0.7,
            gamma: 0.1,
            p: 0.5,
        };
        let derived = DerivedQuantities::compute(&model.probabilities(&params), &latent(&model));

        let psi2 = 0.4 * 0.7 + 0.6 * 0.1;
        let psi3 = psi2 * 0.7 + (1. - psi2) * 0.1;
        assert_abs_diff_eq!(derived.equilibrium[0], 0.4, epsilon = 1e-12);
        assert_abs_diff_eq!(derived.equilibrium[1], psi2, epsilon = 1e-12);
        assert_abs_diff_eq!(derived.equilibrium[2], psi3, epsilon = 1e-12);
        assert_abs_diff_eq!(derived.growth[0].unwrap(), psi2 / 0.4, epsilon = 1e-12);
        assert_abs_diff_eq!(
            derived.turnover[1].unwrap(),
            (1. - psi2) * 0.1 / psi3,
            epsilon = 1e-12
        );
        assert_eq!(derived.realized, vec![0.25, 0., 0.25]);
    }

    #[test]
    fn zero_occupancy_is_undefined() {
        let model = model(ModelSpec::Null);
        let params = Params::Null {
            psi1: 0.,
            phi: 0.5,
            gamma: 0.,
            p: 0.5,
        };
        let derived = DerivedQuantities::compute(&model.probabilities(&params), &latent(&model));
        assert_eq!(derived.equilibrium, vec![0.; 3]);
        assert_eq!(derived.growth, vec![None, None]);
        assert_eq!(derived.turnover, vec![None, None]);
        let values = derived.values();
        assert_eq!(values.len(), DerivedQuantities::names(3).len());
        assert!(values[6..].iter().all(|v| v.is_nan()));
    }

    #[test]
    fn recomputation_is_bit_identical() {
        let model = model(ModelSpec::Covariate(CovariateDesign::default()));
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let params = model.initial_params(&mut rng);
        let states = latent(&model);
        let first = DerivedQuantities::compute(&model.probabilities(&params), &states);
        let second = DerivedQuantities::compute(&model.probabilities(&params), &states);
        let bits = |d: &DerivedQuantities| {
            d.values().iter().map(|v| v.to_bits()).collect::<Vec<_>>()
        };
        assert_eq!(bits(&first), bits(&second));
    }

    #[test]
    fn names_match_values() {
        let names = DerivedQuantities::names(3);
        assert_eq!(names[0], "psi_eq[1]");
        assert_eq!(names[3], "psi_fs[1]");
        assert_eq!(names[6], "growth[1]");
        assert_eq!(names[9], "turnover[2]");
    }
}
