//! Latent occupancy states and their Gibbs update.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    data::SurveyData,
    math::{bernoulli_logp, logaddexp},
    model::Probabilities,
};

/// Occupancy of one site in one season.
///
/// A site-season with a recorded detection is `ForcedOccupied` for the
/// whole life of a chain; the sampler never touches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LatentState {
    ForcedOccupied,
    Sampled(bool),
}

impl LatentState {
    #[inline]
    pub fn is_occupied(self) -> bool {
        match self {
            LatentState::ForcedOccupied => true,
            LatentState::Sampled(occupied) => occupied,
        }
    }

    pub fn is_forced(self) -> bool {
        matches!(self, LatentState::ForcedOccupied)
    }
}

/// How a chain fills the site-seasons without a detection before the
/// first sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum InitStrategy {
    /// Unobserved site-seasons start unoccupied.
    DataDriven,
    /// Each unobserved site-season starts occupied with probability 0.1.
    MostlyUnoccupied,
    /// Each unobserved site-season starts occupied with probability 0.9.
    MostlyOccupied,
    /// Each unobserved site-season starts occupied with the given probability.
    Random { occupied: f64 },
}

impl InitStrategy {
    fn occupied_probability(self) -> f64 {
        match self {
            InitStrategy::DataDriven => 0.,
            InitStrategy::MostlyUnoccupied => 0.1,
            InitStrategy::MostlyOccupied => 0.9,
            InitStrategy::Random { occupied } => occupied.clamp(0., 1.),
        }
    }
}

/// Latent state grid indexed by (site, season).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatentStates {
    sites: usize,
    seasons: usize,
    states: Box<[LatentState]>,
}

impl LatentStates {
    pub fn initialize<R: Rng + ?Sized>(
        data: &SurveyData,
        strategy: InitStrategy,
        rng: &mut R,
    ) -> LatentStates {
        let sites = data.n_sites();
        let seasons = data.n_seasons();
        let occupied = strategy.occupied_probability();
        let states = (0..sites)
            .flat_map(|site| (0..seasons).map(move |season| (site, season)))
            .map(|(site, season)| {
                if data.detected(site, season) {
                    LatentState::ForcedOccupied
                } else {
                    LatentState::Sampled(rng.random::<f64>() < occupied)
                }
            })
            .collect();
        LatentStates {
            sites,
            seasons,
            states,
        }
    }

    #[inline]
    pub fn get(&self, site: usize, season: usize) -> LatentState {
        self.states[site * self.seasons + season]
    }

    #[inline]
    pub fn is_occupied(&self, site: usize, season: usize) -> bool {
        self.get(site, season).is_occupied()
    }

    /// Overwrite a sampled state. Forced states are left alone.
    #[inline]
    pub(crate) fn set(&mut self, site: usize, season: usize, occupied: bool) {
        let state = &mut self.states[site * self.seasons + season];
        if let LatentState::Sampled(value) = state {
            *value = occupied;
        }
    }

    pub fn n_sites(&self) -> usize {
        self.sites
    }

    pub fn n_seasons(&self) -> usize {
        self.seasons
    }

    /// Fraction of sites occupied in `season`.
    pub fn occupied_fraction(&self, season: usize) -> f64 {
        let occupied = (0..self.sites)
            .filter(|&site| self.is_occupied(site, season))
            .count();
        occupied as f64 / self.sites as f64
    }

    pub fn occupied_count(&self) -> usize {
        self.states.iter().filter(|s| s.is_occupied()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = LatentState> + '_ {
        self.states.iter().copied()
    }
}

/// Probability that a non-forced site-season is occupied, given the
/// states of its neighbouring seasons and its own records.
pub fn occupied_conditional(
    data: &SurveyData,
    probs: &Probabilities,
    states: &LatentStates,
    site: usize,
    season: usize,
) -> f64 {
    let previous = season > 0 && states.is_occupied(site, season - 1);
    let prior = probs.transition(site, season, previous);
    let mut log_occupied = prior.ln();
    let mut log_empty = (-prior).ln_1p();

    if season + 1 < states.n_seasons() {
        let next = states.is_occupied(site, season + 1);
        log_occupied += bernoulli_logp(next, probs.survival(site, season));
        log_empty += bernoulli_logp(next, probs.colonization(site, season));
    }

    for (rep, y) in data.observations(site, season) {
        log_occupied += bernoulli_logp(y, probs.detection(site, season, rep));
        log_empty += bernoulli_logp(y, 0.);
    }

    (log_occupied - logaddexp(log_occupied, log_empty)).exp()
}

/// One Gibbs sweep over every site-season.
///
/// Seasons of a site are visited in order so that each update sees the
/// freshest neighbours. Returns the number of sampled (non-forced) states
/// that changed.
pub fn sample_latent_states<R: Rng + ?Sized>(
    data: &SurveyData,
    probs: &Probabilities,
    states: &mut LatentStates,
    rng: &mut R,
) -> usize {
    let mut changed = 0;
    for site in 0..states.n_sites() {
        for season in 0..states.n_seasons() {
            let LatentState::Sampled(current) = states.get(site, season) else {
                continue;
            };
            let prob = occupied_conditional(data, probs, states, site, season);
            // Both outcomes impossible: keep the current state.
            if prob.is_nan() {
                continue;
            }
            let occupied = rng.random::<f64>() < prob;
            if occupied != current {
                changed += 1;
            }
            states.set(site, season, occupied);
        }
    }
    changed
}
