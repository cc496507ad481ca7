//! Synthetic detection histories from known parameters.

use rand::Rng;

use crate::{
    data::{DetectionArray, SurveyData},
    error::Result,
    model::{ModelSpec, OccupancyModel, Params, Priors},
};

/// Simulated records together with the latent truth that produced them.
#[derive(Debug, Clone)]
pub struct SimulatedSurvey {
    pub data: SurveyData,
    /// True occupancy in `(site, season)` order.
    pub occupied: Vec<bool>,
}

impl SimulatedSurvey {
    pub fn is_occupied(&self, site: usize, season: usize) -> bool {
        self.occupied[site * self.data.n_seasons() + season]
    }

    /// True fraction of occupied sites in a season.
    pub fn occupied_fraction(&self, season: usize) -> f64 {
        let sites = self.data.n_sites();
        let count = (0..sites).filter(|&site| self.is_occupied(site, season)).count();
        count as f64 / sites as f64
    }
}

/// Simulate a survey over the design of `template`.
///
/// The template provides the shape, the survey counts and any covariates
/// the model variant needs; its detection records are replaced. Slots
/// beyond a site's survey count stay missing.
pub fn simulate<R: Rng + ?Sized>(
    template: &SurveyData,
    spec: ModelSpec,
    params: &Params,
    rng: &mut R,
) -> Result<SimulatedSurvey> {
    let model = OccupancyModel::new(template.clone(), spec, Priors::default())?;
    model.check_params(params)?;
    let probs = model.probabilities(params);

    let sites = template.n_sites();
    let seasons = template.n_seasons();
    let replicates = template.n_replicates();

    let mut occupied = Vec::with_capacity(sites * seasons);
    let mut records = Vec::with_capacity(sites * seasons * replicates);
    for site in 0..sites {
        let mut previous = false;
        for season in 0..seasons {
            let z = rng.random::<f64>() < probs.transition(site, season, previous);
            occupied.push(z);
            previous = z;
            for rep in 0..replicates {
                if template.is_excluded(site, rep) {
                    records.push(None);
                } else {
                    let p = probs.detection_given_state(site, season, rep, z);
                    records.push(Some(rng.random::<f64>() < p));
                }
            }
        }
    }

    let detections = DetectionArray::new(sites, seasons, replicates, records)?;
    Ok(SimulatedSurvey {
        data: template.with_detections(detections)?,
        occupied,
    })
}
