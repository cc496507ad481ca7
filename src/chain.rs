use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    derived::DerivedQuantities,
    error::{OccupancyError, Result},
    latent::{sample_latent_states, InitStrategy, LatentStates},
    model::{OccupancyModel, Params},
    parameters::ParameterSampler,
    sampler::SamplerSettings,
    trace::Draw,
};

/// Life cycle of one chain. Phases only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ChainPhase {
    Uninitialized,
    /// Proposal scales are tuned; nothing is retained.
    Adapting,
    /// Full sweeps that are discarded.
    BurningIn,
    /// Every `thin`-th sweep is retained.
    Sampling,
    Done,
}

impl ChainPhase {
    pub fn name(self) -> &'static str {
        match self {
            ChainPhase::Uninitialized => "uninitialized",
            ChainPhase::Adapting => "adapting",
            ChainPhase::BurningIn => "burning in",
            ChainPhase::Sampling => "sampling",
            ChainPhase::Done => "done",
        }
    }
}

/// Outcome of a single sweep.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Progress {
    pub sweep: u64,
    pub chain: u64,
    /// Phase the sweep ran in.
    pub phase: ChainPhase,
    /// Latent states that flipped.
    pub changed_states: usize,
    pub accepted: u64,
    pub proposed: u64,
    pub retained: bool,
}

/// One Markov chain: alternates the latent state sweep and the
/// parameter sweep.
pub struct OccupancyChain<'model, R: Rng> {
    model: &'model OccupancyModel,
    rng: R,
    chain: u64,
    phase: ChainPhase,
    strategy: InitStrategy,
    params: Params,
    latent: LatentStates,
    parameters: ParameterSampler,
    num_adapt: u64,
    num_burnin: u64,
    num_draws: u64,
    thin: u64,
    sweep_count: u64,
    phase_sweeps: u64,
    retained: u64,
}

impl<'model, R: Rng> OccupancyChain<'model, R> {
    pub fn new(
        model: &'model OccupancyModel,
        settings: &SamplerSettings,
        chain: u64,
        mut rng: R,
    ) -> Self {
        let strategy = settings.init_strategy(chain);
        let params = model.initial_params(&mut rng);
        let latent = LatentStates::initialize(model.data(), strategy, &mut rng);
        let parameters = ParameterSampler::new(
            model,
            settings.adapt_options,
            settings.initial_proposal_scale,
            settings.target_accept,
        );
        OccupancyChain {
            model,
            rng,
            chain,
            phase: ChainPhase::Uninitialized,
            strategy,
            params,
            latent,
            parameters,
            num_adapt: settings.num_adapt,
            num_burnin: settings.num_burnin,
            num_draws: settings.num_draws,
            thin: settings.thin,
            sweep_count: 0,
            phase_sweeps: 0,
            retained: 0,
        }
    }

    /// Replace the drawn starting values. Only possible before the first
    /// sweep.
    pub fn set_initial_values(&mut self, params: Params, latent: LatentStates) -> Result<()> {
        if self.phase != ChainPhase::Uninitialized {
            return Err(OccupancyError::InvalidPhase {
                chain: self.chain,
                phase: self.phase.name(),
            });
        }
        self.model.check_params(&params)?;
        if !params.is_valid() {
            return Err(OccupancyError::ParameterMismatch {
                reason: "starting values outside their domain".to_string(),
            });
        }
        if (latent.n_sites(), latent.n_seasons())
            != (self.latent.n_sites(), self.latent.n_seasons())
        {
            return Err(OccupancyError::ParameterMismatch {
                reason: format!(
                    "latent states have shape {}x{}",
                    latent.n_sites(),
                    latent.n_seasons()
                ),
            });
        }
        self.params = params;
        // Detections stay forced no matter what the caller passes.
        let mut fresh = LatentStates::initialize(self.model.data(), self.strategy, &mut self.rng);
        for site in 0..fresh.n_sites() {
            for season in 0..fresh.n_seasons() {
                fresh.set(site, season, latent.is_occupied(site, season));
            }
        }
        self.latent = fresh;
        Ok(())
    }

    pub fn phase(&self) -> ChainPhase {
        self.phase
    }

    pub fn chain_id(&self) -> u64 {
        self.chain
    }

    pub fn init_strategy(&self) -> InitStrategy {
        self.strategy
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn latent(&self) -> &LatentStates {
        &self.latent
    }

    pub fn sweeps(&self) -> u64 {
        self.sweep_count
    }

    pub fn retained(&self) -> u64 {
        self.retained
    }

    /// Total number of sweeps the chain runs if it is not stopped early.
    pub fn total_sweeps(&self) -> u64 {
        self.num_adapt + self.num_burnin + self.num_draws * self.thin
    }

    pub fn parameter_sampler(&self) -> &ParameterSampler {
        &self.parameters
    }

    /// End the chain early. Retained draws stay valid.
    pub fn finish(&mut self) {
        if self.phase != ChainPhase::Done {
            debug!(chain = self.chain, sweeps = self.sweep_count, "chain stopped");
            self.phase = ChainPhase::Done;
        }
    }

    fn phase_length(&self, phase: ChainPhase) -> u64 {
        match phase {
            ChainPhase::Adapting => self.num_adapt,
            ChainPhase::BurningIn => self.num_burnin,
            ChainPhase::Sampling => self.num_draws * self.thin,
            ChainPhase::Uninitialized | ChainPhase::Done => 0,
        }
    }

    fn next_phase(phase: ChainPhase) -> ChainPhase {
        match phase {
            ChainPhase::Uninitialized => ChainPhase::Adapting,
            ChainPhase::Adapting => ChainPhase::BurningIn,
            ChainPhase::BurningIn => ChainPhase::Sampling,
            ChainPhase::Sampling | ChainPhase::Done => ChainPhase::Done,
        }
    }

    /// Move to the next phase with a non-zero length.
    fn advance_phase(&mut self) {
        loop {
            let from = self.phase;
            if from == ChainPhase::Adapting {
                self.parameters.finalize_adaptation();
                debug!(
                    chain = self.chain,
                    scales = ?self.parameters.proposal_scales(),
                    "adaptation finished"
                );
            }
            self.phase = Self::next_phase(from);
            self.phase_sweeps = 0;
            debug!(chain = self.chain, from = from.name(), to = self.phase.name(), "phase change");
            if self.phase == ChainPhase::Done || self.phase_length(self.phase) > 0 {
                break;
            }
        }
    }

    /// Run one sweep: latent states given parameters, then parameters
    /// given latent states. Returns the snapshot when the sweep is
    /// retained.
    pub fn sweep(&mut self) -> Result<(Option<Draw>, Progress)> {
        if self.phase == ChainPhase::Uninitialized {
            self.advance_phase();
        }
        if self.phase == ChainPhase::Done {
            return Err(OccupancyError::InvalidPhase {
                chain: self.chain,
                phase: self.phase.name(),
            });
        }
        let phase = self.phase;

        let probs = self.model.probabilities(&self.params);
        let changed_states =
            sample_latent_states(self.model.data(), &probs, &mut self.latent, &mut self.rng);
        let stats = self
            .parameters
            .sweep(self.model, &mut self.params, &self.latent, &mut self.rng);

        self.sweep_count += 1;
        self.phase_sweeps += 1;

        let keep = phase == ChainPhase::Sampling && self.phase_sweeps % self.thin == 0;
        let draw = if keep {
            let draw = self.snapshot(self.retained);
            self.retained += 1;
            Some(draw)
        } else {
            None
        };

        if self.phase_sweeps >= self.phase_length(phase) {
            self.advance_phase();
        }

        let progress = Progress {
            sweep: self.sweep_count - 1,
            chain: self.chain,
            phase,
            changed_states,
            accepted: stats.accepted,
            proposed: stats.proposed,
            retained: keep,
        };
        Ok((draw, progress))
    }

    /// Snapshot of the current parameters, latent states and their
    /// derived quantities.
    pub fn snapshot(&self, iteration: u64) -> Draw {
        let probs = self.model.probabilities(&self.params);
        let derived = DerivedQuantities::compute(&probs, &self.latent);
        let deviance = -2. * self.model.observation_loglik(&probs, &self.latent);
        Draw {
            chain: self.chain,
            iteration,
            params: self.params.clone(),
            latent: self.latent.clone(),
            derived,
            deviance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data::{DetectionArray, SurveyData},
        model::{CovariateDesign, ModelSpec, Priors},
    };
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn model() -> OccupancyModel {
        let mut values = vec![Some(false); 6 * 3 * 2];
        values[0] = Some(true);
        values[(2 * 3 + 1) * 2 + 1] = Some(true);
        let detections = DetectionArray::new(6, 3, 2, values).unwrap();
        let data = SurveyData::fully_surveyed(detections).unwrap();
        OccupancyModel::new(data, ModelSpec::Dynamic, Priors::default()).unwrap()
    }

    fn covariate_model() -> OccupancyModel {
        let data = model()
            .data()
            .clone()
            .with_site_covariate("elevation", vec![3., 1., 4., 1., 5., 9.])
            .unwrap()
            .with_site_covariate("forest", vec![0.2, 0.6, 0.1, 0.8, 0.5, 0.3])
            .unwrap()
            .with_survey_covariate("date", (0..36).map(|i| 100. + (i % 6) as f64).collect())
            .unwrap();
        let spec = ModelSpec::Covariate(CovariateDesign::default());
        OccupancyModel::new(data, spec, Priors::default()).unwrap()
    }

    fn settings() -> SamplerSettings {
        SamplerSettings {
            num_adapt: 5,
            num_burnin: 7,
            num_draws: 10,
            thin: 3,
            ..Default::default()
        }
    }

    #[test]
    fn phases_run_in_order() {
        let model = model();
        let settings = settings();
        let rng = ChaCha8Rng::seed_from_u64(1);
        let mut chain = OccupancyChain::new(&model, &settings, 0, rng);
        assert_eq!(chain.phase(), ChainPhase::Uninitialized);
        assert_eq!(chain.total_sweeps(), 5 + 7 + 30);

        let mut phases = Vec::new();
        let mut draws = Vec::new();
        while chain.phase() != ChainPhase::Done {
            let (draw, progress) = chain.sweep().unwrap();
            phases.push(progress.phase);
            draws.extend(draw);
        }
        assert_eq!(phases.len(), 42);
        assert!(phases.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(phases.iter().filter(|p| **p == ChainPhase::Adapting).count(), 5);
        assert_eq!(phases.iter().filter(|p| **p == ChainPhase::BurningIn).count(), 7);
        assert_eq!(draws.len(), 10);
        assert_eq!(
            draws.iter().map(|d| d.iteration).collect::<Vec<_>>(),
            (0..10).collect::<Vec<_>>()
        );
        assert!(chain.sweep().is_err());
    }

    #[test]
    fn empty_phases_are_skipped() {
        let model = model();
        let settings = SamplerSettings {
            num_adapt: 0,
            num_burnin: 0,
            num_draws: 2,
            thin: 1,
            ..Default::default()
        };
        let mut chain = OccupancyChain::new(&model, &settings, 2, ChaCha8Rng::seed_from_u64(2));
        let (draw, progress) = chain.sweep().unwrap();
        assert_eq!(progress.phase, ChainPhase::Sampling);
        assert!(draw.is_some());
        chain.sweep().unwrap();
        assert_eq!(chain.phase(), ChainPhase::Done);
    }

    #[test]
    fn forced_states_survive_every_sweep() {
        let model = model();
        let settings = settings();
        let mut chain =
            OccupancyChain::new(&model, &settings, 1, ChaCha8Rng::seed_from_u64(3));
        while chain.phase() != ChainPhase::Done {
            let (draw, _) = chain.sweep().unwrap();
            assert!(chain.latent().is_occupied(0, 0));
            assert!(chain.latent().is_occupied(2, 1));
            if let Some(draw) = draw {
                assert!(draw.params.is_valid());
                assert!(draw.latent.get(2, 1).is_forced());
                assert!(draw.deviance.is_finite());
            }
        }
    }

    #[test]
    fn proposal_scales_freeze_after_adaptation() {
        let model = covariate_model();
        let settings = settings();
        let mut chain =
            OccupancyChain::new(&model, &settings, 0, ChaCha8Rng::seed_from_u64(6));
        let mut frozen: Option<Vec<f64>> = None;
        while chain.phase() != ChainPhase::Done {
            chain.sweep().unwrap();
            if chain.phase() <= ChainPhase::Adapting {
                continue;
            }
            let scales = chain.parameter_sampler().proposal_scales();
            assert_eq!(scales.len(), 12);
            match &frozen {
                Some(first) => assert_eq!(&scales, first),
                None => frozen = Some(scales),
            }
        }
        let rates = chain.parameter_sampler().acceptance_rates();
        assert_eq!(rates.len(), 12);
        assert!(rates.iter().all(|r| (0. ..=1.).contains(r)));

        // Beta updates only
        let model = self::model();
        let chain = OccupancyChain::new(&model, &settings, 0, ChaCha8Rng::seed_from_u64(6));
        assert!(chain.parameter_sampler().acceptance_rates().is_empty());
    }

    #[test]
    fn early_finish_keeps_counts() {
        let model = model();
        let settings = settings();
        let mut chain =
            OccupancyChain::new(&model, &settings, 0, ChaCha8Rng::seed_from_u64(4));
        for _ in 0..20 {
            chain.sweep().unwrap();
        }
        chain.finish();
        assert_eq!(chain.phase(), ChainPhase::Done);
        assert_eq!(chain.sweeps(), 20);
        assert_eq!(chain.retained(), 2);
    }

    #[test]
    fn initial_values_only_before_first_sweep() {
        let model = model();
        let settings = settings();
        let mut chain =
            OccupancyChain::new(&model, &settings, 0, ChaCha8Rng::seed_from_u64(5));
        let params = chain.params().clone();
        let latent = chain.latent().clone();
        chain
            .set_initial_values(params.clone(), latent.clone())
            .unwrap();
        chain.sweep().unwrap();
        assert!(chain.set_initial_values(params, latent).is_err());
    }
}
