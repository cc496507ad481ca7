//! Bayesian dynamic site-occupancy models fitted by Gibbs and Metropolis
//! sampling.
//!
//! A [`SurveyData`] holds detection / non-detection records per site,
//! season and replicate survey. An [`OccupancyModel`] binds the data to one
//! of three variants (null, dynamic, covariate). Chains are run with
//! [`sample_chains`] or, for a handle that can be stopped early, with
//! [`Sampler`]. The resulting [`Trace`] feeds [`DiagnosticsReport`] and
//! [`compare_models`].
//!
//! ```no_run
//! use occupancy_mcmc::{
//!     sample_chains, DetectionArray, DiagnosticsReport, ModelSpec, OccupancyModel, Priors,
//!     SamplerSettings, SurveyData,
//! };
//!
//! # fn main() -> anyhow::Result<()> {
//! let records = vec![Some(true), Some(false), Some(false), None];
//! let detections = DetectionArray::new(2, 1, 2, records)?;
//! let data = SurveyData::new(detections, vec![2, 1])?;
//! let model = OccupancyModel::new(data, ModelSpec::Null, Priors::default())?;
//!
//! let trace = sample_chains(&model, &SamplerSettings::default())?;
//! let report = DiagnosticsReport::new(&model, &trace)?;
//! println!("max R-hat {}", report.max_rhat());
//! # Ok(())
//! # }
//! ```

pub(crate) mod chain;
pub(crate) mod data;
pub(crate) mod derived;
pub(crate) mod diagnostics;
pub(crate) mod dic;
pub(crate) mod error;
pub(crate) mod latent;
pub(crate) mod math;
pub(crate) mod model;
pub(crate) mod parameters;
pub(crate) mod proposal;
pub(crate) mod sampler;
pub(crate) mod simulate;
pub(crate) mod trace;

pub use chain::{ChainPhase, OccupancyChain, Progress};
pub use data::{
    DetectionArray, Observation, SiteCovariate, Standardization, SurveyCovariate, SurveyData,
};
pub use derived::DerivedQuantities;
pub use diagnostics::{
    effective_sample_size, multivariate_psrf, potential_scale_reduction, DiagnosticsReport,
    ParameterSummary, Psrf, RHAT_WARNING,
};
pub use dic::{compare_models, dic, DicSummary, PenaltyKind, RankedModel};
pub use error::{OccupancyError, Result};
pub use latent::{
    occupied_conditional, sample_latent_states, InitStrategy, LatentState, LatentStates,
};
pub use math::{expit, logit};
pub use model::{
    BetaPrior, CovariateDesign, ModelKind, ModelSpec, OccupancyModel, Params, Priors,
    Probabilities, Process, Term,
};
pub use parameters::{ParameterSampler, StateCounts, SweepStats};
pub use proposal::{AcceptanceRate, DualAverageOptions, ProposalScale};
pub use sampler::{
    sample_chains, sample_sequentially, ChainProgress, ProgressCallback, Sampler,
    SamplerSettings, SamplerWaitResult,
};
pub use simulate::{simulate, SimulatedSurvey};
pub use trace::{monitor_names, ChainOutput, Draw, Trace};
