//! Priors, latent-state transition law and observation likelihood for the
//! three model variants.
//!
//! All variants share one contract: they turn a [`Params`] value into the
//! per-site, per-season [`Probabilities`] that the samplers consume. The
//! chain driver and the diagnostics never look at the variant.

use std::fmt;

use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::{
    data::SurveyData,
    error::{OccupancyError, Result},
    latent::LatentStates,
    math::{bernoulli_logp, beta_logpdf, expit, normal_logpdf},
};

/// The four processes of a dynamic occupancy model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Process {
    Occupancy,
    Survival,
    Colonization,
    Detection,
}

impl Process {
    pub const ALL: [Process; 4] = [
        Process::Occupancy,
        Process::Survival,
        Process::Colonization,
        Process::Detection,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Process::Occupancy => "occupancy",
            Process::Survival => "survival",
            Process::Colonization => "colonization",
            Process::Detection => "detection",
        }
    }
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One slope of a logit-linear predictor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Term {
    /// A per-site covariate.
    Site(String),
    /// A per-survey covariate. Only valid for detection.
    Survey(String),
    /// The square of a per-survey covariate. Only valid for detection.
    SurveySquared(String),
}

impl Term {
    fn label(&self) -> String {
        match self {
            Term::Site(name) | Term::Survey(name) => name.clone(),
            Term::SurveySquared(name) => format!("{name}^2"),
        }
    }
}

/// Which covariates drive each process of the covariate model.
///
/// Every process always carries an intercept in addition to its terms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovariateDesign {
    pub occupancy: Vec<Term>,
    pub survival: Vec<Term>,
    pub colonization: Vec<Term>,
    pub detection: Vec<Term>,
}

impl Default for CovariateDesign {
    fn default() -> Self {
        let site = || {
            vec![
                Term::Site("elevation".to_string()),
                Term::Site("forest".to_string()),
            ]
        };
        Self {
            occupancy: site(),
            survival: site(),
            colonization: site(),
            detection: vec![
                Term::Survey("date".to_string()),
                Term::SurveySquared("date".to_string()),
            ],
        }
    }
}

impl CovariateDesign {
    pub fn terms(&self, process: Process) -> &[Term] {
        match process {
            Process::Occupancy => &self.occupancy,
            Process::Survival => &self.survival,
            Process::Colonization => &self.colonization,
            Process::Detection => &self.detection,
        }
    }
}

/// Model variant selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ModelSpec {
    /// Constant initial occupancy, survival, colonization and detection.
    Null,
    /// Per-transition survival and colonization, per-season detection.
    Dynamic,
    /// Logit-linear regressions on standardized covariates.
    Covariate(CovariateDesign),
}

impl ModelSpec {
    pub fn kind(&self) -> ModelKind {
        match self {
            ModelSpec::Null => ModelKind::Null,
            ModelSpec::Dynamic => ModelKind::Dynamic,
            ModelSpec::Covariate(_) => ModelKind::Covariate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelKind {
    Null,
    Dynamic,
    Covariate,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::Null => f.write_str("null"),
            ModelKind::Dynamic => f.write_str("dynamic"),
            ModelKind::Covariate => f.write_str("covariate"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BetaPrior {
    pub a: f64,
    pub b: f64,
}

impl Default for BetaPrior {
    fn default() -> Self {
        BetaPrior { a: 1., b: 1. }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Priors {
    /// Prior of every probability-valued parameter.
    pub probability: BetaPrior,
    /// Standard deviation of the zero-mean normal prior on each
    /// regression coefficient.
    pub coefficient_sd: f64,
}

impl Default for Priors {
    fn default() -> Self {
        Priors {
            probability: BetaPrior::default(),
            coefficient_sd: 10.,
        }
    }
}

impl Priors {
    pub fn validate(&self) -> Result<()> {
        let BetaPrior { a, b } = self.probability;
        if !(a.is_finite() && b.is_finite() && a > 0. && b > 0.) {
            return Err(OccupancyError::InvalidPrior {
                reason: format!("beta shape parameters must be positive, got ({a}, {b})"),
            });
        }
        if !(self.coefficient_sd.is_finite() && self.coefficient_sd > 0.) {
            return Err(OccupancyError::InvalidPrior {
                reason: format!(
                    "coefficient prior sd must be positive, got {}",
                    self.coefficient_sd
                ),
            });
        }
        Ok(())
    }
}

/// Current value of every parameter of one chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Params {
    Null {
        psi1: f64,
        phi: f64,
        gamma: f64,
        p: f64,
    },
    Dynamic {
        psi1: f64,
        /// Survival from season `t` to `t + 1`.
        phi: Vec<f64>,
        /// Colonization from season `t` to `t + 1`.
        gamma: Vec<f64>,
        /// Detection in season `t`.
        p: Vec<f64>,
    },
    Covariate {
        occupancy: Vec<f64>,
        survival: Vec<f64>,
        colonization: Vec<f64>,
        detection: Vec<f64>,
    },
}

impl Params {
    /// Flattened parameter values, in the order of
    /// [`OccupancyModel::parameter_names`].
    pub fn values(&self) -> Vec<f64> {
        match self {
            Params::Null {
                psi1,
                phi,
                gamma,
                p,
            } => vec![*psi1, *phi, *gamma, *p],
            Params::Dynamic {
                psi1,
                phi,
                gamma,
                p,
            } => std::iter::once(*psi1)
                .chain(phi.iter().copied())
                .chain(gamma.iter().copied())
                .chain(p.iter().copied())
                .collect(),
            Params::Covariate {
                occupancy,
                survival,
                colonization,
                detection,
            } => occupancy
                .iter()
                .chain(survival)
                .chain(colonization)
                .chain(detection)
                .copied()
                .collect(),
        }
    }

    /// Probability parameters lie in [0, 1] and coefficients are finite.
    pub fn is_valid(&self) -> bool {
        let unit = |x: f64| (0. ..=1.).contains(&x);
        match self {
            Params::Null { .. } | Params::Dynamic { .. } => self.values().into_iter().all(unit),
            Params::Covariate { .. } => self.values().iter().all(|x| x.is_finite()),
        }
    }

    pub fn coefficients(&self, process: Process) -> Option<&[f64]> {
        match self {
            Params::Covariate {
                occupancy,
                survival,
                colonization,
                detection,
            } => Some(match process {
                Process::Occupancy => occupancy,
                Process::Survival => survival,
                Process::Colonization => colonization,
                Process::Detection => detection,
            }),
            _ => None,
        }
    }

    pub(crate) fn coefficients_mut(&mut self, process: Process) -> Option<&mut Vec<f64>> {
        match self {
            Params::Covariate {
                occupancy,
                survival,
                colonization,
                detection,
            } => Some(match process {
                Process::Occupancy => occupancy,
                Process::Survival => survival,
                Process::Colonization => colonization,
                Process::Detection => detection,
            }),
            _ => None,
        }
    }
}

/// Row-major design matrix with a leading intercept column.
#[derive(Debug, Clone)]
pub(crate) struct DesignMatrix {
    ncols: usize,
    values: Box<[f64]>,
}

impl DesignMatrix {
    #[inline]
    pub(crate) fn row(&self, row: usize) -> &[f64] {
        &self.values[row * self.ncols..(row + 1) * self.ncols]
    }

    #[inline]
    pub(crate) fn linear_predictor(&self, row: usize, beta: &[f64]) -> f64 {
        self.row(row).iter().zip(beta).map(|(x, b)| x * b).sum()
    }

    pub(crate) fn ncols(&self) -> usize {
        self.ncols
    }
}

/// Design matrices of the covariate model.
///
/// Occupancy, survival and colonization rows are indexed by site,
/// detection rows by the flat `(site, season, replicate)` slot.
#[derive(Debug, Clone)]
pub(crate) struct CompiledDesign {
    pub(crate) occupancy: DesignMatrix,
    pub(crate) survival: DesignMatrix,
    pub(crate) colonization: DesignMatrix,
    pub(crate) detection: DesignMatrix,
}

impl CompiledDesign {
    fn compile(data: &SurveyData, design: &CovariateDesign) -> Result<Self> {
        Ok(Self {
            occupancy: site_matrix(data, Process::Occupancy, &design.occupancy)?,
            survival: site_matrix(data, Process::Survival, &design.survival)?,
            colonization: site_matrix(data, Process::Colonization, &design.colonization)?,
            detection: survey_matrix(data, &design.detection)?,
        })
    }

    pub(crate) fn matrix(&self, process: Process) -> &DesignMatrix {
        match process {
            Process::Occupancy => &self.occupancy,
            Process::Survival => &self.survival,
            Process::Colonization => &self.colonization,
            Process::Detection => &self.detection,
        }
    }
}

fn site_matrix(data: &SurveyData, process: Process, terms: &[Term]) -> Result<DesignMatrix> {
    let columns = terms
        .iter()
        .map(|term| match term {
            Term::Site(name) => data
                .site_covariate(name)
                .map(|cov| &cov.values)
                .ok_or_else(|| OccupancyError::MissingCovariate { name: name.clone() }),
            Term::Survey(name) | Term::SurveySquared(name) => {
                Err(OccupancyError::SurveyTermNotAllowed {
                    name: name.clone(),
                    process: process.name(),
                })
            }
        })
        .collect::<Result<Vec<_>>>()?;

    let ncols = columns.len() + 1;
    let mut values = Vec::with_capacity(data.n_sites() * ncols);
    for site in 0..data.n_sites() {
        values.push(1.);
        values.extend(columns.iter().map(|col| col[site]));
    }
    Ok(DesignMatrix {
        ncols,
        values: values.into(),
    })
}

fn survey_matrix(data: &SurveyData, terms: &[Term]) -> Result<DesignMatrix> {
    let missing = |name: &String| OccupancyError::MissingCovariate { name: name.clone() };
    for term in terms {
        match term {
            Term::Site(name) => {
                data.site_covariate(name).ok_or_else(|| missing(name))?;
            }
            Term::Survey(name) | Term::SurveySquared(name) => {
                data.survey_covariate(name).ok_or_else(|| missing(name))?;
            }
        }
    }

    let ncols = terms.len() + 1;
    let slots = data.n_sites() * data.n_seasons() * data.n_replicates();
    let mut values = Vec::with_capacity(slots * ncols);
    for site in 0..data.n_sites() {
        for season in 0..data.n_seasons() {
            for rep in 0..data.n_replicates() {
                values.push(1.);
                for term in terms {
                    // Presence of every covariate was checked above.
                    let value = match term {
                        Term::Site(name) => data
                            .site_covariate(name)
                            .map_or(0., |cov| cov.values[site]),
                        Term::Survey(name) => data
                            .survey_covariate(name)
                            .map_or(0., |cov| data.survey_value(cov, site, season, rep)),
                        Term::SurveySquared(name) => data
                            .survey_covariate(name)
                            .map_or(0., |cov| data.survey_value(cov, site, season, rep).powi(2)),
                    };
                    values.push(value);
                }
            }
        }
    }
    Ok(DesignMatrix {
        ncols,
        values: values.into(),
    })
}

/// Probabilities implied by one parameter set, expanded to every site,
/// season and replicate.
#[derive(Debug, Clone)]
pub struct Probabilities {
    sites: usize,
    seasons: usize,
    replicates: usize,
    psi1: Box<[f64]>,
    phi: Box<[f64]>,
    gamma: Box<[f64]>,
    p: Box<[f64]>,
}

impl Probabilities {
    #[inline]
    pub fn initial_occupancy(&self, site: usize) -> f64 {
        self.psi1[site]
    }

    /// Survival from `season` to `season + 1`.
    #[inline]
    pub fn survival(&self, site: usize, season: usize) -> f64 {
        self.phi[site * (self.seasons - 1) + season]
    }

    /// Colonization from `season` to `season + 1`.
    #[inline]
    pub fn colonization(&self, site: usize, season: usize) -> f64 {
        self.gamma[site * (self.seasons - 1) + season]
    }

    /// Probability that the site is occupied in `season`.
    ///
    /// The first season has no predecessor and uses the initial occupancy
    /// probability; `previous` is ignored there.
    #[inline]
    pub fn transition(&self, site: usize, season: usize, previous: bool) -> f64 {
        if season == 0 {
            self.initial_occupancy(site)
        } else if previous {
            self.survival(site, season - 1)
        } else {
            self.colonization(site, season - 1)
        }
    }

    /// Detection probability of a survey, given the site is occupied.
    #[inline]
    pub fn detection(&self, site: usize, season: usize, replicate: usize) -> f64 {
        self.p[(site * self.seasons + season) * self.replicates + replicate]
    }

    /// Probability of a positive record given the latent state.
    #[inline]
    pub fn detection_given_state(
        &self,
        site: usize,
        season: usize,
        replicate: usize,
        occupied: bool,
    ) -> f64 {
        if occupied {
            self.detection(site, season, replicate)
        } else {
            0.
        }
    }

    pub fn n_sites(&self) -> usize {
        self.sites
    }

    pub fn n_seasons(&self) -> usize {
        self.seasons
    }
}

/// A model variant bound to its data.
#[derive(Debug, Clone)]
pub struct OccupancyModel {
    data: SurveyData,
    spec: ModelSpec,
    priors: Priors,
    design: Option<CompiledDesign>,
    names: Vec<String>,
}

impl OccupancyModel {
    pub fn new(data: SurveyData, spec: ModelSpec, priors: Priors) -> Result<Self> {
        priors.validate()?;
        let design = match &spec {
            ModelSpec::Covariate(design) => Some(CompiledDesign::compile(&data, design)?),
            _ => None,
        };
        let names = parameter_names(&spec, data.n_seasons());
        Ok(Self {
            data,
            spec,
            priors,
            design,
            names,
        })
    }

    pub fn data(&self) -> &SurveyData {
        &self.data
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    pub fn kind(&self) -> ModelKind {
        self.spec.kind()
    }

    pub fn priors(&self) -> &Priors {
        &self.priors
    }

    pub(crate) fn design(&self) -> Option<&CompiledDesign> {
        self.design.as_ref()
    }

    /// Names of the flattened parameter values, see [`Params::values`].
    pub fn parameter_names(&self) -> &[String] {
        &self.names
    }

    /// Whether the replicate slot is structurally excluded for the site.
    pub fn is_excluded(&self, site: usize, replicate: usize) -> bool {
        self.data.is_excluded(site, replicate)
    }

    /// Check that a parameter set has the shape this variant expects.
    pub fn check_params(&self, params: &Params) -> Result<()> {
        let mismatch = |reason: String| Err(OccupancyError::ParameterMismatch { reason });
        let transitions = self.data.n_seasons() - 1;
        match (&self.spec, params) {
            (ModelSpec::Null, Params::Null { .. }) => {}
            (ModelSpec::Dynamic, Params::Dynamic { phi, gamma, p, .. }) => {
                if phi.len() != transitions || gamma.len() != transitions {
                    return mismatch(format!("expected {transitions} transition probabilities"));
                }
                if p.len() != self.data.n_seasons() {
                    return mismatch(format!(
                        "expected {} detection probabilities",
                        self.data.n_seasons()
                    ));
                }
            }
            (ModelSpec::Covariate(_), Params::Covariate { .. }) => {
                for process in Process::ALL {
                    let expected = self.coefficient_count(process);
                    let got = params.coefficients(process).map_or(0, |c| c.len());
                    if got != expected {
                        return mismatch(format!(
                            "{process} needs {expected} coefficients, got {got}"
                        ));
                    }
                }
            }
            _ => return mismatch(format!("{} model got other parameters", self.kind())),
        }
        Ok(())
    }

    pub(crate) fn coefficient_count(&self, process: Process) -> usize {
        self.design
            .as_ref()
            .map_or(0, |design| design.matrix(process).ncols())
    }

    /// Prior log-density of every flattened parameter value.
    pub fn log_prior_terms(&self, params: &Params) -> Vec<f64> {
        let BetaPrior { a, b } = self.priors.probability;
        let sd = self.priors.coefficient_sd;
        match params {
            Params::Null { .. } | Params::Dynamic { .. } => params
                .values()
                .into_iter()
                .map(|x| beta_logpdf(x, a, b))
                .collect(),
            Params::Covariate { .. } => params
                .values()
                .into_iter()
                .map(|x| normal_logpdf(x, 0., sd))
                .collect(),
        }
    }

    pub fn log_prior(&self, params: &Params) -> f64 {
        self.log_prior_terms(params).into_iter().sum()
    }

    /// Expand a parameter set into per-site probabilities.
    ///
    /// # Panics
    ///
    /// If `params` do not pass [`check_params`](Self::check_params).
    pub fn probabilities(&self, params: &Params) -> Probabilities {
        let sites = self.data.n_sites();
        let seasons = self.data.n_seasons();
        let replicates = self.data.n_replicates();
        let transitions = seasons - 1;

        let (psi1, phi, gamma, p): (Vec<f64>, Vec<f64>, Vec<f64>, Vec<f64>) = match params {
            Params::Null {
                psi1,
                phi,
                gamma,
                p,
            } => (
                vec![*psi1; sites],
                vec![*phi; sites * transitions],
                vec![*gamma; sites * transitions],
                vec![*p; sites * seasons * replicates],
            ),
            Params::Dynamic {
                psi1,
                phi,
                gamma,
                p,
            } => {
                let per_site = |values: &[f64]| {
                    (0..sites)
                        .flat_map(|_| values.iter().copied())
                        .collect::<Vec<f64>>()
                };
                let detection = (0..sites)
                    .flat_map(|_| {
                        p.iter()
                            .flat_map(|&pt| std::iter::repeat(pt).take(replicates))
                    })
                    .collect();
                (vec![*psi1; sites], per_site(phi), per_site(gamma), detection)
            }
            Params::Covariate {
                occupancy,
                survival,
                colonization,
                detection,
            } => {
                let design = self
                    .design
                    .as_ref()
                    .expect("Covariate parameters require a compiled design");
                let site_probs = |matrix: &DesignMatrix, beta: &[f64]| {
                    (0..sites)
                        .map(|site| expit(matrix.linear_predictor(site, beta)))
                        .collect::<Vec<f64>>()
                };
                let repeat_seasons = |values: Vec<f64>| {
                    values
                        .into_iter()
                        .flat_map(|v| std::iter::repeat(v).take(transitions))
                        .collect::<Vec<f64>>()
                };
                let detection = (0..sites * seasons * replicates)
                    .map(|slot| expit(design.detection.linear_predictor(slot, detection)))
                    .collect();
                (
                    site_probs(&design.occupancy, occupancy),
                    repeat_seasons(site_probs(&design.survival, survival)),
                    repeat_seasons(site_probs(&design.colonization, colonization)),
                    detection,
                )
            }
        };

        Probabilities {
            sites,
            seasons,
            replicates,
            psi1: psi1.into(),
            phi: phi.into(),
            gamma: gamma.into(),
            p: p.into(),
        }
    }

    /// Log-likelihood of the detection records given latent states.
    ///
    /// Only observed slots contribute. A detection at an unoccupied
    /// site-season has likelihood zero.
    pub fn observation_loglik(&self, probs: &Probabilities, latent: &LatentStates) -> f64 {
        let mut loglik = 0f64;
        for site in 0..self.data.n_sites() {
            for season in 0..self.data.n_seasons() {
                let occupied = latent.is_occupied(site, season);
                for (rep, y) in self.data.observations(site, season) {
                    let p = probs.detection_given_state(site, season, rep, occupied);
                    loglik += bernoulli_logp(y, p);
                }
            }
        }
        loglik
    }

    /// Deviance of the observed records: `-2` times
    /// [`observation_loglik`](Self::observation_loglik).
    pub fn deviance(&self, params: &Params, latent: &LatentStates) -> f64 {
        -2. * self.observation_loglik(&self.probabilities(params), latent)
    }

    /// Draw a starting parameter set for a chain.
    pub fn initial_params<R: Rng + ?Sized>(&self, rng: &mut R) -> Params {
        let seasons = self.data.n_seasons();
        match &self.spec {
            ModelSpec::Null => Params::Null {
                psi1: unit_draw(rng),
                phi: unit_draw(rng),
                gamma: unit_draw(rng),
                p: unit_draw(rng),
            },
            ModelSpec::Dynamic => Params::Dynamic {
                psi1: unit_draw(rng),
                phi: (0..seasons - 1).map(|_| unit_draw(rng)).collect(),
                gamma: (0..seasons - 1).map(|_| unit_draw(rng)).collect(),
                p: (0..seasons).map(|_| unit_draw(rng)).collect(),
            },
            ModelSpec::Covariate(_) => {
                let mut coefs = |process: Process| {
                    (0..self.coefficient_count(process))
                        .map(|_| rng.sample::<f64, _>(StandardNormal))
                        .collect::<Vec<f64>>()
                };
                Params::Covariate {
                    occupancy: coefs(Process::Occupancy),
                    survival: coefs(Process::Survival),
                    colonization: coefs(Process::Colonization),
                    detection: coefs(Process::Detection),
                }
            }
        }
    }
}

fn unit_draw<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    rng.random_range(0.1..0.9)
}

fn parameter_names(spec: &ModelSpec, seasons: usize) -> Vec<String> {
    match spec {
        ModelSpec::Null => ["psi1", "phi", "gamma", "p"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        ModelSpec::Dynamic => std::iter::once("psi1".to_string())
            .chain((1..seasons).map(|t| format!("phi[{t}]")))
            .chain((1..seasons).map(|t| format!("gamma[{t}]")))
            .chain((1..=seasons).map(|t| format!("p[{t}]")))
            .collect(),
        ModelSpec::Covariate(design) => Process::ALL
            .iter()
            .flat_map(|&process| {
                std::iter::once(format!("{process}.intercept")).chain(
                    design
                        .terms(process)
                        .iter()
                        .map(move |term| format!("{process}.{}", term.label())),
                )
            })
            .collect(),
    }
}
