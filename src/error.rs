use thiserror::Error;

/// Errors raised while validating input or settings.
///
/// Everything in here is detected before a chain starts. Rejected
/// proposals during sampling are part of the algorithm and never show up
/// as an error.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OccupancyError {
    #[error("detection array has {got} entries, expected {sites} x {seasons} x {replicates}")]
    ShapeMismatch {
        sites: usize,
        seasons: usize,
        replicates: usize,
        got: usize,
    },

    #[error("detection array must have at least one site, season and replicate")]
    EmptyDesign,

    #[error("survey counts have {got} entries for {sites} sites")]
    SurveyCountLength { sites: usize, got: usize },

    #[error("site {site} reports {surveys} surveys but the array has {replicates} replicates")]
    SurveyCountTooLarge {
        site: usize,
        surveys: usize,
        replicates: usize,
    },

    #[error(
        "site {site}, season {season}, replicate {replicate} lies beyond the {surveys} surveys"
    )]
    RecordBeyondSurveyCount {
        site: usize,
        season: usize,
        replicate: usize,
        surveys: usize,
    },

    #[error("covariate `{name}` has {got} values, expected {expected}")]
    CovariateLength {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("covariate `{name}` contains non-finite values at surveyed slots")]
    NonFiniteCovariate { name: String },

    #[error("covariate `{name}` has zero variance and cannot be standardized")]
    ConstantCovariate { name: String },

    #[error("required covariate `{name}` is missing")]
    MissingCovariate { name: String },

    #[error("survey-level covariate `{name}` cannot drive the {process} process")]
    SurveyTermNotAllowed { name: String, process: &'static str },

    #[error("invalid prior: {reason}")]
    InvalidPrior { reason: String },

    #[error("invalid sampler settings: {reason}")]
    InvalidSettings { reason: String },

    #[error("parameter set does not match the model variant: {reason}")]
    ParameterMismatch { reason: String },

    #[error("need at least {min} chains, got {got}")]
    TooFewChains { min: usize, got: usize },

    #[error("need at least {min} draws per chain, got {got}")]
    TooFewDraws { min: usize, got: usize },

    #[error("chain {chain} cannot sweep while {phase}")]
    InvalidPhase { chain: u64, phase: &'static str },

    #[error("unknown monitored quantity `{name}`")]
    UnknownQuantity { name: String },
}

pub type Result<T> = std::result::Result<T, OccupancyError>;
