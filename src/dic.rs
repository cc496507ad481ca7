//! Deviance information criterion and model ranking.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    error::{OccupancyError, Result},
    math::{bernoulli_logp, mean_var},
    model::{ModelKind, OccupancyModel},
    trace::Trace,
};

/// How the effective number of parameters is estimated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PenaltyKind {
    /// Half the posterior variance of the deviance.
    HalfVariance,
    /// Mean deviance minus the deviance at the posterior mean of each
    /// record's success probability.
    PlugIn,
}

impl PenaltyKind {
    pub fn default_for(kind: ModelKind) -> PenaltyKind {
        match kind {
            ModelKind::Null | ModelKind::Dynamic => PenaltyKind::PlugIn,
            ModelKind::Covariate => PenaltyKind::HalfVariance,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DicSummary {
    pub kind: ModelKind,
    pub mean_deviance: f64,
    pub penalty: f64,
    pub penalty_kind: PenaltyKind,
    pub dic: f64,
    /// Draws the summary is based on, pooled over chains.
    pub draws: usize,
}

/// DIC of a fitted model over every retained draw of every chain.
pub fn dic(
    model: &OccupancyModel,
    trace: &Trace,
    penalty_kind: PenaltyKind,
) -> Result<DicSummary> {
    let deviances = trace.draws().map(|d| d.deviance).collect::<Vec<_>>();
    if deviances.len() < 2 {
        return Err(OccupancyError::TooFewDraws {
            min: 2,
            got: deviances.len(),
        });
    }
    let (mean_deviance, var_deviance) = mean_var(&deviances);

    let penalty = match penalty_kind {
        PenaltyKind::HalfVariance => var_deviance / 2.,
        PenaltyKind::PlugIn => mean_deviance - plug_in_deviance(model, trace),
    };

    Ok(DicSummary {
        kind: model.kind(),
        mean_deviance,
        penalty,
        penalty_kind,
        dic: mean_deviance + penalty,
        draws: deviances.len(),
    })
}

/// Deviance at the posterior mean of `z * p` for every observed record.
fn plug_in_deviance(model: &OccupancyModel, trace: &Trace) -> f64 {
    let data = model.data();
    let slots = data.n_sites() * data.n_seasons() * data.n_replicates();
    let mut success = vec![0f64; slots];
    let mut count = 0usize;
    for draw in trace.draws() {
        let probs = model.probabilities(&draw.params);
        for site in 0..data.n_sites() {
            for season in 0..data.n_seasons() {
                let occupied = draw.latent.is_occupied(site, season);
                for (rep, _) in data.observations(site, season) {
                    let slot = data.detections().index(site, season, rep);
                    success[slot] += probs.detection_given_state(site, season, rep, occupied);
                }
            }
        }
        count += 1;
    }

    let mut loglik = 0f64;
    for site in 0..data.n_sites() {
        for season in 0..data.n_seasons() {
            for (rep, y) in data.observations(site, season) {
                let slot = data.detections().index(site, season, rep);
                loglik += bernoulli_logp(y, success[slot] / count as f64);
            }
        }
    }
    -2. * loglik
}

/// One entry of a DIC ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedModel {
    pub summary: DicSummary,
    /// Difference to the best (lowest) DIC.
    pub delta: f64,
}

/// Rank fitted models by DIC, best first, each with its default penalty.
pub fn compare_models(fits: &[(&OccupancyModel, &Trace)]) -> Result<Vec<RankedModel>> {
    let mut summaries = fits
        .iter()
        .map(|(model, trace)| dic(model, trace, PenaltyKind::default_for(model.kind())))
        .collect::<Result<Vec<_>>>()?;
    summaries.sort_by(|a, b| a.dic.total_cmp(&b.dic));
    let best = summaries.first().map_or(f64::NAN, |s| s.dic);

    let ranked = summaries
        .into_iter()
        .map(|summary| RankedModel {
            delta: summary.dic - best,
            summary,
        })
        .collect::<Vec<_>>();
    for entry in &ranked {
        info!(
            kind = %entry.summary.kind,
            dic = entry.summary.dic,
            delta = entry.delta,
            "model comparison"
        );
    }
    Ok(ranked)
}
