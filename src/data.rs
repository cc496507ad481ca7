//! Detection histories and covariates in the shape the sampler consumes.
//!
//! Reshaping a raw survey table into these arrays happens outside of this
//! crate. Everything here is validated on construction and immutable
//! afterwards.

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::{OccupancyError, Result};

/// One cell of the detection array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Observation {
    Missing,
    NotDetected,
    Detected,
}

impl Observation {
    pub fn is_detection(self) -> bool {
        matches!(self, Observation::Detected)
    }
}

impl From<Option<bool>> for Observation {
    fn from(value: Option<bool>) -> Self {
        match value {
            None => Observation::Missing,
            Some(false) => Observation::NotDetected,
            Some(true) => Observation::Detected,
        }
    }
}

/// Detection / non-detection records indexed by (site, season, replicate).
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionArray {
    sites: usize,
    seasons: usize,
    replicates: usize,
    values: Box<[Observation]>,
}

impl DetectionArray {
    /// Build the array from row-major `(site, season, replicate)` values.
    pub fn new(
        sites: usize,
        seasons: usize,
        replicates: usize,
        values: impl IntoIterator<Item = Option<bool>>,
    ) -> Result<Self> {
        let values: Box<[Observation]> = values.into_iter().map(Observation::from).collect();
        Self::from_observations(sites, seasons, replicates, values)
    }

    pub fn from_observations(
        sites: usize,
        seasons: usize,
        replicates: usize,
        values: impl Into<Box<[Observation]>>,
    ) -> Result<Self> {
        let values = values.into();
        if sites == 0 || seasons == 0 || replicates == 0 {
            return Err(OccupancyError::EmptyDesign);
        }
        if values.len() != sites * seasons * replicates {
            return Err(OccupancyError::ShapeMismatch {
                sites,
                seasons,
                replicates,
                got: values.len(),
            });
        }
        Ok(Self {
            sites,
            seasons,
            replicates,
            values,
        })
    }

    pub fn n_sites(&self) -> usize {
        self.sites
    }

    pub fn n_seasons(&self) -> usize {
        self.seasons
    }

    pub fn n_replicates(&self) -> usize {
        self.replicates
    }

    #[inline]
    pub(crate) fn index(&self, site: usize, season: usize, replicate: usize) -> usize {
        (site * self.seasons + season) * self.replicates + replicate
    }

    pub fn get(&self, site: usize, season: usize, replicate: usize) -> Observation {
        self.values[self.index(site, season, replicate)]
    }

    /// All replicate slots of one site-season.
    pub fn site_season(&self, site: usize, season: usize) -> &[Observation] {
        let start = self.index(site, season, 0);
        &self.values[start..start + self.replicates]
    }

    /// Whether any replicate of the site-season recorded the species.
    pub fn detected(&self, site: usize, season: usize) -> bool {
        self.site_season(site, season)
            .iter()
            .any(|obs| obs.is_detection())
    }
}

/// Mean and standard deviation used to put a covariate on the unit scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Standardization {
    pub mean: f64,
    pub sd: f64,
}

impl Standardization {
    /// Sample mean and (n - 1) standard deviation of the values.
    pub fn fit(values: &[f64]) -> Option<Standardization> {
        if values.len() < 2 {
            return None;
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.);
        let sd = var.sqrt();
        if !(sd.is_finite() && sd > 0.) {
            return None;
        }
        Some(Standardization { mean, sd })
    }

    pub fn standardize(&self, value: f64) -> f64 {
        (value - self.mean) / self.sd
    }

    pub fn back_transform(&self, value: f64) -> f64 {
        value * self.sd + self.mean
    }
}

/// A standardized covariate measured once per site.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteCovariate {
    pub name: String,
    pub values: Box<[f64]>,
    pub scaling: Standardization,
}

/// A standardized covariate measured per (site, season, replicate).
///
/// Slots without an observation carry the mean (zero on the
/// standardized scale); they never enter a likelihood term.
#[derive(Debug, Clone, PartialEq)]
pub struct SurveyCovariate {
    pub name: String,
    pub values: Box<[f64]>,
    pub scaling: Standardization,
}

/// Detection array plus everything needed to evaluate any model variant.
#[derive(Debug, Clone)]
pub struct SurveyData {
    detections: DetectionArray,
    surveys: Box<[usize]>,
    site_covariates: Vec<SiteCovariate>,
    survey_covariates: Vec<SurveyCovariate>,
}

impl SurveyData {
    /// Combine detections with the number of replicate surveys per site.
    ///
    /// A survey count larger than the array width, or any record sitting
    /// beyond a site's survey count, is rejected.
    pub fn new(detections: DetectionArray, surveys: Vec<usize>) -> Result<Self> {
        if surveys.len() != detections.n_sites() {
            return Err(OccupancyError::SurveyCountLength {
                sites: detections.n_sites(),
                got: surveys.len(),
            });
        }
        for (site, &count) in surveys.iter().enumerate() {
            if count > detections.n_replicates() {
                return Err(OccupancyError::SurveyCountTooLarge {
                    site,
                    surveys: count,
                    replicates: detections.n_replicates(),
                });
            }
            for season in 0..detections.n_seasons() {
                for replicate in count..detections.n_replicates() {
                    if detections.get(site, season, replicate) != Observation::Missing {
                        return Err(OccupancyError::RecordBeyondSurveyCount {
                            site,
                            season,
                            replicate,
                            surveys: count,
                        });
                    }
                }
            }
        }
        Ok(Self {
            detections,
            surveys: surveys.into(),
            site_covariates: Vec::new(),
            survey_covariates: Vec::new(),
        })
    }

    /// Use the full array width as the survey count of every site.
    pub fn fully_surveyed(detections: DetectionArray) -> Result<Self> {
        let surveys = vec![detections.n_replicates(); detections.n_sites()];
        Self::new(detections, surveys)
    }

    /// A survey design without outcomes: every surveyed slot reads as a
    /// non-detection, slots beyond the survey count are missing.
    pub fn unobserved(
        sites: usize,
        seasons: usize,
        replicates: usize,
        surveys: Vec<usize>,
    ) -> Result<Self> {
        if surveys.len() != sites {
            return Err(OccupancyError::SurveyCountLength {
                sites,
                got: surveys.len(),
            });
        }
        let values = surveys
            .iter()
            .flat_map(|&count| {
                (0..seasons).flat_map(move |_| {
                    (0..replicates).map(move |rep| (rep < count).then_some(false))
                })
            })
            .collect_vec();
        let detections = DetectionArray::new(sites, seasons, replicates, values)?;
        Self::new(detections, surveys)
    }

    /// Same survey counts and covariates, new detection records.
    pub fn with_detections(&self, detections: DetectionArray) -> Result<Self> {
        if (detections.n_sites(), detections.n_seasons(), detections.n_replicates())
            != (self.n_sites(), self.n_seasons(), self.n_replicates())
        {
            return Err(OccupancyError::ShapeMismatch {
                sites: self.n_sites(),
                seasons: self.n_seasons(),
                replicates: self.n_replicates(),
                got: detections.n_sites() * detections.n_seasons() * detections.n_replicates(),
            });
        }
        let mut data = Self::new(detections, self.surveys.to_vec())?;
        data.site_covariates = self.site_covariates.clone();
        data.survey_covariates = self.survey_covariates.clone();
        Ok(data)
    }

    /// Attach a raw per-site covariate; it is standardized here.
    pub fn with_site_covariate(mut self, name: &str, raw: Vec<f64>) -> Result<Self> {
        let expected = self.n_sites();
        if raw.len() != expected {
            return Err(OccupancyError::CovariateLength {
                name: name.to_string(),
                expected,
                got: raw.len(),
            });
        }
        if raw.iter().any(|x| !x.is_finite()) {
            return Err(OccupancyError::NonFiniteCovariate {
                name: name.to_string(),
            });
        }
        let scaling = Standardization::fit(&raw).ok_or_else(|| OccupancyError::ConstantCovariate {
            name: name.to_string(),
        })?;
        let values = raw.iter().map(|&x| scaling.standardize(x)).collect();
        self.site_covariates.retain(|c| c.name != name);
        self.site_covariates.push(SiteCovariate {
            name: name.to_string(),
            values,
            scaling,
        });
        Ok(self)
    }

    /// Attach a raw survey-level covariate in row-major
    /// `(site, season, replicate)` order.
    ///
    /// Values at slots without an observation may be NaN. Values at
    /// observed slots must be finite.
    pub fn with_survey_covariate(mut self, name: &str, raw: Vec<f64>) -> Result<Self> {
        let expected = self.n_sites() * self.n_seasons() * self.n_replicates();
        if raw.len() != expected {
            return Err(OccupancyError::CovariateLength {
                name: name.to_string(),
                expected,
                got: raw.len(),
            });
        }
        let surveyed = self.observed_slots().map(|idx| raw[idx]).collect_vec();
        if surveyed.iter().any(|x| !x.is_finite()) {
            return Err(OccupancyError::NonFiniteCovariate {
                name: name.to_string(),
            });
        }
        let scaling =
            Standardization::fit(&surveyed).ok_or_else(|| OccupancyError::ConstantCovariate {
                name: name.to_string(),
            })?;
        let mut values = vec![0f64; expected];
        for idx in self.observed_slots() {
            values[idx] = scaling.standardize(raw[idx]);
        }
        self.survey_covariates.retain(|c| c.name != name);
        self.survey_covariates.push(SurveyCovariate {
            name: name.to_string(),
            values: values.into(),
            scaling,
        });
        Ok(self)
    }

    fn observed_slots(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.n_sites()).flat_map(move |site| {
            (0..self.n_seasons()).flat_map(move |season| {
                self.observations(site, season)
                    .map(move |(replicate, _)| self.detections.index(site, season, replicate))
            })
        })
    }

    pub fn detections(&self) -> &DetectionArray {
        &self.detections
    }

    pub fn surveys(&self) -> &[usize] {
        &self.surveys
    }

    pub fn n_sites(&self) -> usize {
        self.detections.n_sites()
    }

    pub fn n_seasons(&self) -> usize {
        self.detections.n_seasons()
    }

    pub fn n_replicates(&self) -> usize {
        self.detections.n_replicates()
    }

    /// True when the replicate slot lies beyond the site's survey count.
    pub fn is_excluded(&self, site: usize, replicate: usize) -> bool {
        replicate >= self.surveys[site]
    }

    /// The observation that enters the likelihood, if any.
    #[inline]
    pub fn observation(&self, site: usize, season: usize, replicate: usize) -> Option<bool> {
        if self.is_excluded(site, replicate) {
            return None;
        }
        match self.detections.get(site, season, replicate) {
            Observation::Missing => None,
            Observation::NotDetected => Some(false),
            Observation::Detected => Some(true),
        }
    }

    /// Replicate indices and outcomes of one site-season that enter the likelihood.
    pub fn observations(
        &self,
        site: usize,
        season: usize,
    ) -> impl Iterator<Item = (usize, bool)> + '_ {
        (0..self.surveys[site])
            .filter_map(move |rep| self.observation(site, season, rep).map(|y| (rep, y)))
    }

    pub fn detected(&self, site: usize, season: usize) -> bool {
        self.detections.detected(site, season)
    }

    pub fn site_covariate(&self, name: &str) -> Option<&SiteCovariate> {
        self.site_covariates.iter().find(|c| c.name == name)
    }

    pub fn survey_covariate(&self, name: &str) -> Option<&SurveyCovariate> {
        self.survey_covariates.iter().find(|c| c.name == name)
    }

    pub(crate) fn survey_value(
        &self,
        cov: &SurveyCovariate,
        site: usize,
        season: usize,
        rep: usize,
    ) -> f64 {
        cov.values[self.detections.index(site, season, rep)]
    }

    /// Fraction of site-seasons with at least one detection.
    pub fn naive_occupancy(&self, season: usize) -> f64 {
        let detected = (0..self.n_sites())
            .filter(|&site| self.detected(site, season))
            .count();
        detected as f64 / self.n_sites() as f64
    }
}
