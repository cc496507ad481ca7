//! The posterior sample collection.

use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::{
    array::{
        Array, ArrayBuilder, ArrayRef, FixedSizeListBuilder, Float64Array, PrimitiveBuilder,
        StructArray, UInt64Array,
    },
    datatypes::{Field, Fields, UInt8Type},
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    derived::DerivedQuantities,
    error::OccupancyError,
    latent::{InitStrategy, LatentStates},
    model::{OccupancyModel, Params},
    sampler::ChainProgress,
};

/// One retained snapshot of a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draw {
    pub chain: u64,
    /// Index among the retained draws of the chain.
    pub iteration: u64,
    pub params: Params,
    pub latent: LatentStates,
    pub derived: DerivedQuantities,
    pub deviance: f64,
}

impl Draw {
    /// Parameters, derived quantities and deviance, in the order of
    /// [`monitor_names`].
    pub fn monitored(&self) -> Vec<f64> {
        let mut values = self.params.values();
        values.extend(self.derived.values());
        values.push(self.deviance);
        values
    }
}

/// Names of everything [`Draw::monitored`] reports for a model.
pub fn monitor_names(model: &OccupancyModel) -> Vec<String> {
    model
        .parameter_names()
        .iter()
        .cloned()
        .chain(DerivedQuantities::names(model.data().n_seasons()))
        .chain(std::iter::once("deviance".to_string()))
        .collect()
}

#[derive(Debug, Clone)]
pub struct ChainOutput {
    pub chain_id: u64,
    pub init: InitStrategy,
    pub draws: Vec<Draw>,
    pub progress: ChainProgress,
}

impl ChainOutput {
    pub fn len(&self) -> usize {
        self.draws.len()
    }

    pub fn is_empty(&self) -> bool {
        self.draws.is_empty()
    }

    /// Series of the monitored quantity at `index` of [`Draw::monitored`],
    /// or `None` if the index is past the monitored quantities.
    pub fn series(&self, index: usize) -> Option<Vec<f64>> {
        self.draws
            .iter()
            .map(|draw| draw.monitored().get(index).copied())
            .collect()
    }

    /// Retained draws as an arrow struct array: one `Float64` column per
    /// monitored quantity and the latent states as a fixed size list of
    /// `0`/`1` values in `(site, season)` order.
    pub fn to_arrow(&self, names: &[String]) -> Result<StructArray> {
        let rows = self.draws.iter().map(|draw| draw.monitored()).collect_vec();
        if let Some(row) = rows.first() {
            anyhow::ensure!(
                row.len() == names.len(),
                "Got {} names for {} monitored values",
                names.len(),
                row.len()
            );
        }

        let mut columns: Vec<(&str, ArrayRef)> = Vec::with_capacity(names.len() + 2);
        columns.push((
            "chain",
            Arc::new(UInt64Array::from(vec![self.chain_id; self.draws.len()])),
        ));
        columns.push((
            "iteration",
            Arc::new(UInt64Array::from(
                self.draws.iter().map(|d| d.iteration).collect_vec(),
            )),
        ));
        for (i, name) in names.iter().enumerate() {
            let values = Float64Array::from(rows.iter().map(|row| row[i]).collect_vec());
            columns.push((name.as_str(), Arc::new(values)));
        }

        let size = self
            .draws
            .first()
            .map_or(0, |d| d.latent.n_sites() * d.latent.n_seasons());
        let mut latent = FixedSizeListBuilder::new(PrimitiveBuilder::<UInt8Type>::new(), size as _);
        for draw in &self.draws {
            for state in draw.latent.iter() {
                latent.values().append_value(state.is_occupied() as u8);
            }
            latent.append(true);
        }
        columns.push(("latent", ArrayBuilder::finish(&mut latent)));

        let fields: Fields = columns
            .iter()
            .map(|(name, array)| Field::new(*name, array.data_type().clone(), false))
            .collect_vec()
            .into();
        let arrays = columns.into_iter().map(|(_, array)| array).collect_vec();
        StructArray::try_new(fields, arrays, None).context("Could not assemble draw table")
    }
}

/// Output of all chains, ordered by chain id.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    pub chains: Vec<ChainOutput>,
}

impl<I: Iterator<Item = ChainOutput>> From<I> for Trace {
    fn from(value: I) -> Self {
        let mut chains = value.into_iter().collect_vec();
        chains.sort_unstable_by_key(|x| x.chain_id);
        Trace { chains }
    }
}

impl Trace {
    pub fn num_chains(&self) -> usize {
        self.chains.len()
    }

    /// Draws available in every chain.
    pub fn aligned_len(&self) -> usize {
        self.chains.iter().map(|c| c.len()).min().unwrap_or(0)
    }

    pub fn draws(&self) -> impl Iterator<Item = &Draw> {
        self.chains.iter().flat_map(|chain| chain.draws.iter())
    }

    /// Per-chain series of the monitored quantity at `index`, cut to the
    /// length of the shortest chain.
    pub fn chains_at(&self, index: usize) -> Vec<Vec<f64>> {
        let len = self.aligned_len();
        self.chains
            .iter()
            .map(|chain| {
                chain.draws[..len]
                    .iter()
                    .map(|draw| draw.monitored()[index])
                    .collect()
            })
            .collect()
    }

    /// Per-chain series of a named monitored quantity.
    pub fn chains_for(
        &self,
        model: &OccupancyModel,
        name: &str,
    ) -> Result<Vec<Vec<f64>>, OccupancyError> {
        let index = monitor_names(model)
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| OccupancyError::UnknownQuantity {
                name: name.to_string(),
            })?;
        Ok(self.chains_at(index))
    }

    /// Aligned draws of every monitored quantity: `chain -> draw -> value`.
    pub fn monitored(&self) -> Vec<Vec<Vec<f64>>> {
        let len = self.aligned_len();
        self.chains
            .iter()
            .map(|chain| chain.draws[..len].iter().map(|d| d.monitored()).collect())
            .collect()
    }

    /// Posterior mean occupancy of a site in a season, pooled over chains.
    pub fn occupancy_mean(&self, site: usize, season: usize) -> f64 {
        let (count, occupied) = self.draws().fold((0usize, 0usize), |(n, k), draw| {
            (n + 1, k + draw.latent.is_occupied(site, season) as usize)
        });
        occupied as f64 / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data::{DetectionArray, SurveyData},
        model::{ModelSpec, Priors},
        sampler::{sample_sequentially, SamplerSettings},
    };
    use pretty_assertions::assert_eq;

    fn model() -> OccupancyModel {
        let mut values = vec![Some(false); 4 * 2 * 2];
        values[1] = Some(true);
        let detections = DetectionArray::new(4, 2, 2, values).unwrap();
        let data = SurveyData::fully_surveyed(detections).unwrap();
        OccupancyModel::new(data, ModelSpec::Null, Priors::default()).unwrap()
    }

    fn settings() -> SamplerSettings {
        SamplerSettings {
            num_adapt: 0,
            num_burnin: 10,
            num_draws: 25,
            ..Default::default()
        }
    }

    #[test]
    fn trace_sorted_by_chain() -> Result<()> {
        let model = model();
        let settings = settings();
        let outputs = [2u64, 0, 1]
            .into_iter()
            .map(|chain| sample_sequentially(&model, &settings, chain))
            .collect::<Result<Vec<_>>>()?;
        let trace: Trace = outputs.into_iter().into();
        assert_eq!(
            trace.chains.iter().map(|c| c.chain_id).collect_vec(),
            vec![0, 1, 2]
        );
        assert_eq!(trace.aligned_len(), 25);

        let psi1 = trace.chains_for(&model, "psi1")?;
        assert_eq!(psi1.len(), 3);
        assert!(psi1.iter().flatten().all(|v| (0. ..=1.).contains(v)));
        assert!(trace.chains_for(&model, "nope").is_err());
        assert_eq!(trace.occupancy_mean(0, 0), 1.);
        Ok(())
    }

    #[test]
    fn arrow_export_has_one_column_per_quantity() -> Result<()> {
        let model = model();
        let output = sample_sequentially(&model, &settings(), 0)?;
        let names = monitor_names(&model);
        let table = output.to_arrow(&names)?;
        assert_eq!(table.len(), 25);
        assert_eq!(table.num_columns(), names.len() + 3);
        let deviance = table
            .column_by_name("deviance")
            .expect("deviance column")
            .as_any()
            .downcast_ref::<Float64Array>()
            .expect("float column");
        assert_eq!(deviance.value(3), output.draws[3].deviance);

        assert!(output.to_arrow(&names[1..]).is_err());
        Ok(())
    }

    #[test]
    fn series_by_index() -> Result<()> {
        let model = model();
        let output = sample_sequentially(&model, &settings(), 1)?;
        let names = monitor_names(&model);

        let deviance = output.series(names.len() - 1).expect("deviance series");
        assert_eq!(
            deviance,
            output.draws.iter().map(|d| d.deviance).collect_vec()
        );
        let psi1 = output.series(0).expect("psi1 series");
        assert_eq!(psi1.len(), 25);
        assert!(psi1.iter().all(|v| (0. ..=1.).contains(v)));

        assert_eq!(output.series(names.len()), None);
        Ok(())
    }

    #[test]
    fn monitored_layout() {
        let model = model();
        let names = monitor_names(&model);
        // 4 parameters, 2 + 2 trajectory values, 1 + 1 ratios, deviance
        assert_eq!(names.len(), 11);
        assert_eq!(names.last().map(String::as_str), Some("deviance"));
    }
}
