//! Simulate a survey from the covariate model, fit all three variants and
//! rank them by DIC.

use std::time::Duration;

use anyhow::{Context, Result};
use occupancy_mcmc::{
    compare_models, simulate, ChainProgress, CovariateDesign, DiagnosticsReport, ModelSpec,
    OccupancyModel, Params, Priors, ProgressCallback, Sampler, SamplerSettings, SurveyData, Trace,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const SITES: usize = 150;
const SEASONS: usize = 4;
const REPLICATES: usize = 3;

fn survey(rng: &mut ChaCha8Rng) -> Result<SurveyData> {
    // Roughly a fifth of the sites were visited only twice per season
    let surveys = (0..SITES)
        .map(|_| if rng.random::<f64>() < 0.2 { 2 } else { 3 })
        .collect();
    let elevation = (0..SITES).map(|_| rng.random_range(200. ..1800.)).collect();
    let forest = (0..SITES).map(|_| rng.random_range(0. ..1.)).collect();
    let date = (0..SITES * SEASONS * REPLICATES)
        .map(|slot| 100. + 25. * (slot % REPLICATES) as f64 + rng.random_range(0. ..10.))
        .collect();
    let template = SurveyData::unobserved(SITES, SEASONS, REPLICATES, surveys)?
        .with_site_covariate("elevation", elevation)?
        .with_site_covariate("forest", forest)?
        .with_survey_covariate("date", date)?;

    let truth = Params::Covariate {
        occupancy: vec![0.3, -0.9, 0.7],
        survival: vec![1.5, -0.4, 0.5],
        colonization: vec![-1.2, -0.6, 0.3],
        detection: vec![0.2, 0.5, -0.3],
    };
    let sim = simulate(
        &template,
        ModelSpec::Covariate(CovariateDesign::default()),
        &truth,
        rng,
    )?;
    for season in 0..SEASONS {
        println!(
            "season {}: true occupancy {:.3}, naive {:.3}",
            season + 1,
            sim.occupied_fraction(season),
            sim.data.naive_occupancy(season)
        );
    }
    Ok(sim.data)
}

fn fit(model: &OccupancyModel, settings: &SamplerSettings) -> Result<Trace> {
    let callback = ProgressCallback {
        callback: Box::new(|elapsed: Duration, progress: Box<[ChainProgress]>| {
            let done: u64 = progress.iter().map(|p| p.finished_sweeps).sum();
            let total: u64 = progress.iter().map(|p| p.total_sweeps).sum();
            println!("  {:>6.1}s {done}/{total} sweeps", elapsed.as_secs_f64());
        }),
        rate: Duration::from_secs(2),
    };
    let sampler = Sampler::new(model.clone(), settings.clone(), 4, Some(callback))?;
    sampler.wait()
}

fn main() -> Result<()> {
    let mut rng = ChaCha8Rng::seed_from_u64(2017);
    let data = survey(&mut rng)?;
    let settings = SamplerSettings {
        num_adapt: 500,
        num_burnin: 1000,
        num_draws: 1000,
        seed: 17,
        ..Default::default()
    };

    let specs = [
        ModelSpec::Null,
        ModelSpec::Dynamic,
        ModelSpec::Covariate(CovariateDesign::default()),
    ];
    let mut fits = Vec::new();
    for spec in specs {
        let model = OccupancyModel::new(data.clone(), spec, Priors::default())?;
        println!("fitting {} model", model.kind());
        let trace = fit(&model, &settings).with_context(|| format!("{} model", model.kind()))?;

        let report = DiagnosticsReport::new(&model, &trace)?;
        println!(
            "{:<24} {:>8} {:>8} {:>8} {:>7} {:>8}",
            "", "mean", "2.5%", "97.5%", "R-hat", "ESS"
        );
        for name in model.parameter_names() {
            if let Some(s) = report.get(name) {
                println!(
                    "{:<24} {:>8.3} {:>8.3} {:>8.3} {:>7.3} {:>8.0}",
                    s.name, s.mean, s.q025, s.q975, s.rhat.point, s.ess
                );
            }
        }
        let unconverged = report.unconverged(1.1);
        if !unconverged.is_empty() {
            println!("R-hat above 1.1: {}", unconverged.join(", "));
        }
        println!("multivariate R-hat {:.3}\n", report.multivariate_rhat);
        fits.push((model, trace));
    }

    let refs = fits.iter().map(|(m, t)| (m, t)).collect::<Vec<_>>();
    println!("{:<10} {:>10} {:>8} {:>10} {:>8}", "model", "Dbar", "pD", "DIC", "dDIC");
    for entry in compare_models(&refs)? {
        let s = &entry.summary;
        println!(
            "{:<10} {:>10.1} {:>8.1} {:>10.1} {:>8.1}",
            s.kind.to_string(),
            s.mean_deviance,
            s.penalty,
            s.dic,
            entry.delta
        );
    }
    Ok(())
}
