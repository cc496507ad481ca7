use anyhow::Result;
use occupancy_mcmc::{
    sample_chains, simulate, CovariateDesign, DerivedQuantities, DetectionArray,
    DiagnosticsReport, LatentState, ModelSpec, OccupancyError, OccupancyModel, Params, Priors,
    Process, SamplerSettings, SurveyData, Trace,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn quick_settings() -> SamplerSettings {
    SamplerSettings {
        num_adapt: 100,
        num_burnin: 200,
        num_draws: 300,
        seed: 42,
        ..Default::default()
    }
}

/// 5 sites, 3 seasons, 2 replicates. Site 0 is detected every season,
/// site 4 is never detected.
fn small_survey() -> Result<SurveyData> {
    #[rustfmt::skip]
    let records = [
        // site 0
        [1, 0], [0, 1], [1, 1],
        // site 1
        [0, 0], [1, 0], [0, 0],
        // site 2
        [0, 1], [0, 0], [0, 0],
        // site 3
        [0, 0], [0, 0], [1, 1],
        // site 4
        [0, 0], [0, 0], [0, 0],
    ];
    let values = records
        .iter()
        .flatten()
        .map(|&y| Some(y == 1))
        .collect::<Vec<_>>();
    let detections = DetectionArray::new(5, 3, 2, values)?;
    Ok(SurveyData::fully_surveyed(detections)?)
}

fn covariate_survey(sites: usize, seed: u64) -> Result<SurveyData> {
    let (seasons, replicates) = (3, 3);
    let template = SurveyData::unobserved(sites, seasons, replicates, vec![replicates; sites])?
        .with_site_covariate(
            "elevation",
            (0..sites).map(|i| 100. + 15. * i as f64).collect(),
        )?
        .with_site_covariate(
            "forest",
            (0..sites).map(|i| ((i * 7) % 10) as f64 / 10.).collect(),
        )?
        .with_survey_covariate(
            "date",
            (0..sites * seasons * replicates)
                .map(|slot| 120. + (slot % replicates) as f64 * 20. + (slot % 5) as f64)
                .collect(),
        )?;
    let params = Params::Covariate {
        occupancy: vec![0.2, 0.8, -0.4],
        survival: vec![1.2, 0.3, 0.],
        colonization: vec![-1., 0., 0.5],
        detection: vec![0.3, 0.4, -0.2],
    };
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let sim = simulate(
        &template,
        ModelSpec::Covariate(CovariateDesign::default()),
        &params,
        &mut rng,
    )?;
    Ok(sim.data)
}

fn assert_forced_states(model: &OccupancyModel, trace: &Trace) {
    let data = model.data();
    assert!(trace.draws().count() > 0);
    for draw in trace.draws() {
        for site in 0..data.n_sites() {
            for season in 0..data.n_seasons() {
                let state = draw.latent.get(site, season);
                if data.detected(site, season) {
                    assert_eq!(state, LatentState::ForcedOccupied);
                } else {
                    assert!(matches!(state, LatentState::Sampled(_)));
                }
            }
        }
    }
}

#[test]
fn never_detected_site_is_not_forced() -> Result<()> {
    let model = OccupancyModel::new(small_survey()?, ModelSpec::Null, Priors::default())?;
    let trace = sample_chains(&model, &quick_settings())?;
    assert_eq!(trace.num_chains(), 3);
    assert_forced_states(&model, &trace);

    let always = (0..3).map(|t| trace.occupancy_mean(0, t)).sum::<f64>();
    let never = (0..3).map(|t| trace.occupancy_mean(4, t)).sum::<f64>();
    assert_eq!(always, 3.);
    assert!(never < always);
    assert!(trace
        .draws()
        .any(|draw| (0..3).any(|t| !draw.latent.is_occupied(4, t))));
    Ok(())
}

#[test]
fn detections_force_occupancy_in_every_variant() -> Result<()> {
    let data = covariate_survey(60, 1)?;
    let specs = [
        ModelSpec::Null,
        ModelSpec::Dynamic,
        ModelSpec::Covariate(CovariateDesign::default()),
    ];
    for spec in specs {
        let model = OccupancyModel::new(data.clone(), spec, Priors::default())?;
        let trace = sample_chains(&model, &quick_settings())?;
        assert_forced_states(&model, &trace);
    }
    Ok(())
}

#[test]
fn retained_probabilities_stay_in_bounds() -> Result<()> {
    let data = covariate_survey(40, 2)?;
    for spec in [ModelSpec::Dynamic, ModelSpec::Covariate(CovariateDesign::default())] {
        let model = OccupancyModel::new(data.clone(), spec, Priors::default())?;
        let trace = sample_chains(&model, &quick_settings())?;
        for draw in trace.draws() {
            assert!(draw.params.is_valid());
            let probs = model.probabilities(&draw.params);
            for site in 0..data.n_sites() {
                let psi = probs.initial_occupancy(site);
                assert!((0. ..=1.).contains(&psi));
                for season in 0..data.n_seasons() - 1 {
                    assert!((0. ..=1.).contains(&probs.survival(site, season)));
                    assert!((0. ..=1.).contains(&probs.colonization(site, season)));
                }
                for season in 0..data.n_seasons() {
                    for rep in 0..data.n_replicates() {
                        assert!((0. ..=1.).contains(&probs.detection(site, season, rep)));
                    }
                }
            }
            assert!(draw.derived.equilibrium.iter().all(|v| (0. ..=1.).contains(v)));
        }
    }
    Ok(())
}

#[test]
fn derived_quantities_recompute_exactly() -> Result<()> {
    let data = covariate_survey(30, 3)?;
    let model = OccupancyModel::new(data, ModelSpec::Dynamic, Priors::default())?;
    let trace = sample_chains(&model, &quick_settings())?;
    for draw in trace.draws().step_by(17) {
        let probs = model.probabilities(&draw.params);
        let again = DerivedQuantities::compute(&probs, &draw.latent);
        assert_eq!(again, draw.derived);
        assert_eq!(model.deviance(&draw.params, &draw.latent), draw.deviance);
    }
    Ok(())
}

#[test]
fn null_model_recovers_simulated_parameters() -> Result<()> {
    let (sites, seasons, replicates) = (2000, 4, 3);
    let truth = [("psi1", 0.6), ("phi", 0.8), ("gamma", 0.2), ("p", 0.5)];
    let params = Params::Null {
        psi1: truth[0].1,
        phi: truth[1].1,
        gamma: truth[2].1,
        p: truth[3].1,
    };
    let template = SurveyData::unobserved(sites, seasons, replicates, vec![replicates; sites])?;
    let mut rng = ChaCha8Rng::seed_from_u64(2024);
    let sim = simulate(&template, ModelSpec::Null, &params, &mut rng)?;

    let model = OccupancyModel::new(sim.data, ModelSpec::Null, Priors::default())?;
    let settings = SamplerSettings {
        num_adapt: 0,
        num_burnin: 300,
        num_draws: 500,
        seed: 7,
        ..Default::default()
    };
    let trace = sample_chains(&model, &settings)?;
    let report = DiagnosticsReport::new(&model, &trace)?;

    for (name, value) in truth {
        let summary = report.get(name).expect("parameter summary");
        assert!(
            (summary.mean - value).abs() < 0.05,
            "{name}: posterior mean {} for true value {value}",
            summary.mean
        );
        assert!(summary.rhat.point <= 1.1, "{name}: R-hat {}", summary.rhat.point);
        assert!(summary.ess > 10.);
    }
    assert!(report.multivariate_rhat <= 1.1);
    Ok(())
}

#[test]
fn credible_intervals_cover_true_values() -> Result<()> {
    let (sites, seasons, replicates) = (300, 4, 3);
    let truth = [("psi1", 0.5), ("phi", 0.75), ("gamma", 0.15), ("p", 0.4)];
    let params = Params::Null {
        psi1: truth[0].1,
        phi: truth[1].1,
        gamma: truth[2].1,
        p: truth[3].1,
    };
    let template = SurveyData::unobserved(sites, seasons, replicates, vec![replicates; sites])?;
    let settings = SamplerSettings {
        num_adapt: 0,
        num_burnin: 300,
        num_draws: 700,
        ..Default::default()
    };

    let mut hits = 0;
    let mut total = 0;
    for replicate in 0..25u64 {
        let mut rng = ChaCha8Rng::seed_from_u64(1000 + replicate);
        let sim = simulate(&template, ModelSpec::Null, &params, &mut rng)?;
        let model = OccupancyModel::new(sim.data, ModelSpec::Null, Priors::default())?;
        let settings = SamplerSettings {
            seed: replicate,
            ..settings.clone()
        };
        let trace = sample_chains(&model, &settings)?;
        let report = DiagnosticsReport::new(&model, &trace)?;
        for (name, value) in truth {
            let summary = report.get(name).expect("parameter summary");
            total += 1;
            if (summary.q025..=summary.q975).contains(&value) {
                hits += 1;
            }
        }
    }
    let coverage = hits as f64 / total as f64;
    assert!(coverage >= 0.85, "95% intervals covered {hits} of {total}");
    Ok(())
}

#[test]
fn slots_beyond_survey_count_are_excluded() -> Result<()> {
    let mut values = vec![Some(false); 2 * 2 * 3];
    // site 1 has only two surveys
    values[6 + 2] = None;
    values[9 + 2] = None;
    values[9] = Some(true);
    let detections = DetectionArray::new(2, 2, 3, values.clone())?;
    let data = SurveyData::new(detections, vec![3, 2])?;
    let model = OccupancyModel::new(data, ModelSpec::Null, Priors::default())?;

    for season in 0..2 {
        assert!(model.is_excluded(1, 2));
        assert!(!model.is_excluded(0, 2));
        assert_eq!(model.data().observation(1, season, 2), None);
        assert_eq!(
            model
                .data()
                .observations(1, season)
                .map(|(rep, _)| rep)
                .collect::<Vec<_>>(),
            vec![0, 1]
        );
    }

    // A record in an excluded slot is inconsistent input
    values[6 + 2] = Some(true);
    let detections = DetectionArray::new(2, 2, 3, values)?;
    let err = SurveyData::new(detections, vec![3, 2]).unwrap_err();
    assert!(matches!(err, OccupancyError::RecordBeyondSurveyCount { .. }));
    Ok(())
}

#[test]
fn covariate_model_reports_named_coefficients() -> Result<()> {
    let data = covariate_survey(50, 4)?;
    let model = OccupancyModel::new(
        data,
        ModelSpec::Covariate(CovariateDesign::default()),
        Priors::default(),
    )?;
    let names = model.parameter_names();
    assert_eq!(names.len(), 12);
    assert!(names.iter().any(|n| n == "detection.date^2"));

    let trace = sample_chains(&model, &quick_settings())?;
    let report = DiagnosticsReport::new(&model, &trace)?;
    assert!(report.get("occupancy.elevation").is_some());
    assert!(report.multivariate_rhat.is_finite());
    let draw = trace.draws().next().expect("at least one draw");
    assert_eq!(
        draw.params.coefficients(Process::Survival).map(|c| c.len()),
        Some(3)
    );
    Ok(())
}
