use anyhow::{bail, Context, Result};
use itertools::Itertools;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::{prelude::*, ScopeFifo, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        mpsc::{
            channel, sync_channel, Receiver, RecvTimeoutError, Sender, SyncSender, TryRecvError,
        },
        Arc, Mutex,
    },
    thread::{spawn, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, info};

use crate::{
    chain::{ChainPhase, OccupancyChain, Progress},
    error::OccupancyError,
    latent::InitStrategy,
    model::OccupancyModel,
    proposal::DualAverageOptions,
    trace::{ChainOutput, Draw, Trace},
};

/// Settings of the chain driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerSettings {
    pub num_chains: usize,
    /// Sweeps that tune the Metropolis proposal scales.
    pub num_adapt: u64,
    /// Discarded sweeps after adaptation.
    pub num_burnin: u64,
    /// Retained draws per chain. The sampling phase runs
    /// `num_draws * thin` sweeps.
    pub num_draws: u64,
    pub thin: u64,
    pub seed: u64,
    /// Acceptance rate the proposal scales are tuned towards.
    pub target_accept: f64,
    pub initial_proposal_scale: f64,
    pub adapt_options: DualAverageOptions,
    /// Stop every chain after this many sweeps, keeping what it retained.
    pub max_sweeps: Option<u64>,
    /// Starting configurations, assigned to chains round robin.
    pub init_strategies: Vec<InitStrategy>,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            num_chains: 3,
            num_adapt: 500,
            num_burnin: 1000,
            num_draws: 2000,
            thin: 1,
            seed: 0,
            target_accept: 0.44,
            initial_proposal_scale: 0.5,
            adapt_options: DualAverageOptions::default(),
            max_sweeps: None,
            init_strategies: vec![
                InitStrategy::DataDriven,
                InitStrategy::MostlyUnoccupied,
                InitStrategy::MostlyOccupied,
            ],
        }
    }
}

impl SamplerSettings {
    pub fn validate(&self) -> Result<(), OccupancyError> {
        let invalid = |reason: String| Err(OccupancyError::InvalidSettings { reason });
        if self.num_chains == 0 {
            return invalid("at least one chain is required".to_string());
        }
        if self.thin == 0 {
            return invalid("thinning interval must be at least 1".to_string());
        }
        if self.num_draws == 0 {
            return invalid("at least one retained draw is required".to_string());
        }
        if !(self.target_accept > 0. && self.target_accept < 1.) {
            return invalid(format!(
                "target acceptance must lie in (0, 1), got {}",
                self.target_accept
            ));
        }
        if !(self.initial_proposal_scale.is_finite() && self.initial_proposal_scale > 0.) {
            return invalid(format!(
                "proposal scale must be positive, got {}",
                self.initial_proposal_scale
            ));
        }
        if self.init_strategies.is_empty() {
            return invalid("no starting configuration given".to_string());
        }
        for strategy in &self.init_strategies {
            if let InitStrategy::Random { occupied } = strategy {
                if !(0. ..=1.).contains(occupied) {
                    return invalid(format!("occupied fraction {occupied} outside [0, 1]"));
                }
            }
        }
        let used = (0..self.num_chains as u64)
            .map(|chain| self.init_strategy(chain))
            .collect_vec();
        let mut distinct: Vec<InitStrategy> = Vec::new();
        for strategy in used {
            if !distinct.contains(&strategy) {
                distinct.push(strategy);
            }
        }
        let required = self.num_chains.min(3);
        if distinct.len() < required {
            return invalid(format!(
                "{} chains need at least {required} distinct starting configurations, got {}",
                self.num_chains,
                distinct.len()
            ));
        }
        Ok(())
    }

    pub fn init_strategy(&self, chain: u64) -> InitStrategy {
        self.init_strategies
            .get(chain as usize % self.init_strategies.len().max(1))
            .copied()
            .unwrap_or(InitStrategy::DataDriven)
    }

    /// Independent generator of one chain.
    pub fn chain_rng(&self, chain: u64) -> ChaCha8Rng {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        rng.set_stream(chain);
        rng
    }

    pub fn total_sweeps(&self) -> u64 {
        self.num_adapt + self.num_burnin + self.num_draws * self.thin
    }
}

#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct ChainProgress {
    pub finished_sweeps: u64,
    pub total_sweeps: u64,
    pub retained_draws: u64,
    pub phase: ChainPhase,
    pub started: bool,
    /// Metropolis proposals accepted after adaptation.
    pub accepted: u64,
    pub proposed: u64,
    pub runtime: Duration,
}

impl ChainProgress {
    fn new(total: u64) -> Self {
        Self {
            finished_sweeps: 0,
            total_sweeps: total,
            retained_draws: 0,
            phase: ChainPhase::Uninitialized,
            started: false,
            accepted: 0,
            proposed: 0,
            runtime: Duration::ZERO,
        }
    }

    fn update(&mut self, stats: &Progress, phase: ChainPhase, sweep_duration: Duration) {
        self.finished_sweeps += 1;
        if stats.retained {
            self.retained_draws += 1;
        }
        if stats.phase > ChainPhase::Adapting {
            self.accepted += stats.accepted;
            self.proposed += stats.proposed;
        }
        self.phase = phase;
        self.runtime += sweep_duration;
    }

    /// NaN when no Metropolis step ran.
    pub fn acceptance_rate(&self) -> f64 {
        self.accepted as f64 / self.proposed as f64
    }
}

fn reached_checkpoint(settings: &SamplerSettings, sweeps: u64) -> bool {
    settings.max_sweeps.is_some_and(|max| sweeps >= max)
}

/// Run a single chain to completion on the current thread.
#[tracing::instrument(skip(model, settings), fields(kind = %model.kind()))]
pub fn sample_sequentially(
    model: &OccupancyModel,
    settings: &SamplerSettings,
    chain_id: u64,
) -> Result<ChainOutput> {
    settings.validate()?;
    let mut chain = OccupancyChain::new(model, settings, chain_id, settings.chain_rng(chain_id));
    let mut progress = ChainProgress::new(chain.total_sweeps());
    progress.started = true;
    let mut draws = Vec::new();

    while chain.phase() != ChainPhase::Done {
        if reached_checkpoint(settings, chain.sweeps()) {
            chain.finish();
            break;
        }
        let now = Instant::now();
        let (draw, info) = chain.sweep()?;
        progress.update(&info, chain.phase(), now.elapsed());
        draws.extend(draw);
    }
    progress.phase = chain.phase();

    info!(
        chain = chain_id,
        sweeps = chain.sweeps(),
        draws = draws.len(),
        "chain finished"
    );
    Ok(ChainOutput {
        chain_id,
        init: chain.init_strategy(),
        draws,
        progress,
    })
}

/// Run every chain on the global rayon pool and block until all are done.
#[tracing::instrument(skip_all, fields(kind = %model.kind(), chains = settings.num_chains))]
pub fn sample_chains(model: &OccupancyModel, settings: &SamplerSettings) -> Result<Trace> {
    settings.validate()?;
    let chains = (0..settings.num_chains as u64)
        .into_par_iter()
        .map(|chain| sample_sequentially(model, settings, chain))
        .collect::<Result<Vec<_>>>()?;
    Ok(chains.into_iter().into())
}

enum ChainCommand {
    Stop,
}

struct ChainTrace {
    chain_id: u64,
    init: InitStrategy,
    draws: Vec<Draw>,
}

struct ChainProcess {
    stop_marker: Sender<ChainCommand>,
    trace: Arc<Mutex<Option<ChainTrace>>>,
    progress: Arc<Mutex<ChainProgress>>,
}

impl ChainProcess {
    fn finalize_many(chains: Vec<Self>) -> Vec<Option<ChainOutput>> {
        chains
            .into_iter()
            .map(|chain| chain.finalize())
            .collect_vec()
    }

    fn progress(&self) -> ChainProgress {
        self.progress.lock().expect("Poisoned lock").clone()
    }

    fn current_trace(&self) -> Option<ChainOutput> {
        let progress = self.progress();
        self.trace
            .lock()
            .expect("Poisoned lock")
            .as_ref()
            .map(|trace| ChainOutput {
                chain_id: trace.chain_id,
                init: trace.init,
                draws: trace.draws.clone(),
                progress,
            })
    }

    fn stop(&self) {
        // Fails once the chain is done, which is fine.
        let _ = self.stop_marker.send(ChainCommand::Stop);
    }

    fn finalize(self) -> Option<ChainOutput> {
        drop(self.stop_marker);
        let progress = self.progress.lock().expect("Poisoned lock").clone();
        self.trace
            .lock()
            .expect("Poisoned lock")
            .take()
            .map(|trace| ChainOutput {
                chain_id: trace.chain_id,
                init: trace.init,
                draws: trace.draws,
                progress,
            })
    }

    fn start<'scope>(
        model: &'scope OccupancyModel,
        chain_id: u64,
        settings: &'scope SamplerSettings,
        scope: &ScopeFifo<'scope>,
        results: Sender<Result<()>>,
    ) -> Self {
        let (stop_marker_tx, stop_marker_rx) = channel();

        let trace = Arc::new(Mutex::new(None));
        let progress = Arc::new(Mutex::new(ChainProgress::new(settings.total_sweeps())));

        let trace_inner = trace.clone();
        let progress_inner = progress.clone();

        scope.spawn_fifo(move |_| {
            let trace = trace_inner;
            let progress = progress_inner;
            let finished = progress.clone();

            let sample = move || -> Result<()> {
                let mut chain =
                    OccupancyChain::new(model, settings, chain_id, settings.chain_rng(chain_id));
                *trace.lock().expect("Poisoned mutex") = Some(ChainTrace {
                    chain_id,
                    init: chain.init_strategy(),
                    draws: Vec::new(),
                });
                progress.lock().expect("Poisoned mutex").started = true;

                while chain.phase() != ChainPhase::Done {
                    match stop_marker_rx.try_recv() {
                        // The controller is gone or asked us to stop
                        Err(TryRecvError::Disconnected) | Ok(ChainCommand::Stop) => {
                            chain.finish();
                            break;
                        }
                        Err(TryRecvError::Empty) => {}
                    }
                    if reached_checkpoint(settings, chain.sweeps()) {
                        chain.finish();
                        break;
                    }

                    let now = Instant::now();
                    let (draw, info) = chain
                        .sweep()
                        .with_context(|| format!("Sweep failed in chain {chain_id}"))?;
                    let mut guard = trace
                        .lock()
                        .expect("Could not unlock trace lock. Poisoned mutex");
                    let Some(val) = guard.as_mut() else {
                        // The trace was removed by the controller thread.
                        break;
                    };
                    val.draws.extend(draw);
                    progress
                        .lock()
                        .expect("Poisoned mutex")
                        .update(&info, chain.phase(), now.elapsed());
                }
                info!(
                    chain = chain_id,
                    sweeps = chain.sweeps(),
                    draws = chain.retained(),
                    "chain finished"
                );
                Ok(())
            };

            let result = mark_done(&finished, sample());

            // The receiver is gone if the sampler was dropped.
            let _ = results.send(result);
        });

        Self {
            trace,
            stop_marker: stop_marker_tx,
            progress,
        }
    }
}

/// Mark a chain as done whether it finished or failed, so progress
/// reports never show a dead chain as running.
fn mark_done<T>(progress: &Mutex<ChainProgress>, result: Result<T>) -> Result<T> {
    progress.lock().expect("Poisoned mutex").phase = ChainPhase::Done;
    result
}

#[derive(Debug)]
enum SamplerCommand {
    Stop,
    InspectTrace,
    Progress,
}

enum SamplerResponse {
    Ok(),
    IntermediateTrace(Trace),
    Progress(Box<[ChainProgress]>),
}

pub enum SamplerWaitResult {
    Trace(Trace),
    Timeout(Sampler),
    Err(anyhow::Error, Option<Trace>),
}

pub struct ProgressCallback {
    pub callback: Box<dyn FnMut(Duration, Box<[ChainProgress]>) + Send>,
    pub rate: Duration,
}

/// Chains running in the background on their own thread pool.
pub struct Sampler {
    main_thread: JoinHandle<Result<Vec<Option<ChainOutput>>>>,
    commands: SyncSender<SamplerCommand>,
    responses: Receiver<SamplerResponse>,
    results: Receiver<Result<()>>,
}

impl Sampler {
    #[tracing::instrument(skip_all, fields(kind = %model.kind(), chains = settings.num_chains))]
    pub fn new(
        model: OccupancyModel,
        settings: SamplerSettings,
        num_cores: usize,
        callback: Option<ProgressCallback>,
    ) -> Result<Self> {
        settings
            .validate()
            .context("Refusing to start chains with invalid settings")?;
        if num_cores == 0 {
            return Err(OccupancyError::InvalidSettings {
                reason: "at least one worker thread is required".into(),
            }
            .into());
        }

        let (commands_tx, commands_rx) = sync_channel(0);
        let (responses_tx, responses_rx) = sync_channel(0);
        let (results_tx, results_rx) = channel();

        let main_thread = spawn(move || {
            let pool = ThreadPoolBuilder::new()
                .num_threads(num_cores + 1) // The controller occupies one thread
                .thread_name(|i| format!("occupancy-worker-{}", i))
                .build()
                .context("Could not start thread pool")?;

            let settings_ref = &settings;
            let model_ref = &model;
            let mut callback = callback;

            pool.scope_fifo(move |scope| {
                let results = results_tx;
                let chains = (0..settings_ref.num_chains as u64)
                    .map(|chain_id| {
                        ChainProcess::start(
                            model_ref,
                            chain_id,
                            settings_ref,
                            scope,
                            results.clone(),
                        )
                    })
                    .collect_vec();
                drop(results);
                debug!(chains = chains.len(), "chains started");

                let mut main_loop = || {
                    let start_time = Instant::now();
                    let mut progress_rate = Duration::MAX;
                    if let Some(ProgressCallback { callback, rate }) = &mut callback {
                        let progress = chains.iter().map(|chain| chain.progress()).collect_vec();
                        callback(start_time.elapsed(), progress.into());
                        progress_rate = *rate;
                    }
                    let mut last_progress = Instant::now();

                    loop {
                        let timeout = progress_rate.checked_sub(last_progress.elapsed());
                        let timeout = timeout.unwrap_or_else(|| {
                            if let Some(ProgressCallback { callback, .. }) = &mut callback {
                                let progress =
                                    chains.iter().map(|chain| chain.progress()).collect_vec();
                                callback(start_time.elapsed(), progress.into());
                            }
                            last_progress = Instant::now();
                            progress_rate
                        });

                        match commands_rx.recv_timeout(timeout) {
                            Ok(SamplerCommand::Stop) => {
                                for chain in chains.iter() {
                                    chain.stop();
                                }
                                responses_tx.send(SamplerResponse::Ok())?;
                            }
                            Ok(SamplerCommand::InspectTrace) => {
                                let trace: Trace =
                                    chains.iter().filter_map(|chain| chain.current_trace()).into();
                                responses_tx.send(SamplerResponse::IntermediateTrace(trace))?;
                            }
                            Ok(SamplerCommand::Progress) => {
                                let progress =
                                    chains.iter().map(|chain| chain.progress()).collect_vec();
                                responses_tx.send(SamplerResponse::Progress(progress.into()))?;
                            }
                            Err(RecvTimeoutError::Timeout) => {}
                            Err(RecvTimeoutError::Disconnected) => {
                                if let Some(ProgressCallback { callback, .. }) = &mut callback {
                                    let progress =
                                        chains.iter().map(|chain| chain.progress()).collect_vec();
                                    callback(start_time.elapsed(), progress.into());
                                }
                                return Ok(());
                            }
                        };
                    }
                };
                let result: Result<()> = main_loop();
                // Run finalization even if something failed
                let output = ChainProcess::finalize_many(chains);

                result?;
                Ok(output)
            })
        });

        Ok(Self {
            main_thread,
            commands: commands_tx,
            responses: responses_rx,
            results: results_rx,
        })
    }

    /// Ask every chain to stop after its current sweep. Draws retained so
    /// far are kept; collect them with [`wait`](Self::wait).
    pub fn stop(&mut self) -> Result<()> {
        self.commands
            .send(SamplerCommand::Stop)
            .context("Could not send stop command to controller thread")?;
        let response = self
            .responses
            .recv()
            .context("Could not receive stop response from controller thread")?;
        let SamplerResponse::Ok() = response else {
            bail!("Got invalid response from sample controller thread");
        };
        Ok(())
    }

    /// Stop immediately and return whatever the chains retained.
    pub fn abort(self) -> (Result<()>, Option<Trace>) {
        drop(self.commands);
        let result = self.main_thread.join();
        let errors = self.results.try_iter().filter_map(|r| r.err()).collect_vec();
        match result {
            Err(payload) => std::panic::resume_unwind(payload),
            Ok(Ok(traces)) => {
                let trace: Trace = traces.into_iter().flatten().into();
                match errors.into_iter().next() {
                    Some(err) => (Err(err), Some(trace)),
                    None => (Ok(()), Some(trace)),
                }
            }
            Ok(Err(err)) => (Err(err), None),
        }
    }

    /// Block until every chain is done.
    pub fn wait(self) -> Result<Trace> {
        loop {
            match self.results.recv() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    let _ = self.abort();
                    return Err(err);
                }
                Err(_) => break,
            }
        }
        let (result, trace) = self.abort();
        result?;
        trace.context("Sampler returned no trace")
    }

    pub fn wait_timeout(self, timeout: Duration) -> SamplerWaitResult {
        let start = Instant::now();
        loop {
            let Some(remaining) = timeout.checked_sub(start.elapsed()) else {
                return SamplerWaitResult::Timeout(self);
            };
            match self.results.recv_timeout(remaining) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    let (_, trace) = self.abort();
                    return SamplerWaitResult::Err(e, trace);
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return match self.abort() {
                        (Err(err), trace) => SamplerWaitResult::Err(err, trace),
                        (Ok(()), Some(trace)) => SamplerWaitResult::Trace(trace),
                        (Ok(()), None) => SamplerWaitResult::Trace(Trace::default()),
                    };
                }
                Err(RecvTimeoutError::Timeout) => return SamplerWaitResult::Timeout(self),
            }
        }
    }

    pub fn inspect_trace(&mut self) -> Result<Trace> {
        self.commands.send(SamplerCommand::InspectTrace)?;
        let response = self.responses.recv()?;
        let SamplerResponse::IntermediateTrace(trace) = response else {
            bail!("Got invalid response from sample controller thread");
        };
        Ok(trace)
    }

    pub fn progress(&mut self) -> Result<Box<[ChainProgress]>> {
        self.commands.send(SamplerCommand::Progress)?;
        let response = self.responses.recv()?;
        let SamplerResponse::Progress(progress) = response else {
            bail!("Got invalid response from sample controller thread");
        };
        Ok(progress)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        data::{DetectionArray, SurveyData},
        model::{CovariateDesign, ModelSpec, Priors},
    };

    use anyhow::Result;
    use pretty_assertions::assert_eq;

    fn model() -> OccupancyModel {
        let mut values = vec![Some(false); 8 * 3 * 2];
        for site in 0..4 {
            values[(site * 3 + site % 3) * 2] = Some(true);
        }
        let detections = DetectionArray::new(8, 3, 2, values).unwrap();
        let data = SurveyData::fully_surveyed(detections).unwrap();
        OccupancyModel::new(data, ModelSpec::Dynamic, Priors::default()).unwrap()
    }

    fn settings() -> SamplerSettings {
        SamplerSettings {
            num_adapt: 20,
            num_burnin: 30,
            num_draws: 50,
            thin: 2,
            seed: 10,
            ..Default::default()
        }
    }

    #[test]
    fn default_settings_are_valid() {
        SamplerSettings::default().validate().unwrap();
        assert_eq!(SamplerSettings::default().total_sweeps(), 3500);
    }

    #[test]
    fn settings_validation() {
        let bad = SamplerSettings {
            thin: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = SamplerSettings {
            init_strategies: vec![InitStrategy::DataDriven, InitStrategy::DataDriven],
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let single = SamplerSettings {
            num_chains: 1,
            init_strategies: vec![InitStrategy::MostlyOccupied],
            ..Default::default()
        };
        single.validate().unwrap();

        let bad = SamplerSettings {
            target_accept: 1.5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn settings_roundtrip_json() -> Result<()> {
        let settings = SamplerSettings {
            max_sweeps: Some(10),
            ..settings()
        };
        let text = serde_json::to_string(&settings)?;
        let parsed: SamplerSettings = serde_json::from_str(&text)?;
        assert_eq!(parsed, settings);

        let partial: SamplerSettings = serde_json::from_str(r#"{"num_draws": 7}"#)?;
        assert_eq!(partial.num_draws, 7);
        assert_eq!(partial.num_chains, 3);
        Ok(())
    }

    #[test]
    fn chains_use_distinct_streams() {
        let settings = settings();
        let model = model();
        let a = sample_sequentially(&model, &settings, 0).unwrap();
        let b = sample_sequentially(&model, &settings, 1).unwrap();
        let again = sample_sequentially(&model, &settings, 0).unwrap();
        assert_eq!(a.draws, again.draws);
        assert_ne!(a.draws, b.draws);
        assert_eq!(a.init, InitStrategy::DataDriven);
        assert_eq!(b.init, InitStrategy::MostlyUnoccupied);
        assert_eq!(a.progress.finished_sweeps, 20 + 30 + 100);
        assert_eq!(a.progress.retained_draws, 50);
    }

    #[test]
    fn acceptance_counts_skip_adaptation() -> Result<()> {
        let settings = settings();
        let output = sample_sequentially(&model(), &settings, 0)?;
        assert_eq!(output.progress.proposed, 0);
        assert!(output.progress.acceptance_rate().is_nan());

        let data = model()
            .data()
            .clone()
            .with_site_covariate("elevation", (0..8).map(|i| i as f64 * 50.).collect())?
            .with_site_covariate("forest", (0..8).map(|i| (i % 3) as f64 / 3.).collect())?
            .with_survey_covariate("date", (0..48).map(|i| 90. + (i % 6) as f64).collect())?;
        let spec = ModelSpec::Covariate(CovariateDesign::default());
        let model = OccupancyModel::new(data, spec, Priors::default())?;
        let output = sample_sequentially(&model, &settings, 0)?;
        // Burn-in and sampling sweeps, twelve coefficients each
        assert_eq!(output.progress.proposed, (30 + 100) * 12);
        let rate = output.progress.acceptance_rate();
        assert!(rate > 0. && rate < 1.);
        Ok(())
    }

    #[test]
    fn zero_worker_threads_are_rejected() {
        let err = Sampler::new(model(), settings(), 0, None)
            .err()
            .expect("no worker threads");
        assert!(matches!(
            err.downcast_ref::<OccupancyError>(),
            Some(OccupancyError::InvalidSettings { .. })
        ));
    }

    #[test]
    fn failed_chain_reports_done() {
        let progress = Mutex::new(ChainProgress::new(10));
        progress.lock().unwrap().phase = ChainPhase::Sampling;
        let result: Result<()> = mark_done(&progress, Err(anyhow::anyhow!("sweep failed")));
        assert!(result.is_err());
        assert_eq!(progress.lock().unwrap().phase, ChainPhase::Done);
    }

    #[test]
    fn checkpoint_keeps_draws() {
        let settings = SamplerSettings {
            max_sweeps: Some(60),
            ..settings()
        };
        let output = sample_sequentially(&model(), &settings, 0).unwrap();
        // 50 sweeps of adaptation and burn-in, then 10 sampling sweeps
        assert_eq!(output.draws.len(), 5);
        assert_eq!(output.progress.phase, ChainPhase::Done);
    }

    #[test]
    fn sample_parallel() -> Result<()> {
        let settings = settings();

        let mut sampler = Sampler::new(model(), settings.clone(), 2, None)?;
        let _trace = sampler.inspect_trace()?;
        sampler.progress()?;
        let (ok, trace) = sampler.abort();
        ok?;
        assert!(trace.expect("No trace").chains.len() <= settings.num_chains);

        let sampler = Sampler::new(model(), settings.clone(), 2, None)?;
        let trace = sampler.wait()?;
        assert_eq!(trace.chains.len(), settings.num_chains);
        assert!(trace
            .chains
            .iter()
            .all(|chain| chain.draws.len() as u64 == settings.num_draws));
        assert_eq!(
            trace.chains.iter().map(|c| c.chain_id).collect_vec(),
            vec![0, 1, 2]
        );

        // Identical to running the chains one after another.
        let sequential = sample_sequentially(&model(), &settings, 1)?;
        assert_eq!(trace.chains[1].draws, sequential.draws);
        Ok(())
    }

    #[test]
    fn stop_keeps_accumulated_draws() -> Result<()> {
        let settings = SamplerSettings {
            num_draws: 1_000_000,
            ..settings()
        };
        let mut sampler = Sampler::new(model(), settings, 2, None)?;
        std::thread::sleep(Duration::from_millis(50));
        sampler.stop()?;
        let trace = sampler.wait()?;
        assert_eq!(trace.chains.len(), 3);
        for chain in &trace.chains {
            assert_eq!(chain.progress.phase, ChainPhase::Done);
            assert!((chain.draws.len() as u64) < 1_000_000);
            let iterations = chain.draws.iter().map(|d| d.iteration).collect_vec();
            assert_eq!(iterations, (0..chain.draws.len() as u64).collect_vec());
        }
        Ok(())
    }

    #[test]
    fn wait_timeout_times_out() -> Result<()> {
        let settings = SamplerSettings {
            num_draws: 1_000_000,
            ..settings()
        };
        let sampler = Sampler::new(model(), settings, 2, None)?;
        match sampler.wait_timeout(Duration::from_nanos(100)) {
            SamplerWaitResult::Timeout(sampler) => {
                let (ok, _) = sampler.abort();
                ok?;
            }
            SamplerWaitResult::Trace(_) => panic!("finished"),
            SamplerWaitResult::Err(err, _) => return Err(err),
        }
        Ok(())
    }

    #[test]
    fn parallel_helper_matches() -> Result<()> {
        let settings = settings();
        let model = model();
        let trace = sample_chains(&model, &settings)?;
        assert_eq!(trace.num_chains(), 3);
        let sequential = sample_sequentially(&model, &settings, 2)?;
        assert_eq!(trace.chains[2].draws, sequential.draws);
        Ok(())
    }
}
