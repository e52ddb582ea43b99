//! Group training loop.
//!
//! Drives every autoencoder of a [`SaeGroup`] through the same activation
//! batches until the token budget is spent, checkpointing on a cadence and
//! once more at the end. A cancellation request is honoured at the top of an
//! iteration: the loop saves a checkpoint and returns
//! [`TrainError::Interrupted`].

use std::collections::HashMap;

use candle_core::{Result as CandleResult, Tensor};
use indicatif::{ProgressBar, ProgressStyle};

use sae_common::{ActivationSource, BiasInit, RandomState};
use sae_core::{
    autoencoder::mean_distance, compute_geometric_median, GeometricMedianOptions, SaeGroup,
};

use crate::cancel::CancellationToken;
use crate::checkpoint::{CheckpointFiles, CheckpointLabel, CheckpointManager, SavedCheckpoint};
use crate::context::{TrainContext, TrainingRunState};
use crate::error::{Result, TrainError};
use crate::eval::{Evaluator, NoopEvaluator};
use crate::metrics::{
    sparsity_window_metrics, train_step_metrics, Metrics, MetricsSink, TracingSink,
};
use crate::step::{layer_slice, train_step, StepParams};

// ── Inputs / outputs ────────────────────────────────────────────────────────

/// How the loop obtains its initial state.
pub enum TrainStart {
    /// New run: decoder biases are initialised from the buffer.
    Fresh(RandomState),
    /// Continue from a checkpoint's run state.
    Resume(TrainingRunState),
}

/// Collaborators the loop reports to.
pub struct TrainHooks {
    pub evaluator: Box<dyn Evaluator>,
    pub sink: Box<dyn MetricsSink>,
    pub cancel: CancellationToken,
    pub show_progress: bool,
}

impl Default for TrainHooks {
    fn default() -> Self {
        Self {
            evaluator: Box::new(NoopEvaluator),
            sink: Box::new(TracingSink),
            cancel: CancellationToken::new(),
            show_progress: false,
        }
    }
}

pub struct TrainGroupOutput {
    pub group: SaeGroup,
    /// Every bundle written by this call, in order; the last is the final one.
    pub checkpoint_paths: Vec<CheckpointFiles>,
    /// Per autoencoder; `None` when no token was seen since the last window reset.
    pub log_feature_sparsities: Vec<Option<Tensor>>,
    pub n_training_steps: u64,
    pub n_training_tokens: u64,
}

// ── Loop ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    Checkpointing,
    Interrupted,
    Done,
}

/// Train `group` on batches from `source` until the token budget is spent.
///
/// The group's config is validated first; a bad config is
/// [`TrainError::Config`].
pub fn train_sae_group(
    group: SaeGroup,
    source: &mut dyn ActivationSource,
    start: TrainStart,
    hooks: &mut TrainHooks,
) -> Result<TrainGroupOutput> {
    let cfg = group.cfg().clone();
    cfg.validate()?;
    let manager = CheckpointManager::new(&cfg)?;
    let total_tokens = cfg.total_training_tokens;
    let total_steps = cfg.total_training_steps() as usize;
    let batch_tokens = cfg.train_batch_size as u64;
    let log_frequency = cfg.log_frequency as u64;
    let eval_frequency = log_frequency * 10;

    let suffixes: Vec<String> = group.iter().map(|s| cfg.metric_suffix(s.cfg())).collect();
    let layer_indices = group
        .iter()
        .map(|s| group.layer_index(s))
        .collect::<CandleResult<Vec<_>>>()?;
    let mut contexts = group
        .iter()
        .map(|s| TrainContext::new(s, total_steps))
        .collect::<CandleResult<Vec<_>>>()?;

    let mut n_steps = 0u64;
    let mut n_tokens = 0u64;
    let pb = progress_bar(total_tokens, hooks.show_progress);

    // ── Initializing ────────────────────────────────────────────────────────
    let mut rng = match start {
        TrainStart::Resume(state) => {
            if !cfg.resume {
                tracing::warn!("resuming from a training run state but `resume` is false");
            }
            if state.contexts.len() != contexts.len() {
                return Err(TrainError::IncompatibleCheckpoint {
                    path: manager.run_dir().display().to_string(),
                    reason: format!(
                        "{} train contexts for {} autoencoders",
                        state.contexts.len(),
                        contexts.len()
                    ),
                });
            }
            for (ctx, snapshot) in contexts.iter_mut().zip(&state.contexts) {
                ctx.hydrate(snapshot)?;
            }
            n_steps = state.n_training_steps;
            n_tokens = state.n_training_tokens;
            pb.set_position(n_tokens.min(total_tokens));
            tracing::info!(step = n_steps, tokens = n_tokens, "resuming from step {n_steps}");
            RandomState::restore(&state.random_state)
        }
        TrainStart::Fresh(rng) => {
            init_b_decs(&group, &*source)?;
            rng
        }
    };

    tracing::info!(
        group = %group.name(),
        autoencoders = group.len(),
        total_tokens,
        total_steps,
        "training sae group"
    );

    let mut checkpoint_paths = Vec::new();
    let mut phase = Phase::Running;
    loop {
        match phase {
            Phase::Running => {
                if n_tokens >= total_tokens {
                    phase = Phase::Done;
                    continue;
                }
                if hooks.cancel.is_cancelled() {
                    phase = Phase::Interrupted;
                    continue;
                }

                let step = n_steps;
                let batch = source
                    .next_batch(&mut rng)
                    .map_err(TrainError::Activations)?;
                n_tokens += batch_tokens;

                let params = StepParams {
                    step,
                    feature_sampling_window: cfg.feature_sampling_window,
                    dead_feature_window: cfg.dead_feature_window,
                };
                let mut mse_sum = 0f32;
                let mut l1_sum = 0f32;
                for (i, sae) in group.iter().enumerate() {
                    let sae_in = layer_slice(&batch, layer_indices[i])?;
                    let ctx = &mut contexts[i];
                    let out = train_step(sae, &sae_in, ctx, params, i)?;
                    mse_sum += out.mse_loss;
                    l1_sum += out.l1_loss;

                    if let Some(report) = &out.sparsity_report {
                        let m = sparsity_window_metrics(
                            &report.feature_sparsity,
                            &report.log_feature_sparsity,
                            &suffixes[i],
                        )?;
                        hooks.sink.emit(step, &m);
                    }
                    if (step + 1) % log_frequency == 0 {
                        let m = train_step_metrics(
                            &out,
                            ctx,
                            sae.l1_coefficient(),
                            &suffixes[i],
                            n_tokens,
                        )?;
                        hooks.sink.emit(step, &m);
                    }
                    if step == 0 || (step + 1) % eval_frequency == 0 {
                        let m = hooks
                            .evaluator
                            .evaluate(sae, layer_indices[i], &*source, step)
                            .map_err(|error| TrainError::Evaluation { step, error })?;
                        if !m.is_empty() {
                            hooks.sink.emit(step, &with_suffix(m, &suffixes[i]));
                        }
                    }
                }

                n_steps += 1;
                let n = group.len().max(1) as f32;
                pb.set_message(format!(
                    "{n_steps}| MSE Loss {:.3} | L1 {:.3}",
                    mse_sum / n,
                    l1_sum / n
                ));
                pb.set_position(n_tokens.min(total_tokens));

                if checkpoint_due(step, cfg.checkpoint_every) {
                    phase = Phase::Checkpointing;
                }
            }
            Phase::Checkpointing => {
                let saved = save_checkpoint(
                    &manager,
                    &group,
                    &*source,
                    &contexts,
                    (n_steps, n_tokens),
                    &rng,
                    CheckpointLabel::Tokens(n_tokens),
                )?;
                checkpoint_paths.push(saved.files);
                phase = Phase::Running;
            }
            Phase::Interrupted => {
                pb.abandon();
                tracing::info!("interrupted, saving progress");
                save_checkpoint(
                    &manager,
                    &group,
                    &*source,
                    &contexts,
                    (n_steps, n_tokens),
                    &rng,
                    CheckpointLabel::Tokens(n_tokens),
                )?;
                tracing::info!("done saving");
                return Err(TrainError::Interrupted { step: n_steps });
            }
            Phase::Done => {
                let saved = save_checkpoint(
                    &manager,
                    &group,
                    &*source,
                    &contexts,
                    (n_steps, n_tokens),
                    &rng,
                    CheckpointLabel::Final(n_tokens),
                )?;
                pb.finish();
                checkpoint_paths.push(saved.files);
                return Ok(TrainGroupOutput {
                    group,
                    checkpoint_paths,
                    log_feature_sparsities: saved.log_feature_sparsities,
                    n_training_steps: n_steps,
                    n_training_tokens: n_tokens,
                });
            }
        }
    }
}

/// `checkpoint_every == 0` keeps only the run-start checkpoint (after step 0).
fn checkpoint_due(step: u64, checkpoint_every: usize) -> bool {
    match checkpoint_every {
        0 => step == 0,
        every => step % every as u64 == 0,
    }
}

fn save_checkpoint(
    manager: &CheckpointManager,
    group: &SaeGroup,
    source: &dyn ActivationSource,
    contexts: &[TrainContext],
    (n_steps, n_tokens): (u64, u64),
    rng: &RandomState,
    label: CheckpointLabel,
) -> Result<SavedCheckpoint> {
    let run_state = TrainingRunState::capture(contexts, n_steps, n_tokens, rng)?;
    manager.save(group, source, &run_state, label)
}

/// Initialise every decoder bias from the buffered activations. Geometric
/// medians are computed once per layer.
fn init_b_decs(group: &SaeGroup, source: &dyn ActivationSource) -> Result<()> {
    let needs_sample = group
        .iter()
        .any(|s| s.cfg().b_dec_init_method != BiasInit::Zeros);
    if !needs_sample {
        return Ok(());
    }
    let sample = source
        .representative_sample()
        .map_err(TrainError::Activations)?;
    let mut medians: HashMap<usize, Tensor> = HashMap::new();
    for sae in group {
        let layer_index = group.layer_index(sae)?;
        match sae.cfg().b_dec_init_method {
            BiasInit::GeometricMedian => {
                let acts = layer_slice(&sample, layer_index)?;
                let median = match medians.get(&layer_index) {
                    Some(m) => m.clone(),
                    None => {
                        let gm = compute_geometric_median(&acts, GeometricMedianOptions::default())?;
                        medians.insert(layer_index, gm.median.clone());
                        gm.median
                    }
                };
                let previous = mean_distance(&acts, sae.b_dec())?;
                let current = mean_distance(&acts, &median)?;
                tracing::info!(
                    layer = sae.cfg().hook_point_layer,
                    previous,
                    current,
                    "initialised b_dec with geometric median"
                );
                sae.initialize_b_dec_with_precalculated(&median)?;
            }
            BiasInit::Mean => {
                sae.initialize_b_dec_with_mean(&layer_slice(&sample, layer_index)?)?;
            }
            BiasInit::Zeros => {}
        }
    }
    Ok(())
}

fn with_suffix(metrics: Metrics, suffix: &str) -> Metrics {
    metrics
        .into_iter()
        .map(|(k, v)| (format!("{k}{suffix}"), v))
        .collect()
}

fn progress_bar(total_tokens: u64, show: bool) -> ProgressBar {
    if !show {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total_tokens);
    if let Ok(style) =
        ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40} {pos}/{len} tokens {msg}")
    {
        pb.set_style(style.progress_chars("=>-"));
    }
    pb
}
