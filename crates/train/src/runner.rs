//! Top-level entry point: resume discovery, fresh construction, training.

use sae_common::{ActivationProducer, ActivationStore, RandomState, RunnerConfig};
use sae_core::SaeGroup;

use crate::checkpoint::CheckpointManager;
use crate::error::{Result, TrainError};
use crate::trainer::{train_sae_group, TrainGroupOutput, TrainHooks, TrainStart};

/// Train the group described by `cfg` on activations from `producer`.
///
/// With `cfg.resume`, the newest complete checkpoint of the run is loaded; if
/// the run has none the run starts fresh with a warning. A bundle that exists
/// but fails to load is an error.
pub fn run(
    mut cfg: RunnerConfig,
    producer: Box<dyn ActivationProducer>,
    mut hooks: TrainHooks,
) -> Result<TrainGroupOutput> {
    cfg.validate()?;
    let run_id = cfg.resolve_run_id().to_string();
    let device = cfg.device()?;
    let manager = CheckpointManager::new(&cfg)?;

    // Discovery happens before the producer is handed to a buffer.
    let resume_from = if cfg.resume {
        let latest = manager.latest()?;
        if latest.is_none() {
            tracing::warn!(
                run_dir = %manager.run_dir().display(),
                "no checkpoint to resume from, starting fresh"
            );
        }
        latest
    } else {
        None
    };

    let (group, mut store, start) = match resume_from {
        Some(files) => {
            let (group, store, state) = manager.load(&files, producer, &device)?;
            tracing::info!(
                label = %files.label,
                step = state.n_training_steps,
                "loaded checkpoint"
            );
            (group, store, TrainStart::Resume(state))
        }
        None => {
            let mut rng = RandomState::from_seed(cfg.seed);
            let group = SaeGroup::new(cfg.clone(), &mut rng, &device)?;
            let store = ActivationStore::from_config(&cfg, producer, &mut rng, &device)
                .map_err(TrainError::Activations)?;
            (group, store, TrainStart::Fresh(rng))
        }
    };

    tracing::info!(
        run_id = %run_id,
        run_dir = %manager.run_dir().display(),
        group = %group.name(),
        "starting run"
    );
    train_sae_group(group, &mut store, start, &mut hooks)
}
