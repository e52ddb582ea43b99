//! End-to-end runs on the synthetic source: token budget, checkpoint cadence,
//! interrupt and resume.

use std::path::Path;

use candle_core::{Device, Tensor};

use sae_common::{
    ActivationSource, ActivationStore, OneOrMany, RandomState, RunnerConfig,
    SyntheticActivations,
};
use sae_core::SaeGroup;
use sae_train::{
    run, train_sae_group, CancellationToken, CheckpointManager, TrainError, TrainHooks,
    TrainStart,
};

const D_IN: usize = 8;

fn config(dir: &Path, run_id: &str) -> RunnerConfig {
    RunnerConfig {
        d_in: D_IN,
        expansion_factor: OneOrMany::One(2),
        train_batch_size: 100,
        n_batches_in_buffer: 4,
        total_training_tokens: 1000,
        checkpoint_every: 5,
        lr: OneOrMany::One(1e-3),
        lr_warm_up_steps: 0,
        feature_sampling_window: 4,
        dead_feature_window: 2,
        log_frequency: 2,
        use_ghost_grads: true,
        checkpoint_path: dir.to_path_buf(),
        run_id: Some(run_id.to_string()),
        seed: 7,
        ..Default::default()
    }
}

fn producer() -> Box<SyntheticActivations> {
    Box::new(SyntheticActivations::new(3, 1, D_IN))
}

fn labels(paths: &[sae_train::CheckpointFiles]) -> Vec<String> {
    paths.iter().map(|f| f.label.to_string()).collect()
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    a.sub(b)
        .unwrap()
        .abs()
        .unwrap()
        .max_all()
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

/// Cancels the run once `limit` batches have been pulled.
struct CancelAfter<'a> {
    inner: &'a mut ActivationStore,
    pulled: usize,
    limit: usize,
    token: CancellationToken,
}

impl ActivationSource for CancelAfter<'_> {
    fn next_batch(&mut self, rng: &mut RandomState) -> anyhow::Result<Tensor> {
        let batch = self.inner.next_batch(rng)?;
        self.pulled += 1;
        if self.pulled == self.limit {
            self.token.cancel();
        }
        Ok(batch)
    }

    fn representative_sample(&self) -> anyhow::Result<Tensor> {
        self.inner.representative_sample()
    }

    fn save(&self, path: &Path) -> anyhow::Result<()> {
        self.inner.save(path)
    }
}

#[test]
fn run_spends_the_token_budget() {
    let dir = tempfile::tempdir().unwrap();
    let out = run(config(dir.path(), "budget"), producer(), TrainHooks::default()).unwrap();

    assert_eq!(out.n_training_tokens, 1000);
    assert_eq!(out.n_training_steps, 10);
    assert_eq!(labels(&out.checkpoint_paths), vec!["100", "600", "final_1000"]);
    for files in &out.checkpoint_paths {
        assert!(files.manifest().is_file(), "{}", files.label);
    }
    assert_eq!(out.log_feature_sparsities.len(), 1);
}

#[test]
fn retention_keeps_only_the_newest_bundle() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = RunnerConfig {
        max_checkpoints: Some(1),
        ..config(dir.path(), "retained")
    };
    let manager = CheckpointManager::new(&cfg).unwrap();
    run(cfg, producer(), TrainHooks::default()).unwrap();

    let entries = manager.checkpoints().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].label.to_string(), "final_1000");
    assert!(entries[0].complete);
}

#[test]
fn resume_without_checkpoint_starts_fresh() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = RunnerConfig {
        resume: true,
        ..config(dir.path(), "empty")
    };
    let out = run(cfg, producer(), TrainHooks::default()).unwrap();
    assert_eq!(out.n_training_tokens, 1000);
}

#[test]
fn interrupted_run_resumes_to_the_same_weights() {
    let dir = tempfile::tempdir().unwrap();

    let reference = run(config(dir.path(), "reference"), producer(), TrainHooks::default()).unwrap();

    // Fresh start built exactly as the runner builds it, behind a source that
    // cancels after three batches.
    let cfg = config(dir.path(), "interrupted");
    let device = Device::Cpu;
    let mut rng = RandomState::from_seed(cfg.seed);
    let group = SaeGroup::new(cfg.clone(), &mut rng, &device).unwrap();
    let mut store = ActivationStore::from_config(&cfg, producer(), &mut rng, &device).unwrap();
    let token = CancellationToken::new();
    let mut source = CancelAfter {
        inner: &mut store,
        pulled: 0,
        limit: 3,
        token: token.clone(),
    };
    let mut hooks = TrainHooks {
        cancel: token,
        ..Default::default()
    };
    let err = train_sae_group(group, &mut source, TrainStart::Fresh(rng), &mut hooks)
        .err()
        .unwrap();
    assert!(matches!(err, TrainError::Interrupted { step: 3 }), "{err}");

    let manager = CheckpointManager::new(&cfg).unwrap();
    let latest = manager.latest().unwrap().unwrap();
    assert_eq!(latest.label.to_string(), "300");

    let resumed = run(
        RunnerConfig {
            resume: true,
            ..cfg
        },
        producer(),
        TrainHooks::default(),
    )
    .unwrap();
    assert_eq!(resumed.n_training_tokens, 1000);
    assert_eq!(resumed.n_training_steps, 10);
    assert_eq!(labels(&resumed.checkpoint_paths), vec!["600", "final_1000"]);

    let a = reference.group.get(0).unwrap();
    let b = resumed.group.get(0).unwrap();
    for (x, y) in [
        (a.w_enc(), b.w_enc()),
        (a.b_enc(), b.b_enc()),
        (a.w_dec(), b.w_dec()),
        (a.b_dec(), b.b_dec()),
    ] {
        assert!(max_abs_diff(x, y) < 1e-4);
    }
}
