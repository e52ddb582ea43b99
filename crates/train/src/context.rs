//! Per-autoencoder training state and the run-wide state that checkpoints
//! capture.

use candle_core::{DType, Result, Tensor};
use candle_nn::Optimizer;

use sae_common::{RandomState, RandomStateSnapshot};
use sae_core::SparseAutoencoder;

use crate::optim::{Adam, AdamState, ParamsAdam};
use crate::scheduler::{LrScheduler, SchedulerState};

const LOG_SPARSITY_EPS: f64 = 1e-10;

// ── Train context ───────────────────────────────────────────────────────────

/// Mutable bookkeeping for one autoencoder of the group.
pub struct TrainContext {
    /// Per unit: number of tokens it fired on since the last window reset.
    pub act_freq_scores: Tensor,
    /// Per unit: steps since it last fired on any token of a batch. Never reset
    /// by the sparsity window.
    pub steps_since_fired: Tensor,
    pub tokens_seen_since_reset: u64,
    pub optimizer: Adam,
    pub scheduler: LrScheduler,
}

impl TrainContext {
    pub fn new(sae: &SparseAutoencoder, total_training_steps: usize) -> Result<Self> {
        let cfg = sae.cfg();
        let optimizer = Adam::new(
            sae.vars(),
            ParamsAdam {
                lr: cfg.lr,
                ..Default::default()
            },
        )?;
        Ok(Self {
            act_freq_scores: Tensor::zeros(cfg.d_sae, DType::F32, sae.device())?,
            steps_since_fired: Tensor::zeros(cfg.d_sae, DType::F32, sae.device())?,
            tokens_seen_since_reset: 0,
            optimizer,
            scheduler: LrScheduler::from_sae_config(cfg, total_training_steps),
        })
    }

    /// Fraction of tokens each unit fired on since the last reset; `None`
    /// until at least one token has been seen.
    pub fn feature_sparsity(&self) -> Result<Option<Tensor>> {
        if self.tokens_seen_since_reset == 0 {
            return Ok(None);
        }
        self.act_freq_scores
            .affine(1.0 / self.tokens_seen_since_reset as f64, 0.0)
            .map(Some)
    }

    /// `log10(feature_sparsity + 1e-10)`.
    pub fn log_feature_sparsity(&self) -> Result<Option<Tensor>> {
        match self.feature_sparsity()? {
            Some(sparsity) => log_feature_sparsity(&sparsity).map(Some),
            None => Ok(None),
        }
    }

    pub fn reset_sparsity_window(&mut self) -> Result<()> {
        self.act_freq_scores = self.act_freq_scores.zeros_like()?;
        self.tokens_seen_since_reset = 0;
        Ok(())
    }

    /// U8 mask of units that have not fired for more than `window` steps.
    pub fn dead_mask(&self, window: usize) -> Result<Tensor> {
        self.steps_since_fired.gt(window as f64)
    }

    /// Update firing counters from a batch of feature activations `[batch, d_sae]`.
    pub fn record_firing(&mut self, feature_acts: &Tensor) -> Result<()> {
        let fired = feature_acts.detach().gt(0f64)?.to_dtype(DType::F32)?;
        let did_fire = fired.sum(0)?.gt(0f64)?;
        let incremented = self.steps_since_fired.affine(1.0, 1.0)?;
        self.steps_since_fired =
            did_fire.where_cond(&incremented.zeros_like()?, &incremented)?;
        self.act_freq_scores = self.act_freq_scores.add(&fired.sum(0)?)?;
        self.tokens_seen_since_reset += feature_acts.dim(0)? as u64;
        Ok(())
    }

    /// Deep copy of everything except the parameters themselves.
    pub fn snapshot(&self) -> Result<TrainContextSnapshot> {
        Ok(TrainContextSnapshot {
            act_freq_scores: self.act_freq_scores.copy()?,
            steps_since_fired: self.steps_since_fired.copy()?,
            tokens_seen_since_reset: self.tokens_seen_since_reset,
            optimizer: self.optimizer.snapshot()?,
            scheduler: self.scheduler.state(),
        })
    }

    /// Overwrite a freshly built context with persisted state.
    pub fn hydrate(&mut self, snapshot: &TrainContextSnapshot) -> Result<()> {
        let d_sae = self.act_freq_scores.dims();
        if snapshot.act_freq_scores.dims() != d_sae || snapshot.steps_since_fired.dims() != d_sae {
            candle_core::bail!(
                "train context counters have shape {:?}, expected {d_sae:?}",
                snapshot.act_freq_scores.dims()
            );
        }
        let device = self.act_freq_scores.device().clone();
        self.act_freq_scores = snapshot.act_freq_scores.to_device(&device)?;
        self.steps_since_fired = snapshot.steps_since_fired.to_device(&device)?;
        self.tokens_seen_since_reset = snapshot.tokens_seen_since_reset;
        self.optimizer.hydrate(&snapshot.optimizer)?;
        self.scheduler.hydrate(snapshot.scheduler);
        Ok(())
    }
}

pub fn log_feature_sparsity(feature_sparsity: &Tensor) -> Result<Tensor> {
    feature_sparsity.affine(1.0, LOG_SPARSITY_EPS)?.log()?.affine(1.0 / std::f64::consts::LN_10, 0.0)
}

/// Persisted form of a [`TrainContext`].
#[derive(Debug, Clone)]
pub struct TrainContextSnapshot {
    pub act_freq_scores: Tensor,
    pub steps_since_fired: Tensor,
    pub tokens_seen_since_reset: u64,
    pub optimizer: AdamState,
    pub scheduler: SchedulerState,
}

// ── Run state ───────────────────────────────────────────────────────────────

/// Everything besides weights and the activation buffer that a resumed run
/// needs to continue exactly where it stopped.
#[derive(Debug, Clone)]
pub struct TrainingRunState {
    pub contexts: Vec<TrainContextSnapshot>,
    pub n_training_steps: u64,
    pub n_training_tokens: u64,
    pub random_state: RandomStateSnapshot,
}

impl TrainingRunState {
    pub fn capture(
        contexts: &[TrainContext],
        n_training_steps: u64,
        n_training_tokens: u64,
        rng: &RandomState,
    ) -> Result<Self> {
        Ok(Self {
            contexts: contexts
                .iter()
                .map(TrainContext::snapshot)
                .collect::<Result<_>>()?,
            n_training_steps,
            n_training_tokens,
            random_state: rng.snapshot(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rand::Rng;
    use sae_common::{OneOrMany, RunnerConfig, SaeConfig};

    fn sae_cfg() -> SaeConfig {
        let cfg = RunnerConfig {
            d_in: 2,
            expansion_factor: OneOrMany::One(2),
            ..Default::default()
        };
        cfg.sae_configs().remove(0)
    }

    fn context() -> TrainContext {
        let mut rng = RandomState::from_seed(0);
        let sae = SparseAutoencoder::new(sae_cfg(), &mut rng, &Device::Cpu).unwrap();
        TrainContext::new(&sae, 100).unwrap()
    }

    fn acts(rows: &[[f32; 4]]) -> Tensor {
        Tensor::from_vec(rows.concat(), (rows.len(), 4), &Device::Cpu).unwrap()
    }

    #[test]
    fn sparsity_is_undefined_until_tokens_seen() {
        let mut ctx = context();
        assert!(ctx.feature_sparsity().unwrap().is_none());
        ctx.record_firing(&acts(&[[1., 0., 0., 0.], [1., 2., 0., 0.]]))
            .unwrap();
        let s = ctx.feature_sparsity().unwrap().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(s, vec![1.0, 0.5, 0.0, 0.0]);

        ctx.reset_sparsity_window().unwrap();
        assert!(ctx.feature_sparsity().unwrap().is_none());
        assert!(ctx.log_feature_sparsity().unwrap().is_none());
    }

    #[test]
    fn log_sparsity_floor() {
        let s = Tensor::new(&[0f32, 0.1], &Device::Cpu).unwrap();
        let v = log_feature_sparsity(&s).unwrap().to_vec1::<f32>().unwrap();
        assert!((v[0] + 10.0).abs() < 1e-3);
        assert!((v[1] + 1.0).abs() < 1e-5);
    }

    #[test]
    fn dead_mask_tracks_units_that_stop_firing() {
        let mut ctx = context();
        // Unit 0 fires every batch, unit 1 never does.
        for _ in 0..4 {
            ctx.record_firing(&acts(&[[1., 0., 0., 0.]])).unwrap();
        }
        let mask = ctx.dead_mask(3).unwrap().to_vec1::<u8>().unwrap();
        assert_eq!(mask, vec![0, 1, 1, 1]);
        assert_eq!(ctx.dead_mask(4).unwrap().to_vec1::<u8>().unwrap(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn window_reset_keeps_dead_counters() {
        let mut ctx = context();
        ctx.record_firing(&acts(&[[0., 0., 0., 0.]])).unwrap();
        ctx.reset_sparsity_window().unwrap();
        assert_eq!(
            ctx.steps_since_fired.to_vec1::<f32>().unwrap(),
            vec![1., 1., 1., 1.]
        );
    }

    #[test]
    fn run_state_reproduces_random_draws() {
        let ctx = context();
        let mut rng = RandomState::from_seed(11);
        rng.permutation(10);
        let state = TrainingRunState::capture(&[ctx], 3, 300, &rng).unwrap();
        let mut restored = RandomState::restore(&state.random_state);
        for _ in 0..3 {
            assert_eq!(rng.general().gen::<u64>(), restored.general().gen::<u64>());
            assert_eq!(
                rng.tensor_rng().gen::<u64>(),
                restored.tensor_rng().gen::<u64>()
            );
        }
        assert_eq!(state.contexts.len(), 1);
    }

    #[test]
    fn hydrate_restores_counters() {
        let mut ctx = context();
        ctx.record_firing(&acts(&[[1., 0., 1., 0.]])).unwrap();
        ctx.scheduler.advance();
        let snap = ctx.snapshot().unwrap();

        let mut fresh = context();
        fresh.hydrate(&snap).unwrap();
        assert_eq!(fresh.tokens_seen_since_reset, 1);
        assert_eq!(fresh.scheduler.step(), 1);
        assert_eq!(
            fresh.steps_since_fired.to_vec1::<f32>().unwrap(),
            vec![0., 1., 0., 1.]
        );
    }
}
