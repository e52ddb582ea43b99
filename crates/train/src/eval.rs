//! Out-of-band evaluation, run at step 0 and every `log_frequency * 10` steps.

use candle_core::{DType, Tensor};

use sae_common::ActivationSource;
use sae_core::SparseAutoencoder;

use crate::metrics::{explained_variance, l0, mean_std, MetricValue, Metrics};
use crate::step::layer_slice;

/// Evaluation hook: `(model, buffer, step) -> metrics`.
pub trait Evaluator {
    fn evaluate(
        &mut self,
        sae: &SparseAutoencoder,
        layer_index: usize,
        source: &dyn ActivationSource,
        step: u64,
    ) -> anyhow::Result<Metrics>;
}

pub struct NoopEvaluator;

impl Evaluator for NoopEvaluator {
    fn evaluate(
        &mut self,
        _sae: &SparseAutoencoder,
        _layer_index: usize,
        _source: &dyn ActivationSource,
        _step: u64,
    ) -> anyhow::Result<Metrics> {
        Ok(Metrics::new())
    }
}

/// Reconstruction quality on the rows currently buffered.
pub struct ReconstructionEvaluator {
    /// Rows taken from the head of the buffer.
    pub max_rows: usize,
}

impl Default for ReconstructionEvaluator {
    fn default() -> Self {
        Self { max_rows: 4096 }
    }
}

impl Evaluator for ReconstructionEvaluator {
    fn evaluate(
        &mut self,
        sae: &SparseAutoencoder,
        layer_index: usize,
        source: &dyn ActivationSource,
        _step: u64,
    ) -> anyhow::Result<Metrics> {
        let sample = source.representative_sample()?;
        let rows = sample.dim(0)?.min(self.max_rows);
        if rows == 0 {
            return Ok(Metrics::new());
        }
        let x = layer_slice(&sample.narrow(0, 0, rows)?, layer_index)?;
        let out = sae.forward(&x, None)?;
        let sae_out = out.sae_out.detach();
        let mse = sae_out
            .sub(&x.to_dtype(DType::F32)?)?
            .sqr()?
            .mean_all()?
            .to_scalar::<f32>()?;
        let (ev, _) = mean_std(&explained_variance(&x, &sae_out)?)?;
        let zero_ablated = zero_ablation_mse(&x)?;

        let mut m = Metrics::new();
        m.insert("eval/reconstruction_mse".into(), MetricValue::Scalar(mse as f64));
        m.insert("eval/zero_ablation_mse".into(), MetricValue::Scalar(zero_ablated));
        m.insert("eval/explained_variance".into(), MetricValue::Scalar(ev));
        m.insert("eval/l0".into(), MetricValue::Scalar(l0(&out.feature_acts)?));
        Ok(m)
    }
}

/// MSE of predicting all zeros, the baseline reconstruction.
fn zero_ablation_mse(x: &Tensor) -> candle_core::Result<f64> {
    Ok(x.to_dtype(DType::F32)?.sqr()?.mean_all()?.to_scalar::<f32>()? as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use sae_common::{
        ActivationStore, OneOrMany, RandomState, RunnerConfig, SyntheticActivations,
    };

    #[test]
    fn evaluation_does_not_advance_the_buffer() {
        let cfg = RunnerConfig {
            d_in: 4,
            expansion_factor: OneOrMany::One(2),
            train_batch_size: 8,
            n_batches_in_buffer: 4,
            ..Default::default()
        };
        let mut rng = RandomState::from_seed(0);
        let store = ActivationStore::from_config(
            &cfg,
            Box::new(SyntheticActivations::new(0, 1, 4)),
            &mut rng,
            &Device::Cpu,
        )
        .unwrap();
        let sae = SparseAutoencoder::new(cfg.sae_configs().remove(0), &mut rng, &Device::Cpu).unwrap();

        let remaining = store.remaining();
        let m = ReconstructionEvaluator::default()
            .evaluate(&sae, 0, &store, 0)
            .unwrap();
        assert_eq!(store.remaining(), remaining);
        for key in ["eval/reconstruction_mse", "eval/explained_variance", "eval/l0"] {
            assert!(m[key].as_scalar().unwrap().is_finite(), "{key}");
        }
    }
}
