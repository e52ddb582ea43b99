//! One optimisation step of one autoencoder.

use candle_core::{IndexOp, Result as CandleResult, Tensor};
use candle_nn::Optimizer;

use sae_core::SparseAutoencoder;

use crate::context::TrainContext;
use crate::error::{Result, TrainError};

/// Step-level inputs shared by every autoencoder of the group.
#[derive(Debug, Clone, Copy)]
pub struct StepParams {
    /// Global step index, counted from 0.
    pub step: u64,
    pub feature_sampling_window: usize,
    pub dead_feature_window: usize,
}

/// Feature sparsity observed over one sampling window, before the reset.
pub struct SparsityReport {
    pub feature_sparsity: Tensor,
    pub log_feature_sparsity: Tensor,
}

pub struct TrainStepOutput {
    pub sae_in: Tensor,
    pub sae_out: Tensor,
    pub feature_acts: Tensor,
    pub loss: f32,
    pub mse_loss: f32,
    pub l1_loss: f32,
    pub ghost_grad_loss: f32,
    /// U8 mask of the units treated as dead this step.
    pub dead_mask: Tensor,
    /// Learning rate the optimiser stepped with.
    pub learning_rate: f64,
    /// Present on steps that close a sparsity window.
    pub sparsity_report: Option<SparsityReport>,
}

/// Slice one layer out of a `[batch, num_layers, d_in]` batch.
pub fn layer_slice(batch: &Tensor, layer_index: usize) -> CandleResult<Tensor> {
    batch.i((.., layer_index, ..))?.contiguous()
}

/// Run one training step.
///
/// Order: normalise decoder, close the sparsity window if due, forward with
/// the dead mask, update firing counters, backward, project decoder
/// gradients, optimiser step, scheduler advance.
pub fn train_step(
    sae: &SparseAutoencoder,
    sae_in: &Tensor,
    ctx: &mut TrainContext,
    params: StepParams,
    index: usize,
) -> Result<TrainStepOutput> {
    sae.set_decoder_norm_to_unit_norm()?;

    let window = params.feature_sampling_window as u64;
    let sparsity_report = if window > 0 && (params.step + 1) % window == 0 {
        let report = match ctx.feature_sparsity()? {
            Some(feature_sparsity) => Some(SparsityReport {
                log_feature_sparsity: crate::context::log_feature_sparsity(&feature_sparsity)?,
                feature_sparsity,
            }),
            None => None,
        };
        ctx.reset_sparsity_window()?;
        report
    } else {
        None
    };

    let dead_mask = ctx.dead_mask(params.dead_feature_window)?;
    let out = sae.forward(sae_in, Some(&dead_mask))?;

    let loss = out.loss.to_scalar::<f32>()?;
    if !loss.is_finite() {
        return Err(TrainError::NonFiniteLoss {
            index,
            step: params.step,
            loss,
        });
    }

    ctx.record_firing(&out.feature_acts)?;

    let mut grads = out.loss.backward()?;
    sae.remove_gradient_parallel_to_decoder_directions(&mut grads)?;
    let learning_rate = ctx.scheduler.current_lr();
    ctx.optimizer.set_learning_rate(learning_rate);
    ctx.optimizer.step(&grads)?;
    ctx.scheduler.advance();

    Ok(TrainStepOutput {
        sae_in: sae_in.clone(),
        sae_out: out.sae_out.detach(),
        feature_acts: out.feature_acts.detach(),
        loss,
        mse_loss: out.mse_loss.to_scalar::<f32>()?,
        l1_loss: out.l1_loss.to_scalar::<f32>()?,
        ghost_grad_loss: out.ghost_grad_loss.to_scalar::<f32>()?,
        dead_mask,
        learning_rate,
        sparsity_report,
    })
}
