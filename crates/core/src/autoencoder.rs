//! Single sparse autoencoder: ReLU encoder, linear decoder with unit-norm
//! dictionary rows, and a shared pre-encoder / post-decoder bias.
//!
//! ```text
//! sae_in      = x - b_dec
//! hidden_pre  = sae_in · W_enc + b_enc
//! feature_acts = relu(hidden_pre)
//! sae_out     = feature_acts · W_dec + b_dec
//! ```
//!
//! The loss is a normalised reconstruction MSE, an Lp sparsity penalty on the
//! feature activations, and (optionally) the ghost-gradient term that revives
//! dead features.

use std::collections::HashMap;

use candle_core::{backprop::GradStore, DType, Device, Result, Tensor, Var, D};

use sae_common::{RandomState, SaeConfig};

/// Parameter names, in [`SparseAutoencoder::vars`] order.
pub const PARAM_NAMES: [&str; 4] = ["W_enc", "b_enc", "W_dec", "b_dec"];

const GHOST_EPS: f64 = 1e-6;

/// Everything a training step or an evaluation needs from one forward pass.
pub struct ForwardOutput {
    pub sae_out: Tensor,
    pub feature_acts: Tensor,
    pub loss: Tensor,
    pub mse_loss: Tensor,
    pub l1_loss: Tensor,
    /// Zero when ghost gradients are off or no unit is dead.
    pub ghost_grad_loss: Tensor,
}

pub struct SparseAutoencoder {
    cfg: SaeConfig,
    w_enc: Var,
    b_enc: Var,
    w_dec: Var,
    b_dec: Var,
    device: Device,
}

impl SparseAutoencoder {
    /// Kaiming-uniform weights drawn from the tensor generator, zero biases,
    /// decoder rows normalised.
    pub fn new(cfg: SaeConfig, rng: &mut RandomState, device: &Device) -> Result<Self> {
        let (d_in, d_sae) = (cfg.d_in, cfg.d_sae);
        let enc_bound = (6.0 / d_sae as f64).sqrt() as f32;
        let dec_bound = (6.0 / d_in as f64).sqrt() as f32;
        let w_enc = Var::from_tensor(&rng.uniform((d_in, d_sae), -enc_bound, enc_bound, device)?)?;
        let w_dec = Var::from_tensor(&rng.uniform((d_sae, d_in), -dec_bound, dec_bound, device)?)?;
        let b_enc = Var::zeros(d_sae, DType::F32, device)?;
        let b_dec = Var::zeros(d_in, DType::F32, device)?;
        let sae = Self {
            cfg,
            w_enc,
            b_enc,
            w_dec,
            b_dec,
            device: device.clone(),
        };
        sae.set_decoder_norm_to_unit_norm()?;
        Ok(sae)
    }

    pub fn cfg(&self) -> &SaeConfig {
        &self.cfg
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn d_in(&self) -> usize {
        self.cfg.d_in
    }

    pub fn d_sae(&self) -> usize {
        self.cfg.d_sae
    }

    pub fn l1_coefficient(&self) -> f64 {
        self.cfg.l1_coefficient
    }

    pub fn w_enc(&self) -> &Tensor {
        self.w_enc.as_tensor()
    }

    pub fn b_enc(&self) -> &Tensor {
        self.b_enc.as_tensor()
    }

    pub fn w_dec(&self) -> &Tensor {
        self.w_dec.as_tensor()
    }

    pub fn b_dec(&self) -> &Tensor {
        self.b_dec.as_tensor()
    }

    /// Trainable parameters in [`PARAM_NAMES`] order.
    pub fn vars(&self) -> Vec<Var> {
        vec![
            self.w_enc.clone(),
            self.b_enc.clone(),
            self.w_dec.clone(),
            self.b_dec.clone(),
        ]
    }

    /// Parameters keyed `{prefix}{name}`.
    pub fn named_tensors(&self, prefix: &str) -> HashMap<String, Tensor> {
        PARAM_NAMES
            .iter()
            .zip(self.vars())
            .map(|(name, var)| (format!("{prefix}{name}"), var.as_tensor().clone()))
            .collect()
    }

    /// Overwrite parameters from tensors keyed `{prefix}{name}`.
    pub fn load_tensors(&self, tensors: &HashMap<String, Tensor>, prefix: &str) -> Result<()> {
        for (name, var) in PARAM_NAMES.iter().zip(self.vars()) {
            let key = format!("{prefix}{name}");
            let t = tensors
                .get(&key)
                .ok_or_else(|| candle_core::Error::Msg(format!("missing tensor `{key}`")))?;
            if t.dims() != var.dims() {
                candle_core::bail!(
                    "tensor `{key}` has shape {:?}, expected {:?}",
                    t.dims(),
                    var.dims()
                );
            }
            var.set(&t.to_dtype(DType::F32)?.to_device(&self.device)?)?;
        }
        Ok(())
    }

    /// Forward pass with losses. `dead_mask` is a `[d_sae]` U8 mask of units
    /// that get ghost gradients; ignored unless `use_ghost_grads` is set.
    pub fn forward(&self, x: &Tensor, dead_mask: Option<&Tensor>) -> Result<ForwardOutput> {
        let x = x.to_dtype(DType::F32)?;
        let sae_in = x.broadcast_sub(self.b_dec())?;
        let hidden_pre = sae_in.matmul(self.w_enc())?.broadcast_add(self.b_enc())?;
        let feature_acts = hidden_pre.relu()?;
        let sae_out = feature_acts
            .matmul(self.w_dec())?
            .broadcast_add(self.b_dec())?;

        // Per-element squared error, normalised by the norm of the centred input.
        let x_centred = x.broadcast_sub(&x.mean_keepdim(0)?)?;
        let mse_loss_elems = sae_out
            .sub(&x)?
            .sqr()?
            .broadcast_div(&row_norm(&x_centred)?)?;

        let dead = match dead_mask {
            Some(mask) if self.cfg.use_ghost_grads => dead_indices(mask)?,
            _ => None,
        };
        let ghost_grad_loss = match dead {
            Some(idx) => self.ghost_grad_loss(&x, &sae_out, &hidden_pre, &idx, &mse_loss_elems)?,
            None => Tensor::new(0f32, &self.device)?,
        };

        let mse_loss = mse_loss_elems.mean_all()?;
        let sparsity = lp_norm_rows(&feature_acts, self.cfg.lp_norm)?.mean_all()?;
        let l1_loss = sparsity.affine(self.cfg.l1_coefficient, 0.0)?;
        let loss = mse_loss.add(&l1_loss)?.add(&ghost_grad_loss)?;

        Ok(ForwardOutput {
            sae_out,
            feature_acts,
            loss,
            mse_loss,
            l1_loss,
            ghost_grad_loss,
        })
    }

    /// Dead units, exp-activated, reconstruct the residual; the result is
    /// rescaled to half the residual norm and the loss to the main MSE.
    fn ghost_grad_loss(
        &self,
        x: &Tensor,
        sae_out: &Tensor,
        hidden_pre: &Tensor,
        dead_idx: &Tensor,
        mse_loss_elems: &Tensor,
    ) -> Result<Tensor> {
        let residual = x.sub(sae_out)?;
        let l2_norm_residual = row_norm(&residual)?;
        let dead_acts = hidden_pre.index_select(dead_idx, 1)?.exp()?;
        let ghost_out = dead_acts.matmul(&self.w_dec().index_select(dead_idx, 0)?)?;
        let l2_norm_ghost_out = row_norm(&ghost_out)?;
        let norm_scaling = l2_norm_residual
            .div(&l2_norm_ghost_out.affine(2.0, GHOST_EPS)?)?
            .detach();
        let ghost_out = ghost_out.broadcast_mul(&norm_scaling)?;

        let residual = residual.detach();
        let residual_centred = residual.broadcast_sub(&residual.mean_keepdim(0)?)?;
        let ghost_elems = ghost_out
            .sub(&residual)?
            .sqr()?
            .broadcast_div(&row_norm(&residual_centred)?)?;
        let rescale = mse_loss_elems
            .div(&ghost_elems.affine(1.0, GHOST_EPS)?)?
            .detach();
        rescale.mul(&ghost_elems)?.mean_all()
    }

    /// Scale every decoder row to unit L2 norm.
    pub fn set_decoder_norm_to_unit_norm(&self) -> Result<()> {
        let w = self.w_dec();
        let normed = w.broadcast_div(&row_norm(w)?)?;
        self.w_dec.set(&normed)
    }

    /// Drop the component of each decoder-row gradient that points along the
    /// row itself, so an optimiser step cannot change the row norm to first order.
    pub fn remove_gradient_parallel_to_decoder_directions(&self, grads: &mut GradStore) -> Result<()> {
        let w = self.w_dec.as_tensor();
        let Some(grad) = grads.remove(w) else {
            return Ok(());
        };
        let parallel = grad.mul(w)?.sum_keepdim(1)?;
        let projected = grad.sub(&parallel.broadcast_mul(w)?)?;
        grads.insert(w, projected);
        Ok(())
    }

    /// Set the decoder bias to a precomputed point (e.g. a geometric median).
    pub fn initialize_b_dec_with_precalculated(&self, origin: &Tensor) -> Result<()> {
        let origin = origin.to_dtype(DType::F32)?.to_device(&self.device)?;
        if origin.dims() != [self.cfg.d_in] {
            candle_core::bail!(
                "b_dec origin has shape {:?}, expected [{}]",
                origin.dims(),
                self.cfg.d_in
            );
        }
        self.b_dec.set(&origin)
    }

    /// Set the decoder bias to the mean of `acts` (`[n, d_in]`).
    pub fn initialize_b_dec_with_mean(&self, acts: &Tensor) -> Result<()> {
        let acts = acts.to_dtype(DType::F32)?.to_device(&self.device)?;
        let previous = mean_distance(&acts, self.b_dec())?;
        let mean = acts.mean(0)?;
        let current = mean_distance(&acts, &mean)?;
        tracing::info!(
            layer = self.cfg.hook_point_layer,
            previous,
            current,
            "initialised b_dec with mean"
        );
        self.b_dec.set(&mean)
    }
}

/// Mean L2 distance from every row of `acts` to `point`.
pub fn mean_distance(acts: &Tensor, point: &Tensor) -> Result<f32> {
    row_norm(&acts.broadcast_sub(point)?)?
        .mean_all()?
        .to_scalar::<f32>()
}

/// `[n, d] -> [n, 1]` L2 norms.
fn row_norm(t: &Tensor) -> Result<Tensor> {
    t.sqr()?.sum_keepdim(D::Minus1)?.sqrt()
}

/// `[n, d] -> [n]` Lp norms.
fn lp_norm_rows(t: &Tensor, p: f64) -> Result<Tensor> {
    if p == 1.0 {
        t.abs()?.sum(D::Minus1)
    } else if p == 2.0 {
        t.sqr()?.sum(D::Minus1)?.sqrt()
    } else {
        t.abs()?.powf(p)?.sum(D::Minus1)?.powf(1.0 / p)
    }
}

/// U32 indices of the set entries of a U8 mask, or `None` when none are set.
fn dead_indices(mask: &Tensor) -> Result<Option<Tensor>> {
    let idx: Vec<u32> = mask
        .to_dtype(DType::U8)?
        .to_vec1::<u8>()?
        .iter()
        .enumerate()
        .filter(|(_, &m)| m != 0)
        .map(|(i, _)| i as u32)
        .collect();
    if idx.is_empty() {
        return Ok(None);
    }
    let n = idx.len();
    Tensor::from_vec(idx, n, mask.device()).map(Some)
}
