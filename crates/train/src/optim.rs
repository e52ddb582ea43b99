//! Adam with inspectable state.
//!
//! `candle_nn::AdamW` keeps its moment estimates private, so a resumed run
//! could not restore them. This is plain Adam (no weight decay) behind the
//! same [`Optimizer`] trait, with [`Adam::snapshot`] / [`Adam::hydrate`].

use candle_core::{backprop::GradStore, Result, Tensor, Var};
use candle_nn::Optimizer;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamsAdam {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl Default for ParamsAdam {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

struct VarAdam {
    var: Var,
    first_moment: Var,
    second_moment: Var,
}

/// Snapshot of an [`Adam`]'s internal state, moments in var order.
#[derive(Debug, Clone)]
pub struct AdamState {
    pub step_t: usize,
    pub lr: f64,
    pub first_moment: Vec<Tensor>,
    pub second_moment: Vec<Tensor>,
}

pub struct Adam {
    vars: Vec<VarAdam>,
    step_t: usize,
    params: ParamsAdam,
}

impl Optimizer for Adam {
    type Config = ParamsAdam;

    fn new(vars: Vec<Var>, params: ParamsAdam) -> Result<Self> {
        let vars = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .map(|var| {
                let first_moment = Var::zeros(var.shape(), var.dtype(), var.device())?;
                let second_moment = Var::zeros(var.shape(), var.dtype(), var.device())?;
                Ok(VarAdam {
                    var,
                    first_moment,
                    second_moment,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            vars,
            step_t: 0,
            params,
        })
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step_t += 1;
        let ParamsAdam {
            lr,
            beta1,
            beta2,
            eps,
        } = self.params;
        let scale_m = 1.0 / (1.0 - beta1.powi(self.step_t as i32));
        let scale_v = 1.0 / (1.0 - beta2.powi(self.step_t as i32));
        for v in &self.vars {
            let Some(g) = grads.get(v.var.as_tensor()) else {
                continue;
            };
            let m = v
                .first_moment
                .affine(beta1, 0.0)?
                .add(&g.affine(1.0 - beta1, 0.0)?)?;
            let s = v
                .second_moment
                .affine(beta2, 0.0)?
                .add(&g.sqr()?.affine(1.0 - beta2, 0.0)?)?;
            let m_hat = m.affine(scale_m, 0.0)?;
            let v_hat = s.affine(scale_v, 0.0)?;
            let update = m_hat.div(&v_hat.sqrt()?.affine(1.0, eps)?)?.affine(lr, 0.0)?;
            v.var.set(&v.var.sub(&update)?)?;
            v.first_moment.set(&m)?;
            v.second_moment.set(&s)?;
        }
        Ok(())
    }
}

impl Adam {
    pub fn params(&self) -> &ParamsAdam {
        &self.params
    }

    pub fn step_t(&self) -> usize {
        self.step_t
    }

    /// Deep copy of the current state; later steps do not alter it.
    pub fn snapshot(&self) -> Result<AdamState> {
        let mut first_moment = Vec::with_capacity(self.vars.len());
        let mut second_moment = Vec::with_capacity(self.vars.len());
        for v in &self.vars {
            first_moment.push(v.first_moment.as_tensor().copy()?);
            second_moment.push(v.second_moment.as_tensor().copy()?);
        }
        Ok(AdamState {
            step_t: self.step_t,
            lr: self.params.lr,
            first_moment,
            second_moment,
        })
    }

    /// Copy a snapshot into this optimizer. Vars must match in count and shape.
    pub fn hydrate(&mut self, state: &AdamState) -> Result<()> {
        if state.first_moment.len() != self.vars.len()
            || state.second_moment.len() != self.vars.len()
        {
            candle_core::bail!(
                "optimizer state holds {} moments, optimizer has {} vars",
                state.first_moment.len(),
                self.vars.len()
            );
        }
        for ((v, m), s) in self
            .vars
            .iter()
            .zip(&state.first_moment)
            .zip(&state.second_moment)
        {
            if m.dims() != v.var.dims() || s.dims() != v.var.dims() {
                candle_core::bail!(
                    "optimizer moment shape {:?} does not match var shape {:?}",
                    m.dims(),
                    v.var.dims()
                );
            }
            v.first_moment.set(&m.to_device(v.var.device())?)?;
            v.second_moment.set(&s.to_device(v.var.device())?)?;
        }
        self.step_t = state.step_t;
        self.params.lr = state.lr;
        Ok(())
    }
}
