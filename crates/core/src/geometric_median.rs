//! Geometric median by Weiszfeld iteration.
//!
//! Used to place the decoder bias at a robust centre of the activation cloud
//! before training.

use candle_core::{DType, Result, Tensor, D};

#[derive(Debug, Clone, Copy)]
pub struct GeometricMedianOptions {
    /// Lower bound on point-to-median distances, avoids division by zero.
    pub eps: f64,
    pub maxiter: usize,
    /// Stop when the objective changes by at most `ftol * objective`.
    pub ftol: f64,
}

impl Default for GeometricMedianOptions {
    fn default() -> Self {
        Self {
            eps: 1e-6,
            maxiter: 100,
            ftol: 1e-20,
        }
    }
}

pub struct GeometricMedian {
    /// `[d]`.
    pub median: Tensor,
    /// Final per-point weights, `[n]`.
    pub weights: Tensor,
    pub iterations: usize,
    pub converged: bool,
}

/// Geometric median of the rows of `points` (`[n, d]`), unit weights.
pub fn compute_geometric_median(
    points: &Tensor,
    opts: GeometricMedianOptions,
) -> Result<GeometricMedian> {
    let points = points.to_dtype(DType::F32)?.detach();
    let n = points.dim(0)?;
    if n == 0 {
        candle_core::bail!("geometric median of an empty point set");
    }
    let weights = Tensor::ones(n, DType::F32, points.device())?;

    let mut median = weighted_average(&points, &weights)?;
    let mut new_weights = weights.clone();
    let mut objective = objective_value(&points, &median, &weights)?;
    let mut iterations = 0;
    let mut converged = false;

    for _ in 0..opts.maxiter {
        iterations += 1;
        let prev = objective;
        let norms = distances(&points, &median)?;
        new_weights = weights.div(&norms.clamp(opts.eps, f64::INFINITY)?)?;
        median = weighted_average(&points, &new_weights)?;
        objective = objective_value(&points, &median, &weights)?;
        if (prev - objective).abs() <= opts.ftol * objective {
            converged = true;
            break;
        }
    }

    tracing::debug!(iterations, converged, objective, "geometric median");
    Ok(GeometricMedian {
        median,
        weights: new_weights,
        iterations,
        converged,
    })
}

/// `[n, d], [d] -> [n]`.
fn distances(points: &Tensor, median: &Tensor) -> Result<Tensor> {
    points
        .broadcast_sub(median)?
        .sqr()?
        .sum(D::Minus1)?
        .sqrt()
}

fn weighted_average(points: &Tensor, weights: &Tensor) -> Result<Tensor> {
    let total = weights.sum_all()?;
    points
        .broadcast_mul(&weights.unsqueeze(1)?)?
        .sum(0)?
        .broadcast_div(&total)
}

fn objective_value(points: &Tensor, median: &Tensor, weights: &Tensor) -> Result<f64> {
    Ok(distances(points, median)?
        .mul(weights)?
        .sum_all()?
        .to_scalar::<f32>()? as f64)
}
