//! Training metrics: flat `name → value` maps and the sinks they go to.
//!
//! Sinks are fire-and-forget: a failing sink logs a warning and training
//! carries on.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use candle_core::{DType, Result, Tensor, D};
use serde::Serialize;

use crate::context::TrainContext;
use crate::step::TrainStepOutput;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Scalar(f64),
    Histogram(Vec<f32>),
}

impl MetricValue {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(v) => Some(*v),
            Self::Histogram(_) => None,
        }
    }
}

pub type Metrics = BTreeMap<String, MetricValue>;

// ── Sinks ───────────────────────────────────────────────────────────────────

pub trait MetricsSink {
    fn emit(&mut self, step: u64, metrics: &Metrics);
}

/// Discards everything.
pub struct NullSink;

impl MetricsSink for NullSink {
    fn emit(&mut self, _step: u64, _metrics: &Metrics) {}
}

/// Scalars as one `info!` event per emission.
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn emit(&mut self, step: u64, metrics: &Metrics) {
        let summary = metrics
            .iter()
            .map(|(k, v)| match v {
                MetricValue::Scalar(x) => format!("{k}={x:.4e}"),
                MetricValue::Histogram(h) => format!("{k}=<{} values>", h.len()),
            })
            .collect::<Vec<_>>()
            .join(" ");
        tracing::info!(step, "{summary}");
    }
}

/// One JSON object per line: `{"step": N, "metrics": {...}}`.
pub struct JsonlSink {
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    fn write(&mut self, step: u64, metrics: &Metrics) -> std::io::Result<()> {
        let rec = serde_json::json!({ "step": step, "metrics": metrics });
        writeln!(self.writer, "{rec}")?;
        self.writer.flush()
    }
}

impl MetricsSink for JsonlSink {
    fn emit(&mut self, step: u64, metrics: &Metrics) {
        if let Err(e) = self.write(step, metrics) {
            tracing::warn!(step, error = %e, "failed to write metrics");
        }
    }
}

/// Fan out to several sinks.
impl MetricsSink for Vec<Box<dyn MetricsSink>> {
    fn emit(&mut self, step: u64, metrics: &Metrics) {
        for sink in self.iter_mut() {
            sink.emit(step, metrics);
        }
    }
}

// ── Builders ────────────────────────────────────────────────────────────────

fn scalar(t: &Tensor) -> Result<f64> {
    Ok(t.to_dtype(DType::F32)?.to_scalar::<f32>()? as f64)
}

/// Per-token `1 - ||x - x̂||² / ||x - mean(x)||²`, shape `[batch]`.
pub fn explained_variance(sae_in: &Tensor, sae_out: &Tensor) -> Result<Tensor> {
    let per_token_l2_loss = sae_out.sub(sae_in)?.sqr()?.sum(D::Minus1)?;
    let total_variance = sae_in
        .broadcast_sub(&sae_in.mean_keepdim(0)?)?
        .sqr()?
        .sum(D::Minus1)?;
    per_token_l2_loss.div(&total_variance)?.affine(-1.0, 1.0)
}

/// Mean number of active units per token.
pub fn l0(feature_acts: &Tensor) -> Result<f64> {
    scalar(
        &feature_acts
            .gt(0f64)?
            .to_dtype(DType::F32)?
            .sum(D::Minus1)?
            .mean_all()?,
    )
}

/// Mean and unbiased standard deviation of a 1-D tensor.
pub fn mean_std(t: &Tensor) -> Result<(f64, f64)> {
    let v = t.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    let n = v.len();
    if n == 0 {
        return Ok((f64::NAN, f64::NAN));
    }
    let mean = v.iter().map(|&x| x as f64).sum::<f64>() / n as f64;
    if n == 1 {
        return Ok((mean, f64::NAN));
    }
    let var = v.iter().map(|&x| (x as f64 - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    Ok((mean, var.sqrt()))
}

/// Metrics logged every `log_frequency` steps for one autoencoder.
pub fn train_step_metrics(
    output: &TrainStepOutput,
    ctx: &TrainContext,
    l1_coefficient: f64,
    suffix: &str,
    n_training_tokens: u64,
) -> Result<Metrics> {
    let (ev_mean, ev_std) = mean_std(&explained_variance(&output.sae_in, &output.sae_out)?)?;
    let dead = output.dead_mask.to_dtype(DType::F32)?.sum_all()?;
    let mut m = Metrics::new();
    let mut put = |key: &str, value: f64| {
        m.insert(format!("{key}{suffix}"), MetricValue::Scalar(value));
    };
    put("losses/mse_loss", output.mse_loss as f64);
    put("losses/l1_loss", output.l1_loss as f64 / l1_coefficient);
    put("losses/ghost_grad_loss", output.ghost_grad_loss as f64);
    put("losses/overall_loss", output.loss as f64);
    put("metrics/explained_variance", ev_mean);
    put("metrics/explained_variance_std", ev_std);
    put("metrics/l0", l0(&output.feature_acts)?);
    put("sparsity/mean_passes_since_fired", scalar(&ctx.steps_since_fired.mean_all()?)?);
    put("sparsity/dead_features", scalar(&dead)?);
    put("details/current_learning_rate", output.learning_rate);
    m.insert(
        "details/n_training_tokens".to_string(),
        MetricValue::Scalar(n_training_tokens as f64),
    );
    Ok(m)
}

/// Metrics logged at each sparsity-window boundary.
pub fn sparsity_window_metrics(
    feature_sparsity: &Tensor,
    log_feature_sparsity: &Tensor,
    suffix: &str,
) -> Result<Metrics> {
    let below = |threshold: f64| -> Result<f64> {
        scalar(&feature_sparsity.lt(threshold)?.to_dtype(DType::F32)?.sum_all()?)
    };
    let mut m = Metrics::new();
    m.insert(
        format!("metrics/mean_log10_feature_sparsity{suffix}"),
        MetricValue::Scalar(scalar(&log_feature_sparsity.mean_all()?)?),
    );
    m.insert(
        format!("plots/feature_density_line_chart{suffix}"),
        MetricValue::Histogram(log_feature_sparsity.to_dtype(DType::F32)?.to_vec1()?),
    );
    m.insert(
        format!("sparsity/below_1e-5{suffix}"),
        MetricValue::Scalar(below(1e-5)?),
    );
    m.insert(
        format!("sparsity/below_1e-6{suffix}"),
        MetricValue::Scalar(below(1e-6)?),
    );
    Ok(m)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn tracing_sink_logs_at_info() {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .with_writer(captured.clone())
            .finish();
        let mut m = Metrics::new();
        m.insert("train/l0".into(), MetricValue::Scalar(2.0));
        tracing::subscriber::with_default(subscriber, || TracingSink.emit(3, &m));

        let out = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(out.contains("INFO"), "{out}");
        assert!(out.contains("train/l0="), "{out}");
    }

    #[test]
    fn perfect_reconstruction_explains_everything() {
        let x = Tensor::new(&[[1f32, 2.], [3., 5.], [0., -1.]], &Device::Cpu).unwrap();
        let ev = explained_variance(&x, &x).unwrap().to_vec1::<f32>().unwrap();
        assert!(ev.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn l0_counts_active_units() {
        let acts = Tensor::new(&[[0f32, 1., 2.], [0., 0., 3.]], &Device::Cpu).unwrap();
        assert!((l0(&acts).unwrap() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn window_metrics_keys_and_thresholds() {
        let sparsity = Tensor::new(&[0f32, 1e-7, 1e-3, 0.5], &Device::Cpu).unwrap();
        let log = crate::context::log_feature_sparsity(&sparsity).unwrap();
        let m = sparsity_window_metrics(&sparsity, &log, "_lr0.001").unwrap();
        assert_eq!(m["sparsity/below_1e-5_lr0.001"], MetricValue::Scalar(2.0));
        assert_eq!(m["sparsity/below_1e-6_lr0.001"], MetricValue::Scalar(2.0));
        assert!(matches!(
            &m["plots/feature_density_line_chart_lr0.001"],
            MetricValue::Histogram(h) if h.len() == 4
        ));
    }

    #[test]
    fn jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");
        let mut sink = JsonlSink::create(&path).unwrap();
        let mut m = Metrics::new();
        m.insert("losses/mse_loss".into(), MetricValue::Scalar(0.5));
        sink.emit(1, &m);
        sink.emit(2, &m);
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["step"], 2);
        assert_eq!(lines[0]["metrics"]["losses/mse_loss"], 0.5);
    }
}
