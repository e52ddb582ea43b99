//! Runner configuration for SAE training.
//!
//! Serialised as JSON. Every field has a default, so a minimal `{}` JSON loads
//! a working configuration. Hyper-parameters that accept either a value or a
//! list ([`OneOrMany`]) expand into a grid: one autoencoder per combination,
//! all trained together as one group on the same activation stream.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use candle_core::Device;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Errors ──────────────────────────────────────────────────────────────────

/// Configuration problems. Raised at construction, never defaulted away.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error(
        "unknown lr scheduler `{0}` (expected constant, cosineannealing or cosineannealingwarmrestarts)"
    )]
    UnknownScheduler(String),
    #[error("unknown b_dec init method `{0}` (expected geometric_median, mean or zeros)")]
    UnknownBiasInit(String),
    #[error("dead_feature_window ({dead}) must not exceed feature_sampling_window ({sampling})")]
    WindowOrder { dead: usize, sampling: usize },
    #[error("{field} must be positive")]
    NotPositive { field: &'static str },
    #[error("{field} must not be an empty list")]
    EmptyList { field: &'static str },
    #[error(
        "lr_warm_up_steps ({warm_up}) + lr_decay_steps ({decay}) exceed the training budget of {total} steps"
    )]
    ScheduleTooLong {
        warm_up: usize,
        decay: usize,
        total: usize,
    },
    #[error("unknown device `{0}` (expected cpu or cuda)")]
    UnknownDevice(String),
    #[error("run_id is not set; call RunnerConfig::resolve_run_id first")]
    MissingRunId,
}

// ── Enumerations ────────────────────────────────────────────────────────────

/// How the decoder bias is initialised before a fresh run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiasInit {
    GeometricMedian,
    Mean,
    Zeros,
}

impl FromStr for BiasInit {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "geometric_median" => Ok(Self::GeometricMedian),
            "mean" => Ok(Self::Mean),
            "zeros" => Ok(Self::Zeros),
            other => Err(ConfigError::UnknownBiasInit(other.to_string())),
        }
    }
}

/// Learning-rate schedule family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LrSchedulerKind {
    #[serde(rename = "constant")]
    Constant,
    #[serde(rename = "cosineannealing", alias = "cosine_anneal")]
    CosineAnneal,
    #[serde(
        rename = "cosineannealingwarmrestarts",
        alias = "cosine_anneal_with_restarts"
    )]
    CosineAnnealWithRestarts,
}

impl FromStr for LrSchedulerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "constant" => Ok(Self::Constant),
            "cosineannealing" | "cosine_anneal" => Ok(Self::CosineAnneal),
            "cosineannealingwarmrestarts" | "cosine_anneal_with_restarts" => {
                Ok(Self::CosineAnnealWithRestarts)
            }
            _ => Err(ConfigError::UnknownScheduler(s.to_string())),
        }
    }
}

/// A single value or a list of values to sweep over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T: Clone> OneOrMany<T> {
    pub fn values(&self) -> Vec<T> {
        match self {
            Self::One(v) => vec![v.clone()],
            Self::Many(vs) => vs.clone(),
        }
    }

    pub fn is_many(&self) -> bool {
        matches!(self, Self::Many(_))
    }

    fn is_empty(&self) -> bool {
        matches!(self, Self::Many(vs) if vs.is_empty())
    }
}

impl<T> From<T> for OneOrMany<T> {
    fn from(value: T) -> Self {
        Self::One(value)
    }
}

// ── Per-autoencoder hyper-parameters ────────────────────────────────────────

/// Hyper-parameters of one autoencoder in the group (one grid point).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaeConfig {
    pub hook_point_layer: usize,
    pub d_in: usize,
    pub d_sae: usize,
    pub expansion_factor: usize,
    pub l1_coefficient: f64,
    pub lp_norm: f64,
    pub lr: f64,
    pub lr_end: f64,
    pub lr_scheduler_name: LrSchedulerKind,
    pub lr_warm_up_steps: usize,
    pub lr_decay_steps: usize,
    pub n_restart_cycles: usize,
    pub use_ghost_grads: bool,
    pub dead_feature_window: usize,
    pub b_dec_init_method: BiasInit,
}

// ── Runner config ───────────────────────────────────────────────────────────

/// Configuration for training a group of sparse autoencoders.
///
/// Backwards-compatible: missing fields fall back to [`Default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    // ── Activation source ───────────────────────────────────────────────────
    /// Source network name (used in the group name only).
    pub model_name: String,
    /// Hook point template; `{layer}` is substituted with the layer string.
    pub hook_point: String,
    /// Layer(s) the autoencoders read from.
    pub hook_point_layer: OneOrMany<usize>,
    /// Width of the activations at the hook point.
    pub d_in: usize,
    /// Directory of pre-computed activations (`0.safetensors`, `1.safetensors`, ...).
    pub cached_activations_path: Option<PathBuf>,

    // ── Autoencoder ─────────────────────────────────────────────────────────
    pub expansion_factor: OneOrMany<usize>,
    pub b_dec_init_method: BiasInit,

    // ── Optimisation ────────────────────────────────────────────────────────
    pub l1_coefficient: OneOrMany<f64>,
    pub lp_norm: f64,
    pub lr: OneOrMany<f64>,
    /// Final learning rate for annealing schedules; `lr / 10` when unset.
    pub lr_end: Option<f64>,
    pub lr_scheduler_name: LrSchedulerKind,
    pub lr_warm_up_steps: usize,
    pub lr_decay_steps: usize,
    /// Only used by `cosineannealingwarmrestarts`.
    pub n_restart_cycles: usize,
    pub train_batch_size: usize,
    pub total_training_tokens: u64,
    /// Buffer size, in training batches.
    pub n_batches_in_buffer: usize,

    // ── Dead features ───────────────────────────────────────────────────────
    pub use_ghost_grads: bool,
    /// Steps between resets of the activation-frequency accumulator.
    pub feature_sampling_window: usize,
    /// Steps without firing after which a unit counts as dead.
    pub dead_feature_window: usize,

    // ── Logging ─────────────────────────────────────────────────────────────
    pub log_frequency: usize,

    // ── Checkpointing ───────────────────────────────────────────────────────
    /// Checkpoint every N steps; 0 = only at run start and run end.
    pub checkpoint_every: usize,
    pub checkpoint_path: PathBuf,
    pub max_checkpoints: Option<usize>,
    /// Keep `final_*` checkpoints out of retention pruning.
    pub protect_final_checkpoint: bool,
    /// Partitions checkpoint storage per run; generated when unset.
    pub run_id: Option<String>,

    // ── Misc ────────────────────────────────────────────────────────────────
    pub seed: u64,
    pub device: String,
    pub resume: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            model_name: "gelu-2l".to_string(),
            hook_point: "blocks.{layer}.hook_mlp_out".to_string(),
            hook_point_layer: OneOrMany::One(0),
            d_in: 512,
            cached_activations_path: None,
            expansion_factor: OneOrMany::One(4),
            b_dec_init_method: BiasInit::GeometricMedian,
            l1_coefficient: OneOrMany::One(1e-3),
            lp_norm: 1.0,
            lr: OneOrMany::One(3e-4),
            lr_end: None,
            lr_scheduler_name: LrSchedulerKind::Constant,
            lr_warm_up_steps: 500,
            lr_decay_steps: 0,
            n_restart_cycles: 1,
            train_batch_size: 4096,
            total_training_tokens: 2_000_000,
            n_batches_in_buffer: 20,
            use_ghost_grads: false,
            feature_sampling_window: 2000,
            dead_feature_window: 1000,
            log_frequency: 10,
            checkpoint_every: 0,
            checkpoint_path: PathBuf::from("checkpoints"),
            max_checkpoints: None,
            protect_final_checkpoint: false,
            run_id: None,
            seed: 42,
            device: "cpu".to_string(),
            resume: false,
        }
    }
}

const RUN_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const RUN_ID_LEN: usize = 8;

impl RunnerConfig {
    /// Save config to a JSON file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file and validate it.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent configurations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hook_point_layer.is_empty() {
            return Err(ConfigError::EmptyList {
                field: "hook_point_layer",
            });
        }
        if self.expansion_factor.is_empty() {
            return Err(ConfigError::EmptyList {
                field: "expansion_factor",
            });
        }
        if self.l1_coefficient.is_empty() {
            return Err(ConfigError::EmptyList {
                field: "l1_coefficient",
            });
        }
        if self.lr.is_empty() {
            return Err(ConfigError::EmptyList { field: "lr" });
        }
        let positive = [
            ("d_in", self.d_in),
            ("train_batch_size", self.train_batch_size),
            ("n_batches_in_buffer", self.n_batches_in_buffer),
            ("feature_sampling_window", self.feature_sampling_window),
            ("n_restart_cycles", self.n_restart_cycles),
            ("log_frequency", self.log_frequency),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::NotPositive { field });
            }
        }
        if self.expansion_factor.values().contains(&0) {
            return Err(ConfigError::NotPositive {
                field: "expansion_factor",
            });
        }
        if self.max_checkpoints == Some(0) {
            return Err(ConfigError::NotPositive {
                field: "max_checkpoints",
            });
        }
        if self.dead_feature_window > self.feature_sampling_window {
            return Err(ConfigError::WindowOrder {
                dead: self.dead_feature_window,
                sampling: self.feature_sampling_window,
            });
        }
        let total = self.total_training_steps() as usize;
        if self.lr_decay_steps > 0 && self.lr_warm_up_steps + self.lr_decay_steps > total {
            return Err(ConfigError::ScheduleTooLong {
                warm_up: self.lr_warm_up_steps,
                decay: self.lr_decay_steps,
                total,
            });
        }
        if !matches!(self.device.as_str(), "cpu" | "cuda") {
            return Err(ConfigError::UnknownDevice(self.device.clone()));
        }
        Ok(())
    }

    /// Number of optimiser steps the token budget allows.
    pub fn total_training_steps(&self) -> u64 {
        if self.train_batch_size == 0 {
            return 0;
        }
        self.total_training_tokens / self.train_batch_size as u64
    }

    /// Rows held by the activation buffer.
    pub fn buffer_rows(&self) -> usize {
        self.train_batch_size * self.n_batches_in_buffer
    }

    /// Distinct layers in configuration order. Batches carry one slice per entry.
    pub fn layers(&self) -> Vec<usize> {
        let mut layers = Vec::new();
        for layer in self.hook_point_layer.values() {
            if !layers.contains(&layer) {
                layers.push(layer);
            }
        }
        layers
    }

    /// Position of `layer` inside the batch's layer axis.
    pub fn layer_index(&self, layer: usize) -> Option<usize> {
        self.layers().iter().position(|&l| l == layer)
    }

    /// Expand list-valued fields into one [`SaeConfig`] per combination
    /// (layer-major, then expansion factor, L1 coefficient, learning rate).
    pub fn sae_configs(&self) -> Vec<SaeConfig> {
        let mut out = Vec::new();
        for layer in self.layers() {
            for expansion_factor in self.expansion_factor.values() {
                for l1_coefficient in self.l1_coefficient.values() {
                    for lr in self.lr.values() {
                        out.push(SaeConfig {
                            hook_point_layer: layer,
                            d_in: self.d_in,
                            d_sae: self.d_in * expansion_factor,
                            expansion_factor,
                            l1_coefficient,
                            lp_norm: self.lp_norm,
                            lr,
                            lr_end: self.lr_end.unwrap_or(lr / 10.0),
                            lr_scheduler_name: self.lr_scheduler_name,
                            lr_warm_up_steps: self.lr_warm_up_steps,
                            lr_decay_steps: self.lr_decay_steps,
                            n_restart_cycles: self.n_restart_cycles,
                            use_ghost_grads: self.use_ghost_grads,
                            dead_feature_window: self.dead_feature_window,
                            b_dec_init_method: self.b_dec_init_method,
                        });
                    }
                }
            }
        }
        out
    }

    /// Metric-name suffix distinguishing one autoencoder from the rest of its
    /// group: one `_{key}{value}` piece per list-valued field.
    pub fn metric_suffix(&self, sae: &SaeConfig) -> String {
        let mut suffix = String::new();
        if self.hook_point_layer.is_many() {
            suffix.push_str(&format!("_layer{}", sae.hook_point_layer));
        }
        if self.expansion_factor.is_many() {
            suffix.push_str(&format!("_expansion_factor{}", sae.expansion_factor));
        }
        if self.l1_coefficient.is_many() {
            suffix.push_str(&format!("_coeff{}", sae.l1_coefficient));
        }
        if self.lr.is_many() {
            suffix.push_str(&format!("_lr{}", sae.lr));
        }
        suffix
    }

    /// Group identity used in checkpoint filenames.
    pub fn group_name(&self) -> String {
        let layers = self.layers();
        let layer_string = span_string(&layers);
        let d_sae: Vec<usize> = self
            .expansion_factor
            .values()
            .iter()
            .map(|e| e * self.d_in)
            .collect();
        format!(
            "sae_group_{}_{}_{}",
            self.model_name.replace('/', "_"),
            self.hook_point.replace("{layer}", &layer_string),
            span_string(&d_sae),
        )
    }

    /// Generate a run id if none is configured, and return it.
    pub fn resolve_run_id(&mut self) -> &str {
        self.run_id
            .get_or_insert_with(|| {
                let mut rng = rand::thread_rng();
                (0..RUN_ID_LEN)
                    .map(|_| RUN_ID_ALPHABET[rng.gen_range(0..RUN_ID_ALPHABET.len())] as char)
                    .collect()
            })
            .as_str()
    }

    /// `{checkpoint_path}/{run_id}`.
    pub fn run_dir(&self) -> Result<PathBuf, ConfigError> {
        let run_id = self.run_id.as_deref().ok_or(ConfigError::MissingRunId)?;
        Ok(self.checkpoint_path.join(run_id))
    }

    /// Compute device for this run.
    pub fn device(&self) -> candle_core::Result<Device> {
        match self.device.as_str() {
            "cuda" => Device::cuda_if_available(0),
            _ => Ok(Device::Cpu),
        }
    }
}

/// `"3"` for a single value, `"1-5"` for a range of values.
fn span_string(values: &[usize]) -> String {
    match (values.iter().min(), values.iter().max()) {
        (Some(min), Some(max)) if min != max => format!("{min}-{max}"),
        (Some(v), _) => v.to_string(),
        _ => String::new(),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_uses_defaults() {
        let loaded: RunnerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(loaded, RunnerConfig::default());
        assert!(loaded.validate().is_ok());
    }

    #[test]
    fn scalar_or_list_fields_parse() {
        let json = r#"{
            "hook_point_layer": [0, 1],
            "l1_coefficient": 0.001,
            "lr": [1e-4, 3e-4],
            "lr_scheduler_name": "cosineannealing"
        }"#;
        let cfg: RunnerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.layers(), vec![0, 1]);
        assert_eq!(cfg.lr_scheduler_name, LrSchedulerKind::CosineAnneal);
        assert_eq!(cfg.sae_configs().len(), 4);
    }

    #[test]
    fn unknown_scheduler_is_rejected() {
        let json = r#"{ "lr_scheduler_name": "linear" }"#;
        assert!(serde_json::from_str::<RunnerConfig>(json).is_err());
        assert_eq!(
            "linear".parse::<LrSchedulerKind>(),
            Err(ConfigError::UnknownScheduler("linear".to_string()))
        );
    }

    #[test]
    fn unknown_bias_init_is_rejected() {
        let json = r#"{ "b_dec_init_method": "median" }"#;
        assert!(serde_json::from_str::<RunnerConfig>(json).is_err());
        assert!("median".parse::<BiasInit>().is_err());
        assert_eq!("mean".parse::<BiasInit>(), Ok(BiasInit::Mean));
    }

    #[test]
    fn dead_window_must_not_exceed_sampling_window() {
        let cfg = RunnerConfig {
            feature_sampling_window: 100,
            dead_feature_window: 200,
            ..Default::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::WindowOrder {
                dead: 200,
                sampling: 100
            })
        );
    }

    #[test]
    fn decay_longer_than_budget_is_rejected() {
        let cfg = RunnerConfig {
            total_training_tokens: 1000,
            train_batch_size: 100,
            lr_warm_up_steps: 5,
            lr_decay_steps: 6,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ScheduleTooLong { total: 10, .. })
        ));
    }

    #[test]
    fn grid_expansion_order_and_lr_end_default() {
        let cfg = RunnerConfig {
            hook_point_layer: OneOrMany::Many(vec![2, 3]),
            expansion_factor: OneOrMany::Many(vec![2, 4]),
            lr: OneOrMany::One(1e-3),
            ..Default::default()
        };
        let saes = cfg.sae_configs();
        assert_eq!(saes.len(), 4);
        assert_eq!(
            saes.iter()
                .map(|s| (s.hook_point_layer, s.d_sae))
                .collect::<Vec<_>>(),
            vec![(2, 1024), (2, 2048), (3, 1024), (3, 2048)]
        );
        assert!((saes[0].lr_end - 1e-4).abs() < 1e-12);
        assert_eq!(cfg.metric_suffix(&saes[1]), "_layer2_expansion_factor4");
    }

    #[test]
    fn group_name_and_run_dir() {
        let mut cfg = RunnerConfig {
            model_name: "org/model".to_string(),
            d_in: 64,
            run_id: Some("abc12345".to_string()),
            ..Default::default()
        };
        assert_eq!(cfg.group_name(), "sae_group_org_model_blocks.0.hook_mlp_out_256");
        cfg.hook_point_layer = OneOrMany::Many(vec![1, 3]);
        assert_eq!(cfg.group_name(), "sae_group_org_model_blocks.1-3.hook_mlp_out_256");
        assert_eq!(cfg.run_dir().unwrap(), PathBuf::from("checkpoints/abc12345"));
    }

    #[test]
    fn run_id_is_generated_once() {
        let mut cfg = RunnerConfig::default();
        assert_eq!(cfg.run_dir(), Err(ConfigError::MissingRunId));
        let id = cfg.resolve_run_id().to_string();
        assert_eq!(id.len(), RUN_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_eq!(cfg.resolve_run_id(), id);
    }

    #[test]
    fn config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let cfg = RunnerConfig {
            lr: OneOrMany::Many(vec![1e-4, 2e-4]),
            max_checkpoints: Some(3),
            ..Default::default()
        };
        cfg.save(&path).unwrap();
        assert_eq!(RunnerConfig::load(&path).unwrap(), cfg);
    }
}
