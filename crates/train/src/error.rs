use std::path::PathBuf;

use thiserror::Error;

use sae_common::ConfigError;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("activation source: {0:#}")]
    Activations(anyhow::Error),

    #[error("no checkpoint to resume from in {}", .0.display())]
    NoCheckpoint(PathBuf),

    #[error("checkpoint {path} does not match this run: {reason}")]
    IncompatibleCheckpoint { path: String, reason: String },

    #[error("non-finite loss {loss} for autoencoder {index} at step {step}")]
    NonFiniteLoss { index: usize, step: u64, loss: f32 },

    #[error("training interrupted at step {step}")]
    Interrupted { step: u64 },

    #[error("evaluation failed at step {step}: {error:#}")]
    Evaluation { step: u64, error: anyhow::Error },
}

pub type Result<T> = std::result::Result<T, TrainError>;
