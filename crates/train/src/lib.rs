//! # sae-train — resumable group training
//!
//! Everything that turns a [`SaeGroup`](sae_core::SaeGroup) and an activation
//! source into trained weights:
//!
//! * **[`train_sae_group`]**: the group loop: one batch, every autoencoder
//!   steps on it, metrics, evaluation, periodic and terminal checkpoints.
//! * **[`train_step`]**: one optimisation step of one autoencoder (sparsity
//!   window, dead mask, ghost gradients, decoder projection, Adam, schedule).
//! * **[`CheckpointManager`]**: atomic checkpoint bundles, discovery and
//!   retention.
//! * **[`run`]**: resume discovery with a fresh fallback, then training.
//!
//! Interrupted runs save a checkpoint before returning
//! [`TrainError::Interrupted`]; resuming from it continues with the same
//! batches, RNG draws and optimiser state.

pub mod cancel;
pub mod checkpoint;
pub mod context;
pub mod error;
pub mod eval;
pub mod metrics;
pub mod optim;
pub mod runner;
pub mod scheduler;
pub mod step;
pub mod trainer;

pub use cancel::CancellationToken;
pub use checkpoint::{
    CheckpointEntry, CheckpointFiles, CheckpointLabel, CheckpointManager, RetentionPolicy,
    SavedCheckpoint,
};
pub use context::{TrainContext, TrainContextSnapshot, TrainingRunState};
pub use error::{Result, TrainError};
pub use eval::{Evaluator, NoopEvaluator, ReconstructionEvaluator};
pub use metrics::{JsonlSink, MetricValue, Metrics, MetricsSink, NullSink, TracingSink};
pub use optim::{Adam, AdamState, ParamsAdam};
pub use runner::run;
pub use scheduler::{LrScheduler, SchedulerState};
pub use step::{train_step, StepParams, TrainStepOutput};
pub use trainer::{train_sae_group, TrainGroupOutput, TrainHooks, TrainStart};
