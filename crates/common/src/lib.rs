//! # sae-common — Shared Primitives
//!
//! Types shared by every crate in the workspace:
//!
//! * **[`RunnerConfig`]**: run hyper-parameters (serialised as JSON), expanded
//!   into one [`SaeConfig`] per autoencoder of the group.
//! * **[`RandomState`]**: every generator a run draws from, snapshotted and
//!   restored as one unit.
//! * **[`ActivationSource`]** / **[`ActivationStore`]**: the shuffling
//!   activation buffer the training loop pulls batches from.
//! * **[`SyntheticActivations`]** / **[`CachedActivations`]**: producers
//!   standing in for the source network.

pub mod activations;
pub mod config;
pub mod rng;

pub use activations::{
    ActivationProducer, ActivationSource, ActivationStore, ActivationStoreConfig,
    CachedActivations, SyntheticActivations,
};
pub use config::{BiasInit, ConfigError, LrSchedulerKind, OneOrMany, RunnerConfig, SaeConfig};
pub use rng::{GeneratorSnapshot, RandomState, RandomStateSnapshot};
