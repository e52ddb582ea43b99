//! # sae-core — The Model
//!
//! Numerical pieces of sparse-autoencoder training:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`autoencoder`] | `SparseAutoencoder`: forward, losses, ghost gradients, decoder maintenance |
//! | [`group`] | `SaeGroup`: one autoencoder per hyper-parameter grid point, save/load |
//! | [`geometric_median`] | Weiszfeld geometric median for decoder-bias initialisation |
//!
//! Everything is plain `candle-core`; parameters are `Var`s so any
//! `candle_nn::Optimizer` can drive them.

pub mod autoencoder;
pub mod geometric_median;
pub mod group;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use autoencoder::{ForwardOutput, SparseAutoencoder, PARAM_NAMES};
pub use geometric_median::{compute_geometric_median, GeometricMedian, GeometricMedianOptions};
pub use group::SaeGroup;
