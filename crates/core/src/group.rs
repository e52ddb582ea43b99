//! A group of autoencoders trained in lock-step on one activation stream.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Result, Tensor};

use sae_common::{RandomState, RunnerConfig};

use crate::autoencoder::SparseAutoencoder;

/// One [`SparseAutoencoder`] per grid point of the runner config, in
/// [`RunnerConfig::sae_configs`] order.
pub struct SaeGroup {
    cfg: RunnerConfig,
    autoencoders: Vec<SparseAutoencoder>,
}

impl SaeGroup {
    pub fn new(cfg: RunnerConfig, rng: &mut RandomState, device: &Device) -> Result<Self> {
        let autoencoders = cfg
            .sae_configs()
            .into_iter()
            .map(|sae_cfg| SparseAutoencoder::new(sae_cfg, rng, device))
            .collect::<Result<Vec<_>>>()?;
        tracing::info!(
            name = %cfg.group_name(),
            autoencoders = autoencoders.len(),
            "built sae group"
        );
        Ok(Self { cfg, autoencoders })
    }

    pub fn cfg(&self) -> &RunnerConfig {
        &self.cfg
    }

    pub fn name(&self) -> String {
        self.cfg.group_name()
    }

    pub fn len(&self) -> usize {
        self.autoencoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.autoencoders.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SparseAutoencoder> {
        self.autoencoders.iter()
    }

    pub fn get(&self, i: usize) -> Option<&SparseAutoencoder> {
        self.autoencoders.get(i)
    }

    /// Index of an autoencoder's layer inside the batch's layer axis.
    pub fn layer_index(&self, sae: &SparseAutoencoder) -> Result<usize> {
        let layer = sae.cfg().hook_point_layer;
        self.cfg.layer_index(layer).ok_or_else(|| {
            candle_core::Error::Msg(format!("layer {layer} is not among the group's layers"))
        })
    }

    /// Normalise decoders, then write all parameters as `{i}.{name}`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        for (i, sae) in self.autoencoders.iter().enumerate() {
            sae.set_decoder_norm_to_unit_norm()?;
            tensors.extend(sae.named_tensors(&format!("{i}.")));
        }
        candle_core::safetensors::save(&tensors, path)
    }

    /// Rebuild the group for `cfg` and load its parameters from `path`.
    pub fn load(path: &Path, cfg: RunnerConfig, device: &Device) -> Result<Self> {
        // Initial values are overwritten below.
        let mut scratch = RandomState::from_seed(0);
        let group = Self::new(cfg, &mut scratch, device)?;
        let tensors = candle_core::safetensors::load(path, device)?;
        let expected = group.len() * crate::autoencoder::PARAM_NAMES.len();
        if tensors.len() != expected {
            candle_core::bail!(
                "{} holds {} tensors, the config describes {expected}",
                path.display(),
                tensors.len()
            );
        }
        for (i, sae) in group.iter().enumerate() {
            sae.load_tensors(&tensors, &format!("{i}."))?;
        }
        Ok(group)
    }
}

impl<'a> IntoIterator for &'a SaeGroup {
    type Item = &'a SparseAutoencoder;
    type IntoIter = std::slice::Iter<'a, SparseAutoencoder>;

    fn into_iter(self) -> Self::IntoIter {
        self.autoencoders.iter()
    }
}
