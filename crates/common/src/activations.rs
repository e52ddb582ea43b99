//! Activation sources: the producers that stand in for a source network, and
//! the shuffling buffer the training loop pulls batches from.
//!
//! Batches are `[batch, num_layers, d_in]` F32 tensors. The layer axis follows
//! [`RunnerConfig::layers`](crate::RunnerConfig::layers).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::config::RunnerConfig;
use crate::rng::RandomState;

const STORAGE_BUFFER_KEY: &str = "storage_buffer";
const POSITIONS_KEY: &str = "positions";
const CACHED_ACTIVATIONS_KEY: &str = "activations";

// ── Traits ──────────────────────────────────────────────────────────────────

/// Something that turns a position in a corpus into hook-point activations.
///
/// `position` counts rows produced so far; `seek` must make the producer emit
/// exactly the rows it would have emitted after `position` rows.
pub trait ActivationProducer: Send {
    fn num_layers(&self) -> usize;
    fn d_in(&self) -> usize;
    /// `[rows, num_layers, d_in]`, F32.
    fn produce(&mut self, rows: usize, device: &Device) -> Result<Tensor>;
    fn position(&self) -> u64;
    fn seek(&mut self, position: u64) -> Result<()>;
}

/// Batch source consumed by the training loop.
pub trait ActivationSource {
    /// Next `[batch, num_layers, d_in]` batch. Blocks; failures propagate.
    fn next_batch(&mut self, rng: &mut RandomState) -> Result<Tensor>;
    /// Rows currently buffered, without advancing the source.
    fn representative_sample(&self) -> Result<Tensor>;
    /// Persist enough state to continue with the exact same batches.
    fn save(&self, path: &Path) -> Result<()>;
}

// ── Synthetic producer ──────────────────────────────────────────────────────

/// Deterministic stand-in for a source network.
///
/// Each layer has `n_features` fixed unit directions and a fixed offset; a row
/// is a sparse non-negative combination of directions plus small noise. Row
/// `r` is drawn from its own ChaCha stream, so seeking is free.
pub struct SyntheticActivations {
    seed: u64,
    num_layers: usize,
    d_in: usize,
    n_features: usize,
    density: f32,
    noise: f32,
    /// Per layer: `n_features * d_in` directions followed by `d_in` offset.
    layers: Vec<Vec<f32>>,
    position: u64,
}

impl SyntheticActivations {
    pub fn new(seed: u64, num_layers: usize, d_in: usize) -> Self {
        Self::with_features(seed, num_layers, d_in, 4 * d_in, 0.05)
    }

    pub fn with_features(
        seed: u64,
        num_layers: usize,
        d_in: usize,
        n_features: usize,
        density: f32,
    ) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        rng.set_stream(0);
        let layers = (0..num_layers)
            .map(|_| {
                let mut data = Vec::with_capacity((n_features + 1) * d_in);
                for _ in 0..n_features {
                    let dir: Vec<f32> = (0..d_in).map(|_| rng.gen_range(-1.0..1.0)).collect();
                    let norm = dir.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-6);
                    data.extend(dir.iter().map(|x| x / norm));
                }
                data.extend((0..d_in).map(|_| rng.gen_range(-0.5f32..0.5)));
                data
            })
            .collect();
        Self {
            seed,
            num_layers,
            d_in,
            n_features,
            density,
            noise: 0.01,
            layers,
            position: 0,
        }
    }

    fn write_row(&self, row: u64, out: &mut Vec<f32>) {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        rng.set_stream(row + 1);
        let d = self.d_in;
        for layer in &self.layers {
            let start = out.len();
            out.extend_from_slice(&layer[self.n_features * d..]);
            for f in 0..self.n_features {
                if rng.gen::<f32>() < self.density {
                    let coef: f32 = rng.gen_range(0.5..2.0);
                    let dir = &layer[f * d..(f + 1) * d];
                    for (o, x) in out[start..].iter_mut().zip(dir) {
                        *o += coef * x;
                    }
                }
            }
            for o in out[start..].iter_mut() {
                *o += rng.gen_range(-self.noise..self.noise);
            }
        }
    }
}

impl ActivationProducer for SyntheticActivations {
    fn num_layers(&self) -> usize {
        self.num_layers
    }

    fn d_in(&self) -> usize {
        self.d_in
    }

    fn produce(&mut self, rows: usize, device: &Device) -> Result<Tensor> {
        let mut data = Vec::with_capacity(rows * self.num_layers * self.d_in);
        for r in 0..rows as u64 {
            self.write_row(self.position + r, &mut data);
        }
        self.position += rows as u64;
        Ok(Tensor::from_vec(
            data,
            (rows, self.num_layers, self.d_in),
            device,
        )?)
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, position: u64) -> Result<()> {
        self.position = position;
        Ok(())
    }
}

// ── Cached producer ─────────────────────────────────────────────────────────

/// Reads pre-computed activations from `{dir}/0.safetensors`, `{dir}/1.safetensors`, ...
///
/// Each file holds an `activations` tensor of shape `[n, num_layers, d_in]`
/// (or `[n, d_in]` for a single layer). Running past the last file is an error.
pub struct CachedActivations {
    files: Vec<PathBuf>,
    num_layers: usize,
    d_in: usize,
    file_index: usize,
    current: Option<Tensor>,
    offset: usize,
    position: u64,
}

impl CachedActivations {
    pub fn open(dir: &Path) -> Result<Self> {
        let mut files = Vec::new();
        while dir.join(format!("{}.safetensors", files.len())).is_file() {
            files.push(dir.join(format!("{}.safetensors", files.len())));
        }
        if files.is_empty() {
            anyhow::bail!("no cached activations found in {}", dir.display());
        }
        let first = load_cached_file(&files[0])?;
        let (_, num_layers, d_in) = first.dims3()?;
        Ok(Self {
            files,
            num_layers,
            d_in,
            file_index: 0,
            current: Some(first),
            offset: 0,
            position: 0,
        })
    }

    fn current_file(&mut self) -> Result<&Tensor> {
        if self.current.is_none() {
            let path = self.files.get(self.file_index).with_context(|| {
                format!("cached activations exhausted after {} rows", self.position)
            })?;
            let t = load_cached_file(path)?;
            let (_, layers, d_in) = t.dims3()?;
            if layers != self.num_layers || d_in != self.d_in {
                anyhow::bail!(
                    "{} has shape [_, {layers}, {d_in}], expected [_, {}, {}]",
                    path.display(),
                    self.num_layers,
                    self.d_in
                );
            }
            self.current = Some(t);
        }
        self.current
            .as_ref()
            .context("cached activations file not loaded")
    }

    /// Take up to `rows` rows from the current file, advancing to the next
    /// file when this one is used up.
    fn take(&mut self, rows: usize) -> Result<Tensor> {
        let offset = self.offset;
        let current = self.current_file()?;
        let available = current.dim(0)? - offset;
        let n = rows.min(available);
        let chunk = current.narrow(0, offset, n)?;
        self.offset += n;
        self.position += n as u64;
        if n == available {
            self.current = None;
            self.file_index += 1;
            self.offset = 0;
        }
        Ok(chunk)
    }
}

fn load_cached_file(path: &Path) -> Result<Tensor> {
    let mut tensors = candle_core::safetensors::load(path, &Device::Cpu)
        .with_context(|| format!("load cached activations {}", path.display()))?;
    let t = tensors
        .remove(CACHED_ACTIVATIONS_KEY)
        .with_context(|| format!("{} has no `{CACHED_ACTIVATIONS_KEY}` tensor", path.display()))?
        .to_dtype(DType::F32)?;
    Ok(match t.rank() {
        2 => t.unsqueeze(1)?,
        _ => t,
    })
}

impl ActivationProducer for CachedActivations {
    fn num_layers(&self) -> usize {
        self.num_layers
    }

    fn d_in(&self) -> usize {
        self.d_in
    }

    fn produce(&mut self, rows: usize, device: &Device) -> Result<Tensor> {
        let mut chunks = Vec::new();
        let mut remaining = rows;
        while remaining > 0 {
            let chunk = self.take(remaining)?;
            remaining -= chunk.dim(0)?;
            chunks.push(chunk);
        }
        let out = match chunks.len() {
            1 => chunks.remove(0),
            _ => Tensor::cat(&chunks, 0)?,
        };
        Ok(out.to_device(device)?)
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, position: u64) -> Result<()> {
        self.file_index = 0;
        self.offset = 0;
        self.current = None;
        self.position = 0;
        let mut remaining = position;
        while remaining > 0 {
            let chunk = self.take(remaining.min(usize::MAX as u64) as usize)?;
            remaining -= chunk.dim(0)? as u64;
        }
        Ok(())
    }
}

// ── Buffer ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivationStoreConfig {
    pub batch_size: usize,
    pub n_batches_in_buffer: usize,
}

impl ActivationStoreConfig {
    pub fn buffer_rows(&self) -> usize {
        self.batch_size * self.n_batches_in_buffer
    }
}

impl From<&RunnerConfig> for ActivationStoreConfig {
    fn from(cfg: &RunnerConfig) -> Self {
        Self {
            batch_size: cfg.train_batch_size,
            n_batches_in_buffer: cfg.n_batches_in_buffer,
        }
    }
}

/// Shuffling buffer over an [`ActivationProducer`].
///
/// Holds up to `batch_size * n_batches_in_buffer` rows. Once fewer than half
/// remain (or fewer than one batch), the leftovers are topped up with fresh
/// rows and the whole buffer is reshuffled with the general generator.
pub struct ActivationStore {
    producer: Box<dyn ActivationProducer>,
    config: ActivationStoreConfig,
    buffer: Tensor,
    cursor: usize,
    device: Device,
}

impl ActivationStore {
    /// Build an empty store and fill it once.
    pub fn new(
        producer: Box<dyn ActivationProducer>,
        config: ActivationStoreConfig,
        rng: &mut RandomState,
        device: &Device,
    ) -> Result<Self> {
        let buffer = Tensor::zeros(
            (0, producer.num_layers(), producer.d_in()),
            DType::F32,
            device,
        )?;
        let mut store = Self {
            producer,
            config,
            buffer,
            cursor: 0,
            device: device.clone(),
        };
        store.refill(rng)?;
        Ok(store)
    }

    pub fn from_config(
        cfg: &RunnerConfig,
        producer: Box<dyn ActivationProducer>,
        rng: &mut RandomState,
        device: &Device,
    ) -> Result<Self> {
        check_producer(cfg, producer.as_ref())?;
        Self::new(producer, ActivationStoreConfig::from(cfg), rng, device)
    }

    /// Restore a store written by [`ActivationSource::save`]; the producer is
    /// moved to the position it had at save time.
    pub fn load(
        path: &Path,
        cfg: &RunnerConfig,
        mut producer: Box<dyn ActivationProducer>,
        device: &Device,
    ) -> Result<Self> {
        check_producer(cfg, producer.as_ref())?;
        let mut tensors = candle_core::safetensors::load(path, device)
            .with_context(|| format!("load activation store {}", path.display()))?;
        let buffer = tensors
            .remove(STORAGE_BUFFER_KEY)
            .with_context(|| format!("{} has no `{STORAGE_BUFFER_KEY}`", path.display()))?;
        let positions = tensors
            .remove(POSITIONS_KEY)
            .with_context(|| format!("{} has no `{POSITIONS_KEY}`", path.display()))?
            .to_vec1::<i64>()?;
        let &[cursor, producer_position] = positions.as_slice() else {
            anyhow::bail!("`{POSITIONS_KEY}` must hold [cursor, producer_position]");
        };
        let (rows, layers, d_in) = buffer.dims3()?;
        if layers != producer.num_layers() || d_in != producer.d_in() {
            anyhow::bail!(
                "stored buffer is [_, {layers}, {d_in}], producer yields [_, {}, {}]",
                producer.num_layers(),
                producer.d_in()
            );
        }
        if cursor < 0 || cursor as usize > rows || producer_position < 0 {
            anyhow::bail!("corrupt activation store positions {positions:?}");
        }
        producer.seek(producer_position as u64)?;
        Ok(Self {
            producer,
            config: ActivationStoreConfig::from(cfg),
            buffer,
            cursor: cursor as usize,
            device: device.clone(),
        })
    }

    /// Rows not yet handed out.
    pub fn remaining(&self) -> usize {
        self.buffer.dim(0).unwrap_or(0).saturating_sub(self.cursor)
    }

    pub fn producer_position(&self) -> u64 {
        self.producer.position()
    }

    fn needs_refill(&self) -> bool {
        let remaining = self.remaining();
        remaining < self.config.batch_size || remaining < self.config.buffer_rows() / 2
    }

    fn refill(&mut self, rng: &mut RandomState) -> Result<()> {
        let remaining = self.remaining();
        let wanted = self.config.buffer_rows().saturating_sub(remaining);
        let fresh = self.producer.produce(wanted, &self.device)?;
        let combined = if remaining == 0 {
            fresh
        } else {
            let leftover = self.buffer.narrow(0, self.cursor, remaining)?;
            Tensor::cat(&[&leftover, &fresh], 0)?
        };
        let n = combined.dim(0)?;
        let perm = Tensor::from_vec(rng.permutation(n), n, &self.device)?;
        self.buffer = combined.index_select(&perm, 0)?;
        self.cursor = 0;
        tracing::debug!(rows = n, position = self.producer.position(), "refilled activation buffer");
        Ok(())
    }
}

fn check_producer(cfg: &RunnerConfig, producer: &dyn ActivationProducer) -> Result<()> {
    let layers = cfg.layers().len();
    if producer.num_layers() != layers || producer.d_in() != cfg.d_in {
        anyhow::bail!(
            "producer yields [_, {}, {}] but the config expects [_, {layers}, {}]",
            producer.num_layers(),
            producer.d_in(),
            cfg.d_in
        );
    }
    Ok(())
}

impl ActivationSource for ActivationStore {
    fn next_batch(&mut self, rng: &mut RandomState) -> Result<Tensor> {
        if self.needs_refill() {
            self.refill(rng)?;
        }
        let batch = self.buffer.narrow(0, self.cursor, self.config.batch_size)?;
        self.cursor += self.config.batch_size;
        Ok(batch)
    }

    fn representative_sample(&self) -> Result<Tensor> {
        Ok(self.buffer.clone())
    }

    fn save(&self, path: &Path) -> Result<()> {
        let positions = Tensor::new(
            &[self.cursor as i64, self.producer.position() as i64],
            &Device::Cpu,
        )?;
        let tensors: HashMap<String, Tensor> = [
            (STORAGE_BUFFER_KEY.to_string(), self.buffer.clone()),
            (POSITIONS_KEY.to_string(), positions),
        ]
        .into_iter()
        .collect();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        candle_core::safetensors::save(&tensors, path)
            .with_context(|| format!("save activation store {}", path.display()))?;
        Ok(())
    }
}
