//! Checkpoint bundles: save, discover, load, prune.
//!
//! A bundle lives under `{checkpoint_path}/{run_id}/` as five files sharing the
//! base name `{label}_{group_name}`:
//!
//! | Suffix | Contents |
//! |--------|----------|
//! | `.safetensors` | group weights, decoders normalised |
//! | `_log_feature_sparsity.safetensors` | per-autoencoder `log10` sparsity |
//! | `_activation_store.safetensors` | buffer rows and positions |
//! | `_training_state.safetensors` | counters and Adam moments |
//! | `_training_state.json` | manifest: steps, tokens, RNG, scheduler |
//!
//! Every file is written to `.{name}.tmp` and renamed into place. The manifest
//! goes last; a bundle without one is incomplete and never resumed from.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use sae_common::{ActivationProducer, ActivationSource, ActivationStore, RandomStateSnapshot, RunnerConfig};
use sae_core::{SaeGroup, PARAM_NAMES};

use crate::context::{log_feature_sparsity, TrainContextSnapshot, TrainingRunState};
use crate::error::{Result, TrainError};
use crate::optim::AdamState;
use crate::scheduler::SchedulerState;

pub const WEIGHTS_SUFFIX: &str = ".safetensors";
pub const LOG_FEATURE_SPARSITY_SUFFIX: &str = "_log_feature_sparsity.safetensors";
pub const ACTIVATION_STORE_SUFFIX: &str = "_activation_store.safetensors";
pub const TRAINING_STATE_SUFFIX: &str = "_training_state.safetensors";
pub const MANIFEST_SUFFIX: &str = "_training_state.json";

/// Longest first, so `.safetensors` only matches the weights file.
const SUFFIXES: [&str; 5] = [
    LOG_FEATURE_SPARSITY_SUFFIX,
    ACTIVATION_STORE_SUFFIX,
    TRAINING_STATE_SUFFIX,
    MANIFEST_SUFFIX,
    WEIGHTS_SUFFIX,
];

const MANIFEST_VERSION: u32 = 1;

// ── Labels ──────────────────────────────────────────────────────────────────

/// Bundle key: tokens trained so far, or the terminal checkpoint of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckpointLabel {
    Tokens(u64),
    Final(u64),
}

impl CheckpointLabel {
    pub fn tokens(&self) -> u64 {
        match *self {
            Self::Tokens(t) | Self::Final(t) => t,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, Self::Final(_))
    }
}

impl fmt::Display for CheckpointLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tokens(t) => write!(f, "{t}"),
            Self::Final(t) => write!(f, "final_{t}"),
        }
    }
}

impl FromStr for CheckpointLabel {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.strip_prefix("final_") {
            Some(t) => t.parse().map(Self::Final),
            None => s.parse().map(Self::Tokens),
        }
    }
}

impl Ord for CheckpointLabel {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.tokens(), self.is_final()).cmp(&(other.tokens(), other.is_final()))
    }
}

impl PartialOrd for CheckpointLabel {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

// ── Paths ───────────────────────────────────────────────────────────────────

/// The five file locations of one bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointFiles {
    pub label: CheckpointLabel,
    base: PathBuf,
}

impl CheckpointFiles {
    fn with_suffix(&self, suffix: &str) -> PathBuf {
        let mut s = self.base.clone().into_os_string();
        s.push(suffix);
        PathBuf::from(s)
    }

    /// `{run_dir}/{label}_{group_name}`.
    pub fn base_path(&self) -> &Path {
        &self.base
    }

    pub fn weights(&self) -> PathBuf {
        self.with_suffix(WEIGHTS_SUFFIX)
    }

    pub fn log_feature_sparsity(&self) -> PathBuf {
        self.with_suffix(LOG_FEATURE_SPARSITY_SUFFIX)
    }

    pub fn activation_store(&self) -> PathBuf {
        self.with_suffix(ACTIVATION_STORE_SUFFIX)
    }

    pub fn training_state(&self) -> PathBuf {
        self.with_suffix(TRAINING_STATE_SUFFIX)
    }

    pub fn manifest(&self) -> PathBuf {
        self.with_suffix(MANIFEST_SUFFIX)
    }

    pub fn all(&self) -> Vec<PathBuf> {
        SUFFIXES.iter().map(|s| self.with_suffix(s)).collect()
    }
}

/// A bundle found on disk.
#[derive(Debug, Clone)]
pub struct CheckpointEntry {
    pub label: CheckpointLabel,
    pub paths: Vec<PathBuf>,
    pub complete: bool,
}

/// Result of [`CheckpointManager::save`].
pub struct SavedCheckpoint {
    pub files: CheckpointFiles,
    pub log_feature_sparsities: Vec<Option<Tensor>>,
}

// ── Manifest ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ContextManifest {
    tokens_seen_since_reset: u64,
    scheduler: SchedulerState,
    adam_step_t: usize,
    adam_lr: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    version: u32,
    label: String,
    group_name: String,
    n_training_steps: u64,
    n_training_tokens: u64,
    random_state: RandomStateSnapshot,
    contexts: Vec<ContextManifest>,
}

// ── Retention ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Keep at most this many complete bundles; `None` keeps everything.
    pub max_checkpoints: Option<usize>,
    /// Exclude `final_*` bundles from pruning and from the count.
    pub protect_final: bool,
}

impl From<&RunnerConfig> for RetentionPolicy {
    fn from(cfg: &RunnerConfig) -> Self {
        Self {
            max_checkpoints: cfg.max_checkpoints,
            protect_final: cfg.protect_final_checkpoint,
        }
    }
}

impl RetentionPolicy {
    /// Labels to delete, given every bundle on disk.
    pub fn select_removals(&self, entries: &[CheckpointEntry]) -> Vec<CheckpointLabel> {
        let Some(max) = self.max_checkpoints else {
            return Vec::new();
        };
        let mut sortable: Vec<CheckpointLabel> = entries
            .iter()
            .filter(|e| e.complete && !(self.protect_final && e.label.is_final()))
            .map(|e| e.label)
            .collect();
        sortable.sort();
        let excess = sortable.len().saturating_sub(max);
        let mut removals: Vec<CheckpointLabel> = sortable.into_iter().take(excess).collect();

        // Leftovers of failed saves older than the newest complete bundle.
        let newest_complete = entries.iter().filter(|e| e.complete).map(|e| e.label).max();
        if let Some(newest) = newest_complete {
            removals.extend(
                entries
                    .iter()
                    .filter(|e| !e.complete && e.label < newest)
                    .map(|e| e.label),
            );
        }
        removals.sort();
        removals
    }
}

// ── Manager ─────────────────────────────────────────────────────────────────

pub struct CheckpointManager {
    cfg: RunnerConfig,
    run_dir: PathBuf,
    group_name: String,
    policy: RetentionPolicy,
}

impl CheckpointManager {
    /// Requires a resolved run id.
    pub fn new(cfg: &RunnerConfig) -> Result<Self> {
        Ok(Self {
            run_dir: cfg.run_dir()?,
            group_name: cfg.group_name(),
            policy: RetentionPolicy::from(cfg),
            cfg: cfg.clone(),
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    pub fn files(&self, label: CheckpointLabel) -> CheckpointFiles {
        CheckpointFiles {
            label,
            base: self.run_dir.join(format!("{label}_{}", self.group_name)),
        }
    }

    /// Write a complete bundle, then apply retention.
    pub fn save(
        &self,
        group: &SaeGroup,
        source: &dyn ActivationSource,
        run_state: &TrainingRunState,
        label: CheckpointLabel,
    ) -> Result<SavedCheckpoint> {
        fs::create_dir_all(&self.run_dir)?;
        let files = self.files(label);

        // Re-saving a label: the old bundle stops being complete first.
        remove_if_exists(&files.manifest())?;

        let log_feature_sparsities = match self.write_bundle(&files, group, source, run_state) {
            Ok(l) => l,
            Err(e) => {
                for path in files.all() {
                    let _ = fs::remove_file(path);
                }
                return Err(e);
            }
        };
        tracing::info!(
            label = %label,
            path = %files.base_path().display(),
            "saved checkpoint"
        );

        self.apply_retention()?;
        Ok(SavedCheckpoint {
            files,
            log_feature_sparsities,
        })
    }

    fn write_bundle(
        &self,
        files: &CheckpointFiles,
        group: &SaeGroup,
        source: &dyn ActivationSource,
        run_state: &TrainingRunState,
    ) -> Result<Vec<Option<Tensor>>> {
        write_atomic(&files.weights(), |tmp| Ok(group.save(tmp)?))?;

        let log_feature_sparsities = run_state
            .contexts
            .iter()
            .map(snapshot_log_feature_sparsity)
            .collect::<Result<Vec<_>>>()?;
        let sparsity_tensors: HashMap<String, Tensor> = log_feature_sparsities
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.as_ref().map(|t| (i.to_string(), t.clone())))
            .collect();
        write_atomic(&files.log_feature_sparsity(), |tmp| {
            Ok(candle_core::safetensors::save(&sparsity_tensors, tmp)?)
        })?;

        write_atomic(&files.activation_store(), |tmp| {
            source.save(tmp).map_err(TrainError::Activations)
        })?;

        let state_tensors = state_tensors(&run_state.contexts);
        write_atomic(&files.training_state(), |tmp| {
            Ok(candle_core::safetensors::save(&state_tensors, tmp)?)
        })?;

        let manifest = Manifest {
            version: MANIFEST_VERSION,
            label: files.label.to_string(),
            group_name: self.group_name.clone(),
            n_training_steps: run_state.n_training_steps,
            n_training_tokens: run_state.n_training_tokens,
            random_state: run_state.random_state.clone(),
            contexts: run_state
                .contexts
                .iter()
                .map(|c| ContextManifest {
                    tokens_seen_since_reset: c.tokens_seen_since_reset,
                    scheduler: c.scheduler,
                    adam_step_t: c.optimizer.step_t,
                    adam_lr: c.optimizer.lr,
                })
                .collect(),
        };
        let json = serde_json::to_string_pretty(&manifest)?;
        write_atomic(&files.manifest(), |tmp| Ok(fs::write(tmp, &json)?))?;
        Ok(log_feature_sparsities)
    }

    /// Rebuild group, buffer and run state from a complete bundle.
    pub fn load(
        &self,
        files: &CheckpointFiles,
        producer: Box<dyn ActivationProducer>,
        device: &Device,
    ) -> Result<(SaeGroup, ActivationStore, TrainingRunState)> {
        let manifest_path = files.manifest();
        if !manifest_path.is_file() {
            return Err(TrainError::NoCheckpoint(manifest_path));
        }
        let manifest: Manifest = serde_json::from_str(&fs::read_to_string(&manifest_path)?)?;
        let incompatible = |reason: String| TrainError::IncompatibleCheckpoint {
            path: files.base_path().display().to_string(),
            reason,
        };
        if manifest.version != MANIFEST_VERSION {
            return Err(incompatible(format!(
                "manifest version {} (expected {MANIFEST_VERSION})",
                manifest.version
            )));
        }
        if manifest.group_name != self.group_name {
            return Err(incompatible(format!(
                "group `{}` (expected `{}`)",
                manifest.group_name, self.group_name
            )));
        }

        let group = SaeGroup::load(&files.weights(), self.cfg.clone(), device)?;
        if manifest.contexts.len() != group.len() {
            return Err(incompatible(format!(
                "{} train contexts for {} autoencoders",
                manifest.contexts.len(),
                group.len()
            )));
        }
        let store = ActivationStore::load(&files.activation_store(), &self.cfg, producer, device)
            .map_err(TrainError::Activations)?;

        let mut tensors = candle_core::safetensors::load(files.training_state(), device)?;
        let mut take = |key: String| {
            tensors
                .remove(&key)
                .ok_or_else(|| incompatible(format!("missing tensor `{key}`")))
        };
        let mut contexts = Vec::with_capacity(manifest.contexts.len());
        for (i, c) in manifest.contexts.iter().enumerate() {
            let mut first_moment = Vec::with_capacity(PARAM_NAMES.len());
            let mut second_moment = Vec::with_capacity(PARAM_NAMES.len());
            for j in 0..PARAM_NAMES.len() {
                first_moment.push(take(format!("{i}.adam.{j}.m"))?);
                second_moment.push(take(format!("{i}.adam.{j}.v"))?);
            }
            contexts.push(TrainContextSnapshot {
                act_freq_scores: take(format!("{i}.act_freq_scores"))?,
                steps_since_fired: take(format!("{i}.steps_since_fired"))?,
                tokens_seen_since_reset: c.tokens_seen_since_reset,
                optimizer: AdamState {
                    step_t: c.adam_step_t,
                    lr: c.adam_lr,
                    first_moment,
                    second_moment,
                },
                scheduler: c.scheduler,
            });
        }

        let run_state = TrainingRunState {
            contexts,
            n_training_steps: manifest.n_training_steps,
            n_training_tokens: manifest.n_training_tokens,
            random_state: manifest.random_state,
        };
        Ok((group, store, run_state))
    }

    /// Every bundle in the run directory, oldest first.
    pub fn checkpoints(&self) -> Result<Vec<CheckpointEntry>> {
        let mut by_label: BTreeMap<CheckpointLabel, (Vec<PathBuf>, bool)> = BTreeMap::new();
        let dir = match fs::read_dir(&self.run_dir) {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        for entry in dir {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some((label, suffix)) = parse_file_name(name, &self.group_name) else {
                continue;
            };
            let slot = by_label.entry(label).or_default();
            slot.1 |= suffix == MANIFEST_SUFFIX;
            slot.0.push(path);
        }
        Ok(by_label
            .into_iter()
            .map(|(label, (mut paths, complete))| {
                paths.sort();
                CheckpointEntry {
                    label,
                    paths,
                    complete,
                }
            })
            .collect())
    }

    /// Newest complete bundle.
    pub fn latest(&self) -> Result<Option<CheckpointFiles>> {
        Ok(self
            .checkpoints()?
            .into_iter()
            .filter(|e| e.complete)
            .map(|e| e.label)
            .max()
            .map(|label| self.files(label)))
    }

    /// Newest complete bundle, or [`TrainError::NoCheckpoint`].
    pub fn resume_files(&self) -> Result<CheckpointFiles> {
        self.latest()?
            .ok_or_else(|| TrainError::NoCheckpoint(self.run_dir.clone()))
    }

    /// Delete bundles the retention policy no longer keeps.
    pub fn apply_retention(&self) -> Result<Vec<CheckpointLabel>> {
        let entries = self.checkpoints()?;
        let removals = self.policy.select_removals(&entries);
        for entry in entries.iter().filter(|e| removals.contains(&e.label)) {
            for path in &entry.paths {
                tracing::info!(label = %entry.label, path = %path.display(), "removing checkpoint file");
                remove_if_exists(path)?;
            }
        }
        Ok(removals)
    }
}

fn parse_file_name(name: &str, group_name: &str) -> Option<(CheckpointLabel, &'static str)> {
    let suffix: &'static str = SUFFIXES.iter().copied().find(|s| name.ends_with(s))?;
    let stem = name.strip_suffix(suffix)?;
    let label = stem.strip_suffix(group_name)?.strip_suffix('_')?;
    Some((label.parse().ok()?, suffix))
}

fn snapshot_log_feature_sparsity(ctx: &TrainContextSnapshot) -> Result<Option<Tensor>> {
    if ctx.tokens_seen_since_reset == 0 {
        return Ok(None);
    }
    let sparsity = ctx
        .act_freq_scores
        .affine(1.0 / ctx.tokens_seen_since_reset as f64, 0.0)?;
    Ok(Some(log_feature_sparsity(&sparsity)?))
}

fn state_tensors(contexts: &[TrainContextSnapshot]) -> HashMap<String, Tensor> {
    let mut tensors = HashMap::new();
    for (i, c) in contexts.iter().enumerate() {
        tensors.insert(format!("{i}.act_freq_scores"), c.act_freq_scores.clone());
        tensors.insert(format!("{i}.steps_since_fired"), c.steps_since_fired.clone());
        for (j, (m, v)) in c
            .optimizer
            .first_moment
            .iter()
            .zip(&c.optimizer.second_moment)
            .enumerate()
        {
            tensors.insert(format!("{i}.adam.{j}.m"), m.clone());
            tensors.insert(format!("{i}.adam.{j}.v"), v.clone());
        }
    }
    tensors
}

/// Write through `.{name}.tmp`, then rename over `path`.
fn write_atomic<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&Path) -> Result<()>,
{
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{name}.tmp"));
    if let Err(e) = write(&tmp) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use sae_common::{OneOrMany, RandomState, SyntheticActivations};

    use crate::context::TrainContext;

    fn cfg(dir: &Path) -> RunnerConfig {
        RunnerConfig {
            d_in: 4,
            expansion_factor: OneOrMany::One(2),
            train_batch_size: 8,
            n_batches_in_buffer: 2,
            checkpoint_path: dir.to_path_buf(),
            run_id: Some("testrun0".to_string()),
            ..Default::default()
        }
    }

    fn entry(label: CheckpointLabel, complete: bool) -> CheckpointEntry {
        CheckpointEntry {
            label,
            paths: Vec::new(),
            complete,
        }
    }

    #[test]
    fn labels_order_and_parse() {
        use CheckpointLabel::*;
        let mut labels = vec![Final(1000), Tokens(1000), Tokens(300), Tokens(20)];
        labels.sort();
        assert_eq!(labels, vec![Tokens(20), Tokens(300), Tokens(1000), Final(1000)]);
        assert_eq!("final_1000".parse::<CheckpointLabel>().unwrap(), Final(1000));
        assert_eq!(Final(7).to_string(), "final_7");
        assert!("final_".parse::<CheckpointLabel>().is_err());
    }

    #[test]
    fn file_names_parse_back() {
        let group = "sae_group_m_blocks.0.hook_mlp_out_8";
        assert_eq!(
            parse_file_name(&format!("300_{group}_activation_store.safetensors"), group),
            Some((CheckpointLabel::Tokens(300), ACTIVATION_STORE_SUFFIX))
        );
        assert_eq!(
            parse_file_name(&format!("final_300_{group}.safetensors"), group),
            Some((CheckpointLabel::Final(300), WEIGHTS_SUFFIX))
        );
        assert_eq!(parse_file_name(&format!(".300_{group}.safetensors.tmp"), group), None);
        assert_eq!(parse_file_name("300_other_group.safetensors", group), None);
    }

    #[test]
    fn retention_keeps_newest_and_is_idempotent() {
        use CheckpointLabel::*;
        let policy = RetentionPolicy {
            max_checkpoints: Some(2),
            protect_final: false,
        };
        let entries = vec![
            entry(Tokens(100), true),
            entry(Tokens(200), true),
            entry(Tokens(300), true),
            entry(Final(400), true),
        ];
        let removals = policy.select_removals(&entries);
        assert_eq!(removals, vec![Tokens(100), Tokens(200)]);

        let kept: Vec<_> = entries
            .into_iter()
            .filter(|e| !removals.contains(&e.label))
            .collect();
        assert!(policy.select_removals(&kept).is_empty());
    }

    #[test]
    fn protected_final_is_not_counted() {
        use CheckpointLabel::*;
        let policy = RetentionPolicy {
            max_checkpoints: Some(1),
            protect_final: true,
        };
        let entries = vec![
            entry(Tokens(100), true),
            entry(Tokens(200), true),
            entry(Final(200), true),
        ];
        assert_eq!(policy.select_removals(&entries), vec![Tokens(100)]);
    }

    #[test]
    fn stale_incomplete_bundles_are_pruned() {
        use CheckpointLabel::*;
        let policy = RetentionPolicy {
            max_checkpoints: Some(5),
            protect_final: false,
        };
        let entries = vec![
            entry(Tokens(100), false),
            entry(Tokens(200), true),
            entry(Tokens(300), false),
        ];
        assert_eq!(policy.select_removals(&entries), vec![Tokens(100)]);
    }

    fn saved_bundle(dir: &Path) -> (CheckpointManager, CheckpointFiles, RandomState) {
        let cfg = cfg(dir);
        let mut rng = RandomState::from_seed(3);
        let group = SaeGroup::new(cfg.clone(), &mut rng, &Device::Cpu).unwrap();
        let store = ActivationStore::from_config(
            &cfg,
            Box::new(SyntheticActivations::new(3, 1, 4)),
            &mut rng,
            &Device::Cpu,
        )
        .unwrap();
        let mut contexts: Vec<TrainContext> = group
            .iter()
            .map(|sae| TrainContext::new(sae, 10).unwrap())
            .collect();
        contexts[0].scheduler.advance();
        let state = TrainingRunState::capture(&contexts, 1, 8, &rng).unwrap();
        let manager = CheckpointManager::new(&cfg).unwrap();
        let saved = manager
            .save(&group, &store, &state, CheckpointLabel::Tokens(8))
            .unwrap();
        (manager, saved.files, rng)
    }

    #[test]
    fn saved_bundle_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, files, mut rng) = saved_bundle(dir.path());
        for path in files.all() {
            assert!(path.is_file(), "{}", path.display());
        }
        assert_eq!(manager.resume_files().unwrap(), files);

        let producer = Box::new(SyntheticActivations::new(3, 1, 4));
        let (group, _store, state) = manager.load(&files, producer, &Device::Cpu).unwrap();
        assert_eq!(group.len(), 1);
        assert_eq!(state.n_training_steps, 1);
        assert_eq!(state.n_training_tokens, 8);
        assert_eq!(state.contexts[0].scheduler.step, 1);
        let mut restored = RandomState::restore(&state.random_state);
        for _ in 0..3 {
            assert_eq!(rng.general().gen::<u32>(), restored.general().gen::<u32>());
        }
    }

    #[test]
    fn bundle_without_manifest_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, files, _) = saved_bundle(dir.path());
        fs::remove_file(files.manifest()).unwrap();
        let entries = manager.checkpoints().unwrap();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].complete);
        assert!(manager.latest().unwrap().is_none());
        assert!(matches!(
            manager.resume_files(),
            Err(TrainError::NoCheckpoint(_))
        ));
    }

    #[test]
    fn empty_run_dir_has_nothing_to_resume() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CheckpointManager::new(&cfg(dir.path())).unwrap();
        assert!(manager.checkpoints().unwrap().is_empty());
        assert!(matches!(
            manager.resume_files(),
            Err(TrainError::NoCheckpoint(_))
        ));
    }

    #[test]
    fn other_group_is_incompatible() {
        let dir = tempfile::tempdir().unwrap();
        let (_, files, _) = saved_bundle(dir.path());
        let other = RunnerConfig {
            model_name: "other".to_string(),
            ..cfg(dir.path())
        };
        let manager = CheckpointManager::new(&other).unwrap();
        let producer = Box::new(SyntheticActivations::new(3, 1, 4));
        assert!(matches!(
            manager.load(&files, producer, &Device::Cpu),
            Err(TrainError::IncompatibleCheckpoint { .. })
        ));
    }
}
