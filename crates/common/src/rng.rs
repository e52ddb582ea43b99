//! Seeded random state shared by a training run.
//!
//! Two ChaCha8 generators: `general` drives host-side choices (buffer
//! shuffles), `tensor` draws parameter initialisations. Both can be
//! snapshotted exactly and restored, so a resumed run draws the same numbers
//! an uninterrupted run would have.

use candle_core::{Device, Result, Shape, Tensor};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

const GENERAL_STREAM: u64 = 0;
const TENSOR_STREAM: u64 = 1;

/// Exact position of one ChaCha generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratorSnapshot {
    pub seed: [u8; 32],
    pub stream: u64,
    pub word_pos: u128,
}

impl GeneratorSnapshot {
    fn capture(rng: &ChaCha8Rng) -> Self {
        Self {
            seed: rng.get_seed(),
            stream: rng.get_stream(),
            word_pos: rng.get_word_pos(),
        }
    }

    fn rebuild(&self) -> ChaCha8Rng {
        let mut rng = ChaCha8Rng::from_seed(self.seed);
        rng.set_stream(self.stream);
        rng.set_word_pos(self.word_pos);
        rng
    }
}

/// Serializable form of [`RandomState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomStateSnapshot {
    pub general: GeneratorSnapshot,
    pub tensor: GeneratorSnapshot,
}

#[derive(Debug, Clone)]
pub struct RandomState {
    general: ChaCha8Rng,
    tensor: ChaCha8Rng,
}

impl RandomState {
    pub fn from_seed(seed: u64) -> Self {
        let mut general = ChaCha8Rng::seed_from_u64(seed);
        general.set_stream(GENERAL_STREAM);
        let mut tensor = ChaCha8Rng::seed_from_u64(seed);
        tensor.set_stream(TENSOR_STREAM);
        Self { general, tensor }
    }

    pub fn general(&mut self) -> &mut ChaCha8Rng {
        &mut self.general
    }

    pub fn tensor_rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.tensor
    }

    /// F32 tensor with entries drawn uniformly from `[low, high)`.
    pub fn uniform<S: Into<Shape>>(
        &mut self,
        shape: S,
        low: f32,
        high: f32,
        device: &Device,
    ) -> Result<Tensor> {
        let shape = shape.into();
        let data: Vec<f32> = (0..shape.elem_count())
            .map(|_| self.tensor.gen_range(low..high))
            .collect();
        Tensor::from_vec(data, shape, device)
    }

    /// Random permutation of `0..n`, drawn from the general generator.
    pub fn permutation(&mut self, n: usize) -> Vec<u32> {
        let mut idx: Vec<u32> = (0..n as u32).collect();
        idx.shuffle(&mut self.general);
        idx
    }

    pub fn snapshot(&self) -> RandomStateSnapshot {
        RandomStateSnapshot {
            general: GeneratorSnapshot::capture(&self.general),
            tensor: GeneratorSnapshot::capture(&self.tensor),
        }
    }

    pub fn restore(snapshot: &RandomStateSnapshot) -> Self {
        Self {
            general: snapshot.general.rebuild(),
            tensor: snapshot.tensor.rebuild(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_draws() {
        let mut a = RandomState::from_seed(7);
        let mut b = RandomState::from_seed(7);
        assert_eq!(a.permutation(50), b.permutation(50));
        let ta = a.uniform((4, 3), -1.0, 1.0, &Device::Cpu).unwrap();
        let tb = b.uniform((4, 3), -1.0, 1.0, &Device::Cpu).unwrap();
        assert_eq!(
            ta.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            tb.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn streams_are_independent() {
        let mut a = RandomState::from_seed(7);
        let first = a.general().gen::<u64>();
        let mut b = RandomState::from_seed(7);
        b.uniform(100, 0.0, 1.0, &Device::Cpu).unwrap();
        assert_eq!(b.general().gen::<u64>(), first);
    }

    #[test]
    fn restore_continues_the_sequence() {
        let mut rng = RandomState::from_seed(3);
        rng.permutation(17);
        rng.uniform(9, 0.0, 1.0, &Device::Cpu).unwrap();

        let json = serde_json::to_string(&rng.snapshot()).unwrap();
        let snap: RandomStateSnapshot = serde_json::from_str(&json).unwrap();
        let mut restored = RandomState::restore(&snap);

        assert_eq!(rng.permutation(32), restored.permutation(32));
        assert_eq!(rng.tensor_rng().gen::<u64>(), restored.tensor_rng().gen::<u64>());
    }

    #[test]
    fn uniform_respects_bounds() {
        let mut rng = RandomState::from_seed(0);
        let t = rng.uniform(1000, -0.5, 0.5, &Device::Cpu).unwrap();
        let v = t.to_vec1::<f32>().unwrap();
        assert!(v.iter().all(|x| (-0.5..0.5).contains(x)));
    }
}
