use std::{str::FromStr, sync::Arc};

use ndarray::Array2;

use crate::{net::NetConfig, sync::ParamSync, Result, TrainerErr};

/// The weight tensors a parameterised layer exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightTag {
    Wmat,
    Bias,
}

impl FromStr for WeightTag {
    type Err = TrainerErr;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "wmat" => Ok(WeightTag::Wmat),
            "bias" => Ok(WeightTag::Bias),
            other => Err(TrainerErr::config(format!(
                "weight tag can only be bias or wmat, got '{other}'"
            ))),
        }
    }
}

/// Everything a replica needs to know about its place in the device pool.
#[derive(Clone)]
pub struct ReplicaCtx {
    pub device: usize,
    pub seed: u64,
    /// The configured batch size, gradients are scaled by its inverse.
    pub batch_size: usize,
    /// The rows of a configured batch this replica is handed.
    pub step: usize,
    pub sync: Option<Arc<dyn ParamSync>>,
}

impl ReplicaCtx {
    /// The context of a standalone replica that never trains with others.
    pub fn standalone(batch_size: usize) -> Self {
        Self {
            device: 0,
            seed: 0,
            batch_size,
            step: batch_size,
            sync: None,
        }
    }

    /// The seed of the `index`-th replica of a pool seeded with `seed`.
    pub fn replica_seed(seed: u64, index: usize) -> u64 {
        seed.wrapping_mul(100).wrapping_add(index as u64)
    }
}

/// One training step over a replica's slice of a batch.
#[derive(Debug, Clone)]
pub struct TrainStep {
    pub data: Array2<f32>,
    pub extra: Vec<Array2<f32>>,
    pub label: Array2<f32>,
    /// Only run the forward pass.
    pub predict_only: bool,
    pub needs_sync: bool,
    pub needs_push: bool,
    pub epoch: i64,
}

/// A device-resident copy of the whole network.
///
/// Every method runs on the replica's own worker thread, see `ReplicaThread`.
pub trait Replica: Sized + Send + 'static {
    /// Builds a replica of `cfg` with zeroed weights.
    fn create(cfg: &NetConfig, ctx: ReplicaCtx) -> Result<Self>;

    /// Initializes the weights from scratch using the context's seed.
    fn init_weights(&mut self) -> Result<()>;

    fn load_weights(&mut self, blob: &[u8]) -> Result<()>;

    fn save_weights(&mut self) -> Result<Vec<u8>>;

    /// Serializes the weights of a single layer.
    fn save_layer(&mut self, layer: usize) -> Result<Vec<u8>>;

    /// Overwrites the weights of a single layer with a blob from `save_layer`.
    fn copy_layer(&mut self, layer: usize, blob: &[u8]) -> Result<()>;

    fn start_round(&mut self, round: usize);

    /// Runs forward and, unless predicting, backward over the step's slice.
    ///
    /// # Returns
    /// The output node activations of the slice.
    fn train_step(&mut self, step: TrainStep) -> Result<Array2<f32>>;

    /// Runs a prediction-only forward pass, keeping every node's activation.
    fn predict_step(&mut self, data: Array2<f32>, extra: Vec<Array2<f32>>) -> Result<()>;

    /// Copies out the activation of `node` from the last forward pass.
    fn node_activation(&self, node: usize) -> Result<Array2<f32>>;

    fn get_weight(&mut self, layer: usize, tag: WeightTag) -> Result<Array2<f32>>;

    fn set_weight(&mut self, layer: usize, tag: WeightTag, weight: Array2<f32>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_seeds_are_distinct_and_deterministic() {
        let seeds: Vec<_> = (0..4).map(|i| ReplicaCtx::replica_seed(7, i)).collect();
        assert_eq!(seeds, vec![700, 701, 702, 703]);
        assert_ne!(ReplicaCtx::replica_seed(0, 1), ReplicaCtx::replica_seed(1, 0));
    }

    #[test]
    fn test_weight_tags() {
        assert_eq!("wmat".parse::<WeightTag>().unwrap(), WeightTag::Wmat);
        assert_eq!("bias".parse::<WeightTag>().unwrap(), WeightTag::Bias);
        assert!(matches!(
            "gamma".parse::<WeightTag>(),
            Err(TrainerErr::Config(_))
        ));
    }
}
