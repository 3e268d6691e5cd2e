mod config;
mod layers;
mod network;
mod optimizer;

pub use config::{Hyper, LayerKind, LayerSpec, LossKind, NetConfig, NodeRef, INPUT_NODE};
pub use layers::{Activation, Dense, Layer};
pub use network::Network;
pub use optimizer::{GradientDescent, GradientDescentWithMomentum, Optimizer};
