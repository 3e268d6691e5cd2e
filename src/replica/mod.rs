mod replica;
mod thread;

pub use replica::{Replica, ReplicaCtx, TrainStep, WeightTag};
pub use thread::{wait_all, Pending, ReplicaThread};
