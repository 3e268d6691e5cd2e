pub mod batch;
pub mod config;
pub mod error;
pub mod metric;
pub mod net;
pub mod partition;
pub mod replica;
pub mod stream;
pub mod sync;
pub mod trainer;
pub mod update;

pub use batch::{BatchList, DataBatch, DataIter};
pub use config::{DeviceSet, ParamServerKind, TrainerConfig};
pub use error::{Result, TrainerErr};
pub use trainer::Trainer;
