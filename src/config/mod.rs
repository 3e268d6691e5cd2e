mod devices;
mod trainer;

pub use devices::DeviceSet;
pub(crate) use trainer::{parse, parse_flag};
pub use trainer::{Applied, MetricSpec, ParamServerKind, TrainerConfig};
