mod local;
mod synchronizer;

pub use local::LocalSync;
pub use synchronizer::{create, ParamSync};
