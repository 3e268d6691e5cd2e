use std::{error::Error, fmt, io};

/// The result type used across the whole crate.
pub type Result<T> = std::result::Result<T, TrainerErr>;

/// All errors that can occur while orchestrating replicas.
#[derive(Debug)]
pub enum TrainerErr {
    /// Invalid configuration: malformed device list, unknown weight tag, bad option value...
    Config(String),
    /// A layer or node reference that can't be resolved against the network.
    InvalidReference(String),
    /// A tensor or serialized blob doesn't have the expected size.
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    /// The trainer was driven in an order it doesn't support. Always a programming error.
    ResourceInvariant(&'static str),
    /// A replica worker exited or failed while running a job.
    ReplicaFailed { device: usize, msg: String },
    /// Reading or writing persisted model state failed.
    Io(io::Error),
    /// The network topology block couldn't be encoded or decoded.
    Serde(serde_json::Error),
}

impl fmt::Display for TrainerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "invalid configuration: {msg}"),
            Self::InvalidReference(msg) => write!(f, "invalid reference: {msg}"),
            Self::SizeMismatch {
                what,
                got,
                expected,
            } => write!(f, "size mismatch in {what}: got {got}, expected {expected}"),
            Self::ResourceInvariant(msg) => write!(f, "resource invariant violated: {msg}"),
            Self::ReplicaFailed { device, msg } => {
                write!(f, "replica on device {device} failed: {msg}")
            }
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Serde(e) => write!(f, "topology encoding error: {e}"),
        }
    }
}

impl Error for TrainerErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Serde(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TrainerErr {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for TrainerErr {
    fn from(e: serde_json::Error) -> Self {
        Self::Serde(e)
    }
}

impl TrainerErr {
    /// Shorthand for a `Config` error.
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Shorthand for an `InvalidReference` error.
    pub(crate) fn reference(msg: impl Into<String>) -> Self {
        Self::InvalidReference(msg.into())
    }
}
