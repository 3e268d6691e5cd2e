use crate::{config::ParamServerKind, Result};

use super::LocalSync;

/// Reconciles gradients across replicas.
///
/// Keys identify a parameter tensor (the layer index), devices identify the pushing replica.
/// `push` and `pull` are called concurrently from every replica's worker thread.
pub trait ParamSync: Send + Sync {
    /// Accepts a configuration option, unknown ones are ignored.
    fn set_option(&mut self, name: &str, value: &str) -> Result<()>;

    /// Allocates the per-device state. Must be called exactly once, before any `push`.
    fn init(&mut self, devices: &[usize]) -> Result<()>;

    /// Contributes `device`'s gradient for `key` to the current round.
    fn push(&self, key: usize, device: usize, grad: &[f32]) -> Result<()>;

    /// Blocks until the round `device` last pushed to is complete and copies its aggregate.
    ///
    /// # Returns
    /// `false` if `device` never pushed `key`, leaving `out` untouched.
    fn pull(&self, key: usize, device: usize, out: &mut [f32]) -> Result<bool>;

    /// Gives up on every open round: blocked and later `pull`s and `push`es fail instead of
    /// waiting on devices that will never contribute.
    fn abort(&self);
}

/// Creates an uninitialized synchronizer of the given kind, `None` for `ParamServerKind::None`.
pub fn create(kind: ParamServerKind) -> Option<Box<dyn ParamSync>> {
    match kind {
        ParamServerKind::None => None,
        ParamServerKind::Local => Some(Box::new(LocalSync::new())),
    }
}
