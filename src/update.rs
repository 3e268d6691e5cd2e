use std::num::NonZeroUsize;

/// What a single training step must do with the shared parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepFlags {
    /// Pull the synchronized parameters before computing.
    pub needs_sync: bool,
    /// Push the accumulated gradient after computing.
    pub needs_push: bool,
}

/// Tracks gradient accumulation across `period` consecutive batches.
///
/// Only `epoch` is persisted with a model, the in-flight `counter` restarts at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateState {
    period: NonZeroUsize,
    counter: usize,
    epoch: i64,
}

impl UpdateState {
    pub fn new(period: NonZeroUsize) -> Self {
        Self {
            period,
            counter: 0,
            epoch: 0,
        }
    }

    /// The flags for the batch about to be processed.
    pub fn flags(&self) -> StepFlags {
        StepFlags {
            needs_sync: self.counter == 0,
            needs_push: self.counter + 1 == self.period.get(),
        }
    }

    /// Marks the current batch as processed.
    ///
    /// # Returns
    /// Whether a full period just completed.
    pub fn advance(&mut self) -> bool {
        self.counter += 1;
        if self.counter < self.period.get() {
            return false;
        }

        self.counter = 0;
        self.epoch += 1;
        true
    }

    pub fn counter(&self) -> usize {
        self.counter
    }

    pub fn epoch(&self) -> i64 {
        self.epoch
    }

    pub fn period(&self) -> NonZeroUsize {
        self.period
    }

    /// Restores a persisted epoch, restarting the accumulation cycle.
    pub fn restore(&mut self, epoch: i64) {
        self.epoch = epoch;
        self.counter = 0;
    }

    /// Changes the period, restarting the accumulation cycle.
    pub fn set_period(&mut self, period: NonZeroUsize) {
        self.period = period;
        self.counter = 0;
    }
}
