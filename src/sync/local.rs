use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use log::debug;
use parking_lot::{Condvar, Mutex, RwLock};
use rayon::prelude::*;

use super::ParamSync;
use crate::{config::parse_flag, Result, TrainerErr};

/// Gradients at least this long are summed in parallel.
const PAR_THRESHOLD: usize = 1 << 14;

#[derive(Debug)]
struct SlotState {
    /// Sum of the gradients pushed for the open round.
    pending: Vec<f32>,
    contributors: usize,
    /// Sum of the last completed round.
    merged: Vec<f32>,
    completed: u64,
    /// Rounds pushed by every rank.
    pushed: Vec<u64>,
}

/// The aggregation state of a single key.
#[derive(Debug)]
struct Slot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl Slot {
    fn new(len: usize, ndevice: usize) -> Self {
        Self {
            state: Mutex::new(SlotState {
                pending: vec![0.; len],
                contributors: 0,
                merged: vec![0.; len],
                completed: 0,
                pushed: vec![0; ndevice],
            }),
            ready: Condvar::new(),
        }
    }
}

/// Same-process synchronizer: every round sums one gradient per device and hands the total
/// back to each of them.
#[derive(Debug, Default)]
pub struct LocalSync {
    ranks: HashMap<usize, usize>,
    initialized: bool,
    check_finite: bool,
    aborted: AtomicBool,
    slots: RwLock<HashMap<usize, Arc<Slot>>>,
}

impl LocalSync {
    pub fn new() -> Self {
        Self::default()
    }

    fn rank(&self, device: usize) -> Result<usize> {
        self.ranks.get(&device).copied().ok_or_else(|| {
            TrainerErr::reference(format!("device {device} isn't registered in the synchronizer"))
        })
    }

    fn slot(&self, key: usize, len: usize) -> Arc<Slot> {
        if let Some(slot) = self.slots.read().get(&key) {
            return Arc::clone(slot);
        }

        let mut slots = self.slots.write();
        let slot = slots
            .entry(key)
            .or_insert_with(|| Arc::new(Slot::new(len, self.ranks.len())));
        Arc::clone(slot)
    }

    fn check_aborted(&self) -> Result<()> {
        if self.aborted.load(Ordering::Acquire) {
            return Err(TrainerErr::ResourceInvariant(
                "the synchronizer was aborted after a replica failure",
            ));
        }
        Ok(())
    }
}

impl ParamSync for LocalSync {
    fn set_option(&mut self, name: &str, value: &str) -> Result<()> {
        if name == "local_check_finite" {
            self.check_finite = parse_flag(name, value)?;
        }
        Ok(())
    }

    fn init(&mut self, devices: &[usize]) -> Result<()> {
        if self.initialized {
            return Err(TrainerErr::ResourceInvariant(
                "the synchronizer was already initialized",
            ));
        }
        if devices.is_empty() {
            return Err(TrainerErr::config("the synchronizer needs at least one device"));
        }

        self.ranks = devices.iter().enumerate().map(|(r, &d)| (d, r)).collect();
        self.initialized = true;
        debug!(devices = devices.len(); "local synchronizer initialized");
        Ok(())
    }

    fn push(&self, key: usize, device: usize, grad: &[f32]) -> Result<()> {
        if !self.initialized {
            return Err(TrainerErr::ResourceInvariant(
                "push on an uninitialized synchronizer",
            ));
        }

        self.check_aborted()?;
        let rank = self.rank(device)?;
        if self.check_finite && !grad.iter().all(|g| g.is_finite()) {
            return Err(TrainerErr::config(format!(
                "device {device} pushed a non-finite gradient for key {key}"
            )));
        }

        let slot = self.slot(key, grad.len());
        let mut st = slot.state.lock();

        if st.pending.len() != grad.len() {
            return Err(TrainerErr::SizeMismatch {
                what: "pushed gradient",
                got: grad.len(),
                expected: st.pending.len(),
            });
        }
        if st.pushed[rank] > st.completed {
            return Err(TrainerErr::ResourceInvariant(
                "a device pushed twice within one round",
            ));
        }

        if grad.len() >= PAR_THRESHOLD {
            st.pending
                .par_iter_mut()
                .zip(grad.par_iter())
                .for_each(|(acc, g)| *acc += g);
        } else {
            st.pending.iter_mut().zip(grad).for_each(|(acc, g)| *acc += g);
        }

        st.pushed[rank] += 1;
        st.contributors += 1;

        if st.contributors == st.pushed.len() {
            let st = &mut *st;
            std::mem::swap(&mut st.pending, &mut st.merged);
            st.pending.fill(0.);
            st.contributors = 0;
            st.completed += 1;
            debug!(key = key, round = st.completed; "gradient round complete");
            slot.ready.notify_all();
        }

        Ok(())
    }

    fn pull(&self, key: usize, device: usize, out: &mut [f32]) -> Result<bool> {
        let rank = self.rank(device)?;
        let Some(slot) = self.slots.read().get(&key).cloned() else {
            return Ok(false);
        };

        let mut st = slot.state.lock();
        let target = st.pushed[rank];
        if target == 0 {
            return Ok(false);
        }

        while st.completed < target {
            self.check_aborted()?;
            slot.ready.wait(&mut st);
        }

        if out.len() != st.merged.len() {
            return Err(TrainerErr::SizeMismatch {
                what: "pulled gradient",
                got: out.len(),
                expected: st.merged.len(),
            });
        }

        out.copy_from_slice(&st.merged);
        Ok(true)
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::Release);

        // taking each lock orders the flag before any waiter's next check
        for slot in self.slots.read().values() {
            let _st = slot.state.lock();
            slot.ready.notify_all();
        }

        debug!("local synchronizer aborted");
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn local(devices: &[usize]) -> LocalSync {
        let mut sync = LocalSync::new();
        sync.init(devices).unwrap();
        sync
    }

    #[test]
    fn test_round_sums_every_device() {
        let sync = local(&[3, 5]);
        let mut out = [0.; 2];

        assert!(!sync.pull(0, 3, &mut out).unwrap());

        sync.push(0, 3, &[1., 2.]).unwrap();
        sync.push(0, 5, &[10., 20.]).unwrap();

        assert!(sync.pull(0, 3, &mut out).unwrap());
        assert_eq!(out, [11., 22.]);
        assert!(sync.pull(0, 5, &mut out).unwrap());
        assert_eq!(out, [11., 22.]);
    }

    #[test]
    fn test_fast_device_does_not_clobber_previous_round() {
        let sync = local(&[0, 1]);
        let mut out = [0.];

        sync.push(0, 0, &[1.]).unwrap();
        sync.push(0, 1, &[2.]).unwrap();

        // device 0 races ahead into the next round
        assert!(sync.pull(0, 0, &mut out).unwrap());
        sync.push(0, 0, &[100.]).unwrap();

        assert!(sync.pull(0, 1, &mut out).unwrap());
        assert_eq!(out, [3.]);
    }

    #[test]
    fn test_pull_blocks_until_round_completes() {
        let sync = Arc::new(local(&[0, 1]));
        sync.push(7, 0, &[1.5]).unwrap();

        let waiter = {
            let sync = Arc::clone(&sync);
            thread::spawn(move || {
                let mut out = [0.];
                sync.pull(7, 0, &mut out).map(|_| out)
            })
        };

        sync.push(7, 1, &[0.5]).unwrap();
        assert_eq!(waiter.join().unwrap().unwrap(), [2.]);
    }

    #[test]
    fn test_protocol_violations() {
        let sync = local(&[0, 1]);

        assert!(matches!(
            sync.push(0, 9, &[1.]),
            Err(TrainerErr::InvalidReference(_))
        ));

        sync.push(0, 0, &[1.]).unwrap();
        assert!(matches!(
            sync.push(0, 0, &[1.]),
            Err(TrainerErr::ResourceInvariant(_))
        ));
        assert!(matches!(
            sync.push(0, 1, &[1., 2.]),
            Err(TrainerErr::SizeMismatch { .. })
        ));

        let mut sync = sync;
        assert!(matches!(
            sync.init(&[0]),
            Err(TrainerErr::ResourceInvariant(_))
        ));
    }

    #[test]
    fn test_abort_wakes_blocked_pull() {
        let sync = Arc::new(local(&[0, 1]));
        sync.push(2, 1, &[1.]).unwrap();

        let waiter = {
            let sync = Arc::clone(&sync);
            thread::spawn(move || sync.pull(2, 1, &mut [0.]))
        };

        // device 0 never pushes its share of the round
        sync.abort();
        assert!(matches!(
            waiter.join().unwrap(),
            Err(TrainerErr::ResourceInvariant(_))
        ));
        assert!(matches!(
            sync.push(2, 0, &[1.]),
            Err(TrainerErr::ResourceInvariant(_))
        ));
    }

    #[test]
    fn test_check_finite_option() {
        let mut sync = LocalSync::new();
        sync.set_option("local_check_finite", "1").unwrap();
        sync.set_option("eta", "0.1").unwrap();
        sync.init(&[0]).unwrap();

        assert!(sync.push(0, 0, &[f32::NAN]).is_err());
        sync.push(0, 0, &[1.]).unwrap();
    }

    #[test]
    fn test_large_gradients_sum_in_parallel() {
        let sync = local(&[0, 1]);
        let grad = vec![1.; PAR_THRESHOLD + 3];
        sync.push(1, 0, &grad).unwrap();
        sync.push(1, 1, &grad).unwrap();

        let mut out = vec![0.; grad.len()];
        assert!(sync.pull(1, 1, &mut out).unwrap());
        assert!(out.iter().all(|&g| g == 2.));
    }
}
