use std::{
    marker::PhantomData,
    thread::{self, JoinHandle},
};

use log::{debug, error};
use tokio::sync::{
    mpsc::{self, UnboundedSender},
    oneshot,
};

use super::{Replica, ReplicaCtx};
use crate::{net::NetConfig, Result, TrainerErr};

type Job<R> = Box<dyn FnOnce(&mut R) + Send>;

/// A replica living on its own dedicated thread.
///
/// Jobs are queued in order and run one at a time against the replica.
pub struct ReplicaThread<R: Replica> {
    device: usize,
    jobs: Option<UnboundedSender<Job<R>>>,
    worker: Option<JoinHandle<()>>,
}

impl<R: Replica> ReplicaThread<R> {
    /// Spawns the worker thread and builds the replica on it.
    ///
    /// # Arguments
    /// * `cfg` - The topology of the replica.
    /// * `ctx` - The replica's place in the device pool.
    ///
    /// # Errors
    /// Whatever `Replica::create` returns, or an `Io` error if the thread can't be spawned.
    pub fn spawn(cfg: &NetConfig, ctx: ReplicaCtx) -> Result<Self> {
        let device = ctx.device;
        let cfg = cfg.clone();
        let (jobs, mut queue) = mpsc::unbounded_channel::<Job<R>>();
        let (ready_tx, ready_rx) = oneshot::channel();

        let worker = thread::Builder::new()
            .name(format!("replica-{device}"))
            .spawn(move || {
                let mut replica = match R::create(&cfg, ctx) {
                    Ok(replica) => {
                        let _ = ready_tx.send(Ok(()));
                        replica
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                while let Some(job) = queue.blocking_recv() {
                    job(&mut replica);
                }

                debug!(device = device; "replica worker finished");
            })?;

        let this = Self {
            device,
            jobs: Some(jobs),
            worker: Some(worker),
        };

        match ready_rx.blocking_recv() {
            Ok(Ok(())) => Ok(this),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(failed(device, "worker exited while creating the replica")),
        }
    }

    pub fn device(&self) -> usize {
        self.device
    }

    /// Queues `op` on the worker without waiting for it.
    ///
    /// The returned handle keeps this thread borrowed until it's waited on.
    pub fn dispatch<T, F>(&mut self, op: F) -> Pending<'_, T>
    where
        T: Send + 'static,
        F: FnOnce(&mut R) -> Result<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job<R> = Box::new(move |replica| {
            let _ = tx.send(op(replica));
        });

        // a closed queue drops the job, which the handle reports on wait
        if let Some(jobs) = &self.jobs {
            let _ = jobs.send(job);
        }

        Pending {
            device: self.device,
            result: rx,
            _replica: PhantomData,
        }
    }

    /// Runs `op` on the worker and waits for it.
    pub fn run<T, F>(&mut self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut R) -> Result<T> + Send + 'static,
    {
        self.dispatch(op).wait()
    }
}

impl<R: Replica> Drop for ReplicaThread<R> {
    fn drop(&mut self) {
        self.jobs.take();

        if let Some(Err(e)) = self.worker.take().map(JoinHandle::join) {
            let device = self.device;
            error!("failed to join the worker of replica {device}: {e:?}");
        }
    }
}

/// The handle of a job running on a replica's worker.
#[must_use = "a dispatched job has to be waited on"]
pub struct Pending<'r, T> {
    device: usize,
    result: oneshot::Receiver<Result<T>>,
    _replica: PhantomData<&'r mut ()>,
}

impl<T> Pending<'_, T> {
    pub fn device(&self) -> usize {
        self.device
    }

    /// Blocks until the job completes.
    ///
    /// # Errors
    /// The job's own error, or `ReplicaFailed` if the worker died before answering.
    pub fn wait(self) -> Result<T> {
        self.result
            .blocking_recv()
            .unwrap_or_else(|_| Err(failed(self.device, "worker exited while running a job")))
    }
}

/// Waits on every handle, even after a failure.
///
/// # Returns
/// The results in the order of `pending`, or the first error found.
pub fn wait_all<T>(pending: Vec<Pending<'_, T>>) -> Result<Vec<T>> {
    let mut results = Vec::with_capacity(pending.len());
    let mut first_err = None;

    for job in pending {
        match job.wait() {
            Ok(value) => results.push(value),
            Err(e) => {
                first_err.get_or_insert(e);
            }
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(results),
    }
}

fn failed(device: usize, msg: &str) -> TrainerErr {
    TrainerErr::ReplicaFailed {
        device,
        msg: msg.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array2;

    use super::*;
    use crate::replica::{TrainStep, WeightTag};

    /// Records the calls it gets, fails to be created on device 13.
    struct Probe {
        device: usize,
        rounds: Vec<usize>,
    }

    impl Replica for Probe {
        fn create(_: &NetConfig, ctx: ReplicaCtx) -> Result<Self> {
            if ctx.device == 13 {
                return Err(TrainerErr::config("unlucky device"));
            }
            Ok(Self {
                device: ctx.device,
                rounds: Vec::new(),
            })
        }

        fn init_weights(&mut self) -> Result<()> {
            Ok(())
        }

        fn load_weights(&mut self, _: &[u8]) -> Result<()> {
            panic!("load_weights is not supported by the probe");
        }

        fn save_weights(&mut self) -> Result<Vec<u8>> {
            Ok(vec![self.device as u8])
        }

        fn save_layer(&mut self, _: usize) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        fn copy_layer(&mut self, _: usize, _: &[u8]) -> Result<()> {
            Ok(())
        }

        fn start_round(&mut self, round: usize) {
            self.rounds.push(round);
        }

        fn train_step(&mut self, step: TrainStep) -> Result<Array2<f32>> {
            Ok(step.data)
        }

        fn predict_step(&mut self, _: Array2<f32>, _: Vec<Array2<f32>>) -> Result<()> {
            Ok(())
        }

        fn node_activation(&self, _: usize) -> Result<Array2<f32>> {
            Ok(Array2::zeros((0, 0)))
        }

        fn get_weight(&mut self, layer: usize, _: WeightTag) -> Result<Array2<f32>> {
            Err(TrainerErr::reference(format!("no layer {layer}")))
        }

        fn set_weight(&mut self, _: usize, _: WeightTag, _: Array2<f32>) -> Result<()> {
            Ok(())
        }
    }

    fn spawn(device: usize) -> Result<ReplicaThread<Probe>> {
        let ctx = ReplicaCtx {
            device,
            ..ReplicaCtx::standalone(4)
        };
        ReplicaThread::spawn(&NetConfig::default(), ctx)
    }

    #[test]
    fn test_jobs_run_in_order() {
        let mut thread = spawn(2).unwrap();
        for round in 0..3 {
            thread
                .run(move |r: &mut Probe| {
                    r.start_round(round);
                    Ok(())
                })
                .unwrap();
        }

        let rounds = thread.run(|r: &mut Probe| Ok(r.rounds.clone())).unwrap();
        assert_eq!(rounds, vec![0, 1, 2]);
        assert_eq!(thread.run(|r: &mut Probe| r.save_weights()).unwrap(), vec![2]);
    }

    #[test]
    fn test_creation_error_is_reported() {
        assert!(matches!(spawn(13), Err(TrainerErr::Config(_))));
    }

    #[test]
    fn test_job_errors_propagate() {
        let mut thread = spawn(0).unwrap();
        let err = thread
            .run(|r: &mut Probe| r.get_weight(5, WeightTag::Wmat))
            .unwrap_err();
        assert!(matches!(err, TrainerErr::InvalidReference(_)));

        // the worker survives a failed job
        assert!(thread.run(|r: &mut Probe| r.init_weights()).is_ok());
    }

    #[test]
    fn test_panicking_job_fails_the_replica() {
        let mut thread = spawn(1).unwrap();
        let err = thread.run(|r: &mut Probe| r.load_weights(&[])).unwrap_err();
        assert!(matches!(err, TrainerErr::ReplicaFailed { device: 1, .. }));

        let err = thread.run(|r: &mut Probe| r.init_weights()).unwrap_err();
        assert!(matches!(err, TrainerErr::ReplicaFailed { device: 1, .. }));
    }

    #[test]
    fn test_wait_all_keeps_first_error() {
        let mut threads: Vec<_> = (0..3).map(|d| spawn(d).unwrap()).collect();

        let pending = threads
            .iter_mut()
            .rev()
            .map(|t| t.dispatch(|r: &mut Probe| Ok(r.device)))
            .collect();
        assert_eq!(wait_all(pending).unwrap(), vec![2, 1, 0]);

        let pending = threads
            .iter_mut()
            .map(|t| {
                t.dispatch(|r: &mut Probe| match r.device {
                    0 => Ok(0),
                    d => Err(TrainerErr::reference(format!("{d}"))),
                })
            })
            .collect();
        match wait_all(pending) {
            Err(TrainerErr::InvalidReference(msg)) => assert_eq!(msg, "1"),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }
}
