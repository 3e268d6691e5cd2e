use std::{
    io::{Read, Write},
    sync::Arc,
};

use log::{debug, error, info};
use ndarray::{s, Array1, Array2, ArrayView2};

use crate::{
    batch::{BatchSlice, DataBatch, DataIter, LabelView},
    config::{Applied, DeviceSet, ParamServerKind, TrainerConfig},
    metric::{argmax, MetricSet},
    net::{NetConfig, Network},
    partition::{partition, shrink_devices, step_size, SliceRange},
    replica::{wait_all, Replica, ReplicaCtx, ReplicaThread, TrainStep, WeightTag},
    stream::{read_blob, read_i64, write_blob, write_i64},
    sync::{self, ParamSync},
    update::UpdateState,
    Result, TrainerErr,
};

/// Drives a pool of replicas, one per device, through training, prediction and evaluation.
///
/// Every batch is split into contiguous slices, one per replica, and every operation waits
/// for all of its replicas before returning.
pub struct Trainer<R: Replica = Network> {
    config: TrainerConfig,
    /// Every option ever set, in order. Forwarded to the network and the synchronizer.
    history: Vec<(String, String)>,
    net_cfg: Option<NetConfig>,
    /// The devices of the live pool, after the shrink done at initialization.
    active: Option<DeviceSet>,
    replicas: Vec<ReplicaThread<R>>,
    /// A training round failed midway, the pool is unusable until `reset`.
    failed: bool,
    sync: Option<Arc<dyn ParamSync>>,
    update: UpdateState,
    train_metric: MetricSet,
    eval_metric: MetricSet,
}

impl Trainer {
    pub fn new() -> Self {
        Self::with_replica(TrainerConfig::default())
    }

    pub fn with_config(config: TrainerConfig) -> Self {
        Self::with_replica(config)
    }
}

impl Default for Trainer {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Replica> Trainer<R> {
    /// Creates a new `Trainer` driving replicas of type `R`.
    ///
    /// # Arguments
    /// * `config` - The structured trainer options, further options may be set before init.
    pub fn with_replica(config: TrainerConfig) -> Self {
        Self {
            update: UpdateState::new(config.update_period),
            train_metric: MetricSet::new(&config.metrics),
            eval_metric: MetricSet::new(&config.metrics),
            config,
            history: Vec::new(),
            net_cfg: None,
            active: None,
            replicas: Vec::new(),
            failed: false,
            sync: None,
        }
    }

    /// Sets a `name = value` option.
    ///
    /// Trainer options update the structured configuration, every option is also kept to
    /// configure the network and the synchronizer on the next initialization.
    ///
    /// # Errors
    /// A `Config` error if a trainer option has an invalid value.
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<()> {
        match self.config.apply(name, value)? {
            Applied::Metric(spec) => {
                self.train_metric.add_metric(&spec);
                self.eval_metric.add_metric(&spec);
            }
            Applied::Updated if name == "update_period" => {
                self.update.set_period(self.config.update_period);
            }
            Applied::Updated | Applied::Ignored => {}
        }

        self.history.push((name.to_string(), value.to_string()));
        Ok(())
    }

    /// Builds the replicas from the options set so far and initializes their weights.
    ///
    /// Replica 0 initializes from scratch and every other replica loads its weights.
    ///
    /// # Errors
    /// A `ResourceInvariant` if the pool is already initialized, or whatever building the
    /// network or its replicas fails with.
    pub fn init_model(&mut self) -> Result<()> {
        let cfg = NetConfig::parse(&self.history)?;
        self.init_net(cfg)?;
        self.update = UpdateState::new(self.config.update_period);

        let first = self.first_replica()?;
        first.run(|r: &mut R| r.init_weights())?;
        let blob = first.run(|r: &mut R| r.save_weights())?;
        self.broadcast_weights(blob, 1)?;

        info!(devices = self.replicas.len(); "model initialized");
        Ok(())
    }

    /// Writes the topology, the epoch counter and the weights, in that order.
    pub fn save_model<W: Write>(&mut self, w: &mut W) -> Result<()> {
        let blob = self.first_replica()?.run(|r: &mut R| r.save_weights())?;
        let cfg = self.net_cfg.as_ref().ok_or_else(uninitialized)?;

        cfg.save(w)?;
        write_i64(w, self.update.epoch())?;
        write_blob(w, &blob)?;

        info!(epoch = self.update.epoch(), bytes = blob.len(); "model saved");
        Ok(())
    }

    /// Replaces the current model with one written by `save_model`.
    ///
    /// The whole stream is read before the live replicas are touched.
    pub fn load_model<Rd: Read>(&mut self, r: &mut Rd) -> Result<()> {
        let mut cfg = NetConfig::load(r)?;
        let epoch = read_i64(r)?;
        let blob = read_blob(r)?;
        cfg.configure(&self.history)?;

        self.reset();
        self.init_net(cfg)?;
        self.update = UpdateState::new(self.config.update_period);
        self.update.restore(epoch);
        self.broadcast_weights(blob, 0)?;

        info!(epoch = epoch; "model loaded");
        Ok(())
    }

    /// Initializes a fresh model and copies into it every layer whose name matches one of the
    /// layers of the model in `r`. The epoch counter restarts at zero.
    ///
    /// # Errors
    /// A `SizeMismatch` if two layers share a name but not their shape.
    pub fn copy_model_from<Rd: Read>(&mut self, r: &mut Rd) -> Result<()> {
        let old_cfg = NetConfig::load(r)?;
        let _epoch = read_i64(r)?;
        let blob = read_blob(r)?;

        let mut old = R::create(&old_cfg, ReplicaCtx::standalone(self.config.batch_size.get()))?;
        old.load_weights(&blob)?;

        self.reset();
        self.init_model()?;

        let cfg = self.net_cfg.as_ref().ok_or_else(uninitialized)?;
        let matches: Vec<_> = old_cfg
            .layers
            .iter()
            .enumerate()
            .filter(|(_, layer)| !layer.name.is_empty())
            .filter_map(|(i, layer)| {
                let j = cfg.layer_index(&layer.name).ok()?;
                Some((i, j, layer.name.clone()))
            })
            .collect();

        for (i, j, name) in matches {
            info!("copying layer {name}");
            let blob = Arc::new(old.save_layer(i)?);

            let pending = self
                .replicas
                .iter_mut()
                .rev()
                .map(|t| {
                    let blob = Arc::clone(&blob);
                    t.dispatch(move |r: &mut R| r.copy_layer(j, &blob))
                })
                .collect();
            wait_all(pending)?;
        }

        self.update.restore(0);
        Ok(())
    }

    /// Tells every replica a new round over the data starts.
    pub fn start_round(&mut self, round: usize) -> Result<()> {
        self.check_live()?;
        let pending = self
            .replicas
            .iter_mut()
            .rev()
            .map(|t| {
                t.dispatch(move |r: &mut R| {
                    r.start_round(round);
                    Ok(())
                })
            })
            .collect();

        wait_all(pending)?;
        Ok(())
    }

    /// Trains every replica on its slice of `batch`.
    ///
    /// A replica failing its step leaves the gradient round half pushed, so the whole pool is
    /// marked as failed and every later call is rejected until `reset`.
    ///
    /// # Errors
    /// A `ResourceInvariant` before initialization or after a failed round, the first replica
    /// failure otherwise.
    pub fn update(&mut self, batch: &DataBatch) -> Result<()> {
        self.check_live()?;
        batch.validate()?;
        let cfg = self.net_cfg.as_ref().ok_or_else(uninitialized)?;
        let labels = label_view(cfg, batch)?;

        let flags = self.update.flags();
        let epoch = self.update.epoch();
        let rows = batch.batch_size();
        let slices = partition(rows, self.replicas.len(), self.config.batch_size.get());

        debug!(
            rows = rows,
            sync = flags.needs_sync,
            push = flags.needs_push,
            epoch = epoch;
            "dispatching training step"
        );

        let pending = self
            .replicas
            .iter_mut()
            .zip(&slices)
            .rev()
            .map(|(t, &range)| {
                let BatchSlice { data, extra, label } = batch.slice(range);
                let step = TrainStep {
                    data,
                    extra,
                    label,
                    predict_only: false,
                    needs_sync: flags.needs_sync,
                    needs_push: flags.needs_push,
                    epoch,
                };
                t.dispatch(move |r: &mut R| r.train_step(step))
            })
            .collect();
        let parts = match wait_all(pending) {
            Ok(parts) => parts,
            Err(e) => {
                // the half pushed round never completes, release whoever waits on it
                error!("training round failed, the replicas must be reset: {e}");
                self.failed = true;
                if let Some(sync) = &self.sync {
                    sync.abort();
                }
                return Err(e);
            }
        };

        // the replicas already trained, the counter stays in step with them
        self.update.advance();

        if self.config.eval_train && !self.train_metric.is_empty() {
            let width = top_width(cfg);
            let out = gather(rows, width, &slices, parts)?;
            self.train_metric.add_eval(out.view(), &labels)?;
        }

        Ok(())
    }

    /// Predicts one value per sample: the output itself for a single output, the index of
    /// the largest output otherwise.
    pub fn predict(&mut self, batch: &DataBatch) -> Result<Array1<f32>> {
        let top = self.top_node()?;
        let out = self.forward_to(batch, top)?;

        Ok(out
            .rows()
            .into_iter()
            .map(|row| match row.len() {
                1 => row[0],
                _ => argmax(row) as f32,
            })
            .collect())
    }

    /// Gathers the activation of `node` for every sample of `batch`.
    ///
    /// # Arguments
    /// * `node` - A node name or a `top[-k]` offset from the output.
    ///
    /// # Errors
    /// An `InvalidReference` if `node` can't be resolved.
    pub fn extract_feature(&mut self, batch: &DataBatch, node: &str) -> Result<Array2<f32>> {
        let cfg = self.net_cfg.as_ref().ok_or_else(uninitialized)?;
        let node = cfg.node_index(&node.parse()?)?;
        self.forward_to(batch, node)
    }

    /// Reports the training metrics gathered since the last call and, if `iter` is given,
    /// the metrics of a full pass over it.
    ///
    /// # Returns
    /// Every metric formatted as `\t<dataset>-<metric>:<value>`.
    pub fn evaluate(&mut self, iter: Option<&mut dyn DataIter>, name: &str) -> Result<String> {
        let mut report = String::new();
        if self.config.eval_train {
            report += &self.train_metric.print("train");
            self.train_metric.clear();
        }

        let Some(iter) = iter else {
            return Ok(report);
        };

        let top = self.top_node()?;
        self.eval_metric.clear();
        iter.before_first();

        while let Some(batch) = iter.next_batch() {
            let out = self.forward_to(batch, top)?;
            let keep = batch.batch_size() - batch.num_batch_padd;

            let cfg = self.net_cfg.as_ref().ok_or_else(uninitialized)?;
            let labels = label_view(cfg, batch)?.head(keep);
            self.eval_metric
                .add_eval(out.slice(s![..keep, ..]), &labels)?;
        }

        report += &self.eval_metric.print(name);
        Ok(report)
    }

    /// Reads a weight tensor of the layer called `layer` from the first replica.
    ///
    /// # Errors
    /// A `Config` error for tags other than `wmat` and `bias`, an `InvalidReference` for
    /// unknown layers.
    pub fn get_weight(&mut self, layer: &str, tag: &str) -> Result<Array2<f32>> {
        let tag: WeightTag = tag.parse()?;
        let layer = self.layer_index(layer)?;
        self.first_replica()?
            .run(move |r: &mut R| r.get_weight(layer, tag))
    }

    /// Overwrites a weight tensor of the layer called `layer` in every replica.
    pub fn set_weight(&mut self, layer: &str, tag: &str, weight: ArrayView2<f32>) -> Result<()> {
        self.check_live()?;
        let tag: WeightTag = tag.parse()?;
        let layer = self.layer_index(layer)?;

        let pending = self
            .replicas
            .iter_mut()
            .rev()
            .map(|t| {
                let weight = weight.to_owned();
                t.dispatch(move |r: &mut R| r.set_weight(layer, tag, weight))
            })
            .collect();

        wait_all(pending)?;
        Ok(())
    }

    /// Tears down the replicas, then the synchronizer.
    pub fn reset(&mut self) {
        if !self.replicas.is_empty() {
            debug!(devices = self.replicas.len(); "tearing down replicas");
        }

        self.replicas.clear();
        self.sync = None;
        self.net_cfg = None;
        self.active = None;
        self.failed = false;
    }

    pub fn epoch_counter(&self) -> i64 {
        self.update.epoch()
    }

    /// The devices of the live replica pool, empty before initialization.
    ///
    /// A `dev` option set afterwards only shows here once the model is initialized again.
    pub fn devices(&self) -> &[usize] {
        self.active.as_deref().unwrap_or(&[])
    }

    pub fn update_state(&self) -> &UpdateState {
        &self.update
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn net_config(&self) -> Option<&NetConfig> {
        self.net_cfg.as_ref()
    }

    fn init_net(&mut self, cfg: NetConfig) -> Result<()> {
        if !self.replicas.is_empty() || self.sync.is_some() {
            return Err(TrainerErr::ResourceInvariant(
                "the replica pool must be empty before initialization",
            ));
        }

        if let Some(metric) = self
            .config
            .metrics
            .iter()
            .find(|metric| !cfg.label_names().contains_key(&metric.field))
        {
            return Err(TrainerErr::config(format!(
                "metric {} reads the label field '{}' the network doesn't declare",
                metric.kind.name(),
                metric.field
            )));
        }

        let batch_size = self.config.batch_size.get();
        let mut devices = self.config.devices.clone();
        shrink_devices(&mut devices, batch_size);
        let step = step_size(batch_size, devices.len());
        let sync = self.init_param_server(&devices)?;

        let replicas = devices
            .iter()
            .enumerate()
            .map(|(i, &device)| {
                let ctx = ReplicaCtx {
                    device,
                    seed: ReplicaCtx::replica_seed(self.config.seed, i),
                    batch_size,
                    step,
                    sync: sync.clone(),
                };
                ReplicaThread::spawn(&cfg, ctx)
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            step = step, synchronized = sync.is_some();
            "replicas initialized on devices {devices}"
        );

        self.replicas = replicas;
        self.sync = sync;
        self.net_cfg = Some(cfg);
        self.active = Some(devices);
        Ok(())
    }

    fn check_live(&self) -> Result<()> {
        match self.failed {
            true => Err(TrainerErr::ResourceInvariant(
                "a training round failed, the replicas must be reset first",
            )),
            false => Ok(()),
        }
    }

    /// Builds the synchronizer `devices` calls for.
    fn init_param_server(&self, devices: &DeviceSet) -> Result<Option<Arc<dyn ParamSync>>> {
        let ndevice = devices.len();

        let kind = match self.config.param_server {
            Some(ParamServerKind::None) if ndevice > 1 => {
                return Err(TrainerErr::config(format!(
                    "param_server=none can't reconcile {ndevice} devices"
                )));
            }
            Some(kind) => kind,
            None if ndevice > 1 => ParamServerKind::Local,
            None => ParamServerKind::None,
        };

        let Some(mut sync) = sync::create(kind) else {
            return Ok(None);
        };

        for (name, value) in &self.history {
            sync.set_option(name, value)?;
        }
        sync.init(devices)?;

        Ok(Some(Arc::from(sync)))
    }

    /// Loads `blob` into every replica from `skip` on.
    fn broadcast_weights(&mut self, blob: Vec<u8>, skip: usize) -> Result<()> {
        let blob = Arc::new(blob);

        let pending = self
            .replicas
            .iter_mut()
            .skip(skip)
            .rev()
            .map(|t| {
                let blob = Arc::clone(&blob);
                t.dispatch(move |r: &mut R| r.load_weights(&blob))
            })
            .collect();

        wait_all(pending)?;
        Ok(())
    }

    /// Runs a prediction-only forward pass and gathers the activation of `node`.
    fn forward_to(&mut self, batch: &DataBatch, node: usize) -> Result<Array2<f32>> {
        self.check_live()?;
        batch.validate()?;
        let cfg = self.net_cfg.as_ref().ok_or_else(uninitialized)?;
        let width = cfg.node_width(node).ok_or_else(|| {
            TrainerErr::reference(format!("node {node} is outside of the network"))
        })?;

        let rows = batch.batch_size();
        let slices = partition(rows, self.replicas.len(), self.config.batch_size.get());

        let pending = self
            .replicas
            .iter_mut()
            .zip(&slices)
            .rev()
            .map(|(t, &range)| {
                let BatchSlice { data, extra, .. } = batch.slice(range);
                t.dispatch(move |r: &mut R| r.predict_step(data, extra))
            })
            .collect();
        wait_all(pending)?;

        let pending = self
            .replicas
            .iter_mut()
            .rev()
            .map(|t| t.dispatch(move |r: &mut R| r.node_activation(node)))
            .collect();
        let parts = wait_all(pending)?;

        gather(rows, width, &slices, parts)
    }

    fn first_replica(&mut self) -> Result<&mut ReplicaThread<R>> {
        self.check_live()?;
        self.replicas.first_mut().ok_or_else(uninitialized)
    }

    fn top_node(&self) -> Result<usize> {
        let cfg = self.net_cfg.as_ref().ok_or_else(uninitialized)?;
        Ok(cfg.num_nodes() - 1)
    }

    fn layer_index(&self, name: &str) -> Result<usize> {
        self.net_cfg
            .as_ref()
            .ok_or_else(uninitialized)?
            .layer_index(name)
    }
}

fn uninitialized() -> TrainerErr {
    TrainerErr::ResourceInvariant("the model must be initialized or loaded first")
}

fn label_view<'a>(cfg: &'a NetConfig, batch: &'a DataBatch) -> Result<LabelView<'a>> {
    LabelView::new(batch.label.view(), cfg.label_names(), cfg.label_ranges())
}

fn top_width(cfg: &NetConfig) -> usize {
    cfg.node_widths().last().copied().unwrap_or(0)
}

/// Stacks the outputs of every replica, given in dispatch order, back into one batch.
fn gather(
    rows: usize,
    width: usize,
    slices: &[SliceRange],
    parts: Vec<Array2<f32>>,
) -> Result<Array2<f32>> {
    let mut out = Array2::zeros((rows, width));

    for (range, part) in slices.iter().zip(parts.into_iter().rev()) {
        if part.dim() != (range.len(), width) {
            return Err(TrainerErr::SizeMismatch {
                what: "replica output",
                got: part.len(),
                expected: range.len() * width,
            });
        }
        out.slice_mut(s![range.range(), ..]).assign(&part);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn test_gather_restores_slice_order() {
        let slices = partition(5, 3, 5);
        // dispatched last replica first
        let parts = vec![array![[4.]], array![[2.], [3.]], array![[0.], [1.]]];

        let out = gather(5, 1, &slices, parts).unwrap();
        assert_eq!(out, array![[0.], [1.], [2.], [3.], [4.]]);
    }

    #[test]
    fn test_gather_rejects_wrong_shapes() {
        let slices = partition(2, 1, 2);
        assert!(gather(2, 1, &slices, vec![array![[0., 1.], [2., 3.]]]).is_err());
    }

    #[test]
    fn test_uninitialized_trainer() {
        let mut trainer = Trainer::new();
        let batch = DataBatch::new(Array2::zeros((1, 1)), Array2::zeros((1, 1))).unwrap();

        for err in [
            trainer.update(&batch).unwrap_err(),
            trainer.predict(&batch).unwrap_err(),
            trainer.extract_feature(&batch, "in").unwrap_err(),
            trainer.get_weight("fc", "wmat").unwrap_err(),
            trainer.save_model(&mut Vec::new()).unwrap_err(),
        ] {
            assert!(matches!(err, TrainerErr::ResourceInvariant(_)), "{err}");
        }

        // no evaluation set and no training metrics still gives an empty report
        assert_eq!(trainer.evaluate(None, "test").unwrap(), "");
    }

    #[test]
    fn test_options_feed_the_config() {
        let mut trainer = Trainer::new();
        trainer.set_option("dev", "cpu:0-2").unwrap();
        trainer.set_option("update_period", "3").unwrap();
        trainer.set_option("metric[aux]", "rmse").unwrap();
        trainer.set_option("layer[fc]", "fullc:2").unwrap();

        assert_eq!(&trainer.config().devices[..], &[0, 1, 2]);
        assert!(trainer.devices().is_empty());
        assert_eq!(trainer.update_state().period().get(), 3);
        assert_eq!(trainer.config().metrics.len(), 1);
        assert_eq!(trainer.history.len(), 4);

        assert!(trainer.set_option("batch_size", "0").is_err());
        assert!(trainer.set_option("param_server", "remote").is_err());
    }

    #[test]
    fn test_init_twice_is_rejected() {
        let mut trainer = Trainer::new();
        for (name, value) in [("input_size", "2"), ("layer[fc]", "fullc:1")] {
            trainer.set_option(name, value).unwrap();
        }

        trainer.init_model().unwrap();
        assert!(matches!(
            trainer.init_model(),
            Err(TrainerErr::ResourceInvariant(_))
        ));

        trainer.reset();
        trainer.init_model().unwrap();
    }
}
