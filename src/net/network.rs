use log::debug;
use ndarray::{s, Array2, ArrayView2, Axis};
use rand::{rngs::StdRng, SeedableRng};

use super::{
    config::{LossKind, NetConfig},
    layers::Layer,
};
use crate::{
    replica::{Replica, ReplicaCtx, TrainStep, WeightTag},
    stream::{put_f32s, take_f32s},
    Result, TrainerErr,
};

/// A feed forward network: information flows forward through its nodes when computing an
/// output and backward when accumulating the gradients of its layers.
pub struct Network {
    cfg: NetConfig,
    ctx: ReplicaCtx,
    layers: Vec<Layer>,
    /// Activations of the last forward pass, input first, before the loss transform.
    nodes: Vec<Array2<f32>>,
    /// The output node after the loss transform.
    output: Array2<f32>,
    /// Buffer synchronized gradients are pulled into.
    pulled: Vec<f32>,
    /// A gradient round was pushed but not yet applied.
    in_flight: bool,
    round: usize,
    epoch: i64,
    rng: StdRng,
}

impl Network {
    /// Gives the layers of this network.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn round(&self) -> usize {
        self.round
    }

    /// The epoch of the last training step this network ran.
    pub fn epoch(&self) -> i64 {
        self.epoch
    }

    fn layer_mut(&mut self, layer: usize) -> Result<&mut Layer> {
        let nlayers = self.layers.len();
        self.layers.get_mut(layer).ok_or_else(|| {
            TrainerErr::reference(format!("layer {layer} is out of range, there are {nlayers}"))
        })
    }

    fn forward(&mut self, data: Array2<f32>, extra: &[Array2<f32>]) -> Result<()> {
        let rows = data.nrows();
        if let Some(aux) = extra.iter().find(|aux| aux.nrows() != rows) {
            return Err(TrainerErr::SizeMismatch {
                what: "auxiliary input rows",
                got: aux.nrows(),
                expected: rows,
            });
        }

        self.nodes[0] = data;
        for i in 0..self.layers.len() {
            let next = self.layers[i].forward(self.nodes[i].view())?;
            self.nodes[i + 1] = next;
        }

        let top = self.nodes[self.layers.len()].view();
        self.output = match self.cfg.loss {
            LossKind::Mse => top.to_owned(),
            LossKind::Softmax => softmax(top),
        };

        Ok(())
    }

    /// Accumulates the gradient of the loss of the last forward pass against `label`.
    fn backward(&mut self, label: ArrayView2<f32>) -> Result<()> {
        let &(begin, end) = self
            .cfg
            .label_ranges()
            .first()
            .ok_or_else(|| TrainerErr::config("the network declares no label field"))?;

        if end > label.ncols() {
            return Err(TrainerErr::SizeMismatch {
                what: "label width",
                got: label.ncols(),
                expected: end,
            });
        }

        let target = label.slice(s![.., begin..end]);
        let mut d = self.loss_delta(target)?;
        d *= 1. / self.ctx.batch_size as f32;

        for i in (0..self.layers.len()).rev() {
            d = self.layers[i].backward(self.nodes[i].view(), self.nodes[i + 1].view(), d)?;
        }

        Ok(())
    }

    /// The derivative of the loss with respect to the output layer's raw activation.
    fn loss_delta(&self, target: ArrayView2<f32>) -> Result<Array2<f32>> {
        let width = self.output.ncols();

        match self.cfg.loss {
            LossKind::Mse => {
                if target.ncols() != width {
                    return Err(TrainerErr::SizeMismatch {
                        what: "mse label width",
                        got: target.ncols(),
                        expected: width,
                    });
                }
                Ok(&self.output - &target)
            }
            LossKind::Softmax => {
                let mut d = self.output.clone();
                for (mut row, class) in d.rows_mut().into_iter().zip(target.column(0)) {
                    if !(0. ..width as f32).contains(class) {
                        return Err(TrainerErr::SizeMismatch {
                            what: "softmax class index",
                            got: *class as usize,
                            expected: width,
                        });
                    }
                    row[*class as usize] -= 1.;
                }
                Ok(d)
            }
        }
    }

    /// Commits the accumulated gradient, to the synchronizer if there's one.
    fn push(&mut self) -> Result<()> {
        let device = self.ctx.device;

        match &self.ctx.sync {
            Some(sync) => {
                for (key, layer) in self.layers.iter_mut().enumerate() {
                    if let Some(dense) = layer.as_dense_mut() {
                        sync.push(key, device, dense.grad())?;
                        dense.zero_grad();
                    }
                }
                self.in_flight = true;
            }
            None => {
                for dense in self.layers.iter_mut().filter_map(Layer::as_dense_mut) {
                    dense.apply_own()?;
                }
            }
        }

        Ok(())
    }

    /// Applies the pending synchronized round, if any.
    fn settle(&mut self) -> Result<()> {
        if !self.in_flight {
            return Ok(());
        }

        let device = self.ctx.device;
        if let Some(sync) = &self.ctx.sync {
            for (key, layer) in self.layers.iter_mut().enumerate() {
                let Some(dense) = layer.as_dense_mut() else {
                    continue;
                };

                self.pulled.resize(dense.size(), 0.);
                if sync.pull(key, device, &mut self.pulled)? {
                    dense.apply(&self.pulled)?;
                }
            }
        }

        self.in_flight = false;
        Ok(())
    }
}

impl Replica for Network {
    fn create(cfg: &NetConfig, ctx: ReplicaCtx) -> Result<Self> {
        let widths = cfg.node_widths();
        let layers = cfg
            .layers
            .iter()
            .zip(&widths)
            .map(|(layer, &input)| Layer::new(layer.kind, input, &cfg.hyper))
            .collect();

        let nodes = widths.iter().map(|&w| Array2::zeros((0, w))).collect();
        let output = Array2::zeros((0, widths[widths.len() - 1]));
        let rng = StdRng::seed_from_u64(ctx.seed);

        debug!(
            device = ctx.device,
            step = ctx.step,
            seed = ctx.seed,
            layers = cfg.layers.len();
            "network replica created"
        );

        Ok(Self {
            cfg: cfg.clone(),
            ctx,
            layers,
            nodes,
            output,
            pulled: Vec::new(),
            in_flight: false,
            round: 0,
            epoch: 0,
            rng,
        })
    }

    fn init_weights(&mut self) -> Result<()> {
        let scale = self.cfg.hyper.init_scale;
        for dense in self.layers.iter_mut().filter_map(Layer::as_dense_mut) {
            dense.init(&mut self.rng, scale);
            dense.zero_grad();
        }

        self.in_flight = false;
        Ok(())
    }

    fn load_weights(&mut self, blob: &[u8]) -> Result<()> {
        self.settle()?;

        let mut rest = blob;
        for dense in self.layers.iter_mut().filter_map(Layer::as_dense_mut) {
            rest = take_f32s(rest, dense.params_mut())?;
            dense.zero_grad();
        }

        if !rest.is_empty() {
            return Err(TrainerErr::SizeMismatch {
                what: "weight blob",
                got: blob.len(),
                expected: blob.len() - rest.len(),
            });
        }

        Ok(())
    }

    fn save_weights(&mut self) -> Result<Vec<u8>> {
        self.settle()?;

        let mut blob = Vec::new();
        for dense in self.layers.iter().filter_map(Layer::as_dense) {
            put_f32s(&mut blob, dense.params());
        }

        Ok(blob)
    }

    fn save_layer(&mut self, layer: usize) -> Result<Vec<u8>> {
        self.settle()?;

        let mut blob = Vec::new();
        if let Some(dense) = self.layer_mut(layer)?.as_dense() {
            put_f32s(&mut blob, dense.params());
        }

        Ok(blob)
    }

    fn copy_layer(&mut self, layer: usize, blob: &[u8]) -> Result<()> {
        self.settle()?;

        let rest = match self.layer_mut(layer)?.as_dense_mut() {
            Some(dense) => take_f32s(blob, dense.params_mut())?,
            None => blob,
        };

        if !rest.is_empty() {
            return Err(TrainerErr::SizeMismatch {
                what: "layer blob",
                got: blob.len(),
                expected: blob.len() - rest.len(),
            });
        }

        Ok(())
    }

    fn start_round(&mut self, round: usize) {
        self.round = round;
    }

    fn train_step(&mut self, step: TrainStep) -> Result<Array2<f32>> {
        self.epoch = step.epoch;

        if step.needs_sync {
            self.settle()?;
        }

        let rows = step.data.nrows();
        self.forward(step.data, &step.extra)?;

        if !step.predict_only {
            if rows > 0 {
                self.backward(step.label.view())?;
            }
            if step.needs_push {
                self.push()?;
            }
        }

        Ok(self.output.clone())
    }

    fn predict_step(&mut self, data: Array2<f32>, extra: Vec<Array2<f32>>) -> Result<()> {
        self.settle()?;
        self.forward(data, &extra)
    }

    fn node_activation(&self, node: usize) -> Result<Array2<f32>> {
        let top = self.layers.len();

        match node {
            n if n == top => Ok(self.output.clone()),
            n if n < top => Ok(self.nodes[n].clone()),
            n => Err(TrainerErr::reference(format!(
                "node {n} is out of range, there are {}",
                top + 1
            ))),
        }
    }

    fn get_weight(&mut self, layer: usize, tag: WeightTag) -> Result<Array2<f32>> {
        self.settle()?;

        self.layer_mut(layer)?
            .as_dense()
            .ok_or_else(|| TrainerErr::reference(format!("layer {layer} has no weights")))?
            .weight(tag)
    }

    fn set_weight(&mut self, layer: usize, tag: WeightTag, weight: Array2<f32>) -> Result<()> {
        self.settle()?;

        self.layer_mut(layer)?
            .as_dense_mut()
            .ok_or_else(|| TrainerErr::reference(format!("layer {layer} has no weights")))?
            .set_weight(tag, weight.view())
    }
}

/// Row-wise softmax.
fn softmax(z: ArrayView2<f32>) -> Array2<f32> {
    let mut out = z.to_owned();

    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row /= sum;
    }

    out
}
