use ndarray::{linalg, Array2, ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2, Axis};
use rand::Rng;

use super::{
    config::{Hyper, LayerKind},
    optimizer::{self, Optimizer},
};
use crate::{replica::WeightTag, Result, TrainerErr};

/// A layer of the network, holding its own parameters and gradient.
pub enum Layer {
    Dense(Dense),
    Activation(Activation),
}

impl Layer {
    /// Builds the layer of `kind` fed by `input` features.
    pub fn new(kind: LayerKind, input: usize, hyper: &Hyper) -> Self {
        match kind {
            LayerKind::FullConnected { nhidden } => Layer::Dense(Dense::new((input, nhidden), hyper)),
            LayerKind::Sigmoid => Layer::Activation(Activation::Sigmoid),
            LayerKind::Relu => Layer::Activation(Activation::Relu),
            LayerKind::Tanh => Layer::Activation(Activation::Tanh),
        }
    }

    pub fn forward(&self, x: ArrayView2<f32>) -> Result<Array2<f32>> {
        match self {
            Layer::Dense(l) => l.forward(x),
            Layer::Activation(l) => Ok(l.forward(x)),
        }
    }

    /// Accumulates this layer's gradient and returns the delta for its input.
    ///
    /// # Arguments
    /// * `x` - The input this layer saw on the last forward.
    /// * `a` - The output this layer produced on the last forward.
    /// * `d` - The delta of the loss with respect to `a`.
    pub fn backward(
        &mut self,
        x: ArrayView2<f32>,
        a: ArrayView2<f32>,
        d: Array2<f32>,
    ) -> Result<Array2<f32>> {
        match self {
            Layer::Dense(l) => l.backward(x, d),
            Layer::Activation(l) => Ok(l.backward(a, d)),
        }
    }

    pub fn as_dense(&self) -> Option<&Dense> {
        match self {
            Layer::Dense(l) => Some(l),
            Layer::Activation(_) => None,
        }
    }

    pub fn as_dense_mut(&mut self) -> Option<&mut Dense> {
        match self {
            Layer::Dense(l) => Some(l),
            Layer::Activation(_) => None,
        }
    }
}

/// A fully connected layer, `x · w + b`.
///
/// Parameters are stored flat: the `(input, output)` weight matrix row major, then the biases.
pub struct Dense {
    dim: (usize, usize),
    params: Vec<f32>,
    grad: Vec<f32>,
    optimizer: Box<dyn Optimizer>,
}

impl Dense {
    pub fn new(dim: (usize, usize), hyper: &Hyper) -> Self {
        let size = (dim.0 + 1) * dim.1;

        Self {
            dim,
            params: vec![0.; size],
            grad: vec![0.; size],
            optimizer: optimizer::from_hyper(hyper, size),
        }
    }

    /// Returns the amount of parameters this layer has.
    pub fn size(&self) -> usize {
        self.params.len()
    }

    pub fn params(&self) -> &[f32] {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut [f32] {
        &mut self.params
    }

    pub fn grad(&self) -> &[f32] {
        &self.grad
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(0.);
    }

    /// Xavier uniform weights scaled by `scale`, zero biases.
    pub fn init<R: Rng>(&mut self, rng: &mut R, scale: f32) {
        let (input, output) = self.dim;
        let bound = scale * (6. / (input + output) as f32).sqrt();
        let w_size = input * output;

        self.params[..w_size]
            .iter_mut()
            .for_each(|w| *w = rng.random_range(-bound..=bound));
        self.params[w_size..].fill(0.);
    }

    /// Applies `grad` through the layer's optimizer.
    pub fn apply(&mut self, grad: &[f32]) -> Result<()> {
        self.optimizer.update_params(grad, &mut self.params)
    }

    /// Applies the layer's own accumulated gradient and clears it.
    pub fn apply_own(&mut self) -> Result<()> {
        self.optimizer.update_params(&self.grad, &mut self.params)?;
        self.zero_grad();
        Ok(())
    }

    pub fn forward(&self, x: ArrayView2<f32>) -> Result<Array2<f32>> {
        let (w, b) = self.view_params()?;

        if x.ncols() != self.dim.0 {
            return Err(TrainerErr::SizeMismatch {
                what: "fullc input width",
                got: x.ncols(),
                expected: self.dim.0,
            });
        }

        let mut z = Array2::zeros((x.nrows(), self.dim.1));
        linalg::general_mat_mul(1.0, &x, &w, 0.0, &mut z);
        z += &b;
        Ok(z)
    }

    pub fn backward(&mut self, x: ArrayView2<f32>, d: Array2<f32>) -> Result<Array2<f32>> {
        let (dim, w_size) = (self.dim, self.dim.0 * self.dim.1);

        let (dw_raw, db_raw) = self.grad.split_at_mut(w_size);
        let mut dw = view_mut2(dim, dw_raw)?;
        let mut db = ArrayViewMut1::from_shape(dim.1, db_raw).map_err(|_| shape_err(dim))?;
        linalg::general_mat_mul(1.0, &x.t(), &d, 1.0, &mut dw);
        db += &d.sum_axis(Axis(0));

        let (w, _) = self.view_params()?;
        Ok(d.dot(&w.t()))
    }

    /// Copies out one of the weight tensors.
    pub fn weight(&self, tag: WeightTag) -> Result<Array2<f32>> {
        let (w, b) = self.view_params()?;
        Ok(match tag {
            WeightTag::Wmat => w.to_owned(),
            WeightTag::Bias => b.insert_axis(Axis(0)).to_owned(),
        })
    }

    /// Overwrites one of the weight tensors.
    pub fn set_weight(&mut self, tag: WeightTag, value: ArrayView2<f32>) -> Result<()> {
        let (input, output) = self.dim;
        let w_size = input * output;

        let (expected, dst) = match tag {
            WeightTag::Wmat => ((input, output), &mut self.params[..w_size]),
            WeightTag::Bias => ((1, output), &mut self.params[w_size..]),
        };

        if value.dim() != expected {
            return Err(TrainerErr::SizeMismatch {
                what: "weight shape",
                got: value.len(),
                expected: expected.0 * expected.1,
            });
        }

        dst.iter_mut().zip(value.iter()).for_each(|(p, v)| *p = *v);
        Ok(())
    }

    /// Gives a view of the raw parameter slice as the weights and biases of this layer.
    fn view_params(&self) -> Result<(ArrayView2<'_, f32>, ArrayView1<'_, f32>)> {
        let w_size = self.dim.0 * self.dim.1;
        let w = ArrayView2::from_shape(self.dim, &self.params[..w_size])
            .map_err(|_| shape_err(self.dim))?;
        let b = ArrayView1::from_shape(self.dim.1, &self.params[w_size..])
            .map_err(|_| shape_err(self.dim))?;
        Ok((w, b))
    }
}

fn view_mut2(dim: (usize, usize), raw: &mut [f32]) -> Result<ArrayViewMut2<'_, f32>> {
    ArrayViewMut2::from_shape(dim, raw).map_err(|_| shape_err(dim))
}

fn shape_err(dim: (usize, usize)) -> TrainerErr {
    TrainerErr::SizeMismatch {
        what: "fullc parameters",
        got: 0,
        expected: (dim.0 + 1) * dim.1,
    }
}

/// A parameterless element-wise activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Sigmoid,
    Relu,
    Tanh,
}

impl Activation {
    pub fn forward(&self, x: ArrayView2<f32>) -> Array2<f32> {
        match self {
            Activation::Sigmoid => x.mapv(|z| 1. / (1. + (-z).exp())),
            Activation::Relu => x.mapv(|z| z.max(0.)),
            Activation::Tanh => x.mapv(f32::tanh),
        }
    }

    /// The derivative is computed from the activation's own output `a`.
    pub fn backward(&self, a: ArrayView2<f32>, mut d: Array2<f32>) -> Array2<f32> {
        match self {
            Activation::Sigmoid => d.zip_mut_with(&a, |d, &a| *d *= a * (1. - a)),
            Activation::Relu => d.zip_mut_with(&a, |d, &a| {
                if a <= 0. {
                    *d = 0.
                }
            }),
            Activation::Tanh => d.zip_mut_with(&a, |d, &a| *d *= 1. - a * a),
        }
        d
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    fn dense(params: &[f32]) -> Dense {
        let mut layer = Dense::new((2, 1), &Hyper::default());
        layer.params_mut().copy_from_slice(params);
        layer
    }

    #[test]
    fn test_dense_forward() {
        let layer = dense(&[1., 2., 0.5]);
        let z = layer.forward(array![[1., 1.], [0., 2.]].view()).unwrap();
        assert_eq!(z, array![[3.5], [4.5]]);
    }

    #[test]
    fn test_dense_backward_accumulates() {
        let mut layer = dense(&[1., 2., 0.]);
        let x = array![[1., 3.]];

        let dx = layer.backward(x.view(), array![[2.]]).unwrap();
        assert_eq!(dx, array![[2., 4.]]);
        assert_eq!(layer.grad(), &[2., 6., 2.]);

        layer.backward(x.view(), array![[1.]]).unwrap();
        assert_eq!(layer.grad(), &[3., 9., 3.]);

        layer.zero_grad();
        assert_eq!(layer.grad(), &[0., 0., 0.]);
    }

    #[test]
    fn test_dense_rejects_wrong_width() {
        let layer = dense(&[1., 2., 0.]);
        assert!(layer.forward(array![[1., 2., 3.]].view()).is_err());
    }

    #[test]
    fn test_weights_by_tag() {
        let mut layer = dense(&[1., 2., 0.5]);
        assert_eq!(layer.weight(WeightTag::Wmat).unwrap(), array![[1.], [2.]]);
        assert_eq!(layer.weight(WeightTag::Bias).unwrap(), array![[0.5]]);

        layer
            .set_weight(WeightTag::Bias, array![[3.]].view())
            .unwrap();
        assert_eq!(layer.params(), &[1., 2., 3.]);
        assert!(layer.set_weight(WeightTag::Wmat, array![[1., 2.]].view()).is_err());
    }

    #[test]
    fn test_init_is_seeded() {
        let mut a = Dense::new((3, 2), &Hyper::default());
        let mut b = Dense::new((3, 2), &Hyper::default());
        a.init(&mut StdRng::seed_from_u64(3), 1.);
        b.init(&mut StdRng::seed_from_u64(3), 1.);

        assert_eq!(a.params(), b.params());
        assert!(a.params()[..6].iter().any(|w| *w != 0.));
        assert_eq!(&a.params()[6..], &[0., 0.]);
    }

    #[test]
    fn test_activation_derivatives() {
        let a = Activation::Sigmoid.forward(array![[0.]].view());
        assert_eq!(a, array![[0.5]]);
        assert_eq!(Activation::Sigmoid.backward(a.view(), array![[1.]]), array![[0.25]]);

        let a = Activation::Relu.forward(array![[-1., 2.]].view());
        assert_eq!(Activation::Relu.backward(a.view(), array![[3., 3.]]), array![[0., 3.]]);
    }
}
