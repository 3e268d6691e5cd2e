use super::config::Hyper;
use crate::{Result, TrainerErr};

/// Defines the strategy for updating a layer's parameters from its accumulated gradient.
pub trait Optimizer: Send {
    /// Updates `params` in place.
    ///
    /// # Arguments
    /// * `grad` - The gradient of the loss with respect to `params`.
    /// * `params` - The parameters to update.
    ///
    /// # Returns
    /// An error if there's a mismatch in the sizes of `grad` and `params`.
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()>;
}

/// Picks the optimizer the hyper-parameters describe for a layer of `len` parameters.
pub fn from_hyper(hyper: &Hyper, len: usize) -> Box<dyn Optimizer> {
    if hyper.momentum == 0. {
        Box::new(GradientDescent::new(hyper.eta, hyper.wd))
    } else {
        Box::new(GradientDescentWithMomentum::new(
            len,
            hyper.eta,
            hyper.momentum,
            hyper.wd,
        ))
    }
}

fn check_len(grad: &[f32], params: &[f32]) -> Result<()> {
    if grad.len() != params.len() {
        return Err(TrainerErr::SizeMismatch {
            what: "gradient",
            got: grad.len(),
            expected: params.len(),
        });
    }
    Ok(())
}

#[derive(Debug)]
pub struct GradientDescent {
    learning_rate: f32,
    weight_decay: f32,
}

impl GradientDescent {
    /// Creates a new `GradientDescent` optimizer.
    ///
    /// # Arguments
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `weight_decay` - L2 penalty added to the gradient.
    pub fn new(learning_rate: f32, weight_decay: f32) -> Self {
        Self {
            learning_rate,
            weight_decay,
        }
    }
}

impl Optimizer for GradientDescent {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        check_len(grad, params)?;

        let lr = self.learning_rate;
        let wd = self.weight_decay;

        for (p, g) in params.iter_mut().zip(grad) {
            *p -= lr * (g + wd * *p);
        }

        Ok(())
    }
}

#[derive(Debug)]
pub struct GradientDescentWithMomentum {
    learning_rate: f32,
    momentum: f32,
    weight_decay: f32,
    velocity: Box<[f32]>,
}

impl GradientDescentWithMomentum {
    /// Creates a new `GradientDescentWithMomentum` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `momentum` - Hyperparameter to the optimization algorithm.
    /// * `weight_decay` - L2 penalty added to the gradient.
    pub fn new(len: usize, learning_rate: f32, momentum: f32, weight_decay: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            weight_decay,
            velocity: vec![0.; len].into_boxed_slice(),
        }
    }
}

impl Optimizer for GradientDescentWithMomentum {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        check_len(grad, params)?;

        let lr = self.learning_rate;
        let mu = self.momentum;
        let wd = self.weight_decay;

        params
            .iter_mut()
            .zip(grad)
            .zip(self.velocity.iter_mut())
            .for_each(|((p, g), v)| {
                *v = (mu * *v) + g + wd * *p;
                *p -= lr * *v;
            });

        Ok(())
    }
}
