//! Weight initializers.

use crate::tensor::Tensor;
use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::Rng;

pub fn zeros(shape: &[usize]) -> Tensor {
    Tensor::zeros(shape)
}

pub fn ones(shape: &[usize]) -> Tensor {
    Tensor::ones(shape)
}

pub fn constant(shape: &[usize], value: f32) -> Tensor {
    Tensor::full(shape, value)
}

/// Samples from `U(low, high)` with the thread-local generator.
pub fn uniform(shape: &[usize], low: f32, high: f32) -> Tensor {
    uniform_with_rng(shape, low, high, &mut rand::thread_rng())
}

/// Samples from `U(low, high)` with the given generator. A degenerate range
/// yields a constant tensor.
pub fn uniform_with_rng<R: Rng + ?Sized>(shape: &[usize], low: f32, high: f32, rng: &mut R) -> Tensor {
    if low >= high {
        return constant(shape, low);
    }
    Tensor::from_array(ArrayD::random_using(IxDyn(shape), Uniform::new(low, high), rng))
}

/// Kaiming/MSRA uniform initialization for ReLU networks: `U(-b, b)` with
/// `b = sqrt(6 / fan_in)`.
pub fn msra_uniform(shape: &[usize], fan_in: usize) -> Tensor {
    let bound = (6.0 / fan_in.max(1) as f32).sqrt();
    uniform(shape, -bound, bound)
}
