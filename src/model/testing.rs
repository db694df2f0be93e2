//! Fixtures shared by the model tests: hand-set layers and small bags.

use candle_core::{Device, Tensor};
use candle_nn as nn;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::classifier::{Activation, Classifier, Dense};

pub fn matrix(rows: &[&[f32]]) -> Tensor {
    let n = rows.len();
    let d = rows.first().map_or(0, |r| r.len());
    let flat: Vec<f32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
    Tensor::from_vec(flat, (n, d), &Device::Cpu).unwrap()
}

/// Dense layer with `weight` given as `[out][in]` rows.
pub fn dense(weight: &[&[f32]], bias: &[f32], activation: Activation) -> Dense {
    let w = matrix(weight);
    let b = Tensor::new(bias, &Device::Cpu).unwrap();
    Dense::from_linear(nn::Linear::new(w, Some(b)), activation).unwrap()
}

pub fn boxed(layer: Dense) -> Box<dyn Classifier> {
    Box::new(layer)
}

pub fn identity(dim: usize) -> Dense {
    let rows: Vec<Vec<f32>> = (0..dim)
        .map(|i| (0..dim).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect();
    let refs: Vec<&[f32]> = rows.iter().map(|r| r.as_slice()).collect();
    dense(&refs, &vec![0.0; dim], Activation::Identity)
}

pub fn random_bag(seed: u64, n_patches: usize, dim: usize) -> Tensor {
    let mut rng = StdRng::seed_from_u64(seed);
    let data: Vec<f32> = (0..n_patches * dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
    Tensor::from_vec(data, (n_patches, dim), &Device::Cpu).unwrap()
}
