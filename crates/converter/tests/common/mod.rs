#![allow(dead_code)]

use anime4k_converter::{Anime4kCnn, Architecture, Tensor4};

/// Linear congruential stream of nonzero values in `(-1, 1)`
pub struct Weights(u64);

impl Weights {
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    pub fn next(&mut self) -> f32 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let bits = (self.0 >> 40) as u32;
        // odd numerators keep every value away from zero
        ((bits | 1) as f32 / (1u32 << 23) as f32) - 1.0
    }

    pub fn tensor(&mut self, shape: [usize; 4]) -> Tensor4 {
        let data = (0..shape.iter().product::<usize>()).map(|_| self.next()).collect();
        Tensor4::from_vec(shape, data).unwrap()
    }

    pub fn bias(&mut self, len: usize) -> Vec<f32> {
        (0..len).map(|_| self.next()).collect()
    }
}

pub fn arch(num_feat: usize, block_depth: usize, factor: usize, n_stack: usize, tail_kernel: usize) -> Architecture {
    Architecture::new(num_feat, block_depth, factor, n_stack, tail_kernel).unwrap()
}

pub fn model(arch: Architecture) -> Anime4kCnn {
    let mut weights = Weights::new((arch.num_feat * 1000 + arch.block_depth * 100 + arch.factor * 10 + arch.tail_kernel) as u64);
    let head_weight = weights.tensor(arch.head_shape());
    let head_bias = weights.bias(arch.num_feat);
    let mut mid_weights = Vec::new();
    let mut mid_biases = Vec::new();
    for _ in 1..arch.block_depth {
        mid_weights.push(weights.tensor(arch.mid_shape()));
        mid_biases.push(weights.bias(arch.num_feat));
    }
    let tail_weight = weights.tensor(arch.tail_shape());
    let tail_bias = weights.bias(12);
    Anime4kCnn::new(arch, head_weight, head_bias, mid_weights, mid_biases, tail_weight, tail_bias).unwrap()
}

/// Architectures covering every `num_feat` step, both factors and both tail kernels
pub fn coverage_archs() -> Vec<Architecture> {
    vec![arch(4, 2, 1, 2, 3), arch(8, 5, 2, 3, 1), arch(12, 3, 1, 1, 1), arch(16, 2, 2, 2, 3), arch(8, 3, 2, 3, 3)]
}

/// Compares every weight and bias bit for bit
pub fn assert_bit_exact(actual: &Anime4kCnn, expected: &Anime4kCnn) {
    assert_eq!(actual.arch, expected.arch);
    let bits = |values: &[f32]| values.iter().map(|v| v.to_bits()).collect::<Vec<_>>();
    assert_eq!(bits(actual.head_weight.data()), bits(expected.head_weight.data()), "head weight");
    assert_eq!(bits(&actual.head_bias), bits(&expected.head_bias), "head bias");
    assert_eq!(actual.mid_weights.len(), expected.mid_weights.len());
    for (i, (a, e)) in actual.mid_weights.iter().zip(&expected.mid_weights).enumerate() {
        assert_eq!(bits(a.data()), bits(e.data()), "mid[{i}] weight");
    }
    for (i, (a, e)) in actual.mid_biases.iter().zip(&expected.mid_biases).enumerate() {
        assert_eq!(bits(a), bits(e), "mid[{i}] bias");
    }
    assert_eq!(bits(actual.tail_weight.data()), bits(expected.tail_weight.data()), "tail weight");
    assert_eq!(bits(&actual.tail_bias), bits(&expected.tail_bias), "tail bias");
}
