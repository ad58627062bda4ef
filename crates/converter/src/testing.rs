//! Deterministic models for unit tests

use crate::ir::{Anime4kCnn, Architecture, Tensor4};

/// xorshift32 stream mapped to values in roughly `[-1, 1)`
struct Values(u32);

impl Values {
    fn next(&mut self) -> f32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        // 24 random bits keep every value exactly representable
        (x >> 8) as f32 / (1u32 << 23) as f32 - 1.0
    }

    fn tensor(&mut self, shape: [usize; 4]) -> Tensor4 {
        let data = (0..shape.iter().product::<usize>()).map(|_| self.next()).collect();
        Tensor4::from_vec(shape, data).unwrap()
    }

    fn bias(&mut self, len: usize) -> Vec<f32> {
        (0..len).map(|_| self.next()).collect()
    }
}

pub(crate) fn sample_model(arch: Architecture) -> Anime4kCnn {
    let mut values = Values(0x9e37_79b9 ^ (arch.num_feat as u32) << 8 ^ arch.block_depth as u32);
    let head_weight = values.tensor(arch.head_shape());
    let head_bias = values.bias(arch.num_feat);
    let (mid_weights, mid_biases) = (1..arch.block_depth).map(|_| (values.tensor(arch.mid_shape()), values.bias(arch.num_feat))).unzip();
    let tail_weight = values.tensor(arch.tail_shape());
    let tail_bias = values.bias(12);
    Anime4kCnn::new(arch, head_weight, head_bias, mid_weights, mid_biases, tail_weight, tail_bias).unwrap()
}

pub(crate) fn arch(num_feat: usize, block_depth: usize, factor: usize, n_stack: usize, tail_kernel: usize) -> Architecture {
    Architecture::new(num_feat, block_depth, factor, n_stack, tail_kernel).unwrap()
}
