// ============================================================
// Layer 5 — Recurrent Cell
// ============================================================
// A single-step GRU cell composed from two fused Linear
// projections. The epoch runner needs per-step control over the
// recurrence (teacher forcing, greedy rollout, multinomial
// sampling), so the cell exposes one `step` rather than a whole
// sequence forward.
//
// Reference: Cho et al. (2014), GRU gating

use burn::{
    nn::{Linear, LinearConfig},
    prelude::*,
    tensor::activation::sigmoid,
};

#[derive(Config, Debug)]
pub struct GruCellConfig {
    pub d_input: usize,
    pub d_hidden: usize,
}

impl GruCellConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> GruCell<B> {
        GruCell {
            // reset and update gates, fused into one projection
            gates: LinearConfig::new(self.d_input + self.d_hidden, 2 * self.d_hidden)
                .init(device),
            candidate: LinearConfig::new(self.d_input + self.d_hidden, self.d_hidden)
                .init(device),
            d_hidden: self.d_hidden,
        }
    }
}

#[derive(Module, Debug)]
pub struct GruCell<B: Backend> {
    gates: Linear<B>,
    candidate: Linear<B>,
    d_hidden: usize,
}

impl<B: Backend> GruCell<B> {
    /// One recurrence step: ([batch, d_input], [batch, d_hidden])
    /// -> [batch, d_hidden].
    pub fn step(&self, input: Tensor<B, 2>, hidden: Tensor<B, 2>) -> Tensor<B, 2> {
        let batch = input.dims()[0];
        let h = self.d_hidden;

        let joined = Tensor::cat(vec![input.clone(), hidden.clone()], 1);
        let gates = sigmoid(self.gates.forward(joined));
        let reset = gates.clone().slice([0..batch, 0..h]);
        let update = gates.slice([0..batch, h..2 * h]);

        let candidate = self
            .candidate
            .forward(Tensor::cat(vec![input, reset * hidden.clone()], 1))
            .tanh();

        // h' = (1 - z) * n + z * h
        let keep = update.clone().neg().add_scalar(1.0);
        keep * candidate + update * hidden
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestBackend = burn::backend::NdArray;

    #[test]
    fn test_step_shape() {
        let device = Default::default();
        let cell: GruCell<TestBackend> = GruCellConfig::new(8, 16).init(&device);
        let x = Tensor::zeros([4, 8], &device);
        let h = Tensor::zeros([4, 16], &device);
        assert_eq!(cell.step(x, h).dims(), [4, 16]);
    }

    #[test]
    fn test_zero_input_keeps_bounded_state() {
        let device = Default::default();
        let cell: GruCell<TestBackend> = GruCellConfig::new(4, 4).init(&device);
        let mut h = Tensor::<TestBackend, 2>::zeros([1, 4], &device);
        for _ in 0..10 {
            h = cell.step(Tensor::zeros([1, 4], &device), h);
        }
        let values: Vec<f32> = h.into_data().convert::<f32>().value;
        assert!(values.iter().all(|v| v.abs() <= 1.0));
    }
}
