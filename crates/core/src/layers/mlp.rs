use candle_core::{Module, Result, Tensor};
use candle_nn::{Dropout, Linear, VarBuilder};

use super::vit_linear;

/// Transformer feed-forward: `fc1 -> GELU -> dropout -> fc2 -> dropout`.
pub struct FeedForward {
    fc1: Linear,
    fc2: Linear,
    drop: Dropout,
}

impl FeedForward {
    pub fn new(dim: usize, hidden_dim: usize, dropout: f64, vb: VarBuilder) -> Result<Self> {
        let fc1 = vit_linear(dim, hidden_dim, vb.pp("fc1"))?;
        let fc2 = vit_linear(hidden_dim, dim, vb.pp("fc2"))?;
        Ok(Self {
            fc1,
            fc2,
            drop: Dropout::new(dropout as f32),
        })
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.fc1.forward(xs)?.gelu_erf()?;
        let xs = self.drop.forward(&xs, train)?;
        let xs = self.fc2.forward(&xs)?;
        self.drop.forward(&xs, train)
    }
}
