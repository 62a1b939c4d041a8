use candle_core::{Module, Result, Tensor};
use candle_nn::{Dropout, Linear, VarBuilder};

use super::vit_linear;

/// Multi-head self-attention with a fused QKV projection.
///
/// Weight paths: `qkv.{weight,bias}`, `proj.{weight,bias}`.
pub struct Attention {
    qkv: Linear,
    proj: Linear,
    attn_drop: Dropout,
    proj_drop: Dropout,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl Attention {
    pub fn new(dim: usize, num_heads: usize, dropout: f64, vb: VarBuilder) -> Result<Self> {
        let head_dim = dim / num_heads;
        let qkv = vit_linear(dim, dim * 3, vb.pp("qkv"))?;
        let proj = vit_linear(dim, dim, vb.pp("proj"))?;
        Ok(Self {
            qkv,
            proj,
            attn_drop: Dropout::new(dropout as f32),
            proj_drop: Dropout::new(dropout as f32),
            num_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }

    /// `xs`: `[B, N, D]` -> `[B, N, D]`
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let (b, n, _) = xs.dims3()?;
        let qkv = self.qkv.forward(xs)?;
        // [B, N, 3*D] -> [3, B, H, N, head_dim]
        let qkv = qkv
            .reshape((b, n, 3, self.num_heads, self.head_dim))?
            .permute((2, 0, 3, 1, 4))?;
        let q = qkv.narrow(0, 0, 1)?.squeeze(0)?.contiguous()?;
        let k = qkv.narrow(0, 1, 1)?.squeeze(0)?.contiguous()?;
        let v = qkv.narrow(0, 2, 1)?.squeeze(0)?.contiguous()?;

        let attn = q.matmul(&k.t()?)?.affine(self.scale, 0.0)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;
        let attn = self.attn_drop.forward(&attn, train)?;

        let out = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, n, self.num_heads * self.head_dim))?;
        let out = self.proj.forward(&out)?;
        self.proj_drop.forward(&out, train)
    }
}
