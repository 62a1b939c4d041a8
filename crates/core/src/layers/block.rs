//! Pre-norm transformer block with optional LayerScale and stochastic depth.
//!
//! Weight paths:
//! - `{norm1,norm2}.{weight,bias}`
//! - `attn.{qkv,proj}.{weight,bias}`
//! - `mlp.{fc1,fc2}.{weight,bias}`
//! - `{ls1,ls2}.gamma` (only when LayerScale is enabled)

use candle_core::{Module, Result, Tensor};
use candle_nn::{Init, LayerNorm, VarBuilder};

use super::{Attention, FeedForward};

// ─── LayerScale ───────────────────────────────────────────────────────────

pub struct LayerScale {
    gamma: Tensor,
}

impl LayerScale {
    pub fn new(dim: usize, init_values: f64, vb: VarBuilder) -> Result<Self> {
        let gamma = vb.get_with_hints(dim, "gamma", Init::Const(init_values))?;
        Ok(Self { gamma })
    }
}

impl Module for LayerScale {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        // xs: [B, N, D]; gamma: [D]
        xs.broadcast_mul(&self.gamma)
    }
}

// ─── DropPath ─────────────────────────────────────────────────────────────

/// Per-sample stochastic depth. Identity at inference.
#[derive(Debug, Clone, Copy)]
pub struct DropPath {
    drop_prob: f64,
}

impl DropPath {
    pub fn new(drop_prob: f64) -> Self {
        Self { drop_prob }
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        if !train || self.drop_prob <= 0.0 {
            return Ok(xs.clone());
        }
        let keep_prob = 1.0 - self.drop_prob;
        let mut mask_shape = vec![1usize; xs.rank()];
        mask_shape[0] = xs.dim(0)?;
        let mask = Tensor::rand(0f32, 1f32, mask_shape, xs.device())?
            .ge(self.drop_prob)?
            .to_dtype(xs.dtype())?;
        xs.broadcast_mul(&(mask / keep_prob)?)
    }
}

// ─── Block ────────────────────────────────────────────────────────────────

pub struct Block {
    norm1: LayerNorm,
    attn: Attention,
    ls1: Option<LayerScale>,
    norm2: LayerNorm,
    mlp: FeedForward,
    ls2: Option<LayerScale>,
    drop_path: DropPath,
}

impl Block {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dim: usize,
        num_heads: usize,
        mlp_dim: usize,
        dropout: f64,
        drop_path: f64,
        init_values: Option<f64>,
        layer_norm_eps: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let norm1 = candle_nn::layer_norm(dim, layer_norm_eps, vb.pp("norm1"))?;
        let attn = Attention::new(dim, num_heads, dropout, vb.pp("attn"))?;
        let norm2 = candle_nn::layer_norm(dim, layer_norm_eps, vb.pp("norm2"))?;
        let mlp = FeedForward::new(dim, mlp_dim, dropout, vb.pp("mlp"))?;
        let (ls1, ls2) = match init_values {
            Some(v) if v > 0.0 => (
                Some(LayerScale::new(dim, v, vb.pp("ls1"))?),
                Some(LayerScale::new(dim, v, vb.pp("ls2"))?),
            ),
            _ => (None, None),
        };
        Ok(Self {
            norm1,
            attn,
            ls1,
            norm2,
            mlp,
            ls2,
            drop_path: DropPath::new(drop_path),
        })
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let attn_out = self.attn.forward_t(&self.norm1.forward(xs)?, train)?;
        let attn_out = match &self.ls1 {
            Some(ls) => ls.forward(&attn_out)?,
            None => attn_out,
        };
        let xs = (xs + self.drop_path.forward_t(&attn_out, train)?)?;

        let mlp_out = self.mlp.forward_t(&self.norm2.forward(&xs)?, train)?;
        let mlp_out = match &self.ls2 {
            Some(ls) => ls.forward(&mlp_out)?,
            None => mlp_out,
        };
        xs + self.drop_path.forward_t(&mlp_out, train)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn drop_path_is_identity_at_inference() {
        let device = Device::Cpu;
        let xs = Tensor::randn(0f32, 1.0, (4, 3, 8), &device).unwrap();
        let out = DropPath::new(0.5).forward_t(&xs, false).unwrap();
        let diff = (out - &xs).unwrap().abs().unwrap().max_all().unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn drop_path_zeroes_or_rescales_whole_samples() {
        let device = Device::Cpu;
        let xs = Tensor::ones((16, 3, 4), DType::F32, &device).unwrap();
        let out = DropPath::new(0.5).forward_t(&xs, true).unwrap();
        let per_sample: Vec<f32> = out.sum((1, 2)).unwrap().to_vec1().unwrap();
        for s in per_sample {
            // each sample is either dropped or scaled by 1 / keep_prob
            assert!(s == 0.0 || (s - 24.0).abs() < 1e-4, "unexpected sum {s}");
        }
    }

    #[test]
    fn layer_scale_registers_gamma() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let block = Block::new(16, 2, 64, 0.0, 0.0, Some(1e-5), 1e-5, vb.pp("blk")).unwrap();

        let data = varmap.data().lock().unwrap();
        assert!(data.contains_key("blk.ls1.gamma"));
        assert!(data.contains_key("blk.ls2.gamma"));
        let gamma: Vec<f32> = data["blk.ls1.gamma"].as_tensor().to_vec1().unwrap();
        assert!(gamma.iter().all(|g| (*g - 1e-5).abs() < 1e-9));
        drop(data);

        let xs = Tensor::randn(0f32, 1.0, (2, 5, 16), &device).unwrap();
        assert_eq!(block.forward_t(&xs, false).unwrap().dims(), &[2, 5, 16]);
    }

    #[test]
    fn block_without_layer_scale_has_no_gamma() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        Block::new(16, 2, 64, 0.0, 0.1, None, 1e-5, vb).unwrap();

        let data = varmap.data().lock().unwrap();
        assert!(!data.keys().any(|k| k.contains("gamma")));
        assert!(data.contains_key("attn.qkv.weight"));
        assert_eq!(data["attn.qkv.weight"].as_tensor().dims(), &[48, 16]);
    }
}
