//! Convolutional stem turning a range image into patch tokens.
//!
//! Weight paths:
//! - `conv_block.{0,1,2}.*` (`ResContextBlock`)
//! - `conv_block.3.*` (`ResBlock`)
//! - `proj_block.1.{weight,bias}` (1x1 projection after average pooling)

use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv2d, VarBuilder};

use crate::config::ViTConfig;
use crate::layers::conv::conv;
use crate::layers::{avg_pool2d_padded, grid_size_2d, ResBlock, ResContextBlock};

const NUM_CONTEXT_BLOCKS: usize = 3;

pub struct ConvStem {
    context_blocks: Vec<ResContextBlock>,
    res_block: ResBlock,
    proj: Conv2d,
    patch_size: (usize, usize),
    patch_stride: (usize, usize),
    grid_size: (usize, usize),
}

impl ConvStem {
    pub fn new(cfg: &ViTConfig, vb: VarBuilder) -> Result<Self> {
        let base = cfg.stem.base_channels;
        let hidden_dim = cfg.stem.hidden_dim;
        let vb_conv = vb.pp("conv_block");

        let mut context_blocks = Vec::with_capacity(NUM_CONTEXT_BLOCKS);
        let mut in_channels = cfg.channels;
        for i in 0..NUM_CONTEXT_BLOCKS {
            context_blocks.push(ResContextBlock::new(in_channels, base, vb_conv.pp(i))?);
            in_channels = base;
        }
        let res_block = ResBlock::new(base, hidden_dim, vb_conv.pp(NUM_CONTEXT_BLOCKS))?;

        // proj_block.0 is the parameter-free average pool
        let proj = conv(hidden_dim, cfg.d_model, 1, 0, 1, vb.pp("proj_block").pp(1))?;

        Ok(Self {
            context_blocks,
            res_block,
            proj,
            patch_size: cfg.patch_size,
            patch_stride: cfg.patch_stride,
            grid_size: cfg.grid_size(),
        })
    }

    /// Token grid of the configured image size.
    pub fn configured_grid(&self) -> (usize, usize) {
        self.grid_size
    }

    pub fn num_patches(&self) -> usize {
        self.grid_size.0 * self.grid_size.1
    }

    pub fn grid_size(&self, h: usize, w: usize) -> (usize, usize) {
        grid_size_2d(h, w, self.patch_size, self.patch_stride)
    }

    /// `im`: `[B, C, H, W]`.
    ///
    /// Returns tokens `[B, GH*GW, D]` and the full-resolution features
    /// `[B, hidden_dim, H, W]`.
    pub fn forward_t(&self, im: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let mut x_base = im.clone();
        for block in &self.context_blocks {
            x_base = block.forward_t(&x_base, train)?;
        }
        let x_base = self.res_block.forward_t(&x_base, train)?;

        let (sh, sw) = self.patch_stride;
        let pooled = avg_pool2d_padded(&x_base, (sh + 1, sw + 1), (sh, sw), (sh / 2, sw / 2))?;
        let tokens = self
            .proj
            .forward(&pooled)?
            .flatten_from(2)?
            .transpose(1, 2)?
            .contiguous()?;
        Ok((tokens, x_base))
    }
}
