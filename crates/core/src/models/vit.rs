//! ViT encoder over conv-stem tokens.
//!
//! Weight paths:
//! - `cls_token [1, 1, D]`, `pos_embed [1, N + 1, D]`
//! - `patch_embed.*` (see [`ConvStem`])
//! - `blocks.{i}.*` (see [`Block`])
//! - `norm.{weight,bias}`

use candle_core::{Module, Result, Tensor};
use candle_nn::{Dropout, Init, LayerNorm, VarBuilder};

use super::stem::ConvStem;
use crate::config::ViTConfig;
use crate::layers::{bilinear_resize, Block, INIT_STD};

/// Tokens prepended to the patch sequence (the class token).
pub const NUM_EXTRA_TOKENS: usize = 1;

pub struct VisionTransformer {
    patch_embed: ConvStem,
    cls_token: Tensor,
    pos_embed: Tensor,
    blocks: Vec<Block>,
    norm: LayerNorm,
    dropout: Dropout,
    config: ViTConfig,
}

impl VisionTransformer {
    pub fn new(cfg: &ViTConfig, vb: VarBuilder) -> Result<Self> {
        let patch_embed = ConvStem::new(cfg, vb.pp("patch_embed"))?;

        let init = Init::Randn {
            mean: 0.0,
            stdev: INIT_STD,
        };
        let cls_token = vb.get_with_hints((1, 1, cfg.d_model), "cls_token", init)?;
        let pos_embed = vb.get_with_hints(
            (1, patch_embed.num_patches() + NUM_EXTRA_TOKENS, cfg.d_model),
            "pos_embed",
            init,
        )?;

        let blocks = cfg
            .drop_path_rates()
            .into_iter()
            .enumerate()
            .map(|(i, dpr)| {
                Block::new(
                    cfg.d_model,
                    cfg.n_heads,
                    cfg.d_ff,
                    cfg.dropout,
                    dpr,
                    cfg.ls_init_values,
                    cfg.layer_norm_eps,
                    vb.pp("blocks").pp(i),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let norm = candle_nn::layer_norm(cfg.d_model, cfg.layer_norm_eps, vb.pp("norm"))?;

        Ok(Self {
            patch_embed,
            cls_token,
            pos_embed,
            blocks,
            norm,
            dropout: Dropout::new(cfg.dropout as f32),
            config: cfg.clone(),
        })
    }

    /// Parameters excluded from weight decay.
    pub fn no_weight_decay() -> &'static [&'static str] {
        &["pos_embed", "cls_token"]
    }

    pub fn grid_size(&self, h: usize, w: usize) -> (usize, usize) {
        self.patch_embed.grid_size(h, w)
    }

    pub fn patch_size(&self) -> (usize, usize) {
        self.config.patch_size
    }

    pub fn forward(&self, im: &Tensor) -> Result<(Tensor, Tensor)> {
        self.forward_t(im, false)
    }

    /// `im`: `[B, C, H, W]`.
    ///
    /// Returns normalized tokens `[B, 1 + GH*GW, D]` (class token first) and
    /// the stem's full-resolution features for the decoder skip.
    pub fn forward_t(&self, im: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let (b, _, h, w) = im.dims4()?;
        let (tokens, skip) = self.patch_embed.forward_t(im, train)?;
        let d = self.config.d_model;

        let cls = self.cls_token.broadcast_as((b, 1, d))?;
        let x = Tensor::cat(&[&cls, &tokens], 1)?;

        let grid = self.grid_size(h, w);
        let pos_embed = if grid == self.patch_embed.configured_grid() {
            self.pos_embed.clone()
        } else {
            resize_pos_embed(
                &self.pos_embed,
                self.patch_embed.configured_grid(),
                grid,
                NUM_EXTRA_TOKENS,
            )?
        };
        let x = x.broadcast_add(&pos_embed)?;
        let mut x = self.dropout.forward(&x, train)?;

        for block in &self.blocks {
            x = block.forward_t(&x, train)?;
        }
        Ok((self.norm.forward(&x)?, skip))
    }
}

/// Bilinearly resize the grid part of a positional embedding
/// `[1, extra + old_h*old_w, D]` to `[1, extra + new_h*new_w, D]`.
/// The leading `num_extra_tokens` slots are kept as they are.
pub fn resize_pos_embed(
    pos_embed: &Tensor,
    old_grid: (usize, usize),
    new_grid: (usize, usize),
    num_extra_tokens: usize,
) -> Result<Tensor> {
    let (_, n, d) = pos_embed.dims3()?;
    let tok = pos_embed.narrow(1, 0, num_extra_tokens)?;
    let grid = pos_embed
        .narrow(1, num_extra_tokens, n - num_extra_tokens)?
        .reshape((1, old_grid.0, old_grid.1, d))?
        .permute((0, 3, 1, 2))?;
    let grid = bilinear_resize(&grid, new_grid)?
        .permute((0, 2, 3, 1))?
        .reshape((1, new_grid.0 * new_grid.1, d))?;
    Tensor::cat(&[&tok, &grid], 1)
}
