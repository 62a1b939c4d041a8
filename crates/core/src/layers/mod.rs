//! Building blocks shared by the RangeViT encoder, decoder and heads.

pub mod attention;
pub mod block;
pub mod conv;
pub mod mlp;
pub mod spatial;

pub use attention::Attention;
pub use block::{Block, DropPath, LayerScale};
pub use conv::{leaky_relu, ResBlock, ResContextBlock};
pub use mlp::FeedForward;
pub use spatial::{
    avg_pool2d_padded, bilinear_resize, grid_sample_border, grid_size_2d, pad_to_multiple,
    pixel_shuffle, unpad,
};

use candle_core::Result;
use candle_nn::{Init, Linear, VarBuilder};

/// Standard deviation of the truncated-normal style init used for
/// transformer weights and embeddings.
pub const INIT_STD: f64 = 0.02;

/// Linear layer with N(0, 0.02) weights and zero bias.
pub fn vit_linear(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get_with_hints(
        (out_dim, in_dim),
        "weight",
        Init::Randn {
            mean: 0.0,
            stdev: INIT_STD,
        },
    )?;
    let bias = vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?;
    Ok(Linear::new(weight, Some(bias)))
}
