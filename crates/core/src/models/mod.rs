//! RangeViT model components.
//!
//! Parameter paths follow the reference checkpoints: `encoder.*`,
//! `decoder.*` and `kpclassifier.*` at the top level.

pub mod decoder;
pub mod kpconv;
pub mod rangevit;
pub mod stem;
pub mod vit;

pub use decoder::{DecoderUpConv, UpConvBlock};
pub use kpconv::{kernel_points, KPClassifier, KPConv, PointBatch};
pub use rangevit::{count_parameters, ParameterStats, RangeViT, RangeViTNet};
pub use stem::ConvStem;
pub use vit::{resize_pos_embed, VisionTransformer, NUM_EXTRA_TOKENS};

use candle_nn::VarBuilder;

use crate::config::ResolvedConfig;
use crate::error::Result;

/// Build the network for `cfg` over any weight source, e.g. the
/// memory-mapped `VarBuilder` from [`crate::loader::load_weights`].
pub fn from_config(cfg: &ResolvedConfig, vb: VarBuilder) -> Result<RangeViTNet> {
    RangeViTNet::new(cfg, vb)
}
