//! Model configuration.
//!
//! `RangeViTConfig` is the user-facing description stored as JSON. It is
//! resolved into per-component configs (`ViTConfig`, `DecoderConfig`,
//! `KpConvConfig`) after validation, before any parameter is created.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{RangeViTError, Result};

/// Ratio between the transformer MLP width and the model width.
pub const MLP_EXPANSION_RATIO: usize = 4;

/// Patch size or stride, written either as a single int or as `[h, w]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PatchSpec {
    Square(usize),
    Rect([usize; 2]),
}

impl PatchSpec {
    pub fn dims(self) -> (usize, usize) {
        match self {
            PatchSpec::Square(p) => (p, p),
            PatchSpec::Rect([h, w]) => (h, w),
        }
    }
}

/// Hyperparameters of a named ViT backbone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackboneSpec {
    pub name: &'static str,
    pub n_heads: usize,
    pub n_layers: usize,
    pub patch_size: usize,
    pub dropout: f64,
    pub drop_path_rate: f64,
    pub d_model: usize,
}

const BACKBONES: &[BackboneSpec] = &[BackboneSpec {
    name: "vit_small_patch16_384",
    n_heads: 6,
    n_layers: 12,
    patch_size: 16,
    dropout: 0.0,
    drop_path_rate: 0.1,
    d_model: 384,
}];

/// Look up a backbone by name.
pub fn backbone(name: &str) -> Result<&'static BackboneSpec> {
    BACKBONES
        .iter()
        .find(|b| b.name == name)
        .ok_or_else(|| RangeViTError::UnknownBackbone(name.to_string()))
}

/// KPConv kernel geometry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KpConvConfig {
    /// Number of kernel points.
    pub kernel_size: usize,
    /// Influence distance of each kernel point.
    pub kp_extent: f64,
    /// Radius of the neighborhood the kernel covers.
    pub radius: f64,
}

impl Default for KpConvConfig {
    fn default() -> Self {
        Self {
            kernel_size: 15,
            kp_extent: 1.2,
            radius: 0.6,
        }
    }
}

impl KpConvConfig {
    pub fn validate(&self) -> Result<()> {
        if self.kernel_size == 0 {
            return Err(RangeViTError::InvalidKpConv(
                "kernel_size must be at least 1".to_string(),
            ));
        }
        if self.kp_extent.is_nan() || self.kp_extent <= 0.0 {
            return Err(RangeViTError::InvalidKpConv(format!(
                "kp_extent must be positive, got {}",
                self.kp_extent
            )));
        }
        if self.radius.is_nan() || self.radius <= 0.0 {
            return Err(RangeViTError::InvalidKpConv(format!(
                "radius must be positive, got {}",
                self.radius
            )));
        }
        Ok(())
    }
}

/// User-facing RangeViT configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RangeViTConfig {
    pub in_channels: usize,
    pub n_cls: usize,
    pub backbone: String,
    pub image_size: (usize, usize),
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pretrained_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_patch_size: Option<PatchSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_patch_stride: Option<PatchSpec>,
    pub reuse_pos_emb: bool,
    pub conv_stem: String,
    pub stem_base_channels: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stem_hidden_dim: Option<usize>,
    pub skip_filters: usize,
    pub decoder: String,
    pub up_conv_d_decoder: usize,
    pub up_conv_scale_factor: (usize, usize),
    pub use_kpconv: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ls_init_values: Option<f64>,
    pub kpconv: KpConvConfig,
}

impl Default for RangeViTConfig {
    fn default() -> Self {
        Self {
            in_channels: 5,
            n_cls: 17,
            backbone: "vit_small_patch16_384".to_string(),
            image_size: (32, 384),
            pretrained_path: None,
            new_patch_size: None,
            new_patch_stride: None,
            reuse_pos_emb: false,
            conv_stem: "none".to_string(),
            stem_base_channels: 32,
            stem_hidden_dim: None,
            skip_filters: 0,
            decoder: "up_conv".to_string(),
            up_conv_d_decoder: 64,
            up_conv_scale_factor: (2, 8),
            use_kpconv: false,
            ls_init_values: None,
            kpconv: KpConvConfig::default(),
        }
    }
}

/// Conv stem widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StemConfig {
    pub base_channels: usize,
    pub hidden_dim: usize,
}

/// Encoder configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ViTConfig {
    pub image_size: (usize, usize),
    pub patch_size: (usize, usize),
    pub patch_stride: (usize, usize),
    pub n_layers: usize,
    pub d_model: usize,
    pub d_ff: usize,
    pub n_heads: usize,
    pub dropout: f64,
    pub drop_path_rate: f64,
    pub channels: usize,
    pub ls_init_values: Option<f64>,
    pub stem: StemConfig,
    pub layer_norm_eps: f64,
}

impl ViTConfig {
    /// Token grid of the configured image size.
    pub fn grid_size(&self) -> (usize, usize) {
        (
            self.image_size.0 / self.patch_stride.0,
            self.image_size.1 / self.patch_stride.1,
        )
    }

    pub fn num_patches(&self) -> usize {
        let (gh, gw) = self.grid_size();
        gh * gw
    }

    /// Stochastic depth rate of each block, linearly spaced from 0.
    pub fn drop_path_rates(&self) -> Vec<f64> {
        match self.n_layers {
            0 => Vec::new(),
            1 => vec![0.0],
            n => (0..n)
                .map(|i| self.drop_path_rate * i as f64 / (n - 1) as f64)
                .collect(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.patch_stride != self.patch_size {
            return Err(RangeViTError::InvalidPatch(format!(
                "conv stem requires patch_stride == patch_size, got {:?} and {:?}",
                self.patch_stride, self.patch_size
            )));
        }
        let (sh, sw) = self.patch_stride;
        if sh == 0 || sw == 0 || sh % 2 != 0 || sw % 2 != 0 {
            return Err(RangeViTError::InvalidPatch(format!(
                "patch stride components must be even and non-zero, got {:?}",
                self.patch_stride
            )));
        }
        if self.image_size.0 < sh || self.image_size.1 < sw {
            return Err(RangeViTError::InvalidPatch(format!(
                "image size {:?} is smaller than patch stride {:?}",
                self.image_size, self.patch_stride
            )));
        }
        if self.n_heads == 0 || self.d_model % self.n_heads != 0 {
            return Err(RangeViTError::InvalidPatch(format!(
                "d_model {} is not divisible by {} heads",
                self.d_model, self.n_heads
            )));
        }
        Ok(())
    }
}

/// Up-convolution decoder configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderConfig {
    pub n_cls: usize,
    pub d_encoder: usize,
    pub d_decoder: usize,
    pub patch_size: (usize, usize),
    pub patch_stride: (usize, usize),
    pub scale_factor: (usize, usize),
    pub skip_filters: usize,
}

/// Validated, per-component configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub vit: ViTConfig,
    pub decoder: DecoderConfig,
    pub kpconv: Option<KpConvConfig>,
    pub n_cls: usize,
}

impl RangeViTConfig {
    /// Load a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write the config as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate and split into per-component configs.
    pub fn resolve(&self) -> Result<ResolvedConfig> {
        let spec = backbone(&self.backbone)?;

        match self.conv_stem.as_str() {
            "none" | "ConvStem" => {}
            other => return Err(RangeViTError::UnknownStem(other.to_string())),
        }

        let backbone_patch = (spec.patch_size, spec.patch_size);
        let (patch_size, patch_stride) = match self.new_patch_size {
            Some(size) => {
                let stride = self.new_patch_stride.unwrap_or(size);
                (size.dims(), stride.dims())
            }
            None => (backbone_patch, backbone_patch),
        };

        let stem = StemConfig {
            base_channels: self.stem_base_channels,
            hidden_dim: self
                .stem_hidden_dim
                .unwrap_or(2 * self.stem_base_channels),
        };

        let vit = ViTConfig {
            image_size: self.image_size,
            patch_size,
            patch_stride,
            n_layers: spec.n_layers,
            d_model: spec.d_model,
            d_ff: MLP_EXPANSION_RATIO * spec.d_model,
            n_heads: spec.n_heads,
            dropout: spec.dropout,
            drop_path_rate: spec.drop_path_rate,
            channels: self.in_channels,
            ls_init_values: self.ls_init_values,
            stem,
            layer_norm_eps: 1e-5,
        };
        vit.validate()?;

        let decoder = match self.decoder.as_str() {
            "up_conv" => DecoderConfig {
                n_cls: self.n_cls,
                d_encoder: vit.d_model,
                d_decoder: self.up_conv_d_decoder,
                patch_size: vit.patch_size,
                patch_stride: vit.patch_stride,
                scale_factor: self.up_conv_scale_factor,
                skip_filters: self.skip_filters,
            },
            other => return Err(RangeViTError::UnknownDecoder(other.to_string())),
        };
        validate_skip(&decoder, &stem)?;
        if self.use_kpconv {
            self.kpconv.validate()?;
        }

        Ok(ResolvedConfig {
            vit,
            decoder,
            kpconv: self.use_kpconv.then_some(self.kpconv),
            n_cls: self.n_cls,
        })
    }
}

/// The skip tensor is the full-resolution stem output, so the decoder must
/// upsample back to exactly the input grid and expect the stem width.
pub(crate) fn validate_skip(decoder: &DecoderConfig, stem: &StemConfig) -> Result<()> {
    if decoder.skip_filters == 0 {
        return Ok(());
    }
    if decoder.skip_filters != stem.hidden_dim {
        return Err(RangeViTError::InvalidSkip(format!(
            "skip_filters {} must equal the stem hidden dim {}",
            decoder.skip_filters, stem.hidden_dim
        )));
    }
    if decoder.scale_factor != decoder.patch_stride {
        return Err(RangeViTError::InvalidSkip(format!(
            "scale factor {:?} must equal the patch stride {:?}",
            decoder.scale_factor, decoder.patch_stride
        )));
    }
    Ok(())
}
