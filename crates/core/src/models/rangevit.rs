//! Full RangeViT: encoder, up-conv decoder and the optional KPConv head.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use serde::Serialize;
use tracing::info;

use super::decoder::DecoderUpConv;
use super::kpconv::{KPClassifier, PointBatch};
use super::vit::{VisionTransformer, NUM_EXTRA_TOKENS};
use crate::config::{RangeViTConfig, ResolvedConfig};
use crate::error::{RangeViTError, Result};
use crate::layers::{bilinear_resize, pad_to_multiple, unpad};
use crate::loader::{self, LoadReport, SurgeryOptions};

/// The network itself, independent of where its weights come from.
pub struct RangeViTNet {
    encoder: VisionTransformer,
    decoder: DecoderUpConv,
    kpclassifier: Option<KPClassifier>,
    n_cls: usize,
}

impl RangeViTNet {
    pub fn new(cfg: &ResolvedConfig, vb: VarBuilder) -> Result<Self> {
        let encoder = VisionTransformer::new(&cfg.vit, vb.pp("encoder"))?;
        let decoder = DecoderUpConv::new(&cfg.decoder, vb.pp("decoder"))?;
        let kpclassifier = cfg
            .kpconv
            .as_ref()
            .map(|kp| {
                KPClassifier::new(
                    cfg.decoder.d_decoder,
                    cfg.decoder.d_decoder,
                    cfg.n_cls,
                    kp,
                    vb.pp("kpclassifier"),
                )
            })
            .transpose()?;
        Ok(Self {
            encoder,
            decoder,
            kpclassifier,
            n_cls: cfg.n_cls,
        })
    }

    pub fn has_point_head(&self) -> bool {
        self.kpclassifier.is_some()
    }

    pub fn n_cls(&self) -> usize {
        self.n_cls
    }

    /// Pad, encode and strip the class token.
    ///
    /// Returns patch tokens, the stem skip (when the decoder takes one) and
    /// the padded size.
    fn encode(&self, im: &Tensor, train: bool) -> Result<(Tensor, Option<Tensor>, (usize, usize))> {
        let padded = pad_to_multiple(im, self.encoder.patch_size())?;
        let (_, _, hp, wp) = padded.dims4()?;
        let (x, skip) = self.encoder.forward_t(&padded, train)?;
        let n = x.dim(1)?;
        let x = x.narrow(1, NUM_EXTRA_TOKENS, n - NUM_EXTRA_TOKENS)?;
        let skip = self.decoder.uses_skip().then_some(skip);
        Ok((x, skip, (hp, wp)))
    }

    pub fn forward_image(&self, im: &Tensor) -> Result<Tensor> {
        self.forward_image_t(im, false)
    }

    /// `im`: `[B, C, H, W]`. Returns per-pixel logits `[B, n_cls, H, W]`.
    pub fn forward_image_t(&self, im: &Tensor, train: bool) -> Result<Tensor> {
        let (_, _, h, w) = im.dims4()?;
        let (x, skip, padded) = self.encode(im, train)?;
        let masks = self.decoder.forward_t(&x, padded, skip.as_ref(), train)?;
        let masks = bilinear_resize(&masks, padded)?;
        Ok(unpad(&masks, (h, w))?)
    }

    pub fn forward_points(&self, im: &Tensor, points: &PointBatch) -> Result<Tensor> {
        self.forward_points_t(im, points, false)
    }

    /// Per-point logits `[P, n_cls]` from the KPConv head.
    pub fn forward_points_t(&self, im: &Tensor, points: &PointBatch, train: bool) -> Result<Tensor> {
        let kpclassifier = self
            .kpclassifier
            .as_ref()
            .ok_or(RangeViTError::MissingPointHead)?;
        let (_, _, h, w) = im.dims4()?;
        let (x, skip, padded) = self.encode(im, train)?;
        let feats = self
            .decoder
            .forward_features(&x, padded, skip.as_ref(), train)?;
        let feats = unpad(&bilinear_resize(&feats, padded)?, (h, w))?;
        kpclassifier.forward_t(&feats, points, train)
    }
}

/// Trainable parameter counts per component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ParameterStats {
    pub total: usize,
    pub decoder: usize,
    pub stem: usize,
    /// Encoder without its stem.
    pub encoder: usize,
}

/// Number of trainable scalars under `prefix`; BatchNorm running statistics
/// are buffers and do not count.
pub fn count_parameters(varmap: &VarMap, prefix: &str) -> Result<usize> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::Msg("variable map lock poisoned".to_string()))?;
    Ok(data
        .iter()
        .filter(|(name, _)| name.starts_with(prefix))
        .filter(|(name, _)| !name.ends_with(".running_mean") && !name.ends_with(".running_var"))
        .map(|(_, var)| var.elem_count())
        .sum())
}

/// A RangeViT that owns its parameters.
pub struct RangeViT {
    net: RangeViTNet,
    varmap: VarMap,
    config: RangeViTConfig,
    resolved: ResolvedConfig,
    device: Device,
}

impl RangeViT {
    /// Build a freshly initialized model, then load `pretrained_path` if set.
    pub fn new(config: RangeViTConfig, device: &Device, dtype: DType) -> Result<Self> {
        let resolved = config.resolve()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, device);
        let net = RangeViTNet::new(&resolved, vb)?;

        let model = Self {
            net,
            varmap,
            config,
            resolved,
            device: device.clone(),
        };
        let stats = model.parameter_stats()?;
        info!(
            backbone = %model.config.backbone,
            grid = ?model.resolved.vit.grid_size(),
            kpconv = model.net.has_point_head(),
            total = stats.total,
            "Built RangeViT"
        );

        if let Some(path) = model.config.pretrained_path.clone() {
            model.load_pretrained(Path::new(&path))?;
        }
        Ok(model)
    }

    /// Weight surgery plus a non-strict load of a pretrained checkpoint.
    pub fn load_pretrained(&self, path: &Path) -> Result<LoadReport> {
        loader::load_pretrained(
            &self.varmap,
            path,
            SurgeryOptions {
                reuse_pos_emb: self.config.reuse_pos_emb,
            },
            self.resolved.vit.grid_size(),
            &self.device,
        )
    }

    pub fn parameter_stats(&self) -> Result<ParameterStats> {
        let total = count_parameters(&self.varmap, "")?;
        let decoder = count_parameters(&self.varmap, "decoder.")?;
        let stem = count_parameters(&self.varmap, "encoder.patch_embed.")?;
        let encoder = count_parameters(&self.varmap, "encoder.")? - stem;
        Ok(ParameterStats {
            total,
            decoder,
            stem,
            encoder,
        })
    }

    /// Write every parameter to a safetensors file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.varmap.save(path)?;
        Ok(())
    }

    pub fn forward_image(&self, im: &Tensor) -> Result<Tensor> {
        self.net.forward_image(im)
    }

    pub fn forward_points(&self, im: &Tensor, points: &PointBatch) -> Result<Tensor> {
        self.net.forward_points(im, points)
    }

    pub fn net(&self) -> &RangeViTNet {
        &self.net
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn config(&self) -> &RangeViTConfig {
        &self.config
    }

    pub fn resolved(&self) -> &ResolvedConfig {
        &self.resolved
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}
