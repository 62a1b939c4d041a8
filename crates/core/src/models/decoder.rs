//! Up-convolution decoder: tokens back to a dense feature map.
//!
//! Weight paths:
//! - `up_conv_block.conv_upsample.{weight,bias}`
//! - `up_conv_block.conv{1,2,3,4}.{weight,bias}`, `up_conv_block.bn{1..4}.*`
//! - `head.{weight,bias}`

use candle_core::{Module, Result, Tensor};
use candle_nn::{BatchNorm, Conv2d, VarBuilder};

use crate::config::DecoderConfig;
use crate::layers::conv::{batch_norm, conv, conv_act_bn};
use crate::layers::{grid_size_2d, pixel_shuffle};

// ─── UpConvBlock ──────────────────────────────────────────────────────────

/// 1x1 conv to `out * s0 * s1` channels, pixel shuffle by `(s0, s1)`,
/// optional skip concat, then a three-branch residual fusion.
pub struct UpConvBlock {
    conv_upsample: Conv2d,
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: Conv2d,
    bn2: BatchNorm,
    conv3: Conv2d,
    bn3: BatchNorm,
    conv4: Conv2d,
    bn4: BatchNorm,
    scale_factor: (usize, usize),
    skip_filters: usize,
}

impl UpConvBlock {
    pub fn new(
        in_filters: usize,
        out_filters: usize,
        scale_factor: (usize, usize),
        skip_filters: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let upsample_filters = out_filters * scale_factor.0 * scale_factor.1;
        Ok(Self {
            conv_upsample: conv(in_filters, upsample_filters, 1, 0, 1, vb.pp("conv_upsample"))?,
            conv1: conv(out_filters + skip_filters, out_filters, 3, 1, 1, vb.pp("conv1"))?,
            bn1: batch_norm(out_filters, vb.pp("bn1"))?,
            conv2: conv(out_filters, out_filters, 3, 2, 2, vb.pp("conv2"))?,
            bn2: batch_norm(out_filters, vb.pp("bn2"))?,
            conv3: conv(out_filters, out_filters, 2, 1, 2, vb.pp("conv3"))?,
            bn3: batch_norm(out_filters, vb.pp("bn3"))?,
            conv4: conv(out_filters * 3, out_filters, 1, 0, 1, vb.pp("conv4"))?,
            bn4: batch_norm(out_filters, vb.pp("bn4"))?,
            scale_factor,
            skip_filters,
        })
    }

    pub fn forward_t(&self, xs: &Tensor, skip: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let up_a = self.conv_upsample.forward(xs)?;
        let up_a = pixel_shuffle(&up_a, self.scale_factor)?;

        let up_b = match (self.skip_filters, skip) {
            (0, _) => up_a,
            (_, Some(skip)) => Tensor::cat(&[&up_a, skip], 1)?,
            (n, None) => candle_core::bail!("decoder expects a {n}-channel skip tensor"),
        };

        let up_e1 = conv_act_bn(&self.conv1, &self.bn1, &up_b, train)?;
        let up_e2 = conv_act_bn(&self.conv2, &self.bn2, &up_e1, train)?;
        let up_e3 = conv_act_bn(&self.conv3, &self.bn3, &up_e2, train)?;

        let concat = Tensor::cat(&[up_e1, up_e2, up_e3], 1)?;
        conv_act_bn(&self.conv4, &self.bn4, &concat, train)
    }
}

// ─── DecoderUpConv ────────────────────────────────────────────────────────

pub struct DecoderUpConv {
    up_conv_block: UpConvBlock,
    head: Conv2d,
    config: DecoderConfig,
}

impl DecoderUpConv {
    pub fn new(cfg: &DecoderConfig, vb: VarBuilder) -> Result<Self> {
        let up_conv_block = UpConvBlock::new(
            cfg.d_encoder,
            cfg.d_decoder,
            cfg.scale_factor,
            cfg.skip_filters,
            vb.pp("up_conv_block"),
        )?;
        let head = conv(cfg.d_decoder, cfg.n_cls, 1, 0, 1, vb.pp("head"))?;
        Ok(Self {
            up_conv_block,
            head,
            config: cfg.clone(),
        })
    }

    pub fn uses_skip(&self) -> bool {
        self.config.skip_filters > 0
    }

    /// `x`: patch tokens `[B, GH*GW, D]` without extra tokens, `im_size`: the
    /// (padded) input size they were computed from.
    ///
    /// Returns `[B, d_decoder, GH*s0, GW*s1]`.
    pub fn forward_features(
        &self,
        x: &Tensor,
        im_size: (usize, usize),
        skip: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let (b, _, d) = x.dims3()?;
        let (gh, gw) = grid_size_2d(
            im_size.0,
            im_size.1,
            self.config.patch_size,
            self.config.patch_stride,
        );
        // 'b (h w) c -> b c h w'
        let x = x.transpose(1, 2)?.contiguous()?.reshape((b, d, gh, gw))?;
        self.up_conv_block.forward_t(&x, skip, train)
    }

    /// Per-pixel class logits `[B, n_cls, GH*s0, GW*s1]`.
    pub fn forward_t(
        &self,
        x: &Tensor,
        im_size: (usize, usize),
        skip: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let feats = self.forward_features(x, im_size, skip, train)?;
        self.head.forward(&feats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::tiny_resolved_config;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn decoder_upsamples_to_image_size() {
        let device = Device::Cpu;
        let cfg = tiny_resolved_config(false, false).decoder;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let decoder = DecoderUpConv::new(&cfg, vb).unwrap();
        assert!(!decoder.uses_skip());

        // 8x32 image, 2x8 patches -> 4x4 tokens
        let x = Tensor::randn(0f32, 1.0, (2, 16, 32), &device).unwrap();
        let feats = decoder.forward_features(&x, (8, 32), None, false).unwrap();
        assert_eq!(feats.dims(), &[2, 16, 8, 32]);
        let logits = decoder.forward_t(&x, (8, 32), None, false).unwrap();
        assert_eq!(logits.dims(), &[2, 3, 8, 32]);
    }

    #[test]
    fn decoder_with_skip_connection() {
        let device = Device::Cpu;
        let cfg = tiny_resolved_config(false, true).decoder;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let decoder = DecoderUpConv::new(&cfg, vb).unwrap();

        {
            let data = varmap.data().lock().unwrap();
            // d_decoder + skip channels in, d_decoder out
            assert_eq!(
                data["up_conv_block.conv1.weight"].as_tensor().dims(),
                &[16, 24, 3, 3]
            );
            assert_eq!(
                data["up_conv_block.conv_upsample.weight"].as_tensor().dims(),
                &[16 * 16, 32, 1, 1]
            );
            assert_eq!(data["head.weight"].as_tensor().dims(), &[3, 16, 1, 1]);
        }

        let x = Tensor::randn(0f32, 1.0, (1, 16, 32), &device).unwrap();
        let skip = Tensor::randn(0f32, 1.0, (1, 8, 8, 32), &device).unwrap();
        let logits = decoder.forward_t(&x, (8, 32), Some(&skip), false).unwrap();
        assert_eq!(logits.dims(), &[1, 3, 8, 32]);
    }

    #[test]
    fn decoder_without_required_skip_fails() {
        let device = Device::Cpu;
        let cfg = tiny_resolved_config(false, true).decoder;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let decoder = DecoderUpConv::new(&cfg, vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, (1, 16, 32), &device).unwrap();
        assert!(decoder.forward_t(&x, (8, 32), None, false).is_err());
    }
}
