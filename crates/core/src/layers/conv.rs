//! Residual convolution blocks used by the conv stem and the up-conv decoder.
//!
//! Every conv is followed by LeakyReLU and then BatchNorm, in that order.

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, VarBuilder};

/// Default negative slope of `LeakyReLU`.
pub const LEAKY_SLOPE: f64 = 0.01;

pub fn leaky_relu(xs: &Tensor) -> Result<Tensor> {
    xs.maximum(&(xs * LEAKY_SLOPE)?)
}

/// Square conv with bias.
pub(crate) fn conv(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    padding: usize,
    dilation: usize,
    vb: VarBuilder,
) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding,
        dilation,
        ..Default::default()
    };
    candle_nn::conv2d(in_channels, out_channels, kernel, cfg, vb)
}

pub(crate) fn batch_norm(num_features: usize, vb: VarBuilder) -> Result<BatchNorm> {
    candle_nn::batch_norm(num_features, BatchNormConfig::default(), vb)
}

/// `bn(leaky_relu(conv(x)))`
pub(crate) fn conv_act_bn(conv: &Conv2d, bn: &BatchNorm, xs: &Tensor, train: bool) -> Result<Tensor> {
    let xs = leaky_relu(&conv.forward(xs)?)?;
    bn.forward_t(&xs, train)
}

// ─── ResContextBlock ──────────────────────────────────────────────────────

/// 1x1 shortcut followed by a 3x3 and a dilated 3x3 conv, summed.
///
/// Weight paths: `conv{1,2,3}.{weight,bias}`, `bn{1,2}.*`.
pub struct ResContextBlock {
    conv1: Conv2d,
    conv2: Conv2d,
    bn1: BatchNorm,
    conv3: Conv2d,
    bn2: BatchNorm,
}

impl ResContextBlock {
    pub fn new(in_filters: usize, out_filters: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            conv1: conv(in_filters, out_filters, 1, 0, 1, vb.pp("conv1"))?,
            conv2: conv(out_filters, out_filters, 3, 1, 1, vb.pp("conv2"))?,
            bn1: batch_norm(out_filters, vb.pp("bn1"))?,
            conv3: conv(out_filters, out_filters, 3, 2, 2, vb.pp("conv3"))?,
            bn2: batch_norm(out_filters, vb.pp("bn2"))?,
        })
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let shortcut = leaky_relu(&self.conv1.forward(xs)?)?;
        let res_a1 = conv_act_bn(&self.conv2, &self.bn1, &shortcut, train)?;
        let res_a2 = conv_act_bn(&self.conv3, &self.bn2, &res_a1, train)?;
        shortcut + res_a2
    }
}

// ─── ResBlock ─────────────────────────────────────────────────────────────

/// Residual block with three receptive fields fused by a 1x1 conv.
///
/// This is the non-pooling variant: spatial size is preserved.
/// Weight paths: `conv{1..5}.{weight,bias}`, `bn{1..4}.*`.
pub struct ResBlock {
    conv1: Conv2d,
    conv2: Conv2d,
    bn1: BatchNorm,
    conv3: Conv2d,
    bn2: BatchNorm,
    conv4: Conv2d,
    bn3: BatchNorm,
    conv5: Conv2d,
    bn4: BatchNorm,
}

impl ResBlock {
    pub fn new(in_filters: usize, out_filters: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            conv1: conv(in_filters, out_filters, 1, 0, 1, vb.pp("conv1"))?,
            conv2: conv(in_filters, out_filters, 3, 1, 1, vb.pp("conv2"))?,
            bn1: batch_norm(out_filters, vb.pp("bn1"))?,
            conv3: conv(out_filters, out_filters, 3, 2, 2, vb.pp("conv3"))?,
            bn2: batch_norm(out_filters, vb.pp("bn2"))?,
            // 2x2 kernel, dilation 2, padding 1 keeps H and W unchanged
            conv4: conv(out_filters, out_filters, 2, 1, 2, vb.pp("conv4"))?,
            bn3: batch_norm(out_filters, vb.pp("bn3"))?,
            conv5: conv(out_filters * 3, out_filters, 1, 0, 1, vb.pp("conv5"))?,
            bn4: batch_norm(out_filters, vb.pp("bn4"))?,
        })
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let shortcut = leaky_relu(&self.conv1.forward(xs)?)?;

        let res_a1 = conv_act_bn(&self.conv2, &self.bn1, xs, train)?;
        let res_a2 = conv_act_bn(&self.conv3, &self.bn2, &res_a1, train)?;
        let res_a3 = conv_act_bn(&self.conv4, &self.bn3, &res_a2, train)?;

        let concat = Tensor::cat(&[res_a1, res_a2, res_a3], 1)?;
        let res_a = conv_act_bn(&self.conv5, &self.bn4, &concat, train)?;
        shortcut + res_a
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn leaky_relu_values() {
        let device = Device::Cpu;
        let xs = Tensor::new(&[-2.0f32, 0.0, 3.0], &device).unwrap();
        let out: Vec<f32> = leaky_relu(&xs).unwrap().to_vec1().unwrap();
        assert!((out[0] + 0.02).abs() < 1e-6);
        assert_eq!(out[1], 0.0);
        assert_eq!(out[2], 3.0);
    }

    #[test]
    fn res_context_block_keeps_spatial_size() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let block = ResContextBlock::new(5, 8, vb).unwrap();

        let xs = Tensor::randn(0f32, 1.0, (2, 5, 8, 24), &device).unwrap();
        let out = block.forward_t(&xs, false).unwrap();
        assert_eq!(out.dims(), &[2, 8, 8, 24]);
    }

    #[test]
    fn res_block_keeps_spatial_size() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let block = ResBlock::new(8, 16, vb).unwrap();

        let xs = Tensor::randn(0f32, 1.0, (1, 8, 6, 20), &device).unwrap();
        let out = block.forward_t(&xs, false).unwrap();
        assert_eq!(out.dims(), &[1, 16, 6, 20]);
    }
}
