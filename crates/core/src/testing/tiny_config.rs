use candle_core::{Device, Result, Tensor};

use crate::config::{DecoderConfig, KpConvConfig, ResolvedConfig, StemConfig, ViTConfig};
use crate::models::PointBatch;

/// Create a tiny encoder config: 8x32 range image, 2x8 patches (4x4 grid),
/// 2 layers of width 32.
pub fn tiny_vit_config() -> ViTConfig {
    ViTConfig {
        image_size: (8, 32),
        patch_size: (2, 8),
        patch_stride: (2, 8),
        n_layers: 2,
        d_model: 32,
        d_ff: 128,
        n_heads: 4,
        dropout: 0.0,
        drop_path_rate: 0.1,
        channels: 5,
        ls_init_values: None,
        stem: StemConfig {
            base_channels: 4,
            hidden_dim: 8,
        },
        layer_norm_eps: 1e-5,
    }
}

/// Full tiny RangeViT config with 3 classes and a 16-wide decoder.
///
/// With `skip` the stem output is concatenated in the decoder.
pub fn tiny_resolved_config(use_kpconv: bool, skip: bool) -> ResolvedConfig {
    let vit = tiny_vit_config();
    let decoder = DecoderConfig {
        n_cls: 3,
        d_encoder: vit.d_model,
        d_decoder: 16,
        patch_size: vit.patch_size,
        patch_stride: vit.patch_stride,
        scale_factor: (2, 8),
        skip_filters: if skip { vit.stem.hidden_dim } else { 0 },
    };
    ResolvedConfig {
        vit,
        decoder,
        kpconv: use_kpconv.then(|| KpConvConfig {
            kernel_size: 5,
            ..KpConvConfig::default()
        }),
        n_cls: 3,
    }
}

/// Random points for `num_points.len()` samples with `k` neighbors each.
///
/// The last neighbor slot of every point is a shadow index.
pub fn random_point_batch(num_points: &[usize], k: usize, device: &Device) -> Result<PointBatch> {
    let total: usize = num_points.iter().sum();
    let px = Tensor::rand(-1f32, 1f32, total, device)?;
    let py = Tensor::rand(-1f32, 1f32, total, device)?;
    let pxyz = Tensor::randn(0f32, 1.0, (total, 3), device)?;

    let mut knn = Vec::with_capacity(total * k);
    for &n in num_points {
        for i in 0..n {
            for j in 0..k {
                let idx = if j + 1 == k { n } else { (i + j) % n };
                knn.push(idx as u32);
            }
        }
    }
    let pknn = Tensor::from_vec(knn, (total, k), device)?;

    Ok(PointBatch {
        px,
        py,
        pxyz,
        pknn,
        num_points: num_points.to_vec(),
    })
}
