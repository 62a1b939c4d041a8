//! Point-based classification head: image features sampled at each point,
//! aggregated over point neighborhoods with a rigid KPConv.
//!
//! Weight paths:
//! - `kpconv.weights [K, C_in, C_out]`
//! - `bn.{weight,bias,running_mean,running_var}`
//! - `head.{weight,bias}`

use candle_core::{DType, Device, Module, ModuleT, Tensor};
use candle_nn::{BatchNorm, Conv2d, VarBuilder};

use crate::config::KpConvConfig;
use crate::error::{RangeViTError, Result};
use crate::layers::conv::{batch_norm, conv};
use crate::layers::grid_sample_border;

/// Coordinate given to the shadow neighbor, far from every kernel point.
const SHADOW_COORD: f64 = 1e6;

/// Fraction of `radius` at which the outer kernel points sit.
const KERNEL_SHELL_RATIO: f64 = 0.66;

// ─── PointBatch ───────────────────────────────────────────────────────────

/// Per-point inputs for a batch, concatenated along the point axis.
#[derive(Debug, Clone)]
pub struct PointBatch {
    /// `[P]` normalized column coordinate in `[-1, 1]`.
    pub px: Tensor,
    /// `[P]` normalized row coordinate in `[-1, 1]`.
    pub py: Tensor,
    /// `[P, 3]`
    pub pxyz: Tensor,
    /// `[P, k]` neighbor indices local to each sample. The sample's point
    /// count marks an empty slot.
    pub pknn: Tensor,
    /// Points of each sample.
    pub num_points: Vec<usize>,
}

impl PointBatch {
    pub fn total_points(&self) -> usize {
        self.num_points.iter().sum()
    }

    pub fn num_samples(&self) -> usize {
        self.num_points.len()
    }

    /// Check that every per-point tensor holds exactly `total_points()` rows.
    pub fn validate(&self) -> Result<()> {
        let expected = self.total_points();
        for t in [&self.px, &self.py, &self.pxyz, &self.pknn] {
            let found = t.dim(0)?;
            if found != expected {
                return Err(RangeViTError::PointCountMismatch { expected, found });
            }
        }
        Ok(())
    }
}

// ─── Kernel points ────────────────────────────────────────────────────────

/// Fixed kernel disposition `[K, 3]`: the center plus `K - 1` points on a
/// Fibonacci sphere of radius `radius * 0.66`.
pub fn kernel_points(cfg: &KpConvConfig, dtype: DType, device: &Device) -> candle_core::Result<Tensor> {
    let shell = cfg.kernel_size.saturating_sub(1);
    let r = cfg.radius * KERNEL_SHELL_RATIO;
    let golden_angle = std::f64::consts::PI * (3.0 - 5f64.sqrt());

    let mut pts = Vec::with_capacity(cfg.kernel_size * 3);
    pts.extend_from_slice(&[0f32; 3]);
    for i in 0..shell {
        let z = 1.0 - 2.0 * (i as f64 + 0.5) / shell as f64;
        let ring = (1.0 - z * z).sqrt();
        let theta = golden_angle * i as f64;
        pts.push((r * ring * theta.cos()) as f32);
        pts.push((r * ring * theta.sin()) as f32);
        pts.push((r * z) as f32);
    }
    Tensor::from_vec(pts, (cfg.kernel_size.max(1), 3), device)?.to_dtype(dtype)
}

// ─── KPConv ───────────────────────────────────────────────────────────────

/// Rigid kernel point convolution with linear influence.
pub struct KPConv {
    weights: Tensor,
    kernel_points: Tensor,
    kp_extent: f64,
}

impl KPConv {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        cfg: &KpConvConfig,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let weights = vb.get_with_hints(
            (cfg.kernel_size, in_channels, out_channels),
            "weights",
            candle_nn::init::DEFAULT_KAIMING_UNIFORM,
        )?;
        let kernel_points = kernel_points(cfg, vb.dtype(), vb.device())?;
        Ok(Self {
            weights,
            kernel_points,
            kp_extent: cfg.kp_extent,
        })
    }

    pub fn kernel_points(&self) -> &Tensor {
        &self.kernel_points
    }

    /// `q_pts`: `[n, 3]` query points, `s_pts`: `[m, 3]` support points,
    /// `neighb_inds`: `[n, k]` indices into `s_pts` where `m` means "none",
    /// `x`: `[m, C_in]` support features. Returns `[n, C_out]`.
    pub fn forward(
        &self,
        q_pts: &Tensor,
        s_pts: &Tensor,
        neighb_inds: &Tensor,
        x: &Tensor,
    ) -> candle_core::Result<Tensor> {
        let (n, k) = neighb_inds.dims2()?;
        let c_in = x.dim(1)?;
        let dtype = x.dtype();
        let flat_inds = neighb_inds.flatten_all()?;

        // Shadow point far away, shadow features zero
        let shadow = Tensor::full(SHADOW_COORD, (1, 3), s_pts.device())?.to_dtype(s_pts.dtype())?;
        let s_pts = Tensor::cat(&[s_pts, &shadow], 0)?;
        let neighbors = s_pts
            .index_select(&flat_inds, 0)?
            .reshape((n, k, 3))?
            .broadcast_sub(&q_pts.unsqueeze(1)?)?
            .to_dtype(dtype)?;

        // [n, k, K]
        let differences = neighbors
            .unsqueeze(2)?
            .broadcast_sub(&self.kernel_points.to_dtype(dtype)?.unsqueeze(0)?.unsqueeze(0)?)?;
        let distances = differences.sqr()?.sum(3)?.sqrt()?;
        let all_weights = distances
            .affine(-1.0 / self.kp_extent, 1.0)?
            .relu()?
            .transpose(1, 2)?
            .contiguous()?;

        let zeros = Tensor::zeros((1, c_in), dtype, x.device())?;
        let x = Tensor::cat(&[x, &zeros], 0)?;
        let neighb_x = x.index_select(&flat_inds, 0)?.reshape((n, k, c_in))?;

        // [n, K, C_in] -> [K, n, C_in] -> [K, n, C_out]
        let weighted = all_weights.matmul(&neighb_x)?;
        let weighted = weighted.transpose(0, 1)?.contiguous()?;
        let kernel_outputs = weighted.matmul(&self.weights.to_dtype(dtype)?)?;
        kernel_outputs.sum(0)
    }
}

// ─── KPClassifier ─────────────────────────────────────────────────────────

pub struct KPClassifier {
    kpconv: KPConv,
    bn: BatchNorm,
    head: Conv2d,
}

impl KPClassifier {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        num_classes: usize,
        cfg: &KpConvConfig,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        Ok(Self {
            kpconv: KPConv::new(in_channels, out_channels, cfg, vb.pp("kpconv"))?,
            bn: batch_norm(out_channels, vb.pp("bn"))?,
            head: conv(out_channels, num_classes, 1, 0, 1, vb.pp("head"))?,
        })
    }

    /// `feats`: dense features `[B, C, H, W]`. Returns logits `[P, n_cls]`
    /// in the point order of `points`.
    pub fn forward_t(&self, feats: &Tensor, points: &PointBatch, train: bool) -> Result<Tensor> {
        let batch = feats.dim(0)?;
        if points.num_samples() != batch {
            return Err(RangeViTError::SampleCountMismatch {
                images: batch,
                samples: points.num_samples(),
            });
        }
        points.validate()?;

        let mut per_sample = Vec::with_capacity(batch);
        let mut offset = 0;
        for (i, &n) in points.num_points.iter().enumerate() {
            let px = points.px.narrow(0, offset, n)?;
            let py = points.py.narrow(0, offset, n)?;
            let pts = points.pxyz.narrow(0, offset, n)?;
            let knn = points.pknn.narrow(0, offset, n)?;

            let sampled = grid_sample_border(&feats.get(i)?, &px, &py)?;
            per_sample.push(self.kpconv.forward(&pts, &pts, &knn, &sampled)?);
            offset += n;
        }
        let x = Tensor::cat(&per_sample, 0)?;

        let (p, c) = x.dims2()?;
        let x = x.reshape((p, c, 1, 1))?;
        let x = self.bn.forward_t(&x, train)?.relu()?;
        let logits = self.head.forward(&x)?;
        Ok(logits.squeeze(3)?.squeeze(2)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::random_point_batch;
    use candle_nn::VarMap;

    #[test]
    fn kernel_points_geometry() {
        let cfg = KpConvConfig::default();
        let kp = kernel_points(&cfg, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(kp.dims(), &[15, 3]);

        let rows: Vec<Vec<f32>> = kp.to_vec2().unwrap();
        assert_eq!(rows[0], vec![0.0, 0.0, 0.0]);
        let r = (cfg.radius * KERNEL_SHELL_RATIO) as f32;
        for row in &rows[1..] {
            let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((norm - r).abs() < 1e-5, "norm {norm} vs {r}");
        }
    }

    #[test]
    fn kernel_points_are_deterministic() {
        let cfg = KpConvConfig::default();
        let a: Vec<Vec<f32>> = kernel_points(&cfg, DType::F32, &Device::Cpu)
            .unwrap()
            .to_vec2()
            .unwrap();
        let b: Vec<Vec<f32>> = kernel_points(&cfg, DType::F32, &Device::Cpu)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn kpconv_linear_influence() {
        let device = Device::Cpu;
        let cfg = KpConvConfig {
            kernel_size: 5,
            ..KpConvConfig::default()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let kpconv = KPConv::new(2, 1, &cfg, vb).unwrap();
        {
            let data = varmap.data().lock().unwrap();
            data["weights"]
                .set(&Tensor::ones((5, 2, 1), DType::F32, &device).unwrap())
                .unwrap();
        }

        // One point whose only real neighbor is itself; slot 1 is the shadow.
        let pts = Tensor::zeros((1, 3), DType::F32, &device).unwrap();
        let knn = Tensor::new(&[[0u32, 1]], &device).unwrap();
        let x = Tensor::new(&[[1f32, 2.0]], &device).unwrap();
        let out: Vec<Vec<f32>> = kpconv.forward(&pts, &pts, &knn, &x).unwrap().to_vec2().unwrap();

        let d = cfg.radius * KERNEL_SHELL_RATIO;
        let influence = 1.0 + 4.0 * (1.0 - d / cfg.kp_extent);
        let expected = (influence * 3.0) as f32;
        assert!((out[0][0] - expected).abs() < 1e-4, "{} vs {expected}", out[0][0]);
    }

    #[test]
    fn kpconv_output_shape() {
        let device = Device::Cpu;
        let cfg = KpConvConfig {
            kernel_size: 5,
            ..KpConvConfig::default()
        };
        let vb = VarBuilder::zeros(DType::F32, &device);
        let kpconv = KPConv::new(4, 6, &cfg, vb).unwrap();

        let batch = random_point_batch(&[7], 3, &device).unwrap();
        let x = Tensor::randn(0f32, 1.0, (7, 4), &device).unwrap();
        let out = kpconv
            .forward(&batch.pxyz, &batch.pxyz, &batch.pknn, &x)
            .unwrap();
        assert_eq!(out.dims(), &[7, 6]);
    }

    #[test]
    fn classifier_per_point_logits() {
        let device = Device::Cpu;
        let cfg = KpConvConfig {
            kernel_size: 5,
            ..KpConvConfig::default()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let classifier = KPClassifier::new(8, 8, 3, &cfg, vb).unwrap();
        {
            let data = varmap.data().lock().unwrap();
            assert_eq!(data["kpconv.weights"].as_tensor().dims(), &[5, 8, 8]);
            assert_eq!(data["head.weight"].as_tensor().dims(), &[3, 8, 1, 1]);
            assert!(data.contains_key("bn.running_mean"));
        }

        let feats = Tensor::randn(0f32, 1.0, (2, 8, 4, 16), &device).unwrap();
        let points = random_point_batch(&[5, 9], 4, &device).unwrap();
        let logits = classifier.forward_t(&feats, &points, false).unwrap();
        assert_eq!(logits.dims(), &[14, 3]);
    }

    #[test]
    fn classifier_rejects_sample_mismatch() {
        let device = Device::Cpu;
        let cfg = KpConvConfig {
            kernel_size: 5,
            ..KpConvConfig::default()
        };
        let vb = VarBuilder::zeros(DType::F32, &device);
        let classifier = KPClassifier::new(8, 8, 3, &cfg, vb).unwrap();

        let feats = Tensor::randn(0f32, 1.0, (2, 8, 4, 16), &device).unwrap();
        let points = random_point_batch(&[5], 4, &device).unwrap();
        let err = classifier.forward_t(&feats, &points, false).unwrap_err();
        assert!(matches!(
            err,
            RangeViTError::SampleCountMismatch {
                images: 2,
                samples: 1
            }
        ));
    }

    #[test]
    fn point_batch_count_mismatch() {
        let device = Device::Cpu;
        let mut points = random_point_batch(&[5, 4], 3, &device).unwrap();
        points.validate().unwrap();
        assert_eq!(points.total_points(), 9);

        points.num_points = vec![5, 6];
        let err = points.validate().unwrap_err();
        assert!(matches!(
            err,
            RangeViTError::PointCountMismatch {
                expected: 11,
                found: 9
            }
        ));
    }
}
