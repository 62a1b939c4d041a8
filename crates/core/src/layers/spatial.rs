//! Spatial tensor utilities: padding, pooling, pixel shuffle, bilinear
//! resizing and grid sampling.
//!
//! All image tensors are `[B, C, H, W]`.

use candle_core::{DType, Result, Tensor};

/// Token grid produced by a patch embedding of size `patch` and stride
/// `stride` over an `h x w` image.
pub fn grid_size_2d(
    h: usize,
    w: usize,
    patch: (usize, usize),
    stride: (usize, usize),
) -> (usize, usize) {
    let gh = h.saturating_sub(patch.0) / stride.0 + 1;
    let gw = w.saturating_sub(patch.1) / stride.1 + 1;
    (gh, gw)
}

/// Zero-pad the bottom and right edges so H and W become multiples of
/// `patch`.
pub fn pad_to_multiple(im: &Tensor, patch: (usize, usize)) -> Result<Tensor> {
    let (_, _, h, w) = im.dims4()?;
    let pad_h = (patch.0 - h % patch.0) % patch.0;
    let pad_w = (patch.1 - w % patch.1) % patch.1;
    let mut out = im.clone();
    if pad_h > 0 {
        out = out.pad_with_zeros(2, 0, pad_h)?;
    }
    if pad_w > 0 {
        out = out.pad_with_zeros(3, 0, pad_w)?;
    }
    Ok(out)
}

/// Crop back to `(h, w)` after [`pad_to_multiple`].
pub fn unpad(y: &Tensor, size: (usize, usize)) -> Result<Tensor> {
    let (_, _, h, w) = y.dims4()?;
    if (h, w) == size {
        return Ok(y.clone());
    }
    y.narrow(2, 0, size.0)?.narrow(3, 0, size.1)
}

/// Average pooling with symmetric zero padding. Padded zeros count towards
/// the average.
pub fn avg_pool2d_padded(
    xs: &Tensor,
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
) -> Result<Tensor> {
    let xs = xs
        .pad_with_zeros(2, padding.0, padding.0)?
        .pad_with_zeros(3, padding.1, padding.1)?;
    xs.avg_pool2d_with_stride(kernel, stride)
}

/// Rectangular pixel shuffle:
/// `[B, C*s0*s1, H, W]` -> `[B, C, H*s0, W*s1]`.
pub fn pixel_shuffle(xs: &Tensor, scale: (usize, usize)) -> Result<Tensor> {
    let (b, c, h, w) = xs.dims4()?;
    let (s0, s1) = scale;
    let c_out = c / (s0 * s1);
    xs.reshape((b, c_out, s0, s1, h, w))?
        .permute((0, 1, 4, 2, 5, 3))?
        .contiguous()?
        .reshape((b, c_out, h * s0, w * s1))
}

/// Row-stochastic `[out, in]` matrix of 1D linear interpolation weights,
/// `align_corners = false`.
fn linear_weights(in_size: usize, out_size: usize) -> Vec<f32> {
    let mut weights = vec![0f32; out_size * in_size];
    let scale = in_size as f64 / out_size as f64;
    for dst in 0..out_size {
        let src = ((dst as f64 + 0.5) * scale - 0.5).max(0.0);
        let i0 = (src.floor() as usize).min(in_size - 1);
        let i1 = (i0 + 1).min(in_size - 1);
        let l1 = (src - i0 as f64) as f32;
        weights[dst * in_size + i0] += 1.0 - l1;
        weights[dst * in_size + i1] += l1;
    }
    weights
}

/// Bilinear resize (`align_corners = false`) of `[B, C, H, W]` to `size`.
///
/// Applied separably as two plain matmuls against interpolation matrices.
pub fn bilinear_resize(xs: &Tensor, size: (usize, usize)) -> Result<Tensor> {
    let (b, c, h, w) = xs.dims4()?;
    if (h, w) == size {
        return Ok(xs.clone());
    }
    let (oh, ow) = size;
    let device = xs.device();
    let dtype = xs.dtype();
    let rw_t = Tensor::from_vec(linear_weights(w, ow), (ow, w), device)?
        .to_dtype(dtype)?
        .t()?;
    let rh_t = Tensor::from_vec(linear_weights(h, oh), (oh, h), device)?
        .to_dtype(dtype)?
        .t()?;

    // [B*C*H, W] x [W, OW] -> [B, C, OW, H]
    let xs = xs
        .contiguous()?
        .reshape((b * c * h, w))?
        .matmul(&rw_t)?
        .reshape((b, c, h, ow))?
        .transpose(2, 3)?
        .contiguous()?;
    // [B*C*OW, H] x [H, OH] -> [B, C, OH, OW]
    xs.reshape((b * c * ow, h))?
        .matmul(&rh_t)?
        .reshape((b, c, ow, oh))?
        .transpose(2, 3)?
        .contiguous()
}

/// Map normalized coordinates in `[-1, 1]` to clamped pixel coordinates
/// (`align_corners = false`, border padding).
fn unnormalize_border(coords: &Tensor, size: usize) -> Result<Tensor> {
    let half = size as f64 / 2.0;
    coords
        .affine(half, half - 0.5)?
        .clamp(0f64, (size - 1) as f64)
}

/// Bilinear sampling of a single feature map at normalized positions.
///
/// `feats`: `[C, H, W]`, `px`/`py`: `[N]` in `[-1, 1]` (x along W, y along H).
/// Out-of-range positions take the border value. Returns `[N, C]`.
pub fn grid_sample_border(feats: &Tensor, px: &Tensor, py: &Tensor) -> Result<Tensor> {
    let (c, h, w) = feats.dims3()?;
    let dtype = feats.dtype();

    let x = unnormalize_border(&px.to_dtype(DType::F32)?, w)?;
    let y = unnormalize_border(&py.to_dtype(DType::F32)?, h)?;
    let x0 = x.floor()?;
    let y0 = y.floor()?;
    let x1 = (&x0 + 1.0)?.clamp(0f64, (w - 1) as f64)?;
    let y1 = (&y0 + 1.0)?.clamp(0f64, (h - 1) as f64)?;
    let wx1 = (&x - &x0)?;
    let wy1 = (&y - &y0)?;
    let wx0 = wx1.affine(-1.0, 1.0)?;
    let wy0 = wy1.affine(-1.0, 1.0)?;

    let flat = feats.reshape((c, h * w))?;
    let gather = |yy: &Tensor, xx: &Tensor| -> Result<Tensor> {
        let idx = ((yy * w as f64)? + xx)?.to_dtype(DType::U32)?;
        flat.index_select(&idx, 1)?.to_dtype(DType::F32)
    };

    let out = (gather(&y0, &x0)?.broadcast_mul(&(&wy0 * &wx0)?)?
        + gather(&y0, &x1)?.broadcast_mul(&(&wy0 * &wx1)?)?)?;
    let out = (out + gather(&y1, &x0)?.broadcast_mul(&(&wy1 * &wx0)?)?)?;
    let out = (out + gather(&y1, &x1)?.broadcast_mul(&(&wy1 * &wx1)?)?)?;
    out.t()?.contiguous()?.to_dtype(dtype)
}

/// `[1, 1, H, W]` ramp tensor with value `row * W + col`, handy in tests.
#[cfg(test)]
pub(crate) fn ramp(h: usize, w: usize, device: &candle_core::Device) -> Result<Tensor> {
    Tensor::arange(0f32, (h * w) as f32, device)?.reshape((1, 1, h, w))
}
