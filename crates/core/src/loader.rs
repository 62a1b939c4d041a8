//! Checkpoint reading and pretrained-weight surgery.
//!
//! Two paths exist:
//! - full trained checkpoints are memory-mapped into a `VarBuilder`
//!   ([`load_weights`]);
//! - pretrained encoders are read into memory, stripped of the entries that
//!   do not transfer, and copied non-strictly into a `VarMap`
//!   ([`load_pretrained`]).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use tracing::{debug, info, warn};

use crate::error::{RangeViTError, Result};
use crate::models::resize_pos_embed;

pub const POS_EMBED_KEY: &str = "encoder.pos_embed";

/// Always removed: the stem projection is shaped by the patch geometry.
pub const STRIPPED_KEYS: &[&str] = &[
    "encoder.patch_embed.proj.weight",
    "encoder.patch_embed.proj.bias",
];

/// Any key containing this fragment is removed.
pub const DECODER_FRAGMENT: &str = "decoder";

/// Tensor key of PyTorch checkpoints holding the state dict.
const PICKLE_STATE_KEY: &str = "model";

/// Creates a VarBuilder from safetensor weight files.
pub fn load_weights(paths: &[PathBuf], dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(paths, dtype, device)? };
    Ok(vb)
}

/// Expands a directory into its `*.safetensors` files in shard order.
/// A plain file is returned as is.
pub fn weight_files(path: &Path) -> Result<Vec<PathBuf>> {
    if !path.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let p = entry?.path();
        if p.extension().is_some_and(|e| e == "safetensors") {
            files.push(p);
        }
    }
    if files.is_empty() {
        return Err(RangeViTError::Checkpoint {
            path: path.display().to_string(),
            reason: "no .safetensors files in directory".to_string(),
        });
    }
    files.sort_by_key(|p| natural_sort_key(&p.to_string_lossy()));
    Ok(files)
}

/// Natural sort key: splits a filename into alternating text/numeric segments
/// so that "model-2-of-10" sorts before "model-10-of-10".
fn natural_sort_key(s: &str) -> Vec<std::result::Result<u64, String>> {
    let basename = Path::new(s)
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or(s);
    let mut parts = Vec::new();
    let mut chars = basename.chars().peekable();
    while let Some(&c) = chars.peek() {
        let digit = c.is_ascii_digit();
        let mut segment = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_ascii_digit() != digit {
                break;
            }
            segment.push(c);
            chars.next();
        }
        if digit {
            parts.push(Ok(segment.parse::<u64>().unwrap_or(0)));
        } else {
            parts.push(Err(segment));
        }
    }
    parts
}

/// Read every tensor of a checkpoint into memory.
///
/// `*.safetensors` files are read as a flat state dict. Anything else is
/// treated as a PyTorch pickle whose state dict sits under `model`.
pub fn read_checkpoint(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
    let checkpoint_err = |e: candle_core::Error| RangeViTError::Checkpoint {
        path: path.display().to_string(),
        reason: e.to_string(),
    };

    if path.extension().is_some_and(|e| e == "safetensors") {
        return candle_core::safetensors::load(path, device).map_err(checkpoint_err);
    }

    let tensors = candle_core::pickle::read_all_with_key(path, Some(PICKLE_STATE_KEY))
        .map_err(checkpoint_err)?;
    let mut state = HashMap::with_capacity(tensors.len());
    for (name, tensor) in tensors {
        state.insert(name, tensor.to_device(device)?);
    }
    Ok(state)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SurgeryOptions {
    /// Keep the pretrained positional embedding (resized to the model grid).
    pub reuse_pos_emb: bool,
}

/// Remove the checkpoint entries that cannot be transferred.
///
/// Returns the removed keys, sorted. Keys that are expected but absent are
/// skipped.
pub fn strip_incompatible(state: &mut HashMap<String, Tensor>, opts: SurgeryOptions) -> Vec<String> {
    let mut targets: Vec<String> = STRIPPED_KEYS.iter().map(|k| k.to_string()).collect();
    if !opts.reuse_pos_emb {
        targets.push(POS_EMBED_KEY.to_string());
    }
    targets.extend(
        state
            .keys()
            .filter(|k| k.contains(DECODER_FRAGMENT))
            .cloned(),
    );

    let mut removed = Vec::new();
    for key in targets {
        if state.remove(&key).is_some() {
            debug!(key = %key, "Removed pretrained weight");
            removed.push(key);
        } else {
            debug!(key = %key, "Pretrained weight absent, nothing to remove");
        }
    }
    removed.sort();
    removed.dedup();
    removed
}

/// Resize a pretrained positional embedding in place from its square grid
/// to `target_grid`. Returns whether the state held one.
pub fn adapt_pos_embed(
    state: &mut HashMap<String, Tensor>,
    target_grid: (usize, usize),
    num_extra_tokens: usize,
) -> Result<bool> {
    let Some(pos_embed) = state.get(POS_EMBED_KEY) else {
        return Ok(false);
    };
    let (_, n, d) = pos_embed.dims3()?;
    let grid_tokens = n.saturating_sub(num_extra_tokens);
    let side = (grid_tokens as f64).sqrt().round() as usize;
    if side * side != grid_tokens {
        return Err(RangeViTError::ShapeMismatch {
            key: POS_EMBED_KEY.to_string(),
            checkpoint: pos_embed.dims().to_vec(),
            model: vec![1, num_extra_tokens + target_grid.0 * target_grid.1, d],
        });
    }

    let resized = resize_pos_embed(pos_embed, (side, side), target_grid, num_extra_tokens)?;
    info!(
        from = ?(side, side),
        to = ?target_grid,
        "Resized pretrained positional embedding"
    );
    state.insert(POS_EMBED_KEY.to_string(), resized);
    Ok(true)
}

/// Outcome of a non-strict load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Model parameters overwritten from the checkpoint.
    pub loaded: Vec<String>,
    /// Model parameters the checkpoint did not provide.
    pub missing: Vec<String>,
    /// Checkpoint entries with no model parameter.
    pub unexpected: Vec<String>,
    /// Entries dropped by weight surgery before loading.
    pub removed: Vec<String>,
}

impl LoadReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }
}

/// Copy every checkpoint tensor whose key names a model parameter.
///
/// Tensors are moved to the parameter's device and dtype. A key present on
/// both sides with different shapes is an error, and nothing is written
/// unless every shared key matches.
pub fn load_partial(varmap: &VarMap, state: &HashMap<String, Tensor>) -> Result<LoadReport> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::Msg("variable map lock poisoned".to_string()))?;

    let mut report = LoadReport::default();
    let mut staged = Vec::new();
    for (name, var) in data.iter() {
        let Some(src) = state.get(name) else {
            report.missing.push(name.clone());
            continue;
        };
        if src.dims() != var.dims() {
            return Err(RangeViTError::ShapeMismatch {
                key: name.clone(),
                checkpoint: src.dims().to_vec(),
                model: var.dims().to_vec(),
            });
        }
        let src = src.to_device(var.device())?.to_dtype(var.dtype())?;
        staged.push((var, src));
        report.loaded.push(name.clone());
    }

    for (var, src) in staged {
        var.set(&src)?;
    }

    let known: HashSet<&String> = data.keys().collect();
    report.unexpected = state
        .keys()
        .filter(|k| !known.contains(k))
        .cloned()
        .collect();

    report.loaded.sort();
    report.missing.sort();
    report.unexpected.sort();
    Ok(report)
}

/// Read `path`, apply weight surgery and load the rest into `varmap`.
///
/// `target_grid` is the model token grid, used when the positional
/// embedding is reused.
pub fn load_pretrained(
    varmap: &VarMap,
    path: &Path,
    opts: SurgeryOptions,
    target_grid: (usize, usize),
    device: &Device,
) -> Result<LoadReport> {
    let mut state = read_checkpoint(path, device)?;
    let removed = strip_incompatible(&mut state, opts);
    if opts.reuse_pos_emb && !adapt_pos_embed(&mut state, target_grid, crate::models::NUM_EXTRA_TOKENS)? {
        warn!("reuse_pos_emb set but the checkpoint has no positional embedding");
    }

    let mut report = load_partial(varmap, &state)?;
    report.removed = removed;
    info!(
        path = %path.display(),
        loaded = report.loaded.len(),
        missing = report.missing.len(),
        unexpected = report.unexpected.len(),
        removed = report.removed.len(),
        "Loaded pretrained weights"
    );
    for key in &report.unexpected {
        debug!(key = %key, "Unexpected pretrained weight");
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::Init;

    fn state(entries: &[(&str, &[usize])]) -> HashMap<String, Tensor> {
        entries
            .iter()
            .map(|(k, shape)| {
                (
                    k.to_string(),
                    Tensor::zeros(*shape, DType::F32, &Device::Cpu).unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn natural_sort_orders_numerically() {
        let mut files = vec![
            "model-00010-of-00020.safetensors".to_string(),
            "model-00002-of-00020.safetensors".to_string(),
            "model-00001-of-00020.safetensors".to_string(),
            "model-00011-of-00020.safetensors".to_string(),
        ];
        files.sort_by(|a, b| natural_sort_key(a).cmp(&natural_sort_key(b)));
        assert_eq!(
            files,
            vec![
                "model-00001-of-00020.safetensors",
                "model-00002-of-00020.safetensors",
                "model-00010-of-00020.safetensors",
                "model-00011-of-00020.safetensors",
            ]
        );
    }

    #[test]
    fn natural_sort_handles_unpadded_numbers() {
        let mut files = vec![
            "shard-10.safetensors".to_string(),
            "shard-2.safetensors".to_string(),
            "shard-1.safetensors".to_string(),
        ];
        files.sort_by(|a, b| natural_sort_key(a).cmp(&natural_sort_key(b)));
        assert_eq!(
            files,
            vec![
                "shard-1.safetensors",
                "shard-2.safetensors",
                "shard-10.safetensors",
            ]
        );
    }

    #[test]
    fn strip_removes_stem_projection_pos_embed_and_decoder() {
        let mut s = state(&[
            ("encoder.pos_embed", &[1, 5, 4]),
            ("encoder.cls_token", &[1, 1, 4]),
            ("encoder.patch_embed.proj.weight", &[4, 3, 16, 16]),
            ("encoder.patch_embed.proj.bias", &[4]),
            ("encoder.blocks.0.attn.qkv.weight", &[12, 4]),
            ("decoder.head.weight", &[3, 4]),
            ("decoder.cls_emb", &[1, 3, 4]),
        ]);
        let removed = strip_incompatible(&mut s, SurgeryOptions::default());
        assert_eq!(
            removed,
            vec![
                "decoder.cls_emb",
                "decoder.head.weight",
                "encoder.patch_embed.proj.bias",
                "encoder.patch_embed.proj.weight",
                "encoder.pos_embed",
            ]
        );
        let mut left: Vec<&String> = s.keys().collect();
        left.sort();
        assert_eq!(
            left,
            vec!["encoder.blocks.0.attn.qkv.weight", "encoder.cls_token"]
        );
    }

    #[test]
    fn strip_tolerates_absent_keys() {
        let mut s = state(&[("encoder.norm.weight", &[4])]);
        let removed = strip_incompatible(&mut s, SurgeryOptions::default());
        assert!(removed.is_empty());
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn strip_keeps_pos_embed_when_reused() {
        let mut s = state(&[("encoder.pos_embed", &[1, 5, 4])]);
        let removed = strip_incompatible(
            &mut s,
            SurgeryOptions {
                reuse_pos_emb: true,
            },
        );
        assert!(removed.is_empty());
        assert!(s.contains_key(POS_EMBED_KEY));
    }

    #[test]
    fn adapt_pos_embed_from_square_grid() {
        let mut s = state(&[("encoder.pos_embed", &[1, 1 + 24 * 24, 8])]);
        assert!(adapt_pos_embed(&mut s, (2, 24), 1).unwrap());
        assert_eq!(s[POS_EMBED_KEY].dims(), &[1, 1 + 2 * 24, 8]);

        let mut empty = HashMap::new();
        assert!(!adapt_pos_embed(&mut empty, (2, 24), 1).unwrap());
    }

    #[test]
    fn adapt_pos_embed_rejects_non_square_grid() {
        let mut s = state(&[("encoder.pos_embed", &[1, 1 + 12, 8])]);
        let err = adapt_pos_embed(&mut s, (2, 24), 1).unwrap_err();
        assert!(matches!(err, RangeViTError::ShapeMismatch { .. }));
    }

    fn small_varmap() -> VarMap {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints((2, 3), "encoder.a", Init::Const(0.0)).unwrap();
        vb.get_with_hints(3, "encoder.b", Init::Const(0.0)).unwrap();
        varmap
    }

    #[test]
    fn load_partial_reports_keys() {
        let varmap = small_varmap();
        let mut s = HashMap::new();
        s.insert(
            "encoder.a".to_string(),
            Tensor::ones((2, 3), DType::F64, &Device::Cpu).unwrap(),
        );
        s.insert(
            "encoder.extra".to_string(),
            Tensor::ones(1, DType::F32, &Device::Cpu).unwrap(),
        );

        let report = load_partial(&varmap, &s).unwrap();
        assert_eq!(report.loaded, vec!["encoder.a"]);
        assert_eq!(report.missing, vec!["encoder.b"]);
        assert_eq!(report.unexpected, vec!["encoder.extra"]);
        assert!(!report.is_complete());

        let data = varmap.data().lock().unwrap();
        let a = data["encoder.a"].as_tensor();
        assert_eq!(a.dtype(), DType::F32);
        let sum: f32 = a.sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(sum, 6.0);
    }

    #[test]
    fn load_partial_rejects_shape_mismatch() {
        let varmap = small_varmap();
        let s = state(&[("encoder.b", &[4])]);
        let err = load_partial(&varmap, &s).unwrap_err();
        match err {
            RangeViTError::ShapeMismatch {
                key,
                checkpoint,
                model,
            } => {
                assert_eq!(key, "encoder.b");
                assert_eq!(checkpoint, vec![4]);
                assert_eq!(model, vec![3]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn load_partial_mismatch_leaves_parameters_untouched() {
        let varmap = small_varmap();
        let mut s = HashMap::new();
        s.insert(
            "encoder.a".to_string(),
            Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap(),
        );
        s.insert(
            "encoder.b".to_string(),
            Tensor::ones(4, DType::F32, &Device::Cpu).unwrap(),
        );
        assert!(load_partial(&varmap, &s).is_err());

        let data = varmap.data().lock().unwrap();
        for name in ["encoder.a", "encoder.b"] {
            let sum: f32 = data[name].as_tensor().sum_all().unwrap().to_scalar().unwrap();
            assert_eq!(sum, 0.0, "{name} was overwritten");
        }
    }

    #[test]
    fn read_checkpoint_safetensors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt.safetensors");
        let s = state(&[("encoder.a", &[2, 3]), ("decoder.head.weight", &[3, 4])]);
        candle_core::safetensors::save(&s, &path).unwrap();

        let read = read_checkpoint(&path, &Device::Cpu).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read["encoder.a"].dims(), &[2, 3]);
    }

    #[test]
    fn read_checkpoint_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_checkpoint(&dir.path().join("nope.safetensors"), &Device::Cpu).unwrap_err();
        assert!(matches!(err, RangeViTError::Checkpoint { .. }));
    }

    #[test]
    fn load_pretrained_applies_surgery() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pretrained.safetensors");
        let mut s = state(&[("encoder.b", &[3]), ("decoder.head.weight", &[3, 4])]);
        s.insert(
            "encoder.a".to_string(),
            Tensor::ones((2, 3), DType::F32, &Device::Cpu).unwrap(),
        );
        candle_core::safetensors::save(&s, &path).unwrap();

        let varmap = small_varmap();
        let report = load_pretrained(
            &varmap,
            &path,
            SurgeryOptions::default(),
            (1, 1),
            &Device::Cpu,
        )
        .unwrap();
        assert_eq!(report.loaded, vec!["encoder.a", "encoder.b"]);
        assert_eq!(report.removed, vec!["decoder.head.weight"]);
        assert!(report.is_complete());
    }

    #[test]
    fn weight_files_sorted_shards() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["m-10.safetensors", "m-2.safetensors", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let files = weight_files(dir.path()).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["m-2.safetensors", "m-10.safetensors"]);

        let single = dir.path().join("m-2.safetensors");
        assert_eq!(weight_files(&single).unwrap(), vec![single]);
    }
}
