//! Device and dtype selection from command-line strings.

use anyhow::{bail, Context};
use candle_core::{DType, Device};

/// `cpu`, `cuda` or `cuda:N`.
pub fn parse_device(name: &str) -> anyhow::Result<Device> {
    match name.to_lowercase().as_str() {
        "cpu" => Ok(Device::Cpu),
        "cuda" | "gpu" => Device::new_cuda(0).context("failed to open CUDA device 0"),
        other => {
            let Some(ordinal) = other.strip_prefix("cuda:") else {
                bail!("unknown device '{name}' (expected cpu, cuda or cuda:N)");
            };
            let ordinal: usize = ordinal
                .parse()
                .with_context(|| format!("invalid CUDA ordinal in '{name}'"))?;
            Device::new_cuda(ordinal).with_context(|| format!("failed to open CUDA device {ordinal}"))
        }
    }
}

pub fn parse_dtype(name: &str) -> anyhow::Result<DType> {
    Ok(match name.to_lowercase().as_str() {
        "f32" | "fp32" | "float32" | "float" => DType::F32,
        "f16" | "fp16" | "float16" | "half" => DType::F16,
        "bf16" | "bfloat16" => DType::BF16,
        other => bail!("unsupported dtype '{other}' (expected f32, f16 or bf16)"),
    })
}

pub fn dtype_name(dtype: DType) -> &'static str {
    match dtype {
        DType::BF16 => "bf16",
        DType::F16 => "f16",
        DType::F32 => "f32",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_aliases() {
        assert_eq!(parse_dtype("f32").unwrap(), DType::F32);
        assert_eq!(parse_dtype("FP16").unwrap(), DType::F16);
        assert_eq!(parse_dtype("half").unwrap(), DType::F16);
        assert_eq!(parse_dtype("bfloat16").unwrap(), DType::BF16);
        assert!(parse_dtype("int8").is_err());
    }

    #[test]
    fn dtype_names_round_trip() {
        for dtype in [DType::F32, DType::F16, DType::BF16] {
            assert_eq!(parse_dtype(dtype_name(dtype)).unwrap(), dtype);
        }
    }

    #[test]
    fn cpu_device() {
        assert!(parse_device("cpu").unwrap().is_cpu());
        assert!(parse_device("CPU").unwrap().is_cpu());
    }

    #[test]
    fn unknown_device() {
        let err = parse_device("tpu").unwrap_err();
        assert!(err.to_string().contains("unknown device"));
        assert!(parse_device("cuda:x").is_err());
    }
}
