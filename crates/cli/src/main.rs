use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use candle_core::DType;
use clap::{Args, Parser, Subcommand};
use rangevit_core::{loader, models, RangeViT, RangeViTConfig};
use tracing::info;

use rangevit_cli::config::CliConfig;
use rangevit_cli::logging;
use rangevit_cli::runtime::{dtype_name, parse_device, parse_dtype};

/// Tensor read from the `infer` input file.
const INPUT_TENSOR: &str = "range_image";

#[derive(Parser)]
#[command(name = "rangevit", about = "RangeViT range-image segmentation")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct GlobalArgs {
    /// Compute device (cpu, cuda, cuda:N)
    #[arg(long, global = true)]
    device: Option<String>,

    /// Parameter and activation dtype (f32, f16, bf16)
    #[arg(long, global = true)]
    dtype: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,
}

impl GlobalArgs {
    fn as_config(&self) -> CliConfig {
        CliConfig {
            device: self.device.clone(),
            dtype: self.dtype.clone(),
            log_level: self.log_level.clone(),
            model_config: None,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Build the model and print its parameter statistics
    Summary {
        /// JSON model config (defaults to the settings file entry, then built-in defaults)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Pretrained checkpoint to load into the encoder
        #[arg(long)]
        pretrained: Option<PathBuf>,
    },
    /// Write the default JSON model config
    InitConfig {
        #[arg(long)]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Segment range images with a trained checkpoint
    Infer {
        /// JSON model config the checkpoint was trained with
        #[arg(long)]
        config: Option<PathBuf>,

        /// Safetensors weight files or directories of shards
        #[arg(long, required = true, num_args = 1..)]
        weights: Vec<PathBuf>,

        /// Safetensors file holding `range_image` [B, C, H, W]
        #[arg(long)]
        input: PathBuf,

        /// Safetensors file receiving `logits` and `labels`
        #[arg(long)]
        output: PathBuf,
    },
    /// Persist the global flags (and a default model config) to the settings file
    Settings {
        /// Default JSON model config
        #[arg(long)]
        model_config: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let file_settings = CliConfig::load();
    let mut settings = file_settings.clone();
    settings.merge(&cli.global.as_config());

    logging::init_with_level(settings.log_level_or_default())?;
    if let Some(path) = CliConfig::default_path() {
        if path.exists() {
            tracing::debug!(path = %path.display(), "Loaded settings");
        }
    }

    match cli.command {
        Command::Summary { config, pretrained } => run_summary(&settings, config, pretrained),
        Command::InitConfig { output, force } => run_init_config(&output, force),
        Command::Infer {
            config,
            weights,
            input,
            output,
        } => run_infer(&settings, config, &weights, &input, &output),
        Command::Settings { model_config } => {
            let mut updated = file_settings;
            updated.merge(&CliConfig {
                model_config,
                ..cli.global.as_config()
            });
            let path = updated.save()?;
            println!("Saved settings to {}", path.display());
            Ok(())
        }
    }
}

/// Model config from `--config`, the settings file, or the defaults.
fn load_model_config(path: Option<PathBuf>, settings: &CliConfig) -> anyhow::Result<RangeViTConfig> {
    match path.or_else(|| settings.model_config.clone()) {
        Some(path) => RangeViTConfig::from_file(&path)
            .with_context(|| format!("failed to read model config {}", path.display())),
        None => Ok(RangeViTConfig::default()),
    }
}

fn run_summary(
    settings: &CliConfig,
    config: Option<PathBuf>,
    pretrained: Option<PathBuf>,
) -> anyhow::Result<()> {
    let device = parse_device(settings.device_or_default())?;
    let dtype = parse_dtype(settings.dtype_or_default())?;

    let mut cfg = load_model_config(config, settings)?;
    if let Some(path) = pretrained {
        cfg.pretrained_path = Some(path.display().to_string());
    }

    let model = RangeViT::new(cfg, &device, dtype).context("failed to build model")?;
    let stats = model.parameter_stats()?;
    let resolved = model.resolved();

    let summary = serde_json::json!({
        "backbone": model.config().backbone,
        "image_size": resolved.vit.image_size,
        "patch_size": resolved.vit.patch_size,
        "grid_size": resolved.vit.grid_size(),
        "n_cls": resolved.n_cls,
        "skip_filters": resolved.decoder.skip_filters,
        "kpconv": resolved.kpconv.is_some(),
        "dtype": dtype_name(dtype),
        "parameters": stats,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn run_init_config(output: &Path, force: bool) -> anyhow::Result<()> {
    if output.exists() && !force {
        bail!("{} already exists (pass --force to overwrite)", output.display());
    }
    RangeViTConfig::default()
        .save(output)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("Wrote default model config to {}", output.display());
    Ok(())
}

fn run_infer(
    settings: &CliConfig,
    config: Option<PathBuf>,
    weights: &[PathBuf],
    input: &Path,
    output: &Path,
) -> anyhow::Result<()> {
    let device = parse_device(settings.device_or_default())?;
    let dtype = parse_dtype(settings.dtype_or_default())?;

    let cfg = load_model_config(config, settings)?;
    let resolved = cfg.resolve()?;

    let mut files = Vec::new();
    for path in weights {
        files.extend(loader::weight_files(path)?);
    }
    info!(files = files.len(), dtype = dtype_name(dtype), "Loading weights");
    let vb = loader::load_weights(&files, dtype, &device)?;
    let net = models::from_config(&resolved, vb).context("failed to build model from weights")?;

    let tensors = candle_core::safetensors::load(input, &device)
        .with_context(|| format!("failed to read {}", input.display()))?;
    let im = tensors
        .get(INPUT_TENSOR)
        .with_context(|| format!("{} has no '{INPUT_TENSOR}' tensor", input.display()))?
        .to_dtype(dtype)?;
    let (batch, channels, h, w) = im.dims4()?;
    if channels != cfg.in_channels {
        bail!(
            "input has {channels} channels, model expects {}",
            cfg.in_channels
        );
    }

    let start = std::time::Instant::now();
    let logits = net.forward_image(&im)?;
    let labels = logits.argmax(1)?;
    info!(
        batch,
        height = h,
        width = w,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Segmented range images"
    );

    let out = HashMap::from([
        ("logits".to_string(), logits.to_dtype(DType::F32)?),
        ("labels".to_string(), labels),
    ]);
    candle_core::safetensors::save(&out, output)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("Wrote logits and labels to {}", output.display());
    Ok(())
}
