//! burn-cgd CLI
//!
//! Samples images from a text prompt with CLIP-guided diffusion, writing the
//! denoised estimate every few steps.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn_cgd::clip::{ClipVariant, ProjectionEmbedder};
use burn_cgd::core::{rgb_to_tensor, AnalyticDenoiser, CgdError, DebugConfig};
use burn_cgd::samplers::Respacing;
use burn_cgd::{AugmentationStep, ClipGuidedDiffusion, RunConfig, DEFAULT_NUM_CLASSES};
use clap::{Parser, ValueEnum};
use image::imageops::FilterType;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

mod output;

use output::{prepare_output_dir, save_snapshot, should_save, txt_to_dir};

/// Compute device for sampling
#[derive(Debug, Clone, Copy, PartialEq, ValueEnum, Default)]
pub enum Device {
    /// Auto-detect best available (CUDA > WGPU > LibTorch > CPU)
    #[default]
    Auto,
    /// CPU via ndarray
    #[cfg(feature = "ndarray")]
    Cpu,
    /// LibTorch (CUDA if available, else CPU)
    #[cfg(feature = "tch")]
    Tch,
    /// WebGPU (Vulkan/Metal/DX12)
    #[cfg(feature = "wgpu")]
    Wgpu,
    /// NVIDIA CUDA GPU
    #[cfg(feature = "cuda")]
    Cuda,
}

#[derive(Parser, Debug)]
#[command(name = "burn-cgd")]
#[command(about = "CLIP-guided diffusion in pure Rust")]
#[command(version)]
struct Cli {
    /// The prompt to reward
    #[arg(short = 't', long)]
    prompt: String,

    /// The prompt to penalize
    #[arg(long)]
    prompt_min: Option<String>,

    /// Weight of the penalized prompt, in [0, 1]
    #[arg(long, default_value = "0.1")]
    min_weight: f64,

    /// Diffusion image size: 64, 128, 256 or 512
    #[arg(long, default_value = "128")]
    image_size: usize,

    /// Blend an image with diffusion for --skip-timesteps steps
    #[arg(long)]
    init_image: Option<PathBuf>,

    /// Number of timesteps to blend the init image for
    #[arg(long, default_value = "0")]
    skip_timesteps: usize,

    /// Output directory
    #[arg(long, default_value = "outputs")]
    prefix: PathBuf,

    #[arg(long, default_value = "1")]
    batch_size: usize,

    /// Scale for the CLIP spherical distance loss
    #[arg(long, default_value = "1000")]
    clip_guidance_scale: f64,

    /// Scale for the total-variation smoothness loss
    #[arg(long, default_value = "100")]
    tv_scale: f64,

    /// Draw classes in proportion to their CLIP score against the prompt
    #[arg(long)]
    class_score: bool,

    /// Keep the top n classes when scoring (default: all)
    #[arg(long)]
    top_n: Option<usize>,

    /// Class label file, one label per line. Required by --class-score
    #[arg(long)]
    labels: Option<PathBuf>,

    #[arg(long, default_value = "0")]
    seed: u64,

    /// Save the denoised estimate every n steps
    #[arg(long, default_value = "5")]
    save_frequency: usize,

    /// Compute device (auto = detect best available)
    #[arg(long, value_enum, default_value = "auto")]
    device: Device,

    #[arg(long, default_value = "1000")]
    diffusion_steps: usize,

    /// Sampling steps, e.g. 250 or ddim50
    #[arg(long, default_value = "1000")]
    timestep_respacing: Respacing,

    /// Number of random crops scored per step
    #[arg(long, default_value = "16")]
    num_cutouts: usize,

    /// Cutout size power, larger values favour crops closer to the full image
    #[arg(long, default_value = "0.5")]
    cutout_power: f64,

    /// CLIP variant: ViT-B/32, ViT-B/16, RN50, RN101, RN50x4, RN50x16
    #[arg(long, default_value = "ViT-B/32")]
    clip_model: ClipVariant,

    /// Use the class-conditional model. Required for image sizes other than 256
    #[arg(long, default_value = "true", action = clap::ArgAction::Set)]
    class_cond: bool,

    /// Crop augmentations (comma-separated name[:probability]):
    /// hflip, vflip, translate, jitter, gray, noise
    ///
    /// Example: --augment hflip,noise:0.25
    #[arg(long, value_delimiter = ',')]
    augment: Vec<AugmentationStep>,

    /// Debug modes (comma-separated): timing, nan, sampler, all
    /// - timing: Show timing for each step
    /// - nan: Panic on NaN/Inf values
    /// - sampler: Log per-step tensor stats
    ///
    /// Examples: --debug  --debug timing  --debug sampler,nan
    #[arg(long, value_delimiter = ',', num_args = 0.., default_missing_value = "all")]
    debug: Vec<String>,
}

impl Cli {
    fn run_config(&self, num_classes: usize) -> RunConfig {
        RunConfig {
            prompt: self.prompt.clone(),
            prompt_min: self.prompt_min.clone(),
            min_weight: self.min_weight,
            batch_size: self.batch_size,
            tv_scale: self.tv_scale,
            top_n: self.top_n,
            image_size: self.image_size,
            class_cond: self.class_cond,
            clip_guidance_scale: self.clip_guidance_scale,
            cutout_power: self.cutout_power,
            num_cutouts: self.num_cutouts,
            timestep_respacing: self.timestep_respacing.clone(),
            diffusion_steps: self.diffusion_steps,
            skip_timesteps: self.skip_timesteps,
            seed: self.seed,
            clip_model: self.clip_model,
            class_score: self.class_score,
            augmentations: self.augment.clone(),
            num_classes,
            ..Default::default()
        }
    }
}

/// Debug flags parsed from --debug option
#[derive(Debug, Clone, Copy, Default)]
struct DebugFlags {
    timing: bool,
    nan: bool,
    sampler: bool,
}

impl DebugFlags {
    fn from_args(debug: &[String]) -> Self {
        let all = debug.iter().any(|s| s == "all");
        Self {
            timing: all || debug.iter().any(|s| s == "timing"),
            nan: all || debug.iter().any(|s| s == "nan"),
            sampler: all || debug.iter().any(|s| s == "sampler"),
        }
    }

    fn any(&self) -> bool {
        self.timing || self.nan || self.sampler
    }

    fn to_pipeline_config(self) -> DebugConfig {
        DebugConfig {
            sampler: self.sampler,
            nan: self.nan,
        }
    }
}

/// Everything a sampling job needs once the backend is chosen
struct Job {
    config: RunConfig,
    labels: Option<Vec<String>>,
    init_image: Option<PathBuf>,
    out_dir: PathBuf,
    save_frequency: usize,
    debug: DebugFlags,
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Try to initialize CUDA and return true if successful
#[cfg(feature = "cuda")]
fn cuda_available() -> bool {
    std::panic::catch_unwind(|| {
        let _ = burn_cgd::backends::CudaDevice::default();
    })
    .is_ok()
}

/// Try to initialize WGPU and return true if successful
#[cfg(feature = "wgpu")]
fn wgpu_available() -> bool {
    std::panic::catch_unwind(|| {
        let _ = burn_cgd::backends::WgpuDevice::default();
    })
    .is_ok()
}

/// Resolve Auto device to a concrete device
fn resolve_device(requested: Device) -> Result<Device> {
    if requested != Device::Auto {
        return Ok(requested);
    }

    #[cfg(feature = "cuda")]
    if cuda_available() {
        eprintln!("[device] Auto-detected CUDA");
        return Ok(Device::Cuda);
    }
    #[cfg(feature = "wgpu")]
    if wgpu_available() {
        eprintln!("[device] Auto-detected WGPU");
        return Ok(Device::Wgpu);
    }
    #[cfg(feature = "tch")]
    {
        eprintln!("[device] Using LibTorch");
        return Ok(Device::Tch);
    }
    #[cfg(feature = "ndarray")]
    {
        eprintln!("[device] Falling back to CPU");
        return Ok(Device::Cpu);
    }
    #[allow(unreachable_code)]
    {
        anyhow::bail!("No backend available. Enable 'ndarray', 'tch', 'wgpu' or 'cuda' feature.")
    }
}

fn read_labels(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read labels from {}", path.display()))?;
    let labels: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect();
    if labels.is_empty() {
        anyhow::bail!("{} contains no labels", path.display());
    }
    Ok(labels)
}

/// Load an image as a `[1, 3, size, size]` tensor in [-1, 1]
fn load_init_image<B: Backend>(path: &Path, size: usize, device: &B::Device) -> Result<Tensor<B, 4>> {
    let img = image::open(path)
        .with_context(|| format!("Failed to open init image {}", path.display()))?
        .to_rgb8();
    let resized = image::imageops::resize(&img, size as u32, size as u32, FilterType::Lanczos3);
    Ok(rgb_to_tensor(resized.as_raw(), size, size, device)?)
}

fn is_out_of_memory(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|e| e.downcast_ref::<CgdError>().is_some_and(|e| e.is_out_of_memory()))
}

fn generate<A: AutodiffBackend>(job: Job, device: &A::Device) -> Result<()> {
    let total_start = Instant::now();
    let Job {
        config,
        labels,
        init_image,
        out_dir,
        save_frequency,
        debug,
    } = job;

    let start = Instant::now();
    let init = match &init_image {
        Some(path) => Some(load_init_image::<A::InnerBackend>(path, config.image_size, device)?),
        None => None,
    };
    if debug.timing && init.is_some() {
        eprintln!("[timing] load init image: {:?}", start.elapsed());
    }

    let base = config.base_schedule();
    let model = if config.class_cond {
        AnalyticDenoiser::class_conditional(base.alphas_cumprod, config.num_classes, config.seed)
    } else {
        AnalyticDenoiser::new(base.alphas_cumprod)
    };
    let embedder = ProjectionEmbedder::new(config.clip_model, 0);

    let mut pipeline =
        ClipGuidedDiffusion::<A, _, _>::new(&model, &embedder, config, init.is_some(), device)?;
    if let Some(labels) = labels {
        pipeline = pipeline.with_labels(labels)?;
    }

    let start = Instant::now();
    let run = pipeline.sample(init, debug.to_pipeline_config())?;
    if debug.timing {
        eprintln!("[timing] prepare run: {:?}", start.elapsed());
    }

    let pb = ProgressBar::new(run.total_steps() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    let start = Instant::now();
    let mut step_start = Instant::now();
    for snapshot in run {
        let snapshot = match snapshot {
            Ok(snapshot) => snapshot,
            Err(err) => {
                pb.abandon();
                return Err(err).context("Sampling failed");
            }
        };

        pb.set_position(snapshot.step as u64 + 1);
        pb.set_message(format!("t={}", snapshot.timestep));
        if debug.timing {
            pb.println(format!("[step {}] {:?}", snapshot.step, step_start.elapsed()));
            step_start = Instant::now();
        }

        if should_save(snapshot.step, save_frequency, snapshot.is_final()) {
            let written = save_snapshot(&out_dir, snapshot.step, snapshot.pred_xstart)?;
            tracing::debug!(step = snapshot.step, files = written.len(), "saved snapshot");
        }
    }
    pb.finish_and_clear();

    if debug.timing {
        eprintln!("[timing] sampling: {:?}", start.elapsed());
        eprintln!("[timing] total: {:?}", total_start.elapsed());
    }

    let out_path = out_dir.canonicalize().unwrap_or_else(|_| out_dir.clone());
    println!("\nSaved to: {}", out_path.display());
    Ok(())
}

/// Reject settings before any output is written
fn check_settings(cli: &Cli, config: &RunConfig, has_labels: bool) -> Result<()> {
    let respaced = config.respaced_steps();
    if cli.save_frequency == 0 || cli.save_frequency > respaced {
        anyhow::bail!(
            "--save-frequency must be greater than 0 and at most the number of sampling steps ({respaced})"
        );
    }
    config
        .validate(cli.init_image.is_some())
        .context("Invalid settings")?;
    if config.class_score && config.class_cond && !has_labels {
        anyhow::bail!("--class-score needs a --labels file to rank");
    }
    if let Some(path) = &cli.init_image {
        if !path.exists() {
            return Err(CgdError::MissingInput(path.clone()).into());
        }
    }
    Ok(())
}

fn run(cli: Cli, debug: DebugFlags) -> Result<()> {
    let labels = cli.labels.as_deref().map(read_labels).transpose()?;
    let num_classes = labels.as_ref().map_or(DEFAULT_NUM_CLASSES, Vec::len);
    let config = cli.run_config(num_classes);
    check_settings(&cli, &config, labels.is_some())?;

    println!("burn-cgd: CLIP-guided diffusion in pure Rust\n");
    println!("Configuration:");
    println!("  Prompt:     {}", config.prompt);
    if let Some(min) = config.anti_prompt() {
        println!("  Penalize:   {} (weight {})", min, config.min_weight);
    }
    println!("  Size:       {}x{}", config.image_size, config.image_size);
    println!("  Steps:      {} of {}", config.timestep_respacing, config.diffusion_steps);
    println!("  Guidance:   {} (tv {})", config.clip_guidance_scale, config.tv_scale);
    println!("  Cutouts:    {} (power {})", config.num_cutouts, config.cutout_power);
    println!("  CLIP:       {}", config.clip_model);
    println!("  Batch:      {}", config.batch_size);
    println!("  Seed:       {}", config.seed);
    if let Some(path) = &cli.init_image {
        println!("  Init image: {} (skip {})", path.display(), config.skip_timesteps);
    }
    println!();

    let out_dir = txt_to_dir(&cli.prefix, &config.prompt, config.anti_prompt());
    prepare_output_dir(&out_dir, &config)?;

    let job = Job {
        config,
        labels,
        init_image: cli.init_image,
        out_dir,
        save_frequency: cli.save_frequency,
        debug,
    };

    use burn_cgd::backends::Autodiff;
    match resolve_device(cli.device)? {
        #[cfg(feature = "ndarray")]
        Device::Cpu => {
            use burn_cgd::backends::{NdArray, NdArrayDevice};
            generate::<Autodiff<NdArray>>(job, &NdArrayDevice::default())
        }
        #[cfg(feature = "tch")]
        Device::Tch => {
            use burn_cgd::backends::{libtorch_device, LibTorch};
            generate::<Autodiff<LibTorch>>(job, &libtorch_device())
        }
        #[cfg(feature = "wgpu")]
        Device::Wgpu => {
            use burn_cgd::backends::{Wgpu, WgpuDevice};
            generate::<Autodiff<Wgpu>>(job, &WgpuDevice::default())
        }
        #[cfg(feature = "cuda")]
        Device::Cuda => {
            use burn_cgd::backends::{Cuda, CudaDevice};
            generate::<Autodiff<Cuda>>(job, &CudaDevice::default())
        }
        Device::Auto => anyhow::bail!("Auto device should have been resolved"),
    }
}

/// Application entry point
fn main() -> Result<()> {
    let cli = Cli::parse();
    let debug = DebugFlags::from_args(&cli.debug);
    init_tracing(debug.any());

    let clip_model = cli.clip_model;
    match run(cli, debug) {
        Err(err) if is_out_of_memory(&err) => {
            eprintln!("[oom] {err:#}");
            eprintln!("[oom] --clip-model (currently {clip_model}) can have a large impact on memory use.");
            std::process::exit(1);
        }
        result => result,
    }
}
