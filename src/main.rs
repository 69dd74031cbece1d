use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use vinyl_restore::audio::{get_output_device, list_output_devices, read_wav, write_wav, Playback};
use vinyl_restore::clicks::{
    spawn_detection, spawn_removal, CancellationToken, ClickInfo, ClickRemover, ClickSettings,
    Decrackler, RepairMethod, TaskEvent, TaskHandle,
};
use vinyl_restore::config::Config;
use vinyl_restore::denoise::{render_offline, DenoiseSettings, StreamingDenoiser};
use vinyl_restore::inference::{runtime_available, ModelLocator, Provider, ProviderRegistry};

/// Denoise, declick and play back vinyl and tape transfers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file (defaults to ~/.vinyl-restore/settings.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Denoise a WAV file through the streaming pipeline
    Denoise {
        input: PathBuf,
        output: PathBuf,

        #[command(flatten)]
        denoise: DenoiseArgs,

        /// Host block size used to feed the denoiser
        #[arg(long, default_value = "512")]
        block_size: usize,
    },

    /// Detect clicks and print or save the list
    Detect {
        input: PathBuf,

        /// Write detected clicks as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        clicks: ClickArgs,
    },

    /// Remove clicks, detecting them or applying a reviewed list
    Remove {
        input: PathBuf,
        output: PathBuf,

        /// Apply this JSON click list instead of detecting
        #[arg(long)]
        clicks_file: Option<PathBuf>,

        #[command(flatten)]
        clicks: ClickArgs,
    },

    /// Smooth dense crackle
    Decrackle {
        input: PathBuf,
        output: PathBuf,

        /// Threshold relative to the mean absolute difference (0.01 - 1.0)
        #[arg(long, default_value = "0.2")]
        factor: f32,

        /// Averaging half-width in samples (1 - 10)
        #[arg(long, default_value = "3")]
        average_width: usize,
    },

    /// Play a WAV file through the denoiser in real time
    Play {
        input: PathBuf,

        /// Output device name (use "default" or run `providers --devices`)
        #[arg(short, long)]
        device: Option<String>,

        #[command(flatten)]
        denoise: DenoiseArgs,
    },

    /// Show inference providers, model search paths and output devices
    Providers {
        /// Also list output devices
        #[arg(long)]
        devices: bool,
    },
}

#[derive(Args, Debug)]
struct DenoiseArgs {
    /// Inference provider: auto, cpu, dml, qnn, cuda, rocm, coreml
    #[arg(short, long)]
    provider: Option<Provider>,

    /// Explicit model file
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// Only try the chosen provider
    #[arg(long)]
    no_fallback: bool,

    /// Accelerator device index
    #[arg(long)]
    device_id: Option<i32>,

    /// Wet/dry mix (0.0 - 1.0)
    #[arg(long, default_value = "1.0")]
    mix: f32,
}

impl DenoiseArgs {
    fn apply(&self, mut settings: DenoiseSettings) -> DenoiseSettings {
        if let Some(provider) = self.provider {
            settings.provider = provider;
        }
        if let Some(model) = &self.model {
            settings.model_path = Some(model.clone());
        }
        if self.no_fallback {
            settings.allow_fallback = false;
        }
        if let Some(device_id) = self.device_id {
            settings.device_id = device_id;
        }
        settings
    }
}

#[derive(Args, Debug)]
struct ClickArgs {
    /// Detection sensitivity (0 - 100)
    #[arg(short, long)]
    sensitivity: Option<f32>,

    /// Widest click repaired, in samples
    #[arg(long)]
    max_width: Option<usize>,

    /// Repair method: interpolation, crossfade or automatic
    #[arg(long)]
    method: Option<RepairMethod>,

    /// First sample of the range to process
    #[arg(long, default_value = "0")]
    start: usize,

    /// End of the range to process (defaults to the end of the file)
    #[arg(long)]
    end: Option<usize>,
}

impl ClickArgs {
    fn apply(&self, mut settings: ClickSettings) -> ClickSettings {
        if let Some(sensitivity) = self.sensitivity {
            settings.sensitivity = sensitivity;
        }
        if let Some(max_width) = self.max_width {
            settings.max_width = max_width;
        }
        if let Some(method) = self.method {
            settings.method = method;
        }
        settings
    }

    fn range(&self) -> std::ops::Range<usize> {
        self.start..self.end.unwrap_or(usize::MAX)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(),
    };
    debug!("Config: {:?}", config);

    match cli.command {
        Command::Denoise {
            input,
            output,
            denoise,
            block_size,
        } => run_denoise(&config, &input, &output, &denoise, block_size),
        Command::Detect {
            input,
            output,
            clicks,
        } => run_detect(&config, &input, output.as_deref(), &clicks).await,
        Command::Remove {
            input,
            output,
            clicks_file,
            clicks,
        } => run_remove(&config, &input, &output, clicks_file.as_deref(), &clicks).await,
        Command::Decrackle {
            input,
            output,
            factor,
            average_width,
        } => run_decrackle(&input, &output, factor, average_width),
        Command::Play {
            input,
            device,
            denoise,
        } => run_play(&config, &input, device.as_deref(), &denoise).await,
        Command::Providers { devices } => show_providers(&config, devices),
    }
}

fn run_denoise(
    config: &Config,
    input: &Path,
    output: &Path,
    args: &DenoiseArgs,
    block_size: usize,
) -> Result<()> {
    let (buffer, sample_rate) = read_wav(input)?;
    info!(
        "Denoising {:?}: {} Hz, {} channels, {} samples",
        input,
        sample_rate,
        buffer.num_channels(),
        buffer.num_samples()
    );

    let mut denoiser = StreamingDenoiser::new(args.apply(config.denoise.clone()));
    denoiser
        .prepare(sample_rate as f64, buffer.num_channels(), block_size)
        .context("Failed to prepare denoiser")?;

    match denoiser.active_provider() {
        Some(provider) => info!(
            "Using {} with model {:?}",
            provider,
            denoiser.active_model_path()
        ),
        None => warn!("No model could be opened, output will equal the input"),
    }

    let denoised = render_offline(&mut denoiser, &buffer, block_size, args.mix);
    if denoiser.failed_frames() > 0 {
        warn!("{} frames failed inference and passed through", denoiser.failed_frames());
    }

    write_wav(output, &denoised, sample_rate)?;
    println!("Wrote {:?}", output);
    Ok(())
}

/// Cancel `token` on Ctrl+C
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, cancelling...");
        token.cancel();
    });
}

/// Drive a task to completion, printing progress
async fn await_task<T>(mut handle: TaskHandle<T>) -> Option<T> {
    let mut last_percent = None;
    let mut result = None;
    while let Some(event) = handle.recv().await {
        match event {
            TaskEvent::Progress(fraction) => {
                let percent = (fraction * 100.0) as u32;
                if last_percent.map_or(true, |p| percent >= p + 10) {
                    eprintln!("  {:3}%", percent);
                    last_percent = Some(percent);
                }
            }
            TaskEvent::Finished(value) => {
                result = Some(value);
                break;
            }
        }
    }
    handle.join();
    result
}

fn print_clicks(clicks: &[ClickInfo], sample_rate: u32) {
    for click in clicks {
        let seconds = click.position as f64 / sample_rate as f64;
        let channel = click
            .channel
            .map_or_else(|| "all".to_string(), |c| c.to_string());
        println!(
            "  {:>10.4}s  pos {:>10}  width {:>4}  ch {:>3}  magnitude {:.3}",
            seconds, click.position, click.width, channel, click.magnitude
        );
    }
}

async fn run_detect(
    config: &Config,
    input: &Path,
    output: Option<&Path>,
    args: &ClickArgs,
) -> Result<()> {
    let (buffer, sample_rate) = read_wav(input)?;
    let settings = args.apply(config.clicks.clone());
    let token = CancellationToken::new();

    let handle = spawn_detection(Arc::new(buffer), args.range(), settings, token.clone())?;
    cancel_on_ctrl_c(token);

    let result = await_task(handle)
        .await
        .context("Detection task ended without a result")?;
    if result.cancelled {
        warn!("Detection cancelled after {} samples", result.samples_scanned);
    }

    println!("\nDetected {} clicks", result.clicks.len());
    print_clicks(&result.clicks, sample_rate);

    if let Some(path) = output {
        let json = serde_json::to_string_pretty(&result.clicks)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {:?}", path))?;
        println!("Wrote click list to {:?}", path);
    }
    Ok(())
}

async fn run_remove(
    config: &Config,
    input: &Path,
    output: &Path,
    clicks_file: Option<&Path>,
    args: &ClickArgs,
) -> Result<()> {
    let (mut buffer, sample_rate) = read_wav(input)?;
    let settings = args.apply(config.clicks.clone());

    if let Some(path) = clicks_file {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        let clicks: Vec<ClickInfo> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse click list {:?}", path))?;
        let repaired = ClickRemover::apply(&mut buffer, &clicks, &settings);
        println!("Repaired {} of {} listed clicks", repaired, clicks.len());
        write_wav(output, &buffer, sample_rate)?;
        return Ok(());
    }

    let token = CancellationToken::new();
    let handle = spawn_removal(buffer, args.range(), settings, token.clone())?;
    cancel_on_ctrl_c(token);

    let result = await_task(handle)
        .await
        .context("Removal task ended without a result")?;
    if result.cancelled {
        warn!(
            "Removal cancelled: first {} samples of the range repaired",
            result.samples_committed
        );
    }

    println!("\nRemoved {} clicks", result.removed());
    print_clicks(&result.clicks, sample_rate);
    write_wav(output, &result.buffer, sample_rate)?;
    Ok(())
}

fn run_decrackle(input: &Path, output: &Path, factor: f32, average_width: usize) -> Result<()> {
    let (mut buffer, sample_rate) = read_wav(input)?;
    let decrackler = Decrackler::new(factor, average_width);
    let flagged = decrackler.process(&mut buffer);
    println!("Smoothed {} samples", flagged);
    write_wav(output, &buffer, sample_rate)?;
    Ok(())
}

async fn run_play(
    config: &Config,
    input: &Path,
    device_name: Option<&str>,
    args: &DenoiseArgs,
) -> Result<()> {
    let (buffer, sample_rate) = read_wav(input)?;
    let device = get_output_device(device_name)?;
    let denoiser = StreamingDenoiser::new(args.apply(config.denoise.clone()));

    let playback = Playback::new(&device, buffer, sample_rate, denoiser, args.mix)?;
    let token = CancellationToken::new();
    cancel_on_ctrl_c(token.clone());

    playback.start()?;
    println!("\nPlaying... Press Ctrl+C to stop.\n");

    while !playback.is_finished() && !token.is_cancelled() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    playback.stop()?;
    info!("Playback ended at {:.0}%", playback.progress() * 100.0);
    Ok(())
}

fn show_providers(config: &Config, devices: bool) -> Result<()> {
    let registry = ProviderRegistry::onnx();
    let preferred = config.denoise.provider;

    let runtime = if runtime_available() { "loaded" } else { "not found" };
    println!("ONNX Runtime: {}\n", runtime);
    println!("Inference providers:\n");
    for &provider in Provider::all() {
        let available = registry.backend(provider).is_some_and(|b| b.probe());
        let marker = if available { "available" } else { "unavailable" };
        println!("  - {:<8} {}", provider.as_str(), marker);
    }

    let order = registry.candidates(preferred, config.denoise.allow_fallback);
    let order: Vec<&str> = order.iter().map(|p| p.as_str()).collect();
    println!("\nTry order for {}: {}", preferred, order.join(", "));

    let locator = ModelLocator::new();
    println!("\nModel search roots:");
    for root in locator.search_roots() {
        println!("  - {:?}", root);
    }
    match locator.find(config.denoise.model_path.as_deref(), preferred) {
        Some(path) => println!("\nModel: {:?}", path),
        None => println!("\nModel: not found ({}*.onnx)", locator.base()),
    }

    if devices {
        println!("\nOutput devices:\n");
        match list_output_devices() {
            Ok(devices) if devices.is_empty() => println!("  No output devices found."),
            Ok(devices) => {
                for device in devices {
                    let default_marker = if device.is_default { " (default)" } else { "" };
                    println!("  - {}{}", device.name, default_marker);
                }
            }
            Err(e) => warn!("Failed to list output devices: {}", e),
        }
    }
    Ok(())
}
