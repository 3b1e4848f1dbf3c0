use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use acquire_video::source::CameraBackend;
use acquire_video::testing::SyntheticCamera;
use acquire_video::errors::PipelineError;
use acquire_video::{
    AppConfig, Codec, DeviceInfo, EncoderBackendKind, FrameSource, Pipeline, PixelFormat,
    SessionSummary, SinkKind,
};
use anyhow::Context;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "acquire-video")]
#[command(about = "Record a camera to H.264/H.265 video")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available cameras
    ListDevices {
        #[arg(long)]
        json: bool,

        /// List the synthetic camera instead of hardware
        #[arg(long)]
        synthetic: bool,
    },

    /// Record until Ctrl-C, --max-frames or --duration
    Record {
        /// Output file; `.h264`/`.h265` raw stream, `.mp4` or anything ffmpeg can mux
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// TOML configuration (default: ./acquire-video.toml if present)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Camera index to use (from 'list-devices')
        #[arg(short = 'd', long)]
        device: Option<u32>,

        /// Target frame rate, 5-60 Hz
        #[arg(long)]
        fps: Option<u32>,

        #[arg(long)]
        codec: Option<Codec>,

        #[arg(long)]
        bitrate: Option<u32>,

        #[arg(long)]
        preset: Option<String>,

        #[arg(long)]
        lossless: bool,

        /// openh264, ffmpeg or nvenc
        #[arg(long)]
        encoder: Option<EncoderBackendKind>,

        /// file, mp4 or ffmpeg-mux
        #[arg(long)]
        sink: Option<SinkKind>,

        #[arg(long)]
        max_frames: Option<u64>,

        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,

        /// Record from a synthetic moving-gradient camera
        #[arg(long)]
        synthetic: bool,

        /// Synthetic camera geometry, e.g. 640x480
        #[arg(long)]
        size: Option<String>,

        /// Synthetic camera pixel format, e.g. GRAY8 or BAYER_RG8
        #[arg(long)]
        pixel_format: Option<PixelFormat>,

        /// Print the session summary as JSON
        #[arg(long)]
        json: bool,
    },
}

const EXIT_NO_DEVICES: u8 = 2;
const EXIT_SESSION_FAILED: u8 = 3;

fn main() -> ExitCode {
    acquire_video::init_logging();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::ListDevices { json, synthetic } => cmd_list_devices(json, synthetic),
        Commands::Record {
            output,
            config,
            device,
            fps,
            codec,
            bitrate,
            preset,
            lossless,
            encoder,
            sink,
            max_frames,
            duration,
            synthetic,
            size,
            pixel_format,
            json,
        } => {
            let overrides = Overrides {
                output,
                device,
                fps,
                codec,
                bitrate,
                preset,
                lossless,
                encoder,
                sink,
                max_frames,
                synthetic,
                size,
                pixel_format,
            };
            cmd_record(config, overrides, duration.map(Duration::from_secs), json)
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn exit_code_for(e: &anyhow::Error) -> u8 {
    match e.downcast_ref::<PipelineError>() {
        Some(PipelineError::NoDevices) => EXIT_NO_DEVICES,
        _ => EXIT_SESSION_FAILED,
    }
}

fn camera_backend(synthetic: bool, config: &AppConfig) -> anyhow::Result<Box<dyn CameraBackend>> {
    if synthetic {
        return Ok(Box::new(SyntheticCamera::new(
            config.synthetic_format(),
            config.capture.framerate_hz,
        )));
    }
    hardware_backend()
}

#[cfg(feature = "camera")]
fn hardware_backend() -> anyhow::Result<Box<dyn CameraBackend>> {
    Ok(Box::new(acquire_video::source::NokhwaBackend))
}

#[cfg(not(feature = "camera"))]
fn hardware_backend() -> anyhow::Result<Box<dyn CameraBackend>> {
    anyhow::bail!("built without the `camera` feature; use --synthetic")
}

fn cmd_list_devices(json: bool, synthetic: bool) -> anyhow::Result<ExitCode> {
    let config = AppConfig::default();
    let backend = camera_backend(synthetic, &config)?;
    let devices = backend.enumerate_devices()?;

    if json {
        println!("{}", serde_json::to_string(&devices)?);
    } else {
        for d in &devices {
            println!("{}: {} ({})", d.index, d.name, d.description);
        }
    }

    if devices.is_empty() {
        if !json {
            eprintln!("No cameras found");
        }
        return Ok(ExitCode::from(EXIT_NO_DEVICES));
    }
    Ok(ExitCode::SUCCESS)
}

struct Overrides {
    output: Option<PathBuf>,
    device: Option<u32>,
    fps: Option<u32>,
    codec: Option<Codec>,
    bitrate: Option<u32>,
    preset: Option<String>,
    lossless: bool,
    encoder: Option<EncoderBackendKind>,
    sink: Option<SinkKind>,
    max_frames: Option<u64>,
    synthetic: bool,
    size: Option<String>,
    pixel_format: Option<PixelFormat>,
}

impl Overrides {
    fn apply(self, config: &mut AppConfig) -> anyhow::Result<()> {
        if let Some(path) = self.output {
            config.output.path = Some(path);
        }
        if let Some(index) = self.device {
            config.capture.device_index = index;
        }
        if let Some(fps) = self.fps {
            config.capture.framerate_hz = fps;
        }
        if let Some(codec) = self.codec {
            config.encoder.codec = codec;
        }
        if let Some(bitrate) = self.bitrate {
            config.encoder.bitrate_bps = bitrate;
        }
        if self.preset.is_some() {
            config.encoder.preset = self.preset;
        }
        if self.lossless {
            config.encoder.lossless = true;
        }
        if let Some(encoder) = self.encoder {
            config.encoder.backend = encoder;
        }
        if self.sink.is_some() {
            config.output.sink = self.sink;
        }
        if self.max_frames.is_some() {
            config.output.max_frames = self.max_frames;
        }
        if self.synthetic {
            config.capture.synthetic = true;
        }
        if let Some(size) = self.size {
            let (w, h) = parse_size(&size)?;
            config.capture.width = w;
            config.capture.height = h;
        }
        if let Some(format) = self.pixel_format {
            config.capture.pixel_format = format;
        }
        Ok(())
    }
}

fn parse_size(s: &str) -> anyhow::Result<(u32, u32)> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .with_context(|| format!("size '{}' is not WIDTHxHEIGHT", s))?;
    Ok((w.trim().parse()?, h.trim().parse()?))
}

fn open_device(backend: &dyn CameraBackend, index: u32) -> anyhow::Result<Box<dyn FrameSource>> {
    let devices = backend.enumerate_devices()?;
    if devices.is_empty() {
        return Err(PipelineError::NoDevices.into());
    }
    let device: &DeviceInfo = devices
        .iter()
        .find(|d| d.index == index)
        .with_context(|| format!("no camera with index {} ({} found)", index, devices.len()))?;
    log::info!("Opening camera {}: {}", device.index, device.name);
    Ok(backend.open(device)?)
}

fn cmd_record(
    config_path: Option<PathBuf>,
    overrides: Overrides,
    duration: Option<Duration>,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let mut config = match config_path {
        Some(path) => AppConfig::load_from_file(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AppConfig::load_or_default(),
    };
    overrides.apply(&mut config)?;
    config.validate()?;

    let backend = camera_backend(config.capture.synthetic, &config)?;
    let source = open_device(backend.as_ref(), config.capture.device_index)?;
    let pipeline = Pipeline::new(source);

    let pipeline_config = config.to_pipeline_config();
    let output = pipeline_config.output_path.clone();
    pipeline.start(pipeline_config)?;

    if let Some(handle) = pipeline.stop_handle() {
        ctrlc::set_handler(move || handle.request_stop())
            .context("installing Ctrl-C handler")?;
    }
    if !json {
        println!("Recording to {} (Ctrl-C to stop)", output.display());
    }

    let started = Instant::now();
    loop {
        if pipeline.wait_finished(Duration::from_millis(200)) {
            break;
        }
        if duration.is_some_and(|d| started.elapsed() >= d) {
            break;
        }
    }

    let summary = pipeline.stop()?;
    print_summary(&summary, json)?;

    if summary.last_error.is_some() {
        return Ok(ExitCode::from(EXIT_SESSION_FAILED));
    }
    Ok(ExitCode::SUCCESS)
}

fn print_summary(summary: &SessionSummary, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!("Session {}", summary.session_id);
    println!("  output:   {}", summary.output_path.display());
    println!("  written:  {} frames, {} bytes", summary.frames_written, summary.bytes_written);
    println!(
        "  dropped:  {} (incomplete {}, timeout {}, conversion {}, encoder {}, evicted {})",
        summary.frames_dropped,
        summary.drops.incomplete,
        summary.drops.timeout,
        summary.drops.conversion,
        summary.drops.encoder,
        summary.drops.evicted
    );
    println!("  overruns: {}", summary.ticks_overrun);
    println!("  elapsed:  {:.2}s", summary.elapsed_secs);
    if let Some(kind) = summary.last_error {
        println!(
            "  error:    {:?}: {}",
            kind,
            summary.last_error_message.as_deref().unwrap_or("")
        );
    }
    Ok(())
}
