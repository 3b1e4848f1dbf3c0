//! File configuration for the `acquire-video` tool
//!
//! An [`AppConfig`] is read from TOML and turned into the [`PipelineConfig`]
//! a session runs with. The library core never looks at this file itself.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::encoder::{Codec, EncoderBackendKind, DEFAULT_BITRATE_BPS};
use crate::errors::ConfigError;
use crate::format::PixelFormat;
use crate::pipeline::config::DEFAULT_FRAMERATE_HZ;
use crate::pipeline::PipelineConfig;
use crate::sink::SinkKind;
use crate::source::SourceFormat;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub capture: CaptureConfig,
    pub encoder: EncoderConfig,
    pub output: OutputConfig,
}

/// Camera selection and pacing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Index into the enumerated device list
    pub device_index: u32,
    /// Use the built-in synthetic camera instead of hardware
    pub synthetic: bool,
    /// Synthetic camera geometry
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub framerate_hz: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub backend: EncoderBackendKind,
    pub codec: Codec,
    pub bitrate_bps: u32,
    /// Backend default when unset
    pub preset: Option<String>,
    pub lossless: bool,
    /// Encoder input layout; the backend's preferred one when unset
    pub pixel_format: Option<PixelFormat>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Timestamped file in the working directory when unset
    pub path: Option<PathBuf>,
    /// Chosen from the file extension when unset
    pub sink: Option<SinkKind>,
    pub max_frames: Option<u64>,
    pub title: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            synthetic: false,
            width: 640,
            height: 480,
            pixel_format: PixelFormat::Gray8,
            framerate_hz: DEFAULT_FRAMERATE_HZ,
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            backend: EncoderBackendKind::default(),
            codec: Codec::H264,
            bitrate_bps: DEFAULT_BITRATE_BPS,
            preset: None,
            lossless: false,
            pixel_format: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;

        let config: AppConfig = toml::from_str(&contents)
            .map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    ConfigError::Io(format!("failed to create config directory: {}", e))
                })?;
            }
        }

        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Parse(format!("failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| ConfigError::Io(format!("failed to write config file: {}", e)))?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        PathBuf::from("acquire-video.toml")
    }

    /// Load from default location or fall back to defaults
    pub fn load_or_default() -> Self {
        Self::load_from_file(Self::default_path()).unwrap_or_else(|e| {
            log::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Geometry of the synthetic camera
    pub fn synthetic_format(&self) -> SourceFormat {
        SourceFormat::new(
            self.capture.width,
            self.capture.height,
            self.capture.pixel_format,
        )
    }

    /// Output path, defaulting to `capture-<timestamp>.<ext>`
    pub fn output_path(&self) -> PathBuf {
        self.output.path.clone().unwrap_or_else(|| {
            let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
            PathBuf::from(format!(
                "capture-{}.{}",
                stamp,
                self.encoder.codec.file_extension()
            ))
        })
    }

    pub fn to_pipeline_config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::new(self.output_path())
            .with_framerate(self.capture.framerate_hz)
            .with_encoder(self.encoder.backend)
            .with_codec(self.encoder.codec)
            .with_bitrate(self.encoder.bitrate_bps)
            .with_lossless(self.encoder.lossless);
        if let Some(format) = self.encoder.pixel_format {
            config = config.with_pixel_format(format);
        }
        if let Some(preset) = &self.encoder.preset {
            config = config.with_preset(preset.clone());
        }
        if let Some(sink) = self.output.sink {
            config = config.with_sink(sink);
        }
        if let Some(max_frames) = self.output.max_frames {
            config = config.with_max_frames(max_frames);
        }
        if let Some(title) = &self.output.title {
            config = config.with_title(title.clone());
        }
        config
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capture.synthetic {
            crate::format::validate_dimensions(
                self.capture.width,
                self.capture.height,
                self.capture.pixel_format,
            )
            .map_err(|e| ConfigError::InvalidValue(e.to_string()))?;
        }
        self.to_pipeline_config().validate()
    }
}
