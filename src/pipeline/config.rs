//! Per-session pipeline configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::encoder::{Codec, EncoderBackendKind, EncoderSettings, DEFAULT_BITRATE_BPS};
use crate::errors::ConfigError;
use crate::format::PixelFormat;
use crate::sink::{SinkKind, SinkSettings};
use crate::source::SourceFormat;
use crate::timing;

pub const MIN_FRAMERATE_HZ: u32 = 5;
pub const MAX_FRAMERATE_HZ: u32 = 60;
pub const DEFAULT_FRAMERATE_HZ: u32 = 30;

/// Everything a session needs, fixed once `start` accepts it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub target_framerate_hz: u32,
    /// Layout handed to the encoder
    pub output_pixel_format: PixelFormat,
    pub bitrate_bps: u32,
    /// Backend default when unset
    pub encoder_preset: Option<String>,
    pub max_frames: Option<u64>,
    pub output_path: PathBuf,
    pub codec: Codec,
    pub lossless: bool,
    pub encoder: EncoderBackendKind,
    /// Chosen from the output extension when unset
    pub sink: Option<SinkKind>,
    pub title: Option<String>,
}

impl PipelineConfig {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        let encoder = EncoderBackendKind::default();
        Self {
            target_framerate_hz: DEFAULT_FRAMERATE_HZ,
            output_pixel_format: preferred_format(encoder, Codec::H264),
            bitrate_bps: DEFAULT_BITRATE_BPS,
            encoder_preset: None,
            max_frames: None,
            output_path: output_path.into(),
            codec: Codec::H264,
            lossless: false,
            encoder,
            sink: None,
            title: None,
        }
    }

    pub fn with_framerate(mut self, hz: u32) -> Self {
        self.target_framerate_hz = hz;
        self
    }

    pub fn with_bitrate(mut self, bitrate_bps: u32) -> Self {
        self.bitrate_bps = bitrate_bps;
        self
    }

    /// Also moves the pixel format to one the encoder accepts for `codec`.
    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self.realign_pixel_format();
        self
    }

    pub fn with_pixel_format(mut self, format: PixelFormat) -> Self {
        self.output_pixel_format = format;
        self
    }

    pub fn with_max_frames(mut self, max_frames: u64) -> Self {
        self.max_frames = Some(max_frames);
        self
    }

    pub fn with_preset(mut self, preset: impl Into<String>) -> Self {
        self.encoder_preset = Some(preset.into());
        self
    }

    pub fn with_lossless(mut self, lossless: bool) -> Self {
        self.lossless = lossless;
        self
    }

    /// Also moves the pixel format to one the new backend accepts.
    pub fn with_encoder(mut self, encoder: EncoderBackendKind) -> Self {
        self.encoder = encoder;
        self.realign_pixel_format();
        self
    }

    pub fn with_sink(mut self, sink: SinkKind) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    fn realign_pixel_format(&mut self) {
        if !self.encoder.supports(self.output_pixel_format, self.codec) {
            self.output_pixel_format = preferred_format(self.encoder, self.codec);
        }
    }

    pub fn tick_interval(&self) -> Duration {
        timing::tick_interval(self.target_framerate_hz)
    }

    pub fn preset(&self) -> &str {
        self.encoder_preset
            .as_deref()
            .unwrap_or_else(|| self.encoder.default_preset())
    }

    pub fn sink_kind(&self) -> SinkKind {
        self.sink
            .unwrap_or_else(|| SinkKind::for_path(&self.output_path))
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_FRAMERATE_HZ..=MAX_FRAMERATE_HZ).contains(&self.target_framerate_hz) {
            return Err(ConfigError::FramerateOutOfRange(self.target_framerate_hz));
        }
        if self.bitrate_bps == 0 {
            return Err(ConfigError::ZeroBitrate);
        }
        if self.max_frames == Some(0) {
            return Err(ConfigError::ZeroMaxFrames);
        }
        if self.output_path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyOutputPath);
        }
        if !self.encoder.supports(self.output_pixel_format, self.codec) {
            return Err(ConfigError::InvalidValue(format!(
                "{} encoder cannot encode {} input as {}",
                self.encoder, self.output_pixel_format, self.codec
            )));
        }
        if self.lossless && !self.encoder.supports_lossless() {
            return Err(ConfigError::InvalidValue(format!(
                "{} encoder has no lossless mode",
                self.encoder
            )));
        }

        let sink = self.sink_kind();
        if sink.requires_frame_aligned() && !self.encoder.is_frame_aligned() {
            return Err(ConfigError::IncompatibleSink {
                sink: sink.to_string(),
                encoder: self.encoder.to_string(),
            });
        }
        if sink == SinkKind::Mp4 && self.codec != Codec::H264 {
            return Err(ConfigError::IncompatibleSink {
                sink: sink.to_string(),
                encoder: format!("{} {}", self.encoder, self.codec),
            });
        }
        if !cfg!(feature = "recording") {
            if self.encoder == EncoderBackendKind::OpenH264 {
                return Err(ConfigError::BackendUnavailable(
                    "openh264 encoder needs the `recording` feature".into(),
                ));
            }
            if sink == SinkKind::Mp4 {
                return Err(ConfigError::BackendUnavailable(
                    "mp4 output needs the `recording` feature".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn encoder_settings(&self, source: SourceFormat) -> EncoderSettings {
        EncoderSettings::new(source.width, source.height, self.output_pixel_format)
            .with_codec(self.codec)
            .with_bitrate(self.bitrate_bps)
            .with_preset(self.preset())
            .with_lossless(self.lossless)
            .with_framerate(self.target_framerate_hz)
    }

    pub fn sink_settings(&self, source: SourceFormat) -> SinkSettings {
        SinkSettings {
            path: self.output_path.clone(),
            codec: self.codec,
            framerate_hz: self.target_framerate_hz,
            width: source.width,
            height: source.height,
            title: self.title.clone(),
        }
    }
}

fn preferred_format(encoder: EncoderBackendKind, codec: Codec) -> PixelFormat {
    encoder
        .input_formats(codec)
        .first()
        .copied()
        .unwrap_or(PixelFormat::Yuv420)
}
