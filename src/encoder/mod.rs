//! Stateful frame encoders
//!
//! [`FrameEncoder`] wraps a concrete [`EncoderBackend`] and enforces the
//! `Idle -> Encoding -> Flushing -> Closed` lifecycle, input validation and
//! the empty-bitstream check. Backends only translate frames to bytes.

pub mod ffmpeg;

#[cfg(feature = "recording")]
pub mod h264;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::EncodeError;
use crate::format::PixelFormat;
use crate::frame::{EncodedChunk, Frame};

pub use ffmpeg::PipeEncoder;

#[cfg(feature = "recording")]
pub use h264::OpenH264Backend;

pub const DEFAULT_BITRATE_BPS: u32 = 4_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    H264,
    H265,
}

impl Codec {
    pub fn as_str(&self) -> &'static str {
        match self {
            Codec::H264 => "h264",
            Codec::H265 => "h265",
        }
    }

    /// ffmpeg demuxer name for the raw Annex B stream
    pub fn elementary_format(&self) -> &'static str {
        match self {
            Codec::H264 => "h264",
            Codec::H265 => "hevc",
        }
    }

    pub fn file_extension(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Codec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "h264" | "avc" => Ok(Codec::H264),
            "h265" | "hevc" => Ok(Codec::H265),
            other => Err(format!("unknown codec '{other}' (expected h264 or h265)")),
        }
    }
}

/// Which implementation produces the bitstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderBackendKind {
    /// In-process Cisco openh264 (H.264 only)
    OpenH264,
    /// ffmpeg subprocess with libx264 / libx265
    Ffmpeg,
    /// ffmpeg subprocess with h264_nvenc / hevc_nvenc
    #[serde(rename = "nvenc")]
    FfmpegNvenc,
}

impl Default for EncoderBackendKind {
    fn default() -> Self {
        if cfg!(feature = "recording") {
            EncoderBackendKind::OpenH264
        } else {
            EncoderBackendKind::Ffmpeg
        }
    }
}

impl EncoderBackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncoderBackendKind::OpenH264 => "openh264",
            EncoderBackendKind::Ffmpeg => "ffmpeg",
            EncoderBackendKind::FfmpegNvenc => "nvenc",
        }
    }

    pub fn default_preset(&self) -> &'static str {
        match self {
            EncoderBackendKind::OpenH264 => "default",
            EncoderBackendKind::Ffmpeg => "medium",
            EncoderBackendKind::FfmpegNvenc => "p4",
        }
    }

    /// Pixel layouts accepted for `codec`, preferred layout first.
    /// Empty when the backend cannot produce `codec` at all.
    pub fn input_formats(&self, codec: Codec) -> &'static [PixelFormat] {
        use PixelFormat::*;
        match (self, codec) {
            (EncoderBackendKind::OpenH264, Codec::H264) => &[Yuv420],
            (EncoderBackendKind::OpenH264, Codec::H265) => &[],
            (EncoderBackendKind::Ffmpeg, Codec::H264) => &[Yuv420, Nv12, Yuv444],
            (EncoderBackendKind::Ffmpeg, Codec::H265) => &[Yuv420, Yuv444],
            (EncoderBackendKind::FfmpegNvenc, Codec::H264) => &[Nv12, Yuv420, Yuv444],
            (EncoderBackendKind::FfmpegNvenc, Codec::H265) => {
                &[Nv12, Yuv420, Yuv444, P010, Yuv444_16Bit]
            }
        }
    }

    pub fn supports(&self, format: PixelFormat, codec: Codec) -> bool {
        self.input_formats(codec).contains(&format)
    }

    pub fn supports_lossless(&self) -> bool {
        !matches!(self, EncoderBackendKind::OpenH264)
    }

    /// Whether every chunk is exactly one access unit for one frame
    pub fn is_frame_aligned(&self) -> bool {
        matches!(self, EncoderBackendKind::OpenH264)
    }
}

impl fmt::Display for EncoderBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncoderBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openh264" => Ok(EncoderBackendKind::OpenH264),
            "ffmpeg" | "x264" | "software" => Ok(EncoderBackendKind::Ffmpeg),
            "nvenc" | "ffmpeg-nvenc" => Ok(EncoderBackendKind::FfmpegNvenc),
            other => Err(format!(
                "unknown encoder '{other}' (expected openh264, ffmpeg or nvenc)"
            )),
        }
    }
}

/// Construction parameters shared by every backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderSettings {
    pub width: u32,
    pub height: u32,
    pub input_format: PixelFormat,
    pub bitrate_bps: u32,
    pub preset: String,
    pub codec: Codec,
    pub lossless: bool,
    pub framerate_hz: u32,
}

impl EncoderSettings {
    pub fn new(width: u32, height: u32, input_format: PixelFormat) -> Self {
        Self {
            width,
            height,
            input_format,
            bitrate_bps: DEFAULT_BITRATE_BPS,
            preset: "medium".to_string(),
            codec: Codec::H264,
            lossless: false,
            framerate_hz: 30,
        }
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_bitrate(mut self, bitrate_bps: u32) -> Self {
        self.bitrate_bps = bitrate_bps;
        self
    }

    pub fn with_preset(mut self, preset: impl Into<String>) -> Self {
        self.preset = preset.into();
        self
    }

    pub fn with_lossless(mut self, lossless: bool) -> Self {
        self.lossless = lossless;
        self
    }

    pub fn with_framerate(mut self, framerate_hz: u32) -> Self {
        self.framerate_hz = framerate_hz;
        self
    }
}

/// A concrete encoder implementation.
///
/// `encode` may return zero chunks while the backend buffers lookahead, but
/// every chunk it returns must belong to frames in submission order.
/// `DeviceBusy` means the frame was not consumed and may be resubmitted.
pub trait EncoderBackend: Send {
    fn name(&self) -> &'static str;

    /// True when each `encode` call yields the access unit for that frame
    fn frame_aligned(&self) -> bool;

    fn encode(&mut self, frame: &Frame) -> Result<Vec<EncodedChunk>, EncodeError>;

    /// Drain everything still buffered. Called exactly once.
    ///
    /// Chunks read before a failure are returned alongside the error.
    fn flush(&mut self) -> Drained;
}

/// Everything a backend emitted while draining.
///
/// `chunks` is valid even when `error` is set: it holds the bitstream read
/// before the backend failed.
#[derive(Debug, Default)]
pub struct Drained {
    pub chunks: Vec<EncodedChunk>,
    pub error: Option<EncodeError>,
}

impl Drained {
    pub fn complete(chunks: Vec<EncodedChunk>) -> Self {
        Self {
            chunks,
            error: None,
        }
    }

    pub fn failed(chunks: Vec<EncodedChunk>, error: EncodeError) -> Self {
        Self {
            chunks,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<Vec<EncodedChunk>, EncodeError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.chunks),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncoderState {
    Idle,
    Encoding,
    Flushing,
    Closed,
}

pub struct FrameEncoder {
    settings: EncoderSettings,
    backend: Box<dyn EncoderBackend>,
    state: EncoderState,
    accepted: u64,
}

impl FrameEncoder {
    pub fn new(settings: EncoderSettings, backend: Box<dyn EncoderBackend>) -> Self {
        Self {
            settings,
            backend,
            state: EncoderState::Idle,
            accepted: 0,
        }
    }

    pub fn state(&self) -> EncoderState {
        self.state
    }

    pub fn input_format(&self) -> PixelFormat {
        self.settings.input_format
    }

    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn is_frame_aligned(&self) -> bool {
        self.backend.frame_aligned()
    }

    /// Frames the backend has accepted; each one is represented in the
    /// output once `finish` returns.
    pub fn frames_submitted(&self) -> u64 {
        self.accepted
    }

    /// Encode one frame.
    ///
    /// # Panics
    ///
    /// If called after [`finish`](Self::finish).
    pub fn submit_frame(&mut self, frame: &Frame) -> Result<Vec<EncodedChunk>, EncodeError> {
        assert!(
            matches!(self.state, EncoderState::Idle | EncoderState::Encoding),
            "submit_frame called on a {:?} encoder",
            self.state
        );

        if frame.pixel_format() != self.settings.input_format {
            return Err(EncodeError::UnsupportedFormat {
                format: frame.pixel_format(),
                codec: self.settings.codec,
            });
        }
        if frame.width() != self.settings.width || frame.height() != self.settings.height {
            return Err(EncodeError::GeometryMismatch {
                expected_width: self.settings.width,
                expected_height: self.settings.height,
                width: frame.width(),
                height: frame.height(),
            });
        }

        self.state = EncoderState::Encoding;
        let mut chunks = self.backend.encode(frame)?;

        let aligned = self.backend.frame_aligned();
        if chunks.iter().any(EncodedChunk::is_empty) || (aligned && chunks.is_empty()) {
            return Err(EncodeError::EmptyBitstream {
                sequence: frame.sequence(),
            });
        }

        if aligned {
            for chunk in &mut chunks {
                chunk.frame_index = Some(self.accepted);
            }
        }
        self.accepted += 1;
        Ok(chunks)
    }

    /// Drain the backend. The last returned chunk has `is_final` set.
    ///
    /// Calling `finish` again on a closed encoder returns no chunks. A
    /// backend failure discards the tail; use [`drain`](Self::drain) to keep it.
    pub fn finish(&mut self) -> Result<Vec<EncodedChunk>, EncodeError> {
        self.drain().into_result()
    }

    /// Drain the backend, keeping whatever it emitted before failing.
    pub fn drain(&mut self) -> Drained {
        if self.state == EncoderState::Closed {
            return Drained::default();
        }
        self.state = EncoderState::Flushing;
        let Drained { chunks, error } = self.backend.flush();
        self.state = EncoderState::Closed;

        let mut chunks: Vec<EncodedChunk> = chunks.into_iter().filter(|c| !c.is_empty()).collect();
        match chunks.last_mut() {
            Some(last) => last.is_final = true,
            None => {
                let mut terminator = EncodedChunk::new(Vec::new());
                terminator.is_final = true;
                chunks.push(terminator);
            }
        }
        match &error {
            Some(e) => log::warn!(
                "{} encoder failed while draining after {} frames: {}",
                self.backend.name(),
                self.accepted,
                e
            ),
            None => log::debug!(
                "{} encoder closed after {} frames",
                self.backend.name(),
                self.accepted
            ),
        }
        Drained { chunks, error }
    }
}

impl fmt::Debug for FrameEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameEncoder")
            .field("backend", &self.backend.name())
            .field("settings", &self.settings)
            .field("state", &self.state)
            .field("accepted", &self.accepted)
            .finish()
    }
}

/// Bounded exponential backoff for `DeviceBusy`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(2),
        }
    }
}

/// Submit `frame`, retrying while the encoder reports busy.
///
/// After `max_retries` busy answers the last `DeviceBusy` is returned and
/// the caller treats it as fatal.
pub fn submit_with_retry(
    encoder: &mut FrameEncoder,
    frame: &Frame,
    policy: RetryPolicy,
) -> Result<Vec<EncodedChunk>, EncodeError> {
    let mut delay = policy.base_delay;
    let mut retries = 0;
    loop {
        match encoder.submit_frame(frame) {
            Err(EncodeError::DeviceBusy) if retries < policy.max_retries => {
                retries += 1;
                log::debug!(
                    "Encoder busy on frame {}, retry {}/{} in {:?}",
                    frame.sequence(),
                    retries,
                    policy.max_retries,
                    delay
                );
                std::thread::sleep(delay);
                delay = delay.saturating_mul(2);
            }
            other => return other,
        }
    }
}

/// Construct the encoder for `kind`, rejecting unsupported combinations.
pub fn build_encoder(
    kind: EncoderBackendKind,
    settings: EncoderSettings,
) -> Result<FrameEncoder, EncodeError> {
    if !kind.supports(settings.input_format, settings.codec) {
        return Err(EncodeError::UnsupportedFormat {
            format: settings.input_format,
            codec: settings.codec,
        });
    }

    let backend: Box<dyn EncoderBackend> = match kind {
        EncoderBackendKind::OpenH264 => {
            #[cfg(feature = "recording")]
            {
                Box::new(OpenH264Backend::new(&settings)?)
            }
            #[cfg(not(feature = "recording"))]
            {
                return Err(EncodeError::DeviceError(
                    "openh264 support not compiled in (enable the `recording` feature)".into(),
                ));
            }
        }
        EncoderBackendKind::Ffmpeg | EncoderBackendKind::FfmpegNvenc => {
            Box::new(PipeEncoder::launch(kind, &settings)?)
        }
    };

    log::info!(
        "Encoder {} ready: {}x{} {} -> {} @ {} bps",
        backend.name(),
        settings.width,
        settings.height,
        settings.input_format,
        settings.codec,
        settings.bitrate_bps
    );
    Ok(FrameEncoder::new(settings, backend))
}
