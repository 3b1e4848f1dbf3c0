//! Error taxonomy for the capture-to-encode pipeline
//!
//! Per-frame errors (`Incomplete`, `Timeout`, every `ConvertError`,
//! `EmptyBitstream`, `GeometryMismatch`) are counted and skipped. Everything
//! else moves the session to `Stopping` and is reported through
//! [`ErrorKind`] in the session summary.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::encoder::Codec;
use crate::format::PixelFormat;

/// Errors raised by a [`FrameSource`](crate::source::FrameSource).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcquireError {
    #[error("frame {sequence} incomplete (status {status})")]
    Incomplete { sequence: u64, status: u32 },
    #[error("no frame within {0:?}")]
    Timeout(Duration),
    #[error("camera disconnected: {0}")]
    DeviceDisconnected(String),
    #[error("camera error: {0}")]
    DeviceError(String),
}

impl AcquireError {
    /// Disconnects and device errors end the session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AcquireError::DeviceDisconnected(_) | AcquireError::DeviceError(_)
        )
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            AcquireError::DeviceDisconnected(_) => Some(ErrorKind::DeviceDisconnected),
            AcquireError::DeviceError(_) => Some(ErrorKind::DeviceError),
            _ => None,
        }
    }
}

/// Errors raised by [`FormatConverter`](crate::format::FormatConverter).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConvertError {
    #[error("no conversion path from {from} to {to}")]
    UnsupportedPath { from: PixelFormat, to: PixelFormat },
    #[error("{format} frame {width}x{height} needs {expected} bytes, got {actual}")]
    SizeMismatch {
        format: PixelFormat,
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("{format} cannot represent a {width}x{height} frame")]
    InvalidDimensions {
        format: PixelFormat,
        width: u32,
        height: u32,
    },
}

/// Errors raised by a [`FrameEncoder`](crate::encoder::FrameEncoder).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("{codec} encoder does not accept {format} input")]
    UnsupportedFormat { format: PixelFormat, codec: Codec },
    #[error("encoder configured for {expected_width}x{expected_height}, got {width}x{height}")]
    GeometryMismatch {
        expected_width: u32,
        expected_height: u32,
        width: u32,
        height: u32,
    },
    #[error("encoder busy")]
    DeviceBusy,
    #[error("encoder produced an empty bitstream for frame {sequence}")]
    EmptyBitstream { sequence: u64 },
    #[error("encoder device error: {0}")]
    DeviceError(String),
}

impl EncodeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EncodeError::DeviceBusy)
    }

    /// Errors that only cost the current frame.
    pub fn is_per_frame(&self) -> bool {
        matches!(
            self,
            EncodeError::EmptyBitstream { .. } | EncodeError::GeometryMismatch { .. }
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EncodeError::UnsupportedFormat { .. } => ErrorKind::EncoderUnsupportedFormat,
            EncodeError::DeviceBusy => ErrorKind::EncoderBusy,
            EncodeError::GeometryMismatch { .. }
            | EncodeError::EmptyBitstream { .. }
            | EncodeError::DeviceError(_) => ErrorKind::EncoderDevice,
        }
    }
}

/// Errors raised by a [`Sink`](crate::sink::Sink). All of them are fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("sink I/O error: {0}")]
    Io(String),
    #[error("failed to launch {program}: {reason}")]
    Spawn { program: String, reason: String },
    #[error("downstream process exited with code {0}")]
    DownstreamFailed(i32),
    #[error("muxer error: {0}")]
    Mux(String),
    #[error("{0} sink needs one access unit per chunk")]
    UnalignedChunk(&'static str),
    #[error("sink is closed")]
    Closed,
}

impl SinkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SinkError::DownstreamFailed(_) => ErrorKind::DownstreamFailed,
            SinkError::Mux(_) | SinkError::UnalignedChunk(_) => ErrorKind::Muxer,
            SinkError::Io(_) | SinkError::Spawn { .. } | SinkError::Closed => ErrorKind::SinkIo,
        }
    }
}

impl From<std::io::Error> for SinkError {
    fn from(e: std::io::Error) -> Self {
        SinkError::Io(e.to_string())
    }
}

/// Invalid configuration, reported by `Start` before any resource is opened.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("frame rate {0} Hz outside 5-60 Hz")]
    FramerateOutOfRange(u32),
    #[error("bitrate must be non-zero")]
    ZeroBitrate,
    #[error("max_frames must be at least 1 when set")]
    ZeroMaxFrames,
    #[error("output path is empty")]
    EmptyOutputPath,
    #[error("camera delivers {from} but no conversion to {to} exists")]
    NoConversionPath { from: PixelFormat, to: PixelFormat },
    #[error("{sink} output cannot carry the stream produced by the {encoder} encoder")]
    IncompatibleSink { sink: String, encoder: String },
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("failed to read configuration: {0}")]
    Io(String),
    #[error("failed to parse configuration: {0}")]
    Parse(String),
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

/// Errors returned by [`Pipeline`](crate::pipeline::Pipeline) control calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("a recording session is already active on this camera")]
    SessionAlreadyActive,
    #[error("no recording session has been started")]
    NotStarted,
    #[error(transparent)]
    Encoder(#[from] EncodeError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Source(#[from] AcquireError),
    #[error("no camera devices found")]
    NoDevices,
    #[error("failed to spawn acquisition thread: {0}")]
    Spawn(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Config(_) | PipelineError::NotStarted => ErrorKind::Config,
            PipelineError::SessionAlreadyActive => ErrorKind::SessionAlreadyActive,
            PipelineError::Encoder(e) => e.kind(),
            PipelineError::Sink(e) => e.kind(),
            PipelineError::Source(e) => e.kind().unwrap_or(ErrorKind::DeviceError),
            PipelineError::NoDevices => ErrorKind::DeviceDisconnected,
            PipelineError::Spawn(_) => ErrorKind::LoopPanicked,
        }
    }
}

/// Classification of the error that ended a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DeviceDisconnected,
    DeviceError,
    EncoderBusy,
    EncoderUnsupportedFormat,
    EncoderDevice,
    SinkIo,
    DownstreamFailed,
    Muxer,
    SessionAlreadyActive,
    Config,
    LoopPanicked,
}
