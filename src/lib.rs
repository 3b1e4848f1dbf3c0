//! acquire-video: real-time camera capture to H.264/H.265 video
//!
//! Frames flow one way through four stages: a [`FrameSource`] delivers raw
//! images, [`FormatConverter`] reshapes them into the encoder's layout, a
//! [`FrameEncoder`] compresses them and a [`Sink`] writes the bitstream to a
//! file, a muxing subprocess or an MP4 container. [`Pipeline`] owns all four
//! and runs one recording session at a time on a dedicated thread.
//!
//! # Features
//! - `camera`: nokhwa-backed UVC / machine-vision capture
//! - `recording`: in-process openh264 encoding and MP4 muxing via muxide
//!
//! # Usage
//! ```rust,no_run
//! use acquire_video::testing::ScriptedSource;
//! use acquire_video::{PipelineConfig, PixelFormat, SourceFormat};
//!
//! let source = ScriptedSource::frames(SourceFormat::new(640, 480, PixelFormat::Gray8), 30);
//! let pipeline = acquire_video::Pipeline::new(Box::new(source));
//! pipeline.start(PipelineConfig::new("capture.h264").with_max_frames(30))?;
//! let summary = pipeline.stop()?;
//! println!("{} frames written", summary.frames_written);
//! # Ok::<(), acquire_video::PipelineError>(())
//! ```
pub mod config;
pub mod encoder;
pub mod errors;
pub mod format;
pub mod frame;
pub mod pipeline;
pub mod sink;
pub mod source;
pub mod timing;

// Testing utilities - synthetic data and hardware-free stage doubles
pub mod testing;

// Re-exports for convenience
pub use config::AppConfig;
pub use encoder::{Codec, EncoderBackend, EncoderBackendKind, EncoderSettings, FrameEncoder};
pub use errors::{
    AcquireError, ConfigError, ConvertError, EncodeError, ErrorKind, PipelineError, SinkError,
};
pub use format::{frame_size, FormatConverter, PixelFormat};
pub use frame::{EncodedChunk, Frame};
pub use pipeline::{
    Pipeline, PipelineConfig, PipelineState, SessionSummary, StopHandle, StopReason,
};
pub use sink::{Sink, SinkKind, SinkStats};
pub use source::{CameraBackend, DeviceInfo, FrameSource, SourceFormat};

/// Initialize logging; `RUST_LOG` defaults to `acquire_video=info`
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "acquire_video=info");
    }
    let _ = env_logger::try_init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Get crate information
pub fn get_info() -> CrateInfo {
    CrateInfo {
        name: NAME.to_string(),
        version: VERSION.to_string(),
        description: DESCRIPTION.to_string(),
        camera_support: cfg!(feature = "camera"),
        recording_support: cfg!(feature = "recording"),
    }
}

/// Crate information structure
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CrateInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub camera_support: bool,
    pub recording_support: bool,
}
