//! Final consumers of encoded bytes
//!
//! A sink exclusively owns its file or pipe. `close` releases it on every
//! exit path; dropping an unclosed sink releases it too, without reporting.

pub mod file;
pub mod pipe;

#[cfg(feature = "recording")]
pub mod mp4;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::encoder::Codec;
use crate::errors::SinkError;
use crate::frame::EncodedChunk;

pub use file::FileSink;
pub use pipe::PipeSink;

#[cfg(feature = "recording")]
pub use mp4::Mp4Sink;

/// Totals reported when a sink closes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkStats {
    pub bytes_written: u64,
    pub chunks_written: u64,
    /// Frames in the container, when the sink writes one itself
    pub container_frames: Option<u64>,
}

pub trait Sink: Send {
    /// Write the whole chunk. May block under downstream backpressure.
    fn write(&mut self, chunk: &EncodedChunk) -> Result<(), SinkError>;

    /// Flush and release the output. Repeated calls return the first result.
    fn close(&mut self) -> Result<SinkStats, SinkError>;
}

impl Sink for Box<dyn Sink> {
    fn write(&mut self, chunk: &EncodedChunk) -> Result<(), SinkError> {
        (**self).write(chunk)
    }

    fn close(&mut self) -> Result<SinkStats, SinkError> {
        (**self).close()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SinkKind {
    /// Raw Annex B elementary stream
    File,
    /// MP4 written in-process
    Mp4,
    /// ffmpeg remuxing stdin into the container named by the extension
    FfmpegMux,
}

impl SinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SinkKind::File => "file",
            SinkKind::Mp4 => "mp4",
            SinkKind::FfmpegMux => "ffmpeg-mux",
        }
    }

    /// Pick a sink from the output extension
    pub fn for_path(path: &Path) -> SinkKind {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "h264" | "264" | "h265" | "265" | "hevc" | "bin" => SinkKind::File,
            "mp4" if cfg!(feature = "recording") => SinkKind::Mp4,
            _ => SinkKind::FfmpegMux,
        }
    }

    /// Whether the sink needs one access unit per chunk
    pub fn requires_frame_aligned(&self) -> bool {
        matches!(self, SinkKind::Mp4)
    }
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SinkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "file" | "raw" => Ok(SinkKind::File),
            "mp4" => Ok(SinkKind::Mp4),
            "ffmpeg-mux" | "ffmpeg" | "mux" => Ok(SinkKind::FfmpegMux),
            other => Err(format!(
                "unknown sink '{other}' (expected file, mp4 or ffmpeg-mux)"
            )),
        }
    }
}

/// What a sink needs to know about the stream it receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkSettings {
    pub path: PathBuf,
    pub codec: Codec,
    pub framerate_hz: u32,
    pub width: u32,
    pub height: u32,
    pub title: Option<String>,
}

pub fn open_sink(kind: SinkKind, settings: &SinkSettings) -> Result<Box<dyn Sink>, SinkError> {
    let sink: Box<dyn Sink> = match kind {
        SinkKind::File => Box::new(FileSink::create(&settings.path)?),
        SinkKind::FfmpegMux => Box::new(PipeSink::ffmpeg_mux(
            settings.codec,
            settings.framerate_hz,
            &settings.path,
        )?),
        SinkKind::Mp4 => {
            #[cfg(feature = "recording")]
            {
                Box::new(Mp4Sink::create(settings)?)
            }
            #[cfg(not(feature = "recording"))]
            {
                return Err(SinkError::Mux(
                    "mp4 support not compiled in (enable the `recording` feature)".into(),
                ));
            }
        }
    };
    log::info!("Writing {} output to {}", kind, settings.path.display());
    Ok(sink)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_extension() {
        assert_eq!(SinkKind::for_path(Path::new("out.h264")), SinkKind::File);
        assert_eq!(SinkKind::for_path(Path::new("out.HEVC")), SinkKind::File);
        assert_eq!(SinkKind::for_path(Path::new("out.mkv")), SinkKind::FfmpegMux);
        let mp4 = SinkKind::for_path(Path::new("out.mp4"));
        if cfg!(feature = "recording") {
            assert_eq!(mp4, SinkKind::Mp4);
        } else {
            assert_eq!(mp4, SinkKind::FfmpegMux);
        }
    }

    #[test]
    fn test_parse_kind() {
        assert_eq!("ffmpeg-mux".parse::<SinkKind>().unwrap(), SinkKind::FfmpegMux);
        assert!("tape".parse::<SinkKind>().is_err());
    }
}
