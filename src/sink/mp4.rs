//! MP4 output via muxide
//!
//! Each chunk must be one access unit stamped with its frame index; the
//! presentation time is `index / framerate`.

use std::fs::{self, File};
use std::io::BufWriter;

use muxide::api::{Metadata, Muxer, MuxerBuilder, VideoCodec};

use crate::encoder::Codec;
use crate::errors::SinkError;
use crate::frame::EncodedChunk;
use crate::sink::{Sink, SinkSettings, SinkStats};

pub struct Mp4Sink {
    muxer: Option<Muxer<BufWriter<File>>>,
    frame_duration_secs: f64,
    stats: SinkStats,
    closed: Option<Result<SinkStats, SinkError>>,
}

impl Mp4Sink {
    pub fn create(settings: &SinkSettings) -> Result<Self, SinkError> {
        if settings.codec != Codec::H264 {
            return Err(SinkError::Mux(format!(
                "mp4 output supports h264 only, got {}",
                settings.codec
            )));
        }
        if let Some(parent) = settings.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let file = File::create(&settings.path).map_err(|e| {
            SinkError::Io(format!("failed to create {}: {e}", settings.path.display()))
        })?;
        let fps = settings.framerate_hz as f64;

        let mut metadata = Metadata::new().with_current_time();
        if let Some(title) = &settings.title {
            metadata = metadata.with_title(title);
        }

        let muxer = MuxerBuilder::new(BufWriter::new(file))
            .video(VideoCodec::H264, settings.width, settings.height, fps)
            .with_fast_start(true)
            .with_metadata(metadata)
            .build()
            .map_err(|e| SinkError::Mux(format!("failed to create muxer: {e}")))?;

        Ok(Self {
            muxer: Some(muxer),
            frame_duration_secs: 1.0 / fps,
            stats: SinkStats::default(),
            closed: None,
        })
    }

    fn finish(&mut self) -> Result<SinkStats, SinkError> {
        let Some(muxer) = self.muxer.take() else {
            return Ok(self.stats);
        };
        let muxed = muxer
            .finish_with_stats()
            .map_err(|e| SinkError::Mux(format!("failed to finalize mp4: {e}")))?;
        self.stats.bytes_written = muxed.bytes_written;
        self.stats.container_frames = Some(muxed.video_frames);
        log::debug!(
            "mp4 finalized: {} frames, {:.2}s",
            muxed.video_frames,
            muxed.duration_secs
        );
        Ok(self.stats)
    }
}

impl Sink for Mp4Sink {
    fn write(&mut self, chunk: &EncodedChunk) -> Result<(), SinkError> {
        let muxer = self.muxer.as_mut().ok_or(SinkError::Closed)?;
        if chunk.is_empty() {
            return Ok(());
        }
        let index = chunk.frame_index.ok_or(SinkError::UnalignedChunk("mp4"))?;
        let pts = index as f64 * self.frame_duration_secs;

        muxer
            .write_video(pts, &chunk.data, chunk.is_keyframe)
            .map_err(|e| SinkError::Mux(format!("failed to write frame {index}: {e}")))?;
        self.stats.bytes_written += chunk.len() as u64;
        self.stats.chunks_written += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<SinkStats, SinkError> {
        if let Some(result) = &self.closed {
            return result.clone();
        }
        let result = self.finish();
        self.closed = Some(result.clone());
        result
    }
}
