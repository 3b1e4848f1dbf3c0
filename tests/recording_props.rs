//! Property-based tests for in-process encoding and MP4 output
//!
//! These run the real openh264 encoder and muxide container writer through
//! the pipeline with a scripted camera.
//!
//! Run with: cargo test --test recording_props --features recording
#![cfg(feature = "recording")]

use acquire_video::encoder::{build_encoder, OpenH264Backend};
use acquire_video::sink::{open_sink, SinkSettings};
use acquire_video::testing::{synthetic_frame, ScriptedSource};
use acquire_video::{
    Codec, EncoderBackendKind, EncoderSettings, Pipeline, PipelineConfig, PixelFormat, Sink,
    SinkKind, SourceFormat,
};
use proptest::prelude::*;
use tempfile::tempdir;

const WIDTH: u32 = 320;
const HEIGHT: u32 = 240;

fn record(frames: u64, source: PixelFormat, path: &std::path::Path) -> acquire_video::SessionSummary {
    let format = SourceFormat::new(WIDTH, HEIGHT, source);
    // Spare frames cover any the encoder's rate control skips.
    let pipeline = Pipeline::new(Box::new(ScriptedSource::frames(format, frames as usize + 10)));
    let config = PipelineConfig::new(path)
        .with_encoder(EncoderBackendKind::OpenH264)
        .with_framerate(60)
        .with_max_frames(frames);
    pipeline.start(config).expect("session starts");
    assert!(pipeline.wait_finished(std::time::Duration::from_secs(30)));
    pipeline.stop().expect("session stops")
}

// ═══════════════════════════════════════════════════════════════════════════
// OPENH264 BACKEND
// ═══════════════════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    /// INVARIANT: every access unit is Annex B and the first is a keyframe
    #[test]
    fn access_units_are_annex_b(seq in 1u64..1000) {
        let settings = EncoderSettings::new(WIDTH, HEIGHT, PixelFormat::Yuv420);
        let mut encoder = build_encoder(EncoderBackendKind::OpenH264, settings)
            .expect("openh264 accepts YUV420");
        prop_assert!(encoder.is_frame_aligned());

        for i in 0..3u64 {
            let frame = synthetic_frame(seq + i, WIDTH, HEIGHT, PixelFormat::Yuv420);
            let chunks = encoder.submit_frame(&frame).expect("frame encodes");
            prop_assert_eq!(chunks.len(), 1);
            let chunk = &chunks[0];
            prop_assert!(
                chunk.data.starts_with(&[0, 0, 0, 1]) || chunk.data.starts_with(&[0, 0, 1]),
                "not Annex B: {:02x?}",
                &chunk.data[..chunk.data.len().min(8)]
            );
            prop_assert_eq!(chunk.frame_index, Some(i));
            if i == 0 {
                prop_assert!(chunk.is_keyframe);
            }
        }
        let tail = encoder.finish().expect("flush");
        prop_assert!(tail.last().map_or(false, |c| c.is_final));
    }
}

#[test]
fn openh264_rejects_other_inputs() {
    let nv12 = EncoderSettings::new(WIDTH, HEIGHT, PixelFormat::Nv12);
    assert!(OpenH264Backend::new(&nv12).is_err());
    let hevc = EncoderSettings::new(WIDTH, HEIGHT, PixelFormat::Yuv420).with_codec(Codec::H265);
    assert!(build_encoder(EncoderBackendKind::OpenH264, hevc).is_err());
}

// ═══════════════════════════════════════════════════════════════════════════
// MP4 RECORDING INVARIANTS
// ═══════════════════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(4))]

    /// INVARIANT: the container holds exactly the frames the session wrote
    #[test]
    fn container_frame_count_matches_summary(frames in 1u64..15) {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("capture.mp4");

        let summary = record(frames, PixelFormat::Gray8, &path);

        prop_assert!(summary.is_clean(), "{:?}", summary.last_error_message);
        prop_assert_eq!(summary.frames_written, frames);
        prop_assert_eq!(summary.container_frames, Some(summary.frames_written));

        let bytes = std::fs::read(&path).expect("mp4 exists");
        prop_assert_eq!(&bytes[4..8], b"ftyp");
        prop_assert_eq!(summary.bytes_written, bytes.len() as u64);
    }

    /// INVARIANT: compressed output is smaller than the raw frames
    #[test]
    fn output_size_bounded(frames in 2u64..10) {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("bounded.mp4");

        let summary = record(frames, PixelFormat::Bgr8, &path);
        let raw = (WIDTH * HEIGHT * 3) as u64 * frames;
        prop_assert!(summary.bytes_written > 0);
        prop_assert!(summary.bytes_written < raw);
    }
}

#[test]
fn raw_elementary_stream_output() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("capture.h264");

    let summary = record(5, PixelFormat::BayerRg8, &path);
    assert_eq!(summary.frames_written, 5);
    assert_eq!(summary.container_frames, None);

    let bytes = std::fs::read(&path).unwrap();
    assert!(bytes.starts_with(&[0, 0, 0, 1]) || bytes.starts_with(&[0, 0, 1]));
}

#[test]
fn mp4_sink_rejects_unindexed_chunks() {
    let dir = tempdir().unwrap();
    let settings = SinkSettings {
        path: dir.path().join("x.mp4"),
        codec: Codec::H264,
        framerate_hz: 30,
        width: WIDTH,
        height: HEIGHT,
        title: Some("test".to_string()),
    };
    let mut sink = open_sink(SinkKind::Mp4, &settings).unwrap();
    let err = sink
        .write(&acquire_video::EncodedChunk::new(vec![0, 0, 0, 1, 0x65]))
        .unwrap_err();
    assert_eq!(err, acquire_video::SinkError::UnalignedChunk("mp4"));
}
