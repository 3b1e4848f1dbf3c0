//! End-to-end pipeline scenarios with hardware-free stages
//!
//! Every session here runs the real acquisition loop on its own thread with
//! a scripted or synthetic camera, the reference encoder and an in-memory or
//! on-disk sink. The reference bitstream decodes back to the list of frame
//! sequence numbers, which is what most assertions check.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use acquire_video::errors::{ConfigError, ErrorKind};
use acquire_video::pipeline::{EncoderBuilder, SinkBuilder};
use acquire_video::sink::open_sink;
use acquire_video::testing::{
    reference_decode, MemorySink, MemorySinkHandle, ReferenceEncoder, ReferenceLog,
    ScriptedSource, SourceStep, SyntheticCamera, WhenExhausted,
};
use acquire_video::{
    EncoderBackendKind, FrameSource, Pipeline, PipelineConfig, PipelineError, PipelineState,
    PixelFormat, Sink, SourceFormat, StopReason,
};
use tempfile::tempdir;

const FINISH_TIMEOUT: Duration = Duration::from_secs(10);

fn vga_gray() -> SourceFormat {
    SourceFormat::new(640, 480, PixelFormat::Gray8)
}

fn small_gray() -> SourceFormat {
    SourceFormat::new(64, 48, PixelFormat::Gray8)
}

fn config() -> PipelineConfig {
    PipelineConfig::new("memory.h264").with_encoder(EncoderBackendKind::Ffmpeg)
}

fn reference_builder<F>(make: F, log: Arc<Mutex<ReferenceLog>>) -> EncoderBuilder
where
    F: Fn() -> ReferenceEncoder + Send + Sync + 'static,
{
    Box::new(move |config, format| {
        Ok(make()
            .with_log(log.clone())
            .into_encoder(config.encoder_settings(format)))
    })
}

fn memory_builder<F>(make: F, handle: MemorySinkHandle) -> SinkBuilder
where
    F: Fn() -> MemorySink + Send + Sync + 'static,
{
    Box::new(move |_, _| Ok(Box::new(make().with_handle(handle.clone())) as Box<dyn Sink>))
}

struct Harness {
    pipeline: Pipeline,
    log: Arc<Mutex<ReferenceLog>>,
    sink: MemorySinkHandle,
}

fn harness<E, S>(source: impl FrameSource + 'static, encoder: E, sink: S) -> Harness
where
    E: Fn() -> ReferenceEncoder + Send + Sync + 'static,
    S: Fn() -> MemorySink + Send + Sync + 'static,
{
    let log = Arc::new(Mutex::new(ReferenceLog::default()));
    let handle = MemorySinkHandle::default();
    let pipeline = Pipeline::with_builders(
        Box::new(source),
        reference_builder(encoder, log.clone()),
        memory_builder(sink, handle.clone()),
    );
    Harness {
        pipeline,
        log,
        sink: handle,
    }
}

fn decoded(handle: &MemorySinkHandle) -> Vec<u64> {
    reference_decode(&handle.bytes()).expect("reference stream decodes")
}

// ═══════════════════════════════════════════════════════════════════════════
// HAPPY PATH
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn thirty_gray_frames_at_thirty_hz_are_all_written() {
    let h = harness(
        ScriptedSource::frames(vga_gray(), 30),
        || ReferenceEncoder::new(2).batched(),
        MemorySink::new,
    );

    h.pipeline
        .start(config().with_framerate(30).with_max_frames(30))
        .unwrap();
    assert!(h.pipeline.wait_finished(FINISH_TIMEOUT));
    let summary = h.pipeline.stop().unwrap();

    assert_eq!(summary.frames_written, 30);
    assert_eq!(summary.frames_dropped, 0);
    assert_eq!(summary.stop_reason, StopReason::MaxFrames);
    assert!(summary.is_clean());
    assert_eq!(decoded(&h.sink), (1..=30).collect::<Vec<_>>());
    assert!(h.sink.is_closed());
    assert_eq!(h.sink.close_calls(), 1);
    assert_eq!(h.log.lock().unwrap().accepted.len(), 30);
    assert!(h.log.lock().unwrap().flushed);
    assert_eq!(summary.bytes_written, h.sink.bytes().len() as u64);
    assert_eq!(h.pipeline.state(), PipelineState::Stopped);
}

#[test]
fn one_second_session_at_thirty_hz_writes_every_frame() {
    let h = harness(
        ScriptedSource::frames(vga_gray(), 30),
        || ReferenceEncoder::new(2).batched(),
        MemorySink::new,
    );

    h.pipeline.start(config().with_framerate(30)).unwrap();
    std::thread::sleep(Duration::from_secs(1));
    let summary = h.pipeline.stop().unwrap();

    assert_eq!(summary.frames_written, 30);
    assert_eq!(summary.frames_dropped, 0);
    assert_eq!(summary.stop_reason, StopReason::Requested);
    assert!(summary.is_clean());
    assert_eq!(decoded(&h.sink), (1..=30).collect::<Vec<_>>());
    assert_eq!(h.sink.close_calls(), 1);
    assert!(h.sink.is_closed());
}

#[test]
fn requested_stop_drains_every_accepted_frame() {
    let h = harness(
        ScriptedSource::frames(small_gray(), 10_000),
        || ReferenceEncoder::new(4),
        MemorySink::new,
    );

    h.pipeline.start(config().with_framerate(60)).unwrap();
    assert!(h.pipeline.is_running());
    std::thread::sleep(Duration::from_millis(250));

    let asked = Instant::now();
    let summary = h.pipeline.stop().unwrap();
    assert!(asked.elapsed() < Duration::from_millis(500));

    assert_eq!(summary.stop_reason, StopReason::Requested);
    assert!(summary.frames_written > 0);
    assert!(summary.is_clean());
    // Lookahead frames still inside the encoder at stop time are flushed.
    let expected: Vec<u64> = (1..=summary.frames_written).collect();
    assert_eq!(decoded(&h.sink), expected);
}

#[test]
fn stop_handle_ends_session_from_another_thread() {
    let h = harness(
        ScriptedSource::frames(small_gray(), 10_000),
        ReferenceEncoder::aligned,
        MemorySink::new,
    );
    h.pipeline.start(config()).unwrap();

    let stop = h.pipeline.stop_handle().expect("session is active");
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        stop.request_stop();
        stop.request_stop();
    });

    assert!(h.pipeline.wait_finished(FINISH_TIMEOUT));
    let summary = h.pipeline.stop().unwrap();
    assert_eq!(summary.stop_reason, StopReason::Requested);
    assert!(h.pipeline.stop_handle().is_none());
}

#[test]
fn synthetic_camera_records_increasing_sequences() {
    let camera = SyntheticCamera::new(small_gray(), 30);
    let h = harness(camera.open_source(), ReferenceEncoder::aligned, MemorySink::new);

    h.pipeline.start(config().with_max_frames(10)).unwrap();
    assert!(h.pipeline.wait_finished(FINISH_TIMEOUT));
    let summary = h.pipeline.stop().unwrap();

    assert_eq!(summary.frames_written, 10);
    let seqs = decoded(&h.sink);
    assert_eq!(seqs.len(), 10);
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn camera_faster_than_loop_reports_evicted_frames() {
    let camera = SyntheticCamera::new(small_gray(), 200);
    let h = harness(camera.open_source(), ReferenceEncoder::aligned, MemorySink::new);

    h.pipeline.start(config().with_framerate(10).with_max_frames(5)).unwrap();
    assert!(h.pipeline.wait_finished(FINISH_TIMEOUT));
    let summary = h.pipeline.stop().unwrap();

    assert_eq!(summary.frames_written, 5);
    assert!(summary.drops.evicted > 0, "no evictions in {:?}", summary.drops);
    assert!(summary.frames_dropped >= summary.drops.evicted);
    assert!(summary.is_clean());
    let seqs = decoded(&h.sink);
    assert_eq!(seqs.len(), 5);
    // Evicted frames leave gaps between the sequences that were written.
    assert!(seqs[4] - seqs[0] > 4);
}

#[test]
fn file_sink_receives_the_whole_stream() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("capture.h264");
    let log = Arc::new(Mutex::new(ReferenceLog::default()));

    let pipeline = Pipeline::with_builders(
        Box::new(ScriptedSource::frames(small_gray(), 10)),
        reference_builder(|| ReferenceEncoder::new(1), log),
        Box::new(|config, format| open_sink(config.sink_kind(), &config.sink_settings(format))),
    );

    let config = PipelineConfig::new(&path)
        .with_encoder(EncoderBackendKind::Ffmpeg)
        .with_max_frames(10);
    pipeline.start(config).unwrap();
    assert!(pipeline.wait_finished(FINISH_TIMEOUT));
    let summary = pipeline.stop().unwrap();

    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(reference_decode(&bytes).unwrap(), (1..=10).collect::<Vec<_>>());
    assert_eq!(summary.bytes_written, bytes.len() as u64);
    assert_eq!(summary.output_path, path);
}

// ═══════════════════════════════════════════════════════════════════════════
// PER-FRAME FAILURES
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn incomplete_and_timeout_frames_are_counted_not_fatal() {
    let steps = [
        SourceStep::Frame,
        SourceStep::Incomplete(1),
        SourceStep::Frame,
        SourceStep::Timeout,
        SourceStep::Frame,
    ];
    let h = harness(
        ScriptedSource::new(small_gray(), steps),
        ReferenceEncoder::aligned,
        MemorySink::new,
    );

    h.pipeline.start(config().with_framerate(60).with_max_frames(3)).unwrap();
    assert!(h.pipeline.wait_finished(FINISH_TIMEOUT));
    let summary = h.pipeline.stop().unwrap();

    assert_eq!(summary.frames_written, 3);
    assert_eq!(summary.drops.incomplete, 1);
    assert_eq!(summary.drops.timeout, 1);
    assert_eq!(summary.frames_dropped, 2);
    assert!(summary.is_clean());
    // The incomplete transfer still consumed sequence number 2.
    assert_eq!(decoded(&h.sink), vec![1, 3, 4]);
}

#[test]
fn malformed_frame_is_a_conversion_drop() {
    let steps = [
        SourceStep::Frame,
        SourceStep::Truncated,
        SourceStep::Frame,
        SourceStep::Frame,
    ];
    let h = harness(
        ScriptedSource::new(small_gray(), steps),
        ReferenceEncoder::aligned,
        MemorySink::new,
    );

    h.pipeline.start(config().with_framerate(60).with_max_frames(3)).unwrap();
    assert!(h.pipeline.wait_finished(FINISH_TIMEOUT));
    let summary = h.pipeline.stop().unwrap();

    assert_eq!(summary.drops.conversion, 1);
    assert_eq!(summary.frames_dropped, 1);
    assert_eq!(summary.frames_written, 3);
    assert_eq!(summary.stop_reason, StopReason::MaxFrames);
    assert!(summary.is_clean());
    assert_eq!(decoded(&h.sink), vec![1, 3, 4]);
}

#[test]
fn empty_bitstream_drops_only_that_frame() {
    let h = harness(
        ScriptedSource::frames(small_gray(), 100),
        || ReferenceEncoder::aligned().empty_on(2),
        MemorySink::new,
    );

    h.pipeline.start(config().with_framerate(60).with_max_frames(4)).unwrap();
    assert!(h.pipeline.wait_finished(FINISH_TIMEOUT));
    let summary = h.pipeline.stop().unwrap();

    assert_eq!(summary.frames_written, 4);
    assert_eq!(summary.drops.encoder, 1);
    assert!(summary.is_clean());
    assert_eq!(decoded(&h.sink), vec![1, 3, 4, 5]);
}

#[test]
fn busy_encoder_is_retried_transparently() {
    let h = harness(
        ScriptedSource::frames(small_gray(), 100),
        || ReferenceEncoder::aligned().busy_on(2, 2),
        MemorySink::new,
    );

    h.pipeline.start(config().with_framerate(60).with_max_frames(5)).unwrap();
    assert!(h.pipeline.wait_finished(FINISH_TIMEOUT));
    let summary = h.pipeline.stop().unwrap();

    assert_eq!(summary.frames_written, 5);
    assert_eq!(summary.frames_dropped, 0);
    assert!(summary.is_clean());
    assert_eq!(h.log.lock().unwrap().busy_answers, 2);
    assert_eq!(decoded(&h.sink), vec![1, 2, 3, 4, 5]);
}

// ═══════════════════════════════════════════════════════════════════════════
// FATAL FAILURES
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn disconnect_stops_session_and_keeps_encoded_frames() {
    let mut steps = vec![SourceStep::Frame; 14];
    steps.push(SourceStep::Disconnect);
    let h = harness(
        ScriptedSource::new(small_gray(), steps),
        || ReferenceEncoder::new(3),
        MemorySink::new,
    );

    h.pipeline.start(config().with_framerate(60)).unwrap();
    assert!(h.pipeline.wait_finished(FINISH_TIMEOUT));
    let summary = h.pipeline.stop().unwrap();

    assert_eq!(summary.frames_written, 14);
    assert_eq!(summary.last_error, Some(ErrorKind::DeviceDisconnected));
    assert!(summary.last_error_message.is_some());
    assert_eq!(summary.stop_reason, StopReason::Error);
    assert_eq!(decoded(&h.sink), (1..=14).collect::<Vec<_>>());
    assert!(h.sink.is_closed());
}

#[test]
fn exhausted_busy_retries_are_fatal() {
    let h = harness(
        ScriptedSource::frames(small_gray(), 100),
        || ReferenceEncoder::aligned().busy_on(2, 10),
        MemorySink::new,
    );

    h.pipeline.start(config().with_framerate(60)).unwrap();
    assert!(h.pipeline.wait_finished(FINISH_TIMEOUT));
    let summary = h.pipeline.stop().unwrap();

    assert_eq!(summary.last_error, Some(ErrorKind::EncoderBusy));
    assert_eq!(summary.frames_written, 1);
    // One attempt plus three retries.
    assert_eq!(h.log.lock().unwrap().busy_answers, 4);
    assert_eq!(decoded(&h.sink), vec![1]);
}

#[test]
fn sink_failure_is_fatal_and_sink_still_closed() {
    let h = harness(
        ScriptedSource::frames(small_gray(), 100),
        ReferenceEncoder::aligned,
        || MemorySink::new().fail_on_write(3),
    );

    h.pipeline.start(config().with_framerate(60)).unwrap();
    assert!(h.pipeline.wait_finished(FINISH_TIMEOUT));
    let summary = h.pipeline.stop().unwrap();

    assert_eq!(summary.last_error, Some(ErrorKind::SinkIo));
    assert_eq!(summary.stop_reason, StopReason::Error);
    assert_eq!(decoded(&h.sink), vec![1, 2]);
    // Frame 3 was encoded but its write failed.
    assert_eq!(summary.frames_written, decoded(&h.sink).len() as u64);
    assert_eq!(h.sink.close_calls(), 1);
}

#[test]
fn failed_drain_still_writes_the_tail() {
    let h = harness(
        ScriptedSource::frames(small_gray(), 100),
        || ReferenceEncoder::new(3).fail_on_flush(),
        MemorySink::new,
    );

    h.pipeline.start(config().with_framerate(60).with_max_frames(5)).unwrap();
    assert!(h.pipeline.wait_finished(FINISH_TIMEOUT));
    let summary = h.pipeline.stop().unwrap();

    assert_eq!(summary.last_error, Some(ErrorKind::EncoderDevice));
    assert_eq!(summary.stop_reason, StopReason::MaxFrames);
    assert_eq!(decoded(&h.sink), (1..=5).collect::<Vec<_>>());
    assert_eq!(summary.frames_written, 5);
    assert_eq!(h.sink.close_calls(), 1);
}

// ═══════════════════════════════════════════════════════════════════════════
// BACKPRESSURE
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn stalled_sink_skips_missed_ticks_without_burst() {
    let source = ScriptedSource::frames(small_gray(), 20);
    let acquisitions = source.acquire_log();
    let h = harness(source, ReferenceEncoder::aligned, || {
        MemorySink::new().stall_on_write(5, Duration::from_millis(200))
    });

    h.pipeline.start(config().with_framerate(30).with_max_frames(20)).unwrap();
    assert!(h.pipeline.wait_finished(FINISH_TIMEOUT));
    let summary = h.pipeline.stop().unwrap();

    assert_eq!(summary.frames_written, 20);
    assert_eq!(summary.frames_dropped, 0);
    assert!(summary.ticks_overrun >= 1);
    assert_eq!(decoded(&h.sink), (1..=20).collect::<Vec<_>>());

    // Missed ticks are never replayed back to back.
    let times = acquisitions.lock().unwrap().clone();
    assert_eq!(times.len(), 20);
    for pair in times.windows(2) {
        let gap = pair[1].duration_since(pair[0]);
        assert!(gap >= Duration::from_millis(16), "burst gap of {:?}", gap);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// LIFECYCLE
// ═══════════════════════════════════════════════════════════════════════════

#[test]
fn stop_before_start_is_not_started() {
    let h = harness(
        ScriptedSource::frames(small_gray(), 1),
        ReferenceEncoder::aligned,
        MemorySink::new,
    );
    assert_eq!(h.pipeline.stop().unwrap_err(), PipelineError::NotStarted);
    assert_eq!(h.pipeline.state(), PipelineState::Stopped);
    assert!(h.pipeline.last_summary().is_none());
}

#[test]
fn repeated_stop_returns_same_summary() {
    let h = harness(
        ScriptedSource::frames(small_gray(), 3),
        ReferenceEncoder::aligned,
        MemorySink::new,
    );
    h.pipeline.start(config().with_max_frames(3)).unwrap();
    assert!(h.pipeline.wait_finished(FINISH_TIMEOUT));

    let first = h.pipeline.stop().unwrap();
    let second = h.pipeline.stop().unwrap();
    assert_eq!(first, second);
    assert_eq!(h.sink.close_calls(), 1);
}

#[test]
fn second_start_while_active_is_rejected() {
    let h = harness(
        ScriptedSource::frames(small_gray(), 10_000),
        ReferenceEncoder::aligned,
        MemorySink::new,
    );
    h.pipeline.start(config()).unwrap();

    let other = h.pipeline.clone();
    assert_eq!(
        other.start(config()).unwrap_err(),
        PipelineError::SessionAlreadyActive
    );
    assert_eq!(
        PipelineError::SessionAlreadyActive.kind(),
        ErrorKind::SessionAlreadyActive
    );

    let summary = h.pipeline.stop().unwrap();
    assert!(summary.is_clean());
}

#[test]
fn camera_is_reusable_after_stop() {
    let h = harness(
        ScriptedSource::frames(small_gray(), 6).when_exhausted(WhenExhausted::Timeout),
        ReferenceEncoder::aligned,
        MemorySink::new,
    );

    h.pipeline.start(config().with_framerate(60).with_max_frames(3)).unwrap();
    assert!(h.pipeline.wait_finished(FINISH_TIMEOUT));
    let first = h.pipeline.stop().unwrap();

    h.pipeline.start(config().with_framerate(60).with_max_frames(3)).unwrap();
    assert!(h.pipeline.wait_finished(FINISH_TIMEOUT));
    let second = h.pipeline.stop().unwrap();

    assert_ne!(first.session_id, second.session_id);
    assert_eq!(second.frames_written, 3);
    // Both sessions wrote into the same buffer; the source kept counting.
    assert_eq!(decoded(&h.sink), vec![1, 2, 3, 4, 5, 6]);
}

#[test]
fn invalid_config_opens_nothing() {
    let opened = Arc::new(Mutex::new(0u32));
    let counter = opened.clone();
    let pipeline = Pipeline::with_builders(
        Box::new(ScriptedSource::frames(small_gray(), 3)),
        reference_builder(ReferenceEncoder::aligned, Arc::new(Mutex::new(ReferenceLog::default()))),
        Box::new(move |_, _| {
            *counter.lock().unwrap() += 1;
            Ok(Box::new(MemorySink::new()) as Box<dyn Sink>)
        }),
    );

    assert_eq!(
        pipeline.start(config().with_framerate(4)).unwrap_err(),
        PipelineError::Config(ConfigError::FramerateOutOfRange(4))
    );
    assert_eq!(*opened.lock().unwrap(), 0);
    assert_eq!(pipeline.state(), PipelineState::Stopped);

    // The camera was not consumed by the failed start.
    pipeline.start(config().with_max_frames(3)).unwrap();
    assert!(pipeline.wait_finished(FINISH_TIMEOUT));
    assert_eq!(pipeline.stop().unwrap().frames_written, 3);
    assert_eq!(*opened.lock().unwrap(), 1);
}

#[test]
fn unconvertible_camera_format_fails_at_start() {
    let h = harness(
        ScriptedSource::frames(SourceFormat::new(64, 48, PixelFormat::P010), 3),
        ReferenceEncoder::aligned,
        MemorySink::new,
    );
    let err = h.pipeline.start(config()).unwrap_err();
    assert_eq!(
        err,
        PipelineError::Config(ConfigError::NoConversionPath {
            from: PixelFormat::P010,
            to: PixelFormat::Yuv420,
        })
    );
    assert!(!h.sink.is_closed());
    assert_eq!(h.pipeline.state(), PipelineState::Stopped);
}
