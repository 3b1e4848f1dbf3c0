//! The acquisition loop and the state it owns
//!
//! One thread per session owns the source, encoder and sink outright. Each
//! tick moves at most one frame through acquire, convert, encode and write.
//! Teardown always runs on the same thread: drain the encoder, write its
//! tail, close the sink.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::encoder::{submit_with_retry, Drained, FrameEncoder, RetryPolicy};
use crate::errors::{AcquireError, ErrorKind};
use crate::format::FormatConverter;
use crate::pipeline::{PipelineConfig, PipelineState};
use crate::sink::{Sink, SinkStats};
use crate::source::FrameSource;
use crate::timing::TickSchedule;

/// Messages from the control side to the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    Stop,
}

/// Per-reason drop counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropCounts {
    pub incomplete: u64,
    pub timeout: u64,
    pub conversion: u64,
    pub encoder: u64,
    /// Delivered by the camera but overwritten before the loop took them
    pub evicted: u64,
}

impl DropCounts {
    pub fn total(&self) -> u64 {
        self.incomplete + self.timeout + self.conversion + self.encoder + self.evicted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// `stop()` was called
    Requested,
    /// `max_frames` reached
    MaxFrames,
    /// A fatal error ended the session; see `last_error`
    Error,
}

/// Final counters of one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub output_path: PathBuf,
    pub frames_written: u64,
    pub frames_dropped: u64,
    pub drops: DropCounts,
    pub elapsed_secs: f64,
    pub last_error: Option<ErrorKind>,
    pub last_error_message: Option<String>,
    pub bytes_written: u64,
    pub chunks_written: u64,
    pub ticks_overrun: u64,
    pub container_frames: Option<u64>,
    pub stop_reason: StopReason,
}

impl SessionSummary {
    pub fn is_clean(&self) -> bool {
        self.last_error.is_none()
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_secs_f64(self.elapsed_secs.max(0.0))
    }

    /// Summary for a loop that died without reporting
    pub(crate) fn panicked(session: &RecordingSession) -> Self {
        let mut summary = session.summary(StopReason::Error, None);
        summary.last_error = Some(ErrorKind::LoopPanicked);
        summary.last_error_message = Some("acquisition loop panicked".to_string());
        summary
    }
}

/// Mutable session state, owned by the loop thread
#[derive(Debug, Clone)]
pub struct RecordingSession {
    id: Uuid,
    started_at: DateTime<Utc>,
    start_instant: Instant,
    output_path: PathBuf,
    is_active: bool,
    frames_written: u64,
    // Accepted by a lookahead encoder, output not yet known to be in the sink
    frames_pending: u64,
    drops: DropCounts,
    bytes_written: u64,
    chunks_written: u64,
    ticks_overrun: u64,
    last_error: Option<(ErrorKind, String)>,
}

impl RecordingSession {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            start_instant: Instant::now(),
            output_path: config.output_path.clone(),
            is_active: true,
            frames_written: 0,
            frames_pending: 0,
            drops: DropCounts::default(),
            bytes_written: 0,
            chunks_written: 0,
            ticks_overrun: 0,
            last_error: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    /// Frames whose encoded output the sink has accepted
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Frames the encoder accepted, whether or not their output was written
    pub fn frames_accepted(&self) -> u64 {
        self.frames_written + self.frames_pending
    }

    pub fn drops(&self) -> DropCounts {
        self.drops
    }

    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error.as_ref().map(|(kind, _)| *kind)
    }

    // The first fatal error is the cause; later teardown failures only log.
    fn fail(&mut self, kind: ErrorKind, message: String) {
        if self.last_error.is_none() {
            self.last_error = Some((kind, message));
        } else {
            log::warn!("Session {}: subsequent error {:?}: {}", self.id, kind, message);
        }
    }

    fn record_written(&mut self, len: usize) {
        self.bytes_written += len as u64;
        self.chunks_written += 1;
    }

    fn summary(&self, stop_reason: StopReason, sink: Option<SinkStats>) -> SessionSummary {
        let (last_error, last_error_message) = match &self.last_error {
            Some((kind, message)) => (Some(*kind), Some(message.clone())),
            None => (None, None),
        };
        SessionSummary {
            session_id: self.id,
            started_at: self.started_at,
            output_path: self.output_path.clone(),
            frames_written: self.frames_written,
            frames_dropped: self.drops.total(),
            drops: self.drops,
            elapsed_secs: self.start_instant.elapsed().as_secs_f64(),
            last_error,
            last_error_message,
            bytes_written: sink.map_or(self.bytes_written, |s| s.bytes_written),
            chunks_written: sink.map_or(self.chunks_written, |s| s.chunks_written),
            ticks_overrun: self.ticks_overrun,
            container_frames: sink.and_then(|s| s.container_frames),
            stop_reason,
        }
    }
}

/// Resources moved into the loop thread
pub(crate) struct LoopParts {
    pub source: Box<dyn FrameSource>,
    pub encoder: FrameEncoder,
    pub sink: Box<dyn Sink>,
    pub config: PipelineConfig,
    pub control: Receiver<Control>,
    pub state: Arc<Mutex<PipelineState>>,
    pub session: RecordingSession,
    pub retry: RetryPolicy,
}

/// Returned when the loop thread exits; the source goes back to the pipeline
pub(crate) struct LoopExit {
    pub source: Box<dyn FrameSource>,
    pub summary: SessionSummary,
}

enum Tick {
    Continue,
    TimedOut(Duration),
    MaxFrames,
    Fatal,
}

pub(crate) fn run(parts: LoopParts) -> LoopExit {
    let LoopParts {
        mut source,
        mut encoder,
        mut sink,
        config,
        control,
        state,
        mut session,
        retry,
    } = parts;

    let interval = config.tick_interval();
    let mut schedule = TickSchedule::new(interval);
    let evicted_before = source.dropped();

    let stop_reason = loop {
        match control.recv_deadline(schedule.deadline()) {
            Ok(Control::Stop) | Err(RecvTimeoutError::Disconnected) => break StopReason::Requested,
            Err(RecvTimeoutError::Timeout) => {}
        }

        match tick(&mut session, &mut *source, &mut encoder, &mut *sink, &config, retry) {
            Tick::Continue => {}
            Tick::TimedOut(waited) => {
                // A wait overtaken by a stop request lost no frame.
                match control.try_recv() {
                    Ok(Control::Stop) | Err(TryRecvError::Disconnected) => {
                        log::debug!("Stop requested while waiting for a frame");
                        break StopReason::Requested;
                    }
                    Err(TryRecvError::Empty) => {
                        log::debug!("No frame within {:?}, tick skipped", waited);
                        session.drops.timeout += 1;
                    }
                }
            }
            Tick::MaxFrames => break StopReason::MaxFrames,
            Tick::Fatal => break StopReason::Error,
        }

        let missed = schedule.complete(Instant::now());
        if missed > 0 {
            log::debug!("Tick overran by {} interval(s), re-anchoring", missed);
        }
    };

    session.ticks_overrun = schedule.overruns();
    session.drops.evicted = source.dropped().saturating_sub(evicted_before);
    set_state(&state, PipelineState::Stopping);
    let sink_stats = teardown(&mut session, &mut encoder, &mut *sink);
    session.is_active = false;

    let summary = session.summary(stop_reason, sink_stats);
    log::info!(
        "Session {} stopped ({:?}): {} written, {} dropped in {:.2}s",
        summary.session_id,
        summary.stop_reason,
        summary.frames_written,
        summary.frames_dropped,
        summary.elapsed_secs
    );
    LoopExit { source, summary }
}

fn tick(
    session: &mut RecordingSession,
    source: &mut dyn FrameSource,
    encoder: &mut FrameEncoder,
    sink: &mut dyn Sink,
    config: &PipelineConfig,
    retry: RetryPolicy,
) -> Tick {
    let frame = match source.try_acquire(config.tick_interval()) {
        Ok(frame) => frame,
        Err(AcquireError::Incomplete { sequence, status }) => {
            log::debug!("Frame {} incomplete (status {}), dropped", sequence, status);
            session.drops.incomplete += 1;
            return Tick::Continue;
        }
        Err(AcquireError::Timeout(waited)) => return Tick::TimedOut(waited),
        Err(e) => {
            log::error!("Camera failed: {}", e);
            session.fail(e.kind().unwrap_or(ErrorKind::DeviceError), e.to_string());
            return Tick::Fatal;
        }
    };

    let sequence = frame.sequence();
    let frame = match FormatConverter::convert(frame, config.output_pixel_format) {
        Ok(frame) => frame,
        Err(e) => {
            log::warn!("Frame {} not converted: {}", sequence, e);
            session.drops.conversion += 1;
            return Tick::Continue;
        }
    };

    let chunks = match submit_with_retry(encoder, &frame, retry) {
        Ok(chunks) => chunks,
        Err(e) if e.is_per_frame() => {
            log::warn!("Frame {} dropped by encoder: {}", sequence, e);
            session.drops.encoder += 1;
            return Tick::Continue;
        }
        Err(e) => {
            log::error!("Encoder failed on frame {}: {}", sequence, e);
            session.fail(e.kind(), e.to_string());
            return Tick::Fatal;
        }
    };
    drop(frame);
    session.frames_pending += 1;

    for chunk in &chunks {
        if let Err(e) = sink.write(chunk) {
            log::error!("Sink write failed: {}", e);
            session.fail(e.kind(), e.to_string());
            return Tick::Fatal;
        }
        if !chunk.is_empty() {
            session.record_written(chunk.len());
        }
    }
    // An aligned encoder has just written this frame's access unit. Lookahead
    // output cannot be attributed to frames until the tail is written.
    if encoder.is_frame_aligned() {
        session.frames_written += session.frames_pending;
        session.frames_pending = 0;
    }

    match config.max_frames {
        Some(max) if session.frames_accepted() >= max => Tick::MaxFrames,
        _ => Tick::Continue,
    }
}

fn teardown(
    session: &mut RecordingSession,
    encoder: &mut FrameEncoder,
    sink: &mut dyn Sink,
) -> Option<SinkStats> {
    let sink_broken = matches!(
        session.last_error(),
        Some(ErrorKind::SinkIo | ErrorKind::DownstreamFailed | ErrorKind::Muxer)
    );

    let Drained { chunks: tail, error } = encoder.drain();
    if let Some(e) = error {
        log::error!("Encoder drain failed: {}", e);
        session.fail(e.kind(), e.to_string());
    }

    if sink_broken {
        log::warn!("Discarding {} tail chunks: sink already failed", tail.len());
    } else {
        let mut delivered = true;
        for chunk in &tail {
            if let Err(e) = sink.write(chunk) {
                log::error!("Writing encoder tail failed: {}", e);
                session.fail(e.kind(), e.to_string());
                delivered = false;
                break;
            }
            if !chunk.is_empty() {
                session.record_written(chunk.len());
            }
        }
        if delivered {
            session.frames_written += session.frames_pending;
            session.frames_pending = 0;
        }
    }
    if session.frames_pending > 0 {
        log::warn!(
            "Session {}: output of {} accepted frames never reached the sink",
            session.id,
            session.frames_pending
        );
    }

    match sink.close() {
        Ok(stats) => Some(stats),
        Err(e) => {
            log::error!("Sink close failed: {}", e);
            session.fail(e.kind(), e.to_string());
            None
        }
    }
}

fn set_state(state: &Mutex<PipelineState>, next: PipelineState) {
    *state.lock().expect("lock poisoned") = next;
}
