//! Session control: start, stop and observe one recording at a time
//!
//! [`Pipeline`] is a cheap handle; clones share the same camera and session,
//! so `stop` may be called from any thread. Control reaches the loop only
//! through a channel, never by touching loop-owned state.

pub mod config;
pub mod session;

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Sender};
use serde::{Deserialize, Serialize};

use crate::encoder::{build_encoder, FrameEncoder, RetryPolicy};
use crate::errors::{ConfigError, EncodeError, PipelineError, SinkError};
use crate::format::{validate_dimensions, FormatConverter};
use crate::sink::{open_sink, Sink};
use crate::source::{FrameSource, SourceFormat};

pub use config::PipelineConfig;
pub use session::{DropCounts, RecordingSession, SessionSummary, StopReason};

use session::{Control, LoopExit, LoopParts};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Builds the encoder for a session
pub type EncoderBuilder =
    Box<dyn Fn(&PipelineConfig, SourceFormat) -> Result<FrameEncoder, EncodeError> + Send + Sync>;

/// Opens the sink for a session
pub type SinkBuilder =
    Box<dyn Fn(&PipelineConfig, SourceFormat) -> Result<Box<dyn Sink>, SinkError> + Send + Sync>;

/// Requests a stop without waiting for teardown
#[derive(Debug, Clone)]
pub struct StopHandle {
    control: Sender<Control>,
}

impl StopHandle {
    pub fn request_stop(&self) {
        // A full channel already holds a Stop.
        let _ = self.control.try_send(Control::Stop);
    }
}

struct ActiveSession {
    control: Sender<Control>,
    handle: JoinHandle<Option<LoopExit>>,
    snapshot: RecordingSession,
}

struct Inner {
    state: Arc<Mutex<PipelineState>>,
    source: Mutex<Option<Box<dyn FrameSource>>>,
    active: Mutex<Option<ActiveSession>>,
    last_summary: Mutex<Option<SessionSummary>>,
    encoder_builder: EncoderBuilder,
    sink_builder: SinkBuilder,
    retry: RetryPolicy,
}

#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    /// Pipeline with the encoder and sink chosen by each session's config
    pub fn new(source: Box<dyn FrameSource>) -> Self {
        Self::with_builders(
            source,
            Box::new(|config, format| build_encoder(config.encoder, config.encoder_settings(format))),
            Box::new(|config, format| open_sink(config.sink_kind(), &config.sink_settings(format))),
        )
    }

    pub fn with_builders(
        source: Box<dyn FrameSource>,
        encoder_builder: EncoderBuilder,
        sink_builder: SinkBuilder,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Arc::new(Mutex::new(PipelineState::Stopped)),
                source: Mutex::new(Some(source)),
                active: Mutex::new(None),
                last_summary: Mutex::new(None),
                encoder_builder,
                sink_builder,
                retry: RetryPolicy::default(),
            }),
        }
    }

    pub fn state(&self) -> PipelineState {
        *self.inner.state.lock().expect("lock poisoned")
    }

    pub fn is_running(&self) -> bool {
        self.state() == PipelineState::Running
    }

    fn set_state(&self, state: PipelineState) {
        *self.inner.state.lock().expect("lock poisoned") = state;
    }

    fn return_source(&self, source: Box<dyn FrameSource>) {
        *self.inner.source.lock().expect("lock poisoned") = Some(source);
    }

    /// Validate `config`, open the encoder and sink, and begin acquiring.
    ///
    /// Nothing is opened if validation fails. A second call while a session
    /// exists fails with [`PipelineError::SessionAlreadyActive`].
    pub fn start(&self, config: PipelineConfig) -> Result<(), PipelineError> {
        config.validate()?;

        let mut active = self.inner.active.lock().expect("lock poisoned");
        if active.is_some() {
            return Err(PipelineError::SessionAlreadyActive);
        }
        let source = self
            .inner
            .source
            .lock()
            .expect("lock poisoned")
            .take()
            .ok_or(PipelineError::SessionAlreadyActive)?;

        self.set_state(PipelineState::Starting);
        let format = source.format();
        let opened = self.open_stages(&config, format);
        let (encoder, sink) = match opened {
            Ok(stages) => stages,
            Err(e) => {
                self.return_source(source);
                self.set_state(PipelineState::Stopped);
                return Err(e);
            }
        };

        let description = format!(
            "{} -> {} {} at {} Hz into {}",
            format,
            config.output_pixel_format,
            config.codec,
            config.target_framerate_hz,
            config.output_path.display()
        );
        let session = RecordingSession::new(&config);
        let snapshot = session.clone();
        let (control_tx, control_rx) = bounded(1);
        let parts = LoopParts {
            source,
            encoder,
            sink,
            config,
            control: control_rx,
            state: self.inner.state.clone(),
            session,
            retry: self.inner.retry,
        };

        self.set_state(PipelineState::Running);
        let builder = std::thread::Builder::new().name("acquire-video-session".to_string());
        let handle = match spawn_loop(builder, parts) {
            Ok(handle) => handle,
            Err((e, source)) => {
                log::error!("Failed to spawn acquisition thread: {}", e);
                if let Some(source) = source {
                    self.return_source(source);
                }
                self.set_state(PipelineState::Stopped);
                return Err(PipelineError::Spawn(e.to_string()));
            }
        };

        log::info!("Session {} started: {}", snapshot.id(), description);

        *active = Some(ActiveSession {
            control: control_tx,
            handle,
            snapshot,
        });
        Ok(())
    }

    fn open_stages(
        &self,
        config: &PipelineConfig,
        format: SourceFormat,
    ) -> Result<(FrameEncoder, Box<dyn Sink>), PipelineError> {
        if !FormatConverter::supports(format.pixel_format, config.output_pixel_format) {
            return Err(ConfigError::NoConversionPath {
                from: format.pixel_format,
                to: config.output_pixel_format,
            }
            .into());
        }
        validate_dimensions(format.width, format.height, format.pixel_format)
            .and_then(|_| validate_dimensions(format.width, format.height, config.output_pixel_format))
            .map_err(|e| ConfigError::InvalidValue(e.to_string()))?;

        let encoder = (self.inner.encoder_builder)(config, format)?;
        let sink = (self.inner.sink_builder)(config, format)?;
        Ok((encoder, sink))
    }

    /// Handle for requesting a stop from another context, e.g. a signal
    /// handler. `None` when no session is active.
    pub fn stop_handle(&self) -> Option<StopHandle> {
        self.inner
            .active
            .lock()
            .expect("lock poisoned")
            .as_ref()
            .map(|s| StopHandle {
                control: s.control.clone(),
            })
    }

    /// Wait up to `timeout` for the loop to end on its own (max frames or a
    /// fatal error). True when no loop is running.
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        loop {
            let finished = self
                .inner
                .active
                .lock()
                .expect("lock poisoned")
                .as_ref()
                .map_or(true, |s| s.handle.is_finished());
            if finished {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// End the session and return its summary.
    ///
    /// Repeated calls return the stored summary of the last session.
    pub fn stop(&self) -> Result<SessionSummary, PipelineError> {
        let mut active = self.inner.active.lock().expect("lock poisoned");
        let Some(session) = active.take() else {
            return self
                .inner
                .last_summary
                .lock()
                .expect("lock poisoned")
                .clone()
                .ok_or(PipelineError::NotStarted);
        };

        let _ = session.control.try_send(Control::Stop);
        {
            let mut state = self.inner.state.lock().expect("lock poisoned");
            if *state == PipelineState::Running {
                *state = PipelineState::Stopping;
            }
        }

        let summary = match session.handle.join() {
            Ok(Some(LoopExit { source, summary })) => {
                self.return_source(source);
                summary
            }
            Ok(None) | Err(_) => {
                log::error!("Session {} loop panicked", session.snapshot.id());
                SessionSummary::panicked(&session.snapshot)
            }
        };

        self.set_state(PipelineState::Stopped);
        *self.inner.last_summary.lock().expect("lock poisoned") = Some(summary.clone());
        Ok(summary)
    }

    /// Summary of the most recently stopped session
    pub fn last_summary(&self) -> Option<SessionSummary> {
        self.inner.last_summary.lock().expect("lock poisoned").clone()
    }
}

/// Start the loop thread. If the thread cannot be created the source comes
/// back with the error so the camera stays usable.
fn spawn_loop(
    builder: std::thread::Builder,
    parts: LoopParts,
) -> Result<JoinHandle<Option<LoopExit>>, (std::io::Error, Option<Box<dyn FrameSource>>)> {
    let slot = Arc::new(Mutex::new(Some(parts)));
    let thread_slot = slot.clone();
    builder
        .spawn(move || {
            let parts = thread_slot.lock().expect("lock poisoned").take();
            parts.map(session::run)
        })
        .map_err(|e| {
            let source = slot.lock().expect("lock poisoned").take().map(|p| p.source);
            (e, source)
        })
}
