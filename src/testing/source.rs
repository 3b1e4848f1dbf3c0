//! Hardware-free frame sources

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::errors::AcquireError;
use crate::frame::Frame;
use crate::source::{CameraBackend, DeviceInfo, FrameQueue, FrameSource, SequenceCounter, SourceFormat};
use crate::testing::synthetic_data::{synthetic_frame, synthetic_payload};

/// One scripted answer to `try_acquire`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceStep {
    Frame,
    Incomplete(u32),
    /// A frame whose payload is one byte short of its geometry
    Truncated,
    /// Waits out the timeout, then reports it
    Timeout,
    Disconnect,
    DeviceError(String),
}

/// What happens after the script runs out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhenExhausted {
    Timeout,
    Disconnect,
}

/// Instants at which `try_acquire` was entered
pub type AcquireLog = Arc<Mutex<Vec<Instant>>>;

/// Plays back a fixed list of outcomes
pub struct ScriptedSource {
    format: SourceFormat,
    steps: VecDeque<SourceStep>,
    when_exhausted: WhenExhausted,
    sequence: SequenceCounter,
    log: AcquireLog,
}

impl ScriptedSource {
    pub fn new(format: SourceFormat, steps: impl IntoIterator<Item = SourceStep>) -> Self {
        Self {
            format,
            steps: steps.into_iter().collect(),
            when_exhausted: WhenExhausted::Timeout,
            sequence: SequenceCounter::new(),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// `count` good frames
    pub fn frames(format: SourceFormat, count: usize) -> Self {
        Self::new(format, std::iter::repeat(SourceStep::Frame).take(count))
    }

    pub fn when_exhausted(mut self, behaviour: WhenExhausted) -> Self {
        self.when_exhausted = behaviour;
        self
    }

    pub fn acquire_log(&self) -> AcquireLog {
        self.log.clone()
    }
}

impl FrameSource for ScriptedSource {
    fn format(&self) -> SourceFormat {
        self.format
    }

    fn try_acquire(&mut self, timeout: Duration) -> Result<Frame, AcquireError> {
        self.log.lock().expect("lock poisoned").push(Instant::now());

        let step = self.steps.pop_front().unwrap_or(match self.when_exhausted {
            WhenExhausted::Timeout => SourceStep::Timeout,
            WhenExhausted::Disconnect => SourceStep::Disconnect,
        });

        match step {
            SourceStep::Frame => {
                let seq = self.sequence.next();
                let f = self.format;
                Ok(synthetic_frame(seq, f.width, f.height, f.pixel_format))
            }
            SourceStep::Truncated => {
                let seq = self.sequence.next();
                let f = self.format;
                let mut data = synthetic_payload(seq, f.width, f.height, f.pixel_format);
                data.pop();
                Ok(Frame::new(f.width, f.height, f.pixel_format, data, seq))
            }
            SourceStep::Incomplete(status) => Err(AcquireError::Incomplete {
                sequence: self.sequence.next(),
                status,
            }),
            SourceStep::Timeout => {
                std::thread::sleep(timeout);
                Err(AcquireError::Timeout(timeout))
            }
            SourceStep::Disconnect => Err(AcquireError::DeviceDisconnected(
                "scripted disconnect".to_string(),
            )),
            SourceStep::DeviceError(msg) => Err(AcquireError::DeviceError(msg)),
        }
    }
}

/// A free-running fake camera: frames arrive at `fps` on a producer thread,
/// whether or not anyone is acquiring.
#[derive(Debug, Clone, Copy)]
pub struct SyntheticCamera {
    format: SourceFormat,
    fps: u32,
}

impl SyntheticCamera {
    pub fn new(format: SourceFormat, fps: u32) -> Self {
        Self {
            format,
            fps: fps.max(1),
        }
    }

    pub fn open_source(&self) -> SyntheticSource {
        SyntheticSource::start(self.format, self.fps)
    }
}

impl CameraBackend for SyntheticCamera {
    fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, AcquireError> {
        Ok(vec![DeviceInfo {
            index: 0,
            name: "Synthetic camera".to_string(),
            description: format!("{} @ {} Hz", self.format, self.fps),
        }])
    }

    fn open(&self, device: &DeviceInfo) -> Result<Box<dyn FrameSource>, AcquireError> {
        if device.index != 0 {
            return Err(AcquireError::DeviceError(format!(
                "no synthetic device {}",
                device.index
            )));
        }
        Ok(Box::new(self.open_source()))
    }
}

pub struct SyntheticSource {
    format: SourceFormat,
    queue: Arc<FrameQueue<Frame>>,
    stop_flag: Arc<AtomicBool>,
    producer: Option<JoinHandle<()>>,
}

impl SyntheticSource {
    fn start(format: SourceFormat, fps: u32) -> Self {
        let queue = Arc::new(FrameQueue::new(2));
        let stop_flag = Arc::new(AtomicBool::new(false));
        let period = Duration::from_secs_f64(1.0 / fps as f64);

        let producer = {
            let queue = queue.clone();
            let stop_flag = stop_flag.clone();
            std::thread::Builder::new()
                .name("acquire-video-synthetic-camera".to_string())
                .spawn(move || {
                    let mut sequence = SequenceCounter::new();
                    while !stop_flag.load(Ordering::Relaxed) {
                        let seq = sequence.next();
                        let frame = synthetic_frame(seq, format.width, format.height, format.pixel_format);
                        if !queue.push_latest(frame) {
                            break;
                        }
                        std::thread::sleep(period);
                    }
                })
                .ok()
        };
        if producer.is_none() {
            log::warn!("Synthetic camera thread failed to start");
            queue.close();
        }

        Self {
            format,
            queue,
            stop_flag,
            producer,
        }
    }
}

impl FrameSource for SyntheticSource {
    fn format(&self) -> SourceFormat {
        self.format
    }

    fn try_acquire(&mut self, timeout: Duration) -> Result<Frame, AcquireError> {
        match self.queue.pop_timeout(timeout) {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(AcquireError::Timeout(timeout)),
            Err(_) => Err(AcquireError::DeviceDisconnected(
                "synthetic camera stopped".to_string(),
            )),
        }
    }

    /// Frames evicted because the consumer fell behind
    fn dropped(&self) -> u64 {
        self.queue.dropped()
    }
}

impl Drop for SyntheticSource {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        self.queue.close();
        if let Some(handle) = self.producer.take() {
            let _ = handle.join();
        }
    }
}
