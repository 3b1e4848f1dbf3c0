//! nokhwa-backed camera source
//!
//! nokhwa delivers buffers on its own callback thread. The callback copies
//! each buffer into a [`FrameQueue`] of depth 2 so the acquisition loop always
//! sees the most recent capture and the driver is never blocked by encoding.

use std::sync::Arc;
use std::time::{Duration, Instant};

use nokhwa::{
    pixel_format::RgbFormat,
    query,
    utils::{ApiBackend, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType},
    Buffer, CallbackCamera,
};

use crate::errors::AcquireError;
use crate::format::{frame_size, PixelFormat};
use crate::frame::Frame;
use crate::source::{CameraBackend, DeviceInfo, FrameQueue, FrameSource, SequenceCounter, SourceFormat};

const QUEUE_DEPTH: usize = 2;
const WARMUP_TIMEOUT: Duration = Duration::from_secs(5);

// Status codes carried by `AcquireError::Incomplete`.
const STATUS_SHORT_PAYLOAD: u32 = 1;
const STATUS_DECODE_FAILED: u32 = 2;

enum Capture {
    Image {
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
        data: Vec<u8>,
        captured_at: Instant,
    },
    Undecodable(String),
}

fn capture_from_buffer(buffer: Buffer) -> Capture {
    let captured_at = Instant::now();
    let resolution = buffer.resolution();
    let (width, height) = (resolution.width_x, resolution.height_y);

    let native = match buffer.source_frame_format() {
        FrameFormat::GRAY => Some(PixelFormat::Gray8),
        FrameFormat::NV12 => Some(PixelFormat::Nv12),
        FrameFormat::RAWRGB => Some(PixelFormat::Rgb8),
        _ => None,
    };

    if let Some(pixel_format) = native {
        return Capture::Image {
            width,
            height,
            pixel_format,
            data: buffer.buffer_bytes().to_vec(),
            captured_at,
        };
    }

    // MJPEG / YUYV are decoded to RGB at the driver boundary.
    match buffer.decode_image::<RgbFormat>() {
        Ok(img) => Capture::Image {
            width,
            height,
            pixel_format: PixelFormat::Rgb8,
            data: img.into_raw(),
            captured_at,
        },
        Err(e) => Capture::Undecodable(e.to_string()),
    }
}

/// Enumerates cameras through nokhwa's platform-native backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct NokhwaBackend;

impl CameraBackend for NokhwaBackend {
    fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, AcquireError> {
        let cameras = query(ApiBackend::Auto)
            .map_err(|e| AcquireError::DeviceError(format!("failed to query cameras: {e}")))?;

        Ok(cameras
            .into_iter()
            .enumerate()
            .map(|(pos, info)| {
                let index = match info.index() {
                    CameraIndex::Index(i) => *i,
                    CameraIndex::String(s) => s.parse().unwrap_or(pos as u32),
                };
                DeviceInfo {
                    index,
                    name: info.human_name(),
                    description: info.description().to_string(),
                }
            })
            .collect())
    }

    fn open(&self, device: &DeviceInfo) -> Result<Box<dyn FrameSource>, AcquireError> {
        Ok(Box::new(NokhwaSource::open(device.index)?))
    }
}

/// An open camera stream. Dropping it stops the stream and releases the device.
pub struct NokhwaSource {
    camera: CallbackCamera,
    queue: Arc<FrameQueue<Capture>>,
    format: SourceFormat,
    pending: Option<Capture>,
    sequence: SequenceCounter,
}

impl NokhwaSource {
    pub fn open(index: u32) -> Result<Self, AcquireError> {
        let queue = Arc::new(FrameQueue::new(QUEUE_DEPTH));
        let producer = queue.clone();

        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::None);
        let mut camera = CallbackCamera::new(CameraIndex::Index(index), requested, move |buffer| {
            producer.push_latest(capture_from_buffer(buffer));
        })
        .map_err(|e| AcquireError::DeviceError(format!("failed to open camera {index}: {e}")))?;

        camera
            .open_stream()
            .map_err(|e| AcquireError::DeviceError(format!("failed to start stream: {e}")))?;

        // Geometry is only known once the first buffer arrives.
        let first = match queue.pop_timeout(WARMUP_TIMEOUT) {
            Ok(Some(capture)) => capture,
            Ok(None) | Err(_) => {
                let _ = camera.stop_stream();
                return Err(AcquireError::DeviceError(format!(
                    "camera {index} produced no frame within {WARMUP_TIMEOUT:?}"
                )));
            }
        };

        let format = match &first {
            Capture::Image {
                width,
                height,
                pixel_format,
                ..
            } => SourceFormat::new(*width, *height, *pixel_format),
            Capture::Undecodable(reason) => {
                let _ = camera.stop_stream();
                return Err(AcquireError::DeviceError(format!(
                    "camera {index} delivers an undecodable format: {reason}"
                )));
            }
        };

        log::info!("Opened camera {} as {}", index, format);

        Ok(Self {
            camera,
            queue,
            format,
            pending: Some(first),
            sequence: SequenceCounter::new(),
        })
    }
}

impl FrameSource for NokhwaSource {
    fn format(&self) -> SourceFormat {
        self.format
    }

    fn try_acquire(&mut self, timeout: Duration) -> Result<Frame, AcquireError> {
        let capture = match self.pending.take() {
            Some(c) => c,
            None => match self.queue.pop_timeout(timeout) {
                Ok(Some(c)) => c,
                Ok(None) if self.camera.is_stream_open() => {
                    return Err(AcquireError::Timeout(timeout))
                }
                Ok(None) | Err(_) => {
                    return Err(AcquireError::DeviceDisconnected(
                        "camera stream closed".to_string(),
                    ))
                }
            },
        };

        let sequence = self.sequence.next();
        match capture {
            Capture::Image {
                width,
                height,
                pixel_format,
                data,
                captured_at,
            } => {
                let geometry_changed = width != self.format.width
                    || height != self.format.height
                    || pixel_format != self.format.pixel_format;
                if geometry_changed || data.len() != frame_size(width, height, pixel_format) {
                    return Err(AcquireError::Incomplete {
                        sequence,
                        status: STATUS_SHORT_PAYLOAD,
                    });
                }
                Ok(Frame::new(width, height, pixel_format, data, sequence).with_captured_at(captured_at))
            }
            Capture::Undecodable(reason) => {
                log::debug!("Frame {} undecodable: {}", sequence, reason);
                Err(AcquireError::Incomplete {
                    sequence,
                    status: STATUS_DECODE_FAILED,
                })
            }
        }
    }
    fn dropped(&self) -> u64 {
        self.queue.dropped()
    }
}

impl Drop for NokhwaSource {
    fn drop(&mut self) {
        self.queue.close();
        if let Err(e) = self.camera.stop_stream() {
            log::warn!("Error stopping camera stream: {}", e);
        }
        if self.queue.dropped() > 0 {
            log::debug!("Camera queue evicted {} stale frames", self.queue.dropped());
        }
    }
}
