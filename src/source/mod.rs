//! Camera-side contracts
//!
//! A [`CameraBackend`] enumerates and opens devices. The opened device is a
//! [`FrameSource`]; dropping it releases the camera.

pub mod queue;

#[cfg(feature = "camera")]
pub mod camera;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::AcquireError;
use crate::format::PixelFormat;
use crate::frame::Frame;

pub use queue::{FrameQueue, QueueClosed};

#[cfg(feature = "camera")]
pub use camera::{NokhwaBackend, NokhwaSource};

/// Geometry and layout a source delivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
}

impl SourceFormat {
    pub fn new(width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        Self {
            width,
            height,
            pixel_format,
        }
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.pixel_format)
    }
}

/// One enumerated camera
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub index: u32,
    pub name: String,
    pub description: String,
}

/// Produces frames from exactly one opened camera.
///
/// Frames come out in strictly increasing sequence order. The call must
/// return within `timeout` so a dead device cannot hang the caller.
pub trait FrameSource: Send {
    fn format(&self) -> SourceFormat;

    fn try_acquire(&mut self, timeout: Duration) -> Result<Frame, AcquireError>;

    /// Frames the device delivered but discarded before anyone acquired
    /// them, counted since the source was opened.
    fn dropped(&self) -> u64 {
        0
    }
}

impl FrameSource for Box<dyn FrameSource> {
    fn format(&self) -> SourceFormat {
        (**self).format()
    }

    fn try_acquire(&mut self, timeout: Duration) -> Result<Frame, AcquireError> {
        (**self).try_acquire(timeout)
    }

    fn dropped(&self) -> u64 {
        (**self).dropped()
    }
}

/// Device discovery and opening
pub trait CameraBackend {
    fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, AcquireError>;

    fn open(&self, device: &DeviceInfo) -> Result<Box<dyn FrameSource>, AcquireError>;
}

/// Monotonic frame numbering, starting at 1.
///
/// Incomplete transfers consume a number too, so gaps in delivered
/// sequences show where frames were lost.
#[derive(Debug)]
pub struct SequenceCounter {
    next: u64,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn next(&mut self) -> u64 {
        let seq = self.next;
        self.next = self.next.saturating_add(1);
        seq
    }

    pub fn peek(&self) -> u64 {
        self.next
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_starts_at_one() {
        let mut seq = SequenceCounter::new();
        assert_eq!(seq.next(), 1);
        assert_eq!(seq.next(), 2);
        assert_eq!(seq.peek(), 3);
    }

    #[test]
    fn test_source_format_display() {
        let fmt = SourceFormat::new(640, 480, PixelFormat::Gray8);
        assert_eq!(fmt.to_string(), "640x480 GRAY8");
    }
}
