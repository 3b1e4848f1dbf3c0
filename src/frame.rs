//! Frame and encoded-chunk values passed between pipeline stages

use std::time::Instant;

use bytes::Bytes;

use crate::format::{frame_size, PixelFormat};

/// One decoded image, owned by whichever stage is processing it.
///
/// Only complete frames exist as `Frame`; a partial transfer surfaces as
/// [`AcquireError::Incomplete`](crate::errors::AcquireError::Incomplete)
/// and never carries a buffer.
#[derive(Debug, Clone)]
pub struct Frame {
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    data: Bytes,
    captured_at: Instant,
    sequence: u64,
}

impl Frame {
    pub fn new(
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
        data: impl Into<Bytes>,
        sequence: u64,
    ) -> Self {
        Self {
            width,
            height,
            pixel_format,
            data: data.into(),
            captured_at: Instant::now(),
            sequence,
        }
    }

    pub fn with_captured_at(mut self, captured_at: Instant) -> Self {
        self.captured_at = captured_at;
        self
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Shared handle to the payload, no copy
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Byte count the declared geometry and format require
    pub fn expected_size(&self) -> usize {
        frame_size(self.width, self.height, self.pixel_format)
    }

    pub fn has_valid_size(&self) -> bool {
        self.data.len() == self.expected_size()
    }

    /// Same capture identity with a new layout
    pub(crate) fn with_payload(&self, pixel_format: PixelFormat, data: Vec<u8>) -> Frame {
        Frame {
            width: self.width,
            height: self.height,
            pixel_format,
            data: Bytes::from(data),
            captured_at: self.captured_at,
            sequence: self.sequence,
        }
    }
}

/// A unit of compressed bitstream.
///
/// `frame_index` is set when the chunk is exactly one access unit for the
/// frame with that zero-based submission index; stream encoders that emit
/// arbitrary byte runs leave it `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    pub data: Bytes,
    pub is_final: bool,
    pub is_keyframe: bool,
    pub frame_index: Option<u64>,
}

impl EncodedChunk {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            is_final: false,
            is_keyframe: false,
            frame_index: None,
        }
    }

    /// One access unit for the frame at `index`
    pub fn access_unit(data: impl Into<Bytes>, index: u64, is_keyframe: bool) -> Self {
        Self {
            data: data.into(),
            is_final: false,
            is_keyframe,
            frame_index: Some(index),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
