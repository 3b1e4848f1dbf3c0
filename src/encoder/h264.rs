//! In-process H.264 using openh264

use openh264::encoder::{Encoder, FrameType};
use openh264::formats::YUVBuffer;

use crate::encoder::{Codec, Drained, EncoderBackend, EncoderSettings};
use crate::errors::EncodeError;
use crate::format::PixelFormat;
use crate::frame::{EncodedChunk, Frame};

/// openh264 has no lookahead: every accepted frame yields its access unit
/// immediately, so the stream can be muxed frame by frame.
pub struct OpenH264Backend {
    encoder: Encoder,
    width: usize,
    height: usize,
    frames: u64,
}

impl OpenH264Backend {
    pub fn new(settings: &EncoderSettings) -> Result<Self, EncodeError> {
        if settings.codec != Codec::H264 || settings.input_format != PixelFormat::Yuv420 {
            return Err(EncodeError::UnsupportedFormat {
                format: settings.input_format,
                codec: settings.codec,
            });
        }
        if settings.lossless {
            return Err(EncodeError::DeviceError(
                "openh264 has no lossless mode".to_string(),
            ));
        }

        // Dimensions are taken from each YUV buffer; rate control uses the
        // library defaults.
        let encoder = Encoder::new()
            .map_err(|e| EncodeError::DeviceError(format!("failed to create encoder: {e}")))?;

        Ok(Self {
            encoder,
            width: settings.width as usize,
            height: settings.height as usize,
            frames: 0,
        })
    }
}

impl EncoderBackend for OpenH264Backend {
    fn name(&self) -> &'static str {
        "openh264"
    }

    fn frame_aligned(&self) -> bool {
        true
    }

    fn encode(&mut self, frame: &Frame) -> Result<Vec<EncodedChunk>, EncodeError> {
        let yuv = YUVBuffer::from_vec(frame.data().to_vec(), self.width, self.height);

        let bitstream = self
            .encoder
            .encode(&yuv)
            .map_err(|e| EncodeError::DeviceError(format!("encoding failed: {e}")))?;

        let is_keyframe = matches!(bitstream.frame_type(), FrameType::IDR | FrameType::I);
        let data = bitstream.to_vec();
        self.frames += 1;

        // Rate control may skip a frame entirely.
        if data.is_empty() {
            return Ok(Vec::new());
        }

        let mut chunk = EncodedChunk::new(data);
        chunk.is_keyframe = is_keyframe;
        Ok(vec![chunk])
    }

    fn flush(&mut self) -> Drained {
        log::debug!("openh264 encoded {} frames", self.frames);
        Drained::default()
    }
}
