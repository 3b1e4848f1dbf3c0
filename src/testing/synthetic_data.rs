//! Deterministic synthetic images
//!
//! Content changes with the sequence number so encoders see motion, and is
//! byte-identical for the same inputs so conversion results can be compared.

use crate::format::{frame_size, PixelFormat};
use crate::frame::Frame;

/// A moving gradient in `format`, sized exactly for the geometry
pub fn synthetic_frame(sequence: u64, width: u32, height: u32, format: PixelFormat) -> Frame {
    Frame::new(width, height, format, synthetic_payload(sequence, width, height, format), sequence)
}

pub fn synthetic_payload(sequence: u64, width: u32, height: u32, format: PixelFormat) -> Vec<u8> {
    let base = (sequence % 256) as u8;
    let (w, h) = (width as usize, height as usize);

    match format {
        PixelFormat::Gray8 | PixelFormat::BayerRg8 => (0..h)
            .flat_map(|y| (0..w).map(move |x| base.wrapping_add((x + y) as u8)))
            .collect(),
        PixelFormat::Rgb8 | PixelFormat::Bgr8 => {
            let mut data = vec![0u8; w * h * 3];
            for y in 0..h {
                for x in 0..w {
                    let idx = (y * w + x) * 3;
                    data[idx] = base.wrapping_add(x as u8);
                    data[idx + 1] = base.wrapping_add(y as u8);
                    data[idx + 2] = base.wrapping_add((x + y) as u8);
                }
            }
            data
        }
        _ => {
            // Planar / 16-bit layouts: any byte pattern is a valid image.
            let len = frame_size(width, height, format);
            (0..len).map(|i| base.wrapping_add((i % 251) as u8)).collect()
        }
    }
}
