//! Pixel formats and their byte-size rules
//!
//! Every layout the pipeline handles is listed in [`PixelFormat`]. Sizes are
//! pure functions of width, height and format; [`convert`] holds the legal
//! conversion table.

pub mod convert;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::errors::ConvertError;

pub use convert::{FormatConverter, Route};

/// Closed set of sensor and encoder pixel layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    #[serde(rename = "GRAY8")]
    Gray8,
    #[serde(rename = "RGB8")]
    Rgb8,
    #[serde(rename = "BGR8")]
    Bgr8,
    /// 8-bit Bayer mosaic, RGGB cell order
    #[serde(rename = "BAYER_RG8")]
    BayerRg8,
    /// Planar I420: Y, then U, then V quarter planes
    #[serde(rename = "YUV420")]
    Yuv420,
    /// Y plane followed by one interleaved UV quarter plane
    #[serde(rename = "NV12")]
    Nv12,
    #[serde(rename = "YUV444")]
    Yuv444,
    #[serde(rename = "ARGB")]
    Argb,
    #[serde(rename = "ABGR")]
    Abgr,
    /// NV12 layout with 16-bit little-endian samples, 10 significant MSBs
    #[serde(rename = "P010")]
    P010,
    /// Planar 4:4:4 with 16-bit little-endian samples
    #[serde(rename = "YUV444_16BIT")]
    Yuv444_16Bit,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 11] = [
        PixelFormat::Gray8,
        PixelFormat::Rgb8,
        PixelFormat::Bgr8,
        PixelFormat::BayerRg8,
        PixelFormat::Yuv420,
        PixelFormat::Nv12,
        PixelFormat::Yuv444,
        PixelFormat::Argb,
        PixelFormat::Abgr,
        PixelFormat::P010,
        PixelFormat::Yuv444_16Bit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PixelFormat::Gray8 => "GRAY8",
            PixelFormat::Rgb8 => "RGB8",
            PixelFormat::Bgr8 => "BGR8",
            PixelFormat::BayerRg8 => "BAYER_RG8",
            PixelFormat::Yuv420 => "YUV420",
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Yuv444 => "YUV444",
            PixelFormat::Argb => "ARGB",
            PixelFormat::Abgr => "ABGR",
            PixelFormat::P010 => "P010",
            PixelFormat::Yuv444_16Bit => "YUV444_16BIT",
        }
    }

    /// Name of the matching `-pix_fmt` in ffmpeg
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            PixelFormat::Gray8 => "gray",
            PixelFormat::Rgb8 => "rgb24",
            PixelFormat::Bgr8 => "bgr24",
            PixelFormat::BayerRg8 => "bayer_rggb8",
            PixelFormat::Yuv420 => "yuv420p",
            PixelFormat::Nv12 => "nv12",
            PixelFormat::Yuv444 => "yuv444p",
            PixelFormat::Argb => "argb",
            PixelFormat::Abgr => "abgr",
            PixelFormat::P010 => "p010le",
            PixelFormat::Yuv444_16Bit => "yuv444p16le",
        }
    }

    /// Whether the layout stores chroma (or the Bayer cell) per 2x2 block
    pub fn requires_even_dimensions(&self) -> bool {
        matches!(
            self,
            PixelFormat::Yuv420 | PixelFormat::Nv12 | PixelFormat::P010 | PixelFormat::BayerRg8
        )
    }

    pub fn is_yuv(&self) -> bool {
        matches!(
            self,
            PixelFormat::Yuv420
                | PixelFormat::Nv12
                | PixelFormat::Yuv444
                | PixelFormat::P010
                | PixelFormat::Yuv444_16Bit
        )
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown pixel format '{0}'")]
pub struct ParsePixelFormatError(pub String);

impl FromStr for PixelFormat {
    type Err = ParsePixelFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        PixelFormat::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == upper)
            .ok_or_else(|| ParsePixelFormatError(s.to_string()))
    }
}

/// Byte count of one `width` x `height` frame in `format`
///
/// 4:2:0 layouts assume even dimensions; see [`validate_dimensions`].
pub fn frame_size(width: u32, height: u32, format: PixelFormat) -> usize {
    let pixels = width as usize * height as usize;
    match format {
        PixelFormat::Gray8 | PixelFormat::BayerRg8 => pixels,
        PixelFormat::Rgb8 | PixelFormat::Bgr8 | PixelFormat::Yuv444 => pixels * 3,
        PixelFormat::Yuv420 | PixelFormat::Nv12 => pixels * 3 / 2,
        PixelFormat::Argb | PixelFormat::Abgr => pixels * 4,
        PixelFormat::P010 => pixels * 3 / 2 * 2,
        PixelFormat::Yuv444_16Bit => pixels * 3 * 2,
    }
}

/// Reject geometries a format cannot represent
pub fn validate_dimensions(width: u32, height: u32, format: PixelFormat) -> Result<(), ConvertError> {
    let odd = width % 2 != 0 || height % 2 != 0;
    if width == 0 || height == 0 || (format.requires_even_dimensions() && odd) {
        return Err(ConvertError::InvalidDimensions {
            format,
            width,
            height,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_documented_sizes() {
        assert_eq!(frame_size(640, 480, PixelFormat::Gray8), 307_200);
        assert_eq!(frame_size(640, 480, PixelFormat::Nv12), 460_800);
        assert_eq!(frame_size(640, 480, PixelFormat::Yuv420), 460_800);
        assert_eq!(frame_size(640, 480, PixelFormat::Argb), 1_228_800);
        assert_eq!(frame_size(640, 480, PixelFormat::Yuv444), 921_600);
        assert_eq!(frame_size(640, 480, PixelFormat::P010), 921_600);
        assert_eq!(frame_size(640, 480, PixelFormat::Yuv444_16Bit), 1_843_200);
    }

    #[test]
    fn test_parse_round_trips_names() {
        for format in PixelFormat::ALL {
            assert_eq!(format.as_str().parse::<PixelFormat>().unwrap(), format);
        }
        assert_eq!("nv12".parse::<PixelFormat>().unwrap(), PixelFormat::Nv12);
        assert!("YUYV".parse::<PixelFormat>().is_err());
    }

    #[test]
    fn test_odd_dimensions_rejected_for_subsampled() {
        assert!(validate_dimensions(641, 480, PixelFormat::Nv12).is_err());
        assert!(validate_dimensions(641, 480, PixelFormat::BayerRg8).is_err());
        assert!(validate_dimensions(641, 481, PixelFormat::Gray8).is_ok());
        assert!(validate_dimensions(0, 480, PixelFormat::Gray8).is_err());
    }

    #[test]
    fn test_serde_uses_glossary_names() {
        let json = serde_json::to_string(&PixelFormat::Yuv444_16Bit).unwrap();
        assert_eq!(json, "\"YUV444_16BIT\"");
        let back: PixelFormat = serde_json::from_str("\"BAYER_RG8\"").unwrap();
        assert_eq!(back, PixelFormat::BayerRg8);
    }
}
