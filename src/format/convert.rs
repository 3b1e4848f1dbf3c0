//! Pixel layout conversion
//!
//! Conversions are looked up in a static `(from, to)` table. Each entry is a
//! short chain of kernels, so multi-hop paths such as Bayer -> BGR -> NV12
//! stay visible in one place and the legal set can be enumerated.
//!
//! Colour math is BT.601 limited range. 4:2:0 chroma is the average of each
//! 2x2 block. Widened formats store the 8-bit sample in the high byte of a
//! little-endian 16-bit word.

use crate::errors::ConvertError;
use crate::format::{frame_size, validate_dimensions, PixelFormat};
use crate::frame::Frame;

type Kernel = fn(&[u8], usize, usize) -> Vec<u8>;

/// One kernel in a conversion chain
#[derive(Clone, Copy)]
pub struct Step {
    pub output: PixelFormat,
    kernel: Kernel,
}

/// A legal conversion and the chain that performs it
#[derive(Clone, Copy)]
pub struct Route {
    pub from: PixelFormat,
    pub to: PixelFormat,
    steps: &'static [Step],
}

impl Route {
    /// Formats produced between `from` and `to`
    pub fn intermediates(&self) -> impl Iterator<Item = PixelFormat> + '_ {
        let hops = self.steps.len().saturating_sub(1);
        self.steps[..hops].iter().map(|s| s.output)
    }

    fn run(&self, src: &[u8], width: usize, height: usize) -> Vec<u8> {
        let mut steps = self.steps.iter();
        let Some(first) = steps.next() else {
            return src.to_vec();
        };
        let mut out = (first.kernel)(src, width, height);
        for step in steps {
            out = (step.kernel)(&out, width, height);
        }
        out
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut list = f.debug_list();
        list.entry(&self.from);
        for step in self.steps {
            list.entry(&step.output);
        }
        list.finish()
    }
}

const fn step(output: PixelFormat, kernel: Kernel) -> Step {
    Step { output, kernel }
}

const fn route(from: PixelFormat, to: PixelFormat, steps: &'static [Step]) -> Route {
    Route { from, to, steps }
}

use PixelFormat::*;

static ROUTES: &[Route] = &[
    route(Gray8, Bgr8, &[step(Bgr8, gray_to_bgr)]),
    route(Gray8, Rgb8, &[step(Rgb8, gray_to_rgb)]),
    route(Gray8, Yuv420, &[step(Yuv420, gray_to_yuv420)]),
    route(Gray8, Nv12, &[step(Nv12, gray_to_nv12)]),
    route(Gray8, Yuv444, &[step(Yuv444, gray_to_yuv444)]),
    route(BayerRg8, Bgr8, &[step(Bgr8, bayer_to_bgr)]),
    route(BayerRg8, Rgb8, &[step(Rgb8, bayer_to_rgb)]),
    route(BayerRg8, Yuv420, &[step(Bgr8, bayer_to_bgr), step(Yuv420, bgr_to_yuv420)]),
    route(BayerRg8, Nv12, &[step(Bgr8, bayer_to_bgr), step(Nv12, bgr_to_nv12)]),
    route(Rgb8, Bgr8, &[step(Bgr8, swap_red_blue)]),
    route(Bgr8, Rgb8, &[step(Rgb8, swap_red_blue)]),
    route(Rgb8, Yuv420, &[step(Yuv420, rgb_to_yuv420)]),
    route(Rgb8, Nv12, &[step(Nv12, rgb_to_nv12)]),
    route(Rgb8, Yuv444, &[step(Yuv444, rgb_to_yuv444)]),
    route(Rgb8, Argb, &[step(Argb, rgb_to_argb)]),
    route(Rgb8, Abgr, &[step(Abgr, rgb_to_abgr)]),
    route(Bgr8, Yuv420, &[step(Yuv420, bgr_to_yuv420)]),
    route(Bgr8, Nv12, &[step(Nv12, bgr_to_nv12)]),
    route(Bgr8, Yuv444, &[step(Yuv444, bgr_to_yuv444)]),
    route(Bgr8, Argb, &[step(Argb, bgr_to_argb)]),
    route(Bgr8, Abgr, &[step(Abgr, bgr_to_abgr)]),
    route(Argb, Rgb8, &[step(Rgb8, argb_to_rgb)]),
    route(Argb, Bgr8, &[step(Bgr8, argb_to_bgr)]),
    route(Argb, Yuv420, &[step(Yuv420, argb_to_yuv420)]),
    route(Argb, Nv12, &[step(Nv12, argb_to_nv12)]),
    route(Abgr, Rgb8, &[step(Rgb8, abgr_to_rgb)]),
    route(Abgr, Bgr8, &[step(Bgr8, abgr_to_bgr)]),
    route(Abgr, Yuv420, &[step(Yuv420, abgr_to_yuv420)]),
    route(Abgr, Nv12, &[step(Nv12, abgr_to_nv12)]),
    route(Yuv420, Nv12, &[step(Nv12, yuv420_to_nv12)]),
    route(Nv12, Yuv420, &[step(Yuv420, nv12_to_yuv420)]),
    route(Yuv420, Yuv444, &[step(Yuv444, yuv420_to_yuv444)]),
    route(Yuv444, Yuv420, &[step(Yuv420, yuv444_to_yuv420)]),
    route(Yuv420, P010, &[step(Nv12, yuv420_to_nv12), step(P010, widen_to_16bit)]),
    route(Nv12, P010, &[step(P010, widen_to_16bit)]),
    route(Yuv444, Yuv444_16Bit, &[step(Yuv444_16Bit, widen_to_16bit)]),
];

/// Stateless converter between [`PixelFormat`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatConverter;

impl FormatConverter {
    /// Every non-identity conversion the converter performs
    pub fn routes() -> &'static [Route] {
        ROUTES
    }

    pub fn route(from: PixelFormat, to: PixelFormat) -> Option<&'static Route> {
        ROUTES.iter().find(|r| r.from == from && r.to == to)
    }

    pub fn supports(from: PixelFormat, to: PixelFormat) -> bool {
        from == to || Self::route(from, to).is_some()
    }

    /// Convert `frame` to `target`.
    ///
    /// The input buffer is checked against the declared geometry before any
    /// work happens; on error nothing is produced.
    pub fn convert(frame: Frame, target: PixelFormat) -> Result<Frame, ConvertError> {
        let (width, height, source) = (frame.width(), frame.height(), frame.pixel_format());

        let expected = frame_size(width, height, source);
        if frame.data().len() != expected {
            return Err(ConvertError::SizeMismatch {
                format: source,
                width,
                height,
                expected,
                actual: frame.data().len(),
            });
        }
        validate_dimensions(width, height, source)?;
        validate_dimensions(width, height, target)?;

        if source == target {
            return Ok(frame);
        }

        let route = Self::route(source, target).ok_or(ConvertError::UnsupportedPath {
            from: source,
            to: target,
        })?;

        let out = route.run(frame.data(), width as usize, height as usize);
        debug_assert_eq!(out.len(), frame_size(width, height, target));
        Ok(frame.with_payload(target, out))
    }
}

// Byte offsets of the colour channels inside one packed pixel.
#[derive(Clone, Copy)]
struct Layout {
    r: usize,
    g: usize,
    b: usize,
    a: Option<usize>,
    stride: usize,
}

const GRAY: Layout = Layout { r: 0, g: 0, b: 0, a: None, stride: 1 };
const RGB: Layout = Layout { r: 0, g: 1, b: 2, a: None, stride: 3 };
const BGR: Layout = Layout { r: 2, g: 1, b: 0, a: None, stride: 3 };
const ARGB: Layout = Layout { r: 1, g: 2, b: 3, a: Some(0), stride: 4 };
const ABGR: Layout = Layout { r: 3, g: 2, b: 1, a: Some(0), stride: 4 };

#[inline]
fn luma(r: i32, g: i32, b: i32) -> u8 {
    (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16).clamp(0, 255) as u8
}

#[inline]
fn chroma(r: i32, g: i32, b: i32) -> (u8, u8) {
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (u.clamp(0, 255) as u8, v.clamp(0, 255) as u8)
}

#[inline]
fn rgb_at(src: &[u8], index: usize, layout: Layout) -> (i32, i32, i32) {
    let px = &src[index * layout.stride..];
    (px[layout.r] as i32, px[layout.g] as i32, px[layout.b] as i32)
}

fn repack(src: &[u8], from: Layout, to: Layout) -> Vec<u8> {
    let pixels = src.len() / from.stride;
    let mut out = vec![0u8; pixels * to.stride];
    for (s, d) in src.chunks_exact(from.stride).zip(out.chunks_exact_mut(to.stride)) {
        d[to.r] = s[from.r];
        d[to.g] = s[from.g];
        d[to.b] = s[from.b];
        if let Some(a) = to.a {
            d[a] = from.a.map_or(255, |i| s[i]);
        }
    }
    out
}

fn luma_plane(src: &[u8], width: usize, height: usize, layout: Layout) -> Vec<u8> {
    (0..width * height)
        .map(|i| {
            let (r, g, b) = rgb_at(src, i, layout);
            luma(r, g, b)
        })
        .collect()
}

// One (U, V) pair per 2x2 block, row-major.
fn chroma_420(src: &[u8], width: usize, height: usize, layout: Layout) -> Vec<(u8, u8)> {
    let mut out = Vec::with_capacity((width / 2) * (height / 2));
    for cy in 0..height / 2 {
        for cx in 0..width / 2 {
            let (mut r, mut g, mut b) = (0, 0, 0);
            for (dy, dx) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
                let (pr, pg, pb) = rgb_at(src, (cy * 2 + dy) * width + cx * 2 + dx, layout);
                r += pr;
                g += pg;
                b += pb;
            }
            out.push(chroma((r + 2) / 4, (g + 2) / 4, (b + 2) / 4));
        }
    }
    out
}

fn packed_to_yuv420(src: &[u8], width: usize, height: usize, layout: Layout) -> Vec<u8> {
    let mut out = luma_plane(src, width, height, layout);
    let uv = chroma_420(src, width, height, layout);
    out.reserve(uv.len() * 2);
    out.extend(uv.iter().map(|&(u, _)| u));
    out.extend(uv.iter().map(|&(_, v)| v));
    out
}

fn packed_to_nv12(src: &[u8], width: usize, height: usize, layout: Layout) -> Vec<u8> {
    let mut out = luma_plane(src, width, height, layout);
    let uv = chroma_420(src, width, height, layout);
    out.reserve(uv.len() * 2);
    for (u, v) in uv {
        out.push(u);
        out.push(v);
    }
    out
}

fn packed_to_yuv444(src: &[u8], width: usize, height: usize, layout: Layout) -> Vec<u8> {
    let pixels = width * height;
    let mut out = vec![0u8; pixels * 3];
    let (y_plane, rest) = out.split_at_mut(pixels);
    let (u_plane, v_plane) = rest.split_at_mut(pixels);
    for i in 0..pixels {
        let (r, g, b) = rgb_at(src, i, layout);
        y_plane[i] = luma(r, g, b);
        let (u, v) = chroma(r, g, b);
        u_plane[i] = u;
        v_plane[i] = v;
    }
    out
}

// 2x2 superpixel demosaic for the RGGB cell.
fn demosaic_rggb(src: &[u8], width: usize, height: usize, to: Layout) -> Vec<u8> {
    let mut out = vec![0u8; width * height * to.stride];
    for by in (0..height).step_by(2) {
        for bx in (0..width).step_by(2) {
            let top = by * width + bx;
            let bottom = top + width;
            let r = src[top];
            let g = ((src[top + 1] as u16 + src[bottom] as u16 + 1) / 2) as u8;
            let b = src[bottom + 1];
            for i in [top, top + 1, bottom, bottom + 1] {
                let px = &mut out[i * to.stride..(i + 1) * to.stride];
                px[to.r] = r;
                px[to.g] = g;
                px[to.b] = b;
            }
        }
    }
    out
}

fn gray_to_bgr(src: &[u8], _w: usize, _h: usize) -> Vec<u8> {
    repack(src, GRAY, BGR)
}

fn gray_to_rgb(src: &[u8], _w: usize, _h: usize) -> Vec<u8> {
    repack(src, GRAY, RGB)
}

fn gray_to_yuv420(src: &[u8], w: usize, h: usize) -> Vec<u8> {
    packed_to_yuv420(src, w, h, GRAY)
}

fn gray_to_nv12(src: &[u8], w: usize, h: usize) -> Vec<u8> {
    packed_to_nv12(src, w, h, GRAY)
}

fn gray_to_yuv444(src: &[u8], w: usize, h: usize) -> Vec<u8> {
    packed_to_yuv444(src, w, h, GRAY)
}

fn bayer_to_bgr(src: &[u8], w: usize, h: usize) -> Vec<u8> {
    demosaic_rggb(src, w, h, BGR)
}

fn bayer_to_rgb(src: &[u8], w: usize, h: usize) -> Vec<u8> {
    demosaic_rggb(src, w, h, RGB)
}

// Symmetric: RGB -> BGR and BGR -> RGB are the same byte swap.
fn swap_red_blue(src: &[u8], _w: usize, _h: usize) -> Vec<u8> {
    repack(src, RGB, BGR)
}

fn rgb_to_yuv420(src: &[u8], w: usize, h: usize) -> Vec<u8> {
    packed_to_yuv420(src, w, h, RGB)
}

fn rgb_to_nv12(src: &[u8], w: usize, h: usize) -> Vec<u8> {
    packed_to_nv12(src, w, h, RGB)
}

fn rgb_to_yuv444(src: &[u8], w: usize, h: usize) -> Vec<u8> {
    packed_to_yuv444(src, w, h, RGB)
}

fn rgb_to_argb(src: &[u8], _w: usize, _h: usize) -> Vec<u8> {
    repack(src, RGB, ARGB)
}

fn rgb_to_abgr(src: &[u8], _w: usize, _h: usize) -> Vec<u8> {
    repack(src, RGB, ABGR)
}

fn bgr_to_yuv420(src: &[u8], w: usize, h: usize) -> Vec<u8> {
    packed_to_yuv420(src, w, h, BGR)
}

fn bgr_to_nv12(src: &[u8], w: usize, h: usize) -> Vec<u8> {
    packed_to_nv12(src, w, h, BGR)
}

fn bgr_to_yuv444(src: &[u8], w: usize, h: usize) -> Vec<u8> {
    packed_to_yuv444(src, w, h, BGR)
}

fn bgr_to_argb(src: &[u8], _w: usize, _h: usize) -> Vec<u8> {
    repack(src, BGR, ARGB)
}

fn bgr_to_abgr(src: &[u8], _w: usize, _h: usize) -> Vec<u8> {
    repack(src, BGR, ABGR)
}

fn argb_to_rgb(src: &[u8], _w: usize, _h: usize) -> Vec<u8> {
    repack(src, ARGB, RGB)
}

fn argb_to_bgr(src: &[u8], _w: usize, _h: usize) -> Vec<u8> {
    repack(src, ARGB, BGR)
}

fn argb_to_yuv420(src: &[u8], w: usize, h: usize) -> Vec<u8> {
    packed_to_yuv420(src, w, h, ARGB)
}

fn argb_to_nv12(src: &[u8], w: usize, h: usize) -> Vec<u8> {
    packed_to_nv12(src, w, h, ARGB)
}

fn abgr_to_rgb(src: &[u8], _w: usize, _h: usize) -> Vec<u8> {
    repack(src, ABGR, RGB)
}

fn abgr_to_bgr(src: &[u8], _w: usize, _h: usize) -> Vec<u8> {
    repack(src, ABGR, BGR)
}

fn abgr_to_yuv420(src: &[u8], w: usize, h: usize) -> Vec<u8> {
    packed_to_yuv420(src, w, h, ABGR)
}

fn abgr_to_nv12(src: &[u8], w: usize, h: usize) -> Vec<u8> {
    packed_to_nv12(src, w, h, ABGR)
}

fn yuv420_to_nv12(src: &[u8], w: usize, h: usize) -> Vec<u8> {
    let luma_len = w * h;
    let quarter = luma_len / 4;
    let (u, v) = src[luma_len..].split_at(quarter);
    let mut out = Vec::with_capacity(src.len());
    out.extend_from_slice(&src[..luma_len]);
    for (&cu, &cv) in u.iter().zip(v) {
        out.push(cu);
        out.push(cv);
    }
    out
}

fn nv12_to_yuv420(src: &[u8], w: usize, h: usize) -> Vec<u8> {
    let luma_len = w * h;
    let uv = &src[luma_len..];
    let mut out = Vec::with_capacity(src.len());
    out.extend_from_slice(&src[..luma_len]);
    out.extend(uv.iter().step_by(2));
    out.extend(uv.iter().skip(1).step_by(2));
    out
}

fn yuv420_to_yuv444(src: &[u8], w: usize, h: usize) -> Vec<u8> {
    let luma_len = w * h;
    let quarter = luma_len / 4;
    let mut out = Vec::with_capacity(luma_len * 3);
    out.extend_from_slice(&src[..luma_len]);
    for plane in [&src[luma_len..luma_len + quarter], &src[luma_len + quarter..]] {
        for y in 0..h {
            let row = &plane[(y / 2) * (w / 2)..];
            out.extend((0..w).map(|x| row[x / 2]));
        }
    }
    out
}

fn yuv444_to_yuv420(src: &[u8], w: usize, h: usize) -> Vec<u8> {
    let luma_len = w * h;
    let mut out = Vec::with_capacity(luma_len * 3 / 2);
    out.extend_from_slice(&src[..luma_len]);
    for plane in [&src[luma_len..luma_len * 2], &src[luma_len * 2..]] {
        for cy in 0..h / 2 {
            for cx in 0..w / 2 {
                let top = cy * 2 * w + cx * 2;
                let sum = plane[top] as u16
                    + plane[top + 1] as u16
                    + plane[top + w] as u16
                    + plane[top + w + 1] as u16;
                out.push(((sum + 2) / 4) as u8);
            }
        }
    }
    out
}

// Same plane layout with every sample widened to 16 bits.
fn widen_to_16bit(src: &[u8], _w: usize, _h: usize) -> Vec<u8> {
    src.iter()
        .flat_map(|&s| ((s as u16) << 8).to_le_bytes())
        .collect()
}
