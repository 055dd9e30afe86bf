// Copyright 2026 the Quilt Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Pixel formats, channel masks and the plane-to-pixel conversion kernels.

use crate::tile::TILE_PIXELS;

/// The typed output format of the frame buffer's color channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    /// No color output; the frame buffer only tracks per-tile errors.
    #[default]
    None,
    /// 8-bit RGBA, linear encoding.
    Rgba8,
    /// 8-bit RGBA, sRGB-encoded color channels.
    Srgba8,
    /// 32-bit float RGBA.
    RgbaF32,
}

impl PixelFormat {
    /// Bytes per pixel in this format. Zero for [`PixelFormat::None`].
    pub fn pixel_size(self) -> usize {
        match self {
            Self::None => 0,
            Self::Rgba8 | Self::Srgba8 => 4,
            Self::RgbaF32 => 16,
        }
    }

    /// Whether this is one of the 8-bit formats.
    pub fn is_eight_bit(self) -> bool {
        matches!(self, Self::Rgba8 | Self::Srgba8)
    }
}

/// A bitmask selecting frame buffer channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Channels(u32);

impl Channels {
    /// No channels.
    pub const NONE: Self = Self(0);
    /// The final color planes.
    pub const COLOR: Self = Self(1 << 0);
    /// The final depth plane.
    pub const DEPTH: Self = Self(1 << 1);
    /// The accumulation planes used for progressive refinement.
    pub const ACCUM: Self = Self(1 << 2);
    /// The variance planes behind the per-tile error estimate.
    pub const VARIANCE: Self = Self(1 << 3);
    /// The auxiliary normal planes.
    pub const NORMAL: Self = Self(1 << 4);
    /// The auxiliary albedo planes.
    pub const ALBEDO: Self = Self(1 << 5);

    /// Whether every channel of `other` is contained in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// The union of two channel sets.
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// The channels of `self` not present in `other`.
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl core::ops::BitOr for Channels {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

fn to_u8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0 + 0.5) as u8
}

fn linear_to_srgb(v: f32) -> f32 {
    let v = v.clamp(0.0, 1.0);
    if v <= 0.003_130_8 {
        v * 12.92
    } else {
        1.055 * v.powf(1.0 / 2.4) - 0.055
    }
}

/// Convert a tile's final color planes into the typed output buffer.
///
/// `out` must be exactly `TILE_PIXELS * format.pixel_size()` bytes.
/// Panics for [`PixelFormat::None`]: there is no color output to convert to.
pub fn encode_tile(
    format: PixelFormat,
    r: &[f32],
    g: &[f32],
    b: &[f32],
    a: &[f32],
    out: &mut [u8],
) {
    assert_eq!(r.len(), TILE_PIXELS);
    assert_eq!(out.len(), TILE_PIXELS * format.pixel_size());
    match format {
        PixelFormat::None => panic!("cannot encode a tile for a format-less frame buffer"),
        PixelFormat::Rgba8 => {
            for (i, px) in out.chunks_exact_mut(4).enumerate() {
                px[0] = to_u8(r[i]);
                px[1] = to_u8(g[i]);
                px[2] = to_u8(b[i]);
                px[3] = to_u8(a[i]);
            }
        }
        PixelFormat::Srgba8 => {
            for (i, px) in out.chunks_exact_mut(4).enumerate() {
                px[0] = to_u8(linear_to_srgb(r[i]));
                px[1] = to_u8(linear_to_srgb(g[i]));
                px[2] = to_u8(linear_to_srgb(b[i]));
                // Alpha stays linear.
                px[3] = to_u8(a[i]);
            }
        }
        PixelFormat::RgbaF32 => {
            for (i, px) in out.chunks_exact_mut(16).enumerate() {
                px[0..4].copy_from_slice(&r[i].to_le_bytes());
                px[4..8].copy_from_slice(&g[i].to_le_bytes());
                px[8..12].copy_from_slice(&b[i].to_le_bytes());
                px[12..16].copy_from_slice(&a[i].to_le_bytes());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_mask_operations() {
        let set = Channels::COLOR | Channels::DEPTH | Channels::ACCUM;
        assert!(set.contains(Channels::COLOR));
        assert!(set.contains(Channels::COLOR | Channels::DEPTH));
        assert!(!set.contains(Channels::VARIANCE));
        assert_eq!(set.difference(Channels::DEPTH), Channels::COLOR | Channels::ACCUM);
    }

    #[test]
    fn rgba8_rounds_and_clamps() {
        let r = vec![2.0; TILE_PIXELS];
        let g = vec![0.5; TILE_PIXELS];
        let b = vec![-1.0; TILE_PIXELS];
        let a = vec![1.0; TILE_PIXELS];
        let mut out = vec![0u8; TILE_PIXELS * 4];
        encode_tile(PixelFormat::Rgba8, &r, &g, &b, &a, &mut out);
        assert_eq!(&out[0..4], &[255, 128, 0, 255]);
    }

    #[test]
    fn srgb_brightens_midtones() {
        let r = vec![0.5; TILE_PIXELS];
        let zero = vec![0.0; TILE_PIXELS];
        let a = vec![0.5; TILE_PIXELS];
        let mut out = vec![0u8; TILE_PIXELS * 4];
        encode_tile(PixelFormat::Srgba8, &r, &zero, &zero, &a, &mut out);
        // linear 0.5 encodes to ~188 in sRGB; alpha is untouched by the curve.
        assert_eq!(out[0], 188);
        assert_eq!(out[3], 128);
    }

    #[test]
    fn float_output_interleaves_planes() {
        let r = vec![0.25; TILE_PIXELS];
        let g = vec![0.5; TILE_PIXELS];
        let b = vec![0.75; TILE_PIXELS];
        let a = vec![1.0; TILE_PIXELS];
        let mut out = vec![0u8; TILE_PIXELS * 16];
        encode_tile(PixelFormat::RgbaF32, &r, &g, &b, &a, &mut out);
        let px: Vec<f32> = bytemuck::pod_collect_to_vec(&out[0..16]);
        assert_eq!(px, vec![0.25, 0.5, 0.75, 1.0]);
    }
}
