// Copyright 2026 the Quilt Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The coordinator-side host image.
//!
//! Present only on the coordinator and only when the frame buffer has a
//! color format. Holds the assembled pixel arrays addressable by absolute
//! pixel coordinate, plus optional depth, normal and albedo arrays. The
//! accumulation and variance planes never live here; they stay on the
//! workers that own the tiles.

use thiserror::Error;

use crate::pixel::{Channels, PixelFormat};
use crate::tile::{TILE_PIXELS, TILE_SIZE};

/// A channel that can be mapped for host-side reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapChannel {
    Color,
    Depth,
    Normal,
    Albedo,
}

/// Failure to map a frame buffer channel.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MapError {
    #[error("frame buffer has no host-side image on this rank")]
    NoHostImage,
    #[error("channel {0:?} is not allocated on this frame buffer")]
    ChannelAbsent(MapChannel),
}

/// One finished tile's sections, ready to be painted.
///
/// `normal` and `albedo` are three concatenated planes each, as on the
/// wire. Planes are `TILE_PIXELS` long, row-major within the tile.
#[derive(Debug)]
pub struct TilePaint<'a> {
    /// Absolute pixel origin of the tile.
    pub origin: (i32, i32),
    /// Format-sized color section.
    pub color: &'a [u8],
    pub depth: Option<&'a [f32]>,
    pub normal: Option<&'a [f32]>,
    pub albedo: Option<&'a [f32]>,
}

/// The assembled final image.
#[derive(Debug)]
pub struct HostImage {
    width: u32,
    height: u32,
    format: PixelFormat,
    color: Vec<u8>,
    depth: Option<Vec<f32>>,
    normal: Option<Vec<[f32; 3]>>,
    albedo: Option<Vec<[f32; 3]>>,
}

impl HostImage {
    /// Allocate the image arrays for the requested channels.
    ///
    /// Panics for [`PixelFormat::None`]; a format-less frame buffer has no
    /// host image.
    pub fn new(width: u32, height: u32, format: PixelFormat, channels: Channels) -> Self {
        assert!(
            format != PixelFormat::None,
            "a format-less frame buffer has no host image"
        );
        let pixels = width as usize * height as usize;
        Self {
            width,
            height,
            format,
            color: vec![0u8; pixels * format.pixel_size()],
            depth: channels
                .contains(Channels::DEPTH)
                .then(|| vec![f32::INFINITY; pixels]),
            normal: channels
                .contains(Channels::NORMAL)
                .then(|| vec![[0.0; 3]; pixels]),
            albedo: channels
                .contains(Channels::ALBEDO)
                .then(|| vec![[0.0; 3]; pixels]),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// The raw bytes of a channel, for host-side mapping.
    pub fn channel_bytes(&self, channel: MapChannel) -> Result<&[u8], MapError> {
        match channel {
            MapChannel::Color => Ok(&self.color),
            MapChannel::Depth => self
                .depth
                .as_deref()
                .map(bytemuck::cast_slice)
                .ok_or(MapError::ChannelAbsent(channel)),
            MapChannel::Normal => self
                .normal
                .as_deref()
                .map(bytemuck::cast_slice)
                .ok_or(MapError::ChannelAbsent(channel)),
            MapChannel::Albedo => self
                .albedo
                .as_deref()
                .map(bytemuck::cast_slice)
                .ok_or(MapError::ChannelAbsent(channel)),
        }
    }

    /// The color bytes of the pixel at `(x, y)`.
    pub fn pixel_bytes(&self, x: u32, y: u32) -> &[u8] {
        assert!(x < self.width && y < self.height);
        let psize = self.format.pixel_size();
        let index = (y as usize * self.width as usize + x as usize) * psize;
        &self.color[index..index + psize]
    }

    /// The depth value of the pixel at `(x, y)`, if depth is allocated.
    pub fn pixel_depth(&self, x: u32, y: u32) -> Option<f32> {
        assert!(x < self.width && y < self.height);
        self.depth
            .as_ref()
            .map(|d| d[y as usize * self.width as usize + x as usize])
    }

    /// Split the image into one band per tile row.
    ///
    /// Bands cover disjoint pixel rows, so they can be painted from
    /// different threads; tiles within one band touch disjoint columns.
    pub fn tile_row_bands(&mut self) -> Vec<HostImageBand<'_>> {
        let width = self.width as usize;
        let height = self.height as usize;
        let psize = self.format.pixel_size();
        let band_count = height.div_ceil(TILE_SIZE as usize);

        let mut bands = Vec::with_capacity(band_count);
        let mut color: &mut [u8] = &mut self.color;
        let mut depth = self.depth.as_deref_mut();
        let mut normal = self.normal.as_deref_mut();
        let mut albedo = self.albedo.as_deref_mut();

        for band in 0..band_count {
            let y0 = band * TILE_SIZE as usize;
            let rows = (TILE_SIZE as usize).min(height - y0);
            let pixels = rows * width;

            let (head, tail) = color.split_at_mut(pixels * psize);
            color = tail;
            let band_depth = depth.take().map(|d| {
                let (head, tail) = d.split_at_mut(pixels);
                depth = Some(tail);
                head
            });
            let band_normal = normal.take().map(|n| {
                let (head, tail) = n.split_at_mut(pixels);
                normal = Some(tail);
                head
            });
            let band_albedo = albedo.take().map(|a| {
                let (head, tail) = a.split_at_mut(pixels);
                albedo = Some(tail);
                head
            });

            bands.push(HostImageBand {
                y0: y0 as i32,
                rows,
                width,
                image_width: self.width,
                pixel_size: psize,
                color: head,
                depth: band_depth,
                normal: band_normal,
                albedo: band_albedo,
            });
        }

        bands
    }
}

/// A horizontal strip of the host image, one tile row tall.
#[derive(Debug)]
pub struct HostImageBand<'a> {
    y0: i32,
    rows: usize,
    width: usize,
    image_width: u32,
    pixel_size: usize,
    color: &'a mut [u8],
    depth: Option<&'a mut [f32]>,
    normal: Option<&'a mut [[f32; 3]]>,
    albedo: Option<&'a mut [[f32; 3]]>,
}

impl HostImageBand<'_> {
    /// The index of the tile row this band covers.
    pub fn tile_row(&self) -> u32 {
        (self.y0 as u32) / TILE_SIZE
    }

    /// Paint one tile into the band, skipping lanes outside the image.
    ///
    /// Rows of the tile outside this band are ignored, so callers may hand
    /// a tile to its band without trimming.
    pub fn paint(&mut self, tile: &TilePaint<'_>) {
        let psize = self.pixel_size;
        assert_eq!(tile.color.len(), TILE_PIXELS * psize);

        for iy in 0..TILE_SIZE as i32 {
            let gy = tile.origin.1 + iy;
            if gy < self.y0 || gy >= self.y0 + self.rows as i32 {
                continue;
            }
            let row = (gy - self.y0) as usize;
            for ix in 0..TILE_SIZE as i32 {
                let gx = tile.origin.0 + ix;
                if gx < 0 || gx as u32 >= self.image_width {
                    continue;
                }
                let src = (iy * TILE_SIZE as i32 + ix) as usize;
                let dst = row * self.width + gx as usize;

                self.color[dst * psize..(dst + 1) * psize]
                    .copy_from_slice(&tile.color[src * psize..(src + 1) * psize]);
                if let (Some(depth), Some(src_depth)) = (self.depth.as_deref_mut(), tile.depth) {
                    depth[dst] = src_depth[src];
                }
                if let (Some(normal), Some(planes)) = (self.normal.as_deref_mut(), tile.normal) {
                    normal[dst] = [
                        planes[src],
                        planes[TILE_PIXELS + src],
                        planes[2 * TILE_PIXELS + src],
                    ];
                }
                if let (Some(albedo), Some(planes)) = (self.albedo.as_deref_mut(), tile.albedo) {
                    albedo[dst] = [
                        planes[src],
                        planes[TILE_PIXELS + src],
                        planes[2 * TILE_PIXELS + src],
                    ];
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_tile_color(psize: usize, byte: u8) -> Vec<u8> {
        vec![byte; TILE_PIXELS * psize]
    }

    #[test]
    fn paint_covers_full_tile() {
        let mut image = HostImage::new(
            2 * TILE_SIZE,
            TILE_SIZE,
            PixelFormat::Rgba8,
            Channels::COLOR,
        );
        let color = solid_tile_color(4, 0xAB);
        let mut bands = image.tile_row_bands();
        assert_eq!(bands.len(), 1);
        bands[0].paint(&TilePaint {
            origin: (TILE_SIZE as i32, 0),
            color: &color,
            depth: None,
            normal: None,
            albedo: None,
        });
        drop(bands);

        assert_eq!(image.pixel_bytes(TILE_SIZE - 1, 0), &[0, 0, 0, 0]);
        assert_eq!(image.pixel_bytes(TILE_SIZE, 0), &[0xAB; 4]);
        assert_eq!(
            image.pixel_bytes(2 * TILE_SIZE - 1, TILE_SIZE - 1),
            &[0xAB; 4]
        );
    }

    #[test]
    fn fringe_tile_lanes_are_clipped() {
        // 65x65 image: the bottom-right tile covers a single valid pixel.
        let mut image = HostImage::new(
            TILE_SIZE + 1,
            TILE_SIZE + 1,
            PixelFormat::Rgba8,
            Channels::COLOR | Channels::DEPTH,
        );
        let color = solid_tile_color(4, 0xFF);
        let depth = vec![1.5f32; TILE_PIXELS];
        let mut bands = image.tile_row_bands();
        assert_eq!(bands.len(), 2);
        let paint = TilePaint {
            origin: (TILE_SIZE as i32, TILE_SIZE as i32),
            color: &color,
            depth: Some(&depth),
            normal: None,
            albedo: None,
        };
        for band in &mut bands {
            band.paint(&paint);
        }
        drop(bands);

        assert_eq!(image.pixel_bytes(TILE_SIZE, TILE_SIZE), &[0xFF; 4]);
        assert_eq!(image.pixel_depth(TILE_SIZE, TILE_SIZE), Some(1.5));
        // Neighbours owned by other tiles stay untouched.
        assert_eq!(image.pixel_bytes(TILE_SIZE - 1, TILE_SIZE), &[0; 4]);
        assert_eq!(image.pixel_depth(0, 0), Some(f32::INFINITY));
    }

    #[test]
    fn aux_planes_are_deinterleaved_per_pixel() {
        let mut image = HostImage::new(
            TILE_SIZE,
            TILE_SIZE,
            PixelFormat::RgbaF32,
            Channels::COLOR | Channels::NORMAL | Channels::ALBEDO,
        );
        let color = solid_tile_color(16, 1);
        let mut normal = vec![0.0f32; 3 * TILE_PIXELS];
        normal[0] = 0.1; // nx of pixel 0
        normal[TILE_PIXELS] = 0.2; // ny of pixel 0
        normal[2 * TILE_PIXELS] = 0.3; // nz of pixel 0
        let albedo = vec![0.5f32; 3 * TILE_PIXELS];

        let mut bands = image.tile_row_bands();
        bands[0].paint(&TilePaint {
            origin: (0, 0),
            color: &color,
            depth: None,
            normal: Some(&normal),
            albedo: Some(&albedo),
        });
        drop(bands);

        let normals: &[u8] = image.channel_bytes(MapChannel::Normal).unwrap();
        let first: Vec<f32> = bytemuck::pod_collect_to_vec(&normals[0..12]);
        assert_eq!(first, vec![0.1, 0.2, 0.3]);
        assert_eq!(
            image.channel_bytes(MapChannel::Depth),
            Err(MapError::ChannelAbsent(MapChannel::Depth))
        );
    }
}
