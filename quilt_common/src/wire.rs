// Copyright 2026 the Quilt Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The tile message codec.
//!
//! Every message starts with a 16-byte header whose first word is a command
//! bitmask. Section sizes are a pure function of `(format, depth, aux)`, so
//! sender and receiver agree on the layout without negotiation. The command
//! word and all payload values are little-endian; the cluster is assumed
//! architecture-homogeneous.

use bytemuck::{Pod, Zeroable};
use thiserror::Error;

use crate::fragment::Fragment;
use crate::pixel::PixelFormat;
use crate::tile::TILE_PIXELS;

/// Peer-to-peer raw tile contribution, addressed to the tile's owner.
pub const WORKER_WRITE_TILE: u32 = 1 << 0;
/// Owner-to-coordinator finished tile, 8-bit RGBA color section.
pub const MASTER_WRITE_TILE_I8: u32 = 1 << 1;
/// Owner-to-coordinator finished tile, float RGBA color section.
pub const MASTER_WRITE_TILE_F32: u32 = 1 << 2;
/// The message carries a depth plane after the color section.
pub const MASTER_TILE_HAS_DEPTH: u32 = 1 << 3;
/// The message carries normal and albedo planes after the depth section.
pub const MASTER_TILE_HAS_AUX: u32 = 1 << 4;
/// The coordinator requests cooperative early termination.
pub const CANCEL_RENDERING: u32 = 1 << 5;

/// The fixed message header.
///
/// `error` is the tile's error estimate; `+inf` is the in-band "no update"
/// sentinel. Worker-write messages leave it zero.
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct TileHeader {
    /// Command bitmask.
    pub command: u32,
    /// Absolute pixel x coordinate of the tile origin.
    pub x: i32,
    /// Absolute pixel y coordinate of the tile origin.
    pub y: i32,
    /// Per-tile error estimate.
    pub error: f32,
}

/// Size of the fixed header in bytes.
pub const HEADER_SIZE: usize = core::mem::size_of::<TileHeader>();

/// Wire size of a `WORKER_WRITE_TILE` message.
pub const WORKER_TILE_SIZE: usize = HEADER_SIZE + core::mem::size_of::<Fragment>();

/// An immutable wire message. Shared between the messaging layer and
/// scheduled processing via `Arc`; the buffer is released when the last
/// holder drops it.
#[derive(Debug, Clone)]
pub struct Message {
    data: Box<[u8]>,
}

impl Message {
    /// Wrap received bytes. Panics if the buffer cannot hold a command word.
    pub fn from_vec(data: Vec<u8>) -> Self {
        assert!(
            data.len() >= HEADER_SIZE,
            "tile message shorter than its header ({} bytes)",
            data.len()
        );
        Self {
            data: data.into_boxed_slice(),
        }
    }

    /// The raw bytes of the message.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// The command bitmask.
    pub fn command(&self) -> u32 {
        u32::from_le_bytes(self.data[0..4].try_into().unwrap())
    }

    /// The decoded header.
    pub fn header(&self) -> TileHeader {
        bytemuck::pod_read_unaligned(&self.data[0..HEADER_SIZE])
    }

    /// Total size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the message is empty. Never true for a parsed message.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Decoding failures. All of these are protocol violations with no defined
/// recovery; callers surface them fatally.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("tile message truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("unknown tile message command {0:#x}")]
    UnknownCommand(u32),
}

/// Wire size of an owner-to-coordinator finished-tile message.
///
/// Panics for [`PixelFormat::None`]: that configuration reports errors
/// through the gather path and never ships per-tile messages.
pub fn master_tile_size(format: PixelFormat, has_depth: bool, has_aux: bool) -> usize {
    assert!(
        format != PixelFormat::None,
        "per-tile messages are not used for a format-less frame buffer"
    );
    let mut size = HEADER_SIZE + TILE_PIXELS * format.pixel_size();
    if has_depth {
        size += TILE_PIXELS * 4;
    }
    if has_aux {
        // Three normal planes and three albedo planes.
        size += 2 * 3 * TILE_PIXELS * 4;
    }
    size
}

fn command_for(format: PixelFormat, has_depth: bool, has_aux: bool) -> u32 {
    let mut command = if format.is_eight_bit() {
        MASTER_WRITE_TILE_I8
    } else {
        MASTER_WRITE_TILE_F32
    };
    if has_depth {
        command |= MASTER_TILE_HAS_DEPTH;
    }
    if has_aux {
        command |= MASTER_TILE_HAS_AUX;
    }
    command
}

/// Builds an owner-to-coordinator finished-tile message in one contiguous
/// allocation, writing each section at its fixed offset.
pub struct MasterTileBuilder {
    buf: Vec<u8>,
    pixel_size: usize,
    has_depth: bool,
    has_aux: bool,
}

impl MasterTileBuilder {
    /// Allocate the message and write its header.
    pub fn new(
        format: PixelFormat,
        has_depth: bool,
        has_aux: bool,
        origin: (i32, i32),
        error: f32,
    ) -> Self {
        let header = TileHeader {
            command: command_for(format, has_depth, has_aux),
            x: origin.0,
            y: origin.1,
            error,
        };
        let mut buf = vec![0u8; master_tile_size(format, has_depth, has_aux)];
        buf[0..HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));
        Self {
            buf,
            pixel_size: format.pixel_size(),
            has_depth,
            has_aux,
        }
    }

    fn depth_offset(&self) -> usize {
        HEADER_SIZE + TILE_PIXELS * self.pixel_size
    }

    fn normal_offset(&self) -> usize {
        self.depth_offset() + if self.has_depth { TILE_PIXELS * 4 } else { 0 }
    }

    /// Write the format-converted color section.
    pub fn set_color(&mut self, color: &[u8]) {
        assert_eq!(color.len(), TILE_PIXELS * self.pixel_size);
        self.buf[HEADER_SIZE..HEADER_SIZE + color.len()].copy_from_slice(color);
    }

    /// Write the depth plane. No-op when the message has no depth section.
    pub fn set_depth(&mut self, depth: &[f32]) {
        if !self.has_depth {
            return;
        }
        assert_eq!(depth.len(), TILE_PIXELS);
        let offset = self.depth_offset();
        self.buf[offset..offset + TILE_PIXELS * 4].copy_from_slice(bytemuck::cast_slice(depth));
    }

    /// Write the three normal planes. No-op when the message has no aux
    /// sections.
    pub fn set_normal(&mut self, planes: [&[f32]; 3]) {
        if !self.has_aux {
            return;
        }
        let mut offset = self.normal_offset();
        for plane in planes {
            assert_eq!(plane.len(), TILE_PIXELS);
            self.buf[offset..offset + TILE_PIXELS * 4].copy_from_slice(bytemuck::cast_slice(plane));
            offset += TILE_PIXELS * 4;
        }
    }

    /// Write the three albedo planes. No-op when the message has no aux
    /// sections.
    pub fn set_albedo(&mut self, planes: [&[f32]; 3]) {
        if !self.has_aux {
            return;
        }
        let mut offset = self.normal_offset() + 3 * TILE_PIXELS * 4;
        for plane in planes {
            assert_eq!(plane.len(), TILE_PIXELS);
            self.buf[offset..offset + TILE_PIXELS * 4].copy_from_slice(bytemuck::cast_slice(plane));
            offset += TILE_PIXELS * 4;
        }
    }

    /// Finish building and hand over the message.
    pub fn finish(self) -> Message {
        Message {
            data: self.buf.into_boxed_slice(),
        }
    }
}

/// A decoded view over an owner-to-coordinator finished-tile message.
#[derive(Debug)]
pub struct MasterTileView<'a> {
    /// The decoded header.
    pub header: TileHeader,
    /// Bytes per pixel of the color section, from the command word.
    pub pixel_size: usize,
    color: &'a [u8],
    depth: Option<&'a [u8]>,
    normal: Option<&'a [u8]>,
    albedo: Option<&'a [u8]>,
}

impl<'a> MasterTileView<'a> {
    /// Parse a finished-tile message from `bytes`.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, WireError> {
        if bytes.len() < HEADER_SIZE {
            return Err(WireError::Truncated {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        let header: TileHeader = bytemuck::pod_read_unaligned(&bytes[0..HEADER_SIZE]);
        let command = header.command;
        let pixel_size = if command & MASTER_WRITE_TILE_I8 != 0 {
            4
        } else if command & MASTER_WRITE_TILE_F32 != 0 {
            16
        } else {
            return Err(WireError::UnknownCommand(command));
        };
        let has_depth = command & MASTER_TILE_HAS_DEPTH != 0;
        let has_aux = command & MASTER_TILE_HAS_AUX != 0;

        let plane = TILE_PIXELS * 4;
        let mut expected = HEADER_SIZE + TILE_PIXELS * pixel_size;
        if has_depth {
            expected += plane;
        }
        if has_aux {
            expected += 6 * plane;
        }
        if bytes.len() < expected {
            return Err(WireError::Truncated {
                expected,
                actual: bytes.len(),
            });
        }

        let mut offset = HEADER_SIZE;
        let color = &bytes[offset..offset + TILE_PIXELS * pixel_size];
        offset += TILE_PIXELS * pixel_size;
        let depth = has_depth.then(|| {
            let section = &bytes[offset..offset + plane];
            offset += plane;
            section
        });
        let normal = has_aux.then(|| {
            let section = &bytes[offset..offset + 3 * plane];
            offset += 3 * plane;
            section
        });
        let albedo = has_aux.then(|| &bytes[offset..offset + 3 * plane]);

        Ok(Self {
            header,
            pixel_size,
            color,
            depth,
            normal,
            albedo,
        })
    }

    /// The raw color section.
    pub fn color_bytes(&self) -> &'a [u8] {
        self.color
    }

    /// The depth plane, copied out of the unaligned wire buffer.
    pub fn depth_plane(&self) -> Option<Vec<f32>> {
        self.depth.map(bytemuck::pod_collect_to_vec)
    }

    /// The three normal planes, concatenated.
    pub fn normal_planes(&self) -> Option<Vec<f32>> {
        self.normal.map(bytemuck::pod_collect_to_vec)
    }

    /// The three albedo planes, concatenated.
    pub fn albedo_planes(&self) -> Option<Vec<f32>> {
        self.albedo.map(bytemuck::pod_collect_to_vec)
    }
}

/// Encode a raw fragment as a `WORKER_WRITE_TILE` message.
pub fn encode_worker_tile(fragment: &Fragment) -> Message {
    let header = TileHeader {
        command: WORKER_WRITE_TILE,
        x: fragment.origin_x,
        y: fragment.origin_y,
        error: 0.0,
    };
    let mut buf = Vec::with_capacity(WORKER_TILE_SIZE);
    buf.extend_from_slice(bytemuck::bytes_of(&header));
    buf.extend_from_slice(bytemuck::bytes_of(fragment));
    Message {
        data: buf.into_boxed_slice(),
    }
}

/// Decode the fragment payload of a `WORKER_WRITE_TILE` message.
///
/// The fragment is written straight into its heap allocation; the plane
/// payload never exists as a stack value.
pub fn decode_worker_tile(bytes: &[u8]) -> Result<Box<Fragment>, WireError> {
    if bytes.len() < WORKER_TILE_SIZE {
        return Err(WireError::Truncated {
            expected: WORKER_TILE_SIZE,
            actual: bytes.len(),
        });
    }
    let mut fragment: Box<Fragment> = bytemuck::zeroed_box();
    bytemuck::bytes_of_mut(fragment.as_mut())
        .copy_from_slice(&bytes[HEADER_SIZE..WORKER_TILE_SIZE]);
    Ok(fragment)
}

/// Build a `CANCEL_RENDERING` message.
pub fn cancel_message() -> Message {
    let header = TileHeader {
        command: CANCEL_RENDERING,
        x: 0,
        y: 0,
        error: 0.0,
    };
    Message {
        data: bytemuck::bytes_of(&header).to_vec().into_boxed_slice(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::TILE_SIZE;

    fn ramp(seed: f32) -> Vec<f32> {
        (0..TILE_PIXELS).map(|i| seed + i as f32 * 0.001).collect()
    }

    #[test]
    fn sizes_are_deterministic() {
        let base = HEADER_SIZE + TILE_PIXELS * 4;
        assert_eq!(master_tile_size(PixelFormat::Rgba8, false, false), base);
        assert_eq!(
            master_tile_size(PixelFormat::Srgba8, true, false),
            base + TILE_PIXELS * 4
        );
        assert_eq!(
            master_tile_size(PixelFormat::RgbaF32, true, true),
            HEADER_SIZE + TILE_PIXELS * 16 + 7 * TILE_PIXELS * 4
        );
    }

    #[test]
    fn master_tile_round_trip_rgba8_depth_aux() {
        let color: Vec<u8> = (0..TILE_PIXELS * 4).map(|i| (i % 251) as u8).collect();
        let depth = ramp(1.0);
        let normal = [ramp(2.0), ramp(3.0), ramp(4.0)];
        let albedo = [ramp(5.0), ramp(6.0), ramp(7.0)];

        let mut builder =
            MasterTileBuilder::new(PixelFormat::Rgba8, true, true, (64, 128), 0.25);
        builder.set_color(&color);
        builder.set_depth(&depth);
        builder.set_normal([&normal[0], &normal[1], &normal[2]]);
        builder.set_albedo([&albedo[0], &albedo[1], &albedo[2]]);
        let message = builder.finish();
        assert_eq!(message.len(), master_tile_size(PixelFormat::Rgba8, true, true));

        let view = MasterTileView::parse(message.as_bytes()).unwrap();
        assert_eq!(view.header.command & MASTER_WRITE_TILE_I8, MASTER_WRITE_TILE_I8);
        assert_eq!((view.header.x, view.header.y), (64, 128));
        assert_eq!(view.header.error, 0.25);
        assert_eq!(view.pixel_size, 4);
        assert_eq!(view.color_bytes(), &color[..]);
        assert_eq!(view.depth_plane().unwrap(), depth);
        let wire_normal = view.normal_planes().unwrap();
        assert_eq!(&wire_normal[0..TILE_PIXELS], &normal[0][..]);
        assert_eq!(&wire_normal[2 * TILE_PIXELS..], &normal[2][..]);
        let wire_albedo = view.albedo_planes().unwrap();
        assert_eq!(&wire_albedo[TILE_PIXELS..2 * TILE_PIXELS], &albedo[1][..]);
    }

    #[test]
    fn master_tile_round_trip_float_no_extras() {
        let color: Vec<u8> = vec![7u8; TILE_PIXELS * 16];
        let mut builder =
            MasterTileBuilder::new(PixelFormat::RgbaF32, false, false, (0, 0), f32::INFINITY);
        builder.set_color(&color);
        // Section setters without a matching flag must be ignored.
        builder.set_depth(&vec![9.0; TILE_PIXELS]);
        let message = builder.finish();

        let view = MasterTileView::parse(message.as_bytes()).unwrap();
        assert_eq!(view.pixel_size, 16);
        assert!(view.header.error.is_infinite());
        assert!(view.depth_plane().is_none());
        assert!(view.normal_planes().is_none());
        assert_eq!(view.color_bytes(), &color[..]);
    }

    #[test]
    fn worker_tile_round_trip() {
        let mut fragment = Fragment::solid(TILE_SIZE as i32, 0, [0.1, 0.2, 0.3, 1.0], 5.0);
        fragment.accum_id = 3;
        fragment.z[17] = 0.5;

        let message = encode_worker_tile(&fragment);
        assert_eq!(message.command(), WORKER_WRITE_TILE);
        assert_eq!(message.len(), WORKER_TILE_SIZE);
        let header = message.header();
        assert_eq!((header.x, header.y), (TILE_SIZE as i32, 0));

        let decoded = decode_worker_tile(message.as_bytes()).unwrap();
        assert_eq!(decoded.accum_id, 3);
        assert_eq!(decoded.r[0], 0.1);
        assert_eq!(decoded.z[17], 0.5);
        assert_eq!(decoded.z[18], 5.0);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(
            MasterTileView::parse(&[0u8; 8]).unwrap_err(),
            WireError::Truncated {
                expected: HEADER_SIZE,
                actual: 8
            }
        );
        let zeroed = [0u8; HEADER_SIZE];
        assert_eq!(
            MasterTileView::parse(&zeroed).unwrap_err(),
            WireError::UnknownCommand(0)
        );
    }

    #[test]
    fn cancel_message_is_header_only() {
        let message = cancel_message();
        assert_eq!(message.command(), CANCEL_RENDERING);
        assert_eq!(message.len(), HEADER_SIZE);
    }
}
