// Copyright 2026 the Quilt Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Shared leaf types for the quilt distributed frame buffer.
//!
//! This crate carries everything both ends of the wire have to agree on
//! without negotiation: the tile geometry of the image, the pixel formats
//! and channel set of the frame buffer, the raw fragment produced by a
//! rendering pass, the tile message codec, and the coordinator-side host
//! image that the final gather paints into.
//!
//! The frame-buffer runtime itself lives in the `quilt` crate.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![forbid(unsafe_code)]

pub mod fragment;
pub mod image;
pub mod pixel;
pub mod tile;
pub mod wire;

pub use fragment::Fragment;
pub use image::{HostImage, HostImageBand, MapChannel, MapError, TilePaint};
pub use pixel::{Channels, PixelFormat};
pub use tile::{TileDesc, TileGrid, TILE_PIXELS, TILE_SIZE};
pub use wire::Message;
