// Copyright 2026 the Quilt Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Quilt is a distributed frame buffer for parallel renderers running
//! across many processes connected by a message-passing fabric.
//!
//! The final image is partitioned into fixed-size square tiles; each tile
//! has exactly one owning rank. Workers submit raw tile fragments through
//! [`DistributedFrameBuffer::set_tile`]; fragments for remote tiles travel
//! as peer-to-peer messages to their owner, where one of three composition
//! policies reduces them. At the end of each frame every owner ships its
//! finished tiles to the coordinator, compressed on the wire, and the
//! coordinator assembles them into a [`HostImage`].
//!
//! A frame runs through `begin` → `start` → (`set_tile` | `incoming`)* →
//! close → gather → `end`. Messages that arrive before a rank has started
//! its frame are buffered and replayed, never dropped.
//!
//! The fabric (point-to-point sends plus broadcast/gather/barrier
//! collectives) is an external collaborator behind the [`comm::Fabric`]
//! trait; [`comm::local`] provides an in-process implementation used by the
//! tests. Task scheduling is delegated to a shared [`rayon::ThreadPool`].

#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![forbid(unsafe_code)]

pub mod comm;
mod error_region;
mod framebuffer;
mod pixel_op;
mod stats;
mod tile_state;

pub use error_region::ErrorRegion;
pub use framebuffer::{DistributedFrameBuffer, FrameBufferConfig, MappedBuffer};
pub use pixel_op::PixelOp;
pub use stats::FrameStats;
pub use tile_state::FrameMode;

pub use quilt_common::{
    wire, Channels, Fragment, HostImage, MapChannel, MapError, Message, PixelFormat, TileDesc,
    TileGrid, TILE_PIXELS, TILE_SIZE,
};
