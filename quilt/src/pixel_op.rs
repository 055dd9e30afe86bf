// Copyright 2026 the Quilt Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! User hooks into the tile pipeline.

use quilt_common::Fragment;

/// An optional per-tile operator installed by the application.
///
/// Implementations are shared across the rendering thread and the
/// compositing tasks, so the hooks take `&self`; interior state needs its
/// own synchronization.
pub trait PixelOp: Send + Sync {
    /// Called once per rank when a frame starts.
    fn begin_frame(&self) {}

    /// Called for every routed fragment before it is composited into its
    /// owning tile.
    fn pre_accum(&self, _fragment: &mut Fragment) {}

    /// Called with a completed tile's final color planes before they are
    /// converted to the output format.
    fn post_accum(&self, _r: &mut [f32], _g: &mut [f32], _b: &mut [f32], _a: &mut [f32]) {}

    /// Called once per rank when the frame ends. Skipped on a coordinator
    /// that owns no tiles.
    fn end_frame(&self) {}
}
