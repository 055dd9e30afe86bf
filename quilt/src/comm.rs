// Copyright 2026 the Quilt Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The communication-fabric seam.
//!
//! The frame buffer needs point-to-point tile delivery plus four
//! collectives: broadcast, gather, gatherv and barrier. Real deployments
//! bind these to their messaging layer; [`local`] provides an in-process
//! implementation backed by channels, used by the tests.
//!
//! Collective calls follow the usual SPMD discipline: every rank issues the
//! same sequence of collectives, and all of them block until the operation
//! completes. Point-to-point delivery is exactly-once and in order per
//! sender; the frame buffer performs no retries of its own.

use std::sync::Arc;

use quilt_common::Message;

pub mod local;

/// The distinguished rank that assembles the final image.
pub const COORDINATOR_RANK: usize = 0;

/// A process's view of the message-passing fabric.
///
/// The frame buffer holds a shared handle and does not own the fabric's
/// lifecycle.
pub trait Fabric: Send + Sync {
    /// This process's global rank, in `[0, size)`.
    fn rank(&self) -> usize;

    /// Number of ranks in the fabric.
    fn size(&self) -> usize;

    /// Queue a tile message for asynchronous delivery to `rank`.
    fn send_to(&self, rank: usize, message: Arc<Message>);

    /// Broadcast `buf` from `root`; on every other rank `buf` is
    /// overwritten with the root's bytes. All ranks must pass equal-sized
    /// buffers.
    fn broadcast(&self, root: usize, buf: &mut [u8]);

    /// Gather one word per rank to `root`. Returns the per-rank values,
    /// indexed by source rank, on the root only.
    fn gather_u64(&self, root: usize, value: u64) -> Option<Vec<u64>>;

    /// Gather a variable-length byte buffer per rank to `root`. Returns
    /// the per-rank buffers, indexed by source rank, on the root only.
    fn gather_bytes(&self, root: usize, bytes: &[u8]) -> Option<Vec<Vec<u8>>>;

    /// Block until every rank has entered the barrier.
    fn barrier(&self);

    /// Whether this process is the coordinator.
    fn is_coordinator(&self) -> bool {
        self.rank() == COORDINATOR_RANK
    }

    /// Number of worker ranks when the coordinator is excluded from tile
    /// ownership. By convention the workers are ranks `1..size`.
    fn num_workers(&self) -> usize {
        self.size().saturating_sub(1)
    }

    /// The stable bijection from worker-space ranks `[0, num_workers)` to
    /// global ranks.
    fn worker_rank_to_global(&self, worker: usize) -> usize {
        debug_assert!(worker < self.num_workers());
        worker + 1
    }
}
