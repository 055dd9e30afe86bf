// Copyright 2026 the Quilt Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-tile error estimates for adaptive sampling.
//!
//! The coordinator maintains one error scalar per tile and broadcasts the
//! region at frame start so every rank agrees which tiles still need
//! samples. Values are stored as f32 bits in atomics: the gather paths
//! update tiles from parallel tasks, and distinct tiles never alias.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::comm::{Fabric, COORDINATOR_RANK};

/// A dense per-tile error region. Empty when variance tracking is off;
/// every lookup then reports "unknown".
#[derive(Debug)]
pub struct ErrorRegion {
    errors: Vec<AtomicU32>,
}

impl ErrorRegion {
    /// Create a region of `num_tiles` entries, all "unknown" (`+inf`).
    pub fn new(num_tiles: u32) -> Self {
        let errors = (0..num_tiles)
            .map(|_| AtomicU32::new(f32::INFINITY.to_bits()))
            .collect();
        Self { errors }
    }

    /// Whether the region tracks any tiles.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// The current error estimate for a tile; `+inf` when unknown or when
    /// the region is empty.
    pub fn get(&self, tile: u32) -> f32 {
        match self.errors.get(tile as usize) {
            Some(bits) => f32::from_bits(bits.load(Ordering::Relaxed)),
            None => f32::INFINITY,
        }
    }

    /// Record a new estimate for a tile. No-op on an empty region.
    pub fn update(&self, tile: u32, error: f32) {
        if let Some(bits) = self.errors.get(tile as usize) {
            bits.store(error.to_bits(), Ordering::Relaxed);
        }
    }

    /// Reset every tile to "unknown" so the next frame renders everything.
    pub fn clear(&self) {
        for bits in &self.errors {
            bits.store(f32::INFINITY.to_bits(), Ordering::Relaxed);
        }
    }

    /// Summarize the region against a refinement threshold: the mean error
    /// of the tiles still above it, or the maximum tile error once every
    /// tile is at or below it. `+inf` for an empty region.
    pub fn refine(&self, threshold: f32) -> f32 {
        if self.errors.is_empty() {
            return f32::INFINITY;
        }
        let mut max_error = 0.0f32;
        let mut active_sum = 0.0f32;
        let mut active_tiles = 0u32;
        for bits in &self.errors {
            let error = f32::from_bits(bits.load(Ordering::Relaxed));
            max_error = max_error.max(error);
            if error > threshold {
                active_sum += error;
                active_tiles += 1;
            }
        }
        if active_tiles > 0 {
            active_sum / active_tiles as f32
        } else {
            max_error
        }
    }

    /// Broadcast the region from the coordinator so all ranks agree on the
    /// per-tile errors at frame start.
    pub fn sync(&self, fabric: &dyn Fabric) {
        if self.errors.is_empty() {
            return;
        }
        let mut buf = vec![0u8; self.errors.len() * 4];
        for (chunk, bits) in buf.chunks_exact_mut(4).zip(&self.errors) {
            chunk.copy_from_slice(&f32::from_bits(bits.load(Ordering::Relaxed)).to_le_bytes());
        }
        fabric.broadcast(COORDINATOR_RANK, &mut buf);
        if !fabric.is_coordinator() {
            for (chunk, bits) in buf.chunks_exact(4).zip(&self.errors) {
                let error = f32::from_le_bytes(chunk.try_into().unwrap());
                bits.store(error.to_bits(), Ordering::Relaxed);
            }
        }
    }
}
