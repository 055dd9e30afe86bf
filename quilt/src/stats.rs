// Copyright 2026 the Quilt Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-frame timing statistics.

use std::time::Duration;

/// Timings collected over one frame.
///
/// Queue and compute samples are recorded by every scheduled ingress task;
/// the phase durations are filled in by `wait_until_finished` and the
/// final gather. A snapshot is available through
/// [`DistributedFrameBuffer::stats`](crate::DistributedFrameBuffer::stats).
#[derive(Debug, Clone, Default)]
pub struct FrameStats {
    /// Time each scheduled message spent waiting for a worker thread.
    pub queue_times: Vec<Duration>,
    /// Time each scheduled message spent being processed.
    pub work_times: Vec<Duration>,
    /// Time spent blocked on the frame-done condition.
    pub wait_frame: Duration,
    /// Time spent compressing the local gather stream.
    pub compress: Duration,
    /// Time spent in the gather collectives.
    pub gather: Duration,
    /// Coordinator time spent decompressing the per-rank streams.
    pub decompress: Duration,
    /// Coordinator time spent painting tiles into the host image.
    pub paint: Duration,
    /// Compressed gather stream size as a percentage of the raw stream.
    pub compressed_percent: f64,
}

impl FrameStats {
    /// Drop the previous frame's samples.
    pub(crate) fn clear_frame(&mut self) {
        self.queue_times.clear();
        self.work_times.clear();
        self.wait_frame = Duration::ZERO;
        self.compress = Duration::ZERO;
        self.gather = Duration::ZERO;
        self.decompress = Duration::ZERO;
        self.paint = Duration::ZERO;
        self.compressed_percent = 0.0;
    }

    pub(crate) fn record_task(&mut self, queued: Duration, worked: Duration) {
        self.queue_times.push(queued);
        self.work_times.push(worked);
    }

    /// Mean of a sample set, for log lines.
    pub fn mean(samples: &[Duration]) -> Duration {
        if samples.is_empty() {
            return Duration::ZERO;
        }
        samples.iter().sum::<Duration>() / samples.len() as u32
    }
}
