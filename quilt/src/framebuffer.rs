// Copyright 2026 the Quilt Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The distributed frame buffer.
//!
//! One instance lives on every rank. Tiles are created at construction and
//! whenever the composition mode changes; each tile's owner is a
//! deterministic function of its id and the rank count, fixed for the life
//! of the frame buffer.
//!
//! A frame runs `begin` → `start` → (`set_tile` | `incoming`)* → close →
//! gather → `end`. The transition into the active state is the delicate
//! part: inbound messages racing against `start` must neither be dropped
//! nor processed early. `incoming` reads the active flag without the frame
//! mutex on its fast path, so `start` sets the flag as its very last action
//! under the mutex and replays the delayed queue only after releasing it;
//! dispatching to the scheduler under the mutex could deadlock because the
//! scheduler may call back into `incoming`.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, Weak};
use std::time::Instant;

use log::{debug, trace};
use quilt_common::image::{HostImage, MapChannel, MapError};
use quilt_common::{wire, Channels, Fragment, Message, PixelFormat, TileGrid};
use rayon::prelude::*;

use crate::comm::{Fabric, COORDINATOR_RANK};
use crate::error_region::ErrorRegion;
use crate::pixel_op::PixelOp;
use crate::stats::FrameStats;
use crate::tile_state::{FrameMode, OwnedTile};

mod gather;

/// Construction parameters of a [`DistributedFrameBuffer`].
#[derive(Debug, Clone, Copy)]
pub struct FrameBufferConfig {
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Typed output format of the color channel.
    pub format: PixelFormat,
    /// Channels to allocate beyond color.
    pub channels: Channels,
    /// Whether the coordinator also owns tiles. When false, ownership is
    /// spread over the worker ranks only and finished tiles travel to the
    /// coordinator one message at a time instead of in the final gather.
    pub coordinator_is_worker: bool,
    /// Initial composition mode.
    pub frame_mode: FrameMode,
}

impl FrameBufferConfig {
    /// A color-only configuration with the coordinator owning tiles.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            channels: Channels::COLOR,
            coordinator_is_worker: true,
            frame_mode: FrameMode::default(),
        }
    }
}

struct TileSlot {
    desc: quilt_common::TileDesc,
    /// Composition state, present only on the owning rank. Fragments for
    /// one tile may be composited from concurrent pool tasks, hence the
    /// per-tile mutex.
    owned: Option<Mutex<OwnedTile>>,
}

/// State guarded by the frame mutex.
struct FrameShared {
    done: bool,
    delayed: Vec<Arc<Message>>,
}

struct TileReports {
    ids: Vec<u32>,
    errors: Vec<f32>,
}

/// The per-rank frame buffer instance. Constructed as an `Arc` because
/// scheduled message processing holds onto it across threads.
pub struct DistributedFrameBuffer {
    me: Weak<Self>,
    grid: TileGrid,
    format: PixelFormat,
    channels: Channels,
    coordinator_is_worker: bool,
    fabric: Arc<dyn Fabric>,
    pool: Arc<rayon::ThreadPool>,

    frame_mode: Mutex<FrameMode>,
    tiles: RwLock<Vec<TileSlot>>,
    /// Linear ids of the tiles this rank owns; stable across mode changes.
    owned: Vec<usize>,
    accum_ids: Vec<AtomicI32>,
    instances: Vec<AtomicI32>,
    error_region: ErrorRegion,
    host_image: Option<Mutex<HostImage>>,

    frame_active: AtomicBool,
    frame: Mutex<FrameShared>,
    frame_done: Condvar,
    completed: Mutex<usize>,
    next_tile_write: AtomicUsize,
    gather_buffer: Mutex<Vec<u8>>,
    tile_reports: Mutex<TileReports>,
    stats: Mutex<FrameStats>,
    cancelled: AtomicBool,
    frame_id: AtomicI32,
    pixel_op: Mutex<Option<Arc<dyn PixelOp>>>,
}

impl DistributedFrameBuffer {
    /// Create the frame buffer for this rank.
    ///
    /// The fabric and the thread pool are process-wide resources; the frame
    /// buffer shares them and does not own their lifecycle.
    pub fn new(
        config: FrameBufferConfig,
        fabric: Arc<dyn Fabric>,
        pool: Arc<rayon::ThreadPool>,
    ) -> Arc<Self> {
        let grid = TileGrid::new(config.width, config.height);
        let total = grid.total_tiles();
        let rank = fabric.rank();

        let owned = (0..total)
            .filter(|&id| {
                owner_for(fabric.as_ref(), config.coordinator_is_worker, id) as usize == rank
            })
            .map(|id| id as usize)
            .collect::<Vec<_>>();
        let tiles = create_tiles(&grid, fabric.as_ref(), &config);

        let error_region = if config.channels.contains(Channels::VARIANCE) {
            ErrorRegion::new(total)
        } else {
            ErrorRegion::new(0)
        };

        let host_image = (fabric.is_coordinator() && config.format != PixelFormat::None).then(
            || {
                // Accumulation and variance planes stay on the workers.
                let channels = config
                    .channels
                    .difference(Channels::ACCUM | Channels::VARIANCE);
                Mutex::new(HostImage::new(
                    config.width,
                    config.height,
                    config.format,
                    channels,
                ))
            },
        );

        debug!(
            "rank {rank}: distributed frame buffer over {total} tiles, {} owned",
            owned.len()
        );

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            grid,
            format: config.format,
            channels: config.channels,
            coordinator_is_worker: config.coordinator_is_worker,
            fabric,
            pool,
            frame_mode: Mutex::new(config.frame_mode),
            tiles: RwLock::new(tiles),
            owned,
            accum_ids: (0..total).map(|_| AtomicI32::new(0)).collect(),
            instances: (0..total).map(|_| AtomicI32::new(0)).collect(),
            error_region,
            host_image,
            frame_active: AtomicBool::new(false),
            frame: Mutex::new(FrameShared {
                done: false,
                delayed: Vec::new(),
            }),
            frame_done: Condvar::new(),
            completed: Mutex::new(0),
            next_tile_write: AtomicUsize::new(0),
            gather_buffer: Mutex::new(Vec::new()),
            tile_reports: Mutex::new(TileReports {
                ids: Vec::new(),
                errors: Vec::new(),
            }),
            stats: Mutex::new(FrameStats::default()),
            cancelled: AtomicBool::new(false),
            frame_id: AtomicI32::new(-1),
            pixel_op: Mutex::new(None),
        })
    }

    /// The tile partition of the image.
    pub fn grid(&self) -> TileGrid {
        self.grid
    }

    /// Number of tiles owned by this rank.
    pub fn num_owned_tiles(&self) -> usize {
        self.owned.len()
    }

    /// The current frame id; `-1` after a clear.
    pub fn frame_id(&self) -> i32 {
        self.frame_id.load(Ordering::Relaxed)
    }

    /// Whether a cancel request has been received. Rendering kernels poll
    /// this and stop producing fragments; in-flight tiles still composite.
    pub fn rendering_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Number of messages buffered for replay because they arrived before
    /// the frame became active.
    pub fn delayed_message_count(&self) -> usize {
        self.frame.lock().unwrap().delayed.len()
    }

    /// Install a user pixel operator.
    pub fn set_pixel_op(&self, op: Arc<dyn PixelOp>) {
        *self.pixel_op.lock().unwrap() = Some(op);
    }

    /// A snapshot of the current frame's timing statistics.
    pub fn stats(&self) -> FrameStats {
        self.stats.lock().unwrap().clone()
    }

    fn pixel_op(&self) -> Option<Arc<dyn PixelOp>> {
        self.pixel_op.lock().unwrap().clone()
    }

    fn has_accum(&self) -> bool {
        self.channels.contains(Channels::ACCUM)
    }

    fn has_variance(&self) -> bool {
        self.channels.contains(Channels::VARIANCE)
    }

    fn has_depth(&self) -> bool {
        self.channels.contains(Channels::DEPTH)
    }

    fn has_aux(&self) -> bool {
        self.channels.contains(Channels::NORMAL) || self.channels.contains(Channels::ALBEDO)
    }

    /// Whether finished tiles are collected with the end-of-frame gather.
    /// In coordinator-only mode they travel per tile instead.
    fn uses_final_gather(&self) -> bool {
        self.coordinator_is_worker
    }

    fn completion_target(&self) -> usize {
        if self.fabric.is_coordinator() && !self.coordinator_is_worker {
            if self.format == PixelFormat::None {
                // All information flows through the error gather; the
                // coordinator's own frame has nothing to wait for.
                0
            } else {
                self.grid.total_tiles() as usize
            }
        } else {
            self.owned.len()
        }
    }

    /// Atomically add `n` completed tiles and report whether the frame's
    /// completion target is reached.
    fn is_complete(&self, n: usize) -> bool {
        let mut completed = self.completed.lock().unwrap();
        *completed += n;
        *completed == self.completion_target()
    }

    /// Begin a new frame: reset the cancellation flag and bump the frame
    /// id. Called exactly once per frame, before [`start`](Self::start).
    pub fn begin(&self) {
        self.cancelled.store(false, Ordering::Relaxed);
        self.frame_id.fetch_add(1, Ordering::Relaxed);
    }

    /// Arm the frame: synchronize the error region and expected
    /// contribution counts, reset per-tile state, pre-count tiles already
    /// below `error_threshold`, and open the gate for inbound messages.
    ///
    /// Panics if the frame is already active.
    pub fn start(&self, error_threshold: f32) {
        self.stats.lock().unwrap().clear_frame();
        self.next_tile_write.store(0, Ordering::Relaxed);
        if self.format != PixelFormat::None {
            let size = self.owned.len() * self.tile_message_size();
            let mut buffer = self.gather_buffer.lock().unwrap();
            buffer.clear();
            buffer.resize(size, 0);
        }

        let delayed;
        {
            let mut frame = self.frame.lock().unwrap();
            assert!(
                !self.frame_active.load(Ordering::Acquire),
                "start on an already active frame"
            );

            if let Some(op) = self.pixel_op() {
                op.begin_frame();
            }

            delayed = core::mem::take(&mut frame.delayed);

            // The broadcasts must happen before the frame goes active:
            // they drive which tiles are expected at all this frame.
            self.error_region.sync(self.fabric.as_ref());
            self.broadcast_instances();

            if self.format == PixelFormat::None {
                let mut reports = self.tile_reports.lock().unwrap();
                reports.ids.clear();
                reports.errors.clear();
                reports.ids.reserve(self.owned.len());
                reports.errors.reserve(self.owned.len());
            }

            let tiles = self.tiles.read().unwrap();
            for &index in &self.owned {
                let slot = tiles[index].owned.as_ref().unwrap();
                slot.lock()
                    .unwrap()
                    .new_frame(self.instances[index].load(Ordering::Relaxed));
            }

            let mut completed = self.completed.lock().unwrap();
            *completed = 0;
            if self.has_accum() {
                let count_all = self.fabric.is_coordinator() && !self.coordinator_is_worker;
                for slot in tiles.iter() {
                    if self.error_region.get(slot.desc.id) <= error_threshold
                        && (count_all || slot.desc.is_owned_by(self.fabric.rank()))
                    {
                        *completed += 1;
                    }
                }
            }
            drop(completed);
            drop(tiles);

            frame.done = false;
            // Going active has to be the last action under the mutex: as
            // soon as the flag flips, `incoming` bypasses the lock and
            // writes straight into the frame.
            self.frame_active.store(true, Ordering::Release);
        }

        debug!(
            "rank {}: frame {} active, replaying {} delayed messages",
            self.fabric.rank(),
            self.frame_id(),
            delayed.len()
        );
        for message in delayed {
            self.schedule_processing(message);
        }

        if self.is_complete(0) {
            self.close();
        }
    }

    fn broadcast_instances(&self) {
        let mut buf = vec![0u8; self.instances.len() * 4];
        if self.fabric.is_coordinator() {
            for (chunk, value) in buf.chunks_exact_mut(4).zip(&self.instances) {
                chunk.copy_from_slice(&value.load(Ordering::Relaxed).to_le_bytes());
            }
        }
        self.fabric.broadcast(COORDINATOR_RANK, &mut buf);
        if !self.fabric.is_coordinator() {
            for (chunk, value) in buf.chunks_exact(4).zip(&self.instances) {
                value.store(
                    i32::from_le_bytes(chunk.try_into().unwrap()),
                    Ordering::Relaxed,
                );
            }
        }
    }

    /// Close the frame on this rank and wake `wait_until_finished`.
    fn close(&self) {
        let mut frame = self.frame.lock().unwrap();
        self.frame_active.store(false, Ordering::Release);
        frame.done = true;
        self.frame_done.notify_all();
        debug!("rank {}: frame closed", self.fabric.rank());
    }

    /// Block until this rank's frame closes, then run the end-of-frame
    /// collection: the color gather, the error-only gather, or a plain
    /// barrier, depending on configuration.
    pub fn wait_until_finished(&self) {
        let wait_start = Instant::now();
        {
            let mut frame = self.frame.lock().unwrap();
            while !frame.done {
                frame = self.frame_done.wait(frame).unwrap();
            }
        }
        {
            let mut stats = self.stats.lock().unwrap();
            stats.wait_frame = wait_start.elapsed();
            debug!(
                "rank {}: waited {:?} for the frame, {} scheduled messages (mean queue {:?}, mean work {:?})",
                self.fabric.rank(),
                stats.wait_frame,
                stats.queue_times.len(),
                FrameStats::mean(&stats.queue_times),
                FrameStats::mean(&stats.work_times),
            );
        }

        if self.format != PixelFormat::None {
            if self.uses_final_gather() {
                self.gather_final_tiles();
            } else {
                // Tiles were painted as they arrived; just resynchronize.
                self.fabric.barrier();
            }
        } else if self.has_variance() {
            self.gather_final_errors();
        } else {
            self.fabric.barrier();
        }
    }

    /// End the frame: reset the expected-contribution counts, advance every
    /// tile's accumulation id, and on the coordinator refine the error
    /// region against `error_threshold`, returning its summary value.
    /// Other ranks return `+inf`; they receive the refined region with the
    /// next `start`.
    pub fn end(&self, error_threshold: f32) -> f32 {
        let coordinator_only = self.fabric.is_coordinator() && !self.coordinator_is_worker;
        if !coordinator_only {
            if let Some(op) = self.pixel_op() {
                op.end_frame();
            }
        }

        for value in &self.instances {
            value.store(0, Ordering::Relaxed);
        }
        for value in &self.accum_ids {
            value.fetch_add(1, Ordering::Relaxed);
        }

        if self.fabric.is_coordinator() {
            self.error_region.refine(error_threshold)
        } else {
            f32::INFINITY
        }
    }

    /// Accept an inbound message from the fabric's delivery thread.
    ///
    /// Messages arriving while the frame is inactive are buffered and
    /// replayed at the transition into the active state; nothing is lost.
    pub fn incoming(&self, message: Arc<Message>) {
        if !self.frame_active.load(Ordering::Acquire) {
            let mut frame = self.frame.lock().unwrap();
            if !self.frame_active.load(Ordering::Acquire) {
                trace!(
                    "rank {}: delaying early message {:#x}",
                    self.fabric.rank(),
                    message.command()
                );
                frame.delayed.push(message);
                return;
            }
        }
        self.schedule_processing(message);
    }

    fn schedule_processing(&self, message: Arc<Message>) {
        let this = self.me.upgrade().expect("frame buffer dropped");
        let queued_at = Instant::now();
        self.pool.spawn(move || {
            this.process_scheduled(message, queued_at);
        });
    }

    fn process_scheduled(&self, message: Arc<Message>, queued_at: Instant) {
        let started = Instant::now();
        let command = message.command();

        if command & (wire::MASTER_WRITE_TILE_I8 | wire::MASTER_WRITE_TILE_F32) != 0 {
            assert!(
                self.fabric.is_coordinator(),
                "finished-tile message delivered to non-coordinator rank {}",
                self.fabric.rank()
            );
            self.process_master_tile(message.as_bytes());
            if self.is_complete(1) {
                self.close();
            }
        } else if command & wire::WORKER_WRITE_TILE != 0 {
            let mut fragment =
                wire::decode_worker_tile(message.as_bytes()).expect("malformed worker tile");
            if let Some(op) = self.pixel_op() {
                op.pre_accum(&mut fragment);
            }
            self.process_fragment(&fragment);
        } else if command & wire::CANCEL_RENDERING != 0 {
            self.cancelled.store(true, Ordering::Relaxed);
        } else {
            panic!("unknown tile message command {command:#x}");
        }

        self.stats
            .lock()
            .unwrap()
            .record_task(started - queued_at, started.elapsed());
    }

    /// Submit a freshly rendered fragment.
    ///
    /// Local tiles are composited synchronously on the calling thread to
    /// avoid a scheduler round-trip; fragments for remote tiles are sent to
    /// their owner. Panics if a local tile is submitted while the frame is
    /// inactive.
    pub fn set_tile(&self, fragment: &Fragment) {
        let id = self
            .grid
            .tile_id_at(fragment.origin_x as u32, fragment.origin_y as u32);
        let owner = {
            let tiles = self.tiles.read().unwrap();
            tiles[id as usize].desc.owner
        };

        if owner as usize != self.fabric.rank() {
            trace!(
                "rank {}: tile {id} routed to owner {owner}",
                self.fabric.rank()
            );
            let message = wire::encode_worker_tile(fragment);
            self.fabric.send_to(owner as usize, Arc::new(message));
        } else {
            assert!(
                self.frame_active.load(Ordering::Acquire),
                "set_tile on an inactive frame"
            );
            self.process_fragment(fragment);
        }
    }

    /// Composite one fragment into its owned tile; on tile completion run
    /// the completion path and, if it was the last owned tile, close the
    /// frame.
    fn process_fragment(&self, fragment: &Fragment) {
        let id = self
            .grid
            .tile_id_at(fragment.origin_x as u32, fragment.origin_y as u32);
        let tiles = self.tiles.read().unwrap();
        let slot = tiles[id as usize]
            .owned
            .as_ref()
            .expect("fragment processed on a rank that does not own its tile");

        let mut tile = slot.lock().unwrap();
        assert!(
            self.frame_active.load(Ordering::Acquire),
            "fragment composited while the frame is inactive"
        );
        let completed = tile.process(fragment);
        if completed {
            self.tile_completed(&mut tile);
        }
        drop(tile);
        drop(tiles);

        if completed && self.is_complete(1) {
            self.close();
        }
    }

    /// A tile reached its completion predicate: run the user operator,
    /// convert to the output format, and stage the finished tile for
    /// collection.
    fn tile_completed(&self, tile: &mut OwnedTile) {
        if let Some(op) = self.pixel_op() {
            let color = &mut tile.resolved.color;
            op.post_accum(&mut color.r, &mut color.g, &mut color.b, &mut color.a);
        }

        if self.format == PixelFormat::None {
            let mut reports = self.tile_reports.lock().unwrap();
            reports.ids.push(tile.desc.id);
            reports.errors.push(tile.error);
            return;
        }

        tile.encode_color();
        let message = self.build_master_tile(tile);
        if self.uses_final_gather() {
            // Writers reserve disjoint regions of the gather stream.
            let offset = self.next_tile_write.fetch_add(message.len(), Ordering::Relaxed);
            let mut buffer = self.gather_buffer.lock().unwrap();
            buffer[offset..offset + message.len()].copy_from_slice(message.as_bytes());
        } else {
            self.fabric.send_to(COORDINATOR_RANK, Arc::new(message));
        }
    }

    fn build_master_tile(&self, tile: &OwnedTile) -> Message {
        let mut builder = wire::MasterTileBuilder::new(
            self.format,
            self.has_depth(),
            self.has_aux(),
            (tile.desc.origin_x, tile.desc.origin_y),
            tile.error,
        );
        builder.set_color(&tile.color);
        builder.set_depth(&tile.resolved.z);
        if let Some(aux) = &tile.resolved.aux {
            builder.set_normal([&aux.nx, &aux.ny, &aux.nz]);
            builder.set_albedo([&aux.ar, &aux.ag, &aux.ab]);
        }
        builder.finish()
    }

    pub(crate) fn tile_message_size(&self) -> usize {
        wire::master_tile_size(self.format, self.has_depth(), self.has_aux())
    }

    /// Bytes of finished-tile messages staged in the gather stream so far
    /// this frame. Diagnostic; at frame close it equals the summed message
    /// sizes of every tile completed with output.
    pub fn staged_gather_bytes(&self) -> usize {
        self.next_tile_write.load(Ordering::Relaxed)
    }

    /// Zero the requested channels across owned tiles, in parallel. When
    /// the accumulation channel is cleared, the accumulation ids and the
    /// error region reset with it and the frame id drops to `-1`.
    pub fn clear(&self, channels: Channels) {
        self.frame_id.store(-1, Ordering::Relaxed);

        let tiles = self.tiles.read().unwrap();
        if !self.owned.is_empty() {
            self.pool.install(|| {
                self.owned.par_iter().for_each(|&index| {
                    let slot = tiles[index].owned.as_ref().unwrap();
                    slot.lock().unwrap().clear(channels);
                });
            });
        }
        drop(tiles);

        if channels.contains(Channels::ACCUM) && self.has_accum() {
            for value in &self.accum_ids {
                value.store(0, Ordering::Relaxed);
            }
            self.error_region.clear();
        }
    }

    /// Read a tile's accumulation id and register one pending contribution
    /// for the current frame. The dual effect is intentional: callers that
    /// ask for the id are about to produce a fragment.
    pub fn accum_id(&self, tile_x: u32, tile_y: u32) -> i32 {
        if !self.has_accum() {
            return 0;
        }
        let id = self.grid.id_from_coords(tile_x, tile_y) as usize;
        self.instances[id].fetch_add(1, Ordering::Relaxed);
        self.accum_ids[id].load(Ordering::Relaxed)
    }

    /// The current error estimate of a tile; `+inf` when unknown.
    pub fn tile_error(&self, tile_x: u32, tile_y: u32) -> f32 {
        self.error_region
            .get(self.grid.id_from_coords(tile_x, tile_y))
    }

    /// Switch the composition mode, recreating all tile state. No-op when
    /// the mode is unchanged. Must not be called during an active frame.
    pub fn set_frame_mode(&self, mode: FrameMode) {
        let mut current = self.frame_mode.lock().unwrap();
        if *current == mode {
            return;
        }
        assert!(
            !self.frame_active.load(Ordering::Acquire),
            "cannot change the composition mode during an active frame"
        );
        *current = mode;

        let config = FrameBufferConfig {
            width: self.grid.width,
            height: self.grid.height,
            format: self.format,
            channels: self.channels,
            coordinator_is_worker: self.coordinator_is_worker,
            frame_mode: mode,
        };
        *self.tiles.write().unwrap() = create_tiles(&self.grid, self.fabric.as_ref(), &config);
    }

    /// Borrow a host-image channel for reading. Fails on ranks without a
    /// host image (workers, or any rank with [`PixelFormat::None`]).
    /// Dropping the returned view unmaps the buffer.
    pub fn map_buffer(&self, channel: MapChannel) -> Result<MappedBuffer<'_>, MapError> {
        let image = self.host_image.as_ref().ok_or(MapError::NoHostImage)?;
        let guard = image.lock().unwrap();
        guard.channel_bytes(channel)?;
        Ok(MappedBuffer { guard, channel })
    }

    /// Ask every rank to stop producing fragments. Point-to-point because
    /// the messaging layer is active; cooperative and lossless, in-flight
    /// tiles still composite.
    pub fn send_cancel_rendering_message(&self) {
        let message = Arc::new(wire::cancel_message());
        for rank in 0..self.fabric.size() {
            self.fabric.send_to(rank, message.clone());
        }
    }
}

/// A borrowed read view of a host-image channel. Holds the host image
/// locked; drop it before the next frame's gather.
pub struct MappedBuffer<'a> {
    guard: MutexGuard<'a, HostImage>,
    channel: MapChannel,
}

impl core::ops::Deref for MappedBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.guard
            .channel_bytes(self.channel)
            .expect("channel validated when the buffer was mapped")
    }
}

fn owner_for(fabric: &dyn Fabric, coordinator_is_worker: bool, id: u32) -> u32 {
    if coordinator_is_worker {
        (id as usize % fabric.size()) as u32
    } else {
        fabric.worker_rank_to_global(id as usize % fabric.num_workers()) as u32
    }
}

fn create_tiles(grid: &TileGrid, fabric: &dyn Fabric, config: &FrameBufferConfig) -> Vec<TileSlot> {
    let rank = fabric.rank();
    let z_workers = if config.coordinator_is_worker {
        fabric.size()
    } else {
        fabric.num_workers()
    } as u32;

    (0..grid.total_tiles())
        .map(|id| {
            let (origin_x, origin_y) = grid.tile_origin(id);
            let desc = quilt_common::TileDesc {
                origin_x,
                origin_y,
                id,
                owner: owner_for(fabric, config.coordinator_is_worker, id),
            };
            let owned = desc.is_owned_by(rank).then(|| {
                Mutex::new(OwnedTile::new(
                    desc,
                    config.frame_mode,
                    config.format,
                    config.channels,
                    z_workers,
                ))
            });
            TileSlot { desc, owned }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::local::LocalFabric;
    use quilt_common::TILE_SIZE;

    fn pool() -> Arc<rayon::ThreadPool> {
        Arc::new(
            rayon::ThreadPoolBuilder::new()
                .num_threads(1)
                .build()
                .unwrap(),
        )
    }

    fn build_group(
        size: usize,
        config: FrameBufferConfig,
    ) -> Vec<Arc<DistributedFrameBuffer>> {
        LocalFabric::group(size)
            .into_iter()
            .map(|endpoint| DistributedFrameBuffer::new(config, endpoint.fabric, pool()))
            .collect()
    }

    #[test]
    fn every_tile_has_exactly_one_owner() {
        let config = FrameBufferConfig::new(3 * TILE_SIZE, 2 * TILE_SIZE, PixelFormat::Rgba8);
        let group = build_group(3, config);
        let total = group[0].grid().total_tiles();
        for id in 0..total {
            let owners = group
                .iter()
                .enumerate()
                .filter(|(rank, fb)| {
                    let tiles = fb.tiles.read().unwrap();
                    tiles[id as usize].desc.is_owned_by(*rank)
                })
                .count();
            assert_eq!(owners, 1, "tile {id} must have exactly one owner");
        }
        assert_eq!(
            group.iter().map(|fb| fb.num_owned_tiles()).sum::<usize>(),
            total as usize
        );
    }

    #[test]
    fn exclude_coordinator_ownership_spares_rank_zero() {
        let config = FrameBufferConfig {
            width: 4 * TILE_SIZE,
            height: TILE_SIZE,
            format: PixelFormat::Rgba8,
            channels: Channels::COLOR,
            coordinator_is_worker: false,
            frame_mode: FrameMode::Overwrite,
        };
        let group = build_group(3, config);
        assert_eq!(group[0].num_owned_tiles(), 0);
        assert_eq!(group[1].num_owned_tiles() + group[2].num_owned_tiles(), 4);
        // Worker-space round robin: ids 0,2 on worker 0 (rank 1).
        assert_eq!(group[1].num_owned_tiles(), 2);
    }

    #[test]
    fn completion_targets_follow_the_topology() {
        let include = FrameBufferConfig::new(2 * TILE_SIZE, TILE_SIZE, PixelFormat::Rgba8);
        let group = build_group(2, include);
        assert_eq!(group[0].completion_target(), 1);
        assert_eq!(group[1].completion_target(), 1);

        let exclude = FrameBufferConfig {
            coordinator_is_worker: false,
            ..include
        };
        let group = build_group(2, exclude);
        assert_eq!(group[0].completion_target(), 2);
        assert_eq!(group[1].completion_target(), 2);

        let none = FrameBufferConfig {
            format: PixelFormat::None,
            channels: Channels::ACCUM | Channels::VARIANCE,
            coordinator_is_worker: false,
            ..include
        };
        let group = build_group(2, none);
        assert_eq!(group[0].completion_target(), 0);
        assert_eq!(group[1].completion_target(), 2);
    }

    #[test]
    fn message_size_tracks_configured_channels() {
        let mut config = FrameBufferConfig::new(TILE_SIZE, TILE_SIZE, PixelFormat::Rgba8);
        let base = build_group(1, config).remove(0).tile_message_size();
        config.channels = Channels::COLOR | Channels::DEPTH;
        let with_depth = build_group(1, config).remove(0).tile_message_size();
        assert_eq!(with_depth - base, quilt_common::TILE_PIXELS * 4);
    }
}
