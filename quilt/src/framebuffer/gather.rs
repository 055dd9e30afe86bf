// Copyright 2026 the Quilt Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-of-frame collection.
//!
//! With a color format, every owner compresses its finished-tile stream,
//! the coordinator gathers the compressed streams, decompresses them in
//! parallel into a buffer laid out by ownership counts, and paints each
//! message into the host image in parallel across tile rows. With format
//! NONE only the `(tile, error)` reports are gathered.

use std::io::{Read, Write};
use std::time::Instant;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::debug;
use quilt_common::image::TilePaint;
use quilt_common::{wire, TILE_SIZE};
use rayon::prelude::*;

use super::DistributedFrameBuffer;
use crate::comm::COORDINATOR_RANK;

impl DistributedFrameBuffer {
    /// Paint one finished-tile message into the host image and record its
    /// error. Used both by the parallel paint of the final gather and by
    /// the router when owners ship tiles one message at a time.
    pub(crate) fn process_master_tile(&self, bytes: &[u8]) {
        let view = wire::MasterTileView::parse(bytes).expect("malformed finished-tile message");

        if self.has_variance() && view.header.error < f32::INFINITY {
            let id = self
                .grid
                .tile_id_at(view.header.x as u32, view.header.y as u32);
            self.error_region.update(id, view.header.error);
        }

        let image = self
            .host_image
            .as_ref()
            .expect("finished-tile message on a rank without a host image");
        let depth = view.depth_plane();
        let normal = view.normal_planes();
        let albedo = view.albedo_planes();
        let paint = TilePaint {
            origin: (view.header.x, view.header.y),
            color: view.color_bytes(),
            depth: depth.as_deref(),
            normal: normal.as_deref(),
            albedo: albedo.as_deref(),
        };

        let mut image = image.lock().unwrap();
        let band = (view.header.y as u32 / TILE_SIZE) as usize;
        let mut bands = image.tile_row_bands();
        bands[band].paint(&paint);
    }

    /// The color path of the end-of-frame collection.
    pub(crate) fn gather_final_tiles(&self) {
        let tile_size = self.tile_message_size();

        let compress_start = Instant::now();
        let compressed = {
            let buffer = self.gather_buffer.lock().unwrap();
            compress(&buffer)
        };
        {
            let mut stats = self.stats.lock().unwrap();
            stats.compress = compress_start.elapsed();
            let raw = self.owned.len() * tile_size;
            stats.compressed_percent = if raw == 0 {
                0.0
            } else {
                100.0 * compressed.len() as f64 / raw as f64
            };
        }

        let gather_start = Instant::now();
        let sizes = self
            .fabric
            .gather_u64(COORDINATOR_RANK, compressed.len() as u64);
        let blobs = self.fabric.gather_bytes(COORDINATOR_RANK, &compressed);
        self.stats.lock().unwrap().gather = gather_start.elapsed();

        let Some(blobs) = blobs else {
            return;
        };
        let sizes = sizes.expect("gather roots out of step");
        for (blob, size) in blobs.iter().zip(&sizes) {
            assert_eq!(blob.len() as u64, *size, "gathered stream size mismatch");
        }

        // Per-rank slices of the decompressed stream, laid out by how many
        // tiles each rank owns.
        let counts = {
            let tiles = self.tiles.read().unwrap();
            let mut counts = vec![0usize; self.fabric.size()];
            for slot in tiles.iter() {
                counts[slot.desc.owner as usize] += 1;
            }
            counts
        };
        let total_tiles = self.grid.total_tiles() as usize;
        let mut result = vec![0u8; total_tiles * tile_size];

        let decompress_start = Instant::now();
        {
            let mut slices = Vec::with_capacity(counts.len());
            let mut rest: &mut [u8] = &mut result;
            for &count in &counts {
                let (head, tail) = rest.split_at_mut(count * tile_size);
                slices.push(head);
                rest = tail;
            }
            self.pool.install(|| {
                slices
                    .into_par_iter()
                    .enumerate()
                    .for_each(|(rank, slice)| decompress_into(&blobs[rank], slice));
            });
        }
        let decompress_time = decompress_start.elapsed();

        // Index messages by the tile row they paint into, and apply error
        // updates on the way. Slots a rank never wrote stay zeroed: those
        // tiles were already below the error threshold at frame start and
        // keep their previous pixels.
        let paint_start = Instant::now();
        let mut row_messages: Vec<Vec<usize>> = vec![Vec::new(); self.grid.tiles_y() as usize];
        for index in 0..total_tiles {
            let bytes = &result[index * tile_size..(index + 1) * tile_size];
            let command = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
            if command == 0 {
                continue;
            }
            assert!(
                command & (wire::MASTER_WRITE_TILE_I8 | wire::MASTER_WRITE_TILE_F32) != 0,
                "non-finished tile message in the final gather: {command:#x}"
            );
            let header: wire::TileHeader = bytemuck::pod_read_unaligned(&bytes[0..wire::HEADER_SIZE]);
            if self.has_variance() && header.error < f32::INFINITY {
                let id = self.grid.tile_id_at(header.x as u32, header.y as u32);
                self.error_region.update(id, header.error);
            }
            row_messages[header.y as usize / TILE_SIZE as usize].push(index);
        }

        {
            let image = self
                .host_image
                .as_ref()
                .expect("final gather on a rank without a host image");
            let mut image = image.lock().unwrap();
            let bands = image.tile_row_bands();
            let result = &result;
            let row_messages = &row_messages;
            self.pool.install(|| {
                bands.into_par_iter().for_each(|mut band| {
                    for &index in &row_messages[band.tile_row() as usize] {
                        let bytes = &result[index * tile_size..(index + 1) * tile_size];
                        let view = wire::MasterTileView::parse(bytes)
                            .expect("malformed finished-tile message in the final gather");
                        let depth = view.depth_plane();
                        let normal = view.normal_planes();
                        let albedo = view.albedo_planes();
                        band.paint(&TilePaint {
                            origin: (view.header.x, view.header.y),
                            color: view.color_bytes(),
                            depth: depth.as_deref(),
                            normal: normal.as_deref(),
                            albedo: albedo.as_deref(),
                        });
                    }
                });
            });
        }

        let mut stats = self.stats.lock().unwrap();
        stats.decompress = decompress_time;
        stats.paint = paint_start.elapsed();
        debug!(
            "final gather: {} tiles painted, stream at {:.1}% of raw, decompress {:?}, paint {:?}",
            total_tiles, stats.compressed_percent, stats.decompress, stats.paint
        );
    }

    /// The error-only path of the end-of-frame collection.
    pub(crate) fn gather_final_errors(&self) {
        let (ids, errors) = {
            let reports = self.tile_reports.lock().unwrap();
            (reports.ids.clone(), reports.errors.clone())
        };

        let counts = self.fabric.gather_u64(COORDINATOR_RANK, ids.len() as u64);

        let mut buffer = Vec::with_capacity(ids.len() * 8);
        for id in &ids {
            buffer.extend_from_slice(&id.to_le_bytes());
        }
        for error in &errors {
            buffer.extend_from_slice(&error.to_le_bytes());
        }
        let blobs = self.fabric.gather_bytes(COORDINATOR_RANK, &buffer);

        let Some(blobs) = blobs else {
            return;
        };
        let counts = counts.expect("gather roots out of step");

        self.pool.install(|| {
            blobs.par_iter().enumerate().for_each(|(rank, blob)| {
                let count = counts[rank] as usize;
                assert_eq!(blob.len(), count * 8, "malformed error report from {rank}");
                for k in 0..count {
                    let id =
                        u32::from_le_bytes(blob[k * 4..k * 4 + 4].try_into().unwrap());
                    let offset = count * 4 + k * 4;
                    let error =
                        f32::from_le_bytes(blob[offset..offset + 4].try_into().unwrap());
                    if error < f32::INFINITY {
                        self.error_region.update(id, error);
                    }
                }
            });
        });
    }
}

fn compress(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
    encoder
        .write_all(bytes)
        .expect("compressing the gather stream");
    encoder.finish().expect("compressing the gather stream")
}

fn decompress_into(src: &[u8], dst: &mut [u8]) {
    if dst.is_empty() {
        return;
    }
    let mut decoder = ZlibDecoder::new(src);
    decoder
        .read_exact(dst)
        .expect("decompressing a gather stream");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compression_round_trips() {
        let data: Vec<u8> = (0..64 * 1024).map(|i| (i % 7) as u8).collect();
        let compressed = compress(&data);
        assert!(compressed.len() < data.len());
        let mut restored = vec![0u8; data.len()];
        decompress_into(&compressed, &mut restored);
        assert_eq!(restored, data);
    }

    #[test]
    fn empty_stream_round_trips() {
        let compressed = compress(&[]);
        let mut restored = [0u8; 0];
        decompress_into(&compressed, &mut restored);
    }
}
