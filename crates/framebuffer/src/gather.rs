//! End-of-frame gather.
//!
//! Color-carrying configurations ship every completed tile as one
//! fixed-stride record: each rank compresses its gather buffer, the sizes
//! are gathered, the compressed blocks follow, and the master decompresses
//! every rank's block into its fixed slot of the flat result before
//! assembling the image. Error-only configurations gather (tile, error)
//! pairs instead.

use std::io::Write;
use std::time::Instant;

use log::debug;
use model::TileCoord;
use rayon::prelude::*;
use wire::MasterTileRecord;

use crate::stats::Summary;
use crate::{lock, DistributedFrameBuffer, FrameError};

impl DistributedFrameBuffer {
    pub(crate) fn gather_final_tiles(&self) -> Result<(), FrameError> {
        let record_bytes = self.wire_tile_bytes();
        let master = self.group.master();

        // per-owner byte counts, in rank order; the running sum below is
        // each rank's fixed slot offset in the flat result
        let bytes_expected = if self.group.is_master() {
            let registry = self.registry.read().expect("tile registry poisoned");
            let mut expected = vec![0usize; self.group.num_ranks()];
            for tile_id in 0..registry.total_tiles() {
                expected[registry.desc(tile_id).owner.0] += record_bytes;
            }
            expected
        } else {
            Vec::new()
        };

        let source = std::mem::take(&mut *lock(&self.gather_buffer, "gather buffer"));

        let compress_started = Instant::now();
        let compressed = snap::raw::Encoder::new()
            .compress_vec(&source)
            .unwrap_or_else(|err| panic!("snappy compression failed: {err}"));
        {
            let mut stats = lock(&self.stats, "frame stats");
            stats.compress = compress_started.elapsed();
            stats.compressed_percent = if source.is_empty() {
                0.0
            } else {
                100.0 * compressed.len() as f64 / source.len() as f64
            };
        }
        debug!(
            "{} gathering {} -> {} compressed bytes",
            self.group.this_rank(),
            source.len(),
            compressed.len()
        );

        let gather_started = Instant::now();
        let sizes = self.transport.gather_i32(master, compressed.len() as i32)?;
        let blocks = self.transport.gatherv_bytes(master, &compressed)?;
        lock(&self.stats, "frame stats").gather = gather_started.elapsed();

        let (Some(sizes), Some(blocks)) = (sizes, blocks) else {
            return Ok(());
        };

        // decompress every rank's block into its fixed, tile-aligned slot
        let decompress_started = Instant::now();
        let total_bytes: usize = bytes_expected.iter().sum();
        let mut flat = vec![0u8; total_bytes];
        let mut slots: Vec<&mut [u8]> = Vec::with_capacity(bytes_expected.len());
        {
            let mut rest = flat.as_mut_slice();
            for &bytes in &bytes_expected {
                let (slot, tail) = rest.split_at_mut(bytes);
                slots.push(slot);
                rest = tail;
            }
        }
        let mut compressed_at = Vec::with_capacity(sizes.len());
        {
            let mut at = 0usize;
            for &size in &sizes {
                compressed_at.push(at);
                at += size as usize;
            }
        }
        slots
            .par_iter_mut()
            .enumerate()
            .for_each(|(rank, slot)| {
                let block = &blocks[compressed_at[rank]..compressed_at[rank] + sizes[rank] as usize];
                let written = snap::raw::Decoder::new()
                    .decompress(block, slot)
                    .unwrap_or_else(|err| panic!("snappy decompression failed: {err}"));
                assert_eq!(
                    written,
                    slot.len(),
                    "rank {rank} gathered {written} bytes, its tiles need {}",
                    slot.len()
                );
            });
        lock(&self.stats, "frame stats").decompress = decompress_started.elapsed();

        let write_started = Instant::now();
        let records: Vec<MasterTileRecord<'_>> = flat
            .chunks_exact(record_bytes)
            .map(|chunk| {
                wire::parse_master_tile(chunk, self.layout.tile_size())
                    .unwrap_or_else(|err| panic!("record in final gather: {err}"))
            })
            .collect();

        if self.has_variance() {
            let mut region = lock(&self.error_region, "error region");
            for record in &records {
                region.update(self.layout.coord_of_origin(record.origin), record.error);
            }
        }

        let mut image = self
            .local_image
            .as_ref()
            .expect("master gathers tiles without a master-side image")
            .lock()
            .expect("master image poisoned");
        image.assemble(&records);
        lock(&self.stats, "frame stats").master_write = write_started.elapsed();
        Ok(())
    }

    pub(crate) fn gather_final_errors(&self) -> Result<(), FrameError> {
        let master = self.group.master();
        let (ids, errors) = {
            let mut pending = lock(&self.pending_errors, "pending tile errors");
            (
                std::mem::take(&mut pending.ids),
                std::mem::take(&mut pending.errors),
            )
        };

        let counts = self.transport.gather_i32(master, ids.len() as i32)?;
        let send = wire::encode_error_records(&ids, &errors);
        let flat = self.transport.gatherv_bytes(master, &send)?;

        let (Some(counts), Some(flat)) = (counts, flat) else {
            return Ok(());
        };

        let mut spans = Vec::with_capacity(counts.len());
        {
            let mut at = 0usize;
            for &count in &counts {
                let bytes = count as usize * wire::ERROR_RECORD_BYTES;
                spans.push((at, count as usize));
                at += bytes;
            }
        }
        let per_rank: Vec<Vec<(TileCoord, f32)>> = spans
            .par_iter()
            .map(|&(at, count)| {
                wire::decode_error_records(&flat[at..], count)
                    .unwrap_or_else(|err| panic!("error record in final gather: {err}"))
            })
            .collect();

        let mut region = lock(&self.error_region, "error region");
        for records in per_rank {
            for (coord, error) in records {
                region.update(coord, error);
            }
        }
        Ok(())
    }

    /// Human-readable telemetry dump; the gather duration additionally
    /// goes through a MIN/MAX reduction so the master can report the
    /// spread across ranks.
    pub fn report_timings(&self, out: &mut dyn Write) -> Result<(), FrameError> {
        let (queue, work, wait, compress, decompress, gather, master_write, percent) = {
            let stats = lock(&self.stats, "frame stats");
            (
                Summary::of(&stats.queue_times),
                Summary::of(&stats.work_times),
                stats.wait_frame,
                stats.compress,
                stats.decompress,
                stats.gather,
                stats.master_write,
                stats.compressed_percent,
            )
        };

        if let Some(summary) = queue {
            writeln!(out, "tile queue times: {summary}")?;
        }
        if let Some(summary) = work {
            writeln!(out, "tile work times: {summary}")?;
        }
        let gather_ms = gather.as_secs_f64() * 1e3;
        writeln!(out, "gather time: {gather_ms:.3}ms")?;
        writeln!(
            out,
            "waiting for frame: {:.3}ms",
            wait.as_secs_f64() * 1e3
        )?;
        writeln!(
            out,
            "compress time: {:.3}ms",
            compress.as_secs_f64() * 1e3
        )?;
        writeln!(out, "compressed buffer size: {percent:.1}%")?;

        let master = self.group.master();
        let max_gather = self.transport.reduce_f64_max(master, gather_ms)?;
        let min_gather = self.transport.reduce_f64_min(master, gather_ms)?;

        if let (Some(max), Some(min)) = (max_gather, min_gather) {
            writeln!(out, "max gather time: {max:.3}ms")?;
            writeln!(out, "min gather time: {min:.3}ms")?;
            writeln!(
                out,
                "master tile write loop time: {:.3}ms",
                master_write.as_secs_f64() * 1e3
            )?;
            writeln!(
                out,
                "decompress time: {:.3}ms",
                decompress.as_secs_f64() * 1e3
            )?;
        }
        Ok(())
    }
}
