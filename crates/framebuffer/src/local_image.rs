//! The master's non-distributed image: the contiguous planes the host maps
//! after a frame. Only rank 0 holds one, and only when the color format
//! ships pixels.

use model::{ChannelMask, PixelFormat, TileGridLayout, Vec2i};
use rayon::prelude::*;
use wire::MasterTileRecord;

#[derive(Debug)]
pub(crate) struct LocalImage {
    layout: TileGridLayout,
    format: PixelFormat,
    color: Vec<u8>,
    depth: Option<Vec<f32>>,
    normal: Option<Vec<f32>>,
    albedo: Option<Vec<f32>>,
}

impl LocalImage {
    pub fn new(layout: TileGridLayout, format: PixelFormat, channels: ChannelMask) -> Self {
        assert!(
            format != PixelFormat::None,
            "a master-side image needs a color format"
        );
        let size = layout.image_size();
        let pixels = size.x as usize * size.y as usize;
        Self {
            layout,
            format,
            color: vec![0; pixels * format.bytes_per_pixel()],
            depth: channels
                .contains(ChannelMask::DEPTH)
                .then(|| vec![f32::INFINITY; pixels]),
            normal: channels
                .contains(ChannelMask::NORMAL)
                .then(|| vec![0.0; pixels * 3]),
            albedo: channels
                .contains(ChannelMask::ALBEDO)
                .then(|| vec![0.0; pixels * 3]),
        }
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn color(&self) -> &[u8] {
        &self.color
    }

    pub fn depth(&self) -> Option<&[f32]> {
        self.depth.as_deref()
    }

    pub fn normal(&self) -> Option<&[f32]> {
        self.normal.as_deref()
    }

    pub fn albedo(&self) -> Option<&[f32]> {
        self.albedo.as_deref()
    }

    /// Write all gathered records into the planes. Records are grouped by
    /// the horizontal tile band they fall into; bands are disjoint row
    /// ranges of every plane, so each plane is filled with one parallel
    /// pass over its bands.
    pub fn assemble(&mut self, records: &[MasterTileRecord<'_>]) {
        let tile_size = self.layout.tile_size();
        let bands = self.layout.tiles_y() as usize;
        let mut by_band: Vec<Vec<usize>> = vec![Vec::new(); bands];
        for (index, record) in records.iter().enumerate() {
            let band = record.origin.y as usize / tile_size as usize;
            assert!(
                band < bands && record.origin.x >= 0 && record.origin.y >= 0,
                "gathered tile origin {} is outside the image",
                record.origin
            );
            by_band[band].push(index);
        }

        let width = self.layout.image_size().x as usize;
        let band_rows = tile_size as usize;
        let bpp = self.format.bytes_per_pixel();
        let layout = self.layout;

        self.color
            .par_chunks_mut(width * band_rows * bpp)
            .enumerate()
            .for_each(|(band, plane)| {
                for &index in &by_band[band] {
                    let record = &records[index];
                    let (w, h) = layout.clipped_extent(record.origin);
                    copy_rows(
                        plane,
                        record.color,
                        record.origin.x as usize,
                        w as usize,
                        h as usize,
                        tile_size as usize,
                        width,
                        bpp,
                    );
                }
            });

        if let Some(depth) = &mut self.depth {
            depth
                .par_chunks_mut(width * band_rows)
                .enumerate()
                .for_each(|(band, plane)| {
                    for &index in &by_band[band] {
                        let record = &records[index];
                        let Some(src) = record.depth else { continue };
                        let (w, h) = layout.clipped_extent(record.origin);
                        copy_f32_rows(
                            plane,
                            src,
                            record.origin.x as usize,
                            w as usize,
                            h as usize,
                            tile_size as usize,
                            width,
                            1,
                        );
                    }
                });
        }

        for (plane, pick) in [
            (self.normal.as_mut(), PickAux::Normal),
            (self.albedo.as_mut(), PickAux::Albedo),
        ] {
            let Some(plane) = plane else { continue };
            plane
                .par_chunks_mut(width * band_rows * 3)
                .enumerate()
                .for_each(|(band, plane)| {
                    for &index in &by_band[band] {
                        let record = &records[index];
                        let src = match pick {
                            PickAux::Normal => record.normal,
                            PickAux::Albedo => record.albedo,
                        };
                        let Some(src) = src else { continue };
                        let (w, h) = layout.clipped_extent(record.origin);
                        copy_f32_rows(
                            plane,
                            src,
                            record.origin.x as usize,
                            w as usize,
                            h as usize,
                            tile_size as usize,
                            width,
                            3,
                        );
                    }
                });
        }
    }
}

#[derive(Clone, Copy)]
enum PickAux {
    Normal,
    Albedo,
}

/// Copy the clipped rows of one tile into a band of a byte plane. The
/// destination band starts at the tile's own row, so the row offset within
/// the band equals the row within the tile.
#[allow(clippy::too_many_arguments)]
fn copy_rows(
    band: &mut [u8],
    src: &[u8],
    origin_x: usize,
    clip_w: usize,
    clip_h: usize,
    tile_size: usize,
    width: usize,
    bpp: usize,
) {
    for row in 0..clip_h {
        let src_at = row * tile_size * bpp;
        let dst_at = (row * width + origin_x) * bpp;
        band[dst_at..dst_at + clip_w * bpp].copy_from_slice(&src[src_at..src_at + clip_w * bpp]);
    }
}

/// Same as `copy_rows` for an f32 plane with `lanes` values per pixel; the
/// source is raw little-endian-of-the-host f32 bytes out of the gather.
#[allow(clippy::too_many_arguments)]
fn copy_f32_rows(
    band: &mut [f32],
    src: &[u8],
    origin_x: usize,
    clip_w: usize,
    clip_h: usize,
    tile_size: usize,
    width: usize,
    lanes: usize,
) {
    for row in 0..clip_h {
        for col in 0..clip_w {
            for lane in 0..lanes {
                let src_at = ((row * tile_size + col) * lanes + lane) * 4;
                band[(row * width + origin_x + col) * lanes + lane] =
                    bytemuck::pod_read_unaligned::<f32>(&src[src_at..src_at + 4]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wire::{wire_tile_bytes, MasterTileWriter};

    fn record_bytes(
        origin: Vec2i,
        tile_size: u32,
        color_value: u8,
        depth_value: f32,
    ) -> Vec<u8> {
        let pixels = (tile_size * tile_size) as usize;
        let mut slot = vec![0u8; wire_tile_bytes(PixelFormat::Rgba8, true, false, false, tile_size)];
        let mut writer = MasterTileWriter::new(
            &mut slot,
            PixelFormat::Rgba8,
            true,
            false,
            false,
            tile_size,
            origin,
            0.5,
        );
        writer.set_color(&vec![color_value; 4 * pixels]);
        writer.set_depth(&vec![depth_value; pixels]);
        slot
    }

    #[test]
    fn assemble_writes_tiles_into_their_rects() {
        let layout = TileGridLayout::new(Vec2i::new(4, 4), 2);
        let mut image = LocalImage::new(
            layout,
            PixelFormat::Rgba8,
            ChannelMask::COLOR | ChannelMask::DEPTH,
        );

        let slots: Vec<Vec<u8>> = vec![
            record_bytes(Vec2i::new(0, 0), 2, 10, 1.0),
            record_bytes(Vec2i::new(2, 0), 2, 20, 2.0),
            record_bytes(Vec2i::new(0, 2), 2, 30, 3.0),
            record_bytes(Vec2i::new(2, 2), 2, 40, 4.0),
        ];
        let records: Vec<MasterTileRecord> = slots
            .iter()
            .map(|slot| wire::parse_master_tile(slot, 2).expect("record should parse"))
            .collect();
        image.assemble(&records);

        // top-left pixel of each quadrant
        assert_eq!(image.color()[0], 10);
        assert_eq!(image.color()[2 * 4], 20);
        assert_eq!(image.color()[2 * 4 * 4], 30);
        assert_eq!(image.color()[(2 * 4 + 2) * 4], 40);
        let depth = image.depth().expect("depth plane configured");
        assert_eq!(depth[0], 1.0);
        assert_eq!(depth[2], 2.0);
        assert_eq!(depth[2 * 4 + 2], 4.0);
    }

    #[test]
    fn assemble_clips_edge_tiles_to_the_image() {
        // 5x3 image with 2-px tiles: right column and bottom row are clipped
        let layout = TileGridLayout::new(Vec2i::new(5, 3), 2);
        let mut image = LocalImage::new(layout, PixelFormat::Rgba8, ChannelMask::COLOR);

        let slots: Vec<Vec<u8>> = (0..layout.total_tiles())
            .map(|id| {
                let coord = layout.tile_coord(id).expect("valid id");
                record_bytes(layout.origin_of(coord), 2, (id + 1) as u8 * 10, 0.0)
            })
            .collect();
        let records: Vec<MasterTileRecord> = slots
            .iter()
            .map(|slot| wire::parse_master_tile(slot, 2).expect("record should parse"))
            .collect();
        image.assemble(&records);

        // every pixel of row 2 (the clipped bottom row) comes from tiles 3..5
        let width = 5usize;
        let row = 2usize;
        let expected = [40u8, 40, 50, 50, 60];
        for x in 0..width {
            assert_eq!(
                image.color()[(row * width + x) * 4],
                expected[x],
                "pixel ({x}, {row})"
            );
        }
    }
}
