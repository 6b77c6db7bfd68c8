//! Wire protocol of the distributed framebuffer.
//!
//! Two record families travel between ranks: worker tile messages
//! (peer to tile owner, point-to-point during the frame) and master tile
//! records (owner to master, only inside the end-of-frame gather buffer).
//! Records use native endianness; ranks of one job share a byte order.

use std::fmt;

use model::{PixelFormat, PixelTile, TileAux, TileCoord, Vec2i};

pub const MASTER_WRITE_TILE_I8: i32 = 1;
pub const MASTER_WRITE_TILE_F32: i32 = 2;
pub const MASTER_TILE_HAS_DEPTH: i32 = 4;
pub const MASTER_TILE_HAS_AUX: i32 = 8;
pub const WORKER_WRITE_TILE: i32 = 16;
pub const CANCEL_RENDERING: i32 = 32;

/// command + coords + error
pub const TILE_HEADER_BYTES: usize = 16;

/// tile coordinate (2 x i32) + error (f32)
pub const ERROR_RECORD_BYTES: usize = 12;

const WORKER_HEADER_BYTES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    ShortMessage { expected: usize, actual: usize },
    UnknownCommand { command: i32 },
}

impl fmt::Display for WireError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::ShortMessage { expected, actual } => {
                write!(
                    formatter,
                    "message too short: expected {expected} bytes, got {actual}"
                )
            }
            WireError::UnknownCommand { command } => {
                write!(formatter, "unknown wire command {command:#x}")
            }
        }
    }
}

impl std::error::Error for WireError {}

/// Byte size of one master tile record for the negotiated configuration.
/// The depth plane is reserved whenever any of depth/normal/albedo ship,
/// matching the record layout of the aux variants.
pub fn wire_tile_bytes(
    format: PixelFormat,
    has_depth: bool,
    has_normal: bool,
    has_albedo: bool,
    tile_size: u32,
) -> usize {
    let pixels = tile_size as usize * tile_size as usize;
    let mut bytes = match format {
        PixelFormat::None => {
            panic!("format None ships no per-tile records; use the error-only gather")
        }
        _ => TILE_HEADER_BYTES + format.bytes_per_pixel() * pixels,
    };
    if has_depth || has_normal || has_albedo {
        bytes += 4 * pixels;
    }
    if has_normal || has_albedo {
        bytes += 2 * 12 * pixels;
    }
    bytes
}

pub fn master_command(
    format: PixelFormat,
    has_depth: bool,
    has_normal: bool,
    has_albedo: bool,
) -> i32 {
    let mut command = match format {
        PixelFormat::None => {
            panic!("format None ships no per-tile records; use the error-only gather")
        }
        PixelFormat::Rgba8 | PixelFormat::Srgba => MASTER_WRITE_TILE_I8,
        PixelFormat::Rgbaf32 => MASTER_WRITE_TILE_F32,
    };
    if has_depth {
        command |= MASTER_TILE_HAS_DEPTH;
    }
    if has_normal || has_albedo {
        command |= MASTER_TILE_HAS_AUX;
    }
    command
}

fn read_i32(bytes: &[u8], offset: usize) -> i32 {
    i32::from_ne_bytes(bytes[offset..offset + 4].try_into().expect("4-byte read"))
}

fn read_f32(bytes: &[u8], offset: usize) -> f32 {
    f32::from_ne_bytes(bytes[offset..offset + 4].try_into().expect("4-byte read"))
}

fn read_f32_plane(bytes: &[u8], out: &mut Vec<f32>, pixels: usize) {
    out.clear();
    out.reserve(pixels);
    for chunk in bytes[..4 * pixels].chunks_exact(4) {
        out.push(f32::from_ne_bytes(chunk.try_into().expect("4-byte chunk")));
    }
}

/// Fills one master tile record in place, section by section. The target
/// slot is a fixed-stride slot of the gather buffer; the writer owns the
/// section offsets so callers cannot scribble across section boundaries.
pub struct MasterTileWriter<'a> {
    slot: &'a mut [u8],
    pixels: usize,
    color_bytes: usize,
    has_depth: bool,
    has_aux: bool,
}

impl<'a> MasterTileWriter<'a> {
    pub fn new(
        slot: &'a mut [u8],
        format: PixelFormat,
        has_depth: bool,
        has_normal: bool,
        has_albedo: bool,
        tile_size: u32,
        origin: Vec2i,
        error: f32,
    ) -> Self {
        let expected = wire_tile_bytes(format, has_depth, has_normal, has_albedo, tile_size);
        assert_eq!(
            slot.len(),
            expected,
            "master tile slot is {} bytes, record needs {expected}",
            slot.len()
        );
        let pixels = tile_size as usize * tile_size as usize;
        let command = master_command(format, has_depth, has_normal, has_albedo);
        slot[0..4].copy_from_slice(&command.to_ne_bytes());
        slot[4..8].copy_from_slice(&origin.x.to_ne_bytes());
        slot[8..12].copy_from_slice(&origin.y.to_ne_bytes());
        slot[12..16].copy_from_slice(&error.to_ne_bytes());
        Self {
            slot,
            pixels,
            color_bytes: format.bytes_per_pixel() * pixels,
            has_depth,
            has_aux: has_normal || has_albedo,
        }
    }

    pub fn set_color(&mut self, packed: &[u8]) {
        assert_eq!(
            packed.len(),
            self.color_bytes,
            "packed color is {} bytes, section needs {}",
            packed.len(),
            self.color_bytes
        );
        self.slot[TILE_HEADER_BYTES..TILE_HEADER_BYTES + self.color_bytes].copy_from_slice(packed);
    }

    pub fn set_depth(&mut self, depth: &[f32]) {
        if !self.has_depth {
            return;
        }
        assert_eq!(depth.len(), self.pixels, "depth plane sample count");
        let offset = TILE_HEADER_BYTES + self.color_bytes;
        self.slot[offset..offset + 4 * self.pixels]
            .copy_from_slice(bytemuck::cast_slice(depth));
    }

    pub fn set_normal(&mut self, nx: &[f32], ny: &[f32], nz: &[f32]) {
        if !self.has_aux {
            return;
        }
        let offset = TILE_HEADER_BYTES + self.color_bytes + 4 * self.pixels;
        self.write_vec3_plane(offset, nx, ny, nz);
    }

    pub fn set_albedo(&mut self, ar: &[f32], ag: &[f32], ab: &[f32]) {
        if !self.has_aux {
            return;
        }
        let offset = TILE_HEADER_BYTES + self.color_bytes + 4 * self.pixels + 12 * self.pixels;
        self.write_vec3_plane(offset, ar, ag, ab);
    }

    fn write_vec3_plane(&mut self, offset: usize, x: &[f32], y: &[f32], z: &[f32]) {
        assert!(
            x.len() == self.pixels && y.len() == self.pixels && z.len() == self.pixels,
            "vec3 plane sample count"
        );
        for i in 0..self.pixels {
            let at = offset + 12 * i;
            self.slot[at..at + 4].copy_from_slice(&x[i].to_ne_bytes());
            self.slot[at + 4..at + 8].copy_from_slice(&y[i].to_ne_bytes());
            self.slot[at + 8..at + 12].copy_from_slice(&z[i].to_ne_bytes());
        }
    }
}

/// Parsed view of one master tile record inside the gather result.
/// `depth`/`normal`/`albedo` are raw f32 bytes of their planes; normal and
/// albedo are interleaved xyz triplets.
#[derive(Debug)]
pub struct MasterTileRecord<'a> {
    pub command: i32,
    pub origin: Vec2i,
    pub error: f32,
    pub color: &'a [u8],
    pub depth: Option<&'a [u8]>,
    pub normal: Option<&'a [u8]>,
    pub albedo: Option<&'a [u8]>,
}

pub fn parse_master_tile(bytes: &[u8], tile_size: u32) -> Result<MasterTileRecord<'_>, WireError> {
    if bytes.len() < TILE_HEADER_BYTES {
        return Err(WireError::ShortMessage {
            expected: TILE_HEADER_BYTES,
            actual: bytes.len(),
        });
    }
    let command = read_i32(bytes, 0);
    let pixel_bytes = if command & MASTER_WRITE_TILE_I8 != 0 {
        4
    } else if command & MASTER_WRITE_TILE_F32 != 0 {
        16
    } else {
        return Err(WireError::UnknownCommand { command });
    };

    let pixels = tile_size as usize * tile_size as usize;
    let has_depth = command & MASTER_TILE_HAS_DEPTH != 0;
    let has_aux = command & MASTER_TILE_HAS_AUX != 0;
    let mut expected = TILE_HEADER_BYTES + pixel_bytes * pixels;
    if has_depth || has_aux {
        expected += 4 * pixels;
    }
    if has_aux {
        expected += 2 * 12 * pixels;
    }
    if bytes.len() < expected {
        return Err(WireError::ShortMessage {
            expected,
            actual: bytes.len(),
        });
    }

    let origin = Vec2i::new(read_i32(bytes, 4), read_i32(bytes, 8));
    let error = read_f32(bytes, 12);
    let color_end = TILE_HEADER_BYTES + pixel_bytes * pixels;
    let color = &bytes[TILE_HEADER_BYTES..color_end];

    let mut offset = color_end;
    let depth = if has_depth || has_aux {
        let plane = &bytes[offset..offset + 4 * pixels];
        offset += 4 * pixels;
        // the plane is reserved for aux layouts even when depth is off
        has_depth.then_some(plane)
    } else {
        None
    };
    let (normal, albedo) = if has_aux {
        let normal = &bytes[offset..offset + 12 * pixels];
        let albedo = &bytes[offset + 12 * pixels..offset + 24 * pixels];
        (Some(normal), Some(albedo))
    } else {
        (None, None)
    };

    Ok(MasterTileRecord {
        command,
        origin,
        error,
        color,
        depth,
        normal,
        albedo,
    })
}

/// First record field of any wire message.
pub fn peek_command(bytes: &[u8]) -> Result<i32, WireError> {
    if bytes.len() < 4 {
        return Err(WireError::ShortMessage {
            expected: 4,
            actual: bytes.len(),
        });
    }
    Ok(read_i32(bytes, 0))
}

/// Tile origin of a worker tile message, readable without a full decode.
pub fn peek_worker_origin(bytes: &[u8]) -> Result<Vec2i, WireError> {
    if bytes.len() < 12 {
        return Err(WireError::ShortMessage {
            expected: 12,
            actual: bytes.len(),
        });
    }
    Ok(Vec2i::new(read_i32(bytes, 4), read_i32(bytes, 8)))
}

pub fn encode_worker_tile(tile: &PixelTile) -> Vec<u8> {
    assert!(
        tile.planes_consistent(),
        "worker tile channel planes disagree on sample count"
    );
    let pixels = tile.pixels();
    let mut command = WORKER_WRITE_TILE;
    if tile.aux.is_some() {
        command |= MASTER_TILE_HAS_AUX;
    }

    let planes = if tile.aux.is_some() { 11 } else { 5 };
    let mut bytes = Vec::with_capacity(WORKER_HEADER_BYTES + planes * 4 * pixels);
    bytes.extend_from_slice(&command.to_ne_bytes());
    bytes.extend_from_slice(&tile.origin.x.to_ne_bytes());
    bytes.extend_from_slice(&tile.origin.y.to_ne_bytes());
    bytes.extend_from_slice(&tile.instance_id.to_ne_bytes());
    bytes.extend_from_slice(&tile.accum_id.to_ne_bytes());
    for plane in [&tile.r, &tile.g, &tile.b, &tile.a, &tile.z] {
        bytes.extend_from_slice(bytemuck::cast_slice(plane));
    }
    if let Some(aux) = &tile.aux {
        for plane in [&aux.nx, &aux.ny, &aux.nz, &aux.ar, &aux.ag, &aux.ab] {
            bytes.extend_from_slice(bytemuck::cast_slice(plane));
        }
    }
    bytes
}

pub fn decode_worker_tile(bytes: &[u8], pixels: usize) -> Result<PixelTile, WireError> {
    let command = peek_command(bytes)?;
    if command & WORKER_WRITE_TILE == 0 {
        return Err(WireError::UnknownCommand { command });
    }
    let has_aux = command & MASTER_TILE_HAS_AUX != 0;
    let planes = if has_aux { 11 } else { 5 };
    let expected = WORKER_HEADER_BYTES + planes * 4 * pixels;
    if bytes.len() != expected {
        return Err(WireError::ShortMessage {
            expected,
            actual: bytes.len(),
        });
    }

    let mut tile = PixelTile::zeroed(Vec2i::new(read_i32(bytes, 4), read_i32(bytes, 8)), 0);
    tile.instance_id = read_i32(bytes, 12);
    tile.accum_id = read_i32(bytes, 16);

    let mut offset = WORKER_HEADER_BYTES;
    let mut next_plane = |out: &mut Vec<f32>| {
        read_f32_plane(&bytes[offset..], out, pixels);
        offset += 4 * pixels;
    };
    next_plane(&mut tile.r);
    next_plane(&mut tile.g);
    next_plane(&mut tile.b);
    next_plane(&mut tile.a);
    next_plane(&mut tile.z);
    if has_aux {
        let mut aux = TileAux::zeroed(0);
        next_plane(&mut aux.nx);
        next_plane(&mut aux.ny);
        next_plane(&mut aux.nz);
        next_plane(&mut aux.ar);
        next_plane(&mut aux.ag);
        next_plane(&mut aux.ab);
        tile.aux = Some(aux);
    }
    Ok(tile)
}

pub fn encode_cancel() -> Vec<u8> {
    CANCEL_RENDERING.to_ne_bytes().to_vec()
}

/// Error-only gather payload of one rank: all tile coordinates first, then
/// all errors, both in completion order.
pub fn encode_error_records(ids: &[TileCoord], errors: &[f32]) -> Vec<u8> {
    assert_eq!(
        ids.len(),
        errors.len(),
        "pending tile ids and errors must stay aligned"
    );
    let mut bytes = Vec::with_capacity(ids.len() * ERROR_RECORD_BYTES);
    for id in ids {
        bytes.extend_from_slice(&(id.x as i32).to_ne_bytes());
        bytes.extend_from_slice(&(id.y as i32).to_ne_bytes());
    }
    bytes.extend_from_slice(bytemuck::cast_slice(errors));
    bytes
}

pub fn decode_error_records(bytes: &[u8], count: usize) -> Result<Vec<(TileCoord, f32)>, WireError> {
    let expected = count * ERROR_RECORD_BYTES;
    if bytes.len() < expected {
        return Err(WireError::ShortMessage {
            expected,
            actual: bytes.len(),
        });
    }
    let errors_at = count * 8;
    let mut records = Vec::with_capacity(count);
    for i in 0..count {
        let x = read_i32(bytes, 8 * i);
        let y = read_i32(bytes, 8 * i + 4);
        let error = read_f32(bytes, errors_at + 4 * i);
        records.push((TileCoord::new(x as u32, y as u32), error));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sizes_follow_the_layout_table() {
        // header 16 + 4 color bytes and 4 depth bytes per pixel
        assert_eq!(
            wire_tile_bytes(PixelFormat::Rgba8, true, false, false, 2),
            48
        );
        assert_eq!(
            wire_tile_bytes(PixelFormat::Rgba8, false, false, false, 2),
            32
        );
        assert_eq!(
            wire_tile_bytes(PixelFormat::Rgbaf32, false, false, false, 2),
            80
        );
        // aux reserves the depth plane even without a depth channel
        assert_eq!(
            wire_tile_bytes(PixelFormat::Rgba8, false, true, true, 2),
            32 + 16 + 2 * 48
        );
    }

    #[test]
    fn master_record_round_trips() {
        let tile_size = 2;
        let bytes_needed = wire_tile_bytes(PixelFormat::Rgba8, true, false, false, tile_size);
        let mut slot = vec![0u8; bytes_needed];
        let depth = [0.5f32, 1.0, 1.5, 2.0];
        {
            let mut writer = MasterTileWriter::new(
                &mut slot,
                PixelFormat::Rgba8,
                true,
                false,
                false,
                tile_size,
                Vec2i::new(2, 0),
                0.25,
            );
            writer.set_color(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16]);
            writer.set_depth(&depth);
        }

        let record = parse_master_tile(&slot, tile_size).expect("record should parse");
        assert_eq!(record.command, MASTER_WRITE_TILE_I8 | MASTER_TILE_HAS_DEPTH);
        assert_eq!(record.origin, Vec2i::new(2, 0));
        assert_eq!(record.error, 0.25);
        assert_eq!(record.color[0], 1);
        assert_eq!(record.color[15], 16);
        let depth_bytes = record.depth.expect("depth plane should be present");
        assert_eq!(depth_bytes, bytemuck::cast_slice::<f32, u8>(&depth));
        assert!(record.normal.is_none());
        assert!(record.albedo.is_none());
    }

    #[test]
    fn master_record_with_aux_reserves_depth_plane() {
        let tile_size = 2;
        let bytes_needed = wire_tile_bytes(PixelFormat::Rgbaf32, false, true, true, tile_size);
        let mut slot = vec![0u8; bytes_needed];
        {
            let mut writer = MasterTileWriter::new(
                &mut slot,
                PixelFormat::Rgbaf32,
                false,
                true,
                true,
                tile_size,
                Vec2i::new(0, 2),
                f32::INFINITY,
            );
            writer.set_color(&vec![0u8; 64]);
            writer.set_normal(&[1.0; 4], &[0.0; 4], &[0.0; 4]);
            writer.set_albedo(&[0.5; 4], &[0.5; 4], &[0.5; 4]);
        }

        let record = parse_master_tile(&slot, tile_size).expect("record should parse");
        assert_eq!(record.command, MASTER_WRITE_TILE_F32 | MASTER_TILE_HAS_AUX);
        assert!(record.depth.is_none());
        let normal = record.normal.expect("normal plane should be present");
        assert_eq!(&normal[0..4], &1.0f32.to_ne_bytes());
        assert!(record.error.is_infinite());
    }

    #[test]
    fn worker_tile_round_trips() {
        let mut tile = PixelTile::zeroed(Vec2i::new(2, 2), 4);
        tile.instance_id = 3;
        tile.accum_id = 7;
        tile.r.copy_from_slice(&[0.1, 0.2, 0.3, 0.4]);
        tile.z.copy_from_slice(&[0.5; 4]);
        tile.aux = Some(TileAux::zeroed(4));

        let bytes = encode_worker_tile(&tile);
        assert_eq!(
            peek_command(&bytes).expect("command should be readable"),
            WORKER_WRITE_TILE | MASTER_TILE_HAS_AUX
        );
        assert_eq!(
            peek_worker_origin(&bytes).expect("origin should be readable"),
            Vec2i::new(2, 2)
        );
        let decoded = decode_worker_tile(&bytes, 4).expect("tile should decode");
        assert_eq!(decoded, tile);
    }

    #[test]
    fn short_worker_tile_is_rejected() {
        let tile = PixelTile::zeroed(Vec2i::new(0, 0), 4);
        let mut bytes = encode_worker_tile(&tile);
        bytes.truncate(bytes.len() - 1);
        let err = decode_worker_tile(&bytes, 4).expect_err("truncated tile must not decode");
        assert!(matches!(err, WireError::ShortMessage { .. }));
    }

    #[test]
    fn error_records_round_trip() {
        let ids = [TileCoord::new(0, 0), TileCoord::new(2, 1)];
        let errors = [0.5, 0.125];
        let bytes = encode_error_records(&ids, &errors);
        assert_eq!(bytes.len(), 2 * ERROR_RECORD_BYTES);

        let records = decode_error_records(&bytes, 2).expect("records should decode");
        assert_eq!(records, vec![(ids[0], 0.5), (ids[1], 0.125)]);
    }

    #[test]
    fn cancel_message_is_command_only() {
        let bytes = encode_cancel();
        assert_eq!(
            peek_command(&bytes).expect("command should be readable"),
            CANCEL_RENDERING
        );
        assert_eq!(bytes.len(), 4);
    }
}
