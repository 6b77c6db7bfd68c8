//! Scalar accumulate / composite / finalize kernels.
//!
//! These are the CPU renditions of the renderer's SIMD write-out kernels:
//! accumulate a contribution into the running buffers, normalize into the
//! final tile, estimate the pixel error from the half-rate variance buffer,
//! and pack the final tile into the negotiated output format.

use model::{PixelFormat, PixelTile};

use crate::modes::OwnedTile;

#[derive(Debug, Clone, Copy)]
pub(crate) struct AccumContext {
    /// Completed accumulation passes before this frame.
    pub accum_id: i32,
    pub has_accum: bool,
    pub has_variance: bool,
}

/// Integrate the authoritative contribution of this frame into the owned
/// tile: update `accum` (and `variance` on odd passes), normalize into
/// `final_tile` and refresh the error estimate.
pub(crate) fn integrate(owned: &mut OwnedTile, tile: &PixelTile, ctx: AccumContext) {
    let pixels = owned.final_tile.r.len();
    assert_eq!(
        tile.pixels(),
        pixels,
        "contribution has {} samples, tile holds {pixels}",
        tile.pixels()
    );

    if !ctx.has_accum {
        owned.final_tile.r.copy_from_slice(&tile.r);
        owned.final_tile.g.copy_from_slice(&tile.g);
        owned.final_tile.b.copy_from_slice(&tile.b);
        owned.final_tile.a.copy_from_slice(&tile.a);
        owned.final_tile.z.copy_from_slice(&tile.z);
        owned.error = f32::INFINITY;
        copy_aux(owned, tile);
        return;
    }

    let first_pass = ctx.accum_id == 0;
    accumulate_channels(&mut owned.accum, tile, first_pass);
    for i in 0..pixels {
        owned.accum.z[i] = owned.accum.z[i].min(tile.z[i]);
    }

    let rcp = 1.0 / (ctx.accum_id + 1) as f32;
    for i in 0..pixels {
        owned.final_tile.r[i] = owned.accum.r[i] * rcp;
        owned.final_tile.g[i] = owned.accum.g[i] * rcp;
        owned.final_tile.b[i] = owned.accum.b[i] * rcp;
        owned.final_tile.a[i] = owned.accum.a[i] * rcp;
    }
    // depth converges to the nearest z seen across all passes, not the
    // latest pass
    owned.final_tile.z.copy_from_slice(&owned.accum.z);
    copy_aux(owned, tile);

    if ctx.has_variance {
        if ctx.accum_id % 2 == 1 {
            let variance = owned
                .variance
                .as_mut()
                .expect("variance buffer missing on a variance-tracking tile");
            accumulate_channels(variance, tile, ctx.accum_id == 1);
        }
        let error = estimate_error(owned, ctx.accum_id);
        owned.error = error;
    } else {
        owned.error = f32::INFINITY;
    }
}

fn accumulate_channels(
    target: &mut crate::modes::ChannelTile,
    tile: &PixelTile,
    overwrite: bool,
) {
    if overwrite {
        target.r.copy_from_slice(&tile.r);
        target.g.copy_from_slice(&tile.g);
        target.b.copy_from_slice(&tile.b);
        target.a.copy_from_slice(&tile.a);
    } else {
        for i in 0..tile.pixels() {
            target.r[i] += tile.r[i];
            target.g[i] += tile.g[i];
            target.b[i] += tile.b[i];
            target.a[i] += tile.a[i];
        }
    }
}

fn copy_aux(owned: &mut OwnedTile, tile: &PixelTile) {
    let (Some(planes), Some(aux)) = (&mut owned.final_tile.aux, &tile.aux) else {
        return;
    };
    planes.nx.copy_from_slice(&aux.nx);
    planes.ny.copy_from_slice(&aux.ny);
    planes.nz.copy_from_slice(&aux.nz);
    planes.ar.copy_from_slice(&aux.ar);
    planes.ag.copy_from_slice(&aux.ag);
    planes.ab.copy_from_slice(&aux.ab);
}

/// Mean relative L1 distance between the full-rate estimate and the
/// half-rate variance estimate, over RGB. Unknown until the variance
/// buffer has at least one pass.
fn estimate_error(owned: &OwnedTile, accum_id: i32) -> f32 {
    let variance_passes = (accum_id + 1) / 2;
    if variance_passes < 1 {
        return f32::INFINITY;
    }
    let variance = owned
        .variance
        .as_ref()
        .expect("variance buffer missing on a variance-tracking tile");

    let full_rcp = 1.0 / (accum_id + 1) as f32;
    let half_rcp = 1.0 / variance_passes as f32;
    let pixels = owned.final_tile.r.len();
    let mut sum = 0.0f32;
    for i in 0..pixels {
        let fr = owned.accum.r[i] * full_rcp;
        let fg = owned.accum.g[i] * full_rcp;
        let fb = owned.accum.b[i] * full_rcp;
        let vr = variance.r[i] * half_rcp;
        let vg = variance.g[i] * half_rcp;
        let vb = variance.b[i] * half_rcp;
        let num = (fr - vr).abs() + (fg - vg).abs() + (fb - vb).abs();
        let den = (fr + vr).abs() + (fg + vg).abs() + (fb + vb).abs();
        if den > 1e-6 {
            sum += num / den;
        }
    }
    sum / pixels as f32
}

/// Sort fragments back-to-front-stable by depth and composite them
/// front-to-back with the premultiplied *under* operator. Arrival order
/// breaks depth ties.
pub(crate) fn blend_fragments(mut fragments: Vec<PixelTile>) -> PixelTile {
    assert!(!fragments.is_empty(), "cannot blend zero fragments");
    fragments.sort_by(|a, b| {
        fragment_depth(a)
            .partial_cmp(&fragment_depth(b))
            .expect("fragment depths must not be NaN")
    });

    let pixels = fragments[0].pixels();
    let mut out = fragments[0].clone();
    for fragment in fragments.iter().skip(1) {
        for i in 0..pixels {
            let transmission = 1.0 - out.a[i];
            out.r[i] += transmission * fragment.r[i];
            out.g[i] += transmission * fragment.g[i];
            out.b[i] += transmission * fragment.b[i];
            out.a[i] += transmission * fragment.a[i];
            out.z[i] = out.z[i].min(fragment.z[i]);
        }
    }
    out
}

/// Contributions carry a uniform depth plane; the first sample stands in
/// for the whole fragment when ordering.
fn fragment_depth(fragment: &PixelTile) -> f32 {
    fragment.z.first().copied().unwrap_or(f32::INFINITY)
}

/// Per-pixel nearest-z reduction, the commutative kernel of the
/// z-composite mode. Strictly nearer wins; on a z tie the incumbent keeps
/// all of its channels, so color and aux always come from one
/// contribution.
pub(crate) fn z_reduce(into: &mut PixelTile, from: &PixelTile) {
    for i in 0..into.pixels() {
        let from_wins = from.z[i] < into.z[i];
        if !from_wins {
            continue;
        }
        into.r[i] = from.r[i];
        into.g[i] = from.g[i];
        into.b[i] = from.b[i];
        into.a[i] = from.a[i];
        into.z[i] = from.z[i];
        if let (Some(into_aux), Some(from_aux)) = (&mut into.aux, &from.aux) {
            into_aux.nx[i] = from_aux.nx[i];
            into_aux.ny[i] = from_aux.ny[i];
            into_aux.nz[i] = from_aux.nz[i];
            into_aux.ar[i] = from_aux.ar[i];
            into_aux.ag[i] = from_aux.ag[i];
            into_aux.ab[i] = from_aux.ab[i];
        }
    }
}

/// Pack the final tile into the negotiated output format.
pub(crate) fn pack_color(tile: &crate::modes::FinalTile, format: PixelFormat, out: &mut Vec<u8>) {
    let pixels = tile.r.len();
    out.clear();
    match format {
        PixelFormat::None => {}
        PixelFormat::Rgba8 => {
            out.reserve(4 * pixels);
            for i in 0..pixels {
                out.push(quantize(tile.r[i]));
                out.push(quantize(tile.g[i]));
                out.push(quantize(tile.b[i]));
                out.push(quantize(tile.a[i]));
            }
        }
        PixelFormat::Srgba => {
            out.reserve(4 * pixels);
            for i in 0..pixels {
                out.push(quantize(srgb_encode(tile.r[i])));
                out.push(quantize(srgb_encode(tile.g[i])));
                out.push(quantize(srgb_encode(tile.b[i])));
                out.push(quantize(tile.a[i]));
            }
        }
        PixelFormat::Rgbaf32 => {
            out.reserve(16 * pixels);
            for i in 0..pixels {
                out.extend_from_slice(&tile.r[i].to_ne_bytes());
                out.extend_from_slice(&tile.g[i].to_ne_bytes());
                out.extend_from_slice(&tile.b[i].to_ne_bytes());
                out.extend_from_slice(&tile.a[i].to_ne_bytes());
            }
        }
    }
}

fn quantize(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0 + 0.5) as u8
}

fn srgb_encode(linear: f32) -> f32 {
    let v = linear.clamp(0.0, 1.0);
    if v <= 0.003_130_8 {
        v * 12.92
    } else {
        1.055 * v.powf(1.0 / 2.4) - 0.055
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{FrameMode, TileAux, Vec2i};

    fn owned_with_variance(pixels: usize) -> OwnedTile {
        OwnedTile::new(
            FrameMode::WriteMultiple,
            Vec2i::new(0, 0),
            0,
            pixels,
            true,
            false,
            0,
        )
    }

    fn constant_tile(value: f32, pixels: usize) -> PixelTile {
        let mut tile = PixelTile::zeroed(Vec2i::new(0, 0), pixels);
        tile.r.fill(value);
        tile.g.fill(value);
        tile.b.fill(value);
        tile.a.fill(1.0);
        tile.z.fill(1.0);
        tile
    }

    #[test]
    fn accumulation_averages_across_passes() {
        let mut owned = owned_with_variance(4);
        integrate(
            &mut owned,
            &constant_tile(1.0, 4),
            AccumContext {
                accum_id: 0,
                has_accum: true,
                has_variance: true,
            },
        );
        assert_eq!(owned.final_tile.r[0], 1.0);
        assert!(owned.error.is_infinite());

        integrate(
            &mut owned,
            &constant_tile(0.0, 4),
            AccumContext {
                accum_id: 1,
                has_accum: true,
                has_variance: true,
            },
        );
        assert_eq!(owned.final_tile.r[0], 0.5);
        assert!(owned.error.is_finite());
    }

    #[test]
    fn constant_samples_converge_to_zero_error() {
        let mut owned = owned_with_variance(4);
        for pass in 0..2 {
            integrate(
                &mut owned,
                &constant_tile(0.25, 4),
                AccumContext {
                    accum_id: pass,
                    has_accum: true,
                    has_variance: true,
                },
            );
        }
        // full-rate and half-rate estimates agree exactly
        assert_eq!(owned.error, 0.0);
    }

    #[test]
    fn without_accum_the_contribution_is_final() {
        let mut owned = OwnedTile::new(
            FrameMode::WriteMultiple,
            Vec2i::new(0, 0),
            0,
            4,
            false,
            false,
            0,
        );
        integrate(
            &mut owned,
            &constant_tile(0.75, 4),
            AccumContext {
                accum_id: 5,
                has_accum: false,
                has_variance: false,
            },
        );
        assert_eq!(owned.final_tile.r[0], 0.75);
        assert!(owned.error.is_infinite());
    }

    fn aux_tile(value: f32, z: &[f32]) -> PixelTile {
        let pixels = z.len();
        let mut tile = PixelTile::zeroed(Vec2i::new(0, 0), pixels);
        tile.r.fill(value);
        tile.g.fill(value);
        tile.b.fill(value);
        tile.a.fill(1.0);
        tile.z.copy_from_slice(z);
        let mut aux = TileAux::zeroed(pixels);
        aux.nx.fill(value);
        aux.ar.fill(value);
        tile.aux = Some(aux);
        tile
    }

    #[test]
    fn z_reduce_keeps_channels_paired_on_a_depth_tie() {
        // pixel 0: a is strictly nearer; pixel 1: exact z tie
        let a = aux_tile(0.25, &[0.25, 0.5]);
        let b = aux_tile(0.75, &[0.75, 0.5]);

        let mut ab = a.clone();
        z_reduce(&mut ab, &b);
        let mut ba = b.clone();
        z_reduce(&mut ba, &a);

        // the nearer contribution wins pixel 0 in both orders, aux included
        assert_eq!(ab.r[0], 0.25);
        assert_eq!(ba.r[0], 0.25);
        assert_eq!(ab.aux.as_ref().expect("aux planes").nx[0], 0.25);
        assert_eq!(ba.aux.as_ref().expect("aux planes").nx[0], 0.25);

        // on the tie the incumbent survives whole: its aux must stay
        // paired with its color instead of leaking in from the other side
        assert_eq!(ab.r[1], 0.25);
        assert_eq!(ab.aux.as_ref().expect("aux planes").nx[1], 0.25);
        assert_eq!(ab.aux.as_ref().expect("aux planes").ar[1], 0.25);
        assert_eq!(ba.r[1], 0.75);
        assert_eq!(ba.aux.as_ref().expect("aux planes").nx[1], 0.75);
        assert_eq!(ba.aux.as_ref().expect("aux planes").ar[1], 0.75);
    }

    #[test]
    fn accumulated_depth_tracks_the_nearest_pass() {
        let mut owned = OwnedTile::new(
            FrameMode::WriteMultiple,
            Vec2i::new(0, 0),
            0,
            4,
            false,
            false,
            0,
        );
        let pass_depths = [0.8f32, 0.4, 0.6];
        let expected_nearest = [0.8f32, 0.4, 0.4];
        for (pass, (&z, &nearest)) in pass_depths.iter().zip(&expected_nearest).enumerate() {
            let mut tile = constant_tile(0.5, 4);
            tile.z.fill(z);
            integrate(
                &mut owned,
                &tile,
                AccumContext {
                    accum_id: pass as i32,
                    has_accum: true,
                    has_variance: false,
                },
            );
            assert_eq!(
                owned.final_tile.z[0], nearest,
                "pass {pass} must report the nearest z so far"
            );
        }
    }

    #[test]
    fn rgba8_packing_rounds_and_clamps() {
        let mut owned = OwnedTile::new(
            FrameMode::WriteMultiple,
            Vec2i::new(0, 0),
            0,
            2,
            false,
            false,
            0,
        );
        owned.final_tile.r = vec![0.5, 2.0].into_boxed_slice();
        owned.final_tile.g = vec![0.0, -1.0].into_boxed_slice();
        owned.final_tile.b = vec![1.0, 0.25].into_boxed_slice();
        owned.final_tile.a = vec![1.0, 1.0].into_boxed_slice();

        let mut packed = Vec::new();
        pack_color(&owned.final_tile, PixelFormat::Rgba8, &mut packed);
        assert_eq!(packed, vec![128, 0, 255, 255, 255, 0, 64, 255]);
    }

    #[test]
    fn srgb_packing_brightens_midtones() {
        let mut owned = OwnedTile::new(
            FrameMode::WriteMultiple,
            Vec2i::new(0, 0),
            0,
            1,
            false,
            false,
            0,
        );
        owned.final_tile.r = vec![0.5].into_boxed_slice();
        owned.final_tile.g = vec![0.5].into_boxed_slice();
        owned.final_tile.b = vec![0.5].into_boxed_slice();
        owned.final_tile.a = vec![0.5].into_boxed_slice();

        let mut packed = Vec::new();
        pack_color(&owned.final_tile, PixelFormat::Srgba, &mut packed);
        // sRGB(0.5) is roughly 0.7354; alpha stays linear
        assert_eq!(packed[0], 188);
        assert_eq!(packed[3], 128);
    }

    #[test]
    fn f32_packing_preserves_bit_patterns() {
        let mut owned = OwnedTile::new(
            FrameMode::WriteMultiple,
            Vec2i::new(0, 0),
            0,
            1,
            false,
            false,
            0,
        );
        owned.final_tile.r = vec![1.5].into_boxed_slice();
        owned.final_tile.g = vec![-0.25].into_boxed_slice();
        owned.final_tile.b = vec![0.0].into_boxed_slice();
        owned.final_tile.a = vec![1.0].into_boxed_slice();

        let mut packed = Vec::new();
        pack_color(&owned.final_tile, PixelFormat::Rgbaf32, &mut packed);
        assert_eq!(packed.len(), 16);
        let values: &[f32] = bytemuck::cast_slice(&packed);
        assert_eq!(values, &[1.5, -0.25, 0.0, 1.0]);
    }
}
