use rand::Rng;

use crate::normalize::{box_blur, LineImage, BACKGROUND};

/// Default bounds used by the affine mode.
pub const MAX_STRETCH: f32 = 0.4;
pub const MAX_SKEW_RAD: f32 = 45.0 / 180.0 * std::f32::consts::PI;

/// Per-fetch affine draw. The stretch is drawn once and later re-capped
/// against the width budget of the image it is applied to.
#[derive(Debug, Clone, Copy)]
pub struct AffineParams {
    pub skew: f32,
    pub stretch: f32,
}

impl AffineParams {
    pub fn draw<R: Rng + ?Sized>(rng: &mut R, max_stretch: f32, max_skew: f32) -> Self {
        let stretch = (max_stretch * 2.0) * rng.gen::<f32>() - max_stretch + 1.0;
        let skew = (max_skew * 2.0) * rng.gen::<f32>() - max_skew;
        Self { skew, stretch }
    }

    /// Caps the stretch so `width * stretch` stays within `max_width`.
    pub fn cap_stretch(&mut self, width: usize, max_width: usize) {
        if width as f32 * self.stretch > max_width as f32 {
            self.stretch = max_width as f32 / width as f32;
        }
    }
}

/// Horizontal shear plus stretch, sampled bilinearly with background fill.
/// The foreground mask, when present, is transformed in lockstep (zero fill).
pub fn affine_trans(
    img: &LineImage,
    fg_mask: Option<&LineImage>,
    params: AffineParams,
) -> (LineImage, Option<LineImage>) {
    let new_width = ((img.width as f32 * params.stretch).round() as usize).max(1);
    let shear = params.skew.tan();
    let cy = img.height as f32 / 2.0;

    let warp = |src: &LineImage, fill: f32| {
        let mut out = LineImage::filled(img.height, new_width, fill);
        for y in 0..img.height {
            let offset = shear * (y as f32 - cy);
            for x in 0..new_width {
                let src_x = x as f32 / params.stretch + offset;
                out.set(y, x, src.sample(y as f32, src_x, fill));
            }
        }
        out
    };

    let warped = warp(img, BACKGROUND);
    let warped_mask = fg_mask.map(|mask| warp(mask, 0.0));
    (warped, warped_mask)
}

/// Random global brightness shift of the ink and background, clipped to the
/// valid range.
pub fn brightness_jitter<R: Rng + ?Sized>(img: &mut LineImage, rng: &mut R) {
    let shift: f32 = rng.gen_range(-30.0..30.0);
    for v in &mut img.data {
        *v = (*v + shift).clamp(0.0, 255.0);
    }
}

/// Elastic grid warp: a coarse lattice of random offsets, bilinearly
/// interpolated to per-pixel displacements.
pub fn grid_warp<R: Rng + ?Sized>(img: &LineImage, rng: &mut R) -> LineImage {
    const CELL: usize = 16;
    const SIGMA: f32 = 2.5;

    let grid_h = img.height / CELL + 2;
    let grid_w = img.width / CELL + 2;
    let mut dx = vec![0.0f32; grid_h * grid_w];
    let mut dy = vec![0.0f32; grid_h * grid_w];
    for i in 0..grid_h * grid_w {
        dx[i] = rng.gen_range(-SIGMA..SIGMA);
        dy[i] = rng.gen_range(-SIGMA..SIGMA);
    }

    let lookup = |table: &[f32], y: f32, x: f32| -> f32 {
        let gy = (y / CELL as f32).min((grid_h - 2) as f32);
        let gx = (x / CELL as f32).min((grid_w - 2) as f32);
        let y0 = gy.floor() as usize;
        let x0 = gx.floor() as usize;
        let fy = gy - y0 as f32;
        let fx = gx - x0 as f32;
        let at = |yy: usize, xx: usize| table[yy * grid_w + xx];
        let top = at(y0, x0) * (1.0 - fx) + at(y0, x0 + 1) * fx;
        let bottom = at(y0 + 1, x0) * (1.0 - fx) + at(y0 + 1, x0 + 1) * fx;
        top * (1.0 - fy) + bottom * fy
    };

    let mut out = LineImage::filled(img.height, img.width, BACKGROUND);
    for y in 0..img.height {
        for x in 0..img.width {
            let yf = y as f32;
            let xf = x as f32;
            let src_y = yf + lookup(&dy, yf, xf);
            let src_x = xf + lookup(&dx, yf, xf);
            out.set(y, x, img.sample(src_y, src_x, BACKGROUND));
        }
    }
    out
}

/// Parameters for the stroke-thickness view, drawn once per fetch.
#[derive(Debug, Clone, Copy)]
pub struct StrokeParams {
    pub thickness_change: i32,
    pub fg_shade: f32,
    pub bg_shade: f32,
    pub blur_size: usize,
    pub noise_sigma: f32,
}

impl StrokeParams {
    pub fn draw<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            thickness_change: rng.gen_range(-4..5),
            fg_shade: rng.gen::<f32>() * 0.25 + 0.75,
            bg_shade: rng.gen::<f32>() * 0.2,
            blur_size: rng.gen_range(2..4),
            noise_sigma: rng.gen::<f32>() * 0.02,
        }
    }
}

/// Produces the "changed" training view: strokes thickened or thinned, ink
/// and background re-shaded, blurred and noised. Output is mapped to
/// `[-1, 1]`.
pub fn change_thickness<R: Rng + ?Sized>(
    img: &LineImage,
    params: StrokeParams,
    rng: &mut R,
) -> LineImage {
    let mut ink: Vec<u8> = img.data.iter().map(|&v| u8::from(v < 128.0)).collect();
    let steps = params.thickness_change.unsigned_abs() as usize;
    for _ in 0..steps {
        ink = if params.thickness_change > 0 {
            morph_3x3(&ink, img.height, img.width, true)
        } else {
            morph_3x3(&ink, img.height, img.width, false)
        };
    }

    let mut composed = LineImage::filled(img.height, img.width, 0.0);
    for (i, &is_ink) in ink.iter().enumerate() {
        composed.data[i] = if is_ink == 1 {
            params.fg_shade
        } else {
            params.bg_shade
        };
    }

    let mut blurred = box_blur(&composed, params.blur_size);
    for v in &mut blurred.data {
        let noise: f32 = sample_gaussian(rng) * params.noise_sigma;
        let value = (*v + noise).clamp(0.0, 1.0);
        *v = value * 2.0 - 1.0;
    }
    blurred
}

fn morph_3x3(ink: &[u8], height: usize, width: usize, dilate: bool) -> Vec<u8> {
    let mut out = vec![0u8; ink.len()];
    for y in 0..height {
        for x in 0..width {
            let mut any = false;
            let mut all = true;
            for dy in -1i32..=1 {
                for dx in -1i32..=1 {
                    let sy = y as i32 + dy;
                    let sx = x as i32 + dx;
                    let v = if sy < 0 || sx < 0 || sy >= height as i32 || sx >= width as i32 {
                        0
                    } else {
                        ink[sy as usize * width + sx as usize]
                    };
                    any |= v == 1;
                    all &= v == 1;
                }
            }
            out[y * width + x] = u8::from(if dilate { any } else { all });
        }
    }
    out
}

/// Box-Muller draw from a unit normal.
fn sample_gaussian<R: Rng + ?Sized>(rng: &mut R) -> f32 {
    let u1: f32 = rng.gen::<f32>().max(f32::MIN_POSITIVE);
    let u2: f32 = rng.gen::<f32>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn stripe() -> LineImage {
        let mut img = LineImage::filled(32, 64, BACKGROUND);
        for x in 0..64 {
            img.set(16, x, 0.0);
        }
        img
    }

    #[test]
    fn affine_respects_width_budget() {
        let img = stripe();
        let mut params = AffineParams {
            skew: 0.2,
            stretch: 1.4,
        };
        params.cap_stretch(img.width, 70);
        let (out, _) = affine_trans(&img, None, params);
        assert!(out.width <= 70);
        assert_eq!(out.height, img.height);
    }

    #[test]
    fn affine_transforms_mask_in_lockstep() {
        let img = stripe();
        let mask = LineImage::filled(32, 64, 1.0);
        let params = AffineParams {
            skew: 0.0,
            stretch: 1.0,
        };
        let (out, out_mask) = affine_trans(&img, Some(&mask), params);
        let out_mask = out_mask.unwrap();
        assert_eq!(out_mask.width, out.width);
        assert_eq!(out_mask.height, out.height);
    }

    #[test]
    fn grid_warp_preserves_shape() {
        let img = stripe();
        let mut rng = StdRng::seed_from_u64(7);
        let out = grid_warp(&img, &mut rng);
        assert_eq!(out.width, img.width);
        assert_eq!(out.height, img.height);
    }

    #[test]
    fn changed_view_stays_in_range() {
        let img = stripe();
        let mut rng = StdRng::seed_from_u64(11);
        let params = StrokeParams::draw(&mut rng);
        let out = change_thickness(&img, params, &mut rng);
        for v in &out.data {
            assert!(*v >= -1.0 && *v <= 1.0);
        }
    }
}
