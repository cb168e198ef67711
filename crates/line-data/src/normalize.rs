use std::path::Path;

use image::imageops::FilterType;

use crate::DataError;

/// White background level for grayscale line scans.
pub const BACKGROUND: f32 = 255.0;

/// Grayscale line image with pixel values in `[0, 255]` until remapping.
///
/// Row-major `Vec<f32>` storage, the layout used throughout the augmentation
/// and collation paths.
#[derive(Debug, Clone, PartialEq)]
pub struct LineImage {
    pub height: usize,
    pub width: usize,
    pub data: Vec<f32>,
}

impl LineImage {
    pub fn filled(height: usize, width: usize, value: f32) -> Self {
        Self {
            height,
            width,
            data: vec![value; height * width],
        }
    }

    pub fn open_grayscale(path: &Path) -> Result<Self, DataError> {
        let img = image::open(path)
            .map_err(|err| DataError::image(format!("{}: {}", path.display(), err)))?
            .into_luma8();
        Ok(Self::from_luma8(&img))
    }

    pub fn from_luma8(img: &image::GrayImage) -> Self {
        let (width, height) = img.dimensions();
        let data = img.pixels().map(|p| p.0[0] as f32).collect();
        Self {
            height: height as usize,
            width: width as usize,
            data,
        }
    }

    pub fn to_luma8(&self) -> image::GrayImage {
        let mut out = image::GrayImage::new(self.width as u32, self.height as u32);
        for (i, pixel) in out.pixels_mut().enumerate() {
            pixel.0[0] = self.data[i].clamp(0.0, 255.0).round() as u8;
        }
        out
    }

    #[inline]
    pub fn get(&self, y: usize, x: usize) -> f32 {
        self.data[y * self.width + x]
    }

    #[inline]
    pub fn set(&mut self, y: usize, x: usize, value: f32) {
        self.data[y * self.width + x] = value;
    }

    /// Bilinear sample at fractional coordinates; out-of-bounds reads return
    /// `fill`.
    pub fn sample(&self, y: f32, x: f32, fill: f32) -> f32 {
        if y < 0.0 || x < 0.0 || y > (self.height - 1) as f32 || x > (self.width - 1) as f32 {
            return fill;
        }
        let y0 = y.floor() as usize;
        let x0 = x.floor() as usize;
        let y1 = (y0 + 1).min(self.height - 1);
        let x1 = (x0 + 1).min(self.width - 1);
        let fy = y - y0 as f32;
        let fx = x - x0 as f32;
        let top = self.get(y0, x0) * (1.0 - fx) + self.get(y0, x1) * fx;
        let bottom = self.get(y1, x0) * (1.0 - fx) + self.get(y1, x1) * fx;
        top * (1.0 - fy) + bottom * fy
    }
}

/// Uniform rescale by `scale` on both axes using the image crate's cubic
/// filter.
pub fn rescale(img: &LineImage, scale: f32) -> LineImage {
    let new_width = ((img.width as f32 * scale).round() as u32).max(1);
    let new_height = ((img.height as f32 * scale).round() as u32).max(1);
    let resized = image::imageops::resize(
        &img.to_luma8(),
        new_width,
        new_height,
        FilterType::CatmullRom,
    );
    LineImage::from_luma8(&resized)
}

/// Outcome of height normalization; `upsampled` drives the dataset's
/// one-shot diagnostic.
pub struct NormalizedLine {
    pub image: LineImage,
    pub upsampled: bool,
}

/// Scales a line to `target_height`, capping the scale so the width never
/// exceeds `max_width`. When the cap makes the height undershoot, the image
/// is padded symmetrically with background, extra row on the bottom.
pub fn normalize_height(img: LineImage, target_height: usize, max_width: usize) -> NormalizedLine {
    let upsampled = img.height < target_height;
    if img.height != target_height {
        let mut scale = target_height as f32 / img.height as f32;
        if img.width as f32 * scale > max_width as f32 {
            scale = max_width as f32 / img.width as f32;
        }
        let scaled = rescale(&img, scale);
        NormalizedLine {
            image: pad_height_symmetric(scaled, target_height),
            upsampled,
        }
    } else if img.width > max_width {
        let scale = max_width as f32 / img.width as f32;
        let scaled = rescale(&img, scale);
        NormalizedLine {
            image: pad_height_symmetric(scaled, target_height),
            upsampled: false,
        }
    } else {
        NormalizedLine {
            image: img,
            upsampled: false,
        }
    }
}

fn pad_height_symmetric(img: LineImage, target_height: usize) -> LineImage {
    if img.height >= target_height {
        return img;
    }
    let diff = target_height - img.height;
    let top = diff / 2;
    let mut out = LineImage::filled(target_height, img.width, BACKGROUND);
    for y in 0..img.height {
        for x in 0..img.width {
            out.set(top + y, x, img.get(y, x));
        }
    }
    out
}

/// Moment-based slant removal: shears the ink so that vertical strokes stand
/// upright.
pub fn deskew(img: &LineImage) -> LineImage {
    let mut sum = 0.0f64;
    let mut sum_x = 0.0f64;
    let mut sum_y = 0.0f64;
    for y in 0..img.height {
        for x in 0..img.width {
            let ink = (BACKGROUND - img.get(y, x)) as f64;
            sum += ink;
            sum_x += ink * x as f64;
            sum_y += ink * y as f64;
        }
    }
    if sum <= f64::EPSILON {
        return img.clone();
    }
    let cx = sum_x / sum;
    let cy = sum_y / sum;

    let mut mu11 = 0.0f64;
    let mut mu02 = 0.0f64;
    for y in 0..img.height {
        for x in 0..img.width {
            let ink = (BACKGROUND - img.get(y, x)) as f64;
            let dx = x as f64 - cx;
            let dy = y as f64 - cy;
            mu11 += ink * dx * dy;
            mu02 += ink * dy * dy;
        }
    }
    if mu02.abs() <= f64::EPSILON {
        return img.clone();
    }
    let shear = (mu11 / mu02) as f32;

    let mut out = LineImage::filled(img.height, img.width, BACKGROUND);
    for y in 0..img.height {
        let offset = shear * (y as f32 - cy as f32);
        for x in 0..img.width {
            let src_x = x as f32 + offset;
            out.set(y, x, img.sample(y as f32, src_x, BACKGROUND));
        }
    }
    out
}

/// Zhang-Suen thinning of the ink strokes down to one-pixel skeletons.
pub fn skeletonize(img: &LineImage) -> LineImage {
    let h = img.height;
    let w = img.width;
    // ink = 1, background = 0
    let mut grid: Vec<u8> = img.data.iter().map(|&v| u8::from(v < 128.0)).collect();

    let idx = |y: usize, x: usize| y * w + x;
    let mut changed = true;
    while changed {
        changed = false;
        for pass in 0..2 {
            let mut to_clear = Vec::new();
            for y in 1..h.saturating_sub(1) {
                for x in 1..w.saturating_sub(1) {
                    if grid[idx(y, x)] == 0 {
                        continue;
                    }
                    let p = [
                        grid[idx(y - 1, x)],
                        grid[idx(y - 1, x + 1)],
                        grid[idx(y, x + 1)],
                        grid[idx(y + 1, x + 1)],
                        grid[idx(y + 1, x)],
                        grid[idx(y + 1, x - 1)],
                        grid[idx(y, x - 1)],
                        grid[idx(y - 1, x - 1)],
                    ];
                    let neighbors: u8 = p.iter().sum();
                    if !(2..=6).contains(&neighbors) {
                        continue;
                    }
                    let transitions = (0..8)
                        .filter(|&i| p[i] == 0 && p[(i + 1) % 8] == 1)
                        .count();
                    if transitions != 1 {
                        continue;
                    }
                    let (a, b) = if pass == 0 {
                        (p[0] * p[2] * p[4], p[2] * p[4] * p[6])
                    } else {
                        (p[0] * p[2] * p[6], p[0] * p[4] * p[6])
                    };
                    if a == 0 && b == 0 {
                        to_clear.push(idx(y, x));
                    }
                }
            }
            if !to_clear.is_empty() {
                changed = true;
                for i in to_clear {
                    grid[i] = 0;
                }
            }
        }
    }

    let data = grid
        .into_iter()
        .map(|ink| if ink == 1 { 0.0 } else { BACKGROUND })
        .collect();
    LineImage {
        height: h,
        width: w,
        data,
    }
}

/// Box blur with a `k`×`k` kernel, edge-clamped.
pub fn box_blur(img: &LineImage, k: usize) -> LineImage {
    let radius = (k / 2) as isize;
    let mut out = LineImage::filled(img.height, img.width, 0.0);
    for y in 0..img.height {
        for x in 0..img.width {
            let mut acc = 0.0f32;
            let mut count = 0.0f32;
            for dy in -radius..=radius {
                for dx in -radius..=radius {
                    let sy = y as isize + dy;
                    let sx = x as isize + dx;
                    if sy < 0 || sx < 0 || sy >= img.height as isize || sx >= img.width as isize {
                        continue;
                    }
                    acc += img.get(sy as usize, sx as usize);
                    count += 1.0;
                }
            }
            out.set(y, x, acc / count);
        }
    }
    out
}

/// Fixed linear remap into roughly `[-1, 1]` without masking.
pub fn remap_plain(img: &mut LineImage) {
    for v in &mut img.data {
        *v = 1.0 - *v / 128.0;
    }
}

/// Background-removal remap: invert-and-normalize, multiply by the blurred
/// foreground mask, then map into `[-1, 1]`.
pub fn remap_remove_bg(img: &mut LineImage, fg_mask: &LineImage) {
    let blurred = box_blur(fg_mask, 7);
    for y in 0..img.height {
        for x in 0..img.width {
            let v = 1.0 - img.get(y, x) / 256.0;
            let masked = v * blurred.get(y, x);
            img.set(y, x, 2.0 * masked - 1.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(height: usize, width: usize) -> LineImage {
        let data = (0..height * width).map(|i| (i % 251) as f32).collect();
        LineImage {
            height,
            width,
            data,
        }
    }

    #[test]
    fn normalize_hits_target_height() {
        let img = ramp(100, 600);
        let out = normalize_height(img, 64, 3000);
        assert_eq!(out.image.height, 64);
        assert!(out.image.width <= 3000);
        assert!(!out.upsampled);
    }

    #[test]
    fn width_cap_forces_height_padding() {
        // scaling 20 -> 64 would triple the width past the cap
        let img = ramp(20, 1500);
        let out = normalize_height(img, 64, 2000);
        assert_eq!(out.image.height, 64);
        assert!(out.image.width <= 2000);
        assert!(out.upsampled);
    }

    #[test]
    fn wide_image_at_target_height_is_downscaled_and_padded() {
        let img = ramp(64, 4000);
        let out = normalize_height(img, 64, 3000);
        assert_eq!(out.image.height, 64);
        assert!(out.image.width <= 3000);
    }

    #[test]
    fn odd_padding_favors_bottom() {
        let img = LineImage::filled(3, 4, 0.0);
        let padded = pad_height_symmetric(img, 6);
        // diff = 3: one row on top, two on the bottom
        assert_eq!(padded.get(0, 0), BACKGROUND);
        assert_eq!(padded.get(1, 0), 0.0);
        assert_eq!(padded.get(3, 0), 0.0);
        assert_eq!(padded.get(4, 0), BACKGROUND);
        assert_eq!(padded.get(5, 0), BACKGROUND);
    }

    #[test]
    fn normalization_is_idempotent_at_target_size() {
        let img = ramp(64, 500);
        let first = normalize_height(img.clone(), 64, 3000);
        let second = normalize_height(first.image.clone(), 64, 3000);
        assert_eq!(first.image, second.image);
    }

    #[test]
    fn plain_remap_range() {
        let mut img = ramp(4, 4);
        remap_plain(&mut img);
        for v in &img.data {
            assert!(*v <= 1.0 && *v >= -1.0);
        }
    }
}
