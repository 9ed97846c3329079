//! Contrast enhancement for low-contrast radiographs.
//!
//! Optional preprocessing service: CLAHE (contrast-limited adaptive histogram
//! equalization) followed by a mild linear stretch, blended with a global
//! histogram equalization of the untouched gray image. Gentle clip limit
//! keeps faint opacities visible without amplifying film noise.
//!
//! Pure Rust on 8-bit gray, no `imageproc` dependency. Fully deterministic.

use image::{GrayImage, Luma};

/// Default CLAHE clip limit (multiple of the uniform bin height).
const DEFAULT_CLIP_LIMIT: f32 = 1.5;

/// Default CLAHE tile grid (tiles per axis).
const DEFAULT_TILE_GRID: u32 = 8;

/// Post-CLAHE stretch `gain * v + offset`.
const STRETCH_GAIN: f32 = 1.1;
const STRETCH_OFFSET: f32 = 5.0;

/// Weight of the CLAHE branch in the final blend; the rest is global equalization.
const CLAHE_WEIGHT: f32 = 0.7;

/// CLAHE + stretch + global-equalization blend.
#[derive(Debug, Clone, PartialEq)]
pub struct ContrastEnhancer {
    clip_limit: f32,
    tile_grid: u32,
    clahe_weight: f32,
}

impl Default for ContrastEnhancer {
    fn default() -> Self {
        Self {
            clip_limit: DEFAULT_CLIP_LIMIT,
            tile_grid: DEFAULT_TILE_GRID,
            clahe_weight: CLAHE_WEIGHT,
        }
    }
}

impl ContrastEnhancer {
    pub fn new(clip_limit: f32, tile_grid: u32) -> Self {
        Self {
            clip_limit: clip_limit.max(1.0),
            tile_grid: tile_grid.max(1),
            clahe_weight: CLAHE_WEIGHT,
        }
    }

    pub fn enhance(&self, gray: &GrayImage) -> GrayImage {
        let local = clahe(gray, self.clip_limit, self.tile_grid);
        let global = equalize_histogram(gray);

        let mut out = GrayImage::new(gray.width(), gray.height());
        for ((dst, l), g) in out.pixels_mut().zip(local.pixels()).zip(global.pixels()) {
            let stretched = (STRETCH_GAIN * l.0[0] as f32 + STRETCH_OFFSET).round().min(255.0);
            let blended =
                self.clahe_weight * stretched + (1.0 - self.clahe_weight) * g.0[0] as f32;
            *dst = Luma([blended.round().clamp(0.0, 255.0) as u8]);
        }
        out
    }
}

fn histogram(gray: &GrayImage, x0: u32, y0: u32, x1: u32, y1: u32) -> [u32; 256] {
    let mut hist = [0u32; 256];
    for y in y0..y1 {
        for x in x0..x1 {
            hist[gray.get_pixel(x, y).0[0] as usize] += 1;
        }
    }
    hist
}

/// Global histogram equalization. Uniform images are returned unchanged.
pub fn equalize_histogram(gray: &GrayImage) -> GrayImage {
    let total = gray.width() * gray.height();
    if total == 0 {
        return gray.clone();
    }
    let hist = histogram(gray, 0, 0, gray.width(), gray.height());

    let mut cdf = [0u32; 256];
    let mut running = 0u32;
    for (slot, &count) in cdf.iter_mut().zip(hist.iter()) {
        running += count;
        *slot = running;
    }
    let cdf_min = cdf.iter().copied().find(|&c| c > 0).unwrap_or(0);
    if total == cdf_min {
        return gray.clone();
    }

    let denom = (total - cdf_min) as f32;
    let mut lut = [0u8; 256];
    for (v, slot) in lut.iter_mut().enumerate() {
        let scaled = (cdf[v].saturating_sub(cdf_min)) as f32 * 255.0 / denom;
        *slot = scaled.round().clamp(0.0, 255.0) as u8;
    }

    let mut out = gray.clone();
    for p in out.pixels_mut() {
        p.0[0] = lut[p.0[0] as usize];
    }
    out
}

/// Clip a tile histogram at `limit` and spread the excess over all bins.
fn clip_histogram(hist: &mut [u32; 256], limit: u32) {
    let mut excess = 0u32;
    for count in hist.iter_mut() {
        if *count > limit {
            excess += *count - limit;
            *count = limit;
        }
    }
    let batch = excess / 256;
    let residual = (excess % 256) as usize;
    for count in hist.iter_mut() {
        *count += batch;
    }
    if residual > 0 {
        let step = (256 / residual).max(1);
        for idx in (0..256).step_by(step).take(residual) {
            hist[idx] += 1;
        }
    }
}

fn tile_lut(hist: &[u32; 256], area: u32) -> [u8; 256] {
    let mut lut = [0u8; 256];
    let mut running = 0u32;
    let scale = 255.0 / area.max(1) as f32;
    for (slot, &count) in lut.iter_mut().zip(hist.iter()) {
        running += count;
        *slot = (running as f32 * scale).round().clamp(0.0, 255.0) as u8;
    }
    lut
}

/// Tile boundaries for `tiles` equal-ish splits of `len`.
fn tile_bounds(len: u32, tiles: u32) -> Vec<(u32, u32)> {
    (0..tiles)
        .map(|t| (t * len / tiles, (t + 1) * len / tiles))
        .collect()
}

/// Contrast-limited adaptive histogram equalization.
///
/// Per-tile equalization LUTs, bilinearly interpolated between the four
/// nearest tile centres to avoid block seams.
pub fn clahe(gray: &GrayImage, clip_limit: f32, tile_grid: u32) -> GrayImage {
    let (w, h) = (gray.width(), gray.height());
    if w == 0 || h == 0 {
        return gray.clone();
    }
    let tiles_x = tile_grid.clamp(1, w);
    let tiles_y = tile_grid.clamp(1, h);
    let xs = tile_bounds(w, tiles_x);
    let ys = tile_bounds(h, tiles_y);

    let mut luts = Vec::with_capacity((tiles_x * tiles_y) as usize);
    for &(y0, y1) in &ys {
        for &(x0, x1) in &xs {
            let area = (x1 - x0) * (y1 - y0);
            let mut hist = histogram(gray, x0, y0, x1, y1);
            let limit = ((clip_limit * area as f32 / 256.0) as u32).max(1);
            clip_histogram(&mut hist, limit);
            luts.push(tile_lut(&hist, area));
        }
    }

    let tile_w = w as f32 / tiles_x as f32;
    let tile_h = h as f32 / tiles_y as f32;
    let locate = |pos: f32, tile: f32, count: u32| -> (usize, usize, f32) {
        let g = (pos + 0.5) / tile - 0.5;
        let lo = g.floor().clamp(0.0, (count - 1) as f32) as usize;
        let hi = (lo + 1).min(count as usize - 1);
        let frac = if hi == lo { 0.0 } else { (g - lo as f32).clamp(0.0, 1.0) };
        (lo, hi, frac)
    };

    let mut out = GrayImage::new(w, h);
    for y in 0..h {
        let (ty0, ty1, fy) = locate(y as f32, tile_h, tiles_y);
        for x in 0..w {
            let (tx0, tx1, fx) = locate(x as f32, tile_w, tiles_x);
            let v = gray.get_pixel(x, y).0[0] as usize;
            let at = |ty: usize, tx: usize| luts[ty * tiles_x as usize + tx][v] as f32;
            let top = at(ty0, tx0) * (1.0 - fx) + at(ty0, tx1) * fx;
            let bottom = at(ty1, tx0) * (1.0 - fx) + at(ty1, tx1) * fx;
            let value = top * (1.0 - fy) + bottom * fy;
            out.put_pixel(x, y, Luma([value.round().clamp(0.0, 255.0) as u8]));
        }
    }
    out
}
