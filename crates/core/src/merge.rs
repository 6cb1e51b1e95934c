//! Weighted reconstruction of enhanced tiles into one output canvas.
//!
//! Every tile contributes `value × weight` to a float accumulator and
//! `weight` to a parallel weight buffer. The weight fades to (almost) zero
//! with a smoothstep ramp towards every side that has a neighbouring tile,
//! so overlapping tiles cross-fade instead of producing block seams. The
//! final pixel is the accumulated value divided by the accumulated weight.

use image::RgbaImage;
use tracing::debug;

use crate::error::{UpscaleError, UpscaleResult};
use crate::tiling::validate_tiling;
use crate::types::{scale_dimension, EnhancedTile, TileRect};

const CHANNELS: usize = 4;

/// Lower bound for a single tile's weight so corner pixels never
/// contribute an exact zero.
pub const WEIGHT_FLOOR: f32 = 1e-4;

/// Geometry shared by every tile of one merge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergeParams {
    pub original_width: u32,
    pub original_height: u32,
    pub tile_size: u32,
    pub overlap: u32,
    pub scale: f64,
}

impl MergeParams {
    pub fn output_size(&self) -> (u32, u32) {
        (
            scale_dimension(self.original_width, self.scale),
            scale_dimension(self.original_height, self.scale),
        )
    }

    /// Width of the blend ramp in output pixels.
    pub fn feather(&self) -> u32 {
        scale_dimension(self.overlap, self.scale)
    }

    fn validate(&self) -> UpscaleResult<()> {
        if !self.scale.is_finite() || self.scale <= 0.0 {
            return Err(UpscaleError::InvalidParameter(format!(
                "scale must be finite and positive, got {}",
                self.scale
            )));
        }
        validate_tiling(self.tile_size, self.overlap)?;
        if self.original_width == 0 || self.original_height == 0 {
            return Err(UpscaleError::InvalidImage(format!(
                "original image has zero dimension ({}x{})",
                self.original_width, self.original_height
            )));
        }
        Ok(())
    }
}

/// Hermite falloff `3t² − 2t³`, clamped to `[0, 1]`.
pub fn smoothstep(t: f32) -> f32 {
    let t = t.clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

/// Which sides of a tile border another tile rather than the image edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Neighbors {
    pub left: bool,
    pub right: bool,
    pub top: bool,
    pub bottom: bool,
}

impl Neighbors {
    pub fn of(rect: &TileRect, image_width: u32, image_height: u32) -> Self {
        Self {
            left: rect.x > 0,
            right: rect.right() < image_width,
            top: rect.y > 0,
            bottom: rect.bottom() < image_height,
        }
    }
}

/// Per-axis weights for a tile `len` output pixels long. Distances are
/// measured to pixel centres so the ramps of two adjacent tiles sum to one
/// across a shared feather zone.
fn axis_weights(len: u32, feather: u32, fade_start: bool, fade_end: bool) -> Vec<f32> {
    let len = len as usize;
    if feather == 0 {
        return vec![1.0; len];
    }
    let feather = feather as f32;

    (0..len)
        .map(|i| {
            let mut weight = 1.0;
            if fade_start {
                weight *= smoothstep((i as f32 + 0.5) / feather);
            }
            if fade_end {
                weight *= smoothstep(((len - 1 - i) as f32 + 0.5) / feather);
            }
            weight
        })
        .collect()
}

/// Float accumulation canvas owned by a single merge.
#[derive(Debug)]
pub struct Accumulator {
    width: u32,
    height: u32,
    values: Vec<f32>,
    weights: Vec<f32>,
}

impl Accumulator {
    pub fn new(width: u32, height: u32) -> Self {
        let pixels = width as usize * height as usize;
        Self {
            width,
            height,
            values: vec![0.0; pixels * CHANNELS],
            weights: vec![0.0; pixels],
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn weight_at(&self, x: u32, y: u32) -> f32 {
        self.weights[y as usize * self.width as usize + x as usize]
    }

    /// Fraction of canvas pixels that received a positive weight.
    pub fn coverage(&self) -> f32 {
        if self.weights.is_empty() {
            return 0.0;
        }
        let covered = self.weights.iter().filter(|w| **w > 0.0).count();
        covered as f32 / self.weights.len() as f32
    }

    /// Add one enhanced tile. Pixels that land outside the canvas are clipped.
    pub fn accumulate(&mut self, tile: &EnhancedTile, params: &MergeParams) {
        let neighbors = Neighbors::of(&tile.rect, params.original_width, params.original_height);
        let feather = params.feather();
        let (tile_w, tile_h) = tile.pixels.dimensions();

        let origin_x = scale_dimension(tile.rect.x, params.scale);
        let origin_y = scale_dimension(tile.rect.y, params.scale);
        if origin_x >= self.width || origin_y >= self.height {
            return;
        }

        let horizontal = axis_weights(tile_w, feather, neighbors.left, neighbors.right);
        let vertical = axis_weights(tile_h, feather, neighbors.top, neighbors.bottom);

        let visible_w = tile_w.min(self.width - origin_x) as usize;
        let visible_h = tile_h.min(self.height - origin_y) as usize;
        let src = tile.pixels.as_raw();
        let src_stride = tile_w as usize * CHANNELS;
        let canvas_w = self.width as usize;

        for ly in 0..visible_h {
            let row_weight = vertical[ly];
            let dst_row = (origin_y as usize + ly) * canvas_w + origin_x as usize;
            let src_row = ly * src_stride;

            for lx in 0..visible_w {
                let weight = (horizontal[lx] * row_weight).max(WEIGHT_FLOOR);
                let dst = dst_row + lx;
                let si = src_row + lx * CHANNELS;

                self.weights[dst] += weight;
                let values = &mut self.values[dst * CHANNELS..(dst + 1) * CHANNELS];
                for (acc, value) in values.iter_mut().zip(&src[si..si + CHANNELS]) {
                    *acc += *value as f32 * weight;
                }
            }
        }
    }

    /// Divide by the accumulated weight. A pixel no tile reached keeps a
    /// divisor of 1 and therefore stays zero. Covered pixels divide by the
    /// raw weight even below 1: smoothstep ramps of two neighbours sum to
    /// about 1 but rounding at fractional scales can leave it short, and
    /// clamping the divisor to 1 there would darken the seam.
    pub fn normalize(self) -> RgbaImage {
        let mut output = RgbaImage::new(self.width, self.height);
        for (index, pixel) in output.pixels_mut().enumerate() {
            let weight = self.weights[index];
            let divisor = if weight > 0.0 { weight } else { 1.0 };
            let values = &self.values[index * CHANNELS..(index + 1) * CHANNELS];
            for (channel, value) in pixel.0.iter_mut().zip(values) {
                *channel = (value / divisor).clamp(0.0, 255.0).round() as u8;
            }
        }
        output
    }
}

/// Accumulate every tile in canonical `(y, x)` order so the float sums,
/// and therefore the output bytes, do not depend on input order.
pub fn accumulate_tiles(tiles: &[EnhancedTile], params: &MergeParams) -> UpscaleResult<Accumulator> {
    params.validate()?;

    for tile in tiles {
        let rect = &tile.rect;
        if rect.width == 0
            || rect.height == 0
            || rect.right() > params.original_width
            || rect.bottom() > params.original_height
        {
            return Err(UpscaleError::InvalidParameter(format!(
                "tile {rect:?} lies outside the {}x{} source image",
                params.original_width, params.original_height
            )));
        }
    }

    let (width, height) = params.output_size();
    let mut accumulator = Accumulator::new(width, height);

    let mut ordered: Vec<&EnhancedTile> = tiles.iter().collect();
    ordered.sort_by_key(|tile| (tile.rect.y, tile.rect.x));
    for tile in ordered {
        accumulator.accumulate(tile, params);
    }

    Ok(accumulator)
}

pub fn merge(tiles: &[EnhancedTile], params: &MergeParams) -> UpscaleResult<RgbaImage> {
    let accumulator = accumulate_tiles(tiles, params)?;
    let (width, height) = accumulator.dimensions();
    debug!(
        tiles = tiles.len(),
        width,
        height,
        feather = params.feather(),
        "Merged tiles into canvas"
    );
    Ok(accumulator.normalize())
}
