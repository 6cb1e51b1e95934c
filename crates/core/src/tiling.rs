//! Tile decomposition: splits a source image into a row-major grid of
//! possibly-overlapping rectangles. Edge tiles are shrunk, never padded.

use image::{imageops, RgbaImage};
use tracing::debug;

use crate::error::{UpscaleError, UpscaleResult};
use crate::types::{Tile, TileRect};

pub const DEFAULT_TILE_SIZE: u32 = 256;
pub const DEFAULT_TILE_OVERLAP: u32 = 64;
pub const DEFAULT_MAX_TILES: usize = 500;

/// Output of [`decompose`].
#[derive(Debug)]
pub struct Decomposition {
    pub tiles: Vec<Tile>,
    pub image_width: u32,
    pub image_height: u32,
}

pub fn validate_tiling(tile_size: u32, overlap: u32) -> UpscaleResult<()> {
    if tile_size == 0 {
        return Err(UpscaleError::InvalidParameter(
            "tile_size must be positive".to_string(),
        ));
    }
    if overlap >= tile_size {
        return Err(UpscaleError::InvalidParameter(format!(
            "overlap ({overlap}) must be smaller than tile_size ({tile_size})"
        )));
    }
    Ok(())
}

/// Compute the tile rectangles without copying any pixels.
pub fn plan_grid(
    image_width: u32,
    image_height: u32,
    tile_size: u32,
    overlap: u32,
) -> UpscaleResult<Vec<TileRect>> {
    validate_tiling(tile_size, overlap)?;
    if image_width == 0 || image_height == 0 {
        return Err(UpscaleError::InvalidImage(format!(
            "image has zero dimension ({image_width}x{image_height})"
        )));
    }

    let step = (tile_size - overlap) as usize;
    let mut rects = Vec::with_capacity(grid_len(image_width, step) * grid_len(image_height, step));

    for y in (0..image_height).step_by(step) {
        for x in (0..image_width).step_by(step) {
            let width = tile_size.min(image_width - x);
            let height = tile_size.min(image_height - y);
            rects.push(TileRect::new(x, y, width, height));
        }
    }

    Ok(rects)
}

/// Number of tiles `plan_grid` would produce, without allocating.
pub fn count_tiles(
    image_width: u32,
    image_height: u32,
    tile_size: u32,
    overlap: u32,
) -> UpscaleResult<usize> {
    validate_tiling(tile_size, overlap)?;
    let step = (tile_size - overlap) as usize;
    Ok(grid_len(image_width, step) * grid_len(image_height, step))
}

fn grid_len(extent: u32, step: usize) -> usize {
    (extent as usize).div_ceil(step)
}

pub fn decompose(image: &RgbaImage, tile_size: u32, overlap: u32) -> UpscaleResult<Decomposition> {
    let (image_width, image_height) = image.dimensions();
    let rects = plan_grid(image_width, image_height, tile_size, overlap)?;

    let tiles: Vec<Tile> = rects
        .into_iter()
        .map(|rect| Tile {
            rect,
            pixels: imageops::crop_imm(image, rect.x, rect.y, rect.width, rect.height).to_image(),
        })
        .collect();

    debug!(
        image_width,
        image_height,
        tile_size,
        overlap,
        tiles = tiles.len(),
        "Decomposed image into tiles"
    );

    Ok(Decomposition {
        tiles,
        image_width,
        image_height,
    })
}

/// Like [`decompose`], but refuses before copying pixels when the grid
/// would exceed `max_tiles`.
pub fn decompose_with_limit(
    image: &RgbaImage,
    tile_size: u32,
    overlap: u32,
    max_tiles: usize,
) -> UpscaleResult<Decomposition> {
    let (w, h) = image.dimensions();
    if w > 0 && h > 0 {
        let tiles = count_tiles(w, h, tile_size, overlap)?;
        if tiles > max_tiles {
            return Err(UpscaleError::TileLimitExceeded {
                tiles,
                limit: max_tiles,
            });
        }
    }
    decompose(image, tile_size, overlap)
}
