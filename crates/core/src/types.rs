use image::RgbaImage;
use serde::{Deserialize, Serialize};

/// Rectangle of a tile in *source* image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl TileRect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn contains(&self, px: u32, py: u32) -> bool {
        px >= self.x && px < self.right() && py >= self.y && py < self.bottom()
    }

    /// Expected enhanced dimensions for this tile at the given scale.
    pub fn scaled_size(&self, scale: f64) -> (u32, u32) {
        (
            scale_dimension(self.width, scale),
            scale_dimension(self.height, scale),
        )
    }
}

/// `round(value × scale)`, the one rounding rule shared by the scheduler and the merger.
pub fn scale_dimension(value: u32, scale: f64) -> u32 {
    (value as f64 * scale).round().max(0.0) as u32
}

/// A source region cut from the input image.
#[derive(Debug, Clone)]
pub struct Tile {
    pub rect: TileRect,
    pub pixels: RgbaImage,
}

/// A tile after enhancement. `rect` stays in source coordinates so the
/// merger can re-project it; `pixels` carries the enhanced (larger) buffer.
#[derive(Debug, Clone)]
pub struct EnhancedTile {
    pub rect: TileRect,
    pub pixels: RgbaImage,
}

impl EnhancedTile {
    /// Reinterpret the enhanced buffer as a tile so it can be fed back
    /// through the scheduler for another pass.
    pub fn into_tile(self) -> Tile {
        Tile {
            rect: self.rect,
            pixels: self.pixels,
        }
    }
}

/// Output of the external analysis capability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageAnalysis {
    pub description: String,
    pub textures: Vec<String>,
    pub subjects: Vec<String>,
}

impl ImageAnalysis {
    pub fn is_empty(&self) -> bool {
        self.description.trim().is_empty() && self.textures.is_empty() && self.subjects.is_empty()
    }

    /// Case-insensitive search over textures, subjects and the description.
    pub fn mentions_any(&self, needles: &[&str]) -> bool {
        let haystacks = self
            .textures
            .iter()
            .chain(self.subjects.iter())
            .map(String::as_str)
            .chain(std::iter::once(self.description.as_str()));

        for hay in haystacks {
            let hay = hay.to_ascii_lowercase();
            if needles.iter().any(|needle| hay.contains(needle)) {
                return true;
            }
        }
        false
    }
}

/// Coarse location of a tile inside the image, by thirds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TilePosition {
    TopLeft,
    Top,
    TopRight,
    Left,
    Center,
    Right,
    BottomLeft,
    Bottom,
    BottomRight,
}

impl TilePosition {
    /// Classify a tile by its centroid relative to the image thirds.
    pub fn classify(rect: &TileRect, image_width: u32, image_height: u32) -> Self {
        let cx = rect.x as f64 + rect.width as f64 / 2.0;
        let cy = rect.y as f64 + rect.height as f64 / 2.0;
        let column = third(cx, image_width as f64);
        let row = third(cy, image_height as f64);

        match (row, column) {
            (0, 0) => Self::TopLeft,
            (0, 1) => Self::Top,
            (0, _) => Self::TopRight,
            (1, 0) => Self::Left,
            (1, 1) => Self::Center,
            (1, _) => Self::Right,
            (_, 0) => Self::BottomLeft,
            (_, 1) => Self::Bottom,
            _ => Self::BottomRight,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::TopLeft => "top-left corner",
            Self::Top => "top edge",
            Self::TopRight => "top-right corner",
            Self::Left => "left side",
            Self::Center => "center",
            Self::Right => "right side",
            Self::BottomLeft => "bottom-left corner",
            Self::Bottom => "bottom edge",
            Self::BottomRight => "bottom-right corner",
        }
    }
}

fn third(center: f64, extent: f64) -> u8 {
    if extent <= 0.0 {
        return 1;
    }
    let ratio = center / extent;
    if ratio < 1.0 / 3.0 {
        0
    } else if ratio < 2.0 / 3.0 {
        1
    } else {
        2
    }
}

/// Read-only context handed to the enhancement capability with every tile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileContext {
    pub position: TilePosition,
    pub image_description: String,
    pub textures: Vec<String>,
    pub subjects: Vec<String>,
    /// 1 for the initial upscale, 2.. for refinement passes.
    pub pass: u32,
}

impl TileContext {
    pub fn new(position: TilePosition, analysis: &ImageAnalysis, pass: u32) -> Self {
        Self {
            position,
            image_description: analysis.description.clone(),
            textures: analysis.textures.clone(),
            subjects: analysis.subjects.clone(),
            pass,
        }
    }

    pub fn analysis(&self) -> ImageAnalysis {
        ImageAnalysis {
            description: self.image_description.clone(),
            textures: self.textures.clone(),
            subjects: self.subjects.clone(),
        }
    }
}
