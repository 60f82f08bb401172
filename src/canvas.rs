use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use image::{GrayImage, Luma, Rgba, RgbaImage};
use rayon::prelude::*;
use uuid::Uuid;

use crate::log_warn;
use crate::ops::text::TextLayer;

// ============================================================================
// GEOMETRY
// ============================================================================

/// Integer-aligned rectangle in canvas pixel coordinates.
/// `x`/`y` may be negative; a zero width or height means "empty".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct PixelRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// The full canvas rectangle `(0, 0, width, height)`.
    pub fn canvas(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    /// Smallest integer rectangle enclosing the float extent `[min, max)`:
    /// the minimum is floored and the maximum is ceiled.
    pub fn enclosing(min_x: f32, min_y: f32, max_x: f32, max_y: f32) -> Self {
        let finite = min_x.is_finite() && min_y.is_finite() && max_x.is_finite() && max_y.is_finite();
        if !finite || max_x <= min_x || max_y <= min_y {
            return Self::default();
        }
        let x0 = min_x.floor() as i64;
        let y0 = min_y.floor() as i64;
        let x1 = max_x.ceil() as i64;
        let y1 = max_y.ceil() as i64;
        Self {
            x: x0.clamp(i32::MIN as i64, i32::MAX as i64) as i32,
            y: y0.clamp(i32::MIN as i64, i32::MAX as i64) as i32,
            width: (x1 - x0).clamp(0, u32::MAX as i64) as u32,
            height: (y1 - y0).clamp(0, u32::MAX as i64) as u32,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Exclusive right edge.
    pub fn right(&self) -> i64 {
        self.x as i64 + self.width as i64
    }

    /// Exclusive bottom edge.
    pub fn bottom(&self) -> i64 {
        self.y as i64 + self.height as i64
    }

    /// Overlap of two rectangles, `None` when they don't overlap.
    pub fn intersect(&self, other: &PixelRect) -> Option<PixelRect> {
        let x0 = (self.x as i64).max(other.x as i64);
        let y0 = (self.y as i64).max(other.y as i64);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(PixelRect {
            x: x0 as i32,
            y: y0 as i32,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
        })
    }

    /// Bounding rectangle of both; empty inputs are ignored.
    pub fn union(&self, other: &PixelRect) -> PixelRect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x0 = (self.x as i64).min(other.x as i64);
        let y0 = (self.y as i64).min(other.y as i64);
        let x1 = self.right().max(other.right());
        let y1 = self.bottom().max(other.bottom());
        PixelRect {
            x: x0 as i32,
            y: y0 as i32,
            width: (x1 - x0).min(u32::MAX as i64) as u32,
            height: (y1 - y0).min(u32::MAX as i64) as u32,
        }
    }
}

// ============================================================================
// SELECTION SYSTEM
// ============================================================================

/// How a new selection shape interacts with the existing selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SelectionMode {
    /// Clear any existing selection, then set the new shape.
    #[default]
    Replace,
    /// Union – add to the existing selection.
    Add,
    /// Difference – subtract from the existing selection.
    Subtract,
    /// Keep only pixels present in both the existing selection AND the new shape.
    Intersect,
}

impl SelectionMode {
    /// Merge one coverage value of a new shape into an existing one.
    #[inline]
    fn combine(self, old: u8, new: u8) -> u8 {
        match self {
            SelectionMode::Replace => new,
            SelectionMode::Add => old.max(new),
            SelectionMode::Subtract => old.saturating_sub(new),
            SelectionMode::Intersect => old.min(new),
        }
    }
}

impl FromStr for SelectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "replace" | "new" => Ok(SelectionMode::Replace),
            "add" | "union" => Ok(SelectionMode::Add),
            "subtract" | "sub" => Ok(SelectionMode::Subtract),
            "intersect" => Ok(SelectionMode::Intersect),
            other => Err(format!("unknown selection mode '{}'", other)),
        }
    }
}

/// A single selection outline in canvas coordinates.
#[derive(Clone, Debug, PartialEq)]
pub enum SelectionShape {
    Rectangle { x: f32, y: f32, width: f32, height: f32 },
    Ellipse   { cx: f32, cy: f32, rx: f32, ry: f32 },
    /// Closed freeform outline (lasso); filled with the even-odd rule.
    Polygon   { points: Vec<(f32, f32)> },
}

impl SelectionShape {
    pub fn rect(x: f32, y: f32, width: f32, height: f32) -> Self {
        SelectionShape::Rectangle { x, y, width, height }
    }

    /// Integer bounding box in canvas coordinates (not clamped to the canvas).
    pub fn bounds(&self) -> PixelRect {
        match self {
            SelectionShape::Rectangle { x, y, width, height } => {
                PixelRect::enclosing(*x, *y, x + width, y + height)
            }
            SelectionShape::Ellipse { cx, cy, rx, ry } => {
                PixelRect::enclosing(cx - rx, cy - ry, cx + rx, cy + ry)
            }
            SelectionShape::Polygon { points } => {
                let mut min_x = f32::MAX;
                let mut min_y = f32::MAX;
                let mut max_x = f32::MIN;
                let mut max_y = f32::MIN;
                for &(px, py) in points {
                    min_x = min_x.min(px);
                    min_y = min_y.min(py);
                    max_x = max_x.max(px);
                    max_y = max_y.max(py);
                }
                PixelRect::enclosing(min_x, min_y, max_x, max_y)
            }
        }
    }

    /// True when the shape encloses no area at all.
    pub fn is_degenerate(&self) -> bool {
        match self {
            SelectionShape::Rectangle { width, height, .. } => !(*width > 0.0 && *height > 0.0),
            SelectionShape::Ellipse { rx, ry, .. } => !(*rx > 0.0 && *ry > 0.0),
            SelectionShape::Polygon { points } => {
                if points.len() < 3 || points.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
                    return true;
                }
                // Zero area iff every vertex lies within 1/1000 px of the line
                // through the first vertex and the one farthest from it.
                let (ax, ay) = (points[0].0 as f64, points[0].1 as f64);
                let dist2 = |&(px, py): &(f32, f32)| (px as f64 - ax).powi(2) + (py as f64 - ay).powi(2);
                let Some(far) = points.iter().max_by(|p, q| dist2(*p).total_cmp(&dist2(*q))) else {
                    return true;
                };
                let reach2 = dist2(far);
                if reach2 == 0.0 {
                    return true;
                }
                let (bx, by) = (far.0 as f64 - ax, far.1 as f64 - ay);
                points.iter().all(|&(px, py)| {
                    let cross = bx * (py as f64 - ay) - by * (px as f64 - ax);
                    // |cross| / |ab| is the distance from the line
                    cross * cross <= reach2 * 1e-6
                })
            }
        }
    }

    /// Return a copy moved by `(dx, dy)`.
    pub fn translated(&self, dx: f32, dy: f32) -> Self {
        match self {
            SelectionShape::Rectangle { x, y, width, height } => {
                SelectionShape::Rectangle { x: x + dx, y: y + dy, width: *width, height: *height }
            }
            SelectionShape::Ellipse { cx, cy, rx, ry } => {
                SelectionShape::Ellipse { cx: cx + dx, cy: cy + dy, rx: *rx, ry: *ry }
            }
            SelectionShape::Polygon { points } => SelectionShape::Polygon {
                points: points.iter().map(|&(x, y)| (x + dx, y + dy)).collect(),
            },
        }
    }

    /// Rasterize the shape over `area`. Mask pixel `(mx, my)` holds the
    /// coverage (0–255) of canvas pixel `(area.x + mx, area.y + my)`.
    pub fn rasterize(&self, area: PixelRect) -> GrayImage {
        let mut mask = GrayImage::new(area.width, area.height);
        if area.is_empty() || self.is_degenerate() {
            return mask;
        }
        let Some(hit) = self.bounds().intersect(&area) else {
            return mask;
        };
        let ox = area.x as f32;
        let oy = area.y as f32;
        let mx0 = (hit.x - area.x) as u32;
        let my0 = (hit.y - area.y) as u32;

        match self {
            SelectionShape::Rectangle { x, y, width, height } => {
                // Exact area coverage: integer rectangles come out fully opaque,
                // fractional edges get partial coverage.
                let (rx0, ry0, rx1, ry1) = (*x, *y, x + width, y + height);
                for my in my0..my0 + hit.height {
                    let py = oy + my as f32;
                    let cov_y = (ry1.min(py + 1.0) - ry0.max(py)).clamp(0.0, 1.0);
                    if cov_y <= 0.0 { continue; }
                    for mx in mx0..mx0 + hit.width {
                        let px = ox + mx as f32;
                        let cov_x = (rx1.min(px + 1.0) - rx0.max(px)).clamp(0.0, 1.0);
                        let v = (cov_x * cov_y * 255.0).round() as u8;
                        if v > 0 {
                            mask.put_pixel(mx, my, Luma([v]));
                        }
                    }
                }
            }
            SelectionShape::Ellipse { cx, cy, rx, ry } => {
                for my in my0..my0 + hit.height {
                    let dy = (oy + my as f32 + 0.5 - cy) / ry;
                    for mx in mx0..mx0 + hit.width {
                        let dx = (ox + mx as f32 + 0.5 - cx) / rx;
                        if dx * dx + dy * dy <= 1.0 {
                            mask.put_pixel(mx, my, Luma([255]));
                        }
                    }
                }
            }
            SelectionShape::Polygon { points } => {
                // Scanline fill at pixel-row centres, spans between pairs of crossings.
                let n = points.len();
                let mut nodes: Vec<f32> = Vec::new();
                for my in my0..my0 + hit.height {
                    let yf = oy + my as f32 + 0.5;
                    nodes.clear();
                    for i in 0..n {
                        let j = (i + 1) % n;
                        let (xi, yi) = points[i];
                        let (xj, yj) = points[j];
                        if (yi < yf && yj >= yf) || (yj < yf && yi >= yf) {
                            let t = (yf - yi) / (yj - yi);
                            nodes.push(xi + t * (xj - xi));
                        }
                    }
                    nodes.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                    let mut k = 0;
                    while k + 1 < nodes.len() {
                        // Pixel x is inside when its centre x + 0.5 lies in [start, end).
                        let start = (nodes[k] - 0.5 - ox).ceil().max(mx0 as f32) as u32;
                        let end = (nodes[k + 1] - 0.5 - ox).ceil().min((mx0 + hit.width) as f32).max(0.0) as u32;
                        for mx in start..end {
                            mask.put_pixel(mx, my, Luma([255]));
                        }
                        k += 2;
                    }
                }
            }
        }
        mask
    }
}

/// Parses `rect:x,y,w,h`, `ellipse:cx,cy,rx,ry` and `poly:x,y;x,y;...`.
impl FromStr for SelectionShape {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, args) = s
            .split_once(':')
            .ok_or_else(|| format!("selection '{}' must look like kind:values", s))?;

        let numbers = |text: &str, expected: usize| -> Result<Vec<f32>, String> {
            let vals: Vec<f32> = text
                .split(',')
                .map(|v| v.trim().parse::<f32>().map_err(|e| format!("bad number '{}': {}", v.trim(), e)))
                .collect::<Result<_, _>>()?;
            if vals.len() != expected {
                return Err(format!("expected {} values, got {}", expected, vals.len()));
            }
            Ok(vals)
        };

        match kind.trim().to_lowercase().as_str() {
            "rect" | "rectangle" => {
                let v = numbers(args, 4)?;
                Ok(SelectionShape::rect(v[0], v[1], v[2], v[3]))
            }
            "ellipse" => {
                let v = numbers(args, 4)?;
                Ok(SelectionShape::Ellipse { cx: v[0], cy: v[1], rx: v[2], ry: v[3] })
            }
            "poly" | "polygon" | "lasso" => {
                let points = args
                    .split(';')
                    .filter(|p| !p.trim().is_empty())
                    .map(|p| numbers(p, 2).map(|v| (v[0], v[1])))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(SelectionShape::Polygon { points })
            }
            other => Err(format!("unknown selection kind '{}'", other)),
        }
    }
}

/// The active selection: an ordered list of shapes combined through
/// [`SelectionMode`]s. The first entry always acts as `Replace`.
#[derive(Clone, Debug, PartialEq)]
pub struct Selection {
    parts: Vec<(SelectionMode, SelectionShape)>,
}

impl From<SelectionShape> for Selection {
    fn from(shape: SelectionShape) -> Self {
        Self::new(shape)
    }
}

impl Selection {
    pub fn new(shape: SelectionShape) -> Self {
        Self { parts: vec![(SelectionMode::Replace, shape)] }
    }

    pub fn parts(&self) -> &[(SelectionMode, SelectionShape)] {
        &self.parts
    }

    /// Combine a new shape into the selection.
    pub fn combine(&mut self, shape: SelectionShape, mode: SelectionMode) {
        if mode == SelectionMode::Replace {
            self.parts.clear();
        }
        self.parts.push((mode, shape));
    }

    /// Integer bounding box of the selection outlines in canvas coordinates.
    ///
    /// For a single shape this is its exact box. For combined selections it is
    /// an outer estimate: subtracted shapes never shrink it and intersections
    /// only intersect boxes. [`Selection::selected_area`] gives the exact extent.
    pub fn bounds(&self) -> PixelRect {
        self.parts.iter().fold(PixelRect::default(), |acc, (mode, shape)| {
            let own = if shape.is_degenerate() { PixelRect::default() } else { shape.bounds() };
            match mode {
                SelectionMode::Replace => own,
                SelectionMode::Add => acc.union(&own),
                SelectionMode::Subtract => acc,
                SelectionMode::Intersect => acc.intersect(&own).unwrap_or_default(),
            }
        })
    }

    /// The part of `within` the selection actually covers, with its coverage
    /// mask. `None` when nothing inside `within` is selected.
    ///
    /// A single shape keeps its geometric bounds (clipped to `within`), even
    /// where edge pixels sample to zero coverage. A combined selection is cut
    /// down to the pixels with non-zero coverage, so holes and disjoint
    /// intersections don't leave transparent margins.
    pub fn selected_area(&self, within: PixelRect) -> Option<(PixelRect, GrayImage)> {
        if self.is_degenerate() {
            return None;
        }
        let area = self.bounds().intersect(&within)?;
        let coverage = self.coverage_mask(area);
        if self.parts.len() == 1 {
            return Some((area, coverage));
        }

        let tight = covered_extent(&coverage)?;
        if tight.width == area.width && tight.height == area.height {
            return Some((area, coverage));
        }
        let cropped =
            image::imageops::crop_imm(&coverage, tight.x as u32, tight.y as u32, tight.width, tight.height)
                .to_image();
        Some((PixelRect::new(area.x + tight.x, area.y + tight.y, tight.width, tight.height), cropped))
    }

    /// True when the outlines alone rule out any area (degenerate shapes or
    /// disjoint boxes). Combined selections can still turn out empty once
    /// rasterized; see [`Selection::selected_area`].
    pub fn is_degenerate(&self) -> bool {
        let has_area = self.parts.iter().fold(false, |acc, (mode, shape)| match mode {
            SelectionMode::Replace => !shape.is_degenerate(),
            SelectionMode::Add => acc || !shape.is_degenerate(),
            SelectionMode::Subtract => acc,
            SelectionMode::Intersect => acc && !shape.is_degenerate(),
        });
        !has_area || self.bounds().is_empty()
    }

    /// Rasterize the whole selection over `area`, translated so that
    /// `(area.x, area.y)` lands on mask pixel `(0, 0)`.
    pub fn coverage_mask(&self, area: PixelRect) -> GrayImage {
        let mut mask = GrayImage::new(area.width, area.height);
        for (i, (mode, shape)) in self.parts.iter().enumerate() {
            let part = shape.rasterize(area);
            let mode = if i == 0 { SelectionMode::Replace } else { *mode };
            if mode == SelectionMode::Replace {
                mask = part;
                continue;
            }
            for (dst, src) in mask.iter_mut().zip(part.iter()) {
                *dst = mode.combine(*dst, *src);
            }
        }
        mask
    }

    /// Coverage (0–255) of a single canvas pixel.
    pub fn coverage_at(&self, x: i32, y: i32) -> u8 {
        self.coverage_mask(PixelRect::new(x, y, 1, 1)).get_pixel(0, 0).0[0]
    }

    /// Move every shape by `(dx, dy)` canvas pixels.
    pub fn translate(&mut self, dx: f32, dy: f32) {
        for (_, shape) in &mut self.parts {
            *shape = shape.translated(dx, dy);
        }
    }
}

/// Box of the non-zero pixels of a coverage mask, in mask coordinates.
fn covered_extent(mask: &GrayImage) -> Option<PixelRect> {
    let (mut x0, mut y0, mut x1, mut y1) = (u32::MAX, u32::MAX, 0u32, 0u32);
    for (x, y, px) in mask.enumerate_pixels() {
        if px.0[0] > 0 {
            x0 = x0.min(x);
            y0 = y0.min(y);
            x1 = x1.max(x + 1);
            y1 = y1.max(y + 1);
        }
    }
    (x1 > x0 && y1 > y0).then(|| PixelRect::new(x0 as i32, y0 as i32, x1 - x0, y1 - y0))
}

// ============================================================================
// TILED IMAGE – sparse 64×64 chunk storage (Vec-indexed for speed)
// ============================================================================

pub const CHUNK_SIZE: u32 = 64;

/// A pixel with zero alpha, returned by reference for missing chunks.
static TRANSPARENT_PIXEL: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// Sparse tiled image backed by a flat `Vec<Option<Arc<RgbaImage>>>`.
/// Chunk coordinates are mapped to a flat index via `cy * chunks_per_row + cx`.
///
/// Chunks are wrapped in `Arc` for copy-on-write semantics: `clone()` only
/// bumps reference counts, and `put_pixel` uses `Arc::make_mut` to clone only
/// the touched chunk.
#[derive(Clone)]
pub struct TiledImage {
    pub width: u32,
    pub height: u32,
    chunks_per_row: u32,
    chunks: Vec<Option<Arc<RgbaImage>>>,
}

impl TiledImage {
    // ---- construction -------------------------------------------------------

    /// Create an empty (fully transparent) tiled image.
    pub fn new(width: u32, height: u32) -> Self {
        // Clamp dimensions to prevent overflow (max ~256 megapixels)
        let (width, height) = {
            let total = (width as u64) * (height as u64);
            if total > 256_000_000 || width == 0 || height == 0 {
                log_warn!("TiledImage::new: dimensions {}×{} out of range, clamped to 1×1", width, height);
                (1, 1)
            } else {
                (width, height)
            }
        };
        let chunks_per_row = width.div_ceil(CHUNK_SIZE);
        let chunks_per_col = height.div_ceil(CHUNK_SIZE);
        let total = (chunks_per_row * chunks_per_col) as usize;
        Self {
            width,
            height,
            chunks_per_row,
            chunks: vec![None; total],
        }
    }

    /// Fill the entire image with `color`. A transparent fill allocates nothing.
    pub fn new_filled(width: u32, height: u32, color: Rgba<u8>) -> Self {
        let mut img = Self::new(width, height);
        if color[3] > 0 {
            img.fill(color);
        }
        img
    }

    /// Import from a flat `RgbaImage`. Only non-transparent chunks are stored.
    /// Chunk conversion is parallelised with rayon.
    pub fn from_rgba_image(src: &RgbaImage) -> Self {
        let width = src.width();
        let height = src.height();
        let mut img = Self::new(width, height);
        if img.width != width || img.height != height {
            return img;
        }

        let chunks_x = img.chunks_per_row as usize;
        let chunks_y = height.div_ceil(CHUNK_SIZE) as usize;
        let src_raw = src.as_raw();

        let chunk_results: Vec<(usize, Option<Arc<RgbaImage>>)> = (0..chunks_x * chunks_y)
            .into_par_iter()
            .map(|flat| {
                let base_x = (flat % chunks_x) as u32 * CHUNK_SIZE;
                let base_y = (flat / chunks_x) as u32 * CHUNK_SIZE;

                let cw = CHUNK_SIZE.min(width - base_x);
                let ch = CHUNK_SIZE.min(height - base_y);
                let chunk_stride = CHUNK_SIZE as usize * 4;
                let mut chunk_data = vec![0u8; chunk_stride * CHUNK_SIZE as usize];
                let mut has_content = false;

                for ly in 0..ch {
                    let src_start = ((base_y + ly) * width + base_x) as usize * 4;
                    let dst_start = ly as usize * chunk_stride;
                    let byte_len = cw as usize * 4;
                    let row = &mut chunk_data[dst_start..dst_start + byte_len];
                    row.copy_from_slice(&src_raw[src_start..src_start + byte_len]);
                    if !has_content {
                        has_content = row.chunks_exact(4).any(|px| px[3] != 0);
                    }
                }

                if has_content {
                    (flat, RgbaImage::from_raw(CHUNK_SIZE, CHUNK_SIZE, chunk_data).map(Arc::new))
                } else {
                    (flat, None)
                }
            })
            .collect();

        for (idx, chunk) in chunk_results {
            img.chunks[idx] = chunk;
        }
        img
    }

    /// Flatten back to a contiguous `RgbaImage`.
    pub fn to_rgba_image(&self) -> RgbaImage {
        self.extract_region(0, 0, self.width, self.height)
    }

    /// Copy a `rw × rh` window whose top-left sits at `(rx, ry)` in image
    /// coordinates. The window may reach past any edge; uncovered pixels are
    /// transparent. Only populated chunks are visited, rows are copied whole.
    pub fn extract_region(&self, rx: i32, ry: i32, rw: u32, rh: u32) -> RgbaImage {
        let mut out = RgbaImage::new(rw, rh);

        let x0 = (rx as i64).max(0);
        let y0 = (ry as i64).max(0);
        let x1 = (rx as i64 + rw as i64).min(self.width as i64);
        let y1 = (ry as i64 + rh as i64).min(self.height as i64);
        if x1 <= x0 || y1 <= y0 {
            return out;
        }
        let (x0, y0, x1, y1) = (x0 as u32, y0 as u32, x1 as u32, y1 as u32);

        let out_stride = rw as usize * 4;
        let chunk_stride = CHUNK_SIZE as usize * 4;
        let out_raw: &mut [u8] = &mut out;

        for cy in y0 / CHUNK_SIZE..y1.div_ceil(CHUNK_SIZE) {
            for cx in x0 / CHUNK_SIZE..x1.div_ceil(CHUNK_SIZE) {
                let Some(chunk) = self.get_chunk(cx, cy) else {
                    continue; // transparent – already zeroed
                };
                let base_x = cx * CHUNK_SIZE;
                let base_y = cy * CHUNK_SIZE;

                // Overlap between this chunk and the requested window
                let ox = x0.max(base_x);
                let oy = y0.max(base_y);
                let ox2 = x1.min(base_x + CHUNK_SIZE);
                let oy2 = y1.min(base_y + CHUNK_SIZE);
                if ox >= ox2 || oy >= oy2 { continue; }

                let byte_len = (ox2 - ox) as usize * 4;
                let chunk_raw = chunk.as_raw();
                let dx = (ox as i64 - rx as i64) as usize;

                for sy in oy..oy2 {
                    let src_start = (sy - base_y) as usize * chunk_stride + (ox - base_x) as usize * 4;
                    let dy = (sy as i64 - ry as i64) as usize;
                    let dst_start = dy * out_stride + dx * 4;
                    out_raw[dst_start..dst_start + byte_len]
                        .copy_from_slice(&chunk_raw[src_start..src_start + byte_len]);
                }
            }
        }
        out
    }

    // ---- indexing helpers ----------------------------------------------------

    #[inline(always)]
    fn flat_index(&self, cx: u32, cy: u32) -> usize {
        (cy * self.chunks_per_row + cx) as usize
    }

    #[inline(always)]
    fn chunk_coord(x: u32, y: u32) -> (u32, u32) { (x / CHUNK_SIZE, y / CHUNK_SIZE) }

    #[inline(always)]
    fn local(x: u32, y: u32) -> (u32, u32) { (x % CHUNK_SIZE, y % CHUNK_SIZE) }

    // ---- pixel access -------------------------------------------------------

    /// Read a pixel (returns `&TRANSPARENT_PIXEL` for missing chunks).
    #[inline]
    pub fn get_pixel(&self, x: u32, y: u32) -> &Rgba<u8> {
        if x >= self.width || y >= self.height { return &TRANSPARENT_PIXEL; }
        let (cx, cy) = Self::chunk_coord(x, y);
        let (lx, ly) = Self::local(x, y);
        let idx = self.flat_index(cx, cy);
        self.chunks[idx].as_ref()
            .map(|c| c.get_pixel(lx, ly))
            .unwrap_or(&TRANSPARENT_PIXEL)
    }

    /// Write a pixel (creates the chunk on demand, COW-clones if shared).
    #[inline]
    pub fn put_pixel(&mut self, x: u32, y: u32, pixel: Rgba<u8>) {
        if x >= self.width || y >= self.height { return; }
        let (cx, cy) = Self::chunk_coord(x, y);
        let (lx, ly) = Self::local(x, y);
        let idx = self.flat_index(cx, cy);
        let arc = self.chunks[idx]
            .get_or_insert_with(|| Arc::new(RgbaImage::new(CHUNK_SIZE, CHUNK_SIZE)));
        Arc::make_mut(arc).put_pixel(lx, ly, pixel);
    }

    /// Read-only access to a chunk (if it exists).
    pub fn get_chunk(&self, cx: u32, cy: u32) -> Option<&RgbaImage> {
        if cx >= self.chunks_per_row { return None; }
        let idx = self.flat_index(cx, cy);
        self.chunks.get(idx).and_then(|c| c.as_deref())
    }

    /// Number of populated chunks.
    pub fn chunk_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_some()).count()
    }

    /// Fill every pixel with `color`.
    pub fn fill(&mut self, color: Rgba<u8>) {
        for slot in &mut self.chunks {
            let arc = slot.get_or_insert_with(|| Arc::new(RgbaImage::new(CHUNK_SIZE, CHUNK_SIZE)));
            let chunk = Arc::make_mut(arc);
            for pixel in chunk.pixels_mut() {
                *pixel = color;
            }
        }
    }

    pub fn width(&self) -> u32 { self.width }

    pub fn height(&self) -> u32 { self.height }
}

// ============================================================================
// BLEND MODES
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum BlendMode {
    #[default]
    Normal,
    Multiply,
    Screen,
    Additive,
    Overlay,
    Lighten,
    Darken,
    Difference,
    HardLight,
    SoftLight,
    Exclusion,
}

/// Blend `top` over `base` with the given mode and layer opacity (straight alpha).
pub fn blend_pixel(base: Rgba<u8>, top: Rgba<u8>, mode: BlendMode, opacity: f32) -> Rgba<u8> {
    // Fast path: fully transparent top pixel — nothing to blend
    if top[3] == 0 || opacity <= 0.0 {
        return base;
    }

    // Fast path: Normal blend, full opacity, fully opaque top pixel — just overwrite
    if matches!(mode, BlendMode::Normal) && opacity >= 1.0 && top[3] == 255 {
        return top;
    }

    let opacity = opacity.clamp(0.0, 1.0);

    let base_r = base[0] as f32 / 255.0;
    let base_g = base[1] as f32 / 255.0;
    let base_b = base[2] as f32 / 255.0;
    let base_a = base[3] as f32 / 255.0;

    let top_r = top[0] as f32 / 255.0;
    let top_g = top[1] as f32 / 255.0;
    let top_b = top[2] as f32 / 255.0;
    let top_a = (top[3] as f32 / 255.0) * opacity;

    let (r, g, b) = match mode {
        BlendMode::Normal => (top_r, top_g, top_b),
        BlendMode::Multiply => (base_r * top_r, base_g * top_g, base_b * top_b),
        BlendMode::Screen => (
            1.0 - (1.0 - base_r) * (1.0 - top_r),
            1.0 - (1.0 - base_g) * (1.0 - top_g),
            1.0 - (1.0 - base_b) * (1.0 - top_b),
        ),
        BlendMode::Additive => (
            (base_r + top_r).min(1.0),
            (base_g + top_g).min(1.0),
            (base_b + top_b).min(1.0),
        ),
        BlendMode::Overlay => (
            overlay_channel(base_r, top_r),
            overlay_channel(base_g, top_g),
            overlay_channel(base_b, top_b),
        ),
        BlendMode::Lighten => (base_r.max(top_r), base_g.max(top_g), base_b.max(top_b)),
        BlendMode::Darken => (base_r.min(top_r), base_g.min(top_g), base_b.min(top_b)),
        BlendMode::Difference => ((base_r - top_r).abs(), (base_g - top_g).abs(), (base_b - top_b).abs()),
        BlendMode::HardLight => (
            overlay_channel(top_r, base_r),
            overlay_channel(top_g, base_g),
            overlay_channel(top_b, base_b),
        ),
        BlendMode::SoftLight => (
            soft_light_channel(base_r, top_r),
            soft_light_channel(base_g, top_g),
            soft_light_channel(base_b, top_b),
        ),
        BlendMode::Exclusion => (
            base_r + top_r - 2.0 * base_r * top_r,
            base_g + top_g - 2.0 * base_g * top_g,
            base_b + top_b - 2.0 * base_b * top_b,
        ),
    };

    let out_a = top_a + base_a * (1.0 - top_a);
    if out_a == 0.0 {
        return Rgba([0, 0, 0, 0]);
    }

    let out_r = (r * top_a + base_r * base_a * (1.0 - top_a)) / out_a;
    let out_g = (g * top_a + base_g * base_a * (1.0 - top_a)) / out_a;
    let out_b = (b * top_a + base_b * base_a * (1.0 - top_a)) / out_a;

    Rgba([
        (out_r * 255.0).round().clamp(0.0, 255.0) as u8,
        (out_g * 255.0).round().clamp(0.0, 255.0) as u8,
        (out_b * 255.0).round().clamp(0.0, 255.0) as u8,
        (out_a * 255.0).round().clamp(0.0, 255.0) as u8,
    ])
}

fn overlay_channel(base: f32, top: f32) -> f32 {
    if base < 0.5 {
        2.0 * base * top
    } else {
        1.0 - 2.0 * (1.0 - base) * (1.0 - top)
    }
}

/// W3C Soft Light formula.
fn soft_light_channel(base: f32, top: f32) -> f32 {
    if top <= 0.5 {
        base - (1.0 - 2.0 * top) * base * (1.0 - base)
    } else {
        let d = if base <= 0.25 {
            ((16.0 * base - 12.0) * base + 4.0) * base
        } else {
            base.sqrt()
        };
        base + (2.0 * top - 1.0) * (d - base)
    }
}

// ============================================================================
// LAYERS
// ============================================================================

/// Anything that can hand out its pixels as a bitmap of exactly canvas size,
/// aligned to the canvas origin. Pixels outside the drawable's own extent
/// are transparent.
pub trait CanvasImage {
    fn canvas_sized_sub_image(&self, canvas_w: u32, canvas_h: u32) -> RgbaImage;
}

/// Raster pixels, possibly larger than the canvas or moved off its origin.
#[derive(Clone)]
pub struct ImageLayer {
    pub pixels: TiledImage,
    /// Canvas position of the bitmap's top-left pixel.
    pub offset_x: i32,
    pub offset_y: i32,
}

impl ImageLayer {
    pub fn new(pixels: TiledImage) -> Self {
        Self { pixels, offset_x: 0, offset_y: 0 }
    }
}

impl CanvasImage for ImageLayer {
    fn canvas_sized_sub_image(&self, canvas_w: u32, canvas_h: u32) -> RgbaImage {
        self.pixels.extract_region(-self.offset_x, -self.offset_y, canvas_w, canvas_h)
    }
}

/// Single-channel visibility mask aligned to the canvas grid.
/// 255 reveals the host layer, 0 hides it.
#[derive(Clone)]
pub struct LayerMask {
    pub pixels: GrayImage,
    /// Disabled masks are kept but ignored when compositing.
    pub enabled: bool,
}

impl LayerMask {
    /// A mask that reveals the whole layer.
    pub fn reveal_all(width: u32, height: u32) -> Self {
        Self::from_gray(GrayImage::from_pixel(width, height, Luma([255])))
    }

    pub fn from_gray(pixels: GrayImage) -> Self {
        Self { pixels, enabled: true }
    }

    /// Mask value at a canvas pixel; outside the mask grid nothing is hidden.
    #[inline]
    pub fn value_at(&self, x: u32, y: u32) -> u8 {
        if x < self.pixels.width() && y < self.pixels.height() {
            self.pixels.get_pixel(x, y).0[0]
        } else {
            255
        }
    }
}

impl CanvasImage for LayerMask {
    /// Renders the mask as opaque grayscale. If the mask grid doesn't cover
    /// the whole canvas the remainder stays transparent.
    fn canvas_sized_sub_image(&self, canvas_w: u32, canvas_h: u32) -> RgbaImage {
        let mut out = RgbaImage::new(canvas_w, canvas_h);
        let w = self.pixels.width().min(canvas_w);
        let h = self.pixels.height().min(canvas_h);
        for y in 0..h {
            for x in 0..w {
                let v = self.pixels.get_pixel(x, y).0[0];
                out.put_pixel(x, y, Rgba([v, v, v, 255]));
            }
        }
        out
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdjustmentKind {
    Invert,
    Desaturate,
}

impl AdjustmentKind {
    /// Apply the adjustment to one pixel; alpha is preserved.
    pub fn apply(&self, px: Rgba<u8>) -> Rgba<u8> {
        match self {
            AdjustmentKind::Invert => Rgba([255 - px[0], 255 - px[1], 255 - px[2], px[3]]),
            AdjustmentKind::Desaturate => {
                let lum = (0.2126 * px[0] as f32 + 0.7152 * px[1] as f32 + 0.0722 * px[2] as f32)
                    .round()
                    .clamp(0.0, 255.0) as u8;
                Rgba([lum, lum, lum, px[3]])
            }
        }
    }
}

/// Non-destructive adjustment applied to everything below it.
/// Has no pixels of its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdjustmentLayer {
    pub kind: AdjustmentKind,
}

#[derive(Clone)]
pub enum LayerContent {
    Image(ImageLayer),
    Text(TextLayer),
    Adjustment(AdjustmentLayer),
}

/// A drawable resolved from a layer, ready to produce canvas-sized pixels.
pub enum Drawable<'a> {
    /// Image layers and masks.
    Pixels(&'a dyn CanvasImage),
    Text(&'a TextLayer),
    /// No pixels of its own (e.g. adjustment layers).
    Unsupported,
}

impl Drawable<'_> {
    /// Canvas-sized bitmap of this drawable, `None` for unsupported variants.
    /// The result is always freshly allocated.
    pub fn canvas_sized_image(&self, canvas_w: u32, canvas_h: u32) -> Option<RgbaImage> {
        match self {
            Drawable::Pixels(img) => Some(img.canvas_sized_sub_image(canvas_w, canvas_h)),
            Drawable::Text(text) => Some(text.rasterize(canvas_w, canvas_h)),
            Drawable::Unsupported => None,
        }
    }
}

impl LayerContent {
    pub fn drawable(&self) -> Drawable<'_> {
        match self {
            LayerContent::Image(img) => Drawable::Pixels(img),
            LayerContent::Text(text) => Drawable::Text(text),
            LayerContent::Adjustment(_) => Drawable::Unsupported,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            LayerContent::Image(_) => "image",
            LayerContent::Text(_) => "text",
            LayerContent::Adjustment(_) => "adjustment",
        }
    }
}

#[derive(Clone)]
pub struct Layer {
    pub name: String,
    pub visible: bool,
    pub opacity: f32,
    pub blend_mode: BlendMode,
    pub content: LayerContent,
    mask: Option<LayerMask>,
    mask_editing: bool,
}

impl Layer {
    /// Image layer of the given size filled with `fill_color`.
    pub fn new(name: String, width: u32, height: u32, fill_color: Rgba<u8>) -> Self {
        let pixels = TiledImage::new_filled(width, height, fill_color);
        Self::with_content(name, LayerContent::Image(ImageLayer::new(pixels)))
    }

    pub fn from_image(name: String, img: &RgbaImage) -> Self {
        let pixels = TiledImage::from_rgba_image(img);
        Self::with_content(name, LayerContent::Image(ImageLayer::new(pixels)))
    }

    pub fn text(name: String, text: TextLayer) -> Self {
        Self::with_content(name, LayerContent::Text(text))
    }

    pub fn adjustment(name: String, kind: AdjustmentKind) -> Self {
        Self::with_content(name, LayerContent::Adjustment(AdjustmentLayer { kind }))
    }

    pub fn with_content(name: String, content: LayerContent) -> Self {
        Self {
            name,
            visible: true,
            opacity: 1.0,
            blend_mode: BlendMode::Normal,
            content,
            mask: None,
            mask_editing: false,
        }
    }

    pub fn mask(&self) -> Option<&LayerMask> {
        self.mask.as_ref()
    }

    pub fn set_mask(&mut self, mask: LayerMask) {
        self.mask = Some(mask);
    }

    /// Remove the mask; mask editing ends with it.
    pub fn remove_mask(&mut self) -> Option<LayerMask> {
        self.mask_editing = false;
        self.mask.take()
    }

    /// True when edits (and copies) target the mask rather than the layer.
    /// Always false for a layer without a mask.
    pub fn is_mask_editing(&self) -> bool {
        self.mask_editing && self.mask.is_some()
    }

    pub fn set_mask_editing(&mut self, editing: bool) {
        self.mask_editing = editing && self.mask.is_some();
    }

    /// Multiplier the (enabled) mask applies to this layer at a canvas pixel.
    #[inline]
    fn mask_factor(&self, x: u32, y: u32) -> f32 {
        match &self.mask {
            Some(m) if m.enabled => m.value_at(x, y) as f32 / 255.0,
            _ => 1.0,
        }
    }
}

// ============================================================================
// COMPOSITION
// ============================================================================

/// A document: fixed-size canvas, ordered layer stack (bottom first),
/// active layer, optional selection and a cached composite.
///
/// Code that changes layer pixels or properties through the public fields
/// must call [`Composition::mark_dirty`] afterwards so the composite is rebuilt.
pub struct Composition {
    pub id: Uuid,
    pub layers: Vec<Layer>,
    pub active_layer_index: usize,
    pub width: u32,
    pub height: u32,
    selection: Option<Selection>,
    composite_cache: OnceLock<RgbaImage>,
}

impl Composition {
    /// New document with a single opaque white "Background" layer.
    pub fn new(width: u32, height: u32) -> Self {
        let white = Rgba([255, 255, 255, 255]);
        let mut comp = Self::empty(width, height);
        let background = Layer::new("Background".to_string(), comp.width, comp.height, white);
        comp.layers.push(background);
        comp
    }

    /// New document without layers; callers must add one before use.
    pub fn empty(width: u32, height: u32) -> Self {
        let (width, height) = if width == 0 || height == 0 {
            log_warn!("Composition::empty: zero-sized canvas {}×{}, clamped to 1×1", width, height);
            (width.max(1), height.max(1))
        } else {
            (width, height)
        };
        Self {
            id: Uuid::new_v4(),
            layers: Vec::new(),
            active_layer_index: 0,
            width,
            height,
            selection: None,
            composite_cache: OnceLock::new(),
        }
    }

    /// Push a layer on top of the stack and make it active.
    pub fn add_layer(&mut self, layer: Layer) -> usize {
        self.layers.push(layer);
        self.active_layer_index = self.layers.len() - 1;
        self.mark_dirty();
        self.active_layer_index
    }

    /// The active layer.
    ///
    /// # Panics
    /// If the composition has no layer at `active_layer_index`; a document
    /// always has an active layer.
    pub fn active_layer(&self) -> &Layer {
        &self.layers[self.active_layer_index]
    }

    /// Mutable access to the active layer. Invalidates the composite.
    pub fn get_active_layer_mut(&mut self) -> Option<&mut Layer> {
        self.mark_dirty();
        self.layers.get_mut(self.active_layer_index)
    }

    // ---- selection -----------------------------------------------------------

    pub fn has_selection(&self) -> bool {
        self.selection.is_some()
    }

    pub fn selection(&self) -> Option<&Selection> {
        self.selection.as_ref()
    }

    pub fn set_selection(&mut self, selection: Selection) {
        self.selection = Some(selection);
    }

    /// Clear (remove) the current selection.
    pub fn clear_selection(&mut self) {
        self.selection = None;
    }

    /// Apply a selection shape according to `mode`. Subtracting or
    /// intersecting with no existing selection leaves nothing selected.
    pub fn apply_selection_shape(&mut self, shape: SelectionShape, mode: SelectionMode) {
        match (&mut self.selection, mode) {
            (Some(sel), _) => sel.combine(shape, mode),
            (None, SelectionMode::Replace | SelectionMode::Add) => {
                self.selection = Some(Selection::new(shape));
            }
            (None, SelectionMode::Subtract | SelectionMode::Intersect) => {}
        }
    }

    /// Translate the selection by (dx, dy) pixels.
    pub fn translate_selection(&mut self, dx: i32, dy: i32) {
        if let Some(sel) = &mut self.selection {
            sel.translate(dx as f32, dy as f32);
        }
    }

    // ---- compositing ---------------------------------------------------------

    /// Invalidate the cached composite.
    pub fn mark_dirty(&mut self) {
        self.composite_cache = OnceLock::new();
    }

    /// The cached composite of all visible layers (exactly `width × height`),
    /// built on first use after the last `mark_dirty`. Shared; clone before mutating.
    pub fn composite_image(&self) -> &RgbaImage {
        self.composite_cache.get_or_init(|| self.composite())
    }

    /// Blend all visible layers bottom-to-top into a fresh bitmap.
    /// Rows are processed in parallel with rayon.
    pub fn composite(&self) -> RgbaImage {
        let (w, h) = (self.width, self.height);
        let mut result = RgbaImage::new(w, h);
        let stride = w as usize * 4;

        for layer in &self.layers {
            if !layer.visible || layer.opacity <= 0.0 { continue; }

            if let LayerContent::Adjustment(adj) = &layer.content {
                result.par_chunks_mut(stride).enumerate().for_each(|(y, row)| {
                    for (x, px) in row.chunks_exact_mut(4).enumerate() {
                        if px[3] == 0 { continue; }
                        let base = Rgba([px[0], px[1], px[2], px[3]]);
                        let opacity = layer.opacity * layer.mask_factor(x as u32, y as u32);
                        let out = blend_pixel(base, adj.kind.apply(base), layer.blend_mode, opacity);
                        px.copy_from_slice(&out.0);
                    }
                });
                continue;
            }

            let Some(top) = layer.content.drawable().canvas_sized_image(w, h) else { continue };
            result
                .par_chunks_mut(stride)
                .zip(top.par_chunks(stride))
                .enumerate()
                .for_each(|(y, (row, top_row))| {
                    for (x, (px, tp)) in row.chunks_exact_mut(4).zip(top_row.chunks_exact(4)).enumerate() {
                        if tp[3] == 0 { continue; }
                        let opacity = layer.opacity * layer.mask_factor(x as u32, y as u32);
                        let base = Rgba([px[0], px[1], px[2], px[3]]);
                        let top_px = Rgba([tp[0], tp[1], tp[2], tp[3]]);
                        let out = blend_pixel(base, top_px, layer.blend_mode, opacity);
                        px.copy_from_slice(&out.0);
                    }
                });
        }
        result
    }
}

impl fmt::Debug for Composition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Composition")
            .field("id", &self.id)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("layers", &self.layers.len())
            .field("active_layer_index", &self.active_layer_index)
            .field("selection", &self.selection)
            .finish()
    }
}
