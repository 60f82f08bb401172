use std::collections::HashMap;
use std::path::Path;

use ab_glyph::{point, Font, FontArc, GlyphId, ScaleFont};
use image::RgbaImage;

/// Cache for rasterized glyph pixel data. Key: (GlyphId, font_size_bits).
/// Value: (pixels as (x, y, coverage), bounds_min_x, bounds_min_y) at origin zero.
pub type GlyphPixelCache = HashMap<(GlyphId, u32), (Vec<(u32, u32, f32)>, f32, f32)>;

/// Horizontal alignment of each line relative to the layer origin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TextAlignment {
    #[default]
    Left,
    Center,
    Right,
}

impl TextAlignment {
    /// X shift applied to a line of the given width.
    fn offset(&self, line_width: f32) -> f32 {
        match self {
            TextAlignment::Left => 0.0,
            TextAlignment::Center => -line_width * 0.5,
            TextAlignment::Right => -line_width,
        }
    }
}

/// Appearance of a text layer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TextStyle {
    pub font_size: f32,
    /// Straight RGBA; alpha scales glyph coverage.
    pub color: [u8; 4],
    pub alignment: TextAlignment,
    pub anti_alias: bool,
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub strikethrough: bool,
}

impl Default for TextStyle {
    fn default() -> Self {
        Self {
            font_size: 24.0,
            color: [0, 0, 0, 255],
            alignment: TextAlignment::Left,
            anti_alias: true,
            bold: false,
            italic: false,
            underline: false,
            strikethrough: false,
        }
    }
}

/// Lay out a single line of text at the given size.
/// Returns `(glyphs as (id, x, y), total_width)` with the alignment offset applied.
pub fn layout_line(
    font: &FontArc,
    text: &str,
    font_size: f32,
    alignment: TextAlignment,
) -> (Vec<(GlyphId, f32, f32)>, f32) {
    let scaled = font.as_scaled(font_size);
    let ascent = scaled.ascent();

    let mut glyphs = Vec::new();
    let mut cursor_x = 0.0f32;
    let mut last_glyph: Option<GlyphId> = None;

    for ch in text.chars() {
        let glyph_id = font.glyph_id(ch);
        if let Some(prev) = last_glyph {
            cursor_x += scaled.kern(prev, glyph_id);
        }
        glyphs.push((glyph_id, cursor_x, ascent));
        cursor_x += scaled.h_advance(glyph_id);
        last_glyph = Some(glyph_id);
    }

    let offset = alignment.offset(cursor_x);
    for glyph in &mut glyphs {
        glyph.1 += offset;
    }

    (glyphs, cursor_x)
}

/// Coverage of rasterized text, clipped to the canvas.
/// `buf` is RGBA, `buf_w × buf_h`, placed at canvas `(off_x, off_y)`.
pub struct RasterizedText {
    pub buf: Vec<u8>,
    pub buf_w: u32,
    pub buf_h: u32,
    pub off_x: i32,
    pub off_y: i32,
}

impl RasterizedText {
    fn empty() -> Self {
        Self { buf: Vec::new(), buf_w: 0, buf_h: 0, off_x: 0, off_y: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.buf_w == 0 || self.buf_h == 0
    }
}

/// Rasterize text glyphs into an RGBA buffer clipped to the canvas.
///
/// `(origin_x, origin_y)` is the top-left of the first line box in canvas
/// coordinates. Lines are separated by `'\n'`. `coverage_buf` and
/// `glyph_cache` can be reused across calls.
#[allow(clippy::too_many_arguments)]
pub fn rasterize_text(
    font: &FontArc,
    text: &str,
    style: &TextStyle,
    origin_x: f32,
    origin_y: f32,
    canvas_w: u32,
    canvas_h: u32,
    coverage_buf: &mut Vec<f32>,
    glyph_cache: &mut GlyphPixelCache,
) -> RasterizedText {
    let font_size = style.font_size;
    if font_size.is_nan() || font_size <= 0.0 {
        return RasterizedText::empty();
    }
    let scaled = font.as_scaled(font_size);
    let ascent = scaled.ascent();
    let line_height = scaled.height();

    let mut all_glyphs: Vec<(GlyphId, f32, f32)> = Vec::new();
    let mut line_widths: Vec<f32> = Vec::new();

    for (line_idx, line) in text.split('\n').enumerate() {
        let y_offset = line_idx as f32 * line_height;
        let (glyphs, width) = layout_line(font, line, font_size, style.alignment);
        all_glyphs.extend(glyphs.into_iter().map(|(id, x, y)| (id, x, y + y_offset)));
        line_widths.push(width);
    }

    let decorated = style.underline || style.strikethrough;
    if all_glyphs.is_empty() && !decorated {
        return RasterizedText::empty();
    }

    // Bounding box of all glyphs in layout space
    let mut min_x = f32::MAX;
    let mut min_y = f32::MAX;
    let mut max_x = f32::MIN;
    let mut max_y = f32::MIN;

    for &(glyph_id, gx, gy) in &all_glyphs {
        let glyph = glyph_id.with_scale_and_position(font_size, point(gx, gy));
        let bounds = font.glyph_bounds(&glyph);
        min_x = min_x.min(bounds.min.x);
        min_y = min_y.min(bounds.min.y);
        max_x = max_x.max(bounds.max.x);
        max_y = max_y.max(bounds.max.y);
    }

    if decorated {
        for (line_idx, &line_w) in line_widths.iter().enumerate() {
            let start = style.alignment.offset(line_w);
            let y_off = line_idx as f32 * line_height;
            min_x = min_x.min(start);
            max_x = max_x.max(start + line_w);
            min_y = min_y.min(y_off);
            max_y = max_y.max(y_off + ascent + font_size * 0.2);
        }
    }

    if min_x >= max_x || min_y >= max_y {
        return RasterizedText::empty();
    }

    // Pad for italic shear and bold smear
    let pad = 2.0 + if style.italic { font_size * 0.2 } else { 0.0 };
    let x0 = ((origin_x + min_x - pad).floor() as i32).max(0);
    let y0 = ((origin_y + min_y - 2.0).floor() as i32).max(0);
    let x1 = ((origin_x + max_x + pad).ceil() as i32).min(canvas_w as i32);
    let y1 = ((origin_y + max_y + 2.0).ceil() as i32).min(canvas_h as i32);
    let buf_w = (x1 - x0).max(0) as u32;
    let buf_h = (y1 - y0).max(0) as u32;

    if buf_w == 0 || buf_h == 0 {
        return RasterizedText::empty();
    }

    let needed = buf_w as usize * buf_h as usize;
    coverage_buf.resize(needed, 0.0);
    coverage_buf[..needed].fill(0.0);

    // Glyphs are cached at origin (0,0) and shifted to their layout position.
    let font_size_key = font_size.to_bits();
    for &(glyph_id, gx, gy) in &all_glyphs {
        let draw_x = gx.round();
        let draw_y = gy.round();
        let cache_key = (glyph_id, font_size_key);

        let (pixels, base_bx, base_by) = glyph_cache.entry(cache_key).or_insert_with(|| {
            let base_glyph = glyph_id.with_scale_and_position(font_size, point(0.0, 0.0));
            let mut px_list = Vec::new();
            match font.outline_glyph(base_glyph) {
                Some(outlined) => {
                    let b = outlined.px_bounds();
                    outlined.draw(|px, py, cov| px_list.push((px, py, cov)));
                    (px_list, b.min.x, b.min.y)
                }
                None => (px_list, 0.0, 0.0),
            }
        });

        let actual_bx = *base_bx + draw_x;
        let actual_by = *base_by + draw_y;
        let baseline_y = origin_y + draw_y;

        for &(px, py, cov) in pixels.iter() {
            let mut cx = px as f32 + origin_x + actual_bx;
            let cy = py as f32 + origin_y + actual_by;
            if style.italic {
                cx += (baseline_y - cy) * 0.2;
            }

            let ix = cx.round() as i32 - x0;
            let iy = cy.round() as i32 - y0;
            if ix < 0 || iy < 0 || ix as u32 >= buf_w || iy as u32 >= buf_h {
                continue;
            }
            let idx = iy as usize * buf_w as usize + ix as usize;
            let v = if style.anti_alias { cov } else if cov > 0.5 { 1.0 } else { 0.0 };
            coverage_buf[idx] = coverage_buf[idx].max(v);
            if style.bold && ix + 1 < buf_w as i32 {
                coverage_buf[idx + 1] = coverage_buf[idx + 1].max(v);
            }
        }
    }

    let thickness = (font_size * 0.06).max(1.0);
    for (line_idx, &line_w) in line_widths.iter().enumerate() {
        if line_w < 0.1 { continue; }
        let y_off = origin_y + line_idx as f32 * line_height;
        let start_x = origin_x + style.alignment.offset(line_w);
        let mut rule = |line_y: f32| {
            fill_rule(&mut coverage_buf[..needed], buf_w, buf_h, (x0, y0), start_x, line_y, line_w, thickness)
        };
        if style.underline {
            rule(y_off + ascent + font_size * 0.1);
        }
        if style.strikethrough {
            rule(y_off + ascent * 0.6);
        }
    }

    let color = style.color;
    let mut buf = vec![0u8; needed * 4];
    for (px, &cov) in buf.chunks_exact_mut(4).zip(coverage_buf[..needed].iter()) {
        if cov > 0.001 {
            let a = (color[3] as f32 * cov).round().min(255.0) as u8;
            px.copy_from_slice(&[color[0], color[1], color[2], a]);
        }
    }

    RasterizedText { buf, buf_w, buf_h, off_x: x0, off_y: y0 }
}

/// Solid horizontal rule (underline / strikethrough) in coverage space.
#[allow(clippy::too_many_arguments)]
fn fill_rule(
    coverage: &mut [f32],
    buf_w: u32,
    buf_h: u32,
    (x0, y0): (i32, i32),
    start_x: f32,
    line_y: f32,
    width: f32,
    thickness: f32,
) {
    let half_t = thickness * 0.5;
    let ly0 = ((line_y - half_t).floor() as i32 - y0).max(0);
    let ly1 = ((line_y + half_t).ceil() as i32 - y0).min(buf_h as i32);
    let lx0 = (start_x.floor() as i32 - x0).max(0);
    let lx1 = ((start_x + width).ceil() as i32 - x0).min(buf_w as i32);

    for ly in ly0..ly1 {
        let row = ly as usize * buf_w as usize;
        for lx in lx0..lx1 {
            coverage[row + lx as usize] = 1.0;
        }
    }
}

/// Load a TrueType/OpenType font from disk.
pub fn load_font_file(path: &Path) -> Result<FontArc, String> {
    let data = std::fs::read(path).map_err(|e| format!("cannot read font {}: {}", path.display(), e))?;
    FontArc::try_from_vec(data).map_err(|e| format!("invalid font {}: {}", path.display(), e))
}

/// Editable text kept as text; pixels are produced on demand.
#[derive(Clone)]
pub struct TextLayer {
    pub text: String,
    /// Without a font the layer renders nothing.
    pub font: Option<FontArc>,
    pub style: TextStyle,
    /// Top-left of the first line box, canvas coordinates.
    pub origin_x: f32,
    pub origin_y: f32,
}

impl TextLayer {
    pub fn new(text: impl Into<String>, font: Option<FontArc>) -> Self {
        Self {
            text: text.into(),
            font,
            style: TextStyle::default(),
            origin_x: 0.0,
            origin_y: 0.0,
        }
    }

    pub fn with_style(mut self, style: TextStyle) -> Self {
        self.style = style;
        self
    }

    pub fn at(mut self, x: f32, y: f32) -> Self {
        self.origin_x = x;
        self.origin_y = y;
        self
    }

    /// Freshly rasterize the text into a transparent canvas-sized bitmap.
    pub fn rasterize(&self, canvas_w: u32, canvas_h: u32) -> RgbaImage {
        let mut canvas = RgbaImage::new(canvas_w, canvas_h);
        let Some(font) = &self.font else {
            return canvas;
        };

        let mut coverage = Vec::new();
        let mut cache = GlyphPixelCache::new();
        let r = rasterize_text(
            font, &self.text, &self.style,
            self.origin_x, self.origin_y,
            canvas_w, canvas_h,
            &mut coverage, &mut cache,
        );
        if r.is_empty() {
            return canvas;
        }

        let canvas_stride = canvas_w as usize * 4;
        let row_bytes = r.buf_w as usize * 4;
        let raw: &mut [u8] = &mut canvas;
        for (row, src) in r.buf.chunks_exact(row_bytes).enumerate() {
            let dst = (r.off_y as usize + row) * canvas_stride + r.off_x as usize * 4;
            raw[dst..dst + row_bytes].copy_from_slice(src);
        }
        canvas
    }
}

impl std::fmt::Debug for TextLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextLayer")
            .field("text", &self.text)
            .field("has_font", &self.font.is_some())
            .field("style", &self.style)
            .field("origin", &(self.origin_x, self.origin_y))
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Common system font locations; tests that need real glyphs skip when none exist.
    fn any_system_font() -> Option<FontArc> {
        const CANDIDATES: &[&str] = &[
            "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
            "/usr/share/fonts/dejavu/DejaVuSans.ttf",
            "/usr/share/fonts/TTF/DejaVuSans.ttf",
            "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
            "/System/Library/Fonts/Supplemental/Arial.ttf",
            "C:\\Windows\\Fonts\\arial.ttf",
        ];
        let font = CANDIDATES.iter().find_map(|p| load_font_file(Path::new(p)).ok());
        if font.is_none() {
            eprintln!("skipping glyph test: no system font found");
        }
        font
    }

    fn has_ink(img: &RgbaImage) -> bool {
        img.pixels().any(|p| p[3] > 0)
    }

    #[test]
    fn no_font_rasterizes_to_transparent_canvas() {
        let layer = TextLayer::new("A", None);
        let img = layer.rasterize(16, 8);
        assert_eq!(img.dimensions(), (16, 8));
        assert!(img.pixels().all(|p| p[3] == 0));
    }

    #[test]
    fn text_rasterizes_inside_canvas() {
        let Some(font) = any_system_font() else { return };
        let style = TextStyle { font_size: 14.0, color: [255, 0, 0, 255], ..TextStyle::default() };
        let layer = TextLayer::new("A", Some(font)).with_style(style).at(1.0, 0.0);
        let img = layer.rasterize(16, 16);
        assert_eq!(img.dimensions(), (16, 16));
        let opaque: Vec<_> = img.pixels().filter(|p| p[3] > 0).collect();
        assert!(!opaque.is_empty(), "glyph 'A' left no pixels");
        assert!(opaque.iter().all(|p| p[0] == 255 && p[1] == 0 && p[2] == 0));
    }

    #[test]
    fn text_off_canvas_is_clipped_away() {
        let Some(font) = any_system_font() else { return };
        let layer = TextLayer::new("Hello", Some(font));
        assert!(has_ink(&layer.rasterize(16, 16)));
        let layer = layer.at(500.0, 500.0);
        assert!(!has_ink(&layer.rasterize(16, 16)));
    }

    #[test]
    fn alignment_shifts_lines_left_of_origin() {
        let Some(font) = any_system_font() else { return };
        let (left, w) = layout_line(&font, "ab", 12.0, TextAlignment::Left);
        let (right, _) = layout_line(&font, "ab", 12.0, TextAlignment::Right);
        assert!(w > 0.0);
        assert!((left[0].1 - right[0].1 - w).abs() < 1e-3);
    }

    #[test]
    fn zero_font_size_draws_nothing() {
        let Some(font) = any_system_font() else { return };
        let layer = TextLayer::new("A", Some(font));
        assert!(has_ink(&layer.rasterize(24, 24)));
        let style = TextStyle { font_size: 0.0, ..TextStyle::default() };
        let layer = layer.with_style(style);
        assert!(!has_ink(&layer.rasterize(24, 24)));
    }
}
