use std::borrow::Cow;
use std::path::Path;

use image::{GrayImage, Luma, Rgba, RgbaImage};
use pretty_assertions::assert_eq;

use paintfe_copy::canvas::{ImageLayer, LayerContent, PixelRect, TiledImage};
use paintfe_copy::ops::text::{load_font_file, TextLayer, TextStyle};
use paintfe_copy::{Composition, CopySource, Layer, LayerMask, Selection, SelectionMode, SelectionShape};

const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);
const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);
const CLEAR: Rgba<u8> = Rgba([0, 0, 0, 0]);

fn checker(w: u32, h: u32) -> RgbaImage {
    RgbaImage::from_fn(w, h, |x, y| Rgba([(x * 17) as u8, (y * 23) as u8, ((x + y) * 5) as u8, 255]))
}

/// Document whose active layer holds `pixels`, over a white background.
fn doc_with(pixels: &RgbaImage) -> Composition {
    let mut comp = Composition::new(pixels.width(), pixels.height());
    comp.add_layer(Layer::from_image("Layer 1".into(), pixels));
    comp
}

fn copy_layer(comp: &Composition) -> Option<RgbaImage> {
    CopySource::LayerOrMask.image_for(comp).map(Cow::into_owned)
}

fn sub_image(src: &RgbaImage, x: u32, y: u32, w: u32, h: u32) -> RgbaImage {
    image::imageops::crop_imm(src, x, y, w, h).to_image()
}

fn any_system_font() -> Option<ab_glyph::FontArc> {
    [
        "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
        "/usr/share/fonts/dejavu/DejaVuSans.ttf",
        "/usr/share/fonts/TTF/DejaVuSans.ttf",
        "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
        "/System/Library/Fonts/Supplemental/Arial.ttf",
        "C:\\Windows\\Fonts\\arial.ttf",
    ]
    .iter()
    .find_map(|p| load_font_file(Path::new(p)).ok())
}

fn has_ink(img: &RgbaImage) -> bool {
    img.pixels().any(|p| p[3] > 0)
}

#[test]
fn layer_copy_without_selection_is_canvas_sized() {
    let mut pixels = RgbaImage::new(4, 4);
    pixels.put_pixel(1, 1, RED);
    let comp = doc_with(&pixels);

    let out = copy_layer(&comp).unwrap();
    assert_eq!(out.dimensions(), (4, 4));
    assert_eq!(*out.get_pixel(1, 1), RED);
    assert_eq!(*out.get_pixel(0, 0), CLEAR);
    assert_eq!(out, pixels);
}

#[test]
fn rectangular_selection_copies_bounds() {
    let pixels = checker(10, 10);
    let mut comp = doc_with(&pixels);
    comp.set_selection(Selection::new(SelectionShape::rect(2.0, 3.0, 5.0, 4.0)));

    let out = copy_layer(&comp).unwrap();
    assert_eq!(out.dimensions(), (5, 4));
    assert_eq!(out, sub_image(&pixels, 2, 3, 5, 4));
}

#[test]
fn selection_outside_canvas_copies_nothing() {
    let mut comp = doc_with(&checker(8, 8));
    comp.set_selection(Selection::new(SelectionShape::rect(20.0, 20.0, 3.0, 3.0)));
    assert!(copy_layer(&comp).is_none());
}

#[test]
fn selection_straddling_canvas_edge_is_clipped() {
    let pixels = checker(8, 8);
    let mut comp = doc_with(&pixels);
    comp.set_selection(Selection::new(SelectionShape::rect(6.0, 6.0, 5.0, 5.0)));

    let out = copy_layer(&comp).unwrap();
    assert_eq!(out.dimensions(), (2, 2));
    assert_eq!(out, sub_image(&pixels, 6, 6, 2, 2));
}

#[test]
fn triangle_selection_masks_outside_pixels() {
    let pixels = RgbaImage::from_pixel(10, 10, WHITE);
    let mut comp = doc_with(&pixels);
    comp.set_selection(Selection::new(SelectionShape::Polygon {
        points: vec![(0.0, 0.0), (10.0, 0.0), (0.0, 10.0)],
    }));

    let out = copy_layer(&comp).unwrap();
    assert_eq!(out.dimensions(), (10, 10));
    assert_eq!(*out.get_pixel(0, 0), WHITE);
    assert_eq!(*out.get_pixel(9, 9), CLEAR);
    for (x, y, px) in out.enumerate_pixels() {
        // Everything strictly below the hypotenuse (by pixel centre) is cleared.
        if (x as f32 + 0.5) + (y as f32 + 0.5) > 10.0 {
            assert_eq!(*px, CLEAR, "pixel ({}, {})", x, y);
        }
    }
}

#[test]
fn mask_editing_copies_the_mask() {
    let mut comp = doc_with(&RgbaImage::from_pixel(3, 3, RED));
    let mut gray = GrayImage::new(3, 3);
    gray.put_pixel(0, 0, Luma([200]));
    gray.put_pixel(2, 1, Luma([40]));

    let layer = comp.get_active_layer_mut().unwrap();
    layer.set_mask(LayerMask::from_gray(gray));
    layer.set_mask_editing(true);

    let out = copy_layer(&comp).unwrap();
    assert_eq!(out.dimensions(), (3, 3));
    assert_eq!(*out.get_pixel(0, 0), Rgba([200, 200, 200, 255]));
    assert_eq!(*out.get_pixel(2, 1), Rgba([40, 40, 40, 255]));
    assert_eq!(*out.get_pixel(1, 1), Rgba([0, 0, 0, 255]));
    assert!(out.pixels().all(|p| p[0] == p[1] && p[1] == p[2]));
}

#[test]
fn mask_copy_follows_the_mask_not_the_layer() {
    let gray = GrayImage::from_fn(4, 4, |x, _| Luma([x as u8 * 60]));
    let mut before = None;
    for fill in [RED, Rgba([0, 0, 255, 128])] {
        let mut comp = doc_with(&RgbaImage::from_pixel(4, 4, fill));
        let layer = comp.get_active_layer_mut().unwrap();
        layer.set_mask(LayerMask::from_gray(gray.clone()));
        layer.set_mask_editing(true);
        let out = copy_layer(&comp).unwrap();
        if let Some(prev) = &before {
            assert_eq!(&out, prev);
        }
        before = Some(out);
    }
}

#[test]
fn text_layer_copy_matches_fresh_rasterization() {
    let style = TextStyle { font_size: 12.0, color: [0, 0, 255, 255], ..TextStyle::default() };
    let Some(font) = any_system_font() else {
        eprintln!("skipping text_layer_copy_matches_fresh_rasterization: no system font found");
        return;
    };
    let text = TextLayer::new("A", Some(font)).with_style(style).at(2.0, 1.0);
    let expected = text.rasterize(16, 16);
    assert!(has_ink(&expected), "glyph 'A' left no pixels");

    let mut comp = Composition::new(16, 16);
    comp.add_layer(Layer::text("Text".into(), text));

    let out = copy_layer(&comp).unwrap();
    assert_eq!(out.dimensions(), (16, 16));
    assert_eq!(out, expected);
}

#[test]
fn composite_ignores_selection_and_is_canvas_sized() {
    let mut pixels = RgbaImage::new(6, 4);
    pixels.put_pixel(2, 2, RED);
    let mut comp = doc_with(&pixels);
    comp.set_selection(Selection::new(SelectionShape::rect(100.0, 100.0, 1.0, 1.0)));

    let out = CopySource::Composite.image_for(&comp).unwrap();
    assert_eq!(out.dimensions(), (6, 4));
    assert_eq!(*out.get_pixel(2, 2), RED);
    assert_eq!(*out.get_pixel(0, 0), WHITE);
}

#[test]
fn composite_is_borrowed_and_stable() {
    let comp = doc_with(&checker(5, 5));
    let a = CopySource::Composite.image_for(&comp).unwrap();
    let b = CopySource::Composite.image_for(&comp).unwrap();
    assert!(matches!(a, Cow::Borrowed(_)));
    assert!(std::ptr::eq(&*a, &*b));
    assert_eq!(a, b);
}

#[test]
fn composite_refreshes_after_mark_dirty() {
    let mut comp = doc_with(&RgbaImage::new(2, 2));
    assert_eq!(*comp.composite_image().get_pixel(0, 0), WHITE);

    if let Some(layer) = comp.get_active_layer_mut()
        && let LayerContent::Image(img) = &mut layer.content
    {
        img.pixels.put_pixel(0, 0, RED);
    }
    let out = CopySource::Composite.image_for(&comp).unwrap();
    assert_eq!(*out.get_pixel(0, 0), RED);
}

#[test]
fn full_canvas_selection_equals_unselected_copy() {
    let mut comp = doc_with(&checker(7, 5));
    let whole = copy_layer(&comp).unwrap();
    comp.set_selection(Selection::new(SelectionShape::rect(0.0, 0.0, 7.0, 5.0)));
    assert_eq!(copy_layer(&comp).unwrap(), whole);
}

#[test]
fn pixels_outside_ellipse_are_transparent() {
    let pixels = RgbaImage::from_pixel(12, 12, RED);
    let mut comp = doc_with(&pixels);
    let ellipse = SelectionShape::Ellipse { cx: 6.0, cy: 6.0, rx: 5.0, ry: 3.0 };
    comp.set_selection(Selection::new(ellipse.clone()));

    let out = copy_layer(&comp).unwrap();
    let area = ellipse.bounds();
    assert_eq!(out.dimensions(), (area.width, area.height));
    let mask = ellipse.rasterize(area);
    for (x, y, px) in out.enumerate_pixels() {
        if mask.get_pixel(x, y).0[0] == 0 {
            assert_eq!(*px, CLEAR);
        } else {
            assert_eq!(*px, RED);
        }
    }
}

#[test]
fn combined_selection_bounds_drive_output_size() {
    let pixels = checker(10, 10);
    let mut comp = doc_with(&pixels);
    comp.apply_selection_shape(SelectionShape::rect(1.0, 1.0, 2.0, 2.0), SelectionMode::Replace);
    comp.apply_selection_shape(SelectionShape::rect(6.0, 5.0, 2.0, 3.0), SelectionMode::Add);

    let out = copy_layer(&comp).unwrap();
    assert_eq!(out.dimensions(), (7, 7));
    assert_eq!(*out.get_pixel(0, 0), *pixels.get_pixel(1, 1));
    assert_eq!(*out.get_pixel(5, 4), *pixels.get_pixel(6, 5));
    assert_eq!(*out.get_pixel(3, 0), CLEAR);

    // Cutting the bottom row off the lower rectangle shrinks the copy.
    comp.apply_selection_shape(SelectionShape::rect(6.0, 7.0, 2.0, 1.0), SelectionMode::Subtract);
    let out = copy_layer(&comp).unwrap();
    assert_eq!(out.dimensions(), (7, 6));
    assert_eq!(*out.get_pixel(6, 5), *pixels.get_pixel(7, 6));
}

#[test]
fn selection_subtracted_to_nothing_copies_nothing() {
    let mut comp = doc_with(&checker(6, 6));
    comp.apply_selection_shape(SelectionShape::rect(1.0, 1.0, 4.0, 4.0), SelectionMode::Replace);
    comp.apply_selection_shape(SelectionShape::rect(0.0, 0.0, 6.0, 6.0), SelectionMode::Subtract);
    assert!(copy_layer(&comp).is_none());
    assert!(CopySource::Composite.image_for(&comp).is_some());
}

#[test]
fn offset_layer_copy_uses_canvas_coordinates() {
    let mut tiled = TiledImage::new(20, 20);
    tiled.put_pixel(5, 5, RED);
    let mut comp = Composition::new(8, 8);
    comp.add_layer(Layer::with_content(
        "Moved".into(),
        LayerContent::Image(ImageLayer { pixels: tiled, offset_x: -3, offset_y: -4 }),
    ));

    let out = copy_layer(&comp).unwrap();
    assert_eq!(out.dimensions(), (8, 8));
    assert_eq!(*out.get_pixel(2, 1), RED);
    assert_eq!(out.pixels().filter(|p| p[3] > 0).count(), 1);
}

#[test]
fn copy_does_not_mutate_the_active_layer() {
    let pixels = checker(6, 6);
    let mut comp = doc_with(&pixels);
    comp.set_selection(Selection::new(SelectionShape::Ellipse { cx: 3.0, cy: 3.0, rx: 2.0, ry: 2.0 }));
    let _ = copy_layer(&comp);

    let LayerContent::Image(img) = &comp.active_layer().content else {
        panic!("active layer should be an image layer");
    };
    assert_eq!(img.pixels.to_rgba_image(), pixels);
    assert_eq!(comp.selection().map(Selection::bounds), Some(PixelRect::new(1, 1, 4, 4)));
}

#[test]
#[should_panic]
fn missing_active_layer_is_a_precondition_violation() {
    let comp = Composition::empty(4, 4);
    let _ = CopySource::LayerOrMask.image_for(&comp);
}
