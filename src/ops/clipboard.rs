// ============================================================================
// COPY SOURCES — which bitmap a Copy command puts on the clipboard
// ============================================================================

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use image::RgbaImage;
use rayon::prelude::*;

use crate::canvas::{Composition, Drawable, Layer, PixelRect, Selection};
use crate::{log_info, log_warn};

/// What a Copy command takes its pixels from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CopySource {
    /// The active layer, or its mask while the mask is being edited.
    /// Honours the selection.
    LayerOrMask,
    /// The flattened image. Ignores the selection.
    Composite,
}

impl CopySource {
    /// Menu text.
    pub fn label(&self) -> &'static str {
        match self {
            CopySource::LayerOrMask => "Copy Layer/Mask",
            CopySource::Composite => "Copy Composite",
        }
    }

    /// The bitmap to copy, or `None` when there is nothing to copy.
    ///
    /// `LayerOrMask` returns a freshly allocated bitmap; `Composite` borrows
    /// the composition's cached composite.
    ///
    /// # Panics
    /// `LayerOrMask` panics if the composition has no active layer.
    pub fn image_for<'a>(&self, comp: &'a Composition) -> Option<Cow<'a, RgbaImage>> {
        match self {
            CopySource::LayerOrMask => layer_or_mask_image(comp).map(Cow::Owned),
            CopySource::Composite => Some(Cow::Borrowed(comp.composite_image())),
        }
    }
}

impl fmt::Display for CopySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for CopySource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "layer" | "mask" | "layer-or-mask" | "layer/mask" => Ok(CopySource::LayerOrMask),
            "composite" | "merged" => Ok(CopySource::Composite),
            other => Err(format!("unknown copy source '{}' (expected layer or composite)", other)),
        }
    }
}

fn layer_or_mask_image(comp: &Composition) -> Option<RgbaImage> {
    let layer = comp.active_layer();
    let Some(image) = resolve_drawable(layer).canvas_sized_image(comp.width, comp.height) else {
        log_info!(
            "copy: active layer '{}' ({}) has no pixels of its own",
            layer.name,
            layer.content.kind_name()
        );
        return None;
    };

    match comp.selection() {
        None => Some(image),
        Some(sel) => {
            let clipped = clip_to_selection(&image, comp.width, comp.height, sel);
            if clipped.is_none() {
                log_info!("copy: selection {:?} covers no canvas pixels", sel.bounds());
            }
            clipped
        }
    }
}

// ---------------------------------------------------------------------------
//  Layer dispatch
// ---------------------------------------------------------------------------

/// Pick the drawable that supplies pixels for a layer copy: the mask while
/// it is being edited (whatever the layer kind), otherwise the layer content.
pub fn resolve_drawable(layer: &Layer) -> Drawable<'_> {
    if layer.is_mask_editing()
        && let Some(mask) = layer.mask()
    {
        return Drawable::Pixels(mask);
    }
    layer.content.drawable()
}

// ---------------------------------------------------------------------------
//  Selection clip
// ---------------------------------------------------------------------------

/// Cut the selected part out of a canvas-sized bitmap.
///
/// The result covers the selected area clipped to the canvas, moved to the
/// origin. Pixels outside the selection are fully transparent; partially
/// covered pixels keep their colour with scaled alpha. Returns `None` when
/// the selection encloses nothing or misses the canvas.
pub fn clip_to_selection(
    source: &RgbaImage,
    canvas_w: u32,
    canvas_h: u32,
    selection: &Selection,
) -> Option<RgbaImage> {
    let within = PixelRect::canvas(canvas_w, canvas_h)
        .intersect(&PixelRect::canvas(source.width(), source.height()))?;
    let (area, coverage) = selection.selected_area(within)?;
    let mut out = RgbaImage::new(area.width, area.height);

    let src_raw = source.as_raw();
    let src_stride = source.width() as usize * 4;
    let out_stride = area.width as usize * 4;
    let src_x = area.x as usize * 4;

    out.par_chunks_mut(out_stride)
        .zip(coverage.par_chunks(area.width as usize))
        .enumerate()
        .for_each(|(row, (dst, cov))| {
            let start = (area.y as usize + row) * src_stride + src_x;
            let src = &src_raw[start..start + out_stride];
            for ((d, s), &c) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)).zip(cov) {
                match c {
                    0 => {}
                    255 => d.copy_from_slice(s),
                    _ => {
                        d[..3].copy_from_slice(&s[..3]);
                        d[3] = ((s[3] as u32 * c as u32 + 127) / 255) as u8;
                    }
                }
            }
        });

    Some(out)
}

// ---------------------------------------------------------------------------
//  Internal clipboard (application-level, supports transparency)
// ---------------------------------------------------------------------------

static APP_CLIPBOARD: Mutex<Option<RgbaImage>> = Mutex::new(None);

pub fn set_clipboard_image(img: RgbaImage) {
    *APP_CLIPBOARD.lock().unwrap_or_else(|e| e.into_inner()) = Some(img);
}

/// A clone of the app clipboard contents.
pub fn get_clipboard_image() -> Option<RgbaImage> {
    APP_CLIPBOARD.lock().unwrap_or_else(|e| e.into_inner()).clone()
}

pub fn has_clipboard_image() -> bool {
    APP_CLIPBOARD.lock().unwrap_or_else(|e| e.into_inner()).is_some()
}

pub fn clear_clipboard() {
    *APP_CLIPBOARD.lock().unwrap_or_else(|e| e.into_inner()) = None;
}

// ---------------------------------------------------------------------------
//  System clipboard (OS-level via arboard)
// ---------------------------------------------------------------------------

/// Write an RGBA image to the system clipboard.
pub fn copy_to_system_clipboard(img: &RgbaImage) -> Result<(), String> {
    let mut clip = arboard::Clipboard::new().map_err(|e| format!("system clipboard unavailable: {}", e))?;
    let data = arboard::ImageData {
        width: img.width() as usize,
        height: img.height() as usize,
        bytes: Cow::Borrowed(img.as_raw()),
    };
    clip.set_image(data).map_err(|e| format!("system clipboard write failed: {}", e))
}

// ---------------------------------------------------------------------------
//  Copy command
// ---------------------------------------------------------------------------

/// Where a copy is delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ClipboardTarget {
    /// In-app clipboard only.
    App,
    /// In-app clipboard plus the OS clipboard (best effort).
    #[default]
    AppAndSystem,
}

/// Run a Copy command. Returns false when there was nothing to copy.
pub fn copy_to_clipboard(comp: &Composition, source: CopySource) -> bool {
    copy_into(comp, source, ClipboardTarget::AppAndSystem)
}

/// Run a Copy command against an explicit clipboard target.
pub fn copy_into(comp: &Composition, source: CopySource, target: ClipboardTarget) -> bool {
    let Some(img) = source.image_for(comp) else {
        log_info!("{}: nothing to copy", source.label());
        return false;
    };
    log_info!("{}: {}×{}", source.label(), img.width(), img.height());

    if target == ClipboardTarget::AppAndSystem
        && let Err(e) = copy_to_system_clipboard(&img)
    {
        log_warn!("{}", e);
    }
    set_clipboard_image(img.into_owned());
    true
}
