// ============================================================================
// paintfe-copy CLI — build a layered document from files and run a Copy
// ============================================================================
//
// Usage examples:
//   paintfe-copy -i base.png top.png --select rect:10,10,64,32 -o cut.png
//   paintfe-copy -i photo.png --mask mask.png --edit-mask -o mask_copy.png
//   paintfe-copy -i "layers/*.png" --source composite --clipboard
//   paintfe-copy --canvas 200x80 --text "Hello" --font DejaVuSans.ttf -o text.png
//
// Inputs stack bottom to top; the topmost layer is active unless --active says
// otherwise. Exit code 1 when nothing could be copied.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use image::{DynamicImage, GrayImage, ImageFormat, RgbaImage};

use crate::canvas::{Composition, Layer, LayerMask, SelectionMode, SelectionShape};
use crate::ops::clipboard::{copy_to_system_clipboard, CopySource};
use crate::ops::text::{load_font_file, TextLayer, TextStyle};
use crate::{log_info, log_warn};

// ============================================================================
// CLI argument definition (clap Derive)
// ============================================================================

/// Headless "Copy Layer/Mask" / "Copy Composite" for layered images.
#[derive(Parser, Debug)]
#[command(
    name = "paintfe-copy",
    version,
    about = "Copy a layer, mask or composite out of a layered image",
    long_about = "Stack image files as layers, optionally add a text layer, a mask and a\n\
                  selection, then copy the active layer (or its mask) or the composite\n\
                  to a file or the system clipboard.\n\n\
                  Example:\n  \
                  paintfe-copy -i base.png top.png --select ellipse:50,50,20,20 -o out.png"
)]
pub struct CliArgs {
    /// Layer image file(s), bottom first. Glob patterns accepted (e.g. "layers/*.png").
    #[arg(short, long, num_args = 1..)]
    pub input: Vec<String>,

    /// Canvas size. Defaults to the size of the first input.
    #[arg(long, value_name = "WxH", value_parser = parse_size)]
    pub canvas: Option<(u32, u32)>,

    /// Add a text layer on top with this text ("\n" separates lines).
    #[arg(long)]
    pub text: Option<String>,

    /// TrueType/OpenType font for --text. Without it the text layer is empty.
    #[arg(long, value_name = "FONT.ttf", requires = "text")]
    pub font: Option<PathBuf>,

    #[arg(long, default_value_t = 24.0, value_name = "PX")]
    pub font_size: f32,

    /// Top-left of the first text line, canvas pixels.
    #[arg(long, value_name = "X,Y", value_parser = parse_point, default_value = "0,0")]
    pub text_pos: (f32, f32),

    #[arg(long, value_name = "RRGGBB[AA]", value_parser = parse_color, default_value = "000000")]
    pub text_color: [u8; 4],

    /// Index of the active layer (0 = bottom). Defaults to the topmost layer.
    #[arg(long, value_name = "N")]
    pub active: Option<usize>,

    /// Grayscale image attached to the active layer as its mask.
    #[arg(long, value_name = "FILE")]
    pub mask: Option<PathBuf>,

    /// Copy the mask instead of the layer.
    #[arg(long, requires = "mask")]
    pub edit_mask: bool,

    /// Selection shape: rect:x,y,w,h | ellipse:cx,cy,rx,ry | poly:x,y;x,y;...
    /// Repeat to combine shapes.
    #[arg(long = "select", value_name = "SHAPE")]
    pub select: Vec<SelectionShape>,

    /// How the 2nd, 3rd, ... --select combine: add, subtract, intersect, replace.
    /// Missing entries default to add.
    #[arg(long = "select-mode", value_name = "MODE")]
    pub select_mode: Vec<SelectionMode>,

    /// What to copy: layer (active layer or mask) or composite.
    #[arg(long, default_value = "layer", value_name = "SOURCE")]
    pub source: CopySource,

    /// Write the copied bitmap here (format from the extension).
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Put the copied bitmap on the system clipboard.
    #[arg(long)]
    pub clipboard: bool,

    /// Print the result size and timing.
    #[arg(short, long)]
    pub verbose: bool,
}

// ============================================================================
// Public entry point
// ============================================================================

/// Run the copy and return an OS exit code.
pub fn run(args: CliArgs) -> ExitCode {
    let start = Instant::now();
    match run_copy(&args) {
        Ok((w, h)) => {
            if args.verbose {
                println!(
                    "{}: {}×{} ({:.0}ms)",
                    args.source.label(),
                    w,
                    h,
                    start.elapsed().as_secs_f64() * 1000.0
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            log_warn!("cli: {}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_copy(args: &CliArgs) -> Result<(u32, u32), String> {
    if args.output.is_none() && !args.clipboard {
        return Err("no destination: pass --output FILE and/or --clipboard".to_string());
    }

    let comp = build_composition(args)?;
    log_info!(
        "cli: {}×{} document, {} layer(s), active #{}, selection: {}",
        comp.width,
        comp.height,
        comp.layers.len(),
        comp.active_layer_index,
        comp.has_selection()
    );

    let img = args
        .source
        .image_for(&comp)
        .ok_or_else(|| format!("nothing to copy ({})", args.source.label()))?;

    if let Some(out) = &args.output {
        save_image(&img, out)?;
    }
    if args.clipboard {
        copy_to_system_clipboard(&img)?;
    }
    Ok(img.dimensions())
}

// ============================================================================
// Document assembly
// ============================================================================

/// Assemble the composition described by the arguments.
pub fn build_composition(args: &CliArgs) -> Result<Composition, String> {
    let inputs = resolve_inputs(&args.input);
    if !args.input.is_empty() && inputs.is_empty() {
        return Err("no input files matched the given pattern(s)".to_string());
    }

    let images = inputs
        .iter()
        .map(|p| load_rgba(p).map(|img| (layer_name(p), img)))
        .collect::<Result<Vec<_>, _>>()?;

    let (w, h) = args
        .canvas
        .or_else(|| images.first().map(|(_, img)| img.dimensions()))
        .ok_or_else(|| "no canvas: pass --input or --canvas WxH".to_string())?;

    let mut comp = if images.is_empty() {
        Composition::new(w, h)
    } else {
        Composition::empty(w, h)
    };
    for (name, img) in &images {
        comp.add_layer(Layer::from_image(name.clone(), img));
    }

    if let Some(text) = &args.text {
        let font = args.font.as_deref().map(load_font_file).transpose()?;
        if font.is_none() {
            log_warn!("cli: --text without --font renders nothing");
        }
        let style = TextStyle {
            font_size: args.font_size,
            color: args.text_color,
            ..TextStyle::default()
        };
        let (x, y) = args.text_pos;
        let layer = TextLayer::new(text.replace("\\n", "\n"), font).with_style(style).at(x, y);
        comp.add_layer(Layer::text("Text".to_string(), layer));
    }

    if let Some(idx) = args.active {
        if idx >= comp.layers.len() {
            return Err(format!(
                "--active {} out of range (document has {} layer(s))",
                idx,
                comp.layers.len()
            ));
        }
        comp.active_layer_index = idx;
    }

    if let Some(path) = &args.mask {
        let mask = load_gray(path)?;
        let layer = comp
            .get_active_layer_mut()
            .ok_or_else(|| "document has no active layer".to_string())?;
        layer.set_mask(LayerMask::from_gray(mask));
        layer.set_mask_editing(args.edit_mask);
    }

    let extra_modes = args.select_mode.len();
    if extra_modes > args.select.len().saturating_sub(1) {
        log_warn!("cli: {} --select-mode value(s) without a matching --select", extra_modes);
    }
    let mut modes = args.select_mode.iter().copied();
    for (i, shape) in args.select.iter().cloned().enumerate() {
        let mode = if i == 0 {
            SelectionMode::Replace
        } else {
            modes.next().unwrap_or(SelectionMode::Add)
        };
        comp.apply_selection_shape(shape, mode);
    }

    Ok(comp)
}

fn load_rgba(path: &Path) -> Result<RgbaImage, String> {
    image::open(path)
        .map(|img| img.to_rgba8())
        .map_err(|e| format!("load failed for '{}': {}", path.display(), e))
}

/// Write the copy to `path`, in the format its extension names. Formats
/// without an alpha channel get the colour channels only.
fn save_image(img: &RgbaImage, path: &Path) -> Result<(), String> {
    let format = ImageFormat::from_path(path)
        .map_err(|e| format!("cannot save '{}': {}", path.display(), e))?;
    let result = match format {
        ImageFormat::Jpeg => {
            if img.pixels().any(|p| p[3] < 255) {
                log_warn!("cli: {} has no alpha channel, transparency dropped", path.display());
            }
            DynamicImage::ImageRgba8(img.clone()).to_rgb8().save_with_format(path, format)
        }
        _ => img.save_with_format(path, format),
    };
    result.map_err(|e| format!("save failed for '{}': {}", path.display(), e))
}

fn load_gray(path: &Path) -> Result<GrayImage, String> {
    image::open(path)
        .map(|img| img.to_luma8())
        .map_err(|e| format!("mask load failed for '{}': {}", path.display(), e))
}

fn layer_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "Layer".to_string())
}

// ============================================================================
// Helpers
// ============================================================================

/// Expand glob patterns and literal paths into a deduplicated, ordered list.
fn resolve_inputs(patterns: &[String]) -> Vec<PathBuf> {
    let mut result: Vec<PathBuf> = Vec::new();

    for pattern in patterns {
        let as_path = Path::new(pattern);
        if as_path.exists() {
            if !result.iter().any(|p| p.as_path() == as_path) {
                result.push(as_path.to_path_buf());
            }
            continue;
        }

        match glob::glob(pattern) {
            Ok(entries) => {
                let mut matched = false;
                for entry in entries.flatten() {
                    if !result.contains(&entry) {
                        result.push(entry);
                    }
                    matched = true;
                }
                if !matched {
                    eprintln!("warning: pattern '{}' matched no files.", pattern);
                }
            }
            Err(e) => {
                eprintln!("warning: invalid glob '{}': {}", pattern, e);
            }
        }
    }

    result
}

/// `WxH`, e.g. `640x480`. Both sides must be positive.
fn parse_size(s: &str) -> Result<(u32, u32), String> {
    let (w, h) = s
        .split_once(['x', 'X', '×'])
        .ok_or_else(|| format!("'{}' is not WxH", s))?;
    let w: u32 = w.trim().parse().map_err(|_| format!("bad width in '{}'", s))?;
    let h: u32 = h.trim().parse().map_err(|_| format!("bad height in '{}'", s))?;
    if w == 0 || h == 0 {
        return Err(format!("canvas size '{}' must be positive", s));
    }
    Ok((w, h))
}

/// `X,Y` in canvas pixels.
fn parse_point(s: &str) -> Result<(f32, f32), String> {
    let (x, y) = s.split_once(',').ok_or_else(|| format!("'{}' is not X,Y", s))?;
    let x: f32 = x.trim().parse().map_err(|_| format!("bad x in '{}'", s))?;
    let y: f32 = y.trim().parse().map_err(|_| format!("bad y in '{}'", s))?;
    Ok((x, y))
}

/// `RRGGBB` or `RRGGBBAA`, optional leading `#`.
fn parse_color(s: &str) -> Result<[u8; 4], String> {
    let hex = s.trim().trim_start_matches('#');
    if !(hex.len() == 6 || hex.len() == 8) || !hex.is_ascii() {
        return Err(format!("'{}' is not RRGGBB or RRGGBBAA", s));
    }
    let byte = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| format!("bad hex colour '{}'", s));
    let a = if hex.len() == 8 { byte(6)? } else { 255 };
    Ok([byte(0)?, byte(2)?, byte(4)?, a])
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GenericImageView;
    use pretty_assertions::assert_eq;

    fn parse(args: &[&str]) -> CliArgs {
        let mut full = vec!["paintfe-copy"];
        full.extend_from_slice(args);
        CliArgs::try_parse_from(full).unwrap()
    }

    #[test]
    fn value_parsers() {
        assert_eq!(parse_size("640x480"), Ok((640, 480)));
        assert_eq!(parse_size("3×2"), Ok((3, 2)));
        assert!(parse_size("0x5").is_err());
        assert!(parse_size("64").is_err());
        assert_eq!(parse_point("1.5, -2"), Ok((1.5, -2.0)));
        assert_eq!(parse_color("#ff8000"), Ok([255, 128, 0, 255]));
        assert_eq!(parse_color("00000080"), Ok([0, 0, 0, 128]));
        assert!(parse_color("fff").is_err());
        assert!(parse_color("gg0000").is_err());
    }

    #[test]
    fn defaults() {
        let args = parse(&["--canvas", "8x8", "-o", "x.png"]);
        assert_eq!(args.source, CopySource::LayerOrMask);
        assert_eq!(args.text_pos, (0.0, 0.0));
        assert_eq!(args.text_color, [0, 0, 0, 255]);
        assert!(args.select.is_empty());
    }

    #[test]
    fn edit_mask_requires_mask() {
        assert!(CliArgs::try_parse_from(["paintfe-copy", "--canvas", "4x4", "--edit-mask"]).is_err());
        assert!(CliArgs::try_parse_from(["paintfe-copy", "--select", "tri:1,2"]).is_err());
    }

    #[test]
    fn canvas_only_document_has_white_background() {
        let comp = build_composition(&parse(&["--canvas", "5x3"])).unwrap();
        assert_eq!((comp.width, comp.height), (5, 3));
        assert_eq!(comp.layers.len(), 1);
        assert_eq!(comp.active_layer().name, "Background");
    }

    #[test]
    fn text_layer_becomes_active() {
        let comp = build_composition(&parse(&["--canvas", "5x3", "--text", "Hi"])).unwrap();
        assert_eq!(comp.layers.len(), 2);
        assert_eq!(comp.active_layer_index, 1);
        assert_eq!(comp.active_layer().content.kind_name(), "text");
    }

    #[test]
    fn active_index_is_validated() {
        assert!(build_composition(&parse(&["--canvas", "5x3", "--active", "3"])).is_err());
        let comp = build_composition(&parse(&["--canvas", "5x3", "--text", "a", "--active", "0"])).unwrap();
        assert_eq!(comp.active_layer_index, 0);
    }

    #[test]
    fn selections_combine_in_order() {
        let args = parse(&[
            "--canvas", "10x10",
            "--select", "rect:0,0,6,6",
            "--select", "rect:2,2,2,2",
            "--select", "rect:4,0,6,6",
            "--select-mode", "subtract",
        ]);
        let comp = build_composition(&args).unwrap();
        let sel = comp.selection().unwrap();
        let modes: Vec<_> = sel.parts().iter().map(|(m, _)| *m).collect();
        assert_eq!(modes, vec![SelectionMode::Replace, SelectionMode::Subtract, SelectionMode::Add]);
        assert_eq!(sel.coverage_at(3, 3), 0);
        assert_eq!(sel.coverage_at(9, 1), 255);
    }

    #[test]
    fn missing_canvas_is_an_error() {
        assert!(build_composition(&parse(&[])).is_err());
    }

    #[test]
    fn save_drops_alpha_for_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let mut img = RgbaImage::from_pixel(4, 4, image::Rgba([200, 40, 40, 255]));
        img.put_pixel(0, 0, image::Rgba([0, 0, 0, 0]));

        let jpg = dir.path().join("copy.jpg");
        save_image(&img, &jpg).unwrap();
        assert_eq!(image::open(&jpg).unwrap().dimensions(), (4, 4));

        let png = dir.path().join("copy.png");
        save_image(&img, &png).unwrap();
        assert_eq!(image::open(&png).unwrap().to_rgba8(), img);

        let err = save_image(&img, &dir.path().join("copy.unknown")).unwrap_err();
        assert!(err.contains("copy.unknown"));
    }

    #[test]
    fn unmatched_pattern_is_an_error() {
        let args = parse(&["-i", "/definitely/not/here/*.png"]);
        assert!(build_composition(&args).is_err());
    }
}
