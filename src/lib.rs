//! Copy-to-clipboard source selection for a layered raster editor.
//!
//! A [`canvas::Composition`] holds the layer stack, the active layer and the
//! selection; [`CopySource`] decides which bitmap a Copy command produces.

pub mod logger;

pub mod canvas;
pub mod cli;
pub mod ops;

pub use canvas::{Composition, Layer, LayerMask, Selection, SelectionMode, SelectionShape};
pub use ops::clipboard::CopySource;
