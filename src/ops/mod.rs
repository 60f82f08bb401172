pub mod clipboard;
pub mod text;
