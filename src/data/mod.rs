#[allow(clippy::module_inception)]
pub mod data;

pub use data::{l2_normalize_rows, write_slide, FeatureSource, Slide, SlideDir};
