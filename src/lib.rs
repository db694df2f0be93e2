//! Attention-based multiple-instance classification of whole-slide images (CLAM).
//!
//! A slide arrives as a bag of precomputed patch features. The attention trunk compresses
//! each patch and scores it, the instance selector mines pseudo-labelled patches for the
//! clustering constraint, and the bag head turns the attention-weighted aggregate into a
//! slide prediction.

pub mod config;
pub mod data;
pub mod error;
pub mod model;
pub mod report;

pub use config::{AttentionColumns, BranchMode, ClamConfig};
pub use data::{FeatureSource, Slide, SlideDir};
pub use error::{ClamError, Result, SlideError, Stage};
pub use model::{ClamModel, ClamPipeline, SlideOutcome, SlideResult};
pub use report::EvalReport;
