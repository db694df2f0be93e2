use std::fmt;

use thiserror::Error;

/// Failure kinds raised while evaluating a slide or loading its collaborators.
#[derive(Debug, Error)]
pub enum ClamError {
    #[error("shape mismatch in {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("top-k resolves to {k} for {n_patches} patches (top_k_percent={top_k_percent})")]
    InvalidTopK {
        k: usize,
        n_patches: usize,
        top_k_percent: f64,
    },
    #[error("class index {index} outside [0, {n_class})")]
    UnknownClassIndex { index: usize, n_class: usize },
    #[error("no {kind} branch for class {class}")]
    MissingBranch { kind: &'static str, class: usize },
    #[error("slide prediction {y_hat} disagrees with probability argmax {predicted}")]
    PredictionMismatch { y_hat: usize, predicted: usize },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("slide {slide:?} label {value} is not a class index")]
    InvalidLabel { slide: String, value: f64 },
    #[error("slide {slide:?} label holds {len} values, expected one")]
    InvalidLabelShape { slide: String, len: usize },
    #[error("slide {slide:?} has no tensor named {name:?}")]
    MissingTensor { slide: String, name: &'static str },
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ClamError>;

/// Pipeline stage a slide failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Attention,
    Instance,
    Aggregation,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Attention => "attention",
            Stage::Instance => "instance",
            Stage::Aggregation => "aggregation",
        };
        f.write_str(name)
    }
}

/// A slide-level failure: the error kind tagged with where it happened.
#[derive(Debug, Error)]
#[error("slide {slide_id}: {stage} stage failed: {source}")]
pub struct SlideError {
    pub slide_id: String,
    pub stage: Stage,
    #[source]
    pub source: ClamError,
}

impl SlideError {
    pub fn new(slide_id: impl Into<String>, stage: Stage, source: ClamError) -> Self {
        Self {
            slide_id: slide_id.into(),
            stage,
            source,
        }
    }
}

/// Fails with `ShapeMismatch` unless `actual == expected`.
pub(crate) fn ensure_dim(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(ClamError::ShapeMismatch {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}
