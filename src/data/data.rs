use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{ClamError, Result};

pub const FEATURES_KEY: &str = "features";
pub const LABEL_KEY: &str = "label";
const SLIDE_EXT: &str = "safetensors";

/// One bag: the ordered patch features `[N, F]` of a slide and its class.
#[derive(Debug, Clone)]
pub struct Slide {
    pub id: String,
    pub features: Tensor,
    pub label: usize,
}

impl Slide {
    pub fn new(id: impl Into<String>, features: Tensor, label: usize) -> Self {
        Self {
            id: id.into(),
            features,
            label,
        }
    }
}

/// Supplies slide bags by identifier.
pub trait FeatureSource {
    fn slide_ids(&self) -> Result<Vec<String>>;
    fn load(&self, slide_id: &str) -> Result<Slide>;
}

/// A directory of `<slide_id>.safetensors` files holding `features` and `label` tensors.
pub struct SlideDir {
    root: PathBuf,
    device: Device,
    l2_normalize: bool,
}

impl SlideDir {
    pub fn new(root: impl Into<PathBuf>, device: Device) -> Self {
        Self {
            root: root.into(),
            device,
            l2_normalize: false,
        }
    }

    pub fn with_l2_normalize(mut self, enabled: bool) -> Self {
        self.l2_normalize = enabled;
        self
    }

    fn path_for(&self, slide_id: &str) -> PathBuf {
        self.root.join(format!("{slide_id}.{SLIDE_EXT}"))
    }
}

impl FeatureSource for SlideDir {
    /// Slide ids in sorted order.
    fn slide_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SLIDE_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn load(&self, slide_id: &str) -> Result<Slide> {
        let mut tensors = candle_core::safetensors::load(self.path_for(slide_id), &self.device)?;
        let features = tensors
            .remove(FEATURES_KEY)
            .ok_or_else(|| ClamError::MissingTensor {
                slide: slide_id.to_string(),
                name: FEATURES_KEY,
            })?
            .to_dtype(DType::F32)?;
        features.dims2()?;
        let label = tensors.get(LABEL_KEY).ok_or_else(|| ClamError::MissingTensor {
            slide: slide_id.to_string(),
            name: LABEL_KEY,
        })?;
        let label = read_label(slide_id, label)?;
        let features = if self.l2_normalize {
            l2_normalize_rows(&features)?
        } else {
            features
        };
        debug!(slide = slide_id, patches = features.dims()[0], label, "slide loaded");
        Ok(Slide::new(slide_id, features, label))
    }
}

fn read_label(slide_id: &str, label: &Tensor) -> Result<usize> {
    let values = label.flatten_all()?.to_dtype(DType::F64)?.to_vec1::<f64>()?;
    let value = match values.as_slice() {
        [value] => *value,
        [] => {
            return Err(ClamError::MissingTensor {
                slide: slide_id.to_string(),
                name: LABEL_KEY,
            })
        }
        [..] => {
            return Err(ClamError::InvalidLabelShape {
                slide: slide_id.to_string(),
                len: values.len(),
            })
        }
    };
    if !(value.is_finite() && value >= 0.0 && value.fract() == 0.0) {
        return Err(ClamError::InvalidLabel {
            slide: slide_id.to_string(),
            value,
        });
    }
    Ok(value as usize)
}

/// Scales every patch vector to unit length.
pub fn l2_normalize_rows(x: &Tensor) -> Result<Tensor> {
    let norm = x.sqr()?.sum_keepdim(1)?.sqrt()?.maximum(1e-8)?;
    Ok(x.broadcast_div(&norm)?)
}

/// Writes a slide file readable by [`SlideDir`].
pub fn write_slide(path: &Path, features: &Tensor, label: usize) -> Result<()> {
    let label = Tensor::new(&[label as u32], features.device())?;
    let tensors = HashMap::from([
        (FEATURES_KEY.to_string(), features.clone()),
        (LABEL_KEY.to_string(), label),
    ]);
    candle_core::safetensors::save(&tensors, path)?;
    Ok(())
}
