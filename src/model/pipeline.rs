use candle_core::Tensor;
use rayon::prelude::*;
use tracing::{debug, info};

use super::attention::{normalize, AttentionNet};
use super::bag::{classify, BagClassifier, SlidePrediction};
use super::classifier::{ClassArena, Classifier};
use super::instance::{InstanceEval, InstanceSelector};
use crate::config::ClamConfig;
use crate::data::Slide;
use crate::error::{ensure_dim, ClamError, Result, SlideError, Stage};

/// The learned functions a slide is evaluated with.
pub struct ClamModel {
    pub attention: Box<dyn AttentionNet>,
    pub instance: ClassArena<Box<dyn Classifier>>,
    pub bag: BagClassifier,
}

/// Everything computed for one classified slide.
pub struct SlideResult {
    pub slide_id: String,
    /// Raw attention logits `[N, W]`.
    pub raw_attention: Tensor,
    /// Softmax of the logits over patches `[N, W]`.
    pub attention: Tensor,
    /// Compressed patch features `[N, D]`.
    pub features: Tensor,
    /// Absent when instance evaluation is disabled.
    pub instances: Option<InstanceEval>,
    /// Per-class aggregate `[n_class, D]`.
    pub aggregate: Tensor,
    pub prediction: SlidePrediction,
}

pub enum SlideOutcome {
    /// `att_only` runs stop once the attention logits exist.
    AttentionOnly {
        slide_id: String,
        raw_attention: Tensor,
    },
    Classified(Box<SlideResult>),
}

impl SlideOutcome {
    pub fn slide_id(&self) -> &str {
        match self {
            SlideOutcome::AttentionOnly { slide_id, .. } => slide_id,
            SlideOutcome::Classified(result) => &result.slide_id,
        }
    }

    pub fn raw_attention(&self) -> &Tensor {
        match self {
            SlideOutcome::AttentionOnly { raw_attention, .. } => raw_attention,
            SlideOutcome::Classified(result) => &result.raw_attention,
        }
    }

    pub fn result(&self) -> Option<&SlideResult> {
        match self {
            SlideOutcome::AttentionOnly { .. } => None,
            SlideOutcome::Classified(result) => Some(result),
        }
    }

    pub fn prediction(&self) -> Option<&SlidePrediction> {
        self.result().map(|r| &r.prediction)
    }
}

/// Runs attention, optional instance mining and bag classification for each slide.
pub struct ClamPipeline {
    config: ClamConfig,
    model: ClamModel,
}

impl ClamPipeline {
    pub fn new(config: ClamConfig, model: ClamModel) -> Result<Self> {
        config.validate()?;
        if model.attention.gated() != config.att_gate {
            return Err(ClamError::InvalidConfig(format!(
                "att_gate={} but the attention trunk is {}",
                config.att_gate,
                if model.attention.gated() { "gated" } else { "non-gated" }
            )));
        }
        if model.bag.mode() != config.branch {
            return Err(ClamError::InvalidConfig(format!(
                "branch mode {:?} but the bag head is {:?}",
                config.branch,
                model.bag.mode()
            )));
        }
        let width = model.attention.width();
        if width != 1 {
            ensure_dim("attention columns", config.n_class, width)?;
        }
        ensure_dim("patch vector", config.feature_dim, model.attention.feature_dim())?;
        Ok(Self { config, model })
    }

    pub fn config(&self) -> &ClamConfig {
        &self.config
    }

    pub fn model(&self) -> &ClamModel {
        &self.model
    }

    pub fn run(&self, slide: &Slide) -> std::result::Result<SlideOutcome, SlideError> {
        let fail = |stage: Stage| move |e: ClamError| SlideError::new(slide.id.as_str(), stage, e);
        let config = &self.config;

        let (features, raw_attention) = self
            .model
            .attention
            .forward(&slide.features)
            .map_err(fail(Stage::Attention))?;
        debug!(slide = %slide.id, patches = features.dims()[0], "attention computed");
        if config.att_only {
            return Ok(SlideOutcome::AttentionOnly {
                slide_id: slide.id.clone(),
                raw_attention,
            });
        }
        let attention = normalize(&raw_attention).map_err(fail(Stage::Attention))?;

        let instances = if config.mil_instance_eval {
            let selector = InstanceSelector::new(
                &self.model.instance,
                config.n_class,
                config.top_k_percent,
                config.mutually_exclusive,
            );
            let eval = selector
                .select(&features, &raw_attention, slide.label)
                .map_err(fail(Stage::Instance))?;
            debug!(slide = %slide.id, instances = eval.len(), "instances evaluated");
            Some(eval)
        } else {
            None
        };

        let (aggregate, prediction) = classify(
            &self.model.bag,
            &attention,
            &features,
            slide.label,
            config.n_class,
        )
        .map_err(fail(Stage::Aggregation))?;
        info!(
            slide = %slide.id,
            label = slide.label,
            predicted = prediction.predicted_label,
            "slide classified"
        );

        Ok(SlideOutcome::Classified(Box::new(SlideResult {
            slide_id: slide.id.clone(),
            raw_attention,
            attention,
            features,
            instances,
            aggregate,
            prediction,
        })))
    }

    /// Evaluates independent slides in parallel; results keep the input order.
    pub fn run_many(&self, slides: &[Slide]) -> Vec<std::result::Result<SlideOutcome, SlideError>> {
        slides.par_iter().map(|slide| self.run(slide)).collect()
    }
}
