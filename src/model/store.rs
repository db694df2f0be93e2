//! Building, saving and restoring the classifier set.
//!
//! Every classifier lives in one safetensors file under a prefix keyed by gating mode,
//! branch mode and class index:
//!
//! - attention trunk: `g_att.{compress,gate_v,gate_u,score}` or `ng_att.{compress,score}`
//! - instance heads: `m_ins.class_{c}`
//! - bag head: `s_bag`, or `m_bag.class_{c}` per class

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use std::path::Path;
use tracing::info;

use super::attention::{AttentionNet, GatedAttention, NonGatedAttention};
use super::bag::BagClassifier;
use super::classifier::{Activation, ClassArena, Classifier, Dense};
use super::pipeline::ClamModel;
use crate::config::{BranchMode, ClamConfig};
use crate::error::Result;

/// Output width of each instance head (in-cluster / out-of-cluster).
pub const INSTANCE_CLUSTERS: usize = 2;

pub fn attention_prefix(att_gate: bool) -> &'static str {
    if att_gate {
        "g_att"
    } else {
        "ng_att"
    }
}

pub fn instance_prefix(class: usize) -> String {
    format!("m_ins.class_{class}")
}

pub fn bag_prefix(branch: BranchMode, class: usize) -> String {
    match branch {
        BranchMode::Single => "s_bag".to_string(),
        BranchMode::Multi => format!("m_bag.class_{class}"),
    }
}

/// Builds every classifier the configuration calls for from `vb`.
pub fn build_model(vb: &VarBuilder<'_>, config: &ClamConfig) -> Result<ClamModel> {
    config.validate()?;
    let att_vb = vb.pp(attention_prefix(config.att_gate));
    let attention: Box<dyn AttentionNet> = if config.att_gate {
        Box::new(GatedAttention::new(att_vb, config)?)
    } else {
        Box::new(NonGatedAttention::new(att_vb, config)?)
    };

    let instance = ClassArena::try_from_fn(config.n_class, |class| {
        let head = Dense::new(
            vb.pp(instance_prefix(class)),
            config.compressed_dim,
            INSTANCE_CLUSTERS,
            Activation::Identity,
        )?;
        Ok(Box::new(head) as Box<dyn Classifier>)
    })?;

    let bag_head = |class: usize| -> Result<Box<dyn Classifier>> {
        let head = Dense::new(
            vb.pp(bag_prefix(config.branch, class)),
            config.compressed_dim,
            1,
            Activation::Identity,
        )?;
        Ok(Box::new(head))
    };
    let bag = match config.branch {
        BranchMode::Single => BagClassifier::Single(bag_head(0)?),
        BranchMode::Multi => BagClassifier::Multi(ClassArena::try_from_fn(config.n_class, bag_head)?),
    };

    Ok(ClamModel {
        attention,
        instance,
        bag,
    })
}

/// Freshly initialized model. The returned varmap owns the weights.
pub fn init_model(config: &ClamConfig, device: &Device) -> Result<(VarMap, ClamModel)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = build_model(&vb, config)?;
    Ok((varmap, model))
}

/// Restores a model saved by [`save_model`] for the same configuration.
pub fn load_model(path: &Path, config: &ClamConfig, device: &Device) -> Result<(VarMap, ClamModel)> {
    let (mut varmap, model) = init_model(config, device)?;
    varmap.load(path)?;
    info!(path = %path.display(), vars = varmap.all_vars().len(), "model restored");
    Ok((varmap, model))
}

pub fn save_model(varmap: &VarMap, path: &Path) -> Result<()> {
    varmap.save(path)?;
    info!(path = %path.display(), vars = varmap.all_vars().len(), "model saved");
    Ok(())
}
