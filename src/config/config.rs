use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{ClamError, Result};
use crate::model::Activation;

/// How slide-level scores are produced from the per-class aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchMode {
    /// One shared classifier over the whole `n_class x D` aggregate matrix.
    Single,
    /// One classifier per class, each seeing only its own aggregate row.
    Multi,
}

/// Width of the attention logits produced per patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionColumns {
    /// One score per patch, shared by every class.
    Shared,
    /// One score per (patch, class).
    PerClass,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClamConfig {
    pub n_class: usize,
    pub feature_dim: usize,
    pub compressed_dim: usize,
    /// Hidden width of the gated projections.
    pub attention_dim: usize,
    pub top_k_percent: f64,
    pub att_gate: bool,
    pub att_only: bool,
    pub mil_instance_eval: bool,
    pub mutually_exclusive: bool,
    pub branch: BranchMode,
    pub attention_columns: AttentionColumns,
    pub compress_activation: Activation,
    /// L2-normalize each patch vector when a slide is loaded.
    pub l2_normalize_features: bool,
}

impl Default for ClamConfig {
    fn default() -> Self {
        Self {
            n_class: 2,
            feature_dim: 1024,
            compressed_dim: 512,
            attention_dim: 256,
            top_k_percent: 0.05,
            att_gate: true,
            att_only: false,
            mil_instance_eval: true,
            mutually_exclusive: true,
            branch: BranchMode::Single,
            attention_columns: AttentionColumns::PerClass,
            compress_activation: Activation::Relu,
            l2_normalize_features: false,
        }
    }
}

impl ClamConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies command-line overrides and returns the remaining positional arguments.
    pub fn apply_args(&mut self, args: &[String]) -> Result<Vec<String>> {
        let mut positional = Vec::new();
        let mut i = 0usize;
        while i < args.len() {
            match args[i].as_str() {
                "--top-k" => {
                    let value = args
                        .get(i + 1)
                        .ok_or_else(|| ClamError::InvalidConfig("--top-k requires float".into()))?;
                    self.top_k_percent = value.parse().map_err(|_| {
                        ClamError::InvalidConfig(format!("--top-k must be float, got {value:?}"))
                    })?;
                    i += 2;
                    continue;
                }
                "--att-only" => self.att_only = true,
                "--no-instance-eval" => self.mil_instance_eval = false,
                "--no-mutex" => self.mutually_exclusive = false,
                "--gated" => self.att_gate = true,
                "--non-gated" => self.att_gate = false,
                "--multi-branch" => self.branch = BranchMode::Multi,
                "--single-branch" => self.branch = BranchMode::Single,
                "--l2-norm" => self.l2_normalize_features = true,
                _ => positional.push(args[i].clone()),
            }
            i += 1;
        }
        self.validate()?;
        Ok(positional)
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_class <= 1 {
            return Err(ClamError::InvalidConfig(format!(
                "n_class must be at least 2, got {}",
                self.n_class
            )));
        }
        if !(self.top_k_percent > 0.0 && self.top_k_percent <= 1.0) {
            return Err(ClamError::InvalidConfig(format!(
                "top_k_percent must lie in (0, 1], got {}",
                self.top_k_percent
            )));
        }
        if self.feature_dim == 0 || self.compressed_dim == 0 || self.attention_dim == 0 {
            return Err(ClamError::InvalidConfig(
                "feature, compressed and attention dims must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Slide evaluation needs predictions, which `att_only` never produces.
    pub fn ensure_classifies(&self) -> Result<()> {
        if self.att_only {
            return Err(ClamError::InvalidConfig(
                "att_only yields no slide predictions; use --attention to inspect attention".into(),
            ));
        }
        Ok(())
    }

    /// Number of attention logit columns per patch.
    pub fn attention_width(&self) -> usize {
        match self.attention_columns {
            AttentionColumns::Shared => 1,
            AttentionColumns::PerClass => self.n_class,
        }
    }
}
