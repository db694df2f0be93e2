use candle_core::Tensor;
use candle_nn::{self as nn, VarBuilder};

use super::classifier::{Activation, Classifier, Dense};
use crate::config::ClamConfig;
use crate::error::{ensure_dim, ClamError, Result};

/// Attention trunk: maps a bag `[N, F]` to compressed features `h: [N, D]` and raw
/// attention logits `A: [N, W]` where `W` is 1 (shared) or `n_class` (per class).
pub trait AttentionNet: Send + Sync {
    fn forward(&self, bag: &Tensor) -> Result<(Tensor, Tensor)>;
    fn feature_dim(&self) -> usize;
    fn compressed_dim(&self) -> usize;
    /// Number of logit columns per patch.
    fn width(&self) -> usize;
    fn gated(&self) -> bool;
}

/// Softmax over the patch axis, independently per logit column.
pub fn normalize(logits: &Tensor) -> Result<Tensor> {
    Ok(nn::ops::softmax(logits, 0)?)
}

fn compress_bag(compress: &Dense, bag: &Tensor) -> Result<Tensor> {
    let (n_patches, width) = bag.dims2()?;
    if n_patches == 0 {
        return Err(ClamError::ShapeMismatch {
            what: "bag patch count",
            expected: 1,
            actual: 0,
        });
    }
    ensure_dim("patch vector", compress.in_dim(), width)?;
    compress.evaluate(bag)
}

/// Compression followed by a single scoring projection.
pub struct NonGatedAttention {
    compress: Dense,
    score: Dense,
}

impl NonGatedAttention {
    pub fn new(vb: VarBuilder<'_>, config: &ClamConfig) -> Result<Self> {
        let compress = Dense::new(
            vb.pp("compress"),
            config.feature_dim,
            config.compressed_dim,
            config.compress_activation,
        )?;
        let score = Dense::new(
            vb.pp("score"),
            config.compressed_dim,
            config.attention_width(),
            Activation::Identity,
        )?;
        Self::from_parts(compress, score)
    }

    pub fn from_parts(compress: Dense, score: Dense) -> Result<Self> {
        ensure_dim("attention score input", compress.out_dim(), score.in_dim())?;
        Ok(Self { compress, score })
    }
}

impl AttentionNet for NonGatedAttention {
    fn forward(&self, bag: &Tensor) -> Result<(Tensor, Tensor)> {
        let h = compress_bag(&self.compress, bag)?;
        let logits = self.score.evaluate(&h)?;
        Ok((h, logits))
    }

    fn feature_dim(&self) -> usize {
        self.compress.in_dim()
    }

    fn compressed_dim(&self) -> usize {
        self.compress.out_dim()
    }

    fn width(&self) -> usize {
        self.score.out_dim()
    }

    fn gated(&self) -> bool {
        false
    }
}

/// Compression, then `score(tanh(V h) * sigmoid(U h))`.
pub struct GatedAttention {
    compress: Dense,
    gate_v: Dense,
    gate_u: Dense,
    score: Dense,
}

impl GatedAttention {
    pub fn new(vb: VarBuilder<'_>, config: &ClamConfig) -> Result<Self> {
        let compress = Dense::new(
            vb.pp("compress"),
            config.feature_dim,
            config.compressed_dim,
            config.compress_activation,
        )?;
        let gate_v = Dense::new(
            vb.pp("gate_v"),
            config.compressed_dim,
            config.attention_dim,
            Activation::Tanh,
        )?;
        let gate_u = Dense::new(
            vb.pp("gate_u"),
            config.compressed_dim,
            config.attention_dim,
            Activation::Sigmoid,
        )?;
        let score = Dense::new(
            vb.pp("score"),
            config.attention_dim,
            config.attention_width(),
            Activation::Identity,
        )?;
        Self::from_parts(compress, gate_v, gate_u, score)
    }

    pub fn from_parts(compress: Dense, gate_v: Dense, gate_u: Dense, score: Dense) -> Result<Self> {
        ensure_dim("gate_v input", compress.out_dim(), gate_v.in_dim())?;
        ensure_dim("gate_u input", compress.out_dim(), gate_u.in_dim())?;
        ensure_dim("gate widths", gate_v.out_dim(), gate_u.out_dim())?;
        ensure_dim("attention score input", gate_v.out_dim(), score.in_dim())?;
        Ok(Self {
            compress,
            gate_v,
            gate_u,
            score,
        })
    }
}

impl AttentionNet for GatedAttention {
    fn forward(&self, bag: &Tensor) -> Result<(Tensor, Tensor)> {
        let h = compress_bag(&self.compress, bag)?;
        let v = self.gate_v.evaluate(&h)?;
        let u = self.gate_u.evaluate(&h)?;
        let gated = (v * u)?;
        let logits = self.score.evaluate(&gated)?;
        Ok((h, logits))
    }

    fn feature_dim(&self) -> usize {
        self.compress.in_dim()
    }

    fn compressed_dim(&self) -> usize {
        self.compress.out_dim()
    }

    fn width(&self) -> usize {
        self.score.out_dim()
    }

    fn gated(&self) -> bool {
        true
    }
}
