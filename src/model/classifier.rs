use candle_core::{Module, Tensor};
use candle_nn::{self as nn, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{ensure_dim, ClamError, Result};

/// A learned function from fixed-width row vectors to fixed-width row vectors.
///
/// Inputs are batches shaped `[rows, in_dim]`; outputs are `[rows, out_dim]`.
/// Implementations are immutable once built so one model can serve many slides at once.
pub trait Classifier: Send + Sync {
    fn in_dim(&self) -> usize;
    fn out_dim(&self) -> usize;
    fn evaluate(&self, x: &Tensor) -> Result<Tensor>;
}

/// Nonlinearity applied after a dense projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Identity,
    Relu,
    Tanh,
    Sigmoid,
}

impl Activation {
    pub fn apply(self, x: &Tensor) -> Result<Tensor> {
        let y = match self {
            Activation::Identity => x.clone(),
            Activation::Relu => x.relu()?,
            Activation::Tanh => x.tanh()?,
            Activation::Sigmoid => nn::ops::sigmoid(x)?,
        };
        Ok(y)
    }
}

/// Linear layer followed by an activation.
pub struct Dense {
    linear: nn::Linear,
    activation: Activation,
    in_dim: usize,
    out_dim: usize,
}

impl Dense {
    pub fn new(
        vb: VarBuilder<'_>,
        in_dim: usize,
        out_dim: usize,
        activation: Activation,
    ) -> Result<Self> {
        let linear = nn::linear(in_dim, out_dim, vb)?;
        Ok(Self {
            linear,
            activation,
            in_dim,
            out_dim,
        })
    }

    /// Wraps an existing layer; widths are read from its `[out, in]` weight.
    pub fn from_linear(linear: nn::Linear, activation: Activation) -> Result<Self> {
        let (out_dim, in_dim) = linear.weight().dims2()?;
        Ok(Self {
            linear,
            activation,
            in_dim,
            out_dim,
        })
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }
}

impl Classifier for Dense {
    fn in_dim(&self) -> usize {
        self.in_dim
    }

    fn out_dim(&self) -> usize {
        self.out_dim
    }

    fn evaluate(&self, x: &Tensor) -> Result<Tensor> {
        let (_, width) = x.dims2()?;
        ensure_dim("classifier input", self.in_dim, width)?;
        let y = self.linear.forward(x)?;
        self.activation.apply(&y)
    }
}

/// Per-class slots allocated once, indexed by class id.
pub struct ClassArena<T> {
    slots: Vec<T>,
}

impl<T> ClassArena<T> {
    pub fn new(slots: Vec<T>) -> Self {
        Self { slots }
    }

    pub fn try_from_fn<F>(n_class: usize, mut f: F) -> Result<Self>
    where
        F: FnMut(usize) -> Result<T>,
    {
        let mut slots = Vec::with_capacity(n_class);
        for class in 0..n_class {
            slots.push(f(class)?);
        }
        Ok(Self { slots })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot for `class`; `UnknownClassIndex` past the arena's length.
    pub fn get(&self, class: usize) -> Result<&T> {
        self.slots.get(class).ok_or(ClamError::UnknownClassIndex {
            index: class,
            n_class: self.slots.len(),
        })
    }

    /// Looks up the `kind` branch of `class`, distinguishing an out-of-range class
    /// from a class whose slot was never populated.
    pub fn branch(&self, class: usize, n_class: usize, kind: &'static str) -> Result<&T> {
        if class >= n_class {
            return Err(ClamError::UnknownClassIndex {
                index: class,
                n_class,
            });
        }
        self.slots
            .get(class)
            .ok_or(ClamError::MissingBranch { kind, class })
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter()
    }
}
