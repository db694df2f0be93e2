//! Pseudo-label mining for the instance-level clustering constraint.
//!
//! Patches are ranked by their attention logit under one class column. For the slide's
//! own class the top `k` become positives and the bottom `k` negatives; in mutually
//! exclusive mode the top `k` of every other class become hard negatives. The mined
//! instances never feed the slide decision.

use candle_core::{DType, Tensor};
use candle_nn as nn;
use tracing::debug;

use super::classifier::{ClassArena, Classifier};
use crate::error::{ensure_dim, ClamError, Result};

pub const POSITIVE: u32 = 1;
pub const NEGATIVE: u32 = 0;

/// Which end of the ranking to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rank {
    Highest,
    Lowest,
}

/// `floor(top_k_percent * n_patches)`, which must land in `1..=n_patches`.
pub fn top_k_count(n_patches: usize, top_k_percent: f64) -> Result<usize> {
    let k = (top_k_percent * n_patches as f64).floor();
    if !(k >= 1.0 && k <= n_patches as f64) {
        return Err(ClamError::InvalidTopK {
            k: if k.is_finite() && k > 0.0 { k as usize } else { 0 },
            n_patches,
            top_k_percent,
        });
    }
    Ok(k as usize)
}

/// Indices of the `k` highest (or lowest) scores. Equal scores rank by ascending index.
pub fn top_k_indices(scores: &[f32], k: usize, rank: Rank) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| {
        let by_score = match rank {
            Rank::Highest => scores[b].total_cmp(&scores[a]),
            Rank::Lowest => scores[a].total_cmp(&scores[b]),
        };
        by_score.then(a.cmp(&b))
    });
    order.truncate(k);
    order
}

/// Instances mined for one class branch.
pub struct InstanceBatch {
    pub class: usize,
    /// Selected patch indices, in label order.
    pub indices: Vec<usize>,
    pub labels: Vec<u32>,
    /// Unnormalized instance classifier outputs, `[len, out_dim]`.
    pub logits: Tensor,
    /// Softmax of `logits` per instance.
    pub probs: Tensor,
}

/// All mined instances: the in-class batch first, then out-of-class batches in class order.
pub struct InstanceEval {
    pub batches: Vec<InstanceBatch>,
    pub labels: Vec<u32>,
    pub logits: Tensor,
    pub probs: Tensor,
}

impl InstanceEval {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn in_class(&self) -> Option<&InstanceBatch> {
        self.batches.first()
    }

    pub fn out_of_class(&self) -> &[InstanceBatch] {
        self.batches.get(1..).unwrap_or(&[])
    }
}

pub struct InstanceSelector<'a> {
    classifiers: &'a ClassArena<Box<dyn Classifier>>,
    n_class: usize,
    top_k_percent: f64,
    mutually_exclusive: bool,
}

impl<'a> InstanceSelector<'a> {
    pub fn new(
        classifiers: &'a ClassArena<Box<dyn Classifier>>,
        n_class: usize,
        top_k_percent: f64,
        mutually_exclusive: bool,
    ) -> Self {
        Self {
            classifiers,
            n_class,
            top_k_percent,
            mutually_exclusive,
        }
    }

    /// Mines pseudo-labelled instances from compressed features `h: [N, D]` ranked by
    /// raw attention logits `[N, W]` (`W` is 1 or `n_class`).
    pub fn select(&self, h: &Tensor, logits: &Tensor, label: usize) -> Result<InstanceEval> {
        if label >= self.n_class {
            return Err(ClamError::UnknownClassIndex {
                index: label,
                n_class: self.n_class,
            });
        }
        let (n_patches, _) = h.dims2()?;
        let (n_rows, width) = logits.dims2()?;
        ensure_dim("attention rows", n_patches, n_rows)?;
        if width != 1 {
            ensure_dim("attention columns", self.n_class, width)?;
        }
        let k = top_k_count(n_patches, self.top_k_percent)?;
        let rows = logits.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        let column = |class: usize| -> Vec<f32> {
            let col = if width == 1 { 0 } else { class };
            rows.iter().map(|r| r[col]).collect()
        };

        let mut batches = Vec::with_capacity(self.n_class);
        let scores = column(label);
        let mut indices = top_k_indices(&scores, k, Rank::Highest);
        indices.extend(top_k_indices(&scores, k, Rank::Lowest));
        let mut labels = vec![POSITIVE; k];
        labels.extend(std::iter::repeat(NEGATIVE).take(k));
        batches.push(self.evaluate(h, label, indices, labels)?);

        if self.mutually_exclusive {
            for class in (0..self.n_class).filter(|&c| c != label) {
                let indices = top_k_indices(&column(class), k, Rank::Highest);
                batches.push(self.evaluate(h, class, indices, vec![NEGATIVE; k])?);
            }
        }
        debug!(
            label,
            k,
            branches = batches.len(),
            "instance pseudo-labels mined"
        );
        concat(batches)
    }

    fn evaluate(
        &self,
        h: &Tensor,
        class: usize,
        indices: Vec<usize>,
        labels: Vec<u32>,
    ) -> Result<InstanceBatch> {
        let classifier = self.classifiers.branch(class, self.n_class, "instance")?;
        let ids: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
        let ids = Tensor::from_vec(ids, (indices.len(),), h.device())?;
        let selected = h.index_select(&ids, 0)?;
        let logits = classifier.evaluate(&selected)?;
        let probs = nn::ops::softmax(&logits, 1)?;
        Ok(InstanceBatch {
            class,
            indices,
            labels,
            logits,
            probs,
        })
    }
}

fn concat(batches: Vec<InstanceBatch>) -> Result<InstanceEval> {
    let labels = batches.iter().flat_map(|b| b.labels.iter().copied()).collect();
    let logits: Vec<&Tensor> = batches.iter().map(|b| &b.logits).collect();
    let probs: Vec<&Tensor> = batches.iter().map(|b| &b.probs).collect();
    let logits = Tensor::cat(&logits, 0)?;
    let probs = Tensor::cat(&probs, 0)?;
    Ok(InstanceEval {
        batches,
        labels,
        logits,
        probs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::classifier::Activation;
    use crate::model::testing::{boxed, dense, matrix, random_bag};

    fn instance_heads(n_class: usize, dim: usize) -> ClassArena<Box<dyn Classifier>> {
        ClassArena::try_from_fn(n_class, |c| {
            let w0: Vec<f32> = (0..dim).map(|j| (j + c) as f32 * 0.1).collect();
            let w1: Vec<f32> = (0..dim).map(|j| -((j * c) as f32) * 0.1).collect();
            Ok(boxed(dense(
                &[w0.as_slice(), w1.as_slice()],
                &[0.0, 0.1],
                Activation::Identity,
            )))
        })
        .unwrap()
    }

    fn ramp_logits(n: usize, n_class: usize) -> Tensor {
        // class 0 increases with the patch index, class 1 decreases
        let rows: Vec<Vec<f32>> = (0..n)
            .map(|i| (0..n_class).map(|c| if c % 2 == 0 { i as f32 } else { -(i as f32) }).collect())
            .collect();
        let refs: Vec<&[f32]> = rows.iter().map(|r| r.as_slice()).collect();
        matrix(&refs)
    }

    #[test]
    fn k_is_floor_of_fraction() {
        assert_eq!(top_k_count(10, 0.2).unwrap(), 2);
        assert_eq!(top_k_count(5, 0.4).unwrap(), 2);
        assert_eq!(top_k_count(7, 1.0).unwrap(), 7);
        assert_eq!(top_k_count(19, 0.1).unwrap(), 1);
    }

    #[test]
    fn k_of_zero_is_rejected() {
        assert!(matches!(
            top_k_count(3, 0.1),
            Err(ClamError::InvalidTopK {
                k: 0,
                n_patches: 3,
                ..
            })
        ));
        assert!(top_k_count(4, 1.5).is_err());
    }

    #[test]
    fn ties_resolve_to_lowest_index() {
        let scores = [0.5, 0.9, 0.5, 0.9, 0.1, 0.1];
        assert_eq!(top_k_indices(&scores, 3, Rank::Highest), vec![1, 3, 0]);
        assert_eq!(top_k_indices(&scores, 3, Rank::Lowest), vec![4, 5, 0]);
        assert_eq!(top_k_indices(&[1.0; 4], 2, Rank::Highest), vec![0, 1]);
    }

    #[test]
    fn in_class_branch_mines_top_and_bottom() {
        let heads = instance_heads(2, 3);
        let selector = InstanceSelector::new(&heads, 2, 0.2, false);
        let h = random_bag(4, 10, 3);
        let eval = selector.select(&h, &ramp_logits(10, 2), 0).unwrap();

        assert_eq!(eval.len(), 4);
        assert_eq!(eval.labels, vec![1, 1, 0, 0]);
        let batch = eval.in_class().unwrap();
        assert_eq!(batch.class, 0);
        assert_eq!(batch.indices, vec![9, 8, 0, 1]);
        assert!(eval.out_of_class().is_empty());
        assert_eq!(eval.logits.dims(), &[4, 2]);
    }

    #[test]
    fn mutually_exclusive_adds_hard_negatives_per_other_class() {
        let heads = instance_heads(2, 3);
        let selector = InstanceSelector::new(&heads, 2, 0.2, true);
        let h = random_bag(5, 10, 3);
        let eval = selector.select(&h, &ramp_logits(10, 2), 1).unwrap();

        assert_eq!(eval.len(), 6);
        assert_eq!(eval.labels, vec![1, 1, 0, 0, 0, 0]);
        // class 1 ranks by decreasing index, class 0 by increasing index
        assert_eq!(eval.in_class().unwrap().indices, vec![0, 1, 9, 8]);
        let out = &eval.out_of_class()[0];
        assert_eq!(out.class, 0);
        assert_eq!(out.indices, vec![9, 8]);
        assert_eq!(eval.logits.dims(), &[6, 2]);
        assert_eq!(eval.probs.dims(), &[6, 2]);
    }

    #[test]
    fn every_other_class_contributes_when_exclusive() {
        let heads = instance_heads(4, 2);
        let selector = InstanceSelector::new(&heads, 4, 0.25, true);
        let eval = selector
            .select(&random_bag(6, 8, 2), &ramp_logits(8, 4), 2)
            .unwrap();
        // k = 2: 4 in-class + 3 classes * 2
        assert_eq!(eval.len(), 10);
        let classes: Vec<usize> = eval.batches.iter().map(|b| b.class).collect();
        assert_eq!(classes, vec![2, 0, 1, 3]);
    }

    #[test]
    fn instance_logits_come_from_the_selected_rows() {
        let heads = instance_heads(2, 3);
        let selector = InstanceSelector::new(&heads, 2, 0.2, true);
        let h = random_bag(7, 10, 3);
        let eval = selector.select(&h, &ramp_logits(10, 2), 0).unwrap();

        let batch = &eval.out_of_class()[0];
        let head = heads.branch(1, 2, "instance").unwrap();
        for (row, &patch) in batch.indices.iter().enumerate() {
            let expected = head.evaluate(&h.narrow(0, patch, 1).unwrap()).unwrap();
            let got = batch.logits.narrow(0, row, 1).unwrap();
            let diff = (expected - got)
                .unwrap()
                .abs()
                .unwrap()
                .max_keepdim(1)
                .unwrap()
                .to_vec2::<f32>()
                .unwrap();
            assert!(diff[0][0] < 1e-6);
        }
        let sums = eval.probs.sum(1).unwrap().to_vec1::<f32>().unwrap();
        assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-5));
    }

    #[test]
    fn shared_column_ranks_every_class_identically() {
        let heads = instance_heads(2, 3);
        let selector = InstanceSelector::new(&heads, 2, 0.2, true);
        let eval = selector
            .select(&random_bag(8, 10, 3), &ramp_logits(10, 1), 1)
            .unwrap();
        assert_eq!(eval.in_class().unwrap().indices, vec![9, 8, 0, 1]);
        assert_eq!(eval.out_of_class()[0].indices, vec![9, 8]);
    }

    #[test]
    fn rejects_small_bags_and_unknown_labels() {
        let heads = instance_heads(2, 3);
        let selector = InstanceSelector::new(&heads, 2, 0.1, true);
        let h = random_bag(1, 3, 3);
        assert!(matches!(
            selector.select(&h, &ramp_logits(3, 2), 0),
            Err(ClamError::InvalidTopK { k: 0, .. })
        ));
        let selector = InstanceSelector::new(&heads, 2, 0.5, true);
        assert!(matches!(
            selector.select(&h, &ramp_logits(3, 2), 2),
            Err(ClamError::UnknownClassIndex { index: 2, .. })
        ));
    }

    #[test]
    fn missing_instance_head_is_reported() {
        let heads = instance_heads(1, 3);
        let selector = InstanceSelector::new(&heads, 2, 0.5, true);
        let result = selector.select(&random_bag(2, 4, 3), &ramp_logits(4, 2), 0);
        assert!(matches!(
            result,
            Err(ClamError::MissingBranch { class: 1, .. })
        ));
    }
}
