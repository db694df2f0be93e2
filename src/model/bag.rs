use candle_core::{DType, Tensor};
use candle_nn as nn;

use super::classifier::{ClassArena, Classifier};
use crate::config::BranchMode;
use crate::error::{ensure_dim, ClamError, Result};

/// Slide-level scoring head.
pub enum BagClassifier {
    /// One classifier applied to the whole `[n_class, D]` aggregate, one score per row.
    Single(Box<dyn Classifier>),
    /// Classifier `c` scores aggregate row `c` only.
    Multi(ClassArena<Box<dyn Classifier>>),
}

impl BagClassifier {
    pub fn mode(&self) -> BranchMode {
        match self {
            BagClassifier::Single(_) => BranchMode::Single,
            BagClassifier::Multi(_) => BranchMode::Multi,
        }
    }

    /// Unnormalized slide scores, one per class in class order.
    pub fn scores(&self, aggregate: &Tensor, n_class: usize) -> Result<Vec<f32>> {
        let (rows, dim) = aggregate.dims2()?;
        ensure_dim("aggregate rows", n_class, rows)?;
        match self {
            BagClassifier::Single(classifier) => {
                let out = score_rows(classifier.as_ref(), aggregate, dim)?;
                Ok(out.flatten_all()?.to_vec1::<f32>()?)
            }
            BagClassifier::Multi(classifiers) => {
                let mut scores = Vec::with_capacity(n_class);
                for class in 0..n_class {
                    let classifier = classifiers.branch(class, n_class, "bag")?;
                    let row = aggregate.narrow(0, class, 1)?;
                    let out = score_rows(classifier.as_ref(), &row, dim)?;
                    scores.push(out.flatten_all()?.get(0)?.to_scalar::<f32>()?);
                }
                Ok(scores)
            }
        }
    }
}

fn score_rows(classifier: &dyn Classifier, rows: &Tensor, dim: usize) -> Result<Tensor> {
    ensure_dim("bag classifier input", dim, classifier.in_dim())?;
    ensure_dim("bag classifier output", 1, classifier.out_dim())?;
    Ok(classifier.evaluate(rows)?.to_dtype(DType::F32)?)
}

/// Attention-weighted sum of compressed features per class: `A_norm^T . H`.
///
/// A single attention column weights every class row alike, so the result is always
/// `[n_class, D]`.
pub fn aggregate(attention: &Tensor, h: &Tensor, n_class: usize) -> Result<Tensor> {
    let (n_patches, width) = attention.dims2()?;
    let (n_features, _) = h.dims2()?;
    ensure_dim("attention rows", n_features, n_patches)?;
    let weights = if width == 1 {
        attention.broadcast_as((n_patches, n_class))?
    } else {
        ensure_dim("attention columns", n_class, width)?;
        attention.clone()
    };
    Ok(weights.t()?.contiguous()?.matmul(&h.contiguous()?)?)
}

/// Slide-level outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct SlidePrediction {
    pub scores: Vec<f32>,
    pub probs: Vec<f32>,
    /// Top-1 index of `scores`.
    pub y_hat: usize,
    /// One-hot ground truth over `n_class`.
    pub y_true: Vec<f32>,
    /// Class with the highest probability; equal to `y_hat`.
    pub predicted_label: usize,
}

impl SlidePrediction {
    pub fn from_scores(scores: Vec<f32>, label: usize, n_class: usize) -> Result<Self> {
        ensure_dim("slide scores", n_class, scores.len())?;
        if label >= n_class {
            return Err(ClamError::UnknownClassIndex {
                index: label,
                n_class,
            });
        }
        let y_hat = argmax(&scores);
        let logits = Tensor::new(scores.as_slice(), &candle_core::Device::Cpu)?;
        let probs = nn::ops::softmax(&logits, 0)?.to_vec1::<f32>()?;
        // softmax can round near-tied scores to equal probabilities; only a strictly
        // larger probability elsewhere is a real disagreement
        let max_prob = probs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        if !(probs[y_hat] >= max_prob) {
            return Err(ClamError::PredictionMismatch {
                y_hat,
                predicted: argmax(&probs),
            });
        }
        let predicted_label = y_hat;
        let mut y_true = vec![0.0; n_class];
        y_true[label] = 1.0;
        Ok(Self {
            scores,
            probs,
            y_hat,
            y_true,
            predicted_label,
        })
    }
}

/// First index of the maximum value.
pub fn argmax(values: &[f32]) -> usize {
    let mut best = 0usize;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}

/// Aggregates the bag and scores it. Returns the `[n_class, D]` aggregate with the prediction.
pub fn classify(
    head: &BagClassifier,
    attention: &Tensor,
    h: &Tensor,
    label: usize,
    n_class: usize,
) -> Result<(Tensor, SlidePrediction)> {
    let slide_aggregate = aggregate(attention, h, n_class)?;
    let scores = head.scores(&slide_aggregate, n_class)?;
    let prediction = SlidePrediction::from_scores(scores, label, n_class)?;
    Ok((slide_aggregate, prediction))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::classifier::Activation;
    use crate::model::testing::{boxed, dense, matrix};

    fn assert_close(a: &[Vec<f32>], b: &[Vec<f32>]) {
        for (ra, rb) in a.iter().zip(b) {
            for (x, y) in ra.iter().zip(rb) {
                assert!((x - y).abs() < 1e-5, "{a:?} != {b:?}");
            }
        }
    }

    #[test]
    fn aggregate_is_weighted_sum_per_class() {
        let attention = matrix(&[&[0.25, 1.0], &[0.75, 0.0]]);
        let h = matrix(&[&[4.0, 0.0], &[0.0, 8.0]]);
        let agg = aggregate(&attention, &h, 2).unwrap().to_vec2::<f32>().unwrap();
        assert_close(&agg, &[vec![1.0, 6.0], vec![4.0, 0.0]]);
    }

    #[test]
    fn single_patch_aggregate_is_weighted_feature() {
        let attention = matrix(&[&[1.0, 1.0, 1.0]]);
        let h = matrix(&[&[0.5, -2.0, 3.0]]);
        let agg = aggregate(&attention, &h, 3).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(agg.len(), 3);
        for row in agg {
            assert_close(&[row], &[vec![0.5, -2.0, 3.0]]);
        }
    }

    #[test]
    fn shared_column_broadcasts_to_every_class() {
        let attention = matrix(&[&[0.5], &[0.5]]);
        let h = matrix(&[&[2.0], &[4.0]]);
        let agg = aggregate(&attention, &h, 3).unwrap().to_vec2::<f32>().unwrap();
        assert_close(&agg, &[vec![3.0], vec![3.0], vec![3.0]]);
    }

    #[test]
    fn aggregate_rejects_row_mismatch() {
        let attention = matrix(&[&[0.5, 0.5]]);
        let h = matrix(&[&[1.0], &[2.0]]);
        assert!(matches!(
            aggregate(&attention, &h, 2),
            Err(ClamError::ShapeMismatch {
                expected: 2,
                actual: 1,
                ..
            })
        ));
    }

    #[test]
    fn single_branch_scores_each_aggregate_row() {
        let head = BagClassifier::Single(boxed(dense(&[&[1.0, 2.0]], &[0.5], Activation::Identity)));
        let agg = matrix(&[&[1.0, 1.0], &[0.0, -1.0]]);
        assert_eq!(head.scores(&agg, 2).unwrap(), vec![3.5, -1.5]);
        assert_eq!(head.mode(), BranchMode::Single);
    }

    #[test]
    fn multi_branch_scores_only_own_row() {
        let head = BagClassifier::Multi(ClassArena::new(vec![
            boxed(dense(&[&[1.0, 0.0]], &[0.0], Activation::Identity)),
            boxed(dense(&[&[0.0, 10.0]], &[1.0], Activation::Identity)),
        ]));
        let agg = matrix(&[&[2.0, 100.0], &[100.0, 3.0]]);
        assert_eq!(head.scores(&agg, 2).unwrap(), vec![2.0, 31.0]);
        assert_eq!(head.mode(), BranchMode::Multi);
    }

    #[test]
    fn multi_branch_reports_missing_class() {
        let head = BagClassifier::Multi(ClassArena::new(vec![boxed(dense(
            &[&[1.0]],
            &[0.0],
            Activation::Identity,
        ))]));
        let agg = matrix(&[&[1.0], &[2.0]]);
        assert!(matches!(
            head.scores(&agg, 2),
            Err(ClamError::MissingBranch { class: 1, .. })
        ));
    }

    #[test]
    fn classifier_width_must_match_features() {
        let head = BagClassifier::Single(boxed(dense(&[&[1.0, 1.0, 1.0]], &[0.0], Activation::Identity)));
        let agg = matrix(&[&[1.0, 1.0], &[1.0, 1.0]]);
        assert!(matches!(
            head.scores(&agg, 2),
            Err(ClamError::ShapeMismatch { .. })
        ));
        let wide = BagClassifier::Single(boxed(dense(
            &[&[1.0, 1.0], &[1.0, 1.0]],
            &[0.0, 0.0],
            Activation::Identity,
        )));
        assert!(wide.scores(&agg, 2).is_err());
    }

    #[test]
    fn prediction_agrees_with_probabilities() {
        let cases: [&[f32]; 4] = [
            &[0.1, 2.0],
            &[3.0, -1.0, 2.9],
            &[1.0, 1.0, 0.5],
            &[-5.0, -5.0, -4.999],
        ];
        for scores in cases {
            let n = scores.len();
            let p = SlidePrediction::from_scores(scores.to_vec(), n - 1, n).unwrap();
            assert_eq!(p.y_hat, argmax(&p.probs));
            assert_eq!(p.y_hat, p.predicted_label);
            assert!((p.probs.iter().sum::<f32>() - 1.0).abs() < 1e-5);
            assert_eq!(p.y_true.iter().sum::<f32>(), 1.0);
            assert_eq!(p.y_true[n - 1], 1.0);
        }
    }

    #[test]
    fn near_tied_scores_keep_score_argmax() {
        let p = SlidePrediction::from_scores(vec![0.0, 1e-9], 0, 2).unwrap();
        assert_eq!(p.y_hat, 1);
        assert_eq!(p.predicted_label, 1);
        assert_eq!(p.probs[0], p.probs[1]);

        let p = SlidePrediction::from_scores(vec![7.0, 7.0 + 1e-7, 6.0], 2, 3).unwrap();
        assert_eq!(p.predicted_label, p.y_hat);
    }

    #[test]
    fn non_finite_scores_are_rejected() {
        assert!(matches!(
            SlidePrediction::from_scores(vec![f32::NAN, f32::NAN], 0, 2),
            Err(ClamError::PredictionMismatch { .. })
        ));
    }

    #[test]
    fn ties_pick_first_class() {
        let p = SlidePrediction::from_scores(vec![1.0, 1.0], 0, 2).unwrap();
        assert_eq!(p.y_hat, 0);
        assert_eq!(p.probs, vec![0.5, 0.5]);
    }

    #[test]
    fn one_hot_depth_follows_class_count() {
        let p = SlidePrediction::from_scores(vec![0.0; 4], 2, 4).unwrap();
        assert_eq!(p.y_true, vec![0.0, 0.0, 1.0, 0.0]);
        assert!(matches!(
            SlidePrediction::from_scores(vec![0.0; 4], 4, 4),
            Err(ClamError::UnknownClassIndex { index: 4, .. })
        ));
    }
}
