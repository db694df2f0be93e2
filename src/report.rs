//! Slide-level evaluation summary and the per-slide result table.

use std::fmt;
use std::fs;
use std::path::Path;

use crate::error::Result;

const TSV_HEADER: &str = "Sample Names\tSlide True Label\tSlide Predict Label";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlideRecord {
    pub name: String,
    pub true_label: usize,
    pub predicted_label: usize,
}

/// Binary metrics with class 1 as the positive class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinaryMetrics {
    pub tn: usize,
    pub fp: usize,
    pub fn_: usize,
    pub tp: usize,
    pub sensitivity: Option<f64>,
    pub specificity: Option<f64>,
    /// Area under the ROC curve of the hard predictions.
    pub auc: Option<f64>,
}

pub struct EvalReport {
    n_class: usize,
    records: Vec<SlideRecord>,
    failed: Vec<String>,
}

impl EvalReport {
    pub fn new(n_class: usize) -> Self {
        Self {
            n_class,
            records: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn push(&mut self, name: impl Into<String>, true_label: usize, predicted_label: usize) {
        self.records.push(SlideRecord {
            name: name.into(),
            true_label,
            predicted_label,
        });
    }

    pub fn push_failure(&mut self, name: impl Into<String>) {
        self.failed.push(name.into());
    }

    pub fn records(&self) -> &[SlideRecord] {
        &self.records
    }

    pub fn failed(&self) -> &[String] {
        &self.failed
    }

    /// Counts indexed `[true][predicted]`. Labels outside `n_class` are not counted.
    pub fn confusion(&self) -> Vec<Vec<usize>> {
        let mut matrix = vec![vec![0usize; self.n_class]; self.n_class];
        for r in &self.records {
            if r.true_label < self.n_class && r.predicted_label < self.n_class {
                matrix[r.true_label][r.predicted_label] += 1;
            }
        }
        matrix
    }

    pub fn accuracy(&self) -> Option<f64> {
        if self.records.is_empty() {
            return None;
        }
        let correct = self
            .records
            .iter()
            .filter(|r| r.true_label == r.predicted_label)
            .count();
        Some(correct as f64 / self.records.len() as f64)
    }

    pub fn binary(&self) -> Option<BinaryMetrics> {
        if self.n_class != 2 {
            return None;
        }
        let m = self.confusion();
        let (tn, fp, fn_, tp) = (m[0][0], m[0][1], m[1][0], m[1][1]);
        let ratio = |num: usize, den: usize| (den > 0).then(|| num as f64 / den as f64);
        let sensitivity = ratio(tp, tp + fn_);
        let specificity = ratio(tn, tn + fp);
        // one threshold: ROC through (0,0), (fpr,tpr), (1,1)
        let auc = match (sensitivity, specificity) {
            (Some(tpr), Some(tnr)) => Some((1.0 + tpr - (1.0 - tnr)) / 2.0),
            _ => None,
        };
        Some(BinaryMetrics {
            tn,
            fp,
            fn_,
            tp,
            sensitivity,
            specificity,
            auc,
        })
    }

    pub fn to_tsv(&self) -> String {
        let mut text = String::from(TSV_HEADER);
        text.push('\n');
        for r in &self.records {
            text.push_str(&format!("{}\t{}\t{}\n", r.name, r.true_label, r.predicted_label));
        }
        text
    }

    pub fn write_tsv(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_tsv())?;
        Ok(())
    }
}

fn pct(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{:.4}%", v * 100.0))
}

impl fmt::Display for EvalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Slides: {} (failed {})  Accuracy: {}",
            self.records.len(),
            self.failed.len(),
            pct(self.accuracy())
        )?;
        if let Some(b) = self.binary() {
            write!(
                f,
                "  Sensitivity: {}  Specificity: {}  AUC: {}  [tn {} fp {} fn {} tp {}]",
                pct(b.sensitivity),
                pct(b.specificity),
                b.auc.map_or_else(|| "n/a".to_string(), |a| format!("{a:.4}")),
                b.tn,
                b.fp,
                b.fn_,
                b.tp
            )?;
        }
        Ok(())
    }
}
