//! Held-out evaluation: accuracy and a per-class precision/recall/F1 report
//! built from linfa's confusion matrix.

use std::collections::BTreeSet;
use std::fmt;

use linfa::prelude::*;
use ndarray::Array1;
use serde::Serialize;

use super::forest::N_CLASSES;

/// Metrics of a single class
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClassMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// Report over both classes, in the usual classification-report layout.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationReport {
    pub classes: [ClassMetrics; N_CLASSES],
    pub accuracy: f64,
    pub macro_avg: ClassMetrics,
    pub weighted_avg: ClassMetrics,
}

/// Undefined scores (no predicted or no true members) count as 0.
fn score(value: f32) -> f64 {
    if value.is_finite() { f64::from(value) } else { 0.0 }
}

impl ClassificationReport {
    /// Build the report from true and predicted class labels.
    pub fn new(truth: &[usize], predicted: &[usize]) -> Result<Self, linfa::Error> {
        let truth = Array1::from(truth.to_vec());
        let predicted = Array1::from(predicted.to_vec());

        // Rows follow the ground truth, which keeps linfa's precision and
        // recall in their usual meaning.
        let cm = truth.confusion_matrix(&predicted)?;

        // linfa sorts the labels it saw and reverses a binary pair, so the
        // positive class comes first.
        let mut members: Vec<usize> = truth
            .iter()
            .chain(predicted.iter())
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if members.len() == 2 {
            members.reverse();
        }

        let mut classes = [ClassMetrics {
            precision: 0.0,
            recall: 0.0,
            f1: 0.0,
            support: 0,
        }; N_CLASSES];
        for (class, metrics) in classes.iter_mut().enumerate() {
            metrics.support = truth.iter().filter(|&&t| t == class).count();
        }
        for (&class, binary) in members.iter().zip(cm.split_one_vs_all()) {
            if let Some(metrics) = classes.get_mut(class) {
                metrics.precision = score(binary.precision());
                metrics.recall = score(binary.recall());
                metrics.f1 = score(binary.f1_score());
            }
        }

        let total = truth.len();
        let macro_avg = average(&classes, |_| 1.0 / N_CLASSES as f64, total);
        let weighted_avg = average(
            &classes,
            |m| {
                if total == 0 {
                    0.0
                } else {
                    m.support as f64 / total as f64
                }
            },
            total,
        );

        Ok(Self {
            classes,
            accuracy: score(cm.accuracy()),
            macro_avg,
            weighted_avg,
        })
    }
}

fn average(
    classes: &[ClassMetrics; N_CLASSES],
    weight: impl Fn(&ClassMetrics) -> f64,
    support: usize,
) -> ClassMetrics {
    let mut avg = ClassMetrics {
        precision: 0.0,
        recall: 0.0,
        f1: 0.0,
        support,
    };
    for m in classes {
        let w = weight(m);
        avg.precision += w * m.precision;
        avg.recall += w * m.recall;
        avg.f1 += w * m.f1;
    }
    avg
}

impl fmt::Display for ClassificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:>14} {:>10} {:>10} {:>10} {:>10}",
            "", "precision", "recall", "f1-score", "support"
        )?;
        for (class, m) in self.classes.iter().enumerate() {
            writeln!(
                f,
                "{:>14} {:>10.2} {:>10.2} {:>10.2} {:>10}",
                class, m.precision, m.recall, m.f1, m.support
            )?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "{:>14} {:>10} {:>10} {:>10.2} {:>10}",
            "accuracy", "", "", self.accuracy, self.macro_avg.support
        )?;
        for (name, m) in [("macro avg", &self.macro_avg), ("weighted avg", &self.weighted_avg)] {
            writeln!(
                f,
                "{:>14} {:>10.2} {:>10.2} {:>10.2} {:>10}",
                name, m.precision, m.recall, m.f1, m.support
            )?;
        }
        Ok(())
    }
}
