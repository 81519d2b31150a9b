//! Classification report
//!
//! Confusion matrix plus per-class precision, recall and F1, with macro and
//! support-weighted averages. Classes without any true samples are left out of
//! the averages.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Counts indexed as `[actual][predicted]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    counts: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        Self {
            counts: vec![vec![0; num_classes]; num_classes],
        }
    }

    pub fn from_predictions(predictions: &[usize], ground_truth: &[usize], num_classes: usize) -> Self {
        let mut matrix = Self::new(num_classes);
        for (&predicted, &actual) in predictions.iter().zip(ground_truth) {
            matrix.add(actual, predicted);
        }
        matrix
    }

    /// Record one prediction; ids outside the matrix are dropped
    pub fn add(&mut self, actual: usize, predicted: usize) {
        if let Some(cell) = self
            .counts
            .get_mut(actual)
            .and_then(|row| row.get_mut(predicted))
        {
            *cell += 1;
        }
    }

    pub fn get(&self, actual: usize, predicted: usize) -> usize {
        self.counts
            .get(actual)
            .and_then(|row| row.get(predicted))
            .copied()
            .unwrap_or(0)
    }

    pub fn num_classes(&self) -> usize {
        self.counts.len()
    }

    pub fn total(&self) -> usize {
        self.counts.iter().flatten().sum()
    }

    /// Sum of the diagonal
    pub fn correct(&self) -> usize {
        (0..self.num_classes()).map(|c| self.get(c, c)).sum()
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.correct(), self.total())
    }

    /// Samples whose true class is `class`
    pub fn actual_count(&self, class: usize) -> usize {
        self.counts.get(class).map(|row| row.iter().sum()).unwrap_or(0)
    }

    /// Samples predicted as `class`
    pub fn predicted_count(&self, class: usize) -> usize {
        self.counts.iter().filter_map(|row| row.get(class)).sum()
    }

    pub fn rows(&self) -> &[Vec<usize>] {
        &self.counts
    }
}

/// Scores for a single class
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassScores {
    pub class_id: usize,
    pub name: Option<String>,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// Number of samples whose true class is this one
    pub support: usize,
}

impl ClassScores {
    fn from_matrix(matrix: &ConfusionMatrix, class_id: usize) -> Self {
        let hits = matrix.get(class_id, class_id);
        let support = matrix.actual_count(class_id);
        let precision = ratio(hits, matrix.predicted_count(class_id));
        let recall = ratio(hits, support);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };

        Self {
            class_id,
            name: None,
            precision,
            recall,
            f1,
            support,
        }
    }

    fn label(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.class_id.to_string())
    }
}

/// Evaluation summary over a set of predictions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub total_samples: usize,
    pub correct_predictions: usize,
    /// Fraction correct, in [0, 1]
    pub accuracy: f64,
    pub macro_precision: f64,
    pub macro_recall: f64,
    pub macro_f1: f64,
    pub weighted_precision: f64,
    pub weighted_recall: f64,
    pub weighted_f1: f64,
    pub per_class: Vec<ClassScores>,
    pub confusion_matrix: ConfusionMatrix,
}

impl Metrics {
    /// Build the report from parallel prediction / label lists
    pub fn from_predictions(predictions: &[usize], ground_truth: &[usize], num_classes: usize) -> Self {
        let confusion_matrix = ConfusionMatrix::from_predictions(predictions, ground_truth, num_classes);
        let per_class: Vec<ClassScores> = (0..num_classes)
            .map(|class| ClassScores::from_matrix(&confusion_matrix, class))
            .collect();

        let present: Vec<&ClassScores> = per_class.iter().filter(|c| c.support > 0).collect();
        let support: usize = present.iter().map(|c| c.support).sum();
        let mean = |score: fn(&ClassScores) -> f64| {
            if present.is_empty() {
                0.0
            } else {
                present.iter().map(|c| score(c)).sum::<f64>() / present.len() as f64
            }
        };
        let weighted = |score: fn(&ClassScores) -> f64| {
            if support == 0 {
                0.0
            } else {
                present
                    .iter()
                    .map(|c| score(c) * c.support as f64)
                    .sum::<f64>()
                    / support as f64
            }
        };

        Self {
            total_samples: confusion_matrix.total(),
            correct_predictions: confusion_matrix.correct(),
            accuracy: confusion_matrix.accuracy(),
            macro_precision: mean(|c| c.precision),
            macro_recall: mean(|c| c.recall),
            macro_f1: mean(|c| c.f1),
            weighted_precision: weighted(|c| c.precision),
            weighted_recall: weighted(|c| c.recall),
            weighted_f1: weighted(|c| c.f1),
            per_class,
            confusion_matrix,
        }
    }

    /// Label the per-class rows, by class id
    pub fn with_class_names<S: AsRef<str>>(mut self, names: &[S]) -> Self {
        for scores in &mut self.per_class {
            scores.name = names.get(scores.class_id).map(|n| n.as_ref().to_string());
        }
        self
    }

    /// Multi-line text table
    pub fn display(&self) -> String {
        let width = self
            .per_class
            .iter()
            .map(|c| c.label().len())
            .chain(["weighted avg".len()])
            .max()
            .unwrap_or(12);

        let mut lines = vec![format!(
            "{:>width$}  {:>9}  {:>9}  {:>9}  {:>7}",
            "", "precision", "recall", "f1-score", "support"
        )];
        for c in &self.per_class {
            lines.push(format!(
                "{:>width$}  {:>9.4}  {:>9.4}  {:>9.4}  {:>7}",
                c.label(),
                c.precision,
                c.recall,
                c.f1,
                c.support
            ));
        }
        lines.push(String::new());
        lines.push(format!(
            "{:>width$}  {:>9}  {:>9}  {:>9.4}  {:>7}",
            "accuracy", "", "", self.accuracy, self.total_samples
        ));
        lines.push(format!(
            "{:>width$}  {:>9.4}  {:>9.4}  {:>9.4}  {:>7}",
            "macro avg", self.macro_precision, self.macro_recall, self.macro_f1, self.total_samples
        ));
        lines.push(format!(
            "{:>width$}  {:>9.4}  {:>9.4}  {:>9.4}  {:>7}",
            "weighted avg",
            self.weighted_precision,
            self.weighted_recall,
            self.weighted_f1,
            self.total_samples
        ));

        lines.join("\n")
    }
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display())
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}
