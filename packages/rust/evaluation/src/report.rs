//! Binary confusion matrix and per-class classification report.

use serde::Serialize;

/// 2x2 confusion matrix. Rows are true classes, columns predicted classes,
/// both ordered `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConfusionMatrix {
    pub matrix: [[u64; 2]; 2],
}

impl ConfusionMatrix {
    /// Tally `(truth, predicted)` pairs. Classes other than 0 and 1 are ignored.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (u8, u8)>) -> Self {
        let mut cm = Self::default();
        for (truth, pred) in pairs {
            if truth <= 1 && pred <= 1 {
                cm.matrix[truth as usize][pred as usize] += 1;
            }
        }
        cm
    }

    pub fn total(&self) -> u64 {
        self.matrix.iter().flatten().sum()
    }

    pub fn correct(&self) -> u64 {
        self.matrix[0][0] + self.matrix[1][1]
    }

    /// Rows with the given true class.
    fn support(&self, class: usize) -> u64 {
        self.matrix[class].iter().sum()
    }

    /// Rows predicted as the given class.
    fn predicted(&self, class: usize) -> u64 {
        self.matrix[0][class] + self.matrix[1][class]
    }

    /// JSON document with class labels and the matrix.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "labels": [0, 1],
            "matrix": self.matrix,
        })
    }
}

/// Precision, recall, F1 and support for one class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClassMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: u64,
}

/// Per-class and averaged classification metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationReport {
    /// Classes present in truth or predictions, ascending.
    pub classes: Vec<(u8, ClassMetrics)>,
    pub accuracy: f64,
    pub macro_avg: ClassMetrics,
    pub weighted_avg: ClassMetrics,
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 { 0.0 } else { num as f64 / den as f64 }
}

impl ClassificationReport {
    pub fn from_confusion(cm: &ConfusionMatrix) -> Self {
        let total = cm.total();
        let classes: Vec<(u8, ClassMetrics)> = (0..2usize)
            .filter(|&c| cm.support(c) > 0 || cm.predicted(c) > 0)
            .map(|c| {
                let tp = cm.matrix[c][c];
                let precision = ratio(tp, cm.predicted(c));
                let recall = ratio(tp, cm.support(c));
                let f1 = if precision + recall == 0.0 {
                    0.0
                } else {
                    2.0 * precision * recall / (precision + recall)
                };
                (
                    c as u8,
                    ClassMetrics {
                        precision,
                        recall,
                        f1,
                        support: cm.support(c),
                    },
                )
            })
            .collect();

        let n = classes.len().max(1) as f64;
        let macro_avg = ClassMetrics {
            precision: classes.iter().map(|(_, m)| m.precision).sum::<f64>() / n,
            recall: classes.iter().map(|(_, m)| m.recall).sum::<f64>() / n,
            f1: classes.iter().map(|(_, m)| m.f1).sum::<f64>() / n,
            support: total,
        };

        let weighted = |f: fn(&ClassMetrics) -> f64| -> f64 {
            if total == 0 {
                return 0.0;
            }
            classes
                .iter()
                .map(|(_, m)| f(m) * m.support as f64)
                .sum::<f64>()
                / total as f64
        };
        let weighted_avg = ClassMetrics {
            precision: weighted(|m| m.precision),
            recall: weighted(|m| m.recall),
            f1: weighted(|m| m.f1),
            support: total,
        };

        Self {
            classes,
            accuracy: ratio(cm.correct(), total),
            macro_avg,
            weighted_avg,
        }
    }

    /// Plain-text table with three decimals.
    pub fn render(&self) -> String {
        let width = "weighted avg".len();
        let row = |name: &str, m: &ClassMetrics| {
            format!(
                "{name:>width$}  {:>9.3} {:>9.3} {:>9.3} {:>9}\n",
                m.precision, m.recall, m.f1, m.support
            )
        };

        let mut out = format!(
            "{:>width$}  {:>9} {:>9} {:>9} {:>9}\n\n",
            "", "precision", "recall", "f1-score", "support"
        );
        for (class, metrics) in &self.classes {
            out.push_str(&row(&class.to_string(), metrics));
        }
        out.push('\n');
        out.push_str(&format!(
            "{:>width$}  {:>9} {:>9} {:>9.3} {:>9}\n",
            "accuracy", "", "", self.accuracy, self.macro_avg.support
        ));
        out.push_str(&row("macro avg", &self.macro_avg));
        out.push_str(&row("weighted avg", &self.weighted_avg));
        out
    }
}
