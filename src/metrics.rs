use std::fmt;

/// Decision threshold shared by the segmentation and classification sides.
pub const THRESHOLD: f32 = 0.5;

const IOU_SMOOTH: f64 = 1e-6;
const DICE_SMOOTH: f64 = 1.0;

/// Aggregate segmentation scores over one batch (or, once averaged, over a
/// whole split).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SegmentationScores {
    pub jaccard: f64,
    pub f1: f64,
    pub recall: f64,
    pub precision: f64,
    pub accuracy: f64,
    pub dice: f64,
    pub iou: f64,
    pub bce: f64,
}

impl SegmentationScores {
    pub fn accumulate(&mut self, other: &SegmentationScores) {
        self.jaccard += other.jaccard;
        self.f1 += other.f1;
        self.recall += other.recall;
        self.precision += other.precision;
        self.accuracy += other.accuracy;
        self.dice += other.dice;
        self.iou += other.iou;
        self.bce += other.bce;
    }

    pub fn averaged(&self, batches: usize) -> SegmentationScores {
        let n = batches.max(1) as f64;
        SegmentationScores {
            jaccard: self.jaccard / n,
            f1: self.f1 / n,
            recall: self.recall / n,
            precision: self.precision / n,
            accuracy: self.accuracy / n,
            dice: self.dice / n,
            iou: self.iou / n,
            bce: self.bce / n,
        }
    }
}

impl fmt::Display for SegmentationScores {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Jaccard: {:1.4} - F1: {:1.4} - Recall: {:1.4} - Precision: {:1.4} - Acc: {:1.4}",
            self.jaccard, self.f1, self.recall, self.precision, self.accuracy,
        )?;
        write!(
            f,
            "Dice loss: {:1.4} - IoU: {:1.4} - BCE: {:1.4}",
            self.dice, self.iou, self.bce,
        )
    }
}

/// Scores a predicted mask (probabilities) against its target over flattened
/// pixel arrays. Both sides are binarized at [`THRESHOLD`] first; degenerate
/// denominators (a batch with only one class present) score 0 rather than
/// dividing by zero.
pub fn segmentation_scores(pred: &[f32], target: &[f32]) -> SegmentationScores {
    assert_eq!(
        pred.len(),
        target.len(),
        "prediction and target must cover the same pixels"
    );

    let mut tp = 0u64;
    let mut fp = 0u64;
    let mut fn_ = 0u64;
    let mut tn = 0u64;
    for (&p, &t) in pred.iter().zip(target) {
        match (p > THRESHOLD, t > THRESHOLD) {
            (true, true) => tp += 1,
            (true, false) => fp += 1,
            (false, true) => fn_ += 1,
            (false, false) => tn += 1,
        }
    }
    let total = (tp + fp + fn_ + tn).max(1) as f64;

    SegmentationScores {
        jaccard: ratio(tp, tp + fp + fn_),
        f1: ratio(2 * tp, 2 * tp + fp + fn_),
        recall: ratio(tp, tp + fn_),
        precision: ratio(tp, tp + fp),
        accuracy: (tp + tn) as f64 / total,
        dice: dice_loss(tp, tp + fp, tp + fn_),
        iou: iou_score(pred, target),
        bce: binary_cross_entropy(pred, target),
    }
}

fn ratio(num: u64, denom: u64) -> f64 {
    if denom == 0 {
        0.0
    } else {
        num as f64 / denom as f64
    }
}

/// Dice loss `1 - (2*I + eps) / (|A| + |B| + eps)` with `eps = 1` over the
/// binarized arrays. Perfect overlap scores exactly 0.
fn dice_loss(intersection: u64, pred_count: u64, target_count: u64) -> f64 {
    1.0 - (2.0 * intersection as f64 + DICE_SMOOTH)
        / (pred_count as f64 + target_count as f64 + DICE_SMOOTH)
}

/// Elementwise smoothed intersection-over-union, snapped into 11 discrete
/// buckets and averaged over the pixels. Deliberately coarse: this is a
/// reporting metric, not exact IoU.
pub fn iou_score(pred: &[f32], target: &[f32]) -> f64 {
    if pred.is_empty() {
        return 0.0;
    }

    let mut sum = 0.0;
    for (&p, &t) in pred.iter().zip(target) {
        let p = p > THRESHOLD;
        let t = t > THRESHOLD;
        let intersection = (p && t) as u8 as f64;
        let union = (p || t) as u8 as f64;
        sum += quantize_iou((intersection + IOU_SMOOTH) / (union + IOU_SMOOTH));
    }

    sum / pred.len() as f64
}

/// Snaps an intersection/union ratio to the nearest of the 11 levels
/// `0.0, 0.1, ..., 1.0` via `ceil(clamp(20*(r - 0.5), 0, 10)) / 10`.
pub fn quantize_iou(ratio: f64) -> f64 {
    ((ratio - 0.5) * 20.0).clamp(0.0, 10.0).ceil() / 10.0
}

fn binary_cross_entropy(pred: &[f32], target: &[f32]) -> f64 {
    if pred.is_empty() {
        return 0.0;
    }

    let eps = 1e-7;
    let mut sum = 0.0;
    for (&p, &t) in pred.iter().zip(target) {
        let p = (p as f64).clamp(eps, 1.0 - eps);
        let t = t as f64;
        sum -= t * p.ln() + (1.0 - t) * (1.0 - p).ln();
    }

    sum / pred.len() as f64
}

/// Exact-match rate of thresholded label probabilities against ground truth.
pub fn classification_accuracy(probs: &[f32], targets: &[f32]) -> f64 {
    if probs.is_empty() {
        return 0.0;
    }

    let correct = probs
        .iter()
        .zip(targets)
        .filter(|(&p, &t)| (p > THRESHOLD) == (t > THRESHOLD))
        .count();

    correct as f64 / probs.len() as f64
}

/// Binary confusion matrix over image-level labels, with class 1 positive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfusionMatrix {
    pub tp: usize,
    pub fp: usize,
    pub fn_: usize,
    pub tn: usize,
}

impl ConfusionMatrix {
    pub fn from_labels(y_true: &[u8], y_pred: &[u8]) -> Self {
        assert_eq!(y_true.len(), y_pred.len(), "label lists must align");

        let mut matrix = ConfusionMatrix::default();
        for (&t, &p) in y_true.iter().zip(y_pred) {
            match (t != 0, p != 0) {
                (true, true) => matrix.tp += 1,
                (false, true) => matrix.fp += 1,
                (true, false) => matrix.fn_ += 1,
                (false, false) => matrix.tn += 1,
            }
        }
        matrix
    }

    pub fn total(&self) -> usize {
        self.tp + self.fp + self.fn_ + self.tn
    }

    pub fn accuracy(&self) -> f64 {
        if self.total() == 0 {
            0.0
        } else {
            (self.tp + self.tn) as f64 / self.total() as f64
        }
    }
}

impl fmt::Display for ConfusionMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "              pred 0   pred 1")?;
        writeln!(f, "    true 0  {:>8} {:>8}", self.tn, self.fp)?;
        write!(f, "    true 1  {:>8} {:>8}", self.fn_, self.tp)
    }
}

/// Per-class precision/recall/F1 plus support for one label value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClassScores {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// Two-class classification report over the full test set's accumulated
/// predicted vs. true labels.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClassReport {
    pub negative: ClassScores,
    pub positive: ClassScores,
    pub accuracy: f64,
}

pub fn classification_report(y_true: &[u8], y_pred: &[u8]) -> ClassReport {
    let matrix = ConfusionMatrix::from_labels(y_true, y_pred);

    ClassReport {
        negative: class_scores(
            matrix.tn as u64,
            matrix.fn_ as u64,
            matrix.fp as u64,
            matrix.tn + matrix.fp,
        ),
        positive: class_scores(
            matrix.tp as u64,
            matrix.fp as u64,
            matrix.fn_ as u64,
            matrix.tp + matrix.fn_,
        ),
        accuracy: matrix.accuracy(),
    }
}

fn class_scores(tp: u64, fp: u64, fn_: u64, support: usize) -> ClassScores {
    let precision = ratio(tp, tp + fp);
    let recall = ratio(tp, tp + fn_);
    let f1 = if precision + recall == 0.0 {
        0.0
    } else {
        2.0 * precision * recall / (precision + recall)
    };

    ClassScores {
        precision,
        recall,
        f1,
        support,
    }
}

impl fmt::Display for ClassReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "           precision   recall    f1     support")?;
        for (name, scores) in [("class 0", &self.negative), ("class 1", &self.positive)] {
            writeln!(
                f,
                "  {name}    {:8.2} {:8.2} {:8.2} {:8}",
                scores.precision, scores.recall, scores.f1, scores.support,
            )?;
        }
        write!(f, "  accuracy {:8.2}", self.accuracy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hand_computed_reference_scores() {
        // y_true=[1,1,0,0], y_pred=[1,0,0,0]: one hit, one miss, no false alarms.
        let target = [1.0, 1.0, 0.0, 0.0];
        let pred = [1.0, 0.0, 0.0, 0.0];

        let scores = segmentation_scores(&pred, &target);

        assert_eq!(scores.precision, 1.0);
        assert_eq!(scores.recall, 0.5);
        assert_eq!(scores.accuracy, 0.75);
        assert_eq!(scores.jaccard, 0.5);
    }

    #[test]
    fn dice_of_perfect_overlap_is_zero() {
        let mask = [1.0, 0.0, 1.0, 1.0, 0.0];

        let scores = segmentation_scores(&mask, &mask);

        assert_eq!(scores.dice, 0.0);
    }

    #[test]
    fn dice_of_total_disagreement_approaches_one() {
        let pred: Vec<f32> = (0..1000).map(|i| if i < 500 { 1.0 } else { 0.0 }).collect();
        let target: Vec<f32> = (0..1000).map(|i| if i < 500 { 0.0 } else { 1.0 }).collect();

        let scores = segmentation_scores(&pred, &target);

        assert!(scores.dice > 0.99);
    }

    #[test]
    fn iou_quantization_boundaries() {
        assert_eq!(quantize_iou(1.0), 1.0);
        assert_eq!(quantize_iou(0.0), 0.0);
        // A barely-positive smoothed ratio still snaps to the bottom bucket.
        assert_eq!(quantize_iou(IOU_SMOOTH / (1.0 + IOU_SMOOTH)), 0.0);
    }

    #[test]
    fn degenerate_single_class_batch_scores_zero_not_nan() {
        let pred = [0.0, 0.0, 0.0];
        let target = [0.0, 0.0, 0.0];

        let scores = segmentation_scores(&pred, &target);

        assert_eq!(scores.precision, 0.0);
        assert_eq!(scores.recall, 0.0);
        assert_eq!(scores.jaccard, 0.0);
        assert_eq!(scores.accuracy, 1.0);
        // Both masks empty: elementwise smoothed IoU treats agreement as 1.
        assert_eq!(scores.iou, 1.0);
    }

    #[test]
    fn classification_report_reference() {
        let y_true = [1, 1, 0, 0];
        let y_pred = [1, 0, 0, 0];

        let report = classification_report(&y_true, &y_pred);

        assert_eq!(report.positive.precision, 1.0);
        assert_eq!(report.positive.recall, 0.5);
        assert_eq!(report.accuracy, 0.75);
        assert_eq!(report.positive.support, 2);
        assert_eq!(report.negative.support, 2);
    }

    #[test]
    fn confusion_matrix_counts() {
        let matrix = ConfusionMatrix::from_labels(&[1, 1, 0, 0, 1], &[1, 0, 0, 1, 1]);

        assert_eq!(
            matrix,
            ConfusionMatrix {
                tp: 2,
                fp: 1,
                fn_: 1,
                tn: 1
            }
        );
        assert_eq!(matrix.accuracy(), 0.6);
    }

    #[test]
    fn classification_accuracy_is_exact_match_rate() {
        let probs = [0.9, 0.2, 0.7, 0.4];
        let targets = [1.0, 0.0, 0.0, 0.0];

        assert_eq!(classification_accuracy(&probs, &targets), 0.75);
    }
}
