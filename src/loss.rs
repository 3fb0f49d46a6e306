use burn::prelude::*;

/// The two task losses and their sum. All three stay retrievable so the
/// training loop can log them separately while backpropagating the total.
#[derive(Debug, Clone)]
pub struct JointLossOutput<B: Backend> {
    pub seg: Tensor<B, 1>,
    pub class: Tensor<B, 1>,
    pub total: Tensor<B, 1>,
}

/// Joint objective: sigmoid + binary cross-entropy on the segmentation
/// logits plus binary cross-entropy on the classification probability.
/// The total is the plain sum of the two, with no weighting; gradients from
/// both terms flow into the shared bottleneck.
pub struct JointLoss;

impl JointLoss {
    pub fn forward<B: Backend>(
        seg_logits: Tensor<B, 4>,
        target_mask: Tensor<B, 4>,
        label_prob: Tensor<B, 2>,
        target_label: Tensor<B, 2>,
    ) -> JointLossOutput<B> {
        let seg = bce_with_logits(seg_logits, target_mask);
        let class = bce(label_prob, target_label);
        let total = seg.clone() + class.clone();

        JointLossOutput { seg, class, total }
    }
}

/// Numerically stable `bce(sigmoid(x), t)`:
/// `max(x, 0) - x*t + ln(1 + e^(-|x|))`, mean-reduced.
pub fn bce_with_logits<B: Backend, const D: usize>(
    logits: Tensor<B, D>,
    targets: Tensor<B, D>,
) -> Tensor<B, 1> {
    let zeros = logits.zeros_like();
    let max_val = logits.clone().max_pair(zeros);

    let bce_term = max_val - logits.clone() * targets;
    let log_term = (logits.abs().neg().exp() + 1.0).log();

    (bce_term + log_term).mean()
}

/// Binary cross-entropy on probabilities, clamped away from 0 and 1.
pub fn bce<B: Backend, const D: usize>(
    probs: Tensor<B, D>,
    targets: Tensor<B, D>,
) -> Tensor<B, 1> {
    let eps = 1e-7;
    let probs = probs.clamp(eps, 1.0 - eps);

    let loss = targets.clone() * probs.clone().log()
        + (targets.neg() + 1.0) * (probs.neg() + 1.0).log();

    loss.neg().mean()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::activation::sigmoid;

    type TestBackend = burn::backend::ndarray::NdArray<f32>;

    fn device() -> <TestBackend as Backend>::Device {
        Default::default()
    }

    fn scalar(t: Tensor<TestBackend, 1>) -> f32 {
        t.into_scalar()
    }

    #[test]
    fn total_is_the_sum_of_both_terms() {
        let device = device();
        let seg_logits = Tensor::<TestBackend, 4>::from_floats(
            [[[[0.3, -1.2], [2.0, 0.0]]], [[[0.5, 0.5], [-0.5, 1.5]]]],
            &device,
        );
        let masks = Tensor::<TestBackend, 4>::from_floats(
            [[[[1.0, 0.0], [1.0, 0.0]]], [[[0.0, 1.0], [0.0, 1.0]]]],
            &device,
        );
        let label_probs = Tensor::<TestBackend, 2>::from_floats([[0.8], [0.2]], &device);
        let labels = Tensor::<TestBackend, 2>::from_floats([[1.0], [0.0]], &device);

        let out = JointLoss::forward(seg_logits, masks, label_probs, labels);

        let seg = scalar(out.seg);
        let class = scalar(out.class);
        let total = scalar(out.total);
        assert!((total - (seg + class)).abs() < 1e-6);
    }

    #[test]
    fn bce_with_logits_matches_sigmoid_then_bce() {
        let device = device();
        let logits =
            Tensor::<TestBackend, 2>::from_floats([[0.7, -2.0], [3.0, 0.1]], &device);
        let targets =
            Tensor::<TestBackend, 2>::from_floats([[1.0, 0.0], [1.0, 1.0]], &device);

        let stable = scalar(bce_with_logits(logits.clone(), targets.clone()));
        let naive = scalar(bce(sigmoid(logits), targets));

        assert!((stable - naive).abs() < 1e-5);
    }

    #[test]
    fn confident_correct_prediction_has_near_zero_loss() {
        let device = device();
        let probs = Tensor::<TestBackend, 2>::from_floats([[1.0], [0.0]], &device);
        let targets = Tensor::<TestBackend, 2>::from_floats([[1.0], [0.0]], &device);

        let loss = scalar(bce(probs, targets));

        assert!(loss >= 0.0);
        assert!(loss < 1e-5);
    }
}
