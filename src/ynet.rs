use crate::blocks::{
    ConvBlock, ConvBlockConfig, DecoderStage, DecoderStageConfig, EncoderStage, EncoderStageConfig,
};
use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        Linear, LinearConfig, Sigmoid,
    },
    prelude::*,
    tensor::module::adaptive_avg_pool2d,
};

/// Dual-headed encoder/decoder network for joint lesion segmentation and
/// binary classification.
///
/// The encoder stages are run in order, each contributing a skip feature; the
/// decoder stages consume the skips in reverse order, so the pairing is the
/// zip of `decoders` with `skips.rev()` rather than an attribute naming
/// convention. Both heads read the bottleneck: the decoder path reconstructs
/// a full-resolution mask from it, while the classification branch pools it
/// through one further encoder stage into a 3-layer fully connected head.
#[derive(Module, Debug)]
pub struct YNet<B: Backend> {
    encoders: Vec<EncoderStage<B>>,
    bottleneck: ConvBlock<B>,
    decoders: Vec<DecoderStage<B>>,
    seg_head: Conv2d<B>,
    class_encoder: EncoderStage<B>,
    fc1: Linear<B>,
    fc2: Linear<B>,
    fc3: Linear<B>,
    sigmoid: Sigmoid,
    in_channels: usize,
}

#[derive(Config, Debug)]
pub struct YNetConfig {
    #[config(default = 3)]
    pub in_channels: usize,
    #[config(default = 32)]
    pub base_channels: usize,
    #[config(default = 64)]
    pub bottleneck_channels: usize,
    #[config(default = 4)]
    pub depth: usize,
    #[config(default = 64)]
    pub fc1_units: usize,
    #[config(default = 32)]
    pub fc2_units: usize,
}

impl YNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> YNet<B> {
        let mut encoders = Vec::with_capacity(self.depth);
        let mut in_c = self.in_channels;
        for _ in 0..self.depth {
            encoders.push(EncoderStageConfig::new(in_c, self.base_channels).init(device));
            in_c = self.base_channels;
        }

        let bottleneck =
            ConvBlockConfig::new(self.base_channels, self.bottleneck_channels).init(device);

        let mut decoders = Vec::with_capacity(self.depth);
        let mut in_c = self.bottleneck_channels;
        for _ in 0..self.depth {
            decoders.push(DecoderStageConfig::new(in_c, self.base_channels).init(device));
            in_c = self.base_channels;
        }

        YNet {
            encoders,
            bottleneck,
            decoders,
            seg_head: Conv2dConfig::new([self.base_channels, 1], [1, 1]).init(device),
            class_encoder: EncoderStageConfig::new(
                self.bottleneck_channels,
                self.bottleneck_channels,
            )
            .init(device),
            fc1: LinearConfig::new(self.bottleneck_channels, self.fc1_units).init(device),
            fc2: LinearConfig::new(self.fc1_units, self.fc2_units).init(device),
            fc3: LinearConfig::new(self.fc2_units, 1).init(device),
            sigmoid: Sigmoid::new(),
            in_channels: self.in_channels,
        }
    }
}

impl<B: Backend> YNet<B> {
    /// Runs the joint forward pass.
    ///
    /// Input: image batch of shape `(N, in_channels, H, W)` with `H` and `W`
    /// divisible by `2^depth`. Output: segmentation logits `(N, 1, H, W)`
    /// (sigmoid is applied by the loss/metric code, not here) and the
    /// classification probability `(N, 1)` in `[0, 1]`.
    pub fn forward(&self, x: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 2>) {
        let [_, channels, height, width] = x.dims();
        assert_eq!(
            channels, self.in_channels,
            "input has {channels} channels but the first convolution expects {}",
            self.in_channels,
        );
        let stride = 1 << self.encoders.len();
        assert!(
            height % stride == 0 && width % stride == 0,
            "input {height}x{width} is not divisible by the encoder stride {stride}",
        );

        let mut skips = Vec::with_capacity(self.encoders.len());
        let mut pooled = x;
        for encoder in &self.encoders {
            let (skip, p) = encoder.forward(pooled);
            skips.push(skip);
            pooled = p;
        }

        let bottleneck = self.bottleneck.forward(pooled);

        let mut features = bottleneck.clone();
        for (decoder, skip) in self.decoders.iter().zip(skips.into_iter().rev()) {
            features = decoder.forward(features, skip);
        }
        let seg_logits = self.seg_head.forward(features);

        // The extra encoder stage exists only to condense the bottleneck for
        // pooling; its skip output is discarded.
        let (_, class_features) = self.class_encoder.forward(bottleneck);
        let [batch_size, channels, _, _] = class_features.dims();
        let pooled = adaptive_avg_pool2d(class_features, [1, 1]).reshape([batch_size, channels]);

        let y = self.fc1.forward(pooled);
        let y = self.fc2.forward(y);
        let y = self.fc3.forward(y);
        let label = self.sigmoid.forward(y);

        (seg_logits, label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestBackend = burn::backend::ndarray::NdArray<f32>;

    fn device() -> <TestBackend as Backend>::Device {
        Default::default()
    }

    #[test]
    fn forward_produces_mask_logits_and_label_probability() {
        let device = device();
        let model = YNetConfig::new().init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::random(
            [2, 3, 64, 64],
            burn::tensor::Distribution::Default,
            &device,
        );

        let (seg, label) = model.forward(x);

        assert_eq!(seg.dims(), [2, 1, 64, 64]);
        assert_eq!(label.dims(), [2, 1]);

        let probs = label.to_data().to_vec::<f32>().unwrap();
        assert!(probs.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn all_black_batch_stays_finite() {
        let device = device();
        let model = YNetConfig::new().init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::zeros([5, 3, 32, 32], &device);

        let (seg, label) = model.forward(x);

        let seg = seg.to_data().to_vec::<f32>().unwrap();
        let label = label.to_data().to_vec::<f32>().unwrap();
        assert!(seg.iter().all(|v| v.is_finite()));
        assert!(label.iter().all(|v| v.is_finite()));
    }

    #[test]
    #[should_panic(expected = "channels")]
    fn wrong_channel_count_fails_fast() {
        let device = device();
        let model = YNetConfig::new().init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::zeros([1, 4, 32, 32], &device);

        let _ = model.forward(x);
    }
}
