use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    prelude::*,
};

/// Two conv(3x3, pad 1) -> batch norm -> relu stages. Spatial size is preserved.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv1: Conv2d<B>,
    norm1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    norm2: BatchNorm<B, 2>,
    relu: Relu,
}

#[derive(Config, Debug)]
pub struct ConvBlockConfig {
    pub in_channels: usize,
    pub out_channels: usize,
}

impl ConvBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvBlock<B> {
        ConvBlock {
            conv1: Conv2dConfig::new([self.in_channels, self.out_channels], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device),
            norm1: BatchNormConfig::new(self.out_channels).init(device),
            conv2: Conv2dConfig::new([self.out_channels, self.out_channels], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device),
            norm2: BatchNormConfig::new(self.out_channels).init(device),
            relu: Relu::new(),
        }
    }
}

impl<B: Backend> ConvBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv1.forward(x);
        let x = self.norm1.forward(x);
        let x = self.relu.forward(x);

        let x = self.conv2.forward(x);
        let x = self.norm2.forward(x);
        self.relu.forward(x)
    }
}

/// ConvBlock followed by a 2x2 max-pool. Returns the full-resolution feature
/// map (the skip connection) together with the pooled, half-resolution map.
#[derive(Module, Debug)]
pub struct EncoderStage<B: Backend> {
    conv: ConvBlock<B>,
    pool: MaxPool2d,
}

#[derive(Config, Debug)]
pub struct EncoderStageConfig {
    pub in_channels: usize,
    pub out_channels: usize,
}

impl EncoderStageConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> EncoderStage<B> {
        EncoderStage {
            conv: ConvBlockConfig::new(self.in_channels, self.out_channels).init(device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }
}

impl<B: Backend> EncoderStage<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let skip = self.conv.forward(x);
        let pooled = self.pool.forward(skip.clone());

        (skip, pooled)
    }
}

/// Learned 2x upsampling (transpose conv, kernel 2, stride 2), channel-wise
/// concatenation with the paired encoder skip, then a fusing ConvBlock.
/// The fusing block therefore reads `out_channels + out_channels` channels.
#[derive(Module, Debug)]
pub struct DecoderStage<B: Backend> {
    up: ConvTranspose2d<B>,
    conv: ConvBlock<B>,
}

#[derive(Config, Debug)]
pub struct DecoderStageConfig {
    pub in_channels: usize,
    pub out_channels: usize,
}

impl DecoderStageConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> DecoderStage<B> {
        DecoderStage {
            up: ConvTranspose2dConfig::new([self.in_channels, self.out_channels], [2, 2])
                .with_stride([2, 2])
                .init(device),
            conv: ConvBlockConfig::new(self.out_channels * 2, self.out_channels).init(device),
        }
    }
}

impl<B: Backend> DecoderStage<B> {
    pub fn forward(&self, x: Tensor<B, 4>, skip: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.up.forward(x);
        let x = Tensor::cat(vec![x, skip], 1);

        self.conv.forward(x)
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
    fn conv_block_preserves_spatial_size() {
        let device = device();
        let block = ConvBlockConfig::new(3, 32).init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::zeros([2, 3, 16, 16], &device);

        let y = block.forward(x);

        assert_eq!(y.dims(), [2, 32, 16, 16]);
    }

    #[test]
    fn encoder_stage_halves_pooled_map() {
        let device = device();
        let stage = EncoderStageConfig::new(3, 32).init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::zeros([1, 3, 32, 32], &device);

        let (skip, pooled) = stage.forward(x);

        assert_eq!(skip.dims(), [1, 32, 32, 32]);
        assert_eq!(pooled.dims(), [1, 32, 16, 16]);
    }

    #[test]
    fn decoder_stage_restores_skip_resolution() {
        let device = device();
        let stage = DecoderStageConfig::new(64, 32).init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::zeros([1, 64, 8, 8], &device);
        let skip = Tensor::<TestBackend, 4>::zeros([1, 32, 16, 16], &device);

        let y = stage.forward(x, skip);

        assert_eq!(y.dims(), [1, 32, 16, 16]);
    }
}
