// ============================================================
// Layer 5 — Vision Encoder
// ============================================================
// Conv4: four conv/relu/maxpool blocks over 64x64 RGB inputs,
// flattened to a fixed-size feature vector. Both datasets ship
// their contexts as [n_img, 3, 64, 64] blocks, so one encoder
// serves everywhere a model needs image features.
//
// Stateless apart from its weights: cloning a model holding a
// Conv4 yields a genuinely independent snapshot, which the
// best-checkpoint bookkeeping relies on.
//
// Treated as an opaque differentiable block by the rest of the
// system; only the input/output shapes matter at the boundary.

use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        PaddingConfig2d,
    },
    prelude::*,
    tensor::activation::relu,
};

/// Input images are 64x64 RGB; four 2x poolings leave a 4x4 map.
const IMG_SIZE: usize = 64;

#[derive(Config, Debug)]
pub struct Conv4Config {
    #[config(default = 32)]
    pub channels: usize,
}

impl Conv4Config {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Conv4<B> {
        let block = |c_in: usize| ConvBlock {
            conv: Conv2dConfig::new([c_in, self.channels], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        };
        Conv4 {
            block1: block(3),
            block2: block(self.channels),
            block3: block(self.channels),
            block4: block(self.channels),
            feat_size: self.channels * (IMG_SIZE / 16) * (IMG_SIZE / 16),
        }
    }
}

#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    pool: MaxPool2d,
}

impl<B: Backend> ConvBlock<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.pool.forward(relu(self.conv.forward(x)))
    }
}

#[derive(Module, Debug)]
pub struct Conv4<B: Backend> {
    block1: ConvBlock<B>,
    block2: ConvBlock<B>,
    block3: ConvBlock<B>,
    block4: ConvBlock<B>,
    feat_size: usize,
}

impl<B: Backend> Conv4<B> {
    /// Feature dimensionality of the flattened output.
    pub fn feat_size(&self) -> usize {
        self.feat_size
    }

    /// [batch, 3, 64, 64] -> [batch, feat_size]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let batch = images.dims()[0];
        let x = self.block1.forward(images);
        let x = self.block2.forward(x);
        let x = self.block3.forward(x);
        let x = self.block4.forward(x);
        x.reshape([batch, self.feat_size])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestBackend = burn::backend::NdArray;

    #[test]
    fn test_output_shape() {
        let device = Default::default();
        let conv: Conv4<TestBackend> = Conv4Config::new().init(&device);
        let images = Tensor::zeros([2, 3, 64, 64], &device);
        let feats = conv.forward(images);
        assert_eq!(feats.dims(), [2, conv.feat_size()]);
        assert_eq!(conv.feat_size(), 512);
    }
}
