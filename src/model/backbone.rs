//! ConvNeXt feature extractor
//!
//! A ConvNeXt backbone built from Burn primitives:
//! - Patchify stem (4x4 stride-4 convolution + channel LayerNorm)
//! - Four stages of ConvNeXt blocks, separated by 2x2 stride-2 downsampling
//! - Global average pooling and a final LayerNorm
//!
//! The classification projection is not part of the backbone; it lives in
//! [`ClassificationHead`](super::head::ClassificationHead).

use burn::{
    config::Config,
    module::{Module, Param},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        Gelu, LayerNorm, LayerNormConfig, Linear, LinearConfig, PaddingConfig2d,
    },
    tensor::{backend::Backend, Tensor},
};

/// Anything that turns an image batch into a flat feature vector per image
pub trait FeatureExtractor<B: Backend>: Module<B> {
    /// Width of the produced feature vectors
    fn feature_dim(&self) -> usize;

    /// `[batch, 3, H, W]` images to `[batch, feature_dim]` features
    fn extract(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;
}

/// Configuration for the ConvNeXt backbone
#[derive(Config, Debug)]
pub struct ConvNextConfig {
    /// Number of blocks per stage
    #[config(default = "vec![3, 3, 9, 3]")]
    pub depths: Vec<usize>,

    /// Channel width per stage
    #[config(default = "vec![96, 192, 384, 768]")]
    pub dims: Vec<usize>,

    /// Initial value of the per-channel layer scale
    #[config(default = "1e-6")]
    pub layer_scale_init: f64,

    #[config(default = "3")]
    pub in_channels: usize,
}

impl ConvNextConfig {
    /// ConvNeXt-Tiny (feature width 768)
    pub fn tiny() -> Self {
        Self::new()
    }

    /// Feature width produced by this configuration
    pub fn feature_dim(&self) -> usize {
        let stages = self.depths.len().min(self.dims.len());
        if stages == 0 {
            self.in_channels
        } else {
            self.dims[stages - 1]
        }
    }

    /// Build the backbone. Stages are taken pairwise from `depths` and `dims`.
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvNext<B> {
        let first_dim = self.dims.first().copied().unwrap_or(self.in_channels);

        let stem_conv = Conv2dConfig::new([self.in_channels, first_dim], [4, 4])
            .with_stride([4, 4])
            .init(device);
        let stem_norm = LayerNorm2d::new(first_dim, device);

        let mut stages = Vec::new();
        let mut prev_dim = first_dim;
        for (index, (&depth, &dim)) in self.depths.iter().zip(self.dims.iter()).enumerate() {
            let downsample = (index > 0).then(|| Downsample::new(prev_dim, dim, device));
            let blocks = (0..depth)
                .map(|_| ConvNextBlock::new(dim, self.layer_scale_init, device))
                .collect();
            stages.push(Stage { downsample, blocks });
            prev_dim = dim;
        }

        ConvNext {
            stem_conv,
            stem_norm,
            stages,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            norm: LayerNormConfig::new(prev_dim).init(device),
            feature_dim: prev_dim,
        }
    }
}

/// LayerNorm over the channel dimension of an NCHW tensor
#[derive(Module, Debug)]
pub struct LayerNorm2d<B: Backend> {
    norm: LayerNorm<B>,
}

impl<B: Backend> LayerNorm2d<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        Self {
            norm: LayerNormConfig::new(channels).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = x.permute([0, 2, 3, 1]);
        self.norm.forward(x).permute([0, 3, 1, 2])
    }
}

/// Channel norm followed by a 2x2 stride-2 convolution
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    norm: LayerNorm2d<B>,
    conv: Conv2d<B>,
}

impl<B: Backend> Downsample<B> {
    pub fn new(in_dim: usize, out_dim: usize, device: &B::Device) -> Self {
        Self {
            norm: LayerNorm2d::new(in_dim, device),
            conv: Conv2dConfig::new([in_dim, out_dim], [2, 2])
                .with_stride([2, 2])
                .init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.conv.forward(self.norm.forward(x))
    }
}

/// ConvNeXt block: depthwise 7x7 conv, LayerNorm, inverted bottleneck MLP,
/// layer scale and a residual connection
#[derive(Module, Debug)]
pub struct ConvNextBlock<B: Backend> {
    dwconv: Conv2d<B>,
    norm: LayerNorm<B>,
    pwconv1: Linear<B>,
    act: Gelu,
    pwconv2: Linear<B>,
    gamma: Param<Tensor<B, 1>>,
}

impl<B: Backend> ConvNextBlock<B> {
    pub fn new(dim: usize, layer_scale_init: f64, device: &B::Device) -> Self {
        let dwconv = Conv2dConfig::new([dim, dim], [7, 7])
            .with_padding(PaddingConfig2d::Explicit(3, 3))
            .with_groups(dim)
            .init(device);

        Self {
            dwconv,
            norm: LayerNormConfig::new(dim).init(device),
            pwconv1: LinearConfig::new(dim, 4 * dim).init(device),
            act: Gelu::new(),
            pwconv2: LinearConfig::new(4 * dim, dim).init(device),
            gamma: Param::from_tensor(Tensor::full([dim], layer_scale_init, device)),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.dwconv.forward(input.clone());

        // [B, C, H, W] -> [B, H, W, C]
        let x = x.permute([0, 2, 3, 1]);
        let x = self.norm.forward(x);
        let x = self.pwconv1.forward(x);
        let x = self.act.forward(x);
        let x = self.pwconv2.forward(x);
        let x = x * self.gamma.val().unsqueeze::<4>();
        let x = x.permute([0, 3, 1, 2]);

        input + x
    }
}

/// Optional downsampling followed by a run of blocks
#[derive(Module, Debug)]
pub struct Stage<B: Backend> {
    downsample: Option<Downsample<B>>,
    blocks: Vec<ConvNextBlock<B>>,
}

impl<B: Backend> Stage<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = match &self.downsample {
            Some(downsample) => downsample.forward(x),
            None => x,
        };
        for block in &self.blocks {
            x = block.forward(x);
        }
        x
    }

    pub fn depth(&self) -> usize {
        self.blocks.len()
    }
}

/// ConvNeXt backbone without its classification layer
#[derive(Module, Debug)]
pub struct ConvNext<B: Backend> {
    stem_conv: Conv2d<B>,
    stem_norm: LayerNorm2d<B>,
    stages: Vec<Stage<B>>,
    pool: AdaptiveAvgPool2d,
    norm: LayerNorm<B>,
    feature_dim: usize,
}

impl<B: Backend> ConvNext<B> {
    /// Blocks per stage, in order
    pub fn stage_depths(&self) -> Vec<usize> {
        self.stages.iter().map(Stage::depth).collect()
    }
}

impl<B: Backend> FeatureExtractor<B> for ConvNext<B> {
    fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    fn extract(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = self.stem_norm.forward(self.stem_conv.forward(images));
        for stage in &self.stages {
            x = stage.forward(x);
        }

        // [B, C, H, W] -> [B, C, 1, 1] -> [B, C]
        let x = self.pool.forward(x);
        let [batch_size, channels, _, _] = x.dims();
        let x = x.reshape([batch_size, channels]);

        self.norm.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn small_config() -> ConvNextConfig {
        ConvNextConfig::new()
            .with_depths(vec![1, 1, 1, 1])
            .with_dims(vec![8, 16, 32, 64])
    }

    #[test]
    fn test_tiny_preset() {
        let config = ConvNextConfig::tiny();
        assert_eq!(config.depths, vec![3, 3, 9, 3]);
        assert_eq!(config.feature_dim(), 768);
    }

    #[test]
    fn test_feature_shape() {
        let device = Default::default();
        let backbone = small_config().init::<TestBackend>(&device);

        let images = Tensor::<TestBackend, 4>::zeros([2, 3, 64, 64], &device);
        let features = backbone.extract(images);

        assert_eq!(features.dims(), [2, 64]);
        assert_eq!(backbone.feature_dim(), 64);
        assert_eq!(backbone.stage_depths(), vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_block_preserves_shape() {
        let device = Default::default();
        let block = ConvNextBlock::<TestBackend>::new(8, 1e-6, &device);
        let x = Tensor::<TestBackend, 4>::ones([1, 8, 5, 5], &device);
        assert_eq!(block.forward(x).dims(), [1, 8, 5, 5]);
    }

    #[test]
    fn test_mismatched_lengths_use_shortest() {
        let config = ConvNextConfig::new()
            .with_depths(vec![1, 1])
            .with_dims(vec![8, 16, 32]);
        assert_eq!(config.feature_dim(), 16);

        let backbone = config.init::<TestBackend>(&Default::default());
        assert_eq!(backbone.feature_dim(), 16);
        assert_eq!(backbone.stage_depths().len(), 2);
    }
}
