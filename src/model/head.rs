//! Replaceable classification head

use burn::{
    module::{Module, Param},
    nn::{Linear, LinearConfig},
    tensor::{backend::Backend, Tensor},
};

/// Linear projection from backbone features to class logits
#[derive(Module, Debug)]
pub struct ClassificationHead<B: Backend> {
    linear: Linear<B>,
}

impl<B: Backend> ClassificationHead<B> {
    /// Freshly initialized head
    pub fn new(feature_dim: usize, num_classes: usize, device: &B::Device) -> Self {
        Self {
            linear: LinearConfig::new(feature_dim, num_classes).init(device),
        }
    }

    /// Head with explicit parameters.
    ///
    /// `weight` has shape `[feature_dim, num_classes]`, `bias` `[num_classes]`.
    pub fn from_weights(weight: Tensor<B, 2>, bias: Option<Tensor<B, 1>>) -> Self {
        Self {
            linear: Linear {
                weight: Param::from_tensor(weight),
                bias: bias.map(Param::from_tensor),
            },
        }
    }

    /// Unnormalized class scores, `[batch, feature_dim]` to `[batch, num_classes]`
    pub fn forward(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        self.linear.forward(features)
    }

    pub fn feature_dim(&self) -> usize {
        self.linear.weight.dims()[0]
    }

    pub fn num_classes(&self) -> usize {
        self.linear.weight.dims()[1]
    }

    /// Device holding the head parameters
    pub fn device(&self) -> B::Device {
        self.linear.weight.device()
    }
}
