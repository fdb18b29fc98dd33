//! Convolutional VAE with a log-cosh reconstruction objective.
//!
//! The encoder halves spatial resolution once per entry of the hidden-dimension
//! schedule until a `2x2` map remains; the decoder mirrors it with transposed
//! convolutions. Every stage is conv -> batch norm -> [`FusedLeakyRelu`].

use burn::module::Param;
use burn::nn::conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Initializer, Linear, LinearConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation;
use burn::tensor::Distribution;

use crate::loss::{vae_loss, VaeLoss};

/// Spatial side length of the encoder's final feature map.
const BOTTLENECK_SIDE: usize = 2;
const LEAKY_SLOPE: f64 = 0.2;

fn conv_initializer() -> Initializer {
    Initializer::KaimingUniform {
        gain: 0.1,
        fan_out_only: false,
    }
}

/// Architecture and objective weights for [`LogCoshVae`].
#[derive(Config, Debug)]
pub struct VaeConfig {
    /// Width of the latent Gaussian.
    pub latent_dim: usize,
    /// Channel width of the first encoder stage.
    pub number_filters: usize,
    #[config(default = 3)]
    pub in_channels: usize,
    /// Number of width-expanding stages before the final latent-width stage.
    #[config(default = 5)]
    pub num_stages: usize,
    /// Transition point between the quadratic and linear regimes of log-cosh.
    #[config(default = 10.0)]
    pub alpha: f64,
    #[config(default = 1.0)]
    pub beta: f64,
    #[config(default = 1.0)]
    pub kld_weight: f64,
}

impl VaeConfig {
    /// Channel widths per encoder stage: `min(number_filters * 2^k, latent_dim)`
    /// for each stage, followed by one stage of exactly `latent_dim`.
    pub fn hidden_dims(&self) -> Vec<usize> {
        let mut dims: Vec<usize> = (0..self.num_stages)
            .map(|k| {
                self.number_filters
                    .saturating_mul(1usize << k.min(usize::BITS as usize - 1))
                    .min(self.latent_dim)
            })
            .collect();
        dims.push(self.latent_dim);
        dims
    }

    /// Square input resolution the network expects.
    pub fn resolution(&self) -> usize {
        BOTTLENECK_SIDE << self.hidden_dims().len()
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> LogCoshVae<B> {
        let hidden = self.hidden_dims();
        let bottleneck = *hidden.last().unwrap_or(&self.latent_dim);
        let flat = bottleneck * BOTTLENECK_SIDE * BOTTLENECK_SIDE;

        let mut in_channels = self.in_channels;
        let mut encoder = Vec::with_capacity(hidden.len());
        for &h_dim in &hidden {
            encoder.push(DownBlock::new(in_channels, h_dim, device));
            in_channels = h_dim;
        }

        let reversed: Vec<usize> = hidden.iter().rev().copied().collect();
        let decoder = reversed
            .windows(2)
            .map(|pair| UpBlock::new(pair[0], pair[1], device))
            .collect();
        let head_channels = hidden[0];

        LogCoshVae {
            encoder,
            fc_mu: LinearConfig::new(flat, self.latent_dim).init(device),
            fc_var: LinearConfig::new(flat, self.latent_dim).init(device),
            decoder_input: LinearConfig::new(self.latent_dim, flat).init(device),
            decoder,
            final_block: UpBlock::new(head_channels, head_channels, device),
            to_image: Conv2dConfig::new([head_channels, self.in_channels], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_initializer(conv_initializer())
                .init(device),
            bottleneck_channels: bottleneck,
            alpha: self.alpha,
            beta: self.beta,
            kld_weight: self.kld_weight,
        }
    }
}

/// Leaky ReLU with a learned per-channel bias, rescaled by `sqrt(2)` to keep
/// activation variance roughly constant across stages.
#[derive(Module, Debug)]
pub struct FusedLeakyRelu<B: Backend> {
    bias: Param<Tensor<B, 1>>,
}

impl<B: Backend> FusedLeakyRelu<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        Self {
            bias: Param::from_tensor(Tensor::zeros([channels], device)),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [b, c, h, w] = x.dims();
        let bias = self.bias.val().reshape([1, c, 1, 1]).expand([b, c, h, w]);
        activation::leaky_relu(x + bias, LEAKY_SLOPE).mul_scalar(std::f64::consts::SQRT_2)
    }
}

#[derive(Module, Debug)]
pub struct DownBlock<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
    act: FusedLeakyRelu<B>,
}

impl<B: Backend> DownBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            conv: Conv2dConfig::new([in_channels, out_channels], [3, 3])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_initializer(conv_initializer())
                .init(device),
            norm: BatchNormConfig::new(out_channels).init(device),
            act: FusedLeakyRelu::new(out_channels, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.norm.forward(x);
        self.act.forward(x)
    }
}

/// Doubles spatial resolution with a `4x4`, stride-2 transposed convolution.
#[derive(Module, Debug)]
pub struct UpBlock<B: Backend> {
    upsample: ConvTranspose2d<B>,
    norm: BatchNorm<B, 2>,
    act: FusedLeakyRelu<B>,
}

impl<B: Backend> UpBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            upsample: ConvTranspose2dConfig::new([in_channels, out_channels], [4, 4])
                .with_stride([2, 2])
                .with_padding([1, 1])
                .with_initializer(conv_initializer())
                .init(device),
            norm: BatchNormConfig::new(out_channels).init(device),
            act: FusedLeakyRelu::new(out_channels, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.upsample.forward(x);
        let x = self.norm.forward(x);
        self.act.forward(x)
    }
}

/// Result of a full encode / sample / decode pass.
#[derive(Debug, Clone)]
pub struct VaeOutput<B: Backend> {
    pub reconstruction: Tensor<B, 4>,
    pub mu: Tensor<B, 2>,
    pub log_var: Tensor<B, 2>,
}

#[derive(Module, Debug)]
pub struct LogCoshVae<B: Backend> {
    encoder: Vec<DownBlock<B>>,
    fc_mu: Linear<B>,
    fc_var: Linear<B>,
    decoder_input: Linear<B>,
    decoder: Vec<UpBlock<B>>,
    final_block: UpBlock<B>,
    to_image: Conv2d<B>,
    bottleneck_channels: usize,
    alpha: f64,
    beta: f64,
    kld_weight: f64,
}

impl<B: Backend> LogCoshVae<B> {
    /// Maps images `[N, C, H, W]` to the posterior mean and log-variance, both `[N, latent_dim]`.
    pub fn encode(&self, x: Tensor<B, 4>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let mut y = x;
        for block in &self.encoder {
            y = block.forward(y);
        }
        let y: Tensor<B, 2> = y.flatten(1, 3);
        (self.fc_mu.forward(y.clone()), self.fc_var.forward(y))
    }

    /// `z = mu + exp(0.5 * log_var) * eps` with fresh standard-normal noise.
    pub fn reparameterize(&self, mu: Tensor<B, 2>, log_var: Tensor<B, 2>) -> Tensor<B, 2> {
        let std = log_var.mul_scalar(0.5).exp();
        let eps = Tensor::random_like(&std, Distribution::Normal(0.0, 1.0));
        mu + eps * std
    }

    /// Maps latents `[N, latent_dim]` to images in `[-1, 1]`.
    pub fn decode(&self, z: Tensor<B, 2>) -> Tensor<B, 4> {
        let batch_size = z.dims()[0];
        let mut y = self.decoder_input.forward(z).reshape([
            batch_size,
            self.bottleneck_channels,
            BOTTLENECK_SIDE,
            BOTTLENECK_SIDE,
        ]);
        for block in &self.decoder {
            y = block.forward(y);
        }
        let y = self.final_block.forward(y);
        activation::tanh(self.to_image.forward(y))
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> VaeOutput<B> {
        let (mu, log_var) = self.encode(x);
        let z = self.reparameterize(mu.clone(), log_var.clone());
        VaeOutput {
            reconstruction: self.decode(z),
            mu,
            log_var,
        }
    }

    pub fn loss(&self, real: Tensor<B, 4>, output: &VaeOutput<B>) -> VaeLoss<B> {
        vae_loss(
            real,
            output.reconstruction.clone(),
            output.mu.clone(),
            output.log_var.clone(),
            self.alpha,
            self.beta,
            self.kld_weight,
        )
    }
}
