//! Video Classifier Architecture
//!
//! A small 2D CNN applied to video clips in one of two layouts:
//!
//! - **super image** (`super_img_rows > 0`): the frames of a clip are tiled
//!   row-major into one large image and classified in a single pass
//! - **temporal pooling** (`super_img_rows == 0`): every frame goes through the
//!   backbone on its own and the frame features are averaged
//!
//! The pooled feature feeds a projection head (embedding for the contrastive
//! terms) and one or more classifier branches.

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Tensor},
};

/// Configuration for the VideoClassifier model
#[derive(Config, Debug)]
pub struct VideoClassifierConfig {
    pub num_classes: usize,

    /// Channels per frame (3 for RGB, 10 for stacked flow)
    #[config(default = "3")]
    pub in_channels: usize,

    /// Frames per row of the super image, 0 for temporal pooling
    #[config(default = "3")]
    pub super_img_rows: usize,

    /// Base number of convolutional filters
    #[config(default = "8")]
    pub base_filters: usize,

    #[config(default = "128")]
    pub embedding_dim: usize,

    /// Classifier heads sharing the backbone
    #[config(default = "1")]
    pub num_branches: usize,

    #[config(default = "0.0")]
    pub dropout_rate: f64,
}

impl VideoClassifierConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> VideoClassifier<B> {
        VideoClassifier::new(self, device)
    }
}

/// Conv2d, ReLU and a 2x2 MaxPool
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv: Conv2d<B>,
    pub relu: Relu,
    pub pool: MaxPool2d,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Same)
            .init(device);
        Self {
            conv,
            relu: Relu::new(),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.relu.forward(x);
        self.pool.forward(x)
    }
}

/// Everything one forward pass produces
#[derive(Debug, Clone)]
pub struct ModelOutput<B: Backend> {
    /// Mean of the branch logits, `[N, K]`
    pub logits: Tensor<B, 2>,
    /// Logits of every classifier branch
    pub branches: Vec<Tensor<B, 2>>,
    /// Projection of the pooled feature, `[N, E]`
    pub embedding: Tensor<B, 2>,
}

#[derive(Module, Debug)]
pub struct VideoClassifier<B: Backend> {
    pub block1: ConvBlock<B>,
    pub block2: ConvBlock<B>,
    pub global_pool: AdaptiveAvgPool2d,
    pub projection: Linear<B>,
    pub heads: Vec<Linear<B>>,
    pub dropout: Dropout,
    super_img_rows: usize,
    num_classes: usize,
}

impl<B: Backend> VideoClassifier<B> {
    pub fn new(config: &VideoClassifierConfig, device: &B::Device) -> Self {
        let base = config.base_filters;
        let feature_dim = base * 2;
        let heads = (0..config.num_branches.max(1))
            .map(|_| LinearConfig::new(feature_dim, config.num_classes).init(device))
            .collect();

        Self {
            block1: ConvBlock::new(config.in_channels, base, device),
            block2: ConvBlock::new(base, feature_dim, device),
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            projection: LinearConfig::new(feature_dim, config.embedding_dim).init(device),
            heads,
            dropout: DropoutConfig::new(config.dropout_rate).init(),
            super_img_rows: config.super_img_rows,
            num_classes: config.num_classes,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn num_branches(&self) -> usize {
        self.heads.len()
    }

    /// Tile `[N, C, T, H, W]` into `[N, C, rows*H, cols*W]`, zero-padding missing frames
    pub fn super_image(&self, x: Tensor<B, 5>) -> Tensor<B, 4> {
        let [n, c, t, h, w] = x.dims();
        let rows = self.super_img_rows.max(1);
        let cols = t.div_ceil(rows);
        let x = if rows * cols > t {
            let pad = Tensor::zeros([n, c, rows * cols - t, h, w], &x.device());
            Tensor::cat(vec![x, pad], 2)
        } else {
            x
        };
        let x: Tensor<B, 6> = x.reshape([n, c, rows, cols, h, w]);
        x.swap_dims(3, 4).reshape([n, c, rows * h, cols * w])
    }

    /// Pooled backbone feature of a batch of images, `[N, F]`
    fn features(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.block1.forward(x);
        let x = self.block2.forward(x);
        let x = self.global_pool.forward(x);
        let [n, f, _, _] = x.dims();
        x.reshape([n, f])
    }

    fn video_features(&self, x: Tensor<B, 5>) -> Tensor<B, 2> {
        if self.super_img_rows > 0 {
            return self.features(self.super_image(x));
        }
        let [n, c, t, h, w] = x.dims();
        let frames = x.swap_dims(1, 2).reshape([n * t, c, h, w]);
        let per_frame = self.features(frames);
        let f = per_frame.dims()[1];
        per_frame.reshape([n, t, f]).mean_dim(1).reshape([n, f])
    }

    /// Forward pass on a `[N, C, T, H, W]` clip batch
    pub fn forward(&self, x: Tensor<B, 5>) -> ModelOutput<B> {
        let feature = self.video_features(x);
        let embedding = self.projection.forward(feature.clone());

        let hidden = self.dropout.forward(feature);
        let branches: Vec<Tensor<B, 2>> = self
            .heads
            .iter()
            .map(|head| head.forward(hidden.clone()))
            .collect();
        let logits = if branches.len() == 1 {
            branches[0].clone()
        } else {
            let count = branches.len() as f64;
            branches
                .iter()
                .skip(1)
                .fold(branches[0].clone(), |acc, b| acc + b.clone())
                / count
        };

        ModelOutput {
            logits,
            branches,
            embedding,
        }
    }

    /// Take the backbone and projection of `donor`, keeping this model's heads
    pub fn with_backbone_of(self, donor: Self) -> Self {
        Self {
            block1: donor.block1,
            block2: donor.block2,
            projection: donor.projection,
            ..self
        }
    }
}
