use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use burn::{
    data::network::downloader,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d,
    },
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkGzFileRecorder, Recorder},
    tensor::activation::{sigmoid, silu},
};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{self, ClassifierError};

const RECORD_EXTENSION: &str = ".mpk.gz";
const PRETRAINED_BASE_URL: &str =
    "https://github.com/lukemelas/EfficientNet-PyTorch/releases/download/1.0";
const STEM_CHANNELS: usize = 32;
const HEAD_CHANNELS: usize = 1280;
const SE_RATIO: f64 = 0.25;
const CHANNEL_DIVISOR: usize = 8;

/// EfficientNet variants, named as in their published checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelName {
    #[serde(rename = "efficientnet-b0")]
    B0,
    #[serde(rename = "efficientnet-b1")]
    B1,
    #[serde(rename = "efficientnet-b2")]
    B2,
    #[serde(rename = "efficientnet-b3")]
    B3,
    #[serde(rename = "efficientnet-b4")]
    B4,
    #[serde(rename = "efficientnet-b5")]
    B5,
    #[serde(rename = "efficientnet-b6")]
    B6,
    #[serde(rename = "efficientnet-b7")]
    B7,
}

impl ModelName {
    pub const ALL: [ModelName; 8] = [
        ModelName::B0,
        ModelName::B1,
        ModelName::B2,
        ModelName::B3,
        ModelName::B4,
        ModelName::B5,
        ModelName::B6,
        ModelName::B7,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelName::B0 => "efficientnet-b0",
            ModelName::B1 => "efficientnet-b1",
            ModelName::B2 => "efficientnet-b2",
            ModelName::B3 => "efficientnet-b3",
            ModelName::B4 => "efficientnet-b4",
            ModelName::B5 => "efficientnet-b5",
            ModelName::B6 => "efficientnet-b6",
            ModelName::B7 => "efficientnet-b7",
        }
    }

    /// (width coefficient, depth coefficient, input resolution, dropout rate)
    fn params(&self) -> (f64, f64, u32, f64) {
        match self {
            ModelName::B0 => (1.0, 1.0, 224, 0.2),
            ModelName::B1 => (1.0, 1.1, 240, 0.2),
            ModelName::B2 => (1.1, 1.2, 260, 0.3),
            ModelName::B3 => (1.2, 1.4, 300, 0.3),
            ModelName::B4 => (1.4, 1.8, 380, 0.4),
            ModelName::B5 => (1.6, 2.2, 456, 0.4),
            ModelName::B6 => (1.8, 2.6, 528, 0.5),
            ModelName::B7 => (2.0, 3.1, 600, 0.5),
        }
    }

    pub fn width_coefficient(&self) -> f64 {
        self.params().0
    }

    pub fn depth_coefficient(&self) -> f64 {
        self.params().1
    }

    /// Square input resolution the variant was trained at.
    pub fn image_size(&self) -> u32 {
        self.params().2
    }

    pub fn dropout_rate(&self) -> f64 {
        self.params().3
    }

    /// Width of the pooled feature vector fed to the classifier.
    pub fn num_features(&self) -> usize {
        round_filters(HEAD_CHANNELS, self.width_coefficient())
    }

    /// ImageNet weights published for the `efficientnet_pytorch` package.
    pub fn pretrained_url(&self) -> String {
        let file = match self {
            ModelName::B0 => "efficientnet-b0-355c32eb.pth",
            ModelName::B1 => "efficientnet-b1-f1951068.pth",
            ModelName::B2 => "efficientnet-b2-8bb594d6.pth",
            ModelName::B3 => "efficientnet-b3-5fb5a3c3.pth",
            ModelName::B4 => "efficientnet-b4-6ed6700e.pth",
            ModelName::B5 => "efficientnet-b5-b6417697.pth",
            ModelName::B6 => "efficientnet-b6-c76e70fd.pth",
            ModelName::B7 => "efficientnet-b7-dcc49843.pth",
        };
        format!("{PRETRAINED_BASE_URL}/{file}")
    }
}

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelName {
    type Err = ClassifierError;

    fn from_str(name: &str) -> error::Result<Self> {
        ModelName::ALL
            .into_iter()
            .find(|model| model.as_str() == name)
            .ok_or_else(|| ClassifierError::UnknownModel(name.to_string()))
    }
}

/// Scales a channel count by the width coefficient, rounding to a multiple of 8.
fn round_filters(filters: usize, width: f64) -> usize {
    let scaled = filters as f64 * width;
    let divisor = CHANNEL_DIVISOR as f64;
    let rounded = ((scaled + divisor / 2.0) / divisor).floor() * divisor;
    let mut rounded = rounded.max(divisor);
    if rounded < 0.9 * scaled {
        rounded += divisor;
    }
    rounded as usize
}

fn round_repeats(repeats: usize, depth: f64) -> usize {
    (repeats as f64 * depth).ceil() as usize
}

struct StageArgs {
    repeats: usize,
    kernel: usize,
    stride: usize,
    expand_ratio: usize,
    input: usize,
    output: usize,
}

const fn stage(
    repeats: usize,
    kernel: usize,
    stride: usize,
    expand_ratio: usize,
    input: usize,
    output: usize,
) -> StageArgs {
    StageArgs {
        repeats,
        kernel,
        stride,
        expand_ratio,
        input,
        output,
    }
}

const STAGES: [StageArgs; 7] = [
    stage(1, 3, 1, 1, 32, 16),
    stage(2, 3, 2, 6, 16, 24),
    stage(2, 5, 2, 6, 24, 40),
    stage(3, 3, 2, 6, 40, 80),
    stage(3, 5, 1, 6, 80, 112),
    stage(4, 5, 2, 6, 112, 192),
    stage(1, 3, 1, 6, 192, 320),
];

#[derive(Config, Debug)]
pub struct EfficientNetConfig {
    pub model_name: ModelName,
    pub num_classes: usize,
    /// Overrides the variant's default dropout before the classifier.
    #[config(default = "None")]
    pub dropout: Option<f64>,
    #[config(default = 1e-3)]
    pub batch_norm_epsilon: f64,
    #[config(default = 0.01)]
    pub batch_norm_momentum: f64,
}

impl EfficientNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> EfficientNet<B> {
        let width = self.model_name.width_coefficient();
        let depth = self.model_name.depth_coefficient();

        let stem_channels = round_filters(STEM_CHANNELS, width);
        let stem = self.conv_bn([3, stem_channels], 3, 2, 1, device);

        let mut blocks = Vec::new();
        for args in &STAGES {
            let input = round_filters(args.input, width);
            let output = round_filters(args.output, width);
            for repeat in 0..round_repeats(args.repeats, depth) {
                let (block_input, stride) = if repeat == 0 {
                    (input, args.stride)
                } else {
                    (output, 1)
                };
                blocks.push(self.mb_conv(block_input, output, args, stride, device));
            }
        }

        let head_channels = self.model_name.num_features();
        let last_channels = round_filters(STAGES[STAGES.len() - 1].output, width);
        let head = self.conv_bn([last_channels, head_channels], 1, 1, 1, device);

        let dropout = self
            .dropout
            .unwrap_or_else(|| self.model_name.dropout_rate());

        EfficientNet {
            backbone: Backbone {
                stem,
                blocks,
                head,
                pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            },
            dropout: DropoutConfig::new(dropout).init(),
            classifier: LinearConfig::new(head_channels, self.num_classes).init(device),
        }
    }

    fn conv_bn<B: Backend>(
        &self,
        channels: [usize; 2],
        kernel: usize,
        stride: usize,
        groups: usize,
        device: &B::Device,
    ) -> ConvBn<B> {
        ConvBn {
            conv: Conv2dConfig::new(channels, [kernel, kernel])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Valid)
                .with_groups(groups)
                .with_bias(false)
                .init(device),
            norm: BatchNormConfig::new(channels[1])
                .with_epsilon(self.batch_norm_epsilon)
                .with_momentum(self.batch_norm_momentum)
                .init(device),
            kernel,
            stride,
        }
    }

    fn mb_conv<B: Backend>(
        &self,
        input: usize,
        output: usize,
        args: &StageArgs,
        stride: usize,
        device: &B::Device,
    ) -> MBConv<B> {
        let expanded = input * args.expand_ratio;
        let expand = (args.expand_ratio != 1)
            .then(|| self.conv_bn([input, expanded], 1, 1, 1, device));
        let squeezed = ((input as f64 * SE_RATIO) as usize).max(1);

        MBConv {
            expand,
            depthwise: self.conv_bn([expanded, expanded], args.kernel, stride, expanded, device),
            excitation: SqueezeExcitation {
                pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
                reduce: Conv2dConfig::new([expanded, squeezed], [1, 1]).init(device),
                expand: Conv2dConfig::new([squeezed, expanded], [1, 1]).init(device),
            },
            project: self.conv_bn([expanded, output], 1, 1, 1, device),
        }
    }
}

/// Convolution followed by batch norm; activation is applied by the caller.
///
/// Inputs are zero-padded so the output has `ceil(size / stride)` rows and
/// columns, with any odd padding pixel on the bottom and right.
#[derive(Module, Debug)]
pub struct ConvBn<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
    kernel: usize,
    stride: usize,
}

impl<B: Backend> ConvBn<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, height, width] = x.dims();
        let (top, bottom) = same_padding(height, self.kernel, self.stride);
        let (left, right) = same_padding(width, self.kernel, self.stride);
        let x = pad_zeros(x, 2, top, bottom);
        let x = pad_zeros(x, 3, left, right);
        self.norm.forward(self.conv.forward(x))
    }
}

/// Padding before and after one spatial axis of length `size`.
fn same_padding(size: usize, kernel: usize, stride: usize) -> (usize, usize) {
    let outputs = size.div_ceil(stride);
    let total = (outputs.saturating_sub(1) * stride + kernel).saturating_sub(size);
    (total / 2, total - total / 2)
}

fn pad_zeros<B: Backend>(x: Tensor<B, 4>, dim: usize, before: usize, after: usize) -> Tensor<B, 4> {
    if before == 0 && after == 0 {
        return x;
    }
    let device = x.device();
    let mut shape = x.dims();
    let mut parts = Vec::with_capacity(3);
    if before > 0 {
        shape[dim] = before;
        parts.push(Tensor::zeros(shape, &device));
    }
    parts.push(x);
    if after > 0 {
        shape[dim] = after;
        parts.push(Tensor::zeros(shape, &device));
    }
    Tensor::cat(parts, dim)
}

#[derive(Module, Debug)]
pub struct SqueezeExcitation<B: Backend> {
    pool: AdaptiveAvgPool2d,
    reduce: Conv2d<B>,
    expand: Conv2d<B>,
}

impl<B: Backend> SqueezeExcitation<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let scale = self.pool.forward(x.clone());
        let scale = silu(self.reduce.forward(scale));
        let scale = sigmoid(self.expand.forward(scale));
        x * scale
    }
}

/// Mobile inverted bottleneck block.
#[derive(Module, Debug)]
pub struct MBConv<B: Backend> {
    expand: Option<ConvBn<B>>,
    depthwise: ConvBn<B>,
    excitation: SqueezeExcitation<B>,
    project: ConvBn<B>,
}

impl<B: Backend> MBConv<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = input.clone();
        if let Some(expand) = &self.expand {
            x = silu(expand.forward(x));
        }
        let x = silu(self.depthwise.forward(x));
        let x = self.excitation.forward(x);
        let x = self.project.forward(x);

        // Identity skip only when stride is 1 and the channel count is unchanged.
        if x.dims() == input.dims() {
            x + input
        } else {
            x
        }
    }
}

/// Everything up to and including global pooling.
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    stem: ConvBn<B>,
    blocks: Vec<MBConv<B>>,
    head: ConvBn<B>,
    pool: AdaptiveAvgPool2d,
}

impl<B: Backend> Backbone<B> {
    /// Maps `[N, 3, H, W]` images to `[N, num_features]` pooled features.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = silu(self.stem.forward(images));
        for block in &self.blocks {
            x = block.forward(x);
        }
        let x = silu(self.head.forward(x));
        self.pool.forward(x).flatten(1, 3)
    }
}

#[derive(Module, Debug)]
pub struct EfficientNet<B: Backend> {
    backbone: Backbone<B>,
    dropout: Dropout,
    classifier: Linear<B>,
}

impl<B: Backend> EfficientNet<B> {
    /// Returns class logits of shape `[N, num_classes]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.backbone.forward(images);
        let features = self.dropout.forward(features);
        self.classifier.forward(features)
    }

    pub fn backbone(&self) -> &Backbone<B> {
        &self.backbone
    }

    /// Replaces the backbone weights, leaving the classifier head untouched.
    ///
    /// `.pth`/`.pt` files are read as `efficientnet_pytorch` state dicts.
    /// Anything else is a record written by `save_backbone`, given with or
    /// without the `.mpk.gz` extension.
    pub fn load_backbone(
        mut self,
        path: impl AsRef<Path>,
        device: &B::Device,
    ) -> error::Result<Self> {
        let path = path.as_ref();
        let record = if is_pytorch_file(path) {
            load_pytorch_backbone(path, device)?
        } else {
            NamedMpkGzFileRecorder::<FullPrecisionSettings>::new()
                .load(record_stem(path), device)
                .map_err(|err| ClassifierError::Recorder(format!("{}: {err:?}", path.display())))?
        };
        self.backbone = self.backbone.load_record(record);
        info!(path = %path.display(), "loaded backbone weights");
        Ok(self)
    }

    /// Stops gradient tracking for every backbone parameter so optimisation
    /// only updates the classifier head.
    pub fn freeze_backbone(mut self) -> Self {
        self.backbone = self.backbone.no_grad();
        self
    }

    /// Writes the backbone alone at full precision, in the format
    /// `load_backbone` reads.
    pub fn save_backbone(&self, path: impl AsRef<Path>) -> error::Result<()> {
        self.backbone
            .clone()
            .save_file(
                record_stem(path.as_ref()),
                &NamedMpkGzFileRecorder::<FullPrecisionSettings>::new(),
            )
            .map_err(|err| ClassifierError::Recorder(format!("{err:?}")))
    }
}

/// `efficientnet_pytorch` state-dict keys and the backbone fields they fill.
/// The `_fc` classifier is not mapped and gets ignored.
const PYTORCH_KEY_REMAP: [(&str, &str); 12] = [
    (r"^_conv_stem\.(.+)", "stem.conv.$1"),
    (r"^_bn0\.(.+)", "stem.norm.$1"),
    (r"^_conv_head\.(.+)", "head.conv.$1"),
    (r"^_bn1\.(.+)", "head.norm.$1"),
    (r"^_blocks\.(\d+)\._expand_conv\.(.+)", "blocks.$1.expand.conv.$2"),
    (r"^_blocks\.(\d+)\._bn0\.(.+)", "blocks.$1.expand.norm.$2"),
    (r"^_blocks\.(\d+)\._depthwise_conv\.(.+)", "blocks.$1.depthwise.conv.$2"),
    (r"^_blocks\.(\d+)\._bn1\.(.+)", "blocks.$1.depthwise.norm.$2"),
    (r"^_blocks\.(\d+)\._se_reduce\.(.+)", "blocks.$1.excitation.reduce.$2"),
    (r"^_blocks\.(\d+)\._se_expand\.(.+)", "blocks.$1.excitation.expand.$2"),
    (r"^_blocks\.(\d+)\._project_conv\.(.+)", "blocks.$1.project.conv.$2"),
    (r"^_blocks\.(\d+)\._bn2\.(.+)", "blocks.$1.project.norm.$2"),
];

fn is_pytorch_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("pth" | "pt")
    )
}

fn load_pytorch_backbone<B: Backend>(
    path: &Path,
    device: &B::Device,
) -> error::Result<BackboneRecord<B>> {
    let args = PYTORCH_KEY_REMAP
        .iter()
        .fold(LoadArgs::new(path.to_path_buf()), |args, (pattern, replacement)| {
            args.with_key_remap(pattern, replacement)
        });
    PyTorchFileRecorder::<FullPrecisionSettings>::default()
        .load(args, device)
        .map_err(|err| ClassifierError::Recorder(format!("{}: {err:?}", path.display())))
}

/// Fetches a weights file into `cache_dir` unless already present and
/// returns its local path, ready for `EfficientNet::load_backbone`.
pub fn download_weights(url: &str, cache_dir: &Path) -> error::Result<PathBuf> {
    let file_name = url
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ClassifierError::Config(format!("no file name in url '{url}'")))?;
    let target = cache_dir.join(file_name);

    if !target.exists() {
        fs::create_dir_all(cache_dir)?;
        info!(url, "downloading backbone weights");
        let bytes = downloader::download_file_as_bytes(url, file_name);
        fs::write(&target, bytes)?;
    }

    Ok(target)
}

// File recorders append their own extension.
fn record_stem(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(raw.trim_end_matches(RECORD_EXTENSION))
}
