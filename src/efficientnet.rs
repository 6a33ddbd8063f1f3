// ============================================
// src/efficientnet.rs
// ============================================
use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        Linear, LinearConfig, PaddingConfig2d, Relu, Sigmoid,
    },
    prelude::*,
    tensor::{
        activation::{silu, softmax},
        backend::Backend,
        module::adaptive_avg_pool2d,
        Tensor,
    },
};
use serde::{Deserialize, Serialize};

use crate::{
    config::{ImageSize, PrepareBaseModelConfig},
    error::{PrepareError, Result},
    summary::SummaryRow,
};

/// Channels produced by the 1x1 head convolution.
pub const NUM_FEATURES: usize = 1280;

const STEM_CHANNELS: usize = 32;
const SE_REDUCTION: usize = 4;

/// (expand ratio, output channels, repeats, first stride, kernel)
const STAGES: [(usize, usize, usize, usize, usize); 7] = [
    (1, 16, 1, 1, 3),
    (6, 24, 2, 2, 3),
    (6, 40, 2, 2, 5),
    (6, 80, 3, 2, 3),
    (6, 112, 3, 1, 5),
    (6, 192, 4, 2, 5),
    (6, 320, 1, 1, 3),
];

/// Architecture of the backbone, persisted next to its weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackboneConfig {
    pub input_size: ImageSize,
    pub include_top: bool,
    pub classes: usize,
}

impl BackboneConfig {
    pub fn from_prepare(config: &PrepareBaseModelConfig) -> Self {
        Self {
            input_size: config.params_image_size,
            include_top: config.params_include_top,
            classes: config.params_classes,
        }
    }

    /// Spatial size of the final feature map.
    pub fn feature_map_size(&self) -> [usize; 2] {
        let mut height = downsample(self.input_size.height, 2);
        let mut width = downsample(self.input_size.width, 2);
        for (_, _, _, stride, _) in STAGES {
            height = downsample(height, stride);
            width = downsample(width, stride);
        }
        [height, width]
    }

    /// Per-sample output shape, without the batch dimension.
    pub fn output_shape(&self) -> Vec<usize> {
        if self.include_top {
            vec![self.classes]
        } else {
            let [height, width] = self.feature_map_size();
            vec![NUM_FEATURES, height, width]
        }
    }

    /// Length of the flattened per-sample output.
    pub fn output_features(&self) -> usize {
        self.output_shape().iter().product()
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> EfficientNetB0<B> {
        EfficientNetB0::new(self, device)
    }
}

/// Output size of an odd-kernel convolution padded by `kernel / 2`.
fn downsample(size: usize, stride: usize) -> usize {
    size.div_ceil(stride)
}

fn same_padding(kernel: usize) -> PaddingConfig2d {
    PaddingConfig2d::Explicit(kernel / 2, kernel / 2)
}

#[derive(Module, Debug)]
pub struct SqueezeExcite<B: Backend> {
    fc1: Linear<B>,
    fc2: Linear<B>,
    relu: Relu,
    sigmoid: Sigmoid,
}

impl<B: Backend> SqueezeExcite<B> {
    pub fn new(channels: usize, reduction: usize, device: &B::Device) -> Self {
        let reduced_channels = (channels / reduction).max(1);
        Self {
            fc1: LinearConfig::new(channels, reduced_channels).init(device),
            fc2: LinearConfig::new(reduced_channels, channels).init(device),
            relu: Relu::new(),
            sigmoid: Sigmoid::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch_size, channels, _, _] = x.dims();

        let y = adaptive_avg_pool2d(x.clone(), [1, 1]).reshape([batch_size, channels]);
        let y = self.relu.forward(self.fc1.forward(y));
        let y = self.sigmoid.forward(self.fc2.forward(y));

        x * y.reshape([batch_size, channels, 1, 1])
    }
}

#[derive(Module, Debug)]
pub struct MBConv<B: Backend> {
    expand_conv: Option<Conv2d<B>>,
    depthwise_conv: Conv2d<B>,
    squeeze_excite: SqueezeExcite<B>,
    project_conv: Conv2d<B>,
    use_residual: bool,
}

impl<B: Backend> MBConv<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        expand_ratio: usize,
        kernel_size: usize,
        stride: usize,
        device: &B::Device,
    ) -> Self {
        let expanded_channels = in_channels * expand_ratio;

        let expand_conv = (expand_ratio != 1)
            .then(|| Conv2dConfig::new([in_channels, expanded_channels], [1, 1]).init(device));

        let depthwise_conv =
            Conv2dConfig::new([expanded_channels, expanded_channels], [kernel_size, kernel_size])
                .with_stride([stride, stride])
                .with_padding(same_padding(kernel_size))
                .with_groups(expanded_channels)
                .init(device);

        let squeeze_excite = SqueezeExcite::new(expanded_channels, SE_REDUCTION, device);

        let project_conv = Conv2dConfig::new([expanded_channels, out_channels], [1, 1]).init(device);
        let use_residual = stride == 1 && in_channels == out_channels;

        Self {
            expand_conv,
            depthwise_conv,
            squeeze_excite,
            project_conv,
            use_residual,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = if self.use_residual { Some(x.clone()) } else { None };

        let mut y = match &self.expand_conv {
            Some(conv) => silu(conv.forward(x)),
            None => x,
        };

        y = silu(self.depthwise_conv.forward(y));

        y = self.squeeze_excite.forward(y);
        y = self.project_conv.forward(y);

        if let Some(id) = identity {
            y + id
        } else {
            y
        }
    }
}

/// What the backbone hands to the layers stacked on top of it.
#[derive(Debug, Clone)]
pub enum BackboneOutput<B: Backend> {
    /// `[batch, channels, height, width]` when the top is excluded.
    FeatureMap(Tensor<B, 4>),
    /// `[batch, classes]` softmax scores from the classification top.
    Scores(Tensor<B, 2>),
}

impl<B: Backend> BackboneOutput<B> {
    /// Flattens everything but the batch dimension.
    pub fn flatten(self) -> Tensor<B, 2> {
        match self {
            Self::FeatureMap(features) => features.flatten(1, 3),
            Self::Scores(scores) => scores,
        }
    }
}

#[derive(Module, Debug)]
pub struct EfficientNetB0<B: Backend> {
    conv_stem: Conv2d<B>,
    blocks: Vec<MBConv<B>>,
    conv_head: Conv2d<B>,
    top: Option<Linear<B>>,
    relu: Relu,
    num_features: usize,
}

impl<B: Backend> EfficientNetB0<B> {
    pub fn new(config: &BackboneConfig, device: &B::Device) -> Self {
        let conv_stem = Conv2dConfig::new([config.input_size.channels, STEM_CHANNELS], [3, 3])
            .with_stride([2, 2])
            .with_padding(same_padding(3))
            .init(device);

        let mut blocks = Vec::new();
        let mut in_channels = STEM_CHANNELS;

        for (t, c, n, s, k) in STAGES {
            let out_channels = Self::round_channels(c as f32, 1.0, 8);

            for i in 0..n {
                let stride = if i == 0 { s } else { 1 };
                blocks.push(MBConv::new(in_channels, out_channels, t, k, stride, device));
                in_channels = out_channels;
            }
        }

        let conv_head = Conv2dConfig::new([in_channels, NUM_FEATURES], [1, 1]).init(device);
        let top = config
            .include_top
            .then(|| LinearConfig::new(NUM_FEATURES, config.classes).init(device));

        Self {
            conv_stem,
            blocks,
            conv_head,
            top,
            relu: Relu::new(),
            num_features: NUM_FEATURES,
        }
    }

    fn round_channels(channels: f32, width_multiplier: f32, divisor: usize) -> usize {
        let channels = channels * width_multiplier;
        let new_channels = (channels + divisor as f32 / 2.0).max(divisor as f32);
        ((new_channels as usize) / divisor) * divisor
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> BackboneOutput<B> {
        let mut x = self.conv_stem.forward(x);

        for block in &self.blocks {
            x = block.forward(x);
        }

        x = self.conv_head.forward(x);
        let features = self.relu.forward(x);

        match &self.top {
            Some(top) => {
                let batch_size = features.dims()[0];
                let pooled =
                    adaptive_avg_pool2d(features, [1, 1]).reshape([batch_size, self.num_features]);
                BackboneOutput::Scores(softmax(top.forward(pooled), 1))
            }
            None => BackboneOutput::FeatureMap(features),
        }
    }

    pub fn has_top(&self) -> bool {
        self.top.is_some()
    }

    /// Fails when the built layers do not match `config`.
    pub fn check_config(&self, config: &BackboneConfig) -> Result<()> {
        let channels = self.conv_stem.weight.val().dims()[1];
        if channels != config.input_size.channels {
            return Err(PrepareError::BackboneMismatch(format!(
                "stem expects {channels} input channels, config has {}",
                config.input_size.channels
            )));
        }

        match (&self.top, config.include_top) {
            (Some(top), true) => {
                let classes = top.weight.val().dims()[1];
                if classes != config.classes {
                    return Err(PrepareError::BackboneMismatch(format!(
                        "top has {classes} classes, config has {}",
                        config.classes
                    )));
                }
            }
            (None, false) => {}
            (top, _) => {
                return Err(PrepareError::BackboneMismatch(format!(
                    "backbone include_top is {}, config has {}",
                    top.is_some(),
                    config.include_top
                )));
            }
        }

        Ok(())
    }

    /// One row per stage, with the output shape each stage produces.
    pub fn summary_rows(&self, config: &BackboneConfig) -> Vec<SummaryRow> {
        let mut rows = Vec::new();
        let input = config.input_size;
        let mut height = downsample(input.height, 2);
        let mut width = downsample(input.width, 2);

        rows.push(SummaryRow::new(
            "input",
            "Input",
            vec![input.channels, input.height, input.width],
            0,
        ));
        rows.push(SummaryRow::new(
            "conv_stem",
            "Conv2d",
            vec![STEM_CHANNELS, height, width],
            self.conv_stem.num_params(),
        ));

        let mut blocks = self.blocks.iter();
        for (index, (_, c, n, s, _)) in STAGES.into_iter().enumerate() {
            height = downsample(height, s);
            width = downsample(width, s);
            let params = blocks.by_ref().take(n).map(|block| block.num_params()).sum();
            rows.push(SummaryRow::new(
                format!("stage{}", index + 1),
                format!("MBConv x{n}"),
                vec![Self::round_channels(c as f32, 1.0, 8), height, width],
                params,
            ));
        }

        rows.push(SummaryRow::new(
            "conv_head",
            "Conv2d",
            vec![self.num_features, height, width],
            self.conv_head.num_params(),
        ));
        if let Some(top) = &self.top {
            rows.push(SummaryRow::new(
                "predictions",
                "Linear+Softmax",
                vec![config.classes],
                top.num_params(),
            ));
        }
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn config(height: usize, width: usize, include_top: bool) -> BackboneConfig {
        BackboneConfig {
            input_size: ImageSize::new(height, width, 3),
            include_top,
            classes: 10,
        }
    }

    #[test]
    fn check_config_compares_top_and_channels() {
        let device = Default::default();
        let with_top = config(32, 32, true);
        let model = EfficientNetB0::<TestBackend>::new(&with_top, &device);

        assert!(model.check_config(&with_top).is_ok());
        // Spatial size is free: the stem and top do not depend on it.
        assert!(model.check_config(&config(64, 48, true)).is_ok());

        let err = model.check_config(&config(32, 32, false)).unwrap_err();
        assert!(err.to_string().contains("include_top"));

        let err = model
            .check_config(&BackboneConfig { classes: 3, ..with_top })
            .unwrap_err();
        assert!(err.to_string().contains("10 classes"));

        let grey = BackboneConfig {
            input_size: ImageSize::new(32, 32, 1),
            ..with_top
        };
        assert!(matches!(
            model.check_config(&grey),
            Err(PrepareError::BackboneMismatch(_))
        ));
    }

    #[test]
    fn feature_map_shrinks_by_32_rounding_up() {
        assert_eq!(config(224, 224, false).feature_map_size(), [7, 7]);
        assert_eq!(config(32, 32, false).feature_map_size(), [1, 1]);
        assert_eq!(config(65, 40, false).feature_map_size(), [3, 2]);
    }

    #[test]
    fn output_shape_depends_on_top() {
        assert_eq!(config(64, 64, false).output_shape(), vec![NUM_FEATURES, 2, 2]);
        assert_eq!(config(64, 64, false).output_features(), NUM_FEATURES * 4);
        assert_eq!(config(64, 64, true).output_shape(), vec![10]);
    }

    #[test]
    fn forward_matches_predicted_shape() {
        let device = Default::default();
        let cfg = config(64, 40, false);
        let model = cfg.init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 4>::zeros([2, 3, 64, 40], &device);
        match model.forward(input) {
            BackboneOutput::FeatureMap(features) => {
                assert_eq!(features.dims(), [2, NUM_FEATURES, 2, 2]);
                assert_eq!(features.flatten::<2>(1, 3).dims(), [2, cfg.output_features()]);
            }
            BackboneOutput::Scores(_) => panic!("top was not requested"),
        }
    }

    #[test]
    fn top_produces_normalized_scores() {
        let device = Default::default();
        let model = config(32, 32, true).init::<TestBackend>(&device);
        assert!(model.has_top());

        let input = Tensor::<TestBackend, 4>::ones([1, 3, 32, 32], &device);
        let scores = model.forward(input).flatten();
        assert_eq!(scores.dims(), [1, 10]);

        let total: f32 = scores.sum().into_scalar();
        assert!((total - 1.0).abs() < 1e-4);
    }

    #[test]
    fn summary_rows_cover_every_block() {
        let device = Default::default();
        let cfg = config(32, 32, false);
        let model = cfg.init::<TestBackend>(&device);

        let rows = model.summary_rows(&cfg);
        assert_eq!(rows.len(), 2 + STAGES.len() + 1);
        let total: usize = rows.iter().map(|row| row.params).sum();
        assert_eq!(total, model.num_params());
        assert_eq!(rows.last().map(|row| row.output_shape.clone()), Some(vec![NUM_FEATURES, 1, 1]));
    }
}
