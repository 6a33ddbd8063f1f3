// src/model.rs
use std::collections::{BTreeMap, HashMap};

use burn::{
    data::dataloader::Progress,
    module::Module,
    nn::loss::{BinaryCrossEntropyLossConfig, MseLoss, Reduction},
    optim::{GradientsParams, Optimizer, SgdConfig},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
    train::metric::{Adaptor, HammingScore, HammingScoreInput, Metric, MetricMetadata, Numeric},
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    config::{validate_output_variables, HeadKind, OutputVariable},
    efficientnet::{BackboneConfig, EfficientNetB0},
    error::{PrepareError, Result},
    heads::{LossKind, MetricKind, OutputHead},
    summary::{ModelSummary, SummaryRow},
};

/// Backbone with one single-unit head per output variable.
#[derive(Module, Debug)]
pub struct MultiOutputModel<B: Backend> {
    backbone: EfficientNetB0<B>,
    heads: Vec<OutputHead<B>>,
}

impl<B: Backend> MultiOutputModel<B> {
    pub fn new(
        backbone: EfficientNetB0<B>,
        in_features: usize,
        outputs: &[OutputVariable],
        device: &B::Device,
    ) -> Self {
        let heads = outputs
            .iter()
            .map(|output| OutputHead::new(in_features, output.kind, device))
            .collect();

        Self { backbone, heads }
    }

    /// One `[batch, 1]` tensor per head, in head order.
    pub fn forward(&self, images: Tensor<B, 4>) -> Vec<Tensor<B, 2>> {
        let features = self.backbone.forward(images).flatten();

        self.heads
            .iter()
            .map(|head| head.forward(features.clone()))
            .collect()
    }

    /// Like [`forward`](Self::forward) but without the binary heads' sigmoid.
    pub fn forward_logits(&self, images: Tensor<B, 4>) -> Vec<Tensor<B, 2>> {
        let features = self.backbone.forward(images).flatten();

        self.heads
            .iter()
            .map(|head| head.forward_logits(features.clone()))
            .collect()
    }

    pub fn backbone(&self) -> &EfficientNetB0<B> {
        &self.backbone
    }

    pub fn heads(&self) -> &[OutputHead<B>] {
        &self.heads
    }
}

/// Optimizer chosen at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OptimizerSpec {
    Sgd { learning_rate: f64 },
}

impl OptimizerSpec {
    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::Sgd { learning_rate } => *learning_rate,
        }
    }
}

/// Everything `compile` attaches to a model besides its weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileSpec {
    pub outputs: Vec<OutputVariable>,
    pub optimizer: OptimizerSpec,
}

impl CompileSpec {
    pub fn new(outputs: Vec<OutputVariable>, learning_rate: f64) -> Self {
        Self {
            outputs,
            optimizer: OptimizerSpec::Sgd { learning_rate },
        }
    }

    pub fn losses(&self) -> BTreeMap<String, LossKind> {
        self.outputs
            .iter()
            .map(|output| (output.name.clone(), output.kind.loss()))
            .collect()
    }

    pub fn metrics(&self) -> BTreeMap<String, MetricKind> {
        self.outputs
            .iter()
            .filter_map(|output| output.kind.metric().map(|metric| (output.name.clone(), metric)))
            .collect()
    }
}

/// Per-head losses and their unweighted sum.
#[derive(Debug, Clone)]
pub struct HeadLosses<B: Backend> {
    pub per_head: Vec<(String, Tensor<B, 1>)>,
    pub total: Tensor<B, 1>,
}

/// A multi-output model together with its optimizer, losses and metrics.
#[derive(Debug)]
pub struct CompiledModel<B: Backend> {
    pub model: MultiOutputModel<B>,
    pub backbone_config: BackboneConfig,
    pub compile: CompileSpec,
}

impl<B: Backend> CompiledModel<B> {
    /// Attaches heads to `backbone` and compiles the result.
    ///
    /// The backbone output is flattened once and shared by every head.
    pub fn compile(
        backbone: EfficientNetB0<B>,
        backbone_config: BackboneConfig,
        outputs: &[OutputVariable],
        learning_rate: f64,
        device: &B::Device,
    ) -> Result<Self> {
        validate_output_variables(outputs)?;
        backbone.check_config(&backbone_config)?;
        if !learning_rate.is_finite() || learning_rate <= 0.0 {
            return Err(PrepareError::InvalidLearningRate(learning_rate));
        }

        let in_features = backbone_config.output_features();
        debug!(in_features, heads = outputs.len(), "attaching output heads");

        let model = MultiOutputModel::new(backbone, in_features, outputs, device);
        Ok(Self {
            model,
            backbone_config,
            compile: CompileSpec::new(outputs.to_vec(), learning_rate),
        })
    }

    pub fn output_names(&self) -> Vec<&str> {
        self.compile
            .outputs
            .iter()
            .map(|output| output.name.as_str())
            .collect()
    }

    pub fn learning_rate(&self) -> f64 {
        self.compile.optimizer.learning_rate()
    }

    pub fn forward_named(&self, images: Tensor<B, 4>) -> Vec<(String, Tensor<B, 2>)> {
        self.compile
            .outputs
            .iter()
            .map(|output| output.name.clone())
            .zip(self.model.forward(images))
            .collect()
    }

    /// Computes every head's loss against the target stored under its name.
    pub fn loss(
        &self,
        images: Tensor<B, 4>,
        targets: &HashMap<String, Tensor<B, 2>>,
    ) -> Result<HeadLosses<B>> {
        let mut per_head = Vec::with_capacity(self.compile.outputs.len());

        for (output, logits) in self.compile.outputs.iter().zip(self.model.forward_logits(images)) {
            let target = targets
                .get(&output.name)
                .cloned()
                .ok_or_else(|| PrepareError::MissingTarget(output.name.clone()))?;
            per_head.push((output.name.clone(), head_loss(output.kind, logits, target)));
        }

        let total = per_head
            .iter()
            .map(|(_, loss)| loss.clone())
            .reduce(|acc, loss| acc + loss)
            .ok_or(PrepareError::NoOutputVariables)?;

        Ok(HeadLosses { per_head, total })
    }

    /// Accuracy of every head that carries a metric.
    pub fn evaluate_metrics(
        &self,
        images: Tensor<B, 4>,
        targets: &HashMap<String, Tensor<B, 2>>,
    ) -> Result<BTreeMap<String, f32>> {
        let mut metrics = BTreeMap::new();

        for (output, prediction) in self.compile.outputs.iter().zip(self.model.forward(images)) {
            let Some(MetricKind::Accuracy) = output.kind.metric() else {
                continue;
            };
            let target = targets
                .get(&output.name)
                .cloned()
                .ok_or_else(|| PrepareError::MissingTarget(output.name.clone()))?;
            metrics.insert(output.name.clone(), binary_accuracy(prediction, target));
        }

        Ok(metrics)
    }

    pub fn summary(&self, title: &str) -> ModelSummary {
        let mut rows = self.model.backbone().summary_rows(&self.backbone_config);
        rows.push(SummaryRow::new(
            "flatten",
            "Flatten",
            vec![self.backbone_config.output_features()],
            0,
        ));

        for (output, head) in self.compile.outputs.iter().zip(self.model.heads()) {
            let kind = match output.kind {
                HeadKind::Linear => "Linear",
                HeadKind::Binary => "Linear+Sigmoid",
            };
            rows.push(SummaryRow::new(&output.name, kind, vec![1], head.num_params()));
        }

        ModelSummary {
            title: title.to_string(),
            rows,
            trainable_params: self.model.num_params(),
        }
    }
}

impl<B: AutodiffBackend> CompiledModel<B> {
    pub fn optimizer(&self) -> impl Optimizer<MultiOutputModel<B>, B> {
        match self.compile.optimizer {
            OptimizerSpec::Sgd { .. } => SgdConfig::new().init::<B, MultiOutputModel<B>>(),
        }
    }

    /// Runs one optimization step and returns the updated model with its loss.
    pub fn step<O>(
        self,
        optim: &mut O,
        images: Tensor<B, 4>,
        targets: &HashMap<String, Tensor<B, 2>>,
    ) -> Result<(Self, f32)>
    where
        O: Optimizer<MultiOutputModel<B>, B>,
    {
        let losses = self.loss(images, targets)?;
        let loss_value = losses.total.clone().into_scalar().elem::<f32>();

        let grads = losses.total.backward();
        let grads = GradientsParams::from_grads(grads, &self.model);
        let model = optim.step(self.learning_rate(), self.model, grads);

        Ok((
            Self {
                model,
                backbone_config: self.backbone_config,
                compile: self.compile,
            },
            loss_value,
        ))
    }
}

/// Binary cross-entropy is computed on logits so a saturated sigmoid stays finite.
fn head_loss<B: Backend>(kind: HeadKind, logits: Tensor<B, 2>, target: Tensor<B, 2>) -> Tensor<B, 1> {
    match kind.loss() {
        LossKind::MeanSquaredError => MseLoss::new().forward(logits, target, Reduction::Mean),
        LossKind::BinaryCrossEntropy => BinaryCrossEntropyLossConfig::new()
            .with_logits(true)
            .init(&logits.device())
            .forward(logits, target.int()),
    }
}

/// Probabilities and 0/1 targets of one binary head.
#[derive(Debug, Clone)]
pub struct BinaryHeadOutput<B: Backend> {
    pub probabilities: Tensor<B, 2>,
    pub targets: Tensor<B, 2, Int>,
}

impl<B: Backend> Adaptor<HammingScoreInput<B>> for BinaryHeadOutput<B> {
    fn adapt(&self) -> HammingScoreInput<B> {
        HammingScoreInput::new(self.probabilities.clone(), self.targets.clone())
    }
}

/// Fraction of rows where the thresholded probability matches the target.
fn binary_accuracy<B: Backend>(prediction: Tensor<B, 2>, target: Tensor<B, 2>) -> f32 {
    let batch_size = prediction.dims()[0];
    let output = BinaryHeadOutput {
        probabilities: prediction,
        targets: target.greater_equal_elem(0.5).int(),
    };

    let metadata = MetricMetadata {
        progress: Progress {
            items_processed: batch_size,
            items_total: batch_size,
        },
        epoch: 1,
        epoch_total: 1,
        iteration: 1,
        lr: None,
    };

    let mut metric = HammingScore::<B>::new().with_threshold(0.5);
    metric.update(&output.adapt(), &metadata);
    (metric.value() / 100.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImageSize;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    fn backbone_config() -> BackboneConfig {
        BackboneConfig {
            input_size: ImageSize::new(32, 32, 3),
            include_top: false,
            classes: 1000,
        }
    }

    fn outputs() -> Vec<OutputVariable> {
        vec![
            OutputVariable::new("age", HeadKind::Linear),
            OutputVariable::new("is_adult", HeadKind::Binary),
        ]
    }

    fn compiled<B: Backend>(device: &B::Device) -> CompiledModel<B> {
        let config = backbone_config();
        CompiledModel::compile(config.init(device), config, &outputs(), 0.01, device).unwrap()
    }

    fn targets<B: Backend>(device: &B::Device) -> HashMap<String, Tensor<B, 2>> {
        HashMap::from([
            (
                "age".to_string(),
                Tensor::<B, 1>::from_floats([0.4, 0.7], device).reshape([2, 1]),
            ),
            (
                "is_adult".to_string(),
                Tensor::<B, 1>::from_floats([0.0, 1.0], device).reshape([2, 1]),
            ),
        ])
    }

    #[test]
    fn compile_produces_named_outputs_in_order() {
        let device = Default::default();
        let model = compiled::<TestBackend>(&device);

        assert_eq!(model.output_names(), vec!["age", "is_adult"]);
        assert_eq!(model.learning_rate(), 0.01);

        let images = Tensor::<TestBackend, 4>::zeros([2, 3, 32, 32], &device);
        let outputs = model.forward_named(images);
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].0, "age");
        assert_eq!(outputs[1].0, "is_adult");
        for (_, tensor) in &outputs {
            assert_eq!(tensor.dims(), [2, 1]);
        }
    }

    #[test]
    fn losses_and_metrics_follow_head_kind() {
        let spec = CompileSpec::new(outputs(), 0.01);

        let losses = spec.losses();
        assert_eq!(losses["age"], LossKind::MeanSquaredError);
        assert_eq!(losses["is_adult"], LossKind::BinaryCrossEntropy);

        let metrics = spec.metrics();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics["is_adult"], MetricKind::Accuracy);
        assert!(!metrics.contains_key("age"));
    }

    #[test]
    fn compile_rejects_empty_and_duplicate_heads() {
        let device = Default::default();
        let config = backbone_config();

        let err = CompiledModel::compile(
            config.init::<TestBackend>(&device),
            config,
            &[],
            0.01,
            &device,
        )
        .unwrap_err();
        assert!(matches!(err, PrepareError::NoOutputVariables));

        let duplicated = vec![
            OutputVariable::new("age", HeadKind::Linear),
            OutputVariable::new("age", HeadKind::Binary),
        ];
        let err = CompiledModel::compile(
            config.init::<TestBackend>(&device),
            config,
            &duplicated,
            0.01,
            &device,
        )
        .unwrap_err();
        assert!(matches!(err, PrepareError::DuplicateHeadName(_)));
    }

    #[test]
    fn loss_reports_every_head_and_requires_targets() {
        let device = Default::default();
        let model = compiled::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::zeros([2, 3, 32, 32], &device);

        let losses = model.loss(images.clone(), &targets(&device)).unwrap();
        let names: Vec<&str> = losses.per_head.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["age", "is_adult"]);
        let total: f32 = losses.total.into_scalar();
        assert!(total.is_finite());
        assert!(total >= 0.0);

        let mut partial = targets(&device);
        partial.remove("is_adult");
        let err = model.loss(images, &partial).unwrap_err();
        assert!(matches!(err, PrepareError::MissingTarget(name) if name == "is_adult"));
    }

    #[test]
    fn metrics_cover_binary_heads_only() {
        let device = Default::default();
        let model = compiled::<TestBackend>(&device);
        let images = Tensor::<TestBackend, 4>::zeros([2, 3, 32, 32], &device);

        let metrics = model.evaluate_metrics(images, &targets(&device)).unwrap();
        assert_eq!(metrics.keys().collect::<Vec<_>>(), vec!["is_adult"]);
        assert!((0.0..=1.0).contains(&metrics["is_adult"]));
    }

    #[test]
    fn binary_accuracy_thresholds_at_half() {
        let device = Default::default();
        let prediction =
            Tensor::<TestBackend, 1>::from_floats([0.9, 0.2, 0.6, 0.4], &device).reshape([4, 1]);
        let target =
            Tensor::<TestBackend, 1>::from_floats([1.0, 0.0, 0.0, 0.0], &device).reshape([4, 1]);

        assert!((binary_accuracy(prediction, target) - 0.75).abs() < 1e-6);
    }

    #[test]
    fn binary_loss_stays_finite_when_sigmoid_saturates() {
        let device = Default::default();
        let logits =
            Tensor::<TestBackend, 1>::from_floats([40.0, -40.0], &device).reshape([2, 1]);
        let saturated = burn::tensor::activation::sigmoid(logits.clone())
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert!((saturated[0] - 1.0).abs() < 1e-6 && saturated[1] < 1e-6);

        let right = Tensor::<TestBackend, 1>::from_floats([1.0, 0.0], &device).reshape([2, 1]);
        let loss: f32 = head_loss(HeadKind::Binary, logits.clone(), right).into_scalar();
        assert!(loss.is_finite());
        assert!(loss < 1e-3);

        let wrong = Tensor::<TestBackend, 1>::from_floats([0.0, 1.0], &device).reshape([2, 1]);
        let loss: f32 = head_loss(HeadKind::Binary, logits, wrong).into_scalar();
        assert!(loss.is_finite());
        assert!((loss - 40.0).abs() < 1e-2);
    }

    #[test]
    fn compile_rejects_backbone_that_disagrees_with_config() {
        let device = Default::default();
        let with_top = BackboneConfig {
            include_top: true,
            classes: 5,
            ..backbone_config()
        };

        let err = CompiledModel::compile(
            with_top.init::<TestBackend>(&device),
            backbone_config(),
            &outputs(),
            0.01,
            &device,
        )
        .unwrap_err();
        assert!(matches!(err, PrepareError::BackboneMismatch(_)));

        let err = CompiledModel::compile(
            with_top.init::<TestBackend>(&device),
            BackboneConfig { classes: 7, ..with_top },
            &outputs(),
            0.01,
            &device,
        )
        .unwrap_err();
        assert!(matches!(err, PrepareError::BackboneMismatch(_)));

        let model = CompiledModel::compile(
            with_top.init::<TestBackend>(&device),
            with_top,
            &outputs(),
            0.01,
            &device,
        )
        .unwrap();
        let images = Tensor::<TestBackend, 4>::zeros([1, 3, 32, 32], &device);
        assert_eq!(model.forward_named(images)[0].1.dims(), [1, 1]);
    }

    #[test]
    fn summary_lists_heads_after_flatten() {
        let device = Default::default();
        let model = compiled::<TestBackend>(&device);
        let summary = model.summary("updated_base_model");

        let names: Vec<&str> = summary.rows.iter().map(|row| row.name.as_str()).collect();
        assert_eq!(&names[names.len() - 3..], &["flatten", "age", "is_adult"]);
        assert_eq!(summary.total_params(), model.model.num_params());
        assert_eq!(summary.rows.last().map(|row| row.kind.as_str()), Some("Linear+Sigmoid"));
    }

    #[test]
    fn sgd_step_updates_model() {
        let device = Default::default();
        let model = compiled::<TestAutodiffBackend>(&device);
        let mut optim = model.optimizer();
        let images = Tensor::<TestAutodiffBackend, 4>::ones([2, 3, 32, 32], &device);

        let before = model.forward_named(images.clone())[0].1.clone().into_data();
        let (model, loss) = model.step(&mut optim, images.clone(), &targets(&device)).unwrap();
        let after = model.forward_named(images)[0].1.clone().into_data();

        assert!(loss.is_finite());
        assert_ne!(before.to_vec::<f32>().unwrap(), after.to_vec::<f32>().unwrap());
    }
}
