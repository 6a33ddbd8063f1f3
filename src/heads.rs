use burn::{
    nn::{Linear, LinearConfig, Sigmoid},
    prelude::*,
    tensor::backend::Backend,
};
use serde::{Deserialize, Serialize};

use crate::config::HeadKind;

/// Loss assigned to a head at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    MeanSquaredError,
    BinaryCrossEntropy,
}

/// Metric tracked for a head at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Accuracy,
}

impl HeadKind {
    pub fn loss(self) -> LossKind {
        match self {
            Self::Linear => LossKind::MeanSquaredError,
            Self::Binary => LossKind::BinaryCrossEntropy,
        }
    }

    /// Binary heads get accuracy, regression heads get nothing.
    pub fn metric(self) -> Option<MetricKind> {
        match self {
            Self::Linear => None,
            Self::Binary => Some(MetricKind::Accuracy),
        }
    }

    pub fn has_sigmoid(self) -> bool {
        matches!(self, Self::Binary)
    }
}

/// Single-unit dense output on top of the shared flattened features.
#[derive(Module, Debug)]
pub struct OutputHead<B: Backend> {
    dense: Linear<B>,
    sigmoid: Option<Sigmoid>,
}

impl<B: Backend> OutputHead<B> {
    pub fn new(in_features: usize, kind: HeadKind, device: &B::Device) -> Self {
        Self {
            dense: LinearConfig::new(in_features, 1).init(device),
            sigmoid: kind.has_sigmoid().then(Sigmoid::new),
        }
    }

    /// Pre-activation output, used by the losses.
    pub fn forward_logits(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        self.dense.forward(x)
    }

    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.forward_logits(x);
        match &self.sigmoid {
            Some(sigmoid) => sigmoid.forward(x),
            None => x,
        }
    }

    pub fn kind(&self) -> HeadKind {
        if self.sigmoid.is_some() {
            HeadKind::Binary
        } else {
            HeadKind::Linear
        }
    }
}
