//! Transfer-learning base model preparation on burn.
//!
//! A configuration record drives two steps:
//!
//! 1. [`PrepareBaseModel::get_base_model`] builds an EfficientNet-B0 backbone
//!    (random or pretrained weights, optional classification top) and saves it.
//! 2. [`PrepareBaseModel::update_base_model`] flattens the backbone output,
//!    attaches one single-unit head per output variable (`linear` regression or
//!    `binary` classification), compiles the result with SGD, per-head losses
//!    and accuracy for binary heads, prints a summary and saves it.
//!
//! Artifacts are burn MessagePack records with a JSON manifest alongside.

pub mod checkpoint;
pub mod config;
pub mod efficientnet;
pub mod error;
pub mod heads;
pub mod model;
pub mod prepare_base_model;
pub mod summary;

pub use config::{
    ConfigurationManager, DataIngestionConfig, HeadKind, ImageSize, OutputVariable,
    PrepareBaseModelConfig, WeightsSource,
};
pub use efficientnet::{BackboneConfig, BackboneOutput, EfficientNetB0};
pub use error::{PrepareError, Result};
pub use heads::{LossKind, MetricKind, OutputHead};
pub use model::{CompileSpec, CompiledModel, MultiOutputModel, OptimizerSpec};
pub use prepare_base_model::PrepareBaseModel;
pub use summary::ModelSummary;
