use std::path::PathBuf;

use burn::tensor::backend::Backend;
use tracing::info;

use crate::{
    checkpoint::{self, RECORD_EXTENSION},
    config::{PrepareBaseModelConfig, WeightsSource},
    efficientnet::{BackboneConfig, EfficientNetB0},
    error::{PrepareError, Result},
    model::CompiledModel,
};

/// Builds the backbone and the compiled multi-output model, saving both.
pub struct PrepareBaseModel<B: Backend> {
    config: PrepareBaseModelConfig,
    device: B::Device,
}

impl<B: Backend> PrepareBaseModel<B> {
    pub fn new(config: PrepareBaseModelConfig, device: B::Device) -> Self {
        Self { config, device }
    }

    /// Runs both steps in order and returns the compiled model.
    pub fn run(&self) -> Result<CompiledModel<B>> {
        info!("preparing base model");
        info!(
            backend = std::any::type_name::<B>(),
            device = ?self.device,
            image_size = ?self.config.params_image_size.as_array(),
            heads = self.config.params_output_variables.len(),
            learning_rate = self.config.params_learning_rate,
            "configuration"
        );

        self.config.validate()?;

        let (backbone, backbone_config) = self.get_base_model()?;
        self.update_base_model(backbone, backbone_config)
    }

    /// Instantiates the backbone, loads its weights and saves it to `base_model_path`.
    /// Returns the backbone together with the configuration it was built from.
    pub fn get_base_model(&self) -> Result<(EfficientNetB0<B>, BackboneConfig)> {
        self.config.validate()?;
        let backbone_config = BackboneConfig::from_prepare(&self.config);

        B::seed(self.config.params_seed);
        let backbone = backbone_config.init::<B>(&self.device);

        let backbone = match &self.config.params_weights {
            WeightsSource::None => {
                info!("backbone initialized with random weights");
                backbone
            }
            WeightsSource::Pretrained(id) => {
                let record = self.resolve_weights(id)?;
                info!(weights = %id, record = %record.display(), "loading pretrained backbone");
                checkpoint::load_backbone_weights(backbone, &record, &self.device)?
            }
        };

        checkpoint::save_backbone(&self.config.base_model_path, &backbone, backbone_config)?;
        Ok((backbone, backbone_config))
    }

    /// Attaches the configured heads, compiles, prints the summary and saves
    /// the result to `updated_base_model_path`. `backbone_config` must describe
    /// `backbone`, as returned by [`get_base_model`](Self::get_base_model) or
    /// [`checkpoint::load_backbone`].
    pub fn update_base_model(
        &self,
        backbone: EfficientNetB0<B>,
        backbone_config: BackboneConfig,
    ) -> Result<CompiledModel<B>> {
        let model = CompiledModel::compile(
            backbone,
            backbone_config,
            &self.config.params_output_variables,
            self.config.params_learning_rate,
            &self.device,
        )?;

        let summary = model.summary("updated_base_model");
        println!("{summary}");
        info!(
            outputs = ?model.output_names(),
            params = summary.total_params(),
            "model compiled"
        );

        checkpoint::save_compiled_model(&self.config.updated_base_model_path, &model)?;
        Ok(model)
    }

    /// An existing record path wins, then `<weights_dir>/<id>.mpk`.
    fn resolve_weights(&self, id: &str) -> Result<PathBuf> {
        let direct = PathBuf::from(id);
        if direct.is_file() {
            return Ok(direct);
        }

        let named = self
            .config
            .weights_dir
            .join(id)
            .with_extension(RECORD_EXTENSION);
        if named.is_file() {
            Ok(named)
        } else {
            Err(PrepareError::WeightsNotFound {
                id: id.to_string(),
                path: named,
            })
        }
    }
}
