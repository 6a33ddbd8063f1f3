// src/config.rs

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{PrepareError, Result};

/// Smallest spatial size the backbone accepts (its total stride).
pub const MIN_SPATIAL_SIZE: usize = 32;

/// Backbone input shape, written as `[height, width, channels]` in config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[usize; 3]", into = "[usize; 3]")]
pub struct ImageSize {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl ImageSize {
    pub const fn new(height: usize, width: usize, channels: usize) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }

    pub const fn as_array(&self) -> [usize; 3] {
        [self.height, self.width, self.channels]
    }
}

impl From<[usize; 3]> for ImageSize {
    fn from([height, width, channels]: [usize; 3]) -> Self {
        Self::new(height, width, channels)
    }
}

impl From<ImageSize> for [usize; 3] {
    fn from(size: ImageSize) -> Self {
        size.as_array()
    }
}

/// `null` or `"none"` in config files means random initialization.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum WeightsSource {
    #[default]
    None,
    Pretrained(String),
}

impl From<Option<String>> for WeightsSource {
    fn from(value: Option<String>) -> Self {
        match value {
            Some(id) if !id.trim().is_empty() && !id.eq_ignore_ascii_case("none") => {
                Self::Pretrained(id)
            }
            _ => Self::None,
        }
    }
}

impl From<WeightsSource> for Option<String> {
    fn from(value: WeightsSource) -> Self {
        match value {
            WeightsSource::None => None,
            WeightsSource::Pretrained(id) => Some(id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeadKind {
    Linear,
    Binary,
}

impl std::fmt::Display for HeadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Linear => write!(f, "linear"),
            Self::Binary => write!(f, "binary"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputVariable {
    #[serde(rename = "NAME")]
    pub name: String,
    #[serde(rename = "TYPE")]
    pub kind: HeadKind,
}

impl OutputVariable {
    pub fn new(name: impl Into<String>, kind: HeadKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Paths used by the (external) data ingestion stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataIngestionConfig {
    pub root_dir: PathBuf,
    pub source_url: String,
    pub local_data_file: PathBuf,
    pub unzip_dir: PathBuf,
}

/// Everything the base model preparation stage needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrepareBaseModelConfig {
    pub root_dir: PathBuf,
    pub base_model_path: PathBuf,
    pub updated_base_model_path: PathBuf,
    pub weights_dir: PathBuf,
    pub params_image_size: ImageSize,
    pub params_weights: WeightsSource,
    pub params_include_top: bool,
    pub params_classes: usize,
    pub params_batch_size: usize,
    pub params_epochs: usize,
    pub params_augmentation: bool,
    pub params_output_variables: Vec<OutputVariable>,
    pub params_learning_rate: f64,
    pub params_seed: u64,
}

impl PrepareBaseModelConfig {
    pub fn validate(&self) -> Result<()> {
        validate_output_variables(&self.params_output_variables)?;

        if !self.params_learning_rate.is_finite() || self.params_learning_rate <= 0.0 {
            return Err(PrepareError::InvalidLearningRate(self.params_learning_rate));
        }

        let size = self.params_image_size;
        if size.height < MIN_SPATIAL_SIZE || size.width < MIN_SPATIAL_SIZE {
            return Err(PrepareError::input_shape(
                size.as_array(),
                format!("height and width must be at least {MIN_SPATIAL_SIZE}"),
            ));
        }
        if size.channels == 0 {
            return Err(PrepareError::input_shape(
                size.as_array(),
                "channels must be at least 1",
            ));
        }
        if matches!(self.params_weights, WeightsSource::Pretrained(_)) && size.channels != 3 {
            return Err(PrepareError::input_shape(
                size.as_array(),
                "pretrained weights require 3 input channels",
            ));
        }
        if self.params_include_top && self.params_classes == 0 {
            return Err(PrepareError::input_shape(
                size.as_array(),
                "include_top requires at least one class",
            ));
        }

        Ok(())
    }
}

/// Rejects an empty head list, empty names and duplicate names.
pub fn validate_output_variables(outputs: &[OutputVariable]) -> Result<()> {
    if outputs.is_empty() {
        return Err(PrepareError::NoOutputVariables);
    }

    let mut seen = HashSet::new();
    for (index, output) in outputs.iter().enumerate() {
        if output.name.trim().is_empty() {
            return Err(PrepareError::EmptyHeadName(index));
        }
        if !seen.insert(output.name.as_str()) {
            return Err(PrepareError::DuplicateHeadName(output.name.clone()));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
struct ConfigFile {
    artifacts_root: PathBuf,
    data_ingestion: DataIngestionConfig,
    prepare_base_model: PrepareBaseModelSection,
}

#[derive(Debug, Clone, Deserialize)]
struct PrepareBaseModelSection {
    root_dir: PathBuf,
    base_model_path: PathBuf,
    updated_base_model_path: PathBuf,
    #[serde(default = "default_weights_dir")]
    weights_dir: PathBuf,
}

fn default_weights_dir() -> PathBuf {
    PathBuf::from("weights")
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
struct ParamsFile {
    image_size: ImageSize,
    #[serde(default)]
    weights: WeightsSource,
    include_top: bool,
    #[serde(default = "default_classes")]
    classes: usize,
    batch_size: usize,
    epochs: usize,
    augmentation: bool,
    output_variables: Vec<OutputVariable>,
    learning_rate: f64,
    #[serde(default = "default_seed")]
    seed: u64,
}

fn default_classes() -> usize {
    1000
}

fn default_seed() -> u64 {
    42
}

/// Builds stage configuration records from `config.json` and `params.json`.
#[derive(Debug, Clone)]
pub struct ConfigurationManager {
    config: ConfigFile,
    params: ParamsFile,
}

impl ConfigurationManager {
    pub fn new(config_path: impl AsRef<Path>, params_path: impl AsRef<Path>) -> Result<Self> {
        let config: ConfigFile = read_json(config_path.as_ref())?;
        let params: ParamsFile = read_json(params_path.as_ref())?;

        create_directories(&[config.artifacts_root.as_path()])?;

        Ok(Self { config, params })
    }

    pub fn get_data_ingestion_config(&self) -> Result<DataIngestionConfig> {
        let config = self.config.data_ingestion.clone();
        create_directories(&[config.root_dir.as_path()])?;
        Ok(config)
    }

    /// Creates the stage directory and returns a validated record.
    pub fn get_prepare_base_model_config(&self) -> Result<PrepareBaseModelConfig> {
        let section = &self.config.prepare_base_model;
        create_directories(&[section.root_dir.as_path()])?;

        let config = PrepareBaseModelConfig {
            root_dir: section.root_dir.clone(),
            base_model_path: section.base_model_path.clone(),
            updated_base_model_path: section.updated_base_model_path.clone(),
            weights_dir: section.weights_dir.clone(),
            params_image_size: self.params.image_size,
            params_weights: self.params.weights.clone(),
            params_include_top: self.params.include_top,
            params_classes: self.params.classes,
            params_batch_size: self.params.batch_size,
            params_epochs: self.params.epochs,
            params_augmentation: self.params.augmentation,
            params_output_variables: self.params.output_variables.clone(),
            params_learning_rate: self.params.learning_rate,
            params_seed: self.params.seed,
        };
        config.validate()?;
        Ok(config)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    debug!(path = %path.display(), "reading configuration");
    let text = fs::read_to_string(path).map_err(|e| PrepareError::io(path, e))?;
    serde_json::from_str(&text).map_err(|e| PrepareError::config(path, e.to_string()))
}

pub fn create_directories(paths: &[&Path]) -> Result<()> {
    for path in paths {
        fs::create_dir_all(path).map_err(|e| PrepareError::io(path, e))?;
        info!(path = %path.display(), "created directory");
    }
    Ok(())
}
