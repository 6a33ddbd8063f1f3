// src/checkpoint.rs

use std::fs;
use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::prelude::Backend;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::efficientnet::{BackboneConfig, EfficientNetB0};
use crate::error::{PrepareError, Result};
use crate::model::{CompileSpec, CompiledModel};

/// Recorder used for every artifact. Full precision keeps weights bit-exact.
pub type ModelRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

pub const RECORD_EXTENSION: &str = "mpk";
pub const MANIFEST_EXTENSION: &str = "json";

const MANIFEST_VERSION: u32 = 1;

/// Architecture and compile settings stored next to a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelManifest {
    pub format_version: u32,
    pub backbone: BackboneConfig,
    /// Absent for a bare backbone.
    pub compile: Option<CompileSpec>,
}

impl ModelManifest {
    pub fn backbone(backbone: BackboneConfig) -> Self {
        Self {
            format_version: MANIFEST_VERSION,
            backbone,
            compile: None,
        }
    }

    pub fn compiled(backbone: BackboneConfig, compile: CompileSpec) -> Self {
        Self {
            format_version: MANIFEST_VERSION,
            backbone,
            compile: Some(compile),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub record: PathBuf,
    pub manifest: PathBuf,
}

impl ArtifactPaths {
    pub fn for_path(path: &Path) -> Self {
        Self {
            record: path.with_extension(RECORD_EXTENSION),
            manifest: path.with_extension(MANIFEST_EXTENSION),
        }
    }
}

/// Writes `model`'s record and its manifest, overwriting existing files.
pub fn save_model<B, M>(path: &Path, model: &M, manifest: &ModelManifest) -> Result<ArtifactPaths>
where
    B: Backend,
    M: Module<B>,
{
    let paths = ArtifactPaths::for_path(path);
    if let Some(parent) = paths.record.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| PrepareError::io(parent, e))?;
    }

    model
        .clone()
        .save_file(paths.record.clone(), &ModelRecorder::new())
        .map_err(|e| PrepareError::recorder(&paths.record, e))?;

    let json = serde_json::to_string_pretty(manifest)?;
    fs::write(&paths.manifest, json).map_err(|e| PrepareError::io(&paths.manifest, e))?;

    info!(
        record = %paths.record.display(),
        manifest = %paths.manifest.display(),
        "model saved"
    );
    Ok(paths)
}

pub fn save_backbone<B: Backend>(
    path: &Path,
    backbone: &EfficientNetB0<B>,
    config: BackboneConfig,
) -> Result<ArtifactPaths> {
    save_model::<B, _>(path, backbone, &ModelManifest::backbone(config))
}

pub fn save_compiled_model<B: Backend>(
    path: &Path,
    model: &CompiledModel<B>,
) -> Result<ArtifactPaths> {
    let manifest = ModelManifest::compiled(model.backbone_config, model.compile.clone());
    save_model::<B, _>(path, &model.model, &manifest)
}

pub fn load_manifest(path: &Path) -> Result<ModelManifest> {
    let manifest_path = path.with_extension(MANIFEST_EXTENSION);
    let text = fs::read_to_string(&manifest_path).map_err(|e| PrepareError::io(&manifest_path, e))?;
    Ok(serde_json::from_str(&text)?)
}

/// Loads a record file into an already-built backbone.
pub fn load_backbone_weights<B: Backend>(
    backbone: EfficientNetB0<B>,
    record: &Path,
    device: &B::Device,
) -> Result<EfficientNetB0<B>> {
    if !record.exists() {
        return Err(PrepareError::io(
            record,
            std::io::Error::new(std::io::ErrorKind::NotFound, "record file not found"),
        ));
    }
    debug!(record = %record.display(), "loading backbone weights");
    backbone
        .load_file(record.to_path_buf(), &ModelRecorder::new(), device)
        .map_err(|e| PrepareError::recorder(record, e))
}

pub fn load_backbone<B: Backend>(
    path: &Path,
    device: &B::Device,
) -> Result<(EfficientNetB0<B>, BackboneConfig)> {
    let manifest = load_manifest(path)?;
    let backbone = manifest.backbone.init(device);
    let backbone = load_backbone_weights(backbone, &path.with_extension(RECORD_EXTENSION), device)?;
    Ok((backbone, manifest.backbone))
}

/// Rebuilds a compiled model from its manifest and record.
pub fn load_compiled_model<B: Backend>(path: &Path, device: &B::Device) -> Result<CompiledModel<B>> {
    let manifest = load_manifest(path)?;
    let compile = manifest.compile.ok_or_else(|| {
        PrepareError::config(
            &path.with_extension(MANIFEST_EXTENSION),
            "manifest describes a bare backbone, not a compiled model",
        )
    })?;

    let CompiledModel {
        model,
        backbone_config,
        compile,
    } = CompiledModel::compile(
        manifest.backbone.init(device),
        manifest.backbone,
        &compile.outputs,
        compile.optimizer.learning_rate(),
        device,
    )?;

    let record = path.with_extension(RECORD_EXTENSION);
    let model = model
        .load_file(record.clone(), &ModelRecorder::new(), device)
        .map_err(|e| PrepareError::recorder(&record, e))?;

    Ok(CompiledModel {
        model,
        backbone_config,
        compile,
    })
}
