use std::path::PathBuf;

use anyhow::{Context, Result};
use bmi_model::{checkpoint, ConfigurationManager, PrepareBaseModel};
use burn::backend::{ndarray::NdArrayDevice, NdArray};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

type Backend = NdArray<f32>;

#[derive(Parser)]
#[command(name = "bmi-model")]
#[command(about = "Prepare a transfer-learning base model with regression and binary heads", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the backbone, attach the heads, compile and save both artifacts
    PrepareBaseModel {
        /// Artifact layout file
        #[arg(long, value_name = "FILE", default_value = "config/config.json")]
        config: PathBuf,

        /// Hyperparameter file
        #[arg(long, value_name = "FILE", default_value = "params.json")]
        params: PathBuf,
    },
    /// Print the summary of a saved compiled model
    Summary {
        /// Path of the saved model (record or manifest)
        #[arg(value_name = "FILE")]
        model: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let device = NdArrayDevice::default();

    match cli.command {
        Commands::PrepareBaseModel { config, params } => {
            info!(">>>>>> stage Prepare base model started <<<<<<");
            let manager = ConfigurationManager::new(&config, &params)
                .with_context(|| format!("loading {} and {}", config.display(), params.display()))?;
            let stage_config = manager
                .get_prepare_base_model_config()
                .context("building prepare_base_model configuration")?;

            PrepareBaseModel::<Backend>::new(stage_config, device)
                .run()
                .context("preparing base model")?;
            info!(">>>>>> stage Prepare base model completed <<<<<<");
        }
        Commands::Summary { model } => {
            let compiled = checkpoint::load_compiled_model::<Backend>(&model, &device)
                .with_context(|| format!("loading {}", model.display()))?;
            let title = model
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| "model".to_string());
            println!("{}", compiled.summary(&title));
        }
    }

    Ok(())
}
