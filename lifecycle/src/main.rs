// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Sensor fault model pipeline CLI
//!
//! Usage:
//!   sensor-pipeline run --config pipeline.yaml
//!   sensor-pipeline transform
//!   sensor-pipeline train --run-dir artifact/05_01_2024_12_00_00
//!   sensor-pipeline evaluate --run-dir artifact/05_01_2024_12_00_00 --promote
//!   sensor-pipeline models
//!
//! Exits with status 2 when a quality gate rejects the model.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use sensor_lifecycle::artifact::{DataTransformationArtifact, ModelTrainerArtifact};
use sensor_lifecycle::pipeline::{STAGE_DATA_TRANSFORMATION, STAGE_MODEL_TRAINER};
use sensor_lifecycle::{ModelResolver, PipelineConfig, RunLayout, StageError, TrainingPipeline};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

const REJECTED_EXIT_CODE: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "sensor-pipeline")]
#[command(about = "Train, evaluate and promote the sensor fault model")]
#[command(version)]
struct Cli {
    /// Pipeline configuration (YAML); defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run transformation, training, evaluation and promotion
    Run {
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Fit the preprocessor and write transformed arrays for a new run
    Transform,
    /// Train on the transformed arrays of an existing run
    Train {
        #[arg(long)]
        run_dir: PathBuf,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Evaluate the trained model of an existing run
    Evaluate {
        #[arg(long)]
        run_dir: PathBuf,
        /// Copy the model into the saved model store when accepted
        #[arg(long)]
        promote: bool,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// List saved model versions
    Models,
}

#[derive(Args, Debug)]
struct Overrides {
    /// Minimum train f1 (exclusive)
    #[arg(long)]
    expected_accuracy: Option<f64>,

    /// Largest tolerated train/test f1 gap
    #[arg(long)]
    overfitting_underfitting_threshold: Option<f64>,

    /// Margin a new model must beat the best model by
    #[arg(long)]
    change_threshold: Option<f64>,

    /// Tracking URI (file://, http:// or https://)
    #[arg(long)]
    tracking_uri: Option<String>,
}

impl Overrides {
    fn apply(self, config: &mut PipelineConfig) {
        if let Some(v) = self.expected_accuracy {
            config.trainer.expected_accuracy = v;
        }
        if let Some(v) = self.overfitting_underfitting_threshold {
            config.trainer.overfitting_underfitting_threshold = v;
        }
        if let Some(v) = self.change_threshold {
            config.evaluation.change_threshold = v;
        }
        if let Some(uri) = self.tracking_uri {
            config.tracking.tracking_uri = Some(uri);
        }
    }
}

/// Map a stage outcome to an exit code; rejections are not errors
fn finish<T>(result: Result<T, StageError>, report: impl FnOnce(T) -> Result<()>) -> Result<ExitCode> {
    match result {
        Ok(value) => {
            report(value)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(StageError::Rejected(rejection)) => {
            tracing::warn!("Model rejected: {}", rejection);
            println!("\nModel rejected: {}", rejection);
            Ok(ExitCode::from(REJECTED_EXIT_CODE))
        }
        Err(StageError::Failed(failure)) => Err(anyhow::Error::new(failure).context("Pipeline stage failed")),
    }
}

fn resumed(config: PipelineConfig, run_dir: PathBuf) -> Result<TrainingPipeline> {
    let run = RunLayout::at(run_dir, chrono::Utc::now());
    TrainingPipeline::new(config, run).context("Failed to set up experiment tracking")
}

fn main() -> Result<ExitCode> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = PipelineConfig::load_or_default(cli.config.as_deref())?;
    config.tracking = config.tracking.with_overrides(|key| std::env::var(key).ok());

    match cli.command {
        Command::Run { overrides } => {
            overrides.apply(&mut config);
            config.validate()?;

            let pipeline = TrainingPipeline::new(config.clone(), config.new_run(chrono::Utc::now()))
                .context("Failed to set up experiment tracking")?;

            finish(pipeline.run(), |run| {
                let saved = run.save(&run.artifact_dir)?;
                println!("\n{}", run.to_markdown());
                if let Some(path) = saved.last() {
                    println!("Run summary saved to: {}", path.display());
                }
                Ok(())
            })
        }

        Command::Transform => {
            let pipeline = TrainingPipeline::new(config.clone(), config.new_run(chrono::Utc::now()))
                .context("Failed to set up experiment tracking")?;

            finish(pipeline.start_data_transformation(), |artifact| {
                println!("Run directory: {}", pipeline.run_layout().artifact_dir.display());
                println!("Train array:   {}", artifact.transformed_train_file_path.display());
                println!("Test array:    {}", artifact.transformed_test_file_path.display());
                println!("Preprocessor:  {}", artifact.transformed_object_file_path.display());
                Ok(())
            })
        }

        Command::Train { run_dir, overrides } => {
            overrides.apply(&mut config);
            config.validate()?;
            let pipeline = resumed(config, run_dir)?;

            let transformation: DataTransformationArtifact = pipeline
                .load_stage_artifact(STAGE_DATA_TRANSFORMATION)
                .context("Run has no data transformation artifact; run `transform` first")?;

            finish(pipeline.start_model_trainer(&transformation), |artifact| {
                println!("Trained model: {}", artifact.trained_model_file_path.display());
                println!("\nTrain:\n{}", artifact.train_metric_artifact.format());
                println!("Test:\n{}", artifact.test_metric_artifact.format());
                Ok(())
            })
        }

        Command::Evaluate {
            run_dir,
            promote,
            overrides,
        } => {
            overrides.apply(&mut config);
            config.validate()?;
            let pipeline = resumed(config, run_dir)?;

            let trainer: ModelTrainerArtifact = pipeline
                .load_stage_artifact(STAGE_MODEL_TRAINER)
                .context("Run has no model trainer artifact; run `train` first")?;

            let outcome = pipeline.start_model_evaluation(&trainer).and_then(|evaluation| {
                let promoted = if promote {
                    pipeline.start_model_promotion(&evaluation)?
                } else {
                    None
                };
                Ok((evaluation, promoted))
            });

            finish(outcome, |(evaluation, promoted)| {
                println!("Accepted: {}", evaluation.is_model_accepted);
                match evaluation.improved_accuracy {
                    Some(improved) => println!("F1 improvement: {:+.4}", improved),
                    None => println!("No best model existed; accepted as the first model"),
                }
                if let Some(path) = promoted {
                    println!("Promoted to: {}", path.display());
                }
                Ok(())
            })
        }

        Command::Models => {
            let resolver = ModelResolver::new(&config.saved_model_dir);
            let versions = resolver.versions()?;

            if versions.is_empty() {
                println!("No saved models in {}", resolver.model_dir().display());
                return Ok(ExitCode::SUCCESS);
            }

            println!("{:<15} {}", "Version", "Path");
            println!("{:-<70}", "");
            for version in &versions {
                println!("{:<15} {}", version, resolver.model_path(*version).display());
            }
            println!("{:-<70}", "");
            println!("Best: {}", resolver.get_best_model_path()?.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}
