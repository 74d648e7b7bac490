use std::path::PathBuf;

use burn::config::ConfigError;
use burn::record::RecorderError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
	#[error("Std IO error")]
	StdIoError(#[from] std::io::Error),
	#[error("Invalid dataset url: {0}")]
	InvalidUrl(#[from] url::ParseError),
	#[error("Dataset url cannot hold a class name: {0}")]
	UnusableBaseUrl(String),
	#[error("HTTP request failed: {0}")]
	Http(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum DatasetError {
	#[error("Std IO error")]
	StdIoError(#[from] std::io::Error),
	#[error("Missing array file for class {class:?} at {path}")]
	MissingClassFile { class: String, path: PathBuf },
	#[error("Could not read array file: {0}")]
	Npy(#[from] ndarray_npy::ReadNpyError),
	#[error("Array for class {class:?} has rows of {width} values, expected {expected}")]
	InvalidShape { class: String, width: usize, expected: usize },
	#[error("No samples were loaded")]
	Empty,
	#[error("Split ratios {train} / {valid} do not fit in the unit interval")]
	InvalidSplit { train: f64, valid: f64 },
}

#[derive(Debug, Error)]
pub enum PipelineError {
	#[error("Dataset classes {dataset:?} and training classes {training:?} differ")]
	ClassMismatch { dataset: Vec<String>, training: Vec<String> },
	#[error("Model has {model} outputs but {classes} classes are configured")]
	ClassCount { model: usize, classes: usize },
}

#[derive(Debug, Error)]
pub enum TrainError {
	#[error("Std IO error")]
	StdIoError(#[from] std::io::Error),
	#[error("Could not write artifact: {0}")]
	Json(#[from] serde_json::Error),
	#[error("Could not persist weights: {0:?}")]
	Recorder(RecorderError),
	#[error("The {0} partition is empty")]
	EmptyPartition(&'static str),
	#[error("Could not render gallery: {0}")]
	Image(#[from] image::ImageError),
	#[error("Model has {model} outputs but {classes} class names were given")]
	ClassCount { model: usize, classes: usize },
	#[error("Label {label} has no name among {classes} classes")]
	UnknownLabel { label: usize, classes: usize },
}

impl From<RecorderError> for TrainError {
	fn from(err: RecorderError) -> Self {
		TrainError::Recorder(err)
	}
}

#[derive(Debug, Error)]
pub enum ClassifierError {
	#[error("Could not read training config: {0:?}")]
	Config(ConfigError),
	#[error("Could not load model weights: {0:?}")]
	Recorder(RecorderError),
	#[error("Model has {model} outputs but {classes} class names were given")]
	ClassCount { model: usize, classes: usize },
	#[error("Class list {expected:?} does not match the list the model was trained with {persisted:?}")]
	ClassMismatch { expected: Vec<String>, persisted: Vec<String> },
	#[error("Could not decode image: {0}")]
	Image(#[from] image::ImageError),
	#[error("Could not read model output: {0}")]
	Tensor(String),
}

impl From<ConfigError> for ClassifierError {
	fn from(err: ConfigError) -> Self {
		ClassifierError::Config(err)
	}
}

impl From<RecorderError> for ClassifierError {
	fn from(err: RecorderError) -> Self {
		ClassifierError::Recorder(err)
	}
}
