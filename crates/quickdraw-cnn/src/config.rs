use burn::config::Config;
use burn::optim::AdamConfig;

use crate::error::PipelineError;
use crate::model::SketchCnnConfig;

pub const QUICKDRAW_BASE_URL: &str = "https://storage.googleapis.com/quickdraw_dataset/full/numpy_bitmap/";

pub const DEFAULT_CLASSES: [&str; 10] = [
	"The Eiffel Tower",
	"The Mona Lisa",
	"airplane",
	"angel",
	"car",
	"cat",
	"elephant",
	"mountain",
	"star",
	"whale",
];

pub fn default_classes() -> Vec<String> {
	DEFAULT_CLASSES.iter().map(|class| class.to_string()).collect()
}

/// Where the per-class arrays live and how they are cut into partitions.
#[derive(Config, Debug)]
pub struct DatasetConfig {
	pub classes: Vec<String>,
	#[config(default = "String::from(\"quickdraw_npy\")")]
	pub data_dir: String,
	#[config(default = "String::from(QUICKDRAW_BASE_URL)")]
	pub base_url: String,
	#[config(default = 115_000)]
	pub samples_per_class: usize,
	#[config(default = 0.6)]
	pub train_ratio: f64,
	#[config(default = 0.2)]
	pub valid_ratio: f64,
	#[config(default = 42)]
	pub seed: u64,
}

#[derive(Config)]
pub struct TrainingConfig {
	pub model: SketchCnnConfig,
	pub optimizer: AdamConfig,
	/// Index position is the integer label the model is trained on.
	pub classes: Vec<String>,
	#[config(default = 3)]
	pub num_epochs: usize,
	#[config(default = 128)]
	pub batch_size: usize,
	#[config(default = 4)]
	pub num_workers: usize,
	#[config(default = 42)]
	pub seed: u64,
	#[config(default = 1.0e-3)]
	pub learning_rate: f64,
	#[config(default = 3)]
	pub patience: usize,
	#[config(default = 16)]
	pub gallery_size: usize,
}

/// Everything the command line stages need, loadable from a single json file.
#[derive(Config)]
pub struct PipelineConfig {
	pub dataset: DatasetConfig,
	pub training: TrainingConfig,
	#[config(default = "String::from(\"artifacts\")")]
	pub artifact_dir: String,
}

impl PipelineConfig {
	pub fn from_classes(classes: Vec<String>) -> Self {
		let training = TrainingConfig::new(
			SketchCnnConfig::new(classes.len()),
			AdamConfig::new(),
			classes.clone(),
		);

		Self::new(DatasetConfig::new(classes), training)
	}

	pub fn quickdraw() -> Self {
		Self::from_classes(default_classes())
	}

	/// Labels are assigned in dataset class order, so the names persisted for training and the
	/// model's output count have to line up with it exactly.
	pub fn validate(&self) -> Result<(), PipelineError> {
		if self.dataset.classes != self.training.classes {
			return Err(PipelineError::ClassMismatch {
				dataset: self.dataset.classes.clone(),
				training: self.training.classes.clone(),
			});
		}

		if self.training.model.num_classes != self.training.classes.len() {
			return Err(PipelineError::ClassCount {
				model: self.training.model.num_classes,
				classes: self.training.classes.len(),
			});
		}

		Ok(())
	}
}
