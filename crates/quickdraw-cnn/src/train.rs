use crate::config::TrainingConfig;
use crate::data::{SketchBatcher, SketchDataset, SketchItem};
use crate::error::TrainError;
use crate::model::SketchCnn;
use crate::report::{save_gallery, Evaluation};
use burn::config::Config;
use burn::data::dataloader::batcher::Batcher;
use burn::data::dataloader::DataLoaderBuilder;
use burn::data::dataset::Dataset;
use burn::module::{AutodiffModule, Module};
use burn::optim::{GradientsParams, Optimizer};
use burn::prelude::{Backend, ElementConversion};
use burn::record::CompactRecorder;
use burn::tensor::backend::AutodiffBackend;
use burn::train::ClassificationOutput;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Instant;

pub const CONFIG_FILE: &str = "config.json";
pub const MODEL_FILE: &str = "model";
pub const CHECKPOINT_FILE: &str = "checkpoint";
pub const HISTORY_FILE: &str = "history.json";
pub const EVALUATION_FILE: &str = "evaluation.json";
pub const GALLERY_FILE: &str = "misclassified.png";

/// Files a run writes into the artifact directory, weights with the recorder's extension.
const RUN_FILES: [&str; 6] = [
	"checkpoint.mpk",
	"model.mpk",
	CONFIG_FILE,
	HISTORY_FILE,
	EVALUATION_FILE,
	GALLERY_FILE,
];

/// Clears what a previous run left behind so a stale checkpoint never outlives its run.
/// Anything else in the directory is left alone.
fn create_artifact_dir(artifact_dir: &Path) -> Result<(), TrainError> {
	std::fs::create_dir_all(artifact_dir)?;

	for file in RUN_FILES {
		let path = artifact_dir.join(file);
		if path.is_file() {
			std::fs::remove_file(path)?;
		}
	}
	Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochVerdict {
	/// New best validation loss, weights should be checkpointed.
	Improved,
	NoImprovement,
	/// Patience ran out.
	Stop,
}

/// Tracks the best validation loss and decides when training should give up.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
	patience: usize,
	best: Option<(usize, f64)>,
	stale_epochs: usize,
}

impl EarlyStopping {
	pub fn new(patience: usize) -> Self {
		Self { patience, best: None, stale_epochs: 0 }
	}

	pub fn observe(&mut self, epoch: usize, valid_loss: f64) -> EpochVerdict {
		let improved = match self.best {
			Some((_, best)) => valid_loss < best,
			None => !valid_loss.is_nan(),
		};

		if improved {
			self.best = Some((epoch, valid_loss));
			self.stale_epochs = 0;
			return EpochVerdict::Improved;
		}

		self.stale_epochs += 1;
		if self.stale_epochs >= self.patience {
			EpochVerdict::Stop
		} else {
			EpochVerdict::NoImprovement
		}
	}

	pub fn best_epoch(&self) -> Option<usize> {
		self.best.map(|(epoch, _)| epoch)
	}

	pub fn best_loss(&self) -> Option<f64> {
		self.best.map(|(_, loss)| loss)
	}
}

/// Keeps the weights of the best validation epoch, on disk and in memory.
pub struct BestCheckpoint<B: Backend> {
	path: PathBuf,
	early_stopping: EarlyStopping,
	best: Option<SketchCnn<B>>,
}

impl<B: Backend> BestCheckpoint<B> {
	pub fn new(path: PathBuf, patience: usize) -> Self {
		Self { path, early_stopping: EarlyStopping::new(patience), best: None }
	}

	/// Saves `model` when `valid_loss` is a new best.
	pub fn observe(&mut self, epoch: usize, valid_loss: f64, model: &SketchCnn<B>) -> Result<EpochVerdict, TrainError> {
		let verdict = self.early_stopping.observe(epoch, valid_loss);

		if verdict == EpochVerdict::Improved {
			model.clone().save_file(self.path.clone(), &CompactRecorder::new())?;
			self.best = Some(model.clone());
		}

		Ok(verdict)
	}

	pub fn best_epoch(&self) -> Option<usize> {
		self.early_stopping.best_epoch()
	}

	/// The best weights seen, or `last` when no epoch ever improved.
	pub fn restore(self, last: SketchCnn<B>) -> SketchCnn<B> {
		match self.best {
			Some(best) => {
				info!("Restoring weights from epoch {:?}", self.early_stopping.best_epoch());
				best
			}
			None => last,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochStats {
	pub epoch: usize,
	pub train_loss: f64,
	pub train_accuracy: f64,
	pub valid_loss: f64,
	pub valid_accuracy: f64,
	pub checkpointed: bool,
}

#[derive(Debug, Default)]
struct Totals {
	loss: f64,
	correct: usize,
	seen: usize,
}

impl Totals {
	fn add<B: Backend>(&mut self, output: &ClassificationOutput<B>) {
		let batch_size = output.targets.dims()[0];
		let loss = output.loss.clone().into_scalar().elem::<f64>();
		let correct = output.output.clone()
			.argmax(1)
			.flatten::<1>(0, 1)
			.equal(output.targets.clone())
			.int()
			.sum()
			.into_scalar()
			.elem::<i64>();

		self.loss += loss * batch_size as f64;
		self.correct += correct as usize;
		self.seen += batch_size;
	}

	fn mean_loss(&self) -> f64 {
		self.loss / self.seen.max(1) as f64
	}

	fn accuracy(&self) -> f64 {
		self.correct as f64 / self.seen.max(1) as f64
	}
}

pub struct TrainedModel<B: AutodiffBackend> {
	pub model: SketchCnn<B>,
	pub history: Vec<EpochStats>,
	pub best_epoch: Option<usize>,
}

pub fn artifact_path<P: AsRef<Path>>(artifact_dir: P, file: &str) -> PathBuf {
	artifact_dir.as_ref().join(file)
}

/// Trains from scratch, checkpointing the best weights into `artifact_dir` and returning the
/// model restored to its best validation epoch.
pub fn run<B: AutodiffBackend>(
	artifact_dir: &Path,
	config: &TrainingConfig,
	train: SketchDataset,
	valid: SketchDataset,
	device: B::Device,
) -> Result<TrainedModel<B>, TrainError> {
	if train.is_empty() {
		return Err(TrainError::EmptyPartition("train"));
	}
	if valid.is_empty() {
		return Err(TrainError::EmptyPartition("validation"));
	}
	if config.model.num_classes != config.classes.len() {
		return Err(TrainError::ClassCount { model: config.model.num_classes, classes: config.classes.len() });
	}

	create_artifact_dir(artifact_dir)?;
	config.save(artifact_path(artifact_dir, CONFIG_FILE))?;

	B::seed(config.seed);

	let mut model = config.model.init::<B>(&device);
	let mut optim = config.optimizer.init::<B, SketchCnn<B>>();

	let batcher_train = SketchBatcher::<B>::augmented(device.clone());
	let batcher_valid = SketchBatcher::<B::InnerBackend>::new(device.clone());

	let dataloader_train = DataLoaderBuilder::new(batcher_train)
		.batch_size(config.batch_size)
		.shuffle(config.seed)
		.num_workers(config.num_workers)
		.build(train);

	let dataloader_valid = DataLoaderBuilder::new(batcher_valid)
		.batch_size(config.batch_size)
		.num_workers(config.num_workers)
		.build(valid);

	let mut checkpoint = BestCheckpoint::new(artifact_path(artifact_dir, CHECKPOINT_FILE), config.patience);
	let mut history = Vec::with_capacity(config.num_epochs);

	let now = Instant::now();
	for epoch in 1..=config.num_epochs {
		let mut train_totals = Totals::default();

		for batch in dataloader_train.iter() {
			let output = model.forward_classification(batch);
			train_totals.add(&output);

			let grads = output.loss.backward();
			let grads = GradientsParams::from_grads(grads, &model);
			model = optim.step(config.learning_rate, model, grads);
		}

		let valid_model = model.valid();
		let mut valid_totals = Totals::default();

		for batch in dataloader_valid.iter() {
			valid_totals.add(&valid_model.forward_classification(batch));
		}

		let verdict = checkpoint.observe(epoch, valid_totals.mean_loss(), &model)?;
		let checkpointed = verdict == EpochVerdict::Improved;

		let stats = EpochStats {
			epoch,
			train_loss: train_totals.mean_loss(),
			train_accuracy: train_totals.accuracy(),
			valid_loss: valid_totals.mean_loss(),
			valid_accuracy: valid_totals.accuracy(),
			checkpointed,
		};
		info!(
			"Epoch {}/{}, Loss {:.4}, Acc {:.4}, Val Loss {:.4}, Val Acc {:.4}{}",
			epoch,
			config.num_epochs,
			stats.train_loss,
			stats.train_accuracy,
			stats.valid_loss,
			stats.valid_accuracy,
			if checkpointed { " (checkpoint saved)" } else { "" }
		);
		history.push(stats);

		if verdict == EpochVerdict::Stop {
			info!("Validation loss has not improved for {} epochs, stopping early", config.patience);
			break;
		}
	}

	let elapsed = now.elapsed().as_secs();
	info!("Training completed in {}m{}s", (elapsed / 60), elapsed % 60);

	let best_epoch = checkpoint.best_epoch();
	let model = checkpoint.restore(model);

	model
		.clone()
		.save_file(artifact_path(artifact_dir, MODEL_FILE), &CompactRecorder::new())?;
	serde_json::to_writer_pretty(File::create(artifact_path(artifact_dir, HISTORY_FILE))?, &history)?;

	Ok(TrainedModel {
		model,
		history,
		best_epoch,
	})
}

/// Predicted label for every item, in dataset order.
pub fn predict_labels<B: Backend>(model: &SketchCnn<B>, dataset: &SketchDataset, batch_size: usize, device: &B::Device) -> Vec<usize> {
	let batcher = SketchBatcher::<B>::new(device.clone());

	dataset.data
		.chunks(batch_size.max(1))
		.flat_map(|chunk| {
			let batch = batcher.batch(chunk.to_vec());
			model
				.forward(batch.images)
				.argmax(1)
				.flatten::<1>(0, 1)
				.into_data()
				.iter::<i64>()
				.map(|label| label as usize)
				.collect::<Vec<_>>()
		})
		.collect()
}

/// Scores the model on the held out partition, logs the report and writes `evaluation.json`
/// together with a gallery of misclassified drawings.
pub fn evaluate<B: Backend>(
	artifact_dir: &Path,
	config: &TrainingConfig,
	model: &SketchCnn<B>,
	test: &SketchDataset,
	device: &B::Device,
) -> Result<Evaluation, TrainError> {
	if test.is_empty() {
		return Err(TrainError::EmptyPartition("test"));
	}
	if config.model.num_classes != config.classes.len() {
		return Err(TrainError::ClassCount { model: config.model.num_classes, classes: config.classes.len() });
	}

	let truth: Vec<usize> = test.data.iter().map(|item| item.label).collect();
	if let Some(&label) = truth.iter().find(|&&label| label >= config.classes.len()) {
		return Err(TrainError::UnknownLabel { label, classes: config.classes.len() });
	}

	let predicted = predict_labels(model, test, config.batch_size, device);

	let evaluation = Evaluation::new(&truth, &predicted, &config.classes, config.gallery_size);
	info!("Test accuracy: {:.4}", evaluation.report.accuracy);
	info!("Classification report:\n{}", evaluation.report);
	info!("{} of {} test drawings were misclassified", evaluation.total_misclassified, truth.len());

	for mistake in &evaluation.gallery {
		info!("#{}: true {}, predicted {}", mistake.index, mistake.actual, mistake.predicted);
	}

	if evaluation.gallery.is_empty() {
		warn!("No misclassified drawings, skipping gallery");
	} else {
		let samples: Vec<&SketchItem> = evaluation.gallery.iter().map(|mistake| &test.data[mistake.index]).collect();
		save_gallery(&samples, artifact_path(artifact_dir, GALLERY_FILE))?;
	}

	evaluation.save(artifact_path(artifact_dir, EVALUATION_FILE))?;
	Ok(evaluation)
}
