use std::path::Path;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::{Backend, ElementConversion, Int};
use burn::tensor::Tensor;
use log::info;
use ndarray::{s, Array2};
use ndarray_npy::read_npy;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{thread_rng, Rng, SeedableRng};
use rayon::prelude::*;

use crate::augment::preprocess;
use crate::config::DatasetConfig;
use crate::error::DatasetError;
use crate::fetch::array_path;

pub const SIDE_LENGTH: usize = 28;
pub const PIXELS: usize = SIDE_LENGTH * SIDE_LENGTH;

/// One drawing, row-major and already scaled into `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SketchItem {
	pub pixels: Vec<f32>,
	pub label: usize,
}

pub fn normalize_intensity(value: u8) -> f32 {
	value as f32 / 255.0
}

pub fn load_class_array<P: AsRef<Path>>(dir: P, class: &str) -> Result<Array2<u8>, DatasetError> {
	let path = array_path(dir, class);
	if !path.exists() {
		return Err(DatasetError::MissingClassFile { class: class.to_string(), path });
	}

	let array: Array2<u8> = read_npy(&path)?;
	if array.ncols() != PIXELS {
		return Err(DatasetError::InvalidShape {
			class: class.to_string(),
			width: array.ncols(),
			expected: PIXELS,
		});
	}

	Ok(array)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitRatios {
	pub train: f64,
	pub valid: f64,
}

impl SplitRatios {
	pub fn new(train: f64, valid: f64) -> Result<Self, DatasetError> {
		if train < 0.0 || valid < 0.0 || train + valid > 1.0 {
			return Err(DatasetError::InvalidSplit { train, valid });
		}

		Ok(Self { train, valid })
	}

	/// End of the train range and end of the validation range for `len` samples.
	pub fn boundaries(&self, len: usize) -> (usize, usize) {
		let train_end = ((len as f64 * self.train) as usize).min(len);
		let valid_end = ((len as f64 * (self.train + self.valid)) as usize).clamp(train_end, len);

		(train_end, valid_end)
	}
}

#[derive(Debug, Clone)]
pub struct Partitions {
	pub train: SketchDataset,
	pub valid: SketchDataset,
	pub test: SketchDataset,
}

/// Every loaded sample across all classes, before partitioning.
#[derive(Debug, Clone)]
pub struct SketchCorpus {
	items: Vec<SketchItem>,
}

impl SketchCorpus {
	pub fn from_arrays(arrays: Vec<Array2<u8>>, samples_per_class: usize) -> Self {
		let size = arrays.iter().map(|array| array.nrows().min(samples_per_class)).sum();
		let mut items = Vec::with_capacity(size);

		for (label, array) in arrays.into_iter().enumerate() {
			let rows = array.nrows().min(samples_per_class);

			for row in array.slice(s![..rows, ..]).rows() {
				items.push(SketchItem {
					pixels: row.iter().copied().map(normalize_intensity).collect(),
					label,
				});
			}
		}

		Self { items }
	}

	pub fn load(config: &DatasetConfig) -> Result<Self, DatasetError> {
		let arrays = config.classes
			.par_iter()
			.map(|class| load_class_array(&config.data_dir, class))
			.collect::<Result<Vec<_>, _>>()?;

		for (class, array) in config.classes.iter().zip(arrays.iter()) {
			info!("Loaded {} drawings of {class}", array.nrows().min(config.samples_per_class));
		}

		let corpus = Self::from_arrays(arrays, config.samples_per_class);
		if corpus.is_empty() {
			return Err(DatasetError::Empty);
		}

		Ok(corpus)
	}

	pub fn len(&self) -> usize {
		self.items.len()
	}

	pub fn is_empty(&self) -> bool {
		self.items.is_empty()
	}

	pub fn items(&self) -> &[SketchItem] {
		&self.items
	}

	/// Samples carry their own label, so one permutation moves both together.
	pub fn shuffle<R: Rng>(&mut self, rng: &mut R) {
		self.items.shuffle(rng);
	}

	pub fn split(self, ratios: SplitRatios) -> Partitions {
		let (train_end, valid_end) = ratios.boundaries(self.items.len());

		let mut items = self.items;
		let test = items.split_off(valid_end);
		let valid = items.split_off(train_end);

		Partitions {
			train: SketchDataset::new(items),
			valid: SketchDataset::new(valid),
			test: SketchDataset::new(test),
		}
	}
}

/// Loads, shuffles with the configured seed and partitions the dataset described by `config`.
pub fn assemble(config: &DatasetConfig) -> Result<Partitions, DatasetError> {
	let ratios = SplitRatios::new(config.train_ratio, config.valid_ratio)?;

	let mut corpus = SketchCorpus::load(config)?;
	corpus.shuffle(&mut StdRng::seed_from_u64(config.seed));

	let partitions = corpus.split(ratios);
	info!(
		"Partitions: {} train, {} valid, {} test",
		partitions.train.len(),
		partitions.valid.len(),
		partitions.test.len()
	);

	Ok(partitions)
}

#[derive(Debug, Clone, Default)]
pub struct SketchDataset {
	pub data: Vec<SketchItem>,
}

impl SketchDataset {
	pub fn new(data: Vec<SketchItem>) -> Self {
		Self { data }
	}
}

impl Dataset<SketchItem> for SketchDataset {
	fn get(&self, index: usize) -> Option<SketchItem> {
		self.data.get(index).cloned()
	}

	fn len(&self) -> usize {
		self.data.len()
	}
}

#[derive(Clone)]
pub struct SketchBatcher<B: Backend> {
	device: B::Device,
	augment: bool,
}

impl <B: Backend> SketchBatcher<B> {
	pub fn new(device: B::Device) -> Self {
		Self { device, augment: false }
	}

	/// Batcher for the training partition, re-drawing augmentations on every batch.
	pub fn augmented(device: B::Device) -> Self {
		Self { device, augment: true }
	}
}

#[derive(Debug, Clone)]
pub struct SketchBatch<B: Backend> {
	pub images: Tensor<B, 4>,
	pub targets: Tensor<B, 1, Int>,
}

impl <B: Backend> Batcher<SketchItem, SketchBatch<B>> for SketchBatcher<B> {
	fn batch(&self, items: Vec<SketchItem>) -> SketchBatch<B> {
		let mut rng = thread_rng();

		let images = items
			.iter()
			.map(|item| preprocess(&item.pixels, self.augment, &mut rng))
			.map(|data| Tensor::<B, 3>::from_data(data.convert::<B::FloatElem>(), &self.device))
			.collect();

		let targets = items
			.iter()
			.map(|item| {
				Tensor::<B, 1, Int>::from_data(
					[(item.label as i64).elem::<B::IntElem>()],
					&self.device,
				)
			})
			.collect();

		let images = Tensor::stack(images, 0);
		let targets = Tensor::cat(targets, 0);

		SketchBatch {
			images,
			targets,
		}
	}
}
