use std::path::Path;

use burn::config::Config;
use burn::module::Module;
use burn::prelude::Backend;
use burn::record::CompactRecorder;
use burn::tensor::{Tensor, TensorData};
use image::imageops::{self, FilterType};
use image::DynamicImage;
use log::info;

use crate::config::TrainingConfig;
use crate::data::{normalize_intensity, SIDE_LENGTH};
use crate::error::ClassifierError;
use crate::model::SketchCnn;
use crate::train::{artifact_path, CONFIG_FILE, MODEL_FILE};

/// Mean intensity above which an image is taken to be dark strokes on a light background.
pub const INVERSION_THRESHOLD: f32 = 127.0;

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
	pub index: usize,
	pub label: String,
	/// Softmax output, indexed like the class list.
	pub probabilities: Vec<f32>,
}

impl Prediction {
	/// Winning probability as a percentage.
	pub fn confidence(&self) -> f32 {
		self.probabilities[self.index] * 100.0
	}

	pub fn confidence_percent(&self) -> String {
		format_percent(self.probabilities[self.index])
	}

	/// Every class with its probability, in class list order.
	pub fn breakdown<'a>(&self, classes: &'a [String]) -> Vec<(&'a str, f32)> {
		classes
			.iter()
			.map(String::as_str)
			.zip(self.probabilities.iter().copied())
			.collect()
	}
}

pub fn format_percent(probability: f32) -> String {
	format!("{:.2}%", probability * 100.0)
}

pub fn needs_inversion(pixels: &[u8]) -> bool {
	let mean = pixels.iter().map(|&value| value as f32).sum::<f32>() / pixels.len().max(1) as f32;
	mean > INVERSION_THRESHOLD
}

/// Grayscale, 28x28 and light strokes on dark, scaled to `[0, 1]` the way the training arrays are.
pub fn prepare_image(image: &DynamicImage) -> Vec<f32> {
	let side = SIDE_LENGTH as u32;
	let gray = image.to_luma8();
	let mut pixels = imageops::resize(&gray, side, side, FilterType::CatmullRom).into_raw();

	if needs_inversion(&pixels) {
		pixels.iter_mut().for_each(|value| *value = 255 - *value);
	}

	pixels.into_iter().map(normalize_intensity).collect()
}

/// A trained model paired with the class names its outputs stand for.
pub struct Classifier<B: Backend> {
	model: SketchCnn<B>,
	classes: Vec<String>,
	device: B::Device,
}

impl<B: Backend> Classifier<B> {
	pub fn new(model: SketchCnn<B>, classes: Vec<String>, device: B::Device) -> Self {
		Self { model, classes, device }
	}

	/// Rebuilds the model from `config.json` and `model.mpk`. When `expected_classes` is given it
	/// has to equal the list the model was trained with.
	pub fn load<P: AsRef<Path>>(
		artifact_dir: P,
		device: B::Device,
		expected_classes: Option<&[String]>,
	) -> Result<Self, ClassifierError> {
		let artifact_dir = artifact_dir.as_ref();
		let config = TrainingConfig::load(artifact_path(artifact_dir, CONFIG_FILE))?;

		if config.classes.len() != config.model.num_classes {
			return Err(ClassifierError::ClassCount {
				model: config.model.num_classes,
				classes: config.classes.len(),
			});
		}

		if let Some(expected) = expected_classes {
			if expected != config.classes.as_slice() {
				return Err(ClassifierError::ClassMismatch {
					expected: expected.to_vec(),
					persisted: config.classes,
				});
			}
		}

		let model = config
			.model
			.init::<B>(&device)
			.load_file(artifact_path(artifact_dir, MODEL_FILE), &CompactRecorder::new(), &device)?;

		info!("Loaded model from {} with classes {:?}", artifact_dir.display(), config.classes);
		Ok(Self::new(model, config.classes, device))
	}

	pub fn classes(&self) -> &[String] {
		&self.classes
	}

	pub fn model(&self) -> &SketchCnn<B> {
		&self.model
	}

	pub fn device(&self) -> &B::Device {
		&self.device
	}

	pub fn predict_bytes(&self, bytes: &[u8]) -> Result<Prediction, ClassifierError> {
		let image = image::load_from_memory(bytes)?;
		self.predict_image(&image)
	}

	pub fn predict_image(&self, image: &DynamicImage) -> Result<Prediction, ClassifierError> {
		self.predict_pixels(&prepare_image(image))
	}

	/// Runs a single forward pass over an already prepared 28x28 drawing.
	pub fn predict_pixels(&self, pixels: &[f32]) -> Result<Prediction, ClassifierError> {
		let data = TensorData::new(pixels.to_vec(), [1, 1, SIDE_LENGTH, SIDE_LENGTH]);
		let images = Tensor::<B, 4>::from_data(data.convert::<B::FloatElem>(), &self.device);

		let probabilities = self
			.model
			.probabilities(images)
			.into_data()
			.to_vec::<f32>()
			.map_err(|err| ClassifierError::Tensor(format!("{err:?}")))?;

		if probabilities.len() != self.classes.len() {
			return Err(ClassifierError::ClassCount {
				model: probabilities.len(),
				classes: self.classes.len(),
			});
		}

		let index = probabilities
			.iter()
			.enumerate()
			.max_by(|(_, a), (_, b)| a.total_cmp(b))
			.map(|(index, _)| index)
			.ok_or_else(|| ClassifierError::Tensor("Model produced no scores".to_string()))?;

		Ok(Prediction {
			index,
			label: self.classes[index].clone(),
			probabilities,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::SketchCnnConfig;
	use burn::backend::NdArray;
	use burn::optim::AdamConfig;
	use image::{GrayImage, Luma, Rgb, RgbImage};

	type TestBackend = NdArray;

	fn classes() -> Vec<String> {
		vec!["cat".into(), "star".into(), "whale".into()]
	}

	fn small_model() -> SketchCnnConfig {
		SketchCnnConfig::new(3).with_channels([2, 2, 2]).with_hidden_size(4)
	}

	fn save_artifacts(dir: &Path, classes: Vec<String>) {
		let device = Default::default();
		let config = TrainingConfig::new(small_model(), AdamConfig::new(), classes);
		config.save(dir.join(CONFIG_FILE)).unwrap();
		config
			.model
			.init::<TestBackend>(&device)
			.save_file(dir.join(MODEL_FILE), &CompactRecorder::new())
			.unwrap();
	}

	#[test]
	fn white_background_is_inverted() {
		let image = DynamicImage::ImageLuma8(GrayImage::from_pixel(56, 56, Luma([255])));

		let pixels = prepare_image(&image);

		assert_eq!(pixels.len(), SIDE_LENGTH * SIDE_LENGTH);
		assert!(pixels.iter().all(|&value| value == 0.0));
	}

	#[test]
	fn black_background_is_left_alone() {
		let image = DynamicImage::ImageLuma8(GrayImage::from_pixel(56, 56, Luma([0])));

		let pixels = prepare_image(&image);

		assert!(pixels.iter().all(|&value| value == 0.0));
		assert!(!needs_inversion(&[0; 16]));
		assert!(needs_inversion(&[200; 16]));
	}

	#[test]
	fn dark_strokes_become_light_strokes() {
		let mut image = GrayImage::from_pixel(28, 28, Luma([255]));
		image.put_pixel(14, 14, Luma([0]));

		let pixels = prepare_image(&DynamicImage::ImageLuma8(image));

		assert!(pixels[14 * SIDE_LENGTH + 14] > 0.9);
		assert_eq!(pixels[0], 0.0);
	}

	#[test]
	fn prediction_carries_a_label_and_distribution() {
		let device = Default::default();
		let classifier = Classifier::<TestBackend>::new(small_model().init(&device), classes(), device);

		let prediction = classifier.predict_pixels(&[0.5; SIDE_LENGTH * SIDE_LENGTH]).unwrap();

		assert!(classes().contains(&prediction.label));
		assert_eq!(prediction.probabilities.len(), 3);
		assert!((prediction.probabilities.iter().sum::<f32>() - 1.0).abs() < 1e-5);
		assert!(prediction.confidence_percent().ends_with('%'));
	}

	#[test]
	fn colour_uploads_are_grayscaled_before_resizing() {
		let colour = RgbImage::from_fn(84, 84, |x, y| {
			if (x / 12 + y / 12) % 2 == 0 { Rgb([230, 40, 10]) } else { Rgb([250, 250, 245]) }
		});
		let colour = DynamicImage::ImageRgb8(colour);
		let gray = DynamicImage::ImageLuma8(colour.to_luma8());

		assert_eq!(prepare_image(&colour), prepare_image(&gray));
	}

	#[test]
	fn breakdown_pairs_every_class_with_its_probability() {
		let prediction = Prediction {
			index: 2,
			label: "whale".into(),
			probabilities: vec![0.1, 0.2, 0.7],
		};
		let classes = classes();

		let breakdown = prediction.breakdown(&classes);

		assert_eq!(breakdown, vec![("cat", 0.1), ("star", 0.2), ("whale", 0.7)]);
	}

	#[test]
	fn percent_uses_two_decimals() {
		assert_eq!(format_percent(0.1234), "12.34%");
		assert_eq!(format_percent(1.0), "100.00%");
	}

	#[test]
	fn load_accepts_matching_class_list() {
		let dir = tempfile::tempdir().unwrap();
		save_artifacts(dir.path(), classes());

		let classifier = Classifier::<TestBackend>::load(dir.path(), Default::default(), Some(&classes())).unwrap();

		assert_eq!(classifier.classes(), classes().as_slice());
	}

	#[test]
	fn load_rejects_a_different_class_list() {
		let dir = tempfile::tempdir().unwrap();
		save_artifacts(dir.path(), classes());

		let expected = vec!["cat".to_string(), "whale".to_string(), "star".to_string()];
		let result = Classifier::<TestBackend>::load(dir.path(), Default::default(), Some(&expected));

		assert!(matches!(result, Err(ClassifierError::ClassMismatch { .. })));
	}

	#[test]
	fn load_rejects_class_count_that_does_not_fit_the_model() {
		let dir = tempfile::tempdir().unwrap();
		save_artifacts(dir.path(), vec!["cat".into(), "star".into()]);

		let result = Classifier::<TestBackend>::load(dir.path(), Default::default(), None);

		assert!(matches!(result, Err(ClassifierError::ClassCount { model: 3, classes: 2 })));
	}

	#[test]
	fn undecodable_bytes_are_an_image_error() {
		let device = Default::default();
		let classifier = Classifier::<TestBackend>::new(small_model().init(&device), classes(), device);

		let result = classifier.predict_bytes(b"definitely not a png");

		assert!(matches!(result, Err(ClassifierError::Image(_))));
	}
}
