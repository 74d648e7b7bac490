use std::fmt;
use std::fs;
use std::path::Path;

use image::{imageops, GrayImage, Luma};
use serde::Serialize;

use crate::data::{SketchItem, SIDE_LENGTH};
use crate::error::TrainError;

/// How many misclassified drawings end up in the gallery.
pub const GALLERY_SIZE: usize = 16;
const GALLERY_COLUMNS: u32 = 4;
const GALLERY_SCALE: u32 = 4;

/// Rows are true labels, columns are predicted labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfusionMatrix {
	counts: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
	pub fn new(num_classes: usize) -> Self {
		Self { counts: vec![vec![0; num_classes]; num_classes] }
	}

	pub fn from_predictions(truth: &[usize], predicted: &[usize], num_classes: usize) -> Self {
		let mut matrix = Self::new(num_classes);
		for (&actual, &guess) in truth.iter().zip(predicted) {
			matrix.record(actual, guess);
		}
		matrix
	}

	pub fn record(&mut self, actual: usize, predicted: usize) {
		self.counts[actual][predicted] += 1;
	}

	pub fn count(&self, actual: usize, predicted: usize) -> usize {
		self.counts[actual][predicted]
	}

	pub fn num_classes(&self) -> usize {
		self.counts.len()
	}

	pub fn total(&self) -> usize {
		self.counts.iter().flatten().sum()
	}

	pub fn accuracy(&self) -> f64 {
		let correct: usize = (0..self.num_classes()).map(|class| self.count(class, class)).sum();
		ratio(correct, self.total())
	}

	pub fn class_metrics(&self, class: usize) -> ClassMetrics {
		let true_positives = self.count(class, class);
		let support: usize = self.counts[class].iter().sum();
		let predicted: usize = self.counts.iter().map(|row| row[class]).sum();

		let precision = ratio(true_positives, predicted);
		let recall = ratio(true_positives, support);
		let f1 = if precision + recall == 0.0 { 0.0 } else { 2.0 * precision * recall / (precision + recall) };

		ClassMetrics { precision, recall, f1, support }
	}
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
	if denominator == 0 { 0.0 } else { numerator as f64 / denominator as f64 }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClassMetrics {
	pub precision: f64,
	pub recall: f64,
	pub f1: f64,
	pub support: usize,
}

/// Per-class precision, recall and F1 plus their macro and support weighted averages.
#[derive(Debug, Clone, Serialize)]
pub struct ClassificationReport {
	pub classes: Vec<(String, ClassMetrics)>,
	pub accuracy: f64,
	pub macro_avg: ClassMetrics,
	pub weighted_avg: ClassMetrics,
}

impl ClassificationReport {
	pub fn new(matrix: &ConfusionMatrix, class_names: &[String]) -> Self {
		let classes: Vec<(String, ClassMetrics)> = class_names
			.iter()
			.enumerate()
			.map(|(class, name)| (name.clone(), matrix.class_metrics(class)))
			.collect();

		let count = classes.len().max(1) as f64;
		let total: usize = classes.iter().map(|(_, metrics)| metrics.support).sum();
		let weight = |metrics: &ClassMetrics| if total == 0 { 0.0 } else { metrics.support as f64 / total as f64 };

		let macro_avg = ClassMetrics {
			precision: classes.iter().map(|(_, m)| m.precision).sum::<f64>() / count,
			recall: classes.iter().map(|(_, m)| m.recall).sum::<f64>() / count,
			f1: classes.iter().map(|(_, m)| m.f1).sum::<f64>() / count,
			support: total,
		};
		let weighted_avg = ClassMetrics {
			precision: classes.iter().map(|(_, m)| m.precision * weight(m)).sum(),
			recall: classes.iter().map(|(_, m)| m.recall * weight(m)).sum(),
			f1: classes.iter().map(|(_, m)| m.f1 * weight(m)).sum(),
			support: total,
		};

		Self { classes, accuracy: matrix.accuracy(), macro_avg, weighted_avg }
	}
}

impl fmt::Display for ClassificationReport {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let width = self.classes.iter().map(|(name, _)| name.len()).max().unwrap_or(0).max(12);
		let row = |f: &mut fmt::Formatter<'_>, name: &str, m: &ClassMetrics| {
			writeln!(f, "{name:>width$} {:>9.2} {:>9.2} {:>9.2} {:>9}", m.precision, m.recall, m.f1, m.support)
		};

		writeln!(f, "{:>width$} {:>9} {:>9} {:>9} {:>9}", "", "precision", "recall", "f1-score", "support")?;
		writeln!(f)?;
		for (name, metrics) in &self.classes {
			row(f, name, metrics)?;
		}
		writeln!(f)?;
		writeln!(f, "{:>width$} {:>9} {:>9} {:>9.2} {:>9}", "accuracy", "", "", self.accuracy, self.macro_avg.support)?;
		row(f, "macro avg", &self.macro_avg)?;
		row(f, "weighted avg", &self.weighted_avg)
	}
}

/// Indices of the first `cap` samples whose prediction differs from the truth.
pub fn misclassified(truth: &[usize], predicted: &[usize], cap: usize) -> Vec<usize> {
	truth
		.iter()
		.zip(predicted)
		.enumerate()
		.filter(|(_, (actual, guess))| actual != guess)
		.map(|(index, _)| index)
		.take(cap)
		.collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct Misclassification {
	pub index: usize,
	pub actual: String,
	pub predicted: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Evaluation {
	pub report: ClassificationReport,
	pub confusion_matrix: ConfusionMatrix,
	pub total_misclassified: usize,
	pub gallery: Vec<Misclassification>,
}

impl Evaluation {
	pub fn new(truth: &[usize], predicted: &[usize], class_names: &[String], gallery_size: usize) -> Self {
		let confusion_matrix = ConfusionMatrix::from_predictions(truth, predicted, class_names.len());
		let report = ClassificationReport::new(&confusion_matrix, class_names);
		let total_misclassified = truth.iter().zip(predicted).filter(|(a, p)| a != p).count();

		let gallery = misclassified(truth, predicted, gallery_size)
			.into_iter()
			.map(|index| Misclassification {
				index,
				actual: class_names[truth[index]].clone(),
				predicted: class_names[predicted[index]].clone(),
			})
			.collect();

		Self { report, confusion_matrix, total_misclassified, gallery }
	}

	pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), TrainError> {
		fs::write(path, serde_json::to_string_pretty(self)?)?;
		Ok(())
	}
}

/// Tiles the given drawings into a grid, light strokes on a dark background like the training data.
pub fn render_gallery(samples: &[&SketchItem]) -> GrayImage {
	let side = SIDE_LENGTH as u32 * GALLERY_SCALE;
	let rows = (samples.len() as u32).div_ceil(GALLERY_COLUMNS).max(1);
	let mut canvas = GrayImage::new(side * GALLERY_COLUMNS, side * rows);

	for (position, sample) in samples.iter().enumerate() {
		let tile = GrayImage::from_fn(SIDE_LENGTH as u32, SIDE_LENGTH as u32, |x, y| {
			let pixel = sample.pixels[y as usize * SIDE_LENGTH + x as usize];
			Luma([(pixel.clamp(0.0, 1.0) * 255.0).round() as u8])
		});
		let tile = imageops::resize(&tile, side, side, imageops::FilterType::Nearest);

		let column = position as u32 % GALLERY_COLUMNS;
		let row = position as u32 / GALLERY_COLUMNS;
		imageops::replace(&mut canvas, &tile, (column * side) as i64, (row * side) as i64);
	}

	canvas
}

pub fn save_gallery<P: AsRef<Path>>(samples: &[&SketchItem], path: P) -> Result<(), TrainError> {
	render_gallery(samples).save(path)?;
	Ok(())
}
