use std::fs::{create_dir_all, rename, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use itertools::Itertools;
use log::{info, warn};
use reqwest::blocking::Client;
use url::Url;

use crate::error::FetchError;

/// Somewhere a per-class bitmap array can be pulled from.
pub trait ClassSource {
	fn fetch(&self, class: &str) -> Result<Vec<u8>, FetchError>;
}

pub struct HttpSource {
	client: Client,
	base_url: Url,
}

impl HttpSource {
	pub fn new(base_url: &str) -> Result<Self, FetchError> {
		let base_url = Url::parse(base_url)?;
		if base_url.cannot_be_a_base() {
			return Err(FetchError::UnusableBaseUrl(base_url.to_string()));
		}

		Ok(Self { client: Client::new(), base_url })
	}

	/// `The Eiffel Tower` -> `<base>/The%20Eiffel%20Tower.npy`
	pub fn class_url(&self, class: &str) -> Url {
		let mut url = self.base_url.clone();
		// checked in `new`
		if let Ok(mut segments) = url.path_segments_mut() {
			segments.pop_if_empty().push(&array_file_name(class));
		}
		url
	}
}

impl ClassSource for HttpSource {
	fn fetch(&self, class: &str) -> Result<Vec<u8>, FetchError> {
		let response = self.client
			.get(self.class_url(class))
			.send()?
			.error_for_status()?;

		Ok(response.bytes()?.to_vec())
	}
}

#[derive(Debug, Default)]
pub struct FetchReport {
	pub downloaded: Vec<String>,
	pub skipped: Vec<String>,
	pub failed: Vec<(String, String)>,
}

pub fn array_file_name(class: &str) -> String {
	format!("{class}.npy")
}

pub fn array_path<P: AsRef<Path>>(dir: P, class: &str) -> PathBuf {
	dir.as_ref().join(array_file_name(class))
}

pub fn dedup_classes(classes: &[String]) -> Vec<String> {
	classes.iter().unique().cloned().collect()
}

/// Populate `dir` with one array file per class. Files already on disk are left alone and a class
/// that fails to download is logged and skipped, so the result may be a partial dataset.
pub fn fetch_all<S: ClassSource, P: AsRef<Path>>(source: &S, classes: &[String], dir: P) -> Result<FetchReport, FetchError> {
	let dir = dir.as_ref();
	create_dir_all(dir)?;

	let mut report = FetchReport::default();

	for class in dedup_classes(classes) {
		let path = array_path(dir, &class);

		if path.exists() {
			info!("Skipping {class} (already downloaded)");
			report.skipped.push(class);
			continue;
		}

		info!("Downloading {class}...");
		match source.fetch(&class).and_then(|bytes| write_atomically(&path, &bytes)) {
			Ok(()) => report.downloaded.push(class),
			Err(err) => {
				warn!("Failed to download {class}: {err}");
				report.failed.push((class, err.to_string()));
			}
		}
	}

	info!(
		"Download complete: {} downloaded, {} skipped, {} failed",
		report.downloaded.len(),
		report.skipped.len(),
		report.failed.len()
	);

	Ok(report)
}

// A half written file would otherwise be mistaken for a finished download on the next run.
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), FetchError> {
	let partial = path.with_extension("npy.part");

	let mut output_file = File::create(&partial)?;
	output_file.write_all(bytes)?;
	output_file.sync_all()?;
	rename(&partial, path)?;

	Ok(())
}
