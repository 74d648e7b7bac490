use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{anyhow, Context};
use burn::backend::Autodiff;
use burn::config::Config;
use burn::module::AutodiffModule;
use burn_tch::{LibTorch, LibTorchDevice};
use clap::{Parser, Subcommand};
use log::{info, LevelFilter};
use quickdraw_cnn::config::PipelineConfig;
use quickdraw_cnn::data;
use quickdraw_cnn::fetch::{self, HttpSource};
use quickdraw_cnn::infer::{format_percent, Classifier};
use quickdraw_cnn::{server, train};
use simple_logger::SimpleLogger;

type InferenceBackend = LibTorch;
type TrainBackend = Autodiff<LibTorch>;

#[derive(Parser, Debug)]
#[command(about = "Train and serve a sketch classifier on Quick, Draw! bitmaps")]
struct Cli {
	/// Pipeline configuration (json). Defaults to the ten class QuickDraw setup.
	#[arg(long, global = true)]
	config: Option<PathBuf>,

	/// Overrides the artifact directory from the configuration.
	#[arg(long, global = true)]
	artifact_dir: Option<String>,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Download the per-class bitmap arrays
	Fetch,
	/// Train, checkpoint and evaluate on the held out partition
	Train,
	/// Re-run the test partition evaluation against saved artifacts
	Evaluate,
	/// Classify a single image file
	Predict {
		#[arg(long)]
		image: PathBuf,
	},
	/// Run the web service
	Serve {
		#[arg(long, default_value = "127.0.0.1:5000")]
		addr: SocketAddr,
	},
}

fn main() -> anyhow::Result<()> {
	SimpleLogger::new()
		.with_level(LevelFilter::Info)
		.env()
		.init()
		.context("Could not initialize logger")?;

	let cli = Cli::parse();
	let mut pipeline = match &cli.config {
		Some(path) => PipelineConfig::load(path).map_err(|err| anyhow!("Could not load {}: {err:?}", path.display()))?,
		None => PipelineConfig::quickdraw(),
	};
	if let Some(artifact_dir) = &cli.artifact_dir {
		pipeline.artifact_dir = artifact_dir.clone();
	}
	pipeline.validate()?;
	// Without an explicit config the persisted class list is taken as is
	let expected_classes = cli.config.as_ref().map(|_| pipeline.dataset.classes.clone());

	let time = SystemTime::now();

	match cli.command {
		Command::Fetch => fetch(&pipeline)?,
		Command::Train => train(&pipeline)?,
		Command::Evaluate => evaluate(&pipeline)?,
		Command::Predict { image } => predict(&pipeline, expected_classes.as_deref(), &image)?,
		Command::Serve { addr } => serve(&pipeline, expected_classes.as_deref(), addr)?,
	}

	info!("Finished in {:.3}s", time.elapsed()?.as_millis() as f64 / 1000.0);
	Ok(())
}

fn device() -> LibTorchDevice {
	if tch::utils::has_cuda() {
		info!("CUDA detected, using GPU 0");
		LibTorchDevice::Cuda(0)
	} else {
		info!("No CUDA configuration found, using CPU");
		LibTorchDevice::Cpu
	}
}

fn fetch(pipeline: &PipelineConfig) -> anyhow::Result<()> {
	let source = HttpSource::new(&pipeline.dataset.base_url)?;
	let report = fetch::fetch_all(&source, &pipeline.dataset.classes, &pipeline.dataset.data_dir)?;

	for (class, err) in &report.failed {
		info!("{class} was not downloaded: {err}");
	}
	Ok(())
}

fn train(pipeline: &PipelineConfig) -> anyhow::Result<()> {
	let artifact_dir = Path::new(&pipeline.artifact_dir);
	let device = device();

	let partitions = data::assemble(&pipeline.dataset)?;
	let trained = train::run::<TrainBackend>(
		artifact_dir,
		&pipeline.training,
		partitions.train,
		partitions.valid,
		device.clone(),
	)?;

	train::evaluate(artifact_dir, &pipeline.training, &trained.model.valid(), &partitions.test, &device)?;
	Ok(())
}

fn evaluate(pipeline: &PipelineConfig) -> anyhow::Result<()> {
	let artifact_dir = Path::new(&pipeline.artifact_dir);
	let classifier = Classifier::<InferenceBackend>::load(artifact_dir, device(), Some(&pipeline.training.classes))?;

	let partitions = data::assemble(&pipeline.dataset)?;
	train::evaluate(
		artifact_dir,
		&pipeline.training,
		classifier.model(),
		&partitions.test,
		classifier.device(),
	)?;
	Ok(())
}

fn predict(pipeline: &PipelineConfig, expected_classes: Option<&[String]>, image: &Path) -> anyhow::Result<()> {
	let classifier = Classifier::<InferenceBackend>::load(&pipeline.artifact_dir, device(), expected_classes)?;

	let image = image::open(image).with_context(|| format!("Could not open {}", image.display()))?;
	let prediction = classifier.predict_image(&image)?;

	println!("{} ({})", prediction.label, prediction.confidence_percent());
	for (label, probability) in prediction.breakdown(classifier.classes()) {
		println!("  {label:<20} {}", format_percent(probability));
	}
	Ok(())
}

fn serve(pipeline: &PipelineConfig, expected_classes: Option<&[String]>, addr: SocketAddr) -> anyhow::Result<()> {
	let classifier = Classifier::<InferenceBackend>::load(&pipeline.artifact_dir, device(), expected_classes)?;

	tokio::runtime::Runtime::new()?.block_on(server::serve(addr, classifier))?;
	Ok(())
}
