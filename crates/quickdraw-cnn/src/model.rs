use crate::data::SketchBatch;
use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::loss::CrossEntropyLossConfig;
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d, Relu};
use burn::prelude::{Backend, Tensor};
use burn::tensor::activation::softmax;
use burn::train::ClassificationOutput;

/// conv -> relu -> batch norm -> conv -> relu -> max pool -> dropout
#[derive(Debug, Module)]
pub struct ConvStage<B: Backend> {
	conv1: Conv2d<B>,
	norm: BatchNorm<B, 2>,
	conv2: Conv2d<B>,
	pool: MaxPool2d,
	dropout: Dropout,
	activation: Relu,
}

impl <B: Backend> ConvStage<B> {
	pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
		let x = self.conv1.forward(input);
		let x = self.activation.forward(x);
		let x = self.norm.forward(x);

		let x = self.conv2.forward(x);
		let x = self.activation.forward(x);
		let x = self.pool.forward(x);

		self.dropout.forward(x)
	}

	/// Sum of the squared convolution kernels.
	fn kernel_norm(&self) -> Tensor<B, 1> {
		self.conv1.weight.val().powf_scalar(2.0).sum() + self.conv2.weight.val().powf_scalar(2.0).sum()
	}
}

#[derive(Debug, Module)]
pub struct SketchCnn<B: Backend> {
	stages: Vec<ConvStage<B>>,
	pool: AdaptiveAvgPool2d,
	hidden: Linear<B>,
	dropout: Dropout,
	output: Linear<B>,
	activation: Relu,
	l2_penalty: f64,
}

impl <B: Backend> SketchCnn<B> {
	/// `[batch, 1, 28, 28]` images to `[batch, num_classes]` logits.
	pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
		let mut x = images;
		for stage in &self.stages {
			x = stage.forward(x);
		}

		let x = self.pool.forward(x);
		let x = x.flatten(1, 3);

		let x = self.hidden.forward(x);
		let x = self.activation.forward(x);
		let x = self.dropout.forward(x);

		self.output.forward(x)
	}

	pub fn probabilities(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
		softmax(self.forward(images), 1)
	}

	/// Weighted L2 penalty over every convolution kernel, added to the training loss.
	pub fn regularization(&self) -> Tensor<B, 1> {
		let device = self.output.weight.val().device();
		let norm = self.stages
			.iter()
			.map(ConvStage::kernel_norm)
			.fold(Tensor::zeros([1], &device), |acc, norm| acc + norm);

		norm.mul_scalar(self.l2_penalty)
	}

	pub fn forward_classification(&self, batch: SketchBatch<B>) -> ClassificationOutput<B> {
		let output = self.forward(batch.images);

		let loss = CrossEntropyLossConfig::new().init(&output.device())
			.forward(output.clone(), batch.targets.clone());
		let loss = loss + self.regularization();

		ClassificationOutput::new(loss, output, batch.targets)
	}
}

#[derive(Debug, Config)]
pub struct SketchCnnConfig {
	pub num_classes: usize,
	#[config(default = "[64, 128, 256]")]
	pub channels: [usize; 3],
	#[config(default = 0.25)]
	pub conv_dropout: f64,
	#[config(default = 512)]
	pub hidden_size: usize,
	#[config(default = 0.5)]
	pub dropout: f64,
	#[config(default = 1.0e-4)]
	pub l2_penalty: f64,
}

impl SketchCnnConfig {
	pub fn init<B: Backend>(&self, device: &B::Device) -> SketchCnn<B> {
		let mut in_channels = 1;
		let mut stages = Vec::with_capacity(self.channels.len());

		for &out_channels in &self.channels {
			stages.push(self.init_stage(in_channels, out_channels, device));
			in_channels = out_channels;
		}

		SketchCnn {
			stages,
			pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
			hidden: LinearConfig::new(in_channels, self.hidden_size).init(device),
			dropout: DropoutConfig::new(self.dropout).init(),
			output: LinearConfig::new(self.hidden_size, self.num_classes).init(device),
			activation: Relu::new(),
			l2_penalty: self.l2_penalty,
		}
	}

	fn init_stage<B: Backend>(&self, in_channels: usize, out_channels: usize, device: &B::Device) -> ConvStage<B> {
		let conv1 = Conv2dConfig::new([in_channels, out_channels], [3, 3])
			.with_padding(PaddingConfig2d::Same)
			.init(device);

		let conv2 = Conv2dConfig::new([out_channels, out_channels], [3, 3])
			.with_padding(PaddingConfig2d::Same)
			.init(device);

		ConvStage {
			conv1,
			norm: BatchNormConfig::new(out_channels).init(device),
			conv2,
			pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
			dropout: DropoutConfig::new(self.conv_dropout).init(),
			activation: Relu::new(),
		}
	}
}
