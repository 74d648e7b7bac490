use burn::tensor::TensorData;
use rand::Rng;

use crate::data::SIDE_LENGTH;

/// Shifts are drawn from `[-MAX_SHIFT, MAX_SHIFT)`.
pub const MAX_SHIFT: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Augmentation {
	pub shift_rows: i64,
	pub shift_cols: i64,
	pub flip: bool,
}

impl Augmentation {
	pub fn sample<R: Rng + ?Sized>(rng: &mut R) -> Self {
		Self {
			shift_rows: rng.gen_range(-MAX_SHIFT..MAX_SHIFT),
			shift_cols: rng.gen_range(-MAX_SHIFT..MAX_SHIFT),
			flip: rng.gen_bool(0.5),
		}
	}

	pub fn apply(&self, pixels: &[f32]) -> Vec<f32> {
		let rolled = roll(pixels, self.shift_rows, self.shift_cols);

		if self.flip {
			flip_horizontal(&rolled)
		} else {
			rolled
		}
	}
}

/// Cyclic shift of a square grid: the pixel at `(r, c)` moves to `(r + rows, c + cols)`, wrapping around.
pub fn roll(pixels: &[f32], rows: i64, cols: i64) -> Vec<f32> {
	let side = SIDE_LENGTH as i64;
	let mut out = vec![0.0; pixels.len()];

	for (index, &pixel) in pixels.iter().enumerate() {
		let r = (index as i64 / side + rows).rem_euclid(side);
		let c = (index as i64 % side + cols).rem_euclid(side);
		out[(r * side + c) as usize] = pixel;
	}

	out
}

pub fn flip_horizontal(pixels: &[f32]) -> Vec<f32> {
	pixels
		.chunks(SIDE_LENGTH)
		.flat_map(|row| row.iter().rev().copied())
		.collect()
}

/// Turns a row-major drawing into a `[1, 28, 28]` float tensor. Only the training partition asks
/// for `augment`, which draws a fresh roll and mirror for every call.
pub fn preprocess<R: Rng + ?Sized>(pixels: &[f32], augment: bool, rng: &mut R) -> TensorData {
	let pixels = if augment {
		Augmentation::sample(rng).apply(pixels)
	} else {
		pixels.to_vec()
	};

	TensorData::new(pixels, [1, SIDE_LENGTH, SIDE_LENGTH])
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::data::PIXELS;
	use rand::rngs::StdRng;
	use rand::SeedableRng;

	fn ramp() -> Vec<f32> {
		(0..PIXELS).map(|index| index as f32).collect()
	}

	fn at(pixels: &[f32], row: usize, col: usize) -> f32 {
		pixels[row * SIDE_LENGTH + col]
	}

	#[test]
	fn without_augmentation_output_is_a_plain_channel_expansion() {
		let pixels = ramp();
		let mut rng = StdRng::seed_from_u64(1);

		let first = preprocess(&pixels, false, &mut rng);
		let second = preprocess(&pixels, false, &mut rng);

		assert_eq!(first.shape, vec![1, SIDE_LENGTH, SIDE_LENGTH]);
		assert_eq!(first.to_vec::<f32>().unwrap(), pixels);
		assert_eq!(first.to_vec::<f32>().unwrap(), second.to_vec::<f32>().unwrap());
	}

	#[test]
	fn roll_wraps_around_both_axes() {
		let pixels = ramp();
		let rolled = roll(&pixels, 2, -3);

		assert_eq!(at(&rolled, 2, 0), at(&pixels, 0, 3));
		assert_eq!(at(&rolled, 0, 25), at(&pixels, 26, 0));
		assert_eq!(at(&rolled, 1, 27), at(&pixels, 27, 2));
		assert_eq!(roll(&rolled, -2, 3), pixels);
	}

	#[test]
	fn flip_mirrors_each_row() {
		let pixels = ramp();
		let flipped = flip_horizontal(&pixels);

		assert_eq!(at(&flipped, 4, 0), at(&pixels, 4, 27));
		assert_eq!(at(&flipped, 4, 27), at(&pixels, 4, 0));
		assert_eq!(flip_horizontal(&flipped), pixels);
	}

	#[test]
	fn sampled_shifts_stay_in_range() {
		let mut rng = StdRng::seed_from_u64(3);

		for _ in 0..500 {
			let augmentation = Augmentation::sample(&mut rng);
			assert!((-MAX_SHIFT..MAX_SHIFT).contains(&augmentation.shift_rows));
			assert!((-MAX_SHIFT..MAX_SHIFT).contains(&augmentation.shift_cols));
		}
	}

	#[test]
	fn augmentation_only_moves_pixels() {
		let pixels = ramp();
		let mut rng = StdRng::seed_from_u64(9);

		let mut augmented = preprocess(&pixels, true, &mut rng).to_vec::<f32>().unwrap();
		augmented.sort_by(f32::total_cmp);

		assert_eq!(augmented, pixels);
	}
}
