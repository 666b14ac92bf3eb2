//! Training-time augmentation: random horizontal flips and small rotations.

use std::f64::consts::TAU;

use ndarray::{Array2, Array3, Axis, s};
use rand::Rng;

/// Random transform parameters applied to one image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Augmentation {
    pub flip: bool,
    /// Rotation in radians, counter-clockwise.
    pub angle: f64,
}

impl Augmentation {
    pub const IDENTITY: Self = Self {
        flip: false,
        angle: 0.0,
    };

    /// Flip with probability 0.5 and rotate by up to 0.05 of a full turn
    /// either way.
    pub fn sample(rng: &mut impl Rng) -> Self {
        Self {
            flip: rng.gen_bool(0.5),
            angle: rng.gen_range(-0.05..=0.05) * TAU,
        }
    }

    pub fn apply(&self, image: &Array2<f32>) -> Array2<f32> {
        let flipped = if self.flip {
            image.slice(s![.., ..;-1]).to_owned()
        } else {
            image.clone()
        };
        if self.angle == 0.0 {
            flipped
        } else {
            rotate(&flipped, self.angle)
        }
    }
}

/// Independently augment every image of an `(n, h, w)` batch.
pub fn augment_batch(inputs: &Array3<f32>, rng: &mut impl Rng) -> Array3<f32> {
    let mut out = inputs.clone();
    for mut image in out.axis_iter_mut(Axis(0)) {
        let augmented = Augmentation::sample(rng).apply(&image.to_owned());
        image.assign(&augmented);
    }
    out
}

/// Half-sample symmetric reflection of an index into `0..len`.
fn reflect(index: isize, len: usize) -> usize {
    let len = len as isize;
    let period = 2 * len;
    let m = index.rem_euclid(period);
    (if m < len { m } else { period - 1 - m }) as usize
}

/// Rotate about the image centre with bilinear sampling. Pixels sourced
/// from outside the image are filled by reflection.
fn rotate(image: &Array2<f32>, angle: f64) -> Array2<f32> {
    let (h, w) = image.dim();
    let cy = (h as f64 - 1.0) / 2.0;
    let cx = (w as f64 - 1.0) / 2.0;
    let (sin, cos) = angle.sin_cos();

    let sample = |y: isize, x: isize| f64::from(image[[reflect(y, h), reflect(x, w)]]);

    Array2::from_shape_fn((h, w), |(y, x)| {
        let dy = y as f64 - cy;
        let dx = x as f64 - cx;
        // Inverse mapping: where this output pixel came from.
        let sx = cos * dx + sin * dy + cx;
        let sy = -sin * dx + cos * dy + cy;

        let x0 = sx.floor();
        let y0 = sy.floor();
        let fx = sx - x0;
        let fy = sy - y0;
        let (x0, y0) = (x0 as isize, y0 as isize);

        let top = sample(y0, x0) * (1.0 - fx) + sample(y0, x0 + 1) * fx;
        let bottom = sample(y0 + 1, x0) * (1.0 - fx) + sample(y0 + 1, x0 + 1) * fx;
        (top * (1.0 - fy) + bottom * fy) as f32
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn identity_leaves_image_unchanged() {
        let image = array![[0.1f32, 0.2], [0.3, 0.4]];
        assert_eq!(Augmentation::IDENTITY.apply(&image), image);
    }

    #[test]
    fn flip_mirrors_columns() {
        let image = array![[0.1f32, 0.2, 0.3], [0.4, 0.5, 0.6]];
        let flipped = Augmentation {
            flip: true,
            angle: 0.0,
        }
        .apply(&image);
        assert_eq!(flipped, array![[0.3f32, 0.2, 0.1], [0.6, 0.5, 0.4]]);
    }

    #[test]
    fn reflection_is_half_sample_symmetric() {
        assert_eq!(reflect(-1, 4), 0);
        assert_eq!(reflect(-2, 4), 1);
        assert_eq!(reflect(4, 4), 3);
        assert_eq!(reflect(5, 4), 2);
        assert_eq!(reflect(2, 4), 2);
    }

    #[test]
    fn rotation_stays_within_input_range() {
        let image = Array2::from_shape_fn((8, 8), |(y, x)| (y * 8 + x) as f32 / 63.0);
        let rotated = rotate(&image, 0.3);
        assert_eq!(rotated.dim(), (8, 8));
        assert!(rotated.iter().all(|v| (-1e-6..=1.0 + 1e-6).contains(v)));

        let flat = Array2::from_elem((5, 7), 0.4f32);
        assert!(rotate(&flat, -0.2).iter().all(|v| (v - 0.4).abs() < 1e-6));
    }

    #[test]
    fn sampled_angles_are_bounded_and_seeded() {
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let aug = Augmentation::sample(&mut a);
            assert!(aug.angle.abs() <= 0.05 * TAU + 1e-12);
            assert_eq!(aug, Augmentation::sample(&mut b));
        }

        let batch = Array3::from_elem((3, 4, 4), 0.5f32);
        let out = augment_batch(&batch, &mut a);
        assert_eq!(out.dim(), (3, 4, 4));
    }
}
