//! Random geometric augmentation of single grayscale images

use ndarray::{Array2, ArrayView2};
use rand::Rng;

/// Random horizontal flip followed by a random rotation
///
/// Rotation uses nearest-neighbour sampling about the image centre and fills
/// uncovered pixels with `fill`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Augmentation {
    /// Probability of a horizontal flip
    pub flip_probability: f64,
    /// Rotation is drawn uniformly from `[-max_rotation_deg, max_rotation_deg]`
    pub max_rotation_deg: f64,
    pub fill: f32,
}

impl Default for Augmentation {
    fn default() -> Self {
        Self {
            flip_probability: 0.5,
            max_rotation_deg: 45.0,
            fill: 0.0,
        }
    }
}

impl Augmentation {
    /// Apply a random flip and rotation
    pub fn apply<R: Rng + ?Sized>(&self, image: ArrayView2<'_, f32>, rng: &mut R) -> Array2<f32> {
        let flipped = self.flip_probability > 0.0 && rng.random_bool(self.flip_probability.min(1.0));
        let angle = if self.max_rotation_deg > 0.0 {
            rng.random_range(-self.max_rotation_deg..=self.max_rotation_deg)
        } else {
            0.0
        };
        self.transform(image, flipped, angle)
    }

    /// Deterministic part of [`Augmentation::apply`]
    pub fn transform(&self, image: ArrayView2<'_, f32>, flip: bool, angle_deg: f64) -> Array2<f32> {
        let (h, w) = image.dim();
        let (sin, cos) = angle_deg.to_radians().sin_cos();
        let cy = (h as f64 - 1.0) / 2.0;
        let cx = (w as f64 - 1.0) / 2.0;

        Array2::from_shape_fn((h, w), |(y, x)| {
            // Inverse-rotate the output pixel into the (possibly flipped) source
            let dy = y as f64 - cy;
            let dx = x as f64 - cx;
            let sx = (cos * dx + sin * dy + cx).round();
            let sy = (-sin * dx + cos * dy + cy).round();

            if sx < 0.0 || sy < 0.0 || sx >= w as f64 || sy >= h as f64 {
                return self.fill;
            }
            let (sy, sx) = (sy as usize, sx as usize);
            let sx = if flip { w - 1 - sx } else { sx };
            image[[sy, sx]]
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_identity_transform() {
        let image = array![[1.0f32, 2.0], [3.0, 4.0]];
        let out = Augmentation::default().transform(image.view(), false, 0.0);
        assert_eq!(out, image);
    }

    #[test]
    fn test_horizontal_flip() {
        let image = array![[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let out = Augmentation::default().transform(image.view(), true, 0.0);
        assert_eq!(out, array![[3.0, 2.0, 1.0], [6.0, 5.0, 4.0]]);
    }

    #[test]
    fn test_quarter_turn_keeps_centre_and_fills_nothing_on_square() {
        let image = array![[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0]];
        let out = Augmentation::default().transform(image.view(), false, 90.0);
        assert_eq!(out[[1, 1]], 5.0);
        let mut values: Vec<f32> = out.iter().copied().collect();
        values.sort_by(f32::total_cmp);
        assert_eq!(values, (1..=9).map(|v| v as f32).collect::<Vec<_>>());
    }

    #[test]
    fn test_rotation_fills_corners() {
        let image = Array2::<f32>::ones((8, 8));
        let aug = Augmentation {
            fill: -1.0,
            ..Default::default()
        };
        let out = aug.transform(image.view(), false, 45.0);
        assert_eq!(out[[0, 0]], -1.0);
        assert_eq!(out[[4, 4]], 1.0);
    }

    #[test]
    fn test_apply_is_seeded() {
        let image = Array2::from_shape_fn((6, 6), |(y, x)| (y * 6 + x) as f32);
        let aug = Augmentation::default();
        let a = aug.apply(image.view(), &mut StdRng::seed_from_u64(7));
        let b = aug.apply(image.view(), &mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
    }
}
