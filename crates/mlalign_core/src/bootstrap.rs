//! Initial references from averages of random image subsets.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use std::ops::Range;

use crate::error::{MlError, Result};
use crate::expectation::ParticleImage;
use crate::float_trait::MlFloat;
use crate::geometry::{flip_image, Flip};

/// Random permutation of `0..n_images`.
pub fn shuffled_order(n_images: usize, rng: &mut StdRng) -> Vec<usize> {
    let mut order: Vec<usize> = (0..n_images).collect();
    order.shuffle(rng);
    order
}

/// Split `n_items` into `n_groups` consecutive ranges whose sizes differ by at
/// most one; the first groups take the remainder.
pub fn divide_equally(n_items: usize, n_groups: usize) -> Vec<Range<usize>> {
    let base = n_items / n_groups;
    let remainder = n_items % n_groups;
    let mut start = 0;
    (0..n_groups)
        .map(|g| {
            let len = base + usize::from(g < remainder);
            let range = start..start + len;
            start += len;
            range
        })
        .collect()
}

/// Average `n_references` groups of images taken along `order`.
///
/// With `randomize_rotations` every average is turned by a random multiple of
/// 90° drawn from `rng`, which breaks the symmetry between groups.
pub fn bootstrap_references<F: MlFloat>(
    images: &[ParticleImage<F>],
    order: &[usize],
    n_references: usize,
    randomize_rotations: bool,
    rng: &mut StdRng,
) -> Result<Vec<Array2<F>>> {
    if images.is_empty() {
        return Err(MlError::EmptyImageSet);
    }
    if n_references == 0 || n_references > images.len() {
        return Err(MlError::InvalidConfig(format!(
            "cannot bootstrap {} references from {} images",
            n_references,
            images.len()
        )));
    }
    let shape = images[0].data.dim();

    let mut references = Vec::with_capacity(n_references);
    for group in divide_equally(order.len(), n_references) {
        let mut sum = Array2::<F>::zeros(shape);
        for &index in &order[group.clone()] {
            sum += &images[index].data;
        }
        let inv = F::from_f64_c(1.0 / group.len() as f64);
        sum.mapv_inplace(|v| v * inv);
        if randomize_rotations {
            let flip = Flip {
                quarter_turns: rng.gen_range(0..4u8),
                mirrored: false,
            };
            sum = flip_image(sum.view(), flip);
        }
        log::debug!("bootstrap reference {} from {} images", references.len(), group.len());
        references.push(sum);
    }
    Ok(references)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn constant_images(n: usize) -> Vec<ParticleImage<f64>> {
        (0..n)
            .map(|i| ParticleImage::new(format!("img{}", i), Array2::from_elem((4, 4), i as f64)))
            .collect()
    }

    #[test]
    fn test_divide_equally_covers_every_item() {
        assert_eq!(divide_equally(10, 3), vec![0..4, 4..7, 7..10]);
        assert_eq!(divide_equally(4, 4), vec![0..1, 1..2, 2..3, 3..4]);
        assert_eq!(divide_equally(6, 2), vec![0..3, 3..6]);
    }

    #[test]
    fn test_shuffle_is_seeded() {
        let a = shuffled_order(50, &mut StdRng::seed_from_u64(7));
        let b = shuffled_order(50, &mut StdRng::seed_from_u64(7));
        let c = shuffled_order(50, &mut StdRng::seed_from_u64(8));
        assert_eq!(a, b);
        assert_ne!(a, c);
        let mut sorted = a.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_group_averages_follow_the_order() {
        let images = constant_images(6);
        let order = vec![5, 4, 3, 0, 1, 2];
        let mut rng = StdRng::seed_from_u64(1);
        let refs = bootstrap_references(&images, &order, 2, false, &mut rng).unwrap();
        assert_eq!(refs.len(), 2);
        assert!(refs[0].iter().all(|&v| (v - 4.0).abs() < 1e-12));
        assert!(refs[1].iter().all(|&v| (v - 1.0).abs() < 1e-12));
    }

    #[test]
    fn test_random_rotations_are_quarter_turns() {
        let mut image = Array2::<f64>::zeros((8, 8));
        image[[1, 6]] = 1.0;
        let images = vec![ParticleImage::new("a", image.clone())];
        let mut rng = StdRng::seed_from_u64(3);
        let refs = bootstrap_references(&images, &[0], 1, true, &mut rng).unwrap();
        let matches_a_turn = (0..4u8).any(|q| {
            let turned = flip_image(
                image.view(),
                Flip {
                    quarter_turns: q,
                    mirrored: false,
                },
            );
            turned == refs[0]
        });
        assert!(matches_a_turn);
    }

    #[test]
    fn test_too_many_references_is_rejected() {
        let images = constant_images(2);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            bootstrap_references(&images, &[0, 1], 3, false, &mut rng),
            Err(MlError::InvalidConfig(_))
        ));
        assert!(matches!(
            bootstrap_references::<f64>(&[], &[], 1, false, &mut rng),
            Err(MlError::EmptyImageSet)
        ));
    }
}
