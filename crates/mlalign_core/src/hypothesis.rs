//! Transform hypothesis grid.
//!
//! A hypothesis is `(reference, rotation, translation)`, where a rotation index
//! combines one of the exact image flips with one of the interpolated reference
//! rotations in `[0°, 90°)`:
//!
//! ```text
//! rotation = iflip * nr_psi + ipsi,   angle = 90 * (iflip % 4) + ipsi * psi_step
//! ```
//!
//! Translations are integer offsets inside a square window whose half-width is
//! derived from `sigma_offset` and clipped to the image size.

use ndarray::Array2;

use crate::geometry::Flip;

/// Quarter of a full turn, covered by interpolated rotations.
const PSI_RANGE: f64 = 90.0;

/// Number of non-mirrored flips.
pub const NR_NOMIRROR_FLIPS: usize = 4;

/// Translation window half-width in units of sigma_offset.
const FULL_SEARCH_SIGMAS: f64 = 6.0;

/// Half-width multiplier for the reduced translation search.
const REDUCED_SEARCH_SIGMAS: f64 = 3.0;

/// Offsets below this sigma collapse to the single zero offset.
const SIGMA_OFFSET_FLOOR: f64 = 1e-9;

/// A coordinate in the hypothesis space, valid for one image's E-step only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformHypothesis {
    pub reference: usize,
    pub rotation: usize,
    /// Offset on the flipped image.
    pub offset: [isize; 2],
}

/// Discrete set of rotations and flips evaluated for every image.
#[derive(Debug, Clone)]
pub struct HypothesisGrid {
    nr_psi: usize,
    psi_step: f64,
    flips: Vec<Flip>,
}

impl HypothesisGrid {
    /// Build the rotation grid for a requested angular step.
    ///
    /// The step is shrunk so that an integer number of rotations tiles 90°.
    pub fn new(psi_step: f64, do_mirror: bool) -> Self {
        let nr_psi = ((PSI_RANGE / psi_step).ceil() as usize).max(1);
        Self {
            nr_psi,
            psi_step: PSI_RANGE / nr_psi as f64,
            flips: Flip::all(do_mirror),
        }
    }

    pub fn nr_psi(&self) -> usize {
        self.nr_psi
    }

    pub fn psi_step(&self) -> f64 {
        self.psi_step
    }

    pub fn nr_flips(&self) -> usize {
        self.flips.len()
    }

    pub fn flips(&self) -> &[Flip] {
        &self.flips
    }

    pub fn flip(&self, iflip: usize) -> Flip {
        self.flips[iflip]
    }

    pub fn do_mirror(&self) -> bool {
        self.flips.len() > NR_NOMIRROR_FLIPS
    }

    /// Number of mirror states (1 or 2).
    pub fn nr_mirrors(&self) -> usize {
        if self.do_mirror() {
            2
        } else {
            1
        }
    }

    /// Total number of rotation indices.
    pub fn nr_rotations(&self) -> usize {
        self.nr_psi * self.flips.len()
    }

    /// Interpolated reference rotation for `ipsi`, in degrees.
    pub fn psi_angle(&self, ipsi: usize) -> f64 {
        ipsi as f64 * self.psi_step
    }

    pub fn rotation_index(&self, iflip: usize, ipsi: usize) -> usize {
        iflip * self.nr_psi + ipsi
    }

    /// Split a rotation index into `(iflip, ipsi)`.
    pub fn split_rotation(&self, rotation: usize) -> (usize, usize) {
        (rotation / self.nr_psi, rotation % self.nr_psi)
    }

    /// Full in-plane angle of a rotation index, in `[0, 360)` degrees.
    pub fn rotation_angle(&self, rotation: usize) -> f64 {
        let (iflip, ipsi) = self.split_rotation(rotation);
        self.flips[iflip].angle_degrees() + self.psi_angle(ipsi)
    }

    /// Mirror state (0 plain, 1 mirrored) of a flip.
    pub fn mirror_of_flip(&self, iflip: usize) -> usize {
        iflip / NR_NOMIRROR_FLIPS
    }
}

/// Square window of integer translations `[-h, h]^2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationWindow {
    half_width: usize,
}

impl TranslationWindow {
    /// Window for the current sigma_offset.
    ///
    /// `override_half_width` wins when given; otherwise the half-width is
    /// `ceil(max(1, sigma) * k)` with `k = 6` (or 3 for the reduced search).
    /// A vanishing sigma collapses the window to the zero offset.
    pub fn new(
        sigma_offset: f64,
        dim: usize,
        reduced_search: bool,
        override_half_width: Option<usize>,
    ) -> Self {
        let max_half = dim.saturating_sub(1) / 2;
        let half_width = match override_half_width {
            Some(h) => h,
            None if sigma_offset < SIGMA_OFFSET_FLOOR => 0,
            None => {
                let k = if reduced_search {
                    REDUCED_SEARCH_SIGMAS
                } else {
                    FULL_SEARCH_SIGMAS
                };
                (sigma_offset.max(1.0) * k).ceil() as usize
            }
        };
        Self {
            half_width: half_width.min(max_half),
        }
    }

    pub fn half_width(&self) -> usize {
        self.half_width
    }

    pub fn side(&self) -> usize {
        2 * self.half_width + 1
    }

    /// Number of offsets in the window.
    pub fn n_offsets(&self) -> usize {
        self.side() * self.side()
    }

    /// All offsets in row-major order, the zero offset included.
    pub fn offsets(&self) -> impl Iterator<Item = [isize; 2]> {
        let h = self.half_width as isize;
        (-h..=h).flat_map(move |dy| (-h..=h).map(move |dx| [dy, dx]))
    }
}

/// Zero-mean isotropic Gaussian prior over translations.
///
/// Normalized over the whole periodic `dim x dim` grid, so the probability of
/// an offset does not depend on the search window.
#[derive(Debug, Clone)]
pub struct OffsetPrior {
    dim: usize,
    pdf: Array2<f64>,
}

impl OffsetPrior {
    pub fn new(sigma_offset: f64, dim: usize) -> Self {
        let mut pdf = Array2::<f64>::zeros((dim, dim));
        if sigma_offset < SIGMA_OFFSET_FLOOR {
            pdf[[0, 0]] = 1.0;
            return Self { dim, pdf };
        }
        let two_sigma2 = 2.0 * sigma_offset * sigma_offset;
        for ((r, c), slot) in pdf.indexed_iter_mut() {
            let y = centred(r, dim) as f64;
            let x = centred(c, dim) as f64;
            *slot = (-(y * y + x * x) / two_sigma2).exp();
        }
        let sum = pdf.sum();
        pdf.mapv_inplace(|v| v / sum);
        Self { dim, pdf }
    }

    /// Prior probability of an offset.
    #[inline]
    pub fn pdf(&self, offset: [isize; 2]) -> f64 {
        self.pdf[[wrap_index(offset[0], self.dim), wrap_index(offset[1], self.dim)]]
    }
}

/// Squared length of an offset.
#[inline]
pub fn offset_norm2(offset: [isize; 2]) -> f64 {
    (offset[0] * offset[0] + offset[1] * offset[1]) as f64
}

/// Array index of a (possibly negative) offset on a periodic axis.
#[inline]
pub fn wrap_index(offset: isize, dim: usize) -> usize {
    offset.rem_euclid(dim as isize) as usize
}

/// Centred coordinate of a periodic index: `0..ceil(dim/2)` stay, the rest go negative.
#[inline]
fn centred(index: usize, dim: usize) -> isize {
    if index < dim - dim / 2 {
        index as isize
    } else {
        index as isize - dim as isize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_psi_step_tiles_quarter_turn() {
        let grid = HypothesisGrid::new(7.0, false);
        assert_eq!(grid.nr_psi(), 13);
        assert!((grid.psi_step() * 13.0 - 90.0).abs() < 1e-12);
        assert_eq!(grid.nr_rotations(), 52);

        let coarse = HypothesisGrid::new(360.0, true);
        assert_eq!(coarse.nr_psi(), 1);
        assert_eq!(coarse.nr_rotations(), 8);
        assert_eq!(coarse.nr_mirrors(), 2);
    }

    #[test]
    fn test_rotation_angles_cover_full_turn_once() {
        let grid = HypothesisGrid::new(30.0, false);
        let mut angles: Vec<f64> = (0..grid.nr_rotations())
            .map(|r| grid.rotation_angle(r))
            .collect();
        angles.sort_by(|a, b| a.total_cmp(b));
        let expected: Vec<f64> = (0..12).map(|i| i as f64 * 30.0).collect();
        assert_eq!(angles, expected);
    }

    #[test]
    fn test_split_rotation_inverts_rotation_index() {
        let grid = HypothesisGrid::new(10.0, true);
        for iflip in 0..grid.nr_flips() {
            for ipsi in 0..grid.nr_psi() {
                let r = grid.rotation_index(iflip, ipsi);
                assert_eq!(grid.split_rotation(r), (iflip, ipsi));
            }
        }
        assert_eq!(grid.mirror_of_flip(3), 0);
        assert_eq!(grid.mirror_of_flip(4), 1);
    }

    #[test]
    fn test_window_derived_from_sigma_and_clipped() {
        let w = TranslationWindow::new(2.0, 64, false, None);
        assert_eq!(w.half_width(), 12);
        let reduced = TranslationWindow::new(2.0, 64, true, None);
        assert_eq!(reduced.half_width(), 6);
        let clipped = TranslationWindow::new(3.0, 16, false, None);
        assert_eq!(clipped.half_width(), 7);
        assert!(clipped.side() <= 16);
        // Sub-pixel sigma still searches one sigma-unit of pixels.
        assert_eq!(TranslationWindow::new(0.3, 64, false, None).half_width(), 6);
    }

    #[test]
    fn test_window_collapses_for_zero_sigma() {
        let w = TranslationWindow::new(0.0, 32, false, None);
        assert_eq!(w.half_width(), 0);
        assert_eq!(w.offsets().collect::<Vec<_>>(), vec![[0, 0]]);

        let forced = TranslationWindow::new(0.0, 32, false, Some(3));
        assert_eq!(forced.n_offsets(), 49);
        assert!(forced.offsets().any(|o| o == [0, 0]));
    }

    #[test]
    fn test_offset_prior_normalized_and_peaked() {
        let prior = OffsetPrior::new(2.0, 16);
        let total: f64 = prior.pdf.sum();
        assert!((total - 1.0).abs() < 1e-12);
        assert!(prior.pdf([0, 0]) > prior.pdf([1, 0]));
        assert!((prior.pdf([2, -1]) - prior.pdf([-2, 1])).abs() < 1e-15);
        assert!((prior.pdf([1, 2]) - prior.pdf([2, 1])).abs() < 1e-15);
    }

    #[test]
    fn test_offset_prior_point_mass() {
        let prior = OffsetPrior::new(0.0, 8);
        assert_eq!(prior.pdf([0, 0]), 1.0);
        assert_eq!(prior.pdf([1, 0]), 0.0);
    }
}
