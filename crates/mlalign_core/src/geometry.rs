//! In-plane image geometry: exact right-angle flips, interpolated rotations and
//! periodic integer translations.
//!
//! Coordinates are `(y, x)` offsets from the logical origin `(dim/2, dim/2)`,
//! wrapping periodically at the image border, the same convention the FFT
//! cross-correlation uses for translations.

use ndarray::{Array2, ArrayView2};

use crate::float_trait::MlFloat;

/// Integer 2x2 matrix acting on `(y, x)` offsets.
pub type IntMatrix = [[isize; 2]; 2];

/// Quarter-turn (90°) rotation of `(y, x)`.
const QUARTER_TURN: IntMatrix = [[0, 1], [-1, 0]];

/// Reflection `x -> -x`.
const MIRROR: IntMatrix = [[1, 0], [0, -1]];

const IDENTITY: IntMatrix = [[1, 0], [0, 1]];

/// One of the 4 (or 8 with mirroring) lossless image flips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flip {
    /// Number of quarter turns, 0..4.
    pub quarter_turns: u8,
    /// Reflection applied before the rotation.
    pub mirrored: bool,
}

impl Flip {
    /// All flips in hypothesis order: the plain rotations first, then the mirrored ones.
    pub fn all(with_mirror: bool) -> Vec<Flip> {
        let mirrors: &[bool] = if with_mirror { &[false, true] } else { &[false] };
        mirrors
            .iter()
            .flat_map(|&mirrored| {
                (0..4u8).map(move |quarter_turns| Flip {
                    quarter_turns,
                    mirrored,
                })
            })
            .collect()
    }

    /// Matrix `G` such that the flipped image is `X_f(p) = X(G p)`.
    pub fn matrix(&self) -> IntMatrix {
        let mut m = IDENTITY;
        for _ in 0..self.quarter_turns {
            m = mat_mul(&QUARTER_TURN, &m);
        }
        if self.mirrored {
            m = mat_mul(&m, &MIRROR);
        }
        m
    }

    /// Rotation angle contributed by the flip, in degrees.
    pub fn angle_degrees(&self) -> f64 {
        90.0 * self.quarter_turns as f64
    }

    /// Map an offset found on the flipped image back to the original image frame.
    pub fn to_image_frame(&self, offset: [isize; 2]) -> [isize; 2] {
        mat_vec(&self.matrix(), offset)
    }

    /// Map an offset in the original image frame onto the flipped image.
    pub fn to_flipped_frame(&self, offset: [isize; 2]) -> [isize; 2] {
        // Flip matrices are orthogonal, so the inverse is the transpose.
        let m = self.matrix();
        let transpose = [[m[0][0], m[1][0]], [m[0][1], m[1][1]]];
        mat_vec(&transpose, offset)
    }
}

fn mat_mul(a: &IntMatrix, b: &IntMatrix) -> IntMatrix {
    let mut out = [[0isize; 2]; 2];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, slot) in row.iter_mut().enumerate() {
            *slot = a[i][0] * b[0][j] + a[i][1] * b[1][j];
        }
    }
    out
}

fn mat_vec(m: &IntMatrix, v: [isize; 2]) -> [isize; 2] {
    [
        m[0][0] * v[0] + m[0][1] * v[1],
        m[1][0] * v[0] + m[1][1] * v[1],
    ]
}

#[inline]
fn wrap(index: isize, dim: usize) -> usize {
    index.rem_euclid(dim as isize) as usize
}

/// Apply a flip: `out(p) = input(G p)`. Lossless for square images.
pub fn flip_image<F: MlFloat>(input: ArrayView2<F>, flip: Flip) -> Array2<F> {
    let (dim, _) = input.dim();
    let origin = (dim / 2) as isize;
    let m = flip.matrix();
    Array2::from_shape_fn((dim, dim), |(r, c)| {
        let src = mat_vec(&m, [r as isize - origin, c as isize - origin]);
        input[[wrap(src[0] + origin, dim), wrap(src[1] + origin, dim)]]
    })
}

/// Periodic integer translation: `out(q) = input(q - shift)`.
pub fn translate_periodic<F: MlFloat>(input: ArrayView2<F>, shift: [isize; 2]) -> Array2<F> {
    let (rows, cols) = input.dim();
    Array2::from_shape_fn((rows, cols), |(r, c)| {
        input[[
            wrap(r as isize - shift[0], rows),
            wrap(c as isize - shift[1], cols),
        ]]
    })
}

/// Mean of the pixels outside the inscribed circle of radius `dim/2`.
pub fn outside_mask_mean<F: MlFloat>(input: ArrayView2<F>) -> F {
    let (dim, _) = input.dim();
    let origin = (dim / 2) as isize;
    let radius2 = origin * origin;
    let mut sum = F::zero();
    let mut count = 0usize;
    for ((r, c), &v) in input.indexed_iter() {
        let y = r as isize - origin;
        let x = c as isize - origin;
        if y * y + x * x > radius2 {
            sum += v;
            count += 1;
        }
    }
    if count == 0 {
        F::zero()
    } else {
        sum / F::usize_as(count)
    }
}

/// Replace every pixel outside the inscribed circle by `fill`.
pub fn apply_circular_mask<F: MlFloat>(image: &mut Array2<F>, fill: F) {
    let (dim, _) = image.dim();
    let origin = (dim / 2) as isize;
    let radius2 = origin * origin;
    for ((r, c), v) in image.indexed_iter_mut() {
        let y = r as isize - origin;
        let x = c as isize - origin;
        if y * y + x * x > radius2 {
            *v = fill;
        }
    }
}

/// Rotate by `angle_degrees` about the origin: `out(p) = input(R(-angle) p)`.
///
/// Bilinear interpolation with periodic wrap; the corners outside the
/// inscribed circle are then filled with the input's outside mean, hiding the
/// wrapped-in border. A zero angle returns an exact copy.
pub fn rotate<F: MlFloat>(input: ArrayView2<F>, angle_degrees: f64) -> Array2<F> {
    if angle_degrees == 0.0 {
        return input.to_owned();
    }
    let (dim, _) = input.dim();
    let origin = (dim / 2) as f64;
    let (s, c) = angle_degrees.to_radians().sin_cos();

    let mut out = Array2::from_shape_fn((dim, dim), |(r, col)| {
        let y = r as f64 - origin;
        let x = col as f64 - origin;
        // R(-angle) applied to (y, x)
        let sy = y * c - x * s + origin;
        let sx = x * c + y * s + origin;
        bilinear_periodic(input, sy, sx)
    });
    apply_circular_mask(&mut out, outside_mask_mean(input));
    out
}

fn bilinear_periodic<F: MlFloat>(input: ArrayView2<F>, y: f64, x: f64) -> F {
    let (rows, cols) = input.dim();
    let y0 = y.floor();
    let x0 = x.floor();
    let fy = F::from_f64_c(y - y0);
    let fx = F::from_f64_c(x - x0);
    let r0 = wrap(y0 as isize, rows);
    let r1 = wrap(y0 as isize + 1, rows);
    let c0 = wrap(x0 as isize, cols);
    let c1 = wrap(x0 as isize + 1, cols);
    let one = F::one();
    let top = input[[r0, c0]] * (one - fx) + input[[r0, c1]] * fx;
    let bottom = input[[r1, c0]] * (one - fx) + input[[r1, c1]] * fx;
    top * (one - fy) + bottom * fy
}

/// Sum of squares.
pub fn energy<F: MlFloat>(input: ArrayView2<F>) -> f64 {
    input.iter().map(|&v| v.as_f64() * v.as_f64()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{asymmetric_particle, random_matrix_f64};

    #[test]
    fn test_flip_matrices_are_distinct_and_orthogonal() {
        let flips = Flip::all(true);
        assert_eq!(flips.len(), 8);
        for (i, a) in flips.iter().enumerate() {
            let m = a.matrix();
            let det = m[0][0] * m[1][1] - m[0][1] * m[1][0];
            assert_eq!(det.abs(), 1);
            assert_eq!(det < 0, a.mirrored, "mirror flips reverse orientation");
            for b in flips.iter().skip(i + 1) {
                assert_ne!(a.matrix(), b.matrix());
            }
        }
        assert_eq!(Flip::all(false).len(), 4);
    }

    #[test]
    fn test_flip_offsets_round_trip() {
        for flip in Flip::all(true) {
            let offset = [3, -5];
            assert_eq!(flip.to_flipped_frame(flip.to_image_frame(offset)), offset);
        }
    }

    #[test]
    fn test_four_quarter_turns_restore_image() {
        let image = random_matrix_f64(9, 9, 5);
        let quarter = Flip {
            quarter_turns: 1,
            mirrored: false,
        };
        let mut current = image.clone();
        for _ in 0..4 {
            current = flip_image(current.view(), quarter);
        }
        assert_eq!(current, image);
    }

    #[test]
    fn test_quarter_turn_flip_matches_interpolated_rotation() {
        // A flip by G = R(90) gives X(R(90) p), i.e. the image rotated by -90°.
        let image = asymmetric_particle(16, 1.0);
        let flipped = flip_image(
            image.view(),
            Flip {
                quarter_turns: 1,
                mirrored: false,
            },
        );
        let mut rotated = rotate(image.view(), -90.0);
        let mut expected = flipped.clone();
        // Compare inside the mask only.
        apply_circular_mask(&mut rotated, 0.0);
        apply_circular_mask(&mut expected, 0.0);
        for (a, b) in rotated.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-9, "rotation {} vs flip {}", a, b);
        }
    }

    #[test]
    fn test_translate_periodic_wraps() {
        let image = random_matrix_f64(6, 6, 1);
        let moved = translate_periodic(image.view(), [1, -2]);
        assert_eq!(moved[[1, 0]], image[[0, 2]]);
        assert_eq!(moved[[0, 4]], image[[5, 0]]);
        let back = translate_periodic(moved.view(), [-1, 2]);
        assert_eq!(back, image);
    }

    #[test]
    fn test_rotation_by_zero_is_exact_copy() {
        let image = random_matrix_f64(8, 8, 2);
        assert_eq!(rotate(image.view(), 0.0), image);
    }

    #[test]
    fn test_rotation_loses_some_energy() {
        let image = random_matrix_f64(16, 16, 11);
        let rotated = rotate(image.view(), 37.0);
        assert!(energy(rotated.view()) < energy(image.view()));
    }

    #[test]
    fn test_outside_mask_mean_of_constant() {
        let image = Array2::<f64>::from_elem((10, 10), 2.5);
        assert!((outside_mask_mean(image.view()) - 2.5).abs() < 1e-12);
    }
}
