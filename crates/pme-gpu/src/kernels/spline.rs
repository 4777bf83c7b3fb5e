//! Cardinal B-spline interpolation weights.
//!
//! For each particle and dimension the spread/gather kernels need `order`
//! weights θ, their derivatives dθ, and the grid indices they apply to.

use pme_core::{Matrix, RVec, DIM};
use rayon::prelude::*;

/// Values below this are treated as zeros of |b(m)|² and smoothed.
const BSP_MOD_EPSILON: f64 = 1e-7;

/// Fills `theta`/`dtheta` with the spline weights at fractional offset `dr`.
///
/// `theta[k]` is M_n(dr + n - 1 - k), the weight of grid point
/// `floor(u) + k - (n - 1)`.
pub fn bspline_weights(dr: f64, theta: &mut [f64], dtheta: &mut [f64]) {
    let order = theta.len();
    debug_assert!(order >= 3 && dtheta.len() == order);

    theta[order - 1] = 0.0;
    theta[1] = dr;
    theta[0] = 1.0 - dr;

    for k in 3..order {
        let div = 1.0 / (k as f64 - 1.0);
        theta[k - 1] = div * dr * theta[k - 2];
        for l in 1..(k - 1) {
            theta[k - l - 1] = div
                * ((dr + l as f64) * theta[k - l - 2] + (k as f64 - l as f64 - dr) * theta[k - l - 1]);
        }
        theta[0] *= div * (1.0 - dr);
    }

    dtheta[0] = -theta[0];
    for k in 1..order {
        dtheta[k] = theta[k - 1] - theta[k];
    }

    let div = 1.0 / (order as f64 - 1.0);
    theta[order - 1] = div * dr * theta[order - 2];
    for l in 1..(order - 1) {
        theta[order - l - 1] = div
            * ((dr + l as f64) * theta[order - l - 2]
                + (order as f64 - l as f64 - dr) * theta[order - l - 1]);
    }
    theta[0] *= div * (1.0 - dr);
}

/// |b(m)|² for one grid dimension.
pub fn bspline_moduli(n: usize, order: usize) -> Vec<f64> {
    let mut theta = vec![0.0; order];
    let mut dtheta = vec![0.0; order];
    bspline_weights(0.0, &mut theta, &mut dtheta);

    let mut data = vec![0.0; n];
    for (k, &value) in theta.iter().enumerate() {
        data[(k + 1) % n] += value;
    }

    let mut moduli: Vec<f64> = (0..n)
        .map(|i| {
            let (mut sc, mut ss) = (0.0, 0.0);
            for (j, &value) in data.iter().enumerate() {
                let arg = 2.0 * std::f64::consts::PI * (i * j) as f64 / n as f64;
                sc += value * arg.cos();
                ss += value * arg.sin();
            }
            sc * sc + ss * ss
        })
        .collect();

    for i in 0..n {
        if moduli[i] < BSP_MOD_EPSILON {
            moduli[i] = 0.5 * (moduli[(i + n - 1) % n] + moduli[(i + 1) % n]);
        }
    }
    moduli
}

/// B-spline moduli for the three grid dimensions.
#[derive(Debug, Clone)]
pub struct BSplineModuli {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Vec<f64>,
}

impl BSplineModuli {
    pub fn new(grid_size: [usize; 3], order: usize) -> Self {
        Self {
            x: bspline_moduli(grid_size[0], order),
            y: bspline_moduli(grid_size[1], order),
            z: bspline_moduli(grid_size[2], order),
        }
    }
}

/// Per-particle interpolation data, indexed `[(atom * DIM + dim) * order + k]`.
#[derive(Debug, Clone, Default)]
pub struct SplineData {
    pub order: usize,
    pub theta: Vec<f64>,
    pub dtheta: Vec<f64>,
    pub index: Vec<usize>,
}

impl SplineData {
    pub fn n_atoms(&self) -> usize {
        if self.order == 0 {
            0
        } else {
            self.theta.len() / (DIM * self.order)
        }
    }

    #[inline]
    pub fn offset(&self, atom: usize, dim: usize) -> usize {
        (atom * DIM + dim) * self.order
    }
}

/// Computes spline weights and grid indices for every particle.
///
/// Fractional coordinates are `s_d = Σ_c x_c R[c][d]`, wrapped into [0, 1).
pub fn compute_splines(
    coordinates: &[RVec],
    recip_box: &Matrix,
    grid_size: [usize; 3],
    order: usize,
) -> SplineData {
    let n_atoms = coordinates.len();
    let stride = DIM * order;
    let mut theta = vec![0.0; n_atoms * stride];
    let mut dtheta = vec![0.0; n_atoms * stride];
    let mut index = vec![0usize; n_atoms * stride];

    theta
        .par_chunks_mut(stride)
        .zip(dtheta.par_chunks_mut(stride))
        .zip(index.par_chunks_mut(stride))
        .zip(coordinates.par_iter())
        .for_each(|(((th, dth), idx), x)| {
            for d in 0..DIM {
                let s: f64 = (0..DIM).map(|c| x[c] * recip_box[(c, d)]).sum();
                let n = grid_size[d];
                let u = (s - s.floor()) * n as f64;
                let base = u.floor();
                let dr = u - base;
                let range = d * order..(d + 1) * order;
                bspline_weights(dr, &mut th[range.clone()], &mut dth[range]);

                let first = base as isize - (order as isize - 1);
                for k in 0..order {
                    idx[d * order + k] = (first + k as isize).rem_euclid(n as isize) as usize;
                }
            }
        });

    SplineData {
        order,
        theta,
        dtheta,
        index,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_weights_partition_unity() {
        for order in 3..=8 {
            let mut th = vec![0.0; order];
            let mut dth = vec![0.0; order];
            for &dr in &[0.0, 0.25, 0.5, 0.9] {
                bspline_weights(dr, &mut th, &mut dth);
                assert_relative_eq!(th.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
                assert_relative_eq!(dth.iter().sum::<f64>(), 0.0, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_order_four_values() {
        let mut th = [0.0; 4];
        let mut dth = [0.0; 4];
        bspline_weights(0.0, &mut th, &mut dth);
        assert_relative_eq!(th[0], 1.0 / 6.0, epsilon = 1e-12);
        assert_relative_eq!(th[1], 4.0 / 6.0, epsilon = 1e-12);
        assert_relative_eq!(th[2], 1.0 / 6.0, epsilon = 1e-12);
        assert_relative_eq!(th[3], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_derivative_matches_finite_difference() {
        let order = 6;
        let h = 1e-6;
        let (mut lo, mut hi, mut d) = (vec![0.0; order], vec![0.0; order], vec![0.0; order]);
        let mut scratch = vec![0.0; order];
        bspline_weights(0.4 - h, &mut lo, &mut scratch);
        bspline_weights(0.4 + h, &mut hi, &mut scratch);
        let mut mid = vec![0.0; order];
        bspline_weights(0.4, &mut mid, &mut d);
        for k in 0..order {
            assert_relative_eq!(d[k], (hi[k] - lo[k]) / (2.0 * h), epsilon = 1e-6);
        }
    }

    #[test]
    fn test_moduli_positive_and_symmetric() {
        let moduli = bspline_moduli(16, 5);
        assert!(moduli.iter().all(|&m| m > 0.0));
        assert_relative_eq!(moduli[0], 1.0, epsilon = 1e-12);
        for k in 1..16 {
            assert_relative_eq!(moduli[k], moduli[16 - k], epsilon = 1e-12);
        }
    }

    #[test]
    fn test_indices_wrap() {
        let recip = Matrix::from_diagonal_element(1.0 / 2.0);
        let splines = compute_splines(&[RVec::new(0.01, 1.99, -0.01)], &recip, [10, 10, 10], 4);
        assert_eq!(splines.n_atoms(), 1);
        for &i in &splines.index {
            assert!(i < 10);
        }
        // x near the origin reaches back across the periodic boundary
        assert_eq!(&splines.index[0..4], &[7, 8, 9, 0]);
    }
}
