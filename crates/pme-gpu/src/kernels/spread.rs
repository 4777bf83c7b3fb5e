//! Charge spreading and force gathering.

use pme_core::{Matrix, RVec, DIM};
use rayon::prelude::*;

use super::spline::SplineData;

/// Deposits `charges` onto the real grid (`[nx][ny][nz]`, z fastest).
///
/// The grid is accumulated into, not cleared.
pub fn spread_charges(splines: &SplineData, charges: &[f64], grid: &mut [f64], grid_size: [usize; 3]) {
    let [_, ny, nz] = grid_size;
    let order = splines.order;
    debug_assert_eq!(charges.len(), splines.n_atoms());

    for (atom, &q) in charges.iter().enumerate() {
        if q == 0.0 {
            continue;
        }
        let ox = splines.offset(atom, 0);
        let oy = splines.offset(atom, 1);
        let oz = splines.offset(atom, 2);
        for i in 0..order {
            let ix = splines.index[ox + i];
            let vx = q * splines.theta[ox + i];
            for j in 0..order {
                let iy = splines.index[oy + j];
                let vxy = vx * splines.theta[oy + j];
                let row = (ix * ny + iy) * nz;
                for k in 0..order {
                    grid[row + splines.index[oz + k]] += vxy * splines.theta[oz + k];
                }
            }
        }
    }
}

/// Adds `scale` times the reciprocal-space force of every particle to `forces`.
///
/// `grid` is the convolved potential produced by the inverse transform;
/// `F_c = -q Σ_d R[c][d] K_d ∂φ/∂u_d`.
pub fn gather_forces(
    splines: &SplineData,
    charges: &[f64],
    grid: &[f64],
    grid_size: [usize; 3],
    recip_box: &Matrix,
    scale: f64,
    forces: &mut [RVec],
) {
    let [nx, ny, nz] = grid_size;
    let order = splines.order;
    let dims = [nx as f64, ny as f64, nz as f64];

    forces
        .par_iter_mut()
        .zip(charges.par_iter())
        .enumerate()
        .for_each(|(atom, (force, &q))| {
            if q == 0.0 {
                return;
            }
            let ox = splines.offset(atom, 0);
            let oy = splines.offset(atom, 1);
            let oz = splines.offset(atom, 2);
            let (mut fx, mut fy, mut fz) = (0.0, 0.0, 0.0);
            for i in 0..order {
                let ix = splines.index[ox + i];
                let (tx, dtx) = (splines.theta[ox + i], splines.dtheta[ox + i]);
                for j in 0..order {
                    let iy = splines.index[oy + j];
                    let (ty, dty) = (splines.theta[oy + j], splines.dtheta[oy + j]);
                    let row = (ix * ny + iy) * nz;
                    for k in 0..order {
                        let value = grid[row + splines.index[oz + k]];
                        let (tz, dtz) = (splines.theta[oz + k], splines.dtheta[oz + k]);
                        fx += dtx * ty * tz * value;
                        fy += tx * dty * tz * value;
                        fz += tx * ty * dtz * value;
                    }
                }
            }
            let g = [fx * dims[0], fy * dims[1], fz * dims[2]];
            for c in 0..DIM {
                let f: f64 = (0..DIM).map(|d| recip_box[(c, d)] * g[d]).sum();
                force[c] -= scale * q * f;
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::spline::compute_splines;
    use approx::assert_relative_eq;

    #[test]
    fn test_spread_conserves_charge() {
        let grid_size = [8, 8, 8];
        let recip = Matrix::from_diagonal_element(1.0 / 1.6);
        let coords = [RVec::new(0.1, 0.7, 1.5), RVec::new(1.2, 0.3, 0.9)];
        let splines = compute_splines(&coords, &recip, grid_size, 4);

        let mut grid = vec![0.0; 512];
        spread_charges(&splines, &[0.8, -0.3], &mut grid, grid_size);
        assert_relative_eq!(grid.iter().sum::<f64>(), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_uniform_potential_gives_no_force() {
        let grid_size = [8, 8, 8];
        let recip = Matrix::from_diagonal_element(1.0 / 1.6);
        let splines = compute_splines(&[RVec::new(0.4, 0.9, 1.1)], &recip, grid_size, 5);

        let grid = vec![3.0; 512];
        let mut forces = vec![RVec::zeros()];
        gather_forces(&splines, &[1.0], &grid, grid_size, &recip, 1.0, &mut forces);
        assert!(forces[0].norm() < 1e-10);
    }
}
