//! Reciprocal-space solve on the half-complex grid.
//!
//! Each element is multiplied by the influence function
//! `elfac · exp(-π²m²/β²) / (π V m² |b(m)|²)`; when requested, the
//! reciprocal energy and virial are accumulated on the way.

use std::f64::consts::PI;
use std::ops::Range;

use pme_core::{EnergyVirial, Matrix, DIM};
use rayon::prelude::*;
use rustfft::num_complex::Complex;

use super::spline::BSplineModuli;

/// Coulomb conversion factor 1/(4πε₀) in kJ mol⁻¹ nm e⁻².
pub const ONE_4PI_EPS0: f64 = 138.935458;

/// Traversal order of the device solve over the complex grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridOrdering {
    /// x outermost; single-rank layout
    Xyz,
    /// z outermost; matches a decomposed local domain
    Zyx,
}

/// Parameters shared by every solve element of one grid.
#[derive(Debug, Clone)]
pub struct SolveParams {
    pub grid_size: [usize; 3],
    pub recip_box: Matrix,
    pub volume: f64,
    pub ewald_coeff: f64,
    pub epsilon_r: f64,
}

impl SolveParams {
    pub fn complex_dims(&self) -> [usize; 3] {
        [self.grid_size[0], self.grid_size[1], self.grid_size[2] / 2 + 1]
    }
}

/// Unscaled energy/virial sums; `finish` applies the final factors.
#[derive(Debug, Clone, Copy, Default)]
struct EvAccumulator {
    energy: f64,
    virial: [[f64; DIM]; DIM],
}

impl EvAccumulator {
    fn merge(mut self, other: Self) -> Self {
        self.energy += other.energy;
        for a in 0..DIM {
            for b in 0..DIM {
                self.virial[a][b] += other.virial[a][b];
            }
        }
        self
    }

    fn finish(self) -> EnergyVirial {
        EnergyVirial {
            energy: 0.5 * self.energy,
            virial: Matrix::from_fn(|a, b| 0.25 * self.virial[a][b]),
        }
    }
}

/// Scales one element in place and returns its energy/virial contribution.
#[inline]
fn solve_element(
    params: &SolveParams,
    moduli: &BSplineModuli,
    [kx, ky, kz]: [usize; 3],
    value: &mut Complex<f64>,
    compute_ev: bool,
) -> EvAccumulator {
    let [nx, ny, nz] = params.grid_size;
    let mx = if kx < (nx + 1) / 2 { kx as f64 } else { kx as f64 - nx as f64 };
    let my = if ky < (ny + 1) / 2 { ky as f64 } else { ky as f64 - ny as f64 };
    let m = [mx, my, kz as f64];

    let r = &params.recip_box;
    let mh: [f64; DIM] = std::array::from_fn(|c| (0..DIM).map(|d| r[(c, d)] * m[d]).sum());
    let m2 = mh.iter().map(|v| v * v).sum::<f64>();

    if m2 == 0.0 {
        *value = Complex::new(0.0, 0.0);
        return EvAccumulator::default();
    }

    let fac = PI * PI / (params.ewald_coeff * params.ewald_coeff);
    let elfac = ONE_4PI_EPS0 / params.epsilon_r;
    let denom = m2 * moduli.x[kx] * moduli.y[ky] * moduli.z[kz] * PI * params.volume;
    let eterm = elfac * (-fac * m2).exp() / denom;

    let mut acc = EvAccumulator::default();
    if compute_ev {
        let corner = if kz == 0 || kz == (nz + 1) / 2 { 0.5 } else { 1.0 };
        let struct2 = 2.0 * value.norm_sqr();
        let ets2 = corner * eterm * struct2;
        let vfactor = (fac * m2 + 1.0) * 2.0 / m2;
        acc.energy = ets2;
        for a in 0..DIM {
            for b in 0..DIM {
                let delta = if a == b { 1.0 } else { 0.0 };
                acc.virial[a][b] = ets2 * (vfactor * mh[a] * mh[b] - delta);
            }
        }
    }
    *value *= eterm;
    acc
}

/// Solves the x-slabs `x_range` of `slab` (which holds exactly those slabs).
pub fn solve_x_range(
    params: &SolveParams,
    moduli: &BSplineModuli,
    x_range: Range<usize>,
    slab: &mut [Complex<f64>],
    compute_ev: bool,
) -> EvAccumulatorPartial {
    let [_, ny, nzc] = params.complex_dims();
    let mut acc = EvAccumulator::default();
    for (local_x, plane) in slab.chunks_mut(ny * nzc).enumerate() {
        let kx = x_range.start + local_x;
        for ky in 0..ny {
            for kz in 0..nzc {
                let value = &mut plane[ky * nzc + kz];
                acc = acc.merge(solve_element(params, moduli, [kx, ky, kz], value, compute_ev));
            }
        }
    }
    EvAccumulatorPartial(acc)
}

/// Partial energy/virial sum from one slab of a partitioned solve.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvAccumulatorPartial(EvAccumulator);

/// Folds partial sums into the final energy and virial.
pub fn reduce_partials(partials: impl IntoIterator<Item = EvAccumulatorPartial>) -> EnergyVirial {
    partials
        .into_iter()
        .fold(EvAccumulator::default(), |acc, p| acc.merge(p.0))
        .finish()
}

/// Device solve over the whole grid in the given traversal order.
pub fn solve_grid(
    params: &SolveParams,
    moduli: &BSplineModuli,
    ordering: GridOrdering,
    grid: &mut [Complex<f64>],
    compute_ev: bool,
) -> EnergyVirial {
    let [nx, ny, nzc] = params.complex_dims();
    debug_assert_eq!(grid.len(), nx * ny * nzc);

    match ordering {
        GridOrdering::Xyz => grid
            .par_chunks_mut(ny * nzc)
            .enumerate()
            .map(|(kx, plane)| solve_x_range(params, moduli, kx..kx + 1, plane, compute_ev).0)
            .reduce(EvAccumulator::default, EvAccumulator::merge)
            .finish(),
        GridOrdering::Zyx => {
            let source: &[Complex<f64>] = grid;
            let planes: Vec<(Vec<Complex<f64>>, EvAccumulator)> = (0..nzc)
                .into_par_iter()
                .map(|kz| {
                    let mut acc = EvAccumulator::default();
                    let mut values = Vec::with_capacity(nx * ny);
                    for ky in 0..ny {
                        for kx in 0..nx {
                            let mut value = source[(kx * ny + ky) * nzc + kz];
                            acc = acc.merge(solve_element(
                                params,
                                moduli,
                                [kx, ky, kz],
                                &mut value,
                                compute_ev,
                            ));
                            values.push(value);
                        }
                    }
                    (values, acc)
                })
                .collect();

            let mut total = EvAccumulator::default();
            for (kz, (values, acc)) in planes.into_iter().enumerate() {
                for ky in 0..ny {
                    for kx in 0..nx {
                        grid[(kx * ny + ky) * nzc + kz] = values[ky * nx + kx];
                    }
                }
                total = total.merge(acc);
            }
            total.finish()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn params() -> SolveParams {
        SolveParams {
            grid_size: [8, 6, 10],
            recip_box: Matrix::new(0.5, 0.0, 0.0, -0.1, 0.55, 0.0, 0.05, -0.02, 0.45),
            volume: 1.0 / (0.5 * 0.55 * 0.45),
            ewald_coeff: 3.1,
            epsilon_r: 1.0,
        }
    }

    fn grid(params: &SolveParams) -> Vec<Complex<f64>> {
        let [nx, ny, nzc] = params.complex_dims();
        (0..nx * ny * nzc)
            .map(|i| Complex::new((i as f64 * 0.37).sin(), (i as f64 * 0.11).cos()))
            .collect()
    }

    #[test]
    fn test_orderings_agree() {
        let p = params();
        let moduli = BSplineModuli::new(p.grid_size, 4);
        let mut a = grid(&p);
        let mut b = a.clone();
        let ev_a = solve_grid(&p, &moduli, GridOrdering::Xyz, &mut a, true);
        let ev_b = solve_grid(&p, &moduli, GridOrdering::Zyx, &mut b, true);

        assert_relative_eq!(ev_a.energy, ev_b.energy, max_relative = 1e-12);
        for (x, y) in ev_a.virial.iter().zip(ev_b.virial.iter()) {
            assert_relative_eq!(*x, *y, epsilon = 1e-9);
        }
        assert_eq!(a, b);
    }

    #[test]
    fn test_partitioned_solve_matches_whole_grid() {
        let p = params();
        let moduli = BSplineModuli::new(p.grid_size, 4);
        let [_, ny, nzc] = p.complex_dims();
        let mut whole = grid(&p);
        let mut split = whole.clone();
        let expected = solve_grid(&p, &moduli, GridOrdering::Xyz, &mut whole, true);

        let (left, right) = split.split_at_mut(3 * ny * nzc);
        let partials = vec![
            solve_x_range(&p, &moduli, 0..3, left, true),
            solve_x_range(&p, &moduli, 3..8, right, true),
        ];
        let got = reduce_partials(partials);
        assert_relative_eq!(got.energy, expected.energy, max_relative = 1e-12);
        assert_eq!(split, whole);
    }

    #[test]
    fn test_zero_mode_cleared_and_virial_symmetric() {
        let p = params();
        let moduli = BSplineModuli::new(p.grid_size, 4);
        let mut g = grid(&p);
        let ev = solve_grid(&p, &moduli, GridOrdering::Xyz, &mut g, true);
        assert_eq!(g[0], Complex::new(0.0, 0.0));
        assert!(ev.energy > 0.0);
        assert_relative_eq!(ev.virial[(0, 1)], ev.virial[(1, 0)], epsilon = 1e-9);
    }

    #[test]
    fn test_no_energy_without_request() {
        let p = params();
        let moduli = BSplineModuli::new(p.grid_size, 4);
        let mut g = grid(&p);
        let ev = solve_grid(&p, &moduli, GridOrdering::Xyz, &mut g, false);
        assert_eq!(ev.energy, 0.0);
    }
}
