//! 3D real/complex transforms composed from 1D `rustfft` plans.
//!
//! Real grids are `[nx][ny][nz]`, complex grids the half-complex
//! `[nx][ny][nz/2 + 1]`, both with the last index fastest. Transforms are
//! unnormalised: `backward(forward(x)) == nx*ny*nz * x`.

use std::ops::Range;
use std::sync::Arc;

use anyhow::{ensure, Result};
use rayon::prelude::*;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

/// Direction of a grid transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FftDirection {
    RealToComplex,
    ComplexToReal,
}

/// Spreads slab-wise transform work over threads.
///
/// `data` is cut into slabs of `unit` elements; `f` receives a range of slab
/// indices together with the matching contiguous chunk.
pub trait SlabDriver: Sync {
    fn for_each_slab<T, F>(&self, data: &mut [T], unit: usize, f: F)
    where
        T: Send,
        F: Fn(Range<usize>, &mut [T]) + Sync;
}

/// One slab per task, split and balanced by rayon. Used on the device stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdaptiveSlabs;

impl SlabDriver for AdaptiveSlabs {
    fn for_each_slab<T, F>(&self, data: &mut [T], unit: usize, f: F)
    where
        T: Send,
        F: Fn(Range<usize>, &mut [T]) + Sync,
    {
        data.par_chunks_mut(unit.max(1))
            .enumerate()
            .for_each(|(i, chunk)| f(i..i + 1, chunk));
    }
}

/// Planned 3D transform for one grid shape. Cheap to clone.
#[derive(Clone)]
pub struct Fft3d {
    dims: [usize; 3],
    forward: [Arc<dyn Fft<f64>>; 3],
    inverse: [Arc<dyn Fft<f64>>; 3],
}

impl std::fmt::Debug for Fft3d {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fft3d").field("dims", &self.dims).finish()
    }
}

impl Fft3d {
    pub fn new(dims: [usize; 3]) -> Self {
        let mut planner = FftPlanner::new();
        let forward = dims.map(|n| planner.plan_fft_forward(n));
        let inverse = dims.map(|n| planner.plan_fft_inverse(n));
        Self {
            dims,
            forward,
            inverse,
        }
    }

    pub fn real_len(&self) -> usize {
        self.dims[0] * self.dims[1] * self.dims[2]
    }

    pub fn complex_len(&self) -> usize {
        self.dims[0] * self.dims[1] * (self.dims[2] / 2 + 1)
    }

    /// Executes one transform between the real and complex grids.
    pub fn execute(
        &self,
        direction: FftDirection,
        real: &mut [f64],
        complex: &mut [Complex<f64>],
    ) -> Result<()> {
        self.execute_with(&AdaptiveSlabs, direction, real, complex)
    }

    /// Same as [`execute`](Self::execute) with every pass split by `driver`.
    pub fn execute_with<D: SlabDriver>(
        &self,
        driver: &D,
        direction: FftDirection,
        real: &mut [f64],
        complex: &mut [Complex<f64>],
    ) -> Result<()> {
        ensure!(
            real.len() == self.real_len() && complex.len() == self.complex_len(),
            "FFT buffer size mismatch: real {} (expected {}), complex {} (expected {})",
            real.len(),
            self.real_len(),
            complex.len(),
            self.complex_len()
        );
        match direction {
            FftDirection::RealToComplex => self.forward_r2c(driver, real, complex),
            FftDirection::ComplexToReal => self.backward_c2r(driver, complex, real),
        }
        Ok(())
    }

    fn forward_r2c<D: SlabDriver>(&self, driver: &D, real: &[f64], complex: &mut [Complex<f64>]) {
        let [_, ny, nz] = self.dims;
        let nzc = nz / 2 + 1;
        let slab = ny * nz;

        let mut full = vec![Complex::new(0.0, 0.0); self.real_len()];
        driver.for_each_slab(&mut full, slab, |xs, chunk| {
            let src = &real[xs.start * slab..xs.end * slab];
            for (c, &v) in chunk.iter_mut().zip(src) {
                *c = Complex::new(v, 0.0);
            }
        });
        self.transform_all_axes(driver, &mut full, &self.forward);

        let full = &full;
        driver.for_each_slab(complex, ny * nzc, |xs, chunk| {
            for (half, row) in chunk
                .chunks_mut(nzc)
                .zip(full[xs.start * slab..xs.end * slab].chunks(nz))
            {
                half.copy_from_slice(&row[..nzc]);
            }
        });
    }

    fn backward_c2r<D: SlabDriver>(&self, driver: &D, complex: &[Complex<f64>], real: &mut [f64]) {
        let [nx, ny, nz] = self.dims;
        let nzc = nz / 2 + 1;
        let slab = ny * nz;

        // Hermitian completion of the half-complex grid.
        let mut full = vec![Complex::new(0.0, 0.0); self.real_len()];
        driver.for_each_slab(&mut full, slab, |xs, chunk| {
            for (x, plane) in xs.zip(chunk.chunks_mut(slab)) {
                let mx = (nx - x) % nx;
                for y in 0..ny {
                    let my = (ny - y) % ny;
                    for z in 0..nz {
                        plane[y * nz + z] = if z < nzc {
                            complex[(x * ny + y) * nzc + z]
                        } else {
                            complex[(mx * ny + my) * nzc + (nz - z)].conj()
                        };
                    }
                }
            }
        });

        self.transform_all_axes(driver, &mut full, &self.inverse);
        let full = &full;
        driver.for_each_slab(real, slab, |xs, chunk| {
            for (r, c) in chunk.iter_mut().zip(&full[xs.start * slab..xs.end * slab]) {
                *r = c.re;
            }
        });
    }

    fn transform_all_axes<D: SlabDriver>(
        &self,
        driver: &D,
        data: &mut [Complex<f64>],
        plans: &[Arc<dyn Fft<f64>>; 3],
    ) {
        let [nx, ny, nz] = self.dims;
        let plane = ny * nz;

        // z rows, then y lines, within each x slab
        driver.for_each_slab(data, plane, |_, chunk| {
            let mut line = vec![Complex::new(0.0, 0.0); ny];
            for slab in chunk.chunks_mut(plane) {
                for row in slab.chunks_mut(nz) {
                    plans[2].process(row);
                }
                for z in 0..nz {
                    for y in 0..ny {
                        line[y] = slab[y * nz + z];
                    }
                    plans[1].process(&mut line);
                    for y in 0..ny {
                        slab[y * nz + z] = line[y];
                    }
                }
            }
        });

        // x: gather every (y, z) line, transform, scatter back
        let mut lines = vec![Complex::new(0.0, 0.0); plane * nx];
        {
            let data = &*data;
            driver.for_each_slab(&mut lines, nx, |yzs, chunk| {
                for (yz, line) in yzs.zip(chunk.chunks_mut(nx)) {
                    for (x, value) in line.iter_mut().enumerate() {
                        *value = data[x * plane + yz];
                    }
                    plans[0].process(line);
                }
            });
        }
        let lines = &lines;
        driver.for_each_slab(data, plane, |xs, chunk| {
            for (x, slab) in xs.zip(chunk.chunks_mut(plane)) {
                for (yz, value) in slab.iter_mut().enumerate() {
                    *value = lines[yz * nx + x];
                }
            }
        });
    }
}
