//! Reference PME kernels.
//!
//! The same kernels back both the device stages (run as stream jobs) and the
//! host-threaded fallbacks (run on the fixed host pool).

pub mod fft;
pub mod solve;
pub mod spline;
pub mod spread;

pub use fft::{AdaptiveSlabs, Fft3d, FftDirection, SlabDriver};
pub use solve::{reduce_partials, solve_grid, solve_x_range, GridOrdering, SolveParams, ONE_4PI_EPS0};
pub use spline::{bspline_moduli, bspline_weights, compute_splines, BSplineModuli, SplineData};
pub use spread::{gather_forces, spread_charges};
