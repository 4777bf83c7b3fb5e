//! Geometric types shared by the pipeline and the engine.
//!
//! Boxes are stored row-wise: row `i` is box vector `i`, so a lower-triangular
//! matrix is the usual triclinic convention (a along x, b in the xy-plane).

use nalgebra::{Matrix3, Vector3};

/// Number of spatial dimensions.
pub const DIM: usize = 3;

/// 3×3 matrix for boxes, reciprocal boxes and virials.
pub type Matrix = Matrix3<f64>;

/// Per-particle 3-vector (positions, forces).
pub type RVec = Vector3<f64>;

/// Energy and virial contribution of one grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyVirial {
    pub energy: f64,
    pub virial: Matrix,
}

impl Default for EnergyVirial {
    fn default() -> Self {
        Self {
            energy: 0.0,
            virial: Matrix::zeros(),
        }
    }
}

impl EnergyVirial {
    /// True when the energy and every virial component are finite.
    pub fn is_finite(&self) -> bool {
        self.energy.is_finite() && self.virial.iter().all(|v| v.is_finite())
    }
}

/// Builds a box matrix from its three row vectors.
pub fn box_from_rows(a: [f64; 3], b: [f64; 3], c: [f64; 3]) -> Matrix {
    Matrix::new(a[0], a[1], a[2], b[0], b[1], b[2], c[0], c[1], c[2])
}

/// Cubic box of edge `length`.
pub fn cubic_box(length: f64) -> Matrix {
    Matrix::from_diagonal_element(length)
}

/// Iterates the six independent entries of a lower-triangular box.
pub fn lower_triangle() -> impl Iterator<Item = (usize, usize)> {
    (0..DIM).flat_map(|i| (0..=i).map(move |j| (i, j)))
}
