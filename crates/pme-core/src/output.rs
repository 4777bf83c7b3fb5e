//! Step outputs and the engine-side accumulators they are reduced into.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{Matrix, RVec};

/// Result bundle fetched from the pipeline once a step has completed.
///
/// Created fresh at fetch time and consumed by the output reducer.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutput {
    /// Per-particle reciprocal-space forces; empty unless `have_force_output`
    pub forces: Vec<RVec>,
    pub coulomb_energy: f64,
    pub coulomb_virial: Matrix,
    pub coulomb_dvdl: f64,
    /// Forces were copied back for host-side reduction
    pub have_force_output: bool,
}

impl Default for TaskOutput {
    fn default() -> Self {
        Self {
            forces: Vec::new(),
            coulomb_energy: 0.0,
            coulomb_virial: Matrix::zeros(),
            coulomb_dvdl: 0.0,
            have_force_output: false,
        }
    }
}

/// Energy terms tracked by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnergyTerm {
    CoulombRecip,
}

/// Components of the linear free-energy derivative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FepComponent {
    Coulomb,
}

/// Energy accumulator owned by the engine.
#[derive(Debug, Clone, Default)]
pub struct EnergyData {
    terms: HashMap<EnergyTerm, f64>,
    dvdl_lin: HashMap<FepComponent, f64>,
}

impl EnergyData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn term(&self, term: EnergyTerm) -> f64 {
        self.terms.get(&term).copied().unwrap_or(0.0)
    }

    pub fn add_term(&mut self, term: EnergyTerm, value: f64) {
        *self.terms.entry(term).or_insert(0.0) += value;
    }

    pub fn dvdl_lin(&self, component: FepComponent) -> f64 {
        self.dvdl_lin.get(&component).copied().unwrap_or(0.0)
    }

    pub fn add_dvdl_lin(&mut self, component: FepComponent, value: f64) {
        *self.dvdl_lin.entry(component).or_insert(0.0) += value;
    }
}

/// Force array plus the virial contribution of forces that cannot be
/// expressed as single-sum virial terms (long-range electrostatics).
#[derive(Debug, Clone)]
pub struct ForceWithVirial {
    pub force: Vec<RVec>,
    pub compute_virial: bool,
    virial: Matrix,
}

impl ForceWithVirial {
    pub fn new(n_atoms: usize, compute_virial: bool) -> Self {
        Self {
            force: vec![RVec::zeros(); n_atoms],
            compute_virial,
            virial: Matrix::zeros(),
        }
    }

    pub fn add_virial_contribution(&mut self, virial: &Matrix) {
        if self.compute_virial {
            self.virial += virial;
        }
    }

    pub fn virial(&self) -> &Matrix {
        &self.virial
    }
}
