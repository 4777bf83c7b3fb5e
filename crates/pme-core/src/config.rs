//! PmeConfig - setup-time parameters for the PME GPU pipeline
//!
//! Loaded once (usually from JSON alongside the run input) and never changed
//! while a run is in progress.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{PmeError, Result};
use crate::workload::{ComputeSettings, PmeRunMode};

/// Smallest supported B-spline interpolation order.
pub const MIN_PME_ORDER: usize = 3;

/// Largest supported B-spline interpolation order.
pub const MAX_PME_ORDER: usize = 12;

/// Default real-space cutoff (nm)
pub const DEFAULT_COULOMB_CUTOFF: f64 = 1.0;

/// Default Ewald sum relative tolerance at the cutoff
pub const DEFAULT_EWALD_RTOL: f64 = 1e-5;

/// Compute the Ewald splitting coefficient from cutoff and tolerance.
///
/// Formula: β = sqrt(-ln(tolerance)) / cutoff
pub fn compute_ewald_coeff(cutoff: f64, tolerance: f64) -> f64 {
    debug_assert!(cutoff > 0.0, "Cutoff must be positive");
    debug_assert!(tolerance > 0.0 && tolerance < 1.0, "Tolerance must be in (0, 1)");

    (-tolerance.ln()).sqrt() / cutoff
}

/// Setup-time configuration of one PME solver instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PmeConfig {
    /// Grid points along x, y, z
    pub grid_size: [usize; 3],
    /// B-spline interpolation order
    pub pme_order: usize,
    /// Ewald splitting coefficient β (nm⁻¹)
    pub ewald_coeff: f64,
    /// Relative dielectric constant
    pub epsilon_r: f64,
    /// Threads for host-threaded stages (FFT, solve, force reduction)
    pub nthreads: usize,
    pub run_mode: PmeRunMode,
    /// Ranks sharing the PME grid
    pub nnodes: usize,
    /// Number of decomposed grid dimensions
    pub ndecompdim: usize,
    /// Coulomb PME enabled (LJ-PME is not supported on the device)
    pub do_coulomb: bool,
    /// Two charge states are evaluated simultaneously (FEP on Coulomb)
    pub fep_coulomb: bool,
    /// This rank also computes particle-particle interactions
    pub has_pp_duty: bool,
    pub perform_gpu_gather: bool,
    /// z scaling for 3DC wall geometry; `None` leaves the box untouched
    pub wall_ewald_zfac: Option<f64>,
    /// Platform can query a stream without blocking
    pub stream_query_supported: bool,
}

impl Default for PmeConfig {
    fn default() -> Self {
        Self {
            grid_size: [32, 32, 32],
            pme_order: 4,
            ewald_coeff: compute_ewald_coeff(DEFAULT_COULOMB_CUTOFF, DEFAULT_EWALD_RTOL),
            epsilon_r: 1.0,
            nthreads: 4,
            run_mode: PmeRunMode::Gpu,
            nnodes: 1,
            ndecompdim: 0,
            do_coulomb: true,
            fep_coulomb: false,
            has_pp_duty: true,
            perform_gpu_gather: true,
            wall_ewald_zfac: None,
            stream_query_supported: true,
        }
    }
}

impl PmeConfig {
    /// Parses a JSON configuration and validates it.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: PmeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        log::info!("Loaded PME config from {}", path.display());
        Self::from_json_str(&json)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_PME_ORDER..=MAX_PME_ORDER).contains(&self.pme_order) {
            return Err(PmeError::config(format!(
                "pme_order {} outside {}..={}",
                self.pme_order, MIN_PME_ORDER, MAX_PME_ORDER
            )));
        }
        let min_grid = 2 * (self.pme_order - 1);
        if let Some(n) = self.grid_size.iter().find(|&&n| n < min_grid) {
            return Err(PmeError::config(format!(
                "grid dimension {} is smaller than 2*(pme_order-1) = {}",
                n, min_grid
            )));
        }
        if self.nthreads == 0 {
            return Err(PmeError::config("nthreads must be at least 1"));
        }
        if !(self.ewald_coeff > 0.0) {
            return Err(PmeError::config(format!(
                "ewald_coeff must be positive, got {}",
                self.ewald_coeff
            )));
        }
        if !(self.epsilon_r > 0.0) {
            return Err(PmeError::config(format!(
                "epsilon_r must be positive, got {}",
                self.epsilon_r
            )));
        }
        if self.nnodes == 0 {
            return Err(PmeError::config("nnodes must be at least 1"));
        }
        if let Some(zfac) = self.wall_ewald_zfac {
            if !(zfac >= 1.0) {
                return Err(PmeError::config(format!(
                    "wall_ewald_zfac must be >= 1, got {}",
                    zfac
                )));
            }
        }
        Ok(())
    }

    /// Grid decomposition is active when several ranks share the grid.
    pub fn use_decomposition(&self) -> bool {
        self.nnodes > 1
    }

    /// 2 for dual-state FEP on Coulomb, otherwise 1.
    pub fn ngrids(&self) -> usize {
        if self.fep_coulomb {
            2
        } else {
            1
        }
    }

    /// Stage placement derived from the run mode.
    pub fn compute_settings(&self) -> ComputeSettings {
        let mut settings =
            ComputeSettings::for_run_mode(self.run_mode, self.use_decomposition());
        settings.perform_gpu_gather = self.perform_gpu_gather;
        settings
    }
}
