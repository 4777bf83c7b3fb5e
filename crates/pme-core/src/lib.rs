//! # pme-core
//!
//! Core types, settings and errors for the PME GPU pipeline.
//!
//! This crate holds everything the engine and the pipeline agree on:
//! - **Types**: box/vector aliases, per-grid energy and virial
//! - **Workload**: per-step flags, run modes and stage placement
//! - **Config**: setup-time parameters with validation
//! - **Output**: fetched step results and engine-side accumulators
//! - **Errors**: unified error handling with PmeError
//!
//! ## Architecture
//! ```text
//! ┌─────────────────┐
//! │  pme-core       │  ← Types / settings / errors
//! └─────────────────┘
//!         ▲
//!         │
//! ┌───────┴─────────┐
//! │  pme-gpu        │  ← Stream, stages, pipeline, completion, reduction
//! └─────────────────┘
//! ```

pub mod config;
pub mod errors;
pub mod output;
pub mod types;
pub mod workload;

// Re-export commonly used items
pub use config::{compute_ewald_coeff, PmeConfig, MAX_PME_ORDER, MIN_PME_ORDER};
pub use errors::PmeError;
pub use output::{EnergyData, EnergyTerm, FepComponent, ForceWithVirial, TaskOutput};
pub use types::{box_from_rows, cubic_box, lower_triangle, EnergyVirial, Matrix, RVec, DIM};
pub use workload::{ComputeSettings, PmeRunMode, StepWorkload};
