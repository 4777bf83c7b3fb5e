//! # pme-gpu
//!
//! Asynchronous execution pipeline for the reciprocal-space part of
//! particle-mesh Ewald electrostatics.
//!
//! One step is issued as a chain of launches on a single in-order stream
//! (spline → spread → forward FFT → solve → backward FFT → gather). The
//! caller gets a [`PendingStep`] back immediately and either polls it or
//! blocks on it; finished output is reduced into the engine's force, energy
//! and virial accumulators by the [`OutputReducer`].
//!
//! FFT and solve can each run on the device or on a fixed pool of host
//! threads; the choice is made once from [`ComputeSettings`](pme_core::ComputeSettings).
//!
//! ## Modules
//! - [`device`]: emulated stream, events and buffers
//! - [`kernels`]: spline, spread/gather, 3D FFT and solve kernels
//! - [`box_state`]: box change detection and reciprocal-box derivation
//! - [`stages`]: device and host implementations of each stage
//! - [`pipeline`]: the per-step controller ([`PmeGpu`])
//! - [`monitor`]: completion polling and output fetch
//! - [`reducer`]: host-side reduction of fetched output
//! - `cuda`: completion checks on a real CUDA stream (feature `cuda`)

pub mod box_state;
pub mod device;
pub mod host_pool;
pub mod kernels;
pub mod monitor;
pub mod pipeline;
pub mod reducer;
pub mod stages;
pub mod state;
pub mod timings;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use box_state::{BoxScaler, BoxStateTracker, BoxUpdate, IdentityScaler, ReciprocalBox, WallZScaler};
pub use device::{DeviceBuffer, GpuStream, PinnedBuffer, StreamEvent};
pub use host_pool::HostPool;
pub use monitor::{check_completion, CompletionStream, GpuTaskCompletion, PendingStep, StepStatus};
pub use pipeline::{PmeGpu, PmePhase};
pub use reducer::OutputReducer;
pub use stages::CoordinateSource;
pub use timings::{PmeStage, StageTiming, TimingReport};
