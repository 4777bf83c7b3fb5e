//! PME GPU pipeline controller
//!
//! Issues one step as a sequence of asynchronous launches on a single
//! stream:
//!
//! ```text
//! prepare ──▶ spread ──▶ [R2C ─▶ solve ─▶ C2R] × ngrids ──▶ gather ──▶ PendingStep
//! (box)      (device)    (device or host per stage)         (device)   (poll / get)
//! ```
//!
//! Stream order is the only ordering between device stages. A host FFT or
//! host solve blocks on the data it needs before running; that is the only
//! wait inside the launch sequence.
//!
//! Contract violations (wrong mode, wrong grid count, stage order, missing
//! registered buffers) panic with a descriptive message. Failures inside the
//! transform/solve loop are fatal: the stream cannot be unwound mid-step.

use std::sync::Arc;

use anyhow::{Context, Result};
use pme_core::{ComputeSettings, Matrix, PmeConfig, RVec, StepWorkload};

use crate::box_state::{BoxScaler, BoxStateTracker, IdentityScaler, WallZScaler};
use crate::device::{DeviceBuffer, GpuStream, StreamEvent};
use crate::host_pool::HostPool;
use crate::kernels::FftDirection;
use crate::monitor::PendingStep;
use crate::reducer::OutputReducer;
use crate::stages::{CoordinateSource, StageSet};
use crate::state::{KernelParams, PipelineState};
use crate::timings::{PmeStage, TimingReport};

/// Position of the current step in the launch sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmePhase {
    /// No step in flight
    Idle,
    Prepared,
    Spread,
    Transformed,
    /// All work issued; waiting for completion
    Gathered,
}

/// GPU PME solver instance.
pub struct PmeGpu {
    pub(crate) config: PmeConfig,
    pub(crate) state: PipelineState,
    stages: StageSet,
    box_tracker: BoxStateTracker,
    pub(crate) reducer: OutputReducer,
    pub(crate) phase: PmePhase,
    charges_uploaded: bool,
}

impl PmeGpu {
    /// Builds the pipeline with stage placement derived from the run mode.
    pub fn new(config: PmeConfig) -> Result<Self> {
        let settings = config.compute_settings();
        Self::with_settings(config, settings)
    }

    /// Builds the pipeline with explicit stage placement.
    pub fn with_settings(config: PmeConfig, settings: ComputeSettings) -> Result<Self> {
        assert!(
            config.run_mode.is_gpu_active(),
            "This should be a GPU run of PME but it is not enabled."
        );
        config.validate().context("Invalid PME configuration")?;

        let host_pool = Arc::new(HostPool::new(config.nthreads)?);
        let state = PipelineState::new(&config, settings, Arc::clone(&host_pool))?;
        let stages = StageSet::from_settings(&settings);
        let scaler: Box<dyn BoxScaler> = match config.wall_ewald_zfac {
            Some(zfac) => Box::new(WallZScaler { zfac }),
            None => Box::new(IdentityScaler),
        };

        log::info!(
            "⚡ PME GPU pipeline: grid {}×{}×{}, order {}, {} grid(s), β = {:.4} nm⁻¹",
            config.grid_size[0],
            config.grid_size[1],
            config.grid_size[2],
            config.pme_order,
            config.ngrids(),
            config.ewald_coeff
        );
        log::info!(
            "📊 Stage placement: FFT on {}, solve on {}, gather {}, {} host thread(s)",
            if settings.perform_gpu_fft { "device" } else { "host" },
            if settings.perform_gpu_solve { "device" } else { "host" },
            if settings.perform_gpu_gather { "enabled" } else { "disabled" },
            host_pool.nthreads()
        );
        if !config.stream_query_supported {
            log::warn!("⚠️  Stream query unsupported on this platform, completion checks will block");
        }

        Ok(Self {
            config,
            state,
            stages,
            box_tracker: BoxStateTracker::new(scaler),
            reducer: OutputReducer::new(host_pool),
            phase: PmePhase::Idle,
            charges_uploaded: false,
        })
    }

    pub fn config(&self) -> &PmeConfig {
        &self.config
    }

    pub fn settings(&self) -> &ComputeSettings {
        &self.state.settings
    }

    pub fn ngrids(&self) -> usize {
        self.state.ngrids()
    }

    pub fn phase(&self) -> PmePhase {
        self.phase
    }

    pub fn n_atoms(&self) -> usize {
        self.state.atoms.n_atoms
    }

    /// The stream carrying this instance's work.
    pub fn stream(&self) -> &GpuStream {
        &self.state.stream
    }

    /// Uploads charges; `charges_b` is the FEP B state and is required
    /// exactly when two grids are in use.
    pub fn set_charges(&mut self, charges_a: &[f64], charges_b: Option<&[f64]>) {
        assert_eq!(self.phase, PmePhase::Idle, "Charges can only change between steps");
        match (self.ngrids(), charges_b) {
            (1, None) => self.state.set_charges(&[charges_a]),
            (2, Some(b)) => self.state.set_charges(&[charges_a, b]),
            (ngrids, b) => panic!(
                "{} PME grid(s) configured but {} charge state(s) supplied",
                ngrids,
                1 + usize::from(b.is_some())
            ),
        }
        self.charges_uploaded = true;
        log::debug!("Uploaded charges for {} atoms", self.n_atoms());
    }

    /// Registers engine-owned device coordinates for
    /// [`CoordinateSource::Device`].
    pub fn set_device_coordinates(&mut self, coordinates: DeviceBuffer<RVec>) {
        self.state.atoms.registered_coordinates = Some(coordinates);
    }

    /// Registers the engine's device force buffer that gather accumulates
    /// into when force reduction runs on the device.
    pub fn set_device_force_destination(&mut self, forces: DeviceBuffer<RVec>) {
        self.state.atoms.force_destination = Some(forces);
    }

    /// Step setup: box change detection and force-reduction mode.
    ///
    /// Returns whether the reciprocal box was recomputed.
    pub fn prepare_computation(&mut self, box_matrix: &Matrix, workload: &StepWorkload) -> bool {
        assert!(
            matches!(self.phase, PmePhase::Idle | PmePhase::Prepared),
            "Cannot prepare a PME step while the previous one is in flight ({:?})",
            self.phase
        );
        assert!(self.config.nnodes > 0, "PME needs at least one rank");
        assert!(
            self.config.nnodes == 1 || self.config.ndecompdim > 0,
            "PME decomposition over {} ranks requires a decomposed dimension",
            self.config.nnodes
        );

        let host_solve = !self.state.settings.perform_gpu_solve;
        let recomputed = match self
            .box_tracker
            .update(box_matrix, workload.have_dynamic_box, host_solve)
        {
            Some(update) => {
                let params = self.state.d_kernel_params.clone();
                let kernel = KernelParams::from(update.device);
                self.state.enqueue_timed(PmeStage::Transfer, "update box", move || {
                    params.lock()[0] = kernel;
                    Ok(())
                });
                if let Some(recip) = update.host_recip {
                    self.state.host_recip = Some(recip);
                }
                true
            }
            None => false,
        };

        // The previous step's token must not read as ready for this one.
        self.state.forces_ready = None;
        self.state.settings.use_gpu_force_reduction = workload.use_gpu_pme_f_reduction;
        self.state.step.compute_energy_and_virial = workload.compute_energy_and_virial();
        self.phase = PmePhase::Prepared;
        recomputed
    }

    /// Launches spline computation and spreading; does not block.
    pub fn launch_spread(&mut self, coordinates: CoordinateSource<'_>) -> Result<()> {
        assert_eq!(self.phase, PmePhase::Prepared, "Spread launched before prepare_computation");
        assert!(
            self.config.run_mode.is_gpu_active(),
            "This should be a GPU run of PME but it is not enabled."
        );
        assert!(self.config.do_coulomb, "Only Coulomb PME is supported on the GPU");
        let ngrids = self.ngrids();
        assert!(
            ngrids == 1 || (ngrids == 2 && self.config.fep_coulomb),
            "Only one (normal Coulomb PME) or two (FEP Coulomb PME) grids can be used on the GPU, got {}",
            ngrids
        );
        assert!(self.charges_uploaded, "Charges must be set before spreading");
        if let CoordinateSource::Device { ready: None } = coordinates {
            assert!(
                !self.config.has_pp_duty,
                "A rank that also computes PP interactions must pass a coordinate readiness event"
            );
        }

        self.stages
            .spread
            .launch(&mut self.state, coordinates)
            .context("Launching PME spread")?;
        self.phase = PmePhase::Spread;
        Ok(())
    }

    /// Launches forward transform, solve and backward transform for every
    /// grid. Any failure is fatal.
    pub fn launch_complex_transforms(&mut self) {
        assert_eq!(self.phase, PmePhase::Spread, "Transforms launched before spread");
        if let Err(err) = self.transform_all_grids() {
            fatal_error(err);
        }
        self.phase = PmePhase::Transformed;
    }

    fn transform_all_grids(&mut self) -> Result<()> {
        for grid in 0..self.ngrids() {
            self.stages
                .fft
                .launch(&mut self.state, grid, FftDirection::RealToComplex)
                .with_context(|| format!("Forward FFT of grid {}", grid))?;
            self.stages
                .solve
                .launch(&mut self.state, grid)
                .with_context(|| format!("Solve of grid {}", grid))?;
            self.stages
                .fft
                .launch(&mut self.state, grid, FftDirection::ComplexToReal)
                .with_context(|| format!("Backward FFT of grid {}", grid))?;
        }
        Ok(())
    }

    /// Launches force gathering and returns the completion handle.
    ///
    /// `lambda` weights the two FEP grids; it is ignored with a single grid.
    pub fn launch_gather(&mut self, lambda: f64) -> Result<PendingStep<'_>> {
        assert_eq!(self.phase, PmePhase::Transformed, "Gather launched before transforms");
        let lambda = if self.ngrids() == 1 { 1.0 } else { lambda };
        self.state.step.lambda = lambda;
        self.state.step.gather_performed = self
            .stages
            .gather
            .launch(&mut self.state, lambda)
            .context("Launching PME gather")?;
        self.phase = PmePhase::Gathered;
        Ok(PendingStep::new(self))
    }

    /// Prepare, spread, transforms and gather in one call.
    pub fn launch(
        &mut self,
        box_matrix: &Matrix,
        workload: &StepWorkload,
        coordinates: CoordinateSource<'_>,
        lambda: f64,
    ) -> Result<PendingStep<'_>> {
        self.prepare_computation(box_matrix, workload);
        self.launch_spread(coordinates)?;
        self.launch_complex_transforms();
        self.launch_gather(lambda)
    }

    /// Handle to a step whose gather has been issued but whose output has
    /// not been fetched yet.
    pub fn pending_step(&mut self) -> Option<PendingStep<'_>> {
        if self.phase == PmePhase::Gathered {
            Some(PendingStep::new(self))
        } else {
            None
        }
    }

    /// Clears grids and energy/virial outputs. Runs automatically after
    /// every fetch.
    pub fn reinit_computation(&mut self) {
        assert_eq!(self.phase, PmePhase::Idle, "Cannot reinitialise while a step is in flight");
        self.state.reinit();
    }

    /// Device buffer holding this step's PME forces.
    pub fn device_forces(&self) -> DeviceBuffer<RVec> {
        self.state.atoms.d_forces.clone()
    }

    /// Fires once this step's forces are available on the device.
    pub fn forces_ready_event(&self) -> Option<&StreamEvent> {
        self.state.forces_ready.as_ref()
    }

    pub fn timings(&self) -> &TimingReport {
        self.state.timings.report()
    }

    pub fn reset_timings(&mut self) {
        self.state.timings.reset();
    }

    /// Reciprocal-box recomputes triggered so far.
    pub fn box_recompute_count(&self) -> u64 {
        self.box_tracker.recompute_count()
    }
}

impl std::fmt::Debug for PmeGpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PmeGpu")
            .field("phase", &self.phase)
            .field("stages", &self.stages)
            .field("state", &self.state)
            .finish()
    }
}

/// Terminates the controlling thread after an unrecoverable stream failure.
pub(crate) fn fatal_error(err: anyhow::Error) -> ! {
    log::error!("💥 Unrecoverable PME GPU failure: {:#}", err);
    panic!("Unrecoverable PME GPU failure: {:#}", err);
}
