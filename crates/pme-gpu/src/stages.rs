//! Polymorphic pipeline stages.
//!
//! Each stage has one interface and a device-executed and/or host-threaded
//! implementation. The implementations are picked once from
//! [`ComputeSettings`] when the pipeline is built; the per-step launch path
//! only makes virtual calls.
//!
//! | Stage  | Device            | Host fallback      |
//! |--------|-------------------|--------------------|
//! | spread | `DeviceSpread`    | -                  |
//! | FFT    | `DeviceFft`       | `HostFft`          |
//! | solve  | `DeviceSolve`     | `HostSolve`        |
//! | gather | `DeviceGather`    | `SkippedGather`    |

use std::time::Instant;

use anyhow::{Context, Result};
use pme_core::{ComputeSettings, RVec};

use crate::device::{PinnedBuffer, StreamEvent};
use crate::kernels::{
    compute_splines, gather_forces, reduce_partials, solve_grid, solve_x_range, spread_charges,
    FftDirection, GridOrdering, SolveParams,
};
use crate::state::{KernelParams, PipelineState};
use crate::timings::{timed_job, PmeStage};

/// Where spread reads particle coordinates from.
#[derive(Debug, Clone, Copy)]
pub enum CoordinateSource<'a> {
    /// Host coordinates, copied to the device on the stream
    Host(&'a [RVec]),
    /// The registered device coordinate buffer, optionally gated on an
    /// event signalled once the engine has written it
    Device { ready: Option<&'a StreamEvent> },
}

/// Spline computation and charge spreading.
pub trait SpreadStage: Send {
    fn launch(&self, state: &mut PipelineState, coordinates: CoordinateSource<'_>) -> Result<()>;
}

/// One forward or backward grid transform.
pub trait FftStage: Send {
    fn launch(&self, state: &mut PipelineState, grid: usize, direction: FftDirection) -> Result<()>;

    fn runs_on_device(&self) -> bool;
}

/// Reciprocal-space solve of one grid.
pub trait SolveStage: Send {
    fn launch(&self, state: &mut PipelineState, grid: usize) -> Result<()>;

    fn runs_on_device(&self) -> bool;
}

/// Force gathering over all grids. Returns whether forces were produced.
pub trait GatherStage: Send {
    fn launch(&self, state: &mut PipelineState, lambda: f64) -> Result<bool>;
}

/// The stage implementations of one pipeline.
pub struct StageSet {
    pub spread: Box<dyn SpreadStage>,
    pub fft: Box<dyn FftStage>,
    pub solve: Box<dyn SolveStage>,
    pub gather: Box<dyn GatherStage>,
}

impl StageSet {
    pub fn from_settings(settings: &ComputeSettings) -> Self {
        let fft: Box<dyn FftStage> = if settings.perform_gpu_fft {
            Box::new(DeviceFft)
        } else {
            Box::new(HostFft)
        };
        let solve: Box<dyn SolveStage> = if settings.perform_gpu_solve {
            let ordering = if settings.use_decomposition {
                GridOrdering::Zyx
            } else {
                GridOrdering::Xyz
            };
            Box::new(DeviceSolve { ordering })
        } else {
            Box::new(HostSolve)
        };
        let gather: Box<dyn GatherStage> = if settings.perform_gpu_gather {
            Box::new(DeviceGather)
        } else {
            Box::new(SkippedGather)
        };
        Self {
            spread: Box::new(DeviceSpread {
                stage_grid_to_host: !settings.perform_gpu_fft,
            }),
            fft,
            solve,
            gather,
        }
    }
}

impl std::fmt::Debug for StageSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageSet")
            .field("device_fft", &self.fft.runs_on_device())
            .field("device_solve", &self.solve.runs_on_device())
            .finish()
    }
}

// ============================================================================
// Spread
// ============================================================================

/// Device spline + spread; optionally starts the grid download a host FFT
/// will wait on.
pub struct DeviceSpread {
    pub stage_grid_to_host: bool,
}

impl SpreadStage for DeviceSpread {
    fn launch(&self, state: &mut PipelineState, coordinates: CoordinateSource<'_>) -> Result<()> {
        let n_atoms = state.atoms.n_atoms;
        let d_coordinates = match coordinates {
            CoordinateSource::Host(x) => {
                assert_eq!(
                    x.len(),
                    n_atoms,
                    "Coordinate count {} does not match charge count {}",
                    x.len(),
                    n_atoms
                );
                let staging = PinnedBuffer::from_slice(x);
                staging.copy_to_async(&state.stream, "h2d coordinates", &state.atoms.d_coordinates);
                state.atoms.d_coordinates.clone()
            }
            CoordinateSource::Device { ready } => {
                let registered = state
                    .atoms
                    .registered_coordinates
                    .clone()
                    .unwrap_or_else(|| panic!("Device coordinates requested but none are registered"));
                if let Some(event) = ready {
                    state.stream.wait_event(event);
                }
                registered
            }
        };

        let splines = state.atoms.d_splines.clone();
        let params = state.d_kernel_params.clone();
        let (grid_size, order) = (state.grid_size, state.pme_order);
        state.enqueue_timed(PmeStage::Spline, "spline", move || {
            let recip = params.lock()[0].recip;
            let x = d_coordinates.lock();
            anyhow::ensure!(
                x.len() == n_atoms,
                "device coordinate buffer holds {} atoms, expected {}",
                x.len(),
                n_atoms
            );
            splines.lock()[0] = compute_splines(&x, &recip, grid_size, order);
            Ok(())
        });

        for grid in &mut state.grids {
            let splines = state.atoms.d_splines.clone();
            let charges = grid.charges.clone();
            let real = grid.real.device.clone();
            state.stream.enqueue(
                "spread",
                timed_job(&state.timings.sink(), PmeStage::Spread, move || {
                    let splines = splines.lock();
                    spread_charges(&splines[0], &charges.lock(), &mut real.lock(), grid_size);
                    Ok(())
                }),
            );
            grid.real.mark_device();
            if self.stage_grid_to_host {
                grid.real.to_host_async(&state.stream);
            }
        }
        Ok(())
    }
}

// ============================================================================
// FFT
// ============================================================================

/// Transform queued on the stream.
pub struct DeviceFft;

impl FftStage for DeviceFft {
    fn launch(&self, state: &mut PipelineState, grid: usize, direction: FftDirection) -> Result<()> {
        let stream = &state.stream;
        let buffers = &mut state.grids[grid];
        match direction {
            FftDirection::RealToComplex => buffers.real.on_device(stream),
            FftDirection::ComplexToReal => buffers.complex.on_device(stream),
        }

        let fft = state.fft.clone();
        let real = buffers.real.device.clone();
        let complex = buffers.complex.device.clone();
        let (stage, label) = match direction {
            FftDirection::RealToComplex => (PmeStage::FftR2c, "fft r2c"),
            FftDirection::ComplexToReal => (PmeStage::FftC2r, "fft c2r"),
        };
        stream.enqueue(
            label,
            timed_job(&state.timings.sink(), stage, move || {
                fft.execute(direction, &mut real.lock(), &mut complex.lock())
            }),
        );

        match direction {
            FftDirection::RealToComplex => buffers.complex.mark_device(),
            FftDirection::ComplexToReal => buffers.real.mark_device(),
        }
        Ok(())
    }

    fn runs_on_device(&self) -> bool {
        true
    }
}

/// Transform on the host pool, each pass split into one static slab range
/// per thread; the forward transform first waits for the spread result to
/// reach the host.
pub struct HostFft;

impl FftStage for HostFft {
    fn launch(&self, state: &mut PipelineState, grid: usize, direction: FftDirection) -> Result<()> {
        let wait_start = Instant::now();
        {
            let stream = &state.stream;
            let buffers = &mut state.grids[grid];
            let input_ready = match direction {
                FftDirection::RealToComplex => buffers.real.on_host(stream),
                FftDirection::ComplexToReal => buffers.complex.on_host(stream),
            };
            input_ready.with_context(|| format!("Waiting for grid {} before host FFT", grid))?;
        }
        if direction == FftDirection::RealToComplex {
            state.timings.record_host(PmeStage::WaitSpread, wait_start.elapsed());
        }

        let fft = state.fft.clone();
        let buffers = &mut state.grids[grid];
        let real = buffers.real.host.clone();
        let complex = buffers.complex.host.clone();
        let pool = state.host_pool.clone();
        state
            .timings
            .time_host(PmeStage::HostFft, || {
                fft.execute_with(&*pool, direction, &mut real.lock(), &mut complex.lock())
            })
            .with_context(|| format!("Host FFT of grid {}", grid))?;

        match direction {
            FftDirection::RealToComplex => buffers.complex.mark_host(),
            FftDirection::ComplexToReal => buffers.real.mark_host(),
        }
        Ok(())
    }

    fn runs_on_device(&self) -> bool {
        false
    }
}

// ============================================================================
// Solve
// ============================================================================

/// Solve queued on the stream in the given traversal order.
pub struct DeviceSolve {
    pub ordering: GridOrdering,
}

impl SolveStage for DeviceSolve {
    fn launch(&self, state: &mut PipelineState, grid: usize) -> Result<()> {
        let compute_ev = state.step.compute_energy_and_virial;
        let template = state.solve_params(&KernelParams::default());
        let moduli = state.moduli.clone();
        let params = state.d_kernel_params.clone();
        let ordering = self.ordering;

        let stream = &state.stream;
        let buffers = &mut state.grids[grid];
        buffers.complex.on_device(stream);
        let complex = buffers.complex.device.clone();
        let energy_virial = buffers.energy_virial.device.clone();

        stream.enqueue(
            "solve",
            timed_job(&state.timings.sink(), PmeStage::Solve, move || {
                let kernel = params.lock()[0];
                let solve = SolveParams {
                    recip_box: kernel.recip,
                    volume: kernel.volume,
                    ..template
                };
                let ev = solve_grid(&solve, &moduli, ordering, &mut complex.lock(), compute_ev);
                if compute_ev {
                    energy_virial.lock()[0] = ev;
                }
                Ok(())
            }),
        );
        buffers.complex.mark_device();

        if compute_ev {
            buffers.energy_virial.mark_device();
            buffers.energy_virial.to_host_async(stream);
        }
        Ok(())
    }

    fn runs_on_device(&self) -> bool {
        true
    }
}

/// Solve on the host pool, x-slabs statically split across the threads.
pub struct HostSolve;

impl SolveStage for HostSolve {
    fn launch(&self, state: &mut PipelineState, grid: usize) -> Result<()> {
        let compute_ev = state.step.compute_energy_and_virial;
        let recip = state
            .host_recip
            .unwrap_or_else(|| panic!("Host solve requires a host reciprocal box; call prepare first"));
        let params = state.solve_params(&KernelParams::from(recip));
        let [_, ny, nzc] = params.complex_dims();

        {
            let stream = &state.stream;
            state.grids[grid]
                .complex
                .on_host(stream)
                .with_context(|| format!("Waiting for grid {} before host solve", grid))?;
        }

        let moduli = state.moduli.clone();
        let pool = state.host_pool.clone();
        let buffers = &mut state.grids[grid];
        let complex = buffers.complex.host.clone();
        let ev = state.timings.time_host(PmeStage::HostSolve, || {
            let mut data = complex.lock();
            let partials = pool.for_each_range(data.as_mut_slice(), ny * nzc, |range, slab| {
                solve_x_range(&params, &moduli, range, slab, compute_ev)
            });
            reduce_partials(partials)
        });
        buffers.complex.mark_host();

        if compute_ev {
            buffers.energy_virial.host.lock()[0] = ev;
            buffers.energy_virial.mark_host();
        }
        Ok(())
    }

    fn runs_on_device(&self) -> bool {
        false
    }
}

// ============================================================================
// Gather
// ============================================================================

/// Gathers forces of every grid on the stream, then either accumulates them
/// into the engine's device force buffer or downloads them for host
/// reduction. Records the forces-ready event.
pub struct DeviceGather;

impl GatherStage for DeviceGather {
    fn launch(&self, state: &mut PipelineState, lambda: f64) -> Result<bool> {
        let ngrids = state.ngrids();
        let mut grids = Vec::with_capacity(ngrids);
        for (g, buffers) in state.grids.iter_mut().enumerate() {
            buffers.real.on_device(&state.stream);
            let scale = match (ngrids, g) {
                (1, _) => 1.0,
                (_, 0) => 1.0 - lambda,
                _ => lambda,
            };
            grids.push((buffers.real.device.clone(), buffers.charges.clone(), scale));
        }

        let splines = state.atoms.d_splines.clone();
        let params = state.d_kernel_params.clone();
        let forces = state.atoms.d_forces.clone();
        let grid_size = state.grid_size;
        state.enqueue_timed(PmeStage::Gather, "gather", move || {
            let recip = params.lock()[0].recip;
            let splines = splines.lock();
            let mut forces = forces.lock();
            forces.iter_mut().for_each(|f| *f = RVec::zeros());
            for (real, charges, scale) in &grids {
                gather_forces(
                    &splines[0],
                    &charges.lock(),
                    &real.lock(),
                    grid_size,
                    &recip,
                    *scale,
                    &mut forces,
                );
            }
            Ok(())
        });

        if state.settings.use_gpu_force_reduction {
            let destination = state
                .atoms
                .force_destination
                .clone()
                .unwrap_or_else(|| panic!("GPU force reduction requested without a device force destination"));
            let forces = state.atoms.d_forces.clone();
            state.enqueue_timed(PmeStage::Gather, "reduce forces", move || {
                let forces = forces.lock();
                let mut destination = destination.lock();
                anyhow::ensure!(
                    destination.len() == forces.len(),
                    "force destination holds {} atoms, expected {}",
                    destination.len(),
                    forces.len()
                );
                for (d, f) in destination.iter_mut().zip(forces.iter()) {
                    *d += f;
                }
                Ok(())
            });
        } else {
            let forces = state.atoms.d_forces.clone();
            let host = state.atoms.h_forces.clone();
            let sink = state.timings.sink();
            state.stream.enqueue(
                "d2h forces",
                timed_job(&sink, PmeStage::Transfer, move || {
                    host.lock().clone_from_slice(&forces.lock());
                    Ok(())
                }),
            );
        }

        state.forces_ready = Some(state.stream.record_event());
        Ok(true)
    }
}

/// Gather disabled: the engine sources these forces elsewhere.
pub struct SkippedGather;

impl GatherStage for SkippedGather {
    fn launch(&self, _state: &mut PipelineState, _lambda: f64) -> Result<bool> {
        log::debug!("Gather disabled, no PME forces this step");
        Ok(false)
    }
}
