//! Pipeline state owned by the controlling thread.
//!
//! Everything a stage needs (settings, grids, stream, host pool, timings) is
//! bundled here and handed to each stage by reference. Device-side data lives
//! in [`DeviceBuffer`]s that stream jobs capture; host mirrors track where
//! the current contents of each grid are so that device and host stages can
//! be mixed freely.

use std::sync::Arc;

use anyhow::Result;
use pme_core::{ComputeSettings, EnergyVirial, Matrix, PmeConfig, RVec};
use rustfft::num_complex::Complex;

use crate::box_state::ReciprocalBox;
use crate::device::{DeviceBuffer, GpuStream, PinnedBuffer, StreamEvent};
use crate::host_pool::HostPool;
use crate::kernels::{BSplineModuli, Fft3d, SolveParams, SplineData};
use crate::timings::{timed_job, PmeStage, TimingRecorder};

/// Where the current contents of a mirrored buffer live.
#[derive(Debug, Clone)]
pub enum Residency {
    Device,
    /// Device-to-host copy issued; host copy valid once the event fires
    ToHost(StreamEvent),
    Host,
}

/// Device allocation with a pinned host mirror.
#[derive(Debug)]
pub struct Mirrored<T> {
    pub device: DeviceBuffer<T>,
    pub host: PinnedBuffer<T>,
    at: Residency,
}

impl<T: Clone + Default + Send + 'static> Mirrored<T> {
    pub fn zeroed(len: usize) -> Self {
        Self {
            device: DeviceBuffer::zeroed(len),
            host: PinnedBuffer::zeroed(len),
            at: Residency::Device,
        }
    }

    pub fn residency(&self) -> &Residency {
        &self.at
    }

    /// Issues a device-to-host copy if the contents are on the device.
    pub fn to_host_async(&mut self, stream: &GpuStream) {
        if let Residency::Device = self.at {
            self.device.copy_to_async(stream, "d2h copy", &self.host);
            self.at = Residency::ToHost(stream.record_event());
        }
    }

    /// Makes the contents host-visible, blocking on an outstanding copy.
    pub fn on_host(&mut self, stream: &GpuStream) -> Result<()> {
        self.to_host_async(stream);
        if let Residency::ToHost(event) = &self.at {
            event.synchronize();
            stream.check_error()?;
        }
        self.at = Residency::Host;
        Ok(())
    }

    /// Makes the contents device-visible, pushing host data asynchronously.
    pub fn on_device(&mut self, stream: &GpuStream) {
        if let Residency::Host = self.at {
            self.host.copy_to_async(stream, "h2d copy", &self.device);
        }
        self.at = Residency::Device;
    }

    /// Contents were just produced on the device.
    pub fn mark_device(&mut self) {
        self.at = Residency::Device;
    }

    /// Contents were just produced on the host.
    pub fn mark_host(&mut self) {
        self.at = Residency::Host;
    }

    /// Clears both sides; the device clear is queued on `stream`.
    pub fn clear(&mut self, stream: &GpuStream, label: &'static str) {
        let device = self.device.clone();
        stream.enqueue(label, move || {
            device.clear();
            Ok(())
        });
        self.host.clear();
        self.at = Residency::Device;
    }
}

/// Buffers of one grid of the grid set.
#[derive(Debug)]
pub struct GridBuffers {
    /// `[nx][ny][nz]` charge grid, later the convolved potential
    pub real: Mirrored<f64>,
    /// `[nx][ny][nz/2+1]` transformed grid
    pub complex: Mirrored<Complex<f64>>,
    /// Single-slot energy/virial output of the solve
    pub energy_virial: Mirrored<EnergyVirial>,
    pub charges: DeviceBuffer<f64>,
}

impl GridBuffers {
    fn new(fft: &Fft3d) -> Self {
        Self {
            real: Mirrored::zeroed(fft.real_len()),
            complex: Mirrored::zeroed(fft.complex_len()),
            energy_virial: Mirrored::zeroed(1),
            charges: DeviceBuffer::zeroed(0),
        }
    }
}

/// Box-derived kernel parameters resident on the device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelParams {
    pub recip: Matrix,
    pub volume: f64,
}

impl Default for KernelParams {
    fn default() -> Self {
        Self {
            recip: Matrix::zeros(),
            volume: 0.0,
        }
    }
}

impl From<ReciprocalBox> for KernelParams {
    fn from(recip: ReciprocalBox) -> Self {
        Self {
            recip: recip.recip,
            volume: recip.volume,
        }
    }
}

/// Per-particle device data.
#[derive(Debug)]
pub struct AtomData {
    pub n_atoms: usize,
    /// Pipeline-owned coordinates, filled from host coordinates
    pub d_coordinates: DeviceBuffer<RVec>,
    /// Engine-owned device coordinates
    pub registered_coordinates: Option<DeviceBuffer<RVec>>,
    /// Single slot, written by the spline job
    pub d_splines: DeviceBuffer<SplineData>,
    pub d_forces: DeviceBuffer<RVec>,
    pub h_forces: PinnedBuffer<RVec>,
    /// Engine-owned force buffer for device-side reduction
    pub force_destination: Option<DeviceBuffer<RVec>>,
}

impl AtomData {
    fn new() -> Self {
        Self {
            n_atoms: 0,
            d_coordinates: DeviceBuffer::from_vec(Vec::new()),
            registered_coordinates: None,
            d_splines: DeviceBuffer::zeroed(1),
            d_forces: DeviceBuffer::from_vec(Vec::new()),
            h_forces: PinnedBuffer::from_vec(Vec::new()),
            force_destination: None,
        }
    }

    fn resize(&mut self, n_atoms: usize) {
        if n_atoms == self.n_atoms {
            return;
        }
        self.n_atoms = n_atoms;
        self.d_coordinates = DeviceBuffer::from_vec(vec![RVec::zeros(); n_atoms]);
        self.d_forces = DeviceBuffer::from_vec(vec![RVec::zeros(); n_atoms]);
        self.h_forces = PinnedBuffer::from_vec(vec![RVec::zeros(); n_atoms]);
    }
}

/// Flags of the step currently in flight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepFlags {
    pub compute_energy_and_virial: bool,
    pub gather_performed: bool,
    pub lambda: f64,
}

impl Default for StepFlags {
    fn default() -> Self {
        Self {
            compute_energy_and_virial: false,
            gather_performed: false,
            lambda: 1.0,
        }
    }
}

/// All mutable pipeline state.
pub struct PipelineState {
    pub settings: ComputeSettings,
    pub grid_size: [usize; 3],
    pub pme_order: usize,
    pub ewald_coeff: f64,
    pub epsilon_r: f64,
    /// The grid set: one grid, or two for dual-state FEP
    pub grids: Vec<GridBuffers>,
    pub stream: GpuStream,
    pub host_pool: Arc<HostPool>,
    pub fft: Fft3d,
    pub moduli: Arc<BSplineModuli>,
    pub d_kernel_params: DeviceBuffer<KernelParams>,
    /// Only maintained when the solve runs on the host
    pub host_recip: Option<ReciprocalBox>,
    pub atoms: AtomData,
    pub timings: TimingRecorder,
    pub forces_ready: Option<StreamEvent>,
    pub step: StepFlags,
}

impl PipelineState {
    pub fn new(config: &PmeConfig, settings: ComputeSettings, host_pool: Arc<HostPool>) -> Result<Self> {
        let fft = Fft3d::new(config.grid_size);
        let grids = (0..config.ngrids()).map(|_| GridBuffers::new(&fft)).collect();
        let stream = GpuStream::new("pme", config.stream_query_supported)?;

        Ok(Self {
            settings,
            grid_size: config.grid_size,
            pme_order: config.pme_order,
            ewald_coeff: config.ewald_coeff,
            epsilon_r: config.epsilon_r,
            grids,
            stream,
            host_pool,
            fft,
            moduli: Arc::new(BSplineModuli::new(config.grid_size, config.pme_order)),
            d_kernel_params: DeviceBuffer::zeroed(1),
            host_recip: None,
            atoms: AtomData::new(),
            timings: TimingRecorder::new(),
            forces_ready: None,
            step: StepFlags::default(),
        })
    }

    pub fn ngrids(&self) -> usize {
        self.grids.len()
    }

    /// Uploads per-grid charges, reallocating particle buffers on size change.
    pub fn set_charges(&mut self, per_grid: &[&[f64]]) {
        assert_eq!(
            per_grid.len(),
            self.ngrids(),
            "Expected charges for {} grid(s), got {}",
            self.ngrids(),
            per_grid.len()
        );
        let n_atoms = per_grid[0].len();
        assert!(
            per_grid.iter().all(|q| q.len() == n_atoms),
            "Charge arrays of both FEP states must have the same length"
        );
        self.atoms.resize(n_atoms);
        for (grid, charges) in self.grids.iter_mut().zip(per_grid) {
            grid.charges = DeviceBuffer::from_slice(charges);
        }
    }

    pub fn solve_params(&self, params: &KernelParams) -> SolveParams {
        SolveParams {
            grid_size: self.grid_size,
            recip_box: params.recip,
            volume: params.volume,
            ewald_coeff: self.ewald_coeff,
            epsilon_r: self.epsilon_r,
        }
    }

    /// Queues a timed device job.
    pub fn enqueue_timed<F>(&self, stage: PmeStage, label: &'static str, job: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.stream
            .enqueue(label, timed_job(&self.timings.sink(), stage, job));
    }

    /// Clears the grids and energy/virial outputs for the next step.
    pub fn reinit(&mut self) {
        for grid in &mut self.grids {
            grid.real.clear(&self.stream, "clear real grid");
            grid.complex.mark_device();
            grid.energy_virial.clear(&self.stream, "clear energy/virial");
        }
        self.step = StepFlags::default();
    }
}

impl std::fmt::Debug for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineState")
            .field("settings", &self.settings)
            .field("grid_size", &self.grid_size)
            .field("ngrids", &self.grids.len())
            .field("n_atoms", &self.atoms.n_atoms)
            .field("step", &self.step)
            .finish()
    }
}
