//! Completion of an in-flight step.
//!
//! [`PmeGpu::launch_gather`](crate::PmeGpu::launch_gather) hands back a
//! [`PendingStep`]. It borrows the pipeline mutably, so no new step can be
//! issued until the current one has been finished. Two ways to finish:
//!
//! - **poll** / [`PendingStep::try_finish`] with [`GpuTaskCompletion::Check`]:
//!   non-blocking. When the stream is still busy the handle comes back in
//!   [`StepStatus::Pending`] with nothing fetched or cleared.
//! - **get** / [`PendingStep::wait_and_reduce`]: synchronizes the stream
//!   unconditionally, then fetches.
//!
//! Both paths fetch the output, fold device timings, and reinitialise the
//! grids for the next step.

use std::time::Instant;

use anyhow::{Context, Result};
use pme_core::{EnergyData, ForceWithVirial, TaskOutput};

use crate::device::GpuStream;
use crate::pipeline::{PmeGpu, PmePhase};
use crate::state::PipelineState;
use crate::timings::PmeStage;

/// A stream whose completion can be checked from the host.
pub trait CompletionStream {
    /// Whether [`CompletionStream::query`] may be used on this platform.
    fn supports_query(&self) -> bool;

    /// Non-blocking: true when all issued work has finished.
    fn query(&self) -> Result<bool>;

    /// Blocks until all issued work has finished.
    fn synchronize(&self) -> Result<()>;
}

impl CompletionStream for GpuStream {
    fn supports_query(&self) -> bool {
        GpuStream::supports_query(self)
    }

    fn query(&self) -> Result<bool> {
        GpuStream::query(self)
    }

    fn synchronize(&self) -> Result<()> {
        GpuStream::synchronize(self)
    }
}

/// How to check for completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuTaskCompletion {
    /// Return immediately if work is still running
    Check,
    /// Block until work has finished
    Wait,
}

/// Checks `stream` for completion. Without query support a check degrades
/// to a wait.
pub fn check_completion(stream: &dyn CompletionStream, completion: GpuTaskCompletion) -> Result<bool> {
    match completion {
        GpuTaskCompletion::Check if stream.supports_query() => stream.query(),
        GpuTaskCompletion::Check => {
            log::debug!("Stream query unsupported, synchronizing instead");
            stream.synchronize()?;
            Ok(true)
        }
        GpuTaskCompletion::Wait => {
            stream.synchronize()?;
            Ok(true)
        }
    }
}

/// Outcome of a completion check.
pub enum StepStatus<'a, T> {
    /// Still running; retry with the returned handle
    Pending(PendingStep<'a>),
    Finished(T),
}

impl<'a, T> StepStatus<'a, T> {
    pub fn is_finished(&self) -> bool {
        matches!(self, StepStatus::Finished(_))
    }

    pub fn finished(self) -> Option<T> {
        match self {
            StepStatus::Finished(value) => Some(value),
            StepStatus::Pending(_) => None,
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for StepStatus<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pending(_) => f.write_str("Pending"),
            StepStatus::Finished(value) => f.debug_tuple("Finished").field(value).finish(),
        }
    }
}

/// Handle to the step currently on the stream.
pub struct PendingStep<'a> {
    pme: &'a mut PmeGpu,
}

impl<'a> PendingStep<'a> {
    pub(crate) fn new(pme: &'a mut PmeGpu) -> Self {
        debug_assert_eq!(pme.phase, PmePhase::Gathered);
        Self { pme }
    }

    /// Non-blocking completion check.
    pub fn poll(self) -> Result<StepStatus<'a, TaskOutput>> {
        self.try_finish(GpuTaskCompletion::Check)
    }

    /// Blocks until the step has finished and returns its output.
    pub fn get(self) -> Result<TaskOutput> {
        let start = Instant::now();
        self.pme
            .state
            .stream
            .synchronize()
            .context("Waiting for PME stream")?;
        self.pme
            .state
            .timings
            .record_host(PmeStage::WaitCompletion, start.elapsed());
        self.finish()
    }

    /// Checks for completion and fetches the output when done.
    ///
    /// Only valid while forces are reduced on the host.
    pub fn try_finish(self, completion: GpuTaskCompletion) -> Result<StepStatus<'a, TaskOutput>> {
        assert!(
            !self.pme.state.settings.use_gpu_force_reduction,
            "Completion polling is only supported with host-side force reduction"
        );
        let start = Instant::now();
        let done = check_completion(&self.pme.state.stream, completion)
            .context("Checking PME stream completion")?;
        if !done {
            return Ok(StepStatus::Pending(self));
        }
        self.pme
            .state
            .timings
            .record_host(PmeStage::WaitCompletion, start.elapsed());
        self.finish().map(StepStatus::Finished)
    }

    /// [`try_finish`](Self::try_finish), then reduces the output into the
    /// engine's accumulators.
    pub fn try_finish_and_reduce(
        self,
        completion: GpuTaskCompletion,
        force_with_virial: &mut ForceWithVirial,
        enerd: &mut EnergyData,
    ) -> Result<StepStatus<'a, ()>> {
        let reducer = self.pme.reducer.clone();
        let compute_ev = self.pme.state.step.compute_energy_and_virial;
        Ok(match self.try_finish(completion)? {
            StepStatus::Pending(step) => StepStatus::Pending(step),
            StepStatus::Finished(output) => {
                reducer.reduce(&output, compute_ev, force_with_virial, enerd);
                StepStatus::Finished(())
            }
        })
    }

    /// Blocks, fetches and reduces.
    pub fn wait_and_reduce(self, force_with_virial: &mut ForceWithVirial, enerd: &mut EnergyData) -> Result<()> {
        let reducer = self.pme.reducer.clone();
        let compute_ev = self.pme.state.step.compute_energy_and_virial;
        let output = self.get()?;
        reducer.reduce(&output, compute_ev, force_with_virial, enerd);
        Ok(())
    }

    fn finish(self) -> Result<TaskOutput> {
        let state = &mut self.pme.state;
        state.timings.update();
        let output = fetch_output(state)?;
        state.reinit();
        self.pme.phase = PmePhase::Idle;
        log::debug!(
            "PME step finished: E_recip = {:.6}, forces fetched: {}",
            output.coulomb_energy,
            output.have_force_output
        );
        Ok(output)
    }
}

/// Reads the step's results from the host staging buffers.
///
/// The stream must have drained.
fn fetch_output(state: &mut PipelineState) -> Result<TaskOutput> {
    let mut output = TaskOutput::default();
    let lambda = state.step.lambda;

    if state.step.compute_energy_and_virial {
        let mut per_grid = Vec::with_capacity(state.grids.len());
        for grid in &mut state.grids {
            grid.energy_virial.on_host(&state.stream)?;
            let ev = grid.energy_virial.host.to_vec()[0];
            assert!(ev.is_finite(), "PME energy/virial is not finite: {:?}", ev);
            per_grid.push(ev);
        }

        match per_grid.as_slice() {
            [single] => {
                assert_eq!(lambda, 1.0, "Lambda weighting requires two PME grids");
                output.coulomb_energy = single.energy;
                output.coulomb_virial = single.virial;
            }
            [state_a, state_b] => {
                output.coulomb_energy = (1.0 - lambda) * state_a.energy + lambda * state_b.energy;
                output.coulomb_virial = (1.0 - lambda) * state_a.virial + lambda * state_b.virial;
                output.coulomb_dvdl = state_b.energy - state_a.energy;
            }
            other => unreachable!("{} PME grids", other.len()),
        }
    }

    if state.step.gather_performed {
        output.have_force_output = !state.settings.use_gpu_force_reduction;
        if output.have_force_output {
            output.forces = state.atoms.h_forces.to_vec();
        }
    }
    Ok(output)
}
