//! Per-step workload flags and per-run stage placement.

use serde::{Deserialize, Serialize};

/// Where PME work runs for this rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PmeRunMode {
    /// Everything on the host; the GPU pipeline must not be constructed.
    Cpu,
    /// Spread, FFT, solve and gather on the device.
    #[default]
    Gpu,
    /// Spread and gather on the device, FFT and solve host-threaded.
    Mixed,
}

impl PmeRunMode {
    /// Whether this mode uses the GPU pipeline at all.
    pub fn is_gpu_active(self) -> bool {
        self != PmeRunMode::Cpu
    }
}

/// Device vs host placement of each stage, fixed at setup.
///
/// `use_gpu_force_reduction` is the exception: it is refreshed from the
/// [`StepWorkload`] on every prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeSettings {
    pub perform_gpu_fft: bool,
    pub perform_gpu_solve: bool,
    pub perform_gpu_gather: bool,
    pub use_gpu_force_reduction: bool,
    pub use_decomposition: bool,
}

impl ComputeSettings {
    /// Derives stage placement from the run mode and decomposition.
    ///
    /// Panics on [`PmeRunMode::Cpu`]: there is nothing for the GPU pipeline
    /// to do in that mode.
    pub fn for_run_mode(mode: PmeRunMode, use_decomposition: bool) -> Self {
        assert!(
            mode.is_gpu_active(),
            "This should be a GPU run of PME but it is not enabled."
        );
        let gpu = mode == PmeRunMode::Gpu;
        Self {
            perform_gpu_fft: gpu && !use_decomposition,
            perform_gpu_solve: gpu,
            perform_gpu_gather: true,
            use_gpu_force_reduction: false,
            use_decomposition,
        }
    }
}

/// What the engine needs from this step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StepWorkload {
    pub have_dynamic_box: bool,
    pub compute_energy: bool,
    pub compute_virial: bool,
    pub use_gpu_pme_f_reduction: bool,
}

impl StepWorkload {
    /// Energy and virial are only ever computed together.
    pub fn compute_energy_and_virial(&self) -> bool {
        self.compute_energy || self.compute_virial
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_energy_and_virial_coupled() {
        let mut step = StepWorkload::default();
        assert!(!step.compute_energy_and_virial());
        step.compute_virial = true;
        assert!(step.compute_energy_and_virial());
        step.compute_virial = false;
        step.compute_energy = true;
        assert!(step.compute_energy_and_virial());
    }

    #[test]
    fn test_gpu_mode_settings() {
        let s = ComputeSettings::for_run_mode(PmeRunMode::Gpu, false);
        assert!(s.perform_gpu_fft && s.perform_gpu_solve && s.perform_gpu_gather);

        let decomposed = ComputeSettings::for_run_mode(PmeRunMode::Gpu, true);
        assert!(!decomposed.perform_gpu_fft);
        assert!(decomposed.perform_gpu_solve);
        assert!(decomposed.use_decomposition);
    }

    #[test]
    fn test_mixed_mode_settings() {
        let s = ComputeSettings::for_run_mode(PmeRunMode::Mixed, false);
        assert!(!s.perform_gpu_fft);
        assert!(!s.perform_gpu_solve);
        assert!(s.perform_gpu_gather);
    }

    #[test]
    #[should_panic(expected = "GPU run of PME")]
    fn test_cpu_mode_rejected() {
        let _ = ComputeSettings::for_run_mode(PmeRunMode::Cpu, false);
    }
}
