//! Reduction of fetched step output into the engine's accumulators.

use std::sync::Arc;

use pme_core::{EnergyData, EnergyTerm, FepComponent, ForceWithVirial, RVec, TaskOutput};

use crate::host_pool::HostPool;

/// Adds PME output to the engine's force, energy and virial accumulators.
///
/// Forces are summed on the host only when the output carries them; when
/// the device already accumulated into the engine's force buffer there is
/// nothing to add.
#[derive(Debug, Clone)]
pub struct OutputReducer {
    pool: Arc<HostPool>,
}

impl OutputReducer {
    pub fn new(pool: Arc<HostPool>) -> Self {
        Self { pool }
    }

    pub fn reduce(
        &self,
        output: &TaskOutput,
        compute_energy_and_virial: bool,
        force_with_virial: &mut ForceWithVirial,
        enerd: &mut EnergyData,
    ) {
        if compute_energy_and_virial {
            force_with_virial.add_virial_contribution(&output.coulomb_virial);
            enerd.add_term(EnergyTerm::CoulombRecip, output.coulomb_energy);
            enerd.add_dvdl_lin(FepComponent::Coulomb, output.coulomb_dvdl);
        }
        if output.have_force_output {
            self.reduce_forces(&output.forces, &mut force_with_virial.force);
        }
    }

    /// `forces[i] += pme_forces[i]`, one contiguous range per pool thread.
    pub fn reduce_forces(&self, pme_forces: &[RVec], forces: &mut [RVec]) {
        assert_eq!(
            pme_forces.len(),
            forces.len(),
            "PME force count {} does not match destination {}",
            pme_forces.len(),
            forces.len()
        );
        self.pool.for_each_range(forces, 1, |range, chunk| {
            for (f, pme) in chunk.iter_mut().zip(&pme_forces[range]) {
                *f += pme;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pme_core::Matrix;

    fn reducer() -> OutputReducer {
        OutputReducer::new(Arc::new(HostPool::new(3).unwrap()))
    }

    #[test]
    fn test_reduce_energy_and_forces() {
        let output = TaskOutput {
            forces: (0..10).map(|i| RVec::new(i as f64, 1.0, -1.0)).collect(),
            coulomb_energy: -12.5,
            coulomb_virial: Matrix::from_diagonal_element(2.0),
            coulomb_dvdl: 0.75,
            have_force_output: true,
        };
        let mut fwv = ForceWithVirial::new(10, true);
        fwv.force[3] = RVec::new(1.0, 1.0, 1.0);
        let mut enerd = EnergyData::new();

        reducer().reduce(&output, true, &mut fwv, &mut enerd);

        assert_eq!(fwv.force[3], RVec::new(4.0, 2.0, 0.0));
        assert_eq!(fwv.force[9], RVec::new(9.0, 1.0, -1.0));
        assert_eq!(enerd.term(EnergyTerm::CoulombRecip), -12.5);
        assert_eq!(enerd.dvdl_lin(FepComponent::Coulomb), 0.75);
        assert_eq!(fwv.virial()[(2, 2)], 2.0);
    }

    #[test]
    fn test_energy_skipped_when_not_requested() {
        let output = TaskOutput {
            coulomb_energy: 3.0,
            ..TaskOutput::default()
        };
        let mut fwv = ForceWithVirial::new(2, true);
        let mut enerd = EnergyData::new();
        reducer().reduce(&output, false, &mut fwv, &mut enerd);
        assert_eq!(enerd.term(EnergyTerm::CoulombRecip), 0.0);
        assert_eq!(fwv.force[0], RVec::zeros());
    }

    #[test]
    #[should_panic(expected = "does not match")]
    fn test_force_length_mismatch_panics() {
        let mut forces = vec![RVec::zeros(); 2];
        reducer().reduce_forces(&[RVec::zeros(); 3], &mut forces);
    }
}
