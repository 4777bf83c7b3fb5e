//! Dual-grid free-energy runs and output reduction
//!
//! Two charge states share one set of splines; energies, virials and forces
//! are weighted by λ and dV/dλ is the linear difference of the two grids.
//! Forces reach the engine either through host reduction of the fetched
//! output or by device-side accumulation into the engine's force buffer.

use pme_core::{
    cubic_box, EnergyData, EnergyTerm, FepComponent, ForceWithVirial, PmeConfig, PmeRunMode, RVec,
    StepWorkload, TaskOutput,
};
use pme_gpu::{CoordinateSource, DeviceBuffer, GpuTaskCompletion, PmeGpu, StepStatus};

const LAMBDA: f64 = 0.3;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config(run_mode: PmeRunMode, fep: bool) -> PmeConfig {
    PmeConfig {
        grid_size: [20, 20, 20],
        pme_order: 5,
        ewald_coeff: 3.2,
        nthreads: 2,
        run_mode,
        fep_coulomb: fep,
        ..PmeConfig::default()
    }
}

fn coordinates() -> Vec<RVec> {
    vec![
        RVec::new(0.15, 0.35, 1.05),
        RVec::new(1.45, 0.85, 0.25),
        RVec::new(0.75, 1.65, 1.55),
    ]
}

fn charges_a() -> Vec<f64> {
    vec![0.9, -0.5, -0.4]
}

fn charges_b() -> Vec<f64> {
    vec![0.0, 0.5, -0.5]
}

fn workload() -> StepWorkload {
    StepWorkload {
        compute_energy: true,
        compute_virial: true,
        ..StepWorkload::default()
    }
}

fn single_state(run_mode: PmeRunMode, charges: &[f64]) -> TaskOutput {
    let mut pme = PmeGpu::new(config(run_mode, false)).unwrap();
    pme.set_charges(charges, None);
    let x = coordinates();
    let output = pme
        .launch(&cubic_box(2.0), &workload(), CoordinateSource::Host(&x), 1.0)
        .unwrap()
        .get()
        .unwrap();
    output
}

fn assert_close(a: f64, b: f64) {
    assert!(
        (a - b).abs() <= 1e-10 * a.abs().max(b.abs()).max(1.0),
        "{} != {}",
        a,
        b
    );
}

fn check_lambda_weighting(run_mode: PmeRunMode) {
    let state_a = single_state(run_mode, &charges_a());
    let state_b = single_state(run_mode, &charges_b());

    let mut pme = PmeGpu::new(config(run_mode, true)).unwrap();
    assert_eq!(pme.ngrids(), 2);
    pme.set_charges(&charges_a(), Some(&charges_b()));
    let x = coordinates();
    let fep = pme
        .launch(&cubic_box(2.0), &workload(), CoordinateSource::Host(&x), LAMBDA)
        .unwrap()
        .get()
        .unwrap();

    assert_close(
        fep.coulomb_energy,
        (1.0 - LAMBDA) * state_a.coulomb_energy + LAMBDA * state_b.coulomb_energy,
    );
    assert_close(fep.coulomb_dvdl, state_b.coulomb_energy - state_a.coulomb_energy);
    for a in 0..3 {
        for b in 0..3 {
            assert_close(
                fep.coulomb_virial[(a, b)],
                (1.0 - LAMBDA) * state_a.coulomb_virial[(a, b)]
                    + LAMBDA * state_b.coulomb_virial[(a, b)],
            );
        }
    }
    for i in 0..x.len() {
        let expected = state_a.forces[i] * (1.0 - LAMBDA) + state_b.forces[i] * LAMBDA;
        assert!((fep.forces[i] - expected).norm() < 1e-9 * expected.norm().max(1.0));
    }
}

#[test]
fn test_fep_lambda_weighting_on_device() {
    init_logging();
    check_lambda_weighting(PmeRunMode::Gpu);
}

#[test]
fn test_fep_lambda_weighting_with_host_fft_and_solve() {
    init_logging();
    check_lambda_weighting(PmeRunMode::Mixed);
}

#[test]
fn test_single_grid_ignores_lambda() {
    init_logging();
    let x = coordinates();
    let mut pme = PmeGpu::new(config(PmeRunMode::Gpu, false)).unwrap();
    pme.set_charges(&charges_a(), None);

    let at_one = pme
        .launch(&cubic_box(2.0), &workload(), CoordinateSource::Host(&x), 1.0)
        .unwrap()
        .get()
        .unwrap();
    let at_fraction = pme
        .launch(&cubic_box(2.0), &workload(), CoordinateSource::Host(&x), LAMBDA)
        .unwrap()
        .get()
        .unwrap();

    assert_eq!(at_one, at_fraction);
    assert_eq!(at_fraction.coulomb_dvdl, 0.0);
}

#[test]
fn test_host_reduction_into_engine_buffers() {
    init_logging();
    let x = coordinates();
    let reference = single_state(PmeRunMode::Gpu, &charges_a());

    let mut pme = PmeGpu::new(config(PmeRunMode::Gpu, false)).unwrap();
    pme.set_charges(&charges_a(), None);
    let mut fwv = ForceWithVirial::new(x.len(), true);
    fwv.force[1] = RVec::new(1.0, 2.0, 3.0);
    let mut enerd = EnergyData::new();

    let mut step = pme
        .launch(&cubic_box(2.0), &workload(), CoordinateSource::Host(&x), 1.0)
        .unwrap();
    loop {
        match step
            .try_finish_and_reduce(GpuTaskCompletion::Check, &mut fwv, &mut enerd)
            .unwrap()
        {
            StepStatus::Pending(pending) => step = pending,
            StepStatus::Finished(()) => break,
        }
    }

    assert_eq!(enerd.term(EnergyTerm::CoulombRecip), reference.coulomb_energy);
    assert_eq!(enerd.dvdl_lin(FepComponent::Coulomb), 0.0);
    assert_eq!(*fwv.virial(), reference.coulomb_virial);
    assert_eq!(fwv.force[0], reference.forces[0]);
    assert_eq!(fwv.force[1], reference.forces[1] + RVec::new(1.0, 2.0, 3.0));
}

#[test]
fn test_device_force_reduction_matches_host_reduction() {
    init_logging();
    let x = coordinates();
    let reference = single_state(PmeRunMode::Gpu, &charges_a());

    let mut pme = PmeGpu::new(config(PmeRunMode::Gpu, false)).unwrap();
    pme.set_charges(&charges_a(), None);
    let offset = RVec::new(-0.5, 0.25, 2.0);
    let destination = DeviceBuffer::from_vec(vec![offset; x.len()]);
    pme.set_device_force_destination(destination.clone());

    let device_reduction = StepWorkload {
        use_gpu_pme_f_reduction: true,
        ..workload()
    };
    let mut fwv = ForceWithVirial::new(x.len(), true);
    let mut enerd = EnergyData::new();
    pme.launch(&cubic_box(2.0), &device_reduction, CoordinateSource::Host(&x), 1.0)
        .unwrap()
        .wait_and_reduce(&mut fwv, &mut enerd)
        .unwrap();

    // Energy still flows through the host; forces went straight to the device buffer.
    assert_eq!(enerd.term(EnergyTerm::CoulombRecip), reference.coulomb_energy);
    assert!(fwv.force.iter().all(|f| *f == RVec::zeros()));
    for (f, f_ref) in destination.to_vec().iter().zip(&reference.forces) {
        assert!((f - (f_ref + offset)).norm() < 1e-12);
    }
    assert!(pme.forces_ready_event().unwrap().is_complete());
    assert_eq!(pme.device_forces().to_vec(), reference.forces);

    // Toggling back to host reduction on the next step.
    let output = pme
        .launch(&cubic_box(2.0), &workload(), CoordinateSource::Host(&x), 1.0)
        .unwrap()
        .get()
        .unwrap();
    assert!(output.have_force_output);
    assert_eq!(output.forces, reference.forces);
}

#[test]
#[should_panic(expected = "host-side force reduction")]
fn test_polling_rejected_with_device_force_reduction() {
    let x = coordinates();
    let mut pme = PmeGpu::new(config(PmeRunMode::Gpu, false)).unwrap();
    pme.set_charges(&charges_a(), None);
    pme.set_device_force_destination(DeviceBuffer::from_vec(vec![RVec::zeros(); x.len()]));
    let device_reduction = StepWorkload {
        use_gpu_pme_f_reduction: true,
        ..workload()
    };
    let _ = pme
        .launch(&cubic_box(2.0), &device_reduction, CoordinateSource::Host(&x), 1.0)
        .unwrap()
        .poll();
}

#[test]
fn test_disabled_gather_produces_no_forces() {
    init_logging();
    let x = coordinates();
    let reference = single_state(PmeRunMode::Gpu, &charges_a());

    let mut pme = PmeGpu::new(PmeConfig {
        perform_gpu_gather: false,
        ..config(PmeRunMode::Gpu, false)
    })
    .unwrap();
    pme.set_charges(&charges_a(), None);
    let mut fwv = ForceWithVirial::new(x.len(), true);
    let mut enerd = EnergyData::new();
    let step = pme
        .launch(&cubic_box(2.0), &workload(), CoordinateSource::Host(&x), 1.0)
        .unwrap();
    let status = step
        .try_finish_and_reduce(GpuTaskCompletion::Wait, &mut fwv, &mut enerd)
        .unwrap();

    assert!(status.is_finished());
    assert_eq!(enerd.term(EnergyTerm::CoulombRecip), reference.coulomb_energy);
    assert!(fwv.force.iter().all(|f| *f == RVec::zeros()));
    assert!(pme.forces_ready_event().is_none());
}

#[test]
#[should_panic(expected = "charge state(s) supplied")]
fn test_fep_requires_both_charge_states() {
    let mut pme = PmeGpu::new(config(PmeRunMode::Gpu, true)).unwrap();
    pme.set_charges(&charges_a(), None);
}

#[test]
#[should_panic(expected = "same length")]
fn test_fep_charge_lengths_must_match() {
    let mut pme = PmeGpu::new(config(PmeRunMode::Gpu, true)).unwrap();
    pme.set_charges(&charges_a(), Some(&[0.1]));
}
