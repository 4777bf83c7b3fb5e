//! Simulation-box change detection.
//!
//! The previous box is copied on every call; the reciprocal box is only
//! recomputed when the box is dynamic or one of its six lower-triangular
//! entries changed. The first call always recomputes because the stored box
//! starts out as NaN.

use pme_core::{lower_triangle, Matrix};

/// Transform applied to the box before inversion (e.g. wall geometry).
pub trait BoxScaler: Send + Sync {
    fn scale_box(&self, box_matrix: &Matrix) -> Matrix;
}

/// Leaves the box as is.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityScaler;

impl BoxScaler for IdentityScaler {
    fn scale_box(&self, box_matrix: &Matrix) -> Matrix {
        *box_matrix
    }
}

/// Stretches the z box vector by `zfac` (3DC wall Ewald).
#[derive(Debug, Clone, Copy)]
pub struct WallZScaler {
    pub zfac: f64,
}

impl BoxScaler for WallZScaler {
    fn scale_box(&self, box_matrix: &Matrix) -> Matrix {
        let mut scaled = *box_matrix;
        for j in 0..3 {
            scaled[(2, j)] *= self.zfac;
        }
        scaled
    }
}

/// Reciprocal box and cell volume of a (scaled) box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReciprocalBox {
    pub recip: Matrix,
    pub volume: f64,
}

impl ReciprocalBox {
    /// Inverts `scaled_box`. Panics on a singular box.
    pub fn from_scaled_box(scaled_box: &Matrix) -> Self {
        let recip = scaled_box
            .try_inverse()
            .unwrap_or_else(|| panic!("Simulation box is singular: {}", scaled_box));
        let volume = scaled_box[(0, 0)] * scaled_box[(1, 1)] * scaled_box[(2, 2)];
        Self { recip, volume }
    }
}

/// What a triggered recompute produces.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxUpdate {
    /// Pushed to the device-resident kernel parameters
    pub device: ReciprocalBox,
    /// Host-side copy; only kept when the solve runs on the host
    pub host_recip: Option<ReciprocalBox>,
}

/// Tracks the box between steps.
pub struct BoxStateTracker {
    previous: Matrix,
    scaler: Box<dyn BoxScaler>,
    recompute_count: u64,
}

impl BoxStateTracker {
    pub fn new(scaler: Box<dyn BoxScaler>) -> Self {
        Self {
            previous: Matrix::from_element(f64::NAN),
            scaler,
            recompute_count: 0,
        }
    }

    /// Compares against the stored box, then stores `box_matrix`.
    ///
    /// Returns `Some` when a recompute is due.
    pub fn update(
        &mut self,
        box_matrix: &Matrix,
        have_dynamic_box: bool,
        host_solve: bool,
    ) -> Option<BoxUpdate> {
        let changed = lower_triangle().any(|(i, j)| box_matrix[(i, j)] != self.previous[(i, j)]);
        let recompute = have_dynamic_box || changed;
        self.previous = *box_matrix;

        if !recompute {
            return None;
        }
        self.recompute_count += 1;
        log::debug!("Box changed, recomputing reciprocal box (#{})", self.recompute_count);

        // Inverted on the host for both placements, so a singular box is
        // always a contract failure on the controlling thread.
        let reciprocal = ReciprocalBox::from_scaled_box(&self.scaler.scale_box(box_matrix));
        Some(BoxUpdate {
            device: reciprocal,
            host_recip: host_solve.then_some(reciprocal),
        })
    }

    pub fn previous_box(&self) -> &Matrix {
        &self.previous
    }

    /// Number of recomputes triggered so far.
    pub fn recompute_count(&self) -> u64 {
        self.recompute_count
    }
}

impl std::fmt::Debug for BoxStateTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStateTracker")
            .field("previous", &self.previous)
            .field("recompute_count", &self.recompute_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use pme_core::{box_from_rows, cubic_box};

    #[test]
    fn test_first_call_always_recomputes() {
        let mut tracker = BoxStateTracker::new(Box::new(IdentityScaler));
        assert!(tracker.update(&cubic_box(3.0), false, false).is_some());
        assert!(tracker.update(&cubic_box(3.0), false, false).is_none());
        assert_eq!(tracker.recompute_count(), 1);
    }

    #[test]
    fn test_dynamic_box_always_recomputes() {
        let mut tracker = BoxStateTracker::new(Box::new(IdentityScaler));
        for _ in 0..3 {
            assert!(tracker.update(&cubic_box(3.0), true, false).is_some());
        }
    }

    #[test]
    fn test_each_lower_entry_triggers() {
        let base = box_from_rows([3.0, 0.0, 0.0], [0.5, 3.0, 0.0], [0.2, 0.3, 3.0]);
        for (i, j) in lower_triangle() {
            let mut tracker = BoxStateTracker::new(Box::new(IdentityScaler));
            tracker.update(&base, false, false);
            let mut changed = base;
            changed[(i, j)] += 0.01;
            assert!(tracker.update(&changed, false, false).is_some(), "entry ({}, {})", i, j);
        }
    }

    #[test]
    fn test_upper_entries_ignored_but_copied() {
        let mut tracker = BoxStateTracker::new(Box::new(IdentityScaler));
        let base = cubic_box(2.0);
        tracker.update(&base, false, false);
        let mut upper = base;
        upper[(0, 2)] = 1.0;
        assert!(tracker.update(&upper, false, false).is_none());
        assert_eq!(tracker.previous_box()[(0, 2)], 1.0);
    }

    #[test]
    fn test_host_recip_only_for_host_solve() {
        let mut tracker = BoxStateTracker::new(Box::new(IdentityScaler));
        let device_only = tracker.update(&cubic_box(2.0), true, false).unwrap();
        assert!(device_only.host_recip.is_none());
        assert_relative_eq!(device_only.device.volume, 8.0);

        let with_host = tracker.update(&cubic_box(2.0), true, true).unwrap();
        let recip = with_host.host_recip.unwrap();
        assert_relative_eq!(recip.volume, 8.0);
    }

    #[test]
    fn test_wall_scaling_applies_to_reciprocal() {
        let mut tracker = BoxStateTracker::new(Box::new(WallZScaler { zfac: 3.0 }));
        let recip = tracker.update(&cubic_box(2.0), false, true).unwrap().device;
        assert_relative_eq!(recip.volume, 24.0);
        assert_relative_eq!(recip.recip[(2, 2)], 1.0 / 6.0);
        assert_relative_eq!(recip.recip[(0, 0)], 0.5);
    }

    #[test]
    fn test_triclinic_inverse() {
        let b = box_from_rows([3.0, 0.0, 0.0], [1.0, 3.0, 0.0], [0.5, 0.5, 3.0]);
        let recip = ReciprocalBox::from_scaled_box(&b);
        let product = b * recip.recip;
        assert_relative_eq!(product, Matrix::identity(), epsilon = 1e-12);
        assert_relative_eq!(recip.volume, 27.0);
        assert_eq!(recip.recip[(0, 1)], 0.0);
    }

    #[test]
    #[should_panic(expected = "singular")]
    fn test_singular_box_panics() {
        ReciprocalBox::from_scaled_box(&Matrix::zeros());
    }

    #[test]
    #[should_panic(expected = "singular")]
    fn test_singular_box_rejected_without_host_solve() {
        let mut tracker = BoxStateTracker::new(Box::new(IdentityScaler));
        tracker.update(&Matrix::zeros(), false, false);
    }
}
