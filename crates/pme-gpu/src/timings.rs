//! Stage timings.
//!
//! Device stages record their duration from the stream worker into a shared
//! sink; [`TimingRecorder::update`] folds those samples into the totals once
//! the stream has been synchronized. Host stages are timed on the caller.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Timed pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PmeStage {
    /// Spline weights and grid indices
    Spline,
    Spread,
    FftR2c,
    Solve,
    FftC2r,
    Gather,
    /// Box upload and force download
    Transfer,
    /// Host-threaded FFT (mixed mode)
    HostFft,
    /// Host-threaded solve (mixed mode)
    HostSolve,
    /// Host wait for spread before a host-side stage
    WaitSpread,
    /// Host wait at completion (poll fallback or block)
    WaitCompletion,
}

impl PmeStage {
    pub fn is_device_stage(self) -> bool {
        matches!(
            self,
            PmeStage::Spline
                | PmeStage::Spread
                | PmeStage::FftR2c
                | PmeStage::Solve
                | PmeStage::FftC2r
                | PmeStage::Gather
                | PmeStage::Transfer
        )
    }
}

/// Accumulated timing of one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTiming {
    pub calls: u64,
    pub total_us: u64,
}

/// Serializable snapshot of all stage timings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingReport {
    pub stages: BTreeMap<PmeStage, StageTiming>,
}

impl TimingReport {
    pub fn get(&self, stage: PmeStage) -> StageTiming {
        self.stages.get(&stage).copied().unwrap_or_default()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Sink the stream worker pushes device samples into.
pub type TimingSink = Arc<Mutex<Vec<(PmeStage, Duration)>>>;

/// Collects device and host stage timings.
#[derive(Debug, Default)]
pub struct TimingRecorder {
    sink: TimingSink,
    report: TimingReport,
}

impl TimingRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for device jobs.
    pub fn sink(&self) -> TimingSink {
        Arc::clone(&self.sink)
    }

    /// Records a host-side sample.
    pub fn record_host(&mut self, stage: PmeStage, elapsed: Duration) {
        Self::add(&mut self.report, stage, elapsed);
    }

    /// Times a host-side closure.
    pub fn time_host<R>(&mut self, stage: PmeStage, f: impl FnOnce() -> R) -> R {
        let start = Instant::now();
        let result = f();
        self.record_host(stage, start.elapsed());
        result
    }

    /// Folds pending device samples; call only after the stream has drained.
    pub fn update(&mut self) {
        let samples = std::mem::take(&mut *self.sink.lock());
        for (stage, elapsed) in samples {
            Self::add(&mut self.report, stage, elapsed);
        }
    }

    pub fn reset(&mut self) {
        self.sink.lock().clear();
        self.report = TimingReport::default();
    }

    pub fn report(&self) -> &TimingReport {
        &self.report
    }

    fn add(report: &mut TimingReport, stage: PmeStage, elapsed: Duration) {
        let entry = report.stages.entry(stage).or_default();
        entry.calls += 1;
        entry.total_us += elapsed.as_micros() as u64;
    }
}

/// Wraps a device job so its duration lands in `sink`.
pub fn timed_job<F>(sink: &TimingSink, stage: PmeStage, job: F) -> impl FnOnce() -> anyhow::Result<()> + Send + 'static
where
    F: FnOnce() -> anyhow::Result<()> + Send + 'static,
{
    let sink = Arc::clone(sink);
    move || {
        let start = Instant::now();
        let result = job();
        sink.lock().push((stage, start.elapsed()));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_samples_fold_on_update() {
        let mut timings = TimingRecorder::new();
        let job = timed_job(&timings.sink(), PmeStage::Spread, || Ok(()));
        job().unwrap();

        assert_eq!(timings.report().get(PmeStage::Spread).calls, 0);
        timings.update();
        assert_eq!(timings.report().get(PmeStage::Spread).calls, 1);

        timings.reset();
        assert!(timings.report().stages.is_empty());
    }

    #[test]
    fn test_host_timing_and_report_json() {
        let mut timings = TimingRecorder::new();
        let v = timings.time_host(PmeStage::HostSolve, || 42);
        assert_eq!(v, 42);
        assert!(!PmeStage::HostSolve.is_device_stage());
        let json = timings.report().to_json().unwrap();
        assert!(json.contains("HostSolve"));
    }
}
