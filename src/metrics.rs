//! # CPU Utilization Metrics Module
//!
//! Process CPU accounting for the final report. The driver snapshots a
//! baseline right after the control connection is established and a final
//! sample on the end-of-test transition; the difference, divided by wall
//! time, yields the user/system/total utilization percentages reported in
//! the end summary.

use nix::sys::resource::{getrusage, UsageWho};
use nix::sys::time::TimeVal;
use serde::{Deserialize, Serialize};
use std::io;
use std::time::{Duration, Instant};

fn timeval_to_duration(tv: TimeVal) -> Duration {
    Duration::new(tv.tv_sec().max(0) as u64, (tv.tv_usec().max(0) as u32) * 1000)
}

/// One CPU-time sample paired with the wall clock it was taken at.
#[derive(Clone, Copy, Debug)]
pub struct CpuSample {
    wall: Instant,
    user: Duration,
    system: Duration,
}

impl CpuSample {
    /// Sample this process's accumulated CPU time.
    pub fn now() -> io::Result<Self> {
        let usage = getrusage(UsageWho::RUSAGE_SELF).map_err(io::Error::from)?;
        Ok(Self {
            wall: Instant::now(),
            user: timeval_to_duration(usage.user_time()),
            system: timeval_to_duration(usage.system_time()),
        })
    }
}

/// CPU utilization over the measured window, in percent of one core.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct CpuUtilization {
    pub user_percent: f64,
    pub system_percent: f64,
    pub total_percent: f64,
}

/// Baseline/final sample pair owned by the session.
#[derive(Clone, Copy, Debug, Default)]
pub struct CpuTracker {
    baseline: Option<CpuSample>,
}

impl CpuTracker {
    /// Record the baseline sample. Sampling failures are swallowed; CPU
    /// figures are then simply absent from the report.
    pub fn start(&mut self) {
        self.baseline = CpuSample::now().ok();
    }

    /// Compute utilization since the baseline, if one was recorded.
    pub fn finish(&self) -> Option<CpuUtilization> {
        let baseline = self.baseline?;
        let end = CpuSample::now().ok()?;

        let wall = end.wall.duration_since(baseline.wall).as_secs_f64();
        if wall <= 0.0 {
            return None;
        }

        let user = end.user.saturating_sub(baseline.user).as_secs_f64();
        let system = end.system.saturating_sub(baseline.system).as_secs_f64();

        Some(CpuUtilization {
            user_percent: user / wall * 100.0,
            system_percent: system / wall * 100.0,
            total_percent: (user + system) / wall * 100.0,
        })
    }
}
