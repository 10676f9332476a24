//! # Reporter Module
//!
//! Report collection and output for a test run. The driver invokes the
//! reporter at defined lifecycle points: on connect, at test start, when
//! each data stream comes up, at every completed interval, and on finish.
//!
//! A run uses exactly one output mode. In text mode the reporter emits
//! line-oriented output through tracing as the run progresses; in
//! structured mode it stays silent and the caller renders the accumulated
//! [`TestReport`] as JSON. The report object itself is populated in both
//! modes, since it is also the result contract handed back to the caller:
//! `start` metadata, the ordered `intervals` sequence, the `end` summary,
//! and an `error` string that is empty on success.

use crate::metrics::CpuUtilization;
use crate::session::TestSession;
use crate::utils::{format_bitrate, format_bytes};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::io;
use std::path::Path;
use tracing::info;

/// Mutually exclusive output modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputMode {
    /// Machine-readable report tree, rendered by the caller.
    Structured,
    /// Line-oriented human-readable output.
    Text,
}

/// One completed reporting interval.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IntervalRecord {
    pub start_secs: f64,
    pub end_secs: f64,
    pub bytes: u64,
    pub bits_per_second: f64,
    /// True for intervals inside the warm-up window.
    pub omitted: bool,
}

/// The four-field result object consumed by callers.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TestReport {
    /// Pre-run metadata (version, timestamp, peer, test parameters).
    pub start: Map<String, Value>,
    /// Per-interval records, appended as data becomes available.
    pub intervals: Vec<IntervalRecord>,
    /// Final summary, empty until the test completes.
    pub end: Map<String, Value>,
    /// Empty on success, human-readable diagnostic otherwise.
    pub error: String,
}

impl TestReport {
    /// Write the report as pretty-printed JSON to a file.
    pub fn write_to_file(&self, path: &Path) -> io::Result<()> {
        let body = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, body)
    }
}

/// Lifecycle-driven report builder.
#[derive(Debug)]
pub struct Reporter {
    mode: OutputMode,
    report: TestReport,
    interval_start_secs: f64,
    bytes_at_interval_start: u64,
}

impl Reporter {
    pub fn new(mode: OutputMode) -> Self {
        Self {
            mode,
            report: TestReport::default(),
            interval_start_secs: 0.0,
            bytes_at_interval_start: 0,
        }
    }

    fn text(&self) -> bool {
        self.mode == OutputMode::Text
    }

    /// Control connection established: record run metadata and peer identity.
    pub fn on_connect(&mut self, session: &TestSession) {
        let now = chrono::Utc::now();
        self.report
            .start
            .insert("version".into(), json!(crate::VERSION));
        self.report.start.insert(
            "system_info".into(),
            json!({
                "os": std::env::consts::OS,
                "architecture": std::env::consts::ARCH,
                "cpu_cores": num_cpus::get(),
            }),
        );
        self.report.start.insert(
            "timestamp".into(),
            json!({
                "time": now.to_rfc2822(),
                "timesecs": now.timestamp(),
            }),
        );
        self.report.start.insert(
            "connecting_to".into(),
            json!({
                "host": session.config.host,
                "port": session.config.port,
            }),
        );
        self.report
            .start
            .insert("cookie".into(), json!(session.cookie));

        if self.text() {
            info!(
                "Connecting to host {}, port {}",
                session.config.host, session.config.port
            );
            if session.reverse {
                info!("Reverse mode, remote host {} is sending", session.config.host);
            }
        }
    }

    /// Test negotiated: record the agreed parameters.
    pub fn on_test_start(&mut self, session: &TestSession) {
        let config = &session.config;
        self.report.start.insert(
            "test_start".into(),
            json!({
                "protocol": session.protocol.name(),
                "num_streams": config.parallel,
                "blksize": config.block_size,
                "omit_secs": config.omit.map(|o| o.as_secs_f64()).unwrap_or(0.0),
                "duration_secs": config.duration.map(|d| d.as_secs_f64()).unwrap_or(0.0),
                "bytes": config.bytes.unwrap_or(0),
                "blocks": config.blocks.unwrap_or(0),
                "reverse": session.reverse,
            }),
        );

        if self.text() && session.verbose {
            info!(
                "Starting {} test: {} streams, {} byte blocks",
                session.protocol,
                config.parallel,
                config.block_size
            );
        }
    }

    /// A data stream connected.
    pub fn on_new_stream(&mut self, id: usize) {
        if self.text() {
            info!("[{:>3}] data stream connected", id);
        }
    }

    /// The interval timer fired: close the current interval and open the
    /// next one.
    pub fn on_interval(&mut self, session: &TestSession, now_secs: f64) {
        let bytes = session
            .bytes_transferred()
            .saturating_sub(self.bytes_at_interval_start);
        let seconds = (now_secs - self.interval_start_secs).max(f64::EPSILON);
        let record = IntervalRecord {
            start_secs: self.interval_start_secs,
            end_secs: now_secs,
            bytes,
            bits_per_second: bytes as f64 * 8.0 / seconds,
            omitted: session.omitting,
        };

        if self.text() {
            info!(
                "[SUM] {:5.2}-{:5.2} sec  {:>12}  {:>16}{}",
                record.start_secs,
                record.end_secs,
                format_bytes(record.bytes),
                format_bitrate(record.bits_per_second),
                if record.omitted { "  (omitted)" } else { "" }
            );
        }

        self.interval_start_secs = now_secs;
        self.bytes_at_interval_start = session.bytes_transferred();
        self.report.intervals.push(record);
    }

    /// The warm-up window ended and the session counters restarted; keep
    /// the interval accounting consistent with them.
    pub fn on_omit_over(&mut self, session: &TestSession) {
        self.bytes_at_interval_start = session.bytes_transferred();
        if self.text() {
            info!("Warm-up over, starting measurement");
        }
    }

    /// End-of-measurement transition: populate the final summary.
    pub fn record_final(
        &mut self,
        session: &TestSession,
        cpu: Option<CpuUtilization>,
        elapsed_secs: f64,
    ) {
        let bytes = session.bytes_transferred();
        let seconds = elapsed_secs.max(f64::EPSILON);

        self.report.end.insert("seconds".into(), json!(elapsed_secs));
        self.report.end.insert("bytes".into(), json!(bytes));
        self.report
            .end
            .insert("bytes_sent".into(), json!(session.bytes_sent));
        self.report
            .end
            .insert("bytes_received".into(), json!(session.bytes_received));
        self.report
            .end
            .insert("blocks_sent".into(), json!(session.blocks_sent));
        self.report
            .end
            .insert("bits_per_second".into(), json!(bytes as f64 * 8.0 / seconds));
        self.report.end.insert(
            "streams".into(),
            Value::Array(
                session
                    .streams
                    .iter()
                    .map(|s| json!({"id": s.id, "bytes": s.bytes_transferred}))
                    .collect(),
            ),
        );
        if let Some(cpu) = cpu {
            self.report.end.insert(
                "cpu_utilization_percent".into(),
                json!({
                    "host_user": cpu.user_percent,
                    "host_system": cpu.system_percent,
                    "host_total": cpu.total_percent,
                }),
            );
        }
    }

    /// Final display, once the peer's results (if any) are in.
    pub fn on_display(&mut self, session: &TestSession) {
        if let Some(peer) = &session.peer_results {
            self.report.end.insert("peer".into(), peer.clone());
        }

        if self.text() {
            let bytes = self.report.end.get("bytes").and_then(Value::as_u64);
            let seconds = self.report.end.get("seconds").and_then(Value::as_f64);
            let rate = self
                .report
                .end
                .get("bits_per_second")
                .and_then(Value::as_f64);
            if let (Some(bytes), Some(seconds), Some(rate)) = (bytes, seconds, rate) {
                info!(
                    "[SUM] {:5.2}-{:5.2} sec  {:>12}  {:>16}  {}",
                    0.0,
                    seconds,
                    format_bytes(bytes),
                    format_bitrate(rate),
                    if session.reverse { "receiver" } else { "sender" }
                );
            }
            info!("Done.");
        }
    }

    /// Record a fatal diagnostic.
    pub fn set_error(&mut self, message: &str) {
        self.report.error = message.to_string();
    }

    pub fn report(&self) -> &TestReport {
        &self.report
    }

    pub fn into_report(self) -> TestReport {
        self.report
    }
}
