//! # netload - Network Throughput Test Driver
//!
//! A client-side throughput tester built around a single-threaded,
//! I/O-multiplexed run loop. The client connects to a cooperating server
//! over a TCP control channel, negotiates test parameters, opens one or
//! more data streams, and moves payload blocks until a duration, byte, or
//! block limit is reached, producing a structured or text report.
//!
//! ## Features
//!
//! - **TCP and UDP data streams** with parallel stream support
//! - **Timer-driven lifecycle**: duration limit, warm-up omission, and
//!   periodic interval reports from one deadline scheduler
//! - **Cooperative cancellation**: termination signals only mark a flag
//!   that the run loop polls between iterations
//! - **Reverse mode** where the server sends and the client receives
//! - **Dual reporting**: line-oriented text output or a JSON document
//!
//! ## Architecture
//!
//! The crate follows a modular design with clear separation of concerns:
//!
//! - `cli`: Command-line interface and validated test configuration
//! - `session`: The central test aggregate, states, and stopping limits
//! - `control`: Control-channel protocol (state bytes, JSON blobs)
//! - `transfer`: Per-iteration data movement over the stream set
//! - `poll`: Readiness multiplexing over the control channel and streams
//! - `timer`: Deadline-ordered timers driving the run loop's waits
//! - `cancel`: Signal-safe cancellation flag
//! - `driver`: The client state machine tying the seams together
//! - `report`: Report accumulation and text/structured output
//! - `metrics`: Process CPU utilization for the final summary
//! - `logging`: Colorized tracing setup for the binary
//! - `utils`: Display formatters for byte counts and bit rates

pub mod cancel;
pub mod cli;
pub mod control;
pub mod driver;
pub mod logging;
pub mod metrics;
pub mod poll;
pub mod report;
pub mod session;
pub mod timer;
pub mod transfer;
pub mod utils;

pub use cancel::CancelToken;
pub use cli::{Args, TestConfig};
pub use control::{ControlPlane, TcpControl, TestParams, TestResults};
pub use driver::{execute, Clock, Driver, DriverError, SystemClock, TestOutcome};
pub use metrics::{CpuTracker, CpuUtilization};
pub use poll::{PollMultiplexer, Readiness, ReadinessSource};
pub use report::{IntervalRecord, OutputMode, Reporter, TestReport};
pub use session::{Protocol, Role, TestLimits, TestSession, TestState, TestStream};
pub use timer::{TimerKind, TimerScheduler};
pub use transfer::{DataPlane, SocketDataPlane};

/// Version of the crate, reported to the peer and in the start metadata.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol-dependent defaults shared by the CLI and library callers.
pub mod defaults {
    use std::time::Duration;

    /// Default server port for the control channel and data streams.
    pub const PORT: u16 = 5201;

    /// Default wall-clock test duration.
    pub const DURATION: Duration = Duration::from_secs(10);

    /// Default number of parallel data streams.
    pub const PARALLEL: usize = 1;

    /// Default payload block size for TCP streams.
    pub const TCP_BLOCK_SIZE: usize = 128 * 1024;

    /// Default payload block size for UDP streams, sized to fit a typical
    /// Ethernet MTU without fragmentation.
    pub const UDP_BLOCK_SIZE: usize = 1460;

    /// Default pause between periodic interval reports.
    pub const INTERVAL: Duration = Duration::from_secs(1);
}
