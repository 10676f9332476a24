//! # Client Driver Module
//!
//! The single-threaded run loop that advances a [`TestSession`] from
//! creation to completion. Every iteration follows the same shape: poll the
//! cancellation flag, wait for readiness with the next timer deadline as the
//! bound, service a pending control message ahead of any data transfer, move
//! data while the test is running, fire due timers, and evaluate the
//! stopping condition.
//!
//! The driver talks to its collaborators exclusively through seams
//! ([`ControlPlane`], [`ReadinessSource`], [`DataPlane`], [`Clock`]), so the
//! full state machine is exercisable without sockets or wall-clock time.
//! Every exit path, including errors and cancellation, leaves the session in
//! a consistent terminal state with any non-blocking streams reverted.

use crate::cancel::CancelToken;
use crate::cli::TestConfig;
use crate::control::{ControlPlane, TcpControl};
use crate::poll::{PollMultiplexer, Readiness, ReadinessSource};
use crate::report::{OutputMode, Reporter, TestReport};
use crate::session::{TestSession, TestState};
use crate::timer::{TimerKind, TimerScheduler};
use crate::transfer::{DataPlane, SocketDataPlane};
use std::io;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Time source seam; real runs use [`SystemClock`].
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Monotonic wall clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Fatal driver failures, each mapped to a distinct negative status code.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("control connection failed: {0}")]
    Connect(#[source] io::Error),

    #[error("readiness wait failed: {0}")]
    Wait(#[source] io::Error),

    #[error("control channel failed: {0}")]
    Control(#[source] io::Error),

    #[error("data transfer failed: {0}")]
    Transfer(#[source] io::Error),
}

impl DriverError {
    /// Integer status for callers that cannot consume a Rust error.
    /// Zero is success; each failure class gets its own negative value.
    pub fn status(&self) -> i32 {
        match self {
            DriverError::Config(_) => -1,
            DriverError::Connect(_) => -2,
            DriverError::Wait(_) => -3,
            DriverError::Control(_) => -4,
            DriverError::Transfer(_) => -5,
        }
    }
}

/// Outcome of a full run: an integer status plus the populated report.
/// The report's `error` field is non-empty exactly when `status` is negative.
#[derive(Debug)]
pub struct TestOutcome {
    pub status: i32,
    pub report: TestReport,
}

/// The client state machine.
pub struct Driver<'a> {
    control: &'a mut dyn ControlPlane,
    readiness: &'a mut dyn ReadinessSource,
    data: &'a mut dyn DataPlane,
    clock: &'a dyn Clock,
    cancel: CancelToken,
    reporter: &'a mut Reporter,
    timers: TimerScheduler,
    /// Whether the driver has switched the streams to non-blocking mode and
    /// not yet reverted them.
    streams_nonblocking: bool,
}

impl<'a> Driver<'a> {
    pub fn new(
        control: &'a mut dyn ControlPlane,
        readiness: &'a mut dyn ReadinessSource,
        data: &'a mut dyn DataPlane,
        clock: &'a dyn Clock,
        cancel: CancelToken,
        reporter: &'a mut Reporter,
    ) -> Self {
        Self {
            control,
            readiness,
            data,
            clock,
            cancel,
            reporter,
            timers: TimerScheduler::new(),
            streams_nonblocking: false,
        }
    }

    /// Run the session to a terminal state.
    ///
    /// On error the session carries a populated diagnostic, the report's
    /// error field is set, and any non-blocking streams have been reverted.
    pub fn run(&mut self, session: &mut TestSession) -> Result<(), DriverError> {
        match self.run_loop(session) {
            Ok(()) => Ok(()),
            Err(err) => {
                session.error = err.to_string();
                if self.streams_nonblocking {
                    let _ = self.data.set_streams_nonblocking(session, false);
                    self.streams_nonblocking = false;
                }
                self.reporter.set_error(&session.error);
                error!("{}", err);
                Err(err)
            }
        }
    }

    fn run_loop(&mut self, session: &mut TestSession) -> Result<(), DriverError> {
        if session.config.parallel == 0 {
            return Err(DriverError::Config("parallel stream count is zero".into()));
        }
        if session.config.block_size == 0 {
            return Err(DriverError::Config("block size is zero".into()));
        }

        if let Some(core) = session.config.affinity {
            if !core_affinity::set_for_current(core_affinity::CoreId { id: core }) {
                warn!("could not pin to CPU core {}", core);
            }
        }

        self.control
            .connect(session)
            .map_err(DriverError::Connect)?;
        session.state = TestState::TestStart;
        session.cpu.start();
        self.reporter.on_connect(session);

        while session.state != TestState::Done {
            // Cancellation is observed exactly once per iteration, at the
            // top, never mid-action.
            if self.cancel.is_cancelled() {
                self.forced_finish(session)?;
                break;
            }

            let timeout = self.timers.next_timeout(self.clock.now());
            let ready = match self.readiness.wait(session, timeout) {
                Ok(ready) => ready,
                // A signal cut the wait short; the flag check at the top of
                // the next iteration decides what it meant.
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(DriverError::Wait(err)),
            };

            // Control messages outrank data transfer within an iteration.
            if ready.control {
                let received = self
                    .control
                    .handle_message(session)
                    .map_err(DriverError::Control)?;
                self.on_control_event(session, received)?;
            }

            if session.state.is_running() {
                self.run_iteration(session, &ready)?;
            } else if session.reverse && session.state == TestState::TestEnd {
                // In reverse mode data already in flight keeps arriving
                // after the end transition; drain it so the peer's close
                // sequence is not stalled.
                self.data
                    .receive_round(session, &ready)
                    .map_err(DriverError::Transfer)?;
            }
        }

        Ok(())
    }

    /// One running-state iteration: data transfer, due timers, stopping
    /// condition.
    fn run_iteration(
        &mut self,
        session: &mut TestSession,
        ready: &Readiness,
    ) -> Result<(), DriverError> {
        // Datagram sockets never change mode; stream sockets go
        // non-blocking once, at the first running iteration.
        if !self.streams_nonblocking && session.protocol.is_connection_oriented() {
            self.data
                .set_streams_nonblocking(session, true)
                .map_err(DriverError::Transfer)?;
            self.streams_nonblocking = true;
        }

        if session.reverse {
            self.data
                .receive_round(session, ready)
                .map_err(DriverError::Transfer)?;
        } else {
            self.data
                .send_round(session, ready)
                .map_err(DriverError::Transfer)?;
        }

        let now = self.clock.now();
        for kind in self.timers.run_due(now) {
            self.on_timer(session, kind, now);
        }

        // The stopping condition is suppressed for the whole warm-up window.
        let (bytes, blocks) = if session.reverse {
            (session.bytes_received, session.blocks_received)
        } else {
            (session.bytes_sent, session.blocks_sent)
        };
        if !session.omitting && session.limits.reached(session.done, bytes, blocks) {
            self.complete(session)?;
        }

        Ok(())
    }

    /// React to a state message consumed from the control channel.
    fn on_control_event(
        &mut self,
        session: &mut TestSession,
        received: TestState,
    ) -> Result<(), DriverError> {
        match received {
            TestState::CreateStreams => {
                for stream in &session.streams {
                    self.reporter.on_new_stream(stream.id);
                }
            }
            TestState::TestStart => {
                let now = self.clock.now();
                session.started_at = Some(now);

                let omit = session.config.omit;
                if let Some(omit) = omit {
                    self.timers.schedule(TimerKind::OmitOver, now + omit);
                }
                if let Some(duration) = session.limits.duration {
                    // The duration window starts after the warm-up.
                    let deadline = now + omit.unwrap_or_default() + duration;
                    self.timers.schedule(TimerKind::DurationExpired, deadline);
                }
                if let Some(interval) = session.config.interval {
                    self.timers
                        .schedule_periodic(TimerKind::IntervalReport, now + interval, interval);
                }

                self.reporter.on_test_start(session);
            }
            TestState::DisplayResults => {
                self.reporter.on_display(session);
                self.control
                    .send_state(session, TestState::Done)
                    .map_err(DriverError::Control)?;
            }
            // TestRunning, ExchangeResults and the rest carry no extra
            // driver-side action beyond the state change already applied.
            _ => {}
        }
        Ok(())
    }

    fn on_timer(&mut self, session: &mut TestSession, kind: TimerKind, now: Instant) {
        match kind {
            TimerKind::DurationExpired => {
                debug!("duration limit reached");
                session.done = true;
            }
            TimerKind::OmitOver => {
                session.omitting = false;
                session.restart_counters();
                self.reporter.on_omit_over(session);
            }
            TimerKind::IntervalReport => {
                self.reporter.on_interval(session, session.elapsed_secs(now));
            }
        }
    }

    /// Normal completion: finishing actions, then the end-of-test state
    /// message.
    fn complete(&mut self, session: &mut TestSession) -> Result<(), DriverError> {
        self.finish_measurement(session)?;
        self.control
            .send_state(session, TestState::TestEnd)
            .map_err(DriverError::Control)?;
        Ok(())
    }

    /// Cancellation path: identical finishing actions, then a best-effort
    /// terminate message. Cancellation is not an error; the status stays
    /// zero.
    fn forced_finish(&mut self, session: &mut TestSession) -> Result<(), DriverError> {
        debug!("cancellation observed, finishing early");
        self.finish_measurement(session)?;
        // The peer may already be gone.
        let _ = self.control.send_state(session, TestState::ClientTerminate);
        session.state = TestState::Done;
        Ok(())
    }

    /// Finishing actions shared by completion and cancellation: revert
    /// stream blocking mode, stamp the end time, stop the timers, and
    /// populate the final summary.
    fn finish_measurement(&mut self, session: &mut TestSession) -> Result<(), DriverError> {
        if self.streams_nonblocking {
            self.data
                .set_streams_nonblocking(session, false)
                .map_err(DriverError::Transfer)?;
            self.streams_nonblocking = false;
        }

        let now = self.clock.now();
        session.ended_at = Some(now);
        self.timers.clear();

        let cpu = session.cpu.finish();
        self.reporter
            .record_final(session, cpu, session.elapsed_secs(now));
        Ok(())
    }
}

/// Run a complete test with the real collaborators and hand back the
/// integer status plus the report.
pub fn execute(config: TestConfig, cancel: CancelToken) -> TestOutcome {
    let mode = if config.structured {
        OutputMode::Structured
    } else {
        OutputMode::Text
    };
    let mut reporter = Reporter::new(mode);
    let mut control = TcpControl::new();
    let mut readiness = PollMultiplexer::new();
    let mut data = SocketDataPlane::new(config.block_size);
    let clock = SystemClock;
    let mut session = TestSession::new(config);

    let status = {
        let mut driver = Driver::new(
            &mut control,
            &mut readiness,
            &mut data,
            &clock,
            cancel,
            &mut reporter,
        );
        match driver.run(&mut session) {
            Ok(()) => 0,
            Err(err) => err.status(),
        }
    };

    TestOutcome {
        status,
        report: reporter.into_report(),
    }
}
