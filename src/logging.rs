use anyhow::Result;
use colored::*;
use std::fmt;
use std::fs::File;
use std::path::Path;
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// A custom tracing event formatter for colorizing log output based on level.
///
/// This formatter is designed to provide clean, user-facing output where the
/// entire log line is colored according to its severity level, without any
/// extra metadata like timestamps or log levels printed. Interval and
/// summary lines from the text reporter go through this path.
pub struct ColorizedFormatter;

impl<S, N> FormatEvent<S, N> for ColorizedFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        // Buffer the formatted fields to apply color to the entire line.
        let mut buffer = String::new();
        let mut buf_writer = Writer::new(&mut buffer);
        ctx.format_fields(buf_writer.by_ref(), event)?;

        let colored_output = match *event.metadata().level() {
            Level::INFO => buffer.white(),
            Level::WARN => buffer.yellow(),
            Level::ERROR => buffer.red(),
            Level::DEBUG => buffer.blue(),
            Level::TRACE => buffer.purple(),
        };

        writeln!(writer, "{}", colored_output)
    }
}

/// Initialize tracing for the binary.
///
/// The filter honors `RUST_LOG` when set and otherwise defaults to `info`
/// (`debug` with `--verbose`). In structured-output mode log lines move to
/// stderr so stdout carries only the JSON report; with `--log-file` they go
/// to the file instead (the returned guard must be kept alive until exit so
/// the writer flushes).
pub fn init(verbose: bool, structured: bool, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match log_file {
        Some(path) => {
            let file = File::create(path)?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::fmt()
                .event_format(ColorizedFormatter)
                .with_env_filter(filter)
                .with_writer(writer)
                .init();
            Ok(Some(guard))
        }
        None if structured => {
            tracing_subscriber::fmt()
                .event_format(ColorizedFormatter)
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
        None => {
            tracing_subscriber::fmt()
                .event_format(ColorizedFormatter)
                .with_env_filter(filter)
                .init();
            Ok(None)
        }
    }
}
