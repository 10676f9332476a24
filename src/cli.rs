use crate::session::Protocol;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// netload - a network throughput test driver
#[derive(Parser, Debug, Clone)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Server host to connect to
    pub host: String,

    /// Server port for the control channel and data streams
    #[clap(short = 'p', long, default_value_t = crate::defaults::PORT)]
    pub port: u16,

    /// Time to run the test for (e.g. "10s", "2m"; ignored if a byte or
    /// block limit is given)
    #[clap(short = 't', long = "time", value_parser = parse_duration)]
    pub time: Option<Duration>,

    /// Number of bytes to send (e.g. "100M"; takes precedence over time)
    #[clap(short = 'n', long, value_parser = parse_size)]
    pub bytes: Option<u64>,

    /// Number of blocks (packets) to send (takes precedence over time)
    #[clap(short = 'k', long, value_parser = parse_size)]
    pub blocks: Option<u64>,

    /// Number of parallel data streams
    #[clap(short = 'P', long, default_value_t = crate::defaults::PARALLEL)]
    pub parallel: usize,

    /// Length of the block written per send (e.g. "128K")
    #[clap(short = 'l', long, value_parser = parse_size)]
    pub block_size: Option<u64>,

    /// Run in reverse mode (server sends, client receives)
    #[clap(short = 'R', long)]
    pub reverse: bool,

    /// Use UDP rather than TCP for the data streams
    #[clap(short = 'u', long)]
    pub udp: bool,

    /// Warm-up period excluded from the stopping condition and from
    /// steady-state statistics (e.g. "2s")
    #[clap(short = 'O', long, value_parser = parse_duration)]
    pub omit: Option<Duration>,

    /// Pause between periodic throughput reports ("0" disables them)
    #[clap(short = 'i', long, value_parser = parse_duration, default_value = "1s")]
    pub interval: Duration,

    /// Emit the report as a JSON document instead of text output
    #[clap(short = 'J', long)]
    pub json: bool,

    /// Verbose output
    #[clap(short = 'v', long)]
    pub verbose: bool,

    /// Socket buffer size for the data streams (e.g. "4M")
    #[clap(short = 'w', long, value_parser = parse_size)]
    pub window: Option<u64>,

    /// Set TCP_NODELAY on the data streams
    #[clap(short = 'N', long)]
    pub no_delay: bool,

    /// Pin the driver thread to a CPU core
    #[clap(short = 'A', long)]
    pub affinity: Option<usize>,

    /// Write the final report (JSON) to this file as well
    #[clap(short = 'o', long)]
    pub output_file: Option<PathBuf>,

    /// Send log output to this file instead of the console
    #[clap(long)]
    pub log_file: Option<PathBuf>,
}

/// Validated internal configuration driving a single test run.
///
/// Converted from [`Args`] for the binary, or built directly by library
/// callers and tests.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestConfig {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    /// Wall-clock limit; `None` when a byte or block limit is authoritative.
    pub duration: Option<Duration>,
    pub bytes: Option<u64>,
    pub blocks: Option<u64>,
    pub parallel: usize,
    pub block_size: usize,
    pub reverse: bool,
    pub omit: Option<Duration>,
    /// Periodic-report period; `None` disables interval reporting.
    pub interval: Option<Duration>,
    /// Structured (JSON) output instead of line-oriented text.
    pub structured: bool,
    pub verbose: bool,
    /// Socket buffer size applied to data streams when set.
    pub window: Option<usize>,
    pub no_delay: bool,
    pub affinity: Option<usize>,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: crate::defaults::PORT,
            protocol: Protocol::Tcp,
            duration: Some(crate::defaults::DURATION),
            bytes: None,
            blocks: None,
            parallel: crate::defaults::PARALLEL,
            block_size: crate::defaults::TCP_BLOCK_SIZE,
            reverse: false,
            omit: None,
            interval: Some(crate::defaults::INTERVAL),
            structured: false,
            verbose: false,
            window: None,
            no_delay: false,
            affinity: None,
        }
    }
}

impl TestConfig {
    /// Create a validated test configuration from CLI arguments.
    ///
    /// Applies protocol-dependent defaults and enforces that at most one
    /// stopping limit is authoritative: a byte or block limit disables the
    /// duration limit, matching the stopping-condition semantics.
    pub fn from_args(args: &Args) -> anyhow::Result<Self> {
        if args.parallel == 0 {
            anyhow::bail!("--parallel must be at least 1");
        }
        if args.bytes.is_some() && args.blocks.is_some() {
            anyhow::bail!("--bytes and --blocks are mutually exclusive");
        }

        let protocol = if args.udp { Protocol::Udp } else { Protocol::Tcp };

        let block_size = match args.block_size {
            Some(0) => anyhow::bail!("--block-size must be non-zero"),
            Some(size) => size as usize,
            None => match protocol {
                Protocol::Tcp => crate::defaults::TCP_BLOCK_SIZE,
                Protocol::Udp => crate::defaults::UDP_BLOCK_SIZE,
            },
        };

        // Duration is the fallback limit; an explicit byte or block count
        // takes precedence over it.
        let duration = if args.bytes.is_some() || args.blocks.is_some() {
            None
        } else {
            Some(args.time.unwrap_or(crate::defaults::DURATION))
        };

        let interval = if args.interval.is_zero() {
            None
        } else {
            Some(args.interval)
        };

        Ok(Self {
            host: args.host.clone(),
            port: args.port,
            protocol,
            duration,
            bytes: args.bytes.filter(|b| *b > 0),
            blocks: args.blocks.filter(|b| *b > 0),
            parallel: args.parallel,
            block_size,
            reverse: args.reverse,
            omit: args.omit.filter(|o| !o.is_zero()),
            interval,
            structured: args.json,
            verbose: args.verbose,
            window: args.window.map(|w| w as usize),
            no_delay: args.no_delay,
            affinity: args.affinity,
        })
    }
}

/// Parse duration from string (e.g. "10s", "5m", "500ms")
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s") // Default to seconds
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    if !num.is_finite() || num < 0.0 {
        return Err(format!("Duration must be non-negative: {}", s));
    }

    let duration = match unit {
        "ms" => Duration::from_millis(num as u64),
        "s" => Duration::from_secs_f64(num),
        "m" => Duration::from_secs((num * 60.0) as u64),
        "h" => Duration::from_secs((num * 3600.0) as u64),
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Ok(duration)
}

/// Parse a byte count from string with K/M/G/T suffixes (e.g. "128K", "1G")
fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Size cannot be empty".to_string());
    }

    let (num_str, multiplier) = match s.chars().last() {
        Some('K') | Some('k') => (&s[..s.len() - 1], 1024u64),
        Some('M') | Some('m') => (&s[..s.len() - 1], 1024 * 1024),
        Some('G') | Some('g') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        Some('T') | Some('t') => (&s[..s.len() - 1], 1024u64.pow(4)),
        _ => (s, 1),
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in size: {}", num_str))?;

    num.checked_mul(multiplier)
        .ok_or_else(|| format!("Size overflows: {}", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("0.5s").unwrap(), Duration::from_millis(500));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("invalid").is_err());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1000").unwrap(), 1000);
        assert_eq!(parse_size("128K").unwrap(), 128 * 1024);
        assert_eq!(parse_size("1M").unwrap(), 1024 * 1024);
        assert_eq!(parse_size("2g").unwrap(), 2 * 1024 * 1024 * 1024);

        assert!(parse_size("").is_err());
        assert!(parse_size("12Q").is_err());
    }

    fn base_args() -> Args {
        Args {
            host: "127.0.0.1".to_string(),
            port: crate::defaults::PORT,
            time: None,
            bytes: None,
            blocks: None,
            parallel: 1,
            block_size: None,
            reverse: false,
            udp: false,
            omit: None,
            interval: Duration::from_secs(1),
            json: false,
            verbose: false,
            window: None,
            no_delay: false,
            affinity: None,
            output_file: None,
            log_file: None,
        }
    }

    #[test]
    fn test_duration_is_default_limit() {
        let config = TestConfig::from_args(&base_args()).unwrap();
        assert_eq!(config.duration, Some(crate::defaults::DURATION));
        assert!(config.bytes.is_none());
        assert!(config.blocks.is_none());
    }

    #[test]
    fn test_byte_limit_disables_duration() {
        let args = Args {
            bytes: Some(1_000_000),
            time: Some(Duration::from_secs(30)),
            ..base_args()
        };
        let config = TestConfig::from_args(&args).unwrap();
        assert!(config.duration.is_none());
        assert_eq!(config.bytes, Some(1_000_000));
    }

    #[test]
    fn test_udp_block_size_default() {
        let args = Args {
            udp: true,
            ..base_args()
        };
        let config = TestConfig::from_args(&args).unwrap();
        assert_eq!(config.protocol, Protocol::Udp);
        assert_eq!(config.block_size, crate::defaults::UDP_BLOCK_SIZE);
    }

    #[test]
    fn test_rejects_conflicting_limits() {
        let args = Args {
            bytes: Some(1),
            blocks: Some(1),
            ..base_args()
        };
        assert!(TestConfig::from_args(&args).is_err());
    }

    #[test]
    fn test_rejects_zero_parallel() {
        let args = Args {
            parallel: 0,
            ..base_args()
        };
        assert!(TestConfig::from_args(&args).is_err());
    }

    #[test]
    fn test_zero_interval_disables_reports() {
        let args = Args {
            interval: Duration::ZERO,
            ..base_args()
        };
        let config = TestConfig::from_args(&args).unwrap();
        assert!(config.interval.is_none());
    }
}
