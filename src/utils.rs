//! # Formatting Utilities
//!
//! Human-readable formatters used by the text reporter. All byte quantities
//! display in binary units and all rates in decimal bits per second, which
//! is the convention throughput tools report in.

use std::time::Duration;

/// Format a byte count for display (e.g. "1.25 MBytes").
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["Bytes", "KBytes", "MBytes", "GBytes", "TBytes"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

/// Format a bit rate for display (e.g. "941.32 Mbits/sec").
pub fn format_bitrate(bits_per_second: f64) -> String {
    const UNITS: [&str; 5] = ["bits/sec", "Kbits/sec", "Mbits/sec", "Gbits/sec", "Tbits/sec"];

    let mut value = bits_per_second.max(0.0);
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }

    format!("{:.2} {}", value, UNITS[unit])
}

/// Format a duration as seconds with two decimals (e.g. "10.00 sec").
pub fn format_seconds(duration: Duration) -> String {
    format!("{:.2} sec", duration.as_secs_f64())
}
