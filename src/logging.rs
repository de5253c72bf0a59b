//! Structured logging setup and id formatting helpers.
//!
//! [`init`] installs a `tracing` subscriber whose lines look like:
//!
//! ```text
//! 20260211T21:33:12.000  INFO src/scanner.rs:42: scan: finished groups=3 events=1
//! ```
//!
//! When stderr is a terminal, output is colour-coded and member/group ids get
//! a consistent colour derived from their value, so the same member is easy
//! to follow across lines. The filter defaults to `namewatch=info` and can be
//! overridden with `RUST_LOG`.

use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::EnvFilter;

use crate::profile::{GroupId, MemberId};

const DEFAULT_FILTER: &str = "namewatch=info";

static COLOUR_ENABLED: AtomicBool = AtomicBool::new(false);

/// Initialize the logging system. Call once at startup; later calls are
/// ignored.
pub fn init() {
    let is_terminal = std::io::stderr().is_terminal();
    COLOUR_ENABLED.store(is_terminal, Ordering::Relaxed);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(CompactTime)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(is_terminal)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Returns whether ANSI colour output is enabled.
pub fn colour_enabled() -> bool {
    COLOUR_ENABLED.load(Ordering::Relaxed)
}

// ANSI escape codes
const RESET: &str = "\x1b[0m";

/// Colour palette for ID hashing — bright, visually distinct colours.
const ID_COLOURS: &[&str] = &[
    "\x1b[91m", // bright red
    "\x1b[92m", // bright green
    "\x1b[93m", // bright yellow
    "\x1b[94m", // bright blue
    "\x1b[95m", // bright magenta
    "\x1b[96m", // bright cyan
    "\x1b[31m", // red
    "\x1b[32m", // green
    "\x1b[33m", // yellow
    "\x1b[34m", // blue
    "\x1b[35m", // magenta
    "\x1b[36m", // cyan
];

/// Pick a deterministic colour for the given id.
fn hash_colour(id: i64) -> &'static str {
    let hash: u32 = id
        .to_le_bytes()
        .iter()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(*b as u32));
    ID_COLOURS[(hash as usize) % ID_COLOURS.len()]
}

fn tagged(prefix: &str, id: i64) -> String {
    if colour_enabled() {
        let colour = hash_colour(id);
        format!("{colour}{prefix}{id}{RESET}")
    } else {
        format!("{prefix}{id}")
    }
}

/// Format a member id, e.g. `u-12345`.
pub fn member(id: MemberId) -> String {
    tagged("u-", id)
}

/// Format a group id, e.g. `g--100123`.
pub fn group(id: GroupId) -> String {
    tagged("g-", id)
}

/// Timer producing the compact `YYYYMMDDTHH:MM:SS.mmm` timestamp.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactTime;

impl FormatTime for CompactTime {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let millis = SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        write!(w, "{}", format_timestamp_millis(millis))
    }
}

/// Format unix seconds as `YYYYMMDDTHH:MM:SS` (UTC).
pub fn format_timestamp(secs: u64) -> String {
    let (date, time) = civil(secs);
    format!("{date}T{time}")
}

/// Format unix milliseconds as `YYYYMMDDTHH:MM:SS.mmm` (UTC).
pub fn format_timestamp_millis(millis: u64) -> String {
    let (date, time) = civil(millis / 1000);
    format!("{date}T{time}.{:03}", millis % 1000)
}

fn civil(secs: u64) -> (String, String) {
    let time_secs = secs % 86400;
    let hours = time_secs / 3600;
    let minutes = (time_secs % 3600) / 60;
    let seconds = time_secs % 60;

    // Civil date from days since epoch (Howard Hinnant's algorithm).
    let days = (secs / 86400) as i64;
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };

    (
        format!("{:04}{:02}{:02}", y, m, d),
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds),
    )
}
