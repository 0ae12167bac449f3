use humansize::{format_size as humansize_format, BINARY};
use std::time::Duration;

/// Human readable byte count, e.g. `1.50 MiB`
pub fn format_size(bytes: u64) -> String {
    humansize_format(bytes, BINARY)
}

/// Elapsed time truncated to milliseconds, e.g. `1s 250ms`
pub fn format_duration(elapsed: Duration) -> String {
    let truncated = Duration::from_millis(elapsed.as_millis() as u64);
    humantime::format_duration(truncated).to_string()
}

/// Percentage of `part` in `whole`, 0 when `whole` is 0
pub fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 / whole as f64 * 100.0
}
