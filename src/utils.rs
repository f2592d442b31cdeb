//! Utility functions

use chrono::Utc;

/// Format byte size in human-readable form
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Recency score for cache index entries: wall-clock microseconds.
pub fn now_score() -> f64 {
    Utc::now().timestamp_micros() as f64
}

/// Integer ceiling division
pub fn div_ceil(value: u64, divisor: u64) -> u64 {
    debug_assert!(divisor > 0);
    (value + divisor - 1) / divisor
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
        assert_eq!(format_bytes(1073741824), "1.00 GB");
    }

    #[test]
    fn test_div_ceil() {
        assert_eq!(div_ceil(0, 16), 0);
        assert_eq!(div_ceil(1, 16), 1);
        assert_eq!(div_ceil(16, 16), 1);
        assert_eq!(div_ceil(17, 16), 2);
    }

    #[test]
    fn test_now_score_monotone_enough() {
        let a = now_score();
        let b = now_score();
        assert!(b >= a);
        assert!(a > 0.0);
    }
}
