//! Utility functions for fleetkv

use std::time::{SystemTime, UNIX_EPOCH};

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Calculate CRC32 checksum
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Validate a key (must be non-empty, reasonable length, no NUL)
pub fn validate_key(key: &str) -> crate::Result<()> {
    if key.is_empty() {
        return Err(crate::Error::InvalidArgument("key cannot be empty".into()));
    }

    if key.len() > 1024 {
        return Err(crate::Error::InvalidArgument(
            "key too long (max 1024 bytes)".into(),
        ));
    }

    // NUL separates bucket and key in tombstone records
    if key.contains('\0') {
        return Err(crate::Error::InvalidArgument(
            "key contains invalid characters".into(),
        ));
    }

    Ok(())
}

/// Validate a bucket name
pub fn validate_bucket(bucket: &str) -> crate::Result<()> {
    if bucket.is_empty() {
        return Err(crate::Error::InvalidArgument(
            "bucket name cannot be empty".into(),
        ));
    }

    if bucket.len() > 255 || bucket.chars().any(|c| c.is_control()) {
        return Err(crate::Error::InvalidArgument(format!(
            "invalid bucket name: {:?}",
            bucket
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1023), "1023.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("10.0.0.0/24").is_ok());
        assert!(validate_key("path/to/key").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("a\0b").is_err());
        assert!(validate_key(&"x".repeat(2000)).is_err());
    }

    #[test]
    fn test_validate_bucket() {
        assert!(validate_bucket("routes").is_ok());
        assert!(validate_bucket("").is_err());
        assert!(validate_bucket("bad\nname").is_err());
    }

    #[test]
    fn test_timestamp_is_monotonic_enough() {
        let a = timestamp_now_millis();
        let b = timestamp_now_millis();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000);
    }
}
