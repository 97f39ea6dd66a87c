//! Shared utility functions.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Human-readable time left until `expires_at`, or `"expired"`.
///
/// Rounded down to whole minutes (e.g., "1h 30m").
pub fn format_remaining(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    match (expires_at - now).to_std() {
        Ok(left) if left.as_secs() >= 60 => {
            let minutes = Duration::from_secs(left.as_secs() / 60 * 60);
            humantime::format_duration(minutes).to_string()
        }
        Ok(left) if !left.is_zero() => "<1m".to_string(),
        _ => "expired".to_string(),
    }
}

/// Truncate a string to max length, adding "..." if needed.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Name of the runtime unit backing a VM.
pub fn unit_name(lab_id: u64, vm_id: u64, vm_name: &str) -> String {
    let safe: String = vm_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    format!("lab-{}-vm-{}-{}", lab_id, vm_id, safe)
}
