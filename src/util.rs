/// Render a human-friendly byte count.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = KIB * 1024.0;

    let value = bytes as f64;
    if value < KIB {
        format!("{bytes} B")
    } else if value < MIB {
        format!("{:.1} KB", value / KIB)
    } else {
        format!("{:.1} MB", value / MIB)
    }
}

/// Compute upload progress as a whole percentage in `0..=100`.
///
/// Returns `None` when the total is unknown so callers leave their state alone.
#[must_use]
pub fn progress_percent(sent: u64, total: Option<u64>) -> Option<u8> {
    match total {
        Some(total) if total > 0 => {
            let pct = ((sent as f64 / total as f64) * 100.0).round();
            Some(pct.clamp(0.0, 100.0) as u8)
        }
        _ => None,
    }
}
