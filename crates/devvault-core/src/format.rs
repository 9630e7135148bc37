//! Human-readable formatting helpers

/// Format bytes as human-readable size
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1}G", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1}M", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1}K", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

/// Show only the first few characters of sensitive material
pub fn preview(secret: &str) -> String {
    const SHOWN: usize = 8;

    let head: String = secret.chars().take(SHOWN).collect();
    if secret.chars().count() > SHOWN {
        format!("{}...", head)
    } else {
        "********".to_string()
    }
}
