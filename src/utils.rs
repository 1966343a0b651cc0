use chrono::{Datelike, NaiveDate};

pub const NOT_AVAILABLE: &str = "N/A";

/// Year of a catalog `YYYY-MM-DD` date; `None` for empty or malformed dates.
pub fn release_year(date: &str) -> Option<i32> {
    NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d")
        .ok()
        .map(|d| d.year())
}

pub fn rating_label(vote_average: f32) -> String {
    format!("⭐ {:.1}", vote_average.clamp(0.0, 10.0))
}

pub fn format_runtime(minutes: u32) -> String {
    format!("{}h {}m", minutes / 60, minutes % 60)
}

/// Whole US dollars with thousands separators, or N/A when unknown (zero).
pub fn format_usd(amount: u64) -> String {
    if amount == 0 {
        return NOT_AVAILABLE.to_string();
    }
    let digits = amount.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    out.push('$');
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

pub fn format_distance_km(km: f64) -> String {
    if !km.is_finite() || km < 0.0 {
        return "Unknown".to_string();
    }
    format!("{km:.1} km")
}
