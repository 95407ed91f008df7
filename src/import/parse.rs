//! Field normalizers for imported spreadsheets.
//!
//! Historical exports arrive in whatever shape the original sheet used:
//! mixed date formats, `$1,234.56` currency, `#DIV/0!` where a formula
//! blew up. Everything funnels through here before touching an entity.

use chrono::{Datelike, NaiveDate};

/// Values that mean "no value" in spreadsheet exports.
const NULL_SENTINELS: &[&str] = &["#DIV/0!", "N/A", "n/a", "-", ""];

/// Parse a date in any of the accepted shapes: `YYYY-MM-DD`, `MM/DD/YYYY`,
/// `MM/DD/YY` (years > 50 land in 19xx), and `MM/DD` with a caller-supplied
/// default year.
pub fn parse_date(raw: &str, default_year: Option<i32>) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(d);
    }

    let parts: Vec<&str> = raw.split('/').collect();
    match parts.as_slice() {
        [m, d, y] => {
            let month: u32 = m.trim().parse().ok()?;
            let day: u32 = d.trim().parse().ok()?;
            let year_raw: i32 = y.trim().parse().ok()?;
            let year = if y.trim().len() <= 2 {
                if year_raw > 50 {
                    1900 + year_raw
                } else {
                    2000 + year_raw
                }
            } else {
                year_raw
            };
            NaiveDate::from_ymd_opt(year, month, day)
        }
        [m, d] => {
            let month: u32 = m.trim().parse().ok()?;
            let day: u32 = d.trim().parse().ok()?;
            NaiveDate::from_ymd_opt(default_year?, month, day)
        }
        _ => None,
    }
}

/// Parse a currency cell: strips `$` and `,`; spreadsheet error/empty
/// sentinels become `None`.
pub fn parse_currency(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if NULL_SENTINELS.contains(&raw) {
        return None;
    }
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '$' | ','))
        .collect();
    let cleaned = cleaned.trim();
    // Accounting negatives: (123.45)
    if let Some(inner) = cleaned
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
    {
        return inner.trim().parse::<f64>().ok().map(|v| -v);
    }
    cleaned.parse().ok()
}

/// Parse a percentage cell; `45%` and `45` both yield 45.0.
pub fn parse_percent(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if NULL_SENTINELS.contains(&raw) {
        return None;
    }
    raw.trim_end_matches('%').trim().parse().ok()
}

/// Split an ambassadors cell on the first separator found, in priority
/// order `;`, `,`, `|`, newline.
pub fn split_ambassadors(raw: &str) -> Vec<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Vec::new();
    }
    let separator = [';', ',', '|', '\n']
        .into_iter()
        .find(|sep| raw.contains(*sep));
    let names: Vec<String> = match separator {
        Some(sep) => raw
            .split(sep)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        None => vec![raw.to_string()],
    };
    names
}

/// Scan the first rows for a header: a row matching at least 3 of the
/// expected keywords. Returns (header row index, column-index map keyed by
/// the canonical keyword).
pub fn detect_header(
    rows: &[Vec<String>],
    keywords: &[(&str, &[&str])],
) -> Option<(usize, Vec<(String, usize)>)> {
    for (row_idx, row) in rows.iter().take(10).enumerate() {
        let mut mapping: Vec<(String, usize)> = Vec::new();
        for (canonical, aliases) in keywords {
            let found = row.iter().position(|cell| {
                let cell = cell.trim().to_lowercase();
                aliases.iter().any(|alias| cell == *alias)
            });
            if let Some(col) = found {
                mapping.push((canonical.to_string(), col));
            }
        }
        if mapping.len() >= 3 {
            return Some((row_idx, mapping));
        }
    }
    None
}

/// Normalize a venue name for duplicate comparisons: lowercase, alphanumeric
/// only.
pub fn normalize_venue(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

/// Venue duplicate rule: exact normalized match, or one is a prefix of the
/// other (tolerates "Joe's Bar" vs "Joe's Bar & Grill").
pub fn venues_match(a: &str, b: &str) -> bool {
    let a = normalize_venue(a);
    let b = normalize_venue(b);
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a == b || a.starts_with(&b) || b.starts_with(&a)
}
