use chrono::NaiveDate;

/// Try each of the bank's accepted date formats in order.
pub fn parse_date(raw: &str, formats: &[&str]) -> Option<NaiveDate> {
    let raw = raw.trim();
    formats
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(raw, format).ok())
}
