use crate::error::Error;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::str::FromStr;

/// Formats accepted for report dates, in priority order. `%Y/%d/%m` overlaps
/// with `%Y/%m/%d` whenever the day is 12 or lower and only wins when the
/// month-first reading is impossible.
const DATE_FORMATS: [&str; 4] = ["%Y/%m/%d", "%Y-%m-%d", "%Y.%m.%d", "%Y/%d/%m"];

/// Parses a report date cell.
///
/// # Returns
/// The calendar date of the first matching format, or [`Error::InvalidDate`].
pub fn parse_date(raw: &str) -> Result<NaiveDate, Error> {
    let trimmed = raw.trim();

    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(trimmed, format).ok())
        .ok_or_else(|| Error::InvalidDate {
            date: raw.to_string(),
        })
}

/// Parses a money cell such as `"PLN1 234.50"` or `"€100.001"`.
///
/// Everything except ASCII digits and the decimal point is dropped, which
/// removes currency symbols and thousands separators. Negative amounts are
/// rejected instead of having their sign stripped.
pub fn parse_currency(raw: &str) -> Result<Decimal, Error> {
    let invalid = || Error::InvalidAmount {
        value: raw.to_string(),
    };

    if raw.contains('-') {
        return Err(invalid());
    }

    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();

    if !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }

    Decimal::from_str(&cleaned).map_err(|_| invalid())
}

pub fn parse_count(raw: &str) -> Result<i64, Error> {
    raw.trim().parse::<i64>().map_err(|_| Error::InvalidCount {
        value: raw.to_string(),
    })
}
