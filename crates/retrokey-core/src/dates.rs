use time::format_description::FormatItem;
use time::macros::format_description;
use time::Date;

use crate::ConfigError;

const DASHED: &[FormatItem<'_>] = format_description!("[year]-[month]-[day]");
const SLASHED: &[FormatItem<'_>] = format_description!("[year]/[month]/[day]");
const COMPACT: &[FormatItem<'_>] = format_description!("[year][month][day]");

/// `YYYYMMDD` rendering used for the `date8` part of identifiers.
#[must_use]
pub fn format_date8(date: Date) -> String {
    // Only fails on I/O errors, which a String sink never raises. An empty result is
    // rejected by the Verifier.
    date.format(COMPACT).unwrap_or_default()
}

/// Parse the operator-supplied run date (`YYYY-MM-DD`).
///
/// # Errors
/// Returns [`ConfigError::InvalidRunDate`] for anything that is not a real calendar date.
pub fn parse_run_date(value: &str) -> Result<Date, ConfigError> {
    parse_with(value.trim(), DASHED).map_err(|_| ConfigError::InvalidRunDate(value.to_string()))
}

/// Accepts `YYYY-MM-DD`, `YYYY/MM/DD` and `YYYYMMDD`, optionally followed by a
/// time of day after `' '` or `'T'` (dashed forms only). The time is discarded.
pub(crate) fn parse_grouping_text(value: &str) -> Result<Date, String> {
    let date_part = match value.as_bytes().get(10) {
        Some(b' ' | b'T') => value.get(..10).ok_or_else(|| unrecognised(value))?,
        Some(_) => return Err(unrecognised(value)),
        None => value,
    };

    let layout = match date_part.len() {
        10 if date_part.as_bytes()[4] == b'/' => SLASHED,
        10 => DASHED,
        8 => COMPACT,
        _ => return Err(unrecognised(value)),
    };
    parse_with(date_part, layout)
}

pub(crate) fn parse_compact(value: &str) -> Result<Date, String> {
    parse_with(value, COMPACT)
}

/// `[year]` also takes a leading sign; dates here are always four plain digits.
fn parse_with(value: &str, layout: &[FormatItem<'_>]) -> Result<Date, String> {
    if !value.bytes().next().is_some_and(|byte| byte.is_ascii_digit()) {
        return Err(unrecognised(value));
    }
    Date::parse(value, layout).map_err(|err| format!("{}: {err}", unrecognised(value)))
}

fn unrecognised(value: &str) -> String {
    format!("unrecognised date {value:?}")
}
