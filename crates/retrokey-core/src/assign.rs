use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::Date;

use crate::dates::{format_date8, parse_compact, parse_grouping_text};
use crate::{GroupingValue, Identifier, Prefix, RecordRow, RowAssignmentError, RowToken};

pub const DATED_BAND_START: u32 = 1;
pub const DATED_BAND_END: u32 = 899;
pub const UNDATED_BAND_START: u32 = 900;

/// Rows the undated pool can hold before its sequence passes 999.
const UNDATED_BAND_CAPACITY: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssignmentWarning {
    /// A dated group ran past 899 and into the undated band.
    DatedBandOverflow { date: String, rows: usize },
    /// The undated pool ran past 999 and wrapped.
    UndatedBandWrap { rows: usize },
}

impl Display for AssignmentWarning {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DatedBandOverflow { date, rows } => write!(
                f,
                "date {date} has {rows} rows; sequences above {DATED_BAND_END} \
                 overlap the undated band"
            ),
            Self::UndatedBandWrap { rows } => write!(
                f,
                "{rows} undated rows; sequences above 999 wrap and may collide"
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assignment {
    pub identifiers: BTreeMap<RowToken, Identifier>,
    pub row_errors: Vec<RowAssignmentError>,
    pub warnings: Vec<AssignmentWarning>,
}

impl Assignment {
    #[must_use]
    pub fn rows_total(&self) -> usize {
        self.identifiers.len() + self.row_errors.len()
    }

    /// Identifier column as it would read back from the table: skipped rows are `None`.
    #[must_use]
    pub fn column_values(&self) -> Vec<(RowToken, Option<String>)> {
        let mut values = self
            .identifiers
            .iter()
            .map(|(token, identifier)| (*token, Some(identifier.as_str().to_string())))
            .chain(self.row_errors.iter().map(|error| (error.token, None)))
            .collect::<Vec<_>>();
        values.sort_by_key(|(token, _)| *token);
        values
    }

    /// SHA-256 over `token\tidentifier\n` in token order.
    #[must_use]
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (token, identifier) in &self.identifiers {
            hasher.update(token.0.to_string().as_bytes());
            hasher.update(b"\t");
            hasher.update(identifier.as_str().as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }

    #[must_use]
    pub fn sample(&self) -> Option<&Identifier> {
        self.identifiers.values().next()
    }
}

/// Normalise a grouping cell to a calendar date. `Ok(None)` means undated.
///
/// # Errors
/// Returns a reason string when the value is present but is not a recognisable date.
pub fn normalize_grouping_key(value: &GroupingValue) -> Result<Option<Date>, String> {
    match value {
        GroupingValue::Null => Ok(None),
        GroupingValue::Text(text) if text.trim().is_empty() => Ok(None),
        GroupingValue::Text(text) => parse_grouping_text(text.trim()).map(Some),
        GroupingValue::Integer(raw) => parse_compact(&raw.to_string()).map(Some),
        GroupingValue::Unsupported(kind) => {
            Err(format!("grouping key has unsupported type {kind}"))
        }
    }
}

/// Compute one identifier per row.
///
/// Dated rows are numbered per date from 001; undated rows share one pool stamped
/// with `today` and numbered from 900. Within a group rows are ordered by
/// `(name, country, token)`, so the output depends only on row content.
#[must_use]
pub fn assign(rows: &[RecordRow], prefix: &Prefix, today: Date) -> Assignment {
    let mut dated: BTreeMap<Date, Vec<&RecordRow>> = BTreeMap::new();
    let mut undated: Vec<&RecordRow> = Vec::new();
    let mut assignment = Assignment::default();

    for row in rows {
        match normalize_grouping_key(&row.grouping_key) {
            Ok(Some(date)) => dated.entry(date).or_default().push(row),
            Ok(None) => undated.push(row),
            Err(reason) => {
                assignment.row_errors.push(RowAssignmentError { token: row.token, reason });
            }
        }
    }

    for (date, mut group) in dated {
        if group.len() > DATED_BAND_END as usize {
            assignment.warnings.push(AssignmentWarning::DatedBandOverflow {
                date: format_date8(date),
                rows: group.len(),
            });
        }
        stamp_group(&mut group, prefix, date, DATED_BAND_START, &mut assignment.identifiers);
    }

    if undated.len() > UNDATED_BAND_CAPACITY {
        assignment.warnings.push(AssignmentWarning::UndatedBandWrap { rows: undated.len() });
    }
    stamp_group(&mut undated, prefix, today, UNDATED_BAND_START, &mut assignment.identifiers);

    assignment.row_errors.sort_by_key(|error| error.token);
    assignment
}

fn stamp_group(
    group: &mut [&RecordRow],
    prefix: &Prefix,
    date: Date,
    start: u32,
    out: &mut BTreeMap<RowToken, Identifier>,
) {
    group.sort_by(|left, right| ordering_key(left).cmp(&ordering_key(right)));
    for (sequence, row) in (start..).zip(group.iter()) {
        out.insert(row.token, Identifier::compose(prefix, date, sequence));
    }
}

fn ordering_key(row: &RecordRow) -> (&str, &str, RowToken) {
    (row.name.as_str(), row.country.as_str(), row.token)
}
