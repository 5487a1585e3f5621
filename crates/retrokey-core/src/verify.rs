use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::dates::parse_compact;
use crate::{Prefix, RowToken};

#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VerificationFailure {
    #[error("{missing} row(s) have no identifier (first: row {token})")]
    Missing { token: RowToken, missing: usize },
    #[error(
        "identifier {identifier} is shared by {occurrences} rows \
         ({duplicated_identifiers} duplicated identifier(s) in total)"
    )]
    Duplicate { identifier: String, occurrences: usize, duplicated_identifiers: usize },
    #[error("row {token} has malformed identifier {identifier:?} ({malformed} malformed in total)")]
    Malformed { token: RowToken, identifier: String, malformed: usize },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct VerificationSummary {
    pub rows: usize,
    pub distinct: usize,
}

/// Check the populated identifier column: no missing values, no duplicates, fixed format.
/// The checks run in that order and the first failing one is reported.
///
/// # Errors
/// Returns the first [`VerificationFailure`] found.
pub fn verify(
    prefix: &Prefix,
    column: &[(RowToken, Option<String>)],
) -> Result<VerificationSummary, VerificationFailure> {
    let missing = column
        .iter()
        .filter(|(_, value)| value.as_deref().map_or(true, |value| value.trim().is_empty()))
        .map(|(token, _)| *token)
        .collect::<Vec<_>>();
    if let Some(token) = missing.first() {
        return Err(VerificationFailure::Missing { token: *token, missing: missing.len() });
    }

    let mut occurrences: BTreeMap<&str, usize> = BTreeMap::new();
    for value in column.iter().filter_map(|(_, value)| value.as_deref()) {
        *occurrences.entry(value).or_insert(0) += 1;
    }
    let duplicated = occurrences.iter().filter(|(_, count)| **count > 1).collect::<Vec<_>>();
    if let Some((identifier, count)) = duplicated.first() {
        return Err(VerificationFailure::Duplicate {
            identifier: (*identifier).to_string(),
            occurrences: **count,
            duplicated_identifiers: duplicated.len(),
        });
    }

    let malformed = column
        .iter()
        .filter_map(|(token, value)| value.as_deref().map(|value| (token, value)))
        .filter(|(_, value)| !is_well_formed(prefix, value))
        .collect::<Vec<_>>();
    if let Some((token, identifier)) = malformed.first() {
        return Err(VerificationFailure::Malformed {
            token: **token,
            identifier: (*identifier).to_string(),
            malformed: malformed.len(),
        });
    }

    Ok(VerificationSummary { rows: column.len(), distinct: occurrences.len() })
}

/// `prefix` + a real `YYYYMMDD` date + three digits, nothing else.
#[must_use]
pub fn is_well_formed(prefix: &Prefix, value: &str) -> bool {
    if value.len() != prefix.identifier_len() {
        return false;
    }
    let Some(tail) = value.strip_prefix(prefix.as_str()) else {
        return false;
    };
    if !tail.bytes().all(|byte| byte.is_ascii_digit()) {
        return false;
    }
    parse_compact(&tail[..8]).is_ok()
}
