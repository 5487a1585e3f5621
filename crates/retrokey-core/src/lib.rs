use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::Date;

mod assign;
mod dates;
mod orchestrator;
mod schema;
mod verify;

pub use assign::{
    assign, normalize_grouping_key, Assignment, AssignmentWarning, DATED_BAND_END,
    DATED_BAND_START, UNDATED_BAND_START,
};
pub use dates::{format_date8, parse_run_date};
pub use orchestrator::{
    preview, run, FinalSchema, RunFailure, RunPlan, RunReport, RunState, TableStore,
};
pub use schema::{ColumnInfo, ForeignKeyInfo, IndexInfo, SchemaSnapshot};
pub use verify::{is_well_formed, verify, VerificationFailure, VerificationSummary};

pub const DEFAULT_PREFIX: &str = "KZ";
pub const DEFAULT_ID_COLUMN: &str = "Id";

/// Width of the `date8` + `sequence3` tail of every identifier.
const IDENTIFIER_TAIL_LEN: usize = 11;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ConfigError {
    #[error("invalid identifier prefix {0:?}: expected exactly 2 ASCII letters or digits")]
    InvalidPrefix(String),
    #[error("invalid column name {0:?}")]
    InvalidColumnName(String),
    #[error("invalid declared column type {0:?}")]
    InvalidColumnType(String),
    #[error("invalid run date {0:?}: expected YYYY-MM-DD")]
    InvalidRunDate(String),
}

/// Failures that end a run. Each variant is phase-scoped by the orchestrator.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EngineError {
    #[error("cannot read schema of table {table}: {reason}")]
    SchemaRead { table: String, reason: String },
    #[error("identifier verification failed: {0}")]
    Verification(#[from] VerificationFailure),
    #[error("rebuild of table {table} failed during {step}: {reason}")]
    Rebuild { table: String, step: String, reason: String },
    #[error("storage error on table {table}: {reason}")]
    Store { table: String, reason: String },
}

impl EngineError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SchemaRead { .. } => "schema_read",
            Self::Verification(_) => "verification",
            Self::Rebuild { .. } => "rebuild",
            Self::Store { .. } => "store",
        }
    }
}

/// Stable row-position token. The SQLite binding uses `rowid`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RowToken(pub i64);

impl Display for RowToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Raw grouping-key cell as stored, before date normalisation.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum GroupingValue {
    Null,
    Text(String),
    Integer(i64),
    Unsupported(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecordRow {
    pub token: RowToken,
    pub grouping_key: GroupingValue,
    pub name: String,
    pub country: String,
}

/// A row whose grouping data could not be interpreted. The row is skipped and counted.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, Eq, PartialEq)]
#[error("row {token}: {reason}")]
pub struct RowAssignmentError {
    pub token: RowToken,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct Prefix(String);

impl Prefix {
    /// # Errors
    /// Returns [`ConfigError::InvalidPrefix`] unless `value` is two ASCII alphanumerics.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        if value.len() == 2 && value.bytes().all(|byte| byte.is_ascii_alphanumeric()) {
            Ok(Self(value.to_string()))
        } else {
            Err(ConfigError::InvalidPrefix(value.to_string()))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fixed length of every identifier built with this prefix.
    #[must_use]
    pub fn identifier_len(&self) -> usize {
        self.0.len() + IDENTIFIER_TAIL_LEN
    }
}

impl Default for Prefix {
    fn default() -> Self {
        Self(DEFAULT_PREFIX.to_string())
    }
}

impl Display for Prefix {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// `prefix + date8 + sequence3`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    /// Sequences above 999 wrap to three digits; the Verifier catches any collision.
    #[must_use]
    pub fn compose(prefix: &Prefix, date: Date, sequence: u32) -> Self {
        Self(format!("{prefix}{}{:03}", format_date8(date), sequence % 1000))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Identifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name and declared SQL type of the identifier column.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ColumnSpec {
    name: String,
    declared_type: String,
}

impl ColumnSpec {
    /// # Errors
    /// Returns a [`ConfigError`] when the name is empty or contains NUL, or the type
    /// does not match `WORD[ WORD]*[(n[, m])]`.
    pub fn new(name: &str, declared_type: &str) -> Result<Self, ConfigError> {
        validate_column_name(name)?;
        if !is_safe_declared_type(declared_type) {
            return Err(ConfigError::InvalidColumnType(declared_type.to_string()));
        }
        Ok(Self { name: name.to_string(), declared_type: declared_type.trim().to_string() })
    }

    /// `CHAR(n)` sized to the identifier length of `prefix`.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] when `name` is not a usable column name.
    pub fn fixed_text(name: &str, prefix: &Prefix) -> Result<Self, ConfigError> {
        Self::new(name, &format!("CHAR({})", prefix.identifier_len()))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn declared_type(&self) -> &str {
        &self.declared_type
    }
}

/// The three record columns the assigner reads.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecordColumns {
    pub grouping_key: String,
    pub name: String,
    pub country: String,
}

impl RecordColumns {
    /// # Errors
    /// Returns [`ConfigError::InvalidColumnName`] for an empty or NUL-bearing name.
    pub fn new(grouping_key: &str, name: &str, country: &str) -> Result<Self, ConfigError> {
        for column in [grouping_key, name, country] {
            validate_column_name(column)?;
        }
        Ok(Self {
            grouping_key: grouping_key.to_string(),
            name: name.to_string(),
            country: country.to_string(),
        })
    }

    #[must_use]
    pub fn all(&self) -> [&str; 3] {
        [&self.grouping_key, &self.name, &self.country]
    }
}

fn validate_column_name(name: &str) -> Result<(), ConfigError> {
    if name.trim().is_empty() || name.contains('\0') {
        return Err(ConfigError::InvalidColumnName(name.to_string()));
    }
    Ok(())
}

fn is_safe_declared_type(value: &str) -> bool {
    let value = value.trim();
    let (words, size) = match value.find('(') {
        Some(open) => (&value[..open], Some(&value[open..])),
        None => (value, None),
    };

    let mut words = words.split_whitespace().peekable();
    if words.peek().is_none() {
        return false;
    }
    let words_ok = words.all(|word| {
        word.starts_with(|ch: char| ch.is_ascii_alphabetic())
            && word.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
    });

    let size_ok = size.map_or(true, |size| {
        let Some(inner) = size.strip_prefix('(').and_then(|rest| rest.strip_suffix(')')) else {
            return false;
        };
        let parts = inner.split(',').map(str::trim).collect::<Vec<_>>();
        parts.len() <= 2
            && parts.iter().all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
    });

    words_ok && size_ok
}
