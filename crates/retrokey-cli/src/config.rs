use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use retrokey_core::{
    parse_run_date, ColumnSpec, Prefix, RecordColumns, RunPlan, DEFAULT_ID_COLUMN,
};
use serde::{Deserialize, Serialize};
use time::Date;

pub const DEFAULT_DATE_COLUMN: &str = "date";
pub const DEFAULT_NAME_COLUMN: &str = "name";
pub const DEFAULT_COUNTRY_COLUMN: &str = "country";

/// Run settings from a YAML file or from flags. Unset fields fall back to defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub table: Option<String>,
    pub id_column: Option<String>,
    pub id_type: Option<String>,
    pub prefix: Option<String>,
    pub date_column: Option<String>,
    pub name_column: Option<String>,
    pub country_column: Option<String>,
    /// Run date for undated rows, `YYYY-MM-DD`.
    pub today: Option<String>,
}

impl RunConfig {
    /// # Errors
    /// Returns an error when the file cannot be read or contains unknown keys.
    pub fn load(path: &Path) -> Result<Self> {
        let body = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&body)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Fields set in `overrides` win.
    #[must_use]
    pub fn overlay(self, overrides: RunConfig) -> Self {
        Self {
            table: overrides.table.or(self.table),
            id_column: overrides.id_column.or(self.id_column),
            id_type: overrides.id_type.or(self.id_type),
            prefix: overrides.prefix.or(self.prefix),
            date_column: overrides.date_column.or(self.date_column),
            name_column: overrides.name_column.or(self.name_column),
            country_column: overrides.country_column.or(self.country_column),
            today: overrides.today.or(self.today),
        }
    }

    /// Build the engine plan and run date. `fallback_today` is used when no date is set.
    ///
    /// # Errors
    /// Returns an error when the table is missing or any value is invalid.
    pub fn resolve(&self, fallback_today: Date) -> Result<(RunPlan, Date)> {
        let table = self
            .table
            .clone()
            .filter(|table| !table.trim().is_empty())
            .ok_or_else(|| anyhow!("no table given: pass --table or set `table` in the config"))?;

        let prefix = match &self.prefix {
            Some(prefix) => Prefix::parse(prefix)?,
            None => Prefix::default(),
        };
        let id_name = self.id_column.as_deref().unwrap_or(DEFAULT_ID_COLUMN);
        let id_column = match &self.id_type {
            Some(declared_type) => ColumnSpec::new(id_name, declared_type)?,
            None => ColumnSpec::fixed_text(id_name, &prefix)?,
        };
        let columns = RecordColumns::new(
            self.date_column.as_deref().unwrap_or(DEFAULT_DATE_COLUMN),
            self.name_column.as_deref().unwrap_or(DEFAULT_NAME_COLUMN),
            self.country_column.as_deref().unwrap_or(DEFAULT_COUNTRY_COLUMN),
        )?;
        let today = match &self.today {
            Some(today) => parse_run_date(today)?,
            None => fallback_today,
        };

        Ok((RunPlan { table, id_column, prefix, columns }, today))
    }
}
