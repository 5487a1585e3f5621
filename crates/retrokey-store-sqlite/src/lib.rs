use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, DatabaseName, OpenFlags};

use retrokey_core::{
    ColumnSpec, EngineError, GroupingValue, Identifier, RecordColumns, RecordRow, RowToken,
    SchemaSnapshot, TableStore,
};

mod evolve;
mod inspect;
mod sql;

pub use evolve::StepError;
pub use inspect::inspect_table;
pub use sql::quote_ident;

pub struct SqliteTableStore {
    conn: Connection,
}

impl SqliteTableStore {
    /// Open an existing database file and configure the pragmas the engine relies on.
    /// A missing file is an error; nothing is created.
    ///
    /// # Errors
    /// Returns an error when the file does not exist, cannot be opened, or pragmas cannot be
    /// applied.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(anyhow!("sqlite database {} does not exist", path.display()));
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        Self::from_connection(conn)
    }

    /// Wrap a caller-owned connection.
    ///
    /// # Errors
    /// Returns an error when pragmas cannot be applied.
    pub fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;
        Ok(Self { conn })
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Online backup of the main database to `out_file`.
    ///
    /// # Errors
    /// Returns an error when parent directories cannot be created or the backup fails.
    pub fn backup_to(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))?;
        tracing::info!("backup written to {}", out_file.display());
        Ok(())
    }

    fn query_rows(&self, table: &str, columns: &RecordColumns) -> Result<Vec<RecordRow>> {
        let sql = format!(
            "SELECT rowid, {}, {}, {} FROM {} ORDER BY rowid",
            quote_ident(&columns.grouping_key)?,
            quote_ident(&columns.name)?,
            quote_ident(&columns.country)?,
            quote_ident(table)?
        );
        tracing::debug!("{sql}");
        let mut stmt = self
            .conn
            .prepare(&sql)
            .with_context(|| format!("failed to prepare row query on {table}"))?;
        let rows = stmt.query_map([], |row| {
            Ok(RecordRow {
                token: RowToken(row.get(0)?),
                grouping_key: grouping_value(row.get_ref(1)?),
                name: text_value(row.get_ref(2)?),
                country: text_value(row.get_ref(3)?),
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.with_context(|| format!("failed to read row of {table}"))?);
        }
        Ok(records)
    }

    fn update_identifiers(
        &mut self,
        table: &str,
        column: &str,
        identifiers: &BTreeMap<RowToken, Identifier>,
    ) -> Result<usize> {
        let sql = format!(
            "UPDATE {} SET {} = ?1 WHERE rowid = ?2",
            quote_ident(table)?,
            quote_ident(column)?
        );
        let sp = self.conn.savepoint().context("failed to open identifier savepoint")?;
        {
            let mut stmt =
                sp.prepare(&sql).with_context(|| format!("failed to prepare update on {table}"))?;
            for (token, identifier) in identifiers {
                let changed = stmt
                    .execute(params![identifier.as_str(), token.0])
                    .with_context(|| format!("failed to write {identifier} to row {token}"))?;
                if changed != 1 {
                    return Err(anyhow!(
                        "writing {identifier} touched {changed} rows instead of row {token}"
                    ));
                }
            }
        }
        sp.commit().context("failed to release identifier savepoint")?;
        tracing::info!("table {table}: wrote {} identifiers into {column}", identifiers.len());
        Ok(identifiers.len())
    }

    fn query_identifier_column(
        &self,
        table: &str,
        column: &str,
    ) -> Result<Vec<(RowToken, Option<String>)>> {
        let sql = format!(
            "SELECT rowid, {} FROM {} ORDER BY rowid",
            quote_ident(column)?,
            quote_ident(table)?
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .with_context(|| format!("failed to prepare read of {column}"))?;
        let values = stmt
            .query_map([], |row| {
                let value = match row.get_ref(1)? {
                    ValueRef::Null => None,
                    other => Some(text_value(other)),
                };
                Ok((RowToken(row.get(0)?), value))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("failed to read {column} of {table}"))?;
        Ok(values)
    }
}

fn grouping_value(value: ValueRef<'_>) -> GroupingValue {
    match value {
        ValueRef::Null => GroupingValue::Null,
        ValueRef::Integer(raw) => GroupingValue::Integer(raw),
        ValueRef::Text(bytes) => GroupingValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Real(_) => GroupingValue::Unsupported("real".to_string()),
        ValueRef::Blob(_) => GroupingValue::Unsupported("blob".to_string()),
    }
}

fn text_value(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(raw) => raw.to_string(),
        ValueRef::Real(raw) => raw.to_string(),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

fn store_error(table: &str, err: &anyhow::Error) -> EngineError {
    EngineError::Store { table: table.to_string(), reason: format!("{err:#}") }
}

fn rebuild_error(table: &str, err: &StepError) -> EngineError {
    EngineError::Rebuild {
        table: table.to_string(),
        step: err.step.to_string(),
        reason: format!("{:#}", err.source),
    }
}

impl TableStore for SqliteTableStore {
    fn inspect(&self, table: &str) -> Result<SchemaSnapshot, EngineError> {
        inspect_table(&self.conn, table).map_err(|err| EngineError::SchemaRead {
            table: table.to_string(),
            reason: format!("{err:#}"),
        })
    }

    fn drop_column_if_present(&mut self, table: &str, column: &str) -> Result<bool, EngineError> {
        evolve::drop_column_if_present(&mut self.conn, table, column)
            .map_err(|err| rebuild_error(table, &err))
    }

    fn add_column(&mut self, table: &str, column: &ColumnSpec) -> Result<(), EngineError> {
        evolve::add_column(&self.conn, table, column).map_err(|err| EngineError::Store {
            table: table.to_string(),
            reason: err.to_string(),
        })
    }

    fn load_rows(
        &self,
        table: &str,
        columns: &RecordColumns,
    ) -> Result<Vec<RecordRow>, EngineError> {
        self.query_rows(table, columns).map_err(|err| store_error(table, &err))
    }

    fn write_identifiers(
        &mut self,
        table: &str,
        column: &str,
        identifiers: &BTreeMap<RowToken, Identifier>,
    ) -> Result<usize, EngineError> {
        self.update_identifiers(table, column, identifiers).map_err(|err| store_error(table, &err))
    }

    fn read_identifier_column(
        &self,
        table: &str,
        column: &str,
    ) -> Result<Vec<(RowToken, Option<String>)>, EngineError> {
        self.query_identifier_column(table, column).map_err(|err| store_error(table, &err))
    }

    fn reorder_and_promote(&mut self, table: &str, column: &str) -> Result<(), EngineError> {
        evolve::reorder_and_promote(&mut self.conn, table, column)
            .map_err(|err| rebuild_error(table, &err))
    }

    fn begin_phase(&mut self) -> Result<(), EngineError> {
        if !self.conn.is_autocommit() {
            return Err(EngineError::Store {
                table: String::new(),
                reason: "a transaction is already open".to_string(),
            });
        }
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .context("failed to start phase transaction")
            .map_err(|err| store_error("", &err))
    }

    fn commit_phase(&mut self) -> Result<(), EngineError> {
        self.conn
            .execute_batch("COMMIT")
            .context("failed to commit phase transaction")
            .map_err(|err| store_error("", &err))
    }

    fn rollback_phase(&mut self) -> Result<(), EngineError> {
        self.conn
            .execute_batch("ROLLBACK")
            .context("failed to roll back phase transaction")
            .map_err(|err| store_error("", &err))
    }
}
