use std::fmt::{Display, Formatter};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection};

use retrokey_core::{ColumnInfo, ColumnSpec, ForeignKeyInfo, IndexInfo, SchemaSnapshot};

use crate::inspect::{inspect_table, referencing_tables};
use crate::sql::{column_definition, foreign_key_clause, pragma_flag, quote_ident, quote_list};

const STAGING_SUFFIX: &str = "__retrokey_rebuild";

/// A failed schema change and the step it failed in.
#[derive(Debug)]
pub struct StepError {
    pub step: &'static str,
    pub source: anyhow::Error,
}

impl Display for StepError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {:#}", self.step, self.source)
    }
}

fn at_step(step: &'static str) -> impl FnOnce(anyhow::Error) -> StepError {
    move |source| StepError { step, source }
}

/// Shape of a rebuilt table, borrowed from the snapshot it was derived from.
struct TableLayout<'a> {
    columns: Vec<&'a ColumnInfo>,
    primary_key: Vec<&'a str>,
    /// Declare the key columns NOT NULL.
    required_key: bool,
    unique: Vec<Vec<&'a str>>,
    foreign_keys: Vec<&'a ForeignKeyInfo>,
    indexes: Vec<&'a IndexInfo>,
    triggers: Vec<&'a str>,
}

impl<'a> TableLayout<'a> {
    /// Everything except `column`. Keys, constraints and indexes naming it are left out.
    fn without_column(snapshot: &'a SchemaSnapshot, column: &str) -> Self {
        let mentions =
            |columns: &[String]| columns.iter().any(|name| name.eq_ignore_ascii_case(column));

        let mut primary_key = snapshot.primary_key_columns();
        if primary_key.iter().any(|name| name.eq_ignore_ascii_case(column)) {
            tracing::warn!(
                "table {}: primary key ({}) includes {column} and is not carried over",
                snapshot.table,
                primary_key.join(", ")
            );
            primary_key.clear();
        }

        let mut unique = Vec::new();
        for constraint in &snapshot.unique_constraints {
            if mentions(constraint) {
                tracing::warn!(
                    "table {}: UNIQUE ({}) includes {column} and is not carried over",
                    snapshot.table,
                    constraint.join(", ")
                );
            } else {
                unique.push(constraint.iter().map(String::as_str).collect());
            }
        }

        let foreign_keys = snapshot
            .foreign_keys
            .iter()
            .filter(|key| {
                let keep = !mentions(&key.columns);
                if !keep {
                    tracing::warn!(
                        "table {}: foreign key to {} includes {column} and is not carried over",
                        snapshot.table,
                        key.parent_table
                    );
                }
                keep
            })
            .collect();

        let indexes = snapshot
            .indexes
            .iter()
            .filter(|index| {
                let keep = !mentions(&index.columns);
                if !keep {
                    tracing::warn!(
                        "table {}: index {} covers {column} and is not recreated",
                        snapshot.table,
                        index.name
                    );
                }
                keep
            })
            .collect();

        Self {
            columns: snapshot
                .columns
                .iter()
                .filter(|info| !info.name.eq_ignore_ascii_case(column))
                .collect(),
            primary_key,
            required_key: false,
            unique,
            foreign_keys,
            indexes,
            triggers: snapshot.triggers.iter().map(String::as_str).collect(),
        }
    }

    /// `key` moved to the front as the only primary key. A previous key becomes UNIQUE.
    fn promoted(snapshot: &'a SchemaSnapshot, key: &'a ColumnInfo) -> Self {
        let mut columns = vec![key];
        columns.extend(
            snapshot.columns.iter().filter(|info| !info.name.eq_ignore_ascii_case(&key.name)),
        );

        let mut unique = snapshot
            .unique_constraints
            .iter()
            .map(|constraint| constraint.iter().map(String::as_str).collect::<Vec<_>>())
            .collect::<Vec<_>>();
        let previous_key = snapshot.primary_key_columns();
        let demote = !previous_key.is_empty()
            && !snapshot.is_sole_primary_key(&key.name)
            && !unique.contains(&previous_key);
        if demote {
            tracing::info!(
                "table {}: previous primary key ({}) kept as UNIQUE",
                snapshot.table,
                previous_key.join(", ")
            );
            unique.push(previous_key);
        }

        Self {
            columns,
            primary_key: vec![key.name.as_str()],
            required_key: true,
            unique,
            foreign_keys: snapshot.foreign_keys.iter().collect(),
            indexes: snapshot.indexes.iter().collect(),
            triggers: snapshot.triggers.iter().map(String::as_str).collect(),
        }
    }

    fn create_table_sql(&self, name: &str) -> Result<String> {
        let mut parts = self
            .columns
            .iter()
            .map(|column| {
                let is_key =
                    self.primary_key.iter().any(|key| key.eq_ignore_ascii_case(&column.name));
                column_definition(column, is_key && self.required_key)
            })
            .collect::<Result<Vec<_>>>()?;
        if !self.primary_key.is_empty() {
            parts.push(format!("PRIMARY KEY ({})", quote_list(self.primary_key.iter().copied())?));
        }
        for constraint in &self.unique {
            parts.push(format!("UNIQUE ({})", quote_list(constraint.iter().copied())?));
        }
        for key in &self.foreign_keys {
            parts.push(foreign_key_clause(key)?);
        }
        Ok(format!("CREATE TABLE {} (\n    {}\n)", quote_ident(name)?, parts.join(",\n    ")))
    }

    /// Copies `rowid` explicitly unless the new table aliases it with an INTEGER key.
    fn copy_rows_sql(&self, from: &str, to: &str) -> Result<String> {
        let columns = quote_list(self.columns.iter().map(|column| column.name.as_str()))?;
        let (from, to) = (quote_ident(from)?, quote_ident(to)?);
        if self.has_rowid_alias() {
            Ok(format!("INSERT INTO {to} ({columns}) SELECT {columns} FROM {from}"))
        } else {
            Ok(format!("INSERT INTO {to} (rowid, {columns}) SELECT rowid, {columns} FROM {from}"))
        }
    }

    fn has_rowid_alias(&self) -> bool {
        match self.primary_key.as_slice() {
            [only] => self.columns.iter().any(|column| {
                column.name.eq_ignore_ascii_case(only)
                    && column.declared_type.trim().eq_ignore_ascii_case("INTEGER")
            }),
            _ => false,
        }
    }
}

/// Remove `column` if it exists. Returns whether anything was dropped.
///
/// # Errors
/// Returns a [`StepError`] when the column cannot be removed; the table is unchanged.
pub fn drop_column_if_present(
    conn: &mut Connection,
    table: &str,
    column: &str,
) -> Result<bool, StepError> {
    let snapshot = inspect_table(conn, table).map_err(at_step("inspect"))?;
    let Some(target) = snapshot.column(column) else {
        return Ok(false);
    };
    if snapshot.columns.len() == 1 {
        return Err(StepError {
            step: "plan",
            source: anyhow!("{} is the only column of {}", target.name, snapshot.table),
        });
    }

    if target.primary_key_position.is_some() || snapshot.is_referenced_by_constraint(&target.name) {
        tracing::info!(
            "table {}: dropping keyed column {} by rebuild",
            snapshot.table,
            target.name
        );
        let layout = TableLayout::without_column(&snapshot, &target.name);
        rebuild(conn, &snapshot, &layout)?;
    } else {
        let sql = format!(
            "ALTER TABLE {} DROP COLUMN {}",
            quote_ident(&snapshot.table).map_err(at_step("plan"))?,
            quote_ident(&target.name).map_err(at_step("plan"))?
        );
        run_step(conn, "drop column", &sql)?;
        tracing::info!("table {}: dropped column {}", snapshot.table, target.name);
    }
    Ok(true)
}

/// Append `column` to the end of `table`.
///
/// # Errors
/// Returns a [`StepError`] when the column already exists or the DDL fails.
pub fn add_column(conn: &Connection, table: &str, column: &ColumnSpec) -> Result<(), StepError> {
    let snapshot = inspect_table(conn, table).map_err(at_step("inspect"))?;
    if snapshot.has_column(column.name()) {
        return Err(StepError {
            step: "add column",
            source: anyhow!("column {} already exists in {}", column.name(), snapshot.table),
        });
    }
    let sql = format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        quote_ident(&snapshot.table).map_err(at_step("plan"))?,
        quote_ident(column.name()).map_err(at_step("plan"))?,
        column.declared_type()
    );
    run_step(conn, "add column", &sql)?;
    tracing::info!(
        "table {}: added column {} {}",
        snapshot.table,
        column.name(),
        column.declared_type()
    );
    Ok(())
}

/// Rebuild `table` with `column` first and declared `PRIMARY KEY NOT NULL`.
///
/// # Errors
/// Returns a [`StepError`] naming the failed step; the table is unchanged.
pub fn reorder_and_promote(
    conn: &mut Connection,
    table: &str,
    column: &str,
) -> Result<(), StepError> {
    let snapshot = inspect_table(conn, table).map_err(at_step("inspect"))?;
    let Some(key) = snapshot.column(column) else {
        return Err(StepError {
            step: "plan",
            source: anyhow!("column {column} does not exist in {}", snapshot.table),
        });
    };
    let layout = TableLayout::promoted(&snapshot, key);
    rebuild(conn, &snapshot, &layout)?;
    tracing::info!(
        "table {}: {} is now the first column and primary key",
        snapshot.table,
        key.name
    );
    Ok(())
}

/// Create-copy-swap inside one savepoint.
///
/// Outside a transaction foreign-key enforcement is switched off for the swap. Inside one
/// it can only be deferred, so tables other tables point at are refused.
fn rebuild(
    conn: &mut Connection,
    snapshot: &SchemaSnapshot,
    layout: &TableLayout<'_>,
) -> Result<(), StepError> {
    if snapshot.without_rowid {
        return Err(StepError {
            step: "plan",
            source: anyhow!("{} is a WITHOUT ROWID table", snapshot.table),
        });
    }
    if !snapshot.rebuild_blockers.is_empty() {
        return Err(StepError {
            step: "plan",
            source: anyhow!(
                "rebuilding {} would lose {}",
                snapshot.table,
                snapshot.rebuild_blockers.join(", ")
            ),
        });
    }
    let staging = format!("{}{STAGING_SUFFIX}", snapshot.table);
    let create_sql = layout.create_table_sql(&staging).map_err(at_step("plan"))?;
    let copy_sql = layout.copy_rows_sql(&snapshot.table, &staging).map_err(at_step("plan"))?;

    let in_transaction = !conn.is_autocommit();
    let enforcing = pragma_flag(conn, "foreign_keys").map_err(at_step("prepare"))?;
    let legacy_alter = pragma_flag(conn, "legacy_alter_table").map_err(at_step("prepare"))?;
    if in_transaction && enforcing {
        let children = referencing_tables(conn, &snapshot.table).map_err(at_step("prepare"))?;
        if !children.is_empty() {
            return Err(StepError {
                step: "prepare",
                source: anyhow!(
                    "{} is referenced by {} and cannot be rebuilt inside an open transaction",
                    snapshot.table,
                    children.join(", ")
                ),
            });
        }
    }

    let suspend = enforcing && !in_transaction;
    let mut setup = String::from("PRAGMA legacy_alter_table = ON;");
    if suspend {
        setup.push_str(" PRAGMA foreign_keys = OFF;");
    } else if enforcing {
        setup.push_str(" PRAGMA defer_foreign_keys = ON;");
    }
    run_step(conn, "prepare", &setup)?;

    let outcome = swap(conn, snapshot, layout, &staging, &create_sql, &copy_sql);

    let mut teardown = String::new();
    if suspend {
        teardown.push_str("PRAGMA foreign_keys = ON;");
    }
    if !legacy_alter {
        teardown.push_str(" PRAGMA legacy_alter_table = OFF;");
    }
    let restored = run_step(conn, "restore pragmas", &teardown);
    outcome?;
    restored
}

fn swap(
    conn: &mut Connection,
    snapshot: &SchemaSnapshot,
    layout: &TableLayout<'_>,
    staging: &str,
    create_sql: &str,
    copy_sql: &str,
) -> Result<(), StepError> {
    let original = quote_ident(&snapshot.table).map_err(at_step("plan"))?;
    let staged = quote_ident(staging).map_err(at_step("plan"))?;

    let sp = conn
        .savepoint()
        .context("failed to open rebuild savepoint")
        .map_err(at_step("savepoint"))?;
    run_step(&sp, "drop stale staging table", &format!("DROP TABLE IF EXISTS {staged}"))?;
    run_step(&sp, "create staging table", create_sql)?;
    tracing::debug!("copy rows: {copy_sql}");
    let copied = sp
        .execute(copy_sql, [])
        .with_context(|| format!("failed to copy rows of {}", snapshot.table))
        .map_err(at_step("copy rows"))?;
    run_step(&sp, "drop original table", &format!("DROP TABLE {original}"))?;
    run_step(&sp, "rename staging table", &format!("ALTER TABLE {staged} RENAME TO {original}"))?;
    for index in &layout.indexes {
        run_step(&sp, "recreate indexes", &index.sql)?;
    }
    for trigger in &layout.triggers {
        run_step(&sp, "recreate triggers", trigger)?;
    }
    check_foreign_keys(&sp, &snapshot.table).map_err(at_step("foreign key check"))?;
    sp.commit()
        .context("failed to release rebuild savepoint")
        .map_err(at_step("release savepoint"))?;

    tracing::info!("table {}: rebuilt with {copied} rows", snapshot.table);
    Ok(())
}

fn run_step(conn: &Connection, step: &'static str, sql: &str) -> Result<(), StepError> {
    tracing::debug!("{step}: {sql}");
    conn.execute_batch(sql)
        .with_context(|| format!("failed to execute {sql}"))
        .map_err(at_step(step))
}

fn check_foreign_keys(conn: &Connection, table: &str) -> Result<()> {
    let mut tables = vec![table.to_string()];
    tables.extend(referencing_tables(conn, table)?);
    tables.dedup();
    for checked in tables {
        let violations = conn
            .query_row(
                "SELECT COUNT(*) FROM pragma_foreign_key_check(?1)",
                params![checked],
                |row| row.get::<_, i64>(0),
            )
            .with_context(|| format!("failed to run foreign key check on {checked}"))?;
        if violations > 0 {
            return Err(anyhow!("{violations} foreign key violation(s) in {checked}"));
        }
    }
    Ok(())
}
