use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use retrokey_core::{ColumnInfo, ForeignKeyInfo, IndexInfo, SchemaSnapshot};

use crate::sql::unpreserved_clauses;

/// Read the current structure of `table` from the catalog.
///
/// # Errors
/// Returns an error when the table does not exist or any catalog query fails.
pub fn inspect_table(conn: &Connection, table: &str) -> Result<SchemaSnapshot> {
    let name = canonical_table_name(conn, table)?
        .ok_or_else(|| anyhow!("table {table} does not exist"))?;

    let columns = read_columns(conn, &name)?;
    if columns.is_empty() {
        return Err(anyhow!("table {name} reports no columns"));
    }
    let (indexes, unique_constraints) = read_indexes(conn, &name)?;

    Ok(SchemaSnapshot {
        foreign_keys: read_foreign_keys(conn, &name)?,
        triggers: read_triggers(conn, &name)?,
        without_rowid: is_without_rowid(conn, &name)?,
        rebuild_blockers: rebuild_blockers(conn, &name)?,
        table: name,
        columns,
        indexes,
        unique_constraints,
    })
}

/// Catalog spelling of `table`; SQLite table names match case-insensitively.
pub(crate) fn canonical_table_name(conn: &Connection, table: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
        params![table],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .with_context(|| format!("failed to look up table {table}"))
}

fn read_columns(conn: &Connection, table: &str) -> Result<Vec<ColumnInfo>> {
    let mut stmt = conn
        .prepare(
            "SELECT cid, name, type, \"notnull\", dflt_value, pk
             FROM pragma_table_info(?1)
             ORDER BY cid",
        )
        .context("failed to prepare table_info query")?;
    let rows = stmt.query_map(params![table], |row| {
        let ordinal: i64 = row.get(0)?;
        let primary_key_position: i64 = row.get(5)?;
        Ok(ColumnInfo {
            ordinal: usize::try_from(ordinal).unwrap_or_default(),
            name: row.get(1)?,
            declared_type: row.get(2)?,
            not_null: row.get::<_, i64>(3)? != 0,
            default_sql: row.get(4)?,
            primary_key_position: u32::try_from(primary_key_position).ok().filter(|pos| *pos > 0),
        })
    })?;

    let mut columns = Vec::new();
    for row in rows {
        columns.push(row.with_context(|| format!("failed to read columns of {table}"))?);
    }
    Ok(columns)
}

/// Explicit indexes, and the column lists of UNIQUE constraints.
fn read_indexes(conn: &Connection, table: &str) -> Result<(Vec<IndexInfo>, Vec<Vec<String>>)> {
    let mut stmt = conn
        .prepare("SELECT name, \"unique\", origin FROM pragma_index_list(?1) ORDER BY name")
        .context("failed to prepare index_list query")?;
    let listed = stmt
        .query_map(params![table], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? != 0, row.get::<_, String>(2)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()
        .with_context(|| format!("failed to list indexes of {table}"))?;

    let mut indexes = Vec::new();
    let mut unique_constraints = Vec::new();
    for (name, unique, origin) in listed {
        match origin.as_str() {
            "pk" => {}
            "u" => unique_constraints.push(index_columns(conn, &name)?),
            _ => {
                let sql = conn
                    .query_row(
                        "SELECT sql FROM sqlite_master WHERE type = 'index' AND name = ?1",
                        params![name],
                        |row| row.get::<_, Option<String>>(0),
                    )
                    .optional()
                    .with_context(|| format!("failed to read definition of index {name}"))?
                    .flatten()
                    .ok_or_else(|| anyhow!("index {name} has no stored definition"))?;
                indexes.push(IndexInfo { columns: index_columns(conn, &name)?, name, unique, sql });
            }
        }
    }
    Ok((indexes, unique_constraints))
}

/// Named key columns of an index. Expression terms have no name and are omitted.
fn index_columns(conn: &Connection, index: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")
        .context("failed to prepare index_info query")?;
    let names = stmt
        .query_map(params![index], |row| row.get::<_, Option<String>>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .with_context(|| format!("failed to read columns of index {index}"))?;
    Ok(names.into_iter().flatten().collect())
}

fn read_foreign_keys(conn: &Connection, table: &str) -> Result<Vec<ForeignKeyInfo>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, \"table\", \"from\", \"to\", on_update, on_delete
             FROM pragma_foreign_key_list(?1)
             ORDER BY id, seq",
        )
        .context("failed to prepare foreign_key_list query")?;
    let rows = stmt.query_map(params![table], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, String>(5)?,
        ))
    })?;

    let mut grouped: BTreeMap<i64, ForeignKeyInfo> = BTreeMap::new();
    for row in rows {
        let (id, parent_table, from, to, on_update, on_delete) =
            row.with_context(|| format!("failed to read foreign keys of {table}"))?;
        let key = grouped.entry(id).or_insert_with(|| ForeignKeyInfo {
            columns: Vec::new(),
            parent_table,
            parent_columns: Vec::new(),
            on_update,
            on_delete,
        });
        key.columns.push(from);
        if let Some(to) = to {
            key.parent_columns.push(to);
        }
    }
    Ok(grouped.into_values().collect())
}

fn read_triggers(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(
            "SELECT sql FROM sqlite_master
             WHERE type = 'trigger' AND tbl_name = ?1 COLLATE NOCASE AND sql IS NOT NULL
             ORDER BY name",
        )
        .context("failed to prepare trigger query")?;
    let triggers = stmt
        .query_map(params![table], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .with_context(|| format!("failed to read triggers of {table}"))?;
    Ok(triggers)
}

/// Features of `table` a rebuild from the snapshot would lose. `pragma_table_info`
/// omits generated columns, so they are read from `pragma_table_xinfo`.
fn rebuild_blockers(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let create_sql = conn
        .query_row(
            "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get::<_, Option<String>>(0),
        )
        .with_context(|| format!("failed to read definition of {table}"))?
        .unwrap_or_default();
    let mut blockers =
        unpreserved_clauses(&create_sql).into_iter().map(str::to_string).collect::<Vec<_>>();

    let mut stmt = conn
        .prepare("SELECT name FROM pragma_table_xinfo(?1) WHERE hidden <> 0 ORDER BY cid")
        .context("failed to prepare table_xinfo query")?;
    let hidden = stmt
        .query_map(params![table], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .with_context(|| format!("failed to read hidden columns of {table}"))?;
    blockers.extend(hidden.into_iter().map(|name| format!("generated column {name}")));
    Ok(blockers)
}

fn is_without_rowid(conn: &Connection, table: &str) -> Result<bool> {
    let flag = conn
        .query_row("SELECT MAX(wr) FROM pragma_table_list(?1)", params![table], |row| {
            row.get::<_, Option<i64>>(0)
        })
        .with_context(|| format!("failed to read table flags of {table}"))?;
    Ok(flag.unwrap_or(0) != 0)
}

/// Tables whose foreign keys point at `table`.
pub(crate) fn referencing_tables(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(
            "SELECT DISTINCT m.name
             FROM sqlite_master AS m, pragma_foreign_key_list(m.name) AS f
             WHERE m.type = 'table' AND f.\"table\" = ?1 COLLATE NOCASE
             ORDER BY m.name",
        )
        .context("failed to prepare referencing-table query")?;
    let tables = stmt
        .query_map(params![table], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .with_context(|| format!("failed to find tables referencing {table}"))?;
    Ok(tables)
}
