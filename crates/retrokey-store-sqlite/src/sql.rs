use anyhow::{anyhow, Result};
use rusqlite::Connection;

use retrokey_core::{ColumnInfo, ColumnSpec, ForeignKeyInfo};

/// Referential actions SQLite reports through `pragma_foreign_key_list`.
const REFERENTIAL_ACTIONS: [&str; 5] =
    ["NO ACTION", "RESTRICT", "SET NULL", "SET DEFAULT", "CASCADE"];

/// Quote a table or column name for DDL/DML. Embedded double quotes are doubled.
///
/// # Errors
/// Returns an error for empty names or names containing NUL.
pub fn quote_ident(name: &str) -> Result<String> {
    if name.is_empty() {
        return Err(anyhow!("identifier must not be empty"));
    }
    if name.contains('\0') {
        return Err(anyhow!("identifier {name:?} contains NUL"));
    }
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

pub(crate) fn quote_list<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<String> {
    let quoted = names.into_iter().map(quote_ident).collect::<Result<Vec<_>>>()?;
    Ok(quoted.join(", "))
}

/// `"name" TYPE [NOT NULL] [DEFAULT (expr)]`.
pub(crate) fn column_definition(column: &ColumnInfo, force_not_null: bool) -> Result<String> {
    let mut definition = quote_ident(&column.name)?;
    if !column.declared_type.trim().is_empty() {
        let spec = ColumnSpec::new(&column.name, &column.declared_type)
            .map_err(|err| anyhow!("cannot re-declare column {}: {err}", column.name))?;
        definition.push(' ');
        definition.push_str(spec.declared_type());
    }
    if column.not_null || force_not_null {
        definition.push_str(" NOT NULL");
    }
    if let Some(default) = &column.default_sql {
        definition.push_str(&format!(" DEFAULT ({default})"));
    }
    Ok(definition)
}

pub(crate) fn foreign_key_clause(key: &ForeignKeyInfo) -> Result<String> {
    let mut clause = format!(
        "FOREIGN KEY ({}) REFERENCES {}",
        quote_list(key.columns.iter().map(String::as_str))?,
        quote_ident(&key.parent_table)?
    );
    if !key.parent_columns.is_empty() {
        let parent_columns = quote_list(key.parent_columns.iter().map(String::as_str))?;
        clause.push_str(&format!(" ({parent_columns})"));
    }
    clause.push_str(&format!(
        " ON UPDATE {} ON DELETE {}",
        referential_action(&key.on_update)?,
        referential_action(&key.on_delete)?
    ));
    Ok(clause)
}

fn referential_action(action: &str) -> Result<&'static str> {
    REFERENTIAL_ACTIONS
        .into_iter()
        .find(|known| known.eq_ignore_ascii_case(action.trim()))
        .ok_or_else(|| anyhow!("unknown referential action {action:?}"))
}

/// Table-definition keywords whose clauses a snapshot-driven rebuild cannot re-declare.
const UNPRESERVED_KEYWORDS: [(&str, &str); 4] = [
    ("CHECK", "CHECK constraint"),
    ("COLLATE", "COLLATE clause"),
    ("AUTOINCREMENT", "AUTOINCREMENT"),
    ("GENERATED", "generated column"),
];

/// Clauses in a `CREATE TABLE` statement that a rebuild would silently drop.
/// Quoted names, string literals and comments are skipped.
pub(crate) fn unpreserved_clauses(create_sql: &str) -> Vec<&'static str> {
    let mut found = Vec::new();
    let mut chars = create_sql.chars().peekable();
    let mut word = String::new();

    while let Some(current) = chars.next() {
        if current.is_ascii_alphanumeric() || current == '_' || current == '$' {
            word.push(current);
            continue;
        }
        note_keyword(&mut word, &mut found);
        match current {
            '\'' | '"' | '`' => skip_until(&mut chars, current),
            '[' => skip_until(&mut chars, ']'),
            '-' if chars.peek() == Some(&'-') => skip_until(&mut chars, '\n'),
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                while let Some(inner) = chars.next() {
                    if inner == '*' && chars.peek() == Some(&'/') {
                        chars.next();
                        break;
                    }
                }
            }
            _ => {}
        }
    }
    note_keyword(&mut word, &mut found);
    found
}

fn note_keyword(word: &mut String, found: &mut Vec<&'static str>) {
    if let Some((_, clause)) =
        UNPRESERVED_KEYWORDS.iter().find(|(keyword, _)| keyword.eq_ignore_ascii_case(word))
    {
        if !found.contains(clause) {
            found.push(*clause);
        }
    }
    word.clear();
}

/// Doubled terminators inside quotes re-enter the quoted run on the next pass.
fn skip_until(chars: &mut impl Iterator<Item = char>, terminator: char) {
    for next in chars {
        if next == terminator {
            break;
        }
    }
}

/// Read a boolean pragma such as `foreign_keys`.
pub(crate) fn pragma_flag(conn: &Connection, pragma: &str) -> Result<bool> {
    let value = conn.query_row(&format!("PRAGMA {pragma}"), [], |row| row.get::<_, i64>(0))?;
    Ok(value != 0)
}
