use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::Date;

use crate::assign::{assign, Assignment, AssignmentWarning};
use crate::dates::format_date8;
use crate::schema::SchemaSnapshot;
use crate::verify::{verify, VerificationSummary};
use crate::{
    ColumnSpec, EngineError, Identifier, Prefix, RecordColumns, RecordRow, RowAssignmentError,
    RowToken,
};

/// Storage seam the orchestrator drives. Implementations own the connection.
///
/// `drop_column_if_present`, `add_column` and `reorder_and_promote` are each atomic on
/// their own. `begin_phase`/`commit_phase`/`rollback_phase` group several calls into one
/// unit of work.
pub trait TableStore {
    /// # Errors
    /// [`EngineError::SchemaRead`] when the table is missing or unreadable.
    fn inspect(&self, table: &str) -> Result<SchemaSnapshot, EngineError>;

    /// Returns `true` when the column existed and was removed.
    ///
    /// # Errors
    /// [`EngineError::Rebuild`] or [`EngineError::Store`]; the table is left unchanged.
    fn drop_column_if_present(&mut self, table: &str, column: &str) -> Result<bool, EngineError>;

    /// # Errors
    /// [`EngineError::Store`] when the column exists already or DDL fails.
    fn add_column(&mut self, table: &str, column: &ColumnSpec) -> Result<(), EngineError>;

    /// # Errors
    /// [`EngineError::Store`] when the rows cannot be read.
    fn load_rows(
        &self,
        table: &str,
        columns: &RecordColumns,
    ) -> Result<Vec<RecordRow>, EngineError>;

    /// Returns the number of rows written.
    ///
    /// # Errors
    /// [`EngineError::Store`] when an update fails or does not hit exactly one row.
    fn write_identifiers(
        &mut self,
        table: &str,
        column: &str,
        identifiers: &BTreeMap<RowToken, Identifier>,
    ) -> Result<usize, EngineError>;

    /// Every row's identifier cell, ordered by token.
    ///
    /// # Errors
    /// [`EngineError::Store`] when the column cannot be read.
    fn read_identifier_column(
        &self,
        table: &str,
        column: &str,
    ) -> Result<Vec<(RowToken, Option<String>)>, EngineError>;

    /// Rebuild the table with `column` first and as its only primary key.
    ///
    /// # Errors
    /// [`EngineError::Rebuild`]; the table is left as it was before the call.
    fn reorder_and_promote(&mut self, table: &str, column: &str) -> Result<(), EngineError>;

    /// # Errors
    /// [`EngineError::Store`] when a transaction cannot be opened.
    fn begin_phase(&mut self) -> Result<(), EngineError>;

    /// # Errors
    /// [`EngineError::Store`] when the commit fails.
    fn commit_phase(&mut self) -> Result<(), EngineError>;

    /// # Errors
    /// [`EngineError::Store`] when the rollback fails.
    fn rollback_phase(&mut self) -> Result<(), EngineError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Start,
    Inspected,
    IdColumnDropped,
    IdColumnAdded,
    IdentifiersAssigned,
    Verified,
    PrimaryKeyPromoted,
    Aborted,
}

impl RunState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Inspected => "inspected",
            Self::IdColumnDropped => "id_column_dropped",
            Self::IdColumnAdded => "id_column_added",
            Self::IdentifiersAssigned => "identifiers_assigned",
            Self::Verified => "verified",
            Self::PrimaryKeyPromoted => "primary_key_promoted",
            Self::Aborted => "aborted",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::PrimaryKeyPromoted | Self::Aborted)
    }
}

/// Explicit parameters for one run. Nothing is read from globals.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunPlan {
    pub table: String,
    pub id_column: ColumnSpec,
    pub prefix: Prefix,
    pub columns: RecordColumns,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunFailure {
    /// The state the run was trying to reach.
    pub phase: RunState,
    pub kind: String,
    pub table: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FinalSchema {
    pub columns: Vec<String>,
    pub primary_key: Vec<String>,
}

impl From<&SchemaSnapshot> for FinalSchema {
    fn from(snapshot: &SchemaSnapshot) -> Self {
        Self {
            columns: snapshot.column_names().into_iter().map(str::to_string).collect(),
            primary_key: snapshot.primary_key_columns().into_iter().map(str::to_string).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunReport {
    pub table: String,
    pub dry_run: bool,
    pub run_date: String,
    pub final_state: RunState,
    pub transitions: Vec<RunState>,
    pub dropped_existing_column: bool,
    pub rows_total: usize,
    pub assigned: usize,
    pub failed: usize,
    pub row_errors: Vec<RowAssignmentError>,
    pub warnings: Vec<AssignmentWarning>,
    pub verification: Option<VerificationSummary>,
    pub sample_identifier: Option<String>,
    pub assignment_digest: Option<String>,
    pub final_schema: Option<FinalSchema>,
    pub failure: Option<RunFailure>,
}

impl RunReport {
    fn new(plan: &RunPlan, today: Date, dry_run: bool) -> Self {
        Self {
            table: plan.table.clone(),
            dry_run,
            run_date: format_date8(today),
            final_state: RunState::Start,
            transitions: vec![RunState::Start],
            dropped_existing_column: false,
            rows_total: 0,
            assigned: 0,
            failed: 0,
            row_errors: Vec::new(),
            warnings: Vec::new(),
            verification: None,
            sample_identifier: None,
            assignment_digest: None,
            final_schema: None,
            failure: None,
        }
    }

    /// `true` only when the table was promoted, or a dry run verified cleanly.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        match self.final_state {
            RunState::PrimaryKeyPromoted => true,
            RunState::Verified => self.dry_run,
            _ => false,
        }
    }

    fn advance(&mut self, state: RunState) {
        tracing::info!("table {}: {} -> {}", self.table, self.final_state.as_str(), state.as_str());
        self.final_state = state;
        self.transitions.push(state);
    }

    fn record_assignment(&mut self, assignment: &Assignment) {
        self.rows_total = assignment.rows_total();
        self.assigned = assignment.identifiers.len();
        self.failed = assignment.row_errors.len();
        self.row_errors.clone_from(&assignment.row_errors);
        self.warnings.clone_from(&assignment.warnings);
        self.sample_identifier = assignment.sample().map(|id| id.as_str().to_string());
        self.assignment_digest = Some(assignment.digest());

        for error in &assignment.row_errors {
            tracing::warn!("table {}: skipped {error}", self.table);
        }
        for warning in &assignment.warnings {
            tracing::warn!("table {}: {warning}", self.table);
        }
    }

    fn abort(&mut self, failure: PhaseFailure) {
        tracing::error!(
            "table {}: aborted while reaching {}: {}",
            self.table,
            failure.phase.as_str(),
            failure.error
        );
        self.failure = Some(RunFailure {
            phase: failure.phase,
            kind: failure.error.kind().to_string(),
            table: self.table.clone(),
            message: failure.error.to_string(),
        });
        self.final_state = RunState::Aborted;
        self.transitions.push(RunState::Aborted);
    }
}

struct PhaseFailure {
    phase: RunState,
    error: EngineError,
}

fn at(phase: RunState) -> impl FnOnce(EngineError) -> PhaseFailure {
    move |error| PhaseFailure { phase, error }
}

/// Inspect, drop any previous identifier column, add and populate a fresh one, verify
/// it, then rebuild the table with the identifier first and as primary key.
///
/// Each phase commits on its own; an abort leaves the table as the last committed
/// phase produced it.
pub fn run<S: TableStore>(store: &mut S, plan: &RunPlan, today: Date) -> RunReport {
    let mut report = RunReport::new(plan, today, false);
    if let Err(failure) = drive(store, plan, today, &mut report) {
        report.abort(failure);
    }
    report
}

/// Everything up to verification, computed in memory. The table is never modified.
pub fn preview<S: TableStore>(store: &S, plan: &RunPlan, today: Date) -> RunReport {
    let mut report = RunReport::new(plan, today, true);
    let outcome = (|| -> Result<(), PhaseFailure> {
        let snapshot = store.inspect(&plan.table).map_err(at(RunState::Inspected))?;
        check_plan_against(&snapshot, plan).map_err(at(RunState::Inspected))?;
        report.advance(RunState::Inspected);

        let rows = store
            .load_rows(&plan.table, &plan.columns)
            .map_err(at(RunState::IdentifiersAssigned))?;
        let assignment = assign(&rows, &plan.prefix, today);
        report.record_assignment(&assignment);
        report.advance(RunState::IdentifiersAssigned);

        let summary = verify(&plan.prefix, &assignment.column_values())
            .map_err(|failure| at(RunState::Verified)(failure.into()))?;
        report.verification = Some(summary);
        report.advance(RunState::Verified);
        Ok(())
    })();

    if let Err(failure) = outcome {
        report.abort(failure);
    }
    report
}

fn drive<S: TableStore>(
    store: &mut S,
    plan: &RunPlan,
    today: Date,
    report: &mut RunReport,
) -> Result<(), PhaseFailure> {
    let table = plan.table.as_str();
    let id_column = plan.id_column.name();

    let snapshot = store.inspect(table).map_err(at(RunState::Inspected))?;
    check_plan_against(&snapshot, plan).map_err(at(RunState::Inspected))?;
    report.advance(RunState::Inspected);

    report.dropped_existing_column =
        store.drop_column_if_present(table, id_column).map_err(at(RunState::IdColumnDropped))?;
    report.advance(RunState::IdColumnDropped);

    store.begin_phase().map_err(at(RunState::IdColumnAdded))?;
    if let Err(failure) = stage_identifiers(store, plan, today, report) {
        if let Err(err) = store.rollback_phase() {
            tracing::error!("table {table}: rollback after failed phase also failed: {err}");
        }
        return Err(failure);
    }
    store.commit_phase().map_err(at(RunState::Verified))?;
    report.advance(RunState::Verified);

    store.reorder_and_promote(table, id_column).map_err(at(RunState::PrimaryKeyPromoted))?;
    let promoted = store.inspect(table).map_err(at(RunState::PrimaryKeyPromoted))?;
    if promoted.ordinal_of(id_column) != Some(0) || !promoted.is_sole_primary_key(id_column) {
        return Err(PhaseFailure {
            phase: RunState::PrimaryKeyPromoted,
            error: EngineError::Rebuild {
                table: table.to_string(),
                step: "confirm".to_string(),
                reason: format!(
                    "expected {id_column} first and as sole primary key, \
                     found columns {:?} with key {:?}",
                    promoted.column_names(),
                    promoted.primary_key_columns()
                ),
            },
        });
    }
    report.final_schema = Some(FinalSchema::from(&promoted));
    report.advance(RunState::PrimaryKeyPromoted);
    Ok(())
}

/// Add, populate and verify the identifier column inside the open phase transaction.
fn stage_identifiers<S: TableStore>(
    store: &mut S,
    plan: &RunPlan,
    today: Date,
    report: &mut RunReport,
) -> Result<(), PhaseFailure> {
    let table = plan.table.as_str();
    let id_column = plan.id_column.name();

    store.add_column(table, &plan.id_column).map_err(at(RunState::IdColumnAdded))?;
    report.advance(RunState::IdColumnAdded);

    let rows = store.load_rows(table, &plan.columns).map_err(at(RunState::IdentifiersAssigned))?;
    let assignment = assign(&rows, &plan.prefix, today);
    report.record_assignment(&assignment);
    store
        .write_identifiers(table, id_column, &assignment.identifiers)
        .map_err(at(RunState::IdentifiersAssigned))?;
    report.advance(RunState::IdentifiersAssigned);

    let column = store.read_identifier_column(table, id_column).map_err(at(RunState::Verified))?;
    let summary = verify(&plan.prefix, &column)
        .map_err(|failure| at(RunState::Verified)(failure.into()))?;
    report.verification = Some(summary);
    Ok(())
}

fn check_plan_against(snapshot: &SchemaSnapshot, plan: &RunPlan) -> Result<(), EngineError> {
    let schema_error =
        |reason: String| EngineError::SchemaRead { table: plan.table.clone(), reason };

    if snapshot.without_rowid {
        return Err(schema_error("WITHOUT ROWID tables have no stable row token".to_string()));
    }
    if !snapshot.rebuild_blockers.is_empty() {
        return Err(schema_error(format!(
            "promotion would rebuild the table and lose {}",
            snapshot.rebuild_blockers.join(", ")
        )));
    }
    for column in plan.columns.all() {
        if !snapshot.has_column(column) {
            return Err(schema_error(format!("expected column {column} is missing")));
        }
        if column.eq_ignore_ascii_case(plan.id_column.name()) {
            return Err(schema_error(format!(
                "identifier column {column} would overwrite a record column"
            )));
        }
    }
    Ok(())
}
