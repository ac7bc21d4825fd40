use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::engine::ConflictPolicy;
use crate::model::*;

/// Employee + interval filter shared by the overlap tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub employee_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub exclude_id: Option<Ulid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationFilter {
    Id(Ulid),
    Employee(Ulid),
    Project(Ulid),
    Phase(Ulid),
    /// One employee on one project, optionally narrowed to a phase.
    Assignment {
        employee_id: Ulid,
        project_id: Ulid,
        phase_id: Option<Ulid>,
    },
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertEmployee {
        id: Ulid,
        name: String,
    },
    InsertProject {
        id: Ulid,
        name: String,
    },
    InsertPhase {
        id: Ulid,
        project_id: Ulid,
        name: String,
    },
    InsertAllocation {
        new: NewAllocation,
        policy: ConflictPolicy,
        returning: bool,
    },
    UpdateAllocation {
        id: Ulid,
        start: Ms,
        end: Ms,
        /// `Some(None)` clears the phase; `None` leaves it alone.
        phase_id: Option<Option<Ulid>>,
        policy: ConflictPolicy,
        returning: bool,
    },
    DeleteAllocation {
        id: Ulid,
    },
    UnassignProject {
        employee_id: Ulid,
        project_id: Ulid,
    },
    UnassignPhase {
        employee_id: Ulid,
        phase_id: Ulid,
    },
    SelectAllocations {
        filter: AllocationFilter,
    },
    SelectOverlaps {
        window: Window,
    },
    SelectOverridePlan {
        window: Window,
    },
    ExecuteOverride {
        window: Window,
    },
    SelectAvailability {
        employee_id: Ulid,
        start: Ms,
        end: Ms,
    },
}

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("empty interval [{0}, {1})")]
    EmptyInterval(Ms, Ms),
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            returning,
            ..
        } => parse_update(table, assignments, selection, returning.is_some()),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "employees" => {
            expect_arity("employees", &values, 2)?;
            Ok(Command::InsertEmployee {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
            })
        }
        "projects" => {
            expect_arity("projects", &values, 2)?;
            Ok(Command::InsertProject {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
            })
        }
        "phases" => {
            expect_arity("phases", &values, 3)?;
            Ok(Command::InsertPhase {
                id: parse_ulid(&values[0])?,
                project_id: parse_ulid(&values[1])?,
                name: parse_string(&values[2])?,
            })
        }
        "allocations" => {
            expect_arity("allocations", &values, 5)?;
            let start = parse_i64(&values[3])?;
            let end = parse_i64(&values[4])?;
            let span = Span::try_new(start, end).ok_or(SqlError::EmptyInterval(start, end))?;
            let policy = match values.get(5) {
                Some(expr) => policy_from(parse_bool(expr)?),
                None => ConflictPolicy::Reject,
            };
            Ok(Command::InsertAllocation {
                new: NewAllocation {
                    employee_id: parse_ulid(&values[0])?,
                    project_id: parse_ulid(&values[1])?,
                    phase_id: parse_ulid_or_null(&values[2])?,
                    span,
                },
                policy,
                returning: insert.returning.is_some(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
    returning: bool,
) -> Result<Command, SqlError> {
    let name = table_factor_name(&table.relation)?;
    if name != "allocations" {
        return Err(SqlError::UnknownTable(name));
    }

    let (mut start, mut end, mut phase_id, mut policy) = (None, None, None, ConflictPolicy::Reject);
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        };
        match column.as_deref() {
            Some("start") => start = Some(parse_i64(&assignment.value)?),
            Some("end") => end = Some(parse_i64(&assignment.value)?),
            Some("phase_id") => phase_id = Some(parse_ulid_or_null(&assignment.value)?),
            Some("override") => policy = policy_from(parse_bool(&assignment.value)?),
            Some(other) => return Err(SqlError::Unsupported(format!("SET {other}"))),
            None => return Err(SqlError::Unsupported("tuple assignment".into())),
        }
    }

    let filters = extract_filters(selection)?;
    Ok(Command::UpdateAllocation {
        id: filters.id.ok_or(SqlError::MissingFilter("id"))?,
        start: start.ok_or(SqlError::MissingFilter("start"))?,
        end: end.ok_or(SqlError::MissingFilter("end"))?,
        phase_id,
        policy,
        returning,
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = extract_filters(&delete.selection)?;

    match table.as_str() {
        "allocations" => {
            if let Some(id) = filters.id {
                return Ok(Command::DeleteAllocation { id });
            }
            let employee_id = filters
                .employee_id
                .ok_or(SqlError::MissingFilter("id or employee_id"))?;
            match (filters.project_id, filters.phase_id) {
                (_, Some(phase_id)) => Ok(Command::UnassignPhase {
                    employee_id,
                    phase_id,
                }),
                (Some(project_id), None) => Ok(Command::UnassignProject {
                    employee_id,
                    project_id,
                }),
                (None, None) => Err(SqlError::MissingFilter("project_id or phase_id")),
            }
        }
        "overlaps" => Ok(Command::ExecuteOverride {
            window: filters.window()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Rows a statement produces, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    Allocations,
    Overlaps,
    OverridePlan,
    Availability,
}

/// Classify a statement by its shape alone, so unbound `$N` parameters
/// don't need to be valid ULIDs or intervals.
pub fn result_shape(sql: &str) -> Option<ResultShape> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    match stmts.first()? {
        Statement::Insert(insert) if insert.returning.is_some() => {
            (insert_table_name(insert).ok()? == "allocations").then_some(ResultShape::Allocations)
        }
        Statement::Update {
            returning: Some(_), ..
        } => Some(ResultShape::Allocations),
        Statement::Query(query) => {
            let SetExpr::Select(select) = query.body.as_ref() else {
                return None;
            };
            match table_factor_name(&select.from.first()?.relation).ok()?.as_str() {
                "allocations" => Some(ResultShape::Allocations),
                "overlaps" => Some(ResultShape::Overlaps),
                "override_plan" => Some(ResultShape::OverridePlan),
                "availability" => Some(ResultShape::Availability),
                _ => None,
            }
        }
        _ => None,
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = extract_filters(&select.selection)?;

    match table.as_str() {
        "allocations" => Ok(Command::SelectAllocations {
            filter: filters.allocation_filter()?,
        }),
        "overlaps" => Ok(Command::SelectOverlaps {
            window: filters.window()?,
        }),
        "override_plan" => Ok(Command::SelectOverridePlan {
            window: filters.window()?,
        }),
        "availability" => {
            let window = filters.window()?;
            Ok(Command::SelectAvailability {
                employee_id: window.employee_id,
                start: window.start,
                end: window.end,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn policy_from(override_conflicts: bool) -> ConflictPolicy {
    if override_conflicts {
        ConflictPolicy::Override
    } else {
        ConflictPolicy::Reject
    }
}

// ── WHERE clauses ─────────────────────────────────────────────

/// Every filter this dialect understands, collected from an AND chain.
#[derive(Debug, Default)]
struct Filters {
    id: Option<Ulid>,
    employee_id: Option<Ulid>,
    project_id: Option<Ulid>,
    phase_id: Option<Ulid>,
    exclude_id: Option<Ulid>,
    start: Option<Ms>,
    end: Option<Ms>,
}

impl Filters {
    fn window(&self) -> Result<Window, SqlError> {
        Ok(Window {
            employee_id: self.employee_id.ok_or(SqlError::MissingFilter("employee_id"))?,
            start: self.start.ok_or(SqlError::MissingFilter("start"))?,
            end: self.end.ok_or(SqlError::MissingFilter("end"))?,
            exclude_id: self.exclude_id,
        })
    }

    fn allocation_filter(&self) -> Result<AllocationFilter, SqlError> {
        if let Some(id) = self.id {
            return Ok(AllocationFilter::Id(id));
        }
        Ok(match (self.employee_id, self.project_id, self.phase_id) {
            (Some(employee_id), Some(project_id), phase_id) => AllocationFilter::Assignment {
                employee_id,
                project_id,
                phase_id,
            },
            (Some(employee_id), None, None) => AllocationFilter::Employee(employee_id),
            (None, Some(project_id), None) => AllocationFilter::Project(project_id),
            (None, _, Some(phase_id)) => AllocationFilter::Phase(phase_id),
            (Some(_), None, Some(_)) => {
                return Err(SqlError::MissingFilter("project_id"));
            }
            (None, None, None) => {
                return Err(SqlError::MissingFilter(
                    "id, employee_id, project_id or phase_id",
                ));
            }
        })
    }
}

fn extract_filters(selection: &Option<Expr>) -> Result<Filters, SqlError> {
    let mut filters = Filters::default();
    if let Some(expr) = selection {
        collect_filters(expr, &mut filters)?;
    }
    Ok(filters)
}

fn collect_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, filters),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_filters(left, filters)?;
                collect_filters(right, filters)
            }
            ast::BinaryOperator::Eq => {
                let slot = match expr_column_name(left).as_deref() {
                    Some("id") => &mut filters.id,
                    Some("employee_id") => &mut filters.employee_id,
                    Some("project_id") => &mut filters.project_id,
                    Some("phase_id") => &mut filters.phase_id,
                    Some("exclude_id") => &mut filters.exclude_id,
                    Some(other) => return Err(SqlError::Unsupported(format!("filter on {other}"))),
                    None => return Err(SqlError::Unsupported(format!("{expr}"))),
                };
                *slot = Some(parse_ulid(right)?);
                Ok(())
            }
            ast::BinaryOperator::GtEq if expr_column_name(left).as_deref() == Some("start") => {
                filters.start = Some(parse_i64(right)?);
                Ok(())
            }
            ast::BinaryOperator::LtEq if expr_column_name(left).as_deref() == Some("end") => {
                filters.end = Some(parse_i64(right)?);
                Ok(())
            }
            _ => Err(SqlError::Unsupported(format!("{expr}"))),
        },
        _ => Err(SqlError::Unsupported(format!("{expr}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn expect_arity(table: &'static str, values: &[Expr], min: usize) -> Result<(), SqlError> {
    if values.len() < min {
        return Err(SqlError::WrongArity(table, min, values.len()));
    }
    Ok(())
}

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_ulid(expr).map(Some),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        _ => Err(SqlError::Parse(format!("expected string, got {expr}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}
