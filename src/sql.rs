use chrono::{DateTime, NaiveDateTime};
use sqlparser::ast::{
    self, AssignmentTarget, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

const WORKSPACE_COLUMNS: &[&str] = &["id", "title", "description", "available"];
const BOOKING_COLUMNS: &[&str] = &[
    "id",
    "resource_id",
    "start",
    "end",
    "contact_name",
    "contact_email",
    "notes",
];

/// Values of an `INSERT INTO bookings`. The requester is not a column: it comes
/// from the authenticated session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInsert {
    pub id: Option<Ulid>,
    pub resource_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub contact_name: String,
    pub contact_email: String,
    pub notes: Option<String>,
}

impl BookingInsert {
    pub fn into_new_booking(self, requester_id: String) -> NewBooking {
        NewBooking {
            id: self.id,
            resource_id: self.resource_id,
            requester_id,
            start: self.start,
            end: self.end,
            contact_name: self.contact_name,
            contact_email: self.contact_email,
            notes: self.notes,
        }
    }
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertWorkspace {
        id: Ulid,
        title: String,
        description: String,
        available: bool,
    },
    UpdateWorkspace {
        id: Ulid,
        title: Option<String>,
        description: Option<String>,
        available: Option<bool>,
    },
    DeleteWorkspace {
        id: Ulid,
    },
    SelectWorkspaces {
        id: Option<Ulid>,
    },
    InsertBooking(BookingInsert),
    UpdateBooking {
        id: Ulid,
        patch: BookingPatch,
        status: Option<BookingStatus>,
    },
    /// Soft cancel, or a hard delete when `purge = true` is in the filter.
    DeleteBooking {
        id: Ulid,
        purge: bool,
    },
    SelectBookings {
        id: Option<Ulid>,
        resource_id: Option<Ulid>,
        status: Option<BookingStatus>,
    },
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
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Table a `SELECT` reads from. Works on statements with unbound `$N` placeholders.
pub fn select_table(sql: &str) -> Option<String> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    let Statement::Query(query) = stmts.first()? else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    table_factor_name(&select.from.first()?.relation).ok()
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "workspaces" => {
            let row = named_row(insert, WORKSPACE_COLUMNS)?;
            Ok(Command::InsertWorkspace {
                id: parse_ulid(required(&row, "id")?)?,
                title: parse_string(required(&row, "title")?)?,
                description: optional(&row, "description")
                    .map(parse_string)
                    .transpose()?
                    .unwrap_or_default(),
                available: optional(&row, "available")
                    .map(parse_bool)
                    .transpose()?
                    .unwrap_or(true),
            })
        }
        "bookings" => {
            let row = named_row(insert, BOOKING_COLUMNS)?;
            Ok(Command::InsertBooking(BookingInsert {
                id: optional(&row, "id").map(parse_ulid_or_null).transpose()?.flatten(),
                resource_id: parse_ulid(required(&row, "resource_id")?)?,
                start: parse_timestamp(required(&row, "start")?)?,
                end: parse_timestamp(required(&row, "end")?)?,
                contact_name: parse_string(required(&row, "contact_name")?)?,
                contact_email: parse_string(required(&row, "contact_email")?)?,
                notes: optional(&row, "notes")
                    .map(parse_string_or_null)
                    .transpose()?
                    .flatten(),
            }))
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let filters = where_equalities(selection)?;
    reject_unknown_filters(&filters, &["id"])?;
    let id = parse_ulid(filter(&filters, "id").ok_or(SqlError::MissingFilter("id"))?)?;

    let mut sets = Vec::with_capacity(assignments.len());
    for a in assignments {
        let column = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        sets.push((column, &a.value));
    }

    match table.as_str() {
        "workspaces" => {
            let (mut title, mut description, mut available) = (None, None, None);
            for (column, value) in sets {
                match column.as_str() {
                    "title" => title = Some(parse_string(value)?),
                    "description" => description = Some(parse_string(value)?),
                    "available" => available = Some(parse_bool(value)?),
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            Ok(Command::UpdateWorkspace { id, title, description, available })
        }
        "bookings" => {
            let mut patch = BookingPatch::default();
            let mut status = None;
            for (column, value) in sets {
                match column.as_str() {
                    "start" => patch.start = Some(parse_timestamp(value)?),
                    "end" => patch.end = Some(parse_timestamp(value)?),
                    "contact_name" => patch.contact_name = Some(parse_string(value)?),
                    "contact_email" => patch.contact_email = Some(parse_string(value)?),
                    // NULL clears the notes.
                    "notes" => patch.notes = Some(parse_string_or_null(value)?.unwrap_or_default()),
                    "status" => status = Some(parse_status(value)?),
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            Ok(Command::UpdateBooking { id, patch, status })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = where_equalities(&delete.selection)?;
    let allowed: &[&str] = if table == "bookings" { &["id", "purge"] } else { &["id"] };
    reject_unknown_filters(&filters, allowed)?;
    let id = parse_ulid(filter(&filters, "id").ok_or(SqlError::MissingFilter("id"))?)?;

    match table.as_str() {
        "workspaces" => Ok(Command::DeleteWorkspace { id }),
        "bookings" => {
            let purge = filter(&filters, "purge").map(parse_bool).transpose()?.unwrap_or(false);
            Ok(Command::DeleteBooking { id, purge })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = where_equalities(&select.selection)?;

    match table.as_str() {
        "workspaces" => {
            reject_unknown_filters(&filters, &["id"])?;
            Ok(Command::SelectWorkspaces {
                id: filter(&filters, "id").map(parse_ulid).transpose()?,
            })
        }
        "bookings" => {
            reject_unknown_filters(&filters, &["id", "resource_id", "status"])?;
            Ok(Command::SelectBookings {
                id: filter(&filters, "id").map(parse_ulid).transpose()?,
                resource_id: filter(&filters, "resource_id").map(parse_ulid).transpose()?,
                status: filter(&filters, "status").map(parse_status).transpose()?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE clauses ─────────────────────────────────────────────

/// Flatten `a = x AND b = y AND ...` into `[(a, x), (b, y)]`. Anything else is unsupported.
fn where_equalities(selection: &Option<Expr>) -> Result<Vec<(String, &Expr)>, SqlError> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        collect_equalities(expr, &mut out)?;
    }
    Ok(out)
}

fn collect_equalities<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_equalities(inner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_equalities(left, out)?;
            collect_equalities(right, out)
        }
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((col, right.as_ref()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

fn filter<'a>(filters: &[(String, &'a Expr)], column: &str) -> Option<&'a Expr> {
    filters.iter().find(|(c, _)| c == column).map(|(_, e)| *e)
}

fn reject_unknown_filters(filters: &[(String, &Expr)], allowed: &[&str]) -> Result<(), SqlError> {
    match filters.iter().find(|(c, _)| !allowed.contains(&c.as_str())) {
        Some((c, _)) => Err(SqlError::UnknownColumn(c.clone())),
        None => Ok(()),
    }
}

// ── Helpers ───────────────────────────────────────────────────

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
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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

/// Pair the single VALUES row with column names: the explicit column list when
/// present, otherwise `defaults` in order.
fn named_row(insert: &ast::Insert, defaults: &[&str]) -> Result<Vec<(String, Expr)>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let values = match body.body.as_ref() {
        SetExpr::Values(values) => values,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    let row = match values.rows.as_slice() {
        [] => return Err(SqlError::Parse("empty VALUES".into())),
        [row] => row,
        _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
    };

    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if row.len() > columns.len() || (!insert.columns.is_empty() && row.len() != columns.len()) {
        return Err(SqlError::WrongArity(columns.len(), row.len()));
    }
    for c in &columns {
        if !defaults.contains(&c.as_str()) {
            return Err(SqlError::UnknownColumn(c.clone()));
        }
    }
    Ok(columns.into_iter().zip(row.iter().cloned()).collect())
}

fn optional<'a>(row: &'a [(String, Expr)], column: &str) -> Option<&'a Expr> {
    row.iter().find(|(c, _)| c == column).map(|(_, e)| e)
}

fn required<'a>(row: &'a [(String, Expr)], column: &'static str) -> Result<&'a Expr, SqlError> {
    optional(row, column).ok_or(SqlError::MissingColumn(column))
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
            Ulid::from_string(s).map_err(|e| SqlError::InvalidValue(format!("bad ULID {s:?}: {e}")))
        }
        Some(value) => Err(SqlError::InvalidValue(format!("expected ULID string, got {value}"))),
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
        Some(value) => Err(SqlError::InvalidValue(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::InvalidValue(format!("bad integer {s}: {e}"))),
            _ => Err(SqlError::InvalidValue(format!("expected number, got {value}"))),
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

/// Unix milliseconds, or a string holding either milliseconds, an RFC 3339
/// instant, or `YYYY-MM-DD HH:MM:SS` read as UTC.
fn parse_timestamp(expr: &Expr) -> Result<Ms, SqlError> {
    let Some(Value::SingleQuotedString(s)) = extract_value(expr) else {
        return parse_i64(expr);
    };
    let s = s.trim();
    if let Ok(ms) = s.parse::<i64>() {
        return Ok(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|dt| dt.and_utc().timestamp_millis())
        .map_err(|e| SqlError::InvalidValue(format!("bad timestamp {s:?}: {e}")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::InvalidValue(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::InvalidValue(format!("expected bool, got {value}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_status(expr: &Expr) -> Result<BookingStatus, SqlError> {
    parse_string(expr)?
        .parse()
        .map_err(|e: UnknownStatus| SqlError::InvalidValue(e.to_string()))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("expected {0} values, got {1}")]
    WrongArity(usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

impl SqlError {
    /// SQLSTATE reported to the client.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            SqlError::UnknownTable(_) => "42P01",
            SqlError::UnknownColumn(_) => "42703",
            SqlError::InvalidValue(_) => "22023",
            _ => "42601",
        }
    }
}
