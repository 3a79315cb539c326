use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input. Instants stay as text until the
/// organization timezone is known.
#[derive(Debug, PartialEq)]
pub enum Command {
    UpsertInstructor {
        id: Ulid,
        active: bool,
    },
    SelectInstructors,
    InsertBlackout {
        id: Option<Ulid>,
        instructor_id: Ulid,
        start: String,
        end: String,
        kind: BlackoutKind,
        reason: Option<String>,
    },
    DeleteBlackout {
        id: Ulid,
    },
    SelectBlackouts {
        instructor_id: Ulid,
    },
    CheckAvailability {
        instructor_ids: Vec<Ulid>,
        start: String,
        end: String,
        location_id: Ulid,
        exclude_booking_id: Option<Ulid>,
    },
    InsertBooking {
        id: Option<Ulid>,
        instructor_ids: Vec<Ulid>,
        start: String,
        end: String,
        location_id: Ulid,
        state: BookingState,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectBookings {
        filter: BookingFilter,
    },
}

#[derive(Debug, PartialEq)]
pub enum BookingFilter {
    Id(Ulid),
    Instructor(Ulid),
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let (name, columns) = insert_columns(&table)?;
    let row = InsertRow::new(insert, name, columns)?;

    match name {
        "instructors" => Ok(Command::UpsertInstructor {
            id: parse_ulid(row.required("id")?)?,
            active: row.optional("active").map(parse_bool).transpose()?.unwrap_or(true),
        }),
        "blackouts" => {
            let kind = match row.optional("kind") {
                Some(expr) => parse_blackout_kind(expr)?,
                None => BlackoutKind::Total,
            };
            Ok(Command::InsertBlackout {
                id: row.optional("id").map(parse_ulid_or_null).transpose()?.flatten(),
                instructor_id: parse_ulid(row.required("instructor_id")?)?,
                start: parse_string(row.required("start")?)?,
                end: parse_string(row.required("end")?)?,
                kind,
                reason: row.optional("reason").map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        "bookings" => {
            let state = match row.optional("state") {
                Some(expr) => parse_booking_state(expr)?,
                None => BookingState::Committed,
            };
            Ok(Command::InsertBooking {
                id: row.optional("id").map(parse_ulid_or_null).transpose()?.flatten(),
                instructor_ids: parse_ulid_list(row.required("instructor_ids")?)?,
                start: parse_string(row.required("start")?)?,
                end: parse_string(row.required("end")?)?,
                location_id: parse_ulid(row.required("location_id")?)?,
                state,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Insertable columns, in the order they are read when the statement names none.
fn insert_columns(table: &str) -> Result<(&'static str, &'static [&'static str]), SqlError> {
    match table {
        "instructors" => Ok(("instructors", &["id", "active"])),
        "blackouts" => Ok((
            "blackouts",
            &["id", "instructor_id", "start", "end", "kind", "reason"],
        )),
        "bookings" => Ok((
            "bookings",
            &["id", "instructor_ids", "start", "end", "location_id", "state"],
        )),
        _ => Err(SqlError::UnknownTable(table.to_string())),
    }
}

/// One VALUES row keyed by column name.
struct InsertRow {
    table: &'static str,
    cells: Vec<(String, Expr)>,
}

impl InsertRow {
    fn new(
        insert: &ast::Insert,
        table: &'static str,
        defaults: &'static [&'static str],
    ) -> Result<Self, SqlError> {
        let values = extract_insert_values(insert)?;
        let columns: Vec<String> = if insert.columns.is_empty() {
            defaults.iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        // Positional rows may leave trailing optional columns out.
        if values.len() > columns.len() || (values.len() < columns.len() && !insert.columns.is_empty()) {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
        for col in &columns {
            if !defaults.contains(&col.as_str()) {
                return Err(SqlError::UnknownColumn(col.clone()));
            }
        }
        Ok(Self {
            table,
            cells: columns.into_iter().zip(values).collect(),
        })
    }

    fn optional(&self, column: &str) -> Option<&Expr> {
        self.cells.iter().find(|(c, _)| c == column).map(|(_, e)| e)
    }

    fn required(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.optional(column)
            .ok_or(SqlError::MissingColumn(self.table, column))
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "blackouts" => Ok(Command::DeleteBlackout { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
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

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let filter = |col: &str| filters.iter().find(|(c, _)| c == col).map(|(_, e)| e);
    let required = |col: &'static str| filter(col).ok_or(SqlError::MissingFilter(col));

    match table.as_str() {
        "instructors" => Ok(Command::SelectInstructors),
        "blackouts" => Ok(Command::SelectBlackouts {
            instructor_id: parse_ulid(required("instructor_id")?)?,
        }),
        "bookings" => {
            let filter = if let Some(id) = filter("id") {
                BookingFilter::Id(parse_ulid(id)?)
            } else if let Some(instructor) = filter("instructor_id") {
                BookingFilter::Instructor(parse_ulid(instructor)?)
            } else {
                return Err(SqlError::MissingFilter("id or instructor_id"));
            };
            Ok(Command::SelectBookings { filter })
        }
        "availability" => Ok(Command::CheckAvailability {
            instructor_ids: parse_ulid_list(required("instructor_ids")?)?,
            start: parse_string(required("start")?)?,
            end: parse_string(required("end")?)?,
            location_id: parse_ulid(required("location_id")?)?,
            exclude_booking_id: filter("exclude_booking_id")
                .map(parse_ulid_or_null)
                .transpose()?
                .flatten(),
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = x AND b = y AND ...` into column/value pairs.
fn collect_eq_filters(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_eq_filters(left, out)?;
                collect_eq_filters(right, out)
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.push((col, right.as_ref().clone()));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("operator {other} in WHERE"))),
        },
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
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

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
        _ => Err(SqlError::MissingFilter("id")),
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(s.trim()).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_ulid(expr).map(Some),
    }
}

/// `'id1,id2,...'` or `ARRAY['id1', 'id2']`.
fn parse_ulid_list(expr: &Expr) -> Result<Vec<Ulid>, SqlError> {
    if let Expr::Array(array) = expr {
        return array.elem.iter().map(parse_ulid).collect();
    }
    let s = parse_string(expr)?;
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            Ulid::from_string(part).map_err(|e| SqlError::Parse(format!("bad ULID {part:?}: {e}")))
        })
        .collect()
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

fn parse_blackout_kind(expr: &Expr) -> Result<BlackoutKind, SqlError> {
    match parse_string(expr)?.to_lowercase().as_str() {
        "total" => Ok(BlackoutKind::Total),
        "partial" => Ok(BlackoutKind::Partial),
        other => Err(SqlError::Parse(format!(
            "bad blackout kind {other:?}: expected 'total' or 'partial'"
        ))),
    }
}

fn parse_booking_state(expr: &Expr) -> Result<BookingState, SqlError> {
    match parse_string(expr)?.to_lowercase().as_str() {
        "committed" => Ok(BookingState::Committed),
        "tentative" => Ok(BookingState::Tentative),
        other => Err(SqlError::Parse(format!(
            "bad booking state {other:?}: expected 'committed' or 'tentative'"
        ))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing column {c}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
