use std::collections::HashMap;

use chrono::{DateTime, NaiveDate};
use sqlparser::ast::{
    self, AssignmentTarget, BinaryOperator, Expr, FromTable, LimitClause, ObjectNamePart, SetExpr,
    Statement, TableFactor, TableObject, UnaryOperator, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource(NewResource),
    UpdateResource { id: Ulid, patch: ResourcePatch },
    DeleteResource { id: Ulid },
    SelectResource { id: Ulid },
    SelectResources(ResourceFilter),
    InsertBooking(NewBooking),
    UpdateBooking { id: Ulid, patch: BookingPatch },
    CancelBooking { id: Ulid },
    CompleteBooking { id: Ulid },
    DeleteBooking { id: Ulid },
    SelectBooking { id: Ulid },
    SelectBookings(BookingFilter),
    SelectAvailability { resource_id: Ulid, day: NaiveDate },
    SelectUtilization { resource_id: Ulid, start: Ms, end: Ms },
    SelectUpcoming { user_id: String, days: Option<u32> },
    SelectConflicts {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    },
}

/// Shape of the rows a query returns, decided from the statement alone so
/// prepared statements can be described before their parameters are bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    Resources,
    Bookings,
    Availability,
    Utilization,
}

const RESOURCE_COLUMNS: &[&str] = &["id", "name", "kind", "active", "metadata"];
const BOOKING_COLUMNS: &[&str] = &[
    "id",
    "resource_id",
    "start",
    "end",
    "user_id",
    "company_id",
    "store_id",
    "priority",
    "title",
    "metadata",
];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let stmts = parse_statements(sql)?;
    match &stmts[0] {
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

pub fn result_shape(sql: &str) -> Option<ResultShape> {
    let stmts = parse_statements(sql).ok()?;
    let Statement::Query(query) = &stmts[0] else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    let table = table_factor_name(&select.from.first()?.relation).ok()?;
    match table.as_str() {
        "resources" => Some(ResultShape::Resources),
        "bookings" | "upcoming_bookings" | "conflicts" => Some(ResultShape::Bookings),
        "availability" => Some(ResultShape::Availability),
        "utilization" => Some(ResultShape::Utilization),
        _ => None,
    }
}

fn parse_statements(sql: &str) -> Result<Vec<Statement>, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    Ok(stmts)
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let given: Vec<String> = insert
        .columns
        .iter()
        .map(|c| c.value.to_lowercase())
        .collect();

    match table.as_str() {
        "resources" => {
            let row = Row::new("resources", RESOURCE_COLUMNS, &given, &values)?;
            Ok(Command::InsertResource(NewResource {
                id: parse_ulid(row.required("id")?)?,
                name: parse_string(row.required("name")?)?,
                kind: row
                    .get("kind")
                    .map(parse_kind)
                    .transpose()?
                    .unwrap_or(ResourceKind::Other),
                active: row.get("active").map(parse_bool).transpose()?.unwrap_or(true),
                metadata: row
                    .get("metadata")
                    .map(parse_metadata)
                    .transpose()?
                    .unwrap_or_default(),
            }))
        }
        "bookings" => {
            let row = Row::new("bookings", BOOKING_COLUMNS, &given, &values)?;
            Ok(Command::InsertBooking(NewBooking {
                id: parse_ulid(row.required("id")?)?,
                resource_id: parse_ulid(row.required("resource_id")?)?,
                start: parse_timestamp(row.required("start")?)?,
                end: parse_timestamp(row.required("end")?)?,
                requester: Requester {
                    user_id: row.get("user_id").map(parse_string_or_null).transpose()?.flatten(),
                    company_id: row
                        .get("company_id")
                        .map(parse_string_or_null)
                        .transpose()?
                        .flatten(),
                    store_id: row.get("store_id").map(parse_string_or_null).transpose()?.flatten(),
                },
                priority: row.get("priority").map(parse_i32).transpose()?,
                title: row.get("title").map(parse_string_or_null).transpose()?.flatten(),
                metadata: row
                    .get("metadata")
                    .map(parse_metadata)
                    .transpose()?
                    .unwrap_or_default(),
            }))
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// One VALUES row keyed by column name. Without a column list the table's
/// default column order applies.
struct Row<'a> {
    values: HashMap<String, &'a Expr>,
}

impl<'a> Row<'a> {
    fn new(
        table: &'static str,
        known: &[&str],
        given: &[String],
        values: &'a [Expr],
    ) -> Result<Self, SqlError> {
        let columns: Vec<String> = if given.is_empty() {
            known.iter().take(values.len()).map(|c| c.to_string()).collect()
        } else {
            given.to_vec()
        };
        if columns.len() != values.len() {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
        if let Some(unknown) = columns.iter().find(|c| !known.contains(&c.as_str())) {
            return Err(SqlError::UnknownColumn(unknown.clone()));
        }
        Ok(Self {
            values: columns.into_iter().zip(values.iter()).collect(),
        })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.values.get(column).copied()
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;
    let mut sets = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        sets.push((column, &assignment.value));
    }

    match table.as_str() {
        "resources" => {
            let mut patch = ResourcePatch::default();
            for (column, value) in sets {
                match column.as_str() {
                    "name" => patch.name = Some(parse_string(value)?),
                    "kind" => patch.kind = Some(parse_kind(value)?),
                    "active" => patch.active = Some(parse_bool(value)?),
                    "metadata" => patch.metadata = Some(parse_metadata(value)?),
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            Ok(Command::UpdateResource { id, patch })
        }
        "bookings" => {
            if let Some((_, status)) = sets.iter().find(|(c, _)| c == "status") {
                if sets.len() > 1 {
                    return Err(SqlError::Unsupported(
                        "status must be updated on its own".into(),
                    ));
                }
                return match parse_status(status)? {
                    BookingStatus::Cancelled => Ok(Command::CancelBooking { id }),
                    BookingStatus::Completed => Ok(Command::CompleteBooking { id }),
                    BookingStatus::Confirmed => Err(SqlError::Unsupported(
                        "bookings cannot return to confirmed".into(),
                    )),
                };
            }

            let mut patch = BookingPatch::default();
            for (column, value) in sets {
                match column.as_str() {
                    "start" => patch.start = Some(parse_timestamp(value)?),
                    "end" => patch.end = Some(parse_timestamp(value)?),
                    "priority" => patch.priority = Some(parse_i32(value)?),
                    "title" => patch.title = Some(parse_string_or_null(value)?),
                    "metadata" => patch.metadata = Some(parse_metadata(value)?),
                    "user_id" => patch.user_id = Some(parse_string_or_null(value)?),
                    "company_id" => patch.company_id = Some(parse_string_or_null(value)?),
                    "store_id" => patch.store_id = Some(parse_string_or_null(value)?),
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            Ok(Command::UpdateBooking { id, patch })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "resources" => Ok(Command::DeleteResource { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    GtEq,
    LtEq,
}

/// `column op value`, one conjunct of a WHERE clause.
struct Predicate<'a> {
    column: String,
    op: Op,
    value: &'a Expr,
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

    let mut predicates = Vec::new();
    if let Some(selection) = &select.selection {
        collect_predicates(selection, &mut predicates)?;
    }
    let page = parse_page(query)?;

    match table.as_str() {
        "resources" => select_resources(&predicates, page),
        "bookings" => select_bookings(&predicates, page),
        "availability" => {
            let (mut resource_id, mut day) = (None, None);
            for p in &predicates {
                match (p.column.as_str(), p.op) {
                    ("resource_id", Op::Eq) => resource_id = Some(parse_ulid(p.value)?),
                    ("day", Op::Eq) => day = Some(parse_date(p.value)?),
                    _ => return Err(unsupported_filter(p)),
                }
            }
            Ok(Command::SelectAvailability {
                resource_id: resource_id.ok_or(SqlError::MissingFilter("resource_id"))?,
                day: day.ok_or(SqlError::MissingFilter("day"))?,
            })
        }
        "utilization" => {
            let (mut resource_id, mut start, mut end) = (None, None, None);
            for p in &predicates {
                match (p.column.as_str(), p.op) {
                    ("resource_id", Op::Eq) => resource_id = Some(parse_ulid(p.value)?),
                    ("start", Op::GtEq) => start = Some(parse_timestamp(p.value)?),
                    ("end", Op::LtEq) => end = Some(parse_timestamp(p.value)?),
                    _ => return Err(unsupported_filter(p)),
                }
            }
            Ok(Command::SelectUtilization {
                resource_id: resource_id.ok_or(SqlError::MissingFilter("resource_id"))?,
                start: start.ok_or(SqlError::MissingFilter("start"))?,
                end: end.ok_or(SqlError::MissingFilter("end"))?,
            })
        }
        "upcoming_bookings" => {
            let (mut user_id, mut days) = (None, None);
            for p in &predicates {
                match (p.column.as_str(), p.op) {
                    ("user_id", Op::Eq) => user_id = Some(parse_string(p.value)?),
                    ("days", Op::Eq) => days = Some(parse_u32(p.value)?),
                    _ => return Err(unsupported_filter(p)),
                }
            }
            Ok(Command::SelectUpcoming {
                user_id: user_id.ok_or(SqlError::MissingFilter("user_id"))?,
                days,
            })
        }
        "conflicts" => {
            let (mut resource_id, mut start, mut end, mut exclude) = (None, None, None, None);
            for p in &predicates {
                match (p.column.as_str(), p.op) {
                    ("resource_id", Op::Eq) => resource_id = Some(parse_ulid(p.value)?),
                    ("start", Op::Eq) => start = Some(parse_timestamp(p.value)?),
                    ("end", Op::Eq) => end = Some(parse_timestamp(p.value)?),
                    ("exclude_id", Op::Eq) => exclude = parse_ulid_or_null(p.value)?,
                    _ => return Err(unsupported_filter(p)),
                }
            }
            Ok(Command::SelectConflicts {
                resource_id: resource_id.ok_or(SqlError::MissingFilter("resource_id"))?,
                start: start.ok_or(SqlError::MissingFilter("start"))?,
                end: end.ok_or(SqlError::MissingFilter("end"))?,
                exclude,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn select_resources(predicates: &[Predicate<'_>], page: PageRequest) -> Result<Command, SqlError> {
    let mut filter = ResourceFilter {
        page,
        ..Default::default()
    };
    for p in predicates {
        match (p.column.as_str(), p.op) {
            ("id", Op::Eq) if predicates.len() == 1 => {
                return Ok(Command::SelectResource {
                    id: parse_ulid(p.value)?,
                });
            }
            ("kind", Op::Eq) => filter.kind = Some(parse_kind(p.value)?),
            ("active", Op::Eq) => filter.active = Some(parse_bool(p.value)?),
            _ => return Err(unsupported_filter(p)),
        }
    }
    Ok(Command::SelectResources(filter))
}

fn select_bookings(predicates: &[Predicate<'_>], page: PageRequest) -> Result<Command, SqlError> {
    let mut filter = BookingFilter {
        page,
        ..Default::default()
    };
    for p in predicates {
        match (p.column.as_str(), p.op) {
            ("id", Op::Eq) if predicates.len() == 1 => {
                return Ok(Command::SelectBooking {
                    id: parse_ulid(p.value)?,
                });
            }
            ("company_id", Op::Eq) => filter.company_id = Some(parse_string(p.value)?),
            ("store_id", Op::Eq) => filter.store_id = Some(parse_string(p.value)?),
            ("user_id", Op::Eq) => filter.user_id = Some(parse_string(p.value)?),
            ("resource_id", Op::Eq) => filter.resource_id = Some(parse_ulid(p.value)?),
            ("resource_kind", Op::Eq) => filter.resource_kind = Some(parse_kind(p.value)?),
            ("status", Op::Eq) => filter.status = Some(parse_status(p.value)?),
            ("start", Op::GtEq) => filter.from = Some(parse_timestamp(p.value)?),
            ("start", Op::LtEq) => filter.to = Some(parse_timestamp(p.value)?),
            _ => return Err(unsupported_filter(p)),
        }
    }
    Ok(Command::SelectBookings(filter))
}

fn collect_predicates<'a>(expr: &'a Expr, out: &mut Vec<Predicate<'a>>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_predicates(inner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_predicates(left, out)?;
            collect_predicates(right, out)
        }
        Expr::BinaryOp { left, op, right } => {
            let op = match op {
                BinaryOperator::Eq => Op::Eq,
                BinaryOperator::GtEq => Op::GtEq,
                BinaryOperator::LtEq => Op::LtEq,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push(Predicate {
                column,
                op,
                value: right,
            });
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

fn unsupported_filter(p: &Predicate<'_>) -> SqlError {
    let op = match p.op {
        Op::Eq => "=",
        Op::GtEq => ">=",
        Op::LtEq => "<=",
    };
    SqlError::Unsupported(format!("filter {} {op}", p.column))
}

fn parse_page(query: &ast::Query) -> Result<PageRequest, SqlError> {
    let mut page = PageRequest::default();
    match &query.limit_clause {
        None => {}
        Some(LimitClause::LimitOffset { limit, offset, .. }) => {
            if let Some(limit) = limit {
                page.limit = Some(parse_usize(limit)?);
            }
            if let Some(offset) = offset {
                page.offset = Some(parse_usize(&offset.value)?);
            }
        }
        Some(LimitClause::OffsetCommaLimit { offset, limit }) => {
            page.limit = Some(parse_usize(limit)?);
            page.offset = Some(parse_usize(offset)?);
        }
    }
    Ok(page)
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
            op: BinaryOperator::Eq,
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

/// Text of a literal; numbers are accepted wherever a string is.
fn literal_text(expr: &Expr) -> Result<Option<&str>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(Some(s)),
        Some(other) => Err(SqlError::Parse(format!("expected literal, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_string_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    Ok(literal_text(expr)?.map(str::to_string))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_or_null(expr)?.ok_or_else(|| SqlError::Parse("expected ULID, got NULL".into()))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    literal_text(expr)?
        .map(|s| Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}"))))
        .transpose()
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    let text = literal_text(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))?;
    text.parse()
        .map_err(|e| SqlError::Parse(format!("bad integer {text}: {e}")))
}

fn parse_i32(expr: &Expr) -> Result<i32, SqlError> {
    let v = parse_i64(expr)?;
    i32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of i32 range")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_usize(expr: &Expr) -> Result<usize, SqlError> {
    let v = parse_i64(expr)?;
    usize::try_from(v).map_err(|_| SqlError::Parse(format!("{v} is negative")))
}

/// Unix milliseconds, given as an integer or as an RFC 3339 string.
fn parse_timestamp(expr: &Expr) -> Result<Ms, SqlError> {
    if let Ok(ms) = parse_i64(expr) {
        return Ok(ms);
    }
    let text = literal_text(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))?;
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| SqlError::Parse(format!("bad timestamp {text}: {e}")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let text = parse_string(expr)?;
    NaiveDate::parse_from_str(&text, "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {text}: {e}")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_kind(expr: &Expr) -> Result<ResourceKind, SqlError> {
    parse_string(expr)?.parse().map_err(SqlError::Parse)
}

fn parse_status(expr: &Expr) -> Result<BookingStatus, SqlError> {
    parse_string(expr)?.parse().map_err(SqlError::Parse)
}

/// A JSON object of strings, e.g. `'{"plate":"KA-123"}'`. NULL means empty.
fn parse_metadata(expr: &Expr) -> Result<Metadata, SqlError> {
    match literal_text(expr)? {
        None => Ok(Metadata::new()),
        Some(text) => serde_json::from_str(text)
            .map_err(|e| SqlError::Parse(format!("bad metadata: {e}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

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
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const OTHER: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    #[test]
    fn parse_insert_resource() {
        let sql = format!(
            "INSERT INTO resources (id, name, kind, active, metadata) \
             VALUES ('{ID}', 'Van 3', 'vehicle', false, '{{\"plate\":\"KA-123\"}}')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertResource(r) => {
                assert_eq!(r.id, ulid(ID));
                assert_eq!(r.name, "Van 3");
                assert_eq!(r.kind, ResourceKind::Vehicle);
                assert!(!r.active);
                assert_eq!(r.metadata.get("plate").map(String::as_str), Some("KA-123"));
            }
            cmd => panic!("expected InsertResource, got {cmd:?}"),
        }
    }

    #[test]
    fn insert_resource_defaults() {
        let sql = format!("INSERT INTO resources (id, name) VALUES ('{ID}', 'Crane')");
        match parse_sql(&sql).unwrap() {
            Command::InsertResource(r) => {
                assert_eq!(r.kind, ResourceKind::Other);
                assert!(r.active);
                assert!(r.metadata.is_empty());
            }
            cmd => panic!("expected InsertResource, got {cmd:?}"),
        }
    }

    #[test]
    fn insert_without_column_list_is_positional() {
        let sql = format!("INSERT INTO resources VALUES ('{ID}', 'Crane', 'equipment')");
        match parse_sql(&sql).unwrap() {
            Command::InsertResource(r) => {
                assert_eq!(r.name, "Crane");
                assert_eq!(r.kind, ResourceKind::Equipment);
            }
            cmd => panic!("expected InsertResource, got {cmd:?}"),
        }
    }

    #[test]
    fn insert_resource_requires_name() {
        let sql = format!("INSERT INTO resources (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingColumn("name"))));
    }

    #[test]
    fn parse_insert_booking_with_rfc3339() {
        let sql = format!(
            r#"INSERT INTO bookings (id, resource_id, start, "end", user_id, priority, title)
               VALUES ('{ID}', '{OTHER}', '2025-01-10T09:00:00Z', 1736506800000, 'u-1', 3, NULL)"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBooking(b) => {
                assert_eq!(b.id, ulid(ID));
                assert_eq!(b.resource_id, ulid(OTHER));
                assert_eq!(b.start, 1_736_499_600_000);
                assert_eq!(b.end, 1_736_506_800_000);
                assert_eq!(b.requester.user_id.as_deref(), Some("u-1"));
                assert_eq!(b.requester.company_id, None);
                assert_eq!(b.priority, Some(3));
                assert_eq!(b.title, None);
            }
            cmd => panic!("expected InsertBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn insert_rejects_unknown_column_and_arity() {
        let sql = format!("INSERT INTO resources (id, colour) VALUES ('{ID}', 'red')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn(c)) if c == "colour"));

        let sql = format!("INSERT INTO resources (id, name) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::WrongArity("resources", 2, 1))));
    }

    #[test]
    fn multi_row_insert_unsupported() {
        let sql = format!(
            "INSERT INTO resources (id, name) VALUES ('{ID}', 'a'), ('{OTHER}', 'b')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_update_resource() {
        let sql = format!("UPDATE resources SET active = false, name = 'Crane 2' WHERE id = '{ID}'");
        match parse_sql(&sql).unwrap() {
            Command::UpdateResource { id, patch } => {
                assert_eq!(id, ulid(ID));
                assert_eq!(patch.active, Some(false));
                assert_eq!(patch.name.as_deref(), Some("Crane 2"));
                assert_eq!(patch.kind, None);
            }
            cmd => panic!("expected UpdateResource, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_update_booking_fields() {
        let sql = format!(
            r#"UPDATE bookings SET start = 1000, "end" = 2000, title = NULL, store_id = 's-9' WHERE id = '{ID}'"#
        );
        match parse_sql(&sql).unwrap() {
            Command::UpdateBooking { patch, .. } => {
                assert_eq!(patch.start, Some(1000));
                assert_eq!(patch.end, Some(2000));
                assert_eq!(patch.title, Some(None));
                assert_eq!(patch.store_id, Some(Some("s-9".into())));
                assert_eq!(patch.user_id, None);
            }
            cmd => panic!("expected UpdateBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn status_update_maps_to_transitions() {
        let cancel = format!("UPDATE bookings SET status = 'cancelled' WHERE id = '{ID}'");
        assert_eq!(parse_sql(&cancel).unwrap(), Command::CancelBooking { id: ulid(ID) });

        let complete = format!("UPDATE bookings SET status = 'completed' WHERE id = '{ID}'");
        assert_eq!(parse_sql(&complete).unwrap(), Command::CompleteBooking { id: ulid(ID) });

        let back = format!("UPDATE bookings SET status = 'confirmed' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&back), Err(SqlError::Unsupported(_))));

        let mixed = format!("UPDATE bookings SET status = 'cancelled', priority = 1 WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&mixed), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn update_requires_id() {
        assert!(matches!(
            parse_sql("UPDATE resources SET name = 'x'"),
            Err(SqlError::MissingFilter("id"))
        ));
    }

    #[test]
    fn parse_deletes() {
        let sql = format!("DELETE FROM resources WHERE id = '{ID}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteResource { id: ulid(ID) });
        let sql = format!("DELETE FROM bookings WHERE id = '{ID}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteBooking { id: ulid(ID) });
    }

    #[test]
    fn select_resources_with_filters_and_paging() {
        let sql = "SELECT * FROM resources WHERE kind = 'room' AND active = true LIMIT 5 OFFSET 10";
        match parse_sql(sql).unwrap() {
            Command::SelectResources(f) => {
                assert_eq!(f.kind, Some(ResourceKind::Room));
                assert_eq!(f.active, Some(true));
                assert_eq!(f.page.limit, Some(5));
                assert_eq!(f.page.offset, Some(10));
            }
            cmd => panic!("expected SelectResources, got {cmd:?}"),
        }
        assert_eq!(
            parse_sql(&format!("SELECT * FROM resources WHERE id = '{ID}'")).unwrap(),
            Command::SelectResource { id: ulid(ID) }
        );
    }

    #[test]
    fn select_bookings_filters() {
        let sql = format!(
            "SELECT * FROM bookings WHERE company_id = 'acme' AND resource_id = '{ID}' \
             AND status = 'confirmed' AND resource_kind = 'crew' \
             AND start >= 1000 AND start <= '2025-01-10T00:00:00+09:00'"
        );
        match parse_sql(&sql).unwrap() {
            Command::SelectBookings(f) => {
                assert_eq!(f.company_id.as_deref(), Some("acme"));
                assert_eq!(f.resource_id, Some(ulid(ID)));
                assert_eq!(f.status, Some(BookingStatus::Confirmed));
                assert_eq!(f.resource_kind, Some(ResourceKind::Crew));
                assert_eq!(f.from, Some(1000));
                assert_eq!(f.to, Some(1_736_434_800_000));
                assert_eq!(f.page, PageRequest::default());
            }
            cmd => panic!("expected SelectBookings, got {cmd:?}"),
        }
    }

    #[test]
    fn select_rejects_unknown_filters() {
        assert!(matches!(
            parse_sql("SELECT * FROM bookings WHERE colour = 'red'"),
            Err(SqlError::Unsupported(_))
        ));
        assert!(matches!(
            parse_sql("SELECT * FROM bookings WHERE priority > 3"),
            Err(SqlError::Unsupported(_))
        ));
    }

    #[test]
    fn select_availability_for_a_day() {
        let sql = format!(
            "SELECT * FROM availability WHERE resource_id = '{ID}' AND day = '2025-01-10'"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectAvailability {
                resource_id: ulid(ID),
                day: NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(),
            }
        );
        let missing = format!("SELECT * FROM availability WHERE resource_id = '{ID}'");
        assert!(matches!(parse_sql(&missing), Err(SqlError::MissingFilter("day"))));
    }

    #[test]
    fn select_utilization() {
        let sql = format!(
            r#"SELECT * FROM utilization WHERE resource_id = '{ID}' AND start >= 0 AND "end" <= 86400000"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectUtilization {
                resource_id: ulid(ID),
                start: 0,
                end: 86_400_000,
            }
        );
    }

    #[test]
    fn select_upcoming_and_conflicts() {
        assert_eq!(
            parse_sql("SELECT * FROM upcoming_bookings WHERE user_id = 'u-1' AND days = 14").unwrap(),
            Command::SelectUpcoming {
                user_id: "u-1".into(),
                days: Some(14),
            }
        );
        let sql = format!(
            r#"SELECT * FROM conflicts WHERE resource_id = '{ID}' AND start = 10 AND "end" = 20 AND exclude_id = '{OTHER}'"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectConflicts {
                resource_id: ulid(ID),
                start: 10,
                end: 20,
                exclude: Some(ulid(OTHER)),
            }
        );
    }

    #[test]
    fn result_shapes() {
        assert_eq!(result_shape("SELECT * FROM resources"), Some(ResultShape::Resources));
        assert_eq!(
            result_shape("SELECT * FROM conflicts WHERE resource_id = $1"),
            Some(ResultShape::Bookings)
        );
        assert_eq!(
            result_shape("SELECT * FROM availability WHERE day = $2"),
            Some(ResultShape::Availability)
        );
        assert_eq!(result_shape("DELETE FROM bookings WHERE id = $1"), None);
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(t)) if t == "foobar"));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
