use chrono::NaiveDate;
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertRoom {
        id: Ulid,
        hotel_id: Ulid,
        capacity: u32,
        price_cents: u64,
        number: Option<String>,
    },
    /// Book as the session user.
    InsertBooking {
        room_id: Ulid,
        from: Ms,
        to: Ms,
    },
    /// `id = None` lists every booking of the session user.
    SelectBookings {
        id: Option<Ulid>,
    },
    /// Cancels; the row stays with status `cancelled`.
    DeleteBooking {
        id: Ulid,
    },
    SelectAvailability {
        room_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectRooms {
        hotel_id: Ulid,
        start: Ms,
        end: Ms,
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
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

const ROOM_COLUMNS: &[&str] = &["id", "hotel_id", "capacity", "price_cents", "number"];
const BOOKING_COLUMNS: &[&str] = &["room_id", "from", "to"];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "rooms" => {
            let row = InsertRow::new(ROOM_COLUMNS, &insert.columns, values)?;
            Ok(Command::InsertRoom {
                id: parse_ulid(row.require("id")?)?,
                hotel_id: parse_ulid(row.require("hotel_id")?)?,
                capacity: row.get("capacity").map(parse_u32).transpose()?.unwrap_or(1),
                price_cents: row.get("price_cents").map(parse_u64).transpose()?.unwrap_or(0),
                number: row
                    .get("number")
                    .map(parse_string_or_null)
                    .transpose()?
                    .flatten(),
            })
        }
        "bookings" => {
            let row = InsertRow::new(BOOKING_COLUMNS, &insert.columns, values)?;
            Ok(Command::InsertBooking {
                room_id: parse_ulid(row.require("room_id")?)?,
                from: parse_instant(row.require("from")?)?,
                to: parse_instant(row.require("to")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// One INSERT row keyed by column. Without a column list the table's
/// declared column order applies.
struct InsertRow {
    cells: Vec<(String, Expr)>,
}

impl InsertRow {
    fn new(known: &[&str], columns: &[ast::Ident], values: Vec<Expr>) -> Result<Self, SqlError> {
        let names: Vec<String> = if columns.is_empty() {
            if values.len() > known.len() {
                return Err(SqlError::Parse(format!(
                    "expected at most {} values, got {}",
                    known.len(),
                    values.len()
                )));
            }
            known.iter().map(|c| c.to_string()).collect()
        } else {
            columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if !columns.is_empty() && names.len() != values.len() {
            return Err(SqlError::Parse(format!(
                "{} columns but {} values",
                names.len(),
                values.len()
            )));
        }

        let mut cells: Vec<(String, Expr)> = Vec::with_capacity(values.len());
        for (name, value) in names.into_iter().zip(values) {
            if !known.contains(&name.as_str()) {
                return Err(SqlError::UnknownColumn(name));
            }
            if cells.iter().any(|(n, _)| *n == name) {
                return Err(SqlError::Parse(format!("column {name} given twice")));
            }
            cells.push((name, value));
        }
        Ok(Self { cells })
    }

    fn get(&self, column: &str) -> Option<&Expr> {
        self.cells.iter().find(|(n, _)| n == column).map(|(_, v)| v)
    }

    fn require(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    match table.as_str() {
        "bookings" => {
            let filters = Filters::collect(delete.selection.as_ref())?;
            Ok(Command::DeleteBooking {
                id: filters.id.ok_or(SqlError::MissingFilter("id"))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
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
    let filters = Filters::collect(select.selection.as_ref())?;

    match table.as_str() {
        "bookings" => Ok(Command::SelectBookings { id: filters.id }),
        "availability" => Ok(Command::SelectAvailability {
            room_id: filters.room_id.ok_or(SqlError::MissingFilter("room_id"))?,
            start: filters.start.ok_or(SqlError::MissingFilter("start"))?,
            end: filters.end.ok_or(SqlError::MissingFilter("end"))?,
        }),
        "rooms" => Ok(Command::SelectRooms {
            hotel_id: filters.hotel_id.ok_or(SqlError::MissingFilter("hotel_id"))?,
            start: filters.start.ok_or(SqlError::MissingFilter("start"))?,
            end: filters.end.ok_or(SqlError::MissingFilter("end"))?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Conjunction of `col = v`, `start >= v`, `"end" <= v` predicates.
#[derive(Debug, Default)]
struct Filters {
    id: Option<Ulid>,
    room_id: Option<Ulid>,
    hotel_id: Option<Ulid>,
    start: Option<Ms>,
    end: Option<Ms>,
}

impl Filters {
    fn collect(selection: Option<&Expr>) -> Result<Self, SqlError> {
        let mut filters = Self::default();
        if let Some(expr) = selection {
            filters.visit(expr)?;
        }
        Ok(filters)
    }

    fn visit(&mut self, expr: &Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.visit(inner),
            Expr::BinaryOp { left, op, right } => {
                let col = expr_column_name(left);
                match (op, col.as_deref()) {
                    (ast::BinaryOperator::And, _) => {
                        self.visit(left)?;
                        self.visit(right)
                    }
                    (ast::BinaryOperator::Eq, Some("id")) => {
                        self.id = Some(parse_ulid(right)?);
                        Ok(())
                    }
                    (ast::BinaryOperator::Eq, Some("room_id")) => {
                        self.room_id = Some(parse_ulid(right)?);
                        Ok(())
                    }
                    (ast::BinaryOperator::Eq, Some("hotel_id")) => {
                        self.hotel_id = Some(parse_ulid(right)?);
                        Ok(())
                    }
                    (ast::BinaryOperator::GtEq, Some("start")) => {
                        self.start = Some(parse_instant(right)?);
                        Ok(())
                    }
                    (ast::BinaryOperator::LtEq, Some("end")) => {
                        self.end = Some(parse_instant(right)?);
                        Ok(())
                    }
                    _ => Err(SqlError::Unsupported(format!("filter {expr}"))),
                }
            }
            _ => Err(SqlError::Unsupported(format!("filter {expr}"))),
        }
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

/// The single row of an `INSERT ... VALUES (...)`.
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

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => match expr {
            Expr::UnaryOp {
                op: ast::UnaryOperator::Minus,
                expr,
            } => Ok(-parse_i64(expr)?),
            _ => Err(SqlError::Parse(format!("expected value, got {expr}"))),
        },
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u64(expr: &Expr) -> Result<u64, SqlError> {
    let v = parse_i64(expr)?;
    u64::try_from(v).map_err(|_| SqlError::Parse(format!("{v} must not be negative")))
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(Value::Number(s, _)) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// Unix milliseconds, or a `'YYYY-MM-DD'` date meaning midnight UTC.
fn parse_instant(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && s.parse::<i64>().is_err()
    {
        let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")))?;
        return Ok(date_to_ms(date));
    }
    parse_i64(expr)
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    MissingColumn(&'static str),
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
            SqlError::MissingColumn(c) => write!(f, "missing column: {c}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
