use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertRoom {
        room_type: String,
        price: Price,
        description: Option<String>,
        photo_url: String,
    },
    UpdateRoom {
        id: Ulid,
        update: RoomUpdate,
    },
    DeleteRoom {
        id: Ulid,
    },
    InsertBooking {
        room_id: Ulid,
        check_in: Date,
        check_out: Date,
        guest: String,
    },
    DeleteBooking {
        id: Ulid,
    },
    /// `window: None` lists rooms free from today on.
    SelectAvailableRooms {
        window: Option<(Date, Date)>,
        room_type: Option<String>,
    },
    /// `id: Some` asks for the room detail with its bookings.
    SelectRooms {
        id: Option<Ulid>,
    },
    SelectRoomTypes,
    SelectBookings {
        filter: BookingFilter,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingFilter {
    All,
    Room(Ulid),
    ConfirmationCode(String),
    Guest(String),
}

const ROOM_COLUMNS: &[&str] = &["room_type", "price", "description", "photo_url"];
const ROOM_UPDATE_COLUMNS: &[&str] = &["id", "room_type", "price", "description", "photo_url"];
const BOOKING_COLUMNS: &[&str] = &["room_id", "check_in", "check_out", "guest"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(first) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match first {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "rooms" => {
            let row = InsertRow::new(insert, "rooms", ROOM_COLUMNS)?;
            Ok(Command::InsertRoom {
                room_type: row.required("room_type", parse_text)?,
                price: row.required("price", parse_price)?,
                description: row.optional("description", parse_text)?,
                photo_url: row.required("photo_url", parse_text)?,
            })
        }
        "room_updates" => {
            let row = InsertRow::new(insert, "room_updates", ROOM_UPDATE_COLUMNS)?;
            Ok(Command::UpdateRoom {
                id: row.required("id", parse_ulid)?,
                update: RoomUpdate {
                    room_type: row.optional("room_type", parse_text)?,
                    price: row.optional("price", parse_price)?,
                    description: row.optional("description", parse_text)?,
                    photo_url: row.optional("photo_url", parse_text)?,
                },
            })
        }
        "bookings" => {
            let row = InsertRow::new(insert, "bookings", BOOKING_COLUMNS)?;
            Ok(Command::InsertBooking {
                room_id: row.required("room_id", parse_ulid)?,
                check_in: row.required("check_in", parse_date)?,
                check_out: row.required("check_out", parse_date)?,
                guest: row.required("guest", parse_text)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = equality_filters(delete.selection.as_ref())?;
    let id = match filters.as_slice() {
        [(col, expr)] if col == "id" => parse_ulid(expr)?,
        _ => return Err(SqlError::MissingFilter("id")),
    };

    match table.as_str() {
        "rooms" => Ok(Command::DeleteRoom { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
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
    let filters = equality_filters(select.selection.as_ref())?;

    match table.as_str() {
        "available_rooms" => parse_available_rooms(&filters),
        "rooms" => match filters.as_slice() {
            [] => Ok(Command::SelectRooms { id: None }),
            [(col, expr)] if col == "id" => Ok(Command::SelectRooms {
                id: Some(parse_ulid(expr)?),
            }),
            _ => Err(SqlError::Unsupported("rooms can only be filtered by id".into())),
        },
        "room_types" => match filters.as_slice() {
            [] => Ok(Command::SelectRoomTypes),
            _ => Err(SqlError::Unsupported("room_types takes no filter".into())),
        },
        "bookings" => {
            let filter = match filters.as_slice() {
                [] => BookingFilter::All,
                [(col, expr)] => match col.as_str() {
                    "room_id" => BookingFilter::Room(parse_ulid(expr)?),
                    "confirmation_code" => BookingFilter::ConfirmationCode(parse_text(expr)?),
                    "guest" => BookingFilter::Guest(parse_text(expr)?),
                    other => return Err(SqlError::UnknownColumn(other.to_string())),
                },
                _ => {
                    return Err(SqlError::Unsupported(
                        "bookings take at most one filter".into(),
                    ));
                }
            };
            Ok(Command::SelectBookings { filter })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_available_rooms(filters: &[(String, &Expr)]) -> Result<Command, SqlError> {
    let (mut check_in, mut check_out, mut room_type) = (None, None, None);
    for (col, expr) in filters {
        match col.as_str() {
            "check_in" => check_in = Some(parse_date(expr)?),
            "check_out" => check_out = Some(parse_date(expr)?),
            "room_type" => room_type = Some(parse_text(expr)?),
            other => return Err(SqlError::UnknownColumn(other.to_string())),
        }
    }

    let window = match (check_in, check_out) {
        (Some(a), Some(b)) => Some((a, b)),
        (None, None) if room_type.is_none() => None,
        (None, _) => return Err(SqlError::MissingFilter("check_in")),
        (Some(_), None) => return Err(SqlError::MissingFilter("check_out")),
    };
    Ok(Command::SelectAvailableRooms { window, room_type })
}

/// Flatten `a = x AND b = y ...` into `(column, value)` pairs.
fn equality_filters(selection: Option<&Expr>) -> Result<Vec<(String, &Expr)>, SqlError> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        collect_equalities(expr, &mut out)?;
    }
    Ok(out)
}

fn collect_equalities<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_equalities(inner, out),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_equalities(left, out)?;
                collect_equalities(right, out)
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
                out.push((col, right.as_ref()));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("operator {other}"))),
        },
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── INSERT rows ───────────────────────────────────────────────

/// The single VALUES row of an INSERT, keyed by column name.
/// Without an explicit column list, values bind to `defaults` in order.
struct InsertRow<'a> {
    table: &'static str,
    fields: Vec<(String, &'a Expr)>,
}

impl<'a> InsertRow<'a> {
    fn new(
        insert: &'a ast::Insert,
        table: &'static str,
        defaults: &'static [&'static str],
    ) -> Result<Self, SqlError> {
        let body = insert
            .source
            .as_ref()
            .ok_or(SqlError::Parse("no VALUES".into()))?;
        let rows = match body.body.as_ref() {
            SetExpr::Values(values) => &values.rows,
            _ => return Err(SqlError::Parse("expected VALUES".into())),
        };
        let values = match rows.as_slice() {
            [row] => row,
            [] => return Err(SqlError::Parse("empty VALUES".into())),
            _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
        };

        let columns: Vec<String> = if insert.columns.is_empty() {
            defaults.iter().map(|c| c.to_string()).collect()
        } else {
            insert
                .columns
                .iter()
                .map(|c| c.to_string().trim_matches('"').to_lowercase())
                .collect()
        };
        if values.len() != columns.len() {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
        if let Some(unknown) = columns.iter().find(|c| !defaults.contains(&c.as_str())) {
            return Err(SqlError::UnknownColumn(unknown.clone()));
        }

        Ok(Self {
            table,
            fields: columns.into_iter().zip(values.iter()).collect(),
        })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.fields
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, e)| *e)
    }

    /// Absent or NULL is `None`.
    fn optional<T>(
        &self,
        column: &str,
        parse: impl Fn(&Expr) -> Result<T, SqlError>,
    ) -> Result<Option<T>, SqlError> {
        match self.get(column) {
            None => Ok(None),
            Some(expr) if is_null(expr) => Ok(None),
            Some(expr) => parse(expr).map(Some),
        }
    }

    fn required<T>(
        &self,
        column: &'static str,
        parse: impl Fn(&Expr) -> Result<T, SqlError>,
    ) -> Result<T, SqlError> {
        self.optional(column, parse)?
            .ok_or(SqlError::MissingColumn(self.table, column))
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_text(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s}: {e}")))
}

fn parse_date(expr: &Expr) -> Result<Date, SqlError> {
    let s = parse_text(expr)?;
    Date::parse_from_str(&s, "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")))
}

/// Accepts `149.99` or `'149.99'`.
fn parse_price(expr: &Expr) -> Result<Price, SqlError> {
    let text = match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s,
        Some(other) => return Err(SqlError::Parse(format!("expected price, got {other}"))),
        None => return Err(SqlError::Parse(format!("expected value, got {expr}"))),
    };
    text.parse()
        .map_err(|e| SqlError::Parse(format!("{e} ({text})")))
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
            SqlError::MissingColumn(t, col) => write!(f, "{t}: {col} is required"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
