use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::limits::DEFAULT_GRANULARITY_MINUTES;
use crate::model::*;
use crate::scheduling::BookingRequest;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertShop {
        shop: Shop,
    },
    InsertProvider {
        provider: Provider,
    },
    DeleteProvider {
        id: Ulid,
    },
    InsertService {
        service: ServiceOffering,
    },
    DeleteService {
        id: Ulid,
    },
    InsertAppointment(BookingRequest),
    /// Cancels; the appointment stays on record.
    DeleteAppointment {
        id: Ulid,
    },
    SelectSlots {
        shop: String,
        provider_id: Ulid,
        day: NaiveDate,
        duration_min: u32,
    },
    SelectAppointments {
        provider_id: Ulid,
        day: NaiveDate,
    },
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
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "shops" => {
            if values.len() < 5 {
                return Err(SqlError::WrongArity("shops", 5, values.len()));
            }
            let break_window = match (values.get(5), values.get(6)) {
                (None, None) => None,
                (Some(start), Some(end)) => {
                    match (parse_time_or_null(start, "break_start")?, parse_time_or_null(end, "break_end")?) {
                        (Some(start), Some(end)) => Some(BreakWindow { start, end }),
                        (None, None) => None,
                        _ => {
                            return Err(SqlError::BadValue(
                                "break_start",
                                "break_start and break_end go together".into(),
                            ));
                        }
                    }
                }
                _ => return Err(SqlError::WrongArity("shops with break", 7, values.len())),
            };
            let granularity_min = match values.get(7) {
                Some(v) => parse_u32_or_null(v, "granularity")?.unwrap_or(DEFAULT_GRANULARITY_MINUTES),
                None => DEFAULT_GRANULARITY_MINUTES,
            };
            let closed_days = match values.get(8) {
                Some(v) => parse_weekdays(v)?,
                None => Vec::new(),
            };
            Ok(Command::InsertShop {
                shop: Shop {
                    id: parse_ulid(&values[0], "id")?,
                    slug: parse_text(&values[1], "slug")?,
                    name: None,
                    timezone: parse_text(&values[2], "timezone")?,
                    schedule: ScheduleConfig {
                        opens: parse_time(&values[3], "opens")?,
                        closes: parse_time(&values[4], "closes")?,
                        break_window,
                        granularity_min,
                        closed_days,
                    },
                },
            })
        }
        "providers" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("providers", 2, values.len()));
            }
            let name = match values.get(2) {
                Some(v) => parse_text_or_null(v, "name")?,
                None => None,
            };
            Ok(Command::InsertProvider {
                provider: Provider {
                    id: parse_ulid(&values[0], "id")?,
                    shop_id: parse_ulid(&values[1], "shop_id")?,
                    name,
                },
            })
        }
        "services" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("services", 4, values.len()));
            }
            let price = match values.get(4) {
                Some(v) => parse_i64(v, "price")?,
                None => 0,
            };
            Ok(Command::InsertService {
                service: ServiceOffering {
                    id: parse_ulid(&values[0], "id")?,
                    shop_id: parse_ulid(&values[1], "shop_id")?,
                    name: parse_text(&values[2], "name")?,
                    duration_min: parse_u32(&values[3], "duration")?,
                    price,
                },
            })
        }
        "appointments" => {
            if values.len() < 7 {
                return Err(SqlError::WrongArity("appointments", 7, values.len()));
            }
            Ok(Command::InsertAppointment(BookingRequest {
                id: parse_ulid(&values[0], "id")?,
                shop_id: parse_ulid(&values[1], "shop_id")?,
                provider_id: parse_ulid(&values[2], "provider_id")?,
                service_ids: parse_ulid_list(&values[3], "services")?,
                starts_at: parse_datetime(&values[4], "starts_at")?,
                client_name: parse_text(&values[5], "client_name")?,
                client_email: parse_text(&values[6], "client_email")?,
            }))
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "providers" => Ok(Command::DeleteProvider { id }),
        "services" => Ok(Command::DeleteService { id }),
        "appointments" => Ok(Command::DeleteAppointment { id }),
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
    let filter = |col: &'static str| {
        filters
            .iter()
            .find(|(name, _)| name == col)
            .map(|(_, expr)| *expr)
            .ok_or(SqlError::MissingFilter(col))
    };

    match table.as_str() {
        "slots" => Ok(Command::SelectSlots {
            shop: parse_text(filter("shop")?, "shop")?,
            provider_id: parse_ulid(filter("provider_id")?, "provider_id")?,
            day: parse_date(filter("day")?, "day")?,
            duration_min: parse_u32(filter("duration")?, "duration")?,
        }),
        "appointments" => Ok(Command::SelectAppointments {
            provider_id: parse_ulid(filter("provider_id")?, "provider_id")?,
            day: parse_date(filter("day")?, "day")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flattens `a = 1 AND b = 2 ...` into `(column, value)` pairs.
fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_eq_filters(left, out)?;
                collect_eq_filters(right, out)?;
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                out.push((col, right.as_ref()));
            }
            other => return Err(SqlError::Unsupported(format!("operator {other} in WHERE"))),
        },
        Expr::Nested(inner) => collect_eq_filters(inner, out)?,
        other => return Err(SqlError::Unsupported(format!("filter {other}"))),
    }
    Ok(())
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
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right, "id"),
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_text(expr: &Expr, col: &'static str) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::BadValue(col, format!("expected string, got {value}"))),
        None => Err(SqlError::BadValue(col, format!("expected value, got {expr}"))),
    }
}

fn parse_text_or_null(expr: &Expr, col: &'static str) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_text(expr, col).map(Some)
}

fn parse_ulid(expr: &Expr, col: &'static str) -> Result<Ulid, SqlError> {
    let s = parse_text(expr, col)?;
    Ulid::from_string(&s).map_err(|e| SqlError::BadValue(col, format!("bad ULID {s:?}: {e}")))
}

/// `'id,id,...'`
fn parse_ulid_list(expr: &Expr, col: &'static str) -> Result<Vec<Ulid>, SqlError> {
    parse_text(expr, col)?
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Ulid::from_string(s).map_err(|e| SqlError::BadValue(col, format!("bad ULID {s:?}: {e}"))))
        .collect()
}

fn parse_i64(expr: &Expr, col: &'static str) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return parse_i64(expr, col).map(|v| -v);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::BadValue(col, format!("bad integer {s:?}: {e}"))),
        Some(value) => Err(SqlError::BadValue(col, format!("expected number, got {value}"))),
        None => Err(SqlError::BadValue(col, format!("expected value, got {expr}"))),
    }
}

fn parse_u32(expr: &Expr, col: &'static str) -> Result<u32, SqlError> {
    let v = parse_i64(expr, col)?;
    u32::try_from(v).map_err(|_| SqlError::BadValue(col, format!("{v} out of range")))
}

fn parse_u32_or_null(expr: &Expr, col: &'static str) -> Result<Option<u32>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_u32(expr, col).map(Some)
}

/// `'HH:MM'`
fn parse_time(expr: &Expr, col: &'static str) -> Result<NaiveTime, SqlError> {
    let s = parse_text(expr, col)?;
    NaiveTime::parse_from_str(&s, "%H:%M")
        .map_err(|e| SqlError::BadValue(col, format!("expected HH:MM, got {s:?}: {e}")))
}

fn parse_time_or_null(expr: &Expr, col: &'static str) -> Result<Option<NaiveTime>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_time(expr, col).map(Some)
}

/// `'YYYY-MM-DD'`
fn parse_date(expr: &Expr, col: &'static str) -> Result<NaiveDate, SqlError> {
    let s = parse_text(expr, col)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .map_err(|e| SqlError::BadValue(col, format!("expected YYYY-MM-DD, got {s:?}: {e}")))
}

/// `'YYYY-MM-DD HH:MM'`, `T` separator accepted.
fn parse_datetime(expr: &Expr, col: &'static str) -> Result<NaiveDateTime, SqlError> {
    let s = parse_text(expr, col)?;
    NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(&s, "%Y-%m-%dT%H:%M"))
        .map_err(|e| SqlError::BadValue(col, format!("expected YYYY-MM-DD HH:MM, got {s:?}: {e}")))
}

/// `'sun,mon'`; NULL or empty means open every day.
fn parse_weekdays(expr: &Expr) -> Result<Vec<Weekday>, SqlError> {
    let Some(s) = parse_text_or_null(expr, "closed_days")? else {
        return Ok(Vec::new());
    };
    let mut days = Vec::new();
    for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let day: Weekday = part
            .parse()
            .map_err(|_| SqlError::BadValue("closed_days", format!("unknown weekday {part:?}")))?;
        if !days.contains(&day) {
            days.push(day);
        }
    }
    Ok(days)
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
    #[error("{0}: expected at least {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    /// Well-formed statement carrying a malformed value.
    #[error("invalid {0}: {1}")]
    BadValue(&'static str, String),
}
