use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::{parse_date, BookingRequest, BranchId, TopicId};

/// Column order of `INSERT INTO appointments VALUES (...)` without a column list.
const APPOINTMENT_INSERT_COLUMNS: [&str; 6] = ["name", "email", "topic_id", "branch_id", "slot_start", "reason"];

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    SelectTopics,
    SelectBranches {
        topic_id: Option<TopicId>,
    },
    SelectBusinessHours {
        date: NaiveDate,
    },
    SelectSlots {
        branch_id: BranchId,
        date: NaiveDate,
    },
    SelectAvailableDates {
        branch_id: BranchId,
    },
    SelectAppointments {
        filter: AppointmentFilter,
    },
    InsertAppointment {
        request: BookingRequest,
        returning: bool,
    },
    DeleteAppointment {
        id: Ulid,
    },
    DeleteAllAppointments,
    /// `NOTIFY confirmation, '<id>'`: send the confirmation again.
    ResendConfirmation {
        id: Ulid,
    },
}

#[derive(Debug, PartialEq)]
pub enum AppointmentFilter {
    All,
    Id(Ulid),
    BranchDate { branch_id: BranchId, date: NaiveDate },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if let Some(head) = trimmed.get(..7)
        && head.eq_ignore_ascii_case("NOTIFY ")
    {
        return parse_notify(&trimmed[7..]);
    }

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

fn parse_notify(rest: &str) -> Result<Command, SqlError> {
    let (channel, payload) = rest
        .split_once(',')
        .ok_or(SqlError::Parse("NOTIFY needs a channel and a payload".into()))?;
    let channel = channel.trim().to_lowercase();
    if channel != "confirmation" {
        return Err(SqlError::UnknownChannel(channel));
    }
    let payload = payload.trim().trim_matches('\'');
    let id = Ulid::from_string(payload).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))?;
    Ok(Command::ResendConfirmation { id })
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    if table != "appointments" {
        return Err(SqlError::UnknownTable(table));
    }
    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = if insert.columns.is_empty() {
        APPOINTMENT_INSERT_COLUMNS[..values.len().min(APPOINTMENT_INSERT_COLUMNS.len())]
            .iter()
            .map(|c| c.to_string())
            .collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if columns.len() != values.len() {
        return Err(SqlError::WrongArity("appointments", columns.len(), values.len()));
    }

    let mut request = BookingRequest::default();
    for (column, value) in columns.iter().zip(&values) {
        let text = parse_text_or_null(value)?;
        match column.as_str() {
            "name" => request.name = text,
            "email" => request.email = text,
            "topic_id" => request.topic_id = text,
            "branch_id" => request.branch_id = text,
            "slot_start" => request.slot_start = text,
            "reason" => request.reason = text,
            other => return Err(SqlError::UnknownColumn(other.to_string())),
        }
    }
    Ok(Command::InsertAppointment {
        request,
        returning: insert.returning.is_some(),
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "appointments" {
        return Err(SqlError::UnknownTable(table));
    }
    match &delete.selection {
        None => Ok(Command::DeleteAllAppointments),
        Some(_) => Ok(Command::DeleteAppointment {
            id: extract_where_id(&delete.selection)?,
        }),
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

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "topics" => Ok(Command::SelectTopics),
        "branches" => Ok(Command::SelectBranches {
            topic_id: filters.text("topic_id")?.map(TopicId::from),
        }),
        "business_hours" => Ok(Command::SelectBusinessHours {
            date: filters.required_date()?,
        }),
        "slots" => Ok(Command::SelectSlots {
            branch_id: filters.required_branch()?,
            date: filters.required_date()?,
        }),
        "available_dates" => Ok(Command::SelectAvailableDates {
            branch_id: filters.required_branch()?,
        }),
        "appointments" => {
            let filter = if let Some(id) = filters.get("id") {
                AppointmentFilter::Id(parse_ulid_expr(id)?)
            } else if filters.get("branch_id").is_some() || filters.get("date").is_some() {
                AppointmentFilter::BranchDate {
                    branch_id: filters.required_branch()?,
                    date: filters.required_date()?,
                }
            } else {
                AppointmentFilter::All
            };
            Ok(Command::SelectAppointments { filter })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `column = value` pairs from a WHERE clause joined by AND.
#[derive(Default)]
struct Filters(Vec<(String, Expr)>);

impl Filters {
    fn get(&self, column: &str) -> Option<&Expr> {
        self.0.iter().find(|(c, _)| c == column).map(|(_, e)| e)
    }

    fn text(&self, column: &'static str) -> Result<Option<String>, SqlError> {
        match self.get(column) {
            Some(expr) => parse_text_or_null(expr),
            None => Ok(None),
        }
    }

    fn required_branch(&self) -> Result<BranchId, SqlError> {
        self.text("branch_id")?
            .map(BranchId::from)
            .ok_or(SqlError::MissingFilter("branch_id"))
    }

    fn required_date(&self) -> Result<NaiveDate, SqlError> {
        let raw = self.text("date")?.ok_or(SqlError::MissingFilter("date"))?;
        parse_date(&raw).ok_or(SqlError::InvalidValue { column: "date", value: raw })
    }
}

fn collect_eq_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq_filters(inner, filters),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_eq_filters(left, filters)?;
                collect_eq_filters(right, filters)
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                filters.0.push((col, (**right).clone()));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("operator {other}"))),
        },
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
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
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid_expr(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

/// Strings and bare numbers become text; NULL becomes `None`.
fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) | Value::Number(s, _) => Ok(Some(s.clone())),
            _ => Err(SqlError::Parse(format!("expected string or NULL, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
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
    #[error("unknown notification channel: {0}")]
    UnknownChannel(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("invalid {column}: {value:?}")]
    InvalidValue { column: &'static str, value: String },
}
