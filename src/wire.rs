use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::BranchbookAuthSource;
use crate::catalog::{Branch, Topic};
use crate::engine::{BookingEngine, BookingError};
use crate::hours::BusinessHours;
use crate::model::{Appointment, Slot, DATE_FORMAT};
use crate::observability;
use crate::sql::{self, AppointmentFilter, Command};

pub struct BranchbookHandler {
    engine: Arc<BookingEngine>,
    query_parser: Arc<BranchbookQueryParser>,
}

impl BranchbookHandler {
    pub fn new(engine: Arc<BookingEngine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(BranchbookQueryParser),
        }
    }

    /// Parse, execute, and record metrics for one statement.
    async fn run(&self, sql: &str, format: &Format) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd, format).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command, format: &Format) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::SelectTopics => {
                let schema = Arc::new(topics_schema(format));
                let rows = engine.topics().iter().map(|t| topic_row(&schema, t)).collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectBranches { topic_id } => {
                let branches = match topic_id {
                    Some(topic) => engine.branches_for_topic(&topic),
                    None => engine.branches().to_vec(),
                };
                let schema = Arc::new(branches_schema(format));
                let rows = branches.iter().map(|b| branch_row(&schema, b)).collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectBusinessHours { date } => {
                let hours = engine.hours(date);
                let schema = Arc::new(business_hours_schema(format));
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&date.format(DATE_FORMAT).to_string())?;
                encoder.encode_field(&hours.is_closed())?;
                encoder.encode_field(&hours.open_time())?;
                encoder.encode_field(&hours.close_time())?;
                let (lunch_start, lunch_end) = match hours {
                    BusinessHours::Open { lunch: Some(l), .. } => (
                        Some(format!("{:02}:00", l.start_hour)),
                        Some(format!("{:02}:00", l.end_hour)),
                    ),
                    _ => (None, None),
                };
                encoder.encode_field(&lunch_start)?;
                encoder.encode_field(&lunch_end)?;
                Ok(vec![query_response(schema, vec![Ok(encoder.take_row())])])
            }
            Command::SelectSlots { branch_id, date } => {
                let slots = engine.slots_for(&branch_id, date).await.map_err(booking_err)?;
                let schema = Arc::new(slots_schema(format));
                let rows = slots.iter().map(|s| slot_row(&schema, s)).collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectAvailableDates { branch_id } => {
                let dates = engine
                    .available_dates_for(&branch_id)
                    .await
                    .map_err(booking_err)?;
                let schema = Arc::new(available_dates_schema(format));
                let rows: Vec<Row> = dates
                    .iter()
                    .map(|d| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&branch_id.to_string())?;
                        encoder.encode_field(&d.format(DATE_FORMAT).to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::SelectAppointments { filter } => {
                let appointments = match filter {
                    AppointmentFilter::All => engine.list_appointments().await,
                    AppointmentFilter::BranchDate { branch_id, date } => {
                        engine.appointments_for(&branch_id, date).await
                    }
                    AppointmentFilter::Id(id) => match engine.get_appointment(id).await {
                        Ok(a) => Ok(vec![a]),
                        Err(BookingError::AppointmentNotFound(_)) => Ok(Vec::new()),
                        Err(e) => Err(e),
                    },
                }
                .map_err(booking_err)?;
                let schema = Arc::new(appointments_schema(format));
                let rows = appointments.iter().map(|a| appointment_row(&schema, a)).collect();
                Ok(vec![query_response(schema, rows)])
            }
            Command::InsertAppointment { request, returning } => {
                let appointment = engine.book(request).await.map_err(booking_err)?;
                if returning {
                    let schema = Arc::new(appointments_schema(format));
                    let row = appointment_row(&schema, &appointment);
                    Ok(vec![query_response(schema, vec![row])])
                } else {
                    Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
                }
            }
            Command::DeleteAppointment { id } => {
                engine.delete_appointment(id).await.map_err(booking_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::DeleteAllAppointments => {
                let removed = engine.delete_all_appointments().await.map_err(booking_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(removed))])
            }
            Command::ResendConfirmation { id } => {
                engine.resend_confirmation(id).await.map_err(booking_err)?;
                Ok(vec![Response::Execution(Tag::new("NOTIFY"))])
            }
        }
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn fields(columns: &[(&str, Type)], format: &Format) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(i, (name, ty))| FieldInfo::new((*name).into(), None, None, ty.clone(), format.format_for(i)))
        .collect()
}

fn topics_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[("id", Type::VARCHAR), ("name", Type::VARCHAR), ("description", Type::VARCHAR)],
        format,
    )
}

fn branches_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("id", Type::VARCHAR),
            ("name", Type::VARCHAR),
            ("address", Type::VARCHAR),
            ("phone", Type::VARCHAR),
            ("supported_topic_ids", Type::VARCHAR),
        ],
        format,
    )
}

fn business_hours_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("date", Type::VARCHAR),
            ("closed", Type::BOOL),
            ("open_time", Type::VARCHAR),
            ("close_time", Type::VARCHAR),
            ("lunch_start", Type::VARCHAR),
            ("lunch_end", Type::VARCHAR),
        ],
        format,
    )
}

fn slots_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[("branch_id", Type::VARCHAR), ("slot_start", Type::VARCHAR), ("available", Type::BOOL)],
        format,
    )
}

fn available_dates_schema(format: &Format) -> Vec<FieldInfo> {
    fields(&[("branch_id", Type::VARCHAR), ("date", Type::VARCHAR)], format)
}

fn appointments_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        &[
            ("id", Type::VARCHAR),
            ("name", Type::VARCHAR),
            ("email", Type::VARCHAR),
            ("topic_id", Type::VARCHAR),
            ("branch_id", Type::VARCHAR),
            ("slot_start", Type::VARCHAR),
            ("reason", Type::VARCHAR),
            ("created_at", Type::VARCHAR),
        ],
        format,
    )
}

/// Result columns of a statement, judged from its text alone. Used to
/// describe prepared statements before their parameters are bound.
fn result_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    let lower = sql.trim_start().to_lowercase();
    if lower.starts_with("insert") {
        return if lower.contains("returning") {
            appointments_schema(format)
        } else {
            vec![]
        };
    }
    if !lower.starts_with("select") {
        return vec![];
    }
    let table = lower
        .split_once(" from ")
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .map(|t| t.trim_matches(|c| c == ';' || c == '"'));
    match table {
        Some("topics") => topics_schema(format),
        Some("branches") => branches_schema(format),
        Some("business_hours") => business_hours_schema(format),
        Some("slots") => slots_schema(format),
        Some("available_dates") => available_dates_schema(format),
        Some("appointments") => appointments_schema(format),
        _ => vec![],
    }
}

// ── Row encoding ─────────────────────────────────────────────────

type Row = PgWireResult<pgwire::messages::data::DataRow>;

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<Row>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn topic_row(schema: &Arc<Vec<FieldInfo>>, t: &Topic) -> Row {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&t.id.to_string())?;
    encoder.encode_field(&t.name)?;
    encoder.encode_field(&t.description)?;
    Ok(encoder.take_row())
}

fn branch_row(schema: &Arc<Vec<FieldInfo>>, b: &Branch) -> Row {
    let topics = b
        .supported_topic_ids
        .iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(",");
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.name)?;
    encoder.encode_field(&b.address)?;
    encoder.encode_field(&b.phone)?;
    encoder.encode_field(&topics)?;
    Ok(encoder.take_row())
}

fn slot_row(schema: &Arc<Vec<FieldInfo>>, s: &Slot) -> Row {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&s.branch_id.to_string())?;
    encoder.encode_field(&s.start.to_string())?;
    encoder.encode_field(&s.available)?;
    Ok(encoder.take_row())
}

fn appointment_row(schema: &Arc<Vec<FieldInfo>>, a: &Appointment) -> Row {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&a.id.to_string())?;
    encoder.encode_field(&a.name)?;
    encoder.encode_field(&a.email)?;
    encoder.encode_field(&a.topic_id.to_string())?;
    encoder.encode_field(&a.branch_id.to_string())?;
    encoder.encode_field(&a.slot_start.to_string())?;
    encoder.encode_field(&a.reason)?;
    encoder.encode_field(&a.created_at.to_rfc3339())?;
    Ok(encoder.take_row())
}

#[async_trait]
impl SimpleQueryHandler for BranchbookHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(query, &Format::UnifiedText).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct BranchbookQueryParser;

#[async_trait]
impl QueryParser for BranchbookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for BranchbookHandler {
    type Statement = String;
    type QueryParser = BranchbookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        let mut responses = self.run(&sql, &portal.result_column_format).await?;
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement, &Format::UnifiedText),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
            &target.result_column_format,
        )))
    }
}

/// `$n` placeholders outside quoted literals and identifiers, as
/// (byte range, n). A doubled quote inside a literal just closes and reopens it.
fn placeholders(sql: &str) -> Vec<(std::ops::Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let start = i;
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start + 1..i].parse::<usize>()
                    && n > 0
                {
                    found.push((start..i, n));
                }
                continue;
            }
            None => {}
        }
        i += 1;
    }
    found
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    substitute(&portal.statement.statement, &params)
}

/// One pass over the statement text. Substituted values are never rescanned,
/// and a placeholder with no bound value is left as written.
fn substitute(sql: &str, params: &[Option<String>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = params.get(n - 1) else {
            continue;
        };
        result.push_str(&sql[copied..range.start]);
        match param {
            Some(text) => {
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = range.end;
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct BranchbookFactory {
    handler: Arc<BranchbookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<BranchbookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl BranchbookFactory {
    pub fn new(engine: Arc<BookingEngine>, password: String) -> Self {
        let auth_source = BranchbookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(BranchbookHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for BranchbookFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<BookingEngine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let factory = BranchbookFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory).await?;
    Ok(())
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE for a booking rejection.
fn sqlstate(e: &BookingError) -> &'static str {
    match e {
        BookingError::SlotTaken { .. } => "23505",
        BookingError::InvalidDateTime(_) => "22007",
        BookingError::TopicNotFound(_)
        | BookingError::BranchNotFound(_)
        | BookingError::AppointmentNotFound(_) => "P0002",
        BookingError::StoreUnavailable(_) => "08006",
        BookingError::MissingFields(_)
        | BookingError::UnsupportedTopicForBranch { .. }
        | BookingError::PastAppointment(_)
        | BookingError::MisalignedSlot(_)
        | BookingError::OutsideBusinessHours(_) => "22023",
    }
}

/// The message leads with the stable kind so clients can branch on it.
fn booking_err(e: BookingError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        format!("{}: {e}", e.kind()),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SlotStart;
    use chrono::NaiveDateTime;
    use ulid::Ulid;

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM topics"), 0);
        assert_eq!(count_params("SELECT * FROM slots WHERE branch_id = $1 AND \"date\" = $2"), 2);
        assert_eq!(count_params("VALUES ($10, $2)"), 10);
    }

    #[test]
    fn substitute_quotes_and_nulls() {
        let sql = substitute(
            "INSERT INTO appointments (name, reason) VALUES ($1, $2)",
            &[Some("O'Brien".into()), None],
        );
        assert_eq!(sql, "INSERT INTO appointments (name, reason) VALUES ('O''Brien', NULL)");
    }

    #[test]
    fn substitute_multi_digit_indexes() {
        let params: Vec<Option<String>> = (1..=10).map(|i| Some(i.to_string())).collect();
        assert_eq!(substitute("$1 $10", &params), "'1' '10'");
    }

    #[test]
    fn substituted_values_are_not_rescanned() {
        let sql = substitute(
            "INSERT INTO appointments (name, reason) VALUES ($1, $2)",
            &[Some("Ada".into()), Some("repay $1 loan".into())],
        );
        assert_eq!(sql, "INSERT INTO appointments (name, reason) VALUES ('Ada', 'repay $1 loan')");
        let Command::InsertAppointment { request, .. } = sql::parse_sql(&sql).unwrap() else {
            panic!("expected an insert");
        };
        assert_eq!(request.name.as_deref(), Some("Ada"));
        assert_eq!(request.reason.as_deref(), Some("repay $1 loan"));
    }

    #[test]
    fn placeholders_inside_literals_are_text() {
        let sql = substitute(
            "SELECT * FROM appointments WHERE id = $1 AND \"$2\" = '$2'",
            &[Some("01J".into()), Some("x".into())],
        );
        assert_eq!(sql, "SELECT * FROM appointments WHERE id = '01J' AND \"$2\" = '$2'");
        assert_eq!(count_params("VALUES ('it''s $3', $1)"), 1);
    }

    #[test]
    fn unbound_placeholder_left_alone() {
        assert_eq!(substitute("VALUES ($1, $2)", &[Some("a".into())]), "VALUES ('a', $2)");
        assert_eq!(count_params("SELECT $0"), 0);
    }

    #[test]
    fn result_schema_by_table() {
        let text = Format::UnifiedText;
        assert_eq!(result_schema("SELECT * FROM slots WHERE branch_id = $1", &text).len(), 3);
        assert_eq!(result_schema("select * from \"appointments\";", &text).len(), 8);
        assert_eq!(result_schema("INSERT INTO appointments VALUES ($1) RETURNING *", &text).len(), 8);
        assert!(result_schema("INSERT INTO appointments VALUES ($1)", &text).is_empty());
        assert!(result_schema("DELETE FROM appointments", &text).is_empty());
    }

    #[test]
    fn sqlstates() {
        let at = NaiveDateTime::parse_from_str("2026-02-09T09:00:00", "%Y-%m-%dT%H:%M:%S").unwrap();
        let slot = SlotStart::new(at).unwrap();
        assert_eq!(sqlstate(&BookingError::SlotTaken { branch: "1".into(), slot_start: slot }), "23505");
        assert_eq!(sqlstate(&BookingError::InvalidDateTime("x".into())), "22007");
        assert_eq!(sqlstate(&BookingError::AppointmentNotFound(Ulid::new())), "P0002");
        assert_eq!(sqlstate(&BookingError::MisalignedSlot(at)), "22023");
        assert_eq!(sqlstate(&BookingError::StoreUnavailable("down".into())), "08006");
    }
}
