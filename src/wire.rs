use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::StartupHandler;
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::facade::{BookingView, CheckAvailabilityRequest, CommitRequest, FacadeError, QueryFacade};
use crate::model::*;
use crate::observability;
use crate::organization::OrganizationRegistry;
use crate::sql::{self, BookingFilter, Command};
use crate::time::{format_instant, parse_window};

pub struct FormacalHandler {
    registry: Arc<OrganizationRegistry>,
    query_parser: Arc<FormacalQueryParser>,
}

impl FormacalHandler {
    pub fn new(registry: Arc<OrganizationRegistry>) -> Self {
        Self {
            registry,
            query_parser: Arc::new(FormacalQueryParser),
        }
    }

    /// The connection's database name selects the organization.
    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.registry.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("organization error: {e}"),
            )))
        })
    }

    /// Parse, execute and record metrics for one statement.
    async fn run_statement(&self, engine: Arc<Engine>, sql: &str) -> PgWireResult<Vec<Response>> {
        let started = Instant::now();
        let cmd = match sql::parse_sql(sql) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(observability::QUERIES_TOTAL, "command" => "parse", "status" => "error")
                    .increment(1);
                return Err(sql_err(e));
            }
        };
        let label = observability::command_label(&cmd);
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(
        &self,
        engine: Arc<Engine>,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        let tz = engine.config.timezone;
        match cmd {
            Command::UpsertInstructor { id, active } => {
                engine.upsert_instructor(id, active).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::SelectInstructors => {
                let schema = Arc::new(instructor_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .list_instructors()
                    .await
                    .into_iter()
                    .map(|info| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&info.id.to_string())?;
                        encoder.encode_field(&info.active)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::InsertBlackout {
                id,
                instructor_id,
                start,
                end,
                kind,
                reason,
            } => {
                let span = parse_window(&start, &end, tz).map_err(|e| facade_err(e.into()))?;
                let blackout = engine
                    .add_blackout(
                        id.unwrap_or_else(Ulid::new),
                        instructor_id,
                        span.start,
                        span.end,
                        kind,
                        reason,
                    )
                    .await
                    .map_err(engine_err)?;
                Ok(vec![blackout_response(&[blackout], tz)])
            }
            Command::DeleteBlackout { id } => {
                engine.remove_blackout(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectBlackouts { instructor_id } => {
                let blackouts = engine.blackouts_for_instructor(&instructor_id).await;
                Ok(vec![blackout_response(&blackouts, tz)])
            }
            Command::CheckAvailability {
                instructor_ids,
                start,
                end,
                location_id,
                exclude_booking_id,
            } => {
                let request = CheckAvailabilityRequest {
                    instructor_ids,
                    start,
                    end,
                    location_id,
                    exclude_booking_id,
                };
                let result = QueryFacade::new(engine)
                    .check_availability(&request)
                    .await
                    .map_err(facade_err)?;
                let conflicts = serde_json::to_string(&result.conflicts).map_err(|e| {
                    PgWireError::UserError(Box::new(ErrorInfo::new(
                        "ERROR".into(),
                        "XX000".into(),
                        format!("encoding conflicts: {e}"),
                    )))
                })?;

                let schema = Arc::new(availability_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&result.available)?;
                encoder.encode_field(&conflicts)?;
                let rows: Vec<PgWireResult<_>> = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::InsertBooking {
                id,
                instructor_ids,
                start,
                end,
                location_id,
                state: BookingState::Tentative,
            } => {
                let span = parse_window(&start, &end, tz).map_err(|e| facade_err(e.into()))?;
                let (booking, preview) = engine
                    .record_tentative(id, &instructor_ids, span.start, span.end, location_id)
                    .await
                    .map_err(engine_err)?;
                let view = BookingView::render(&booking, preview.conflicts, tz);
                Ok(vec![booking_response(vec![view])?])
            }
            Command::InsertBooking {
                id,
                instructor_ids,
                start,
                end,
                location_id,
                state: _,
            } => {
                let request = CommitRequest {
                    id,
                    instructor_ids,
                    start,
                    end,
                    location_id,
                };
                let view = QueryFacade::new(engine)
                    .commit(&request)
                    .await
                    .map_err(facade_err)?;
                Ok(vec![booking_response(vec![view])?])
            }
            Command::DeleteBooking { id } => {
                engine.cancel_booking(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectBookings { filter } => {
                let bookings: Vec<Booking> = match filter {
                    BookingFilter::Id(id) => engine.get_booking(&id).into_iter().collect(),
                    BookingFilter::Instructor(instructor_id) => {
                        engine.bookings_for_instructor(&instructor_id)
                    }
                };
                let views = bookings
                    .iter()
                    .map(|b| BookingView::render(b, Vec::new(), tz))
                    .collect();
                Ok(vec![booking_response(views)?])
            }
        }
    }
}

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("available".into(), None, None, Type::BOOL, FieldFormat::Text),
        text_field("conflicts"),
    ]
}

fn instructor_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        FieldInfo::new("active".into(), None, None, Type::BOOL, FieldFormat::Text),
    ]
}

fn blackout_schema() -> Vec<FieldInfo> {
    ["id", "instructor_id", "start", "end", "kind", "reason"]
        .into_iter()
        .map(text_field)
        .collect()
}

fn booking_schema() -> Vec<FieldInfo> {
    [
        "id",
        "instructor_ids",
        "start",
        "end",
        "location_id",
        "state",
        "advisories",
    ]
    .into_iter()
    .map(text_field)
    .collect()
}

fn blackout_response(blackouts: &[Blackout], tz: chrono_tz::Tz) -> Response {
    let schema = Arc::new(blackout_schema());
    let rows: Vec<PgWireResult<_>> = blackouts
        .iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.instructor_id.to_string())?;
            encoder.encode_field(&format_instant(b.span.start, tz))?;
            encoder.encode_field(&format_instant(b.span.end, tz))?;
            encoder.encode_field(&b.kind.as_str().to_string())?;
            encoder.encode_field(&b.reason)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn booking_response(views: Vec<BookingView>) -> PgWireResult<Response> {
    let schema = Arc::new(booking_schema());
    let mut rows: Vec<PgWireResult<_>> = Vec::with_capacity(views.len());
    for view in views {
        let instructor_ids = view
            .instructor_ids
            .iter()
            .map(Ulid::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let advisories = serde_json::to_string(&view.advisories).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "XX000".into(),
                format!("encoding advisories: {e}"),
            )))
        })?;
        let mut encoder = DataRowEncoder::new(schema.clone());
        encoder.encode_field(&view.id.to_string())?;
        encoder.encode_field(&instructor_ids)?;
        encoder.encode_field(&view.start)?;
        encoder.encode_field(&view.end)?;
        encoder.encode_field(&view.location_id.to_string())?;
        encoder.encode_field(&view.state.as_str().to_string())?;
        encoder.encode_field(&advisories)?;
        rows.push(Ok(encoder.take_row()));
    }
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// Table a statement targets: the word after its first FROM or INTO.
fn target_table(sql: &str) -> Option<String> {
    let upper = sql.to_uppercase();
    let mut words = upper.split_whitespace();
    while let Some(word) = words.next() {
        if word == "FROM" || word == "INTO" {
            return words.next().map(|w| {
                w.split(['(', ';'])
                    .next()
                    .unwrap_or_default()
                    .trim_matches('"')
                    .to_string()
            });
        }
    }
    None
}

/// Columns a statement returns, for Describe.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let is_select = sql.trim_start().to_uppercase().starts_with("SELECT");
    let is_insert = sql.trim_start().to_uppercase().starts_with("INSERT");
    match target_table(sql).as_deref() {
        Some("AVAILABILITY") if is_select => availability_schema(),
        Some("INSTRUCTORS") if is_select => instructor_schema(),
        Some("BLACKOUTS") if is_select || is_insert => blackout_schema(),
        Some("BOOKINGS") if is_select || is_insert => booking_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for FormacalHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        self.run_statement(engine, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct FormacalQueryParser;

#[async_trait]
impl QueryParser for FormacalQueryParser {
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
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for FormacalHandler {
    type Statement = String;
    type QueryParser = FormacalQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let mut responses = self.run_statement(engine, &sql).await?;
        if responses.is_empty() {
            return Ok(Response::EmptyQuery);
        }
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
            result_schema(&target.statement),
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
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if let Ok(n) = sql[start..i].parse::<usize>() {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    substitute_text_params(&portal.statement.statement, &params)
}

/// Highest index first so `$1` never rewrites the prefix of `$10`.
fn substitute_text_params(sql: &str, params: &[Option<String>]) -> String {
    let mut result = sql.to_string();
    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(text) => format!("'{}'", text.replace('\'', "''")),
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct FormacalFactory {
    handler: Arc<FormacalHandler>,
    noop: Arc<NoopHandler>,
}

impl FormacalFactory {
    pub fn new(registry: Arc<OrganizationRegistry>) -> Self {
        Self {
            handler: Arc::new(FormacalHandler::new(registry)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for FormacalFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.noop.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    registry: Arc<OrganizationRegistry>,
) -> std::io::Result<()> {
    let factory = Arc::new(FormacalFactory::new(registry));
    pgwire::tokio::process_socket(socket, None, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE for each façade error.
fn sqlstate(e: &FacadeError) -> &'static str {
    match e {
        FacadeError::InvalidInput { .. } => "22023",
        FacadeError::Conflict { .. } => "23P01",
        FacadeError::Busy => "55P03",
        FacadeError::StoreUnavailable { .. } => "58030",
        FacadeError::NotFound { .. } => "P0002",
        FacadeError::AlreadyExists { .. } => "23505",
    }
}

fn facade_err(e: FacadeError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_json(),
    )))
}

fn engine_err(e: EngineError) -> PgWireError {
    facade_err(e.into())
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
