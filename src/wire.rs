use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
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
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::SlotdAuthSource;
use crate::engine::{Engine, EngineError, ErrorKind};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, ResultShape};
use crate::tenant::TenantManager;

pub struct SlotdHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SlotdQueryParser>,
}

impl SlotdHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SlotdQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Parse and execute one statement, recording query metrics.
    async fn run(&self, engine: &Engine, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertResource(new) => {
                engine.create_resource(new).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateResource { id, patch } => {
                engine.update_resource(id, patch).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteResource { id } => {
                engine.delete_resource(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectResource { id } => {
                let detail = engine.get_resource(id).await.map_err(engine_err)?;
                let upcoming = detail.upcoming.len();
                // The second result set only reaches simple-protocol clients.
                Ok(vec![
                    resources_response(&[detail.resource], 1),
                    bookings_response(&detail.upcoming, upcoming),
                ])
            }
            Command::SelectResources(filter) => {
                let page = engine.list_resources(&filter).await;
                Ok(vec![resources_response(&page.items, page.total)])
            }
            Command::InsertBooking(new) => {
                engine.create_booking(new).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateBooking { id, patch } => {
                engine.update_booking(id, patch).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::CancelBooking { id } => {
                engine.cancel_booking(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::CompleteBooking { id } => {
                engine.complete_booking(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteBooking { id } => {
                engine.delete_booking(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectBooking { id } => {
                let info = engine.get_booking(id).await.map_err(engine_err)?;
                Ok(vec![bookings_response(&[info], 1)])
            }
            Command::SelectBookings(filter) => {
                let page = engine.list_bookings(&filter).await;
                Ok(vec![bookings_response(&page.items, page.total)])
            }
            Command::SelectUpcoming { user_id, days } => {
                let items = engine
                    .upcoming_bookings(&user_id, days)
                    .await
                    .map_err(engine_err)?;
                let total = items.len();
                Ok(vec![bookings_response(&items, total)])
            }
            Command::SelectConflicts {
                resource_id,
                start,
                end,
                exclude,
            } => {
                let items = engine
                    .find_conflicts(resource_id, start, end, exclude)
                    .await
                    .map_err(engine_err)?;
                let total = items.len();
                Ok(vec![bookings_response(&items, total)])
            }
            Command::SelectAvailability { resource_id, day } => {
                let avail = engine
                    .availability(resource_id, day)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![availability_response(&avail)])
            }
            Command::SelectUtilization {
                resource_id,
                start,
                end,
            } => {
                let report = engine
                    .resource_utilization(resource_id, start, end)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![utilization_response(&report)])
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn resources_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("kind", Type::VARCHAR),
        field("active", Type::BOOL),
        field("metadata", Type::VARCHAR),
        field("booking_count", Type::INT8),
        field("created_at", Type::INT8),
        field("updated_at", Type::INT8),
        field("total", Type::INT8),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("resource_id", Type::VARCHAR),
        field("resource_name", Type::VARCHAR),
        field("resource_kind", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("status", Type::VARCHAR),
        field("priority", Type::INT4),
        field("user_id", Type::VARCHAR),
        field("company_id", Type::VARCHAR),
        field("store_id", Type::VARCHAR),
        field("title", Type::VARCHAR),
        field("metadata", Type::VARCHAR),
        field("created_at", Type::INT8),
        field("updated_at", Type::INT8),
        field("total", Type::INT8),
    ]
}

/// One row per booking of the day followed by one row per free slot.
fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("resource_id", Type::VARCHAR),
        field("day", Type::VARCHAR),
        field("kind", Type::VARCHAR),
        field("booking_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
    ]
}

fn utilization_schema() -> Vec<FieldInfo> {
    vec![
        field("resource_id", Type::VARCHAR),
        field("period_start", Type::INT8),
        field("period_end", Type::INT8),
        field("total_hours", Type::FLOAT8),
        field("booked_hours", Type::FLOAT8),
        field("rate", Type::FLOAT8),
        field("booking_count", Type::INT8),
    ]
}

fn schema_for(shape: ResultShape) -> Vec<FieldInfo> {
    match shape {
        ResultShape::Resources => resources_schema(),
        ResultShape::Bookings => bookings_schema(),
        ResultShape::Availability => availability_schema(),
        ResultShape::Utilization => utilization_schema(),
    }
}

fn statement_schema(stmt: &str) -> Vec<FieldInfo> {
    sql::result_shape(stmt).map(schema_for).unwrap_or_default()
}

fn metadata_json(metadata: &Metadata) -> String {
    // a map of strings always serializes
    serde_json::to_string(metadata).unwrap_or_default()
}

fn count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn resources_response(items: &[ResourceInfo], total: usize) -> Response {
    let schema = Arc::new(resources_schema());
    let rows = items
        .iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.name)?;
            encoder.encode_field(&r.kind.as_str())?;
            encoder.encode_field(&r.active)?;
            encoder.encode_field(&metadata_json(&r.metadata))?;
            encoder.encode_field(&count(r.booking_count))?;
            encoder.encode_field(&r.created_at)?;
            encoder.encode_field(&r.updated_at)?;
            encoder.encode_field(&count(total))?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(schema, rows)
}

fn bookings_response(items: &[BookingInfo], total: usize) -> Response {
    let schema = Arc::new(bookings_schema());
    let rows = items
        .iter()
        .map(|info| {
            let b = &info.booking;
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.resource_id.to_string())?;
            encoder.encode_field(&info.resource_name)?;
            encoder.encode_field(&info.resource_kind.as_str())?;
            encoder.encode_field(&b.span.start)?;
            encoder.encode_field(&b.span.end)?;
            encoder.encode_field(&b.status.as_str())?;
            encoder.encode_field(&b.priority)?;
            encoder.encode_field(&b.requester.user_id)?;
            encoder.encode_field(&b.requester.company_id)?;
            encoder.encode_field(&b.requester.store_id)?;
            encoder.encode_field(&b.title)?;
            encoder.encode_field(&metadata_json(&b.metadata))?;
            encoder.encode_field(&b.created_at)?;
            encoder.encode_field(&b.updated_at)?;
            encoder.encode_field(&count(total))?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(schema, rows)
}

fn availability_response(avail: &DayAvailability) -> Response {
    let schema = Arc::new(availability_schema());
    let rid = avail.resource.id.to_string();
    let day = avail.day.format("%Y-%m-%d").to_string();
    let window = avail.window;

    let booked = avail.bookings.iter().map(|info| {
        let span = &info.booking.span;
        (
            "booking",
            Some(info.booking.id.to_string()),
            span.start.max(window.start),
            span.end.min(window.end),
        )
    });
    let free = avail
        .free
        .iter()
        .map(|slot| ("free", None, slot.start, slot.end));

    let rows = booked
        .chain(free)
        .map(|(kind, booking_id, start, end)| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&rid)?;
            encoder.encode_field(&day)?;
            encoder.encode_field(&kind)?;
            encoder.encode_field(&booking_id)?;
            encoder.encode_field(&start)?;
            encoder.encode_field(&end)?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(schema, rows)
}

fn utilization_response(report: &Utilization) -> Response {
    let schema = Arc::new(utilization_schema());
    let row = utilization_row(schema.clone(), report);
    query_response(schema, vec![row])
}

fn utilization_row(schema: Arc<Vec<FieldInfo>>, report: &Utilization) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema);
    encoder.encode_field(&report.resource_id.to_string())?;
    encoder.encode_field(&report.period_start)?;
    encoder.encode_field(&report.period_end)?;
    encoder.encode_field(&report.total_hours)?;
    encoder.encode_field(&report.booked_hours)?;
    encoder.encode_field(&report.rate)?;
    encoder.encode_field(&count(report.booking_count))?;
    Ok(encoder.take_row())
}

#[async_trait]
impl SimpleQueryHandler for SlotdHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        self.run(&engine, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotdQueryParser;

#[async_trait]
impl QueryParser for SlotdQueryParser {
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
        Ok(statement_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotdHandler {
    type Statement = String;
    type QueryParser = SlotdQueryParser;

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
        let responses = self.run(&engine, &sql).await?;
        responses
            .into_iter()
            .next()
            .ok_or_else(|| PgWireError::ApiError("statement produced no response".into()))
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
            statement_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(statement_schema(
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
            if i > start {
                if let Ok(n) = sql[start..i].parse::<usize>() {
                    max = max.max(n);
                }
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    substitute(&portal.statement.statement, &portal.parameters)
}

/// Highest index first, so `$1` never clobbers the prefix of `$10`.
fn substitute(sql: &str, params: &[Option<bytes::Bytes>]) -> String {
    let mut result = sql.to_string();
    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotdFactory {
    handler: Arc<SlotdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SlotdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotdFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = SlotdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotdHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotdFactory {
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
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = SlotdFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::NotFound => "P0002",
        ErrorKind::AlreadyExists => "23505",
        ErrorKind::InvalidInterval | ErrorKind::PastBooking => "22023",
        ErrorKind::InvalidState | ErrorKind::AlreadyCancelled | ErrorKind::AlreadyCompleted => {
            "55000"
        }
        ErrorKind::Conflict => "23P01",
        ErrorKind::HasActiveDependents => "23503",
        ErrorKind::LimitExceeded => "54000",
        ErrorKind::Storage => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    let kind = e.kind();
    if kind == ErrorKind::Storage {
        tracing::error!("storage failure: {e}");
    } else {
        tracing::debug!(?kind, "rejected: {e}");
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(kind).into(),
        e.to_string(),
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    tracing::debug!("unparseable statement: {e}");
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
