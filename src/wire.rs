use std::fmt::Debug;
use std::ops::Range;
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
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::SlotGuardAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};

pub struct SlotGuardHandler {
    engine: Arc<Engine>,
    query_parser: Arc<SlotGuardQueryParser>,
}

impl SlotGuardHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(SlotGuardQueryParser),
        }
    }

    /// The authenticated login name; every booking made on this session is stamped with it.
    fn requester<C: ClientInfo>(client: &C) -> PgWireResult<String> {
        client.metadata().get("user").cloned().ok_or_else(|| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "28000".into(),
                "no authenticated user on this session".into(),
            )))
        })
    }

    async fn run(&self, requester: String, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(requester, cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, requester: String, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::InsertWorkspace {
                id,
                title,
                description,
                available,
            } => {
                engine
                    .create_resource(id, title, description, available)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateWorkspace {
                id,
                title,
                description,
                available,
            } => {
                engine
                    .update_resource(id, title, description, available)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteWorkspace { id } => {
                engine.delete_resource(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectWorkspaces { id } => {
                let workspaces = match id {
                    Some(id) => match engine.get_resource_info(id).await {
                        Ok(info) => vec![info],
                        Err(EngineError::NotFound(_)) => vec![],
                        Err(e) => return Err(engine_err(e)),
                    },
                    None => engine.list_resources().await,
                };
                Ok(vec![workspace_rows(workspaces)])
            }
            Command::InsertBooking(insert) => {
                engine
                    .create_booking(insert.into_new_booking(requester))
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateBooking { id, patch, status } => {
                engine
                    .update_booking(id, patch, status)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteBooking { id, purge } => {
                if purge {
                    engine.remove_booking(id).await.map_err(engine_err)?;
                } else {
                    engine.cancel(id).await.map_err(engine_err)?;
                }
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectBookings {
                id,
                resource_id,
                status,
            } => {
                let bookings = match id {
                    Some(id) => match engine.get_booking(id).await {
                        Ok(b) => {
                            let keep = resource_id.is_none_or(|r| r == b.resource_id)
                                && status.is_none_or(|s| s == b.status);
                            if keep { vec![b] } else { vec![] }
                        }
                        Err(EngineError::NotFound(_)) => vec![],
                        Err(e) => return Err(engine_err(e)),
                    },
                    None => match engine.list_bookings(resource_id, status).await {
                        Ok(list) => list,
                        Err(EngineError::NotFound(_)) => vec![],
                        Err(e) => return Err(engine_err(e)),
                    },
                };
                Ok(vec![booking_rows(bookings)])
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn workspace_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("title", Type::VARCHAR),
        text_field("description", Type::VARCHAR),
        text_field("available", Type::BOOL),
        text_field("booking_count", Type::INT8),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("resource_id", Type::VARCHAR),
        text_field("requester_id", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
        text_field("contact_name", Type::VARCHAR),
        text_field("contact_email", Type::VARCHAR),
        text_field("notes", Type::VARCHAR),
        text_field("status", Type::VARCHAR),
        text_field("created_at", Type::INT8),
        text_field("updated_at", Type::INT8),
    ]
}

fn workspace_rows(workspaces: Vec<ResourceInfo>) -> Response {
    let schema = Arc::new(workspace_schema());
    let rows: Vec<PgWireResult<_>> = workspaces
        .into_iter()
        .map(|w| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&w.id.to_string())?;
            encoder.encode_field(&w.title)?;
            encoder.encode_field(&w.description)?;
            encoder.encode_field(&w.available)?;
            encoder.encode_field(&(w.booking_count as i64))?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn booking_rows(bookings: Vec<Booking>) -> Response {
    let schema = Arc::new(booking_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .into_iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.resource_id.to_string())?;
            encoder.encode_field(&b.requester_id)?;
            encoder.encode_field(&b.span.start)?;
            encoder.encode_field(&b.span.end)?;
            encoder.encode_field(&b.contact_name)?;
            encoder.encode_field(&b.contact_email)?;
            encoder.encode_field(&b.notes.unwrap_or_default())?;
            encoder.encode_field(&b.status.to_string())?;
            encoder.encode_field(&b.created_at)?;
            encoder.encode_field(&b.updated_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Row shape a statement will produce, decided without binding its parameters.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    match sql::select_table(sql).as_deref() {
        Some("bookings") => booking_schema(),
        Some("workspaces") => workspace_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotGuardHandler {
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
        let requester = Self::requester(client)?;
        tracing::debug!("query from {requester}: {query}");
        self.run(requester, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotGuardQueryParser;

#[async_trait]
impl QueryParser for SlotGuardQueryParser {
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
impl ExtendedQueryHandler for SlotGuardHandler {
    type Statement = String;
    type QueryParser = SlotGuardQueryParser;

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
        let requester = Self::requester(client)?;
        let sql = substitute_params(portal);
        let mut responses = self.run(requester, &sql).await?;
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

/// `$N` placeholders outside quoted literals and identifiers, with their byte ranges.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut out = Vec::new();
    let mut quote = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled quote closes and reopens, which leaves us inside.
            Some(q) => {
                if b == q {
                    quote = None;
                }
                i += 1;
            }
            None if b == b'\'' || b == b'"' => {
                quote = Some(b);
                i += 1;
            }
            None if b == b'$' => {
                let mut end = i + 1;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if let Ok(n) = sql[i + 1..end].parse::<usize>()
                    && n > 0
                {
                    out.push((i..end, n));
                }
                i = end.max(i + 1);
            }
            None => i += 1,
        }
    }
    out
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Splice bound values (text format) into the statement in one left-to-right pass,
/// so a value that itself contains `$N` is never rewritten.
fn bind_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut last = 0;
    for (range, n) in placeholders(sql) {
        out.push_str(&sql[last..range.start]);
        match params.get(n - 1) {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => out.push_str(&sql[range.clone()]),
        }
        last = range.end;
    }
    out.push_str(&sql[last..]);
    out
}

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotGuardFactory {
    handler: Arc<SlotGuardHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SlotGuardAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SlotGuardFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = SlotGuardAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotGuardHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotGuardFactory {
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
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = SlotGuardFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE for each engine error kind.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Conflict { .. } => "23P01",
        EngineError::NotFound(_) => "P0002",
        EngineError::Validation(_) => "22023",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::TransientStore(_) => "40001",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::ResourceUnavailable(_) => "55006",
        EngineError::HasBookings(_) => "23503",
        EngineError::LimitExceeded(_) => "54000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn count_params_finds_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM bookings"), 0);
        assert_eq!(count_params("SELECT * FROM bookings WHERE id = $1"), 1);
        assert_eq!(
            count_params("UPDATE bookings SET start = $2, \"end\" = $10 WHERE id = $1"),
            10
        );
        assert_eq!(count_params("UPDATE bookings SET notes = 'costs $5' WHERE id = $1"), 1);
    }

    #[test]
    fn bound_values_are_not_rescanned() {
        let sql = "INSERT INTO bookings (notes, contact_name) VALUES ($1, $2)";
        let params = [Some(b"deposit $2 paid".to_vec()), Some(b"O'Brien".to_vec())];
        assert_eq!(
            bind_params(sql, &params),
            "INSERT INTO bookings (notes, contact_name) VALUES ('deposit $2 paid', 'O''Brien')"
        );
    }

    #[test]
    fn bind_params_skips_literals_and_handles_null() {
        let sql = "UPDATE bookings SET notes = $1, contact_name = '$1' WHERE id = $10";
        let mut params: Vec<Option<Vec<u8>>> = vec![None; 10];
        params[9] = Some(b"01BX5ZZKBKACTAV9WEVGEMMVRZ".to_vec());
        assert_eq!(
            bind_params(sql, &params),
            "UPDATE bookings SET notes = NULL, contact_name = '$1' WHERE id = '01BX5ZZKBKACTAV9WEVGEMMVRZ'"
        );
        // Unbound placeholders are left for the parser to reject.
        assert_eq!(bind_params::<Vec<u8>>("SELECT $3", &[]), "SELECT $3");
    }

    #[test]
    fn result_schema_by_table() {
        assert_eq!(result_schema("SELECT * FROM bookings WHERE id = $1").len(), 11);
        assert_eq!(result_schema("  select * from workspaces").len(), 5);
        assert_eq!(result_schema("SELECT * FROM workspaces WHERE title = 'bookings'").len(), 5);
        assert!(result_schema("DELETE FROM bookings WHERE id = $1").is_empty());
        assert!(result_schema("INSERT INTO workspaces (id, title) VALUES ($1, 'SELECT bookings')").is_empty());
    }

    #[test]
    fn sqlstates_are_distinct_per_kind() {
        let id = Ulid::new();
        let errors = [
            EngineError::Conflict { booking_id: id, start: 0, end: 1 },
            EngineError::NotFound(id),
            EngineError::Validation("x".into()),
            EngineError::InvalidTransition {
                from: BookingStatus::Cancelled,
                to: BookingStatus::Pending,
            },
            EngineError::TransientStore("x".into()),
            EngineError::AlreadyExists(id),
            EngineError::ResourceUnavailable(id),
            EngineError::HasBookings(id),
            EngineError::LimitExceeded("x"),
        ];
        let mut codes: Vec<_> = errors.iter().map(sqlstate).collect();
        assert_eq!(codes[0], "23P01");
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }
}
