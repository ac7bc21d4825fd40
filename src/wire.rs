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
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::AllocdAuthSource;
use crate::engine::{Engine, EngineError, Overlap, OverridePlan};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, AllocationFilter, Command, ResultShape, SqlError};
use crate::tenant::TenantManager;

pub struct AllocdHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<AllocdQueryParser>,
}

impl AllocdHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(AllocdQueryParser),
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

    /// Run one command, recording its outcome and latency.
    async fn execute(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertEmployee { id, name } => {
                engine.register_employee(id, name).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertProject { id, name } => {
                engine.register_project(id, name).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertPhase {
                id,
                project_id,
                name,
            } => {
                engine
                    .register_phase(id, project_id, name)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertAllocation {
                new,
                policy,
                returning,
            } => {
                let allocation = engine.allocate(new, policy).await.map_err(engine_err)?;
                if returning {
                    allocation_rows(vec![allocation])
                } else {
                    Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
                }
            }
            Command::UpdateAllocation {
                id,
                start,
                end,
                phase_id,
                policy,
                returning,
            } => {
                let allocation = engine
                    .reallocate(id, start, end, phase_id, policy)
                    .await
                    .map_err(engine_err)?;
                if returning {
                    allocation_rows(vec![allocation])
                } else {
                    Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
                }
            }
            Command::DeleteAllocation { id } => {
                engine.remove_allocation(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::UnassignProject {
                employee_id,
                project_id,
            } => {
                let removed = engine
                    .unassign_from_project(employee_id, project_id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(removed.len())))
            }
            Command::UnassignPhase {
                employee_id,
                phase_id,
            } => {
                let removed = engine
                    .unassign_from_phase(employee_id, phase_id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(removed.len())))
            }
            Command::SelectAllocations { filter } => {
                let allocations = match filter {
                    AllocationFilter::Id(id) => match engine.get_allocation(id).await {
                        Ok(a) => Ok(vec![a]),
                        Err(EngineError::NotFound(_)) => Ok(Vec::new()),
                        Err(e) => Err(e),
                    },
                    AllocationFilter::Employee(id) => engine.employee_allocations(id).await,
                    AllocationFilter::Project(id) => engine.project_allocations(id).await,
                    AllocationFilter::Phase(id) => engine.phase_allocations(id).await,
                    AllocationFilter::Assignment {
                        employee_id,
                        project_id,
                        phase_id,
                    } => {
                        engine
                            .find_existing_allocations(employee_id, project_id, phase_id)
                            .await
                    }
                }
                .map_err(engine_err)?;
                allocation_rows(allocations)
            }
            Command::SelectOverlaps { window } => {
                let overlaps = engine
                    .find_overlaps(window.employee_id, window.start, window.end, window.exclude_id)
                    .await
                    .map_err(engine_err)?;
                overlap_rows(overlaps)
            }
            Command::SelectOverridePlan { window } => {
                let plan = engine
                    .check_override_possibility(
                        window.employee_id,
                        window.start,
                        window.end,
                        window.exclude_id,
                    )
                    .await
                    .map_err(engine_err)?;
                plan_rows(plan)
            }
            Command::ExecuteOverride { window } => {
                let outcome = engine
                    .override_conflicting_allocations(
                        window.employee_id,
                        window.start,
                        window.end,
                        window.exclude_id,
                    )
                    .await
                    .map_err(engine_err)?;
                let touched = outcome.deleted.len() + outcome.modified.len();
                Ok(Response::Execution(Tag::new("DELETE").with_rows(touched)))
            }
            Command::SelectAvailability {
                employee_id,
                start,
                end,
            } => {
                let free = engine
                    .employee_availability(employee_id, start, end)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let employee = employee_id.to_string();
                let rows: Vec<PgWireResult<DataRow>> = free
                    .into_iter()
                    .map(|span| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&employee)?;
                        encoder.encode_field(&span.start)?;
                        encoder.encode_field(&span.end)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn allocation_fields() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("employee_id", Type::VARCHAR),
        text_field("project_id", Type::VARCHAR),
        text_field("phase_id", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
    ]
}

fn allocation_schema() -> Vec<FieldInfo> {
    allocation_fields()
}

fn overlap_schema() -> Vec<FieldInfo> {
    let mut fields = allocation_fields();
    fields.push(text_field("kind", Type::VARCHAR));
    fields
}

/// One row per affected allocation; `action` is `conflict`, `delete` or
/// `modify`. No `conflict` rows means the override can proceed.
fn plan_schema() -> Vec<FieldInfo> {
    let mut fields = vec![text_field("action", Type::VARCHAR)];
    fields.extend(allocation_fields());
    fields.push(text_field("new_start", Type::INT8));
    fields.push(text_field("new_end", Type::INT8));
    fields
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("employee_id", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
    ]
}

fn encode_allocation(encoder: &mut DataRowEncoder, a: &Allocation) -> PgWireResult<()> {
    encoder.encode_field(&a.id.to_string())?;
    encoder.encode_field(&a.employee_id.to_string())?;
    encoder.encode_field(&a.project_id.to_string())?;
    encoder.encode_field(&a.phase_id.map(|p| p.to_string()))?;
    encoder.encode_field(&a.span.start)?;
    encoder.encode_field(&a.span.end)?;
    Ok(())
}

fn allocation_rows(allocations: Vec<Allocation>) -> PgWireResult<Response> {
    let schema = Arc::new(allocation_schema());
    let rows: Vec<PgWireResult<DataRow>> = allocations
        .iter()
        .map(|a| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode_allocation(&mut encoder, a)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn overlap_rows(overlaps: Vec<Overlap>) -> PgWireResult<Response> {
    let schema = Arc::new(overlap_schema());
    let rows: Vec<PgWireResult<DataRow>> = overlaps
        .iter()
        .map(|o| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode_allocation(&mut encoder, &o.allocation)?;
            encoder.encode_field(&o.kind.as_str())?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn plan_rows(plan: OverridePlan) -> PgWireResult<Response> {
    let schema = Arc::new(plan_schema());
    let encode = |action: &str, a: &Allocation, new_span: Option<Span>| -> PgWireResult<DataRow> {
        let mut encoder = DataRowEncoder::new(schema.clone());
        encoder.encode_field(&action)?;
        encode_allocation(&mut encoder, a)?;
        encoder.encode_field(&new_span.map(|s| s.start))?;
        encoder.encode_field(&new_span.map(|s| s.end))?;
        Ok(encoder.take_row())
    };

    let mut rows: Vec<PgWireResult<DataRow>> = Vec::new();
    rows.extend(plan.conflicts.iter().map(|a| encode("conflict", a, None)));
    rows.extend(plan.would_delete.iter().map(|a| encode("delete", a, None)));
    rows.extend(
        plan.would_modify
            .iter()
            .map(|t| encode("modify", &t.allocation, Some(t.new_span()))),
    );
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// Result columns for a statement, empty for commands without rows.
fn schema_for(sql: &str) -> Vec<FieldInfo> {
    match sql::result_shape(sql) {
        Some(ResultShape::Allocations) => allocation_schema(),
        Some(ResultShape::Overlaps) => overlap_schema(),
        Some(ResultShape::OverridePlan) => plan_schema(),
        Some(ResultShape::Availability) => availability_schema(),
        None => Vec::new(),
    }
}

#[async_trait]
impl SimpleQueryHandler for AllocdHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        Ok(vec![self.execute(&engine, cmd).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct AllocdQueryParser;

#[async_trait]
impl QueryParser for AllocdQueryParser {
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
        Ok(schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for AllocdHandler {
    type Statement = String;
    type QueryParser = AllocdQueryParser;

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
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.execute(&engine, cmd).await
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
            schema_for(&target.statement),
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
        Ok(DescribePortalResponse::new(schema_for(&substitute_params(
            target,
        ))))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
/// `$N` placeholders in `sql`: byte range of each and its parameter number.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let mut found = Vec::new();
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            let dollar = i;
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                found.push((dollar..i, n));
            }
        } else {
            i += 1;
        }
    }
    found
}

fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Single left-to-right pass: text spliced in for one placeholder is never
/// scanned again.
fn substitute(sql: &str, params: &[Option<String>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    for (range, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
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

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    substitute(&portal.statement.statement, &params)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct AllocdFactory {
    handler: Arc<AllocdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<AllocdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl AllocdFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = AllocdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(AllocdHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for AllocdFactory {
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
) -> std::io::Result<()> {
    let factory = AllocdFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidInterval { .. } => "22007",
        EngineError::InvalidReference(..) => "23503",
        EngineError::Overlap(_) | EngineError::Conflict { .. } => "23P01",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::NotFound(_) | EngineError::Store(_) => "P0001",
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
    let code = match e {
        SqlError::EmptyInterval(..) => "22007",
        _ => "42601",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}
