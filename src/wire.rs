use std::fmt::Debug;
use std::io;
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

use crate::auth::AllotmentAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, AllocationFilter, Command, ConflictScope};

pub struct AllotmentHandler {
    engine: Arc<Engine>,
    query_parser: Arc<AllotmentQueryParser>,
}

impl AllotmentHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(AllotmentQueryParser),
        }
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::InsertResource(new) => {
                let resource = engine.create_resource(new).await.map_err(engine_err)?;
                Ok(vec![id_response(&resource.id.to_string())])
            }
            Command::SetResourceStatus { resource_id, status } => {
                let patch = ResourcePatch {
                    status: Some(status),
                    ..ResourcePatch::default()
                };
                engine
                    .update_resource(resource_id, patch)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteResource { id } => {
                engine.remove_resource(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertCapacity { resource_id, capacity } => {
                let capacity = engine
                    .add_capacity(resource_id, capacity)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![id_response(&capacity.id.to_string())])
            }
            Command::DeleteCapacity { id } => {
                engine.remove_capacity(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertAllocation(request) => {
                let allocation = engine.allocate(request).await.map_err(engine_err)?;
                Ok(vec![id_response(&allocation.id.to_string())])
            }
            Command::DeleteAllocation { id } => {
                engine.remove_allocation(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::Transition { allocation_id, status } => {
                engine
                    .transition_allocation(allocation_id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::Optimize { project_id, requests } => {
                let outcome = engine
                    .optimize(&project_id, requests)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![optimize_response(outcome)])
            }
            Command::SelectResources { search, kind } => {
                let resources = engine
                    .search_resources(search.as_deref().unwrap_or(""), kind)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![rows(resource_schema(), resources, |enc, r| {
                    enc.encode_field(&r.id.to_string())?;
                    enc.encode_field(&r.kind.to_string())?;
                    enc.encode_field(&r.name)?;
                    enc.encode_field(&r.code)?;
                    enc.encode_field(&r.status.to_string())?;
                    enc.encode_field(&r.skills.join(","))?;
                    enc.encode_field(&r.certifications.join(","))?;
                    enc.encode_field(&r.cost.as_ref().map(|c| c.rate))?;
                    enc.encode_field(&r.cost.as_ref().map(|c| c.basis.to_string()))?;
                    enc.encode_field(&r.cost.as_ref().map(|c| c.currency.clone()))?;
                    enc.encode_field(&r.created_at.to_rfc3339())
                })])
            }
            Command::SelectCapacities { resource_id } => {
                let capacities = engine.capacities(resource_id).await.map_err(engine_err)?;
                Ok(vec![rows(capacity_schema(), capacities, |enc, c| {
                    enc.encode_field(&c.id.to_string())?;
                    enc.encode_field(&c.resource_id.to_string())?;
                    enc.encode_field(&c.start.to_string())?;
                    enc.encode_field(&c.end.to_string())?;
                    enc.encode_field(&qty(c.quantity))?;
                    enc.encode_field(&c.unit)
                })])
            }
            Command::SelectAllocations(filter) => {
                let allocations = select_allocations(engine, &filter)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![rows(allocation_schema(), allocations, |enc, a| {
                    enc.encode_field(&a.id.to_string())?;
                    enc.encode_field(&a.resource_id.to_string())?;
                    enc.encode_field(&a.project_id)?;
                    enc.encode_field(&a.task_id)?;
                    enc.encode_field(&a.start.to_string())?;
                    enc.encode_field(&a.end.to_string())?;
                    enc.encode_field(&qty(a.quantity))?;
                    enc.encode_field(&a.status.to_string())?;
                    enc.encode_field(&a.priority.to_string())?;
                    enc.encode_field(&a.notes)
                })])
            }
            Command::SelectConflicts { scope, start, end } => {
                let conflicts = match scope {
                    ConflictScope::Resource(id) => engine.conflicts(id, start, end).await,
                    ConflictScope::Project(project) => {
                        engine.conflicts_for_project(&project, start, end).await
                    }
                }
                .map_err(engine_err)?;
                Ok(vec![rows(conflict_schema(), conflicts, |enc, c| {
                    let ids: Vec<String> = c.allocation_ids.iter().map(|id| id.to_string()).collect();
                    enc.encode_field(&c.resource_id.to_string())?;
                    enc.encode_field(&c.kind.to_string())?;
                    enc.encode_field(&c.start.to_string())?;
                    enc.encode_field(&c.end.to_string())?;
                    enc.encode_field(&qty(c.required))?;
                    enc.encode_field(&qty(c.available))?;
                    enc.encode_field(&ids.join(","))
                })])
            }
            Command::SelectUtilization {
                resource_id,
                start,
                end,
            } => {
                let report = match resource_id {
                    Some(id) => engine.utilization(id, start, end).await.map(|u| vec![u]),
                    None => engine.utilization_all(start, end).await,
                }
                .map_err(engine_err)?;
                Ok(vec![rows(utilization_schema(), report, |enc, u| {
                    enc.encode_field(&u.resource_id.to_string())?;
                    enc.encode_field(&u.start.to_string())?;
                    enc.encode_field(&u.end.to_string())?;
                    enc.encode_field(&qty(u.capacity_days))?;
                    enc.encode_field(&qty(u.allocated_days))?;
                    enc.encode_field(&u.rate)
                })])
            }
        }
    }
}

/// Narrowest engine query for the filter, then the remaining fields applied in place.
async fn select_allocations(
    engine: &Engine,
    filter: &AllocationFilter,
) -> Result<Vec<ResourceAllocation>, EngineError> {
    let mut found = if let Some(resource_id) = filter.resource_id {
        engine.allocations_by_resource(resource_id).await?
    } else if let Some(project_id) = &filter.project_id {
        engine.allocations_by_project(project_id).await?
    } else if let Some(status) = filter.status {
        engine.allocations_by_status(status).await
    } else {
        engine.all_allocations().await
    };
    found.retain(|a| filter.matches(a));
    Ok(found)
}

fn optimize_response(outcome: OptimizationOutcome) -> Response {
    enum Row {
        Accepted(ResourceAllocation),
        Rejected(RejectedRequest),
    }
    let all = outcome
        .accepted
        .into_iter()
        .map(Row::Accepted)
        .chain(outcome.rejected.into_iter().map(Row::Rejected));

    rows(optimize_schema(), all, |enc, row| match row {
        Row::Accepted(a) => {
            enc.encode_field(&"accepted".to_string())?;
            enc.encode_field(&Some(a.id.to_string()))?;
            enc.encode_field(&a.resource_id.to_string())?;
            enc.encode_field(&a.start.to_string())?;
            enc.encode_field(&a.end.to_string())?;
            enc.encode_field(&qty(a.quantity))?;
            enc.encode_field(&a.priority.to_string())?;
            enc.encode_field(&None::<String>)
        }
        Row::Rejected(r) => {
            enc.encode_field(&"rejected".to_string())?;
            enc.encode_field(&None::<String>)?;
            enc.encode_field(&r.request.resource_id.to_string())?;
            enc.encode_field(&r.request.start.to_string())?;
            enc.encode_field(&r.request.end.to_string())?;
            enc.encode_field(&qty(r.request.quantity))?;
            enc.encode_field(&r.request.priority.to_string())?;
            enc.encode_field(&Some(describe_rejection(r.index, &r.reason)))
        }
    })
}

fn describe_rejection(index: usize, reason: &RejectionReason) -> String {
    match reason {
        RejectionReason::CapacityExceeded {
            start,
            end,
            required,
            available,
        } => format!(
            "request {index}: {}: {start}..{end} requires {required}, {available} available",
            reason.code()
        ),
        RejectionReason::ResourceUnavailable { status } => {
            format!("request {index}: {}: resource is {status}", reason.code())
        }
    }
}

/// Encode every item as one data row under `schema`.
fn rows<T>(
    schema: Vec<FieldInfo>,
    items: impl IntoIterator<Item = T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn id_response(id: &str) -> Response {
    rows(id_schema(), [id.to_string()], |enc, id| enc.encode_field(&id))
}

/// Postgres has no unsigned integers; quantities are bounded well below `i64::MAX`.
fn qty(q: u64) -> i64 {
    i64::try_from(q).unwrap_or(i64::MAX)
}

// ── Row schemas ──────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn id_schema() -> Vec<FieldInfo> {
    vec![field("id", Type::VARCHAR)]
}

fn resource_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("kind", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("code", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("skills", Type::VARCHAR),
        field("certifications", Type::VARCHAR),
        field("rate", Type::FLOAT8),
        field("basis", Type::VARCHAR),
        field("currency", Type::VARCHAR),
        field("created_at", Type::VARCHAR),
    ]
}

fn capacity_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("resource_id", Type::VARCHAR),
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
        field("quantity", Type::INT8),
        field("unit", Type::VARCHAR),
    ]
}

fn allocation_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("resource_id", Type::VARCHAR),
        field("project_id", Type::VARCHAR),
        field("task_id", Type::VARCHAR),
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
        field("quantity", Type::INT8),
        field("status", Type::VARCHAR),
        field("priority", Type::VARCHAR),
        field("notes", Type::VARCHAR),
    ]
}

fn conflict_schema() -> Vec<FieldInfo> {
    vec![
        field("resource_id", Type::VARCHAR),
        field("kind", Type::VARCHAR),
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
        field("required", Type::INT8),
        field("available", Type::INT8),
        field("allocation_ids", Type::VARCHAR),
    ]
}

fn utilization_schema() -> Vec<FieldInfo> {
    vec![
        field("resource_id", Type::VARCHAR),
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
        field("capacity_days", Type::INT8),
        field("allocated_days", Type::INT8),
        field("rate", Type::FLOAT8),
    ]
}

fn optimize_schema() -> Vec<FieldInfo> {
    vec![
        field("outcome", Type::VARCHAR),
        field("allocation_id", Type::VARCHAR),
        field("resource_id", Type::VARCHAR),
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
        field("quantity", Type::INT8),
        field("priority", Type::VARCHAR),
        field("reason", Type::VARCHAR),
    ]
}

/// Result columns for a statement that may still hold `$n` placeholders.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let mut words = lower.split_whitespace();
    let verb = words.next().unwrap_or_default();
    let table = words
        .skip_while(|w| *w != "from" && *w != "into")
        .nth(1)
        .map(|t| t.split('(').next().unwrap_or_default().trim_matches(|c| c == '"' || c == ';'))
        .unwrap_or_default();

    match (verb, table) {
        ("select", "resources") => resource_schema(),
        ("select", "capacities") => capacity_schema(),
        ("select", "allocations") => allocation_schema(),
        ("select", "conflicts") => conflict_schema(),
        ("select", "utilization") => utilization_schema(),
        ("insert", "resources" | "capacities" | "allocations") => id_schema(),
        ("insert", "optimize") => optimize_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for AllotmentHandler {
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
        self.run(query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct AllotmentQueryParser;

#[async_trait]
impl QueryParser for AllotmentQueryParser {
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
impl ExtendedQueryHandler for AllotmentHandler {
    type Statement = String;
    type QueryParser = AllotmentQueryParser;

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
        let mut responses = self.run(&sql).await?;
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

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Substitute `$1, $2, ...` with bound parameter values (text format) as quoted literals.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    // Highest index first so `$1` never clobbers the prefix of `$10`.
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct AllotmentFactory {
    handler: Arc<AllotmentHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<AllotmentAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl AllotmentFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(AllotmentHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                AllotmentAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for AllotmentFactory {
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
) -> io::Result<()> {
    let factory = AllotmentFactory::new(engine, password);
    pgwire::tokio::process_socket(socket, tls, factory)
        .await
        .map_err(io::Error::other)
}

/// SQLSTATE for an engine error. `Busy` reports as a serialization failure.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Busy { .. } => "40001",
        _ => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
