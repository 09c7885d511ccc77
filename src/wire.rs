use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
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
use tracing::{debug, error};

use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::scheduling::{AgendaEntry, Scheduler, SchedulingError};
use crate::sql::{self, Command, SqlError};
use crate::store::WalStore;

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    scheduler: Arc<Scheduler>,
    store: Arc<WalStore>,
    password: String,
) -> std::io::Result<()> {
    let factory = ChairbookFactory::new(scheduler, store, password);
    pgwire::tokio::process_socket(socket, None, factory).await
}

pub struct ChairbookHandler {
    scheduler: Arc<Scheduler>,
    store: Arc<WalStore>,
    query_parser: Arc<ChairbookQueryParser>,
}

impl ChairbookHandler {
    pub fn new(scheduler: Arc<Scheduler>, store: Arc<WalStore>) -> Self {
        Self {
            scheduler,
            store,
            query_parser: Arc::new(ChairbookQueryParser),
        }
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.dispatch(cmd).await;
        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(response) => Ok(response),
            Err(e) => {
                if matches!(e, SchedulingError::Store(_)) {
                    error!(command = label, error = %e, "statement failed");
                } else {
                    debug!(command = label, error = %e, "statement rejected");
                }
                Err(scheduling_err(e))
            }
        }
    }

    async fn dispatch(&self, cmd: Command) -> Result<Response, SchedulingError> {
        match cmd {
            Command::InsertShop { shop } => {
                self.store.create_shop(shop).await?;
                Ok(inserted())
            }
            Command::InsertProvider { provider } => {
                self.store.add_provider(provider).await?;
                Ok(inserted())
            }
            Command::DeleteProvider { id } => {
                self.store.remove_provider(id).await?;
                Ok(deleted())
            }
            Command::InsertService { service } => {
                self.store.add_service(service).await?;
                Ok(inserted())
            }
            Command::DeleteService { id } => {
                self.store.remove_service(id).await?;
                Ok(deleted())
            }
            Command::InsertAppointment(request) => {
                self.scheduler.book(request).await?;
                Ok(inserted())
            }
            Command::DeleteAppointment { id } => {
                self.scheduler.cancel_appointment(id).await?;
                Ok(deleted())
            }
            Command::SelectSlots {
                shop,
                provider_id,
                day,
                duration_min,
            } => {
                let slots = self
                    .scheduler
                    .available_slots(&shop, day, duration_min, provider_id)
                    .await?;

                let schema = Arc::new(slots_schema());
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&slot)?;
                        Ok(encoder.take_row())
                    })
                    .collect();

                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectAppointments { provider_id, day } => {
                let agenda = self.scheduler.appointments_on(provider_id, day).await?;

                let schema = Arc::new(agenda_schema());
                let rows: Vec<PgWireResult<_>> = agenda
                    .into_iter()
                    .map(|entry| encode_agenda_row(&schema, entry))
                    .collect();

                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

fn inserted() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

fn deleted() -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(1))
}

fn encode_agenda_row(
    schema: &Arc<Vec<FieldInfo>>,
    entry: AgendaEntry,
) -> PgWireResult<pgwire::messages::data::DataRow> {
    let a = entry.appointment;
    let services = a
        .service_ids
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",");

    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&a.id.to_string())?;
    encoder.encode_field(&entry.local_start.format("%Y-%m-%d %H:%M").to_string())?;
    encoder.encode_field(&i64::from(a.duration_min))?;
    encoder.encode_field(&a.client_name)?;
    encoder.encode_field(&a.client_email)?;
    encoder.encode_field(&services)?;
    Ok(encoder.take_row())
}

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![text_field("slot")]
}

fn agenda_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("starts_at"),
        FieldInfo::new("duration".into(), None, None, Type::INT8, FieldFormat::Text),
        text_field("client_name"),
        text_field("client_email"),
        text_field("services"),
    ]
}

/// Row shape of a statement, judged from its `FROM` table. Empty for
/// anything that is not a SELECT.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let mut words = sql
        .split_whitespace()
        .map(|w| w.trim_end_matches(';').to_ascii_lowercase());
    if words.next().as_deref() != Some("select") {
        return vec![];
    }
    match words.skip_while(|w| w != "from").nth(1).as_deref() {
        Some("slots") => slots_schema(),
        Some("appointments") => agenda_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for ChairbookHandler {
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
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        Ok(vec![self.execute_command(cmd).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ChairbookQueryParser;

#[async_trait]
impl QueryParser for ChairbookQueryParser {
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
impl ExtendedQueryHandler for ChairbookHandler {
    type Statement = String;
    type QueryParser = ChairbookQueryParser;

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
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.execute_command(cmd).await
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

/// Highest `$N` placeholder in the statement.
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

/// Inline bound parameters as quoted text literals. Highest index first so
/// `$1` does not clobber `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let values: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    inline_params(&portal.statement.statement, &values)
}

fn inline_params(sql: &str, values: &[Option<String>]) -> String {
    let mut result = sql.to_string();
    for (i, value) in values.iter().enumerate().rev() {
        let literal = match value {
            Some(text) => format!("'{}'", text.replace('\'', "''")),
            None => "NULL".to_string(),
        };
        result = result.replace(&format!("${}", i + 1), &literal);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

/// One shared password for every login; the user name is not checked.
#[derive(Debug)]
pub struct SharedPasswordSource {
    password: String,
}

#[async_trait]
impl AuthSource for SharedPasswordSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

pub struct ChairbookFactory {
    handler: Arc<ChairbookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SharedPasswordSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl ChairbookFactory {
    pub fn new(scheduler: Arc<Scheduler>, store: Arc<WalStore>, password: String) -> Self {
        let auth_source = SharedPasswordSource { password };
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ChairbookHandler::new(scheduler, store)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ChairbookFactory {
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

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE for each scheduling failure. Conflicts get their own code so
/// clients refresh slots instead of retrying.
fn sqlstate(e: &SchedulingError) -> &'static str {
    match e {
        SchedulingError::Validation(_) => "22023",
        SchedulingError::Conflict(_) => "23P01",
        SchedulingError::TransientStore(_) => "40001",
        SchedulingError::Config(_) => "F0000",
        SchedulingError::NotFound(_) => "42704",
        SchedulingError::AlreadyExists(_) => "23505",
        SchedulingError::LimitExceeded(_) => "54000",
        SchedulingError::Store(_) => "58030",
    }
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn scheduling_err(e: SchedulingError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::BadValue(..) => "22023",
        _ => "42601",
    };
    metrics::counter!(QUERIES_TOTAL, "command" => "unparsed", "status" => "syntax").increment(1);
    user_error(code, e.to_string())
}
