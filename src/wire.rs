use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::{Sink, SinkExt};
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
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::{process_socket, TlsAcceptor};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::auth::SharedPasswordSource;
use crate::context::{AppContext, AppError};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command};

/// One per connection: LISTEN subscriptions live here.
pub struct OrschedHandler {
    ctx: Arc<AppContext>,
    query_parser: Arc<OrschedQueryParser>,
    subscriptions: Mutex<Vec<(String, broadcast::Receiver<Event>)>>,
}

impl OrschedHandler {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self {
            ctx,
            query_parser: Arc::new(OrschedQueryParser),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    async fn listen(&self, channel: String) -> PgWireResult<Response> {
        if !NotifyHub::is_valid_channel(&channel) {
            return Err(user_error(
                "42000",
                format!("invalid channel: {channel} (expected notifications or case_{{id}})"),
            ));
        }
        if let Some(id) = channel.strip_prefix("case_") {
            if !self.ctx.store.has_case(id) {
                return Err(user_error("P0002", format!("case {id} not found")));
            }
        }
        let mut subs = self.subscriptions.lock().await;
        if !subs.iter().any(|(name, _)| *name == channel) {
            let rx = self.ctx.store.notify.subscribe(&channel);
            subs.push((channel, rx));
        }
        Ok(Response::Execution(Tag::new("LISTEN")))
    }

    /// Drain events published since the last statement on this connection.
    async fn pending_notifications(&self) -> Vec<NotificationResponse> {
        let mut subs = self.subscriptions.lock().await;
        let mut out = Vec::new();
        subs.retain_mut(|(channel, rx)| loop {
            match rx.try_recv() {
                Ok(event) => out.push(NotificationResponse::new(
                    0,
                    channel.clone(),
                    notification_payload(&event),
                )),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!("listener on {channel} lagged, {skipped} events dropped");
                }
                Err(broadcast::error::TryRecvError::Empty) => break true,
                Err(broadcast::error::TryRecvError::Closed) => break false,
            }
        });
        out
    }

    async fn flush_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        for note in self.pending_notifications().await {
            client
                .send(PgWireBackendMessage::NotificationResponse(note))
                .await?;
        }
        Ok(())
    }

    async fn run(&self, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let ctx = &self.ctx;
        match cmd {
            Command::InsertCase { input } => {
                let case = ctx.submit_case(input).await.map_err(app_err)?;
                Ok(case_rows(vec![case]))
            }
            Command::ScheduleCase { case_id } => {
                let case = ctx.schedule_case(&case_id).await.map_err(app_err)?;
                Ok(case_rows(vec![case]))
            }
            Command::DeleteCase { id } => {
                let removed = ctx.delete_case(&id).await.map_err(app_err)?;
                Ok(Response::Execution(
                    Tag::new("DELETE").with_rows(usize::from(removed)),
                ))
            }
            Command::SelectCases { id: Some(id) } => {
                let case = ctx.store.get_case(&id).await.map_err(store_err)?;
                Ok(case_rows(case.into_iter().collect()))
            }
            Command::SelectCases { id: None } => {
                let cases = ctx.store.list_cases().await.map_err(store_err)?;
                Ok(case_rows(cases))
            }
            Command::SelectTasks { case_id } => {
                let tasks = ctx
                    .store
                    .get_case(&case_id)
                    .await
                    .map_err(store_err)?
                    .map(|c| c.tasks)
                    .unwrap_or_default();
                Ok(task_rows(tasks))
            }
            Command::SelectRooms => Ok(room_rows(ctx.store.list_rooms().await)),
            Command::SelectNotifications { limit } => {
                Ok(notification_rows(ctx.store.list_notifications(limit).await))
            }
            Command::SelectSnapshot => {
                let snapshot = ctx.snapshot().await.map_err(app_err)?;
                Ok(snapshot_rows(snapshot))
            }
            Command::SelectAvailability { start, end } => {
                let span = Span::checked(start, end).ok_or_else(|| {
                    user_error("22023", "availability window must have start < end".into())
                })?;
                let room = ctx.store.find_available_room(&span).await;
                Ok(room_rows(room.into_iter().collect()))
            }
            Command::Listen { channel } => self.listen(channel).await,
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn case_schema() -> Vec<FieldInfo> {
    [
        "id",
        "patient_name",
        "procedure_name",
        "priority",
        "requested_datetime",
        "status",
        "created_at",
        "updated_at",
    ]
    .into_iter()
    .map(text_field)
    .collect()
}

fn task_schema() -> Vec<FieldInfo> {
    [
        "id",
        "case_id",
        "name",
        "status",
        "room_id",
        "scheduled_start",
        "scheduled_end",
    ]
    .into_iter()
    .map(text_field)
    .collect()
}

fn room_schema() -> Vec<FieldInfo> {
    vec![text_field("id"), text_field("name")]
}

fn notification_schema() -> Vec<FieldInfo> {
    vec![int8_field("id"), text_field("timestamp"), text_field("message")]
}

fn snapshot_schema() -> Vec<FieldInfo> {
    vec![
        int8_field("total_cases"),
        int8_field("total_rooms"),
        text_field("cases_by_status"),
    ]
}

/// Build a query response, encoding each item with `encode`.
fn rows<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let data: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(data)))
}

fn case_rows(cases: Vec<SurgeryCase>) -> Response {
    rows(case_schema(), cases, |encoder, case| {
        encoder.encode_field(&case.id)?;
        encoder.encode_field(&case.patient_name)?;
        encoder.encode_field(&case.procedure_name)?;
        encoder.encode_field(&case.priority.as_str().to_string())?;
        encoder.encode_field(&format_iso(case.requested_at))?;
        encoder.encode_field(&case.status.as_str().to_string())?;
        encoder.encode_field(&format_iso(case.created_at))?;
        encoder.encode_field(&format_iso(case.updated_at))?;
        Ok(())
    })
}

fn task_rows(tasks: Vec<SurgeryTask>) -> Response {
    rows(task_schema(), tasks, |encoder, task| {
        encoder.encode_field(&task.id)?;
        encoder.encode_field(&task.case_id)?;
        encoder.encode_field(&task.name)?;
        encoder.encode_field(&task.status.as_str().to_string())?;
        encoder.encode_field(&task.room_id)?;
        encoder.encode_field(&task.window.map(|w| format_iso(w.start)))?;
        encoder.encode_field(&task.window.map(|w| format_iso(w.end)))?;
        Ok(())
    })
}

fn room_rows(rooms: Vec<OrRoom>) -> Response {
    rows(room_schema(), rooms, |encoder, room| {
        encoder.encode_field(&room.id)?;
        encoder.encode_field(&room.name)?;
        Ok(())
    })
}

fn notification_rows(notes: Vec<Notification>) -> Response {
    rows(notification_schema(), notes, |encoder, note| {
        encoder.encode_field(&(note.seq as i64))?;
        encoder.encode_field(&format_iso(note.at))?;
        encoder.encode_field(&note.message)?;
        Ok(())
    })
}

fn snapshot_rows(snapshot: Snapshot) -> Response {
    rows(snapshot_schema(), vec![snapshot], |encoder, snap| {
        encoder.encode_field(&(snap.total_cases as i64))?;
        encoder.encode_field(&(snap.total_rooms as i64))?;
        encoder.encode_field(&json!(snap.cases_by_status).to_string())?;
        Ok(())
    })
}

/// Result columns for a statement, judged from its target table.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    let words: Vec<&str> = upper
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .collect();
    if words.first() == Some(&"DELETE") {
        return vec![];
    }
    let table = words
        .windows(2)
        .find(|pair| pair[0] == "FROM" || pair[0] == "INTO")
        .map(|pair| pair[1]);
    match table {
        Some("CASES") | Some("SCHEDULES") => case_schema(),
        Some("TASKS") => task_schema(),
        Some("ROOMS") | Some("AVAILABILITY") => room_schema(),
        Some("NOTIFICATIONS") => notification_schema(),
        Some("SNAPSHOT") => snapshot_schema(),
        _ => vec![],
    }
}

fn notification_payload(event: &Event) -> String {
    match event {
        Event::NotificationAdded { seq, at, message } => {
            json!({ "seq": seq, "at": format_iso(*at), "message": message })
        }
        Event::CaseUpserted { case } => {
            json!({ "case_id": case.id, "status": case.status.as_str() })
        }
        Event::CaseDeleted { id } => json!({ "case_id": id, "deleted": true }),
    }
    .to_string()
}

impl Drop for OrschedHandler {
    fn drop(&mut self) {
        let notify = &self.ctx.store.notify;
        for (channel, rx) in self.subscriptions.get_mut().drain(..) {
            drop(rx);
            notify.release_idle(&channel);
        }
    }
}

#[async_trait]
impl SimpleQueryHandler for OrschedHandler {
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
        self.flush_notifications(client).await?;
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct OrschedQueryParser;

#[async_trait]
impl QueryParser for OrschedQueryParser {
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
impl ExtendedQueryHandler for OrschedHandler {
    type Statement = String;
    type QueryParser = OrschedQueryParser;

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
        self.flush_notifications(client).await?;
        let sql = substitute_params(portal);
        debug!("extended query: {sql}");
        self.run(&sql).await
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
/// One left-to-right pass, so text inside a bound value is never rescanned.
/// Placeholders without a matching parameter are copied through.
fn substitute(sql: &str, params: &[Option<String>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        result.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.len() - after.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        let param = after[..digits]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| params.get(i));
        match param {
            Some(Some(text)) => {
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            Some(None) => result.push_str("NULL"),
            None => result.push_str(&rest[pos..pos + 1 + digits]),
        }
        rest = &after[digits..];
    }
    result.push_str(rest);
    result
}

fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    substitute(&portal.statement.statement, &params)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct OrschedFactory {
    handler: Arc<OrschedHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SharedPasswordSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl OrschedFactory {
    pub fn new(ctx: Arc<AppContext>, password: String) -> Self {
        let auth_source = SharedPasswordSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(OrschedHandler::new(ctx)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for OrschedFactory {
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

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    ctx: Arc<AppContext>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    process_socket(socket, tls, OrschedFactory::new(ctx, password)).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn sqlstate(e: &AppError) -> &'static str {
    match e {
        AppError::InvalidInput(_) => "22023",
        AppError::NotFound(_) => "P0002",
        AppError::Unschedulable(_) => "55000",
        AppError::Store(_) => "P0001",
        AppError::Protocol(_) => "XX000",
    }
}

fn app_err(e: AppError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn store_err(e: crate::store::StoreError) -> PgWireError {
    app_err(AppError::from(e))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
