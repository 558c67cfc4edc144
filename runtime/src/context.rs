//! The capability object handed to indexer code as `context`.
//!
//! Everything indexer code can reach outside its own variables goes through
//! here: GraphQL as the indexer's role, its own tables, the social API and
//! its log. All calls finish before returning to the script, and none of
//! them outlives the execution deadline.
use anyhow::Context as _;
use hasura_client::MetadataClient;
use indexer_common::consts::{COMPONENT_NAME, SOCIAL_API_URL};
use indexer_common::{IndexerConfig, LogEntry, LogLevel};
use indexer_schema::SchemaDefinition;
use indexer_storage_postgres::{DmlHandler, TenantConnector};
use rhai::serde::{from_dynamic, to_dynamic};
use lazy_static::lazy_static;
use rhai::{Array, Dynamic, Engine, EvalAltResult, ImmutableString, Map, Position};
use serde_json::Value;
use std::env;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;

lazy_static! {
    /// Upper bound for a single social API request.
    pub static ref SOCIAL_API_TIMEOUT: Duration = env::var("SOCIAL_API_TIMEOUT_MS")
        .ok()
        .and_then(|val| val.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_secs(10));
}

pub type ScriptResult = Result<Dynamic, Box<EvalAltResult>>;

fn script_error(err: impl std::fmt::Display) -> Box<EvalAltResult> {
    err.to_string().into()
}

fn terminated() -> Box<EvalAltResult> {
    EvalAltResult::ErrorTerminated(Dynamic::UNIT, Position::NONE).into()
}

/// Wall-clock limit shared by every host call of one execution.
/// Unset means unlimited.
#[derive(Clone, Debug, Default)]
pub struct Deadline(Arc<Mutex<Option<Instant>>>);

impl Deadline {
    pub fn set(&self, at: Instant) {
        match self.0.lock() {
            Ok(mut deadline) => *deadline = Some(at),
            Err(poisoned) => *poisoned.into_inner() = Some(at),
        }
    }

    fn get(&self) -> Option<Instant> {
        match self.0.lock() {
            Ok(deadline) => *deadline,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Time left, or a termination error once the deadline has passed.
    pub fn remaining(&self) -> Result<Option<Duration>, Box<EvalAltResult>> {
        match self.get() {
            None => Ok(None),
            Some(at) => {
                let now = Instant::now();
                if now >= at {
                    Err(terminated())
                } else {
                    Ok(Some(at - now))
                }
            }
        }
    }
}

fn to_value(value: &Dynamic) -> Result<Value, Box<EvalAltResult>> {
    from_dynamic(value)
}

/// Log entries collected during one execution. Entries below the indexer's
/// level are dropped on the way in.
#[derive(Clone, Debug)]
pub struct LogBuffer {
    level: LogLevel,
    block_height: Option<u64>,
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl LogBuffer {
    pub fn new(level: LogLevel, block_height: Option<u64>) -> Self {
        LogBuffer {
            level,
            block_height,
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn block_height(&self) -> Option<u64> {
        self.block_height
    }

    pub fn push(&self, entry: LogEntry) {
        if entry.level < self.level {
            return;
        }
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }

    pub fn user(&self, level: LogLevel, message: impl Into<String>) {
        self.push(LogEntry::user(level, message, self.block_height));
    }

    pub fn take(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .map(|mut entries| std::mem::take(&mut *entries))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Strings print as they are, everything else as JSON.
fn format_log_value(value: &Dynamic) -> String {
    if value.is::<ImmutableString>() {
        return value.to_string();
    }
    match to_value(value) {
        Ok(json) => json.to_string(),
        Err(_) => value.to_string(),
    }
}

/// One table under `context.db`.
#[derive(Clone)]
pub struct DbTable {
    table_name: String,
    handler: DmlHandler,
    deadline: Deadline,
}

impl DbTable {
    pub fn new(table_name: impl Into<String>, handler: DmlHandler, deadline: Deadline) -> Self {
        DbTable {
            table_name: table_name.into(),
            handler,
            deadline,
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    fn rows(result: Result<Vec<Value>, indexer_storage_postgres::StoreError>) -> ScriptResult {
        to_dynamic(result.map_err(script_error)?)
    }

    fn insert(&mut self, rows: Dynamic) -> ScriptResult {
        self.deadline.remaining()?;
        Self::rows(self.handler.insert(&self.table_name, to_value(&rows)?))
    }

    fn select(&mut self, filter: Dynamic, limit: Option<i64>) -> ScriptResult {
        let limit = match limit {
            Some(limit) if limit < 0 => return Err(script_error("limit must not be negative")),
            Some(limit) => Some(limit as u64),
            None => None,
        };
        self.deadline.remaining()?;
        Self::rows(
            self.handler
                .select(&self.table_name, to_value(&filter)?, limit),
        )
    }

    fn update(&mut self, filter: Dynamic, values: Dynamic) -> ScriptResult {
        self.deadline.remaining()?;
        Self::rows(self.handler.update(
            &self.table_name,
            to_value(&filter)?,
            to_value(&values)?,
        ))
    }

    fn upsert(&mut self, rows: Dynamic, conflict_columns: Array, update_columns: Array) -> ScriptResult {
        let conflict_columns = column_names(conflict_columns)?;
        let update_columns = column_names(update_columns)?;
        self.deadline.remaining()?;
        Self::rows(self.handler.upsert(
            &self.table_name,
            to_value(&rows)?,
            &conflict_columns,
            &update_columns,
        ))
    }

    fn delete(&mut self, filter: Dynamic) -> ScriptResult {
        self.deadline.remaining()?;
        Self::rows(self.handler.delete(&self.table_name, to_value(&filter)?))
    }
}

fn column_names(values: Array) -> Result<Vec<String>, Box<EvalAltResult>> {
    values
        .into_iter()
        .map(|value| {
            value
                .into_immutable_string()
                .map(|name| name.to_string())
                .map_err(|type_name| script_error(format!("column names must be strings, got {}", type_name)))
        })
        .collect()
}

struct ContextInner {
    role: String,
    metadata: Arc<dyn MetadataClient>,
    http: reqwest::Client,
    social_api_url: String,
    handle: Handle,
    deadline: Deadline,
    logs: LogBuffer,
    db: Map,
}

/// The value bound to `context` for one execution.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub fn logs(&self) -> &LogBuffer {
        &self.inner.logs
    }

    /// Host calls started after `at` fail, and calls in flight at `at` are
    /// abandoned.
    pub fn set_deadline(&self, at: Instant) {
        self.inner.deadline.set(at);
    }

    /// Accessor names available under `context.db`.
    pub fn table_accessors(&self) -> Vec<String> {
        self.inner.db.keys().map(|key| key.to_string()).collect()
    }

    pub fn log_values(&self, values: &[Dynamic]) {
        let message = values.iter().map(format_log_value).collect::<Vec<_>>().join(" ");
        self.inner.logs.user(LogLevel::Info, message);
    }

    /// Runs `future` on the runtime, dropping it when the deadline passes.
    fn block_on<F, T, E>(&self, future: F) -> Result<T, Box<EvalAltResult>>
    where
        F: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let result = match self.inner.deadline.remaining()? {
            None => self.inner.handle.block_on(future),
            Some(remaining) => self
                .inner
                .handle
                .block_on(async move { tokio::time::timeout(remaining, future).await })
                .map_err(|_| terminated())?,
        };
        result.map_err(script_error)
    }

    fn graphql(&self, query: &str, variables: Option<Value>) -> ScriptResult {
        let inner = &self.inner;
        let data = self.block_on(
            inner
                .metadata
                .execute_graphql(query, variables, Some(&inner.role)),
        )?;
        to_dynamic(data)
    }

    fn social_api_url(&self, path: &str) -> String {
        let base = self.inner.social_api_url.trim_end_matches('/');
        if path.starts_with('/') {
            format!("{}{}", base, path)
        } else {
            format!("{}/{}", base, path)
        }
    }

    /// Resolves to `#{status, ok, body}`; the body is parsed as JSON when it
    /// is JSON and returned as a string otherwise.
    fn fetch_from_social_api(&self, path: &str, options: Map) -> ScriptResult {
        let url = self.social_api_url(path);
        let method = match options.get("method") {
            Some(method) => method.to_string().to_uppercase(),
            None => "GET".to_string(),
        };
        let method = reqwest::Method::from_bytes(method.as_bytes()).map_err(script_error)?;
        let mut request = self.inner.http.request(method, &url);
        if let Some(headers) = options.get("headers") {
            let headers = headers
                .clone()
                .try_cast::<Map>()
                .ok_or_else(|| script_error("headers must be an object map"))?;
            for (name, value) in headers {
                request = request.header(name.as_str(), value.to_string());
            }
        }
        if let Some(body) = options.get("body") {
            request = if body.is::<ImmutableString>() {
                request.body(body.to_string())
            } else {
                request.json(&to_value(body)?)
            };
        }

        if let Some(remaining) = self.inner.deadline.remaining()? {
            request = request.timeout(remaining);
        }

        let (status, text) = self.block_on(async {
            let response = request
                .send()
                .await
                .map_err(|err| format!("Failed to fetch {}: {}", url, err))?;
            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|err| format!("Failed to fetch {}: {}", url, err))?;
            Ok::<_, String>((status, text))
        })?;

        let body = match serde_json::from_str::<Value>(&text) {
            Ok(json) => to_dynamic(json)?,
            Err(_) => Dynamic::from(text),
        };
        let mut response = Map::new();
        response.insert("status".into(), Dynamic::from(status.as_u16() as i64));
        response.insert("ok".into(), Dynamic::from(status.is_success()));
        response.insert("body".into(), body);
        Ok(Dynamic::from_map(response))
    }
}

/// `console.log` writes to the same buffer as `context.log`.
#[derive(Clone)]
pub struct Console(Context);

impl Console {
    pub fn new(context: Context) -> Self {
        Console(context)
    }
}

/// Registers `Context`, `DbTable` and `Console` with their methods.
pub fn register_context_api(engine: &mut Engine) {
    engine
        .register_type_with_name::<Context>("Context")
        .register_get("db", |ctx: &mut Context| ctx.inner.db.clone())
        .register_fn("graphql", |ctx: &mut Context, query: ImmutableString| {
            ctx.graphql(query.as_str(), None)
        })
        .register_fn(
            "graphql",
            |ctx: &mut Context, query: ImmutableString, variables: Dynamic| {
                let variables = if variables.is::<()>() {
                    None
                } else {
                    Some(to_value(&variables)?)
                };
                ctx.graphql(query.as_str(), variables)
            },
        )
        .register_fn(
            "fetchFromSocialApi",
            |ctx: &mut Context, path: ImmutableString| ctx.fetch_from_social_api(path.as_str(), Map::new()),
        )
        .register_fn(
            "fetchFromSocialApi",
            |ctx: &mut Context, path: ImmutableString, options: Map| {
                ctx.fetch_from_social_api(path.as_str(), options)
            },
        )
        .register_fn("log", |ctx: &mut Context| ctx.log_values(&[]))
        .register_fn("log", |ctx: &mut Context, a: Dynamic| ctx.log_values(&[a]))
        .register_fn("log", |ctx: &mut Context, a: Dynamic, b: Dynamic| {
            ctx.log_values(&[a, b])
        })
        .register_fn("log", |ctx: &mut Context, a: Dynamic, b: Dynamic, c: Dynamic| {
            ctx.log_values(&[a, b, c])
        })
        .register_fn(
            "log",
            |ctx: &mut Context, a: Dynamic, b: Dynamic, c: Dynamic, d: Dynamic| ctx.log_values(&[a, b, c, d]),
        );

    engine
        .register_type_with_name::<Console>("Console")
        .register_fn("log", |console: &mut Console| console.0.log_values(&[]))
        .register_fn("log", |console: &mut Console, a: Dynamic| console.0.log_values(&[a]))
        .register_fn("log", |console: &mut Console, a: Dynamic, b: Dynamic| {
            console.0.log_values(&[a, b])
        })
        .register_fn(
            "log",
            |console: &mut Console, a: Dynamic, b: Dynamic, c: Dynamic| console.0.log_values(&[a, b, c]),
        )
        .register_fn(
            "log",
            |console: &mut Console, a: Dynamic, b: Dynamic, c: Dynamic, d: Dynamic| {
                console.0.log_values(&[a, b, c, d])
            },
        );

    engine
        .register_type_with_name::<DbTable>("DbTable")
        .register_fn("insert", DbTable::insert)
        .register_fn("select", |table: &mut DbTable, filter: Dynamic| table.select(filter, None))
        .register_fn("select", |table: &mut DbTable, filter: Dynamic, limit: i64| {
            table.select(filter, Some(limit))
        })
        .register_fn("update", DbTable::update)
        .register_fn("upsert", DbTable::upsert)
        .register_fn("delete", DbTable::delete);
}

/// Assembles a `Context` per execution.
#[derive(Clone)]
pub struct ContextBuilder {
    metadata: Arc<dyn MetadataClient>,
    connector: Arc<dyn TenantConnector>,
    http: reqwest::Client,
    social_api_url: String,
}

impl ContextBuilder {
    pub fn new(metadata: Arc<dyn MetadataClient>, connector: Arc<dyn TenantConnector>) -> Self {
        ContextBuilder {
            metadata,
            connector,
            http: reqwest::Client::builder()
                .timeout(*SOCIAL_API_TIMEOUT)
                .build()
                .unwrap_or_default(),
            social_api_url: SOCIAL_API_URL.clone(),
        }
    }

    pub fn with_social_api_url(mut self, social_api_url: impl Into<String>) -> Self {
        self.social_api_url = social_api_url.into();
        self
    }

    /// Must be called from within the tokio runtime; the returned context
    /// blocks on it from the sandbox thread.
    pub async fn build(&self, config: &IndexerConfig, logs: LogBuffer) -> anyhow::Result<Context> {
        let deadline = Deadline::default();
        let db = self.build_db(config, &deadline).await?;
        Ok(Context {
            inner: Arc::new(ContextInner {
                role: config.hasura_role_name(),
                metadata: self.metadata.clone(),
                http: self.http.clone(),
                social_api_url: self.social_api_url.clone(),
                handle: Handle::current(),
                deadline,
                logs,
                db,
            }),
        })
    }

    /// An unusable schema leaves `db` empty instead of failing the run.
    async fn build_db(&self, config: &IndexerConfig, deadline: &Deadline) -> anyhow::Result<Map> {
        let definition = match SchemaDefinition::parse(&config.schema)
            .and_then(|definition| definition.check_accessor_names().map(|_| definition))
        {
            Ok(definition) => Arc::new(definition),
            Err(err) => {
                log::warn!(
                    "{} Leaving context.db of {} empty: {}",
                    *COMPONENT_NAME,
                    config,
                    err
                );
                return Ok(Map::new());
            }
        };

        let executor = self
            .connector
            .connect(config)
            .await
            .context("Failed to connect to the indexer database")?;
        let handler = DmlHandler::new(config.schema_name(), definition.clone(), executor);

        let mut db = Map::new();
        for table in definition.tables() {
            db.insert(
                table.accessor_name.as_str().into(),
                Dynamic::from(DbTable::new(table.name.clone(), handler.clone(), deadline.clone())),
            );
        }
        Ok(db)
    }
}
