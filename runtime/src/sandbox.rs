//! Runs indexer code in an embedded `rhai` engine.
//!
//! A fresh engine and scope are built for every execution, so nothing a
//! script defines survives into the next block. The engine has no file,
//! network or module access of its own; the only way out is through the
//! bindings registered here and in [`crate::context`].
use crate::block::{parse_event_log, Block};
use crate::context::{register_context_api, Console, Context, ScriptResult};
use crate::error::SandboxError;
use crate::transform::prepare_source;
use indexer_common::consts::COMPONENT_NAME;
use indexer_common::LogLevel;
use lazy_static::lazy_static;
use rhai::module_resolvers::DummyModuleResolver;
use rhai::serde::to_dynamic;
use rhai::{Dynamic, Engine, EvalAltResult, ImmutableString, Scope};
use std::str::FromStr;
use std::time::{Duration, Instant};

lazy_static! {
    pub static ref EXECUTION_TIMEOUT: Duration = std::env::var("EXECUTION_TIMEOUT_MS")
        .ok()
        .and_then(|s| u64::from_str(&s).ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_secs(30));
    static ref MAX_OPERATIONS: u64 = std::env::var("SANDBOX_MAX_OPERATIONS")
        .ok()
        .and_then(|s| u64::from_str(&s).ok())
        .unwrap_or(100_000_000);
}

/// Engine limits besides the wall-clock budget. Zero means unlimited.
#[derive(Clone, Debug, PartialEq)]
pub struct SandboxLimits {
    pub max_operations: u64,
    pub max_call_levels: usize,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
    pub max_expr_depth: usize,
    pub max_function_expr_depth: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        SandboxLimits {
            max_operations: *MAX_OPERATIONS,
            max_call_levels: 64,
            max_string_size: 10 * 1024 * 1024,
            max_array_size: 100_000,
            max_map_size: 100_000,
            max_expr_depth: 128,
            max_function_expr_depth: 64,
        }
    }
}

/// Helpers exposed as `primitives`.
#[derive(Clone, Debug, Default)]
pub struct Primitives;

fn decode_base64(value: &str) -> Result<String, Box<EvalAltResult>> {
    let bytes = base64::decode(value).map_err(|err| format!("Invalid base64: {}", err))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn register_block_api(engine: &mut Engine) {
    engine
        .register_type_with_name::<Block>("Block")
        .register_get("blockHeight", |block: &mut Block| block.block_height() as i64)
        .register_get("blockHash", |block: &mut Block| match block.block_hash() {
            Some(hash) => Dynamic::from(hash),
            None => Dynamic::UNIT,
        })
        .register_get("streamerMessage", |block: &mut Block| -> ScriptResult {
            to_dynamic(block.streamer_message())
        })
        .register_fn("header", |block: &mut Block| -> ScriptResult { to_dynamic(block.header()) })
        .register_fn("actions", |block: &mut Block| -> ScriptResult { to_dynamic(block.actions()) })
        .register_fn("receipts", |block: &mut Block| -> ScriptResult { to_dynamic(block.receipts()) })
        .register_fn("events", |block: &mut Block| -> ScriptResult { to_dynamic(block.events()) })
        .register_fn("transactions", |block: &mut Block| -> ScriptResult {
            to_dynamic(block.transactions())
        });

    engine
        .register_type_with_name::<Primitives>("Primitives")
        .register_fn("decodeBase64", |_: &mut Primitives, value: ImmutableString| {
            decode_base64(value.as_str())
        })
        .register_fn("parseEventLog", |_: &mut Primitives, log: ImmutableString| -> ScriptResult {
            match parse_event_log(log.as_str()) {
                Some(event) => to_dynamic(event),
                None => Ok(Dynamic::UNIT),
            }
        });
}

/// A thrown value reports as itself, so `throw "boom"` reads `boom`.
/// Anything failing once the deadline has passed counts as a timeout.
fn execution_error(err: EvalAltResult, timeout: Duration, deadline: Instant) -> SandboxError {
    match err {
        EvalAltResult::ErrorTerminated(..) => SandboxError::Timeout(timeout),
        _ if Instant::now() >= deadline => SandboxError::Timeout(timeout),
        EvalAltResult::ErrorRuntime(value, _) => SandboxError::Execution(value.to_string()),
        other => SandboxError::Execution(other.to_string()),
    }
}

#[derive(Clone, Debug)]
pub struct Sandbox {
    timeout: Duration,
    limits: SandboxLimits,
}

impl Default for Sandbox {
    fn default() -> Self {
        Sandbox::new(*EXECUTION_TIMEOUT, SandboxLimits::default())
    }
}

impl Sandbox {
    pub fn new(timeout: Duration, limits: SandboxLimits) -> Self {
        Sandbox { timeout, limits }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn engine(&self, context: &Context, deadline: Instant) -> Engine {
        let mut engine = Engine::new();
        let limits = &self.limits;
        engine.set_max_operations(limits.max_operations);
        engine.set_max_call_levels(limits.max_call_levels);
        engine.set_max_string_size(limits.max_string_size);
        engine.set_max_array_size(limits.max_array_size);
        engine.set_max_map_size(limits.max_map_size);
        engine.set_max_expr_depths(limits.max_expr_depth, limits.max_function_expr_depth);
        engine.set_module_resolver(DummyModuleResolver::new());
        engine.disable_symbol("eval");

        engine.on_progress(move |_| {
            if Instant::now() >= deadline {
                Some(Dynamic::UNIT)
            } else {
                None
            }
        });
        let logs = context.logs().clone();
        engine.on_print(move |message| logs.user(LogLevel::Info, message));
        let logs = context.logs().clone();
        engine.on_debug(move |message, _, _| logs.user(LogLevel::Debug, message));

        register_block_api(&mut engine);
        register_context_api(&mut engine);
        engine
    }

    /// Compiles without running, for validating code up front.
    pub fn check(&self, code: &str) -> Result<(), SandboxError> {
        let mut engine = Engine::new();
        engine.disable_symbol("eval");
        engine
            .compile(&prepare_source(code))
            .map(|_| ())
            .map_err(|err| SandboxError::Compile(err.to_string()))
    }

    pub async fn run(&self, code: &str, block: Block, context: Context) -> Result<(), SandboxError> {
        let code = prepare_source(code);
        let timeout = self.timeout;
        let deadline = Instant::now() + timeout;
        let engine = self.engine(&context, deadline);
        context.set_deadline(deadline);

        let mut task = tokio::task::spawn_blocking(move || {
            let ast = engine
                .compile(&code)
                .map_err(|err| SandboxError::Compile(err.to_string()))?;
            let mut scope = Scope::new();
            scope.push_constant("block", block);
            scope.push_constant("primitives", Primitives);
            scope.push_constant("console", Console::new(context.clone()));
            scope.push_constant("context", context);
            engine
                .run_ast_with_scope(&mut scope, &ast)
                .map_err(|err| execution_error(*err, timeout, deadline))
        });

        let waited = tokio::time::timeout(timeout, &mut task).await;
        let joined = match waited {
            Ok(joined) => joined,
            Err(_) => {
                // The script stops at its next operation and host calls give
                // up at the deadline; wait for that so no write lands after
                // the timeout is reported.
                log::debug!("{} Waiting for timed out indexer code to stop", *COMPONENT_NAME);
                return match task.await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) => Err(SandboxError::Timeout(timeout)),
                    Err(join_error) => Err(SandboxError::Task(join_error.to_string())),
                };
            }
        };
        match joined {
            Ok(result) => result,
            Err(join_error) => Err(SandboxError::Task(join_error.to_string())),
        }
    }
}
