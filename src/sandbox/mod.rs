// Sandbox executor - QuickJS execution of provider modules
//
// Provides an isolated scope per execution with:
// - Fresh runtime and context every time (no state survives between calls)
// - Memory and stack ceilings, and an interrupt handler tied to cancellation
// - Only providerContext, console, Promise, exports/module in reach
// - Legacy export names normalized once, right after evaluation
//
// QuickJS values are not Send, so each execution runs start to finish on a
// blocking thread. Capability calls made by the script are driven on that
// thread through the tokio runtime handle.

mod bridge;

pub use bridge::ModuleLabel;

use anyhow::anyhow;
use rquickjs::{Context, Ctx, Runtime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::SandboxConfig;
use crate::context::ProviderContext;
use crate::error::{RelayError, RelayResult};
use bridge::Bridge;

const PRELUDE: &str = include_str!("prelude.js");

/// Canonical functions a provider module may export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Export {
    GetStream,
    GetPosts,
    GetSearchPosts,
    GetMeta,
    GetEpisodeLinks,
}

impl Export {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GetStream => "getStream",
            Self::GetPosts => "getPosts",
            Self::GetSearchPosts => "getSearchPosts",
            Self::GetMeta => "getMeta",
            Self::GetEpisodeLinks => "getEpisodeLinks",
        }
    }
}

/// What a module exposes after alias normalization
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportSet {
    /// Canonical function names present
    pub functions: Vec<String>,
    /// Non-function exports (`catalog`, `genres`)
    pub values: BTreeMap<String, Value>,
    /// Raw export keys, before normalization
    pub keys: Vec<String>,
}

#[derive(Deserialize)]
struct Outcome {
    done: bool,
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    message: String,
    #[serde(default)]
    name: String,
    stack: Option<String>,
}

#[derive(Clone)]
pub struct SandboxExecutor {
    context: ProviderContext,
    limits: SandboxConfig,
}

/// A module whose exports have been discovered. Calls re-run the source in a
/// fresh scope.
#[derive(Clone)]
pub struct ExecutedModule {
    executor: SandboxExecutor,
    source: Arc<str>,
    label: ModuleLabel,
    exports: ExportSet,
}

impl ExecutedModule {
    pub fn exports(&self) -> &ExportSet {
        &self.exports
    }

    pub fn label(&self) -> &ModuleLabel {
        &self.label
    }

    pub fn has(&self, export: Export) -> bool {
        self.exports.functions.iter().any(|f| f == export.as_str())
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.exports.values.get(name)
    }

    /// Call an export with a single argument object; `providerContext` and
    /// `signal` are added to it inside the sandbox.
    pub async fn call(&self, export: Export, argument: Value, cancel: &CancellationToken) -> RelayResult<Value> {
        if !self.has(export) {
            return Err(RelayError::ModuleUnavailable {
                provider: self.label.provider.clone(),
                role: format!("{} ({})", self.label.role, export.as_str()),
            });
        }

        log::debug!("[{}] Calling {}", self.label, export.as_str());
        let run = self
            .executor
            .run(self.source.clone(), self.label.clone(), Some((export, argument)), cancel)
            .await?;
        Ok(run.value.unwrap_or(Value::Null))
    }
}

struct RunOutput {
    exports: ExportSet,
    value: Option<Value>,
}

struct Job {
    source: Arc<str>,
    invocation: Option<(Export, Value)>,
    limits: SandboxConfig,
    token: CancellationToken,
    bridge: Arc<Bridge>,
}

impl SandboxExecutor {
    pub fn new(context: ProviderContext, limits: SandboxConfig) -> Self {
        Self { context, limits }
    }

    pub fn context(&self) -> &ProviderContext {
        &self.context
    }

    /// Evaluate module source and discover its exports
    pub async fn execute(
        &self,
        source: Arc<str>,
        label: ModuleLabel,
        cancel: &CancellationToken,
    ) -> RelayResult<ExecutedModule> {
        let run = self.run(source.clone(), label.clone(), None, cancel).await?;
        log::debug!(
            "[{}] Module exports {:?} (raw keys {:?})",
            label,
            run.exports.functions,
            run.exports.keys
        );
        Ok(ExecutedModule {
            executor: self.clone(),
            source,
            label,
            exports: run.exports,
        })
    }

    async fn run(
        &self,
        source: Arc<str>,
        label: ModuleLabel,
        invocation: Option<(Export, Value)>,
        cancel: &CancellationToken,
    ) -> RelayResult<RunOutput> {
        let what = invocation
            .as_ref()
            .map(|(export, _)| export.as_str())
            .unwrap_or("module evaluation");
        let what = format!("[{}] {}", label, what);

        let token = cancel.child_token();
        let timeout = Duration::from_secs(self.limits.call_timeout_secs);
        let timer = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                token.cancel();
            })
        };

        let job = Job {
            source,
            invocation,
            limits: self.limits.clone(),
            token: token.clone(),
            bridge: Arc::new(Bridge {
                context: self.context.clone(),
                handle: tokio::runtime::Handle::current(),
                cancel: token.clone(),
                label,
            }),
        };

        let result = tokio::task::spawn_blocking(move || job.run()).await;
        timer.abort();

        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(_)) if cancel.is_cancelled() => Err(RelayError::Aborted),
            Ok(Err(_)) if token.is_cancelled() => Err(RelayError::Timeout(what)),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(RelayError::Internal(anyhow!("Sandbox thread failed: {}", e))),
        }
    }
}

/// Turn a pending QuickJS exception into an execution error
fn script_error(ctx: &Ctx<'_>, err: rquickjs::Error) -> RelayError {
    if !matches!(err, rquickjs::Error::Exception) {
        return RelayError::Internal(anyhow!("QuickJS error: {}", err));
    }

    let exception = ctx.catch();
    if let Some(object) = exception.as_object() {
        let message = object
            .get::<_, Option<String>>("message")
            .ok()
            .flatten()
            .unwrap_or_else(|| "Unknown error".to_string());
        let stack = object
            .get::<_, Option<String>>("stack")
            .ok()
            .flatten()
            .filter(|s| !s.trim().is_empty());
        return RelayError::Execution { message, stack };
    }

    let message = exception
        .as_string()
        .and_then(|s| s.to_string().ok())
        .unwrap_or_else(|| "Unknown error".to_string());
    RelayError::Execution { message, stack: None }
}

fn wrap_module(source: &str) -> String {
    format!(
        "__register(function (exports, module, require, console, Promise, providerContext, __awaiter) {{\n{}\n}});",
        source
    )
}

fn quickjs(err: rquickjs::Error) -> RelayError {
    RelayError::Internal(anyhow!("QuickJS setup failed: {}", err))
}

impl Job {
    fn run(self) -> RelayResult<RunOutput> {
        let runtime = Runtime::new().map_err(quickjs)?;
        runtime.set_memory_limit(self.limits.memory_limit_bytes);
        runtime.set_max_stack_size(self.limits.max_stack_bytes);
        let token = self.token.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || token.is_cancelled())));
        let context = Context::full(&runtime).map_err(quickjs)?;

        let exports_json: String = context.with(|ctx| {
            self.bridge.install(&ctx).map_err(quickjs)?;
            ctx.eval::<(), _>(PRELUDE).map_err(|e| script_error(&ctx, e))?;
            ctx.eval::<String, _>(wrap_module(&self.source))
                .map_err(|e| script_error(&ctx, e))
        })?;
        let exports: ExportSet = serde_json::from_str(&exports_json)
            .map_err(|e| RelayError::Internal(anyhow!("Malformed export listing: {}", e)))?;

        let Some((export, argument)) = self.invocation else {
            return Ok(RunOutput { exports, value: None });
        };

        let args = serde_json::to_string(&vec![argument]).map_err(anyhow::Error::from)?;
        let settle = format!(
            "__settle({}, {});",
            serde_json::to_string(export.as_str()).map_err(anyhow::Error::from)?,
            serde_json::to_string(&args).map_err(anyhow::Error::from)?
        );
        context.with(|ctx| ctx.eval::<(), _>(settle).map_err(|e| script_error(&ctx, e)))?;

        // Drain the microtask queue; host calls complete synchronously inside it
        while runtime.is_job_pending() && !self.token.is_cancelled() {
            if runtime.execute_pending_job().is_err() {
                break;
            }
        }

        let raw: String = context.with(|ctx| ctx.eval::<String, _>("__outcome()").map_err(|e| script_error(&ctx, e)))?;
        let outcome: Outcome = serde_json::from_str(&raw)
            .map_err(|e| RelayError::Internal(anyhow!("Malformed call outcome: {}", e)))?;

        if !outcome.done {
            return Err(RelayError::Execution {
                message: format!("{} never settled", export.as_str()),
                stack: None,
            });
        }
        if outcome.ok {
            return Ok(RunOutput {
                exports,
                value: Some(outcome.value),
            });
        }
        if outcome.name == "AbortError" {
            return Err(RelayError::Aborted);
        }
        Err(RelayError::Execution {
            message: outcome.message,
            stack: outcome.stack,
        })
    }
}
