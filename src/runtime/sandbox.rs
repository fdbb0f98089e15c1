//! ECMAScript sandbox for the code node.
//!
//! User scripts run inside an embedded `boa_engine` context with no host
//! capabilities: no filesystem, no network, no process access. The script is
//! wrapped in an async IIFE so `await` works, and the settled result crosses
//! the boundary as JSON only. Synchronization is direct: the promise's
//! settlement is captured by a `then` handler and read back after the job
//! queue drains, with `tokio::time::timeout` enforcing the wall-clock budget
//! around the blocking evaluation. Runtime limits bound runaway loops on the
//! blocked thread as the failsafe.

use std::time::Duration;

use boa_engine::property::Attribute;
use boa_engine::{js_string, Context, JsArgs, JsResult, JsString, JsValue, NativeFunction, Source};
use serde::Deserialize;
use serde_json::Value;

use crate::error::HandlerError;

/// Loop-iteration ceiling; ends runaway scripts that the wall-clock timeout
/// can no longer cancel once the thread is blocked.
const LOOP_ITERATION_LIMIT: u64 = 100_000_000;

/// Globals exposed to user code before their script runs.
const BOOTSTRAP: &str = r#"
var items = JSON.parse(__items_json);
var $node = JSON.parse(__node_json);
var $env = Object.freeze(JSON.parse(__env_json));
var console = {
    log: (...args) => __emit_log("log", args.map(String).join(" ")),
    warn: (...args) => __emit_log("warn", args.map(String).join(" ")),
    error: (...args) => __emit_log("error", args.map(String).join(" ")),
};
"#;

/// What the harness script records once the user promise settles.
#[derive(Debug, Deserialize)]
struct Outcome {
    ok: bool,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    error: Option<String>,
}

/// Isolated script runner, one per executor.
pub struct CodeSandbox {
    timeout: Duration,
}

impl CodeSandbox {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run a user script and return the value its async IIFE resolves to.
    ///
    /// `items` is the materialized context (`[{nodeId, json}, ...]`), `node`
    /// the current node's raw data, and `env` the whitelisted environment
    /// view.
    pub async fn run(
        &self,
        node_id: &str,
        code: &str,
        items: Value,
        node: Value,
        env: Value,
    ) -> Result<Value, HandlerError> {
        let to_runtime = |e: serde_json::Error| HandlerError::CodeRuntime(e.to_string());
        let items_json = serde_json::to_string(&items).map_err(to_runtime)?;
        let node_json = serde_json::to_string(&node).map_err(to_runtime)?;
        let env_json = serde_json::to_string(&env).map_err(to_runtime)?;

        let node_id = node_id.to_string();
        let code = code.to_string();
        let timeout_secs = self.timeout.as_secs();

        let task = tokio::task::spawn_blocking(move || {
            eval_blocking(node_id, code, items_json, node_json, env_json, timeout_secs)
        });

        match tokio::time::timeout(self.timeout, task).await {
            Err(_) => Err(HandlerError::CodeTimeout(timeout_secs)),
            Ok(Err(join_error)) => Err(HandlerError::CodeRuntime(join_error.to_string())),
            Ok(Ok(result)) => result,
        }
    }
}

fn eval_blocking(
    node_id: String,
    code: String,
    items_json: String,
    node_json: String,
    env_json: String,
    timeout_secs: u64,
) -> Result<Value, HandlerError> {
    let as_runtime = |e: boa_engine::JsError| HandlerError::CodeRuntime(e.to_string());

    let mut context = Context::default();
    context
        .runtime_limits_mut()
        .set_loop_iteration_limit(LOOP_ITERATION_LIMIT);

    context
        .register_global_property(
            js_string!("__node_id"),
            JsString::from(node_id.as_str()),
            Attribute::all(),
        )
        .map_err(as_runtime)?;
    context
        .register_global_property(
            js_string!("__items_json"),
            JsString::from(items_json.as_str()),
            Attribute::all(),
        )
        .map_err(as_runtime)?;
    context
        .register_global_property(
            js_string!("__node_json"),
            JsString::from(node_json.as_str()),
            Attribute::all(),
        )
        .map_err(as_runtime)?;
    context
        .register_global_property(
            js_string!("__env_json"),
            JsString::from(env_json.as_str()),
            Attribute::all(),
        )
        .map_err(as_runtime)?;
    context
        .register_global_callable(
            js_string!("__emit_log"),
            2,
            NativeFunction::from_fn_ptr(emit_log),
        )
        .map_err(as_runtime)?;

    context.eval(Source::from_bytes(BOOTSTRAP)).map_err(as_runtime)?;

    // Wrap the user code in an async IIFE and capture the settlement; the
    // harness never rethrows, so every path ends in a serializable outcome.
    let harness = format!(
        "var __outcome = null;\n\
         (async () => {{\n{code}\n}})().then(\n\
             (value) => {{ __outcome = {{ ok: true, value: value === undefined ? null : value }}; }},\n\
             (err) => {{ __outcome = {{ ok: false, error: String(err && err.message ? err.message : err) }}; }}\n\
         );"
    );
    context.eval(Source::from_bytes(&harness)).map_err(as_runtime)?;

    // Drain microtasks so settled awaits reach the `then` handlers.
    let _ = context.run_jobs();

    let raw = context
        .eval(Source::from_bytes("JSON.stringify(__outcome)"))
        .map_err(as_runtime)?;
    let payload = raw
        .as_string()
        .map(|s| s.to_std_string_escaped())
        .unwrap_or_else(|| "null".to_string());

    match serde_json::from_str::<Option<Outcome>>(&payload) {
        // Still pending after the job queue drained: with no external event
        // sources the promise can never settle.
        Ok(None) => Err(HandlerError::CodeTimeout(timeout_secs)),
        Ok(Some(outcome)) if outcome.ok => Ok(outcome.value),
        Ok(Some(outcome)) => Err(HandlerError::CodeRuntime(
            outcome.error.unwrap_or_else(|| "script error".to_string()),
        )),
        Err(e) => Err(HandlerError::CodeRuntime(format!(
            "result is not serializable: {e}"
        ))),
    }
}

/// Native backing for the sandbox `console`; prefixes every line with the
/// node id so interleaved executions stay readable.
fn emit_log(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let level = args
        .get_or_undefined(0)
        .to_string(context)?
        .to_std_string_escaped();
    let message = args
        .get_or_undefined(1)
        .to_string(context)?
        .to_std_string_escaped();
    let node_id = context
        .global_object()
        .get(js_string!("__node_id"), context)?
        .to_string(context)?
        .to_std_string_escaped();

    match level.as_str() {
        "error" => tracing::error!("[{node_id}] {message}"),
        "warn" => tracing::warn!("[{node_id}] {message}"),
        _ => tracing::info!("[{node_id}] {message}"),
    }
    Ok(JsValue::undefined())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sandbox() -> CodeSandbox {
        CodeSandbox::new(Duration::from_secs(5))
    }

    fn no_items() -> Value {
        json!([])
    }

    #[tokio::test]
    async fn returns_plain_objects() {
        let result = sandbox()
            .run("n1", "return {v: 6}", no_items(), json!({}), json!({}))
            .await
            .unwrap();
        assert_eq!(result, json!({"v": 6}));
    }

    #[tokio::test]
    async fn reads_items_from_the_context() {
        let items = json!([{"nodeId": "A", "json": {"n": 3}}]);
        let result = sandbox()
            .run(
                "n1",
                "return {v: items.find(i => i.nodeId === 'A').json.n * 2}",
                items,
                json!({}),
                json!({}),
            )
            .await
            .unwrap();
        assert_eq!(result, json!({"v": 6}));
    }

    #[tokio::test]
    async fn exposes_node_data_and_env() {
        let result = sandbox()
            .run(
                "n1",
                "return {label: $node.label, home: $env.HOME_DIR}",
                no_items(),
                json!({"label": "transform"}),
                json!({"HOME_DIR": "/srv/app"}),
            )
            .await
            .unwrap();
        assert_eq!(result, json!({"label": "transform", "home": "/srv/app"}));
    }

    #[tokio::test]
    async fn await_of_settled_promises_works() {
        let result = sandbox()
            .run(
                "n1",
                "const x = await Promise.resolve(5); return {x}",
                no_items(),
                json!({}),
                json!({}),
            )
            .await
            .unwrap();
        assert_eq!(result, json!({"x": 5}));
    }

    #[tokio::test]
    async fn thrown_errors_become_runtime_failures() {
        let err = sandbox()
            .run("n1", "throw new Error('boom')", no_items(), json!({}), json!({}))
            .await
            .unwrap_err();
        match err {
            HandlerError::CodeRuntime(message) => assert!(message.contains("boom")),
            other => panic!("expected CodeRuntime, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn syntax_errors_become_runtime_failures() {
        let err = sandbox()
            .run("n1", "return {", no_items(), json!({}), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::CodeRuntime(_)));
    }

    #[tokio::test]
    async fn never_settling_promise_times_out() {
        let err = sandbox()
            .run(
                "n1",
                "return await new Promise(() => {})",
                no_items(),
                json!({}),
                json!({}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::CodeTimeout(_)));
    }

    #[tokio::test]
    async fn undefined_return_becomes_null() {
        let result = sandbox()
            .run("n1", "console.log('side effect only');", no_items(), json!({}), json!({}))
            .await
            .unwrap();
        assert_eq!(result, Value::Null);
    }
}
