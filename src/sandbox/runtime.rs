//! Sandboxed snippet execution on a V8 isolate.
//!
//! Each execution gets a fresh `deno_core` runtime on its own OS thread
//! with no filesystem, network, or environment access. The only bridge to
//! the host is a pair of ops: one hands the marshaled globals payload to
//! the bootstrap script, the other dispatches host calls through the
//! per-invocation [`FunctionRegistry`]. A watchdog thread enforces the
//! wall-clock budget with `terminate_execution`, and a near-heap-limit
//! callback turns V8 OOM into a terminated execution instead of an
//! aborted process.

use std::cell::RefCell;
use std::ffi::c_void;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use deno_core::error::AnyError;
use deno_core::{JsRuntime, OpState, PollEventLoopOptions, RuntimeOptions, extension, op2, v8};
use serde_json::Value;

use crate::error::SandboxError;
use crate::sandbox::globals::{FunctionRegistry, Globals, marshal};

/// Default wall clock for one snippet.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default maximum snippet length in characters.
const DEFAULT_MAX_CODE_LENGTH: usize = 32 * 1024;

/// Default V8 heap ceiling.
const DEFAULT_MAX_HEAP_BYTES: usize = 64 * 1024 * 1024;

/// Grace period between the nominal deadline and forcible termination.
const TIMEOUT_SLACK: Duration = Duration::from_millis(50);

/// Extra margin for the parent-side backstop, beyond the in-thread
/// watchdog. Only reached if V8 fails to honor termination.
const BACKSTOP_MARGIN: Duration = Duration::from_secs(5);

/// Stack size for sandbox threads; V8 wants room to spare.
const SANDBOX_THREAD_STACK: usize = 8 * 1024 * 1024;

/// Resource budget for a single execution.
#[derive(Debug, Clone)]
pub struct SandboxLimits {
    /// Maximum wall-clock execution time.
    pub timeout: Duration,
    /// Maximum snippet length in characters.
    pub max_code_length: usize,
    /// Maximum V8 heap in bytes.
    pub max_heap_bytes: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_code_length: DEFAULT_MAX_CODE_LENGTH,
            max_heap_bytes: DEFAULT_MAX_HEAP_BYTES,
        }
    }
}

impl SandboxLimits {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_code_length(mut self, chars: usize) -> Self {
        self.max_code_length = chars;
        self
    }

    pub fn with_max_heap_bytes(mut self, bytes: usize) -> Self {
        self.max_heap_bytes = bytes;
        self
    }
}

/// Marshaled globals payload, stashed in the op state for the bootstrap.
struct GlobalsPayload(String);

#[op2]
#[string]
fn op_sandbox_globals(state: &mut OpState) -> String {
    state.borrow::<GlobalsPayload>().0.clone()
}

#[op2(async)]
#[serde]
async fn op_host_call(
    state: Rc<RefCell<OpState>>,
    #[string] fn_id: String,
    #[serde] args: Vec<serde_json::Value>,
) -> Result<serde_json::Value, AnyError> {
    let function = {
        let state = state.borrow();
        let registry = state.borrow::<Arc<FunctionRegistry>>();
        registry.get(&fn_id)
    };
    let Some(function) = function else {
        return Err(anyhow::anyhow!("unknown host function: {fn_id}"));
    };
    function
        .call(args)
        .await
        .map_err(|e| anyhow::anyhow!("{fn_id}: {e}"))
}

extension!(
    toolgate_sandbox,
    ops = [op_sandbox_globals, op_host_call],
    options = {
        registry: Arc<FunctionRegistry>,
        payload: String,
    },
    state = |state, options| {
        state.put(options.registry);
        state.put(GlobalsPayload(options.payload));
    },
);

/// Bootstrap script: hydrates the globals payload (turning `__fnToken`
/// sentinels into proxy functions over the op bridge), installs the
/// depth-bounded safe clone, and masks host escape hatches.
const BOOTSTRAP_JS: &str = r#"
(() => {
  const core = Deno.core;
  const MAX_DEPTH = 8;

  const clone = (value, depth) => {
    if (value === undefined || value === null) return null;
    const t = typeof value;
    if (t === "string" || t === "number" || t === "boolean") return value;
    if (t === "bigint") return value.toString();
    if (t === "function") return "[function]";
    if (depth >= MAX_DEPTH) return String(value);
    if (Array.isArray(value)) {
      return Object.freeze(value.map((item) => clone(item, depth + 1)));
    }
    if (t === "object") {
      const out = {};
      for (const key of Object.keys(value)) {
        out[key] = clone(value[key], depth + 1);
      }
      return Object.freeze(out);
    }
    return String(value);
  };

  const hydrate = (value) => {
    if (value === null || typeof value !== "object") return value;
    if (Array.isArray(value)) return value.map(hydrate);
    if (typeof value.__fnToken === "string") {
      const fnId = value.__fnToken;
      return (...args) => core.ops.op_host_call(fnId, args.map((a) => clone(a, 0)));
    }
    const out = {};
    for (const [key, child] of Object.entries(value)) {
      out[key] = hydrate(child);
    }
    return out;
  };

  const payload = JSON.parse(core.ops.op_sandbox_globals());
  for (const [name, value] of Object.entries(payload)) {
    globalThis[name] = hydrate(value);
  }
  globalThis.__sandboxClone = clone;

  for (const name of ["Deno", "console", "process", "require", "module", "exports", "global", "window", "self"]) {
    try { globalThis[name] = undefined; } catch (_) { /* non-writable */ }
  }
})();
"#;

/// Wrap the user snippet as an expression that must evaluate to a
/// callable. Lexical consts mask escape hatches even if a global slipped
/// through, and the settled result goes through the safe clone.
fn wrap_snippet(code: &str) -> String {
    format!(
        r#"(async () => {{
  "use strict";
  const __clone = globalThis.__sandboxClone;
  delete globalThis.__sandboxClone;
  const Deno = undefined, console = undefined, process = undefined,
        require = undefined, module = undefined, exports = undefined,
        global = undefined, window = undefined, self = undefined;
  const __snippet = (
{code}
  );
  if (typeof __snippet !== "function") {{
    throw new Error("Code must evaluate to a callable, e.g. async () => {{ ... }}");
  }}
  const __result = await __snippet();
  return __clone(__result, 0);
}})()"#
    )
}

/// Runs user snippets under the configured limits.
pub struct SandboxRuntime {
    limits: SandboxLimits,
}

impl SandboxRuntime {
    pub fn new(limits: SandboxLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Execute `code` with the given globals injected. The snippet must
    /// evaluate to a callable whose (awaited) return value becomes the
    /// result, bounded to depth 8 with non-JSON values stringified.
    pub async fn execute(&self, code: &str, globals: Globals) -> Result<Value, SandboxError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(SandboxError::EmptyCode);
        }
        let len = code.chars().count();
        if len > self.limits.max_code_length {
            return Err(SandboxError::CodeTooLong {
                len,
                max: self.limits.max_code_length,
            });
        }

        let (payload, registry) = marshal(&globals);
        let payload = serde_json::to_string(&payload)
            .map_err(|e| SandboxError::Worker(format!("globals payload: {e}")))?;
        let registry = Arc::new(registry);
        let limits = self.limits.clone();
        let code = code.to_string();

        let (tx, rx) = tokio::sync::oneshot::channel();
        std::thread::Builder::new()
            .name("toolgate-sandbox".to_string())
            .stack_size(SANDBOX_THREAD_STACK)
            .spawn(move || {
                let _ = tx.send(run_snippet(&code, payload, registry, &limits));
            })
            .map_err(|e| SandboxError::Worker(format!("failed to spawn sandbox thread: {e}")))?;

        // Backstop for the pathological case where termination is not
        // honored; the oneshot guards against any later resolution.
        let backstop = self.limits.timeout + TIMEOUT_SLACK + BACKSTOP_MARGIN;
        match tokio::time::timeout(backstop, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SandboxError::Worker(
                "sandbox thread exited without a result".to_string(),
            )),
            Err(_) => Err(SandboxError::Timeout {
                ms: self.limits.timeout.as_millis() as u64,
            }),
        }
    }
}

/// State shared with the near-heap-limit callback.
struct OomGuard {
    handle: v8::IsolateHandle,
    flagged: Arc<AtomicBool>,
}

extern "C" fn on_near_heap_limit(
    data: *mut c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    let guard = unsafe { &*(data as *const OomGuard) };
    guard.flagged.store(true, Ordering::SeqCst);
    guard.handle.terminate_execution();
    // Raise the limit so V8 unwinds through termination instead of
    // aborting the process.
    current_heap_limit * 2
}

fn run_snippet(
    code: &str,
    payload: String,
    registry: Arc<FunctionRegistry>,
    limits: &SandboxLimits,
) -> Result<Value, SandboxError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| SandboxError::Worker(format!("sandbox runtime: {e}")))?;

    runtime.block_on(async move {
        let mut js = JsRuntime::new(RuntimeOptions {
            extensions: vec![toolgate_sandbox::init_ops(registry, payload)],
            create_params: Some(v8::CreateParams::default().heap_limits(0, limits.max_heap_bytes)),
            ..Default::default()
        });

        let handle = js.v8_isolate().thread_safe_handle();

        let oom_flagged = Arc::new(AtomicBool::new(false));
        let oom_guard = Box::into_raw(Box::new(OomGuard {
            handle: handle.clone(),
            flagged: Arc::clone(&oom_flagged),
        }));
        js.v8_isolate()
            .add_near_heap_limit_callback(on_near_heap_limit, oom_guard as *mut c_void);

        let timed_out = Arc::new(AtomicBool::new(false));
        let done = Arc::new(AtomicBool::new(false));
        let deadline = Instant::now() + limits.timeout + TIMEOUT_SLACK;
        spawn_watchdog(
            handle,
            deadline,
            Arc::clone(&done),
            Arc::clone(&timed_out),
        );

        let result = drive(&mut js, code, limits.timeout).await;
        done.store(true, Ordering::SeqCst);

        js.v8_isolate()
            .remove_near_heap_limit_callback(on_near_heap_limit, 0);
        drop(js);
        // The callback is unregistered and the isolate gone; reclaim the
        // guard allocation.
        drop(unsafe { Box::from_raw(oom_guard) });

        match result {
            Err(_) if timed_out.load(Ordering::SeqCst) => Err(SandboxError::Timeout {
                ms: limits.timeout.as_millis() as u64,
            }),
            Err(_) if oom_flagged.load(Ordering::SeqCst) => Err(SandboxError::HeapLimit),
            other => other,
        }
    })
}

fn spawn_watchdog(
    handle: v8::IsolateHandle,
    deadline: Instant,
    done: Arc<AtomicBool>,
    timed_out: Arc<AtomicBool>,
) {
    std::thread::spawn(move || {
        while !done.load(Ordering::SeqCst) {
            if Instant::now() >= deadline {
                timed_out.store(true, Ordering::SeqCst);
                handle.terminate_execution();
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    });
}

async fn drive(
    js: &mut JsRuntime,
    code: &str,
    timeout: Duration,
) -> Result<Value, SandboxError> {
    js.execute_script("toolgate:bootstrap", BOOTSTRAP_JS)
        .map_err(exec_error)?;

    let promise = js
        .execute_script("toolgate:snippet", wrap_snippet(code))
        .map_err(exec_error)?;

    let total = timeout + TIMEOUT_SLACK;
    let settled = tokio::time::timeout(total, async {
        let resolve = js.resolve(promise);
        match js
            .with_event_loop_promise(resolve, PollEventLoopOptions::default())
            .await
        {
            Ok(value) => Ok(value),
            Err(e) => {
                let message = e.to_string();
                if message.contains("pending") && message.contains("event loop") {
                    // The snippet parked on a promise nothing will settle.
                    // Hold here so the deadline converts it to a timeout.
                    let () = std::future::pending().await;
                    unreachable!()
                }
                Err(exec_error(e))
            }
        }
    })
    .await;

    match settled {
        Err(_) => Err(SandboxError::Timeout {
            ms: timeout.as_millis() as u64,
        }),
        Ok(Err(e)) => Err(e),
        Ok(Ok(global)) => {
            let scope = &mut js.handle_scope();
            let local = v8::Local::new(scope, global);
            deno_core::serde_v8::from_v8(scope, local)
                .map_err(|e| SandboxError::Execution(format!("unserializable result: {e}")))
        }
    }
}

/// Reduce a V8 error to its first line; the stack of the wrapper IIFE is
/// noise to the model.
fn exec_error(e: AnyError) -> SandboxError {
    let message = e.to_string();
    let first_line = message.lines().next().unwrap_or("execution failed");
    SandboxError::Execution(first_line.to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::sandbox::globals::GlobalValue;

    fn runtime_for_tests() -> SandboxRuntime {
        SandboxRuntime::new(SandboxLimits::default().with_timeout(Duration::from_secs(5)))
    }

    #[tokio::test]
    async fn test_empty_code_rejected() {
        let runtime = runtime_for_tests();
        let result = runtime.execute("   ", Globals::new()).await;
        assert!(matches!(result, Err(SandboxError::EmptyCode)));
    }

    #[tokio::test]
    async fn test_oversized_code_rejected() {
        let runtime = SandboxRuntime::new(SandboxLimits::default().with_max_code_length(10));
        let result = runtime
            .execute("async () => { return 1 + 1; }", Globals::new())
            .await;
        assert!(matches!(result, Err(SandboxError::CodeTooLong { .. })));
    }

    #[tokio::test]
    async fn test_plain_expression_result() {
        let runtime = runtime_for_tests();
        let value = runtime
            .execute("async () => ({ sum: 1 + 2 })", Globals::new())
            .await
            .unwrap();
        assert_eq!(value, json!({"sum": 3}));
    }

    #[tokio::test]
    async fn test_non_callable_snippet_rejected() {
        let runtime = runtime_for_tests();
        let result = runtime.execute("1 + 1", Globals::new()).await;
        match result {
            Err(SandboxError::Execution(message)) => {
                assert!(message.contains("callable"), "got: {message}");
            }
            other => panic!("expected execution error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bridge_calls_host_function() {
        let mut globals = Globals::new();
        globals.insert(
            "catalog",
            GlobalValue::object([(
                "listServers",
                GlobalValue::function(|_args| {
                    Box::pin(async { Ok(json!([{"id": "a"}, {"id": "b"}])) })
                }),
            )]),
        );

        let runtime = runtime_for_tests();
        let value = runtime
            .execute(
                "async () => { const s = await catalog.listServers(); return { count: s.length }; }",
                globals,
            )
            .await
            .unwrap();
        assert_eq!(value, json!({"count": 2}));
    }

    #[tokio::test]
    async fn test_bridge_forwards_arguments() {
        let mut globals = Globals::new();
        globals.insert(
            "tool",
            GlobalValue::object([(
                "call",
                GlobalValue::function(|args| {
                    Box::pin(async move { Ok(json!({ "echo": args })) })
                }),
            )]),
        );

        let runtime = runtime_for_tests();
        let value = runtime
            .execute(
                r#"async () => tool.call({ serverId: "fs", name: "read" }, 7)"#,
                globals,
            )
            .await
            .unwrap();
        assert_eq!(
            value,
            json!({"echo": [{"serverId": "fs", "name": "read"}, 7]})
        );
    }

    #[tokio::test]
    async fn test_host_error_surfaces_as_rejection() {
        let mut globals = Globals::new();
        globals.insert(
            "tool",
            GlobalValue::object([(
                "call",
                GlobalValue::function(|_args| {
                    Box::pin(async { Err(anyhow::anyhow!("upstream exploded")) })
                }),
            )]),
        );

        let runtime = runtime_for_tests();
        let result = runtime
            .execute("async () => tool.call()", globals)
            .await;
        match result {
            Err(SandboxError::Execution(message)) => {
                assert!(message.contains("upstream exploded"), "got: {message}");
            }
            other => panic!("expected execution error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_on_parked_promise() {
        let runtime =
            SandboxRuntime::new(SandboxLimits::default().with_timeout(Duration::from_millis(100)));
        let result = runtime
            .execute("async () => { await new Promise(() => {}); }", Globals::new())
            .await;
        match result {
            Err(SandboxError::Timeout { ms }) => assert_eq!(ms, 100),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_on_busy_loop() {
        let runtime =
            SandboxRuntime::new(SandboxLimits::default().with_timeout(Duration::from_millis(200)));
        let result = runtime
            .execute("async () => { while (true) {} }", Globals::new())
            .await;
        assert!(
            matches!(result, Err(SandboxError::Timeout { .. })),
            "got {result:?}"
        );
    }

    #[tokio::test]
    async fn test_result_depth_is_bounded() {
        let runtime = runtime_for_tests();
        let value = runtime
            .execute(
                r#"async () => {
                    let deep = { leaf: true };
                    for (let i = 0; i < 20; i++) deep = { child: deep };
                    return deep;
                }"#,
                Globals::new(),
            )
            .await
            .unwrap();

        // Depth capped at 8: walking down must hit a stringified node.
        let mut cursor = &value;
        let mut depth = 0;
        while let Some(child) = cursor.get("child") {
            cursor = child;
            depth += 1;
        }
        assert!(depth < 20, "expected a depth cap, walked {depth} levels");
        assert!(cursor.is_string());
    }

    #[tokio::test]
    async fn test_host_escape_hatches_masked() {
        let runtime = runtime_for_tests();
        let value = runtime
            .execute(
                r#"async () => ({
                    deno: typeof Deno,
                    console: typeof console,
                    process: typeof process,
                    require: typeof require,
                })"#,
                Globals::new(),
            )
            .await
            .unwrap();
        assert_eq!(
            value,
            json!({
                "deno": "undefined",
                "console": "undefined",
                "process": "undefined",
                "require": "undefined",
            })
        );
    }

    #[tokio::test]
    async fn test_syntax_error_is_reported() {
        let runtime = runtime_for_tests();
        let result = runtime
            .execute("async () => { this is not javascript }", Globals::new())
            .await;
        assert!(matches!(result, Err(SandboxError::Execution(_))));
    }
}
