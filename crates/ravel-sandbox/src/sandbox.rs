//! Capability-scoped sandbox for model-generated code.
//!
//! Code runs in an embedded interpreter built from a raw engine: the only
//! callable names are the registered tools, the granted variables and a small
//! builtin set. Every other reference fails with a not-found error. There is
//! no file, process or network surface to reach.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use rhai::packages::{
    BasicArrayPackage, BasicMapPackage, BasicMathPackage, CorePackage, Package,
};
use rhai::{Array, Dynamic, Engine, EvalAltResult, ImmutableString, Position, Scope, FLOAT, INT};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::runtime::Handle;
use tracing::debug;

use ravel_domain::{FinalAnswerTool, RetrievalMatcher, Tool, Toolbox, FINAL_ANSWER_TOOL};

use crate::error::InterpreterError;
use crate::isolation::MeasuredOutput;
use crate::limiter::{Interrupt, Limiter};

/// Key marking a deferred tool call in sandbox values.
pub const FUTURE_KEY: &str = "__future__";

/// Interpreter hardening caps applied on top of the operation ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxLimits {
    pub max_call_levels: usize,
    pub max_expr_depth: usize,
    pub max_function_expr_depth: usize,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_call_levels: 32,
            max_expr_depth: 64,
            max_function_expr_depth: 32,
            max_string_size: 1024 * 1024,
            max_array_size: 10_000,
            max_map_size: 10_000,
        }
    }
}

/// Names the sandbox resolves after tools and variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Puts,
    Rand,
    Tools,
    Variables,
    HasTool,
    Invoke,
    Defer,
    Resolve,
    FinalAnswer,
}

impl Builtin {
    pub const ALL: [Builtin; 9] = [
        Builtin::Puts,
        Builtin::Rand,
        Builtin::Tools,
        Builtin::Variables,
        Builtin::HasTool,
        Builtin::Invoke,
        Builtin::Defer,
        Builtin::Resolve,
        Builtin::FinalAnswer,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Puts => "puts",
            Builtin::Rand => "rand",
            Builtin::Tools => "tools",
            Builtin::Variables => "variables",
            Builtin::HasTool => "has_tool",
            Builtin::Invoke => "invoke",
            Builtin::Defer => "defer",
            Builtin::Resolve => "resolve",
            Builtin::FinalAnswer => FINAL_ANSWER_TOOL,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.name() == name)
    }
}

/// Result of resolving a name inside the sandbox.
pub enum Dispatch {
    Tool(Arc<dyn Tool>),
    Variable(Value),
    Builtin(Builtin),
    NotFound,
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dispatch::Tool(tool) => write!(f, "Tool({})", tool.name()),
            Dispatch::Variable(v) => write!(f, "Variable({v})"),
            Dispatch::Builtin(b) => write!(f, "Builtin({})", b.name()),
            Dispatch::NotFound => write!(f, "NotFound"),
        }
    }
}

/// Capture buffer for `puts`/`print` output.
///
/// Clones share the same buffer, so a caller can read what was printed even
/// when the evaluating thread never returns.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer(Arc<Mutex<String>>);

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_line(&self, line: &str) {
        let mut out = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        out.push_str(line);
        out.push('\n');
    }

    /// Everything captured so far.
    pub fn contents(&self) -> String {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn take(&self) -> String {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[derive(Debug, Default)]
struct FutureTable {
    next_id: u64,
    pending: Vec<(u64, String, Value)>,
    resolved: HashMap<u64, Result<Value, String>>,
}

/// What one evaluation produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub value: Result<Value, InterpreterError>,
    /// Set when code raised an accepted final answer.
    pub final_answer: Option<Value>,
    /// Captured `puts`/`print` output.
    pub output: String,
    pub called_tools: Vec<String>,
}

impl MeasuredOutput for Evaluation {
    fn output_bytes(&self) -> usize {
        let value_bytes = match &self.value {
            Ok(v) => v.output_bytes(),
            Err(_) => 0,
        };
        self.output.len() + value_bytes
    }
}

/// Granted tools and variables plus deferred-call bookkeeping.
#[derive(Clone)]
pub struct Sandbox {
    toolbox: Toolbox,
    variables: BTreeMap<String, Value>,
    retrieval: RetrievalMatcher,
    limits: SandboxLimits,
    futures: Arc<Mutex<FutureTable>>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("tools", &self.toolbox.names())
            .field("variables", &self.variables.keys().collect::<Vec<_>>())
            .field("limits", &self.limits)
            .finish()
    }
}

impl Sandbox {
    pub fn new(toolbox: Toolbox) -> Self {
        Self {
            toolbox,
            variables: BTreeMap::new(),
            retrieval: RetrievalMatcher::default(),
            limits: SandboxLimits::default(),
            futures: Arc::new(Mutex::new(FutureTable::default())),
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn with_retrieval_matcher(mut self, matcher: RetrievalMatcher) -> Self {
        self.retrieval = matcher;
        self
    }

    pub fn with_limits(mut self, limits: SandboxLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn toolbox(&self) -> &Toolbox {
        &self.toolbox
    }

    pub fn variables(&self) -> &BTreeMap<String, Value> {
        &self.variables
    }

    /// Resolve `name`: tools first, then variables, then builtins.
    pub fn lookup(&self, name: &str) -> Dispatch {
        if let Some(tool) = self.toolbox.get(name) {
            return Dispatch::Tool(tool.clone());
        }
        if let Some(value) = self.variables.get(name) {
            return Dispatch::Variable(value.clone());
        }
        match Builtin::from_name(name) {
            Some(builtin) => Dispatch::Builtin(builtin),
            None => Dispatch::NotFound,
        }
    }

    /// Drop deferred calls left over from a previous execution.
    pub fn clear_pending(&self) {
        let mut table = self.futures.lock().unwrap_or_else(PoisonError::into_inner);
        table.pending.clear();
        table.resolved.clear();
    }

    pub fn pending_count(&self) -> usize {
        self.futures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .len()
    }

    /// Evaluate `code` under `limiter`.
    ///
    /// Blocks the calling thread, including on async tools. Must not be
    /// called from an async worker thread; `runtime` drives tool futures when
    /// given.
    pub fn instance_eval(&self, code: &str, limiter: &Limiter, runtime: Option<Handle>) -> Evaluation {
        self.instance_eval_into(code, limiter, runtime, OutputBuffer::new())
    }

    /// Like [`Sandbox::instance_eval`], printing into a caller-held buffer.
    pub fn instance_eval_into(
        &self,
        code: &str,
        limiter: &Limiter,
        runtime: Option<Handle>,
        output: OutputBuffer,
    ) -> Evaluation {
        let dispatcher = Arc::new(Dispatcher {
            sandbox: self.clone(),
            limiter: limiter.clone(),
            runtime,
            output,
            called: Mutex::new(Vec::new()),
        });
        let engine = build_engine(&dispatcher);
        let mut scope = Scope::new();

        let evaluated = engine
            .compile(code)
            .map_err(|e| InterpreterError::Syntax(e.to_string()))
            .and_then(|ast| {
                engine
                    .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
                    .map_err(|e| classify_error(&e, limiter.max_operations()))
            });

        let (value, final_answer) = match limiter.take_interrupt() {
            Some(Interrupt::FinalAnswer(answer)) => (Ok(answer.clone()), Some(answer)),
            Some(Interrupt::OperationLimit(limit)) => {
                (Err(InterpreterError::OperationLimit { limit }), None)
            }
            Some(Interrupt::Cancelled) => (Err(InterpreterError::Cancelled), None),
            None => (evaluated.map(|d| dynamic_to_value(&d)), None),
        };

        dispatcher.flush_pending();
        let value = value.and_then(|v| dispatcher.resolve_value(v));
        let final_answer = match (&value, final_answer) {
            (Ok(v), Some(_)) => Some(v.clone()),
            _ => None,
        };

        Evaluation {
            value,
            final_answer,
            output: dispatcher.take_output(),
            called_tools: dispatcher.called_tools(),
        }
    }
}

/// Per-execution state shared by the registered interpreter callbacks.
struct Dispatcher {
    sandbox: Sandbox,
    limiter: Limiter,
    runtime: Option<Handle>,
    output: OutputBuffer,
    called: Mutex<Vec<String>>,
}

impl Dispatcher {
    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        match &self.runtime {
            Some(handle) => handle.block_on(fut),
            None => futures::executor::block_on(fut),
        }
    }

    fn write_line(&self, line: &str) {
        self.output.push_line(line);
    }

    fn take_output(&self) -> String {
        self.output.take()
    }

    fn called_tools(&self) -> Vec<String> {
        self.called
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn invoke_tool(&self, name: &str, arguments: Value) -> Result<Value, Box<EvalAltResult>> {
        self.limiter.on_call()?;
        if name == FINAL_ANSWER_TOOL {
            return Err(self.final_answer(FinalAnswerTool::extract_answer(&arguments)));
        }
        let tool = match self.sandbox.lookup(name) {
            Dispatch::Tool(tool) => tool,
            _ => return Err(not_found(name)),
        };
        self.called
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(name.to_string());
        debug!(tool = name, "sandbox tool call");
        self.block_on(tool.execute(arguments))
            .map_err(|e| runtime_error(e.to_string()))
    }

    /// Names of deferred calls not yet run.
    fn deferred_tools(&self) -> Vec<String> {
        self.sandbox
            .futures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .iter()
            .map(|(_, name, _)| name.clone())
            .collect()
    }

    /// Accept the answer unless retrieval was called or deferred earlier in
    /// this execution.
    fn final_answer(&self, answer: Value) -> Box<EvalAltResult> {
        let mut called = self.called_tools();
        called.extend(self.deferred_tools());
        if let Some(tool) = self
            .sandbox
            .retrieval
            .first_retrieval(called.iter().map(String::as_str))
        {
            return runtime_error(format!(
                "final_answer rejected: retrieval tool '{tool}' was called in this same \
                 execution. Wait for its results and give the final answer in the next step."
            ));
        }
        self.limiter.abort(Interrupt::FinalAnswer(answer))
    }

    fn defer(&self, name: &str, arguments: Value) -> Result<Value, Box<EvalAltResult>> {
        if !matches!(self.sandbox.lookup(name), Dispatch::Tool(_)) || name == FINAL_ANSWER_TOOL {
            return Err(not_found(name));
        }
        let mut table = self
            .sandbox
            .futures
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        table.next_id += 1;
        let id = table.next_id;
        table.pending.push((id, name.to_string(), arguments));
        Ok(json!({ FUTURE_KEY: id }))
    }

    /// Run the deferred call `id` now if it is still pending.
    fn run_future(&self, id: u64) -> Result<Value, String> {
        let pending = {
            let mut table = self
                .sandbox
                .futures
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(done) = table.resolved.get(&id) {
                return done.clone();
            }
            let pos = table.pending.iter().position(|(pid, _, _)| *pid == id);
            pos.map(|p| table.pending.remove(p))
        };
        let Some((_, name, arguments)) = pending else {
            return Err(format!("unknown future {id}"));
        };
        let result = self.invoke_tool(&name, arguments).map_err(|e| error_text(&e));
        self.sandbox
            .futures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resolved
            .insert(id, result.clone());
        result
    }

    /// Execute every still-pending deferred call in submission order.
    fn flush_pending(&self) {
        let ids: Vec<u64> = self
            .sandbox
            .futures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .iter()
            .map(|(id, _, _)| *id)
            .collect();
        for id in ids {
            if let Err(e) = self.run_future(id) {
                debug!(future = id, error = %e, "deferred tool call failed");
            }
        }
    }

    /// Replace a future marker with its resolved value.
    fn resolve_value(&self, value: Value) -> Result<Value, InterpreterError> {
        match future_id(&value) {
            Some(id) => self.run_future(id).map_err(InterpreterError::Runtime),
            None => Ok(value),
        }
    }
}

fn future_id(value: &Value) -> Option<u64> {
    let obj = value.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    obj.get(FUTURE_KEY)?.as_u64()
}

fn build_engine(dispatcher: &Arc<Dispatcher>) -> Engine {
    let mut engine = Engine::new_raw();
    engine.register_global_module(CorePackage::new().as_shared_module());
    engine.register_global_module(BasicArrayPackage::new().as_shared_module());
    engine.register_global_module(BasicMapPackage::new().as_shared_module());
    engine.register_global_module(BasicMathPackage::new().as_shared_module());

    let limits = &dispatcher.sandbox.limits;
    engine
        .set_max_call_levels(limits.max_call_levels)
        .set_max_expr_depths(limits.max_expr_depth, limits.max_function_expr_depth)
        .set_max_string_size(limits.max_string_size)
        .set_max_array_size(limits.max_array_size)
        .set_max_map_size(limits.max_map_size);
    engine.disable_symbol("eval");

    let d = dispatcher.clone();
    engine.on_progress(move |count| d.limiter.on_operation(count));
    let d = dispatcher.clone();
    engine.on_print(move |s| d.write_line(s));
    let d = dispatcher.clone();
    engine.on_debug(move |s, _, _| d.write_line(s));

    // Bare identifiers: granted variables, or a tool invoked without arguments.
    let d = dispatcher.clone();
    engine.on_var(move |name, _, ctx| {
        if ctx.scope().contains(name) {
            return Ok(None);
        }
        match d.sandbox.lookup(name) {
            Dispatch::Tool(_) => d.invoke_tool(name, json!({})).and_then(value_to_dynamic).map(Some),
            Dispatch::Variable(value) => value_to_dynamic(value).map(Some),
            _ => Ok(None),
        }
    });

    for name in dispatcher.sandbox.toolbox.names() {
        register_tool(&mut engine, dispatcher, &name);
    }
    for builtin in Builtin::ALL {
        if matches!(dispatcher.sandbox.lookup(builtin.name()), Dispatch::Builtin(_)) {
            register_builtin(&mut engine, dispatcher, builtin);
        }
    }
    engine
}

fn register_tool(engine: &mut Engine, dispatcher: &Arc<Dispatcher>, name: &str) {
    let (d, n) = (dispatcher.clone(), name.to_string());
    engine.register_fn(name, move || -> Result<Dynamic, Box<EvalAltResult>> {
        d.invoke_tool(&n, json!({})).and_then(value_to_dynamic)
    });
    let (d, n) = (dispatcher.clone(), name.to_string());
    engine.register_fn(name, move |arg: Dynamic| -> Result<Dynamic, Box<EvalAltResult>> {
        d.invoke_tool(&n, tool_arguments(&arg))
            .and_then(value_to_dynamic)
    });
}

fn register_builtin(engine: &mut Engine, dispatcher: &Arc<Dispatcher>, builtin: Builtin) {
    let name = builtin.name();
    match builtin {
        Builtin::Puts => {
            let d = dispatcher.clone();
            engine.register_fn(
                name,
                move |value: Dynamic| -> Result<(), Box<EvalAltResult>> {
                    d.limiter.on_call()?;
                    d.write_line(&value.to_string());
                    Ok(())
                },
            );
            let d = dispatcher.clone();
            engine.register_fn(name, move || -> Result<(), Box<EvalAltResult>> {
                d.limiter.on_call()?;
                d.write_line("");
                Ok(())
            });
        }
        Builtin::Rand => {
            engine.register_fn(name, random_unit);
            engine.register_fn(name, |upper: INT| -> INT {
                if upper <= 0 {
                    return 0;
                }
                ((random_unit() * upper as FLOAT) as INT).min(upper - 1)
            });
        }
        Builtin::Tools => {
            let d = dispatcher.clone();
            engine.register_fn(name, move || -> Array {
                d.sandbox
                    .toolbox
                    .names()
                    .into_iter()
                    .map(Dynamic::from)
                    .collect()
            });
        }
        Builtin::Variables => {
            let d = dispatcher.clone();
            engine.register_fn(name, move || -> Array {
                d.sandbox
                    .variables
                    .keys()
                    .cloned()
                    .map(Dynamic::from)
                    .collect()
            });
        }
        Builtin::HasTool => {
            let d = dispatcher.clone();
            engine.register_fn(name, move |tool: ImmutableString| {
                d.sandbox.toolbox.contains(tool.as_str())
            });
        }
        Builtin::Invoke => {
            let d = dispatcher.clone();
            engine.register_fn(
                name,
                move |tool: ImmutableString| -> Result<Dynamic, Box<EvalAltResult>> {
                    d.invoke_tool(tool.as_str(), json!({})).and_then(value_to_dynamic)
                },
            );
            let d = dispatcher.clone();
            engine.register_fn(
                name,
                move |tool: ImmutableString, args: Dynamic| -> Result<Dynamic, Box<EvalAltResult>> {
                    d.invoke_tool(tool.as_str(), tool_arguments(&args))
                        .and_then(value_to_dynamic)
                },
            );
        }
        Builtin::Defer => {
            let d = dispatcher.clone();
            engine.register_fn(
                name,
                move |tool: ImmutableString, args: Dynamic| -> Result<Dynamic, Box<EvalAltResult>> {
                    d.limiter.on_call()?;
                    d.defer(tool.as_str(), tool_arguments(&args))
                        .and_then(value_to_dynamic)
                },
            );
        }
        Builtin::Resolve => {
            let d = dispatcher.clone();
            engine.register_fn(
                name,
                move |value: Dynamic| -> Result<Dynamic, Box<EvalAltResult>> {
                    d.limiter.on_call()?;
                    let value = dynamic_to_value(&value);
                    match future_id(&value) {
                        Some(id) => d
                            .run_future(id)
                            .map_err(runtime_error)
                            .and_then(value_to_dynamic),
                        None => value_to_dynamic(value),
                    }
                },
            );
        }
        Builtin::FinalAnswer => {
            let d = dispatcher.clone();
            engine.register_fn(
                name,
                move |answer: Dynamic| -> Result<Dynamic, Box<EvalAltResult>> {
                    d.limiter.on_call()?;
                    Err(d.final_answer(dynamic_to_value(&answer)))
                },
            );
        }
    }
}

/// Map keyword-style arguments through; wrap anything else as `input`.
fn tool_arguments(arg: &Dynamic) -> Value {
    match dynamic_to_value(arg) {
        Value::Object(map) => Value::Object(map),
        Value::Null => json!({}),
        other => json!({ "input": other }),
    }
}

pub(crate) fn dynamic_to_value(value: &Dynamic) -> Value {
    rhai::serde::from_dynamic::<Value>(value).unwrap_or_else(|_| Value::String(value.to_string()))
}

fn value_to_dynamic(value: Value) -> Result<Dynamic, Box<EvalAltResult>> {
    rhai::serde::to_dynamic(value)
}

fn runtime_error(message: impl Into<String>) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(
        Dynamic::from(message.into()),
        Position::NONE,
    ))
}

fn not_found(name: &str) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorFunctionNotFound(
        name.to_string(),
        Position::NONE,
    ))
}

fn error_text(err: &EvalAltResult) -> String {
    classify_error(err, 0).to_string()
}

/// Strip the argument list from an interpreter function signature.
fn function_name(signature: &str) -> String {
    signature
        .split(|c: char| c == ' ' || c == '(')
        .next()
        .unwrap_or(signature)
        .to_string()
}

fn classify_error(err: &EvalAltResult, limit: u64) -> InterpreterError {
    match err {
        EvalAltResult::ErrorFunctionNotFound(signature, _) => InterpreterError::NotFound {
            name: function_name(signature),
        },
        EvalAltResult::ErrorVariableNotFound(name, _) => InterpreterError::NotFound {
            name: name.clone(),
        },
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => classify_error(inner, limit),
        EvalAltResult::ErrorRuntime(value, _) => InterpreterError::Runtime(value.to_string()),
        EvalAltResult::ErrorParsing(kind, _) => InterpreterError::Syntax(kind.to_string()),
        EvalAltResult::ErrorTooManyOperations(_) => InterpreterError::OperationLimit { limit },
        EvalAltResult::ErrorTerminated(_, _) => InterpreterError::Cancelled,
        other => InterpreterError::Runtime(other.to_string()),
    }
}

fn random_unit() -> FLOAT {
    let (_, low) = uuid::Uuid::new_v4().as_u64_pair();
    (low & ((1u64 << 53) - 1)) as FLOAT / (1u64 << 53) as FLOAT
}
