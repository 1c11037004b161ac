//! Restricted execution environment for submitted code.
//!
//! A [`SandboxEnvironment`] owns one session's namespace: an arena heap of
//! typed values and the global bindings that persist between executions.
//! Code runs in a small interpreter whose builtin table is assembled from a
//! [`CapabilitySet`]; anything outside that table (file, process, network,
//! dynamic evaluation) simply does not exist inside the sandbox.

mod ast;
mod builtins;
pub mod capability;
mod fault;
mod interp;
mod lexer;
mod parser;
mod value;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::config::ExecutionLimits;
use crate::model::ModelClient;
use crate::router::{OutputRouter, OutputTarget};

use self::ast::{Expr, Stmt};
use self::interp::{Interpreter, RunLimits};
use self::value::{HeapLimits, HostFn, Value};

pub use self::capability::{Capability, CapabilitySet};
pub use self::fault::{Fault, FaultKind};
pub use self::interp::PROTECTED_NAMES;

/// Words that open a statement; a trailing line starting with one of these
/// is never auto-printed.
const STATEMENT_KEYWORDS: &[&str] = &[
    "import", "from", "def", "class", "if", "elif", "else", "for", "while", "try", "except",
    "finally", "with", "return", "yield", "break", "continue", "pass", "raise", "assert", "del",
    "global", "nonlocal",
];

/// Outcome of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Text written to the primary channel, including auto-print output.
    pub stdout: String,
    /// Fault message when the execution failed.
    pub stderr: String,
    pub success: bool,
    /// Wall time spent executing.
    pub elapsed: Duration,
    /// Interpreter steps consumed.
    pub steps: u64,
    /// JSON view of the namespace after execution.
    pub namespace: serde_json::Map<String, serde_json::Value>,
    /// The fault that ended execution, if any.
    #[serde(skip)]
    pub fault: Option<Fault>,
}

impl ExecutionResult {
    /// A failed result that never reached the interpreter.
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            success: false,
            elapsed: Duration::ZERO,
            steps: 0,
            namespace: serde_json::Map::new(),
            fault: None,
        }
    }
}

/// A parsed submission, ready to run.
struct Plan {
    declarations: Vec<Stmt>,
    body: Vec<Stmt>,
    /// Trailing bare expression and its 1-based source line.
    trailing: Option<(Expr, usize)>,
}

/// One session's sandbox: heap, globals, capabilities and output router.
pub struct SandboxEnvironment {
    heap: value::Heap,
    globals: IndexMap<String, Value>,
    caps: CapabilitySet,
    limits: ExecutionLimits,
    router: OutputRouter,
    model: Option<Arc<dyn ModelClient>>,
}

impl std::fmt::Debug for SandboxEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxEnvironment")
            .field("variables", &self.globals.len())
            .field("live_objects", &self.heap.live())
            .field("capabilities", &self.caps)
            .field("model", &self.model.is_some())
            .finish()
    }
}

impl SandboxEnvironment {
    /// Creates an empty sandbox.
    ///
    /// `llm_query` and `FINAL_VAR` are bound when their capabilities are
    /// granted. `llm_query` answers with an error string while no model is
    /// attached.
    pub fn new(caps: CapabilitySet, limits: ExecutionLimits) -> Self {
        let heap = value::Heap::new(HeapLimits {
            max_objects: limits.max_heap_objects,
            max_collection_len: limits.max_collection_len,
            max_string_len: limits.max_string_len,
        });
        let mut globals = IndexMap::new();
        if caps.contains(Capability::ModelQuery) {
            globals.insert("llm_query".to_string(), Value::Host(HostFn::LlmQuery));
        }
        if caps.contains(Capability::FinalVar) {
            globals.insert("FINAL_VAR".to_string(), Value::Host(HostFn::FinalVar));
        }
        Self {
            heap,
            globals,
            caps,
            limits,
            router: OutputRouter::new(),
            model: None,
        }
    }

    /// Attaches the secondary-model client used by `llm_query`.
    pub fn with_model(mut self, model: Arc<dyn ModelClient>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn set_model(&mut self, model: Option<Arc<dyn ModelClient>>) {
        self.model = model;
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.caps
    }

    /// Binds `context` to a read-only string.
    pub fn bind_context_text(&mut self, text: &str) -> Result<(), Fault> {
        if !self.caps.contains(Capability::Context) {
            tracing::debug!("context capability disabled, not binding context");
            return Ok(());
        }
        self.heap.check_str_len(text.len())?;
        self.globals.insert("context".to_string(), Value::str(text));
        Ok(())
    }

    /// Binds `context` to a frozen copy of a JSON document.
    pub fn bind_context_json(&mut self, json: &serde_json::Value) -> Result<(), Fault> {
        if !self.caps.contains(Capability::Context) {
            tracing::debug!("context capability disabled, not binding context");
            return Ok(());
        }
        let value = value::from_json(&mut self.heap, json)?;
        self.heap.freeze(&value);
        self.globals.insert("context".to_string(), value);
        Ok(())
    }

    /// Seeds a variable from JSON, e.g. when restoring persisted locals.
    pub fn set_variable(&mut self, name: &str, json: &serde_json::Value) -> Result<(), Fault> {
        if PROTECTED_NAMES.contains(&name) {
            return Err(Fault::type_error(format!(
                "'{}' is read-only and cannot be rebound",
                name
            )));
        }
        if !is_identifier(name) {
            return Err(Fault::value_error(format!(
                "'{}' is not a valid variable name",
                name
            )));
        }
        let value = value::from_json(&mut self.heap, json)?;
        self.globals.insert(name.to_string(), value);
        Ok(())
    }

    /// User-visible variable names, in definition order.
    pub fn variable_names(&self) -> Vec<String> {
        self.globals
            .keys()
            .filter(|name| is_visible(name))
            .cloned()
            .collect()
    }

    pub fn has_variable(&self, name: &str) -> bool {
        is_visible(name) && self.globals.contains_key(name)
    }

    /// Renders a variable the way `str()` would.
    pub fn render_variable(&self, name: &str) -> Option<String> {
        let value = self.globals.get(name)?;
        value::to_str(&self.heap, value).ok()
    }

    /// JSON view of the namespace.
    ///
    /// Names starting with `_` and the injected bindings are skipped;
    /// values with no JSON form become a `<typename>` placeholder. The whole
    /// snapshot shares one `max_string_len` budget, and a value that would
    /// overrun what is left also becomes a placeholder.
    pub fn snapshot(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut out = serde_json::Map::new();
        let mut remaining = self.limits.max_string_len;
        for (name, value) in &self.globals {
            if !is_visible(name) {
                continue;
            }
            let json = match value::to_json_within(&self.heap, value, remaining) {
                Ok((json, used)) => {
                    remaining = remaining.saturating_sub(used);
                    json
                }
                Err(_) => serde_json::Value::String(value::placeholder(&self.heap, value)),
            };
            out.insert(name.clone(), json);
        }
        out
    }

    /// Text captured on the secondary channel by `llm_query`.
    pub fn secondary_output(&self) -> &str {
        self.router.buffer(OutputTarget::Secondary)
    }

    pub fn clear_secondary_output(&mut self) {
        self.router.clear(OutputTarget::Secondary);
    }

    /// Executes a submission.
    ///
    /// Top-level `import`/`from` lines run first. If the last meaningful line
    /// of the remaining body is a bare expression, its value is printed after
    /// the rest of the body runs. A fault stops execution; output produced
    /// before it is kept, as are namespace changes.
    pub fn execute(&mut self, code: &str) -> ExecutionResult {
        self.run(code, None)
    }

    /// Same as [`SandboxEnvironment::execute`], but stops with `Timeout`
    /// once `cancel` is set.
    pub fn execute_cancellable(
        &mut self,
        code: &str,
        cancel: Arc<AtomicBool>,
    ) -> ExecutionResult {
        self.run(code, Some(cancel))
    }

    fn run(&mut self, code: &str, cancel: Option<Arc<AtomicBool>>) -> ExecutionResult {
        let started = Instant::now();
        self.router.clear(OutputTarget::Primary);
        self.router.set_target(OutputTarget::Primary);

        let limits = RunLimits {
            max_steps: self.limits.max_steps,
            wall_clock: Duration::from_millis(self.limits.wall_clock_ms),
            max_call_depth: self.limits.max_call_depth,
            max_output_bytes: self.limits.max_output_bytes,
            cancel,
        };
        let mut interp = Interpreter::new(
            &mut self.heap,
            &mut self.globals,
            &self.caps,
            &mut self.router,
            self.model.as_deref(),
            limits,
        );
        let outcome = plan(code).and_then(|plan| run_plan(&mut interp, &plan));
        let steps = interp.steps();
        drop(interp);

        let freed = self.heap.collect(self.globals.values());
        let elapsed = started.elapsed();
        let stdout = self.router.buffer(OutputTarget::Primary).to_string();
        let (stderr, fault) = match outcome {
            Ok(()) => (String::new(), None),
            Err(fault) => (fault.to_string(), Some(fault)),
        };
        tracing::debug!(
            success = fault.is_none(),
            steps,
            freed,
            elapsed_ms = elapsed.as_millis() as u64,
            "Sandbox execution finished"
        );

        ExecutionResult {
            stdout,
            stderr,
            success: fault.is_none(),
            elapsed,
            steps,
            namespace: self.snapshot(),
            fault,
        }
    }
}

fn is_visible(name: &str) -> bool {
    !name.starts_with('_') && !PROTECTED_NAMES.contains(&name)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
        && !lexer::is_keyword(name)
}

fn run_plan(interp: &mut Interpreter<'_>, plan: &Plan) -> Result<(), Fault> {
    interp.run(&plan.declarations)?;
    interp.run(&plan.body)?;
    if let Some((expr, line)) = &plan.trailing {
        let value = interp.eval_expr(expr).map_err(|f| f.at_line(*line))?;
        if !value.is_none() {
            let mut text = value::repr(interp.heap, &value)?;
            text.push('\n');
            interp.write_output(&text)?;
        }
    }
    Ok(())
}

/// Splits and parses a submission.
///
/// Lines are blanked rather than removed so fault line numbers keep
/// pointing at the submitted source.
fn plan(code: &str) -> Result<Plan, Fault> {
    let lines: Vec<&str> = code
        .split('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .collect();
    let is_declaration = |line: &str| line.starts_with("import ") || line.starts_with("from ");

    let declarations: Vec<&str> = lines
        .iter()
        .map(|l| if is_declaration(l) { *l } else { "" })
        .collect();
    let body: Vec<&str> = lines
        .iter()
        .map(|l| if is_declaration(l) { "" } else { *l })
        .collect();
    let declarations = parser::parse_module(&declarations.join("\n"))?;

    let last = body.iter().rposition(|l| {
        let t = l.trim();
        !t.is_empty() && !t.starts_with('#')
    });
    if let Some(index) = last {
        if is_bare_expression(body[index]) {
            let prefix = parser::parse_module(&body[..index].join("\n"));
            let expr = parser::parse_expression(strip_comment(body[index]).trim_end());
            if let (Ok(prefix), Ok(expr)) = (prefix, expr) {
                return Ok(Plan {
                    declarations,
                    body: prefix,
                    trailing: Some((expr, index + 1)),
                });
            }
        }
    }

    Ok(Plan {
        declarations,
        body: parser::parse_module(&body.join("\n"))?,
        trailing: None,
    })
}

/// Decides whether a trailing line is an expression worth auto-printing.
fn is_bare_expression(line: &str) -> bool {
    if line.starts_with(char::is_whitespace) {
        return false;
    }
    let word = line
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .next()
        .unwrap_or("");
    if STATEMENT_KEYWORDS.contains(&word) || line.starts_with("print(") {
        return false;
    }
    let code = strip_comment(line).trim_end();
    if code.ends_with(':') {
        return false;
    }
    !has_assignment(code)
}

/// Walks a line outside string literals, calling `visit` with each byte
/// offset, character and bracket depth. Stops when `visit` returns true.
fn scan_code(line: &str, mut visit: impl FnMut(usize, char, usize) -> bool) -> Option<usize> {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut depth = 0usize;
    for (i, c) in line.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            _ => {}
        }
        if visit(i, c, depth) {
            return Some(i);
        }
    }
    None
}

fn strip_comment(line: &str) -> &str {
    match scan_code(line, |_, c, _| c == '#') {
        Some(i) => &line[..i],
        None => line,
    }
}

/// True when the first top-level `=` is an assignment, not part of a
/// comparison operator.
fn has_assignment(code: &str) -> bool {
    let bytes = code.as_bytes();
    scan_code(code, |i, c, depth| {
        if c != '=' || depth > 0 {
            return false;
        }
        let prev = i.checked_sub(1).map(|p| bytes[p]);
        let next = bytes.get(i + 1).copied();
        !matches!(prev, Some(b'=' | b'!' | b'<' | b'>')) && next != Some(b'=')
    })
    .is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FnModelClient, ModelError};
    use std::fmt::Write as _;

    fn sandbox() -> SandboxEnvironment {
        SandboxEnvironment::new(CapabilitySet::all(), ExecutionLimits::default())
    }

    #[test]
    fn trailing_expression_is_auto_printed() {
        let mut sb = sandbox();
        let result = sb.execute("1 + 1");
        assert!(result.success, "{}", result.stderr);
        assert_eq!(result.stdout, "2\n");

        let result = sb.execute("x = 1");
        assert!(result.success);
        assert_eq!(result.stdout, "");
    }

    #[test]
    fn auto_print_uses_repr_and_skips_none() {
        let mut sb = sandbox();
        assert_eq!(sb.execute("'hi'").stdout, "'hi'\n");
        assert_eq!(sb.execute("None").stdout, "");
        assert_eq!(sb.execute("[1, 'a']  # trailing comment").stdout, "[1, 'a']\n");
    }

    #[test]
    fn statements_before_the_expression_run_once() {
        let mut sb = sandbox();
        let result = sb.execute("print('a')\nx = 2\n\n# done\nx * 3\n");
        assert_eq!(result.stdout, "a\n6\n");
    }

    #[test]
    fn comparisons_are_expressions_but_assignments_are_not() {
        assert!(is_bare_expression("x == 1"));
        assert!(is_bare_expression("x != 1"));
        assert!(is_bare_expression("x <= 1"));
        assert!(is_bare_expression("x >= 1"));
        assert!(is_bare_expression("f(key=1)"));
        assert!(is_bare_expression("'a=b'"));
        assert!(!is_bare_expression("x = 1"));
        assert!(!is_bare_expression("x += 1"));
        assert!(!is_bare_expression("    x"));
        assert!(!is_bare_expression("for i in y:"));
        assert!(!is_bare_expression("print(x)"));
        assert!(!is_bare_expression("return x"));
        assert!(is_bare_expression("returned"));
    }

    #[test]
    fn multi_line_trailing_statement_is_not_split() {
        let mut sb = sandbox();
        let result = sb.execute("total = sum([\n1,\n2,\n])\nprint(total)");
        assert_eq!(result.stdout, "3\n");
        let result = sb.execute("data = [\n1,\n2\n]");
        assert!(result.success, "{}", result.stderr);
        assert_eq!(result.stdout, "");
    }

    #[test]
    fn namespace_persists_between_executions() {
        let mut sb = sandbox();
        sb.execute("x = 5");
        assert_eq!(sb.execute("x + 1").stdout, "6\n");
        assert!(sandbox().execute("x").stderr.contains("NameError"));
    }

    #[test]
    fn fault_keeps_partial_output_and_mutations() {
        let mut sb = sandbox();
        let result = sb.execute("print('a')\ny = 1\n1 / 0\ny = 2");
        assert!(!result.success);
        assert_eq!(result.stdout, "a\n");
        assert!(result.stderr.starts_with("ZeroDivisionError"));
        assert_eq!(result.fault.map(|f| f.kind), Some(FaultKind::ZeroDivisionError));
        assert_eq!(result.namespace["y"], serde_json::json!(1));

        let next = sb.execute("y + 10");
        assert_eq!(next.stdout, "11\n");
    }

    #[test]
    fn imports_run_before_the_body() {
        let mut sb = sandbox();
        let result = sb.execute("x = math.floor(2.7)\nimport math\nx");
        assert!(result.success, "{}", result.stderr);
        assert_eq!(result.stdout, "2\n");
    }

    #[test]
    fn fault_lines_point_at_the_submission() {
        let mut sb = sandbox();
        let result = sb.execute("import math\na = 1\nb = undefined_name");
        assert_eq!(result.fault.and_then(|f| f.line), Some(3));
        let result = sb.execute("a = 1\n\nmissing + 1");
        assert_eq!(result.fault.and_then(|f| f.line), Some(3));
    }

    #[test]
    fn snapshot_skips_private_and_injected_names() {
        let mut sb = sandbox();
        sb.bind_context_text("ctx").unwrap();
        let result = sb.execute("_hidden = 1\nvisible = {'a': [1, 2]}\ndef f(): pass\ns = {1}");
        let ns = result.namespace;
        assert!(!ns.contains_key("_hidden"));
        assert!(!ns.contains_key("context"));
        assert!(!ns.contains_key("llm_query"));
        assert_eq!(ns["visible"], serde_json::json!({"a": [1, 2]}));
        assert_eq!(ns["f"], serde_json::json!("<function>"));
        assert_eq!(ns["s"], serde_json::json!("<set>"));
    }

    #[test]
    fn cancelled_execution_stops_and_keeps_the_sandbox_usable() {
        let mut sb = sandbox();
        let cancel = Arc::new(AtomicBool::new(true));
        let result = sb.execute_cancellable("x = 0\nwhile True:\n    x += 1", cancel);
        assert!(!result.success);
        assert_eq!(result.fault.map(|f| f.kind), Some(FaultKind::Timeout));
        assert_eq!(sb.execute("x > 0").stdout, "True\n");
    }

    fn small_strings() -> SandboxEnvironment {
        let limits = ExecutionLimits {
            max_string_len: 64 * 1024,
            ..ExecutionLimits::default()
        };
        SandboxEnvironment::new(CapabilitySet::all(), limits)
    }

    #[test]
    fn oversized_shared_values_snapshot_as_placeholders() {
        let mut sb = small_strings();
        let result = sb.execute("x = 'a' * 60000\ny = [x] * 100000\nn = 1");
        assert!(result.success, "{}", result.stderr);
        assert_eq!(result.namespace["y"], serde_json::json!("<list>"));
        assert_eq!(result.namespace["n"], serde_json::json!(1));
        assert_eq!(result.namespace["x"].as_str().map(str::len), Some(60000));
    }

    #[test]
    fn oversized_repr_fails_with_memory_error() {
        let mut sb = small_strings();
        assert!(sb.execute("x = 'a' * 60000\ny = [x] * 100000").success);

        let result = sb.execute("y");
        assert!(!result.success);
        assert_eq!(result.fault.map(|f| f.kind), Some(FaultKind::MemoryError));

        let result = sb.execute("s = str(y)");
        assert!(!result.success);
        assert_eq!(result.fault.map(|f| f.kind), Some(FaultKind::MemoryError));

        let result = sb.execute("print(y)");
        assert_eq!(result.fault.map(|f| f.kind), Some(FaultKind::MemoryError));
        assert_eq!(result.stdout, "");
    }

    #[test]
    fn oversized_format_width_fails_fast() {
        let mut sb = small_strings();
        let result = sb.execute("'{:>1000000000}'.format(1)");
        assert_eq!(result.fault.map(|f| f.kind), Some(FaultKind::MemoryError));
        let result = sb.execute("x = 1\nf'{x:>1000000000}'");
        assert_eq!(result.fault.map(|f| f.kind), Some(FaultKind::MemoryError));
        assert_eq!(sb.execute("f'{7:>3}'").stdout, "'  7'\n");
    }

    #[test]
    fn context_is_read_only() {
        let mut sb = sandbox();
        sb.bind_context_json(&serde_json::json!({"items": [1, 2, 3]}))
            .unwrap();
        assert_eq!(sb.execute("len(context['items'])").stdout, "3\n");

        let result = sb.execute("context['items'].append(4)");
        assert!(!result.success);
        assert!(result.stderr.contains("read-only"));

        let result = sb.execute("context = 1");
        assert!(!result.success);
        assert_eq!(sb.execute("sum(context['items'])").stdout, "6\n");
    }

    #[test]
    fn context_capability_can_be_withheld() {
        let caps = CapabilitySet::all().without(Capability::Context);
        let mut sb = SandboxEnvironment::new(caps, ExecutionLimits::default());
        sb.bind_context_text("secret").unwrap();
        assert!(sb.execute("context").stderr.contains("NameError"));
    }

    #[test]
    fn step_budget_stops_infinite_loops() {
        let limits = ExecutionLimits {
            max_steps: 10_000,
            ..ExecutionLimits::default()
        };
        let mut sb = SandboxEnvironment::new(CapabilitySet::all(), limits);
        let result = sb.execute("x = 0\nwhile True:\n    x += 1");
        assert!(!result.success);
        assert_eq!(result.fault.map(|f| f.kind), Some(FaultKind::StepLimitExceeded));
        assert!(sb.execute("x > 0").stdout.starts_with("True"));
    }

    #[test]
    fn llm_query_output_stays_on_the_secondary_channel() {
        let client = FnModelClient(|prompt: &str, out: &mut dyn std::fmt::Write| {
            let _ = write!(out, "model saw {}", prompt);
            Ok(format!("answer to {}", prompt))
        });
        let mut sb = sandbox().with_model(Arc::new(client));
        let result = sb.execute("r = llm_query('q')\nprint(r)");
        assert_eq!(result.stdout, "answer to q\n");
        assert_eq!(sb.secondary_output(), "model saw q");

        let failing = FnModelClient(|_: &str, out: &mut dyn std::fmt::Write| {
            let _ = write!(out, "partial");
            Err(ModelError::Failed("boom".to_string()))
        });
        sb.set_model(Some(Arc::new(failing)));
        let result = sb.execute("print('before')\nllm_query('q')");
        assert!(!result.success);
        assert_eq!(result.stdout, "before\n");
        assert!(result.stderr.starts_with("ModelError"));
    }

    #[test]
    fn final_var_reads_back_a_variable() {
        let mut sb = sandbox();
        let result = sb.execute("answer = 42\nFINAL_VAR('answer')");
        assert_eq!(result.stdout, "'42'\n");
        assert_eq!(sb.render_variable("answer").as_deref(), Some("42"));
    }

    #[test]
    fn seeded_variables_are_visible() {
        let mut sb = sandbox();
        sb.set_variable("rows", &serde_json::json!([1, 2])).unwrap();
        assert!(sb.set_variable("context", &serde_json::json!(1)).is_err());
        assert!(sb.set_variable("not valid", &serde_json::json!(1)).is_err());
        assert_eq!(sb.execute("rows[-1]").stdout, "2\n");
        assert_eq!(sb.variable_names(), vec!["rows".to_string()]);
    }
}
