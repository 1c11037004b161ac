//! Tree-walking evaluator with step, time, depth and output budgets.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{self, AtomicBool};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;

use super::ast::*;
use super::builtins;
use super::capability::{Capability, CapabilitySet};
use super::fault::{Fault, FaultKind};
use super::value::*;
use crate::model::ModelClient;
use crate::router::{OutputRouter, OutputTarget};

/// Names bound by the host that sandboxed code may not rebind.
pub const PROTECTED_NAMES: &[&str] = &["context", "llm_query", "FINAL_VAR"];

/// Heap size that triggers the first in-flight collection.
const GC_FLOOR: usize = 10_000;

/// How often, in steps, the wall clock is consulted.
const CLOCK_INTERVAL: u64 = 256;

/// Step and wall-clock budget for one execution.
#[derive(Debug)]
pub struct Budget {
    steps: u64,
    max_steps: u64,
    deadline: Instant,
    wall_clock: Duration,
    cancel: Option<Arc<AtomicBool>>,
}

impl Budget {
    pub fn new(max_steps: u64, wall_clock: Duration) -> Self {
        Self {
            steps: 0,
            max_steps,
            deadline: Instant::now() + wall_clock,
            wall_clock,
            cancel: None,
        }
    }

    /// Stops the execution with `Timeout` once `flag` is set.
    pub fn with_cancel(mut self, flag: Option<Arc<AtomicBool>>) -> Self {
        self.cancel = flag;
        self
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn tick(&mut self) -> Result<(), Fault> {
        self.charge(1)
    }

    /// Consumes `n` steps.
    pub fn charge(&mut self, n: u64) -> Result<(), Fault> {
        let before = self.steps;
        self.steps = self.steps.saturating_add(n);
        if self.steps > self.max_steps {
            return Err(Fault::new(
                FaultKind::StepLimitExceeded,
                format!("execution exceeded {} steps", self.max_steps),
            ));
        }
        if before / CLOCK_INTERVAL == self.steps / CLOCK_INTERVAL {
            return Ok(());
        }
        if self
            .cancel
            .as_ref()
            .is_some_and(|flag| flag.load(atomic::Ordering::Relaxed))
        {
            return Err(Fault::new(FaultKind::Timeout, "execution was cancelled"));
        }
        if Instant::now() > self.deadline {
            return Err(Fault::new(
                FaultKind::Timeout,
                format!(
                    "execution exceeded the wall-clock limit of {} ms",
                    self.wall_clock.as_millis()
                ),
            ));
        }
        Ok(())
    }
}

/// Control flow out of a statement.
#[derive(Debug)]
pub(super) enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

struct Frame {
    locals: ObjId,
    globals: HashSet<String>,
    nonlocals: HashSet<String>,
    captured: bool,
}

/// Iteration state of an active `for` loop or comprehension clause, or of a
/// builtin consuming an iterable. Ranges are never materialized.
pub(super) enum LoopItems {
    Range(RangeValue, usize),
    Items(Vec<Value>, usize),
}

impl LoopItems {
    pub(super) fn next(&mut self) -> Option<Value> {
        match self {
            LoopItems::Range(range, pos) => {
                if *pos >= range.len() {
                    return None;
                }
                let value = range.get(*pos);
                *pos += 1;
                Some(Value::Int(value))
            }
            LoopItems::Items(items, pos) => {
                let value = items.get(*pos).cloned();
                *pos += 1;
                value
            }
        }
    }
}

/// Bounds applied to a single execution.
#[derive(Debug, Clone)]
pub struct RunLimits {
    pub max_steps: u64,
    pub wall_clock: Duration,
    pub max_call_depth: usize,
    pub max_output_bytes: usize,
    /// Set by the host to stop a running execution.
    pub cancel: Option<Arc<AtomicBool>>,
}

pub struct Interpreter<'a> {
    pub(super) heap: &'a mut Heap,
    pub(super) globals: &'a mut IndexMap<String, Value>,
    pub(super) caps: &'a CapabilitySet,
    pub(super) out: &'a mut OutputRouter,
    pub(super) model: Option<&'a dyn ModelClient>,
    pub(super) budget: Budget,
    frames: Vec<Frame>,
    loops: Vec<LoopItems>,
    handling: Vec<Fault>,
    call_depth: usize,
    max_call_depth: usize,
    max_output_bytes: usize,
    output_bytes: usize,
    gc_threshold: usize,
}

impl<'a> Interpreter<'a> {
    pub fn new(
        heap: &'a mut Heap,
        globals: &'a mut IndexMap<String, Value>,
        caps: &'a CapabilitySet,
        out: &'a mut OutputRouter,
        model: Option<&'a dyn ModelClient>,
        limits: RunLimits,
    ) -> Self {
        let gc_threshold = (heap.live() * 2).max(GC_FLOOR);
        Self {
            heap,
            globals,
            caps,
            out,
            model,
            budget: Budget::new(limits.max_steps, limits.wall_clock)
                .with_cancel(limits.cancel),
            frames: Vec::new(),
            loops: Vec::new(),
            handling: Vec::new(),
            call_depth: 0,
            max_call_depth: limits.max_call_depth,
            max_output_bytes: limits.max_output_bytes,
            output_bytes: 0,
            gc_threshold,
        }
    }

    pub fn steps(&self) -> u64 {
        self.budget.steps()
    }

    /// Runs module-level statements.
    pub fn run(&mut self, body: &[Stmt]) -> Result<(), Fault> {
        for stmt in body {
            match self.exec(stmt)? {
                Flow::Normal => {}
                Flow::Return(_) => {
                    return Err(Fault::syntax(stmt.line, "'return' outside function"))
                }
                Flow::Break | Flow::Continue => {
                    return Err(Fault::syntax(stmt.line, "'break' or 'continue' outside loop"))
                }
            }
        }
        Ok(())
    }

    /// Evaluates a single expression at module level.
    pub fn eval_expr(&mut self, expr: &Expr) -> Result<Value, Fault> {
        self.budget.tick()?;
        self.eval(expr)
    }

    /// Writes text to the current output target, enforcing the output cap.
    pub(super) fn write_output(&mut self, text: &str) -> Result<(), Fault> {
        self.output_bytes += text.len();
        if self.output_bytes > self.max_output_bytes {
            return Err(Fault::new(
                FaultKind::MemoryError,
                format!("output exceeded {} bytes", self.max_output_bytes),
            ));
        }
        self.out.write(text);
        Ok(())
    }

    fn maybe_collect(&mut self) {
        if !self.frames.is_empty() || self.heap.live() < self.gc_threshold {
            return;
        }
        let loop_values: Vec<Value> = self
            .loops
            .iter()
            .flat_map(|l| match l {
                LoopItems::Items(items, _) => items.clone(),
                LoopItems::Range(..) => Vec::new(),
            })
            .collect();
        let freed = self
            .heap
            .collect(self.globals.values().chain(loop_values.iter()));
        tracing::trace!(freed, live = self.heap.live(), "Collected sandbox heap");
        self.gc_threshold = (self.heap.live() * 2).max(GC_FLOOR);
    }

    // ---- statements ----

    pub(super) fn exec_block(&mut self, body: &[Stmt]) -> Result<Flow, Fault> {
        for stmt in body {
            let flow = self.exec(stmt)?;
            if !matches!(flow, Flow::Normal) {
                return Ok(flow);
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&mut self, stmt: &Stmt) -> Result<Flow, Fault> {
        self.budget.tick().map_err(|f| f.at_line(stmt.line))?;
        self.maybe_collect();
        self.exec_kind(&stmt.kind).map_err(|f| f.at_line(stmt.line))
    }

    fn exec_kind(&mut self, kind: &StmtKind) -> Result<Flow, Fault> {
        match kind {
            StmtKind::Expr(expr) => {
                self.eval(expr)?;
            }
            StmtKind::Assign { targets, value } => {
                let value = self.eval(value)?;
                for target in targets {
                    self.assign(target, value.clone())?;
                }
            }
            StmtKind::AugAssign { target, op, value } => self.aug_assign(target, *op, value)?,
            StmtKind::If { test, body, orelse } => {
                let test = self.eval(test)?;
                return if truthy(self.heap, &test)? {
                    self.exec_block(body)
                } else {
                    self.exec_block(orelse)
                };
            }
            StmtKind::While { test, body, orelse } => {
                loop {
                    let cond = self.eval(test)?;
                    if !truthy(self.heap, &cond)? {
                        return self.exec_block(orelse);
                    }
                    self.budget.tick()?;
                    match self.exec_block(body)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => {
                let iterable = self.eval(iter)?;
                let items = self.loop_items(&iterable)?;
                self.loops.push(items);
                let result = self.run_for(target, body, orelse);
                self.loops.pop();
                return result;
            }
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Pass => {}
            StmtKind::Return(value) => {
                if self.call_depth == 0 {
                    return Err(Fault::new(
                        FaultKind::SyntaxError,
                        "'return' outside function",
                    ));
                }
                let value = match value {
                    Some(expr) => self.eval(expr)?,
                    None => Value::None,
                };
                return Ok(Flow::Return(value));
            }
            StmtKind::FuncDef(def) => {
                let func = self.make_function(def)?;
                self.store_name(&def.name, func)?;
            }
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => return self.exec_try(body, handlers, orelse, finalbody),
            StmtKind::Raise(exc) => return Err(self.raise(exc.as_ref())?),
            StmtKind::Assert(test, msg) => {
                let value = self.eval(test)?;
                if !truthy(self.heap, &value)? {
                    let message = match msg {
                        Some(expr) => {
                            let m = self.eval(expr)?;
                            to_str(self.heap, &m)?
                        }
                        None => String::new(),
                    };
                    return Err(Fault::new(FaultKind::AssertionError, message));
                }
            }
            StmtKind::Del(targets) => {
                for target in targets {
                    self.delete(target)?;
                }
            }
            StmtKind::Global(names) => {
                if let Some(frame) = self.frames.last_mut() {
                    frame.globals.extend(names.iter().cloned());
                }
            }
            StmtKind::Nonlocal(names) => match self.frames.last_mut() {
                Some(frame) => frame.nonlocals.extend(names.iter().cloned()),
                None => {
                    return Err(Fault::new(
                        FaultKind::SyntaxError,
                        "nonlocal declaration not allowed at module level",
                    ))
                }
            },
            StmtKind::Import { module, alias } => {
                let value = self.import_module(module)?;
                let name = alias.clone().unwrap_or_else(|| module.clone());
                self.store_name(&name, value)?;
            }
            StmtKind::ImportFrom { module, names } => {
                let value = self.import_module(module)?;
                for (name, alias) in names {
                    if name == "*" {
                        for attr in builtins::module_attrs(module) {
                            let v = self.get_attr(&value, attr)?;
                            self.store_name(attr, v)?;
                        }
                        continue;
                    }
                    let v = self.get_attr(&value, name).map_err(|_| {
                        Fault::new(
                            FaultKind::ImportError,
                            format!("cannot import name '{}' from '{}'", name, module),
                        )
                    })?;
                    self.store_name(alias.as_ref().unwrap_or(name), v)?;
                }
            }
        }
        Ok(Flow::Normal)
    }

    fn run_for(&mut self, target: &Expr, body: &[Stmt], orelse: &[Stmt]) -> Result<Flow, Fault> {
        loop {
            let next = self.loops.last_mut().and_then(LoopItems::next);
            let Some(item) = next else {
                return self.exec_block(orelse);
            };
            self.budget.tick()?;
            self.assign(target, item)?;
            match self.exec_block(body)? {
                Flow::Break => return Ok(Flow::Normal),
                Flow::Return(v) => return Ok(Flow::Return(v)),
                Flow::Normal | Flow::Continue => {}
            }
        }
    }

    pub(super) fn loop_items(&mut self, iterable: &Value) -> Result<LoopItems, Fault> {
        match iterable {
            Value::Range(range) => Ok(LoopItems::Range(*range, 0)),
            other => Ok(LoopItems::Items(self.iterate(other)?, 0)),
        }
    }

    fn exec_try(
        &mut self,
        body: &[Stmt],
        handlers: &[Handler],
        orelse: &[Stmt],
        finalbody: &[Stmt],
    ) -> Result<Flow, Fault> {
        let mut result = self.exec_block(body);
        if is_uncatchable(&result) {
            return result;
        }
        match result.as_ref().err().cloned() {
            Some(fault) => match self.find_handler(handlers, &fault) {
                Ok(Some(handler)) => {
                    result = self.run_handler(handler, fault);
                }
                Ok(None) => {}
                Err(err) => result = Err(err),
            },
            None if matches!(result, Ok(Flow::Normal)) => result = self.exec_block(orelse),
            None => {}
        }
        if is_uncatchable(&result) {
            return result;
        }
        if !finalbody.is_empty() {
            match self.exec_block(finalbody)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        result
    }

    fn find_handler<'h>(
        &mut self,
        handlers: &'h [Handler],
        fault: &Fault,
    ) -> Result<Option<&'h Handler>, Fault> {
        for handler in handlers {
            if self.handler_matches(handler, fault)? {
                return Ok(Some(handler));
            }
        }
        Ok(None)
    }

    fn run_handler(&mut self, handler: &Handler, fault: Fault) -> Result<Flow, Fault> {
        if let Some(name) = &handler.name {
            let exc = Value::Exception(Arc::new(ExcValue {
                kind: fault.kind,
                message: fault.message.clone(),
            }));
            self.store_name(name, exc)?;
        }
        self.handling.push(fault);
        let result = self.exec_block(&handler.body);
        self.handling.pop();
        result
    }

    fn handler_matches(&mut self, handler: &Handler, fault: &Fault) -> Result<bool, Fault> {
        let Some(kinds) = &handler.kinds else {
            return Ok(true);
        };
        let value = self.eval(kinds).map_err(|f| f.at_line(handler.line))?;
        let candidates = match &value {
            Value::Ref(id) => match self.heap.get(*id)? {
                Object::Tuple(items) => items.clone(),
                _ => vec![value.clone()],
            },
            _ => vec![value.clone()],
        };
        for candidate in candidates {
            match candidate {
                Value::ExcType(kind) => {
                    if fault.kind.caught_by(kind) {
                        return Ok(true);
                    }
                }
                other => {
                    return Err(Fault::type_error(format!(
                        "catching '{}' is not allowed; use an exception class",
                        type_name(self.heap, &other)
                    )))
                }
            }
        }
        Ok(false)
    }

    fn raise(&mut self, exc: Option<&Expr>) -> Result<Fault, Fault> {
        let Some(expr) = exc else {
            return Ok(self.handling.last().cloned().unwrap_or_else(|| {
                Fault::new(FaultKind::RuntimeError, "No active exception to reraise")
            }));
        };
        match self.eval(expr)? {
            Value::Exception(exc) => Ok(Fault::new(exc.kind, exc.message.clone())),
            Value::ExcType(kind) => Ok(Fault::new(kind, "")),
            _ => Ok(Fault::type_error("exceptions must derive from BaseException")),
        }
    }

    // ---- names ----

    fn is_protected(&self, name: &str) -> bool {
        self.frames.is_empty() && PROTECTED_NAMES.contains(&name) && self.globals.contains_key(name)
    }

    pub(super) fn load_name(&self, name: &str) -> Result<Value, Fault> {
        if let Some(frame) = self.frames.last() {
            if !frame.globals.contains(name) {
                let mut scope = Some(frame.locals);
                while let Some(id) = scope {
                    match self.heap.get(id)? {
                        Object::Namespace(ns) => {
                            if let Some(value) = ns.vars.get(name) {
                                return Ok(value.clone());
                            }
                            scope = ns.parent;
                        }
                        _ => break,
                    }
                }
            }
        }
        if let Some(value) = self.globals.get(name) {
            return Ok(value.clone());
        }
        builtins::lookup(name, self.caps).ok_or_else(|| Fault::name_error(name))
    }

    pub(super) fn store_name(&mut self, name: &str, value: Value) -> Result<(), Fault> {
        if self.is_protected(name) {
            return Err(Fault::type_error(format!(
                "'{}' is read-only and cannot be rebound",
                name
            )));
        }
        let Some(frame) = self.frames.last() else {
            self.globals.insert(name.to_string(), value);
            return Ok(());
        };
        if frame.globals.contains(name) {
            if PROTECTED_NAMES.contains(&name) && self.globals.contains_key(name) {
                return Err(Fault::type_error(format!(
                    "'{}' is read-only and cannot be rebound",
                    name
                )));
            }
            self.globals.insert(name.to_string(), value);
            return Ok(());
        }
        let target = if frame.nonlocals.contains(name) {
            self.find_enclosing(frame.locals, name)?
        } else {
            frame.locals
        };
        match self.heap.get_mut(target)? {
            Object::Namespace(ns) => {
                ns.vars.insert(name.to_string(), value);
                Ok(())
            }
            _ => Err(Fault::new(FaultKind::RuntimeError, "corrupt scope")),
        }
    }

    fn find_enclosing(&self, locals: ObjId, name: &str) -> Result<ObjId, Fault> {
        let mut scope = match self.heap.get(locals)? {
            Object::Namespace(ns) => ns.parent,
            _ => None,
        };
        while let Some(id) = scope {
            match self.heap.get(id)? {
                Object::Namespace(ns) if ns.vars.contains_key(name) => return Ok(id),
                Object::Namespace(ns) => scope = ns.parent,
                _ => break,
            }
        }
        Err(Fault::new(
            FaultKind::SyntaxError,
            format!("no binding for nonlocal '{}' found", name),
        ))
    }

    fn delete_name(&mut self, name: &str) -> Result<(), Fault> {
        if self.is_protected(name) {
            return Err(Fault::type_error(format!("'{}' is read-only", name)));
        }
        if let Some(frame) = self.frames.last() {
            if !frame.globals.contains(name) {
                let locals = frame.locals;
                if let Object::Namespace(ns) = self.heap.get_mut(locals)? {
                    if ns.vars.shift_remove(name).is_some() {
                        return Ok(());
                    }
                }
                return Err(Fault::name_error(name));
            }
        }
        self.globals
            .shift_remove(name)
            .map(|_| ())
            .ok_or_else(|| Fault::name_error(name))
    }

    // ---- assignment ----

    pub(super) fn assign(&mut self, target: &Expr, value: Value) -> Result<(), Fault> {
        match target {
            Expr::Name(name) => self.store_name(name, value),
            Expr::Subscript(obj, index) => {
                let container = self.eval(obj)?;
                if let Expr::Slice { lower, upper, step } = index.as_ref() {
                    let (lower, upper, step) = self.slice_bounds(lower, upper, step)?;
                    return self.set_slice(&container, lower, upper, step, value);
                }
                let key = self.eval(index)?;
                self.set_item(&container, key, value)
            }
            Expr::Attribute(obj, name) => {
                let obj = self.eval(obj)?;
                Err(Fault::new(
                    FaultKind::AttributeError,
                    format!(
                        "'{}' object attribute '{}' is read-only",
                        type_name(self.heap, &obj),
                        name
                    ),
                ))
            }
            Expr::Tuple(targets) | Expr::List(targets) => {
                let items = self.iterate(&value)?;
                self.unpack(targets, items)
            }
            Expr::Starred(_) => Err(Fault::new(
                FaultKind::SyntaxError,
                "starred assignment target must be in a list or tuple",
            )),
            _ => Err(Fault::new(FaultKind::SyntaxError, "cannot assign to expression")),
        }
    }

    fn unpack(&mut self, targets: &[Expr], items: Vec<Value>) -> Result<(), Fault> {
        let star = targets.iter().position(|t| matches!(t, Expr::Starred(_)));
        match star {
            None => {
                if items.len() != targets.len() {
                    return Err(Fault::value_error(if items.len() > targets.len() {
                        format!("too many values to unpack (expected {})", targets.len())
                    } else {
                        format!(
                            "not enough values to unpack (expected {}, got {})",
                            targets.len(),
                            items.len()
                        )
                    }));
                }
                for (target, item) in targets.iter().zip(items) {
                    self.assign(target, item)?;
                }
                Ok(())
            }
            Some(at) => {
                let after = targets.len() - at - 1;
                if items.len() < at + after {
                    return Err(Fault::value_error(format!(
                        "not enough values to unpack (expected at least {}, got {})",
                        at + after,
                        items.len()
                    )));
                }
                let mut items = items;
                let tail = items.split_off(items.len() - after);
                let middle = items.split_off(at);
                for (target, item) in targets[..at].iter().zip(items) {
                    self.assign(target, item)?;
                }
                if let Expr::Starred(inner) = &targets[at] {
                    let list = self.heap.new_list(middle)?;
                    self.assign(inner, list)?;
                }
                for (target, item) in targets[at + 1..].iter().zip(tail) {
                    self.assign(target, item)?;
                }
                Ok(())
            }
        }
    }

    fn aug_assign(&mut self, target: &Expr, op: BinOp, value: &Expr) -> Result<(), Fault> {
        match target {
            Expr::Name(name) => {
                let current = self.load_name(name)?;
                let rhs = self.eval(value)?;
                let result = self.inplace_op(op, current, rhs)?;
                self.store_name(name, result)
            }
            Expr::Subscript(obj, index) => {
                let container = self.eval(obj)?;
                let key = self.eval(index)?;
                let current = self.get_item(&container, &key)?;
                let rhs = self.eval(value)?;
                let result = self.inplace_op(op, current, rhs)?;
                self.set_item(&container, key, result)
            }
            _ => {
                let current = self.eval(target)?;
                let rhs = self.eval(value)?;
                let result = self.inplace_op(op, current, rhs)?;
                self.assign(target, result)
            }
        }
    }

    /// `+=` on a list extends it in place; everything else rebinds.
    fn inplace_op(&mut self, op: BinOp, current: Value, rhs: Value) -> Result<Value, Fault> {
        if op == BinOp::Add {
            if let Value::Ref(id) = current {
                if matches!(self.heap.get(id)?, Object::List(_)) {
                    let extra = self.iterate(&rhs)?;
                    let limit_check = match self.heap.get(id)? {
                        Object::List(items) => items.len() + extra.len(),
                        _ => 0,
                    };
                    self.heap.check_len(limit_check)?;
                    if let Object::List(items) = self.heap.get_mut(id)? {
                        items.extend(extra);
                    }
                    return Ok(current);
                }
            }
        }
        self.binary_op(op, &current, &rhs)
    }

    fn delete(&mut self, target: &Expr) -> Result<(), Fault> {
        match target {
            Expr::Name(name) => self.delete_name(name),
            Expr::Subscript(obj, index) => {
                let container = self.eval(obj)?;
                if let Expr::Slice { lower, upper, step } = index.as_ref() {
                    let (lower, upper, step) = self.slice_bounds(lower, upper, step)?;
                    let id = self.list_id(&container, "deletion")?;
                    let len = self.seq_len(id)?;
                    let mut indices = slice_indices(len, lower, upper, step)?;
                    indices.sort_unstable();
                    if let Object::List(items) = self.heap.get_mut(id)? {
                        for index in indices.into_iter().rev() {
                            items.remove(index);
                        }
                    }
                    return Ok(());
                }
                let key = self.eval(index)?;
                self.del_item(&container, &key)
            }
            _ => Err(Fault::new(FaultKind::SyntaxError, "cannot delete expression")),
        }
    }

    // ---- items and slices ----

    fn list_id(&self, value: &Value, what: &str) -> Result<ObjId, Fault> {
        match value {
            Value::Ref(id) if matches!(self.heap.get(*id)?, Object::List(_)) => Ok(*id),
            other => Err(Fault::type_error(format!(
                "'{}' object does not support item {}",
                type_name(self.heap, other),
                what
            ))),
        }
    }

    fn seq_len(&self, id: ObjId) -> Result<usize, Fault> {
        match self.heap.get(id)? {
            Object::List(items) | Object::Tuple(items) => Ok(items.len()),
            _ => Ok(0),
        }
    }

    pub(super) fn get_item(&mut self, container: &Value, key: &Value) -> Result<Value, Fault> {
        match container {
            Value::Str(s) => {
                let index = self.int_index(key)?;
                let len = s.chars().count();
                let at = norm_index(index, len)
                    .ok_or_else(|| Fault::index_error("string index out of range"))?;
                Ok(Value::str(
                    s.chars().nth(at).map(String::from).unwrap_or_default(),
                ))
            }
            Value::Range(range) => {
                let index = self.int_index(key)?;
                let at = norm_index(index, range.len())
                    .ok_or_else(|| Fault::index_error("range object index out of range"))?;
                Ok(Value::Int(range.get(at)))
            }
            Value::Ref(id) => match self.heap.get(*id)? {
                Object::List(items) | Object::Tuple(items) => {
                    let is_list = matches!(self.heap.get(*id)?, Object::List(_));
                    let index = self.int_index(key)?;
                    let at = norm_index(index, items.len()).ok_or_else(|| {
                        Fault::index_error(if is_list {
                            "list index out of range"
                        } else {
                            "tuple index out of range"
                        })
                    })?;
                    Ok(items[at].clone())
                }
                Object::Dict(dict) => {
                    let hash = hash_key(self.heap, key)?;
                    match dict.get(&hash) {
                        Some(value) => Ok(value.clone()),
                        None => Err(Fault::new(FaultKind::KeyError, repr(self.heap, key)?)),
                    }
                }
                other => Err(Fault::type_error(format!(
                    "'{}' object is not subscriptable",
                    other.type_name()
                ))),
            },
            other => Err(Fault::type_error(format!(
                "'{}' object is not subscriptable",
                type_name(self.heap, other)
            ))),
        }
    }

    fn int_index(&self, key: &Value) -> Result<i64, Fault> {
        match key {
            Value::Int(n) => Ok(*n),
            Value::Bool(b) => Ok(*b as i64),
            other => Err(Fault::type_error(format!(
                "indices must be integers or slices, not {}",
                type_name(self.heap, other)
            ))),
        }
    }

    fn set_item(&mut self, container: &Value, key: Value, value: Value) -> Result<(), Fault> {
        let Value::Ref(id) = container else {
            return Err(Fault::type_error(format!(
                "'{}' object does not support item assignment",
                type_name(self.heap, container)
            )));
        };
        let id = *id;
        match self.heap.get(id)? {
            Object::List(items) => {
                let index = self.int_index(&key)?;
                let at = norm_index(index, items.len())
                    .ok_or_else(|| Fault::index_error("list assignment index out of range"))?;
                if let Object::List(items) = self.heap.get_mut(id)? {
                    items[at] = value;
                }
                Ok(())
            }
            Object::Dict(dict) => {
                let hash = hash_key(self.heap, &key)?;
                if !dict.contains(&hash) {
                    self.heap.check_len(dict.len() + 1)?;
                }
                if let Object::Dict(dict) = self.heap.get_mut(id)? {
                    dict.insert(hash, key, value);
                }
                Ok(())
            }
            other => Err(Fault::type_error(format!(
                "'{}' object does not support item assignment",
                other.type_name()
            ))),
        }
    }

    fn del_item(&mut self, container: &Value, key: &Value) -> Result<(), Fault> {
        let Value::Ref(id) = container else {
            return Err(Fault::type_error(format!(
                "'{}' object does not support item deletion",
                type_name(self.heap, container)
            )));
        };
        let id = *id;
        match self.heap.get(id)? {
            Object::List(items) => {
                let index = self.int_index(key)?;
                let at = norm_index(index, items.len())
                    .ok_or_else(|| Fault::index_error("list assignment index out of range"))?;
                if let Object::List(items) = self.heap.get_mut(id)? {
                    items.remove(at);
                }
                Ok(())
            }
            Object::Dict(_) => {
                let hash = hash_key(self.heap, key)?;
                let removed = match self.heap.get_mut(id)? {
                    Object::Dict(dict) => dict.remove(&hash),
                    _ => None,
                };
                match removed {
                    Some(_) => Ok(()),
                    None => Err(Fault::new(FaultKind::KeyError, repr(self.heap, key)?)),
                }
            }
            other => Err(Fault::type_error(format!(
                "'{}' object does not support item deletion",
                other.type_name()
            ))),
        }
    }

    fn slice_bounds(
        &mut self,
        lower: &Option<Box<Expr>>,
        upper: &Option<Box<Expr>>,
        step: &Option<Box<Expr>>,
    ) -> Result<(Option<i64>, Option<i64>, i64), Fault> {
        let bound = |this: &mut Self, e: &Option<Box<Expr>>| -> Result<Option<i64>, Fault> {
            match e {
                None => Ok(None),
                Some(expr) => match this.eval(expr)? {
                    Value::None => Ok(None),
                    Value::Int(n) => Ok(Some(n)),
                    Value::Bool(b) => Ok(Some(b as i64)),
                    other => Err(Fault::type_error(format!(
                        "slice indices must be integers or None, not {}",
                        type_name(this.heap, &other)
                    ))),
                },
            }
        };
        let lower = bound(self, lower)?;
        let upper = bound(self, upper)?;
        let step = bound(self, step)?.unwrap_or(1);
        if step == 0 {
            return Err(Fault::value_error("slice step cannot be zero"));
        }
        Ok((lower, upper, step))
    }

    fn get_slice(
        &mut self,
        container: &Value,
        lower: Option<i64>,
        upper: Option<i64>,
        step: i64,
    ) -> Result<Value, Fault> {
        match container {
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let indices = slice_indices(chars.len(), lower, upper, step)?;
                Ok(Value::str(indices.into_iter().map(|i| chars[i]).collect::<String>()))
            }
            Value::Range(range) => {
                let indices = slice_indices(range.len(), lower, upper, step)?;
                let items = indices.into_iter().map(|i| Value::Int(range.get(i))).collect();
                self.heap.new_list(items)
            }
            Value::Ref(id) => match self.heap.get(*id)? {
                Object::List(items) => {
                    let indices = slice_indices(items.len(), lower, upper, step)?;
                    let out = indices.into_iter().map(|i| items[i].clone()).collect();
                    self.heap.new_list(out)
                }
                Object::Tuple(items) => {
                    let indices = slice_indices(items.len(), lower, upper, step)?;
                    let out = indices.into_iter().map(|i| items[i].clone()).collect();
                    self.heap.new_tuple(out)
                }
                other => Err(Fault::type_error(format!(
                    "'{}' object is not subscriptable",
                    other.type_name()
                ))),
            },
            other => Err(Fault::type_error(format!(
                "'{}' object is not subscriptable",
                type_name(self.heap, other)
            ))),
        }
    }

    fn set_slice(
        &mut self,
        container: &Value,
        lower: Option<i64>,
        upper: Option<i64>,
        step: i64,
        value: Value,
    ) -> Result<(), Fault> {
        let id = self.list_id(container, "assignment")?;
        let replacement = self.iterate(&value)?;
        let len = self.seq_len(id)?;
        let indices = slice_indices(len, lower, upper, step)?;
        if step == 1 {
            let start = indices
                .first()
                .copied()
                .unwrap_or_else(|| clamp_start(lower, len));
            let end = start + indices.len();
            self.heap
                .check_len(len - indices.len() + replacement.len())?;
            if let Object::List(items) = self.heap.get_mut(id)? {
                items.splice(start..end, replacement);
            }
            return Ok(());
        }
        if indices.len() != replacement.len() {
            return Err(Fault::value_error(format!(
                "attempt to assign sequence of size {} to extended slice of size {}",
                replacement.len(),
                indices.len()
            )));
        }
        if let Object::List(items) = self.heap.get_mut(id)? {
            for (index, item) in indices.into_iter().zip(replacement) {
                items[index] = item;
            }
        }
        Ok(())
    }

    // ---- iteration ----

    /// Materializes an iterable into its items.
    pub(super) fn iterate(&mut self, value: &Value) -> Result<Vec<Value>, Fault> {
        match value {
            Value::Str(s) => {
                self.budget.charge(s.len() as u64 / 16)?;
                Ok(s.chars().map(|c| Value::str(String::from(c))).collect())
            }
            Value::Range(range) => {
                let len = range.len();
                self.heap.check_len(len)?;
                self.budget.charge(len as u64 / 16)?;
                Ok((0..len).map(|i| Value::Int(range.get(i))).collect())
            }
            Value::Ref(id) => {
                let items: Vec<Value> = match self.heap.get(*id)? {
                    Object::List(items) | Object::Tuple(items) => items.clone(),
                    Object::Dict(dict) => dict.keys().cloned().collect(),
                    Object::Set(set) => set.values().cloned().collect(),
                    other => {
                        return Err(Fault::type_error(format!(
                            "'{}' object is not iterable",
                            other.type_name()
                        )))
                    }
                };
                self.budget.charge(items.len() as u64 / 16)?;
                Ok(items)
            }
            other => Err(Fault::type_error(format!(
                "'{}' object is not iterable",
                type_name(self.heap, other)
            ))),
        }
    }

    // ---- functions ----

    fn make_function(&mut self, def: &Arc<FuncDef>) -> Result<Value, Fault> {
        let mut defaults = Vec::new();
        for param in &def.params {
            if let Some(expr) = &param.default {
                defaults.push(self.eval(expr)?);
            }
        }
        let mut kwdefaults = Vec::new();
        for param in &def.kwonly {
            kwdefaults.push(match &param.default {
                Some(expr) => Some(self.eval(expr)?),
                None => None,
            });
        }
        let enclosing = self.frames.last().map(|f| f.locals);
        for frame in &mut self.frames {
            frame.captured = true;
        }
        self.heap.new_value(Object::Function(Function {
            def: def.clone(),
            defaults,
            kwdefaults,
            enclosing,
        }))
    }

    /// Calls any callable value.
    pub(super) fn call_value(
        &mut self,
        func: &Value,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, Fault> {
        match func {
            Value::Ref(id) => {
                let function = match self.heap.get(*id)? {
                    Object::Function(f) => f.clone(),
                    other => {
                        return Err(Fault::type_error(format!(
                            "'{}' object is not callable",
                            other.type_name()
                        )))
                    }
                };
                self.call_function(&function, args, kwargs)
            }
            Value::Builtin(name) => self.call_builtin(name, args, kwargs),
            Value::Method(method) => {
                let method = method.clone();
                self.call_method(&method.receiver, &method.name, args, kwargs)
            }
            Value::ExcType(kind) => {
                if !kwargs.is_empty() {
                    return Err(Fault::type_error(format!(
                        "{}() takes no keyword arguments",
                        kind.name()
                    )));
                }
                let message = match args.as_slice() {
                    [] => String::new(),
                    [single] if *kind == FaultKind::KeyError => repr(self.heap, single)?,
                    [single] => to_str(self.heap, single)?,
                    many => {
                        let tuple = self.heap.new_tuple(many.to_vec())?;
                        repr(self.heap, &tuple)?
                    }
                };
                Ok(Value::Exception(Arc::new(ExcValue {
                    kind: *kind,
                    message,
                })))
            }
            Value::Host(host) => self.call_host(*host, args, kwargs),
            other => Err(Fault::type_error(format!(
                "'{}' object is not callable",
                type_name(self.heap, other)
            ))),
        }
    }

    fn call_function(
        &mut self,
        func: &Function,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, Fault> {
        if self.call_depth >= self.max_call_depth {
            return Err(Fault::new(
                FaultKind::RecursionError,
                "maximum recursion depth exceeded",
            ));
        }
        self.budget.tick()?;
        let vars = self.bind_arguments(func, args, kwargs)?;
        let locals = self.heap.alloc(Object::Namespace(Namespace {
            vars,
            parent: func.enclosing,
        }))?;
        self.frames.push(Frame {
            locals,
            globals: HashSet::new(),
            nonlocals: HashSet::new(),
            captured: false,
        });
        self.call_depth += 1;
        let result = self.exec_block(&func.def.body);
        self.call_depth -= 1;
        if let Some(frame) = self.frames.pop() {
            if !frame.captured {
                self.heap.release(frame.locals);
            }
        }
        match result? {
            Flow::Return(value) => Ok(value),
            _ => Ok(Value::None),
        }
    }

    fn bind_arguments(
        &mut self,
        func: &Function,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<IndexMap<String, Value>, Fault> {
        let def = &func.def;
        let name = &def.name;
        let mut vars: IndexMap<String, Value> = IndexMap::new();
        let mut args = args.into_iter();

        for param in &def.params {
            match args.next() {
                Some(value) => {
                    vars.insert(param.name.clone(), value);
                }
                None => break,
            }
        }
        let extra: Vec<Value> = args.collect();
        match &def.vararg {
            Some(vararg) => {
                let tuple = self.heap.new_tuple(extra)?;
                vars.insert(vararg.clone(), tuple);
            }
            None if !extra.is_empty() => {
                return Err(Fault::type_error(format!(
                    "{}() takes {} positional arguments but {} were given",
                    name,
                    def.params.len(),
                    def.params.len() + extra.len()
                )))
            }
            None => {}
        }

        let mut extra_kw = Dict::new();
        for (key, value) in kwargs {
            let known = def.params.iter().chain(def.kwonly.iter()).any(|p| p.name == key);
            if known {
                if vars.contains_key(&key) {
                    return Err(Fault::type_error(format!(
                        "{}() got multiple values for argument '{}'",
                        name, key
                    )));
                }
                vars.insert(key, value);
            } else if def.kwarg.is_some() {
                let key: Arc<str> = Arc::from(key.as_str());
                extra_kw.insert(HashKey::Str(key.clone()), Value::Str(key), value);
            } else {
                return Err(Fault::type_error(format!(
                    "{}() got an unexpected keyword argument '{}'",
                    name, key
                )));
            }
        }

        let first_default = def.params.len() - func.defaults.len();
        let mut missing = Vec::new();
        for (i, param) in def.params.iter().enumerate() {
            if vars.contains_key(&param.name) {
                continue;
            }
            if i >= first_default {
                vars.insert(param.name.clone(), func.defaults[i - first_default].clone());
            } else {
                missing.push(format!("'{}'", param.name));
            }
        }
        for (param, default) in def.kwonly.iter().zip(&func.kwdefaults) {
            if vars.contains_key(&param.name) {
                continue;
            }
            match default {
                Some(value) => {
                    vars.insert(param.name.clone(), value.clone());
                }
                None => missing.push(format!("'{}'", param.name)),
            }
        }
        if !missing.is_empty() {
            return Err(Fault::type_error(format!(
                "{}() missing {} required argument{}: {}",
                name,
                missing.len(),
                if missing.len() == 1 { "" } else { "s" },
                missing.join(", ")
            )));
        }
        if let Some(kwarg) = &def.kwarg {
            let dict = self.heap.new_value(Object::Dict(extra_kw))?;
            vars.insert(kwarg.clone(), dict);
        }
        Ok(vars)
    }

    fn call_host(
        &mut self,
        host: HostFn,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, Fault> {
        if !kwargs.is_empty() || args.len() != 1 {
            return Err(Fault::type_error(format!(
                "{}() takes exactly one argument",
                host.name()
            )));
        }
        let arg = to_str(self.heap, &args[0])?;
        match host {
            HostFn::LlmQuery => self.query_model(&arg),
            HostFn::FinalVar => {
                let name = arg
                    .trim()
                    .trim_matches(|c| c == '"' || c == '\'')
                    .to_string();
                match self.globals.get(&name) {
                    Some(value) if !value.is_none() => {
                        let value = value.clone();
                        Ok(Value::str(to_str(self.heap, &value)?))
                    }
                    _ => Ok(Value::str(format!("Error: Variable '{}' not found", name))),
                }
            }
        }
    }

    /// Forwards a prompt to the secondary model with output redirected.
    fn query_model(&mut self, prompt: &str) -> Result<Value, Fault> {
        let Some(model) = self.model else {
            return Ok(Value::str("Error: Sub-LLM not available"));
        };
        tracing::debug!(prompt_len = prompt.len(), "Sandbox querying secondary model");
        let outcome = self.out.with_redirect(OutputTarget::Secondary, |router| {
            catch_unwind(AssertUnwindSafe(|| model.query(prompt, router)))
        });
        match outcome {
            Ok(Ok(answer)) => {
                self.heap.check_str_len(answer.len())?;
                Ok(Value::str(answer))
            }
            Ok(Err(err)) => Err(Fault::new(FaultKind::ModelError, err.to_string())),
            Err(_) => Err(Fault::new(FaultKind::ModelError, "model client panicked")),
        }
    }

    fn import_module(&mut self, module: &str) -> Result<Value, Fault> {
        let known = builtins::module_value(module);
        match known {
            Some(value) if self.caps.contains(Capability::Modules) => Ok(value),
            _ => Err(Fault::new(
                FaultKind::ImportError,
                format!("module '{}' is not available in the sandbox", module),
            )),
        }
    }

    // ---- expressions ----

    pub(super) fn eval(&mut self, expr: &Expr) -> Result<Value, Fault> {
        match expr {
            Expr::Const(c) => Ok(match c {
                Const::None => Value::None,
                Const::Bool(b) => Value::Bool(*b),
                Const::Int(n) => Value::Int(*n),
                Const::Float(f) => Value::Float(*f),
                Const::Str(s) => Value::Str(s.clone()),
            }),
            Expr::Name(name) => self.load_name(name),
            Expr::List(items) => {
                let values = self.eval_items(items)?;
                self.heap.new_list(values)
            }
            Expr::Tuple(items) => {
                let values = self.eval_items(items)?;
                self.heap.new_tuple(values)
            }
            Expr::Set(items) => {
                let values = self.eval_items(items)?;
                let mut set = Set::new();
                for value in values {
                    let key = hash_key(self.heap, &value)?;
                    set.insert(key, value);
                }
                self.heap.new_value(Object::Set(set))
            }
            Expr::Dict(items) => {
                let mut dict = Dict::new();
                for (key, value) in items {
                    match key {
                        Some(key) => {
                            let key = self.eval(key)?;
                            let value = self.eval(value)?;
                            let hash = hash_key(self.heap, &key)?;
                            dict.insert(hash, key, value);
                        }
                        None => {
                            let mapping = self.eval(value)?;
                            for (k, v) in self.dict_items(&mapping)? {
                                let hash = hash_key(self.heap, &k)?;
                                dict.insert(hash, k, v);
                            }
                        }
                    }
                }
                self.heap.check_len(dict.len())?;
                self.heap.new_value(Object::Dict(dict))
            }
            Expr::FString(parts) => Ok(Value::str(self.eval_fstring(parts)?)),
            Expr::Starred(_) => Err(Fault::new(
                FaultKind::SyntaxError,
                "can't use starred expression here",
            )),
            Expr::Unary(op, operand) => {
                let value = self.eval(operand)?;
                self.unary_op(*op, &value)
            }
            Expr::Binary(op, left, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                self.binary_op(*op, &left, &right)
            }
            Expr::And(left, right) => {
                let left = self.eval(left)?;
                if !truthy(self.heap, &left)? {
                    return Ok(left);
                }
                self.eval(right)
            }
            Expr::Or(left, right) => {
                let left = self.eval(left)?;
                if truthy(self.heap, &left)? {
                    return Ok(left);
                }
                self.eval(right)
            }
            Expr::Compare(first, rest) => {
                let mut left = self.eval(first)?;
                for (op, right) in rest {
                    let right = self.eval(right)?;
                    if !self.compare_op(*op, &left, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }
            Expr::IfExp { test, body, orelse } => {
                let test = self.eval(test)?;
                if truthy(self.heap, &test)? {
                    self.eval(body)
                } else {
                    self.eval(orelse)
                }
            }
            Expr::Call { func, args } => self.eval_call(func, args),
            Expr::Attribute(obj, name) => {
                let obj = self.eval(obj)?;
                self.get_attr(&obj, name)
            }
            Expr::Subscript(obj, index) => {
                let container = self.eval(obj)?;
                if let Expr::Slice { lower, upper, step } = index.as_ref() {
                    let (lower, upper, step) = self.slice_bounds(lower, upper, step)?;
                    return self.get_slice(&container, lower, upper, step);
                }
                let key = self.eval(index)?;
                self.get_item(&container, &key)
            }
            Expr::Slice { .. } => Err(Fault::new(
                FaultKind::SyntaxError,
                "slices are only valid inside subscripts",
            )),
            Expr::Lambda(def) => self.make_function(def),
            Expr::Comp {
                kind,
                elt,
                value,
                clauses,
            } => self.eval_comprehension(*kind, elt, value.as_deref(), clauses),
            Expr::NamedExpr(name, value) => {
                let value = self.eval(value)?;
                self.store_name(name, value.clone())?;
                Ok(value)
            }
        }
    }

    fn eval_items(&mut self, items: &[Expr]) -> Result<Vec<Value>, Fault> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            if let Expr::Starred(inner) = item {
                let value = self.eval(inner)?;
                out.extend(self.iterate(&value)?);
            } else {
                out.push(self.eval(item)?);
            }
        }
        Ok(out)
    }

    /// Key-value pairs of a dict, for `**` unpacking.
    pub(super) fn dict_items(&self, mapping: &Value) -> Result<Vec<(Value, Value)>, Fault> {
        if let Value::Ref(id) = mapping {
            if let Object::Dict(dict) = self.heap.get(*id)? {
                return Ok(dict
                    .items()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect());
            }
        }
        Err(Fault::type_error(format!(
            "'{}' object is not a mapping",
            type_name(self.heap, mapping)
        )))
    }

    fn eval_call(&mut self, func: &Expr, args: &[Arg]) -> Result<Value, Fault> {
        // Method calls skip materializing a bound method.
        let callee = match func {
            Expr::Attribute(obj, name) => {
                let receiver = self.eval(obj)?;
                match receiver {
                    Value::Module(_) => Callee::Value(self.get_attr(&receiver, name)?),
                    receiver => Callee::Method(receiver, name.as_str()),
                }
            }
            other => Callee::Value(self.eval(other)?),
        };

        let mut positional = Vec::new();
        let mut keywords: Vec<(String, Value)> = Vec::new();
        for arg in args {
            match arg {
                Arg::Pos(expr) => positional.push(self.eval(expr)?),
                Arg::Star(expr) => {
                    let value = self.eval(expr)?;
                    positional.extend(self.iterate(&value)?);
                }
                Arg::Kw(name, expr) => {
                    let value = self.eval(expr)?;
                    push_keyword(&mut keywords, name.clone(), value)?;
                }
                Arg::DoubleStar(expr) => {
                    let mapping = self.eval(expr)?;
                    for (key, value) in self.dict_items(&mapping)? {
                        let Value::Str(key) = key else {
                            return Err(Fault::type_error("keywords must be strings"));
                        };
                        push_keyword(&mut keywords, key.to_string(), value)?;
                    }
                }
            }
        }

        match callee {
            Callee::Value(value) => self.call_value(&value, positional, keywords),
            Callee::Method(receiver, name) => {
                self.call_method(&receiver, name, positional, keywords)
            }
        }
    }

    fn eval_fstring(&mut self, parts: &[FPart]) -> Result<String, Fault> {
        let mut out = String::new();
        for part in parts {
            match part {
                FPart::Lit(text) => out.push_str(text),
                FPart::Expr {
                    expr,
                    conversion,
                    spec,
                } => {
                    let value = self.eval(expr)?;
                    let value = match conversion {
                        Some('r') => Value::str(repr(self.heap, &value)?),
                        Some(_) => Value::str(to_str(self.heap, &value)?),
                        None => value,
                    };
                    let spec = self.eval_fstring(spec)?;
                    out.push_str(&builtins::format_value(self.heap, &value, &spec)?);
                }
            }
            self.heap.check_str_len(out.len())?;
        }
        Ok(out)
    }

    fn eval_comprehension(
        &mut self,
        kind: CompKind,
        elt: &Expr,
        value: Option<&Expr>,
        clauses: &[CompClause],
    ) -> Result<Value, Fault> {
        // The first iterable is evaluated in the enclosing scope.
        let first_iter = match clauses.first() {
            Some(clause) => self.eval(&clause.iter)?,
            None => return Err(Fault::new(FaultKind::SyntaxError, "empty comprehension")),
        };
        let parent = self.frames.last().map(|f| f.locals);
        let locals = self.heap.alloc(Object::Namespace(Namespace {
            vars: IndexMap::new(),
            parent,
        }))?;
        let inherited = self
            .frames
            .last()
            .map(|f| f.globals.clone())
            .unwrap_or_default();
        self.frames.push(Frame {
            locals,
            globals: inherited,
            nonlocals: HashSet::new(),
            captured: false,
        });
        let mut acc = CompAcc::new(kind);
        let result = self.comp_clause(clauses, 0, Some(first_iter), elt, value, &mut acc);
        if let Some(frame) = self.frames.pop() {
            if !frame.captured {
                self.heap.release(frame.locals);
            }
        }
        result?;
        match acc {
            CompAcc::List(items) => self.heap.new_list(items),
            CompAcc::Set(set) => self.heap.new_value(Object::Set(set)),
            CompAcc::Dict(dict) => self.heap.new_value(Object::Dict(dict)),
        }
    }

    fn comp_clause(
        &mut self,
        clauses: &[CompClause],
        index: usize,
        iterable: Option<Value>,
        elt: &Expr,
        value: Option<&Expr>,
        acc: &mut CompAcc,
    ) -> Result<(), Fault> {
        let Some(clause) = clauses.get(index) else {
            return self.comp_emit(elt, value, acc);
        };
        let iterable = match iterable {
            Some(v) => v,
            None => self.eval(&clause.iter)?,
        };
        let items = self.loop_items(&iterable)?;
        self.loops.push(items);
        let result = self.comp_loop(clauses, index, elt, value, acc);
        self.loops.pop();
        result
    }

    fn comp_loop(
        &mut self,
        clauses: &[CompClause],
        index: usize,
        elt: &Expr,
        value: Option<&Expr>,
        acc: &mut CompAcc,
    ) -> Result<(), Fault> {
        let clause = &clauses[index];
        'items: loop {
            let next = self.loops.last_mut().and_then(LoopItems::next);
            let Some(item) = next else {
                return Ok(());
            };
            self.budget.tick()?;
            self.assign(&clause.target, item)?;
            for cond in &clause.conds {
                let test = self.eval(cond)?;
                if !truthy(self.heap, &test)? {
                    continue 'items;
                }
            }
            self.comp_clause(clauses, index + 1, None, elt, value, acc)?;
        }
    }

    fn comp_emit(
        &mut self,
        elt: &Expr,
        value: Option<&Expr>,
        acc: &mut CompAcc,
    ) -> Result<(), Fault> {
        let item = self.eval(elt)?;
        match acc {
            CompAcc::List(items) => {
                self.heap.check_len(items.len() + 1)?;
                items.push(item);
            }
            CompAcc::Set(set) => {
                let key = hash_key(self.heap, &item)?;
                set.insert(key, item);
                self.heap.check_len(set.len())?;
            }
            CompAcc::Dict(dict) => {
                let v = match value {
                    Some(expr) => self.eval(expr)?,
                    None => Value::None,
                };
                let key = hash_key(self.heap, &item)?;
                dict.insert(key, item, v);
                self.heap.check_len(dict.len())?;
            }
        }
        Ok(())
    }

    // ---- operators ----

    fn unary_op(&mut self, op: UnaryOp, value: &Value) -> Result<Value, Fault> {
        match op {
            UnaryOp::Not => Ok(Value::Bool(!truthy(self.heap, value)?)),
            UnaryOp::Neg => match as_num(value) {
                Some(Num::Int(n)) => n.checked_neg().map(Value::Int).ok_or_else(Fault::overflow),
                Some(Num::Float(f)) => Ok(Value::Float(-f)),
                None => Err(self.bad_unary("-", value)),
            },
            UnaryOp::Pos => match as_num(value) {
                Some(Num::Int(n)) => Ok(Value::Int(n)),
                Some(Num::Float(f)) => Ok(Value::Float(f)),
                None => Err(self.bad_unary("+", value)),
            },
            UnaryOp::Invert => match value {
                Value::Int(n) => Ok(Value::Int(!n)),
                Value::Bool(b) => Ok(Value::Int(!(*b as i64))),
                _ => Err(self.bad_unary("~", value)),
            },
        }
    }

    fn bad_unary(&self, op: &str, value: &Value) -> Fault {
        Fault::type_error(format!(
            "bad operand type for unary {}: '{}'",
            op,
            type_name(self.heap, value)
        ))
    }

    pub(super) fn binary_op(&mut self, op: BinOp, left: &Value, right: &Value) -> Result<Value, Fault> {
        if let (Some(a), Some(b)) = (as_num(left), as_num(right)) {
            return numeric_op(op, a, b);
        }
        match (op, left, right) {
            (BinOp::Add, Value::Str(a), Value::Str(b)) => {
                self.heap.check_str_len(a.len() + b.len())?;
                let mut s = String::with_capacity(a.len() + b.len());
                s.push_str(a);
                s.push_str(b);
                return Ok(Value::str(s));
            }
            (BinOp::Mul, Value::Str(s), count) | (BinOp::Mul, count, Value::Str(s))
                if as_int(count).is_some() =>
            {
                let n = as_int(count).unwrap_or(0).max(0) as usize;
                self.heap.check_str_len(s.len().saturating_mul(n))?;
                self.budget.charge((s.len() * n) as u64 / 64)?;
                return Ok(Value::str(s.repeat(n)));
            }
            (BinOp::Mod, Value::Str(fmt), args) => {
                let args = args.clone();
                return Ok(Value::str(builtins::percent_format(self.heap, fmt, &args)?));
            }
            _ => {}
        }

        if let (Value::Ref(a), Value::Ref(b)) = (left, right) {
            let (a, b) = (*a, *b);
            let pair = (self.heap.get(a)?, self.heap.get(b)?);
            match (op, pair) {
                (BinOp::Add, (Object::List(x), Object::List(y))) => {
                    let items: Vec<Value> = x.iter().chain(y.iter()).cloned().collect();
                    return self.heap.new_list(items);
                }
                (BinOp::Add, (Object::Tuple(x), Object::Tuple(y))) => {
                    let items: Vec<Value> = x.iter().chain(y.iter()).cloned().collect();
                    return self.heap.new_tuple(items);
                }
                (BinOp::BitOr, (Object::Dict(x), Object::Dict(y))) => {
                    let mut merged = x.clone();
                    for (k, v) in y.items() {
                        let hash = hash_key(self.heap, k)?;
                        merged.insert(hash, k.clone(), v.clone());
                    }
                    return self.heap.new_value(Object::Dict(merged));
                }
                (
                    BinOp::BitOr | BinOp::BitAnd | BinOp::Sub | BinOp::BitXor,
                    (Object::Set(x), Object::Set(y)),
                ) => {
                    let result = set_op(op, x, y);
                    return self.heap.new_value(Object::Set(result));
                }
                _ => {}
            }
        }

        if op == BinOp::Mul {
            let (seq, count) = match (left, right) {
                (Value::Ref(id), n) if as_int(n).is_some() => (Some(*id), as_int(n)),
                (n, Value::Ref(id)) if as_int(n).is_some() => (Some(*id), as_int(n)),
                _ => (None, None),
            };
            if let (Some(id), Some(n)) = (seq, count) {
                let n = n.max(0) as usize;
                let (items, is_list) = match self.heap.get(id)? {
                    Object::List(items) => (items.clone(), true),
                    Object::Tuple(items) => (items.clone(), false),
                    _ => return Err(self.bad_binary(op, left, right)),
                };
                self.heap.check_len(items.len().saturating_mul(n))?;
                self.budget.charge((items.len() * n) as u64 / 16)?;
                let mut out = Vec::with_capacity(items.len() * n);
                for _ in 0..n {
                    out.extend(items.iter().cloned());
                }
                return if is_list {
                    self.heap.new_list(out)
                } else {
                    self.heap.new_tuple(out)
                };
            }
        }

        Err(self.bad_binary(op, left, right))
    }

    fn bad_binary(&self, op: BinOp, left: &Value, right: &Value) -> Fault {
        Fault::type_error(format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            op.symbol(),
            type_name(self.heap, left),
            type_name(self.heap, right)
        ))
    }

    fn compare_op(&mut self, op: CmpOp, left: &Value, right: &Value) -> Result<bool, Fault> {
        let heap = &*self.heap;
        Ok(match op {
            CmpOp::Eq => values_eq(heap, left, right)?,
            CmpOp::NotEq => !values_eq(heap, left, right)?,
            CmpOp::Lt => compare(heap, left, right)?.is_lt(),
            CmpOp::LtE => compare(heap, left, right)?.is_le(),
            CmpOp::Gt => compare(heap, left, right)?.is_gt(),
            CmpOp::GtE => compare(heap, left, right)?.is_ge(),
            CmpOp::In => self.contains(right, left)?,
            CmpOp::NotIn => !self.contains(right, left)?,
            CmpOp::Is => identical(left, right),
            CmpOp::IsNot => !identical(left, right),
        })
    }

    pub(super) fn contains(&self, container: &Value, item: &Value) -> Result<bool, Fault> {
        match container {
            Value::Str(haystack) => match item {
                Value::Str(needle) => Ok(haystack.contains(needle.as_ref())),
                other => Err(Fault::type_error(format!(
                    "'in <string>' requires string as left operand, not {}",
                    type_name(self.heap, other)
                ))),
            },
            Value::Range(range) => Ok(match item {
                Value::Int(n) => range.contains(*n),
                Value::Bool(b) => range.contains(*b as i64),
                Value::Float(f) if f.fract() == 0.0 => range.contains(*f as i64),
                _ => false,
            }),
            Value::Ref(id) => match self.heap.get(*id)? {
                Object::List(items) | Object::Tuple(items) => {
                    for candidate in items {
                        if values_eq(self.heap, candidate, item)? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                Object::Dict(dict) => Ok(dict.contains(&hash_key(self.heap, item)?)),
                Object::Set(set) => Ok(set.contains(&hash_key(self.heap, item)?)),
                other => Err(Fault::type_error(format!(
                    "argument of type '{}' is not iterable",
                    other.type_name()
                ))),
            },
            other => Err(Fault::type_error(format!(
                "argument of type '{}' is not iterable",
                type_name(self.heap, other)
            ))),
        }
    }
}

enum Callee<'e> {
    Value(Value),
    Method(Value, &'e str),
}

enum CompAcc {
    List(Vec<Value>),
    Set(Set),
    Dict(Dict),
}

impl CompAcc {
    fn new(kind: CompKind) -> Self {
        match kind {
            CompKind::List | CompKind::Gen => CompAcc::List(Vec::new()),
            CompKind::Set => CompAcc::Set(Set::new()),
            CompKind::Dict => CompAcc::Dict(Dict::new()),
        }
    }
}

fn push_keyword(keywords: &mut Vec<(String, Value)>, name: String, value: Value) -> Result<(), Fault> {
    if keywords.iter().any(|(k, _)| *k == name) {
        return Err(Fault::type_error(format!(
            "got multiple values for keyword argument '{}'",
            name
        )));
    }
    keywords.push((name, value));
    Ok(())
}

fn is_uncatchable(result: &Result<Flow, Fault>) -> bool {
    matches!(result, Err(fault) if !fault.kind.is_catchable())
}

fn identical(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::None, Value::None) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Str(a), Value::Str(b)) => Arc::ptr_eq(a, b) || a == b,
        (Value::Ref(a), Value::Ref(b)) => a == b,
        (Value::Builtin(a), Value::Builtin(b)) => a == b,
        (Value::Module(a), Value::Module(b)) => a == b,
        (Value::ExcType(a), Value::ExcType(b)) => a == b,
        (Value::Host(a), Value::Host(b)) => a == b,
        (Value::Exception(a), Value::Exception(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

pub(super) fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Int(n) => Some(*n),
        Value::Bool(b) => Some(*b as i64),
        _ => None,
    }
}

fn set_op(op: BinOp, x: &Set, y: &Set) -> Set {
    let mut out = Set::new();
    match op {
        BinOp::BitOr => {
            for (k, v) in x.iter().chain(y.iter()) {
                out.insert(k.clone(), v.clone());
            }
        }
        BinOp::BitAnd => {
            for (k, v) in x.iter().filter(|(k, _)| y.contains(k)) {
                out.insert(k.clone(), v.clone());
            }
        }
        BinOp::Sub => {
            for (k, v) in x.iter().filter(|(k, _)| !y.contains(k)) {
                out.insert(k.clone(), v.clone());
            }
        }
        _ => {
            for (k, v) in x.iter().filter(|(k, _)| !y.contains(k)) {
                out.insert(k.clone(), v.clone());
            }
            for (k, v) in y.iter().filter(|(k, _)| !x.contains(k)) {
                out.insert(k.clone(), v.clone());
            }
        }
    }
    out
}

/// Integer and float arithmetic with checked integer overflow.
pub(super) fn numeric_op(op: BinOp, a: Num, b: Num) -> Result<Value, Fault> {
    if let (Num::Int(x), Num::Int(y)) = (a, b) {
        return int_op(op, x, y);
    }
    let (x, y) = (a.as_f64(), b.as_f64());
    let result = match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div => {
            if y == 0.0 {
                return Err(Fault::zero_division("float division by zero"));
            }
            x / y
        }
        BinOp::FloorDiv => {
            if y == 0.0 {
                return Err(Fault::zero_division("float floor division by zero"));
            }
            (x / y).floor()
        }
        BinOp::Mod => {
            if y == 0.0 {
                return Err(Fault::zero_division("float modulo"));
            }
            let r = x % y;
            if r != 0.0 && (r < 0.0) != (y < 0.0) {
                r + y
            } else {
                r
            }
        }
        BinOp::Pow => {
            if x < 0.0 && y.fract() != 0.0 {
                return Err(Fault::value_error(
                    "negative number cannot be raised to a fractional power",
                ));
            }
            if x == 0.0 && y < 0.0 {
                return Err(Fault::zero_division(
                    "0.0 cannot be raised to a negative power",
                ));
            }
            x.powf(y)
        }
        _ => {
            return Err(Fault::type_error(format!(
                "unsupported operand type(s) for {}: 'float'",
                op.symbol()
            )))
        }
    };
    if result.is_infinite() && x.is_finite() && y.is_finite() {
        return Err(Fault::new(
            FaultKind::OverflowError,
            "numerical result out of range",
        ));
    }
    Ok(Value::Float(result))
}

fn int_op(op: BinOp, x: i64, y: i64) -> Result<Value, Fault> {
    let checked = |r: Option<i64>| r.map(Value::Int).ok_or_else(Fault::overflow);
    match op {
        BinOp::Add => checked(x.checked_add(y)),
        BinOp::Sub => checked(x.checked_sub(y)),
        BinOp::Mul => checked(x.checked_mul(y)),
        BinOp::Div => {
            if y == 0 {
                return Err(Fault::zero_division("division by zero"));
            }
            Ok(Value::Float(x as f64 / y as f64))
        }
        BinOp::FloorDiv => {
            if y == 0 {
                return Err(Fault::zero_division("integer division or modulo by zero"));
            }
            let q = x.checked_div(y).ok_or_else(Fault::overflow)?;
            if (x % y != 0) && ((x < 0) != (y < 0)) {
                Ok(Value::Int(q - 1))
            } else {
                Ok(Value::Int(q))
            }
        }
        BinOp::Mod => {
            if y == 0 {
                return Err(Fault::zero_division("integer division or modulo by zero"));
            }
            let r = x.checked_rem(y).unwrap_or(0);
            if r != 0 && ((r < 0) != (y < 0)) {
                Ok(Value::Int(r + y))
            } else {
                Ok(Value::Int(r))
            }
        }
        BinOp::Pow => {
            if y < 0 {
                if x == 0 {
                    return Err(Fault::zero_division(
                        "0.0 cannot be raised to a negative power",
                    ));
                }
                return Ok(Value::Float((x as f64).powf(y as f64)));
            }
            let exp = u32::try_from(y).map_err(|_| Fault::overflow())?;
            checked(x.checked_pow(exp))
        }
        BinOp::BitAnd => Ok(Value::Int(x & y)),
        BinOp::BitOr => Ok(Value::Int(x | y)),
        BinOp::BitXor => Ok(Value::Int(x ^ y)),
        BinOp::LShift => {
            if y < 0 {
                return Err(Fault::value_error("negative shift count"));
            }
            if x == 0 {
                return Ok(Value::Int(0));
            }
            if y >= 63 {
                return Err(Fault::overflow());
            }
            let shifted = x << y;
            if shifted >> y != x {
                return Err(Fault::overflow());
            }
            Ok(Value::Int(shifted))
        }
        BinOp::RShift => {
            if y < 0 {
                return Err(Fault::value_error("negative shift count"));
            }
            Ok(Value::Int(x >> y.min(63)))
        }
    }
}

/// Resolves a possibly negative index against a length.
pub(super) fn norm_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let at = if index < 0 { index + len } else { index };
    if (0..len).contains(&at) {
        Some(at as usize)
    } else {
        None
    }
}

fn clamp_start(lower: Option<i64>, len: usize) -> usize {
    let len = len as i64;
    match lower {
        None => 0,
        Some(n) if n < 0 => (n + len).max(0) as usize,
        Some(n) => n.min(len) as usize,
    }
}

/// Indices selected by `[lower:upper:step]` on a sequence of `len` items.
pub(super) fn slice_indices(
    len: usize,
    lower: Option<i64>,
    upper: Option<i64>,
    step: i64,
) -> Result<Vec<usize>, Fault> {
    if step == 0 {
        return Err(Fault::value_error("slice step cannot be zero"));
    }
    let n = len as i64;
    let adjust = |v: i64, lo: i64, hi: i64| -> i64 {
        let v = if v < 0 { v + n } else { v };
        v.clamp(lo, hi)
    };
    let mut out = Vec::new();
    if step > 0 {
        let start = lower.map(|v| adjust(v, 0, n)).unwrap_or(0);
        let stop = upper.map(|v| adjust(v, 0, n)).unwrap_or(n);
        let mut i = start;
        while i < stop {
            out.push(i as usize);
            i += step;
        }
    } else {
        let start = lower.map(|v| adjust(v, -1, n - 1)).unwrap_or(n - 1);
        let stop = upper.map(|v| adjust(v, -1, n - 1)).unwrap_or(-1);
        let mut i = start;
        while i > stop {
            out.push(i as usize);
            i += step;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::parser::{parse_expression, parse_module};

    struct Harness {
        heap: Heap,
        globals: IndexMap<String, Value>,
        caps: CapabilitySet,
        out: OutputRouter,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                heap: Heap::new(HeapLimits::default()),
                globals: IndexMap::new(),
                caps: CapabilitySet::all(),
                out: OutputRouter::new(),
            }
        }

        fn limits() -> RunLimits {
            RunLimits {
                max_steps: 100_000,
                wall_clock: Duration::from_secs(5),
                max_call_depth: 32,
                max_output_bytes: 10_000,
                cancel: None,
            }
        }

        fn run(&mut self, src: &str) -> Result<(), Fault> {
            let body = parse_module(src)?;
            let mut interp = Interpreter::new(
                &mut self.heap,
                &mut self.globals,
                &self.caps,
                &mut self.out,
                None,
                Self::limits(),
            );
            interp.run(&body)
        }

        fn eval(&mut self, src: &str) -> String {
            let expr = parse_expression(src).unwrap();
            let value = {
                let mut interp = Interpreter::new(
                    &mut self.heap,
                    &mut self.globals,
                    &self.caps,
                    &mut self.out,
                    None,
                    Self::limits(),
                );
                interp.eval_expr(&expr).unwrap()
            };
            repr(&self.heap, &value).unwrap()
        }
    }

    #[test]
    fn arithmetic_follows_floor_semantics() {
        let mut h = Harness::new();
        assert_eq!(h.eval("-7 // 2"), "-4");
        assert_eq!(h.eval("-7 % 3"), "2");
        assert_eq!(h.eval("7 / 2"), "3.5");
        assert_eq!(h.eval("2 ** 10"), "1024");
        assert_eq!(h.eval("-2 ** 2"), "-4");
        assert_eq!(h.eval("1 + 2 * 3 - 4"), "3");
    }

    #[test]
    fn integer_overflow_is_a_fault() {
        let mut h = Harness::new();
        let err = h.run("x = 9223372036854775807 + 1").unwrap_err();
        assert_eq!(err.kind, FaultKind::OverflowError);
        assert_eq!(err.line, Some(1));
    }

    #[test]
    fn functions_closures_and_defaults() {
        let mut h = Harness::new();
        h.run(
            "def make_adder(n):\n    def add(x, y=0):\n        return x + n + y\n    return add\nadd5 = make_adder(5)\nr = add5(1, y=2)\n",
        )
        .unwrap();
        assert_eq!(h.eval("r"), "8");
        assert_eq!(h.eval("(lambda a, *rest: len(rest))(1, 2, 3)"), "2");
    }

    #[test]
    fn recursion_depth_is_bounded() {
        let mut h = Harness::new();
        let err = h.run("def f(n):\n    return f(n + 1)\nf(0)\n").unwrap_err();
        assert_eq!(err.kind, FaultKind::RecursionError);
    }

    #[test]
    fn infinite_loop_hits_the_step_budget() {
        let mut h = Harness::new();
        let err = h.run("while True:\n    pass\n").unwrap_err();
        assert_eq!(err.kind, FaultKind::StepLimitExceeded);
    }

    #[test]
    fn cancel_flag_stops_a_running_loop() {
        let flag = Arc::new(AtomicBool::new(true));
        let mut budget =
            Budget::new(u64::MAX, Duration::from_secs(60)).with_cancel(Some(flag));
        let err = (0..CLOCK_INTERVAL).try_for_each(|_| budget.tick()).unwrap_err();
        assert_eq!(err.kind, FaultKind::Timeout);
        assert!(err.message.contains("cancelled"));

        let mut budget = Budget::new(u64::MAX, Duration::from_secs(60))
            .with_cancel(Some(Arc::new(AtomicBool::new(false))));
        assert!((0..CLOCK_INTERVAL * 4).try_for_each(|_| budget.tick()).is_ok());
    }

    #[test]
    fn range_aggregates_do_not_materialize() {
        let mut h = Harness::new();
        assert_eq!(h.eval("sum(range(10**9))"), "499999999500000000");
        assert_eq!(h.eval("sum(range(10, 0, -3), 5)"), "27");
        assert_eq!(h.eval("max(range(10**12))"), "999999999999");
        assert_eq!(h.eval("min(range(10**12, 0, -7))"), "1");
        assert_eq!(h.eval("max(range(0), default=-1)"), "-1");
        assert_eq!(h.eval("any(range(10**12))"), "True");
        assert_eq!(h.eval("all(range(10**12))"), "False");
        assert_eq!(h.eval("max(range(5), key=lambda i: -i)"), "0");

        let err = h.run("sum(range(10**12))\n").unwrap_err();
        assert_eq!(err.kind, FaultKind::OverflowError);
        let err = h.run("min(range(3, 3))\n").unwrap_err();
        assert_eq!(err.kind, FaultKind::ValueError);
    }

    #[test]
    fn budget_faults_cannot_be_caught() {
        let mut h = Harness::new();
        let err = h
            .run("try:\n    while True:\n        pass\nexcept Exception:\n    caught = True\n")
            .unwrap_err();
        assert_eq!(err.kind, FaultKind::StepLimitExceeded);
        assert!(!h.globals.contains_key("caught"));
    }

    #[test]
    fn try_except_else_finally() {
        let mut h = Harness::new();
        h.run(
            "log = []\ntry:\n    {}['missing']\nexcept KeyError as e:\n    log.append('caught ' + str(e))\nelse:\n    log.append('else')\nfinally:\n    log.append('finally')\n",
        )
        .unwrap();
        assert_eq!(h.eval("log"), "[\"caught 'missing'\", 'finally']");
    }

    #[test]
    fn comprehensions_do_not_leak_variables() {
        let mut h = Harness::new();
        h.run("squares = [i * i for i in range(5) if i % 2 == 0]\n")
            .unwrap();
        assert_eq!(h.eval("squares"), "[0, 4, 16]");
        assert!(!h.globals.contains_key("i"));
        assert_eq!(
            h.eval("{k: v for k, v in zip('ab', [1, 2])}"),
            "{'a': 1, 'b': 2}"
        );
    }

    #[test]
    fn slicing_and_unpacking() {
        let mut h = Harness::new();
        h.run("xs = list(range(10))\nfirst, *mid, last = xs[1:8:2]\nxs[0:3] = ['a']\n")
            .unwrap();
        assert_eq!(h.eval("first"), "1");
        assert_eq!(h.eval("mid"), "[3, 5]");
        assert_eq!(h.eval("last"), "7");
        assert_eq!(h.eval("xs[:3]"), "['a', 3, 4]");
        assert_eq!(h.eval("'hello'[::-1]"), "'olleh'");
    }

    #[test]
    fn protected_names_cannot_be_rebound() {
        let mut h = Harness::new();
        h.globals.insert("context".into(), Value::str("ctx"));
        let err = h.run("context = 1").unwrap_err();
        assert_eq!(err.kind, FaultKind::TypeError);
        assert_eq!(h.eval("context"), "'ctx'");
    }

    #[test]
    fn heap_is_collected_during_long_top_level_loops() {
        let mut h = Harness::new();
        h.run("for i in range(30000):\n    tmp = [i]\n").unwrap();
        assert!(h.heap.live() < 30_000);
        assert_eq!(h.eval("tmp"), "[29999]");
    }

    #[test]
    fn model_query_without_client_reports_unavailable() {
        let mut h = Harness::new();
        h.globals
            .insert("llm_query".into(), Value::Host(HostFn::LlmQuery));
        h.run("answer = llm_query('hi')").unwrap();
        assert_eq!(h.eval("answer"), "'Error: Sub-LLM not available'");
    }

    #[test]
    fn slice_indices_match_python() {
        assert_eq!(slice_indices(5, None, None, -1).unwrap(), vec![4, 3, 2, 1, 0]);
        assert_eq!(slice_indices(5, Some(-2), None, 1).unwrap(), vec![3, 4]);
        assert_eq!(slice_indices(5, Some(10), None, 1).unwrap(), Vec::<usize>::new());
        assert!(slice_indices(5, None, None, 0).is_err());
    }
}
