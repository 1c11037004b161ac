//! Values, the per-session object arena, and conversions.
//!
//! Scalars live inline in [`Value`]; every container and function lives in
//! the [`Heap`] and is referenced through an [`ObjId`]. The heap belongs to
//! exactly one sandbox, so nothing sandboxed code creates can be reached
//! from another session. Unreachable objects are reclaimed by a mark-sweep
//! pass rooted at the session namespace.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;

use indexmap::IndexMap;

use super::ast::FuncDef;
use super::fault::{Fault, FaultKind};

/// Nesting bound for repr, equality, hashing and JSON conversion.
const MAX_VALUE_DEPTH: usize = 200;

/// Handle to a heap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjId(u32);

impl ObjId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Lazily evaluated `range(start, stop, step)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeValue {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl RangeValue {
    pub fn len(&self) -> usize {
        let (lo, hi, step) = if self.step > 0 {
            (self.start as i128, self.stop as i128, self.step as i128)
        } else {
            (self.stop as i128, self.start as i128, -(self.step as i128))
        };
        if hi <= lo {
            0
        } else {
            ((hi - lo + step - 1) / step) as usize
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> i64 {
        self.start + (index as i64) * self.step
    }

    /// Smallest and largest element, if any.
    pub fn bounds(&self) -> Option<(i64, i64)> {
        let len = self.len();
        if len == 0 {
            return None;
        }
        let (first, last) = (self.start, self.get(len - 1));
        Some((first.min(last), first.max(last)))
    }

    /// Sum of the elements, or `None` if it does not fit in an `i64`.
    pub fn sum(&self) -> Option<i64> {
        let n = self.len() as i128;
        if n == 0 {
            return Some(0);
        }
        let first = self.start as i128;
        let last = self.get(self.len() - 1) as i128;
        let total = n.checked_mul(first + last)? / 2;
        i64::try_from(total).ok()
    }

    pub fn contains(&self, n: i64) -> bool {
        if self.step > 0 {
            n >= self.start && n < self.stop && (n - self.start) % self.step == 0
        } else {
            n <= self.start && n > self.stop && (self.start - n) % (-self.step) == 0
        }
    }
}

/// Host-provided functions bound into the namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostFn {
    LlmQuery,
    FinalVar,
}

impl HostFn {
    pub fn name(&self) -> &'static str {
        match self {
            HostFn::LlmQuery => "llm_query",
            HostFn::FinalVar => "FINAL_VAR",
        }
    }
}

/// A builtin method bound to its receiver.
#[derive(Debug, Clone)]
pub struct BoundMethod {
    pub receiver: Value,
    pub name: Arc<str>,
}

/// A raised exception value.
#[derive(Debug, Clone, PartialEq)]
pub struct ExcValue {
    pub kind: FaultKind,
    pub message: String,
}

#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Range(RangeValue),
    Ref(ObjId),
    Builtin(&'static str),
    Method(Arc<BoundMethod>),
    Module(&'static str),
    ExcType(FaultKind),
    Exception(Arc<ExcValue>),
    Host(HostFn),
}

impl Value {
    pub fn str(s: impl Into<Arc<str>>) -> Value {
        Value::Str(s.into())
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }
}

impl From<FaultKind> for ExcValue {
    fn from(kind: FaultKind) -> Self {
        ExcValue {
            kind,
            message: String::new(),
        }
    }
}

/// A user-defined function or lambda.
#[derive(Debug, Clone)]
pub struct Function {
    pub def: Arc<FuncDef>,
    pub defaults: Vec<Value>,
    pub kwdefaults: Vec<Option<Value>>,
    /// Namespace of the enclosing function call, if any.
    pub enclosing: Option<ObjId>,
}

/// Local variables of a function call or comprehension.
#[derive(Debug, Clone, Default)]
pub struct Namespace {
    pub vars: IndexMap<String, Value>,
    pub parent: Option<ObjId>,
}

/// Hashable projection of a value, used for dict keys and set members.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashKey {
    None,
    Int(i64),
    Float(u64),
    Str(Arc<str>),
    Tuple(Vec<HashKey>),
    Range(i64, i64, i64),
    Object(u32),
    Named(&'static str),
    ExcType(FaultKind),
    Host(HostFn),
}

/// Insertion-ordered mapping.
#[derive(Debug, Clone, Default)]
pub struct Dict {
    entries: IndexMap<HashKey, (Value, Value)>,
}

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &HashKey) -> Option<&Value> {
        self.entries.get(key).map(|(_, v)| v)
    }

    pub fn contains(&self, key: &HashKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Inserts, keeping the original key and position when it already exists.
    pub fn insert(&mut self, hash: HashKey, key: Value, value: Value) {
        match self.entries.get_mut(&hash) {
            Some(slot) => slot.1 = value,
            None => {
                self.entries.insert(hash, (key, value));
            }
        }
    }

    pub fn remove(&mut self, key: &HashKey) -> Option<(Value, Value)> {
        self.entries.shift_remove(key)
    }

    pub fn pop_last(&mut self) -> Option<(Value, Value)> {
        self.entries.pop().map(|(_, kv)| kv)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn keys(&self) -> impl Iterator<Item = &Value> {
        self.entries.values().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.values().map(|(_, v)| v)
    }

    pub fn items(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.entries.values().map(|(k, v)| (k, v))
    }
}

/// Insertion-ordered set.
#[derive(Debug, Clone, Default)]
pub struct Set {
    members: IndexMap<HashKey, Value>,
}

impl Set {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, key: &HashKey) -> bool {
        self.members.contains_key(key)
    }

    pub fn insert(&mut self, hash: HashKey, value: Value) -> bool {
        if self.members.contains_key(&hash) {
            return false;
        }
        self.members.insert(hash, value);
        true
    }

    pub fn remove(&mut self, key: &HashKey) -> Option<Value> {
        self.members.shift_remove(key)
    }

    pub fn pop_first(&mut self) -> Option<Value> {
        self.members.shift_remove_index(0).map(|(_, v)| v)
    }

    pub fn clear(&mut self) {
        self.members.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HashKey, &Value)> {
        self.members.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.members.values()
    }
}

#[derive(Debug, Clone)]
pub enum Object {
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Dict(Dict),
    Set(Set),
    Function(Function),
    Namespace(Namespace),
}

impl Object {
    pub fn type_name(&self) -> &'static str {
        match self {
            Object::List(_) => "list",
            Object::Tuple(_) => "tuple",
            Object::Dict(_) => "dict",
            Object::Set(_) => "set",
            Object::Function(_) => "function",
            Object::Namespace(_) => "namespace",
        }
    }

    fn children(&self, out: &mut Vec<ObjId>) {
        match self {
            Object::List(items) | Object::Tuple(items) => {
                for item in items {
                    push_child(item, out);
                }
            }
            Object::Dict(dict) => {
                for (k, v) in dict.items() {
                    push_child(k, out);
                    push_child(v, out);
                }
            }
            Object::Set(set) => {
                for item in set.values() {
                    push_child(item, out);
                }
            }
            Object::Function(func) => {
                for value in func.defaults.iter().chain(func.kwdefaults.iter().flatten()) {
                    push_child(value, out);
                }
                out.extend(func.enclosing);
            }
            Object::Namespace(ns) => {
                for value in ns.vars.values() {
                    push_child(value, out);
                }
                out.extend(ns.parent);
            }
        }
    }
}

fn push_child(value: &Value, out: &mut Vec<ObjId>) {
    match value {
        Value::Ref(id) => out.push(*id),
        Value::Method(m) => push_child(&m.receiver, out),
        _ => {}
    }
}

struct Slot {
    object: Object,
    frozen: bool,
    marked: bool,
}

/// Allocation bounds for one sandbox heap.
#[derive(Debug, Clone, Copy)]
pub struct HeapLimits {
    pub max_objects: usize,
    pub max_collection_len: usize,
    pub max_string_len: usize,
}

impl Default for HeapLimits {
    fn default() -> Self {
        Self {
            max_objects: 1_000_000,
            max_collection_len: 1_000_000,
            max_string_len: 64 * 1024 * 1024,
        }
    }
}

/// Arena owning every container and function of one sandbox.
pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    live: usize,
    limits: HeapLimits,
}

impl Heap {
    pub fn new(limits: HeapLimits) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            limits,
        }
    }

    pub fn live(&self) -> usize {
        self.live
    }

    pub fn alloc(&mut self, object: Object) -> Result<ObjId, Fault> {
        if self.live >= self.limits.max_objects {
            return Err(Fault::new(
                FaultKind::MemoryError,
                format!("object limit of {} exceeded", self.limits.max_objects),
            ));
        }
        let slot = Slot {
            object,
            frozen: false,
            marked: false,
        };
        self.live += 1;
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(slot);
                Ok(ObjId(index))
            }
            None => {
                self.slots.push(Some(slot));
                Ok(ObjId((self.slots.len() - 1) as u32))
            }
        }
    }

    /// Allocates and wraps in a [`Value::Ref`].
    pub fn new_value(&mut self, object: Object) -> Result<Value, Fault> {
        self.alloc(object).map(Value::Ref)
    }

    pub fn new_list(&mut self, items: Vec<Value>) -> Result<Value, Fault> {
        self.check_len(items.len())?;
        self.new_value(Object::List(items))
    }

    pub fn new_tuple(&mut self, items: Vec<Value>) -> Result<Value, Fault> {
        self.check_len(items.len())?;
        self.new_value(Object::Tuple(items))
    }

    /// Fails with `MemoryError` when a collection or string would exceed
    /// the configured length bound.
    pub fn check_len(&self, len: usize) -> Result<(), Fault> {
        if len > self.limits.max_collection_len {
            return Err(Fault::new(
                FaultKind::MemoryError,
                format!(
                    "length {} exceeds the limit of {}",
                    len, self.limits.max_collection_len
                ),
            ));
        }
        Ok(())
    }

    /// Same as [`Heap::check_len`] for string lengths in bytes.
    pub fn check_str_len(&self, len: usize) -> Result<(), Fault> {
        if len > self.limits.max_string_len {
            return Err(Fault::new(
                FaultKind::MemoryError,
                format!(
                    "string of {} bytes exceeds the limit of {}",
                    len, self.limits.max_string_len
                ),
            ));
        }
        Ok(())
    }

    pub fn get(&self, id: ObjId) -> Result<&Object, Fault> {
        match self.slots.get(id.index()) {
            Some(Some(slot)) => Ok(&slot.object),
            _ => Err(dangling()),
        }
    }

    /// Mutable access; frozen objects refuse mutation.
    pub fn get_mut(&mut self, id: ObjId) -> Result<&mut Object, Fault> {
        match self.slots.get_mut(id.index()) {
            Some(Some(slot)) if slot.frozen => Err(Fault::type_error(format!(
                "'{}' object is read-only",
                slot.object.type_name()
            ))),
            Some(Some(slot)) => Ok(&mut slot.object),
            _ => Err(dangling()),
        }
    }

    /// Freezes every object reachable from `value`.
    pub fn freeze(&mut self, value: &Value) {
        let mut stack = Vec::new();
        push_child(value, &mut stack);
        while let Some(id) = stack.pop() {
            if let Some(Some(slot)) = self.slots.get_mut(id.index()) {
                if slot.frozen {
                    continue;
                }
                slot.frozen = true;
                slot.object.children(&mut stack);
            }
        }
    }

    /// Releases a single object known to be unreferenced.
    pub fn release(&mut self, id: ObjId) {
        if let Some(slot) = self.slots.get_mut(id.index()) {
            if slot.take().is_some() {
                self.live -= 1;
                self.free.push(id.0);
            }
        }
    }

    /// Mark-sweep collection; returns the number of objects freed.
    pub fn collect<'a>(&mut self, roots: impl IntoIterator<Item = &'a Value>) -> usize {
        let mut stack = Vec::new();
        for root in roots {
            push_child(root, &mut stack);
        }
        while let Some(id) = stack.pop() {
            if let Some(Some(slot)) = self.slots.get_mut(id.index()) {
                if slot.marked {
                    continue;
                }
                slot.marked = true;
                slot.object.children(&mut stack);
            }
        }

        let mut freed = 0;
        for (index, entry) in self.slots.iter_mut().enumerate() {
            match entry {
                Some(slot) if slot.marked => slot.marked = false,
                Some(_) => {
                    *entry = None;
                    self.free.push(index as u32);
                    freed += 1;
                }
                None => {}
            }
        }
        self.live -= freed;
        freed
    }
}

fn dangling() -> Fault {
    Fault::new(FaultKind::RuntimeError, "dangling object reference")
}

fn too_deep() -> Fault {
    Fault::new(
        FaultKind::RecursionError,
        "maximum recursion depth exceeded while inspecting a value",
    )
}

/// Name of a value's type as reported by `type()`.
pub fn type_name(heap: &Heap, value: &Value) -> &'static str {
    match value {
        Value::None => "NoneType",
        Value::Bool(_) => "bool",
        Value::Int(_) => "int",
        Value::Float(_) => "float",
        Value::Str(_) => "str",
        Value::Range(_) => "range",
        Value::Ref(id) => heap.get(*id).map(|o| o.type_name()).unwrap_or("object"),
        Value::Builtin(name) if is_type_name(name) => "type",
        Value::Builtin(_) | Value::Method(_) | Value::Host(_) => "builtin_function_or_method",
        Value::Module(_) => "module",
        Value::ExcType(_) => "type",
        Value::Exception(exc) => exc.kind.name(),
    }
}

/// Builtins that act as type objects.
pub fn is_type_name(name: &str) -> bool {
    matches!(
        name,
        "int"
            | "float"
            | "str"
            | "bool"
            | "list"
            | "tuple"
            | "dict"
            | "set"
            | "range"
            | "type"
            | "NoneType"
            | "function"
            | "module"
            | "builtin_function_or_method"
    )
}

pub fn truthy(heap: &Heap, value: &Value) -> Result<bool, Fault> {
    Ok(match value {
        Value::None => false,
        Value::Bool(b) => *b,
        Value::Int(n) => *n != 0,
        Value::Float(f) => *f != 0.0,
        Value::Str(s) => !s.is_empty(),
        Value::Range(r) => !r.is_empty(),
        Value::Ref(id) => match heap.get(*id)? {
            Object::List(items) | Object::Tuple(items) => !items.is_empty(),
            Object::Dict(d) => !d.is_empty(),
            Object::Set(s) => !s.is_empty(),
            _ => true,
        },
        _ => true,
    })
}

/// Numeric view used by arithmetic and comparisons.
#[derive(Debug, Clone, Copy)]
pub enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    pub fn as_f64(self) -> f64 {
        match self {
            Num::Int(n) => n as f64,
            Num::Float(f) => f,
        }
    }
}

pub fn as_num(value: &Value) -> Option<Num> {
    match value {
        Value::Bool(b) => Some(Num::Int(*b as i64)),
        Value::Int(n) => Some(Num::Int(*n)),
        Value::Float(f) => Some(Num::Float(*f)),
        _ => None,
    }
}

pub fn hash_key(heap: &Heap, value: &Value) -> Result<HashKey, Fault> {
    hash_key_at(heap, value, 0)
}

fn hash_key_at(heap: &Heap, value: &Value, depth: usize) -> Result<HashKey, Fault> {
    if depth > MAX_VALUE_DEPTH {
        return Err(too_deep());
    }
    Ok(match value {
        Value::None => HashKey::None,
        Value::Bool(b) => HashKey::Int(*b as i64),
        Value::Int(n) => HashKey::Int(*n),
        Value::Float(f) => {
            if f.fract() == 0.0 && f.abs() < 9.2e18 {
                HashKey::Int(*f as i64)
            } else {
                HashKey::Float(f.to_bits())
            }
        }
        Value::Str(s) => HashKey::Str(s.clone()),
        Value::Range(r) => HashKey::Range(r.start, r.stop, r.step),
        Value::Builtin(name) | Value::Module(name) => HashKey::Named(*name),
        Value::ExcType(kind) => HashKey::ExcType(*kind),
        Value::Host(host) => HashKey::Host(*host),
        Value::Ref(id) => match heap.get(*id)? {
            Object::Tuple(items) => HashKey::Tuple(
                items
                    .iter()
                    .map(|v| hash_key_at(heap, v, depth + 1))
                    .collect::<Result<_, _>>()?,
            ),
            Object::Function(_) => HashKey::Object(id.0),
            other => {
                return Err(Fault::type_error(format!(
                    "unhashable type: '{}'",
                    other.type_name()
                )))
            }
        },
        Value::Method(_) | Value::Exception(_) => {
            return Err(Fault::type_error(format!(
                "unhashable type: '{}'",
                type_name(heap, value)
            )))
        }
    })
}

pub fn values_eq(heap: &Heap, a: &Value, b: &Value) -> Result<bool, Fault> {
    eq_at(heap, a, b, 0)
}

fn eq_at(heap: &Heap, a: &Value, b: &Value, depth: usize) -> Result<bool, Fault> {
    if depth > MAX_VALUE_DEPTH {
        return Err(too_deep());
    }
    if let (Some(x), Some(y)) = (as_num(a), as_num(b)) {
        return Ok(match (x, y) {
            (Num::Int(x), Num::Int(y)) => x == y,
            (x, y) => x.as_f64() == y.as_f64(),
        });
    }
    Ok(match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Range(x), Value::Range(y)) => x == y,
        (Value::Builtin(x), Value::Builtin(y)) => x == y,
        (Value::Module(x), Value::Module(y)) => x == y,
        (Value::ExcType(x), Value::ExcType(y)) => x == y,
        (Value::Host(x), Value::Host(y)) => x == y,
        (Value::Exception(x), Value::Exception(y)) => Arc::ptr_eq(x, y),
        (Value::Ref(x), Value::Ref(y)) => {
            if x == y {
                return Ok(true);
            }
            match (heap.get(*x)?, heap.get(*y)?) {
                (Object::List(p), Object::List(q)) | (Object::Tuple(p), Object::Tuple(q)) => {
                    seq_eq(heap, p, q, depth)?
                }
                (Object::Dict(p), Object::Dict(q)) => {
                    if p.len() != q.len() {
                        return Ok(false);
                    }
                    for (k, v) in p.items() {
                        let key = hash_key_at(heap, k, depth + 1)?;
                        match q.get(&key) {
                            Some(other) if eq_at(heap, v, other, depth + 1)? => {}
                            _ => return Ok(false),
                        }
                    }
                    true
                }
                (Object::Set(p), Object::Set(q)) => {
                    p.len() == q.len() && p.iter().all(|(k, _)| q.contains(k))
                }
                _ => false,
            }
        }
        _ => false,
    })
}

fn seq_eq(heap: &Heap, p: &[Value], q: &[Value], depth: usize) -> Result<bool, Fault> {
    if p.len() != q.len() {
        return Ok(false);
    }
    for (x, y) in p.iter().zip(q) {
        if !eq_at(heap, x, y, depth + 1)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Ordering for `<`, `sorted`, `min` and `max`.
pub fn compare(heap: &Heap, a: &Value, b: &Value) -> Result<Ordering, Fault> {
    compare_at(heap, a, b, 0)
}

fn compare_at(heap: &Heap, a: &Value, b: &Value, depth: usize) -> Result<Ordering, Fault> {
    if depth > MAX_VALUE_DEPTH {
        return Err(too_deep());
    }
    if let (Some(x), Some(y)) = (as_num(a), as_num(b)) {
        return match (x, y) {
            (Num::Int(x), Num::Int(y)) => Ok(x.cmp(&y)),
            (x, y) => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .ok_or_else(|| Fault::value_error("cannot order NaN")),
        };
    }
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => return Ok(x.cmp(y)),
        (Value::Ref(x), Value::Ref(y)) => {
            let pair = (heap.get(*x)?, heap.get(*y)?);
            if let (Object::List(p), Object::List(q)) | (Object::Tuple(p), Object::Tuple(q)) =
                pair
            {
                for (l, r) in p.iter().zip(q.iter()) {
                    if !eq_at(heap, l, r, depth + 1)? {
                        return compare_at(heap, l, r, depth + 1);
                    }
                }
                return Ok(p.len().cmp(&q.len()));
            }
        }
        _ => {}
    }
    Err(Fault::type_error(format!(
        "'<' not supported between instances of '{}' and '{}'",
        type_name(heap, a),
        type_name(heap, b)
    )))
}

/// Python-style float formatting.
pub fn float_repr(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if f == 0.0 {
        return if f.is_sign_negative() { "-0.0" } else { "0.0" }.to_string();
    }
    let sci = format!("{:e}", f);
    let (mantissa, exp) = match sci.split_once('e') {
        Some((m, e)) => (m.to_string(), e.parse::<i32>().unwrap_or(0)),
        None => (sci.clone(), 0),
    };
    if (-4..16).contains(&exp) {
        let mut s = format!("{}", f);
        if !s.contains('.') {
            s.push_str(".0");
        }
        s
    } else {
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", mantissa, sign, exp.abs())
    }
}

/// Quotes a string the way `repr()` does.
pub fn quote_str(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

pub fn repr(heap: &Heap, value: &Value) -> Result<String, Fault> {
    let mut out = String::new();
    let mut active = HashSet::new();
    write_repr(heap, value, &mut out, &mut active, 0)?;
    Ok(out)
}

/// `str()` conversion: strings are returned unquoted.
pub fn to_str(heap: &Heap, value: &Value) -> Result<String, Fault> {
    match value {
        Value::Str(s) => Ok(s.to_string()),
        Value::Exception(exc) => Ok(exc.message.clone()),
        other => repr(heap, other),
    }
}

fn write_repr(
    heap: &Heap,
    value: &Value,
    out: &mut String,
    active: &mut HashSet<ObjId>,
    depth: usize,
) -> Result<(), Fault> {
    if depth > MAX_VALUE_DEPTH {
        return Err(too_deep());
    }
    match value {
        Value::None => out.push_str("None"),
        Value::Bool(true) => out.push_str("True"),
        Value::Bool(false) => out.push_str("False"),
        Value::Int(n) => {
            let _ = write!(out, "{}", n);
        }
        Value::Float(f) => out.push_str(&float_repr(*f)),
        Value::Str(s) => out.push_str(&quote_str(s)),
        Value::Range(r) => {
            if r.step == 1 {
                let _ = write!(out, "range({}, {})", r.start, r.stop);
            } else {
                let _ = write!(out, "range({}, {}, {})", r.start, r.stop, r.step);
            }
        }
        Value::Builtin(name) if is_type_name(name) => {
            let _ = write!(out, "<class '{}'>", name);
        }
        Value::Builtin(name) => {
            let _ = write!(out, "<built-in function {}>", name);
        }
        Value::Host(host) => {
            let _ = write!(out, "<built-in function {}>", host.name());
        }
        Value::Method(m) => {
            let _ = write!(
                out,
                "<built-in method {} of {} object>",
                m.name,
                type_name(heap, &m.receiver)
            );
        }
        Value::Module(name) => {
            let _ = write!(out, "<module '{}'>", name);
        }
        Value::ExcType(kind) => {
            let _ = write!(out, "<class '{}'>", kind.name());
        }
        Value::Exception(exc) => {
            let _ = write!(out, "{}({})", exc.kind.name(), quote_str(&exc.message));
        }
        Value::Ref(id) => {
            let object = heap.get(*id)?;
            if !active.insert(*id) {
                out.push_str(match object {
                    Object::Dict(_) => "{...}",
                    _ => "[...]",
                });
                return Ok(());
            }
            match object {
                Object::List(items) => {
                    out.push('[');
                    write_items(heap, items.iter(), out, active, depth)?;
                    out.push(']');
                }
                Object::Tuple(items) => {
                    out.push('(');
                    write_items(heap, items.iter(), out, active, depth)?;
                    if items.len() == 1 {
                        out.push(',');
                    }
                    out.push(')');
                }
                Object::Set(set) => {
                    if set.is_empty() {
                        out.push_str("set()");
                    } else {
                        out.push('{');
                        write_items(heap, set.values(), out, active, depth)?;
                        out.push('}');
                    }
                }
                Object::Dict(dict) => {
                    out.push('{');
                    for (i, (k, v)) in dict.items().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        write_repr(heap, k, out, active, depth + 1)?;
                        out.push_str(": ");
                        write_repr(heap, v, out, active, depth + 1)?;
                    }
                    out.push('}');
                }
                Object::Function(func) => {
                    let _ = write!(out, "<function {}>", func.def.name);
                }
                Object::Namespace(_) => out.push_str("<namespace>"),
            }
            active.remove(id);
        }
    }
    heap.check_str_len(out.len())
}

fn write_items<'a>(
    heap: &Heap,
    items: impl Iterator<Item = &'a Value>,
    out: &mut String,
    active: &mut HashSet<ObjId>,
    depth: usize,
) -> Result<(), Fault> {
    for (i, item) in items.enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write_repr(heap, item, out, active, depth + 1)?;
    }
    Ok(())
}

/// Converts a value to JSON, failing on anything JSON cannot represent.
pub fn to_json(heap: &Heap, value: &Value) -> Result<serde_json::Value, Fault> {
    to_json_within(heap, value, heap.limits.max_string_len).map(|(json, _)| json)
}

/// Like [`to_json`], but fails with `MemoryError` once the serialized form
/// would exceed `limit` bytes. Returns the JSON and its estimated size.
pub fn to_json_within(
    heap: &Heap,
    value: &Value,
    limit: usize,
) -> Result<(serde_json::Value, usize), Fault> {
    let mut size = JsonSize { used: 0, limit };
    let json = to_json_at(heap, value, 0, &mut size)?;
    Ok((json, size.used))
}

/// Running estimate of serialized JSON bytes.
struct JsonSize {
    used: usize,
    limit: usize,
}

impl JsonSize {
    fn add(&mut self, bytes: usize) -> Result<(), Fault> {
        self.used = self.used.saturating_add(bytes);
        if self.used > self.limit {
            return Err(Fault::new(
                FaultKind::MemoryError,
                format!("serialized value exceeds the limit of {} bytes", self.limit),
            ));
        }
        Ok(())
    }
}

fn to_json_at(
    heap: &Heap,
    value: &Value,
    depth: usize,
    size: &mut JsonSize,
) -> Result<serde_json::Value, Fault> {
    use serde_json::Value as J;
    if depth > MAX_VALUE_DEPTH {
        return Err(Fault::value_error("Circular reference detected"));
    }
    Ok(match value {
        Value::None => {
            size.add(4)?;
            J::Null
        }
        Value::Bool(b) => {
            size.add(5)?;
            J::Bool(*b)
        }
        Value::Int(n) => {
            size.add(20)?;
            J::from(*n)
        }
        Value::Float(f) => {
            size.add(24)?;
            serde_json::Number::from_f64(*f).map(J::Number).ok_or_else(|| {
                Fault::value_error("Out of range float values are not JSON compliant")
            })?
        }
        Value::Str(s) => {
            size.add(s.len() + 2)?;
            J::String(s.to_string())
        }
        Value::Ref(id) => match heap.get(*id)? {
            Object::List(items) | Object::Tuple(items) => {
                size.add(2)?;
                let mut array = Vec::with_capacity(items.len());
                for item in items {
                    size.add(2)?;
                    array.push(to_json_at(heap, item, depth + 1, size)?);
                }
                J::Array(array)
            }
            Object::Dict(dict) => {
                size.add(2)?;
                let mut map = serde_json::Map::new();
                for (k, v) in dict.items() {
                    let key = match k {
                        Value::Str(s) => s.to_string(),
                        Value::Int(_) | Value::Float(_) | Value::Bool(_) | Value::None => {
                            json_key(k)
                        }
                        other => {
                            return Err(Fault::type_error(format!(
                                "keys must be str, int, float, bool or None, not {}",
                                type_name(heap, other)
                            )))
                        }
                    };
                    size.add(key.len() + 6)?;
                    map.insert(key, to_json_at(heap, v, depth + 1, size)?);
                }
                J::Object(map)
            }
            other => {
                return Err(Fault::type_error(format!(
                    "Object of type {} is not JSON serializable",
                    other.type_name()
                )))
            }
        },
        other => {
            return Err(Fault::type_error(format!(
                "Object of type {} is not JSON serializable",
                type_name(heap, other)
            )))
        }
    })
}

fn json_key(key: &Value) -> String {
    match key {
        Value::Bool(true) => "true".to_string(),
        Value::Bool(false) => "false".to_string(),
        Value::None => "null".to_string(),
        Value::Int(n) => n.to_string(),
        Value::Float(f) => float_repr(*f),
        _ => String::new(),
    }
}

/// Builds sandbox values from JSON.
pub fn from_json(heap: &mut Heap, json: &serde_json::Value) -> Result<Value, Fault> {
    from_json_at(heap, json, 0)
}

fn from_json_at(heap: &mut Heap, json: &serde_json::Value, depth: usize) -> Result<Value, Fault> {
    use serde_json::Value as J;
    if depth > MAX_VALUE_DEPTH {
        return Err(too_deep());
    }
    Ok(match json {
        J::Null => Value::None,
        J::Bool(b) => Value::Bool(*b),
        J::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        J::String(s) => Value::str(s.as_str()),
        J::Array(items) => {
            let values = items
                .iter()
                .map(|v| from_json_at(heap, v, depth + 1))
                .collect::<Result<Vec<_>, _>>()?;
            heap.new_list(values)?
        }
        J::Object(map) => {
            let mut dict = Dict::new();
            for (k, v) in map {
                let key: Arc<str> = Arc::from(k.as_str());
                let value = from_json_at(heap, v, depth + 1)?;
                dict.insert(HashKey::Str(key.clone()), Value::Str(key), value);
            }
            heap.new_value(Object::Dict(dict))?
        }
    })
}

/// Placeholder used when a value cannot be snapshotted as JSON.
pub fn placeholder(heap: &Heap, value: &Value) -> String {
    format!("<{}>", type_name(heap, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> Heap {
        Heap::new(HeapLimits::default())
    }

    fn ref_id(value: &Value) -> ObjId {
        match value {
            Value::Ref(id) => *id,
            other => panic!("not a heap value: {:?}", other),
        }
    }

    /// A list holding `count` references to one string of `len` bytes.
    fn shared_refs(heap: &mut Heap, len: usize, count: usize) -> Value {
        let big = Value::str("x".repeat(len));
        heap.new_list(vec![big; count]).unwrap()
    }

    #[test]
    fn float_repr_matches_interactive_shell() {
        assert_eq!(float_repr(1.0), "1.0");
        assert_eq!(float_repr(0.1), "0.1");
        assert_eq!(float_repr(2.5e-5), "2.5e-05");
        assert_eq!(float_repr(1e16), "1e+16");
        assert_eq!(float_repr(123456.789), "123456.789");
        assert_eq!(float_repr(f64::INFINITY), "inf");
    }

    #[test]
    fn repr_of_nested_containers() {
        let mut heap = heap();
        let inner = heap.new_tuple(vec![Value::Int(1)]).unwrap();
        let list = heap
            .new_list(vec![inner, Value::str("a'b"), Value::None, Value::Float(1.5)])
            .unwrap();
        assert_eq!(repr(&heap, &list).unwrap(), "[(1,), \"a'b\", None, 1.5]");
    }

    #[test]
    fn self_referencing_list_repr_terminates() {
        let mut heap = heap();
        let list = heap.new_list(Vec::new()).unwrap();
        let id = ref_id(&list);
        if let Object::List(items) = heap.get_mut(id).unwrap() {
            items.push(list.clone());
        }
        assert_eq!(repr(&heap, &list).unwrap(), "[[...]]");
    }

    #[test]
    fn repr_stops_once_output_exceeds_the_string_limit() {
        let mut heap = Heap::new(HeapLimits {
            max_string_len: 4096,
            ..HeapLimits::default()
        });
        let list = shared_refs(&mut heap, 1000, 100_000);
        let err = repr(&heap, &list).unwrap_err();
        assert_eq!(err.kind, FaultKind::MemoryError);
        let err = to_str(&heap, &list).unwrap_err();
        assert_eq!(err.kind, FaultKind::MemoryError);

        let small = shared_refs(&mut heap, 10, 3);
        assert!(repr(&heap, &small).unwrap().starts_with("['xxxxxxxxxx', "));
    }

    #[test]
    fn json_conversion_is_bounded() {
        let mut heap = heap();
        let list = shared_refs(&mut heap, 1000, 100_000);
        let err = to_json_within(&heap, &list, 10_000).unwrap_err();
        assert_eq!(err.kind, FaultKind::MemoryError);

        let small = shared_refs(&mut heap, 10, 3);
        let (json, used) = to_json_within(&heap, &small, 10_000).unwrap();
        assert_eq!(json.as_array().map(Vec::len), Some(3));
        assert!(used >= 36 && used <= 10_000);
    }

    #[test]
    fn numeric_keys_unify_across_types() {
        let heap = heap();
        assert_eq!(
            hash_key(&heap, &Value::Bool(true)).unwrap(),
            hash_key(&heap, &Value::Float(1.0)).unwrap()
        );
        assert!(values_eq(&heap, &Value::Int(2), &Value::Float(2.0)).unwrap());
    }

    #[test]
    fn lists_are_unhashable() {
        let mut heap = heap();
        let list = heap.new_list(vec![]).unwrap();
        let err = hash_key(&heap, &list).unwrap_err();
        assert_eq!(err.kind, FaultKind::TypeError);
    }

    #[test]
    fn collect_frees_unreachable_objects() {
        let mut heap = heap();
        let kept = heap.new_list(vec![Value::Int(1)]).unwrap();
        let child = heap.new_list(vec![]).unwrap();
        let parent = heap.new_list(vec![child]).unwrap();
        let _garbage = heap.new_list(vec![]).unwrap();
        assert_eq!(heap.live(), 4);

        let freed = heap.collect([&kept]);
        assert_eq!(freed, 3);
        assert_eq!(heap.live(), 1);
        assert!(heap.get(ref_id(&parent)).is_err());
        assert!(heap.get(ref_id(&kept)).is_ok());
    }

    #[test]
    fn frozen_objects_refuse_mutation() {
        let mut heap = heap();
        let inner = heap.new_list(vec![]).unwrap();
        let outer = heap.new_list(vec![inner.clone()]).unwrap();
        heap.freeze(&outer);
        assert!(heap.get_mut(ref_id(&inner)).is_err());
        assert!(heap.get_mut(ref_id(&outer)).is_err());
    }

    #[test]
    fn object_limit_raises_memory_error() {
        let mut heap = Heap::new(HeapLimits {
            max_objects: 2,
            max_collection_len: 10,
            max_string_len: 10,
        });
        heap.new_list(vec![]).unwrap();
        heap.new_list(vec![]).unwrap();
        let err = heap.new_list(vec![]).unwrap_err();
        assert_eq!(err.kind, FaultKind::MemoryError);
        assert!(heap.check_len(11).is_err());
    }

    #[test]
    fn json_round_trip_preserves_structure() {
        let mut heap = heap();
        let json = serde_json::json!({"a": [1, 2.5, "x"], "b": null});
        let value = from_json(&mut heap, &json).unwrap();
        assert_eq!(to_json(&heap, &value).unwrap(), json);
        assert_eq!(
            repr(&heap, &value).unwrap(),
            "{'a': [1, 2.5, 'x'], 'b': None}"
        );
    }

    #[test]
    fn range_length_and_membership() {
        let r = RangeValue {
            start: 10,
            stop: 0,
            step: -3,
        };
        assert_eq!(r.len(), 4);
        assert!(r.contains(4));
        assert!(!r.contains(5));
        assert_eq!(r.get(3), 1);
    }
}
