//! Builtin functions, container and string methods, and the `math` and
//! `json` modules.

use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use super::ast::BinOp;
use super::capability::{Capability, CapabilitySet};
use super::fault::{Fault, FaultKind};
use super::interp::{as_int, norm_index, numeric_op, Interpreter, LoopItems};
use super::value::*;

const BUILTINS: &[(&str, Capability)] = &[
    ("int", Capability::Data),
    ("float", Capability::Data),
    ("str", Capability::Data),
    ("bool", Capability::Data),
    ("list", Capability::Data),
    ("tuple", Capability::Data),
    ("dict", Capability::Data),
    ("set", Capability::Data),
    ("len", Capability::Data),
    ("range", Capability::Iteration),
    ("enumerate", Capability::Iteration),
    ("zip", Capability::Iteration),
    ("map", Capability::Iteration),
    ("filter", Capability::Iteration),
    ("sorted", Capability::Iteration),
    ("reversed", Capability::Iteration),
    ("any", Capability::Iteration),
    ("all", Capability::Iteration),
    ("abs", Capability::Arithmetic),
    ("round", Capability::Arithmetic),
    ("pow", Capability::Arithmetic),
    ("divmod", Capability::Arithmetic),
    ("min", Capability::Arithmetic),
    ("max", Capability::Arithmetic),
    ("sum", Capability::Arithmetic),
    ("chr", Capability::Strings),
    ("ord", Capability::Strings),
    ("hex", Capability::Strings),
    ("bin", Capability::Strings),
    ("oct", Capability::Strings),
    ("repr", Capability::Strings),
    ("format", Capability::Strings),
    ("type", Capability::Introspection),
    ("isinstance", Capability::Introspection),
    ("callable", Capability::Introspection),
    ("hasattr", Capability::Introspection),
    ("getattr", Capability::Introspection),
    ("dir", Capability::Introspection),
    ("hash", Capability::Introspection),
    ("print", Capability::Output),
];

const MATH_FUNCS: &[&str] = &[
    "math.sqrt",
    "math.floor",
    "math.ceil",
    "math.trunc",
    "math.log",
    "math.log2",
    "math.log10",
    "math.exp",
    "math.sin",
    "math.cos",
    "math.tan",
    "math.asin",
    "math.acos",
    "math.atan",
    "math.atan2",
    "math.hypot",
    "math.fabs",
    "math.pow",
    "math.degrees",
    "math.radians",
    "math.copysign",
    "math.isfinite",
    "math.isinf",
    "math.isnan",
    "math.isclose",
    "math.gcd",
    "math.factorial",
    "math.prod",
];

const MATH_CONSTS: &[&str] = &["pi", "e", "tau", "inf", "nan"];

const JSON_FUNCS: &[&str] = &["json.dumps", "json.loads"];

const STR_METHODS: &[&str] = &[
    "upper",
    "lower",
    "title",
    "capitalize",
    "swapcase",
    "strip",
    "lstrip",
    "rstrip",
    "split",
    "rsplit",
    "splitlines",
    "join",
    "replace",
    "startswith",
    "endswith",
    "find",
    "rfind",
    "index",
    "rindex",
    "count",
    "format",
    "isdigit",
    "isnumeric",
    "isdecimal",
    "isalpha",
    "isalnum",
    "isspace",
    "isupper",
    "islower",
    "center",
    "ljust",
    "rjust",
    "zfill",
    "partition",
    "rpartition",
    "removeprefix",
    "removesuffix",
];

const LIST_METHODS: &[&str] = &[
    "append", "extend", "insert", "pop", "remove", "index", "count", "sort", "reverse", "clear",
    "copy",
];

const TUPLE_METHODS: &[&str] = &["index", "count"];

const DICT_METHODS: &[&str] = &[
    "get",
    "keys",
    "values",
    "items",
    "pop",
    "popitem",
    "setdefault",
    "update",
    "clear",
    "copy",
];

const SET_METHODS: &[&str] = &[
    "add",
    "remove",
    "discard",
    "pop",
    "clear",
    "copy",
    "union",
    "intersection",
    "difference",
    "symmetric_difference",
    "update",
    "issubset",
    "issuperset",
    "isdisjoint",
];

/// Resolves a builtin name, honouring the granted capabilities.
pub fn lookup(name: &str, caps: &CapabilitySet) -> Option<Value> {
    if let Some(kind) = FaultKind::from_name(name) {
        return caps
            .contains(Capability::Errors)
            .then_some(Value::ExcType(kind));
    }
    BUILTINS
        .iter()
        .find(|(n, _)| *n == name)
        .filter(|(_, cap)| caps.contains(*cap))
        .map(|(n, _)| Value::Builtin(n))
}

pub fn module_value(name: &str) -> Option<Value> {
    match name {
        "math" => Some(Value::Module("math")),
        "json" => Some(Value::Module("json")),
        _ => None,
    }
}

/// Public names of a module, for `from m import *` and `dir(m)`.
pub fn module_attrs(module: &str) -> Vec<&'static str> {
    let funcs: &[&'static str] = match module {
        "math" => MATH_FUNCS,
        "json" => JSON_FUNCS,
        _ => &[],
    };
    let mut names: Vec<&'static str> = funcs
        .iter()
        .filter_map(|f| f.split_once('.').map(|(_, name)| name))
        .collect();
    if module == "math" {
        names.extend_from_slice(MATH_CONSTS);
    }
    names.sort_unstable();
    names
}

fn module_attr(module: &str, name: &str) -> Option<Value> {
    if module == "math" {
        match name {
            "pi" => return Some(Value::Float(std::f64::consts::PI)),
            "e" => return Some(Value::Float(std::f64::consts::E)),
            "tau" => return Some(Value::Float(std::f64::consts::TAU)),
            "inf" => return Some(Value::Float(f64::INFINITY)),
            "nan" => return Some(Value::Float(f64::NAN)),
            _ => {}
        }
    }
    let table = match module {
        "math" => MATH_FUNCS,
        "json" => JSON_FUNCS,
        _ => return None,
    };
    table
        .iter()
        .find(|full| full.split_once('.').map(|(_, n)| n) == Some(name))
        .map(|full| Value::Builtin(full))
}

fn method_capability(type_name: &str, method: &str) -> Option<Capability> {
    let (table, cap): (&[&str], Capability) = match type_name {
        "str" => (STR_METHODS, Capability::Strings),
        "list" => (LIST_METHODS, Capability::Data),
        "tuple" => (TUPLE_METHODS, Capability::Data),
        "dict" => (DICT_METHODS, Capability::Data),
        "set" => (SET_METHODS, Capability::Data),
        "float" => (&["is_integer"], Capability::Arithmetic),
        "int" => (&["bit_length"], Capability::Arithmetic),
        _ => return None,
    };
    table.contains(&method).then_some(cap)
}

fn method_names(type_name: &str) -> &'static [&'static str] {
    match type_name {
        "str" => STR_METHODS,
        "list" => LIST_METHODS,
        "tuple" => TUPLE_METHODS,
        "dict" => DICT_METHODS,
        "set" => SET_METHODS,
        "float" => &["is_integer"],
        "int" => &["bit_length"],
        _ => &[],
    }
}

// ---- argument helpers ----

struct Kwargs(Vec<(String, Value)>);

impl Kwargs {
    fn take(&mut self, key: &str) -> Option<Value> {
        let pos = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(pos).1)
    }

    fn finish(self, func: &str) -> Result<(), Fault> {
        match self.0.first() {
            Some((key, _)) => Err(Fault::type_error(format!(
                "{}() got an unexpected keyword argument '{}'",
                func, key
            ))),
            None => Ok(()),
        }
    }
}

fn arity(func: &str, args: &[Value], min: usize, max: usize) -> Result<(), Fault> {
    if args.len() >= min && args.len() <= max {
        return Ok(());
    }
    let expected = if min == max {
        format!("exactly {}", min)
    } else if args.len() < min {
        format!("at least {}", min)
    } else {
        format!("at most {}", max)
    };
    let bound = if args.len() < min { min } else { max };
    Err(Fault::type_error(format!(
        "{}() takes {} argument{} ({} given)",
        func,
        expected,
        if bound == 1 { "" } else { "s" },
        args.len()
    )))
}

fn str_arg<'v>(func: &str, heap: &Heap, value: &'v Value) -> Result<&'v str, Fault> {
    match value {
        Value::Str(s) => Ok(&**s),
        other => Err(Fault::type_error(format!(
            "{}() argument must be str, not {}",
            func,
            type_name(heap, other)
        ))),
    }
}

fn int_arg(heap: &Heap, value: &Value) -> Result<i64, Fault> {
    as_int(value).ok_or_else(|| {
        Fault::type_error(format!(
            "'{}' object cannot be interpreted as an integer",
            type_name(heap, value)
        ))
    })
}

fn float_arg(heap: &Heap, value: &Value) -> Result<f64, Fault> {
    as_num(value).map(Num::as_f64).ok_or_else(|| {
        Fault::type_error(format!(
            "must be real number, not {}",
            type_name(heap, value)
        ))
    })
}

fn unary_arg(func: &str, heap: &Heap, args: &[Value]) -> Result<f64, Fault> {
    arity(func, args, 1, 1)?;
    float_arg(heap, &args[0])
}

fn math_domain() -> Fault {
    Fault::value_error("math domain error")
}

fn float_to_int(f: f64) -> Result<i64, Fault> {
    if f.is_nan() {
        return Err(Fault::value_error("cannot convert float NaN to integer"));
    }
    if f.is_infinite() {
        return Err(Fault::new(
            FaultKind::OverflowError,
            "cannot convert float infinity to integer",
        ));
    }
    let t = f.trunc();
    if t < -9.223_372_036_854_776e18 || t >= 9.223_372_036_854_776e18 {
        return Err(Fault::overflow());
    }
    Ok(t as i64)
}

fn char_index(s: &str, byte: usize) -> i64 {
    s[..byte].chars().count() as i64
}

/// Converts a char-based slice bound to a byte offset.
fn byte_offset(s: &str, index: Option<i64>, default: usize) -> usize {
    let Some(index) = index else {
        return default;
    };
    let len = s.chars().count() as i64;
    let at = if index < 0 { (index + len).max(0) } else { index.min(len) };
    s.char_indices()
        .nth(at as usize)
        .map(|(b, _)| b)
        .unwrap_or(s.len())
}

fn split_whitespace_n(s: &str, maxsplit: i64) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = s.trim_start();
    while !rest.is_empty() {
        if maxsplit >= 0 && out.len() as i64 >= maxsplit {
            out.push(rest.to_string());
            break;
        }
        match rest.find(char::is_whitespace) {
            Some(i) => {
                out.push(rest[..i].to_string());
                rest = rest[i..].trim_start();
            }
            None => {
                out.push(rest.to_string());
                break;
            }
        }
    }
    out
}

fn rsplit_whitespace_n(s: &str, maxsplit: i64) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = s.trim_end();
    while !rest.is_empty() {
        if maxsplit >= 0 && out.len() as i64 >= maxsplit {
            out.push(rest.to_string());
            break;
        }
        match rest.rfind(char::is_whitespace) {
            Some(i) => {
                let ws_len = rest[i..].chars().next().map(char::len_utf8).unwrap_or(1);
                out.push(rest[i + ws_len..].to_string());
                rest = rest[..i].trim_end();
            }
            None => {
                out.push(rest.to_string());
                break;
            }
        }
    }
    out.reverse();
    out
}

fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_alpha = false;
    for c in s.chars() {
        if c.is_alphabetic() {
            if prev_alpha {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(c);
            prev_alpha = false;
        }
    }
    out
}

impl Interpreter<'_> {
    fn str_list(&mut self, parts: Vec<String>) -> Result<Value, Fault> {
        let items = parts.into_iter().map(Value::str).collect();
        self.heap.new_list(items)
    }

    fn pair(&mut self, a: Value, b: Value) -> Result<Value, Fault> {
        self.heap.new_tuple(vec![a, b])
    }

    // ---- attributes ----

    pub(super) fn get_attr(&mut self, obj: &Value, name: &str) -> Result<Value, Fault> {
        match obj {
            Value::Module(module) => {
                return module_attr(module, name).ok_or_else(|| {
                    Fault::new(
                        FaultKind::AttributeError,
                        format!("module '{}' has no attribute '{}'", module, name),
                    )
                })
            }
            Value::Exception(exc) if name == "args" => {
                let args = if exc.message.is_empty() {
                    Vec::new()
                } else {
                    vec![Value::str(exc.message.as_str())]
                };
                return self.heap.new_tuple(args);
            }
            _ => {}
        }
        let tn = type_name(self.heap, obj);
        match method_capability(tn, name) {
            Some(cap) if self.caps.contains(cap) => Ok(Value::Method(Arc::new(BoundMethod {
                receiver: obj.clone(),
                name: Arc::from(name),
            }))),
            _ => Err(Fault::new(
                FaultKind::AttributeError,
                format!("'{}' object has no attribute '{}'", tn, name),
            )),
        }
    }

    // ---- builtin functions ----

    pub(super) fn call_builtin(
        &mut self,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, Fault> {
        self.budget.tick()?;
        let mut kw = Kwargs(kwargs);
        if let Some(func) = name.strip_prefix("math.") {
            let value = self.call_math(func, args, &mut kw)?;
            kw.finish(func)?;
            return Ok(value);
        }
        if let Some(func) = name.strip_prefix("json.") {
            let value = self.call_json(func, args, &mut kw)?;
            kw.finish(func)?;
            return Ok(value);
        }

        let value = match name {
            "print" => {
                let sep = match kw.take("sep") {
                    None | Some(Value::None) => " ".to_string(),
                    Some(v) => to_str(self.heap, &v)?,
                };
                let end = match kw.take("end") {
                    None | Some(Value::None) => "\n".to_string(),
                    Some(v) => to_str(self.heap, &v)?,
                };
                kw.take("flush");
                let mut line = String::new();
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        line.push_str(&sep);
                    }
                    line.push_str(&to_str(self.heap, arg)?);
                }
                line.push_str(&end);
                self.write_output(&line)?;
                Value::None
            }
            "len" => {
                arity(name, &args, 1, 1)?;
                Value::Int(self.length(&args[0])? as i64)
            }
            "int" => {
                arity(name, &args, 0, 2)?;
                let base = match kw.take("base").or_else(|| args.get(1).cloned()) {
                    Some(b) => Some(int_arg(self.heap, &b)?),
                    None => None,
                };
                match args.first() {
                    None => Value::Int(0),
                    Some(v) => Value::Int(self.to_int(v, base)?),
                }
            }
            "float" => {
                arity(name, &args, 0, 1)?;
                match args.first() {
                    None => Value::Float(0.0),
                    Some(Value::Str(s)) => {
                        let text = s.trim().replace('_', "");
                        let parsed = text.parse::<f64>().map_err(|_| {
                            Fault::value_error(format!(
                                "could not convert string to float: {}",
                                quote_str(s)
                            ))
                        })?;
                        Value::Float(parsed)
                    }
                    Some(v) => Value::Float(float_arg(self.heap, v)?),
                }
            }
            "str" => {
                arity(name, &args, 0, 1)?;
                match args.first() {
                    None => Value::str(""),
                    Some(Value::Str(s)) => Value::Str(s.clone()),
                    Some(v) => Value::str(to_str(self.heap, v)?),
                }
            }
            "bool" => {
                arity(name, &args, 0, 1)?;
                match args.first() {
                    None => Value::Bool(false),
                    Some(v) => Value::Bool(truthy(self.heap, v)?),
                }
            }
            "list" | "tuple" | "set" => {
                arity(name, &args, 0, 1)?;
                let items = match args.first() {
                    None => Vec::new(),
                    Some(v) => self.iterate(v)?,
                };
                match name {
                    "list" => self.heap.new_list(items)?,
                    "tuple" => self.heap.new_tuple(items)?,
                    _ => self.make_set(items)?,
                }
            }
            "dict" => {
                arity(name, &args, 0, 1)?;
                let mut dict = Dict::new();
                if let Some(source) = args.first() {
                    self.extend_dict(&mut dict, source)?;
                }
                for (key, value) in std::mem::take(&mut kw.0) {
                    let key: Arc<str> = Arc::from(key.as_str());
                    dict.insert(HashKey::Str(key.clone()), Value::Str(key), value);
                }
                self.heap.check_len(dict.len())?;
                self.heap.new_value(Object::Dict(dict))?
            }
            "range" => {
                arity(name, &args, 1, 3)?;
                let ints = args
                    .iter()
                    .map(|a| int_arg(self.heap, a))
                    .collect::<Result<Vec<_>, _>>()?;
                let (start, stop, step) = match ints.as_slice() {
                    [stop] => (0, *stop, 1),
                    [start, stop] => (*start, *stop, 1),
                    [start, stop, step] => (*start, *stop, *step),
                    _ => (0, 0, 1),
                };
                if step == 0 {
                    return Err(Fault::value_error("range() arg 3 must not be zero"));
                }
                Value::Range(RangeValue { start, stop, step })
            }
            "enumerate" => {
                arity(name, &args, 1, 2)?;
                let start = match kw.take("start").or_else(|| args.get(1).cloned()) {
                    Some(v) => int_arg(self.heap, &v)?,
                    None => 0,
                };
                let items = self.iterate(&args[0])?;
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.into_iter().enumerate() {
                    let index = start.checked_add(i as i64).ok_or_else(Fault::overflow)?;
                    out.push(self.pair(Value::Int(index), item)?);
                }
                self.heap.new_list(out)?
            }
            "zip" => {
                let mut columns = Vec::with_capacity(args.len());
                for arg in &args {
                    columns.push(self.iterate(arg)?);
                }
                let len = columns.iter().map(Vec::len).min().unwrap_or(0);
                let mut out = Vec::with_capacity(len);
                for i in 0..len {
                    let row = columns.iter().map(|c| c[i].clone()).collect();
                    out.push(self.heap.new_tuple(row)?);
                }
                self.heap.new_list(out)?
            }
            "map" => {
                arity(name, &args, 2, usize::MAX)?;
                let mut columns = Vec::with_capacity(args.len() - 1);
                for arg in &args[1..] {
                    columns.push(self.iterate(arg)?);
                }
                let len = columns.iter().map(Vec::len).min().unwrap_or(0);
                let mut out = Vec::with_capacity(len);
                for i in 0..len {
                    let row = columns.iter().map(|c| c[i].clone()).collect();
                    out.push(self.call_value(&args[0], row, Vec::new())?);
                }
                self.heap.new_list(out)?
            }
            "filter" => {
                arity(name, &args, 2, 2)?;
                let items = self.iterate(&args[1])?;
                let mut out = Vec::new();
                for item in items {
                    let keep = if args[0].is_none() {
                        item.clone()
                    } else {
                        self.call_value(&args[0], vec![item.clone()], Vec::new())?
                    };
                    if truthy(self.heap, &keep)? {
                        out.push(item);
                    }
                }
                self.heap.new_list(out)?
            }
            "sorted" => {
                arity(name, &args, 1, 1)?;
                let key = kw.take("key");
                let reverse = match kw.take("reverse") {
                    Some(v) => truthy(self.heap, &v)?,
                    None => false,
                };
                let items = self.iterate(&args[0])?;
                let sorted = self.sort_values(items, key, reverse)?;
                self.heap.new_list(sorted)?
            }
            "reversed" => {
                arity(name, &args, 1, 1)?;
                let mut items = self.iterate(&args[0])?;
                items.reverse();
                self.heap.new_list(items)?
            }
            "any" | "all" => {
                arity(name, &args, 1, 1)?;
                let want = name == "any";
                let mut result = !want;
                let mut items = self.loop_items(&args[0])?;
                while let Some(item) = items.next() {
                    self.budget.tick()?;
                    if truthy(self.heap, &item)? == want {
                        result = want;
                        break;
                    }
                }
                Value::Bool(result)
            }
            "abs" => {
                arity(name, &args, 1, 1)?;
                match as_num(&args[0]) {
                    Some(Num::Int(n)) => Value::Int(n.checked_abs().ok_or_else(Fault::overflow)?),
                    Some(Num::Float(f)) => Value::Float(f.abs()),
                    None => {
                        return Err(Fault::type_error(format!(
                            "bad operand type for abs(): '{}'",
                            type_name(self.heap, &args[0])
                        )))
                    }
                }
            }
            "round" => {
                arity(name, &args, 1, 2)?;
                let digits = match kw.take("ndigits").or_else(|| args.get(1).cloned()) {
                    None | Some(Value::None) => None,
                    Some(v) => Some(int_arg(self.heap, &v)?),
                };
                round_value(self.heap, &args[0], digits)?
            }
            "pow" => {
                arity(name, &args, 2, 3)?;
                match args.get(2) {
                    None | Some(Value::None) => self.binary_op(BinOp::Pow, &args[0], &args[1])?,
                    Some(m) => {
                        let base = int_arg(self.heap, &args[0])?;
                        let exp = int_arg(self.heap, &args[1])?;
                        let modulus = int_arg(self.heap, m)?;
                        Value::Int(mod_pow(base, exp, modulus)?)
                    }
                }
            }
            "divmod" => {
                arity(name, &args, 2, 2)?;
                let q = self.binary_op(BinOp::FloorDiv, &args[0], &args[1])?;
                let r = self.binary_op(BinOp::Mod, &args[0], &args[1])?;
                self.pair(q, r)?
            }
            "min" | "max" => {
                let key = kw.take("key");
                let default = kw.take("default");
                let want = if name == "min" {
                    Ordering::Less
                } else {
                    Ordering::Greater
                };
                self.min_max(name, args, key, default, want)?
            }
            "sum" => {
                arity(name, &args, 1, 2)?;
                let mut acc = match kw.take("start").or_else(|| args.get(1).cloned()) {
                    Some(v) => v,
                    None => Value::Int(0),
                };
                if matches!(acc, Value::Str(_)) {
                    return Err(Fault::type_error(
                        "sum() can't sum strings [use ''.join(seq) instead]",
                    ));
                }
                if let (Value::Range(range), Value::Int(start)) = (&args[0], &acc) {
                    let total = range.sum().and_then(|total| total.checked_add(*start));
                    return total.map(Value::Int).ok_or_else(Fault::overflow);
                }
                let mut items = self.loop_items(&args[0])?;
                while let Some(item) = items.next() {
                    self.budget.tick()?;
                    acc = self.binary_op(BinOp::Add, &acc, &item)?;
                }
                acc
            }
            "chr" => {
                arity(name, &args, 1, 1)?;
                let code = int_arg(self.heap, &args[0])?;
                let c = u32::try_from(code)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or_else(|| Fault::value_error("chr() arg not in range(0x110000)"))?;
                Value::str(String::from(c))
            }
            "ord" => {
                arity(name, &args, 1, 1)?;
                let s = str_arg(name, self.heap, &args[0])?;
                let mut chars = s.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Value::Int(c as i64),
                    _ => {
                        return Err(Fault::type_error(format!(
                            "ord() expected a character, but string of length {} found",
                            s.chars().count()
                        )))
                    }
                }
            }
            "hex" | "bin" | "oct" => {
                arity(name, &args, 1, 1)?;
                let n = int_arg(self.heap, &args[0])?;
                let sign = if n < 0 { "-" } else { "" };
                let mag = n.unsigned_abs();
                Value::str(match name {
                    "hex" => format!("{}0x{:x}", sign, mag),
                    "bin" => format!("{}0b{:b}", sign, mag),
                    _ => format!("{}0o{:o}", sign, mag),
                })
            }
            "repr" => {
                arity(name, &args, 1, 1)?;
                Value::str(repr(self.heap, &args[0])?)
            }
            "format" => {
                arity(name, &args, 1, 2)?;
                let spec = match args.get(1) {
                    Some(v) => str_arg(name, self.heap, v)?.to_string(),
                    None => String::new(),
                };
                Value::str(format_value(self.heap, &args[0], &spec)?)
            }
            "type" => {
                arity(name, &args, 1, 1)?;
                match &args[0] {
                    Value::Exception(exc) => Value::ExcType(exc.kind),
                    other => Value::Builtin(type_name(self.heap, other)),
                }
            }
            "isinstance" => {
                arity(name, &args, 2, 2)?;
                Value::Bool(self.is_instance(&args[0], &args[1])?)
            }
            "callable" => {
                arity(name, &args, 1, 1)?;
                let callable = match &args[0] {
                    Value::Builtin(_)
                    | Value::Method(_)
                    | Value::ExcType(_)
                    | Value::Host(_) => true,
                    Value::Ref(id) => matches!(self.heap.get(*id)?, Object::Function(_)),
                    _ => false,
                };
                Value::Bool(callable)
            }
            "hasattr" => {
                arity(name, &args, 2, 2)?;
                let attr = str_arg(name, self.heap, &args[1])?.to_string();
                Value::Bool(self.get_attr(&args[0], &attr).is_ok())
            }
            "getattr" => {
                arity(name, &args, 2, 3)?;
                let attr = str_arg(name, self.heap, &args[1])?.to_string();
                match (self.get_attr(&args[0], &attr), args.get(2)) {
                    (Ok(v), _) => v,
                    (Err(e), Some(default)) if e.kind == FaultKind::AttributeError => {
                        default.clone()
                    }
                    (Err(e), _) => return Err(e),
                }
            }
            "dir" => {
                arity(name, &args, 0, 1)?;
                let mut names: Vec<String> = match args.first() {
                    None => self.globals.keys().cloned().collect(),
                    Some(Value::Module(m)) => {
                        module_attrs(m).into_iter().map(String::from).collect()
                    }
                    Some(v) => {
                        let tn = type_name(self.heap, v);
                        method_names(tn)
                            .iter()
                            .filter(|m| {
                                method_capability(tn, m).is_some_and(|c| self.caps.contains(c))
                            })
                            .map(|m| m.to_string())
                            .collect()
                    }
                };
                names.sort();
                self.str_list(names)?
            }
            "hash" => {
                arity(name, &args, 1, 1)?;
                match hash_key(self.heap, &args[0])? {
                    HashKey::Int(n) => Value::Int(n),
                    key => {
                        let mut hasher = DefaultHasher::new();
                        key.hash(&mut hasher);
                        Value::Int(hasher.finish() as i64)
                    }
                }
            }
            other if is_type_name(other) => {
                return Err(Fault::type_error(format!(
                    "cannot create '{}' instances",
                    other
                )))
            }
            other => {
                return Err(Fault::new(
                    FaultKind::NameError,
                    format!("name '{}' is not defined", other),
                ))
            }
        };
        kw.finish(name)?;
        Ok(value)
    }

    fn length(&self, value: &Value) -> Result<usize, Fault> {
        match value {
            Value::Str(s) => Ok(s.chars().count()),
            Value::Range(r) => Ok(r.len()),
            Value::Ref(id) => match self.heap.get(*id)? {
                Object::List(items) | Object::Tuple(items) => Ok(items.len()),
                Object::Dict(d) => Ok(d.len()),
                Object::Set(s) => Ok(s.len()),
                other => Err(Fault::type_error(format!(
                    "object of type '{}' has no len()",
                    other.type_name()
                ))),
            },
            other => Err(Fault::type_error(format!(
                "object of type '{}' has no len()",
                type_name(self.heap, other)
            ))),
        }
    }

    fn to_int(&self, value: &Value, base: Option<i64>) -> Result<i64, Fault> {
        match value {
            Value::Str(s) => parse_int(s, base.unwrap_or(10)),
            _ if base.is_some() => Err(Fault::type_error(
                "int() can't convert non-string with explicit base",
            )),
            Value::Int(n) => Ok(*n),
            Value::Bool(b) => Ok(*b as i64),
            Value::Float(f) => float_to_int(*f),
            other => Err(Fault::type_error(format!(
                "int() argument must be a string or a number, not '{}'",
                type_name(self.heap, other)
            ))),
        }
    }

    fn make_set(&mut self, items: Vec<Value>) -> Result<Value, Fault> {
        let mut set = Set::new();
        for item in items {
            let key = hash_key(self.heap, &item)?;
            set.insert(key, item);
        }
        self.heap.new_value(Object::Set(set))
    }

    fn extend_dict(&mut self, dict: &mut Dict, source: &Value) -> Result<(), Fault> {
        if let Value::Ref(id) = source {
            if let Object::Dict(other) = self.heap.get(*id)? {
                for (k, v) in other.items() {
                    dict.insert(hash_key(self.heap, k)?, k.clone(), v.clone());
                }
                return Ok(());
            }
        }
        for (i, entry) in self.iterate(source)?.into_iter().enumerate() {
            let pair = self.iterate(&entry)?;
            let [key, value] = <[Value; 2]>::try_from(pair).map_err(|p| {
                Fault::value_error(format!(
                    "dictionary update sequence element #{} has length {}; 2 is required",
                    i,
                    p.len()
                ))
            })?;
            dict.insert(hash_key(self.heap, &key)?, key, value);
        }
        Ok(())
    }

    fn is_instance(&self, obj: &Value, class: &Value) -> Result<bool, Fault> {
        match class {
            Value::Builtin(tn) if is_type_name(tn) => {
                let actual = type_name(self.heap, obj);
                Ok(actual == *tn || (*tn == "int" && actual == "bool"))
            }
            Value::ExcType(kind) => Ok(match obj {
                Value::Exception(exc) => exc.kind == *kind || *kind == FaultKind::Exception,
                _ => false,
            }),
            Value::Ref(id) => match self.heap.get(*id)? {
                Object::Tuple(classes) => {
                    for c in classes {
                        if self.is_instance(obj, c)? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                _ => Err(Fault::type_error(
                    "isinstance() arg 2 must be a type or tuple of types",
                )),
            },
            _ => Err(Fault::type_error(
                "isinstance() arg 2 must be a type or tuple of types",
            )),
        }
    }

    /// Stable sort with an optional key function.
    fn sort_values(
        &mut self,
        items: Vec<Value>,
        key: Option<Value>,
        reverse: bool,
    ) -> Result<Vec<Value>, Fault> {
        let mut keyed = Vec::with_capacity(items.len());
        for item in items {
            let k = match &key {
                Some(func) if !func.is_none() => {
                    self.call_value(func, vec![item.clone()], Vec::new())?
                }
                _ => item.clone(),
            };
            keyed.push((k, item));
        }
        self.budget.charge(keyed.len() as u64)?;
        let heap = &*self.heap;
        let mut failure = None;
        keyed.sort_by(|a, b| {
            let ord = match compare(heap, &a.0, &b.0) {
                Ok(ord) => ord,
                Err(e) => {
                    failure.get_or_insert(e);
                    Ordering::Equal
                }
            };
            if reverse {
                ord.reverse()
            } else {
                ord
            }
        });
        if let Some(e) = failure {
            return Err(e);
        }
        Ok(keyed.into_iter().map(|(_, v)| v).collect())
    }

    fn min_max(
        &mut self,
        func: &str,
        args: Vec<Value>,
        key: Option<Value>,
        default: Option<Value>,
        want: Ordering,
    ) -> Result<Value, Fault> {
        let keyed = key.as_ref().is_some_and(|f| !f.is_none());
        let mut items = match args.len() {
            0 => return Err(Fault::type_error(format!("{}() expected at least 1 argument", func))),
            1 => match &args[0] {
                Value::Range(range) if !keyed => {
                    let found = range.bounds().map(|(lo, hi)| {
                        Value::Int(if want == Ordering::Less { lo } else { hi })
                    });
                    return found.or(default).ok_or_else(|| {
                        Fault::value_error(format!("{}() arg is an empty sequence", func))
                    });
                }
                other => self.loop_items(other)?,
            },
            _ => LoopItems::Items(args, 0),
        };
        let mut best: Option<(Value, Value)> = None;
        while let Some(item) = items.next() {
            self.budget.tick()?;
            let k = match &key {
                Some(f) if !f.is_none() => self.call_value(f, vec![item.clone()], Vec::new())?,
                _ => item.clone(),
            };
            let better = match &best {
                None => true,
                Some((best_key, _)) => compare(self.heap, &k, best_key)? == want,
            };
            if better {
                best = Some((k, item));
            }
        }
        match (best, default) {
            (Some((_, v)), _) => Ok(v),
            (None, Some(d)) => Ok(d),
            (None, None) => Err(Fault::value_error(format!(
                "{}() arg is an empty sequence",
                func
            ))),
        }
    }

    // ---- modules ----

    fn call_math(
        &mut self,
        func: &str,
        args: Vec<Value>,
        kw: &mut Kwargs,
    ) -> Result<Value, Fault> {
        let value = match func {
            "sqrt" => {
                let x = unary_arg(func, self.heap, &args)?;
                if x < 0.0 {
                    return Err(math_domain());
                }
                Value::Float(x.sqrt())
            }
            "floor" | "ceil" | "trunc" => {
                arity(func, &args, 1, 1)?;
                if let Some(n) = as_int(&args[0]) {
                    return Ok(Value::Int(n));
                }
                let x = float_arg(self.heap, &args[0])?;
                let r = match func {
                    "floor" => x.floor(),
                    "ceil" => x.ceil(),
                    _ => x.trunc(),
                };
                Value::Int(float_to_int(r)?)
            }
            "log" => {
                arity(func, &args, 1, 2)?;
                let x = float_arg(self.heap, &args[0])?;
                if x <= 0.0 {
                    return Err(math_domain());
                }
                match args.get(1) {
                    None => Value::Float(x.ln()),
                    Some(b) => {
                        let base = float_arg(self.heap, b)?;
                        if base <= 0.0 || base == 1.0 {
                            return Err(math_domain());
                        }
                        Value::Float(x.ln() / base.ln())
                    }
                }
            }
            "log2" | "log10" => {
                let x = unary_arg(func, self.heap, &args)?;
                if x <= 0.0 {
                    return Err(math_domain());
                }
                Value::Float(if func == "log2" { x.log2() } else { x.log10() })
            }
            "exp" => {
                let r = unary_arg(func, self.heap, &args)?.exp();
                if r.is_infinite() {
                    return Err(Fault::new(FaultKind::OverflowError, "math range error"));
                }
                Value::Float(r)
            }
            "sin" => Value::Float(unary_arg(func, self.heap, &args)?.sin()),
            "cos" => Value::Float(unary_arg(func, self.heap, &args)?.cos()),
            "tan" => Value::Float(unary_arg(func, self.heap, &args)?.tan()),
            "atan" => Value::Float(unary_arg(func, self.heap, &args)?.atan()),
            "asin" | "acos" => {
                let x = unary_arg(func, self.heap, &args)?;
                if !(-1.0..=1.0).contains(&x) {
                    return Err(math_domain());
                }
                Value::Float(if func == "asin" { x.asin() } else { x.acos() })
            }
            "fabs" => Value::Float(unary_arg(func, self.heap, &args)?.abs()),
            "degrees" => Value::Float(unary_arg(func, self.heap, &args)?.to_degrees()),
            "radians" => Value::Float(unary_arg(func, self.heap, &args)?.to_radians()),
            "isfinite" => Value::Bool(unary_arg(func, self.heap, &args)?.is_finite()),
            "isinf" => Value::Bool(unary_arg(func, self.heap, &args)?.is_infinite()),
            "isnan" => Value::Bool(unary_arg(func, self.heap, &args)?.is_nan()),
            "atan2" | "pow" | "copysign" => {
                arity(func, &args, 2, 2)?;
                let x = float_arg(self.heap, &args[0])?;
                let y = float_arg(self.heap, &args[1])?;
                match func {
                    "atan2" => Value::Float(x.atan2(y)),
                    "copysign" => Value::Float(x.copysign(y)),
                    _ => numeric_op(BinOp::Pow, Num::Float(x), Num::Float(y))?,
                }
            }
            "hypot" => {
                let mut sum = 0.0;
                for a in &args {
                    let x = float_arg(self.heap, a)?;
                    sum += x * x;
                }
                Value::Float(sum.sqrt())
            }
            "isclose" => {
                arity(func, &args, 2, 2)?;
                let a = float_arg(self.heap, &args[0])?;
                let b = float_arg(self.heap, &args[1])?;
                let rel = match kw.take("rel_tol") {
                    Some(v) => float_arg(self.heap, &v)?,
                    None => 1e-9,
                };
                let abs = match kw.take("abs_tol") {
                    Some(v) => float_arg(self.heap, &v)?,
                    None => 0.0,
                };
                let close = a == b || (a - b).abs() <= (rel * a.abs().max(b.abs())).max(abs);
                Value::Bool(close)
            }
            "gcd" => {
                let mut acc: i64 = 0;
                for a in &args {
                    let mut x = int_arg(self.heap, a)?.checked_abs().ok_or_else(Fault::overflow)?;
                    let mut y = acc;
                    while y != 0 {
                        let t = x % y;
                        x = y;
                        y = t;
                    }
                    acc = x;
                }
                Value::Int(acc)
            }
            "factorial" => {
                arity(func, &args, 1, 1)?;
                let n = int_arg(self.heap, &args[0])?;
                if n < 0 {
                    return Err(Fault::value_error(
                        "factorial() not defined for negative values",
                    ));
                }
                let mut acc: i64 = 1;
                for i in 2..=n {
                    self.budget.tick()?;
                    acc = acc.checked_mul(i).ok_or_else(Fault::overflow)?;
                }
                Value::Int(acc)
            }
            "prod" => {
                arity(func, &args, 1, 1)?;
                let mut acc = kw.take("start").unwrap_or(Value::Int(1));
                for item in self.iterate(&args[0])? {
                    acc = self.binary_op(BinOp::Mul, &acc, &item)?;
                }
                acc
            }
            other => {
                return Err(Fault::new(
                    FaultKind::AttributeError,
                    format!("module 'math' has no attribute '{}'", other),
                ))
            }
        };
        Ok(value)
    }

    fn call_json(
        &mut self,
        func: &str,
        args: Vec<Value>,
        kw: &mut Kwargs,
    ) -> Result<Value, Fault> {
        arity(func, &args, 1, 1)?;
        match func {
            "dumps" => {
                let indent = match kw.take("indent") {
                    None | Some(Value::None) => None,
                    Some(v) => Some(int_arg(self.heap, &v)?.max(0) as usize),
                };
                let sort_keys = match kw.take("sort_keys") {
                    Some(v) => truthy(self.heap, &v)?,
                    None => false,
                };
                let json = to_json(self.heap, &args[0])?;
                let mut out = String::new();
                write_json(self.heap, &json, indent, sort_keys, 0, &mut out)?;
                Ok(Value::str(out))
            }
            "loads" => {
                let text = str_arg(func, self.heap, &args[0])?;
                let json: serde_json::Value = serde_json::from_str(text)
                    .map_err(|e| Fault::value_error(format!("invalid JSON: {}", e)))?;
                from_json(self.heap, &json)
            }
            other => Err(Fault::new(
                FaultKind::AttributeError,
                format!("module 'json' has no attribute '{}'", other),
            )),
        }
    }

    // ---- methods ----

    pub(super) fn call_method(
        &mut self,
        receiver: &Value,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, Fault> {
        let tn = type_name(self.heap, receiver);
        match method_capability(tn, name) {
            Some(cap) if self.caps.contains(cap) => {}
            _ => {
                let attr = self.get_attr(receiver, name)?;
                return self.call_value(&attr, args, kwargs);
            }
        }
        self.budget.tick()?;
        let mut kw = Kwargs(kwargs);
        let value = match receiver {
            Value::Str(s) => self.str_method(s.clone(), name, args, &mut kw)?,
            Value::Float(f) => Value::Bool(f.is_finite() && f.fract() == 0.0),
            Value::Int(n) => Value::Int(64 - n.unsigned_abs().leading_zeros() as i64),
            Value::Ref(id) => match tn {
                "list" => self.list_method(*id, name, args, &mut kw)?,
                "tuple" => self.tuple_method(*id, name, args)?,
                "dict" => self.dict_method(*id, name, args, &mut kw)?,
                _ => self.set_method(*id, name, args)?,
            },
            _ => Value::None,
        };
        kw.finish(name)?;
        Ok(value)
    }

    fn str_method(
        &mut self,
        s: Arc<str>,
        name: &str,
        args: Vec<Value>,
        kw: &mut Kwargs,
    ) -> Result<Value, Fault> {
        let heap = &*self.heap;
        let opt_str = |i: usize| -> Result<Option<&str>, Fault> {
            match args.get(i) {
                None | Some(Value::None) => Ok(None),
                Some(v) => str_arg(name, heap, v).map(Some),
            }
        };
        let value = match name {
            "upper" => Value::str(s.to_uppercase()),
            "lower" => Value::str(s.to_lowercase()),
            "title" => Value::str(title_case(&s)),
            "capitalize" => {
                let mut chars = s.chars();
                let out: String = match chars.next() {
                    Some(first) => first
                        .to_uppercase()
                        .chain(chars.as_str().to_lowercase().chars())
                        .collect(),
                    None => String::new(),
                };
                Value::str(out)
            }
            "swapcase" => Value::str(
                s.chars()
                    .flat_map(|c| -> Vec<char> {
                        if c.is_uppercase() {
                            c.to_lowercase().collect()
                        } else {
                            c.to_uppercase().collect()
                        }
                    })
                    .collect::<String>(),
            ),
            "strip" | "lstrip" | "rstrip" => {
                arity(name, &args, 0, 1)?;
                let chars: Option<Vec<char>> = opt_str(0)?.map(|c| c.chars().collect());
                let matcher = |c: char| match &chars {
                    Some(set) => set.contains(&c),
                    None => c.is_whitespace(),
                };
                Value::str(match name {
                    "strip" => s.trim_matches(matcher),
                    "lstrip" => s.trim_start_matches(matcher),
                    _ => s.trim_end_matches(matcher),
                })
            }
            "split" | "rsplit" => {
                arity(name, &args, 0, 2)?;
                let sep = match kw.take("sep") {
                    Some(Value::None) | None => opt_str(0)?.map(String::from),
                    Some(v) => Some(str_arg(name, heap, &v)?.to_string()),
                };
                let maxsplit = match kw.take("maxsplit").or_else(|| args.get(1).cloned()) {
                    Some(v) => int_arg(heap, &v)?,
                    None => -1,
                };
                let parts: Vec<String> = match sep.as_deref() {
                    Some("") => return Err(Fault::value_error("empty separator")),
                    None if name == "split" => split_whitespace_n(&s, maxsplit),
                    None => rsplit_whitespace_n(&s, maxsplit),
                    Some(sep) if maxsplit < 0 => s.split(sep).map(String::from).collect(),
                    Some(sep) if name == "split" => s
                        .splitn(maxsplit as usize + 1, sep)
                        .map(String::from)
                        .collect(),
                    Some(sep) => {
                        let mut parts: Vec<String> = s
                            .rsplitn(maxsplit as usize + 1, sep)
                            .map(String::from)
                            .collect();
                        parts.reverse();
                        parts
                    }
                };
                self.heap.check_len(parts.len())?;
                return self.str_list(parts);
            }
            "splitlines" => {
                let parts: Vec<String> = s.lines().map(String::from).collect();
                return self.str_list(parts);
            }
            "join" => {
                arity(name, &args, 1, 1)?;
                let items = self.iterate(&args[0])?;
                let mut out = String::new();
                for (i, item) in items.iter().enumerate() {
                    let Value::Str(part) = item else {
                        return Err(Fault::type_error(format!(
                            "sequence item {}: expected str instance, {} found",
                            i,
                            type_name(self.heap, item)
                        )));
                    };
                    if i > 0 {
                        out.push_str(&s);
                    }
                    out.push_str(part);
                    self.heap.check_str_len(out.len())?;
                }
                Value::str(out)
            }
            "replace" => {
                arity(name, &args, 2, 3)?;
                let old = str_arg(name, heap, &args[0])?;
                let new = str_arg(name, heap, &args[1])?;
                let count = match args.get(2) {
                    Some(v) => int_arg(heap, v)?,
                    None => -1,
                };
                let estimate = s.len() + s.matches(old).count().saturating_mul(new.len());
                heap.check_str_len(estimate)?;
                Value::str(if count < 0 {
                    s.replace(old, new)
                } else {
                    s.replacen(old, new, count as usize)
                })
            }
            "startswith" | "endswith" => {
                arity(name, &args, 1, 1)?;
                let candidates: Vec<Value> = match &args[0] {
                    Value::Str(_) => vec![args[0].clone()],
                    Value::Ref(id) => match heap.get(*id)? {
                        Object::Tuple(items) => items.clone(),
                        _ => vec![args[0].clone()],
                    },
                    other => vec![other.clone()],
                };
                let mut hit = false;
                for c in &candidates {
                    let affix = str_arg(name, heap, c)?;
                    if (name == "startswith" && s.starts_with(affix))
                        || (name == "endswith" && s.ends_with(affix))
                    {
                        hit = true;
                        break;
                    }
                }
                Value::Bool(hit)
            }
            "find" | "rfind" | "index" | "rindex" => {
                arity(name, &args, 1, 3)?;
                let sub = str_arg(name, heap, &args[0])?;
                let lo = match args.get(1) {
                    Some(v) if !v.is_none() => Some(int_arg(heap, v)?),
                    _ => None,
                };
                let hi = match args.get(2) {
                    Some(v) if !v.is_none() => Some(int_arg(heap, v)?),
                    _ => None,
                };
                let start = byte_offset(&s, lo, 0);
                let end = byte_offset(&s, hi, s.len()).max(start);
                let window = &s[start..end];
                let found = if name.starts_with('r') {
                    window.rfind(sub)
                } else {
                    window.find(sub)
                };
                match found {
                    Some(b) => Value::Int(char_index(&s, start + b)),
                    None if name.ends_with("find") => Value::Int(-1),
                    None => return Err(Fault::value_error("substring not found")),
                }
            }
            "count" => {
                arity(name, &args, 1, 1)?;
                let sub = str_arg(name, heap, &args[0])?;
                Value::Int(if sub.is_empty() {
                    s.chars().count() as i64 + 1
                } else {
                    s.matches(sub).count() as i64
                })
            }
            "format" => {
                let named = std::mem::take(&mut kw.0);
                Value::str(str_format(heap, &s, &args, &named)?)
            }
            "isdigit" | "isnumeric" | "isdecimal" => {
                Value::Bool(!s.is_empty() && s.chars().all(|c| c.is_numeric()))
            }
            "isalpha" => Value::Bool(!s.is_empty() && s.chars().all(char::is_alphabetic)),
            "isalnum" => Value::Bool(!s.is_empty() && s.chars().all(char::is_alphanumeric)),
            "isspace" => Value::Bool(!s.is_empty() && s.chars().all(char::is_whitespace)),
            "isupper" | "islower" => {
                let cased: Vec<char> = s.chars().filter(|c| c.is_alphabetic()).collect();
                let check = |c: &char| {
                    if name == "isupper" {
                        c.is_uppercase()
                    } else {
                        c.is_lowercase()
                    }
                };
                Value::Bool(!cased.is_empty() && cased.iter().all(check))
            }
            "center" | "ljust" | "rjust" => {
                arity(name, &args, 1, 2)?;
                let width = int_arg(heap, &args[0])?.max(0) as usize;
                heap.check_str_len(width)?;
                let fill = match opt_str(1)? {
                    Some(f) if f.chars().count() == 1 => f.chars().next().unwrap_or(' '),
                    Some(_) => {
                        return Err(Fault::type_error(
                            "The fill character must be exactly one character long",
                        ))
                    }
                    None => ' ',
                };
                let align = match name {
                    "center" => '^',
                    "ljust" => '<',
                    _ => '>',
                };
                Value::str(pad(s.to_string(), width, align, fill))
            }
            "zfill" => {
                arity(name, &args, 1, 1)?;
                let width = int_arg(heap, &args[0])?.max(0) as usize;
                heap.check_str_len(width)?;
                let len = s.chars().count();
                if len >= width {
                    Value::Str(s.clone())
                } else {
                    let (sign, body) = match s.chars().next() {
                        Some(c @ ('+' | '-')) => (c.to_string(), &s[1..]),
                        _ => (String::new(), &s[..]),
                    };
                    Value::str(format!("{}{}{}", sign, "0".repeat(width - len), body))
                }
            }
            "partition" | "rpartition" => {
                arity(name, &args, 1, 1)?;
                let sep = str_arg(name, heap, &args[0])?;
                if sep.is_empty() {
                    return Err(Fault::value_error("empty separator"));
                }
                let found = if name == "partition" {
                    s.split_once(sep)
                } else {
                    s.rsplit_once(sep)
                };
                let parts = match found {
                    Some((a, b)) => [a.to_string(), sep.to_string(), b.to_string()],
                    None if name == "partition" => [s.to_string(), String::new(), String::new()],
                    None => [String::new(), String::new(), s.to_string()],
                };
                let items = parts.into_iter().map(Value::str).collect();
                return self.heap.new_tuple(items);
            }
            "removeprefix" | "removesuffix" => {
                arity(name, &args, 1, 1)?;
                let affix = str_arg(name, heap, &args[0])?;
                let stripped = if name == "removeprefix" {
                    s.strip_prefix(affix)
                } else {
                    s.strip_suffix(affix)
                };
                match stripped {
                    Some(rest) => Value::str(rest),
                    None => Value::Str(s.clone()),
                }
            }
            _ => Value::None,
        };
        Ok(value)
    }

    fn list_items(&self, id: ObjId) -> Result<Vec<Value>, Fault> {
        match self.heap.get(id)? {
            Object::List(items) | Object::Tuple(items) => Ok(items.clone()),
            _ => Ok(Vec::new()),
        }
    }

    fn list_mut(&mut self, id: ObjId) -> Result<&mut Vec<Value>, Fault> {
        match self.heap.get_mut(id)? {
            Object::List(items) => Ok(items),
            other => Err(Fault::type_error(format!(
                "'{}' object is not a list",
                other.type_name()
            ))),
        }
    }

    fn position(&self, items: &[Value], needle: &Value) -> Result<Option<usize>, Fault> {
        for (i, item) in items.iter().enumerate() {
            if values_eq(self.heap, item, needle)? {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    fn count_of(&self, items: &[Value], needle: &Value) -> Result<i64, Fault> {
        let mut n = 0;
        for item in items {
            if values_eq(self.heap, item, needle)? {
                n += 1;
            }
        }
        Ok(n)
    }

    fn list_method(
        &mut self,
        id: ObjId,
        name: &str,
        args: Vec<Value>,
        kw: &mut Kwargs,
    ) -> Result<Value, Fault> {
        match name {
            "append" => {
                arity(name, &args, 1, 1)?;
                let len = self.list_items(id)?.len();
                self.heap.check_len(len + 1)?;
                let mut args = args;
                self.list_mut(id)?.append(&mut args);
            }
            "extend" => {
                arity(name, &args, 1, 1)?;
                let extra = self.iterate(&args[0])?;
                let len = self.list_items(id)?.len();
                self.heap.check_len(len + extra.len())?;
                self.list_mut(id)?.extend(extra);
            }
            "insert" => {
                arity(name, &args, 2, 2)?;
                let index = int_arg(self.heap, &args[0])?;
                let len = self.list_items(id)?.len();
                self.heap.check_len(len + 1)?;
                let at = if index < 0 {
                    (index + len as i64).max(0) as usize
                } else {
                    (index as usize).min(len)
                };
                self.list_mut(id)?.insert(at, args[1].clone());
            }
            "pop" => {
                arity(name, &args, 0, 1)?;
                let index = match args.first() {
                    Some(v) => int_arg(self.heap, v)?,
                    None => -1,
                };
                let items = self.list_mut(id)?;
                if items.is_empty() {
                    return Err(Fault::index_error("pop from empty list"));
                }
                let at = norm_index(index, items.len())
                    .ok_or_else(|| Fault::index_error("pop index out of range"))?;
                return Ok(items.remove(at));
            }
            "remove" => {
                arity(name, &args, 1, 1)?;
                let items = self.list_items(id)?;
                let at = self
                    .position(&items, &args[0])?
                    .ok_or_else(|| Fault::value_error("list.remove(x): x not in list"))?;
                self.list_mut(id)?.remove(at);
            }
            "index" | "count" => return self.tuple_method(id, name, args),
            "sort" => {
                arity(name, &args, 0, 0)?;
                let key = kw.take("key");
                let reverse = match kw.take("reverse") {
                    Some(v) => truthy(self.heap, &v)?,
                    None => false,
                };
                let items = self.list_items(id)?;
                let sorted = self.sort_values(items, key, reverse)?;
                *self.list_mut(id)? = sorted;
            }
            "reverse" => self.list_mut(id)?.reverse(),
            "clear" => self.list_mut(id)?.clear(),
            "copy" => {
                let items = self.list_items(id)?;
                return self.heap.new_list(items);
            }
            _ => {}
        }
        Ok(Value::None)
    }

    fn tuple_method(&mut self, id: ObjId, name: &str, args: Vec<Value>) -> Result<Value, Fault> {
        arity(name, &args, 1, 1)?;
        let items = self.list_items(id)?;
        if name == "count" {
            return Ok(Value::Int(self.count_of(&items, &args[0])?));
        }
        match self.position(&items, &args[0])? {
            Some(i) => Ok(Value::Int(i as i64)),
            None => Err(Fault::value_error(format!(
                "{} is not in {}",
                repr(self.heap, &args[0])?,
                self.heap.get(id)?.type_name()
            ))),
        }
    }

    fn dict_ref(&self, id: ObjId) -> Result<&Dict, Fault> {
        match self.heap.get(id)? {
            Object::Dict(d) => Ok(d),
            other => Err(Fault::type_error(format!(
                "'{}' object is not a dict",
                other.type_name()
            ))),
        }
    }

    fn dict_mut(&mut self, id: ObjId) -> Result<&mut Dict, Fault> {
        match self.heap.get_mut(id)? {
            Object::Dict(d) => Ok(d),
            other => Err(Fault::type_error(format!(
                "'{}' object is not a dict",
                other.type_name()
            ))),
        }
    }

    fn dict_method(
        &mut self,
        id: ObjId,
        name: &str,
        args: Vec<Value>,
        kw: &mut Kwargs,
    ) -> Result<Value, Fault> {
        let value = match name {
            "get" => {
                arity(name, &args, 1, 2)?;
                let hash = hash_key(self.heap, &args[0])?;
                match self.dict_ref(id)?.get(&hash) {
                    Some(v) => v.clone(),
                    None => args.get(1).cloned().unwrap_or(Value::None),
                }
            }
            "keys" | "values" => {
                let dict = self.dict_ref(id)?;
                let items: Vec<Value> = if name == "keys" {
                    dict.keys().cloned().collect()
                } else {
                    dict.values().cloned().collect()
                };
                self.heap.new_list(items)?
            }
            "items" => {
                let pairs: Vec<(Value, Value)> = self
                    .dict_ref(id)?
                    .items()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                let mut out = Vec::with_capacity(pairs.len());
                for (k, v) in pairs {
                    out.push(self.pair(k, v)?);
                }
                self.heap.new_list(out)?
            }
            "pop" => {
                arity(name, &args, 1, 2)?;
                let hash = hash_key(self.heap, &args[0])?;
                if !self.dict_ref(id)?.contains(&hash) {
                    return match args.get(1) {
                        Some(default) => Ok(default.clone()),
                        None => Err(Fault::new(FaultKind::KeyError, repr(self.heap, &args[0])?)),
                    };
                }
                match self.dict_mut(id)?.remove(&hash) {
                    Some((_, v)) => v,
                    None => Value::None,
                }
            }
            "popitem" => match self.dict_mut(id)?.pop_last() {
                Some((k, v)) => self.pair(k, v)?,
                None => {
                    return Err(Fault::new(
                        FaultKind::KeyError,
                        "'popitem(): dictionary is empty'",
                    ))
                }
            },
            "setdefault" => {
                arity(name, &args, 1, 2)?;
                let hash = hash_key(self.heap, &args[0])?;
                if let Some(v) = self.dict_ref(id)?.get(&hash) {
                    return Ok(v.clone());
                }
                let default = args.get(1).cloned().unwrap_or(Value::None);
                let len = self.dict_ref(id)?.len();
                self.heap.check_len(len + 1)?;
                self.dict_mut(id)?
                    .insert(hash, args[0].clone(), default.clone());
                default
            }
            "update" => {
                arity(name, &args, 0, 1)?;
                let mut incoming = Dict::new();
                if let Some(source) = args.first() {
                    self.extend_dict(&mut incoming, source)?;
                }
                for (key, value) in std::mem::take(&mut kw.0) {
                    let key: Arc<str> = Arc::from(key.as_str());
                    incoming.insert(HashKey::Str(key.clone()), Value::Str(key), value);
                }
                let len = self.dict_ref(id)?.len();
                self.heap.check_len(len + incoming.len())?;
                let mut keyed = Vec::with_capacity(incoming.len());
                for (k, v) in incoming.items() {
                    keyed.push((hash_key(self.heap, k)?, k.clone(), v.clone()));
                }
                let dict = self.dict_mut(id)?;
                for (hash, k, v) in keyed {
                    dict.insert(hash, k, v);
                }
                Value::None
            }
            "clear" => {
                self.dict_mut(id)?.clear();
                Value::None
            }
            "copy" => {
                let copy = self.dict_ref(id)?.clone();
                self.heap.new_value(Object::Dict(copy))?
            }
            _ => Value::None,
        };
        Ok(value)
    }

    fn set_ref(&self, id: ObjId) -> Result<&Set, Fault> {
        match self.heap.get(id)? {
            Object::Set(s) => Ok(s),
            other => Err(Fault::type_error(format!(
                "'{}' object is not a set",
                other.type_name()
            ))),
        }
    }

    fn set_mut(&mut self, id: ObjId) -> Result<&mut Set, Fault> {
        match self.heap.get_mut(id)? {
            Object::Set(s) => Ok(s),
            other => Err(Fault::type_error(format!(
                "'{}' object is not a set",
                other.type_name()
            ))),
        }
    }

    fn hashed(&mut self, value: &Value) -> Result<Vec<(HashKey, Value)>, Fault> {
        let items = self.iterate(value)?;
        items
            .into_iter()
            .map(|v| Ok((hash_key(self.heap, &v)?, v)))
            .collect()
    }

    fn set_method(&mut self, id: ObjId, name: &str, args: Vec<Value>) -> Result<Value, Fault> {
        let value = match name {
            "add" | "remove" | "discard" => {
                arity(name, &args, 1, 1)?;
                let hash = hash_key(self.heap, &args[0])?;
                if name == "add" {
                    let len = self.set_ref(id)?.len();
                    self.heap.check_len(len + 1)?;
                    self.set_mut(id)?.insert(hash, args[0].clone());
                } else {
                    let removed = self.set_mut(id)?.remove(&hash);
                    if removed.is_none() && name == "remove" {
                        return Err(Fault::new(FaultKind::KeyError, repr(self.heap, &args[0])?));
                    }
                }
                Value::None
            }
            "pop" => match self.set_mut(id)?.pop_first() {
                Some(v) => v,
                None => {
                    return Err(Fault::new(FaultKind::KeyError, "'pop from an empty set'"))
                }
            },
            "clear" => {
                self.set_mut(id)?.clear();
                Value::None
            }
            "copy" => {
                let copy = self.set_ref(id)?.clone();
                self.heap.new_value(Object::Set(copy))?
            }
            "update" => {
                let mut incoming = Vec::new();
                for arg in &args {
                    incoming.extend(self.hashed(arg)?);
                }
                let len = self.set_ref(id)?.len();
                self.heap.check_len(len + incoming.len())?;
                let set = self.set_mut(id)?;
                for (hash, v) in incoming {
                    set.insert(hash, v);
                }
                Value::None
            }
            "union" | "intersection" | "difference" | "symmetric_difference" => {
                let mut result = self.set_ref(id)?.clone();
                for arg in &args {
                    let other = self.hashed(arg)?;
                    result = match name {
                        "union" => {
                            for (hash, v) in other {
                                result.insert(hash, v);
                            }
                            result
                        }
                        "intersection" => {
                            let keep: Vec<HashKey> = other.into_iter().map(|(h, _)| h).collect();
                            let mut out = Set::new();
                            for (hash, v) in result.iter() {
                                if keep.contains(hash) {
                                    out.insert(hash.clone(), v.clone());
                                }
                            }
                            out
                        }
                        "difference" => {
                            for (hash, _) in other {
                                result.remove(&hash);
                            }
                            result
                        }
                        _ => {
                            for (hash, v) in other {
                                if result.remove(&hash).is_none() {
                                    result.insert(hash, v);
                                }
                            }
                            result
                        }
                    };
                }
                self.heap.check_len(result.len())?;
                self.heap.new_value(Object::Set(result))?
            }
            "issubset" | "issuperset" | "isdisjoint" => {
                arity(name, &args, 1, 1)?;
                let other: Vec<HashKey> = self.hashed(&args[0])?.into_iter().map(|(h, _)| h).collect();
                let mine = self.set_ref(id)?;
                let answer = match name {
                    "issubset" => mine.iter().all(|(h, _)| other.contains(h)),
                    "issuperset" => other.iter().all(|h| mine.contains(h)),
                    _ => !other.iter().any(|h| mine.contains(h)),
                };
                Value::Bool(answer)
            }
            _ => Value::None,
        };
        Ok(value)
    }
}

fn parse_int(text: &str, base: i64) -> Result<i64, Fault> {
    let invalid = || {
        Fault::value_error(format!(
            "invalid literal for int() with base {}: {}",
            base,
            quote_str(text)
        ))
    };
    let trimmed = text.trim();
    let (negative, body) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let lower = body.to_ascii_lowercase();
    let (radix, digits) = match base {
        0 | 16 if lower.starts_with("0x") => (16, &body[2..]),
        0 | 8 if lower.starts_with("0o") => (8, &body[2..]),
        0 | 2 if lower.starts_with("0b") => (2, &body[2..]),
        0 => (10, body),
        2..=36 => (base as u32, body),
        _ => return Err(Fault::value_error("int() base must be >= 2 and <= 36, or 0")),
    };
    if digits.is_empty() || digits.starts_with('_') || digits.ends_with('_') || digits.contains("__")
    {
        return Err(invalid());
    }
    let digits = digits.replace('_', "");
    let magnitude = u64::from_str_radix(&digits, radix).map_err(|_| invalid())?;
    let value = if negative {
        0i64.checked_sub_unsigned(magnitude)
    } else {
        i64::try_from(magnitude).ok()
    };
    value.ok_or_else(Fault::overflow)
}

fn round_value(heap: &Heap, value: &Value, digits: Option<i64>) -> Result<Value, Fault> {
    match (as_num(value), digits) {
        (Some(Num::Int(n)), None) => Ok(Value::Int(n)),
        (Some(Num::Int(n)), Some(d)) if d >= 0 => Ok(Value::Int(n)),
        (Some(Num::Int(n)), Some(d)) => {
            let scale = 10i64.checked_pow((-d) as u32).ok_or_else(Fault::overflow)?;
            let rounded = (n as f64 / scale as f64).round_ties_even() as i64;
            Ok(Value::Int(rounded.checked_mul(scale).ok_or_else(Fault::overflow)?))
        }
        (Some(Num::Float(f)), None) => Ok(Value::Int(float_to_int(f.round_ties_even())?)),
        (Some(Num::Float(f)), Some(d)) => {
            if !f.is_finite() {
                return Ok(Value::Float(f));
            }
            let d = d.clamp(-308, 308) as i32;
            let scale = 10f64.powi(d);
            let scaled = f * scale;
            if !scaled.is_finite() {
                return Ok(Value::Float(f));
            }
            Ok(Value::Float(scaled.round_ties_even() / scale))
        }
        (None, _) => Err(Fault::type_error(format!(
            "type {} doesn't define __round__ method",
            type_name(heap, value)
        ))),
    }
}

fn mod_pow(base: i64, exp: i64, modulus: i64) -> Result<i64, Fault> {
    if modulus == 0 {
        return Err(Fault::value_error("pow() 3rd argument cannot be 0"));
    }
    if exp < 0 {
        return Err(Fault::value_error(
            "pow() 2nd argument cannot be negative when 3rd argument specified",
        ));
    }
    let m = modulus as i128;
    let mut result: i128 = 1;
    let mut b = (base as i128).rem_euclid(m);
    let mut e = exp;
    while e > 0 {
        if e & 1 == 1 {
            result = result * b % m;
        }
        b = b * b % m;
        e >>= 1;
    }
    let mut r = result.rem_euclid(m);
    if modulus < 0 && r != 0 {
        r += m;
    }
    Ok(r as i64)
}

/// Writes JSON with Python's separators, failing once `out` passes the
/// heap's string limit.
fn write_json(
    heap: &Heap,
    value: &serde_json::Value,
    indent: Option<usize>,
    sort: bool,
    level: usize,
    out: &mut String,
) -> Result<(), Fault> {
    use serde_json::Value as J;
    let newline = |out: &mut String, level: usize| -> Result<(), Fault> {
        if let Some(n) = indent {
            let width = n.saturating_mul(level);
            heap.check_str_len(out.len().saturating_add(width))?;
            out.push('\n');
            out.push_str(&" ".repeat(width));
        }
        Ok(())
    };
    let item_sep = if indent.is_some() { "," } else { ", " };
    match value {
        J::Array(items) if items.is_empty() => out.push_str("[]"),
        J::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(item_sep);
                }
                newline(out, level + 1)?;
                write_json(heap, item, indent, sort, level + 1, out)?;
            }
            newline(out, level)?;
            out.push(']');
        }
        J::Object(map) if map.is_empty() => out.push_str("{}"),
        J::Object(map) => {
            let mut entries: Vec<(&String, &J)> = map.iter().collect();
            if sort {
                entries.sort_by(|a, b| a.0.cmp(b.0));
            }
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push_str(item_sep);
                }
                newline(out, level + 1)?;
                out.push_str(&J::String(key.clone()).to_string());
                out.push_str(": ");
                write_json(heap, item, indent, sort, level + 1, out)?;
            }
            newline(out, level)?;
            out.push('}');
        }
        other => out.push_str(&other.to_string()),
    }
    heap.check_str_len(out.len())
}

// ---- formatting ----

/// Parsed format specification: `[[fill]align][sign][#][0][width][,][.precision][type]`.
#[derive(Debug, Clone, Default)]
struct Spec {
    fill: Option<char>,
    align: Option<char>,
    sign: Option<char>,
    alt: bool,
    zero: bool,
    width: usize,
    grouping: Option<char>,
    precision: Option<usize>,
    ty: Option<char>,
}

impl Spec {
    fn parse(spec: &str) -> Result<Spec, Fault> {
        let chars: Vec<char> = spec.chars().collect();
        let invalid = || Fault::value_error(format!("Invalid format specifier '{}'", spec));
        let mut out = Spec::default();
        let mut i = 0;
        let is_align = |c: char| matches!(c, '<' | '>' | '=' | '^');
        if chars.len() >= 2 && is_align(chars[1]) {
            out.fill = Some(chars[0]);
            out.align = Some(chars[1]);
            i = 2;
        } else if chars.first().copied().is_some_and(is_align) {
            out.align = Some(chars[0]);
            i = 1;
        }
        if let Some(&c) = chars.get(i) {
            if matches!(c, '+' | '-' | ' ') {
                out.sign = Some(c);
                i += 1;
            }
        }
        if chars.get(i) == Some(&'#') {
            out.alt = true;
            i += 1;
        }
        if chars.get(i) == Some(&'0') {
            out.zero = true;
            i += 1;
        }
        let start = i;
        while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
            i += 1;
        }
        if i > start {
            let digits: String = chars[start..i].iter().collect();
            out.width = digits.parse().map_err(|_| invalid())?;
        }
        if let Some(&c) = chars.get(i) {
            if c == ',' || c == '_' {
                out.grouping = Some(c);
                i += 1;
            }
        }
        if chars.get(i) == Some(&'.') {
            i += 1;
            let start = i;
            while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
                i += 1;
            }
            if i == start {
                return Err(Fault::value_error("Format specifier missing precision"));
            }
            let digits: String = chars[start..i].iter().collect();
            out.precision = Some(digits.parse().map_err(|_| invalid())?);
        }
        match chars.len() - i {
            0 => {}
            1 => out.ty = Some(chars[i]),
            _ => return Err(invalid()),
        }
        Ok(out)
    }

    fn fill(&self) -> char {
        self.fill.unwrap_or(if self.zero { '0' } else { ' ' })
    }

    /// Width and precision are allocated up front, so bound them first.
    fn check_size(&self, heap: &Heap) -> Result<(), Fault> {
        heap.check_str_len(self.width)?;
        heap.check_str_len(self.precision.unwrap_or(0))
    }

    /// Only fill, alignment and width are set.
    fn is_layout_only(&self) -> bool {
        self.sign.is_none()
            && !self.alt
            && self.grouping.is_none()
            && self.precision.is_none()
            && self.ty.is_none()
    }
}

fn pad(text: String, width: usize, align: char, fill: char) -> String {
    let len = text.chars().count();
    if len >= width {
        return text;
    }
    let total = width - len;
    let fill_n = |n: usize| std::iter::repeat(fill).take(n).collect::<String>();
    match align {
        '<' => text + &fill_n(total),
        '^' => {
            let left = total / 2;
            format!("{}{}{}", fill_n(left), text, fill_n(total - left))
        }
        _ => fill_n(total) + &text,
    }
}

fn group_digits(digits: &str, sep: char, every: usize) -> String {
    let chars: Vec<char> = digits.chars().collect();
    let mut out = String::with_capacity(digits.len() + digits.len() / every);
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && (chars.len() - i) % every == 0 {
            out.push(sep);
        }
        out.push(*c);
    }
    out
}

fn finish_number(negative: bool, prefix: &str, body: String, spec: &Spec) -> String {
    let sign = if negative {
        "-"
    } else {
        match spec.sign {
            Some('+') => "+",
            Some(' ') => " ",
            _ => "",
        }
    };
    let align = spec
        .align
        .unwrap_or(if spec.zero && spec.fill.is_none() { '=' } else { '>' });
    if align == '=' {
        let lead = format!("{}{}", sign, prefix);
        let used = lead.chars().count() + body.chars().count();
        let fill: String = std::iter::repeat(spec.fill())
            .take(spec.width.saturating_sub(used))
            .collect();
        return format!("{}{}{}", lead, fill, body);
    }
    pad(format!("{}{}{}", sign, prefix, body), spec.width, align, spec.fill())
}

fn format_str(text: String, spec: &Spec) -> Result<String, Fault> {
    if !matches!(spec.ty, None | Some('s')) {
        return Err(Fault::value_error(format!(
            "Unknown format code '{}' for object of type 'str'",
            spec.ty.unwrap_or(' ')
        )));
    }
    let text = match spec.precision {
        Some(p) => text.chars().take(p).collect(),
        None => text,
    };
    Ok(pad(text, spec.width, spec.align.unwrap_or('<'), spec.fill()))
}

fn format_int(n: i64, spec: &Spec) -> Result<String, Fault> {
    let ty = spec.ty.unwrap_or('d');
    if matches!(ty, 'e' | 'E' | 'f' | 'F' | 'g' | 'G' | '%') {
        return format_float(n as f64, spec);
    }
    if spec.precision.is_some() {
        return Err(Fault::value_error(
            "Precision not allowed in integer format specifier",
        ));
    }
    let mag = n.unsigned_abs();
    let (digits, prefix, every) = match ty {
        'd' | 'n' => (mag.to_string(), "", 3),
        'x' => (format!("{:x}", mag), "0x", 4),
        'X' => (format!("{:X}", mag), "0X", 4),
        'o' => (format!("{:o}", mag), "0o", 4),
        'b' => (format!("{:b}", mag), "0b", 4),
        'c' => {
            let c = u32::try_from(n)
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| Fault::new(FaultKind::OverflowError, "%c arg not in range(0x110000)"))?;
            return Ok(pad(c.to_string(), spec.width, spec.align.unwrap_or('<'), spec.fill()));
        }
        other => {
            return Err(Fault::value_error(format!(
                "Unknown format code '{}' for object of type 'int'",
                other
            )))
        }
    };
    let digits = match spec.grouping {
        Some(sep) => group_digits(&digits, sep, every),
        None => digits,
    };
    let prefix = if spec.alt { prefix } else { "" };
    Ok(finish_number(n < 0, prefix, digits, spec))
}

fn sci(a: f64, precision: usize, upper: bool) -> String {
    let s = format!("{:.*e}", precision, a);
    let (mantissa, exp) = s.split_once('e').unwrap_or((s.as_str(), "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    format!(
        "{}{}{}{:02}",
        mantissa,
        if upper { 'E' } else { 'e' },
        if exp < 0 { '-' } else { '+' },
        exp.abs()
    )
}

fn strip_fraction_zeros(s: &str) -> String {
    if !s.contains('.') {
        return s.to_string();
    }
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

fn general(a: f64, precision: usize, alt: bool, upper: bool) -> String {
    let p = precision.max(1);
    let exp = if a == 0.0 {
        0
    } else {
        let s = format!("{:.*e}", p - 1, a);
        s.split_once('e')
            .and_then(|(_, e)| e.parse::<i32>().ok())
            .unwrap_or(0)
    };
    if -4 <= exp && exp < p as i32 {
        let decimals = (p as i32 - 1 - exp).max(0) as usize;
        let s = format!("{:.*}", decimals, a);
        if alt {
            s
        } else {
            strip_fraction_zeros(&s)
        }
    } else {
        let s = sci(a, p - 1, upper);
        if alt {
            return s;
        }
        match s.split_once(if upper { 'E' } else { 'e' }) {
            Some((m, e)) => format!(
                "{}{}{}",
                strip_fraction_zeros(m),
                if upper { 'E' } else { 'e' },
                e
            ),
            None => s,
        }
    }
}

fn format_float(x: f64, spec: &Spec) -> Result<String, Fault> {
    let negative = x.is_sign_negative() && !x.is_nan();
    let a = x.abs();
    let upper = matches!(spec.ty, Some('F' | 'E' | 'G'));
    let body = if !a.is_finite() {
        let word = if a.is_nan() { "nan" } else { "inf" };
        let word = if upper {
            word.to_uppercase()
        } else {
            word.to_string()
        };
        if spec.ty == Some('%') {
            word + "%"
        } else {
            word
        }
    } else {
        match spec.ty {
            None => match spec.precision {
                None => float_repr(a),
                Some(p) => general(a, p, spec.alt, false),
            },
            Some('f' | 'F') => format!("{:.*}", spec.precision.unwrap_or(6), a),
            Some('e' | 'E') => sci(a, spec.precision.unwrap_or(6), upper),
            Some('g' | 'G' | 'n') => general(a, spec.precision.unwrap_or(6), spec.alt, upper),
            Some('%') => format!("{:.*}%", spec.precision.unwrap_or(6), a * 100.0),
            Some(other) => {
                return Err(Fault::value_error(format!(
                    "Unknown format code '{}' for object of type 'float'",
                    other
                )))
            }
        }
    };
    let body = match spec.grouping {
        Some(sep) => {
            let end = body
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(body.len());
            format!("{}{}", group_digits(&body[..end], sep, 3), &body[end..])
        }
        None => body,
    };
    Ok(finish_number(negative, "", body, spec))
}

/// Applies a format specification to a value, as `format()` and f-strings do.
pub fn format_value(heap: &Heap, value: &Value, spec: &str) -> Result<String, Fault> {
    if spec.is_empty() {
        return to_str(heap, value);
    }
    let parsed = Spec::parse(spec)?;
    parsed.check_size(heap)?;
    match value {
        Value::Str(s) => format_str(s.to_string(), &parsed),
        Value::Int(_) | Value::Bool(_) => format_int(as_int(value).unwrap_or(0), &parsed),
        Value::Float(f) => format_float(*f, &parsed),
        other if parsed.is_layout_only() => format_str(to_str(heap, other)?, &parsed),
        other => Err(Fault::type_error(format!(
            "unsupported format string passed to {}.__format__",
            type_name(heap, other)
        ))),
    }
}

/// `str.format` with positional and keyword fields.
fn str_format(
    heap: &Heap,
    template: &str,
    args: &[Value],
    kwargs: &[(String, Value)],
) -> Result<String, Fault> {
    let mut out = String::new();
    let mut auto = 0usize;
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '}' => return Err(Fault::value_error("Single '}' encountered in format string")),
            '{' => {
                let mut field = String::new();
                let mut depth = 1;
                loop {
                    match chars.next() {
                        Some('{') => {
                            depth += 1;
                            field.push('{');
                        }
                        Some('}') => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                            field.push('}');
                        }
                        Some(ch) => field.push(ch),
                        None => {
                            return Err(Fault::value_error(
                                "expected '}' before end of string",
                            ))
                        }
                    }
                }
                let (head, spec) = match field.split_once(':') {
                    Some((h, s)) => (h.to_string(), s.to_string()),
                    None => (field.clone(), String::new()),
                };
                let (name, conversion) = match head.split_once('!') {
                    Some((n, c)) => (n.to_string(), c.chars().next()),
                    None => (head, None),
                };
                let value = if name.is_empty() {
                    let v = args.get(auto).cloned().ok_or_else(|| {
                        Fault::index_error(format!(
                            "Replacement index {} out of range for positional args tuple",
                            auto
                        ))
                    })?;
                    auto += 1;
                    v
                } else if let Ok(index) = name.parse::<usize>() {
                    args.get(index).cloned().ok_or_else(|| {
                        Fault::index_error(format!(
                            "Replacement index {} out of range for positional args tuple",
                            index
                        ))
                    })?
                } else {
                    kwargs
                        .iter()
                        .find(|(k, _)| *k == name)
                        .map(|(_, v)| v.clone())
                        .ok_or_else(|| Fault::new(FaultKind::KeyError, quote_str(&name)))?
                };
                let value = match conversion {
                    Some('r') | Some('a') => Value::str(repr(heap, &value)?),
                    Some('s') => Value::str(to_str(heap, &value)?),
                    Some(other) => {
                        return Err(Fault::value_error(format!(
                            "Unknown conversion specifier {}",
                            other
                        )))
                    }
                    None => value,
                };
                let spec = if spec.contains('{') {
                    str_format(heap, &spec, args, kwargs)?
                } else {
                    spec
                };
                out.push_str(&format_value(heap, &value, &spec)?);
            }
            other => out.push(other),
        }
        heap.check_str_len(out.len())?;
    }
    Ok(out)
}

/// printf-style `%` formatting.
pub fn percent_format(heap: &Heap, fmt: &str, args: &Value) -> Result<String, Fault> {
    let (items, mapping): (Vec<Value>, Option<&Dict>) = match args {
        Value::Ref(id) => match heap.get(*id)? {
            Object::Tuple(items) => (items.clone(), None),
            Object::Dict(d) => (vec![args.clone()], Some(d)),
            _ => (vec![args.clone()], None),
        },
        other => (vec![other.clone()], None),
    };
    let mut next = 0;
    let mut out = String::new();
    let mut chars = fmt.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let mut key = None;
        if chars.peek() == Some(&'(') {
            chars.next();
            let mut name = String::new();
            loop {
                match chars.next() {
                    Some(')') => break,
                    Some(ch) => name.push(ch),
                    None => return Err(Fault::value_error("incomplete format key")),
                }
            }
            key = Some(name);
        }
        let mut spec = Spec::default();
        while let Some(&flag) = chars.peek() {
            match flag {
                '-' => spec.align = Some('<'),
                '0' => spec.zero = true,
                '+' => spec.sign = Some('+'),
                ' ' => {
                    if spec.sign.is_none() {
                        spec.sign = Some(' ')
                    }
                }
                '#' => spec.alt = true,
                _ => break,
            }
            chars.next();
        }
        let mut width = String::new();
        while let Some(&d) = chars.peek().filter(|d| d.is_ascii_digit()) {
            width.push(d);
            chars.next();
        }
        spec.width = width.parse().unwrap_or(0);
        if chars.peek() == Some(&'.') {
            chars.next();
            let mut precision = String::new();
            while let Some(&d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                precision.push(d);
                chars.next();
            }
            spec.precision = Some(precision.parse().unwrap_or(0));
        }
        if spec.align == Some('<') {
            spec.zero = false;
        }
        spec.check_size(heap)?;
        let ty = chars
            .next()
            .ok_or_else(|| Fault::value_error("incomplete format"))?;
        if ty == '%' {
            out.push('%');
            continue;
        }
        let value = match &key {
            Some(name) => {
                let dict = mapping.ok_or_else(|| Fault::type_error("format requires a mapping"))?;
                dict.get(&HashKey::Str(Arc::from(name.as_str())))
                    .cloned()
                    .ok_or_else(|| Fault::new(FaultKind::KeyError, quote_str(name)))?
            }
            None => {
                let v = items
                    .get(next)
                    .cloned()
                    .ok_or_else(|| Fault::type_error("not enough arguments for format string"))?;
                next += 1;
                v
            }
        };
        let text = match ty {
            's' | 'r' | 'a' => {
                let text = if ty == 's' {
                    to_str(heap, &value)?
                } else {
                    repr(heap, &value)?
                };
                let spec = Spec {
                    zero: false,
                    ty: None,
                    ..spec
                };
                format_str(text, &spec)?
            }
            'd' | 'i' | 'u' | 'x' | 'X' | 'o' | 'c' => {
                let n = match as_num(&value) {
                    Some(Num::Int(n)) => n,
                    Some(Num::Float(f)) if ty != 'c' => float_to_int(f)?,
                    _ if ty == 'c' => match &value {
                        Value::Str(s) if s.chars().count() == 1 => {
                            s.chars().next().map(|c| c as i64).unwrap_or(0)
                        }
                        _ => return Err(Fault::type_error("%c requires int or char")),
                    },
                    _ => {
                        return Err(Fault::type_error(format!(
                            "%{} format: a real number is required, not {}",
                            ty,
                            type_name(heap, &value)
                        )))
                    }
                };
                let spec = Spec {
                    ty: Some(if matches!(ty, 'i' | 'u') { 'd' } else { ty }),
                    precision: None,
                    ..spec
                };
                format_int(n, &spec)?
            }
            'e' | 'E' | 'f' | 'F' | 'g' | 'G' => {
                let x = as_num(&value).map(Num::as_f64).ok_or_else(|| {
                    Fault::type_error(format!(
                        "must be real number, not {}",
                        type_name(heap, &value)
                    ))
                })?;
                let spec = Spec {
                    ty: Some(ty),
                    precision: Some(spec.precision.unwrap_or(6)),
                    ..spec
                };
                format_float(x, &spec)?
            }
            other => {
                return Err(Fault::value_error(format!(
                    "unsupported format character '{}' ({:#x})",
                    other, other as u32
                )))
            }
        };
        out.push_str(&text);
        heap.check_str_len(out.len())?;
    }
    if mapping.is_none() && next < items.len() {
        return Err(Fault::type_error(
            "not all arguments converted during string formatting",
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(value: Value, spec: &str) -> String {
        let heap = Heap::new(HeapLimits::default());
        format_value(&heap, &value, spec).unwrap()
    }

    #[test]
    fn format_spec_covers_common_cases() {
        assert_eq!(fmt(Value::Float(3.14159), ".2f"), "3.14");
        assert_eq!(fmt(Value::Int(42), "05d"), "00042");
        assert_eq!(fmt(Value::Int(-42), ">+6"), "   -42");
        assert_eq!(fmt(Value::Int(7), "*<4"), "7***");
        assert_eq!(fmt(Value::Int(1234567), ","), "1,234,567");
        assert_eq!(fmt(Value::Int(255), "#x"), "0xff");
        assert_eq!(fmt(Value::str("ab"), "^6"), "  ab  ");
        assert_eq!(fmt(Value::str("abcdef"), ".3"), "abc");
        assert_eq!(fmt(Value::Float(0.25), ".1%"), "25.0%");
        assert_eq!(fmt(Value::Float(12345.678), ".3e"), "1.235e+04");
        assert_eq!(fmt(Value::Float(0.0001234), "g"), "0.0001234");
        assert_eq!(fmt(Value::Float(1e20), "g"), "1e+20");
        assert_eq!(fmt(Value::Bool(true), ">6"), "     1");
        assert_eq!(fmt(Value::Bool(true), ""), "True");
    }

    #[test]
    fn bad_format_code_is_a_value_error() {
        let heap = Heap::new(HeapLimits::default());
        let err = format_value(&heap, &Value::str("x"), "d").unwrap_err();
        assert_eq!(err.kind, FaultKind::ValueError);
    }

    #[test]
    fn oversized_width_fails_before_padding() {
        let heap = Heap::new(HeapLimits {
            max_string_len: 1024,
            ..HeapLimits::default()
        });
        let err = format_value(&heap, &Value::Int(1), ">1000000000").unwrap_err();
        assert_eq!(err.kind, FaultKind::MemoryError);
        let err = format_value(&heap, &Value::Float(1.0), ".1000000000f").unwrap_err();
        assert_eq!(err.kind, FaultKind::MemoryError);
        let err = percent_format(&heap, "%1000000000d", &Value::Int(1)).unwrap_err();
        assert_eq!(err.kind, FaultKind::MemoryError);
        assert_eq!(format_value(&heap, &Value::Int(1), ">4").unwrap(), "   1");
    }

    #[test]
    fn percent_formatting() {
        let mut heap = Heap::new(HeapLimits::default());
        let args = heap
            .new_tuple(vec![Value::str("x"), Value::Int(3), Value::Float(1.5)])
            .unwrap();
        assert_eq!(
            percent_format(&heap, "%s=%03d (%.2f) 100%%", &args).unwrap(),
            "x=003 (1.50) 100%"
        );
        let err = percent_format(&heap, "%s", &args).unwrap_err();
        assert_eq!(err.kind, FaultKind::TypeError);
    }

    #[test]
    fn str_format_fields() {
        let heap = Heap::new(HeapLimits::default());
        let args = [Value::str("a"), Value::Int(7)];
        let kwargs = [("name".to_string(), Value::str("z"))];
        assert_eq!(
            str_format(&heap, "{} {1:>3} {name!r} {{}}", &args, &kwargs).unwrap(),
            "a   7 'z' {}"
        );
    }

    #[test]
    fn int_parsing() {
        assert_eq!(parse_int(" 42 ", 10).unwrap(), 42);
        assert_eq!(parse_int("-0x1f", 0).unwrap(), -31);
        assert_eq!(parse_int("1_000", 10).unwrap(), 1000);
        assert_eq!(parse_int("ff", 16).unwrap(), 255);
        assert!(parse_int("abc", 10).is_err());
        assert_eq!(
            parse_int("9223372036854775808", 10).unwrap_err().kind,
            FaultKind::OverflowError
        );
    }

    #[test]
    fn builtin_lookup_respects_capabilities() {
        let caps = CapabilitySet::all().without(Capability::Output);
        assert!(lookup("print", &caps).is_none());
        assert!(lookup("len", &caps).is_some());
        assert!(lookup("open", &caps).is_none());
        assert!(lookup("eval", &caps).is_none());
        let caps = CapabilitySet::none();
        assert!(lookup("ValueError", &caps).is_none());
        assert!(matches!(
            lookup("ValueError", &CapabilitySet::all()),
            Some(Value::ExcType(FaultKind::ValueError))
        ));
    }

    #[test]
    fn json_writer_matches_python_separators() {
        let heap = Heap::new(HeapLimits::default());
        let value = serde_json::json!({"b": [1, 2], "a": {}});
        let mut compact = String::new();
        write_json(&heap, &value, None, false, 0, &mut compact).unwrap();
        assert_eq!(compact, "{\"b\": [1, 2], \"a\": {}}");
        let mut sorted = String::new();
        write_json(&heap, &value, Some(2), true, 0, &mut sorted).unwrap();
        assert_eq!(sorted, "{\n  \"a\": {},\n  \"b\": [\n    1,\n    2\n  ]\n}");
    }

    #[test]
    fn json_writer_stops_at_the_string_limit() {
        let heap = Heap::new(HeapLimits {
            max_string_len: 1024,
            ..HeapLimits::default()
        });
        let value = serde_json::json!([[1, 2], [3, 4]]);
        let mut out = String::new();
        let err = write_json(&heap, &value, Some(1_000_000), false, 0, &mut out).unwrap_err();
        assert_eq!(err.kind, FaultKind::MemoryError);
        assert!(out.len() <= 1024);
    }

    #[test]
    fn rounding_is_half_even() {
        let heap = Heap::new(HeapLimits::default());
        assert!(matches!(round_value(&heap, &Value::Float(2.5), None), Ok(Value::Int(2))));
        assert!(matches!(round_value(&heap, &Value::Float(3.5), None), Ok(Value::Int(4))));
        assert!(matches!(round_value(&heap, &Value::Int(1250), Some(-2)), Ok(Value::Int(1200))));
        assert_eq!(mod_pow(3, 4, 5).unwrap(), 1);
    }
}
