//! Tree-walking evaluator for compiled map functions.
//!
//! Each invocation owns its interpreter state: a frame arena, a step budget
//! and the list of emitted pairs. Nothing survives between documents.

use super::ast::{AssignOp, BinaryOp, Expr, FunctionDef, IterKind, Stmt, UnaryOp, MAX_NESTING};
use super::value::{format_number, Builtin, Closure, Method, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

const MAX_CALL_DEPTH: usize = 64;

/// Largest gap an array index assignment may open up
const MAX_ARRAY_GROWTH: usize = 65_536;

/// A failure raised while running a map function
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeError(pub String);

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for RuntimeError {}

type EvalResult<T> = Result<T, RuntimeError>;

fn fail<T>(message: impl Into<String>) -> EvalResult<T> {
    Err(RuntimeError(message.into()))
}

/// Pairs emitted by one invocation, in call order
pub type Emitted = Vec<(serde_json::Value, serde_json::Value)>;

/// Run `def` as `def(doc, meta)` and collect its emissions.
pub fn invoke_map(
    def: &Arc<FunctionDef>,
    doc: &serde_json::Map<String, serde_json::Value>,
    doc_id: &str,
    step_limit: u64,
) -> EvalResult<Emitted> {
    let mut interp = Interpreter::new(step_limit);

    let mut meta = BTreeMap::new();
    meta.insert("_id".to_string(), Value::string(doc_id));
    meta.insert("id".to_string(), Value::string(doc_id));

    let body = doc
        .iter()
        .map(|(k, v)| (k.clone(), Value::from_json(v)))
        .collect();

    let closure = Closure {
        def: def.clone(),
        env: 0,
    };
    interp.call_closure(&closure, vec![Value::object(body), Value::object(meta)])?;
    Ok(interp.emitted)
}

enum Flow {
    Normal,
    Return(Value),
    Break,
    Continue,
}

struct Frame {
    vars: HashMap<String, Value>,
    parent: Option<usize>,
}

/// Resolved assignment target
enum Place {
    Var(String),
    Prop(Value, String),
}

struct Interpreter {
    frames: Vec<Frame>,
    steps: u64,
    step_limit: u64,
    depth: usize,
    /// Live `exec`/`eval` activations, counted across calls
    nesting: usize,
    closures_created: usize,
    emitted: Emitted,
}

impl Interpreter {
    fn new(step_limit: u64) -> Self {
        let mut globals = HashMap::new();
        globals.insert("emit".to_string(), Value::Builtin(Builtin::Emit));
        globals.insert("parseInt".to_string(), Value::Builtin(Builtin::ParseInt));
        globals.insert("parseFloat".to_string(), Value::Builtin(Builtin::ParseFloat));
        globals.insert("isNaN".to_string(), Value::Builtin(Builtin::IsNaN));
        globals.insert("Array".to_string(), Value::Builtin(Builtin::ArrayNamespace));
        globals.insert("Object".to_string(), Value::Builtin(Builtin::ObjectNamespace));
        globals.insert("undefined".to_string(), Value::Undefined);
        globals.insert("NaN".to_string(), Value::Number(f64::NAN));
        globals.insert("Infinity".to_string(), Value::Number(f64::INFINITY));

        Interpreter {
            frames: vec![Frame {
                vars: globals,
                parent: None,
            }],
            steps: 0,
            step_limit,
            depth: 0,
            nesting: 0,
            closures_created: 0,
            emitted: Vec::new(),
        }
    }

    fn tick(&mut self) -> EvalResult<()> {
        self.steps += 1;
        if self.steps > self.step_limit {
            return fail(format!("step limit of {} exceeded", self.step_limit));
        }
        Ok(())
    }

    fn enter(&mut self) -> EvalResult<()> {
        if self.nesting >= MAX_NESTING {
            return fail(format!("nesting exceeds {MAX_NESTING} levels"));
        }
        self.nesting += 1;
        Ok(())
    }

    // ── Frames ──────────────────────────────────────────────────

    /// Run `body` in a fresh child frame of `parent`.
    /// The frame is reclaimed afterwards unless a closure may have captured it.
    fn scoped<T>(
        &mut self,
        parent: usize,
        body: impl FnOnce(&mut Self, usize) -> EvalResult<T>,
    ) -> EvalResult<T> {
        let closures_before = self.closures_created;
        self.frames.push(Frame {
            vars: HashMap::new(),
            parent: Some(parent),
        });
        let frame = self.frames.len() - 1;

        let result = body(self, frame);

        if self.closures_created == closures_before && self.frames.len() == frame + 1 {
            self.frames.pop();
        }
        result
    }

    fn define(&mut self, frame: usize, name: &str, value: Value) {
        self.frames[frame].vars.insert(name.to_string(), value);
    }

    fn lookup(&self, frame: usize, name: &str) -> Option<Value> {
        let mut cur = Some(frame);
        while let Some(idx) = cur {
            if let Some(value) = self.frames[idx].vars.get(name) {
                return Some(value.clone());
            }
            cur = self.frames[idx].parent;
        }
        None
    }

    /// Assign to the nearest binding; undeclared names land in the invocation's globals
    fn assign_var(&mut self, frame: usize, name: &str, value: Value) {
        let mut cur = Some(frame);
        while let Some(idx) = cur {
            if let Some(slot) = self.frames[idx].vars.get_mut(name) {
                *slot = value;
                return;
            }
            cur = self.frames[idx].parent;
        }
        self.define(0, name, value);
    }

    // ── Statements ──────────────────────────────────────────────

    fn exec_block(&mut self, stmts: &[Stmt], frame: usize) -> EvalResult<Flow> {
        for stmt in stmts {
            match self.exec(stmt, frame)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&mut self, stmt: &Stmt, frame: usize) -> EvalResult<Flow> {
        self.enter()?;
        let flow = self.exec_stmt(stmt, frame);
        self.nesting -= 1;
        flow
    }

    fn exec_stmt(&mut self, stmt: &Stmt, frame: usize) -> EvalResult<Flow> {
        self.tick()?;

        match stmt {
            Stmt::Decl(bindings) => {
                for (name, init) in bindings {
                    let value = match init {
                        Some(expr) => self.eval(expr, frame)?,
                        None => Value::Undefined,
                    };
                    self.define(frame, name, value);
                }
                Ok(Flow::Normal)
            }
            Stmt::Expr(expr) => {
                self.eval(expr, frame)?;
                Ok(Flow::Normal)
            }
            Stmt::Block(stmts) => self.scoped(frame, |this, inner| this.exec_block(stmts, inner)),
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                if self.eval(cond, frame)?.truthy() {
                    self.exec(then, frame)
                } else if let Some(otherwise) = otherwise {
                    self.exec(otherwise, frame)
                } else {
                    Ok(Flow::Normal)
                }
            }
            Stmt::While { cond, body } => {
                while self.eval(cond, frame)?.truthy() {
                    match self.exec(body, frame)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::For {
                init,
                cond,
                update,
                body,
            } => self.scoped(frame, |this, inner| {
                if let Some(init) = init {
                    this.exec(init, inner)?;
                }
                loop {
                    if let Some(cond) = cond {
                        if !this.eval(cond, inner)?.truthy() {
                            break;
                        }
                    }
                    match this.exec(body, inner)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                    if let Some(update) = update {
                        this.eval(update, inner)?;
                    }
                    this.tick()?;
                }
                Ok(Flow::Normal)
            }),
            Stmt::ForEach {
                binding,
                kind,
                iterable,
                body,
            } => {
                let source = self.eval(iterable, frame)?;
                let items = iteration_items(&source, *kind)?;
                for item in items {
                    let flow = self.scoped(frame, |this, inner| {
                        this.define(inner, binding, item);
                        this.exec(body, inner)
                    })?;
                    match flow {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Return(expr) => {
                let value = match expr {
                    Some(expr) => self.eval(expr, frame)?,
                    None => Value::Undefined,
                };
                Ok(Flow::Return(value))
            }
            Stmt::Break => Ok(Flow::Break),
            Stmt::Continue => Ok(Flow::Continue),
            Stmt::Throw(expr) => {
                let value = self.eval(expr, frame)?;
                fail(format!("Uncaught {}", value.to_js_string()))
            }
            Stmt::Empty => Ok(Flow::Normal),
        }
    }

    // ── Expressions ─────────────────────────────────────────────

    fn eval(&mut self, expr: &Expr, frame: usize) -> EvalResult<Value> {
        self.enter()?;
        let value = self.eval_expr(expr, frame);
        self.nesting -= 1;
        value
    }

    fn eval_expr(&mut self, expr: &Expr, frame: usize) -> EvalResult<Value> {
        self.tick()?;

        match expr {
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::Str(s) => Ok(Value::string(s.as_str())),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Null => Ok(Value::Null),
            Expr::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item, frame)?);
                }
                Ok(Value::array(out))
            }
            Expr::Object(entries) => {
                let mut out = BTreeMap::new();
                for (key, value) in entries {
                    let value = self.eval(value, frame)?;
                    out.insert(key.clone(), value);
                }
                Ok(Value::object(out))
            }
            Expr::Ident(name) => match self.lookup(frame, name) {
                Some(value) => Ok(value),
                None => fail(format!("{name} is not defined")),
            },
            Expr::Member(object, name) => {
                let object = self.eval(object, frame)?;
                get_property(&object, name)
            }
            Expr::Index(object, index) => {
                let object = self.eval(object, frame)?;
                let index = self.eval(index, frame)?;
                get_property(&object, &property_key(&index))
            }
            Expr::Call(callee, args) => {
                let function = self.eval(callee, frame)?;
                let mut argv = Vec::with_capacity(args.len());
                for arg in args {
                    argv.push(self.eval(arg, frame)?);
                }
                if !function.is_callable() {
                    return fail(format!("{} is not a function", describe(callee)));
                }
                self.call_value(&function, argv)
            }
            Expr::Function(def) => {
                self.closures_created += 1;
                Ok(Value::Function(Closure {
                    def: def.clone(),
                    env: frame,
                }))
            }
            Expr::Assign { target, op, value } => {
                let place = self.resolve(target, frame)?;
                let new_value = match op {
                    AssignOp::Set => self.eval(value, frame)?,
                    AssignOp::Add => {
                        let current = self.read(&place, frame)?;
                        let rhs = self.eval(value, frame)?;
                        binary(BinaryOp::Add, &current, &rhs)
                    }
                    AssignOp::Sub => {
                        let current = self.read(&place, frame)?;
                        let rhs = self.eval(value, frame)?;
                        binary(BinaryOp::Sub, &current, &rhs)
                    }
                };
                self.write(place, new_value.clone(), frame)?;
                Ok(new_value)
            }
            Expr::Update {
                target,
                delta,
                prefix,
            } => {
                let place = self.resolve(target, frame)?;
                let old = self.read(&place, frame)?.to_number();
                let new = old + delta;
                self.write(place, Value::Number(new), frame)?;
                Ok(Value::Number(if *prefix { new } else { old }))
            }
            Expr::Unary(op, operand) => {
                if let (UnaryOp::Typeof, Expr::Ident(name)) = (op, operand.as_ref()) {
                    let value = self.lookup(frame, name).unwrap_or(Value::Undefined);
                    return Ok(Value::string(value.type_of()));
                }
                let value = self.eval(operand, frame)?;
                Ok(match op {
                    UnaryOp::Not => Value::Bool(!value.truthy()),
                    UnaryOp::Neg => Value::Number(-value.to_number()),
                    UnaryOp::Plus => Value::Number(value.to_number()),
                    UnaryOp::Typeof => Value::string(value.type_of()),
                })
            }
            Expr::Binary(op, lhs, rhs) => {
                let lhs = self.eval(lhs, frame)?;
                let rhs = self.eval(rhs, frame)?;
                Ok(binary(*op, &lhs, &rhs))
            }
            Expr::And(lhs, rhs) => {
                let lhs = self.eval(lhs, frame)?;
                if lhs.truthy() {
                    self.eval(rhs, frame)
                } else {
                    Ok(lhs)
                }
            }
            Expr::Or(lhs, rhs) => {
                let lhs = self.eval(lhs, frame)?;
                if lhs.truthy() {
                    Ok(lhs)
                } else {
                    self.eval(rhs, frame)
                }
            }
            Expr::Conditional(cond, then, otherwise) => {
                if self.eval(cond, frame)?.truthy() {
                    self.eval(then, frame)
                } else {
                    self.eval(otherwise, frame)
                }
            }
        }
    }

    fn resolve(&mut self, target: &Expr, frame: usize) -> EvalResult<Place> {
        match target {
            Expr::Ident(name) => Ok(Place::Var(name.clone())),
            Expr::Member(object, name) => Ok(Place::Prop(self.eval(object, frame)?, name.clone())),
            Expr::Index(object, index) => {
                let object = self.eval(object, frame)?;
                let index = self.eval(index, frame)?;
                Ok(Place::Prop(object, property_key(&index)))
            }
            _ => fail("invalid assignment target"),
        }
    }

    fn read(&self, place: &Place, frame: usize) -> EvalResult<Value> {
        match place {
            Place::Var(name) => match self.lookup(frame, name) {
                Some(value) => Ok(value),
                None => fail(format!("{name} is not defined")),
            },
            Place::Prop(object, key) => get_property(object, key),
        }
    }

    fn write(&mut self, place: Place, value: Value, frame: usize) -> EvalResult<()> {
        match place {
            Place::Var(name) => {
                self.assign_var(frame, &name, value);
                Ok(())
            }
            Place::Prop(object, key) => set_property(&object, &key, value),
        }
    }

    // ── Calls ───────────────────────────────────────────────────

    fn call_value(&mut self, function: &Value, args: Vec<Value>) -> EvalResult<Value> {
        match function {
            Value::Function(closure) => self.call_closure(closure, args),
            Value::Builtin(builtin) => self.call_builtin(*builtin, args),
            Value::Method(receiver, method) => self.call_method(receiver, *method, args),
            other => fail(format!("{} is not a function", other.type_of())),
        }
    }

    fn call_closure(&mut self, closure: &Closure, args: Vec<Value>) -> EvalResult<Value> {
        if self.depth >= MAX_CALL_DEPTH {
            return fail("maximum call depth exceeded");
        }
        self.depth += 1;

        let def = closure.def.clone();
        let result = self.scoped(closure.env, |this, frame| {
            if let Some(name) = &def.name {
                this.define(frame, name, Value::Function(closure.clone()));
            }
            let mut args = args.into_iter();
            for param in &def.params {
                let value = args.next().unwrap_or(Value::Undefined);
                this.define(frame, param, value);
            }
            this.exec_block(&def.body, frame)
        });

        self.depth -= 1;
        match result? {
            Flow::Return(value) => Ok(value),
            _ => Ok(Value::Undefined),
        }
    }

    fn call_builtin(&mut self, builtin: Builtin, args: Vec<Value>) -> EvalResult<Value> {
        let arg = |i: usize| args.get(i).cloned().unwrap_or(Value::Undefined);

        match builtin {
            Builtin::Emit => {
                let key = arg(0).to_json().map_err(RuntimeError)?;
                let value = arg(1).to_json().map_err(RuntimeError)?;
                self.emitted.push((key, value));
                Ok(Value::Undefined)
            }
            Builtin::ParseInt => {
                let radix = match arg(1) {
                    Value::Undefined => None,
                    other => Some(other.to_number() as u32),
                };
                Ok(Value::Number(parse_int(&arg(0).to_js_string(), radix)))
            }
            Builtin::ParseFloat => Ok(Value::Number(parse_float(&arg(0).to_js_string()))),
            Builtin::IsNaN => Ok(Value::Bool(arg(0).to_number().is_nan())),
            Builtin::ArrayIsArray => Ok(Value::Bool(matches!(arg(0), Value::Array(_)))),
            Builtin::ObjectKeys => match arg(0) {
                Value::Object(entries) => Ok(Value::array(
                    entries
                        .borrow()
                        .keys()
                        .map(|k| Value::string(k.as_str()))
                        .collect(),
                )),
                value @ (Value::Array(_) | Value::Str(_)) => {
                    iteration_items(&value, IterKind::Keys).map(Value::array)
                }
                Value::Undefined | Value::Null => {
                    fail("Cannot convert undefined or null to object")
                }
                _ => Ok(Value::array(Vec::new())),
            },
            Builtin::ArrayNamespace | Builtin::ObjectNamespace => {
                fail("constructors are not available in map functions")
            }
        }
    }

    fn call_method(
        &mut self,
        receiver: &Value,
        method: Method,
        args: Vec<Value>,
    ) -> EvalResult<Value> {
        let arg = |i: usize| args.get(i).cloned().unwrap_or(Value::Undefined);

        match (receiver, method) {
            (Value::Array(items), Method::ForEach) => {
                let callback = arg(0);
                if !callback.is_callable() {
                    return fail(format!("{} is not a function", callback.type_of()));
                }
                let snapshot: Vec<Value> = items.borrow().clone();
                for (i, item) in snapshot.into_iter().enumerate() {
                    self.call_value(
                        &callback,
                        vec![item, Value::Number(i as f64), receiver.clone()],
                    )?;
                }
                Ok(Value::Undefined)
            }
            (Value::Array(items), Method::IndexOf) => {
                let needle = arg(0);
                let pos = items
                    .borrow()
                    .iter()
                    .position(|item| strict_equals(item, &needle));
                Ok(Value::Number(pos.map_or(-1.0, |p| p as f64)))
            }
            (Value::Array(items), Method::Push) => {
                let mut items = items.borrow_mut();
                items.extend(args.iter().cloned());
                Ok(Value::Number(items.len() as f64))
            }
            (Value::Array(items), Method::Join) => {
                let separator = match arg(0) {
                    Value::Undefined => ",".to_string(),
                    other => other.to_js_string(),
                };
                let joined = items
                    .borrow()
                    .iter()
                    .map(|v| match v {
                        Value::Undefined | Value::Null => String::new(),
                        other => other.to_js_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(&separator);
                Ok(Value::string(joined))
            }
            (Value::Str(s), Method::IndexOf) => {
                let needle = arg(0).to_js_string();
                let pos = s.find(needle.as_str()).map(|byte| s[..byte].chars().count());
                Ok(Value::Number(pos.map_or(-1.0, |p| p as f64)))
            }
            (Value::Str(s), Method::ToLowerCase) => Ok(Value::string(s.to_lowercase())),
            (Value::Str(s), Method::ToUpperCase) => Ok(Value::string(s.to_uppercase())),
            (Value::Str(s), Method::Trim) => Ok(Value::string(s.trim())),
            (Value::Str(s), Method::Split) => {
                let parts: Vec<Value> = match arg(0) {
                    Value::Undefined => vec![Value::Str(s.clone())],
                    sep => {
                        let sep = sep.to_js_string();
                        if sep.is_empty() {
                            s.chars().map(|c| Value::string(c.to_string())).collect()
                        } else {
                            s.split(sep.as_str()).map(Value::string).collect()
                        }
                    }
                };
                Ok(Value::array(parts))
            }
            (Value::Object(entries), Method::HasOwnProperty) => {
                let key = property_key(&arg(0));
                Ok(Value::Bool(entries.borrow().contains_key(&key)))
            }
            (_, method) => fail(format!("{method:?} is not supported on {}", receiver.type_of())),
        }
    }
}

// ── Property access ─────────────────────────────────────────────

fn property_key(value: &Value) -> String {
    match value {
        Value::Number(n) => format_number(*n),
        other => other.to_js_string(),
    }
}

fn array_index(key: &str) -> Option<usize> {
    if key.is_empty() || (key.len() > 1 && key.starts_with('0')) {
        return None;
    }
    key.parse::<usize>().ok()
}

fn get_property(object: &Value, key: &str) -> EvalResult<Value> {
    match object {
        Value::Undefined | Value::Null => fail(format!(
            "Cannot read property '{key}' of {}",
            object.to_js_string()
        )),
        Value::Str(s) => Ok(match key {
            "length" => Value::Number(s.chars().count() as f64),
            "indexOf" => Value::Method(Box::new(object.clone()), Method::IndexOf),
            "toLowerCase" => Value::Method(Box::new(object.clone()), Method::ToLowerCase),
            "toUpperCase" => Value::Method(Box::new(object.clone()), Method::ToUpperCase),
            "split" => Value::Method(Box::new(object.clone()), Method::Split),
            "trim" => Value::Method(Box::new(object.clone()), Method::Trim),
            _ => match array_index(key).and_then(|i| s.chars().nth(i)) {
                Some(c) => Value::string(c.to_string()),
                None => Value::Undefined,
            },
        }),
        Value::Array(items) => Ok(match key {
            "length" => Value::Number(items.borrow().len() as f64),
            "forEach" => Value::Method(Box::new(object.clone()), Method::ForEach),
            "indexOf" => Value::Method(Box::new(object.clone()), Method::IndexOf),
            "push" => Value::Method(Box::new(object.clone()), Method::Push),
            "join" => Value::Method(Box::new(object.clone()), Method::Join),
            _ => array_index(key)
                .and_then(|i| items.borrow().get(i).cloned())
                .unwrap_or(Value::Undefined),
        }),
        Value::Object(entries) => {
            if let Some(value) = entries.borrow().get(key) {
                return Ok(value.clone());
            }
            Ok(if key == "hasOwnProperty" {
                Value::Method(Box::new(object.clone()), Method::HasOwnProperty)
            } else {
                Value::Undefined
            })
        }
        Value::Builtin(Builtin::ArrayNamespace) if key == "isArray" => {
            Ok(Value::Builtin(Builtin::ArrayIsArray))
        }
        Value::Builtin(Builtin::ObjectNamespace) if key == "keys" => {
            Ok(Value::Builtin(Builtin::ObjectKeys))
        }
        _ => Ok(Value::Undefined),
    }
}

fn set_property(object: &Value, key: &str, value: Value) -> EvalResult<()> {
    match object {
        Value::Undefined | Value::Null => fail(format!(
            "Cannot set property '{key}' of {}",
            object.to_js_string()
        )),
        Value::Object(entries) => {
            entries.borrow_mut().insert(key.to_string(), value);
            Ok(())
        }
        Value::Array(items) => {
            let mut items = items.borrow_mut();
            if key == "length" {
                let len = value.to_number();
                if !(len >= 0.0 && len.fract() == 0.0) {
                    return fail("Invalid array length");
                }
                let len = len as usize;
                if len > items.len() + MAX_ARRAY_GROWTH {
                    return fail("array length too large");
                }
                items.resize(len, Value::Undefined);
                return Ok(());
            }
            if let Some(index) = array_index(key) {
                if index >= items.len() + MAX_ARRAY_GROWTH {
                    return fail(format!("array index {index} too large"));
                }
                if index >= items.len() {
                    items.resize(index + 1, Value::Undefined);
                }
                items[index] = value;
            }
            Ok(())
        }
        // Assignments to primitives are silently dropped
        _ => Ok(()),
    }
}

fn iteration_items(source: &Value, kind: IterKind) -> EvalResult<Vec<Value>> {
    match (source, kind) {
        (Value::Object(entries), IterKind::Keys) => Ok(entries
            .borrow()
            .keys()
            .map(|k| Value::string(k.as_str()))
            .collect()),
        (Value::Array(items), IterKind::Keys) => Ok((0..items.borrow().len())
            .map(|i| Value::string(i.to_string()))
            .collect()),
        (Value::Str(s), IterKind::Keys) => Ok((0..s.chars().count())
            .map(|i| Value::string(i.to_string()))
            .collect()),
        (Value::Array(items), IterKind::Values) => Ok(items.borrow().clone()),
        (Value::Str(s), IterKind::Values) => {
            Ok(s.chars().map(|c| Value::string(c.to_string())).collect())
        }
        (_, IterKind::Keys) => Ok(Vec::new()),
        (other, IterKind::Values) => fail(format!("{} is not iterable", other.to_js_string())),
    }
}

fn describe(callee: &Expr) -> String {
    match callee {
        Expr::Ident(name) => name.clone(),
        Expr::Member(object, name) => format!("{}.{name}", describe(object)),
        Expr::Index(object, _) => format!("{}[...]", describe(object)),
        _ => "expression".to_string(),
    }
}

// ── Operators ───────────────────────────────────────────────────

fn is_stringish(value: &Value) -> bool {
    matches!(value, Value::Str(_) | Value::Array(_) | Value::Object(_))
}

fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Value {
    match op {
        BinaryOp::Add => {
            if is_stringish(lhs) || is_stringish(rhs) {
                let mut s = lhs.to_js_string();
                s.push_str(&rhs.to_js_string());
                Value::string(s)
            } else {
                Value::Number(lhs.to_number() + rhs.to_number())
            }
        }
        BinaryOp::Sub => Value::Number(lhs.to_number() - rhs.to_number()),
        BinaryOp::Mul => Value::Number(lhs.to_number() * rhs.to_number()),
        BinaryOp::Div => Value::Number(lhs.to_number() / rhs.to_number()),
        BinaryOp::Rem => Value::Number(lhs.to_number() % rhs.to_number()),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            Value::Bool(relational(op, lhs, rhs))
        }
        BinaryOp::LooseEq => Value::Bool(loose_equals(lhs, rhs)),
        BinaryOp::LooseNe => Value::Bool(!loose_equals(lhs, rhs)),
        BinaryOp::StrictEq => Value::Bool(strict_equals(lhs, rhs)),
        BinaryOp::StrictNe => Value::Bool(!strict_equals(lhs, rhs)),
    }
}

fn relational(op: BinaryOp, lhs: &Value, rhs: &Value) -> bool {
    if let (Value::Str(a), Value::Str(b)) = (lhs, rhs) {
        return match op {
            BinaryOp::Lt => a < b,
            BinaryOp::Le => a <= b,
            BinaryOp::Gt => a > b,
            _ => a >= b,
        };
    }
    let (a, b) = (lhs.to_number(), rhs.to_number());
    match op {
        BinaryOp::Lt => a < b,
        BinaryOp::Le => a <= b,
        BinaryOp::Gt => a > b,
        _ => a >= b,
    }
}

fn strict_equals(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => a == b,
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
        (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
        (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(&a.def, &b.def) && a.env == b.env,
        (Value::Builtin(a), Value::Builtin(b)) => a == b,
        _ => false,
    }
}

fn loose_equals(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Undefined | Value::Null, Value::Undefined | Value::Null) => true,
        (Value::Undefined | Value::Null, _) | (_, Value::Undefined | Value::Null) => false,
        (Value::Number(_), Value::Str(_)) | (Value::Str(_), Value::Number(_)) => {
            lhs.to_number() == rhs.to_number()
        }
        (Value::Bool(b), other) | (other, Value::Bool(b)) if !matches!(other, Value::Bool(_)) => {
            let n = Value::Number(if *b { 1.0 } else { 0.0 });
            loose_equals(&n, other)
        }
        (Value::Array(_) | Value::Object(_), Value::Number(_) | Value::Str(_)) => {
            loose_equals(&Value::string(lhs.to_js_string()), rhs)
        }
        (Value::Number(_) | Value::Str(_), Value::Array(_) | Value::Object(_)) => {
            loose_equals(lhs, &Value::string(rhs.to_js_string()))
        }
        _ => strict_equals(lhs, rhs),
    }
}

// ── Numeric parsing builtins ────────────────────────────────────

fn parse_int(text: &str, radix: Option<u32>) -> f64 {
    let s = text.trim();
    let (negative, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let has_hex_prefix = s.starts_with("0x") || s.starts_with("0X");
    let (radix, s) = match radix {
        None | Some(0) | Some(16) if has_hex_prefix => (16, &s[2..]),
        None | Some(0) => (10, s),
        Some(r) => (r, s),
    };
    if !(2..=36).contains(&radix) {
        return f64::NAN;
    }

    let mut value: Option<f64> = None;
    for c in s.chars() {
        match c.to_digit(radix) {
            Some(d) => value = Some(value.unwrap_or(0.0) * radix as f64 + d as f64),
            None => break,
        }
    }
    match value {
        Some(v) if negative => -v,
        Some(v) => v,
        None => f64::NAN,
    }
}

fn parse_float(text: &str) -> f64 {
    let s = text.trim_start();
    let bytes = s.as_bytes();
    let mut end = 0;

    if matches!(bytes.first(), Some(b'+') | Some(b'-')) {
        end += 1;
    }
    if s[end..].starts_with("Infinity") {
        return if s.starts_with('-') {
            f64::NEG_INFINITY
        } else {
            f64::INFINITY
        };
    }

    let digits_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    let mut digits = end - digits_start;
    if end < bytes.len() && bytes[end] == b'.' {
        let frac_start = end + 1;
        let mut frac_end = frac_start;
        while frac_end < bytes.len() && bytes[frac_end].is_ascii_digit() {
            frac_end += 1;
        }
        digits += frac_end - frac_start;
        end = frac_end;
    }
    if digits == 0 {
        return f64::NAN;
    }
    if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        let mut exp_end = end + 1;
        if exp_end < bytes.len() && (bytes[exp_end] == b'+' || bytes[exp_end] == b'-') {
            exp_end += 1;
        }
        let exp_digits_start = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > exp_digits_start {
            end = exp_end;
        }
    }

    s[..end].parse::<f64>().unwrap_or(f64::NAN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::parser::parse_map_function;
    use serde_json::json;

    fn run(src: &str, doc: serde_json::Value) -> EvalResult<Emitted> {
        let def = Arc::new(parse_map_function(src).unwrap());
        invoke_map(&def, doc.as_object().unwrap(), "doc-1", 100_000)
    }

    fn keys(src: &str, doc: serde_json::Value) -> Vec<serde_json::Value> {
        run(src, doc).unwrap().into_iter().map(|(k, _)| k).collect()
    }

    #[test]
    fn test_conditional_emit() {
        let src = r#"function(doc) { if (doc.type == "boogie") { emit(doc.n, null) } }"#;
        assert_eq!(
            run(src, json!({"type": "boogie", "n": "one"})).unwrap(),
            vec![(json!("one"), json!(null))]
        );
        assert!(run(src, json!({"type": "other", "n": "one"})).unwrap().is_empty());
    }

    #[test]
    fn test_meta_exposes_id() {
        let emitted = run("function(doc, meta) { emit(meta._id, meta.id) }", json!({})).unwrap();
        assert_eq!(emitted, vec![(json!("doc-1"), json!("doc-1"))]);
    }

    #[test]
    fn test_emit_order_and_composite_keys() {
        let src = "function(doc) {
            for (var i = 0; i < doc.tags.length; i++) {
                emit([doc.tags[i], i], doc.tags.length);
            }
        }";
        assert_eq!(
            run(src, json!({"tags": ["b", "a"]})).unwrap(),
            vec![(json!(["b", 0]), json!(2)), (json!(["a", 1]), json!(2))]
        );
    }

    #[test]
    fn test_closures_and_methods() {
        let src = "function(doc) {
            var prefix = doc.kind.toUpperCase() + ':';
            doc.tags.forEach(function(t, i) { emit(prefix + t.trim(), i) });
        }";
        assert_eq!(
            keys(src, json!({"kind": "x", "tags": [" a ", "b"]})),
            vec![json!("X:a"), json!("X:b")]
        );
    }

    #[test]
    fn test_recursive_named_function() {
        let src = "function(doc) {
            function fact(n) { return n <= 1 ? 1 : n * fact(n - 1) }
            emit(fact(doc.n))
        }";
        assert_eq!(keys(src, json!({"n": 5})), vec![json!(120)]);
    }

    #[test]
    fn test_for_in_and_of() {
        let src = "function(doc) {
            for (var k in doc.obj) emit(k, doc.obj[k]);
            for (var v of doc.arr) { if (v === 2) continue; emit(v) }
        }";
        let emitted = run(src, json!({"obj": {"a": 1, "b": 2}, "arr": [1, 2, 3]})).unwrap();
        assert_eq!(
            emitted,
            vec![
                (json!("a"), json!(1)),
                (json!("b"), json!(2)),
                (json!(1), json!(null)),
                (json!(3), json!(null)),
            ]
        );
    }

    #[test]
    fn test_document_copy_is_isolated() {
        let src = "function(doc) { doc.n = 'changed'; doc.list.push(4); emit(doc.n, doc.list.length) }";
        let doc = json!({"n": "one", "list": [1, 2, 3]});
        let emitted = run(src, doc.clone()).unwrap();
        assert_eq!(emitted, vec![(json!("changed"), json!(4))]);
        assert_eq!(doc, json!({"n": "one", "list": [1, 2, 3]}));
    }

    #[test]
    fn test_loose_and_strict_equality() {
        let src = "function(doc) {
            emit([doc.i == '37', doc.i === '37', null == undefined, null === undefined, 1 == true]);
        }";
        assert_eq!(
            keys(src, json!({"i": 37})),
            vec![json!([true, false, true, false, true])]
        );
    }

    #[test]
    fn test_undefined_and_nan_emit_null() {
        let src = "function(doc) { emit(doc.missing, 0 / 0) }";
        assert_eq!(run(src, json!({})).unwrap(), vec![(json!(null), json!(null))]);
    }

    #[test]
    fn test_builtins() {
        let src = "function(doc) {
            emit([parseInt('42px'), parseInt('ff', 16), parseFloat('2.5e1x'), isNaN('abc'),
                  Array.isArray(doc.a), Object.keys(doc.o).join('|'), typeof doc.nope,
                  'a,b'.split(','), doc.o.hasOwnProperty('y')]);
        }";
        assert_eq!(
            keys(src, json!({"a": [], "o": {"x": 1, "y": 2}})),
            vec![json!([42, 255, 25, true, true, "x|y", "undefined", ["a", "b"], true])]
        );
    }

    #[test]
    fn test_runtime_errors() {
        let err = run("function(doc) { emit(doc.missing.field) }", json!({})).unwrap_err();
        assert!(err.0.contains("Cannot read property 'field' of undefined"), "{err}");

        let err = run("function(doc) { doc.n() }", json!({"n": 1})).unwrap_err();
        assert_eq!(err.0, "doc.n is not a function");

        let err = run("function(doc) { emit(nope) }", json!({})).unwrap_err();
        assert_eq!(err.0, "nope is not defined");

        let err = run("function(doc) { throw 'bad doc' }", json!({})).unwrap_err();
        assert_eq!(err.0, "Uncaught bad doc");
    }

    #[test]
    fn test_step_limit_stops_infinite_loops() {
        let err = run("function(doc) { while (true) {} }", json!({})).unwrap_err();
        assert!(err.0.contains("step limit"), "{err}");
    }

    #[test]
    fn test_call_depth_limit() {
        let err = run("function(doc) { function f() { return f() } f() }", json!({})).unwrap_err();
        assert_eq!(err.0, "maximum call depth exceeded");
    }

    #[test]
    fn test_nesting_limit_spans_calls() {
        let err = run(
            "function(doc) {
                function f(n) { return n <= 0 ? 0 : 1 + (1 + (1 + f(n - 1))) }
                emit(f(60))
            }",
            json!({}),
        )
        .unwrap_err();
        assert_eq!(err.0, "nesting exceeds 256 levels");

        let emitted = run(
            "function(doc) {
                function f(n) { return n <= 0 ? 0 : 1 + (1 + (1 + f(n - 1))) }
                emit(f(10))
            }",
            json!({}),
        )
        .unwrap();
        assert_eq!(emitted, vec![(json!(30), json!(null))]);
    }

    #[test]
    fn test_no_host_globals() {
        for name in ["require", "process", "console", "globalThis", "eval"] {
            let src = format!("function(doc) {{ {name} }}");
            let err = run(&src, json!({})).unwrap_err();
            assert_eq!(err.0, format!("{name} is not defined"));
        }
    }

    #[test]
    fn test_string_comparison_and_concat() {
        let src = "function(doc) { emit(['one' < 'tw', 'two' > 'tw', 1 + '2', 1 + 2, [1,2] + '']) }";
        assert_eq!(keys(src, json!({})), vec![json!([true, true, "12", 3, "1,2"])]);
    }
}
