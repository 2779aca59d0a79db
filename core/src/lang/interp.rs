//! Tree-walking evaluator.
//!
//! Scoping is two-level: a function body resolves names against its own
//! locals, then the execution globals. Closures over enclosing function
//! locals are not supported; the normalizer's free-name analysis rejects
//! code that would need them.

use std::collections::BTreeMap;
use std::collections::HashMap;

use super::ScriptError;
use super::ast::BinOp;
use super::ast::BoolOp;
use super::ast::CmpOp;
use super::ast::Expr;
use super::ast::ExprKind;
use super::ast::Module;
use super::ast::Stmt;
use super::ast::StmtKind;
use super::ast::UnaryOp;
use super::value::Builtin;
use super::value::CodeHandle;
use super::value::DomainMethod;
use super::value::JobHandle;
use super::value::Value;

const MAX_CALL_DEPTH: usize = 64;
const MAX_RANGE_LEN: i64 = 1_000_000;

/// Receives every `print` call made by sandboxed code.
pub trait PrintSink {
    fn write(&self, text: &str);
}

/// The capability set behind the injected `domain` handle. Errors are
/// surfaced to the script as catchable evaluation errors.
pub trait DomainHooks {
    fn init_progress(&self, n_iters: i64) -> Result<(), String>;
    fn set_progress(&self, to: i64) -> Result<(), String>;
    fn increment_progress(&self, by: i64) -> Result<(), String>;
    fn launch_job(
        &self,
        func: &CodeHandle,
        kwargs: BTreeMap<String, Value>,
    ) -> Result<JobHandle, String>;
}

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

pub struct Interp<'a> {
    globals: HashMap<String, Value>,
    sink: &'a dyn PrintSink,
    hooks: Option<&'a dyn DomainHooks>,
    depth: usize,
}

/// The fixed allow-list of names the sandbox provides; every execution
/// scope starts from these.
pub fn base_globals() -> HashMap<String, Value> {
    let mut globals = HashMap::new();
    for builtin in [
        Builtin::Print,
        Builtin::Len,
        Builtin::Range,
        Builtin::Sum,
        Builtin::Min,
        Builtin::Max,
        Builtin::Abs,
        Builtin::Round,
        Builtin::Str,
        Builtin::Int,
        Builtin::Float,
        Builtin::Bool,
        Builtin::List,
        Builtin::Dict,
    ] {
        globals.insert(builtin.name().to_string(), Value::Builtin(builtin));
    }
    globals
}

impl<'a> Interp<'a> {
    pub fn new(
        globals: HashMap<String, Value>,
        sink: &'a dyn PrintSink,
        hooks: Option<&'a dyn DomainHooks>,
    ) -> Self {
        Self { globals, sink, hooks, depth: 0 }
    }

    /// Executes the module body, binding its top-level definitions into the
    /// execution globals.
    pub fn exec_module(&mut self, module: &Module) -> Result<(), ScriptError> {
        let mut scope = HashMap::new();
        for stmt in &module.body {
            match self.exec_stmt(stmt, &mut scope)? {
                Flow::Normal => {}
                _ => {
                    return Err(ScriptError::eval(
                        stmt.line,
                        "control-flow statement outside a function",
                    ));
                }
            }
        }
        self.globals.extend(scope);
        Ok(())
    }

    /// Calls a function bound in the globals with keyword arguments only.
    pub fn call_by_name(
        &mut self,
        name: &str,
        kwargs: BTreeMap<String, Value>,
    ) -> Result<Value, ScriptError> {
        let func = self
            .globals
            .get(name)
            .cloned()
            .ok_or_else(|| ScriptError::eval(1, format!("name '{name}' is not defined")))?;
        self.call_value(&func, Vec::new(), kwargs, 1)
    }

    fn exec_stmts(
        &mut self,
        stmts: &[Stmt],
        scope: &mut HashMap<String, Value>,
    ) -> Result<Flow, ScriptError> {
        for stmt in stmts {
            match self.exec_stmt(stmt, scope)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(
        &mut self,
        stmt: &Stmt,
        scope: &mut HashMap<String, Value>,
    ) -> Result<Flow, ScriptError> {
        match &stmt.kind {
            StmtKind::FunctionDef(def) => {
                scope.insert(def.name.clone(), Value::Function(std::sync::Arc::new(def.clone())));
                Ok(Flow::Normal)
            }
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval_expr(expr, scope)?,
                    None => Value::None,
                };
                Ok(Flow::Return(value))
            }
            StmtKind::Assign { target, value } => {
                let value = self.eval_expr(value, scope)?;
                scope.insert(target.clone(), value);
                Ok(Flow::Normal)
            }
            StmtKind::Expr(expr) => {
                self.eval_expr(expr, scope)?;
                Ok(Flow::Normal)
            }
            StmtKind::If { branches, orelse } => {
                for (test, body) in branches {
                    if self.eval_expr(test, scope)?.truthy() {
                        return self.exec_stmts(body, scope);
                    }
                }
                self.exec_stmts(orelse, scope)
            }
            StmtKind::For { target, iter, body } => {
                let iterable = self.eval_expr(iter, scope)?;
                let items = self.iterate(&iterable, iter.line)?;
                for item in items {
                    scope.insert(target.clone(), item);
                    match self.exec_stmts(body, scope)? {
                        Flow::Normal => {}
                        Flow::Break => break,
                        Flow::Continue => continue,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                    }
                }
                Ok(Flow::Normal)
            }
            StmtKind::While { test, body } => {
                while self.eval_expr(test, scope)?.truthy() {
                    match self.exec_stmts(body, scope)? {
                        Flow::Normal => {}
                        Flow::Break => break,
                        Flow::Continue => continue,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                    }
                }
                Ok(Flow::Normal)
            }
            StmtKind::Try { body, binding, handler } => match self.exec_stmts(body, scope) {
                Ok(flow) => Ok(flow),
                Err(ScriptError::Eval { message, .. }) => {
                    if let Some(name) = binding {
                        scope.insert(name.clone(), Value::Str(message));
                    }
                    self.exec_stmts(handler, scope)
                }
                Err(other) => Err(other),
            },
            StmtKind::Pass => Ok(Flow::Normal),
            StmtKind::Break => Ok(Flow::Break),
            StmtKind::Continue => Ok(Flow::Continue),
        }
    }

    fn iterate(&self, value: &Value, line: usize) -> Result<Vec<Value>, ScriptError> {
        match value {
            Value::List(items) => Ok(items.clone()),
            Value::Str(s) => Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
            Value::Dict(map) => Ok(map.keys().map(|k| Value::Str(k.clone())).collect()),
            other => Err(ScriptError::eval(
                line,
                format!("'{}' object is not iterable", other.type_name()),
            )),
        }
    }

    fn eval_expr(
        &mut self,
        expr: &Expr,
        scope: &mut HashMap<String, Value>,
    ) -> Result<Value, ScriptError> {
        let line = expr.line;
        match &expr.kind {
            ExprKind::NoneLit => Ok(Value::None),
            ExprKind::Bool(b) => Ok(Value::Bool(*b)),
            ExprKind::Int(n) => Ok(Value::Int(*n)),
            ExprKind::Float(f) => Ok(Value::Float(*f)),
            ExprKind::Str(s) => Ok(Value::Str(s.clone())),
            ExprKind::Bytes(b) => Ok(Value::Bytes(b.clone())),
            ExprKind::Name(name) => scope
                .get(name)
                .or_else(|| self.globals.get(name))
                .cloned()
                .ok_or_else(|| ScriptError::eval(line, format!("name '{name}' is not defined"))),
            ExprKind::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval_expr(item, scope)?);
                }
                Ok(Value::List(values))
            }
            ExprKind::Dict(entries) => {
                let mut map = BTreeMap::new();
                for (key, value) in entries {
                    let key = match self.eval_expr(key, scope)? {
                        Value::Str(s) => s,
                        other => {
                            return Err(ScriptError::eval(
                                key.line,
                                format!("dict keys must be strings, not {}", other.type_name()),
                            ));
                        }
                    };
                    let value = self.eval_expr(value, scope)?;
                    map.insert(key, value);
                }
                Ok(Value::Dict(map))
            }
            ExprKind::Attribute { value, attr } => {
                let value = self.eval_expr(value, scope)?;
                match value {
                    Value::Domain => DomainMethod::by_name(attr)
                        .map(Value::DomainMethod)
                        .ok_or_else(|| {
                            ScriptError::eval(line, format!("domain has no attribute '{attr}'"))
                        }),
                    other => Err(ScriptError::eval(
                        line,
                        format!("'{}' object has no attribute '{attr}'", other.type_name()),
                    )),
                }
            }
            ExprKind::Subscript { value, index } => {
                let container = self.eval_expr(value, scope)?;
                let index = self.eval_expr(index, scope)?;
                self.subscript(&container, &index, line)
            }
            ExprKind::Call { func, args, kwargs } => {
                let callee = self.eval_expr(func, scope)?;
                let mut arg_values = Vec::with_capacity(args.len());
                for arg in args {
                    arg_values.push(self.eval_expr(arg, scope)?);
                }
                let mut kwarg_values = BTreeMap::new();
                for (name, value) in kwargs {
                    let value = self.eval_expr(value, scope)?;
                    if kwarg_values.insert(name.clone(), value).is_some() {
                        return Err(ScriptError::eval(
                            line,
                            format!("duplicate keyword argument '{name}'"),
                        ));
                    }
                }
                self.call_value(&callee, arg_values, kwarg_values, line)
            }
            ExprKind::Unary { op, operand } => {
                let value = self.eval_expr(operand, scope)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
                    UnaryOp::Pos => match value {
                        Value::Int(_) | Value::Float(_) => Ok(value),
                        other => Err(ScriptError::eval(
                            line,
                            format!("bad operand type for unary +: '{}'", other.type_name()),
                        )),
                    },
                    UnaryOp::Neg => match value {
                        Value::Int(n) => n
                            .checked_neg()
                            .map(Value::Int)
                            .ok_or_else(|| ScriptError::eval(line, "integer overflow")),
                        Value::Float(f) => Ok(Value::Float(-f)),
                        other => Err(ScriptError::eval(
                            line,
                            format!("bad operand type for unary -: '{}'", other.type_name()),
                        )),
                    },
                }
            }
            ExprKind::Binary { op, left, right } => {
                let left = self.eval_expr(left, scope)?;
                let right = self.eval_expr(right, scope)?;
                binary_op(*op, &left, &right, line)
            }
            ExprKind::Compare { op, left, right } => {
                let left = self.eval_expr(left, scope)?;
                let right = self.eval_expr(right, scope)?;
                compare_op(*op, &left, &right, line)
            }
            ExprKind::BoolExpr { op, left, right } => {
                let left = self.eval_expr(left, scope)?;
                match op {
                    BoolOp::And => {
                        if left.truthy() {
                            self.eval_expr(right, scope)
                        } else {
                            Ok(left)
                        }
                    }
                    BoolOp::Or => {
                        if left.truthy() {
                            Ok(left)
                        } else {
                            self.eval_expr(right, scope)
                        }
                    }
                }
            }
        }
    }

    fn subscript(
        &self,
        container: &Value,
        index: &Value,
        line: usize,
    ) -> Result<Value, ScriptError> {
        match (container, index) {
            (Value::List(items), Value::Int(i)) => {
                let idx = normalize_index(*i, items.len())
                    .ok_or_else(|| ScriptError::eval(line, "list index out of range"))?;
                Ok(items[idx].clone())
            }
            (Value::Str(s), Value::Int(i)) => {
                let chars: Vec<char> = s.chars().collect();
                let idx = normalize_index(*i, chars.len())
                    .ok_or_else(|| ScriptError::eval(line, "string index out of range"))?;
                Ok(Value::Str(chars[idx].to_string()))
            }
            (Value::Dict(map), Value::Str(key)) => map
                .get(key)
                .cloned()
                .ok_or_else(|| ScriptError::eval(line, format!("key '{key}' not found"))),
            (container, index) => Err(ScriptError::eval(
                line,
                format!(
                    "'{}' indices must be valid for '{}'",
                    index.type_name(),
                    container.type_name()
                ),
            )),
        }
    }

    fn call_value(
        &mut self,
        callee: &Value,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
        line: usize,
    ) -> Result<Value, ScriptError> {
        match callee {
            Value::Function(def) => {
                if self.depth >= MAX_CALL_DEPTH {
                    return Err(ScriptError::eval(line, "maximum call depth exceeded"));
                }
                let mut locals = HashMap::new();
                if args.len() > def.params.len() {
                    return Err(ScriptError::eval(
                        line,
                        format!(
                            "{}() takes {} arguments but {} were given",
                            def.name,
                            def.params.len(),
                            args.len()
                        ),
                    ));
                }
                for (param, value) in def.params.iter().zip(args.into_iter()) {
                    locals.insert(param.clone(), value);
                }
                for (name, value) in kwargs {
                    if !def.params.contains(&name) {
                        return Err(ScriptError::eval(
                            line,
                            format!("{}() got an unexpected keyword argument '{name}'", def.name),
                        ));
                    }
                    if locals.insert(name.clone(), value).is_some() {
                        return Err(ScriptError::eval(
                            line,
                            format!("{}() got multiple values for argument '{name}'", def.name),
                        ));
                    }
                }
                for param in &def.params {
                    if !locals.contains_key(param) {
                        return Err(ScriptError::eval(
                            line,
                            format!("{}() missing required argument '{param}'", def.name),
                        ));
                    }
                }
                self.depth += 1;
                let flow = self.exec_stmts(&def.body, &mut locals);
                self.depth -= 1;
                match flow? {
                    Flow::Return(value) => Ok(value),
                    _ => Ok(Value::None),
                }
            }
            Value::Builtin(builtin) => self.call_builtin(*builtin, args, kwargs, line),
            Value::DomainMethod(method) => self.call_domain_method(*method, args, kwargs, line),
            Value::Code(handle) => Err(ScriptError::eval(
                line,
                format!(
                    "user code '{}' is not directly callable; pass it to domain.launch_job",
                    handle.name
                ),
            )),
            other => Err(ScriptError::eval(
                line,
                format!("'{}' object is not callable", other.type_name()),
            )),
        }
    }

    fn call_domain_method(
        &mut self,
        method: DomainMethod,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
        line: usize,
    ) -> Result<Value, ScriptError> {
        let hooks = self
            .hooks
            .ok_or_else(|| ScriptError::eval(line, "domain is not available in this execution"))?;
        let as_int = |value: &Value| -> Result<i64, ScriptError> {
            match value {
                Value::Int(n) => Ok(*n),
                other => Err(ScriptError::eval(
                    line,
                    format!("expected an int, got '{}'", other.type_name()),
                )),
            }
        };
        match method {
            DomainMethod::InitProgress => {
                if args.len() != 1 || !kwargs.is_empty() {
                    return Err(ScriptError::eval(line, "init_progress expects one argument"));
                }
                hooks
                    .init_progress(as_int(&args[0])?)
                    .map_err(|e| ScriptError::eval(line, e))?;
                Ok(Value::None)
            }
            DomainMethod::SetProgress => {
                if args.len() != 1 || !kwargs.is_empty() {
                    return Err(ScriptError::eval(line, "set_progress expects one argument"));
                }
                hooks
                    .set_progress(as_int(&args[0])?)
                    .map_err(|e| ScriptError::eval(line, e))?;
                Ok(Value::None)
            }
            DomainMethod::IncrementProgress => {
                if args.len() > 1 || !kwargs.is_empty() {
                    return Err(ScriptError::eval(
                        line,
                        "increment_progress expects at most one argument",
                    ));
                }
                let by = match args.first() {
                    Some(value) => as_int(value)?,
                    None => 1,
                };
                hooks
                    .increment_progress(by)
                    .map_err(|e| ScriptError::eval(line, e))?;
                Ok(Value::None)
            }
            DomainMethod::LaunchJob => {
                let Some(Value::Code(handle)) = args.first() else {
                    return Err(ScriptError::eval(
                        line,
                        "launch_job expects a submitted function as its first argument",
                    ));
                };
                if args.len() > 1 {
                    return Err(ScriptError::eval(
                        line,
                        "launch_job arguments after the function must be keywords",
                    ));
                }
                let job = hooks
                    .launch_job(handle, kwargs)
                    .map_err(|e| ScriptError::eval(line, e))?;
                Ok(Value::Job(job))
            }
        }
    }

    fn call_builtin(
        &mut self,
        builtin: Builtin,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
        line: usize,
    ) -> Result<Value, ScriptError> {
        if builtin != Builtin::Print && !kwargs.is_empty() {
            return Err(ScriptError::eval(
                line,
                format!("{}() takes no keyword arguments", builtin.name()),
            ));
        }
        let arity = |expected: std::ops::RangeInclusive<usize>| -> Result<(), ScriptError> {
            if expected.contains(&args.len()) {
                Ok(())
            } else {
                Err(ScriptError::eval(
                    line,
                    format!("{}() got {} arguments", builtin.name(), args.len()),
                ))
            }
        };
        match builtin {
            Builtin::Print => {
                let mut sep = " ".to_string();
                let mut end = "\n".to_string();
                for (name, value) in kwargs {
                    match (name.as_str(), value) {
                        ("sep", Value::Str(s)) => sep = s,
                        ("end", Value::Str(s)) => end = s,
                        (other, _) => {
                            return Err(ScriptError::eval(
                                line,
                                format!("print() got an unexpected keyword argument '{other}'"),
                            ));
                        }
                    }
                }
                let parts: Vec<String> = args.iter().map(Value::display).collect();
                let text = format!("{}{end}", parts.join(&sep));
                self.sink.write(&text);
                Ok(Value::None)
            }
            Builtin::Len => {
                arity(1..=1)?;
                let len = match &args[0] {
                    Value::Str(s) => s.chars().count(),
                    Value::Bytes(b) => b.len(),
                    Value::List(items) => items.len(),
                    Value::Dict(map) => map.len(),
                    other => {
                        return Err(ScriptError::eval(
                            line,
                            format!("object of type '{}' has no len()", other.type_name()),
                        ));
                    }
                };
                Ok(Value::Int(len as i64))
            }
            Builtin::Range => {
                arity(1..=3)?;
                let ints: Vec<i64> = args
                    .iter()
                    .map(|v| match v {
                        Value::Int(n) => Ok(*n),
                        other => Err(ScriptError::eval(
                            line,
                            format!("range() expects ints, got '{}'", other.type_name()),
                        )),
                    })
                    .collect::<Result<_, _>>()?;
                let (start, stop, step) = match ints.as_slice() {
                    [stop] => (0, *stop, 1),
                    [start, stop] => (*start, *stop, 1),
                    [start, stop, step] => (*start, *stop, *step),
                    _ => (0, 0, 1),
                };
                if step == 0 {
                    return Err(ScriptError::eval(line, "range() step must not be zero"));
                }
                let mut items = Vec::new();
                let mut current = start;
                while (step > 0 && current < stop) || (step < 0 && current > stop) {
                    items.push(Value::Int(current));
                    if items.len() as i64 > MAX_RANGE_LEN {
                        return Err(ScriptError::eval(line, "range() result is too large"));
                    }
                    current += step;
                }
                Ok(Value::List(items))
            }
            Builtin::Sum => {
                arity(1..=1)?;
                let Value::List(items) = &args[0] else {
                    return Err(ScriptError::eval(line, "sum() expects a list"));
                };
                let mut total = Value::Int(0);
                for item in items {
                    total = binary_op(BinOp::Add, &total, item, line)?;
                }
                Ok(total)
            }
            Builtin::Min | Builtin::Max => {
                let items: Vec<Value> = if args.len() == 1 {
                    match &args[0] {
                        Value::List(items) => items.clone(),
                        other => {
                            return Err(ScriptError::eval(
                                line,
                                format!("{}() expects a list, got '{}'", builtin.name(), other.type_name()),
                            ));
                        }
                    }
                } else {
                    args.clone()
                };
                let mut iter = items.into_iter();
                let mut best = iter.next().ok_or_else(|| {
                    ScriptError::eval(line, format!("{}() of an empty sequence", builtin.name()))
                })?;
                for item in iter {
                    let take = match compare_op(CmpOp::Lt, &item, &best, line)? {
                        Value::Bool(lt) => {
                            if builtin == Builtin::Min {
                                lt
                            } else {
                                !lt && !item.loose_eq(&best)
                            }
                        }
                        _ => false,
                    };
                    if take {
                        best = item;
                    }
                }
                Ok(best)
            }
            Builtin::Abs => {
                arity(1..=1)?;
                match &args[0] {
                    Value::Int(n) => n
                        .checked_abs()
                        .map(Value::Int)
                        .ok_or_else(|| ScriptError::eval(line, "integer overflow")),
                    Value::Float(f) => Ok(Value::Float(f.abs())),
                    other => Err(ScriptError::eval(
                        line,
                        format!("bad operand type for abs(): '{}'", other.type_name()),
                    )),
                }
            }
            Builtin::Round => {
                arity(1..=2)?;
                match (&args[0], args.get(1)) {
                    (Value::Float(f), None) => Ok(Value::Int(f.round() as i64)),
                    (Value::Int(n), None) => Ok(Value::Int(*n)),
                    (Value::Float(f), Some(Value::Int(digits))) => {
                        let factor = 10f64.powi(*digits as i32);
                        Ok(Value::Float((f * factor).round() / factor))
                    }
                    (Value::Int(n), Some(Value::Int(_))) => Ok(Value::Int(*n)),
                    _ => Err(ScriptError::eval(line, "round() expects a number")),
                }
            }
            Builtin::Str => {
                arity(0..=1)?;
                Ok(Value::Str(args.first().map(Value::display).unwrap_or_default()))
            }
            Builtin::Int => {
                arity(0..=1)?;
                match args.first() {
                    None => Ok(Value::Int(0)),
                    Some(Value::Int(n)) => Ok(Value::Int(*n)),
                    Some(Value::Float(f)) => Ok(Value::Int(f.trunc() as i64)),
                    Some(Value::Bool(b)) => Ok(Value::Int(i64::from(*b))),
                    Some(Value::Str(s)) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                        ScriptError::eval(line, format!("invalid literal for int(): '{s}'"))
                    }),
                    Some(other) => Err(ScriptError::eval(
                        line,
                        format!("int() can't convert '{}'", other.type_name()),
                    )),
                }
            }
            Builtin::Float => {
                arity(0..=1)?;
                match args.first() {
                    None => Ok(Value::Float(0.0)),
                    Some(Value::Int(n)) => Ok(Value::Float(*n as f64)),
                    Some(Value::Float(f)) => Ok(Value::Float(*f)),
                    Some(Value::Bool(b)) => Ok(Value::Float(if *b { 1.0 } else { 0.0 })),
                    Some(Value::Str(s)) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                        ScriptError::eval(line, format!("invalid literal for float(): '{s}'"))
                    }),
                    Some(other) => Err(ScriptError::eval(
                        line,
                        format!("float() can't convert '{}'", other.type_name()),
                    )),
                }
            }
            Builtin::Bool => {
                arity(0..=1)?;
                Ok(Value::Bool(args.first().map(Value::truthy).unwrap_or(false)))
            }
            Builtin::List => {
                arity(0..=1)?;
                match args.first() {
                    None => Ok(Value::List(Vec::new())),
                    Some(value) => Ok(Value::List(self.iterate(value, line)?)),
                }
            }
            Builtin::Dict => {
                arity(0..=1)?;
                match args.first() {
                    None => Ok(Value::Dict(BTreeMap::new())),
                    Some(Value::Dict(map)) => Ok(Value::Dict(map.clone())),
                    Some(other) => Err(ScriptError::eval(
                        line,
                        format!("dict() can't convert '{}'", other.type_name()),
                    )),
                }
            }
        }
    }
}

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let idx = if index < 0 { index + len } else { index };
    if idx < 0 || idx >= len {
        None
    } else {
        Some(idx as usize)
    }
}

fn binary_op(op: BinOp, left: &Value, right: &Value, line: usize) -> Result<Value, ScriptError> {
    use Value::*;
    let type_error = || {
        ScriptError::eval(
            line,
            format!(
                "unsupported operand type(s) for {}: '{}' and '{}'",
                op.symbol(),
                left.type_name(),
                right.type_name()
            ),
        )
    };
    match op {
        BinOp::Add => match (left, right) {
            (Int(a), Int(b)) => a
                .checked_add(*b)
                .map(Int)
                .ok_or_else(|| ScriptError::eval(line, "integer overflow")),
            (Str(a), Str(b)) => Ok(Str(format!("{a}{b}"))),
            (Bytes(a), Bytes(b)) => {
                let mut out = a.clone();
                out.extend_from_slice(b);
                Ok(Bytes(out))
            }
            (List(a), List(b)) => {
                let mut out = a.clone();
                out.extend(b.iter().cloned());
                Ok(List(out))
            }
            _ => numeric_float(op, left, right).ok_or_else(type_error),
        },
        BinOp::Sub => match (left, right) {
            (Int(a), Int(b)) => a
                .checked_sub(*b)
                .map(Int)
                .ok_or_else(|| ScriptError::eval(line, "integer overflow")),
            _ => numeric_float(op, left, right).ok_or_else(type_error),
        },
        BinOp::Mul => match (left, right) {
            (Int(a), Int(b)) => a
                .checked_mul(*b)
                .map(Int)
                .ok_or_else(|| ScriptError::eval(line, "integer overflow")),
            _ => numeric_float(op, left, right).ok_or_else(type_error),
        },
        BinOp::Div => match (as_f64(left), as_f64(right)) {
            (Some(_), Some(b)) if b == 0.0 => Err(ScriptError::eval(line, "division by zero")),
            (Some(a), Some(b)) => Ok(Float(a / b)),
            _ => Err(type_error()),
        },
        BinOp::FloorDiv => match (left, right) {
            (Int(_), Int(0)) => Err(ScriptError::eval(line, "integer division by zero")),
            (Int(a), Int(b)) => Ok(Int(a.div_euclid(*b))),
            _ => match (as_f64(left), as_f64(right)) {
                (Some(_), Some(b)) if b == 0.0 => Err(ScriptError::eval(line, "division by zero")),
                (Some(a), Some(b)) => Ok(Float((a / b).floor())),
                _ => Err(type_error()),
            },
        },
        BinOp::Mod => match (left, right) {
            (Int(_), Int(0)) => Err(ScriptError::eval(line, "integer modulo by zero")),
            (Int(a), Int(b)) => Ok(Int(a.rem_euclid(*b))),
            _ => Err(type_error()),
        },
        BinOp::Pow => match (left, right) {
            (Int(a), Int(b)) if *b >= 0 => {
                let exp = u32::try_from(*b)
                    .map_err(|_| ScriptError::eval(line, "exponent is too large"))?;
                a.checked_pow(exp)
                    .map(Int)
                    .ok_or_else(|| ScriptError::eval(line, "integer overflow"))
            }
            _ => match (as_f64(left), as_f64(right)) {
                (Some(a), Some(b)) => Ok(Float(a.powf(b))),
                _ => Err(type_error()),
            },
        },
    }
}

fn numeric_float(op: BinOp, left: &Value, right: &Value) -> Option<Value> {
    let a = as_f64(left)?;
    let b = as_f64(right)?;
    let out = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        _ => return None,
    };
    Some(Value::Float(out))
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Int(n) => Some(*n as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn compare_op(op: CmpOp, left: &Value, right: &Value, line: usize) -> Result<Value, ScriptError> {
    match op {
        CmpOp::Eq => return Ok(Value::Bool(left.loose_eq(right))),
        CmpOp::NotEq => return Ok(Value::Bool(!left.loose_eq(right))),
        CmpOp::In | CmpOp::NotIn => {
            let contains = match right {
                Value::List(items) => items.iter().any(|item| item.loose_eq(left)),
                Value::Dict(map) => match left {
                    Value::Str(key) => map.contains_key(key),
                    _ => false,
                },
                Value::Str(haystack) => match left {
                    Value::Str(needle) => haystack.contains(needle.as_str()),
                    _ => {
                        return Err(ScriptError::eval(
                            line,
                            "'in <string>' requires a string operand",
                        ));
                    }
                },
                other => {
                    return Err(ScriptError::eval(
                        line,
                        format!("argument of type '{}' is not a container", other.type_name()),
                    ));
                }
            };
            let result = if op == CmpOp::In { contains } else { !contains };
            return Ok(Value::Bool(result));
        }
        _ => {}
    }
    let ordering = match (left, right) {
        (Value::Str(a), Value::Str(b)) => a.partial_cmp(b),
        _ => match (as_f64(left), as_f64(right)) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
    };
    let Some(ordering) = ordering else {
        return Err(ScriptError::eval(
            line,
            format!(
                "'{}' not supported between '{}' and '{}'",
                op.symbol(),
                left.type_name(),
                right.type_name()
            ),
        ));
    };
    let result = match op {
        CmpOp::Lt => ordering.is_lt(),
        CmpOp::LtEq => ordering.is_le(),
        CmpOp::Gt => ordering.is_gt(),
        CmpOp::GtEq => ordering.is_ge(),
        _ => false,
    };
    Ok(Value::Bool(result))
}
