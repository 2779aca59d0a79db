//! Runtime values.

use std::collections::BTreeMap;
use std::sync::Arc;

use uuid::Uuid;

use super::ast::FunctionDef;

/// Opaque handle to a submitted user-code record. Not callable from inside
/// the sandbox; only usable as the first argument of `domain.launch_job`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeHandle {
    pub id: Uuid,
    pub name: String,
}

/// Handle to a dispatched job, as seen by sandboxed code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Print,
    Len,
    Range,
    Sum,
    Min,
    Max,
    Abs,
    Round,
    Str,
    Int,
    Float,
    Bool,
    List,
    Dict,
}

impl Builtin {
    pub fn by_name(name: &str) -> Option<Builtin> {
        Some(match name {
            "print" => Builtin::Print,
            "len" => Builtin::Len,
            "range" => Builtin::Range,
            "sum" => Builtin::Sum,
            "min" => Builtin::Min,
            "max" => Builtin::Max,
            "abs" => Builtin::Abs,
            "round" => Builtin::Round,
            "str" => Builtin::Str,
            "int" => Builtin::Int,
            "float" => Builtin::Float,
            "bool" => Builtin::Bool,
            "list" => Builtin::List,
            "dict" => Builtin::Dict,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Print => "print",
            Builtin::Len => "len",
            Builtin::Range => "range",
            Builtin::Sum => "sum",
            Builtin::Min => "min",
            Builtin::Max => "max",
            Builtin::Abs => "abs",
            Builtin::Round => "round",
            Builtin::Str => "str",
            Builtin::Int => "int",
            Builtin::Float => "float",
            Builtin::Bool => "bool",
            Builtin::List => "list",
            Builtin::Dict => "dict",
        }
    }
}

/// The four methods of the injected `domain` handle. This is a closed set;
/// looking up any other attribute fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainMethod {
    InitProgress,
    SetProgress,
    IncrementProgress,
    LaunchJob,
}

impl DomainMethod {
    pub fn by_name(name: &str) -> Option<DomainMethod> {
        Some(match name {
            "init_progress" => DomainMethod::InitProgress,
            "set_progress" => DomainMethod::SetProgress,
            "increment_progress" => DomainMethod::IncrementProgress,
            "launch_job" => DomainMethod::LaunchJob,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<String, Value>),
    Builtin(Builtin),
    Function(Arc<FunctionDef>),
    Code(CodeHandle),
    Job(JobHandle),
    Domain,
    DomainMethod(DomainMethod),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "None",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Builtin(_) => "builtin",
            Value::Function(_) => "function",
            Value::Code(_) => "user code",
            Value::Job(_) => "job",
            Value::Domain => "domain",
            Value::DomainMethod(_) => "bound method",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Bytes(b) => !b.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Dict(map) => !map.is_empty(),
            _ => true,
        }
    }

    /// Structural equality. Ints and floats compare across types the way
    /// the source language does; values of unrelated types are unequal.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loose_eq(y))
            }
            (Value::Dict(a), Value::Dict(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|((ka, va), (kb, vb))| ka == kb && va.loose_eq(vb))
            }
            (Value::Job(a), Value::Job(b)) => a.id == b.id,
            (Value::Code(a), Value::Code(b)) => a.id == b.id,
            _ => false,
        }
    }

    /// Rendering used by `print` and `str()`. Byte strings decode as UTF-8,
    /// jobs render as `JOB: <id>`.
    pub fn display(&self) -> String {
        match self {
            Value::None => "None".to_string(),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Int(n) => n.to_string(),
            Value::Float(f) => {
                if f.fract() == 0.0 && f.is_finite() {
                    format!("{f:.1}")
                } else {
                    f.to_string()
                }
            }
            Value::Str(s) => s.clone(),
            Value::Bytes(b) => String::from_utf8_lossy(b).to_string(),
            Value::List(items) => {
                let parts: Vec<String> = items.iter().map(Value::repr).collect();
                format!("[{}]", parts.join(", "))
            }
            Value::Dict(map) => {
                let parts: Vec<String> = map
                    .iter()
                    .map(|(k, v)| format!("\"{k}\": {}", v.repr()))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            Value::Builtin(b) => format!("<builtin {}>", b.name()),
            Value::Function(def) => format!("<function {}>", def.name),
            Value::Code(handle) => format!("<user code {}>", handle.name),
            Value::Job(job) => format!("JOB: {}", job.id),
            Value::Domain => "<domain>".to_string(),
            Value::DomainMethod(_) => "<bound method of domain>".to_string(),
        }
    }

    fn repr(&self) -> String {
        match self {
            Value::Str(s) => format!("\"{s}\""),
            other => other.display(),
        }
    }

    /// Conversion used at the sandbox boundary when handing results back to
    /// the host and when deboxed argument payloads enter the scope.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::None => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(n) => serde_json::Value::from(*n),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::String(String::from_utf8_lossy(b).to_string()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Dict(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::Job(job) => serde_json::json!({ "job_id": job.id }),
            other => serde_json::Value::String(other.display()),
        }
    }

    pub fn from_json(value: &serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::None,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Dict(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}
