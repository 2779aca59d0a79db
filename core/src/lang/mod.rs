//! The restricted scripting language the sandbox executes.
//!
//! Submitted code is a small indentation-sensitive language: function
//! definitions, assignments to plain names, `if`/`for`/`while`/`try`,
//! arithmetic, comparisons, calls, lists and dicts. There are no imports,
//! no attribute assignment, no comprehensions and no string formatting.
//! The interpreter is a plain tree walker; isolation is authority-based,
//! so code can only reach the values placed into its scope.

mod ast;
mod interp;
mod lexer;
mod parser;
mod unparse;
mod value;

pub use ast::BinOp;
pub use ast::BoolOp;
pub use ast::CmpOp;
pub use ast::Expr;
pub use ast::ExprKind;
pub use ast::FunctionDef;
pub use ast::Module;
pub use ast::Stmt;
pub use ast::StmtKind;
pub use ast::UnaryOp;
pub use interp::DomainHooks;
pub use interp::Interp;
pub use interp::PrintSink;
pub use interp::base_globals;
pub use parser::parse_module;
pub use unparse::unparse_module;
pub use value::CodeHandle;
pub use value::JobHandle;
pub use value::Value;

use thiserror::Error;

/// Error raised while lexing, parsing or evaluating a script. Evaluation
/// errors carry the line of the deepest statement that was active, which
/// the runtime maps into the rewritten source when framing a traceback.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScriptError {
    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("line {line}: {message}")]
    Eval { line: usize, message: String },
}

impl ScriptError {
    pub fn parse(line: usize, message: impl Into<String>) -> Self {
        ScriptError::Parse { line, message: message.into() }
    }

    pub fn eval(line: usize, message: impl Into<String>) -> Self {
        ScriptError::Eval { line, message: message.into() }
    }

    pub fn line(&self) -> usize {
        match self {
            ScriptError::Parse { line, .. } | ScriptError::Eval { line, .. } => *line,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ScriptError::Parse { message, .. } | ScriptError::Eval { message, .. } => message,
        }
    }
}

/// Names the sandbox provides to every execution. Anything outside this
/// list, the function's parameters and locally bound names is a rejected
/// global reference.
pub const SANDBOX_BUILTINS: &[&str] = &[
    "print", "len", "range", "sum", "min", "max", "abs", "round", "str", "int", "float", "bool",
    "list", "dict",
];
