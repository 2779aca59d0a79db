//! Canonical pretty-printer for the syntax tree.
//!
//! The output is stable: parsing the printed text yields a structurally
//! identical tree, which is what makes the submission rewrite idempotent.

use super::ast::Expr;
use super::ast::ExprKind;
use super::ast::FunctionDef;
use super::ast::Module;
use super::ast::Stmt;
use super::ast::StmtKind;
use super::ast::UnaryOp;

const INDENT: &str = "    ";

pub fn unparse_module(module: &Module) -> String {
    let mut out = String::new();
    for stmt in &module.body {
        write_stmt(&mut out, stmt, 0);
    }
    out
}

fn write_stmt(out: &mut String, stmt: &Stmt, level: usize) {
    let pad = INDENT.repeat(level);
    match &stmt.kind {
        StmtKind::FunctionDef(def) => write_def(out, def, level),
        StmtKind::Return(value) => match value {
            Some(expr) => push_line(out, &pad, &format!("return {}", unparse_expr(expr))),
            None => push_line(out, &pad, "return"),
        },
        StmtKind::Assign { target, value } => {
            push_line(out, &pad, &format!("{target} = {}", unparse_expr(value)));
        }
        StmtKind::Expr(expr) => push_line(out, &pad, &unparse_expr(expr)),
        StmtKind::If { branches, orelse } => {
            for (idx, (test, body)) in branches.iter().enumerate() {
                let word = if idx == 0 { "if" } else { "elif" };
                push_line(out, &pad, &format!("{word} {}:", unparse_expr(test)));
                for inner in body {
                    write_stmt(out, inner, level + 1);
                }
            }
            if !orelse.is_empty() {
                push_line(out, &pad, "else:");
                for inner in orelse {
                    write_stmt(out, inner, level + 1);
                }
            }
        }
        StmtKind::For { target, iter, body } => {
            push_line(out, &pad, &format!("for {target} in {}:", unparse_expr(iter)));
            for inner in body {
                write_stmt(out, inner, level + 1);
            }
        }
        StmtKind::While { test, body } => {
            push_line(out, &pad, &format!("while {}:", unparse_expr(test)));
            for inner in body {
                write_stmt(out, inner, level + 1);
            }
        }
        StmtKind::Try { body, binding, handler } => {
            push_line(out, &pad, "try:");
            for inner in body {
                write_stmt(out, inner, level + 1);
            }
            match binding {
                Some(name) => push_line(out, &pad, &format!("except Exception as {name}:")),
                None => push_line(out, &pad, "except Exception:"),
            }
            for inner in handler {
                write_stmt(out, inner, level + 1);
            }
        }
        StmtKind::Pass => push_line(out, &pad, "pass"),
        StmtKind::Break => push_line(out, &pad, "break"),
        StmtKind::Continue => push_line(out, &pad, "continue"),
    }
}

fn write_def(out: &mut String, def: &FunctionDef, level: usize) {
    let pad = INDENT.repeat(level);
    for decorator in &def.decorators {
        push_line(out, &pad, &format!("@{decorator}"));
    }
    push_line(out, &pad, &format!("def {}({}):", def.name, def.params.join(", ")));
    for inner in &def.body {
        write_stmt(out, inner, level + 1);
    }
}

fn push_line(out: &mut String, pad: &str, text: &str) {
    out.push_str(pad);
    out.push_str(text);
    out.push('\n');
}

pub fn unparse_expr(expr: &Expr) -> String {
    match &expr.kind {
        ExprKind::NoneLit => "None".to_string(),
        ExprKind::Bool(true) => "True".to_string(),
        ExprKind::Bool(false) => "False".to_string(),
        ExprKind::Int(value) => value.to_string(),
        ExprKind::Float(value) => {
            // Keep a trailing `.0` so the literal re-lexes as a float.
            if value.fract() == 0.0 && value.is_finite() {
                format!("{value:.1}")
            } else {
                value.to_string()
            }
        }
        ExprKind::Str(value) => quote_str(value),
        ExprKind::Bytes(value) => format!("b{}", quote_str(&String::from_utf8_lossy(value))),
        ExprKind::Name(name) => name.clone(),
        ExprKind::List(items) => {
            let parts: Vec<String> = items.iter().map(unparse_expr).collect();
            format!("[{}]", parts.join(", "))
        }
        ExprKind::Dict(entries) => {
            let parts: Vec<String> = entries
                .iter()
                .map(|(k, v)| format!("{}: {}", unparse_expr(k), unparse_expr(v)))
                .collect();
            format!("{{{}}}", parts.join(", "))
        }
        ExprKind::Attribute { value, attr } => {
            format!("{}.{attr}", unparse_operand(value))
        }
        ExprKind::Subscript { value, index } => {
            format!("{}[{}]", unparse_operand(value), unparse_expr(index))
        }
        ExprKind::Call { func, args, kwargs } => {
            let mut parts: Vec<String> = args.iter().map(unparse_expr).collect();
            parts.extend(kwargs.iter().map(|(k, v)| format!("{k}={}", unparse_expr(v))));
            format!("{}({})", unparse_operand(func), parts.join(", "))
        }
        ExprKind::Unary { op, operand } => match op {
            UnaryOp::Neg => format!("-{}", unparse_operand(operand)),
            UnaryOp::Pos => format!("+{}", unparse_operand(operand)),
            UnaryOp::Not => format!("not {}", unparse_operand(operand)),
        },
        ExprKind::Binary { op, left, right } => {
            format!("{} {} {}", unparse_operand(left), op.symbol(), unparse_operand(right))
        }
        ExprKind::Compare { op, left, right } => {
            format!("{} {} {}", unparse_operand(left), op.symbol(), unparse_operand(right))
        }
        ExprKind::BoolExpr { op, left, right } => {
            let word = match op {
                super::ast::BoolOp::And => "and",
                super::ast::BoolOp::Or => "or",
            };
            format!("{} {word} {}", unparse_operand(left), unparse_operand(right))
        }
    }
}

/// Wraps compound operands in parentheses so the printed text re-parses
/// with the same shape regardless of operator precedence.
fn unparse_operand(expr: &Expr) -> String {
    match &expr.kind {
        ExprKind::Binary { .. }
        | ExprKind::Compare { .. }
        | ExprKind::BoolExpr { .. }
        | ExprKind::Unary { .. } => format!("({})", unparse_expr(expr)),
        _ => unparse_expr(expr),
    }
}

fn quote_str(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::super::parser::parse_module;
    use super::*;
    use pretty_assertions::assert_eq;

    fn round_trip(source: &str) {
        let first = parse_module(source).expect("parse original");
        let printed = unparse_module(&first);
        let second = parse_module(&printed).expect("parse printed");
        assert_eq!(first, second, "printed source:\n{printed}");
        // Printing again must be a fixed point.
        assert_eq!(printed, unparse_module(&second));
    }

    #[test]
    fn round_trips_simple_function() {
        round_trip("def f():\n    return 1\n");
    }

    #[test]
    fn round_trips_control_flow() {
        round_trip(
            "def f(n):\n    total = 0\n    for i in range(n):\n        if i % 2 == 0:\n            total = total + i\n    return total\n",
        );
    }

    #[test]
    fn round_trips_nested_wrapper_shape() {
        round_trip(
            "def outer(x):\n    def inner(x):\n        return x + 1\n    result = inner(x=x)\n    return result\n",
        );
    }

    #[test]
    fn round_trips_literals() {
        round_trip("x = [1, 2.5, \"a\\n\", b\"raw\", None, True, {\"k\": [False]}]\n");
    }

    #[test]
    fn round_trips_try_except() {
        round_trip("try:\n    x = 1 // 0\nexcept Exception as err:\n    x = 0\n");
    }

    #[test]
    fn parenthesizes_nested_operators() {
        let module = parse_module("x = 1 + 2 * 3\n").expect("parse");
        let printed = unparse_module(&module);
        assert_eq!(printed, "x = 1 + (2 * 3)\n");
        round_trip("x = 1 + 2 * 3\n");
    }
}
