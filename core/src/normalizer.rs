//! Parses a submitted function, rejects disallowed globals and rewrites it
//! into the callable wrapper the runtime executes.
//!
//! The wrapper keeps the original parameter list verbatim, assigns the
//! call's return value to a local `result` and returns it:
//!
//! ```text
//! def user_func_<name>_<key>_<hash>(x, y):
//!     def <name>(x, y):
//!         ...
//!     result = <name>(x=x, y=y)
//!     return result
//! ```

use std::collections::BTreeMap;
use std::collections::HashSet;

use crate::error::CodeError;
use crate::error::Result;
use crate::lang::Expr;
use crate::lang::ExprKind;
use crate::lang::FunctionDef;
use crate::lang::Module;
use crate::lang::SANDBOX_BUILTINS;
use crate::lang::Stmt;
use crate::lang::StmtKind;
use crate::lang::parse_module;
use crate::lang::unparse_module;

/// Parameter name under which the restricted domain handle is injected.
pub const DOMAIN_PARAM: &str = "domain";

/// Methods sandboxed code may call on the injected `domain` handle.
const DOMAIN_CAPABILITIES: &[&str] =
    &["init_progress", "set_progress", "increment_progress", "launch_job"];

/// Marker value recorded for every nested launch-job target. Targets are
/// resolved to concrete record ids at submission time.
pub const NESTED_LATEST: &str = "latest";

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedCode {
    /// Canonical rewritten source whose single top-level definition is the
    /// wrapper function.
    pub parsed_code: String,
    /// Parameter list of the submitted function, in order.
    pub params: Vec<String>,
    /// True iff `domain` appears in the parameter list.
    pub uses_domain: bool,
    /// Named user-code functions invoked via `domain.launch_job(...)`.
    pub nested_requests: BTreeMap<String, String>,
}

/// Rewrites `raw_source` into the wrapper named `wrapper_name`. The rewrite
/// is idempotent: feeding the rewritten source back in with the same names
/// yields byte-identical output.
pub fn parse_and_rewrite(
    raw_source: &str,
    func_name: &str,
    wrapper_name: &str,
) -> Result<NormalizedCode> {
    let module = parse_module(raw_source)
        .map_err(|e| CodeError::NormalizerRejected { reason: e.to_string() })?;

    let [stmt] = module.body.as_slice() else {
        return Err(CodeError::NormalizerRejected {
            reason: "source must define exactly one top-level function".to_string(),
        });
    };
    let StmtKind::FunctionDef(def) = &stmt.kind else {
        return Err(CodeError::NormalizerRejected {
            reason: "source must define exactly one top-level function".to_string(),
        });
    };

    // Already-rewritten input: unwrap the inner definition and re-emit the
    // canonical form instead of wrapping twice.
    let inner = if def.name == wrapper_name {
        unwrap_existing_wrapper(def, func_name)?
    } else {
        def.clone()
    };

    if inner.name != func_name {
        return Err(CodeError::NormalizerRejected {
            reason: format!("expected a function named '{func_name}', found '{}'", inner.name),
        });
    }

    let mut stripped = inner;
    stripped.decorators.clear();

    let uses_domain = stripped.params.iter().any(|p| p == DOMAIN_PARAM);
    let nested_requests = locate_launch_jobs(&stripped, uses_domain)?;

    // Launch-job targets resolve through the execution globals, so they are
    // legitimate names even though nothing in the source binds them.
    let mut allowed: HashSet<String> = SANDBOX_BUILTINS.iter().map(|s| s.to_string()).collect();
    allowed.extend(nested_requests.keys().cloned());
    check_free_names(&stripped, &allowed)?;
    check_domain_capabilities(&stripped)?;

    let wrapper = build_wrapper(&stripped, wrapper_name);
    let parsed_code = unparse_module(&Module { body: vec![wrapper] });

    Ok(NormalizedCode {
        parsed_code,
        params: stripped.params.clone(),
        uses_domain,
        nested_requests,
    })
}

/// Renders the textual signature recorded on submissions, e.g. `(x, y)`.
pub fn render_signature(params: &[String]) -> String {
    format!("({})", params.join(", "))
}

fn unwrap_existing_wrapper(def: &FunctionDef, func_name: &str) -> Result<FunctionDef> {
    if let [inner_stmt, assign, ret] = def.body.as_slice()
        && let StmtKind::FunctionDef(inner) = &inner_stmt.kind
        && inner.name == func_name
        && matches!(&assign.kind, StmtKind::Assign { target, .. } if target == "result")
        && matches!(
            &ret.kind,
            StmtKind::Return(Some(Expr { kind: ExprKind::Name(name), .. })) if name == "result"
        )
    {
        return Ok(inner.clone());
    }
    Err(CodeError::NormalizerRejected {
        reason: format!("function name '{}' collides with the generated wrapper", def.name),
    })
}

fn build_wrapper(inner: &FunctionDef, wrapper_name: &str) -> Stmt {
    let call = Expr {
        line: 1,
        kind: ExprKind::Call {
            func: Box::new(Expr { line: 1, kind: ExprKind::Name(inner.name.clone()) }),
            args: Vec::new(),
            kwargs: inner
                .params
                .iter()
                .map(|p| (p.clone(), Expr { line: 1, kind: ExprKind::Name(p.clone()) }))
                .collect(),
        },
    };
    let body = vec![
        Stmt { line: 1, kind: StmtKind::FunctionDef(inner.clone()) },
        Stmt { line: 1, kind: StmtKind::Assign { target: "result".to_string(), value: call } },
        Stmt {
            line: 1,
            kind: StmtKind::Return(Some(Expr { line: 1, kind: ExprKind::Name("result".to_string()) })),
        },
    ];
    Stmt {
        line: 1,
        kind: StmtKind::FunctionDef(FunctionDef {
            name: wrapper_name.to_string(),
            params: inner.params.clone(),
            decorators: Vec::new(),
            body,
        }),
    }
}

/// Collects `domain.launch_job(<name>, ...)` callees. Only reachable when
/// `domain` is a declared parameter; otherwise any `domain` reference is a
/// free name and rejected by [`check_free_names`].
fn locate_launch_jobs(
    def: &FunctionDef,
    uses_domain: bool,
) -> Result<BTreeMap<String, String>> {
    let mut nested = BTreeMap::new();
    if !uses_domain {
        return Ok(nested);
    }
    let mut walk = |expr: &Expr| -> Result<()> {
        if let ExprKind::Call { func, args, .. } = &expr.kind
            && let ExprKind::Attribute { value, attr } = &func.kind
            && attr == "launch_job"
            && matches!(&value.kind, ExprKind::Name(name) if name == DOMAIN_PARAM)
        {
            match args.first().map(|a| &a.kind) {
                Some(ExprKind::Name(target)) => {
                    nested.insert(target.clone(), NESTED_LATEST.to_string());
                }
                _ => {
                    return Err(CodeError::NormalizerRejected {
                        reason: "launch_job target must be a named submitted function".to_string(),
                    });
                }
            }
        }
        Ok(())
    };
    visit_exprs(&def.body, &mut walk)?;
    Ok(nested)
}

/// Rejects any attribute access on `domain` outside the closed capability
/// set. Writes are impossible: attribute assignment does not parse.
fn check_domain_capabilities(def: &FunctionDef) -> Result<()> {
    let mut walk = |expr: &Expr| -> Result<()> {
        if let ExprKind::Attribute { value, attr } = &expr.kind
            && matches!(&value.kind, ExprKind::Name(name) if name == DOMAIN_PARAM)
            && !DOMAIN_CAPABILITIES.contains(&attr.as_str())
        {
            return Err(CodeError::NormalizerRejected {
                reason: format!("domain has no method '{attr}'"),
            });
        }
        Ok(())
    };
    visit_exprs(&def.body, &mut walk)
}

/// Syntactic free-name analysis. A name is bound if it is a parameter, is
/// assigned anywhere in the enclosing function, is the target of a `for`
/// loop or `except ... as`, or names a nested definition. Anything else
/// must be on the allow-list.
fn check_free_names(def: &FunctionDef, allowed: &HashSet<String>) -> Result<()> {
    let mut bound: HashSet<String> = allowed.clone();
    bound.extend(def.params.iter().cloned());
    check_scope(&def.body, &bound)
}

fn check_scope(body: &[Stmt], inherited: &HashSet<String>) -> Result<()> {
    let mut bound = inherited.clone();
    collect_bindings(body, &mut bound);

    for stmt in body {
        check_stmt(stmt, &bound)?;
    }
    Ok(())
}

fn collect_bindings(body: &[Stmt], bound: &mut HashSet<String>) {
    for stmt in body {
        match &stmt.kind {
            StmtKind::FunctionDef(def) => {
                bound.insert(def.name.clone());
            }
            StmtKind::Assign { target, .. } => {
                bound.insert(target.clone());
            }
            StmtKind::For { target, body, .. } => {
                bound.insert(target.clone());
                collect_bindings(body, bound);
            }
            StmtKind::If { branches, orelse } => {
                for (_, branch) in branches {
                    collect_bindings(branch, bound);
                }
                collect_bindings(orelse, bound);
            }
            StmtKind::While { body, .. } => collect_bindings(body, bound),
            StmtKind::Try { body, binding, handler } => {
                if let Some(name) = binding {
                    bound.insert(name.clone());
                }
                collect_bindings(body, bound);
                collect_bindings(handler, bound);
            }
            _ => {}
        }
    }
}

fn check_stmt(stmt: &Stmt, bound: &HashSet<String>) -> Result<()> {
    match &stmt.kind {
        StmtKind::FunctionDef(def) => {
            let mut child = bound.clone();
            child.extend(def.params.iter().cloned());
            check_scope(&def.body, &child)
        }
        StmtKind::Return(value) => match value {
            Some(expr) => check_expr(expr, bound),
            None => Ok(()),
        },
        StmtKind::Assign { value, .. } => check_expr(value, bound),
        StmtKind::Expr(expr) => check_expr(expr, bound),
        StmtKind::If { branches, orelse } => {
            for (test, body) in branches {
                check_expr(test, bound)?;
                for inner in body {
                    check_stmt(inner, bound)?;
                }
            }
            for inner in orelse {
                check_stmt(inner, bound)?;
            }
            Ok(())
        }
        StmtKind::For { iter, body, .. } => {
            check_expr(iter, bound)?;
            for inner in body {
                check_stmt(inner, bound)?;
            }
            Ok(())
        }
        StmtKind::While { test, body } => {
            check_expr(test, bound)?;
            for inner in body {
                check_stmt(inner, bound)?;
            }
            Ok(())
        }
        StmtKind::Try { body, handler, .. } => {
            for inner in body.iter().chain(handler) {
                check_stmt(inner, bound)?;
            }
            Ok(())
        }
        StmtKind::Pass | StmtKind::Break | StmtKind::Continue => Ok(()),
    }
}

fn check_expr(expr: &Expr, bound: &HashSet<String>) -> Result<()> {
    match &expr.kind {
        ExprKind::Name(name) => {
            if bound.contains(name) {
                Ok(())
            } else {
                Err(CodeError::NormalizerRejected {
                    reason: format!("reference to disallowed global '{name}'"),
                })
            }
        }
        ExprKind::List(items) => {
            for item in items {
                check_expr(item, bound)?;
            }
            Ok(())
        }
        ExprKind::Dict(entries) => {
            for (key, value) in entries {
                check_expr(key, bound)?;
                check_expr(value, bound)?;
            }
            Ok(())
        }
        ExprKind::Attribute { value, .. } => check_expr(value, bound),
        ExprKind::Subscript { value, index } => {
            check_expr(value, bound)?;
            check_expr(index, bound)
        }
        ExprKind::Call { func, args, kwargs } => {
            check_expr(func, bound)?;
            for arg in args {
                check_expr(arg, bound)?;
            }
            for (_, value) in kwargs {
                check_expr(value, bound)?;
            }
            Ok(())
        }
        ExprKind::Unary { operand, .. } => check_expr(operand, bound),
        ExprKind::Binary { left, right, .. }
        | ExprKind::Compare { left, right, .. }
        | ExprKind::BoolExpr { left, right, .. } => {
            check_expr(left, bound)?;
            check_expr(right, bound)
        }
        _ => Ok(()),
    }
}

/// Applies `walk` to every expression in the statement tree, in source
/// order, recursing through nested definitions and sub-expressions.
fn visit_exprs<F>(body: &[Stmt], walk: &mut F) -> Result<()>
where
    F: FnMut(&Expr) -> Result<()>,
{
    for stmt in body {
        match &stmt.kind {
            StmtKind::FunctionDef(def) => visit_exprs(&def.body, walk)?,
            StmtKind::Return(Some(expr)) | StmtKind::Assign { value: expr, .. } | StmtKind::Expr(expr) => {
                visit_expr(expr, walk)?;
            }
            StmtKind::Return(None) | StmtKind::Pass | StmtKind::Break | StmtKind::Continue => {}
            StmtKind::If { branches, orelse } => {
                for (test, branch) in branches {
                    visit_expr(test, walk)?;
                    visit_exprs(branch, walk)?;
                }
                visit_exprs(orelse, walk)?;
            }
            StmtKind::For { iter, body, .. } => {
                visit_expr(iter, walk)?;
                visit_exprs(body, walk)?;
            }
            StmtKind::While { test, body } => {
                visit_expr(test, walk)?;
                visit_exprs(body, walk)?;
            }
            StmtKind::Try { body, handler, .. } => {
                visit_exprs(body, walk)?;
                visit_exprs(handler, walk)?;
            }
        }
    }
    Ok(())
}

fn visit_expr<F>(expr: &Expr, walk: &mut F) -> Result<()>
where
    F: FnMut(&Expr) -> Result<()>,
{
    walk(expr)?;
    match &expr.kind {
        ExprKind::List(items) => {
            for item in items {
                visit_expr(item, walk)?;
            }
        }
        ExprKind::Dict(entries) => {
            for (key, value) in entries {
                visit_expr(key, walk)?;
                visit_expr(value, walk)?;
            }
        }
        ExprKind::Attribute { value, .. } => visit_expr(value, walk)?,
        ExprKind::Subscript { value, index } => {
            visit_expr(value, walk)?;
            visit_expr(index, walk)?;
        }
        ExprKind::Call { func, args, kwargs } => {
            visit_expr(func, walk)?;
            for arg in args {
                visit_expr(arg, walk)?;
            }
            for (_, value) in kwargs {
                visit_expr(value, walk)?;
            }
        }
        ExprKind::Unary { operand, .. } => visit_expr(operand, walk)?,
        ExprKind::Binary { left, right, .. }
        | ExprKind::Compare { left, right, .. }
        | ExprKind::BoolExpr { left, right, .. } => {
            visit_expr(left, walk)?;
            visit_expr(right, walk)?;
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    const WRAPPER: &str = "user_func_f_abc_123";

    #[test]
    fn wraps_minimal_function() {
        let normalized = parse_and_rewrite("def f():\n    return 1\n", "f", WRAPPER).expect("rewrite");
        assert!(!normalized.uses_domain);
        assert!(normalized.nested_requests.is_empty());
        assert_eq!(
            normalized.parsed_code,
            format!("def {WRAPPER}():\n    def f():\n        return 1\n    result = f()\n    return result\n")
        );
    }

    #[test]
    fn wrapper_preserves_parameter_list() {
        let normalized =
            parse_and_rewrite("def f(x, y):\n    return x + y\n", "f", WRAPPER).expect("rewrite");
        assert_eq!(normalized.params, vec!["x".to_string(), "y".to_string()]);
        assert!(normalized.parsed_code.contains("result = f(x=x, y=y)"));
    }

    #[test]
    fn rewrite_is_idempotent() {
        let first = parse_and_rewrite("def f(x):\n    return x + 1\n", "f", WRAPPER).expect("first");
        let second = parse_and_rewrite(&first.parsed_code, "f", WRAPPER).expect("second");
        assert_eq!(first.parsed_code, second.parsed_code);
        assert_eq!(first.uses_domain, second.uses_domain);
        assert_eq!(first.nested_requests, second.nested_requests);
    }

    #[test]
    fn strips_decorators() {
        let src = "@task(pool=\"small\")\ndef f():\n    return 1\n";
        let normalized = parse_and_rewrite(src, "f", WRAPPER).expect("rewrite");
        assert!(!normalized.parsed_code.contains('@'));
    }

    #[test]
    fn rejects_free_global_by_name() {
        let err = parse_and_rewrite("def g():\n    return X\n", "g", WRAPPER).unwrap_err();
        let CodeError::NormalizerRejected { reason } = err else {
            panic!("expected NormalizerRejected, got {err:?}");
        };
        assert!(reason.contains('X'), "{reason}");
    }

    #[test]
    fn allows_builtins_and_locals() {
        let src = "def f(items):\n    total = 0\n    for item in items:\n        total = total + item\n    return max(total, len(items))\n";
        parse_and_rewrite(src, "f", WRAPPER).expect("rewrite");
    }

    #[test]
    fn detects_uses_domain_and_nested_requests() {
        let src = "def h(domain):\n    job = domain.launch_job(test_inner)\n    return job\n";
        let normalized = parse_and_rewrite(src, "h", WRAPPER).expect("rewrite");
        assert!(normalized.uses_domain);
        assert_eq!(
            normalized.nested_requests,
            BTreeMap::from([("test_inner".to_string(), "latest".to_string())])
        );
    }

    #[test]
    fn launch_job_without_domain_param_is_rejected() {
        let err =
            parse_and_rewrite("def h():\n    return domain.launch_job(inner)\n", "h", WRAPPER)
                .unwrap_err();
        let CodeError::NormalizerRejected { reason } = err else {
            panic!("expected NormalizerRejected");
        };
        assert!(reason.contains("domain"), "{reason}");
    }

    #[test]
    fn unknown_domain_method_is_rejected() {
        let err = parse_and_rewrite(
            "def h(domain):\n    return domain.shutdown()\n",
            "h",
            WRAPPER,
        )
        .unwrap_err();
        let CodeError::NormalizerRejected { reason } = err else {
            panic!("expected NormalizerRejected");
        };
        assert!(reason.contains("shutdown"), "{reason}");
    }

    #[test]
    fn rejects_unparsable_source() {
        assert!(matches!(
            parse_and_rewrite("def f(:\n", "f", WRAPPER),
            Err(CodeError::NormalizerRejected { .. })
        ));
    }

    #[test]
    fn rejects_extra_top_level_statements() {
        let err = parse_and_rewrite("x = 1\ndef f():\n    return x\n", "f", WRAPPER).unwrap_err();
        let CodeError::NormalizerRejected { reason } = err else {
            panic!("expected NormalizerRejected");
        };
        assert!(reason.contains("exactly one"), "{reason}");
    }

    #[test]
    fn signature_rendering() {
        assert_eq!(render_signature(&["x".to_string(), "y".to_string()]), "(x, y)");
        assert_eq!(render_signature(&[]), "()");
    }
}
