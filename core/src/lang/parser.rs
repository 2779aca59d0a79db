//! Recursive-descent parser producing the [`Module`] tree.

use super::ScriptError;
use super::ast::BinOp;
use super::ast::BoolOp;
use super::ast::CmpOp;
use super::ast::Expr;
use super::ast::ExprKind;
use super::ast::FunctionDef;
use super::ast::Module;
use super::ast::Stmt;
use super::ast::StmtKind;
use super::ast::UnaryOp;
use super::lexer::Token;
use super::lexer::TokenKind;
use super::lexer::tokenize;

pub fn parse_module(source: &str) -> Result<Module, ScriptError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let body = parser.parse_block_until_eof()?;
    Ok(Module { body })
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &TokenKind {
        self.tokens
            .get(self.pos)
            .map(|t| &t.kind)
            .unwrap_or(&TokenKind::Eof)
    }

    fn peek_ahead(&self, n: usize) -> &TokenKind {
        self.tokens
            .get(self.pos + n)
            .map(|t| &t.kind)
            .unwrap_or(&TokenKind::Eof)
    }

    fn line(&self) -> usize {
        self.tokens.get(self.pos).map(|t| t.line).unwrap_or(1)
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        kind
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<(), ScriptError> {
        if self.peek() == kind {
            self.advance();
            Ok(())
        } else {
            Err(ScriptError::parse(
                self.line(),
                format!("expected {}, found {}", kind.describe(), self.peek().describe()),
            ))
        }
    }

    fn expect_name(&mut self) -> Result<String, ScriptError> {
        match self.peek().clone() {
            TokenKind::Name(name) if !is_keyword(&name) => {
                self.advance();
                Ok(name)
            }
            other => Err(ScriptError::parse(
                self.line(),
                format!("expected a name, found {}", other.describe()),
            )),
        }
    }

    fn at_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), TokenKind::Name(name) if name == word)
    }

    fn eat_keyword(&mut self, word: &str) -> bool {
        if self.at_keyword(word) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, word: &str) -> Result<(), ScriptError> {
        if self.eat_keyword(word) {
            Ok(())
        } else {
            Err(ScriptError::parse(
                self.line(),
                format!("expected '{word}', found {}", self.peek().describe()),
            ))
        }
    }

    fn parse_block_until_eof(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        let mut body = Vec::new();
        loop {
            match self.peek() {
                TokenKind::Eof => return Ok(body),
                TokenKind::Newline => {
                    self.advance();
                }
                _ => body.push(self.parse_statement()?),
            }
        }
    }

    /// Parses `NEWLINE INDENT stmt+ DEDENT`.
    fn parse_block(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        self.expect(&TokenKind::Newline)?;
        self.expect(&TokenKind::Indent)?;
        let mut body = Vec::new();
        loop {
            match self.peek() {
                TokenKind::Dedent => {
                    self.advance();
                    if body.is_empty() {
                        return Err(ScriptError::parse(self.line(), "empty block"));
                    }
                    return Ok(body);
                }
                TokenKind::Newline => {
                    self.advance();
                }
                TokenKind::Eof => {
                    return Err(ScriptError::parse(self.line(), "unexpected end of input in block"));
                }
                _ => body.push(self.parse_statement()?),
            }
        }
    }

    fn parse_statement(&mut self) -> Result<Stmt, ScriptError> {
        let line = self.line();
        match self.peek().clone() {
            TokenKind::At => {
                let def = self.parse_function_def()?;
                Ok(Stmt { line, kind: StmtKind::FunctionDef(def) })
            }
            TokenKind::Name(name) => match name.as_str() {
                "def" => {
                    let def = self.parse_function_def()?;
                    Ok(Stmt { line, kind: StmtKind::FunctionDef(def) })
                }
                "return" => {
                    self.advance();
                    let value = if matches!(self.peek(), TokenKind::Newline) {
                        None
                    } else {
                        Some(self.parse_expr()?)
                    };
                    self.expect(&TokenKind::Newline)?;
                    Ok(Stmt { line, kind: StmtKind::Return(value) })
                }
                "pass" => {
                    self.advance();
                    self.expect(&TokenKind::Newline)?;
                    Ok(Stmt { line, kind: StmtKind::Pass })
                }
                "break" => {
                    self.advance();
                    self.expect(&TokenKind::Newline)?;
                    Ok(Stmt { line, kind: StmtKind::Break })
                }
                "continue" => {
                    self.advance();
                    self.expect(&TokenKind::Newline)?;
                    Ok(Stmt { line, kind: StmtKind::Continue })
                }
                "if" => self.parse_if(line),
                "for" => self.parse_for(line),
                "while" => self.parse_while(line),
                "try" => self.parse_try(line),
                _ => self.parse_assign_or_expr(line),
            },
            _ => self.parse_assign_or_expr(line),
        }
    }

    fn parse_assign_or_expr(&mut self, line: usize) -> Result<Stmt, ScriptError> {
        // Single-name assignment is the only binding form. Detect it by
        // lookahead so expression statements still parse normally.
        if let TokenKind::Name(name) = self.peek().clone()
            && !is_keyword(&name)
            && *self.peek_ahead(1) == TokenKind::Assign
        {
            self.advance();
            self.advance();
            let value = self.parse_expr()?;
            self.expect(&TokenKind::Newline)?;
            return Ok(Stmt { line, kind: StmtKind::Assign { target: name, value } });
        }

        let expr = self.parse_expr()?;
        if matches!(self.peek(), TokenKind::Assign) {
            return Err(ScriptError::parse(line, "assignment target must be a plain name"));
        }
        self.expect(&TokenKind::Newline)?;
        Ok(Stmt { line, kind: StmtKind::Expr(expr) })
    }

    fn parse_function_def(&mut self) -> Result<FunctionDef, ScriptError> {
        let mut decorators = Vec::new();
        while matches!(self.peek(), TokenKind::At) {
            self.advance();
            let mut name = self.expect_name()?;
            while matches!(self.peek(), TokenKind::Dot) {
                self.advance();
                name.push('.');
                name.push_str(&self.expect_name()?);
            }
            // Decorator arguments are parsed for well-formedness and
            // discarded: the rewrite strips every decorator anyway.
            if matches!(self.peek(), TokenKind::LParen) {
                self.advance();
                while !matches!(self.peek(), TokenKind::RParen) {
                    if let TokenKind::Name(kw) = self.peek().clone()
                        && !is_keyword(&kw)
                        && *self.peek_ahead(1) == TokenKind::Assign
                    {
                        self.advance();
                        self.advance();
                    }
                    let _ = self.parse_expr()?;
                    if matches!(self.peek(), TokenKind::Comma) {
                        self.advance();
                    } else {
                        break;
                    }
                }
                self.expect(&TokenKind::RParen)?;
            }
            self.expect(&TokenKind::Newline)?;
            decorators.push(name);
        }

        self.expect_keyword("def")?;
        let name = self.expect_name()?;
        self.expect(&TokenKind::LParen)?;
        let mut params = Vec::new();
        while !matches!(self.peek(), TokenKind::RParen) {
            params.push(self.expect_name()?);
            if matches!(self.peek(), TokenKind::Comma) {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(&TokenKind::RParen)?;
        self.expect(&TokenKind::Colon)?;
        let body = self.parse_block()?;
        Ok(FunctionDef { name, params, decorators, body })
    }

    fn parse_if(&mut self, line: usize) -> Result<Stmt, ScriptError> {
        self.expect_keyword("if")?;
        let test = self.parse_expr()?;
        self.expect(&TokenKind::Colon)?;
        let body = self.parse_block()?;
        let mut branches = vec![(test, body)];
        let mut orelse = Vec::new();
        loop {
            if self.at_keyword("elif") {
                self.advance();
                let test = self.parse_expr()?;
                self.expect(&TokenKind::Colon)?;
                let body = self.parse_block()?;
                branches.push((test, body));
            } else if self.at_keyword("else") {
                self.advance();
                self.expect(&TokenKind::Colon)?;
                orelse = self.parse_block()?;
                break;
            } else {
                break;
            }
        }
        Ok(Stmt { line, kind: StmtKind::If { branches, orelse } })
    }

    fn parse_for(&mut self, line: usize) -> Result<Stmt, ScriptError> {
        self.expect_keyword("for")?;
        let target = self.expect_name()?;
        self.expect_keyword("in")?;
        let iter = self.parse_expr()?;
        self.expect(&TokenKind::Colon)?;
        let body = self.parse_block()?;
        Ok(Stmt { line, kind: StmtKind::For { target, iter, body } })
    }

    fn parse_while(&mut self, line: usize) -> Result<Stmt, ScriptError> {
        self.expect_keyword("while")?;
        let test = self.parse_expr()?;
        self.expect(&TokenKind::Colon)?;
        let body = self.parse_block()?;
        Ok(Stmt { line, kind: StmtKind::While { test, body } })
    }

    fn parse_try(&mut self, line: usize) -> Result<Stmt, ScriptError> {
        self.expect_keyword("try")?;
        self.expect(&TokenKind::Colon)?;
        let body = self.parse_block()?;
        self.expect_keyword("except")?;
        let mut binding = None;
        if !matches!(self.peek(), TokenKind::Colon) {
            // `except Exception` or `except Exception as err`. The class
            // name is accepted and ignored: script errors are untyped.
            let _class = self.expect_name()?;
            if self.eat_keyword("as") {
                binding = Some(self.expect_name()?);
            }
        }
        self.expect(&TokenKind::Colon)?;
        let handler = self.parse_block()?;
        Ok(Stmt { line, kind: StmtKind::Try { body, binding, handler } })
    }

    fn parse_expr(&mut self) -> Result<Expr, ScriptError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.parse_and()?;
        while self.at_keyword("or") {
            let line = self.line();
            self.advance();
            let right = self.parse_and()?;
            left = Expr {
                line,
                kind: ExprKind::BoolExpr {
                    op: BoolOp::Or,
                    left: Box::new(left),
                    right: Box::new(right),
                },
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.parse_not()?;
        while self.at_keyword("and") {
            let line = self.line();
            self.advance();
            let right = self.parse_not()?;
            left = Expr {
                line,
                kind: ExprKind::BoolExpr {
                    op: BoolOp::And,
                    left: Box::new(left),
                    right: Box::new(right),
                },
            };
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ScriptError> {
        if self.at_keyword("not") {
            let line = self.line();
            self.advance();
            let operand = self.parse_not()?;
            return Ok(Expr {
                line,
                kind: ExprKind::Unary { op: UnaryOp::Not, operand: Box::new(operand) },
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ScriptError> {
        let left = self.parse_arith()?;
        let line = self.line();
        let op = match self.peek() {
            TokenKind::EqEq => Some(CmpOp::Eq),
            TokenKind::NotEq => Some(CmpOp::NotEq),
            TokenKind::Lt => Some(CmpOp::Lt),
            TokenKind::LtEq => Some(CmpOp::LtEq),
            TokenKind::Gt => Some(CmpOp::Gt),
            TokenKind::GtEq => Some(CmpOp::GtEq),
            TokenKind::Name(name) if name == "in" => Some(CmpOp::In),
            TokenKind::Name(name) if name == "not" && self.peek_ahead(1) == &TokenKind::Name("in".to_string()) => {
                Some(CmpOp::NotIn)
            }
            _ => None,
        };
        let Some(op) = op else {
            return Ok(left);
        };
        if op == CmpOp::NotIn {
            self.advance();
        }
        self.advance();
        let right = self.parse_arith()?;
        Ok(Expr {
            line,
            kind: ExprKind::Compare { op, left: Box::new(left), right: Box::new(right) },
        })
    }

    fn parse_arith(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let right = self.parse_term()?;
            left = Expr {
                line,
                kind: ExprKind::Binary { op, left: Box::new(left), right: Box::new(right) },
            };
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.parse_power()?;
        loop {
            let op = match self.peek() {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::SlashSlash => BinOp::FloorDiv,
                TokenKind::Percent => BinOp::Mod,
                _ => break,
            };
            let line = self.line();
            self.advance();
            let right = self.parse_power()?;
            left = Expr {
                line,
                kind: ExprKind::Binary { op, left: Box::new(left), right: Box::new(right) },
            };
        }
        Ok(left)
    }

    fn parse_power(&mut self) -> Result<Expr, ScriptError> {
        let base = self.parse_unary()?;
        if matches!(self.peek(), TokenKind::StarStar) {
            let line = self.line();
            self.advance();
            let exponent = self.parse_power()?;
            return Ok(Expr {
                line,
                kind: ExprKind::Binary {
                    op: BinOp::Pow,
                    left: Box::new(base),
                    right: Box::new(exponent),
                },
            });
        }
        Ok(base)
    }

    fn parse_unary(&mut self) -> Result<Expr, ScriptError> {
        let line = self.line();
        match self.peek() {
            TokenKind::Minus => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(Expr {
                    line,
                    kind: ExprKind::Unary { op: UnaryOp::Neg, operand: Box::new(operand) },
                })
            }
            TokenKind::Plus => {
                self.advance();
                let operand = self.parse_unary()?;
                Ok(Expr {
                    line,
                    kind: ExprKind::Unary { op: UnaryOp::Pos, operand: Box::new(operand) },
                })
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, ScriptError> {
        let mut expr = self.parse_atom()?;
        loop {
            let line = self.line();
            match self.peek() {
                TokenKind::Dot => {
                    self.advance();
                    let attr = self.expect_name()?;
                    expr = Expr {
                        line,
                        kind: ExprKind::Attribute { value: Box::new(expr), attr },
                    };
                }
                TokenKind::LBracket => {
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect(&TokenKind::RBracket)?;
                    expr = Expr {
                        line,
                        kind: ExprKind::Subscript { value: Box::new(expr), index: Box::new(index) },
                    };
                }
                TokenKind::LParen => {
                    self.advance();
                    let (args, kwargs) = self.parse_call_args()?;
                    expr = Expr {
                        line,
                        kind: ExprKind::Call { func: Box::new(expr), args, kwargs },
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_call_args(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), ScriptError> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        while !matches!(self.peek(), TokenKind::RParen) {
            if let TokenKind::Name(name) = self.peek().clone()
                && !is_keyword(&name)
                && *self.peek_ahead(1) == TokenKind::Assign
            {
                self.advance();
                self.advance();
                let value = self.parse_expr()?;
                kwargs.push((name, value));
            } else {
                if !kwargs.is_empty() {
                    return Err(ScriptError::parse(
                        self.line(),
                        "positional argument follows keyword argument",
                    ));
                }
                args.push(self.parse_expr()?);
            }
            if matches!(self.peek(), TokenKind::Comma) {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(&TokenKind::RParen)?;
        Ok((args, kwargs))
    }

    fn parse_atom(&mut self) -> Result<Expr, ScriptError> {
        let line = self.line();
        match self.advance() {
            TokenKind::Int(value) => Ok(Expr { line, kind: ExprKind::Int(value) }),
            TokenKind::Float(value) => Ok(Expr { line, kind: ExprKind::Float(value) }),
            TokenKind::Str(value) => Ok(Expr { line, kind: ExprKind::Str(value) }),
            TokenKind::Bytes(value) => Ok(Expr { line, kind: ExprKind::Bytes(value) }),
            TokenKind::Name(name) => match name.as_str() {
                "None" => Ok(Expr { line, kind: ExprKind::NoneLit }),
                "True" => Ok(Expr { line, kind: ExprKind::Bool(true) }),
                "False" => Ok(Expr { line, kind: ExprKind::Bool(false) }),
                _ if is_keyword(&name) => Err(ScriptError::parse(
                    line,
                    format!("unexpected keyword '{name}' in expression"),
                )),
                _ => Ok(Expr { line, kind: ExprKind::Name(name) }),
            },
            TokenKind::LParen => {
                let inner = self.parse_expr()?;
                self.expect(&TokenKind::RParen)?;
                Ok(inner)
            }
            TokenKind::LBracket => {
                let mut items = Vec::new();
                while !matches!(self.peek(), TokenKind::RBracket) {
                    items.push(self.parse_expr()?);
                    if matches!(self.peek(), TokenKind::Comma) {
                        self.advance();
                    } else {
                        break;
                    }
                }
                self.expect(&TokenKind::RBracket)?;
                Ok(Expr { line, kind: ExprKind::List(items) })
            }
            TokenKind::LBrace => {
                let mut entries = Vec::new();
                while !matches!(self.peek(), TokenKind::RBrace) {
                    let key = self.parse_expr()?;
                    self.expect(&TokenKind::Colon)?;
                    let value = self.parse_expr()?;
                    entries.push((key, value));
                    if matches!(self.peek(), TokenKind::Comma) {
                        self.advance();
                    } else {
                        break;
                    }
                }
                self.expect(&TokenKind::RBrace)?;
                Ok(Expr { line, kind: ExprKind::Dict(entries) })
            }
            other => Err(ScriptError::parse(
                line,
                format!("unexpected {} in expression", other.describe()),
            )),
        }
    }
}

fn is_keyword(name: &str) -> bool {
    matches!(
        name,
        "def"
            | "return"
            | "if"
            | "elif"
            | "else"
            | "for"
            | "while"
            | "in"
            | "pass"
            | "break"
            | "continue"
            | "try"
            | "except"
            | "as"
            | "not"
            | "and"
            | "or"
            | "None"
            | "True"
            | "False"
    )
}
