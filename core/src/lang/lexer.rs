//! Indentation-aware lexer.
//!
//! Blocks are delimited by INDENT/DEDENT tokens computed from leading
//! spaces (tabs are rejected). Newlines inside brackets are ignored, as
//! are blank and comment-only lines.

use super::ScriptError;

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub line: usize,
    pub kind: TokenKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Newline,
    Indent,
    Dedent,
    Eof,
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Colon,
    Comma,
    Dot,
    At,
    Assign,
    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    SlashSlash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl TokenKind {
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Newline => "newline".to_string(),
            TokenKind::Indent => "indent".to_string(),
            TokenKind::Dedent => "dedent".to_string(),
            TokenKind::Eof => "end of input".to_string(),
            TokenKind::Name(name) => format!("'{name}'"),
            TokenKind::Int(value) => format!("'{value}'"),
            TokenKind::Float(value) => format!("'{value}'"),
            TokenKind::Str(_) => "string literal".to_string(),
            TokenKind::Bytes(_) => "bytes literal".to_string(),
            TokenKind::LParen => "'('".to_string(),
            TokenKind::RParen => "')'".to_string(),
            TokenKind::LBracket => "'['".to_string(),
            TokenKind::RBracket => "']'".to_string(),
            TokenKind::LBrace => "'{'".to_string(),
            TokenKind::RBrace => "'}'".to_string(),
            TokenKind::Colon => "':'".to_string(),
            TokenKind::Comma => "','".to_string(),
            TokenKind::Dot => "'.'".to_string(),
            TokenKind::At => "'@'".to_string(),
            TokenKind::Assign => "'='".to_string(),
            TokenKind::Plus => "'+'".to_string(),
            TokenKind::Minus => "'-'".to_string(),
            TokenKind::Star => "'*'".to_string(),
            TokenKind::StarStar => "'**'".to_string(),
            TokenKind::Slash => "'/'".to_string(),
            TokenKind::SlashSlash => "'//'".to_string(),
            TokenKind::Percent => "'%'".to_string(),
            TokenKind::EqEq => "'=='".to_string(),
            TokenKind::NotEq => "'!='".to_string(),
            TokenKind::Lt => "'<'".to_string(),
            TokenKind::LtEq => "'<='".to_string(),
            TokenKind::Gt => "'>'".to_string(),
            TokenKind::GtEq => "'>='".to_string(),
        }
    }
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, ScriptError> {
    let mut tokens: Vec<Token> = Vec::new();
    let mut indent_stack: Vec<usize> = vec![0];
    let mut bracket_depth: usize = 0;

    for (idx, raw_line) in source.lines().enumerate() {
        let line_no = idx + 1;

        if bracket_depth == 0 {
            let stripped = raw_line.trim_start_matches(' ');
            if stripped.is_empty() || stripped.starts_with('#') {
                continue;
            }
            if stripped.starts_with('\t') || raw_line[..raw_line.len() - stripped.len()].contains('\t')
            {
                return Err(ScriptError::parse(line_no, "tab indentation is not allowed"));
            }
            let indent = raw_line.len() - stripped.len();
            let current = *indent_stack.last().unwrap_or(&0);
            if indent > current {
                indent_stack.push(indent);
                tokens.push(Token { line: line_no, kind: TokenKind::Indent });
            } else if indent < current {
                while indent < *indent_stack.last().unwrap_or(&0) {
                    indent_stack.pop();
                    tokens.push(Token { line: line_no, kind: TokenKind::Dedent });
                }
                if indent != *indent_stack.last().unwrap_or(&0) {
                    return Err(ScriptError::parse(line_no, "unindent does not match any outer level"));
                }
            }
        }

        lex_line(raw_line, line_no, &mut tokens, &mut bracket_depth)?;

        if bracket_depth == 0 {
            tokens.push(Token { line: line_no, kind: TokenKind::Newline });
        }
    }

    if bracket_depth != 0 {
        let last = source.lines().count();
        return Err(ScriptError::parse(last, "unclosed bracket at end of input"));
    }

    let last = source.lines().count().max(1);
    while indent_stack.len() > 1 {
        indent_stack.pop();
        tokens.push(Token { line: last, kind: TokenKind::Dedent });
    }
    tokens.push(Token { line: last, kind: TokenKind::Eof });
    Ok(tokens)
}

fn lex_line(
    raw_line: &str,
    line_no: usize,
    tokens: &mut Vec<Token>,
    bracket_depth: &mut usize,
) -> Result<(), ScriptError> {
    let chars: Vec<char> = raw_line.chars().collect();
    let mut pos = 0usize;

    while pos < chars.len() {
        let ch = chars[pos];
        match ch {
            ' ' => {
                pos += 1;
            }
            '\t' => {
                if *bracket_depth == 0 {
                    return Err(ScriptError::parse(line_no, "tab characters are not allowed"));
                }
                pos += 1;
            }
            '#' => break,
            '(' => {
                *bracket_depth += 1;
                tokens.push(Token { line: line_no, kind: TokenKind::LParen });
                pos += 1;
            }
            ')' => {
                *bracket_depth = bracket_depth.saturating_sub(1);
                tokens.push(Token { line: line_no, kind: TokenKind::RParen });
                pos += 1;
            }
            '[' => {
                *bracket_depth += 1;
                tokens.push(Token { line: line_no, kind: TokenKind::LBracket });
                pos += 1;
            }
            ']' => {
                *bracket_depth = bracket_depth.saturating_sub(1);
                tokens.push(Token { line: line_no, kind: TokenKind::RBracket });
                pos += 1;
            }
            '{' => {
                *bracket_depth += 1;
                tokens.push(Token { line: line_no, kind: TokenKind::LBrace });
                pos += 1;
            }
            '}' => {
                *bracket_depth = bracket_depth.saturating_sub(1);
                tokens.push(Token { line: line_no, kind: TokenKind::RBrace });
                pos += 1;
            }
            ':' => {
                tokens.push(Token { line: line_no, kind: TokenKind::Colon });
                pos += 1;
            }
            ',' => {
                tokens.push(Token { line: line_no, kind: TokenKind::Comma });
                pos += 1;
            }
            '.' => {
                tokens.push(Token { line: line_no, kind: TokenKind::Dot });
                pos += 1;
            }
            '@' => {
                tokens.push(Token { line: line_no, kind: TokenKind::At });
                pos += 1;
            }
            '+' => {
                tokens.push(Token { line: line_no, kind: TokenKind::Plus });
                pos += 1;
            }
            '-' => {
                tokens.push(Token { line: line_no, kind: TokenKind::Minus });
                pos += 1;
            }
            '%' => {
                tokens.push(Token { line: line_no, kind: TokenKind::Percent });
                pos += 1;
            }
            '*' => {
                if chars.get(pos + 1) == Some(&'*') {
                    tokens.push(Token { line: line_no, kind: TokenKind::StarStar });
                    pos += 2;
                } else {
                    tokens.push(Token { line: line_no, kind: TokenKind::Star });
                    pos += 1;
                }
            }
            '/' => {
                if chars.get(pos + 1) == Some(&'/') {
                    tokens.push(Token { line: line_no, kind: TokenKind::SlashSlash });
                    pos += 2;
                } else {
                    tokens.push(Token { line: line_no, kind: TokenKind::Slash });
                    pos += 1;
                }
            }
            '=' => {
                if chars.get(pos + 1) == Some(&'=') {
                    tokens.push(Token { line: line_no, kind: TokenKind::EqEq });
                    pos += 2;
                } else {
                    tokens.push(Token { line: line_no, kind: TokenKind::Assign });
                    pos += 1;
                }
            }
            '!' => {
                if chars.get(pos + 1) == Some(&'=') {
                    tokens.push(Token { line: line_no, kind: TokenKind::NotEq });
                    pos += 2;
                } else {
                    return Err(ScriptError::parse(line_no, "unexpected character '!'"));
                }
            }
            '<' => {
                if chars.get(pos + 1) == Some(&'=') {
                    tokens.push(Token { line: line_no, kind: TokenKind::LtEq });
                    pos += 2;
                } else {
                    tokens.push(Token { line: line_no, kind: TokenKind::Lt });
                    pos += 1;
                }
            }
            '>' => {
                if chars.get(pos + 1) == Some(&'=') {
                    tokens.push(Token { line: line_no, kind: TokenKind::GtEq });
                    pos += 2;
                } else {
                    tokens.push(Token { line: line_no, kind: TokenKind::Gt });
                    pos += 1;
                }
            }
            '"' | '\'' => {
                let (text, consumed) = lex_string(&chars[pos..], line_no)?;
                tokens.push(Token { line: line_no, kind: TokenKind::Str(text) });
                pos += consumed;
            }
            'b' if matches!(chars.get(pos + 1), Some('"') | Some('\'')) => {
                let (text, consumed) = lex_string(&chars[pos + 1..], line_no)?;
                tokens.push(Token { line: line_no, kind: TokenKind::Bytes(text.into_bytes()) });
                pos += consumed + 1;
            }
            c if c.is_ascii_digit() => {
                let (kind, consumed) = lex_number(&chars[pos..], line_no)?;
                tokens.push(Token { line: line_no, kind });
                pos += consumed;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = pos;
                while pos < chars.len()
                    && (chars[pos].is_ascii_alphanumeric() || chars[pos] == '_')
                {
                    pos += 1;
                }
                let name: String = chars[start..pos].iter().collect();
                tokens.push(Token { line: line_no, kind: TokenKind::Name(name) });
            }
            other => {
                return Err(ScriptError::parse(line_no, format!("unexpected character '{other}'")));
            }
        }
    }
    Ok(())
}

/// Lexes a quoted string starting at `chars[0]` (the quote character).
/// Returns the decoded text and the number of characters consumed.
fn lex_string(chars: &[char], line_no: usize) -> Result<(String, usize), ScriptError> {
    let quote = chars[0];
    let mut text = String::new();
    let mut pos = 1usize;
    while pos < chars.len() {
        let ch = chars[pos];
        if ch == quote {
            return Ok((text, pos + 1));
        }
        if ch == '\\' {
            let escaped = chars
                .get(pos + 1)
                .ok_or_else(|| ScriptError::parse(line_no, "unterminated escape sequence"))?;
            match escaped {
                'n' => text.push('\n'),
                't' => text.push('\t'),
                'r' => text.push('\r'),
                '0' => text.push('\0'),
                '\\' => text.push('\\'),
                '"' => text.push('"'),
                '\'' => text.push('\''),
                other => {
                    return Err(ScriptError::parse(
                        line_no,
                        format!("unknown escape sequence '\\{other}'"),
                    ));
                }
            }
            pos += 2;
        } else {
            text.push(ch);
            pos += 1;
        }
    }
    Err(ScriptError::parse(line_no, "unterminated string literal"))
}

fn lex_number(chars: &[char], line_no: usize) -> Result<(TokenKind, usize), ScriptError> {
    let mut pos = 0usize;
    while pos < chars.len() && chars[pos].is_ascii_digit() {
        pos += 1;
    }
    let mut is_float = false;
    if chars.get(pos) == Some(&'.') && chars.get(pos + 1).is_some_and(|c| c.is_ascii_digit()) {
        is_float = true;
        pos += 1;
        while pos < chars.len() && chars[pos].is_ascii_digit() {
            pos += 1;
        }
    }
    let text: String = chars[..pos].iter().collect();
    if is_float {
        let value: f64 = text
            .parse()
            .map_err(|_| ScriptError::parse(line_no, format!("invalid float literal '{text}'")))?;
        Ok((TokenKind::Float(value), pos))
    } else {
        let value: i64 = text
            .parse()
            .map_err(|_| ScriptError::parse(line_no, format!("integer literal out of range '{text}'")))?;
        Ok((TokenKind::Int(value), pos))
    }
}
