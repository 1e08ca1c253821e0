//! Lexer and parser for the template dialect.
//!
//! Templates use the Go `text/template` action syntax so that templates
//! written for existing SecretProviderClass objects keep working:
//! field and variable references, pipelines (`{{ .A | printf "%q" }}`),
//! variable declarations and assignments, `if`, `with` and `range` blocks
//! with `else` chains, `break`/`continue`, builtin functions, literals,
//! `{{/* comments */}}` and the `{{-`/`-}}` whitespace trim markers.

use serde_json::Value;
use std::fmt;

use super::funcs;
use super::TemplateError;

/// Parsed template tree node.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Node {
    Text(String),
    /// `{{ pipeline }}`. Prints its value unless it declares variables.
    Action(Pipeline),
    If {
        pipe: Pipeline,
        then: Vec<Node>,
        else_body: Vec<Node>,
    },
    With {
        pipe: Pipeline,
        then: Vec<Node>,
        else_body: Vec<Node>,
    },
    Range {
        pipe: Pipeline,
        body: Vec<Node>,
        else_body: Vec<Node>,
    },
    Break,
    Continue,
}

/// Commands joined by `|`, optionally bound to variables.
#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct Pipeline {
    pub decl: Vec<String>,
    /// `=` rather than `:=`.
    pub assign: bool,
    pub cmds: Vec<Command>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Command {
    pub args: Vec<Arg>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Arg {
    Field(Expr),
    Func(String),
    Literal(Value),
    /// A parenthesized pipeline, optionally followed by field accesses.
    Pipe(Box<Pipeline>, Vec<String>),
}

/// A field reference rooted at the cursor (`.`) or at a variable (`$x`).
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Expr {
    pub root: Root,
    pub path: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Root {
    Dot,
    Var(String),
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.root {
            Root::Dot if self.path.is_empty() => return write!(f, "."),
            Root::Dot => {}
            Root::Var(name) => write!(f, "{}", name)?,
        }
        for field in &self.path {
            write!(f, ".{}", field)?;
        }
        Ok(())
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Field(expr) => write!(f, "{}", expr),
            Arg::Func(name) => write!(f, "{}", name),
            Arg::Literal(Value::String(s)) => write!(f, "{:?}", s),
            Arg::Literal(value) => write!(f, "{}", value),
            Arg::Pipe(_, fields) => {
                write!(f, "(..)")?;
                for field in fields {
                    write!(f, ".{}", field)?;
                }
                Ok(())
            }
        }
    }
}

/// Raw lexer output.
#[derive(Debug)]
enum Item {
    Text(String),
    Action { body: String, line: usize },
}

/// How a block body ended.
enum Terminator {
    Eof,
    End { line: usize },
    Else { line: usize, rest: String },
}

fn is_space(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\r' | '\n')
}

fn parse_error(line: usize, message: impl Into<String>) -> TemplateError {
    TemplateError::Parse {
        line,
        message: message.into(),
    }
}

/// Parse template source into a node list.
pub(crate) fn parse(src: &str) -> Result<Vec<Node>, TemplateError> {
    let items = lex(src)?;
    let mut parser = Parser {
        items: items.into_iter(),
        range_depth: 0,
    };

    let (nodes, terminator) = parser.parse_list()?;
    match terminator {
        Terminator::Eof => Ok(nodes),
        Terminator::End { line } => Err(parse_error(line, "unexpected {{end}}")),
        Terminator::Else { line, .. } => Err(parse_error(line, "unexpected {{else}}")),
    }
}

/// Offset of the action's closing `}}`, skipping quoted text and comments.
fn find_close(inner: &str) -> Option<usize> {
    let bytes = inner.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            quote @ (b'"' | b'\'') => {
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
                i += 1;
            }
            b'`' => {
                i += 1 + inner[i + 1..].find('`')?;
                i += 1;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2 + inner[i + 2..].find("*/")?;
                i += 2;
            }
            b'}' if bytes.get(i + 1) == Some(&b'}') => return Some(i),
            _ => i += 1,
        }
    }
    None
}

fn lex(src: &str) -> Result<Vec<Item>, TemplateError> {
    let mut items = Vec::new();
    let mut rest = src;
    let mut line = 1;
    let mut trim_next = false;

    while let Some(start) = rest.find("{{") {
        let inner = &rest[start + 2..];
        let trim_left = inner.starts_with('-') && inner[1..].starts_with(is_space);

        let mut text = &rest[..start];
        if trim_next {
            text = text.trim_start_matches(is_space);
        }
        if trim_left {
            text = text.trim_end_matches(is_space);
        }
        if !text.is_empty() {
            items.push(Item::Text(text.to_string()));
        }
        line += rest[..start].matches('\n').count();

        let close = find_close(inner).ok_or_else(|| parse_error(line, "unclosed action"))?;

        let mut raw = &inner[..close];
        if trim_left {
            raw = &raw[1..];
        }
        let trim_right = raw.ends_with('-') && raw[..raw.len() - 1].ends_with(is_space);
        if trim_right {
            raw = &raw[..raw.len() - 1];
        }

        items.push(Item::Action {
            body: raw.trim_matches(is_space).to_string(),
            line,
        });

        line += inner[..close].matches('\n').count();
        rest = &inner[close + 2..];
        trim_next = trim_right;
    }

    let tail = if trim_next {
        rest.trim_start_matches(is_space)
    } else {
        rest
    };
    if !tail.is_empty() {
        items.push(Item::Text(tail.to_string()));
    }

    Ok(items)
}

struct Parser {
    items: std::vec::IntoIter<Item>,
    range_depth: usize,
}

impl Parser {
    fn parse_list(&mut self) -> Result<(Vec<Node>, Terminator), TemplateError> {
        let mut nodes = Vec::new();

        while let Some(item) = self.items.next() {
            let (body, line) = match item {
                Item::Text(text) => {
                    nodes.push(Node::Text(text));
                    continue;
                }
                Item::Action { body, line } => (body, line),
            };

            if body.starts_with("/*") {
                if !body.ends_with("*/") {
                    return Err(parse_error(line, "comment ends before closing delimiter"));
                }
                continue;
            }

            let (keyword, rest) = match body.split_once(is_space) {
                Some((keyword, rest)) => (keyword, rest.trim_matches(is_space)),
                None => (body.as_str(), ""),
            };

            match keyword {
                "" => return Err(parse_error(line, "missing value for command")),
                "end" if rest.is_empty() => return Ok((nodes, Terminator::End { line })),
                "end" => return Err(parse_error(line, format!("unexpected {:?} in end", rest))),
                "else" => {
                    return Ok((
                        nodes,
                        Terminator::Else {
                            line,
                            rest: rest.to_string(),
                        },
                    ))
                }
                "range" => nodes.push(self.parse_range(rest, line)?),
                "if" | "with" => nodes.push(self.parse_branch(keyword, rest, line)?),
                "break" | "continue" => {
                    if !rest.is_empty() {
                        return Err(parse_error(line, format!("unexpected {:?} in {}", rest, keyword)));
                    }
                    if self.range_depth == 0 {
                        return Err(parse_error(line, format!("{{{{{}}}}} outside {{{{range}}}}", keyword)));
                    }
                    nodes.push(if keyword == "break" {
                        Node::Break
                    } else {
                        Node::Continue
                    });
                }
                "define" | "template" | "block" => {
                    return Err(parse_error(line, format!("{{{{{}}}}} is not supported", keyword)))
                }
                _ => nodes.push(Node::Action(parse_pipeline(&body, line, "command", 1)?)),
            }
        }

        Ok((nodes, Terminator::Eof))
    }

    fn parse_range(&mut self, header: &str, line: usize) -> Result<Node, TemplateError> {
        let pipe = parse_pipeline(header, line, "range", 2)?;

        self.range_depth += 1;
        let listed = self.parse_list();
        self.range_depth -= 1;

        let (body, else_body) = match listed? {
            (body, Terminator::End { .. }) => (body, Vec::new()),
            (body, Terminator::Else { line, rest }) => {
                if !rest.is_empty() {
                    return Err(parse_error(line, "unexpected arguments to {{else}} in range"));
                }
                (body, self.parse_block_end(line)?)
            }
            (_, Terminator::Eof) => return Err(parse_error(line, "unexpected EOF in range")),
        };

        Ok(Node::Range {
            pipe,
            body,
            else_body,
        })
    }

    /// Parse an `if` or `with` block, including `else if`/`else with` chains.
    fn parse_branch(
        &mut self,
        keyword: &str,
        header: &str,
        line: usize,
    ) -> Result<Node, TemplateError> {
        let pipe = parse_pipeline(header, line, keyword, 1)?;

        let (then, else_body) = match self.parse_list()? {
            (then, Terminator::End { .. }) => (then, Vec::new()),
            (then, Terminator::Else { line, rest }) if rest.is_empty() => {
                (then, self.parse_block_end(line)?)
            }
            (then, Terminator::Else { line, rest }) => {
                // Chained branches share the outer {{ end }}
                let nested = match rest.split_once(is_space) {
                    Some((chained, header)) if chained == keyword => {
                        self.parse_branch(keyword, header.trim_matches(is_space), line)?
                    }
                    _ => return Err(parse_error(line, format!("unexpected {:?} after else", rest))),
                };
                (then, vec![nested])
            }
            (_, Terminator::Eof) => {
                return Err(parse_error(line, format!("unexpected EOF in {}", keyword)))
            }
        };

        Ok(if keyword == "with" {
            Node::With {
                pipe,
                then,
                else_body,
            }
        } else {
            Node::If {
                pipe,
                then,
                else_body,
            }
        })
    }

    /// Parse an `{{ else }}` branch up to its `{{ end }}`.
    fn parse_block_end(&mut self, line: usize) -> Result<Vec<Node>, TemplateError> {
        match self.parse_list()? {
            (nodes, Terminator::End { .. }) => Ok(nodes),
            (_, Terminator::Else { line, .. }) => Err(parse_error(line, "expected end; found {{else}}")),
            (_, Terminator::Eof) => Err(parse_error(line, "unexpected EOF")),
        }
    }
}

/// Lexed action token.
#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Field(Vec<String>),
    Var(String, Vec<String>),
    Ident(String),
    Literal(Value),
    Pipe,
    LParen,
    RParen,
    Declare,
    Assign,
    Comma,
}

#[derive(Debug)]
struct Token {
    tok: Tok,
    /// Whitespace preceded the token.
    spaced: bool,
}

fn ident_len(src: &str) -> usize {
    let mut len = 0;
    for c in src.chars() {
        let ok = c.is_alphanumeric() || c == '_';
        if !ok || (len == 0 && c.is_ascii_digit()) {
            break;
        }
        len += c.len_utf8();
    }
    len
}

/// Lex a `.A.B` chain. A lone `.` is the cursor itself.
fn lex_fields(src: &str, line: usize) -> Result<(Vec<String>, usize), TemplateError> {
    let mut path = Vec::new();
    let mut len = 0;
    while src[len..].starts_with('.') {
        let n = ident_len(&src[len + 1..]);
        if n == 0 {
            if len == 0 && !src[1..].starts_with(['.', '_']) {
                return Ok((path, 1));
            }
            return Err(parse_error(line, format!("bad field in {:?}", src)));
        }
        path.push(src[len + 1..len + 1 + n].to_string());
        len += 1 + n;
    }
    Ok((path, len))
}

fn lex_number(src: &str, line: usize) -> Result<(Value, usize), TemplateError> {
    let mut len = 0;
    let mut prev = ' ';
    for (i, c) in src.char_indices() {
        let sign = matches!(c, '+' | '-') && (i == 0 || matches!(prev, 'e' | 'E'));
        if !(c.is_alphanumeric() || c == '_' || c == '.' || sign) {
            break;
        }
        prev = c;
        len = i + c.len_utf8();
    }

    let text = &src[..len];
    let bad = || parse_error(line, format!("bad number syntax: {:?}", text));
    let cleaned = text.replace('_', "");
    let (negative, digits) = match cleaned.strip_prefix('-') {
        Some(d) => (true, d),
        None => (false, cleaned.strip_prefix('+').unwrap_or(cleaned.as_str())),
    };

    let radix = match digits.get(..2) {
        Some("0x" | "0X") => Some(16),
        Some("0o" | "0O") => Some(8),
        Some("0b" | "0B") => Some(2),
        _ => None,
    };
    let value = if let Some(radix) = radix {
        let n = i64::from_str_radix(&digits[2..], radix).map_err(|_| bad())?;
        Value::from(if negative { -n } else { n })
    } else if digits.contains(['.', 'e', 'E']) {
        let f: f64 = cleaned.parse().map_err(|_| bad())?;
        serde_json::Number::from_f64(f).map(Value::Number).ok_or_else(bad)?
    } else {
        Value::from(cleaned.parse::<i64>().map_err(|_| bad())?)
    };
    Ok((value, len))
}

fn unescape(c: char, chars: &mut std::str::Chars<'_>) -> Option<char> {
    let hex = |chars: &mut std::str::Chars<'_>, n: usize| -> Option<char> {
        let digits: String = chars.take(n).collect();
        if digits.len() != n {
            return None;
        }
        u32::from_str_radix(&digits, 16).ok().and_then(char::from_u32)
    };
    Some(match c {
        'n' => '\n',
        't' => '\t',
        'r' => '\r',
        'a' => '\u{07}',
        'b' => '\u{08}',
        'f' => '\u{0C}',
        'v' => '\u{0B}',
        '0' => '\0',
        '\\' | '"' | '\'' => c,
        'x' => return hex(chars, 2),
        'u' => return hex(chars, 4),
        'U' => return hex(chars, 8),
        _ => return None,
    })
}

/// Lex a quoted string or character constant starting at `src[0]`.
fn lex_quoted(src: &str, line: usize) -> Result<(String, usize), TemplateError> {
    let quote = src.chars().next().unwrap_or('"');
    let mut out = String::new();
    let mut chars = src[1..].chars();
    let mut consumed = 1;

    loop {
        let before = chars.as_str().len();
        let c = chars
            .next()
            .ok_or_else(|| parse_error(line, "unterminated quoted string"))?;
        if c == quote {
            consumed += before - chars.as_str().len();
            return Ok((out, consumed));
        }
        if c == '\\' {
            let escaped = chars
                .next()
                .and_then(|e| unescape(e, &mut chars))
                .ok_or_else(|| parse_error(line, "invalid escape sequence"))?;
            out.push(escaped);
        } else {
            out.push(c);
        }
        consumed += before - chars.as_str().len();
    }
}

fn tokenize(src: &str, line: usize) -> Result<Vec<Token>, TemplateError> {
    let mut tokens = Vec::new();
    let mut rest = src;

    loop {
        let trimmed = rest.trim_start_matches(is_space);
        let spaced = trimmed.len() != rest.len();
        rest = trimmed;

        let Some(c) = rest.chars().next() else {
            break;
        };
        let starts_number = |s: &str| s.starts_with(|d: char| d.is_ascii_digit());

        let (tok, len) = match c {
            '|' => (Tok::Pipe, 1),
            '(' => (Tok::LParen, 1),
            ')' => (Tok::RParen, 1),
            ',' => (Tok::Comma, 1),
            '=' => (Tok::Assign, 1),
            ':' if rest.starts_with(":=") => (Tok::Declare, 2),
            '.' if !starts_number(&rest[1..]) => {
                let (path, len) = lex_fields(rest, line)?;
                (Tok::Field(path), len)
            }
            '$' => {
                let name_len = 1 + ident_len(&rest[1..]);
                let after = &rest[name_len..];
                let (path, fields_len) = if after.starts_with('.') && ident_len(&after[1..]) > 0 {
                    lex_fields(after, line)?
                } else {
                    (Vec::new(), 0)
                };
                (Tok::Var(rest[..name_len].to_string(), path), name_len + fields_len)
            }
            '"' => {
                let (s, len) = lex_quoted(rest, line)?;
                (Tok::Literal(Value::String(s)), len)
            }
            '`' => {
                let end = rest[1..]
                    .find('`')
                    .ok_or_else(|| parse_error(line, "unterminated raw quoted string"))?;
                (Tok::Literal(Value::String(rest[1..1 + end].to_string())), end + 2)
            }
            '\'' => {
                let (s, len) = lex_quoted(rest, line)?;
                let mut chars = s.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => (Tok::Literal(Value::from(c as u32)), len),
                    _ => return Err(parse_error(line, format!("malformed character constant: {}", &rest[..len]))),
                }
            }
            c if c.is_ascii_digit()
                || (matches!(c, '-' | '+' | '.') && starts_number(&rest[1..])) =>
            {
                let (value, len) = lex_number(rest, line)?;
                (Tok::Literal(value), len)
            }
            c if c.is_alphabetic() || c == '_' => {
                let len = ident_len(rest);
                let tok = match &rest[..len] {
                    "true" => Tok::Literal(Value::Bool(true)),
                    "false" => Tok::Literal(Value::Bool(false)),
                    "nil" => Tok::Literal(Value::Null),
                    name => Tok::Ident(name.to_string()),
                };
                (tok, len)
            }
            other => {
                return Err(parse_error(
                    line,
                    format!("unexpected {:?} in command", other),
                ))
            }
        };

        tokens.push(Token { tok, spaced });
        rest = &rest[len..];
    }

    Ok(tokens)
}

struct Tokens {
    toks: Vec<Token>,
    pos: usize,
    line: usize,
}

impl Tokens {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos).map(|t| &t.tok)
    }

    fn error(&self, message: impl Into<String>) -> TemplateError {
        parse_error(self.line, message)
    }

    /// Leading `$a, $b :=` or `$a =`, if present.
    fn declarations(
        &mut self,
        context: &str,
        max: usize,
    ) -> Result<(Vec<String>, bool), TemplateError> {
        let mut names = Vec::new();
        let mut i = self.pos;
        let assign = loop {
            match self.toks.get(i).map(|t| &t.tok) {
                Some(Tok::Var(name, path)) if path.is_empty() => names.push(name.clone()),
                _ => return Ok((Vec::new(), false)),
            }
            match self.toks.get(i + 1).map(|t| &t.tok) {
                Some(Tok::Comma) => i += 2,
                Some(Tok::Declare) => break false,
                Some(Tok::Assign) => break true,
                _ => return Ok((Vec::new(), false)),
            }
        };

        if names.len() > max {
            return Err(self.error(format!("too many declarations in {}", context)));
        }
        self.pos = i + 2;
        Ok((names, assign))
    }

    fn pipeline(
        &mut self,
        context: &str,
        max_decl: usize,
        in_parens: bool,
    ) -> Result<Pipeline, TemplateError> {
        let (decl, assign) = self.declarations(context, max_decl)?;
        let mut cmds = Vec::new();

        loop {
            let cmd = self.command()?;
            if cmd.args.is_empty() {
                return Err(self.error("missing value for command"));
            }
            if !cmds.is_empty() && matches!(cmd.args[0], Arg::Literal(_)) {
                return Err(self.error(format!(
                    "non executable command in pipeline stage {}",
                    cmds.len() + 1
                )));
            }
            cmds.push(cmd);

            match self.peek() {
                Some(Tok::Pipe) => self.pos += 1,
                Some(Tok::RParen) if in_parens => {
                    self.pos += 1;
                    break;
                }
                None if !in_parens => break,
                None => return Err(self.error("unclosed left paren")),
                Some(_) => return Err(self.error("unexpected right paren")),
            }
        }

        Ok(Pipeline { decl, assign, cmds })
    }

    fn command(&mut self) -> Result<Command, TemplateError> {
        let mut args = Vec::new();

        while !matches!(self.peek(), None | Some(Tok::Pipe) | Some(Tok::RParen)) {
            let tok = self.toks[self.pos].tok.clone();
            self.pos += 1;

            let arg = match tok {
                Tok::Field(path) => Arg::Field(Expr {
                    root: Root::Dot,
                    path,
                }),
                Tok::Var(name, path) => Arg::Field(Expr {
                    root: Root::Var(name),
                    path,
                }),
                Tok::Ident(name) => {
                    if !funcs::is_builtin(&name) {
                        return Err(self.error(format!("function {:?} not defined", name)));
                    }
                    Arg::Func(name)
                }
                Tok::Literal(value) => Arg::Literal(value),
                Tok::LParen => {
                    let inner = self.pipeline("parenthesized pipeline", 0, true)?;
                    let fields = match self.toks.get(self.pos) {
                        Some(Token {
                            tok: Tok::Field(path),
                            spaced: false,
                        }) if !path.is_empty() => {
                            let path = path.clone();
                            self.pos += 1;
                            path
                        }
                        _ => Vec::new(),
                    };
                    Arg::Pipe(Box::new(inner), fields)
                }
                other => return Err(self.error(format!("unexpected {:?} in command", other))),
            };
            args.push(arg);
        }

        Ok(Command { args })
    }
}

/// Parse the pipeline of an action or block header.
fn parse_pipeline(
    src: &str,
    line: usize,
    context: &str,
    max_decl: usize,
) -> Result<Pipeline, TemplateError> {
    let mut tokens = Tokens {
        toks: tokenize(src, line)?,
        pos: 0,
        line,
    };
    if tokens.toks.is_empty() {
        return Err(parse_error(line, format!("missing value for {}", context)));
    }
    tokens.pipeline(context, max_decl, false)
}
