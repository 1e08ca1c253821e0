//! Builtin template functions and Go-style value formatting.
//!
//! `and`/`or` short-circuit and are evaluated by the executor; everything
//! else receives fully evaluated arguments here.

use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::iter::Peekable;
use std::str::Chars;

use super::TemplateError;

const BUILTINS: &[&str] = &[
    "and", "or", "not", "len", "index", "slice", "print", "printf", "println", "eq", "ne",
    "lt", "le", "gt", "ge", "html", "js", "urlquery",
];

pub(crate) fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

fn exec_error(message: impl Into<String>) -> TemplateError {
    TemplateError::Execute(message.into())
}

fn arity(name: &str, args: &[Value], want: usize) -> Result<(), TemplateError> {
    if args.len() == want {
        Ok(())
    } else {
        Err(exec_error(format!(
            "wrong number of args for {}: want {} got {}",
            name,
            want,
            args.len()
        )))
    }
}

/// Call a builtin with evaluated arguments.
pub(crate) fn call(name: &str, args: Vec<Value>) -> Result<Value, TemplateError> {
    match name {
        "not" => {
            arity(name, &args, 1)?;
            Ok(Value::Bool(!is_true(&args[0])))
        }
        "len" => {
            arity(name, &args, 1)?;
            length(&args[0]).map(Value::from)
        }
        "index" => index(args),
        "slice" => slice(args),
        "print" => Ok(Value::String(sprint(&args))),
        "println" => Ok(Value::String(sprintln(&args))),
        "printf" => {
            let (format, rest) = args.split_first().ok_or_else(|| {
                exec_error("wrong number of args for printf: want at least 1 got 0")
            })?;
            match format {
                Value::String(format) => Ok(Value::String(sprintf(format, rest))),
                other => Err(exec_error(format!(
                    "printf: format must be a string, got {}",
                    type_name(other)
                ))),
            }
        }
        "html" => Ok(Value::String(html_escape(&sprint(&args)))),
        "js" => Ok(Value::String(js_escape(&sprint(&args)))),
        // Query escaping encodes spaces as '+'
        "urlquery" => Ok(Value::String(
            urlencoding::encode(&sprint(&args)).replace("%20", "+"),
        )),
        "eq" => {
            let (first, rest) = args
                .split_first()
                .ok_or_else(|| exec_error("wrong number of args for eq: want at least 1 got 0"))?;
            if rest.is_empty() {
                return Err(exec_error("missing argument for comparison"));
            }
            for other in rest {
                if equal(first, other)? {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        "ne" => {
            arity(name, &args, 2)?;
            Ok(Value::Bool(!equal(&args[0], &args[1])?))
        }
        "lt" | "le" | "gt" | "ge" => {
            arity(name, &args, 2)?;
            let ord = compare(&args[0], &args[1])?;
            Ok(Value::Bool(match name {
                "lt" => ord == Ordering::Less,
                "le" => ord != Ordering::Greater,
                "gt" => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            }))
        }
        _ => Err(exec_error(format!("function {:?} not defined", name))),
    }
}

/// Go template truthiness.
pub(crate) fn is_true(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "nil",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "slice",
        Value::Object(_) => "map",
    }
}

/// Type names as Go's fmt reports them in bad-verb output.
fn go_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "<nil>",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float64",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "[]interface {}",
        Value::Object(_) => "map[string]interface {}",
    }
}

fn length(value: &Value) -> Result<usize, TemplateError> {
    match value {
        Value::String(s) => Ok(s.len()),
        Value::Array(items) => Ok(items.len()),
        Value::Object(map) => Ok(map.len()),
        other => Err(exec_error(format!("len of type {}", type_name(other)))),
    }
}

fn position(value: &Value, len: usize) -> Result<usize, TemplateError> {
    let n = value.as_i64().ok_or_else(|| {
        exec_error(format!("cannot index slice/array with type {}", type_name(value)))
    })?;
    usize::try_from(n)
        .ok()
        .filter(|&i| i < len)
        .ok_or_else(|| exec_error(format!("index out of range: {}", n)))
}

fn index(args: Vec<Value>) -> Result<Value, TemplateError> {
    let mut args = args.into_iter();
    let mut item = args
        .next()
        .ok_or_else(|| exec_error("wrong number of args for index: want at least 1 got 0"))?;

    for key in args {
        item = match (item, &key) {
            (Value::Array(mut items), Value::Number(_)) => {
                let i = position(&key, items.len())?;
                items.swap_remove(i)
            }
            (Value::String(s), Value::Number(_)) => {
                let i = position(&key, s.len())?;
                Value::from(s.as_bytes()[i])
            }
            // Missing map keys yield the zero value
            (Value::Object(mut map), Value::String(k)) => map.remove(k).unwrap_or(Value::Null),
            (Value::Null, _) => return Err(exec_error("index of untyped nil")),
            (other, key) => {
                return Err(exec_error(format!(
                    "can't index item of type {} with {}",
                    type_name(&other),
                    type_name(key)
                )))
            }
        };
    }
    Ok(item)
}

fn slice(args: Vec<Value>) -> Result<Value, TemplateError> {
    let (item, bounds) = args
        .split_first()
        .ok_or_else(|| exec_error("wrong number of args for slice: want at least 1 got 0"))?;
    if bounds.len() > 2 {
        return Err(exec_error(format!("too many slice indexes: {}", bounds.len())));
    }

    let len = match item {
        Value::String(s) => s.len(),
        Value::Array(items) => items.len(),
        Value::Null => return Err(exec_error("slice of untyped nil")),
        other => {
            return Err(exec_error(format!(
                "can't slice item of type {}",
                type_name(other)
            )))
        }
    };

    // Bounds may equal the length, unlike index positions
    let bounds = bounds
        .iter()
        .map(|b| position(b, len + 1))
        .collect::<Result<Vec<_>, _>>()?;
    let start = bounds.first().copied().unwrap_or(0);
    let end = bounds.get(1).copied().unwrap_or(len);
    if start > end {
        return Err(exec_error(format!("invalid slice index: {} > {}", start, end)));
    }

    match item {
        Value::String(s) => s
            .get(start..end)
            .map(|s| Value::String(s.to_string()))
            .ok_or_else(|| exec_error("slice splits a UTF-8 sequence")),
        Value::Array(items) => Ok(Value::Array(items[start..end].to_vec())),
        _ => Ok(Value::Null),
    }
}

fn compare_numbers(x: &Number, y: &Number) -> Result<Ordering, TemplateError> {
    let incompatible = || exec_error("incompatible types for comparison");
    match (x.as_i64(), y.as_i64()) {
        (Some(a), Some(b)) => Ok(a.cmp(&b)),
        _ if x.is_f64() && y.is_f64() => x
            .as_f64()
            .zip(y.as_f64())
            .and_then(|(a, b)| a.partial_cmp(&b))
            .ok_or_else(incompatible),
        _ => Err(incompatible()),
    }
}

fn equal(a: &Value, b: &Value) -> Result<bool, TemplateError> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => Ok(compare_numbers(x, y)? == Ordering::Equal),
        (Value::String(x), Value::String(y)) => Ok(x == y),
        (Value::Bool(x), Value::Bool(y)) => Ok(x == y),
        (Value::Null, _) | (_, Value::Null) => Ok(a == b),
        (Value::Array(_) | Value::Object(_), _) | (_, Value::Array(_) | Value::Object(_)) => {
            Err(exec_error("non-comparable type"))
        }
        _ => Err(exec_error("incompatible types for comparison")),
    }
}

fn compare(a: &Value, b: &Value) -> Result<Ordering, TemplateError> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => compare_numbers(x, y),
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        (Value::String(_), Value::Number(_)) | (Value::Number(_), Value::String(_)) => {
            Err(exec_error("incompatible types for comparison"))
        }
        _ => Err(exec_error("invalid type for comparison")),
    }
}

/// Go's `%v` float formatting: shortest digits, exponent outside [1e-4, 1e6).
fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "NaN".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "+Inf" } else { "-Inf" }.to_string();
    }

    let sci = format!("{:e}", f);
    match sci.split_once('e') {
        Some((mantissa, exp)) => match exp.parse::<i32>() {
            Ok(exp) if f != 0.0 && !(-4..6).contains(&exp) => {
                let sign = if exp < 0 { '-' } else { '+' };
                format!("{}e{}{:02}", mantissa, sign, exp.abs())
            }
            _ => f.to_string(),
        },
        None => f.to_string(),
    }
}

fn write_number(n: &Number, out: &mut String) {
    match n.as_f64() {
        Some(f) if n.is_f64() => out.push_str(&format_float(f)),
        _ => out.push_str(&n.to_string()),
    }
}

/// Print a value the way Go's fmt does for `{{ }}` actions.
pub(crate) fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("<nil>"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => write_number(n, out),
        Value::String(s) => out.push_str(s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            // Go prints map keys sorted
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push_str("map[");
            for (i, k) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                out.push_str(k);
                out.push(':');
                if let Some(v) = map.get(k) {
                    write_value(v, out);
                }
            }
            out.push(']');
        }
    }
}

fn value_string(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

/// `fmt.Sprint`: spaces only between operands that are both non-strings.
pub(crate) fn sprint(args: &[Value]) -> String {
    let mut out = String::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 && !args[i - 1].is_string() && !arg.is_string() {
            out.push(' ');
        }
        write_value(arg, &mut out);
    }
    out
}

fn sprintln(args: &[Value]) -> String {
    let mut out = args.iter().map(value_string).collect::<Vec<_>>().join(" ");
    out.push('\n');
    out
}

/// `strconv.Quote`.
fn go_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{07}' => out.push_str("\\a"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0C}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{0B}' => out.push_str("\\v"),
            c if (c as u32) < 0x20 || c == '\u{7F}' => {
                out.push_str(&format!("\\x{:02x}", c as u32))
            }
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\0' => out.push('\u{FFFD}'),
            c => out.push(c),
        }
    }
    out
}

fn js_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '<' | '>' | '&' | '=' => out.push_str(&format!("\\u{:04X}", c as u32)),
            c if (c as u32) < 0x20 || c.is_control() => {
                out.push_str(&format!("\\u{:04X}", c as u32))
            }
            c => out.push(c),
        }
    }
    out
}

#[derive(Debug, Default)]
struct Spec {
    minus: bool,
    plus: bool,
    sharp: bool,
    space: bool,
    zero: bool,
    width: Option<usize>,
    precision: Option<usize>,
}

fn digits(chars: &mut Peekable<Chars<'_>>) -> Option<usize> {
    let mut n: Option<usize> = None;
    while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
        n = Some(n.unwrap_or(0).saturating_mul(10).saturating_add(d as usize));
        chars.next();
    }
    n
}

/// `fmt.Sprintf` for the verbs templates use in practice.
pub(crate) fn sprintf(format: &str, args: &[Value]) -> String {
    let mut out = String::new();
    let mut used = 0;
    let mut chars = format.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }

        let mut spec = Spec::default();
        while let Some(&flag) = chars.peek() {
            match flag {
                '-' => spec.minus = true,
                '+' => spec.plus = true,
                '#' => spec.sharp = true,
                ' ' => spec.space = true,
                '0' => spec.zero = true,
                _ => break,
            }
            chars.next();
        }
        spec.width = digits(&mut chars);
        if chars.peek() == Some(&'.') {
            chars.next();
            spec.precision = Some(digits(&mut chars).unwrap_or(0));
        }

        let Some(verb) = chars.next() else {
            out.push_str("%!(NOVERB)");
            break;
        };
        if verb == '%' {
            out.push('%');
            continue;
        }

        match args.get(used) {
            Some(arg) => {
                used += 1;
                out.push_str(&format_arg(verb, &spec, arg));
            }
            None => out.push_str(&format!("%!{}(MISSING)", verb)),
        }
    }

    if used < args.len() {
        let extra: Vec<String> = args[used..]
            .iter()
            .map(|arg| format!("{}={}", go_type(arg), value_string(arg)))
            .collect();
        out.push_str(&format!("%!(EXTRA {})", extra.join(", ")));
    }
    out
}

fn format_arg(verb: char, spec: &Spec, arg: &Value) -> String {
    let formatted = match (verb, arg) {
        ('v', Value::Number(n)) => format_number('v', spec, n),
        ('v', _) => Some(value_string(arg)),
        (_, Value::Null) => return format!("%!{}(<nil>)", verb),
        ('s', Value::String(s)) => Some(match spec.precision {
            Some(p) => s.chars().take(p).collect(),
            None => s.clone(),
        }),
        ('s', Value::Array(_) | Value::Object(_)) => Some(value_string(arg)),
        ('q', Value::String(s)) => Some(if spec.sharp && !s.contains('`') {
            format!("`{}`", s)
        } else {
            go_quote(s)
        }),
        ('x', Value::String(s)) => Some(s.bytes().map(|b| format!("{:02x}", b)).collect()),
        ('X', Value::String(s)) => Some(s.bytes().map(|b| format!("{:02X}", b)).collect()),
        ('t', Value::Bool(b)) => Some(b.to_string()),
        (_, Value::Number(n)) => format_number(verb, spec, n),
        _ => None,
    };

    match formatted {
        Some(body) => pad(body, spec, matches!(arg, Value::Number(_))),
        None => format!("%!{}({}={})", verb, go_type(arg), value_string(arg)),
    }
}

fn format_number(verb: char, spec: &Spec, n: &Number) -> Option<String> {
    let integer = n
        .as_i64()
        .map(i128::from)
        .or_else(|| n.as_u64().map(i128::from));

    let body = match integer {
        Some(i) => {
            let magnitude = i.unsigned_abs();
            let digits = match verb {
                'd' | 'v' => magnitude.to_string(),
                'x' => format!("{}{:x}", if spec.sharp { "0x" } else { "" }, magnitude),
                'X' => format!("{}{:X}", if spec.sharp { "0X" } else { "" }, magnitude),
                'o' => format!("{}{:o}", if spec.sharp { "0" } else { "" }, magnitude),
                'b' => format!("{:b}", magnitude),
                'c' => return u32::try_from(i).ok().and_then(char::from_u32).map(String::from),
                'q' => {
                    return u32::try_from(i)
                        .ok()
                        .and_then(char::from_u32)
                        .map(|c| format!("'{}'", c))
                }
                _ => return None,
            };
            sign(i < 0, spec) + &digits
        }
        None => {
            let f = n.as_f64()?;
            let digits = match verb {
                'v' | 'g' => format_float(f.abs()),
                'f' | 'F' => format!("{:.*}", spec.precision.unwrap_or(6), f.abs()),
                'e' => {
                    let sci = format!("{:.*e}", spec.precision.unwrap_or(6), f.abs());
                    match sci.split_once('e') {
                        Some((mantissa, exp)) => {
                            let exp: i32 = exp.parse().ok()?;
                            let sign = if exp < 0 { '-' } else { '+' };
                            format!("{}e{}{:02}", mantissa, sign, exp.abs())
                        }
                        None => sci,
                    }
                }
                _ => return None,
            };
            sign(f.is_sign_negative() && f != 0.0, spec) + &digits
        }
    };
    Some(body)
}

fn sign(negative: bool, spec: &Spec) -> String {
    if negative {
        "-".to_string()
    } else if spec.plus {
        "+".to_string()
    } else if spec.space {
        " ".to_string()
    } else {
        String::new()
    }
}

fn pad(body: String, spec: &Spec, numeric: bool) -> String {
    let width = spec.width.unwrap_or(0);
    let len = body.chars().count();
    if len >= width {
        return body;
    }
    let fill = width - len;
    if spec.minus {
        body + &" ".repeat(fill)
    } else if spec.zero && numeric {
        let split = if body.starts_with(['-', '+', ' ']) { 1 } else { 0 };
        format!("{}{}{}", &body[..split], "0".repeat(fill), &body[split..])
    } else {
        " ".repeat(fill) + &body
    }
}
