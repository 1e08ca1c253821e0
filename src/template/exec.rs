//! Template execution against a JSON data tree.

use serde_json::Value;

use super::funcs::{self, is_true, type_name, write_value};
use super::parse::{Arg, Command, Expr, Node, Pipeline, Root};
use super::TemplateError;

/// How a node list finished inside a `range` body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Normal,
    Break,
    Continue,
}

fn exec_error(message: impl Into<String>) -> TemplateError {
    TemplateError::Execute(message.into())
}

/// Execution state: the root data and the variable stack.
pub(crate) struct Exec<'a> {
    root: &'a Value,
    vars: Vec<(String, Value)>,
}

impl<'a> Exec<'a> {
    pub(crate) fn new(root: &'a Value) -> Self {
        Self {
            root,
            vars: Vec::new(),
        }
    }

    /// Run `f`, then drop variables it declared.
    fn scoped<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, TemplateError>,
    ) -> Result<T, TemplateError> {
        let mark = self.vars.len();
        let result = f(self);
        self.vars.truncate(mark);
        result
    }

    pub(crate) fn walk(
        &mut self,
        nodes: &[Node],
        dot: &Value,
        out: &mut String,
    ) -> Result<Flow, TemplateError> {
        for node in nodes {
            let flow = match node {
                Node::Text(text) => {
                    out.push_str(text);
                    Flow::Normal
                }
                Node::Action(pipe) => {
                    let value = self.pipeline(pipe, dot)?;
                    if pipe.decl.is_empty() {
                        write_value(&value, out);
                    }
                    Flow::Normal
                }
                Node::If {
                    pipe,
                    then,
                    else_body,
                } => self.scoped(|exec| {
                    if is_true(&exec.pipeline(pipe, dot)?) {
                        exec.walk(then, dot, out)
                    } else {
                        exec.walk(else_body, dot, out)
                    }
                })?,
                Node::With {
                    pipe,
                    then,
                    else_body,
                } => self.scoped(|exec| {
                    let value = exec.pipeline(pipe, dot)?;
                    if is_true(&value) {
                        exec.walk(then, &value, out)
                    } else {
                        exec.walk(else_body, dot, out)
                    }
                })?,
                Node::Range {
                    pipe,
                    body,
                    else_body,
                } => self.scoped(|exec| exec.range(pipe, body, else_body, dot, out))?,
                Node::Break => Flow::Break,
                Node::Continue => Flow::Continue,
            };

            if flow != Flow::Normal {
                return Ok(flow);
            }
        }
        Ok(Flow::Normal)
    }

    fn range(
        &mut self,
        pipe: &Pipeline,
        body: &[Node],
        else_body: &[Node],
        dot: &Value,
        out: &mut String,
    ) -> Result<Flow, TemplateError> {
        let source = self.eval_pipe(&pipe.cmds, dot)?;
        let entries: Vec<(Value, Value)> = match source {
            Value::Null => Vec::new(),
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| (Value::from(i), item))
                .collect(),
            // Go ranges over maps in sorted key order
            Value::Object(map) => {
                let mut pairs: Vec<(String, Value)> = map.into_iter().collect();
                pairs.sort_by(|a, b| a.0.cmp(&b.0));
                pairs
                    .into_iter()
                    .map(|(k, v)| (Value::String(k), v))
                    .collect()
            }
            Value::Number(n) if n.is_i64() || n.is_u64() => {
                if pipe.decl.len() > 1 {
                    return Err(exec_error("can't use two iteration variables over an integer"));
                }
                let count = n.as_u64().unwrap_or(0);
                (0..count).map(|i| (Value::from(i), Value::from(i))).collect()
            }
            other => {
                return Err(exec_error(format!(
                    "range can't iterate over {}",
                    type_name(&other)
                )))
            }
        };

        if entries.is_empty() {
            return self.walk(else_body, dot, out);
        }

        for (key, value) in entries {
            let flow = self.scoped(|exec| {
                match pipe.decl.as_slice() {
                    [] => {}
                    [elem] => exec.bind(elem, pipe.assign, value.clone())?,
                    [k, elem, ..] => {
                        exec.bind(k, pipe.assign, key)?;
                        exec.bind(elem, pipe.assign, value.clone())?;
                    }
                }
                exec.walk(body, &value, out)
            })?;
            if flow == Flow::Break {
                break;
            }
        }
        Ok(Flow::Normal)
    }

    fn bind(&mut self, name: &str, assign: bool, value: Value) -> Result<(), TemplateError> {
        if !assign {
            self.vars.push((name.to_string(), value));
            return Ok(());
        }
        match self.vars.iter_mut().rev().find(|(var, _)| var == name) {
            Some((_, slot)) => {
                *slot = value;
                Ok(())
            }
            None => Err(exec_error(format!("undefined variable: {}", name))),
        }
    }

    /// Evaluate a pipeline and bind its declared variables.
    fn pipeline(&mut self, pipe: &Pipeline, dot: &Value) -> Result<Value, TemplateError> {
        let value = self.eval_pipe(&pipe.cmds, dot)?;
        for name in &pipe.decl {
            self.bind(name, pipe.assign, value.clone())?;
        }
        Ok(value)
    }

    fn eval_pipe(&self, cmds: &[Command], dot: &Value) -> Result<Value, TemplateError> {
        let mut value = None;
        for cmd in cmds {
            value = Some(self.command(cmd, dot, value.take())?);
        }
        Ok(value.unwrap_or(Value::Null))
    }

    /// Run one command. A piped value becomes the final argument.
    fn command(
        &self,
        cmd: &Command,
        dot: &Value,
        piped: Option<Value>,
    ) -> Result<Value, TemplateError> {
        let Some((first, rest)) = cmd.args.split_first() else {
            return Err(exec_error("empty command"));
        };
        match first {
            Arg::Func(name) => self.call(name, rest, dot, piped),
            arg if rest.is_empty() && piped.is_none() => self.arg(arg, dot),
            arg => Err(exec_error(format!(
                "{}: can't give argument to non-function",
                arg
            ))),
        }
    }

    fn call(
        &self,
        name: &str,
        args: &[Arg],
        dot: &Value,
        piped: Option<Value>,
    ) -> Result<Value, TemplateError> {
        if let "and" | "or" = name {
            if args.is_empty() && piped.is_none() {
                return Err(exec_error(format!(
                    "wrong number of args for {}: want at least 1 got 0",
                    name
                )));
            }
            // Stop at the first falsy (and) or truthy (or) operand
            let stop_on = name == "or";
            let mut last = Value::Null;
            for arg in args {
                last = self.arg(arg, dot)?;
                if is_true(&last) == stop_on {
                    return Ok(last);
                }
            }
            return Ok(piped.unwrap_or(last));
        }

        let mut values = args
            .iter()
            .map(|arg| self.arg(arg, dot))
            .collect::<Result<Vec<_>, _>>()?;
        values.extend(piped);
        funcs::call(name, values)
    }

    fn arg(&self, arg: &Arg, dot: &Value) -> Result<Value, TemplateError> {
        match arg {
            Arg::Field(expr) => self.field(expr, dot),
            Arg::Literal(value) => Ok(value.clone()),
            // A bare function name as an argument is a call without arguments
            Arg::Func(name) => self.call(name, &[], dot, None),
            Arg::Pipe(pipe, fields) => {
                let value = self.eval_pipe(&pipe.cmds, dot)?;
                lookup(&value, fields, arg).cloned()
            }
        }
    }

    fn field(&self, expr: &Expr, dot: &Value) -> Result<Value, TemplateError> {
        let start = match &expr.root {
            Root::Dot => dot,
            Root::Var(name) if name == "$" => self.root,
            Root::Var(name) => self
                .vars
                .iter()
                .rev()
                .find(|(var, _)| var == name)
                .map(|(_, value)| value)
                .ok_or_else(|| exec_error(format!("undefined variable: {}", name)))?,
        };
        lookup(start, &expr.path, expr).cloned()
    }
}

fn lookup<'v>(
    mut current: &'v Value,
    path: &[String],
    shown: &dyn std::fmt::Display,
) -> Result<&'v Value, TemplateError> {
    for field in path {
        current = match current {
            Value::Object(map) => map.get(field).ok_or_else(|| {
                exec_error(format!("{}: can't evaluate field {}", shown, field))
            })?,
            Value::Null => {
                return Err(exec_error(format!(
                    "{}: nil pointer evaluating field {}",
                    shown, field
                )))
            }
            other => {
                return Err(exec_error(format!(
                    "{}: can't evaluate field {} in type {}",
                    shown,
                    field,
                    type_name(other)
                )))
            }
        };
    }
    Ok(current)
}
