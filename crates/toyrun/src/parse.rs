//! Module source parser.
//!
//! One statement per line:
//!
//! ```text
//! import NAME
//! from NAME import NAME              # ignored
//! NAME = EXPR
//! def NAME(PARAM, ...): return EXPR
//! ```
//!
//! An `EXPR` is a literal, a parameter, a builtin call such as `add(x, 1)`, or
//! `list(signature(EXPR).parameters.keys())`.

use std::collections::BTreeMap;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use anyhow::bail;

use crate::object::Builtin;
use crate::object::Expr;
use crate::object::Function;
use crate::object::Object;

/// Parses module source into its globals.
pub fn parse_module(module: &str, source: &str) -> Result<BTreeMap<String, Object>> {
    let mut globals = BTreeMap::new();
    for (i, line) in source.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("from ") {
            continue;
        }
        let (name, obj) = parse_statement(line).with_context(|| format!("{}:{}: {}", module, i + 1, line))?;
        globals.insert(name, obj);
    }
    Ok(globals)
}

fn parse_statement(line: &str) -> Result<(String, Object)> {
    if let Some(rest) = line.strip_prefix("import ") {
        let name = ident(rest.trim())?;
        return Ok((name.to_string(), Object::Module(name.to_string())));
    }
    if let Some(rest) = line.strip_prefix("def ") {
        let open = rest.find('(').ok_or_else(|| anyhow!("expected '(' after function name"))?;
        let close = rest.find("):").ok_or_else(|| anyhow!("expected '):' after parameters"))?;
        let name = ident(rest[..open].trim())?;
        let params = rest[open + 1..close]
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| ident(p).map(str::to_string))
            .collect::<Result<Vec<_>>>()?;
        let body = rest[close + 2..]
            .trim()
            .strip_prefix("return ")
            .ok_or_else(|| anyhow!("function body must be a single return"))?;
        let body = Box::new(parse_expr(body, &params)?);
        let function = Function {
            name: name.to_string(),
            params,
            body,
        };
        return Ok((name.to_string(), Object::Function(function)));
    }
    if let Some((name, expr)) = line.split_once('=') {
        let name = ident(name.trim())?;
        let thunk = Function {
            name: name.to_string(),
            params: Vec::new(),
            body: Box::new(parse_expr(expr, &[])?),
        };
        return Ok((name.to_string(), thunk.call(&[])?));
    }
    bail!("unsupported statement")
}

fn parse_expr(text: &str, params: &[String]) -> Result<Expr> {
    let text = text.trim();

    if let Some(inner) = text
        .strip_prefix("list(signature(")
        .and_then(|rest| rest.strip_suffix(").parameters.keys())"))
    {
        return Ok(Expr::ParamNames(Box::new(parse_expr(inner, params)?)));
    }
    if let Some(lit) = literal(text)? {
        return Ok(Expr::Const(lit));
    }
    if let Some(i) = params.iter().position(|p| p == text) {
        return Ok(Expr::Param(i));
    }
    if let Some(open) = text.find('(') {
        let inner = text[open + 1..]
            .strip_suffix(')')
            .ok_or_else(|| anyhow!("unbalanced parentheses in '{}'", text))?;
        let name = text[..open].trim();
        let builtin = Builtin::by_name(name).ok_or_else(|| anyhow!("name '{}' is not defined", name))?;
        let args = split_args(inner)?
            .into_iter()
            .map(|arg| parse_expr(arg, params))
            .collect::<Result<Vec<_>>>()?;
        return Ok(Expr::Call(builtin, args));
    }
    match Builtin::by_name(text) {
        Some(builtin) => Ok(Expr::Const(Object::Builtin(builtin))),
        None => bail!("name '{}' is not defined", text),
    }
}

fn literal(text: &str) -> Result<Option<Object>> {
    let obj = match text {
        "None" => Object::None,
        "True" => Object::Bool(true),
        "False" => Object::Bool(false),
        _ => {
            let quoted = text.len() >= 2
                && ((text.starts_with('"') && text.ends_with('"')) || (text.starts_with('\'') && text.ends_with('\'')));
            if quoted {
                Object::Str(text[1..text.len() - 1].to_string())
            } else if text.starts_with(|c: char| c.is_ascii_digit() || c == '-') {
                if text.contains('.') {
                    Object::Float(text.parse().with_context(|| format!("invalid float literal '{}'", text))?)
                } else {
                    Object::Int(text.parse().with_context(|| format!("invalid int literal '{}'", text))?)
                }
            } else {
                return Ok(None);
            }
        }
    };
    Ok(Some(obj))
}

/// Splits call arguments on top-level commas.
fn split_args(text: &str) -> Result<Vec<&str>> {
    let mut args = Vec::new();
    let mut depth = 0usize;
    let mut quote = None;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => depth = depth.checked_sub(1).ok_or_else(|| anyhow!("unbalanced ')'"))?,
            (None, ',') if depth == 0 => {
                args.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if quote.is_some() || depth != 0 {
        bail!("unterminated argument list '{}'", text);
    }
    let last = text[start..].trim();
    if !last.is_empty() || !args.is_empty() {
        args.push(&text[start..]);
    }
    Ok(args)
}

fn ident(text: &str) -> Result<&str> {
    let valid = text.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_')
        && text.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid { Ok(text) } else { Err(anyhow!("invalid identifier '{}'", text)) }
}
