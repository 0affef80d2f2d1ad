//! # Object Model
//!
//! Everything a toyrun program can hold. Objects are values: `global` and `attr`
//! hand out copies, and only namespaces and modules can be mutated in place.

use std::collections::BTreeMap;

use anyhow::Result;
use anyhow::anyhow;
use anyhow::bail;
use serde::Deserialize;
use serde::Serialize;

use poolrun::Value;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Object {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Object>),
    Dict(BTreeMap<String, Object>),
    /// A bag of attributes, created by `namespace()`.
    Namespace(BTreeMap<String, Object>),
    Function(Function),
    Builtin(Builtin),
    /// Reference to a loaded module. Lives only inside its interpreter.
    Module(String),
}

impl Object {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::List(_) => "list",
            Self::Dict(_) => "dict",
            Self::Namespace(_) => "namespace",
            Self::Function(_) => "function",
            Self::Builtin(_) => "builtin_function",
            Self::Module(_) => "module",
        }
    }

    /// Fails if the object refers to interpreter-local state.
    pub fn check_portable(&self) -> Result<()> {
        match self {
            Self::Module(name) => bail!("cannot serialize module '{}'", name),
            Self::List(items) => items.iter().try_for_each(Object::check_portable),
            Self::Dict(map) | Self::Namespace(map) => map.values().try_for_each(Object::check_portable),
            Self::Function(f) => f.body.check_portable(),
            _ => Ok(()),
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(match self {
            Self::None => Value::None,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(n) => Value::Int(*n),
            Self::Float(x) => Value::Float(*x),
            Self::Str(s) => Value::Str(s.clone()),
            Self::List(items) => Value::List(items.iter().map(Object::to_value).collect::<Result<_>>()?),
            Self::Dict(map) | Self::Namespace(map) => Value::Dict(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), v.to_value()?)))
                    .collect::<Result<_>>()?,
            ),
            other => bail!("'{}' object has no plain value", other.type_name()),
        })
    }
}

impl From<Value> for Object {
    fn from(value: Value) -> Self {
        match value {
            Value::None => Self::None,
            Value::Bool(b) => Self::Bool(b),
            Value::Int(n) => Self::Int(n),
            Value::Float(x) => Self::Float(x),
            Value::Str(s) => Self::Str(s),
            Value::List(items) => Self::List(items.into_iter().map(Object::from).collect()),
            Value::Dict(map) => Self::Dict(map.into_iter().map(|(k, v)| (k, Object::from(v))).collect()),
        }
    }
}

/// A function defined in module source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub params: Vec<String>,
    pub body: Box<Expr>,
}

/// The expression a function returns.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Const(Object),
    Param(usize),
    /// `list(signature(p).parameters.keys())`
    ParamNames(Box<Expr>),
    /// Call of a builtin by name.
    Call(Builtin, Vec<Expr>),
}

impl Expr {
    fn check_portable(&self) -> Result<()> {
        match self {
            Self::Const(obj) => obj.check_portable(),
            Self::Param(_) => Ok(()),
            Self::ParamNames(inner) => inner.check_portable(),
            Self::Call(_, args) => args.iter().try_for_each(Expr::check_portable),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Builtin {
    Namespace,
    Add,
    Len,
}

impl Builtin {
    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "namespace" => Some(Self::Namespace),
            "add" => Some(Self::Add),
            "len" => Some(Self::Len),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Namespace => "namespace",
            Self::Add => "add",
            Self::Len => "len",
        }
    }

    pub fn params(self) -> &'static [&'static str] {
        match self {
            Self::Namespace => &[],
            Self::Add => &["a", "b"],
            Self::Len => &["obj"],
        }
    }

    pub fn apply(self, args: Vec<Object>) -> Result<Object> {
        if args.len() != self.params().len() {
            bail!(
                "{}() takes {} arguments but {} were given",
                self.name(),
                self.params().len(),
                args.len()
            );
        }
        let mut args = args.into_iter();
        match self {
            Self::Namespace => Ok(Object::Namespace(BTreeMap::new())),
            Self::Add => {
                let (a, b) = (args.next(), args.next());
                match (a, b) {
                    (Some(Object::Int(a)), Some(Object::Int(b))) => a
                        .checked_add(b)
                        .map(Object::Int)
                        .ok_or_else(|| anyhow!("integer overflow")),
                    (Some(Object::Float(a)), Some(Object::Float(b))) => Ok(Object::Float(a + b)),
                    (Some(Object::Int(a)), Some(Object::Float(b))) => Ok(Object::Float(a as f64 + b)),
                    (Some(Object::Float(a)), Some(Object::Int(b))) => Ok(Object::Float(a + b as f64)),
                    (Some(Object::Str(a)), Some(Object::Str(b))) => Ok(Object::Str(a + &b)),
                    (Some(Object::List(mut a)), Some(Object::List(b))) => {
                        a.extend(b);
                        Ok(Object::List(a))
                    }
                    (Some(a), Some(b)) => bail!(
                        "unsupported operand types for add: '{}' and '{}'",
                        a.type_name(),
                        b.type_name()
                    ),
                    _ => bail!("add() is missing arguments"),
                }
            }
            Self::Len => match args.next() {
                Some(Object::Str(s)) => Ok(Object::Int(s.chars().count() as i64)),
                Some(Object::List(items)) => Ok(Object::Int(items.len() as i64)),
                Some(Object::Dict(map)) | Some(Object::Namespace(map)) => Ok(Object::Int(map.len() as i64)),
                Some(other) => bail!("object of type '{}' has no len()", other.type_name()),
                None => bail!("len() is missing its argument"),
            },
        }
    }
}

/// Declared parameter names of a callable.
pub fn param_names(obj: &Object) -> Result<Vec<String>> {
    match obj {
        Object::Function(f) => Ok(f.params.clone()),
        Object::Builtin(b) => Ok(b.params().iter().map(|p| p.to_string()).collect()),
        other => bail!("'{}' object is not callable", other.type_name()),
    }
}

impl Function {
    pub fn call(&self, args: &[Object]) -> Result<Object> {
        if args.len() != self.params.len() {
            bail!(
                "{}() takes {} arguments but {} were given",
                self.name,
                self.params.len(),
                args.len()
            );
        }
        eval(&self.body, args)
    }
}

fn eval(expr: &Expr, args: &[Object]) -> Result<Object> {
    match expr {
        Expr::Const(obj) => Ok(obj.clone()),
        Expr::Param(i) => args.get(*i).cloned().ok_or_else(|| anyhow!("parameter {} out of range", i)),
        Expr::ParamNames(inner) => {
            let target = eval(inner, args)?;
            let names = param_names(&target)?;
            Ok(Object::List(names.into_iter().map(Object::Str).collect()))
        }
        Expr::Call(builtin, call_args) => {
            let values = call_args.iter().map(|a| eval(a, args)).collect::<Result<Vec<_>>>()?;
            builtin.apply(values)
        }
    }
}
