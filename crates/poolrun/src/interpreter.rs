//! # Hosted Runtime Interface
//!
//! The capabilities poolrun consumes from a hosted interpreter. poolrun never looks
//! inside the runtime: it resolves names, moves plain data in and out, and asks the
//! runtime to serialize and deserialize its own objects when they cross instances.
//!
//! Every instance is an independent copy of the runtime with its own global
//! execution lock, so implementations must be `Send + Sync` and serialize script
//! execution internally.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::registry::ModuleResolver;

/// Handle to an object living inside one interpreter instance.
///
/// The number is only meaningful to the instance that issued it. Handing a
/// `LocalRef` to another instance is a logic error the runtime will reject.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct LocalRef(pub u64);

impl std::fmt::Display for LocalRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "local-{}", self.0)
    }
}

/// Plain data that can be moved in and out of any instance by value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Dict(BTreeMap<String, Value>),
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Self::List(v.into_iter().map(Into::into).collect())
    }
}

/// One isolated copy of the hosted runtime.
///
/// All methods report failures as the runtime's own error; poolrun propagates them
/// without wrapping away the original cause.
pub trait Interpreter: Send + Sync {
    /// Installs the fallback consulted when an imported module is not found on the
    /// runtime's own search path. Called once, before any session exists.
    fn set_find_module(&self, resolver: Arc<dyn ModuleResolver>);

    /// Exposes the instance's position in its pool to script code.
    fn set_ordinal(&self, ordinal: usize) -> anyhow::Result<()>;

    fn global(&self, module: &str, name: &str) -> anyhow::Result<LocalRef>;
    fn attr(&self, obj: LocalRef, name: &str) -> anyhow::Result<LocalRef>;
    fn set_attr(&self, obj: LocalRef, name: &str, value: LocalRef) -> anyhow::Result<()>;
    fn call(&self, callable: LocalRef, args: &[LocalRef]) -> anyhow::Result<LocalRef>;

    fn from_value(&self, value: Value) -> anyhow::Result<LocalRef>;
    fn to_value(&self, obj: LocalRef) -> anyhow::Result<Value>;

    /// Serializes an object into a form any sibling instance can deserialize.
    fn serialize(&self, obj: LocalRef) -> anyhow::Result<Vec<u8>>;
    fn deserialize(&self, data: &[u8]) -> anyhow::Result<LocalRef>;

    /// Drops an object. Unknown handles are ignored.
    fn release(&self, obj: LocalRef);
}

/// Exports the factory entry point that makes a crate loadable as an interpreter image.
///
/// The image and the host must be built by the same toolchain against the same
/// poolrun, since the entry point hands a boxed trait object across the boundary.
///
/// ```ignore
/// poolrun::export_interpreter!(MyInterpreter::new());
/// ```
#[macro_export]
macro_rules! export_interpreter {
    ($ctor:expr) => {
        #[unsafe(no_mangle)]
        pub extern "C" fn poolrun_new_interpreter() -> *mut ::std::ffi::c_void {
            let interp: ::std::boxed::Box<dyn $crate::Interpreter> = ::std::boxed::Box::new($ctor);
            ::std::boxed::Box::into_raw(::std::boxed::Box::new(interp)) as *mut ::std::ffi::c_void
        }
    };
}
