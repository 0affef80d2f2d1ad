//! # toyrun
//!
//! A deliberately small interpreter that satisfies [`poolrun::Interpreter`]. It
//! has the properties poolrun cares about: a global lock per instance, module
//! imports that fall back to the pool's registry, and its own serialization
//! format for objects crossing instances.
//!
//! Built as a `cdylib` it is also a loadable interpreter image.

pub mod object;
pub mod parse;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering;

use anyhow::Result;
use anyhow::anyhow;
use anyhow::bail;
use tracing::debug;

use poolrun::Interpreter;
use poolrun::LocalRef;
use poolrun::ModuleResolver;
use poolrun::Value;

use crate::object::Builtin;
use crate::object::Object;

pub const RUNTIME_MODULE: &str = "runtime";
pub const BUILTINS_MODULE: &str = "builtins";

pub struct ToyInterpreter {
    state: Mutex<State>,
}

struct State {
    heap: HashMap<u64, Object>,
    next_ref: u64,
    modules: HashMap<String, BTreeMap<String, Object>>,
    resolver: Option<Arc<dyn ModuleResolver>>,
}

impl State {
    fn alloc(&mut self, obj: Object) -> LocalRef {
        let id = self.next_ref;
        self.next_ref += 1;
        self.heap.insert(id, obj);
        LocalRef(id)
    }

    fn get(&self, obj: LocalRef) -> Result<&Object> {
        self.heap.get(&obj.0).ok_or_else(|| anyhow!("unknown object {}", obj))
    }

    /// Globals of a module, importing it on first use.
    fn module(&mut self, name: &str) -> Result<&mut BTreeMap<String, Object>> {
        if !self.modules.contains_key(name) {
            let source = self
                .resolver
                .as_ref()
                .and_then(|r| r.find_module(name))
                .ok_or_else(|| anyhow!("No module named '{}'", name))?;
            let globals = parse::parse_module(name, &source)?;
            debug!(module = name, globals = globals.len(), "imported module");
            self.modules.insert(name.to_string(), globals);
        }
        self.modules
            .get_mut(name)
            .ok_or_else(|| anyhow!("No module named '{}'", name))
    }
}

impl ToyInterpreter {
    pub fn new() -> Self {
        let builtins = [Builtin::Namespace, Builtin::Add, Builtin::Len]
            .into_iter()
            .map(|b| (b.name().to_string(), Object::Builtin(b)))
            .collect();
        let runtime = BTreeMap::from([
            ("name".to_string(), Object::Str("toyrun".to_string())),
            ("ordinal".to_string(), Object::None),
        ]);
        let modules = HashMap::from([
            (BUILTINS_MODULE.to_string(), builtins),
            (RUNTIME_MODULE.to_string(), runtime),
        ]);

        Self {
            state: Mutex::new(State {
                heap: HashMap::new(),
                next_ref: 1,
                modules,
                resolver: None,
            }),
        }
    }

    /// Number of objects currently alive in this interpreter.
    pub fn live_objects(&self) -> usize {
        self.state.lock().map(|s| s.heap.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| anyhow!("interpreter lock poisoned"))
    }
}

impl Default for ToyInterpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter for ToyInterpreter {
    fn set_find_module(&self, resolver: Arc<dyn ModuleResolver>) {
        if let Ok(mut state) = self.state.lock() {
            state.resolver = Some(resolver);
        }
    }

    fn set_ordinal(&self, ordinal: usize) -> Result<()> {
        let mut state = self.lock()?;
        state
            .module(RUNTIME_MODULE)?
            .insert("ordinal".to_string(), Object::Int(ordinal as i64));
        Ok(())
    }

    fn global(&self, module: &str, name: &str) -> Result<LocalRef> {
        let mut state = self.lock()?;
        let obj = state
            .module(module)?
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("module '{}' has no attribute '{}'", module, name))?;
        Ok(state.alloc(obj))
    }

    fn attr(&self, obj: LocalRef, name: &str) -> Result<LocalRef> {
        let mut state = self.lock()?;
        let module = match state.get(obj)? {
            Object::Module(module) => Some(module.clone()),
            _ => None,
        };
        let found = match module {
            Some(module) => state.module(&module)?.get(name).cloned(),
            None => match state.get(obj)? {
                Object::Namespace(attrs) => attrs.get(name).cloned(),
                _ => None,
            },
        };
        match found {
            Some(value) => Ok(state.alloc(value)),
            None => bail!("'{}' object has no attribute '{}'", state.get(obj)?.type_name(), name),
        }
    }

    fn set_attr(&self, obj: LocalRef, name: &str, value: LocalRef) -> Result<()> {
        let mut state = self.lock()?;
        let value = state.get(value)?.clone();
        let module = match state.get(obj)? {
            Object::Module(module) => Some(module.clone()),
            Object::Namespace(_) => None,
            other => bail!("'{}' object attributes are read-only", other.type_name()),
        };
        let attrs = match module {
            Some(module) => state.module(&module)?,
            None => match state.heap.get_mut(&obj.0) {
                Some(Object::Namespace(attrs)) => attrs,
                _ => bail!("unknown object {}", obj),
            },
        };
        attrs.insert(name.to_string(), value);
        Ok(())
    }

    fn call(&self, callable: LocalRef, args: &[LocalRef]) -> Result<LocalRef> {
        let mut state = self.lock()?;
        let args = args
            .iter()
            .map(|a| state.get(*a).cloned())
            .collect::<Result<Vec<_>>>()?;
        let result = match state.get(callable)? {
            Object::Function(f) => f.call(&args)?,
            Object::Builtin(b) => b.apply(args)?,
            other => bail!("'{}' object is not callable", other.type_name()),
        };
        Ok(state.alloc(result))
    }

    fn from_value(&self, value: Value) -> Result<LocalRef> {
        Ok(self.lock()?.alloc(Object::from(value)))
    }

    fn to_value(&self, obj: LocalRef) -> Result<Value> {
        self.lock()?.get(obj)?.to_value()
    }

    fn serialize(&self, obj: LocalRef) -> Result<Vec<u8>> {
        let state = self.lock()?;
        let obj = state.get(obj)?;
        obj.check_portable()?;
        Ok(bincode::serialize(obj)?)
    }

    fn deserialize(&self, data: &[u8]) -> Result<LocalRef> {
        let obj: Object = bincode::deserialize(data)?;
        Ok(self.lock()?.alloc(obj))
    }

    fn release(&self, obj: LocalRef) {
        if let Ok(mut state) = self.state.lock() {
            state.heap.remove(&obj.0);
        }
    }
}

poolrun::export_interpreter!(ToyInterpreter::new());

static SELF_HANDLE: AtomicPtr<c_void> = AtomicPtr::new(std::ptr::null_mut());

/// Records the handle of the library this image was loaded as.
#[unsafe(no_mangle)]
pub extern "C" fn poolrun_set_self(handle: *mut c_void) {
    SELF_HANDLE.store(handle, Ordering::Release);
}

/// toyrun opens no libraries of its own, so there is nothing to close.
#[unsafe(no_mangle)]
pub extern "C" fn poolrun_flush_libs() {
    SELF_HANDLE.store(std::ptr::null_mut(), Ordering::Release);
}
