//! # Session
//!
//! A scoped lease on one instance and the only way to execute against it.
//!
//! A session is bound when it is created and released exactly once, when it is
//! dropped. Dropping a session leased from a pool returns its slot to the load
//! balancer; that happens on every exit path, including unwinding. Sessions on a
//! standalone instance, or opened on a specific pool instance without a lease, have
//! nothing to return.
//!
//! Objects a session creates are released when it ends. Objects materialized from a
//! [`Replicated`] handle belong to the instance cache and outlive the session.

use std::cell::RefCell;
use std::sync::Arc;

use tracing::debug;

use crate::instance::Instance;
use crate::interpreter::Interpreter;
use crate::interpreter::LocalRef;
use crate::interpreter::Value;
use crate::pool::PoolShared;
use crate::replicated::Replicated;

#[derive(Debug)]
pub enum Error {
    /// Replicated objects belong to a pool, and this session has none.
    NotPooled,
    /// The replicated object was created by a different pool.
    ForeignPool,
    /// The object lives in a different instance than the session.
    ForeignObject { session: usize, object: usize },
    /// Failure reported by the hosted runtime, unchanged.
    Runtime(anyhow::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotPooled => write!(
                f,
                "Replicated objects can only be used from a session whose instance belongs to a pool"
            ),
            Self::ForeignPool => write!(f, "Replicated object belongs to a different pool"),
            Self::ForeignObject { session, object } => write!(
                f,
                "Object from instance {} used in a session on instance {}",
                object, session
            ),
            Self::Runtime(e) => write!(f, "Runtime error: {:#}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Runtime(e) => Some(&**e),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Self::Runtime(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

enum Binding {
    Pooled {
        pool: Arc<PoolShared>,
        ordinal: usize,
        /// Load balancer slot to free on drop, if this session holds one.
        lease: Option<usize>,
    },
    Standalone(Arc<Instance>),
}

/// Execution access to one instance.
pub struct Session {
    binding: Binding,
    temporaries: RefCell<Vec<LocalRef>>,
    self_obj: Option<LocalRef>,
}

impl Session {
    pub(crate) fn leased(pool: Arc<PoolShared>, index: usize) -> Self {
        Self::bind(Binding::Pooled { pool, ordinal: index, lease: Some(index) })
    }

    pub(crate) fn pooled(pool: Arc<PoolShared>, ordinal: usize) -> Self {
        Self::bind(Binding::Pooled { pool, ordinal, lease: None })
    }

    pub(crate) fn standalone(instance: Arc<Instance>) -> Self {
        Self::bind(Binding::Standalone(instance))
    }

    fn bind(binding: Binding) -> Self {
        Self {
            binding,
            temporaries: RefCell::new(Vec::new()),
            self_obj: None,
        }
    }

    pub fn instance(&self) -> &Instance {
        match &self.binding {
            Binding::Pooled { pool, ordinal, .. } => pool.instance(*ordinal),
            Binding::Standalone(instance) => instance,
        }
    }

    pub fn ordinal(&self) -> usize {
        self.instance().ordinal()
    }

    /// Whether this session can create replicated objects.
    pub fn is_pooled(&self) -> bool {
        matches!(self.binding, Binding::Pooled { .. })
    }

    /// Whether dropping this session frees a load balancer slot.
    pub fn holds_lease(&self) -> bool {
        matches!(self.binding, Binding::Pooled { lease: Some(_), .. })
    }

    fn interp(&self) -> &dyn Interpreter {
        self.instance().interpreter()
    }

    /// Wraps a fresh object and schedules it for release when the session ends.
    fn temporary(&self, local: LocalRef) -> Obj<'_> {
        self.temporaries.borrow_mut().push(local);
        Obj { local, session: self }
    }

    fn check(&self, obj: &Obj<'_>) -> Result<LocalRef> {
        if std::ptr::eq(obj.session.instance(), self.instance()) {
            Ok(obj.local)
        } else {
            Err(Error::ForeignObject {
                session: self.ordinal(),
                object: obj.session.ordinal(),
            })
        }
    }

    /// Looks up `name` in `module` of the instance's global namespace.
    pub fn global(&self, module: &str, name: &str) -> Result<Obj<'_>> {
        let local = self.interp().global(module, name)?;
        Ok(self.temporary(local))
    }

    pub fn from_value(&self, value: impl Into<Value>) -> Result<Obj<'_>> {
        let local = self.interp().from_value(value.into())?;
        Ok(self.temporary(local))
    }

    /// Materializes a replicated object on this session's instance.
    ///
    /// The first call per instance deserializes; later calls return the same object.
    /// Only sessions of the pool that created the handle may materialize it.
    pub fn from_movable(&self, obj: &Replicated) -> Result<Obj<'_>> {
        let Binding::Pooled { pool, .. } = &self.binding else {
            return Err(Error::NotPooled);
        };
        if !Arc::ptr_eq(pool, obj.pool()) {
            return Err(Error::ForeignPool);
        }
        let local = self.instance().materialize(obj.id(), obj.data())?;
        Ok(Obj { local, session: self })
    }

    /// Serializes `obj` into a new replicated handle usable from any instance of the pool.
    pub fn create_movable(&self, obj: &Obj<'_>) -> Result<Replicated> {
        let Binding::Pooled { pool, .. } = &self.binding else {
            return Err(Error::NotPooled);
        };
        let local = self.check(obj)?;

        let id = pool.next_object_id();
        let data = self.interp().serialize(local)?;
        debug!(%id, ordinal = self.ordinal(), bytes = data.len(), "replicated object created");
        Ok(Replicated::new(id, data, Arc::clone(pool)))
    }

    /// The object this session was opened for, see [`Replicated::acquire_session`].
    pub fn self_obj(&self) -> Option<Obj<'_>> {
        self.self_obj.map(|local| Obj { local, session: self })
    }

    pub(crate) fn set_self_obj(&mut self, local: LocalRef) {
        self.self_obj = Some(local);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let temporaries = std::mem::take(self.temporaries.get_mut());
        let interp = self.interp();
        for local in temporaries {
            interp.release(local);
        }

        if let Binding::Pooled { pool, lease: Some(index), .. } = &self.binding {
            pool.balancer().free(*index);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("ordinal", &self.ordinal())
            .field("pooled", &self.is_pooled())
            .field("lease", &self.holds_lease())
            .finish()
    }
}

/// An object inside the session's instance. Cannot outlive the session.
#[derive(Clone, Copy)]
pub struct Obj<'s> {
    local: LocalRef,
    session: &'s Session,
}

impl<'s> Obj<'s> {
    pub fn local_ref(&self) -> LocalRef {
        self.local
    }

    pub fn attr(&self, name: &str) -> Result<Obj<'s>> {
        let local = self.session.interp().attr(self.local, name)?;
        Ok(self.session.temporary(local))
    }

    pub fn set_attr(&self, name: &str, value: &Obj<'_>) -> Result<()> {
        let value = self.session.check(value)?;
        self.session.interp().set_attr(self.local, name, value)?;
        Ok(())
    }

    pub fn call(&self, args: &[Obj<'_>]) -> Result<Obj<'s>> {
        let args = args
            .iter()
            .map(|arg| self.session.check(arg))
            .collect::<Result<Vec<_>>>()?;
        let local = self.session.interp().call(self.local, &args)?;
        Ok(self.session.temporary(local))
    }

    /// Calls with plain data arguments, converting each one first.
    pub fn call_values(&self, args: Vec<Value>) -> Result<Obj<'s>> {
        let args = args
            .into_iter()
            .map(|value| self.session.from_value(value))
            .collect::<Result<Vec<_>>>()?;
        self.call(&args)
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(self.session.interp().to_value(self.local)?)
    }
}

/// Identity, not value equality: same instance, same object.
impl PartialEq for Obj<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.local == other.local && std::ptr::eq(self.session.instance(), other.session.instance())
    }
}

impl std::fmt::Debug for Obj<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Obj({} on instance {})", self.local, self.session.ordinal())
    }
}
