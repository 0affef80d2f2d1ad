//! # Instance
//!
//! One isolated interpreter plus the objects replicated into it.
//!
//! The materialized cache maps replicated object ids to the local object each one
//! was deserialized into on this instance. The instance owns the cache; replicated
//! handles only look entries up and ask for eviction. Entries are guarded by the
//! DashMap shard lock so two sessions racing on one instance deserialize at most once.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use crate::bootstrap;
use crate::bootstrap::Bootstrapped;
use crate::bootstrap::Launcher;
use crate::interpreter::Interpreter;
use crate::interpreter::LocalRef;
use crate::registry::ModuleResolver;
use crate::replicated::ObjectId;
use crate::session::Session;

#[derive(Debug)]
pub enum Error {
    Bootstrap(bootstrap::Error),
    Runtime(anyhow::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bootstrap(e) => write!(f, "Bootstrap error: {}", e),
            Self::Runtime(e) => write!(f, "Runtime error: {:#}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bootstrap(e) => Some(e),
            Self::Runtime(e) => Some(&**e),
        }
    }
}

impl From<bootstrap::Error> for Error {
    fn from(e: bootstrap::Error) -> Self {
        Self::Bootstrap(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A running interpreter instance.
pub struct Instance {
    ordinal: usize,
    runtime: Bootstrapped,
    cache: DashMap<ObjectId, LocalRef>,
}

impl Instance {
    /// Launches an instance outside any pool.
    ///
    /// Sessions on it hold no lease and can neither create nor materialize
    /// replicated objects.
    pub fn launch(launcher: &Launcher) -> Result<Arc<Self>> {
        let runtime = launcher.launch()?;
        Ok(Arc::new(Self::new(0, runtime)))
    }

    /// Launches the instance at `ordinal` of a pool, wired to the pool's module registry.
    pub(crate) fn boot(launcher: &Launcher, ordinal: usize, modules: Arc<dyn ModuleResolver>) -> Result<Self> {
        let runtime = launcher.launch()?;
        let instance = Self::new(ordinal, runtime);
        instance.interpreter().set_find_module(modules);
        instance.interpreter().set_ordinal(ordinal).map_err(Error::Runtime)?;
        debug!(ordinal, custom_loader = instance.custom_loader(), "instance ready");
        Ok(instance)
    }

    fn new(ordinal: usize, runtime: Bootstrapped) -> Self {
        Self {
            ordinal,
            runtime,
            cache: DashMap::new(),
        }
    }

    /// Position of this instance in its pool. Zero for standalone instances.
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn interpreter(&self) -> &dyn Interpreter {
        self.runtime.interpreter()
    }

    pub fn custom_loader(&self) -> bool {
        self.runtime.custom_loader()
    }

    /// Opens a session with no lease and no pool.
    pub fn acquire_session(self: &Arc<Self>) -> Session {
        Session::standalone(Arc::clone(self))
    }

    /// Returns the cached local object for `id`, deserializing `data` on first use.
    pub(crate) fn materialize(&self, id: ObjectId, data: &[u8]) -> anyhow::Result<LocalRef> {
        // The shard stays locked across deserialize so each id is deserialized at most once.
        match self.cache.entry(id) {
            Entry::Occupied(entry) => Ok(*entry.get()),
            Entry::Vacant(entry) => {
                let obj = self.interpreter().deserialize(data)?;
                entry.insert(obj);
                Ok(obj)
            }
        }
    }

    /// Drops the cached local object for `id`. Returns whether there was one.
    pub(crate) fn evict(&self, id: ObjectId) -> bool {
        match self.cache.remove(&id) {
            Some((_, obj)) => {
                self.interpreter().release(obj);
                true
            }
            None => false,
        }
    }

    pub fn cached(&self, id: ObjectId) -> Option<LocalRef> {
        self.cache.get(&id).map(|entry| *entry.value())
    }

    pub fn is_cached(&self, id: ObjectId) -> bool {
        self.cache.contains_key(&id)
    }

    /// Number of replicated objects currently materialized here.
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        for (_, obj) in std::mem::take(&mut self.cache) {
            self.runtime.interpreter().release(obj);
        }
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("ordinal", &self.ordinal)
            .field("custom_loader", &self.custom_loader())
            .field("cached", &self.cache.len())
            .finish()
    }
}
