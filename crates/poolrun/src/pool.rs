//! # Instance Pool
//!
//! Owns a fixed set of instances and makes them look like one execution service.
//!
//! The pool is built once with a fixed number of instances; if any of them fails to
//! come up, construction fails as a whole and the instances already launched are torn
//! down again. Each instance is given the pool's module registry and its ordinal.
//! Sessions are handed out by the load balancer. Replicated object ids come from a
//! single counter shared by every session of the pool.
//!
//! `Pool` is a cheap handle. The instances live until the last pool handle, session and
//! replicated object referring to them are gone.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tracing::info;

use crate::balancer::LoadBalancer;
use crate::bootstrap::Launcher;
use crate::instance;
use crate::instance::Instance;
use crate::package;
use crate::package::Package;
use crate::package::PackageSource;
use crate::package::ReadAdapter;
use crate::registry::ARGUMENT_NAMES_MODULE;
use crate::registry::ARGUMENT_NAMES_SOURCE;
use crate::registry::ModuleRegistry;
use crate::registry::ModuleResolver;
use crate::replicated::ObjectId;
use crate::session;
use crate::session::Session;

#[derive(Debug)]
pub enum Error {
    /// A pool needs at least one instance.
    Empty,
    Instance { ordinal: usize, source: instance::Error },
    NoSuchInstance { ordinal: usize, len: usize },
    Session(session::Error),
    Package(package::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "Pool must have at least one instance"),
            Self::Instance { ordinal, source } => write!(f, "Instance {} failed to start: {}", ordinal, source),
            Self::NoSuchInstance { ordinal, len } => {
                write!(f, "No instance {} in a pool of {}", ordinal, len)
            }
            Self::Session(e) => write!(f, "Session error: {}", e),
            Self::Package(e) => write!(f, "Package error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Instance { source, .. } => Some(source),
            Self::Session(e) => Some(e),
            Self::Package(e) => Some(e),
            _ => None,
        }
    }
}

impl From<session::Error> for Error {
    fn from(e: session::Error) -> Self {
        Self::Session(e)
    }
}

impl From<package::Error> for Error {
    fn from(e: package::Error) -> Self {
        Self::Package(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// State shared by a pool, its sessions and its replicated objects.
pub(crate) struct PoolShared {
    instances: Vec<Instance>,
    balancer: LoadBalancer,
    modules: Arc<ModuleRegistry>,
    next_object_id: AtomicU64,
}

impl PoolShared {
    pub(crate) fn instance(&self, ordinal: usize) -> &Instance {
        &self.instances[ordinal]
    }

    pub(crate) fn checked_instance(&self, ordinal: usize) -> Result<&Instance> {
        self.instances.get(ordinal).ok_or(Error::NoSuchInstance {
            ordinal,
            len: self.instances.len(),
        })
    }

    pub(crate) fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    pub(crate) fn next_object_id(&self) -> ObjectId {
        ObjectId(self.next_object_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Evicts `id` from every instance. Returns how many had it cached.
    pub(crate) fn evict_everywhere(&self, id: ObjectId) -> usize {
        self.instances.iter().filter(|instance| instance.evict(id)).count()
    }

    pub(crate) fn acquire(this: &Arc<Self>) -> Session {
        let index = this.balancer.acquire();
        Session::leased(Arc::clone(this), index)
    }

    pub(crate) fn session_on(this: &Arc<Self>, ordinal: usize) -> Result<Session> {
        this.checked_instance(ordinal)?;
        Ok(Session::pooled(Arc::clone(this), ordinal))
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        info!(instances = self.instances.len(), "shutting down pool");
    }
}

/// A fixed-size pool of interpreter instances.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl Pool {
    /// Builds a pool of `instances` from the default embedded image search path.
    pub fn new(instances: usize) -> Result<Self> {
        Self::builder().instances(instances).build()
    }

    pub fn builder() -> PoolBuilder {
        PoolBuilder::default()
    }

    /// Leases whichever instance the load balancer picks. Never blocks.
    pub fn acquire_one(&self) -> Session {
        PoolShared::acquire(&self.shared)
    }

    /// Opens a session on a specific instance without taking a load balancer slot.
    pub fn acquire_session_on(&self, ordinal: usize) -> Result<Session> {
        PoolShared::session_on(&self.shared, ordinal)
    }

    /// Makes `source` importable as `name` in every instance, for imports that happen
    /// after this call.
    pub fn register_module_source(&self, name: impl Into<String>, source: impl Into<String>) {
        self.shared.modules.register(name, source);
    }

    pub fn modules(&self) -> &ModuleRegistry {
        &self.shared.modules
    }

    /// Opens the package at `uri` for use with this pool.
    pub fn load_package(&self, uri: impl Into<String>) -> Result<Package> {
        Ok(Package::open(PackageSource::Uri(uri.into()), self.clone())?)
    }

    pub fn load_package_from_reader(&self, reader: Arc<dyn ReadAdapter>) -> Result<Package> {
        Ok(Package::open(PackageSource::Reader(reader), self.clone())?)
    }

    pub fn len(&self) -> usize {
        self.shared.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.instances.is_empty()
    }

    pub fn instance(&self, ordinal: usize) -> Option<&Instance> {
        self.shared.instances.get(ordinal)
    }

    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        self.shared.instances.iter()
    }

    /// Load balancer counters, one per instance.
    pub fn usage(&self) -> Vec<u64> {
        self.shared.balancer.snapshot()
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("instances", &self.shared.instances)
            .field("modules", &self.shared.modules.len())
            .finish()
    }
}

/// Configuration for a [`Pool`].
#[derive(Clone, Debug)]
pub struct PoolBuilder {
    instances: usize,
    launcher: Launcher,
    modules: Vec<(String, String)>,
}

impl Default for PoolBuilder {
    /// One instance per available core, loaded from the default embedded images.
    fn default() -> Self {
        Self {
            instances: std::thread::available_parallelism().map_or(1, |n| n.get()),
            launcher: Launcher::embedded(),
            modules: Vec::new(),
        }
    }
}

impl PoolBuilder {
    pub fn instances(mut self, n: usize) -> Self {
        self.instances = n;
        self
    }

    pub fn launcher(mut self, launcher: Launcher) -> Self {
        self.launcher = launcher;
        self
    }

    /// Registers a module source before any instance starts.
    pub fn module(mut self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.modules.push((name.into(), source.into()));
        self
    }

    /// Launches every instance. Fails without leaving a partial pool behind.
    pub fn build(self) -> Result<Pool> {
        if self.instances == 0 {
            return Err(Error::Empty);
        }

        let modules = Arc::new(ModuleRegistry::new());
        modules.register(ARGUMENT_NAMES_MODULE, ARGUMENT_NAMES_SOURCE);
        for (name, source) in self.modules {
            modules.register(name, source);
        }

        let mut instances = Vec::with_capacity(self.instances);
        for ordinal in 0..self.instances {
            let resolver: Arc<dyn ModuleResolver> = modules.clone();
            let instance = Instance::boot(&self.launcher, ordinal, resolver)
                .map_err(|source| Error::Instance { ordinal, source })?;
            instances.push(instance);
        }
        info!(instances = instances.len(), launcher = ?self.launcher, "pool ready");

        Ok(Pool {
            shared: Arc::new(PoolShared {
                balancer: LoadBalancer::new(instances.len()),
                instances,
                modules,
                next_object_id: AtomicU64::new(1),
            }),
        })
    }
}
