//! # Replicated Objects
//!
//! A `Replicated` handle names a value by a pool-unique id and carries the bytes it
//! was serialized into when the handle was created. Any session of the owning pool can
//! materialize it; each instance deserializes at most once and caches the result.
//!
//! The `(id, bytes, pool)` payload is immutable and shared between clones. When the
//! last clone goes away the id is evicted from every instance of the pool. Isolated
//! instances cannot see handles dropped elsewhere, so without this fan-out their
//! cached copies would live as long as the instance.

use std::sync::Arc;

use tracing::trace;

use crate::pool;
use crate::pool::PoolShared;
use crate::session::Obj;
use crate::session::Session;

/// Pool-unique identity of a replicated object.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObjectId(pub u64);

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "obj-{}", self.0)
    }
}

struct Shared {
    id: ObjectId,
    data: Vec<u8>,
    pool: Arc<PoolShared>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let evicted = self.pool.evict_everywhere(self.id);
        trace!(id = %self.id, evicted, "replicated object dropped");
    }
}

/// Instance-independent handle to a value. Cheap to clone.
#[derive(Clone)]
pub struct Replicated {
    inner: Arc<Shared>,
}

impl Replicated {
    pub(crate) fn new(id: ObjectId, data: Vec<u8>, pool: Arc<PoolShared>) -> Self {
        Self {
            inner: Arc::new(Shared { id, data, pool }),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.inner.id
    }

    /// The serialized form, as produced by the instance that created the handle.
    pub fn data(&self) -> &[u8] {
        &self.inner.data
    }

    pub(crate) fn pool(&self) -> &Arc<PoolShared> {
        &self.inner.pool
    }

    /// Same as [`Session::from_movable`].
    pub fn materialize<'s>(&self, session: &'s Session) -> crate::session::Result<Obj<'s>> {
        session.from_movable(self)
    }

    /// Opens a session with this object already materialized as its `self_obj`.
    ///
    /// `on` picks a specific instance, otherwise the load balancer chooses.
    pub fn acquire_session(&self, on: Option<usize>) -> pool::Result<Session> {
        let pool = &self.inner.pool;
        let mut session = match on {
            Some(ordinal) => PoolShared::session_on(pool, ordinal)?,
            None => PoolShared::acquire(pool),
        };
        let local = session.instance().materialize(self.id(), self.data()).map_err(crate::session::Error::Runtime)?;
        session.set_self_obj(local);
        Ok(session)
    }

    /// Evicts the materialized copy from one instance, or from all of them.
    ///
    /// The bytes are kept, so the object can be materialized again later.
    pub fn unload(&self, on: Option<usize>) -> pool::Result<()> {
        let pool = &self.inner.pool;
        match on {
            Some(ordinal) => {
                pool.checked_instance(ordinal)?.evict(self.id());
            }
            None => {
                pool.evict_everywhere(self.id());
            }
        }
        Ok(())
    }

    /// Number of live clones of this handle.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl std::fmt::Debug for Replicated {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicated")
            .field("id", &self.inner.id)
            .field("bytes", &self.inner.data.len())
            .finish()
    }
}
