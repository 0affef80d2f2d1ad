//! # poolrun
//!
//! Runs several isolated copies of an embedded interpreter inside one process and
//! presents them as a single execution service.
//!
//! ## Architecture
//!
//! An interpreter with a global execution lock runs one thread of script code at a
//! time. N independent copies give N-way parallelism:
//!
//! - **Bootstrap**: loads a private copy of an interpreter image per instance
//! - **Pool**: fixed set of instances, a shared module registry, an object id counter
//! - **LoadBalancer**: lock-free choice of the least busy instance
//! - **Session**: scoped lease on one instance, released on drop
//! - **Replicated**: a value serialized once and materialized lazily on any instance
//!
//! ## Example
//!
//! ```rust,no_run
//! use poolrun::Pool;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = Pool::new(4)?;
//!
//! let model = {
//!     let session = pool.acquire_one();
//!     let obj = session.global("models", "load")?.call_values(vec!["resnet".into()])?;
//!     session.create_movable(&obj)?
//! };
//!
//! // Any other session, on any instance, can use the same model.
//! let session = pool.acquire_one();
//! let local = session.from_movable(&model)?;
//! # Ok(())
//! # }
//! ```

pub mod balancer;
pub mod bootstrap;
pub mod instance;
pub mod interpreter;
pub mod method;
pub mod package;
pub mod pool;
pub mod registry;
pub mod replicated;
pub mod session;

pub use balancer::LoadBalancer;
pub use bootstrap::ImageCandidate;
pub use bootstrap::Launcher;
pub use instance::Instance;
pub use interpreter::Interpreter;
pub use interpreter::LocalRef;
pub use interpreter::Value;
pub use method::MethodWrapper;
pub use package::Package;
pub use package::PackageSource;
pub use package::ReadAdapter;
pub use pool::Pool;
pub use pool::PoolBuilder;
pub use registry::ModuleRegistry;
pub use registry::ModuleResolver;
pub use replicated::ObjectId;
pub use replicated::Replicated;
pub use session::Obj;
pub use session::Session;

#[cfg(test)]
mod tests;
