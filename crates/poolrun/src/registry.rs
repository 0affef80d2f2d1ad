//! # Module Source Registry
//!
//! Named module sources shared by every instance of a pool. Each instance holds an
//! `Arc` to the registry and consults it when its own import machinery cannot find a
//! module. Uses DashMap so registrations never take a pool-wide lock.
//!
//! Registrations are visible to resolutions that happen after them. Modules an
//! instance has already imported are not affected, and nothing orders a
//! registration against a resolution racing with it in another thread: register
//! sources before concurrent use begins.

use dashmap::DashMap;

/// Name of the module every pool registers at construction.
pub const ARGUMENT_NAMES_MODULE: &str = "argument_names";

/// Function exported by [`ARGUMENT_NAMES_MODULE`].
pub const ARGUMENT_NAMES_FUNC: &str = "argument_names";

pub(crate) const ARGUMENT_NAMES_SOURCE: &str = "from inspect import signature\n\
def argument_names(function): return list(signature(function).parameters.keys())\n";

/// Fallback lookup an interpreter uses for modules it cannot find itself.
pub trait ModuleResolver: Send + Sync {
    fn find_module(&self, name: &str) -> Option<String>;
}

/// Concurrent name → source mapping.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    sources: DashMap<String, String>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or overwrites a module source.
    pub fn register(&self, name: impl Into<String>, source: impl Into<String>) {
        self.sources.insert(name.into(), source.into());
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.sources.get(name).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl ModuleResolver for ModuleRegistry {
    fn find_module(&self, name: &str) -> Option<String> {
        self.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_overwrite() {
        let registry = ModuleRegistry::new();
        assert!(registry.is_empty());

        registry.register("greet", "x = 1\n");
        registry.register("greet", "x = 2\n");

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.find_module("greet").as_deref(), Some("x = 2\n"));
        assert!(registry.find_module("missing").is_none());
    }
}
