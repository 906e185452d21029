//! Named, ordered interceptor registry.
//!
//! # Design Decisions
//! - The list is kept sorted by `order` ascending; equal orders keep
//!   registration sequence
//! - Readers get an immutable snapshot (`Arc<Vec<_>>`), writers swap in a
//!   new list, so a chain in flight never observes a concurrent change

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::interceptor::Interceptor;

/// A registered interceptor. Immutable once registered.
pub struct InterceptorHolder {
    pub name: String,
    pub order: i32,
    pub interceptor: Arc<dyn Interceptor>,
}

impl std::fmt::Debug for InterceptorHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorHolder")
            .field("name", &self.name)
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

/// Ordered collection of named interceptors.
pub struct InterceptorRegistry {
    holders: ArcSwap<Vec<Arc<InterceptorHolder>>>,
}

impl InterceptorRegistry {
    pub fn new() -> Self {
        Self {
            holders: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Register an interceptor, replacing any existing one with the same name.
    pub fn register(&self, name: impl Into<String>, order: i32, interceptor: Arc<dyn Interceptor>) {
        let holder = Arc::new(InterceptorHolder {
            name: name.into(),
            order,
            interceptor,
        });

        self.holders.rcu(|current| {
            let mut next: Vec<Arc<InterceptorHolder>> = current
                .iter()
                .filter(|h| h.name != holder.name)
                .cloned()
                .collect();
            let position = next
                .iter()
                .position(|h| h.order > holder.order)
                .unwrap_or(next.len());
            next.insert(position, holder.clone());
            next
        });

        tracing::info!(name = %holder.name, order = holder.order, "Interceptor registered");
    }

    /// Remove an interceptor by name. No-op if absent.
    pub fn unregister(&self, name: &str) {
        let previous = self.holders.rcu(|current| {
            current
                .iter()
                .filter(|h| h.name != name)
                .cloned()
                .collect::<Vec<_>>()
        });

        if previous.iter().any(|h| h.name == name) {
            tracing::info!(name = %name, "Interceptor unregistered");
        }
    }

    /// Ordered snapshot of the registered interceptors.
    pub fn interceptors(&self) -> Arc<Vec<Arc<InterceptorHolder>>> {
        self.holders.load_full()
    }

    pub fn len(&self) -> usize {
        self.holders.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InterceptorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
