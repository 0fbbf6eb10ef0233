use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::IntegrationEvent;

/// Handles one delivered integration event of type `E`.
///
/// Handlers are invoked sequentially, in registration order, for each delivery.
/// A returned error is logged by the bus and does not affect sibling handlers or
/// the acknowledgement of the message.
#[async_trait]
pub trait IntegrationEventHandler<E: IntegrationEvent>: Send + Sync + 'static {
    async fn handle(&self, event: E) -> anyhow::Result<()>;
}

/// Identifies a handler type (the "handler type" of a subscription).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerKey {
    type_id: TypeId,
    type_name: &'static str,
}

impl HandlerKey {
    pub fn of<H: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<H>(),
            type_name: std::any::type_name::<H>(),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Fully-qualified type name.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Type name without its module path.
    pub fn short_name(&self) -> &'static str {
        self.type_name.rsplit("::").next().unwrap_or(self.type_name)
    }
}

impl core::fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.short_name())
    }
}

/// A resolved handler instance, type-erased.
pub type ResolvedHandler = Arc<dyn Any + Send + Sync>;

/// Resolves handler instances at dispatch time.
///
/// Returning `None` means "not registered"; the bus skips that handler for the
/// current delivery.
pub trait HandlerResolver: Send + Sync {
    fn resolve(&self, key: &HandlerKey) -> Option<ResolvedHandler>;
}

impl<R> HandlerResolver for Arc<R>
where
    R: HandlerResolver + ?Sized,
{
    fn resolve(&self, key: &HandlerKey) -> Option<ResolvedHandler> {
        (**self).resolve(key)
    }
}

type HandlerFactory = Arc<dyn Fn() -> ResolvedHandler + Send + Sync>;

/// Stock [`HandlerResolver`]: a map of handler factories keyed by handler type.
///
/// - `register_transient` builds a fresh handler for every delivery
/// - `register_singleton` hands out the same shared instance every time
#[derive(Default, Clone)]
pub struct HandlerProvider {
    factories: HashMap<HandlerKey, HandlerFactory>,
}

impl HandlerProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_transient<H, F>(&mut self, factory: F) -> &mut Self
    where
        H: Send + Sync + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.factories.insert(
            HandlerKey::of::<H>(),
            Arc::new(move || Arc::new(factory()) as ResolvedHandler),
        );
        self
    }

    pub fn register_singleton<H>(&mut self, handler: Arc<H>) -> &mut Self
    where
        H: Send + Sync + 'static,
    {
        self.factories.insert(
            HandlerKey::of::<H>(),
            Arc::new(move || handler.clone() as ResolvedHandler),
        );
        self
    }

    pub fn contains<H: 'static>(&self) -> bool {
        self.factories.contains_key(&HandlerKey::of::<H>())
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl core::fmt::Debug for HandlerProvider {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

impl HandlerResolver for HandlerProvider {
    fn resolve(&self, key: &HandlerKey) -> Option<ResolvedHandler> {
        self.factories.get(key).map(|factory| factory())
    }
}
