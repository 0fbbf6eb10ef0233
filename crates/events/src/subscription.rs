//! Subscription bookkeeping: who is listening to which integration event.
//!
//! The registry keeps, per event name, the concrete event descriptor (used to
//! deserialize deliveries) and the ordered list of subscriptions. Both live in
//! one entry, so an event name has a descriptor exactly when it has at least one
//! subscription.
//!
//! Each subscription carries a statically-typed dispatch adapter for its
//! `(event, handler)` pair: the bus never inspects types at delivery time, it
//! decodes through the descriptor and calls the adapter with whatever the
//! [`HandlerResolver`](crate::HandlerResolver) returned.
//!
//! All mutation and iteration happen under one mutex. Readers get cloned
//! snapshots and never hold the lock while handlers run.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError, mpsc};

use thiserror::Error;
use tracing::debug;

use crate::bus::Subscription;
use crate::codec::{self, CodecError};
use crate::handler::{HandlerKey, IntegrationEventHandler, ResolvedHandler};
use crate::IntegrationEvent;

/// A decoded event, type-erased.
pub type DecodedEvent = Box<dyn Any + Send + Sync>;

/// Future returned by a dispatch adapter.
pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

type DecodeFn = fn(&[u8]) -> Result<DecodedEvent, CodecError>;
type InvokeFn = fn(ResolvedHandler, &(dyn Any + Send + Sync)) -> Result<HandlerFuture, DispatchError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("handler {handler} already registered for '{event}'")]
    DuplicateHandler { event: String, handler: String },

    #[error("event name '{event}' is already bound to {existing}, cannot bind {requested}")]
    EventNameConflict {
        event: String,
        existing: &'static str,
        requested: &'static str,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("resolved instance is not a {handler}")]
    HandlerTypeMismatch { handler: &'static str },

    #[error("decoded event is not a {event}")]
    EventTypeMismatch { event: &'static str },
}

/// Concrete event type registered under an event name.
#[derive(Clone, Copy)]
pub struct EventDescriptor {
    name: &'static str,
    type_id: TypeId,
    type_name: &'static str,
    decode: DecodeFn,
}

impl EventDescriptor {
    pub fn of<E: IntegrationEvent>() -> Self {
        Self {
            name: E::NAME,
            type_id: TypeId::of::<E>(),
            type_name: std::any::type_name::<E>(),
            decode: decode_as::<E>,
        }
    }

    /// Event name (routing key).
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Decode a wire body into this concrete type.
    pub fn decode(&self, body: &[u8]) -> Result<DecodedEvent, CodecError> {
        (self.decode)(body)
    }
}

impl core::fmt::Debug for EventDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventDescriptor")
            .field("name", &self.name)
            .field("type_name", &self.type_name)
            .finish()
    }
}

fn decode_as<E: IntegrationEvent>(body: &[u8]) -> Result<DecodedEvent, CodecError> {
    codec::decode::<E>(body).map(|event| Box::new(event) as DecodedEvent)
}

/// Typed handlers are the only kind registered today; `Dynamic` is reserved for
/// late-bound handlers that receive raw JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    Typed,
    Dynamic,
}

/// One registered `(event, handler)` pairing.
#[derive(Clone, Copy)]
pub struct SubscriptionInfo {
    handler: HandlerKey,
    kind: SubscriptionKind,
    invoke: InvokeFn,
}

impl SubscriptionInfo {
    pub fn typed<E, H>() -> Self
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        Self {
            handler: HandlerKey::of::<H>(),
            kind: SubscriptionKind::Typed,
            invoke: invoke_as::<E, H>,
        }
    }

    pub fn handler(&self) -> HandlerKey {
        self.handler
    }

    pub fn kind(&self) -> SubscriptionKind {
        self.kind
    }

    pub fn is_dynamic(&self) -> bool {
        self.kind == SubscriptionKind::Dynamic
    }

    /// Bind a resolved handler and a decoded event into a runnable future.
    pub fn invoke(
        &self,
        handler: ResolvedHandler,
        event: &(dyn Any + Send + Sync),
    ) -> Result<HandlerFuture, DispatchError> {
        (self.invoke)(handler, event)
    }
}

impl core::fmt::Debug for SubscriptionInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SubscriptionInfo")
            .field("handler", &self.handler.type_name())
            .field("kind", &self.kind)
            .finish()
    }
}

fn invoke_as<E, H>(
    handler: ResolvedHandler,
    event: &(dyn Any + Send + Sync),
) -> Result<HandlerFuture, DispatchError>
where
    E: IntegrationEvent,
    H: IntegrationEventHandler<E>,
{
    let handler = handler
        .downcast::<H>()
        .map_err(|_| DispatchError::HandlerTypeMismatch {
            handler: std::any::type_name::<H>(),
        })?;
    let event = event
        .downcast_ref::<E>()
        .cloned()
        .ok_or(DispatchError::EventTypeMismatch { event: E::NAME })?;

    Ok(Box::pin(async move {
        <H as IntegrationEventHandler<E>>::handle(&*handler, event).await
    }))
}

/// Everything the consumer needs to dispatch one delivery, captured atomically.
#[derive(Debug, Clone)]
pub struct DispatchPlan {
    pub descriptor: EventDescriptor,
    pub subscriptions: Vec<SubscriptionInfo>,
}

struct EventEntry {
    descriptor: EventDescriptor,
    subscriptions: Vec<SubscriptionInfo>,
}

#[derive(Default)]
struct RegistryState {
    events: HashMap<String, EventEntry>,
    removal_listeners: Vec<mpsc::Sender<String>>,
}

/// In-memory subscription registry shared (by `Arc`) between the bus and its
/// consumer task.
#[derive(Default)]
pub struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // Every mutation leaves the state consistent before it can panic.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Event name used for `E` (its simple type name).
    pub fn event_key<E: IntegrationEvent>() -> &'static str {
        E::NAME
    }

    pub fn is_empty(&self) -> bool {
        self.lock().events.is_empty()
    }

    /// Register `H` as a handler for `E`.
    ///
    /// Fails without touching the registry when `H` is already registered for
    /// `E`'s name, or when another concrete type already owns that name.
    pub fn add_subscription<E, H>(&self) -> Result<(), RegistryError>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let info = SubscriptionInfo::typed::<E, H>();
        let descriptor = EventDescriptor::of::<E>();
        let mut state = self.lock();

        match state.events.get_mut(E::NAME) {
            Some(entry) => {
                if entry.descriptor.type_id() != descriptor.type_id() {
                    return Err(RegistryError::EventNameConflict {
                        event: E::NAME.to_string(),
                        existing: entry.descriptor.type_name(),
                        requested: descriptor.type_name(),
                    });
                }
                if entry.subscriptions.iter().any(|s| s.handler() == info.handler()) {
                    return Err(RegistryError::DuplicateHandler {
                        event: E::NAME.to_string(),
                        handler: info.handler().type_name().to_string(),
                    });
                }
                entry.subscriptions.push(info);
            }
            None => {
                state.events.insert(
                    E::NAME.to_string(),
                    EventEntry {
                        descriptor,
                        subscriptions: vec![info],
                    },
                );
            }
        }

        debug!(event_name = E::NAME, handler = %info.handler(), "subscription added");
        Ok(())
    }

    /// Remove `H` from `E`'s handlers. Returns `false` when it was not registered.
    ///
    /// Removing the last handler drops the event name entirely and notifies
    /// removal listeners once.
    pub fn remove_subscription<E, H>(&self) -> bool
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let handler = HandlerKey::of::<H>();
        let mut state = self.lock();

        let Some(entry) = state.events.get_mut(E::NAME) else {
            return false;
        };
        let Some(position) = entry.subscriptions.iter().position(|s| s.handler() == handler)
        else {
            return false;
        };

        entry.subscriptions.remove(position);
        debug!(event_name = E::NAME, handler = %handler, "subscription removed");

        if entry.subscriptions.is_empty() {
            state.events.remove(E::NAME);
            let name = E::NAME.to_string();
            state
                .removal_listeners
                .retain(|tx| tx.send(name.clone()).is_ok());
            debug!(event_name = E::NAME, "last subscription removed");
        }

        true
    }

    pub fn has_subscriptions_for<E: IntegrationEvent>(&self) -> bool {
        self.has_subscriptions_for_event(E::NAME)
    }

    pub fn has_subscriptions_for_event(&self, event_name: &str) -> bool {
        self.lock().events.contains_key(event_name)
    }

    pub fn handlers_for<E: IntegrationEvent>(&self) -> Vec<SubscriptionInfo> {
        self.handlers_for_event(E::NAME)
    }

    /// Ordered snapshot of the handlers for `event_name` (empty when unknown).
    pub fn handlers_for_event(&self, event_name: &str) -> Vec<SubscriptionInfo> {
        self.lock()
            .events
            .get(event_name)
            .map(|entry| entry.subscriptions.clone())
            .unwrap_or_default()
    }

    /// Concrete type to decode `event_name` deliveries into.
    pub fn event_type_by_name(&self, event_name: &str) -> Option<EventDescriptor> {
        self.lock()
            .events
            .get(event_name)
            .map(|entry| entry.descriptor)
    }

    /// Descriptor and handlers for `event_name`, read under a single lock.
    pub fn dispatch_plan(&self, event_name: &str) -> Option<DispatchPlan> {
        self.lock().events.get(event_name).map(|entry| DispatchPlan {
            descriptor: entry.descriptor,
            subscriptions: entry.subscriptions.clone(),
        })
    }

    /// Names with at least one live subscription, sorted.
    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().events.keys().cloned().collect();
        names.sort();
        names
    }

    /// Forget every subscription (bus teardown). Listeners are not notified.
    pub fn clear(&self) {
        self.lock().events.clear();
    }

    /// Receive the name of every event whose last subscription is removed.
    pub fn on_event_removed(&self) -> Subscription<String> {
        let (tx, rx) = mpsc::channel();
        self.lock().removal_listeners.push(tx);
        Subscription::new(rx)
    }
}

impl core::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("events", &self.event_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use proptest::prelude::*;

    crate::integration_event! {
        pub struct PriceChanged {
            sku: String,
            price: u64,
        }
    }

    crate::integration_event! {
        pub struct OrderPlaced {
            order_no: u32,
        }
    }

    mod shadow {
        crate::integration_event! {
            pub struct PriceChanged {
                cents: u64,
            }
        }
    }

    macro_rules! noop_handler {
        ($name:ident) => {
            struct $name;

            #[async_trait]
            impl IntegrationEventHandler<PriceChanged> for $name {
                async fn handle(&self, _event: PriceChanged) -> anyhow::Result<()> {
                    Ok(())
                }
            }

            #[async_trait]
            impl IntegrationEventHandler<OrderPlaced> for $name {
                async fn handle(&self, _event: OrderPlaced) -> anyhow::Result<()> {
                    Ok(())
                }
            }

            #[async_trait]
            impl IntegrationEventHandler<shadow::PriceChanged> for $name {
                async fn handle(&self, _event: shadow::PriceChanged) -> anyhow::Result<()> {
                    Ok(())
                }
            }
        };
    }

    noop_handler!(A);
    noop_handler!(B);
    noop_handler!(C);

    fn handler_names(subs: &[SubscriptionInfo]) -> Vec<&'static str> {
        subs.iter().map(|s| s.handler().short_name()).collect()
    }

    #[test]
    fn handlers_come_back_in_insertion_order() {
        let registry = SubscriptionRegistry::new();
        registry.add_subscription::<PriceChanged, B>().unwrap();
        registry.add_subscription::<PriceChanged, A>().unwrap();
        registry.add_subscription::<PriceChanged, C>().unwrap();

        assert_eq!(
            handler_names(&registry.handlers_for::<PriceChanged>()),
            vec!["B", "A", "C"]
        );
        assert!(registry.handlers_for::<PriceChanged>().iter().all(|s| !s.is_dynamic()));
    }

    #[test]
    fn first_subscription_records_the_event_type() {
        let registry = SubscriptionRegistry::new();
        assert!(registry.event_type_by_name("PriceChanged").is_none());

        registry.add_subscription::<PriceChanged, A>().unwrap();

        let descriptor = registry.event_type_by_name("PriceChanged").unwrap();
        assert_eq!(descriptor.name(), "PriceChanged");
        assert_eq!(descriptor.type_id(), TypeId::of::<PriceChanged>());
        assert!(registry.has_subscriptions_for_event("PriceChanged"));
    }

    #[test]
    fn duplicate_registration_fails_and_leaves_registry_unchanged() {
        let registry = SubscriptionRegistry::new();
        registry.add_subscription::<PriceChanged, A>().unwrap();
        registry.add_subscription::<PriceChanged, B>().unwrap();

        let err = registry.add_subscription::<PriceChanged, A>().unwrap_err();

        assert!(matches!(err, RegistryError::DuplicateHandler { ref event, .. } if event == "PriceChanged"));
        assert_eq!(
            handler_names(&registry.handlers_for::<PriceChanged>()),
            vec!["A", "B"]
        );
    }

    #[test]
    fn same_name_for_a_different_type_is_rejected() {
        let registry = SubscriptionRegistry::new();
        registry.add_subscription::<PriceChanged, A>().unwrap();

        let err = registry
            .add_subscription::<shadow::PriceChanged, B>()
            .unwrap_err();

        assert!(matches!(err, RegistryError::EventNameConflict { .. }));
        assert_eq!(registry.handlers_for::<PriceChanged>().len(), 1);
    }

    #[test]
    fn removing_the_last_handler_drops_the_type_and_notifies_once() {
        let registry = SubscriptionRegistry::new();
        let removed = registry.on_event_removed();
        registry.add_subscription::<PriceChanged, A>().unwrap();
        registry.add_subscription::<PriceChanged, B>().unwrap();

        assert!(registry.remove_subscription::<PriceChanged, A>());
        assert!(removed.try_recv().is_err());
        assert!(registry.event_type_by_name("PriceChanged").is_some());

        assert!(registry.remove_subscription::<PriceChanged, B>());
        assert_eq!(removed.recv_timeout(Duration::from_secs(1)).unwrap(), "PriceChanged");
        assert!(removed.try_recv().is_err());

        assert!(registry.event_type_by_name("PriceChanged").is_none());
        assert!(!registry.has_subscriptions_for::<PriceChanged>());
        assert!(registry.is_empty());
    }

    #[test]
    fn removing_an_unknown_subscription_is_a_no_op() {
        let registry = SubscriptionRegistry::new();
        let removed = registry.on_event_removed();
        registry.add_subscription::<PriceChanged, A>().unwrap();

        assert!(!registry.remove_subscription::<PriceChanged, B>());
        assert!(!registry.remove_subscription::<OrderPlaced, A>());

        assert_eq!(registry.handlers_for::<PriceChanged>().len(), 1);
        assert!(removed.try_recv().is_err());
    }

    #[test]
    fn unknown_event_names_have_no_handlers() {
        let registry = SubscriptionRegistry::new();
        assert!(registry.handlers_for_event("Nope").is_empty());
        assert!(registry.dispatch_plan("Nope").is_none());
    }

    #[test]
    fn clear_forgets_everything() {
        let registry = SubscriptionRegistry::new();
        registry.add_subscription::<PriceChanged, A>().unwrap();
        registry.add_subscription::<OrderPlaced, A>().unwrap();

        registry.clear();

        assert!(registry.is_empty());
        assert!(registry.event_names().is_empty());
    }

    #[tokio::test]
    async fn dispatch_plan_decodes_and_invokes_the_typed_handler() {
        use std::sync::Mutex as StdMutex;

        struct Recorder(StdMutex<Vec<u64>>);

        #[async_trait]
        impl IntegrationEventHandler<PriceChanged> for Recorder {
            async fn handle(&self, event: PriceChanged) -> anyhow::Result<()> {
                self.0.lock().unwrap().push(*event.price());
                Ok(())
            }
        }

        let registry = SubscriptionRegistry::new();
        registry.add_subscription::<PriceChanged, Recorder>().unwrap();

        let event = PriceChanged::new("SKU".into(), 1999);
        let body = codec::encode(&event).unwrap();
        let plan = registry.dispatch_plan(PriceChanged::NAME).unwrap();
        let decoded = plan.descriptor.decode(&body).unwrap();

        let recorder = Arc::new(Recorder(StdMutex::new(Vec::new())));
        let resolved: ResolvedHandler = recorder.clone();
        plan.subscriptions[0]
            .invoke(resolved, decoded.as_ref())
            .unwrap()
            .await
            .unwrap();

        assert_eq!(*recorder.0.lock().unwrap(), vec![1999]);
    }

    #[test]
    fn invoking_with_the_wrong_handler_instance_is_reported() {
        let info = SubscriptionInfo::typed::<PriceChanged, A>();
        let event = PriceChanged::new("SKU".into(), 1);
        let wrong: ResolvedHandler = Arc::new(B);

        let err = info.invoke(wrong, &event).err().unwrap();
        assert!(matches!(err, DispatchError::HandlerTypeMismatch { .. }));
    }

    #[test]
    fn concurrent_subscribe_and_unsubscribe_on_distinct_names_lose_nothing() {
        let registry = Arc::new(SubscriptionRegistry::new());
        registry.add_subscription::<OrderPlaced, A>().unwrap();
        registry.add_subscription::<OrderPlaced, B>().unwrap();

        let adder = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                for _ in 0..200 {
                    registry.add_subscription::<PriceChanged, A>().unwrap();
                    registry.add_subscription::<PriceChanged, B>().unwrap();
                    assert!(registry.remove_subscription::<PriceChanged, A>());
                    assert!(registry.remove_subscription::<PriceChanged, B>());
                }
                registry.add_subscription::<PriceChanged, C>().unwrap();
            })
        };
        let remover = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                for _ in 0..200 {
                    assert!(registry.remove_subscription::<OrderPlaced, B>());
                    registry.add_subscription::<OrderPlaced, B>().unwrap();
                }
                assert!(registry.remove_subscription::<OrderPlaced, A>());
            })
        };

        adder.join().unwrap();
        remover.join().unwrap();

        assert_eq!(handler_names(&registry.handlers_for::<PriceChanged>()), vec!["C"]);
        assert_eq!(handler_names(&registry.handlers_for::<OrderPlaced>()), vec!["B"]);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(usize),
        Remove(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..3).prop_map(Op::Add),
            (0usize..3).prop_map(Op::Remove),
        ]
    }

    fn add(registry: &SubscriptionRegistry, idx: usize) -> Result<(), RegistryError> {
        match idx {
            0 => registry.add_subscription::<PriceChanged, A>(),
            1 => registry.add_subscription::<PriceChanged, B>(),
            _ => registry.add_subscription::<PriceChanged, C>(),
        }
    }

    fn remove(registry: &SubscriptionRegistry, idx: usize) -> bool {
        match idx {
            0 => registry.remove_subscription::<PriceChanged, A>(),
            1 => registry.remove_subscription::<PriceChanged, B>(),
            _ => registry.remove_subscription::<PriceChanged, C>(),
        }
    }

    proptest! {
        #[test]
        fn registry_matches_an_ordered_model(ops in proptest::collection::vec(op(), 0..40)) {
            let names = ["A", "B", "C"];
            let registry = SubscriptionRegistry::new();
            let removed = registry.on_event_removed();
            let mut model: Vec<&str> = Vec::new();
            let mut expected_removals = 0usize;

            for op in ops {
                match op {
                    Op::Add(i) => {
                        let result = add(&registry, i);
                        if model.contains(&names[i]) {
                            prop_assert!(result.is_err());
                        } else {
                            prop_assert!(result.is_ok());
                            model.push(names[i]);
                        }
                    }
                    Op::Remove(i) => {
                        let was_present = model.contains(&names[i]);
                        prop_assert_eq!(remove(&registry, i), was_present);
                        model.retain(|n| *n != names[i]);
                        if was_present && model.is_empty() {
                            expected_removals += 1;
                        }
                    }
                }

                prop_assert_eq!(handler_names(&registry.handlers_for::<PriceChanged>()), model.clone());
                prop_assert_eq!(
                    registry.event_type_by_name("PriceChanged").is_some(),
                    !model.is_empty()
                );
            }

            prop_assert_eq!(removed.try_iter().count(), expected_removals);
        }
    }
}
