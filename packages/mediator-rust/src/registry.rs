//! Handler resolution: the provider contract and the bundled registry.
//!
//! Handlers are stored type-erased as `Arc<dyn Any + Send + Sync>` whose
//! concrete type is `Arc<dyn RequestHandler<R>>` or `Arc<dyn EventHandler<E>>`,
//! keyed by the `TypeId` of that trait-object type. Lookups downcast back to
//! the typed handle.

use std::any::{Any, TypeId};
use std::sync::Arc;

use courier_core::{ConfigError, Event, Request};
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::handler::{EventHandler, RequestHandler};

/// Type-erased handler handle.
pub type ErasedHandler = Arc<dyn Any + Send + Sync>;

type Factory = Arc<dyn Fn() -> ErasedHandler + Send + Sync>;

/// Resolves handlers for a message type. Plugged into the mediator in place
/// of a dependency-injection container.
pub trait HandlerProvider: Send + Sync + 'static {
    /// Every handler registered under `key`, in registration order.
    fn resolve(&self, key: TypeId) -> Vec<ErasedHandler>;
}

/// Key under which request handlers for `R` are registered.
#[must_use]
pub fn request_key<R: Request>() -> TypeId {
    TypeId::of::<Arc<dyn RequestHandler<R>>>()
}

/// Key under which event handlers for `E` are registered.
#[must_use]
pub fn event_key<E: Event>() -> TypeId {
    TypeId::of::<Arc<dyn EventHandler<E>>>()
}

/// Resolves and downcasts the request handlers for `R`.
pub fn resolve_request_handlers<R: Request>(
    provider: &dyn HandlerProvider,
) -> Vec<Arc<dyn RequestHandler<R>>> {
    provider
        .resolve(request_key::<R>())
        .into_iter()
        .filter_map(|erased| erased.downcast_ref::<Arc<dyn RequestHandler<R>>>().cloned())
        .collect()
}

/// Resolves and downcasts the event handlers for `E`.
pub fn resolve_event_handlers<E: Event>(provider: &dyn HandlerProvider) -> Vec<Arc<dyn EventHandler<E>>> {
    provider
        .resolve(event_key::<E>())
        .into_iter()
        .filter_map(|erased| erased.downcast_ref::<Arc<dyn EventHandler<E>>>().cloned())
        .collect()
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum Registration {
    Singleton(ErasedHandler),
    /// Invoked on every resolve; the mediator's cache makes the first result stick.
    Factory(Factory),
}

impl Registration {
    fn produce(&self) -> ErasedHandler {
        match self {
            Registration::Singleton(handler) => Arc::clone(handler),
            Registration::Factory(factory) => factory(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Request,
    Event,
}

/// In-process handler registry.
pub struct HandlerRegistry {
    by_type: DashMap<TypeId, Vec<Registration>>,
    /// Message type name and kind per key, in first-registration order.
    declared: RwLock<Vec<(TypeId, &'static str, Kind)>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_type: DashMap::new(),
            declared: RwLock::new(Vec::new()),
        }
    }

    fn insert(&self, key: TypeId, name: &'static str, kind: Kind, registration: Registration) {
        let first = {
            let mut entry = self.by_type.entry(key).or_default();
            entry.push(registration);
            entry.len() == 1
        };
        if first {
            self.declared.write().push((key, name, kind));
        }
    }

    pub fn register_request<R, H>(&self, handler: H)
    where
        R: Request,
        H: RequestHandler<R>,
    {
        let typed: Arc<dyn RequestHandler<R>> = Arc::new(handler);
        self.insert(
            request_key::<R>(),
            R::message_type(),
            Kind::Request,
            Registration::Singleton(Arc::new(typed)),
        );
    }

    /// Registers a factory; it runs on each provider resolve.
    pub fn register_request_factory<R, H, F>(&self, factory: F)
    where
        R: Request,
        H: RequestHandler<R>,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let erased: Factory = Arc::new(move || {
            let typed: Arc<dyn RequestHandler<R>> = Arc::new(factory());
            Arc::new(typed) as ErasedHandler
        });
        self.insert(
            request_key::<R>(),
            R::message_type(),
            Kind::Request,
            Registration::Factory(erased),
        );
    }

    pub fn register_event<E, H>(&self, handler: H)
    where
        E: Event,
        H: EventHandler<E>,
    {
        let typed: Arc<dyn EventHandler<E>> = Arc::new(handler);
        self.insert(
            event_key::<E>(),
            E::message_type(),
            Kind::Event,
            Registration::Singleton(Arc::new(typed)),
        );
    }

    pub fn register_event_factory<E, H, F>(&self, factory: F)
    where
        E: Event,
        H: EventHandler<E>,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let erased: Factory = Arc::new(move || {
            let typed: Arc<dyn EventHandler<E>> = Arc::new(factory());
            Arc::new(typed) as ErasedHandler
        });
        self.insert(
            event_key::<E>(),
            E::message_type(),
            Kind::Event,
            Registration::Factory(erased),
        );
    }

    /// Number of handlers registered under `key`.
    #[must_use]
    pub fn count(&self, key: TypeId) -> usize {
        self.by_type.get(&key).map_or(0, |entry| entry.len())
    }

    /// Checks that no request type has more than one handler.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::DuplicateRequestHandler` for the first offending type.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let declared = self.declared.read().clone();
        for (key, name, kind) in declared {
            if kind != Kind::Request {
                continue;
            }
            let count = self.count(key);
            if count > 1 {
                return Err(ConfigError::DuplicateRequestHandler {
                    message_type: name.to_string(),
                    count,
                });
            }
        }
        Ok(())
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let declared: Vec<&'static str> = self.declared.read().iter().map(|(_, name, _)| *name).collect();
        f.debug_struct("HandlerRegistry")
            .field("message_types", &declared)
            .finish()
    }
}

impl HandlerProvider for HandlerRegistry {
    fn resolve(&self, key: TypeId) -> Vec<ErasedHandler> {
        // Snapshot first so factories never run under a shard lock.
        let registrations = match self.by_type.get(&key) {
            Some(entry) => entry.value().clone(),
            None => return Vec::new(),
        };
        registrations.iter().map(Registration::produce).collect()
    }
}
