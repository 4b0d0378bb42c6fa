//! # Service Container
//!
//! Thread-safe, type-keyed service container.
//!
//! Services are registered as transient factories (`bind`), lazily built
//! shared instances (`singleton`) or ready values (`instance`), and resolved
//! with `make::<T>()`. Factories receive the container so they can resolve
//! their own dependencies; a factory that asks for the type it is building
//! gets `Error::CircularDependency`.

use crate::error::{Error, Result};
use std::any::{type_name, Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};

type Shared = Arc<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn(&Container) -> Result<Shared> + Send + Sync>;

/// Container address and service type currently being resolved
type ResolvingKey = (usize, TypeId);

thread_local! {
    static RESOLVING: RefCell<Vec<ResolvingKey>> = const { RefCell::new(Vec::new()) };
}

enum Slot {
    Empty,
    /// A factory is running on some thread
    Building,
    Ready(Shared),
}

enum Binding {
    /// New value on every resolve
    Transient(Factory),
    /// Built once, cached afterwards
    Shared {
        factory: Option<Factory>,
        slot: Mutex<Slot>,
        ready: Condvar,
    },
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Binding {
    fn shared(factory: Option<Factory>, slot: Slot) -> Self {
        Self::Shared {
            factory,
            slot: Mutex::new(slot),
            ready: Condvar::new(),
        }
    }

    fn resolve(&self, container: &Container) -> Result<Shared> {
        match self {
            Self::Transient(factory) => factory(container),
            Self::Shared {
                factory,
                slot,
                ready,
            } => {
                let mut state = lock(slot);
                loop {
                    if let Slot::Ready(existing) = &*state {
                        return Ok(Arc::clone(existing));
                    }
                    if matches!(*state, Slot::Empty) {
                        break;
                    }
                    state = ready.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
                let factory = factory.as_ref().ok_or(Error::Unresolvable {
                    type_name: "<empty shared binding>",
                })?;

                // Other threads wait on `ready` instead of the lock, so the
                // factory is free to resolve further services.
                *state = Slot::Building;
                drop(state);
                let pending = Pending { slot, ready };

                let built = factory(container)?;
                *lock(slot) = Slot::Ready(Arc::clone(&built));
                drop(pending);
                Ok(built)
            }
        }
    }
}

/// Wakes waiters once a build ends; a failed or panicked build leaves the
/// slot empty for the next resolve
struct Pending<'a> {
    slot: &'a Mutex<Slot>,
    ready: &'a Condvar,
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        let mut state = lock(self.slot);
        if matches!(*state, Slot::Building) {
            *state = Slot::Empty;
        }
        drop(state);
        self.ready.notify_all();
    }
}

/// Marks a service as being resolved on this thread
struct Resolving(ResolvingKey);

impl Resolving {
    fn enter(key: ResolvingKey) -> Option<Self> {
        RESOLVING.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.contains(&key) {
                return None;
            }
            stack.push(key);
            Some(Self(key))
        })
    }
}

impl Drop for Resolving {
    fn drop(&mut self) {
        RESOLVING.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(pos) = stack.iter().rposition(|key| *key == self.0) {
                stack.remove(pos);
            }
        });
    }
}

/// Service container keyed by Rust type
#[derive(Default)]
pub struct Container {
    bindings: RwLock<HashMap<TypeId, Arc<Binding>>>,
}

impl Container {
    /// Create an empty container
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory that runs on every `make`
    pub fn bind<T, F>(&self, factory: F)
    where
        T: Send + Sync + 'static,
        F: Fn(&Self) -> Result<T> + Send + Sync + 'static,
    {
        self.insert::<T>(Binding::Transient(erase(factory)));
    }

    /// Register a factory whose result is built once and shared
    pub fn singleton<T, F>(&self, factory: F)
    where
        T: Send + Sync + 'static,
        F: Fn(&Self) -> Result<T> + Send + Sync + 'static,
    {
        self.insert::<T>(Binding::shared(Some(erase(factory)), Slot::Empty));
    }

    /// Register an already built shared value
    pub fn instance<T: Send + Sync + 'static>(&self, value: T) {
        self.instance_arc(Arc::new(value));
    }

    /// Register an already shared value
    pub fn instance_arc<T: Send + Sync + 'static>(&self, value: Arc<T>) {
        let shared: Shared = value;
        self.insert::<T>(Binding::shared(None, Slot::Ready(shared)));
    }

    fn insert<T: 'static>(&self, binding: Binding) {
        let mut bindings = self.bindings.write().unwrap_or_else(PoisonError::into_inner);
        bindings.insert(TypeId::of::<T>(), Arc::new(binding));
        tracing::trace!(service = type_name::<T>(), "Service bound");
    }

    /// Resolve a service
    ///
    /// # Errors
    ///
    /// Returns `Error::Unresolvable` if nothing is bound for `T`,
    /// `Error::CircularDependency` if `T`'s factory ends up asking for `T`
    /// again, or the factory's own error.
    pub fn make<T: Send + Sync + 'static>(&self) -> Result<Arc<T>> {
        let unresolvable = || Error::Unresolvable {
            type_name: type_name::<T>(),
        };
        let _resolving = Resolving::enter((self as *const Self as usize, TypeId::of::<T>()))
            .ok_or(Error::CircularDependency {
                type_name: type_name::<T>(),
            })?;

        // The map lock is released before the factory runs, so factories
        // may resolve other services.
        let binding = {
            let bindings = self.bindings.read().unwrap_or_else(PoisonError::into_inner);
            bindings.get(&TypeId::of::<T>()).cloned()
        }
        .ok_or_else(unresolvable)?;

        binding
            .resolve(self)?
            .downcast::<T>()
            .map_err(|_| unresolvable())
    }

    /// Check if a type is bound
    #[must_use]
    pub fn has<T: 'static>(&self) -> bool {
        let bindings = self.bindings.read().unwrap_or_else(PoisonError::into_inner);
        bindings.contains_key(&TypeId::of::<T>())
    }

    /// Remove a binding; returns whether one existed
    pub fn forget<T: 'static>(&self) -> bool {
        let mut bindings = self.bindings.write().unwrap_or_else(PoisonError::into_inner);
        bindings.remove(&TypeId::of::<T>()).is_some()
    }

    /// Number of bindings
    #[must_use]
    pub fn len(&self) -> usize {
        let bindings = self.bindings.read().unwrap_or_else(PoisonError::into_inner);
        bindings.len()
    }

    /// Check if the container is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("bindings", &self.len())
            .finish()
    }
}

fn erase<T, F>(factory: F) -> Factory
where
    T: Send + Sync + 'static,
    F: Fn(&Container) -> Result<T> + Send + Sync + 'static,
{
    Arc::new(move |container| factory(container).map(|value| Arc::new(value) as Shared))
}

/// Values that can be resolved out of the container for a handler
pub trait Inject: Sized + Send + 'static {
    /// Resolve the value
    ///
    /// # Errors
    ///
    /// Returns an error if a required service is not bound.
    fn inject(container: &Container) -> Result<Self>;
}

impl<T: Send + Sync + 'static> Inject for Arc<T> {
    fn inject(container: &Container) -> Result<Self> {
        container.make::<T>()
    }
}

impl<A: Inject, B: Inject> Inject for (A, B) {
    fn inject(container: &Container) -> Result<Self> {
        Ok((A::inject(container)?, B::inject(container)?))
    }
}

impl<A: Inject, B: Inject, C: Inject> Inject for (A, B, C) {
    fn inject(container: &Container) -> Result<Self> {
        Ok((
            A::inject(container)?,
            B::inject(container)?,
            C::inject(container)?,
        ))
    }
}
