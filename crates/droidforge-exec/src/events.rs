//! In-process fan-out of timeline events.
//!
//! Delivery is synchronous and happens outside the registry lock, so a
//! listener may subscribe or unsubscribe from inside its callback.

use droidforge_core::{EventKind, ExecutionId, TimelineEvent};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Event callback
pub type Listener = Arc<dyn Fn(&TimelineEvent) + Send + Sync>;

struct Subscription {
    /// What gets invoked
    callback: Listener,
    /// What the caller registered; differs from `callback` for execution filters
    registered: Listener,
}

impl Subscription {
    fn direct(listener: Listener) -> Self {
        Self {
            callback: Arc::clone(&listener),
            registered: listener,
        }
    }
}

#[derive(Default)]
struct Registry {
    by_kind: HashMap<EventKind, Vec<Subscription>>,
    wildcard: Vec<Subscription>,
}

impl Registry {
    fn slot(&mut self, kind: Option<EventKind>) -> &mut Vec<Subscription> {
        match kind {
            Some(kind) => self.by_kind.entry(kind).or_default(),
            None => &mut self.wildcard,
        }
    }
}

/// Pub/sub for execution state changes. Never influences scheduling.
#[derive(Default)]
pub struct ExecutionEventBus {
    registry: Mutex<Registry>,
}

impl ExecutionEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to one event kind.
    pub fn subscribe(&self, kind: EventKind, listener: Listener) {
        self.registry()
            .slot(Some(kind))
            .push(Subscription::direct(listener));
    }

    /// Subscribe to every event.
    pub fn subscribe_all(&self, listener: Listener) {
        self.registry().wildcard.push(Subscription::direct(listener));
    }

    /// Subscribe to every event of one execution.
    ///
    /// The filter wrapper is tracked so `off(None, &listener)` removes it.
    pub fn on_execution(&self, execution_id: ExecutionId, listener: Listener) {
        let inner = Arc::clone(&listener);
        let callback: Listener = Arc::new(move |event: &TimelineEvent| {
            if event.execution_id == execution_id {
                inner(event);
            }
        });
        self.registry().wildcard.push(Subscription {
            callback,
            registered: listener,
        });
    }

    /// Remove one registration of `listener` from `kind` (`None` for the wildcard list).
    ///
    /// Returns whether a registration was removed.
    pub fn off(&self, kind: Option<EventKind>, listener: &Listener) -> bool {
        let mut registry = self.registry();
        let slot = registry.slot(kind);
        let Some(position) = slot
            .iter()
            .position(|sub| Arc::ptr_eq(&sub.registered, listener))
        else {
            return false;
        };
        slot.remove(position);
        true
    }

    /// Number of listeners registered for `kind` (`None` for the wildcard list).
    pub fn listener_count(&self, kind: Option<EventKind>) -> usize {
        let registry = self.registry();
        match kind {
            Some(kind) => registry.by_kind.get(&kind).map_or(0, Vec::len),
            None => registry.wildcard.len(),
        }
    }

    /// Drop listeners of `kind`, or every listener when `kind` is `None`.
    pub fn remove_all(&self, kind: Option<EventKind>) {
        let mut registry = self.registry();
        match kind {
            Some(kind) => {
                registry.by_kind.remove(&kind);
            }
            None => {
                registry.by_kind.clear();
                registry.wildcard.clear();
            }
        }
    }

    /// Deliver `event` to its kind's listeners and then to wildcard listeners.
    ///
    /// Returns whether anyone was listening.
    pub fn emit(&self, event: &TimelineEvent) -> bool {
        let callbacks: Vec<Listener> = {
            let registry = self.registry();
            registry
                .by_kind
                .get(&event.event)
                .into_iter()
                .flatten()
                .chain(registry.wildcard.iter())
                .map(|sub| Arc::clone(&sub.callback))
                .collect()
        };

        for callback in &callbacks {
            callback(event);
        }
        !callbacks.is_empty()
    }
}

impl std::fmt::Debug for ExecutionEventBus {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry();
        formatter
            .debug_struct("ExecutionEventBus")
            .field("kinds", &registry.by_kind.len())
            .field("wildcard", &registry.wildcard.len())
            .finish()
    }
}
