//! Hooks - Lifecycle listeners and conflict resolvers.
//!
//! Listeners observe the unit of work. They receive the affected document
//! (lent out of the unit of work for the duration of the call) and a shared
//! reference to the session. Conflict resolvers are the only hooks whose
//! answer changes the outcome: a resolved conflict is dropped from the
//! error returned by `flush`.
//!
//! ## Example
//!
//! ```ignore
//! let hooks = HookDispatcher::new();
//! hooks.on(LifecycleEvent::PrePersist, |args| {
//!     if let Some(user) = args.document_mut::<User>() {
//!         user.created = Some(now());
//!     }
//! });
//! let uow = UnitOfWork::new(metadata, store).with_hooks(hooks);
//! ```

#[cfg(feature = "emitter")]
mod emitter;

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::unit_of_work::{DocHandle, UnitOfWork};

#[cfg(feature = "emitter")]
pub use emitter::EmitterBridge;

/// Events fired by the unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    PrePersist,
    PostPersist,
    PreUpdate,
    PostUpdate,
    PreRemove,
    PostRemove,
    PostLoad,
    PreFlush,
    OnFlush,
    PostFlush,
    OnConflict,
}

impl LifecycleEvent {
    pub const ALL: [LifecycleEvent; 11] = [
        LifecycleEvent::PrePersist,
        LifecycleEvent::PostPersist,
        LifecycleEvent::PreUpdate,
        LifecycleEvent::PostUpdate,
        LifecycleEvent::PreRemove,
        LifecycleEvent::PostRemove,
        LifecycleEvent::PostLoad,
        LifecycleEvent::PreFlush,
        LifecycleEvent::OnFlush,
        LifecycleEvent::PostFlush,
        LifecycleEvent::OnConflict,
    ];

    pub fn name(self) -> &'static str {
        match self {
            LifecycleEvent::PrePersist => "prePersist",
            LifecycleEvent::PostPersist => "postPersist",
            LifecycleEvent::PreUpdate => "preUpdate",
            LifecycleEvent::PostUpdate => "postUpdate",
            LifecycleEvent::PreRemove => "preRemove",
            LifecycleEvent::PostRemove => "postRemove",
            LifecycleEvent::PostLoad => "postLoad",
            LifecycleEvent::PreFlush => "preFlush",
            LifecycleEvent::OnFlush => "onFlush",
            LifecycleEvent::PostFlush => "postFlush",
            LifecycleEvent::OnConflict => "onConflict",
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a lifecycle listener sees.
pub struct LifecycleEventArgs<'a> {
    pub event: LifecycleEvent,
    /// The affected document. `None` for flush-level events.
    pub handle: Option<DocHandle>,
    pub document: Option<&'a mut dyn Any>,
    pub session: &'a UnitOfWork,
}

impl LifecycleEventArgs<'_> {
    pub fn document<T: Any>(&self) -> Option<&T> {
        self.document.as_deref().and_then(|doc| doc.downcast_ref())
    }

    pub fn document_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.document.as_deref_mut().and_then(|doc| doc.downcast_mut())
    }
}

/// What a conflict resolver sees.
pub struct ConflictEventArgs<'a> {
    pub id: &'a str,
    /// The local document, when one is tracked for `id`.
    pub handle: Option<DocHandle>,
    /// Store error code for a rejected write, e.g. `"conflict"`.
    pub error: Option<&'a str>,
    /// Conflicting revisions reported on read.
    pub revisions: &'a [String],
    pub session: &'a UnitOfWork,
}

/// Answer of a conflict resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// The stored document wins. A rejected write is dropped and the
    /// document is reloaded from the store; the conflict is not reported.
    Resolved,
    Unresolved,
}

type Listener = Rc<dyn Fn(&mut LifecycleEventArgs<'_>)>;
type Resolver = Rc<dyn Fn(&ConflictEventArgs<'_>) -> ConflictResolution>;

/// Registry of lifecycle listeners. Clones share the same registry.
#[derive(Clone, Default)]
pub struct HookDispatcher {
    listeners: Rc<RefCell<HashMap<LifecycleEvent, Vec<Listener>>>>,
    resolvers: Rc<RefCell<Vec<Resolver>>>,
}

impl HookDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, event: LifecycleEvent, listener: F)
    where
        F: Fn(&mut LifecycleEventArgs<'_>) + 'static,
    {
        self.listeners
            .borrow_mut()
            .entry(event)
            .or_default()
            .push(Rc::new(listener));
    }

    /// Register a resolver consulted for every conflict, in registration order.
    pub fn on_conflict<F>(&self, resolver: F)
    where
        F: Fn(&ConflictEventArgs<'_>) -> ConflictResolution + 'static,
    {
        self.resolvers.borrow_mut().push(Rc::new(resolver));
    }

    pub fn has_listeners(&self, event: LifecycleEvent) -> bool {
        self.listeners
            .borrow()
            .get(&event)
            .is_some_and(|listeners| !listeners.is_empty())
    }

    /// Call every listener of `args.event`. Listeners may register further
    /// listeners; those only see later events.
    pub fn dispatch(&self, args: &mut LifecycleEventArgs<'_>) {
        let listeners = match self.listeners.borrow().get(&args.event) {
            Some(listeners) => listeners.clone(),
            None => return,
        };
        for listener in listeners {
            listener(args);
        }
    }

    /// Ask the resolvers about a conflict. The first resolver that resolves it wins.
    pub fn resolve_conflict(&self, args: &ConflictEventArgs<'_>) -> ConflictResolution {
        let resolvers = self.resolvers.borrow().clone();
        for resolver in resolvers {
            if resolver(args) == ConflictResolution::Resolved {
                return ConflictResolution::Resolved;
            }
        }
        ConflictResolution::Unresolved
    }
}

impl fmt::Debug for HookDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.borrow();
        f.debug_struct("HookDispatcher")
            .field(
                "listeners",
                &listeners
                    .iter()
                    .map(|(event, list)| (event.name(), list.len()))
                    .collect::<HashMap<_, _>>(),
            )
            .field("resolvers", &self.resolvers.borrow().len())
            .finish()
    }
}
