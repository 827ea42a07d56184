use std::cell::RefCell;
use std::rc::Rc;

use event_emitter_rs::EventEmitter;
use serde_json::json;

use super::{HookDispatcher, LifecycleEvent, LifecycleEventArgs};

/// Forwards lifecycle events to an [`EventEmitter`] as JSON payloads.
///
/// The event name is [`LifecycleEvent::name`]; the payload carries the
/// document's identifier and class when the event concerns one document.
///
/// # Example
///
/// ```ignore
/// let emitter = Rc::new(RefCell::new(EventEmitter::new()));
/// emitter.borrow_mut().on("postPersist", |payload: String| println!("{payload}"));
///
/// EmitterBridge::new(emitter).attach(&hooks, &[LifecycleEvent::PostPersist]);
/// ```
pub struct EmitterBridge {
    emitter: Rc<RefCell<EventEmitter>>,
}

impl EmitterBridge {
    pub fn new(emitter: Rc<RefCell<EventEmitter>>) -> Self {
        Self { emitter }
    }

    /// Forward every lifecycle event.
    pub fn attach_all(&self, hooks: &HookDispatcher) {
        self.attach(hooks, &LifecycleEvent::ALL);
    }

    pub fn attach(&self, hooks: &HookDispatcher, events: &[LifecycleEvent]) {
        for &event in events {
            let emitter = Rc::clone(&self.emitter);
            hooks.on(event, move |args| {
                let payload = payload(args);
                emitter.borrow_mut().emit(event.name(), payload);
            });
        }
    }
}

fn payload(args: &LifecycleEventArgs<'_>) -> String {
    let (id, class) = match args.handle {
        Some(handle) => (
            args.session.identifier(handle),
            args.session.class_name(handle),
        ),
        None => (None, None),
    };
    json!({
        "event": args.event.name(),
        "id": id,
        "class": class,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use crate::metadata::MetadataRegistry;
    use crate::store::InMemoryDocumentStore;
    use crate::unit_of_work::UnitOfWork;

    #[test]
    fn flush_events_reach_the_emitter() {
        let emitter = Rc::new(RefCell::new(EventEmitter::new()));
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&seen);
        emitter.borrow_mut().on("preFlush", move |payload: String| {
            if let Ok(mut seen) = sink.lock() {
                seen.push(payload);
            }
        });

        let hooks = HookDispatcher::new();
        EmitterBridge::new(Rc::clone(&emitter)).attach(&hooks, &[LifecycleEvent::PreFlush]);

        let mut uow = UnitOfWork::new(
            Arc::new(MetadataRegistry::new()),
            Arc::new(InMemoryDocumentStore::new()),
        )
        .with_hooks(hooks);
        uow.flush().unwrap();

        // EventEmitter delivers on its own threads
        thread::sleep(Duration::from_millis(50));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains("\"event\":\"preFlush\""));
    }
}
