/// Lifecycle/scaling/task/queue event types.
///
/// The pool facade, scheduler, connection pool, and session manager all
/// emit `(category, message)` pairs to an optional user-supplied handler.
/// This module defines the category enum and the handler trait they're
/// delivered through; it does not itself decide who emits what, or when.
use std::fmt;
use std::sync::Arc;

/// The category an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    Lifecycle,
    Scaling,
    TaskSubmitted,
    TaskCancelled,
    Cleanup,
    Scheduler,
    Queue,
    Repair,
    Error,
    Warning,
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            EventCategory::Lifecycle => "lifecycle",
            EventCategory::Scaling => "scaling",
            EventCategory::TaskSubmitted => "task_submitted",
            EventCategory::TaskCancelled => "task_cancelled",
            EventCategory::Cleanup => "cleanup",
            EventCategory::Scheduler => "scheduler",
            EventCategory::Queue => "queue",
            EventCategory::Repair => "repair",
            EventCategory::Error => "error",
            EventCategory::Warning => "warning",
        };
        write!(f, "{tag}")
    }
}

/// A single emitted event.
#[derive(Debug, Clone)]
pub struct RuntimeEvent {
    pub category: EventCategory,
    pub message: String,
}

impl RuntimeEvent {
    pub fn new(category: EventCategory, message: impl Into<String>) -> Self {
        RuntimeEvent {
            category,
            message: message.into(),
        }
    }
}

/// A user-supplied sink for runtime events.
///
/// `Send + Sync` so it can be shared (`Arc<dyn EventHandler>`) across the
/// monitor thread, scaling thread, and individual workers.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: RuntimeEvent);
}

/// An `EventHandler` built from a plain closure, for callers who don't
/// want to define a type just to observe events.
pub struct ClosureEventHandler<F>
where
    F: Fn(RuntimeEvent) + Send + Sync,
{
    handler: F,
}

impl<F> ClosureEventHandler<F>
where
    F: Fn(RuntimeEvent) + Send + Sync,
{
    pub fn new(handler: F) -> Self {
        ClosureEventHandler { handler }
    }
}

impl<F> EventHandler for ClosureEventHandler<F>
where
    F: Fn(RuntimeEvent) + Send + Sync,
{
    fn on_event(&self, event: RuntimeEvent) {
        (self.handler)(event);
    }
}

/// Emits an event to an optional handler, doing nothing if absent.
///
/// Shared helper used by every component that emits events so the
/// "handler is optional" check isn't duplicated at every call site.
pub fn emit(handler: &Option<Arc<dyn EventHandler>>, category: EventCategory, message: impl Into<String>) {
    if let Some(handler) = handler {
        handler.on_event(RuntimeEvent::new(category, message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_category_display() {
        assert_eq!(EventCategory::Lifecycle.to_string(), "lifecycle");
        assert_eq!(EventCategory::TaskSubmitted.to_string(), "task_submitted");
    }

    #[test]
    fn test_closure_handler_receives_events() {
        let received: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();
        let handler: Arc<dyn EventHandler> = Arc::new(ClosureEventHandler::new(move |event| {
            received_clone.lock().unwrap().push(event.message);
        }));

        let maybe_handler = Some(handler);
        emit(&maybe_handler, EventCategory::Scaling, "scaled up to 4");
        emit(&maybe_handler, EventCategory::Scaling, "scaled up to 8");

        let messages = received.lock().unwrap();
        assert_eq!(messages.as_slice(), ["scaled up to 4", "scaled up to 8"]);
    }

    #[test]
    fn test_emit_without_handler_is_noop() {
        let maybe_handler: Option<Arc<dyn EventHandler>> = None;
        emit(&maybe_handler, EventCategory::Error, "should be dropped silently");
    }
}
