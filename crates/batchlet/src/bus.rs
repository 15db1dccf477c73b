//! In-process pub/sub for control events.
//!
//! The worker listens for "cancel" events here rather than exposing a direct
//! method, so alternative bus backends can be dropped in without touching the
//! worker loop.

use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

pub type EventHandler = Box<dyn Fn(Option<String>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Fire-and-forget event posting. Delivery is asynchronous; a post never
/// blocks the caller.
pub trait EventBus: Send + Sync {
    fn post(&self, event_type: &str, payload: Option<String>);
}

struct Event {
    event_type: String,
    payload: Option<String>,
}

/// Single-process event bus backed by an unbounded channel and a consumer
/// task. Handlers must be registered before `start`.
pub struct LocalEventBus {
    tx: mpsc::UnboundedSender<Event>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    handlers: Mutex<HashMap<String, Vec<EventHandler>>>,
}

impl LocalEventBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            handlers: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_handler(&self, event_type: &str, handler: EventHandler) {
        self.handlers
            .lock()
            .expect("handler registry lock poisoned")
            .entry(event_type.to_string())
            .or_default()
            .push(handler);
    }

    /// Move the handlers into a consumer task and start dispatching. Events
    /// posted before this point are queued, not dropped.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let mut rx = self
            .rx
            .lock()
            .expect("event bus lock poisoned")
            .take()
            .expect("event bus already started");
        let handlers = std::mem::take(
            &mut *self.handlers.lock().expect("handler registry lock poisoned"),
        );

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match handlers.get(&event.event_type) {
                    Some(entries) => {
                        for handler in entries {
                            handler(event.payload.clone()).await;
                        }
                    }
                    None => {
                        tracing::debug!(event_type = %event.event_type, "No handler for event");
                    }
                }
            }
        })
    }
}

impl Default for LocalEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for LocalEventBus {
    fn post(&self, event_type: &str, payload: Option<String>) {
        let event = Event {
            event_type: event_type.to_string(),
            payload,
        };
        if self.tx.send(event).is_err() {
            tracing::warn!(event_type, "Event bus consumer is gone, dropping event");
        }
    }
}
