//! Ordered delivery of engine notifications.
//!
//! All events go through one queue and are delivered on a single dispatch thread, in publish
//! order. Handlers therefore never run on the controller's driver thread and cannot re-enter
//! it synchronously. Each subscription names the scopes it may observe.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use serde::Serialize;

use crate::event_log::{self, DebugRecord};
use crate::interactions::RequestId;
use crate::worker_process::SessionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventScope {
    /// Request lifecycle: started, completed, replay.
    Interactions,
    /// Worker lifecycle: state changes, resets, crashes, startup failures.
    Session,
    History,
    Console,
    Warnings,
}

impl EventScope {
    pub const ALL: [EventScope; 5] = [
        EventScope::Interactions,
        EventScope::Session,
        EventScope::History,
        EventScope::Console,
        EventScope::Warnings,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CompletionStatus {
    Value,
    Error(String),
    Interrupted,
    Cancelled,
    Crashed(String),
    StartupFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    InteractionStarted {
        request: RequestId,
        text: String,
    },
    InteractionCompleted {
        request: RequestId,
        status: CompletionStatus,
    },
    ReplayAborted {
        executed: usize,
        remaining: usize,
    },
    SessionStateChanged {
        state: SessionState,
    },
    InterpreterReset {
        working_dir: PathBuf,
        generation: u64,
    },
    WorkerStartupFailed {
        reason: String,
    },
    WorkerCrashed {
        generation: u64,
        reason: String,
    },
    HistoryAppended {
        text: String,
        edited: bool,
    },
    HistoryCleared,
    ConsoleReset,
    Warning {
        message: String,
    },
}

impl EngineEvent {
    pub fn scope(&self) -> EventScope {
        match self {
            EngineEvent::InteractionStarted { .. }
            | EngineEvent::InteractionCompleted { .. }
            | EngineEvent::ReplayAborted { .. } => EventScope::Interactions,
            EngineEvent::SessionStateChanged { .. }
            | EngineEvent::InterpreterReset { .. }
            | EngineEvent::WorkerStartupFailed { .. }
            | EngineEvent::WorkerCrashed { .. } => EventScope::Session,
            EngineEvent::HistoryAppended { .. } | EngineEvent::HistoryCleared => {
                EventScope::History
            }
            EngineEvent::ConsoleReset => EventScope::Console,
            EngineEvent::Warning { .. } => EventScope::Warnings,
        }
    }
}

pub trait EventHandler: Send + 'static {
    fn handle(&mut self, event: &EngineEvent);
}

impl<F> EventHandler for F
where
    F: FnMut(&EngineEvent) + Send + 'static,
{
    fn handle(&mut self, event: &EngineEvent) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    scopes: Vec<EventScope>,
    handler: Box<dyn EventHandler>,
}

enum DispatchCommand {
    Publish(EngineEvent),
    Subscribe(SubscriptionId, Subscription),
    Unsubscribe(SubscriptionId),
    Flush(mpsc::Sender<()>),
}

/// Cheap to clone; the dispatch thread exits once every clone is dropped.
#[derive(Clone)]
pub struct EventDispatcher {
    tx: mpsc::Sender<DispatchCommand>,
    next_id: Arc<AtomicU64>,
}

impl EventDispatcher {
    pub fn new() -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("engine-events".to_string())
            .spawn(move || dispatch_loop(rx))?;
        Ok(Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn publish(&self, event: EngineEvent) {
        if event_log::enabled() {
            event_log::record(DebugRecord::Engine {
                detail: event.clone(),
            });
        }
        let _ = self.tx.send(DispatchCommand::Publish(event));
    }

    pub fn subscribe(
        &self,
        scopes: &[EventScope],
        handler: impl EventHandler,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let subscription = Subscription {
            scopes: scopes.to_vec(),
            handler: Box::new(handler),
        };
        let _ = self.tx.send(DispatchCommand::Subscribe(id, subscription));
        id
    }

    /// Forwards matching events into an unbounded tokio channel.
    pub fn subscribe_channel(
        &self,
        scopes: &[EventScope],
    ) -> (
        SubscriptionId,
        tokio::sync::mpsc::UnboundedReceiver<EngineEvent>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let id = self.subscribe(scopes, move |event: &EngineEvent| {
            let _ = tx.send(event.clone());
        });
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let _ = self.tx.send(DispatchCommand::Unsubscribe(id));
    }

    /// Blocks until every event published before this call has been delivered.
    pub fn flush(&self, timeout: Duration) -> bool {
        let (done_tx, done_rx) = mpsc::channel();
        if self.tx.send(DispatchCommand::Flush(done_tx)).is_err() {
            return false;
        }
        done_rx.recv_timeout(timeout).is_ok()
    }
}

fn dispatch_loop(rx: mpsc::Receiver<DispatchCommand>) {
    // Insertion order keeps delivery order stable across handlers.
    let mut order: Vec<SubscriptionId> = Vec::new();
    let mut subscriptions: HashMap<SubscriptionId, Subscription> = HashMap::new();
    for command in rx {
        match command {
            DispatchCommand::Publish(event) => {
                let scope = event.scope();
                for id in &order {
                    if let Some(subscription) = subscriptions.get_mut(id)
                        && subscription.scopes.contains(&scope)
                    {
                        subscription.handler.handle(&event);
                    }
                }
            }
            DispatchCommand::Subscribe(id, subscription) => {
                order.push(id);
                subscriptions.insert(id, subscription);
            }
            DispatchCommand::Unsubscribe(id) => {
                order.retain(|existing| *existing != id);
                subscriptions.remove(&id);
            }
            DispatchCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn warning(message: &str) -> EngineEvent {
        EngineEvent::Warning {
            message: message.to_string(),
        }
    }

    #[test]
    fn handlers_see_only_their_scopes_in_order() {
        let dispatcher = EventDispatcher::new().expect("dispatcher");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        dispatcher.subscribe(&[EventScope::Warnings], move |event: &EngineEvent| {
            sink.lock().unwrap().push(event.clone());
        });

        dispatcher.publish(warning("one"));
        dispatcher.publish(EngineEvent::HistoryCleared);
        dispatcher.publish(warning("two"));
        assert!(dispatcher.flush(Duration::from_secs(5)));

        assert_eq!(*seen.lock().unwrap(), vec![warning("one"), warning("two")]);
    }

    #[test]
    fn unsubscribed_handlers_stop_receiving() {
        let dispatcher = EventDispatcher::new().expect("dispatcher");
        let (id, mut rx) = dispatcher.subscribe_channel(&EventScope::ALL);
        dispatcher.publish(EngineEvent::ConsoleReset);
        dispatcher.unsubscribe(id);
        dispatcher.publish(EngineEvent::HistoryCleared);
        assert!(dispatcher.flush(Duration::from_secs(5)));

        assert_eq!(rx.try_recv().ok(), Some(EngineEvent::ConsoleReset));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_string(&EngineEvent::SessionStateChanged {
            state: SessionState::Resetting,
        })
        .expect("serialize");
        assert_eq!(json, r#"{"type":"session_state_changed","state":"resetting"}"#);
    }
}
