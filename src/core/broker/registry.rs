// src/core/broker/registry.rs

//! Per-kind handler lists with fault isolation.

use crate::core::events::{BrokerEvent, EventKind};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::{error, warn};

/// A subscriber callback. Handlers receive the event by reference and must not block.
pub type EventHandler = Arc<dyn Fn(&BrokerEvent) + Send + Sync + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Runs inside `emit`, in registration order.
    Inline,
    /// Runs on a separate task after `emit` returns.
    Deferred,
}

#[derive(Clone)]
struct Subscriber {
    delivery: Delivery,
    handler: EventHandler,
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<EventKind, Vec<Subscriber>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn register(&self, kind: EventKind, delivery: Delivery, handler: EventHandler) {
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push(Subscriber { delivery, handler });
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }

    /// Delivers `event` to every subscriber of its kind.
    ///
    /// The subscriber list is copied out before any handler runs, so handlers may
    /// register new handlers or emit further events. A panicking inline handler is
    /// logged and skipped. Returns the number of inline handlers that completed.
    pub fn dispatch(&self, event: &BrokerEvent) -> usize {
        let kind = event.kind();
        let subscribers = match self.handlers.read().get(&kind) {
            Some(list) => list.clone(),
            None => return 0,
        };

        let mut completed = 0;
        for subscriber in subscribers {
            match subscriber.delivery {
                Delivery::Inline => {
                    let handler = &subscriber.handler;
                    match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                        Ok(()) => completed += 1,
                        Err(panic) => {
                            error!(
                                "Handler for '{}' panicked: {}. Continuing with remaining handlers.",
                                kind,
                                panic_message(panic.as_ref())
                            );
                        }
                    }
                }
                Delivery::Deferred => defer(kind, subscriber.handler, event.clone()),
            }
        }
        completed
    }
}

fn defer(kind: EventKind, handler: EventHandler, event: BrokerEvent) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            // A panic inside the spawned task is contained by the runtime.
            runtime.spawn(async move {
                handler(&event);
            });
        }
        Err(_) => {
            warn!("No async runtime available; dropping deferred '{kind}' delivery.");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
