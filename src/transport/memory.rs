// In-process event channel
// Loops events through the same decode path as the socket transport without
// a server. Inbound events are pushed by hand, emitted events are recorded.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{debug, warn};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::{EventChannel, InboundEvent, OutboundEvent, Subscribers, Subscription};

#[derive(Clone)]
pub struct MemoryChannel {
    subscribers: Subscribers,
    emitted: Arc<Mutex<Vec<OutboundEvent>>>,
    connected: Arc<AtomicBool>,
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChannel {
    pub fn new() -> Self {
        MemoryChannel {
            subscribers: Subscribers::new(),
            emitted: Arc::new(Mutex::new(Vec::new())),
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Deliver an already decoded event to every subscriber.
    pub fn push(&self, event: InboundEvent) {
        self.subscribers.broadcast(&event);
    }

    /// Deliver a named event with a raw JSON payload, exactly as the socket
    /// reader would. Malformed payloads are logged and dropped.
    pub fn push_wire(&self, name: &str, data: Value) {
        match InboundEvent::from_wire(name, data) {
            Ok(Some(event)) => self.push(event),
            Ok(None) => debug!("Ignoring unhandled event '{}'", name),
            Err(e) => warn!("Discarding malformed event: {}", e),
        }
    }

    pub fn emitted(&self) -> Vec<OutboundEvent> {
        self.emitted.lock().map(|list| list.clone()).unwrap_or_default()
    }

    pub fn take_emitted(&self) -> Vec<OutboundEvent> {
        self.emitted
            .lock()
            .map(|mut list| std::mem::take(&mut *list))
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventChannel for MemoryChannel {
    fn emit(&self, event: OutboundEvent) -> Result<()> {
        if !self.is_connected() {
            return Err(anyhow!("event channel is disconnected"));
        }
        self.emitted
            .lock()
            .map_err(|_| anyhow!("emitted event log poisoned"))?
            .push(event);
        Ok(())
    }

    fn subscribe(&self) -> Subscription {
        self.subscribers.subscribe()
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.subscribers.close_all();
        Ok(())
    }
}
