//! The pub/sub transport boundary (spec.md §4.F). The wire format itself is
//! explicitly out of scope; this module ships only the contract the core
//! depends on plus an in-memory loopback implementation used by tests and
//! as a runnable demo — a real deployment supplies its own [`BusAdapter`]
//! over whatever transport its broadcaster speaks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::events::CommandState;
use crate::messages::{DispatcherHandle, DispatcherMsg};

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus is not connected")]
    NotConnected,
    #[error("no subscription registered for target {0}")]
    NoSubscription(String),
}

/// Operations the dispatcher and the connection manager assume the
/// underlying transport exposes. Delivery is at-least-once fan-out to all
/// current subscribers of a target; per-subscription FIFO, no ordering
/// across subscriptions (spec.md §4.F).
#[async_trait]
pub trait BusAdapter: Send + Sync {
    async fn connect(&self) -> Result<(), BusError>;

    /// Registers `handle` to receive `DispatcherMsg::Bus` for every
    /// subsequent message delivered on `target`.
    async fn subscribe(&self, target: &str, handle: DispatcherHandle) -> Result<(), BusError>;

    async fn unsubscribe(&self, target: &str) -> Result<(), BusError>;

    async fn publish_command_outcome(
        &self,
        target: &str,
        command: &str,
        state: CommandState,
        message: &str,
        tracking_id: Option<&str>,
    ) -> Result<(), BusError>;

    /// Sends a direct `vote` event, used only for vote propagation.
    async fn send_direct_event(
        &self,
        target: &str,
        tracking_id: &str,
        vote_value: &str,
    ) -> Result<(), BusError>;

    async fn close(&self) -> Result<(), BusError>;

    fn is_connected(&self) -> bool;
}

/// What a [`ChannelBus`] publishes, captured for test assertions instead of
/// going out over a real wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    CommandOutcome {
        target: String,
        command: String,
        state: String,
        message: String,
        tracking_id: Option<String>,
    },
    Vote {
        target: String,
        tracking_id: String,
        vote_value: String,
    },
}

/// In-memory loopback bus built on `tokio::sync::mpsc`. `deliver` simulates
/// an inbound message from a peer or the broadcaster; published events are
/// captured on an outbound channel for inspection.
pub struct ChannelBus {
    connected: AtomicBool,
    subscriptions: Mutex<HashMap<String, DispatcherHandle>>,
    outbound: UnboundedSender<OutboundEvent>,
}

impl ChannelBus {
    pub fn new() -> (Self, UnboundedReceiver<OutboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                connected: AtomicBool::new(false),
                subscriptions: Mutex::new(HashMap::new()),
                outbound: tx,
            },
            rx,
        )
    }

    /// Simulates an inbound delivery on `target`. No-op (logged by the
    /// caller, if they care) when nobody is subscribed.
    pub fn deliver(&self, target: &str, raw: Value) -> bool {
        let subs = self.subscriptions.lock().unwrap();
        match subs.get(target) {
            Some(handle) => handle
                .send(DispatcherMsg::Bus {
                    target: target.to_string(),
                    raw,
                })
                .is_ok(),
            None => false,
        }
    }

    /// Test/demo hook: force the connection down, as a watchdog would
    /// observe after `on_connection_lost` fires.
    pub fn simulate_disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl BusAdapter for ChannelBus {
    async fn connect(&self) -> Result<(), BusError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, target: &str, handle: DispatcherHandle) -> Result<(), BusError> {
        self.subscriptions
            .lock()
            .unwrap()
            .insert(target.to_string(), handle);
        Ok(())
    }

    async fn unsubscribe(&self, target: &str) -> Result<(), BusError> {
        self.subscriptions.lock().unwrap().remove(target);
        Ok(())
    }

    async fn publish_command_outcome(
        &self,
        target: &str,
        command: &str,
        state: CommandState,
        message: &str,
        tracking_id: Option<&str>,
    ) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        let _ = self.outbound.send(OutboundEvent::CommandOutcome {
            target: target.to_string(),
            command: command.to_string(),
            state: state.to_string(),
            message: message.to_string(),
            tracking_id: tracking_id.map(str::to_string),
        });
        Ok(())
    }

    async fn send_direct_event(
        &self,
        target: &str,
        tracking_id: &str,
        vote_value: &str,
    ) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        let _ = self.outbound.send(OutboundEvent::Vote {
            target: target.to_string(),
            tracking_id: tracking_id.to_string(),
            vote_value: vote_value.to_string(),
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[tokio::test]
    async fn publish_before_connect_errors() {
        let (bus, _rx) = ChannelBus::new();
        let err = bus
            .publish_command_outcome("dev01", "yadtshell", CommandState::Started, "", None)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NotConnected));
    }

    #[tokio::test]
    async fn deliver_routes_to_subscriber() {
        let (bus, _rx) = ChannelBus::new();
        bus.connect().await.unwrap();
        let (tx, mut rx) = unbounded_channel();
        bus.subscribe("dev01", tx).await.unwrap();

        assert!(bus.deliver("dev01", serde_json::json!({"id": "full-update"})));

        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg, DispatcherMsg::Bus { target, .. } if target == "dev01"));
    }

    #[tokio::test]
    async fn deliver_without_subscriber_is_noop() {
        let (bus, _rx) = ChannelBus::new();
        bus.connect().await.unwrap();
        assert!(!bus.deliver("dev01", serde_json::json!({"id": "full-update"})));
    }
}
