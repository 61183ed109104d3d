// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-session event fan-out.
//!
//! One [`AgentEvent`] stream per session is broadcast to every live
//! subscriber (the JSON-RPC handler, a TUI, a parent agent forwarding a
//! sub-agent's events). Delivery is fire-and-forget: a slow subscriber lags
//! and misses events rather than ever blocking the emitting agent.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;

use crate::events::AgentEvent;

/// Capacity of each session's broadcast channel. A subscriber that falls this
/// far behind the emitter drops the oldest events (`RecvError::Lagged`)
/// rather than ever backing up the agent loop.
const CHANNEL_CAPACITY: usize = 1024;

/// Maximum number of events retained per session in the debug ring buffer.
#[cfg(feature = "debug")]
const RING_BUFFER_LEN: usize = 400;

/// A message delivered on the bus: either a session's own event, or an event
/// forwarded from a descendant sub-agent.
///
/// `lineage` is root-to-immediate-parent order, so an observer at the root
/// bus can identify the originating session without unwrapping one
/// `SubAgent` layer per intermediate generation.
#[derive(Debug, Clone)]
pub enum BusMessage {
    Direct(AgentEvent),
    SubAgent {
        sub_session_id: String,
        parent_call_id: String,
        lineage: Vec<String>,
        inner: Box<AgentEvent>,
    },
}

impl BusMessage {
    pub fn inner_event(&self) -> &AgentEvent {
        match self {
            BusMessage::Direct(e) => e,
            BusMessage::SubAgent { inner, .. } => inner,
        }
    }
}

#[cfg(feature = "debug")]
struct RingBuffer {
    events: std::collections::VecDeque<BusMessage>,
}

#[cfg(feature = "debug")]
impl RingBuffer {
    fn new() -> Self {
        Self { events: std::collections::VecDeque::with_capacity(RING_BUFFER_LEN) }
    }

    fn push(&mut self, msg: BusMessage) {
        if self.events.len() >= RING_BUFFER_LEN {
            self.events.pop_front();
        }
        self.events.push_back(msg);
    }
}

struct SessionChannel {
    tx: broadcast::Sender<BusMessage>,
    #[cfg(feature = "debug")]
    ring: RingBuffer,
}

/// Process-wide registry of per-session broadcast channels.
///
/// Sharded by `session_id`: subscribers of one session never see another
/// session's traffic, and a session with no subscribers costs nothing beyond
/// its `HashMap` entry until `broadcast` creates the channel on first use.
pub struct EventBus {
    sessions: Mutex<HashMap<String, SessionChannel>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self { sessions: Mutex::new(HashMap::new()) }
    }

    /// Subscribe to a session's events, creating its channel if this is the
    /// first subscriber (or the first broadcast, if `subscribe` races
    /// `broadcast`).
    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<BusMessage> {
        let mut sessions = self.sessions.lock().expect("event bus mutex poisoned");
        let channel = sessions.entry(session_id.to_string()).or_insert_with(|| {
            let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
            SessionChannel {
                tx,
                #[cfg(feature = "debug")]
                ring: RingBuffer::new(),
            }
        });
        channel.tx.subscribe()
    }

    /// Drop a session's channel once it has no further subscribers and will
    /// receive no further events (e.g. the session ended). Safe to call even
    /// if subscribers are still attached — they keep their own `Receiver`
    /// handle independent of this registry entry.
    pub fn unsubscribe(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().expect("event bus mutex poisoned");
        sessions.remove(session_id);
    }

    /// Fan out an event to every live subscriber of `session_id`. Never
    /// blocks: `broadcast::Sender::send` only fails when there are zero
    /// receivers, which is the normal "nobody is watching this session"
    /// case and is silently ignored.
    pub fn broadcast(&self, session_id: &str, event: AgentEvent) {
        self.broadcast_message(session_id, BusMessage::Direct(event));
    }

    /// Forward a sub-agent's event to the parent session's bus, wrapped with
    /// lineage so deep sub-agent trees don't require unwrapping one
    /// `SubAgent` layer per generation.
    pub fn broadcast_sub_agent_event(
        &self,
        parent_session_id: &str,
        sub_session_id: &str,
        parent_call_id: &str,
        lineage: Vec<String>,
        inner: AgentEvent,
    ) {
        self.broadcast_message(
            parent_session_id,
            BusMessage::SubAgent {
                sub_session_id: sub_session_id.to_string(),
                parent_call_id: parent_call_id.to_string(),
                lineage,
                inner: Box::new(inner),
            },
        );
    }

    fn broadcast_message(&self, session_id: &str, msg: BusMessage) {
        let mut sessions = self.sessions.lock().expect("event bus mutex poisoned");
        let channel = sessions.entry(session_id.to_string()).or_insert_with(|| {
            let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
            SessionChannel {
                tx,
                #[cfg(feature = "debug")]
                ring: RingBuffer::new(),
            }
        });
        #[cfg(feature = "debug")]
        channel.ring.push(msg.clone());
        // Err(_) means no receivers are currently subscribed; fire-and-forget.
        let _ = channel.tx.send(msg);
    }

    /// Retrieve the last (up to 400) events broadcast for a session,
    /// independent of live subscribers. Only available with the `debug`
    /// feature; does not change the live "no history" delivery contract.
    #[cfg(feature = "debug")]
    pub fn debug_history(&self, session_id: &str) -> Vec<BusMessage> {
        let sessions = self.sessions.lock().expect("event bus mutex poisoned");
        sessions
            .get(session_id)
            .map(|c| c.ring.events.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain an agent's per-turn mailbox and fan each event out on the shared
/// bus for `session_id`, so any number of observers (JSON-RPC handler, TUI,
/// a parent agent's sub-agent forwarding) can subscribe to one agent's
/// output without each holding their own `Agent::submit` sender.
///
/// `Agent::submit` keeps its existing single-consumer `mpsc` contract; this
/// is the bridge a host builds on top when it wants more than one consumer.
pub async fn relay_to_bus(
    session_id: String,
    bus: std::sync::Arc<EventBus>,
    mut rx: tokio::sync::mpsc::Receiver<AgentEvent>,
) {
    while let Some(event) = rx.recv().await {
        bus.broadcast(&session_id, event);
    }
}
