// Best-effort event fan-out to connected clients.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::ServerEvent;

/// An event with its routing decision, produced by the auction engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    /// To every live connection.
    Broadcast(ServerEvent),
    /// To one connection.
    To(u64, ServerEvent),
    /// To an explicit set of connections.
    Multi(Vec<u64>, ServerEvent),
}

/// Fan-out of server events over per-connection channels.
///
/// Delivery is best-effort by contract: a full or closed channel is logged
/// and skipped, never surfaced to the auction engine and never allowed to
/// block round progression.
#[derive(Debug, Default)]
pub struct Dispatcher {
    senders: HashMap<u64, mpsc::Sender<String>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher {
            senders: HashMap::new(),
        }
    }

    /// Attach the write half of a new connection.
    pub fn attach(&mut self, conn_id: u64, sender: mpsc::Sender<String>) {
        self.senders.insert(conn_id, sender);
    }

    /// Detach a connection. Dropping the sender closes the write task.
    pub fn detach(&mut self, conn_id: u64) {
        self.senders.remove(&conn_id);
    }

    /// Route one outgoing event.
    pub fn dispatch(&self, outgoing: &Outgoing) {
        match outgoing {
            Outgoing::Broadcast(event) => {
                let payload = event.to_json();
                for (conn_id, sender) in &self.senders {
                    self.deliver(*conn_id, sender, &payload);
                }
            }
            Outgoing::To(conn_id, event) => {
                if let Some(sender) = self.senders.get(conn_id) {
                    self.deliver(*conn_id, sender, &event.to_json());
                } else {
                    debug!("dropping event for unknown connection {conn_id}");
                }
            }
            Outgoing::Multi(conn_ids, event) => {
                let payload = event.to_json();
                for conn_id in conn_ids {
                    if let Some(sender) = self.senders.get(conn_id) {
                        self.deliver(*conn_id, sender, &payload);
                    }
                }
            }
        }
    }

    /// Route a batch of outgoing events in order.
    pub fn dispatch_all(&self, outgoing: &[Outgoing]) {
        for event in outgoing {
            self.dispatch(event);
        }
    }

    fn deliver(&self, conn_id: u64, sender: &mpsc::Sender<String>, payload: &str) {
        if let Err(e) = sender.try_send(payload.to_string()) {
            warn!("failed to deliver event to connection {conn_id}: {e}");
        }
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}
