// Connection registry: maps live connections to participant identity.

use std::collections::{HashMap, HashSet};

use crate::protocol::{ConnectionSummary, Role};

/// Identity attached to one live WebSocket connection.
///
/// The connection id is a routing address only; the auction engine keys its
/// own state by participant id.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub name: String,
    pub role: Role,
    pub participant_id: Option<String>,
    /// True once the participant id has been validated against persistence.
    /// Non-participant roles skip validation and register unverified.
    pub verified: bool,
}

/// Registry of live connections. At most one connection per participant:
/// registering a participant evicts any previous connection for the same id.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<u64, ConnectionInfo>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        ConnectionRegistry {
            connections: HashMap::new(),
        }
    }

    /// Register a verified participant connection. Returns the previous
    /// connection id for the same participant, if any; the caller must
    /// disconnect it (disconnect-and-replace).
    pub fn register_participant(
        &mut self,
        conn_id: u64,
        name: &str,
        participant_id: &str,
    ) -> Option<u64> {
        let evicted = self.connection_for_participant(participant_id);
        if let Some(old) = evicted {
            self.connections.remove(&old);
        }
        self.connections.insert(
            conn_id,
            ConnectionInfo {
                name: name.to_string(),
                role: Role::Participant,
                participant_id: Some(participant_id.to_string()),
                verified: true,
            },
        );
        evicted.filter(|old| *old != conn_id)
    }

    /// Register an operator or observer connection (no persistence check).
    pub fn register_other(&mut self, conn_id: u64, name: &str, role: Role) {
        self.connections.insert(
            conn_id,
            ConnectionInfo {
                name: name.to_string(),
                role,
                participant_id: None,
                verified: false,
            },
        );
    }

    /// Remove a connection on disconnect. Returns its info if it was known.
    pub fn unregister(&mut self, conn_id: u64) -> Option<ConnectionInfo> {
        self.connections.remove(&conn_id)
    }

    pub fn get(&self, conn_id: u64) -> Option<&ConnectionInfo> {
        self.connections.get(&conn_id)
    }

    /// Participant id for a connection, only if it registered as a verified
    /// participant.
    pub fn verified_participant(&self, conn_id: u64) -> Option<&str> {
        self.connections.get(&conn_id).and_then(|info| {
            if info.role == Role::Participant && info.verified {
                info.participant_id.as_deref()
            } else {
                None
            }
        })
    }

    /// The live connection for a participant, if one exists.
    pub fn connection_for_participant(&self, participant_id: &str) -> Option<u64> {
        self.connections
            .iter()
            .find(|(_, info)| info.participant_id.as_deref() == Some(participant_id))
            .map(|(id, _)| *id)
    }

    /// Connections eligible for a new sub-auction prompt: every operator and
    /// observer, plus only the participants still pending in the round.
    /// Participants who already won must not be prompted to bid again.
    pub fn eligible_connections(&self, pending: &HashSet<String>) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .connections
            .iter()
            .filter(|(_, info)| match info.role {
                Role::Participant => info
                    .participant_id
                    .as_deref()
                    .is_some_and(|pid| pending.contains(pid)),
                Role::Operator | Role::Observer => true,
            })
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Snapshot of all live connections for the connection-list broadcast,
    /// sorted by name for stable payloads.
    pub fn summaries(&self) -> Vec<ConnectionSummary> {
        let mut list: Vec<ConnectionSummary> = self
            .connections
            .values()
            .map(|info| ConnectionSummary {
                name: info.name.clone(),
                role: info.role,
                participant_id: info.participant_id.clone(),
            })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup_participant() {
        let mut registry = ConnectionRegistry::new();
        let evicted = registry.register_participant(1, "Alice", "alice");
        assert_eq!(evicted, None);

        assert_eq!(registry.verified_participant(1), Some("alice"));
        assert_eq!(registry.connection_for_participant("alice"), Some(1));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn second_connection_evicts_first() {
        let mut registry = ConnectionRegistry::new();
        registry.register_participant(1, "Alice", "alice");
        let evicted = registry.register_participant(2, "Alice", "alice");

        assert_eq!(evicted, Some(1));
        assert!(registry.get(1).is_none());
        assert_eq!(registry.connection_for_participant("alice"), Some(2));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn re_register_same_connection_does_not_self_evict() {
        let mut registry = ConnectionRegistry::new();
        registry.register_participant(1, "Alice", "alice");
        let evicted = registry.register_participant(1, "Alice", "alice");
        assert_eq!(evicted, None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn operator_is_not_a_verified_participant() {
        let mut registry = ConnectionRegistry::new();
        registry.register_other(5, "Master", Role::Operator);

        assert_eq!(registry.verified_participant(5), None);
        assert_eq!(registry.get(5).unwrap().role, Role::Operator);
    }

    #[test]
    fn unregister_removes_connection() {
        let mut registry = ConnectionRegistry::new();
        registry.register_participant(1, "Alice", "alice");

        let info = registry.unregister(1).unwrap();
        assert_eq!(info.participant_id.as_deref(), Some("alice"));
        assert!(registry.is_empty());
        assert!(registry.unregister(1).is_none());
    }

    #[test]
    fn eligible_connections_exclude_non_pending_participants() {
        let mut registry = ConnectionRegistry::new();
        registry.register_participant(1, "Alice", "alice");
        registry.register_participant(2, "Bob", "bob");
        registry.register_other(3, "Master", Role::Operator);
        registry.register_other(4, "Guest", Role::Observer);

        let pending: HashSet<String> = ["alice".to_string()].into_iter().collect();
        let eligible = registry.eligible_connections(&pending);

        // Bob already won, so his connection is excluded.
        assert_eq!(eligible, vec![1, 3, 4]);
    }

    #[test]
    fn summaries_sorted_by_name() {
        let mut registry = ConnectionRegistry::new();
        registry.register_participant(1, "Zoe", "zoe");
        registry.register_other(2, "Master", Role::Operator);
        registry.register_participant(3, "Alice", "alice");

        let summaries = registry.summaries();
        let names: Vec<&str> = summaries.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Alice", "Master", "Zoe"]);
    }
}
