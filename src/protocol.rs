// Wire protocol: JSON messages exchanged with browser clients.

use serde::{Deserialize, Serialize};

use crate::auction::session::{Phase, Position};
use crate::db::{AuctionWin, RosterEntry, Slot, StandingsRow, Team};

/// Role a connection registers as. Only participants may bid; only the
/// operator may drive rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Participant,
    Operator,
    Observer,
}

/// How much to tear down on an admin reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetLevel {
    /// Abandon the in-memory round; no database rows are touched.
    Round,
    /// Clear auction records, restore balances, zero scores.
    Auctions,
    /// Additionally clear teams, participants, and slots.
    Full,
}

/// Messages sent by clients to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Register {
        name: String,
        role: Role,
        #[serde(default)]
        participant_id: Option<String>,
    },
    PlaceBid {
        round: String,
        slot: String,
        amount: i64,
    },
    // Operator commands.
    OpenRound {
        round: String,
    },
    ForceEndRound,
    Reset {
        level: ResetLevel,
    },
    // Operator setup. All of these are refused while a round is running,
    // because the engine holds snapshots of slots and participants.
    UpsertTeam {
        team: Team,
    },
    DeleteTeam {
        number: i64,
    },
    UpsertParticipant {
        name: String,
    },
    DeleteParticipant {
        participant_id: String,
    },
    RegenerateSlots,
    // Data queries, open to any registered connection.
    GetStandings,
    GetRoster {
        #[serde(default)]
        participant_id: Option<String>,
    },
    GetRoundWins {
        round: String,
    },
}

/// Summary of a live connection, broadcast whenever the set changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSummary {
    pub name: String,
    pub role: Role,
    #[serde(default)]
    pub participant_id: Option<String>,
}

/// One resolved slot assignment within a sub-auction result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotResult {
    pub participant_id: String,
    pub participant_name: String,
    pub slot_id: String,
    pub bid: i64,
    pub final_cost: i64,
    pub premium: f64,
    pub shared: bool,
}

/// Events emitted by the server to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Registration accepted; carries a session snapshot for late joiners.
    Registered {
        phase: Phase,
        active_round: Option<Position>,
        auction_active: bool,
        sub_auction_index: u32,
    },
    /// Registration refused; the client should re-authenticate.
    RegistrationRejected { reason: String },
    ConnectionsUpdate {
        connections: Vec<ConnectionSummary>,
    },
    RoundStarted {
        round: Position,
        slots: Vec<Slot>,
    },
    SubAuctionStarted {
        round: Position,
        sub_auction_index: u32,
        remaining_slots: Vec<Slot>,
        pending_participant_ids: Vec<String>,
    },
    /// To the bidder only.
    BidConfirmed { slot: String, amount: i64 },
    /// To the bidder only.
    BidRejected { reason: String },
    /// Aggregate progress broadcast: counts and who is still waiting,
    /// never amounts.
    BidStatusUpdate {
        total_pending: usize,
        bids_received: usize,
        still_waiting: Vec<String>,
    },
    SubAuctionResolved {
        round: Position,
        sub_auction_index: u32,
        results: Vec<SlotResult>,
        continues: bool,
    },
    RoundEnded { round: Position, completed: bool },
    /// To the winning connection only: their bidding is over for this round.
    ParticipantWonExit { slot_id: String, amount: i64 },
    /// Targeted after any debit.
    BalancesUpdated { balance: i64 },
    /// Operator command acknowledgments.
    AdminAck { message: String },
    AdminError { reason: String },
    // Replies to data queries.
    Standings { rows: Vec<StandingsRow> },
    Roster {
        participant_id: String,
        entries: Vec<RosterEntry>,
    },
    RoundWins { round: String, wins: Vec<AuctionWin> },
}

impl ServerEvent {
    /// Serialize for the wire. Serialization of these enums cannot fail;
    /// a failure would be a programming error, so it is logged and an empty
    /// object is sent instead of panicking the event loop.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!("failed to serialize server event: {e}");
            "{}".to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_message_parses() {
        let json = r#"{"type":"register","name":"Mario","role":"participant","participant_id":"mario_rossi"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Register {
                name: "Mario".to_string(),
                role: Role::Participant,
                participant_id: Some("mario_rossi".to_string()),
            }
        );
    }

    #[test]
    fn register_participant_id_optional() {
        let json = r#"{"type":"register","name":"Op","role":"operator"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::Register {
                participant_id: None,
                role: Role::Operator,
                ..
            }
        ));
    }

    #[test]
    fn place_bid_parses() {
        let json = r#"{"type":"place_bid","round":"M1","slot":"M1_RED","amount":150}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            ClientMessage::PlaceBid {
                round: "M1".to_string(),
                slot: "M1_RED".to_string(),
                amount: 150,
            }
        );
    }

    #[test]
    fn reset_levels_parse() {
        for (raw, level) in [
            ("round", ResetLevel::Round),
            ("auctions", ResetLevel::Auctions),
            ("full", ResetLevel::Full),
        ] {
            let json = format!(r#"{{"type":"reset","level":"{raw}"}}"#);
            let msg: ClientMessage = serde_json::from_str(&json).unwrap();
            assert_eq!(msg, ClientMessage::Reset { level });
        }
    }

    #[test]
    fn setup_and_query_messages_parse() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"regenerate_slots"}"#).unwrap();
        assert_eq!(msg, ClientMessage::RegenerateSlots);

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"upsert_participant","name":"Anna"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::UpsertParticipant {
                name: "Anna".to_string()
            }
        );

        // GetRoster defaults to the caller's own roster.
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"get_roster"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::GetRoster {
                participant_id: None
            }
        );
    }

    #[test]
    fn unknown_message_type_is_an_error() {
        let json = r#"{"type":"explode"}"#;
        assert!(serde_json::from_str::<ClientMessage>(json).is_err());
    }

    #[test]
    fn server_event_serializes_with_type_tag() {
        let event = ServerEvent::BidConfirmed {
            slot: "M1_RED".to_string(),
            amount: 100,
        };
        let json = event.to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "bid_confirmed");
        assert_eq!(value["slot"], "M1_RED");
        assert_eq!(value["amount"], 100);
    }

    #[test]
    fn round_ended_round_trips() {
        let event = ServerEvent::RoundEnded {
            round: Position::F2,
            completed: true,
        };
        let json = event.to_json();
        let back: ServerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn bid_status_update_has_no_amounts() {
        let event = ServerEvent::BidStatusUpdate {
            total_pending: 3,
            bids_received: 2,
            still_waiting: vec!["carla".to_string()],
        };
        let json = event.to_json();
        assert!(!json.contains("amount"));
        assert!(json.contains("still_waiting"));
    }
}
