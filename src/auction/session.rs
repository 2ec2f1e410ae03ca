// Session state: the single authoritative in-memory record of the auction.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::Slot;

/// One of the ten fixed club positions a round is run for.
///
/// Seven male positions (M1..M7) and three female positions (F1..F3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Position {
    M1,
    M2,
    M3,
    M4,
    M5,
    M6,
    M7,
    F1,
    F2,
    F3,
}

impl Position {
    /// All ten positions in auction order.
    pub const ALL: [Position; 10] = [
        Position::M1,
        Position::M2,
        Position::M3,
        Position::M4,
        Position::M5,
        Position::M6,
        Position::M7,
        Position::F1,
        Position::F2,
        Position::F3,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Position::M1 => "M1",
            Position::M2 => "M2",
            Position::M3 => "M3",
            Position::M4 => "M4",
            Position::M5 => "M5",
            Position::M6 => "M6",
            Position::M7 => "M7",
            Position::F1 => "F1",
            Position::F2 => "F2",
            Position::F3 => "F3",
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Position {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "M1" => Ok(Position::M1),
            "M2" => Ok(Position::M2),
            "M3" => Ok(Position::M3),
            "M4" => Ok(Position::M4),
            "M5" => Ok(Position::M5),
            "M6" => Ok(Position::M6),
            "M7" => Ok(Position::M7),
            "F1" => Ok(Position::F1),
            "F2" => Ok(Position::F2),
            "F3" => Ok(Position::F3),
            other => Err(format!("unknown position: {other}")),
        }
    }
}

/// Lifecycle phase of the overall game session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Setup,
    Auctioning,
    Results,
}

/// A sealed bid held in memory for the duration of one sub-auction.
///
/// Keyed by participant id in [`SessionState::sealed_bids`]; the submitting
/// connection id is carried only to distinguish a re-bid from the same
/// connection (overwrite) from a second connection for the same participant
/// (rejected), and to route the confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SealedBid {
    pub participant_id: String,
    pub slot_id: String,
    pub amount: i64,
    pub round: Position,
    pub connection_id: u64,
    pub submitted_at: DateTime<Utc>,
}

/// The single process-wide auction session state.
///
/// Created at startup, mutated only by the engine from the application event
/// loop, reset only by explicit admin action. Within a round,
/// `pending_participants` and `remaining_slots` shrink monotonically; the
/// round is over exactly when either set becomes empty.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub phase: Phase,
    pub active_round: Option<Position>,
    pub auction_active: bool,
    /// 1-based counter, reset at round start, incremented each time a
    /// sub-auction resolves without exhausting the round.
    pub sub_auction_index: u32,
    /// True while a sub-auction is accepting bids: set when one opens,
    /// cleared at resolution so the pause before the next sub-auction
    /// rejects stray bids.
    pub bids_open: bool,
    /// Participant ids still eligible to win in the active round.
    pub pending_participants: HashSet<String>,
    /// Display names for pending participants, for status payloads.
    pub participant_names: HashMap<String, String>,
    /// Slots not yet claimed in the active round, by slot id.
    pub remaining_slots: HashMap<String, Slot>,
    /// Sealed bids for the current sub-auction, by participant id.
    pub sealed_bids: HashMap<String, SealedBid>,
}

impl SessionState {
    pub fn new() -> Self {
        SessionState {
            phase: Phase::Setup,
            active_round: None,
            auction_active: false,
            sub_auction_index: 1,
            bids_open: false,
            pending_participants: HashSet::new(),
            participant_names: HashMap::new(),
            remaining_slots: HashMap::new(),
            sealed_bids: HashMap::new(),
        }
    }

    /// Seed the state for a freshly opened round.
    pub fn begin_round(
        &mut self,
        round: Position,
        participants: Vec<(String, String)>,
        slots: Vec<Slot>,
    ) {
        self.phase = Phase::Auctioning;
        self.active_round = Some(round);
        self.auction_active = true;
        self.sub_auction_index = 1;
        self.bids_open = false;
        self.pending_participants = participants.iter().map(|(id, _)| id.clone()).collect();
        self.participant_names = participants.into_iter().collect();
        self.remaining_slots = slots.into_iter().map(|s| (s.id.clone(), s)).collect();
        self.sealed_bids.clear();
    }

    /// Clear all round-scoped state. Idempotent.
    pub fn end_round(&mut self) {
        self.phase = Phase::Results;
        self.active_round = None;
        self.auction_active = false;
        self.sub_auction_index = 1;
        self.bids_open = false;
        self.pending_participants.clear();
        self.participant_names.clear();
        self.remaining_slots.clear();
        self.sealed_bids.clear();
    }

    /// Full reset back to the setup phase.
    pub fn reset(&mut self) {
        *self = SessionState::new();
    }

    /// True when the round has nothing left to auction: every participant
    /// has won, or every slot is claimed.
    pub fn round_exhausted(&self) -> bool {
        self.pending_participants.is_empty() || self.remaining_slots.is_empty()
    }

    /// True when every pending participant has a sealed bid recorded for the
    /// current sub-auction. This is the confirmation-driven close condition;
    /// there is no timer.
    pub fn all_pending_have_bid(&self) -> bool {
        !self.pending_participants.is_empty()
            && self
                .pending_participants
                .iter()
                .all(|id| self.sealed_bids.contains_key(id))
    }

    /// Pending participant ids that have not bid yet, sorted for stable
    /// status payloads.
    pub fn still_waiting(&self) -> Vec<String> {
        let mut waiting: Vec<String> = self
            .pending_participants
            .iter()
            .filter(|id| !self.sealed_bids.contains_key(*id))
            .cloned()
            .collect();
        waiting.sort();
        waiting
    }

    /// Remaining slots sorted by id, for deterministic payloads and
    /// resolution order.
    pub fn remaining_slots_sorted(&self) -> Vec<Slot> {
        let mut slots: Vec<Slot> = self.remaining_slots.values().cloned().collect();
        slots.sort_by(|a, b| a.id.cmp(&b.id));
        slots
    }

    /// Pending participant ids, sorted.
    pub fn pending_sorted(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pending_participants.iter().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::new()
    }
}
