// Auction engine: round lifecycle, sealed-bid collection, and resolution.

use std::collections::BTreeMap;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::{info, warn};

use super::registry::ConnectionRegistry;
use super::session::{Position, SealedBid, SessionState};
use crate::db::{Database, WinRecord};
use crate::notify::Outgoing;
use crate::protocol::{ServerEvent, SlotResult};

/// Rejection reasons for a submitted bid. Every variant carries a short
/// human-readable message; a rejected bid is surfaced to the offending
/// connection only and never affects other participants.
#[derive(Debug, Error)]
pub enum BidError {
    #[error("no active round matches '{0}'")]
    RoundMismatch(String),

    #[error("connection is not registered")]
    NotRegistered,

    #[error("only verified participants can bid; please re-authenticate")]
    NotAuthorized,

    #[error("you already won a slot in this round")]
    AlreadyWon,

    #[error("a bid from another connection is already recorded for this participant")]
    DuplicateBid,

    #[error("a bid needs a slot and a positive amount")]
    InvalidBid,

    #[error("slot {0} is not available in this sub-auction")]
    SlotUnavailable(String),

    #[error("insufficient credits")]
    InsufficientCredits,

    #[error("storage error: {0}")]
    Persistence(#[from] anyhow::Error),
}

/// Failures of operator-driven round control and setup guards.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("a round is already active")]
    RoundAlreadyActive,

    #[error("no active round")]
    NoActiveRound,

    #[error("invalid round tag: {0}")]
    InvalidRound(String),

    #[error("no slots available for round {0}")]
    NoSlotsAvailable(Position),

    #[error("no active participants")]
    NoParticipants,

    #[error("system busy: an auction round is in progress")]
    SystemBusy,

    #[error("storage error: {0}")]
    Persistence(#[from] anyhow::Error),
}

/// Result of an accepted bid: the events to emit, and whether every pending
/// participant has now bid (so the caller should resolve immediately).
#[derive(Debug)]
pub struct SubmitOutcome {
    pub events: Vec<Outgoing>,
    pub ready_to_resolve: bool,
}

/// Result of resolving one sub-auction.
#[derive(Debug)]
pub struct Resolution {
    pub events: Vec<Outgoing>,
    /// True when the round goes on: the caller should open the next
    /// sub-auction after the configured pause.
    pub continues: bool,
}

/// The auction engine. Owns the session state and the tie-break random
/// source; persistence and connection routing are passed in per call.
///
/// All methods run on the single application event loop, so state
/// transitions are never preempted and need no locking.
pub struct AuctionEngine {
    pub session: SessionState,
    rng: StdRng,
}

impl AuctionEngine {
    pub fn new() -> Self {
        AuctionEngine {
            session: SessionState::new(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Engine with a pinned random seed, for reproducible tie-breaks.
    pub fn with_seed(seed: u64) -> Self {
        AuctionEngine {
            session: SessionState::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Open a round for `round`: load unclaimed slots and active
    /// participants, seed the session, and open the first sub-auction.
    pub fn open_round(
        &mut self,
        round: Position,
        db: &Database,
        registry: &ConnectionRegistry,
    ) -> Result<Vec<Outgoing>, AdminError> {
        if self.session.auction_active {
            return Err(AdminError::RoundAlreadyActive);
        }

        let participants = db.list_active_participants()?;
        if participants.is_empty() {
            return Err(AdminError::NoParticipants);
        }
        let slots = db.list_unclaimed_slots(round)?;
        if slots.is_empty() {
            return Err(AdminError::NoSlotsAvailable(round));
        }

        info!(
            "opening round {round} with {} slots and {} participants",
            slots.len(),
            participants.len()
        );
        self.session.begin_round(
            round,
            participants.into_iter().map(|p| (p.id, p.name)).collect(),
            slots.clone(),
        );

        let mut events = vec![Outgoing::Broadcast(ServerEvent::RoundStarted {
            round,
            slots,
        })];
        events.extend(self.open_sub_auction(registry));
        Ok(events)
    }

    /// Open the next sub-auction, or close the round if either the pending
    /// participant set or the remaining slot set is already empty.
    pub fn open_sub_auction(&mut self, registry: &ConnectionRegistry) -> Vec<Outgoing> {
        if !self.session.auction_active {
            return Vec::new();
        }
        if self.session.round_exhausted() {
            return self.close_round();
        }

        self.session.sealed_bids.clear();
        self.session.bids_open = true;

        let round = match self.session.active_round {
            Some(round) => round,
            None => return Vec::new(),
        };
        info!(
            "sub-auction {} of round {round} open: {} slots, {} pending",
            self.session.sub_auction_index,
            self.session.remaining_slots.len(),
            self.session.pending_participants.len()
        );

        let eligible = registry.eligible_connections(&self.session.pending_participants);
        vec![Outgoing::Multi(
            eligible,
            ServerEvent::SubAuctionStarted {
                round,
                sub_auction_index: self.session.sub_auction_index,
                remaining_slots: self.session.remaining_slots_sorted(),
                pending_participant_ids: self.session.pending_sorted(),
            },
        )]
    }

    /// Validate and record a sealed bid. Checks run in a fixed order and
    /// fail fast on the first violation.
    pub fn submit_bid(
        &mut self,
        conn_id: u64,
        round_tag: &str,
        slot_id: &str,
        amount: i64,
        db: &Database,
        registry: &ConnectionRegistry,
    ) -> Result<SubmitOutcome, BidError> {
        // 1. A sub-auction must be accepting bids for the named round.
        let active = self
            .session
            .active_round
            .filter(|_| self.session.auction_active && self.session.bids_open);
        let round = match (active, round_tag.parse::<Position>()) {
            (Some(active), Ok(parsed)) if active == parsed => active,
            _ => return Err(BidError::RoundMismatch(round_tag.to_string())),
        };

        // 2. The connection must be a verified participant.
        let participant_id = self.verified_bidder(conn_id, registry)?;

        // 3. Repeat sub-auctions are for not-yet-assigned participants only.
        if self.session.sub_auction_index > 1
            && !self.session.pending_participants.contains(&participant_id)
        {
            return Err(BidError::AlreadyWon);
        }

        // 4. One counted bid per participant per sub-auction. The same
        //    connection may change its bid; a different connection may not.
        if let Some(existing) = self.session.sealed_bids.get(&participant_id) {
            if existing.connection_id != conn_id {
                return Err(BidError::DuplicateBid);
            }
        }

        // 5. Well-formed bid.
        if slot_id.is_empty() || amount <= 0 {
            return Err(BidError::InvalidBid);
        }

        // 6. The slot must still be on the table.
        if !self.session.remaining_slots.contains_key(slot_id) {
            return Err(BidError::SlotUnavailable(slot_id.to_string()));
        }

        // 7. Fresh balance check against persistence.
        let balance = db
            .participant_balance(&participant_id)?
            .ok_or(BidError::NotAuthorized)?;
        if balance < amount {
            return Err(BidError::InsufficientCredits);
        }

        self.session.sealed_bids.insert(
            participant_id.clone(),
            SealedBid {
                participant_id: participant_id.clone(),
                slot_id: slot_id.to_string(),
                amount,
                round,
                connection_id: conn_id,
                submitted_at: Utc::now(),
            },
        );
        info!("bid recorded: {participant_id} on {slot_id}");

        let still_waiting = self.session.still_waiting();
        let total_pending = self.session.pending_participants.len();
        let events = vec![
            Outgoing::To(
                conn_id,
                ServerEvent::BidConfirmed {
                    slot: slot_id.to_string(),
                    amount,
                },
            ),
            // Counts only, never amounts: bids stay sealed until resolution.
            Outgoing::Broadcast(ServerEvent::BidStatusUpdate {
                total_pending,
                bids_received: total_pending - still_waiting.len(),
                still_waiting,
            }),
        ];

        Ok(SubmitOutcome {
            ready_to_resolve: self.session.all_pending_have_bid(),
            events,
        })
    }

    /// Resolve the current sub-auction with whatever bids exist, persist
    /// the winners, and decide whether the round continues.
    ///
    /// Resolution runs at most once per sub-auction: the call is a no-op
    /// during the pause between a resolution and the next sub-auction.
    pub fn resolve_sub_auction(
        &mut self,
        db: &Database,
        registry: &ConnectionRegistry,
    ) -> Result<Resolution, AdminError> {
        let round = match self.session.active_round {
            Some(round) if self.session.auction_active => round,
            _ => return Err(AdminError::NoActiveRound),
        };
        if !self.session.bids_open {
            return Ok(Resolution {
                events: Vec::new(),
                continues: true,
            });
        }
        self.session.bids_open = false;

        // Group the pending participants' bids by target slot. BTreeMap
        // keeps resolution order deterministic.
        let mut by_slot: BTreeMap<String, Vec<SealedBid>> = BTreeMap::new();
        for bid in self.session.sealed_bids.values() {
            if self.session.pending_participants.contains(&bid.participant_id)
                && self.session.remaining_slots.contains_key(&bid.slot_id)
            {
                by_slot.entry(bid.slot_id.clone()).or_default().push(bid.clone());
            }
        }

        // Highest sealed bid wins each slot; ties are broken uniformly at
        // random among the maximum bids. Slots with zero bids simply carry
        // over to the next sub-auction.
        let mut wins = Vec::new();
        for (slot_id, mut bids) in by_slot {
            bids.sort_by(|a, b| {
                b.amount
                    .cmp(&a.amount)
                    .then_with(|| a.participant_id.cmp(&b.participant_id))
            });
            let max = bids[0].amount;
            let ties: Vec<&SealedBid> = bids.iter().take_while(|b| b.amount == max).collect();
            let winner = if ties.len() == 1 {
                ties[0]
            } else {
                ties[self.rng.gen_range(0..ties.len())]
            };
            info!(
                "{} wins {slot_id} for {} ({} bid(s), {} tied at max)",
                winner.participant_id,
                winner.amount,
                bids.len(),
                ties.len()
            );
            wins.push(WinRecord {
                participant_id: winner.participant_id.clone(),
                slot_id,
                bid: winner.amount,
                final_cost: winner.amount,
                premium: 0.0,
                shared: false,
            });
        }

        // Persist before mutating session state: if the transaction fails,
        // the sub-auction stays resolvable (operator can force-end again).
        if let Err(e) = db.record_round_wins(round.as_str(), &wins) {
            self.session.bids_open = true;
            return Err(AdminError::Persistence(e));
        }

        let mut results = Vec::new();
        let mut events = Vec::new();
        for win in &wins {
            self.session.pending_participants.remove(&win.participant_id);
            self.session.remaining_slots.remove(&win.slot_id);

            let participant_name = self
                .session
                .participant_names
                .get(&win.participant_id)
                .cloned()
                .unwrap_or_else(|| win.participant_id.clone());
            results.push(SlotResult {
                participant_id: win.participant_id.clone(),
                participant_name,
                slot_id: win.slot_id.clone(),
                bid: win.bid,
                final_cost: win.final_cost,
                premium: win.premium,
                shared: win.shared,
            });

            if let Some(conn_id) = registry.connection_for_participant(&win.participant_id) {
                events.push(Outgoing::To(
                    conn_id,
                    ServerEvent::ParticipantWonExit {
                        slot_id: win.slot_id.clone(),
                        amount: win.final_cost,
                    },
                ));
                match db.participant_balance(&win.participant_id) {
                    Ok(Some(balance)) => events.push(Outgoing::To(
                        conn_id,
                        ServerEvent::BalancesUpdated { balance },
                    )),
                    Ok(None) => {}
                    Err(e) => warn!(
                        "failed to load balance for {}: {e}",
                        win.participant_id
                    ),
                }
            }
        }

        self.session.sealed_bids.clear();
        let continues = !self.session.round_exhausted();

        events.insert(
            0,
            Outgoing::Broadcast(ServerEvent::SubAuctionResolved {
                round,
                sub_auction_index: self.session.sub_auction_index,
                results,
                continues,
            }),
        );

        if continues {
            self.session.sub_auction_index += 1;
        } else {
            events.extend(self.close_round());
        }

        Ok(Resolution { events, continues })
    }

    /// Operator escape hatch: resolve immediately, even if some pending
    /// participants have not bid. Their absence just leaves no bid on the
    /// slots they might have wanted.
    pub fn force_end_round(
        &mut self,
        db: &Database,
        registry: &ConnectionRegistry,
    ) -> Result<Resolution, AdminError> {
        if !self.session.auction_active {
            return Err(AdminError::NoActiveRound);
        }
        info!("force-ending current sub-auction");
        self.resolve_sub_auction(db, registry)
    }

    /// Close the round and clear all round-scoped state. Idempotent: with
    /// no active round this emits nothing.
    pub fn close_round(&mut self) -> Vec<Outgoing> {
        let round = match self.session.active_round {
            Some(round) => round,
            None => return Vec::new(),
        };
        info!("round {round} closed");
        self.session.end_round();
        vec![Outgoing::Broadcast(ServerEvent::RoundEnded {
            round,
            completed: true,
        })]
    }

    /// Abandon the active round without resolving (admin round reset).
    /// Emits `round_ended` with `completed: false`.
    pub fn abandon_round(&mut self) -> Vec<Outgoing> {
        let round = match self.session.active_round {
            Some(round) => round,
            None => return Vec::new(),
        };
        warn!("round {round} abandoned by operator");
        self.session.end_round();
        vec![Outgoing::Broadcast(ServerEvent::RoundEnded {
            round,
            completed: false,
        })]
    }

    /// Guard for setup operations that would invalidate the engine's round
    /// snapshots (slot regeneration, participant/team mutation).
    pub fn guard_setup(&self) -> Result<(), AdminError> {
        if self.session.auction_active {
            Err(AdminError::SystemBusy)
        } else {
            Ok(())
        }
    }

    fn verified_bidder(
        &self,
        conn_id: u64,
        registry: &ConnectionRegistry,
    ) -> Result<String, BidError> {
        match registry.get(conn_id) {
            None => Err(BidError::NotRegistered),
            Some(_) => registry
                .verified_participant(conn_id)
                .map(str::to_string)
                .ok_or(BidError::NotAuthorized),
        }
    }
}

impl Default for AuctionEngine {
    fn default() -> Self {
        AuctionEngine::new()
    }
}
