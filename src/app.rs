// Application orchestration.
//
// The central event loop that coordinates WebSocket events from club devices
// with the auction engine, the connection registry, and the notification
// dispatcher. Everything that mutates auction state runs here, on one task.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::auction::engine::{AdminError, AuctionEngine};
use crate::auction::registry::ConnectionRegistry;
use crate::auction::session::Position;
use crate::config::Config;
use crate::db::Database;
use crate::notify::{Dispatcher, Outgoing};
use crate::protocol::{ClientMessage, ResetLevel, Role, ServerEvent};
use crate::ws_server::WsEvent;

/// Self-addressed timer event: the pause after a resolved sub-auction has
/// elapsed and sub-auction `sub_auction_index` should open. Stale ticks
/// (index mismatch, round gone, bids already open) are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubAuctionTick {
    pub sub_auction_index: u32,
}

/// The complete application state.
pub struct AppState {
    pub config: Config,
    pub db: Database,
    pub engine: AuctionEngine,
    pub registry: ConnectionRegistry,
    pub dispatcher: Dispatcher,
    tick_tx: mpsc::Sender<SubAuctionTick>,
}

impl AppState {
    pub fn new(
        config: Config,
        db: Database,
        engine: AuctionEngine,
        tick_tx: mpsc::Sender<SubAuctionTick>,
    ) -> Self {
        AppState {
            config,
            db,
            engine,
            registry: ConnectionRegistry::new(),
            dispatcher: Dispatcher::new(),
            tick_tx,
        }
    }

    // -- connection lifecycle ------------------------------------------------

    pub fn handle_connected(&mut self, conn_id: u64, outbound: mpsc::Sender<String>) {
        self.dispatcher.attach(conn_id, outbound);
    }

    /// A socket dropped. The registry entry goes away, but any sealed bid
    /// the participant already submitted this sub-auction still counts.
    pub fn handle_disconnected(&mut self, conn_id: u64) {
        self.dispatcher.detach(conn_id);
        if self.registry.unregister(conn_id).is_some() {
            self.broadcast_connections();
        }
    }

    // -- inbound messages ----------------------------------------------------

    pub fn handle_message(&mut self, conn_id: u64, text: &str) {
        let msg: ClientMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                warn!("Unparseable message from connection {conn_id}: {e}");
                self.send_to(
                    conn_id,
                    ServerEvent::AdminError {
                        reason: format!("unparseable message: {e}"),
                    },
                );
                return;
            }
        };

        match msg {
            ClientMessage::Register {
                name,
                role,
                participant_id,
            } => self.handle_register(conn_id, &name, role, participant_id),
            ClientMessage::PlaceBid {
                round,
                slot,
                amount,
            } => self.handle_place_bid(conn_id, &round, &slot, amount),
            ClientMessage::OpenRound { round } => self.handle_open_round(conn_id, &round),
            ClientMessage::ForceEndRound => self.handle_force_end_round(conn_id),
            ClientMessage::Reset { level } => self.handle_reset(conn_id, level),
            ClientMessage::UpsertTeam { team } => self.handle_setup(conn_id, |state| {
                state.db.upsert_team(&team)?;
                Ok(format!("team {} ({}) saved", team.number, team.color))
            }),
            ClientMessage::DeleteTeam { number } => self.handle_setup(conn_id, |state| {
                state.db.delete_team(number)?;
                Ok(format!("team {number} removed"))
            }),
            ClientMessage::UpsertParticipant { name } => self.handle_setup(conn_id, |state| {
                let credits = state.config.game.initial_credits;
                let id = state.db.upsert_participant(&name, credits)?;
                Ok(format!("participant '{id}' saved"))
            }),
            ClientMessage::DeleteParticipant { participant_id } => {
                self.handle_setup(conn_id, |state| {
                    state.db.delete_participant(&participant_id)?;
                    Ok(format!("participant '{participant_id}' removed"))
                })
            }
            ClientMessage::RegenerateSlots => self.handle_setup(conn_id, |state| {
                let count = state.db.regenerate_slots()?;
                Ok(format!("{count} slots regenerated, auction records cleared"))
            }),
            ClientMessage::GetStandings => self.handle_get_standings(conn_id),
            ClientMessage::GetRoster { participant_id } => {
                self.handle_get_roster(conn_id, participant_id)
            }
            ClientMessage::GetRoundWins { round } => self.handle_get_round_wins(conn_id, &round),
        }
    }

    fn handle_register(
        &mut self,
        conn_id: u64,
        name: &str,
        role: Role,
        participant_id: Option<String>,
    ) {
        match role {
            Role::Participant => {
                let pid = match participant_id.filter(|p| !p.is_empty()) {
                    Some(pid) => pid,
                    None => {
                        self.reject_registration(conn_id, "participant_id is required");
                        return;
                    }
                };
                let participant = match self.db.participant(&pid) {
                    Ok(Some(p)) if p.active => p,
                    Ok(_) => {
                        self.reject_registration(conn_id, "unknown or inactive participant");
                        return;
                    }
                    Err(e) => {
                        warn!("Participant lookup failed for {pid}: {e}");
                        self.reject_registration(conn_id, "storage error, try again");
                        return;
                    }
                };

                // One connection per participant: a fresh sign-in bumps any
                // previous device off.
                if let Some(evicted) = self.registry.register_participant(conn_id, name, &pid) {
                    info!("Participant {pid} moved from connection {evicted} to {conn_id}");
                    self.send_to(
                        evicted,
                        ServerEvent::RegistrationRejected {
                            reason: "another device signed in as this participant".to_string(),
                        },
                    );
                    self.dispatcher.detach(evicted);
                }

                info!("Connection {conn_id} registered as participant {pid}");
                self.send_registered(conn_id);
                self.send_to(
                    conn_id,
                    ServerEvent::BalancesUpdated {
                        balance: participant.credits,
                    },
                );
                self.send_session_snapshot(conn_id, Some(&pid));
                self.broadcast_connections();
            }
            other => {
                self.registry.register_other(conn_id, name, other);
                info!("Connection {conn_id} registered as {other:?} '{name}'");
                self.send_registered(conn_id);
                self.send_session_snapshot(conn_id, None);
                self.broadcast_connections();
            }
        }
    }

    fn handle_place_bid(&mut self, conn_id: u64, round: &str, slot: &str, amount: i64) {
        match self
            .engine
            .submit_bid(conn_id, round, slot, amount, &self.db, &self.registry)
        {
            Ok(outcome) => {
                self.dispatcher.dispatch_all(&outcome.events);
                if outcome.ready_to_resolve {
                    self.resolve_current();
                }
            }
            Err(e) => self.send_to(
                conn_id,
                ServerEvent::BidRejected {
                    reason: e.to_string(),
                },
            ),
        }
    }

    fn handle_open_round(&mut self, conn_id: u64, round: &str) {
        if !self.require_operator(conn_id) {
            return;
        }
        let position = match round.parse::<Position>() {
            Ok(p) => p,
            Err(_) => {
                self.send_admin_error(conn_id, &AdminError::InvalidRound(round.to_string()));
                return;
            }
        };
        match self.engine.open_round(position, &self.db, &self.registry) {
            Ok(events) => {
                self.dispatcher.dispatch_all(&events);
                self.send_to(
                    conn_id,
                    ServerEvent::AdminAck {
                        message: format!("round {position} opened"),
                    },
                );
            }
            Err(e) => self.send_admin_error(conn_id, &e),
        }
    }

    fn handle_force_end_round(&mut self, conn_id: u64) {
        if !self.require_operator(conn_id) {
            return;
        }
        if !self.engine.session.auction_active {
            self.send_admin_error(conn_id, &AdminError::NoActiveRound);
            return;
        }
        self.resolve_current();
        self.send_to(
            conn_id,
            ServerEvent::AdminAck {
                message: "sub-auction force-ended".to_string(),
            },
        );
    }

    fn handle_reset(&mut self, conn_id: u64, level: ResetLevel) {
        if !self.require_operator(conn_id) {
            return;
        }

        let abandoned = self.engine.abandon_round();
        self.dispatcher.dispatch_all(&abandoned);

        let result = match level {
            ResetLevel::Round => Ok("round reset"),
            ResetLevel::Auctions => self
                .db
                .reset_auctions(self.config.game.initial_credits)
                .map(|()| {
                    self.engine.session.reset();
                    self.push_all_balances();
                    "auction data reset, credits restored"
                }),
            ResetLevel::Full => self.db.reset_full().map(|()| {
                self.engine.session.reset();
                "full reset: teams, participants, and auctions cleared"
            }),
        };

        match result {
            Ok(message) => {
                info!("Reset ({level:?}) performed by connection {conn_id}");
                self.send_to(
                    conn_id,
                    ServerEvent::AdminAck {
                        message: message.to_string(),
                    },
                );
            }
            Err(e) => {
                warn!("Reset ({level:?}) failed: {e}");
                self.send_to(
                    conn_id,
                    ServerEvent::AdminError {
                        reason: format!("reset failed: {e}"),
                    },
                );
            }
        }
    }

    /// Run one operator setup action behind the role and busy guards.
    fn handle_setup<F>(&mut self, conn_id: u64, action: F)
    where
        F: FnOnce(&mut AppState) -> anyhow::Result<String>,
    {
        if !self.require_operator(conn_id) {
            return;
        }
        if let Err(e) = self.engine.guard_setup() {
            self.send_admin_error(conn_id, &e);
            return;
        }
        match action(self) {
            Ok(message) => {
                info!("Setup operation by connection {conn_id}: {message}");
                self.send_to(conn_id, ServerEvent::AdminAck { message });
            }
            Err(e) => {
                warn!("Setup operation failed: {e}");
                self.send_to(
                    conn_id,
                    ServerEvent::AdminError {
                        reason: format!("setup failed: {e}"),
                    },
                );
            }
        }
    }

    fn handle_get_standings(&mut self, conn_id: u64) {
        match self.db.standings() {
            Ok(rows) => self.send_to(conn_id, ServerEvent::Standings { rows }),
            Err(e) => {
                warn!("Standings query failed: {e}");
                self.send_to(
                    conn_id,
                    ServerEvent::AdminError {
                        reason: "standings unavailable".to_string(),
                    },
                );
            }
        }
    }

    fn handle_get_roster(&mut self, conn_id: u64, participant_id: Option<String>) {
        // Default to the caller's own roster.
        let pid = participant_id
            .filter(|p| !p.is_empty())
            .or_else(|| self.registry.verified_participant(conn_id).map(str::to_string));
        let pid = match pid {
            Some(pid) => pid,
            None => {
                self.send_to(
                    conn_id,
                    ServerEvent::AdminError {
                        reason: "participant_id is required".to_string(),
                    },
                );
                return;
            }
        };
        match self.db.participant_roster(&pid) {
            Ok(entries) => self.send_to(
                conn_id,
                ServerEvent::Roster {
                    participant_id: pid,
                    entries,
                },
            ),
            Err(e) => {
                warn!("Roster query failed for {pid}: {e}");
                self.send_to(
                    conn_id,
                    ServerEvent::AdminError {
                        reason: "roster unavailable".to_string(),
                    },
                );
            }
        }
    }

    fn handle_get_round_wins(&mut self, conn_id: u64, round: &str) {
        match self.db.wins_for_round(round) {
            Ok(wins) => self.send_to(
                conn_id,
                ServerEvent::RoundWins {
                    round: round.to_string(),
                    wins,
                },
            ),
            Err(e) => {
                warn!("Round wins query failed for {round}: {e}");
                self.send_to(
                    conn_id,
                    ServerEvent::AdminError {
                        reason: "round results unavailable".to_string(),
                    },
                );
            }
        }
    }

    // -- sub-auction cadence -------------------------------------------------

    /// Resolve the current sub-auction and either schedule the next one or
    /// publish the finished round's results.
    fn resolve_current(&mut self) {
        let round = self.engine.session.active_round;
        match self.engine.resolve_sub_auction(&self.db, &self.registry) {
            Ok(resolution) => {
                self.dispatcher.dispatch_all(&resolution.events);
                if resolution.continues {
                    self.schedule_next_sub_auction();
                } else if let Some(round) = round {
                    self.broadcast_round_wins(round);
                }
            }
            Err(AdminError::NoActiveRound) => {}
            Err(e) => warn!("Sub-auction resolution failed: {e}"),
        }
    }

    fn schedule_next_sub_auction(&self) {
        let tick_tx = self.tick_tx.clone();
        let sub_auction_index = self.engine.session.sub_auction_index;
        let pause = Duration::from_secs(self.config.game.sub_auction_pause_secs);
        tokio::spawn(async move {
            tokio::time::sleep(pause).await;
            let _ = tick_tx.send(SubAuctionTick { sub_auction_index }).await;
        });
    }

    /// The pause elapsed; open the next sub-auction unless the round moved
    /// on underneath the timer (reset, force-end, duplicate tick).
    pub fn handle_tick(&mut self, tick: SubAuctionTick) {
        let session = &self.engine.session;
        if !session.auction_active
            || session.bids_open
            || session.sub_auction_index != tick.sub_auction_index
        {
            return;
        }
        let events = self.engine.open_sub_auction(&self.registry);
        self.dispatcher.dispatch_all(&events);
    }

    // -- outbound helpers ----------------------------------------------------

    fn send_to(&self, conn_id: u64, event: ServerEvent) {
        self.dispatcher.dispatch(&Outgoing::To(conn_id, event));
    }

    fn reject_registration(&self, conn_id: u64, reason: &str) {
        warn!("Registration rejected for connection {conn_id}: {reason}");
        self.send_to(
            conn_id,
            ServerEvent::RegistrationRejected {
                reason: reason.to_string(),
            },
        );
    }

    fn send_registered(&self, conn_id: u64) {
        let session = &self.engine.session;
        self.send_to(
            conn_id,
            ServerEvent::Registered {
                phase: session.phase,
                active_round: session.active_round,
                auction_active: session.auction_active,
                sub_auction_index: session.sub_auction_index,
            },
        );
    }

    /// Bring a late joiner up to speed: if a sub-auction is accepting bids
    /// and this connection may participate in it, replay the prompt.
    fn send_session_snapshot(&self, conn_id: u64, participant_id: Option<&str>) {
        let session = &self.engine.session;
        if !session.auction_active || !session.bids_open {
            return;
        }
        if let Some(pid) = participant_id {
            if !session.pending_participants.contains(pid) {
                return;
            }
        }
        let round = match session.active_round {
            Some(round) => round,
            None => return,
        };
        self.send_to(
            conn_id,
            ServerEvent::SubAuctionStarted {
                round,
                sub_auction_index: session.sub_auction_index,
                remaining_slots: session.remaining_slots_sorted(),
                pending_participant_ids: session.pending_sorted(),
            },
        );
    }

    fn broadcast_connections(&self) {
        self.dispatcher
            .dispatch(&Outgoing::Broadcast(ServerEvent::ConnectionsUpdate {
                connections: self.registry.summaries(),
            }));
    }

    fn broadcast_round_wins(&self, round: Position) {
        match self.db.wins_for_round(round.as_str()) {
            Ok(wins) => self
                .dispatcher
                .dispatch(&Outgoing::Broadcast(ServerEvent::RoundWins {
                    round: round.as_str().to_string(),
                    wins,
                })),
            Err(e) => warn!("Failed to load wins for round {round}: {e}"),
        }
    }

    /// Push fresh balances to every connected participant (after a reset).
    fn push_all_balances(&self) {
        let participants = match self.db.list_active_participants() {
            Ok(p) => p,
            Err(e) => {
                warn!("Failed to list participants for balance push: {e}");
                return;
            }
        };
        for participant in participants {
            if let Some(conn_id) = self.registry.connection_for_participant(&participant.id) {
                self.send_to(
                    conn_id,
                    ServerEvent::BalancesUpdated {
                        balance: participant.credits,
                    },
                );
            }
        }
    }

    fn send_admin_error(&self, conn_id: u64, error: &AdminError) {
        self.send_to(
            conn_id,
            ServerEvent::AdminError {
                reason: error.to_string(),
            },
        );
    }

    fn require_operator(&self, conn_id: u64) -> bool {
        let is_operator = self
            .registry
            .get(conn_id)
            .map(|info| info.role == Role::Operator)
            .unwrap_or(false);
        if !is_operator {
            self.send_to(
                conn_id,
                ServerEvent::AdminError {
                    reason: "operator role required".to_string(),
                },
            );
        }
        is_operator
    }
}

// ---------------------------------------------------------------------------
// Main event loop
// ---------------------------------------------------------------------------

/// Run the main application event loop.
///
/// Listens on two channels using `tokio::select!`:
/// 1. WebSocket events from client connections
/// 2. Sub-auction ticks from spawned pause timers
pub async fn run(
    mut ws_rx: mpsc::Receiver<WsEvent>,
    mut tick_rx: mpsc::Receiver<SubAuctionTick>,
    mut state: AppState,
) -> anyhow::Result<()> {
    info!("Application event loop started");

    loop {
        tokio::select! {
            ws_event = ws_rx.recv() => {
                match ws_event {
                    Some(WsEvent::Connected { conn_id, addr, outbound }) => {
                        info!("Connection {conn_id} from {addr} attached");
                        state.handle_connected(conn_id, outbound);
                    }
                    Some(WsEvent::Message { conn_id, text }) => {
                        state.handle_message(conn_id, &text);
                    }
                    Some(WsEvent::Disconnected { conn_id }) => {
                        info!("Connection {conn_id} detached");
                        state.handle_disconnected(conn_id);
                    }
                    None => {
                        info!("WebSocket channel closed, shutting down");
                        break;
                    }
                }
            }

            tick = tick_rx.recv() => {
                match tick {
                    Some(tick) => state.handle_tick(tick),
                    // state owns a tick_tx clone, so this channel cannot
                    // close while the loop runs; treat it as shutdown anyway.
                    None => break,
                }
            }
        }
    }

    info!("Application event loop exiting");
    Ok(())
}
