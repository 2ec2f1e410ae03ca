// SQLite persistence layer for teams, participants, slots, and auction records.

use std::sync::{Mutex, MutexGuard};

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::auction::session::Position;

/// A club team with its ten named players (7 male, 3 female positions).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Team {
    pub number: i64,
    pub color: String,
    pub players: [Option<String>; 10],
    pub active: bool,
}

impl Team {
    /// Player name for a position, following the m1..m7/f1..f3 column order.
    pub fn player_for(&self, position: Position) -> Option<&str> {
        let idx = Position::ALL.iter().position(|p| *p == position)?;
        self.players[idx].as_deref()
    }
}

/// One biddable (position, team) pairing, e.g. `M1_RED`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    pub id: String,
    pub team_number: i64,
    pub color: String,
    pub position: String,
    pub current_player: Option<String>,
    pub total_points: i64,
    pub active: bool,
}

/// A registered auction participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub name: String,
    pub credits: i64,
    pub total_points: i64,
    pub active: bool,
}

/// One win to persist: an auction row plus the matching credit debit.
#[derive(Debug, Clone, PartialEq)]
pub struct WinRecord {
    pub participant_id: String,
    pub slot_id: String,
    pub bid: i64,
    pub final_cost: i64,
    pub premium: f64,
    pub shared: bool,
}

/// A persisted winning auction row, joined with display data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuctionWin {
    pub round: String,
    pub participant_id: String,
    pub participant_name: String,
    pub slot_id: String,
    pub bid: i64,
    pub final_cost: i64,
    pub premium: f64,
    pub shared: bool,
    pub player: Option<String>,
    pub color: String,
}

/// One entry of a participant's assembled fantasy team.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub slot_id: String,
    pub position: String,
    pub player: Option<String>,
    pub color: String,
    pub final_cost: i64,
    pub slot_points: i64,
}

/// One row of the league table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandingsRow {
    pub rank: usize,
    pub participant_id: String,
    pub name: String,
    pub credits: i64,
    pub players_won: i64,
    pub total_points: i64,
    pub credits_spent: i64,
}

/// SQLite-backed persistence gateway. The auction engine only sees this
/// surface; the storage technology behind it is interchangeable.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a SQLite database at `path` and ensure all tables
    /// exist. Pass `":memory:"` for an ephemeral in-memory database (useful
    /// for tests).
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to set database pragmas")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS teams (
                number INTEGER PRIMARY KEY,
                color  TEXT NOT NULL,
                m1 TEXT, m2 TEXT, m3 TEXT, m4 TEXT, m5 TEXT, m6 TEXT, m7 TEXT,
                f1 TEXT, f2 TEXT, f3 TEXT,
                active INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS participants (
                id           TEXT PRIMARY KEY,
                name         TEXT NOT NULL,
                credits      INTEGER NOT NULL,
                total_points INTEGER NOT NULL DEFAULT 0,
                active       INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS slots (
                id             TEXT PRIMARY KEY,
                team_number    INTEGER NOT NULL REFERENCES teams(number),
                color          TEXT NOT NULL,
                position       TEXT NOT NULL,
                current_player TEXT,
                total_points   INTEGER NOT NULL DEFAULT 0,
                active         INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS auctions (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                round          TEXT NOT NULL,
                participant_id TEXT NOT NULL REFERENCES participants(id),
                slot_id        TEXT NOT NULL REFERENCES slots(id),
                bid            INTEGER NOT NULL,
                final_cost     INTEGER NOT NULL,
                premium        REAL NOT NULL DEFAULT 0,
                winner         INTEGER NOT NULL DEFAULT 0,
                shared         INTEGER NOT NULL DEFAULT 0,
                timestamp      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE INDEX IF NOT EXISTS idx_auctions_round ON auctions(round);
            CREATE INDEX IF NOT EXISTS idx_auctions_participant ON auctions(participant_id);
            ",
        )
        .context("failed to create database schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the database connection.
    ///
    /// Panics if the mutex is poisoned (another thread panicked while
    /// holding the lock). This should never happen in normal operation.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }

    // ------------------------------------------------------------------
    // Teams
    // ------------------------------------------------------------------

    /// Insert or replace a club team by its number.
    pub fn upsert_team(&self, team: &Team) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO teams
                (number, color, m1, m2, m3, m4, m5, m6, m7, f1, f2, f3, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                team.number,
                team.color,
                team.players[0],
                team.players[1],
                team.players[2],
                team.players[3],
                team.players[4],
                team.players[5],
                team.players[6],
                team.players[7],
                team.players[8],
                team.players[9],
                team.active,
            ],
        )
        .context("failed to upsert team")?;
        Ok(())
    }

    pub fn delete_team(&self, number: i64) -> Result<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM teams WHERE number = ?1", params![number])
            .context("failed to delete team")?;
        Ok(())
    }

    pub fn list_active_teams(&self) -> Result<Vec<Team>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT number, color, m1, m2, m3, m4, m5, m6, m7, f1, f2, f3, active
                 FROM teams WHERE active = 1 ORDER BY number",
            )
            .context("failed to prepare list_active_teams query")?;

        let teams = stmt
            .query_map([], |row| {
                Ok(Team {
                    number: row.get(0)?,
                    color: row.get(1)?,
                    players: [
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                        row.get(8)?,
                        row.get(9)?,
                        row.get(10)?,
                        row.get(11)?,
                    ],
                    active: row.get(12)?,
                })
            })
            .context("failed to query teams")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to map team rows")?;

        Ok(teams)
    }

    // ------------------------------------------------------------------
    // Participants
    // ------------------------------------------------------------------

    /// Register a participant. The id is a slug of the display name
    /// (lowercased, whitespace collapsed to underscores), so re-registering
    /// the same name overwrites the existing row.
    pub fn upsert_participant(&self, name: &str, credits: i64) -> Result<String> {
        let id = participant_slug(name);
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO participants (id, name, credits) VALUES (?1, ?2, ?3)",
            params![id, name, credits],
        )
        .context("failed to upsert participant")?;
        Ok(id)
    }

    pub fn delete_participant(&self, id: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM participants WHERE id = ?1", params![id])
            .context("failed to delete participant")?;
        Ok(())
    }

    pub fn list_active_participants(&self) -> Result<Vec<Participant>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, name, credits, total_points, active
                 FROM participants WHERE active = 1 ORDER BY name",
            )
            .context("failed to prepare list_active_participants query")?;

        let participants = stmt
            .query_map([], |row| {
                Ok(Participant {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    credits: row.get(2)?,
                    total_points: row.get(3)?,
                    active: row.get(4)?,
                })
            })
            .context("failed to query participants")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to map participant rows")?;

        Ok(participants)
    }

    /// Look up a participant by id; `None` if unknown.
    pub fn participant(&self, id: &str) -> Result<Option<Participant>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, name, credits, total_points, active
                 FROM participants WHERE id = ?1",
            )
            .context("failed to prepare participant query")?;

        let mut rows = stmt
            .query_map(params![id], |row| {
                Ok(Participant {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    credits: row.get(2)?,
                    total_points: row.get(3)?,
                    active: row.get(4)?,
                })
            })
            .context("failed to query participant")?;

        match rows.next() {
            Some(row) => Ok(Some(row.context("failed to read participant row")?)),
            None => Ok(None),
        }
    }

    /// Current credit balance; `None` if the participant is unknown.
    pub fn participant_balance(&self, id: &str) -> Result<Option<i64>> {
        Ok(self.participant(id)?.map(|p| p.credits))
    }

    // ------------------------------------------------------------------
    // Slots
    // ------------------------------------------------------------------

    /// Destructively rebuild the slot table from the active teams: one slot
    /// per active team per position. Returns the number of slots created.
    ///
    /// Must not be called while a round is active; the engine holds slot
    /// snapshots for the round's duration.
    pub fn regenerate_slots(&self) -> Result<usize> {
        let teams = self.list_active_teams()?;

        let mut conn = self.conn();
        let tx = conn.transaction().context("failed to begin transaction")?;
        tx.execute("DELETE FROM auctions", [])
            .context("failed to clear auctions before slot rebuild")?;
        tx.execute("DELETE FROM slots", [])
            .context("failed to clear slots")?;

        let mut created = 0;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO slots (id, team_number, color, position, current_player)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .context("failed to prepare slot insert")?;

            for team in &teams {
                for position in Position::ALL {
                    let slot_id = slot_id(position, &team.color);
                    stmt.execute(params![
                        slot_id,
                        team.number,
                        team.color,
                        position.as_str(),
                        team.player_for(position),
                    ])
                    .context("failed to insert slot")?;
                    created += 1;
                }
            }
        }

        tx.commit().context("failed to commit slot rebuild")?;
        Ok(created)
    }

    pub fn slot_info(&self, id: &str) -> Result<Option<Slot>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, team_number, color, position, current_player, total_points, active
                 FROM slots WHERE id = ?1",
            )
            .context("failed to prepare slot_info query")?;

        let mut rows = stmt
            .query_map(params![id], map_slot_row)
            .context("failed to query slot")?;

        match rows.next() {
            Some(row) => Ok(Some(row.context("failed to read slot row")?)),
            None => Ok(None),
        }
    }

    /// Active slots for a position that no one has won yet, ordered by id.
    pub fn list_unclaimed_slots(&self, position: Position) -> Result<Vec<Slot>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT s.id, s.team_number, s.color, s.position, s.current_player,
                        s.total_points, s.active
                 FROM slots s
                 WHERE s.position = ?1 AND s.active = 1
                   AND NOT EXISTS (
                       SELECT 1 FROM auctions a
                       WHERE a.slot_id = s.id AND a.winner = 1
                   )
                 ORDER BY s.id",
            )
            .context("failed to prepare list_unclaimed_slots query")?;

        let slots = stmt
            .query_map(params![position.as_str()], map_slot_row)
            .context("failed to query slots")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to map slot rows")?;

        Ok(slots)
    }

    // ------------------------------------------------------------------
    // Auction records
    // ------------------------------------------------------------------

    /// Persist a batch of sub-auction wins in one transaction: each win row
    /// is paired with the matching credit debit, so a win record never
    /// exists without its debit, and vice versa.
    pub fn record_round_wins(&self, round: &str, wins: &[WinRecord]) -> Result<()> {
        if wins.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn();
        let tx = conn.transaction().context("failed to begin transaction")?;

        for win in wins {
            tx.execute(
                "INSERT INTO auctions
                    (round, participant_id, slot_id, bid, final_cost, premium, winner, shared)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)",
                params![
                    round,
                    win.participant_id,
                    win.slot_id,
                    win.bid,
                    win.final_cost,
                    win.premium,
                    win.shared,
                ],
            )
            .with_context(|| format!("failed to record win for slot {}", win.slot_id))?;

            let updated = tx
                .execute(
                    "UPDATE participants SET credits = credits - ?1 WHERE id = ?2",
                    params![win.final_cost, win.participant_id],
                )
                .with_context(|| {
                    format!("failed to debit participant {}", win.participant_id)
                })?;
            if updated == 0 {
                // tx dropped here rolls everything back
                bail!("participant not found: {}", win.participant_id);
            }
        }

        tx.commit().context("failed to commit auction wins")?;
        Ok(())
    }

    /// Winning rows for a round, joined with display data, highest cost first.
    pub fn wins_for_round(&self, round: &str) -> Result<Vec<AuctionWin>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT a.round, a.participant_id, p.name, a.slot_id, a.bid, a.final_cost,
                        a.premium, a.shared, s.current_player, s.color
                 FROM auctions a
                 JOIN participants p ON a.participant_id = p.id
                 JOIN slots s ON a.slot_id = s.id
                 WHERE a.round = ?1 AND a.winner = 1
                 ORDER BY a.final_cost DESC",
            )
            .context("failed to prepare wins_for_round query")?;

        let wins = stmt
            .query_map(params![round], |row| {
                Ok(AuctionWin {
                    round: row.get(0)?,
                    participant_id: row.get(1)?,
                    participant_name: row.get(2)?,
                    slot_id: row.get(3)?,
                    bid: row.get(4)?,
                    final_cost: row.get(5)?,
                    premium: row.get(6)?,
                    shared: row.get(7)?,
                    player: row.get(8)?,
                    color: row.get(9)?,
                })
            })
            .context("failed to query wins")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to map win rows")?;

        Ok(wins)
    }

    /// The slots a participant has won so far, with cost and points.
    pub fn participant_roster(&self, id: &str) -> Result<Vec<RosterEntry>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT a.slot_id, s.position, s.current_player, s.color, a.final_cost,
                        s.total_points
                 FROM auctions a
                 JOIN slots s ON a.slot_id = s.id
                 WHERE a.participant_id = ?1 AND a.winner = 1
                 ORDER BY s.position",
            )
            .context("failed to prepare participant_roster query")?;

        let roster = stmt
            .query_map(params![id], |row| {
                Ok(RosterEntry {
                    slot_id: row.get(0)?,
                    position: row.get(1)?,
                    player: row.get(2)?,
                    color: row.get(3)?,
                    final_cost: row.get(4)?,
                    slot_points: row.get(5)?,
                })
            })
            .context("failed to query roster")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to map roster rows")?;

        Ok(roster)
    }

    /// League table: every participant with players won, points, and spend,
    /// ranked by points descending then spend ascending.
    pub fn standings(&self) -> Result<Vec<StandingsRow>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT p.id, p.name, p.credits,
                        COUNT(a.id) as players_won,
                        COALESCE(SUM(s.total_points), 0) as total_points,
                        COALESCE(SUM(a.final_cost), 0) as credits_spent
                 FROM participants p
                 LEFT JOIN auctions a ON p.id = a.participant_id AND a.winner = 1
                 LEFT JOIN slots s ON a.slot_id = s.id
                 GROUP BY p.id, p.name, p.credits
                 ORDER BY total_points DESC, credits_spent ASC",
            )
            .context("failed to prepare standings query")?;

        let rows = stmt
            .query_map([], |row| {
                Ok(StandingsRow {
                    rank: 0,
                    participant_id: row.get(0)?,
                    name: row.get(1)?,
                    credits: row.get(2)?,
                    players_won: row.get(3)?,
                    total_points: row.get(4)?,
                    credits_spent: row.get(5)?,
                })
            })
            .context("failed to query standings")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to map standings rows")?;

        let mut standings = rows;
        for (idx, row) in standings.iter_mut().enumerate() {
            row.rank = idx + 1;
        }
        Ok(standings)
    }

    // ------------------------------------------------------------------
    // Resets
    // ------------------------------------------------------------------

    /// Clear all auction records, restore every participant's balance to
    /// `initial_credits`, and zero all accumulated scores. Team, participant,
    /// and slot rows are preserved.
    pub fn reset_auctions(&self, initial_credits: i64) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction().context("failed to begin transaction")?;
        tx.execute("DELETE FROM auctions", [])
            .context("failed to delete auctions")?;
        tx.execute(
            "UPDATE participants SET credits = ?1, total_points = 0",
            params![initial_credits],
        )
        .context("failed to restore participant credits")?;
        tx.execute("UPDATE slots SET total_points = 0", [])
            .context("failed to reset slot points")?;
        tx.commit().context("failed to commit auction reset")?;
        Ok(())
    }

    /// Clear everything: auctions, participants, slots, and teams.
    pub fn reset_full(&self) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction().context("failed to begin transaction")?;
        tx.execute("DELETE FROM auctions", [])
            .context("failed to delete auctions")?;
        tx.execute("DELETE FROM slots", [])
            .context("failed to delete slots")?;
        tx.execute("DELETE FROM participants", [])
            .context("failed to delete participants")?;
        tx.execute("DELETE FROM teams", [])
            .context("failed to delete teams")?;
        tx.commit().context("failed to commit full reset")?;
        Ok(())
    }
}

/// Slot identity: `{POSITION}_{COLOR_IN_UPPERCASE}`, e.g. `M1_RED`.
pub fn slot_id(position: Position, color: &str) -> String {
    format!("{}_{}", position.as_str(), color.to_uppercase())
}

/// Participant identity: display name lowercased with whitespace runs
/// collapsed to underscores.
pub fn participant_slug(name: &str) -> String {
    name.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

fn map_slot_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Slot> {
    Ok(Slot {
        id: row.get(0)?,
        team_number: row.get(1)?,
        color: row.get(2)?,
        position: row.get(3)?,
        current_player: row.get(4)?,
        total_points: row.get(5)?,
        active: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper: create a fresh in-memory database for each test.
    fn test_db() -> Database {
        Database::open(":memory:").expect("in-memory database should open")
    }

    /// Helper: a team with all ten players named `{COLOR} {POS}`.
    fn sample_team(number: i64, color: &str) -> Team {
        let players = Position::ALL
            .iter()
            .map(|p| Some(format!("{color} {p}")))
            .collect::<Vec<_>>()
            .try_into()
            .unwrap();
        Team {
            number,
            color: color.to_string(),
            players,
            active: true,
        }
    }

    fn seed_game(db: &Database) {
        db.upsert_team(&sample_team(1, "red")).unwrap();
        db.upsert_team(&sample_team(2, "blue")).unwrap();
        db.regenerate_slots().unwrap();
        db.upsert_participant("Alice", 2000).unwrap();
        db.upsert_participant("Bob", 2000).unwrap();
    }

    // ------------------------------------------------------------------
    // Schema / open
    // ------------------------------------------------------------------

    #[test]
    fn open_creates_tables() {
        let db = test_db();
        let conn = db.conn();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"teams".to_string()));
        assert!(tables.contains(&"participants".to_string()));
        assert!(tables.contains(&"slots".to_string()));
        assert!(tables.contains(&"auctions".to_string()));
    }

    // ------------------------------------------------------------------
    // Teams and slots
    // ------------------------------------------------------------------

    #[test]
    fn upsert_and_list_teams() {
        let db = test_db();
        db.upsert_team(&sample_team(1, "red")).unwrap();
        db.upsert_team(&sample_team(2, "blue")).unwrap();

        let teams = db.list_active_teams().unwrap();
        assert_eq!(teams.len(), 2);
        assert_eq!(teams[0].number, 1);
        assert_eq!(teams[0].color, "red");
        assert_eq!(teams[0].player_for(Position::M1), Some("red M1"));
        assert_eq!(teams[1].player_for(Position::F3), Some("blue F3"));
    }

    #[test]
    fn inactive_teams_excluded() {
        let db = test_db();
        db.upsert_team(&sample_team(1, "red")).unwrap();
        let mut inactive = sample_team(2, "blue");
        inactive.active = false;
        db.upsert_team(&inactive).unwrap();

        let teams = db.list_active_teams().unwrap();
        assert_eq!(teams.len(), 1);
        assert_eq!(teams[0].color, "red");
    }

    #[test]
    fn regenerate_slots_builds_full_grid() {
        let db = test_db();
        db.upsert_team(&sample_team(1, "red")).unwrap();
        db.upsert_team(&sample_team(2, "blue")).unwrap();

        let created = db.regenerate_slots().unwrap();
        assert_eq!(created, 20); // 2 teams x 10 positions

        let m1 = db.list_unclaimed_slots(Position::M1).unwrap();
        assert_eq!(m1.len(), 2);
        assert_eq!(m1[0].id, "M1_BLUE");
        assert_eq!(m1[1].id, "M1_RED");
        assert_eq!(m1[1].current_player.as_deref(), Some("red M1"));
    }

    #[test]
    fn regenerate_slots_is_destructive() {
        let db = test_db();
        seed_game(&db);

        // Claim a slot, then rebuild: the claim must be gone.
        db.record_round_wins(
            "M1",
            &[WinRecord {
                participant_id: "alice".to_string(),
                slot_id: "M1_RED".to_string(),
                bid: 100,
                final_cost: 100,
                premium: 0.0,
                shared: false,
            }],
        )
        .unwrap();
        assert_eq!(db.list_unclaimed_slots(Position::M1).unwrap().len(), 1);

        db.regenerate_slots().unwrap();
        assert_eq!(db.list_unclaimed_slots(Position::M1).unwrap().len(), 2);
        assert!(db.wins_for_round("M1").unwrap().is_empty());
    }

    #[test]
    fn slot_info_round_trip() {
        let db = test_db();
        seed_game(&db);

        let slot = db.slot_info("F2_BLUE").unwrap().unwrap();
        assert_eq!(slot.position, "F2");
        assert_eq!(slot.team_number, 2);
        assert_eq!(slot.current_player.as_deref(), Some("blue F2"));

        assert!(db.slot_info("F2_GREEN").unwrap().is_none());
    }

    // ------------------------------------------------------------------
    // Participants
    // ------------------------------------------------------------------

    #[test]
    fn participant_slug_normalizes_names() {
        assert_eq!(participant_slug("Mario Rossi"), "mario_rossi");
        assert_eq!(participant_slug("  Anna   Bianchi "), "anna_bianchi");
    }

    #[test]
    fn upsert_participant_returns_slug_id() {
        let db = test_db();
        let id = db.upsert_participant("Mario Rossi", 2000).unwrap();
        assert_eq!(id, "mario_rossi");

        let participant = db.participant("mario_rossi").unwrap().unwrap();
        assert_eq!(participant.name, "Mario Rossi");
        assert_eq!(participant.credits, 2000);
        assert!(participant.active);
    }

    #[test]
    fn participant_balance_none_for_unknown() {
        let db = test_db();
        assert!(db.participant_balance("nobody").unwrap().is_none());
    }

    // ------------------------------------------------------------------
    // Auction records
    // ------------------------------------------------------------------

    #[test]
    fn record_round_wins_pairs_row_with_debit() {
        let db = test_db();
        seed_game(&db);

        db.record_round_wins(
            "M1",
            &[
                WinRecord {
                    participant_id: "alice".to_string(),
                    slot_id: "M1_RED".to_string(),
                    bid: 150,
                    final_cost: 150,
                    premium: 0.0,
                    shared: false,
                },
                WinRecord {
                    participant_id: "bob".to_string(),
                    slot_id: "M1_BLUE".to_string(),
                    bid: 80,
                    final_cost: 80,
                    premium: 0.0,
                    shared: false,
                },
            ],
        )
        .unwrap();

        assert_eq!(db.participant_balance("alice").unwrap(), Some(1850));
        assert_eq!(db.participant_balance("bob").unwrap(), Some(1920));

        let wins = db.wins_for_round("M1").unwrap();
        assert_eq!(wins.len(), 2);
        assert_eq!(wins[0].slot_id, "M1_RED"); // highest cost first
        assert_eq!(wins[0].participant_name, "Alice");
        assert_eq!(wins[0].premium, 0.0);
        assert!(!wins[0].shared);
    }

    #[test]
    fn record_round_wins_rolls_back_on_unknown_participant() {
        let db = test_db();
        seed_game(&db);

        let result = db.record_round_wins(
            "M1",
            &[
                WinRecord {
                    participant_id: "alice".to_string(),
                    slot_id: "M1_RED".to_string(),
                    bid: 150,
                    final_cost: 150,
                    premium: 0.0,
                    shared: false,
                },
                WinRecord {
                    participant_id: "ghost".to_string(),
                    slot_id: "M1_BLUE".to_string(),
                    bid: 80,
                    final_cost: 80,
                    premium: 0.0,
                    shared: false,
                },
            ],
        );
        assert!(result.is_err());

        // Neither the win nor the debit of the first record survives.
        assert_eq!(db.participant_balance("alice").unwrap(), Some(2000));
        assert!(db.wins_for_round("M1").unwrap().is_empty());
    }

    #[test]
    fn claimed_slots_leave_unclaimed_list() {
        let db = test_db();
        seed_game(&db);

        db.record_round_wins(
            "M1",
            &[WinRecord {
                participant_id: "alice".to_string(),
                slot_id: "M1_RED".to_string(),
                bid: 100,
                final_cost: 100,
                premium: 0.0,
                shared: false,
            }],
        )
        .unwrap();

        let unclaimed = db.list_unclaimed_slots(Position::M1).unwrap();
        assert_eq!(unclaimed.len(), 1);
        assert_eq!(unclaimed[0].id, "M1_BLUE");

        // Other positions are untouched.
        assert_eq!(db.list_unclaimed_slots(Position::M2).unwrap().len(), 2);
    }

    #[test]
    fn participant_roster_lists_won_slots() {
        let db = test_db();
        seed_game(&db);

        db.record_round_wins(
            "M1",
            &[WinRecord {
                participant_id: "alice".to_string(),
                slot_id: "M1_RED".to_string(),
                bid: 100,
                final_cost: 100,
                premium: 0.0,
                shared: false,
            }],
        )
        .unwrap();
        db.record_round_wins(
            "F1",
            &[WinRecord {
                participant_id: "alice".to_string(),
                slot_id: "F1_BLUE".to_string(),
                bid: 60,
                final_cost: 60,
                premium: 0.0,
                shared: false,
            }],
        )
        .unwrap();

        let roster = db.participant_roster("alice").unwrap();
        assert_eq!(roster.len(), 2);
        assert_eq!(roster[0].slot_id, "F1_BLUE"); // ordered by position
        assert_eq!(roster[1].slot_id, "M1_RED");
        assert_eq!(roster[1].final_cost, 100);

        assert!(db.participant_roster("bob").unwrap().is_empty());
    }

    // ------------------------------------------------------------------
    // Standings
    // ------------------------------------------------------------------

    #[test]
    fn standings_rank_by_points_then_spend() {
        let db = test_db();
        seed_game(&db);

        db.record_round_wins(
            "M1",
            &[
                WinRecord {
                    participant_id: "alice".to_string(),
                    slot_id: "M1_RED".to_string(),
                    bid: 150,
                    final_cost: 150,
                    premium: 0.0,
                    shared: false,
                },
                WinRecord {
                    participant_id: "bob".to_string(),
                    slot_id: "M1_BLUE".to_string(),
                    bid: 80,
                    final_cost: 80,
                    premium: 0.0,
                    shared: false,
                },
            ],
        )
        .unwrap();

        // Equal points (all zero): the cheaper spender ranks first.
        let standings = db.standings().unwrap();
        assert_eq!(standings.len(), 2);
        assert_eq!(standings[0].participant_id, "bob");
        assert_eq!(standings[0].rank, 1);
        assert_eq!(standings[0].credits_spent, 80);
        assert_eq!(standings[0].players_won, 1);
        assert_eq!(standings[1].participant_id, "alice");
        assert_eq!(standings[1].rank, 2);

        // Give Alice's slot some points: she overtakes despite higher spend.
        db.conn()
            .execute("UPDATE slots SET total_points = 5 WHERE id = 'M1_RED'", [])
            .unwrap();
        let standings = db.standings().unwrap();
        assert_eq!(standings[0].participant_id, "alice");
        assert_eq!(standings[0].total_points, 5);
    }

    // ------------------------------------------------------------------
    // Resets
    // ------------------------------------------------------------------

    #[test]
    fn reset_auctions_restores_credits_and_zeroes_points() {
        let db = test_db();
        seed_game(&db);

        db.record_round_wins(
            "M1",
            &[WinRecord {
                participant_id: "alice".to_string(),
                slot_id: "M1_RED".to_string(),
                bid: 300,
                final_cost: 300,
                premium: 0.0,
                shared: false,
            }],
        )
        .unwrap();
        db.conn()
            .execute("UPDATE slots SET total_points = 7 WHERE id = 'M1_RED'", [])
            .unwrap();
        assert_eq!(db.participant_balance("alice").unwrap(), Some(1700));

        db.reset_auctions(2000).unwrap();

        assert_eq!(db.participant_balance("alice").unwrap(), Some(2000));
        assert!(db.wins_for_round("M1").unwrap().is_empty());
        assert_eq!(db.slot_info("M1_RED").unwrap().unwrap().total_points, 0);
        // Rows themselves survive.
        assert_eq!(db.list_active_participants().unwrap().len(), 2);
        assert_eq!(db.list_active_teams().unwrap().len(), 2);
        assert_eq!(db.list_unclaimed_slots(Position::M1).unwrap().len(), 2);
    }

    #[test]
    fn reset_full_clears_everything() {
        let db = test_db();
        seed_game(&db);

        db.reset_full().unwrap();

        assert!(db.list_active_teams().unwrap().is_empty());
        assert!(db.list_active_participants().unwrap().is_empty());
        assert!(db.list_unclaimed_slots(Position::M1).unwrap().is_empty());
    }

    #[test]
    fn slot_id_format() {
        assert_eq!(slot_id(Position::M1, "red"), "M1_RED");
        assert_eq!(slot_id(Position::F3, "Blue"), "F3_BLUE");
    }
}
