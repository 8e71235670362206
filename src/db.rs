//! SQLite storage for games, state blobs, transcripts, checkpoints, votes,
//! LLM traces and the seed tables.
//!
//! A single connection behind a mutex serializes all access; event handlers
//! run their writes inside one immediate transaction, which is what gives
//! per-game advances their atomicity and total order.

use crate::state::{GameState, InitialStances, IssueOption, OpeningVariant};
use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Mutex;
use uuid::Uuid;
use chrono::Utc;

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

fn json_column_err(err: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GameRow {
    pub id: String,
    pub user_id: Option<String>,
    pub human_role_id: Option<String>,
    pub status: String,
    pub seed: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TranscriptEntry {
    pub id: String,
    pub game_id: String,
    pub role_id: String,
    pub phase: String,
    pub round: Option<i64>,
    pub issue_id: Option<String>,
    pub visible_to_human: bool,
    pub content: String,
    pub metadata: Option<Value>,
    pub created_at: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CheckpointRow {
    pub id: String,
    pub game_id: String,
    pub transcript_entry_id: Option<String>,
    pub status: String,
    pub created_at: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct VoteRow {
    pub id: String,
    pub game_id: String,
    pub issue_id: String,
    pub proposal_option_id: String,
    pub votes_by_country: Value,
    pub passed: bool,
    pub created_at: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmTraceRow {
    pub id: String,
    pub game_id: String,
    pub role_id: String,
    pub status: String,
    pub provider: String,
    pub model: String,
    pub prompt_version: String,
    pub request_payload: Option<Value>,
    pub response_payload: Option<Value>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct IssueDefinition {
    pub id: String,
    pub title: String,
    pub description: String,
    pub options: Vec<IssueOption>,
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn new(path: &str) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS games (
                id TEXT PRIMARY KEY,
                user_id TEXT,
                human_role_id TEXT,
                status TEXT NOT NULL,
                seed INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id)
            );
            CREATE TABLE IF NOT EXISTS game_state (
                game_id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (game_id) REFERENCES games(id)
            );
            CREATE TABLE IF NOT EXISTS transcript_entries (
                id TEXT PRIMARY KEY,
                game_id TEXT NOT NULL,
                role_id TEXT NOT NULL,
                phase TEXT NOT NULL,
                round INTEGER,
                issue_id TEXT,
                visible_to_human INTEGER NOT NULL DEFAULT 1,
                content TEXT NOT NULL,
                metadata TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (game_id) REFERENCES games(id)
            );
            CREATE TABLE IF NOT EXISTS checkpoints (
                id TEXT PRIMARY KEY,
                game_id TEXT NOT NULL,
                transcript_entry_id TEXT,
                status TEXT NOT NULL,
                state_snapshot TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (game_id) REFERENCES games(id)
            );
            CREATE TABLE IF NOT EXISTS votes (
                id TEXT PRIMARY KEY,
                game_id TEXT NOT NULL,
                issue_id TEXT NOT NULL,
                proposal_option_id TEXT NOT NULL,
                votes_by_country TEXT NOT NULL,
                passed INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (game_id) REFERENCES games(id)
            );
            CREATE TABLE IF NOT EXISTS llm_traces (
                id TEXT PRIMARY KEY,
                game_id TEXT NOT NULL,
                role_id TEXT NOT NULL,
                status TEXT NOT NULL,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                prompt_version TEXT NOT NULL,
                request_payload TEXT,
                response_payload TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (game_id) REFERENCES games(id)
            );
            CREATE TABLE IF NOT EXISTS opening_variants (
                id TEXT PRIMARY KEY,
                role_id TEXT NOT NULL,
                opening_text TEXT NOT NULL,
                initial_stances TEXT
            );
            CREATE TABLE IF NOT EXISTS issue_definitions (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                options TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS japan_scripts (
                script_key TEXT PRIMARY KEY,
                template TEXT NOT NULL
            );
            ",
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Run `f` inside one immediate transaction. An error from `f` rolls
    /// the whole transaction back.
    pub fn transaction<T, E>(&self, f: impl FnOnce(&Transaction) -> Result<T, E>) -> Result<T, E>
    where
        E: From<rusqlite::Error>,
    {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(E::from)?;
        match f(&tx) {
            Ok(value) => {
                tx.commit().map_err(E::from)?;
                Ok(value)
            }
            Err(err) => Err(err),
        }
    }

    /// Run `f` with the connection for plain reads.
    pub fn read<T, E>(&self, f: impl FnOnce(&Connection) -> Result<T, E>) -> Result<T, E> {
        let conn = self.conn.lock().unwrap();
        f(&conn)
    }
}

// ── users / games / state ──

pub fn ensure_user(conn: &Connection, user_id: Option<&str>) -> Result<String, rusqlite::Error> {
    if let Some(id) = user_id {
        let existing: Option<String> = conn
            .query_row("SELECT id FROM users WHERE id = ?1", params![id], |row| row.get(0))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        if let Some(found) = existing {
            return Ok(found);
        }
    }
    let id = user_id
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    conn.execute(
        "INSERT INTO users (id, display_name, created_at) VALUES (?1, 'anonymous', ?2)",
        params![id, now_iso()],
    )?;
    Ok(id)
}

pub fn insert_game(conn: &Connection, user_id: &str, seed: i64) -> Result<GameRow, rusqlite::Error> {
    let id = Uuid::new_v4().to_string();
    let now = now_iso();
    conn.execute(
        "INSERT INTO games (id, user_id, human_role_id, status, seed, created_at, updated_at)
         VALUES (?1, ?2, NULL, 'ROLE_SELECTION', ?3, ?4, ?5)",
        params![id, user_id, seed, now, now],
    )?;
    Ok(GameRow {
        id,
        user_id: Some(user_id.to_string()),
        human_role_id: None,
        status: "ROLE_SELECTION".to_string(),
        seed,
        created_at: now.clone(),
        updated_at: now,
    })
}

pub fn fetch_game(conn: &Connection, game_id: &str) -> Result<Option<GameRow>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, human_role_id, status, seed, created_at, updated_at FROM games WHERE id = ?1",
    )?;
    let mut rows = stmt.query_map(params![game_id], |row| {
        Ok(GameRow {
            id: row.get(0)?,
            user_id: row.get(1)?,
            human_role_id: row.get(2)?,
            status: row.get(3)?,
            seed: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    })?;
    match rows.next() {
        Some(row) => Ok(Some(row?)),
        None => Ok(None),
    }
}

pub fn fetch_game_with_state(
    conn: &Connection,
    game_id: &str,
) -> Result<Option<(GameRow, GameState)>, rusqlite::Error> {
    let Some(game) = fetch_game(conn, game_id)? else {
        return Ok(None);
    };
    let state_json: Option<String> = conn
        .query_row(
            "SELECT state FROM game_state WHERE game_id = ?1",
            params![game_id],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    let Some(state_json) = state_json else {
        return Ok(None);
    };
    let state: GameState = serde_json::from_str(&state_json).map_err(json_column_err)?;
    Ok(Some((game, state)))
}

pub fn game_exists(conn: &Connection, game_id: &str) -> Result<bool, rusqlite::Error> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM games WHERE id = ?1",
        params![game_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn insert_game_state(
    conn: &Connection,
    game_id: &str,
    state: &GameState,
) -> Result<(), rusqlite::Error> {
    let json = serde_json::to_string(state).map_err(json_column_err)?;
    conn.execute(
        "INSERT INTO game_state (game_id, state, updated_at) VALUES (?1, ?2, ?3)",
        params![game_id, json, now_iso()],
    )?;
    Ok(())
}

pub fn update_game_state(
    conn: &Connection,
    game_id: &str,
    state: &GameState,
) -> Result<(), rusqlite::Error> {
    let json = serde_json::to_string(state).map_err(json_column_err)?;
    conn.execute(
        "UPDATE game_state SET state = ?1, updated_at = ?2 WHERE game_id = ?3",
        params![json, now_iso(), game_id],
    )?;
    Ok(())
}

pub fn update_game_status(
    conn: &Connection,
    game_id: &str,
    status: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE games SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status, now_iso(), game_id],
    )?;
    Ok(())
}

pub fn update_game_human_role(
    conn: &Connection,
    game_id: &str,
    human_role_id: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE games SET human_role_id = ?1, updated_at = ?2 WHERE id = ?3",
        params![human_role_id, now_iso(), game_id],
    )?;
    Ok(())
}

pub fn update_game_seed(conn: &Connection, game_id: &str, seed: i64) -> Result<(), rusqlite::Error> {
    conn.execute("UPDATE games SET seed = ?1 WHERE id = ?2", params![seed, game_id])?;
    Ok(())
}

// ── transcript / checkpoints ──

pub struct NewTranscriptEntry<'a> {
    pub game_id: &'a str,
    pub role_id: &'a str,
    pub phase: &'a str,
    pub content: &'a str,
    pub visible_to_human: bool,
    pub round: Option<i64>,
    pub issue_id: Option<&'a str>,
    pub metadata: Option<Value>,
}

pub fn insert_transcript_entry(
    conn: &Connection,
    entry: NewTranscriptEntry,
) -> Result<TranscriptEntry, rusqlite::Error> {
    let id = Uuid::new_v4().to_string();
    let now = now_iso();
    let metadata_json = match &entry.metadata {
        Some(value) => Some(serde_json::to_string(value).map_err(json_column_err)?),
        None => None,
    };
    conn.execute(
        "INSERT INTO transcript_entries
         (id, game_id, role_id, phase, round, issue_id, visible_to_human, content, metadata, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            id,
            entry.game_id,
            entry.role_id,
            entry.phase,
            entry.round,
            entry.issue_id,
            entry.visible_to_human as i64,
            entry.content,
            metadata_json,
            now
        ],
    )?;
    Ok(TranscriptEntry {
        id,
        game_id: entry.game_id.to_string(),
        role_id: entry.role_id.to_string(),
        phase: entry.phase.to_string(),
        round: entry.round,
        issue_id: entry.issue_id.map(|s| s.to_string()),
        visible_to_human: entry.visible_to_human,
        content: entry.content.to_string(),
        metadata: entry.metadata,
        created_at: now,
    })
}

fn transcript_row(row: &rusqlite::Row) -> Result<TranscriptEntry, rusqlite::Error> {
    let metadata_json: Option<String> = row.get(8)?;
    let metadata = match metadata_json {
        Some(json) => Some(serde_json::from_str(&json).map_err(json_column_err)?),
        None => None,
    };
    Ok(TranscriptEntry {
        id: row.get(0)?,
        game_id: row.get(1)?,
        role_id: row.get(2)?,
        phase: row.get(3)?,
        round: row.get(4)?,
        issue_id: row.get(5)?,
        visible_to_human: row.get::<_, i64>(6)? != 0,
        content: row.get(7)?,
        metadata,
        created_at: row.get(9)?,
    })
}

const TRANSCRIPT_ORDER: &str =
    "ORDER BY created_at ASC, COALESCE(json_extract(metadata, '$.index'), 0) ASC, id ASC";

/// Transcript rows in their total order, optionally filtered by visibility.
pub fn fetch_transcript(
    conn: &Connection,
    game_id: &str,
    visible_to_human: Option<bool>,
) -> Result<Vec<TranscriptEntry>, rusqlite::Error> {
    let base = "SELECT id, game_id, role_id, phase, round, issue_id, visible_to_human, content, metadata, created_at
         FROM transcript_entries WHERE game_id = ?1";
    let entries = match visible_to_human {
        Some(visible) => {
            let sql = format!("{} AND visible_to_human = ?2 {}", base, TRANSCRIPT_ORDER);
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![game_id, visible as i64], |row| transcript_row(row))?;
            rows.collect::<Result<Vec<_>, _>>()?
        }
        None => {
            let sql = format!("{} {}", base, TRANSCRIPT_ORDER);
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![game_id], |row| transcript_row(row))?;
            rows.collect::<Result<Vec<_>, _>>()?
        }
    };
    Ok(entries)
}

/// Review view: hide non-visible Round-2 rows, keep everything else.
pub fn fetch_review_transcript(
    conn: &Connection,
    game_id: &str,
) -> Result<Vec<TranscriptEntry>, rusqlite::Error> {
    let sql = format!(
        "SELECT id, game_id, role_id, phase, round, issue_id, visible_to_human, content, metadata, created_at
         FROM transcript_entries
         WHERE game_id = ?1 AND (round IS NULL OR round != 2 OR visible_to_human = 1)
         {}",
        TRANSCRIPT_ORDER
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![game_id], |row| transcript_row(row))?;
    rows.collect()
}

pub fn insert_checkpoint(
    conn: &Connection,
    game_id: &str,
    transcript_entry_id: Option<&str>,
    status: &str,
    state_snapshot: &str,
) -> Result<CheckpointRow, rusqlite::Error> {
    let id = Uuid::new_v4().to_string();
    let now = now_iso();
    conn.execute(
        "INSERT INTO checkpoints (id, game_id, transcript_entry_id, status, state_snapshot, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![id, game_id, transcript_entry_id, status, state_snapshot, now],
    )?;
    Ok(CheckpointRow {
        id,
        game_id: game_id.to_string(),
        transcript_entry_id: transcript_entry_id.map(|s| s.to_string()),
        status: status.to_string(),
        created_at: now,
    })
}

pub fn count_rows(conn: &Connection, table: &str, game_id: &str) -> Result<i64, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT COUNT(*) FROM {} WHERE game_id = ?1", table),
        params![game_id],
        |row| row.get(0),
    )
}

// ── votes / traces ──

pub fn insert_vote(
    conn: &Connection,
    game_id: &str,
    issue_id: &str,
    proposal_option_id: &str,
    votes_by_country: &Value,
    passed: bool,
) -> Result<VoteRow, rusqlite::Error> {
    let id = Uuid::new_v4().to_string();
    let now = now_iso();
    let votes_json = serde_json::to_string(votes_by_country).map_err(json_column_err)?;
    conn.execute(
        "INSERT INTO votes (id, game_id, issue_id, proposal_option_id, votes_by_country, passed, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![id, game_id, issue_id, proposal_option_id, votes_json, passed as i64, now],
    )?;
    Ok(VoteRow {
        id,
        game_id: game_id.to_string(),
        issue_id: issue_id.to_string(),
        proposal_option_id: proposal_option_id.to_string(),
        votes_by_country: votes_by_country.clone(),
        passed,
        created_at: now,
    })
}

pub fn fetch_votes(conn: &Connection, game_id: &str) -> Result<Vec<VoteRow>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, game_id, issue_id, proposal_option_id, votes_by_country, passed, created_at
         FROM votes WHERE game_id = ?1 ORDER BY created_at ASC, id ASC",
    )?;
    let rows = stmt.query_map(params![game_id], |row| {
        let votes_json: String = row.get(4)?;
        Ok(VoteRow {
            id: row.get(0)?,
            game_id: row.get(1)?,
            issue_id: row.get(2)?,
            proposal_option_id: row.get(3)?,
            votes_by_country: serde_json::from_str(&votes_json).map_err(json_column_err)?,
            passed: row.get::<_, i64>(5)? != 0,
            created_at: row.get(6)?,
        })
    })?;
    rows.collect()
}

pub struct NewLlmTrace<'a> {
    pub game_id: &'a str,
    pub role_id: &'a str,
    pub status: &'a str,
    pub provider: &'a str,
    pub model: &'a str,
    pub prompt_version: &'a str,
    pub request_payload: Option<Value>,
    pub response_payload: Option<Value>,
}

pub fn insert_llm_trace(conn: &Connection, trace: NewLlmTrace) -> Result<(), rusqlite::Error> {
    let request_json = match &trace.request_payload {
        Some(value) => Some(serde_json::to_string(value).map_err(json_column_err)?),
        None => None,
    };
    let response_json = match &trace.response_payload {
        Some(value) => Some(serde_json::to_string(value).map_err(json_column_err)?),
        None => None,
    };
    conn.execute(
        "INSERT INTO llm_traces
         (id, game_id, role_id, status, provider, model, prompt_version, request_payload, response_payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            Uuid::new_v4().to_string(),
            trace.game_id,
            trace.role_id,
            trace.status,
            trace.provider,
            trace.model,
            trace.prompt_version,
            request_json,
            response_json,
            now_iso()
        ],
    )?;
    Ok(())
}

pub fn fetch_llm_traces(
    conn: &Connection,
    game_id: &str,
) -> Result<Vec<LlmTraceRow>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, game_id, role_id, status, provider, model, prompt_version, request_payload, response_payload, created_at
         FROM llm_traces WHERE game_id = ?1 ORDER BY created_at ASC, id ASC",
    )?;
    let rows = stmt.query_map(params![game_id], |row| {
        let request_json: Option<String> = row.get(7)?;
        let response_json: Option<String> = row.get(8)?;
        let request_payload = match request_json {
            Some(json) => Some(serde_json::from_str(&json).map_err(json_column_err)?),
            None => None,
        };
        let response_payload = match response_json {
            Some(json) => Some(serde_json::from_str(&json).map_err(json_column_err)?),
            None => None,
        };
        Ok(LlmTraceRow {
            id: row.get(0)?,
            game_id: row.get(1)?,
            role_id: row.get(2)?,
            status: row.get(3)?,
            provider: row.get(4)?,
            model: row.get(5)?,
            prompt_version: row.get(6)?,
            request_payload,
            response_payload,
            created_at: row.get(9)?,
        })
    })?;
    rows.collect()
}

// ── seed tables ──

pub fn fetch_japan_script(
    conn: &Connection,
    script_key: &str,
) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT template FROM japan_scripts WHERE script_key = ?1",
        params![script_key],
        |row| row.get(0),
    )
    .map(Some)
    .or_else(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        other => Err(other),
    })
}

fn issue_definition_row(row: &rusqlite::Row) -> Result<IssueDefinition, rusqlite::Error> {
    let options_json: String = row.get(3)?;
    let mut options: Vec<IssueOption> =
        serde_json::from_str(&options_json).map_err(json_column_err)?;
    options.sort_by(|a, b| a.option_id.cmp(&b.option_id));
    Ok(IssueDefinition {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        options,
    })
}

pub fn fetch_issue_definition(
    conn: &Connection,
    issue_id: &str,
) -> Result<Option<IssueDefinition>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, title, description, options FROM issue_definitions WHERE id = ?1",
    )?;
    let mut rows = stmt.query_map(params![issue_id], |row| issue_definition_row(row))?;
    match rows.next() {
        Some(row) => Ok(Some(row?)),
        None => Ok(None),
    }
}

pub fn fetch_issue_definitions(conn: &Connection) -> Result<Vec<IssueDefinition>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, title, description, options FROM issue_definitions ORDER BY id ASC",
    )?;
    let rows = stmt.query_map([], |row| issue_definition_row(row))?;
    rows.collect()
}

pub fn fetch_opening_variants(conn: &Connection) -> Result<Vec<OpeningVariant>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, role_id, opening_text, initial_stances FROM opening_variants ORDER BY role_id ASC, id ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        let stances_json: Option<String> = row.get(3)?;
        let initial_stances: Option<InitialStances> = match stances_json {
            Some(json) => Some(serde_json::from_str(&json).map_err(json_column_err)?),
            None => None,
        };
        Ok(OpeningVariant {
            id: row.get(0)?,
            role_id: row.get(1)?,
            opening_text: row.get(2)?,
            initial_stances,
        })
    })?;
    rows.collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::initial_state;
    use serde_json::json;

    fn new_test_db() -> Database {
        Database::new(":memory:").expect("in-memory database should initialize")
    }

    #[test]
    fn integration_game_and_state_round_trip() {
        let db = new_test_db();
        let (game, state) = db
            .transaction::<_, rusqlite::Error>(|tx| {
                let user_id = ensure_user(tx, None)?;
                let game = insert_game(tx, &user_id, 1234)?;
                let mut state = initial_state();
                state.game_id = Some(game.id.clone());
                insert_game_state(tx, &game.id, &state)?;
                Ok((game, state))
            })
            .expect("game should be created");

        let loaded = db
            .read(|conn| fetch_game_with_state(conn, &game.id))
            .expect("load should succeed")
            .expect("game should exist");
        assert_eq!(loaded.0.seed, 1234);
        assert_eq!(loaded.1.roles.len(), state.roles.len());
        assert!(db.read(|conn| game_exists(conn, &game.id)).expect("exists query"));
        assert!(!db.read(|conn| game_exists(conn, "missing")).expect("exists query"));
    }

    #[test]
    fn integration_transcript_orders_by_timestamp_index_then_id() {
        let db = new_test_db();
        let game = db
            .transaction::<_, rusqlite::Error>(|tx| {
                let user_id = ensure_user(tx, None)?;
                insert_game(tx, &user_id, 1)
            })
            .expect("game should be created");

        // Same created_at for every row: only metadata.index and id order them.
        db.read(|conn| -> Result<(), rusqlite::Error> {
            let fixed_ts = "2020-01-01T00:00:00+00:00";
            for (entry_id, content, index) in [
                ("b-row", "msg1", 2i64),
                ("a-row", "msg0", 1i64),
                ("c-row", "msg2", 3i64),
            ] {
                conn.execute(
                    "INSERT INTO transcript_entries
                     (id, game_id, role_id, phase, round, issue_id, visible_to_human, content, metadata, created_at)
                     VALUES (?1, ?2, 'USA', 'ROUND_2', 2, NULL, 1, ?3, ?4, ?5)",
                    params![
                        entry_id,
                        game.id,
                        content,
                        json!({"index": index}).to_string(),
                        fixed_ts
                    ],
                )?;
            }
            // No index at all coalesces to 0 and sorts first.
            conn.execute(
                "INSERT INTO transcript_entries
                 (id, game_id, role_id, phase, round, issue_id, visible_to_human, content, metadata, created_at)
                 VALUES ('d-row', ?1, 'USA', 'ROUND_2', 2, NULL, 1, 'no-index', NULL, '2020-01-01T00:00:00+00:00')",
                params![game.id],
            )?;
            Ok(())
        })
        .expect("rows should insert");

        let entries = db
            .read(|conn| fetch_transcript(conn, &game.id, None))
            .expect("transcript should load");
        let contents: Vec<&str> = entries.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["no-index", "msg0", "msg1", "msg2"]);
    }

    #[test]
    fn integration_visibility_filter_and_review_exclude_hidden_round2() {
        let db = new_test_db();
        let game = db
            .transaction::<_, rusqlite::Error>(|tx| {
                let user_id = ensure_user(tx, None)?;
                let game = insert_game(tx, &user_id, 1)?;
                insert_transcript_entry(
                    tx,
                    NewTranscriptEntry {
                        game_id: &game.id,
                        role_id: "JPN",
                        phase: "ROUND_1_OPENING_STATEMENTS",
                        content: "round1 open",
                        visible_to_human: true,
                        round: Some(1),
                        issue_id: None,
                        metadata: None,
                    },
                )?;
                insert_transcript_entry(
                    tx,
                    NewTranscriptEntry {
                        game_id: &game.id,
                        role_id: "BRA",
                        phase: "ROUND_2",
                        content: "hidden note",
                        visible_to_human: false,
                        round: Some(2),
                        issue_id: None,
                        metadata: None,
                    },
                )?;
                insert_transcript_entry(
                    tx,
                    NewTranscriptEntry {
                        game_id: &game.id,
                        role_id: "BRA",
                        phase: "ROUND_2",
                        content: "visible reply",
                        visible_to_human: true,
                        round: Some(2),
                        issue_id: None,
                        metadata: None,
                    },
                )?;
                Ok(game)
            })
            .expect("fixture rows should insert");

        let all = db
            .read(|conn| fetch_transcript(conn, &game.id, None))
            .expect("transcript should load");
        assert_eq!(all.len(), 3);

        let visible = db
            .read(|conn| fetch_transcript(conn, &game.id, Some(true)))
            .expect("filtered transcript should load");
        assert_eq!(visible.len(), 2);
        assert!(visible.iter().all(|e| e.visible_to_human));

        let review = db
            .read(|conn| fetch_review_transcript(conn, &game.id))
            .expect("review transcript should load");
        let contents: Vec<&str> = review.iter().map(|e| e.content.as_str()).collect();
        assert!(contents.contains(&"round1 open"));
        assert!(contents.contains(&"visible reply"));
        assert!(!contents.contains(&"hidden note"));
    }

    #[test]
    fn integration_failed_transaction_rolls_back_all_writes() {
        let db = new_test_db();
        let game = db
            .transaction::<_, rusqlite::Error>(|tx| {
                let user_id = ensure_user(tx, None)?;
                insert_game(tx, &user_id, 1)
            })
            .expect("game should be created");

        let result: Result<(), rusqlite::Error> = db.transaction(|tx| {
            insert_transcript_entry(
                tx,
                NewTranscriptEntry {
                    game_id: &game.id,
                    role_id: "JPN",
                    phase: "ROUND_2",
                    content: "will roll back",
                    visible_to_human: true,
                    round: Some(2),
                    issue_id: None,
                    metadata: None,
                },
            )?;
            Err(rusqlite::Error::QueryReturnedNoRows)
        });
        assert!(result.is_err());

        let count = db
            .read(|conn| count_rows(conn, "transcript_entries", &game.id))
            .expect("count should succeed");
        assert_eq!(count, 0);
    }

    #[test]
    fn integration_vote_and_trace_rows_round_trip() {
        let db = new_test_db();
        let game = db
            .transaction::<_, rusqlite::Error>(|tx| {
                let user_id = ensure_user(tx, None)?;
                insert_game(tx, &user_id, 1)
            })
            .expect("game should be created");

        db.transaction::<_, rusqlite::Error>(|tx| {
            insert_vote(
                tx,
                &game.id,
                "3",
                "3.1",
                &json!({"BRA": "YES", "CAN": "YES"}),
                false,
            )?;
            insert_llm_trace(
                tx,
                NewLlmTrace {
                    game_id: &game.id,
                    role_id: "BRA",
                    status: "ROUND_2_CONVERSATION_ACTIVE",
                    provider: "fake",
                    model: "fake",
                    prompt_version: "r2_convo_v3",
                    request_payload: Some(json!({"prompt": "p"})),
                    response_payload: Some(json!({"assistant_text": "t"})),
                },
            )?;
            Ok(())
        })
        .expect("rows should insert");

        let votes = db.read(|conn| fetch_votes(conn, &game.id)).expect("votes should load");
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].proposal_option_id, "3.1");
        assert!(!votes[0].passed);

        let traces = db
            .read(|conn| fetch_llm_traces(conn, &game.id))
            .expect("traces should load");
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].provider, "fake");
        assert_eq!(traces[0].response_payload.as_ref().unwrap()["assistant_text"], "t");
    }
}
