//! Role selection and Round 1 opening statements.

use crate::db::{self, NewTranscriptEntry};
use crate::engine::{load_game, persist_state, persist_state_no_checkpoint, precondition, AdvanceResult, EngineError};
use crate::scripts;
use crate::state::{
    apply_initial_stances, ensure_default_stances, pick_opening_variant,
    speaker_order_with_constraint, GameStatus, OpeningChoice, CHAIR,
};
use rusqlite::Transaction;
use serde_json::json;

pub fn role_confirmed(
    tx: &Transaction,
    game_id: &str,
    human_role_id: &str,
) -> Result<AdvanceResult, EngineError> {
    let (_, mut state, status) = load_game(tx, game_id)?;
    if status != GameStatus::RoleSelection {
        return Err(precondition("ROLE_CONFIRMED only allowed from ROLE_SELECTION"));
    }
    if human_role_id == CHAIR {
        return Err(precondition("Invalid human_role_id"));
    }
    if !state.roles.contains_key(human_role_id) {
        return Err(precondition("Unknown role"));
    }

    db::update_game_human_role(tx, game_id, human_role_id)?;
    state.human_role_id = Some(human_role_id.to_string());
    ensure_default_stances(&mut state);
    persist_state_no_checkpoint(tx, game_id, GameStatus::Round1Setup, &mut state)?;
    Ok(AdvanceResult { game_id: game_id.to_string(), state })
}

pub fn round1_ready(tx: &Transaction, game_id: &str) -> Result<AdvanceResult, EngineError> {
    let (game, mut state, status) = load_game(tx, game_id)?;
    if status != GameStatus::Round1Setup {
        return Err(precondition("ROUND_1_READY only allowed from ROUND_1_SETUP"));
    }
    let human_role_id = state
        .human_role_id
        .clone()
        .ok_or_else(|| precondition("Human role not set"))?;

    state.round1.speaker_order = speaker_order_with_constraint(game.seed, &human_role_id);
    state.round1.cursor = 0;

    let variants = db::fetch_opening_variants(tx)?;
    let roles: Vec<String> = state.roles.keys().cloned().collect();
    for role_id in roles {
        if role_id == CHAIR {
            continue;
        }
        let candidates: Vec<_> = variants
            .iter()
            .filter(|v| v.role_id == role_id)
            .cloned()
            .collect();
        let chosen = pick_opening_variant(&role_id, game.seed, &candidates)
            .ok_or_else(|| precondition(format!("No opening variants available for {}", role_id)))?;
        state.round1.openings.insert(
            role_id.clone(),
            OpeningChoice {
                variant_id: chosen.id.clone(),
                text: chosen.opening_text.clone(),
                initial_stances: chosen.initial_stances.clone(),
            },
        );
        if let Some(initial) = &chosen.initial_stances {
            apply_initial_stances(&mut state, &role_id, initial);
        }
    }

    let open_text = scripts::render_japan_script(tx, scripts::R1_OPEN, &[])?;
    let entry = db::insert_transcript_entry(
        tx,
        NewTranscriptEntry {
            game_id,
            role_id: CHAIR,
            phase: "ROUND_1_OPENING_STATEMENTS",
            content: &open_text,
            visible_to_human: true,
            round: None,
            issue_id: None,
            metadata: None,
        },
    )?;

    persist_state(tx, game_id, GameStatus::Round1OpeningStatements, &mut state, Some(&entry.id))?;
    Ok(AdvanceResult { game_id: game_id.to_string(), state })
}

/// Speak the next queued opening. The chair cue sorts before the speaker
/// row via `metadata.index` even when timestamps collide.
fn speak_opening(
    tx: &Transaction,
    game_id: &str,
    state: &mut crate::state::GameState,
    cursor: usize,
    speaker_id: &str,
    content: &str,
) -> Result<String, EngineError> {
    let intro_text =
        scripts::render_japan_script(tx, scripts::R1_CALL_SPEAKER, &[("speaker", speaker_id)])?;
    db::insert_transcript_entry(
        tx,
        NewTranscriptEntry {
            game_id,
            role_id: CHAIR,
            phase: "ROUND_1_OPENING_STATEMENTS",
            content: &intro_text,
            visible_to_human: true,
            round: None,
            issue_id: None,
            metadata: Some(json!({"cursor": cursor, "index": cursor * 2})),
        },
    )?;
    let speaker_entry = db::insert_transcript_entry(
        tx,
        NewTranscriptEntry {
            game_id,
            role_id: speaker_id,
            phase: "ROUND_1_OPENING_STATEMENTS",
            content,
            visible_to_human: true,
            round: None,
            issue_id: None,
            metadata: Some(json!({"cursor": cursor, "index": cursor * 2 + 1})),
        },
    )?;
    state.round1.cursor = cursor + 1;
    Ok(speaker_entry.id)
}

pub fn round1_step(tx: &Transaction, game_id: &str) -> Result<AdvanceResult, EngineError> {
    let (_, mut state, status) = load_game(tx, game_id)?;
    if status != GameStatus::Round1OpeningStatements {
        return Err(precondition("ROUND_1_STEP only allowed during opening statements"));
    }
    let cursor = state.round1.cursor;
    let order = state.round1.speaker_order.clone();
    if cursor >= order.len() {
        // Already complete; make the state reflect the transition.
        persist_state_no_checkpoint(tx, game_id, GameStatus::Round2Setup, &mut state)?;
        return Ok(AdvanceResult { game_id: game_id.to_string(), state });
    }

    let speaker_id = order[cursor].clone();
    let opening_text = state
        .round1
        .openings
        .get(&speaker_id)
        .map(|o| o.text.clone())
        .ok_or_else(|| precondition(format!("No opening text for {}", speaker_id)))?;

    let speaker_entry_id = speak_opening(tx, game_id, &mut state, cursor, &speaker_id, &opening_text)?;
    let next_status = if state.round1.cursor >= order.len() {
        GameStatus::Round2Setup
    } else {
        GameStatus::Round1OpeningStatements
    };
    persist_state(tx, game_id, next_status, &mut state, Some(&speaker_entry_id))?;
    Ok(AdvanceResult { game_id: game_id.to_string(), state })
}

pub fn human_opening_statement(
    tx: &Transaction,
    game_id: &str,
    text: &str,
) -> Result<AdvanceResult, EngineError> {
    let (_, mut state, status) = load_game(tx, game_id)?;
    if status != GameStatus::Round1OpeningStatements {
        return Err(precondition("HUMAN_OPENING_STATEMENT only allowed during opening statements"));
    }
    let cursor = state.round1.cursor;
    let order = state.round1.speaker_order.clone();
    if cursor >= order.len() {
        return Err(precondition("No pending speaker"));
    }
    let speaker_id = order[cursor].clone();
    if Some(speaker_id.as_str()) != state.human_role_id.as_deref() {
        return Err(precondition("Not human turn"));
    }

    let speaker_entry_id = speak_opening(tx, game_id, &mut state, cursor, &speaker_id, text)?;
    let next_status = if state.round1.cursor >= order.len() {
        GameStatus::Round2Setup
    } else {
        GameStatus::Round1OpeningStatements
    };
    persist_state(tx, game_id, next_status, &mut state, Some(&speaker_entry_id))?;
    Ok(AdvanceResult { game_id: game_id.to_string(), state })
}
