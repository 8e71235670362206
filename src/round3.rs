//! Round 3: per-issue debate, proposal selection, roll-call voting and
//! resolution.
//!
//! `ISSUE_DEBATE_STEP` is the workhorse event: it advances whatever the
//! current sub-phase needs next, and is rejected whenever the human must
//! act instead (`HUMAN_DEBATE_MESSAGE`, `HUMAN_VOTE`).

use crate::db::{self, NewLlmTrace, NewTranscriptEntry};
use crate::engine::{
    load_game, persist_state, persist_state_no_checkpoint, precondition, record_failed_trace,
    AdvanceResult, EngineContext, EngineError,
};
use crate::llm::{LlmRequest, LlmResponse};
use crate::prompts::{build_round3_debate_speech_prompt, Round3SpeechInput, TailEntry};
use crate::stance::{apply_stance_shift, IssueOptionSpec};
use crate::state::{
    human_placement, vote_order, ActiveIssue, GameState, GameStatus, HumanPlacement, VoteChoice,
    CHAIR, COUNTRIES,
};
use rusqlite::{Connection, Transaction};
use serde_json::json;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub enum StepEvent {
    Step,
    HumanSpeech(String),
    HumanVote(VoteChoice),
}

fn build_debate_queue(
    state: &GameState,
    seed: i64,
    issue_id: &str,
    choice: HumanPlacement,
    round: u8,
) -> Vec<String> {
    let countries: Vec<String> = state
        .roles
        .iter()
        .filter(|(_, info)| info.role_type == "country")
        .map(|(role, _)| role.clone())
        .collect();
    let ngos: Vec<String> = state
        .roles
        .iter()
        .filter(|(_, info)| info.role_type == "ngo")
        .map(|(role, _)| role.clone())
        .collect();
    let human = state.human_role_id.as_deref();
    let countries = human_placement(
        countries,
        human,
        choice,
        seed,
        &format!("{}-countries-{}", issue_id, round),
    );
    let ngos = human_placement(ngos, human, choice, seed, &format!("{}-ngos-{}", issue_id, round));
    countries.into_iter().chain(ngos).collect()
}

pub fn start_issue(
    tx: &Transaction,
    game_id: &str,
    issue_id: &str,
    choice: HumanPlacement,
) -> Result<AdvanceResult, EngineError> {
    let (game, mut state, status) = load_game(tx, game_id)?;
    if status != GameStatus::Round3Setup {
        return Err(precondition("ROUND_3_START_ISSUE only allowed from ROUND_3_SETUP"));
    }
    let Some(issue) = db::fetch_issue_definition(tx, issue_id)? else {
        return Err(EngineError::NotFound("Issue not found".to_string()));
    };

    let debate_queue = build_debate_queue(&state, game.seed, issue_id, choice, 1);
    state.round3.active_issue_index = state.round3.issues.iter().position(|i| i == issue_id);
    state.round3.active_issue = Some(ActiveIssue {
        issue_id: issue.id.clone(),
        issue_title: issue.title.clone(),
        ui_prompt: issue.description.clone(),
        options: issue.options.clone(),
        human_placement_choice: choice,
        debate_queue,
        debate_cursor: 0,
        debate_round: 1,
        proposed_option_id: None,
        proposal_support_snapshot: None,
        vote_order: Vec::new(),
        next_voter_index: 0,
        votes: BTreeMap::new(),
        resolution: None,
        resolution_written: false,
    });

    let options_list = issue
        .options
        .iter()
        .map(|o| format!("{} {}", o.option_id, o.label))
        .collect::<Vec<_>>()
        .join("; ");
    let intro_text = crate::scripts::render_japan_script(
        tx,
        crate::scripts::ISSUE_INTRO,
        &[
            ("issue_id", &issue.id),
            ("issue_title", &issue.title),
            ("options_list", &options_list),
        ],
    )?;
    let entry = db::insert_transcript_entry(
        tx,
        NewTranscriptEntry {
            game_id,
            role_id: CHAIR,
            phase: "ISSUE_INTRO",
            content: &intro_text,
            visible_to_human: true,
            round: Some(3),
            issue_id: Some(&issue.id),
            metadata: Some(json!({"issue_id": issue.id})),
        },
    )?;
    persist_state(tx, game_id, GameStatus::IssueIntro, &mut state, Some(&entry.id))?;
    Ok(AdvanceResult { game_id: game_id.to_string(), state })
}

pub fn intro_continue(tx: &Transaction, game_id: &str) -> Result<AdvanceResult, EngineError> {
    let (_, mut state, status) = load_game(tx, game_id)?;
    if status != GameStatus::IssueIntro {
        return Err(precondition("ISSUE_INTRO_CONTINUE only allowed from ISSUE_INTRO"));
    }
    {
        let ai = active_issue_mut(&mut state)?;
        ai.debate_round = 1;
        ai.debate_cursor = 0;
    }
    persist_state_no_checkpoint(tx, game_id, GameStatus::IssueDebateRound1, &mut state)?;
    Ok(AdvanceResult { game_id: game_id.to_string(), state })
}

fn active_issue_mut(state: &mut GameState) -> Result<&mut ActiveIssue, EngineError> {
    state
        .round3
        .active_issue
        .as_mut()
        .ok_or_else(|| precondition("No active issue"))
}

fn active_issue_ref(state: &GameState) -> Result<&ActiveIssue, EngineError> {
    state
        .round3
        .active_issue
        .as_ref()
        .ok_or_else(|| precondition("No active issue"))
}

/// Catalog restricted to the active issue; Round-3 shifts are issue-scoped.
fn issue_spec(issue: &ActiveIssue) -> IssueOptionSpec {
    let mut spec = IssueOptionSpec::new();
    spec.insert(
        issue.issue_id.clone(),
        issue.options.iter().map(|o| o.option_id.clone()).collect(),
    );
    spec
}

struct SpeechGuard {
    status: GameStatus,
    debate_round: u8,
    debate_cursor: usize,
    speaker: String,
}

enum StepPrep {
    Sync,
    Generate {
        guard: SpeechGuard,
        request: LlmRequest,
    },
}

fn prepare_step(
    conn: &Connection,
    game_id: &str,
    event: &StepEvent,
    round3_llm: bool,
) -> Result<StepPrep, EngineError> {
    if !matches!(event, StepEvent::Step) || !round3_llm {
        return Ok(StepPrep::Sync);
    }
    let (_, state, status) = load_game(conn, game_id)?;
    if status != GameStatus::IssueDebateRound1 && status != GameStatus::IssueDebateRound2 {
        return Ok(StepPrep::Sync);
    }
    let ai = active_issue_ref(&state)?;
    if ai.debate_cursor >= ai.debate_queue.len() {
        return Ok(StepPrep::Sync);
    }
    let speaker = ai.debate_queue[ai.debate_cursor].clone();
    if Some(speaker.as_str()) == state.human_role_id.as_deref() {
        return Ok(StepPrep::Sync);
    }

    let opening_text = state
        .round1
        .openings
        .get(&speaker)
        .map(|o| o.text.clone())
        .unwrap_or_default();
    let stance_snapshot = state
        .stances
        .get(&speaker)
        .and_then(|s| s.get(&ai.issue_id))
        .cloned();
    let debate_tail: Vec<TailEntry> = db::fetch_transcript(conn, game_id, None)?
        .into_iter()
        .filter(|entry| {
            entry.phase.starts_with("ISSUE_DEBATE") && entry.issue_id.as_deref() == Some(&ai.issue_id)
        })
        .map(|entry| TailEntry { role_id: entry.role_id, content: entry.content })
        .collect();

    let built = build_round3_debate_speech_prompt(&Round3SpeechInput {
        active_issue: ai,
        speaker_role: &speaker,
        speech_number: ai.debate_cursor + 1,
        debate_round: ai.debate_round,
        opening_text: &opening_text,
        stance_snapshot: stance_snapshot.as_ref(),
        debate_tail: &debate_tail,
    });

    let request = LlmRequest {
        game_id: game_id.to_string(),
        role_id: speaker.clone(),
        status: status.as_str().to_string(),
        prompt: built.prompt.clone(),
        prompt_version: built.prompt_version.to_string(),
        conversation_context: built.request_payload.get("context").cloned(),
        request_payload: built.request_payload.clone(),
    };

    Ok(StepPrep::Generate {
        guard: SpeechGuard {
            status,
            debate_round: ai.debate_round,
            debate_cursor: ai.debate_cursor,
            speaker,
        },
        request,
    })
}

pub async fn step(
    ctx: &EngineContext,
    game_id: &str,
    event: StepEvent,
) -> Result<AdvanceResult, EngineError> {
    let prep = ctx
        .db
        .read(|conn| prepare_step(conn, game_id, &event, ctx.settings.round3_debate_llm))?;
    match prep {
        StepPrep::Sync => ctx.db.transaction(|tx| apply_step_sync(tx, ctx, game_id, &event)),
        StepPrep::Generate { guard, request } => match ctx.llm.generate(&request).await {
            Err(err) => {
                record_failed_trace(ctx, game_id, &guard.speaker, guard.status.as_str(), &request, &err)?;
                Err(EngineError::External(err.to_string()))
            }
            Ok(response) => ctx
                .db
                .transaction(|tx| apply_ai_speech(tx, ctx, game_id, &guard, &request, &response)),
        },
    }
}

fn apply_step_sync(
    tx: &Transaction,
    ctx: &EngineContext,
    game_id: &str,
    event: &StepEvent,
) -> Result<AdvanceResult, EngineError> {
    let (game, mut state, status) = load_game(tx, game_id)?;
    match status {
        GameStatus::IssueDebateRound1 | GameStatus::IssueDebateRound2 => {
            let (queue_len, cursor, speaker) = {
                let ai = active_issue_ref(&state)?;
                let speaker = ai.debate_queue.get(ai.debate_cursor).cloned();
                (ai.debate_queue.len(), ai.debate_cursor, speaker)
            };
            if cursor >= queue_len {
                advance_exhausted_queue(tx, game_id, game.seed, &mut state, status)?;
                return Ok(AdvanceResult { game_id: game_id.to_string(), state });
            }
            let speaker = speaker.expect("cursor bounds checked above");
            let is_human = Some(speaker.as_str()) == state.human_role_id.as_deref();
            match event {
                StepEvent::HumanSpeech(text) => {
                    if !is_human {
                        return Err(precondition("Not human turn"));
                    }
                    let entry_id = write_speech_row(tx, game_id, &mut state, status, &speaker, text)?;
                    finish_speech(tx, game_id, game.seed, &mut state, status, &entry_id)?;
                    Ok(AdvanceResult { game_id: game_id.to_string(), state })
                }
                StepEvent::Step => {
                    if is_human {
                        return Err(precondition("Human debate turn requires HUMAN_DEBATE_MESSAGE"));
                    }
                    if ctx.settings.round3_debate_llm {
                        // An LLM turn should have been prepared before this
                        // transaction; the state moved underneath us.
                        return Err(precondition("Game advanced concurrently; retry"));
                    }
                    let text = fallback_speech(&state, &speaker)?;
                    let entry_id =
                        write_speech_row(tx, game_id, &mut state, status, &speaker, &text)?;
                    finish_speech(tx, game_id, game.seed, &mut state, status, &entry_id)?;
                    Ok(AdvanceResult { game_id: game_id.to_string(), state })
                }
                StepEvent::HumanVote(_) => Err(precondition("Human vote not expected")),
            }
        }
        GameStatus::IssuePositionFinalization | GameStatus::IssueProposalSelection => match event {
            StepEvent::Step => proposal_selection(tx, game_id, &mut state),
            _ => Err(precondition("Unsupported event")),
        },
        GameStatus::IssueVote => match event {
            StepEvent::Step => vote_step(tx, game_id, &mut state, None),
            StepEvent::HumanVote(vote) => vote_step(tx, game_id, &mut state, Some(*vote)),
            StepEvent::HumanSpeech(_) => Err(precondition("Unsupported event")),
        },
        GameStatus::IssueResolution => match event {
            StepEvent::Step => resolution_step(tx, game_id, &mut state),
            _ => Err(precondition("ISSUE_RESOLUTION_CONTINUE or ISSUE_DEBATE_STEP required")),
        },
        _ => Err(precondition("Unsupported event")),
    }
}

/// Deterministic one-liner used when Round-3 debate generation is disabled.
fn fallback_speech(state: &GameState, speaker: &str) -> Result<String, EngineError> {
    let ai = active_issue_ref(state)?;
    let preferred = state
        .stances
        .get(speaker)
        .and_then(|s| s.get(&ai.issue_id))
        .and_then(|s| s.preferred.clone())
        .or_else(|| ai.options.first().map(|o| o.option_id.clone()))
        .ok_or_else(|| precondition("No options available"))?;
    Ok(format!(
        "As {}, we continue to support option {} on issue {} and urge colleagues to consider it.",
        speaker, preferred, ai.issue_id
    ))
}

fn write_speech_row(
    tx: &Transaction,
    game_id: &str,
    state: &mut GameState,
    status: GameStatus,
    speaker: &str,
    text: &str,
) -> Result<String, EngineError> {
    let (issue_id, debate_round, cursor) = {
        let ai = active_issue_ref(state)?;
        (ai.issue_id.clone(), ai.debate_round, ai.debate_cursor)
    };
    let entry = db::insert_transcript_entry(
        tx,
        NewTranscriptEntry {
            game_id,
            role_id: speaker,
            phase: status.as_str(),
            content: text,
            visible_to_human: true,
            round: Some(3),
            issue_id: Some(&issue_id),
            metadata: Some(json!({
                "issue_id": issue_id,
                "round": debate_round,
                "speaker": speaker,
                "speech_number": cursor + 1,
            })),
        },
    )?;

    // Only the speaker's stances move, scoped to the active issue.
    let spec = {
        let ai = active_issue_ref(state)?;
        issue_spec(ai)
    };
    let snapshot = state.stances.get(speaker).cloned().unwrap_or_default();
    let (updated, reasons) =
        apply_stance_shift(speaker, 3, Some(&issue_id), text, &snapshot, &spec);
    state.stances.insert(speaker.to_string(), updated);
    state.round3.stance_log.extend(reasons);

    let ai = active_issue_mut(state)?;
    ai.debate_cursor = cursor + 1;
    Ok(entry.id)
}

fn finish_speech(
    tx: &Transaction,
    game_id: &str,
    seed: i64,
    state: &mut GameState,
    status: GameStatus,
    entry_id: &str,
) -> Result<(), EngineError> {
    persist_state(tx, game_id, status, state, Some(entry_id))?;
    let exhausted = {
        let ai = active_issue_ref(state)?;
        ai.debate_cursor >= ai.debate_queue.len()
    };
    if exhausted {
        advance_exhausted_queue(tx, game_id, seed, state, status)?;
    }
    Ok(())
}

/// When a debate queue runs dry: round 1 rebuilds a fresh round-2 queue,
/// round 2 rolls into position finalization. State-only, no checkpoint.
fn advance_exhausted_queue(
    tx: &Transaction,
    game_id: &str,
    seed: i64,
    state: &mut GameState,
    status: GameStatus,
) -> Result<(), EngineError> {
    if status == GameStatus::IssueDebateRound1 {
        let (issue_id, choice) = {
            let ai = active_issue_ref(state)?;
            (ai.issue_id.clone(), ai.human_placement_choice)
        };
        let queue = build_debate_queue(state, seed, &issue_id, choice, 2);
        let ai = active_issue_mut(state)?;
        ai.debate_queue = queue;
        ai.debate_cursor = 0;
        ai.debate_round = 2;
        persist_state_no_checkpoint(tx, game_id, GameStatus::IssueDebateRound2, state)?;
    } else {
        persist_state_no_checkpoint(tx, game_id, GameStatus::IssuePositionFinalization, state)?;
    }
    Ok(())
}

fn apply_ai_speech(
    tx: &Transaction,
    ctx: &EngineContext,
    game_id: &str,
    guard: &SpeechGuard,
    request: &LlmRequest,
    response: &LlmResponse,
) -> Result<AdvanceResult, EngineError> {
    let (game, mut state, status) = load_game(tx, game_id)?;
    {
        let ai = active_issue_ref(&state)?;
        if status != guard.status
            || ai.debate_round != guard.debate_round
            || ai.debate_cursor != guard.debate_cursor
            || ai.debate_queue.get(ai.debate_cursor).map(|s| s.as_str()) != Some(&guard.speaker)
        {
            return Err(precondition("Game advanced concurrently; retry"));
        }
    }

    let entry_id =
        write_speech_row(tx, game_id, &mut state, status, &guard.speaker, &response.assistant_text)?;
    db::insert_llm_trace(
        tx,
        NewLlmTrace {
            game_id,
            role_id: &guard.speaker,
            status: status.as_str(),
            provider: ctx.llm.provider_name(),
            model: ctx.llm.model_name(),
            prompt_version: &request.prompt_version,
            request_payload: Some(request.request_payload.clone()),
            response_payload: Some(json!({
                "assistant_text": response.assistant_text,
                "metadata": response.metadata,
            })),
        },
    )?;
    finish_speech(tx, game_id, game.seed, &mut state, status, &entry_id)?;
    Ok(AdvanceResult { game_id: game_id.to_string(), state })
}

/// Support per option = sum of country acceptances (nulls count as zero);
/// highest total wins, ties break to the lexically smallest option id.
fn proposal_selection(
    tx: &Transaction,
    game_id: &str,
    state: &mut GameState,
) -> Result<AdvanceResult, EngineError> {
    let (issue_id, options) = {
        let ai = active_issue_ref(state)?;
        (ai.issue_id.clone(), ai.options.clone())
    };
    if options.is_empty() {
        return Err(precondition("No options available"));
    }

    let mut support: BTreeMap<String, f64> = BTreeMap::new();
    for option in &options {
        let mut total = 0.0;
        for country in COUNTRIES {
            let acceptance = state
                .stances
                .get(country)
                .and_then(|s| s.get(&issue_id))
                .and_then(|s| s.acceptance.get(&option.option_id))
                .copied()
                .flatten()
                .unwrap_or(0.0);
            total += acceptance;
        }
        support.insert(option.option_id.clone(), total);
    }

    // options are sorted by id; strict comparison keeps the smallest id on ties
    let mut proposed = options[0].option_id.clone();
    let mut best = support.get(&proposed).copied().unwrap_or(0.0);
    for option in &options[1..] {
        let total = support.get(&option.option_id).copied().unwrap_or(0.0);
        if total > best {
            best = total;
            proposed = option.option_id.clone();
        }
    }

    {
        let ai = active_issue_mut(state)?;
        ai.proposed_option_id = Some(proposed.clone());
        ai.proposal_support_snapshot = Some(support);
        ai.vote_order = vote_order();
        ai.next_voter_index = 0;
        ai.votes.clear();
    }

    let proposal_text = crate::scripts::render_japan_script(
        tx,
        crate::scripts::PROPOSAL,
        &[("option_id", &proposed)],
    )?;
    let entry = db::insert_transcript_entry(
        tx,
        NewTranscriptEntry {
            game_id,
            role_id: CHAIR,
            phase: "ISSUE_PROPOSAL_SELECTION",
            content: &proposal_text,
            visible_to_human: true,
            round: Some(3),
            issue_id: Some(&issue_id),
            metadata: Some(json!({"issue_id": issue_id, "proposed_option_id": proposed})),
        },
    )?;
    persist_state(tx, game_id, GameStatus::IssueVote, state, Some(&entry.id))?;
    Ok(AdvanceResult { game_id: game_id.to_string(), state: state.clone() })
}

fn vote_step(
    tx: &Transaction,
    game_id: &str,
    state: &mut GameState,
    human_vote: Option<VoteChoice>,
) -> Result<AdvanceResult, EngineError> {
    let (issue_id, proposed, order, idx) = {
        let ai = active_issue_ref(state)?;
        let proposed = ai
            .proposed_option_id
            .clone()
            .ok_or_else(|| precondition("No proposal on the table"))?;
        let order = if ai.vote_order.is_empty() { vote_order() } else { ai.vote_order.clone() };
        (ai.issue_id.clone(), proposed, order, ai.next_voter_index)
    };

    if idx >= order.len() {
        persist_state_no_checkpoint(tx, game_id, GameStatus::IssueResolution, state)?;
        return Ok(AdvanceResult { game_id: game_id.to_string(), state: state.clone() });
    }

    let voter = order[idx].clone();
    let is_human = Some(voter.as_str()) == state.human_role_id.as_deref();
    let vote = match (is_human, human_vote) {
        (true, Some(vote)) => vote,
        (true, None) => return Err(precondition("Human vote required")),
        (false, Some(_)) => return Err(precondition("Not human turn")),
        (false, None) => {
            let acceptance = state
                .stances
                .get(&voter)
                .and_then(|s| s.get(&issue_id))
                .and_then(|s| s.acceptance.get(&proposed))
                .copied()
                .flatten()
                .unwrap_or(0.0);
            if acceptance >= 0.7 {
                VoteChoice::Yes
            } else {
                VoteChoice::No
            }
        }
    };

    {
        let ai = active_issue_mut(state)?;
        ai.votes.insert(voter.clone(), vote);
        ai.next_voter_index = idx + 1;
    }

    let entry = db::insert_transcript_entry(
        tx,
        NewTranscriptEntry {
            game_id,
            role_id: &voter,
            phase: "ISSUE_VOTE",
            content: &format!("{} votes {}.", voter, vote.as_str()),
            visible_to_human: true,
            round: Some(3),
            issue_id: Some(&issue_id),
            metadata: Some(json!({"issue_id": issue_id, "voter": voter, "vote": vote.as_str()})),
        },
    )?;
    persist_state(tx, game_id, GameStatus::IssueVote, state, Some(&entry.id))?;

    let complete = {
        let ai = active_issue_ref(state)?;
        ai.next_voter_index >= order.len()
    };
    if complete {
        let ai = active_issue_ref(state)?;
        let mut votes_by_country = serde_json::Map::new();
        for (country, choice) in crate::state::votes_in_order(&ai.votes) {
            votes_by_country.insert(country, json!(choice.as_str()));
        }
        let passed = ai.votes.len() == COUNTRIES.len()
            && ai.votes.values().all(|v| *v == VoteChoice::Yes);
        db::insert_vote(
            tx,
            game_id,
            &issue_id,
            &proposed,
            &serde_json::Value::Object(votes_by_country),
            passed,
        )?;
        persist_state_no_checkpoint(tx, game_id, GameStatus::IssueResolution, state)?;
    }

    Ok(AdvanceResult { game_id: game_id.to_string(), state: state.clone() })
}

/// Write the pass/fail chair line once; `resolution_written` latches.
fn ensure_resolution_written(
    tx: &Transaction,
    game_id: &str,
    state: &mut GameState,
) -> Result<Option<String>, EngineError> {
    let (issue_id, passed) = {
        let ai = active_issue_ref(state)?;
        if ai.resolution_written {
            return Ok(None);
        }
        let passed = ai.votes.len() == COUNTRIES.len()
            && ai.votes.values().all(|v| *v == VoteChoice::Yes);
        (ai.issue_id.clone(), passed)
    };

    let script_key = if passed {
        crate::scripts::VOTE_RESULT_PASS
    } else {
        crate::scripts::VOTE_RESULT_FAIL
    };
    let text = crate::scripts::render_japan_script(tx, script_key, &[])?;
    let entry = db::insert_transcript_entry(
        tx,
        NewTranscriptEntry {
            game_id,
            role_id: CHAIR,
            phase: "ISSUE_RESOLUTION",
            content: &text,
            visible_to_human: true,
            round: Some(3),
            issue_id: Some(&issue_id),
            metadata: Some(json!({"issue_id": issue_id, "passed": passed})),
        },
    )?;

    let ai = active_issue_mut(state)?;
    ai.resolution = Some(crate::state::Resolution { passed, final_votes: ai.votes.clone() });
    ai.resolution_written = true;
    if !state.round3.closed_issues.iter().any(|i| i == &issue_id) {
        state.round3.closed_issues.push(issue_id);
    }
    Ok(Some(entry.id))
}

fn resolution_step(
    tx: &Transaction,
    game_id: &str,
    state: &mut GameState,
) -> Result<AdvanceResult, EngineError> {
    match ensure_resolution_written(tx, game_id, state)? {
        Some(entry_id) => {
            persist_state(tx, game_id, GameStatus::IssueResolution, state, Some(&entry_id))?
        }
        None => persist_state_no_checkpoint(tx, game_id, GameStatus::IssueResolution, state)?,
    }
    Ok(AdvanceResult { game_id: game_id.to_string(), state: state.clone() })
}

pub fn resolution_continue(tx: &Transaction, game_id: &str) -> Result<AdvanceResult, EngineError> {
    let (_, mut state, status) = load_game(tx, game_id)?;
    if status != GameStatus::IssueResolution {
        return Err(precondition("ISSUE_RESOLUTION_CONTINUE only allowed from ISSUE_RESOLUTION"));
    }
    let entry_id = ensure_resolution_written(tx, game_id, &mut state)?;

    let all_closed = state.round3.closed_issues.len() >= state.round3.issues.len();
    let next_status = if all_closed { GameStatus::Review } else { GameStatus::Round3Setup };
    if !all_closed {
        state.round3.active_issue = None;
        state.round3.active_issue_index = None;
    }
    match entry_id {
        Some(entry_id) => persist_state(tx, game_id, next_status, &mut state, Some(&entry_id))?,
        None => persist_state_no_checkpoint(tx, game_id, next_status, &mut state)?,
    }
    Ok(AdvanceResult { game_id: game_id.to_string(), state })
}
