//! Event dispatcher for the game state machine.
//!
//! Every advance loads `{game, state}` under the database lock, validates
//! the event against the current status, applies the mutation and commits
//! all writes atomically. Steps that call the LLM validate and build their
//! prompt first, generate without holding the lock, then re-check the
//! status before writing (see DESIGN.md for the documented choice).

use crate::config::Settings;
use crate::db::{self, Database};
use crate::llm::{LlmError, LlmProvider, LlmRequest};
use crate::stance::IssueOptionSpec;
use crate::state::{
    ensure_default_stances, initial_state, CheckpointRef, GameState, GameStatus, HumanPlacement,
    VoteChoice,
};
use crate::{round1, round2, round3};
use rusqlite::Transaction;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Precondition(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Validation(String),
    #[error("LLM generation failed: {0}")]
    External(String),
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("state serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::Precondition(_) | EngineError::Validation(_) => 400,
            EngineError::NotFound(_) => 404,
            EngineError::External(_) => 502,
            EngineError::Db(_) | EngineError::Serde(_) | EngineError::Internal(_) => 500,
        }
    }
}

pub fn precondition(detail: impl Into<String>) -> EngineError {
    EngineError::Precondition(detail.into())
}

#[derive(Debug, Clone)]
pub enum Event {
    RoleConfirmed { human_role_id: String },
    Round1Ready,
    Round1Step,
    HumanOpeningStatement { text: String },
    Round2Ready,
    Convo1Selected { partner_role_id: String },
    Convo2Selected { partner_role_id: String },
    ConvoMessage { content: String },
    ConvoEndEarly,
    Convo2Skipped,
    Round2WrapReady,
    Round3StartIssue { issue_id: String, human_placement: HumanPlacement },
    IssueIntroContinue,
    IssueDebateStep,
    HumanDebateMessage { text: String },
    HumanVote { vote: VoteChoice },
    IssueResolutionContinue,
}

fn payload_str<'a>(payload: &'a Value, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(|v| v.as_str()).filter(|s| !s.trim().is_empty())
}

impl Event {
    pub fn parse(event: &str, payload: &Value) -> Result<Event, EngineError> {
        match event {
            "ROLE_CONFIRMED" => {
                let role = payload_str(payload, "human_role_id")
                    .ok_or_else(|| precondition("Invalid human_role_id"))?;
                Ok(Event::RoleConfirmed { human_role_id: role.to_string() })
            }
            "ROUND_1_READY" => Ok(Event::Round1Ready),
            "ROUND_1_STEP" => Ok(Event::Round1Step),
            "HUMAN_OPENING_STATEMENT" => {
                let text = payload_str(payload, "text")
                    .ok_or_else(|| precondition("text required"))?;
                Ok(Event::HumanOpeningStatement { text: text.trim().to_string() })
            }
            "ROUND_2_READY" => Ok(Event::Round2Ready),
            "CONVO_1_SELECTED" => {
                let partner = payload_str(payload, "partner_role_id")
                    .ok_or_else(|| precondition("partner_role_id required"))?;
                Ok(Event::Convo1Selected { partner_role_id: partner.to_string() })
            }
            "CONVO_2_SELECTED" => {
                let partner = payload_str(payload, "partner_role_id")
                    .ok_or_else(|| precondition("partner_role_id required"))?;
                Ok(Event::Convo2Selected { partner_role_id: partner.to_string() })
            }
            // UI sends message text as "content"; accept "text" as fallback.
            "CONVO_1_MESSAGE" | "CONVO_2_MESSAGE" | "CONVO_MESSAGE" => {
                let content = payload_str(payload, "content")
                    .or_else(|| payload_str(payload, "text"))
                    .ok_or_else(|| precondition("content required"))?;
                Ok(Event::ConvoMessage { content: content.to_string() })
            }
            "CONVO_END_EARLY" => Ok(Event::ConvoEndEarly),
            "CONVO_2_SKIPPED" => Ok(Event::Convo2Skipped),
            "ROUND_2_WRAP_READY" => Ok(Event::Round2WrapReady),
            "ROUND_3_START_ISSUE" => {
                let issue_id = payload_str(payload, "issue_id").unwrap_or("1");
                let placement = payload
                    .get("human_placement")
                    .and_then(|v| v.as_str())
                    .unwrap_or("random");
                let human_placement = HumanPlacement::parse(placement)
                    .ok_or_else(|| EngineError::Validation("Invalid human_placement".to_string()))?;
                Ok(Event::Round3StartIssue { issue_id: issue_id.to_string(), human_placement })
            }
            "ISSUE_INTRO_CONTINUE" => Ok(Event::IssueIntroContinue),
            "ISSUE_DEBATE_STEP" => Ok(Event::IssueDebateStep),
            "HUMAN_DEBATE_MESSAGE" => {
                let text = payload_str(payload, "text")
                    .ok_or_else(|| precondition("text required"))?;
                Ok(Event::HumanDebateMessage { text: text.to_string() })
            }
            "HUMAN_VOTE" => {
                let vote = payload
                    .get("vote")
                    .and_then(|v| v.as_str())
                    .and_then(VoteChoice::parse)
                    .ok_or_else(|| EngineError::Validation("Invalid vote".to_string()))?;
                Ok(Event::HumanVote { vote })
            }
            "ISSUE_RESOLUTION_CONTINUE" => Ok(Event::IssueResolutionContinue),
            _ => Err(precondition("Unsupported event")),
        }
    }
}

#[derive(Clone)]
pub struct EngineContext {
    pub db: Arc<Database>,
    pub llm: Arc<dyn LlmProvider>,
    pub settings: Settings,
}

#[derive(Debug, Serialize)]
pub struct AdvanceResult {
    pub game_id: String,
    pub state: GameState,
}

/// Load a game plus its state blob or 404.
pub fn load_game(
    tx: &rusqlite::Connection,
    game_id: &str,
) -> Result<(db::GameRow, GameState, GameStatus), EngineError> {
    let Some((game, state)) = db::fetch_game_with_state(tx, game_id)? else {
        return Err(EngineError::NotFound("Game not found".to_string()));
    };
    let status = GameStatus::parse(&game.status)
        .ok_or_else(|| EngineError::Internal(format!("unknown game status {}", game.status)))?;
    Ok((game, state, status))
}

/// Persist status + state and bind a checkpoint to the step's last
/// transcript row. The checkpoint reference is echoed into the in-memory
/// state after the snapshot is taken.
pub fn persist_state(
    tx: &Transaction,
    game_id: &str,
    status: GameStatus,
    state: &mut GameState,
    checkpoint_transcript_id: Option<&str>,
) -> Result<(), EngineError> {
    state.status = status;
    state.updated_at = Some(db::now_iso());
    db::update_game_status(tx, game_id, status.as_str())?;
    db::update_game_state(tx, game_id, state)?;
    let snapshot = serde_json::to_string(state)?;
    let checkpoint =
        db::insert_checkpoint(tx, game_id, checkpoint_transcript_id, status.as_str(), &snapshot)?;
    state.checkpoints.push(CheckpointRef {
        checkpoint_id: checkpoint.id,
        created_at: checkpoint.created_at,
        status: status.as_str().to_string(),
        transcript_upto: checkpoint_transcript_id.map(|s| s.to_string()),
    });
    Ok(())
}

/// Persist status + state for silent transitions (no transcript row, so no
/// checkpoint either).
pub fn persist_state_no_checkpoint(
    tx: &Transaction,
    game_id: &str,
    status: GameStatus,
    state: &mut GameState,
) -> Result<(), EngineError> {
    state.status = status;
    state.updated_at = Some(db::now_iso());
    db::update_game_status(tx, game_id, status.as_str())?;
    db::update_game_state(tx, game_id, state)?;
    Ok(())
}

/// Record a failed generation attempt in its own short transaction; the
/// step itself leaves no other writes behind.
pub fn record_failed_trace(
    ctx: &EngineContext,
    game_id: &str,
    role_id: &str,
    status: &str,
    request: &LlmRequest,
    err: &LlmError,
) -> Result<(), EngineError> {
    ctx.db.transaction(|tx| {
        db::insert_llm_trace(
            tx,
            db::NewLlmTrace {
                game_id,
                role_id,
                status,
                provider: ctx.llm.provider_name(),
                model: ctx.llm.model_name(),
                prompt_version: &request.prompt_version,
                request_payload: Some(request.request_payload.clone()),
                response_payload: Some(serde_json::json!({
                    "error_type": err.error_type(),
                    "error_message": err.to_string(),
                })),
            },
        )?;
        Ok(())
    })
}

/// Issue id -> option ids, the catalog fed to the stance engine.
pub fn issue_option_spec(issues: &[db::IssueDefinition]) -> IssueOptionSpec {
    issues
        .iter()
        .map(|issue| {
            (
                issue.id.clone(),
                issue.options.iter().map(|o| o.option_id.clone()).collect(),
            )
        })
        .collect()
}

fn fresh_seed() -> i64 {
    let bytes = *Uuid::new_v4().as_bytes();
    let mut eight = [0u8; 8];
    eight.copy_from_slice(&bytes[..8]);
    (u64::from_be_bytes(eight) >> 1) as i64
}

/// Create a game with a fresh 63-bit seed and its initial checkpoint.
pub fn create_game(ctx: &EngineContext, user_id: Option<&str>) -> Result<AdvanceResult, EngineError> {
    ctx.db.transaction(|tx| {
        let user_id = db::ensure_user(tx, user_id)?;
        let game = db::insert_game(tx, &user_id, fresh_seed())?;
        let mut state = initial_state();
        let now = db::now_iso();
        state.game_id = Some(game.id.clone());
        state.created_at = Some(now.clone());
        state.updated_at = Some(now);
        ensure_default_stances(&mut state);
        db::insert_game_state(tx, &game.id, &state)?;
        let snapshot = serde_json::to_string(&state)?;
        db::insert_checkpoint(tx, &game.id, None, state.status.as_str(), &snapshot)?;
        Ok(AdvanceResult { game_id: game.id, state })
    })
}

/// Dispatch one inbound event against a game.
pub async fn advance(
    ctx: &EngineContext,
    game_id: &str,
    event_name: &str,
    payload: &Value,
) -> Result<AdvanceResult, EngineError> {
    let event = Event::parse(event_name, payload)?;
    match event {
        Event::RoleConfirmed { human_role_id } => ctx
            .db
            .transaction(|tx| round1::role_confirmed(tx, game_id, &human_role_id)),
        Event::Round1Ready => ctx.db.transaction(|tx| round1::round1_ready(tx, game_id)),
        Event::Round1Step => ctx.db.transaction(|tx| round1::round1_step(tx, game_id)),
        Event::HumanOpeningStatement { text } => ctx
            .db
            .transaction(|tx| round1::human_opening_statement(tx, game_id, &text)),
        Event::Round2Ready => ctx.db.transaction(|tx| round2::round2_ready(tx, game_id)),
        Event::Convo1Selected { partner_role_id } => ctx
            .db
            .transaction(|tx| round2::convo_selected(tx, game_id, 1, &partner_role_id)),
        Event::Convo2Selected { partner_role_id } => ctx
            .db
            .transaction(|tx| round2::convo_selected(tx, game_id, 2, &partner_role_id)),
        Event::ConvoMessage { content } => {
            round2::conversation_message(ctx, game_id, &content).await
        }
        Event::ConvoEndEarly => ctx.db.transaction(|tx| round2::convo_end_early(tx, game_id)),
        Event::Convo2Skipped => ctx.db.transaction(|tx| round2::convo2_skipped(tx, game_id)),
        Event::Round2WrapReady => ctx.db.transaction(|tx| round2::wrap_ready(tx, game_id)),
        Event::Round3StartIssue { issue_id, human_placement } => ctx
            .db
            .transaction(|tx| round3::start_issue(tx, game_id, &issue_id, human_placement)),
        Event::IssueIntroContinue => ctx.db.transaction(|tx| round3::intro_continue(tx, game_id)),
        Event::IssueDebateStep => round3::step(ctx, game_id, round3::StepEvent::Step).await,
        Event::HumanDebateMessage { text } => {
            round3::step(ctx, game_id, round3::StepEvent::HumanSpeech(text)).await
        }
        Event::HumanVote { vote } => {
            round3::step(ctx, game_id, round3::StepEvent::HumanVote(vote)).await
        }
        Event::IssueResolutionContinue => ctx
            .db
            .transaction(|tx| round3::resolution_continue(tx, game_id)),
    }
}
