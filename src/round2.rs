//! Round 2: private bilateral conversations.
//!
//! A conversation allows five human/AI exchanges, then a chair interrupt,
//! then exactly one final exchange before it closes. Message handling is
//! two-phase: validate and build the prompt under the lock, generate
//! without it, then re-check and write everything atomically.

use crate::db::{self, NewLlmTrace, NewTranscriptEntry};
use crate::engine::{
    issue_option_spec, load_game, persist_state, persist_state_no_checkpoint, precondition,
    record_failed_trace, AdvanceResult, EngineContext, EngineError,
};
use crate::llm::{LlmRequest, LlmResponse};
use crate::prompts::{
    build_round2_conversation_prompt, BuiltPrompt, IssueBrief, Round2PromptInput, TailEntry,
};
use crate::stance::{apply_stance_shift, IssueOptionSpec};
use crate::state::{ConvoPhase, ConvoState, ConvoStatus, GameStatus, CHAIR};
use rusqlite::{Connection, Transaction};
use serde_json::json;

const INTERRUPT_TEXT: &str = "The Chair interrupts. Please move to final statements.";
const CONCLUDED_TEXT: &str = "Private negotiations concluded. Preparing to move to Round 3.";

pub fn round2_ready(tx: &Transaction, game_id: &str) -> Result<AdvanceResult, EngineError> {
    let (_, mut state, status) = load_game(tx, game_id)?;
    if status != GameStatus::Round2Setup {
        return Err(precondition("ROUND_2_READY only allowed from ROUND_2_SETUP"));
    }
    let entry = db::insert_transcript_entry(
        tx,
        NewTranscriptEntry {
            game_id,
            role_id: CHAIR,
            phase: "ROUND_2",
            content: "Entering private negotiations (Round 2 setup).",
            visible_to_human: true,
            round: Some(2),
            issue_id: None,
            metadata: None,
        },
    )?;
    state.round2.active_convo_index = None;
    persist_state(tx, game_id, GameStatus::Round2SelectConvo1, &mut state, Some(&entry.id))?;
    Ok(AdvanceResult { game_id: game_id.to_string(), state })
}

pub fn convo_selected(
    tx: &Transaction,
    game_id: &str,
    index: u8,
    partner: &str,
) -> Result<AdvanceResult, EngineError> {
    let (_, mut state, status) = load_game(tx, game_id)?;
    let expected = if index == 1 {
        GameStatus::Round2SelectConvo1
    } else {
        GameStatus::Round2SelectConvo2
    };
    if status != expected {
        return Err(precondition(format!(
            "CONVO_{}_SELECTED only allowed from {}",
            index,
            expected.as_str()
        )));
    }
    if Some(partner) == state.human_role_id.as_deref() || partner == CHAIR {
        return Err(precondition("Invalid partner_role_id"));
    }
    if index == 2 {
        let convo1_partner = state.round2.convo1.as_ref().map(|c| c.partner_role.clone());
        if convo1_partner.as_deref() == Some(partner) {
            return Err(precondition("partner_role_id already used"));
        }
    }
    if !state.roles.contains_key(partner) {
        return Err(precondition("Unknown partner_role_id"));
    }

    state.round2.active_convo_index = Some(index);
    let convo = ConvoState::open(partner);
    if index == 1 {
        state.round2.convo1 = Some(convo);
    } else {
        state.round2.convo2 = Some(convo);
    }

    let content = if index == 1 {
        format!("Private negotiation started with {}.", partner)
    } else {
        format!("Second private negotiation started with {}.", partner)
    };
    let entry = db::insert_transcript_entry(
        tx,
        NewTranscriptEntry {
            game_id,
            role_id: CHAIR,
            phase: "ROUND_2",
            content: &content,
            visible_to_human: true,
            round: Some(2),
            issue_id: None,
            metadata: Some(json!({"partner": partner})),
        },
    )?;
    persist_state(tx, game_id, GameStatus::Round2ConversationActive, &mut state, Some(&entry.id))?;
    Ok(AdvanceResult { game_id: game_id.to_string(), state })
}

fn active_convo<'a>(
    state: &'a crate::state::GameState,
) -> Result<(u8, String, &'a ConvoState), EngineError> {
    let index = state.round2.active_convo_index.unwrap_or(1);
    let convo_key = format!("convo{}", index);
    let convo = if index == 1 {
        state.round2.convo1.as_ref()
    } else {
        state.round2.convo2.as_ref()
    };
    match convo {
        Some(convo) if convo.status != ConvoStatus::Closed => Ok((index, convo_key, convo)),
        _ => Err(precondition("Conversation is closed")),
    }
}

fn check_human_turn_available(convo: &ConvoState) -> Result<(), EngineError> {
    if convo.post_interrupt {
        if convo.final_human_sent {
            return Err(precondition("No human turns remaining"));
        }
    } else if convo.human_turns_used >= 5 {
        return Err(precondition("No human turns remaining"));
    }
    Ok(())
}

struct PreparedMessage {
    index: u8,
    convo_key: String,
    partner: String,
    human_role: String,
    human_turns: u32,
    ai_turns: u32,
    post_interrupt: bool,
    built: BuiltPrompt,
    spec: IssueOptionSpec,
}

fn prepare_message(
    conn: &Connection,
    game_id: &str,
    content: &str,
) -> Result<PreparedMessage, EngineError> {
    let (game, state, status) = load_game(conn, game_id)?;
    if status != GameStatus::Round2ConversationActive {
        return Err(precondition("CONVO_MESSAGE only allowed in ROUND_2_CONVERSATION_ACTIVE"));
    }
    let (index, convo_key, convo) = active_convo(&state)?;
    let human_role = state
        .human_role_id
        .clone()
        .ok_or_else(|| precondition("Conversation not initialized"))?;
    check_human_turn_available(convo)?;

    let partner = convo.partner_role.clone();
    let partner_initial_stances = state
        .round1
        .openings
        .get(&partner)
        .and_then(|o| o.initial_stances.clone());
    let human_opening_text = state
        .round1
        .openings
        .get(&human_role)
        .map(|o| o.text.clone());

    let transcript_tail: Vec<TailEntry> = db::fetch_transcript(conn, &game.id, None)?
        .into_iter()
        .filter(|entry| {
            entry.round == Some(2)
                && entry
                    .metadata
                    .as_ref()
                    .and_then(|m| m.get("convo"))
                    .and_then(|v| v.as_str())
                    == Some(convo_key.as_str())
                && entry
                    .metadata
                    .as_ref()
                    .and_then(|m| m.get("sender"))
                    .is_some()
        })
        .map(|entry| TailEntry { role_id: entry.role_id, content: entry.content })
        .collect();

    let issue_defs = db::fetch_issue_definitions(conn)?;
    let spec = issue_option_spec(&issue_defs);
    let issues: Vec<IssueBrief> = issue_defs
        .into_iter()
        .map(|issue| IssueBrief {
            issue_id: issue.id,
            title: issue.title,
            options: issue
                .options
                .into_iter()
                .map(|o| (o.option_id, o.label))
                .collect(),
        })
        .collect();

    let built = build_round2_conversation_prompt(&Round2PromptInput {
        game_id: &game.id,
        status: status.as_str(),
        human_content: content,
        partner_role: &partner,
        human_role: &human_role,
        convo_key: &convo_key,
        human_turns: convo.human_turns_used,
        ai_turns: convo.ai_turns_used,
        partner_initial_stances: partner_initial_stances.as_ref(),
        human_opening_text: human_opening_text.as_deref(),
        transcript_tail: &transcript_tail,
        issues: &issues,
    });

    Ok(PreparedMessage {
        index,
        convo_key,
        partner,
        human_role,
        human_turns: convo.human_turns_used,
        ai_turns: convo.ai_turns_used,
        post_interrupt: convo.post_interrupt,
        built,
        spec,
    })
}

fn apply_message(
    tx: &Transaction,
    ctx: &EngineContext,
    game_id: &str,
    content: &str,
    prep: &PreparedMessage,
    request: &LlmRequest,
    response: &LlmResponse,
) -> Result<AdvanceResult, EngineError> {
    let (_, mut state, status) = load_game(tx, game_id)?;
    if status != GameStatus::Round2ConversationActive {
        return Err(precondition("Game advanced concurrently; retry"));
    }
    {
        let (index, _, convo) = active_convo(&state)?;
        if index != prep.index
            || convo.partner_role != prep.partner
            || convo.human_turns_used != prep.human_turns
            || convo.ai_turns_used != prep.ai_turns
            || convo.post_interrupt != prep.post_interrupt
        {
            return Err(precondition("Game advanced concurrently; retry"));
        }
    }

    // Human row first, with its own checkpoint.
    let human_entry = db::insert_transcript_entry(
        tx,
        NewTranscriptEntry {
            game_id,
            role_id: &prep.human_role,
            phase: "ROUND_2",
            content,
            visible_to_human: true,
            round: Some(2),
            issue_id: None,
            metadata: Some(json!({
                "partner": prep.partner,
                "sender": "human",
                "index": prep.human_turns * 2,
                "convo": prep.convo_key,
            })),
        },
    )?;

    // The exchange shifts both participants once, keyed off the human text.
    for role in [prep.human_role.as_str(), prep.partner.as_str()] {
        let snapshot = state.stances.get(role).cloned().unwrap_or_default();
        let (updated, reasons) = apply_stance_shift(role, 2, None, content, &snapshot, &prep.spec);
        state.stances.insert(role.to_string(), updated);
        state.round2.stance_log.extend(reasons);
    }

    {
        let convo = convo_mut(&mut state, prep.index);
        convo.human_turns_used += 1;
        if convo.post_interrupt {
            convo.final_human_sent = true;
        }
    }
    persist_state(
        tx,
        game_id,
        GameStatus::Round2ConversationActive,
        &mut state,
        Some(&human_entry.id),
    )?;

    let ai_entry = db::insert_transcript_entry(
        tx,
        NewTranscriptEntry {
            game_id,
            role_id: &prep.partner,
            phase: "ROUND_2",
            content: &response.assistant_text,
            visible_to_human: true,
            round: Some(2),
            issue_id: None,
            metadata: Some(json!({
                "partner": prep.human_role,
                "sender": "ai",
                "index": prep.ai_turns * 2 + 1,
                "convo": prep.convo_key,
            })),
        },
    )?;
    db::insert_llm_trace(
        tx,
        NewLlmTrace {
            game_id,
            role_id: &prep.partner,
            status: GameStatus::Round2ConversationActive.as_str(),
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

    let mut interrupted = false;
    let mut closed = false;
    {
        let convo = convo_mut(&mut state, prep.index);
        convo.ai_turns_used += 1;
        if convo.post_interrupt {
            convo.final_ai_sent = true;
        }
        if !convo.post_interrupt && convo.human_turns_used >= 5 && convo.ai_turns_used >= 5 {
            convo.post_interrupt = true;
            convo.phase = ConvoPhase::PostInterrupt;
            interrupted = true;
        }
        if convo.post_interrupt && convo.final_human_sent && convo.final_ai_sent {
            convo.status = ConvoStatus::Closed;
            convo.phase = ConvoPhase::Closed;
            closed = true;
        }
    }
    persist_state(tx, game_id, GameStatus::Round2ConversationActive, &mut state, Some(&ai_entry.id))?;

    if interrupted {
        let turns = {
            let convo = convo_mut(&mut state, prep.index);
            convo.human_turns_used + convo.ai_turns_used
        };
        let entry = db::insert_transcript_entry(
            tx,
            NewTranscriptEntry {
                game_id,
                role_id: CHAIR,
                phase: "ROUND_2",
                content: INTERRUPT_TEXT,
                visible_to_human: true,
                round: Some(2),
                issue_id: None,
                metadata: Some(json!({
                    "interrupt": true,
                    "convo": prep.convo_key,
                    "index": turns,
                })),
            },
        )?;
        persist_state(
            tx,
            game_id,
            GameStatus::Round2ConversationActive,
            &mut state,
            Some(&entry.id),
        )?;
    }

    if closed {
        state.round2.active_convo_index = None;
        let next_status = if prep.index == 1 {
            GameStatus::Round2SelectConvo2
        } else {
            GameStatus::Round2WrapUp
        };
        // The concluded line lands after the final AI reply, never before.
        let turns = {
            let convo = convo_mut(&mut state, prep.index);
            convo.human_turns_used + convo.ai_turns_used
        };
        let entry = db::insert_transcript_entry(
            tx,
            NewTranscriptEntry {
                game_id,
                role_id: CHAIR,
                phase: "ROUND_2",
                content: CONCLUDED_TEXT,
                visible_to_human: true,
                round: Some(2),
                issue_id: None,
                metadata: Some(json!({
                    "convo": prep.convo_key,
                    "index": turns + 1,
                    "concluded": true,
                })),
            },
        )?;
        persist_state(tx, game_id, next_status, &mut state, Some(&entry.id))?;
    }

    Ok(AdvanceResult { game_id: game_id.to_string(), state })
}

fn convo_mut(state: &mut crate::state::GameState, index: u8) -> &mut ConvoState {
    if index == 1 {
        state.round2.convo1.as_mut().expect("active conversation checked earlier")
    } else {
        state.round2.convo2.as_mut().expect("active conversation checked earlier")
    }
}

pub async fn conversation_message(
    ctx: &EngineContext,
    game_id: &str,
    content: &str,
) -> Result<AdvanceResult, EngineError> {
    let prep = ctx.db.read(|conn| prepare_message(conn, game_id, content))?;
    let request = LlmRequest {
        game_id: game_id.to_string(),
        role_id: prep.partner.clone(),
        status: GameStatus::Round2ConversationActive.as_str().to_string(),
        prompt: prep.built.prompt.clone(),
        prompt_version: prep.built.prompt_version.to_string(),
        conversation_context: prep.built.request_payload.get("context").cloned(),
        request_payload: prep.built.request_payload.clone(),
    };

    match ctx.llm.generate(&request).await {
        Err(err) => {
            record_failed_trace(
                ctx,
                game_id,
                &prep.partner,
                GameStatus::Round2ConversationActive.as_str(),
                &request,
                &err,
            )?;
            Err(EngineError::External(err.to_string()))
        }
        Ok(response) => ctx
            .db
            .transaction(|tx| apply_message(tx, ctx, game_id, content, &prep, &request, &response)),
    }
}

pub fn convo_end_early(tx: &Transaction, game_id: &str) -> Result<AdvanceResult, EngineError> {
    let (_, mut state, status) = load_game(tx, game_id)?;
    if status != GameStatus::Round2ConversationActive {
        return Err(precondition("CONVO_END_EARLY only allowed in ROUND_2_CONVERSATION_ACTIVE"));
    }
    let (index, _, convo) = active_convo(&state)?;
    if state.human_role_id.is_none() {
        return Err(precondition("Conversation not initialized"));
    }
    // Legal only while the human still holds a turn, including the single
    // post-interrupt turn.
    check_human_turn_available(convo)?;

    {
        let convo = convo_mut(&mut state, index);
        convo.status = ConvoStatus::Closed;
        convo.phase = ConvoPhase::Closed;
    }
    state.round2.active_convo_index = None;
    let next_status = if index == 1 {
        GameStatus::Round2SelectConvo2
    } else {
        GameStatus::Round2WrapUp
    };
    persist_state_no_checkpoint(tx, game_id, next_status, &mut state)?;
    Ok(AdvanceResult { game_id: game_id.to_string(), state })
}

pub fn convo2_skipped(tx: &Transaction, game_id: &str) -> Result<AdvanceResult, EngineError> {
    let (_, mut state, status) = load_game(tx, game_id)?;
    if status != GameStatus::Round2SelectConvo2 {
        return Err(precondition("CONVO_2_SKIPPED only allowed from ROUND_2_SELECT_CONVO_2"));
    }
    state.round2.active_convo_index = None;
    let entry = db::insert_transcript_entry(
        tx,
        NewTranscriptEntry {
            game_id,
            role_id: CHAIR,
            phase: "ROUND_2",
            content: "Second private negotiation skipped.",
            visible_to_human: true,
            round: Some(2),
            issue_id: None,
            metadata: None,
        },
    )?;
    persist_state(tx, game_id, GameStatus::Round2WrapUp, &mut state, Some(&entry.id))?;
    Ok(AdvanceResult { game_id: game_id.to_string(), state })
}

pub fn wrap_ready(tx: &Transaction, game_id: &str) -> Result<AdvanceResult, EngineError> {
    let (_, mut state, status) = load_game(tx, game_id)?;
    if status != GameStatus::Round2WrapUp {
        return Err(precondition("ROUND_2_WRAP_READY only allowed from ROUND_2_WRAP_UP"));
    }
    let entry = db::insert_transcript_entry(
        tx,
        NewTranscriptEntry {
            game_id,
            role_id: CHAIR,
            phase: "ROUND_2",
            content: "Round 2 complete. Moving to Round 3 setup.",
            visible_to_human: true,
            round: Some(2),
            issue_id: None,
            metadata: None,
        },
    )?;
    persist_state(tx, game_id, GameStatus::Round3Setup, &mut state, Some(&entry.id))?;
    Ok(AdvanceResult { game_id: game_id.to_string(), state })
}
